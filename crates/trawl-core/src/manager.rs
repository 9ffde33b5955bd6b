//! Caller-facing orchestration over the [`JobQueue`].
//!
//! Ownership checks live here, not in the queue: cancel and retry verify
//! that the requesting user/tenant owns the job before delegating.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{
    CreateJobRequest, JobFilter, JobResult, JobStatus, QueueStats, ScrapingJob,
};
use crate::job_queue::{CleanupReport, JobQueue, ProgressUpdate};
use crate::store::SharedStore;
use crate::worker::{
    DispatchLoop, JobCallback, TracingWorkerReporter, WorkerConfig, WorkerReporter,
};

struct WorkerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct JobManager<S> {
    queue: JobQueue<S>,
    config: WorkerConfig,
    reporter: Arc<dyn WorkerReporter>,
    workers: Arc<Mutex<HashMap<String, WorkerHandle>>>,
    shutdown: CancellationToken,
}

impl<S: SharedStore + 'static> JobManager<S> {
    pub fn new(queue: JobQueue<S>, config: WorkerConfig) -> Self {
        Self {
            queue,
            config,
            reporter: Arc::new(TracingWorkerReporter),
            workers: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn WorkerReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn queue(&self) -> &JobQueue<S> {
        &self.queue
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- job lifecycle --

    /// Build a pending job from `request` and enqueue it.
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<ScrapingJob, AppError> {
        if request.target.site.trim().is_empty() {
            return Err(AppError::Validation("target site must not be empty".into()));
        }
        if request.title.trim().is_empty() {
            return Err(AppError::Validation("job title must not be empty".into()));
        }

        let job = ScrapingJob::from_request(request);
        self.queue.enqueue(&job).await?;
        tracing::info!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            site = %job.target.site,
            priority = %job.priority,
            "Job created"
        );
        Ok(job)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<ScrapingJob>, AppError> {
        self.queue.get_job(job_id).await
    }

    pub async fn get_job_result(&self, job_id: Uuid) -> Result<Option<JobResult>, AppError> {
        self.queue.get_job_result(job_id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScrapingJob>, AppError> {
        self.queue.list_jobs(filter).await
    }

    async fn owned_job(
        &self,
        job_id: Uuid,
        user_id: &str,
        tenant_id: &str,
    ) -> Result<ScrapingJob, AppError> {
        let job = self
            .queue
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))?;
        if !job.is_owned_by(user_id, tenant_id) {
            return Err(AppError::Forbidden(format!(
                "job {job_id} is not owned by {user_id}/{tenant_id}"
            )));
        }
        Ok(job)
    }

    /// Cancel a pending, retrying, or running job owned by the caller.
    ///
    /// A running job's worker is not interrupted; it finishes its callback
    /// and its write-back is flagged as having raced the cancel.
    pub async fn cancel_job(
        &self,
        job_id: Uuid,
        user_id: &str,
        tenant_id: &str,
    ) -> Result<ScrapingJob, AppError> {
        let job = self.owned_job(job_id, user_id, tenant_id).await?;
        if !matches!(
            job.status,
            JobStatus::Pending | JobStatus::Running | JobStatus::Retrying
        ) {
            return Err(AppError::InvalidState(format!(
                "cannot cancel job {job_id} in status {}",
                job.status
            )));
        }

        self.queue.cancel_job(job_id).await?;
        self.queue
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))
    }

    /// Requeue a failed job owned by the caller while retries remain.
    pub async fn retry_job(
        &self,
        job_id: Uuid,
        user_id: &str,
        tenant_id: &str,
    ) -> Result<ScrapingJob, AppError> {
        let job = self.owned_job(job_id, user_id, tenant_id).await?;
        if !job.can_retry() {
            return Err(AppError::InvalidState(format!(
                "job {job_id} cannot be retried (status {}, retry {}/{})",
                job.status, job.current_retry, job.max_retries
            )));
        }
        if !self.queue.retry_job(job_id).await? {
            return Err(AppError::InvalidState(format!(
                "job {job_id} changed state before it could be retried"
            )));
        }
        self.queue
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))
    }

    /// Report partial progress from inside a worker callback.
    pub async fn update_job_progress(
        &self,
        job_id: Uuid,
        percentage: f64,
        pages_processed: u32,
        items_found: u64,
    ) -> Result<ScrapingJob, AppError> {
        self.queue
            .update_progress(
                job_id,
                ProgressUpdate {
                    percentage,
                    pages_processed,
                    items_found,
                },
            )
            .await
    }

    /// Store a final result and mark its job completed.
    pub async fn complete_job(&self, result: &JobResult) -> Result<ScrapingJob, AppError> {
        self.queue.complete_job(result).await
    }

    /// Global statistics, or one tenant's when `tenant_id` is given.
    pub async fn get_stats(&self, tenant_id: Option<&str>) -> Result<QueueStats, AppError> {
        match tenant_id {
            Some(tenant) => self.queue.get_tenant_stats(tenant).await,
            None => self.queue.get_queue_stats().await,
        }
    }

    pub async fn cleanup_expired_locks(
        &self,
        timeout_minutes: u64,
    ) -> Result<CleanupReport, AppError> {
        let report = self.queue.cleanup_expired_locks(timeout_minutes).await?;
        if report != CleanupReport::default() {
            tracing::info!(
                workers_removed = report.workers_removed,
                jobs_requeued = report.jobs_requeued,
                "Reclaimed expired workers"
            );
        }
        Ok(report)
    }

    // -- workers --

    /// Start a dispatch loop for `worker_id` that hands each job to `callback`.
    ///
    /// The callback's `Ok` result completes the job; an error or panic fails
    /// it. Fails if a loop with the same id is still running.
    pub fn register_worker<F, Fut>(&self, worker_id: &str, callback: F) -> Result<(), AppError>
    where
        F: Fn(ScrapingJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobResult, AppError>> + Send + 'static,
    {
        let mut workers = self.workers();
        if workers
            .get(worker_id)
            .is_some_and(|handle| !handle.task.is_finished())
        {
            return Err(AppError::InvalidState(format!(
                "worker {worker_id} is already registered"
            )));
        }

        let callback: JobCallback = Arc::new(move |job| callback(job).boxed());
        let cancel = self.shutdown.child_token();
        let dispatch = DispatchLoop {
            worker_id: worker_id.to_string(),
            queue: self.queue.clone(),
            callback,
            config: self.config.clone(),
            reporter: Arc::clone(&self.reporter),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(dispatch.run());

        workers.insert(worker_id.to_string(), WorkerHandle { cancel, task });
        Ok(())
    }

    /// Stop `worker_id`'s loop and wait for it to exit.
    ///
    /// A job in progress runs to completion first. Returns false if no such
    /// worker was registered here.
    pub async fn unregister_worker(&self, worker_id: &str) -> Result<bool, AppError> {
        let Some(handle) = self.workers().remove(worker_id) else {
            return Ok(false);
        };
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            tracing::error!(%worker_id, error = %e, "Worker loop ended abnormally");
        }
        self.queue.remove_worker(worker_id).await?;
        Ok(true)
    }

    /// Ids of the loops registered on this manager.
    pub fn registered_workers(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.workers().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every loop and wait for all of them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.workers().drain().collect();
        for (worker_id, handle) in handles {
            if let Err(e) = handle.task.await {
                tracing::error!(%worker_id, error = %e, "Worker loop ended abnormally");
            }
        }
        tracing::info!("Job manager shut down");
    }
}
