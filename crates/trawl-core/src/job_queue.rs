//! Priority job queue over a [`SharedStore`].
//!
//! Every job is persisted as a JSON document keyed by id. Pending ids wait
//! in one FIFO list per priority; workers claim them with a single atomic
//! `blpop` across the lists in urgent → high → normal → low order, so two
//! workers can never receive the same id. Claimed jobs are recorded in a
//! lock map (job id → worker id) and workers prove liveness through a
//! heartbeat map. The queue itself is tenant-agnostic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{JobFilter, JobResult, JobStatus, Priority, QueueStats, ScrapingJob};
use crate::store::SharedStore;

pub const DEFAULT_KEY_PREFIX: &str = "trawl";

/// Store key names, all under a common prefix.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn jobs(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    pub fn queue(&self, priority: Priority) -> String {
        format!("{}:queue:{}", self.prefix, priority.as_str())
    }

    pub fn status(&self) -> String {
        format!("{}:status", self.prefix)
    }

    pub fn results(&self) -> String {
        format!("{}:results", self.prefix)
    }

    pub fn heartbeats(&self) -> String {
        format!("{}:heartbeats", self.prefix)
    }

    pub fn locks(&self) -> String {
        format!("{}:locks", self.prefix)
    }

    pub fn workers(&self) -> String {
        format!("{}:workers", self.prefix)
    }

    /// Priority list keys in the order dequeue checks them.
    pub fn dequeue_order(&self) -> Vec<String> {
        Priority::DEQUEUE_ORDER
            .iter()
            .map(|p| self.queue(*p))
            .collect()
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

/// Partial progress reported by a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressUpdate {
    pub percentage: f64,
    pub pages_processed: u32,
    pub items_found: u64,
}

/// Outcome of [`JobQueue::cleanup_expired_locks`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub workers_removed: u64,
    pub jobs_requeued: u64,
}

/// Durable priority queue shared by producers and workers.
#[derive(Clone)]
pub struct JobQueue<S> {
    store: S,
    keys: QueueKeys,
}

impl<S: SharedStore> JobQueue<S> {
    pub fn new(store: S) -> Self {
        Self::with_keys(store, QueueKeys::default())
    }

    pub fn with_keys(store: S, keys: QueueKeys) -> Self {
        Self { store, keys }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // -- record helpers --

    async fn save_job(&self, job: &ScrapingJob) -> Result<(), AppError> {
        let id = job.id.to_string();
        let doc = serde_json::to_string(job)?;
        self.store.hset(&self.keys.jobs(), &id, &doc).await?;
        self.store
            .hset(&self.keys.status(), &id, job.status.as_str())
            .await
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Option<ScrapingJob>, AppError> {
        let doc = self
            .store
            .hget(&self.keys.jobs(), &job_id.to_string())
            .await?;
        doc.map(|d| serde_json::from_str(&d).map_err(AppError::from))
            .transpose()
    }

    async fn require_job(&self, job_id: Uuid) -> Result<ScrapingJob, AppError> {
        self.load_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))
    }

    async fn load_all(&self) -> Result<Vec<ScrapingJob>, AppError> {
        let entries = self.store.hgetall(&self.keys.jobs()).await?;
        let mut jobs = Vec::with_capacity(entries.len());
        for (id, doc) in entries {
            match serde_json::from_str::<ScrapingJob>(&doc) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!(job_id = %id, error = %e, "Skipping unreadable job record"),
            }
        }
        Ok(jobs)
    }

    // -- producer side --

    /// Persist the job and append its id to the tail of its priority list.
    pub async fn enqueue(&self, job: &ScrapingJob) -> Result<(), AppError> {
        self.save_job(job).await?;
        self.store
            .rpush(&self.keys.queue(job.priority), &job.id.to_string())
            .await?;
        tracing::debug!(job_id = %job.id, priority = %job.priority, "Job enqueued");
        Ok(())
    }

    // -- worker side --

    /// Claim the next job for `worker_id`, waiting up to `timeout`.
    ///
    /// Returns `None` when nothing became available in time; callers loop.
    /// Ids whose record is missing or no longer queued (a cancel raced the
    /// pop) are discarded and the wait continues.
    pub async fn dequeue(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<ScrapingJob>, AppError> {
        let order = self.keys.dequeue_order();
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some((_, raw_id)) = self.store.blpop(&order, remaining).await? else {
                return Ok(None);
            };

            let Ok(job_id) = Uuid::parse_str(&raw_id) else {
                tracing::warn!(id = %raw_id, "Discarding malformed id from priority list");
                continue;
            };
            let job = match self.load_job(job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tracing::warn!(%job_id, "Discarding id with no job record");
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        %job_id,
                        %worker_id,
                        error = %e,
                        "Popped job could not be loaded and is on no list; requeue it by hand"
                    );
                    return Err(e);
                }
            };
            if !job.status.is_queued() {
                tracing::debug!(%job_id, status = %job.status, "Discarding stale id");
                continue;
            }

            match self.claim(job.clone(), worker_id).await {
                Ok(claimed) => {
                    tracing::debug!(%job_id, %worker_id, priority = %claimed.priority, "Job dequeued");
                    return Ok(Some(claimed));
                }
                Err(e) => {
                    self.restore_popped(&job, worker_id).await;
                    return Err(e);
                }
            }
        }
    }

    async fn claim(&self, mut job: ScrapingJob, worker_id: &str) -> Result<ScrapingJob, AppError> {
        // Register liveness before taking the lock so every lock holder
        // is always a known worker.
        self.heartbeat(worker_id).await?;

        let now = Utc::now();
        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.completed_at = None;
        job.updated_at = now;
        self.save_job(&job).await?;
        self.store
            .hset(&self.keys.locks(), &job.id.to_string(), worker_id)
            .await?;
        Ok(job)
    }

    /// Put a popped job whose claim failed back at the tail of its list,
    /// in the state it was popped in.
    async fn restore_popped(&self, job: &ScrapingJob, worker_id: &str) {
        let id = job.id.to_string();
        let restored = async {
            self.save_job(job).await?;
            self.store.hdel(&self.keys.locks(), &id).await?;
            self.store.rpush(&self.keys.queue(job.priority), &id).await
        }
        .await;

        match restored {
            Ok(()) => tracing::warn!(job_id = %job.id, %worker_id, "Claim failed; job returned to its queue"),
            Err(e) => tracing::error!(
                job_id = %job.id,
                %worker_id,
                error = %e,
                "Claim failed and the job could not be returned to its queue; requeue it by hand"
            ),
        }
    }

    /// Mark `worker_id` live and stamp its heartbeat.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<(), AppError> {
        self.store.sadd(&self.keys.workers(), worker_id).await?;
        self.store
            .hset(
                &self.keys.heartbeats(),
                worker_id,
                &Utc::now().to_rfc3339(),
            )
            .await
    }

    /// Drop `worker_id` from the live set and heartbeat map.
    pub async fn remove_worker(&self, worker_id: &str) -> Result<(), AppError> {
        self.store.srem(&self.keys.workers(), worker_id).await?;
        self.store.hdel(&self.keys.heartbeats(), worker_id).await?;
        Ok(())
    }

    pub async fn live_workers(&self) -> Result<Vec<String>, AppError> {
        self.store.smembers(&self.keys.workers()).await
    }

    /// Worker currently holding the job's lock, if any.
    pub async fn lock_holder(&self, job_id: Uuid) -> Result<Option<String>, AppError> {
        self.store
            .hget(&self.keys.locks(), &job_id.to_string())
            .await
    }

    /// Set a job's status, optionally recording an error and progress.
    ///
    /// Terminal statuses release the job's lock.
    pub async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
        progress: Option<f64>,
    ) -> Result<ScrapingJob, AppError> {
        let mut job = self.require_job(job_id).await?;
        let now = Utc::now();

        job.status = status;
        job.updated_at = now;
        if let Some(error) = error {
            job.last_error = Some(error.to_string());
            job.error_count += 1;
        }
        if let Some(progress) = progress {
            job.set_progress(progress);
        }

        match status {
            JobStatus::Running => {
                job.started_at.get_or_insert(now);
            }
            JobStatus::Completed => {
                job.set_progress(100.0);
                job.completed_at = Some(now);
            }
            JobStatus::Failed | JobStatus::Cancelled => {
                job.completed_at = Some(now);
            }
            JobStatus::Pending | JobStatus::Retrying => {}
        }

        if status.is_terminal() {
            job.worker_id = None;
        }
        self.save_job(&job).await?;
        if status.is_terminal() {
            self.store
                .hdel(&self.keys.locks(), &job_id.to_string())
                .await?;
        }

        tracing::debug!(%job_id, %status, "Job status updated");
        Ok(job)
    }

    /// Record partial progress without touching the status.
    pub async fn update_progress(
        &self,
        job_id: Uuid,
        update: ProgressUpdate,
    ) -> Result<ScrapingJob, AppError> {
        let mut job = self.require_job(job_id).await?;
        job.set_progress(update.percentage);
        job.pages_processed = update.pages_processed;
        job.items_found = update.items_found;
        job.updated_at = Utc::now();
        self.save_job(&job).await?;
        Ok(job)
    }

    /// Store the final result, then mark the job completed.
    pub async fn complete_job(&self, result: &JobResult) -> Result<ScrapingJob, AppError> {
        self.save_job_result(result).await?;
        self.update_progress(
            result.job_id,
            ProgressUpdate {
                percentage: 100.0,
                pages_processed: result.pages_processed,
                items_found: result.items_scraped,
            },
        )
        .await?;
        self.update_job_status(result.job_id, JobStatus::Completed, None, None)
            .await
    }

    /// Current status from the status index, without loading the document.
    pub async fn get_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, AppError> {
        let raw = self
            .store
            .hget(&self.keys.status(), &job_id.to_string())
            .await?;
        raw.map(|s| s.parse().map_err(AppError::Store)).transpose()
    }

    // -- reads --

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<ScrapingJob>, AppError> {
        self.load_job(job_id).await
    }

    pub async fn save_job_result(&self, result: &JobResult) -> Result<(), AppError> {
        let doc = serde_json::to_string(result)?;
        self.store
            .hset(&self.keys.results(), &result.job_id.to_string(), &doc)
            .await
    }

    pub async fn get_job_result(&self, job_id: Uuid) -> Result<Option<JobResult>, AppError> {
        let doc = self
            .store
            .hget(&self.keys.results(), &job_id.to_string())
            .await?;
        doc.map(|d| serde_json::from_str(&d).map_err(AppError::from))
            .transpose()
    }

    /// Filter the full job set in memory, newest first.
    ///
    /// There is no secondary index: cost is linear in the number of jobs.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScrapingJob>, AppError> {
        let mut jobs: Vec<_> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|j| filter.matches(j))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    // -- control --

    /// Remove the job from every priority list and force it to `cancelled`.
    ///
    /// Returns false if the job does not exist. A worker already running
    /// the job is not interrupted.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool, AppError> {
        let id = job_id.to_string();
        for priority in Priority::DEQUEUE_ORDER {
            self.store.lrem(&self.keys.queue(priority), &id).await?;
        }
        if self.load_job(job_id).await?.is_none() {
            return Ok(false);
        }
        self.update_job_status(job_id, JobStatus::Cancelled, None, None)
            .await?;
        tracing::info!(%job_id, "Job cancelled");
        Ok(true)
    }

    /// Put a failed job back on its priority list.
    ///
    /// Returns false unless the job exists and [`ScrapingJob::can_retry`].
    pub async fn retry_job(&self, job_id: Uuid) -> Result<bool, AppError> {
        let Some(mut job) = self.load_job(job_id).await? else {
            return Ok(false);
        };
        if !job.can_retry() {
            return Ok(false);
        }

        job.current_retry += 1;
        job.status = JobStatus::Retrying;
        job.worker_id = None;
        job.completed_at = None;
        job.updated_at = Utc::now();
        self.save_job(&job).await?;
        self.store
            .rpush(&self.keys.queue(job.priority), &job.id.to_string())
            .await?;

        tracing::info!(
            %job_id,
            attempt = job.current_retry,
            max_retries = job.max_retries,
            "Job requeued for retry"
        );
        Ok(true)
    }

    /// Return a running job to `pending` without consuming a retry.
    async fn requeue_orphan(&self, mut job: ScrapingJob) -> Result<(), AppError> {
        let id = job.id.to_string();
        job.status = JobStatus::Pending;
        job.worker_id = None;
        job.started_at = None;
        job.updated_at = Utc::now();
        self.save_job(&job).await?;
        self.store.hdel(&self.keys.locks(), &id).await?;
        self.store.rpush(&self.keys.queue(job.priority), &id).await
    }

    async fn heartbeat_fresh(&self, worker_id: &str, cutoff: DateTime<Utc>) -> Result<bool, AppError> {
        let beat = self.store.hget(&self.keys.heartbeats(), worker_id).await?;
        Ok(beat.as_deref().and_then(parse_heartbeat).is_some_and(|t| t >= cutoff))
    }

    /// Reclaim workers whose heartbeat is older than `timeout_minutes`.
    ///
    /// Dead workers leave the live set and lose their heartbeat. Jobs whose
    /// lock holder is no longer live and that are still `running` are put
    /// back on their priority list; other stale locks are dropped.
    ///
    /// A worker is only reclaimed after its heartbeat has been read again
    /// and found stale, so one that registers or claims a job while the
    /// sweep runs is left alone.
    pub async fn cleanup_expired_locks(
        &self,
        timeout_minutes: u64,
    ) -> Result<CleanupReport, AppError> {
        let cutoff = Utc::now()
            .checked_sub_signed(lock_age(timeout_minutes)?)
            .ok_or_else(|| {
                AppError::Config(format!("Lock timeout of {timeout_minutes} minutes is out of range"))
            })?;

        // Locks first: a lock taken after this read is never judged
        // against the older heartbeat snapshot below.
        let locks = self.store.hgetall(&self.keys.locks()).await?;
        let beats: HashMap<String, Option<DateTime<Utc>>> = self
            .store
            .hgetall(&self.keys.heartbeats())
            .await?
            .into_iter()
            .map(|(worker, ts)| (worker, parse_heartbeat(&ts)))
            .collect();

        let mut known: HashSet<String> = self.live_workers().await?.into_iter().collect();
        known.extend(beats.keys().cloned());

        let mut report = CleanupReport::default();
        let mut live = HashSet::new();
        for worker in known {
            let fresh = beats
                .get(&worker)
                .copied()
                .flatten()
                .is_some_and(|t| t >= cutoff);
            if fresh || self.heartbeat_fresh(&worker, cutoff).await? {
                live.insert(worker);
            } else {
                self.remove_worker(&worker).await?;
                report.workers_removed += 1;
                tracing::warn!(%worker, "Reclaimed expired worker");
            }
        }

        for (raw_id, holder) in locks {
            if live.contains(&holder) || self.heartbeat_fresh(&holder, cutoff).await? {
                continue;
            }
            // The lock may have been released or taken over since the read.
            let current = self.store.hget(&self.keys.locks(), &raw_id).await?;
            if current.as_deref() != Some(holder.as_str()) {
                continue;
            }
            let job = match Uuid::parse_str(&raw_id) {
                Ok(job_id) => self.load_job(job_id).await?,
                Err(_) => None,
            };
            match job {
                Some(job) if job.status == JobStatus::Running => {
                    tracing::warn!(job_id = %job.id, %holder, "Requeuing orphaned job");
                    self.requeue_orphan(job).await?;
                    report.jobs_requeued += 1;
                }
                _ => {
                    self.store.hdel(&self.keys.locks(), &raw_id).await?;
                }
            }
        }

        Ok(report)
    }

    // -- statistics --

    /// Global statistics over every job. Linear in the number of jobs.
    pub async fn get_queue_stats(&self) -> Result<QueueStats, AppError> {
        let jobs = self.load_all().await?;
        let mut depth_by_priority = BTreeMap::new();
        for priority in Priority::DEQUEUE_ORDER {
            let len = self.store.llen(&self.keys.queue(priority)).await?;
            depth_by_priority.insert(priority, len);
        }
        let active = self.live_workers().await?.len() as u64;
        Ok(compute_stats(&jobs, depth_by_priority, active))
    }

    /// Statistics restricted to one tenant's jobs.
    ///
    /// Queue depth counts the tenant's queued jobs rather than list lengths.
    pub async fn get_tenant_stats(&self, tenant_id: &str) -> Result<QueueStats, AppError> {
        let jobs: Vec<_> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|j| j.tenant_id == tenant_id)
            .collect();
        let mut depth_by_priority: BTreeMap<Priority, u64> =
            Priority::DEQUEUE_ORDER.iter().map(|p| (*p, 0)).collect();
        for job in jobs.iter().filter(|j| j.status.is_queued()) {
            *depth_by_priority.entry(job.priority).or_default() += 1;
        }
        let active = self.live_workers().await?.len() as u64;
        Ok(compute_stats(&jobs, depth_by_priority, active))
    }
}

fn parse_heartbeat(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Heartbeat age after which a worker counts as dead.
///
/// Zero would reclaim every live worker; values that do not fit a
/// [`TimeDelta`] are rejected rather than wrapped.
pub fn lock_age(timeout_minutes: u64) -> Result<TimeDelta, AppError> {
    if timeout_minutes == 0 {
        return Err(AppError::Config("Lock timeout must be at least 1 minute".into()));
    }
    i64::try_from(timeout_minutes)
        .ok()
        .and_then(TimeDelta::try_minutes)
        .ok_or_else(|| {
            AppError::Config(format!("Lock timeout of {timeout_minutes} minutes is out of range"))
        })
}

fn compute_stats(
    jobs: &[ScrapingJob],
    depth_by_priority: BTreeMap<Priority, u64>,
    active_workers: u64,
) -> QueueStats {
    let mut by_status: BTreeMap<JobStatus, u64> =
        JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
    let mut total_secs = 0.0;
    let mut timed = 0u64;

    for job in jobs {
        *by_status.entry(job.status).or_default() += 1;
        if job.status == JobStatus::Completed {
            if let (Some(start), Some(end)) = (job.started_at, job.completed_at) {
                total_secs += (end - start).num_milliseconds().max(0) as f64 / 1000.0;
                timed += 1;
            }
        }
    }

    let completed = by_status[&JobStatus::Completed];
    let failed = by_status[&JobStatus::Failed];
    QueueStats {
        total_jobs: jobs.len() as u64,
        by_status,
        queue_depth: depth_by_priority.values().sum(),
        depth_by_priority,
        active_workers,
        average_duration_secs: (timed > 0).then(|| total_secs / timed as f64),
        success_rate: (completed + failed > 0)
            .then(|| completed as f64 / (completed + failed) as f64),
    }
}
