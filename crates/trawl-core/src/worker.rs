//! Per-worker dispatch loop.
//!
//! Each registered worker runs one loop: heartbeat, dequeue with a short
//! timeout, run the callback in its own task, write the outcome back. A
//! failing or panicking callback fails only its job; the loop ends only
//! when its cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{JobResult, JobStatus, ScrapingJob};
use crate::job_queue::JobQueue;
use crate::store::SharedStore;

/// Boxed job callback as stored by the manager.
pub type JobCallback =
    Arc<dyn Fn(ScrapingJob) -> BoxFuture<'static, Result<JobResult, AppError>> + Send + Sync>;

/// Tuning for dispatch loops.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long one dequeue waits before the loop polls again.
    pub dequeue_timeout: Duration,
    /// Heartbeat period while a job runs.
    pub heartbeat_interval: Duration,
    /// Pause after a store error before polling again.
    pub error_backoff: Duration,
    /// Schedule retries automatically for retryable failures.
    pub auto_retry: bool,
    /// Upper bound on an automatic retry's delay.
    pub max_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dequeue_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            error_backoff: Duration::from_secs(1),
            auto_retry: false,
            max_retry_delay: Duration::from_secs(3600),
        }
    }
}

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Polling {
        worker_id: &'a str,
    },
    JobClaimed {
        worker_id: &'a str,
        job: &'a ScrapingJob,
    },
    JobCompleted {
        worker_id: &'a str,
        job_id: Uuid,
        items: u64,
    },
    JobFailed {
        worker_id: &'a str,
        job_id: Uuid,
        error: &'a str,
        will_retry: bool,
    },
    /// The job was cancelled while the callback ran; its result is still written.
    CancelledWhileRunning {
        worker_id: &'a str,
        job_id: Uuid,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling { worker_id } => {
                tracing::trace!(%worker_id, "Polling for jobs");
            }
            WorkerEvent::JobClaimed { worker_id, job } => {
                tracing::info!(
                    %worker_id,
                    job_id = %job.id,
                    site = %job.target.site,
                    priority = %job.priority,
                    attempt = job.current_retry + 1,
                    "Job claimed"
                );
            }
            WorkerEvent::JobCompleted {
                worker_id,
                job_id,
                items,
            } => {
                tracing::info!(%worker_id, %job_id, items, "Job completed");
            }
            WorkerEvent::JobFailed {
                worker_id,
                job_id,
                error,
                will_retry,
            } => {
                tracing::warn!(%worker_id, %job_id, %error, will_retry, "Job failed");
            }
            WorkerEvent::CancelledWhileRunning { worker_id, job_id } => {
                tracing::warn!(
                    %worker_id,
                    %job_id,
                    "Job was cancelled while running; writing its outcome anyway"
                );
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// What a callback run amounted to.
#[derive(Debug)]
enum JobOutcome {
    Completed(JobResult),
    Retryable(AppError),
    Fatal(String),
}

impl JobOutcome {
    fn from_join(joined: Result<Result<JobResult, AppError>, JoinError>) -> Self {
        match joined {
            Ok(Ok(result)) => JobOutcome::Completed(result),
            Ok(Err(e)) if e.is_retryable() => JobOutcome::Retryable(e),
            Ok(Err(e)) => JobOutcome::Fatal(e.to_string()),
            Err(e) => JobOutcome::Fatal(describe_join_error(e)),
        }
    }
}

fn describe_join_error(err: JoinError) -> String {
    if err.is_cancelled() {
        return "worker callback was cancelled".to_string();
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());
    match message {
        Some(m) => format!("worker callback panicked: {m}"),
        None => "worker callback panicked".to_string(),
    }
}

pub(crate) struct DispatchLoop<S> {
    pub(crate) worker_id: String,
    pub(crate) queue: JobQueue<S>,
    pub(crate) callback: JobCallback,
    pub(crate) config: WorkerConfig,
    pub(crate) reporter: Arc<dyn WorkerReporter>,
    pub(crate) cancel: CancellationToken,
}

impl<S: SharedStore + 'static> DispatchLoop<S> {
    /// Run until cancelled. A dequeue in flight is allowed to finish so a
    /// popped id is never dropped.
    pub(crate) async fn run(self) {
        let worker_id = self.worker_id.as_str();
        self.reporter.report(WorkerEvent::Started { worker_id });

        while !self.cancel.is_cancelled() {
            if let Err(e) = self.queue.heartbeat(worker_id).await {
                tracing::error!(%worker_id, error = %e, "Failed to record heartbeat");
            }
            self.reporter.report(WorkerEvent::Polling { worker_id });

            match self
                .queue
                .dequeue(worker_id, self.config.dequeue_timeout)
                .await
            {
                Ok(Some(job)) => self.run_job(job).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(%worker_id, error = %e, "Failed to dequeue job");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.error_backoff) => {}
                        () = self.cancel.cancelled() => break,
                    }
                }
            }
        }

        if let Err(e) = self.queue.remove_worker(worker_id).await {
            tracing::error!(%worker_id, error = %e, "Failed to deregister worker");
        }
        self.reporter.report(WorkerEvent::Stopped { worker_id });
    }

    async fn run_job(&self, job: ScrapingJob) {
        let worker_id = self.worker_id.as_str();
        self.reporter.report(WorkerEvent::JobClaimed {
            worker_id,
            job: &job,
        });

        let job_id = job.id;
        let mut task = tokio::spawn((self.callback)(job));

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                _ = ticker.tick() => {
                    if let Err(e) = self.queue.heartbeat(worker_id).await {
                        tracing::error!(%worker_id, %job_id, error = %e, "Failed to record heartbeat");
                    }
                }
            }
        };

        self.write_back(job_id, JobOutcome::from_join(joined)).await;
    }

    async fn write_back(&self, job_id: Uuid, outcome: JobOutcome) {
        let worker_id = self.worker_id.as_str();

        match self.queue.get_status(job_id).await {
            Ok(Some(JobStatus::Cancelled)) => {
                self.reporter
                    .report(WorkerEvent::CancelledWhileRunning { worker_id, job_id });
            }
            Ok(_) => {}
            Err(e) => tracing::error!(%job_id, error = %e, "Failed to read job status"),
        }

        let (message, retryable) = match outcome {
            JobOutcome::Completed(result) => {
                match self.queue.complete_job(&result).await {
                    Ok(_) => self.reporter.report(WorkerEvent::JobCompleted {
                        worker_id,
                        job_id,
                        items: result.items_scraped,
                    }),
                    Err(e) => {
                        tracing::error!(%job_id, error = %e, "Failed to mark job completed");
                    }
                }
                return;
            }
            JobOutcome::Retryable(e) => (e.to_string(), true),
            JobOutcome::Fatal(message) => (message, false),
        };

        let failed = match self
            .queue
            .update_job_status(job_id, JobStatus::Failed, Some(&message), None)
            .await
        {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(%job_id, error = %e, "Failed to mark job as failed");
                return;
            }
        };

        let will_retry = self.config.auto_retry && retryable && failed.can_retry();
        self.reporter.report(WorkerEvent::JobFailed {
            worker_id,
            job_id,
            error: &message,
            will_retry,
        });

        if will_retry {
            self.schedule_retry(&failed);
        }
    }

    /// Requeue after `retry_delay * 2^current_retry`. Dropped if the worker
    /// stops first; the job then stays failed and can be retried by hand.
    fn schedule_retry(&self, job: &ScrapingJob) {
        let delay = job.next_retry_delay(self.config.max_retry_delay);
        let job_id = job.id;
        let queue = self.queue.clone();
        let cancel = self.cancel.clone();

        tracing::info!(%job_id, delay_secs = delay.as_secs(), "Scheduling automatic retry");
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => match queue.retry_job(job_id).await {
                    Ok(true) => {}
                    Ok(false) => tracing::debug!(%job_id, "Automatic retry no longer applicable"),
                    Err(e) => tracing::error!(%job_id, error = %e, "Automatic retry failed"),
                },
            }
        });
    }
}
