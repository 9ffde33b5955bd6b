use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use trawl_core::job::{
    CreateJobRequest, JobResult, JobStatus, Priority, ScrapingJob, ScrapingTarget,
};
use trawl_core::job_queue::{JobQueue, QueueKeys};
use trawl_core::manager::JobManager;
use trawl_core::store::SharedStore;
use trawl_core::worker::WorkerConfig;
use trawl_store::RedisStore;

use crate::common::setup_test_store;

fn test_job(priority: Priority) -> ScrapingJob {
    ScrapingJob::from_request(
        CreateJobRequest::new(
            "user-1",
            "tenant-1",
            "Quotes",
            ScrapingTarget::new("quotes").with_max_pages(1),
        )
        .with_priority(priority),
    )
}

fn queue(store: RedisStore) -> JobQueue<RedisStore> {
    JobQueue::with_keys(store, QueueKeys::new("it"))
}

#[tokio::test]
async fn enqueue_writes_documented_key_layout() {
    let (store, _container) = setup_test_store().await;
    let queue = queue(store.clone());
    let job = test_job(Priority::High);
    queue.enqueue(&job).await.unwrap();

    let id = job.id.to_string();
    let raw = store.hget("it:jobs", &id).await.unwrap().unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(doc["status"], "pending");
    assert_eq!(store.hget("it:status", &id).await.unwrap().as_deref(), Some("pending"));
    assert_eq!(store.llen("it:queue:high").await.unwrap(), 1);
}

#[tokio::test]
async fn dequeue_follows_priority_then_fifo() {
    let (store, _container) = setup_test_store().await;
    let queue = queue(store);

    let low = test_job(Priority::Low);
    let normal_a = test_job(Priority::Normal);
    let normal_b = test_job(Priority::Normal);
    let urgent = test_job(Priority::Urgent);
    for job in [&low, &normal_a, &normal_b, &urgent] {
        queue.enqueue(job).await.unwrap();
    }

    let mut order = Vec::new();
    while let Some(job) = queue.dequeue("w1", Duration::from_millis(200)).await.unwrap() {
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.worker_id.as_deref(), Some("w1"));
        order.push(job.id);
    }
    assert_eq!(order, vec![urgent.id, normal_a.id, normal_b.id, low.id]);
}

#[tokio::test]
async fn competing_workers_never_share_a_job() {
    let (store, _container) = setup_test_store().await;
    let queue = queue(store);
    for _ in 0..20 {
        queue.enqueue(&test_job(Priority::Normal)).await.unwrap();
    }

    let mut tasks = Vec::new();
    for w in 0..4 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let worker = format!("w{w}");
            let mut claimed = Vec::new();
            while let Some(job) = queue.dequeue(&worker, Duration::from_millis(300)).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 20);
}

#[tokio::test]
async fn cancel_pulls_job_from_queue() {
    let (store, _container) = setup_test_store().await;
    let queue = queue(store.clone());
    let job = test_job(Priority::Normal);
    queue.enqueue(&job).await.unwrap();

    assert!(queue.cancel_job(job.id).await.unwrap());
    assert_eq!(store.llen("it:queue:normal").await.unwrap(), 0);
    assert_eq!(queue.get_status(job.id).await.unwrap(), Some(JobStatus::Cancelled));
    assert!(queue.dequeue("w1", Duration::ZERO).await.unwrap().is_none());
}

#[tokio::test]
async fn cleanup_requeues_jobs_of_dead_workers() {
    let (store, _container) = setup_test_store().await;
    let queue = queue(store.clone());
    let job = test_job(Priority::Normal);
    queue.enqueue(&job).await.unwrap();
    queue.dequeue("dead", Duration::ZERO).await.unwrap().unwrap();

    store
        .hset("it:heartbeats", "dead", "2000-01-01T00:00:00Z")
        .await
        .unwrap();

    let report = queue.cleanup_expired_locks(5).await.unwrap();
    assert_eq!(report.workers_removed, 1);
    assert_eq!(report.jobs_requeued, 1);
    assert!(queue.live_workers().await.unwrap().is_empty());
    assert_eq!(queue.lock_holder(job.id).await.unwrap(), None);

    let again = queue.dequeue("alive", Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(again.id, job.id);
    assert_eq!(again.current_retry, 0);
}

#[tokio::test]
async fn manager_runs_worker_against_redis() {
    let (store, _container) = setup_test_store().await;
    let config = WorkerConfig {
        dequeue_timeout: Duration::from_millis(200),
        ..WorkerConfig::default()
    };
    let manager = JobManager::new(queue(store), config);

    let job = manager
        .create_job(CreateJobRequest::new(
            "user-1",
            "tenant-1",
            "Quotes",
            ScrapingTarget::new("quotes"),
        ))
        .await
        .unwrap();

    manager
        .register_worker("w1", |job: ScrapingJob| async move {
            let now = Utc::now();
            Ok(JobResult {
                job_id: job.id,
                items_scraped: 3,
                pages_processed: 1,
                data_size_bytes: 120,
                started_at: job.started_at.unwrap_or(now),
                completed_at: now,
                success_rate: 1.0,
                errors: vec![],
                warnings: vec![],
                output_location: None,
            })
        })
        .unwrap();

    let mut status = JobStatus::Pending;
    for _ in 0..100 {
        status = manager.get_job(job.id).await.unwrap().unwrap().status;
        if status == JobStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    manager.shutdown().await;

    assert_eq!(status, JobStatus::Completed);
    let result = manager.get_job_result(job.id).await.unwrap().unwrap();
    assert_eq!(result.items_scraped, 3);

    let stats = manager.get_stats(None).await.unwrap();
    assert_eq!(stats.count(JobStatus::Completed), 1);
    assert_eq!(stats.queue_depth, 0);
}
