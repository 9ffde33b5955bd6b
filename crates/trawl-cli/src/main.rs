use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use trawl_client::{ReqwestFetcher, register_builtin_sites};
use trawl_core::job::{CreateJobRequest, JobFilter, JobStatus, Priority, ScrapingTarget};
use trawl_core::traits::{ItemSink, NullSink};
use trawl_core::{AppContext, JobManager, JobQueue, JsonLinesSink, QueueKeys, ScraperRegistry, TrawlConfig};
use trawl_store::{RedisConfig, RedisStore};

#[derive(Parser)]
#[command(name = "trawl", version, about = "Distributed crawl job scheduler")]
struct Cli {
    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a new crawl job
    Submit {
        /// Registered site key (e.g. "quotes", "books", "generic")
        #[arg(short, long)]
        site: String,

        /// Start URL; overrides the site's own listing
        #[arg(short, long)]
        url: Option<String>,

        /// Search criterion as key=value (repeatable)
        #[arg(short, long = "criterion", value_parser = parse_key_val)]
        criteria: Vec<(String, String)>,

        #[arg(long, default_value_t = 1)]
        max_pages: u32,

        /// Minimum seconds between requests
        #[arg(long, default_value_t = 1.0)]
        request_delay: f64,

        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        #[arg(long, default_value_t = 3)]
        max_retries: u32,

        /// Base seconds before an automatic retry
        #[arg(long, default_value_t = 60)]
        retry_delay: u64,

        #[arg(short, long)]
        title: String,

        #[arg(long)]
        description: Option<String>,

        #[arg(long, env = "TRAWL_USER")]
        user: String,

        #[arg(long, env = "TRAWL_TENANT")]
        tenant: String,
    },

    /// Show one job, optionally with its result
    Get {
        job_id: Uuid,

        #[arg(long, default_value_t = false)]
        result: bool,
    },

    /// List jobs, newest first
    List {
        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long)]
        priority: Option<Priority>,

        #[arg(long)]
        tenant: Option<String>,

        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        site: Option<String>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Cancel a pending, running, or retrying job
    Cancel {
        job_id: Uuid,

        #[arg(long, env = "TRAWL_USER")]
        user: String,

        #[arg(long, env = "TRAWL_TENANT")]
        tenant: String,
    },

    /// Re-queue a failed job that has retries left
    Retry {
        job_id: Uuid,

        #[arg(long, env = "TRAWL_USER")]
        user: String,

        #[arg(long, env = "TRAWL_TENANT")]
        tenant: String,
    },

    /// Print queue statistics
    Stats {
        /// Restrict to one tenant's jobs
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Reclaim dead workers and requeue their jobs
    Cleanup {
        /// Heartbeat age after which a worker counts as dead
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        timeout_minutes: Option<u64>,
    },

    /// Run worker loops until interrupted
    Worker {
        /// Worker id prefix; loops are named {id}-1, {id}-2, ...
        #[arg(long, env = "TRAWL_WORKER_ID", default_value = "worker")]
        id: String,

        #[arg(short, long, default_value_t = 1)]
        concurrency: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trawl=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = TrawlConfig::from_env().context("Invalid TRAWL_* configuration")?;
    let store = connect_store(cli.redis_url).await?;

    run_command(cli.command, store, config).await
}

async fn connect_store(redis_url: Option<String>) -> Result<RedisStore> {
    let config = match redis_url {
        Some(url) => RedisConfig::new(url),
        None => RedisConfig::from_env()?,
    };
    RedisStore::connect(&config)
        .await
        .context("Failed to connect to Redis")
}

async fn run_command(command: Commands, store: RedisStore, config: TrawlConfig) -> Result<()> {
    let queue = JobQueue::with_keys(store.clone(), QueueKeys::new(config.key_prefix.clone()));
    let manager = JobManager::new(queue, config.worker_config());

    match command {
        Commands::Submit {
            site,
            url,
            criteria,
            max_pages,
            request_delay,
            priority,
            max_retries,
            retry_delay,
            title,
            description,
            user,
            tenant,
        } => {
            let mut target = ScrapingTarget::new(site)
                .with_max_pages(max_pages)
                .with_request_delay(request_delay);
            if let Some(url) = url {
                target = target.with_url(url);
            }
            for (key, value) in criteria {
                target = target.with_criterion(key, value);
            }

            let mut request = CreateJobRequest::new(user, tenant, title, target)
                .with_priority(priority)
                .with_max_retries(max_retries)
                .with_retry_delay(retry_delay);
            if let Some(description) = description {
                request = request.with_description(description);
            }

            let job = manager
                .create_job(request)
                .await
                .context("Failed to submit job")?;
            println!("{}", job.id);
        }
        Commands::Get { job_id, result } => {
            let Some(job) = manager.get_job(job_id).await? else {
                bail!("Job {job_id} not found");
            };
            println!("{}", serde_json::to_string_pretty(&job)?);
            if result {
                match manager.get_job_result(job_id).await? {
                    Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                    None => println!("No result recorded for {job_id}"),
                }
            }
        }
        Commands::List {
            status,
            priority,
            tenant,
            user,
            site,
            limit,
            offset,
        } => {
            let mut filter = JobFilter::default().with_limit(limit).with_offset(offset);
            if let Some(status) = status {
                filter = filter.with_status(status);
            }
            if let Some(priority) = priority {
                filter = filter.with_priority(priority);
            }
            if let Some(tenant) = tenant {
                filter = filter.for_tenant(tenant);
            }
            if let Some(user) = user {
                filter = filter.for_user(user);
            }
            if let Some(site) = site {
                filter = filter.with_site(site);
            }

            let jobs = manager.list_jobs(&filter).await?;
            if jobs.is_empty() {
                println!("No jobs found");
                return Ok(());
            }
            for job in &jobs {
                println!(
                    "  {} [{:<9}] {:<6} {:>5.1}% {} ({})",
                    job.id,
                    job.status.as_str(),
                    job.priority.as_str(),
                    job.progress_percentage,
                    job.title,
                    job.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                );
            }
            println!("\nShown: {} jobs", jobs.len());
        }
        Commands::Cancel {
            job_id,
            user,
            tenant,
        } => {
            let job = manager
                .cancel_job(job_id, &user, &tenant)
                .await
                .with_context(|| format!("Failed to cancel job {job_id}"))?;
            println!("{} {}", job.id, job.status);
        }
        Commands::Retry {
            job_id,
            user,
            tenant,
        } => {
            let job = manager
                .retry_job(job_id, &user, &tenant)
                .await
                .with_context(|| format!("Failed to retry job {job_id}"))?;
            println!(
                "{} {} (attempt {}/{})",
                job.id, job.status, job.current_retry, job.max_retries
            );
        }
        Commands::Stats { tenant } => {
            let stats = manager.get_stats(tenant.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Cleanup { timeout_minutes } => {
            let minutes = timeout_minutes.unwrap_or(config.lock_timeout_minutes);
            let report = manager.cleanup_expired_locks(minutes).await?;
            println!(
                "Removed {} workers, requeued {} jobs",
                report.workers_removed, report.jobs_requeued
            );
        }
        Commands::Worker { id, concurrency } => {
            cmd_worker(config, store, &id, concurrency).await?;
        }
    }

    Ok(())
}

async fn cmd_worker(
    config: TrawlConfig,
    store: RedisStore,
    id: &str,
    concurrency: usize,
) -> Result<()> {
    let fetcher = ReqwestFetcher::with_timeout(config.request_timeout)
        .context("Failed to create HTTP client")?;
    let mut registry = ScraperRegistry::new(fetcher, config.engine_config());
    register_builtin_sites(&mut registry)?;

    match config.output_dir.clone() {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "Writing items as JSON lines");
            run_workers(AppContext::new(config, store, registry, JsonLinesSink::new(dir)), id, concurrency).await
        }
        None => run_workers(AppContext::new(config, store, registry, NullSink), id, concurrency).await,
    }
}

async fn run_workers<K: ItemSink + 'static>(
    ctx: AppContext<RedisStore, ReqwestFetcher, K>,
    id: &str,
    concurrency: usize,
) -> Result<()> {
    if concurrency == 0 {
        bail!("--concurrency must be at least 1");
    }
    for n in 1..=concurrency {
        ctx.spawn_scrape_worker(&format!("{id}-{n}"))?;
    }
    tracing::info!(
        workers = concurrency,
        sites = ?ctx.registry().sites(),
        "Workers started"
    );

    let minutes = ctx.config().lock_timeout_minutes;
    let period = ctx.config().lock_timeout();
    // First sweep after one full period, once the loops have heartbeated.
    let mut reclaim = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("Failed to install CTRL+C handler")?;
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = reclaim.tick() => {
                if let Err(e) = ctx.manager().cleanup_expired_locks(minutes).await {
                    tracing::warn!(error = %e, "Lock cleanup failed");
                }
            }
        }
    }

    ctx.shutdown().await;
    Ok(())
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}
