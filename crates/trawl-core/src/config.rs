use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::error::AppError;
use crate::job_queue::{DEFAULT_KEY_PREFIX, lock_age};
use crate::pacing::PacingConfig;
use crate::retry::RetryPolicy;
use crate::worker::WorkerConfig;

/// Runtime configuration for queue, workers, and fetch engines.
#[derive(Debug, Clone, PartialEq)]
pub struct TrawlConfig {
    pub key_prefix: String,
    pub dequeue_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub lock_timeout_minutes: u64,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub fetch_retries: u32,
    pub backoff_base: Duration,
    pub request_timeout: Duration,
    /// Directory for JSON-lines output; `None` keeps results in the store only.
    pub output_dir: Option<PathBuf>,
    pub auto_retry: bool,
}

impl Default for TrawlConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            dequeue_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            lock_timeout_minutes: 5,
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(3000),
            fetch_retries: 3,
            backoff_base: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(30),
            output_dir: None,
            auto_retry: false,
        }
    }
}

impl TrawlConfig {
    /// Read configuration from environment variables.
    ///
    /// - `TRAWL_KEY_PREFIX` (default `trawl`)
    /// - `TRAWL_DEQUEUE_TIMEOUT_SECS` (default 5)
    /// - `TRAWL_HEARTBEAT_INTERVAL_SECS` (default 15)
    /// - `TRAWL_LOCK_TIMEOUT_MINUTES` (default 5)
    /// - `TRAWL_MIN_DELAY_MS` / `TRAWL_MAX_DELAY_MS` (default 1000 / 3000)
    /// - `TRAWL_FETCH_RETRIES` (default 3)
    /// - `TRAWL_BACKOFF_BASE_MS` (default 1000)
    /// - `TRAWL_REQUEST_TIMEOUT_SECS` (default 30)
    /// - `TRAWL_OUTPUT_DIR` (optional)
    /// - `TRAWL_AUTO_RETRY` (default false)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, AppError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            key_prefix: var("TRAWL_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            dequeue_timeout: Duration::from_secs(parse_or(
                &var,
                "TRAWL_DEQUEUE_TIMEOUT_SECS",
                defaults.dequeue_timeout.as_secs(),
            )?),
            heartbeat_interval: Duration::from_secs(parse_or(
                &var,
                "TRAWL_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval.as_secs(),
            )?),
            lock_timeout_minutes: parse_or(
                &var,
                "TRAWL_LOCK_TIMEOUT_MINUTES",
                defaults.lock_timeout_minutes,
            )?,
            min_delay: Duration::from_millis(parse_or(
                &var,
                "TRAWL_MIN_DELAY_MS",
                defaults.min_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(parse_or(
                &var,
                "TRAWL_MAX_DELAY_MS",
                defaults.max_delay.as_millis() as u64,
            )?),
            fetch_retries: parse_or(&var, "TRAWL_FETCH_RETRIES", defaults.fetch_retries)?,
            backoff_base: Duration::from_millis(parse_or(
                &var,
                "TRAWL_BACKOFF_BASE_MS",
                defaults.backoff_base.as_millis() as u64,
            )?),
            request_timeout: Duration::from_secs(parse_or(
                &var,
                "TRAWL_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            output_dir: var("TRAWL_OUTPUT_DIR").map(PathBuf::from),
            auto_retry: match var("TRAWL_AUTO_RETRY") {
                None => defaults.auto_retry,
                Some(raw) => parse_bool("TRAWL_AUTO_RETRY", &raw)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.heartbeat_interval.is_zero() {
            return Err(AppError::Config(
                "TRAWL_HEARTBEAT_INTERVAL_SECS must be at least 1".into(),
            ));
        }
        lock_age(self.lock_timeout_minutes)?;
        // Busy workers beat every heartbeat interval, idle ones once per
        // dequeue timeout. Either must stay well inside the lock timeout.
        let lock_timeout = self.lock_timeout();
        if self.heartbeat_interval >= lock_timeout {
            return Err(AppError::Config(format!(
                "TRAWL_HEARTBEAT_INTERVAL_SECS ({}) must be shorter than TRAWL_LOCK_TIMEOUT_MINUTES ({}m)",
                self.heartbeat_interval.as_secs(),
                self.lock_timeout_minutes
            )));
        }
        if self.dequeue_timeout >= lock_timeout {
            return Err(AppError::Config(format!(
                "TRAWL_DEQUEUE_TIMEOUT_SECS ({}) must be shorter than TRAWL_LOCK_TIMEOUT_MINUTES ({}m)",
                self.dequeue_timeout.as_secs(),
                self.lock_timeout_minutes
            )));
        }
        if self.min_delay > self.max_delay {
            return Err(AppError::Config(format!(
                "TRAWL_MIN_DELAY_MS ({}) exceeds TRAWL_MAX_DELAY_MS ({})",
                self.min_delay.as_millis(),
                self.max_delay.as_millis()
            )));
        }
        if self.fetch_retries == 0 {
            return Err(AppError::Config("TRAWL_FETCH_RETRIES must be at least 1".into()));
        }
        Ok(())
    }

    /// Heartbeat age after which a worker is reclaimed.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_minutes.saturating_mul(60))
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            dequeue_timeout: self.dequeue_timeout,
            heartbeat_interval: self.heartbeat_interval,
            auto_retry: self.auto_retry,
            ..WorkerConfig::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pacing: PacingConfig::new(self.min_delay, self.max_delay),
            retry: RetryPolicy::new(self.fetch_retries, self.backoff_base),
        }
    }
}

fn parse_or<T, V>(var: &V, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            AppError::Config(format!("Invalid {key} '{raw}': must be a non-negative integer"))
        }),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, AppError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::Config(format!(
            "Invalid {key} '{raw}': expected true or false"
        ))),
    }
}
