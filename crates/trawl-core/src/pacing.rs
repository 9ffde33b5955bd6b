//! Request pacing for one fetch engine.
//!
//! Before each request the engine waits a uniformly random duration in
//! `[min_delay, max_delay]`, less whatever time already passed since the
//! previous request. Concurrent callers on the same [`Pacer`] are served one
//! at a time, so the bound holds even when several fetches race.

use std::time::Duration;

use rand::RngExt;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::job::ScrapingTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl PacingConfig {
    /// `max_delay` is raised to `min_delay` if given lower.
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    /// No waiting at all.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Apply a target's own request delay as a floor.
    pub fn for_target(&self, target: &ScrapingTarget) -> Self {
        Self::new(
            self.min_delay.max(target.request_delay()),
            self.max_delay,
        )
    }

    fn pick_delay(&self) -> Duration {
        if self.max_delay <= self.min_delay {
            return self.min_delay;
        }
        let min_ms = u64::try_from(self.min_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(3))
    }
}

#[derive(Debug)]
pub struct Pacer {
    config: PacingConfig,
    last_request: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            config,
            last_request: Mutex::new(None),
        }
    }

    pub fn config(&self) -> PacingConfig {
        self.config
    }

    /// Sleep until the next request may go out, then record it.
    ///
    /// The first request is never delayed.
    pub async fn wait(&self) {
        // Held across the sleep: callers queue up behind each other.
        let mut last = self.last_request.lock().await;

        if let Some(prev) = *last {
            let required = self.config.pick_delay();
            let elapsed = prev.elapsed();
            if elapsed < required {
                let sleep_for = required - elapsed;
                tracing::debug!(sleep_ms = sleep_for.as_millis() as u64, "Pacing request");
                tokio::time::sleep(sleep_for).await;
            }
        }
        *last = Some(Instant::now());
    }
}
