use trawl_core::AppError;

/// Connection settings for the Redis server backing the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct RedisConfig {
    pub url: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Read configuration from environment variables.
    ///
    /// - `REDIS_URL` (required), e.g. `redis://127.0.0.1:6379/0`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, AppError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let url = lookup("REDIS_URL")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AppError::Config("REDIS_URL not set. Required for queue operations.".into())
            })?;

        if !(url.starts_with("redis://")
            || url.starts_with("rediss://")
            || url.starts_with("redis+unix://")
            || url.starts_with("unix://"))
        {
            return Err(AppError::Config(format!(
                "Invalid REDIS_URL '{url}': expected a redis:// or rediss:// URL"
            )));
        }

        Ok(Self { url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_url() {
        let err = RedisConfig::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, AppError::Config(ref m) if m.contains("REDIS_URL")));
        assert!(RedisConfig::from_lookup(|_| Some("  ".into())).is_err());
    }

    #[test]
    fn test_reads_url() {
        let config = RedisConfig::from_lookup(|_| Some("redis://localhost:6379/2".into())).unwrap();
        assert_eq!(config, RedisConfig::new("redis://localhost:6379/2"));
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(RedisConfig::from_lookup(|_| Some("postgres://localhost".into())).is_err());
    }
}
