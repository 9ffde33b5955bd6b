use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for Trawl.
#[derive(Error, Debug)]
pub enum AppError {
    /// The target server pushed back (HTTP 429). Never retried by the fetch engine.
    #[error("Rate limited by server{}", fmt_retry_after(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// Fetch failed after all attempts were exhausted.
    #[error("Network error{}: {message}", fmt_status(.status))]
    Network {
        status: Option<u16>,
        message: String,
    },

    /// Non-success HTTP status on a single attempt.
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// Connection-level failure on a single attempt.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Fetched markup could not be parsed.
    #[error("Parsing error: {0}")]
    Parsing(String),

    /// An extracted record failed structural checks.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Catch-all scraper failure.
    #[error("Scraper error: {0}")]
    Scraper(String),

    /// No registered scraper handles the requested site or URL.
    #[error("Unsupported site: {0}")]
    UnsupportedSite(String),

    /// Shared store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local I/O failed (result sink).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller does not own the job.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The job is not in a status that allows the requested operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}s", d.as_secs()),
        None => String::new(),
    }
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" (HTTP {s})"),
        None => String::new(),
    }
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::RateLimited { .. }
            | AppError::Network { .. }
            | AppError::HttpStatus { .. }
            | AppError::Transport(_)
            | AppError::Timeout(_)
            | AppError::Store(_) => true,
            AppError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Server-provided hint for when to try again, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status code associated with this failure, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::RateLimited { .. } => Some(429),
            AppError::Network { status, .. } => *status,
            AppError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::Transport("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::RateLimited { retry_after: None }.is_retryable());
        assert!(
            AppError::HttpStatus {
                status: 503,
                url: "https://example.com".into()
            }
            .is_retryable()
        );
        assert!(AppError::Store("connection dropped".into()).is_retryable());
        assert!(!AppError::Parsing("bad html".into()).is_retryable());
        assert!(!AppError::Validation("missing title".into()).is_retryable());
        assert!(!AppError::UnsupportedSite("example.org".into()).is_retryable());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = AppError::RateLimited {
            retry_after: Some(Duration::from_secs(42)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(42)));
        assert_eq!(err.status_code(), Some(429));
        assert_eq!(err.to_string(), "Rate limited by server, retry after 42s");
        assert_eq!(AppError::Timeout(5).retry_after(), None);
    }

    #[test]
    fn test_network_error_display() {
        let err = AppError::Network {
            status: Some(502),
            message: "gave up after 3 attempts".into(),
        };
        assert_eq!(err.to_string(), "Network error (HTTP 502): gave up after 3 attempts");
        assert_eq!(err.status_code(), Some(502));

        let err = AppError::Network {
            status: None,
            message: "connection refused".into(),
        };
        assert_eq!(err.to_string(), "Network error: connection refused");
    }
}
