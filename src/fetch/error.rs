use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("File size {size} bytes exceeds limit of {limit} bytes")]
    SizeLimitExceeded { size: u64, limit: u64 },
    #[error("URL expired on {}", .expired_at.format("%Y-%m-%d %H:%M:%S UTC"))]
    UrlExpired { expired_at: DateTime<Utc> },
    #[error("Access denied (HTTP 403) for {url}")]
    AccessDenied { url: String },
    #[error("Resource not found (HTTP 404) for {url}")]
    NotFound { url: String },
    #[error("Server error (HTTP {status}) for {url}")]
    ServerError { status: u16, url: String },
    #[error("Unexpected HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Insufficient disk space: need {required} bytes, only {available} available")]
    InsufficientDiskSpace { required: u64, available: u64 },
}

impl FetchError {
    /// Whether another attempt may succeed.
    ///
    /// A 403 only reaches this point when the URL carries no past expiry
    /// marker, so it is treated as possibly transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::ServerError { .. } | FetchError::AccessDenied { .. }
        )
    }
}
