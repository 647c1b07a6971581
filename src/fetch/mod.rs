use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub mod disk;
mod error;
pub mod expiry;

pub use disk::ensure_disk_space;
pub use error::FetchError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const USER_AGENT: &str = concat!("media-task-rs/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Outcome of a size probe. Servers that hide the size are not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeProbe {
    Known(u64),
    Unknown,
}

impl SizeProbe {
    /// Probed size in bytes, 0 when unknown.
    pub fn bytes(&self) -> u64 {
        match self {
            SizeProbe::Known(size) => *size,
            SizeProbe::Unknown => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Downloads remote inputs with a size cap, retry and expiring-URL detection.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    max_file_size: u64,
    max_attempts: u32,
    backoff_unit: Duration,
    request_timeout: Duration,
}

fn header_u64(response: &Response, name: reqwest::header::HeaderName) -> Option<u64> {
    response.headers().get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Total length from a `Content-Range: bytes 0-1/12345` header.
fn content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

impl Fetcher {
    pub fn new(max_file_size: u64) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            max_file_size,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_unit: Duration::from_secs(1),
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    fn status_error(&self, url: &str, status: StatusCode) -> FetchError {
        match status {
            StatusCode::NOT_FOUND => FetchError::NotFound { url: url.to_string() },
            StatusCode::FORBIDDEN => match expiry::expired_at(url, Utc::now()) {
                Some(expired_at) => FetchError::UrlExpired { expired_at },
                None => FetchError::AccessDenied { url: url.to_string() },
            },
            s if s.is_server_error() => FetchError::ServerError { status: s.as_u16(), url: url.to_string() },
            s => FetchError::HttpStatus { status: s.as_u16(), url: url.to_string() },
        }
    }

    fn check_size(&self, size: u64) -> Result<(), FetchError> {
        if size > self.max_file_size {
            return Err(FetchError::SizeLimitExceeded { size, limit: self.max_file_size });
        }
        Ok(())
    }

    /// Ask the server how large `url` is without downloading it.
    ///
    /// Only a size over the limit, a 404 or an expired signed URL are errors;
    /// every other failure yields [`SizeProbe::Unknown`].
    pub async fn probe_size(&self, url: &str) -> Result<SizeProbe, FetchError> {
        let response = match self.client.head(url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Size probe failed for {}: {}", url, e);
                return Ok(SizeProbe::Unknown);
            }
        };

        let status = response.status();
        let probe = if status.is_success() {
            match header_u64(&response, CONTENT_LENGTH) {
                Some(size) if size > 0 => SizeProbe::Known(size),
                _ => SizeProbe::Unknown,
            }
        } else if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound { url: url.to_string() });
        } else if status == StatusCode::FORBIDDEN || status == StatusCode::METHOD_NOT_ALLOWED {
            if status == StatusCode::FORBIDDEN {
                if let Some(expired_at) = expiry::expired_at(url, Utc::now()) {
                    return Err(FetchError::UrlExpired { expired_at });
                }
            }
            // some object stores reject HEAD on presigned GET urls
            self.probe_with_range(url).await
        } else {
            debug!("Size probe for {} returned {}", url, status);
            SizeProbe::Unknown
        };

        if let SizeProbe::Known(size) = probe {
            self.check_size(size)?;
        }
        Ok(probe)
    }

    async fn probe_with_range(&self, url: &str) -> SizeProbe {
        let response = match self.client.get(url).header(RANGE, "bytes=0-1").timeout(PROBE_TIMEOUT).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Range probe failed for {}: {}", url, e);
                return SizeProbe::Unknown;
            }
        };
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return SizeProbe::Unknown;
        }
        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(content_range_total)
            .map_or(SizeProbe::Unknown, SizeProbe::Known)
    }

    pub async fn fetch(&self, url: &str, dest: &Path) -> Result<Download, FetchError> {
        self.fetch_with_attempts(url, dest, self.max_attempts).await
    }

    /// Download `url` to `dest`, retrying transient failures.
    ///
    /// Attempt `i` (0-indexed) that fails with a retryable error waits
    /// `backoff_unit * 2^i` before the next one. Whatever the outcome, a failed
    /// call leaves nothing at `dest`.
    pub async fn fetch_with_attempts(&self, url: &str, dest: &Path, max_attempts: u32) -> Result<Download, FetchError> {
        let max_attempts = max_attempts.max(1);

        let probe = self.probe_size(url).await?;
        if let SizeProbe::Known(size) = probe {
            debug!("Remote size of {} is {} bytes", url, size);
        }

        let mut attempt = 0;
        loop {
            match self.download_once(url, dest).await {
                Ok(bytes) => {
                    info!("Downloaded {} ({} bytes) to {}", url, bytes, dest.display());
                    return Ok(Download { path: dest.to_path_buf(), bytes });
                }
                Err(e) => {
                    remove_partial(dest).await;
                    attempt += 1;
                    if !e.is_retryable() || attempt >= max_attempts {
                        warn!("Download of {} failed after {} attempt(s): {}", url, attempt, e);
                        return Err(e);
                    }
                    let delay = self.backoff_unit * 2u32.pow(attempt - 1);
                    warn!(
                        "Download of {} failed (attempt {}/{}): {}, retrying in {:?}",
                        url, attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn download_once(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let mut response = self.client.get(url).timeout(self.request_timeout).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(url, status));
        }
        if let Some(size) = header_u64(&response, CONTENT_LENGTH) {
            self.check_size(size)?;
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;

        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            written += chunk.len() as u64;
            // the declared size may be missing or wrong
            self.check_size(written)?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(written)
    }
}

async fn remove_partial(dest: &Path) {
    match tokio::fs::remove_file(dest).await {
        Ok(()) => debug!("Removed partial download {}", dest.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial download {}: {}", dest.display(), e),
    }
}
