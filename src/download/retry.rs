//! Failure classification and retry backoff.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::config::DownloadConfig;
use crate::upstream::UpstreamError;

/// Backoff never exceeds this, regardless of retry count.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// What went wrong with a single download attempt.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("download cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl DownloadError {
    pub fn from_upstream(err: UpstreamError) -> Self {
        match err {
            UpstreamError::AuthFailed(code) | UpstreamError::NotFound(code) => {
                DownloadError::Status(code)
            }
            UpstreamError::Transient(msg) => DownloadError::Network(msg),
            UpstreamError::Other(msg) => DownloadError::Other(msg),
        }
    }

    /// Permanent failures are never retried: client errors other than 429,
    /// and content that hashed to the wrong value.
    pub fn is_permanent(&self) -> bool {
        match self {
            DownloadError::Status(code) => (400..500).contains(code) && *code != 429,
            DownloadError::ChecksumMismatch { .. } => true,
            _ => false,
        }
    }
}

/// Exponential backoff with uniform jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            attempts: config.retry_attempts,
            base_delay: config.retry_delay(),
        }
    }

    /// Whether a failed attempt should go back to the queue. Cancellation is
    /// not a retry decision; callers requeue without counting it.
    pub fn should_retry(&self, error: &DownloadError, retry_count: u32) -> bool {
        if error.is_permanent() || matches!(error, DownloadError::Cancelled) {
            return false;
        }
        retry_count < self.attempts
    }

    /// Delay before retry number `retry` (1-based):
    /// `base * 2^(retry-1)` scaled by a factor in [0.75, 1.25], capped at 30 s.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let base = self.base_delay.as_secs_f64() * 2f64.powi(exponent as i32);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        let delay = Duration::from_secs_f64(base * jitter);
        delay.min(MAX_BACKOFF)
    }
}
