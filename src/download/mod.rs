//! Download manager: a persistent priority queue drained by a worker pool.

mod manager;
mod retry;

pub use manager::DownloadManager;
pub use retry::{DownloadError, RetryPolicy};

use anyhow::Result;

use crate::store::EnqueueOutcome;

/// Enqueue interface handed to the predictor and the HTTP surface, so neither
/// needs the whole manager.
pub trait DownloadQueuer: Send + Sync {
    /// Queue a media id for download. Idempotent per media id: an existing
    /// active item is promoted to the stronger priority instead of duplicated.
    fn queue_download(&self, media_id: &str, priority: u8) -> Result<EnqueueOutcome>;
}
