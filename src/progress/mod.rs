//! Fan-out of download progress to interested clients.
//!
//! Broadcast with bounded per-subscriber buffers: a slow subscriber lags and
//! loses intermediate events instead of back-pressuring the workers.

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

/// Buffered events per subscriber before lag starts dropping the oldest.
pub const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_id: String,
    /// 0..=100.
    pub progress: f64,
    pub status: String,
    pub message: String,
    pub timestamp: i64,
}

impl ProgressEvent {
    fn now() -> i64 {
        Utc::now().timestamp()
    }

    pub fn download(
        media_id: impl Into<String>,
        progress: f64,
        status: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: "download".to_string(),
            media_id: media_id.into(),
            progress,
            status: status.into(),
            message: message.into(),
            timestamp: Self::now(),
        }
    }

    /// Synthetic summary sent to every new subscriber.
    pub fn status_summary(queue_len: u64, cache_size: u64) -> Self {
        Self {
            kind: "status".to_string(),
            media_id: String::new(),
            progress: 0.0,
            status: "connected".to_string(),
            message: format!(
                "{} items queued, {} bytes cached",
                queue_len, cache_size
            ),
            timestamp: Self::now(),
        }
    }

    pub fn shutting_down() -> Self {
        Self {
            kind: "status".to_string(),
            media_id: String::new(),
            progress: 0.0,
            status: "shutting_down".to_string(),
            message: "Server is shutting down".to_string(),
            timestamp: Self::now(),
        }
    }

    /// Terminal events must survive slow subscribers; the forwarding side
    /// retries these for a bounded time before giving up on the client.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "failed" | "shutting_down")
    }
}

#[derive(Clone)]
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self { tx }
    }

    /// Non-blocking. Events published with no subscribers are discarded.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
