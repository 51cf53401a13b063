//! Data model owned by the metadata store.
//!
//! All cross-component relationships are lookups by key through the store,
//! never direct references between components.

use serde::{Deserialize, Serialize};

/// Kind of catalogue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Movie,
    Episode,
    Series,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Episode => "episode",
            MediaKind::Series => "series",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "movie" => Some(MediaKind::Movie),
            "episode" => Some(MediaKind::Episode),
            "series" => Some(MediaKind::Series),
            _ => None,
        }
    }
}

/// Status of a queue item. `Queued` and `Downloading` are the active states;
/// a media id may occupy at most one active slot at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Downloading,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Downloading => "downloading",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(QueueStatus::Queued),
            "downloading" => Some(QueueStatus::Downloading),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, QueueStatus::Queued | QueueStatus::Downloading)
    }
}

/// Cached metadata for a catalogue item, written on observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub media_id: String,
    pub name: String,
    pub kind: MediaKind,
    pub series_id: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub container: Option<String>,
    /// Expected size in bytes; 0 when the upstream does not report one.
    pub byte_size: u64,
}

/// A completed cache entry. Keyed `{kind}:{media_id}`, at most one per media id.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadRecord {
    pub job_id: String,
    pub media_id: String,
    pub kind: MediaKind,
    /// Relative to the cache root.
    pub local_path: String,
    pub byte_size: u64,
    pub downloaded_at: i64,
    pub last_accessed: i64,
    pub priority: u8,
    pub checksum: Option<String>,
}

/// A pending or in-flight download.
///
/// Queue timestamps are Unix milliseconds: retry backoff carries sub-second
/// jitter that whole seconds would round away.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub job_id: String,
    pub media_id: String,
    pub priority: u8,
    /// Empty until resolved by a worker.
    pub url: Option<String>,
    /// Empty until resolved by a worker; relative to the cache root.
    pub local_path: Option<String>,
    pub status: QueueStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    /// Earliest time the dispatcher may claim this item again (retry backoff).
    pub not_before: Option<i64>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// When present, the downloaded bytes must hash to this value.
    pub expected_checksum: Option<String>,
}

impl QueueItem {
    pub fn new(media_id: impl Into<String>, priority: u8, created_at: i64) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            media_id: media_id.into(),
            priority,
            url: None,
            local_path: None,
            status: QueueStatus::Queued,
            created_at,
            started_at: None,
            not_before: None,
            retry_count: 0,
            last_error: None,
            expected_checksum: None,
        }
    }
}

/// One playback session, appended to the per-user history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewingSession {
    pub media_id: String,
    pub kind: MediaKind,
    pub series_id: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub start_time: i64,
    pub end_time: Option<i64>,
    /// Watched at least 85% of the known duration.
    pub completed: bool,
}

/// Counts per queue status, for status reporting.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueCounts {
    pub queued: u64,
    pub downloading: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn active(&self) -> u64 {
        self.queued + self.downloading
    }
}

/// Outcome of an `add_if_absent` enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new queue item was created.
    Inserted { job_id: String },
    /// An active item already existed; its priority was raised.
    Promoted { job_id: String },
    /// An active item already existed at an equal or higher priority.
    Unchanged { job_id: String },
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            EnqueueOutcome::Inserted { job_id }
            | EnqueueOutcome::Promoted { job_id }
            | EnqueueOutcome::Unchanged { job_id } => job_id,
        }
    }
}
