//! Persistent metadata store.
//!
//! Single authority for the data model: download records, the download
//! queue, media metadata, and viewing history all live in one SQLite file
//! and every mutation goes through here. Readers see committed state; the
//! connection mutex serialises multi-statement operations so claims and
//! idempotent enqueues are atomic.

mod models;
mod schema;

pub use models::{
    DownloadRecord, EnqueueOutcome, MediaKind, MediaMetadata, QueueCounts, QueueItem, QueueStatus,
    ViewingSession,
};

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

/// Newest sessions kept per user.
const HISTORY_RETENTION: i64 = 1000;

/// Storage operations over the five logical namespaces.
pub trait MetadataStore: Send + Sync {
    // === Downloads ===

    /// Upsert; overwrites any prior record for the same `{kind}:{media_id}`.
    fn put_download(&self, record: &DownloadRecord) -> Result<()>;

    fn get_download(&self, kind: MediaKind, media_id: &str) -> Result<Option<DownloadRecord>>;

    /// Lookup by media id alone, any kind.
    fn find_download(&self, media_id: &str) -> Result<Option<DownloadRecord>>;

    /// Most recently downloaded first.
    fn list_downloads(
        &self,
        kind: Option<MediaKind>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DownloadRecord>>;

    /// Every record, for reconciliation and eviction scans.
    fn all_downloads(&self) -> Result<Vec<DownloadRecord>>;

    /// Set last-accessed. Silently a no-op when the record is absent.
    fn touch_download(&self, kind: MediaKind, media_id: &str, when: i64) -> Result<()>;

    fn delete_download(&self, kind: MediaKind, media_id: &str) -> Result<()>;

    fn count_downloads(&self) -> Result<u64>;

    /// Sum of recorded byte sizes.
    fn cache_size(&self) -> Result<u64>;

    // === Queue ===

    /// Idempotent on job id.
    fn put_queue(&self, item: &QueueItem) -> Result<()>;

    /// Insert only if no queued/downloading item exists for this media id,
    /// else promote the existing item to `min(existing, new)` priority.
    fn add_if_absent(&self, media_id: &str, priority: u8, now: i64) -> Result<EnqueueOutcome>;

    fn get_queue(&self, job_id: &str) -> Result<Option<QueueItem>>;

    /// Atomically transition the highest-ranked claimable queued item to
    /// `downloading`. Items with a pending `not_before` are skipped.
    fn claim_next_queued(&self, now: i64) -> Result<Option<QueueItem>>;

    fn update_queue(&self, item: &QueueItem) -> Result<()>;

    fn delete_queue(&self, job_id: &str) -> Result<()>;

    /// Back to `queued` with a retry backoff; increments the retry counter.
    fn requeue_with_backoff(&self, job_id: &str, not_before: i64, error: &str) -> Result<()>;

    /// Back to `queued` without counting a retry (shutdown, full worker pool).
    fn release_claim(&self, job_id: &str) -> Result<()>;

    fn mark_failed(&self, job_id: &str, error: &str) -> Result<()>;

    /// Queue order: priority, then age, then job id.
    fn list_queue(&self) -> Result<Vec<QueueItem>>;

    fn queue_counts(&self) -> Result<QueueCounts>;

    /// Whether the media id is queued or downloading.
    fn is_media_active(&self, media_id: &str) -> Result<bool>;

    /// Media ids currently in `downloading`, for eviction protection.
    fn downloading_media_ids(&self) -> Result<Vec<String>>;

    // === Metadata ===

    fn put_metadata(&self, meta: &MediaMetadata) -> Result<()>;

    fn get_metadata(&self, media_id: &str) -> Result<Option<MediaMetadata>>;

    /// Episodes of a series season, sorted by episode number.
    fn list_series_episodes(&self, series_id: &str, season: u32) -> Result<Vec<MediaMetadata>>;

    // === History ===

    /// Append-only, trimmed to the newest sessions per user.
    fn append_history(&self, user_id: &str, session: &ViewingSession) -> Result<()>;

    fn get_history(&self, user_id: &str, since: i64) -> Result<Vec<ViewingSession>>;
}

/// SQLite-backed store. Cheap to clone via `Arc`.
pub struct SqliteMetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetadataStore {
    /// Open or create the database at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(&db_path).with_context(|| {
            format!("Failed to open metadata store at {:?}", db_path.as_ref())
        })?;
        // Surface contention instead of hanging on a locked database.
        conn.busy_timeout(Duration::from_secs(1))?;
        // journal_mode returns the resulting mode as a row.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
        schema::validate_or_create(&conn)?;
        info!("Metadata store opened at {:?}", db_path.as_ref());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::create(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn record_key(kind: MediaKind, media_id: &str) -> String {
        format!("{}:{}", kind.as_str(), media_id)
    }

    fn row_to_download(row: &rusqlite::Row) -> rusqlite::Result<DownloadRecord> {
        Ok(DownloadRecord {
            job_id: row.get("job_id")?,
            media_id: row.get("media_id")?,
            kind: MediaKind::from_str(&row.get::<_, String>("kind")?)
                .unwrap_or(MediaKind::Movie),
            local_path: row.get("local_path")?,
            byte_size: row.get::<_, i64>("byte_size")? as u64,
            downloaded_at: row.get("downloaded_at")?,
            last_accessed: row.get("last_accessed")?,
            priority: row.get::<_, i64>("priority")? as u8,
            checksum: row.get("checksum")?,
        })
    }

    fn row_to_queue_item(row: &rusqlite::Row) -> rusqlite::Result<QueueItem> {
        Ok(QueueItem {
            job_id: row.get("job_id")?,
            media_id: row.get("media_id")?,
            priority: row.get::<_, i64>("priority")? as u8,
            url: row.get("url")?,
            local_path: row.get("local_path")?,
            status: QueueStatus::from_str(&row.get::<_, String>("status")?)
                .unwrap_or(QueueStatus::Failed),
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            not_before: row.get("not_before")?,
            retry_count: row.get::<_, i64>("retry_count")? as u32,
            last_error: row.get("last_error")?,
            expected_checksum: row.get("expected_checksum")?,
        })
    }

    fn row_to_metadata(row: &rusqlite::Row) -> rusqlite::Result<MediaMetadata> {
        Ok(MediaMetadata {
            media_id: row.get("media_id")?,
            name: row.get("name")?,
            kind: MediaKind::from_str(&row.get::<_, String>("kind")?)
                .unwrap_or(MediaKind::Movie),
            series_id: row.get("series_id")?,
            season: row.get::<_, Option<i64>>("season")?.map(|v| v as u32),
            episode: row.get::<_, Option<i64>>("episode")?.map(|v| v as u32),
            container: row.get("container")?,
            byte_size: row.get::<_, i64>("byte_size")? as u64,
        })
    }

    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<ViewingSession> {
        Ok(ViewingSession {
            media_id: row.get("media_id")?,
            kind: MediaKind::from_str(&row.get::<_, String>("kind")?)
                .unwrap_or(MediaKind::Movie),
            series_id: row.get("series_id")?,
            season: row.get::<_, Option<i64>>("season")?.map(|v| v as u32),
            episode: row.get::<_, Option<i64>>("episode")?.map(|v| v as u32),
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
            completed: row.get::<_, i64>("completed")? != 0,
        })
    }
}

impl MetadataStore for SqliteMetadataStore {
    fn put_download(&self, record: &DownloadRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO downloads (
                record_key, job_id, media_id, kind, local_path, byte_size,
                downloaded_at, last_accessed, priority, checksum
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(record_key) DO UPDATE SET
                job_id = excluded.job_id,
                local_path = excluded.local_path,
                byte_size = excluded.byte_size,
                downloaded_at = excluded.downloaded_at,
                last_accessed = excluded.last_accessed,
                priority = excluded.priority,
                checksum = excluded.checksum"#,
            params![
                Self::record_key(record.kind, &record.media_id),
                record.job_id,
                record.media_id,
                record.kind.as_str(),
                record.local_path,
                record.byte_size as i64,
                record.downloaded_at,
                record.last_accessed,
                record.priority as i64,
                record.checksum,
            ],
        )
        .context("Failed to store download record")?;
        Ok(())
    }

    fn get_download(&self, kind: MediaKind, media_id: &str) -> Result<Option<DownloadRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT * FROM downloads WHERE record_key = ?1",
                [Self::record_key(kind, media_id)],
                Self::row_to_download,
            )
            .optional()?;
        Ok(record)
    }

    fn find_download(&self, media_id: &str) -> Result<Option<DownloadRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT * FROM downloads WHERE media_id = ?1",
                [media_id],
                Self::row_to_download,
            )
            .optional()?;
        Ok(record)
    }

    fn list_downloads(
        &self,
        kind: Option<MediaKind>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DownloadRecord>> {
        let conn = self.conn.lock().unwrap();
        let records = match kind {
            Some(kind) => {
                let mut stmt = conn.prepare(
                    r#"SELECT * FROM downloads WHERE kind = ?1
                       ORDER BY downloaded_at DESC LIMIT ?2 OFFSET ?3"#,
                )?;
                let rows = stmt.query_map(
                    params![kind.as_str(), limit as i64, offset as i64],
                    Self::row_to_download,
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    r#"SELECT * FROM downloads
                       ORDER BY downloaded_at DESC LIMIT ?1 OFFSET ?2"#,
                )?;
                let rows = stmt.query_map(
                    params![limit as i64, offset as i64],
                    Self::row_to_download,
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(records)
    }

    fn all_downloads(&self) -> Result<Vec<DownloadRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM downloads")?;
        let rows = stmt.query_map([], Self::row_to_download)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn touch_download(&self, kind: MediaKind, media_id: &str, when: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE downloads SET last_accessed = ?1 WHERE record_key = ?2",
            params![when, Self::record_key(kind, media_id)],
        )?;
        Ok(())
    }

    fn delete_download(&self, kind: MediaKind, media_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM downloads WHERE record_key = ?1",
            [Self::record_key(kind, media_id)],
        )?;
        Ok(())
    }

    fn count_downloads(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM downloads", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn cache_size(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let size: i64 = conn.query_row(
            "SELECT COALESCE(SUM(byte_size), 0) FROM downloads",
            [],
            |row| row.get(0),
        )?;
        Ok(size as u64)
    }

    fn put_queue(&self, item: &QueueItem) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO queue (
                job_id, media_id, priority, url, local_path, status,
                created_at, started_at, not_before, retry_count, last_error,
                expected_checksum
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(job_id) DO UPDATE SET
                priority = excluded.priority,
                url = excluded.url,
                local_path = excluded.local_path,
                status = excluded.status,
                started_at = excluded.started_at,
                not_before = excluded.not_before,
                retry_count = excluded.retry_count,
                last_error = excluded.last_error,
                expected_checksum = excluded.expected_checksum"#,
            params![
                item.job_id,
                item.media_id,
                item.priority as i64,
                item.url,
                item.local_path,
                item.status.as_str(),
                item.created_at,
                item.started_at,
                item.not_before,
                item.retry_count as i64,
                item.last_error,
                item.expected_checksum,
            ],
        )
        .context("Failed to store queue item")?;
        Ok(())
    }

    fn add_if_absent(&self, media_id: &str, priority: u8, now: i64) -> Result<EnqueueOutcome> {
        let conn = self.conn.lock().unwrap();

        let existing: Option<(String, i64)> = conn
            .query_row(
                r#"SELECT job_id, priority FROM queue
                   WHERE media_id = ?1 AND status IN ('queued', 'downloading')"#,
                [media_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((job_id, existing_priority)) = existing {
            if (priority as i64) < existing_priority {
                conn.execute(
                    "UPDATE queue SET priority = ?1 WHERE job_id = ?2",
                    params![priority as i64, job_id],
                )?;
                return Ok(EnqueueOutcome::Promoted { job_id });
            }
            return Ok(EnqueueOutcome::Unchanged { job_id });
        }

        let item = QueueItem::new(media_id, priority, now);
        conn.execute(
            r#"INSERT INTO queue (
                job_id, media_id, priority, url, local_path, status,
                created_at, started_at, not_before, retry_count, last_error,
                expected_checksum
            ) VALUES (?1, ?2, ?3, NULL, NULL, 'queued', ?4, NULL, NULL, 0, NULL, NULL)"#,
            params![item.job_id, item.media_id, priority as i64, now],
        )?;
        Ok(EnqueueOutcome::Inserted {
            job_id: item.job_id,
        })
    }

    fn get_queue(&self, job_id: &str) -> Result<Option<QueueItem>> {
        let conn = self.conn.lock().unwrap();
        let item = conn
            .query_row(
                "SELECT * FROM queue WHERE job_id = ?1",
                [job_id],
                Self::row_to_queue_item,
            )
            .optional()?;
        Ok(item)
    }

    fn claim_next_queued(&self, now: i64) -> Result<Option<QueueItem>> {
        let conn = self.conn.lock().unwrap();

        let candidate = conn
            .query_row(
                r#"SELECT * FROM queue
                   WHERE status = 'queued'
                     AND (not_before IS NULL OR not_before <= ?1)
                   ORDER BY priority ASC, created_at ASC, job_id ASC
                   LIMIT 1"#,
                [now],
                Self::row_to_queue_item,
            )
            .optional()?;

        let mut item = match candidate {
            Some(item) => item,
            None => return Ok(None),
        };

        // The status guard makes the transition atomic under the connection
        // mutex even if another claimer raced us to the same row.
        let claimed = conn.execute(
            r#"UPDATE queue SET status = 'downloading', started_at = ?1
               WHERE job_id = ?2 AND status = 'queued'"#,
            params![now, item.job_id],
        )?;
        if claimed == 0 {
            return Ok(None);
        }

        item.status = QueueStatus::Downloading;
        item.started_at = Some(now);
        Ok(Some(item))
    }

    fn update_queue(&self, item: &QueueItem) -> Result<()> {
        self.put_queue(item)
    }

    fn delete_queue(&self, job_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM queue WHERE job_id = ?1", [job_id])?;
        Ok(())
    }

    fn requeue_with_backoff(&self, job_id: &str, not_before: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE queue SET status = 'queued',
                   started_at = NULL,
                   not_before = ?1,
                   retry_count = retry_count + 1,
                   last_error = ?2
               WHERE job_id = ?3"#,
            params![not_before, error, job_id],
        )?;
        Ok(())
    }

    fn release_claim(&self, job_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE queue SET status = 'queued', started_at = NULL
               WHERE job_id = ?1 AND status = 'downloading'"#,
            [job_id],
        )?;
        Ok(())
    }

    fn mark_failed(&self, job_id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE queue SET status = 'failed', last_error = ?1
               WHERE job_id = ?2"#,
            params![error, job_id],
        )?;
        Ok(())
    }

    fn list_queue(&self) -> Result<Vec<QueueItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM queue ORDER BY priority ASC, created_at ASC, job_id ASC",
        )?;
        let rows = stmt.query_map([], Self::row_to_queue_item)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn queue_counts(&self) -> Result<QueueCounts> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM queue GROUP BY status")?;
        let mut counts = QueueCounts::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match QueueStatus::from_str(&status) {
                Some(QueueStatus::Queued) => counts.queued = count as u64,
                Some(QueueStatus::Downloading) => counts.downloading = count as u64,
                Some(QueueStatus::Failed) => counts.failed = count as u64,
                None => {}
            }
        }
        Ok(counts)
    }

    fn is_media_active(&self, media_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            r#"SELECT COUNT(*) FROM queue
               WHERE media_id = ?1 AND status IN ('queued', 'downloading')"#,
            [media_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn downloading_media_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT media_id FROM queue WHERE status = 'downloading'")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn put_metadata(&self, meta: &MediaMetadata) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO metadata (
                media_id, name, kind, series_id, season, episode, container, byte_size
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(media_id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                series_id = excluded.series_id,
                season = excluded.season,
                episode = excluded.episode,
                container = excluded.container,
                byte_size = excluded.byte_size"#,
            params![
                meta.media_id,
                meta.name,
                meta.kind.as_str(),
                meta.series_id,
                meta.season.map(|v| v as i64),
                meta.episode.map(|v| v as i64),
                meta.container,
                meta.byte_size as i64,
            ],
        )?;
        Ok(())
    }

    fn get_metadata(&self, media_id: &str) -> Result<Option<MediaMetadata>> {
        let conn = self.conn.lock().unwrap();
        let meta = conn
            .query_row(
                "SELECT * FROM metadata WHERE media_id = ?1",
                [media_id],
                Self::row_to_metadata,
            )
            .optional()?;
        Ok(meta)
    }

    fn list_series_episodes(&self, series_id: &str, season: u32) -> Result<Vec<MediaMetadata>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM metadata
               WHERE kind = 'episode' AND series_id = ?1 AND season = ?2
               ORDER BY episode ASC"#,
        )?;
        let rows = stmt.query_map(params![series_id, season as i64], Self::row_to_metadata)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn append_history(&self, user_id: &str, session: &ViewingSession) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let next_seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM history WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        conn.execute(
            r#"INSERT INTO history (
                user_id, seq, media_id, kind, series_id, season, episode,
                start_time, end_time, completed
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                user_id,
                next_seq,
                session.media_id,
                session.kind.as_str(),
                session.series_id,
                session.season.map(|v| v as i64),
                session.episode.map(|v| v as i64),
                session.start_time,
                session.end_time,
                session.completed as i64,
            ],
        )?;
        conn.execute(
            "DELETE FROM history WHERE user_id = ?1 AND seq <= ?2",
            params![user_id, next_seq - HISTORY_RETENTION],
        )?;
        Ok(())
    }

    fn get_history(&self, user_id: &str, since: i64) -> Result<Vec<ViewingSession>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM history
               WHERE user_id = ?1 AND start_time >= ?2
               ORDER BY seq ASC"#,
        )?;
        let rows = stmt.query_map(params![user_id, since], Self::row_to_session)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
