//! SQLite schema for the metadata store.

use anyhow::{bail, Context, Result};
use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

const CREATE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS downloads (
    record_key    TEXT PRIMARY KEY,
    job_id        TEXT NOT NULL,
    media_id      TEXT NOT NULL UNIQUE,
    kind          TEXT NOT NULL,
    local_path    TEXT NOT NULL,
    byte_size     INTEGER NOT NULL,
    downloaded_at INTEGER NOT NULL,
    last_accessed INTEGER NOT NULL,
    priority      INTEGER NOT NULL,
    checksum      TEXT
);

CREATE TABLE IF NOT EXISTS queue (
    job_id            TEXT PRIMARY KEY,
    media_id          TEXT NOT NULL,
    priority          INTEGER NOT NULL,
    url               TEXT,
    local_path        TEXT,
    status            TEXT NOT NULL,
    created_at        INTEGER NOT NULL,
    started_at        INTEGER,
    not_before        INTEGER,
    retry_count       INTEGER NOT NULL DEFAULT 0,
    last_error        TEXT,
    expected_checksum TEXT
);

CREATE INDEX IF NOT EXISTS idx_queue_claim
    ON queue (status, priority, created_at, job_id);

CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_active_media
    ON queue (media_id) WHERE status IN ('queued', 'downloading');

CREATE TABLE IF NOT EXISTS metadata (
    media_id  TEXT PRIMARY KEY,
    name      TEXT NOT NULL,
    kind      TEXT NOT NULL,
    series_id TEXT,
    season    INTEGER,
    episode   INTEGER,
    container TEXT,
    byte_size INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_metadata_series
    ON metadata (series_id, season, episode);

CREATE TABLE IF NOT EXISTS history (
    user_id    TEXT NOT NULL,
    seq        INTEGER NOT NULL,
    media_id   TEXT NOT NULL,
    kind       TEXT NOT NULL,
    series_id  TEXT,
    season     INTEGER,
    episode    INTEGER,
    start_time INTEGER NOT NULL,
    end_time   INTEGER,
    completed  INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, seq)
);
"#;

/// Create all tables and stamp the schema version.
pub fn create(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_SQL)
        .context("Failed to create metadata store schema")?;
    conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
    Ok(())
}

/// Reject databases written by a newer build; create missing tables otherwise.
pub fn validate_or_create(conn: &Connection) -> Result<()> {
    let version: i64 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("Failed to read metadata store version")?;

    if version > SCHEMA_VERSION {
        bail!(
            "Metadata store version {} is too new (max supported: {})",
            version,
            SCHEMA_VERSION
        );
    }
    create(conn)
}
