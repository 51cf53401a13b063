//! LRU-with-protection eviction.
//!
//! The store owns the records; this module proposes candidates, deletes the
//! record through the store first and only then removes the file, so a
//! record and its bytes are never exposed inconsistently.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::store::{DownloadRecord, MediaKind, MetadataStore};

use super::CacheFilesystem;

const EMERGENCY_THRESHOLD: f64 = 0.95;
const NORMAL_TARGET_UTILIZATION: f64 = 0.70;
const EMERGENCY_TARGET_UTILIZATION: f64 = 0.60;

#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    pub max_size_bytes: u64,
    pub eviction_threshold: f64,
    pub protection_window: Duration,
}

impl EvictionPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            max_size_bytes: config.max_size_bytes(),
            eviction_threshold: config.eviction_threshold,
            protection_window: config.protection_window(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CleanupSummary {
    pub reconciled: usize,
    pub evicted: usize,
    pub bytes_freed: u64,
}

struct Candidate {
    record: DownloadRecord,
    size: u64,
    score: f64,
}

/// Remove records whose file is missing on disk. A missing file must never
/// count toward cache size or satisfy a lookup.
pub fn reconcile(store: &dyn MetadataStore, fs: &CacheFilesystem) -> Result<usize> {
    let mut removed = 0;
    for record in store.all_downloads()? {
        if fs.file_size(Path::new(&record.local_path)).is_none() {
            warn!(
                "Download record for {} points to missing file {:?}, removing",
                record.media_id, record.local_path
            );
            store.delete_download(record.kind, &record.media_id)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Run reconciliation, then evict until utilization is back under target.
pub fn cleanup(
    store: &dyn MetadataStore,
    fs: &CacheFilesystem,
    policy: &EvictionPolicy,
    now: i64,
) -> Result<CleanupSummary> {
    let mut summary = CleanupSummary {
        reconciled: reconcile(store, fs)?,
        ..Default::default()
    };

    let size = store.cache_size()?;
    let utilization = size as f64 / policy.max_size_bytes as f64;
    if utilization < policy.eviction_threshold {
        return Ok(summary);
    }

    let is_emergency = utilization >= EMERGENCY_THRESHOLD;
    let target_utilization = if is_emergency {
        EMERGENCY_TARGET_UTILIZATION
    } else {
        NORMAL_TARGET_UTILIZATION
    };
    let target_bytes = (policy.max_size_bytes as f64 * target_utilization) as u64;
    let target_reduction = size.saturating_sub(target_bytes);

    if is_emergency {
        warn!(
            "Emergency cache cleanup at {:.1}% utilization, freeing {} bytes",
            utilization * 100.0,
            target_reduction
        );
    } else {
        info!(
            "Cache cleanup at {:.1}% utilization, freeing {} bytes",
            utilization * 100.0,
            target_reduction
        );
    }

    let mut candidates = collect_candidates(store, policy, now)?;
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    if candidates.is_empty() {
        warn!("No eviction candidates found, all cached items are protected");
        return Ok(summary);
    }

    for candidate in candidates {
        if summary.bytes_freed >= target_reduction {
            break;
        }
        // Record first, file second: eviction never leaves a record whose
        // bytes are gone.
        store.delete_download(candidate.record.kind, &candidate.record.media_id)?;
        if let Err(e) = fs.delete(Path::new(&candidate.record.local_path)) {
            warn!(
                "Failed to remove evicted file {:?}: {}",
                candidate.record.local_path, e
            );
            continue;
        }
        debug!(
            "Evicted {} ({} bytes, last accessed {})",
            candidate.record.media_id, candidate.size, candidate.record.last_accessed
        );
        summary.bytes_freed += candidate.size;
        summary.evicted += 1;
    }

    info!(
        "Cache cleanup complete: evicted {} items, freed {} bytes",
        summary.evicted, summary.bytes_freed
    );
    Ok(summary)
}

fn collect_candidates(
    store: &dyn MetadataStore,
    policy: &EvictionPolicy,
    now: i64,
) -> Result<Vec<Candidate>> {
    let downloading: HashSet<String> = store.downloading_media_ids()?.into_iter().collect();
    let protection_secs = policy.protection_window.as_secs() as i64;

    let mut candidates = Vec::new();
    for record in store.all_downloads()? {
        if downloading.contains(&record.media_id) {
            continue;
        }
        let age = now - record.last_accessed;
        if age < protection_secs {
            continue;
        }

        let days_since_access = age as f64 / 86_400.0;
        let size_mb = record.byte_size as f64 / (1024.0 * 1024.0);

        let mut score = days_since_access;
        // Large files free more space per eviction, movies re-fetch cheaply.
        if size_mb > 1000.0 {
            score += 0.5;
        }
        if record.kind == MediaKind::Movie {
            score += 0.1;
        }

        candidates.push(Candidate {
            size: record.byte_size,
            record,
            score,
        });
    }
    Ok(candidates)
}
