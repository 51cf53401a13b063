//! Viewing-pattern analysis and predictive queueing.
//!
//! Two entrypoints: `on_playback_start` reacts synchronously to a playback
//! event (queue the next episode), `predict` runs periodically and derives
//! prioritised candidates from viewing history. Candidate episodes are always
//! resolved to real catalogue ids before they are queued; a guessed id never
//! reaches a worker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DownloadConfig, PredictionConfig};
use crate::download::DownloadQueuer;
use crate::store::{MediaKind, MediaMetadata, MetadataStore, ViewingSession};
use crate::upstream::UpstreamClient;

const SECONDS_PER_DAY: i64 = 86_400;
/// Only series watched this recently yield continue-watching candidates.
const CONTINUE_WINDOW_DAYS: i64 = 30;
const MAX_PREDICTIONS: usize = 10;

/// Derived viewing preferences, recomputed from history on every cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserPreferences {
    /// Fraction of sessions watched to completion.
    pub completion_rate: f64,
    /// Episodes per active day, averaged over series.
    pub binge_rate: f64,
    /// Hours of day with at least twice the mean session count.
    pub preferred_start_hours: Vec<u32>,
    pub prefers_binge: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub media_id: String,
    pub priority: u8,
    pub confidence: f64,
    pub reason: String,
    pub series_id: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

#[derive(Debug, Default)]
struct SeriesProgress {
    last_season: u32,
    last_episode: u32,
    last_watched: i64,
    total_watched: u32,
    completed_episodes: u32,
}

struct PredictorState {
    history: Vec<ViewingSession>,
    preferences: UserPreferences,
    last_sync: Option<tokio::time::Instant>,
}

pub struct Predictor {
    store: Arc<dyn MetadataStore>,
    upstream: Arc<dyn UpstreamClient>,
    queue: Arc<dyn DownloadQueuer>,
    config: PredictionConfig,
    download_config: DownloadConfig,
    user_id: String,
    state: tokio::sync::Mutex<PredictorState>,
}

impl Predictor {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        upstream: Arc<dyn UpstreamClient>,
        queue: Arc<dyn DownloadQueuer>,
        config: PredictionConfig,
        download_config: DownloadConfig,
        user_id: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            upstream,
            queue,
            config,
            download_config,
            user_id: user_id.into(),
            state: tokio::sync::Mutex::new(PredictorState {
                history: Vec::new(),
                preferences: UserPreferences::default(),
                last_sync: None,
            }),
        })
    }

    pub async fn preferences(&self) -> UserPreferences {
        self.state.lock().await.preferences.clone()
    }

    /// React to a playback start: record the session and queue what the user
    /// will most plausibly watch next. Fast path, called from the streaming
    /// handler.
    pub async fn on_playback_start(&self, media_id: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        let meta = self.observe_metadata(media_id).await;

        let session = ViewingSession {
            media_id: media_id.to_string(),
            kind: meta.as_ref().map(|m| m.kind).unwrap_or(MediaKind::Movie),
            series_id: meta.as_ref().and_then(|m| m.series_id.clone()),
            season: meta.as_ref().and_then(|m| m.season),
            episode: meta.as_ref().and_then(|m| m.episode),
            start_time: now,
            end_time: None,
            completed: false,
        };
        self.store.append_history(&self.user_id, &session)?;

        if self.download_config.auto_download_current
            && self.store.find_download(media_id)?.is_none()
        {
            self.queue.queue_download(media_id, 0)?;
        }

        let Some(meta) = meta else { return Ok(()) };
        if !self.download_config.auto_download_next || meta.kind != MediaKind::Episode {
            return Ok(());
        }
        let (Some(series_id), Some(season), Some(episode)) =
            (meta.series_id.as_deref(), meta.season, meta.episode)
        else {
            return Ok(());
        };

        self.queue_next_episodes(series_id, season, episode).await
    }

    async fn queue_next_episodes(
        &self,
        series_id: &str,
        season: u32,
        episode: u32,
    ) -> Result<()> {
        let next = self.resolve_episode(series_id, season, episode + 1).await;

        match next {
            Some(next) => {
                if self
                    .store
                    .get_download(MediaKind::Episode, &next.media_id)?
                    .is_none()
                {
                    info!(
                        "Queueing next episode {} (S{:02}E{:02}) at priority 1",
                        next.media_id,
                        season,
                        episode + 1
                    );
                    self.queue.queue_download(&next.media_id, 1)?;
                }
            }
            None => {
                // End of season: line up the next season opener, one notch
                // lower.
                if let Some(opener) = self.resolve_episode(series_id, season + 1, 1).await {
                    if self
                        .store
                        .get_download(MediaKind::Episode, &opener.media_id)?
                        .is_none()
                    {
                        info!(
                            "Queueing season {} opener {} at priority 2",
                            season + 1,
                            opener.media_id
                        );
                        self.queue.queue_download(&opener.media_id, 2)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Periodic prediction cycle. Returns candidates ordered by (priority,
    /// confidence); the caller queues them.
    pub async fn predict(&self) -> Result<Vec<Prediction>> {
        let now = Utc::now().timestamp();
        let mut state = self.state.lock().await;

        let stale = state
            .last_sync
            .map(|t| t.elapsed() >= self.config.sync_interval())
            .unwrap_or(true);
        if stale {
            let since = now - self.config.history_days as i64 * SECONDS_PER_DAY;
            state.history = self.store.get_history(&self.user_id, since)?;
            state.last_sync = Some(tokio::time::Instant::now());
            debug!(
                "Refreshed viewing history: {} sessions",
                state.history.len()
            );
        }

        let preferences = compute_preferences(&state.history);
        let progress = series_progress(&state.history);
        state.preferences = preferences.clone();
        drop(state);

        let mut predictions = Vec::new();
        let cutoff = now - CONTINUE_WINDOW_DAYS * SECONDS_PER_DAY;

        for (series_id, progress) in &progress {
            if progress.last_watched < cutoff || progress.completed_episodes == 0 {
                continue;
            }
            let confidence = continue_confidence(progress, now);
            let Some(next) = self
                .resolve_episode(series_id, progress.last_season, progress.last_episode + 1)
                .await
            else {
                continue;
            };
            if self.store.find_download(&next.media_id)?.is_some() {
                continue;
            }
            predictions.push(Prediction {
                media_id: next.media_id.clone(),
                priority: 1,
                confidence,
                reason: "Next episode in partially watched series".to_string(),
                series_id: Some(series_id.clone()),
                season: next.season,
                episode: next.episode,
            });

            if preferences.prefers_binge {
                let ahead = if preferences.binge_rate > 3.0 { 3 } else { 2 };
                let ahead = ahead.min(self.download_config.auto_download_count);
                for offset in 0..ahead {
                    let episode = progress.last_episode + 2 + offset;
                    let Some(meta) = self
                        .resolve_episode(series_id, progress.last_season, episode)
                        .await
                    else {
                        break;
                    };
                    if self.store.find_download(&meta.media_id)?.is_some() {
                        continue;
                    }
                    predictions.push(Prediction {
                        media_id: meta.media_id.clone(),
                        priority: 2,
                        confidence: confidence * 0.7,
                        reason: "Upcoming episode for binge watcher".to_string(),
                        series_id: Some(series_id.clone()),
                        season: meta.season,
                        episode: meta.episode,
                    });
                }
            }
        }

        predictions.retain(|p| p.confidence >= self.config.min_confidence);
        predictions.sort_by(|a, b| {
            a.priority.cmp(&b.priority).then(
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        predictions.truncate(MAX_PREDICTIONS);

        info!("Prediction cycle produced {} candidates", predictions.len());
        Ok(predictions)
    }

    /// Run prediction cycles until cancelled, queueing each candidate.
    /// Failures are logged; the next cycle always runs.
    pub async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sync_interval());
        // The immediate first tick would predict from an empty process; skip it.
        ticker.tick().await;
        info!(
            "Prediction loop started (interval {}s)",
            self.config.sync_interval_secs
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.predict().await {
                Ok(predictions) => {
                    for prediction in predictions {
                        if let Err(e) = self
                            .queue
                            .queue_download(&prediction.media_id, prediction.priority)
                        {
                            warn!(
                                "Failed to queue prediction {}: {:#}",
                                prediction.media_id, e
                            );
                        }
                    }
                }
                Err(e) => warn!("Prediction cycle failed: {:#}", e),
            }
        }
        info!("Prediction loop stopped");
    }

    /// Metadata from the store, refreshed from the upstream when unknown so
    /// later cycles can resolve real episode ids.
    async fn observe_metadata(&self, media_id: &str) -> Option<MediaMetadata> {
        match self.store.get_metadata(media_id) {
            Ok(Some(meta)) => return Some(meta),
            Ok(None) => {}
            Err(e) => {
                warn!("Metadata lookup failed for {}: {:#}", media_id, e);
                return None;
            }
        }
        match self.upstream.get_item(media_id).await {
            Ok(meta) => {
                if let Err(e) = self.store.put_metadata(&meta) {
                    warn!("Failed to cache metadata for {}: {:#}", media_id, e);
                }
                Some(meta)
            }
            Err(e) => {
                debug!("Upstream metadata lookup failed for {}: {}", media_id, e);
                None
            }
        }
    }

    /// Find the real id of an episode, store first, then the upstream season
    /// listing (cached on observation). `None` means the episode does not
    /// exist anywhere we can see.
    async fn resolve_episode(
        &self,
        series_id: &str,
        season: u32,
        episode: u32,
    ) -> Option<MediaMetadata> {
        match self.store.list_series_episodes(series_id, season) {
            Ok(episodes) => {
                if let Some(found) = episodes.into_iter().find(|e| e.episode == Some(episode)) {
                    return Some(found);
                }
            }
            Err(e) => {
                warn!("Episode listing failed for {}: {:#}", series_id, e);
                return None;
            }
        }
        match self.upstream.list_season(series_id, season).await {
            Ok(episodes) => {
                for meta in &episodes {
                    if let Err(e) = self.store.put_metadata(meta) {
                        warn!("Failed to cache episode metadata: {:#}", e);
                    }
                }
                episodes.into_iter().find(|e| e.episode == Some(episode))
            }
            Err(e) => {
                debug!(
                    "Upstream season listing failed for {} S{}: {}",
                    series_id, season, e
                );
                None
            }
        }
    }
}

fn series_progress(history: &[ViewingSession]) -> HashMap<String, SeriesProgress> {
    let mut progress: HashMap<String, SeriesProgress> = HashMap::new();
    for session in history {
        if session.kind != MediaKind::Episode {
            continue;
        }
        let Some(series_id) = &session.series_id else { continue };
        let entry = progress.entry(series_id.clone()).or_default();
        entry.last_watched = entry.last_watched.max(session.start_time);
        entry.total_watched += 1;
        if session.completed {
            entry.completed_episodes += 1;
        }
        let season = session.season.unwrap_or(0);
        let episode = session.episode.unwrap_or(0);
        if season > entry.last_season
            || (season == entry.last_season && episode > entry.last_episode)
        {
            entry.last_season = season;
            entry.last_episode = episode;
        }
    }
    progress
}

fn continue_confidence(progress: &SeriesProgress, now: i64) -> f64 {
    let mut confidence = 0.5;

    let days_since = (now - progress.last_watched) as f64 / SECONDS_PER_DAY as f64;
    if days_since < 7.0 {
        confidence += 0.3;
    } else if days_since < 30.0 {
        confidence += 0.2;
    }

    if progress.total_watched > 0 {
        confidence += 0.2 * progress.completed_episodes as f64 / progress.total_watched as f64;
    }
    if progress.total_watched > 3 {
        confidence += 0.1;
    }

    confidence.min(1.0)
}

fn compute_preferences(history: &[ViewingSession]) -> UserPreferences {
    if history.is_empty() {
        return UserPreferences::default();
    }

    let total = history.len() as f64;
    let completed = history.iter().filter(|s| s.completed).count() as f64;

    // Episodes per unique viewing day, summed across series.
    let mut series_days: HashMap<&str, HashSet<i64>> = HashMap::new();
    let mut series_episodes: HashMap<&str, u32> = HashMap::new();
    for session in history {
        let Some(series_id) = session.series_id.as_deref() else { continue };
        series_days
            .entry(series_id)
            .or_default()
            .insert(session.start_time / SECONDS_PER_DAY);
        *series_episodes.entry(series_id).or_default() += 1;
    }
    let total_days: usize = series_days.values().map(HashSet::len).sum();
    let total_episodes: u32 = series_episodes.values().sum();
    let binge_rate = if total_days > 0 {
        total_episodes as f64 / total_days as f64
    } else {
        0.0
    };

    let mut hour_counts = [0u32; 24];
    for session in history {
        let hour = (session.start_time.rem_euclid(SECONDS_PER_DAY) / 3600) as usize;
        hour_counts[hour.min(23)] += 1;
    }
    let mean = total / 24.0;
    let preferred_start_hours: Vec<u32> = (0..24u32)
        .filter(|&h| hour_counts[h as usize] as f64 > 2.0 * mean)
        .collect();

    // Same-series sessions on the same day signal bingeing.
    let mut binge_pairs = 0usize;
    for pair in history.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if a.series_id.is_some()
            && a.series_id == b.series_id
            && a.start_time / SECONDS_PER_DAY == b.start_time / SECONDS_PER_DAY
        {
            binge_pairs += 1;
        }
    }
    let prefers_binge = binge_pairs as f64 / total > 0.3;

    UserPreferences {
        completion_rate: completed / total,
        binge_rate,
        preferred_start_hours,
        prefers_binge,
    }
}
