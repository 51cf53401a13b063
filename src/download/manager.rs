//! Worker pool orchestration.
//!
//! One dispatcher claims queue items, N workers transfer bytes, one result
//! processor records outcomes. All authoritative state lives in the metadata
//! store; the only things owned here are the channels between the tasks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use futures::StreamExt;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache_fs::eviction::{self, EvictionPolicy};
use crate::cache_fs::CacheFilesystem;
use crate::config::DownloadConfig;
use crate::progress::{ProgressBus, ProgressEvent};
use crate::rate::RateScheduler;
use crate::store::{
    DownloadRecord, EnqueueOutcome, MediaKind, MetadataStore, QueueItem,
};
use crate::upstream::UpstreamClient;

use super::retry::{DownloadError, RetryPolicy};
use super::DownloadQueuer;

/// How long the dispatcher waits for a free worker slot before giving the
/// tick up. Claims happen only after a slot is reserved, so the claim count
/// can never exceed free capacity.
const SLOT_WAIT: Duration = Duration::from_millis(500);

/// Dispatcher scan interval; an enqueue also wakes it immediately.
const SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Publish a progress event roughly every this many bytes.
const PROGRESS_STRIDE: u64 = 4 * 1024 * 1024;

/// Total time allowed for in-flight work to wind down on stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

struct CompletedTransfer {
    kind: MediaKind,
    local_path: PathBuf,
    bytes: u64,
    checksum: String,
}

struct JobResult {
    item: QueueItem,
    outcome: Result<CompletedTransfer, DownloadError>,
}

pub struct DownloadManager {
    store: Arc<dyn MetadataStore>,
    fs: Arc<CacheFilesystem>,
    rate: Arc<RateScheduler>,
    upstream: Arc<dyn UpstreamClient>,
    progress: ProgressBus,
    config: DownloadConfig,
    retry_policy: RetryPolicy,
    eviction: EvictionPolicy,
    http: reqwest::Client,
    wakeup: Arc<Notify>,
    cancel: CancellationToken,
    running: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        fs: Arc<CacheFilesystem>,
        rate: Arc<RateScheduler>,
        upstream: Arc<dyn UpstreamClient>,
        progress: ProgressBus,
        config: DownloadConfig,
        eviction: EvictionPolicy,
    ) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build download HTTP client")?;
        let retry_policy = RetryPolicy::from_config(&config);
        Ok(Arc::new(Self {
            store,
            fs,
            rate,
            upstream,
            progress,
            config,
            retry_policy,
            eviction,
            http,
            wakeup: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        }))
    }

    pub fn worker_count(&self) -> usize {
        self.config.workers
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the dispatcher, workers, and result processor.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Download manager already running");
            return;
        }

        info!(
            "Starting download manager with {} workers, {} Mbps rate limit",
            self.config.workers, self.config.rate_limit_mbps
        );

        let (jobs_tx, jobs_rx) = mpsc::channel::<QueueItem>(self.config.workers);
        let (results_tx, results_rx) = mpsc::channel::<JobResult>(self.config.workers * 2);
        let jobs_rx = Arc::new(tokio::sync::Mutex::new(jobs_rx));

        let mut tasks = self.tasks.lock().unwrap();

        for worker_id in 0..self.config.workers {
            let manager = self.clone();
            let jobs_rx = jobs_rx.clone();
            let results_tx = results_tx.clone();
            tasks.push(tokio::spawn(async move {
                manager.worker_loop(worker_id, jobs_rx, results_tx).await;
            }));
        }
        drop(results_tx);

        let manager = self.clone();
        tasks.push(tokio::spawn(async move {
            manager.dispatch_loop(jobs_tx).await;
        }));

        let manager = self.clone();
        tasks.push(tokio::spawn(async move {
            manager.result_loop(results_rx).await;
        }));
    }

    /// Stop claiming, cancel in-flight transfers, and wait for every task,
    /// bounded by the shutdown grace.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping download manager");
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!("Task did not stop within the shutdown grace, aborting");
                task.abort();
            }
        }
        info!("Download manager stopped");
    }

    // === Dispatcher ===

    async fn dispatch_loop(self: Arc<Self>, jobs_tx: mpsc::Sender<QueueItem>) {
        let mut ticker = tokio::time::interval(SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = ticker.tick() => {}
            }
            self.dispatch_ready(&jobs_tx).await;
        }
        debug!("Dispatcher exited");
    }

    async fn dispatch_ready(&self, jobs_tx: &mpsc::Sender<QueueItem>) {
        loop {
            // Reserve a worker slot before touching the queue: a claimed item
            // always has somewhere to go.
            let permit = match tokio::time::timeout(SLOT_WAIT, jobs_tx.reserve()).await {
                Ok(Ok(permit)) => permit,
                _ => return,
            };

            match self.store.claim_next_queued(Utc::now().timestamp_millis()) {
                Ok(Some(item)) => {
                    debug!(
                        "Dispatching job {} for {} at priority {}",
                        item.job_id, item.media_id, item.priority
                    );
                    permit.send(item);
                }
                Ok(None) => return,
                Err(e) => {
                    // Store trouble pauses claiming; the next tick retries.
                    error!("Metadata store unavailable, pausing claims: {:#}", e);
                    return;
                }
            }
        }
    }

    // === Workers ===

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        jobs_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueItem>>>,
        results_tx: mpsc::Sender<JobResult>,
    ) {
        debug!("Worker {} started", worker_id);
        loop {
            let job = {
                let mut rx = jobs_rx.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    job = rx.recv() => job,
                }
            };
            let Some(item) = job else { break };

            info!(
                "Worker {} downloading {} (job {}, priority {})",
                worker_id, item.media_id, item.job_id, item.priority
            );
            let outcome = self.process_job(&item).await;
            if results_tx.send(JobResult { item, outcome }).await.is_err() {
                break;
            }
        }
        debug!("Worker {} exited", worker_id);
    }

    async fn process_job(&self, item: &QueueItem) -> Result<CompletedTransfer, DownloadError> {
        self.progress.publish(ProgressEvent::download(
            &item.media_id,
            0.0,
            "downloading",
            "Download started",
        ));

        let meta = self.resolve_metadata(&item.media_id).await?;

        let url = match &item.url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => self.upstream.stream_url(&item.media_id),
        };

        let local_path = match &item.local_path {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => {
                let filename = format!(
                    "{}.{}",
                    if meta.name.is_empty() {
                        &item.media_id
                    } else {
                        &meta.name
                    },
                    meta.container.as_deref().unwrap_or("mp4")
                );
                self.fs
                    .reserve_path(
                        meta.kind,
                        &item.media_id,
                        meta.series_id.as_deref(),
                        meta.season,
                        meta.episode,
                        &filename,
                    )
                    .map_err(|e| DownloadError::Storage(format!("{:#}", e)))?
            }
        };

        // Persist the resolved fields so a retry does not repeat the lookups.
        let mut resolved = item.clone();
        resolved.url = Some(url.clone());
        resolved.local_path = Some(local_path.to_string_lossy().into_owned());
        if let Err(e) = self.store.update_queue(&resolved) {
            warn!("Failed to persist resolved job fields: {:#}", e);
        }

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status.as_u16()));
        }

        let total = response.content_length().unwrap_or(meta.byte_size);
        let limiter = self
            .rate
            .limiter_for(item.priority, Local::now().time());

        let downloaded = Arc::new(AtomicU64::new(0));
        let last_published = Arc::new(AtomicU64::new(0));
        let progress = self.progress.clone();
        let media_id = item.media_id.clone();

        let stream = response.bytes_stream().then(move |chunk| {
            let limiter = limiter.clone();
            let progress = progress.clone();
            let downloaded = downloaded.clone();
            let last_published = last_published.clone();
            let media_id = media_id.clone();
            async move {
                if let Ok(bytes) = &chunk {
                    if let Some(bucket) = &limiter {
                        bucket.acquire(bytes.len()).await;
                    }
                    let done = downloaded.fetch_add(bytes.len() as u64, Ordering::Relaxed)
                        + bytes.len() as u64;
                    if total > 0 && done - last_published.load(Ordering::Relaxed) >= PROGRESS_STRIDE
                    {
                        last_published.store(done, Ordering::Relaxed);
                        let fraction = (done as f64 / total as f64 * 100.0).min(99.0);
                        progress.publish(ProgressEvent::download(
                            &media_id,
                            fraction,
                            "downloading",
                            format!("{} of {} bytes", done, total),
                        ));
                    }
                }
                chunk.map_err(std::io::Error::other)
            }
        });
        let reader = StreamReader::new(stream.boxed());

        // Dropping the write future on cancellation removes the temp file.
        let write = self.fs.atomic_write(&local_path, reader);
        let (bytes, checksum) = tokio::select! {
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            result = write => result.map_err(|e| DownloadError::Storage(format!("{:#}", e)))?,
        };

        if let Some(expected) = &item.expected_checksum {
            if !expected.is_empty() && !expected.eq_ignore_ascii_case(&checksum) {
                let _ = self.fs.delete(&local_path);
                return Err(DownloadError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual: checksum,
                });
            }
        }

        Ok(CompletedTransfer {
            kind: meta.kind,
            local_path,
            bytes,
            checksum,
        })
    }

    /// Metadata from the store, falling back to the upstream and caching the
    /// answer on observation.
    async fn resolve_metadata(
        &self,
        media_id: &str,
    ) -> Result<crate::store::MediaMetadata, DownloadError> {
        match self.store.get_metadata(media_id) {
            Ok(Some(meta)) => return Ok(meta),
            Ok(None) => {}
            Err(e) => return Err(DownloadError::Other(format!("{:#}", e))),
        }
        let meta = self
            .upstream
            .get_item(media_id)
            .await
            .map_err(DownloadError::from_upstream)?;
        if let Err(e) = self.store.put_metadata(&meta) {
            warn!("Failed to cache metadata for {}: {:#}", media_id, e);
        }
        Ok(meta)
    }

    // === Result processing ===

    async fn result_loop(self: Arc<Self>, mut results_rx: mpsc::Receiver<JobResult>) {
        while let Some(result) = results_rx.recv().await {
            self.handle_result(result).await;
        }
        debug!("Result processor exited");
    }

    async fn handle_result(&self, result: JobResult) {
        let item = result.item;
        match result.outcome {
            Ok(transfer) => self.handle_success(item, transfer),
            Err(DownloadError::Cancelled) => {
                debug!("Job {} cancelled, releasing claim", item.job_id);
                if let Err(e) = self.store.release_claim(&item.job_id) {
                    error!("Failed to release cancelled job {}: {:#}", item.job_id, e);
                }
            }
            Err(error) => self.handle_failure(item, error),
        }
    }

    fn handle_success(&self, item: QueueItem, transfer: CompletedTransfer) {
        let now = Utc::now().timestamp();
        let record = DownloadRecord {
            job_id: item.job_id.clone(),
            media_id: item.media_id.clone(),
            kind: transfer.kind,
            local_path: transfer.local_path.to_string_lossy().into_owned(),
            byte_size: transfer.bytes,
            downloaded_at: now,
            last_accessed: now,
            priority: item.priority,
            checksum: Some(transfer.checksum),
        };

        if let Err(e) = self.store.put_download(&record) {
            error!("Failed to store download record for {}: {:#}", item.media_id, e);
            return;
        }
        if let Err(e) = self.store.delete_queue(&item.job_id) {
            error!("Failed to dequeue completed job {}: {:#}", item.job_id, e);
        }

        info!(
            "Download completed: {} ({} bytes)",
            item.media_id, transfer.bytes
        );
        self.progress.publish(ProgressEvent::download(
            &item.media_id,
            100.0,
            "completed",
            "Download completed",
        ));

        match eviction::cleanup(
            self.store.as_ref(),
            &self.fs,
            &self.eviction,
            Utc::now().timestamp(),
        ) {
            Ok(summary) if summary.evicted > 0 => {
                info!(
                    "Evicted {} items ({} bytes) after download",
                    summary.evicted, summary.bytes_freed
                );
            }
            Ok(_) => {}
            Err(e) => warn!("Cache cleanup failed: {:#}", e),
        }
    }

    fn handle_failure(&self, item: QueueItem, error: DownloadError) {
        warn!(
            "Download failed for {} (job {}, attempt {}): {}",
            item.media_id,
            item.job_id,
            item.retry_count + 1,
            error
        );

        if self.retry_policy.should_retry(&error, item.retry_count) {
            let delay = self.retry_policy.backoff_delay(item.retry_count + 1);
            let not_before = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            if let Err(e) =
                self.store
                    .requeue_with_backoff(&item.job_id, not_before, &error.to_string())
            {
                error!("Failed to requeue job {}: {:#}", item.job_id, e);
                return;
            }
            self.progress.publish(ProgressEvent::download(
                &item.media_id,
                0.0,
                "queued",
                format!("Retrying in {:.1}s: {}", delay.as_secs_f64(), error),
            ));

            // Wake the dispatcher once the backoff expires so short delays
            // are honoured without waiting for the next scan tick.
            let cancel = self.cancel.clone();
            let wakeup = self.wakeup.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => wakeup.notify_one(),
                }
            });
        } else {
            if let Err(e) = self.store.mark_failed(&item.job_id, &error.to_string()) {
                error!("Failed to mark job {} failed: {:#}", item.job_id, e);
            }
            self.progress.publish(ProgressEvent::download(
                &item.media_id,
                0.0,
                "failed",
                error.to_string(),
            ));
        }
    }
}

impl DownloadQueuer for DownloadManager {
    fn queue_download(&self, media_id: &str, priority: u8) -> Result<EnqueueOutcome> {
        let outcome = self
            .store
            .add_if_absent(media_id, priority, Utc::now().timestamp_millis())?;
        match &outcome {
            EnqueueOutcome::Inserted { job_id } => {
                debug!("Queued {} at priority {} (job {})", media_id, priority, job_id);
            }
            EnqueueOutcome::Promoted { job_id } => {
                debug!("Promoted {} to priority {} (job {})", media_id, priority, job_id);
            }
            EnqueueOutcome::Unchanged { .. } => {}
        }
        self.wakeup.notify_one();
        Ok(outcome)
    }
}
