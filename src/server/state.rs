//! Shared state handed to every request handler.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::cache_fs::CacheFilesystem;
use crate::download::DownloadManager;
use crate::predictor::Predictor;
use crate::progress::ProgressBus;
use crate::store::MetadataStore;
use crate::upstream::UpstreamClient;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MetadataStore>,
    pub fs: Arc<CacheFilesystem>,
    pub manager: Arc<DownloadManager>,
    pub predictor: Arc<Predictor>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub progress: ProgressBus,
    /// Proxy client: connect timeout only, streamed bodies may run for hours.
    pub proxy_http: reqwest::Client,
    pub started: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        fs: Arc<CacheFilesystem>,
        manager: Arc<DownloadManager>,
        predictor: Arc<Predictor>,
        upstream: Arc<dyn UpstreamClient>,
        progress: ProgressBus,
    ) -> Result<Self> {
        let proxy_http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build proxy HTTP client")?;
        Ok(Self {
            store,
            fs,
            manager,
            predictor,
            upstream,
            progress,
            proxy_http,
            started: Instant::now(),
        })
    }
}
