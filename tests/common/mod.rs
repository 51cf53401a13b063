#![allow(dead_code)]

//! Shared end-to-end test harness: a mock upstream media server plus a fully
//! wired cache server on an ephemeral port.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use media_cache_server::cache_fs::eviction::EvictionPolicy;
use media_cache_server::config::{
    CacheConfig, Config, DownloadConfig, PredictionConfig, ServerConfig, UpstreamConfig,
};
use media_cache_server::download::DownloadQueuer;
use media_cache_server::server::{self, AppState};
use media_cache_server::store::MetadataStore;
use media_cache_server::upstream::UpstreamClient;
use media_cache_server::{
    CacheFilesystem, DownloadManager, HttpUpstreamClient, Predictor, ProgressBus, RateScheduler,
    SqliteMetadataStore,
};

/// Deterministic content: byte i equals i mod 256.
pub fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

/// How `/Videos/{id}/stream` behaves on the mock upstream.
#[derive(Clone)]
pub enum MediaBehavior {
    Bytes(Vec<u8>),
    Status(u16),
}

#[derive(Clone, Default)]
pub struct MockUpstream {
    items: Arc<Mutex<HashMap<String, serde_json::Value>>>,
    media: Arc<Mutex<HashMap<String, MediaBehavior>>>,
    stream_requests: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockUpstream {
    pub fn add_movie(&self, id: &str, name: &str, bytes: Vec<u8>) {
        self.items.lock().unwrap().insert(
            id.to_string(),
            json!({
                "Id": id,
                "Name": name,
                "Type": "Movie",
                "Container": "mp4",
                "Size": bytes.len(),
            }),
        );
        self.set_media(id, MediaBehavior::Bytes(bytes));
    }

    pub fn add_episode(&self, id: &str, series: &str, season: u32, episode: u32, bytes: Vec<u8>) {
        self.items.lock().unwrap().insert(
            id.to_string(),
            json!({
                "Id": id,
                "Name": format!("Episode {}", episode),
                "Type": "Episode",
                "SeriesId": series,
                "ParentIndexNumber": season,
                "IndexNumber": episode,
                "Container": "mkv",
                "Size": bytes.len(),
            }),
        );
        self.set_media(id, MediaBehavior::Bytes(bytes));
    }

    pub fn set_media(&self, id: &str, behavior: MediaBehavior) {
        self.media.lock().unwrap().insert(id.to_string(), behavior);
    }

    pub fn stream_request_count(&self, id: &str) -> usize {
        *self.stream_requests.lock().unwrap().get(id).unwrap_or(&0)
    }

    pub async fn spawn(self) -> String {
        let app = Router::new()
            .route("/System/Info", get(system_info))
            .route("/Users/{user}/Items/{id}", get(get_item))
            .route("/Shows/{series}/Episodes", get(list_episodes))
            .route("/Videos/{id}/stream", get(stream_video))
            .with_state(self);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }
}

async fn system_info() -> Json<serde_json::Value> {
    Json(json!({ "ServerName": "Mock Media Server", "Version": "10.0.0" }))
}

async fn get_item(
    State(state): State<MockUpstream>,
    Path((_user, id)): Path<(String, String)>,
) -> Response {
    match state.items.lock().unwrap().get(&id) {
        Some(item) => Json(item.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Deserialize)]
struct EpisodesQuery {
    #[serde(rename = "seasonNumber")]
    season_number: Option<u32>,
}

async fn list_episodes(
    State(state): State<MockUpstream>,
    Path(series): Path<String>,
    Query(query): Query<EpisodesQuery>,
) -> Json<serde_json::Value> {
    let items: Vec<serde_json::Value> = state
        .items
        .lock()
        .unwrap()
        .values()
        .filter(|item| {
            item["SeriesId"].as_str() == Some(series.as_str())
                && query
                    .season_number
                    .map(|season| item["ParentIndexNumber"].as_u64() == Some(season as u64))
                    .unwrap_or(true)
        })
        .cloned()
        .collect();
    Json(json!({ "Items": items }))
}

async fn stream_video(
    State(state): State<MockUpstream>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    *state
        .stream_requests
        .lock()
        .unwrap()
        .entry(id.clone())
        .or_insert(0) += 1;

    let behavior = state.media.lock().unwrap().get(&id).cloned();
    match behavior {
        None => StatusCode::NOT_FOUND.into_response(),
        Some(MediaBehavior::Status(code)) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
        Some(MediaBehavior::Bytes(bytes)) => serve_with_ranges(&bytes, &headers),
    }
}

/// Minimal single-range support, enough for the proxy-path tests.
fn serve_with_ranges(bytes: &[u8], headers: &HeaderMap) -> Response {
    let size = bytes.len() as u64;
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_simple_range);

    match range {
        Some((start, end)) if start < size => {
            let end = end.min(size - 1);
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, "video/mp4")
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_LENGTH, end - start + 1)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, size),
                )
                .body(Body::from(bytes[start as usize..=end as usize].to_vec()))
                .unwrap()
        }
        Some(_) => Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{}", size))
            .body(Body::empty())
            .unwrap(),
        None => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "video/mp4")
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CONTENT_LENGTH, size)
            .body(Body::from(bytes.to_vec()))
            .unwrap(),
    }
}

fn parse_simple_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = end.parse().unwrap_or(u64::MAX);
    Some((start, end))
}

pub struct TestServer {
    pub base_url: String,
    pub mock: MockUpstream,
    pub store: Arc<SqliteMetadataStore>,
    pub manager: Arc<DownloadManager>,
    pub cache_dir: std::path::PathBuf,
    cancel: CancellationToken,
    _dir: TempDir,
}

impl TestServer {
    /// Spin up the mock upstream and the full cache server stack.
    pub async fn spawn() -> TestServer {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with(tweak: impl FnOnce(&mut Config)) -> TestServer {
        let mock = MockUpstream::default();
        let upstream_url = mock.clone().spawn().await;

        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().join("cache");

        let mut config = Config {
            upstream: UpstreamConfig {
                server_url: upstream_url,
                api_key: "test-key".to_string(),
                user_id: "test-user".to_string(),
                timeout_secs: 5,
                retry_attempts: 3,
            },
            cache: CacheConfig {
                directory: cache_dir.clone(),
                ..CacheConfig::default()
            },
            download: DownloadConfig {
                workers: 2,
                retry_delay_ms: 300,
                rate_limit_mbps: 1000.0,
                ..DownloadConfig::default()
            },
            server: ServerConfig::default(),
            prediction: PredictionConfig::default(),
        };
        // Keep tests deterministic: no peak throttling, no implicit
        // priority-0 self-download on playback.
        config.download.rate_limit_schedule.peak_hours = String::new();
        config.download.auto_download_current = false;
        tweak(&mut config);

        std::fs::create_dir_all(&cache_dir).unwrap();
        let store = Arc::new(SqliteMetadataStore::new(cache_dir.join("media-cache.db")).unwrap());
        let fs = Arc::new(
            CacheFilesystem::new(&cache_dir, config.cache.temp_directory()).unwrap(),
        );
        let upstream = Arc::new(HttpUpstreamClient::new(&config.upstream).unwrap());
        let rate = Arc::new(RateScheduler::new(&config.download).unwrap());
        let progress = ProgressBus::new();

        let manager = DownloadManager::new(
            store.clone() as Arc<dyn MetadataStore>,
            fs.clone(),
            rate,
            upstream.clone() as Arc<dyn UpstreamClient>,
            progress.clone(),
            config.download.clone(),
            EvictionPolicy::from_config(&config.cache),
        )
        .unwrap();
        manager.start();

        let predictor = Predictor::new(
            store.clone() as Arc<dyn MetadataStore>,
            upstream.clone() as Arc<dyn UpstreamClient>,
            manager.clone() as Arc<dyn DownloadQueuer>,
            config.prediction.clone(),
            config.download.clone(),
            config.upstream.user_id.clone(),
        );

        let state = AppState::new(
            store.clone() as Arc<dyn MetadataStore>,
            fs,
            manager.clone(),
            predictor,
            upstream as Arc<dyn UpstreamClient>,
            progress,
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            let server_config = config.server.clone();
            tokio::spawn(async move {
                server::run(listener, state, &server_config, cancel)
                    .await
                    .unwrap();
            });
        }

        TestServer {
            base_url: format!("http://{}", addr),
            mock,
            store,
            manager,
            cache_dir,
            cancel,
            _dir: dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Poll until `predicate` holds or a generous deadline passes.
    pub async fn wait_until<F: Fn() -> bool>(&self, what: &str, predicate: F) {
        for _ in 0..300 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {}", what);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
