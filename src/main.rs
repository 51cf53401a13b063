use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use media_cache_server::cache_fs::eviction::{self, EvictionPolicy};
use media_cache_server::download::DownloadQueuer;
use media_cache_server::progress::ProgressEvent;
use media_cache_server::server::{self, AppState};
use media_cache_server::store::MetadataStore;
use media_cache_server::upstream::UpstreamClient;
use media_cache_server::{
    CacheFilesystem, Config, DownloadManager, HttpUpstreamClient, Predictor, ProgressBus,
    RateScheduler, SqliteMetadataStore,
};

const DB_FILENAME: &str = "media-cache.db";
const TEMP_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Parser, Debug)]
#[command(version, about = "Predictive local cache for a remote media server")]
struct CliArgs {
    /// Path to the TOML configuration file.
    #[clap(default_value = "config.toml")]
    pub config: PathBuf,

    /// Override the configured listen port.
    #[clap(short, long)]
    pub port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let mut config = Config::load(&cli_args.config)
        .with_context(|| format!("Invalid configuration {:?}", cli_args.config))?;
    if let Some(port) = cli_args.port {
        config.server.port = port;
    }

    info!("Opening metadata store in {:?}...", config.cache.directory);
    std::fs::create_dir_all(&config.cache.directory)
        .with_context(|| format!("Failed to create {:?}", config.cache.directory))?;
    let store = Arc::new(SqliteMetadataStore::new(
        config.cache.directory.join(DB_FILENAME),
    )?);
    let fs = Arc::new(CacheFilesystem::new(
        &config.cache.directory,
        config.cache.temp_directory(),
    )?);

    // Startup hygiene: stale temp files go, records without bytes go.
    fs.sweep_temp(TEMP_MAX_AGE)?;
    let reconciled = eviction::reconcile(store.as_ref(), fs.as_ref())?;
    if reconciled > 0 {
        warn!("Removed {} download records with missing files", reconciled);
    }

    let upstream = Arc::new(HttpUpstreamClient::new(&config.upstream)?);
    match upstream.get_system_info().await {
        Ok(info_) => info!(
            "Connected to upstream {} ({})",
            info_.server_name, info_.version
        ),
        Err(e) => warn!("Upstream not reachable at startup: {}", e),
    }

    let rate = Arc::new(RateScheduler::new(&config.download)?);
    let progress = ProgressBus::new();
    let manager = DownloadManager::new(
        store.clone() as Arc<dyn MetadataStore>,
        fs.clone(),
        rate,
        upstream.clone() as Arc<dyn UpstreamClient>,
        progress.clone(),
        config.download.clone(),
        EvictionPolicy::from_config(&config.cache),
    )?;
    manager.start();

    let predictor = Predictor::new(
        store.clone() as Arc<dyn MetadataStore>,
        upstream.clone() as Arc<dyn UpstreamClient>,
        manager.clone() as Arc<dyn DownloadQueuer>,
        config.prediction.clone(),
        config.download.clone(),
        config.upstream.user_id.clone(),
    );

    let cancel = CancellationToken::new();

    if config.prediction.enabled {
        tokio::spawn(predictor.clone().run_loop(cancel.clone()));
    } else {
        info!("Prediction disabled by configuration");
    }

    // Recurring temp sweep, same cadence as the retention threshold.
    {
        let fs = fs.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TEMP_MAX_AGE);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = fs.sweep_temp(TEMP_MAX_AGE) {
                    error!("Temp sweep failed: {:#}", e);
                }
            }
        });
    }

    let state = AppState::new(
        store.clone() as Arc<dyn MetadataStore>,
        fs,
        manager.clone(),
        predictor,
        upstream as Arc<dyn UpstreamClient>,
        progress.clone(),
    )?;

    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .with_context(|| {
            format!(
                "Failed to bind {}:{}",
                config.server.host, config.server.port
            )
        })?;

    {
        let cancel = cancel.clone();
        let progress = progress.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                progress.publish(ProgressEvent::shutting_down());
                cancel.cancel();
            }
        });
    }

    info!(
        "Ready to serve at {}:{}",
        config.server.host, config.server.port
    );
    server::run(listener, state, &config.server, cancel.clone()).await?;

    manager.stop().await;
    info!("Shutdown complete");
    Ok(())
}
