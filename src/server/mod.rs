//! HTTP surface: health, status, library and queue APIs, range streaming,
//! and the progress WebSocket.

mod handlers;
pub mod state;
mod stream;
mod websocket;

pub use state::AppState;
pub use stream::ByteRange;

use anyhow::Result;
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::config::ServerConfig;

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = std::time::Instant::now();
    let response = next.run(request).await;
    debug!(
        "{} {} -> {} ({} ms)",
        method,
        path,
        response.status().as_u16(),
        start.elapsed().as_millis()
    );
    response
}

pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let mut api = Router::new()
        .route("/status", get(handlers::api_status))
        .route("/library", get(handlers::api_library))
        .route("/queue", get(handlers::api_queue))
        .route("/queue/add", post(handlers::api_queue_add))
        .route("/queue/{job_id}", delete(handlers::api_queue_delete));
    if config.enable_compression {
        api = api.layer(CompressionLayer::new());
    }

    // Streaming routes stay outside the compression layer; re-encoding media
    // bodies would break range semantics.
    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api)
        .route("/stream/{media_id}", get(stream::stream_media))
        .route("/ws/progress", get(websocket::ws_progress))
        .layer(middleware::from_fn(log_requests))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the cancellation token fires, then finish in-flight responses
/// and refuse new ones.
pub async fn run(
    listener: TcpListener,
    state: AppState,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let router = build_router(state, config);
    let addr = listener.local_addr()?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!("HTTP server stopped");
    Ok(())
}
