//! JSON API handlers: health, status, library, and queue management.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::download::DownloadQueuer;
use crate::store::MediaKind;

use super::state::AppState;

const DEFAULT_PAGE_LIMIT: usize = 50;
const MAX_PAGE_LIMIT: usize = 100;
const DEFAULT_QUEUE_PRIORITY: u8 = 5;
const MAX_PRIORITY: u8 = 5;

/// Error body shape shared by every endpoint: a machine-readable kind and a
/// human message, never stack frames.
pub fn error_response(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "error": kind, "message": message.into() })),
    )
        .into_response()
}

fn store_unavailable(context: &str, err: anyhow::Error) -> Response {
    warn!("Store unavailable during {}: {:#}", context, err);
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "store_unavailable",
        "metadata store is unavailable",
    )
}

/// `GET /health`: 200 when the metadata store answers.
pub async fn health(State(state): State<AppState>) -> Response {
    match state.store.cache_size() {
        Ok(_) => (StatusCode::OK, "OK").into_response(),
        Err(e) => store_unavailable("health check", e),
    }
}

#[derive(Serialize)]
struct StatusBody {
    running: bool,
    workers: usize,
    cache_size_bytes: u64,
    cached_items: u64,
    queue_length: u64,
    active_downloads: u64,
}

/// `GET /api/status`.
pub async fn api_status(State(state): State<AppState>) -> Response {
    let cache_size = match state.store.cache_size() {
        Ok(size) => size,
        Err(e) => return store_unavailable("status", e),
    };
    let cached_items = state.store.count_downloads().unwrap_or(0);
    let counts = state.store.queue_counts().unwrap_or_default();

    Json(StatusBody {
        running: state.manager.is_running(),
        workers: state.manager.worker_count(),
        cache_size_bytes: cache_size,
        cached_items,
        queue_length: counts.queued,
        active_downloads: counts.downloading,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct LibraryQuery {
    kind: Option<String>,
    page: Option<usize>,
    limit: Option<usize>,
}

/// `GET /api/library?kind=&page=&limit=`.
pub async fn api_library(
    State(state): State<AppState>,
    Query(query): Query<LibraryQuery>,
) -> Response {
    let kind = match &query.kind {
        None => None,
        Some(raw) if raw.is_empty() => None,
        Some(raw) => match MediaKind::from_str(raw) {
            Some(kind) => Some(kind),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_kind",
                    format!("unknown media kind: {:?}", raw),
                )
            }
        },
    };

    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_PAGE_LIMIT);
    let page = query.page.unwrap_or(1).max(1);
    let offset = (page - 1) * limit;

    match state.store.list_downloads(kind, limit, offset) {
        Ok(items) => Json(json!({
            "items": items,
            "page": page,
            "limit": limit,
        }))
        .into_response(),
        Err(e) => store_unavailable("library listing", e),
    }
}

/// `GET /api/queue`.
pub async fn api_queue(State(state): State<AppState>) -> Response {
    match state.store.list_queue() {
        Ok(items) => Json(items).into_response(),
        Err(e) => store_unavailable("queue listing", e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AddQueueBody {
    media_id: Option<String>,
    priority: Option<u8>,
}

/// `POST /api/queue/add`.
pub async fn api_queue_add(
    State(state): State<AppState>,
    Json(body): Json<AddQueueBody>,
) -> Response {
    let media_id = match body.media_id.as_deref() {
        Some(id) if !id.is_empty() => id,
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "missing_media_id",
                "media_id is required",
            )
        }
    };
    let priority = body.priority.unwrap_or(DEFAULT_QUEUE_PRIORITY);
    if priority > MAX_PRIORITY {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_priority",
            "priority must be in 0..=5",
        );
    }

    match state.manager.queue_download(media_id, priority) {
        Ok(outcome) => (
            StatusCode::CREATED,
            Json(json!({
                "job_id": outcome.job_id(),
                "media_id": media_id,
                "priority": priority,
            })),
        )
            .into_response(),
        Err(e) => store_unavailable("enqueue", e),
    }
}

/// `DELETE /api/queue/{job_id}`.
pub async fn api_queue_delete(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    match state.store.get_queue(&job_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("no queue item {}", job_id),
            )
        }
        Err(e) => return store_unavailable("queue delete", e),
    }
    match state.store.delete_queue(&job_id) {
        Ok(()) => (StatusCode::OK, Json(json!({ "removed": job_id }))).into_response(),
        Err(e) => store_unavailable("queue delete", e),
    }
}
