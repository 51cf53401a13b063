//! Range-capable media streaming.
//!
//! Serves a media id from the local cache when a download record exists and
//! the file is intact, otherwise proxies the request to the upstream without
//! buffering. A request with no Range header marks the start of playback and
//! feeds the predictor.

use std::io::SeekFrom;
use std::path::{Path as FsPath, PathBuf};

use axum::body::Body;
use axum::extract::{OptionalFromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::store::DownloadRecord;

use super::handlers::error_response;
use super::state::AppState;

const STREAM_BUF_SIZE: usize = 64 * 1024;
/// Bytes sniffed when the extension does not identify the container.
const SNIFF_LEN: usize = 512;

/// A parsed `Range: bytes=start-end` header. Only single ranges are
/// supported; multipart ranges are not worth their complexity for video
/// players, which never send them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    start: Option<u64>,
    end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: Option<u64>, end: Option<u64>) -> Self {
        Self { start, end }
    }

    fn parse(value: &str) -> Option<ByteRange> {
        let spec = value.strip_prefix("bytes=")?;
        let (start, end) = spec.split_once('-')?;
        if start.is_empty() && end.is_empty() {
            return None;
        }
        Some(ByteRange {
            start: start.parse::<u64>().ok(),
            end: end.parse::<u64>().ok(),
        })
    }

    /// Reconstruct the header value for proxying upstream.
    pub fn to_header_value(self) -> String {
        match (self.start, self.end) {
            (Some(start), Some(end)) => format!("bytes={}-{}", start, end),
            (Some(start), None) => format!("bytes={}-", start),
            (None, Some(suffix)) => format!("bytes=-{}", suffix),
            (None, None) => "bytes=0-".to_string(),
        }
    }
}

impl<S: Send + Sync> OptionalFromRequestParts<S> for ByteRange {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts
            .headers
            .get(header::RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(ByteRange::parse))
    }
}

/// What a range request resolves to against a file of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvedRange {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

fn resolve_range(range: Option<ByteRange>, size: u64) -> ResolvedRange {
    let Some(range) = range else {
        return ResolvedRange::Full;
    };
    if size == 0 {
        return ResolvedRange::Unsatisfiable;
    }
    match (range.start, range.end) {
        (None, None) => ResolvedRange::Full,
        (Some(start), Some(end)) => {
            if start >= size || start > end {
                ResolvedRange::Unsatisfiable
            } else {
                ResolvedRange::Partial {
                    start,
                    end: end.min(size - 1),
                }
            }
        }
        (Some(start), None) => {
            if start >= size {
                ResolvedRange::Unsatisfiable
            } else {
                ResolvedRange::Partial {
                    start,
                    end: size - 1,
                }
            }
        }
        // Suffix range: the last N bytes, clamped to the whole file.
        (None, Some(suffix)) => {
            if suffix == 0 {
                ResolvedRange::Unsatisfiable
            } else {
                ResolvedRange::Partial {
                    start: size.saturating_sub(suffix),
                    end: size - 1,
                }
            }
        }
    }
}

/// `GET|HEAD /stream/{media_id}`.
pub async fn stream_media(
    State(state): State<AppState>,
    method: Method,
    Path(media_id): Path<String>,
    range: Option<ByteRange>,
) -> Response {
    // The first request of a playback session carries no Range header; it is
    // the signal the predictor feeds on. Failures stay in the logs.
    if range.is_none() && method == Method::GET {
        let predictor = state.predictor.clone();
        let id = media_id.clone();
        tokio::spawn(async move {
            if let Err(e) = predictor.on_playback_start(&id).await {
                warn!("Playback prediction failed for {}: {:#}", id, e);
            }
        });
    }

    let record = match state.store.find_download(&media_id) {
        Ok(record) => record,
        Err(e) => {
            warn!("Store lookup failed for {}: {:#}", media_id, e);
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                "metadata store is unavailable",
            );
        }
    };

    if let Some(record) = record {
        match serve_cached(&state, &record, method.clone(), range).await {
            Ok(response) => return response,
            Err(e) => {
                // The record points at bytes that are gone: reconcile and
                // fall through to the proxy path.
                warn!(
                    "Cached file unusable for {} ({:#}), reconciling record",
                    media_id, e
                );
                if let Err(e) = state.store.delete_download(record.kind, &record.media_id) {
                    warn!("Failed to drop stale record for {}: {:#}", media_id, e);
                }
            }
        }
    }

    proxy_from_upstream(&state, &media_id, method, range).await
}

async fn serve_cached(
    state: &AppState,
    record: &DownloadRecord,
    method: Method,
    range: Option<ByteRange>,
) -> anyhow::Result<Response> {
    let relative = PathBuf::from(&record.local_path);
    let (mut file, size, mtime) = state.fs.open_for_range(&relative).await?;

    let content_type = match content_type_from_extension(&relative) {
        Some(known) => known,
        None => {
            let mut sniff = [0u8; SNIFF_LEN];
            let n = file.read(&mut sniff).await.unwrap_or(0);
            file.seek(SeekFrom::Start(0)).await?;
            sniff_content_type(&sniff[..n])
        }
    };

    let last_modified = DateTime::<Utc>::from(mtime)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();

    let response = match resolve_range(range, size) {
        ResolvedRange::Unsatisfiable => Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CONTENT_RANGE, format!("bytes */{}", size))
            .body(Body::empty())?,
        ResolvedRange::Full => {
            let body = if method == Method::HEAD {
                Body::empty()
            } else {
                Body::from_stream(ReaderStream::with_capacity(file, STREAM_BUF_SIZE))
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_LENGTH, size)
                .header(header::LAST_MODIFIED, &last_modified)
                .body(body)?
        }
        ResolvedRange::Partial { start, end } => {
            let length = end - start + 1;
            let body = if method == Method::HEAD {
                Body::empty()
            } else {
                file.seek(SeekFrom::Start(start)).await?;
                let limited = file.take(length);
                Body::from_stream(ReaderStream::with_capacity(limited, STREAM_BUF_SIZE))
            };
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_LENGTH, length)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, size),
                )
                .header(header::LAST_MODIFIED, &last_modified)
                .body(body)?
        }
    };

    debug!(
        "Serving {} from cache ({} bytes, {})",
        record.media_id, size, content_type
    );
    if let Err(e) = state
        .store
        .touch_download(record.kind, &record.media_id, Utc::now().timestamp())
    {
        warn!("Failed to touch {}: {:#}", record.media_id, e);
    }
    Ok(response)
}

/// Headers copied verbatim from an upstream response.
const SAFE_PROXY_HEADERS: [header::HeaderName; 5] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ACCEPT_RANGES,
    header::LAST_MODIFIED,
];

async fn proxy_from_upstream(
    state: &AppState,
    media_id: &str,
    method: Method,
    range: Option<ByteRange>,
) -> Response {
    let url = state.upstream.stream_url(media_id);
    debug!("Proxying {} from upstream", media_id);

    let mut request = state.proxy_http.get(&url);
    if let Some(range) = range {
        request = request.header(header::RANGE, range.to_header_value());
    }

    let upstream_response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("Upstream proxy request failed for {}: {}", media_id, e);
            return error_response(
                StatusCode::BAD_GATEWAY,
                "upstream_unreachable",
                "upstream did not answer the stream request",
            );
        }
    };

    let status =
        StatusCode::from_u16(upstream_response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for name in SAFE_PROXY_HEADERS {
        if let Some(value) = upstream_response.headers().get(name.as_str()) {
            if let Ok(value) = value.to_str() {
                builder = builder.header(name.clone(), value);
            }
        }
    }
    if upstream_response.headers().get(header::ACCEPT_RANGES).is_none() {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
    }

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(upstream_response.bytes_stream())
    };

    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn content_type_from_extension(path: &FsPath) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "mp4" => Some("video/mp4"),
        "mkv" => Some("video/x-matroska"),
        "avi" => Some("video/x-msvideo"),
        "mov" => Some("video/quicktime"),
        "wmv" => Some("video/x-ms-wmv"),
        "flv" => Some("video/x-flv"),
        "webm" => Some("video/webm"),
        "m4v" => Some("video/x-m4v"),
        _ => None,
    }
}

fn sniff_content_type(buf: &[u8]) -> &'static str {
    if buf.len() >= 8 && &buf[4..8] == b"ftyp" {
        return "video/mp4";
    }
    if buf.len() >= 4 && buf[..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        // EBML header, matroska family.
        return "video/x-matroska";
    }
    if buf.len() >= 12 && &buf[..4] == b"RIFF" && &buf[8..12] == b"AVI " {
        return "video/x-msvideo";
    }
    "application/octet-stream"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: Option<u64>, end: Option<u64>) -> Option<ByteRange> {
        Some(ByteRange::new(start, end))
    }

    #[test]
    fn parses_range_header() {
        assert_eq!(ByteRange::parse("bytes=0-99"), Some(ByteRange::new(Some(0), Some(99))));
        assert_eq!(ByteRange::parse("bytes=100-"), Some(ByteRange::new(Some(100), None)));
        assert_eq!(ByteRange::parse("bytes=-50"), Some(ByteRange::new(None, Some(50))));
        assert_eq!(ByteRange::parse("bytes=-"), None);
        assert_eq!(ByteRange::parse("chunks=0-1"), None);
        assert_eq!(ByteRange::parse("0-1"), None);
    }

    #[test]
    fn header_value_round_trips() {
        for value in ["bytes=0-99", "bytes=100-", "bytes=-50"] {
            let parsed = ByteRange::parse(value).unwrap();
            assert_eq!(parsed.to_header_value(), value);
        }
    }

    #[test]
    fn full_file_without_range() {
        assert_eq!(resolve_range(None, 1000), ResolvedRange::Full);
    }

    #[test]
    fn simple_range_is_bounded() {
        assert_eq!(
            resolve_range(range(Some(0), Some(99)), 1000),
            ResolvedRange::Partial { start: 0, end: 99 }
        );
        assert_eq!(
            resolve_range(range(Some(500), Some(599)), 1000),
            ResolvedRange::Partial { start: 500, end: 599 }
        );
    }

    #[test]
    fn single_byte_range() {
        assert_eq!(
            resolve_range(range(Some(0), Some(0)), 1000),
            ResolvedRange::Partial { start: 0, end: 0 }
        );
    }

    #[test]
    fn open_ended_range_runs_to_eof() {
        assert_eq!(
            resolve_range(range(Some(900), None), 1000),
            ResolvedRange::Partial { start: 900, end: 999 }
        );
    }

    #[test]
    fn end_is_clamped_to_file_size() {
        assert_eq!(
            resolve_range(range(Some(990), Some(5000)), 1000),
            ResolvedRange::Partial { start: 990, end: 999 }
        );
    }

    #[test]
    fn suffix_range_is_normalised() {
        assert_eq!(
            resolve_range(range(None, Some(100)), 1000),
            ResolvedRange::Partial { start: 900, end: 999 }
        );
    }

    #[test]
    fn oversized_suffix_returns_whole_file() {
        assert_eq!(
            resolve_range(range(None, Some(5000)), 1000),
            ResolvedRange::Partial { start: 0, end: 999 }
        );
    }

    #[test]
    fn start_beyond_size_is_unsatisfiable() {
        assert_eq!(
            resolve_range(range(Some(1000), Some(1010)), 1000),
            ResolvedRange::Unsatisfiable
        );
        assert_eq!(
            resolve_range(range(Some(1000), None), 1000),
            ResolvedRange::Unsatisfiable
        );
    }

    #[test]
    fn inverted_range_is_unsatisfiable() {
        assert_eq!(
            resolve_range(range(Some(10), Some(5)), 1000),
            ResolvedRange::Unsatisfiable
        );
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(
            content_type_from_extension(FsPath::new("a/b/film.mp4")),
            Some("video/mp4")
        );
        assert_eq!(
            content_type_from_extension(FsPath::new("ep.MKV")),
            Some("video/x-matroska")
        );
        assert_eq!(content_type_from_extension(FsPath::new("mystery.bin")), None);
        assert_eq!(content_type_from_extension(FsPath::new("noext")), None);
    }

    #[test]
    fn sniffing_recognises_common_containers() {
        let mut mp4 = vec![0, 0, 0, 24];
        mp4.extend_from_slice(b"ftypisom");
        assert_eq!(sniff_content_type(&mp4), "video/mp4");

        let mkv = [0x1A, 0x45, 0xDF, 0xA3, 0, 0, 0, 0];
        assert_eq!(sniff_content_type(&mkv), "video/x-matroska");

        assert_eq!(sniff_content_type(b"plain text"), "application/octet-stream");
        assert_eq!(sniff_content_type(&[]), "application/octet-stream");
    }
}
