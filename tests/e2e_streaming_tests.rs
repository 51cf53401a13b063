//! End-to-end tests for the range streaming endpoint: proxy fallback on a
//! cache miss, cached serving with full range semantics, HEAD behaviour.

mod common;

use common::{pattern_bytes, MediaBehavior, TestServer};
use media_cache_server::MetadataStore;
use reqwest::header::{HeaderName, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;

fn header_str(response: &reqwest::Response, name: HeaderName) -> &str {
    response
        .headers()
        .get(name)
        .expect("header missing")
        .to_str()
        .unwrap()
}

async fn cache_item(server: &TestServer, id: &str) {
    let client = reqwest::Client::new();
    let response = client
        .post(server.url("/api/queue/add"))
        .json(&serde_json::json!({ "media_id": id, "priority": 5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    server
        .wait_until("download to finish", || {
            server.store.find_download(id).unwrap().is_some()
        })
        .await;
}

#[tokio::test]
async fn health_answers_ok() {
    let server = TestServer::spawn().await;
    let response = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn cache_miss_is_proxied_from_upstream() {
    let server = TestServer::spawn().await;
    let body = pattern_bytes(1_000_000);
    server.mock.add_movie("X", "Film X", body.clone());

    let client = reqwest::Client::new();
    let response = client
        .get(server.url("/stream/X"))
        .header(RANGE, "bytes=0-99")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let bytes = response.bytes().await.unwrap();
    assert_eq!(bytes.len(), 100);
    assert_eq!(&bytes[..], &body[..100]);

    // Pure proxy path: nothing was recorded as cached.
    assert!(server.store.find_download("X").unwrap().is_none());
    assert_eq!(server.mock.stream_request_count("X"), 1);
}

#[tokio::test]
async fn cached_item_serves_ranges_locally() {
    let server = TestServer::spawn().await;
    let body = pattern_bytes(1_000_000);
    server.mock.add_movie("X", "Film X", body.clone());

    cache_item(&server, "X").await;
    assert_eq!(server.mock.stream_request_count("X"), 1);

    let client = reqwest::Client::new();
    let response = client
        .get(server.url("/stream/X"))
        .header(RANGE, "bytes=500-599")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header_str(&response, CONTENT_RANGE),
        "bytes 500-599/1000000"
    );
    assert_eq!(header_str(&response, CONTENT_LENGTH), "100");
    assert_eq!(header_str(&response, ACCEPT_RANGES), "bytes");

    let bytes = response.bytes().await.unwrap();
    let expected: Vec<u8> = (500..600usize).map(|i| (i % 256) as u8).collect();
    assert_eq!(&bytes[..], &expected[..]);

    // Served locally: the upstream saw no extra request.
    assert_eq!(server.mock.stream_request_count("X"), 1);
}

#[tokio::test]
async fn serving_the_same_range_twice_is_identical() {
    let server = TestServer::spawn().await;
    server.mock.add_movie("X", "Film X", pattern_bytes(4096));
    cache_item(&server, "X").await;

    let client = reqwest::Client::new();
    let mut bodies = Vec::new();
    for _ in 0..2 {
        let response = client
            .get(server.url("/stream/X"))
            .header(RANGE, "bytes=100-299")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        bodies.push(response.bytes().await.unwrap());
    }
    assert_eq!(bodies[0], bodies[1]);
}

#[tokio::test]
async fn range_boundary_cases() {
    let server = TestServer::spawn().await;
    let size = 4096usize;
    server.mock.add_movie("X", "Film X", pattern_bytes(size));
    cache_item(&server, "X").await;

    let client = reqwest::Client::new();

    // Single byte.
    let response = client
        .get(server.url("/stream/X"))
        .header(RANGE, "bytes=0-0")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header_str(&response, CONTENT_RANGE),
        format!("bytes 0-0/{}", size)
    );
    assert_eq!(response.bytes().await.unwrap().len(), 1);

    // Oversized suffix is clamped to the whole file.
    let response = client
        .get(server.url("/stream/X"))
        .header(RANGE, format!("bytes=-{}", size * 2))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.bytes().await.unwrap().len(), size);

    // Start at EOF is unsatisfiable.
    let response = client
        .get(server.url("/stream/X"))
        .header(RANGE, format!("bytes={}-{}", size, size + 10))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        header_str(&response, CONTENT_RANGE),
        format!("bytes */{}", size)
    );
}

#[tokio::test]
async fn head_reports_length_with_empty_body() {
    let server = TestServer::spawn().await;
    let size = 4096usize;
    server.mock.add_movie("X", "Film X", pattern_bytes(size));
    cache_item(&server, "X").await;

    let client = reqwest::Client::new();
    let response = client.head(server.url("/stream/X")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, CONTENT_LENGTH), format!("{}", size));
    assert_eq!(header_str(&response, ACCEPT_RANGES), "bytes");
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn upstream_404_passes_through_on_miss() {
    let server = TestServer::spawn().await;
    let response = reqwest::get(server.url("/stream/unknown")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_file_reconciles_and_falls_back_to_proxy() {
    let server = TestServer::spawn().await;
    let body = pattern_bytes(4096);
    server.mock.add_movie("X", "Film X", body.clone());
    cache_item(&server, "X").await;

    // Lose the bytes behind the record's back.
    let record = server.store.find_download("X").unwrap().unwrap();
    std::fs::remove_file(server.cache_dir.join(&record.local_path)).unwrap();

    let client = reqwest::Client::new();
    let response = client
        .get(server.url("/stream/X"))
        .header(RANGE, "bytes=0-9")
        .send()
        .await
        .unwrap();

    // Proxied from upstream, and the stale record is gone.
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(&response.bytes().await.unwrap()[..], &body[..10]);
    server
        .wait_until("stale record removal", || {
            server.store.find_download("X").unwrap().is_none()
        })
        .await;
}

#[tokio::test]
async fn upstream_unreachable_with_uncached_item_is_502() {
    let server = TestServer::spawn().await;
    server
        .mock
        .set_media("down", MediaBehavior::Status(503));

    let response = reqwest::get(server.url("/stream/down")).await.unwrap();
    // The upstream answered 503; the proxy forwards what it got.
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
