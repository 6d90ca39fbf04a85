//! Router-level tests for the pile endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use chrono::Utc;
use http_body_util::BodyExt;
use pilestore_security::{RateLimitConfig, RateLimiter};
use pilestore_storage::{
    Config, EntryMeta, EntryStore, Lifetime, PileConfig, PileGetter, PileStorage,
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use crate::server::{build_router, AppState};

const BOUNDARY: &str = "pilestore-test-boundary";

struct TestNode {
    _dir: TempDir,
    store: Arc<EntryStore>,
    state: Arc<AppState>,
}

fn create_test_state(piles: Vec<(&str, PileConfig)>, burst: u32) -> TestNode {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(EntryStore::open(dir.path()).unwrap());
    let mut config = Config::default();
    for (name, pile) in piles {
        config.piles.insert(name.to_string(), pile);
    }
    store.startup(&config).unwrap();

    let limiter = RateLimiter::new(RateLimitConfig {
        burst,
        ..Default::default()
    })
    .unwrap();
    let storage: Arc<dyn PileStorage> = store.clone();
    let state = AppState::new(storage, Arc::new(config), Arc::new(limiter));
    TestNode {
        _dir: dir,
        store,
        state: Arc::new(state),
    }
}

fn open_pile() -> PileConfig {
    PileConfig {
        lifetime: Lifetime::new(Duration::from_secs(3600)),
        origin: "*".to_string(),
        ..PileConfig::default()
    }
}

fn multipart_body(field: &str, filename: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn request(method: &str, uri: &str, headers: &[(&str, &str)], body: Vec<u8>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let mut req = builder.body(Body::from(body)).unwrap();
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40_000))));
    req
}

fn upload_request(pile: &str, filename: &str, data: &[u8], auth: Option<&str>) -> Request<Body> {
    let content_type = format!("multipart/form-data; boundary={BOUNDARY}");
    let mut headers = vec![("content-type", content_type.as_str())];
    if let Some(auth) = auth {
        headers.push(("authorization", auth));
    }
    request(
        "POST",
        &format!("/{pile}/"),
        &headers,
        multipart_body("data", filename, data),
    )
}

async fn send(node: &TestNode, req: Request<Body>) -> Response {
    build_router(node.state.clone()).oneshot(req).await.unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

async fn assert_error(response: Response, status: StatusCode, message: &str) {
    assert_eq!(response.status(), status);
    let json = body_json(response).await;
    assert_eq!(json["error"], message);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_upload_then_download() {
    let node = create_test_state(vec![("photos", open_pile())], 100);

    let response = send(&node, upload_request("photos", "hello.txt", b"hello there", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["size"], 11);
    let entry = json["entry"].as_str().unwrap().to_string();

    let response = send(&node, request("GET", &format!("/photos/{entry}"), &[], vec![])).await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers[header::CONTENT_TYPE], "text/plain; charset=utf-8");
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "inline; filename=\"hello.txt\""
    );
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert!(headers.contains_key(header::LAST_MODIFIED));
    assert!(headers.contains_key(header::EXPIRES));
    assert_eq!(body_bytes(response).await, b"hello there");
}

#[tokio::test]
async fn test_large_entry_streams_both_ways() {
    let node = create_test_state(vec![("photos", open_pile())], 100);
    let data: Vec<u8> = (0..300 * 1024).map(|i| (i * 7 % 251) as u8).collect();

    let response = send(&node, upload_request("photos", "noise.bin", &data, None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["size"], data.len());
    let entry = json["entry"].as_str().unwrap().to_string();

    let response = send(&node, request("GET", &format!("/photos/{entry}"), &[], vec![])).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, data);
}

#[tokio::test]
async fn test_forever_pile_has_no_expires_header() {
    let node = create_test_state(vec![("keep", PileConfig::default())], 100);
    let json = body_json(send(&node, upload_request("keep", "a.bin", b"\x00\x01", None)).await).await;
    let entry = json["entry"].as_str().unwrap().to_string();

    let response = send(&node, request("GET", &format!("/keep/{entry}"), &[], vec![])).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key(header::EXPIRES));
    assert!(!response
        .headers()
        .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/octet-stream"
    );
}

#[tokio::test]
async fn test_upload_to_unknown_pile() {
    let node = create_test_state(vec![("photos", open_pile())], 100);
    let response = send(&node, upload_request("nope", "a", b"a", None)).await;
    assert_error(response, StatusCode::NOT_FOUND, "pile not found").await;
}

#[tokio::test]
async fn test_write_key_is_enforced() {
    let pile = PileConfig {
        write_key: "s3cret".to_string(),
        ..open_pile()
    };
    let node = create_test_state(vec![("locked", pile)], 100);

    let response = send(&node, upload_request("locked", "a", b"a", None)).await;
    assert_error(response, StatusCode::FORBIDDEN, "access denied").await;

    let response = send(&node, upload_request("locked", "a", b"a", Some("Bearer wrong"))).await;
    assert_error(response, StatusCode::FORBIDDEN, "access denied").await;

    let response = send(&node, upload_request("locked", "a", b"a", Some("Bearer s3cret"))).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_disabled_read_key_denies_downloads() {
    let pile = PileConfig {
        read_key: "!".to_string(),
        ..open_pile()
    };
    let node = create_test_state(vec![("dropbox", pile)], 100);
    let json = body_json(send(&node, upload_request("dropbox", "a", b"a", None)).await).await;
    let entry = json["entry"].as_str().unwrap().to_string();

    let response = send(&node, request("GET", &format!("/dropbox/{entry}"), &[], vec![])).await;
    assert_error(response, StatusCode::FORBIDDEN, "access denied").await;
}

#[tokio::test]
async fn test_oversize_upload_is_refused() {
    let pile = PileConfig {
        max_size: 16,
        ..open_pile()
    };
    let node = create_test_state(vec![("tiny", pile)], 100);

    let response = send(&node, upload_request("tiny", "big", &[b'x'; 100], None)).await;
    assert_error(response, StatusCode::PAYLOAD_TOO_LARGE, "entry too large").await;
    assert!(node.store.get_pile_entries("tiny").unwrap().is_empty());
    assert!(node.store.blobs().list("tiny").unwrap().is_empty());

    let response = send(&node, upload_request("tiny", "small", &[b'x'; 16], None)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_weird_requests() {
    let node = create_test_state(vec![("photos", open_pile())], 100);

    let response = send(
        &node,
        request("POST", "/photos/", &[("content-type", "text/plain")], b"hi".to_vec()),
    )
    .await;
    assert_error(response, StatusCode::BAD_REQUEST, "request too weird").await;

    let content_type = format!("multipart/form-data; boundary={BOUNDARY}");
    let response = send(
        &node,
        request(
            "POST",
            "/photos/",
            &[("content-type", content_type.as_str())],
            multipart_body("not-data", "a", b"a"),
        ),
    )
    .await;
    assert_error(response, StatusCode::BAD_REQUEST, "request too weird").await;

    let response = send(&node, request("GET", "/a/b/c", &[], vec![])).await;
    assert_error(response, StatusCode::BAD_REQUEST, "request too weird").await;
}

#[tokio::test]
async fn test_missing_entry() {
    let node = create_test_state(vec![("photos", open_pile())], 100);
    let response = send(&node, request("GET", "/photos/does-not-exist", &[], vec![])).await;
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_error(response, StatusCode::NOT_FOUND, "entry not found").await;

    let response = send(&node, request("GET", "/nope/whatever", &[], vec![])).await;
    assert_error(response, StatusCode::NOT_FOUND, "entry not found").await;
}

/// Store an entry that looks like it was uploaded `age` ago.
fn plant_old_entry(store: &EntryStore, pile: &str, entry: &str, age: chrono::Duration) {
    store
        .blobs()
        .create_and_write(pile, entry, |sink| {
            sink.write_all(b"old news")?;
            Ok(8)
        })
        .unwrap();
    let meta = EntryMeta::new(format!("{entry}.txt"), Utc::now() - age);
    store.meta().put(pile, entry, &meta.to_bytes()).unwrap();
}

#[tokio::test]
async fn test_expired_but_unswept_entry_is_hidden() {
    let node = create_test_state(vec![("photos", open_pile())], 100);
    plant_old_entry(&node.store, "photos", "stale", chrono::Duration::hours(2));

    let response = send(&node, request("GET", "/photos/stale", &[], vec![])).await;
    assert_error(response, StatusCode::NOT_FOUND, "entry not found").await;

    let json = body_json(send(&node, request("GET", "/photos/", &[], vec![])).await).await;
    assert_eq!(json["entries"].as_array().unwrap().len(), 0);

    // Still on disk until the sweeper gets to it.
    assert!(node.store.blobs().entry_path("photos", "stale").exists());
}

#[tokio::test]
async fn test_listing_is_sorted_oldest_first() {
    let node = create_test_state(vec![("photos", open_pile())], 100);
    plant_old_entry(&node.store, "photos", "middle", chrono::Duration::minutes(20));
    plant_old_entry(&node.store, "photos", "oldest", chrono::Duration::minutes(40));
    plant_old_entry(&node.store, "photos", "newest", chrono::Duration::minutes(1));

    let response = send(&node, request("GET", "/photos/", &[], vec![])).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["format"], 1);
    assert_eq!(json["lifetime"], "1h");
    assert_eq!(json["origin"], "*");
    let order: Vec<&str> = json["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["entry"].as_str().unwrap())
        .collect();
    assert_eq!(order, vec!["oldest", "middle", "newest"]);
    assert_eq!(json["entries"][0]["filename"], "oldest.txt");
    assert!(json["entries"][0]["uploaded"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn test_list_key_is_enforced() {
    let pile = PileConfig {
        list_key: "lister".to_string(),
        ..open_pile()
    };
    let node = create_test_state(vec![("photos", pile)], 100);

    let response = send(&node, request("GET", "/photos/", &[], vec![])).await;
    assert_error(response, StatusCode::FORBIDDEN, "access denied").await;

    let response = send(
        &node,
        request("GET", "/photos", &[("authorization", "bearer lister")], vec![]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_uploads_are_rate_limited() {
    let node = create_test_state(vec![("photos", open_pile())], 3);

    for _ in 0..3 {
        let response = send(&node, upload_request("photos", "a", b"a", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = send(&node, upload_request("photos", "a", b"a", None)).await;
    assert_error(response, StatusCode::TOO_MANY_REQUESTS, "you need to chill out").await;

    // Downloads are not rate limited.
    let response = send(&node, request("GET", "/photos/missing", &[], vec![])).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_version_and_metrics() {
    let node = create_test_state(vec![("photos", open_pile())], 100);

    let response = send(&node, request("GET", "/", &[], vec![])).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["service"], "pilestore");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));

    // No recorder installed in this state.
    let response = send(&node, request("GET", "/metrics", &[], vec![])).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
