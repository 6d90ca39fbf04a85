//! Pile endpoints: upload, download and listing.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::multipart::{Field, MultipartError, MultipartRejection};
use axum::extract::{ConnectInfo, Multipart, Path as AxumPath, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use pilestore_security::has_bearer_token;
use pilestore_storage::entry_meta::LEGACY_FILENAME;
use pilestore_storage::{format_timestamp, CreatedEntry, EntryMeta, PileConfig, StorageError};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::peer::determine_peer;
use crate::server::{ApiError, SharedState};

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";
/// Body chunks buffered between the request and the blocking writer.
const UPLOAD_QUEUE: usize = 8;
const DOWNLOAD_CHUNK: usize = 64 * 1024;
const DOWNLOAD_QUEUE: usize = 8;

type ChunkSender = mpsc::Sender<io::Result<Bytes>>;
type ChunkReceiver = mpsc::Receiver<io::Result<Bytes>>;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub size: u64,
    pub entry: String,
}

#[derive(Debug, Serialize)]
pub struct ListedEntry {
    pub filename: String,
    pub uploaded: String,
    pub entry: String,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub format: u32,
    pub lifetime: String,
    pub origin: String,
    pub entries: Vec<ListedEntry>,
}

/// What the read callback learned before the body starts flowing.
struct DownloadHead {
    meta: EntryMeta,
    content_type: String,
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

fn http_date(time: DateTime<Utc>) -> String {
    time.format(HTTP_DATE).to_string()
}

/// Attach the pile's CORS origin, if it has one, to any response.
fn with_origin(state: &SharedState, pile: &str, response: impl IntoResponse) -> Response {
    let mut response = response.into_response();
    let origin = state
        .config
        .pile(pile)
        .ok()
        .map(|settings| settings.origin.as_str())
        .filter(|origin| !origin.is_empty());
    if let Some(value) = origin.and_then(|origin| HeaderValue::from_str(origin).ok()) {
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    response
}

fn admit(state: &SharedState, peer: &str, pile: &str, operation: &str) -> Result<(), ApiError> {
    if state.limiter.allow(peer) {
        return Ok(());
    }
    metrics::counter!("pilestore_rate_limited_total").increment(1);
    warn!(peer, pile, operation, "Hit the rate limit");
    Err(ApiError::too_many_requests())
}

fn storage_failure(err: StorageError, peer: &str, operation: &str) -> ApiError {
    match &err {
        StorageError::NoSuchPile { pile } => {
            warn!(peer, pile = %pile, operation, "Pile configured but not in storage");
            if operation == "read" {
                ApiError::entry_not_found()
            } else {
                ApiError::pile_not_found()
            }
        }
        StorageError::NoSuchEntry { pile, entry } => {
            info!(peer, pile = %pile, entry = %entry, operation, "Entry not found");
            ApiError::entry_not_found()
        }
        other => {
            error!(peer, operation, error = %other, "Storage failure");
            ApiError::internal()
        }
    }
}

fn join_failure(err: tokio::task::JoinError, operation: &str) -> ApiError {
    error!(operation, error = %err, "Storage task failed");
    ApiError::internal()
}

/// POST /{pile}/ - store the multipart field `data` as a new entry
pub async fn handle_upload(
    State(state): State<SharedState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    AxumPath(pile): AxumPath<String>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    state.record_request();
    let result = upload(&state, remote, &pile, &headers, multipart).await;
    with_origin(&state, &pile, result)
}

async fn upload(
    state: &SharedState,
    remote: SocketAddr,
    pile: &str,
    headers: &HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let peer = determine_peer(remote, headers, state.config.forward_header());
    admit(state, &peer, pile, "write")?;

    let settings = state.config.pile(pile).map_err(|_| {
        info!(peer = %peer, pile, operation = "write", "Unknown pile");
        ApiError::pile_not_found()
    })?;
    if !has_bearer_token(&settings.write_key, authorization(headers)) {
        info!(peer = %peer, pile, operation = "write", "Invalid or missing bearer token");
        return Err(ApiError::forbidden());
    }

    let mut multipart = multipart.map_err(|err| {
        info!(peer = %peer, pile, operation = "write", error = %err, "Not a multipart form");
        ApiError::bad_request()
    })?;
    let created = store_data_field(state, &peer, pile, settings, &mut multipart).await?;

    info!(peer = %peer, pile, entry = %created.entry, operation = "write", size = created.size, "Stored");
    Ok(Json(UploadResponse {
        success: true,
        size: created.size,
        entry: created.entry,
    }))
}

fn multipart_failure(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::too_large()
    } else {
        ApiError::bad_request()
    }
}

fn upload_filename(field: &Field<'_>) -> String {
    field
        .file_name()
        .map(|name| name.rsplit(['/', '\\']).next().unwrap_or(name).trim())
        .filter(|name| !name.is_empty())
        .unwrap_or(LEGACY_FILENAME)
        .to_string()
}

/// Stream the `data` field into a new entry while the request body arrives.
async fn store_data_field(
    state: &SharedState,
    peer: &str,
    pile: &str,
    settings: &PileConfig,
    multipart: &mut Multipart,
) -> Result<CreatedEntry, ApiError> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_failure)? {
        if field.name() != Some("data") {
            continue;
        }
        let filename = upload_filename(&field);

        let (chunks, mut queue) = mpsc::channel(UPLOAD_QUEUE);
        let storage = Arc::clone(&state.storage);
        let pile_name = pile.to_string();
        let writer = tokio::task::spawn_blocking(move || {
            storage.create_entry(&pile_name, &filename, &mut |sink: &mut dyn Write| {
                drain_chunks(&mut queue, sink)
            })
        });

        let pumped = pump_field(&mut field, &chunks, settings.max_size).await;
        drop(chunks);
        let stored = writer.await.map_err(|err| join_failure(err, "write"))?;
        if let Err(err) = pumped {
            info!(peer, pile, operation = "write", status = %err.status(), "Rejected upload");
            return Err(err);
        }
        return stored.map_err(|err| storage_failure(err, peer, "write"));
    }
    info!(peer, pile, operation = "write", "No data field in form");
    Err(ApiError::bad_request())
}

/// Forward field chunks to the writer, refusing the body once it grows past
/// `max_size`. A writer that hung up ends the pump quietly; its own error wins.
async fn pump_field(
    field: &mut Field<'_>,
    chunks: &ChunkSender,
    max_size: u64,
) -> Result<(), ApiError> {
    let mut received = 0u64;
    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Ok(()),
            Err(err) => {
                abort_upload(chunks, io::ErrorKind::UnexpectedEof, "upload interrupted").await;
                return Err(multipart_failure(err));
            }
        };
        received += chunk.len() as u64;
        if received > max_size {
            abort_upload(chunks, io::ErrorKind::InvalidData, "upload exceeds pile limit").await;
            return Err(ApiError::too_large());
        }
        if chunks.send(Ok(chunk)).await.is_err() {
            return Ok(());
        }
    }
}

async fn abort_upload(chunks: &ChunkSender, kind: io::ErrorKind, reason: &'static str) {
    let _ = chunks.send(Err(io::Error::new(kind, reason))).await;
}

fn drain_chunks(queue: &mut ChunkReceiver, sink: &mut dyn Write) -> io::Result<u64> {
    let mut written = 0u64;
    while let Some(chunk) = queue.blocking_recv() {
        let chunk = chunk?;
        sink.write_all(&chunk)?;
        written += chunk.len() as u64;
    }
    Ok(written)
}

/// GET /{pile}/{entry} - serve an entry unless it has outlived its pile's lifetime
pub async fn handle_get_entry(
    State(state): State<SharedState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    AxumPath((pile, entry)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    state.record_request();
    let result = get_entry(&state, remote, &pile, &entry, &headers).await;
    with_origin(&state, &pile, result)
}

async fn get_entry(
    state: &SharedState,
    remote: SocketAddr,
    pile: &str,
    entry: &str,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let peer = determine_peer(remote, headers, state.config.forward_header());
    let settings = state.config.pile(pile).map_err(|_| {
        info!(peer = %peer, pile, entry, operation = "read", "Unknown pile");
        ApiError::entry_not_found()
    })?;
    if !has_bearer_token(&settings.read_key, authorization(headers)) {
        info!(peer = %peer, pile, entry, operation = "read", "Invalid or missing bearer token");
        return Err(ApiError::forbidden());
    }

    let lifetime = settings.lifetime;
    let storage = Arc::clone(&state.storage);
    let (pile_name, entry_name) = (pile.to_string(), entry.to_string());
    let (head_tx, head_rx) = oneshot::channel();
    let (chunks, queue) = mpsc::channel(DOWNLOAD_QUEUE);
    let reader_task = tokio::task::spawn_blocking(move || {
        let mut head_tx = Some(head_tx);
        storage.get_entry(&pile_name, &entry_name, &mut |meta, content_type, reader| {
            if lifetime.is_expired(meta.created(), Utc::now()) {
                return Ok(());
            }
            let head = DownloadHead {
                meta: meta.clone(),
                content_type: content_type.to_string(),
            };
            if let Some(head_tx) = head_tx.take() {
                if head_tx.send(head).is_err() {
                    return Err(client_gone());
                }
            }
            stream_blob(reader, &chunks)
        })
    });

    // No head means nothing will be served: the lookup failed or the entry expired.
    let Ok(head) = head_rx.await else {
        reader_task
            .await
            .map_err(|err| join_failure(err, "read"))?
            .map_err(|err| storage_failure(err, &peer, "read"))?;
        debug!(peer = %peer, pile, entry, operation = "read", "Expired, but not swept yet");
        return Err(ApiError::entry_not_found());
    };

    let (log_peer, log_pile, log_entry) = (peer.clone(), pile.to_string(), entry.to_string());
    tokio::spawn(async move {
        match reader_task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(peer = %log_peer, pile = %log_pile, entry = %log_entry, operation = "read", error = %err, "Download ended early");
            }
            Err(err) => {
                error!(operation = "read", error = %err, "Storage task failed");
            }
        }
    });

    let body = Body::from_stream(futures::stream::unfold(queue, |mut queue: ChunkReceiver| async move {
        queue.recv().await.map(|chunk| (chunk, queue))
    }));
    let mut response = Response::new(body);
    let response_headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&head.content_type) {
        response_headers.insert(header::CONTENT_TYPE, value);
    }
    let created = head.meta.created();
    if let Ok(value) = HeaderValue::from_str(&http_date(created)) {
        response_headers.insert(header::LAST_MODIFIED, value);
    }
    if let Some(expires) = lifetime.expires_at(created) {
        if let Ok(value) = HeaderValue::from_str(&http_date(expires)) {
            response_headers.insert(header::EXPIRES, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&content_disposition(head.meta.filename())) {
        response_headers.insert(header::CONTENT_DISPOSITION, value);
    }

    info!(peer = %peer, pile, entry, operation = "read", "Serving data");
    Ok(response)
}

fn client_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client went away")
}

/// Copy the blob into the response queue one chunk at a time. Read failures
/// are forwarded so the response body ends with an error, not a short file.
fn stream_blob(reader: &mut dyn Read, chunks: &ChunkSender) -> io::Result<()> {
    let mut buf = vec![0u8; DOWNLOAD_CHUNK];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                let _ = chunks.blocking_send(Err(io::Error::new(err.kind(), err.to_string())));
                return Err(err);
            }
        };
        if chunks
            .blocking_send(Ok(Bytes::copy_from_slice(&buf[..read])))
            .is_err()
        {
            return Err(client_gone());
        }
    }
}

fn content_disposition(filename: &str) -> String {
    let safe: String = filename
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == '"' || c == '\\' { '_' } else { c })
        .collect();
    format!("inline; filename=\"{safe}\"")
}

/// GET /{pile}/ - list live entries, oldest first
pub async fn handle_list_pile(
    State(state): State<SharedState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    AxumPath(pile): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    state.record_request();
    let result = list_pile(&state, remote, &pile, &headers).await;
    with_origin(&state, &pile, result)
}

async fn list_pile(
    state: &SharedState,
    remote: SocketAddr,
    pile: &str,
    headers: &HeaderMap,
) -> Result<Json<ListResponse>, ApiError> {
    let peer = determine_peer(remote, headers, state.config.forward_header());
    admit(state, &peer, pile, "list")?;

    let settings = state.config.pile(pile).map_err(|_| {
        info!(peer = %peer, pile, operation = "list", "Unknown pile");
        ApiError::pile_not_found()
    })?;
    if !has_bearer_token(&settings.list_key, authorization(headers)) {
        warn!(peer = %peer, pile, operation = "list", "Invalid or missing bearer token");
        return Err(ApiError::forbidden());
    }

    let storage = Arc::clone(&state.storage);
    let pile_name = pile.to_string();
    let entries = tokio::task::spawn_blocking(move || storage.get_pile_entries(&pile_name))
        .await
        .map_err(|err| join_failure(err, "list"))?
        .map_err(|err| storage_failure(err, &peer, "list"))?;

    let now = Utc::now();
    let mut live: Vec<(String, EntryMeta)> = entries
        .into_iter()
        .filter(|(entry, meta)| {
            let expired = settings.lifetime.is_expired(meta.created(), now);
            if expired {
                debug!(peer = %peer, pile, entry = %entry, operation = "list", "Expired, but not swept yet");
            }
            !expired
        })
        .collect();
    live.sort_by(|(a_id, a), (b_id, b)| a.created().cmp(&b.created()).then_with(|| a_id.cmp(b_id)));

    info!(peer = %peer, pile, operation = "list", entries = live.len(), "Served listing");
    Ok(Json(ListResponse {
        format: 1,
        lifetime: settings.lifetime.to_string(),
        origin: settings.origin.clone(),
        entries: live
            .into_iter()
            .map(|(entry, meta)| ListedEntry {
                filename: meta.filename().to_string(),
                uploaded: format_timestamp(meta.created()),
                entry,
            })
            .collect(),
    }))
}
