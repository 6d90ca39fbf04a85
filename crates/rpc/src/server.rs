use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use pilestore_security::RateLimiter;
use pilestore_storage::{Config, PileStorage};
use serde::Serialize;
use std::future::Future;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::files::{handle_get_entry, handle_list_pile, handle_upload};

/// Room for multipart framing on top of the largest pile ceiling.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn PileStorage>,
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    pub start_time: Instant,
    pub req_count: Arc<AtomicUsize>,
    pub metrics: Option<PrometheusHandle>,
    pub version: String,
}

impl AppState {
    pub fn new(
        storage: Arc<dyn PileStorage>,
        config: Arc<Config>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            storage,
            config,
            limiter,
            start_time: Instant::now(),
            req_count: Arc::new(AtomicUsize::new(0)),
            metrics: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub(crate) fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

pub(crate) type SharedState = Arc<AppState>;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    success: bool,
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    success: bool,
    service: &'static str,
    version: String,
    uptime_secs: u64,
    req_total: u64,
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub(crate) fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn status(&self) -> StatusCode {
        self.status
    }

    pub(crate) fn bad_request() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "request too weird")
    }

    pub(crate) fn pile_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "pile not found")
    }

    pub(crate) fn entry_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "entry not found")
    }

    pub(crate) fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "access denied")
    }

    pub(crate) fn too_large() -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "entry too large")
    }

    pub(crate) fn too_many_requests() -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "you need to chill out")
    }

    pub(crate) fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "we messed up on our end")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = Json(ErrorResponse {
            error: self.message,
            success: false,
        });
        (self.status, payload).into_response()
    }
}

/// Serve until `shutdown` resolves.
pub async fn start_server<F>(state: AppState, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
    info!(%addr, "Listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("HTTP server terminated unexpectedly")
}

pub fn build_router(state: SharedState) -> Router {
    let body_limit = state
        .config
        .largest_max_size()
        .saturating_add(MULTIPART_OVERHEAD);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    Router::new()
        .route("/", get(handle_version))
        .route("/metrics", get(handle_metrics))
        .route("/:pile", get(handle_list_pile).post(handle_upload))
        .route("/:pile/", get(handle_list_pile).post(handle_upload))
        .route("/:pile/:entry", get(handle_get_entry))
        .fallback(handle_fallback)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_version(State(state): State<SharedState>) -> Json<VersionResponse> {
    let req_total = state.record_request();
    Json(VersionResponse {
        success: true,
        service: "pilestore",
        version: state.version.clone(),
        uptime_secs: state.uptime_seconds(),
        req_total,
    })
}

async fn handle_metrics(State(state): State<SharedState>) -> Result<Response, ApiError> {
    state.record_request();
    let Some(handle) = state.metrics.as_ref() else {
        return Err(ApiError::bad_request());
    };
    let mut response = Response::new(Body::from(handle.render()));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    Ok(response)
}

async fn handle_fallback() -> ApiError {
    ApiError::bad_request()
}
