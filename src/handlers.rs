//! Axum handlers and application state wiring, following the teacher's
//! `AppState` + handler-function layout. The `/<host>/<path...>` surface
//! delegates all real decision-making to [`crate::pipeline`]; the handlers
//! here are thin adapters plus the operational side endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::admission::OriginAdmission;
use crate::cache_port::CachePort;
use crate::config::Config;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::origin_fetcher::OriginFetch;
use crate::pipeline;
use crate::usage::UsageAggregator;

pub struct AppState {
    pub cache: Arc<dyn CachePort>,
    pub admission: Arc<OriginAdmission>,
    pub origin: Arc<dyn OriginFetch>,
    pub usage: Arc<UsageAggregator>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<Config>,
}

/// Shared entry point for the `GET`/`HEAD` catch-all route.
pub async fn media_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let client_ip = Some(addr.ip().to_string());
    pipeline::handle_request(&state, method, &uri, &headers, client_ip).await
}

/// `OPTIONS` preflight, per §4.7: 204 with CORS headers supplied by the
/// `CorsLayer` wrapping the whole router in `main.rs`.
pub async fn options_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// `DELETE` on the media surface is reserved for a future authenticated
/// invalidation API; until then it is simply disallowed.
pub async fn delete_handler() -> StatusCode {
    StatusCode::METHOD_NOT_ALLOWED
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timestamp: String,
}

pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Non-sensitive operational snapshot sourced from the metrics registry, not
/// from any user-supplied state.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.gather(),
    )
}
