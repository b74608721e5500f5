//! HTTP server exposing the tile cache to rendering surfaces
//!
//! Provides /health, /tile?url=..., /cache/tiles, /cache/evict and DELETE /cache.

use crate::types::{sniff_content_type, HealthResponse, TileQuery};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tile_cache::{EvictionEngine, TileLoadCoordinator, TileOutcome};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

const CACHING_DISABLED_NOTICE: &str = "offline caching disabled this session";

/// Shared state for the HTTP server
pub struct ServerState {
    pub coordinator: TileLoadCoordinator,
    pub eviction: Option<Arc<EvictionEngine>>,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(coordinator: TileLoadCoordinator, eviction: Option<Arc<EvictionEngine>>) -> Self {
        Self {
            coordinator,
            eviction,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tile", get(get_tile))
        .route("/cache/tiles", get(list_tiles))
        .route("/cache/evict", post(evict))
        .route("/cache", delete(reset_cache))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let caching_enabled = state.coordinator.caching_enabled();
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        caching_enabled,
        notice: (!caching_enabled).then(|| CACHING_DISABLED_NOTICE.to_string()),
        cache: state.coordinator.stats().await,
    })
}

/// Resolve one tile for the rendering surface
async fn get_tile(State(state): State<SharedState>, Query(query): Query<TileQuery>) -> Response {
    match url::Url::parse(&query.url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
        _ => {
            warn!(url = %query.url, "Rejected tile request");
            return error_response(StatusCode::BAD_REQUEST, "url must be an http(s) URL");
        }
    }

    let outcome = state.coordinator.load(&query.url).await;
    let cache_header = match &outcome {
        TileOutcome::Hit(_) => "HIT",
        TileOutcome::Fetched(_) => "MISS",
        TileOutcome::Bypassed(_) => "BYPASS",
        TileOutcome::Direct(url) => return Redirect::temporary(url).into_response(),
    };

    let Some(data) = outcome.bytes().cloned() else {
        return error_response(StatusCode::BAD_GATEWAY, "tile unavailable");
    };

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, sniff_content_type(&data)),
            (header::CACHE_CONTROL, "public, max-age=86400"),
            (HeaderName::from_static("x-cache"), cache_header),
        ],
        Body::from(data),
    )
        .into_response()
}

/// Snapshot of the usage index
async fn list_tiles(State(state): State<SharedState>) -> Response {
    match state.coordinator.cache() {
        Some(cache) if state.coordinator.caching_enabled() => {
            Json(cache.records().await).into_response()
        }
        _ => error_response(StatusCode::SERVICE_UNAVAILABLE, CACHING_DISABLED_NOTICE),
    }
}

/// Run an eviction check now
async fn evict(State(state): State<SharedState>) -> Response {
    let Some(engine) = state.eviction.as_ref() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, CACHING_DISABLED_NOTICE);
    };

    match engine.check().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            error!(error = %e, "Eviction check failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "eviction failed")
        }
    }
}

/// Destroy every cached tile and record
async fn reset_cache(State(state): State<SharedState>) -> Response {
    let Some(cache) = state.coordinator.cache() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, CACHING_DISABLED_NOTICE);
    };

    match cache.reset().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!(error = %e, "Cache reset failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "reset failed")
        }
    }
}
