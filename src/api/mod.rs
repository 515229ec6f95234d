//! Management API module
//!
//! HTTP endpoints for operating the mixer:
//! - Health check
//! - Mixer statistics snapshot
//! - Per-session statistics and full-rate distance tuning
//!
//! The API is built with Axum and only reads mixer state, apart from the
//! per-session distance setting.

pub mod error;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::api::error::ApiError;
use crate::session::{SessionId, SessionRegistry};
use crate::stats::{MixerSnapshot, SessionStats, StatsReporter};

/// API version prefix
pub const API_VERSION: &str = "v1";

/// Shared API state
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<SessionRegistry>,
    pub stats: StatsReporter,
}

impl ApiState {
    pub fn new(registry: Arc<SessionRegistry>, stats: StatsReporter) -> Self {
        Self { registry, stats }
    }
}

/// Body of a full-rate distance update
#[derive(Debug, Deserialize)]
pub struct FullRateDistanceRequest {
    pub max_full_rate_distance: f32,
}

/// Create the API router with all endpoints
pub fn create_router(state: ApiState) -> Router {
    let session_routes = Router::new()
        .route("/:id", get(get_session))
        .route("/:id/max-full-rate-distance", put(set_max_full_rate_distance));

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .nest("/sessions", session_routes);

    Router::new()
        .nest(&format!("/api/{}", API_VERSION), api_routes)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Mixer statistics snapshot
async fn get_stats(State(state): State<ApiState>) -> Json<MixerSnapshot> {
    Json(state.stats.snapshot())
}

/// Statistics for one session
async fn get_session(
    State(state): State<ApiState>,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionStats>, ApiError> {
    state
        .registry
        .get(id)
        .map(|session| Json(SessionStats::from_session(&session)))
        .ok_or_else(|| ApiError::NotFound(format!("Session {}", id)))
}

/// Change the full-rate distance a session applies when observing
async fn set_max_full_rate_distance(
    State(state): State<ApiState>,
    Path(id): Path<SessionId>,
    Json(request): Json<FullRateDistanceRequest>,
) -> Result<Json<SessionStats>, ApiError> {
    let distance = request.max_full_rate_distance;
    if !distance.is_finite() || distance < 0.0 {
        return Err(ApiError::InvalidInput(
            "max_full_rate_distance must be a non-negative number".to_string(),
        ));
    }

    let session = state
        .registry
        .get(id)
        .ok_or_else(|| ApiError::NotFound(format!("Session {}", id)))?;
    session.set_max_full_rate_distance(distance);
    info!(session_id = id, distance = distance, "Full rate distance updated");

    Ok(Json(SessionStats::from_session(&session)))
}
