//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to services for business logic.

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method},
    response::IntoResponse,
    routing::{get, on, MethodFilter},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::api::stream::stream_song;
use crate::api::AppState;
use crate::catalog::SongInfo;
use crate::error::{EncoreError, EncoreResult};

/// Service identifier reported by the health endpoints.
pub const SERVICE_ID: &str = "streaming";

/// Builds the router for the streaming service.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.allowed_origins);
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        // GET only: `get` would also answer HEAD, which must not count a play.
        .route("/stream", on(MethodFilter::GET, stream_song))
        .route("/song/{id}/info", get(song_info))
        .layer(cors)
        .with_state(state)
}

/// Credentials are only allowed with an explicit origin list.
pub(crate) fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::RANGE, header::CONTENT_TYPE])
        .expose_headers([
            header::CONTENT_RANGE,
            header::CONTENT_LENGTH,
            header::ACCEPT_RANGES,
            header::CONTENT_TYPE,
        ]);

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("[Server] Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();

    if allowed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer
            .allow_origin(AllowOrigin::list(allowed))
            .allow_credentials(true)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness probe.
async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": SERVICE_ID,
    }))
}

/// Readiness probe.
///
/// Streaming never depends on the broker, so the service is ready either
/// way; the broker link is reported for operators.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let broker_ready = state.publisher.is_connected();
    Json(json!({
        "status": "ready",
        "ready": true,
        "checks": {
            "broker": {
                "ready": broker_ready,
                "info": "optional - publishes reconnect on demand"
            }
        }
    }))
}

/// `GET /song/{id}/info`
async fn song_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EncoreResult<Json<SongInfo>> {
    let id: u64 = id
        .parse()
        .map_err(|_| EncoreError::BadRequest(format!("invalid song id '{}'", id)))?;
    let info = state.catalog.song_info(id).await?;
    Ok(Json(info))
}
