//! Play history API of the history service.
//!
//! `GET /history` returns the caller's most recent plays, newest first.

use std::sync::Arc;

use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::http::cors_layer;
use crate::api::{AuthenticatedUser, ServerError};
use crate::auth::Authenticator;
use crate::broker::consumer::{HistoryEntry, HistoryReader};
use crate::error::{EncoreError, EncoreResult};

/// Service identifier reported by the health endpoint.
pub const HISTORY_SERVICE_ID: &str = "history";

/// Plays returned by `GET /history`.
pub const HISTORY_LIMIT: usize = 15;

/// Shared state of the history API.
#[derive(Clone)]
pub struct HistoryState {
    pub reader: Arc<dyn HistoryReader>,
    pub authenticator: Arc<dyn Authenticator>,
    /// CORS origins; empty allows any origin without credentials.
    pub allowed_origins: Arc<Vec<String>>,
}

impl FromRequestParts<HistoryState> for AuthenticatedUser {
    type Rejection = EncoreError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &HistoryState,
    ) -> Result<Self, Self::Rejection> {
        state.authenticator.authenticate(&parts.headers).map(Self)
    }
}

/// Builds the router for the history service.
pub fn create_history_router(state: HistoryState) -> Router {
    let cors = cors_layer(&state.allowed_origins);
    Router::new()
        .route("/health", get(health_check))
        .route("/history", get(recent_plays))
        .layer(cors)
        .with_state(state)
}

/// Serves the history API on a bound listener until `shutdown` fires.
pub async fn serve_history(
    listener: TcpListener,
    state: HistoryState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("History API listening on http://{}", addr);
    }
    axum::serve(listener, create_history_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    log::info!("[History] API stopped");
    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": HISTORY_SERVICE_ID,
    }))
}

/// `GET /history`
async fn recent_plays(
    State(state): State<HistoryState>,
    AuthenticatedUser(principal): AuthenticatedUser,
) -> EncoreResult<Json<Vec<HistoryEntry>>> {
    let entries = state
        .reader
        .recent(principal.user_id, HISTORY_LIMIT)
        .await
        .inspect_err(|e| {
            log::error!(
                "[History] Reading history of user {} failed: {}",
                principal.user_id,
                e
            )
        })?;
    Ok(Json(entries))
}
