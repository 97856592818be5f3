use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::events::{EventBuffer, Notification};
use crate::domain::registry::{Highscore, NodeLookup, Registry, StatusSummary};

/// Shared application state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub events: Arc<EventBuffer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/nodes/{name}", get(node))
        .route("/api/v1/highscores", get(highscores))
        .route("/api/v1/events", get(events))
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DaemonHealth {
    pub status: String,
    pub version: String,
}

async fn health() -> Json<DaemonHealth> {
    Json(DaemonHealth {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn status(
    State(state): State<AppState>,
) -> Result<Json<StatusSummary>, (StatusCode, String)> {
    state
        .registry
        .status_summary()
        .map(Json)
        .map_err(internal_error)
}

/// Substring lookup by hostname. 404 when nothing matches, ambiguity is
/// reported as a regular result so the client can tell the user to narrow
/// the query.
async fn node(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<NodeLookup>, (StatusCode, String)> {
    let lookup = state.registry.lookup(&name).map_err(internal_error)?;
    if let NodeLookup::Matches { nodes } = &lookup {
        if nodes.is_empty() {
            return Err((StatusCode::NOT_FOUND, format!("no node matches '{}'", name)));
        }
    }
    Ok(Json(lookup))
}

async fn highscores(
    State(state): State<AppState>,
) -> Result<Json<Vec<Highscore>>, (StatusCode, String)> {
    state.registry.highscores().map(Json).map_err(internal_error)
}

/// Most recent notifications, oldest first.
async fn events(State(state): State<AppState>) -> Json<Vec<Notification>> {
    Json(state.events.recent())
}

fn internal_error(err: crate::error::FeedError) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
