//! Presence queries for the back office console.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/presence/stats", get(stats))
        .route("/presence/online/{user_id}", get(online))
}

#[derive(Debug, Serialize)]
pub struct PresenceStats {
    pub online_users: usize,
    pub online_connections: usize,
}

async fn stats(State(state): State<AppState>) -> Json<PresenceStats> {
    Json(PresenceStats {
        online_users: state.registry.online_user_count(),
        online_connections: state.registry.online_connection_count(),
    })
}

#[derive(Debug, Serialize)]
pub struct OnlineStatus {
    pub user_id: String,
    pub online: bool,
    pub connections: usize,
}

async fn online(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<OnlineStatus> {
    let connections = state.registry.clients_for_user(&user_id).len();
    Json(OnlineStatus {
        online: connections > 0,
        user_id,
        connections,
    })
}
