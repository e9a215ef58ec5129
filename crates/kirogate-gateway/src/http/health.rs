use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app::AppState;

/// GET /health — liveness plus a pool summary.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let counts = state.pool.counts().await;
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "accounts": counts,
    }))
}
