use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::SharedState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub queue_open: i64,
    pub workers: usize,
}

pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let queue_open = state.store.open_entry_count().unwrap_or(-1);
    Json(HealthResponse {
        status: if queue_open >= 0 { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue_open,
        workers: state.config.workers,
    })
}
