use crate::server::state::AppState;
use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

/// Health endpoint with basic cache statistics
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "link_cache_entries": state.resolver.cache_len(),
        "video_cache_entries": state.pipeline.cache_len().await,
    }))
}
