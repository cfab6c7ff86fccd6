use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and the upstream summary.
pub fn health_handler(state: &AppState) -> Json<Value> {
    let upstream = &state.config.upstream;
    Json(json!({
        "status": "ok",
        "upstream": upstream.base_url,
        "tool_format": upstream.tool_format,
    }))
}
