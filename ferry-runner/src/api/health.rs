//! Liveness endpoint

use axum::{Json, extract::State, response::IntoResponse};

use super::ApiState;

/// GET /health
///
/// Reports the number of live builds alongside the status so probes can
/// tell an idle runner from a busy one.
pub async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "builds": state.admission.builds_count(),
    }))
}
