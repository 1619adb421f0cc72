//! Prometheus scrape endpoint

use axum::{extract::State, http::header, response::IntoResponse};

use super::ApiState;
use super::error::ApiResult;

/// GET /metrics
pub async fn metrics(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    state
        .metrics
        .refresh(&state.config.snapshot(), &state.admission);
    let body = state.metrics.encode()?;

    Ok((
        [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
        body,
    ))
}
