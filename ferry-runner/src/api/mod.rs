//! Metrics and debug HTTP server

pub mod debug;
pub mod error;
pub mod health;
pub mod metrics;

use axum::{Router, routing::get};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::ConfigStore;
use crate::metrics::SchedulerMetrics;
use crate::scheduler::AdmissionController;

#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<ConfigStore>,
    pub admission: Arc<AdmissionController>,
    pub metrics: Arc<SchedulerMetrics>,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::metrics))
        .route("/debug/jobs/list", get(debug::list_jobs))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serves the router until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::Build;
    use crate::config::Config;
    use crate::executor::ExecutorData;
    use crate::testing::{job, runner};
    use axum::body::to_bytes;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    fn state() -> ApiState {
        let mut config = Config::default();
        config.concurrent = 2;
        config.runners.push(Arc::new(runner("abcdefghijkl", 3)));

        ApiState {
            config: Arc::new(ConfigStore::from_config(config)),
            admission: Arc::new(AdmissionController::new()),
            metrics: Arc::new(SchedulerMetrics::new().unwrap()),
        }
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn register_build(state: &ApiState, id: i64) {
        let runner = Arc::clone(&state.config.snapshot().runners[0]);
        state.admission.add_build(Build::new(
            job(id, 10),
            runner,
            ExecutorData::new("mock"),
            CancellationToken::new(),
        ));
    }

    #[tokio::test]
    async fn test_metrics_refreshes_gauges() {
        let state = state();
        register_build(&state, 1);

        let response = metrics::metrics(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let text = body_text(response).await;
        assert!(text.contains("ferry_runner_concurrent 2"));
        assert!(text.contains("ferry_runner_limit"));
        assert!(text.contains("state=\"pending\""));
    }

    #[tokio::test]
    async fn test_debug_list() {
        let state = state();
        register_build(&state, 7);
        register_build(&state, 8);

        let response = debug::list_jobs(State(state)).await.into_response();
        assert_eq!(response.headers()["x-list-version"], "2");

        let text = body_text(response).await;
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("url=http://localhost:8080/jobs/7 state=pending stage=prepare_executor duration="));
        assert!(lines[1].contains("/jobs/8"));
    }

    #[tokio::test]
    async fn test_health() {
        let state = state();
        register_build(&state, 1);

        let response = health::health_check(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, r#"{"builds":1,"status":"ok"}"#);
    }
}
