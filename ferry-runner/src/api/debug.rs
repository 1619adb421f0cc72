//! Diagnostic listing of live builds

use axum::{
    extract::State,
    http::{HeaderName, header},
    response::IntoResponse,
};
use std::fmt::Write;
use std::time::Duration;

use super::ApiState;

const LIST_VERSION: HeaderName = HeaderName::from_static("x-list-version");

/// GET /debug/jobs/list
///
/// One line per live build, in registration order.
pub async fn list_jobs(State(state): State<ApiState>) -> impl IntoResponse {
    let mut body = String::new();
    for build in state.admission.builds() {
        let duration = Duration::from_millis(build.duration().as_millis() as u64);
        let _ = writeln!(
            body,
            "url={} state={} stage={} duration={:?}",
            build.job_url(),
            build.state(),
            build.stage(),
            duration
        );
    }

    (
        [
            (LIST_VERSION, "2"),
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
        ],
        body,
    )
}
