//! Interactive session server
//!
//! When an executor supports interactive sessions, each build gets a session
//! endpoint that is advertised to the job source together with a bearer
//! token. The server only tracks which sessions exist and answers status
//! requests; attaching terminals is left to the executor backends.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use ferry_core::domain::session::SessionInfo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::SessionServerConfig;

/// A session created for one build
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub info: SessionInfo,
}

#[derive(Default)]
struct SessionState {
    /// Session id to expected `Authorization` value
    sessions: Mutex<HashMap<String, String>>,
}

pub struct SessionServer {
    config: SessionServerConfig,
    state: Arc<SessionState>,
    shutdown: CancellationToken,
}

impl SessionServer {
    pub fn new(config: SessionServerConfig) -> Self {
        Self {
            config,
            state: Arc::new(SessionState::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Binds the listener and serves session requests until [`SessionServer::close`]
    pub async fn start(&self) -> std::io::Result<JoinHandle<()>> {
        let listener = tokio::net::TcpListener::bind(&self.config.listen_address).await?;
        info!(
            "Session server listening on {} (advertised as {})",
            self.config.listen_address,
            self.config.advertise_url()
        );

        let app = Router::new()
            .route("/session/{id}", get(session_status))
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http());

        let shutdown = self.shutdown.clone();
        Ok(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!("Session server error: {}", e);
            }
        }))
    }

    pub fn create_session(&self) -> Session {
        let id = Uuid::new_v4().simple().to_string();
        let token = Uuid::new_v4().simple().to_string();
        self.state.sessions.lock().insert(id.clone(), token.clone());

        debug!(session = %id, "Session created");
        Session {
            info: SessionInfo {
                url: format!("{}/session/{}", self.config.advertise_url(), id),
                authorization: token,
            },
            id,
        }
    }

    pub fn close_session(&self, id: &str) -> bool {
        let removed = self.state.sessions.lock().remove(id).is_some();
        if removed {
            debug!(session = %id, "Session closed");
        }
        removed
    }

    pub fn active_sessions(&self) -> usize {
        self.state.sessions.lock().len()
    }

    /// Stops serving and drops every session; safe to call more than once
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let dropped = self.active_sessions();
        self.state.sessions.lock().clear();
        info!("Session server closed ({} active session(s) dropped)", dropped);
    }
}

/// GET /session/{id}
async fn session_status(
    State(state): State<Arc<SessionState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let expected = state.sessions.lock().get(&id).cloned();
    let Some(expected) = expected else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if provided != Some(expected.as_str()) {
        return (StatusCode::UNAUTHORIZED, "invalid session token").into_response();
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({ "id": id, "status": "active" })),
    )
        .into_response()
}
