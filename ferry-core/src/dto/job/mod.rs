//! Job DTOs sent to the job source

use serde::{Deserialize, Serialize};

use crate::domain::job::{FailureReason, JobState};
use crate::domain::session::SessionInfo;

/// Body of a job request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestJob {
    /// Runner registration token
    pub token: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
}

/// Job state update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJob {
    /// Per-job token
    pub token: String,

    pub state: JobState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

impl UpdateJob {
    pub fn running(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            state: JobState::Running,
            failure_reason: None,
        }
    }

    pub fn success(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            state: JobState::Success,
            failure_reason: None,
        }
    }

    pub fn failed(token: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            token: token.into(),
            state: JobState::Failed,
            failure_reason: Some(reason),
        }
    }
}
