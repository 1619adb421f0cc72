//! Job domain types

use serde::{Deserialize, Serialize};

/// A job handed out by the job source in response to a job request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: i64,

    /// Per-job token used to authenticate trace and state updates
    pub token: String,

    pub job_info: JobInfo,

    #[serde(default)]
    pub steps: Vec<Step>,

    #[serde(default)]
    pub variables: Vec<JobVariable>,

    /// Maximum run time in seconds, `None` lets the runner decide
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl JobResponse {
    /// Credentials needed to report progress for this job
    pub fn credentials(&self, url: &str) -> JobCredentials {
        JobCredentials {
            id: self.id,
            token: self.token.clone(),
            url: url.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub name: String,

    #[serde(default)]
    pub stage: String,

    pub project_id: i64,

    #[serde(default)]
    pub project_name: String,
}

/// One scripted step of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,

    #[serde(default)]
    pub script: Vec<String>,

    #[serde(default)]
    pub allow_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobVariable {
    pub key: String,
    pub value: String,
}

/// Identity of an accepted job, used for trace and state updates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCredentials {
    pub id: i64,
    pub token: String,
    pub url: String,
}

/// Job state as reported back to the job source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Success => write!(f, "success"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Why a job failed, as reported to the job source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The job's own script exited with an error
    ScriptFailure,

    /// The runner could not execute the job
    RunnerSystemFailure,

    /// The job exceeded its timeout
    JobExecutionTimeout,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::ScriptFailure => write!(f, "script_failure"),
            FailureReason::RunnerSystemFailure => write!(f, "runner_system_failure"),
            FailureReason::JobExecutionTimeout => write!(f, "job_execution_timeout"),
        }
    }
}
