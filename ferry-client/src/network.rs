//! Contracts the scheduler consumes from the network layer

use async_trait::async_trait;
use ferry_core::domain::job::{FailureReason, JobCredentials, JobResponse};
use ferry_core::domain::runner::RunnerCredentials;
use ferry_core::domain::session::SessionInfo;
use std::sync::Arc;

use crate::error::Result;

/// Job source operations used by the scheduler
#[async_trait]
pub trait Network: Send + Sync {
    /// Asks the job source for a job
    ///
    /// Returns the job, if any, and whether the request itself succeeded at
    /// the transport level. "No job available" is a healthy response.
    async fn request_job(
        &self,
        runner: &RunnerCredentials,
        session: Option<&SessionInfo>,
    ) -> (Option<JobResponse>, bool);

    /// Marks an accepted job as running and opens its trace
    async fn process_job(
        &self,
        runner: &RunnerCredentials,
        job: &JobCredentials,
    ) -> Result<Arc<dyn JobTrace>>;
}

/// Output channel and final state reporter for one job
///
/// `success` and `fail` complete the trace; only the first completion is
/// reported, later ones are ignored.
#[async_trait]
pub trait JobTrace: Send + Sync {
    /// Appends a line of job output
    fn write(&self, line: &str);

    /// Flushes remaining output and reports the job as succeeded
    async fn success(&self);

    /// Flushes remaining output and reports the job as failed
    async fn fail(&self, message: &str, reason: FailureReason);
}
