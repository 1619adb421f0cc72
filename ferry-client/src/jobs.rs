//! Job-related endpoints of the job source

use async_trait::async_trait;
use ferry_core::domain::job::{JobCredentials, JobResponse};
use ferry_core::domain::runner::RunnerCredentials;
use ferry_core::domain::session::SessionInfo;
use ferry_core::dto::job::{RequestJob, UpdateJob};
use reqwest::StatusCode;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::HttpNetwork;
use crate::error::Result;
use crate::network::{JobTrace, Network};
use crate::trace::HttpJobTrace;

/// How a job request response status is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestOutcome {
    /// 201: a job was assigned
    Job,
    /// 204: nothing to do right now
    NoJob,
    /// 403: the runner token was rejected
    Forbidden,
    /// 503: the job source is temporarily unavailable
    Unavailable,
    /// Anything else
    Unexpected(u16),
}

impl RequestOutcome {
    pub(crate) fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::CREATED => Self::Job,
            StatusCode::NO_CONTENT => Self::NoJob,
            StatusCode::FORBIDDEN => Self::Forbidden,
            StatusCode::SERVICE_UNAVAILABLE => Self::Unavailable,
            other => Self::Unexpected(other.as_u16()),
        }
    }

    /// Whether the request counts as healthy for the runner's circuit breaker
    pub(crate) fn is_healthy(&self) -> bool {
        !matches!(self, Self::Forbidden)
    }
}

impl HttpNetwork {
    // =============================================================================
    // Job State
    // =============================================================================

    /// Sends a job state update
    pub(crate) async fn update_job(&self, job: &JobCredentials, update: &UpdateJob) -> Result<()> {
        let url = Self::endpoint(&job.url, &format!("jobs/{}", job.id));
        let response = self.client.put(&url).json(update).send().await?;

        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Job Trace
    // =============================================================================

    /// Appends a chunk of trace output starting at `offset`
    pub(crate) async fn patch_trace(
        &self,
        job: &JobCredentials,
        offset: usize,
        chunk: String,
    ) -> Result<()> {
        let url = Self::endpoint(&job.url, &format!("jobs/{}/trace", job.id));
        let response = self
            .client
            .patch(&url)
            .header("JOB-TOKEN", &job.token)
            .header("Content-Range", content_range(offset, chunk.len()))
            .header("Content-Type", "text/plain")
            .body(chunk)
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}

/// Byte range header value for a chunk of `len` bytes at `offset`
pub(crate) fn content_range(offset: usize, len: usize) -> String {
    format!("{}-{}", offset, (offset + len).saturating_sub(1))
}

#[async_trait]
impl Network for HttpNetwork {
    async fn request_job(
        &self,
        runner: &RunnerCredentials,
        session: Option<&SessionInfo>,
    ) -> (Option<JobResponse>, bool) {
        let url = Self::endpoint(&runner.url, "jobs/request");
        let body = RequestJob {
            token: runner.token.clone(),
            session: session.cloned(),
        };

        let response = match self.client.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    runner = %runner.short_description(),
                    "Checking for jobs... error: {}", e
                );
                return (None, false);
            }
        };

        let outcome = RequestOutcome::from_status(response.status());
        match outcome {
            RequestOutcome::Job => match response.json::<JobResponse>().await {
                Ok(job) => {
                    info!(
                        runner = %runner.short_description(),
                        job = job.id,
                        "Checking for jobs... received"
                    );
                    (Some(job), true)
                }
                Err(e) => {
                    error!(
                        runner = %runner.short_description(),
                        "Error decoding job payload: {}", e
                    );
                    (None, false)
                }
            },
            RequestOutcome::NoJob => {
                debug!(runner = %runner.short_description(), "Checking for jobs... nothing");
                (None, true)
            }
            RequestOutcome::Forbidden => {
                error!(runner = %runner.short_description(), "Checking for jobs... forbidden");
                (None, false)
            }
            RequestOutcome::Unavailable => {
                warn!(
                    runner = %runner.short_description(),
                    "Checking for jobs... job source unavailable"
                );
                (None, outcome.is_healthy())
            }
            RequestOutcome::Unexpected(status) => {
                warn!(
                    runner = %runner.short_description(),
                    status,
                    "Checking for jobs... failed"
                );
                (None, outcome.is_healthy())
            }
        }
    }

    async fn process_job(
        &self,
        runner: &RunnerCredentials,
        job: &JobCredentials,
    ) -> Result<Arc<dyn JobTrace>> {
        self.update_job(job, &UpdateJob::running(&job.token)).await?;

        debug!(
            runner = %runner.short_description(),
            job = job.id,
            "Job marked as running"
        );

        let trace: Arc<dyn JobTrace> = HttpJobTrace::start(self.clone(), job.clone());
        Ok(trace)
    }
}
