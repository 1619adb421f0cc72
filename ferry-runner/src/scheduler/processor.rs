//! Job processor
//!
//! One cycle for one offered runner: reserve executor capacity and a build
//! slot, ask the job source for a job, and run it if one is handed out.
//! Every reservation taken by a cycle is returned exactly once, whatever
//! path the cycle leaves by.

use async_trait::async_trait;
use ferry_client::{ClientError, Network};
use ferry_core::domain::session::FeaturesInfo;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::build::{Build, BuildError};
use crate::config::RunnerConfig;
use crate::executor::{ExecutorData, ExecutorError, ExecutorProvider, ExecutorRegistry};
use crate::metrics::SchedulerMetrics;
use crate::scheduler::offers::OfferQueue;
use crate::scheduler::pool::RunnerCycle;
use crate::scheduler::{AdmissionController, HealthMonitor};
use crate::session::{Session, SessionServer};

/// How a cycle ended when nothing went wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    NoJob,
    RunnerLimitMet,
    RequestConcurrencyMet,
    UnknownExecutor,
    Interrupted,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to acquire executor: {0}")]
    NoFreeExecutor(#[source] ExecutorError),

    #[error("failed to start job {job}: {source}")]
    ProcessJob {
        job: i64,
        #[source]
        source: ClientError,
    },

    #[error("job {job} failed: {source}")]
    Build {
        job: i64,
        #[source]
        source: BuildError,
    },
}

impl ProcessError {
    /// Label used by the processing failure counter
    pub fn failure_type(&self) -> &'static str {
        match self {
            ProcessError::NoFreeExecutor(_) => "no_free_executor",
            ProcessError::Build { .. } => "job_failure",
            ProcessError::ProcessJob { .. } => "other",
        }
    }

    /// Failures that are part of normal operation and only logged at debug
    pub fn is_expected(&self) -> bool {
        !matches!(self, ProcessError::ProcessJob { .. })
    }
}

/// Removes a build from the live registry when dropped
struct BuildRegistration {
    admission: Arc<AdmissionController>,
    build: Arc<Build>,
}

impl Drop for BuildRegistration {
    fn drop(&mut self) {
        self.admission.remove_build(&self.build);
    }
}

pub struct JobProcessor {
    network: Arc<dyn Network>,
    executors: Arc<ExecutorRegistry>,
    admission: Arc<AdmissionController>,
    health: Arc<HealthMonitor>,
    metrics: Arc<SchedulerMetrics>,
    sessions: Option<Arc<SessionServer>>,
    requeue: Arc<OfferQueue>,
    /// Abandons in-flight job requests
    interrupt: CancellationToken,
    /// Shared by every build; cancelled on forced shutdown
    abort_builds: CancellationToken,
}

impl JobProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network: Arc<dyn Network>,
        executors: Arc<ExecutorRegistry>,
        admission: Arc<AdmissionController>,
        health: Arc<HealthMonitor>,
        metrics: Arc<SchedulerMetrics>,
        requeue: Arc<OfferQueue>,
        interrupt: CancellationToken,
        abort_builds: CancellationToken,
    ) -> Self {
        Self {
            network,
            executors,
            admission,
            health,
            metrics,
            sessions: None,
            requeue,
            interrupt,
            abort_builds,
        }
    }

    pub fn with_sessions(mut self, sessions: Option<Arc<SessionServer>>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Runs one cycle for `runner`
    pub async fn process_runner(
        &self,
        worker: usize,
        runner: &Arc<RunnerConfig>,
    ) -> Result<CycleOutcome, ProcessError> {
        let Some(provider) = self.executors.get(&runner.executor) else {
            error!(
                worker,
                runner = %runner.short_description(),
                executor = %runner.executor,
                "Executor not found"
            );
            return Ok(CycleOutcome::UnknownExecutor);
        };

        let data = provider
            .acquire(runner)
            .await
            .map_err(ProcessError::NoFreeExecutor)?;

        if !self.admission.acquire_build(runner) {
            provider.release(runner, data).await;
            debug!(
                worker,
                runner = %runner.short_description(),
                "Failed to request job, runner limit met"
            );
            return Ok(CycleOutcome::RunnerLimitMet);
        }

        let result = self
            .process_with_slot(worker, runner, provider.as_ref(), &data)
            .await;

        provider.release(runner, data).await;
        self.admission.release_build(runner);
        result
    }

    async fn process_with_slot(
        &self,
        worker: usize,
        runner: &Arc<RunnerConfig>,
        provider: &dyn ExecutorProvider,
        data: &ExecutorData,
    ) -> Result<CycleOutcome, ProcessError> {
        let mut features = FeaturesInfo::default();
        provider.features(&mut features);

        let session = match &self.sessions {
            Some(server) if features.session => Some(server.create_session()),
            _ => None,
        };

        let result = self
            .request_and_run(worker, runner, provider, data, session.as_ref())
            .await;

        if let (Some(server), Some(session)) = (&self.sessions, &session) {
            server.close_session(&session.id);
        }
        result
    }

    async fn request_and_run(
        &self,
        worker: usize,
        runner: &Arc<RunnerConfig>,
        provider: &dyn ExecutorProvider,
        data: &ExecutorData,
        session: Option<&Session>,
    ) -> Result<CycleOutcome, ProcessError> {
        if !self.admission.acquire_request(runner) {
            self.metrics.request_concurrency_exceeded(runner);
            debug!(
                worker,
                runner = %runner.short_description(),
                "Request concurrency limit reached, skipping job request"
            );
            return Ok(CycleOutcome::RequestConcurrencyMet);
        }

        let response = tokio::select! {
            biased;
            _ = self.interrupt.cancelled() => None,
            response = self
                .network
                .request_job(&runner.credentials, session.map(|s| &s.info)) => Some(response),
        };

        let Some((job, healthy)) = response else {
            self.admission.release_request(runner, false);
            debug!(
                worker,
                runner = %runner.short_description(),
                "Job request abandoned on shutdown"
            );
            return Ok(CycleOutcome::Interrupted);
        };

        self.health.mark_health(runner, healthy);
        self.admission.release_request(runner, job.is_some());

        let Some(job) = job else {
            return Ok(CycleOutcome::NoJob);
        };

        let job_id = job.id;
        info!(
            worker,
            runner = %runner.short_description(),
            job = job_id,
            project = job.job_info.project_id,
            "Received job"
        );

        let credentials = job.credentials(&runner.credentials.url);
        let trace = self
            .network
            .process_job(&runner.credentials, &credentials)
            .await
            .map_err(|source| ProcessError::ProcessJob {
                job: job_id,
                source,
            })?;

        let build = Build::new(
            job,
            Arc::clone(runner),
            data.clone(),
            self.abort_builds.clone(),
        );
        let build = self.admission.add_build(build);
        let _registration = BuildRegistration {
            admission: Arc::clone(&self.admission),
            build: Arc::clone(&build),
        };

        self.requeue(runner);

        let result = build.run(provider, trace.as_ref()).await;
        self.metrics.job_finished(runner, build.duration());

        match result {
            Ok(()) => {
                trace.success().await;
                info!(
                    worker,
                    runner = %runner.short_description(),
                    job = job_id,
                    duration = ?build.duration(),
                    "Job succeeded"
                );
                Ok(CycleOutcome::Completed)
            }
            Err(source) => {
                let message = source.to_string();
                trace.write(&format!("ERROR: Job failed: {}", message));
                trace.fail(&message, source.failure_reason()).await;
                Err(ProcessError::Build {
                    job: job_id,
                    source,
                })
            }
        }
    }

    /// Offers the runner again right away so a busy runner is polled sooner
    fn requeue(&self, runner: &Arc<RunnerConfig>) {
        if runner.strict_check_interval {
            return;
        }

        if self.requeue.try_offer(Arc::clone(runner)) {
            debug!(runner = %runner.short_description(), "Runner requeued");
        } else {
            debug!(
                runner = %runner.short_description(),
                "No idle worker, requeue dropped"
            );
        }
    }
}

#[async_trait]
impl RunnerCycle for JobProcessor {
    async fn process(&self, worker: usize, runner: Arc<RunnerConfig>) {
        match self.process_runner(worker, &runner).await {
            Ok(outcome) => debug!(
                worker,
                runner = %runner.short_description(),
                ?outcome,
                "Cycle finished"
            ),
            Err(e) => {
                self.metrics.processing_failure(e.failure_type(), &runner);
                if e.is_expected() {
                    debug!(worker, runner = %runner.short_description(), "{}", e);
                } else {
                    warn!(worker, runner = %runner.short_description(), "{}", e);
                }
            }
        }
    }
}
