//! Build execution context
//!
//! A [`Build`] is created for every accepted job. It carries the job, the
//! runner it came from and the executor capacity reserved for it, and it
//! tracks the state and stage reported by metrics and the debug endpoint.
//!
//! Builds observe two cancellation sources while running: the shared abort
//! token pumped by a forced shutdown, and their own timeout.

use ferry_client::JobTrace;
use ferry_core::domain::build::{BuildStage, BuildState};
use ferry_core::domain::job::{FailureReason, JobResponse};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RunnerConfig;
use crate::executor::{Executor, ExecutorData, ExecutorError, ExecutorProvider};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build aborted by shutdown")]
    Aborted,

    #[error("execution took longer than {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl BuildError {
    /// Failure reason reported to the job source
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            BuildError::Executor(ExecutorError::ScriptFailed(_)) => FailureReason::ScriptFailure,
            BuildError::Timeout(_) => FailureReason::JobExecutionTimeout,
            _ => FailureReason::RunnerSystemFailure,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    state: BuildState,
    stage: BuildStage,
}

/// One accepted job's execution context
pub struct Build {
    job: JobResponse,
    runner: Arc<RunnerConfig>,
    executor_data: ExecutorData,
    runner_id: usize,
    project_runner_id: usize,
    progress: Mutex<Progress>,
    created_at: Instant,
    abort: CancellationToken,
}

impl Build {
    pub fn new(
        job: JobResponse,
        runner: Arc<RunnerConfig>,
        executor_data: ExecutorData,
        abort: CancellationToken,
    ) -> Self {
        Self {
            job,
            runner,
            executor_data,
            runner_id: 0,
            project_runner_id: 0,
            progress: Mutex::new(Progress {
                state: BuildState::Pending,
                stage: BuildStage::PrepareExecutor,
            }),
            created_at: Instant::now(),
            abort,
        }
    }

    /// Set by the admission controller before the build is registered
    pub(crate) fn assign_ids(&mut self, runner_id: usize, project_runner_id: usize) {
        self.runner_id = runner_id;
        self.project_runner_id = project_runner_id;
    }

    pub fn job(&self) -> &JobResponse {
        &self.job
    }

    pub fn runner(&self) -> &Arc<RunnerConfig> {
        &self.runner
    }

    pub fn token(&self) -> &str {
        self.runner.token()
    }

    pub fn project_id(&self) -> i64 {
        self.job.job_info.project_id
    }

    /// Smallest id not held by another live build of the same runner
    pub fn runner_id(&self) -> usize {
        self.runner_id
    }

    /// Smallest id not held by another live build of the same runner and project
    pub fn project_runner_id(&self) -> usize {
        self.project_runner_id
    }

    pub fn state(&self) -> BuildState {
        self.progress.lock().state
    }

    pub fn stage(&self) -> BuildStage {
        self.progress.lock().stage
    }

    fn set_state(&self, state: BuildState) {
        self.progress.lock().state = state;
    }

    fn set_stage(&self, stage: BuildStage) {
        self.progress.lock().stage = stage;
    }

    pub fn duration(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn job_url(&self) -> String {
        format!(
            "{}/jobs/{}",
            self.runner.credentials.url.trim_end_matches('/'),
            self.job.id
        )
    }

    /// Job timeout from the job source, or the runner's default
    pub fn timeout(&self) -> Duration {
        self.job
            .timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.runner.job_timeout())
    }

    /// Environment exported to job scripts
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("FERRY_JOB_ID".to_string(), self.job.id.to_string()),
            ("FERRY_JOB_NAME".to_string(), self.job.job_info.name.clone()),
            ("FERRY_JOB_STAGE".to_string(), self.job.job_info.stage.clone()),
            ("FERRY_PROJECT_ID".to_string(), self.project_id().to_string()),
            ("FERRY_CONCURRENT_ID".to_string(), self.runner_id.to_string()),
            (
                "FERRY_CONCURRENT_PROJECT_ID".to_string(),
                self.project_runner_id.to_string(),
            ),
            ("FERRY_RUNNER_SHORT_TOKEN".to_string(), self.runner.short_description()),
        ];
        env.extend(
            self.job
                .variables
                .iter()
                .map(|v| (v.key.clone(), v.value.clone())),
        );
        env
    }

    /// Runs the job to completion, abort or timeout
    ///
    /// Cleanup always runs once the steps stop, whatever the outcome.
    pub async fn run(
        &self,
        provider: &dyn ExecutorProvider,
        trace: &dyn JobTrace,
    ) -> Result<(), BuildError> {
        let mut executor = provider.create();
        let timeout = self.timeout();

        info!(
            runner = %self.runner.short_description(),
            job = self.job.id,
            executor = %self.executor_data.id,
            provider = %self.executor_data.provider,
            "Running job (timeout {:?})", timeout
        );
        self.set_state(BuildState::Running);

        let result = tokio::select! {
            biased;
            _ = self.abort.cancelled() => Err(BuildError::Aborted),
            _ = time::sleep(timeout) => Err(BuildError::Timeout(timeout)),
            result = self.execute(executor.as_mut(), trace) => result,
        };

        self.set_stage(BuildStage::Cleanup);
        executor.cleanup(self).await;
        self.set_state(BuildState::Finished);

        debug!(
            job = self.job.id,
            duration = ?self.duration(),
            "Build finished"
        );
        result
    }

    async fn execute(
        &self,
        executor: &mut dyn Executor,
        trace: &dyn JobTrace,
    ) -> Result<(), BuildError> {
        self.set_stage(BuildStage::PrepareExecutor);
        executor.prepare(self, trace).await?;

        self.set_stage(BuildStage::StepScript);
        for step in &self.job.steps {
            trace.write(&format!("Executing step {}", step.name));
            executor.run_step(self, step, trace).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockProvider, RecordingTrace, job, runner};

    fn build_with(job: JobResponse, abort: CancellationToken) -> Build {
        Build::new(
            job,
            Arc::new(runner("token-1", 0)),
            ExecutorData::new("mock"),
            abort,
        )
    }

    #[tokio::test]
    async fn test_successful_run() {
        let provider = MockProvider::new();
        let trace = RecordingTrace::new();
        let build = build_with(job(1, 10), CancellationToken::new());

        assert_eq!(build.state(), BuildState::Pending);
        build.run(&provider, &trace).await.unwrap();

        assert_eq!(build.state(), BuildState::Finished);
        assert_eq!(build.stage(), BuildStage::Cleanup);
        assert_eq!(provider.cleanups(), 1);
        assert!(trace.contains("Executing step script"));
    }

    #[tokio::test]
    async fn test_script_failure_reason() {
        let provider = MockProvider::new().failing_steps();
        let trace = RecordingTrace::new();
        let build = build_with(job(1, 10), CancellationToken::new());

        let err = build.run(&provider, &trace).await.unwrap_err();
        assert_eq!(err.failure_reason(), FailureReason::ScriptFailure);
        assert_eq!(provider.cleanups(), 1);
    }

    #[tokio::test]
    async fn test_abort_stops_blocked_build() {
        let provider = MockProvider::new().gated();
        let trace = RecordingTrace::new();
        let abort = CancellationToken::new();
        let build = build_with(job(1, 10), abort.clone());

        abort.cancel();
        let err = build.run(&provider, &trace).await.unwrap_err();

        assert!(matches!(err, BuildError::Aborted));
        assert_eq!(err.failure_reason(), FailureReason::RunnerSystemFailure);
        assert_eq!(provider.cleanups(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let provider = MockProvider::new().gated();
        let trace = RecordingTrace::new();
        let mut job = job(1, 10);
        job.timeout = Some(5);
        let build = build_with(job, CancellationToken::new());

        let err = build.run(&provider, &trace).await.unwrap_err();
        assert!(matches!(err, BuildError::Timeout(d) if d == Duration::from_secs(5)));
        assert_eq!(err.failure_reason(), FailureReason::JobExecutionTimeout);
    }

    #[test]
    fn test_environment_carries_ids() {
        let mut build = build_with(job(42, 7), CancellationToken::new());
        build.assign_ids(2, 1);

        let env = build.environment();
        assert!(env.contains(&("FERRY_JOB_ID".to_string(), "42".to_string())));
        assert!(env.contains(&("FERRY_CONCURRENT_ID".to_string(), "2".to_string())));
        assert!(env.contains(&("FERRY_CONCURRENT_PROJECT_ID".to_string(), "1".to_string())));
    }
}
