//! Test doubles shared by the scheduler tests

use async_trait::async_trait;
use ferry_client::{ClientError, JobTrace, Network};
use ferry_core::domain::job::{FailureReason, JobCredentials, JobInfo, JobResponse, Step};
use ferry_core::domain::runner::RunnerCredentials;
use ferry_core::domain::session::{FeaturesInfo, SessionInfo};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Semaphore;

use crate::build::Build;
use crate::config::RunnerConfig;
use crate::executor::{Executor, ExecutorData, ExecutorError, ExecutorProvider};

pub fn runner(token: &str, limit: usize) -> RunnerConfig {
    let mut runner = RunnerConfig::new(
        format!("runner-{}", token),
        "http://localhost:8080",
        token,
        "mock",
    );
    runner.limit = limit;
    runner
}

pub fn job(id: i64, project_id: i64) -> JobResponse {
    JobResponse {
        id,
        token: format!("job-token-{}", id),
        job_info: JobInfo {
            name: "test".to_string(),
            stage: "build".to_string(),
            project_id,
            project_name: "project".to_string(),
        },
        steps: vec![Step {
            name: "script".to_string(),
            script: vec!["echo ok".to_string()],
            allow_failure: false,
        }],
        variables: Vec::new(),
        timeout: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOutcome {
    Success,
    Failed(FailureReason),
}

#[derive(Default)]
pub struct RecordingTrace {
    lines: Mutex<Vec<String>>,
    outcome: Mutex<Option<TraceOutcome>>,
}

impl RecordingTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }

    pub fn outcome(&self) -> Option<TraceOutcome> {
        *self.outcome.lock()
    }
}

#[async_trait]
impl JobTrace for RecordingTrace {
    fn write(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }

    async fn success(&self) {
        self.outcome.lock().get_or_insert(TraceOutcome::Success);
    }

    async fn fail(&self, _message: &str, reason: FailureReason) {
        self.outcome
            .lock()
            .get_or_insert(TraceOutcome::Failed(reason));
    }
}

/// Scripted job source
#[derive(Default)]
pub struct MockNetwork {
    responses: Mutex<VecDeque<(Option<JobResponse>, bool)>>,
    requests: AtomicUsize,
    sessions: Mutex<Vec<Option<SessionInfo>>>,
    traces: Mutex<Vec<Arc<RecordingTrace>>>,
    fail_process: AtomicBool,
    hang_requests: AtomicBool,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response; once the queue is empty requests return no job
    pub fn respond(&self, job: Option<JobResponse>, healthy: bool) -> &Self {
        self.responses.lock().push_back((job, healthy));
        self
    }

    pub fn fail_process(&self) {
        self.fail_process.store(true, Ordering::SeqCst);
    }

    /// Makes every job request wait forever
    pub fn hang_requests(&self) {
        self.hang_requests.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<Option<SessionInfo>> {
        self.sessions.lock().clone()
    }

    pub fn traces(&self) -> Vec<Arc<RecordingTrace>> {
        self.traces.lock().clone()
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn request_job(
        &self,
        _runner: &RunnerCredentials,
        session: Option<&SessionInfo>,
    ) -> (Option<JobResponse>, bool) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().push(session.cloned());

        if self.hang_requests.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let next = self.responses.lock().pop_front();
        next.unwrap_or((None, true))
    }

    async fn process_job(
        &self,
        _runner: &RunnerCredentials,
        _job: &JobCredentials,
    ) -> ferry_client::Result<Arc<dyn JobTrace>> {
        if self.fail_process.load(Ordering::SeqCst) {
            return Err(ClientError::api_error(403, "job canceled"));
        }

        let trace = Arc::new(RecordingTrace::new());
        self.traces.lock().push(Arc::clone(&trace));
        let trace: Arc<dyn JobTrace> = trace;
        Ok(trace)
    }
}

/// Executor backend whose steps can be held open by a gate
#[derive(Default)]
pub struct MockProvider {
    features: FeaturesInfo,
    fail_acquire: AtomicBool,
    fail_steps: bool,
    gate: Option<Arc<Semaphore>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
    running: Arc<AtomicUsize>,
    cleanups: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_steps(mut self) -> Self {
        self.fail_steps = true;
        self
    }

    /// Steps block until [`MockProvider::open_gate`] lets them through
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn with_sessions(mut self) -> Self {
        self.features.session = true;
        self
    }

    pub fn fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn open_gate(&self, steps: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(steps);
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutorProvider for MockProvider {
    async fn acquire(&self, _runner: &RunnerConfig) -> Result<ExecutorData, ExecutorError> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(ExecutorError::NoFreeExecutor("mock is full".to_string()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutorData::new("mock"))
    }

    async fn release(&self, _runner: &RunnerConfig, _data: ExecutorData) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn create(&self) -> Box<dyn Executor> {
        Box::new(MockExecutor {
            gate: self.gate.clone(),
            fail: self.fail_steps,
            running: Arc::clone(&self.running),
            cleanups: Arc::clone(&self.cleanups),
        })
    }

    fn features(&self, features: &mut FeaturesInfo) {
        *features = self.features;
    }
}

struct MockExecutor {
    gate: Option<Arc<Semaphore>>,
    fail: bool,
    running: Arc<AtomicUsize>,
    cleanups: Arc<AtomicUsize>,
}

#[async_trait]
impl Executor for MockExecutor {
    async fn prepare(
        &mut self,
        _build: &Build,
        _trace: &dyn JobTrace,
    ) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn run_step(
        &mut self,
        _build: &Build,
        step: &Step,
        trace: &dyn JobTrace,
    ) -> Result<(), ExecutorError> {
        self.running.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        for line in &step.script {
            trace.write(line);
        }

        if self.fail {
            return Err(ExecutorError::ScriptFailed(1));
        }
        Ok(())
    }

    async fn cleanup(&mut self, _build: &Build) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}
