//! Executor backends
//!
//! A provider hands out capacity for one build at a time (`acquire` /
//! `release`) and creates the executor that actually runs the job. Backends
//! are looked up by the name configured on each runner.

mod shell;

pub use shell::ShellProvider;

use async_trait::async_trait;
use ferry_client::JobTrace;
use ferry_core::domain::job::Step;
use ferry_core::domain::session::FeaturesInfo;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::build::Build;
use crate::config::RunnerConfig;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no free executor: {0}")]
    NoFreeExecutor(String),

    #[error("failed to prepare build environment: {0}")]
    Prepare(String),

    #[error("script exited with code {0}")]
    ScriptFailed(i32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle for capacity acquired from a provider
///
/// Providers that track per-build resources key them by `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorData {
    pub id: Uuid,
    pub provider: String,
}

impl ExecutorData {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.into(),
        }
    }
}

/// Runs the stages of a single build
#[async_trait]
pub trait Executor: Send {
    /// Sets up the environment the steps run in
    async fn prepare(&mut self, build: &Build, trace: &dyn JobTrace) -> Result<(), ExecutorError>;

    /// Runs one step of the job
    async fn run_step(
        &mut self,
        build: &Build,
        step: &Step,
        trace: &dyn JobTrace,
    ) -> Result<(), ExecutorError>;

    /// Tears down whatever `prepare` created; always called once
    async fn cleanup(&mut self, build: &Build);
}

/// Executor backend consumed by the scheduler
///
/// `release` must tolerate being called for data it no longer tracks.
#[async_trait]
pub trait ExecutorProvider: Send + Sync {
    /// Called once before any worker starts
    async fn init(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    /// Reserves capacity for one build of `runner`
    async fn acquire(&self, runner: &RunnerConfig) -> Result<ExecutorData, ExecutorError>;

    /// Returns capacity reserved by `acquire`
    async fn release(&self, runner: &RunnerConfig, data: ExecutorData);

    /// Creates the executor for one build
    fn create(&self) -> Box<dyn Executor>;

    /// Fills in the capabilities of this backend
    fn features(&self, features: &mut FeaturesInfo);

    /// Called once after every worker has stopped
    async fn shutdown(&self) {}
}

/// Executor providers by name
#[derive(Default)]
pub struct ExecutorRegistry {
    providers: HashMap<String, Arc<dyn ExecutorProvider>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn ExecutorProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExecutorProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Initializes every provider; the first failure is returned
    pub async fn init_all(&self) -> Result<(), ExecutorError> {
        for (name, provider) in &self.providers {
            provider.init().await?;
            info!(executor = %name, "Executor provider initialized");
        }
        Ok(())
    }

    /// Shuts down every provider, giving each at most `timeout`
    pub async fn shutdown_all(&self, timeout: Duration) {
        for (name, provider) in &self.providers {
            if tokio::time::timeout(timeout, provider.shutdown())
                .await
                .is_err()
            {
                warn!(executor = %name, "Executor provider shutdown timed out");
            }
        }
    }
}
