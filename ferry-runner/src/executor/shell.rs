//! Shell executor
//!
//! Runs job steps directly on the host with `sh`. Each build gets its own
//! directory under the builds dir, keyed by runner, concurrency slot and
//! project so concurrent builds never share a working tree.

use async_trait::async_trait;
use ferry_client::JobTrace;
use ferry_core::domain::job::Step;
use ferry_core::domain::session::FeaturesInfo;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Executor, ExecutorData, ExecutorError, ExecutorProvider};
use crate::build::Build;
use crate::config::RunnerConfig;

const PROVIDER_NAME: &str = "shell";

pub struct ShellProvider {
    shell: String,
    builds_dir: PathBuf,
    /// Capacity handed out and not yet released
    active: Mutex<HashSet<Uuid>>,
}

impl ShellProvider {
    pub fn new(builds_dir: impl Into<PathBuf>) -> Self {
        Self {
            shell: "sh".to_string(),
            builds_dir: builds_dir.into(),
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn active(&self) -> usize {
        self.active.lock().len()
    }
}

#[async_trait]
impl ExecutorProvider for ShellProvider {
    async fn init(&self) -> Result<(), ExecutorError> {
        tokio::fs::create_dir_all(&self.builds_dir).await?;
        debug!(builds_dir = %self.builds_dir.display(), "Shell executor ready");
        Ok(())
    }

    async fn acquire(&self, _runner: &RunnerConfig) -> Result<ExecutorData, ExecutorError> {
        let data = ExecutorData::new(PROVIDER_NAME);
        self.active.lock().insert(data.id);
        Ok(data)
    }

    async fn release(&self, runner: &RunnerConfig, data: ExecutorData) {
        if !self.active.lock().remove(&data.id) {
            debug!(
                runner = %runner.short_description(),
                executor = %data.id,
                "Executor capacity already released"
            );
        }
    }

    fn create(&self) -> Box<dyn Executor> {
        Box::new(ShellExecutor {
            shell: self.shell.clone(),
            builds_dir: self.builds_dir.clone(),
            build_dir: None,
        })
    }

    fn features(&self, features: &mut FeaturesInfo) {
        features.shared = true;
        features.cancelable = true;
    }

    async fn shutdown(&self) {
        let active = self.active();
        if active > 0 {
            warn!("Shell executor shutting down with {} build(s) still holding capacity", active);
        }
    }
}

struct ShellExecutor {
    shell: String,
    builds_dir: PathBuf,
    build_dir: Option<PathBuf>,
}

impl ShellExecutor {
    fn build_dir_for(&self, build: &Build) -> PathBuf {
        build
            .runner()
            .builds_dir
            .as_deref()
            .unwrap_or(&self.builds_dir)
            .join(build.runner().short_description())
            .join(build.project_runner_id().to_string())
            .join(build.project_id().to_string())
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn prepare(&mut self, build: &Build, trace: &dyn JobTrace) -> Result<(), ExecutorError> {
        let dir = self.build_dir_for(build);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ExecutorError::Prepare(format!("{}: {}", dir.display(), e)))?;

        trace.write(&format!("Running with shell executor in {}", dir.display()));
        self.build_dir = Some(dir);
        Ok(())
    }

    async fn run_step(
        &mut self,
        build: &Build,
        step: &Step,
        trace: &dyn JobTrace,
    ) -> Result<(), ExecutorError> {
        let Some(dir) = &self.build_dir else {
            return Err(ExecutorError::Prepare("build directory missing".to_string()));
        };

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(step_script(&step.script))
            .current_dir(dir)
            .envs(build.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::join!(pump(stdout, trace), pump(stderr, trace));

        let status = child.wait().await?;
        if status.success() {
            return Ok(());
        }

        let code = status.code().unwrap_or(-1);
        if step.allow_failure {
            trace.write(&format!(
                "WARNING: step {} exited with code {}, failure allowed",
                step.name, code
            ));
            return Ok(());
        }
        Err(ExecutorError::ScriptFailed(code))
    }

    async fn cleanup(&mut self, build: &Build) {
        let Some(dir) = self.build_dir.take() else {
            return;
        };

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(
                job = build.job().id,
                "Failed to remove build directory {}: {}",
                dir.display(),
                e
            );
        }
    }
}

/// Shell script echoing every command before running it, stopping at the first failure
fn step_script(lines: &[String]) -> String {
    let mut script = String::from("set -e\n");
    for line in lines {
        script.push_str(&format!("echo '$ {}'\n", line.replace('\'', r"'\''")));
        script.push_str(line);
        script.push('\n');
    }
    script
}

async fn pump<R: AsyncRead + Unpin>(stream: Option<R>, trace: &dyn JobTrace) {
    let Some(stream) = stream else {
        return;
    };

    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => trace.write(&line),
            Ok(None) => break,
            Err(e) => {
                debug!("Failed to read script output: {}", e);
                break;
            }
        }
    }
}
