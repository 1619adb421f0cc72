//! Runner configuration
//!
//! The configuration is a JSON document holding global scheduler settings and
//! one entry per runner registration. It is loaded into an immutable
//! [`Config`] snapshot; [`ConfigStore`] swaps whole snapshots on reload so
//! readers always see either the old or the new configuration.

use ferry_core::domain::runner::RunnerCredentials;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_CONCURRENT: usize = 1;
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_UNHEALTHY_REQUESTS_LIMIT: u32 = 3;
pub const DEFAULT_UNHEALTHY_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How often the config file's modification time is checked
pub const RELOAD_CONFIG_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Global runner process configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Maximum number of concurrently running workers, shared by all runners
    #[serde(default = "default_concurrent")]
    pub concurrent: usize,

    /// Seconds between two feeds of the same runner; 0 uses the default
    #[serde(default)]
    pub check_interval: u64,

    /// Seconds a forced shutdown may take before the process gives up; 0 uses the default
    #[serde(default)]
    pub shutdown_timeout: u64,

    /// Address of the metrics and debug HTTP server; disabled when unset
    #[serde(default)]
    pub listen_address: Option<String>,

    /// Default log filter when `RUST_LOG` is not set
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub session_server: Option<SessionServerConfig>,

    #[serde(default)]
    pub runners: Vec<Arc<RunnerConfig>>,
}

fn default_concurrent() -> usize {
    DEFAULT_CONCURRENT
}

/// Interactive session server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionServerConfig {
    /// Address the session server binds to
    pub listen_address: String,

    /// Base URL advertised to the job source; defaults to `http://{listen_address}`
    #[serde(default)]
    pub advertise_address: Option<String>,
}

impl SessionServerConfig {
    pub fn advertise_url(&self) -> String {
        match &self.advertise_address {
            Some(address) => address.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.listen_address),
        }
    }
}

/// One runner registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Human readable name used in logs and metrics
    #[serde(default)]
    pub name: String,

    #[serde(flatten)]
    pub credentials: RunnerCredentials,

    /// Executor backend name (e.g., "shell")
    pub executor: String,

    /// Maximum concurrent builds for this runner; 0 is unlimited
    #[serde(default)]
    pub limit: usize,

    /// Maximum concurrent in-flight job requests; values below 1 mean 1
    #[serde(default)]
    pub request_concurrency: usize,

    /// Scale the effective request limit with how often requests return jobs
    #[serde(default)]
    pub adaptive_request_concurrency: bool,

    /// Only poll on the feeder's cadence, never re-offer after a job
    #[serde(default)]
    pub strict_check_interval: bool,

    /// Consecutive failed requests before the runner is skipped; 0 uses the default
    #[serde(default)]
    pub unhealthy_requests_limit: u32,

    /// Seconds an unhealthy runner is skipped before one retry; 0 uses the default
    #[serde(default)]
    pub unhealthy_interval: u64,

    /// Seconds a job may run when the job source sets no timeout; 0 uses the default
    #[serde(default)]
    pub job_timeout: u64,

    /// Where the shell executor creates build directories
    #[serde(default)]
    pub builds_dir: Option<PathBuf>,
}

impl Config {
    /// Reads and validates a configuration file
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn check_interval(&self) -> Duration {
        match self.check_interval {
            0 => DEFAULT_CHECK_INTERVAL,
            secs => Duration::from_secs(secs),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        match self.shutdown_timeout {
            0 => DEFAULT_SHUTDOWN_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrent < 1 {
            return Err(ConfigError::Invalid(format!(
                "concurrent must be at least 1, got {}",
                self.concurrent
            )));
        }

        let mut tokens = HashSet::new();
        for runner in &self.runners {
            if runner.credentials.token.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "runner {:?} has an empty token",
                    runner.name
                )));
            }

            if !tokens.insert(runner.credentials.token.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "runner token {} is used more than once",
                    runner.short_description()
                )));
            }

            if !runner.credentials.url.starts_with("http://")
                && !runner.credentials.url.starts_with("https://")
            {
                return Err(ConfigError::Invalid(format!(
                    "runner {} url must start with http:// or https://",
                    runner.short_description()
                )));
            }

            if runner.executor.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "runner {} has no executor",
                    runner.short_description()
                )));
            }
        }

        Ok(())
    }

    /// Logs configurations that will starve some runners
    pub fn check_concurrency(&self) {
        if self.concurrent < self.runners.len() {
            warn!(
                "concurrent ({}) is lower than the number of runners ({}); some runners will not get a worker",
                self.concurrent,
                self.runners.len()
            );
        }

        for runner in &self.runners {
            if runner.request_concurrency() == 1 && runner.limit != 1 {
                info!(
                    runner = %runner.short_description(),
                    "request_concurrency is 1; long polling will delay job pickup for this runner"
                );
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrent: DEFAULT_CONCURRENT,
            check_interval: 0,
            shutdown_timeout: 0,
            listen_address: None,
            log_level: None,
            session_server: None,
            runners: Vec::new(),
        }
    }
}

impl RunnerConfig {
    /// Creates a runner with defaults for every tunable
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        token: impl Into<String>,
        executor: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            credentials: RunnerCredentials {
                url: url.into(),
                token: token.into(),
            },
            executor: executor.into(),
            limit: 0,
            request_concurrency: 0,
            adaptive_request_concurrency: false,
            strict_check_interval: false,
            unhealthy_requests_limit: 0,
            unhealthy_interval: 0,
            job_timeout: 0,
            builds_dir: None,
        }
    }

    pub fn token(&self) -> &str {
        &self.credentials.token
    }

    pub fn short_description(&self) -> String {
        self.credentials.short_description()
    }

    pub fn request_concurrency(&self) -> usize {
        self.request_concurrency.max(1)
    }

    pub fn unhealthy_requests_limit(&self) -> u32 {
        match self.unhealthy_requests_limit {
            0 => DEFAULT_UNHEALTHY_REQUESTS_LIMIT,
            limit => limit,
        }
    }

    pub fn unhealthy_interval(&self) -> Duration {
        match self.unhealthy_interval {
            0 => DEFAULT_UNHEALTHY_INTERVAL,
            secs => Duration::from_secs(secs),
        }
    }

    pub fn job_timeout(&self) -> Duration {
        match self.job_timeout {
            0 => DEFAULT_JOB_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }
}

/// Holder of the active configuration snapshot
///
/// Readers clone the inner `Arc` and keep using that snapshot for as long as
/// they need it; a reload replaces the pointer in one step.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<Config>>,
    /// Modification time of the last file we attempted to load
    loaded_mtime: Mutex<Option<SystemTime>>,
}

impl ConfigStore {
    /// Loads the initial configuration; any error here is fatal for the caller
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let mtime = file_mtime(&path);
        let config = Config::load_file(&path)?;

        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(config)),
            loaded_mtime: Mutex::new(mtime),
        })
    }

    /// Store backed by a fixed configuration with no file behind it
    #[cfg(test)]
    pub fn from_config(config: Config) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
            loaded_mtime: Mutex::new(None),
        }
    }

    /// The active snapshot
    pub fn snapshot(&self) -> Arc<Config> {
        Arc::clone(&self.current.read())
    }

    /// Replaces the active snapshot
    pub fn replace(&self, config: Config) -> Arc<Config> {
        let config = Arc::new(config);
        *self.current.write() = Arc::clone(&config);
        config
    }

    /// Whether the file changed since it was last loaded
    pub fn is_modified(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };

        match file_mtime(path) {
            Some(mtime) => *self.loaded_mtime.lock() != Some(mtime),
            None => false,
        }
    }

    /// Re-reads the file and swaps in the result
    ///
    /// On failure the previous snapshot stays active. The file's modification
    /// time is recorded either way so a broken file is not retried until it
    /// changes again.
    pub fn reload(&self) -> Result<Arc<Config>, ConfigError> {
        let Some(path) = &self.path else {
            return Ok(self.snapshot());
        };

        *self.loaded_mtime.lock() = file_mtime(path);
        let config = Config::load_file(path)?;
        Ok(self.replace(config))
    }

    /// Reloads only when the file's modification time changed
    pub fn reload_if_modified(&self) -> Result<Option<Arc<Config>>, ConfigError> {
        if !self.is_modified() {
            return Ok(None);
        }
        self.reload().map(Some)
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
