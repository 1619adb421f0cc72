//! Ferry HTTP Client
//!
//! The network side of the Ferry runner: requesting jobs from a job source,
//! marking accepted jobs as running, and streaming their trace output back.
//!
//! The scheduler only depends on the [`Network`] and [`JobTrace`] traits;
//! [`HttpNetwork`] is the production implementation.
//!
//! # Example
//!
//! ```no_run
//! use ferry_client::{HttpNetwork, Network};
//! use ferry_core::domain::runner::RunnerCredentials;
//!
//! #[tokio::main]
//! async fn main() {
//!     let network = HttpNetwork::new();
//!     let runner = RunnerCredentials {
//!         url: "https://ci.example.com".to_string(),
//!         token: "runner-token".to_string(),
//!     };
//!
//!     let (job, healthy) = network.request_job(&runner, None).await;
//!     println!("healthy={} job={:?}", healthy, job.map(|j| j.id));
//! }
//! ```

pub mod error;
mod jobs;
mod network;
mod trace;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use network::{JobTrace, Network};
pub use trace::HttpJobTrace;

use reqwest::Client;
use std::time::Duration;

/// Default cadence for pushing buffered trace output
const DEFAULT_TRACE_INTERVAL: Duration = Duration::from_secs(3);

/// Output a single job may produce before the rest is discarded
const DEFAULT_TRACE_LIMIT: usize = 4 * 1024 * 1024;

/// HTTP implementation of [`Network`]
///
/// One instance serves every configured runner; the job source URL comes
/// from the runner credentials passed to each call.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    /// HTTP client instance
    client: Client,
    /// How often running jobs push buffered trace output
    trace_interval: Duration,
    /// Bytes of output kept per job
    trace_limit: usize,
}

impl HttpNetwork {
    /// Create a new client with default settings
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            trace_interval: DEFAULT_TRACE_INTERVAL,
            trace_limit: DEFAULT_TRACE_LIMIT,
        }
    }

    /// Create a new client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            trace_interval: DEFAULT_TRACE_INTERVAL,
            trace_limit: DEFAULT_TRACE_LIMIT,
        }
    }

    /// Override how often trace output is pushed while a job runs
    pub fn with_trace_interval(mut self, interval: Duration) -> Self {
        self.trace_interval = interval;
        self
    }

    pub fn trace_interval(&self) -> Duration {
        self.trace_interval
    }

    /// Sets how many bytes of output a job may log
    pub fn with_trace_limit(mut self, limit: usize) -> Self {
        self.trace_limit = limit;
        self
    }

    pub fn trace_limit(&self) -> usize {
        self.trace_limit
    }

    /// Joins a job source base URL and an API path
    fn endpoint(base_url: &str, path: &str) -> String {
        format!("{}/api/v4/{}", base_url.trim_end_matches('/'), path)
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle a response that carries no useful body
    ///
    /// This method checks the status code and returns an error if the request failed.
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}

impl Default for HttpNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        assert_eq!(
            HttpNetwork::endpoint("http://localhost:8080/", "jobs/request"),
            "http://localhost:8080/api/v4/jobs/request"
        );
        assert_eq!(
            HttpNetwork::endpoint("http://localhost:8080", "jobs/5"),
            "http://localhost:8080/api/v4/jobs/5"
        );
    }

    #[test]
    fn test_client_with_custom_client() {
        let network =
            HttpNetwork::with_client(Client::new()).with_trace_interval(Duration::from_secs(10));
        assert_eq!(network.trace_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_default_trace_interval() {
        assert_eq!(HttpNetwork::default().trace_interval(), DEFAULT_TRACE_INTERVAL);
    }
}
