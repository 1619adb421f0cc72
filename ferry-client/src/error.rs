//! Error types for the Ferry client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to a job source
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Job source returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the job source
        message: String,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

impl ClientError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Check if the job source refused the request (job canceled or token revoked)
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::ApiError { status: 403, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let forbidden = ClientError::api_error(403, "job canceled");
        assert!(forbidden.is_forbidden());

        let unavailable = ClientError::api_error(503, "maintenance");
        assert!(!unavailable.is_forbidden());

        let parse = ClientError::ParseError("bad json".to_string());
        assert!(!parse.is_forbidden());
    }

    #[test]
    fn test_error_display() {
        let err = ClientError::api_error(409, "conflict");
        assert_eq!(err.to_string(), "API error (status 409): conflict");
    }
}
