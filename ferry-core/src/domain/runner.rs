//! Runner identity
//!
//! A runner is one registration against a job source. Its token is the
//! stable identity used for every per-runner counter in the scheduler.

use serde::{Deserialize, Serialize};

/// Number of token characters kept by [`shorten_token`]
const SHORT_TOKEN_LEN: usize = 8;

/// Connection details for a single runner registration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunnerCredentials {
    /// Base URL of the job source (e.g., "https://ci.example.com")
    pub url: String,

    /// Registration token, unique per runner
    pub token: String,
}

impl RunnerCredentials {
    /// Short, log-safe form of the token
    pub fn short_description(&self) -> String {
        shorten_token(&self.token)
    }
}

/// Returns the first few characters of a token so it can be logged
pub fn shorten_token(token: &str) -> String {
    token.chars().take(SHORT_TOKEN_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shorten_token() {
        assert_eq!(shorten_token("abcdefghijklmnop"), "abcdefgh");
        assert_eq!(shorten_token("abc"), "abc");
        assert_eq!(shorten_token(""), "");
    }

    #[test]
    fn test_short_description() {
        let creds = RunnerCredentials {
            url: "http://localhost".to_string(),
            token: "0123456789".to_string(),
        };
        assert_eq!(creds.short_description(), "01234567");
    }
}
