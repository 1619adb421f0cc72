//! Interactive session descriptors

use serde::{Deserialize, Serialize};

/// Where the job source can reach an interactive session for a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub url: String,

    /// Value the job source must send in the `Authorization` header
    pub authorization: String,
}

/// Capabilities advertised by an executor backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeaturesInfo {
    /// Supports interactive sessions on running builds
    pub session: bool,

    /// Supports an interactive terminal inside the session
    pub terminal: bool,

    /// Shares the host with other builds
    pub shared: bool,

    /// Can observe cancellation while a script runs
    pub cancelable: bool,
}
