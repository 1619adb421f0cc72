//! Core domain types
//!
//! Types in this module are shared between the network client (which
//! fetches and reports jobs) and the runner (which schedules and executes
//! them).

pub mod build;
pub mod job;
pub mod runner;
pub mod session;
