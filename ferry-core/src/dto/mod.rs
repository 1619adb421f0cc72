//! Data Transfer Objects exchanged with the job source
//!
//! DTOs are the wire representation of requests the runner sends; responses
//! are plain domain types.

pub mod job;
