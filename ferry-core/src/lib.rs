//! Ferry Core
//!
//! Core types shared by the Ferry job runner crates.
//!
//! This crate contains:
//! - Domain types: jobs handed out by a job source, runner credentials,
//!   build state and stage, interactive session descriptors
//! - DTOs: request and update payloads exchanged with the job source

pub mod domain;
pub mod dto;
