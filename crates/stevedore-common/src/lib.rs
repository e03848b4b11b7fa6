//! # stevedore-common
//!
//! Shared foundations for the Stevedore packaging pipeline:
//! - **Error**: the unified error taxonomy used by every stage.
//! - **Types**: domain primitives (digests, job state, report entries).
//! - **Config**: tunables for the concurrent packager.
//! - **Constants**: default paths and protocol constants.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
