//! Unified error types for the Stevedore workspace.
//!
//! One taxonomy covers the whole pipeline: parse and reference failures are
//! fatal to a merge, image resolution failures are collected per reference
//! before failing a packaging run, and integrity failures abort assembly.
//! Port conflicts are not errors; they travel in the merge report.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// A single image reference that could not be resolved or fetched.
///
/// Packaging collects one of these per failed reference so the caller sees
/// every failure, not just the first.
#[derive(Debug, Clone)]
pub struct ResolutionFailure {
    /// The image reference as written in the compose document.
    pub reference: String,
    /// Human-readable reason for the failure.
    pub reason: String,
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reference, self.reason)
    }
}

fn join_failures(failures: &[ResolutionFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum StevedoreError {
    /// A module's compose document failed to parse. No partial merge output
    /// is produced.
    #[error("module \"{module}\": parse error: {message}")]
    Parse {
        /// Name of the module whose document is malformed.
        module: String,
        /// Parser diagnostic.
        message: String,
    },

    /// A reference inside a service does not resolve to a resource declared
    /// by the same module.
    #[error("module \"{module}\", service \"{service}\": dangling reference to \"{reference}\"")]
    Reference {
        /// Module owning the service.
        module: String,
        /// Service carrying the reference.
        service: String,
        /// The unresolved name as written.
        reference: String,
    },

    /// A service declares a `build:` key. Merging never builds images.
    #[error("module \"{module}\", service \"{service}\": build directives are not allowed")]
    BuildForbidden {
        /// Module owning the service.
        module: String,
        /// Offending service name.
        service: String,
    },

    /// A `${VAR}` placeholder has no project override, no module default,
    /// and no inline default.
    #[error("module \"{module}\": required variable \"{name}\" is not set")]
    Variable {
        /// Module whose document references the variable.
        module: String,
        /// Variable name.
        name: String,
    },

    /// An image reference string is syntactically invalid.
    #[error("invalid image reference \"{reference}\": {message}")]
    InvalidReference {
        /// The reference as written.
        reference: String,
        /// What is wrong with it.
        message: String,
    },

    /// One or more image references failed to resolve or fetch. Carries
    /// every failure from the run.
    #[error("{} image reference(s) failed: {}", failures.len(), join_failures(failures))]
    Resolution {
        /// All failed references with reasons.
        failures: Vec<ResolutionFailure>,
    },

    /// A checksum did not match during assembly or verification.
    #[error("integrity failure for {path}: expected {expected}, got {actual}")]
    Integrity {
        /// File that failed verification.
        path: PathBuf,
        /// Expected checksum.
        expected: String,
        /// Computed checksum.
        actual: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// An internal invariant was violated. Indicates a bug, not bad input.
    #[error("internal consistency error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// The packaging run exceeded its overall deadline.
    #[error("packaging timed out; unresolved references: {}", unresolved.join(", "))]
    Timeout {
        /// References that were never resolved before the deadline.
        unresolved: Vec<String>,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl StevedoreError {
    /// Wraps an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StevedoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_error_reports_every_failure() {
        let err = StevedoreError::Resolution {
            failures: vec![
                ResolutionFailure {
                    reference: "nginx:1.25".into(),
                    reason: "registry unreachable".into(),
                },
                ResolutionFailure {
                    reference: "redis:7".into(),
                    reason: "manifest not found".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("nginx:1.25"), "got: {msg}");
        assert!(msg.contains("redis:7"), "got: {msg}");
        assert!(msg.starts_with("2 image reference(s) failed"), "got: {msg}");
    }

    #[test]
    fn reference_error_names_module_and_service() {
        let err = StevedoreError::Reference {
            module: "api".into(),
            service: "web".into(),
            reference: "cache".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("api"), "got: {msg}");
        assert!(msg.contains("web"), "got: {msg}");
        assert!(msg.contains("cache"), "got: {msg}");
    }

    #[test]
    fn timeout_error_lists_unresolved() {
        let err = StevedoreError::Timeout {
            unresolved: vec!["a:1".into(), "b:2".into()],
        };
        assert!(err.to_string().contains("a:1, b:2"));
    }
}
