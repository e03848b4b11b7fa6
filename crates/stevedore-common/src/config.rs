//! Configuration model for the packaging pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the concurrent image resolver/packager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagerConfig {
    /// Number of concurrent resolve/fetch workers.
    pub concurrency: usize,
    /// How many times a transient registry error is retried before the
    /// reference is reported as failed.
    pub retries: u32,
    /// Base backoff between retries, in milliseconds. Doubles per attempt.
    pub backoff_ms: u64,
    /// Overall deadline for one packaging run, in seconds.
    pub timeout_secs: u64,
    /// Platform selected from multi-arch manifest lists, `os/arch`.
    pub platform: String,
}

impl PackagerConfig {
    /// Base backoff as a [`Duration`].
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Overall run deadline as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validates that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker count is zero or the platform string
    /// is not of the form `os/arch`.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.concurrency == 0 {
            return Err(crate::error::StevedoreError::Config {
                message: "concurrency must be at least 1".into(),
            });
        }
        if self.platform.split('/').count() != 2 {
            return Err(crate::error::StevedoreError::Config {
                message: format!("platform must be \"os/arch\", got \"{}\"", self.platform),
            });
        }
        Ok(())
    }
}

impl Default for PackagerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retries: 3,
            backoff_ms: 500,
            timeout_secs: 1800,
            platform: "linux/amd64".into(),
        }
    }
}
