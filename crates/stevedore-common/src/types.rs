//! Domain primitive types used across the Stevedore workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An immutable image content digest (`sha256:<64 hex chars>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(String);

impl Digest {
    /// Parses a digest from its canonical `sha256:<hex>` form.
    ///
    /// # Errors
    ///
    /// Returns an error if the algorithm prefix is missing or the hex part
    /// is not exactly 64 lowercase hex characters.
    pub fn parse(s: &str) -> crate::error::Result<Self> {
        let Some(hex) = s.strip_prefix("sha256:") else {
            return Err(crate::error::StevedoreError::Config {
                message: format!("digest must start with \"sha256:\": {s}"),
            });
        };
        Self::from_hex(hex)
    }

    /// Builds a digest from a bare 64-character hex string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a valid 64-character hex string.
    pub fn from_hex(hex: impl Into<String>) -> crate::error::Result<Self> {
        let hex = hex.into();
        if hex.len() != crate::constants::SHA256_HEX_LENGTH
            || !hex.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(crate::error::StevedoreError::Config {
                message: format!("invalid SHA-256 hex string: {hex}"),
            });
        }
        Ok(Self(format!("sha256:{}", hex.to_ascii_lowercase())))
    }

    /// Returns the canonical `sha256:<hex>` form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the bare hex portion without the algorithm prefix.
    #[must_use]
    pub fn hex(&self) -> &str {
        self.0.trim_start_matches("sha256:")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a packaging job, assigned by the external tracker
/// or generated locally for one-shot CLI runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a job ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random job ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an asynchronous packaging job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job accepted but not yet started.
    Queued,
    /// Pipeline stages are running.
    Building,
    /// Bundle produced and ready for download.
    Completed,
    /// Pipeline failed; see the error field.
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Building => write!(f, "building"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Job status snapshot reported to the external async job tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Completion percentage, 0 to 100.
    pub progress: u8,
    /// Where the finished bundle can be fetched, once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Failure description, once failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobState {
    /// A freshly queued job.
    #[must_use]
    pub const fn queued() -> Self {
        Self {
            status: JobStatus::Queued,
            progress: 0,
            download_url: None,
            error: None,
        }
    }

    /// A job in progress at the given percentage.
    #[must_use]
    pub const fn building(progress: u8) -> Self {
        Self {
            status: JobStatus::Building,
            progress,
            download_url: None,
            error: None,
        }
    }

    /// A completed job with its bundle location.
    #[must_use]
    pub fn completed(download_url: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Completed,
            progress: 100,
            download_url: Some(download_url.into()),
            error: None,
        }
    }

    /// A failed job with its error message.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            progress: 0,
            download_url: None,
            error: Some(error.into()),
        }
    }
}
