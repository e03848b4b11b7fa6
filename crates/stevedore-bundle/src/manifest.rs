//! The bundle's top-level manifest.
//!
//! `manifest.json` lists every file in the bundle with its size and
//! SHA-256 so `verify.sh` (and `stvd` itself) can prove the bundle arrived
//! intact.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::Digest;
use stevedore_image::hash;

/// A checksummed file inside the bundle, path relative to the bundle root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Bundle-relative path, forward slashes.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Hex-encoded SHA-256 of the file contents.
    pub sha256: String,
}

impl FileEntry {
    /// Hashes the file at `root/relative` and records it under `relative`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn measure(root: &Path, relative: &str) -> Result<Self> {
        let path = root.join(relative);
        let size = std::fs::metadata(&path)
            .map_err(|e| StevedoreError::io(&path, e))?
            .len();
        let sha256 = hash::hash_file(&path)?;
        Ok(Self {
            path: relative.to_string(),
            size,
            sha256,
        })
    }
}

/// An image archive inside the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageEntry {
    /// The image digest the archive holds.
    pub digest: Digest,
    /// Bundle-relative path of the archive.
    pub archive: String,
    /// Archive size in bytes.
    pub size: u64,
    /// Hex-encoded SHA-256 of the archive file.
    pub sha256: String,
}

/// Everything `verify.sh` and an operator need to know about a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallerManifest {
    /// When the bundle was assembled.
    pub created_at: DateTime<Utc>,
    /// The merged compose document.
    pub compose: FileEntry,
    /// The environment template operators copy to `.env`.
    pub env_template: FileEntry,
    /// Scripts and resource files, in path order.
    pub files: Vec<FileEntry>,
    /// One entry per unique image digest.
    pub images: Vec<ImageEntry>,
}

impl InstallerManifest {
    /// Total bytes of image archives, the dominant term of a bundle's
    /// size and the disk-space requirement `verify.sh` enforces.
    #[must_use]
    pub fn archive_bytes(&self) -> u64 {
        self.images.iter().map(|i| i.size).sum()
    }

    /// Every checksummed entry, compose and env template included.
    pub fn all_files(&self) -> impl Iterator<Item = &FileEntry> {
        std::iter::once(&self.compose)
            .chain(std::iter::once(&self.env_template))
            .chain(self.files.iter())
    }

    /// Writes the manifest as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| StevedoreError::io(path, e))
    }

    /// Reads a manifest previously written with [`Self::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| StevedoreError::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Re-hashes every listed file under `root` and fails on the first
    /// mismatch or unreadable file.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Integrity`] on a checksum mismatch.
    pub fn verify(&self, root: &Path) -> Result<()> {
        for entry in self.all_files() {
            hash::validate_file(&root.join(&entry.path), &entry.sha256)?;
        }
        for image in &self.images {
            hash::validate_file(&root.join(&image.archive), &image.sha256)?;
        }
        Ok(())
    }
}
