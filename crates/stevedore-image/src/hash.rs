//! SHA-256 content hashing and verification.

use std::io::Read;
use std::path::Path;

use sha2::{Digest as _, Sha256};
use stevedore_common::error::{Result, StevedoreError};

/// Computes the SHA-256 hash of a byte slice, hex-encoded.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Computes the SHA-256 hash of a file, hex-encoded.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| StevedoreError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| StevedoreError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Validates that a file matches the expected hex-encoded SHA-256 hash.
///
/// # Errors
///
/// Returns [`StevedoreError::Integrity`] if the hashes do not match.
pub fn validate_file(path: &Path, expected: &str) -> Result<()> {
    let actual = hash_file(path)?;
    if actual != expected {
        return Err(StevedoreError::Integrity {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
