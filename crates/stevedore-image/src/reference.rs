//! Image reference parsing.
//!
//! A service's `image` string is `[registry/]repository[:tag][@digest]`.
//! Bare Docker Hub names get the implicit `library/` namespace and the
//! default registry host, matching what container runtimes do.

use std::fmt;

use stevedore_common::constants::{DEFAULT_REGISTRY, DEFAULT_TAG};
use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::Digest;

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    raw: String,
    /// Registry host (with optional port).
    pub registry: String,
    /// Repository path within the registry.
    pub repository: String,
    /// Declared tag, if any.
    pub tag: Option<String>,
    /// Declared digest, if pinned with `@sha256:...`.
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parses an image reference string.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::InvalidReference`] for empty names or a
    /// malformed digest suffix.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |message: &str| StevedoreError::InvalidReference {
            reference: raw.to_string(),
            message: message.to_string(),
        };
        if raw.trim().is_empty() {
            return Err(invalid("empty reference"));
        }

        let (name_and_tag, digest) = match raw.split_once('@') {
            Some((left, digest)) => (left, Some(Digest::parse(digest).map_err(|_| {
                invalid("digest must be \"sha256:\" followed by 64 hex characters")
            })?)),
            None => (raw, None),
        };

        // A colon in the last path component separates the tag; colons in
        // the first component belong to a registry host:port.
        let (name, tag) = match name_and_tag.rsplit_once('/') {
            Some((prefix, last)) => match last.split_once(':') {
                Some((last_name, tag)) => {
                    (format!("{prefix}/{last_name}"), Some(tag.to_string()))
                }
                None => (name_and_tag.to_string(), None),
            },
            None => match name_and_tag.split_once(':') {
                Some((last_name, tag)) => (last_name.to_string(), Some(tag.to_string())),
                None => (name_and_tag.to_string(), None),
            },
        };
        if name.is_empty() || tag.as_deref() == Some("") {
            return Err(invalid("missing repository or empty tag"));
        }

        // First path component is a registry host if it looks like one.
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name),
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{name}")),
        };
        if repository.is_empty() {
            return Err(invalid("missing repository"));
        }

        Ok(Self {
            raw: raw.to_string(),
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The reference exactly as written in the compose document.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The tag to resolve when no digest is pinned.
    #[must_use]
    pub fn effective_tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}
