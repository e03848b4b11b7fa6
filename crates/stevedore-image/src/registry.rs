//! Registry access: digest resolution and image fetching.
//!
//! [`HttpRegistry`] speaks the OCI distribution protocol (Docker Registry
//! v2) with anonymous bearer-token auth. Fetched images are serialized as
//! OCI image-layout tars, one archive per digest. The [`Registry`] trait is
//! the seam the packager tests mock.

use std::io::Write;
use std::path::Path;

use serde::Deserialize;
use stevedore_common::error::{Result as StvResult, StevedoreError};
use stevedore_common::types::Digest;
use thiserror::Error;

use crate::hash;
use crate::reference::ImageReference;

/// Accept header covering single-platform manifests and manifest lists.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

/// Errors from registry operations, classified for retry policy.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The repository or manifest does not exist. Never retried.
    #[error("not found: {reference}")]
    NotFound {
        /// Reference that was requested.
        reference: String,
    },

    /// The registry rejected our credentials. Never retried.
    #[error("authentication failed for {reference}")]
    Auth {
        /// Reference that was requested.
        reference: String,
    },

    /// A transport-level or server-side failure. Retried with backoff.
    #[error("network error for {reference}: {message}")]
    Network {
        /// Reference that was requested.
        reference: String,
        /// Underlying failure description.
        message: String,
    },

    /// The registry answered with something we cannot use.
    #[error("protocol error for {reference}: {message}")]
    Protocol {
        /// Reference that was requested.
        reference: String,
        /// What was wrong with the response.
        message: String,
    },

    /// Writing the archive failed locally.
    #[error("I/O error writing archive: {message}")]
    Io {
        /// Underlying failure description.
        message: String,
    },
}

impl RegistryError {
    /// Whether retrying this error can possibly succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// The seam between the packager and the outside world.
pub trait Registry: Send + Sync + 'static {
    /// Resolves a tag to its immutable manifest digest.
    fn resolve_digest(
        &self,
        reference: &ImageReference,
    ) -> impl Future<Output = Result<Digest, RegistryError>> + Send;

    /// Fetches the image at `digest` and serializes it to `dest` as a
    /// single archive. Returns the archive size in bytes.
    fn fetch_image(
        &self,
        reference: &ImageReference,
        digest: &Digest,
        dest: &Path,
    ) -> impl Future<Output = Result<u64, RegistryError>> + Send;
}

/// OCI distribution client backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    client: reqwest::Client,
    os: String,
    arch: String,
}

#[derive(Debug, Deserialize)]
struct ManifestDoc {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
    config: Option<Descriptor>,
    layers: Option<Vec<Descriptor>>,
    manifests: Option<Vec<Descriptor>>,
}

/// A content descriptor as it appears in manifests and indexes.
#[derive(Debug, Clone, Deserialize)]
pub struct Descriptor {
    /// Media type of the referenced blob.
    #[serde(rename = "mediaType")]
    pub media_type: Option<String>,
    /// Digest of the referenced blob.
    pub digest: String,
    /// Platform constraint, present in index entries.
    pub platform: Option<PlatformDesc>,
}

/// Platform selector inside a manifest index entry.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformDesc {
    /// Operating system, e.g. `linux`.
    pub os: String,
    /// CPU architecture, e.g. `amd64`.
    pub architecture: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl HttpRegistry {
    /// Creates a client selecting `platform` (`os/arch`) from multi-arch
    /// manifest lists.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform string is malformed or the HTTP
    /// client cannot be constructed.
    pub fn new(platform: &str) -> StvResult<Self> {
        let Some((os, arch)) = platform.split_once('/') else {
            return Err(StevedoreError::Config {
                message: format!("platform must be \"os/arch\", got \"{platform}\""),
            });
        };
        let client = reqwest::Client::builder()
            .user_agent(concat!("stevedore/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StevedoreError::Config {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            os: os.to_string(),
            arch: arch.to_string(),
        })
    }

    fn base_url(reference: &ImageReference) -> String {
        let scheme = if reference.registry.starts_with("localhost")
            || reference.registry.starts_with("127.")
        {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{}/v2/{}", reference.registry, reference.repository)
    }

    /// Performs a GET, transparently satisfying one anonymous bearer-token
    /// challenge. A second 401 is an auth failure.
    async fn authed_get(
        &self,
        reference: &ImageReference,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, RegistryError> {
        let send = |token: Option<String>| {
            let mut request = self.client.get(url);
            if let Some(accept) = accept {
                request = request.header(reqwest::header::ACCEPT, accept);
            }
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            request.send()
        };

        let response = send(None).await.map_err(|e| transport(reference, &e))?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return check_status(reference, response);
        }

        let challenge = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge)
            .ok_or_else(|| RegistryError::Auth {
                reference: reference.to_string(),
            })?;
        let token = self.fetch_token(reference, &challenge).await?;
        let response = send(Some(token))
            .await
            .map_err(|e| transport(reference, &e))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RegistryError::Auth {
                reference: reference.to_string(),
            });
        }
        check_status(reference, response)
    }

    async fn fetch_token(
        &self,
        reference: &ImageReference,
        challenge: &BearerChallenge,
    ) -> Result<String, RegistryError> {
        let mut request = self.client.get(&challenge.realm);
        if let Some(service) = &challenge.service {
            request = request.query(&[("service", service)]);
        }
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", reference.repository));
        request = request.query(&[("scope", &scope)]);

        let response = request.send().await.map_err(|e| transport(reference, &e))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(RegistryError::Auth {
                reference: reference.to_string(),
            });
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| transport(reference, &e))?;
        body.token.or(body.access_token).ok_or_else(|| {
            RegistryError::Protocol {
                reference: reference.to_string(),
                message: "token endpoint returned no token".into(),
            }
        })
    }

    async fn get_manifest(
        &self,
        reference: &ImageReference,
        selector: &str,
    ) -> Result<(Vec<u8>, Option<String>), RegistryError> {
        let url = format!("{}/manifests/{selector}", Self::base_url(reference));
        let response = self
            .authed_get(reference, &url, Some(MANIFEST_ACCEPT))
            .await?;
        let header_digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport(reference, &e))?;
        Ok((bytes.to_vec(), header_digest))
    }

    async fn get_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        let url = format!("{}/blobs/{digest}", Self::base_url(reference));
        let response = self.authed_get(reference, &url, None).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport(reference, &e))?;
        let expected = digest.trim_start_matches("sha256:");
        let actual = hash::hash_bytes(&bytes);
        if actual != expected {
            return Err(RegistryError::Protocol {
                reference: reference.to_string(),
                message: format!("blob {digest} hash mismatch (got sha256:{actual})"),
            });
        }
        Ok(bytes.to_vec())
    }
}

impl Registry for HttpRegistry {
    async fn resolve_digest(
        &self,
        reference: &ImageReference,
    ) -> Result<Digest, RegistryError> {
        let (bytes, header_digest) = self
            .get_manifest(reference, reference.effective_tag())
            .await?;
        let digest_str =
            header_digest.unwrap_or_else(|| format!("sha256:{}", hash::hash_bytes(&bytes)));
        tracing::debug!(reference = %reference, digest = %digest_str, "resolved tag");
        Digest::parse(&digest_str).map_err(|_| RegistryError::Protocol {
            reference: reference.to_string(),
            message: format!("registry returned invalid digest \"{digest_str}\""),
        })
    }

    async fn fetch_image(
        &self,
        reference: &ImageReference,
        digest: &Digest,
        dest: &Path,
    ) -> Result<u64, RegistryError> {
        tracing::info!(reference = %reference, digest = %digest, "fetching image");
        let (mut manifest_bytes, _) = self.get_manifest(reference, digest.as_str()).await?;
        let mut manifest: ManifestDoc = parse_manifest(reference, &manifest_bytes)?;

        // Multi-arch index: descend into the platform manifest.
        if manifest.manifests.is_some() {
            let manifests = manifest.manifests.take().unwrap_or_default();
            let selected = select_platform_manifest(&manifests, &self.os, &self.arch)
                .ok_or_else(|| RegistryError::Protocol {
                    reference: reference.to_string(),
                    message: format!("no manifest for platform {}/{}", self.os, self.arch),
                })?;
            let (bytes, _) = self.get_manifest(reference, &selected.digest).await?;
            manifest_bytes = bytes;
            manifest = parse_manifest(reference, &manifest_bytes)?;
        }

        let config = manifest.config.as_ref().ok_or_else(|| {
            RegistryError::Protocol {
                reference: reference.to_string(),
                message: "manifest has no config descriptor".into(),
            }
        })?;
        let layers = manifest.layers.clone().unwrap_or_default();

        let file = std::fs::File::create(dest).map_err(io_err)?;
        let mut builder = tar::Builder::new(file);
        write_layout_preamble(&mut builder, &manifest_bytes, manifest.media_type.as_deref())
            .map_err(io_err)?;

        let config_bytes = self.get_blob(reference, &config.digest).await?;
        append_blob_entry(&mut builder, &config.digest, &config_bytes).map_err(io_err)?;
        for layer in &layers {
            let layer_bytes = self.get_blob(reference, &layer.digest).await?;
            append_blob_entry(&mut builder, &layer.digest, &layer_bytes).map_err(io_err)?;
        }

        let mut file = builder.into_inner().map_err(io_err)?;
        file.flush().map_err(io_err)?;
        let size = file.metadata().map_err(io_err)?.len();
        tracing::info!(digest = %digest, size, "image archived");
        Ok(size)
    }
}

/// Parsed `WWW-Authenticate: Bearer` challenge parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    /// Token endpoint URL.
    pub realm: String,
    /// `service` parameter, if present.
    pub service: Option<String>,
    /// `scope` parameter, if present.
    pub scope: Option<String>,
}

/// Parses a `Bearer realm="...",service="..."` challenge header.
#[must_use]
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let params = header.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in params.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        let value = value.trim_matches('"').to_string();
        match key {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

/// Picks the index entry matching `os`/`arch`, ignoring attestation
/// pseudo-manifests that carry no platform.
#[must_use]
pub fn select_platform_manifest<'a>(
    manifests: &'a [Descriptor],
    os: &str,
    arch: &str,
) -> Option<&'a Descriptor> {
    manifests.iter().find(|d| {
        d.platform
            .as_ref()
            .is_some_and(|p| p.os == os && p.architecture == arch)
    })
}

fn parse_manifest(
    reference: &ImageReference,
    bytes: &[u8],
) -> Result<ManifestDoc, RegistryError> {
    serde_json::from_slice(bytes).map_err(|e| RegistryError::Protocol {
        reference: reference.to_string(),
        message: format!("invalid manifest JSON: {e}"),
    })
}

fn write_layout_preamble<W: Write>(
    builder: &mut tar::Builder<W>,
    manifest_bytes: &[u8],
    media_type: Option<&str>,
) -> std::io::Result<()> {
    append_file_entry(builder, "oci-layout", b"{\"imageLayoutVersion\":\"1.0.0\"}")?;
    let manifest_digest = format!("sha256:{}", hash::hash_bytes(manifest_bytes));
    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": media_type.unwrap_or("application/vnd.oci.image.manifest.v1+json"),
            "digest": manifest_digest,
            "size": manifest_bytes.len(),
        }],
    });
    append_file_entry(builder, "index.json", index.to_string().as_bytes())?;
    append_blob_entry(builder, &manifest_digest, manifest_bytes)
}

fn append_blob_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    digest: &str,
    bytes: &[u8],
) -> std::io::Result<()> {
    let hex = digest.trim_start_matches("sha256:");
    append_file_entry(builder, &format!("blobs/sha256/{hex}"), bytes)
}

fn append_file_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    bytes: &[u8],
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o444);
    header.set_cksum();
    builder.append_data(&mut header, path, bytes)
}

fn check_status(
    reference: &ImageReference,
    response: reqwest::Response,
) -> Result<reqwest::Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        reqwest::StatusCode::NOT_FOUND => RegistryError::NotFound {
            reference: reference.to_string(),
        },
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
            RegistryError::Auth {
                reference: reference.to_string(),
            }
        }
        s if s.is_server_error() => RegistryError::Network {
            reference: reference.to_string(),
            message: format!("registry returned {s}"),
        },
        s => RegistryError::Protocol {
            reference: reference.to_string(),
            message: format!("unexpected status {s}"),
        },
    })
}

fn transport(reference: &ImageReference, error: &reqwest::Error) -> RegistryError {
    RegistryError::Network {
        reference: reference.to_string(),
        message: error.to_string(),
    }
}

fn io_err(error: std::io::Error) -> RegistryError {
    RegistryError::Io {
        message: error.to_string(),
    }
}
