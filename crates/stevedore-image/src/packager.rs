//! Concurrent image resolution and packaging.
//!
//! Collects the distinct image references of a compose document, resolves
//! each to an immutable digest, and fetches every unique digest exactly
//! once into the content store. Work runs on a bounded worker pool;
//! transient registry errors retry with exponential backoff; failures are
//! collected across all references so the error report is complete.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stevedore_common::config::PackagerConfig;
use stevedore_common::error::{ResolutionFailure, Result, StevedoreError};
use stevedore_common::types::Digest;
use stevedore_compose::ComposeDocument;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cancel::CancelToken;
use crate::reference::ImageReference;
use crate::registry::{Registry, RegistryError};
use crate::store::{Claim, ContentStore};

/// One image reference resolved to its digest and stored archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedImage {
    /// The reference exactly as written in the compose document.
    pub reference: String,
    /// Resolved immutable digest.
    pub digest: Digest,
    /// Path of the archive in the content store.
    pub archive_path: PathBuf,
    /// Archive size in bytes.
    pub size: u64,
    /// SHA-256 of the archive file.
    pub sha256: String,
}

/// The packager's output: every reference mapped to its resolved image.
/// Multiple references may share one digest and archive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Original reference string to resolution result.
    pub images: BTreeMap<String, ResolvedImage>,
}

impl ImageManifest {
    /// Distinct digests across all entries, in digest order.
    #[must_use]
    pub fn distinct_digests(&self) -> Vec<&Digest> {
        let mut seen = HashSet::new();
        let mut digests: Vec<&Digest> = self
            .images
            .values()
            .map(|image| &image.digest)
            .filter(|digest| seen.insert(digest.as_str()))
            .collect();
        digests.sort_by_key(|d| d.as_str());
        digests
    }

    /// Writes the manifest as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| StevedoreError::io(path, e))
    }

    /// Reads a manifest previously written with [`Self::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| StevedoreError::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Resolves and fetches a document's images through a [`Registry`] into a
/// [`ContentStore`].
#[derive(Debug)]
pub struct Packager<R, S> {
    registry: Arc<R>,
    store: Arc<S>,
    config: PackagerConfig,
}

impl<R: Registry, S: ContentStore> Packager<R, S> {
    /// Creates a packager after validating the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(registry: R, store: S, config: PackagerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: Arc::new(registry),
            store: Arc::new(store),
            config,
        })
    }

    /// Shared handle to the underlying content store.
    #[must_use]
    pub fn store(&self) -> Arc<S> {
        self.store.clone()
    }

    /// Packages every image the document references.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Resolution`] naming every failed
    /// reference if any fails, [`StevedoreError::Cancelled`] if the token
    /// fires, and [`StevedoreError::Timeout`] with the unresolved
    /// references if the overall deadline passes.
    pub async fn package(
        &self,
        doc: &ComposeDocument,
        cancel: &CancelToken,
    ) -> Result<ImageManifest> {
        let references = collect_references(doc);
        tracing::info!(
            references = references.len(),
            concurrency = self.config.concurrency,
            "packaging images"
        );

        // An internal token lets the deadline cancel workers without
        // cancelling the caller's token.
        let internal = CancelToken::new();
        let forwarder = {
            let external = cancel.clone();
            let internal = internal.clone();
            tokio::spawn(async move {
                external.cancelled().await;
                internal.cancel();
            })
        };
        let result = self.run(references, &internal).await;
        forwarder.abort();

        if cancel.is_cancelled() {
            return Err(StevedoreError::Cancelled);
        }
        result
    }

    async fn run(&self, references: Vec<String>, cancel: &CancelToken) -> Result<ImageManifest> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut set: JoinSet<(String, std::result::Result<ResolvedImage, ResolutionFailure>)> =
            JoinSet::new();
        for reference in &references {
            let registry = self.registry.clone();
            let store = self.store.clone();
            let config = self.config.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let reference = reference.clone();
            let _abort = set.spawn(async move {
                let outcome = process_reference(
                    &registry, &store, &config, &semaphore, &cancel, &reference,
                )
                .await;
                (reference, outcome)
            });
        }

        let deadline = tokio::time::sleep(self.config.timeout());
        tokio::pin!(deadline);
        let mut timed_out = false;
        let mut images = BTreeMap::new();
        let mut failures = Vec::new();

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok((reference, Ok(image)))) => {
                        let _ = images.insert(reference, image);
                    }
                    Some(Ok((_, Err(failure)))) => failures.push(failure),
                    Some(Err(join_error)) => failures.push(ResolutionFailure {
                        reference: "<worker>".into(),
                        reason: join_error.to_string(),
                    }),
                },
                () = &mut deadline, if !timed_out => {
                    timed_out = true;
                    cancel.cancel();
                    tracing::warn!("packaging deadline exceeded, cancelling remaining work");
                }
            }
        }

        if timed_out {
            let unresolved = references
                .into_iter()
                .filter(|r| !images.contains_key(r))
                .collect();
            return Err(StevedoreError::Timeout { unresolved });
        }
        if !failures.is_empty() {
            return Err(StevedoreError::Resolution { failures });
        }
        tracing::info!(images = images.len(), "packaging complete");
        Ok(ImageManifest { images })
    }
}

/// Distinct image references by literal string, in service declaration
/// order.
#[must_use]
pub fn collect_references(doc: &ComposeDocument) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut references = Vec::new();
    for (_, service) in &doc.services {
        if let Some(image) = &service.image {
            if seen.insert(image.clone()) {
                references.push(image.clone());
            }
        }
    }
    references
}

async fn process_reference<R: Registry, S: ContentStore>(
    registry: &Arc<R>,
    store: &Arc<S>,
    config: &PackagerConfig,
    semaphore: &Arc<Semaphore>,
    cancel: &CancelToken,
    reference: &str,
) -> std::result::Result<ResolvedImage, ResolutionFailure> {
    let fail = |reason: String| ResolutionFailure {
        reference: reference.to_string(),
        reason,
    };

    let _permit = tokio::select! {
        permit = semaphore.clone().acquire_owned() => {
            permit.map_err(|_| fail("worker pool closed".into()))?
        }
        () = cancel.cancelled() => return Err(fail("cancelled".into())),
    };

    let parsed = ImageReference::parse(reference).map_err(|e| fail(e.to_string()))?;

    // A pinned digest is used directly; only tags hit the registry.
    let digest = match parsed.digest.clone() {
        Some(digest) => digest,
        None => tokio::select! {
            resolved = with_retries(config, || registry.resolve_digest(&parsed)) => {
                resolved.map_err(|e| fail(e.to_string()))?
            }
            () = cancel.cancelled() => return Err(fail("cancelled".into())),
        },
    };

    let claim = tokio::select! {
        claim = store.claim(&digest) => claim.map_err(|e| fail(e.to_string()))?,
        () = cancel.cancelled() => return Err(fail("cancelled".into())),
    };

    let archive = match claim {
        Claim::Present => store
            .metadata(&digest)
            .ok_or_else(|| fail(format!("stored archive {digest} has no metadata")))?,
        Claim::Won => {
            let staged = store.staging_path(&digest);
            let fetched = tokio::select! {
                fetched = with_retries(config, || registry.fetch_image(&parsed, &digest, &staged)) => fetched,
                () = cancel.cancelled() => {
                    store.release(&digest);
                    let _ = std::fs::remove_file(&staged);
                    return Err(fail("cancelled".into()));
                }
            };
            let commit = match fetched {
                Ok(_) => store.commit(&digest, &staged),
                Err(e) => Err(StevedoreError::Internal {
                    message: e.to_string(),
                }),
            };
            match commit {
                Ok(archive) => archive,
                Err(e) => {
                    // Never leave a partial archive claimed or registered.
                    store.release(&digest);
                    let _ = std::fs::remove_file(&staged);
                    return Err(fail(e.to_string()));
                }
            }
        }
    };

    Ok(ResolvedImage {
        reference: reference.to_string(),
        digest: archive.digest,
        archive_path: archive.path,
        size: archive.size,
        sha256: archive.sha256,
    })
}

async fn with_retries<T, F, Fut>(
    config: &PackagerConfig,
    mut op: F,
) -> std::result::Result<T, RegistryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, RegistryError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.retries => {
                let delay = config.backoff() * 2u32.saturating_pow(attempt);
                tracing::warn!(error = %e, attempt, "transient registry error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use stevedore_common::error::StevedoreError;

    use super::*;
    use crate::store::FsContentStore;

    fn digest(n: u8) -> Digest {
        Digest::from_hex(format!("{n:02x}").repeat(32)).expect("digest")
    }

    /// Scripted registry: maps references to digests, with optional auth
    /// failures and a countdown of transient failures per reference.
    #[derive(Default)]
    struct MockRegistry {
        digests: HashMap<String, Digest>,
        auth_failures: HashSet<String>,
        transient_failures: HashMap<String, AtomicU32>,
        resolve_calls: AtomicUsize,
        fetch_calls: AtomicUsize,
        fetch_delay: Option<std::time::Duration>,
    }

    impl MockRegistry {
        fn with_digest(mut self, reference: &str, d: &Digest) -> Self {
            let _ = self.digests.insert(reference.to_string(), d.clone());
            self
        }

        fn with_auth_failure(mut self, reference: &str) -> Self {
            let _ = self.auth_failures.insert(reference.to_string());
            self
        }

        fn with_transient_failures(mut self, reference: &str, count: u32) -> Self {
            let _ = self
                .transient_failures
                .insert(reference.to_string(), AtomicU32::new(count));
            self
        }
    }

    impl Registry for MockRegistry {
        async fn resolve_digest(
            &self,
            reference: &ImageReference,
        ) -> std::result::Result<Digest, RegistryError> {
            let _ = self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            let key = reference.as_str();
            if self.auth_failures.contains(key) {
                return Err(RegistryError::Auth {
                    reference: key.to_string(),
                });
            }
            if let Some(remaining) = self.transient_failures.get(key) {
                if remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(RegistryError::Network {
                        reference: key.to_string(),
                        message: "simulated outage".into(),
                    });
                }
            }
            self.digests
                .get(key)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound {
                    reference: key.to_string(),
                })
        }

        async fn fetch_image(
            &self,
            _reference: &ImageReference,
            d: &Digest,
            dest: &Path,
        ) -> std::result::Result<u64, RegistryError> {
            let _ = self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            let content = format!("archive for {d}");
            std::fs::write(dest, &content).map_err(|e| RegistryError::Io {
                message: e.to_string(),
            })?;
            Ok(content.len() as u64)
        }
    }

    fn doc(images: &[&str]) -> ComposeDocument {
        let mut yaml = String::from("services:\n");
        for (i, image) in images.iter().enumerate() {
            yaml.push_str(&format!("  svc{i}:\n    image: {image}\n"));
        }
        ComposeDocument::parse("test", &yaml).expect("parse")
    }

    fn fast_config() -> PackagerConfig {
        PackagerConfig {
            backoff_ms: 1,
            ..PackagerConfig::default()
        }
    }

    fn packager(
        registry: MockRegistry,
        config: PackagerConfig,
    ) -> (tempfile::TempDir, Packager<MockRegistry, FsContentStore>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsContentStore::open(dir.path().join("store")).expect("open store");
        let packager = Packager::new(registry, store, config).expect("packager");
        (dir, packager)
    }

    #[tokio::test]
    async fn distinct_references_one_digest_fetched_once() {
        let d = digest(1);
        let registry = MockRegistry::default()
            .with_digest("nginx:1.25", &d)
            .with_digest("mirror/nginx:1.25", &d);
        let (_dir, packager) = packager(registry, fast_config());

        let manifest = packager
            .package(&doc(&["nginx:1.25", "mirror/nginx:1.25"]), &CancelToken::new())
            .await
            .expect("package failed");

        assert_eq!(manifest.images.len(), 2);
        assert_eq!(manifest.distinct_digests(), vec![&d]);
        assert_eq!(packager.registry.fetch_calls.load(Ordering::SeqCst), 1);
        assert!(packager.store.has(&d));
    }

    #[tokio::test]
    async fn same_reference_in_many_services_packaged_once() {
        let d = digest(2);
        let registry = MockRegistry::default().with_digest("redis:7", &d);
        let (_dir, packager) = packager(registry, fast_config());

        let manifest = packager
            .package(&doc(&["redis:7", "redis:7", "redis:7"]), &CancelToken::new())
            .await
            .expect("package failed");

        assert_eq!(manifest.images.len(), 1);
        assert_eq!(packager.registry.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_workers_never_double_fetch_one_digest() {
        let d = digest(3);
        let mut registry = MockRegistry {
            fetch_delay: Some(std::time::Duration::from_millis(25)),
            ..MockRegistry::default()
        };
        let references: Vec<String> = (0..8).map(|i| format!("team/app{i}:1")).collect();
        for reference in &references {
            registry = registry.with_digest(reference, &d);
        }
        let config = PackagerConfig {
            concurrency: 8,
            ..fast_config()
        };
        let (_dir, packager) = packager(registry, config);

        let refs: Vec<&str> = references.iter().map(String::as_str).collect();
        let manifest = packager
            .package(&doc(&refs), &CancelToken::new())
            .await
            .expect("package failed");

        assert_eq!(manifest.images.len(), 8);
        assert_eq!(packager.registry.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn every_failed_reference_is_reported() {
        let registry = MockRegistry::default()
            .with_digest("good:1", &digest(4))
            .with_auth_failure("locked:1");
        // "missing:1" resolves to NotFound, "locked:1" to Auth.
        let (_dir, packager) = packager(registry, fast_config());

        let err = packager
            .package(&doc(&["good:1", "missing:1", "locked:1"]), &CancelToken::new())
            .await
            .unwrap_err();

        let StevedoreError::Resolution { failures } = err else {
            panic!("expected Resolution error, got {err}");
        };
        assert_eq!(failures.len(), 2);
        let failed: Vec<&str> = failures.iter().map(|f| f.reference.as_str()).collect();
        assert!(failed.contains(&"missing:1"));
        assert!(failed.contains(&"locked:1"));
    }

    #[tokio::test]
    async fn transient_errors_retry_until_success() {
        let registry = MockRegistry::default()
            .with_digest("flaky:1", &digest(5))
            .with_transient_failures("flaky:1", 2);
        let (_dir, packager) = packager(registry, fast_config());

        let manifest = packager
            .package(&doc(&["flaky:1"]), &CancelToken::new())
            .await
            .expect("package failed");

        assert_eq!(manifest.images.len(), 1);
        assert_eq!(packager.registry.resolve_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_reference() {
        let registry = MockRegistry::default()
            .with_digest("down:1", &digest(6))
            .with_transient_failures("down:1", 10);
        let config = PackagerConfig {
            retries: 2,
            ..fast_config()
        };
        let (_dir, packager) = packager(registry, config);

        let err = packager
            .package(&doc(&["down:1"]), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StevedoreError::Resolution { .. }));
        assert_eq!(packager.registry.resolve_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_failures_are_not_retried() {
        let registry = MockRegistry::default().with_auth_failure("private:1");
        let (_dir, packager) = packager(registry, fast_config());

        let err = packager
            .package(&doc(&["private:1"]), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StevedoreError::Resolution { .. }));
        assert_eq!(packager.registry.resolve_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pinned_digest_skips_registry_resolution() {
        let d = digest(7);
        let registry = MockRegistry::default();
        let (_dir, packager) = packager(registry, fast_config());

        let reference = format!("nginx@{}", d.as_str());
        let manifest = packager
            .package(&doc(&[&reference]), &CancelToken::new())
            .await
            .expect("package failed");

        assert_eq!(packager.registry.resolve_calls.load(Ordering::SeqCst), 0);
        assert_eq!(packager.registry.fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manifest.images[&reference].digest, d);
    }

    #[tokio::test]
    async fn already_stored_digest_is_not_refetched() {
        let d = digest(8);
        let registry = MockRegistry::default().with_digest("cached:1", &d);
        let (_dir, packager) = packager(registry, fast_config());

        let store = packager.store();
        assert_eq!(store.claim(&d).await.expect("claim"), Claim::Won);
        let staged = store.staging_path(&d);
        std::fs::write(&staged, b"prefetched archive").expect("write");
        let _ = store.commit(&d, &staged).expect("commit");

        let manifest = packager
            .package(&doc(&["cached:1"]), &CancelToken::new())
            .await
            .expect("package failed");

        assert_eq!(packager.registry.fetch_calls.load(Ordering::SeqCst), 0);
        assert_eq!(manifest.images["cached:1"].size, 18);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_the_run() {
        let registry = MockRegistry::default().with_digest("slow:1", &digest(9));
        let (_dir, packager) = packager(registry, fast_config());

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = packager.package(&doc(&["slow:1"]), &cancel).await.unwrap_err();
        assert!(matches!(err, StevedoreError::Cancelled));
    }

    #[tokio::test]
    async fn deadline_reports_unresolved_references() {
        let registry = MockRegistry {
            fetch_delay: Some(std::time::Duration::from_secs(30)),
            ..MockRegistry::default()
        }
        .with_digest("huge:1", &digest(10));
        let config = PackagerConfig {
            timeout_secs: 0,
            ..fast_config()
        };
        let (_dir, packager) = packager(registry, config);

        let err = packager
            .package(&doc(&["huge:1"]), &CancelToken::new())
            .await
            .unwrap_err();
        let StevedoreError::Timeout { unresolved } = err else {
            panic!("expected Timeout error, got {err}");
        };
        assert_eq!(unresolved, vec!["huge:1".to_string()]);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_no_partial_archive() {
        let d = digest(11);
        // Fetch fails: transient failures exhaust retries at the resolve
        // step for one reference while another succeeds.
        let registry = MockRegistry::default()
            .with_digest("ok:1", &digest(12))
            .with_transient_failures("bad:1", 100)
            .with_digest("bad:1", &d);
        let config = PackagerConfig {
            retries: 1,
            ..fast_config()
        };
        let (_dir, packager) = packager(registry, config);

        let err = packager
            .package(&doc(&["ok:1", "bad:1"]), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StevedoreError::Resolution { .. }));
        assert!(!packager.store.has(&d));
        assert!(packager.store.has(&digest(12)));
    }

    #[tokio::test]
    async fn manifest_round_trips_through_json() {
        let d = digest(13);
        let registry = MockRegistry::default().with_digest("app:1", &d);
        let (dir, packager) = packager(registry, fast_config());

        let manifest = packager
            .package(&doc(&["app:1"]), &CancelToken::new())
            .await
            .expect("package failed");
        let path = dir.path().join("images.json");
        manifest.save(&path).expect("save failed");
        let loaded = ImageManifest::load(&path).expect("load failed");
        assert_eq!(loaded.images, manifest.images);
    }

    #[test]
    fn collect_references_dedupes_by_literal() {
        let document = doc(&["a:1", "b:1", "a:1"]);
        assert_eq!(collect_references(&document), vec!["a:1", "b:1"]);
    }
}
