//! Content-addressed archive store with atomic claim-or-wait dedupe.
//!
//! Archives live under `<root>/sha256/<hex>.tar`, metadata and per-job
//! reference counts in a JSON index next to them. The claim operation is
//! the single synchronization point for concurrent fetchers: exactly one
//! worker wins a digest, everyone else waits for its commit or release.
//! A released (failed) claim wakes the waiters so one of them can take
//! over; a partial archive is never registered.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::{Digest, JobId};
use tokio::sync::watch;

use crate::hash;

/// Outcome of claiming a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This caller owns the fetch; it must `commit` or `release`.
    Won,
    /// The archive is already stored; no fetch needed.
    Present,
}

/// A committed archive's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArchive {
    /// Image digest the archive is stored under.
    pub digest: Digest,
    /// Absolute path of the archive file.
    pub path: PathBuf,
    /// Archive size in bytes.
    pub size: u64,
    /// SHA-256 of the archive file itself (distinct from the image digest).
    pub sha256: String,
}

/// Abstract content-addressed store consumed by the packager.
pub trait ContentStore: Send + Sync + 'static {
    /// Atomically claims `digest` for fetching. If another caller holds the
    /// claim, waits for it to finish and re-checks; only the requester
    /// blocks.
    fn claim(&self, digest: &Digest) -> impl Future<Output = Result<Claim>> + Send;

    /// Registers a fully fetched archive, moving `staged` into the store.
    /// Completes the claim and wakes waiters.
    ///
    /// # Errors
    ///
    /// Returns an error if the staged file cannot be read or moved.
    fn commit(&self, digest: &Digest, staged: &Path) -> Result<StoredArchive>;

    /// Abandons a claim after a failed fetch, waking waiters. The staged
    /// file, if any, is the caller's to clean up; nothing is registered.
    fn release(&self, digest: &Digest);

    /// Whether an archive for `digest` is fully stored.
    fn has(&self, digest: &Digest) -> bool;

    /// Metadata for a stored archive.
    fn metadata(&self, digest: &Digest) -> Option<StoredArchive>;

    /// Opens a stored archive for reading.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotFound`] if the digest is not stored.
    fn open(&self, digest: &Digest) -> Result<std::fs::File>;

    /// Where the archive for `digest` lives (or would live).
    fn archive_path(&self, digest: &Digest) -> PathBuf;

    /// A staging path on the same filesystem, for atomic commit by rename.
    fn staging_path(&self, digest: &Digest) -> PathBuf;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexEntry {
    size: u64,
    sha256: String,
    /// Jobs currently referencing this archive.
    refs: BTreeSet<String>,
}

type InFlightMap = HashMap<String, (watch::Sender<()>, watch::Receiver<()>)>;

/// Filesystem-backed [`ContentStore`].
#[derive(Debug)]
pub struct FsContentStore {
    root: PathBuf,
    index_path: PathBuf,
    index: Mutex<BTreeMap<String, IndexEntry>>,
    in_flight: Mutex<InFlightMap>,
}

impl FsContentStore {
    /// Opens or initializes a store at the given root directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created or an
    /// existing index cannot be parsed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [root.join("sha256"), root.join("staging")] {
            std::fs::create_dir_all(&dir).map_err(|e| StevedoreError::io(&dir, e))?;
        }
        let index_path = root.join("index.json");
        let index = if index_path.exists() {
            let content = std::fs::read_to_string(&index_path)
                .map_err(|e| StevedoreError::io(&index_path, e))?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };
        tracing::info!(path = %root.display(), "opened content store");
        Ok(Self {
            root,
            index_path,
            index: Mutex::new(index),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Marks `digest` as referenced by `job`, pinning it against eviction.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotFound`] if the digest is not stored.
    pub fn retain_for_job(&self, digest: &Digest, job: &JobId) -> Result<()> {
        let mut index = lock_poisoned(&self.index);
        let entry = index
            .get_mut(digest.as_str())
            .ok_or_else(|| StevedoreError::NotFound {
                kind: "archive",
                id: digest.to_string(),
            })?;
        let _ = entry.refs.insert(job.to_string());
        self.persist(&index)
    }

    /// Drops every reference held by `job`.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be persisted.
    pub fn release_job(&self, job: &JobId) -> Result<()> {
        let mut index = lock_poisoned(&self.index);
        for entry in index.values_mut() {
            let _ = entry.refs.remove(job.as_str());
        }
        self.persist(&index)
    }

    /// Deletes every stored archive no job references. Returns the evicted
    /// digests. In-flight claims are never evicted.
    ///
    /// # Errors
    ///
    /// Returns an error if an archive file cannot be removed or the index
    /// cannot be persisted.
    pub fn evict_unreferenced(&self) -> Result<Vec<Digest>> {
        let in_flight: BTreeSet<String> =
            lock_poisoned(&self.in_flight).keys().cloned().collect();
        let mut index = lock_poisoned(&self.index);
        let mut evicted = Vec::new();
        let victims: Vec<String> = index
            .iter()
            .filter(|(digest, entry)| entry.refs.is_empty() && !in_flight.contains(*digest))
            .map(|(digest, _)| digest.clone())
            .collect();
        for digest_str in victims {
            let digest = Digest::parse(&digest_str).map_err(|_| StevedoreError::Internal {
                message: format!("malformed digest in store index: {digest_str}"),
            })?;
            let path = self.archive_path(&digest);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| StevedoreError::io(&path, e))?;
            }
            let _ = index.remove(&digest_str);
            tracing::info!(digest = %digest, "evicted unreferenced archive");
            evicted.push(digest);
        }
        self.persist(&index)?;
        Ok(evicted)
    }

    fn persist(&self, index: &BTreeMap<String, IndexEntry>) -> Result<()> {
        let json = serde_json::to_string_pretty(index)?;
        std::fs::write(&self.index_path, json)
            .map_err(|e| StevedoreError::io(&self.index_path, e))?;
        Ok(())
    }
}

fn lock_poisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A poisoned store mutex means a panicked writer; the data is a plain
    // map and remains structurally valid.
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl ContentStore for FsContentStore {
    async fn claim(&self, digest: &Digest) -> Result<Claim> {
        loop {
            let receiver = {
                let mut in_flight = lock_poisoned(&self.in_flight);
                if self.has(digest) {
                    return Ok(Claim::Present);
                }
                match in_flight.get(digest.as_str()) {
                    Some((_, receiver)) => receiver.clone(),
                    None => {
                        let _ = in_flight.insert(digest.as_str().to_string(), watch::channel(()));
                        tracing::debug!(digest = %digest, "claim won");
                        return Ok(Claim::Won);
                    }
                }
            };
            // Wait for the holder to commit or release; a dropped sender
            // wakes us even if it happened before we started waiting.
            let mut receiver = receiver;
            let _ = receiver.changed().await;
            tracing::debug!(digest = %digest, "claim holder finished, re-checking");
        }
    }

    fn commit(&self, digest: &Digest, staged: &Path) -> Result<StoredArchive> {
        let sha256 = hash::hash_file(staged)?;
        let size = std::fs::metadata(staged)
            .map_err(|e| StevedoreError::io(staged, e))?
            .len();
        let path = self.archive_path(digest);
        std::fs::rename(staged, &path).map_err(|e| StevedoreError::io(&path, e))?;

        {
            let mut index = lock_poisoned(&self.index);
            let _ = index.insert(
                digest.as_str().to_string(),
                IndexEntry {
                    size,
                    sha256: sha256.clone(),
                    refs: BTreeSet::new(),
                },
            );
            self.persist(&index)?;
        }
        // Dropping the sender wakes every waiter.
        let _ = lock_poisoned(&self.in_flight).remove(digest.as_str());
        tracing::info!(digest = %digest, size, "archive committed");
        Ok(StoredArchive {
            digest: digest.clone(),
            path,
            size,
            sha256,
        })
    }

    fn release(&self, digest: &Digest) {
        let _ = lock_poisoned(&self.in_flight).remove(digest.as_str());
        tracing::debug!(digest = %digest, "claim released without commit");
    }

    fn has(&self, digest: &Digest) -> bool {
        self.archive_path(digest).exists()
    }

    fn metadata(&self, digest: &Digest) -> Option<StoredArchive> {
        let index = lock_poisoned(&self.index);
        let entry = index.get(digest.as_str())?;
        Some(StoredArchive {
            digest: digest.clone(),
            path: self.archive_path(digest),
            size: entry.size,
            sha256: entry.sha256.clone(),
        })
    }

    fn open(&self, digest: &Digest) -> Result<std::fs::File> {
        let path = self.archive_path(digest);
        std::fs::File::open(&path).map_err(|_| StevedoreError::NotFound {
            kind: "archive",
            id: digest.to_string(),
        })
    }

    fn archive_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("sha256").join(format!("{}.tar", digest.hex()))
    }

    fn staging_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("staging")
            .join(format!("{}.{}", digest.hex(), uuid::Uuid::new_v4()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(n: u8) -> Digest {
        Digest::from_hex(format!("{:02x}", n).repeat(32)).expect("digest")
    }

    fn store() -> (tempfile::TempDir, FsContentStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsContentStore::open(dir.path().join("store")).expect("open");
        (dir, store)
    }

    fn stage_and_commit(store: &FsContentStore, d: &Digest, content: &[u8]) -> StoredArchive {
        let staged = store.staging_path(d);
        std::fs::write(&staged, content).expect("write staged");
        store.commit(d, &staged).expect("commit")
    }

    #[tokio::test]
    async fn first_claim_wins() {
        let (_dir, store) = store();
        assert_eq!(store.claim(&digest(1)).await.expect("claim"), Claim::Won);
    }

    #[tokio::test]
    async fn claim_after_commit_is_present() {
        let (_dir, store) = store();
        let d = digest(1);
        assert_eq!(store.claim(&d).await.expect("claim"), Claim::Won);
        let _ = stage_and_commit(&store, &d, b"archive bytes");
        assert_eq!(store.claim(&d).await.expect("claim"), Claim::Present);
    }

    #[tokio::test]
    async fn waiter_sees_present_after_commit() {
        let (_dir, store) = store();
        let store = std::sync::Arc::new(store);
        let d = digest(2);
        assert_eq!(store.claim(&d).await.expect("claim"), Claim::Won);

        let waiter_store = store.clone();
        let waiter_digest = d.clone();
        let waiter = tokio::spawn(async move { waiter_store.claim(&waiter_digest).await });

        // Give the waiter a chance to block on the in-flight claim.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let _ = stage_and_commit(&store, &d, b"archive bytes");

        let outcome = waiter.await.expect("join").expect("claim");
        assert_eq!(outcome, Claim::Present);
    }

    #[tokio::test]
    async fn waiter_takes_over_after_release() {
        let (_dir, store) = store();
        let store = std::sync::Arc::new(store);
        let d = digest(3);
        assert_eq!(store.claim(&d).await.expect("claim"), Claim::Won);

        let waiter_store = store.clone();
        let waiter_digest = d.clone();
        let waiter = tokio::spawn(async move { waiter_store.claim(&waiter_digest).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.release(&d);

        let outcome = waiter.await.expect("join").expect("claim");
        assert_eq!(outcome, Claim::Won);
    }

    #[tokio::test]
    async fn commit_records_metadata() {
        let (_dir, store) = store();
        let d = digest(4);
        let _ = store.claim(&d).await.expect("claim");
        let archive = stage_and_commit(&store, &d, b"some archive");
        assert_eq!(archive.size, 12);
        assert_eq!(archive.sha256, crate::hash::hash_bytes(b"some archive"));
        assert!(store.has(&d));
        let meta = store.metadata(&d).expect("metadata");
        assert_eq!(meta, archive);
    }

    #[tokio::test]
    async fn release_registers_nothing() {
        let (_dir, store) = store();
        let d = digest(5);
        let _ = store.claim(&d).await.expect("claim");
        store.release(&d);
        assert!(!store.has(&d));
        assert!(store.metadata(&d).is_none());
        assert!(store.open(&d).is_err());
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("store");
        let d = digest(6);
        {
            let store = FsContentStore::open(&root).expect("open");
            let _ = store.claim(&d).await.expect("claim");
            let _ = stage_and_commit(&store, &d, b"persistent");
        }
        let store = FsContentStore::open(&root).expect("reopen");
        assert!(store.has(&d));
        assert_eq!(store.metadata(&d).expect("metadata").size, 10);
    }

    #[tokio::test]
    async fn refcounted_eviction_spares_retained_archives() {
        let (_dir, store) = store();
        let kept = digest(7);
        let dropped = digest(8);
        for d in [&kept, &dropped] {
            let _ = store.claim(d).await.expect("claim");
            let _ = stage_and_commit(&store, d, b"archive");
        }
        let job_a = JobId::new("job-a");
        let job_b = JobId::new("job-b");
        store.retain_for_job(&kept, &job_a).expect("retain");
        store.retain_for_job(&kept, &job_b).expect("retain");
        store.retain_for_job(&dropped, &job_b).expect("retain");

        // Evicting job B's artifacts must not remove the archive job A
        // still shares.
        store.release_job(&job_b).expect("release");
        let evicted = store.evict_unreferenced().expect("evict");
        assert_eq!(evicted, vec![dropped.clone()]);
        assert!(store.has(&kept));
        assert!(!store.has(&dropped));

        store.release_job(&job_a).expect("release");
        let evicted = store.evict_unreferenced().expect("evict");
        assert_eq!(evicted, vec![kept.clone()]);
    }

    #[tokio::test]
    async fn retain_unknown_digest_fails() {
        let (_dir, store) = store();
        assert!(store.retain_for_job(&digest(9), &JobId::new("j")).is_err());
    }
}
