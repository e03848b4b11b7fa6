//! # stevedore-image
//!
//! Image resolution and packaging for the Stevedore pipeline.
//!
//! Handles:
//! - **Reference**: parsing `repository[:tag][@digest]` image strings.
//! - **Registry**: digest resolution and image fetching over the OCI
//!   distribution protocol, behind a trait seam for testing.
//! - **Store**: the content-addressed archive store with atomic
//!   claim-or-wait dedupe and refcounted eviction.
//! - **Packager**: the bounded concurrent resolve/fetch orchestrator with
//!   retries, cancellation, and an overall deadline.
//! - **Hash**: SHA-256 helpers for archives and manifests.
//! - **Cancel**: the cooperative cancellation token shared with callers.

pub mod cancel;
pub mod hash;
pub mod packager;
pub mod reference;
pub mod registry;
pub mod store;

pub use cancel::CancelToken;
pub use packager::{ImageManifest, Packager, ResolvedImage};
pub use reference::ImageReference;
pub use registry::{HttpRegistry, Registry, RegistryError};
pub use store::{Claim, ContentStore, FsContentStore, StoredArchive};
