//! # stevedore-bundle
//!
//! Assembles packaged images, the merged compose document, and operator
//! resources into a self-contained installer bundle: a directory (or
//! `tar.gz`) that installs and verifies on an air-gapped host with no
//! network access.

pub mod assemble;
pub mod manifest;
pub mod scripts;

pub use assemble::{assemble, AssembleOptions, Bundle, ResourceFile};
pub use manifest::{FileEntry, ImageEntry, InstallerManifest};
