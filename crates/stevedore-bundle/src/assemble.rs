//! Bundle assembly.
//!
//! Lays out the installer directory, copies image archives out of the
//! content store, checksums every file, renders the scripts, and writes
//! the manifest last so it covers everything else.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use stevedore_common::constants::{
    BUNDLE_COMPOSE_FILE, BUNDLE_ENV_FILE, BUNDLE_MANIFEST_FILE,
};
use stevedore_common::error::{Result, StevedoreError};
use stevedore_image::hash;
use stevedore_image::ImageManifest;

use crate::manifest::{FileEntry, ImageEntry, InstallerManifest};
use crate::scripts;

/// An operator-supplied file or directory to ship inside the bundle.
#[derive(Debug, Clone)]
pub struct ResourceFile {
    /// Path on the build host.
    pub source: PathBuf,
    /// Name under `resources/` in the bundle; defaults to the source's
    /// file name.
    pub dest: Option<String>,
}

/// Where and how to write the bundle.
#[derive(Debug, Clone)]
pub struct AssembleOptions {
    /// Bundle output directory; created if absent.
    pub out_dir: PathBuf,
    /// Also produce `<out_dir>.tar.gz`.
    pub archive: bool,
}

/// A finished bundle.
#[derive(Debug)]
pub struct Bundle {
    /// The bundle directory.
    pub root: PathBuf,
    /// The compressed archive, when requested.
    pub archive: Option<PathBuf>,
    /// The manifest as written to `manifest.json`.
    pub manifest: InstallerManifest,
}

/// Assembles an installer bundle from a merged compose document, the
/// packager's image manifest, and operator resources.
///
/// # Errors
///
/// Returns [`StevedoreError::NotFound`] for a missing resource source,
/// [`StevedoreError::Integrity`] if a copied archive does not hash to the
/// value the image manifest recorded, and I/O errors for anything
/// unwritable.
pub fn assemble(
    compose: &str,
    images: &ImageManifest,
    resources: &[ResourceFile],
    env_template: &[u8],
    opts: &AssembleOptions,
) -> Result<Bundle> {
    let root = &opts.out_dir;
    std::fs::create_dir_all(root).map_err(|e| StevedoreError::io(root, e))?;
    tracing::info!(out = %root.display(), "assembling bundle");

    write_file(root, BUNDLE_COMPOSE_FILE, compose.as_bytes())?;
    write_file(root, BUNDLE_ENV_FILE, env_template)?;

    let image_entries = copy_archives(root, images)?;
    let mut files = copy_resources(root, resources)?;

    let install = scripts::render_install(image_entries.len());
    write_file(root, "install.sh", install.as_bytes())?;
    files.push(FileEntry::measure(root, "install.sh")?);

    let compose_entry = FileEntry::measure(root, BUNDLE_COMPOSE_FILE)?;
    let env_entry = FileEntry::measure(root, BUNDLE_ENV_FILE)?;
    let archive_bytes: u64 = image_entries.iter().map(|i| i.size).sum();

    // verify.sh re-hashes every file except itself and the manifest.
    let mut checksums: Vec<(String, String)> = Vec::new();
    for entry in std::iter::once(&compose_entry)
        .chain(std::iter::once(&env_entry))
        .chain(files.iter())
    {
        checksums.push((entry.path.clone(), entry.sha256.clone()));
    }
    for image in &image_entries {
        checksums.push((image.archive.clone(), image.sha256.clone()));
    }
    let verify = scripts::render_verify(&checksums, archive_bytes);
    write_file(root, "verify.sh", verify.as_bytes())?;
    files.push(FileEntry::measure(root, "verify.sh")?);
    mark_executable(root, "install.sh")?;
    mark_executable(root, "verify.sh")?;

    files.sort_by(|a, b| a.path.cmp(&b.path));
    let manifest = InstallerManifest {
        created_at: Utc::now(),
        compose: compose_entry,
        env_template: env_entry,
        files,
        images: image_entries,
    };
    manifest.save(&root.join(BUNDLE_MANIFEST_FILE))?;

    let archive = if opts.archive {
        Some(compress_bundle(root)?)
    } else {
        None
    };
    tracing::info!(
        images = manifest.images.len(),
        bytes = manifest.archive_bytes(),
        "bundle assembled"
    );
    Ok(Bundle {
        root: root.clone(),
        archive,
        manifest,
    })
}

fn write_file(root: &Path, relative: &str, bytes: &[u8]) -> Result<()> {
    let path = root.join(relative);
    std::fs::write(&path, bytes).map_err(|e| StevedoreError::io(&path, e))
}

#[cfg(unix)]
fn mark_executable(root: &Path, relative: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let path = root.join(relative);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| StevedoreError::io(&path, e))
}

#[cfg(not(unix))]
fn mark_executable(_root: &Path, _relative: &str) -> Result<()> {
    Ok(())
}

/// Copies one archive per unique digest into `images/`, verifying each
/// copy against the hash the packager recorded.
fn copy_archives(root: &Path, images: &ImageManifest) -> Result<Vec<ImageEntry>> {
    let images_dir = root.join("images");
    std::fs::create_dir_all(&images_dir).map_err(|e| StevedoreError::io(&images_dir, e))?;

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for resolved in images.images.values() {
        if !seen.insert(resolved.digest.clone()) {
            continue;
        }
        let relative = format!("images/{}.tar", resolved.digest.hex());
        let dest = root.join(&relative);
        // Hard links avoid duplicating multi-gigabyte archives when the
        // bundle lands on the same filesystem as the store.
        if std::fs::hard_link(&resolved.archive_path, &dest).is_err() {
            let _ = std::fs::copy(&resolved.archive_path, &dest)
                .map_err(|e| StevedoreError::io(&resolved.archive_path, e))?;
        }
        hash::validate_file(&dest, &resolved.sha256)?;
        let size = std::fs::metadata(&dest)
            .map_err(|e| StevedoreError::io(&dest, e))?
            .len();
        entries.push(ImageEntry {
            digest: resolved.digest.clone(),
            archive: relative,
            size,
            sha256: resolved.sha256.clone(),
        });
    }
    entries.sort_by(|a, b| a.archive.cmp(&b.archive));
    Ok(entries)
}

fn copy_resources(root: &Path, resources: &[ResourceFile]) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    if resources.is_empty() {
        return Ok(entries);
    }
    let resources_dir = root.join("resources");
    std::fs::create_dir_all(&resources_dir)
        .map_err(|e| StevedoreError::io(&resources_dir, e))?;

    for resource in resources {
        if !resource.source.exists() {
            return Err(StevedoreError::NotFound {
                kind: "resource",
                id: resource.source.display().to_string(),
            });
        }
        let name = match &resource.dest {
            Some(dest) => dest.clone(),
            None => resource
                .source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| StevedoreError::Config {
                    message: format!(
                        "resource \"{}\" has no file name; pass an explicit destination",
                        resource.source.display()
                    ),
                })?,
        };
        copy_tree(&resource.source, root, &format!("resources/{name}"), &mut entries)?;
    }
    Ok(entries)
}

fn copy_tree(
    source: &Path,
    root: &Path,
    relative: &str,
    entries: &mut Vec<FileEntry>,
) -> Result<()> {
    if source.is_dir() {
        let dir = root.join(relative);
        std::fs::create_dir_all(&dir).map_err(|e| StevedoreError::io(&dir, e))?;
        let listing = std::fs::read_dir(source).map_err(|e| StevedoreError::io(source, e))?;
        for child in listing {
            let child = child.map_err(|e| StevedoreError::io(source, e))?;
            let name = child.file_name().to_string_lossy().into_owned();
            copy_tree(&child.path(), root, &format!("{relative}/{name}"), entries)?;
        }
        return Ok(());
    }
    let dest = root.join(relative);
    let _ = std::fs::copy(source, &dest).map_err(|e| StevedoreError::io(source, e))?;
    entries.push(FileEntry::measure(root, relative)?);
    Ok(())
}

/// Compresses the bundle directory to `<dir>.tar.gz` beside it.
fn compress_bundle(root: &Path) -> Result<PathBuf> {
    let archive_path = root.with_extension("tar.gz");
    let file = std::fs::File::create(&archive_path)
        .map_err(|e| StevedoreError::io(&archive_path, e))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let top = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle".to_string());
    builder
        .append_dir_all(&top, root)
        .map_err(|e| StevedoreError::io(root, e))?;
    let encoder = builder
        .into_inner()
        .map_err(|e| StevedoreError::io(&archive_path, e))?;
    let _ = encoder
        .finish()
        .map_err(|e| StevedoreError::io(&archive_path, e))?;
    tracing::info!(archive = %archive_path.display(), "bundle compressed");
    Ok(archive_path)
}
