//! `stvd assemble` — Assemble packaged images into an installer bundle.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use stevedore_bundle::{AssembleOptions, ResourceFile};
use stevedore_image::ImageManifest;

use crate::output::format_bytes;

/// Arguments for the `assemble` command.
#[derive(Args, Debug)]
pub struct AssembleArgs {
    /// Merged compose file to ship in the bundle.
    pub file: PathBuf,

    /// Image manifest written by `stvd package`.
    #[arg(long, default_value = "images.json")]
    pub images: PathBuf,

    /// Extra file or directory to ship, `SRC[:DEST]` (repeatable).
    #[arg(long = "resource", value_name = "SRC[:DEST]")]
    pub resources: Vec<String>,

    /// Environment template to ship as `.env.template`.
    #[arg(long, value_name = "FILE")]
    pub env_template: Option<PathBuf>,

    /// Bundle output directory.
    #[arg(long, default_value = "bundle")]
    pub out: PathBuf,

    /// Also produce `<out>.tar.gz`.
    #[arg(long)]
    pub archive: bool,
}

/// Executes the `assemble` command.
///
/// # Errors
///
/// Returns an error if inputs are missing, an archive fails its checksum,
/// or the bundle cannot be written.
pub fn execute(args: AssembleArgs) -> anyhow::Result<()> {
    let compose = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let images = ImageManifest::load(&args.images)?;
    let env_template = match &args.env_template {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => Vec::new(),
    };
    let resources = parse_resources(&args.resources);

    let opts = AssembleOptions {
        out_dir: args.out.clone(),
        archive: args.archive,
    };
    let bundle = stevedore_bundle::assemble(&compose, &images, &resources, &env_template, &opts)?;

    println!(
        "assembled bundle at {} ({} image(s), {})",
        bundle.root.display(),
        bundle.manifest.images.len(),
        format_bytes(bundle.manifest.archive_bytes())
    );
    if let Some(archive) = &bundle.archive {
        println!("archive: {}", archive.display());
    }
    Ok(())
}

/// Splits `SRC[:DEST]` resource arguments.
fn parse_resources(specs: &[String]) -> Vec<ResourceFile> {
    specs
        .iter()
        .map(|spec| match spec.split_once(':') {
            Some((source, dest)) if !dest.is_empty() => ResourceFile {
                source: PathBuf::from(source),
                dest: Some(dest.to_string()),
            },
            _ => ResourceFile {
                source: PathBuf::from(spec.as_str()),
                dest: None,
            },
        })
        .collect()
}
