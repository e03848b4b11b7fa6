//! `stvd package` — Resolve and fetch every image a document references.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use stevedore_common::config::PackagerConfig;
use stevedore_compose::ComposeDocument;
use stevedore_image::{ContentStore as _, FsContentStore, HttpRegistry, Packager};

use crate::output::format_bytes;

/// Arguments for the `package` command.
#[derive(Args, Debug)]
pub struct PackageArgs {
    /// Merged compose file whose images to package.
    pub file: PathBuf,

    /// Content-addressed image store directory.
    #[arg(long, default_value_os_t = stevedore_common::constants::default_image_store())]
    pub store: PathBuf,

    /// Where to write the image manifest.
    #[arg(long, default_value = "images.json")]
    pub out: PathBuf,

    /// Concurrent fetch workers.
    #[arg(long, default_value_t = PackagerConfig::default().concurrency)]
    pub concurrency: usize,

    /// Retries per reference for transient registry failures.
    #[arg(long, default_value_t = PackagerConfig::default().retries)]
    pub retries: u32,

    /// Overall deadline in seconds.
    #[arg(long, default_value_t = PackagerConfig::default().timeout_secs)]
    pub timeout: u64,

    /// Platform to select from multi-arch images (`os/arch`).
    #[arg(long, default_value = "linux/amd64")]
    pub platform: String,
}

/// Executes the `package` command.
///
/// # Errors
///
/// Returns an error if the document cannot be read, any reference fails
/// to resolve or fetch, or the deadline passes.
pub fn execute(args: PackageArgs) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let doc = ComposeDocument::parse("package", &source)?;

    let config = PackagerConfig {
        concurrency: args.concurrency,
        retries: args.retries,
        timeout_secs: args.timeout,
        platform: args.platform.clone(),
        ..PackagerConfig::default()
    };
    let registry = HttpRegistry::new(&config.platform)?;
    let store = FsContentStore::open(&args.store)?;
    let packager = Packager::new(registry, store, config)?;
    let cancel = super::interrupt_token();

    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    let manifest = runtime.block_on(packager.package(&doc, &cancel))?;
    manifest.save(&args.out)?;

    let total: u64 = manifest
        .distinct_digests()
        .iter()
        .filter_map(|d| packager.store().metadata(d))
        .map(|a| a.size)
        .sum();
    println!(
        "packaged {} reference(s) into {} archive(s) ({}) -> {}",
        manifest.images.len(),
        manifest.distinct_digests().len(),
        format_bytes(total),
        args.out.display()
    );
    Ok(())
}
