//! `stvd build` — Merge, lint, package, and assemble in one run.
//!
//! Emits job state transitions as JSON lines on stderr so wrappers (CI
//! jobs, web frontends) can track progress without parsing log text.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use stevedore_bundle::{AssembleOptions, ResourceFile};
use stevedore_common::config::PackagerConfig;
use stevedore_common::types::{JobId, JobState};
use stevedore_image::{ContentStore as _, FsContentStore, HttpRegistry, Packager};

use crate::output::format_bytes;

/// Arguments for the `build` command.
#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Module compose files, optionally named (`name=file.yml`).
    #[arg(required = true, value_name = "[NAME=]FILE")]
    pub modules: Vec<String>,

    /// Project-level variable override (repeatable).
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,

    /// Treat unpinned image tags as lint errors.
    #[arg(long)]
    pub strict: bool,

    /// Content-addressed image store directory.
    #[arg(long, default_value_os_t = stevedore_common::constants::default_image_store())]
    pub store: PathBuf,

    /// Bundle output directory.
    #[arg(long, default_value = "bundle")]
    pub out: PathBuf,

    /// Extra file or directory to ship, `SRC[:DEST]` (repeatable).
    #[arg(long = "resource", value_name = "SRC[:DEST]")]
    pub resources: Vec<String>,

    /// Environment template to ship as `.env.template`.
    #[arg(long, value_name = "FILE")]
    pub env_template: Option<PathBuf>,

    /// Also produce `<out>.tar.gz`.
    #[arg(long)]
    pub archive: bool,

    /// Concurrent fetch workers.
    #[arg(long, default_value_t = PackagerConfig::default().concurrency)]
    pub concurrency: usize,

    /// Overall packaging deadline in seconds.
    #[arg(long, default_value_t = PackagerConfig::default().timeout_secs)]
    pub timeout: u64,

    /// Platform to select from multi-arch images (`os/arch`).
    #[arg(long, default_value = "linux/amd64")]
    pub platform: String,
}

/// Executes the `build` command.
///
/// # Errors
///
/// Returns an error if any pipeline stage fails; the failure is also
/// emitted as a `failed` job state.
pub fn execute(args: BuildArgs) -> anyhow::Result<()> {
    emit(&JobState::queued());
    match run_pipeline(&args) {
        Ok(bundle_path) => {
            emit(&JobState::completed(bundle_path.display().to_string()));
            Ok(())
        }
        Err(e) => {
            emit(&JobState::failed(format!("{e:#}")));
            Err(e)
        }
    }
}

fn run_pipeline(args: &BuildArgs) -> anyhow::Result<PathBuf> {
    let job = JobId::generate();
    tracing::info!(job = %job, "starting build pipeline");

    // Merge.
    emit(&JobState::building(5));
    let modules = super::load_modules(&args.modules)?;
    let overrides = super::parse_vars(&args.vars)?;
    let merged = stevedore_compose::merge(&modules, &overrides)?;
    let compose = merged.to_yaml_string()?;
    emit(&JobState::building(15));

    // Lint. The merged document is rejected before any fetch happens.
    let outcome = stevedore_compose::lint(&merged.document, Some(&compose), args.strict);
    for issue in &outcome.warnings {
        tracing::warn!(rule = %issue.rule, "{}", issue.message);
    }
    if !outcome.valid {
        let rules: Vec<&str> = outcome.errors.iter().map(|i| i.rule.as_str()).collect();
        anyhow::bail!(
            "merged document failed lint ({}): {}",
            rules.join(", "),
            outcome
                .errors
                .first()
                .map_or(String::new(), |i| i.message.clone())
        );
    }
    emit(&JobState::building(25));

    // Package.
    let config = PackagerConfig {
        concurrency: args.concurrency,
        timeout_secs: args.timeout,
        platform: args.platform.clone(),
        ..PackagerConfig::default()
    };
    let registry = HttpRegistry::new(&config.platform)?;
    let store = FsContentStore::open(&args.store)?;
    let packager = Packager::new(registry, store, config)?;
    let cancel = super::interrupt_token();

    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    let images = runtime.block_on(packager.package(&merged.document, &cancel))?;
    emit(&JobState::building(75));

    // Pin the archives to this job so a concurrent gc cannot evict them
    // while the bundle is being written.
    let store = packager.store();
    for digest in images.distinct_digests() {
        store.retain_for_job(digest, &job)?;
    }
    let assembled = assemble_stage(args, &compose, &images);
    store.release_job(&job)?;
    let bundle = assembled?;
    emit(&JobState::building(95));

    println!(
        "built bundle at {} ({} image(s), {})",
        bundle.root.display(),
        bundle.manifest.images.len(),
        format_bytes(bundle.manifest.archive_bytes())
    );
    Ok(bundle.archive.unwrap_or(bundle.root))
}

fn assemble_stage(
    args: &BuildArgs,
    compose: &str,
    images: &stevedore_image::ImageManifest,
) -> anyhow::Result<stevedore_bundle::Bundle> {
    let env_template = match &args.env_template {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => Vec::new(),
    };
    let resources: Vec<ResourceFile> = args
        .resources
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
        .collect();
    let opts = AssembleOptions {
        out_dir: args.out.clone(),
        archive: args.archive,
    };
    Ok(stevedore_bundle::assemble(
        compose,
        images,
        &resources,
        &env_template,
        &opts,
    )?)
}

fn emit(state: &JobState) {
    match serde_json::to_string(state) {
        Ok(json) => eprintln!("{json}"),
        Err(e) => tracing::error!(error = %e, "could not serialize job state"),
    }
}
