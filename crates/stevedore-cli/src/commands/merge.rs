//! `stvd merge` — Merge module compose files into one namespaced document.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use stevedore_compose::Severity;

/// Arguments for the `merge` command.
#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Module compose files, optionally named (`name=file.yml`).
    #[arg(required = true, value_name = "[NAME=]FILE")]
    pub modules: Vec<String>,

    /// Project-level variable override (repeatable).
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,

    /// Where to write the merged document.
    #[arg(long, default_value = "merged.yml")]
    pub out: PathBuf,

    /// Write the rename/conflict report as JSON.
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,
}

/// Executes the `merge` command.
///
/// # Errors
///
/// Returns an error if any module fails to parse, a reference dangles, a
/// variable is unresolvable, or output cannot be written.
pub fn execute(args: MergeArgs) -> anyhow::Result<()> {
    let modules = super::load_modules(&args.modules)?;
    let overrides = super::parse_vars(&args.vars)?;

    let merged = stevedore_compose::merge(&modules, &overrides)?;
    std::fs::write(&args.out, merged.to_yaml_string()?)
        .with_context(|| format!("writing {}", args.out.display()))?;

    for entry in &merged.report.warnings {
        match entry.severity {
            Severity::Warning => tracing::warn!(code = %entry.code, "{}", entry.message),
            Severity::Info => tracing::info!(code = %entry.code, "{}", entry.message),
        }
    }
    for conflict in &merged.report.conflicts {
        tracing::warn!(
            port = conflict.port,
            proto = %conflict.proto,
            services = ?conflict.services,
            "host port published by multiple services"
        );
    }

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&merged.report)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing {}", path.display()))?;
    }

    println!(
        "merged {} module(s), {} service(s) -> {}",
        modules.len(),
        merged.document.services.len(),
        args.out.display()
    );
    Ok(())
}
