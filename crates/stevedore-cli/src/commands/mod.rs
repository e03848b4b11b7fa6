//! CLI command definitions and dispatch.

pub mod assemble;
pub mod build;
pub mod gc;
pub mod lint;
pub mod merge;
pub mod package;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stevedore_compose::ModuleSource;
use stevedore_image::CancelToken;

/// Stevedore — offline deployment bundle packager.
#[derive(Parser, Debug)]
#[command(name = stevedore_common::constants::BIN_NAME, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Merge module compose files into one namespaced document.
    Merge(merge::MergeArgs),
    /// Check a compose document against the packaging policy rules.
    Lint(lint::LintArgs),
    /// Resolve and fetch every image a document references.
    Package(package::PackageArgs),
    /// Assemble packaged images and resources into an installer bundle.
    Assemble(assemble::AssembleArgs),
    /// Evict image archives no retained job references.
    Gc(gc::GcArgs),
    /// Run merge, lint, package, and assemble in one go.
    Build(build::BuildArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Merge(args) => merge::execute(args),
        Command::Lint(args) => lint::execute(args),
        Command::Package(args) => package::execute(args),
        Command::Assemble(args) => assemble::execute(args),
        Command::Gc(args) => gc::execute(args),
        Command::Build(args) => build::execute(args),
    }
}

/// Parses `[name=]file` module arguments, defaulting the module name to
/// the file stem.
pub(crate) fn load_modules(specs: &[String]) -> anyhow::Result<Vec<ModuleSource>> {
    let mut modules = Vec::with_capacity(specs.len());
    for spec in specs {
        let (name, path) = match spec.split_once('=') {
            Some((name, path)) if !name.is_empty() => (name.to_string(), Path::new(path)),
            _ => {
                let path = Path::new(spec);
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .with_context(|| format!("cannot derive a module name from \"{spec}\""))?;
                (stem, path)
            }
        };
        let compose = std::fs::read_to_string(path)
            .with_context(|| format!("reading module \"{name}\" from {}", path.display()))?;
        modules.push(ModuleSource::new(name, compose));
    }
    Ok(modules)
}

/// Parses repeated `KEY=VALUE` arguments into a map.
pub(crate) fn parse_vars(pairs: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("variable \"{pair}\" is not KEY=VALUE"))?;
        let _ = vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Returns a token that trips on Ctrl-C so long-running commands can shut
/// down cleanly.
pub(crate) fn interrupt_token() -> CancelToken {
    let token = CancelToken::new();
    let handle = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, cancelling");
        handle.cancel();
    }) {
        tracing::warn!(error = %e, "could not install interrupt handler");
    }
    token
}
