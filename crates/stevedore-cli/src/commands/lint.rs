//! `stvd lint` — Check a compose document against the policy rules.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use stevedore_compose::{ComposeDocument, Issue};

/// Arguments for the `lint` command.
#[derive(Args, Debug)]
pub struct LintArgs {
    /// Compose file to check.
    pub file: PathBuf,

    /// Treat unpinned image tags as errors.
    #[arg(long)]
    pub strict: bool,

    /// Emit the outcome as JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `lint` command.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the
/// document has lint errors.
pub fn execute(args: LintArgs) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let module = args
        .file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let doc = ComposeDocument::parse(&module, &source)?;

    let outcome = stevedore_compose::lint(&doc, Some(&source), args.strict);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        for issue in &outcome.errors {
            println!("error: {}", render(issue));
        }
        for issue in &outcome.warnings {
            println!("warning: {}", render(issue));
        }
        println!(
            "{}: {} error(s), {} warning(s)",
            args.file.display(),
            outcome.errors.len(),
            outcome.warnings.len()
        );
    }

    if !outcome.valid {
        anyhow::bail!("{} failed lint", args.file.display());
    }
    Ok(())
}

fn render(issue: &Issue) -> String {
    match issue.line {
        Some(line) => format!("[{}] line {line}: {}", issue.rule, issue.message),
        None => format!("[{}] {}", issue.rule, issue.message),
    }
}
