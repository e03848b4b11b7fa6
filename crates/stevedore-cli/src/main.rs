//! # stvd — Stevedore CLI
//!
//! Packages multi-module compose deployments into self-contained offline
//! installer bundles: merge, lint, package images, assemble, in separate
//! steps or one `build` run.

mod commands;
mod output;

use clap::Parser;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::execute(cli)
}
