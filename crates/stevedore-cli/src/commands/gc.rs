//! `stvd gc` — Evict image archives no retained job references.

use std::path::PathBuf;

use clap::Args;
use stevedore_image::FsContentStore;

/// Arguments for the `gc` command.
#[derive(Args, Debug)]
pub struct GcArgs {
    /// Content-addressed image store directory.
    #[arg(long, default_value_os_t = stevedore_common::constants::default_image_store())]
    pub store: PathBuf,
}

/// Executes the `gc` command.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or updated.
pub fn execute(args: GcArgs) -> anyhow::Result<()> {
    let store = FsContentStore::open(&args.store)?;
    let evicted = store.evict_unreferenced()?;
    for digest in &evicted {
        println!("evicted {digest}");
    }
    println!("evicted {} archive(s) from {}", evicted.len(), args.store.display());
    Ok(())
}
