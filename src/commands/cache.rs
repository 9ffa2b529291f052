//! `zr cache`: inspect or clear the content-addressed result cache.

use crate::cache::CacheStore;
use crate::cli::{CacheCommand, Cli};
use crate::error::ZrError;

use super::support;

/// Entry point for `zr cache`: dispatches to the `clear`/`stats` subcommand.
#[allow(clippy::print_stdout)]
pub fn run(cli: &Cli, command: &CacheCommand) -> Result<i32, ZrError> {
    let state_root = support::state_root(cli.root.as_deref())?;
    let store = CacheStore::open(state_root.join("cache"))?;

    match command {
        CacheCommand::Clear => {
            store.clear_all()?;
            println!("cache cleared");
        }
        CacheCommand::Stats => {
            let stats = store.stats()?;
            println!("entries: {}", stats.entry_count);
            println!("size:    {} bytes", stats.total_bytes);
        }
    }
    Ok(0)
}
