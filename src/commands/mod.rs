//! Command dispatch: one module per subcommand, sharing the helpers in
//! [`support`].

mod bench;
mod cache;
mod clean;
mod graph;
mod history;
mod list;
mod run;
mod support;

use crate::cli::{Cli, Command};
use crate::error::ZrError;

/// Run the subcommand selected on the command line, returning the process
/// exit code.
///
/// # Errors
///
/// Returns [`ZrError`] for failures that abort before any task-level
/// outcome exists (bad catalogue, unknown task, cycle, I/O failure). A
/// failing *task* is reported through the returned exit code, not an
/// `Err`.
pub fn dispatch(cli: &Cli) -> Result<i32, ZrError> {
    match &cli.command {
        Command::Run(opts) => run::run(cli, opts),
        Command::List(opts) => list::run(cli, opts),
        Command::Graph(opts) => graph::run(cli, opts),
        Command::Cache { command } => cache::run(cli, command),
        Command::History(opts) => history::run(cli, opts),
        Command::Clean(opts) => clean::run(cli, opts),
        Command::Bench(opts) => bench::run(cli, opts),
    }
}
