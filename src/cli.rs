//! Command-line surface: argument parsing for `zr`'s six subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Polyglot task runner and build orchestrator.
#[derive(Debug, Parser)]
#[command(name = "zr", version, about)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
    /// Print debug-level log lines to the console as well as the log file.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
    /// Catalogue file to load (defaults to `zr.toml` in the current directory).
    #[arg(long, global = true)]
    pub file: Option<PathBuf>,
    /// Override the state root (defaults to `$ZR_CACHE_DIR` or `$HOME/.zr`).
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute a task and its transitive dependencies.
    Run(RunOpts),
    /// Print the catalogue's tasks and workflows.
    List(ListOpts),
    /// Print the execution levels of a task's dependency graph.
    Graph(GraphOpts),
    /// Inspect or mutate the result cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    /// Query the execution history.
    History(HistoryOpts),
    /// Remove persisted state under the state root.
    Clean(CleanOpts),
    /// Repeatedly run a task and aggregate timings.
    Bench(BenchOpts),
}

/// Options for `zr run`.
#[derive(Debug, Parser)]
pub struct RunOpts {
    /// Name of the task (or workflow) to run.
    pub task: String,
    /// Profile name, forwarded to the catalogue loader for environment
    /// overlays; has no effect on the core engine beyond tagging history.
    #[arg(long)]
    pub profile: Option<String>,
    /// Maximum number of tasks to run concurrently within one DAG level.
    /// `0` resolves to hardware concurrency.
    #[arg(long, default_value_t = 0)]
    pub parallel: usize,
    /// Ignore the result cache: always re-run, but still record results.
    #[arg(long)]
    pub no_cache: bool,
    /// Keep running every level instead of stopping as soon as one task
    /// fails.
    #[arg(long)]
    pub keep_going: bool,
}

/// Options for `zr list`.
#[derive(Debug, Parser)]
pub struct ListOpts {
    /// Print tasks indented under the workflows that reference them.
    #[arg(long)]
    pub tree: bool,
    /// Emit machine-readable JSON instead of a formatted table.
    #[arg(long)]
    pub json: bool,
}

/// Options for `zr graph`.
#[derive(Debug, Parser)]
pub struct GraphOpts {
    /// Task (or workflow) whose dependency graph should be printed.
    pub task: String,
    /// Emit machine-readable JSON instead of one line per level.
    #[arg(long)]
    pub json: bool,
}

/// `zr cache` subcommands.
#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Remove every entry from the result cache.
    Clear,
    /// Print entry count and total size.
    Stats,
}

/// Options for `zr history`.
#[derive(Debug, Parser)]
pub struct HistoryOpts {
    /// Only include records at or after this many hours ago.
    #[arg(long)]
    pub since: Option<u64>,
    /// Only include records with this status.
    #[arg(long)]
    pub status: Option<HistoryStatusArg>,
    /// Only include records for this task.
    #[arg(long)]
    pub task: Option<String>,
    /// Maximum number of records to print, most recent first.
    #[arg(long)]
    pub limit: Option<usize>,
    /// Emit machine-readable JSON instead of a formatted table.
    #[arg(long)]
    pub json: bool,
}

/// CLI-facing mirror of [`crate::history::HistoryStatus`], kept separate so
/// the wire/storage enum can evolve without touching argument parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HistoryStatusArg {
    /// The task ran its command and exited zero.
    Ok,
    /// The task was served from the cache.
    CacheHit,
    /// The task's command exited non-zero.
    Failed,
    /// The task exceeded its `timeout_ms`.
    TimedOut,
    /// The task was cancelled before or during execution.
    Cancelled,
}

/// Options for `zr clean`.
#[derive(Debug, Parser)]
pub struct CleanOpts {
    /// Remove everything under the state root.
    #[arg(long)]
    pub all: bool,
    /// Remove only the result cache.
    #[arg(long)]
    pub cache: bool,
    /// Remove only the history log.
    #[arg(long)]
    pub history: bool,
    /// Remove only installed toolchains.
    #[arg(long)]
    pub toolchains: bool,
    /// Remove only installed plugins.
    #[arg(long)]
    pub plugins: bool,
    /// Report what would be removed without removing it.
    #[arg(long)]
    pub dry_run: bool,
}

/// Options for `zr bench`.
#[derive(Debug, Parser)]
pub struct BenchOpts {
    /// Name of the task to benchmark.
    pub task: String,
    /// Number of timed iterations.
    #[arg(short = 'n', long, default_value_t = 10)]
    pub iterations: u32,
    /// Number of untimed warmup iterations run first.
    #[arg(long, default_value_t = 0)]
    pub warmup: u32,
    /// Output format for the aggregated result.
    #[arg(long, value_enum, default_value_t = BenchFormat::Text)]
    pub format: BenchFormat,
}

/// Output format for `zr bench`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BenchFormat {
    /// Human-readable summary.
    Text,
    /// Machine-readable JSON.
    Json,
    /// Comma-separated values, one row per iteration.
    Csv,
}
