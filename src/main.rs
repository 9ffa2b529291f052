//! `zr` binary entry point.
use clap::Parser;
use zr::cli;
use zr::commands;

#[allow(clippy::print_stderr)]
fn main() {
    let args = cli::Cli::parse();
    let command_name = match &args.command {
        cli::Command::Run(_) => "run",
        cli::Command::List(_) => "list",
        cli::Command::Graph(_) => "graph",
        cli::Command::Cache { .. } => "cache",
        cli::Command::History(_) => "history",
        cli::Command::Clean(_) => "clean",
        cli::Command::Bench(_) => "bench",
    };
    zr::logging::init_subscriber(args.verbose, command_name);

    match commands::dispatch(&args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("\x1b[31mError: {e}\x1b[0m");
            std::process::exit(e.exit_code());
        }
    }
}
