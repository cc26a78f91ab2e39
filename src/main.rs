//! CLI entry point for the harvester tool.

use std::process::ExitCode;

use clap::Parser;
use tracing::debug;

mod cli;
mod commands;
mod progress;
mod terminal;

use cli::{Cli, Command};

/// Process exit outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessExit {
    /// No item failed.
    Success,
    /// Some items completed, some failed.
    Partial,
    /// Every attempted item failed, or the run could not start.
    Failure,
}

impl ProcessExit {
    fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Partial => 1,
            Self::Failure => 2,
        }
    }
}

/// Maps completed and failed counts to the process exit outcome.
pub(crate) fn determine_exit_outcome(completed: usize, failed: usize) -> ProcessExit {
    if failed == 0 {
        ProcessExit::Success
    } else if completed > 0 {
        ProcessExit::Partial
    } else {
        ProcessExit::Failure
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    terminal::init_tracing(terminal::default_log_level(cli.quiet, cli.verbose));
    debug!(?cli, "CLI arguments parsed");

    let result = match &cli.command {
        Command::Run(args) => commands::run_harvest_command(args, cli.quiet).await,
        Command::Ledger(args) => commands::run_ledger_command(args)
            .await
            .map(|()| ProcessExit::Success),
    };

    match result {
        Ok(outcome) => ExitCode::from(outcome.code()),
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(ProcessExit::Failure.code())
        }
    }
}
