//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use harvester_core::{CancelPolicy, LedgerBackend};

/// Harvest papers and metadata from proceedings catalogs.
///
/// Runs are resumable: items already recorded in the output ledger are never
/// downloaded again.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Walk a catalog and download every item not yet in the ledger
    Run(RunArgs),
    /// Show what the ledger of an output directory contains
    Ledger(LedgerArgs),
}

#[derive(Args, Debug, Clone)]
#[command(group(clap::ArgGroup::new("source").required(true).args(["profile", "catalog"])))]
pub struct RunArgs {
    /// Site profile (TOML) describing the catalog's pages
    #[arg(long, value_name = "FILE")]
    pub profile: Option<PathBuf>,

    /// Static catalog manifest (TOML) listing items explicitly
    #[arg(long, value_name = "FILE")]
    pub catalog: Option<PathBuf>,

    /// Harvest configuration file (TOML); flags override its values
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Output root for pdfs/, json/ and the ledger
    #[arg(short = 'o', long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Maximum concurrent downloads (1-64)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub concurrency: Option<u8>,

    /// Attempts per item including the first (1-20)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_attempts: Option<u32>,

    /// First retry backoff delay in milliseconds
    #[arg(long, value_name = "MS")]
    pub base_delay_ms: Option<u64>,

    /// Per-host politeness delay range in milliseconds, e.g. 1500..3500 (0..0 disables)
    #[arg(long, value_name = "MIN..MAX", value_parser = parse_delay_range)]
    pub host_delay_ms: Option<(u64, u64)>,

    /// Per-call connect and read timeout in milliseconds
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..=3_600_000))]
    pub timeout_ms: Option<u64>,

    /// Ledger backend (json or sqlite)
    #[arg(long, value_name = "BACKEND")]
    pub ledger: Option<LedgerBackend>,

    /// What to do with running downloads on Ctrl+C (drain or abort)
    #[arg(long, value_name = "POLICY")]
    pub cancel_policy: Option<CancelPolicy>,

    /// Accept artifacts that do not start with the %PDF- signature
    #[arg(long)]
    pub no_verify_pdf: bool,
}

#[derive(Args, Debug, Clone)]
pub struct LedgerArgs {
    /// Output root holding the ledger
    #[arg(short = 'o', long, value_name = "DIR", default_value = "harvest")]
    pub output_dir: PathBuf,

    /// Ledger backend (json or sqlite)
    #[arg(long, value_name = "BACKEND", default_value = "json")]
    pub ledger: LedgerBackend,

    /// Print the totals as JSON
    #[arg(long)]
    pub json: bool,
}

/// Parses `MIN..MAX` (or a single value for a fixed delay).
fn parse_delay_range(raw: &str) -> Result<(u64, u64), String> {
    let parse = |value: &str| {
        value
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("'{value}' is not a number of milliseconds"))
    };
    let (min, max) = match raw.split_once("..") {
        Some((min, max)) => (parse(min)?, parse(max)?),
        None => {
            let fixed = parse(raw)?;
            (fixed, fixed)
        }
    };
    if min > max {
        return Err(format!("minimum {min} is greater than maximum {max}"));
    }
    Ok((min, max))
}
