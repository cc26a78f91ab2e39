//! CLI command handlers.

mod ledger;
mod run;

pub use ledger::run_ledger_command;
pub use run::run_harvest_command;
