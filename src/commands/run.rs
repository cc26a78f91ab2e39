//! Run command handler: build the adapter, run the orchestrator, report.

use std::io::{self, IsTerminal};
use std::sync::Arc;

use anyhow::{Context, Result};
use harvester_core::{
    HarvestConfig, Orchestrator, RunSummary, SelectorAdapter, SiteAdapter, SiteProfile,
    StaticCatalog,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::RunArgs;
use crate::progress::spawn_progress_ui;
use crate::terminal;
use crate::{ProcessExit, determine_exit_outcome};

pub async fn run_harvest_command(args: &RunArgs, quiet: bool) -> Result<ProcessExit> {
    let config = resolve_config(args)?;
    debug!(?config, "configuration resolved");

    let client = config
        .http_client()
        .context("failed to build HTTP client")?;
    let politeness = Arc::new(config.rate_limiter());

    let adapter: Arc<dyn SiteAdapter> = if let Some(path) = &args.profile {
        let profile = SiteProfile::from_file(path)
            .with_context(|| format!("failed to load site profile {}", path.display()))?;
        Arc::new(
            SelectorAdapter::new(profile, client.clone())?.with_politeness(Arc::clone(&politeness)),
        )
    } else if let Some(path) = &args.catalog {
        let catalog = StaticCatalog::from_file(path)
            .with_context(|| format!("failed to load catalog {}", path.display()))?;
        Arc::new(catalog.with_client(client.clone(), Arc::clone(&politeness)))
    } else {
        anyhow::bail!("either --profile or --catalog is required");
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(config, adapter)
        .with_http_client(client)
        .with_rate_limiter(politeness)
        .with_events(events_tx);

    let stop = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight downloads");
            stop.cancel();
        }
    });

    let use_spinner = terminal::should_use_spinner(
        io::stderr().is_terminal(),
        quiet,
        terminal::is_dumb_terminal(),
    );
    let progress = spawn_progress_ui(use_spinner, events_rx);

    let summary = orchestrator.run().await?;

    if let Some(handle) = progress {
        let _ = handle.await;
    }
    if !quiet {
        print_summary(&summary);
    }
    info!(exit = ?determine_exit_outcome(summary.completed, summary.failed), "run complete");
    Ok(determine_exit_outcome(summary.completed, summary.failed))
}

/// Loads the config file (if any), applies flag overrides and validates.
fn resolve_config(args: &RunArgs) -> Result<HarvestConfig> {
    let mut config = match &args.config {
        Some(path) => HarvestConfig::from_toml_file(path)?,
        None => HarvestConfig::default(),
    };

    if let Some(dir) = &args.output_dir {
        config.output_root.clone_from(dir);
    }
    if let Some(concurrency) = args.concurrency {
        config.max_concurrency = usize::from(concurrency);
    }
    if let Some(max_attempts) = args.max_attempts {
        config.retry.max_attempts = max_attempts;
    }
    if let Some(base_delay_ms) = args.base_delay_ms {
        config.retry.base_delay_ms = base_delay_ms;
        config.retry.max_delay_ms = config.retry.max_delay_ms.max(base_delay_ms);
    }
    if let Some((min, max)) = args.host_delay_ms {
        config.politeness.min_delay_ms = min;
        config.politeness.max_delay_ms = max;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.network_timeout_ms = timeout_ms;
    }
    if let Some(backend) = args.ledger {
        config.ledger_backend = backend;
    }
    if let Some(policy) = args.cancel_policy {
        config.cancel_policy = policy;
    }
    if args.no_verify_pdf {
        config.verify_pdf_signature = false;
    }

    config.validate()?;
    Ok(config)
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Discovered {}, completed {}, failed {}, skipped {} (duplicate) / {} (no artifact)",
        summary.discovered,
        summary.completed,
        summary.failed,
        summary.skipped_duplicate,
        summary.skipped_no_artifact,
    );
    if summary.cancelled > 0 {
        println!("Cancelled {} item(s); rerun to resume.", summary.cancelled);
    }
    if summary.adapter_errors > 0 {
        println!(
            "{} catalog page(s) could not be listed; see the log for details.",
            summary.adapter_errors
        );
    }
}
