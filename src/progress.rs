//! Progress UI fed by the orchestrator's event stream.

use std::time::Duration;

use harvester_core::{HarvestEvent, Outcome};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Spawns the progress bar when `enabled`; otherwise the receiver is dropped
/// and events are discarded by the sender.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    events: mpsc::UnboundedReceiver<HarvestEvent>,
) -> Option<JoinHandle<()>> {
    if !enabled {
        return None;
    }
    Some(tokio::spawn(render(events)))
}

async fn render(mut events: mpsc::UnboundedReceiver<HarvestEvent>) {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{pos}/{len}] {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(100));

    while let Some(event) = events.recv().await {
        match event {
            HarvestEvent::Discovered(_) => bar.inc_length(1),
            HarvestEvent::Started { identity } => bar.set_message(format!("downloading {identity}")),
            HarvestEvent::Retrying {
                identity,
                attempt,
                delay,
            } => bar.set_message(format!(
                "retrying {identity} (attempt {attempt} in {}ms)",
                delay.as_millis()
            )),
            HarvestEvent::Finished(outcome) => {
                bar.inc(1);
                if let Outcome::Failed { identity, error } = &outcome {
                    bar.println(format!("failed: {identity}: {error}"));
                }
            }
        }
    }

    bar.finish_and_clear();
}

#[cfg(test)]
mod tests {
    use super::spawn_progress_ui;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_spawn_progress_ui_disabled_returns_none() {
        let (_tx, rx) = mpsc::unbounded_channel();
        assert!(spawn_progress_ui(false, rx).is_none());
    }

    #[tokio::test]
    async fn test_progress_ui_ends_when_senders_drop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_progress_ui(true, rx).unwrap();
        drop(tx);
        handle.await.unwrap();
    }
}
