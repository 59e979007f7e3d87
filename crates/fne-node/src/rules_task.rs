//! Rules reload task -- re-reads the rules file and swaps the snapshot.
//!
//! A file that fails to parse or validate leaves the previous snapshot in place.

use std::path::PathBuf;
use std::time::Duration;

use fne_routing::SharedRules;
use tokio::sync::broadcast;

/// Run the reload loop until shutdown.
pub async fn run_rules_loop(
    rules: SharedRules,
    path: PathBuf,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = rules.reload(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "rules: reload failed, keeping previous");
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("rules: shutting down");
                break;
            }
        }
    }
}
