//! Sweep task -- ages out idle calls, stale reassemblies and parrot captures.

use std::sync::Arc;
use std::time::Duration;

use fne_calltrack::FneCore;
use tokio::sync::broadcast;

/// Run the sweep loop until shutdown.
pub async fn run_sweep_loop(
    core: Arc<FneCore>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let report = core.sweep_now();
                if report.sessions > 0 || report.pdus > 0 || report.parrot_cleared {
                    tracing::debug!(
                        sessions = report.sessions,
                        pdus = report.pdus,
                        parrot_cleared = report.parrot_cleared,
                        "sweep: expired"
                    );
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("sweep: shutting down");
                break;
            }
        }
    }
}
