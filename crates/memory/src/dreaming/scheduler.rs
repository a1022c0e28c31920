//! Background automatic dreaming.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{CycleOutcome, DreamingEngine};

/// Run [`DreamingEngine::check_and_run`] every `interval` until `shutdown_tx`
/// publishes `true` (or is dropped).
pub fn spawn_auto_dreaming(
    engine: Arc<DreamingEngine>,
    interval: Duration,
    shutdown_tx: &watch::Sender<bool>,
) -> JoinHandle<()> {
    let mut rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "auto-dreaming started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match engine.check_and_run().await {
                        Ok(CycleOutcome::Committed { insight_id, records, .. }) => {
                            info!(%insight_id, records, "auto-dreaming committed an insight");
                        }
                        Ok(outcome) => debug!(?outcome, "auto-dreaming check finished"),
                        Err(err) => error!(error = %err, "auto-dreaming cycle hit a storage failure"),
                    }
                }
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("auto-dreaming stopped");
    })
}
