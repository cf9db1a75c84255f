//! Periodic background decay sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::MemoryTierManager;
use crate::errors::MemoryError;

/// Run [`MemoryTierManager::decay_sweep`] every `period` until `shutdown`
/// flips to `true` (or its sender is dropped).
///
/// The first sweep happens one full period after spawning.
pub fn spawn_decay_sweeper(
    manager: Arc<MemoryTierManager>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match manager.decay_sweep(Utc::now()) {
                        Ok(_) => {}
                        Err(MemoryError::SweepInProgress) => {
                            warn!("previous decay sweep still running; skipping tick");
                        }
                        Err(e) => warn!(error = %e, "decay sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("decay sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ArtifactSignal, MemoryRules};

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_expired_and_stops_on_shutdown() {
        let mut rules = MemoryRules::default();
        rules.short_term.default_ttl_secs = 1;
        let manager = Arc::new(MemoryTierManager::new(rules));
        manager.tag(
            ArtifactSignal::new("scratch"),
            None,
            Utc::now() - chrono::Duration::seconds(10),
        );

        let (tx, rx) = watch::channel(false);
        let handle = spawn_decay_sweeper(manager.clone(), Duration::from_secs(5), rx);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(manager.get("scratch").is_none());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
