use crate::logger::Component;
use crate::storage::{checkpoints, ops, InputManagement, Storage};
use crate::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Periodic pruning. Runs inside the long-lived writer lock, so a collection
/// pass never interleaves with the consumer's block folds.
pub struct GarbageCollector {
    storage: Arc<Storage>,
    interval: Duration,
}

impl GarbageCollector {
    pub fn new(storage: Arc<Storage>, interval: Duration) -> Self {
        GarbageCollector { storage, interval }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if self.interval.is_zero() {
            info!(Component::GarbageCollector, "Garbage collection disabled");
            return;
        }
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick of a tokio interval fires immediately; skip it so
        // the first pass happens one interval after startup
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(Component::GarbageCollector, "Garbage collector stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.collect().await {
                        error!(Component::GarbageCollector, "Collection pass failed: {}", e);
                    }
                }
            }
        }
    }

    pub async fn collect(&self) -> Result<(), crate::error::StorageError> {
        let storage = Arc::clone(&self.storage);
        let (spent, datums, scripts) = tokio::task::spawn_blocking(move || {
            storage.with_writer(|conn| {
                let spent = match storage.input_management {
                    InputManagement::MarkSpentInputs => 0,
                    InputManagement::RemoveSpentInputs => {
                        match checkpoints::most_recent(conn)? {
                            None => 0,
                            Some(tip) => {
                                let horizon = tip.slot_no.saturating_sub(storage.longest_rollback);
                                ops::prune_spent_inputs(conn, horizon)?
                            }
                        }
                    }
                };
                let datums = ops::prune_orphan_binary_data(conn)?;
                let scripts = ops::prune_orphan_scripts(conn)?;
                Ok((spent, datums, scripts))
            })
        })
        .await
        .map_err(|e| crate::error::StorageError::Custom(e.to_string()))??;

        if spent + datums + scripts > 0 {
            info!(
                Component::GarbageCollector,
                "Collected {} spent inputs, {} datums, {} scripts", spent, datums, scripts
            );
        } else {
            debug!(Component::GarbageCollector, "Nothing to collect");
        }
        Ok(())
    }
}
