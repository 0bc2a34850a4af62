use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SweeperSettings;
use crate::error::Result;
use crate::idempotency::storage::ExpiredEntrySweep;
use crate::observability::{get_metrics, LatencyTimer};

/// Periodically deletes expired responses from a backend without native TTL.
pub struct ExpirationSweeper {
    store: Arc<dyn ExpiredEntrySweep>,
    settings: SweeperSettings,
}

impl ExpirationSweeper {
    pub fn new(store: Arc<dyn ExpiredEntrySweep>, settings: SweeperSettings) -> Self {
        Self { store, settings }
    }

    /// Runs one sweep: up to `max_batches_per_sweep` batches of at most
    /// `batch_size` rows each, stopping early once a batch comes back short.
    pub async fn sweep(&self) -> Result<u64> {
        let timer = LatencyTimer::new();
        let mut total = 0;

        for _ in 0..self.settings.max_batches_per_sweep {
            let deleted = self
                .store
                .delete_expired_batch(Utc::now(), self.settings.batch_size)
                .await?;
            total += deleted;

            if deleted < self.settings.batch_size as u64 {
                break;
            }
        }

        get_metrics().record_sweep(total, timer.elapsed_ms());
        Ok(total)
    }

    /// Starts the sweeper in a background task. It exits when `shutdown`
    /// flips to `true` or its sender is dropped.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("Expiration sweeper stopping");
                            break;
                        }
                        continue;
                    }
                }

                match self.sweep().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!("Swept {} expired idempotency responses", count);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to sweep expired idempotency responses: {}", e);
                    }
                }
            }
        })
    }
}
