//! Periodic overdue sweep

use chrono::Utc;
use stagepay_core::{OverdueSweep, StageEngine, StagePayError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Calls `refresh_overdue_status` on a fixed interval until told to stop.
pub struct OverdueSweeper {
    engine: Arc<StageEngine>,
    every: Duration,
}

impl OverdueSweeper {
    pub fn new(engine: Arc<StageEngine>, every: Duration) -> Self {
        Self { engine, every }
    }

    pub async fn run_once(&self) -> Result<OverdueSweep, StagePayError> {
        self.engine.refresh_overdue_status(Utc::now()).await
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_secs = self.every.as_secs(), "Overdue sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.run_once().await {
                            Ok(sweep) if !sweep.marked_overdue.is_empty() => {
                                tracing::info!(
                                    examined = sweep.examined,
                                    marked = sweep.marked_overdue.len(),
                                    "Overdue sweep marked stages"
                                );
                            }
                            Ok(sweep) => {
                                tracing::debug!(examined = sweep.examined, "Overdue sweep found nothing");
                            }
                            Err(e) => tracing::error!(error = %e, "Overdue sweep failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Overdue sweeper stopped");
        })
    }
}
