//! Maintenance loop
//!
//! On a fixed tick: heartbeat every locally running task, then drive the
//! store's sweep (total-timeout, heartbeat-lost, retry scheduling, retry
//! exhaustion with failure cascade, expiry GC). Store errors are logged
//! and the next tick proceeds; a wedged backend must not take the
//! manager down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::RunningSet;
use crate::store::TaskStore;

pub(crate) struct MaintenanceLoop {
    pub store: Arc<dyn TaskStore>,
    pub running: RunningSet,
    pub active_interval_ms: u64,
    pub expire_seconds: Option<i64>,
    pub shutdown_rx: watch::Receiver<bool>,
}

impl MaintenanceLoop {
    pub async fn run(mut self) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.active_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        debug!(interval_ms = self.active_interval_ms, "maintenance loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = self.shutdown_rx.changed() => break,
            }
        }

        debug!("maintenance loop exited");
    }

    async fn tick(&self) {
        let running = self.running.ids();
        if !running.is_empty() {
            if let Err(e) = self.store.update_active_time(&running).await {
                error!("heartbeat update failed: {}", e);
            }
        }

        match self
            .store
            .handle_timeouts(self.active_interval_ms, self.expire_seconds)
            .await
        {
            Ok(report) if !report.is_empty() => {
                info!(
                    timed_out = report.timed_out,
                    heartbeat_lost = report.heartbeat_lost,
                    retried = report.retried,
                    exhausted = report.exhausted,
                    cascaded = report.cascaded,
                    expired = report.expired,
                    "maintenance sweep"
                );
            }
            Ok(_) => {}
            Err(e) => error!("maintenance sweep failed: {}", e),
        }
    }
}
