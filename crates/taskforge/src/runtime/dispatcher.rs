//! Dispatch loop
//!
//! Single claim loop per manager: acquire a global concurrency permit,
//! wait out the pause gate, claim the best eligible task, and hand it to
//! an executor fiber. New submissions post the wake signal so an idle
//! loop does not sit out a full poll interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, error, warn};

use super::executor::run_task;
use super::RunningSet;
use crate::handler::HandlerRegistry;
use crate::store::TaskStore;

pub(crate) struct Dispatcher {
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<HandlerRegistry>,
    pub running: RunningSet,
    pub semaphore: Arc<Semaphore>,
    pub wake: Arc<Notify>,

    /// true while `pause_all` is in effect
    pub pause_rx: watch::Receiver<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
    pub poll_interval: Duration,
    pub worker_id: String,
}

impl Dispatcher {
    pub async fn run(mut self) {
        debug!(worker_id = %self.worker_id, "dispatcher started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            // Hold the slot while paused: in-flight tasks keep running,
            // no new ones start.
            if self.wait_while_paused().await {
                break;
            }

            let eligible = self.registry.eligible_names();
            match self.store.claim(&eligible, &self.worker_id).await {
                Ok(Some(task)) => {
                    let Some(entry) = self.registry.get(&task.name) else {
                        // Claim only sees registered names; a miss here
                        // means the registry and claim raced a reload.
                        warn!(task_id = task.id, name = %task.name, "claimed task has no handler");
                        continue;
                    };

                    self.running.insert(task.id);
                    entry.acquire();
                    tokio::spawn(run_task(
                        Arc::clone(&self.store),
                        entry,
                        self.running.clone(),
                        task,
                        permit,
                    ));
                }
                Ok(None) => {
                    drop(permit);
                    if self.idle_wait().await {
                        break;
                    }
                }
                Err(e) => {
                    error!("claim failed: {}", e);
                    drop(permit);
                    if self.idle_wait().await {
                        break;
                    }
                }
            }
        }

        debug!(worker_id = %self.worker_id, "dispatcher exited");
    }

    /// Returns true when shutdown was signalled.
    async fn wait_while_paused(&mut self) -> bool {
        while *self.pause_rx.borrow() {
            tokio::select! {
                _ = self.pause_rx.changed() => {}
                _ = self.shutdown_rx.changed() => return true,
            }
        }
        *self.shutdown_rx.borrow()
    }

    /// Sleep until new work is signalled or the poll interval elapses.
    /// Returns true when shutdown was signalled.
    async fn idle_wait(&mut self) -> bool {
        tokio::select! {
            _ = self.wake.notified() => false,
            _ = tokio::time::sleep(self.poll_interval) => false,
            _ = self.shutdown_rx.changed() => true,
        }
    }
}
