//! Maintenance worker: node TTLs, task leases, workflow deadlines and
//! retention.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::orchestrator::Orchestrator;
use crate::store::Store;

/// Runs [`Orchestrator::run_maintenance`] every
/// `maintenance_poll_interval`. Timeout precision is bounded by the
/// interval.
pub(crate) struct MaintenanceWorker<S: Store> {
    orchestrator: Arc<Orchestrator<S>>,
    worker_id: String,
}

impl<S: Store> MaintenanceWorker<S> {
    pub fn new(orchestrator: Arc<Orchestrator<S>>, worker_id: String) -> Self {
        Self {
            orchestrator,
            worker_id,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_interval = interval(self.orchestrator.config().maintenance_poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(worker_id = %self.worker_id, "Maintenance worker started");

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    match self.orchestrator.run_maintenance().await {
                        Ok(report) if report.nodes_unreachable > 0 => {
                            warn!(
                                worker_id = %self.worker_id,
                                nodes = report.nodes_unreachable,
                                reassigned = report.tasks_reassigned,
                                "Nodes became unreachable"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Error running maintenance"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "Maintenance worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
