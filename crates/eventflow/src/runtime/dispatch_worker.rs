//! Dispatch worker: offers queued tasks to push-capable nodes.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::orchestrator::Orchestrator;
use crate::store::Store;

/// Offers ready tasks to nodes registered with a
/// [`NodeClient`](crate::NodeClient) every `dispatch_poll_interval`.
///
/// Polling nodes pull their work through
/// [`Orchestrator::poll_tasks`]; this worker never touches them.
pub(crate) struct DispatchWorker<S: Store> {
    orchestrator: Arc<Orchestrator<S>>,
    worker_id: String,
}

impl<S: Store> DispatchWorker<S> {
    pub fn new(orchestrator: Arc<Orchestrator<S>>, worker_id: String) -> Self {
        Self {
            orchestrator,
            worker_id,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_interval = interval(self.orchestrator.config().dispatch_poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(worker_id = %self.worker_id, "Dispatch worker started");

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    match self.orchestrator.dispatch_pending().await {
                        Ok(0) => {}
                        Ok(accepted) => debug!(worker_id = %self.worker_id, accepted, "Tasks pushed"),
                        Err(e) => error!(error = %e, "Error dispatching tasks"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "Dispatch worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
