//! Publish worker: forwards committed events to the transport.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::orchestrator::Orchestrator;
use crate::store::Store;

/// Tails the global event feed and publishes every committed event.
///
/// A batch that fills `publish_batch_size` is followed immediately by the
/// next one instead of waiting for the next tick.
pub(crate) struct PublishWorker<S: Store> {
    orchestrator: Arc<Orchestrator<S>>,
    worker_id: String,
}

impl<S: Store> PublishWorker<S> {
    pub fn new(orchestrator: Arc<Orchestrator<S>>, worker_id: String) -> Self {
        Self {
            orchestrator,
            worker_id,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let config = self.orchestrator.config();
        let batch_size = config.publish_batch_size as usize;
        let mut poll_interval = interval(config.publish_poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(worker_id = %self.worker_id, "Publish worker started");

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    loop {
                        match self.orchestrator.publish_pending().await {
                            Ok(published) => {
                                if published > 0 {
                                    debug!(worker_id = %self.worker_id, published, "Events published");
                                }
                                if published == 0 || published < batch_size || *shutdown.borrow() {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "Error publishing events");
                                break;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "Publish worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
