//! Background runtime for an [`Orchestrator`].
//!
//! - [`WorkflowRuntime`]: recovers scheduling state, then runs the workers
//!   until shutdown
//! - [`RuntimeConfig`]: polling intervals, leases, timeouts and retention
//!
//! The runtime spawns four workers:
//!
//! - dispatch: offers queued tasks to push-capable nodes
//! - maintenance: node heartbeats, task leases, workflow deadlines, retention
//! - publish: forwards committed events to the transport
//! - projection: keeps cached projections caught up with the event feed
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use eventflow::{MemoryStore, Orchestrator, RuntimeConfig, WorkflowRuntime};
//!
//! let orchestrator = Arc::new(
//!     Orchestrator::builder(MemoryStore::new())
//!         .register(order_workflow())
//!         .config(RuntimeConfig::default())
//!         .build()?,
//! );
//!
//! WorkflowRuntime::new(Arc::clone(&orchestrator))
//!     .run(shutdown_signal)
//!     .await?;
//! ```

mod config;
mod dispatch_worker;
mod maintenance_worker;
mod publish_worker;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

pub use config::RuntimeConfig;

use self::dispatch_worker::DispatchWorker;
use self::maintenance_worker::MaintenanceWorker;
use self::publish_worker::PublishWorker;
use crate::orchestrator::Orchestrator;
use crate::projection::ProjectionWorker;
use crate::store::Store;

/// Runs the background workers of one orchestrator.
pub struct WorkflowRuntime<S: Store> {
    orchestrator: Arc<Orchestrator<S>>,
}

impl<S: Store> WorkflowRuntime<S> {
    pub fn new(orchestrator: Arc<Orchestrator<S>>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator<S>> {
        &self.orchestrator
    }

    /// Recover, then run the workers until `shutdown` completes.
    ///
    /// Recovery runs before any worker starts, so leases and deadlines of
    /// instances that were live before a restart are enforced from the
    /// first maintenance pass. On shutdown, workers finish their current
    /// iteration; after `shutdown_timeout` the runtime stops waiting.
    pub async fn run<F>(self, shutdown: F) -> crate::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let orchestrator = self.orchestrator;
        let worker_id = orchestrator.worker_id().to_owned();
        let config = orchestrator.config().clone();

        info!(worker_id = %worker_id, "Runtime starting");
        orchestrator.recover().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut worker_handles = Vec::new();

        let dispatch = DispatchWorker::new(Arc::clone(&orchestrator), format!("{worker_id}-dispatch"));
        let rx = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move { dispatch.run(rx).await }));

        let maintenance =
            MaintenanceWorker::new(Arc::clone(&orchestrator), format!("{worker_id}-maintenance"));
        let rx = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move { maintenance.run(rx).await }));

        let publish = PublishWorker::new(Arc::clone(&orchestrator), format!("{worker_id}-publish"));
        let rx = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move { publish.run(rx).await }));

        let projection = ProjectionWorker::new(
            Arc::clone(orchestrator.projector()),
            config.projection.clone(),
            format!("projections.{worker_id}"),
            format!("{worker_id}-projection"),
        );
        let rx = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            if let Err(e) = projection.run(rx).await {
                error!(error = %e, "Projection worker failed");
            }
        }));

        shutdown.await;
        let _ = shutdown_tx.send(true);

        let all_workers = async {
            for handle in worker_handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(config.shutdown_timeout, all_workers).await {
            Ok(()) => {
                info!(worker_id = %worker_id, "Runtime stopped gracefully");
            }
            Err(_) => {
                warn!(
                    worker_id = %worker_id,
                    timeout_secs = config.shutdown_timeout.as_secs(),
                    "Shutdown timeout exceeded, forcing stop"
                );
            }
        }

        Ok(())
    }
}
