//! Runtime configuration.

use std::time::Duration;

use crate::machine::MachineConfig;
use crate::projection::ProjectionConfig;
use crate::registry::RegistryConfig;
use crate::scheduler::{AgingPolicy, RetryPolicy, SchedulerConfig};

/// Configuration for the orchestrator and its background workers.
///
/// Controls polling intervals, leases, timeouts, retention and worker
/// identity.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use eventflow::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     dispatch_poll_interval: Duration::from_millis(50),
///     maintenance_poll_interval: Duration::from_millis(500),
///     lease_duration: Duration::from_secs(60),
///     retention: None, // keep terminal instances forever
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How often to offer queued tasks to push-capable nodes.
    ///
    /// Lower values reduce dispatch latency for push nodes. Polling nodes
    /// are unaffected. Default: 100ms.
    pub dispatch_poll_interval: Duration,

    /// How often to expire leases, node heartbeats and workflow deadlines.
    ///
    /// Timeout precision is limited by this interval.
    /// Default: 1 second.
    pub maintenance_poll_interval: Duration,

    /// How often to publish newly committed events to the transport.
    /// Default: 100ms.
    pub publish_poll_interval: Duration,

    /// Maximum events published per poll. Default: 100.
    pub publish_batch_size: u32,

    /// Lease granted to a node for a task without an execution timeout.
    ///
    /// Should be longer than the longest expected task. If the node never
    /// reports, the task is released after this duration.
    /// Default: 5 minutes.
    pub lease_duration: Duration,

    /// How long a push node may take to accept an offered task.
    /// Default: 5 seconds.
    pub offer_timeout: Duration,

    /// How long a push node that turned a task down is not offered that
    /// task again. Default: 30 seconds.
    pub offer_cooldown: Duration,

    /// Maximum time to wait for workers during shutdown.
    ///
    /// After this timeout, the runtime will force stop.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,

    /// Retry policy for transient storage and transport failures.
    pub retry_policy: RetryPolicy,

    /// Worker identifier, used in logs and checkpoint names.
    ///
    /// If `None`, a UUID is generated when the orchestrator is built.
    pub worker_id: Option<String>,

    /// Store a workflow snapshot every this many events. `0` disables
    /// snapshots. Default: 50.
    pub snapshot_interval: u64,

    /// Terminal instances older than this are tombstoned. `None` keeps them
    /// forever. Default: 7 days.
    pub retention: Option<Duration>,

    /// Maximum instances tombstoned per maintenance pass. Default: 100.
    pub tombstone_batch_size: u32,

    /// Heartbeat TTL and reservation settings.
    pub registry: RegistryConfig,

    /// Starvation avoidance for queued tasks.
    pub aging: AgingPolicy,

    /// Projection worker settings.
    pub projection: ProjectionConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dispatch_poll_interval: Duration::from_millis(100),
            maintenance_poll_interval: Duration::from_secs(1),
            publish_poll_interval: Duration::from_millis(100),
            publish_batch_size: 100,
            lease_duration: Duration::from_secs(300), // 5 minutes
            offer_timeout: Duration::from_secs(5),
            offer_cooldown: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            worker_id: None,
            snapshot_interval: 50,
            retention: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            tombstone_batch_size: 100,
            registry: RegistryConfig::default(),
            aging: AgingPolicy::default(),
            projection: ProjectionConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub(crate) fn machine(&self) -> MachineConfig {
        MachineConfig {
            snapshot_interval: self.snapshot_interval,
        }
    }

    pub(crate) fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            lease_duration: self.lease_duration,
            aging: self.aging.clone(),
            offer_timeout: self.offer_timeout,
            offer_cooldown: self.offer_cooldown,
        }
    }
}
