//! Orchestrator: the entry point for callers and worker nodes.
//!
//! The orchestrator validates preconditions and delegates. Lifecycle
//! commands go to the [`StateMachine`]; task delivery and node reports go to
//! the [`TaskScheduler`]; node liveness lives in the [`NodeRegistry`].
//! After every transition it brings the work queue and the deadline index in
//! line with the new snapshot.
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeMap;
//! use eventflow::{MemoryStore, Orchestrator, TaskConfiguration, TaskType, WorkflowDefinition};
//!
//! # async fn example() -> eventflow::Result<()> {
//! let orchestrator = Orchestrator::builder(MemoryStore::new())
//!     .register(
//!         WorkflowDefinition::new("order")
//!             .with_task(TaskConfiguration::new("charge", TaskType::Effect)),
//!     )
//!     .build()?;
//!
//! let workflow = orchestrator
//!     .start_workflow("order", "ord-1", BTreeMap::new(), None)
//!     .await?;
//! let snapshot = orchestrator.get_workflow_state(&workflow).await?;
//! assert_eq!(snapshot.sequence, 1);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::{EventId, WorkflowEvent};
use crate::log::EventLog;
use crate::machine::{Command, StateMachine, Transition};
use crate::projection::{Projection, Projector, WorkflowSnapshot};
use crate::registry::{Heartbeat, NodeClient, NodeId, NodeRegistration, NodeRegistry};
use crate::runtime::RuntimeConfig;
use crate::scheduler::{TaskAssignment, TaskHandle, TaskOutcome, TaskScheduler, retry_transient};
use crate::store::{Store, WorkflowFilter, WorkflowInstanceSummary};
use crate::task::TaskId;
use crate::transport::{NullTransport, TopicMessage, Transport};
use crate::workflow::{InstanceId, WorkflowDefinition, WorkflowRef};

/// Checkpoint under which the transport publisher records its feed position.
pub const PUBLISH_CHECKPOINT: &str = "transport.publisher";

/// Page size for scanning live instances during recovery.
const RECOVERY_PAGE: u32 = 100;

/// Builder for an [`Orchestrator`].
///
/// Registration errors (duplicate workflow types or projection names,
/// invalid definitions) are deferred to [`build`](Self::build).
pub struct OrchestratorBuilder<S: Store> {
    store: S,
    projector: Projector<S>,
    definitions: HashMap<String, WorkflowDefinition>,
    registration_error: Option<Error>,
    transport: Arc<dyn Transport>,
    config: RuntimeConfig,
}

impl<S: Store> OrchestratorBuilder<S> {
    fn new(store: S) -> Self {
        Self {
            projector: Projector::new(EventLog::new(store.clone())),
            store,
            definitions: HashMap::new(),
            registration_error: None,
            transport: Arc::new(NullTransport),
            config: RuntimeConfig::default(),
        }
    }

    /// Register a workflow definition under its `workflow_type`.
    ///
    /// Each workflow type can only be registered once.
    pub fn register(mut self, definition: WorkflowDefinition) -> Self {
        if self.definitions.contains_key(&definition.workflow_type) {
            self.defer(Error::DuplicateWorkflowType(definition.workflow_type));
            return self;
        }
        if let Err(e) = definition.validate() {
            self.defer(e);
            return self;
        }
        self.definitions
            .insert(definition.workflow_type.clone(), definition);
        self
    }

    /// Register a named projection.
    pub fn projection<P: Projection>(mut self, projection: P) -> Self {
        if let Err(e) = self.projector.register(projection) {
            self.defer(e);
        }
        self
    }

    /// Publish committed events through `transport`.
    ///
    /// If not called, events are not published.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    /// Set the runtime configuration.
    ///
    /// If not called, uses [`RuntimeConfig::default()`].
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Orchestrator<S>> {
        if let Some(e) = self.registration_error {
            return Err(e);
        }
        let worker_id = self
            .config
            .worker_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

        let projector = Arc::new(self.projector);
        let machine = Arc::new(StateMachine::new(projector, self.config.machine()));
        let registry = Arc::new(NodeRegistry::new(self.config.registry.clone()));
        let scheduler = TaskScheduler::new(
            Arc::clone(&machine),
            Arc::clone(&registry),
            self.config.scheduler(),
        );

        info!(
            worker_id = %worker_id,
            workflows = self.definitions.len(),
            "Orchestrator built"
        );

        Ok(Orchestrator {
            store: self.store,
            machine,
            scheduler,
            registry,
            definitions: self.definitions,
            transport: self.transport,
            deadlines: Mutex::new(HashMap::new()),
            config: self.config,
            worker_id,
        })
    }

    fn defer(&mut self, error: Error) {
        if self.registration_error.is_none() {
            self.registration_error = Some(error);
        }
    }
}

/// Counts from one [`Orchestrator::run_maintenance`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub nodes_unreachable: usize,
    pub nodes_removed: usize,
    /// Tasks taken back from unreachable nodes.
    pub tasks_reassigned: usize,
    pub leases_expired: usize,
    pub workflows_timed_out: usize,
    pub workflows_tombstoned: usize,
}

/// Workflow orchestrator.
pub struct Orchestrator<S: Store> {
    store: S,
    machine: Arc<StateMachine<S>>,
    scheduler: TaskScheduler<S>,
    registry: Arc<NodeRegistry>,
    definitions: HashMap<String, WorkflowDefinition>,
    transport: Arc<dyn Transport>,
    /// Overall deadlines of live instances.
    deadlines: Mutex<HashMap<WorkflowRef, OffsetDateTime>>,
    config: RuntimeConfig,
    worker_id: String,
}

impl<S: Store> Orchestrator<S> {
    pub fn builder(store: S) -> OrchestratorBuilder<S> {
        OrchestratorBuilder::new(store)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn machine(&self) -> &Arc<StateMachine<S>> {
        &self.machine
    }

    pub fn projector(&self) -> &Arc<Projector<S>> {
        self.machine.projector()
    }

    pub fn scheduler(&self) -> &TaskScheduler<S> {
        &self.scheduler
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn definition(&self, workflow_type: &str) -> Option<&WorkflowDefinition> {
        self.definitions.get(workflow_type)
    }

    fn log(&self) -> &EventLog<S> {
        self.projector().log()
    }

    // =========================================================================
    // Caller API
    // =========================================================================

    /// Start an instance of a registered workflow type.
    ///
    /// Starting an instance that already exists is a no-op returning the
    /// same handle. Fails with [`Error::WorkflowTombstoned`] for ids whose
    /// instance has been retired.
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        instance_id: impl Into<InstanceId>,
        input: BTreeMap<String, Value>,
        correlation_id: Option<String>,
    ) -> Result<WorkflowRef> {
        let definition = self
            .definitions
            .get(workflow_type)
            .ok_or_else(|| Error::UnknownWorkflowType(workflow_type.to_owned()))?;
        let workflow = WorkflowRef::new(workflow_type, instance_id);
        self.ensure_not_tombstoned(&workflow).await?;

        let transition = self
            .machine
            .execute(
                &workflow,
                Command::Start {
                    definition: definition.clone(),
                    input,
                    correlation_id,
                },
            )
            .await?;
        if transition.is_applied() {
            info!(workflow = %workflow, "Workflow started");
        }
        self.settle(&transition)?;
        Ok(workflow)
    }

    /// Pause a running instance. In-flight tasks finish; nothing new is
    /// dispatched until resumed.
    pub async fn pause_workflow(
        &self,
        workflow: &WorkflowRef,
        reason: Option<String>,
    ) -> Result<WorkflowSnapshot> {
        self.command(workflow, Command::Pause { reason }).await
    }

    /// Resume a paused instance. Fails with
    /// [`Error::InvalidStateTransition`] unless it is paused.
    pub async fn resume_workflow(&self, workflow: &WorkflowRef) -> Result<WorkflowSnapshot> {
        self.command(workflow, Command::Resume).await
    }

    /// Request cancellation. The instance becomes `cancelled` once its
    /// in-flight tasks drain; their results are not accepted.
    pub async fn cancel_workflow(
        &self,
        workflow: &WorkflowRef,
        reason: Option<String>,
    ) -> Result<WorkflowSnapshot> {
        self.command(workflow, Command::Cancel { reason }).await
    }

    /// Complete a `wait` task with `payload` as its result.
    pub async fn signal_task(
        &self,
        workflow: &WorkflowRef,
        task_id: impl Into<TaskId>,
        payload: Value,
    ) -> Result<WorkflowSnapshot> {
        self.command(
            workflow,
            Command::SignalTask {
                task_id: task_id.into(),
                payload,
            },
        )
        .await
    }

    /// Current snapshot of an instance.
    pub async fn get_workflow_state(&self, workflow: &WorkflowRef) -> Result<WorkflowSnapshot> {
        self.ensure_not_tombstoned(workflow).await?;
        let snapshot = self.machine.load(workflow).await?;
        if !snapshot.exists() {
            return Err(Error::WorkflowNotFound(workflow.to_string()));
        }
        Ok(snapshot)
    }

    /// Every event of an instance, in sequence order.
    pub async fn get_workflow_history(&self, workflow: &WorkflowRef) -> Result<Vec<WorkflowEvent>> {
        self.ensure_not_tombstoned(workflow).await?;
        let events = self.log().history(workflow).await?;
        if events.is_empty() {
            return Err(Error::WorkflowNotFound(workflow.to_string()));
        }
        Ok(events)
    }

    /// Events with `from <= sequence <= to`, ascending.
    pub async fn replay_workflow(
        &self,
        workflow: &WorkflowRef,
        from_sequence: u64,
        to_sequence: Option<u64>,
    ) -> Result<Vec<WorkflowEvent>> {
        self.ensure_not_tombstoned(workflow).await?;
        self.log().read(workflow, from_sequence, to_sequence).await
    }

    /// A registered projection's state for an instance, caught up to the
    /// latest committed event.
    pub async fn read_projection<P: Projection>(&self, workflow: &WorkflowRef) -> Result<P::State> {
        self.projector().read::<P>(workflow).await
    }

    /// Ancestor event ids of the event at `sequence`, root first.
    pub async fn correlation_chain(
        &self,
        workflow: &WorkflowRef,
        sequence: u64,
    ) -> Result<Vec<EventId>> {
        self.log().correlation_chain(workflow, sequence).await
    }

    pub async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<WorkflowInstanceSummary>> {
        self.store.list_workflows(filter, limit, offset).await
    }

    // =========================================================================
    // Node API
    // =========================================================================

    /// Register a node that polls for work with [`poll_tasks`](Self::poll_tasks).
    pub fn register_node(
        &self,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        capacity_limits: BTreeMap<String, u64>,
    ) -> Result<NodeId> {
        self.registry
            .register_node(capabilities, capacity_limits, OffsetDateTime::now_utc())
    }

    /// Register a node that is offered work through `client`.
    pub fn register_push_node(
        &self,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        capacity_limits: BTreeMap<String, u64>,
        client: Arc<dyn NodeClient>,
    ) -> Result<NodeId> {
        self.registry.register_node_with_client(
            capabilities,
            capacity_limits,
            client,
            OffsetDateTime::now_utc(),
        )
    }

    /// Record a heartbeat. `false` tells the node to register again.
    pub fn heartbeat(&self, node_id: &NodeId, heartbeat: Heartbeat) -> Result<bool> {
        self.registry
            .heartbeat(node_id, heartbeat, OffsetDateTime::now_utc())
    }

    /// Remove a node and hand its leased tasks to others.
    pub async fn unregister_node(&self, node_id: &NodeId) -> Result<NodeRegistration> {
        let registration = self.registry.unregister_node(node_id)?;
        self.scheduler
            .release_node(node_id, OffsetDateTime::now_utc())
            .await?;
        Ok(registration)
    }

    /// Lease up to `max_tasks` tasks to a polling node.
    pub async fn poll_tasks(&self, node_id: &NodeId, max_tasks: usize) -> Result<Vec<TaskAssignment>> {
        self.scheduler
            .dequeue(node_id, max_tasks, OffsetDateTime::now_utc())
            .await
    }

    /// Apply a node's report for a task it holds.
    ///
    /// Repeated and late reports are answered with the instance's current
    /// snapshot and change nothing.
    pub async fn report_task_result(
        &self,
        handle: &TaskHandle,
        outcome: TaskOutcome,
    ) -> Result<WorkflowSnapshot> {
        let transition = self
            .scheduler
            .report(handle, outcome, OffsetDateTime::now_utc())
            .await?;
        self.track(&transition.snapshot)?;
        Ok(transition.snapshot)
    }

    /// Offer queued tasks to push-capable nodes. Returns accepted offers.
    pub async fn dispatch_pending(&self) -> Result<usize> {
        self.scheduler
            .offer_pending(OffsetDateTime::now_utc())
            .await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Rebuild in-memory scheduling state from the log after a restart.
    ///
    /// Every live instance is replayed; its in-flight tasks get their
    /// leases back and its ready tasks are queued. Instances that fail to
    /// load are logged and skipped. Returns the number recovered.
    pub async fn recover(&self) -> Result<usize> {
        let now = OffsetDateTime::now_utc();
        let filter = WorkflowFilter::active();
        let mut offset = 0;
        let mut recovered = 0;

        loop {
            let page = self
                .store
                .list_workflows(&filter, RECOVERY_PAGE, offset)
                .await?;
            for summary in &page {
                let workflow = summary.workflow();
                match self.machine.load(&workflow).await {
                    Ok(snapshot) => {
                        let queued = self.scheduler.restore(&snapshot, now)?;
                        self.track(&snapshot)?;
                        debug!(workflow = %workflow, state = %snapshot.state, queued, "Workflow recovered");
                        recovered += 1;
                    }
                    Err(e) if e.is_fatal() => {
                        error!(workflow = %workflow, error = %e, "Workflow log is corrupt, not recovered");
                    }
                    Err(e) => {
                        warn!(workflow = %workflow, error = %e, "Workflow not recovered");
                    }
                }
            }
            if page.len() < RECOVERY_PAGE as usize {
                break;
            }
            offset += RECOVERY_PAGE;
        }

        info!(worker_id = %self.worker_id, recovered, "Recovery complete");
        Ok(recovered)
    }

    /// One maintenance pass at the current time.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        self.run_maintenance_at(OffsetDateTime::now_utc()).await
    }

    /// One maintenance pass: node TTLs, task leases, workflow deadlines
    /// and retention.
    pub async fn run_maintenance_at(&self, now: OffsetDateTime) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        let expired = self.registry.expire(now)?;
        report.nodes_unreachable = expired.unreachable.len();
        report.nodes_removed = expired.removed.len();
        for node_id in expired.unreachable.iter().chain(&expired.removed) {
            report.tasks_reassigned += self.scheduler.release_node(node_id, now).await?;
        }

        report.leases_expired = self.scheduler.expire_leases(now).await?;
        report.workflows_timed_out = self.expire_deadlines(now).await?;
        report.workflows_tombstoned = self.tombstone(now).await?;

        if report != MaintenanceReport::default() {
            debug!(worker_id = %self.worker_id, ?report, "Maintenance pass");
        }
        Ok(report)
    }

    /// Publish committed events the transport has not seen yet.
    ///
    /// Delivery is at least once: the feed position is stored after each
    /// publish, so a crash in between republishes one event.
    pub async fn publish_pending(&self) -> Result<usize> {
        let position = self
            .store
            .load_projection_position(PUBLISH_CHECKPOINT)
            .await?;
        let events = self
            .store
            .fetch_events_since(position, self.config.publish_batch_size)
            .await?;

        for stored in &events {
            let message = TopicMessage::from_event(&stored.event)?;
            retry_transient(&self.config.retry_policy, "publish event", || {
                self.transport.publish(message.clone())
            })
            .await?;
            self.store
                .store_projection_position(PUBLISH_CHECKPOINT, stored.global_sequence)
                .await?;
        }
        Ok(events.len())
    }

    async fn expire_deadlines(&self, now: OffsetDateTime) -> Result<usize> {
        let due: Vec<WorkflowRef> = self
            .deadlines()?
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(workflow, _)| workflow.clone())
            .collect();

        let mut timed_out = 0;
        for workflow in due {
            match self.machine.execute(&workflow, Command::TimeOut).await {
                Ok(transition) => {
                    if transition.is_applied() {
                        warn!(workflow = %workflow, state = %transition.snapshot.state, "Workflow timed out");
                        timed_out += 1;
                    }
                    self.settle(&transition)?;
                }
                Err(e) => {
                    warn!(workflow = %workflow, error = %e, "Workflow timeout not applied");
                }
            }
        }
        Ok(timed_out)
    }

    async fn tombstone(&self, now: OffsetDateTime) -> Result<usize> {
        let Some(retention) = self.config.retention else {
            return Ok(0);
        };
        let retired = self
            .store
            .tombstone_expired(now - retention, self.config.tombstone_batch_size)
            .await?;
        for workflow in &retired {
            self.projector().invalidate_workflow(workflow)?;
            self.scheduler.forget_workflow(workflow)?;
            self.scheduler.forget_settled(workflow)?;
            self.deadlines()?.remove(workflow);
        }
        if !retired.is_empty() {
            info!(tombstoned = retired.len(), "Terminal workflows tombstoned");
        }
        Ok(retired.len())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn command(&self, workflow: &WorkflowRef, command: Command) -> Result<WorkflowSnapshot> {
        let transition = self.machine.execute(workflow, command).await?;
        self.settle(&transition)?;
        Ok(transition.snapshot)
    }

    fn settle(&self, transition: &Transition) -> Result<()> {
        self.scheduler
            .after_transition(&transition.snapshot, OffsetDateTime::now_utc())?;
        self.track(&transition.snapshot)
    }

    fn track(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        let workflow = snapshot.workflow();
        let mut deadlines = self.deadlines()?;
        match snapshot.deadline() {
            Some(deadline) if !snapshot.is_terminal() => {
                deadlines.insert(workflow, deadline);
            }
            _ => {
                deadlines.remove(&workflow);
            }
        }
        Ok(())
    }

    async fn ensure_not_tombstoned(&self, workflow: &WorkflowRef) -> Result<()> {
        match self.store.workflow_summary(workflow).await? {
            Some(summary) if summary.tombstoned_at.is_some() => {
                Err(Error::WorkflowTombstoned(workflow.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn deadlines(&self) -> Result<MutexGuard<'_, HashMap<WorkflowRef, OffsetDateTime>>> {
        self.deadlines
            .lock()
            .map_err(|_| Error::LockPoisoned("workflow deadlines"))
    }
}

