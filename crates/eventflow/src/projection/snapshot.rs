//! The workflow snapshot and the pure fold that derives it from events.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::event::{Causation, EventKind, WorkflowEvent};
use crate::registry::NodeId;
use crate::task::{TaskConfiguration, TaskId, TaskStatus, TaskType};
use crate::workflow::{InstanceId, ResourceLimits, WorkflowRef, WorkflowState};

/// Runtime record of one task inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub config: TaskConfiguration,
    pub status: TaskStatus,
    /// Number of dispatches so far; the current attempt number while running.
    pub attempts: u32,
    /// Failures counted against the retry budget.
    pub failures: u32,
    pub node_id: Option<NodeId>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub dispatched_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_failed_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    /// The `task.dispatched` event of the current attempt.
    pub dispatch_cause: Option<Causation>,
}

impl TaskRecord {
    pub(crate) fn new(config: TaskConfiguration) -> Self {
        Self {
            config,
            status: TaskStatus::WaitingForDependency,
            attempts: 0,
            failures: 0,
            node_id: None,
            dispatched_at: None,
            last_failed_at: None,
            last_error: None,
            result: None,
            dispatch_cause: None,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.config.task_id
    }

    /// Not yet dispatched (or back from a retry/release) and unblocked.
    pub fn is_ready(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Retrying)
    }

    /// When a retrying task becomes eligible again, given its backoff.
    pub fn eligible_at(&self, backoff: Duration) -> Option<OffsetDateTime> {
        match self.status {
            TaskStatus::Retrying => self.last_failed_at.map(|at| at + backoff),
            _ => None,
        }
    }
}

/// Current state of one workflow instance, derived from its events.
///
/// Never mutated by the engine except through [`fold`]; the state machine
/// re-derives it after every append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow_type: String,
    pub instance_id: InstanceId,
    pub state: WorkflowState,
    /// Watermark: events up to and including this sequence are folded in.
    pub sequence: u64,
    pub context: BTreeMap<String, Value>,
    pub resource_limits: ResourceLimits,
    pub tasks: BTreeMap<TaskId, TaskRecord>,
    pub compensation_tasks: BTreeMap<TaskId, TaskRecord>,
    pub has_compensation: bool,
    pub timeout: Option<Duration>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    pub correlation_id: Option<String>,
    pub cancel_requested: bool,
    pub cancel_reason: Option<String>,
    pub failure: Option<String>,
    pub output: Option<BTreeMap<String, Value>>,
}

impl WorkflowSnapshot {
    /// The seed for an instance with no events.
    pub fn empty(workflow: &WorkflowRef) -> Self {
        Self {
            workflow_type: workflow.workflow_type().to_owned(),
            instance_id: workflow.instance_id().clone(),
            state: WorkflowState::Pending,
            sequence: 0,
            context: BTreeMap::new(),
            resource_limits: ResourceLimits::default(),
            tasks: BTreeMap::new(),
            compensation_tasks: BTreeMap::new(),
            has_compensation: false,
            timeout: None,
            started_at: None,
            updated_at: None,
            correlation_id: None,
            cancel_requested: false,
            cancel_reason: None,
            failure: None,
            output: None,
        }
    }

    pub fn workflow(&self) -> WorkflowRef {
        WorkflowRef::new(self.workflow_type.clone(), self.instance_id.clone())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the instance has been started.
    pub fn exists(&self) -> bool {
        self.sequence > 0
    }

    /// Absolute deadline from the overall timeout, if any.
    pub fn deadline(&self) -> Option<OffsetDateTime> {
        Some(self.started_at? + self.timeout?)
    }

    /// Look up a task in either graph.
    pub fn task(&self, task_id: &TaskId) -> Option<&TaskRecord> {
        self.tasks
            .get(task_id)
            .or_else(|| self.compensation_tasks.get(task_id))
    }

    fn task_mut(&mut self, task_id: &TaskId) -> Option<&mut TaskRecord> {
        match self.tasks.get_mut(task_id) {
            Some(record) => Some(record),
            None => self.compensation_tasks.get_mut(task_id),
        }
    }

    /// The task graph currently being executed.
    pub fn active_tasks(&self) -> &BTreeMap<TaskId, TaskRecord> {
        if self.state == WorkflowState::Compensating {
            &self.compensation_tasks
        } else {
            &self.tasks
        }
    }

    /// Whether `task_id` belongs to the graph currently being executed.
    pub fn is_active_task(&self, task_id: &TaskId) -> bool {
        self.active_tasks().contains_key(task_id)
    }

    /// Unblocked tasks of the active graph that nodes can execute.
    pub fn dispatchable_tasks(&self) -> impl Iterator<Item = &TaskRecord> {
        self.active_tasks()
            .values()
            .filter(|t| t.is_ready() && t.config.task_type.is_dispatched())
    }

    /// Tasks of either graph currently held by a node.
    pub fn in_flight(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks
            .values()
            .chain(self.compensation_tasks.values())
            .filter(|t| t.status == TaskStatus::Running)
    }

    /// Results of completed forward tasks, keyed by task id.
    pub fn task_results(&self) -> BTreeMap<String, Value> {
        self.tasks
            .values()
            .filter_map(|t| Some((t.task_id().to_string(), t.result.clone()?)))
            .collect()
    }

    /// Apply one event, enforcing contiguity and instance identity.
    pub fn apply(&mut self, event: &WorkflowEvent) -> Result<()> {
        if event.workflow_type != self.workflow_type || event.instance_id != self.instance_id {
            return Err(Error::Validation(format!(
                "event {} of {} folded into {}",
                event.event_id,
                event.workflow(),
                self.workflow()
            )));
        }
        if event.sequence != self.sequence + 1 {
            return Err(Error::SequenceGap {
                workflow: self.workflow().to_string(),
                expected: self.sequence + 1,
                found: event.sequence,
            });
        }

        self.evolve(event);
        self.sequence = event.sequence;
        self.updated_at = Some(event.timestamp);
        self.refresh_readiness();
        Ok(())
    }

    fn evolve(&mut self, event: &WorkflowEvent) {
        let at = event.timestamp;
        match &event.payload {
            EventKind::WorkflowStarted {
                input,
                tasks,
                compensation,
                timeout,
                resource_limits,
            } => {
                self.state = WorkflowState::Running;
                self.context = input.clone();
                self.tasks = records(tasks);
                self.compensation_tasks = compensation
                    .as_ref()
                    .map(|policy| records(&policy.tasks))
                    .unwrap_or_default();
                self.has_compensation = compensation.is_some();
                self.timeout = *timeout;
                self.resource_limits = resource_limits.clone();
                self.started_at = Some(at);
                self.correlation_id = event.correlation_id.clone();
            }
            EventKind::WorkflowPaused { .. } => self.state = WorkflowState::Paused,
            EventKind::WorkflowResumed => self.state = WorkflowState::Running,
            EventKind::WorkflowWaiting { .. } => {
                self.state = WorkflowState::WaitingForDependency;
            }
            EventKind::WorkflowCancelRequested { reason } => {
                self.cancel_requested = true;
                self.cancel_reason = reason.clone();
            }
            EventKind::WorkflowCancelled { reason } => {
                self.state = WorkflowState::Cancelled;
                if reason.is_some() {
                    self.cancel_reason = reason.clone();
                }
                self.close_open_tasks();
            }
            EventKind::WorkflowCompleted { output } => {
                self.state = WorkflowState::Completed;
                self.output = Some(output.clone());
            }
            EventKind::WorkflowFailed { error } => {
                self.state = WorkflowState::Failed;
                self.failure = Some(error.clone());
                self.close_open_tasks();
            }
            EventKind::WorkflowTimedOut => {
                self.state = WorkflowState::Timeout;
                self.failure = Some("workflow timed out".into());
            }
            EventKind::CompensationStarted { reason } => {
                self.state = WorkflowState::Compensating;
                self.failure = Some(reason.clone());
            }
            EventKind::CompensationCompleted => self.state = WorkflowState::Compensated,
            EventKind::TaskDispatched {
                task_id,
                node_id,
                attempt,
            } => {
                if let Some(task) = self.task_mut(task_id) {
                    task.status = TaskStatus::Running;
                    task.attempts = *attempt;
                    task.node_id = Some(node_id.clone());
                    task.dispatched_at = Some(at);
                    task.dispatch_cause = Some(Causation::local(event));
                }
                if self.state == WorkflowState::Retrying {
                    self.state = WorkflowState::Running;
                }
            }
            EventKind::TaskCompleted { task_id, result, .. } => {
                if let Some(task) = self.task_mut(task_id) {
                    task.status = TaskStatus::Completed;
                    task.result = Some(result.clone());
                    task.node_id = None;
                }
                if self.state == WorkflowState::WaitingForDependency {
                    self.state = WorkflowState::Running;
                }
            }
            EventKind::TaskFailed {
                task_id,
                error,
                will_retry,
                ..
            } => {
                if let Some(task) = self.task_mut(task_id) {
                    task.failures += 1;
                    task.last_error = Some(error.clone());
                    task.last_failed_at = Some(at);
                    task.node_id = None;
                    task.status = if *will_retry {
                        TaskStatus::Retrying
                    } else {
                        TaskStatus::Failed
                    };
                }
                if *will_retry && self.state == WorkflowState::Running {
                    self.state = WorkflowState::Retrying;
                }
            }
            EventKind::TaskReleased { task_id, .. } => {
                if let Some(task) = self.task_mut(task_id) {
                    task.status = TaskStatus::Pending;
                    task.node_id = None;
                }
            }
            EventKind::TaskSkipped { task_id, .. } => {
                if let Some(task) = self.task_mut(task_id) {
                    task.status = TaskStatus::Skipped;
                }
            }
            EventKind::TaskCancelled { task_id } => {
                if let Some(task) = self.task_mut(task_id) {
                    task.status = TaskStatus::Cancelled;
                    task.node_id = None;
                }
            }
        }
    }

    fn close_open_tasks(&mut self) {
        for task in self
            .tasks
            .values_mut()
            .chain(self.compensation_tasks.values_mut())
        {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Cancelled;
                task.node_id = None;
            }
        }
    }

    /// Recompute `Pending` vs `WaitingForDependency` for undispatched tasks.
    fn refresh_readiness(&mut self) {
        refresh_graph(&mut self.tasks);
        refresh_graph(&mut self.compensation_tasks);
    }
}

fn records(tasks: &[TaskConfiguration]) -> BTreeMap<TaskId, TaskRecord> {
    tasks
        .iter()
        .map(|config| (config.task_id.clone(), TaskRecord::new(config.clone())))
        .collect()
}

fn refresh_graph(tasks: &mut BTreeMap<TaskId, TaskRecord>) {
    let succeeded: Vec<TaskId> = tasks
        .values()
        .filter(|t| t.status.is_success())
        .map(|t| t.task_id().clone())
        .collect();
    for task in tasks.values_mut() {
        if matches!(
            task.status,
            TaskStatus::Pending | TaskStatus::WaitingForDependency
        ) {
            let unblocked = task
                .config
                .dependencies
                .iter()
                .all(|dep| succeeded.contains(dep));
            task.status = if unblocked {
                TaskStatus::Pending
            } else {
                TaskStatus::WaitingForDependency
            };
        }
    }
}

/// Fold `events` onto `seed`.
///
/// Pure and deterministic: the same seed and events always yield the same
/// snapshot. Events must continue the seed's watermark without gaps.
pub fn fold(events: &[WorkflowEvent], seed: WorkflowSnapshot) -> Result<WorkflowSnapshot> {
    let mut snapshot = seed;
    for event in events {
        snapshot.apply(event)?;
    }
    Ok(snapshot)
}

/// Whether the task is a `wait` task still waiting for its signal.
pub(crate) fn is_open_wait(task: &TaskRecord) -> bool {
    task.config.task_type == TaskType::Wait && !task.status.is_terminal()
}
