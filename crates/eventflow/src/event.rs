//! Workflow events: the immutable facts recorded in each instance's log.

use std::{collections::BTreeMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    registry::NodeId,
    task::{TaskConfiguration, TaskId},
    workflow::{CompensationPolicy, InstanceId, ResourceLimits, WorkflowRef},
};

/// Globally unique, time-ordered event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for EventId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// What happened. The payload of a [`WorkflowEvent`].
///
/// Serialized with a `type` tag such as `task.failed`; the tag is the
/// event's wire name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "workflow.started")]
    WorkflowStarted {
        input: BTreeMap<String, Value>,
        tasks: Vec<TaskConfiguration>,
        #[serde(default)]
        compensation: Option<CompensationPolicy>,
        #[serde(default)]
        timeout: Option<Duration>,
        #[serde(default)]
        resource_limits: ResourceLimits,
    },
    #[serde(rename = "workflow.paused")]
    WorkflowPaused {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "workflow.resumed")]
    WorkflowResumed,
    /// No dispatchable work remains; only `wait` tasks are outstanding.
    #[serde(rename = "workflow.waiting")]
    WorkflowWaiting { task_ids: Vec<TaskId> },
    #[serde(rename = "workflow.cancel_requested")]
    WorkflowCancelRequested {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "workflow.cancelled")]
    WorkflowCancelled {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted { output: BTreeMap<String, Value> },
    #[serde(rename = "workflow.failed")]
    WorkflowFailed { error: String },
    #[serde(rename = "workflow.timed_out")]
    WorkflowTimedOut,
    #[serde(rename = "compensation.started")]
    CompensationStarted { reason: String },
    #[serde(rename = "compensation.completed")]
    CompensationCompleted,
    #[serde(rename = "task.dispatched")]
    TaskDispatched {
        task_id: TaskId,
        node_id: NodeId,
        attempt: u32,
    },
    #[serde(rename = "task.completed")]
    TaskCompleted {
        task_id: TaskId,
        attempt: u32,
        result: Value,
    },
    /// `will_retry` records the retry decision made when the failure was
    /// accepted, so replay never re-evaluates the policy.
    #[serde(rename = "task.failed")]
    TaskFailed {
        task_id: TaskId,
        attempt: u32,
        error: String,
        #[serde(default)]
        timed_out: bool,
        will_retry: bool,
    },
    /// The assignment was given up without a verdict (lease expiry, node
    /// loss). Does not consume retry budget.
    #[serde(rename = "task.released")]
    TaskReleased {
        task_id: TaskId,
        attempt: u32,
        reason: String,
    },
    #[serde(rename = "task.skipped")]
    TaskSkipped { task_id: TaskId, reason: String },
    #[serde(rename = "task.cancelled")]
    TaskCancelled { task_id: TaskId },
}

impl EventKind {
    /// The event's wire name, e.g. `task.failed`.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::WorkflowStarted { .. } => "workflow.started",
            EventKind::WorkflowPaused { .. } => "workflow.paused",
            EventKind::WorkflowResumed => "workflow.resumed",
            EventKind::WorkflowWaiting { .. } => "workflow.waiting",
            EventKind::WorkflowCancelRequested { .. } => "workflow.cancel_requested",
            EventKind::WorkflowCancelled { .. } => "workflow.cancelled",
            EventKind::WorkflowCompleted { .. } => "workflow.completed",
            EventKind::WorkflowFailed { .. } => "workflow.failed",
            EventKind::WorkflowTimedOut => "workflow.timed_out",
            EventKind::CompensationStarted { .. } => "compensation.started",
            EventKind::CompensationCompleted => "compensation.completed",
            EventKind::TaskDispatched { .. } => "task.dispatched",
            EventKind::TaskCompleted { .. } => "task.completed",
            EventKind::TaskFailed { .. } => "task.failed",
            EventKind::TaskReleased { .. } => "task.released",
            EventKind::TaskSkipped { .. } => "task.skipped",
            EventKind::TaskCancelled { .. } => "task.cancelled",
        }
    }

    /// The task this event concerns, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            EventKind::TaskDispatched { task_id, .. }
            | EventKind::TaskCompleted { task_id, .. }
            | EventKind::TaskFailed { task_id, .. }
            | EventKind::TaskReleased { task_id, .. }
            | EventKind::TaskSkipped { task_id, .. }
            | EventKind::TaskCancelled { task_id } => Some(task_id),
            _ => None,
        }
    }
}

/// The event that caused another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Causation {
    pub event_id: EventId,
    /// Position of the cause in the same instance's log, when it lives there.
    pub sequence: Option<u64>,
}

impl Causation {
    /// Caused by an event of the same instance.
    pub fn local(event: &WorkflowEvent) -> Self {
        Self {
            event_id: event.event_id,
            sequence: Some(event.sequence),
        }
    }

    /// Caused by something outside this instance's log.
    pub fn external(event_id: EventId) -> Self {
        Self {
            event_id,
            sequence: None,
        }
    }
}

/// An event ready to be appended. The log assigns its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_id: EventId,
    pub kind: EventKind,
    pub idempotency_key: String,
    pub causation: Option<Causation>,
    pub correlation_id: Option<String>,
    pub timestamp: OffsetDateTime,
}

impl NewEvent {
    pub fn new(kind: EventKind, idempotency_key: impl Into<String>) -> Self {
        Self {
            event_id: EventId::new(),
            kind,
            idempotency_key: idempotency_key.into(),
            causation: None,
            correlation_id: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn caused_by(mut self, causation: Causation) -> Self {
        self.causation = Some(causation);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn at(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Stamp the event with its position in `workflow`'s log.
    pub fn into_event(self, workflow: &WorkflowRef, sequence: u64) -> WorkflowEvent {
        WorkflowEvent {
            event_id: self.event_id,
            workflow_type: workflow.workflow_type().to_owned(),
            instance_id: workflow.instance_id().clone(),
            sequence,
            causation_id: self.causation.map(|c| c.event_id),
            causation_sequence: self.causation.and_then(|c| c.sequence),
            correlation_id: self.correlation_id,
            timestamp: self.timestamp,
            idempotency_key: self.idempotency_key,
            payload: self.kind,
        }
    }
}

/// A recorded fact in an instance's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_id: EventId,
    pub workflow_type: String,
    pub instance_id: InstanceId,
    /// 1-based, contiguous within the instance.
    pub sequence: u64,
    pub causation_id: Option<EventId>,
    /// Sequence of the causing event within this instance's log.
    pub causation_sequence: Option<u64>,
    /// Id of the external request that started the chain.
    pub correlation_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub idempotency_key: String,
    pub payload: EventKind,
}

impl WorkflowEvent {
    pub fn workflow(&self) -> WorkflowRef {
        WorkflowRef::new(self.workflow_type.clone(), self.instance_id.clone())
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// Ancestor event ids of the event at `sequence`, root first.
///
/// Follows `causation_sequence` links through `events`, which must be a
/// contiguous slice of one instance's log. The chain stops at the first
/// cause that is external or outside the slice; an external cause id is
/// still included.
pub fn correlation_chain(events: &[WorkflowEvent], sequence: u64) -> Vec<EventId> {
    let Some(first) = events.first().map(|e| e.sequence) else {
        return Vec::new();
    };
    let lookup = |seq: u64| -> Option<&WorkflowEvent> {
        let index = usize::try_from(seq.checked_sub(first)?).ok()?;
        events.get(index).filter(|e| e.sequence == seq)
    };

    let mut chain = Vec::new();
    let mut current = lookup(sequence);
    while let Some(event) = current {
        match (event.causation_sequence, event.causation_id) {
            (Some(parent), _) if parent < event.sequence => {
                current = lookup(parent);
                match current {
                    Some(cause) => chain.push(cause.event_id),
                    None => {
                        if let Some(id) = event.causation_id {
                            chain.push(id);
                        }
                    }
                }
            }
            (None, Some(external)) => {
                chain.push(external);
                current = None;
            }
            _ => current = None,
        }
    }
    chain.reverse();
    chain
}
