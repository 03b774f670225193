//! Commands accepted by the state machine.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::projection::WorkflowSnapshot;
use crate::registry::NodeId;
use crate::task::TaskId;
use crate::workflow::WorkflowDefinition;

/// A request to move an instance forward.
///
/// Each command maps to at most one root event; follow-up events the root
/// makes necessary are appended in the same unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start {
        definition: WorkflowDefinition,
        input: BTreeMap<String, Value>,
        correlation_id: Option<String>,
    },
    Pause {
        reason: Option<String>,
    },
    Resume,
    Cancel {
        reason: Option<String>,
    },
    DispatchTask {
        task_id: TaskId,
        node_id: NodeId,
        attempt: u32,
    },
    CompleteTask {
        task_id: TaskId,
        attempt: u32,
        result: Value,
    },
    FailTask {
        task_id: TaskId,
        attempt: u32,
        error: String,
        /// `false` for errors the node knows retrying cannot fix.
        retryable: bool,
        timed_out: bool,
    },
    ReleaseTask {
        task_id: TaskId,
        attempt: u32,
        reason: String,
    },
    SignalTask {
        task_id: TaskId,
        payload: Value,
    },
    TimeOut,
}

impl Command {
    /// Deterministic idempotency key for this command against `snapshot`.
    ///
    /// Redelivering the same command yields the same key, so the second
    /// delivery resolves to the event the first one produced. Pause and
    /// resume may legitimately repeat over an instance's life and are keyed
    /// by the sequence they were decided at.
    pub fn idempotency_key(&self, snapshot: &WorkflowSnapshot) -> String {
        match self {
            Command::Start { .. } => "workflow.started".to_owned(),
            Command::Pause { .. } => format!("workflow.paused@{}", snapshot.sequence),
            Command::Resume => format!("workflow.resumed@{}", snapshot.sequence),
            Command::Cancel { .. } => "workflow.cancel_requested".to_owned(),
            Command::DispatchTask {
                task_id, attempt, ..
            } => format!("task.dispatched:{task_id}:{attempt}"),
            Command::CompleteTask {
                task_id, attempt, ..
            } => format!("task.completed:{task_id}:{attempt}"),
            Command::FailTask {
                task_id, attempt, ..
            } => format!("task.failed:{task_id}:{attempt}"),
            Command::ReleaseTask {
                task_id, attempt, ..
            } => format!("task.released:{task_id}:{attempt}"),
            Command::SignalTask { task_id, .. } => format!("task.signalled:{task_id}"),
            Command::TimeOut => "workflow.timed_out".to_owned(),
        }
    }

    /// Short verb for logs and [`Error::InvalidStateTransition`](crate::Error::InvalidStateTransition).
    pub fn action(&self) -> &'static str {
        match self {
            Command::Start { .. } => "start",
            Command::Pause { .. } => "pause",
            Command::Resume => "resume",
            Command::Cancel { .. } => "cancel",
            Command::DispatchTask { .. } => "dispatch task of",
            Command::CompleteTask { .. } => "complete task of",
            Command::FailTask { .. } => "fail task of",
            Command::ReleaseTask { .. } => "release task of",
            Command::SignalTask { .. } => "signal task of",
            Command::TimeOut => "time out",
        }
    }

    /// Commands issued by callers, as opposed to nodes and maintenance.
    ///
    /// Caller commands against an instance in the wrong state are errors;
    /// the rest are stale deliveries and are discarded.
    pub fn is_caller_command(&self) -> bool {
        matches!(
            self,
            Command::Start { .. }
                | Command::Pause { .. }
                | Command::Resume
                | Command::Cancel { .. }
                | Command::SignalTask { .. }
        )
    }

    /// The task this command concerns, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Command::DispatchTask { task_id, .. }
            | Command::CompleteTask { task_id, .. }
            | Command::FailTask { task_id, .. }
            | Command::ReleaseTask { task_id, .. }
            | Command::SignalTask { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}
