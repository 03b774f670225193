//! Error types for eventflow.

use thiserror::Error;

use crate::workflow::WorkflowState;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`enum@Error`], used to decide how callers react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input from the caller. Returned unchanged, never retried.
    Validation,
    /// Storage or transport hiccup. Retried with backoff by the layer that hit it.
    TransientInfrastructure,
    /// A node reported a task failure.
    TaskExecution,
    /// The command is not allowed in the instance's current state.
    InvalidStateTransition,
    /// The referenced instance, task, node, or handle does not exist.
    NotFound,
    /// Corruption or a broken invariant. The instance must not be touched further.
    Fatal,
}

/// Errors that can occur in eventflow operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A definition, command, or request failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The task graph of a definition contains a cycle.
    #[error("task dependency cycle detected involving task {task_id}")]
    DependencyCycle {
        /// A task that participates in the cycle.
        task_id: String,
    },

    /// Workflow type was not registered with the orchestrator.
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Workflow type was registered more than once.
    #[error("duplicate workflow type registration: {0}")]
    DuplicateWorkflowType(String),

    /// Projection name was registered more than once.
    #[error("duplicate projection registration: {0}")]
    DuplicateProjection(String),

    /// No projection with this name is registered.
    #[error("unknown projection: {0}")]
    UnknownProjection(String),

    /// The command is not permitted from the instance's current state.
    #[error("cannot {action} workflow {workflow} in state {state}")]
    InvalidStateTransition {
        /// `type:id` of the instance.
        workflow: String,
        /// Current state of the instance.
        state: WorkflowState,
        /// The attempted action, e.g. `pause`.
        action: &'static str,
    },

    /// No events exist for the instance.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// The instance has been tombstoned and its history is no longer served.
    #[error("workflow has been tombstoned: {0}")]
    WorkflowTombstoned(String),

    /// The task id is not part of the instance's definition.
    #[error("unknown task {task_id} in workflow {workflow}")]
    UnknownTask {
        /// `type:id` of the instance.
        workflow: String,
        /// The requested task id.
        task_id: String,
    },

    /// The scheduler handle is unknown or its lease was already settled.
    #[error("unknown task handle: {0}")]
    UnknownTaskHandle(String),

    /// The node is not registered.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// Capacity reservation kept losing compare-and-swap races.
    #[error("capacity reservation on node {node_id} failed after {attempts} attempts")]
    ReservationConflict {
        /// Node whose counters were contended.
        node_id: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// A node reported that a task failed.
    #[error("task {task_id} failed: {message}")]
    TaskExecution {
        /// The failed task.
        task_id: String,
        /// The node-reported error.
        message: String,
    },

    /// An append raced with another writer and lost.
    #[error("sequence conflict for {workflow}: expected {expected}, log is at {actual}")]
    SequenceConflict {
        /// `type:id` of the instance.
        workflow: String,
        /// Sequence the writer expected to assign.
        expected: u64,
        /// Last sequence actually present in the log.
        actual: u64,
    },

    /// A stored event stream is not contiguous.
    #[error("sequence gap in {workflow}: expected {expected}, found {found}")]
    SequenceGap {
        /// `type:id` of the instance.
        workflow: String,
        /// The next sequence the fold expected.
        expected: u64,
        /// The sequence actually encountered.
        found: u64,
    },

    /// A stored event could not be decoded.
    #[error("failed to decode event at sequence {sequence} for {workflow}: {source}")]
    EventDecoding {
        /// `type:id` of the instance.
        workflow: String,
        /// The event's sequence number.
        sequence: u64,
        /// The underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to serialize or deserialize stored data.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing store could not be reached.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The message transport could not be reached.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// An in-process lock was poisoned by a panicking holder.
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// PostgreSQL storage error.
    ///
    /// Preserves the full `sqlx::Error` for matching on specific database
    /// error conditions (connection timeout, constraint violation, etc.).
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_)
            | Error::DependencyCycle { .. }
            | Error::UnknownWorkflowType(_)
            | Error::DuplicateWorkflowType(_)
            | Error::DuplicateProjection(_) => ErrorKind::Validation,
            Error::InvalidStateTransition { .. } | Error::WorkflowTombstoned(_) => {
                ErrorKind::InvalidStateTransition
            }
            Error::WorkflowNotFound(_)
            | Error::UnknownTask { .. }
            | Error::UnknownTaskHandle(_)
            | Error::UnknownNode(_)
            | Error::UnknownProjection(_) => ErrorKind::NotFound,
            Error::TaskExecution { .. } => ErrorKind::TaskExecution,
            Error::ReservationConflict { .. }
            | Error::SequenceConflict { .. }
            | Error::StorageUnavailable(_)
            | Error::TransportUnavailable(_) => ErrorKind::TransientInfrastructure,
            Error::SequenceGap { .. }
            | Error::EventDecoding { .. }
            | Error::Serialization(_)
            | Error::LockPoisoned(_) => ErrorKind::Fatal,
            #[cfg(feature = "postgres")]
            Error::Postgres(_) => ErrorKind::TransientInfrastructure,
        }
    }

    /// Whether the failing operation may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientInfrastructure
    }

    /// Whether this error indicates corruption.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    pub(crate) fn invalid_transition(
        workflow: impl ToString,
        state: WorkflowState,
        action: &'static str,
    ) -> Self {
        Error::InvalidStateTransition {
            workflow: workflow.to_string(),
            state,
            action,
        }
    }

    pub(crate) fn event_decoding(
        workflow: impl ToString,
        sequence: u64,
        source: serde_json::Error,
    ) -> Self {
        Error::EventDecoding {
            workflow: workflow.to_string(),
            sequence,
            source,
        }
    }
}
