//! Storage abstraction for workflow events, snapshots and projection positions.
//!
//! This module provides the [`EventStore`] and [`UnitOfWork`] traits that
//! abstract over different storage backends. Two implementations are provided:
//!
//! - [`MemoryStore`]: in-process storage for tests and single-node deployments
//! - [`PgStore`]: PostgreSQL storage for production (requires `postgres` feature)

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use crate::error::Result;
use crate::event::{NewEvent, WorkflowEvent};
use crate::workflow::{InstanceId, WorkflowRef};

/// Stored event with global ordering metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Position in the store-wide feed, starting at 1.
    pub global_sequence: i64,
    pub event: WorkflowEvent,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Snapshot blob with its watermark: events up to and including `sequence`
/// are folded into `state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub workflow_type: String,
    pub instance_id: InstanceId,
    pub sequence: u64,
    pub state: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Summary of a workflow instance for listing/monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstanceSummary {
    pub workflow_type: String,
    pub instance_id: InstanceId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub event_count: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub terminal_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub tombstoned_at: Option<OffsetDateTime>,
}

impl WorkflowInstanceSummary {
    pub fn workflow(&self) -> WorkflowRef {
        WorkflowRef::new(self.workflow_type.clone(), self.instance_id.clone())
    }
}

/// Filter for [`WorkflowQueryStore::list_workflows`].
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub workflow_type: Option<String>,
    /// Only instances that have not reached a terminal state.
    pub active_only: bool,
    pub include_tombstoned: bool,
}

impl WorkflowFilter {
    /// All live (non-terminal) instances.
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Self::default()
        }
    }

    pub fn of_type(mut self, workflow_type: impl Into<String>) -> Self {
        self.workflow_type = Some(workflow_type.into());
        self
    }

    pub(crate) fn matches(&self, summary: &WorkflowInstanceSummary) -> bool {
        if let Some(workflow_type) = &self.workflow_type {
            if &summary.workflow_type != workflow_type {
                return false;
            }
        }
        if self.active_only && summary.terminal_at.is_some() {
            return false;
        }
        self.include_tombstoned || summary.tombstoned_at.is_none()
    }
}

/// Result of beginning a unit of work.
pub enum BeginResult<U> {
    /// Instance accepts appends. The unit of work holds its writer lock.
    Active {
        /// Unit of work for reading and appending events.
        uow: U,
    },
    /// Instance has reached a terminal state.
    ///
    /// No lock held. The log accepts no further events for it.
    Terminal,
}

/// Outcome of [`UnitOfWork::append`].
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// The event was appended at its new sequence number.
    Appended(WorkflowEvent),
    /// The idempotency key was already present; nothing was written.
    Duplicate {
        /// Sequence of the event that first used the key.
        sequence: u64,
    },
}

impl AppendOutcome {
    /// Sequence number of the appended or pre-existing event.
    pub fn sequence(&self) -> u64 {
        match self {
            AppendOutcome::Appended(event) => event.sequence,
            AppendOutcome::Duplicate { sequence } => *sequence,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate { .. })
    }
}

/// Append-only, per-instance ordered event storage.
///
/// Implementations must provide transactional semantics with per-instance
/// locking. [`EventStore::begin`] acquires an exclusive writer lock on the
/// instance; reads never take it.
///
/// Users typically don't interact with this trait directly; use
/// [`EventLog`](crate::EventLog) and [`StateMachine`](crate::StateMachine).
pub trait EventStore: Send + Sync + Clone + 'static {
    /// The unit of work type returned by this store.
    type UnitOfWork<'a>: UnitOfWork + Send
    where
        Self: 'a;

    /// Begin a unit of work for a workflow instance.
    ///
    /// Returns [`BeginResult::Terminal`] without locking if the instance
    /// has been marked terminal. Otherwise the lock is held until the unit
    /// of work is committed or dropped. Beginning on an instance with no
    /// events creates nothing until the first committed append.
    fn begin<'a>(
        &'a self,
        workflow: &WorkflowRef,
    ) -> impl Future<Output = Result<BeginResult<Self::UnitOfWork<'a>>>> + Send;

    /// Committed events of one instance with `from <= sequence <= to`,
    /// ascending.
    fn read_events(
        &self,
        workflow: &WorkflowRef,
        from_sequence: u64,
        to_sequence: Option<u64>,
    ) -> impl Future<Output = Result<Vec<WorkflowEvent>>> + Send;

    /// Sequence of the committed event carrying `key`, if any.
    fn find_idempotency_key(
        &self,
        workflow: &WorkflowRef,
        key: &str,
    ) -> impl Future<Output = Result<Option<u64>>> + Send;

    /// Fetch events after the provided global sequence (exclusive).
    ///
    /// Returns events ordered by `global_sequence` ascending.
    fn fetch_events_since(
        &self,
        after: i64,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<StoredEvent>>> + Send;
}

/// A transactional unit of work for a single workflow instance.
///
/// All operations are performed while holding the instance's writer lock.
/// Changes are only persisted when [`commit`](Self::commit) is called;
/// dropping the unit of work without committing discards every append.
pub trait UnitOfWork: Send {
    /// The instance this unit of work is bound to.
    fn workflow(&self) -> &WorkflowRef;

    /// Highest sequence number, including appends not yet committed.
    fn last_sequence(&self) -> u64;

    /// Committed events with `sequence >= from_sequence`, ascending.
    fn load_events(
        &mut self,
        from_sequence: u64,
    ) -> impl Future<Output = Result<Vec<WorkflowEvent>>> + Send;

    /// Sequence of the event carrying `key`, including pending appends.
    fn find_idempotency_key(
        &mut self,
        key: &str,
    ) -> impl Future<Output = Result<Option<u64>>> + Send;

    /// Append one event at `expected_sequence`.
    ///
    /// Fails with [`Error::SequenceConflict`](crate::Error::SequenceConflict)
    /// unless `expected_sequence == last_sequence() + 1`. A key that is
    /// already present yields [`AppendOutcome::Duplicate`] and writes nothing.
    fn append(
        &mut self,
        expected_sequence: u64,
        event: NewEvent,
    ) -> impl Future<Output = Result<AppendOutcome>> + Send;

    /// Mark the instance terminal once this unit of work commits.
    fn mark_terminal(&mut self);

    /// Commit, release the lock, and return the events appended.
    fn commit(self) -> impl Future<Output = Result<Vec<WorkflowEvent>>> + Send;
}

/// Snapshot blob storage keyed by `(workflowType, instanceId)`.
pub trait SnapshotStore: Send + Sync + Clone + 'static {
    /// Store a snapshot. Older watermarks never replace newer ones.
    fn save_snapshot(&self, snapshot: StoredSnapshot) -> impl Future<Output = Result<()>> + Send;

    /// Load the latest snapshot of an instance.
    fn load_snapshot(
        &self,
        workflow: &WorkflowRef,
    ) -> impl Future<Output = Result<Option<StoredSnapshot>>> + Send;
}

/// Projection position storage for projection workers.
pub trait ProjectionStore: Send + Sync + Clone + 'static {
    /// Load the last processed global sequence for a projection.
    fn load_projection_position(
        &self,
        projection_name: &str,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Persist the last processed global sequence for a projection.
    fn store_projection_position(
        &self,
        projection_name: &str,
        global_sequence: i64,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Query-only store operations for inspecting and retiring instances.
#[async_trait]
pub trait WorkflowQueryStore: Send + Sync + Clone + 'static {
    /// List workflow instances ordered by creation time.
    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<WorkflowInstanceSummary>>;

    /// Summary of one instance, if it has any events.
    async fn workflow_summary(
        &self,
        workflow: &WorkflowRef,
    ) -> Result<Option<WorkflowInstanceSummary>>;

    /// Tombstone terminal instances that reached their terminal state before
    /// `terminal_before`. Events are kept. Returns the instances tombstoned.
    async fn tombstone_expired(
        &self,
        terminal_before: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<WorkflowRef>>;
}

/// Everything the engine needs from a backend.
pub trait Store: EventStore + SnapshotStore + ProjectionStore + WorkflowQueryStore {}

impl<T> Store for T where T: EventStore + SnapshotStore + ProjectionStore + WorkflowQueryStore {}
