//! The per-instance event log.
//!
//! [`EventLog`] wraps an [`EventStore`] with the guarantees the rest of the
//! engine relies on: idempotent appends, contiguous range reads with gap
//! detection, and snapshot watermarks that never run ahead of the log.

use serde::{Serialize, de::DeserializeOwned};
use time::OffsetDateTime;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::event::{EventId, NewEvent, WorkflowEvent, correlation_chain};
use crate::store::{
    AppendOutcome, BeginResult, EventStore, SnapshotStore, StoredSnapshot, UnitOfWork,
};
use crate::workflow::WorkflowRef;

/// Event log over a store backend.
///
/// Cloning is cheap when the store is.
#[derive(Debug, Clone)]
pub struct EventLog<S> {
    store: S,
}

impl<S> EventLog<S>
where
    S: EventStore + SnapshotStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Begin a unit of work holding the instance's writer lock.
    pub async fn begin(&self, workflow: &WorkflowRef) -> Result<BeginResult<S::UnitOfWork<'_>>> {
        self.store.begin(workflow).await
    }

    /// Append a single event in its own unit of work.
    ///
    /// A duplicate idempotency key is a successful no-op returning the
    /// existing sequence number. Appending to a terminal instance fails.
    pub async fn append(&self, workflow: &WorkflowRef, event: NewEvent) -> Result<AppendOutcome> {
        if let Some(sequence) = self
            .store
            .find_idempotency_key(workflow, &event.idempotency_key)
            .await?
        {
            debug!(workflow = %workflow, sequence, key = %event.idempotency_key, "Duplicate append ignored");
            return Ok(AppendOutcome::Duplicate { sequence });
        }

        let mut uow = match self.store.begin(workflow).await? {
            BeginResult::Active { uow } => uow,
            BeginResult::Terminal => {
                warn!(workflow = %workflow, event_type = event.kind.event_type(), "Append to terminal instance rejected");
                return Err(Error::Validation(format!(
                    "workflow {workflow} is terminal and accepts no events"
                )));
            }
        };

        let expected = uow.last_sequence() + 1;
        let outcome = uow.append(expected, event).await?;
        uow.commit().await?;
        Ok(outcome)
    }

    /// Events with `from_sequence <= sequence <= to_sequence`, ascending.
    ///
    /// Fails with [`Error::SequenceGap`] if the stored range is not
    /// contiguous. A `from_sequence` of 0 is treated as 1.
    pub async fn read(
        &self,
        workflow: &WorkflowRef,
        from_sequence: u64,
        to_sequence: Option<u64>,
    ) -> Result<Vec<WorkflowEvent>> {
        let from = from_sequence.max(1);
        if to_sequence.is_some_and(|to| to < from) {
            return Ok(Vec::new());
        }
        let events = self.store.read_events(workflow, from, to_sequence).await?;
        ensure_contiguous(workflow, &events, from)?;
        Ok(events)
    }

    /// The full history of an instance.
    pub async fn history(&self, workflow: &WorkflowRef) -> Result<Vec<WorkflowEvent>> {
        self.read(workflow, 1, None).await
    }

    /// Persist `state` as the snapshot of `workflow` at watermark `sequence`.
    ///
    /// The watermark must not exceed the last committed sequence.
    pub async fn create_snapshot<T: Serialize>(
        &self,
        workflow: &WorkflowRef,
        sequence: u64,
        state: &T,
    ) -> Result<()> {
        let committed = self.store.read_events(workflow, sequence, Some(sequence)).await?;
        if sequence > 0 && committed.is_empty() {
            return Err(Error::Validation(format!(
                "snapshot watermark {sequence} is ahead of the log for {workflow}"
            )));
        }

        self.store
            .save_snapshot(StoredSnapshot {
                workflow_type: workflow.workflow_type().to_owned(),
                instance_id: workflow.instance_id().clone(),
                sequence,
                state: serde_json::to_value(state)?,
                created_at: OffsetDateTime::now_utc(),
            })
            .await?;
        debug!(workflow = %workflow, sequence, "Snapshot stored");
        Ok(())
    }

    /// Load the latest snapshot and its watermark.
    ///
    /// A snapshot that no longer decodes is ignored with a warning; it is a
    /// cache and replay from the log is always possible.
    pub async fn load_snapshot<T: DeserializeOwned>(
        &self,
        workflow: &WorkflowRef,
    ) -> Result<Option<(u64, T)>> {
        let Some(stored) = self.store.load_snapshot(workflow).await? else {
            return Ok(None);
        };
        match serde_json::from_value(stored.state) {
            Ok(state) => Ok(Some((stored.sequence, state))),
            Err(e) => {
                warn!(workflow = %workflow, sequence = stored.sequence, error = %e, "Discarding undecodable snapshot");
                Ok(None)
            }
        }
    }

    /// Ancestor event ids of the event at `sequence`, root first.
    pub async fn correlation_chain(
        &self,
        workflow: &WorkflowRef,
        sequence: u64,
    ) -> Result<Vec<EventId>> {
        let events = self.read(workflow, 1, Some(sequence)).await?;
        Ok(correlation_chain(&events, sequence))
    }

    /// Highest committed sequence, 0 for an unknown instance.
    pub async fn last_sequence(&self, workflow: &WorkflowRef) -> Result<u64> {
        Ok(self
            .store
            .read_events(workflow, 1, None)
            .await?
            .last()
            .map_or(0, |e| e.sequence))
    }
}

/// Check that `events` are exactly `first, first + 1, ...` for `workflow`.
pub(crate) fn ensure_contiguous(
    workflow: &WorkflowRef,
    events: &[WorkflowEvent],
    first: u64,
) -> Result<()> {
    let mut expected = first;
    for event in events {
        if event.sequence != expected {
            error!(
                workflow = %workflow,
                expected,
                found = event.sequence,
                "Sequence gap detected; replay halted for instance"
            );
            return Err(Error::SequenceGap {
                workflow: workflow.to_string(),
                expected,
                found: event.sequence,
            });
        }
        expected += 1;
    }
    Ok(())
}
