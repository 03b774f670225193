//! In-process store implementation.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use super::{
    AppendOutcome, BeginResult, EventStore, ProjectionStore, SnapshotStore, StoredEvent,
    StoredSnapshot, UnitOfWork, WorkflowFilter, WorkflowInstanceSummary, WorkflowQueryStore,
};
use crate::error::{Error, Result};
use crate::event::{NewEvent, WorkflowEvent};
use crate::workflow::WorkflowRef;

/// In-memory store for tests and single-process deployments.
///
/// Each instance has its own async writer lock, held by the
/// [`MemoryUnitOfWork`] until commit or drop. Committed data lives behind a
/// read/write lock that is only ever held for the duration of a copy, so
/// readers never wait on a writer's unit of work.
///
/// Cloning is cheap; clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    locks: Mutex<HashMap<WorkflowRef, Arc<AsyncMutex<()>>>>,
    data: RwLock<Data>,
    unavailable: AtomicBool,
}

#[derive(Default)]
struct Data {
    streams: HashMap<WorkflowRef, Stream>,
    feed: Vec<StoredEvent>,
    snapshots: HashMap<WorkflowRef, StoredSnapshot>,
    positions: HashMap<String, i64>,
}

struct Stream {
    events: Vec<WorkflowEvent>,
    keys: HashMap<String, u64>,
    created_at: OffsetDateTime,
    terminal_at: Option<OffsetDateTime>,
    tombstoned_at: Option<OffsetDateTime>,
}

impl Stream {
    fn new(now: OffsetDateTime) -> Self {
        Self {
            events: Vec::new(),
            keys: HashMap::new(),
            created_at: now,
            terminal_at: None,
            tombstoned_at: None,
        }
    }

    fn last_sequence(&self) -> u64 {
        self.events.last().map_or(0, |e| e.sequence)
    }

    fn summary(&self, workflow: &WorkflowRef) -> WorkflowInstanceSummary {
        WorkflowInstanceSummary {
            workflow_type: workflow.workflow_type().to_owned(),
            instance_id: workflow.instance_id().clone(),
            created_at: self.created_at,
            event_count: self.events.len() as u64,
            last_event_at: self.events.last().map(|e| e.timestamp),
            terminal_at: self.terminal_at,
            tombstoned_at: self.tombstoned_at,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`Error::StorageUnavailable`] until
    /// switched back, to exercise retry paths.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StorageUnavailable("memory store switched off".into()));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Data>> {
        self.check_available()?;
        self.inner
            .data
            .read()
            .map_err(|_| Error::LockPoisoned("memory store data"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Data>> {
        self.check_available()?;
        self.inner
            .data
            .write()
            .map_err(|_| Error::LockPoisoned("memory store data"))
    }

    fn instance_lock(&self, workflow: &WorkflowRef) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .inner
            .locks
            .lock()
            .map_err(|_| Error::LockPoisoned("memory store locks"))?;
        Ok(locks.entry(workflow.clone()).or_default().clone())
    }

    /// Drop the writer lock of an instance that accepts no more writers.
    /// Writers already queued on it see the terminal stream and back off.
    fn forget_instance_locks<'w>(
        &self,
        workflows: impl IntoIterator<Item = &'w WorkflowRef>,
    ) -> Result<()> {
        let mut locks = self
            .inner
            .locks
            .lock()
            .map_err(|_| Error::LockPoisoned("memory store locks"))?;
        for workflow in workflows {
            locks.remove(workflow);
        }
        Ok(())
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.inner.locks.lock().unwrap().len()
    }

    /// `(terminal, last_sequence)` of the committed stream.
    fn stream_status(&self, workflow: &WorkflowRef) -> Result<(bool, u64)> {
        let data = self.read()?;
        Ok(data
            .streams
            .get(workflow)
            .map_or((false, 0), |s| (s.terminal_at.is_some(), s.last_sequence())))
    }

    /// Remove a committed event without renumbering, leaving a hole.
    #[cfg(test)]
    pub(crate) fn punch_hole(&self, workflow: &WorkflowRef, sequence: u64) {
        let mut data = self.inner.data.write().unwrap();
        if let Some(stream) = data.streams.get_mut(workflow) {
            stream.events.retain(|e| e.sequence != sequence);
        }
    }
}

/// Unit of work over a [`MemoryStore`] instance stream.
pub struct MemoryUnitOfWork<'a> {
    store: &'a MemoryStore,
    workflow: WorkflowRef,
    _guard: OwnedMutexGuard<()>,
    committed_sequence: u64,
    pending: Vec<WorkflowEvent>,
    terminal: bool,
}

impl MemoryUnitOfWork<'_> {
    fn pending_key(&self, key: &str) -> Option<u64> {
        self.pending
            .iter()
            .find(|e| e.idempotency_key == key)
            .map(|e| e.sequence)
    }
}

impl EventStore for MemoryStore {
    type UnitOfWork<'a> = MemoryUnitOfWork<'a>;

    async fn begin<'a>(
        &'a self,
        workflow: &WorkflowRef,
    ) -> Result<BeginResult<MemoryUnitOfWork<'a>>> {
        if self.stream_status(workflow)?.0 {
            return Ok(BeginResult::Terminal);
        }

        let guard = self.instance_lock(workflow)?.lock_owned().await;

        // Another writer may have finished the instance while we waited.
        let (terminal, committed_sequence) = self.stream_status(workflow)?;
        if terminal {
            return Ok(BeginResult::Terminal);
        }

        Ok(BeginResult::Active {
            uow: MemoryUnitOfWork {
                store: self,
                workflow: workflow.clone(),
                _guard: guard,
                committed_sequence,
                pending: Vec::new(),
                terminal: false,
            },
        })
    }

    async fn read_events(
        &self,
        workflow: &WorkflowRef,
        from_sequence: u64,
        to_sequence: Option<u64>,
    ) -> Result<Vec<WorkflowEvent>> {
        let data = self.read()?;
        let Some(stream) = data.streams.get(workflow) else {
            return Ok(Vec::new());
        };
        Ok(stream
            .events
            .iter()
            .filter(|e| e.sequence >= from_sequence)
            .take_while(|e| to_sequence.is_none_or(|to| e.sequence <= to))
            .cloned()
            .collect())
    }

    async fn find_idempotency_key(&self, workflow: &WorkflowRef, key: &str) -> Result<Option<u64>> {
        let data = self.read()?;
        Ok(data
            .streams
            .get(workflow)
            .and_then(|s| s.keys.get(key).copied()))
    }

    async fn fetch_events_since(&self, after: i64, limit: u32) -> Result<Vec<StoredEvent>> {
        let data = self.read()?;
        let start = usize::try_from(after.max(0)).unwrap_or(usize::MAX);
        Ok(data
            .feed
            .iter()
            .skip(start)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

impl UnitOfWork for MemoryUnitOfWork<'_> {
    fn workflow(&self) -> &WorkflowRef {
        &self.workflow
    }

    fn last_sequence(&self) -> u64 {
        self.pending
            .last()
            .map_or(self.committed_sequence, |e| e.sequence)
    }

    async fn load_events(&mut self, from_sequence: u64) -> Result<Vec<WorkflowEvent>> {
        self.store
            .read_events(&self.workflow, from_sequence, None)
            .await
    }

    async fn find_idempotency_key(&mut self, key: &str) -> Result<Option<u64>> {
        if let Some(sequence) = self.pending_key(key) {
            return Ok(Some(sequence));
        }
        self.store.find_idempotency_key(&self.workflow, key).await
    }

    async fn append(&mut self, expected_sequence: u64, event: NewEvent) -> Result<AppendOutcome> {
        if let Some(sequence) = self.find_idempotency_key(&event.idempotency_key).await? {
            return Ok(AppendOutcome::Duplicate { sequence });
        }

        let last = self.last_sequence();
        if expected_sequence != last + 1 {
            return Err(Error::SequenceConflict {
                workflow: self.workflow.to_string(),
                expected: expected_sequence,
                actual: last,
            });
        }

        let event = event.into_event(&self.workflow, expected_sequence);
        self.pending.push(event.clone());
        Ok(AppendOutcome::Appended(event))
    }

    fn mark_terminal(&mut self) {
        self.terminal = true;
    }

    async fn commit(self) -> Result<Vec<WorkflowEvent>> {
        let now = OffsetDateTime::now_utc();
        let mut data = self.store.write()?;
        let Data { streams, feed, .. } = &mut *data;

        if self.pending.is_empty() && !self.terminal {
            return Ok(Vec::new());
        }

        let stream = streams
            .entry(self.workflow.clone())
            .or_insert_with(|| Stream::new(now));

        if stream.last_sequence() != self.committed_sequence {
            return Err(Error::SequenceConflict {
                workflow: self.workflow.to_string(),
                expected: self.committed_sequence + 1,
                actual: stream.last_sequence(),
            });
        }

        for event in &self.pending {
            stream
                .keys
                .insert(event.idempotency_key.clone(), event.sequence);
            stream.events.push(event.clone());
            feed.push(StoredEvent {
                global_sequence: feed.len() as i64 + 1,
                event: event.clone(),
                created_at: now,
            });
        }
        if self.terminal {
            stream.terminal_at = Some(now);
            drop(data);
            self.store.forget_instance_locks([&self.workflow])?;
        }

        debug!(
            workflow = %self.workflow,
            appended = self.pending.len(),
            terminal = self.terminal,
            "Committed unit of work"
        );
        Ok(self.pending)
    }
}

impl SnapshotStore for MemoryStore {
    async fn save_snapshot(&self, snapshot: StoredSnapshot) -> Result<()> {
        let mut data = self.write()?;
        let workflow = WorkflowRef::new(
            snapshot.workflow_type.clone(),
            snapshot.instance_id.clone(),
        );
        match data.snapshots.get(&workflow) {
            Some(existing) if existing.sequence >= snapshot.sequence => {}
            _ => {
                data.snapshots.insert(workflow, snapshot);
            }
        }
        Ok(())
    }

    async fn load_snapshot(&self, workflow: &WorkflowRef) -> Result<Option<StoredSnapshot>> {
        Ok(self.read()?.snapshots.get(workflow).cloned())
    }
}

impl ProjectionStore for MemoryStore {
    async fn load_projection_position(&self, projection_name: &str) -> Result<i64> {
        Ok(self
            .read()?
            .positions
            .get(projection_name)
            .copied()
            .unwrap_or(0))
    }

    async fn store_projection_position(
        &self,
        projection_name: &str,
        global_sequence: i64,
    ) -> Result<()> {
        self.write()?
            .positions
            .insert(projection_name.to_owned(), global_sequence);
        Ok(())
    }
}

#[async_trait]
impl WorkflowQueryStore for MemoryStore {
    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<WorkflowInstanceSummary>> {
        let data = self.read()?;
        let mut summaries: Vec<_> = data
            .streams
            .iter()
            .map(|(workflow, stream)| stream.summary(workflow))
            .filter(|summary| filter.matches(summary))
            .collect();
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.workflow_type.cmp(&b.workflow_type))
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(summaries
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn workflow_summary(
        &self,
        workflow: &WorkflowRef,
    ) -> Result<Option<WorkflowInstanceSummary>> {
        let data = self.read()?;
        Ok(data.streams.get(workflow).map(|s| s.summary(workflow)))
    }

    async fn tombstone_expired(
        &self,
        terminal_before: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<WorkflowRef>> {
        let now = OffsetDateTime::now_utc();
        let mut data = self.write()?;
        let mut expired: Vec<_> = data
            .streams
            .iter_mut()
            .filter(|(_, s)| s.tombstoned_at.is_none())
            .filter(|(_, s)| s.terminal_at.is_some_and(|at| at < terminal_before))
            .collect();
        expired.sort_by_key(|(_, s)| s.terminal_at);

        let tombstoned: Vec<_> = expired
            .into_iter()
            .take(limit as usize)
            .map(|(workflow, stream)| {
                stream.tombstoned_at = Some(now);
                workflow.clone()
            })
            .collect();
        drop(data);
        self.forget_instance_locks(&tombstoned)?;
        Ok(tombstoned)
    }
}
