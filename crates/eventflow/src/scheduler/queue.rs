//! Leased, priority-aged work queue.
//!
//! Entries are claimed with a time-bounded lease: a claimed entry is
//! invisible to other consumers until it is settled or its lease expires. One entry exists per
//! `(workflow, task)` at a time; a retry is a new entry for the next attempt.
//! Handles of removed entries are remembered for a while so late or repeated
//! reports can still be resolved against the log.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::projection::TaskRecord;
use crate::registry::{NodeId, Reservation};
use crate::task::{TaskId, TaskPriority, TaskType};
use crate::workflow::WorkflowRef;

/// How many settled handles are remembered before the oldest are dropped.
pub const SETTLED_CAPACITY: usize = 16_384;

/// Handle of one queued attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(Uuid);

impl TaskHandle {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Starvation avoidance: queued entries gain priority as they wait.
///
/// `effective = weight + min(floor(waited / interval) * increment, max_boost)`
/// where weights are low 0, normal 100, high 200, critical 300. With the
/// defaults a low-priority entry overtakes fresh normal entries after
/// waiting five minutes, and never overtakes fresh critical ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgingPolicy {
    /// Default: 30 seconds.
    pub interval: Duration,
    /// Default: 10.
    pub increment: u32,
    /// Default: 150.
    pub max_boost: u32,
}

impl Default for AgingPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            increment: 10,
            max_boost: 150,
        }
    }
}

impl AgingPolicy {
    pub fn effective_priority(&self, priority: TaskPriority, waited: Duration) -> u32 {
        let steps = if self.interval.is_zero() {
            0
        } else {
            (waited.as_nanos() / self.interval.as_nanos()).min(u128::from(u32::MAX)) as u32
        };
        let boost = steps.saturating_mul(self.increment).min(self.max_boost);
        priority.weight() + boost
    }
}

/// What a node needs to run one attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub handle: TaskHandle,
    pub workflow: WorkflowRef,
    pub task_id: TaskId,
    pub attempt: u32,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub required_capabilities: BTreeSet<String>,
    pub resource_needs: BTreeMap<String, u64>,
    pub parameters: Value,
    pub execution_timeout: Option<Duration>,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    /// Not handed out before this instant (retry backoff, explicit delay).
    #[serde(with = "time::serde::rfc3339")]
    pub not_before: OffsetDateTime,
}

impl QueuedTask {
    /// The next attempt of `record`, eligible after `delay`.
    pub fn next_attempt(
        workflow: &WorkflowRef,
        record: &TaskRecord,
        delay: Duration,
        now: OffsetDateTime,
    ) -> Self {
        let config = &record.config;
        Self {
            handle: TaskHandle::new(),
            workflow: workflow.clone(),
            task_id: config.task_id.clone(),
            attempt: record.attempts + 1,
            task_type: config.task_type,
            priority: config.priority,
            required_capabilities: config.required_capabilities.clone(),
            resource_needs: config.resource_needs.clone(),
            parameters: config.parameters.clone(),
            execution_timeout: config.timeout_policy.execution,
            enqueued_at: now,
            not_before: now + delay,
        }
    }
}

/// An exclusive, time-bounded claim on a queued attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub node_id: NodeId,
    pub leased_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    /// Node capacity held for the attempt, returned when the lease ends.
    pub reservation: Option<Reservation>,
    /// Set once `task.dispatched` is committed for this lease.
    pub dispatched: bool,
}

/// The attempt a handle stood for after its entry left the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledAttempt {
    pub workflow: WorkflowRef,
    pub task_id: TaskId,
    pub attempt: u32,
}

/// Where a handle stands, as seen by a reporting node.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleState {
    /// Dispatched and awaiting the node's report.
    Leased(QueuedTask, Lease),
    /// Handed to a node, dispatch not committed yet.
    Offered(QueuedTask, Lease),
    /// No longer queued.
    Settled(SettledAttempt),
}

/// A task handed to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task: QueuedTask,
    pub node_id: NodeId,
    #[serde(with = "time::serde::rfc3339")]
    pub lease_expires_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
struct Entry {
    task: QueuedTask,
    lease: Option<Lease>,
    /// Push nodes that turned this entry down, and until when they are skipped.
    declined: HashMap<NodeId, OffsetDateTime>,
}

impl Entry {
    fn new(task: QueuedTask, lease: Option<Lease>) -> Self {
        Self {
            task,
            lease,
            declined: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct Entries {
    by_handle: HashMap<TaskHandle, Entry>,
    by_task: HashMap<(WorkflowRef, TaskId), TaskHandle>,
    settled: HashMap<TaskHandle, SettledAttempt>,
    settled_order: VecDeque<TaskHandle>,
}

impl Entries {
    fn remove(&mut self, handle: &TaskHandle) -> Option<Entry> {
        let entry = self.by_handle.remove(handle)?;
        self.by_task
            .remove(&(entry.task.workflow.clone(), entry.task.task_id.clone()));
        self.remember(&entry.task);
        Some(entry)
    }

    fn remember(&mut self, task: &QueuedTask) {
        while self.settled_order.len() >= SETTLED_CAPACITY {
            match self.settled_order.pop_front() {
                Some(oldest) => {
                    self.settled.remove(&oldest);
                }
                None => break,
            }
        }
        self.settled.insert(
            task.handle,
            SettledAttempt {
                workflow: task.workflow.clone(),
                task_id: task.task_id.clone(),
                attempt: task.attempt,
            },
        );
        self.settled_order.push_back(task.handle);
    }
}

/// In-process work queue shared by all consumers.
#[derive(Default)]
pub struct WorkQueue {
    entries: Mutex<Entries>,
    aging: AgingPolicy,
}

impl WorkQueue {
    pub fn new(aging: AgingPolicy) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            aging,
        }
    }

    /// Add an attempt. If the task already has an entry, that entry's handle
    /// is returned and nothing is added.
    pub fn enqueue(&self, task: QueuedTask) -> Result<TaskHandle> {
        let mut entries = self.lock()?;
        let key = (task.workflow.clone(), task.task_id.clone());
        if let Some(existing) = entries.by_task.get(&key) {
            return Ok(*existing);
        }
        let handle = task.handle;
        entries.by_task.insert(key, handle);
        entries.by_handle.insert(handle, Entry::new(task, None));
        Ok(handle)
    }

    /// Lease up to `max` eligible entries to `node_id`.
    ///
    /// Candidates are visited by effective priority, then age. `accept` is
    /// asked about each in turn and may reserve capacity for it; a `None`
    /// skips the entry and leaves it queued.
    pub fn dequeue<F>(
        &self,
        node_id: &NodeId,
        max: usize,
        lease_duration: Duration,
        now: OffsetDateTime,
        mut accept: F,
    ) -> Result<Vec<TaskAssignment>>
    where
        F: FnMut(&QueuedTask) -> Option<Option<Reservation>>,
    {
        let mut entries = self.lock()?;
        let candidates = self.ordered_candidates(&entries, now);

        let mut leased = Vec::new();
        for handle in candidates {
            if leased.len() >= max {
                break;
            }
            let Some(entry) = entries.by_handle.get_mut(&handle) else {
                continue;
            };
            let Some(reservation) = accept(&entry.task) else {
                continue;
            };
            let expires_at = now + entry.task.execution_timeout.unwrap_or(lease_duration);
            entry.lease = Some(Lease {
                node_id: node_id.clone(),
                leased_at: now,
                expires_at,
                reservation,
                dispatched: false,
            });
            leased.push(TaskAssignment {
                task: entry.task.clone(),
                node_id: node_id.clone(),
                lease_expires_at: expires_at,
            });
        }
        Ok(leased)
    }

    /// Unleased entries eligible at `now`, best first.
    pub fn ready(&self, now: OffsetDateTime) -> Result<Vec<QueuedTask>> {
        let entries = self.lock()?;
        Ok(self
            .ordered_candidates(&entries, now)
            .into_iter()
            .filter_map(|handle| entries.by_handle.get(&handle))
            .map(|entry| entry.task.clone())
            .collect())
    }

    /// Lease one specific entry, for the push path.
    pub fn lease(
        &self,
        handle: &TaskHandle,
        node_id: &NodeId,
        lease_duration: Duration,
        reservation: Option<Reservation>,
        now: OffsetDateTime,
    ) -> Result<TaskAssignment> {
        let mut entries = self.lock()?;
        let entry = entries
            .by_handle
            .get_mut(handle)
            .filter(|entry| entry.lease.is_none())
            .ok_or_else(|| Error::UnknownTaskHandle(handle.to_string()))?;
        let expires_at = now + entry.task.execution_timeout.unwrap_or(lease_duration);
        entry.lease = Some(Lease {
            node_id: node_id.clone(),
            leased_at: now,
            expires_at,
            reservation,
            dispatched: false,
        });
        Ok(TaskAssignment {
            task: entry.task.clone(),
            node_id: node_id.clone(),
            lease_expires_at: expires_at,
        })
    }

    /// Put a leased entry back without settling it. Returns the lease.
    pub fn unlease(&self, handle: &TaskHandle) -> Result<Option<Lease>> {
        let mut entries = self.lock()?;
        Ok(entries
            .by_handle
            .get_mut(handle)
            .and_then(|entry| entry.lease.take()))
    }

    /// Take a lease back from a push node that turned the entry down. The
    /// node is not offered this entry again before `until`. A lease whose
    /// dispatch is already committed stays with its node.
    pub fn decline(
        &self,
        handle: &TaskHandle,
        node_id: &NodeId,
        until: OffsetDateTime,
    ) -> Result<Option<Lease>> {
        let mut entries = self.lock()?;
        Ok(entries.by_handle.get_mut(handle).and_then(|entry| {
            if entry.lease.as_ref().is_some_and(|lease| lease.dispatched) {
                return None;
            }
            entry.declined.insert(node_id.clone(), until);
            entry.lease.take()
        }))
    }

    /// Whether `node_id` turned this entry down and is still cooling off.
    pub fn is_declined(&self, handle: &TaskHandle, node_id: &NodeId, now: OffsetDateTime) -> Result<bool> {
        let entries = self.lock()?;
        Ok(entries
            .by_handle
            .get(handle)
            .and_then(|entry| entry.declined.get(node_id))
            .is_some_and(|until| *until > now))
    }

    /// Record that the lease's dispatch is committed.
    pub fn mark_dispatched(&self, handle: &TaskHandle) -> Result<bool> {
        let mut entries = self.lock()?;
        Ok(match entries.by_handle.get_mut(handle).and_then(|entry| entry.lease.as_mut()) {
            Some(lease) => {
                lease.dispatched = true;
                true
            }
            None => false,
        })
    }

    /// Resolve a handle a node reports on.
    ///
    /// Fails with `UnknownTaskHandle` for handles never handed out, queued
    /// but not leased, or settled long enough ago to be forgotten.
    pub fn lookup(&self, handle: &TaskHandle) -> Result<HandleState> {
        let entries = self.lock()?;
        if let Some(entry) = entries.by_handle.get(handle) {
            return match &entry.lease {
                Some(lease) if lease.dispatched => {
                    Ok(HandleState::Leased(entry.task.clone(), lease.clone()))
                }
                Some(lease) => Ok(HandleState::Offered(entry.task.clone(), lease.clone())),
                None => Err(Error::UnknownTaskHandle(handle.to_string())),
            };
        }
        entries
            .settled
            .get(handle)
            .cloned()
            .map(HandleState::Settled)
            .ok_or_else(|| Error::UnknownTaskHandle(handle.to_string()))
    }

    /// Forget the settled handles of `workflow`. Returns how many.
    pub fn forget_settled(&self, workflow: &WorkflowRef) -> Result<usize> {
        let mut entries = self.lock()?;
        let before = entries.settled.len();
        entries
            .settled
            .retain(|_, settled| &settled.workflow != workflow);
        let Entries {
            settled,
            settled_order,
            ..
        } = &mut *entries;
        settled_order.retain(|handle| settled.contains_key(handle));
        Ok(before - settled.len())
    }

    /// Remove an entry, leased or not.
    pub fn remove(&self, handle: &TaskHandle) -> Result<Option<(QueuedTask, Option<Lease>)>> {
        let mut entries = self.lock()?;
        Ok(entries.remove(handle).map(|entry| (entry.task, entry.lease)))
    }

    /// Remove every entry of `workflow`, returning their leases.
    pub fn remove_workflow(&self, workflow: &WorkflowRef) -> Result<Vec<Lease>> {
        let mut entries = self.lock()?;
        let handles: Vec<TaskHandle> = entries
            .by_handle
            .iter()
            .filter(|(_, entry)| &entry.task.workflow == workflow)
            .map(|(handle, _)| *handle)
            .collect();
        Ok(handles
            .iter()
            .filter_map(|handle| entries.remove(handle))
            .filter_map(|entry| entry.lease)
            .collect())
    }

    /// Leased entries whose lease ended at or before `now`.
    pub fn expired(&self, now: OffsetDateTime) -> Result<Vec<(QueuedTask, Lease)>> {
        self.leased_where(|lease| lease.expires_at <= now)
    }

    /// Leased entries held by `node_id`.
    pub fn held_by(&self, node_id: &NodeId) -> Result<Vec<(QueuedTask, Lease)>> {
        self.leased_where(|lease| &lease.node_id == node_id)
    }

    /// Insert an already-leased entry, used when rebuilding after restart.
    pub fn restore(&self, task: QueuedTask, lease: Lease) -> Result<bool> {
        let mut entries = self.lock()?;
        let key = (task.workflow.clone(), task.task_id.clone());
        if entries.by_task.contains_key(&key) {
            return Ok(false);
        }
        let handle = task.handle;
        entries.by_task.insert(key, handle);
        entries.by_handle.insert(handle, Entry::new(task, Some(lease)));
        Ok(true)
    }

    pub fn contains(&self, workflow: &WorkflowRef, task_id: &TaskId) -> Result<bool> {
        Ok(self
            .lock()?
            .by_task
            .contains_key(&(workflow.clone(), task_id.clone())))
    }

    /// Entries of `workflow`, leased or not.
    pub fn count_for(&self, workflow: &WorkflowRef) -> Result<usize> {
        Ok(self
            .lock()?
            .by_handle
            .values()
            .filter(|entry| &entry.task.workflow == workflow)
            .count())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.by_handle.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn leased_where<F>(&self, predicate: F) -> Result<Vec<(QueuedTask, Lease)>>
    where
        F: Fn(&Lease) -> bool,
    {
        let entries = self.lock()?;
        let mut leased: Vec<_> = entries
            .by_handle
            .values()
            .filter_map(|entry| {
                let lease = entry.lease.as_ref().filter(|lease| predicate(lease))?;
                Some((entry.task.clone(), lease.clone()))
            })
            .collect();
        leased.sort_by_key(|(task, _)| task.handle);
        Ok(leased)
    }

    fn ordered_candidates(&self, entries: &Entries, now: OffsetDateTime) -> Vec<TaskHandle> {
        let mut candidates: Vec<(u32, OffsetDateTime, TaskHandle)> = entries
            .by_handle
            .values()
            .filter(|entry| entry.lease.is_none() && entry.task.not_before <= now)
            .map(|entry| {
                let waited = (now - entry.task.enqueued_at)
                    .try_into()
                    .unwrap_or(Duration::ZERO);
                (
                    self.aging.effective_priority(entry.task.priority, waited),
                    entry.task.enqueued_at,
                    entry.task.handle,
                )
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        candidates.into_iter().map(|(_, _, handle)| handle).collect()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>> {
        self.entries
            .lock()
            .map_err(|_| Error::LockPoisoned("work queue"))
    }
}
