//! Task scheduling.
//!
//! The [`TaskScheduler`] turns workflow snapshots into queued task attempts,
//! hands them to nodes under a lease, and turns node reports back into
//! state machine commands. It never changes task state itself: every
//! dispatch, result, failure and release is an event appended by the
//! [`StateMachine`].
//!
//! # Delivery
//!
//! Nodes either poll ([`TaskScheduler::dequeue`]) or, if they registered a
//! [`NodeClient`](crate::registry::NodeClient), are offered work
//! ([`TaskScheduler::offer_pending`]). Both paths reserve node capacity
//! before dispatching and give it back when the lease ends. A pushed task is
//! only dispatched once its node accepts it; a node that turns a task down
//! is not offered that task again until `offer_cooldown` has passed.
//!
//! Reports are idempotent: a report for an attempt that was already settled
//! is resolved against the log and changes nothing.

mod queue;
mod retry;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

pub use queue::{
    AgingPolicy, HandleState, Lease, QueuedTask, SETTLED_CAPACITY, SettledAttempt, TaskAssignment,
    TaskHandle, WorkQueue,
};
pub use retry::{RetryPolicy, retry_transient};

use crate::error::{Error, Result};
use crate::machine::{Command, StateMachine, Transition, TransitionOutcome};
use crate::projection::WorkflowSnapshot;
use crate::registry::{NodeId, NodeRegistry};
use crate::store::{EventStore, SnapshotStore};
use crate::task::{TaskId, TaskStatus};
use crate::workflow::WorkflowRef;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Lease granted to a node for tasks without an execution timeout.
    /// Default: 5 minutes.
    pub lease_duration: Duration,
    /// Priority aging for queued tasks.
    pub aging: AgingPolicy,
    /// How long a pushed offer may go unanswered. Default: 5 seconds.
    pub offer_timeout: Duration,
    /// How long a push node that turned a task down is skipped for that
    /// task. Default: 30 seconds.
    pub offer_cooldown: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(300),
            aging: AgingPolicy::default(),
            offer_timeout: Duration::from_secs(5),
            offer_cooldown: Duration::from_secs(30),
        }
    }
}

/// Error reported by a node for a task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    /// `false` if retrying cannot help; the task fails without using its
    /// remaining retry budget.
    pub retryable: bool,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// What a node reports for a leased task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        result: Value,
    },
    Failed {
        error: TaskError,
        /// The node's own retry count, for diagnostics only. Retry budget is
        /// tracked from the log.
        #[serde(default)]
        retry_count: u32,
    },
    /// The node gives the task back without running it.
    Released {
        reason: String,
    },
}

/// Bridges the work queue, the node registry and the state machine.
pub struct TaskScheduler<S> {
    machine: Arc<StateMachine<S>>,
    registry: Arc<NodeRegistry>,
    queue: WorkQueue,
    config: SchedulerConfig,
}

impl<S> TaskScheduler<S>
where
    S: EventStore + SnapshotStore,
{
    pub fn new(
        machine: Arc<StateMachine<S>>,
        registry: Arc<NodeRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let queue = WorkQueue::new(config.aging.clone());
        Self {
            machine,
            registry,
            queue,
            config,
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queue an attempt, eligible after `delay`. Returns the existing handle
    /// if the task is already queued.
    pub fn enqueue(&self, mut task: QueuedTask, delay: Duration) -> Result<TaskHandle> {
        task.not_before = task.enqueued_at + delay;
        self.queue.enqueue(task)
    }

    /// Queue every dispatchable task of `snapshot` that is not queued yet.
    ///
    /// Retrying tasks become eligible after their jittered backoff, counted
    /// from the failure. The instance's `max_concurrent_tasks` bounds queued
    /// plus leased entries. Returns the number of entries added.
    pub fn schedule_ready(&self, snapshot: &WorkflowSnapshot, now: OffsetDateTime) -> Result<usize> {
        if !snapshot.state.is_dispatching() || snapshot.cancel_requested {
            return Ok(0);
        }
        let workflow = snapshot.workflow();
        let limit = snapshot
            .resource_limits
            .max_concurrent_tasks
            .map(|limit| limit as usize);
        let mut scheduled = self.queue.count_for(&workflow)?;
        let mut added = 0;

        for record in snapshot.dispatchable_tasks() {
            if limit.is_some_and(|limit| scheduled >= limit) {
                debug!(workflow = %workflow, scheduled, "Concurrency limit reached");
                break;
            }
            if self.queue.contains(&workflow, record.task_id())? {
                continue;
            }
            let delay = match record.status {
                TaskStatus::Retrying => {
                    let backoff = record.config.retry_policy.jittered_backoff(record.failures);
                    record
                        .eligible_at(backoff)
                        .and_then(|at| Duration::try_from(at - now).ok())
                        .unwrap_or(Duration::ZERO)
                }
                _ => Duration::ZERO,
            };
            let handle = self
                .queue
                .enqueue(QueuedTask::next_attempt(&workflow, record, delay, now))?;
            debug!(
                workflow = %workflow,
                task_id = %record.task_id(),
                attempt = record.attempts + 1,
                handle = %handle,
                delay_ms = delay.as_millis() as u64,
                "Task queued"
            );
            scheduled += 1;
            added += 1;
        }
        Ok(added)
    }

    /// Lease up to `max_tasks` tasks to a polling node and dispatch them.
    ///
    /// Only tasks the node has the capabilities and spare capacity for are
    /// considered, best effective priority first.
    pub async fn dequeue(
        &self,
        node_id: &NodeId,
        max_tasks: usize,
        now: OffsetDateTime,
    ) -> Result<Vec<TaskAssignment>> {
        if self.registry.get(node_id)?.is_none() {
            return Err(Error::UnknownNode(node_id.to_string()));
        }
        if !self.registry.is_available(node_id)? {
            return Ok(Vec::new());
        }

        let leased = self
            .queue
            .dequeue(node_id, max_tasks, self.config.lease_duration, now, |task| {
                match self.registry.reserve(
                    node_id,
                    &task.required_capabilities,
                    &task.resource_needs,
                ) {
                    Ok(Some(reservation)) => Some(Some(reservation)),
                    Ok(None) => None,
                    Err(e) => {
                        debug!(node_id = %node_id, handle = %task.handle, error = %e, "Reservation failed");
                        None
                    }
                }
            })?;

        let mut dispatched = Vec::with_capacity(leased.len());
        for assignment in leased {
            match self.dispatch(&assignment, now).await {
                Ok(true) => {
                    self.queue.mark_dispatched(&assignment.task.handle)?;
                    dispatched.push(assignment);
                }
                Ok(false) => {}
                Err(e) => self.abandon(&assignment, &e)?,
            }
        }
        Ok(dispatched)
    }

    /// Offer ready tasks to push-capable nodes.
    ///
    /// For each task the best-ranked push node with room is reserved and
    /// offered the task; the dispatch is recorded once the node accepts. If
    /// the node rejects the offer, fails, or does not answer within
    /// `offer_timeout`, the reservation is rolled back, nothing is written
    /// to the log, and the node is skipped for that task until
    /// `offer_cooldown` has passed. Returns the number of accepted offers.
    pub async fn offer_pending(&self, now: OffsetDateTime) -> Result<usize> {
        let mut accepted = 0;
        for task in self.queue.ready(now)? {
            let candidates = self
                .registry
                .find_capable_nodes(&task.required_capabilities, &task.resource_needs)?;

            let mut reserved = None;
            for candidate in candidates.into_iter().filter(|c| c.push) {
                if self.queue.is_declined(&task.handle, &candidate.node_id, now)? {
                    continue;
                }
                match self.registry.reserve(
                    &candidate.node_id,
                    &task.required_capabilities,
                    &task.resource_needs,
                ) {
                    Ok(Some(reservation)) => {
                        reserved = Some((candidate.node_id, reservation));
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(node_id = %candidate.node_id, error = %e, "Reservation failed");
                    }
                }
            }
            let Some((node_id, reservation)) = reserved else {
                continue;
            };

            let assignment = match self.queue.lease(
                &task.handle,
                &node_id,
                self.config.lease_duration,
                Some(reservation.clone()),
                now,
            ) {
                Ok(assignment) => assignment,
                Err(Error::UnknownTaskHandle(_)) => {
                    // Taken by a polling node in the meantime.
                    self.registry.release(&reservation)?;
                    continue;
                }
                Err(e) => {
                    self.registry.release(&reservation)?;
                    return Err(e);
                }
            };

            if !self.offer(&assignment).await? {
                self.decline(&assignment, now)?;
                continue;
            }
            match self.dispatch(&assignment, now).await {
                Ok(true) => {
                    self.queue.mark_dispatched(&task.handle)?;
                    accepted += 1;
                }
                Ok(false) => {}
                // The node holds the task now; lease expiry settles the entry.
                Err(e) => log_command_error(&task.workflow, "dispatch task", &e),
            }
        }
        Ok(accepted)
    }

    /// Apply a node's report for a leased task.
    pub async fn report(
        &self,
        handle: &TaskHandle,
        outcome: TaskOutcome,
        now: OffsetDateTime,
    ) -> Result<Transition> {
        match outcome {
            TaskOutcome::Completed { result } => self.complete(handle, result, now).await,
            TaskOutcome::Failed { error, retry_count } => {
                self.fail(handle, error, retry_count, now).await
            }
            TaskOutcome::Released { reason } => self.release(handle, reason, now).await,
        }
    }

    /// Record a successful attempt.
    pub async fn complete(
        &self,
        handle: &TaskHandle,
        result: Value,
        now: OffsetDateTime,
    ) -> Result<Transition> {
        self.apply_report(handle, Some(true), now, |task_id, attempt| {
            Command::CompleteTask {
                task_id,
                attempt,
                result,
            }
        })
        .await
    }

    /// Record a failed attempt.
    pub async fn fail(
        &self,
        handle: &TaskHandle,
        error: TaskError,
        retry_count: u32,
        now: OffsetDateTime,
    ) -> Result<Transition> {
        self.apply_report(handle, Some(false), now, |task_id, attempt| {
            debug!(
                task_id = %task_id,
                attempt,
                node_retry_count = retry_count,
                error = %error.message,
                "Task failure reported"
            );
            Command::FailTask {
                task_id,
                attempt,
                error: error.message,
                retryable: error.retryable,
                timed_out: false,
            }
        })
        .await
    }

    /// Give a leased task back without consuming retry budget.
    pub async fn release(
        &self,
        handle: &TaskHandle,
        reason: impl Into<String>,
        now: OffsetDateTime,
    ) -> Result<Transition> {
        let reason = reason.into();
        self.apply_report(handle, None, now, |task_id, attempt| Command::ReleaseTask {
            task_id,
            attempt,
            reason,
        })
        .await
    }

    /// Settle leases that ran out.
    ///
    /// A task with an execution timeout fails with `timed_out`; any other
    /// task is released. Entries whose command fails stay leased and are
    /// retried on the next sweep. Returns the number settled.
    pub async fn expire_leases(&self, now: OffsetDateTime) -> Result<usize> {
        let mut settled = 0;
        for (task, lease) in self.queue.expired(now)? {
            let timed_out = task.execution_timeout.is_some();
            let command = if timed_out {
                Command::FailTask {
                    task_id: task.task_id.clone(),
                    attempt: task.attempt,
                    error: "execution timed out".to_owned(),
                    retryable: true,
                    timed_out: true,
                }
            } else {
                Command::ReleaseTask {
                    task_id: task.task_id.clone(),
                    attempt: task.attempt,
                    reason: "lease expired".to_owned(),
                }
            };
            warn!(
                workflow = %task.workflow,
                task_id = %task.task_id,
                attempt = task.attempt,
                node_id = %lease.node_id,
                timed_out,
                "Task lease expired"
            );
            match self.machine.execute(&task.workflow, command).await {
                Ok(transition) => {
                    if timed_out {
                        self.registry.record_outcome(&lease.node_id, false)?;
                    }
                    self.settle(&task.handle, &transition, now)?;
                    settled += 1;
                }
                Err(e) => log_command_error(&task.workflow, "expire lease", &e),
            }
        }
        Ok(settled)
    }

    /// Release every task leased to `node_id`, for unreachable or departed
    /// nodes. Returns the number released.
    pub async fn release_node(&self, node_id: &NodeId, now: OffsetDateTime) -> Result<usize> {
        let mut released = 0;
        for (task, lease) in self.queue.held_by(node_id)? {
            if !lease.dispatched {
                if let Some(reservation) = self.queue.unlease(&task.handle)?.and_then(|l| l.reservation) {
                    self.registry.release(&reservation)?;
                }
                continue;
            }
            match self
                .release(&task.handle, format!("node {node_id} unreachable"), now)
                .await
            {
                Ok(_) => released += 1,
                Err(e) => log_command_error(&task.workflow, "release task", &e),
            }
        }
        if released > 0 {
            info!(node_id = %node_id, released, "Tasks reassigned from node");
        }
        Ok(released)
    }

    /// Rebuild queue entries for an instance after a restart.
    ///
    /// In-flight attempts get their lease back, counted from dispatch, so
    /// they are released or timed out if their node never reports. Ready
    /// tasks are queued as usual.
    pub fn restore(&self, snapshot: &WorkflowSnapshot, now: OffsetDateTime) -> Result<usize> {
        if snapshot.is_terminal() {
            return Ok(0);
        }
        let workflow = snapshot.workflow();
        let mut restored = 0;
        for record in snapshot.in_flight() {
            let (Some(node_id), Some(dispatched_at)) = (&record.node_id, record.dispatched_at)
            else {
                continue;
            };
            let mut task = QueuedTask::next_attempt(&workflow, record, Duration::ZERO, dispatched_at);
            task.attempt = record.attempts;
            let reservation = if self.registry.is_available(node_id)? {
                self.registry
                    .reserve(node_id, &task.required_capabilities, &task.resource_needs)
                    .unwrap_or_default()
            } else {
                None
            };
            let lease = Lease {
                node_id: node_id.clone(),
                leased_at: dispatched_at,
                expires_at: dispatched_at
                    + task.execution_timeout.unwrap_or(self.config.lease_duration),
                reservation: reservation.clone(),
                dispatched: true,
            };
            if self.queue.restore(task, lease)? {
                restored += 1;
            } else if let Some(reservation) = reservation {
                self.registry.release(&reservation)?;
            }
        }
        Ok(restored + self.schedule_ready(snapshot, now)?)
    }

    /// Forget the settled handles of a tombstoned instance; reports for
    /// them fail with `UnknownTaskHandle` from then on.
    pub fn forget_settled(&self, workflow: &WorkflowRef) -> Result<usize> {
        self.queue.forget_settled(workflow)
    }

    /// Drop every entry of an instance and return their reservations.
    pub fn forget_workflow(&self, workflow: &WorkflowRef) -> Result<usize> {
        let leases = self.queue.remove_workflow(workflow)?;
        for reservation in leases.iter().filter_map(|lease| lease.reservation.as_ref()) {
            self.registry.release(reservation)?;
        }
        Ok(leases.len())
    }

    /// Bring the queue in line with a snapshot produced outside the
    /// scheduler, e.g. by a caller command.
    pub fn after_transition(&self, snapshot: &WorkflowSnapshot, now: OffsetDateTime) -> Result<usize> {
        if snapshot.is_terminal() {
            self.forget_workflow(&snapshot.workflow())?;
            return Ok(0);
        }
        self.schedule_ready(snapshot, now)
    }

    /// Emit the dispatch event for a leased assignment.
    ///
    /// `Ok(false)` if the machine no longer wants this attempt; the entry is
    /// then removed and the instance rescheduled. Dispatching an attempt
    /// twice is harmless: the second call finds the first one's event.
    async fn dispatch(&self, assignment: &TaskAssignment, now: OffsetDateTime) -> Result<bool> {
        let task = &assignment.task;
        let transition = self
            .machine
            .execute(
                &task.workflow,
                Command::DispatchTask {
                    task_id: task.task_id.clone(),
                    node_id: assignment.node_id.clone(),
                    attempt: task.attempt,
                },
            )
            .await?;
        match &transition.outcome {
            TransitionOutcome::Applied { .. } => {
                info!(
                    workflow = %task.workflow,
                    task_id = %task.task_id,
                    attempt = task.attempt,
                    node_id = %assignment.node_id,
                    "Task dispatched"
                );
                Ok(true)
            }
            // Recorded already, by a report that overtook its offer.
            TransitionOutcome::Duplicate { .. } => Ok(true),
            TransitionOutcome::Discarded { .. } => {
                self.settle(&task.handle, &transition, now)?;
                Ok(false)
            }
        }
    }

    /// Run a node report as a command on the attempt its handle stands for.
    ///
    /// Reports on settled handles go through the machine too, which
    /// resolves them as duplicates or stale attempts without writing.
    async fn apply_report<F>(
        &self,
        handle: &TaskHandle,
        succeeded: Option<bool>,
        now: OffsetDateTime,
        command: F,
    ) -> Result<Transition>
    where
        F: FnOnce(TaskId, u32) -> Command,
    {
        let (task, lease) = match self.queue.lookup(handle)? {
            HandleState::Leased(task, lease) => (task, lease),
            HandleState::Offered(task, lease) => {
                // The node answered before the offer path recorded the dispatch.
                let assignment = TaskAssignment {
                    task: task.clone(),
                    node_id: lease.node_id.clone(),
                    lease_expires_at: lease.expires_at,
                };
                if !self.dispatch(&assignment, now).await? {
                    return self.apply_settled(handle, settled_attempt(&task), command).await;
                }
                self.queue.mark_dispatched(handle)?;
                (task, lease)
            }
            HandleState::Settled(settled) => {
                return self.apply_settled(handle, settled, command).await;
            }
        };

        let transition = self
            .machine
            .execute(&task.workflow, command(task.task_id.clone(), task.attempt))
            .await?;
        if let Some(succeeded) = succeeded {
            self.registry.record_outcome(&lease.node_id, succeeded)?;
        }
        self.settle(handle, &transition, now)?;
        Ok(transition)
    }

    async fn apply_settled<F>(
        &self,
        handle: &TaskHandle,
        settled: SettledAttempt,
        command: F,
    ) -> Result<Transition>
    where
        F: FnOnce(TaskId, u32) -> Command,
    {
        let transition = self
            .machine
            .execute(
                &settled.workflow,
                command(settled.task_id.clone(), settled.attempt),
            )
            .await?;
        debug!(
            workflow = %settled.workflow,
            task_id = %settled.task_id,
            attempt = settled.attempt,
            handle = %handle,
            duplicate = transition.is_duplicate(),
            "Report for settled attempt"
        );
        Ok(transition)
    }

    /// Take a declined offer back and roll back its reservation.
    fn decline(&self, assignment: &TaskAssignment, now: OffsetDateTime) -> Result<()> {
        let until = now + self.config.offer_cooldown;
        let lease = self
            .queue
            .decline(&assignment.task.handle, &assignment.node_id, until)?;
        if let Some(reservation) = lease.and_then(|lease| lease.reservation) {
            self.registry.release(&reservation)?;
        }
        debug!(
            workflow = %assignment.task.workflow,
            task_id = %assignment.task.task_id,
            node_id = %assignment.node_id,
            cooldown_ms = self.config.offer_cooldown.as_millis() as u64,
            "Task offer declined"
        );
        Ok(())
    }

    /// Offer a leased assignment to its node.
    async fn offer(&self, assignment: &TaskAssignment) -> Result<bool> {
        let Some(client) = self.registry.client(&assignment.node_id)? else {
            return Ok(false);
        };
        match tokio::time::timeout(self.config.offer_timeout, client.offer(assignment)).await {
            Ok(Ok(accepted)) => Ok(accepted),
            Ok(Err(e)) => {
                warn!(node_id = %assignment.node_id, handle = %assignment.task.handle, error = %e, "Task offer failed");
                Ok(false)
            }
            Err(_) => {
                warn!(
                    node_id = %assignment.node_id,
                    handle = %assignment.task.handle,
                    timeout_ms = self.config.offer_timeout.as_millis() as u64,
                    "Task offer timed out"
                );
                Ok(false)
            }
        }
    }

    /// Remove a settled entry, return its capacity, and reschedule.
    fn settle(&self, handle: &TaskHandle, transition: &Transition, now: OffsetDateTime) -> Result<()> {
        if let Some((_, Some(lease))) = self.queue.remove(handle)? {
            if let Some(reservation) = &lease.reservation {
                self.registry.release(reservation)?;
            }
        }
        self.after_transition(&transition.snapshot, now)?;
        Ok(())
    }

    /// Put an entry back after its dispatch command failed.
    fn abandon(&self, assignment: &TaskAssignment, error: &Error) -> Result<()> {
        log_command_error(&assignment.task.workflow, "dispatch task", error);
        if let Some(reservation) = self
            .queue
            .unlease(&assignment.task.handle)?
            .and_then(|lease| lease.reservation)
        {
            self.registry.release(&reservation)?;
        }
        Ok(())
    }
}

fn settled_attempt(task: &QueuedTask) -> SettledAttempt {
    SettledAttempt {
        workflow: task.workflow.clone(),
        task_id: task.task_id.clone(),
        attempt: task.attempt,
    }
}

fn log_command_error(workflow: &WorkflowRef, action: &'static str, error: &Error) {
    if error.is_fatal() {
        error!(workflow = %workflow, action, error = %error, "Workflow command failed, instance needs attention");
    } else {
        warn!(workflow = %workflow, action, error = %error, "Workflow command failed");
    }
}
