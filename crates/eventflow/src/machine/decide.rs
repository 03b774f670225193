//! Pure decision rules: what event, if any, a command produces, and which
//! follow-up events a new snapshot makes necessary.

use time::OffsetDateTime;

use super::command::Command;
use super::transition::can_transition;
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::projection::{TaskRecord, WorkflowSnapshot, is_open_wait};
use crate::task::{TaskId, TaskStatus, TaskType};
use crate::workflow::WorkflowState;

/// Outcome of [`decide`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Append this event.
    Apply(EventKind),
    /// Nothing to do; the command is stale or superseded.
    Discard(String),
}

/// Decide the root event for `command` against `snapshot`.
///
/// Errors are reported to the caller and nothing is appended. Stale
/// deliveries from nodes and maintenance are discarded instead.
pub fn decide(now: OffsetDateTime, snapshot: &WorkflowSnapshot, command: &Command) -> Result<Decision> {
    let workflow = snapshot.workflow();
    let state = snapshot.state;

    match command {
        Command::Start {
            definition,
            input,
            ..
        } => {
            if snapshot.exists() {
                return Err(Error::invalid_transition(&workflow, state, command.action()));
            }
            if definition.workflow_type != snapshot.workflow_type {
                return Err(Error::Validation(format!(
                    "definition for {} cannot start {workflow}",
                    definition.workflow_type
                )));
            }
            definition.validate()?;
            Ok(Decision::Apply(EventKind::WorkflowStarted {
                input: input.clone(),
                tasks: definition.tasks.clone(),
                compensation: definition.compensation.clone(),
                timeout: definition.timeout,
                resource_limits: definition.resource_limits.clone(),
            }))
        }

        Command::Pause { reason } => {
            require_started(snapshot)?;
            if state != WorkflowState::Running {
                return Err(Error::invalid_transition(&workflow, state, command.action()));
            }
            Ok(Decision::Apply(EventKind::WorkflowPaused {
                reason: reason.clone(),
            }))
        }

        Command::Resume => {
            require_started(snapshot)?;
            if state != WorkflowState::Paused {
                return Err(Error::invalid_transition(&workflow, state, command.action()));
            }
            Ok(Decision::Apply(EventKind::WorkflowResumed))
        }

        Command::Cancel { reason } => {
            require_started(snapshot)?;
            if snapshot.cancel_requested {
                return Ok(Decision::Discard("cancellation already requested".into()));
            }
            Ok(Decision::Apply(EventKind::WorkflowCancelRequested {
                reason: reason.clone(),
            }))
        }

        Command::DispatchTask {
            task_id,
            node_id,
            attempt,
        } => {
            if !state.is_dispatching() {
                return Ok(Decision::Discard(format!("workflow is {state}")));
            }
            if snapshot.cancel_requested {
                return Ok(Decision::Discard("cancellation requested".into()));
            }
            let task = lookup(snapshot, task_id)?;
            if !snapshot.is_active_task(task_id) {
                return Ok(Decision::Discard(format!("task {task_id} is not in the active graph")));
            }
            if !task.config.task_type.is_dispatched() {
                return Ok(Decision::Discard(format!("task {task_id} is not dispatched to nodes")));
            }
            if !task.is_ready() {
                return Ok(Decision::Discard(format!("task {task_id} is {:?}", task.status)));
            }
            if *attempt != task.attempts + 1 {
                return Ok(Decision::Discard(format!(
                    "attempt {attempt} of task {task_id} is stale, next is {}",
                    task.attempts + 1
                )));
            }
            Ok(Decision::Apply(EventKind::TaskDispatched {
                task_id: task_id.clone(),
                node_id: node_id.clone(),
                attempt: *attempt,
            }))
        }

        Command::CompleteTask {
            task_id,
            attempt,
            result,
        } => {
            let task = lookup(snapshot, task_id)?;
            if let Some(reason) = stale_result(task, *attempt) {
                return Ok(Decision::Discard(reason));
            }
            if snapshot.cancel_requested {
                return Ok(Decision::Apply(EventKind::TaskCancelled {
                    task_id: task_id.clone(),
                }));
            }
            Ok(Decision::Apply(EventKind::TaskCompleted {
                task_id: task_id.clone(),
                attempt: *attempt,
                result: result.clone(),
            }))
        }

        Command::FailTask {
            task_id,
            attempt,
            error,
            retryable,
            timed_out,
        } => {
            let task = lookup(snapshot, task_id)?;
            if let Some(reason) = stale_result(task, *attempt) {
                return Ok(Decision::Discard(reason));
            }
            if snapshot.cancel_requested {
                return Ok(Decision::Apply(EventKind::TaskCancelled {
                    task_id: task_id.clone(),
                }));
            }
            let will_retry = *retryable && task.config.retry_policy.should_retry(task.failures + 1);
            Ok(Decision::Apply(EventKind::TaskFailed {
                task_id: task_id.clone(),
                attempt: *attempt,
                error: error.clone(),
                timed_out: *timed_out,
                will_retry,
            }))
        }

        Command::ReleaseTask {
            task_id,
            attempt,
            reason,
        } => {
            let task = lookup(snapshot, task_id)?;
            if let Some(stale) = stale_result(task, *attempt) {
                return Ok(Decision::Discard(stale));
            }
            if snapshot.cancel_requested {
                return Ok(Decision::Apply(EventKind::TaskCancelled {
                    task_id: task_id.clone(),
                }));
            }
            Ok(Decision::Apply(EventKind::TaskReleased {
                task_id: task_id.clone(),
                attempt: *attempt,
                reason: reason.clone(),
            }))
        }

        Command::SignalTask { task_id, payload } => {
            require_started(snapshot)?;
            let task = lookup(snapshot, task_id)?;
            if task.config.task_type != TaskType::Wait {
                return Err(Error::Validation(format!(
                    "task {task_id} of {workflow} is not a wait task"
                )));
            }
            if !state.is_dispatching() || snapshot.cancel_requested {
                return Err(Error::invalid_transition(&workflow, state, command.action()));
            }
            if !snapshot.is_active_task(task_id) || task.status != TaskStatus::Pending {
                return Err(Error::Validation(format!(
                    "wait task {task_id} of {workflow} is {:?} and cannot be signalled",
                    task.status
                )));
            }
            Ok(Decision::Apply(EventKind::TaskCompleted {
                task_id: task_id.clone(),
                attempt: 1,
                result: payload.clone(),
            }))
        }

        Command::TimeOut => {
            let Some(deadline) = snapshot.deadline() else {
                return Ok(Decision::Discard("workflow has no timeout".into()));
            };
            if now < deadline {
                return Ok(Decision::Discard(format!("deadline {deadline} not reached")));
            }
            if !can_transition(state, WorkflowState::Timeout) {
                return Ok(Decision::Discard(format!("workflow is {state}")));
            }
            Ok(Decision::Apply(EventKind::WorkflowTimedOut))
        }
    }
}

/// The next event the machine must append on its own, if any.
///
/// Applied repeatedly after the root event until it returns `None`.
pub fn follow_up(snapshot: &WorkflowSnapshot) -> Option<EventKind> {
    let state = snapshot.state;
    if !snapshot.exists() || state.is_terminal() {
        return None;
    }

    if snapshot.cancel_requested
        && snapshot.in_flight().next().is_none()
        && can_transition(state, WorkflowState::Cancelled)
    {
        return Some(EventKind::WorkflowCancelled {
            reason: snapshot.cancel_reason.clone(),
        });
    }

    match state {
        WorkflowState::Timeout => return Some(escalate(snapshot, "workflow timed out".into())),
        WorkflowState::Compensating => {
            if let Some(task) = first_failed(snapshot.compensation_tasks.values()) {
                return Some(EventKind::WorkflowFailed {
                    error: format!(
                        "compensation task {} failed: {}",
                        task.task_id(),
                        task.last_error.as_deref().unwrap_or("unknown error")
                    ),
                });
            }
            if snapshot
                .compensation_tasks
                .values()
                .all(|t| t.status.is_success())
            {
                return Some(EventKind::CompensationCompleted);
            }
            return None;
        }
        WorkflowState::Compensated => {
            return Some(EventKind::WorkflowFailed {
                error: snapshot
                    .failure
                    .clone()
                    .unwrap_or_else(|| "compensated".into()),
            });
        }
        WorkflowState::Running | WorkflowState::Retrying | WorkflowState::WaitingForDependency => {}
        _ => return None,
    }

    if snapshot.cancel_requested {
        return None;
    }

    if let Some(task) = first_failed(snapshot.tasks.values()) {
        return Some(escalate(
            snapshot,
            format!(
                "task {} failed: {}",
                task.task_id(),
                task.last_error.as_deref().unwrap_or("unknown error")
            ),
        ));
    }

    if let Some((task_id, decided_by)) = next_skip(snapshot) {
        return Some(EventKind::TaskSkipped {
            task_id,
            reason: format!("skipped by decision task {decided_by}"),
        });
    }

    if snapshot.tasks.values().all(|t| t.status.is_success()) {
        return Some(EventKind::WorkflowCompleted {
            output: snapshot.task_results(),
        });
    }

    if state == WorkflowState::Running
        && snapshot.in_flight().next().is_none()
        && snapshot.dispatchable_tasks().next().is_none()
    {
        let task_ids: Vec<TaskId> = snapshot
            .tasks
            .values()
            .filter(|t| is_open_wait(t))
            .map(|t| t.task_id().clone())
            .collect();
        if !task_ids.is_empty() {
            return Some(EventKind::WorkflowWaiting { task_ids });
        }
    }

    None
}

fn require_started(snapshot: &WorkflowSnapshot) -> Result<()> {
    if snapshot.exists() {
        Ok(())
    } else {
        Err(Error::WorkflowNotFound(snapshot.workflow().to_string()))
    }
}

fn lookup<'a>(snapshot: &'a WorkflowSnapshot, task_id: &TaskId) -> Result<&'a TaskRecord> {
    snapshot.task(task_id).ok_or_else(|| Error::UnknownTask {
        workflow: snapshot.workflow().to_string(),
        task_id: task_id.to_string(),
    })
}

/// Why a node's verdict for `attempt` no longer applies, if it does not.
fn stale_result(task: &TaskRecord, attempt: u32) -> Option<String> {
    if task.status != TaskStatus::Running {
        return Some(format!(
            "task {} is {:?}, result for attempt {attempt} is stale",
            task.task_id(),
            task.status
        ));
    }
    if task.attempts != attempt {
        return Some(format!(
            "task {} is on attempt {}, result for attempt {attempt} is stale",
            task.task_id(),
            task.attempts
        ));
    }
    None
}

fn first_failed<'a>(mut tasks: impl Iterator<Item = &'a TaskRecord>) -> Option<&'a TaskRecord> {
    tasks.find(|t| t.status == TaskStatus::Failed)
}

/// Compensate when a policy is declared, otherwise fail.
fn escalate(snapshot: &WorkflowSnapshot, reason: String) -> EventKind {
    if snapshot.has_compensation {
        EventKind::CompensationStarted { reason }
    } else {
        EventKind::WorkflowFailed { error: reason }
    }
}

/// First not-yet-started task named in a completed decision's `skip` list.
fn next_skip(snapshot: &WorkflowSnapshot) -> Option<(TaskId, TaskId)> {
    snapshot
        .tasks
        .values()
        .filter(|t| t.config.task_type == TaskType::Decision && t.status == TaskStatus::Completed)
        .find_map(|decision| {
            let skip = decision.result.as_ref()?.get("skip")?.as_array()?;
            skip.iter()
                .filter_map(|id| id.as_str())
                .map(TaskId::new)
                .find(|id| {
                    snapshot.tasks.get(id).is_some_and(|t| {
                        matches!(
                            t.status,
                            TaskStatus::Pending | TaskStatus::WaitingForDependency
                        )
                    })
                })
                .map(|id| (id, decision.task_id().clone()))
        })
}
