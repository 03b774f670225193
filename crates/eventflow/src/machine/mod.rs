//! The workflow state machine.
//!
//! The machine is the only writer of events. For each [`Command`] it:
//!
//! 1. Begins a unit of work on the instance (acquires the writer lock)
//! 2. Rebuilds the snapshot from the latest stored snapshot plus newer events
//! 3. Resolves duplicate deliveries by idempotency key
//! 4. Calls [`decide`] for the root event
//! 5. Appends it, checks the transition table, and re-folds
//! 6. Appends the follow-up events the new snapshot makes necessary
//! 7. Marks the instance terminal if a terminal state was reached
//! 8. Commits, then stores a snapshot every `snapshot_interval` events
//!
//! If any step fails the unit of work is dropped and nothing is persisted.

mod command;
mod decide;
mod transition;

use std::sync::Arc;

use nonempty::NonEmpty;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

pub use command::Command;
pub use decide::{Decision, decide, follow_up};
pub use transition::{allowed_transitions, can_transition};

use crate::error::{Error, Result};
use crate::event::{Causation, NewEvent, WorkflowEvent};
use crate::log::{EventLog, ensure_contiguous};
use crate::projection::{Projector, WorkflowSnapshot, fold};
use crate::store::{AppendOutcome, BeginResult, EventStore, SnapshotStore, UnitOfWork};
use crate::workflow::WorkflowRef;

/// Upper bound on follow-up events per command.
const MAX_FOLLOW_UPS: usize = 64;

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Store a snapshot whenever the log crosses a multiple of this many
    /// events. `0` disables snapshots. Default: 50.
    pub snapshot_interval: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 50,
        }
    }
}

/// What executing a command did.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The root event and its follow-ups were appended and committed.
    Applied { events: NonEmpty<WorkflowEvent> },
    /// The command was already applied; nothing was written.
    Duplicate { sequence: u64 },
    /// The command no longer applies; nothing was written.
    Discarded { reason: String },
}

/// Result of [`StateMachine::execute`]: the outcome and the snapshot after it.
#[derive(Debug, Clone)]
pub struct Transition {
    pub outcome: TransitionOutcome,
    pub snapshot: WorkflowSnapshot,
}

impl Transition {
    /// Events appended by this transition, empty unless applied.
    pub fn events(&self) -> Vec<&WorkflowEvent> {
        match &self.outcome {
            TransitionOutcome::Applied { events } => events.iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self.outcome, TransitionOutcome::Applied { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self.outcome, TransitionOutcome::Duplicate { .. })
    }
}

/// Guarded executor of workflow commands.
pub struct StateMachine<S> {
    projector: Arc<Projector<S>>,
    config: MachineConfig,
}

impl<S> StateMachine<S>
where
    S: EventStore + SnapshotStore,
{
    pub fn new(projector: Arc<Projector<S>>, config: MachineConfig) -> Self {
        Self { projector, config }
    }

    pub fn projector(&self) -> &Arc<Projector<S>> {
        &self.projector
    }

    fn log(&self) -> &EventLog<S> {
        self.projector.log()
    }

    /// Current snapshot of an instance.
    pub async fn load(&self, workflow: &WorkflowRef) -> Result<WorkflowSnapshot> {
        self.projector.current(workflow).await
    }

    /// Execute `command` with its derived idempotency key.
    pub async fn execute(&self, workflow: &WorkflowRef, command: Command) -> Result<Transition> {
        self.run(workflow, command, None).await
    }

    /// Execute `command` under a caller-supplied idempotency key.
    pub async fn execute_with_key(
        &self,
        workflow: &WorkflowRef,
        command: Command,
        idempotency_key: impl Into<String>,
    ) -> Result<Transition> {
        self.run(workflow, command, Some(idempotency_key.into())).await
    }

    async fn run(
        &self,
        workflow: &WorkflowRef,
        command: Command,
        key_override: Option<String>,
    ) -> Result<Transition> {
        let mut uow = match self.log().begin(workflow).await? {
            BeginResult::Active { uow } => uow,
            BeginResult::Terminal => {
                return self.on_terminal(workflow, &command, key_override).await;
            }
        };

        let seed = self.seed(workflow).await?;
        let from = seed.sequence + 1;
        let events = uow.load_events(from).await?;
        ensure_contiguous(workflow, &events, from)?;
        let mut snapshot = fold(&events, seed)?;

        let key = key_override.unwrap_or_else(|| command.idempotency_key(&snapshot));
        if let Some(sequence) = uow.find_idempotency_key(&key).await? {
            debug!(workflow = %workflow, key = %key, sequence, "Duplicate command ignored");
            return Ok(Transition {
                outcome: TransitionOutcome::Duplicate { sequence },
                snapshot,
            });
        }

        let now = OffsetDateTime::now_utc();
        let kind = match decide(now, &snapshot, &command)? {
            Decision::Apply(kind) => kind,
            Decision::Discard(reason) => {
                debug!(
                    workflow = %workflow,
                    action = command.action(),
                    reason = %reason,
                    "Command discarded"
                );
                return Ok(Transition {
                    outcome: TransitionOutcome::Discarded { reason },
                    snapshot,
                });
            }
        };

        let correlation_id = match &command {
            Command::Start { correlation_id, .. } => correlation_id.clone(),
            _ => snapshot.correlation_id.clone(),
        };
        let mut root = NewEvent::new(kind, key.clone())
            .with_correlation_id(correlation_id.clone())
            .at(now);
        if let Some(cause) = command
            .task_id()
            .and_then(|task_id| snapshot.task(task_id))
            .and_then(|task| task.dispatch_cause)
        {
            root = root.caused_by(cause);
        }

        let root = append(&mut uow, &mut snapshot, root).await?;
        let mut appended = NonEmpty::new(root);

        while let Some(kind) = follow_up(&snapshot) {
            if appended.len() > MAX_FOLLOW_UPS {
                error!(
                    workflow = %workflow,
                    key = %key,
                    "Follow-up limit reached; instance left for the next command"
                );
                break;
            }
            let follow_key = match kind.task_id() {
                Some(task_id) => format!("{key}>{}:{task_id}", kind.event_type()),
                None => format!("{key}>{}", kind.event_type()),
            };
            let event = NewEvent::new(kind, follow_key)
                .caused_by(Causation::local(appended.last()))
                .with_correlation_id(correlation_id.clone())
                .at(now);
            let event = append(&mut uow, &mut snapshot, event).await?;
            appended.push(event);
        }

        if snapshot.is_terminal() {
            uow.mark_terminal();
        }
        uow.commit().await?;

        info!(
            workflow = %workflow,
            action = command.action(),
            events = appended.len(),
            sequence = snapshot.sequence,
            state = %snapshot.state,
            "Workflow transition committed"
        );

        self.maybe_snapshot(&snapshot, appended.len() as u64).await;
        let committed: Vec<WorkflowEvent> = appended.iter().cloned().collect();
        if let Err(e) = self.projector.on_committed(&committed) {
            warn!(workflow = %workflow, error = %e, "Live projections not updated");
        }

        Ok(Transition {
            outcome: TransitionOutcome::Applied { events: appended },
            snapshot,
        })
    }

    /// Resolve a command against an instance that accepts no more events.
    async fn on_terminal(
        &self,
        workflow: &WorkflowRef,
        command: &Command,
        key_override: Option<String>,
    ) -> Result<Transition> {
        let snapshot = self.load(workflow).await?;
        let key = key_override.unwrap_or_else(|| command.idempotency_key(&snapshot));
        if let Some(sequence) = self
            .log()
            .store()
            .find_idempotency_key(workflow, &key)
            .await?
        {
            return Ok(Transition {
                outcome: TransitionOutcome::Duplicate { sequence },
                snapshot,
            });
        }

        if command.is_caller_command() {
            return Err(Error::invalid_transition(
                workflow,
                snapshot.state,
                command.action(),
            ));
        }

        warn!(
            workflow = %workflow,
            state = %snapshot.state,
            action = command.action(),
            "Command for terminal workflow discarded"
        );
        Ok(Transition {
            outcome: TransitionOutcome::Discarded {
                reason: format!("workflow is {}", snapshot.state),
            },
            snapshot,
        })
    }

    async fn seed(&self, workflow: &WorkflowRef) -> Result<WorkflowSnapshot> {
        match self.log().load_snapshot::<WorkflowSnapshot>(workflow).await? {
            Some((watermark, snapshot))
                if snapshot.sequence == watermark && snapshot.workflow() == *workflow =>
            {
                Ok(snapshot)
            }
            _ => Ok(WorkflowSnapshot::empty(workflow)),
        }
    }

    /// Store a snapshot if this commit crossed a snapshot boundary.
    ///
    /// Snapshots are caches; failures are logged and otherwise ignored.
    async fn maybe_snapshot(&self, snapshot: &WorkflowSnapshot, appended: u64) {
        let interval = self.config.snapshot_interval;
        if interval == 0 {
            return;
        }
        let before = snapshot.sequence.saturating_sub(appended);
        if snapshot.sequence / interval == before / interval {
            return;
        }
        let workflow = snapshot.workflow();
        if let Err(e) = self
            .log()
            .create_snapshot(&workflow, snapshot.sequence, snapshot)
            .await
        {
            warn!(workflow = %workflow, sequence = snapshot.sequence, error = %e, "Snapshot not stored");
        }
    }
}

/// Append one event after checking that it is a legal transition.
async fn append<U: UnitOfWork>(
    uow: &mut U,
    snapshot: &mut WorkflowSnapshot,
    event: NewEvent,
) -> Result<WorkflowEvent> {
    let workflow = uow.workflow().clone();
    let expected = uow.last_sequence() + 1;
    let event_type = event.kind.event_type();

    let mut next = snapshot.clone();
    next.apply(&event.clone().into_event(&workflow, expected))?;
    if !can_transition(snapshot.state, next.state) {
        warn!(
            workflow = %workflow,
            from = %snapshot.state,
            to = %next.state,
            event_type,
            "Illegal transition rejected"
        );
        return Err(Error::invalid_transition(&workflow, snapshot.state, event_type));
    }

    match uow.append(expected, event).await? {
        AppendOutcome::Appended(event) => {
            *snapshot = next;
            Ok(event)
        }
        AppendOutcome::Duplicate { sequence } => Err(Error::Validation(format!(
            "{event_type} for {workflow} reuses the idempotency key of sequence {sequence}"
        ))),
    }
}
