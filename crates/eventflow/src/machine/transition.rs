//! The workflow lifecycle transition table.

use crate::workflow::WorkflowState;

/// States reachable from `from` in one event.
///
/// Terminal states have no successors.
pub fn allowed_transitions(from: WorkflowState) -> &'static [WorkflowState] {
    use WorkflowState::*;

    match from {
        Pending => &[Initializing, Running],
        Initializing => &[Running, Failed, Cancelled],
        Running => &[
            Paused,
            Retrying,
            WaitingForDependency,
            Compensating,
            Completed,
            Failed,
            Cancelled,
            Timeout,
        ],
        Paused => &[Running, Cancelled, Timeout],
        Retrying => &[Running, Compensating, Failed, Cancelled, Timeout],
        WaitingForDependency => &[Running, Cancelled, Timeout],
        Timeout => &[Compensating, Failed],
        Compensating => &[Compensated, Failed, Cancelled],
        Compensated => &[Failed],
        Completed | Failed | Cancelled => &[],
    }
}

/// Whether an event may move an instance from `from` to `to`.
///
/// Staying in the same state is always allowed for non-terminal states;
/// task-level events do not change the workflow state.
pub fn can_transition(from: WorkflowState, to: WorkflowState) -> bool {
    if from.is_terminal() {
        return false;
    }
    from == to || allowed_transitions(from).contains(&to)
}
