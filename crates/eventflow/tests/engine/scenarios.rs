//! End-to-end acceptance scenarios.

use anyhow::Result;
use eventflow::{TaskError, TaskOutcome, WorkflowState};
use serde_json::json;

use crate::support::helpers::{
    assert_event_types, count, drain, init_test_tracing, input, orchestrator, state_of, worker,
};
use crate::support::workflows::{compensated, order, pipeline, single};

// =============================================================================
// Scenario A: start
// =============================================================================

#[tokio::test]
async fn start_records_one_started_event_and_runs() -> Result<()> {
    init_test_tracing();
    let orchestrator = orchestrator([order()])?;

    let workflow = orchestrator
        .start_workflow("order", "id1", input(json!({ "amount": 99.99 })), None)
        .await?;

    let history = orchestrator.get_workflow_history(&workflow).await?;
    assert_event_types(&history, &["workflow.started"]);
    assert_eq!(history[0].sequence, 1);

    let snapshot = state_of(&orchestrator, &workflow).await?;
    assert_eq!(snapshot.state, WorkflowState::Running);
    assert_eq!(snapshot.sequence, 1);
    assert_eq!(snapshot.context.get("amount"), Some(&json!(99.99)));
    Ok(())
}

// =============================================================================
// Scenario B: retry budget exhausted
// =============================================================================

#[tokio::test]
async fn exhausted_retries_fail_the_workflow() -> Result<()> {
    init_test_tracing();
    let orchestrator = orchestrator([single("flaky", 3)])?;
    let node = worker(&orchestrator)?;
    let workflow = orchestrator
        .start_workflow("flaky", "id1", input(json!({})), None)
        .await?;

    let mut states = Vec::new();
    for attempt in 1..=3 {
        let assignments = orchestrator.poll_tasks(&node, 1).await?;
        assert_eq!(assignments.len(), 1, "attempt {attempt} was not handed out");
        assert_eq!(assignments[0].task.attempt, attempt);

        let snapshot = orchestrator
            .report_task_result(
                &assignments[0].task.handle,
                TaskOutcome::Failed {
                    error: TaskError::new("boom"),
                    retry_count: attempt - 1,
                },
            )
            .await?;
        states.push(snapshot.state);
    }

    assert_eq!(
        states,
        [
            WorkflowState::Retrying,
            WorkflowState::Retrying,
            WorkflowState::Failed
        ]
    );

    let history = orchestrator.get_workflow_history(&workflow).await?;
    assert_eq!(count(&history, "task.failed"), 3);
    assert_eq!(count(&history, "workflow.failed"), 1);
    assert_eq!(history.last().map(|e| e.event_type()), Some("workflow.failed"));
    assert!(orchestrator.poll_tasks(&node, 1).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_with_compensation_run_the_compensation() -> Result<()> {
    init_test_tracing();
    let orchestrator = orchestrator([compensated("refundable")])?;
    let node = worker(&orchestrator)?;
    let workflow = orchestrator
        .start_workflow("refundable", "id1", input(json!({})), None)
        .await?;

    let mut last = None;
    for _ in 0..3 {
        let assignment = orchestrator
            .poll_tasks(&node, 1)
            .await?
            .pop()
            .expect("t1 should be handed out");
        assert_eq!(assignment.task.task_id.as_str(), "t1");
        last = Some(
            orchestrator
                .report_task_result(
                    &assignment.task.handle,
                    TaskOutcome::Failed {
                        error: TaskError::new("card declined"),
                        retry_count: 0,
                    },
                )
                .await?,
        );
    }
    assert_eq!(last.map(|s| s.state), Some(WorkflowState::Compensating));

    let ran = drain(&orchestrator, &node).await?;
    assert_eq!(ran, ["refund"]);

    let snapshot = state_of(&orchestrator, &workflow).await?;
    assert_eq!(snapshot.state, WorkflowState::Failed);

    let history = orchestrator.get_workflow_history(&workflow).await?;
    assert_eq!(count(&history, "task.failed"), 3);
    assert_eq!(count(&history, "compensation.started"), 1);
    assert_eq!(count(&history, "compensation.completed"), 1);
    assert_eq!(count(&history, "workflow.failed"), 1);
    Ok(())
}

// =============================================================================
// Scenario C: pause and resume
// =============================================================================

#[tokio::test]
async fn pause_then_resume_appends_two_events_and_never_redispatches() -> Result<()> {
    init_test_tracing();
    let orchestrator = orchestrator([order()])?;
    let node = worker(&orchestrator)?;
    let workflow = orchestrator
        .start_workflow("order", "id1", input(json!({})), None)
        .await?;

    let assignment = orchestrator
        .poll_tasks(&node, 1)
        .await?
        .pop()
        .expect("validate should be handed out");
    orchestrator
        .report_task_result(
            &assignment.task.handle,
            TaskOutcome::Completed { result: json!(true) },
        )
        .await?;
    let before = orchestrator.get_workflow_history(&workflow).await?.len();

    let mut states = vec![state_of(&orchestrator, &workflow).await?.state];
    states.push(orchestrator.pause_workflow(&workflow, None).await?.state);
    assert!(
        orchestrator.poll_tasks(&node, 1).await?.is_empty(),
        "paused workflows dispatch nothing"
    );
    states.push(orchestrator.resume_workflow(&workflow).await?.state);

    assert_eq!(
        states,
        [
            WorkflowState::Running,
            WorkflowState::Paused,
            WorkflowState::Running
        ]
    );
    let history = orchestrator.get_workflow_history(&workflow).await?;
    assert_event_types(&history[before..], &["workflow.paused", "workflow.resumed"]);

    let ran = drain(&orchestrator, &node).await?;
    assert_eq!(ran, ["charge", "ship"]);

    let history = orchestrator.get_workflow_history(&workflow).await?;
    let validate_dispatches = history
        .iter()
        .filter(|e| {
            e.event_type() == "task.dispatched"
                && e.payload.task_id().is_some_and(|t| t.as_str() == "validate")
        })
        .count();
    assert_eq!(validate_dispatches, 1);
    assert_eq!(
        state_of(&orchestrator, &workflow).await?.state,
        WorkflowState::Completed
    );
    Ok(())
}

// =============================================================================
// Scenario D: ranged replay
// =============================================================================

#[tokio::test]
async fn ranged_replay_matches_full_history_slice() -> Result<()> {
    init_test_tracing();
    let orchestrator = orchestrator([pipeline()])?;
    let node = worker(&orchestrator)?;
    let workflow = orchestrator
        .start_workflow("pipeline", "id1", input(json!({})), None)
        .await?;
    drain(&orchestrator, &node).await?;

    let history = orchestrator.get_workflow_history(&workflow).await?;
    assert!(history.len() >= 10, "need at least ten events, got {}", history.len());

    let replayed = orchestrator.replay_workflow(&workflow, 5, Some(10)).await?;
    assert_eq!(replayed.len(), 6);
    assert_eq!(
        replayed.iter().map(|e| e.sequence).collect::<Vec<_>>(),
        (5..=10).collect::<Vec<_>>()
    );
    assert_eq!(replayed.as_slice(), &history[4..10]);

    let tail = orchestrator.replay_workflow(&workflow, 5, None).await?;
    assert_eq!(tail.as_slice(), &history[4..]);
    Ok(())
}
