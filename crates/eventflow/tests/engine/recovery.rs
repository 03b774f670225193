//! Rebuilding scheduling state from the log after a restart.

use std::time::Duration;

use anyhow::Result;
use eventflow::{MemoryStore, RuntimeConfig, TaskOutcome, WorkflowState};
use serde_json::json;

use crate::support::helpers::{
    count, drain, init_test_tracing, input, orchestrator_with, state_of, test_config, worker,
};
use crate::support::workflows::{deadline, order};

fn short_leases() -> RuntimeConfig {
    RuntimeConfig {
        lease_duration: Duration::from_millis(30),
        ..test_config()
    }
}

#[tokio::test]
async fn ready_tasks_are_requeued_after_restart() -> Result<()> {
    init_test_tracing();
    let store = MemoryStore::new();
    let before = orchestrator_with(store.clone(), test_config(), [order()])?;
    let workflow = before
        .start_workflow("order", "o-1", input(json!({})), None)
        .await?;
    drop(before);

    let after = orchestrator_with(store, test_config(), [order()])?;
    let node = worker(&after)?;
    assert!(after.poll_tasks(&node, 1).await?.is_empty());

    assert_eq!(after.recover().await?, 1);
    let ran = drain(&after, &node).await?;
    assert_eq!(ran, ["validate", "charge", "ship"]);
    assert_eq!(
        state_of(&after, &workflow).await?.state,
        WorkflowState::Completed
    );
    Ok(())
}

#[tokio::test]
async fn in_flight_tasks_get_their_lease_back() -> Result<()> {
    let store = MemoryStore::new();
    let before = orchestrator_with(store.clone(), short_leases(), [order()])?;
    let workflow = before
        .start_workflow("order", "o-1", input(json!({})), None)
        .await?;
    let lost = worker(&before)?;
    let first = before
        .poll_tasks(&lost, 1)
        .await?
        .pop()
        .expect("validate should be handed out");
    drop(before);

    let after = orchestrator_with(store, short_leases(), [order()])?;
    after.recover().await?;
    let node = worker(&after)?;

    // Still leased to the node that went away with the old process.
    assert!(after.poll_tasks(&node, 1).await?.is_empty());

    tokio::time::sleep(Duration::from_millis(60)).await;
    let report = after.run_maintenance().await?;
    assert_eq!(report.leases_expired, 1);

    let second = after
        .poll_tasks(&node, 1)
        .await?
        .pop()
        .expect("validate should be handed out again");
    assert_eq!(second.task.task_id, first.task.task_id);
    assert_eq!(second.task.attempt, 2);

    after
        .report_task_result(&second.task.handle, TaskOutcome::Completed { result: json!(1) })
        .await?;
    let history = after.get_workflow_history(&workflow).await?;
    assert_eq!(count(&history, "task.released"), 1);
    assert_eq!(count(&history, "task.completed"), 1);
    Ok(())
}

#[tokio::test]
async fn deadlines_survive_a_restart() -> Result<()> {
    let store = MemoryStore::new();
    let definition = deadline(Duration::from_millis(30));
    let before = orchestrator_with(store.clone(), test_config(), [definition.clone()])?;
    let workflow = before
        .start_workflow("deadline", "d-1", input(json!({})), None)
        .await?;
    drop(before);

    let after = orchestrator_with(store, test_config(), [definition])?;
    after.recover().await?;

    tokio::time::sleep(Duration::from_millis(60)).await;
    let report = after.run_maintenance().await?;
    assert_eq!(report.workflows_timed_out, 1);
    assert_eq!(
        state_of(&after, &workflow).await?.state,
        WorkflowState::Failed
    );
    Ok(())
}

#[tokio::test]
async fn terminal_workflows_are_not_recovered() -> Result<()> {
    let store = MemoryStore::new();
    let before = orchestrator_with(store.clone(), test_config(), [order()])?;
    let node = worker(&before)?;
    before
        .start_workflow("order", "done", input(json!({})), None)
        .await?;
    drain(&before, &node).await?;
    let cancelled = before
        .start_workflow("order", "cancelled", input(json!({})), None)
        .await?;
    before.cancel_workflow(&cancelled, None).await?;
    before
        .start_workflow("order", "live", input(json!({})), None)
        .await?;
    drop(before);

    let after = orchestrator_with(store, test_config(), [order()])?;
    assert_eq!(after.recover().await?, 1);

    let node = worker(&after)?;
    let assignment = after
        .poll_tasks(&node, 5)
        .await?
        .pop()
        .expect("the live workflow should be scheduled");
    assert_eq!(assignment.task.workflow.instance_id().as_str(), "live");
    Ok(())
}
