//! Node registration, leasing, push offers and reassignment.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use eventflow::{
    Error, Heartbeat, MemoryStore, RegistryConfig, RuntimeConfig, TaskConfiguration, TaskOutcome,
    TaskType, WorkflowDefinition, WorkflowRuntime, WorkflowState,
};
use serde_json::json;
use tokio::sync::oneshot;

use crate::support::helpers::{
    BusyNode, ChannelNode, DEFAULT_TEST_TIMEOUT, assert_event_types, count, init_test_tracing,
    input, orchestrator, orchestrator_with, state_of, test_config, worker,
};
use crate::support::workflows::{order, single};

fn gpu_job() -> WorkflowDefinition {
    WorkflowDefinition::new("render").with_task(
        TaskConfiguration::new("frame", TaskType::Compute)
            .requires("gpu")
            .needs("vram", 8),
    )
}

// =============================================================================
// Polling
// =============================================================================

#[tokio::test]
async fn polling_with_an_unknown_node_fails() -> Result<()> {
    let orchestrator = orchestrator([order()])?;
    let err = orchestrator
        .poll_tasks(&eventflow::NodeId::new("ghost"), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownNode(ref id) if id == "ghost"));
    Ok(())
}

#[tokio::test]
async fn tasks_only_go_to_capable_nodes_with_room() -> Result<()> {
    let orchestrator = orchestrator([gpu_job()])?;
    let cpu = worker(&orchestrator)?;
    let small = orchestrator.register_node(["gpu"], BTreeMap::from([("vram".into(), 4)]))?;
    let big = orchestrator.register_node(
        ["gpu"],
        BTreeMap::from([("vram".into(), 8), ("slots".into(), 1)]),
    )?;

    orchestrator
        .start_workflow("render", "r-1", input(json!({})), None)
        .await?;
    orchestrator
        .start_workflow("render", "r-2", input(json!({})), None)
        .await?;

    assert!(orchestrator.poll_tasks(&cpu, 5).await?.is_empty());
    assert!(orchestrator.poll_tasks(&small, 5).await?.is_empty());

    let leased = orchestrator.poll_tasks(&big, 5).await?;
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].node_id, big);
    assert!(orchestrator.poll_tasks(&big, 5).await?.is_empty());

    orchestrator
        .report_task_result(
            &leased[0].task.handle,
            TaskOutcome::Completed { result: json!("rendered") },
        )
        .await?;

    let next = orchestrator.poll_tasks(&big, 5).await?;
    assert_eq!(next.len(), 1);
    assert_ne!(next[0].task.workflow, leased[0].task.workflow);
    Ok(())
}

#[tokio::test]
async fn repeated_reports_are_absorbed() -> Result<()> {
    let orchestrator = orchestrator([order()])?;
    let node = worker(&orchestrator)?;
    let workflow = orchestrator
        .start_workflow("order", "o-1", input(json!({})), None)
        .await?;
    let assignment = orchestrator
        .poll_tasks(&node, 1)
        .await?
        .pop()
        .expect("validate should be handed out");
    let first = orchestrator
        .report_task_result(&assignment.task.handle, TaskOutcome::Completed { result: json!(1) })
        .await?;
    let before = orchestrator.get_workflow_history(&workflow).await?;

    let second = orchestrator
        .report_task_result(&assignment.task.handle, TaskOutcome::Completed { result: json!(1) })
        .await?;
    assert_eq!(second.sequence, first.sequence);
    assert_eq!(orchestrator.get_workflow_history(&workflow).await?, before);

    // A conflicting verdict for the same attempt changes nothing either.
    let conflicting = orchestrator
        .report_task_result(
            &assignment.task.handle,
            TaskOutcome::Failed {
                error: "late failure".into(),
                retry_count: 0,
            },
        )
        .await?;
    assert_eq!(conflicting.sequence, first.sequence);
    assert_eq!(orchestrator.get_workflow_history(&workflow).await?, before);
    let registration = orchestrator.registry().get(&node)?.expect("node registered");
    assert_eq!((registration.succeeded, registration.failed), (1, 0));

    let err = orchestrator
        .report_task_result(
            &eventflow::TaskHandle::new(),
            TaskOutcome::Completed { result: json!(2) },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownTaskHandle(_)));
    Ok(())
}

#[tokio::test]
async fn repeated_final_report_returns_the_completed_workflow() -> Result<()> {
    let orchestrator = orchestrator([single("job", 1)])?;
    let node = worker(&orchestrator)?;
    let workflow = orchestrator
        .start_workflow("job", "j-1", input(json!({})), None)
        .await?;
    let assignment = orchestrator
        .poll_tasks(&node, 1)
        .await?
        .pop()
        .expect("t1 should be handed out");

    let done = orchestrator
        .report_task_result(&assignment.task.handle, TaskOutcome::Completed { result: json!(1) })
        .await?;
    assert_eq!(done.state, WorkflowState::Completed);
    let again = orchestrator
        .report_task_result(&assignment.task.handle, TaskOutcome::Completed { result: json!(1) })
        .await?;
    assert_eq!(again.state, WorkflowState::Completed);
    assert_eq!(again.sequence, done.sequence);
    assert_eq!(
        orchestrator.get_workflow_history(&workflow).await?.len() as u64,
        done.sequence
    );
    Ok(())
}

#[tokio::test]
async fn released_tasks_keep_their_retry_budget() -> Result<()> {
    let orchestrator = orchestrator([single("job", 1)])?;
    let node = worker(&orchestrator)?;
    let workflow = orchestrator
        .start_workflow("job", "j-1", input(json!({})), None)
        .await?;

    for _ in 0..3 {
        let assignment = orchestrator
            .poll_tasks(&node, 1)
            .await?
            .pop()
            .expect("t1 should be handed out");
        orchestrator
            .report_task_result(
                &assignment.task.handle,
                TaskOutcome::Released {
                    reason: "draining".into(),
                },
            )
            .await?;
    }

    let snapshot = state_of(&orchestrator, &workflow).await?;
    assert_eq!(snapshot.state, WorkflowState::Running);
    let t1 = snapshot.task(&"t1".into()).expect("t1 exists");
    assert_eq!(t1.attempts, 3);
    assert_eq!(t1.failures, 0);

    let history = orchestrator.get_workflow_history(&workflow).await?;
    assert_eq!(count(&history, "task.released"), 3);
    Ok(())
}

// =============================================================================
// Node loss
// =============================================================================

#[tokio::test]
async fn silent_nodes_lose_their_tasks() -> Result<()> {
    init_test_tracing();
    let config = RuntimeConfig {
        registry: RegistryConfig {
            heartbeat_ttl: Duration::from_millis(30),
            ..Default::default()
        },
        ..test_config()
    };
    let orchestrator = orchestrator_with(MemoryStore::new(), config, [order()])?;
    let lost = worker(&orchestrator)?;
    let workflow = orchestrator
        .start_workflow("order", "o-1", input(json!({})), None)
        .await?;
    let first = orchestrator
        .poll_tasks(&lost, 1)
        .await?
        .pop()
        .expect("validate should be handed out");
    assert_eq!(first.task.attempt, 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let report = orchestrator.run_maintenance().await?;
    assert_eq!(report.nodes_unreachable, 1);
    assert_eq!(report.tasks_reassigned, 1);

    // Unreachable nodes are not handed work.
    assert!(orchestrator.poll_tasks(&lost, 1).await?.is_empty());

    let healthy = worker(&orchestrator)?;
    let second = orchestrator
        .poll_tasks(&healthy, 1)
        .await?
        .pop()
        .expect("validate should be reassigned");
    assert_eq!(second.task.task_id.as_str(), "validate");
    assert_eq!(second.task.attempt, 2);

    // The lost node's late report is stale and writes nothing.
    let late = orchestrator
        .report_task_result(&first.task.handle, TaskOutcome::Completed { result: json!(1) })
        .await?;
    assert_eq!(late.task(&"validate".into()).map(|t| t.attempts), Some(2));

    let history = orchestrator.get_workflow_history(&workflow).await?;
    assert_event_types(
        &history,
        &[
            "workflow.started",
            "task.dispatched",
            "task.released",
            "task.dispatched",
        ],
    );
    Ok(())
}

#[tokio::test]
async fn heartbeats_keep_nodes_alive() -> Result<()> {
    let config = RuntimeConfig {
        registry: RegistryConfig {
            heartbeat_ttl: Duration::from_millis(80),
            ..Default::default()
        },
        ..test_config()
    };
    let orchestrator = orchestrator_with(MemoryStore::new(), config, [order()])?;
    let node = worker(&orchestrator)?;

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(orchestrator.heartbeat(&node, Heartbeat::default())?);
        let report = orchestrator.run_maintenance().await?;
        assert_eq!(report.nodes_unreachable, 0);
    }

    assert!(
        !orchestrator.heartbeat(&eventflow::NodeId::new("ghost"), Heartbeat::default())?
    );
    Ok(())
}

#[tokio::test]
async fn unregistering_a_node_releases_its_tasks() -> Result<()> {
    let orchestrator = orchestrator([order()])?;
    let leaving = worker(&orchestrator)?;
    let workflow = orchestrator
        .start_workflow("order", "o-1", input(json!({})), None)
        .await?;
    orchestrator.poll_tasks(&leaving, 1).await?;

    let registration = orchestrator.unregister_node(&leaving).await?;
    assert_eq!(registration.node_id, leaving);
    assert!(matches!(
        orchestrator.poll_tasks(&leaving, 1).await,
        Err(Error::UnknownNode(_))
    ));

    let history = orchestrator.get_workflow_history(&workflow).await?;
    assert_eq!(count(&history, "task.released"), 1);

    let other = worker(&orchestrator)?;
    let reassigned = orchestrator.poll_tasks(&other, 1).await?;
    assert_eq!(reassigned.len(), 1);
    assert_eq!(reassigned[0].task.attempt, 2);
    Ok(())
}

// =============================================================================
// Push nodes
// =============================================================================

#[tokio::test]
async fn push_nodes_receive_offers() -> Result<()> {
    let orchestrator = orchestrator([order()])?;
    let (client, mut offers) = ChannelNode::new();
    let node = orchestrator.register_push_node(Vec::<String>::new(), BTreeMap::new(), client)?;
    let workflow = orchestrator
        .start_workflow("order", "o-1", input(json!({})), None)
        .await?;

    assert_eq!(orchestrator.dispatch_pending().await?, 1);
    let assignment = offers.try_recv()?;
    assert_eq!(assignment.node_id, node);
    assert_eq!(assignment.task.task_id.as_str(), "validate");

    // Nothing else is ready until validate completes.
    assert_eq!(orchestrator.dispatch_pending().await?, 0);

    orchestrator
        .report_task_result(&assignment.task.handle, TaskOutcome::Completed { result: json!(true) })
        .await?;
    assert_eq!(orchestrator.dispatch_pending().await?, 1);
    assert_eq!(offers.try_recv()?.task.task_id.as_str(), "charge");

    let history = orchestrator.get_workflow_history(&workflow).await?;
    assert_eq!(count(&history, "task.dispatched"), 2);
    Ok(())
}

#[tokio::test]
async fn rejected_offers_leave_the_task_queued() -> Result<()> {
    let orchestrator = orchestrator([order()])?;
    let busy = Arc::new(BusyNode::default());
    orchestrator.register_push_node(Vec::<String>::new(), BTreeMap::new(), busy.clone())?;
    let workflow = orchestrator
        .start_workflow("order", "o-1", input(json!({})), None)
        .await?;

    assert_eq!(orchestrator.dispatch_pending().await?, 0);
    assert_eq!(busy.offers.lock().unwrap().len(), 1);

    let history = orchestrator.get_workflow_history(&workflow).await?;
    assert_event_types(&history, &["workflow.started"]);

    // A polling node can still pick it up.
    let poller = worker(&orchestrator)?;
    let assignment = orchestrator
        .poll_tasks(&poller, 1)
        .await?
        .pop()
        .expect("validate should still be queued");
    assert_eq!(assignment.task.attempt, 1);
    Ok(())
}

#[tokio::test]
async fn a_node_that_keeps_rejecting_does_not_grow_the_log() -> Result<()> {
    let orchestrator = orchestrator([order()])?;
    let busy = Arc::new(BusyNode::default());
    orchestrator.register_push_node(Vec::<String>::new(), BTreeMap::new(), busy.clone())?;
    let workflow = orchestrator
        .start_workflow("order", "o-1", input(json!({})), None)
        .await?;

    for _ in 0..10 {
        assert_eq!(orchestrator.dispatch_pending().await?, 0);
    }

    // Offered once, then skipped while the node cools off.
    assert_eq!(busy.offers.lock().unwrap().len(), 1);
    let history = orchestrator.get_workflow_history(&workflow).await?;
    assert_event_types(&history, &["workflow.started"]);
    let node = orchestrator.registry().nodes()?.pop().expect("busy node registered");
    assert_eq!(node.current_load.get("slots").copied().unwrap_or(0), 0);
    Ok(())
}

#[tokio::test]
async fn push_reports_racing_their_offer_are_applied() -> Result<()> {
    let orchestrator = Arc::new(orchestrator([single("job", 1)])?);
    let (client, mut offers) = ChannelNode::new();
    orchestrator.register_push_node(Vec::<String>::new(), BTreeMap::new(), client)?;
    let workflow = orchestrator
        .start_workflow("job", "j-1", input(json!({})), None)
        .await?;

    // Report from the node while the offer path is still running.
    let reporter = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            let assignment = offers.recv().await.expect("offer delivered");
            orchestrator
                .report_task_result(&assignment.task.handle, TaskOutcome::Completed { result: json!(1) })
                .await
        })
    };
    assert_eq!(orchestrator.dispatch_pending().await?, 1);
    let snapshot = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, reporter).await???;
    assert_eq!(snapshot.state, WorkflowState::Completed);

    let history = orchestrator.get_workflow_history(&workflow).await?;
    assert_eq!(count(&history, "task.dispatched"), 1);
    assert_eq!(count(&history, "task.completed"), 1);
    Ok(())
}

#[tokio::test]
async fn runtime_drives_push_nodes_to_completion() -> Result<()> {
    init_test_tracing();
    let orchestrator = Arc::new(orchestrator([order()])?);
    let (client, mut offers) = ChannelNode::new();
    orchestrator.register_push_node(Vec::<String>::new(), BTreeMap::new(), client)?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let runtime = WorkflowRuntime::new(Arc::clone(&orchestrator));
    let running = tokio::spawn(runtime.run(async {
        let _ = shutdown_rx.await;
    }));

    let workflow = orchestrator
        .start_workflow("order", "o-1", input(json!({})), None)
        .await?;

    let completed = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, async {
        let mut ran = Vec::new();
        while ran.len() < 3 {
            let Some(assignment) = offers.recv().await else {
                break;
            };
            ran.push(assignment.task.task_id.to_string());
            orchestrator
                .report_task_result(
                    &assignment.task.handle,
                    TaskOutcome::Completed { result: json!("done") },
                )
                .await?;
        }
        anyhow::Ok(ran)
    })
    .await??;
    assert_eq!(completed, ["validate", "charge", "ship"]);

    let _ = shutdown_tx.send(());
    tokio::time::timeout(DEFAULT_TEST_TIMEOUT, running).await???;

    assert_eq!(
        state_of(&orchestrator, &workflow).await?.state,
        WorkflowState::Completed
    );
    Ok(())
}
