//! The orchestrator end to end on PostgreSQL.

use std::collections::BTreeMap;
use std::sync::Arc;

use eventflow::{
    InMemoryTransport, Orchestrator, PgStore, TaskOutcome, WorkflowRuntime, WorkflowState,
};
use serde_json::json;
use test_utils::db_test;
use tokio::sync::oneshot;

use crate::support::db::stored_event_types;
use crate::support::helpers::{
    DEFAULT_TEST_TIMEOUT, init_test_tracing, no_input, order, test_config,
};

fn orchestrator(store: PgStore) -> eventflow::Result<Orchestrator<PgStore>> {
    Orchestrator::builder(store)
        .config(test_config())
        .register(order())
        .build()
}

db_test!(workflow_runs_to_completion, |pool| {
    init_test_tracing();
    let orchestrator = orchestrator(PgStore::new(pool.clone()))?;
    let node = orchestrator.register_node(Vec::<String>::new(), BTreeMap::new())?;
    let workflow = orchestrator
        .start_workflow("order", "o-1", no_input(), Some("req-1".into()))
        .await?;

    let mut ran = Vec::new();
    while let Some(assignment) = orchestrator.poll_tasks(&node, 1).await?.pop() {
        ran.push(assignment.task.task_id.to_string());
        orchestrator
            .report_task_result(&assignment.task.handle, TaskOutcome::Completed { result: json!(true) })
            .await?;
    }
    assert_eq!(ran, ["validate", "charge", "ship"]);

    let snapshot = orchestrator.get_workflow_state(&workflow).await?;
    assert_eq!(snapshot.state, WorkflowState::Completed);

    let history = orchestrator.get_workflow_history(&workflow).await?;
    assert_eq!(history.len(), 8);
    assert!(history.iter().all(|e| e.correlation_id.as_deref() == Some("req-1")));
    assert_eq!(
        stored_event_types(pool, &workflow).await?.last().map(String::as_str),
        Some("workflow.completed")
    );

    // The instance is closed to further commands.
    assert!(orchestrator.pause_workflow(&workflow, None).await.is_err());
    Ok(())
});

db_test!(duplicate_starts_and_reports_are_absorbed, |pool| {
    let orchestrator = orchestrator(PgStore::new(pool.clone()))?;
    let node = orchestrator.register_node(Vec::<String>::new(), BTreeMap::new())?;
    let workflow = orchestrator
        .start_workflow("order", "o-1", no_input(), None)
        .await?;
    orchestrator
        .start_workflow("order", "o-1", no_input(), None)
        .await?;

    let assignment = orchestrator
        .poll_tasks(&node, 1)
        .await?
        .pop()
        .expect("validate should be handed out");
    orchestrator
        .report_task_result(&assignment.task.handle, TaskOutcome::Completed { result: json!(1) })
        .await?;
    let redelivered = orchestrator
        .machine()
        .execute(
            &workflow,
            eventflow::Command::CompleteTask {
                task_id: assignment.task.task_id.clone(),
                attempt: assignment.task.attempt,
                result: json!(2),
            },
        )
        .await?;
    assert!(redelivered.is_duplicate());

    let history = orchestrator.get_workflow_history(&workflow).await?;
    assert_eq!(
        history
            .iter()
            .filter(|e| e.event_type() == "workflow.started")
            .count(),
        1
    );
    assert_eq!(
        history
            .iter()
            .filter(|e| e.event_type() == "task.completed")
            .count(),
        1
    );
    Ok(())
});

db_test!(a_restarted_orchestrator_resumes_live_workflows, |pool| {
    let before = orchestrator(PgStore::new(pool.clone()))?;
    let workflow = before
        .start_workflow("order", "o-1", no_input(), None)
        .await?;
    drop(before);

    let after = orchestrator(PgStore::new(pool.clone()))?;
    assert_eq!(after.recover().await?, 1);
    let node = after.register_node(Vec::<String>::new(), BTreeMap::new())?;
    let assignment = after
        .poll_tasks(&node, 1)
        .await?
        .pop()
        .expect("validate should be requeued");
    assert_eq!(assignment.task.workflow, workflow);
    assert_eq!(assignment.task.attempt, 1);
    Ok(())
});

db_test!(runtime_publishes_committed_events, |pool| {
    init_test_tracing();
    let transport = InMemoryTransport::default();
    let mut rx = transport.subscribe();
    let orchestrator = Arc::new(
        Orchestrator::builder(PgStore::new(pool.clone()))
            .config(test_config())
            .register(order())
            .transport(transport)
            .build()?,
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let runtime = WorkflowRuntime::new(Arc::clone(&orchestrator));
    let running = tokio::spawn(runtime.run(async {
        let _ = shutdown_rx.await;
    }));

    orchestrator
        .start_workflow("order", "o-1", no_input(), None)
        .await?;
    let message = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, rx.recv()).await??;
    assert_eq!(message.topic, "workflow.order");
    assert_eq!(message.partition_key, "o-1");
    assert_eq!(message.decode_event()?.sequence, 1);

    let _ = shutdown_tx.send(());
    tokio::time::timeout(DEFAULT_TEST_TIMEOUT, running).await???;
    Ok(())
});
