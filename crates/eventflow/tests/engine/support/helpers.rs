use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use eventflow::{
    MemoryStore, NodeClient, NodeId, Orchestrator, RetryPolicy, RuntimeConfig, TaskAssignment,
    TaskOutcome, WorkflowDefinition, WorkflowEvent, WorkflowRef, WorkflowSnapshot,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("eventflow=debug")
        .with_test_writer()
        .try_init();
}

/// Config with no background delays that matter for tests.
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        worker_id: Some("test".into()),
        retry_policy: RetryPolicy::immediate(3),
        dispatch_poll_interval: Duration::from_millis(10),
        maintenance_poll_interval: Duration::from_millis(20),
        publish_poll_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn orchestrator(
    definitions: impl IntoIterator<Item = WorkflowDefinition>,
) -> Result<Orchestrator<MemoryStore>> {
    orchestrator_with(MemoryStore::new(), test_config(), definitions)
}

pub fn orchestrator_with(
    store: MemoryStore,
    config: RuntimeConfig,
    definitions: impl IntoIterator<Item = WorkflowDefinition>,
) -> Result<Orchestrator<MemoryStore>> {
    let builder = definitions
        .into_iter()
        .fold(Orchestrator::builder(store).config(config), |builder, definition| {
            builder.register(definition)
        });
    Ok(builder.build()?)
}

pub fn input(value: Value) -> BTreeMap<String, Value> {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    }
}

pub fn event_types(events: &[WorkflowEvent]) -> Vec<&'static str> {
    events.iter().map(WorkflowEvent::event_type).collect()
}

/// Assert that events match the expected types in order.
pub fn assert_event_types(events: &[WorkflowEvent], expected: &[&str]) {
    assert_eq!(
        event_types(events),
        expected,
        "event type mismatch for {:?}",
        events.first().map(WorkflowEvent::workflow)
    );
}

pub fn count(events: &[WorkflowEvent], event_type: &str) -> usize {
    events
        .iter()
        .filter(|e| e.event_type() == event_type)
        .count()
}

/// Register a polling node with no capabilities and no limits beyond slots.
pub fn worker(orchestrator: &Orchestrator<MemoryStore>) -> Result<NodeId> {
    Ok(orchestrator.register_node(Vec::<String>::new(), BTreeMap::new())?)
}

/// Poll one task for `node` and complete it with `{"task": <task_id>}`.
///
/// Returns the task id that ran, or `None` if nothing was ready.
pub async fn complete_next(
    orchestrator: &Orchestrator<MemoryStore>,
    node: &NodeId,
) -> Result<Option<String>> {
    let Some(assignment) = orchestrator.poll_tasks(node, 1).await?.pop() else {
        return Ok(None);
    };
    let task_id = assignment.task.task_id.to_string();
    orchestrator
        .report_task_result(
            &assignment.task.handle,
            TaskOutcome::Completed {
                result: json!({ "task": task_id }),
            },
        )
        .await?;
    Ok(Some(task_id))
}

/// Complete tasks with `node` until nothing is ready. Returns the task ids in
/// the order they ran.
pub async fn drain(
    orchestrator: &Orchestrator<MemoryStore>,
    node: &NodeId,
) -> Result<Vec<String>> {
    let mut ran = Vec::new();
    while let Some(task_id) = complete_next(orchestrator, node).await? {
        ran.push(task_id);
        if ran.len() > 100 {
            return Err(anyhow!("workflow never settled"));
        }
    }
    Ok(ran)
}

pub async fn state_of(
    orchestrator: &Orchestrator<MemoryStore>,
    workflow: &WorkflowRef,
) -> Result<WorkflowSnapshot> {
    Ok(orchestrator.get_workflow_state(workflow).await?)
}

/// Push-capable node that accepts every offer and forwards it to the test.
pub struct ChannelNode {
    tx: mpsc::UnboundedSender<TaskAssignment>,
}

impl ChannelNode {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TaskAssignment>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl NodeClient for ChannelNode {
    async fn offer(&self, assignment: &TaskAssignment) -> eventflow::Result<bool> {
        Ok(self.tx.send(assignment.clone()).is_ok())
    }
}

/// Push-capable node that rejects every offer.
#[derive(Default)]
pub struct BusyNode {
    pub offers: Mutex<Vec<TaskAssignment>>,
}

#[async_trait]
impl NodeClient for BusyNode {
    async fn offer(&self, assignment: &TaskAssignment) -> eventflow::Result<bool> {
        self.offers
            .lock()
            .map_err(|_| eventflow::Error::LockPoisoned("busy node offers"))?
            .push(assignment.clone());
        Ok(false)
    }
}
