use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Result, anyhow};
use eventflow::store::{BeginResult, EventStore, UnitOfWork};
use eventflow::{
    EventKind, NewEvent, PgStore, RetryPolicy, RuntimeConfig, TaskConfiguration, TaskType,
    WorkflowDefinition, WorkflowEvent, WorkflowRef,
};

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("eventflow=debug")
        .try_init();
}

pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        worker_id: Some("pg-test".into()),
        retry_policy: RetryPolicy::immediate(3),
        dispatch_poll_interval: Duration::from_millis(20),
        maintenance_poll_interval: Duration::from_millis(50),
        publish_poll_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn paused(key: &str) -> NewEvent {
    NewEvent::new(EventKind::WorkflowPaused { reason: None }, key)
}

/// Append events with the given keys in one unit of work.
pub async fn append(
    store: &PgStore,
    workflow: &WorkflowRef,
    keys: &[&str],
) -> Result<Vec<WorkflowEvent>> {
    let BeginResult::Active { mut uow } = store.begin(workflow).await? else {
        return Err(anyhow!("{workflow} is terminal"));
    };
    for key in keys {
        let next = uow.last_sequence() + 1;
        uow.append(next, paused(key)).await?;
    }
    Ok(uow.commit().await?)
}

/// `validate → charge → ship`.
pub fn order() -> WorkflowDefinition {
    let task = |id: &str, task_type| {
        TaskConfiguration::new(id, task_type).with_retry_policy(RetryPolicy::immediate(3))
    };
    WorkflowDefinition::new("order")
        .with_task(task("validate", TaskType::Compute))
        .with_task(task("charge", TaskType::Effect).depends_on("validate"))
        .with_task(task("ship", TaskType::Effect).depends_on("charge"))
}

pub fn no_input() -> BTreeMap<String, serde_json::Value> {
    BTreeMap::new()
}
