//! Raw SQL queries for asserting on what PgStore actually wrote.

use anyhow::Result;
use eventflow::WorkflowRef;
use sqlx::PgPool;

pub async fn count_events(pool: &PgPool, workflow: &WorkflowRef) -> Result<i64> {
    let count = sqlx::query_scalar(
        r#"SELECT COUNT(*) FROM eventflow.events
           WHERE workflow_type = $1 AND instance_id = $2"#,
    )
    .bind(workflow.workflow_type())
    .bind(workflow.instance_id().as_str())
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn event_count_column(pool: &PgPool, workflow: &WorkflowRef) -> Result<Option<i64>> {
    let count = sqlx::query_scalar(
        r#"SELECT event_count FROM eventflow.workflow_instances
           WHERE workflow_type = $1 AND instance_id = $2"#,
    )
    .bind(workflow.workflow_type())
    .bind(workflow.instance_id().as_str())
    .fetch_optional(pool)
    .await?;
    Ok(count)
}

/// Payload `type` tags in sequence order.
pub async fn stored_event_types(pool: &PgPool, workflow: &WorkflowRef) -> Result<Vec<String>> {
    let types = sqlx::query_scalar(
        r#"SELECT payload->'payload'->>'type' FROM eventflow.events
           WHERE workflow_type = $1 AND instance_id = $2
           ORDER BY sequence"#,
    )
    .bind(workflow.workflow_type())
    .bind(workflow.instance_id().as_str())
    .fetch_all(pool)
    .await?;
    Ok(types)
}

/// Backdate an instance's terminal timestamp, for retention tests.
pub async fn backdate_terminal(pool: &PgPool, workflow: &WorkflowRef, secs: i64) -> Result<()> {
    sqlx::query(
        r#"UPDATE eventflow.workflow_instances
           SET terminal_at = terminal_at - make_interval(secs => $3)
           WHERE workflow_type = $1 AND instance_id = $2"#,
    )
    .bind(workflow.workflow_type())
    .bind(workflow.instance_id().as_str())
    .bind(secs as f64)
    .execute(pool)
    .await?;
    Ok(())
}
