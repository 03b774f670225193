//! PostgreSQL store implementation.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use tracing::debug;

use super::{
    AppendOutcome, BeginResult, EventStore, ProjectionStore, SnapshotStore, StoredEvent,
    StoredSnapshot, UnitOfWork, WorkflowFilter, WorkflowInstanceSummary, WorkflowQueryStore,
};
use crate::error::{Error, Result};
use crate::event::{NewEvent, WorkflowEvent};
use crate::workflow::{InstanceId, WorkflowRef};

/// Advisory lock serializing feed inserts so `global_sequence` follows
/// commit order.
const FEED_LOCK: i64 = 0x6576_656e_7466_6c77;

/// PostgreSQL-backed store for production use.
///
/// Each unit of work is a transaction holding a transaction-scoped advisory
/// lock on its instance, so different instances commit concurrently while
/// writers to the same instance are serialized. Events are buffered in the
/// unit of work and inserted at commit under a second advisory lock, which
/// keeps the global feed gap-free for readers.
///
/// # Database Schema
///
/// Requires tables in the `eventflow` schema (see `migrations/`):
///
/// | Table                  | Purpose                                            |
/// |------------------------|----------------------------------------------------|
/// | `workflow_instances`   | Instance registry, terminal and tombstone markers  |
/// | `events`               | Append-only event log with `global_sequence`       |
/// | `snapshots`            | Latest snapshot per instance                       |
/// | `projection_positions` | Feed checkpoints                                   |
///
/// # Example
///
/// ```ignore
/// use eventflow::{Orchestrator, PgStore};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://...").await?;
/// let orchestrator = Orchestrator::builder(PgStore::new(pool))
///     .register(order_workflow())
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct WorkflowInstanceRow {
    workflow_type: String,
    instance_id: String,
    created_at: OffsetDateTime,
    event_count: i64,
    last_event_at: Option<OffsetDateTime>,
    terminal_at: Option<OffsetDateTime>,
    tombstoned_at: Option<OffsetDateTime>,
}

impl From<WorkflowInstanceRow> for WorkflowInstanceSummary {
    fn from(row: WorkflowInstanceRow) -> Self {
        Self {
            workflow_type: row.workflow_type,
            instance_id: InstanceId::from(row.instance_id),
            created_at: row.created_at,
            event_count: row.event_count.max(0) as u64,
            last_event_at: row.last_event_at,
            terminal_at: row.terminal_at,
            tombstoned_at: row.tombstoned_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    global_sequence: i64,
    workflow_type: String,
    instance_id: String,
    sequence: i64,
    payload: Value,
    created_at: OffsetDateTime,
}

impl EventRow {
    fn decode(self) -> Result<StoredEvent> {
        let EventRow {
            global_sequence,
            workflow_type,
            instance_id,
            sequence,
            payload,
            created_at,
        } = self;
        let event = serde_json::from_value(payload).map_err(|source| Error::EventDecoding {
            workflow: WorkflowRef::new(workflow_type, instance_id).to_string(),
            sequence: sequence as u64,
            source,
        })?;
        Ok(StoredEvent {
            global_sequence,
            event,
            created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    workflow_type: String,
    instance_id: String,
    sequence: i64,
    state: Value,
    created_at: OffsetDateTime,
}

const EVENT_COLUMNS: &str =
    "global_sequence, workflow_type, instance_id, sequence, payload, created_at";

impl PgStore {
    /// Create a new PostgreSQL store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn is_terminal<'e>(executor: impl PgExecutor<'e>, workflow: &WorkflowRef) -> Result<bool> {
    let terminal_at: Option<Option<OffsetDateTime>> = sqlx::query_scalar(
        r#"SELECT terminal_at FROM eventflow.workflow_instances
           WHERE workflow_type = $1 AND instance_id = $2"#,
    )
    .bind(workflow.workflow_type())
    .bind(workflow.instance_id().as_str())
    .fetch_optional(executor)
    .await?;
    Ok(terminal_at.flatten().is_some())
}

async fn read_events<'e>(
    executor: impl PgExecutor<'e>,
    workflow: &WorkflowRef,
    from_sequence: u64,
    to_sequence: Option<u64>,
) -> Result<Vec<WorkflowEvent>> {
    let rows: Vec<EventRow> = sqlx::query_as(&format!(
        r#"SELECT {EVENT_COLUMNS} FROM eventflow.events
           WHERE workflow_type = $1 AND instance_id = $2
             AND sequence >= $3 AND ($4::BIGINT IS NULL OR sequence <= $4)
           ORDER BY sequence ASC"#
    ))
    .bind(workflow.workflow_type())
    .bind(workflow.instance_id().as_str())
    .bind(from_sequence as i64)
    .bind(to_sequence.map(|s| s as i64))
    .fetch_all(executor)
    .await?;

    rows.into_iter()
        .map(|row| row.decode().map(|stored| stored.event))
        .collect()
}

async fn find_idempotency_key<'e>(
    executor: impl PgExecutor<'e>,
    workflow: &WorkflowRef,
    key: &str,
) -> Result<Option<u64>> {
    let sequence: Option<i64> = sqlx::query_scalar(
        r#"SELECT sequence FROM eventflow.events
           WHERE workflow_type = $1 AND instance_id = $2 AND idempotency_key = $3"#,
    )
    .bind(workflow.workflow_type())
    .bind(workflow.instance_id().as_str())
    .bind(key)
    .fetch_optional(executor)
    .await?;
    Ok(sequence.map(|s| s as u64))
}

impl EventStore for PgStore {
    type UnitOfWork<'a> = PgUnitOfWork<'a>;

    async fn begin<'a>(&'a self, workflow: &WorkflowRef) -> Result<BeginResult<PgUnitOfWork<'a>>> {
        if is_terminal(&self.pool, workflow).await? {
            return Ok(BeginResult::Terminal);
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), hashtext($2))")
            .bind(workflow.workflow_type())
            .bind(workflow.instance_id().as_str())
            .execute(&mut *tx)
            .await?;

        // Another writer may have finished the instance while we waited.
        if is_terminal(&mut *tx, workflow).await? {
            return Ok(BeginResult::Terminal);
        }

        let committed_sequence: i64 = sqlx::query_scalar(
            r#"SELECT COALESCE(MAX(sequence), 0) FROM eventflow.events
               WHERE workflow_type = $1 AND instance_id = $2"#,
        )
        .bind(workflow.workflow_type())
        .bind(workflow.instance_id().as_str())
        .fetch_one(&mut *tx)
        .await?;

        Ok(BeginResult::Active {
            uow: PgUnitOfWork {
                tx,
                workflow: workflow.clone(),
                committed_sequence: committed_sequence as u64,
                pending: Vec::new(),
                terminal: false,
            },
        })
    }

    async fn read_events(
        &self,
        workflow: &WorkflowRef,
        from_sequence: u64,
        to_sequence: Option<u64>,
    ) -> Result<Vec<WorkflowEvent>> {
        read_events(&self.pool, workflow, from_sequence, to_sequence).await
    }

    async fn find_idempotency_key(&self, workflow: &WorkflowRef, key: &str) -> Result<Option<u64>> {
        find_idempotency_key(&self.pool, workflow, key).await
    }

    async fn fetch_events_since(&self, after: i64, limit: u32) -> Result<Vec<StoredEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"SELECT {EVENT_COLUMNS} FROM eventflow.events
               WHERE global_sequence > $1
               ORDER BY global_sequence
               LIMIT $2"#
        ))
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::decode).collect()
    }
}

/// PostgreSQL unit of work.
///
/// Wraps a transaction whose instance lock is held until commit or drop.
pub struct PgUnitOfWork<'a> {
    tx: Transaction<'a, Postgres>,
    workflow: WorkflowRef,
    committed_sequence: u64,
    pending: Vec<WorkflowEvent>,
    terminal: bool,
}

impl UnitOfWork for PgUnitOfWork<'_> {
    fn workflow(&self) -> &WorkflowRef {
        &self.workflow
    }

    fn last_sequence(&self) -> u64 {
        self.pending
            .last()
            .map_or(self.committed_sequence, |e| e.sequence)
    }

    async fn load_events(&mut self, from_sequence: u64) -> Result<Vec<WorkflowEvent>> {
        read_events(&mut *self.tx, &self.workflow, from_sequence, None).await
    }

    async fn find_idempotency_key(&mut self, key: &str) -> Result<Option<u64>> {
        if let Some(event) = self.pending.iter().find(|e| e.idempotency_key == key) {
            return Ok(Some(event.sequence));
        }
        find_idempotency_key(&mut *self.tx, &self.workflow, key).await
    }

    async fn append(&mut self, expected_sequence: u64, event: NewEvent) -> Result<AppendOutcome> {
        if let Some(sequence) = self.find_idempotency_key(&event.idempotency_key).await? {
            return Ok(AppendOutcome::Duplicate { sequence });
        }

        let last = self.last_sequence();
        if expected_sequence != last + 1 {
            return Err(Error::SequenceConflict {
                workflow: self.workflow.to_string(),
                expected: expected_sequence,
                actual: last,
            });
        }

        let event = event.into_event(&self.workflow, expected_sequence);
        self.pending.push(event.clone());
        Ok(AppendOutcome::Appended(event))
    }

    fn mark_terminal(&mut self) {
        self.terminal = true;
    }

    async fn commit(mut self) -> Result<Vec<WorkflowEvent>> {
        if self.pending.is_empty() && !self.terminal {
            self.tx.commit().await?;
            return Ok(Vec::new());
        }

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(FEED_LOCK)
            .execute(&mut *self.tx)
            .await?;

        for event in &self.pending {
            let inserted = sqlx::query(
                r#"INSERT INTO eventflow.events
                   (event_id, workflow_type, instance_id, sequence, idempotency_key, payload, created_at)
                   VALUES ($1, $2, $3, $4, $5, $6, now())"#,
            )
            .bind(*event.event_id.as_uuid())
            .bind(&event.workflow_type)
            .bind(event.instance_id.as_str())
            .bind(event.sequence as i64)
            .bind(&event.idempotency_key)
            .bind(serde_json::to_value(event)?)
            .execute(&mut *self.tx)
            .await;

            match inserted {
                Ok(_) => {}
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    return Err(Error::SequenceConflict {
                        workflow: self.workflow.to_string(),
                        expected: event.sequence,
                        actual: self.committed_sequence,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        let terminal_at = self.terminal.then(OffsetDateTime::now_utc);
        sqlx::query(
            r#"INSERT INTO eventflow.workflow_instances
               (workflow_type, instance_id, event_count, last_event_at, terminal_at)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (workflow_type, instance_id) DO UPDATE
               SET event_count = eventflow.workflow_instances.event_count + EXCLUDED.event_count,
                   last_event_at = COALESCE(EXCLUDED.last_event_at, eventflow.workflow_instances.last_event_at),
                   terminal_at = COALESCE(eventflow.workflow_instances.terminal_at, EXCLUDED.terminal_at)"#,
        )
        .bind(self.workflow.workflow_type())
        .bind(self.workflow.instance_id().as_str())
        .bind(self.pending.len() as i64)
        .bind(self.pending.last().map(|e| e.timestamp))
        .bind(terminal_at)
        .execute(&mut *self.tx)
        .await?;

        self.tx.commit().await?;

        debug!(
            workflow = %self.workflow,
            appended = self.pending.len(),
            terminal = self.terminal,
            "Committed unit of work"
        );
        Ok(self.pending)
    }
}

impl SnapshotStore for PgStore {
    async fn save_snapshot(&self, snapshot: StoredSnapshot) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO eventflow.snapshots
               (workflow_type, instance_id, sequence, state, created_at)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (workflow_type, instance_id) DO UPDATE
               SET sequence = EXCLUDED.sequence,
                   state = EXCLUDED.state,
                   created_at = EXCLUDED.created_at
               WHERE eventflow.snapshots.sequence < EXCLUDED.sequence"#,
        )
        .bind(&snapshot.workflow_type)
        .bind(snapshot.instance_id.as_str())
        .bind(snapshot.sequence as i64)
        .bind(&snapshot.state)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_snapshot(&self, workflow: &WorkflowRef) -> Result<Option<StoredSnapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            r#"SELECT workflow_type, instance_id, sequence, state, created_at
               FROM eventflow.snapshots
               WHERE workflow_type = $1 AND instance_id = $2"#,
        )
        .bind(workflow.workflow_type())
        .bind(workflow.instance_id().as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| StoredSnapshot {
            workflow_type: row.workflow_type,
            instance_id: InstanceId::from(row.instance_id),
            sequence: row.sequence as u64,
            state: row.state,
            created_at: row.created_at,
        }))
    }
}

impl ProjectionStore for PgStore {
    async fn load_projection_position(&self, projection_name: &str) -> Result<i64> {
        let position: Option<i64> = sqlx::query_scalar(
            r#"SELECT last_sequence FROM eventflow.projection_positions
               WHERE projection_name = $1"#,
        )
        .bind(projection_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(position.unwrap_or(0))
    }

    async fn store_projection_position(
        &self,
        projection_name: &str,
        global_sequence: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO eventflow.projection_positions (projection_name, last_sequence)
               VALUES ($1, $2)
               ON CONFLICT (projection_name) DO UPDATE
               SET last_sequence = EXCLUDED.last_sequence,
                   updated_at = now()"#,
        )
        .bind(projection_name)
        .bind(global_sequence)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkflowQueryStore for PgStore {
    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<WorkflowInstanceSummary>> {
        let mut builder = sqlx::QueryBuilder::new(
            r#"
            SELECT workflow_type, instance_id, created_at, event_count,
                   last_event_at, terminal_at, tombstoned_at
            FROM eventflow.workflow_instances
            WHERE TRUE
            "#,
        );

        if let Some(workflow_type) = &filter.workflow_type {
            builder.push(" AND workflow_type = ");
            builder.push_bind(workflow_type);
        }
        if filter.active_only {
            builder.push(" AND terminal_at IS NULL");
        }
        if !filter.include_tombstoned {
            builder.push(" AND tombstoned_at IS NULL");
        }

        builder.push(" ORDER BY created_at, workflow_type, instance_id");
        builder.push(" LIMIT ");
        builder.push_bind(limit as i64);
        builder.push(" OFFSET ");
        builder.push_bind(offset as i64);

        let rows = builder
            .build_query_as::<WorkflowInstanceRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn workflow_summary(
        &self,
        workflow: &WorkflowRef,
    ) -> Result<Option<WorkflowInstanceSummary>> {
        let row: Option<WorkflowInstanceRow> = sqlx::query_as(
            r#"SELECT workflow_type, instance_id, created_at, event_count,
                      last_event_at, terminal_at, tombstoned_at
               FROM eventflow.workflow_instances
               WHERE workflow_type = $1 AND instance_id = $2"#,
        )
        .bind(workflow.workflow_type())
        .bind(workflow.instance_id().as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn tombstone_expired(
        &self,
        terminal_before: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<WorkflowRef>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"UPDATE eventflow.workflow_instances
               SET tombstoned_at = now()
               WHERE (workflow_type, instance_id) IN (
                   SELECT workflow_type, instance_id
                   FROM eventflow.workflow_instances
                   WHERE tombstoned_at IS NULL AND terminal_at < $1
                   ORDER BY terminal_at
                   LIMIT $2
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING workflow_type, instance_id"#,
        )
        .bind(terminal_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(workflow_type, instance_id)| WorkflowRef::new(workflow_type, instance_id))
            .collect())
    }
}
