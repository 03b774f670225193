//! Integration tests for PgStore.

use std::time::Duration;

use eventflow::store::{
    AppendOutcome, BeginResult, EventStore, ProjectionStore, SnapshotStore, StoredSnapshot,
    UnitOfWork, WorkflowFilter, WorkflowQueryStore,
};
use eventflow::{Error, PgStore, WorkflowRef};
use serde_json::json;
use test_utils::db_test;
use time::OffsetDateTime;

use crate::support::db::{
    backdate_terminal, count_events, event_count_column, stored_event_types,
};
use crate::support::helpers::{append, paused};

fn order(id: &str) -> WorkflowRef {
    WorkflowRef::new("order", id)
}

async fn begin_active<'a>(
    store: &'a PgStore,
    workflow: &WorkflowRef,
) -> anyhow::Result<<PgStore as EventStore>::UnitOfWork<'a>> {
    match store.begin(workflow).await? {
        BeginResult::Active { uow } => Ok(uow),
        BeginResult::Terminal => Err(anyhow::anyhow!("expected {workflow} to be active")),
    }
}

// =============================================================================
// Unit of work
// =============================================================================

db_test!(appends_are_contiguous_and_visible_after_commit, |pool| {
    let store = PgStore::new(pool.clone());
    let workflow = order("o-1");

    let mut uow = begin_active(&store, &workflow).await?;
    assert_eq!(uow.last_sequence(), 0);
    uow.append(1, paused("a")).await?;
    uow.append(2, paused("b")).await?;
    assert_eq!(count_events(pool, &workflow).await?, 0);
    let committed = uow.commit().await?;
    assert_eq!(committed.len(), 2);

    append(&store, &workflow, &["c"]).await?;

    let events = store.read_events(&workflow, 1, None).await?;
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, [1, 2, 3]);
    assert_eq!(events[0], committed[0]);
    assert_eq!(
        stored_event_types(pool, &workflow).await?,
        ["workflow.paused"; 3]
    );
    assert_eq!(event_count_column(pool, &workflow).await?, Some(3));
    Ok(())
});

db_test!(ranged_reads_are_inclusive, |pool| {
    let store = PgStore::new(pool.clone());
    let workflow = order("o-1");
    append(&store, &workflow, &["a", "b", "c", "d", "e"]).await?;

    let events = store.read_events(&workflow, 2, Some(4)).await?;
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, [2, 3, 4]);
    assert!(store.read_events(&workflow, 6, None).await?.is_empty());
    Ok(())
});

db_test!(dropped_units_of_work_leave_no_trace, |pool| {
    let store = PgStore::new(pool.clone());
    let workflow = order("o-1");
    {
        let mut uow = begin_active(&store, &workflow).await?;
        uow.append(1, paused("a")).await?;
    }
    assert_eq!(count_events(pool, &workflow).await?, 0);
    assert!(store.workflow_summary(&workflow).await?.is_none());
    Ok(())
});

db_test!(out_of_order_appends_are_rejected, |pool| {
    let store = PgStore::new(pool.clone());
    let workflow = order("o-1");
    append(&store, &workflow, &["a"]).await?;

    let mut uow = begin_active(&store, &workflow).await?;
    let err = uow.append(3, paused("b")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::SequenceConflict {
            expected: 3,
            actual: 1,
            ..
        }
    ));
    Ok(())
});

db_test!(idempotency_keys_resolve_to_the_first_event, |pool| {
    let store = PgStore::new(pool.clone());
    let workflow = order("o-1");
    append(&store, &workflow, &["a", "b"]).await?;

    let mut uow = begin_active(&store, &workflow).await?;
    let outcome = uow.append(3, paused("b")).await?;
    assert_eq!(outcome, AppendOutcome::Duplicate { sequence: 2 });
    uow.append(3, paused("c")).await?;
    let outcome = uow.append(4, paused("c")).await?;
    assert_eq!(outcome, AppendOutcome::Duplicate { sequence: 3 });
    uow.commit().await?;

    assert_eq!(store.find_idempotency_key(&workflow, "c").await?, Some(3));
    assert_eq!(store.find_idempotency_key(&workflow, "z").await?, None);
    assert_eq!(
        store.find_idempotency_key(&order("o-2"), "a").await?,
        None
    );
    Ok(())
});

db_test!(terminal_instances_refuse_new_units_of_work, |pool| {
    let store = PgStore::new(pool.clone());
    let workflow = order("o-1");

    let mut uow = begin_active(&store, &workflow).await?;
    uow.append(1, paused("a")).await?;
    uow.mark_terminal();
    uow.commit().await?;

    assert!(matches!(store.begin(&workflow).await?, BeginResult::Terminal));
    let summary = store
        .workflow_summary(&workflow)
        .await?
        .expect("summary row exists");
    assert!(summary.terminal_at.is_some());
    assert_eq!(summary.event_count, 1);
    Ok(())
});

db_test!(concurrent_writers_are_serialized, |pool| {
    let store = PgStore::new(pool.clone());
    let workflow = order("o-1");

    let mut handles = Vec::new();
    for n in 0..8 {
        let store = store.clone();
        let workflow = workflow.clone();
        handles.push(tokio::spawn(async move {
            let key = format!("writer-{n}");
            append(&store, &workflow, &[key.as_str()]).await
        }));
    }
    for handle in handles {
        handle.await??;
    }

    let events = store.read_events(&workflow, 1, None).await?;
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=8).collect::<Vec<u64>>());
    Ok(())
});

// =============================================================================
// Feed
// =============================================================================

db_test!(feed_follows_commit_order_across_instances, |pool| {
    let store = PgStore::new(pool.clone());
    append(&store, &order("o-1"), &["a", "b"]).await?;
    append(&store, &order("o-2"), &["a"]).await?;
    append(&store, &order("o-1"), &["c"]).await?;

    let feed = store.fetch_events_since(0, 100).await?;
    let positions: Vec<i64> = feed.iter().map(|e| e.global_sequence).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    let order_of_commits: Vec<(String, u64)> = feed
        .iter()
        .map(|e| (e.event.instance_id.to_string(), e.event.sequence))
        .collect();
    assert_eq!(
        order_of_commits,
        [
            ("o-1".to_owned(), 1),
            ("o-1".to_owned(), 2),
            ("o-2".to_owned(), 1),
            ("o-1".to_owned(), 3),
        ]
    );

    let tail = store.fetch_events_since(positions[1], 100).await?;
    assert_eq!(tail.len(), 2);
    let page = store.fetch_events_since(0, 3).await?;
    assert_eq!(page.len(), 3);
    Ok(())
});

db_test!(projection_positions_round_trip, |pool| {
    let store = PgStore::new(pool.clone());
    assert_eq!(store.load_projection_position("audit").await?, 0);

    store.store_projection_position("audit", 7).await?;
    store.store_projection_position("audit", 9).await?;
    store.store_projection_position("billing", 2).await?;

    assert_eq!(store.load_projection_position("audit").await?, 9);
    assert_eq!(store.load_projection_position("billing").await?, 2);
    Ok(())
});

// =============================================================================
// Snapshots
// =============================================================================

db_test!(snapshots_only_move_forward, |pool| {
    let store = PgStore::new(pool.clone());
    let workflow = order("o-1");
    let snapshot = |sequence: u64| StoredSnapshot {
        workflow_type: "order".into(),
        instance_id: "o-1".into(),
        sequence,
        state: json!({ "at": sequence }),
        created_at: OffsetDateTime::now_utc(),
    };

    assert!(store.load_snapshot(&workflow).await?.is_none());
    store.save_snapshot(snapshot(5)).await?;
    store.save_snapshot(snapshot(3)).await?;

    let stored = store
        .load_snapshot(&workflow)
        .await?
        .expect("snapshot saved");
    assert_eq!(stored.sequence, 5);
    assert_eq!(stored.state, json!({ "at": 5 }));

    store.save_snapshot(snapshot(8)).await?;
    let stored = store
        .load_snapshot(&workflow)
        .await?
        .expect("snapshot saved");
    assert_eq!(stored.sequence, 8);
    Ok(())
});

// =============================================================================
// Queries and retention
// =============================================================================

db_test!(listing_honours_filters_and_paging, |pool| {
    let store = PgStore::new(pool.clone());
    append(&store, &order("o-1"), &["a"]).await?;
    append(&store, &WorkflowRef::new("refund", "r-1"), &["a"]).await?;
    let mut uow = begin_active(&store, &order("o-2")).await?;
    uow.append(1, paused("a")).await?;
    uow.mark_terminal();
    uow.commit().await?;

    let all = store
        .list_workflows(&WorkflowFilter::default(), 10, 0)
        .await?;
    assert_eq!(all.len(), 3);

    let orders = store
        .list_workflows(&WorkflowFilter::default().of_type("order"), 10, 0)
        .await?;
    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|s| s.workflow_type == "order"));

    let active = store
        .list_workflows(&WorkflowFilter::active(), 10, 0)
        .await?;
    let mut active: Vec<String> = active.iter().map(|s| s.instance_id.to_string()).collect();
    active.sort();
    assert_eq!(active, ["o-1", "r-1"]);

    let page = store
        .list_workflows(&WorkflowFilter::default(), 2, 2)
        .await?;
    assert_eq!(page.len(), 1);
    Ok(())
});

db_test!(expired_terminal_instances_are_tombstoned_once, |pool| {
    let store = PgStore::new(pool.clone());
    let finished = order("o-1");
    let recent = order("o-2");
    for workflow in [&finished, &recent] {
        let mut uow = begin_active(&store, workflow).await?;
        uow.append(1, paused("a")).await?;
        uow.mark_terminal();
        uow.commit().await?;
    }
    append(&store, &order("o-3"), &["a"]).await?;
    backdate_terminal(pool, &finished, 3600).await?;

    let cutoff = OffsetDateTime::now_utc() - Duration::from_secs(60);
    let retired = store.tombstone_expired(cutoff, 10).await?;
    assert_eq!(retired, [finished.clone()]);
    assert!(store.tombstone_expired(cutoff, 10).await?.is_empty());

    let summary = store
        .workflow_summary(&finished)
        .await?
        .expect("summary row exists");
    assert!(summary.tombstoned_at.is_some());
    assert_eq!(count_events(pool, &finished).await?, 1);

    let listed = store
        .list_workflows(&WorkflowFilter::default(), 10, 0)
        .await?;
    assert_eq!(listed.len(), 2);
    let with_tombstoned = WorkflowFilter {
        include_tombstoned: true,
        ..WorkflowFilter::default()
    };
    assert_eq!(store.list_workflows(&with_tombstoned, 10, 0).await?.len(), 3);
    Ok(())
});
