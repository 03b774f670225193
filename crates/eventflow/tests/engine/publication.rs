//! Publishing committed events to the transport.

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use eventflow::{
    Error, InMemoryTransport, MemoryStore, Orchestrator, PUBLISH_CHECKPOINT, ProjectionStore,
    TopicMessage, Transport, WorkflowEvent,
};
use serde_json::json;
use tokio::sync::broadcast;

use crate::support::helpers::{drain, input, test_config, worker};
use crate::support::workflows::{approval, order};

/// Fails the first `failures` publishes, then forwards to an in-memory
/// transport.
struct FlakyTransport {
    failures: AtomicU32,
    inner: InMemoryTransport,
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn publish(&self, message: TopicMessage) -> eventflow::Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::TransportUnavailable("broker restarting".into()));
        }
        self.inner.publish(message).await
    }
}

fn drain_messages(rx: &mut broadcast::Receiver<TopicMessage>) -> Vec<TopicMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

#[tokio::test]
async fn committed_events_are_published_once() -> Result<()> {
    let transport = InMemoryTransport::default();
    let mut rx = transport.subscribe();
    let store = MemoryStore::new();
    let orchestrator = Orchestrator::builder(store.clone())
        .config(test_config())
        .register(order())
        .transport(transport)
        .build()?;

    orchestrator
        .start_workflow("order", "o-1", input(json!({})), None)
        .await?;
    assert_eq!(orchestrator.publish_pending().await?, 1);
    assert_eq!(orchestrator.publish_pending().await?, 0);

    let messages = drain_messages(&mut rx);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic, "workflow.order");
    assert_eq!(messages[0].partition_key, "o-1");
    assert_eq!(messages[0].decode_event()?.event_type(), "workflow.started");

    assert_eq!(store.load_projection_position(PUBLISH_CHECKPOINT).await?, 1);
    Ok(())
}

#[tokio::test]
async fn each_instance_is_published_in_order() -> Result<()> {
    let transport = InMemoryTransport::default();
    let mut rx = transport.subscribe();
    let orchestrator = Orchestrator::builder(MemoryStore::new())
        .config(test_config())
        .register(order())
        .register(approval())
        .transport(transport)
        .build()?;
    let node = worker(&orchestrator)?;

    orchestrator
        .start_workflow("order", "o-1", input(json!({})), None)
        .await?;
    orchestrator
        .start_workflow("approval", "a-1", input(json!({})), None)
        .await?;
    orchestrator
        .start_workflow("order", "o-2", input(json!({})), None)
        .await?;
    drain(&orchestrator, &node).await?;

    let mut published = 0;
    loop {
        let batch = orchestrator.publish_pending().await?;
        if batch == 0 {
            break;
        }
        published += batch;
    }

    let messages = drain_messages(&mut rx);
    assert_eq!(messages.len(), published);

    let events: Vec<WorkflowEvent> = messages
        .iter()
        .map(TopicMessage::decode_event)
        .collect::<eventflow::Result<_>>()?;
    for instance in ["o-1", "o-2", "a-1"] {
        let sequences: Vec<u64> = events
            .iter()
            .filter(|e| e.instance_id.as_str() == instance)
            .map(|e| e.sequence)
            .collect();
        let expected: Vec<u64> = (1..=sequences.len() as u64).collect();
        assert_eq!(sequences, expected, "instance {instance}");
    }
    assert!(
        messages
            .iter()
            .filter(|m| m.partition_key == "a-1")
            .all(|m| m.topic == "workflow.approval")
    );
    Ok(())
}

#[tokio::test]
async fn transient_transport_failures_are_retried() -> Result<()> {
    let inner = InMemoryTransport::default();
    let mut rx = inner.subscribe();
    let orchestrator = Orchestrator::builder(MemoryStore::new())
        .config(test_config())
        .register(order())
        .transport(FlakyTransport {
            failures: AtomicU32::new(1),
            inner,
        })
        .build()?;

    orchestrator
        .start_workflow("order", "o-1", input(json!({})), None)
        .await?;
    assert_eq!(orchestrator.publish_pending().await?, 1);
    assert_eq!(drain_messages(&mut rx).len(), 1);
    Ok(())
}

#[tokio::test]
async fn unpublished_events_are_kept_while_the_transport_is_down() -> Result<()> {
    let inner = InMemoryTransport::default();
    let mut rx = inner.subscribe();
    let store = MemoryStore::new();
    let orchestrator = Orchestrator::builder(store.clone())
        .config(test_config())
        .register(order())
        .transport(FlakyTransport {
            failures: AtomicU32::new(3),
            inner,
        })
        .build()?;

    orchestrator
        .start_workflow("order", "o-1", input(json!({})), None)
        .await?;

    let err = orchestrator.publish_pending().await.unwrap_err();
    assert!(matches!(err, Error::TransportUnavailable(_)));
    assert_eq!(store.load_projection_position(PUBLISH_CHECKPOINT).await?, 0);
    assert!(drain_messages(&mut rx).is_empty());

    assert_eq!(orchestrator.publish_pending().await?, 1);
    assert_eq!(drain_messages(&mut rx).len(), 1);
    Ok(())
}
