//! Transport boundary.
//!
//! Committed events are published as opaque JSON bytes, one logical topic
//! per workflow type, partitioned by instance id so consumers see each
//! instance's events in order. The broker itself is an external
//! collaborator behind [`Transport`]; [`InMemoryTransport`] is the
//! in-process implementation used by tests and single-node deployments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::Result;
use crate::event::WorkflowEvent;

/// Topic prefix for workflow event topics.
pub const TOPIC_PREFIX: &str = "workflow.";

/// Topic carrying the events of `workflow_type`.
pub fn topic_for(workflow_type: &str) -> String {
    format!("{TOPIC_PREFIX}{workflow_type}")
}

/// One message on the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMessage {
    pub topic: String,
    /// Messages with the same key are delivered in publish order.
    pub partition_key: String,
    pub payload: Vec<u8>,
}

impl TopicMessage {
    /// Encode a committed event.
    pub fn from_event(event: &WorkflowEvent) -> Result<Self> {
        Ok(Self {
            topic: topic_for(&event.workflow_type),
            partition_key: event.instance_id.to_string(),
            payload: serde_json::to_vec(event)?,
        })
    }

    /// Decode the event carried by this message.
    pub fn decode_event(&self) -> Result<WorkflowEvent> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// At-least-once message publisher.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish one message.
    ///
    /// Failures should be reported as
    /// [`Error::TransportUnavailable`](crate::Error::TransportUnavailable) so
    /// callers retry them.
    async fn publish(&self, message: TopicMessage) -> Result<()>;
}

/// In-process transport over a tokio broadcast channel.
///
/// Subscribers receive every message published after they subscribe.
/// A subscriber that falls more than `capacity` messages behind loses the
/// oldest ones.
#[derive(Clone)]
pub struct InMemoryTransport {
    tx: broadcast::Sender<TopicMessage>,
}

impl InMemoryTransport {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopicMessage> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, message: TopicMessage) -> Result<()> {
        trace!(topic = %message.topic, partition_key = %message.partition_key, "Publishing message");
        // Publishing with nobody listening is not a failure.
        let _ = self.tx.send(message);
        Ok(())
    }
}

/// Transport that drops every message, for engines nobody listens to.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn publish(&self, _message: TopicMessage) -> Result<()> {
        Ok(())
    }
}
