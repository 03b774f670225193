//! Event-sourced workflow orchestration engine.
//!
//! Eventflow runs workflows of tasks across a fleet of worker nodes:
//!
//! - **Event sourcing**: every state change is an event in an append-only,
//!   per-instance log; state is a fold over that log
//! - **Explicit state machine**: lifecycle commands are validated against a
//!   fixed transition table before anything is written
//! - **Exactly-once transitions**: every event carries an idempotency key,
//!   so redelivered commands and node reports resolve to the original event
//! - **Capability-aware scheduling**: ready tasks are leased to nodes that
//!   have the required capabilities and spare capacity
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                          Orchestrator<S>                              │
//! │                                                                       │
//! │  callers ──► StateMachine ──► EventLog ──► Store (memory / postgres)  │
//! │                  │    ▲                         │                     │
//! │                  ▼    │                         ▼                     │
//! │  nodes ◄──► TaskScheduler ◄── Projector    Transport (publish)        │
//! │                  │                                                    │
//! │                  ▼                                                    │
//! │             NodeRegistry                                              │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! 1. A command is loaded against the latest [`WorkflowSnapshot`] under the
//!    instance's writer lock
//! 2. [`decide`] validates it and picks the root event
//! 3. The root event and the follow-ups it makes necessary are appended in
//!    one unit of work
//! 4. The scheduler re-queues whatever the new snapshot makes ready
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeMap;
//! use eventflow::{
//!     MemoryStore, Orchestrator, TaskConfiguration, TaskOutcome, TaskType, WorkflowDefinition,
//!     WorkflowState,
//! };
//! use serde_json::json;
//!
//! # async fn example() -> eventflow::Result<()> {
//! let orchestrator = Orchestrator::builder(MemoryStore::new())
//!     .register(
//!         WorkflowDefinition::new("thumbnail")
//!             .with_task(TaskConfiguration::new("resize", TaskType::Compute).requires("image")),
//!     )
//!     .build()?;
//!
//! let node = orchestrator.register_node(["image"], BTreeMap::new())?;
//! let workflow = orchestrator
//!     .start_workflow("thumbnail", "img-1", BTreeMap::new(), None)
//!     .await?;
//!
//! for assignment in orchestrator.poll_tasks(&node, 1).await? {
//!     orchestrator
//!         .report_task_result(&assignment.task.handle, TaskOutcome::Completed { result: json!("ok") })
//!         .await?;
//! }
//!
//! let snapshot = orchestrator.get_workflow_state(&workflow).await?;
//! assert_eq!(snapshot.state, WorkflowState::Completed);
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - `postgres`: enables [`PgStore`] for production use with PostgreSQL
//!
//! # Design Documentation
//!
//! See `DESIGN.md` for architectural decisions.

mod error;
mod event;
mod log;
pub mod machine;
mod orchestrator;
pub mod projection;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod store;
mod task;
pub mod transport;
mod workflow;

pub use error::{Error, ErrorKind, Result};
pub use event::{Causation, EventId, EventKind, NewEvent, WorkflowEvent, correlation_chain};
pub use log::EventLog;
pub use machine::{Command, Decision, StateMachine, Transition, TransitionOutcome, decide};
pub use orchestrator::{MaintenanceReport, Orchestrator, OrchestratorBuilder, PUBLISH_CHECKPOINT};
pub use projection::{
    Projection, ProjectionConfig, ProjectionWorker, Projector, TaskRecord, WorkflowSnapshot,
};
pub use registry::{
    HealthStatus, Heartbeat, NodeClient, NodeId, NodeRegistration, NodeRegistry, RegistryConfig,
};
pub use runtime::{RuntimeConfig, WorkflowRuntime};
pub use scheduler::{
    RetryPolicy, TaskAssignment, TaskError, TaskHandle, TaskOutcome, TaskScheduler,
};
#[cfg(feature = "postgres")]
pub use store::PgStore;
pub use store::{
    AppendOutcome, BeginResult, EventStore, MemoryStore, ProjectionStore, SnapshotStore, Store,
    StoredEvent, StoredSnapshot, UnitOfWork, WorkflowFilter, WorkflowInstanceSummary,
    WorkflowQueryStore,
};
pub use task::{
    TaskConfiguration, TaskId, TaskPriority, TaskStatus, TaskType, TimeoutPolicy,
};
pub use transport::{InMemoryTransport, NullTransport, TopicMessage, Transport};
pub use workflow::{
    CompensationPolicy, InstanceId, ResourceLimits, WorkflowDefinition, WorkflowRef,
    WorkflowState,
};
