//! Workflow identity, lifecycle states, and definitions.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    task::{TaskConfiguration, validate_task_graph},
};

/// A workflow instance identifier (business key).
///
/// Use natural business keys (order_id, listing_id) rather than synthetic UUIDs.
/// This makes correlation intuitive and idempotency natural.
///
/// # Example
///
/// ```
/// use eventflow::InstanceId;
///
/// let id = InstanceId::new("ord-123");
/// assert_eq!(id.as_str(), "ord-123");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Create a new instance ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, time-ordered instance ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Consume the wrapper and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Borrow the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Reference to a specific workflow instance.
///
/// Combines workflow type and instance ID into the key every log, lock, and
/// projection is partitioned by.
///
/// # Example
///
/// ```
/// use eventflow::WorkflowRef;
///
/// let workflow = WorkflowRef::new("order", "ord-123");
/// assert_eq!(workflow.workflow_type(), "order");
/// assert_eq!(workflow.instance_id().as_str(), "ord-123");
/// assert_eq!(format!("{}", workflow), "order:ord-123");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkflowRef {
    workflow_type: String,
    instance_id: InstanceId,
}

impl WorkflowRef {
    /// Create a new workflow reference.
    pub fn new(workflow_type: impl Into<String>, instance_id: impl Into<InstanceId>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            instance_id: instance_id.into(),
        }
    }

    /// The workflow type (e.g., "order", "inventory").
    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    /// The instance ID (business key).
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }
}

impl fmt::Display for WorkflowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.workflow_type, self.instance_id)
    }
}

impl<S: Into<String>> From<(&'static str, S)> for WorkflowRef {
    fn from((workflow_type, instance_id): (&'static str, S)) -> Self {
        Self::new(workflow_type, instance_id.into())
    }
}

/// Lifecycle state of a workflow instance.
///
/// `Completed`, `Failed` and `Cancelled` are terminal: once reached, the log
/// accepts no further events for the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowState {
    Pending,
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Retrying,
    WaitingForDependency,
    Compensating,
    Compensated,
}

impl WorkflowState {
    /// All states, in declaration order.
    pub const ALL: [WorkflowState; 12] = [
        WorkflowState::Pending,
        WorkflowState::Initializing,
        WorkflowState::Running,
        WorkflowState::Paused,
        WorkflowState::Completed,
        WorkflowState::Failed,
        WorkflowState::Cancelled,
        WorkflowState::Timeout,
        WorkflowState::Retrying,
        WorkflowState::WaitingForDependency,
        WorkflowState::Compensating,
        WorkflowState::Compensated,
    ];

    /// Whether the state admits no further events.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    /// Whether tasks of the instance may be handed to nodes in this state.
    pub fn is_dispatching(self) -> bool {
        matches!(
            self,
            WorkflowState::Running
                | WorkflowState::Retrying
                | WorkflowState::WaitingForDependency
                | WorkflowState::Compensating
        )
    }

    /// Stable wire name, e.g. `waitingForDependency`.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Initializing => "initializing",
            WorkflowState::Running => "running",
            WorkflowState::Paused => "paused",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
            WorkflowState::Timeout => "timeout",
            WorkflowState::Retrying => "retrying",
            WorkflowState::WaitingForDependency => "waitingForDependency",
            WorkflowState::Compensating => "compensating",
            WorkflowState::Compensated => "compensated",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-instance resource limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum number of tasks of one instance queued or running at once.
    /// `None` means unbounded.
    #[serde(default)]
    pub max_concurrent_tasks: Option<u32>,
}

impl ResourceLimits {
    /// Limit concurrently scheduled tasks.
    pub fn max_concurrent_tasks(limit: u32) -> Self {
        Self {
            max_concurrent_tasks: Some(limit),
        }
    }
}

/// Tasks run after a failure or timeout to undo completed work.
///
/// Compensation tasks form their own dependency graph and are scheduled
/// only once the instance enters `compensating`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompensationPolicy {
    pub tasks: Vec<TaskConfiguration>,
}

impl CompensationPolicy {
    /// Create a policy from compensation tasks.
    pub fn new(tasks: impl IntoIterator<Item = TaskConfiguration>) -> Self {
        Self {
            tasks: tasks.into_iter().collect(),
        }
    }
}

/// Static description of a workflow type: its task graph and policies.
///
/// # Example
///
/// ```
/// use eventflow::{TaskConfiguration, TaskType, WorkflowDefinition};
///
/// let definition = WorkflowDefinition::new("order")
///     .with_task(TaskConfiguration::new("validate", TaskType::Compute))
///     .with_task(TaskConfiguration::new("charge", TaskType::Effect).depends_on("validate"));
///
/// assert!(definition.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_type: String,
    pub tasks: Vec<TaskConfiguration>,
    #[serde(default)]
    pub compensation: Option<CompensationPolicy>,
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
}

impl WorkflowDefinition {
    /// Start a definition with no tasks.
    pub fn new(workflow_type: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            tasks: Vec::new(),
            compensation: None,
            timeout: None,
            resource_limits: ResourceLimits::default(),
        }
    }

    pub fn with_task(mut self, task: TaskConfiguration) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_compensation(mut self, policy: CompensationPolicy) -> Self {
        self.compensation = Some(policy);
        self
    }

    /// Overall deadline, measured from `workflow.started`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    /// Check that both task graphs are acyclic and internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.workflow_type.trim().is_empty() {
            return Err(crate::Error::Validation(
                "workflow type must not be empty".into(),
            ));
        }
        if self.tasks.is_empty() {
            return Err(crate::Error::Validation(format!(
                "workflow {} declares no tasks",
                self.workflow_type
            )));
        }
        if self.resource_limits.max_concurrent_tasks == Some(0) {
            return Err(crate::Error::Validation(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        validate_task_graph(&self.tasks)?;
        if let Some(compensation) = &self.compensation {
            validate_task_graph(&compensation.tasks)?;
            for task in &compensation.tasks {
                if self.tasks.iter().any(|t| t.task_id == task.task_id) {
                    return Err(crate::Error::Validation(format!(
                        "compensation task {} reuses a forward task id",
                        task.task_id
                    )));
                }
            }
        }
        Ok(())
    }
}
