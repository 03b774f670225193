//! Task configuration, status, and dependency-graph validation.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    scheduler::RetryPolicy,
};

/// Identifier of a task within one workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What kind of work a task represents.
///
/// - `Compute`, `Effect`, `Parallel` and `Sequential` are dispatched to
///   nodes. The type is forwarded so nodes can route the work; ordering
///   comes from dependencies alone.
/// - `Decision` is dispatched too, but its result may name downstream tasks
///   to skip (`{"skip": ["task-a", ...]}`).
/// - `Wait` is never dispatched. It completes when signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Compute,
    Effect,
    Decision,
    Wait,
    Parallel,
    Sequential,
}

impl TaskType {
    /// Whether tasks of this type are handed to execution nodes.
    pub fn is_dispatched(self) -> bool {
        !matches!(self, TaskType::Wait)
    }
}

/// Scheduling priority. Higher priorities are dequeued first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Base weight used by the aging queue.
    pub fn weight(self) -> u32 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Normal => 100,
            TaskPriority::High => 200,
            TaskPriority::Critical => 300,
        }
    }
}

/// Per-task execution timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Wall-clock budget for one attempt, measured from dispatch. An attempt
    /// that exceeds it fails with `timed_out` set and consumes retry budget.
    /// Without one, an expired lease releases the task without penalty.
    #[serde(default)]
    pub execution: Option<Duration>,
}

/// Static configuration of one task in a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfiguration {
    pub task_id: TaskId,
    pub task_type: TaskType,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Resources consumed on the executing node while the task runs.
    #[serde(default)]
    pub resource_needs: BTreeMap<String, u64>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Opaque parameters forwarded to the executing node.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl TaskConfiguration {
    pub fn new(task_id: impl Into<TaskId>, task_type: TaskType) -> Self {
        Self {
            task_id: task_id.into(),
            task_type,
            dependencies: BTreeSet::new(),
            required_capabilities: BTreeSet::new(),
            resource_needs: BTreeMap::new(),
            retry_policy: RetryPolicy::default(),
            timeout_policy: TimeoutPolicy::default(),
            priority: TaskPriority::default(),
            parameters: serde_json::Value::Null,
        }
    }

    pub fn depends_on(mut self, task_id: impl Into<TaskId>) -> Self {
        self.dependencies.insert(task_id.into());
        self
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn needs(mut self, resource: impl Into<String>, amount: u64) -> Self {
        self.resource_needs.insert(resource.into(), amount);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_policy.execution = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Runtime status of a task within an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Dependencies satisfied, not yet dispatched.
    Pending,
    /// At least one dependency has not succeeded yet.
    WaitingForDependency,
    /// Handed to a node.
    Running,
    /// Failed with retry budget left; eligible again after backoff.
    Retrying,
    Completed,
    /// Failed with the retry budget exhausted.
    Failed,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }

    /// Whether downstream tasks may consider this dependency satisfied.
    pub fn is_success(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Skipped)
    }
}

/// Check that a task graph has unique ids, known dependencies, and no cycles.
///
/// Cycles are found with Kahn's algorithm; the reported task is the
/// smallest id left unresolved.
pub fn validate_task_graph(tasks: &[TaskConfiguration]) -> Result<()> {
    let mut indegree: HashMap<&TaskId, usize> = HashMap::with_capacity(tasks.len());
    for task in tasks {
        if task.task_id.as_str().is_empty() {
            return Err(Error::Validation("task id must not be empty".into()));
        }
        if indegree.insert(&task.task_id, 0).is_some() {
            return Err(Error::Validation(format!(
                "duplicate task id {}",
                task.task_id
            )));
        }
    }

    let mut dependents: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
    for task in tasks {
        for dependency in &task.dependencies {
            if dependency == &task.task_id {
                return Err(Error::DependencyCycle {
                    task_id: task.task_id.to_string(),
                });
            }
            if !indegree.contains_key(dependency) {
                return Err(Error::Validation(format!(
                    "task {} depends on unknown task {}",
                    task.task_id, dependency
                )));
            }
            dependents.entry(dependency).or_default().push(&task.task_id);
        }
        if let Some(count) = indegree.get_mut(&task.task_id) {
            *count = task.dependencies.len();
        }
    }

    let mut ready: Vec<&TaskId> = indegree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut resolved = 0usize;
    while let Some(id) = ready.pop() {
        resolved += 1;
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(count) = indegree.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.push(*dependent);
                }
            }
        }
    }

    if resolved == tasks.len() {
        return Ok(());
    }

    let stuck = indegree
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(id, _)| id)
        .min()
        .map(ToString::to_string)
        .unwrap_or_default();
    Err(Error::DependencyCycle { task_id: stuck })
}
