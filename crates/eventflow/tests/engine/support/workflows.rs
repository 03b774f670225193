//! Workflow definitions shared by the engine tests.

use std::time::Duration;

use eventflow::{
    CompensationPolicy, RetryPolicy, TaskConfiguration, TaskType, WorkflowDefinition,
};

fn task(id: &str, task_type: TaskType) -> TaskConfiguration {
    TaskConfiguration::new(id, task_type).with_retry_policy(RetryPolicy::immediate(3))
}

/// `validate → charge → ship`.
pub fn order() -> WorkflowDefinition {
    WorkflowDefinition::new("order")
        .with_task(task("validate", TaskType::Compute))
        .with_task(task("charge", TaskType::Effect).depends_on("validate"))
        .with_task(task("ship", TaskType::Effect).depends_on("charge"))
}

/// One task `t1` with an immediate retry policy of `max_attempts`.
pub fn single(workflow_type: &str, max_attempts: u32) -> WorkflowDefinition {
    WorkflowDefinition::new(workflow_type).with_task(
        TaskConfiguration::new("t1", TaskType::Compute)
            .with_retry_policy(RetryPolicy::immediate(max_attempts)),
    )
}

/// `t1` backed by a `refund` compensation task.
pub fn compensated(workflow_type: &str) -> WorkflowDefinition {
    single(workflow_type, 3).with_compensation(CompensationPolicy::new([task(
        "refund",
        TaskType::Effect,
    )]))
}

/// Five compute tasks in a chain: `s1 → s2 → … → s5`.
pub fn pipeline() -> WorkflowDefinition {
    (1..=5).fold(WorkflowDefinition::new("pipeline"), |definition, n| {
        let step = task(&format!("s{n}"), TaskType::Compute);
        let step = if n > 1 {
            step.depends_on(format!("s{}", n - 1))
        } else {
            step
        };
        definition.with_task(step)
    })
}

/// A human `review` (wait task) gating `publish`.
pub fn approval() -> WorkflowDefinition {
    WorkflowDefinition::new("approval")
        .with_task(task("review", TaskType::Wait))
        .with_task(task("publish", TaskType::Compute).depends_on("review"))
}

/// A `route` decision choosing between `fast` and `slow`.
pub fn routing() -> WorkflowDefinition {
    WorkflowDefinition::new("routing")
        .with_task(task("route", TaskType::Decision))
        .with_task(task("fast", TaskType::Compute).depends_on("route"))
        .with_task(task("slow", TaskType::Compute).depends_on("route"))
}

/// `single` with an overall deadline.
pub fn deadline(timeout: Duration) -> WorkflowDefinition {
    single("deadline", 3).with_timeout(timeout)
}
