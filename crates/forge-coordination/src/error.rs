//! Error types for the dependency coordinator

use forge_model::{SinkError, StoreError, TaskId, WorkflowId};

/// Coordination errors
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// No coordination registered for the workflow
    #[error("no coordination for workflow {0}")]
    UnknownWorkflow(WorkflowId),

    /// A coordination already exists for the workflow
    #[error("workflow {0} is already coordinated")]
    AlreadyCoordinated(WorkflowId),

    /// Task is not part of the coordination
    #[error("task {task_id} is not part of workflow {workflow_id}")]
    UnknownTask {
        /// Workflow
        workflow_id: WorkflowId,
        /// Task
        task_id: TaskId,
    },

    /// Task listed twice
    #[error("task {0} listed more than once")]
    DuplicateTask(TaskId),

    /// Dependency outside the task set
    #[error("task {task_id} depends on unknown task {dependency}")]
    UnknownDependency {
        /// Dependent task
        task_id: TaskId,
        /// Missing dependency
        dependency: TaskId,
    },

    /// Dependency cycle under the reject policy
    #[error("dependency cycle: {}", render_cycle(.cycle))]
    CycleDetected {
        /// Tasks on the cycle, first repeated at the end
        cycle: Vec<TaskId>,
    },

    /// Persistence failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Message delivery failure
    #[error("delivery error: {0}")]
    Delivery(#[from] SinkError),
}

impl CoordinationError {
    /// Whether retrying the call may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinationError::Store(e) => e.is_retryable(),
            CoordinationError::Delivery(SinkError::Unavailable(_)) => true,
            _ => false,
        }
    }
}

fn render_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_renders_as_path() {
        let a = TaskId::new();
        let b = TaskId::new();
        let err = CoordinationError::CycleDetected { cycle: vec![a, b, a] };
        assert_eq!(err.to_string(), format!("dependency cycle: {a} -> {b} -> {a}"));
    }
}
