//! Error types for Forge core
//!
//! [`ForgeError`] is the single error surfaced by the engine and the
//! orchestrator. Every component error nests through `#[from]`.

use crate::config::ConfigError;
use crate::producer::ProducerError;
use forge_contracts::ContractError;
use forge_coordination::CoordinationError;
use forge_governance::GovernanceError;
use forge_model::{PlanError, StoreError, TaskId, WorkflowId};
use forge_queue::QueueError;

/// Main Forge error type
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    /// Requirement rejected before planning
    #[error("invalid requirement: {0}")]
    Requirement(#[from] RequirementError),

    /// Persistence failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Plan or lifecycle rule broken
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    /// Contract registry failure
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),

    /// Governance failure
    #[error("governance error: {0}")]
    Governance(#[from] GovernanceError),

    /// Coordination failure
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// Queue failure
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Configuration rejected
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Producer failure
    #[error("producer error: {0}")]
    Producer(#[from] ProducerError),

    /// Record could not be serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No such workflow
    #[error("workflow not found: {0}")]
    UnknownWorkflow(WorkflowId),

    /// No such task
    #[error("task not found: {0}")]
    UnknownTask(TaskId),

    /// Task cannot start before its dependencies complete
    #[error("task {task_id} has unmet dependencies: {unmet:?}")]
    DependenciesUnmet {
        /// Task that was asked to start
        task_id: TaskId,
        /// Dependencies not yet completed
        unmet: Vec<TaskId>,
    },

    /// Workflow did not finish in time
    #[error("workflow {workflow_id} not finished after {waited_ms}ms")]
    Timeout {
        /// Workflow waited on
        workflow_id: WorkflowId,
        /// Time waited
        waited_ms: u64,
    },

    /// Orchestrator already started
    #[error("orchestrator already started")]
    AlreadyStarted,
}

impl ForgeError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Coordination(e) => e.is_retryable(),
            Self::Producer(e) => e.is_retryable(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Check if error is a validation failure
    #[inline]
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Requirement(_) | Self::Config(_) | Self::DependenciesUnmet { .. }
        )
    }
}

/// Requirement validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequirementError {
    /// Required fields are missing or blank
    #[error("missing fields: {}", missing.join(", "))]
    Invalid {
        /// Every missing field
        missing: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirement_error_lists_every_field() {
        let err = RequirementError::Invalid {
            missing: vec!["title".into(), "user_stories".into()],
        };
        assert_eq!(err.to_string(), "missing fields: title, user_stories");
        assert!(ForgeError::from(err).is_validation());
    }

    #[test]
    fn retryability_follows_the_source() {
        assert!(ForgeError::from(StoreError::Unavailable("down".into())).is_retryable());
        assert!(!ForgeError::from(StoreError::Conflict("dup".into())).is_retryable());
        assert!(ForgeError::from(ProducerError::Timeout { waited_ms: 10 }).is_retryable());
        assert!(!ForgeError::from(ProducerError::Fatal("bad".into())).is_retryable());
        assert!(!ForgeError::UnknownTask(TaskId::new()).is_retryable());
    }
}
