//! Error types for the data model

use crate::workflow::WorkflowStatus;

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Entity id
        id: String,
    },

    /// Write conflicts with existing state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend unavailable or write failed
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Value could not be (de)serialized
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Create a not-found error
    #[inline]
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether retrying the operation could succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Execution plan and workflow lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// Phase requires itself or a later phase
    #[error("phase {phase} requires phase {requires}, which is not earlier")]
    ForwardReference {
        /// Offending phase
        phase: u32,
        /// Prerequisite number
        requires: u32,
    },

    /// Two phases share a number
    #[error("duplicate phase number {0}")]
    DuplicatePhase(u32),

    /// Workflow status transition breaks monotonicity
    #[error("illegal workflow transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current status
        from: WorkflowStatus,
        /// Requested status
        to: WorkflowStatus,
    },
}

/// Message delivery errors
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Recipient queue does not accept work
    #[error("recipient unavailable: {0}")]
    Unavailable(String),

    /// Delivery was rejected
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let err = StoreError::not_found("task", "abc");
        assert_eq!(err.to_string(), "task not found: abc");
        assert!(!err.is_retryable());
        assert!(StoreError::Unavailable("down".into()).is_retryable());
    }

    #[test]
    fn plan_error_display() {
        let err = PlanError::ForwardReference {
            phase: 2,
            requires: 3,
        };
        assert!(err.to_string().contains("phase 2 requires phase 3"));
    }
}
