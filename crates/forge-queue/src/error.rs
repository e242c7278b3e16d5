//! Error types for the task queue

use forge_model::WorkerClass;

/// Queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Queue is shutting down and accepts no work
    #[error("queue is shutting down")]
    ShuttingDown,

    /// Worker loops already running for the class
    #[error("workers already running for {0}")]
    AlreadyProcessing(WorkerClass),

    /// Policy rejected by validation
    #[error("invalid policy for {class}: {problems:?}")]
    InvalidPolicy {
        /// Worker class
        class: WorkerClass,
        /// Every problem found
        problems: Vec<String>,
    },
}

/// Failure returned by a job handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct JobError {
    /// Human-readable reason
    pub message: String,
    /// Whether the queue should schedule another attempt
    pub retryable: bool,
}

impl JobError {
    /// Failure that may clear on another attempt
    #[inline]
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Failure that will not clear on another attempt
    #[inline]
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}
