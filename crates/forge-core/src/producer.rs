//! Producer collaborator
//!
//! The engine never generates anything itself. A [`Producer`] first explains
//! what it is about to do, and only with an [`EmissionPermit`] for that
//! explanation may it produce the artifact.

use async_trait::async_trait;
use forge_coordination::SharedArtifact;
use forge_governance::{AgentExplanation, EmissionPermit, EntityRecord, SourceFile};
use forge_model::{JobPayload, TaskId, WorkerClass, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything a producer is told about one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionRequest {
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Task being produced
    pub task_id: TaskId,
    /// Feature the task belongs to
    pub feature_id: String,
    /// Class of the worker handling it
    pub worker_class: WorkerClass,
    /// Task title
    pub title: String,
    /// Attempt number (1-based)
    pub attempt: u32,
    /// Work order
    pub payload: JobPayload,
    /// Artifacts shared with this task by its dependencies
    pub shared: Vec<SharedArtifact>,
}

/// Produced artifact plus the material the pipeline checks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProducedArtifact {
    /// Generated source files
    pub files: Vec<SourceFile>,
    /// Entity instances to check against contracts
    pub entities: Vec<EntityRecord>,
    /// Resulting state, checked by invariants
    pub state: Value,
    /// Free-form metadata kept with the task result
    pub metadata: Value,
}

impl ProducedArtifact {
    /// Create an empty artifact
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With source file
    #[inline]
    #[must_use]
    pub fn with_file(mut self, file: SourceFile) -> Self {
        self.files.push(file);
        self
    }

    /// With entity instance
    #[inline]
    #[must_use]
    pub fn with_entity(mut self, entity: EntityRecord) -> Self {
        self.entities.push(entity);
        self
    }

    /// With resulting state
    #[inline]
    #[must_use]
    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }

    /// With metadata
    #[inline]
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Producer errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProducerError {
    /// Call did not return in time
    #[error("producer timed out after {waited_ms}ms")]
    Timeout {
        /// Time waited
        waited_ms: u64,
    },

    /// Failure expected to clear on retry
    #[error("transient producer failure: {0}")]
    Transient(String),

    /// Failure that will not clear on retry
    #[error("fatal producer failure: {0}")]
    Fatal(String),
}

impl ProducerError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Opaque generative backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Producer: Send + Sync {
    /// Explain the artifact about to be produced
    async fn explain(&self, request: &ProductionRequest) -> Result<AgentExplanation, ProducerError>;

    /// Produce the artifact; callable only with a permit from the gate
    async fn produce(
        &self,
        permit: &EmissionPermit,
        request: &ProductionRequest,
    ) -> Result<ProducedArtifact, ProducerError>;
}
