//! Forge Model - shared data model
//!
//! Types shared by every Forge crate:
//! - Workflow, execution plan and task state
//! - Inter-agent message envelope
//! - Queue job envelope and payload union
//! - The `StateStore` persistence collaborator

#![warn(unreachable_pub)]

pub mod error;
pub mod ids;
pub mod job;
pub mod message;
pub mod requirement;
pub mod store;
pub mod task;
pub mod workflow;

pub use error::{PlanError, SinkError, StoreError};
pub use ids::{ExplanationId, MessageId, TaskId, WorkflowId};
pub use job::{Job, JobKey, JobPayload, WorkOrder};
pub use message::{
    AgentMessage, MessagePayload, MessageSink, MessageType, Participant, FAILURE_MESSAGE_PRIORITY,
};
pub use requirement::{Complexity, Requirement, RequirementKind, UserStory};
pub use store::{
    AuditEntry, CoordinationEvent, CoordinationRecord, MemoryStore, StateStore,
    StoredExplanation, ValidationRecord,
};
pub use task::{FailureClass, Priority, Task, TaskFailure, TaskStatus, WorkerClass, DEFAULT_MAX_ATTEMPTS};
pub use workflow::{ExecutionPlan, Phase, PhaseKind, Workflow, WorkflowStatus};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
