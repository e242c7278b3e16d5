//! Forge Core - workflow engine and orchestration
//!
//! A requirement becomes a workflow, a five-phase plan and a task graph.
//! Ready tasks go to per-class queues; the [`ArtifactWorker`] routes each
//! attempt through the explanation gate and the validation pipeline before
//! anything is accepted.
//!
//! ```text
//! Requirement -> WorkflowEngine -> WorkflowPlanner -> DependencyCoordinator
//!                                                          |
//!                     ArtifactWorker <- TaskQueue <--------+
//!                          |
//!            ExplanationGate -> Producer -> ValidationPipeline
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod producer;
pub mod telemetry;
pub mod worker;

pub use config::{ConfigError, CoordinationConfig, ForgeConfig, GovernanceConfig};
pub use engine::WorkflowEngine;
pub use error::{ForgeError, RequirementError};
pub use orchestrator::Orchestrator;
pub use planner::{phases, PlannedWorkflow, WorkflowPlanner, E2E_TESTS, REVIEW_CHECKLIST};
pub use producer::{ProducedArtifact, Producer, ProducerError, ProductionRequest};
pub use telemetry::{init_tracing, TelemetryConfig, LOG_ENV};
pub use worker::{ArtifactWorker, DIGEST_KEY};

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::ForgeConfig;
    pub use crate::engine::WorkflowEngine;
    pub use crate::error::ForgeError;
    pub use crate::orchestrator::Orchestrator;
    pub use crate::producer::{ProducedArtifact, Producer, ProducerError, ProductionRequest};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
