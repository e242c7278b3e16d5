//! Forge Coordination - dependency-aware task dispatch
//!
//! [`DependencyCoordinator`] owns one coordination per workflow:
//! the topological execution order, which tasks are blocked on what,
//! which have been handed out, and the blackboard of shared artifacts.
//! When a task fails non-retryably its direct dependents are told so.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod coordinator;
pub mod error;

pub use coordinator::{
    CoordinationSnapshot, CoordinationStatus, CyclePolicy, DependencyCoordinator, SharedArtifact,
    TaskDependency, WorkflowCoordination,
};
pub use error::CoordinationError;

/// Prelude for common imports
pub mod prelude {
    pub use crate::coordinator::{CyclePolicy, DependencyCoordinator, TaskDependency};
    pub use crate::CoordinationError;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
