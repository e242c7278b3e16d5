//! Forge Queue - per-worker-class priority task queue
//!
//! - Priority score first, then submission order
//! - Submission is idempotent on the job key
//! - Retryable failures back off exponentially on the queue's own clock
//! - Terminal failures are broadcast as [`JobEvent::Failed`]
//!
//! [`TaskQueue`] also implements `MessageSink`, so inter-agent messages
//! reach workers through the same dispatch path.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod error;
pub mod policy;
pub mod queue;

pub use error::{JobError, QueueError};
pub use policy::QueuePolicy;
pub use queue::{ClassQueue, JobEvent, JobHandler, JobSnapshot, JobState, QueueStats, Submission, TaskQueue};

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{JobError, QueueError};
    pub use crate::policy::QueuePolicy;
    pub use crate::queue::{JobEvent, JobHandler, Submission, TaskQueue};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
