//! Queue job envelope
//!
//! The queue never looks inside `JobPayload`; workers match on it.

use crate::ids::{MessageId, TaskId, WorkflowId};
use crate::message::AgentMessage;
use crate::task::WorkerClass;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Job identity
///
/// Task jobs are keyed by the task's own id, which makes submission
/// idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum JobKey {
    /// Job carrying a task
    Task(TaskId),
    /// Job carrying a message
    Message(MessageId),
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKey::Task(id) => write!(f, "task:{id}"),
            JobKey::Message(id) => write!(f, "message:{id}"),
        }
    }
}

/// Work order shared by every production payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrder {
    /// Feature (requirement) id, selects the failure specification
    pub feature_id: String,
    /// Requirement title
    pub requirement_title: String,
    /// Task instructions
    pub instructions: String,
    /// Stories covered by this task
    pub story_ids: Vec<String>,
    /// Acceptance criteria the artifact must meet
    pub acceptance_criteria: Vec<String>,
}

/// Job payload, one variant per kind of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum JobPayload {
    /// Generate components or services
    Generate(WorkOrder),
    /// Generate tests
    Verify {
        /// Work order
        order: WorkOrder,
        /// Include end-to-end flows
        end_to_end: bool,
    },
    /// Audit generated work
    Review {
        /// Work order
        order: WorkOrder,
        /// Review checklist items
        checklist: Vec<String>,
    },
    /// Wire pipelines and deployment
    Integrate(WorkOrder),
    /// Deliver an inter-agent message
    Message(AgentMessage),
}

impl JobPayload {
    /// Work order, if this payload produces an artifact
    #[inline]
    #[must_use]
    pub fn work_order(&self) -> Option<&WorkOrder> {
        match self {
            JobPayload::Generate(order) | JobPayload::Integrate(order) => Some(order),
            JobPayload::Verify { order, .. } | JobPayload::Review { order, .. } => Some(order),
            JobPayload::Message(_) => None,
        }
    }

    /// Short label used in logs
    #[inline]
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            JobPayload::Generate(_) => "generate",
            JobPayload::Verify { .. } => "verify",
            JobPayload::Review { .. } => "review",
            JobPayload::Integrate(_) => "integrate",
            JobPayload::Message(_) => "message",
        }
    }
}

/// Queue job envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job identity
    pub key: JobKey,
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Target queue
    pub worker_class: WorkerClass,
    /// Opaque payload
    pub payload: JobPayload,
}

impl Job {
    /// Task id if this is a task job
    #[inline]
    #[must_use]
    pub fn task_id(&self) -> Option<TaskId> {
        match self.key {
            JobKey::Task(id) => Some(id),
            JobKey::Message(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> WorkOrder {
        WorkOrder {
            feature_id: "f".into(),
            requirement_title: "t".into(),
            instructions: "do".into(),
            story_ids: vec![],
            acceptance_criteria: vec![],
        }
    }

    #[test]
    fn work_order_is_exposed_for_production_payloads() {
        assert!(JobPayload::Generate(order()).work_order().is_some());
        assert!(JobPayload::Verify {
            order: order(),
            end_to_end: true
        }
        .work_order()
        .is_some());
    }

    #[test]
    fn job_key_display() {
        let id = TaskId::new();
        assert_eq!(JobKey::Task(id).to_string(), format!("task:{id}"));
    }
}
