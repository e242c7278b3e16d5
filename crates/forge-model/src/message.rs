//! Inter-agent message envelope
//!
//! Messages travel between the coordinator and workers. Payloads are a
//! tagged union so receivers can match every shape exhaustively.

use crate::error::SinkError;
use crate::ids::{MessageId, TaskId, WorkflowId};
use crate::task::{FailureClass, WorkerClass};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority given to failure notifications
pub const FAILURE_MESSAGE_PRIORITY: u8 = 10;

/// Sender or recipient of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "class")]
pub enum Participant {
    /// The dependency coordinator
    Coordinator,
    /// A worker of the given class
    Worker(WorkerClass),
}

/// Message type discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Work hand-off
    Task,
    /// Result hand-off
    Result,
    /// Request for information
    Request,
    /// Status update
    Status,
    /// Dependency resolved
    Dependency,
    /// Upstream failure notification
    Failure,
}

/// Message payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MessagePayload {
    /// Work hand-off
    Task {
        /// Instructions for the receiver
        instructions: String,
    },
    /// Result hand-off
    Result {
        /// Produced value
        output: serde_json::Value,
    },
    /// Request for information
    Request {
        /// Question asked
        query: String,
    },
    /// Status update
    Status {
        /// Status text
        status: String,
    },
    /// A dependency of the receiving task resolved
    Dependency {
        /// The task that completed
        resolved: TaskId,
    },
    /// A dependency of the receiving task failed
    Failure {
        /// The task that failed
        failed_task: TaskId,
        /// Human-readable reason
        reason: String,
        /// Classification of the failure
        classification: FailureClass,
    },
}

impl MessagePayload {
    /// Discriminant of this payload
    #[inline]
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::Task { .. } => MessageType::Task,
            MessagePayload::Result { .. } => MessageType::Result,
            MessagePayload::Request { .. } => MessageType::Request,
            MessagePayload::Status { .. } => MessageType::Status,
            MessagePayload::Dependency { .. } => MessageType::Dependency,
            MessagePayload::Failure { .. } => MessageType::Failure,
        }
    }
}

/// Message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Message identifier
    pub id: MessageId,
    /// Sender
    pub from: Participant,
    /// Recipient
    pub to: Participant,
    /// Payload
    pub payload: MessagePayload,
    /// Task the message concerns (the receiving task)
    pub task_id: TaskId,
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Delivery priority, higher first
    pub priority: u8,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl AgentMessage {
    /// Create a new message
    #[must_use]
    pub fn new(
        from: Participant,
        to: Participant,
        workflow_id: WorkflowId,
        task_id: TaskId,
        payload: MessagePayload,
    ) -> Self {
        Self {
            id: MessageId::new(),
            from,
            to,
            payload,
            task_id,
            workflow_id,
            priority: 1,
            created_at: Utc::now(),
        }
    }

    /// With priority
    #[inline]
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Message type discriminant
    #[inline]
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

/// Delivery path for messages
///
/// The task queue implements this so messages reach workers through the
/// same dispatch path as ordinary work.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Deliver a message to its recipient
    async fn deliver(&self, message: AgentMessage) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_determines_type() {
        let msg = AgentMessage::new(
            Participant::Coordinator,
            Participant::Worker(WorkerClass::Backend),
            WorkflowId::new(),
            TaskId::new(),
            MessagePayload::Failure {
                failed_task: TaskId::new(),
                reason: "boom".into(),
                classification: FailureClass::Fatal,
            },
        )
        .with_priority(FAILURE_MESSAGE_PRIORITY);

        assert_eq!(msg.message_type(), MessageType::Failure);
        assert_eq!(msg.priority, 10);
    }

    #[test]
    fn payload_is_tagged_in_json() {
        let payload = MessagePayload::Status {
            status: "ok".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "status");
    }
}
