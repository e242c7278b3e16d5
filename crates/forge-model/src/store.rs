//! Persisted state
//!
//! `StateStore` is the narrow persistence collaborator. Every state
//! transition is written here before the in-memory change it describes is
//! considered committed. `MemoryStore` is the in-process implementation.

use crate::error::StoreError;
use crate::ids::{ExplanationId, TaskId, WorkflowId};
use crate::message::AgentMessage;
use crate::task::Task;
use crate::workflow::Workflow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coordination event kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum CoordinationEvent {
    /// Task registered with its dependency set
    Planned {
        /// Direct dependencies
        depends_on: Vec<TaskId>,
        /// Position in topological order
        position: usize,
    },
    /// Task completed and freed dependents
    Completed {
        /// Dependents whose last blocker was this task
        unblocked: Vec<TaskId>,
        /// Result supplied by the reporter
        result: serde_json::Value,
    },
    /// Task failed
    Failed {
        /// Failure message
        error: String,
        /// Whether the failure may be retried
        retryable: bool,
        /// Dependents notified of the failure
        notified: Vec<TaskId>,
    },
    /// Event arrived after the workflow was cancelled
    IgnoredAfterCancel {
        /// Original event name
        original: String,
    },
}

/// One persisted coordination record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationRecord {
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Task concerned
    pub task_id: TaskId,
    /// What happened
    pub event: CoordinationEvent,
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
}

impl CoordinationRecord {
    /// Create a record stamped now
    #[inline]
    #[must_use]
    pub fn new(workflow_id: WorkflowId, task_id: TaskId, event: CoordinationEvent) -> Self {
        Self {
            workflow_id,
            task_id,
            event,
            recorded_at: Utc::now(),
        }
    }
}

/// Persisted explanation (the body is the serialized rationale)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredExplanation {
    /// Explanation id
    pub id: ExplanationId,
    /// Task the explanation belongs to
    pub task_id: TaskId,
    /// Serialized explanation
    pub body: serde_json::Value,
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
}

/// Persisted validation verdict for one artifact attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Task validated
    pub task_id: TaskId,
    /// Attempt number (1-based)
    pub attempt: u32,
    /// Whether the artifact was accepted
    pub accepted: bool,
    /// Content digest of the artifact
    pub digest: String,
    /// Serialized verdict
    pub verdict: serde_json::Value,
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
}

/// Free-form audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Task concerned, if any
    pub task_id: Option<TaskId>,
    /// Entry kind (for example `completeness_gaps`)
    pub kind: String,
    /// Structured detail
    pub detail: serde_json::Value,
    /// When it was recorded
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    /// Create an entry stamped now
    #[inline]
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        task_id: Option<TaskId>,
        kind: impl Into<String>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            workflow_id,
            task_id,
            kind: kind.into(),
            detail,
            at: Utc::now(),
        }
    }
}

/// Persistence collaborator
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a workflow together with its tasks, all or nothing
    async fn create_workflow(&self, workflow: &Workflow, tasks: &[Task]) -> Result<(), StoreError>;

    /// Load a workflow
    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>, StoreError>;

    /// Overwrite a workflow
    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Load a task
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Tasks of a workflow in planning order
    async fn list_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<Task>, StoreError>;

    /// Overwrite a task
    async fn update_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Append a coordination record
    async fn record_coordination(&self, record: CoordinationRecord) -> Result<(), StoreError>;

    /// Coordination records of a workflow in append order
    async fn coordination_records(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Vec<CoordinationRecord>, StoreError>;

    /// Append an inter-agent message
    async fn record_message(&self, message: &AgentMessage) -> Result<(), StoreError>;

    /// Messages of a workflow in append order
    async fn messages(&self, workflow_id: WorkflowId) -> Result<Vec<AgentMessage>, StoreError>;

    /// Persist an explanation; explanations are write-once
    async fn record_explanation(&self, explanation: StoredExplanation) -> Result<(), StoreError>;

    /// Load an explanation
    async fn get_explanation(&self, id: ExplanationId)
        -> Result<Option<StoredExplanation>, StoreError>;

    /// Append a validation verdict
    async fn record_validation(&self, record: ValidationRecord) -> Result<(), StoreError>;

    /// Validation verdicts of a task in append order
    async fn validations(&self, task_id: TaskId) -> Result<Vec<ValidationRecord>, StoreError>;

    /// Append an audit entry
    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError>;

    /// Audit entries of a workflow in append order
    async fn audit_log(&self, workflow_id: WorkflowId) -> Result<Vec<AuditEntry>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    workflows: HashMap<WorkflowId, Workflow>,
    tasks: HashMap<TaskId, Task>,
    task_order: HashMap<WorkflowId, Vec<TaskId>>,
    coordination: Vec<CoordinationRecord>,
    messages: Vec<AgentMessage>,
    explanations: HashMap<ExplanationId, StoredExplanation>,
    validations: Vec<ValidationRecord>,
    audit: Vec<AuditEntry>,
}

/// In-process store
///
/// A single lock guards all state, so `create_workflow` is atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workflows stored
    #[inline]
    #[must_use]
    pub fn workflow_count(&self) -> usize {
        self.inner.read().workflows.len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create_workflow(&self, workflow: &Workflow, tasks: &[Task]) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        if state.workflows.contains_key(&workflow.id) {
            return Err(StoreError::Conflict(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        if let Some(dup) = tasks.iter().find(|t| state.tasks.contains_key(&t.id)) {
            return Err(StoreError::Conflict(format!("task {} already exists", dup.id)));
        }
        state.workflows.insert(workflow.id, workflow.clone());
        state
            .task_order
            .insert(workflow.id, tasks.iter().map(|t| t.id).collect());
        for task in tasks {
            state.tasks.insert(task.id, task.clone());
        }
        Ok(())
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>, StoreError> {
        Ok(self.inner.read().workflows.get(&id).cloned())
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        match state.workflows.get_mut(&workflow.id) {
            Some(slot) => {
                *slot = workflow.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("workflow", workflow.id)),
        }
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.read().tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<Task>, StoreError> {
        let state = self.inner.read();
        let order = state
            .task_order
            .get(&workflow_id)
            .ok_or_else(|| StoreError::not_found("workflow", workflow_id))?;
        Ok(order
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect())
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        match state.tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("task", task.id)),
        }
    }

    async fn record_coordination(&self, record: CoordinationRecord) -> Result<(), StoreError> {
        self.inner.write().coordination.push(record);
        Ok(())
    }

    async fn coordination_records(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Vec<CoordinationRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .coordination
            .iter()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn record_message(&self, message: &AgentMessage) -> Result<(), StoreError> {
        self.inner.write().messages.push(message.clone());
        Ok(())
    }

    async fn messages(&self, workflow_id: WorkflowId) -> Result<Vec<AgentMessage>, StoreError> {
        Ok(self
            .inner
            .read()
            .messages
            .iter()
            .filter(|m| m.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn record_explanation(&self, explanation: StoredExplanation) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        if state.explanations.contains_key(&explanation.id) {
            return Err(StoreError::Conflict(format!(
                "explanation {} is immutable once recorded",
                explanation.id
            )));
        }
        state.explanations.insert(explanation.id, explanation);
        Ok(())
    }

    async fn get_explanation(
        &self,
        id: ExplanationId,
    ) -> Result<Option<StoredExplanation>, StoreError> {
        Ok(self.inner.read().explanations.get(&id).cloned())
    }

    async fn record_validation(&self, record: ValidationRecord) -> Result<(), StoreError> {
        self.inner.write().validations.push(record);
        Ok(())
    }

    async fn validations(&self, task_id: TaskId) -> Result<Vec<ValidationRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .validations
            .iter()
            .filter(|v| v.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.inner.write().audit.push(entry);
        Ok(())
    }

    async fn audit_log(&self, workflow_id: WorkflowId) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self
            .inner
            .read()
            .audit
            .iter()
            .filter(|a| a.workflow_id == workflow_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirement::Requirement;
    use crate::task::WorkerClass;

    fn workflow_with_tasks(count: usize) -> (Workflow, Vec<Task>) {
        let wf = Workflow::new(Requirement::new("r", "t"), "owner");
        let tasks = (0..count)
            .map(|i| Task::new(wf.id, WorkerClass::Backend, format!("t{i}"), 1))
            .collect();
        (wf, tasks)
    }

    #[tokio::test]
    async fn create_and_list_preserves_order() {
        let store = MemoryStore::new();
        let (wf, tasks) = workflow_with_tasks(3);
        store.create_workflow(&wf, &tasks).await.unwrap();

        let listed = store.list_tasks(wf.id).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|t| t.id).collect();
        let expected: Vec<_> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn duplicate_workflow_is_rejected_without_partial_write() {
        let store = MemoryStore::new();
        let (wf, tasks) = workflow_with_tasks(1);
        store.create_workflow(&wf, &tasks).await.unwrap();

        let extra = Task::new(wf.id, WorkerClass::Frontend, "extra", 1);
        let err = store.create_workflow(&wf, &[extra.clone()]).await;
        assert!(matches!(err, Err(StoreError::Conflict(_))));
        assert!(store.get_task(extra.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn explanations_are_write_once() {
        let store = MemoryStore::new();
        let stored = StoredExplanation {
            id: ExplanationId::new(),
            task_id: TaskId::new(),
            body: serde_json::json!({}),
            recorded_at: Utc::now(),
        };
        store.record_explanation(stored.clone()).await.unwrap();
        assert!(store.record_explanation(stored).await.is_err());
    }

    #[tokio::test]
    async fn update_unknown_task_is_not_found() {
        let store = MemoryStore::new();
        let task = Task::new(WorkflowId::new(), WorkerClass::Testing, "t", 1);
        assert!(matches!(
            store.update_task(&task).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
