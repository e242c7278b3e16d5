//! Workflow engine
//!
//! Owns the workflow and task rows. Every change goes through the
//! [`StateStore`] before it is returned to the caller.

use crate::error::{ForgeError, RequirementError};
use crate::planner::WorkflowPlanner;
use dashmap::DashMap;
use forge_model::{
    AuditEntry, PhaseKind, Requirement, StateStore, Task, TaskFailure, TaskId, TaskStatus,
    Workflow, WorkflowId, WorkflowStatus,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Workflow and task lifecycle
pub struct WorkflowEngine {
    store: Arc<dyn StateStore>,
    planner: WorkflowPlanner,
    // Serializes read-modify-write of one workflow row
    workflow_locks: DashMap<WorkflowId, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("locked_workflows", &self.workflow_locks.len())
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// Create an engine over a store
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            planner: WorkflowPlanner::new(),
            workflow_locks: DashMap::new(),
        }
    }

    /// Backing store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Plan builder
    #[inline]
    #[must_use]
    pub fn planner(&self) -> &WorkflowPlanner {
        &self.planner
    }

    async fn lock(&self, id: WorkflowId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.workflow_locks.entry(id).or_default().value());
        lock.lock_owned().await
    }

    /// Validate a requirement, plan it, and persist the workflow with its tasks
    ///
    /// The workflow passes `created -> validating -> planning` and is written
    /// together with its tasks in one store call.
    ///
    /// # Errors
    /// - `Requirement` listing every missing field
    /// - `Store` if the write fails; nothing is persisted in that case
    pub async fn start_workflow(
        &self,
        requirement: Requirement,
        owner: impl Into<String>,
    ) -> Result<Workflow, ForgeError> {
        let missing = requirement.missing_fields();
        if !missing.is_empty() {
            tracing::warn!(requirement = %requirement.id, missing = ?missing, "requirement rejected");
            return Err(RequirementError::Invalid { missing }.into());
        }

        let mut workflow = Workflow::new(requirement, owner);
        workflow.transition(WorkflowStatus::Validating)?;
        workflow.transition(WorkflowStatus::Planning)?;

        let planned = self.planner.plan(workflow.id, &workflow.requirement);
        planned.plan.validate()?;
        workflow.plan = planned.plan;

        self.store.create_workflow(&workflow, &planned.tasks).await?;
        tracing::info!(
            workflow_id = %workflow.id,
            requirement = %workflow.requirement.id,
            owner = %workflow.owner,
            tasks = planned.tasks.len(),
            "workflow created"
        );
        Ok(workflow)
    }

    /// Load a workflow
    ///
    /// # Errors
    /// `UnknownWorkflow` if it does not exist.
    pub async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow, ForgeError> {
        self.store
            .get_workflow(id)
            .await?
            .ok_or(ForgeError::UnknownWorkflow(id))
    }

    /// Load a task
    ///
    /// # Errors
    /// `UnknownTask` if it does not exist.
    pub async fn get_task(&self, id: TaskId) -> Result<Task, ForgeError> {
        self.store.get_task(id).await?.ok_or(ForgeError::UnknownTask(id))
    }

    /// Tasks of a workflow in planning order
    ///
    /// # Errors
    /// `UnknownWorkflow` if it does not exist.
    pub async fn get_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<Task>, ForgeError> {
        self.get_workflow(workflow_id).await?;
        Ok(self.store.list_tasks(workflow_id).await?)
    }

    /// Change a task's status
    ///
    /// # Errors
    /// `DependenciesUnmet` when moving to in-progress while any dependency
    /// is not completed.
    pub async fn update_task_status(&self, task_id: TaskId, status: TaskStatus) -> Result<Task, ForgeError> {
        let mut task = self.get_task(task_id).await?;
        if status == TaskStatus::InProgress {
            let unmet = self.unmet_dependencies(&task).await?;
            if !unmet.is_empty() {
                tracing::warn!(task_id = %task_id, unmet = unmet.len(), "start refused");
                return Err(ForgeError::DependenciesUnmet { task_id, unmet });
            }
        }
        task.apply_status(status);
        self.store.update_task(&task).await?;
        tracing::debug!(task_id = %task_id, status = ?status, "task status updated");
        Ok(task)
    }

    /// Mark a task assigned to a queue with that queue's attempt limit
    ///
    /// # Errors
    /// `UnknownTask` or `Store`.
    pub async fn assign_task(&self, task_id: TaskId, max_attempts: u32) -> Result<Task, ForgeError> {
        let mut task = self.get_task(task_id).await?;
        task.max_retries = max_attempts;
        task.apply_status(TaskStatus::Assigned);
        self.store.update_task(&task).await?;
        tracing::debug!(task_id = %task_id, max_attempts, "task assigned");
        Ok(task)
    }

    async fn unmet_dependencies(&self, task: &Task) -> Result<Vec<TaskId>, ForgeError> {
        let mut unmet = Vec::new();
        for dep in &task.dependencies {
            let done = self
                .store
                .get_task(*dep)
                .await?
                .is_some_and(|t| t.status == TaskStatus::Completed);
            if !done {
                unmet.push(*dep);
            }
        }
        Ok(unmet)
    }

    /// Mark a task completed with its result
    ///
    /// # Errors
    /// `UnknownTask` or `Store`.
    pub async fn complete_task(&self, task_id: TaskId, result: Value) -> Result<Task, ForgeError> {
        let mut task = self.get_task(task_id).await?;
        task.result = Some(result);
        task.failure = None;
        task.apply_status(TaskStatus::Completed);
        self.store.update_task(&task).await?;
        tracing::info!(task_id = %task_id, workflow_id = %task.workflow_id, "task completed");
        Ok(task)
    }

    /// Send a task back to the retry path
    ///
    /// # Errors
    /// `UnknownTask` or `Store`.
    pub async fn retry_task(&self, task_id: TaskId, failure: TaskFailure) -> Result<Task, ForgeError> {
        let mut task = self.get_task(task_id).await?;
        task.failure = Some(failure);
        task.apply_status(TaskStatus::Retry);
        self.store.update_task(&task).await?;
        Ok(task)
    }

    /// Fail a task terminally; a task already terminal is left unchanged
    ///
    /// # Errors
    /// `UnknownTask` or `Store`.
    pub async fn fail_task(&self, task_id: TaskId, failure: TaskFailure) -> Result<Task, ForgeError> {
        let mut task = self.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        tracing::error!(
            task_id = %task_id,
            workflow_id = %task.workflow_id,
            classification = %failure.classification,
            reason = %failure.reason,
            "task failed"
        );
        task.failure = Some(failure);
        task.apply_status(TaskStatus::Failed);
        self.store.update_task(&task).await?;
        Ok(task)
    }

    /// Move a workflow to a new status
    ///
    /// # Errors
    /// `Plan` if the transition is not forward.
    pub async fn update_workflow_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
    ) -> Result<Workflow, ForgeError> {
        let _guard = self.lock(id).await;
        let mut workflow = self.get_workflow(id).await?;
        let previous = workflow.status;
        workflow.transition(status)?;
        if previous != status {
            self.store.update_workflow(&workflow).await?;
            tracing::info!(workflow_id = %id, from = ?previous, to = ?status, "workflow status changed");
        }
        Ok(workflow)
    }

    /// Cancel a workflow; in-flight work stops dispatching further tasks
    ///
    /// A workflow already terminal is returned unchanged.
    ///
    /// # Errors
    /// `UnknownWorkflow` or `Store`.
    pub async fn cancel_workflow(&self, id: WorkflowId, reason: impl Into<String>) -> Result<Workflow, ForgeError> {
        self.terminate(id, reason.into(), "workflow_cancelled").await
    }

    /// Fail a workflow after a terminal task failure
    ///
    /// # Errors
    /// `UnknownWorkflow` or `Store`.
    pub async fn fail_workflow(&self, id: WorkflowId, reason: impl Into<String>) -> Result<Workflow, ForgeError> {
        self.terminate(id, reason.into(), "workflow_failed").await
    }

    async fn terminate(&self, id: WorkflowId, reason: String, kind: &str) -> Result<Workflow, ForgeError> {
        let _guard = self.lock(id).await;
        let mut workflow = self.get_workflow(id).await?;
        if workflow.status.is_terminal() {
            return Ok(workflow);
        }
        let previous = workflow.status;
        workflow.transition(WorkflowStatus::Failed)?;
        workflow.failure_reason = Some(reason.clone());
        self.store.update_workflow(&workflow).await?;
        self.store
            .append_audit(AuditEntry::new(
                id,
                None,
                kind,
                json!({ "previous": previous, "reason": reason }),
            ))
            .await?;
        tracing::warn!(workflow_id = %id, reason = %reason, kind, "workflow stopped");
        Ok(workflow)
    }

    /// Advance a workflow's status from its tasks
    ///
    /// Completed once every task is completed, otherwise the status of the
    /// furthest phase with a dispatched task. Never moves backwards and
    /// never touches a terminal workflow.
    ///
    /// # Errors
    /// `UnknownWorkflow` or `Store`.
    pub async fn refresh_workflow_progress(&self, id: WorkflowId) -> Result<Workflow, ForgeError> {
        let _guard = self.lock(id).await;
        let mut workflow = self.get_workflow(id).await?;
        if workflow.status.is_terminal() {
            return Ok(workflow);
        }

        let tasks = self.store.list_tasks(id).await?;
        let target = if !tasks.is_empty() && tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            Some(WorkflowStatus::Completed)
        } else {
            tasks
                .iter()
                .filter(|t| !matches!(t.status, TaskStatus::Pending | TaskStatus::Blocked))
                .map(|t| t.phase)
                .max()
                .and_then(|number| workflow.plan.phase(number))
                .map(|phase| match phase.kind {
                    PhaseKind::Generation => WorkflowStatus::Executing,
                    PhaseKind::Verification => WorkflowStatus::Testing,
                    PhaseKind::ValidationGate | PhaseKind::Integration => WorkflowStatus::Reviewing,
                })
        };

        if let Some(next) = target.filter(|next| *next > workflow.status) {
            let previous = workflow.status;
            workflow.transition(next)?;
            self.store.update_workflow(&workflow).await?;
            tracing::info!(workflow_id = %id, from = ?previous, to = ?next, "workflow progressed");
        }
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_model::{FailureClass, MemoryStore, UserStory};
    use pretty_assertions::assert_eq;

    fn engine() -> (WorkflowEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (WorkflowEngine::new(store.clone()), store)
    }

    fn requirement() -> Requirement {
        Requirement::new("feat-1", "Checkout")
            .with_story(UserStory::new("s1", "pay by card"))
            .with_criterion("card charged once")
    }

    #[tokio::test]
    async fn invalid_requirement_lists_every_field_and_persists_nothing() {
        let (engine, store) = engine();
        let requirement = Requirement::new("", "").with_story(UserStory::new("s1", ""));

        let err = engine.start_workflow(requirement, "owner").await.unwrap_err();
        let ForgeError::Requirement(RequirementError::Invalid { missing }) = err else {
            panic!("expected a requirement error");
        };
        assert_eq!(
            missing,
            vec!["id", "title", "user_stories[0].description", "acceptance_criteria"]
        );
        assert_eq!(store.workflow_count(), 0);
    }

    #[tokio::test]
    async fn start_persists_planning_workflow_with_tasks() {
        let (engine, _) = engine();
        let workflow = engine.start_workflow(requirement(), "owner").await.unwrap();

        assert_eq!(workflow.status, WorkflowStatus::Planning);
        assert_eq!(workflow.plan.phases.len(), 5);
        let tasks = engine.get_tasks(workflow.id).await.unwrap();
        assert_eq!(tasks.len(), workflow.plan.task_count());
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[tokio::test]
    async fn start_is_refused_until_dependencies_complete() {
        let (engine, _) = engine();
        let workflow = engine.start_workflow(requirement(), "owner").await.unwrap();
        let tasks = engine.get_tasks(workflow.id).await.unwrap();

        let err = engine
            .update_task_status(tasks[1].id, TaskStatus::InProgress)
            .await
            .unwrap_err();
        assert!(
            matches!(err, ForgeError::DependenciesUnmet { ref unmet, .. } if unmet == &vec![tasks[0].id])
        );

        let started = engine
            .update_task_status(tasks[0].id, TaskStatus::InProgress)
            .await
            .unwrap();
        assert!(started.started_at.is_some());
        engine.complete_task(tasks[0].id, json!({})).await.unwrap();
        engine
            .update_task_status(tasks[1].id, TaskStatus::InProgress)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retry_counts_and_terminal_failure_sticks() {
        let (engine, _) = engine();
        let workflow = engine.start_workflow(requirement(), "owner").await.unwrap();
        let first = engine.get_tasks(workflow.id).await.unwrap()[0].id;

        let failure = TaskFailure::new("timeout", FailureClass::Transient);
        let task = engine.retry_task(first, failure.clone()).await.unwrap();
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.status, TaskStatus::Retry);

        let failed = engine
            .fail_task(first, TaskFailure::new("gave up", FailureClass::Fatal))
            .await
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        let again = engine.fail_task(first, failure).await.unwrap();
        assert_eq!(again.failure.unwrap().reason, "gave up");
    }

    #[tokio::test]
    async fn progress_follows_the_furthest_phase() {
        let (engine, _) = engine();
        let workflow = engine.start_workflow(requirement(), "owner").await.unwrap();
        let tasks = engine.get_tasks(workflow.id).await.unwrap();

        engine.update_task_status(tasks[0].id, TaskStatus::Assigned).await.unwrap();
        let wf = engine.refresh_workflow_progress(workflow.id).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Executing);
        assert!(wf.started_at.is_some());

        for task in &tasks {
            engine.complete_task(task.id, json!({})).await.unwrap();
            if task.phase == 3 {
                let wf = engine.refresh_workflow_progress(workflow.id).await.unwrap();
                assert_eq!(wf.status, WorkflowStatus::Testing);
            }
        }
        let wf = engine.refresh_workflow_progress(workflow.id).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert!(wf.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_is_final_and_audited() {
        let (engine, store) = engine();
        let workflow = engine.start_workflow(requirement(), "owner").await.unwrap();

        let cancelled = engine.cancel_workflow(workflow.id, "owner request").await.unwrap();
        assert_eq!(cancelled.status, WorkflowStatus::Failed);
        assert_eq!(cancelled.failure_reason.as_deref(), Some("owner request"));
        assert!(cancelled.is_cancelled());

        let tasks = engine.get_tasks(workflow.id).await.unwrap();
        engine.update_task_status(tasks[0].id, TaskStatus::Assigned).await.unwrap();
        let wf = engine.refresh_workflow_progress(workflow.id).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);

        let audit = store.audit_log(workflow.id).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].kind, "workflow_cancelled");
    }

    #[tokio::test]
    async fn status_never_moves_backwards() {
        let (engine, _) = engine();
        let workflow = engine.start_workflow(requirement(), "owner").await.unwrap();
        engine
            .update_workflow_status(workflow.id, WorkflowStatus::Testing)
            .await
            .unwrap();
        let err = engine
            .update_workflow_status(workflow.id, WorkflowStatus::Executing)
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Plan(_)));
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let (engine, _) = engine();
        let id = WorkflowId::new();
        assert!(matches!(engine.get_workflow(id).await, Err(ForgeError::UnknownWorkflow(w)) if w == id));
        assert!(matches!(
            engine.get_task(TaskId::new()).await,
            Err(ForgeError::UnknownTask(_))
        ));
    }
}
