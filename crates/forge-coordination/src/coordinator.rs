//! Dependency coordinator
//!
//! Coordination state is partitioned by workflow. Each
//! [`WorkflowCoordination`] sits behind its own async mutex, so reports for
//! one workflow serialize while different workflows never contend. Every
//! change is persisted through the [`StateStore`] before it is applied in
//! memory.

use crate::error::CoordinationError;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use forge_model::{
    AgentMessage, AuditEntry, CoordinationEvent, CoordinationRecord, MessagePayload, MessageSink,
    Participant, StateStore, Task, TaskFailure, TaskId, TaskStatus, WorkerClass, WorkflowId,
    FAILURE_MESSAGE_PRIORITY,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// What to do when planning finds a dependency cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePolicy {
    /// Refuse the plan
    #[default]
    Reject,
    /// Log and treat the closing edge as satisfied
    WarnAndContinue,
}

/// Lifecycle of one coordination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationStatus {
    /// Dispatching
    Active,
    /// Every task completed
    Completed,
    /// A non-retryable failure occurred
    Failed,
    /// Workflow cancelled
    Cancelled,
}

impl CoordinationStatus {
    /// Whether further dispatch is allowed
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, CoordinationStatus::Active)
    }
}

impl fmt::Display for CoordinationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoordinationStatus::Active => "active",
            CoordinationStatus::Completed => "completed",
            CoordinationStatus::Failed => "failed",
            CoordinationStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Derived dependency record of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDependency {
    /// Task
    pub task_id: TaskId,
    /// Worker class that runs the task
    pub worker_class: WorkerClass,
    /// Declared dependencies
    pub depends_on: Vec<TaskId>,
    /// Dependencies not yet completed
    pub blocked_until: Vec<TaskId>,
    /// Whether the task is still waiting on dependencies
    pub is_blocked: bool,
    /// When the task first became ready
    pub resolved_at: Option<DateTime<Utc>>,
    /// Cycle-closing edges treated as satisfied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waived: Vec<TaskId>,
    /// Whether the task was handed out for dispatch
    pub claimed: bool,
    /// Whether the task completed
    pub completed: bool,
}

impl TaskDependency {
    fn effective(&self) -> impl Iterator<Item = &TaskId> {
        self.depends_on.iter().filter(|d| !self.waived.contains(d))
    }

    fn mark_resolved(&mut self) {
        if self.is_blocked || self.resolved_at.is_none() {
            self.is_blocked = false;
            self.resolved_at.get_or_insert_with(Utc::now);
        }
    }
}

/// Value handed from one task to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedArtifact {
    /// Producing task
    pub source: TaskId,
    /// Consuming task
    pub target: TaskId,
    /// Key
    pub key: String,
    /// Value
    pub value: Value,
    /// When it was shared
    pub shared_at: DateTime<Utc>,
}

/// Point-in-time summary of a coordination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationSnapshot {
    /// Workflow
    pub workflow_id: WorkflowId,
    /// Lifecycle
    pub status: CoordinationStatus,
    /// Tasks in topological order
    pub order: Vec<TaskId>,
    /// Completed tasks
    pub completed: usize,
    /// Claimed and not yet completed
    pub in_flight: usize,
    /// Still waiting on dependencies
    pub blocked: usize,
}

#[derive(Debug)]
struct CoordinationState {
    status: CoordinationStatus,
    order: Vec<TaskId>,
    deps: HashMap<TaskId, TaskDependency>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
    blackboard: HashMap<(TaskId, TaskId, String), SharedArtifact>,
}

impl CoordinationState {
    fn dependency(&self, workflow_id: WorkflowId, task_id: TaskId) -> Result<&TaskDependency, CoordinationError> {
        self.deps
            .get(&task_id)
            .ok_or(CoordinationError::UnknownTask { workflow_id, task_id })
    }

    fn ready(&self, dep: &TaskDependency, completed: &HashSet<TaskId>) -> bool {
        !dep.completed
            && dep.effective().all(|d| {
                completed.contains(d) || self.deps.get(d).is_some_and(|other| other.completed)
            })
    }

    /// Dependents whose only remaining blocker is `task_id`
    fn unblocked_by(&self, task_id: TaskId) -> Vec<TaskId> {
        self.dependents
            .get(&task_id)
            .into_iter()
            .flatten()
            .filter(|d| {
                self.deps
                    .get(d)
                    .is_some_and(|dep| dep.blocked_until.as_slice() == [task_id])
            })
            .copied()
            .collect()
    }

    fn apply_completion(&mut self, task_id: TaskId) {
        if let Some(dep) = self.deps.get_mut(&task_id) {
            dep.completed = true;
            dep.mark_resolved();
        }
        let dependents = self.dependents.get(&task_id).cloned().unwrap_or_default();
        for dependent in dependents {
            if let Some(dep) = self.deps.get_mut(&dependent) {
                dep.blocked_until.retain(|d| *d != task_id);
                if dep.blocked_until.is_empty() {
                    dep.mark_resolved();
                }
            }
        }
        if self.status.is_active() && self.deps.values().all(|d| d.completed) {
            self.status = CoordinationStatus::Completed;
        }
    }
}

/// Coordination of one workflow
#[derive(Debug)]
pub struct WorkflowCoordination {
    workflow_id: WorkflowId,
    state: Mutex<CoordinationState>,
}

impl WorkflowCoordination {
    /// Workflow coordinated
    #[inline]
    #[must_use]
    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }
}

/// Depth-first topological sort with a visiting-set cycle guard
struct TopoSort<'a> {
    deps: &'a HashMap<TaskId, Vec<TaskId>>,
    policy: CyclePolicy,
    visiting: HashSet<TaskId>,
    visited: HashSet<TaskId>,
    stack: Vec<TaskId>,
    order: Vec<TaskId>,
    waived: Vec<(TaskId, TaskId)>,
}

impl<'a> TopoSort<'a> {
    fn new(deps: &'a HashMap<TaskId, Vec<TaskId>>, policy: CyclePolicy) -> Self {
        Self {
            deps,
            policy,
            visiting: HashSet::new(),
            visited: HashSet::new(),
            stack: Vec::new(),
            order: Vec::with_capacity(deps.len()),
            waived: Vec::new(),
        }
    }

    fn visit(&mut self, id: TaskId) -> Result<(), CoordinationError> {
        if self.visited.contains(&id) {
            return Ok(());
        }
        self.visiting.insert(id);
        self.stack.push(id);

        let deps = self.deps;
        for dep in deps.get(&id).map(Vec::as_slice).unwrap_or_default() {
            if self.visiting.contains(dep) {
                let start = self.stack.iter().position(|t| t == dep).unwrap_or(0);
                let mut cycle = self.stack[start..].to_vec();
                cycle.push(*dep);
                match self.policy {
                    CyclePolicy::Reject => return Err(CoordinationError::CycleDetected { cycle }),
                    CyclePolicy::WarnAndContinue => {
                        tracing::warn!(
                            task_id = %id,
                            dependency = %dep,
                            cycle_len = cycle.len() - 1,
                            "dependency cycle detected, treating edge as satisfied"
                        );
                        self.waived.push((id, *dep));
                    }
                }
                continue;
            }
            self.visit(*dep)?;
        }

        self.stack.pop();
        self.visiting.remove(&id);
        self.visited.insert(id);
        self.order.push(id);
        Ok(())
    }
}

/// Workflow-partitioned dependency coordinator
pub struct DependencyCoordinator {
    coordinations: DashMap<WorkflowId, Arc<WorkflowCoordination>>,
    store: Arc<dyn StateStore>,
    sink: Option<Arc<dyn MessageSink>>,
    cycle_policy: CyclePolicy,
}

impl fmt::Debug for DependencyCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyCoordinator")
            .field("workflows", &self.coordinations.len())
            .field("cycle_policy", &self.cycle_policy)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl DependencyCoordinator {
    /// Create a coordinator persisting through `store`
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            coordinations: DashMap::new(),
            store,
            sink: None,
            cycle_policy: CyclePolicy::default(),
        }
    }

    /// Forward sent messages to `sink`
    #[inline]
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// With cycle policy
    #[inline]
    #[must_use]
    pub fn with_cycle_policy(mut self, policy: CyclePolicy) -> Self {
        self.cycle_policy = policy;
        self
    }

    /// Number of registered coordinations
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.coordinations.len()
    }

    /// Whether no coordination is registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.coordinations.is_empty()
    }

    fn coordination(&self, workflow_id: WorkflowId) -> Result<Arc<WorkflowCoordination>, CoordinationError> {
        self.coordinations
            .get(&workflow_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or(CoordinationError::UnknownWorkflow(workflow_id))
    }

    fn build(&self, tasks: &[Task]) -> Result<CoordinationState, CoordinationError> {
        let mut edges: HashMap<TaskId, Vec<TaskId>> = HashMap::with_capacity(tasks.len());
        for task in tasks {
            if edges.insert(task.id, task.dependencies.clone()).is_some() {
                return Err(CoordinationError::DuplicateTask(task.id));
            }
        }
        for task in tasks {
            if let Some(missing) = task.dependencies.iter().find(|d| !edges.contains_key(d)) {
                return Err(CoordinationError::UnknownDependency {
                    task_id: task.id,
                    dependency: *missing,
                });
            }
        }

        let mut sort = TopoSort::new(&edges, self.cycle_policy);
        for task in tasks {
            sort.visit(task.id)?;
        }
        let TopoSort { order, waived, .. } = sort;

        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let deps = tasks
            .iter()
            .map(|task| {
                let waived: Vec<TaskId> = waived
                    .iter()
                    .filter(|(from, _)| *from == task.id)
                    .map(|(_, to)| *to)
                    .collect();
                for dep in task.dependencies.iter().filter(|d| !waived.contains(d)) {
                    dependents.entry(*dep).or_default().push(task.id);
                }
                let blocked_until: Vec<TaskId> = task
                    .dependencies
                    .iter()
                    .filter(|d| !waived.contains(d))
                    .copied()
                    .collect();
                let dep = TaskDependency {
                    task_id: task.id,
                    worker_class: task.worker_class,
                    depends_on: task.dependencies.clone(),
                    is_blocked: !blocked_until.is_empty(),
                    blocked_until,
                    resolved_at: None,
                    waived,
                    claimed: false,
                    completed: false,
                };
                (task.id, dep)
            })
            .collect();

        Ok(CoordinationState {
            status: CoordinationStatus::Active,
            order,
            deps,
            dependents,
            blackboard: HashMap::new(),
        })
    }

    /// Register a workflow's tasks and compute the execution order
    ///
    /// Returns the topological order: every task after all of its
    /// dependencies.
    ///
    /// # Errors
    /// - `CycleDetected` under the reject policy; nothing is registered
    /// - `UnknownDependency` / `DuplicateTask` on a malformed task set
    /// - `AlreadyCoordinated` if the workflow is registered
    /// - `Store` if persisting the plan fails
    pub async fn create_coordination_plan(
        &self,
        workflow_id: WorkflowId,
        tasks: &[Task],
    ) -> Result<Vec<TaskId>, CoordinationError> {
        if self.coordinations.contains_key(&workflow_id) {
            return Err(CoordinationError::AlreadyCoordinated(workflow_id));
        }
        let state = self.build(tasks)?;

        for (position, task_id) in state.order.iter().enumerate() {
            let depends_on = state
                .deps
                .get(task_id)
                .map(|d| d.depends_on.clone())
                .unwrap_or_default();
            self.store
                .record_coordination(CoordinationRecord::new(
                    workflow_id,
                    *task_id,
                    CoordinationEvent::Planned { depends_on, position },
                ))
                .await?;
        }

        let order = state.order.clone();
        match self.coordinations.entry(workflow_id) {
            Entry::Occupied(_) => return Err(CoordinationError::AlreadyCoordinated(workflow_id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(WorkflowCoordination {
                    workflow_id,
                    state: Mutex::new(state),
                }));
            }
        }

        tracing::info!(workflow_id = %workflow_id, tasks = order.len(), "coordination plan created");
        Ok(order)
    }

    /// Rebuild a coordination from persisted tasks after a restart
    ///
    /// Completed tasks are replayed as completions; tasks that had been
    /// dispatched are marked claimed so they are not handed out twice.
    ///
    /// # Errors
    /// Same planning errors as [`Self::create_coordination_plan`].
    pub async fn restore(&self, workflow_id: WorkflowId, tasks: &[Task]) -> Result<Vec<TaskId>, CoordinationError> {
        let mut state = self.build(tasks)?;
        for task in tasks {
            match task.status {
                TaskStatus::Completed => {
                    if let Some(dep) = state.deps.get_mut(&task.id) {
                        dep.claimed = true;
                    }
                    state.apply_completion(task.id);
                }
                TaskStatus::Assigned | TaskStatus::InProgress | TaskStatus::Retry => {
                    if let Some(dep) = state.deps.get_mut(&task.id) {
                        dep.claimed = true;
                    }
                }
                TaskStatus::Failed => {
                    if let Some(dep) = state.deps.get_mut(&task.id) {
                        dep.claimed = true;
                    }
                    state.status = CoordinationStatus::Failed;
                }
                TaskStatus::Pending | TaskStatus::Blocked => {}
            }
        }

        let order = state.order.clone();
        self.coordinations.insert(
            workflow_id,
            Arc::new(WorkflowCoordination {
                workflow_id,
                state: Mutex::new(state),
            }),
        );
        tracing::info!(workflow_id = %workflow_id, tasks = order.len(), "coordination restored");
        Ok(order)
    }

    /// First task in topological order whose dependencies are all completed
    ///
    /// A task counts as completed if it is in `completed` or was reported
    /// complete. The first time a task is found ready it is unblocked and
    /// its `resolved_at` stamped.
    ///
    /// # Errors
    /// `UnknownWorkflow` if the workflow is not coordinated.
    pub async fn get_next_executable_task(
        &self,
        workflow_id: WorkflowId,
        completed: &HashSet<TaskId>,
    ) -> Result<Option<TaskId>, CoordinationError> {
        let coordination = self.coordination(workflow_id)?;
        let mut state = coordination.state.lock().await;

        let next = state.order.iter().copied().find(|id| {
            !completed.contains(id) && state.deps.get(id).is_some_and(|dep| state.ready(dep, completed))
        });

        if let Some(id) = next {
            if let Some(dep) = state.deps.get_mut(&id) {
                dep.mark_resolved();
            }
        }
        Ok(next)
    }

    /// Claim every ready, unclaimed task; each task is claimed at most once
    ///
    /// Nothing is claimed once the coordination is no longer active.
    ///
    /// # Errors
    /// `UnknownWorkflow` if the workflow is not coordinated.
    pub async fn claim_ready_tasks(
        &self,
        workflow_id: WorkflowId,
        completed: &HashSet<TaskId>,
    ) -> Result<Vec<TaskId>, CoordinationError> {
        let coordination = self.coordination(workflow_id)?;
        let mut state = coordination.state.lock().await;
        if !state.status.is_active() {
            return Ok(Vec::new());
        }

        let ready: Vec<TaskId> = state
            .order
            .iter()
            .copied()
            .filter(|id| {
                !completed.contains(id)
                    && state
                        .deps
                        .get(id)
                        .is_some_and(|dep| !dep.claimed && state.ready(dep, completed))
            })
            .collect();

        for id in &ready {
            if let Some(dep) = state.deps.get_mut(id) {
                dep.claimed = true;
                dep.mark_resolved();
            }
        }
        if !ready.is_empty() {
            tracing::debug!(workflow_id = %workflow_id, claimed = ready.len(), "ready tasks claimed");
        }
        Ok(ready)
    }

    /// Give back a claim that was never dispatched
    ///
    /// Returns whether a claim was released. A completed task keeps its
    /// claim.
    ///
    /// # Errors
    /// Unknown workflow or task.
    pub async fn release_claim(&self, workflow_id: WorkflowId, task_id: TaskId) -> Result<bool, CoordinationError> {
        let coordination = self.coordination(workflow_id)?;
        let mut state = coordination.state.lock().await;
        state.dependency(workflow_id, task_id)?;
        let Some(dep) = state.deps.get_mut(&task_id) else {
            return Ok(false);
        };
        if dep.completed || !dep.claimed {
            return Ok(false);
        }
        dep.claimed = false;
        tracing::debug!(workflow_id = %workflow_id, task_id = %task_id, "claim released");
        Ok(true)
    }

    /// Workflows whose coordination is still active
    pub async fn active_workflows(&self) -> Vec<WorkflowId> {
        let coordinations: Vec<Arc<WorkflowCoordination>> =
            self.coordinations.iter().map(|entry| Arc::clone(entry.value())).collect();
        let mut active = Vec::new();
        for coordination in coordinations {
            if coordination.state.lock().await.status.is_active() {
                active.push(coordination.workflow_id);
            }
        }
        active
    }

    /// Record a completion and unblock dependents
    ///
    /// Returns the dependents whose last blocker was `task_id`. After
    /// cancellation the event is recorded for audit and nothing is
    /// unblocked.
    ///
    /// # Errors
    /// Unknown workflow or task, or a persistence failure (in which case no
    /// in-memory state changes).
    pub async fn report_task_completion(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
        result: Value,
    ) -> Result<Vec<TaskId>, CoordinationError> {
        let coordination = self.coordination(workflow_id)?;
        let mut state = coordination.state.lock().await;
        state.dependency(workflow_id, task_id)?;

        if matches!(state.status, CoordinationStatus::Cancelled | CoordinationStatus::Failed) {
            self.store
                .record_coordination(CoordinationRecord::new(
                    workflow_id,
                    task_id,
                    CoordinationEvent::IgnoredAfterCancel {
                        original: "completed".into(),
                    },
                ))
                .await?;
            tracing::info!(
                workflow_id = %workflow_id,
                task_id = %task_id,
                status = %state.status,
                "completion recorded after coordination stopped"
            );
            return Ok(Vec::new());
        }

        let unblocked = state.unblocked_by(task_id);
        self.store
            .record_coordination(CoordinationRecord::new(
                workflow_id,
                task_id,
                CoordinationEvent::Completed {
                    unblocked: unblocked.clone(),
                    result,
                },
            ))
            .await?;
        state.apply_completion(task_id);

        tracing::info!(
            workflow_id = %workflow_id,
            task_id = %task_id,
            unblocked = unblocked.len(),
            "task completion reported"
        );
        if state.status == CoordinationStatus::Completed {
            tracing::info!(workflow_id = %workflow_id, "coordination completed");
        }
        Ok(unblocked)
    }

    /// Record a failure; a non-retryable failure cascades
    ///
    /// The failure is persisted first. If not retryable the coordination is
    /// marked failed and every direct dependent is sent a `Failure` message.
    /// Returns the notified dependents.
    ///
    /// # Errors
    /// Unknown workflow or task, persistence or delivery failure.
    pub async fn report_task_failure(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
        failure: &TaskFailure,
        retryable: bool,
    ) -> Result<Vec<TaskId>, CoordinationError> {
        let coordination = self.coordination(workflow_id)?;
        let notifications = {
            let mut state = coordination.state.lock().await;
            state.dependency(workflow_id, task_id)?;

            let stopped = matches!(state.status, CoordinationStatus::Cancelled);
            let notified: Vec<TaskId> = if retryable || stopped {
                Vec::new()
            } else {
                state.dependents.get(&task_id).cloned().unwrap_or_default()
            };

            let event = if stopped {
                CoordinationEvent::IgnoredAfterCancel {
                    original: "failed".into(),
                }
            } else {
                CoordinationEvent::Failed {
                    error: failure.reason.clone(),
                    retryable,
                    notified: notified.clone(),
                }
            };
            self.store
                .record_coordination(CoordinationRecord::new(workflow_id, task_id, event))
                .await?;

            if retryable || stopped {
                tracing::warn!(
                    workflow_id = %workflow_id,
                    task_id = %task_id,
                    retryable,
                    reason = %failure.reason,
                    "task failure reported"
                );
                return Ok(Vec::new());
            }

            state.status = CoordinationStatus::Failed;
            tracing::error!(
                workflow_id = %workflow_id,
                task_id = %task_id,
                classification = %failure.classification,
                dependents = notified.len(),
                reason = %failure.reason,
                "non-retryable task failure, cascading to dependents"
            );

            notified
                .iter()
                .filter_map(|dependent| state.deps.get(dependent))
                .map(|dep| {
                    AgentMessage::new(
                        Participant::Coordinator,
                        Participant::Worker(dep.worker_class),
                        workflow_id,
                        dep.task_id,
                        MessagePayload::Failure {
                            failed_task: task_id,
                            reason: failure.reason.clone(),
                            classification: failure.classification,
                        },
                    )
                    .with_priority(FAILURE_MESSAGE_PRIORITY)
                })
                .collect::<Vec<_>>()
        };

        let notified: Vec<TaskId> = notifications.iter().map(|m| m.task_id).collect();
        for message in notifications {
            self.send_message(message).await?;
        }
        Ok(notified)
    }

    /// Persist a message, then forward it to the sink
    ///
    /// # Errors
    /// Persistence or delivery failure.
    pub async fn send_message(&self, message: AgentMessage) -> Result<(), CoordinationError> {
        self.store.record_message(&message).await?;
        tracing::debug!(
            workflow_id = %message.workflow_id,
            task_id = %message.task_id,
            message_type = ?message.message_type(),
            priority = message.priority,
            "message sent"
        );
        if let Some(sink) = &self.sink {
            sink.deliver(message).await?;
        }
        Ok(())
    }

    /// Put a value on the workflow's blackboard
    ///
    /// # Errors
    /// Unknown workflow or task, or a persistence failure.
    pub async fn share_artifact(
        &self,
        workflow_id: WorkflowId,
        source: TaskId,
        target: TaskId,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), CoordinationError> {
        let key = key.into();
        let coordination = self.coordination(workflow_id)?;
        let mut state = coordination.state.lock().await;
        state.dependency(workflow_id, source)?;
        state.dependency(workflow_id, target)?;

        self.store
            .append_audit(AuditEntry::new(
                workflow_id,
                Some(source),
                "artifact_shared",
                serde_json::json!({ "target": target, "key": key }),
            ))
            .await?;

        state.blackboard.insert(
            (source, target, key.clone()),
            SharedArtifact {
                source,
                target,
                key,
                value,
                shared_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Every artifact shared with `target`, optionally from one source
    ///
    /// # Errors
    /// `UnknownWorkflow` if the workflow is not coordinated.
    pub async fn get_shared_artifacts(
        &self,
        workflow_id: WorkflowId,
        target: TaskId,
        source: Option<TaskId>,
    ) -> Result<Vec<SharedArtifact>, CoordinationError> {
        let coordination = self.coordination(workflow_id)?;
        let state = coordination.state.lock().await;
        let mut shared: Vec<SharedArtifact> = state
            .blackboard
            .values()
            .filter(|a| a.target == target && source.map_or(true, |s| a.source == s))
            .cloned()
            .collect();
        shared.sort_by(|a, b| a.shared_at.cmp(&b.shared_at).then_with(|| a.key.cmp(&b.key)));
        Ok(shared)
    }

    /// Dependency record explaining why a task is or is not blocked
    ///
    /// # Errors
    /// Unknown workflow or task.
    pub async fn explain_blocked(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
    ) -> Result<TaskDependency, CoordinationError> {
        let coordination = self.coordination(workflow_id)?;
        let state = coordination.state.lock().await;
        state.dependency(workflow_id, task_id).cloned()
    }

    /// Stop further dispatch for a workflow
    ///
    /// # Errors
    /// Unknown workflow or a persistence failure.
    pub async fn cancel(&self, workflow_id: WorkflowId) -> Result<(), CoordinationError> {
        let coordination = self.coordination(workflow_id)?;
        let mut state = coordination.state.lock().await;
        if state.status == CoordinationStatus::Cancelled {
            return Ok(());
        }
        self.store
            .append_audit(AuditEntry::new(
                workflow_id,
                None,
                "coordination_cancelled",
                serde_json::json!({ "previous": state.status }),
            ))
            .await?;
        state.status = CoordinationStatus::Cancelled;
        tracing::info!(workflow_id = %workflow_id, "coordination cancelled");
        Ok(())
    }

    /// Summary of a coordination
    ///
    /// # Errors
    /// `UnknownWorkflow` if the workflow is not coordinated.
    pub async fn coordination_status(&self, workflow_id: WorkflowId) -> Result<CoordinationSnapshot, CoordinationError> {
        let coordination = self.coordination(workflow_id)?;
        let state = coordination.state.lock().await;
        let deps = state.deps.values();
        let (mut completed, mut in_flight, mut blocked) = (0, 0, 0);
        for dep in deps {
            if dep.completed {
                completed += 1;
            } else if dep.claimed {
                in_flight += 1;
            } else if dep.is_blocked {
                blocked += 1;
            }
        }
        Ok(CoordinationSnapshot {
            workflow_id,
            status: state.status,
            order: state.order.clone(),
            completed,
            in_flight,
            blocked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use forge_model::{FailureClass, MemoryStore, SinkError};
    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[derive(Default)]
    struct RecordingSink {
        delivered: SyncMutex<Vec<AgentMessage>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn deliver(&self, message: AgentMessage) -> Result<(), SinkError> {
            self.delivered.lock().push(message);
            Ok(())
        }
    }

    fn task(workflow_id: WorkflowId, title: &str, deps: &[TaskId]) -> Task {
        deps.iter().fold(
            Task::new(workflow_id, WorkerClass::Backend, title, 1),
            |t, d| t.depends_on(*d),
        )
    }

    /// a <- b, a <- c, (b, c) <- d
    fn diamond(workflow_id: WorkflowId) -> Vec<Task> {
        let a = task(workflow_id, "a", &[]);
        let b = task(workflow_id, "b", &[a.id]);
        let c = task(workflow_id, "c", &[a.id]);
        let d = task(workflow_id, "d", &[b.id, c.id]);
        vec![d, c, b, a]
    }

    fn coordinator() -> (DependencyCoordinator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (DependencyCoordinator::new(store.clone()), store)
    }

    #[tokio::test]
    async fn plan_orders_dependencies_first_and_persists() {
        let (coord, store) = coordinator();
        let wf = WorkflowId::new();
        let tasks = diamond(wf);
        let order = coord.create_coordination_plan(wf, &tasks).await.unwrap();

        let pos = |id: TaskId| order.iter().position(|t| *t == id).unwrap();
        for t in &tasks {
            for d in &t.dependencies {
                assert!(pos(*d) < pos(t.id));
            }
        }
        assert_eq!(store.coordination_records(wf).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn cycle_is_rejected_by_default() {
        let (coord, _) = coordinator();
        let wf = WorkflowId::new();
        let mut a = task(wf, "a", &[]);
        let b = task(wf, "b", &[a.id]);
        a = a.depends_on(b.id);

        let err = coord.create_coordination_plan(wf, &[a, b]).await.unwrap_err();
        assert!(matches!(err, CoordinationError::CycleDetected { ref cycle } if cycle.len() == 3));
        assert!(coord.is_empty());
    }

    #[tokio::test]
    async fn cycle_can_be_waived() {
        let store = Arc::new(MemoryStore::new());
        let coord = DependencyCoordinator::new(store).with_cycle_policy(CyclePolicy::WarnAndContinue);
        let wf = WorkflowId::new();
        let mut a = task(wf, "a", &[]);
        let b = task(wf, "b", &[a.id]);
        a = a.depends_on(b.id);
        let (a_id, b_id) = (a.id, b.id);

        let order = coord.create_coordination_plan(wf, &[a, b]).await.unwrap();
        assert_eq!(order, vec![b_id, a_id]);
        let explained = coord.explain_blocked(wf, b_id).await.unwrap();
        assert_eq!(explained.waived, vec![a_id]);
        assert!(!explained.is_blocked);
        assert_eq!(
            coord.get_next_executable_task(wf, &HashSet::new()).await.unwrap(),
            Some(b_id)
        );
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected() {
        let (coord, _) = coordinator();
        let wf = WorkflowId::new();
        let t = task(wf, "a", &[TaskId::new()]);
        assert!(matches!(
            coord.create_coordination_plan(wf, &[t]).await,
            Err(CoordinationError::UnknownDependency { .. })
        ));
    }

    #[tokio::test]
    async fn completion_unblocks_only_sole_dependents() {
        let (coord, _) = coordinator();
        let wf = WorkflowId::new();
        let tasks = diamond(wf);
        let (d, c, b, a) = (tasks[0].id, tasks[1].id, tasks[2].id, tasks[3].id);
        coord.create_coordination_plan(wf, &tasks).await.unwrap();

        let mut done = HashSet::new();
        assert_eq!(coord.get_next_executable_task(wf, &done).await.unwrap(), Some(a));

        let mut unblocked = coord.report_task_completion(wf, a, Value::Null).await.unwrap();
        unblocked.sort();
        let mut expected = vec![b, c];
        expected.sort();
        assert_eq!(unblocked, expected);
        done.insert(a);

        let next = coord.get_next_executable_task(wf, &done).await.unwrap().unwrap();
        assert!(next == b || next == c);

        assert_eq!(coord.report_task_completion(wf, b, Value::Null).await.unwrap(), Vec::<TaskId>::new());
        assert_eq!(coord.report_task_completion(wf, c, Value::Null).await.unwrap(), vec![d]);
        assert!(!coord.explain_blocked(wf, d).await.unwrap().is_blocked);
    }

    #[tokio::test]
    async fn ready_tasks_are_claimed_once() {
        let (coord, _) = coordinator();
        let wf = WorkflowId::new();
        let tasks = diamond(wf);
        let a = tasks[3].id;
        coord.create_coordination_plan(wf, &tasks).await.unwrap();

        assert_eq!(coord.claim_ready_tasks(wf, &HashSet::new()).await.unwrap(), vec![a]);
        assert!(coord.claim_ready_tasks(wf, &HashSet::new()).await.unwrap().is_empty());

        coord.report_task_completion(wf, a, Value::Null).await.unwrap();
        let first = coord.claim_ready_tasks(wf, &HashSet::new()).await.unwrap();
        let second = coord.claim_ready_tasks(wf, &HashSet::new()).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn released_claim_is_handed_out_again() {
        let (coord, _) = coordinator();
        let wf = WorkflowId::new();
        let tasks = diamond(wf);
        let (d, a) = (tasks[0].id, tasks[3].id);
        coord.create_coordination_plan(wf, &tasks).await.unwrap();

        assert_eq!(coord.claim_ready_tasks(wf, &HashSet::new()).await.unwrap(), vec![a]);
        assert!(coord.release_claim(wf, a).await.unwrap());
        assert!(!coord.release_claim(wf, a).await.unwrap());
        assert!(!coord.release_claim(wf, d).await.unwrap());
        assert_eq!(coord.claim_ready_tasks(wf, &HashSet::new()).await.unwrap(), vec![a]);

        coord.report_task_completion(wf, a, Value::Null).await.unwrap();
        assert!(!coord.release_claim(wf, a).await.unwrap());
        assert_eq!(coord.active_workflows().await, vec![wf]);
        coord.cancel(wf).await.unwrap();
        assert!(coord.active_workflows().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_never_overlap() {
        let (coord, _) = coordinator();
        let coord = Arc::new(coord);
        let wf = WorkflowId::new();
        let tasks: Vec<Task> = (0..32).map(|i| task(wf, &format!("t{i}"), &[])).collect();
        coord.create_coordination_plan(wf, &tasks).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coord = Arc::clone(&coord);
                tokio::spawn(async move { coord.claim_ready_tasks(wf, &HashSet::new()).await.unwrap() })
            })
            .collect();
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let unique: HashSet<TaskId> = all.iter().copied().collect();
        assert_eq!(all.len(), 32);
        assert_eq!(unique.len(), 32);
    }

    #[tokio::test]
    async fn fatal_failure_cascades_to_direct_dependents() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let coord = DependencyCoordinator::new(store.clone()).with_sink(sink.clone());
        let wf = WorkflowId::new();
        let tasks = diamond(wf);
        let (d, c, b, a) = (tasks[0].id, tasks[1].id, tasks[2].id, tasks[3].id);
        coord.create_coordination_plan(wf, &tasks).await.unwrap();

        let failure = TaskFailure::new("producer crashed", FailureClass::Fatal);
        let mut notified = coord.report_task_failure(wf, a, &failure, false).await.unwrap();
        notified.sort();
        let mut expected = vec![b, c];
        expected.sort();
        assert_eq!(notified, expected);

        let delivered = sink.delivered.lock().clone();
        assert_eq!(delivered.len(), 2);
        assert!(delivered.iter().all(|m| m.priority == FAILURE_MESSAGE_PRIORITY));
        assert!(delivered.iter().all(|m| matches!(
            m.payload,
            MessagePayload::Failure { failed_task, .. } if failed_task == a
        )));
        assert!(!delivered.iter().any(|m| m.task_id == d));
        assert_eq!(store.messages(wf).await.unwrap().len(), 2);

        let status = coord.coordination_status(wf).await.unwrap();
        assert_eq!(status.status, CoordinationStatus::Failed);
        assert!(coord.claim_ready_tasks(wf, &HashSet::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retryable_failure_does_not_cascade() {
        let (coord, store) = coordinator();
        let wf = WorkflowId::new();
        let tasks = diamond(wf);
        let a = tasks[3].id;
        coord.create_coordination_plan(wf, &tasks).await.unwrap();

        let failure = TaskFailure::new("timeout", FailureClass::Transient);
        assert!(coord.report_task_failure(wf, a, &failure, true).await.unwrap().is_empty());
        assert_eq!(coord.coordination_status(wf).await.unwrap().status, CoordinationStatus::Active);
        assert!(store.messages(wf).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completion_after_cancel_is_audited_but_unblocks_nothing() {
        let (coord, store) = coordinator();
        let wf = WorkflowId::new();
        let tasks = diamond(wf);
        let a = tasks[3].id;
        coord.create_coordination_plan(wf, &tasks).await.unwrap();
        coord.cancel(wf).await.unwrap();

        assert!(coord.report_task_completion(wf, a, Value::Null).await.unwrap().is_empty());
        let last = store.coordination_records(wf).await.unwrap().pop().unwrap();
        assert!(matches!(last.event, CoordinationEvent::IgnoredAfterCancel { .. }));
        assert!(coord.claim_ready_tasks(wf, &HashSet::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blackboard_is_keyed_by_source_target_and_key() {
        let (coord, _) = coordinator();
        let wf = WorkflowId::new();
        let tasks = diamond(wf);
        let (d, b, a) = (tasks[0].id, tasks[2].id, tasks[3].id);
        coord.create_coordination_plan(wf, &tasks).await.unwrap();

        coord.share_artifact(wf, a, d, "schema", serde_json::json!({ "v": 1 })).await.unwrap();
        coord.share_artifact(wf, a, d, "schema", serde_json::json!({ "v": 2 })).await.unwrap();
        coord.share_artifact(wf, b, d, "endpoint", serde_json::json!("/orders")).await.unwrap();

        let all = coord.get_shared_artifacts(wf, d, None).await.unwrap();
        assert_eq!(all.len(), 2);
        let from_a = coord.get_shared_artifacts(wf, d, Some(a)).await.unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].value, serde_json::json!({ "v": 2 }));
        assert!(coord.get_shared_artifacts(wf, b, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restore_replays_completions_and_claims() {
        let (coord, _) = coordinator();
        let wf = WorkflowId::new();
        let mut tasks = diamond(wf);
        let (d, c, b, a) = (tasks[0].id, tasks[1].id, tasks[2].id, tasks[3].id);
        tasks[3].status = TaskStatus::Completed;
        tasks[2].status = TaskStatus::InProgress;

        coord.restore(wf, &tasks).await.unwrap();
        assert_eq!(coord.claim_ready_tasks(wf, &HashSet::new()).await.unwrap(), vec![c]);
        let snapshot = coord.coordination_status(wf).await.unwrap();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.in_flight, 2);
        assert_eq!(snapshot.blocked, 1);
        assert!(coord.explain_blocked(wf, d).await.unwrap().blocked_until.contains(&b));
        assert!(!coord.explain_blocked(wf, d).await.unwrap().blocked_until.contains(&a));
    }

    #[tokio::test]
    async fn unknown_workflow_is_an_error() {
        let (coord, _) = coordinator();
        assert!(matches!(
            coord.get_next_executable_task(WorkflowId::new(), &HashSet::new()).await,
            Err(CoordinationError::UnknownWorkflow(_))
        ));
    }

    fn random_dag() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
        (1usize..24).prop_flat_map(|n| {
            let edges = proptest::collection::vec((0..n, 0..n), 0..n * 2);
            (Just(n), edges)
        })
    }

    proptest! {
        #[test]
        fn topological_order_respects_every_edge((n, raw_edges) in random_dag(), seed in any::<u64>()) {
            let wf = WorkflowId::new();
            let mut tasks: Vec<Task> = (0..n).map(|i| task(wf, &format!("t{i}"), &[])).collect();
            let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
            // only lower index -> higher index edges, so the graph is acyclic
            for (x, y) in raw_edges {
                let (dep, dependent) = (x.min(y), x.max(y));
                if dep != dependent {
                    let t = tasks[dependent].clone().depends_on(ids[dep]);
                    tasks[dependent] = t;
                }
            }
            let shift = usize::try_from(seed % n as u64).unwrap_or(0);
            tasks.rotate_left(shift);

            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let order = runtime.block_on(async {
                let (coord, _) = coordinator();
                coord.create_coordination_plan(wf, &tasks).await.unwrap()
            });

            prop_assert_eq!(order.len(), n);
            let pos: HashMap<TaskId, usize> = order.iter().enumerate().map(|(i, t)| (*t, i)).collect();
            for t in &tasks {
                for d in &t.dependencies {
                    prop_assert!(pos[d] < pos[&t.id]);
                }
            }
        }
    }
}
