//! Task state model
//!
//! A task is one unit of generatable work owned by a workflow. Its status is
//! driven by the task queue and the workflow engine; the blocked flag lives
//! in the coordinator's derived `TaskDependency` record.

use crate::ids::{TaskId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Attempt limit of a task before it is assigned to a queue
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Category of worker a task is routed to
///
/// Each class has its own queue and concurrency policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerClass {
    /// User-facing components
    Frontend,
    /// Services and endpoints
    Backend,
    /// Pipelines, provisioning and deployment wiring
    Infrastructure,
    /// Audits and dependency scanning
    Security,
    /// Test suites
    Testing,
}

impl WorkerClass {
    /// Every worker class, in a stable order
    pub const ALL: [WorkerClass; 5] = [
        WorkerClass::Frontend,
        WorkerClass::Backend,
        WorkerClass::Infrastructure,
        WorkerClass::Security,
        WorkerClass::Testing,
    ];

    /// Default worker concurrency for this class
    #[inline]
    #[must_use]
    pub fn default_capacity(&self) -> usize {
        match self {
            WorkerClass::Frontend | WorkerClass::Backend | WorkerClass::Testing => 3,
            WorkerClass::Infrastructure | WorkerClass::Security => 2,
        }
    }

    /// Stable lowercase name (used as metric label)
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerClass::Frontend => "frontend",
            WorkerClass::Backend => "backend",
            WorkerClass::Infrastructure => "infrastructure",
            WorkerClass::Security => "security",
            WorkerClass::Testing => "testing",
        }
    }
}

impl fmt::Display for WorkerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Must run first
    Critical,
    /// Ahead of ordinary work
    High,
    /// Ordinary work
    Medium,
    /// Background work
    Low,
}

impl Priority {
    /// Queue-internal score; higher is dispatched first
    #[inline]
    #[must_use]
    pub fn score(&self) -> u32 {
        match self {
            Priority::Critical => 100,
            Priority::High => 50,
            Priority::Medium => 25,
            Priority::Low => 10,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet dispatched
    Pending,
    /// Submitted to a queue
    Assigned,
    /// A worker is executing it
    InProgress,
    /// Artifact accepted
    Completed,
    /// Terminal failure
    Failed,
    /// Waiting for a queue retry
    Retry,
    /// A dependency failed terminally; never dispatched
    Blocked,
}

impl TaskStatus {
    /// Whether no further transitions are expected
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Machine-readable classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Can be recovered by a declared strategy
    Recoverable,
    /// Never retried; cascades to dependents
    Fatal,
    /// Caused by another failure mode
    Cascading,
    /// Expected to clear on retry
    Transient,
    /// Will not clear on retry
    Permanent,
}

impl FailureClass {
    /// Whether the queue retry path applies
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::Recoverable | FailureClass::Transient)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureClass::Recoverable => "recoverable",
            FailureClass::Fatal => "fatal",
            FailureClass::Cascading => "cascading",
            FailureClass::Transient => "transient",
            FailureClass::Permanent => "permanent",
        };
        f.write_str(s)
    }
}

/// Failure payload recorded on a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Human-readable reason
    pub reason: String,
    /// Machine-readable classification
    pub classification: FailureClass,
    /// Failure mode id from the feature's failure specification, if matched
    pub failure_mode: Option<String>,
    /// Attempts made before the failure became terminal
    pub attempts: u32,
}

impl TaskFailure {
    /// Create a new failure record
    #[inline]
    #[must_use]
    pub fn new(reason: impl Into<String>, classification: FailureClass) -> Self {
        Self {
            reason: reason.into(),
            classification,
            failure_mode: None,
            attempts: 0,
        }
    }

    /// With matched failure mode
    #[inline]
    #[must_use]
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.failure_mode = Some(mode.into());
        self
    }

    /// With attempt count
    #[inline]
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Executable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier
    pub id: TaskId,
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Worker class the task is routed to
    pub worker_class: WorkerClass,
    /// Short title
    pub title: String,
    /// Work description handed to the producer
    pub description: String,
    /// Phase number in the execution plan
    pub phase: u32,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Dispatch priority
    pub priority: Priority,
    /// Tasks that must complete first, in declaration order
    pub dependencies: Vec<TaskId>,
    /// Retries consumed so far
    pub retry_count: u32,
    /// Attempts allowed before a retryable failure becomes terminal;
    /// set from the class queue policy when the task is assigned
    pub max_retries: u32,
    /// Result payload of an accepted artifact
    pub result: Option<serde_json::Value>,
    /// Failure payload of a terminal failure
    pub failure: Option<TaskFailure>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// First transition to in-progress
    pub started_at: Option<DateTime<Utc>>,
    /// Transition to completed or failed
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        worker_class: WorkerClass,
        title: impl Into<String>,
        phase: u32,
    ) -> Self {
        Self {
            id: TaskId::new(),
            workflow_id,
            worker_class,
            title: title.into(),
            description: String::new(),
            phase,
            status: TaskStatus::Pending,
            priority: Priority::default(),
            dependencies: Vec::new(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_ATTEMPTS,
            result: None,
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// With description
    #[inline]
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// With priority
    #[inline]
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// With dependency
    #[inline]
    #[must_use]
    pub fn depends_on(mut self, task_id: TaskId) -> Self {
        if !self.dependencies.contains(&task_id) {
            self.dependencies.push(task_id);
        }
        self
    }

    /// Apply a status change and stamp lifecycle timestamps
    pub fn apply_status(&mut self, status: TaskStatus) {
        let now = Utc::now();
        match status {
            TaskStatus::InProgress if self.started_at.is_none() => self.started_at = Some(now),
            TaskStatus::Completed | TaskStatus::Failed => self.completed_at = Some(now),
            TaskStatus::Retry => self.retry_count += 1,
            _ => {}
        }
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_scores_are_ordered() {
        assert_eq!(Priority::Critical.score(), 100);
        assert_eq!(Priority::High.score(), 50);
        assert_eq!(Priority::Medium.score(), 25);
        assert_eq!(Priority::Low.score(), 10);
    }

    #[test]
    fn apply_status_stamps_timestamps() {
        let mut task = Task::new(WorkflowId::new(), WorkerClass::Backend, "t", 1);
        task.apply_status(TaskStatus::InProgress);
        let started = task.started_at;
        assert!(started.is_some());

        task.apply_status(TaskStatus::Retry);
        assert_eq!(task.retry_count, 1);

        task.apply_status(TaskStatus::InProgress);
        assert_eq!(task.started_at, started);

        task.apply_status(TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert!(task.status.is_terminal());
    }

    #[test]
    fn depends_on_deduplicates() {
        let dep = TaskId::new();
        let task = Task::new(WorkflowId::new(), WorkerClass::Frontend, "t", 1)
            .depends_on(dep)
            .depends_on(dep);
        assert_eq!(task.dependencies, vec![dep]);
    }

    #[test]
    fn failure_class_retryability() {
        assert!(FailureClass::Transient.is_retryable());
        assert!(FailureClass::Recoverable.is_retryable());
        assert!(!FailureClass::Fatal.is_retryable());
        assert!(!FailureClass::Permanent.is_retryable());
        assert!(!FailureClass::Cascading.is_retryable());
    }

    #[test]
    fn worker_class_serializes_snake_case() {
        let json = serde_json::to_string(&WorkerClass::Infrastructure).unwrap();
        assert_eq!(json, "\"infrastructure\"");
    }
}
