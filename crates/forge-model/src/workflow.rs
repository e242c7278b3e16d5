//! Workflow and execution plan

use crate::error::PlanError;
use crate::ids::{TaskId, WorkflowId};
use crate::requirement::Requirement;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Workflow lifecycle status
///
/// Transitions are monotonic forward in declaration order; `Failed` is
/// reachable from any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Row created
    Created,
    /// Requirement under validation
    Validating,
    /// Plan under construction
    Planning,
    /// Generation phases running
    Executing,
    /// Verification phase running
    Testing,
    /// Validation-gate or integration phase running
    Reviewing,
    /// Every task completed
    Completed,
    /// Terminal failure or cancellation
    Failed,
}

impl WorkflowStatus {
    /// Whether no further transitions are allowed
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition
    #[inline]
    #[must_use]
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == WorkflowStatus::Failed || next > *self
    }
}

/// What a phase does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Artifact generation
    Generation,
    /// Test generation
    Verification,
    /// Audit and review
    ValidationGate,
    /// Pipeline and deployment wiring
    Integration,
}

/// One phase of an execution plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// 1-based phase number
    pub number: u32,
    /// Phase name
    pub name: String,
    /// Phase kind
    pub kind: PhaseKind,
    /// Tasks belonging to this phase, in execution order
    pub task_ids: Vec<TaskId>,
    /// Phase numbers that must complete first
    pub requires: Vec<u32>,
}

/// Ordered list of phases
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Phases in execution order
    pub phases: Vec<Phase>,
}

impl ExecutionPlan {
    /// Check that no phase references itself or a later phase
    ///
    /// # Errors
    /// `PlanError::ForwardReference` for the first offending prerequisite,
    /// `PlanError::DuplicatePhase` if two phases share a number.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut seen = std::collections::BTreeSet::new();
        for phase in &self.phases {
            if !seen.insert(phase.number) {
                return Err(PlanError::DuplicatePhase(phase.number));
            }
            if let Some(&bad) = phase.requires.iter().find(|&&r| r >= phase.number) {
                return Err(PlanError::ForwardReference {
                    phase: phase.number,
                    requires: bad,
                });
            }
        }
        Ok(())
    }

    /// Find a phase by number
    #[inline]
    #[must_use]
    pub fn phase(&self, number: u32) -> Option<&Phase> {
        self.phases.iter().find(|p| p.number == number)
    }

    /// Total task count across phases
    #[inline]
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.task_ids.len()).sum()
    }
}

/// One workflow per feature requirement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow identifier
    pub id: WorkflowId,
    /// Lifecycle status
    pub status: WorkflowStatus,
    /// Parsed requirement
    pub requirement: Requirement,
    /// Execution plan
    pub plan: ExecutionPlan,
    /// Owner (submitter)
    pub owner: String,
    /// Reason recorded on failure or cancellation
    pub failure_reason: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// First dispatch
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Create a workflow in `Created` status
    #[must_use]
    pub fn new(requirement: Requirement, owner: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(),
            status: WorkflowStatus::Created,
            requirement,
            plan: ExecutionPlan::default(),
            owner: owner.into(),
            failure_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a transition, stamping timestamps
    ///
    /// # Errors
    /// `PlanError::IllegalTransition` if the transition breaks monotonicity.
    pub fn transition(&mut self, next: WorkflowStatus) -> Result<(), PlanError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(PlanError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == WorkflowStatus::Executing && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Whether the workflow was failed or cancelled
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status == WorkflowStatus::Failed
    }
}
