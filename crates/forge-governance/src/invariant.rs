//! Invariant enforcement
//!
//! Invariants are pure predicates over candidate artifact state. Hard
//! invariants gate acceptance; soft invariants are logged and recorded.

use crate::error::GovernanceError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Predicate over candidate state
pub type StatePredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Enforcement level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantLevel {
    /// Must hold for acceptance
    Hard,
    /// Recorded, never blocks
    Soft,
}

/// Action taken on violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationAction {
    /// Record as an error
    Error,
    /// Abort the check with `GovernanceError::InvariantViolated`
    Raise,
    /// Log only
    Log,
}

/// How hard violations surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// First hard violation aborts the check
    FailFast,
    /// Collect every violation into the report
    #[default]
    Report,
}

/// Global rule over produced state
#[derive(Clone)]
pub struct Invariant {
    /// Invariant id
    pub id: String,
    /// What the invariant asserts
    pub description: String,
    /// Category, e.g. `data-integrity`
    pub category: String,
    /// Enforcement level
    pub level: InvariantLevel,
    /// Action on violation
    pub action: ViolationAction,
    predicate: StatePredicate,
}

impl Invariant {
    /// Hard invariant recorded as an error on violation
    pub fn hard<F>(id: impl Into<String>, description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            description: description.into(),
            category: "general".into(),
            level: InvariantLevel::Hard,
            action: ViolationAction::Error,
            predicate: Arc::new(predicate),
        }
    }

    /// Soft invariant logged on violation
    pub fn soft<F>(id: impl Into<String>, description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            level: InvariantLevel::Soft,
            action: ViolationAction::Log,
            ..Self::hard(id, description, predicate)
        }
    }

    /// With category
    #[inline]
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// With violation action
    #[inline]
    #[must_use]
    pub fn with_action(mut self, action: ViolationAction) -> Self {
        self.action = action;
        self
    }

    /// Evaluate against state
    #[inline]
    #[must_use]
    pub fn holds(&self, state: &Value) -> bool {
        (self.predicate)(state)
    }
}

impl fmt::Debug for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invariant")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

/// One recorded violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Invariant id
    pub id: String,
    /// Invariant description
    pub description: String,
    /// Category
    pub category: String,
    /// Level
    pub level: InvariantLevel,
    /// Configured action
    pub action: ViolationAction,
}

impl InvariantViolation {
    fn of(invariant: &Invariant) -> Self {
        Self {
            id: invariant.id.clone(),
            description: invariant.description.clone(),
            category: invariant.category.clone(),
            level: invariant.level,
            action: invariant.action,
        }
    }

    /// Whether this violation blocks acceptance
    #[inline]
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.level == InvariantLevel::Hard
    }
}

/// Outcome of `check_all`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantReport {
    /// Number of invariants evaluated
    pub checked: usize,
    /// Violations, hard and soft
    pub violations: Vec<InvariantViolation>,
}

impl InvariantReport {
    /// Hard violations only
    pub fn hard_violations(&self) -> impl Iterator<Item = &InvariantViolation> {
        self.violations.iter().filter(|v| v.is_blocking())
    }

    /// True iff no hard invariant was violated
    #[inline]
    #[must_use]
    pub fn all_hard_satisfied(&self) -> bool {
        self.hard_violations().next().is_none()
    }
}

/// Registry and evaluator of invariants
#[derive(Debug, Default)]
pub struct InvariantEnforcer {
    invariants: RwLock<Vec<Invariant>>,
    mode: EnforcementMode,
}

impl InvariantEnforcer {
    /// Create an enforcer in report mode
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With enforcement mode
    #[inline]
    #[must_use]
    pub fn with_mode(mut self, mode: EnforcementMode) -> Self {
        self.mode = mode;
        self
    }

    /// Current enforcement mode
    #[inline]
    #[must_use]
    pub fn mode(&self) -> EnforcementMode {
        self.mode
    }

    /// Register an invariant
    ///
    /// # Errors
    /// `GovernanceError::DuplicateInvariant` if the id is taken.
    pub fn register(&self, invariant: Invariant) -> Result<(), GovernanceError> {
        let mut invariants = self.invariants.write();
        if invariants.iter().any(|i| i.id == invariant.id) {
            return Err(GovernanceError::DuplicateInvariant(invariant.id));
        }
        tracing::debug!(invariant = %invariant.id, level = ?invariant.level, "invariant registered");
        invariants.push(invariant);
        Ok(())
    }

    /// Number of registered invariants
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.invariants.read().len()
    }

    /// Whether no invariant is registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.invariants.read().is_empty()
    }

    /// Evaluate every invariant against `state`
    ///
    /// # Errors
    /// `GovernanceError::InvariantViolated` on the first hard violation whose
    /// action is `raise`, or on any hard violation in fail-fast mode.
    pub fn check_all(&self, state: &Value) -> Result<InvariantReport, GovernanceError> {
        let invariants = self.invariants.read();
        let mut report = InvariantReport {
            checked: invariants.len(),
            violations: Vec::new(),
        };

        for invariant in invariants.iter().filter(|i| !i.holds(state)) {
            match invariant.level {
                InvariantLevel::Hard => {
                    if invariant.action == ViolationAction::Raise
                        || self.mode == EnforcementMode::FailFast
                    {
                        tracing::error!(invariant = %invariant.id, "hard invariant violated");
                        return Err(GovernanceError::InvariantViolated {
                            id: invariant.id.clone(),
                            description: invariant.description.clone(),
                        });
                    }
                    match invariant.action {
                        ViolationAction::Log => {
                            tracing::warn!(invariant = %invariant.id, "hard invariant violated");
                        }
                        _ => tracing::error!(invariant = %invariant.id, "hard invariant violated"),
                    }
                }
                InvariantLevel::Soft => {
                    tracing::warn!(
                        invariant = %invariant.id,
                        category = %invariant.category,
                        "soft invariant violated"
                    );
                }
            }
            report.violations.push(InvariantViolation::of(invariant));
        }

        Ok(report)
    }

    /// Boolean acceptance summary; a raised violation counts as unsatisfied
    #[must_use]
    pub fn all_hard_invariants_satisfied(&self, state: &Value) -> bool {
        self.check_all(state)
            .map(|report| report.all_hard_satisfied())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn non_negative() -> Invariant {
        Invariant::hard("non-negative-total", "total must be non-negative", |s| {
            s["total"].as_f64().is_some_and(|t| t >= 0.0)
        })
        .with_category("data-integrity")
    }

    fn named() -> Invariant {
        Invariant::soft("has-name", "entity should carry a name", |s| s["name"].is_string())
    }

    #[test]
    fn report_mode_collects_every_violation() {
        let enforcer = InvariantEnforcer::new();
        enforcer.register(non_negative()).unwrap();
        enforcer.register(named()).unwrap();

        let report = enforcer.check_all(&json!({ "total": -3 })).unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.violations.len(), 2);
        assert_eq!(report.hard_violations().count(), 1);
        assert!(!report.all_hard_satisfied());
    }

    #[test]
    fn soft_violations_do_not_block() {
        let enforcer = InvariantEnforcer::new();
        enforcer.register(non_negative()).unwrap();
        enforcer.register(named()).unwrap();

        let report = enforcer.check_all(&json!({ "total": 4 })).unwrap();
        assert_eq!(report.violations.len(), 1);
        assert!(report.all_hard_satisfied());
        assert!(enforcer.all_hard_invariants_satisfied(&json!({ "total": 4 })));
    }

    #[test]
    fn raise_action_aborts() {
        let enforcer = InvariantEnforcer::new();
        enforcer
            .register(non_negative().with_action(ViolationAction::Raise))
            .unwrap();
        assert!(matches!(
            enforcer.check_all(&json!({ "total": -1 })),
            Err(GovernanceError::InvariantViolated { .. })
        ));
        assert!(!enforcer.all_hard_invariants_satisfied(&json!({ "total": -1 })));
    }

    #[test]
    fn fail_fast_mode_aborts_on_any_hard_violation() {
        let enforcer = InvariantEnforcer::new().with_mode(EnforcementMode::FailFast);
        enforcer.register(named()).unwrap();
        enforcer.register(non_negative()).unwrap();

        assert!(enforcer.check_all(&json!({ "total": 1 })).is_ok());
        assert!(enforcer.check_all(&json!({ "total": -1 })).is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let enforcer = InvariantEnforcer::new();
        enforcer.register(non_negative()).unwrap();
        assert!(matches!(
            enforcer.register(non_negative()),
            Err(GovernanceError::DuplicateInvariant(_))
        ));
        assert_eq!(enforcer.len(), 1);
    }
}
