//! Explanation gate
//!
//! A producer must explain itself before it may emit anything. The gate
//! checks the explanation for completeness against seven categories and the
//! feature's declared failure modes, and only then issues an
//! [`EmissionPermit`]. The permit cannot be built anywhere else, so code
//! that requires one cannot run without a passing gate.

use crate::error::GovernanceError;
use crate::failure::FailureModeRegistry;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use forge_model::{ExplanationId, TaskId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Choice between two options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tradeoff {
    /// What was decided
    pub decision: String,
    /// First option
    pub option_a: String,
    /// Second option
    pub option_b: String,
    /// Option taken
    pub choice: String,
    /// Why
    pub rationale: String,
}

/// Edge case and how it is handled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeCase {
    /// The case
    pub case: String,
    /// Handling disposition
    pub handling: String,
}

/// Risk severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSeverity {
    /// Low
    Low,
    /// Medium
    Medium,
    /// High
    High,
    /// Critical
    Critical,
}

/// Identified risk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Risk {
    /// What could go wrong
    pub description: String,
    /// Severity
    pub severity: RiskSeverity,
    /// Mitigation
    pub mitigation: String,
}

/// Handling disposition for one failure mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureModeHandling {
    /// Failure mode id
    pub mode_id: String,
    /// Whether the artifact handles the mode
    pub handled: bool,
    /// How
    pub approach: String,
}

/// Explanation category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplanationCategory {
    /// Assumptions
    Assumptions,
    /// Tradeoffs
    Tradeoffs,
    /// Constraints honored
    Constraints,
    /// Edge cases
    EdgeCases,
    /// Risks
    Risks,
    /// Contract validation summary
    ContractValidation,
    /// Per-failure-mode handling
    FailureModeHandling,
}

impl ExplanationCategory {
    /// Every category, in check order
    pub const ALL: [ExplanationCategory; 7] = [
        ExplanationCategory::Assumptions,
        ExplanationCategory::Tradeoffs,
        ExplanationCategory::Constraints,
        ExplanationCategory::EdgeCases,
        ExplanationCategory::Risks,
        ExplanationCategory::ContractValidation,
        ExplanationCategory::FailureModeHandling,
    ];
}

impl fmt::Display for ExplanationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExplanationCategory::Assumptions => "assumptions",
            ExplanationCategory::Tradeoffs => "tradeoffs",
            ExplanationCategory::Constraints => "constraints",
            ExplanationCategory::EdgeCases => "edge_cases",
            ExplanationCategory::Risks => "risks",
            ExplanationCategory::ContractValidation => "contract_validation",
            ExplanationCategory::FailureModeHandling => "failure_mode_handling",
        };
        f.write_str(s)
    }
}

/// Structured rationale tied to one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentExplanation {
    /// Explanation id
    pub id: ExplanationId,
    /// Task explained
    pub task_id: TaskId,
    /// Feature whose failure modes apply
    pub feature_id: String,
    /// Assumptions made
    pub assumptions: Vec<String>,
    /// Tradeoffs taken
    pub tradeoffs: Vec<Tradeoff>,
    /// Constraints honored
    pub constraints: Vec<String>,
    /// Edge cases
    pub edge_cases: Vec<EdgeCase>,
    /// Risks
    pub risks: Vec<Risk>,
    /// Contract validation summary
    pub contract_validation: Vec<String>,
    /// Failure mode handling
    pub failure_mode_handling: Vec<FailureModeHandling>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl AgentExplanation {
    /// Empty explanation for a task
    #[must_use]
    pub fn new(task_id: TaskId, feature_id: impl Into<String>) -> Self {
        Self {
            id: ExplanationId::new(),
            task_id,
            feature_id: feature_id.into(),
            assumptions: Vec::new(),
            tradeoffs: Vec::new(),
            constraints: Vec::new(),
            edge_cases: Vec::new(),
            risks: Vec::new(),
            contract_validation: Vec::new(),
            failure_mode_handling: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Add an assumption
    #[inline]
    #[must_use]
    pub fn assume(mut self, assumption: impl Into<String>) -> Self {
        self.assumptions.push(assumption.into());
        self
    }

    /// Add a tradeoff
    #[inline]
    #[must_use]
    pub fn tradeoff(mut self, tradeoff: Tradeoff) -> Self {
        self.tradeoffs.push(tradeoff);
        self
    }

    /// Add an honored constraint
    #[inline]
    #[must_use]
    pub fn honor(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    /// Add an edge case
    #[inline]
    #[must_use]
    pub fn edge_case(mut self, case: impl Into<String>, handling: impl Into<String>) -> Self {
        self.edge_cases.push(EdgeCase {
            case: case.into(),
            handling: handling.into(),
        });
        self
    }

    /// Add a risk
    #[inline]
    #[must_use]
    pub fn risk(mut self, risk: Risk) -> Self {
        self.risks.push(risk);
        self
    }

    /// Add a contract validation note
    #[inline]
    #[must_use]
    pub fn contract_note(mut self, note: impl Into<String>) -> Self {
        self.contract_validation.push(note.into());
        self
    }

    /// Mark a failure mode handled
    #[inline]
    #[must_use]
    pub fn handles(mut self, mode_id: impl Into<String>, approach: impl Into<String>) -> Self {
        self.failure_mode_handling.push(FailureModeHandling {
            mode_id: mode_id.into(),
            handled: true,
            approach: approach.into(),
        });
        self
    }

    /// Mark a failure mode acknowledged but unhandled
    #[inline]
    #[must_use]
    pub fn leaves_unhandled(mut self, mode_id: impl Into<String>, note: impl Into<String>) -> Self {
        self.failure_mode_handling.push(FailureModeHandling {
            mode_id: mode_id.into(),
            handled: false,
            approach: note.into(),
        });
        self
    }

    /// Categories with no entries
    #[must_use]
    pub fn missing_categories(&self) -> Vec<ExplanationCategory> {
        ExplanationCategory::ALL
            .into_iter()
            .filter(|c| self.is_empty_in(*c))
            .collect()
    }

    fn is_empty_in(&self, category: ExplanationCategory) -> bool {
        match category {
            ExplanationCategory::Assumptions => self.assumptions.is_empty(),
            ExplanationCategory::Tradeoffs => self.tradeoffs.is_empty(),
            ExplanationCategory::Constraints => self.constraints.is_empty(),
            ExplanationCategory::EdgeCases => self.edge_cases.is_empty(),
            ExplanationCategory::Risks => self.risks.is_empty(),
            ExplanationCategory::ContractValidation => self.contract_validation.is_empty(),
            ExplanationCategory::FailureModeHandling => self.failure_mode_handling.is_empty(),
        }
    }

    fn handled(&self, mode_id: &str) -> bool {
        self.failure_mode_handling
            .iter()
            .any(|h| h.mode_id == mode_id && h.handled)
    }
}

/// Proof that an explanation passed the gate
///
/// Only [`ExplanationGate::can_emit_code`] constructs permits.
#[derive(Debug)]
pub struct EmissionPermit {
    explanation_id: ExplanationId,
    task_id: TaskId,
    feature_id: String,
    issued_at: DateTime<Utc>,
}

impl EmissionPermit {
    /// Explanation that earned the permit
    #[inline]
    #[must_use]
    pub fn explanation_id(&self) -> ExplanationId {
        self.explanation_id
    }

    /// Task the permit covers
    #[inline]
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Feature the task belongs to
    #[inline]
    #[must_use]
    pub fn feature_id(&self) -> &str {
        &self.feature_id
    }

    /// Issue time
    #[inline]
    #[must_use]
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

/// Why the gate refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{reason}")]
pub struct GateRefusal {
    /// Explanation refused
    pub explanation_id: ExplanationId,
    /// Empty categories
    pub missing: Vec<ExplanationCategory>,
    /// Declared failure modes not marked handled
    pub unhandled_modes: Vec<String>,
    /// Human-readable reason
    pub reason: String,
}

impl GateRefusal {
    fn new(
        explanation_id: ExplanationId,
        missing: Vec<ExplanationCategory>,
        unhandled_modes: Vec<String>,
    ) -> Self {
        let mut parts = Vec::new();
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
            parts.push(format!("missing categories: {}", names.join(", ")));
        }
        if !unhandled_modes.is_empty() {
            parts.push(format!("unhandled failure modes: {}", unhandled_modes.join(", ")));
        }
        Self {
            explanation_id,
            missing,
            unhandled_modes,
            reason: format!("explanation {explanation_id} refused: {}", parts.join("; ")),
        }
    }
}

/// Observable summary of a gate check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    /// Whether emission is allowed
    pub allowed: bool,
    /// Refusal reason, if any
    pub reason: Option<String>,
    /// Empty categories
    pub missing: Vec<ExplanationCategory>,
    /// Unhandled failure modes
    pub unhandled_modes: Vec<String>,
}

impl From<&Result<EmissionPermit, GateRefusal>> for GateDecision {
    fn from(outcome: &Result<EmissionPermit, GateRefusal>) -> Self {
        match outcome {
            Ok(_) => Self {
                allowed: true,
                reason: None,
                missing: Vec::new(),
                unhandled_modes: Vec::new(),
            },
            Err(refusal) => Self {
                allowed: false,
                reason: Some(refusal.reason.clone()),
                missing: refusal.missing.clone(),
                unhandled_modes: refusal.unhandled_modes.clone(),
            },
        }
    }
}

/// Hard gate in front of every production call
#[derive(Debug)]
pub struct ExplanationGate {
    explanations: DashMap<ExplanationId, Arc<AgentExplanation>>,
    failure_modes: Arc<FailureModeRegistry>,
}

impl ExplanationGate {
    /// Create a gate consulting `failure_modes` for declared modes
    #[inline]
    #[must_use]
    pub fn new(failure_modes: Arc<FailureModeRegistry>) -> Self {
        Self {
            explanations: DashMap::new(),
            failure_modes,
        }
    }

    /// Record an explanation; ids are write-once
    ///
    /// # Errors
    /// `GovernanceError::ExplanationAlreadyRecorded` on a repeated id.
    pub fn record(&self, explanation: AgentExplanation) -> Result<ExplanationId, GovernanceError> {
        let id = explanation.id;
        match self.explanations.entry(id) {
            Entry::Occupied(_) => Err(GovernanceError::ExplanationAlreadyRecorded(id)),
            Entry::Vacant(slot) => {
                tracing::debug!(explanation_id = %id, task_id = %explanation.task_id, "explanation recorded");
                slot.insert(Arc::new(explanation));
                Ok(id)
            }
        }
    }

    /// Look up a recorded explanation
    #[inline]
    #[must_use]
    pub fn get(&self, id: ExplanationId) -> Option<Arc<AgentExplanation>> {
        self.explanations.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Check an explanation and issue a permit if it passes
    ///
    /// # Errors
    /// `GateRefusal` listing every empty category and every declared failure
    /// mode that is unhandled. An unknown id is refused on every category.
    pub fn can_emit_code(&self, id: ExplanationId) -> Result<EmissionPermit, GateRefusal> {
        let Some(explanation) = self.get(id) else {
            tracing::warn!(explanation_id = %id, "gate check on unknown explanation");
            return Err(GateRefusal::new(id, ExplanationCategory::ALL.to_vec(), Vec::new()));
        };

        let missing = explanation.missing_categories();
        let unhandled: Vec<String> = self
            .failure_modes
            .declared_modes(&explanation.feature_id)
            .into_iter()
            .filter(|mode| !explanation.handled(mode))
            .collect();

        if missing.is_empty() && unhandled.is_empty() {
            tracing::debug!(explanation_id = %id, task_id = %explanation.task_id, "emission permitted");
            return Ok(EmissionPermit {
                explanation_id: id,
                task_id: explanation.task_id,
                feature_id: explanation.feature_id.clone(),
                issued_at: Utc::now(),
            });
        }

        let refusal = GateRefusal::new(id, missing, unhandled);
        tracing::warn!(
            explanation_id = %id,
            task_id = %explanation.task_id,
            reason = %refusal.reason,
            "emission refused"
        );
        Err(refusal)
    }

    /// Gate check as an observable decision
    #[must_use]
    pub fn decide(&self, id: ExplanationId) -> GateDecision {
        GateDecision::from(&self.can_emit_code(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::{FailureMode, FeatureFailureSpec};
    use forge_model::FailureClass;
    use pretty_assertions::assert_eq;

    fn complete(task_id: TaskId, feature: &str) -> AgentExplanation {
        AgentExplanation::new(task_id, feature)
            .assume("orders are immutable once placed")
            .tradeoff(Tradeoff {
                decision: "total storage".into(),
                option_a: "store computed total".into(),
                option_b: "compute on read".into(),
                choice: "compute on read".into(),
                rationale: "single source of truth".into(),
            })
            .honor("totals are non-negative")
            .edge_case("empty cart", "total is zero")
            .risk(Risk {
                description: "rounding drift".into(),
                severity: RiskSeverity::Low,
                mitigation: "integer cents".into(),
            })
            .contract_note("order entity validated against shop contract v1")
    }

    fn gate_with(spec: FeatureFailureSpec) -> ExplanationGate {
        let registry = Arc::new(FailureModeRegistry::new());
        registry.register(spec);
        ExplanationGate::new(registry)
    }

    fn spec() -> FeatureFailureSpec {
        FeatureFailureSpec::new("checkout")
            .with_mode(FailureMode::new("payment-declined", "Declined", FailureClass::Recoverable))
            .with_mode(FailureMode::new("stock-out", "Stock out", FailureClass::Permanent))
    }

    #[test]
    fn complete_explanation_with_all_modes_handled_is_permitted() {
        let gate = gate_with(spec());
        let task = TaskId::new();
        let id = gate
            .record(
                complete(task, "checkout")
                    .handles("payment-declined", "surface retry prompt")
                    .handles("stock-out", "reject order"),
            )
            .unwrap();

        let permit = gate.can_emit_code(id).unwrap();
        assert_eq!(permit.task_id(), task);
        assert_eq!(permit.feature_id(), "checkout");
        assert!(gate.decide(id).allowed);
    }

    #[test]
    fn refusal_lists_every_gap() {
        let gate = gate_with(spec());
        let id = gate
            .record(
                AgentExplanation::new(TaskId::new(), "checkout")
                    .assume("a")
                    .leaves_unhandled("payment-declined", "not yet"),
            )
            .unwrap();

        let decision = gate.decide(id);
        assert!(!decision.allowed);
        assert_eq!(
            decision.missing,
            vec![
                ExplanationCategory::Tradeoffs,
                ExplanationCategory::Constraints,
                ExplanationCategory::EdgeCases,
                ExplanationCategory::Risks,
                ExplanationCategory::ContractValidation,
            ]
        );
        assert_eq!(decision.unhandled_modes, vec!["payment-declined", "stock-out"]);
        assert!(decision.reason.unwrap().contains("edge_cases"));
    }

    #[test]
    fn each_empty_category_alone_refuses() {
        let gate = gate_with(FeatureFailureSpec::new("f"));
        for category in ExplanationCategory::ALL {
            let mut explanation = complete(TaskId::new(), "f").handles("n/a", "none declared");
            match category {
                ExplanationCategory::Assumptions => explanation.assumptions.clear(),
                ExplanationCategory::Tradeoffs => explanation.tradeoffs.clear(),
                ExplanationCategory::Constraints => explanation.constraints.clear(),
                ExplanationCategory::EdgeCases => explanation.edge_cases.clear(),
                ExplanationCategory::Risks => explanation.risks.clear(),
                ExplanationCategory::ContractValidation => explanation.contract_validation.clear(),
                ExplanationCategory::FailureModeHandling => explanation.failure_mode_handling.clear(),
            }
            let id = gate.record(explanation).unwrap();
            let refusal = gate.can_emit_code(id).unwrap_err();
            assert_eq!(refusal.missing, vec![category]);
        }
    }

    #[test]
    fn explanations_are_write_once() {
        let gate = gate_with(FeatureFailureSpec::new("f"));
        let explanation = complete(TaskId::new(), "f");
        gate.record(explanation.clone()).unwrap();
        assert!(matches!(
            gate.record(explanation),
            Err(GovernanceError::ExplanationAlreadyRecorded(_))
        ));
    }

    #[test]
    fn unknown_explanation_is_refused() {
        let gate = gate_with(FeatureFailureSpec::new("f"));
        let refusal = gate.can_emit_code(ExplanationId::new()).unwrap_err();
        assert_eq!(refusal.missing.len(), 7);
    }
}
