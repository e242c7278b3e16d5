//! Validation pipeline
//!
//! Composes the governance stages into one acceptance decision for a
//! produced artifact. Every stage runs so the verdict carries complete
//! violation lists; the first failing stage names the rejection.

use crate::error::GovernanceError;
use crate::explanation::{EmissionPermit, GateRefusal};
use crate::failure::{
    CompletenessGap, FailureModeRegistry, CONTRACT_VIOLATION, EXPLANATION_INCOMPLETE,
    INVARIANT_VIOLATION, PURITY_VIOLATION,
};
use crate::invariant::{InvariantEnforcer, InvariantReport};
use crate::purity::{PurityGate, PurityReport, SourceFile};
use forge_contracts::{ContractRegistry, ContractViolation, Severity, ValidationResult};
use forge_model::FailureClass;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Produced entity instance to check against its contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Contract id
    pub contract_id: String,
    /// Entity name within the contract
    pub entity: String,
    /// Entity data
    pub data: Value,
}

impl EntityRecord {
    /// Create an entity record
    #[inline]
    #[must_use]
    pub fn new(contract_id: impl Into<String>, entity: impl Into<String>, data: Value) -> Self {
        Self {
            contract_id: contract_id.into(),
            entity: entity.into(),
            data,
        }
    }
}

/// What the pipeline inspects
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    /// Source files
    pub files: &'a [SourceFile],
    /// Entity instances
    pub entities: &'a [EntityRecord],
    /// Resulting state, checked by invariants
    pub state: &'a Value,
}

impl Candidate<'_> {
    /// blake3 digest over the candidate's content
    ///
    /// # Errors
    /// Serialization failure of entities or state.
    pub fn digest(&self) -> Result<String, GovernanceError> {
        let mut hasher = blake3::Hasher::new();
        for file in self.files {
            hasher.update(file.path.as_bytes());
            hasher.update(&[0]);
            hasher.update(file.content.as_bytes());
            hasher.update(&[0]);
        }
        hasher.update(&serde_json::to_vec(self.entities)?);
        hasher.update(&serde_json::to_vec(self.state)?);
        Ok(hasher.finalize().to_hex().to_string())
    }
}

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Explanation gate
    Explanation,
    /// Contract validation
    Contract,
    /// Invariant enforcement
    Invariant,
    /// Purity classification
    Purity,
}

impl Stage {
    /// Failure mode key a rejection at this stage maps to
    #[inline]
    #[must_use]
    pub fn failure_mode(&self) -> &'static str {
        match self {
            Stage::Explanation => EXPLANATION_INCOMPLETE,
            Stage::Contract => CONTRACT_VIOLATION,
            Stage::Invariant => INVARIANT_VIOLATION,
            Stage::Purity => PURITY_VIOLATION,
        }
    }

    /// Classification when the feature declares no mode for this stage
    #[inline]
    #[must_use]
    pub fn default_classification(&self) -> FailureClass {
        match self {
            Stage::Explanation | Stage::Contract => FailureClass::Permanent,
            Stage::Invariant | Stage::Purity => FailureClass::Recoverable,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Explanation => "explanation",
            Stage::Contract => "contract",
            Stage::Invariant => "invariant",
            Stage::Purity => "purity",
        };
        f.write_str(s)
    }
}

/// What happens to the task after the verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Artifact accepted
    Accept,
    /// Back to the queue retry path
    Retry,
    /// Terminal failure
    Fail,
}

/// Rejection details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// First failing stage
    pub stage: Stage,
    /// Failure mode the rejection maps to
    pub failure_mode: String,
    /// Classification of that mode
    pub classification: FailureClass,
    /// Human-readable reason
    pub reason: String,
}

/// Outcome of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Disposition
    pub disposition: Disposition,
    /// Rejection details when not accepted
    pub rejection: Option<Rejection>,
    /// Failure spec gaps, recorded for audit
    pub completeness_gaps: Vec<CompletenessGap>,
    /// Gate refusal, if the explanation failed
    pub refusal: Option<GateRefusal>,
    /// Per-entity contract results
    pub contracts: Vec<ValidationResult>,
    /// Invariant report
    pub invariants: InvariantReport,
    /// Invariant stage aborted by a raised violation
    pub raised: Option<String>,
    /// Purity report
    pub purity: PurityReport,
    /// Candidate digest
    pub digest: String,
}

impl Verdict {
    /// Whether the artifact was accepted
    #[inline]
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.disposition == Disposition::Accept
    }
}

/// The four-stage acceptance gate
#[derive(Debug, Clone)]
pub struct ValidationPipeline {
    contracts: Arc<ContractRegistry>,
    failure_modes: Arc<FailureModeRegistry>,
    invariants: Arc<InvariantEnforcer>,
    purity: Arc<PurityGate>,
}

impl ValidationPipeline {
    /// Compose a pipeline
    #[must_use]
    pub fn new(
        contracts: Arc<ContractRegistry>,
        failure_modes: Arc<FailureModeRegistry>,
        invariants: Arc<InvariantEnforcer>,
        purity: Arc<PurityGate>,
    ) -> Self {
        Self {
            contracts,
            failure_modes,
            invariants,
            purity,
        }
    }

    /// Failure mode registry consulted for dispositions
    #[inline]
    #[must_use]
    pub fn failure_modes(&self) -> &Arc<FailureModeRegistry> {
        &self.failure_modes
    }

    /// Completeness gaps of the feature; empty when nothing is registered
    #[must_use]
    pub fn completeness(&self, feature_id: &str) -> Vec<CompletenessGap> {
        match self.failure_modes.validate_completeness(feature_id) {
            Ok(gaps) => {
                if !gaps.is_empty() {
                    tracing::warn!(feature = feature_id, gaps = gaps.len(), "incomplete failure specification");
                }
                gaps
            }
            Err(_) => {
                tracing::debug!(feature = feature_id, "no failure specification registered");
                Vec::new()
            }
        }
    }

    /// Reject at `stage`, classifying through the feature's declared mode
    #[must_use]
    pub fn reject(&self, feature_id: &str, stage: Stage, reason: impl Into<String>) -> (Disposition, Rejection) {
        let failure_mode = stage.failure_mode();
        let classification = self
            .failure_modes
            .classify(feature_id, failure_mode)
            .unwrap_or_else(|| stage.default_classification());
        let disposition = if classification.is_retryable() {
            Disposition::Retry
        } else {
            Disposition::Fail
        };
        (
            disposition,
            Rejection {
                stage,
                failure_mode: failure_mode.to_string(),
                classification,
                reason: reason.into(),
            },
        )
    }

    /// Verdict for an explanation the gate refused
    #[must_use]
    pub fn refused(&self, feature_id: &str, refusal: GateRefusal) -> Verdict {
        let (disposition, rejection) = self.reject(feature_id, Stage::Explanation, refusal.reason.clone());
        Verdict {
            disposition,
            rejection: Some(rejection),
            completeness_gaps: self.completeness(feature_id),
            refusal: Some(refusal),
            contracts: Vec::new(),
            invariants: InvariantReport::default(),
            raised: None,
            purity: PurityReport::default(),
            digest: String::new(),
        }
    }

    /// Evaluate a produced candidate
    ///
    /// The permit proves the explanation stage already passed.
    ///
    /// # Errors
    /// Only on digest serialization failure; every stage failure is reported
    /// through the verdict.
    pub async fn evaluate(
        &self,
        permit: &EmissionPermit,
        candidate: Candidate<'_>,
    ) -> Result<Verdict, GovernanceError> {
        let feature_id = permit.feature_id();
        let completeness_gaps = self.completeness(feature_id);
        let digest = candidate.digest()?;

        let contracts: Vec<ValidationResult> = candidate
            .entities
            .iter()
            .map(|record| self.check_entity(record))
            .collect();
        let contract_errors: Vec<String> = contracts
            .iter()
            .flat_map(|r| {
                r.errors
                    .iter()
                    .filter(|e| e.severity == Severity::Error)
                    .map(move |e| format!("{}.{}: {}", r.entity, e.path, e.message))
            })
            .collect();

        let (invariants, raised) = match self.invariants.check_all(candidate.state) {
            Ok(report) => (report, None),
            Err(err @ GovernanceError::InvariantViolated { .. }) => {
                (InvariantReport::default(), Some(err.to_string()))
            }
            Err(other) => return Err(other),
        };

        let purity = self.purity.analyze(candidate.files).await;

        let failure = if !contract_errors.is_empty() {
            Some((Stage::Contract, contract_errors.join("; ")))
        } else if let Some(reason) = &raised {
            Some((Stage::Invariant, reason.clone()))
        } else if !invariants.all_hard_satisfied() {
            let ids: Vec<&str> = invariants.hard_violations().map(|v| v.id.as_str()).collect();
            Some((Stage::Invariant, format!("hard invariants violated: {}", ids.join(", "))))
        } else if !purity.is_clean() {
            let paths: Vec<&str> = purity.violations.iter().map(|v| v.path.as_str()).collect();
            Some((Stage::Purity, format!("side effects in business logic: {}", paths.join(", "))))
        } else {
            None
        };

        let (disposition, rejection) = match failure {
            None => (Disposition::Accept, None),
            Some((stage, reason)) => {
                let (disposition, rejection) = self.reject(feature_id, stage, reason);
                (disposition, Some(rejection))
            }
        };

        match &rejection {
            None => tracing::info!(task_id = %permit.task_id(), %digest, "artifact accepted"),
            Some(r) => tracing::warn!(
                task_id = %permit.task_id(),
                stage = %r.stage,
                failure_mode = %r.failure_mode,
                disposition = ?disposition,
                "artifact rejected"
            ),
        }

        Ok(Verdict {
            disposition,
            rejection,
            completeness_gaps,
            refusal: None,
            contracts,
            invariants,
            raised,
            purity,
            digest,
        })
    }

    fn check_entity(&self, record: &EntityRecord) -> ValidationResult {
        self.contracts
            .validate_entity(&record.contract_id, &record.entity, &record.data)
            .unwrap_or_else(|err| ValidationResult {
                contract_id: record.contract_id.clone(),
                entity: record.entity.clone(),
                valid: false,
                errors: vec![ContractViolation {
                    path: String::new(),
                    constraint: "contract".into(),
                    message: err.to_string(),
                    severity: Severity::Error,
                }],
            })
    }
}
