//! Failure mode registry
//!
//! Every feature declares, before any of its tasks run, the ways its work can
//! fail. Each mode is classified, names what triggers it and which invariants
//! it threatens, and lists how to recover. The registry answers two
//! questions: is a declaration complete, and what cascades from a given
//! failure.

use crate::error::GovernanceError;
use dashmap::DashMap;
use forge_model::FailureClass;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Failure mode key for producer timeouts
pub const PRODUCER_TIMEOUT: &str = "producer-timeout";
/// Failure mode key for fatal producer errors
pub const PRODUCER_FATAL: &str = "producer-fatal";
/// Failure mode key for contract rejections
pub const CONTRACT_VIOLATION: &str = "contract-violation";
/// Failure mode key for gate refusals
pub const EXPLANATION_INCOMPLETE: &str = "explanation-incomplete";
/// Failure mode key for hard invariant rejections
pub const INVARIANT_VIOLATION: &str = "invariant-violation";
/// Failure mode key for purity rejections
pub const PURITY_VIOLATION: &str = "purity-violation";
/// Failure mode key for upstream task failures
pub const DEPENDENCY_FAILED: &str = "dependency-failed";

/// What sets a failure mode off
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Trigger {
    /// Free-form observable condition
    Condition(String),
    /// Occurrence of another failure mode
    FailureMode(String),
}

/// How to recover from a failure mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum RecoveryStrategy {
    /// Re-run through the queue retry path
    Retry {
        /// Attempt budget
        max_attempts: u32,
    },
    /// Substitute a degraded result
    Fallback {
        /// What the fallback does
        description: String,
    },
    /// Undo partial effects
    Compensate {
        /// What is compensated
        description: String,
    },
    /// Hand to a human or another system
    Escalate {
        /// Escalation target
        to: String,
    },
}

/// Alert level raised when the mode occurs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Informational
    Info,
    /// Needs attention
    #[default]
    Warning,
    /// Needs immediate attention
    Critical,
}

/// One declared way work can fail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureMode {
    /// Mode id, unique within the feature
    pub id: String,
    /// Display name
    pub name: String,
    /// Classification
    pub classification: FailureClass,
    /// Triggers
    pub triggers: Vec<Trigger>,
    /// Invariants this mode threatens
    pub invariant_impacts: Vec<String>,
    /// Recovery strategies; may be empty only for fatal modes
    pub recovery: Vec<RecoveryStrategy>,
    /// Alert level
    pub alert: AlertLevel,
}

impl FailureMode {
    /// Create a mode with no triggers, impacts or recovery
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, classification: FailureClass) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            classification,
            triggers: Vec::new(),
            invariant_impacts: Vec::new(),
            recovery: Vec::new(),
            alert: AlertLevel::default(),
        }
    }

    /// Add a condition trigger
    #[inline]
    #[must_use]
    pub fn triggered_when(mut self, condition: impl Into<String>) -> Self {
        self.triggers.push(Trigger::Condition(condition.into()));
        self
    }

    /// Add a failure-mode trigger
    #[inline]
    #[must_use]
    pub fn triggered_by(mut self, mode: impl Into<String>) -> Self {
        self.triggers.push(Trigger::FailureMode(mode.into()));
        self
    }

    /// Add an invariant impact
    #[inline]
    #[must_use]
    pub fn impacts(mut self, invariant: impl Into<String>) -> Self {
        self.invariant_impacts.push(invariant.into());
        self
    }

    /// Add a recovery strategy
    #[inline]
    #[must_use]
    pub fn recover_with(mut self, strategy: RecoveryStrategy) -> Self {
        self.recovery.push(strategy);
        self
    }

    /// With alert level
    #[inline]
    #[must_use]
    pub fn with_alert(mut self, alert: AlertLevel) -> Self {
        self.alert = alert;
        self
    }

    fn is_triggered_by(&self, mode: &str) -> bool {
        self.triggers
            .iter()
            .any(|t| matches!(t, Trigger::FailureMode(m) if m == mode))
    }
}

/// All failure modes declared for one feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFailureSpec {
    /// Feature id
    pub feature_id: String,
    /// Modes by id, in declaration order
    pub modes: IndexMap<String, FailureMode>,
    /// Invariants critical to the feature
    pub critical_invariants: Vec<String>,
}

impl FeatureFailureSpec {
    /// Create an empty declaration
    #[inline]
    #[must_use]
    pub fn new(feature_id: impl Into<String>) -> Self {
        Self {
            feature_id: feature_id.into(),
            modes: IndexMap::new(),
            critical_invariants: Vec::new(),
        }
    }

    /// Add a mode
    #[inline]
    #[must_use]
    pub fn with_mode(mut self, mode: FailureMode) -> Self {
        self.modes.insert(mode.id.clone(), mode);
        self
    }

    /// Add a critical invariant
    #[inline]
    #[must_use]
    pub fn with_critical_invariant(mut self, invariant: impl Into<String>) -> Self {
        self.critical_invariants.push(invariant.into());
        self
    }

    /// Look up a mode
    #[inline]
    #[must_use]
    pub fn mode(&self, id: &str) -> Option<&FailureMode> {
        self.modes.get(id)
    }

    /// Default taxonomy covering every way the engine itself rejects work
    #[must_use]
    pub fn baseline(feature_id: impl Into<String>) -> Self {
        let retry = RecoveryStrategy::Retry { max_attempts: 3 };
        Self::new(feature_id)
            .with_mode(
                FailureMode::new(PRODUCER_TIMEOUT, "Producer timeout", FailureClass::Transient)
                    .triggered_when("producer call exceeded its timeout")
                    .impacts("bounded-latency")
                    .recover_with(retry.clone()),
            )
            .with_mode(
                FailureMode::new(PRODUCER_FATAL, "Producer failure", FailureClass::Fatal)
                    .triggered_when("producer reported a non-retryable error")
                    .impacts("artifact-produced")
                    .with_alert(AlertLevel::Critical),
            )
            .with_mode(
                FailureMode::new(CONTRACT_VIOLATION, "Contract violation", FailureClass::Permanent)
                    .triggered_when("produced entity violates its domain contract")
                    .impacts("contract-conformance")
                    .recover_with(RecoveryStrategy::Escalate {
                        to: "feature owner".into(),
                    }),
            )
            .with_mode(
                FailureMode::new(
                    EXPLANATION_INCOMPLETE,
                    "Explanation incomplete",
                    FailureClass::Permanent,
                )
                .triggered_when("explanation gate refused emission")
                .impacts("explained-emission")
                .recover_with(RecoveryStrategy::Escalate {
                    to: "producer operator".into(),
                }),
            )
            .with_mode(
                FailureMode::new(
                    INVARIANT_VIOLATION,
                    "Invariant violation",
                    FailureClass::Recoverable,
                )
                .triggered_when("produced state violates a hard invariant")
                .impacts("hard-invariants")
                .recover_with(retry.clone()),
            )
            .with_mode(
                FailureMode::new(PURITY_VIOLATION, "Purity violation", FailureClass::Recoverable)
                    .triggered_when("business logic module performs side effects")
                    .impacts("layer-separation")
                    .recover_with(retry),
            )
            .with_mode(
                FailureMode::new(DEPENDENCY_FAILED, "Dependency failed", FailureClass::Cascading)
                    .triggered_by(PRODUCER_FATAL)
                    .triggered_when("a dependency task failed terminally")
                    .impacts("dependency-order")
                    .recover_with(RecoveryStrategy::Escalate {
                        to: "workflow owner".into(),
                    })
                    .with_alert(AlertLevel::Critical),
            )
    }
}

/// What is missing from a mode declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "gap")]
pub enum GapKind {
    /// Non-fatal mode with no recovery strategy
    MissingRecovery,
    /// Mode with no trigger
    MissingTrigger,
    /// Mode with no invariant impact
    MissingInvariantImpact,
    /// Trigger names a mode the feature does not declare
    UnknownTriggerMode {
        /// The undeclared mode
        mode: String,
    },
}

/// One completeness gap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletenessGap {
    /// Mode with the gap
    pub mode_id: String,
    /// Gap
    #[serde(flatten)]
    pub kind: GapKind,
}

/// Per-feature failure specifications
#[derive(Debug, Default)]
pub struct FailureModeRegistry {
    specs: DashMap<String, Arc<FeatureFailureSpec>>,
}

impl FailureModeRegistry {
    /// Create an empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a feature's specification, replacing any previous one
    pub fn register(&self, spec: FeatureFailureSpec) {
        tracing::info!(
            feature = %spec.feature_id,
            modes = spec.modes.len(),
            "failure specification registered"
        );
        self.specs.insert(spec.feature_id.clone(), Arc::new(spec));
    }

    /// Look up a feature's specification
    #[inline]
    #[must_use]
    pub fn get(&self, feature_id: &str) -> Option<Arc<FeatureFailureSpec>> {
        self.specs.get(feature_id).map(|s| Arc::clone(s.value()))
    }

    /// Whether a feature has a specification
    #[inline]
    #[must_use]
    pub fn contains(&self, feature_id: &str) -> bool {
        self.specs.contains_key(feature_id)
    }

    /// Ids of the modes the feature declares
    #[must_use]
    pub fn declared_modes(&self, feature_id: &str) -> Vec<String> {
        self.get(feature_id)
            .map(|spec| spec.modes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Classification of a mode, if declared
    #[must_use]
    pub fn classify(&self, feature_id: &str, mode_id: &str) -> Option<FailureClass> {
        self.get(feature_id)
            .and_then(|spec| spec.mode(mode_id).map(|m| m.classification))
    }

    /// Every completeness gap in the feature's declaration
    ///
    /// # Errors
    /// `GovernanceError::UnknownFeature` if nothing is registered.
    pub fn validate_completeness(
        &self,
        feature_id: &str,
    ) -> Result<Vec<CompletenessGap>, GovernanceError> {
        let spec = self
            .get(feature_id)
            .ok_or_else(|| GovernanceError::UnknownFeature(feature_id.to_string()))?;

        let mut gaps = Vec::new();
        for mode in spec.modes.values() {
            let mut gap = |kind| {
                gaps.push(CompletenessGap {
                    mode_id: mode.id.clone(),
                    kind,
                });
            };
            if mode.classification != FailureClass::Fatal && mode.recovery.is_empty() {
                gap(GapKind::MissingRecovery);
            }
            if mode.triggers.is_empty() {
                gap(GapKind::MissingTrigger);
            }
            if mode.invariant_impacts.is_empty() {
                gap(GapKind::MissingInvariantImpact);
            }
            for trigger in &mode.triggers {
                if let Trigger::FailureMode(other) = trigger {
                    if !spec.modes.contains_key(other) {
                        gap(GapKind::UnknownTriggerMode {
                            mode: other.clone(),
                        });
                    }
                }
            }
        }
        Ok(gaps)
    }

    /// Modes that cascade from `mode_id`, breadth first
    ///
    /// A mode cascades from another when one of its triggers names it. The
    /// closure is transitive and never includes `mode_id` itself.
    ///
    /// # Errors
    /// `GovernanceError::UnknownFeature` if nothing is registered.
    pub fn cascade_from(&self, feature_id: &str, mode_id: &str) -> Result<Vec<String>, GovernanceError> {
        let spec = self
            .get(feature_id)
            .ok_or_else(|| GovernanceError::UnknownFeature(feature_id.to_string()))?;

        let mut seen = HashSet::from([mode_id.to_string()]);
        let mut queue = VecDeque::from([mode_id.to_string()]);
        let mut cascade = Vec::new();

        while let Some(current) = queue.pop_front() {
            for mode in spec.modes.values() {
                if mode.is_triggered_by(&current) && seen.insert(mode.id.clone()) {
                    cascade.push(mode.id.clone());
                    queue.push_back(mode.id.clone());
                }
            }
        }
        Ok(cascade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn baseline_is_complete() {
        let registry = FailureModeRegistry::new();
        registry.register(FeatureFailureSpec::baseline("checkout"));
        assert!(registry.validate_completeness("checkout").unwrap().is_empty());
        assert_eq!(
            registry.classify("checkout", PRODUCER_TIMEOUT),
            Some(FailureClass::Transient)
        );
    }

    #[test]
    fn completeness_reports_every_gap() {
        let registry = FailureModeRegistry::new();
        registry.register(
            FeatureFailureSpec::new("search")
                .with_mode(FailureMode::new("index-stale", "Stale index", FailureClass::Recoverable))
                .with_mode(
                    FailureMode::new("shard-lost", "Shard lost", FailureClass::Fatal)
                        .triggered_by("disk-gone")
                        .impacts("durability"),
                ),
        );

        let gaps = registry.validate_completeness("search").unwrap();
        let kinds: Vec<(&str, &GapKind)> = gaps.iter().map(|g| (g.mode_id.as_str(), &g.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("index-stale", &GapKind::MissingRecovery),
                ("index-stale", &GapKind::MissingTrigger),
                ("index-stale", &GapKind::MissingInvariantImpact),
                (
                    "shard-lost",
                    &GapKind::UnknownTriggerMode {
                        mode: "disk-gone".into()
                    }
                ),
            ]
        );
    }

    #[test]
    fn fatal_modes_need_no_recovery() {
        let registry = FailureModeRegistry::new();
        registry.register(FeatureFailureSpec::new("f").with_mode(
            FailureMode::new("boom", "Boom", FailureClass::Fatal)
                .triggered_when("always")
                .impacts("everything"),
        ));
        assert!(registry.validate_completeness("f").unwrap().is_empty());
    }

    #[test]
    fn cascade_is_transitive_and_breadth_first() {
        let mode = |id: &str, by: &[&str]| {
            by.iter().fold(
                FailureMode::new(id, id, FailureClass::Cascading).impacts("x"),
                |m, b| m.triggered_by(*b),
            )
        };
        let registry = FailureModeRegistry::new();
        registry.register(
            FeatureFailureSpec::new("f")
                .with_mode(mode("root", &[]))
                .with_mode(mode("grandchild", &["child-a"]))
                .with_mode(mode("child-a", &["root"]))
                .with_mode(mode("child-b", &["root"]))
                .with_mode(mode("loop", &["grandchild", "loop"])),
        );

        assert_eq!(
            registry.cascade_from("f", "root").unwrap(),
            vec!["child-a", "child-b", "grandchild", "loop"]
        );
        assert!(registry.cascade_from("f", "child-b").unwrap().is_empty());
    }

    #[test]
    fn baseline_dependency_failure_cascades_from_fatal_producer() {
        let registry = FailureModeRegistry::new();
        registry.register(FeatureFailureSpec::baseline("f"));
        assert_eq!(
            registry.cascade_from("f", PRODUCER_FATAL).unwrap(),
            vec![DEPENDENCY_FAILED]
        );
    }

    #[test]
    fn unknown_feature_is_an_error() {
        let registry = FailureModeRegistry::new();
        assert!(matches!(
            registry.validate_completeness("ghost"),
            Err(GovernanceError::UnknownFeature(_))
        ));
        assert!(registry.declared_modes("ghost").is_empty());
    }
}
