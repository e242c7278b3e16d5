//! Forge Governance - the non-bypassable validation gate
//!
//! Every produced artifact passes through, in order:
//! 1. failure-mode completeness (recorded, never blocks)
//! 2. the explanation gate, which alone issues an [`EmissionPermit`]
//! 3. contract validation of the produced entities
//! 4. invariant enforcement over the produced state
//! 5. purity classification of the produced source
//!
//! [`ValidationPipeline`] composes the stages into a [`Verdict`].

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod error;
pub mod explanation;
pub mod failure;
pub mod invariant;
pub mod pipeline;
pub mod purity;

pub use error::GovernanceError;
pub use explanation::{
    AgentExplanation, EdgeCase, EmissionPermit, ExplanationCategory, ExplanationGate,
    FailureModeHandling, GateDecision, GateRefusal, Risk, RiskSeverity, Tradeoff,
};
pub use failure::{
    AlertLevel, CompletenessGap, FailureMode, FailureModeRegistry, FeatureFailureSpec, GapKind,
    RecoveryStrategy, Trigger, CONTRACT_VIOLATION, DEPENDENCY_FAILED, EXPLANATION_INCOMPLETE,
    INVARIANT_VIOLATION, PRODUCER_FATAL, PRODUCER_TIMEOUT, PURITY_VIOLATION,
};
pub use invariant::{
    EnforcementMode, Invariant, InvariantEnforcer, InvariantLevel, InvariantReport,
    InvariantViolation, ViolationAction,
};
pub use pipeline::{Candidate, Disposition, EntityRecord, Rejection, Stage, ValidationPipeline, Verdict};
pub use purity::{
    ArchitectureViolation, Layer, LayerResolver, ModulePurity, PatternClassifier, PurityClassifier,
    PurityGate, PurityReport, SideEffect, SideEffectKind, SourceFile,
};

/// Prelude for common imports
pub mod prelude {
    pub use crate::explanation::{AgentExplanation, EmissionPermit, ExplanationGate, GateRefusal};
    pub use crate::failure::{FailureMode, FailureModeRegistry, FeatureFailureSpec};
    pub use crate::invariant::{Invariant, InvariantEnforcer};
    pub use crate::pipeline::{Candidate, Disposition, EntityRecord, ValidationPipeline, Verdict};
    pub use crate::purity::{PurityGate, SourceFile};
    pub use crate::GovernanceError;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
