//! Error types for the governance layer

use forge_contracts::ContractError;
use forge_model::ExplanationId;

/// Governance errors
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    /// Hard invariant violated under raise or fail-fast enforcement
    #[error("hard invariant {id} violated: {description}")]
    InvariantViolated {
        /// Invariant id
        id: String,
        /// Invariant description
        description: String,
    },

    /// Invariant id registered twice
    #[error("invariant already registered: {0}")]
    DuplicateInvariant(String),

    /// No failure spec registered for feature
    #[error("no failure spec registered for feature: {0}")]
    UnknownFeature(String),

    /// Explanation ids are write-once
    #[error("explanation already recorded: {0}")]
    ExplanationAlreadyRecorded(ExplanationId),

    /// Explanation was never recorded
    #[error("unknown explanation: {0}")]
    UnknownExplanation(ExplanationId),

    /// Side-effect indicator failed to compile
    #[error("invalid side-effect indicator for {kind}: {message}")]
    InvalidIndicator {
        /// Effect kind
        kind: String,
        /// Compiler message
        message: String,
    },

    /// Contract registry failure
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),

    /// Verdict serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_violation_names_the_invariant() {
        let err = GovernanceError::InvariantViolated {
            id: "non-negative-balance".into(),
            description: "balance must not go below zero".into(),
        };
        assert_eq!(
            err.to_string(),
            "hard invariant non-negative-balance violated: balance must not go below zero"
        );
    }
}
