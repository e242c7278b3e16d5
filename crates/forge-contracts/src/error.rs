//! Error types for the contract registry

/// Contract registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    /// No contract registered under id
    #[error("unknown contract: {0}")]
    UnknownContract(String),

    /// Contract does not declare the entity
    #[error("contract {contract} has no entity {entity}")]
    UnknownEntity {
        /// Contract id
        contract: String,
        /// Entity name
        entity: String,
    },

    /// Re-registration without a version bump
    #[error("contract {id} version {offered} does not supersede registered version {registered}")]
    VersionConflict {
        /// Contract id
        id: String,
        /// Version already registered
        registered: u32,
        /// Version offered
        offered: u32,
    },

    /// Contract definition is inconsistent
    #[error("invalid contract definition: {0}")]
    InvalidDefinition(String),

    /// Entity has no state machine
    #[error("entity {0} declares no state machine")]
    NoStateMachine(String),

    /// Regex constraint failed to compile
    #[error("invalid pattern {pattern}: {message}")]
    InvalidPattern {
        /// Pattern source
        pattern: String,
        /// Compiler message
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_conflict_display() {
        let err = ContractError::VersionConflict {
            id: "orders".into(),
            registered: 2,
            offered: 1,
        };
        assert!(err.to_string().contains("does not supersede"));
    }
}
