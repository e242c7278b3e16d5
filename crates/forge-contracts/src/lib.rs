//! Forge Contracts - domain contract registry
//!
//! Formal entity schemas, state machines and cross-field constraints against
//! which generated artifacts are checked.
//!
//! # Example
//!
//! ```rust
//! use forge_contracts::{ContractRegistry, DomainContract, EntityContract, FieldConstraint, FieldDefinition};
//! use serde_json::json;
//!
//! let registry = ContractRegistry::new();
//! registry
//!     .register(DomainContract::new("billing").entity(
//!         EntityContract::new("invoice").field(
//!             "amount",
//!             FieldDefinition::number().required().constraint(FieldConstraint::positive()),
//!         ),
//!     ))
//!     .unwrap();
//!
//! let result = registry.validate_entity("billing", "invoice", &json!({ "amount": -1 })).unwrap();
//! assert!(!result.valid);
//! assert_eq!(result.errors[0].path, "fields.amount");
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod contract;
pub mod error;
pub mod registry;

pub use contract::{
    Cardinality, CrossFieldConstraint, DomainContract, EntityContract, FieldConstraint,
    FieldDefinition, FieldType, Guard, Relationship, Severity, StateMachine, Transition,
};
pub use error::ContractError;
pub use registry::{ContractRegistry, ContractViolation, ValidationResult};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
