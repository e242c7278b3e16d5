//! Contract registry and entity validation

use crate::contract::{DomainContract, EntityContract, Severity};
use crate::error::ContractError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// One failed check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractViolation {
    /// Location of the violation (`fields.<name>`, `constraints.<name>`, `state`)
    pub path: String,
    /// Violated constraint name
    pub constraint: String,
    /// Human-readable message
    pub message: String,
    /// Severity
    pub severity: Severity,
}

impl ContractViolation {
    fn error(path: impl Into<String>, constraint: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            constraint: constraint.into(),
            message: message.into(),
            severity: Severity::Error,
        }
    }
}

/// Outcome of validating one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Contract id
    pub contract_id: String,
    /// Entity name
    pub entity: String,
    /// True iff no error-severity violation was collected
    pub valid: bool,
    /// Every collected violation, in check order
    pub errors: Vec<ContractViolation>,
}

impl ValidationResult {
    /// Error-severity violations
    pub fn blocking(&self) -> impl Iterator<Item = &ContractViolation> {
        self.errors.iter().filter(|e| e.severity == Severity::Error)
    }

    /// Warning-severity violations
    pub fn warnings(&self) -> impl Iterator<Item = &ContractViolation> {
        self.errors.iter().filter(|e| e.severity == Severity::Warning)
    }
}

/// Registry of domain contracts
///
/// Contracts are immutable once registered; a new registration under the
/// same id must carry a strictly higher version.
#[derive(Debug, Default)]
pub struct ContractRegistry {
    contracts: DashMap<String, Arc<DomainContract>>,
}

impl ContractRegistry {
    /// Create an empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or supersede a contract
    ///
    /// # Errors
    /// - `ContractError::InvalidDefinition` if the contract is inconsistent
    /// - `ContractError::VersionConflict` if the version does not supersede
    pub fn register(&self, contract: DomainContract) -> Result<(), ContractError> {
        contract.check()?;
        let id = contract.id.clone();
        match self.contracts.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let registered = slot.get().version;
                if contract.version <= registered {
                    return Err(ContractError::VersionConflict {
                        id,
                        registered,
                        offered: contract.version,
                    });
                }
                tracing::info!(contract = %id, from = registered, to = contract.version, "contract superseded");
                slot.insert(Arc::new(contract));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::info!(contract = %id, version = contract.version, "contract registered");
                slot.insert(Arc::new(contract));
            }
        }
        Ok(())
    }

    /// Look up a contract
    #[inline]
    #[must_use]
    pub fn get(&self, contract_id: &str) -> Option<Arc<DomainContract>> {
        self.contracts.get(contract_id).map(|c| Arc::clone(c.value()))
    }

    /// Number of registered contracts
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    /// Whether no contract is registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Validate entity data against a contract
    ///
    /// Runs, in order: required-field presence, type conformance, per-field
    /// constraints, enum membership, cross-field constraints, and state
    /// membership. Every failing check is collected.
    ///
    /// # Errors
    /// `UnknownContract` / `UnknownEntity` if the target is not registered.
    pub fn validate_entity(
        &self,
        contract_id: &str,
        entity_name: &str,
        data: &Value,
    ) -> Result<ValidationResult, ContractError> {
        let contract = self
            .get(contract_id)
            .ok_or_else(|| ContractError::UnknownContract(contract_id.to_string()))?;
        let entity = lookup_entity(&contract, entity_name)?;

        let errors = match data.as_object() {
            Some(record) => check_record(entity, record),
            None => vec![ContractViolation::error(
                "",
                "type",
                "entity data must be an object",
            )],
        };
        let valid = !errors.iter().any(|e| e.severity == Severity::Error);

        if !valid {
            tracing::debug!(
                contract = contract_id,
                entity = entity_name,
                violations = errors.len(),
                "entity failed contract validation"
            );
        }

        Ok(ValidationResult {
            contract_id: contract_id.to_string(),
            entity: entity_name.to_string(),
            valid,
            errors,
        })
    }

    /// Whether `from -> to` is a legal transition under `context`
    ///
    /// # Errors
    /// Unknown contract or entity, or an entity without a state machine.
    pub fn is_valid_transition(
        &self,
        contract_id: &str,
        entity_name: &str,
        from: &str,
        to: &str,
        context: &Value,
    ) -> Result<bool, ContractError> {
        let contract = self
            .get(contract_id)
            .ok_or_else(|| ContractError::UnknownContract(contract_id.to_string()))?;
        let entity = lookup_entity(&contract, entity_name)?;
        let machine = entity
            .state_machine
            .as_ref()
            .ok_or_else(|| ContractError::NoStateMachine(entity_name.to_string()))?;

        Ok(machine
            .transitions
            .iter()
            .filter(|t| t.from == from && t.to == to)
            .any(|t| t.guard.as_ref().map_or(true, |g| g.allows(context))))
    }
}

fn lookup_entity<'a>(
    contract: &'a DomainContract,
    entity_name: &str,
) -> Result<&'a EntityContract, ContractError> {
    contract
        .entities
        .get(entity_name)
        .ok_or_else(|| ContractError::UnknownEntity {
            contract: contract.id.clone(),
            entity: entity_name.to_string(),
        })
}

fn present<'a>(record: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    record.get(field).filter(|v| !v.is_null())
}

fn check_record(entity: &EntityContract, record: &Map<String, Value>) -> Vec<ContractViolation> {
    let mut errors = Vec::new();

    // 1. required fields
    for (name, def) in &entity.fields {
        if def.required && present(record, name).is_none() {
            errors.push(ContractViolation::error(
                format!("fields.{name}"),
                "required",
                format!("{name} is required"),
            ));
        }
    }

    // 2. types; constraints below only run on well-typed values
    let mut typed = Vec::new();
    for (name, def) in &entity.fields {
        let Some(value) = present(record, name) else {
            continue;
        };
        if def.field_type.accepts(value) {
            typed.push((name, def, value));
        } else {
            errors.push(ContractViolation::error(
                format!("fields.{name}"),
                "type",
                format!("{name} must be of type {}", def.field_type),
            ));
        }
    }

    // 3. per-field constraints
    for (name, def, value) in &typed {
        for constraint in def.constraints.iter().filter(|c| !c.holds(value)) {
            errors.push(ContractViolation {
                path: format!("fields.{name}"),
                constraint: constraint.name.clone(),
                message: format!("{name} {}", constraint.message),
                severity: constraint.severity,
            });
        }
    }

    // 4. enum membership
    for (name, def, value) in &typed {
        if let Some(allowed) = &def.allowed_values {
            if !allowed.contains(value) {
                errors.push(ContractViolation::error(
                    format!("fields.{name}"),
                    "enum",
                    format!("{name} must be one of {}", render_values(allowed)),
                ));
            }
        }
    }

    // 5. cross-field constraints
    for constraint in entity.cross_field.iter().filter(|c| !c.holds(record)) {
        errors.push(ContractViolation {
            path: format!("constraints.{}", constraint.name),
            constraint: constraint.name.clone(),
            message: constraint.message.clone(),
            severity: constraint.severity,
        });
    }

    // 6. state membership
    if let Some(machine) = &entity.state_machine {
        if let Some(state) = present(record, &entity.state_field) {
            let legal = state.as_str().is_some_and(|s| machine.has_state(s));
            if !legal {
                errors.push(ContractViolation::error(
                    "state",
                    "state_machine",
                    format!(
                        "{state} is not a declared state of {} ({})",
                        entity.name,
                        machine.states.join(", ")
                    ),
                ));
            }
        }
    }

    errors
}

fn render_values(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{
        CrossFieldConstraint, FieldConstraint, FieldDefinition, Guard, StateMachine,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn order_contract() -> DomainContract {
        let machine = StateMachine::new(["draft", "placed", "shipped"], "draft")
            .transition("draft", "placed")
            .guarded(
                "placed",
                "shipped",
                Guard::new("paid", |ctx| ctx["paid"].as_bool() == Some(true)),
            );

        DomainContract::new("shop").entity(
            EntityContract::new("order")
                .field(
                    "x",
                    FieldDefinition::number()
                        .required()
                        .constraint(FieldConstraint::positive()),
                )
                .field(
                    "currency",
                    FieldDefinition::string().one_of(["EUR", "USD"]),
                )
                .field("note", FieldDefinition::string().constraint(FieldConstraint::max_length(5).warning()))
                .field("state", FieldDefinition::string())
                .with_state_machine(machine)
                .cross_field(CrossFieldConstraint::new(
                    "discount_below_total",
                    "discount must not exceed x",
                    &["x", "discount"],
                    |r| {
                        let x = r.get("x").and_then(Value::as_f64).unwrap_or(0.0);
                        let d = r.get("discount").and_then(Value::as_f64).unwrap_or(0.0);
                        d <= x
                    },
                )),
        )
    }

    fn registry() -> ContractRegistry {
        let registry = ContractRegistry::new();
        registry.register(order_contract()).unwrap();
        registry
    }

    #[test]
    fn negative_number_rejected_under_field_path() {
        let result = registry()
            .validate_entity("shop", "order", &json!({ "x": -1 }))
            .unwrap();
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].path, "fields.x");
        assert_eq!(result.errors[0].constraint, "positive");
    }

    #[test]
    fn positive_number_accepted() {
        let result = registry()
            .validate_entity("shop", "order", &json!({ "x": 1 }))
            .unwrap();
        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn every_failing_check_is_collected() {
        let result = registry()
            .validate_entity(
                "shop",
                "order",
                &json!({ "currency": "GBP", "discount": 5, "state": "lost", "note": 3 }),
            )
            .unwrap();

        let got: Vec<(&str, &str)> = result
            .errors
            .iter()
            .map(|e| (e.path.as_str(), e.constraint.as_str()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("fields.x", "required"),
                ("fields.note", "type"),
                ("fields.currency", "enum"),
                ("constraints.discount_below_total", "discount_below_total"),
                ("state", "state_machine"),
            ]
        );
    }

    #[test]
    fn warnings_do_not_block() {
        let result = registry()
            .validate_entity("shop", "order", &json!({ "x": 2, "note": "too long" }))
            .unwrap();
        assert!(result.valid);
        assert_eq!(result.warnings().count(), 1);
        assert_eq!(result.blocking().count(), 0);
    }

    #[test]
    fn non_object_data_is_rejected() {
        let result = registry().validate_entity("shop", "order", &json!(3)).unwrap();
        assert!(!result.valid);
    }

    #[test]
    fn unknown_targets_are_errors() {
        let reg = registry();
        assert!(matches!(
            reg.validate_entity("nope", "order", &json!({})),
            Err(ContractError::UnknownContract(_))
        ));
        assert!(matches!(
            reg.validate_entity("shop", "invoice", &json!({})),
            Err(ContractError::UnknownEntity { .. })
        ));
    }

    #[test]
    fn transitions_respect_guards() {
        let reg = registry();
        assert!(reg
            .is_valid_transition("shop", "order", "draft", "placed", &json!({}))
            .unwrap());
        assert!(!reg
            .is_valid_transition("shop", "order", "draft", "shipped", &json!({}))
            .unwrap());
        assert!(!reg
            .is_valid_transition("shop", "order", "placed", "shipped", &json!({ "paid": false }))
            .unwrap());
        assert!(reg
            .is_valid_transition("shop", "order", "placed", "shipped", &json!({ "paid": true }))
            .unwrap());
    }

    #[test]
    fn reregistration_requires_version_bump() {
        let reg = registry();
        assert!(matches!(
            reg.register(order_contract()),
            Err(ContractError::VersionConflict { registered: 1, offered: 1, .. })
        ));
        assert!(reg.register(order_contract().with_version(2)).is_ok());
        assert_eq!(reg.get("shop").unwrap().version, 2);
    }
}
