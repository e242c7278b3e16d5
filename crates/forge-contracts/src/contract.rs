//! Contract definitions
//!
//! An `EntityContract` is a typed schema for one domain entity kind: field
//! definitions with pure boolean constraints, an optional state machine, and
//! cross-field constraints. Contracts are grouped per domain into a
//! versioned `DomainContract`.

use crate::error::ContractError;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Predicate over a single value
pub type ValuePredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Predicate over a whole entity record
pub type RecordPredicate = Arc<dyn Fn(&Map<String, Value>) -> bool + Send + Sync>;

/// Violation severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Blocks acceptance
    Error,
    /// Recorded, does not block
    Warning,
}

/// Field value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// JSON string
    String,
    /// Any JSON number
    Number,
    /// Integral JSON number
    Integer,
    /// JSON boolean
    Boolean,
    /// JSON array
    Array,
    /// JSON object
    Object,
    /// Any value
    Any,
}

impl FieldType {
    /// Whether `value` conforms to this type
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Any => true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Any => "any",
        };
        f.write_str(s)
    }
}

/// Named pure constraint on one field
#[derive(Clone)]
pub struct FieldConstraint {
    /// Constraint name, reported on violation
    pub name: String,
    /// Violation message
    pub message: String,
    /// Violation severity
    pub severity: Severity,
    predicate: ValuePredicate,
}

impl FieldConstraint {
    /// Create an error-severity constraint
    pub fn new<F>(name: impl Into<String>, message: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            message: message.into(),
            severity: Severity::Error,
            predicate: Arc::new(predicate),
        }
    }

    /// Downgrade to warning severity
    #[inline]
    #[must_use]
    pub fn warning(mut self) -> Self {
        self.severity = Severity::Warning;
        self
    }

    /// Evaluate against a value
    #[inline]
    #[must_use]
    pub fn holds(&self, value: &Value) -> bool {
        (self.predicate)(value)
    }

    /// Number strictly greater than zero
    #[must_use]
    pub fn positive() -> Self {
        Self::new("positive", "must be greater than 0", |v| {
            v.as_f64().is_some_and(|n| n > 0.0)
        })
    }

    /// Number at least `min`
    #[must_use]
    pub fn min(min: f64) -> Self {
        Self::new("min", format!("must be at least {min}"), move |v| {
            v.as_f64().is_some_and(|n| n >= min)
        })
    }

    /// Number at most `max`
    #[must_use]
    pub fn max(max: f64) -> Self {
        Self::new("max", format!("must be at most {max}"), move |v| {
            v.as_f64().is_some_and(|n| n <= max)
        })
    }

    /// String or array length at least `len`
    #[must_use]
    pub fn min_length(len: usize) -> Self {
        Self::new(
            "min_length",
            format!("length must be at least {len}"),
            move |v| value_len(v).is_some_and(|l| l >= len),
        )
    }

    /// String or array length at most `len`
    #[must_use]
    pub fn max_length(len: usize) -> Self {
        Self::new(
            "max_length",
            format!("length must be at most {len}"),
            move |v| value_len(v).is_some_and(|l| l <= len),
        )
    }

    /// String matching a regular expression
    ///
    /// # Errors
    /// `ContractError::InvalidPattern` if the pattern does not compile.
    pub fn matches(pattern: &str) -> Result<Self, ContractError> {
        let re = Regex::new(pattern).map_err(|e| ContractError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::new(
            "pattern",
            format!("must match {pattern}"),
            move |v| v.as_str().is_some_and(|s| re.is_match(s)),
        ))
    }
}

impl fmt::Debug for FieldConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldConstraint")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .finish_non_exhaustive()
    }
}

fn value_len(v: &Value) -> Option<usize> {
    match v {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        _ => None,
    }
}

/// Definition of one field
#[derive(Debug, Clone)]
pub struct FieldDefinition {
    /// Expected type
    pub field_type: FieldType,
    /// Whether the field must be present and non-null
    pub required: bool,
    /// Allowed values (enum membership)
    pub allowed_values: Option<Vec<Value>>,
    /// Constraints evaluated when the type matches
    pub constraints: Vec<FieldConstraint>,
}

impl FieldDefinition {
    /// Optional field of the given type
    #[inline]
    #[must_use]
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            allowed_values: None,
            constraints: Vec::new(),
        }
    }

    /// Optional string field
    #[inline]
    #[must_use]
    pub fn string() -> Self {
        Self::new(FieldType::String)
    }

    /// Optional number field
    #[inline]
    #[must_use]
    pub fn number() -> Self {
        Self::new(FieldType::Number)
    }

    /// Optional integer field
    #[inline]
    #[must_use]
    pub fn integer() -> Self {
        Self::new(FieldType::Integer)
    }

    /// Optional boolean field
    #[inline]
    #[must_use]
    pub fn boolean() -> Self {
        Self::new(FieldType::Boolean)
    }

    /// Mark required
    #[inline]
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Restrict to a set of string values
    #[must_use]
    pub fn one_of<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_values = Some(values.into_iter().map(|s| Value::String(s.into())).collect());
        self
    }

    /// Add a constraint
    #[inline]
    #[must_use]
    pub fn constraint(mut self, constraint: FieldConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }
}

/// Constraint spanning several fields of one record
#[derive(Clone)]
pub struct CrossFieldConstraint {
    /// Constraint name
    pub name: String,
    /// Violation message
    pub message: String,
    /// Violation severity
    pub severity: Severity,
    /// Fields the predicate reads
    pub fields: Vec<String>,
    predicate: RecordPredicate,
}

impl CrossFieldConstraint {
    /// Create an error-severity cross-field constraint
    pub fn new<F>(
        name: impl Into<String>,
        message: impl Into<String>,
        fields: &[&str],
        predicate: F,
    ) -> Self
    where
        F: Fn(&Map<String, Value>) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            message: message.into(),
            severity: Severity::Error,
            fields: fields.iter().map(|s| (*s).to_string()).collect(),
            predicate: Arc::new(predicate),
        }
    }

    /// Downgrade to warning severity
    #[inline]
    #[must_use]
    pub fn warning(mut self) -> Self {
        self.severity = Severity::Warning;
        self
    }

    /// Evaluate against a record
    #[inline]
    #[must_use]
    pub fn holds(&self, record: &Map<String, Value>) -> bool {
        (self.predicate)(record)
    }
}

impl fmt::Debug for CrossFieldConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossFieldConstraint")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

/// Named guard on a transition
#[derive(Clone)]
pub struct Guard {
    /// Guard name
    pub name: String,
    predicate: ValuePredicate,
}

impl Guard {
    /// Create a guard over the transition context
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Evaluate against a context
    #[inline]
    #[must_use]
    pub fn allows(&self, context: &Value) -> bool {
        (self.predicate)(context)
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Legal state transition
#[derive(Debug, Clone)]
pub struct Transition {
    /// Source state
    pub from: String,
    /// Target state
    pub to: String,
    /// Optional guard on the context
    pub guard: Option<Guard>,
}

/// Entity state machine
#[derive(Debug, Clone)]
pub struct StateMachine {
    /// Declared states
    pub states: Vec<String>,
    /// Initial state
    pub initial: String,
    /// Legal transitions
    pub transitions: Vec<Transition>,
}

impl StateMachine {
    /// Create a state machine
    #[must_use]
    pub fn new<I, S>(states: I, initial: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            states: states.into_iter().map(Into::into).collect(),
            initial: initial.into(),
            transitions: Vec::new(),
        }
    }

    /// Add an unguarded transition
    #[must_use]
    pub fn transition(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.transitions.push(Transition {
            from: from.into(),
            to: to.into(),
            guard: None,
        });
        self
    }

    /// Add a guarded transition
    #[must_use]
    pub fn guarded(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        guard: Guard,
    ) -> Self {
        self.transitions.push(Transition {
            from: from.into(),
            to: to.into(),
            guard: Some(guard),
        });
        self
    }

    /// Whether `state` is declared
    #[inline]
    #[must_use]
    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    /// Check that referenced states are declared
    ///
    /// # Errors
    /// `ContractError::InvalidDefinition` naming the first undeclared state.
    pub fn check(&self) -> Result<(), ContractError> {
        if !self.has_state(&self.initial) {
            return Err(ContractError::InvalidDefinition(format!(
                "initial state {} is not declared",
                self.initial
            )));
        }
        for t in &self.transitions {
            for state in [&t.from, &t.to] {
                if !self.has_state(state) {
                    return Err(ContractError::InvalidDefinition(format!(
                        "transition {} -> {} references undeclared state {state}",
                        t.from, t.to
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Relationship cardinality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// 1:1
    OneToOne,
    /// 1:N
    OneToMany,
    /// N:1
    ManyToOne,
    /// N:M
    ManyToMany,
}

/// Declared relationship to another entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    /// Relationship name
    pub name: String,
    /// Related entity
    pub target: String,
    /// Cardinality
    pub cardinality: Cardinality,
}

/// Schema for one entity kind
#[derive(Debug, Clone)]
pub struct EntityContract {
    /// Entity name
    pub name: String,
    /// Field definitions in declaration order
    pub fields: IndexMap<String, FieldDefinition>,
    /// Optional state machine
    pub state_machine: Option<StateMachine>,
    /// Field holding the current state
    pub state_field: String,
    /// Entity-level constraints
    pub cross_field: Vec<CrossFieldConstraint>,
    /// Relationships to other entities
    pub relationships: Vec<Relationship>,
}

impl EntityContract {
    /// Create an empty entity contract
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: IndexMap::new(),
            state_machine: None,
            state_field: "state".to_string(),
            cross_field: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Add a field
    #[inline]
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, definition: FieldDefinition) -> Self {
        self.fields.insert(name.into(), definition);
        self
    }

    /// Attach a state machine
    #[inline]
    #[must_use]
    pub fn with_state_machine(mut self, machine: StateMachine) -> Self {
        self.state_machine = Some(machine);
        self
    }

    /// Use a different field for the current state
    #[inline]
    #[must_use]
    pub fn with_state_field(mut self, field: impl Into<String>) -> Self {
        self.state_field = field.into();
        self
    }

    /// Add a cross-field constraint
    #[inline]
    #[must_use]
    pub fn cross_field(mut self, constraint: CrossFieldConstraint) -> Self {
        self.cross_field.push(constraint);
        self
    }

    /// Add a relationship
    #[inline]
    #[must_use]
    pub fn relationship(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        self.relationships.push(Relationship {
            name: name.into(),
            target: target.into(),
            cardinality,
        });
        self
    }
}

/// Versioned set of entity contracts for one domain
#[derive(Debug, Clone)]
pub struct DomainContract {
    /// Contract id
    pub id: String,
    /// Version; re-registration requires a higher one
    pub version: u32,
    /// Entities by name
    pub entities: IndexMap<String, EntityContract>,
}

impl DomainContract {
    /// Create an empty contract at version 1
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            entities: IndexMap::new(),
        }
    }

    /// With version
    #[inline]
    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Add an entity
    #[inline]
    #[must_use]
    pub fn entity(mut self, entity: EntityContract) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    /// Check internal consistency
    ///
    /// # Errors
    /// `ContractError::InvalidDefinition` on undeclared states or
    /// relationships to unknown entities.
    pub fn check(&self) -> Result<(), ContractError> {
        if self.entities.is_empty() {
            return Err(ContractError::InvalidDefinition(format!(
                "contract {} declares no entities",
                self.id
            )));
        }
        for entity in self.entities.values() {
            if let Some(machine) = &entity.state_machine {
                machine.check()?;
            }
            for rel in &entity.relationships {
                if !self.entities.contains_key(&rel.target) {
                    return Err(ContractError::InvalidDefinition(format!(
                        "relationship {}.{} targets unknown entity {}",
                        entity.name, rel.name, rel.target
                    )));
                }
            }
        }
        Ok(())
    }
}
