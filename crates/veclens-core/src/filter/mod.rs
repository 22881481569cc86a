//! Canonical AND-only filter grammar.
//!
//! A [`CanonicalFilter`] is a conjunction of [`Clause`]s. Backend compilers
//! implement [`FilterCompiler`], splitting a filter into a native fragment and
//! a residual filter that the adapter evaluates in memory with
//! [`CanonicalFilter::matches`].

mod compile;
mod eval;
mod operator;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::compile::{CompiledFilter, FilterCompiler};
pub use self::operator::Operator;
use crate::error::{Error, Result};

/// The literal field name addressing an item's document text.
pub const DOCUMENT_FIELD: &str = "document";

/// What a clause field refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTarget<'a> {
    /// The item's document text.
    Document,
    /// A metadata key.
    Metadata(&'a str),
}

/// One `(field, operator, value)` condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    /// Metadata key, or [`DOCUMENT_FIELD`].
    pub field: String,
    /// Comparison operator.
    pub operator: Operator,
    /// Scalar value, or a list for `in` / `not_in`.
    pub value: Value,
}

impl Clause {
    /// Creates a clause.
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Returns what the field refers to.
    pub fn target(&self) -> FieldTarget<'_> {
        if self.field == DOCUMENT_FIELD {
            FieldTarget::Document
        } else {
            FieldTarget::Metadata(&self.field)
        }
    }

    /// Returns true if the clause addresses the document text.
    pub fn is_document(&self) -> bool {
        self.field == DOCUMENT_FIELD
    }

    /// Returns the list elements of an `in` / `not_in` clause.
    pub fn list(&self) -> &[Value] {
        match &self.value {
            Value::Array(values) => values.as_slice(),
            _ => &[],
        }
    }

    /// Checks the clause is well formed.
    pub fn validate(&self) -> Result<()> {
        if self.field.is_empty() {
            return Err(Error::invalid_input("filter field must not be empty"));
        }

        let scalar = |v: &Value| matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_));

        let ok = match self.operator {
            Operator::In | Operator::NotIn => match &self.value {
                Value::Array(values) => values.iter().all(scalar),
                _ => false,
            },
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                matches!(self.value, Value::String(_) | Value::Number(_))
            }
            Operator::Eq | Operator::Ne | Operator::Contains | Operator::NotContains => {
                scalar(&self.value)
            }
        };

        if ok {
            Ok(())
        } else {
            Err(Error::invalid_input(format!(
                "invalid value {} for operator '{}' on field '{}'",
                self.value, self.operator, self.field
            )))
        }
    }
}

/// Conjunction of clauses. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalFilter {
    clauses: Vec<Clause>,
}

impl CanonicalFilter {
    /// Creates an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a clause.
    pub fn and(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    /// Adds a `field = value` clause.
    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(Clause::new(field, Operator::Eq, value))
    }

    /// Adds a clause with an explicit operator.
    pub fn with(self, field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        self.and(Clause::new(field, operator, value))
    }

    /// Returns the clauses.
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Returns true if the filter has no clauses.
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Validates every clause.
    pub fn validate(&self) -> Result<()> {
        self.clauses.iter().try_for_each(Clause::validate)
    }
}

impl FromIterator<Clause> for CanonicalFilter {
    fn from_iter<T: IntoIterator<Item = Clause>>(iter: T) -> Self {
        Self {
            clauses: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_validate_rejects_scalar_for_in() {
        let clause = Clause::new("status", Operator::In, "active");
        assert!(clause.validate().is_err());

        let clause = Clause::new("status", Operator::In, json!(["active", "paused"]));
        assert!(clause.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bool_range() {
        let clause = Clause::new("flag", Operator::Gt, true);
        assert!(clause.validate().is_err());
    }

    #[test]
    fn test_document_target() {
        let clause = Clause::new(DOCUMENT_FIELD, Operator::Contains, "rust");
        assert_eq!(clause.target(), FieldTarget::Document);
        assert!(Clause::new("tag", Operator::Eq, "a").target() == FieldTarget::Metadata("tag"));
    }

    #[test]
    fn test_filter_serializes_as_clause_list() {
        let filter = CanonicalFilter::new()
            .where_eq("status", "active")
            .with("score", Operator::Gt, 5);
        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(
            value,
            json!([
                {"field": "status", "operator": "eq", "value": "active"},
                {"field": "score", "operator": "gt", "value": 5}
            ])
        );
    }
}
