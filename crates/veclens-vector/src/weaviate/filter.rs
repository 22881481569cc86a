//! Canonical filter to Weaviate where-filter compilation.
//!
//! Clauses become `by_property(name).<op>(value)` builders combined with `&`.
//! `in` maps to `ContainsAny`. Weaviate has no negated membership and no
//! substring match on text, so `not_in`, `contains` and `not_contains` stay
//! residual.

use std::ops::BitAnd;

use serde_json::{Map, Value, json};
use veclens_core::filter::FieldTarget;
use veclens_core::{Capabilities, Clause, Error, FilterCompiler, Operator, Result};

/// Property holding the document text.
pub const DOCUMENT_PROPERTY: &str = "document";

/// Operand of a property filter.
#[derive(Debug, Clone, PartialEq)]
pub enum WeaviateValue {
    /// `valueText`
    Text(String),
    /// `valueNumber`
    Number(f64),
    /// `valueBoolean`
    Boolean(bool),
    /// `valueTextArray`
    TextArray(Vec<String>),
    /// `valueNumberArray`
    NumberArray(Vec<f64>),
    /// `valueBooleanArray`
    BooleanArray(Vec<bool>),
}

impl WeaviateValue {
    /// Converts a JSON scalar or a homogeneous JSON list.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::Bool(b) => Some(Self::Boolean(*b)),
            Value::Array(values) => match values.first() {
                Some(Value::Number(_)) => values
                    .iter()
                    .map(Value::as_f64)
                    .collect::<Option<Vec<_>>>()
                    .map(Self::NumberArray),
                Some(Value::Bool(_)) => values
                    .iter()
                    .map(Value::as_bool)
                    .collect::<Option<Vec<_>>>()
                    .map(Self::BooleanArray),
                _ => values
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .map(Self::TextArray),
            },
            Value::Null | Value::Object(_) => None,
        }
    }

    /// Returns the key the operand is sent under.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Text(_) => "valueText",
            Self::Number(_) => "valueNumber",
            Self::Boolean(_) => "valueBoolean",
            Self::TextArray(_) => "valueTextArray",
            Self::NumberArray(_) => "valueNumberArray",
            Self::BooleanArray(_) => "valueBooleanArray",
        }
    }

    /// Returns the operand as JSON.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(s) => json!(s),
            Self::Number(n) => json!(n),
            Self::Boolean(b) => json!(b),
            Self::TextArray(v) => json!(v),
            Self::NumberArray(v) => json!(v),
            Self::BooleanArray(v) => json!(v),
        }
    }
}

impl From<&str> for WeaviateValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<f64> for WeaviateValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for WeaviateValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// Operator of a property filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeaviateOperator {
    /// Property equals the operand; on an array property, any element does.
    Equal,
    /// No value of the property equals the operand. Holds when the property
    /// is absent.
    NotEqual,
    /// Strictly greater than the operand.
    GreaterThan,
    /// Greater than or equal to the operand.
    GreaterThanEqual,
    /// Strictly less than the operand.
    LessThan,
    /// Less than or equal to the operand.
    LessThanEqual,
    /// Some value of the property is one of the operand's elements.
    ContainsAny,
}

impl WeaviateOperator {
    /// Returns the operator name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Equal => "Equal",
            Self::NotEqual => "NotEqual",
            Self::GreaterThan => "GreaterThan",
            Self::GreaterThanEqual => "GreaterThanEqual",
            Self::LessThan => "LessThan",
            Self::LessThanEqual => "LessThanEqual",
            Self::ContainsAny => "ContainsAny",
        }
    }
}

/// A where-filter.
#[derive(Debug, Clone, PartialEq)]
pub enum WeaviateWhere {
    /// A comparison on one property.
    Property {
        /// Property name.
        path: String,
        /// Comparison.
        operator: WeaviateOperator,
        /// Operand.
        value: WeaviateValue,
    },
    /// Conjunction of filters.
    And(Vec<WeaviateWhere>),
}

/// Starts a filter on one property.
pub fn by_property(name: impl Into<String>) -> PropertyFilter {
    PropertyFilter { path: name.into() }
}

/// Builder returned by [`by_property`].
#[derive(Debug, Clone)]
pub struct PropertyFilter {
    path: String,
}

impl PropertyFilter {
    fn build(self, operator: WeaviateOperator, value: WeaviateValue) -> WeaviateWhere {
        WeaviateWhere::Property {
            path: self.path,
            operator,
            value,
        }
    }

    /// `Equal` comparison.
    pub fn equal(self, value: impl Into<WeaviateValue>) -> WeaviateWhere {
        self.build(WeaviateOperator::Equal, value.into())
    }

    /// `NotEqual` comparison.
    pub fn not_equal(self, value: impl Into<WeaviateValue>) -> WeaviateWhere {
        self.build(WeaviateOperator::NotEqual, value.into())
    }

    /// `GreaterThan` comparison.
    pub fn greater_than(self, value: impl Into<WeaviateValue>) -> WeaviateWhere {
        self.build(WeaviateOperator::GreaterThan, value.into())
    }

    /// `GreaterThanEqual` comparison.
    pub fn greater_or_equal(self, value: impl Into<WeaviateValue>) -> WeaviateWhere {
        self.build(WeaviateOperator::GreaterThanEqual, value.into())
    }

    /// `LessThan` comparison.
    pub fn less_than(self, value: impl Into<WeaviateValue>) -> WeaviateWhere {
        self.build(WeaviateOperator::LessThan, value.into())
    }

    /// `LessThanEqual` comparison.
    pub fn less_or_equal(self, value: impl Into<WeaviateValue>) -> WeaviateWhere {
        self.build(WeaviateOperator::LessThanEqual, value.into())
    }

    /// `ContainsAny` against a list operand.
    pub fn contains_any(self, value: impl Into<WeaviateValue>) -> WeaviateWhere {
        self.build(WeaviateOperator::ContainsAny, value.into())
    }
}

impl BitAnd for WeaviateWhere {
    type Output = WeaviateWhere;

    fn bitand(self, rhs: WeaviateWhere) -> WeaviateWhere {
        let mut operands = match self {
            WeaviateWhere::And(operands) => operands,
            other => vec![other],
        };
        match rhs {
            WeaviateWhere::And(rest) => operands.extend(rest),
            other => operands.push(other),
        }
        WeaviateWhere::And(operands)
    }
}

impl WeaviateWhere {
    /// Returns the filter in the REST JSON form.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Property {
                path,
                operator,
                value,
            } => {
                let mut map = Map::new();
                map.insert("path".to_string(), json!([path]));
                map.insert("operator".to_string(), json!(operator.name()));
                map.insert(value.key().to_string(), value.to_json());
                Value::Object(map)
            }
            Self::And(operands) => json!({
                "operator": "And",
                "operands": operands.iter().map(Self::to_json).collect::<Vec<_>>(),
            }),
        }
    }

    /// Returns the filter as a GraphQL input object.
    pub fn to_graphql(&self) -> String {
        match self {
            Self::Property {
                path,
                operator,
                value,
            } => format!(
                "{{path: {}, operator: {}, {}: {}}}",
                json!([path]),
                operator.name(),
                value.key(),
                value.to_json()
            ),
            Self::And(operands) => {
                let operands: Vec<String> = operands.iter().map(Self::to_graphql).collect();
                format!("{{operator: And, operands: [{}]}}", operands.join(", "))
            }
        }
    }
}

/// Compiles canonical filters into [`WeaviateWhere`] filters.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeaviateFilterCompiler;

impl FilterCompiler for WeaviateFilterCompiler {
    type Condition = WeaviateWhere;
    type Fragment = WeaviateWhere;

    fn capabilities(&self) -> Capabilities {
        Capabilities::all_server_side()
            .with(Operator::NotIn, false)
            .with(Operator::Contains, false)
            .with(Operator::NotContains, false)
            .with_document(Operator::NotIn, false)
            .with_document(Operator::Contains, false)
            .with_document(Operator::NotContains, false)
    }

    fn lower(&self, clause: &Clause) -> Result<WeaviateWhere> {
        let path = match clause.target() {
            FieldTarget::Document => DOCUMENT_PROPERTY,
            FieldTarget::Metadata(key) => key,
        };
        let value = WeaviateValue::from_json(&clause.value).ok_or_else(|| {
            Error::unsupported_operator(format!(
                "{} has no Weaviate operand form",
                clause.value
            ))
        })?;

        let property = by_property(path);
        let condition = match clause.operator {
            Operator::Eq => property.equal(value),
            Operator::Ne => property.not_equal(value),
            Operator::Gt => property.greater_than(value),
            Operator::Gte => property.greater_or_equal(value),
            Operator::Lt => property.less_than(value),
            Operator::Lte => property.less_or_equal(value),
            Operator::In => property.contains_any(value),
            Operator::NotIn | Operator::Contains | Operator::NotContains => {
                return Err(Error::unsupported_operator(format!(
                    "Weaviate has no filter for '{}'",
                    clause.operator
                )));
            }
        };
        Ok(condition)
    }

    fn combine(&self, conditions: Vec<WeaviateWhere>) -> WeaviateWhere {
        let mut conditions = conditions.into_iter();
        match conditions.next() {
            Some(first) => conditions.fold(first, |all, next| all & next),
            None => WeaviateWhere::And(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use veclens_core::CanonicalFilter;

    use super::*;

    #[test]
    fn test_status_and_score() {
        let filter = CanonicalFilter::new()
            .where_eq("status", "active")
            .with("score", Operator::Gt, 5);
        let native = WeaviateFilterCompiler.compile(&filter).unwrap().native.unwrap();

        assert_eq!(
            native,
            by_property("status").equal("active") & by_property("score").greater_than(5.0)
        );
        assert_eq!(
            native.to_graphql(),
            r#"{operator: And, operands: [{path: ["status"], operator: Equal, valueText: "active"}, {path: ["score"], operator: GreaterThan, valueNumber: 5.0}]}"#
        );
    }

    #[test]
    fn test_single_clause_is_not_wrapped() {
        let filter = CanonicalFilter::new().where_eq("flag", true);
        let native = WeaviateFilterCompiler.compile(&filter).unwrap().native.unwrap();
        assert_eq!(
            native.to_json(),
            json!({"path": ["flag"], "operator": "Equal", "valueBoolean": true})
        );
    }

    #[test]
    fn test_in_maps_to_contains_any() {
        let filter = CanonicalFilter::new().with("tag", Operator::In, json!(["a", "b"]));
        let native = WeaviateFilterCompiler.compile(&filter).unwrap().native.unwrap();
        assert_eq!(
            native,
            by_property("tag").contains_any(WeaviateValue::TextArray(vec![
                "a".into(),
                "b".into()
            ]))
        );
    }

    #[test]
    fn test_negated_membership_and_substrings_are_residual() {
        let filter = CanonicalFilter::new()
            .with("tag", Operator::NotIn, json!(["a"]))
            .with("document", Operator::Contains, "rust")
            .with("status", Operator::Ne, "paused");
        let compiled = WeaviateFilterCompiler.compile(&filter).unwrap();

        assert_eq!(compiled.native, Some(by_property("status").not_equal("paused")));
        assert_eq!(compiled.residual.clauses().len(), 2);
    }

    #[test]
    fn test_mixed_list_is_unsupported() {
        let filter = CanonicalFilter::new().with("tag", Operator::In, json!(["a", 1]));
        let err = WeaviateFilterCompiler.compile(&filter).unwrap_err();
        assert_eq!(err.kind(), veclens_core::ErrorKind::UnsupportedOperator);
    }
}
