//! Canonical filter to Chroma where-map compilation.
//!
//! Metadata comparisons map onto `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`,
//! `$in` and `$nin`. Chroma's scalar operators never look into array
//! metadata, so equality and membership are paired with the array operators
//! `$contains` / `$not_contains`. Substring tests and every clause on the
//! document text stay residual.

use serde_json::{Map, Value, json};
use veclens_core::{Capabilities, Clause, Error, FilterCompiler, Operator, Result};

/// Compiles canonical filters into Chroma where-maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChromaFilterCompiler;

/// Returns the where-map operator of a server-side operator.
fn where_operator(operator: Operator) -> Option<&'static str> {
    match operator {
        Operator::Eq => Some("$eq"),
        Operator::Ne => Some("$ne"),
        Operator::Gt => Some("$gt"),
        Operator::Gte => Some("$gte"),
        Operator::Lt => Some("$lt"),
        Operator::Lte => Some("$lte"),
        Operator::In => Some("$in"),
        Operator::NotIn => Some("$nin"),
        Operator::Contains | Operator::NotContains => None,
    }
}

impl FilterCompiler for ChromaFilterCompiler {
    type Condition = Value;
    type Fragment = Value;

    fn capabilities(&self) -> Capabilities {
        Capabilities::all_server_side()
            .with(Operator::Contains, false)
            .with(Operator::NotContains, false)
            .with_document_all(false)
    }

    fn lower(&self, clause: &Clause) -> Result<Value> {
        let op = where_operator(clause.operator).ok_or_else(|| {
            Error::unsupported_operator(format!(
                "Chroma has no where operator for '{}'",
                clause.operator
            ))
        })?;

        if clause.operator.is_range() && !clause.value.is_number() {
            return Err(Error::unsupported_operator(format!(
                "Chroma orders numbers only, field '{}' was compared with {}",
                clause.field, clause.value
            )));
        }

        let key = clause.field.as_str();
        let scalar = predicate(key, op, clause.value.clone());
        let condition = match clause.operator {
            Operator::Eq => join(
                "$or",
                vec![scalar, predicate(key, "$contains", clause.value.clone())],
            ),
            Operator::Ne => join(
                "$and",
                vec![scalar, predicate(key, "$not_contains", clause.value.clone())],
            ),
            Operator::In => join("$or", with_elements(scalar, key, "$contains", clause.list())),
            Operator::NotIn => join(
                "$and",
                with_elements(scalar, key, "$not_contains", clause.list()),
            ),
            _ => scalar,
        };
        Ok(condition)
    }

    fn combine(&self, conditions: Vec<Value>) -> Value {
        join("$and", conditions)
    }
}

/// `{key: {op: value}}`.
fn predicate(key: &str, op: &str, value: Value) -> Value {
    let mut predicate = Map::new();
    predicate.insert(op.to_string(), value);
    let mut condition = Map::new();
    condition.insert(key.to_string(), Value::Object(predicate));
    Value::Object(condition)
}

fn with_elements(first: Value, key: &str, op: &str, values: &[Value]) -> Vec<Value> {
    std::iter::once(first)
        .chain(values.iter().map(|value| predicate(key, op, value.clone())))
        .collect()
}

/// Chroma rejects `$and` / `$or` with fewer than two operands, so a single
/// condition is returned bare.
fn join(combinator: &str, mut conditions: Vec<Value>) -> Value {
    if conditions.len() == 1 {
        return conditions.remove(0);
    }
    let mut joined = Map::new();
    joined.insert(combinator.to_string(), Value::Array(conditions));
    Value::Object(joined)
}

#[cfg(test)]
mod tests {
    use veclens_core::CanonicalFilter;

    use super::*;

    #[test]
    fn test_equality_also_checks_arrays() {
        let filter = CanonicalFilter::new().where_eq("status", "active");
        let compiled = ChromaFilterCompiler.compile(&filter).unwrap();
        assert_eq!(
            compiled.native,
            Some(json!({"$or": [
                {"status": {"$eq": "active"}},
                {"status": {"$contains": "active"}}
            ]}))
        );
    }

    #[test]
    fn test_conjunction_uses_and() {
        let filter = CanonicalFilter::new()
            .with("score", Operator::Gt, 5)
            .with("tag", Operator::NotIn, json!(["a", "b"]));
        let compiled = ChromaFilterCompiler.compile(&filter).unwrap();
        assert_eq!(
            compiled.native,
            Some(json!({"$and": [
                {"score": {"$gt": 5}},
                {"$and": [
                    {"tag": {"$nin": ["a", "b"]}},
                    {"tag": {"$not_contains": "a"}},
                    {"tag": {"$not_contains": "b"}}
                ]}
            ]}))
        );
        assert!(compiled.is_complete());
    }

    #[test]
    fn test_single_range_is_not_wrapped() {
        let filter = CanonicalFilter::new().with("score", Operator::Lte, 2.5);
        let compiled = ChromaFilterCompiler.compile(&filter).unwrap();
        assert_eq!(compiled.native, Some(json!({"score": {"$lte": 2.5}})));
    }

    #[test]
    fn test_substring_and_document_clauses_are_residual() {
        let filter = CanonicalFilter::new()
            .with("title", Operator::Contains, "rust")
            .where_eq("document", "hello")
            .with("score", Operator::Gte, 1);
        let compiled = ChromaFilterCompiler.compile(&filter).unwrap();

        assert_eq!(compiled.native, Some(json!({"score": {"$gte": 1}})));
        assert_eq!(compiled.residual.clauses().len(), 2);
    }

    #[test]
    fn test_string_range_is_unsupported() {
        let filter = CanonicalFilter::new().with("name", Operator::Gte, "m");
        let err = ChromaFilterCompiler.compile(&filter).unwrap_err();
        assert_eq!(err.kind(), veclens_core::ErrorKind::UnsupportedOperator);
    }
}
