//! In-memory reference evaluation of canonical filters.
//!
//! Missing fields never satisfy a positive operator and always satisfy a
//! negated one. Numbers compare numerically, strings lexicographically, and a
//! list-valued field matches `eq` / `in` / `contains` when any element does.

use std::cmp::Ordering;

use serde_json::Value;

use super::{CanonicalFilter, Clause, FieldTarget, Operator};
use crate::model::Item;

impl CanonicalFilter {
    /// Returns true if the item satisfies every clause.
    pub fn matches(&self, item: &Item) -> bool {
        self.clauses().iter().all(|clause| clause.matches(item))
    }
}

impl Clause {
    /// Returns true if the item satisfies this clause.
    pub fn matches(&self, item: &Item) -> bool {
        let document;
        let field = match self.target() {
            FieldTarget::Document => {
                document = item.document.clone().map(Value::String);
                document.as_ref()
            }
            FieldTarget::Metadata(key) => item.metadata.get(key),
        };

        let Some(field) = field else {
            return self.operator.is_negated();
        };

        match self.operator {
            Operator::Eq => any_element(field, |v| loose_eq(v, &self.value)),
            Operator::Ne => !any_element(field, |v| loose_eq(v, &self.value)),
            Operator::Gt => compare(field, &self.value) == Some(Ordering::Greater),
            Operator::Gte => matches!(
                compare(field, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lt => compare(field, &self.value) == Some(Ordering::Less),
            Operator::Lte => matches!(
                compare(field, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::In => in_list(field, self.list()),
            Operator::NotIn => !in_list(field, self.list()),
            Operator::Contains => contains(field, &self.value),
            Operator::NotContains => !contains(field, &self.value),
        }
    }
}

fn any_element(field: &Value, pred: impl Fn(&Value) -> bool) -> bool {
    match field {
        Value::Array(values) => values.iter().any(pred),
        other => pred(other),
    }
}

/// Equality that treats `5` and `5.0` as the same number.
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn in_list(field: &Value, list: &[Value]) -> bool {
    any_element(field, |v| list.iter().any(|candidate| loose_eq(v, candidate)))
}

fn contains(field: &Value, needle: &Value) -> bool {
    match (field, needle) {
        (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
        (Value::Array(values), needle) => values.iter().any(|v| loose_eq(v, needle)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::filter::DOCUMENT_FIELD;

    fn item() -> Item {
        Item::new("1")
            .with_document("the quick brown fox")
            .with_field("status", "active")
            .with_field("score", 7)
            .with_field("tags", json!(["a", "b"]))
    }

    #[test]
    fn test_status_and_score_conjunction() {
        let filter = CanonicalFilter::new()
            .where_eq("status", "active")
            .with("score", Operator::Gt, 5);
        assert!(filter.matches(&item()));

        let filter = CanonicalFilter::new()
            .where_eq("status", "active")
            .with("score", Operator::Gt, 7);
        assert!(!filter.matches(&item()));
    }

    #[test]
    fn test_missing_field_semantics() {
        let it = item();
        assert!(!Clause::new("missing", Operator::Eq, 1).matches(&it));
        assert!(Clause::new("missing", Operator::Ne, 1).matches(&it));
        assert!(Clause::new("missing", Operator::NotIn, json!([1])).matches(&it));
        assert!(!Clause::new("missing", Operator::Gt, 1).matches(&it));
    }

    #[test]
    fn test_numeric_comparison_is_not_lexicographic() {
        let it = Item::new("1").with_field("score", 10);
        assert!(Clause::new("score", Operator::Gt, 9).matches(&it));
        assert!(Clause::new("score", Operator::Eq, 10.0).matches(&it));
    }

    #[test]
    fn test_list_field_membership() {
        let it = item();
        assert!(Clause::new("tags", Operator::Eq, "a").matches(&it));
        assert!(Clause::new("tags", Operator::In, json!(["b", "z"])).matches(&it));
        assert!(Clause::new("tags", Operator::Contains, "b").matches(&it));
        assert!(Clause::new("tags", Operator::NotContains, "z").matches(&it));
    }

    #[test]
    fn test_document_contains() {
        let it = item();
        assert!(Clause::new(DOCUMENT_FIELD, Operator::Contains, "brown").matches(&it));
        assert!(Clause::new(DOCUMENT_FIELD, Operator::NotContains, "cat").matches(&it));
        assert!(Clause::new(DOCUMENT_FIELD, Operator::NotContains, "cat").matches(&Item::new("2")));
    }
}
