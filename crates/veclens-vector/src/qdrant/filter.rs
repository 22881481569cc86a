//! Canonical filter to Qdrant `Filter` compilation.
//!
//! Positive clauses land in `must`. Qdrant has no negated primitives, so
//! `ne`, `not_in` and `not_contains` put the positive condition in
//! `must_not`. Every operator is evaluated server-side, including on the
//! document, which is stored under the `document` payload key.
//!
//! Numbers always match through a closed range, so `5` and `5.0` select the
//! same points. Membership over mixed kinds becomes a nested `should`.

use qdrant_client::qdrant::condition::ConditionOneOf;
use qdrant_client::qdrant::r#match::MatchValue;
use qdrant_client::qdrant::{
    Condition, FieldCondition, Filter, Match, Range, RepeatedStrings,
};
use serde_json::Value;
use veclens_core::{Capabilities, Clause, Error, FilterCompiler, Operator, Result};

/// Where a lowered condition goes.
#[derive(Debug, Clone, PartialEq)]
pub enum QdrantCondition {
    /// Must hold.
    Must(Condition),
    /// Must not hold.
    MustNot(Condition),
}

/// Compiles canonical filters into Qdrant [`Filter`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct QdrantFilterCompiler;

impl FilterCompiler for QdrantFilterCompiler {
    type Condition = QdrantCondition;
    type Fragment = Filter;

    fn capabilities(&self) -> Capabilities {
        Capabilities::all_server_side()
    }

    fn lower(&self, clause: &Clause) -> Result<QdrantCondition> {
        let key = clause.field.as_str();
        let condition = match clause.operator {
            Operator::Eq => QdrantCondition::Must(equals(key, &clause.value)?),
            Operator::Ne => QdrantCondition::MustNot(equals(key, &clause.value)?),
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                QdrantCondition::Must(range(clause)?)
            }
            Operator::In => QdrantCondition::Must(any_of(key, clause.list())?),
            Operator::NotIn => QdrantCondition::MustNot(any_of(key, clause.list())?),
            Operator::Contains => QdrantCondition::Must(contains(key, &clause.value)?),
            Operator::NotContains => QdrantCondition::MustNot(contains(key, &clause.value)?),
        };
        Ok(condition)
    }

    fn combine(&self, conditions: Vec<QdrantCondition>) -> Filter {
        let mut filter = Filter::default();
        for condition in conditions {
            match condition {
                QdrantCondition::Must(c) => filter.must.push(c),
                QdrantCondition::MustNot(c) => filter.must_not.push(c),
            }
        }
        filter
    }
}

fn field(key: &str, r#match: Option<MatchValue>, range: Option<Range>) -> Condition {
    let field = FieldCondition {
        key: key.to_string(),
        r#match: r#match.map(|value| Match {
            match_value: Some(value),
        }),
        range,
        ..Default::default()
    };
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(field)),
    }
}

fn exact_range(value: f64) -> Range {
    Range {
        gte: Some(value),
        lte: Some(value),
        ..Default::default()
    }
}

fn equals(key: &str, value: &Value) -> Result<Condition> {
    let condition = match value {
        Value::String(s) => field(key, Some(MatchValue::Keyword(s.clone())), None),
        Value::Bool(b) => field(key, Some(MatchValue::Boolean(*b)), None),
        Value::Number(n) => {
            let n = n.as_f64().ok_or_else(|| unsupported(key, value))?;
            field(key, None, Some(exact_range(n)))
        }
        _ => return Err(unsupported(key, value)),
    };
    Ok(condition)
}

fn range(clause: &Clause) -> Result<Condition> {
    let bound = clause.value.as_f64().ok_or_else(|| {
        Error::unsupported_operator(format!(
            "Qdrant cannot order field '{}' by non-numeric value {}",
            clause.field, clause.value
        ))
    })?;

    let mut range = Range::default();
    match clause.operator {
        Operator::Gt => range.gt = Some(bound),
        Operator::Gte => range.gte = Some(bound),
        Operator::Lt => range.lt = Some(bound),
        _ => range.lte = Some(bound),
    }
    Ok(field(&clause.field, None, Some(range)))
}

fn any_of(key: &str, values: &[Value]) -> Result<Condition> {
    let strings: Vec<String> = values
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();

    let mut conditions = Vec::new();
    // An empty keyword list matches nothing, like an empty `in`.
    if !strings.is_empty() || values.is_empty() {
        conditions.push(field(
            key,
            Some(MatchValue::Keywords(RepeatedStrings { strings })),
            None,
        ));
    }
    for value in values.iter().filter(|v| !v.is_string()) {
        conditions.push(equals(key, value)?);
    }

    match conditions.len() {
        1 => Ok(conditions.remove(0)),
        _ => Ok(Condition {
            condition_one_of: Some(ConditionOneOf::Filter(Filter {
                should: conditions,
                ..Default::default()
            })),
        }),
    }
}

fn contains(key: &str, value: &Value) -> Result<Condition> {
    match value {
        Value::String(text) => Ok(field(key, Some(MatchValue::Text(text.clone())), None)),
        other => equals(key, other),
    }
}

fn unsupported(key: &str, value: &Value) -> Error {
    Error::unsupported_operator(format!(
        "Qdrant cannot match field '{}' against {}",
        key, value
    ))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use veclens_core::CanonicalFilter;

    use super::*;

    fn field_condition(condition: &Condition) -> &FieldCondition {
        match &condition.condition_one_of {
            Some(ConditionOneOf::Field(field)) => field,
            other => panic!("expected a field condition, got {:?}", other),
        }
    }

    fn match_value(condition: &Condition) -> Option<&MatchValue> {
        field_condition(condition)
            .r#match
            .as_ref()
            .and_then(|m| m.match_value.as_ref())
    }

    #[test]
    fn test_positive_and_negated_clauses() {
        let filter = CanonicalFilter::new()
            .where_eq("status", "active")
            .with("score", Operator::Gt, 5)
            .with("tier", Operator::Ne, "free");
        let compiled = QdrantFilterCompiler.compile(&filter).unwrap();
        let native = compiled.native.unwrap();

        assert!(compiled.residual.is_empty());
        assert_eq!(native.must.len(), 2);
        assert_eq!(native.must_not.len(), 1);
        assert_eq!(
            match_value(&native.must[0]),
            Some(&MatchValue::Keyword("active".into()))
        );
        assert_eq!(field_condition(&native.must[1]).range.as_ref().unwrap().gt, Some(5.0));
        assert_eq!(field_condition(&native.must_not[0]).key, "tier");
    }

    #[test]
    fn test_membership_lists() {
        let filter = CanonicalFilter::new()
            .with("tag", Operator::In, json!(["a", "b"]))
            .with("rank", Operator::NotIn, json!([1, 2]));
        let native = QdrantFilterCompiler.compile(&filter).unwrap().native.unwrap();

        assert_eq!(
            match_value(&native.must[0]),
            Some(&MatchValue::Keywords(RepeatedStrings {
                strings: vec!["a".into(), "b".into()]
            }))
        );
        let Some(ConditionOneOf::Filter(nested)) = &native.must_not[0].condition_one_of else {
            panic!("expected a nested filter");
        };
        assert_eq!(nested.should.len(), 2);
        assert_eq!(field_condition(&nested.should[1]).range, Some(exact_range(2.0)));
    }

    #[test]
    fn test_mixed_membership_uses_should() {
        let filter = CanonicalFilter::new().with("tag", Operator::In, json!(["a", 1, true]));
        let native = QdrantFilterCompiler.compile(&filter).unwrap().native.unwrap();
        let Some(ConditionOneOf::Filter(nested)) = &native.must[0].condition_one_of else {
            panic!("expected a nested filter");
        };
        assert_eq!(nested.should.len(), 3);
        assert_eq!(
            match_value(&nested.should[2]),
            Some(&MatchValue::Boolean(true))
        );
    }

    #[test]
    fn test_document_text_match_is_server_side() {
        let filter = CanonicalFilter::new().with("document", Operator::NotContains, "draft");
        let compiled = QdrantFilterCompiler.compile(&filter).unwrap();
        let native = compiled.native.unwrap();

        assert!(compiled.residual.is_empty());
        assert_eq!(
            match_value(&native.must_not[0]),
            Some(&MatchValue::Text("draft".into()))
        );
    }

    #[test]
    fn test_string_range_is_unsupported() {
        let filter = CanonicalFilter::new().with("name", Operator::Lt, "m");
        assert!(QdrantFilterCompiler.compile(&filter).is_err());
    }

    #[test]
    fn test_numeric_equality_becomes_closed_range() {
        let filter = CanonicalFilter::new().where_eq("rank", 5);
        let native = QdrantFilterCompiler.compile(&filter).unwrap().native.unwrap();
        assert_eq!(field_condition(&native.must[0]).range, Some(exact_range(5.0)));

        let filter = CanonicalFilter::new().where_eq("ratio", 0.5);
        let native = QdrantFilterCompiler.compile(&filter).unwrap().native.unwrap();
        let range = field_condition(&native.must[0]).range.clone().unwrap();
        assert_eq!((range.gte, range.lte), (Some(0.5), Some(0.5)));
    }
}
