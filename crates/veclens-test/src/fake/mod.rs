//! In-memory fakes of the backend transports.
//!
//! Each fake keeps its records in process memory and evaluates the native
//! filter form its compiler produces, with the backend's own semantics for
//! missing keys. They answer the same errors a server would: `NotFound` for
//! unknown collections and nothing else.

mod chroma;
mod milvus;
mod pgvector;
mod qdrant;
mod weaviate;

use std::cmp::Ordering;

use serde_json::Value;
use veclens_core::Ranking;

pub use chroma::FakeChroma;
pub use milvus::FakeMilvus;
pub use pgvector::FakePgVector;
pub use qdrant::FakeQdrant;
pub use weaviate::FakeWeaviate;

/// Orders two JSON scalars: numbers numerically, strings lexicographically.
/// Mixed kinds do not compare.
pub(crate) fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Equality of JSON scalars, with integers and floats compared by value.
pub(crate) fn same(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Sorts scored records best first and keeps `limit` of them.
pub(crate) fn top<T>(mut scored: Vec<(T, f32)>, ranking: Ranking, limit: usize) -> Vec<(T, f32)> {
    scored.sort_by(|a, b| ranking.best_first(a.1, b.1));
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_compare_numbers_across_representations() {
        assert_eq!(compare(&json!(5), &json!(5.0)), Some(Ordering::Equal));
        assert!(same(&json!(5), &json!(5.0)));
        assert_eq!(compare(&json!("a"), &json!(1)), None);
    }

    #[test]
    fn test_top_orders_by_ranking() {
        let scored = vec![("a", 0.3), ("b", 0.1), ("c", 0.2)];
        let best = top(scored.clone(), Ranking::Distance, 2);
        assert_eq!(best, [("b", 0.1), ("c", 0.2)]);
        let best = top(scored, Ranking::Similarity, 1);
        assert_eq!(best, [("a", 0.3)]);
    }
}
