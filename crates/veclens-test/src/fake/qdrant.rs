//! In-memory Qdrant.

use std::collections::BTreeMap;

use async_trait::async_trait;
use qdrant_client::qdrant::condition::ConditionOneOf;
use qdrant_client::qdrant::r#match::MatchValue;
use qdrant_client::qdrant::{Condition, Distance, FieldCondition, Filter, Range};
use serde_json::Value;
use veclens_core::{BackendId, DistanceMetric, Metadata, Ranking};
use veclens_vector::qdrant::{
    QdrantCollectionInfo, QdrantHit, QdrantPoint, QdrantScroll, QdrantTransport,
};
use veclens_vector::{TransportError, TransportResult};

use super::top;

/// Point order of a scroll: integers first, then UUIDs.
type PointKey = (u8, u64, String);

fn point_key(id: &BackendId) -> PointKey {
    match id {
        BackendId::Integer(n) => (0, *n, String::new()),
        other => (1, 0, other.to_string()),
    }
}

#[derive(Debug)]
struct Stored {
    info: QdrantCollectionInfo,
    points: BTreeMap<PointKey, QdrantPoint>,
}

/// Qdrant server kept in memory.
#[derive(Debug, Default)]
pub struct FakeQdrant {
    collections: BTreeMap<String, Stored>,
}

impl FakeQdrant {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    fn stored(&mut self, name: &str) -> TransportResult<&mut Stored> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| TransportError::not_found(format!("collection '{}'", name)))
    }
}

/// Evaluates a filter: every `must` holds, no `must_not` does, and at least
/// one `should` holds when there are any.
pub fn filter_matches(filter: &Filter, payload: &Metadata) -> bool {
    filter.must.iter().all(|c| condition_matches(c, payload))
        && !filter.must_not.iter().any(|c| condition_matches(c, payload))
        && (filter.should.is_empty() || filter.should.iter().any(|c| condition_matches(c, payload)))
}

fn condition_matches(condition: &Condition, payload: &Metadata) -> bool {
    match &condition.condition_one_of {
        Some(ConditionOneOf::Field(field)) => field_matches(field, payload),
        Some(ConditionOneOf::Filter(filter)) => filter_matches(filter, payload),
        _ => false,
    }
}

/// A field condition on a missing key never holds. A list value holds when
/// any element does.
fn field_matches(field: &FieldCondition, payload: &Metadata) -> bool {
    let Some(value) = payload.get(&field.key) else {
        return false;
    };
    let values: Vec<&Value> = match value {
        Value::Array(values) => values.iter().collect(),
        other => vec![other],
    };

    let matched = match field.r#match.as_ref().and_then(|m| m.match_value.as_ref()) {
        Some(match_value) => values.iter().any(|v| match_value_holds(match_value, v)),
        None => true,
    };
    let ranged = match &field.range {
        Some(range) => values.iter().any(|v| range_holds(range, v)),
        None => true,
    };
    matched && ranged
}

fn match_value_holds(match_value: &MatchValue, value: &Value) -> bool {
    match match_value {
        MatchValue::Keyword(keyword) => value.as_str() == Some(keyword.as_str()),
        MatchValue::Integer(integer) => value.as_i64() == Some(*integer),
        MatchValue::Boolean(boolean) => value.as_bool() == Some(*boolean),
        MatchValue::Text(text) => value.as_str().is_some_and(|s| s.contains(text.as_str())),
        MatchValue::Keywords(keywords) => value
            .as_str()
            .is_some_and(|s| keywords.strings.iter().any(|k| k == s)),
        MatchValue::Integers(integers) => value
            .as_i64()
            .is_some_and(|i| integers.integers.contains(&i)),
        _ => false,
    }
}

fn range_holds(range: &Range, value: &Value) -> bool {
    let Some(number) = value.as_f64() else {
        return false;
    };
    range.gt.is_none_or(|bound| number > bound)
        && range.gte.is_none_or(|bound| number >= bound)
        && range.lt.is_none_or(|bound| number < bound)
        && range.lte.is_none_or(|bound| number <= bound)
}

/// Cosine and dot score as similarity, Euclid as distance.
fn score(distance: Option<Distance>, query: &[f32], vector: &[f32]) -> (Ranking, f32) {
    match distance {
        Some(Distance::Euclid) => (
            Ranking::Distance,
            DistanceMetric::Euclidean.distance(query, vector),
        ),
        Some(Distance::Dot) => (Ranking::Similarity, DistanceMetric::Dot.similarity(query, vector)),
        _ => (
            Ranking::Similarity,
            DistanceMetric::Cosine.similarity(query, vector),
        ),
    }
}

#[async_trait]
impl QdrantTransport for FakeQdrant {
    async fn health(&mut self) -> TransportResult<()> {
        Ok(())
    }

    async fn list_collections(&mut self) -> TransportResult<Vec<String>> {
        Ok(self.collections.keys().cloned().collect())
    }

    async fn create_collection(
        &mut self,
        name: &str,
        dimension: usize,
        distance: Distance,
    ) -> TransportResult<()> {
        if self.collections.contains_key(name) {
            return Err(TransportError::Status {
                status: 409,
                body: format!("Collection `{}` already exists!", name),
            });
        }
        self.collections.insert(
            name.to_string(),
            Stored {
                info: QdrantCollectionInfo {
                    dimension: Some(dimension),
                    distance: Some(distance),
                },
                points: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn collection_info(&mut self, name: &str) -> TransportResult<QdrantCollectionInfo> {
        Ok(self.stored(name)?.info)
    }

    async fn delete_collection(&mut self, name: &str) -> TransportResult<()> {
        self.collections
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| TransportError::not_found(format!("collection '{}'", name)))
    }

    async fn upsert(&mut self, name: &str, points: Vec<QdrantPoint>) -> TransportResult<()> {
        let stored = self.stored(name)?;
        if let Some(expected) = stored.info.dimension {
            let wrong = points
                .iter()
                .filter_map(|p| p.vector.as_ref())
                .find(|v| v.len() != expected);
            if let Some(vector) = wrong {
                return Err(TransportError::Status {
                    status: 400,
                    body: format!(
                        "Wrong input: Vector dimension error: expected dim: {}, got {}",
                        expected,
                        vector.len()
                    ),
                });
            }
        }
        for point in points {
            stored.points.insert(point_key(&point.id), point);
        }
        Ok(())
    }

    async fn retrieve(
        &mut self,
        name: &str,
        ids: &[BackendId],
    ) -> TransportResult<Vec<QdrantPoint>> {
        let stored = self.stored(name)?;
        Ok(ids
            .iter()
            .filter_map(|id| stored.points.get(&point_key(id)).cloned())
            .collect())
    }

    async fn scroll(
        &mut self,
        name: &str,
        filter: Option<&Filter>,
        offset: Option<BackendId>,
        limit: usize,
    ) -> TransportResult<QdrantScroll> {
        let stored = self.stored(name)?;
        let start = offset.as_ref().map(point_key);
        let mut matching = stored
            .points
            .iter()
            .filter(|(key, _)| start.as_ref().is_none_or(|start| *key >= start))
            .map(|(_, point)| point)
            .filter(|point| filter.is_none_or(|f| filter_matches(f, &point.payload)));

        let points: Vec<QdrantPoint> = matching.by_ref().take(limit).cloned().collect();
        let next = matching.next().map(|point| point.id.clone());
        Ok(QdrantScroll { points, next })
    }

    async fn delete_points(&mut self, name: &str, ids: &[BackendId]) -> TransportResult<()> {
        let stored = self.stored(name)?;
        for id in ids {
            stored.points.remove(&point_key(id));
        }
        Ok(())
    }

    async fn delete_where(&mut self, name: &str, filter: &Filter) -> TransportResult<()> {
        let stored = self.stored(name)?;
        stored
            .points
            .retain(|_, point| !filter_matches(filter, &point.payload));
        Ok(())
    }

    async fn count(&mut self, name: &str, filter: Option<&Filter>) -> TransportResult<u64> {
        let stored = self.stored(name)?;
        Ok(stored
            .points
            .values()
            .filter(|point| filter.is_none_or(|f| filter_matches(f, &point.payload)))
            .count() as u64)
    }

    async fn search(
        &mut self,
        name: &str,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<&Filter>,
    ) -> TransportResult<Vec<QdrantHit>> {
        let stored = self.stored(name)?;
        let distance = stored.info.distance;
        let (ranking, _) = score(distance, &[], &[]);

        let scored = stored
            .points
            .values()
            .filter(|point| filter.is_none_or(|f| filter_matches(f, &point.payload)))
            .filter_map(|point| {
                let (_, score) = score(distance, &vector, point.vector.as_ref()?);
                Some((point.clone(), score))
            })
            .collect();

        Ok(top(scored, ranking, limit)
            .into_iter()
            .map(|(point, score)| QdrantHit { point, score })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use veclens_core::{CanonicalFilter, FilterCompiler, Operator};
    use veclens_vector::qdrant::QdrantFilterCompiler;

    use super::*;

    fn payload(value: Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_compiled_filter_evaluates() {
        let filter = CanonicalFilter::new()
            .where_eq("status", "active")
            .with("score", Operator::Gt, 5)
            .with("tag", Operator::NotIn, json!(["x"]));
        let native = QdrantFilterCompiler.compile(&filter).unwrap().native.unwrap();

        assert!(filter_matches(
            &native,
            &payload(json!({"status": "active", "score": 6, "tag": "y"}))
        ));
        assert!(!filter_matches(
            &native,
            &payload(json!({"status": "active", "score": 6, "tag": "x"}))
        ));
        assert!(!filter_matches(
            &native,
            &payload(json!({"status": "active", "score": 5}))
        ));
    }

    #[test]
    fn test_list_payload_matches_any_element() {
        let filter = CanonicalFilter::new().where_eq("tags", "rust");
        let native = QdrantFilterCompiler.compile(&filter).unwrap().native.unwrap();
        assert!(filter_matches(&native, &payload(json!({"tags": ["go", "rust"]}))));
    }

    #[test]
    fn test_numbers_match_across_representations() {
        let filter = CanonicalFilter::new()
            .where_eq("n", 5.0)
            .with("rank", Operator::In, json!([1, 2.5, "top"]));
        let native = QdrantFilterCompiler.compile(&filter).unwrap().native.unwrap();

        assert!(filter_matches(&native, &payload(json!({"n": 5, "rank": 2.5}))));
        assert!(filter_matches(&native, &payload(json!({"n": [5], "rank": "top"}))));
        assert!(!filter_matches(&native, &payload(json!({"n": 5, "rank": 3}))));
    }

    #[test]
    fn test_empty_membership_matches_nothing() {
        let filter = CanonicalFilter::new().with("rank", Operator::In, json!([]));
        let native = QdrantFilterCompiler.compile(&filter).unwrap().native.unwrap();
        assert!(!filter_matches(&native, &payload(json!({"rank": 1}))));
    }
}
