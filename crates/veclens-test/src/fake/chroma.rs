//! In-memory Chroma.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use veclens_core::{DistanceMetric, Item, Metadata, Ranking};
use veclens_vector::chroma::{ChromaCollection, ChromaGet, ChromaHit, ChromaTransport, SPACE_KEY};
use veclens_vector::{TransportError, TransportResult};

use super::{compare, same, top};

#[derive(Debug)]
struct Stored {
    info: ChromaCollection,
    records: Vec<Item>,
}

/// Chroma server kept in memory. Records keep insertion order; an upsert of
/// an existing id replaces it in place.
#[derive(Debug, Default)]
pub struct FakeChroma {
    collections: BTreeMap<String, Stored>,
    created: u64,
}

impl FakeChroma {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    fn by_id(&mut self, id: &str) -> TransportResult<&mut Stored> {
        self.collections
            .values_mut()
            .find(|stored| stored.info.id == id)
            .ok_or_else(|| TransportError::not_found(format!("collection id '{}'", id)))
    }
}

/// Evaluates a where-map the way Chroma does: a missing key only satisfies
/// `$ne`, `$nin` and `$not_contains`. Scalar operators never match an array
/// value; `$contains` on an array checks its elements.
pub fn where_matches(filter: &Value, metadata: &Metadata) -> bool {
    let Some(map) = filter.as_object() else {
        return false;
    };
    map.iter().all(|(key, condition)| {
        if key == "$and" {
            return condition
                .as_array()
                .is_some_and(|all| all.iter().all(|f| where_matches(f, metadata)));
        }
        if key == "$or" {
            return condition
                .as_array()
                .is_some_and(|any| any.iter().any(|f| where_matches(f, metadata)));
        }
        let Some(predicate) = condition.as_object() else {
            return metadata.get(key).is_some_and(|v| same(v, condition));
        };
        predicate
            .iter()
            .all(|(op, operand)| predicate_matches(op, operand, metadata.get(key)))
    })
}

fn predicate_matches(op: &str, operand: &Value, field: Option<&Value>) -> bool {
    let in_list = |field: &Value| {
        operand
            .as_array()
            .is_some_and(|list| list.iter().any(|candidate| same(field, candidate)))
    };
    let has_element = |field: &Value| {
        field
            .as_array()
            .is_some_and(|elements| elements.iter().any(|element| same(element, operand)))
    };
    match (op, field) {
        ("$ne", None) | ("$nin", None) | ("$not_contains", None) => true,
        (_, None) => false,
        ("$contains", Some(field)) => has_element(field),
        ("$not_contains", Some(field)) => !has_element(field),
        ("$eq", Some(field)) => same(field, operand),
        ("$ne", Some(field)) => !same(field, operand),
        ("$gt", Some(field)) => compare(field, operand).is_some_and(|o| o.is_gt()),
        ("$gte", Some(field)) => compare(field, operand).is_some_and(|o| o.is_ge()),
        ("$lt", Some(field)) => compare(field, operand).is_some_and(|o| o.is_lt()),
        ("$lte", Some(field)) => compare(field, operand).is_some_and(|o| o.is_le()),
        ("$in", Some(field)) => in_list(field),
        ("$nin", Some(field)) => !in_list(field),
        _ => false,
    }
}

fn space(info: &ChromaCollection) -> DistanceMetric {
    match info
        .metadata
        .as_ref()
        .and_then(|m| m.get(SPACE_KEY))
        .and_then(Value::as_str)
    {
        Some("cosine") => DistanceMetric::Cosine,
        Some("ip") => DistanceMetric::Dot,
        _ => DistanceMetric::Euclidean,
    }
}

#[async_trait]
impl ChromaTransport for FakeChroma {
    async fn heartbeat(&mut self) -> TransportResult<()> {
        Ok(())
    }

    async fn list_collections(&mut self) -> TransportResult<Vec<ChromaCollection>> {
        Ok(self.collections.values().map(|s| s.info.clone()).collect())
    }

    async fn create_collection(
        &mut self,
        name: &str,
        metadata: Metadata,
    ) -> TransportResult<ChromaCollection> {
        if let Some(stored) = self.collections.get(name) {
            return Ok(stored.info.clone());
        }
        self.created += 1;
        let info = ChromaCollection {
            id: format!("col-{}", self.created),
            name: name.to_string(),
            metadata: Some(metadata),
            dimension: None,
        };
        self.collections.insert(
            name.to_string(),
            Stored {
                info: info.clone(),
                records: Vec::new(),
            },
        );
        Ok(info)
    }

    async fn get_collection(&mut self, name: &str) -> TransportResult<ChromaCollection> {
        self.collections
            .get(name)
            .map(|stored| stored.info.clone())
            .ok_or_else(|| TransportError::not_found(format!("collection '{}'", name)))
    }

    async fn delete_collection(&mut self, name: &str) -> TransportResult<()> {
        self.collections
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| TransportError::not_found(format!("collection '{}'", name)))
    }

    async fn upsert(&mut self, collection_id: &str, items: Vec<Item>) -> TransportResult<()> {
        let stored = self.by_id(collection_id)?;
        for item in items {
            if let Some(embedding) = &item.embedding {
                stored.info.dimension.get_or_insert(embedding.len());
            }
            match stored.records.iter_mut().find(|r| r.id == item.id) {
                Some(existing) => *existing = item,
                None => stored.records.push(item),
            }
        }
        Ok(())
    }

    async fn get(&mut self, collection_id: &str, request: ChromaGet) -> TransportResult<Vec<Item>> {
        let stored = self.by_id(collection_id)?;
        let matching = stored.records.iter().filter(|item| {
            request.ids.as_ref().is_none_or(|ids| ids.contains(&item.id))
                && request
                    .filter
                    .as_ref()
                    .is_none_or(|f| where_matches(f, &item.metadata))
        });
        Ok(matching
            .skip(request.offset.unwrap_or(0))
            .take(request.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn query(
        &mut self,
        collection_id: &str,
        embeddings: Vec<Vec<f32>>,
        n_results: usize,
        filter: Option<&Value>,
    ) -> TransportResult<Vec<Vec<ChromaHit>>> {
        let stored = self.by_id(collection_id)?;
        let metric = space(&stored.info);

        Ok(embeddings
            .iter()
            .map(|query| {
                let scored = stored
                    .records
                    .iter()
                    .filter(|item| filter.is_none_or(|f| where_matches(f, &item.metadata)))
                    .filter_map(|item| {
                        let embedding = item.embedding.as_ref()?;
                        Some((item.clone(), metric.distance(query, embedding)))
                    })
                    .collect();
                top(scored, Ranking::Distance, n_results)
                    .into_iter()
                    .map(|(item, distance)| ChromaHit { item, distance })
                    .collect()
            })
            .collect())
    }

    async fn delete(&mut self, collection_id: &str, ids: &[String]) -> TransportResult<()> {
        let stored = self.by_id(collection_id)?;
        stored.records.retain(|item| !ids.contains(&item.id));
        Ok(())
    }

    async fn delete_where(&mut self, collection_id: &str, filter: &Value) -> TransportResult<()> {
        let stored = self.by_id(collection_id)?;
        stored
            .records
            .retain(|item| !where_matches(filter, &item.metadata));
        Ok(())
    }

    async fn count(&mut self, collection_id: &str) -> TransportResult<u64> {
        Ok(self.by_id(collection_id)?.records.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_where_map_and() {
        let metadata = json!({"status": "active", "score": 7})
            .as_object()
            .cloned()
            .unwrap();
        let filter = json!({"$and": [{"status": {"$eq": "active"}}, {"score": {"$gt": 5}}]});
        assert!(where_matches(&filter, &metadata));

        let filter = json!({"score": {"$lte": 5}});
        assert!(!where_matches(&filter, &metadata));
    }

    #[test]
    fn test_missing_key_satisfies_negations_only() {
        let metadata = Metadata::new();
        assert!(where_matches(&json!({"tag": {"$ne": "a"}}), &metadata));
        assert!(where_matches(&json!({"tag": {"$nin": ["a"]}}), &metadata));
        assert!(!where_matches(&json!({"tag": {"$eq": "a"}}), &metadata));
        assert!(where_matches(&json!({"tag": {"$not_contains": "a"}}), &metadata));
    }

    #[test]
    fn test_array_values_need_the_array_operators() {
        let metadata = json!({"tags": ["red", "blue"]}).as_object().cloned().unwrap();
        assert!(!where_matches(&json!({"tags": {"$eq": "red"}}), &metadata));
        assert!(where_matches(&json!({"tags": {"$contains": "red"}}), &metadata));
        assert!(!where_matches(&json!({"tags": {"$not_contains": "blue"}}), &metadata));

        let either = json!({"$or": [{"tags": {"$eq": "red"}}, {"tags": {"$contains": "red"}}]});
        assert!(where_matches(&either, &metadata));
    }
}
