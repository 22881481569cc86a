//! In-memory Weaviate.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;
use veclens_core::{DistanceMetric, Metadata, Ranking};
use veclens_vector::weaviate::{
    WeaviateClass, WeaviateHit, WeaviateObject, WeaviateOperator, WeaviateTransport,
    WeaviateValue, WeaviateWhere,
};
use veclens_vector::{TransportError, TransportResult};

use super::{compare, same, top};

#[derive(Debug)]
struct Stored {
    class: WeaviateClass,
    objects: Vec<WeaviateObject>,
}

/// Weaviate server kept in memory. Objects keep insertion order and the
/// schema grows with every new property, like auto-schema does.
#[derive(Debug, Default)]
pub struct FakeWeaviate {
    classes: BTreeMap<String, Stored>,
}

impl FakeWeaviate {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    fn stored(&mut self, class: &str) -> TransportResult<&mut Stored> {
        self.classes
            .get_mut(class)
            .ok_or_else(|| TransportError::not_found(format!("class '{}'", class)))
    }
}

/// Evaluates a where-filter. `NotEqual` holds for an object without the
/// property; every other operator needs it.
pub fn where_matches(filter: &WeaviateWhere, properties: &Metadata) -> bool {
    match filter {
        WeaviateWhere::And(operands) => operands.iter().all(|f| where_matches(f, properties)),
        WeaviateWhere::Property {
            path,
            operator,
            value,
        } => {
            let Some(field) = properties.get(path).filter(|v| !v.is_null()) else {
                return *operator == WeaviateOperator::NotEqual;
            };
            property_matches(field, *operator, value)
        }
    }
}

fn property_matches(field: &Value, operator: WeaviateOperator, value: &WeaviateValue) -> bool {
    let operand = value.to_json();
    let elements: Vec<&Value> = match field {
        Value::Array(values) => values.iter().collect(),
        other => vec![other],
    };
    let any = |check: &dyn Fn(&Value) -> bool| elements.iter().any(|v| check(v));

    match operator {
        WeaviateOperator::Equal => any(&|v| same(v, &operand)),
        WeaviateOperator::NotEqual => !any(&|v| same(v, &operand)),
        WeaviateOperator::GreaterThan => any(&|v| compare(v, &operand).is_some_and(|o| o.is_gt())),
        WeaviateOperator::GreaterThanEqual => {
            any(&|v| compare(v, &operand).is_some_and(|o| o.is_ge()))
        }
        WeaviateOperator::LessThan => any(&|v| compare(v, &operand).is_some_and(|o| o.is_lt())),
        WeaviateOperator::LessThanEqual => {
            any(&|v| compare(v, &operand).is_some_and(|o| o.is_le()))
        }
        WeaviateOperator::ContainsAny => {
            let candidates = operand.as_array().cloned().unwrap_or_else(|| vec![operand.clone()]);
            any(&|v| candidates.iter().any(|c| same(v, c)))
        }
    }
}

/// Distance as Weaviate reports it: `1 - cos`, squared L2 or negated dot.
fn distance(metric: DistanceMetric, query: &[f32], vector: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Euclidean => {
            let l2 = DistanceMetric::Euclidean.distance(query, vector);
            l2 * l2
        }
        DistanceMetric::Dot => DistanceMetric::Dot.distance(query, vector),
        DistanceMetric::Cosine | DistanceMetric::Unknown => {
            DistanceMetric::Cosine.distance(query, vector)
        }
    }
}

#[async_trait]
impl WeaviateTransport for FakeWeaviate {
    async fn ready(&mut self) -> TransportResult<()> {
        Ok(())
    }

    async fn list_classes(&mut self) -> TransportResult<Vec<String>> {
        Ok(self.classes.keys().cloned().collect())
    }

    async fn create_class(&mut self, class: &str, metric: DistanceMetric) -> TransportResult<()> {
        if self.classes.contains_key(class) {
            return Err(TransportError::Status {
                status: 422,
                body: format!("class name {:?} already exists", class),
            });
        }
        self.classes.insert(
            class.to_string(),
            Stored {
                class: WeaviateClass {
                    name: class.to_string(),
                    properties: Vec::new(),
                    metric,
                },
                objects: Vec::new(),
            },
        );
        Ok(())
    }

    async fn class_info(&mut self, class: &str) -> TransportResult<WeaviateClass> {
        Ok(self.stored(class)?.class.clone())
    }

    async fn delete_class(&mut self, class: &str) -> TransportResult<()> {
        self.classes.remove(class);
        Ok(())
    }

    async fn put_objects(
        &mut self,
        class: &str,
        objects: Vec<WeaviateObject>,
    ) -> TransportResult<()> {
        let stored = self.stored(class)?;
        for object in objects {
            for key in object.properties.keys() {
                if !stored.class.properties.contains(key) {
                    stored.class.properties.push(key.clone());
                }
            }
            match stored.objects.iter_mut().find(|o| o.id == object.id) {
                Some(existing) => *existing = object,
                None => stored.objects.push(object),
            }
        }
        Ok(())
    }

    async fn get_object(
        &mut self,
        class: &str,
        id: Uuid,
    ) -> TransportResult<Option<WeaviateObject>> {
        let stored = self.stored(class)?;
        Ok(stored.objects.iter().find(|o| o.id == id).cloned())
    }

    async fn delete_object(&mut self, class: &str, id: Uuid) -> TransportResult<()> {
        let stored = self.stored(class)?;
        stored.objects.retain(|o| o.id != id);
        Ok(())
    }

    async fn delete_where(&mut self, class: &str, filter: &WeaviateWhere) -> TransportResult<()> {
        let stored = self.stored(class)?;
        stored
            .objects
            .retain(|o| !where_matches(filter, &o.properties));
        Ok(())
    }

    async fn list_objects(
        &mut self,
        class: &WeaviateClass,
        filter: Option<&WeaviateWhere>,
        offset: usize,
        limit: usize,
    ) -> TransportResult<Vec<WeaviateObject>> {
        let stored = self.stored(&class.name)?;
        Ok(stored
            .objects
            .iter()
            .filter(|o| filter.is_none_or(|f| where_matches(f, &o.properties)))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&mut self, class: &str) -> TransportResult<u64> {
        Ok(self.stored(class)?.objects.len() as u64)
    }

    async fn near_vector(
        &mut self,
        class: &WeaviateClass,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<&WeaviateWhere>,
    ) -> TransportResult<Vec<WeaviateHit>> {
        let stored = self.stored(&class.name)?;
        let metric = stored.class.metric;
        let scored = stored
            .objects
            .iter()
            .filter(|o| filter.is_none_or(|f| where_matches(f, &o.properties)))
            .filter_map(|o| {
                let embedding = o.vector.as_ref()?;
                Some((o.clone(), distance(metric, &vector, embedding)))
            })
            .collect();

        Ok(top(scored, Ranking::Distance, limit)
            .into_iter()
            .map(|(object, distance)| WeaviateHit { object, distance })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use veclens_core::{CanonicalFilter, FilterCompiler, Operator};
    use veclens_vector::weaviate::{WeaviateFilterCompiler, by_property};

    use super::*;

    fn properties(value: Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_compiled_filter_evaluates() {
        let filter = CanonicalFilter::new()
            .where_eq("status", "active")
            .with("score", Operator::Gt, 5);
        let native = WeaviateFilterCompiler
            .compile(&filter)
            .unwrap()
            .native
            .unwrap();

        assert!(where_matches(
            &native,
            &properties(json!({"status": "active", "score": 6}))
        ));
        assert!(!where_matches(
            &native,
            &properties(json!({"status": "active", "score": 5}))
        ));
    }

    #[test]
    fn test_not_equal_holds_without_property() {
        let filter = by_property("status").not_equal("active");
        assert!(where_matches(&filter, &Metadata::new()));
        assert!(!where_matches(&by_property("status").equal("active"), &Metadata::new()));
    }

    #[tokio::test]
    async fn test_schema_grows_with_objects() {
        let mut fake = FakeWeaviate::new();
        fake.create_class("Docs", DistanceMetric::Cosine).await.unwrap();
        fake.put_objects(
            "Docs",
            vec![WeaviateObject {
                id: Uuid::new_v4(),
                properties: properties(json!({"status": "active"})),
                vector: Some(vec![1.0, 0.0]),
            }],
        )
        .await
        .unwrap();

        let class = fake.class_info("Docs").await.unwrap();
        assert_eq!(class.properties, vec!["status".to_string()]);
    }
}
