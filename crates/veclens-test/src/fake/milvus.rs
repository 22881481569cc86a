//! In-memory Milvus.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use veclens_core::{DistanceMetric, Metadata, Ranking};
use veclens_vector::milvus::{
    MAX_QUERY_WINDOW, MilvusExpr, MilvusHit, MilvusOp, MilvusSchema, MilvusTerm, MilvusTransport,
};
use veclens_vector::{TransportError, TransportResult};

use super::{compare, same, top};

#[derive(Debug)]
struct Stored {
    schema: MilvusSchema,
    rows: Vec<Metadata>,
}

impl Stored {
    fn key(&self, row: &Metadata) -> Option<String> {
        row.get(&self.schema.primary_field).map(Value::to_string)
    }
}

/// Milvus server kept in memory. Rows keep insertion order; an upsert of an
/// existing primary key replaces it in place.
#[derive(Debug, Default)]
pub struct FakeMilvus {
    collections: BTreeMap<String, Stored>,
}

impl FakeMilvus {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an empty collection with a custom schema, e.g. an `Int64`
    /// primary key.
    pub fn with_collection(mut self, name: &str, schema: MilvusSchema) -> Self {
        self.collections.insert(
            name.to_string(),
            Stored {
                schema,
                rows: Vec::new(),
            },
        );
        self
    }

    fn stored(&mut self, name: &str) -> TransportResult<&mut Stored> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| TransportError::not_found(format!("collection '{}'", name)))
    }
}

/// Evaluates a conjunction. A missing field fails every term.
pub fn expr_matches(expr: &MilvusExpr, row: &Metadata) -> bool {
    expr.terms.iter().all(|term| term_matches(term, row))
}

fn term_matches(term: &MilvusTerm, row: &Metadata) -> bool {
    let Some(field) = row.get(term.field.name()) else {
        return false;
    };
    let operand = term.value.to_json();
    let candidates = operand.as_array().map(Vec::as_slice).unwrap_or_default();
    let in_list = |value: &Value| candidates.iter().any(|candidate| same(value, candidate));
    // json_contains / json_contains_any only see arrays.
    let elements = field.as_array().map(Vec::as_slice).unwrap_or_default();

    match term.op {
        MilvusOp::Eq => same(field, &operand),
        MilvusOp::Matches => same(field, &operand) || elements.iter().any(|e| same(e, &operand)),
        MilvusOp::Gt => compare(field, &operand).is_some_and(|o| o.is_gt()),
        MilvusOp::Gte => compare(field, &operand).is_some_and(|o| o.is_ge()),
        MilvusOp::Lt => compare(field, &operand).is_some_and(|o| o.is_lt()),
        MilvusOp::Lte => compare(field, &operand).is_some_and(|o| o.is_le()),
        MilvusOp::In => in_list(field),
        MilvusOp::MatchesAny => in_list(field) || elements.iter().any(in_list),
    }
}

fn vector_of(row: &Metadata, field: &str) -> Option<Vec<f32>> {
    let values = row.get(field)?.as_array()?;
    Some(
        values
            .iter()
            .filter_map(Value::as_f64)
            .map(|v| v as f32)
            .collect(),
    )
}

#[async_trait]
impl MilvusTransport for FakeMilvus {
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
        metric: DistanceMetric,
    ) -> TransportResult<()> {
        if self.collections.contains_key(name) {
            return Err(TransportError::Api {
                code: 65535,
                message: format!("collection {} already exists", name),
            });
        }
        let schema = MilvusSchema {
            dimension: Some(dimension),
            metric,
            ..Default::default()
        };
        self.collections.insert(
            name.to_string(),
            Stored {
                schema,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn describe(&mut self, name: &str) -> TransportResult<MilvusSchema> {
        self.collections
            .get(name)
            .map(|stored| stored.schema.clone())
            .ok_or_else(|| TransportError::not_found(format!("collection '{}'", name)))
    }

    async fn drop_collection(&mut self, name: &str) -> TransportResult<()> {
        self.collections.remove(name);
        Ok(())
    }

    async fn upsert(&mut self, name: &str, rows: Vec<Metadata>) -> TransportResult<()> {
        let stored = self.stored(name)?;
        let vector_field = stored.schema.vector_field.clone();
        if let Some(expected) = stored.schema.dimension {
            let wrong = rows
                .iter()
                .filter_map(|row| vector_of(row, &vector_field))
                .find(|v| v.len() != expected);
            if let Some(vector) = wrong {
                return Err(TransportError::Api {
                    code: 1100,
                    message: format!(
                        "the dim ({}) of field data(embedding) is not equal to schema dim ({})",
                        vector.len(),
                        expected
                    ),
                });
            }
        }

        for row in rows {
            let key = stored.key(&row);
            match stored.rows.iter().position(|r| stored.key(r) == key) {
                Some(index) => stored.rows[index] = row,
                None => stored.rows.push(row),
            }
        }
        Ok(())
    }

    async fn query(
        &mut self,
        name: &str,
        filter: Option<&MilvusExpr>,
        offset: usize,
        limit: usize,
    ) -> TransportResult<Vec<Metadata>> {
        if offset + limit > MAX_QUERY_WINDOW {
            return Err(TransportError::Api {
                code: 65535,
                message: "invalid max query result window, (offset+limit) should be in range [1, 16384]"
                    .to_string(),
            });
        }
        let stored = self.stored(name)?;
        Ok(stored
            .rows
            .iter()
            .filter(|row| filter.is_none_or(|f| expr_matches(f, row)))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete(&mut self, name: &str, filter: &MilvusExpr) -> TransportResult<()> {
        let stored = self.stored(name)?;
        stored.rows.retain(|row| !expr_matches(filter, row));
        Ok(())
    }

    async fn count(&mut self, name: &str) -> TransportResult<u64> {
        Ok(self.stored(name)?.rows.len() as u64)
    }

    async fn search(
        &mut self,
        name: &str,
        vector_field: &str,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<&MilvusExpr>,
    ) -> TransportResult<Vec<MilvusHit>> {
        let stored = self.stored(name)?;
        let metric = stored.schema.metric;
        let ranking = match metric {
            DistanceMetric::Euclidean => Ranking::Distance,
            _ => Ranking::Similarity,
        };

        let scored = stored
            .rows
            .iter()
            .filter(|row| filter.is_none_or(|f| expr_matches(f, row)))
            .filter_map(|row| {
                let embedding = vector_of(row, vector_field)?;
                let score = match ranking {
                    Ranking::Distance => metric.distance(&vector, &embedding),
                    Ranking::Similarity => metric.similarity(&vector, &embedding),
                };
                Some((row.clone(), score))
            })
            .collect();

        Ok(top(scored, ranking, limit)
            .into_iter()
            .map(|(row, distance)| MilvusHit { row, distance })
            .collect())
    }
}
