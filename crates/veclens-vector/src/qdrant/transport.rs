//! Qdrant transport seam and its gRPC implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::vectors_config::Config as VectorsConfig;
use qdrant_client::qdrant::vectors_output::VectorsOptions;
use qdrant_client::qdrant::{
    CountPointsBuilder, CreateCollectionBuilder, DeleteCollectionBuilder, DeletePointsBuilder,
    Distance, Filter, GetPointsBuilder, ListValue, PointId, PointStruct, PointsIdsList,
    ScrollPointsBuilder, SearchPointsBuilder, Struct, UpsertPointsBuilder, Value as QdrantValue,
    VectorParamsBuilder, VectorsOutput,
};
use serde_json::Value;
use uuid::Uuid;
use veclens_core::{BackendId, Metadata};

use super::QdrantConfig;
use crate::error::{TransportError, TransportResult};

/// A stored point.
#[derive(Debug, Clone, PartialEq)]
pub struct QdrantPoint {
    /// Point id.
    pub id: BackendId,
    /// Payload, including the `document` key.
    pub payload: Metadata,
    /// Dense vector.
    pub vector: Option<Vec<f32>>,
}

/// A scored search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct QdrantHit {
    /// The point.
    pub point: QdrantPoint,
    /// Similarity for cosine and dot collections, distance otherwise.
    pub score: f32,
}

/// Collection parameters reported by Qdrant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QdrantCollectionInfo {
    /// Vector size, absent for named-vector collections.
    pub dimension: Option<usize>,
    /// Distance function.
    pub distance: Option<Distance>,
}

/// One scroll page.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QdrantScroll {
    /// Points of the page.
    pub points: Vec<QdrantPoint>,
    /// Offset of the next page.
    pub next: Option<BackendId>,
}

/// Operations the Qdrant adapter needs from a server.
#[async_trait]
pub trait QdrantTransport: Send {
    /// Checks the server answers.
    async fn health(&mut self) -> TransportResult<()>;

    /// Lists collection names.
    async fn list_collections(&mut self) -> TransportResult<Vec<String>>;

    /// Creates a collection with one unnamed dense vector.
    async fn create_collection(
        &mut self,
        name: &str,
        dimension: usize,
        distance: Distance,
    ) -> TransportResult<()>;

    /// Describes a collection, `NotFound` if absent.
    async fn collection_info(&mut self, name: &str) -> TransportResult<QdrantCollectionInfo>;

    /// Drops a collection.
    async fn delete_collection(&mut self, name: &str) -> TransportResult<()>;

    /// Inserts or replaces points, waiting for the write to apply.
    async fn upsert(&mut self, name: &str, points: Vec<QdrantPoint>) -> TransportResult<()>;

    /// Fetches points by id.
    async fn retrieve(&mut self, name: &str, ids: &[BackendId])
    -> TransportResult<Vec<QdrantPoint>>;

    /// Reads one page of points in id order.
    async fn scroll(
        &mut self,
        name: &str,
        filter: Option<&Filter>,
        offset: Option<BackendId>,
        limit: usize,
    ) -> TransportResult<QdrantScroll>;

    /// Deletes points by id.
    async fn delete_points(&mut self, name: &str, ids: &[BackendId]) -> TransportResult<()>;

    /// Deletes every point matching a filter.
    async fn delete_where(&mut self, name: &str, filter: &Filter) -> TransportResult<()>;

    /// Counts points matching an optional filter.
    async fn count(&mut self, name: &str, filter: Option<&Filter>) -> TransportResult<u64>;

    /// Runs a nearest-neighbor search.
    async fn search(
        &mut self,
        name: &str,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<&Filter>,
    ) -> TransportResult<Vec<QdrantHit>>;
}

/// [`QdrantTransport`] over the official gRPC client.
pub struct GrpcQdrantTransport {
    client: Qdrant,
}

impl GrpcQdrantTransport {
    /// Builds the client. No request is sent until the first call.
    pub fn new(config: &QdrantConfig) -> TransportResult<Self> {
        let client = Qdrant::from_url(&config.url)
            .api_key(config.api_key.clone())
            .timeout(config.timeout())
            .build()?;
        Ok(Self { client })
    }
}

impl std::fmt::Debug for GrpcQdrantTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcQdrantTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl QdrantTransport for GrpcQdrantTransport {
    async fn health(&mut self) -> TransportResult<()> {
        self.client.health_check().await?;
        Ok(())
    }

    async fn list_collections(&mut self) -> TransportResult<Vec<String>> {
        let response = self.client.list_collections().await?;
        Ok(response.collections.into_iter().map(|c| c.name).collect())
    }

    async fn create_collection(
        &mut self,
        name: &str,
        dimension: usize,
        distance: Distance,
    ) -> TransportResult<()> {
        let vectors_config =
            VectorsConfig::Params(VectorParamsBuilder::new(dimension as u64, distance).build());
        self.client
            .create_collection(CreateCollectionBuilder::new(name).vectors_config(vectors_config))
            .await?;
        Ok(())
    }

    async fn collection_info(&mut self, name: &str) -> TransportResult<QdrantCollectionInfo> {
        if !self.client.collection_exists(name).await? {
            return Err(TransportError::not_found(format!("collection '{}'", name)));
        }

        let response = self.client.collection_info(name).await?;
        let params = response
            .result
            .and_then(|info| info.config)
            .and_then(|config| config.params)
            .and_then(|params| params.vectors_config)
            .and_then(|vectors| vectors.config);

        Ok(match params {
            Some(VectorsConfig::Params(params)) => QdrantCollectionInfo {
                dimension: Some(params.size as usize),
                distance: Distance::try_from(params.distance).ok(),
            },
            _ => QdrantCollectionInfo {
                dimension: None,
                distance: None,
            },
        })
    }

    async fn delete_collection(&mut self, name: &str) -> TransportResult<()> {
        self.client
            .delete_collection(DeleteCollectionBuilder::new(name))
            .await?;
        Ok(())
    }

    async fn upsert(&mut self, name: &str, points: Vec<QdrantPoint>) -> TransportResult<()> {
        let points: Vec<PointStruct> = points
            .into_iter()
            .map(|point| {
                let payload: HashMap<String, QdrantValue> = point
                    .payload
                    .into_iter()
                    .map(|(k, v)| (k, json_to_qdrant_value(v)))
                    .collect();
                PointStruct::new(
                    to_point_id(&point.id),
                    point.vector.unwrap_or_default(),
                    payload,
                )
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(name, points).wait(true))
            .await?;
        Ok(())
    }

    async fn retrieve(
        &mut self,
        name: &str,
        ids: &[BackendId],
    ) -> TransportResult<Vec<QdrantPoint>> {
        let ids: Vec<PointId> = ids.iter().map(to_point_id).collect();
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(name, ids)
                    .with_payload(true)
                    .with_vectors(true),
            )
            .await?;

        response
            .result
            .into_iter()
            .map(|p| from_parts(p.id, p.payload, p.vectors))
            .collect()
    }

    async fn scroll(
        &mut self,
        name: &str,
        filter: Option<&Filter>,
        offset: Option<BackendId>,
        limit: usize,
    ) -> TransportResult<QdrantScroll> {
        let mut request = ScrollPointsBuilder::new(name)
            .limit(limit.min(u32::MAX as usize) as u32)
            .with_payload(true)
            .with_vectors(true);
        if let Some(filter) = filter {
            request = request.filter(filter.clone());
        }
        if let Some(offset) = offset {
            request = request.offset(to_point_id(&offset));
        }

        let response = self.client.scroll(request).await?;
        let points = response
            .result
            .into_iter()
            .map(|p| from_parts(p.id, p.payload, p.vectors))
            .collect::<TransportResult<Vec<_>>>()?;
        let next = response.next_page_offset.map(from_point_id).transpose()?;

        Ok(QdrantScroll { points, next })
    }

    async fn delete_points(&mut self, name: &str, ids: &[BackendId]) -> TransportResult<()> {
        let ids: Vec<PointId> = ids.iter().map(to_point_id).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(name)
                    .points(PointsIdsList { ids })
                    .wait(true),
            )
            .await?;
        Ok(())
    }

    async fn delete_where(&mut self, name: &str, filter: &Filter) -> TransportResult<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(name)
                    .points(filter.clone())
                    .wait(true),
            )
            .await?;
        Ok(())
    }

    async fn count(&mut self, name: &str, filter: Option<&Filter>) -> TransportResult<u64> {
        let mut request = CountPointsBuilder::new(name).exact(true);
        if let Some(filter) = filter {
            request = request.filter(filter.clone());
        }
        let response = self.client.count(request).await?;
        Ok(response.result.map(|r| r.count).unwrap_or_default())
    }

    async fn search(
        &mut self,
        name: &str,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<&Filter>,
    ) -> TransportResult<Vec<QdrantHit>> {
        let mut request = SearchPointsBuilder::new(name, vector, limit as u64)
            .with_payload(true)
            .with_vectors(true);
        if let Some(filter) = filter {
            request = request.filter(filter.clone());
        }

        let response = self.client.search_points(request).await?;
        response
            .result
            .into_iter()
            .map(|p| {
                Ok(QdrantHit {
                    point: from_parts(p.id, p.payload, p.vectors)?,
                    score: p.score,
                })
            })
            .collect()
    }
}

fn to_point_id(id: &BackendId) -> PointId {
    match id {
        BackendId::Uuid(uuid) => PointId::from(uuid.to_string()),
        BackendId::Integer(n) => PointId::from(*n),
        BackendId::String(s) => PointId::from(s.clone()),
    }
}

fn from_point_id(id: PointId) -> TransportResult<BackendId> {
    match id.point_id_options {
        Some(PointIdOptions::Num(n)) => Ok(BackendId::Integer(n)),
        Some(PointIdOptions::Uuid(s)) => Uuid::parse_str(&s)
            .map(BackendId::Uuid)
            .map_err(|e| TransportError::malformed(format!("point id '{}': {}", s, e))),
        None => Err(TransportError::malformed("point without id")),
    }
}

fn from_parts(
    id: Option<PointId>,
    payload: HashMap<String, QdrantValue>,
    vectors: Option<VectorsOutput>,
) -> TransportResult<QdrantPoint> {
    let id = id
        .map(from_point_id)
        .ok_or_else(|| TransportError::malformed("point without id"))??;
    let payload = payload
        .into_iter()
        .map(|(k, v)| (k, qdrant_value_to_json(v)))
        .collect();
    Ok(QdrantPoint {
        id,
        payload,
        vector: extract_vector(vectors),
    })
}

fn extract_vector(vectors: Option<VectorsOutput>) -> Option<Vec<f32>> {
    vectors.and_then(|v| match v.vectors_options {
        #[allow(deprecated)]
        Some(VectorsOptions::Vector(vector)) => Some(vector.data),
        _ => None,
    })
}

fn json_to_qdrant_value(value: Value) -> QdrantValue {
    let kind = match value {
        Value::Null => Kind::NullValue(0),
        Value::Bool(b) => Kind::BoolValue(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Kind::IntegerValue(i),
            None => Kind::DoubleValue(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Kind::StringValue(s),
        Value::Array(values) => Kind::ListValue(ListValue {
            values: values.into_iter().map(json_to_qdrant_value).collect(),
        }),
        Value::Object(fields) => Kind::StructValue(Struct {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k, json_to_qdrant_value(v)))
                .collect(),
        }),
    };
    QdrantValue { kind: Some(kind) }
}

fn qdrant_value_to_json(value: QdrantValue) -> Value {
    match value.kind {
        Some(Kind::NullValue(_)) | None => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntegerValue(i)) => Value::from(i),
        Some(Kind::DoubleValue(f)) => Value::from(f),
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::ListValue(list)) => {
            Value::Array(list.values.into_iter().map(qdrant_value_to_json).collect())
        }
        Some(Kind::StructValue(obj)) => Value::Object(
            obj.fields
                .into_iter()
                .map(|(k, v)| (k, qdrant_value_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_payload_values_convert_both_ways() {
        let value = json!({"tags": ["a", "b"], "score": 7, "ratio": 0.5, "ok": true});
        assert_eq!(qdrant_value_to_json(json_to_qdrant_value(value.clone())), value);
    }

    #[test]
    fn test_point_ids_convert_both_ways() {
        let uuid = BackendId::Uuid(Uuid::NAMESPACE_DNS);
        assert_eq!(from_point_id(to_point_id(&uuid)).unwrap(), uuid);
        let num = BackendId::Integer(42);
        assert_eq!(from_point_id(to_point_id(&num)).unwrap(), num);
    }
}
