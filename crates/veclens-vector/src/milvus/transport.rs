//! Milvus transport seam and its REST (v2) implementation.

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use veclens_core::{DistanceMetric, IdKind, Metadata};

use super::MilvusConfig;
use super::filter::{DOCUMENT_FIELD, MilvusExpr, PRIMARY_FIELD, VECTOR_FIELD};
use crate::error::{TransportError, TransportResult};
use crate::rest::RestClient;

/// Largest `offset + limit` a Milvus query accepts.
pub const MAX_QUERY_WINDOW: usize = 16_384;

/// Longest VarChar the adapter declares.
const MAX_VARCHAR: usize = 65_535;

/// Schema facts of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MilvusSchema {
    /// Name of the primary key field.
    pub primary_field: String,
    /// Id type of the primary key: VarChar keys are native strings, Int64
    /// keys integers.
    pub id_kind: IdKind,
    /// Name of the float vector field.
    pub vector_field: String,
    /// Declared vector width.
    pub dimension: Option<usize>,
    /// Metric of the vector index.
    pub metric: DistanceMetric,
}

impl Default for MilvusSchema {
    fn default() -> Self {
        Self {
            primary_field: PRIMARY_FIELD.to_string(),
            id_kind: IdKind::NativeString,
            vector_field: VECTOR_FIELD.to_string(),
            dimension: None,
            metric: DistanceMetric::Unknown,
        }
    }
}

/// One search hit: the output fields of a row plus its score.
#[derive(Debug, Clone, PartialEq)]
pub struct MilvusHit {
    /// Output fields, dynamic keys flattened in.
    pub row: Metadata,
    /// Score under the collection metric.
    pub distance: f32,
}

/// Returns the Milvus metric type of a metric.
pub fn metric_type(metric: DistanceMetric) -> &'static str {
    match metric {
        DistanceMetric::Euclidean => "L2",
        DistanceMetric::Dot => "IP",
        DistanceMetric::Cosine | DistanceMetric::Unknown => "COSINE",
    }
}

/// Operations the Milvus adapter needs from a server.
#[async_trait]
pub trait MilvusTransport: Send {
    /// Checks the server answers.
    async fn health(&mut self) -> TransportResult<()>;

    /// Lists collection names.
    async fn list_collections(&mut self) -> TransportResult<Vec<String>>;

    /// Creates a collection with an `id` / `document` / `embedding` schema,
    /// dynamic fields enabled and an indexed, loaded vector field.
    async fn create_collection(
        &mut self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> TransportResult<()>;

    /// Describes a collection, `NotFound` if absent.
    async fn describe(&mut self, name: &str) -> TransportResult<MilvusSchema>;

    /// Drops a collection.
    async fn drop_collection(&mut self, name: &str) -> TransportResult<()>;

    /// Inserts or replaces rows.
    async fn upsert(&mut self, name: &str, rows: Vec<Metadata>) -> TransportResult<()>;

    /// Returns the rows matching `filter`.
    async fn query(
        &mut self,
        name: &str,
        filter: Option<&MilvusExpr>,
        offset: usize,
        limit: usize,
    ) -> TransportResult<Vec<Metadata>>;

    /// Deletes the rows matching `filter`.
    async fn delete(&mut self, name: &str, filter: &MilvusExpr) -> TransportResult<()>;

    /// Counts the rows of a collection.
    async fn count(&mut self, name: &str) -> TransportResult<u64>;

    /// Returns the `limit` rows closest to `vector`, best first.
    async fn search(
        &mut self,
        name: &str,
        vector_field: &str,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<&MilvusExpr>,
    ) -> TransportResult<Vec<MilvusHit>>;
}

/// [`MilvusTransport`] over the `/v2/vectordb` REST API.
#[derive(Debug, Clone)]
pub struct RestMilvusTransport {
    client: RestClient,
    database: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldParam {
    key: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldInfo {
    name: String,
    #[serde(rename = "type")]
    data_type: String,
    #[serde(default)]
    primary_key: bool,
    #[serde(default)]
    params: Vec<FieldParam>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexInfo {
    field_name: String,
    #[serde(default)]
    metric_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionInfo {
    #[serde(default)]
    fields: Vec<FieldInfo>,
    #[serde(default)]
    indexes: Vec<IndexInfo>,
}

fn param_usize(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

impl CollectionInfo {
    fn into_schema(self) -> MilvusSchema {
        let mut schema = MilvusSchema::default();

        for field in &self.fields {
            if field.primary_key {
                schema.primary_field = field.name.clone();
                schema.id_kind = if field.data_type.eq_ignore_ascii_case("Int64") {
                    IdKind::Integer
                } else {
                    IdKind::NativeString
                };
            }
            if field.data_type.eq_ignore_ascii_case("FloatVector") {
                schema.vector_field = field.name.clone();
                schema.dimension = field
                    .params
                    .iter()
                    .find(|param| param.key == "dim")
                    .and_then(|param| param_usize(&param.value));
            }
        }

        schema.metric = self
            .indexes
            .iter()
            .find(|index| index.field_name == schema.vector_field)
            .and_then(|index| index.metric_type.as_deref())
            .map(DistanceMetric::parse_lossy)
            .unwrap_or(DistanceMetric::Unknown);

        schema
    }
}

fn is_missing(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("not found") || message.contains("can't find") || message.contains("not exist")
}

impl RestMilvusTransport {
    /// Builds the client. No request is sent until the first call.
    pub fn new(config: &MilvusConfig) -> TransportResult<Self> {
        let client = RestClient::new(&config.url, config.token.as_deref(), config.timeout())?;
        Ok(Self {
            client,
            database: config.database.clone(),
        })
    }

    fn body(&self, mut body: Value) -> Value {
        if let (Some(database), Value::Object(map)) = (&self.database, &mut body) {
            map.insert("dbName".to_string(), Value::String(database.clone()));
        }
        body
    }

    async fn call<T: DeserializeOwned>(&self, path: &str, body: Value) -> TransportResult<T> {
        let envelope: Envelope = self
            .client
            .post(&format!("v2/vectordb/{}", path), &self.body(body))
            .await?;
        if envelope.code != 0 {
            if is_missing(&envelope.message) {
                return Err(TransportError::not_found(envelope.message));
            }
            return Err(TransportError::Api {
                code: envelope.code,
                message: envelope.message,
            });
        }
        let data = match envelope.data {
            Value::Null => json!({}),
            data => data,
        };
        Ok(serde_json::from_value(data)?)
    }
}

fn rows(data: Vec<Value>) -> Vec<Metadata> {
    data.into_iter()
        .filter_map(|row| match row {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl MilvusTransport for RestMilvusTransport {
    async fn health(&mut self) -> TransportResult<()> {
        let _: Value = self.call("collections/list", json!({})).await?;
        Ok(())
    }

    async fn list_collections(&mut self) -> TransportResult<Vec<String>> {
        self.call("collections/list", json!({})).await
    }

    async fn create_collection(
        &mut self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> TransportResult<()> {
        let body = json!({
            "collectionName": name,
            "schema": {
                "autoId": false,
                "enableDynamicField": true,
                "fields": [
                    {
                        "fieldName": PRIMARY_FIELD,
                        "dataType": "VarChar",
                        "isPrimary": true,
                        "elementTypeParams": { "max_length": MAX_VARCHAR }
                    },
                    {
                        "fieldName": DOCUMENT_FIELD,
                        "dataType": "VarChar",
                        "elementTypeParams": { "max_length": MAX_VARCHAR }
                    },
                    {
                        "fieldName": VECTOR_FIELD,
                        "dataType": "FloatVector",
                        "elementTypeParams": { "dim": dimension }
                    }
                ]
            },
            "indexParams": [{
                "fieldName": VECTOR_FIELD,
                "indexName": VECTOR_FIELD,
                "metricType": metric_type(metric),
                "params": { "index_type": "IVF_FLAT", "nlist": 128 }
            }]
        });
        let _: Value = self.call("collections/create", body).await?;
        Ok(())
    }

    async fn describe(&mut self, name: &str) -> TransportResult<MilvusSchema> {
        let info: CollectionInfo = self
            .call("collections/describe", json!({ "collectionName": name }))
            .await?;
        Ok(info.into_schema())
    }

    async fn drop_collection(&mut self, name: &str) -> TransportResult<()> {
        let _: Value = self
            .call("collections/drop", json!({ "collectionName": name }))
            .await?;
        Ok(())
    }

    async fn upsert(&mut self, name: &str, rows: Vec<Metadata>) -> TransportResult<()> {
        let _: Value = self
            .call(
                "entities/upsert",
                json!({ "collectionName": name, "data": rows }),
            )
            .await?;
        Ok(())
    }

    async fn query(
        &mut self,
        name: &str,
        filter: Option<&MilvusExpr>,
        offset: usize,
        limit: usize,
    ) -> TransportResult<Vec<Metadata>> {
        let data: Vec<Value> = self
            .call(
                "entities/query",
                json!({
                    "collectionName": name,
                    "filter": filter.map(|f| f.to_string()).unwrap_or_default(),
                    "outputFields": ["*"],
                    "offset": offset,
                    "limit": limit,
                }),
            )
            .await?;
        Ok(rows(data))
    }

    async fn delete(&mut self, name: &str, filter: &MilvusExpr) -> TransportResult<()> {
        let _: Value = self
            .call(
                "entities/delete",
                json!({ "collectionName": name, "filter": filter.to_string() }),
            )
            .await?;
        Ok(())
    }

    async fn count(&mut self, name: &str) -> TransportResult<u64> {
        let data: Vec<Map<String, Value>> = self
            .call(
                "entities/query",
                json!({
                    "collectionName": name,
                    "filter": "",
                    "outputFields": ["count(*)"],
                }),
            )
            .await?;
        data.first()
            .and_then(|row| row.get("count(*)"))
            .and_then(Value::as_u64)
            .ok_or_else(|| TransportError::malformed("count query returned no count"))
    }

    async fn search(
        &mut self,
        name: &str,
        vector_field: &str,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<&MilvusExpr>,
    ) -> TransportResult<Vec<MilvusHit>> {
        let mut body = json!({
            "collectionName": name,
            "data": [vector],
            "annsField": vector_field,
            "limit": limit,
            "outputFields": ["*"],
        });
        if let Some(filter) = filter {
            body["filter"] = Value::String(filter.to_string());
        }

        let data: Vec<Value> = self.call("entities/search", body).await?;
        rows(data)
            .into_iter()
            .map(|mut row| {
                let distance = row
                    .remove("distance")
                    .and_then(|d| d.as_f64())
                    .ok_or_else(|| TransportError::malformed("search hit without distance"))?;
                Ok(MilvusHit {
                    row,
                    distance: distance as f32,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_of_adapter_schema() {
        let info: CollectionInfo = serde_json::from_value(json!({
            "collectionName": "docs",
            "fields": [
                {"name": "id", "type": "VarChar", "primaryKey": true,
                 "params": [{"key": "max_length", "value": "65535"}]},
                {"name": "document", "type": "VarChar"},
                {"name": "embedding", "type": "FloatVector",
                 "params": [{"key": "dim", "value": "3"}]}
            ],
            "indexes": [{"fieldName": "embedding", "indexName": "embedding", "metricType": "L2"}],
            "enableDynamicField": true
        }))
        .unwrap();
        let schema = info.into_schema();

        assert_eq!(schema.id_kind, IdKind::NativeString);
        assert_eq!(schema.dimension, Some(3));
        assert_eq!(schema.metric, DistanceMetric::Euclidean);
    }

    #[test]
    fn test_describe_of_integer_keyed_collection() {
        let info: CollectionInfo = serde_json::from_value(json!({
            "fields": [
                {"name": "pk", "type": "Int64", "primaryKey": true},
                {"name": "vec", "type": "FloatVector", "params": [{"key": "dim", "value": 8}]}
            ],
            "indexes": []
        }))
        .unwrap();
        let schema = info.into_schema();

        assert_eq!(schema.primary_field, "pk");
        assert_eq!(schema.id_kind, IdKind::Integer);
        assert_eq!(schema.vector_field, "vec");
        assert_eq!(schema.dimension, Some(8));
        assert_eq!(schema.metric, DistanceMetric::Unknown);
    }

    #[test]
    fn test_missing_collection_messages() {
        assert!(is_missing("collection not found[collection=docs]"));
        assert!(is_missing("can't find collection: docs"));
        assert!(!is_missing("rate limit exceeded"));
    }
}
