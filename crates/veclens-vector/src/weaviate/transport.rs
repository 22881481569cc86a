//! Weaviate transport seam and its REST / GraphQL implementation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;
use veclens_core::{DistanceMetric, Metadata};

use super::WeaviateConfig;
use super::filter::{DOCUMENT_PROPERTY, WeaviateWhere};
use crate::error::{TransportError, TransportResult};
use crate::rest::RestClient;

/// Property types the adapter reads back. Cross references and nested
/// objects need sub-selections and are skipped.
const SCALAR_TYPES: &[&str] = &[
    "text", "string", "int", "number", "boolean", "date", "uuid", "text[]", "string[]", "int[]",
    "number[]", "boolean[]", "date[]", "uuid[]",
];

/// Schema facts of a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeaviateClass {
    /// Class name as stored by the server.
    pub name: String,
    /// Scalar properties, in schema order.
    pub properties: Vec<String>,
    /// Metric of the vector index.
    pub metric: DistanceMetric,
}

/// One stored object.
#[derive(Debug, Clone, PartialEq)]
pub struct WeaviateObject {
    /// Object UUID.
    pub id: Uuid,
    /// Properties, the document text included.
    pub properties: Metadata,
    /// Object vector.
    pub vector: Option<Vec<f32>>,
}

/// One `nearVector` hit.
#[derive(Debug, Clone, PartialEq)]
pub struct WeaviateHit {
    /// The object.
    pub object: WeaviateObject,
    /// Distance under the class metric, smaller is closer.
    pub distance: f32,
}

/// Returns the `vectorIndexConfig.distance` name of a metric.
pub fn distance_name(metric: DistanceMetric) -> &'static str {
    match metric {
        DistanceMetric::Euclidean => "l2-squared",
        DistanceMetric::Dot => "dot",
        DistanceMetric::Cosine | DistanceMetric::Unknown => "cosine",
    }
}

/// Parses a `vectorIndexConfig.distance` name.
pub fn metric_from_distance(name: &str) -> DistanceMetric {
    match name {
        "l2-squared" => DistanceMetric::Euclidean,
        other => DistanceMetric::parse_lossy(other),
    }
}

/// Returns the class name of a collection. Weaviate capitalizes class names.
pub fn class_name(collection: &str) -> String {
    let mut chars = collection.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Operations the Weaviate adapter needs from a server.
#[async_trait]
pub trait WeaviateTransport: Send {
    /// Checks the server is ready.
    async fn ready(&mut self) -> TransportResult<()>;

    /// Lists class names.
    async fn list_classes(&mut self) -> TransportResult<Vec<String>>;

    /// Creates a class with externally supplied vectors.
    async fn create_class(&mut self, class: &str, metric: DistanceMetric) -> TransportResult<()>;

    /// Describes a class, `NotFound` if absent.
    async fn class_info(&mut self, class: &str) -> TransportResult<WeaviateClass>;

    /// Deletes a class and its objects.
    async fn delete_class(&mut self, class: &str) -> TransportResult<()>;

    /// Inserts or replaces objects.
    async fn put_objects(
        &mut self,
        class: &str,
        objects: Vec<WeaviateObject>,
    ) -> TransportResult<()>;

    /// Reads one object, `None` if absent.
    async fn get_object(
        &mut self,
        class: &str,
        id: Uuid,
    ) -> TransportResult<Option<WeaviateObject>>;

    /// Deletes one object. A missing object is not an error.
    async fn delete_object(&mut self, class: &str, id: Uuid) -> TransportResult<()>;

    /// Deletes every object of a class matching `filter`.
    async fn delete_where(&mut self, class: &str, filter: &WeaviateWhere) -> TransportResult<()>;

    /// Lists objects matching `filter`.
    async fn list_objects(
        &mut self,
        class: &WeaviateClass,
        filter: Option<&WeaviateWhere>,
        offset: usize,
        limit: usize,
    ) -> TransportResult<Vec<WeaviateObject>>;

    /// Counts the objects of a class.
    async fn count(&mut self, class: &str) -> TransportResult<u64>;

    /// Returns the `limit` objects closest to `vector`, best first.
    async fn near_vector(
        &mut self,
        class: &WeaviateClass,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<&WeaviateWhere>,
    ) -> TransportResult<Vec<WeaviateHit>>;
}

/// [`WeaviateTransport`] over the REST and GraphQL endpoints.
#[derive(Debug, Clone)]
pub struct RestWeaviateTransport {
    client: RestClient,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VectorIndexConfig {
    #[serde(default)]
    distance: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PropertyDef {
    name: String,
    #[serde(default)]
    data_type: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassDef {
    class: String,
    #[serde(default)]
    properties: Vec<PropertyDef>,
    #[serde(default)]
    vector_index_config: VectorIndexConfig,
}

impl ClassDef {
    fn into_class(self) -> WeaviateClass {
        WeaviateClass {
            name: self.class,
            properties: self
                .properties
                .into_iter()
                .filter(|p| {
                    p.data_type
                        .first()
                        .is_some_and(|t| SCALAR_TYPES.contains(&t.as_str()))
                })
                .map(|p| p.name)
                .collect(),
            metric: self
                .vector_index_config
                .distance
                .as_deref()
                .map(metric_from_distance)
                .unwrap_or(DistanceMetric::Unknown),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Schema {
    #[serde(default)]
    classes: Vec<ClassDef>,
}

#[derive(Debug, Deserialize)]
struct RestObject {
    id: Uuid,
    #[serde(default)]
    properties: Metadata,
    #[serde(default)]
    vector: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

/// Builds the selection set of a `Get` query.
fn selection(class: &WeaviateClass, distance: bool) -> String {
    let additional = if distance {
        "_additional { id vector distance }"
    } else {
        "_additional { id vector }"
    };
    let mut fields = class.properties.clone();
    fields.push(additional.to_string());
    fields.join(" ")
}

/// Renders the argument list of a `Get` query.
fn arguments(pairs: Vec<(&str, String)>) -> String {
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}: {}", key, value))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Splits one `Get` row into the object and its distance.
fn parse_row(row: Value) -> TransportResult<(WeaviateObject, Option<f32>)> {
    let Value::Object(mut properties) = row else {
        return Err(TransportError::malformed("Get row is not an object"));
    };
    let additional = properties
        .remove("_additional")
        .ok_or_else(|| TransportError::malformed("Get row without _additional"))?;

    let id = additional
        .get("id")
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or_else(|| TransportError::malformed("Get row without an object id"))?;
    let vector = additional
        .get("vector")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_f64)
                .map(|v| v as f32)
                .collect()
        });
    let distance = additional
        .get("distance")
        .and_then(Value::as_f64)
        .map(|d| d as f32);

    // Properties the object does not carry come back as null.
    properties.retain(|_, value| !value.is_null());

    Ok((
        WeaviateObject {
            id,
            properties,
            vector,
        },
        distance,
    ))
}

impl RestWeaviateTransport {
    /// Builds the client. No request is sent until the first call.
    pub fn new(config: &WeaviateConfig) -> TransportResult<Self> {
        let client = RestClient::new(&config.url, config.api_key.as_deref(), config.timeout())?;
        Ok(Self { client })
    }

    async fn graphql(&self, query: String) -> TransportResult<Value> {
        let response: GraphQlResponse =
            self.client.post("v1/graphql", &json!({ "query": query })).await?;
        if let Some(error) = response.errors.into_iter().next() {
            return Err(TransportError::Api {
                code: 0,
                message: error.message,
            });
        }
        Ok(response.data)
    }

    async fn get(
        &self,
        class: &str,
        arguments: String,
        selection: String,
    ) -> TransportResult<Vec<Value>> {
        let query = format!("{{ Get {{ {}({}) {{ {} }} }} }}", class, arguments, selection);
        let mut data = self.graphql(query).await?;
        let rows = data
            .get_mut("Get")
            .and_then(|get| get.get_mut(class))
            .map(Value::take);
        match rows {
            Some(Value::Array(rows)) => Ok(rows),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(_) => Err(TransportError::malformed("Get result is not a list")),
        }
    }
}

#[async_trait]
impl WeaviateTransport for RestWeaviateTransport {
    async fn ready(&mut self) -> TransportResult<()> {
        let _: Value = self.client.get("v1/.well-known/ready").await?;
        Ok(())
    }

    async fn list_classes(&mut self) -> TransportResult<Vec<String>> {
        let schema: Schema = self.client.get("v1/schema").await?;
        Ok(schema.classes.into_iter().map(|c| c.class).collect())
    }

    async fn create_class(&mut self, class: &str, metric: DistanceMetric) -> TransportResult<()> {
        let body = json!({
            "class": class,
            "vectorizer": "none",
            "vectorIndexConfig": { "distance": distance_name(metric) },
            "properties": [{ "name": DOCUMENT_PROPERTY, "dataType": ["text"] }],
        });
        let _: Value = self.client.post("v1/schema", &body).await?;
        Ok(())
    }

    async fn class_info(&mut self, class: &str) -> TransportResult<WeaviateClass> {
        let def: ClassDef = self
            .client
            .get(&format!("v1/schema/{}", class))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    TransportError::not_found(format!("class '{}'", class))
                } else {
                    e
                }
            })?;
        Ok(def.into_class())
    }

    async fn delete_class(&mut self, class: &str) -> TransportResult<()> {
        // Deleting an absent class succeeds on the server.
        self.class_info(class).await?;
        let _: Value = self.client.delete(&format!("v1/schema/{}", class)).await?;
        Ok(())
    }

    async fn put_objects(
        &mut self,
        class: &str,
        objects: Vec<WeaviateObject>,
    ) -> TransportResult<()> {
        let objects: Vec<Value> = objects
            .into_iter()
            .map(|object| {
                json!({
                    "class": class,
                    "id": object.id,
                    "properties": object.properties,
                    "vector": object.vector,
                })
            })
            .collect();
        let results: Vec<Value> = self
            .client
            .post("v1/batch/objects", &json!({ "objects": objects }))
            .await?;

        let failure = results.iter().find_map(|result| {
            result["result"]["errors"]["error"]
                .as_array()
                .and_then(|errors| errors.first())
                .and_then(|error| error["message"].as_str())
        });
        match failure {
            Some(message) => Err(TransportError::Api {
                code: 0,
                message: message.to_string(),
            }),
            None => Ok(()),
        }
    }

    async fn get_object(
        &mut self,
        class: &str,
        id: Uuid,
    ) -> TransportResult<Option<WeaviateObject>> {
        let path = format!("v1/objects/{}/{}?include=vector", class, id);
        match self.client.get::<RestObject>(&path).await {
            Ok(object) => Ok(Some(WeaviateObject {
                id: object.id,
                properties: object.properties,
                vector: object.vector,
            })),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_object(&mut self, class: &str, id: Uuid) -> TransportResult<()> {
        let path = format!("v1/objects/{}/{}", class, id);
        match self.client.delete::<Value>(&path).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_where(&mut self, class: &str, filter: &WeaviateWhere) -> TransportResult<()> {
        let body = json!({
            "match": { "class": class, "where": filter.to_json() },
            "output": "minimal",
        });
        let response: Value = self.client.delete_with("v1/batch/objects", &body).await?;
        let failed = response
            .pointer("/results/failed")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        if failed > 0 {
            return Err(TransportError::malformed(format!(
                "batch delete on '{}' failed for {} objects",
                class, failed
            )));
        }
        Ok(())
    }

    async fn list_objects(
        &mut self,
        class: &WeaviateClass,
        filter: Option<&WeaviateWhere>,
        offset: usize,
        limit: usize,
    ) -> TransportResult<Vec<WeaviateObject>> {
        let mut args = vec![("limit", limit.to_string()), ("offset", offset.to_string())];
        if let Some(filter) = filter {
            args.push(("where", filter.to_graphql()));
        }
        self.get(&class.name, arguments(args), selection(class, false))
            .await?
            .into_iter()
            .map(|row| parse_row(row).map(|(object, _)| object))
            .collect()
    }

    async fn count(&mut self, class: &str) -> TransportResult<u64> {
        let query = format!("{{ Aggregate {{ {} {{ meta {{ count }} }} }} }}", class);
        let data = self.graphql(query).await?;
        data["Aggregate"][class][0]["meta"]["count"]
            .as_u64()
            .ok_or_else(|| TransportError::malformed("Aggregate result without a count"))
    }

    async fn near_vector(
        &mut self,
        class: &WeaviateClass,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<&WeaviateWhere>,
    ) -> TransportResult<Vec<WeaviateHit>> {
        let mut args = vec![
            ("nearVector", format!("{{vector: {}}}", json!(vector))),
            ("limit", limit.to_string()),
        ];
        if let Some(filter) = filter {
            args.push(("where", filter.to_graphql()));
        }
        self.get(&class.name, arguments(args), selection(class, true))
            .await?
            .into_iter()
            .map(|row| {
                let (object, distance) = parse_row(row)?;
                let distance = distance
                    .ok_or_else(|| TransportError::malformed("nearVector hit without distance"))?;
                Ok(WeaviateHit { object, distance })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_name_is_capitalized() {
        assert_eq!(class_name("docs"), "Docs");
        assert_eq!(class_name("Docs"), "Docs");
        assert_eq!(class_name(""), "");
    }

    #[test]
    fn test_distance_names() {
        for metric in [DistanceMetric::Cosine, DistanceMetric::Euclidean, DistanceMetric::Dot] {
            assert_eq!(metric_from_distance(distance_name(metric)), metric);
        }
        assert_eq!(metric_from_distance("hamming"), DistanceMetric::Unknown);
    }

    #[test]
    fn test_class_def_skips_references() {
        let def: ClassDef = serde_json::from_value(json!({
            "class": "Docs",
            "properties": [
                {"name": "document", "dataType": ["text"]},
                {"name": "score", "dataType": ["number"]},
                {"name": "author", "dataType": ["Person"]}
            ],
            "vectorIndexConfig": {"distance": "dot"}
        }))
        .unwrap();
        let class = def.into_class();

        assert_eq!(class.properties, ["document", "score"]);
        assert_eq!(class.metric, DistanceMetric::Dot);
    }

    #[test]
    fn test_parse_row_drops_null_properties() {
        let row = json!({
            "document": "hello",
            "status": null,
            "_additional": {
                "id": "6ba7b810-9dad-11d1-80b4-00c04fd430c8",
                "vector": [0.5, 1.0],
                "distance": 0.25
            }
        });
        let (object, distance) = parse_row(row).unwrap();

        assert_eq!(object.properties.len(), 1);
        assert_eq!(object.vector, Some(vec![0.5, 1.0]));
        assert_eq!(distance, Some(0.25));
    }

    #[test]
    fn test_selection_reads_schema_properties() {
        let class = WeaviateClass {
            name: "Docs".into(),
            properties: vec!["document".into(), "status".into()],
            metric: DistanceMetric::Cosine,
        };
        assert_eq!(
            selection(&class, true),
            "document status _additional { id vector distance }"
        );
    }
}
