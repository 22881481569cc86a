//! Chroma transport seam and its REST implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use veclens_core::{Item, Metadata};

use super::ChromaConfig;
use crate::error::{TransportError, TransportResult};
use crate::rest::RestClient;

/// Fields requested on every read.
const INCLUDE: [&str; 3] = ["documents", "metadatas", "embeddings"];

/// A collection as Chroma describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChromaCollection {
    /// Server-assigned collection id.
    pub id: String,
    /// Collection name.
    pub name: String,
    /// Collection metadata, including `hnsw:space`.
    #[serde(default)]
    pub metadata: Option<Metadata>,
    /// Vector width, reported once the first record is written.
    #[serde(default)]
    pub dimension: Option<usize>,
}

/// Selection of a get call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChromaGet {
    /// Restrict to these ids.
    pub ids: Option<Vec<String>>,
    /// Where-map.
    pub filter: Option<Value>,
    /// Maximum number of records.
    pub limit: Option<usize>,
    /// Records to skip.
    pub offset: Option<usize>,
}

/// One query hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChromaHit {
    /// The matched record.
    pub item: Item,
    /// Distance in the collection's space.
    pub distance: f32,
}

/// Operations the Chroma adapter needs from a server.
#[async_trait]
pub trait ChromaTransport: Send {
    /// Checks the server answers.
    async fn heartbeat(&mut self) -> TransportResult<()>;

    /// Lists collections.
    async fn list_collections(&mut self) -> TransportResult<Vec<ChromaCollection>>;

    /// Creates a collection, or returns the existing one of that name.
    async fn create_collection(
        &mut self,
        name: &str,
        metadata: Metadata,
    ) -> TransportResult<ChromaCollection>;

    /// Looks up a collection by name, `NotFound` if absent.
    async fn get_collection(&mut self, name: &str) -> TransportResult<ChromaCollection>;

    /// Drops a collection by name.
    async fn delete_collection(&mut self, name: &str) -> TransportResult<()>;

    /// Inserts or replaces records.
    async fn upsert(&mut self, collection_id: &str, items: Vec<Item>) -> TransportResult<()>;

    /// Reads records in insertion order.
    async fn get(&mut self, collection_id: &str, request: ChromaGet) -> TransportResult<Vec<Item>>;

    /// Runs a batched nearest-neighbor query.
    async fn query(
        &mut self,
        collection_id: &str,
        embeddings: Vec<Vec<f32>>,
        n_results: usize,
        filter: Option<&Value>,
    ) -> TransportResult<Vec<Vec<ChromaHit>>>;

    /// Deletes records by id.
    async fn delete(&mut self, collection_id: &str, ids: &[String]) -> TransportResult<()>;

    /// Deletes every record matching a where-map.
    async fn delete_where(&mut self, collection_id: &str, filter: &Value) -> TransportResult<()>;

    /// Counts the records of a collection.
    async fn count(&mut self, collection_id: &str) -> TransportResult<u64>;
}

/// [`ChromaTransport`] over the `/api/v1` REST API.
#[derive(Debug, Clone)]
pub struct RestChromaTransport {
    client: RestClient,
    scope: String,
}

impl RestChromaTransport {
    /// Builds the client. No request is sent until the first call.
    pub fn new(config: &ChromaConfig) -> TransportResult<Self> {
        let client = RestClient::new(&config.url, config.token.as_deref(), config.timeout())?;

        let mut params = Vec::new();
        if let Some(tenant) = &config.tenant {
            params.push(format!("tenant={}", tenant));
        }
        if let Some(database) = &config.database {
            params.push(format!("database={}", database));
        }
        let scope = if params.is_empty() {
            String::new()
        } else {
            format!("?{}", params.join("&"))
        };

        Ok(Self { client, scope })
    }

    fn collections_path(&self, suffix: &str) -> String {
        format!("api/v1/collections{}{}", suffix, self.scope)
    }
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    ids: Vec<String>,
    #[serde(default)]
    documents: Option<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Option<Vec<Option<Metadata>>>,
    #[serde(default)]
    embeddings: Option<Vec<Option<Vec<f32>>>>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    ids: Vec<Vec<String>>,
    #[serde(default)]
    distances: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Metadata>>>>,
    #[serde(default)]
    embeddings: Option<Vec<Vec<Option<Vec<f32>>>>>,
}

fn nth<T: Clone + Default>(column: &Option<Vec<T>>, index: usize) -> T {
    column
        .as_ref()
        .and_then(|values| values.get(index))
        .cloned()
        .unwrap_or_default()
}

fn assemble(
    ids: Vec<String>,
    documents: Option<Vec<Option<String>>>,
    metadatas: Option<Vec<Option<Metadata>>>,
    embeddings: Option<Vec<Option<Vec<f32>>>>,
) -> Vec<Item> {
    ids.into_iter()
        .enumerate()
        .map(|(i, id)| Item {
            id,
            document: nth(&documents, i),
            metadata: nth(&metadatas, i).unwrap_or_default(),
            embedding: nth(&embeddings, i),
        })
        .collect()
}

fn missing_collection(name: &str, err: TransportError) -> TransportError {
    match err {
        TransportError::Status { ref body, .. } if body.contains("does not exist") => {
            TransportError::not_found(format!("collection '{}'", name))
        }
        err if err.is_not_found() => TransportError::not_found(format!("collection '{}'", name)),
        err => err,
    }
}

#[async_trait]
impl ChromaTransport for RestChromaTransport {
    async fn heartbeat(&mut self) -> TransportResult<()> {
        let _: Value = self.client.get("api/v1/heartbeat").await?;
        Ok(())
    }

    async fn list_collections(&mut self) -> TransportResult<Vec<ChromaCollection>> {
        self.client.get(&self.collections_path("")).await
    }

    async fn create_collection(
        &mut self,
        name: &str,
        metadata: Metadata,
    ) -> TransportResult<ChromaCollection> {
        let body = json!({
            "name": name,
            "metadata": metadata,
            "get_or_create": true,
        });
        self.client.post(&self.collections_path(""), &body).await
    }

    async fn get_collection(&mut self, name: &str) -> TransportResult<ChromaCollection> {
        self.client
            .get(&self.collections_path(&format!("/{}", name)))
            .await
            .map_err(|e| missing_collection(name, e))
    }

    async fn delete_collection(&mut self, name: &str) -> TransportResult<()> {
        let _: Value = self
            .client
            .delete(&self.collections_path(&format!("/{}", name)))
            .await
            .map_err(|e| missing_collection(name, e))?;
        Ok(())
    }

    async fn upsert(&mut self, collection_id: &str, items: Vec<Item>) -> TransportResult<()> {
        let mut ids = Vec::with_capacity(items.len());
        let mut documents = Vec::with_capacity(items.len());
        let mut metadatas = Vec::with_capacity(items.len());
        let mut embeddings = Vec::with_capacity(items.len());
        for item in items {
            ids.push(item.id);
            documents.push(item.document);
            // Chroma rejects empty metadata maps.
            metadatas.push((!item.metadata.is_empty()).then_some(item.metadata));
            embeddings.push(item.embedding);
        }

        let body = json!({
            "ids": ids,
            "documents": documents,
            "metadatas": metadatas,
            "embeddings": embeddings,
        });
        let _: Value = self
            .client
            .post(&format!("api/v1/collections/{}/upsert", collection_id), &body)
            .await?;
        Ok(())
    }

    async fn get(&mut self, collection_id: &str, request: ChromaGet) -> TransportResult<Vec<Item>> {
        let mut body = json!({ "include": INCLUDE });
        if let Some(ids) = request.ids {
            body["ids"] = json!(ids);
        }
        if let Some(filter) = request.filter {
            body["where"] = filter;
        }
        if let Some(limit) = request.limit {
            body["limit"] = json!(limit);
        }
        if let Some(offset) = request.offset {
            body["offset"] = json!(offset);
        }

        let response: GetResponse = self
            .client
            .post(&format!("api/v1/collections/{}/get", collection_id), &body)
            .await?;
        Ok(assemble(
            response.ids,
            response.documents,
            response.metadatas,
            response.embeddings,
        ))
    }

    async fn query(
        &mut self,
        collection_id: &str,
        embeddings: Vec<Vec<f32>>,
        n_results: usize,
        filter: Option<&Value>,
    ) -> TransportResult<Vec<Vec<ChromaHit>>> {
        let mut body = json!({
            "query_embeddings": embeddings,
            "n_results": n_results,
            "include": ["documents", "metadatas", "embeddings", "distances"],
        });
        if let Some(filter) = filter {
            body["where"] = filter.clone();
        }

        let response: QueryResponse = self
            .client
            .post(&format!("api/v1/collections/{}/query", collection_id), &body)
            .await?;

        let mut results = Vec::with_capacity(response.ids.len());
        for (q, ids) in response.ids.into_iter().enumerate() {
            let distances = nth(&response.distances, q);
            if distances.len() != ids.len() {
                return Err(TransportError::malformed(
                    "query response has unaligned distances",
                ));
            }
            let items = assemble(
                ids,
                Some(nth(&response.documents, q)),
                Some(nth(&response.metadatas, q)),
                Some(nth(&response.embeddings, q)),
            );
            results.push(
                items
                    .into_iter()
                    .zip(distances)
                    .map(|(item, distance)| ChromaHit { item, distance })
                    .collect(),
            );
        }
        Ok(results)
    }

    async fn delete(&mut self, collection_id: &str, ids: &[String]) -> TransportResult<()> {
        let _: Value = self
            .client
            .post(
                &format!("api/v1/collections/{}/delete", collection_id),
                &json!({ "ids": ids }),
            )
            .await?;
        Ok(())
    }

    async fn delete_where(&mut self, collection_id: &str, filter: &Value) -> TransportResult<()> {
        let _: Value = self
            .client
            .post(
                &format!("api/v1/collections/{}/delete", collection_id),
                &json!({ "where": filter }),
            )
            .await?;
        Ok(())
    }

    async fn count(&mut self, collection_id: &str) -> TransportResult<u64> {
        self.client
            .get(&format!("api/v1/collections/{}/count", collection_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_is_appended_to_collection_paths() {
        let config = ChromaConfig::new("http://localhost:8000")
            .with_tenant("acme")
            .with_database("main");
        let transport = RestChromaTransport::new(&config).unwrap();
        assert_eq!(
            transport.collections_path("/docs"),
            "api/v1/collections/docs?tenant=acme&database=main"
        );
    }

    #[test]
    fn test_get_response_with_missing_columns() {
        let response: GetResponse = serde_json::from_value(json!({
            "ids": ["a", "b"],
            "documents": ["first", null],
            "metadatas": [{"status": "active"}, null],
        }))
        .unwrap();
        let items = assemble(
            response.ids,
            response.documents,
            response.metadatas,
            response.embeddings,
        );

        assert_eq!(items[0].document.as_deref(), Some("first"));
        assert_eq!(items[0].metadata["status"], "active");
        assert!(items[1].metadata.is_empty());
        assert_eq!(items[1].embedding, None);
    }
}
