//! The contract every backend adapter implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::capability::Capabilities;
use crate::embedding::ConnectionContext;
use crate::error::Result;
use crate::filter::CanonicalFilter;
use crate::model::{Collection, DistanceMetric, Item, ItemUpdate, Metadata, QueryResult};
use crate::page::{Page, PageRequest};

/// Backend family of an adapter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackendKind {
    /// Document store with where-map filters.
    Chroma,
    /// Network store with structured query objects.
    Qdrant,
    /// PostgreSQL with the pgvector extension.
    #[serde(rename = "pgvector")]
    #[strum(serialize = "pgvector")]
    PgVector,
    /// Store with boolean expression strings.
    Milvus,
    /// Property-graph store with filter builders.
    Weaviate,
    /// Columnar store without predicate push-down.
    Columnar,
}

/// What to search with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryInput {
    /// Query vectors, one result per vector.
    Vectors(Vec<Vec<f32>>),
    /// Query texts, embedded through the connection's embedding provider.
    Texts(Vec<String>),
}

/// A batched nearest-neighbor query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Query vectors or texts.
    pub input: QueryInput,
    /// Number of neighbors per query.
    pub k: usize,
    /// Optional metadata filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<CanonicalFilter>,
}

impl Query {
    /// Queries with one vector.
    pub fn vector(vector: Vec<f32>, k: usize) -> Self {
        Self {
            input: QueryInput::Vectors(vec![vector]),
            k,
            filter: None,
        }
    }

    /// Queries with texts.
    pub fn texts(texts: Vec<String>, k: usize) -> Self {
        Self {
            input: QueryInput::Texts(texts),
            k,
            filter: None,
        }
    }

    /// Restricts the query with a filter.
    pub fn with_filter(mut self, filter: CanonicalFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Canonical connection contract.
///
/// Every call runs to completion before returning; adapters spawn no
/// background work. Methods take `&mut self`, so one adapter never serves two
/// overlapping calls. Backend-native errors are converted into
/// [`crate::Error`] before they leave the adapter.
#[async_trait]
pub trait ConnectionAdapter: Send {
    /// Backend family.
    fn backend(&self) -> BackendKind;

    /// Opens the connection and checks it is reachable.
    async fn connect(&mut self) -> Result<()>;

    /// Closes the connection. Idempotent.
    async fn disconnect(&mut self) -> Result<()>;

    /// Returns true between a successful `connect` and `disconnect`.
    fn is_connected(&self) -> bool;

    /// Lists collection names.
    async fn list_collections(&mut self) -> Result<Vec<String>>;

    /// Creates a collection.
    async fn create_collection(
        &mut self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<()>;

    /// Describes a collection; `NotFound` if absent.
    async fn get_collection_info(&mut self, name: &str) -> Result<Collection>;

    /// Inserts or overwrites items. All-or-nothing at this boundary.
    async fn add_items(&mut self, collection: &str, items: Vec<Item>) -> Result<()>;

    /// Fetches items by id. Absent ids are skipped.
    async fn get_items(&mut self, collection: &str, ids: &[String]) -> Result<Vec<Item>>;

    /// Pages through a collection, optionally filtered.
    async fn get_all_items(
        &mut self,
        collection: &str,
        page: PageRequest,
        filter: Option<&CanonicalFilter>,
    ) -> Result<Page<Item>>;

    /// Applies partial updates; `NotFound` if any id is absent.
    async fn update_items(&mut self, collection: &str, updates: Vec<ItemUpdate>) -> Result<()>;

    /// Deletes items by id, by filter, or both.
    ///
    /// With a filter, only the listed ids that match are deleted; with a
    /// filter and no ids, every match is deleted. No ids and no filter (or
    /// an empty one) deletes nothing. Filters the backend evaluates in full
    /// run as one native delete, others resolve ids through a filtered
    /// listing first.
    async fn delete_items(
        &mut self,
        collection: &str,
        ids: &[String],
        filter: Option<&CanonicalFilter>,
    ) -> Result<()>;

    /// Deletes a collection.
    async fn delete_collection(&mut self, name: &str) -> Result<()>;

    /// Counts the items of a collection.
    async fn count_collection(&mut self, name: &str) -> Result<u64>;

    /// Runs a nearest-neighbor query; one result per query vector or text.
    async fn query_collection(&mut self, collection: &str, query: Query)
    -> Result<Vec<QueryResult>>;

    /// Operators this adapter evaluates server-side.
    fn capabilities(&self) -> Capabilities;

    /// Context the adapter was built with.
    fn context(&self) -> &ConnectionContext;

    /// Collection-level metadata, for backends that keep it.
    async fn collection_metadata(&mut self, _collection: &str) -> Result<Option<Metadata>> {
        Ok(None)
    }

    /// Embedding model recorded for a collection.
    ///
    /// Looks at the context hint, then the collection metadata, then the
    /// `_embedding_model` key of the first stored item. The item is only
    /// read when the first two miss.
    async fn embedding_model(&mut self, collection: &str) -> Result<Option<String>> {
        let metadata = self.collection_metadata(collection).await?;
        if let Some(model) = self.context().model_hint(collection, metadata.as_ref()) {
            return Ok(Some(model.to_string()));
        }

        let sample = self
            .get_all_items(collection, PageRequest::first(1), None)
            .await?;
        let sampled = sample.items.first().map(|item| &item.metadata);
        Ok(self
            .context()
            .model_hint_with_sample(collection, None, sampled)
            .map(str::to_string))
    }
}
