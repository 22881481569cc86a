//! [`ConnectionAdapter`] over a [`ChromaTransport`].

use async_trait::async_trait;
use serde_json::Value;
use veclens_core::batch::{self, METADATA_SAMPLE_SIZE};
use veclens_core::{
    BackendKind, CachedDimensionResolver, CanonicalFilter, Capabilities, Collection,
    ConnectionAdapter, ConnectionContext, Dimension, DimensionResolver, DimensionSource,
    DistanceMetric, Error, FilterCompiler, Hit, Item, ItemUpdate, Metadata, Page, PageRequest,
    Query, QueryResult, Ranking, Result,
};

use super::{
    ChromaCollection, ChromaConfig, ChromaFilterCompiler, ChromaGet, ChromaTransport,
    RestChromaTransport,
};
use crate::TRACING_TARGET_CHROMA;
use crate::common::{self, Listings};

/// Collection metadata key holding the HNSW distance space.
pub const SPACE_KEY: &str = "hnsw:space";

/// Chroma adapter. Ids are stored as is; pages use offset and limit.
pub struct ChromaAdapter {
    transport: Box<dyn ChromaTransport>,
    context: ConnectionContext,
    dimensions: Box<dyn DimensionResolver>,
    listings: Listings,
    connected: bool,
}

impl ChromaAdapter {
    /// Creates an adapter for a Chroma server.
    pub fn new(config: &ChromaConfig, context: ConnectionContext) -> Result<Self> {
        let transport = RestChromaTransport::new(config)?;
        Ok(Self::with_transport(Box::new(transport), context))
    }

    /// Creates an adapter over any transport.
    pub fn with_transport(transport: Box<dyn ChromaTransport>, context: ConnectionContext) -> Self {
        Self {
            transport,
            context,
            dimensions: Box::new(CachedDimensionResolver::new()),
            listings: Listings::default(),
            connected: false,
        }
    }

    /// Replaces the dimension resolution strategy.
    pub fn with_dimension_resolver(mut self, resolver: Box<dyn DimensionResolver>) -> Self {
        self.dimensions = resolver;
        self
    }

    async fn collection(&mut self, name: &str) -> Result<ChromaCollection> {
        Ok(self.transport.get_collection(name).await?)
    }

    async fn delete_ids(&mut self, collection: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let target = self.collection(collection).await?;
        self.transport.delete(&target.id, ids).await?;
        self.listings.invalidate(collection);

        tracing::debug!(
            target: TRACING_TARGET_CHROMA,
            collection = %collection,
            count = ids.len(),
            "Deleted records"
        );
        Ok(())
    }

    async fn dimension(&mut self, collection: &ChromaCollection) -> Result<Dimension> {
        let mut source = Probe {
            transport: self.transport.as_mut(),
            id: &collection.id,
            declared: collection.dimension,
        };
        self.dimensions.resolve(&collection.name, &mut source).await
    }
}

impl std::fmt::Debug for ChromaAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromaAdapter")
            .field("connected", &self.connected)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

struct Probe<'a> {
    transport: &'a mut dyn ChromaTransport,
    id: &'a str,
    declared: Option<usize>,
}

#[async_trait]
impl DimensionSource for Probe<'_> {
    async fn declared_dimension(&mut self, _collection: &str) -> Result<Option<usize>> {
        Ok(self.declared)
    }

    async fn probe_dimension(&mut self, _collection: &str) -> Result<Option<usize>> {
        let request = ChromaGet {
            limit: Some(1),
            ..Default::default()
        };
        let items = self.transport.get(self.id, request).await?;
        Ok(items
            .into_iter()
            .find_map(|item| item.embedding.map(|v| v.len())))
    }
}

/// Returns the `hnsw:space` name of a metric.
pub fn space_name(metric: DistanceMetric) -> &'static str {
    match metric {
        DistanceMetric::Euclidean => "l2",
        DistanceMetric::Dot => "ip",
        DistanceMetric::Cosine | DistanceMetric::Unknown => "cosine",
    }
}

/// Reads the metric of a collection. Chroma defaults to `l2`.
fn metric_of(metadata: Option<&Metadata>) -> DistanceMetric {
    match metadata.and_then(|m| m.get(SPACE_KEY)) {
        Some(Value::String(space)) => DistanceMetric::parse_lossy(space),
        Some(_) => DistanceMetric::Unknown,
        None => DistanceMetric::Euclidean,
    }
}

#[async_trait]
impl ConnectionAdapter for ChromaAdapter {
    fn backend(&self) -> BackendKind {
        BackendKind::Chroma
    }

    async fn connect(&mut self) -> Result<()> {
        self.transport.heartbeat().await?;
        self.connected = true;
        tracing::info!(target: TRACING_TARGET_CHROMA, "Connected to Chroma");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.listings.clear();
        tracing::info!(target: TRACING_TARGET_CHROMA, "Disconnected from Chroma");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn list_collections(&mut self) -> Result<Vec<String>> {
        common::ensure_connected(self.connected)?;
        let collections = self.transport.list_collections().await?;
        Ok(collections.into_iter().map(|c| c.name).collect())
    }

    async fn create_collection(
        &mut self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<()> {
        common::ensure_connected(self.connected)?;
        common::check_create(dimension, metric)?;

        let mut metadata = Metadata::new();
        metadata.insert(SPACE_KEY.to_string(), space_name(metric).into());
        if let Some(model) = self.context.model_hint(name, None) {
            metadata.insert(veclens_core::EMBEDDING_MODEL_KEY.to_string(), model.into());
        }

        self.transport.create_collection(name, metadata).await?;
        self.dimensions.record(name, dimension);

        tracing::info!(
            target: TRACING_TARGET_CHROMA,
            collection = %name,
            dimension,
            metric = %metric,
            "Created collection"
        );
        Ok(())
    }

    async fn get_collection_info(&mut self, name: &str) -> Result<Collection> {
        common::ensure_connected(self.connected)?;

        let collection = self.collection(name).await?;
        let item_count = self.transport.count(&collection.id).await?;
        let sample = self
            .transport
            .get(
                &collection.id,
                ChromaGet {
                    limit: Some(METADATA_SAMPLE_SIZE),
                    ..Default::default()
                },
            )
            .await?;
        let dimension = self.dimension(&collection).await?;

        Ok(Collection {
            name: collection.name.clone(),
            vector_dimension: dimension.known(),
            distance_metric: metric_of(collection.metadata.as_ref()),
            item_count,
            metadata_fields: batch::observed_fields(&sample),
        })
    }

    async fn add_items(&mut self, collection: &str, mut items: Vec<Item>) -> Result<()> {
        common::ensure_connected(self.connected)?;
        if items.is_empty() {
            return Ok(());
        }

        batch::check_ids(&items)?;
        let target = self.collection(collection).await?;
        batch::embed_missing(&self.context, collection, target.metadata.as_ref(), &mut items)
            .await?;
        if let Some(item) = items.iter().find(|item| item.embedding.is_none()) {
            return Err(Error::invalid_input(format!(
                "Chroma needs an embedding for item '{}' and no embedding provider is configured",
                item.id
            )));
        }
        let dimension = self.dimension(&target).await?;
        if let Some(width) = batch::check_dimensions(dimension, &items)? {
            self.dimensions.record(collection, width);
        }

        let count = items.len();
        self.transport.upsert(&target.id, items).await?;
        self.listings.invalidate(collection);

        tracing::debug!(
            target: TRACING_TARGET_CHROMA,
            collection = %collection,
            count,
            "Upserted records"
        );
        Ok(())
    }

    async fn get_items(&mut self, collection: &str, ids: &[String]) -> Result<Vec<Item>> {
        common::ensure_connected(self.connected)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let target = self.collection(collection).await?;
        let request = ChromaGet {
            ids: Some(ids.to_vec()),
            ..Default::default()
        };
        Ok(self.transport.get(&target.id, request).await?)
    }

    async fn get_all_items(
        &mut self,
        collection: &str,
        page: PageRequest,
        filter: Option<&CanonicalFilter>,
    ) -> Result<Page<Item>> {
        common::ensure_connected(self.connected)?;
        page.validate()?;
        let compiled = ChromaFilterCompiler.compile_opt(filter)?;
        let target = self.collection(collection).await?;

        if !compiled.is_complete() {
            let key = common::listing_key(collection, filter);
            if self.listings.needs_fetch(&key, &page) {
                tracing::warn!(
                    target: TRACING_TARGET_CHROMA,
                    collection = %collection,
                    residual = compiled.residual.clauses().len(),
                    "Materializing listing for residual filter"
                );
                let request = ChromaGet {
                    filter: compiled.native.clone(),
                    ..Default::default()
                };
                let all = self.transport.get(&target.id, request).await?;
                self.listings.store(key.clone(), compiled.post_filter(all));
            }
            return self.listings.slice(&key, &page);
        }

        let request = ChromaGet {
            filter: compiled.native,
            limit: Some(page.size),
            offset: Some(page.offset()?),
            ..Default::default()
        };
        let items = self.transport.get(&target.id, request).await?;
        Page::from_offset(items, &page)
    }

    async fn update_items(&mut self, collection: &str, updates: Vec<ItemUpdate>) -> Result<()> {
        common::ensure_connected(self.connected)?;
        if updates.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = updates.iter().map(|u| u.id.clone()).collect();
        let stored = self.get_items(collection, &ids).await?;
        let merged = batch::merge_updates(&self.context, stored, updates)?;
        self.add_items(collection, merged).await
    }

    async fn delete_items(
        &mut self,
        collection: &str,
        ids: &[String],
        filter: Option<&CanonicalFilter>,
    ) -> Result<()> {
        common::ensure_connected(self.connected)?;
        let Some(filter) = common::delete_filter(filter) else {
            return self.delete_ids(collection, ids).await;
        };

        let compiled = ChromaFilterCompiler.compile(filter)?;
        match compiled.native {
            Some(native) if ids.is_empty() && compiled.residual.is_empty() => {
                let target = self.collection(collection).await?;
                self.transport.delete_where(&target.id, &native).await?;
                self.listings.invalidate(collection);
                tracing::debug!(
                    target: TRACING_TARGET_CHROMA,
                    collection = %collection,
                    "Deleted records matching filter"
                );
                Ok(())
            }
            _ => {
                let matched = common::filtered_ids(self, collection, ids, filter).await?;
                self.delete_ids(collection, &matched).await
            }
        }
    }

    async fn delete_collection(&mut self, name: &str) -> Result<()> {
        common::ensure_connected(self.connected)?;
        self.transport.delete_collection(name).await?;
        self.dimensions.forget(name);
        self.listings.invalidate(name);
        tracing::info!(target: TRACING_TARGET_CHROMA, collection = %name, "Deleted collection");
        Ok(())
    }

    async fn count_collection(&mut self, name: &str) -> Result<u64> {
        common::ensure_connected(self.connected)?;
        let target = self.collection(name).await?;
        Ok(self.transport.count(&target.id).await?)
    }

    async fn query_collection(
        &mut self,
        collection: &str,
        query: Query,
    ) -> Result<Vec<QueryResult>> {
        common::ensure_connected(self.connected)?;
        common::check_k(query.k)?;

        let compiled = ChromaFilterCompiler.compile_opt(query.filter.as_ref())?;
        let target = self.collection(collection).await?;
        let dimension = self.dimension(&target).await?;
        let vectors = batch::query_vectors(
            &self.context,
            collection,
            target.metadata.as_ref(),
            query.input,
            dimension,
        )
        .await?;

        let total = if compiled.is_complete() {
            0
        } else {
            self.transport.count(&target.id).await?
        };
        let limit = common::search_limit(&compiled.residual, query.k, total);

        tracing::debug!(
            target: TRACING_TARGET_CHROMA,
            collection = %collection,
            queries = vectors.len(),
            k = query.k,
            "Querying records"
        );

        let batches = self
            .transport
            .query(&target.id, vectors, limit, compiled.native.as_ref())
            .await?;
        Ok(batches
            .into_iter()
            .map(|hits| {
                let hits = hits
                    .into_iter()
                    .map(|hit| Hit::new(hit.item, hit.distance))
                    .collect();
                common::finish_hits(Ranking::Distance, hits, &compiled.residual, query.k)
            })
            .collect())
    }

    fn capabilities(&self) -> Capabilities {
        ChromaFilterCompiler.capabilities()
    }

    fn context(&self) -> &ConnectionContext {
        &self.context
    }

    async fn collection_metadata(&mut self, collection: &str) -> Result<Option<Metadata>> {
        common::ensure_connected(self.connected)?;
        Ok(self.collection(collection).await?.metadata)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_space_round_trip() {
        for metric in [DistanceMetric::Cosine, DistanceMetric::Euclidean, DistanceMetric::Dot] {
            let mut metadata = Metadata::new();
            metadata.insert(SPACE_KEY.into(), space_name(metric).into());
            assert_eq!(metric_of(Some(&metadata)), metric);
        }
    }

    #[test]
    fn test_missing_space_is_chroma_default() {
        assert_eq!(metric_of(None), DistanceMetric::Euclidean);
        let metadata = json!({"hnsw:space": 3}).as_object().cloned().unwrap();
        assert_eq!(metric_of(Some(&metadata)), DistanceMetric::Unknown);
    }
}
