//! [`ConnectionAdapter`] over a [`QdrantTransport`].

use async_trait::async_trait;
use qdrant_client::qdrant::{Distance, Filter};
use serde_json::Value;
use veclens_core::batch::{self, METADATA_SAMPLE_SIZE};
use veclens_core::filter::DOCUMENT_FIELD;
use veclens_core::{
    BackendId, BackendKind, CachedDimensionResolver, CanonicalFilter, Capabilities, Collection,
    ConnectionAdapter, ConnectionContext, Dimension, DimensionResolver, DimensionSource,
    DistanceMetric, Error, FilterCompiler, Hit, IdKind, Item, ItemUpdate, ORIGINAL_ID_KEY, Page,
    PageRequest, Query, QueryResult, Ranking, Result,
};

use super::{GrpcQdrantTransport, QdrantConfig, QdrantFilterCompiler, QdrantPoint, QdrantTransport};
use crate::TRACING_TARGET_QDRANT;
use crate::common::{self, Listings};

/// Page size used when the adapter walks a whole collection.
const SCROLL_BATCH: usize = 256;

/// Qdrant adapter. Ids are UUIDs; pages follow Qdrant's scroll cursor.
pub struct QdrantAdapter {
    transport: Box<dyn QdrantTransport>,
    context: ConnectionContext,
    dimensions: Box<dyn DimensionResolver>,
    listings: Listings,
    connected: bool,
}

impl QdrantAdapter {
    /// Creates an adapter for a Qdrant server.
    pub fn new(config: &QdrantConfig, context: ConnectionContext) -> Result<Self> {
        let transport = GrpcQdrantTransport::new(config)?;
        Ok(Self::with_transport(Box::new(transport), context))
    }

    /// Creates an adapter over any transport.
    pub fn with_transport(transport: Box<dyn QdrantTransport>, context: ConnectionContext) -> Self {
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

    async fn dimension(&mut self, collection: &str) -> Result<Dimension> {
        let mut source = Probe {
            transport: self.transport.as_mut(),
        };
        self.dimensions.resolve(collection, &mut source).await
    }

    async fn delete_ids(&mut self, collection: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let backend_ids = ids
            .iter()
            .map(|id| IdKind::Uuid.to_backend_id(id))
            .collect::<Result<Vec<_>>>()?;
        self.transport.delete_points(collection, &backend_ids).await?;
        self.listings.invalidate(collection);

        tracing::debug!(
            target: TRACING_TARGET_QDRANT,
            collection = %collection,
            count = ids.len(),
            "Deleted points"
        );
        Ok(())
    }

    async fn scroll_all(&mut self, collection: &str, filter: Option<&Filter>) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut offset = None;
        loop {
            let page = self
                .transport
                .scroll(collection, filter, offset, SCROLL_BATCH)
                .await?;
            items.extend(page.points.into_iter().map(point_to_item));
            match page.next {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        Ok(items)
    }
}

impl std::fmt::Debug for QdrantAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantAdapter")
            .field("connected", &self.connected)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

struct Probe<'a> {
    transport: &'a mut dyn QdrantTransport,
}

#[async_trait]
impl DimensionSource for Probe<'_> {
    async fn declared_dimension(&mut self, collection: &str) -> Result<Option<usize>> {
        Ok(self.transport.collection_info(collection).await?.dimension)
    }

    async fn probe_dimension(&mut self, collection: &str) -> Result<Option<usize>> {
        let page = self.transport.scroll(collection, None, None, 1).await?;
        Ok(page
            .points
            .into_iter()
            .find_map(|point| point.vector.map(|v| v.len())))
    }
}

/// Maps a canonical metric to a Qdrant distance.
pub fn to_distance(metric: DistanceMetric) -> Distance {
    match metric {
        DistanceMetric::Euclidean => Distance::Euclid,
        DistanceMetric::Dot => Distance::Dot,
        DistanceMetric::Cosine | DistanceMetric::Unknown => Distance::Cosine,
    }
}

/// Maps a Qdrant distance to a canonical metric.
pub fn from_distance(distance: Option<Distance>) -> DistanceMetric {
    match distance {
        Some(Distance::Cosine) => DistanceMetric::Cosine,
        Some(Distance::Euclid) => DistanceMetric::Euclidean,
        Some(Distance::Dot) => DistanceMetric::Dot,
        _ => DistanceMetric::Unknown,
    }
}

/// Qdrant scores cosine and dot as similarity, the others as distance.
fn ranking(distance: Option<Distance>) -> Ranking {
    match distance {
        Some(Distance::Euclid) | Some(Distance::Manhattan) => Ranking::Distance,
        _ => Ranking::Similarity,
    }
}

fn item_to_point(item: Item, id: BackendId, keeps_original: bool) -> QdrantPoint {
    let mut payload = item.metadata;
    if let Some(document) = item.document {
        payload.insert(DOCUMENT_FIELD.to_string(), Value::String(document));
    }
    if keeps_original {
        payload.insert(ORIGINAL_ID_KEY.to_string(), Value::String(item.id));
    }
    QdrantPoint {
        id,
        payload,
        vector: item.embedding,
    }
}

fn point_to_item(point: QdrantPoint) -> Item {
    let mut payload = point.payload;
    let document = match payload.remove(DOCUMENT_FIELD) {
        Some(Value::String(document)) => Some(document),
        _ => None,
    };
    let id = IdKind::Uuid.recover(&point.id, &mut payload);
    Item {
        id,
        document,
        metadata: payload,
        embedding: point.vector,
    }
}

fn parse_cursor(cursor: &str) -> Result<BackendId> {
    if let Ok(uuid) = uuid::Uuid::parse_str(cursor) {
        return Ok(BackendId::Uuid(uuid));
    }
    cursor
        .parse::<u64>()
        .map(BackendId::Integer)
        .map_err(|_| Error::invalid_input(format!("'{}' is not a Qdrant page cursor", cursor)))
}

#[async_trait]
impl ConnectionAdapter for QdrantAdapter {
    fn backend(&self) -> BackendKind {
        BackendKind::Qdrant
    }

    async fn connect(&mut self) -> Result<()> {
        self.transport.health().await?;
        self.connected = true;
        tracing::info!(target: TRACING_TARGET_QDRANT, "Connected to Qdrant");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.listings.clear();
        tracing::info!(target: TRACING_TARGET_QDRANT, "Disconnected from Qdrant");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn list_collections(&mut self) -> Result<Vec<String>> {
        common::ensure_connected(self.connected)?;
        Ok(self.transport.list_collections().await?)
    }

    async fn create_collection(
        &mut self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<()> {
        common::ensure_connected(self.connected)?;
        common::check_create(dimension, metric)?;

        self.transport
            .create_collection(name, dimension, to_distance(metric))
            .await?;
        self.dimensions.record(name, dimension);

        tracing::info!(
            target: TRACING_TARGET_QDRANT,
            collection = %name,
            dimension,
            metric = %metric,
            "Created collection"
        );
        Ok(())
    }

    async fn get_collection_info(&mut self, name: &str) -> Result<Collection> {
        common::ensure_connected(self.connected)?;

        let info = self.transport.collection_info(name).await?;
        let item_count = self.transport.count(name, None).await?;
        let sample = self
            .transport
            .scroll(name, None, None, METADATA_SAMPLE_SIZE)
            .await?;
        let sample: Vec<Item> = sample.points.into_iter().map(point_to_item).collect();

        if let Some(dimension) = info.dimension {
            self.dimensions.record(name, dimension);
        }

        Ok(Collection {
            name: name.to_string(),
            vector_dimension: info.dimension,
            distance_metric: from_distance(info.distance),
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
        batch::embed_missing(&self.context, collection, None, &mut items).await?;
        if let Some(item) = items.iter().find(|item| item.embedding.is_none()) {
            return Err(Error::invalid_input(format!(
                "Qdrant stores a vector for every point, item '{}' has none",
                item.id
            )));
        }
        let dimension = self.dimension(collection).await?;
        batch::check_dimensions(dimension, &items)?;

        let mapped = IdKind::Uuid.map_batch(&items)?;
        let count = items.len();
        let points: Vec<QdrantPoint> = items
            .into_iter()
            .zip(mapped)
            .map(|(item, id)| item_to_point(item, id.backend, id.keeps_original))
            .collect();

        self.transport.upsert(collection, points).await?;
        self.listings.invalidate(collection);

        tracing::debug!(
            target: TRACING_TARGET_QDRANT,
            collection = %collection,
            count,
            "Upserted points"
        );
        Ok(())
    }

    async fn get_items(&mut self, collection: &str, ids: &[String]) -> Result<Vec<Item>> {
        common::ensure_connected(self.connected)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let backend_ids = ids
            .iter()
            .map(|id| IdKind::Uuid.to_backend_id(id))
            .collect::<Result<Vec<_>>>()?;
        let points = self.transport.retrieve(collection, &backend_ids).await?;
        Ok(points.into_iter().map(point_to_item).collect())
    }

    async fn get_all_items(
        &mut self,
        collection: &str,
        page: PageRequest,
        filter: Option<&CanonicalFilter>,
    ) -> Result<Page<Item>> {
        common::ensure_connected(self.connected)?;
        page.validate()?;
        let compiled = QdrantFilterCompiler.compile_opt(filter)?;

        if !compiled.is_complete() {
            let key = common::listing_key(collection, filter);
            if self.listings.needs_fetch(&key, &page) {
                tracing::warn!(
                    target: TRACING_TARGET_QDRANT,
                    collection = %collection,
                    residual = compiled.residual.clauses().len(),
                    "Materializing listing for residual filter"
                );
                let all = self.scroll_all(collection, compiled.native.as_ref()).await?;
                self.listings.store(key.clone(), compiled.post_filter(all));
            }
            return self.listings.slice(&key, &page);
        }

        let offset = page.cursor()?.map(parse_cursor).transpose()?;
        let scroll = self
            .transport
            .scroll(collection, compiled.native.as_ref(), offset, page.size)
            .await?;
        let items = scroll.points.into_iter().map(point_to_item).collect();
        Ok(Page::from_cursor(
            items,
            scroll.next.map(|next| next.to_string()),
        ))
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

        let compiled = QdrantFilterCompiler.compile(filter)?;
        match compiled.native {
            Some(native) if ids.is_empty() && compiled.residual.is_empty() => {
                self.transport.delete_where(collection, &native).await?;
                self.listings.invalidate(collection);
                tracing::debug!(
                    target: TRACING_TARGET_QDRANT,
                    collection = %collection,
                    "Deleted points matching filter"
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
        tracing::info!(target: TRACING_TARGET_QDRANT, collection = %name, "Deleted collection");
        Ok(())
    }

    async fn count_collection(&mut self, name: &str) -> Result<u64> {
        common::ensure_connected(self.connected)?;
        Ok(self.transport.count(name, None).await?)
    }

    async fn query_collection(
        &mut self,
        collection: &str,
        query: Query,
    ) -> Result<Vec<QueryResult>> {
        common::ensure_connected(self.connected)?;
        common::check_k(query.k)?;

        let compiled = QdrantFilterCompiler.compile_opt(query.filter.as_ref())?;
        let info = self.transport.collection_info(collection).await?;
        let dimension = self.dimension(collection).await?;
        let vectors =
            batch::query_vectors(&self.context, collection, None, query.input, dimension).await?;

        let total = if compiled.is_complete() {
            0
        } else {
            self.transport.count(collection, None).await?
        };
        let limit = common::search_limit(&compiled.residual, query.k, total);
        let ranking = ranking(info.distance);

        tracing::debug!(
            target: TRACING_TARGET_QDRANT,
            collection = %collection,
            queries = vectors.len(),
            k = query.k,
            "Searching points"
        );

        let mut results = Vec::with_capacity(vectors.len());
        for vector in vectors {
            let hits = self
                .transport
                .search(collection, vector, limit, compiled.native.as_ref())
                .await?
                .into_iter()
                .map(|hit| Hit::new(point_to_item(hit.point), hit.score))
                .collect();
            results.push(common::finish_hits(
                ranking,
                hits,
                &compiled.residual,
                query.k,
            ));
        }
        Ok(results)
    }

    fn capabilities(&self) -> Capabilities {
        QdrantFilterCompiler.capabilities()
    }

    fn context(&self) -> &ConnectionContext {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_round_trip_keeps_original_id() {
        let item = Item::new("doc_1")
            .with_document("hello")
            .with_field("status", "active");
        let id = IdKind::Uuid.to_backend_id("doc_1").unwrap();
        let point = item_to_point(item.clone(), id, true);

        assert_eq!(point.payload["document"], "hello");
        assert_eq!(point.payload[ORIGINAL_ID_KEY], "doc_1");
        assert_eq!(point_to_item(point), item);
    }

    #[test]
    fn test_ranking_follows_distance_function() {
        assert_eq!(ranking(Some(Distance::Cosine)), Ranking::Similarity);
        assert_eq!(ranking(Some(Distance::Dot)), Ranking::Similarity);
        assert_eq!(ranking(Some(Distance::Euclid)), Ranking::Distance);
    }

    #[test]
    fn test_metric_round_trip() {
        for metric in [DistanceMetric::Cosine, DistanceMetric::Euclidean, DistanceMetric::Dot] {
            assert_eq!(from_distance(Some(to_distance(metric))), metric);
        }
    }

    #[test]
    fn test_cursor_parsing() {
        assert!(matches!(parse_cursor("42").unwrap(), BackendId::Integer(42)));
        assert!(parse_cursor("not-a-cursor").is_err());
    }
}
