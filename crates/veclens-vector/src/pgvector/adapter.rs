//! [`ConnectionAdapter`] over a [`PgVectorTransport`].

use async_trait::async_trait;
use veclens_core::batch::{self, METADATA_SAMPLE_SIZE};
use veclens_core::{
    BackendKind, CachedDimensionResolver, CanonicalFilter, Capabilities, Collection,
    ConnectionAdapter, ConnectionContext, Dimension, DimensionResolver, DimensionSource,
    DistanceMetric, FilterCompiler, Hit, Item, ItemUpdate, Page, PageRequest, Query, QueryResult,
    Ranking, Result,
};

use super::{DieselPgVectorTransport, PgVectorConfig, PgVectorFilterCompiler, PgVectorTransport};
use crate::TRACING_TARGET_PGVECTOR;
use crate::common::{self, Listings};

/// pgvector adapter. One table per collection with `id`, `document`,
/// `metadata` and `embedding` columns; ids are stored as is.
///
/// Batch writes run in one transaction, so a failed batch leaves the table
/// unchanged.
pub struct PgVectorAdapter {
    transport: Box<dyn PgVectorTransport>,
    context: ConnectionContext,
    dimensions: Box<dyn DimensionResolver>,
    listings: Listings,
    connected: bool,
}

impl PgVectorAdapter {
    /// Creates an adapter for a PostgreSQL database.
    pub fn new(config: &PgVectorConfig, context: ConnectionContext) -> Result<Self> {
        let transport = DieselPgVectorTransport::new(config)?;
        Ok(Self::with_transport(Box::new(transport), context))
    }

    /// Creates an adapter over any transport.
    pub fn with_transport(
        transport: Box<dyn PgVectorTransport>,
        context: ConnectionContext,
    ) -> Self {
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

    async fn dimension(&mut self, table: &str) -> Result<Dimension> {
        let mut source = Probe {
            transport: self.transport.as_mut(),
        };
        self.dimensions.resolve(table, &mut source).await
    }

    async fn delete_ids(&mut self, collection: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        self.transport.delete(collection, ids).await?;
        self.listings.invalidate(collection);

        tracing::debug!(
            target: TRACING_TARGET_PGVECTOR,
            collection = %collection,
            count = ids.len(),
            "Deleted rows"
        );
        Ok(())
    }
}

impl std::fmt::Debug for PgVectorAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgVectorAdapter")
            .field("connected", &self.connected)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

struct Probe<'a> {
    transport: &'a mut dyn PgVectorTransport,
}

#[async_trait]
impl DimensionSource for Probe<'_> {
    async fn declared_dimension(&mut self, table: &str) -> Result<Option<usize>> {
        Ok(self.transport.table_info(table).await?.dimension)
    }

    async fn probe_dimension(&mut self, table: &str) -> Result<Option<usize>> {
        let rows = self.transport.select(table, None, 0, Some(1)).await?;
        Ok(rows
            .into_iter()
            .find_map(|item| item.embedding.map(|v| v.len())))
    }
}

#[async_trait]
impl ConnectionAdapter for PgVectorAdapter {
    fn backend(&self) -> BackendKind {
        BackendKind::PgVector
    }

    async fn connect(&mut self) -> Result<()> {
        self.transport.ping().await?;
        self.connected = true;
        tracing::info!(target: TRACING_TARGET_PGVECTOR, "Connected to PostgreSQL");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.listings.clear();
        tracing::info!(target: TRACING_TARGET_PGVECTOR, "Disconnected from PostgreSQL");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn list_collections(&mut self) -> Result<Vec<String>> {
        common::ensure_connected(self.connected)?;
        Ok(self.transport.list_tables().await?)
    }

    async fn create_collection(
        &mut self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<()> {
        common::ensure_connected(self.connected)?;
        common::check_create(dimension, metric)?;

        self.transport.create_table(name, dimension, metric).await?;
        self.dimensions.record(name, dimension);

        tracing::info!(
            target: TRACING_TARGET_PGVECTOR,
            collection = %name,
            dimension,
            metric = %metric,
            "Created table"
        );
        Ok(())
    }

    async fn get_collection_info(&mut self, name: &str) -> Result<Collection> {
        common::ensure_connected(self.connected)?;

        let info = self.transport.table_info(name).await?;
        let item_count = self.transport.count(name).await?;
        let sample = self
            .transport
            .select(name, None, 0, Some(METADATA_SAMPLE_SIZE))
            .await?;
        let dimension = self.dimension(name).await?;

        Ok(Collection {
            name: name.to_string(),
            vector_dimension: dimension.known(),
            distance_metric: info.metric,
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
        let dimension = self.dimension(collection).await?;
        if let Some(width) = batch::check_dimensions(dimension, &items)? {
            self.dimensions.record(collection, width);
        }

        let count = items.len();
        self.transport.upsert(collection, items).await?;
        self.listings.invalidate(collection);

        tracing::debug!(
            target: TRACING_TARGET_PGVECTOR,
            collection = %collection,
            count,
            "Upserted rows"
        );
        Ok(())
    }

    async fn get_items(&mut self, collection: &str, ids: &[String]) -> Result<Vec<Item>> {
        common::ensure_connected(self.connected)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut rows = self.transport.fetch(collection, ids).await?;
        // Rows come back in table order; callers see their own order.
        rows.sort_by_key(|item| ids.iter().position(|id| *id == item.id));
        Ok(rows)
    }

    async fn get_all_items(
        &mut self,
        collection: &str,
        page: PageRequest,
        filter: Option<&CanonicalFilter>,
    ) -> Result<Page<Item>> {
        common::ensure_connected(self.connected)?;
        page.validate()?;
        let compiled = PgVectorFilterCompiler.compile_opt(filter)?;

        if !compiled.is_complete() {
            let key = common::listing_key(collection, filter);
            if self.listings.needs_fetch(&key, &page) {
                tracing::warn!(
                    target: TRACING_TARGET_PGVECTOR,
                    collection = %collection,
                    residual = compiled.residual.clauses().len(),
                    "Materializing listing for residual filter"
                );
                let all = self
                    .transport
                    .select(collection, compiled.native.as_ref(), 0, None)
                    .await?;
                self.listings.store(key.clone(), compiled.post_filter(all));
            }
            return self.listings.slice(&key, &page);
        }

        let offset = page.offset()?;
        let items = self
            .transport
            .select(collection, compiled.native.as_ref(), offset, Some(page.size))
            .await?;
        Page::from_offset(items, &page)
    }

    async fn update_items(&mut self, collection: &str, updates: Vec<ItemUpdate>) -> Result<()> {
        common::ensure_connected(self.connected)?;
        if updates.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = updates.iter().map(|u| u.id.clone()).collect();
        let stored = self.transport.fetch(collection, &ids).await?;
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

        let compiled = PgVectorFilterCompiler.compile(filter)?;
        match compiled.native {
            Some(native) if ids.is_empty() && compiled.residual.is_empty() => {
                self.transport.delete_where(collection, &native).await?;
                self.listings.invalidate(collection);
                tracing::debug!(
                    target: TRACING_TARGET_PGVECTOR,
                    collection = %collection,
                    "Deleted rows matching filter"
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
        self.transport.drop_table(name).await?;
        self.dimensions.forget(name);
        self.listings.invalidate(name);
        tracing::info!(target: TRACING_TARGET_PGVECTOR, collection = %name, "Dropped table");
        Ok(())
    }

    async fn count_collection(&mut self, name: &str) -> Result<u64> {
        common::ensure_connected(self.connected)?;
        Ok(self.transport.count(name).await?)
    }

    async fn query_collection(
        &mut self,
        collection: &str,
        query: Query,
    ) -> Result<Vec<QueryResult>> {
        common::ensure_connected(self.connected)?;
        common::check_k(query.k)?;

        let compiled = PgVectorFilterCompiler.compile_opt(query.filter.as_ref())?;
        let info = self.transport.table_info(collection).await?;
        let dimension = self.dimension(collection).await?;
        let vectors =
            batch::query_vectors(&self.context, collection, None, query.input, dimension).await?;

        let total = if compiled.is_complete() {
            0
        } else {
            self.transport.count(collection).await?
        };
        let limit = common::search_limit(&compiled.residual, query.k, total);

        tracing::debug!(
            target: TRACING_TARGET_PGVECTOR,
            collection = %collection,
            queries = vectors.len(),
            k = query.k,
            metric = %info.metric,
            "Searching rows"
        );

        let mut results = Vec::with_capacity(vectors.len());
        for vector in vectors {
            let hits = self
                .transport
                .nearest(
                    collection,
                    vector,
                    info.metric,
                    compiled.native.as_ref(),
                    limit,
                )
                .await?
                .into_iter()
                .map(|hit| Hit::new(hit.item, hit.distance))
                .collect();
            results.push(common::finish_hits(
                Ranking::Distance,
                hits,
                &compiled.residual,
                query.k,
            ));
        }
        Ok(results)
    }

    fn capabilities(&self) -> Capabilities {
        PgVectorFilterCompiler.capabilities()
    }

    fn context(&self) -> &ConnectionContext {
        &self.context
    }
}
