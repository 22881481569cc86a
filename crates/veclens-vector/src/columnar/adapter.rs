//! [`ConnectionAdapter`] over a [`ColumnarStore`].

use async_trait::async_trait;
use veclens_core::batch::{self, METADATA_SAMPLE_SIZE};
use veclens_core::{
    BackendKind, CachedDimensionResolver, CanonicalFilter, Capabilities, Collection,
    ConnectionAdapter, ConnectionContext, Dimension, DimensionResolver, DimensionSource,
    DistanceMetric, Error, FilterCompiler, Hit, Item, ItemUpdate, Page, PageRequest, Query,
    QueryResult, Ranking, Result,
};

use super::filter::{apply_mask, mask};
use super::{
    ColumnarConfig, ColumnarFilterCompiler, ColumnarRow, ColumnarStore, ColumnarTable, MemoryStore,
    ParquetStore, SENTINEL_ID,
};
use crate::TRACING_TARGET_COLUMNAR;
use crate::common::{self, Listings};

/// Columnar adapter. Every read materializes the table and every write
/// rewrites it; filters are evaluated in memory and search is exhaustive.
///
/// Items stored without an embedding carry a zero vector of the table width
/// and a cleared flag; they read back without an embedding and are skipped
/// by search.
pub struct ColumnarAdapter {
    store: Box<dyn ColumnarStore>,
    context: ConnectionContext,
    dimensions: Box<dyn DimensionResolver>,
    listings: Listings,
    connected: bool,
}

impl ColumnarAdapter {
    /// Creates an adapter over a directory of parquet files, or over memory
    /// when the config has no path.
    pub fn new(config: &ColumnarConfig, context: ConnectionContext) -> Result<Self> {
        let store: Box<dyn ColumnarStore> = match &config.path {
            Some(path) => Box::new(ParquetStore::open(path)?),
            None => Box::new(MemoryStore::new()),
        };
        Ok(Self::with_store(store, context))
    }

    /// Creates an adapter over any store.
    pub fn with_store(store: Box<dyn ColumnarStore>, context: ConnectionContext) -> Self {
        Self {
            store,
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
            store: self.store.as_mut(),
        };
        self.dimensions.resolve(collection, &mut source).await
    }

    fn visible_items(table: &ColumnarTable) -> Vec<Item> {
        table.visible().map(ColumnarRow::to_item).collect()
    }
}

impl std::fmt::Debug for ColumnarAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnarAdapter")
            .field("connected", &self.connected)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

struct Probe<'a> {
    store: &'a mut dyn ColumnarStore,
}

#[async_trait]
impl DimensionSource for Probe<'_> {
    async fn declared_dimension(&mut self, table: &str) -> Result<Option<usize>> {
        Ok(self.store.read(table)?.dimension)
    }

    async fn probe_dimension(&mut self, table: &str) -> Result<Option<usize>> {
        let table = self.store.read(table)?;
        Ok(table
            .visible()
            .find(|row| row.has_vector)
            .map(|row| row.vector.len()))
    }
}

#[async_trait]
impl ConnectionAdapter for ColumnarAdapter {
    fn backend(&self) -> BackendKind {
        BackendKind::Columnar
    }

    async fn connect(&mut self) -> Result<()> {
        self.store.list_tables()?;
        self.connected = true;
        tracing::info!(target: TRACING_TARGET_COLUMNAR, "Opened columnar store");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.listings.clear();
        tracing::info!(target: TRACING_TARGET_COLUMNAR, "Closed columnar store");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn list_collections(&mut self) -> Result<Vec<String>> {
        common::ensure_connected(self.connected)?;
        Ok(self.store.list_tables()?)
    }

    async fn create_collection(
        &mut self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<()> {
        common::ensure_connected(self.connected)?;
        common::check_create(dimension, metric)?;
        if self.store.contains(name)? {
            return Err(Error::invalid_input(format!("table '{}' already exists", name)));
        }

        self.store
            .write(name, &ColumnarTable::new(dimension, metric))?;
        self.dimensions.record(name, dimension);

        tracing::info!(
            target: TRACING_TARGET_COLUMNAR,
            collection = %name,
            dimension,
            metric = %metric,
            "Created table"
        );
        Ok(())
    }

    async fn get_collection_info(&mut self, name: &str) -> Result<Collection> {
        common::ensure_connected(self.connected)?;

        let table = self.store.read(name)?;
        let dimension = self.dimension(name).await?;
        let sample: Vec<Item> = table
            .visible()
            .take(METADATA_SAMPLE_SIZE)
            .map(ColumnarRow::to_item)
            .collect();

        Ok(Collection {
            name: name.to_string(),
            vector_dimension: dimension.known(),
            distance_metric: table.metric,
            item_count: table.len() as u64,
            metadata_fields: batch::observed_fields(&sample),
        })
    }

    async fn add_items(&mut self, collection: &str, mut items: Vec<Item>) -> Result<()> {
        common::ensure_connected(self.connected)?;
        if items.is_empty() {
            return Ok(());
        }

        batch::check_ids(&items)?;
        if items.iter().any(|item| item.id == SENTINEL_ID) {
            return Err(Error::invalid_input(format!(
                "'{}' is reserved by the columnar store",
                SENTINEL_ID
            )));
        }
        let mut table = self.store.read(collection)?;

        batch::embed_missing(&self.context, collection, None, &mut items).await?;
        let dimension = self.dimension(collection).await?;
        // Rows without a vector get zeros, which needs a concrete width.
        let width = batch::check_dimensions(dimension, &items)?
            .ok_or_else(|| Error::dimension_unknown(collection))?;
        if dimension.known().is_none() {
            self.dimensions.record(collection, width);
        }

        table.dimension.get_or_insert(width);
        let count = items.len();
        table.upsert(
            items
                .into_iter()
                .map(|item| ColumnarRow::from_item(item, width))
                .collect(),
        );
        self.store.write(collection, &table)?;
        self.listings.invalidate(collection);

        tracing::debug!(
            target: TRACING_TARGET_COLUMNAR,
            collection = %collection,
            count,
            "Rewrote table with added rows"
        );
        Ok(())
    }

    async fn get_items(&mut self, collection: &str, ids: &[String]) -> Result<Vec<Item>> {
        common::ensure_connected(self.connected)?;
        let table = self.store.read(collection)?;

        Ok(ids
            .iter()
            .filter_map(|id| table.visible().find(|row| row.id == *id))
            .map(ColumnarRow::to_item)
            .collect())
    }

    async fn get_all_items(
        &mut self,
        collection: &str,
        page: PageRequest,
        filter: Option<&CanonicalFilter>,
    ) -> Result<Page<Item>> {
        common::ensure_connected(self.connected)?;
        page.validate()?;
        let compiled = ColumnarFilterCompiler.compile_opt(filter)?;

        let key = common::listing_key(collection, filter);
        if self.listings.needs_fetch(&key, &page) {
            let items = Self::visible_items(&self.store.read(collection)?);
            let flags = mask(&compiled.residual, &items);
            tracing::debug!(
                target: TRACING_TARGET_COLUMNAR,
                collection = %collection,
                rows = items.len(),
                residual = compiled.residual.clauses().len(),
                "Materialized table"
            );
            self.listings.store(key.clone(), apply_mask(items, &flags));
        }
        self.listings.slice(&key, &page)
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
        let filter = common::delete_filter(filter);
        if ids.is_empty() && filter.is_none() {
            return Ok(());
        }
        let compiled = ColumnarFilterCompiler.compile_opt(filter)?;

        let mut table = self.store.read(collection)?;
        let targets: Vec<String> = match filter {
            None => ids.to_vec(),
            Some(_) => {
                let items: Vec<Item> = Self::visible_items(&table)
                    .into_iter()
                    .filter(|item| ids.is_empty() || ids.contains(&item.id))
                    .collect();
                let flags = mask(&compiled.residual, &items);
                apply_mask(items, &flags)
                    .into_iter()
                    .map(|item| item.id)
                    .collect()
            }
        };
        if targets.is_empty() {
            return Ok(());
        }

        let removed = table.remove(&targets);
        self.store.write(collection, &table)?;
        self.listings.invalidate(collection);

        tracing::debug!(
            target: TRACING_TARGET_COLUMNAR,
            collection = %collection,
            count = removed,
            "Rewrote table without deleted rows"
        );
        Ok(())
    }

    async fn delete_collection(&mut self, name: &str) -> Result<()> {
        common::ensure_connected(self.connected)?;
        self.store.drop_table(name)?;
        self.dimensions.forget(name);
        self.listings.invalidate(name);
        tracing::info!(target: TRACING_TARGET_COLUMNAR, collection = %name, "Dropped table");
        Ok(())
    }

    async fn count_collection(&mut self, name: &str) -> Result<u64> {
        common::ensure_connected(self.connected)?;
        Ok(self.store.read(name)?.len() as u64)
    }

    async fn query_collection(
        &mut self,
        collection: &str,
        query: Query,
    ) -> Result<Vec<QueryResult>> {
        common::ensure_connected(self.connected)?;
        common::check_k(query.k)?;

        let compiled = ColumnarFilterCompiler.compile_opt(query.filter.as_ref())?;
        let table = self.store.read(collection)?;
        let dimension = self.dimension(collection).await?;
        let vectors =
            batch::query_vectors(&self.context, collection, None, query.input, dimension).await?;

        let items = Self::visible_items(&table);
        let flags = mask(&compiled.residual, &items);
        let candidates = apply_mask(items, &flags);

        tracing::debug!(
            target: TRACING_TARGET_COLUMNAR,
            collection = %collection,
            queries = vectors.len(),
            candidates = candidates.len(),
            k = query.k,
            "Scanning rows"
        );

        Ok(vectors
            .iter()
            .map(|vector| {
                let hits = candidates
                    .iter()
                    .filter_map(|item| {
                        let embedding = item.embedding.as_ref()?;
                        (embedding.len() == vector.len()).then(|| {
                            Hit::new(item.clone(), table.metric.distance(vector, embedding))
                        })
                    })
                    .collect();
                common::finish_hits(Ranking::Distance, hits, &CanonicalFilter::new(), query.k)
            })
            .collect())
    }

    fn capabilities(&self) -> Capabilities {
        ColumnarFilterCompiler.capabilities()
    }

    fn context(&self) -> &ConnectionContext {
        &self.context
    }
}
