//! [`ConnectionAdapter`] over a [`MilvusTransport`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use veclens_core::batch::{self, METADATA_SAMPLE_SIZE};
use veclens_core::id::MappedId;
use veclens_core::{
    BackendId, BackendKind, CachedDimensionResolver, CanonicalFilter, Capabilities, Collection,
    ConnectionAdapter, ConnectionContext, Dimension, DimensionResolver, DimensionSource,
    DistanceMetric, Error, FilterCompiler, Hit, IdKind, Item, ItemUpdate, Metadata,
    ORIGINAL_ID_KEY, Page, PageRequest, Query, QueryResult, Ranking, Result,
};

use super::filter::{DOCUMENT_FIELD, MilvusField, MilvusLiteral, MilvusOp, MilvusTerm};
use super::transport::MAX_QUERY_WINDOW;
use super::{
    MilvusConfig, MilvusExpr, MilvusFilterCompiler, MilvusSchema, MilvusTransport,
    RestMilvusTransport,
};
use crate::TRACING_TARGET_MILVUS;
use crate::common::{self, Listings};

/// Page size used when the adapter walks a whole collection.
const QUERY_BATCH: usize = 1_000;

/// Milvus adapter. Collections it creates have a VarChar primary key, a
/// `document` field and a float vector; metadata lives in the dynamic field.
/// Collections keyed by Int64 are read and written through integer ids.
pub struct MilvusAdapter {
    transport: Box<dyn MilvusTransport>,
    context: ConnectionContext,
    dimensions: Box<dyn DimensionResolver>,
    listings: Listings,
    connected: bool,
}

impl MilvusAdapter {
    /// Creates an adapter for a Milvus server.
    pub fn new(config: &MilvusConfig, context: ConnectionContext) -> Result<Self> {
        let transport = RestMilvusTransport::new(config)?;
        Ok(Self::with_transport(Box::new(transport), context))
    }

    /// Creates an adapter over any transport.
    pub fn with_transport(transport: Box<dyn MilvusTransport>, context: ConnectionContext) -> Self {
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

    async fn query_all(
        &mut self,
        collection: &str,
        schema: &MilvusSchema,
        filter: Option<&MilvusExpr>,
    ) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut offset = 0;
        loop {
            let limit = QUERY_BATCH.min(MAX_QUERY_WINDOW - offset);
            let rows = self
                .transport
                .query(collection, filter, offset, limit)
                .await?;
            let fetched = rows.len();
            items.extend(rows.into_iter().map(|row| row_to_item(schema, row)));
            offset += fetched;

            if fetched < limit {
                return Ok(items);
            }
            if offset >= MAX_QUERY_WINDOW {
                return Err(Error::limit_exceeded(format!(
                    "Milvus queries stop at {} rows, narrow the filter",
                    MAX_QUERY_WINDOW
                )));
            }
        }
    }

    async fn select(
        &mut self,
        collection: &str,
        schema: &MilvusSchema,
        ids: &[String],
    ) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        for selector in id_selectors(schema, ids) {
            let rows = self
                .transport
                .query(collection, Some(&selector), 0, ids.len())
                .await?;
            items.extend(rows.into_iter().map(|row| row_to_item(schema, row)));
        }
        items.sort_by_key(|item| ids.iter().position(|id| *id == item.id));
        Ok(items)
    }

    /// Primary keys of the stored rows matching `selector`, with the
    /// canonical id each one holds.
    async fn owners(
        &mut self,
        collection: &str,
        schema: &MilvusSchema,
        selector: &MilvusExpr,
        limit: usize,
    ) -> Result<HashMap<u64, String>> {
        let rows = self
            .transport
            .query(collection, Some(selector), 0, limit)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let key = row.get(&schema.primary_field).and_then(Value::as_u64)?;
                Some((key, row_to_item(schema, row).id))
            })
            .collect())
    }

    /// Maps the ids of a write batch against the rows already stored.
    ///
    /// On integer keys a stored id keeps its key, so updates stay in place.
    /// A key held by a different id fails the batch with `InvalidInput`;
    /// positional keys of two separate batches would otherwise overwrite
    /// each other.
    async fn assign_ids(
        &mut self,
        collection: &str,
        schema: &MilvusSchema,
        items: &[Item],
    ) -> Result<Vec<MappedId>> {
        let mut mapped = schema.id_kind.map_batch(items)?;
        if schema.id_kind != IdKind::Integer {
            return Ok(mapped);
        }

        let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
        let mut stored: HashMap<String, u64> = HashMap::new();
        for selector in id_selectors(schema, &ids) {
            let owners = self.owners(collection, schema, &selector, ids.len()).await?;
            stored.extend(owners.into_iter().map(|(key, id)| (id, key)));
        }
        for (item, id) in items.iter().zip(mapped.iter_mut()) {
            if let Some(&key) = stored.get(&item.id) {
                *id = MappedId {
                    backend: BackendId::Integer(key),
                    keeps_original: key.to_string() != item.id,
                };
            }
        }

        let keys: Vec<u64> = mapped
            .iter()
            .filter_map(|id| match id.backend {
                BackendId::Integer(key) => Some(key),
                _ => None,
            })
            .collect();
        let mut claimed: HashMap<u64, &str> = HashMap::with_capacity(keys.len());
        for (item, key) in items.iter().zip(&keys) {
            if let Some(previous) = claimed.insert(*key, &item.id) {
                return Err(Error::invalid_input(format!(
                    "ids '{}' and '{}' map to the same Milvus key {}",
                    previous, item.id, key
                )));
            }
        }

        let selector = MilvusExpr::primary_in(
            &schema.primary_field,
            keys.iter().map(|&key| MilvusLiteral::Number(key.into())).collect(),
        );
        let owners = self.owners(collection, schema, &selector, keys.len()).await?;
        for (item, key) in items.iter().zip(&keys) {
            if let Some(owner) = owners.get(key).filter(|owner| **owner != item.id) {
                return Err(Error::invalid_input(format!(
                    "id '{}' maps to Milvus key {} which already holds '{}'",
                    item.id, key, owner
                )));
            }
        }
        Ok(mapped)
    }

    async fn delete_ids(&mut self, collection: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let schema = self.transport.describe(collection).await?;
        for selector in id_selectors(&schema, ids) {
            self.transport.delete(collection, &selector).await?;
        }
        self.listings.invalidate(collection);

        tracing::debug!(
            target: TRACING_TARGET_MILVUS,
            collection = %collection,
            count = ids.len(),
            "Deleted entities"
        );
        Ok(())
    }
}

impl std::fmt::Debug for MilvusAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MilvusAdapter")
            .field("connected", &self.connected)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

struct Probe<'a> {
    transport: &'a mut dyn MilvusTransport,
}

#[async_trait]
impl DimensionSource for Probe<'_> {
    async fn declared_dimension(&mut self, collection: &str) -> Result<Option<usize>> {
        Ok(self.transport.describe(collection).await?.dimension)
    }

    async fn probe_dimension(&mut self, collection: &str) -> Result<Option<usize>> {
        let schema = self.transport.describe(collection).await?;
        let rows = self.transport.query(collection, None, 0, 1).await?;
        Ok(rows
            .into_iter()
            .find_map(|row| row_to_item(&schema, row).embedding.map(|v| v.len())))
    }
}

/// COSINE and IP come back as similarities, L2 as a distance.
fn ranking(metric: DistanceMetric) -> Ranking {
    match metric {
        DistanceMetric::Euclidean => Ranking::Distance,
        _ => Ranking::Similarity,
    }
}

/// Selectors covering `ids`. Integer-keyed collections match plain numbers
/// on the key and everything else on the stored original id.
fn id_selectors(schema: &MilvusSchema, ids: &[String]) -> Vec<MilvusExpr> {
    if schema.id_kind != IdKind::Integer {
        let keys = ids.iter().cloned().map(MilvusLiteral::String).collect();
        return vec![MilvusExpr::primary_in(&schema.primary_field, keys)];
    }

    let (numeric, named): (Vec<&String>, Vec<&String>) = ids
        .iter()
        .partition(|id| id.parse::<u64>().is_ok_and(|n| n.to_string() == **id));

    let mut selectors = Vec::with_capacity(2);
    if !numeric.is_empty() {
        let keys = numeric
            .into_iter()
            .filter_map(|id| id.parse::<u64>().ok())
            .map(|n| MilvusLiteral::Number(n.into()))
            .collect();
        selectors.push(MilvusExpr::primary_in(&schema.primary_field, keys));
    }
    if !named.is_empty() {
        selectors.push(MilvusExpr {
            terms: vec![MilvusTerm {
                field: MilvusField::Dynamic(ORIGINAL_ID_KEY.to_string()),
                op: MilvusOp::In,
                value: MilvusLiteral::List(
                    named.into_iter().cloned().map(MilvusLiteral::String).collect(),
                ),
            }],
        });
    }
    selectors
}

fn item_to_row(
    schema: &MilvusSchema,
    item: Item,
    id: BackendId,
    keeps_original: bool,
) -> Result<Metadata> {
    let reserved = [
        schema.primary_field.as_str(),
        schema.vector_field.as_str(),
        DOCUMENT_FIELD,
    ];
    if let Some(key) = item.metadata.keys().find(|key| reserved.contains(&key.as_str())) {
        return Err(Error::invalid_input(format!(
            "metadata key '{}' of item '{}' collides with a Milvus schema field",
            key, item.id
        )));
    }

    let mut row = item.metadata;
    let key = match id {
        BackendId::Integer(n) => Value::from(n),
        other => Value::String(other.to_string()),
    };
    row.insert(schema.primary_field.clone(), key);
    row.insert(
        DOCUMENT_FIELD.to_string(),
        Value::String(item.document.unwrap_or_default()),
    );
    row.insert(
        schema.vector_field.clone(),
        Value::from(item.embedding.unwrap_or_default()),
    );
    if keeps_original {
        row.insert(ORIGINAL_ID_KEY.to_string(), Value::String(item.id));
    }
    Ok(row)
}

fn row_to_item(schema: &MilvusSchema, mut row: Metadata) -> Item {
    let backend = match row.remove(&schema.primary_field) {
        Some(Value::Number(n)) => n
            .as_u64()
            .map(BackendId::Integer)
            .unwrap_or_else(|| BackendId::String(n.to_string())),
        Some(Value::String(s)) => BackendId::String(s),
        _ => BackendId::String(String::new()),
    };
    let document = match row.remove(DOCUMENT_FIELD) {
        Some(Value::String(document)) if !document.is_empty() => Some(document),
        _ => None,
    };
    let embedding = match row.remove(&schema.vector_field) {
        Some(Value::Array(values)) => Some(
            values
                .iter()
                .filter_map(Value::as_f64)
                .map(|v| v as f32)
                .collect(),
        ),
        _ => None,
    };
    let id = schema.id_kind.recover(&backend, &mut row);

    Item {
        id,
        document,
        metadata: row,
        embedding,
    }
}

#[async_trait]
impl ConnectionAdapter for MilvusAdapter {
    fn backend(&self) -> BackendKind {
        BackendKind::Milvus
    }

    async fn connect(&mut self) -> Result<()> {
        self.transport.health().await?;
        self.connected = true;
        tracing::info!(target: TRACING_TARGET_MILVUS, "Connected to Milvus");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.listings.clear();
        tracing::info!(target: TRACING_TARGET_MILVUS, "Disconnected from Milvus");
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
            .create_collection(name, dimension, metric)
            .await?;
        self.dimensions.record(name, dimension);

        tracing::info!(
            target: TRACING_TARGET_MILVUS,
            collection = %name,
            dimension,
            metric = %metric,
            "Created collection"
        );
        Ok(())
    }

    async fn get_collection_info(&mut self, name: &str) -> Result<Collection> {
        common::ensure_connected(self.connected)?;

        let schema = self.transport.describe(name).await?;
        let item_count = self.transport.count(name).await?;
        let sample: Vec<Item> = self
            .transport
            .query(name, None, 0, METADATA_SAMPLE_SIZE)
            .await?
            .into_iter()
            .map(|row| row_to_item(&schema, row))
            .collect();

        if let Some(dimension) = schema.dimension {
            self.dimensions.record(name, dimension);
        }

        Ok(Collection {
            name: name.to_string(),
            vector_dimension: schema.dimension,
            distance_metric: schema.metric,
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
        let schema = self.transport.describe(collection).await?;
        batch::embed_missing(&self.context, collection, None, &mut items).await?;
        if let Some(item) = items.iter().find(|item| item.embedding.is_none()) {
            return Err(Error::invalid_input(format!(
                "Milvus stores a vector for every entity, item '{}' has none",
                item.id
            )));
        }
        let dimension = self.dimension(collection).await?;
        batch::check_dimensions(dimension, &items)?;

        let mapped = self.assign_ids(collection, &schema, &items).await?;
        let count = items.len();
        let rows = items
            .into_iter()
            .zip(mapped)
            .map(|(item, id)| item_to_row(&schema, item, id.backend, id.keeps_original))
            .collect::<Result<Vec<_>>>()?;

        self.transport.upsert(collection, rows).await?;
        self.listings.invalidate(collection);

        tracing::debug!(
            target: TRACING_TARGET_MILVUS,
            collection = %collection,
            count,
            "Upserted entities"
        );
        Ok(())
    }

    async fn get_items(&mut self, collection: &str, ids: &[String]) -> Result<Vec<Item>> {
        common::ensure_connected(self.connected)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let schema = self.transport.describe(collection).await?;
        self.select(collection, &schema, ids).await
    }

    async fn get_all_items(
        &mut self,
        collection: &str,
        page: PageRequest,
        filter: Option<&CanonicalFilter>,
    ) -> Result<Page<Item>> {
        common::ensure_connected(self.connected)?;
        page.validate()?;
        let compiled = MilvusFilterCompiler.compile_opt(filter)?;
        let schema = self.transport.describe(collection).await?;

        if !compiled.is_complete() {
            let key = common::listing_key(collection, filter);
            if self.listings.needs_fetch(&key, &page) {
                tracing::warn!(
                    target: TRACING_TARGET_MILVUS,
                    collection = %collection,
                    residual = compiled.residual.clauses().len(),
                    "Materializing listing for residual filter"
                );
                let all = self
                    .query_all(collection, &schema, compiled.native.as_ref())
                    .await?;
                self.listings.store(key.clone(), compiled.post_filter(all));
            }
            return self.listings.slice(&key, &page);
        }

        let offset = page.offset()?;
        if offset + page.size > MAX_QUERY_WINDOW {
            return Err(Error::limit_exceeded(format!(
                "Milvus pages end at row {}",
                MAX_QUERY_WINDOW
            )));
        }
        let items = self
            .transport
            .query(collection, compiled.native.as_ref(), offset, page.size)
            .await?
            .into_iter()
            .map(|row| row_to_item(&schema, row))
            .collect();
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

        let compiled = MilvusFilterCompiler.compile(filter)?;
        match compiled.native {
            Some(native) if ids.is_empty() && compiled.residual.is_empty() => {
                self.transport.describe(collection).await?;
                self.transport.delete(collection, &native).await?;
                self.listings.invalidate(collection);
                tracing::debug!(
                    target: TRACING_TARGET_MILVUS,
                    collection = %collection,
                    expr = %native,
                    "Deleted entities matching filter"
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
        // Dropping a missing collection succeeds on the server.
        self.transport.describe(name).await?;
        self.transport.drop_collection(name).await?;
        self.dimensions.forget(name);
        self.listings.invalidate(name);
        tracing::info!(target: TRACING_TARGET_MILVUS, collection = %name, "Dropped collection");
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

        let compiled = MilvusFilterCompiler.compile_opt(query.filter.as_ref())?;
        let schema = self.transport.describe(collection).await?;
        let dimension = self.dimension(collection).await?;
        let vectors =
            batch::query_vectors(&self.context, collection, None, query.input, dimension).await?;

        let total = if compiled.is_complete() {
            0
        } else {
            self.transport.count(collection).await?
        };
        let limit = common::search_limit(&compiled.residual, query.k, total).min(MAX_QUERY_WINDOW);
        let ranking = ranking(schema.metric);

        tracing::debug!(
            target: TRACING_TARGET_MILVUS,
            collection = %collection,
            queries = vectors.len(),
            k = query.k,
            metric = %schema.metric,
            "Searching entities"
        );

        let mut results = Vec::with_capacity(vectors.len());
        for vector in vectors {
            let hits = self
                .transport
                .search(
                    collection,
                    &schema.vector_field,
                    vector,
                    limit,
                    compiled.native.as_ref(),
                )
                .await?
                .into_iter()
                .map(|hit| Hit::new(row_to_item(&schema, hit.row), hit.distance))
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
        MilvusFilterCompiler.capabilities()
    }

    fn context(&self) -> &ConnectionContext {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integer_schema() -> MilvusSchema {
        MilvusSchema {
            id_kind: IdKind::Integer,
            ..MilvusSchema::default()
        }
    }

    #[test]
    fn test_row_round_trip() {
        let schema = MilvusSchema::default();
        let item = Item::new("doc_1")
            .with_document("hello")
            .with_field("status", "active")
            .with_embedding(vec![0.5, 0.25]);
        let row = item_to_row(&schema, item.clone(), BackendId::String("doc_1".into()), false)
            .unwrap();

        assert_eq!(row["id"], "doc_1");
        assert_eq!(row["document"], "hello");
        assert_eq!(row_to_item(&schema, row), item);
    }

    #[test]
    fn test_missing_document_reads_back_as_none() {
        let schema = MilvusSchema::default();
        let item = Item::new("a").with_embedding(vec![1.0]);
        let row = item_to_row(&schema, item, BackendId::String("a".into()), false).unwrap();
        assert_eq!(row["document"], "");
        assert_eq!(row_to_item(&schema, row).document, None);
    }

    #[test]
    fn test_schema_field_collision_is_rejected() {
        let schema = MilvusSchema::default();
        let item = Item::new("a").with_field("embedding", 1);
        let err = item_to_row(&schema, item, BackendId::String("a".into()), false).unwrap_err();
        assert_eq!(err.kind(), veclens_core::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_integer_rows_keep_original_id() {
        let schema = integer_schema();
        let item = Item::new("doc_7").with_embedding(vec![1.0]);
        let row = item_to_row(&schema, item, BackendId::Integer(7), true).unwrap();

        assert_eq!(row["id"], 7);
        assert_eq!(row[ORIGINAL_ID_KEY], "doc_7");
        assert_eq!(row_to_item(&schema, row).id, "doc_7");
    }

    #[test]
    fn test_integer_selectors_split_numeric_and_named_ids() {
        let ids = vec!["12".to_string(), "doc_7".to_string()];
        let selectors: Vec<String> = id_selectors(&integer_schema(), &ids)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(selectors, [r#"id in [12]"#, r#"_original_id in ["doc_7"]"#]);
    }

    #[test]
    fn test_string_selector() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let selectors = id_selectors(&MilvusSchema::default(), &ids);
        assert_eq!(selectors.len(), 1);
        assert_eq!(selectors[0].to_string(), r#"id in ["a", "b"]"#);
    }

    #[test]
    fn test_ranking_follows_metric() {
        assert_eq!(ranking(DistanceMetric::Euclidean), Ranking::Distance);
        assert_eq!(ranking(DistanceMetric::Cosine), Ranking::Similarity);
        assert_eq!(ranking(DistanceMetric::Dot), Ranking::Similarity);
    }
}
