//! [`ConnectionAdapter`] over a [`WeaviateTransport`].

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use veclens_core::batch::{self, METADATA_SAMPLE_SIZE};
use veclens_core::{
    BackendId, BackendKind, CachedDimensionResolver, CanonicalFilter, Capabilities, Collection,
    ConnectionAdapter, ConnectionContext, Dimension, DimensionResolver, DimensionSource,
    DistanceMetric, Error, FilterCompiler, Hit, IdKind, Item, ItemUpdate, ORIGINAL_ID_KEY, Page,
    PageRequest, Query, QueryResult, Ranking, Result,
};

use super::filter::DOCUMENT_PROPERTY;
use super::transport::class_name;
use super::{
    RestWeaviateTransport, WeaviateClass, WeaviateConfig, WeaviateFilterCompiler, WeaviateObject,
    WeaviateTransport, WeaviateWhere,
};
use crate::TRACING_TARGET_WEAVIATE;
use crate::common::{self, Listings};

/// Page size used when the adapter walks a whole class.
const LIST_BATCH: usize = 500;

/// Property names Weaviate accepts.
static PROPERTY_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[_A-Za-z][_0-9A-Za-z]*$").expect("property name pattern"));

/// Names Weaviate keeps for itself.
const RESERVED_PROPERTIES: &[&str] = &["id", "_id", "_additional", DOCUMENT_PROPERTY];

/// Weaviate adapter. Each collection is a class with externally supplied
/// vectors; ids are UUIDs and metadata keys are properties.
///
/// Batch writes are not transactional: a batch the server rejects part of
/// may leave the accepted objects written.
pub struct WeaviateAdapter {
    transport: Box<dyn WeaviateTransport>,
    context: ConnectionContext,
    dimensions: Box<dyn DimensionResolver>,
    listings: Listings,
    connected: bool,
}

impl WeaviateAdapter {
    /// Creates an adapter for a Weaviate server.
    pub fn new(config: &WeaviateConfig, context: ConnectionContext) -> Result<Self> {
        let transport = RestWeaviateTransport::new(config)?;
        Ok(Self::with_transport(Box::new(transport), context))
    }

    /// Creates an adapter over any transport.
    pub fn with_transport(
        transport: Box<dyn WeaviateTransport>,
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

        let class = class_name(collection);
        self.transport.class_info(&class).await?;
        for id in ids {
            self.transport.delete_object(&class, object_id(id)?).await?;
        }
        self.listings.invalidate(collection);

        tracing::debug!(
            target: TRACING_TARGET_WEAVIATE,
            collection = %collection,
            count = ids.len(),
            "Deleted objects"
        );
        Ok(())
    }

    async fn list_all(
        &mut self,
        class: &WeaviateClass,
        filter: Option<&WeaviateWhere>,
    ) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        loop {
            let objects = self
                .transport
                .list_objects(class, filter, items.len(), LIST_BATCH)
                .await?;
            let fetched = objects.len();
            items.extend(objects.into_iter().map(object_to_item));
            if fetched < LIST_BATCH {
                return Ok(items);
            }
        }
    }
}

impl std::fmt::Debug for WeaviateAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeaviateAdapter")
            .field("connected", &self.connected)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

struct Probe<'a> {
    transport: &'a mut dyn WeaviateTransport,
}

#[async_trait]
impl DimensionSource for Probe<'_> {
    // Weaviate class definitions carry no vector width.
    async fn declared_dimension(&mut self, _collection: &str) -> Result<Option<usize>> {
        Ok(None)
    }

    async fn probe_dimension(&mut self, collection: &str) -> Result<Option<usize>> {
        let class = self.transport.class_info(&class_name(collection)).await?;
        let objects = self.transport.list_objects(&class, None, 0, 1).await?;
        Ok(objects
            .into_iter()
            .find_map(|object| object.vector.map(|v| v.len())))
    }
}

fn check_properties(item: &Item) -> Result<()> {
    for key in item.metadata.keys() {
        if RESERVED_PROPERTIES.contains(&key.as_str()) || !PROPERTY_NAME.is_match(key) {
            return Err(Error::invalid_input(format!(
                "metadata key '{}' of item '{}' is not a usable Weaviate property name",
                key, item.id
            )));
        }
    }
    Ok(())
}

fn item_to_object(item: Item, id: BackendId, keeps_original: bool) -> Result<WeaviateObject> {
    let BackendId::Uuid(id) = id else {
        return Err(Error::invalid_input(format!(
            "Weaviate object ids are UUIDs, got '{}'",
            id
        )));
    };

    let mut properties = item.metadata;
    if let Some(document) = item.document {
        properties.insert(DOCUMENT_PROPERTY.to_string(), Value::String(document));
    }
    if keeps_original {
        properties.insert(ORIGINAL_ID_KEY.to_string(), Value::String(item.id));
    }
    Ok(WeaviateObject {
        id,
        properties,
        vector: item.embedding,
    })
}

fn object_to_item(object: WeaviateObject) -> Item {
    let mut properties = object.properties;
    let document = match properties.remove(DOCUMENT_PROPERTY) {
        Some(Value::String(document)) => Some(document),
        _ => None,
    };
    let id = IdKind::Uuid.recover(&BackendId::Uuid(object.id), &mut properties);
    Item {
        id,
        document,
        metadata: properties,
        embedding: object.vector,
    }
}

fn object_id(id: &str) -> Result<uuid::Uuid> {
    match IdKind::Uuid.to_backend_id(id)? {
        BackendId::Uuid(uuid) => Ok(uuid),
        other => Err(Error::invalid_input(format!(
            "'{}' did not map to a UUID",
            other
        ))),
    }
}

#[async_trait]
impl ConnectionAdapter for WeaviateAdapter {
    fn backend(&self) -> BackendKind {
        BackendKind::Weaviate
    }

    async fn connect(&mut self) -> Result<()> {
        self.transport.ready().await?;
        self.connected = true;
        tracing::info!(target: TRACING_TARGET_WEAVIATE, "Connected to Weaviate");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.listings.clear();
        tracing::info!(target: TRACING_TARGET_WEAVIATE, "Disconnected from Weaviate");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn list_collections(&mut self) -> Result<Vec<String>> {
        common::ensure_connected(self.connected)?;
        Ok(self.transport.list_classes().await?)
    }

    async fn create_collection(
        &mut self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<()> {
        common::ensure_connected(self.connected)?;
        common::check_create(dimension, metric)?;

        self.transport.create_class(&class_name(name), metric).await?;
        self.dimensions.record(name, dimension);

        tracing::info!(
            target: TRACING_TARGET_WEAVIATE,
            collection = %name,
            dimension,
            metric = %metric,
            "Created class"
        );
        Ok(())
    }

    async fn get_collection_info(&mut self, name: &str) -> Result<Collection> {
        common::ensure_connected(self.connected)?;

        let class = self.transport.class_info(&class_name(name)).await?;
        let item_count = self.transport.count(&class.name).await?;
        let sample: Vec<Item> = self
            .transport
            .list_objects(&class, None, 0, METADATA_SAMPLE_SIZE)
            .await?
            .into_iter()
            .map(object_to_item)
            .collect();
        let dimension = self.dimension(name).await?;

        Ok(Collection {
            name: name.to_string(),
            vector_dimension: dimension.known(),
            distance_metric: class.metric,
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
        items.iter().try_for_each(check_properties)?;
        let class = class_name(collection);
        self.transport.class_info(&class).await?;

        batch::embed_missing(&self.context, collection, None, &mut items).await?;
        if let Some(item) = items.iter().find(|item| item.embedding.is_none()) {
            return Err(Error::invalid_input(format!(
                "Weaviate classes here take supplied vectors, item '{}' has none",
                item.id
            )));
        }
        let dimension = self.dimension(collection).await?;
        if let Some(width) = batch::check_dimensions(dimension, &items)? {
            self.dimensions.record(collection, width);
        }

        let mapped = IdKind::Uuid.map_batch(&items)?;
        let count = items.len();
        let objects = items
            .into_iter()
            .zip(mapped)
            .map(|(item, id)| item_to_object(item, id.backend, id.keeps_original))
            .collect::<Result<Vec<_>>>()?;

        self.transport.put_objects(&class, objects).await?;
        self.listings.invalidate(collection);

        tracing::debug!(
            target: TRACING_TARGET_WEAVIATE,
            collection = %collection,
            count,
            "Upserted objects"
        );
        Ok(())
    }

    async fn get_items(&mut self, collection: &str, ids: &[String]) -> Result<Vec<Item>> {
        common::ensure_connected(self.connected)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let class = class_name(collection);
        self.transport.class_info(&class).await?;

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(object) = self.transport.get_object(&class, object_id(id)?).await? {
                items.push(object_to_item(object));
            }
        }
        Ok(items)
    }

    async fn get_all_items(
        &mut self,
        collection: &str,
        page: PageRequest,
        filter: Option<&CanonicalFilter>,
    ) -> Result<Page<Item>> {
        common::ensure_connected(self.connected)?;
        page.validate()?;
        let compiled = WeaviateFilterCompiler.compile_opt(filter)?;
        let class = self.transport.class_info(&class_name(collection)).await?;

        if !compiled.is_complete() {
            let key = common::listing_key(collection, filter);
            if self.listings.needs_fetch(&key, &page) {
                tracing::warn!(
                    target: TRACING_TARGET_WEAVIATE,
                    collection = %collection,
                    residual = compiled.residual.clauses().len(),
                    "Materializing listing for residual filter"
                );
                let all = self.list_all(&class, compiled.native.as_ref()).await?;
                self.listings.store(key.clone(), compiled.post_filter(all));
            }
            return self.listings.slice(&key, &page);
        }

        let offset = page.offset()?;
        let items = self
            .transport
            .list_objects(&class, compiled.native.as_ref(), offset, page.size)
            .await?
            .into_iter()
            .map(object_to_item)
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

        let compiled = WeaviateFilterCompiler.compile(filter)?;
        match compiled.native {
            Some(native) if ids.is_empty() && compiled.residual.is_empty() => {
                let class = self.transport.class_info(&class_name(collection)).await?;
                self.transport.delete_where(&class.name, &native).await?;
                self.listings.invalidate(collection);
                tracing::debug!(
                    target: TRACING_TARGET_WEAVIATE,
                    collection = %collection,
                    "Deleted objects matching filter"
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
        self.transport.delete_class(&class_name(name)).await?;
        self.dimensions.forget(name);
        self.listings.invalidate(name);
        tracing::info!(target: TRACING_TARGET_WEAVIATE, collection = %name, "Deleted class");
        Ok(())
    }

    async fn count_collection(&mut self, name: &str) -> Result<u64> {
        common::ensure_connected(self.connected)?;
        let class = class_name(name);
        self.transport.class_info(&class).await?;
        Ok(self.transport.count(&class).await?)
    }

    async fn query_collection(
        &mut self,
        collection: &str,
        query: Query,
    ) -> Result<Vec<QueryResult>> {
        common::ensure_connected(self.connected)?;
        common::check_k(query.k)?;

        let compiled = WeaviateFilterCompiler.compile_opt(query.filter.as_ref())?;
        let class = self.transport.class_info(&class_name(collection)).await?;
        let dimension = self.dimension(collection).await?;
        let vectors =
            batch::query_vectors(&self.context, collection, None, query.input, dimension).await?;

        let total = if compiled.is_complete() {
            0
        } else {
            self.transport.count(&class.name).await?
        };
        let limit = common::search_limit(&compiled.residual, query.k, total);

        tracing::debug!(
            target: TRACING_TARGET_WEAVIATE,
            collection = %collection,
            queries = vectors.len(),
            k = query.k,
            metric = %class.metric,
            "Searching objects"
        );

        let mut results = Vec::with_capacity(vectors.len());
        for vector in vectors {
            let hits = self
                .transport
                .near_vector(&class, vector, limit, compiled.native.as_ref())
                .await?
                .into_iter()
                .map(|hit| Hit::new(object_to_item(hit.object), hit.distance))
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
        WeaviateFilterCompiler.capabilities()
    }

    fn context(&self) -> &ConnectionContext {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use veclens_core::ErrorKind;
    use veclens_core::id::derive_uuid;

    use super::*;

    #[test]
    fn test_object_round_trip_keeps_original_id() {
        let item = Item::new("doc_1")
            .with_document("hello")
            .with_field("status", "active")
            .with_embedding(vec![1.0, 0.0]);
        let object =
            item_to_object(item.clone(), BackendId::Uuid(derive_uuid("doc_1")), true).unwrap();

        assert_eq!(object.properties[DOCUMENT_PROPERTY], "hello");
        assert_eq!(object.properties[ORIGINAL_ID_KEY], "doc_1");
        assert_eq!(object_to_item(object), item);
    }

    #[test]
    fn test_uuid_ids_are_stored_as_is() {
        let canonical = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";
        let items = vec![Item::new(canonical)];
        let mapped = IdKind::Uuid.map_batch(&items).unwrap();
        let object = item_to_object(items[0].clone(), mapped[0].backend.clone(), false).unwrap();

        assert!(!object.properties.contains_key(ORIGINAL_ID_KEY));
        assert_eq!(object_to_item(object).id, canonical);
    }

    #[test]
    fn test_property_names_are_checked() {
        assert!(check_properties(&Item::new("a").with_field("score", 1)).is_ok());
        for key in ["id", "document", "first name", "9lives"] {
            let err = check_properties(&Item::new("a").with_field(key, 1)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }
    }
}
