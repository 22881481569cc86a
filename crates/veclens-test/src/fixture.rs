//! Shared fixtures: the reference collection and ready-made adapters.

use serde_json::json;
use veclens_core::{
    BackendKind, CanonicalFilter, ConnectionAdapter, ConnectionContext, DistanceMetric, Item,
    Result,
};
use veclens_vector::chroma::ChromaAdapter;
use veclens_vector::columnar::{ColumnarAdapter, MemoryStore};
use veclens_vector::milvus::MilvusAdapter;
use veclens_vector::pgvector::PgVectorAdapter;
use veclens_vector::qdrant::QdrantAdapter;
use veclens_vector::weaviate::WeaviateAdapter;

use crate::MockEmbeddingProvider;
use crate::fake::{FakeChroma, FakeMilvus, FakePgVector, FakeQdrant, FakeWeaviate};

/// Every backend family, in declaration order.
pub const ALL_BACKENDS: [BackendKind; 6] = [
    BackendKind::Chroma,
    BackendKind::Qdrant,
    BackendKind::PgVector,
    BackendKind::Milvus,
    BackendKind::Weaviate,
    BackendKind::Columnar,
];

/// Size of the reference collection.
pub const REFERENCE_SIZE: usize = 37;

/// Vector width of the reference collection.
pub const REFERENCE_DIMENSION: usize = 4;

/// Name the reference collection is created under.
pub const REFERENCE_COLLECTION: &str = "reference";

/// Name the shaped collection is created under.
pub const SHAPED_COLLECTION: &str = "shaped";

const STATUSES: [&str; 3] = ["active", "inactive", "pending"];
const CATEGORIES: [&str; 4] = ["news", "blog", "paper", "note"];

/// Builds the reference collection: `doc_00` to `doc_36`, each with a
/// document, a `status`, an integer `score` in `0..10`, a `category` and an
/// embedding of the document text.
pub fn reference_items() -> Vec<Item> {
    let embedder = MockEmbeddingProvider::with_dimension(REFERENCE_DIMENSION);
    (0..REFERENCE_SIZE)
        .map(|i| {
            let document = format!("reference document number {}", i);
            let embedding = embedder.vector(&document);
            Item::new(format!("doc_{:02}", i))
                .with_document(document)
                .with_field("status", STATUSES[i % STATUSES.len()])
                .with_field("score", (i * 7 % 10) as i64)
                .with_field("category", CATEGORIES[i % CATEGORIES.len()])
                .with_embedding(embedding)
        })
        .collect()
}

/// Builds a small collection with irregular metadata: `status` is missing
/// on some items, `tags` is always a list and `n` mixes integers and floats
/// (`5` and `5.0` both occur) and is missing once.
pub fn shaped_items() -> Vec<Item> {
    let embedder = MockEmbeddingProvider::with_dimension(REFERENCE_DIMENSION);
    let item = |id: &str, document: &str| {
        Item::new(id)
            .with_document(document)
            .with_embedding(embedder.vector(document))
    };
    vec![
        item("s0", "field notes on rust")
            .with_field("status", "active")
            .with_field("tags", json!(["rust", "db"]))
            .with_field("n", 5),
        item("s1", "a go service")
            .with_field("status", "inactive")
            .with_field("tags", json!(["go"]))
            .with_field("n", 5.0),
        item("s2", "unlabelled rust snippet")
            .with_field("tags", json!(["rust"]))
            .with_field("n", 2),
        item("s3", "release notes")
            .with_field("status", "active")
            .with_field("tags", json!(["python"]))
            .with_field("n", 7.5),
        item("s4", "an untagged draft").with_field("n", 10),
        item("s5", "pending review notes")
            .with_field("status", "pending")
            .with_field("tags", json!(["db", "go"]))
            .with_field("n", 0.5),
        item("s6", "schema migration")
            .with_field("status", "active")
            .with_field("tags", json!(["db"])),
        item("s7", "benchmarks in go and rust")
            .with_field("status", "inactive")
            .with_field("tags", json!(["go", "rust"]))
            .with_field("n", 3),
    ]
}

/// Ids of the items a filter selects, evaluated in process.
pub fn expected_ids(items: &[Item], filter: &CanonicalFilter) -> Vec<String> {
    let mut ids: Vec<String> = items
        .iter()
        .filter(|item| filter.matches(item))
        .map(|item| item.id.clone())
        .collect();
    ids.sort();
    ids
}

/// Builds an adapter of one family over an empty in-memory backend. The
/// adapter is not connected.
pub fn adapter(kind: BackendKind, context: ConnectionContext) -> Box<dyn ConnectionAdapter> {
    match kind {
        BackendKind::Chroma => Box::new(ChromaAdapter::with_transport(
            Box::new(FakeChroma::new()),
            context,
        )),
        BackendKind::Qdrant => Box::new(QdrantAdapter::with_transport(
            Box::new(FakeQdrant::new()),
            context,
        )),
        BackendKind::PgVector => Box::new(PgVectorAdapter::with_transport(
            Box::new(FakePgVector::new()),
            context,
        )),
        BackendKind::Milvus => Box::new(MilvusAdapter::with_transport(
            Box::new(FakeMilvus::new()),
            context,
        )),
        BackendKind::Weaviate => Box::new(WeaviateAdapter::with_transport(
            Box::new(FakeWeaviate::new()),
            context,
        )),
        BackendKind::Columnar => Box::new(ColumnarAdapter::with_store(
            Box::new(MemoryStore::new()),
            context,
        )),
    }
}

/// Builds and connects an adapter of one family.
pub async fn connected(
    kind: BackendKind,
    context: ConnectionContext,
) -> Result<Box<dyn ConnectionAdapter>> {
    let mut adapter = adapter(kind, context);
    adapter.connect().await?;
    Ok(adapter)
}

/// Connects an adapter of one family and loads the reference collection
/// into it under cosine distance.
pub async fn with_reference(kind: BackendKind) -> Result<Box<dyn ConnectionAdapter>> {
    let mut adapter = connected(kind, ConnectionContext::new()).await?;
    adapter
        .create_collection(
            REFERENCE_COLLECTION,
            REFERENCE_DIMENSION,
            DistanceMetric::Cosine,
        )
        .await?;
    adapter
        .add_items(REFERENCE_COLLECTION, reference_items())
        .await?;
    Ok(adapter)
}

/// Connects an adapter of one family and loads the shaped collection into
/// it under cosine distance.
pub async fn with_shaped(kind: BackendKind) -> Result<Box<dyn ConnectionAdapter>> {
    let mut adapter = connected(kind, ConnectionContext::new()).await?;
    adapter
        .create_collection(SHAPED_COLLECTION, REFERENCE_DIMENSION, DistanceMetric::Cosine)
        .await?;
    adapter.add_items(SHAPED_COLLECTION, shaped_items()).await?;
    Ok(adapter)
}
