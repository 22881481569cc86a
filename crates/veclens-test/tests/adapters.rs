//! Lifecycle scenarios run against every backend family.

use std::sync::Arc;

use veclens_core::{
    BackendKind, CanonicalFilter, ConnectionAdapter, ConnectionContext, DistanceMetric,
    EMBEDDING_MODEL_KEY, ErrorKind, IdKind, Item, ItemUpdate, Operator, PageRequest, Query, Ranking,
};
use veclens_test::fake::FakeMilvus;
use veclens_test::fixture::{
    self, ALL_BACKENDS, REFERENCE_COLLECTION, REFERENCE_DIMENSION, REFERENCE_SIZE,
};
use veclens_test::{MockEmbeddingProvider, init_tracing};
use veclens_vector::milvus::{MilvusAdapter, MilvusSchema};

fn same_name(listed: &[String], name: &str) -> bool {
    listed.iter().any(|listed| listed.eq_ignore_ascii_case(name))
}

#[tokio::test]
async fn test_small_cosine_collection() {
    init_tracing();
    for kind in ALL_BACKENDS {
        let mut adapter = fixture::connected(kind, ConnectionContext::new())
            .await
            .unwrap();
        adapter
            .create_collection("small", 2, DistanceMetric::Cosine)
            .await
            .unwrap();
        adapter
            .add_items(
                "small",
                vec![
                    Item::new("east").with_embedding(vec![1.0, 0.0]),
                    Item::new("north").with_embedding(vec![0.0, 1.0]),
                    Item::new("diagonal").with_embedding(vec![0.5, 0.5]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(adapter.count_collection("small").await.unwrap(), 3, "{}", kind);

        let results = adapter
            .query_collection("small", Query::vector(vec![1.0, 0.0], 2))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].ids(), ["east", "diagonal"], "{}", kind);

        adapter
            .delete_items("small", &["north".to_string()], None)
            .await
            .unwrap();
        assert_eq!(adapter.count_collection("small").await.unwrap(), 2, "{}", kind);

        let info = adapter.get_collection_info("small").await.unwrap();
        assert_eq!(info.item_count, 2, "{}", kind);
    }
}

#[tokio::test]
async fn test_filtered_delete_removes_every_match() {
    let filter = CanonicalFilter::new().where_eq("status", "inactive");
    let matched = fixture::expected_ids(&fixture::reference_items(), &filter).len();
    assert!(matched > 0);

    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        adapter
            .delete_items(REFERENCE_COLLECTION, &[], Some(&filter))
            .await
            .unwrap();

        assert_eq!(
            adapter.count_collection(REFERENCE_COLLECTION).await.unwrap(),
            (REFERENCE_SIZE - matched) as u64,
            "{}",
            kind
        );
        let page = adapter
            .get_all_items(REFERENCE_COLLECTION, PageRequest::first(10), Some(&filter))
            .await
            .unwrap();
        assert!(page.items.is_empty(), "{}", kind);
    }
}

#[tokio::test]
async fn test_filtered_delete_only_touches_listed_ids() {
    let ids = vec!["doc_00".to_string(), "doc_01".to_string(), "doc_02".to_string()];
    let filter = CanonicalFilter::new().where_eq("status", "active");

    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        adapter
            .delete_items(REFERENCE_COLLECTION, &ids, Some(&filter))
            .await
            .unwrap();

        let mut left: Vec<String> = adapter
            .get_items(REFERENCE_COLLECTION, &ids)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.id)
            .collect();
        left.sort();
        assert_eq!(left, ["doc_01", "doc_02"], "{}", kind);
        assert_eq!(
            adapter.count_collection(REFERENCE_COLLECTION).await.unwrap(),
            REFERENCE_SIZE as u64 - 1,
            "{}",
            kind
        );
    }
}

#[tokio::test]
async fn test_filtered_delete_on_document_text() {
    let filter = CanonicalFilter::new().with("document", Operator::Contains, "number 1");
    let matched = fixture::expected_ids(&fixture::reference_items(), &filter).len();

    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        adapter
            .delete_items(REFERENCE_COLLECTION, &[], Some(&filter))
            .await
            .unwrap();
        assert_eq!(
            adapter.count_collection(REFERENCE_COLLECTION).await.unwrap(),
            (REFERENCE_SIZE - matched) as u64,
            "{}",
            kind
        );
    }
}

#[tokio::test]
async fn test_delete_without_ids_or_filter_keeps_everything() {
    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        adapter
            .delete_items(REFERENCE_COLLECTION, &[], None)
            .await
            .unwrap();
        adapter
            .delete_items(REFERENCE_COLLECTION, &[], Some(&CanonicalFilter::new()))
            .await
            .unwrap();
        assert_eq!(
            adapter.count_collection(REFERENCE_COLLECTION).await.unwrap(),
            REFERENCE_SIZE as u64,
            "{}",
            kind
        );
    }
}

#[tokio::test]
async fn test_embedding_model_lookup_order() {
    for kind in ALL_BACKENDS {
        let mut adapter = fixture::connected(kind, ConnectionContext::new())
            .await
            .unwrap();
        adapter
            .create_collection("notes", 2, DistanceMetric::Cosine)
            .await
            .unwrap();
        assert_eq!(adapter.embedding_model("notes").await.unwrap(), None, "{}", kind);

        adapter
            .add_items(
                "notes",
                vec![
                    Item::new("n1")
                        .with_field(EMBEDDING_MODEL_KEY, "sampled-model")
                        .with_embedding(vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            adapter.embedding_model("notes").await.unwrap().as_deref(),
            Some("sampled-model"),
            "{}",
            kind
        );
    }
}

#[tokio::test]
async fn test_context_hint_wins_over_stored_model() {
    for kind in ALL_BACKENDS {
        let context = ConnectionContext::new().with_model_hint("notes", "configured-model");
        let mut adapter = fixture::connected(kind, context).await.unwrap();
        adapter
            .create_collection("notes", 2, DistanceMetric::Cosine)
            .await
            .unwrap();
        adapter
            .add_items(
                "notes",
                vec![
                    Item::new("n1")
                        .with_field(EMBEDDING_MODEL_KEY, "sampled-model")
                        .with_embedding(vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            adapter.embedding_model("notes").await.unwrap().as_deref(),
            Some("configured-model"),
            "{}",
            kind
        );
    }
}

#[tokio::test]
async fn test_milvus_integer_keys_are_not_reused_across_batches() {
    let schema = MilvusSchema {
        id_kind: IdKind::Integer,
        dimension: Some(2),
        metric: DistanceMetric::Cosine,
        ..MilvusSchema::default()
    };
    let transport = FakeMilvus::new().with_collection("ints", schema);
    let mut adapter = MilvusAdapter::with_transport(Box::new(transport), ConnectionContext::new());
    adapter.connect().await.unwrap();

    adapter
        .add_items("ints", vec![Item::new("alpha").with_embedding(vec![1.0, 0.0])])
        .await
        .unwrap();
    let err = adapter
        .add_items("ints", vec![Item::new("beta").with_embedding(vec![0.0, 1.0])])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(adapter.count_collection("ints").await.unwrap(), 1);

    // A stored id keeps its key on rewrite.
    adapter
        .update_items(
            "ints",
            vec![ItemUpdate::new("alpha").with_embedding(vec![0.5, 0.5])],
        )
        .await
        .unwrap();
    let stored = adapter.get_items("ints", &["alpha".to_string()]).await.unwrap();
    assert_eq!(stored[0].embedding, Some(vec![0.5, 0.5]));
    assert_eq!(adapter.count_collection("ints").await.unwrap(), 1);
}

#[tokio::test]
async fn test_milvus_integer_batch_takes_distinct_keys() {
    let schema = MilvusSchema {
        id_kind: IdKind::Integer,
        dimension: Some(2),
        metric: DistanceMetric::Cosine,
        ..MilvusSchema::default()
    };
    let transport = FakeMilvus::new().with_collection("ints", schema);
    let mut adapter = MilvusAdapter::with_transport(Box::new(transport), ConnectionContext::new());
    adapter.connect().await.unwrap();

    adapter
        .add_items(
            "ints",
            vec![
                Item::new("alpha").with_embedding(vec![1.0, 0.0]),
                Item::new("beta").with_embedding(vec![0.0, 1.0]),
            ],
        )
        .await
        .unwrap();
    let mut ids: Vec<String> = adapter
        .get_items("ints", &["alpha".to_string(), "beta".to_string()])
        .await
        .unwrap()
        .into_iter()
        .map(|item| item.id)
        .collect();
    ids.sort();
    assert_eq!(ids, ["alpha", "beta"]);
}

#[tokio::test]
async fn test_items_round_trip() {
    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        let items = fixture::reference_items();
        let ids = vec!["doc_03".to_string(), "doc_17".to_string()];

        let mut fetched = adapter
            .get_items(REFERENCE_COLLECTION, &ids)
            .await
            .unwrap();
        fetched.sort_by(|a, b| a.id.cmp(&b.id));

        assert_eq!(fetched.len(), 2, "{}", kind);
        for (got, want) in fetched.iter().zip([&items[3], &items[17]]) {
            assert_eq!(got.id, want.id, "{}", kind);
            assert_eq!(got.document, want.document, "{}", kind);
            assert_eq!(got.metadata.get("status"), want.metadata.get("status"), "{}", kind);
            assert_eq!(got.metadata.get("category"), want.metadata.get("category"), "{}", kind);
            assert_eq!(
                got.embedding.as_ref().map(Vec::len),
                Some(REFERENCE_DIMENSION),
                "{}",
                kind
            );
        }
    }
}

#[tokio::test]
async fn test_missing_ids_are_skipped() {
    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        let fetched = adapter
            .get_items(
                REFERENCE_COLLECTION,
                &["doc_01".to_string(), "absent".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1, "{}", kind);
        assert_eq!(fetched[0].id, "doc_01", "{}", kind);
    }
}

#[tokio::test]
async fn test_dimension_mismatch_writes_nothing() {
    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        let batch = vec![
            Item::new("fits").with_embedding(vec![0.1; REFERENCE_DIMENSION]),
            Item::new("too_short").with_embedding(vec![0.1; REFERENCE_DIMENSION - 1]),
        ];

        let err = adapter
            .add_items(REFERENCE_COLLECTION, batch)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch, "{}", kind);
        assert_eq!(
            adapter.count_collection(REFERENCE_COLLECTION).await.unwrap(),
            REFERENCE_SIZE as u64,
            "{}",
            kind
        );
    }
}

#[tokio::test]
async fn test_longer_vector_is_rejected() {
    for kind in ALL_BACKENDS {
        let mut adapter = fixture::connected(kind, ConnectionContext::new())
            .await
            .unwrap();
        adapter
            .create_collection("narrow", 3, DistanceMetric::Cosine)
            .await
            .unwrap();

        let err = adapter
            .add_items("narrow", vec![Item::new("wide").with_embedding(vec![0.2; 5])])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch, "{}", kind);
        assert_eq!(adapter.count_collection("narrow").await.unwrap(), 0, "{}", kind);
    }
}

#[tokio::test]
async fn test_query_vector_width_is_checked() {
    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        let err = adapter
            .query_collection(REFERENCE_COLLECTION, Query::vector(vec![1.0, 0.0], 3))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch, "{}", kind);
    }
}

#[tokio::test]
async fn test_nearest_neighbor_is_itself() {
    let items = fixture::reference_items();
    let anchor = &items[11];
    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        let embedding = anchor.embedding.clone().unwrap();
        let results = adapter
            .query_collection(REFERENCE_COLLECTION, Query::vector(embedding, 5))
            .await
            .unwrap();

        let result = &results[0];
        assert_eq!(result.len(), 5, "{}", kind);
        assert_eq!(result.ids()[0], anchor.id, "{}", kind);

        let scores = result.scores();
        let ranking = result.ranking();
        assert!(
            scores
                .windows(2)
                .all(|pair| ranking.best_first(pair[0], pair[1]).is_le()),
            "{} returned hits out of order",
            kind
        );
    }
}

#[tokio::test]
async fn test_update_recomputes_embedding() {
    let embedder = MockEmbeddingProvider::with_dimension(REFERENCE_DIMENSION);
    for kind in ALL_BACKENDS {
        let context = ConnectionContext::new().with_embedder(Arc::new(embedder.clone()));
        let mut adapter = fixture::connected(kind, context).await.unwrap();
        adapter
            .create_collection("notes", REFERENCE_DIMENSION, DistanceMetric::Cosine)
            .await
            .unwrap();
        adapter
            .add_items("notes", vec![Item::new("n1").with_document("first draft")])
            .await
            .unwrap();

        let stored = adapter.get_items("notes", &["n1".to_string()]).await.unwrap();
        assert_eq!(stored[0].embedding, Some(embedder.vector("first draft")), "{}", kind);

        adapter
            .update_items(
                "notes",
                vec![ItemUpdate::new("n1").with_document("final version")],
            )
            .await
            .unwrap();

        let stored = adapter.get_items("notes", &["n1".to_string()]).await.unwrap();
        assert_eq!(stored[0].document.as_deref(), Some("final version"), "{}", kind);
        assert_eq!(stored[0].embedding, Some(embedder.vector("final version")), "{}", kind);
    }
}

#[tokio::test]
async fn test_update_of_unknown_id_fails() {
    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        let err = adapter
            .update_items(
                REFERENCE_COLLECTION,
                vec![ItemUpdate::new("absent").with_document("text")],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound, "{}", kind);
    }
}

#[tokio::test]
async fn test_text_query_uses_embedder() {
    let embedder = MockEmbeddingProvider::with_dimension(REFERENCE_DIMENSION);
    for kind in ALL_BACKENDS {
        let context = ConnectionContext::new().with_embedder(Arc::new(embedder.clone()));
        let mut adapter = fixture::connected(kind, context).await.unwrap();
        adapter
            .create_collection("notes", REFERENCE_DIMENSION, DistanceMetric::Cosine)
            .await
            .unwrap();
        adapter
            .add_items(
                "notes",
                vec![
                    Item::new("a").with_document("vector databases"),
                    Item::new("b").with_document("pasta recipes"),
                ],
            )
            .await
            .unwrap();

        let results = adapter
            .query_collection(
                "notes",
                Query::texts(vec!["pasta recipes".to_string()], 1),
            )
            .await
            .unwrap();
        assert_eq!(results[0].ids(), ["b"], "{}", kind);
    }
}

#[tokio::test]
async fn test_collection_lifecycle() {
    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        let listed = adapter.list_collections().await.unwrap();
        assert!(same_name(&listed, REFERENCE_COLLECTION), "{}: {:?}", kind, listed);

        let info = adapter
            .get_collection_info(REFERENCE_COLLECTION)
            .await
            .unwrap();
        assert_eq!(info.item_count, REFERENCE_SIZE as u64, "{}", kind);
        assert!(info.metadata_fields.contains("status"), "{}", kind);

        adapter
            .delete_collection(REFERENCE_COLLECTION)
            .await
            .unwrap();
        let listed = adapter.list_collections().await.unwrap();
        assert!(!same_name(&listed, REFERENCE_COLLECTION), "{}", kind);

        let err = adapter
            .get_collection_info(REFERENCE_COLLECTION)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound, "{}", kind);
    }
}

#[tokio::test]
async fn test_operations_need_a_connection() {
    for kind in ALL_BACKENDS {
        let mut adapter = fixture::adapter(kind, ConnectionContext::new());
        let err = adapter.list_collections().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected, "{}", kind);
    }
}

#[tokio::test]
async fn test_weaviate_capitalizes_class_names() {
    let mut adapter = fixture::with_reference(BackendKind::Weaviate)
        .await
        .unwrap();
    let listed = adapter.list_collections().await.unwrap();
    assert_eq!(listed, ["Reference"]);

    // Lower-case names still address the class.
    assert_eq!(
        adapter
            .count_collection(REFERENCE_COLLECTION)
            .await
            .unwrap(),
        REFERENCE_SIZE as u64
    );
}

#[tokio::test]
async fn test_distance_ranking_for_euclidean() {
    for kind in ALL_BACKENDS {
        let mut adapter = fixture::connected(kind, ConnectionContext::new())
            .await
            .unwrap();
        adapter
            .create_collection("points", 2, DistanceMetric::Euclidean)
            .await
            .unwrap();
        adapter
            .add_items(
                "points",
                vec![
                    Item::new("near").with_embedding(vec![1.0, 1.0]),
                    Item::new("far").with_embedding(vec![5.0, 5.0]),
                ],
            )
            .await
            .unwrap();

        let results = adapter
            .query_collection("points", Query::vector(vec![0.0, 0.0], 2))
            .await
            .unwrap();
        assert_eq!(results[0].ids(), ["near", "far"], "{}", kind);
        if results[0].ranking() == Ranking::Distance {
            assert!(results[0].scores()[0] < results[0].scores()[1], "{}", kind);
        }
    }
}
