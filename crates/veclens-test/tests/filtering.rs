//! Filter push-down and pagination against every backend family.

use std::collections::BTreeSet;

use serde_json::json;
use veclens_core::{
    BackendKind, CanonicalFilter, ConnectionAdapter, Item, Operator, PageRequest, Query, Result,
};
use veclens_test::fixture::{
    self, ALL_BACKENDS, REFERENCE_COLLECTION, REFERENCE_SIZE, SHAPED_COLLECTION,
};

/// Walks every page of a listing and returns the page sizes and the items.
async fn walk(
    adapter: &mut dyn ConnectionAdapter,
    collection: &str,
    size: usize,
    filter: Option<&CanonicalFilter>,
) -> Result<(Vec<usize>, Vec<Item>)> {
    let mut sizes = Vec::new();
    let mut items = Vec::new();
    let mut request = PageRequest::first(size);
    loop {
        let page = adapter
            .get_all_items(collection, request, filter)
            .await?;
        sizes.push(page.items.len());
        items.extend(page.items);
        match page.next {
            Some(token) => request = PageRequest::next(token, size),
            None => return Ok((sizes, items)),
        }
    }
}

fn sorted_ids(items: &[Item]) -> Vec<String> {
    let mut ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
    ids.sort();
    ids
}

fn active_high_scores() -> CanonicalFilter {
    CanonicalFilter::new()
        .where_eq("status", "active")
        .with("score", Operator::Gt, 5)
}

#[tokio::test]
async fn test_unfiltered_pages() {
    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        let (sizes, items) = walk(adapter.as_mut(), REFERENCE_COLLECTION, 10, None)
            .await
            .unwrap();

        assert_eq!(sizes, [10, 10, 10, 7], "{}", kind);
        let ids: BTreeSet<String> = items.iter().map(|item| item.id.clone()).collect();
        assert_eq!(ids.len(), REFERENCE_SIZE, "{} repeated an item", kind);
    }
}

#[tokio::test]
async fn test_filtered_listing_matches_oracle() {
    let filter = active_high_scores();
    let expected = fixture::expected_ids(&fixture::reference_items(), &filter);
    assert!(!expected.is_empty());

    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        let (_, items) = walk(adapter.as_mut(), REFERENCE_COLLECTION, 3, Some(&filter))
            .await
            .unwrap();
        assert_eq!(sorted_ids(&items), expected, "{}", kind);
    }
}

#[tokio::test]
async fn test_filtered_pages_are_disjoint() {
    let filter = CanonicalFilter::new().where_eq("status", "active");
    let expected = fixture::expected_ids(&fixture::reference_items(), &filter);

    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        let (sizes, items) = walk(adapter.as_mut(), REFERENCE_COLLECTION, 5, Some(&filter))
            .await
            .unwrap();

        assert_eq!(sizes.iter().sum::<usize>(), expected.len(), "{}", kind);
        assert!(sizes.iter().all(|size| *size <= 5), "{}", kind);
        assert_eq!(sorted_ids(&items), expected, "{}", kind);
    }
}

#[tokio::test]
async fn test_operators_match_oracle() {
    let filters = [
        CanonicalFilter::new().with("score", Operator::Gte, 7),
        CanonicalFilter::new().with("score", Operator::Lt, 2),
        CanonicalFilter::new().with("score", Operator::Lte, 0),
        CanonicalFilter::new().with("status", Operator::Ne, "active"),
        CanonicalFilter::new().with("category", Operator::In, json!(["news", "paper"])),
        CanonicalFilter::new().with("category", Operator::NotIn, json!(["news", "paper"])),
        CanonicalFilter::new()
            .with("category", Operator::In, json!(["blog"]))
            .with("score", Operator::Gt, 3),
    ];
    let items = fixture::reference_items();

    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        for filter in &filters {
            let expected = fixture::expected_ids(&items, filter);
            let (_, listed) = walk(adapter.as_mut(), REFERENCE_COLLECTION, 10, Some(filter))
                .await
                .unwrap();
            assert_eq!(sorted_ids(&listed), expected, "{} with {:?}", kind, filter);
        }
    }
}

#[tokio::test]
async fn test_irregular_metadata_matches_oracle() {
    let filters = [
        CanonicalFilter::new().where_eq("status", "active"),
        CanonicalFilter::new().with("status", Operator::Ne, "active"),
        CanonicalFilter::new().with("status", Operator::In, json!(["active", "pending"])),
        CanonicalFilter::new().with("status", Operator::NotIn, json!(["active"])),
        CanonicalFilter::new().where_eq("tags", "rust"),
        CanonicalFilter::new().with("tags", Operator::Ne, "rust"),
        CanonicalFilter::new().with("tags", Operator::In, json!(["db", "python"])),
        CanonicalFilter::new().with("tags", Operator::NotIn, json!(["go"])),
        CanonicalFilter::new().where_eq("n", 5),
        CanonicalFilter::new().where_eq("n", 5.0),
        CanonicalFilter::new().with("n", Operator::Ne, 5),
        CanonicalFilter::new().with("n", Operator::In, json!([5, 3])),
        CanonicalFilter::new().with("n", Operator::NotIn, json!([5.0, 10])),
        CanonicalFilter::new().with("n", Operator::Gt, 4),
        CanonicalFilter::new().with("n", Operator::Lte, 3),
        CanonicalFilter::new().with("n", Operator::Gte, 7.5),
        CanonicalFilter::new().with("document", Operator::Contains, "notes"),
        CanonicalFilter::new().with("document", Operator::NotContains, "notes"),
        CanonicalFilter::new()
            .with("status", Operator::Ne, "inactive")
            .with("tags", Operator::In, json!(["rust"])),
    ];
    let items = fixture::shaped_items();

    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_shaped(kind).await.unwrap();
        for filter in &filters {
            let expected = fixture::expected_ids(&items, filter);
            let (_, listed) = walk(adapter.as_mut(), SHAPED_COLLECTION, 3, Some(filter))
                .await
                .unwrap();
            assert_eq!(sorted_ids(&listed), expected, "{} with {:?}", kind, filter);
        }
    }
}

#[tokio::test]
async fn test_negation_keeps_items_without_the_field() {
    let filter =
        CanonicalFilter::new().with("status", Operator::NotIn, json!(["active", "inactive"]));
    assert_eq!(
        fixture::expected_ids(&fixture::shaped_items(), &filter),
        ["s2", "s4", "s5"]
    );

    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_shaped(kind).await.unwrap();
        let (_, listed) = walk(adapter.as_mut(), SHAPED_COLLECTION, 10, Some(&filter))
            .await
            .unwrap();
        assert_eq!(sorted_ids(&listed), ["s2", "s4", "s5"], "{}", kind);
    }
}

#[tokio::test]
async fn test_document_contains_matches_oracle() {
    let filter = CanonicalFilter::new().with("document", Operator::Contains, "number 1");
    let expected = fixture::expected_ids(&fixture::reference_items(), &filter);
    assert_eq!(expected.len(), 11);

    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        let (_, items) = walk(adapter.as_mut(), REFERENCE_COLLECTION, 10, Some(&filter))
            .await
            .unwrap();
        assert_eq!(sorted_ids(&items), expected, "{}", kind);
    }
}

#[tokio::test]
async fn test_filtered_query_returns_only_matches() {
    let filter = active_high_scores();
    let expected = fixture::expected_ids(&fixture::reference_items(), &filter);
    let anchor = fixture::reference_items()[5].embedding.clone().unwrap();

    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        let query = Query::vector(anchor.clone(), REFERENCE_SIZE).with_filter(filter.clone());
        let results = adapter
            .query_collection(REFERENCE_COLLECTION, query)
            .await
            .unwrap();

        let mut ids = results[0].ids().to_vec();
        ids.sort();
        assert_eq!(ids, expected, "{}", kind);
    }
}

#[tokio::test]
async fn test_residual_query_still_fills_k() {
    // Two matches exist; the columnar store evaluates the whole filter in
    // process and still has to return both.
    let filter = CanonicalFilter::new()
        .where_eq("status", "active")
        .with("score", Operator::Gte, 8);
    let expected = fixture::expected_ids(&fixture::reference_items(), &filter);
    let anchor = fixture::reference_items()[0].embedding.clone().unwrap();

    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        let query = Query::vector(anchor.clone(), expected.len()).with_filter(filter.clone());
        let results = adapter
            .query_collection(REFERENCE_COLLECTION, query)
            .await
            .unwrap();
        assert_eq!(results[0].len(), expected.len(), "{}", kind);
    }
}

#[tokio::test]
async fn test_push_down_capabilities() {
    for kind in ALL_BACKENDS {
        let adapter = fixture::adapter(kind, Default::default());
        let capabilities = adapter.capabilities();
        let equality = capabilities.get(Operator::Eq).server_side;
        let range = capabilities.get(Operator::Gt).server_side;

        if kind == BackendKind::Columnar {
            assert!(!equality && !range, "columnar pushes nothing down");
        } else {
            assert!(equality && range, "{} evaluates equality and ranges", kind);
        }
    }
}

#[tokio::test]
async fn test_invalid_page_size() {
    for kind in ALL_BACKENDS {
        let mut adapter = fixture::with_reference(kind).await.unwrap();
        let err = adapter
            .get_all_items(REFERENCE_COLLECTION, PageRequest::first(0), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), veclens_core::ErrorKind::InvalidInput, "{}", kind);
    }
}
