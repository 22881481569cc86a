//! Write and query preparation shared by the adapters.
//!
//! These run before any backend call so that a rejected batch leaves the
//! collection untouched.

use std::collections::{BTreeSet, HashMap};

use crate::adapter::QueryInput;
use crate::dimension::Dimension;
use crate::embedding::ConnectionContext;
use crate::error::{Error, Result};
use crate::model::{Item, ItemUpdate, Metadata, ORIGINAL_ID_KEY};

/// Computes embeddings for items carrying a document but no vector, when an
/// embedding provider is configured. Without one the items are left as is.
///
/// `collection_metadata` is consulted for the model hint when the backend
/// keeps collection-level metadata.
pub async fn embed_missing(
    context: &ConnectionContext,
    collection: &str,
    collection_metadata: Option<&Metadata>,
    items: &mut [Item],
) -> Result<()> {
    if context.embedder.is_none() {
        return Ok(());
    }

    let pending: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.embedding.is_none() && item.document.is_some())
        .map(|(index, _)| index)
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let texts: Vec<String> = pending
        .iter()
        .filter_map(|&index| items[index].document.clone())
        .collect();
    let vectors = context.embed(collection, &texts, collection_metadata).await?;

    for (index, vector) in pending.into_iter().zip(vectors) {
        items[index].embedding = Some(vector);
    }
    Ok(())
}

/// Checks every embedding of a batch against the collection dimension.
///
/// Returns the width of the batch, or `None` when no item carries a vector.
/// Fails with `DimensionMismatch` before anything is written.
pub fn check_dimensions(dimension: Dimension, items: &[Item]) -> Result<Option<usize>> {
    let mut width = dimension.known();
    for embedding in items.iter().filter_map(|item| item.embedding.as_ref()) {
        match width {
            Some(expected) if expected != embedding.len() => {
                return Err(Error::dimension_mismatch(expected, embedding.len()));
            }
            Some(_) => {}
            None => width = Some(embedding.len()),
        }
    }
    Ok(width)
}

/// Fails with `InvalidInput` when a batch repeats an id or uses an empty one.
pub fn check_ids(items: &[Item]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for item in items {
        if item.id.is_empty() {
            return Err(Error::invalid_input("item id must not be empty"));
        }
        if !seen.insert(item.id.as_str()) {
            return Err(Error::invalid_input(format!(
                "id '{}' appears twice in one batch",
                item.id
            )));
        }
    }
    Ok(())
}

/// Merges partial updates onto stored items.
///
/// Fails with `InvalidInput` if two updates name the same id and with
/// `NotFound` if an update names an id that is not stored. Items
/// whose document changed without a new vector lose their stale embedding
/// when an embedding provider is configured, so that [`embed_missing`]
/// recomputes it.
pub fn merge_updates(
    context: &ConnectionContext,
    stored: Vec<Item>,
    updates: Vec<ItemUpdate>,
) -> Result<Vec<Item>> {
    let mut by_id: HashMap<String, Item> = stored
        .into_iter()
        .map(|item| (item.id.clone(), item))
        .collect();

    if let Some(id) = repeated_id(updates.iter().map(|update| update.id.as_str())) {
        return Err(Error::invalid_input(format!(
            "id '{}' is updated twice in one batch",
            id
        )));
    }

    let mut merged = Vec::with_capacity(updates.len());
    for update in updates {
        let mut item = by_id
            .remove(&update.id)
            .ok_or_else(|| Error::not_found(format!("item '{}'", update.id)))?;

        let stale = update.apply(&mut item);
        if stale && context.embedder.is_some() {
            item.embedding = None;
        }
        merged.push(item);
    }
    Ok(merged)
}

fn repeated_id<'a>(ids: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut seen = BTreeSet::new();
    ids.into_iter()
        .find(|id| !seen.insert(*id))
        .map(str::to_string)
}

/// Turns a query input into vectors of the collection's width.
pub async fn query_vectors(
    context: &ConnectionContext,
    collection: &str,
    collection_metadata: Option<&Metadata>,
    input: QueryInput,
    dimension: Dimension,
) -> Result<Vec<Vec<f32>>> {
    let vectors = match input {
        QueryInput::Vectors(vectors) => vectors,
        QueryInput::Texts(texts) => context.embed(collection, &texts, collection_metadata).await?,
    };

    for vector in &vectors {
        dimension.check(vector.len())?;
    }
    Ok(vectors)
}

/// Metadata keys observed on a sample of items, reserved keys excluded.
pub fn observed_fields<'a>(items: impl IntoIterator<Item = &'a Item>) -> BTreeSet<String> {
    items
        .into_iter()
        .flat_map(|item| item.metadata.keys())
        .filter(|key| key.as_str() != ORIGINAL_ID_KEY)
        .cloned()
        .collect()
}

/// Number of items sampled to observe metadata fields.
pub const METADATA_SAMPLE_SIZE: usize = 100;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::embedding::{EmbeddingProvider, EmbeddingRequest};

    struct ConstantEmbedder;

    #[async_trait]
    impl EmbeddingProvider for ConstantEmbedder {
        async fn compute_embeddings(&self, request: EmbeddingRequest<'_>) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![0.5, 0.5]; request.texts.len()])
        }
    }

    #[test]
    fn test_mismatch_is_detected_before_write() {
        let items = vec![Item::new("a").with_embedding(vec![1.0; 5])];
        let err = check_dimensions(Dimension::Known(3), &items).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DimensionMismatch);
    }

    #[test]
    fn test_inconsistent_batch_without_known_dimension() {
        let items = vec![
            Item::new("a").with_embedding(vec![1.0, 0.0]),
            Item::new("b").with_embedding(vec![1.0, 0.0, 0.0]),
        ];
        assert!(check_dimensions(Dimension::Unknown, &items).is_err());
        assert_eq!(check_dimensions(Dimension::Unknown, &items[..1]).unwrap(), Some(2));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let items = vec![Item::new("a"), Item::new("a")];
        assert!(check_ids(&items).is_err());
    }

    #[tokio::test]
    async fn test_embed_missing_fills_documents_only() {
        let ctx = ConnectionContext::new().with_embedder(Arc::new(ConstantEmbedder));
        let mut items = vec![
            Item::new("a").with_document("text"),
            Item::new("b"),
            Item::new("c").with_document("kept").with_embedding(vec![1.0, 0.0]),
        ];
        embed_missing(&ctx, "docs", None, &mut items).await.unwrap();

        assert_eq!(items[0].embedding, Some(vec![0.5, 0.5]));
        assert_eq!(items[1].embedding, None);
        assert_eq!(items[2].embedding, Some(vec![1.0, 0.0]));
    }

    #[test]
    fn test_merge_updates_requires_stored_item() {
        let ctx = ConnectionContext::new();
        let stored = vec![Item::new("a").with_document("old")];
        let err = merge_updates(&ctx, stored, vec![ItemUpdate::new("b")]).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_merge_updates_rejects_repeated_id() {
        let ctx = ConnectionContext::new();
        let stored = vec![Item::new("a").with_document("old")];
        let updates = vec![
            ItemUpdate::new("a").with_document("first"),
            ItemUpdate::new("a").with_document("second"),
        ];
        let err = merge_updates(&ctx, stored, updates).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_merge_updates_clears_stale_embedding_with_embedder() {
        let ctx = ConnectionContext::new().with_embedder(Arc::new(ConstantEmbedder));
        let stored = vec![Item::new("a").with_document("old").with_embedding(vec![1.0, 0.0])];
        let merged = merge_updates(&ctx, stored, vec![ItemUpdate::new("a").with_document("new")])
            .unwrap();
        assert_eq!(merged[0].embedding, None);
    }
}
