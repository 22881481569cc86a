//! Stored items and partial updates.

use serde::{Deserialize, Serialize};

/// String-keyed map of scalar or list values attached to an item.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata key under which adapters keep a canonical id the backend id
/// cannot represent. Never returned to callers.
pub const ORIGINAL_ID_KEY: &str = "_original_id";

/// One stored record of a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Canonical identifier, unique within the collection.
    pub id: String,
    /// Optional document text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    /// Metadata map.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    /// Optional embedding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Item {
    /// Creates an item with the given id and nothing else.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Sets the document text.
    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }

    /// Replaces the metadata map.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Adds a single metadata field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Removes adapter-owned keys from the metadata.
    pub fn strip_reserved(&mut self) {
        self.metadata.remove(ORIGINAL_ID_KEY);
    }
}

/// Partial update of a stored item. `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemUpdate {
    /// Identifier of the item to update.
    pub id: String,
    /// Replacement document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    /// Replacement metadata map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Replacement embedding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl ItemUpdate {
    /// Creates an update touching nothing.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Replaces the document.
    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }

    /// Replaces the metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Replaces the embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Applies this update onto a stored item.
    ///
    /// Returns true when the document changed without a replacement embedding,
    /// which means the stored embedding is stale.
    pub fn apply(self, item: &mut Item) -> bool {
        let document_changed = self
            .document
            .as_ref()
            .is_some_and(|doc| item.document.as_ref() != Some(doc));

        if let Some(document) = self.document {
            item.document = Some(document);
        }
        if let Some(metadata) = self.metadata {
            item.metadata = metadata;
        }

        match self.embedding {
            Some(embedding) => {
                item.embedding = Some(embedding);
                false
            }
            None => document_changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_strip_reserved_keys() {
        let mut item = Item::new("a")
            .with_field("_original_id", "a")
            .with_field("status", "active");
        item.strip_reserved();

        assert_eq!(item.metadata.len(), 1);
        assert_eq!(item.metadata.get("status"), Some(&json!("active")));
    }

    #[test]
    fn test_update_marks_stale_embedding() {
        let mut item = Item::new("a")
            .with_document("old")
            .with_embedding(vec![1.0, 0.0]);

        let stale = ItemUpdate::new("a").with_document("new").apply(&mut item);
        assert!(stale);
        assert_eq!(item.document.as_deref(), Some("new"));
        assert_eq!(item.embedding, Some(vec![1.0, 0.0]));
    }

    #[test]
    fn test_update_with_embedding_is_not_stale() {
        let mut item = Item::new("a").with_document("old");
        let stale = ItemUpdate::new("a")
            .with_document("new")
            .with_embedding(vec![0.5, 0.5])
            .apply(&mut item);

        assert!(!stale);
        assert_eq!(item.embedding, Some(vec![0.5, 0.5]));
    }
}
