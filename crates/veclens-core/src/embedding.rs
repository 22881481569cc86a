//! Embedding computation seam and per-connection context.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::Metadata;

/// Collection metadata key recording the model that produced its embeddings.
pub const EMBEDDING_MODEL_KEY: &str = "_embedding_model";

/// Input of one embedding computation.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingRequest<'a> {
    /// Collection the texts belong to.
    pub collection: &'a str,
    /// Texts to embed.
    pub texts: &'a [String],
    /// Model recorded for the collection, if any.
    pub model_hint: Option<&'a str>,
}

/// Computes embeddings for texts. Implemented outside the adapter layer.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns one vector per input text, in order.
    async fn compute_embeddings(&self, request: EmbeddingRequest<'_>) -> Result<Vec<Vec<f32>>>;
}

/// Context handed to an adapter at construction.
#[derive(Clone, Default)]
pub struct ConnectionContext {
    /// Name of the credential profile the connection was opened from.
    pub profile_name: Option<String>,
    /// Embedding model recorded per collection by the settings store.
    pub model_hints: HashMap<String, String>,
    /// Provider used when a write or query supplies text but no vectors.
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl ConnectionContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the profile name.
    pub fn with_profile_name(mut self, name: impl Into<String>) -> Self {
        self.profile_name = Some(name.into());
        self
    }

    /// Records the embedding model of a collection.
    pub fn with_model_hint(mut self, collection: impl Into<String>, model: impl Into<String>) -> Self {
        self.model_hints.insert(collection.into(), model.into());
        self
    }

    /// Sets the embedding provider.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Returns the model hint of a collection: the settings store first, then
    /// the collection's own metadata.
    pub fn model_hint<'a>(
        &'a self,
        collection: &str,
        collection_metadata: Option<&'a Metadata>,
    ) -> Option<&'a str> {
        self.model_hint_with_sample(collection, collection_metadata, None)
    }

    /// Like [`Self::model_hint`], falling back to the model recorded on a
    /// sampled item of the collection.
    pub fn model_hint_with_sample<'a>(
        &'a self,
        collection: &str,
        collection_metadata: Option<&'a Metadata>,
        sample: Option<&'a Metadata>,
    ) -> Option<&'a str> {
        self.model_hints
            .get(collection)
            .map(String::as_str)
            .or_else(|| collection_metadata.and_then(recorded_model))
            .or_else(|| sample.and_then(recorded_model))
    }

    /// Embeds texts through the configured provider.
    ///
    /// Fails with `InvalidInput` when no provider is configured, and with
    /// `Backend` when the provider returns the wrong number of vectors.
    pub async fn embed(
        &self,
        collection: &str,
        texts: &[String],
        collection_metadata: Option<&Metadata>,
    ) -> Result<Vec<Vec<f32>>> {
        let embedder = self.embedder.as_ref().ok_or_else(|| {
            Error::invalid_input("texts were supplied without vectors and no embedding provider is configured")
        })?;

        let request = EmbeddingRequest {
            collection,
            texts,
            model_hint: self.model_hint(collection, collection_metadata),
        };
        let vectors = embedder.compute_embeddings(request).await?;

        if vectors.len() != texts.len() {
            return Err(Error::backend(format!(
                "embedding provider returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }
}

fn recorded_model(metadata: &Metadata) -> Option<&str> {
    metadata.get(EMBEDDING_MODEL_KEY).and_then(|value| value.as_str())
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("profile_name", &self.profile_name)
            .field("model_hints", &self.model_hints)
            .field("embedder", &self.embedder.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LengthEmbedder;

    #[async_trait]
    impl EmbeddingProvider for LengthEmbedder {
        async fn compute_embeddings(&self, request: EmbeddingRequest<'_>) -> Result<Vec<Vec<f32>>> {
            Ok(request
                .texts
                .iter()
                .map(|t| vec![t.len() as f32, 1.0])
                .collect())
        }
    }

    #[test]
    fn test_model_hint_prefers_settings() {
        let ctx = ConnectionContext::new().with_model_hint("docs", "mini-lm");
        let mut meta = Metadata::new();
        meta.insert(EMBEDDING_MODEL_KEY.into(), "other".into());

        assert_eq!(ctx.model_hint("docs", Some(&meta)), Some("mini-lm"));
        assert_eq!(ctx.model_hint("notes", Some(&meta)), Some("other"));
        assert_eq!(ctx.model_hint("notes", None), None);
    }

    #[test]
    fn test_model_hint_falls_back_to_sampled_item() {
        let ctx = ConnectionContext::new().with_model_hint("docs", "mini-lm");
        let mut collection = Metadata::new();
        collection.insert(EMBEDDING_MODEL_KEY.into(), "declared".into());
        let mut item = Metadata::new();
        item.insert(EMBEDDING_MODEL_KEY.into(), "sampled".into());

        assert_eq!(
            ctx.model_hint_with_sample("docs", Some(&collection), Some(&item)),
            Some("mini-lm")
        );
        assert_eq!(
            ctx.model_hint_with_sample("notes", Some(&collection), Some(&item)),
            Some("declared")
        );
        assert_eq!(ctx.model_hint_with_sample("notes", None, Some(&item)), Some("sampled"));
        assert_eq!(ctx.model_hint_with_sample("notes", None, Some(&Metadata::new())), None);
    }

    #[tokio::test]
    async fn test_embed_without_provider_fails() {
        let ctx = ConnectionContext::new();
        let err = ctx.embed("docs", &["a".into()], None).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_embed_with_provider() {
        let ctx = ConnectionContext::new().with_embedder(Arc::new(LengthEmbedder));
        let vectors = ctx.embed("docs", &["abc".into()], None).await.unwrap();
        assert_eq!(vectors, vec![vec![3.0, 1.0]]);
    }
}
