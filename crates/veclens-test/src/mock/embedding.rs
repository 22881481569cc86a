//! Mock embedding provider for testing.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use veclens_core::{EmbeddingProvider, EmbeddingRequest, Result};

/// Configuration for the mock embedding provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockEmbeddingConfig {
    /// Width of the produced vectors.
    pub dimension: usize,
}

impl Default for MockEmbeddingConfig {
    fn default() -> Self {
        Self { dimension: 4 }
    }
}

/// Mock embedding provider for testing.
///
/// Hashes every text into a fixed-width vector. Equal texts always get equal
/// vectors. Counts the texts it has embedded.
#[derive(Debug, Clone, Default)]
pub struct MockEmbeddingProvider {
    config: MockEmbeddingConfig,
    embedded: Arc<AtomicUsize>,
}

impl MockEmbeddingProvider {
    /// Creates a new mock embedding provider with the given configuration.
    pub fn new(config: MockEmbeddingConfig) -> Self {
        Self {
            config,
            embedded: Arc::default(),
        }
    }

    /// Creates a provider producing vectors of `dimension` components.
    pub fn with_dimension(dimension: usize) -> Self {
        Self::new(MockEmbeddingConfig { dimension })
    }

    /// Number of texts embedded so far, across clones.
    pub fn embedded(&self) -> usize {
        self.embedded.load(Ordering::SeqCst)
    }

    /// Returns the vector of one text.
    pub fn vector(&self, text: &str) -> Vec<f32> {
        (0..self.config.dimension)
            .map(|component| {
                let mut hash: u32 = 0x811c_9dc5 ^ component as u32;
                for byte in text.bytes() {
                    hash ^= u32::from(byte);
                    hash = hash.wrapping_mul(0x0100_0193);
                }
                (hash % 1000) as f32 / 1000.0
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn compute_embeddings(&self, request: EmbeddingRequest<'_>) -> Result<Vec<Vec<f32>>> {
        self.embedded
            .fetch_add(request.texts.len(), Ordering::SeqCst);
        Ok(request.texts.iter().map(|text| self.vector(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_vectors_are_deterministic() {
        let provider = MockEmbeddingProvider::with_dimension(3);
        let texts = vec!["alpha".to_string(), "beta".to_string(), "alpha".to_string()];
        let request = EmbeddingRequest {
            collection: "docs",
            texts: &texts,
            model_hint: None,
        };

        let vectors = provider.compute_embeddings(request).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0].len(), 3);
        assert_eq!(vectors[0], vectors[2]);
        assert_ne!(vectors[0], vectors[1]);
        assert_eq!(provider.embedded(), 3);
    }
}
