//! Vector dimension resolution.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::TRACING_TARGET;
use crate::error::{Error, Result};

/// Outcome of a dimension lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    /// The collection stores vectors of this width.
    Known(usize),
    /// No source could tell.
    Unknown,
}

impl Dimension {
    /// Returns the width, failing with `DimensionUnknown` when unresolved.
    pub fn require(self, collection: &str) -> Result<usize> {
        match self {
            Self::Known(dim) => Ok(dim),
            Self::Unknown => Err(Error::dimension_unknown(collection)),
        }
    }

    /// Checks a vector length against a known width. Unknown accepts any.
    pub fn check(self, actual: usize) -> Result<()> {
        match self {
            Self::Known(expected) if expected != actual => {
                Err(Error::dimension_mismatch(expected, actual))
            }
            _ => Ok(()),
        }
    }

    /// Returns the width if known.
    pub fn known(self) -> Option<usize> {
        match self {
            Self::Known(dim) => Some(dim),
            Self::Unknown => None,
        }
    }
}

/// Backend lookups consulted by a [`DimensionResolver`].
#[async_trait]
pub trait DimensionSource: Send {
    /// Width declared in backend-native schema or config, if exposed.
    async fn declared_dimension(&mut self, collection: &str) -> Result<Option<usize>>;

    /// Width of one stored embedding, if the collection has any.
    async fn probe_dimension(&mut self, collection: &str) -> Result<Option<usize>>;
}

/// Strategy for determining a collection's vector width.
#[async_trait]
pub trait DimensionResolver: Send + Sync {
    /// Records the width chosen at creation time.
    fn record(&mut self, collection: &str, dimension: usize);

    /// Drops anything known about a collection.
    fn forget(&mut self, collection: &str);

    /// Resolves the width of a collection.
    async fn resolve(
        &mut self,
        collection: &str,
        source: &mut (dyn DimensionSource + Send),
    ) -> Result<Dimension>;
}

/// Resolves in order: in-process cache, declared schema, probe of a stored
/// item, then unknown. Successful lookups are cached.
#[derive(Debug, Clone, Default)]
pub struct CachedDimensionResolver {
    cache: HashMap<String, usize>,
}

impl CachedDimensionResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached width of a collection.
    pub fn cached(&self, collection: &str) -> Option<usize> {
        self.cache.get(collection).copied()
    }
}

#[async_trait]
impl DimensionResolver for CachedDimensionResolver {
    fn record(&mut self, collection: &str, dimension: usize) {
        self.cache.insert(collection.to_string(), dimension);
    }

    fn forget(&mut self, collection: &str) {
        self.cache.remove(collection);
    }

    async fn resolve(
        &mut self,
        collection: &str,
        source: &mut (dyn DimensionSource + Send),
    ) -> Result<Dimension> {
        if let Some(dim) = self.cached(collection) {
            return Ok(Dimension::Known(dim));
        }

        let resolved = match source.declared_dimension(collection).await? {
            Some(dim) => Some(dim),
            None => source.probe_dimension(collection).await?,
        };

        match resolved {
            Some(dim) => {
                tracing::debug!(
                    target: TRACING_TARGET,
                    collection = %collection,
                    dimension = dim,
                    "Resolved collection dimension"
                );
                self.record(collection, dim);
                Ok(Dimension::Known(dim))
            }
            None => Ok(Dimension::Unknown),
        }
    }
}

/// Resolver that never consults the backend and always reports a fixed
/// answer. Useful to pin behavior in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedDimensionResolver(pub Dimension);

#[async_trait]
impl DimensionResolver for FixedDimensionResolver {
    fn record(&mut self, _collection: &str, _dimension: usize) {}

    fn forget(&mut self, _collection: &str) {}

    async fn resolve(
        &mut self,
        _collection: &str,
        _source: &mut (dyn DimensionSource + Send),
    ) -> Result<Dimension> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingSource {
        declared: Option<usize>,
        probed: Option<usize>,
        calls: usize,
    }

    #[async_trait]
    impl DimensionSource for CountingSource {
        async fn declared_dimension(&mut self, _collection: &str) -> Result<Option<usize>> {
            self.calls += 1;
            Ok(self.declared)
        }

        async fn probe_dimension(&mut self, _collection: &str) -> Result<Option<usize>> {
            self.calls += 1;
            Ok(self.probed)
        }
    }

    #[tokio::test]
    async fn test_recorded_dimension_wins() {
        let mut resolver = CachedDimensionResolver::new();
        resolver.record("docs", 3);

        let mut source = CountingSource {
            declared: Some(8),
            ..Default::default()
        };
        let dim = resolver.resolve("docs", &mut source).await.unwrap();
        assert_eq!(dim, Dimension::Known(3));
        assert_eq!(source.calls, 0);
    }

    #[tokio::test]
    async fn test_probe_result_is_cached() {
        let mut resolver = CachedDimensionResolver::new();
        let mut source = CountingSource {
            probed: Some(4),
            ..Default::default()
        };

        assert_eq!(
            resolver.resolve("docs", &mut source).await.unwrap(),
            Dimension::Known(4)
        );
        assert_eq!(source.calls, 2);

        assert_eq!(
            resolver.resolve("docs", &mut source).await.unwrap(),
            Dimension::Known(4)
        );
        assert_eq!(source.calls, 2);
    }

    #[tokio::test]
    async fn test_unknown_is_a_hard_error_when_required() {
        let mut resolver = CachedDimensionResolver::new();
        let mut source = CountingSource::default();

        let dim = resolver.resolve("docs", &mut source).await.unwrap();
        assert_eq!(dim, Dimension::Unknown);
        let err = dim.require("docs").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DimensionUnknown);
    }

    #[test]
    fn test_check_detects_mismatch() {
        let err = Dimension::Known(3).check(5).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DimensionMismatch);
        assert!(Dimension::Unknown.check(5).is_ok());
    }
}
