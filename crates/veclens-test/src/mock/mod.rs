//! Mock implementations of the external collaborators.
//!
//! The embedding provider is the only service the adapters call out to.
//! Its vectors are deterministic so that tests can assert on neighbors.

mod embedding;

pub use embedding::{MockEmbeddingConfig, MockEmbeddingProvider};

/// Installs a test-friendly tracing subscriber, honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
