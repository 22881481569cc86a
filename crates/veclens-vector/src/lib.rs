#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod chroma;
pub mod columnar;
pub mod milvus;
pub mod pgvector;
pub mod qdrant;
pub mod weaviate;

mod common;
mod config;
mod error;
mod rest;

pub use config::ConnectionConfig;
pub use error::{TransportError, TransportResult};
pub use rest::DEFAULT_TIMEOUT;

/// Tracing target for the Chroma adapter.
pub const TRACING_TARGET_CHROMA: &str = "veclens_vector::chroma";

/// Tracing target for the Qdrant adapter.
pub const TRACING_TARGET_QDRANT: &str = "veclens_vector::qdrant";

/// Tracing target for the pgvector adapter.
pub const TRACING_TARGET_PGVECTOR: &str = "veclens_vector::pgvector";

/// Tracing target for the Milvus adapter.
pub const TRACING_TARGET_MILVUS: &str = "veclens_vector::milvus";

/// Tracing target for the Weaviate adapter.
pub const TRACING_TARGET_WEAVIATE: &str = "veclens_vector::weaviate";

/// Tracing target for the columnar adapter.
pub const TRACING_TARGET_COLUMNAR: &str = "veclens_vector::columnar";
