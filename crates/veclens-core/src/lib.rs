#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod batch;
pub mod filter;
pub mod id;
pub mod page;

mod adapter;
mod capability;
mod dimension;
mod embedding;
mod error;
mod manager;
mod model;

pub use adapter::{BackendKind, ConnectionAdapter, Query, QueryInput};
pub use capability::{Capabilities, OperatorCapability};
pub use dimension::{
    CachedDimensionResolver, Dimension, DimensionResolver, DimensionSource,
    FixedDimensionResolver,
};
pub use embedding::{ConnectionContext, EMBEDDING_MODEL_KEY, EmbeddingProvider, EmbeddingRequest};
pub use error::{BoxedError, Error, ErrorKind, Result};
pub use filter::{CanonicalFilter, Clause, CompiledFilter, FilterCompiler, Operator};
pub use id::{BackendId, IdKind};
pub use manager::{
    ConnectionManager, ConnectionState, ConnectionSummary, MAX_CONNECTIONS, SharedAdapter,
};
pub use model::{
    Collection, DistanceMetric, Hit, Item, ItemUpdate, Metadata, ORIGINAL_ID_KEY, QueryResult,
    Ranking,
};
pub use page::{MaterializedPages, Page, PageRequest, PageToken};

/// Tracing target for core operations.
pub const TRACING_TARGET: &str = "veclens_core";

/// Tracing target for the connection registry.
pub const TRACING_TARGET_MANAGER: &str = "veclens_core::manager";
