//! Milvus: boolean expressions over the v2 REST API.

mod adapter;
mod config;
mod filter;
mod transport;

pub use adapter::MilvusAdapter;
pub use config::{DEFAULT_PORT, MilvusConfig};
pub use filter::{
    DOCUMENT_FIELD, MilvusExpr, MilvusField, MilvusFilterCompiler, MilvusLiteral, MilvusOp,
    MilvusTerm, PRIMARY_FIELD, VECTOR_FIELD,
};
pub use transport::{
    MAX_QUERY_WINDOW, MilvusHit, MilvusSchema, MilvusTransport, RestMilvusTransport, metric_type,
};
