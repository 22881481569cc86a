//! Qdrant: structured filter objects over gRPC.

mod adapter;
mod config;
mod filter;
mod transport;

pub use adapter::{QdrantAdapter, from_distance, to_distance};
pub use config::QdrantConfig;
pub use filter::{QdrantCondition, QdrantFilterCompiler};
pub use transport::{
    GrpcQdrantTransport, QdrantCollectionInfo, QdrantHit, QdrantPoint, QdrantScroll,
    QdrantTransport,
};
