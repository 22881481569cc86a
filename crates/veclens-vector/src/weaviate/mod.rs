//! Weaviate: property filter builders over REST and GraphQL.

mod adapter;
mod config;
mod filter;
mod transport;

pub use adapter::WeaviateAdapter;
pub use config::{DEFAULT_PORT, WeaviateConfig};
pub use filter::{
    DOCUMENT_PROPERTY, PropertyFilter, WeaviateFilterCompiler, WeaviateOperator, WeaviateValue,
    WeaviateWhere, by_property,
};
pub use transport::{
    RestWeaviateTransport, WeaviateClass, WeaviateHit, WeaviateObject, WeaviateTransport,
    class_name, distance_name, metric_from_distance,
};
