//! Chroma: where-map filters over the REST API.

mod adapter;
mod config;
mod filter;
mod transport;

pub use adapter::{ChromaAdapter, SPACE_KEY, space_name};
pub use config::ChromaConfig;
pub use filter::ChromaFilterCompiler;
pub use transport::{ChromaCollection, ChromaGet, ChromaHit, ChromaTransport, RestChromaTransport};
