#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod fake;
pub mod fixture;

mod mock;

pub use mock::{MockEmbeddingConfig, MockEmbeddingProvider, init_tracing};
