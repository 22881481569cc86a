//! Columnar: parquet files on local disk, or tables in memory.
//!
//! Nothing is pushed down. Reads materialize the table, filters run as a
//! mask over the rows and search scans every vector.

mod adapter;
mod config;
mod filter;
mod store;

pub use adapter::ColumnarAdapter;
pub use config::ColumnarConfig;
pub use filter::{ColumnarFilterCompiler, apply_mask, mask};
pub use store::{
    ColumnarRow, ColumnarStore, ColumnarTable, METRIC_KEY, MemoryStore, ParquetStore, SENTINEL_ID,
};
