//! pgvector: parameterized SQL over JSONB metadata, through diesel-async.

mod adapter;
mod config;
mod filter;
mod transport;

pub use adapter::PgVectorAdapter;
pub use config::PgVectorConfig;
pub use filter::{
    DOCUMENT_COLUMN, METADATA_COLUMN, PgVectorFilterCompiler, SqlCondition, SqlOrdering,
    SqlParam, SqlPredicate, SqlTarget, SqlWhere, quote_ident,
};
pub use transport::{
    DieselPgVectorTransport, PgHit, PgTableInfo, PgVectorTransport, distance_operator,
    metric_from_indexdef, operator_class,
};
