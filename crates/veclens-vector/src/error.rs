//! Transport-level errors and their conversion into the adapter taxonomy.

use thiserror::Error;

/// Result type alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Failure of a backend transport call, before conversion into
/// [`veclens_core::Error`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP status {status}: {body}")]
    Status {
        /// Status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The server answered with an error envelope.
    #[error("API error {code}: {message}")]
    Api {
        /// Backend error code.
        code: i64,
        /// Backend message.
        message: String,
    },

    /// Qdrant client error.
    #[error("Qdrant error: {0}")]
    Qdrant(#[from] qdrant_client::QdrantError),

    /// SQL error.
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Connection pool error.
    #[error("Pool error: {0}")]
    Pool(String),

    /// Arrow error.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    /// Parquet error.
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The response did not have the expected shape.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// A named resource does not exist.
    #[error("{0} not found")]
    NotFound(String),
}

impl TransportError {
    /// Creates a malformed response error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates a pool error.
    pub fn pool(err: impl std::fmt::Display) -> Self {
        Self::Pool(err.to_string())
    }

    /// Returns true for a missing resource.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Status { status, .. } => *status == 404,
            _ => false,
        }
    }
}

impl From<TransportError> for veclens_core::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound(what) => veclens_core::Error::not_found(what),
            TransportError::Status { status: 404, body } => {
                veclens_core::Error::not_found(format!("resource ({})", body))
            }
            TransportError::Http(e) if e.is_connect() || e.is_timeout() => {
                veclens_core::Error::from_backend("backend unreachable", e)
            }
            other => veclens_core::Error::from_backend("backend call failed", other),
        }
    }
}
