//! Error taxonomy shared by every adapter.

use strum::{AsRefStr, Display, IntoStaticStr};
use thiserror::Error;

/// Boxed error used as the diagnostic source of an [`Error`].
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Type alias for Results with our custom Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Categories of errors surfaced at the adapter boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// The adapter has no live connection.
    NotConnected,
    /// A collection or item does not exist.
    NotFound,
    /// A filter clause cannot be expressed by the backend at all.
    UnsupportedOperator,
    /// A vector length disagrees with the collection dimension.
    DimensionMismatch,
    /// A concrete dimension was required but could not be resolved.
    DimensionUnknown,
    /// Malformed caller input.
    InvalidInput,
    /// The connection registry is full.
    LimitExceeded,
    /// Wrapped backend failure.
    Backend,
}

/// A structured error carrying a taxonomy kind and a human-readable message.
///
/// The backend-native error, when there is one, is kept as the `source` for
/// diagnostics and is never the primary signal.
#[derive(Debug, Error)]
#[error("{kind}{}", message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
pub struct Error {
    /// The kind of error that occurred.
    pub kind: ErrorKind,
    /// Optional error message.
    pub message: Option<String>,
    /// Optional source error.
    #[source]
    pub source: Option<BoxedError>,
}

impl Error {
    /// Creates a new error with the given kind.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Adds a message to this error.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Adds a source error to this error.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Creates a not connected error.
    pub fn not_connected() -> Self {
        Self::new(ErrorKind::NotConnected).with_message("adapter is not connected")
    }

    /// Creates a not found error for the named resource.
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound).with_message(format!("{} not found", what))
    }

    /// Creates an unsupported operator error.
    pub fn unsupported_operator(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedOperator).with_message(message)
    }

    /// Creates a dimension mismatch error.
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::new(ErrorKind::DimensionMismatch)
            .with_message(format!("expected {}, got {}", expected, actual))
    }

    /// Creates a dimension unknown error for a collection.
    pub fn dimension_unknown(collection: &str) -> Self {
        Self::new(ErrorKind::DimensionUnknown).with_message(format!(
            "vector dimension of collection '{}' could not be resolved",
            collection
        ))
    }

    /// Creates an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput).with_message(message)
    }

    /// Creates a limit exceeded error.
    pub fn limit_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LimitExceeded).with_message(message)
    }

    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Backend).with_message(message)
    }

    /// Wraps a backend-native error, keeping it as the diagnostic source.
    pub fn from_backend(
        context: impl std::fmt::Display,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        let message = format!("{}: {}", context, source);
        Self::backend(message).with_source(source)
    }

    /// Returns true if this is a not found error.
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::from_backend("serialization failed", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_message() {
        let err = Error::dimension_mismatch(3, 5);
        assert_eq!(err.to_string(), "dimension_mismatch: expected 3, got 5");
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
    }

    #[test]
    fn test_display_without_message() {
        let err = Error::new(ErrorKind::Backend);
        assert_eq!(err.to_string(), "backend");
    }

    #[test]
    fn test_backend_error_keeps_source() {
        let io = std::io::Error::other("socket closed");
        let err = Error::from_backend("upsert failed", io);
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("socket closed"));
    }
}
