//! Columnar store configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Columnar store configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnarConfig {
    /// Directory holding one parquet file per table. Tables live in memory
    /// when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl ColumnarConfig {
    /// Creates an in-memory configuration.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Creates a configuration backed by a directory.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// Returns true when tables are kept in memory.
    pub fn is_in_memory(&self) -> bool {
        self.path.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_path_means_memory() {
        let config: ColumnarConfig = serde_json::from_str("{}").unwrap();
        assert!(config.is_in_memory());
        assert!(!ColumnarConfig::new("/tmp/tables").is_in_memory());
    }
}
