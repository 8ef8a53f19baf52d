//! Options recognised by [`Graph::open`](crate::graph::Graph::open).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GraphError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Directory holding the RocksDB files. Created on first open.
    pub storage_directory: PathBuf,
    /// Properties to declare a composite index on when the graph opens.
    pub indexed_properties: Vec<String>,
    /// Fsync the write-ahead log before a commit returns.
    pub sync_writes: bool,
    /// Rebuild every declared index from vertex records during open.
    pub verify_indexes_on_open: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            storage_directory: PathBuf::from("./db"),
            indexed_properties: Vec::new(),
            sync_writes: true,
            verify_indexes_on_open: false,
        }
    }
}

impl GraphConfig {
    pub fn new(storage_directory: impl Into<PathBuf>) -> Self {
        Self {
            storage_directory: storage_directory.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_index(mut self, property: impl Into<String>) -> Self {
        let property = property.into();
        if !self.indexed_properties.contains(&property) {
            self.indexed_properties.push(property);
        }
        self
    }

    #[must_use]
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    #[must_use]
    pub fn with_index_verification(mut self, verify: bool) -> Self {
        self.verify_indexes_on_open = verify;
        self
    }

    /// Parses a TOML document. Missing keys fall back to the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Config`] if the document is not valid TOML or has
    /// keys of the wrong type.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| GraphError::Config(e.to_string()))
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Config`] if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| GraphError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config = GraphConfig::from_toml_str(
            r#"
            storage_directory = "/tmp/graph"
            indexed_properties = ["name"]
            "#,
        )
        .unwrap();

        assert_eq!(config.storage_directory, PathBuf::from("/tmp/graph"));
        assert_eq!(config.indexed_properties, vec!["name".to_string()]);
        assert!(config.sync_writes);
        assert!(!config.verify_indexes_on_open);
    }

    #[test]
    fn test_bad_toml_is_a_config_error() {
        let err = GraphConfig::from_toml_str("sync_writes = \"yes\"").unwrap_err();
        assert!(matches!(err, GraphError::Config(_)));
    }

    #[test]
    fn test_with_index_is_idempotent() {
        let config = GraphConfig::new("db").with_index("name").with_index("name");
        assert_eq!(config.indexed_properties.len(), 1);
    }
}
