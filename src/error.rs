use std::path::PathBuf;

use thiserror::Error;

use crate::types::{EdgeId, TransactionId, VertexId};

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] Box<bincode::ErrorKind>),

    #[error("Storage unavailable at {}: {reason}", path.display())]
    StorageUnavailable { path: PathBuf, reason: String },

    #[error("Missing column family: {0}")]
    ColumnFamily(String),

    #[error("Vertex not found: {0}")]
    VertexNotFound(VertexId),

    #[error("Edge not found: {0}")]
    EdgeNotFound(EdgeId),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("Transaction {0} is closed")]
    TransactionClosed(TransactionId),

    #[error("Index not declared: {0}")]
    IndexNotDeclared(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GraphError {
    pub(crate) fn unavailable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        GraphError::StorageUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True for references to a vertex or edge that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            GraphError::VertexNotFound(_) | GraphError::EdgeNotFound(_)
        )
    }

    /// Only write conflicts are worth retrying with a fresh transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GraphError::TransactionConflict(_))
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(GraphError::TransactionConflict("v1".into()).is_retryable());
        assert!(!GraphError::VertexNotFound(VertexId::new(1)).is_retryable());
        assert!(!GraphError::IndexNotDeclared("name".into()).is_retryable());
    }

    #[test]
    fn test_not_found_covers_vertices_and_edges() {
        assert!(GraphError::VertexNotFound(VertexId::new(3)).is_not_found());
        assert!(GraphError::EdgeNotFound(EdgeId::new(3)).is_not_found());
        assert!(!GraphError::Config("bad".into()).is_not_found());
    }
}
