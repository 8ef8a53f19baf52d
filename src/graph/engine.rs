use rocksdb::WriteBatch;
use std::sync::Arc;
use tracing::{info, warn};

use super::indices::{IndexChange, expected_entries};
use super::session::GraphSession;
use super::transaction::{Transaction, TransactionManager};
use crate::config::GraphConfig;
use crate::error::{GraphError, Result};
use crate::storage::RocksBackend;

/// Handle to an open graph store.
///
/// Cloning is cheap and every clone shares the same storage, so a `Graph` can
/// be handed to as many threads as needed. The store is released once the
/// last handle and the last transaction are gone.
#[derive(Debug, Clone)]
pub struct Graph {
    manager: Arc<TransactionManager>,
    config: Arc<GraphConfig>,
}

impl Graph {
    /// Opens (or creates) the store described by `config`.
    ///
    /// # Errors
    ///
    /// [`GraphError::StorageUnavailable`] if the directory cannot be opened or
    /// holds records that cannot be decoded.
    pub fn open(config: GraphConfig) -> Result<Self> {
        let path = config.storage_directory.clone();
        let backend = Arc::new(RocksBackend::open(&path)?);
        let manager = TransactionManager::new(backend, config.sync_writes).map_err(|e| match e {
            GraphError::StorageUnavailable { .. } => e,
            other => GraphError::unavailable(&path, other),
        })?;

        let graph = Self {
            manager: Arc::new(manager),
            config: Arc::new(config),
        };
        for property in &graph.config.indexed_properties {
            graph.declare_index(property)?;
        }
        if graph.config.verify_indexes_on_open {
            for property in graph.indexed_properties()? {
                let repaired = graph.reindex(&property)?;
                if repaired > 0 {
                    warn!(%property, repaired, "Index diverged from vertex records and was repaired");
                }
            }
        }

        info!(
            path = %path.display(),
            indexes = ?graph.indexed_properties()?,
            "Graph opened"
        );
        Ok(graph)
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Starts a transaction on a snapshot of everything committed so far.
    pub fn begin(&self) -> Result<Transaction> {
        self.manager.begin()
    }

    /// A façade that manages one current transaction at a time.
    pub fn session(&self) -> GraphSession {
        GraphSession::new(self.clone())
    }

    pub fn active_transactions(&self) -> usize {
        self.manager.active_count()
    }

    pub fn indexed_properties(&self) -> Result<Vec<String>> {
        self.manager.indexes.declared()
    }

    /// Declares a composite index on `property`. Declaring it again is a no-op.
    ///
    /// Vertices already carrying the property are backfilled in the same
    /// atomic write as the declaration.
    pub fn declare_index(&self, property: &str) -> Result<()> {
        let manager = &self.manager;
        if manager.indexes.is_declared(property)? {
            return Ok(());
        }

        let _guard = manager.exclusive()?;
        if manager.indexes.is_declared(property)? {
            return Ok(());
        }
        let seq = manager.current_seq() + 1;
        let vertices = manager.version_store.vertices_at(u64::MAX)?;
        let entries: Vec<_> = expected_entries(property, &vertices).into_iter().collect();

        let mut batch = WriteBatch::default();
        manager.backend.stage_index_declaration(property, &mut batch)?;
        for entry in &entries {
            manager.backend.stage_index_insert(entry, &mut batch)?;
        }
        manager.write_batch(batch)?;

        manager.indexes.declare(property, seq, &entries)?;
        manager.publish(seq);
        info!(%property, backfilled = entries.len(), "Declared index");
        Ok(())
    }

    /// Rebuilds the index on `property` from vertex records.
    ///
    /// Returns how many entries had to be added or removed; zero means the
    /// index already agreed with storage.
    ///
    /// # Errors
    ///
    /// [`GraphError::IndexNotDeclared`] if `property` has no index.
    pub fn reindex(&self, property: &str) -> Result<usize> {
        let manager = &self.manager;
        let _guard = manager.exclusive()?;
        if !manager.indexes.is_declared(property)? {
            return Err(GraphError::IndexNotDeclared(property.to_string()));
        }

        let current_seq = manager.current_seq();
        let vertices = manager.version_store.vertices_at(current_seq)?;
        let expected = expected_entries(property, &vertices);
        let present = manager.indexes.entries_at(property, current_seq)?;

        let changes: Vec<IndexChange> = present
            .difference(&expected)
            .cloned()
            .map(IndexChange::Remove)
            .chain(expected.difference(&present).cloned().map(IndexChange::Insert))
            .collect();
        if changes.is_empty() {
            return Ok(0);
        }

        let seq = current_seq + 1;
        let mut batch = WriteBatch::default();
        for change in &changes {
            match change {
                IndexChange::Insert(entry) => manager.backend.stage_index_insert(entry, &mut batch)?,
                IndexChange::Remove(entry) => manager.backend.stage_index_remove(entry, &mut batch)?,
            }
        }
        manager.write_batch(batch)?;
        manager.indexes.apply(&changes, seq)?;
        manager.publish(seq);
        manager.indexes.prune(&changes, manager.horizon()?)?;

        Ok(changes.len())
    }

    /// Drops every record version no active transaction can still read.
    pub fn vacuum(&self) -> Result<usize> {
        self.manager.vacuum()
    }

    /// Rolls back every open transaction, flushes storage and releases it.
    ///
    /// This closes the store for every clone of the handle. Transactions still
    /// held elsewhere fail with [`GraphError::TransactionClosed`] from then on,
    /// and the directory can be reopened right away.
    pub fn shutdown(self) -> Result<()> {
        let active = self.manager.active_count();
        if active > 0 {
            warn!(active, "Rolling back transactions still open at shutdown");
        }
        self.manager.close()?;
        info!(path = %self.config.storage_directory.display(), "Graph shut down");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn manager(&self) -> &TransactionManager {
        &self.manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::IndexEntry;
    use crate::types::VertexId;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    #[test]
    fn test_reindex_repairs_divergence() {
        let dir = tempdir().unwrap();
        let graph = Graph::open(GraphConfig::new(dir.path()).with_index("name")).unwrap();

        let mut txn = graph.begin().unwrap();
        let id = txn.add_vertex().unwrap();
        txn.set_property(id, "name", "Alice").unwrap();
        txn.commit().unwrap();
        assert_eq!(graph.reindex("name").unwrap(), 0);

        // Corrupt the index behind the engine's back: drop the real posting, add a bogus one.
        let real = IndexEntry {
            property: "name".to_string(),
            value: "Alice".to_string(),
            vertex: id,
        };
        let bogus = IndexEntry {
            property: "name".to_string(),
            value: "Mallory".to_string(),
            vertex: VertexId::new(999),
        };
        let seq = graph.manager().current_seq() + 1;
        graph
            .manager()
            .indexes
            .apply(&[IndexChange::Remove(real), IndexChange::Insert(bogus)], seq)
            .unwrap();
        graph.manager().publish(seq);

        assert_eq!(graph.reindex("name").unwrap(), 2);
        let reader = graph.begin().unwrap();
        assert_eq!(reader.lookup("name", "Alice").unwrap(), BTreeSet::from([id]));
        assert!(reader.lookup("name", "Mallory").unwrap().is_empty());
    }

    #[test]
    fn test_reindex_undeclared_property() {
        let dir = tempdir().unwrap();
        let graph = Graph::open(GraphConfig::new(dir.path())).unwrap();
        assert!(matches!(
            graph.reindex("color").unwrap_err(),
            GraphError::IndexNotDeclared(p) if p == "color"
        ));
    }

    #[test]
    fn test_corrupt_record_makes_storage_unavailable() {
        let dir = tempdir().unwrap();
        {
            let backend = RocksBackend::open(dir.path()).unwrap();
            let db = backend.handle().unwrap();
            let cf = db.cf_handle("vertices").unwrap();
            db.put_cf(cf, 1u64.to_be_bytes(), b"\xff").unwrap();
        }

        let err = Graph::open(GraphConfig::new(dir.path())).unwrap_err();
        assert!(matches!(err, GraphError::StorageUnavailable { .. }));
    }
}
