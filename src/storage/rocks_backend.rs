use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use crate::error::{GraphError, Result};
use crate::types::{Edge, EdgeId, Vertex, VertexId};

const CF_VERTICES: &str = "vertices";
const CF_EDGES: &str = "edges";
const CF_INDICES: &str = "indices";
const CF_META: &str = "meta";

const KEY_NEXT_VERTEX_ID: &[u8] = b"next_vertex_id";
const KEY_NEXT_EDGE_ID: &[u8] = b"next_edge_id";
const INDEX_MARKER_PREFIX: &[u8] = b"index:";

/// One persisted posting of a composite index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexEntry {
    pub property: String,
    pub value: String,
    pub vertex: VertexId,
}

/// RocksDB-based storage backend.
///
/// Every mutation goes through a [`WriteBatch`] staged by the commit path, so a
/// commit lands on disk completely or not at all.
#[derive(Debug)]
pub struct RocksBackend {
    /// The open database. `None` once [`close`](RocksBackend::close) released it.
    db: RwLock<Option<Arc<DB>>>,
    path: PathBuf,
}

impl RocksBackend {
    /// Opens the store at `path`, creating it if the directory does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::StorageUnavailable`] if the path is not a readable
    /// directory or RocksDB refuses to open it.
    pub fn open(path: &Path) -> Result<Self> {
        if path.exists() {
            if !path.is_dir() {
                return Err(GraphError::unavailable(path, "not a directory"));
            }
            std::fs::read_dir(path).map_err(|e| GraphError::unavailable(path, e))?;
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.increase_parallelism(num_cpus::get() as i32);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_VERTICES, Options::default()),
            ColumnFamilyDescriptor::new(CF_EDGES, Options::default()),
            ColumnFamilyDescriptor::new(CF_INDICES, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)
            .map_err(|e| GraphError::unavailable(path, e))?;
        info!("Opened graph storage at {}", path.display());

        Ok(Self {
            db: RwLock::new(Some(Arc::new(db))),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The live database handle, or `StorageUnavailable` after `close`.
    pub(crate) fn handle(&self) -> Result<Arc<DB>> {
        self.db
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| GraphError::unavailable(self.path(), "storage has been shut down"))
    }

    /// Flushes memtables and releases the database. The RocksDB lock file is
    /// freed as soon as in-flight reads drop their handles. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let taken = self
            .db
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(db) = taken {
            db.flush()?;
            info!("Closed graph storage at {}", self.path.display());
        }
        Ok(())
    }

    /// Reads a single vertex record, bypassing any transaction.
    pub fn get_vertex(&self, id: VertexId) -> Result<Option<Vertex>> {
        let db = self.handle()?;
        let cf = column_family(&db, CF_VERTICES)?;
        match db.get_cf(cf, id.as_u64().to_be_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Reads a single edge record, bypassing any transaction.
    pub fn get_edge(&self, id: EdgeId) -> Result<Option<Edge>> {
        let db = self.handle()?;
        let cf = column_family(&db, CF_EDGES)?;
        match db.get_cf(cf, id.as_u64().to_be_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    pub fn stage_vertex(&self, vertex: &Vertex, batch: &mut WriteBatch) -> Result<()> {
        let db = self.handle()?;
        let cf = column_family(&db, CF_VERTICES)?;
        batch.put_cf(cf, vertex.id.as_u64().to_be_bytes(), bincode::serialize(vertex)?);
        Ok(())
    }

    pub fn stage_vertex_delete(&self, id: VertexId, batch: &mut WriteBatch) -> Result<()> {
        let db = self.handle()?;
        let cf = column_family(&db, CF_VERTICES)?;
        batch.delete_cf(cf, id.as_u64().to_be_bytes());
        Ok(())
    }

    pub fn stage_edge(&self, edge: &Edge, batch: &mut WriteBatch) -> Result<()> {
        let db = self.handle()?;
        let cf = column_family(&db, CF_EDGES)?;
        batch.put_cf(cf, edge.id.as_u64().to_be_bytes(), bincode::serialize(edge)?);
        Ok(())
    }

    pub fn stage_edge_delete(&self, id: EdgeId, batch: &mut WriteBatch) -> Result<()> {
        let db = self.handle()?;
        let cf = column_family(&db, CF_EDGES)?;
        batch.delete_cf(cf, id.as_u64().to_be_bytes());
        Ok(())
    }

    pub fn stage_index_insert(&self, entry: &IndexEntry, batch: &mut WriteBatch) -> Result<()> {
        let db = self.handle()?;
        let cf = column_family(&db, CF_INDICES)?;
        batch.put_cf(cf, index_key(entry), b"");
        Ok(())
    }

    pub fn stage_index_remove(&self, entry: &IndexEntry, batch: &mut WriteBatch) -> Result<()> {
        let db = self.handle()?;
        let cf = column_family(&db, CF_INDICES)?;
        batch.delete_cf(cf, index_key(entry));
        Ok(())
    }

    pub fn stage_index_declaration(&self, property: &str, batch: &mut WriteBatch) -> Result<()> {
        let db = self.handle()?;
        let cf = column_family(&db, CF_META)?;
        let mut key = INDEX_MARKER_PREFIX.to_vec();
        key.extend_from_slice(property.as_bytes());
        batch.put_cf(cf, key, b"");
        Ok(())
    }

    /// Records the id high-water marks so ids are never handed out twice.
    pub fn stage_id_counters(
        &self,
        next_vertex_id: u64,
        next_edge_id: u64,
        batch: &mut WriteBatch,
    ) -> Result<()> {
        let db = self.handle()?;
        let cf = column_family(&db, CF_META)?;
        batch.put_cf(cf, KEY_NEXT_VERTEX_ID, bincode::serialize(&next_vertex_id)?);
        batch.put_cf(cf, KEY_NEXT_EDGE_ID, bincode::serialize(&next_edge_id)?);
        Ok(())
    }

    /// Writes a staged batch atomically.
    pub fn write(&self, batch: WriteBatch, sync: bool) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(sync);
        let ops = batch.len();
        self.handle()?.write_opt(batch, &opts)?;
        debug!(ops, sync, "Wrote batch");
        Ok(())
    }

    /// Loads every vertex record. Used to hydrate the in-memory version store.
    pub fn load_vertices(&self) -> Result<Vec<Vertex>> {
        let db = self.handle()?;
        let cf = column_family(&db, CF_VERTICES)?;
        let mut vertices = Vec::new();
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            vertices.push(bincode::deserialize(&value)?);
        }
        Ok(vertices)
    }

    /// Loads every edge record.
    pub fn load_edges(&self) -> Result<Vec<Edge>> {
        let db = self.handle()?;
        let cf = column_family(&db, CF_EDGES)?;
        let mut edges = Vec::new();
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            edges.push(bincode::deserialize(&value)?);
        }
        Ok(edges)
    }

    /// Loads every persisted index posting.
    pub fn load_index_entries(&self) -> Result<Vec<IndexEntry>> {
        let db = self.handle()?;
        let cf = column_family(&db, CF_INDICES)?;
        let mut entries = Vec::new();
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _value) = item?;
            let entry = decode_index_key(&key).ok_or_else(|| {
                GraphError::Serialization(Box::new(bincode::ErrorKind::Custom(
                    "malformed index key".to_string(),
                )))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn load_declared_indexes(&self) -> Result<Vec<String>> {
        let db = self.handle()?;
        let cf = column_family(&db, CF_META)?;
        let mut declared = Vec::new();
        for item in db.prefix_iterator_cf(cf, INDEX_MARKER_PREFIX) {
            let (key, _value) = item?;
            // The prefix iterator only seeks; it does not stop at the end of the range.
            if !key.starts_with(INDEX_MARKER_PREFIX) {
                break;
            }
            let name = String::from_utf8_lossy(&key[INDEX_MARKER_PREFIX.len()..]).into_owned();
            declared.push(name);
        }
        Ok(declared)
    }

    /// Returns `(next_vertex_id, next_edge_id)`, starting both at 1 on a fresh store.
    pub fn load_id_counters(&self) -> Result<(u64, u64)> {
        let db = self.handle()?;
        let cf = column_family(&db, CF_META)?;
        let next_vertex = match db.get_cf(cf, KEY_NEXT_VERTEX_ID)? {
            Some(data) => bincode::deserialize(&data)?,
            None => 1,
        };
        let next_edge = match db.get_cf(cf, KEY_NEXT_EDGE_ID)? {
            Some(data) => bincode::deserialize(&data)?,
            None => 1,
        };
        Ok((next_vertex, next_edge))
    }
}

fn column_family<'a>(db: &'a DB, name: &'static str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| GraphError::ColumnFamily(name.to_string()))
}

// Key layout: len(property) ++ property ++ len(value) ++ value ++ vertex_id.
// Length prefixes keep each property in its own contiguous key range.
fn index_key(entry: &IndexEntry) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + entry.property.len() + entry.value.len());
    key.extend_from_slice(&(entry.property.len() as u32).to_be_bytes());
    key.extend_from_slice(entry.property.as_bytes());
    key.extend_from_slice(&(entry.value.len() as u32).to_be_bytes());
    key.extend_from_slice(entry.value.as_bytes());
    key.extend_from_slice(&entry.vertex.as_u64().to_be_bytes());
    key
}

fn decode_index_key(key: &[u8]) -> Option<IndexEntry> {
    let (property, rest) = take_prefixed(key)?;
    let (value, rest) = take_prefixed(rest)?;
    let vertex = u64::from_be_bytes(rest.try_into().ok()?);
    Some(IndexEntry {
        property,
        value,
        vertex: VertexId::new(vertex),
    })
}

fn take_prefixed(bytes: &[u8]) -> Option<(String, &[u8])> {
    let len = u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?) as usize;
    let body = bytes.get(4..4 + len)?;
    let text = String::from_utf8(body.to_vec()).ok()?;
    Some((text, &bytes[4 + len..]))
}
