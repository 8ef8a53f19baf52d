use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{GraphError, Result};
use crate::types::{Edge, EdgeId, Vertex, VertexId};

pub(crate) fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|e| GraphError::Transaction(format!("Read lock failed: {}", e)))
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|e| GraphError::Transaction(format!("Write lock failed: {}", e)))
}

/// One committed state of a record. A `None` record marks a deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct Version<T> {
    /// Commit sequence that produced this version.
    pub seq: u64,
    /// Last commit sequence that changed the properties or existence.
    pub props_seq: u64,
    pub record: Option<T>,
}

/// All versions of one record still visible to some snapshot, oldest first.
#[derive(Debug)]
struct Chain<T> {
    versions: Vec<Version<T>>,
}

impl<T> Default for Chain<T> {
    fn default() -> Self {
        Self {
            versions: Vec::new(),
        }
    }
}

impl<T> Chain<T> {
    fn at(&self, seq: u64) -> Option<&Version<T>> {
        self.versions.iter().rev().find(|v| v.seq <= seq)
    }

    fn latest(&self) -> Option<&Version<T>> {
        self.versions.last()
    }

    fn push(&mut self, seq: u64, record: Option<T>, props_changed: bool) {
        let props_seq = match self.latest() {
            Some(prev) if !props_changed => prev.props_seq,
            _ => seq,
        };
        self.versions.push(Version {
            seq,
            props_seq,
            record,
        });
    }

    /// Drops versions that no snapshot at or after `horizon` can see.
    /// Returns true when only an old tombstone is left and the chain can go.
    fn prune(&mut self, horizon: u64) -> bool {
        if let Some(pos) = self.versions.iter().rposition(|v| v.seq <= horizon) {
            self.versions.drain(..pos);
        }
        matches!(self.versions.as_slice(), [only] if only.record.is_none() && only.seq <= horizon)
    }
}

fn visible_at<K, T>(chains: &HashMap<K, Chain<T>>, id: &K, seq: u64) -> Option<T>
where
    K: Eq + Hash,
    T: Clone,
{
    chains
        .get(id)
        .and_then(|chain| chain.at(seq))
        .and_then(|version| version.record.clone())
}

fn prune_chains<K: Eq + Hash>(
    chains: &mut HashMap<K, Chain<impl Sized>>,
    ids: impl IntoIterator<Item = K>,
    horizon: u64,
) {
    for id in ids {
        let dead = chains.get_mut(&id).is_some_and(|chain| chain.prune(horizon));
        if dead {
            chains.remove(&id);
        }
    }
}

/// VersionStore keeps every committed version of vertices and edges that an
/// active snapshot may still read.
#[derive(Debug, Default)]
pub struct VersionStore {
    vertices: RwLock<HashMap<VertexId, Chain<Vertex>>>,
    edges: RwLock<HashMap<EdgeId, Chain<Edge>>>,
}

impl VersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with records loaded from disk. They become visible at sequence 0.
    pub fn hydrate(&self, vertices: Vec<Vertex>, edges: Vec<Edge>) -> Result<()> {
        let mut vertex_map = write(&self.vertices)?;
        for vertex in vertices {
            vertex_map
                .entry(vertex.id)
                .or_default()
                .push(0, Some(vertex), true);
        }
        let mut edge_map = write(&self.edges)?;
        for edge in edges {
            edge_map.entry(edge.id).or_default().push(0, Some(edge), true);
        }
        Ok(())
    }

    /// The vertex as a snapshot taken at `seq` sees it.
    pub fn vertex_at(&self, id: VertexId, seq: u64) -> Result<Option<Vertex>> {
        Ok(visible_at(&*read(&self.vertices)?, &id, seq))
    }

    pub fn edge_at(&self, id: EdgeId, seq: u64) -> Result<Option<Edge>> {
        Ok(visible_at(&*read(&self.edges)?, &id, seq))
    }

    pub fn latest_vertex(&self, id: VertexId) -> Result<Option<Vertex>> {
        Ok(read(&self.vertices)?
            .get(&id)
            .and_then(|chain| chain.latest())
            .and_then(|v| v.record.clone()))
    }

    pub fn latest_edge(&self, id: EdgeId) -> Result<Option<Edge>> {
        Ok(read(&self.edges)?
            .get(&id)
            .and_then(|chain| chain.latest())
            .and_then(|v| v.record.clone()))
    }

    /// Every vertex alive at `seq`, ordered by id.
    pub fn vertices_at(&self, seq: u64) -> Result<Vec<Vertex>> {
        let map = read(&self.vertices)?;
        let mut live: Vec<Vertex> = map
            .values()
            .filter_map(|chain| chain.at(seq).and_then(|v| v.record.clone()))
            .collect();
        live.sort_by_key(|v| v.id);
        Ok(live)
    }

    /// True if anything about the vertex, adjacency included, changed after `seq`.
    /// A vertex with no history at all counts as changed.
    pub fn vertex_changed_since(&self, id: VertexId, seq: u64) -> Result<bool> {
        Ok(read(&self.vertices)?
            .get(&id)
            .and_then(|chain| chain.latest())
            .is_none_or(|latest| latest.seq > seq))
    }

    /// True if the vertex's properties or existence changed after `seq`.
    pub fn vertex_props_changed_since(&self, id: VertexId, seq: u64) -> Result<bool> {
        Ok(read(&self.vertices)?
            .get(&id)
            .and_then(|chain| chain.latest())
            .is_none_or(|latest| latest.props_seq > seq))
    }

    pub fn vertex_exists(&self, id: VertexId) -> Result<bool> {
        Ok(read(&self.vertices)?
            .get(&id)
            .and_then(|chain| chain.latest())
            .is_some_and(|latest| latest.record.is_some()))
    }

    pub fn edge_changed_since(&self, id: EdgeId, seq: u64) -> Result<bool> {
        Ok(read(&self.edges)?
            .get(&id)
            .and_then(|chain| chain.latest())
            .is_none_or(|latest| latest.seq > seq))
    }

    /// Appends the versions produced by one commit.
    pub fn install(
        &self,
        seq: u64,
        vertices: Vec<(VertexId, Option<Vertex>, bool)>,
        edges: Vec<(EdgeId, Option<Edge>)>,
    ) -> Result<()> {
        let mut vertex_map = write(&self.vertices)?;
        for (id, record, props_changed) in vertices {
            vertex_map.entry(id).or_default().push(seq, record, props_changed);
        }
        let mut edge_map = write(&self.edges)?;
        for (id, record) in edges {
            edge_map.entry(id).or_default().push(seq, record, true);
        }
        Ok(())
    }

    /// Garbage-collects history of the given records below `horizon`.
    pub fn prune(
        &self,
        horizon: u64,
        vertex_ids: impl IntoIterator<Item = VertexId>,
        edge_ids: impl IntoIterator<Item = EdgeId>,
    ) -> Result<()> {
        prune_chains(&mut *write(&self.vertices)?, vertex_ids, horizon);
        prune_chains(&mut *write(&self.edges)?, edge_ids, horizon);
        Ok(())
    }

    /// Garbage-collects the history of every record. Returns how many chains were dropped.
    pub fn prune_all(&self, horizon: u64) -> Result<usize> {
        let mut vertex_map = write(&self.vertices)?;
        let mut edge_map = write(&self.edges)?;
        let before = vertex_map.len() + edge_map.len();
        vertex_map.retain(|_, chain| !chain.prune(horizon));
        edge_map.retain(|_, chain| !chain.prune(horizon));
        Ok(before - vertex_map.len() - edge_map.len())
    }

    #[cfg(test)]
    fn chain_len(&self, id: VertexId) -> usize {
        self.vertices
            .read()
            .unwrap()
            .get(&id)
            .map_or(0, |chain| chain.versions.len())
    }
}
