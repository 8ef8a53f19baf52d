use chrono::{DateTime, Utc};
use rocksdb::WriteBatch;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::indices::{IndexChange, IndexManager, index_delta};
use super::neighbors::Neighbors;
use super::versioning::VersionStore;
use crate::error::{GraphError, Result};
use crate::storage::RocksBackend;
use crate::types::vertex::RecordMetadata;
use crate::types::{Direction, Edge, EdgeId, ElementId, TransactionId, Vertex, VertexId};

/// Lifecycle of a transaction. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// One entry of a transaction's mutation log.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateVertex(VertexId),
    CreateEdge {
        id: EdgeId,
        source: VertexId,
        target: VertexId,
        label: String,
    },
    SetProperty {
        element: ElementId,
        key: String,
        value: String,
    },
    RemoveProperty {
        element: ElementId,
        key: String,
    },
    DeleteEdge(EdgeId),
    DeleteVertex(VertexId),
}

/// A Transaction is a "workspace" for a set of atomic changes to the graph.
///
/// Reads see the graph as committed when the transaction began, plus the
/// transaction's own writes. Nothing becomes visible to anyone else until
/// [`commit`](Transaction::commit) succeeds. Dropping an active transaction
/// rolls it back.
#[derive(Debug)]
pub struct Transaction {
    /// Unique identifier, also the key in the manager's active set.
    id: TransactionId,
    /// Commit sequence of the snapshot every read is served from.
    start_seq: u64,
    /// Wall-clock time of `begin`, for diagnostics only.
    started_at: DateTime<Utc>,
    state: TransactionState,
    /// Shared coordinator; commits and snapshot reads go through it.
    manager: Arc<TransactionManager>,
    /// Every mutation in call order. Replayed over the latest state at commit.
    log: Vec<Mutation>,
    /// Private copies of every vertex this transaction touched. `None` means deleted.
    vertices: HashMap<VertexId, Option<Vertex>>,
    /// Same as `vertices`, for edges.
    edges: HashMap<EdgeId, Option<Edge>>,
    /// Vertices born in this transaction. They cannot conflict with anyone.
    created_vertices: HashSet<VertexId>,
    /// Edges born in this transaction.
    created_edges: HashSet<EdgeId>,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// The commit sequence this transaction's snapshot was taken at.
    pub fn start_seq(&self) -> u64 {
        self.start_seq
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn pending_mutations(&self) -> &[Mutation] {
        &self.log
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() && !self.manager.is_closed() {
            Ok(())
        } else {
            Err(GraphError::TransactionClosed(self.id))
        }
    }

    pub(crate) fn vertex_view(&self, id: VertexId) -> Result<Option<Vertex>> {
        match self.vertices.get(&id) {
            Some(local) => Ok(local.clone()),
            None => self.manager.version_store.vertex_at(id, self.start_seq),
        }
    }

    pub(crate) fn edge_view(&self, id: EdgeId) -> Result<Option<Edge>> {
        match self.edges.get(&id) {
            Some(local) => Ok(local.clone()),
            None => self.manager.version_store.edge_at(id, self.start_seq),
        }
    }

    fn vertex_mut(&mut self, id: VertexId) -> Result<&mut Vertex> {
        if !self.vertices.contains_key(&id) {
            let snapshot = self.manager.version_store.vertex_at(id, self.start_seq)?;
            self.vertices.insert(id, snapshot);
        }
        self.vertices
            .get_mut(&id)
            .and_then(Option::as_mut)
            .ok_or(GraphError::VertexNotFound(id))
    }

    fn edge_mut(&mut self, id: EdgeId) -> Result<&mut Edge> {
        if !self.edges.contains_key(&id) {
            let snapshot = self.manager.version_store.edge_at(id, self.start_seq)?;
            self.edges.insert(id, snapshot);
        }
        self.edges
            .get_mut(&id)
            .and_then(Option::as_mut)
            .ok_or(GraphError::EdgeNotFound(id))
    }

    fn properties_mut(&mut self, element: ElementId) -> Result<&mut BTreeMap<String, String>> {
        match element {
            ElementId::Vertex(id) => Ok(&mut self.vertex_mut(id)?.properties),
            ElementId::Edge(id) => Ok(&mut self.edge_mut(id)?.properties),
        }
    }

    /// Creates an empty vertex and returns its freshly allocated id.
    pub fn add_vertex(&mut self) -> Result<VertexId> {
        self.ensure_active()?;
        let id = self.manager.allocate_vertex_id();
        self.vertices.insert(id, Some(Vertex::new(id)));
        self.created_vertices.insert(id);
        self.log.push(Mutation::CreateVertex(id));
        Ok(id)
    }

    /// Creates a directed edge `source -> target`.
    ///
    /// # Errors
    ///
    /// [`GraphError::VertexNotFound`] if either endpoint is not visible to this transaction.
    pub fn add_edge(
        &mut self,
        source: VertexId,
        target: VertexId,
        label: impl Into<String>,
    ) -> Result<EdgeId> {
        self.ensure_active()?;
        // Check both endpoints before allocating or touching anything.
        for endpoint in [source, target] {
            if self.vertex_view(endpoint)?.is_none() {
                return Err(GraphError::VertexNotFound(endpoint));
            }
        }

        let label = label.into();
        let id = self.manager.allocate_edge_id();
        self.vertex_mut(source)?.out_edges.insert(id);
        self.vertex_mut(target)?.in_edges.insert(id);
        self.edges
            .insert(id, Some(Edge::new(id, source, target, label.clone())));
        self.created_edges.insert(id);
        self.log.push(Mutation::CreateEdge {
            id,
            source,
            target,
            label,
        });
        Ok(id)
    }

    pub fn set_property(
        &mut self,
        element: impl Into<ElementId>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.ensure_active()?;
        let element = element.into();
        let (key, value) = (key.into(), value.into());
        self.properties_mut(element)?
            .insert(key.clone(), value.clone());
        self.log.push(Mutation::SetProperty {
            element,
            key,
            value,
        });
        Ok(())
    }

    pub fn get_property(&self, element: impl Into<ElementId>, key: &str) -> Result<Option<String>> {
        self.ensure_active()?;
        let properties = match element.into() {
            ElementId::Vertex(id) => {
                self.vertex_view(id)?
                    .ok_or(GraphError::VertexNotFound(id))?
                    .properties
            }
            ElementId::Edge(id) => {
                self.edge_view(id)?
                    .ok_or(GraphError::EdgeNotFound(id))?
                    .properties
            }
        };
        Ok(properties.get(key).cloned())
    }

    /// Removes a property, returning its previous value.
    pub fn remove_property(
        &mut self,
        element: impl Into<ElementId>,
        key: &str,
    ) -> Result<Option<String>> {
        self.ensure_active()?;
        let element = element.into();
        let previous = self.properties_mut(element)?.remove(key);
        if previous.is_some() {
            self.log.push(Mutation::RemoveProperty {
                element,
                key: key.to_string(),
            });
        }
        Ok(previous)
    }

    pub fn delete_edge(&mut self, id: EdgeId) -> Result<()> {
        self.ensure_active()?;
        let edge = self.edge_view(id)?.ok_or(GraphError::EdgeNotFound(id))?;
        self.vertex_mut(edge.source)?.out_edges.remove(&id);
        self.vertex_mut(edge.target)?.in_edges.remove(&id);
        self.edges.insert(id, None);
        self.log.push(Mutation::DeleteEdge(id));
        Ok(())
    }

    /// Deletes a vertex together with every edge touching it.
    pub fn delete_vertex(&mut self, id: VertexId) -> Result<()> {
        self.ensure_active()?;
        let vertex = self.vertex_view(id)?.ok_or(GraphError::VertexNotFound(id))?;
        for edge_id in vertex.incident_edges() {
            self.delete_edge(edge_id)?;
        }
        self.vertices.insert(id, None);
        self.log.push(Mutation::DeleteVertex(id));
        Ok(())
    }

    pub fn vertex(&self, id: VertexId) -> Result<Option<Vertex>> {
        self.ensure_active()?;
        self.vertex_view(id)
    }

    pub fn edge(&self, id: EdgeId) -> Result<Option<Edge>> {
        self.ensure_active()?;
        self.edge_view(id)
    }

    /// Every vertex visible to this transaction, ordered by id.
    pub fn vertices(&self) -> Result<Vec<Vertex>> {
        self.ensure_active()?;
        let mut visible: BTreeMap<VertexId, Vertex> = self
            .manager
            .version_store
            .vertices_at(self.start_seq)?
            .into_iter()
            .map(|v| (v.id, v))
            .collect();
        for (id, local) in &self.vertices {
            match local {
                Some(vertex) => visible.insert(*id, vertex.clone()),
                None => visible.remove(id),
            };
        }
        Ok(visible.into_values().collect())
    }

    /// Ids of the vertices whose `property` equals `value`.
    ///
    /// Properties without a declared index always yield the empty set.
    pub fn lookup(&self, property: &str, value: &str) -> Result<BTreeSet<VertexId>> {
        self.ensure_active()?;
        let indexes = &self.manager.indexes;
        if !indexes.is_visible(property, self.start_seq)? {
            return Ok(BTreeSet::new());
        }
        let mut hits = indexes.lookup(property, value, self.start_seq)?;
        for (id, local) in &self.vertices {
            match local {
                Some(vertex) if vertex.property(property) == Some(value) => hits.insert(*id),
                _ => hits.remove(id),
            };
        }
        Ok(hits)
    }

    /// The lowest-id vertex whose `property` equals `value`, if any.
    pub fn vertex_by_property(&self, property: &str, value: &str) -> Result<Option<Vertex>> {
        match self.lookup(property, value)?.first() {
            Some(id) => self.vertex_view(*id),
            None => Ok(None),
        }
    }

    /// Targets of the outgoing edges of `vertex` labeled `label`.
    pub fn neighbors(&self, vertex: VertexId, label: &str) -> Result<Neighbors<'_>> {
        self.traverse(vertex, Direction::Out, Some(label))
    }

    /// Vertices one hop away from `vertex`, optionally restricted to one label.
    pub fn traverse(
        &self,
        vertex: VertexId,
        direction: Direction,
        label: Option<&str>,
    ) -> Result<Neighbors<'_>> {
        self.ensure_active()?;
        let origin = self
            .vertex_view(vertex)?
            .ok_or(GraphError::VertexNotFound(vertex))?;
        let edges: Vec<EdgeId> = match direction {
            Direction::Out => origin.out_edges.iter().copied().collect(),
            Direction::In => origin.in_edges.iter().copied().collect(),
            Direction::Both => origin.incident_edges().into_iter().collect(),
        };
        Ok(Neighbors::new(self, vertex, edges, label.map(str::to_string)))
    }

    pub fn edges_of(
        &self,
        vertex: VertexId,
        direction: Direction,
        label: Option<&str>,
    ) -> Result<Vec<Edge>> {
        let neighbors = self.traverse(vertex, direction, label)?;
        let mut edges = Vec::new();
        for id in neighbors.edge_ids() {
            if let Some(edge) = self.edge_view(*id)? {
                if label.is_none_or(|l| edge.label == l) {
                    edges.push(edge);
                }
            }
        }
        Ok(edges)
    }

    /// Applies every pending mutation atomically.
    ///
    /// # Errors
    ///
    /// [`GraphError::TransactionConflict`] if another transaction committed an
    /// overlapping change after this one began. The transaction is rolled back
    /// either way on failure; retry with a fresh one.
    pub fn commit(&mut self) -> Result<()> {
        if self.is_active() && self.manager.is_closed() {
            self.rollback()?;
            return Err(GraphError::TransactionClosed(self.id));
        }
        self.ensure_active()?;
        let manager = Arc::clone(&self.manager);
        let result = if self.log.is_empty() {
            Ok(manager.current_seq())
        } else {
            manager.commit(self)
        };
        manager.release(self.id);

        match result {
            Ok(seq) => {
                self.state = TransactionState::Committed;
                debug!(transaction = %self.id, seq, mutations = self.log.len(), "Committed");
                Ok(())
            }
            Err(e) => {
                self.discard();
                self.state = TransactionState::RolledBack;
                Err(e)
            }
        }
    }

    /// Discards every pending mutation. Calling this on a finished transaction is a no-op.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        self.discard();
        self.manager.release(self.id);
        self.state = TransactionState::RolledBack;
        debug!(transaction = %self.id, "Rolled back");
        Ok(())
    }

    fn discard(&mut self) {
        self.log.clear();
        self.vertices.clear();
        self.edges.clear();
        self.created_vertices.clear();
        self.created_edges.clear();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_active() {
            let _ = self.rollback();
        }
    }
}

/// A record as it was before the commit and as the commit leaves it.
#[derive(Debug)]
struct Staged<T> {
    before: Option<T>,
    after: Option<T>,
}

impl<T: Clone> Staged<T> {
    fn existing(before: Option<T>) -> Self {
        Self {
            after: before.clone(),
            before,
        }
    }

    fn is_noop(&self) -> bool {
        self.before.is_none() && self.after.is_none()
    }
}

/// The result of replaying a mutation log over the latest committed state.
#[derive(Debug, Default)]
struct StagedCommit {
    vertices: BTreeMap<VertexId, Staged<Vertex>>,
    edges: BTreeMap<EdgeId, Staged<Edge>>,
}

impl StagedCommit {
    fn vertex(&mut self, id: VertexId, store: &VersionStore) -> Result<&mut Option<Vertex>> {
        match self.vertices.entry(id) {
            Entry::Occupied(slot) => Ok(&mut slot.into_mut().after),
            Entry::Vacant(slot) => {
                let before = store.latest_vertex(id)?;
                Ok(&mut slot.insert(Staged::existing(before)).after)
            }
        }
    }

    fn edge(&mut self, id: EdgeId, store: &VersionStore) -> Result<&mut Option<Edge>> {
        match self.edges.entry(id) {
            Entry::Occupied(slot) => Ok(&mut slot.into_mut().after),
            Entry::Vacant(slot) => {
                let before = store.latest_edge(id)?;
                Ok(&mut slot.insert(Staged::existing(before)).after)
            }
        }
    }

    fn properties(
        &mut self,
        element: ElementId,
        store: &VersionStore,
    ) -> Result<&mut BTreeMap<String, String>> {
        match element {
            ElementId::Vertex(id) => Ok(&mut self
                .vertex(id, store)?
                .as_mut()
                .ok_or(GraphError::VertexNotFound(id))?
                .properties),
            ElementId::Edge(id) => Ok(&mut self
                .edge(id, store)?
                .as_mut()
                .ok_or(GraphError::EdgeNotFound(id))?
                .properties),
        }
    }

    fn apply(&mut self, mutation: &Mutation, store: &VersionStore, now: DateTime<Utc>) -> Result<()> {
        match mutation {
            Mutation::CreateVertex(id) => {
                let mut vertex = Vertex::new(*id);
                vertex.metadata = RecordMetadata::at(now);
                self.vertices.insert(
                    *id,
                    Staged {
                        before: None,
                        after: Some(vertex),
                    },
                );
            }
            Mutation::CreateEdge {
                id,
                source,
                target,
                label,
            } => {
                self.vertex(*source, store)?
                    .as_mut()
                    .ok_or(GraphError::VertexNotFound(*source))?
                    .out_edges
                    .insert(*id);
                self.vertex(*target, store)?
                    .as_mut()
                    .ok_or(GraphError::VertexNotFound(*target))?
                    .in_edges
                    .insert(*id);
                let mut edge = Edge::new(*id, *source, *target, label.clone());
                edge.metadata = RecordMetadata::at(now);
                self.edges.insert(
                    *id,
                    Staged {
                        before: None,
                        after: Some(edge),
                    },
                );
            }
            Mutation::SetProperty {
                element,
                key,
                value,
            } => {
                self.properties(*element, store)?
                    .insert(key.clone(), value.clone());
            }
            Mutation::RemoveProperty { element, key } => {
                self.properties(*element, store)?.remove(key);
            }
            Mutation::DeleteEdge(id) => {
                let edge = self
                    .edge(*id, store)?
                    .take()
                    .ok_or(GraphError::EdgeNotFound(*id))?;
                if let Some(source) = self.vertex(edge.source, store)?.as_mut() {
                    source.out_edges.remove(id);
                }
                if let Some(target) = self.vertex(edge.target, store)?.as_mut() {
                    target.in_edges.remove(id);
                }
            }
            Mutation::DeleteVertex(id) => {
                *self.vertex(*id, store)? = None;
            }
        }
        Ok(())
    }

    /// Stamps metadata on every record the commit actually changed.
    fn touch(&mut self, now: DateTime<Utc>) {
        for staged in self.vertices.values_mut() {
            if let (Some(before), Some(after)) = (&staged.before, &mut staged.after) {
                if before != after {
                    after.metadata.touch(now);
                }
            }
        }
        for staged in self.edges.values_mut() {
            if let (Some(before), Some(after)) = (&staged.before, &mut staged.after) {
                if before != after {
                    after.metadata.touch(now);
                }
            }
        }
    }

    fn vertex_versions(&self) -> Vec<(VertexId, Option<Vertex>, bool)> {
        self.vertices
            .iter()
            .filter(|(_, s)| !s.is_noop())
            .map(|(id, s)| {
                let props_changed = s.before.as_ref().map(|v| &v.properties)
                    != s.after.as_ref().map(|v| &v.properties);
                (*id, s.after.clone(), props_changed)
            })
            .collect()
    }

    fn edge_versions(&self) -> Vec<(EdgeId, Option<Edge>)> {
        self.edges
            .iter()
            .filter(|(_, s)| !s.is_noop())
            .map(|(id, s)| (*id, s.after.clone()))
            .collect()
    }
}

/// TransactionManager orchestrates all transactions and handles MVCC.
///
/// Commits are serialized by a single commit lock; each successful commit
/// advances a logical clock that snapshots are taken against.
#[derive(Debug)]
pub struct TransactionManager {
    /// Durable storage. Every commit ends in one batch written here.
    pub(crate) backend: Arc<RocksBackend>,
    /// In-memory history of committed records, read by snapshots.
    pub(crate) version_store: VersionStore,
    /// Declared composite indexes with versioned postings.
    pub(crate) indexes: IndexManager,
    /// Active transactions and the sequence their snapshot was taken at.
    active_transactions: RwLock<HashMap<TransactionId, u64>>,
    /// Sequence of the newest published commit.
    clock: AtomicU64,
    /// Serializes everything that changes durable state.
    commit_lock: Mutex<()>,
    /// Next vertex id to hand out. Never decreases.
    next_vertex_id: AtomicU64,
    /// Next edge id to hand out. Never decreases.
    next_edge_id: AtomicU64,
    /// Fsync the WAL on every commit.
    sync_writes: bool,
    /// Set once by shutdown. Open transactions can no longer read or commit.
    closed: AtomicBool,
    /// Makes the next batch write fail, to simulate a crash before the write.
    #[cfg(test)]
    fail_next_write: AtomicBool,
}

impl TransactionManager {
    /// Creates a manager whose in-memory state is hydrated from `backend`.
    pub fn new(backend: Arc<RocksBackend>, sync_writes: bool) -> Result<Self> {
        let vertices = backend.load_vertices()?;
        let edges = backend.load_edges()?;
        let (stored_next_vertex, stored_next_edge) = backend.load_id_counters()?;

        // Never hand out an id at or below one already on disk.
        let next_vertex = vertices
            .iter()
            .map(|v| v.id.as_u64() + 1)
            .fold(stored_next_vertex, u64::max);
        let next_edge = edges
            .iter()
            .map(|e| e.id.as_u64() + 1)
            .fold(stored_next_edge, u64::max);

        let indexes = IndexManager::new();
        let entries = backend.load_index_entries()?;
        for property in backend.load_declared_indexes()? {
            let seeded: Vec<_> = entries
                .iter()
                .filter(|e| e.property == property)
                .cloned()
                .collect();
            indexes.declare(&property, 0, &seeded)?;
        }

        let version_store = VersionStore::new();
        debug!(
            vertices = vertices.len(),
            edges = edges.len(),
            index_entries = entries.len(),
            "Hydrated version store"
        );
        version_store.hydrate(vertices, edges)?;

        Ok(Self {
            backend,
            version_store,
            indexes,
            active_transactions: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
            next_vertex_id: AtomicU64::new(next_vertex),
            next_edge_id: AtomicU64::new(next_edge),
            sync_writes,
            closed: AtomicBool::new(false),
            #[cfg(test)]
            fail_next_write: AtomicBool::new(false),
        })
    }

    /// Begins a new transaction and registers it as active.
    pub fn begin(self: &Arc<Self>) -> Result<Transaction> {
        if self.is_closed() {
            return Err(GraphError::unavailable(
                self.backend.path(),
                "graph has been shut down",
            ));
        }
        let mut active = self
            .active_transactions
            .write()
            .map_err(|e| GraphError::Transaction(format!("Lock failed: {}", e)))?;
        // Read the clock under the lock so pruning never races a new snapshot.
        let start_seq = self.clock.load(Ordering::SeqCst);
        let id = Uuid::new_v4();
        active.insert(id, start_seq);
        drop(active);

        debug!(transaction = %id, start_seq, "Began transaction");
        Ok(Transaction {
            id,
            start_seq,
            started_at: Utc::now(),
            state: TransactionState::Active,
            manager: Arc::clone(self),
            log: Vec::new(),
            vertices: HashMap::new(),
            edges: HashMap::new(),
            created_vertices: HashSet::new(),
            created_edges: HashSet::new(),
        })
    }

    pub fn current_seq(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.active_transactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn release(&self, id: TransactionId) {
        self.active_transactions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn allocate_vertex_id(&self) -> VertexId {
        VertexId::new(self.next_vertex_id.fetch_add(1, Ordering::SeqCst))
    }

    fn allocate_edge_id(&self) -> EdgeId {
        EdgeId::new(self.next_edge_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Takes the commit lock. Everything that changes durable state holds it.
    /// Fails once the graph has been shut down.
    pub(crate) fn exclusive(&self) -> Result<MutexGuard<'_, ()>> {
        let guard = self.lock_commits()?;
        if self.is_closed() {
            return Err(GraphError::unavailable(
                self.backend.path(),
                "graph has been shut down",
            ));
        }
        Ok(guard)
    }

    fn lock_commits(&self) -> Result<MutexGuard<'_, ()>> {
        self.commit_lock
            .lock()
            .map_err(|e| GraphError::Transaction(format!("Commit lock failed: {}", e)))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops the manager for good. Waits for a running commit, forgets every
    /// open transaction and releases storage. Closing twice is a no-op.
    pub(crate) fn close(&self) -> Result<()> {
        let _guard = self.lock_commits()?;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.active_transactions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.backend.close()
    }

    /// Makes everything installed at `seq` visible to new snapshots.
    /// Callers must hold the commit lock.
    pub(crate) fn publish(&self, seq: u64) {
        self.clock.store(seq, Ordering::SeqCst);
    }

    /// The oldest snapshot any active transaction may still read.
    pub(crate) fn horizon(&self) -> Result<u64> {
        let active = self
            .active_transactions
            .read()
            .map_err(|e| GraphError::Transaction(format!("Lock failed: {}", e)))?;
        Ok(active
            .values()
            .copied()
            .min()
            .unwrap_or_else(|| self.clock.load(Ordering::SeqCst)))
    }

    pub(crate) fn stage_id_counters(&self, batch: &mut WriteBatch) -> Result<()> {
        self.backend.stage_id_counters(
            self.next_vertex_id.load(Ordering::SeqCst),
            self.next_edge_id.load(Ordering::SeqCst),
            batch,
        )
    }

    pub(crate) fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        #[cfg(test)]
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(GraphError::Transaction(
                "injected failure before write".to_string(),
            ));
        }
        self.backend.write(batch, self.sync_writes)
    }

    /// Validates and applies a transaction, returning its commit sequence.
    fn commit(&self, transaction: &Transaction) -> Result<u64> {
        let _guard = self.exclusive()?;

        // --- PHASE 1: VALIDATION ---
        self.validate_transaction(transaction)?;

        // --- PHASE 2: REPLAY & PERSIST ---
        let seq = self.current_seq() + 1;
        let now = Utc::now();
        let mut staged = StagedCommit::default();
        for mutation in &transaction.log {
            staged.apply(mutation, &self.version_store, now)?;
        }
        staged.touch(now);

        let declared = self.indexes.declared()?;
        let index_changes: Vec<IndexChange> = staged
            .vertices
            .iter()
            .flat_map(|(id, s)| index_delta(&declared, *id, s.before.as_ref(), s.after.as_ref()))
            .collect();

        let mut batch = WriteBatch::default();
        for (id, s) in &staged.vertices {
            match (&s.before, &s.after) {
                (_, Some(vertex)) => self.backend.stage_vertex(vertex, &mut batch)?,
                (Some(_), None) => self.backend.stage_vertex_delete(*id, &mut batch)?,
                (None, None) => {}
            }
        }
        for (id, s) in &staged.edges {
            match (&s.before, &s.after) {
                (_, Some(edge)) => self.backend.stage_edge(edge, &mut batch)?,
                (Some(_), None) => self.backend.stage_edge_delete(*id, &mut batch)?,
                (None, None) => {}
            }
        }
        for change in &index_changes {
            match change {
                IndexChange::Insert(entry) => self.backend.stage_index_insert(entry, &mut batch)?,
                IndexChange::Remove(entry) => self.backend.stage_index_remove(entry, &mut batch)?,
            }
        }
        self.stage_id_counters(&mut batch)?;
        self.write_batch(batch)?;

        // --- PHASE 3: PUBLISH ---
        self.version_store
            .install(seq, staged.vertex_versions(), staged.edge_versions())?;
        self.indexes.apply(&index_changes, seq)?;
        self.publish(seq);

        // --- PHASE 4: CLEANUP ---
        self.release(transaction.id);
        let horizon = self.horizon()?;
        self.version_store.prune(
            horizon,
            staged.vertices.keys().copied(),
            staged.edges.keys().copied(),
        )?;
        self.indexes.prune(&index_changes, horizon)?;

        Ok(seq)
    }

    /// The "First Committer Wins" conflict detection logic.
    fn validate_transaction(&self, transaction: &Transaction) -> Result<()> {
        let start = transaction.start_seq;
        let store = &self.version_store;
        let preexisting_vertex = |id: &VertexId| !transaction.created_vertices.contains(id);
        let preexisting_edge = |id: &EdgeId| !transaction.created_edges.contains(id);

        for mutation in &transaction.log {
            let conflict = match mutation {
                Mutation::CreateVertex(_) => None,
                Mutation::CreateEdge { source, target, .. } => {
                    let mut missing = None;
                    for endpoint in [source, target] {
                        if preexisting_vertex(endpoint) && !store.vertex_exists(*endpoint)? {
                            missing = Some(format!("endpoint {} was deleted", endpoint));
                            break;
                        }
                    }
                    missing
                }
                Mutation::SetProperty { element, .. } | Mutation::RemoveProperty { element, .. } => {
                    match element {
                        ElementId::Vertex(id) => (preexisting_vertex(id)
                            && store.vertex_props_changed_since(*id, start)?)
                        .then(|| format!("vertex {} was modified", id)),
                        ElementId::Edge(id) => (preexisting_edge(id)
                            && store.edge_changed_since(*id, start)?)
                        .then(|| format!("edge {} was modified", id)),
                    }
                }
                Mutation::DeleteEdge(id) => (preexisting_edge(id)
                    && store.edge_changed_since(*id, start)?)
                .then(|| format!("edge {} was modified", id)),
                Mutation::DeleteVertex(id) => (preexisting_vertex(id)
                    && store.vertex_changed_since(*id, start)?)
                .then(|| format!("vertex {} was modified", id)),
            };

            if let Some(reason) = conflict {
                warn!(transaction = %transaction.id, %reason, "Commit conflict");
                return Err(GraphError::TransactionConflict(reason));
            }
        }
        Ok(())
    }

    /// Garbage-collects history no active snapshot can read. Returns dropped record chains.
    pub fn vacuum(&self) -> Result<usize> {
        let _guard = self.exclusive()?;
        let horizon = self.horizon()?;
        let dropped = self.version_store.prune_all(horizon)?;
        self.indexes.prune_all(horizon)?;
        Ok(dropped)
    }

    #[cfg(test)]
    pub(crate) fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path) -> Arc<TransactionManager> {
        let backend = Arc::new(RocksBackend::open(dir).unwrap());
        Arc::new(TransactionManager::new(backend, false).unwrap())
    }

    fn declare_name_index(manager: &TransactionManager) {
        let mut batch = WriteBatch::default();
        manager
            .backend
            .stage_index_declaration("name", &mut batch)
            .unwrap();
        manager.backend.write(batch, false).unwrap();
        manager.indexes.declare("name", 0, &[]).unwrap();
    }

    #[test]
    fn test_transaction_lifecycle() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());

        let mut txn = manager.begin().unwrap();
        assert_eq!(manager.active_count(), 1);
        assert_eq!(txn.state(), TransactionState::Active);

        txn.rollback().unwrap();
        assert_eq!(manager.active_count(), 0);
        assert_eq!(txn.state(), TransactionState::RolledBack);

        // Rollback is idempotent, everything else is refused.
        txn.rollback().unwrap();
        assert!(matches!(
            txn.add_vertex().unwrap_err(),
            GraphError::TransactionClosed(id) if id == txn.id()
        ));
        assert!(matches!(
            txn.commit().unwrap_err(),
            GraphError::TransactionClosed(_)
        ));
    }

    #[test]
    fn test_drop_rolls_back() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        let id = {
            let mut txn = manager.begin().unwrap();
            txn.add_vertex().unwrap()
        };
        assert_eq!(manager.active_count(), 0);

        let reader = manager.begin().unwrap();
        assert!(reader.vertex(id).unwrap().is_none());
    }

    #[test]
    fn test_first_committer_wins_conflict() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());

        let vertex;
        {
            let mut initial = manager.begin().unwrap();
            vertex = initial.add_vertex().unwrap();
            initial.set_property(vertex, "value", "initial").unwrap();
            initial.commit().unwrap();
        }

        // Alice and Bob start from the same snapshot.
        let mut alice = manager.begin().unwrap();
        let mut bob = manager.begin().unwrap();

        alice.set_property(vertex, "value", "alice was here").unwrap();
        alice.commit().unwrap();

        bob.set_property(vertex, "value", "bob was here").unwrap();
        let err = bob.commit().unwrap_err();
        assert!(matches!(err, GraphError::TransactionConflict(_)));
        assert_eq!(bob.state(), TransactionState::RolledBack);

        // Alice's version is what reached the disk.
        let stored = manager.backend.get_vertex(vertex).unwrap().unwrap();
        assert_eq!(stored.property("value"), Some("alice was here"));
        assert_eq!(stored.metadata.version, 2);
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());

        let reader = manager.begin().unwrap();
        let mut writer = manager.begin().unwrap();
        let id = writer.add_vertex().unwrap();
        writer.commit().unwrap();

        // The reader's snapshot predates the commit.
        assert!(reader.vertex(id).unwrap().is_none());
        let late_reader = manager.begin().unwrap();
        assert!(late_reader.vertex(id).unwrap().is_some());
    }

    #[test]
    fn test_concurrent_edges_on_same_vertex_merge() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());

        let mut setup = manager.begin().unwrap();
        let hub = setup.add_vertex().unwrap();
        let a = setup.add_vertex().unwrap();
        let b = setup.add_vertex().unwrap();
        setup.commit().unwrap();

        let mut first = manager.begin().unwrap();
        let mut second = manager.begin().unwrap();
        let e1 = first.add_edge(hub, a, "owns").unwrap();
        let e2 = second.add_edge(hub, b, "owns").unwrap();
        first.commit().unwrap();
        second.commit().unwrap();

        let reader = manager.begin().unwrap();
        let hub = reader.vertex(hub).unwrap().unwrap();
        assert_eq!(hub.out_edges, BTreeSet::from([e1, e2]));
    }

    #[test]
    fn test_delete_conflicts_with_concurrent_edge() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());

        let mut setup = manager.begin().unwrap();
        let a = setup.add_vertex().unwrap();
        let b = setup.add_vertex().unwrap();
        setup.commit().unwrap();

        let mut linker = manager.begin().unwrap();
        let mut deleter = manager.begin().unwrap();
        linker.add_edge(a, b, "knows").unwrap();
        deleter.delete_vertex(b).unwrap();

        linker.commit().unwrap();
        // Committing the delete would strand the new edge.
        assert!(deleter.commit().unwrap_err().is_retryable());

        let mut linker_after_delete = manager.begin().unwrap();
        let mut deleter = manager.begin().unwrap();
        deleter.delete_vertex(a).unwrap();
        linker_after_delete.add_edge(b, a, "knows").unwrap();
        deleter.commit().unwrap();
        assert!(linker_after_delete.commit().unwrap_err().is_retryable());
    }

    #[test]
    fn test_failed_write_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        declare_name_index(&manager);

        let mut txn = manager.begin().unwrap();
        let id = txn.add_vertex().unwrap();
        txn.set_property(id, "name", "Ghost").unwrap();

        manager.fail_next_write();
        assert!(txn.commit().is_err());
        assert_eq!(txn.state(), TransactionState::RolledBack);

        // Neither records, index postings nor the clock moved.
        assert_eq!(manager.current_seq(), 0);
        assert!(manager.backend.get_vertex(id).unwrap().is_none());
        assert!(manager.backend.load_index_entries().unwrap().is_empty());
        let reader = manager.begin().unwrap();
        assert!(reader.lookup("name", "Ghost").unwrap().is_empty());
    }

    #[test]
    fn test_history_is_pruned_once_readers_finish() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());

        let mut setup = manager.begin().unwrap();
        let id = setup.add_vertex().unwrap();
        setup.commit().unwrap();

        let old_reader = manager.begin().unwrap();
        for i in 0..3 {
            let mut txn = manager.begin().unwrap();
            txn.set_property(id, "n", i.to_string()).unwrap();
            txn.commit().unwrap();
        }
        // The old snapshot still sees the vertex without the property.
        assert_eq!(old_reader.get_property(id, "n").unwrap(), None);
        drop(old_reader);

        manager.vacuum().unwrap();
        let reader = manager.begin().unwrap();
        assert_eq!(reader.get_property(id, "n").unwrap(), Some("2".to_string()));
    }
}
