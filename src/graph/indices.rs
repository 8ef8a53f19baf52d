//! Composite property indexes.
//!
//! Each declared property maps exact values to the vertices holding them.
//! Postings carry the commit sequences during which they were live, so a
//! snapshot keeps seeing the index exactly as it was committed when the
//! snapshot began.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use super::versioning::{read, write};
use crate::error::Result;
use crate::storage::IndexEntry;
use crate::types::{Vertex, VertexId};

/// A single change to an index produced by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexChange {
    Insert(IndexEntry),
    Remove(IndexEntry),
}

impl IndexChange {
    pub fn entry(&self) -> &IndexEntry {
        match self {
            IndexChange::Insert(entry) | IndexChange::Remove(entry) => entry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Span {
    from: u64,
    until: Option<u64>,
}

impl Span {
    fn covers(&self, seq: u64) -> bool {
        self.from <= seq && self.until.is_none_or(|until| until > seq)
    }
}

#[derive(Debug, Default)]
struct PropertyIndex {
    declared_at: u64,
    postings: HashMap<String, BTreeMap<VertexId, Vec<Span>>>,
}

impl PropertyIndex {
    fn insert(&mut self, value: &str, vertex: VertexId, seq: u64) {
        let spans = self
            .postings
            .entry(value.to_string())
            .or_default()
            .entry(vertex)
            .or_default();
        if !spans.iter().any(|s| s.until.is_none()) {
            spans.push(Span {
                from: seq,
                until: None,
            });
        }
    }

    fn remove(&mut self, value: &str, vertex: VertexId, seq: u64) {
        let open = self
            .postings
            .get_mut(value)
            .and_then(|by_vertex| by_vertex.get_mut(&vertex))
            .and_then(|spans| spans.iter_mut().find(|s| s.until.is_none()));
        if let Some(span) = open {
            span.until = Some(seq);
        }
    }

    fn lookup(&self, value: &str, seq: u64) -> BTreeSet<VertexId> {
        self.postings
            .get(value)
            .map(|by_vertex| {
                by_vertex
                    .iter()
                    .filter(|(_, spans)| spans.iter().any(|s| s.covers(seq)))
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn entries_at(&self, property: &str, seq: u64) -> BTreeSet<IndexEntry> {
        let mut entries = BTreeSet::new();
        for (value, by_vertex) in &self.postings {
            for (vertex, spans) in by_vertex {
                if spans.iter().any(|s| s.covers(seq)) {
                    entries.insert(IndexEntry {
                        property: property.to_string(),
                        value: value.clone(),
                        vertex: *vertex,
                    });
                }
            }
        }
        entries
    }

    fn prune_value(&mut self, value: &str, horizon: u64) {
        let Some(by_vertex) = self.postings.get_mut(value) else {
            return;
        };
        by_vertex.retain(|_, spans| {
            spans.retain(|s| s.until.is_none_or(|until| until > horizon));
            !spans.is_empty()
        });
        if by_vertex.is_empty() {
            self.postings.remove(value);
        }
    }
}

/// Owns every declared index.
#[derive(Debug, Default)]
pub struct IndexManager {
    indexes: RwLock<BTreeMap<String, PropertyIndex>>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_declared(&self, property: &str) -> Result<bool> {
        Ok(read(&self.indexes)?.contains_key(property))
    }

    /// True if a snapshot taken at `seq` sees `property` as indexed.
    pub fn is_visible(&self, property: &str, seq: u64) -> Result<bool> {
        Ok(read(&self.indexes)?
            .get(property)
            .is_some_and(|index| index.declared_at <= seq))
    }

    pub fn declared(&self) -> Result<Vec<String>> {
        Ok(read(&self.indexes)?.keys().cloned().collect())
    }

    /// Registers an index, seeded with `entries`, visible from `seq` on.
    /// Returns false if the property was already indexed.
    pub fn declare(&self, property: &str, seq: u64, entries: &[IndexEntry]) -> Result<bool> {
        let mut indexes = write(&self.indexes)?;
        if indexes.contains_key(property) {
            return Ok(false);
        }
        let mut index = PropertyIndex {
            declared_at: seq,
            ..PropertyIndex::default()
        };
        for entry in entries {
            index.insert(&entry.value, entry.vertex, seq);
        }
        indexes.insert(property.to_string(), index);
        Ok(true)
    }

    /// Vertices whose `property` equals `value` as of `seq`.
    /// Undeclared properties yield the empty set.
    pub fn lookup(&self, property: &str, value: &str, seq: u64) -> Result<BTreeSet<VertexId>> {
        Ok(read(&self.indexes)?
            .get(property)
            .filter(|index| index.declared_at <= seq)
            .map(|index| index.lookup(value, seq))
            .unwrap_or_default())
    }

    pub fn entries_at(&self, property: &str, seq: u64) -> Result<BTreeSet<IndexEntry>> {
        Ok(read(&self.indexes)?
            .get(property)
            .map(|index| index.entries_at(property, seq))
            .unwrap_or_default())
    }

    /// Publishes the changes of one commit at `seq`.
    pub fn apply(&self, changes: &[IndexChange], seq: u64) -> Result<()> {
        let mut indexes = write(&self.indexes)?;
        for change in changes {
            let entry = change.entry();
            let Some(index) = indexes.get_mut(&entry.property) else {
                continue;
            };
            match change {
                IndexChange::Insert(_) => index.insert(&entry.value, entry.vertex, seq),
                IndexChange::Remove(_) => index.remove(&entry.value, entry.vertex, seq),
            }
        }
        Ok(())
    }

    /// Drops posting history below `horizon` for the values touched by `changes`.
    pub fn prune(&self, changes: &[IndexChange], horizon: u64) -> Result<()> {
        let mut indexes = write(&self.indexes)?;
        for change in changes {
            let entry = change.entry();
            if let Some(index) = indexes.get_mut(&entry.property) {
                index.prune_value(&entry.value, horizon);
            }
        }
        Ok(())
    }

    pub fn prune_all(&self, horizon: u64) -> Result<()> {
        let mut indexes = write(&self.indexes)?;
        for index in indexes.values_mut() {
            let values: Vec<String> = index.postings.keys().cloned().collect();
            for value in values {
                index.prune_value(&value, horizon);
            }
        }
        Ok(())
    }
}

/// The index changes needed to move one vertex from `before` to `after`.
pub fn index_delta(
    declared: &[String],
    id: VertexId,
    before: Option<&Vertex>,
    after: Option<&Vertex>,
) -> Vec<IndexChange> {
    let mut changes = Vec::new();
    for property in declared {
        let old = before.and_then(|v| v.property(property));
        let new = after.and_then(|v| v.property(property));
        if old == new {
            continue;
        }
        let entry = |value: &str| IndexEntry {
            property: property.clone(),
            value: value.to_string(),
            vertex: id,
        };
        if let Some(value) = old {
            changes.push(IndexChange::Remove(entry(value)));
        }
        if let Some(value) = new {
            changes.push(IndexChange::Insert(entry(value)));
        }
    }
    changes
}

/// The entries a freshly built index on `property` must hold for `vertices`.
pub fn expected_entries(property: &str, vertices: &[Vertex]) -> BTreeSet<IndexEntry> {
    vertices
        .iter()
        .filter_map(|vertex| {
            vertex.property(property).map(|value| IndexEntry {
                property: property.to_string(),
                value: value.to_string(),
                vertex: vertex.id,
            })
        })
        .collect()
}
