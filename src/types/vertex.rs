use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{EdgeId, VertexId};

/// Data for tracking when a record was created/changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by every commit that changes the record.
    pub version: u64,
}

impl RecordMetadata {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.version += 1;
    }
}

impl Default for RecordMetadata {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}

/// A node in the graph, with its string properties and adjacency lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vertex {
    pub id: VertexId,
    pub properties: BTreeMap<String, String>,
    pub out_edges: BTreeSet<EdgeId>,
    pub in_edges: BTreeSet<EdgeId>,
    pub metadata: RecordMetadata,
}

impl Vertex {
    pub fn new(id: VertexId) -> Self {
        Self {
            id,
            properties: BTreeMap::new(),
            out_edges: BTreeSet::new(),
            in_edges: BTreeSet::new(),
            metadata: RecordMetadata::default(),
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Every edge touching this vertex, self-loops counted once.
    pub fn incident_edges(&self) -> BTreeSet<EdgeId> {
        self.out_edges.union(&self.in_edges).copied().collect()
    }
}
