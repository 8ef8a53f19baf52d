use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::vertex::RecordMetadata;
use super::{EdgeId, VertexId};

/// A directed, labeled edge between two vertices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub id: EdgeId,
    pub source: VertexId,
    pub target: VertexId,
    pub label: String,
    pub properties: BTreeMap<String, String>,
    pub metadata: RecordMetadata,
}

impl Edge {
    pub fn new(id: EdgeId, source: VertexId, target: VertexId, label: impl Into<String>) -> Self {
        Self {
            id,
            source,
            target,
            label: label.into(),
            properties: BTreeMap::new(),
            metadata: RecordMetadata::default(),
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// The endpoint on the far side of `from`. For a self-loop this is `from` itself.
    pub fn other_endpoint(&self, from: VertexId) -> VertexId {
        if self.source == from {
            self.target
        } else {
            self.source
        }
    }
}
