use super::transaction::Transaction;
use crate::error::{GraphError, Result};
use crate::types::{EdgeId, Vertex, VertexId};

/// Lazy one-hop traversal from a vertex.
///
/// The edge list is captured when the traversal is created; each edge is
/// resolved to its far endpoint only when the iterator reaches it. Call
/// [`rewind`](Neighbors::rewind) (or clone before iterating) to walk it again.
#[derive(Debug, Clone)]
pub struct Neighbors<'a> {
    transaction: &'a Transaction,
    origin: VertexId,
    edges: Vec<EdgeId>,
    label: Option<String>,
    cursor: usize,
}

impl<'a> Neighbors<'a> {
    pub(crate) fn new(
        transaction: &'a Transaction,
        origin: VertexId,
        edges: Vec<EdgeId>,
        label: Option<String>,
    ) -> Self {
        Self {
            transaction,
            origin,
            edges,
            label,
            cursor: 0,
        }
    }

    pub fn origin(&self) -> VertexId {
        self.origin
    }

    /// Candidate edges, before label filtering.
    pub fn edge_ids(&self) -> &[EdgeId] {
        &self.edges
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }
}

impl Iterator for Neighbors<'_> {
    type Item = Result<Vertex>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(edge_id) = self.edges.get(self.cursor).copied() {
            self.cursor += 1;
            let edge = match self.transaction.edge_view(edge_id) {
                Ok(Some(edge)) => edge,
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            };
            if self.label.as_deref().is_some_and(|label| edge.label != label) {
                continue;
            }

            let far = edge.other_endpoint(self.origin);
            return Some(
                self.transaction
                    .vertex_view(far)
                    .and_then(|vertex| vertex.ok_or(GraphError::VertexNotFound(far))),
            );
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.edges.len().saturating_sub(self.cursor)))
    }
}
