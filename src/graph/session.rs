use super::engine::Graph;
use super::neighbors::Neighbors;
use super::transaction::Transaction;
use crate::error::Result;
use crate::types::{EdgeId, ElementId, Vertex, VertexId};

/// Graph façade with an implicit current transaction.
///
/// The first operation after creation, `commit` or `rollback` starts a fresh
/// transaction. Whatever is still uncommitted when the session is shut down
/// or dropped is rolled back.
#[derive(Debug)]
pub struct GraphSession {
    graph: Graph,
    current: Option<Transaction>,
}

impl GraphSession {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph,
            current: None,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The current transaction, started on demand.
    pub fn transaction(&mut self) -> Result<&mut Transaction> {
        let transaction = match self.current.take() {
            Some(transaction) => transaction,
            None => self.graph.begin()?,
        };
        Ok(self.current.insert(transaction))
    }

    pub fn add_vertex(&mut self) -> Result<VertexId> {
        self.transaction()?.add_vertex()
    }

    pub fn add_edge(
        &mut self,
        source: VertexId,
        target: VertexId,
        label: impl Into<String>,
    ) -> Result<EdgeId> {
        self.transaction()?.add_edge(source, target, label)
    }

    pub fn set_property(
        &mut self,
        element: impl Into<ElementId>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.transaction()?.set_property(element, key, value)
    }

    pub fn get_property(&mut self, element: impl Into<ElementId>, key: &str) -> Result<Option<String>> {
        self.transaction()?.get_property(element, key)
    }

    pub fn delete_vertex(&mut self, id: VertexId) -> Result<()> {
        self.transaction()?.delete_vertex(id)
    }

    /// Looks a vertex up through the index on `property`.
    ///
    /// Returns `None` when nothing matches or the property is not indexed.
    pub fn vertex_by_property(&mut self, property: &str, value: &str) -> Result<Option<Vertex>> {
        self.transaction()?.vertex_by_property(property, value)
    }

    pub fn neighbors(&mut self, vertex: VertexId, label: &str) -> Result<Neighbors<'_>> {
        let transaction: &Transaction = self.transaction()?;
        transaction.neighbors(vertex, label)
    }

    /// Commits the current transaction, if any.
    pub fn commit(&mut self) -> Result<()> {
        match self.current.take() {
            Some(mut transaction) => transaction.commit(),
            None => Ok(()),
        }
    }

    pub fn rollback(&mut self) -> Result<()> {
        match self.current.take() {
            Some(mut transaction) => transaction.rollback(),
            None => Ok(()),
        }
    }

    /// Rolls back any in-flight work and shuts the graph handle down.
    pub fn shutdown(mut self) -> Result<()> {
        // The handle is released even if the rollback fails.
        let rolled_back = self.rollback();
        self.graph.shutdown()?;
        rolled_back
    }
}
