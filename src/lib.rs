//! An embedded graph store.
//!
//! Vertices and directed, labeled edges carry string properties and live in
//! RocksDB. Exact-value indexes on declared properties answer lookups, and
//! snapshot-isolated transactions commit atomically and durably.
//!
//! ```no_run
//! use graphvault::{Graph, GraphConfig};
//!
//! # fn main() -> graphvault::Result<()> {
//! let graph = Graph::open(GraphConfig::new("./db").with_index("name"))?;
//! let mut session = graph.session();
//! let microsoft = session.add_vertex()?;
//! session.set_property(microsoft, "name", "Microsoft")?;
//! let nokia = session.add_vertex()?;
//! session.set_property(nokia, "name", "NOKIA")?;
//! session.add_edge(microsoft, nokia, "owns")?;
//! session.commit()?;
//!
//! if let Some(root) = session.vertex_by_property("name", "Microsoft")? {
//!     for subsidiary in session.neighbors(root.id, "owns")? {
//!         println!("{:?}", subsidiary?.property("name"));
//!     }
//! }
//! session.shutdown()
//! # }
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod storage;
pub mod types;

pub use config::GraphConfig;
pub use error::{GraphError, Result};
pub use graph::{Graph, GraphSession, Neighbors, Transaction, TransactionState};
pub use types::{Direction, Edge, EdgeId, ElementId, TransactionId, Vertex, VertexId};
