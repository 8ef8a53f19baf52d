// Graph engine module

pub mod engine;
pub mod indices;
pub mod neighbors;
pub mod session;
pub mod transaction;
pub mod versioning;

pub use engine::Graph;
pub use neighbors::Neighbors;
pub use session::GraphSession;
pub use transaction::{Mutation, Transaction, TransactionManager, TransactionState};
