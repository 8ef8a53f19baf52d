// Durable storage layer

pub mod rocks_backend;
pub use rocks_backend::{IndexEntry, RocksBackend};
