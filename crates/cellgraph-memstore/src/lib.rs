//! In-memory storage backend: metadata provider, record store and
//! collaboration sink over snapshot transactions.

pub mod database;
pub mod projection;
pub mod schema;
pub mod sink;
pub mod store;

pub use database::{MemoryDatabase, PhysicalTable};
pub use schema::{LinkLayout, LinkSpec, SymmetricSpec};
pub use sink::MemorySink;
pub use store::{MemoryStore, MemoryTransaction, StatsSnapshot};
