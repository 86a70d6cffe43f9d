pub mod database;
pub mod memory;
pub mod store;

pub use database::{Database, PoolConfig, SharedDatabase};
pub use memory::MemorySessionStore;
pub use store::{SessionStore, SharedStore};
