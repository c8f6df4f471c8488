//! Durable storage for the Conductor orchestration core.
//!
//! Task records and workflow checkpoints go through the [`TaskStore`] trait.
//! [`MemoryTaskStore`] keeps everything in process, [`FileTaskStore`] writes
//! one JSON document per record, and `SqliteTaskStore` (feature `sqlite`)
//! keeps them in a single database file.

/// File-based JSON store.
pub mod file;
/// In-memory store.
pub mod memory;
/// SQLite store.
#[cfg(feature = "sqlite")]
pub mod sqlite;
/// The store trait.
pub mod store;

pub use file::FileTaskStore;
pub use memory::MemoryTaskStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTaskStore;
pub use store::TaskStore;
