//! Result store implementations.
//!
//! - `MemoryStore`: in-process, for tests and dry runs
//! - `SqliteStore`: file-backed via sqlx, the default for the CLI

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
