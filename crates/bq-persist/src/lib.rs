//! Durable storage for the broker-queue workspace: a SQLite-backed
//! write-ahead log implementing `bq_common::Persister`, plus an in-memory
//! stand-in for tests and the dev binary's default non-durable mode.

pub mod error;
pub mod memory;
pub mod sqlite;

pub use error::PersistError;
pub use memory::MemoryPersister;
pub use sqlite::SqlitePersister;
