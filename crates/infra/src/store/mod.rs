//! Storage boundary for sessions, teams, items and the count history.
//!
//! Two backends implement it: an in-memory one (tests/dev, with fault
//! injection) and a SQLite one built on `sqlx`.

pub mod in_memory;
pub mod sqlite;
pub mod r#trait;

pub use in_memory::{InMemoryConnection, InMemoryConnector, InMemoryStorage};
pub use r#trait::{CountCommit, CountStorage, StorageConnector};
pub use sqlite::{SqliteConnector, SqliteStorage};
