//! Infrastructure layer: storage backends, connection pooling, audit ledger.

pub mod error;
pub mod ledger;
pub mod pool;
pub mod store;

pub use error::{ConnectionError, InfraError, StorageError};
pub use ledger::HistoryLedger;
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use store::{
    CountCommit, CountStorage, InMemoryConnection, InMemoryConnector, InMemoryStorage,
    SqliteConnector, StorageConnector,
};
