//! Read side of the append-only count history.
//!
//! Entries are written only by [`CountStorage::commit_count`], inside the same
//! transaction as the item update; this type never writes.

use tracing::instrument;

use tally_core::SessionId;
use tally_counting::HistoryEntry;

use crate::error::InfraError;
use crate::pool::ConnectionPool;
use crate::store::{CountStorage, StorageConnector};

pub struct HistoryLedger<C: StorageConnector> {
    pool: ConnectionPool<C>,
}

impl<C: StorageConnector> Clone for HistoryLedger<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<C: StorageConnector> HistoryLedger<C> {
    pub fn new(pool: ConnectionPool<C>) -> Self {
        Self { pool }
    }

    /// Entries for one item in commit order.
    #[instrument(skip(self), fields(session_id = %session), err)]
    pub async fn entries_for(
        &self,
        session: SessionId,
        item_code: &str,
    ) -> Result<Vec<HistoryEntry>, InfraError> {
        let mut conn = self.pool.acquire().await?;
        Ok(conn.entries_for(session, item_code).await?)
    }

    /// The `limit` most recently committed entries of the session.
    #[instrument(skip(self), fields(session_id = %session), err)]
    pub async fn recent_entries(
        &self,
        session: SessionId,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, InfraError> {
        let mut conn = self.pool.acquire().await?;
        Ok(conn.recent_entries(session, limit).await?)
    }
}
