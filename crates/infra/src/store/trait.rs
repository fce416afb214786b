use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tally_core::{SessionId, TeamId};
use tally_counting::{CountChange, HistoryEntry, Item, ItemSeed, NewSession, NewTeam, Session, Team};

use crate::error::{ConnectionError, StorageError};

/// Everything needed to persist one accepted count.
#[derive(Debug, Clone, PartialEq)]
pub struct CountCommit {
    pub session_id: SessionId,
    pub item_code: String,
    pub team_id: TeamId,
    pub change: CountChange,
    pub note: Option<String>,
    /// Item version the change was decided against.
    pub expected_version: u64,
    pub at: DateTime<Utc>,
}

/// Opens storage connections for the pool.
#[async_trait]
pub trait StorageConnector: Send + Sync + 'static {
    type Connection: CountStorage + Send + 'static;

    async fn connect(&self) -> Result<Self::Connection, ConnectionError>;

    /// Cheap liveness check run on idle connections before they are handed out.
    async fn is_valid(&self, conn: &mut Self::Connection) -> bool;
}

/// One storage session.
///
/// ## Commit semantics
///
/// `commit_count()` runs in a single transaction:
/// 1. append the history entry
/// 2. update the item row conditioned on `expected_version`
/// 3. bump `version`, set team/time/note and assign the next `change_seq`
///
/// If the conditional update matches no row the transaction is rolled back,
/// leaving no orphan history, and `StorageError::VersionConflict` is returned.
///
/// ## Change sequence
///
/// Every write to an item row assigns `MAX(change_seq) + 1` within its
/// session. Readers use it as a watermark: `items_changed_since(Some(w))`
/// returns exactly the rows written after the reader last saw `w`.
///
/// ## History order
///
/// Ledger reads follow commit order (the history row id), never the
/// caller-supplied `at`, so stations with skewed clocks still produce a
/// contiguous trail.
///
/// Writes against a closed session fail with `StorageError::SessionClosed`.
#[async_trait]
pub trait CountStorage: Send {
    async fn create_session(
        &mut self,
        new: &NewSession,
        started_at: DateTime<Utc>,
    ) -> Result<Session, StorageError>;

    async fn fetch_session(&mut self, id: SessionId) -> Result<Session, StorageError>;

    /// Most recently started session that is still active.
    async fn latest_active_session(&mut self) -> Result<Option<Session>, StorageError>;

    /// All sessions, newest first.
    async fn list_sessions(&mut self) -> Result<Vec<Session>, StorageError>;

    async fn close_session(
        &mut self,
        id: SessionId,
        ended_at: DateTime<Utc>,
    ) -> Result<Session, StorageError>;

    async fn insert_team(
        &mut self,
        new: &NewTeam,
        created_at: DateTime<Utc>,
    ) -> Result<Team, StorageError>;

    async fn deactivate_team(&mut self, id: TeamId) -> Result<Team, StorageError>;

    /// Teams ordered by name.
    async fn list_teams(&mut self, include_inactive: bool) -> Result<Vec<Team>, StorageError>;

    /// Insert normalised seeds as fresh, uncounted items.
    async fn bulk_load(
        &mut self,
        session: SessionId,
        seeds: &[ItemSeed],
    ) -> Result<Vec<Item>, StorageError>;

    async fn insert_extra_item(
        &mut self,
        session: SessionId,
        seed: &ItemSeed,
    ) -> Result<Item, StorageError>;

    /// Overwrite `system_stock` for every item of the session; codes missing
    /// from the map get 0. Returns the number of rows touched.
    async fn update_system_stock(
        &mut self,
        session: SessionId,
        stock_by_code: &HashMap<String, f64>,
    ) -> Result<u64, StorageError>;

    async fn fetch_item(
        &mut self,
        session: SessionId,
        code: &str,
    ) -> Result<Option<Item>, StorageError>;

    /// Rows with `change_seq` above the watermark (all rows for `None`),
    /// ascending by `change_seq`.
    async fn items_changed_since(
        &mut self,
        session: SessionId,
        watermark: Option<u64>,
    ) -> Result<Vec<Item>, StorageError>;

    async fn commit_count(
        &mut self,
        commit: &CountCommit,
    ) -> Result<(Item, HistoryEntry), StorageError>;

    /// Entries for one item in commit order.
    async fn entries_for(
        &mut self,
        session: SessionId,
        code: &str,
    ) -> Result<Vec<HistoryEntry>, StorageError>;

    /// Latest entries of the session, most recently committed first.
    async fn recent_entries(
        &mut self,
        session: SessionId,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StorageError>;
}
