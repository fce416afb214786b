//! SQLite-backed storage built on `sqlx`.
//!
//! ## Write ordering
//!
//! Every write transaction starts with a write statement so that SQLite takes
//! the write lock up front (and honours the busy timeout) instead of failing
//! a read-to-write lock upgrade under concurrent writers.
//!
//! ## Error mapping
//!
//! | sqlx error | StorageError |
//! |------------|--------------|
//! | unique violation | `Duplicate` |
//! | foreign key violation | `NotFound` |
//! | column decode failure | `InvalidData` |
//! | anything else | `Backend` |

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow};
use sqlx::{ConnectOptions, Connection, Row, Sqlite};
use tracing::instrument;

use tally_core::{HistoryEntryId, ItemId, SessionId, TeamId};
use tally_counting::{
    ActionType, HistoryEntry, Item, ItemSeed, NewSession, NewTeam, Session, Team,
};

use super::r#trait::{CountCommit, CountStorage, StorageConnector};
use crate::error::{ConnectionError, StorageError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        responsible TEXT,
        warehouse TEXT,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        active INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS teams (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        members TEXT NOT NULL DEFAULT '[]',
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        code TEXT NOT NULL,
        product TEXT NOT NULL,
        line TEXT NOT NULL,
        system_stock REAL NOT NULL DEFAULT 0,
        physical_count REAL NOT NULL DEFAULT 0,
        note TEXT,
        counted_at TEXT,
        last_team_id INTEGER,
        version INTEGER NOT NULL DEFAULT 0,
        change_seq INTEGER NOT NULL,
        UNIQUE (session_id, code)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_items_change_seq ON items (session_id, change_seq)",
    r#"
    CREATE TABLE IF NOT EXISTS history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        item_code TEXT NOT NULL,
        team_id INTEGER NOT NULL,
        action_type TEXT NOT NULL CHECK (action_type IN ('NEW', 'SUM', 'REPLACE')),
        prev_qty REAL NOT NULL,
        result_qty REAL NOT NULL,
        moved_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_history_item ON history (session_id, item_code, id)",
];

const ITEM_COLUMNS: &str = "id, session_id, code, product, line, system_stock, physical_count, \
     note, counted_at, last_team_id, version, change_seq";

const HISTORY_COLUMNS: &str =
    "id, session_id, item_code, team_id, action_type, prev_qty, result_qty, moved_at";

const NEXT_SEQ: &str = "(SELECT COALESCE(MAX(change_seq), 0) + 1 FROM items WHERE session_id = ?)";

/// Fixed-width UTC timestamps so that text ordering matches time ordering.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

fn ts(at: DateTime<Utc>) -> String {
    at.format(TS_FORMAT).to_string()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .map(|n| n.and_utc())
        .map_err(|e| StorageError::InvalidData(format!("bad timestamp {raw:?}: {e}")))
}

/// Opens SQLite connections and makes sure the schema exists.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    options: SqliteConnectOptions,
}

impl SqliteConnector {
    /// Build from a `sqlite:` URL, e.g. `sqlite://tally.db`.
    pub fn from_url(url: &str) -> Result<Self, ConnectionError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| ConnectionError::Connect(format!("invalid database url: {e}")))?;
        Ok(Self::with_options(options))
    }

    pub fn at_path(path: impl AsRef<Path>) -> Self {
        Self::with_options(SqliteConnectOptions::new().filename(path))
    }

    fn with_options(options: SqliteConnectOptions) -> Self {
        Self {
            options: options
                .create_if_missing(true)
                .foreign_keys(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5)),
        }
    }
}

#[async_trait]
impl StorageConnector for SqliteConnector {
    type Connection = SqliteStorage;

    async fn connect(&self) -> Result<SqliteStorage, ConnectionError> {
        let mut conn = self
            .options
            .connect()
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&mut conn)
                .await
                .map_err(|e| ConnectionError::Connect(format!("schema setup failed: {e}")))?;
        }
        Ok(SqliteStorage { conn })
    }

    async fn is_valid(&self, conn: &mut SqliteStorage) -> bool {
        conn.conn.ping().await.is_ok()
    }
}

/// One SQLite connection implementing [`CountStorage`].
#[derive(Debug)]
pub struct SqliteStorage {
    conn: SqliteConnection,
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StorageError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StorageError::InvalidData(format!("column {name}: {e}")))
}

fn to_u64(value: i64, what: &str) -> Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| StorageError::InvalidData(format!("negative {what}: {value}")))
}

fn session_from_row(row: &SqliteRow) -> Result<Session, StorageError> {
    let ended_at: Option<String> = col(row, "ended_at")?;
    Ok(Session {
        id: SessionId::new(col(row, "id")?),
        name: col(row, "name")?,
        responsible: col(row, "responsible")?,
        warehouse: col(row, "warehouse")?,
        started_at: parse_ts(&col::<String>(row, "started_at")?)?,
        ended_at: ended_at.as_deref().map(parse_ts).transpose()?,
        active: col(row, "active")?,
    })
}

fn team_from_row(row: &SqliteRow) -> Result<Team, StorageError> {
    let members: String = col(row, "members")?;
    Ok(Team {
        id: TeamId::new(col(row, "id")?),
        name: col(row, "name")?,
        members: serde_json::from_str(&members)
            .map_err(|e| StorageError::InvalidData(format!("team members: {e}")))?,
        active: col(row, "active")?,
        created_at: parse_ts(&col::<String>(row, "created_at")?)?,
    })
}

fn item_from_row(row: &SqliteRow) -> Result<Item, StorageError> {
    let counted_at: Option<String> = col(row, "counted_at")?;
    Ok(Item {
        id: ItemId::new(col(row, "id")?),
        session_id: SessionId::new(col(row, "session_id")?),
        code: col(row, "code")?,
        product: col(row, "product")?,
        line: col(row, "line")?,
        system_stock: col(row, "system_stock")?,
        physical_count: col(row, "physical_count")?,
        note: col(row, "note")?,
        last_counted_at: counted_at.as_deref().map(parse_ts).transpose()?,
        last_team_id: col::<Option<i64>>(row, "last_team_id")?.map(TeamId::new),
        version: to_u64(col(row, "version")?, "version")?,
        change_seq: to_u64(col(row, "change_seq")?, "change_seq")?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<HistoryEntry, StorageError> {
    let action: String = col(row, "action_type")?;
    Ok(HistoryEntry {
        id: HistoryEntryId::new(col(row, "id")?),
        session_id: SessionId::new(col(row, "session_id")?),
        item_code: col(row, "item_code")?,
        team_id: TeamId::new(col(row, "team_id")?),
        action: action
            .parse::<ActionType>()
            .map_err(|e| StorageError::InvalidData(e.to_string()))?,
        previous_quantity: col(row, "prev_qty")?,
        resulting_quantity: col(row, "result_qty")?,
        timestamp: parse_ts(&col::<String>(row, "moved_at")?)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            if db_err.is_unique_violation() {
                StorageError::Duplicate(msg)
            } else if db_err.is_foreign_key_violation() {
                StorageError::NotFound(msg)
            } else {
                StorageError::Backend(msg)
            }
        }
        sqlx::Error::RowNotFound => {
            StorageError::NotFound(format!("unexpected row not found in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StorageError::InvalidData(format!("decode error in {operation}: {err}"))
        }
        _ => StorageError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

async fn load_session(
    conn: &mut SqliteConnection,
    id: SessionId,
) -> Result<Session, StorageError> {
    let row = sqlx::query(
        "SELECT id, name, responsible, warehouse, started_at, ended_at, active \
         FROM sessions WHERE id = ?",
    )
    .bind(id.get())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_session", e))?
    .ok_or_else(|| StorageError::NotFound(format!("session {id}")))?;
    session_from_row(&row)
}

async fn ensure_open(conn: &mut SqliteConnection, id: SessionId) -> Result<(), StorageError> {
    if load_session(conn, id).await?.active {
        Ok(())
    } else {
        Err(StorageError::SessionClosed(id.get()))
    }
}

async fn load_item(
    conn: &mut SqliteConnection,
    session: SessionId,
    code: &str,
) -> Result<Option<Item>, StorageError> {
    let row = sqlx::query(&format!(
        "SELECT {ITEM_COLUMNS} FROM items WHERE session_id = ? AND code = ?"
    ))
    .bind(session.get())
    .bind(code)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_item", e))?;
    row.as_ref().map(item_from_row).transpose()
}

async fn insert_item(
    conn: &mut SqliteConnection,
    session: SessionId,
    seed: &ItemSeed,
) -> Result<Item, StorageError> {
    sqlx::query(&format!(
        "INSERT INTO items (session_id, code, product, line, system_stock, change_seq) \
         VALUES (?, ?, ?, ?, ?, {NEXT_SEQ})"
    ))
    .bind(session.get())
    .bind(&seed.code)
    .bind(&seed.product)
    .bind(seed.line_or_default())
    .bind(seed.system_stock)
    .bind(session.get())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_item", e))?;

    load_item(conn, session, &seed.code)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("item {}", seed.code)))
}

#[async_trait]
impl CountStorage for SqliteStorage {
    #[instrument(skip(self, new), fields(name = %new.name), err)]
    async fn create_session(
        &mut self,
        new: &NewSession,
        started_at: DateTime<Utc>,
    ) -> Result<Session, StorageError> {
        let result = sqlx::query(
            "INSERT INTO sessions (name, responsible, warehouse, started_at, active) \
             VALUES (?, ?, ?, ?, 1)",
        )
        .bind(&new.name)
        .bind(&new.responsible)
        .bind(&new.warehouse)
        .bind(ts(started_at))
        .execute(&mut self.conn)
        .await
        .map_err(|e| map_sqlx_error("create_session", e))?;

        load_session(&mut self.conn, SessionId::new(result.last_insert_rowid())).await
    }

    async fn fetch_session(&mut self, id: SessionId) -> Result<Session, StorageError> {
        load_session(&mut self.conn, id).await
    }

    async fn latest_active_session(&mut self) -> Result<Option<Session>, StorageError> {
        let row = sqlx::query(
            "SELECT id, name, responsible, warehouse, started_at, ended_at, active \
             FROM sessions WHERE active = 1 ORDER BY started_at DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&mut self.conn)
        .await
        .map_err(|e| map_sqlx_error("latest_active_session", e))?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list_sessions(&mut self) -> Result<Vec<Session>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, name, responsible, warehouse, started_at, ended_at, active \
             FROM sessions ORDER BY started_at DESC, id DESC",
        )
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| map_sqlx_error("list_sessions", e))?;
        rows.iter().map(session_from_row).collect()
    }

    #[instrument(skip(self), fields(session_id = %id), err)]
    async fn close_session(
        &mut self,
        id: SessionId,
        ended_at: DateTime<Utc>,
    ) -> Result<Session, StorageError> {
        let result = sqlx::query("UPDATE sessions SET active = 0, ended_at = ? WHERE id = ? AND active = 1")
            .bind(ts(ended_at))
            .bind(id.get())
            .execute(&mut self.conn)
            .await
            .map_err(|e| map_sqlx_error("close_session", e))?;

        let session = load_session(&mut self.conn, id).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::SessionClosed(id.get()));
        }
        Ok(session)
    }

    #[instrument(skip(self, new), fields(name = %new.name), err)]
    async fn insert_team(
        &mut self,
        new: &NewTeam,
        created_at: DateTime<Utc>,
    ) -> Result<Team, StorageError> {
        let members = serde_json::to_string(&new.members)
            .map_err(|e| StorageError::InvalidData(format!("team members: {e}")))?;
        let result = sqlx::query(
            "INSERT INTO teams (name, members, active, created_at) VALUES (?, ?, 1, ?)",
        )
        .bind(&new.name)
        .bind(members)
        .bind(ts(created_at))
        .execute(&mut self.conn)
        .await
        .map_err(|e| match map_sqlx_error("insert_team", e) {
            StorageError::Duplicate(_) => StorageError::Duplicate(format!("team name {}", new.name)),
            other => other,
        })?;

        let id = TeamId::new(result.last_insert_rowid());
        let row = sqlx::query("SELECT id, name, members, active, created_at FROM teams WHERE id = ?")
            .bind(id.get())
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| map_sqlx_error("insert_team", e))?;
        team_from_row(&row)
    }

    async fn deactivate_team(&mut self, id: TeamId) -> Result<Team, StorageError> {
        sqlx::query("UPDATE teams SET active = 0 WHERE id = ?")
            .bind(id.get())
            .execute(&mut self.conn)
            .await
            .map_err(|e| map_sqlx_error("deactivate_team", e))?;
        let row = sqlx::query("SELECT id, name, members, active, created_at FROM teams WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&mut self.conn)
            .await
            .map_err(|e| map_sqlx_error("deactivate_team", e))?
            .ok_or_else(|| StorageError::NotFound(format!("team {id}")))?;
        team_from_row(&row)
    }

    async fn list_teams(&mut self, include_inactive: bool) -> Result<Vec<Team>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, name, members, active, created_at FROM teams \
             WHERE ? OR active = 1 ORDER BY name",
        )
        .bind(include_inactive)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| map_sqlx_error("list_teams", e))?;
        rows.iter().map(team_from_row).collect()
    }

    #[instrument(skip(self, seeds), fields(session_id = %session, rows = seeds.len()), err)]
    async fn bulk_load(
        &mut self,
        session: SessionId,
        seeds: &[ItemSeed],
    ) -> Result<Vec<Item>, StorageError> {
        let mut tx = self
            .conn
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut loaded = Vec::with_capacity(seeds.len());
        for seed in seeds {
            loaded.push(insert_item(&mut tx, session, seed).await?);
        }
        ensure_open(&mut tx, session).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(loaded)
    }

    #[instrument(skip(self, seed), fields(session_id = %session, code = %seed.code), err)]
    async fn insert_extra_item(
        &mut self,
        session: SessionId,
        seed: &ItemSeed,
    ) -> Result<Item, StorageError> {
        let mut tx = self
            .conn
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let item = insert_item(&mut tx, session, seed).await.map_err(|e| match e {
            StorageError::Duplicate(_) => StorageError::Duplicate(format!("item code {}", seed.code)),
            other => other,
        })?;
        ensure_open(&mut tx, session).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(item)
    }

    #[instrument(skip(self, stock_by_code), fields(session_id = %session, codes = stock_by_code.len()), err)]
    async fn update_system_stock(
        &mut self,
        session: SessionId,
        stock_by_code: &HashMap<String, f64>,
    ) -> Result<u64, StorageError> {
        let mut tx = self
            .conn
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // One sequence value for the whole refresh; readers see all of it or none.
        let touched = sqlx::query(&format!(
            "UPDATE items SET system_stock = 0, version = version + 1, change_seq = {NEXT_SEQ} \
             WHERE session_id = ?"
        ))
        .bind(session.get())
        .bind(session.get())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_system_stock", e))?
        .rows_affected();

        for (code, stock) in stock_by_code {
            sqlx::query("UPDATE items SET system_stock = ? WHERE session_id = ? AND code = ?")
                .bind(stock)
                .bind(session.get())
                .bind(code)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("update_system_stock", e))?;
        }
        ensure_open(&mut tx, session).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(touched)
    }

    async fn fetch_item(
        &mut self,
        session: SessionId,
        code: &str,
    ) -> Result<Option<Item>, StorageError> {
        load_item(&mut self.conn, session, code).await
    }

    #[instrument(skip(self), fields(session_id = %session), err)]
    async fn items_changed_since(
        &mut self,
        session: SessionId,
        watermark: Option<u64>,
    ) -> Result<Vec<Item>, StorageError> {
        let floor = watermark.map(|w| i64::try_from(w).unwrap_or(i64::MAX));
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items \
             WHERE session_id = ? AND (? IS NULL OR change_seq > ?) ORDER BY change_seq"
        ))
        .bind(session.get())
        .bind(floor)
        .bind(floor)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| map_sqlx_error("items_changed_since", e))?;
        rows.iter().map(item_from_row).collect()
    }

    #[instrument(
        skip(self, commit),
        fields(
            session_id = %commit.session_id,
            code = %commit.item_code,
            team_id = %commit.team_id,
            expected_version = ?commit.expected_version
        ),
        err
    )]
    async fn commit_count(
        &mut self,
        commit: &CountCommit,
    ) -> Result<(Item, HistoryEntry), StorageError> {
        let mut tx = self
            .conn
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // 1) Append the audit entry
        let moved_at = ts(commit.at);
        let inserted = sqlx::query(
            "INSERT INTO history \
             (session_id, item_code, team_id, action_type, prev_qty, result_qty, moved_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(commit.session_id.get())
        .bind(&commit.item_code)
        .bind(commit.team_id.get())
        .bind(commit.change.action.as_str())
        .bind(commit.change.previous)
        .bind(commit.change.resulting)
        .bind(&moved_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_history", e))?;
        let history_id = inserted.last_insert_rowid();

        if let Err(e) = ensure_open(&mut tx, commit.session_id).await {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(e);
        }

        // 2) + 3) Conditional update of the item row
        let expected = i64::try_from(commit.expected_version).unwrap_or(i64::MAX);
        let updated = sqlx::query(&format!(
            "UPDATE items SET physical_count = ?, note = ?, counted_at = ?, last_team_id = ?, \
             version = version + 1, change_seq = {NEXT_SEQ} \
             WHERE session_id = ? AND code = ? AND version = ?"
        ))
        .bind(commit.change.resulting)
        .bind(&commit.note)
        .bind(&moved_at)
        .bind(commit.team_id.get())
        .bind(commit.session_id.get())
        .bind(commit.session_id.get())
        .bind(&commit.item_code)
        .bind(expected)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_item", e))?;

        if updated.rows_affected() == 0 {
            let current = load_item(&mut tx, commit.session_id, &commit.item_code).await?;
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(match current {
                None => StorageError::NotFound(format!("item {}", commit.item_code)),
                Some(item) => StorageError::VersionConflict {
                    code: commit.item_code.clone(),
                    expected: commit.expected_version,
                    actual: Some(item.version),
                },
            });
        }

        let item = load_item(&mut tx, commit.session_id, &commit.item_code)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("item {}", commit.item_code)))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let entry = HistoryEntry {
            id: HistoryEntryId::new(history_id),
            session_id: commit.session_id,
            item_code: commit.item_code.clone(),
            team_id: commit.team_id,
            action: commit.change.action,
            previous_quantity: commit.change.previous,
            resulting_quantity: commit.change.resulting,
            timestamp: parse_ts(&moved_at)?,
        };
        Ok((item, entry))
    }

    async fn entries_for(
        &mut self,
        session: SessionId,
        code: &str,
    ) -> Result<Vec<HistoryEntry>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM history \
             WHERE session_id = ? AND item_code = ? ORDER BY id"
        ))
        .bind(session.get())
        .bind(code)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| map_sqlx_error("entries_for", e))?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn recent_entries(
        &mut self,
        session: SessionId,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM history \
             WHERE session_id = ? ORDER BY id DESC LIMIT ?"
        ))
        .bind(session.get())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| map_sqlx_error("recent_entries", e))?;
        rows.iter().map(entry_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_counting::CountChange;
    use tempfile::TempDir;

    async fn test_storage() -> (TempDir, SqliteConnector, SqliteStorage, Session) {
        let dir = tempfile::tempdir().unwrap();
        let connector = SqliteConnector::at_path(dir.path().join("tally.db"));
        let mut conn = connector.connect().await.unwrap();
        let session = conn
            .create_session(&NewSession::named("sqlite"), Utc::now())
            .await
            .unwrap();
        let seeds = ItemSeed::normalize_batch(&[
            ItemSeed::new("a1", "Alpha", 10.0).with_line("L1"),
            ItemSeed::new("b2", "Beta", 2.5),
        ])
        .unwrap();
        conn.bulk_load(session.id, &seeds).await.unwrap();
        (dir, connector, conn, session)
    }

    fn commit(session: SessionId, team: i64, expected: u64, change: CountChange) -> CountCommit {
        CountCommit {
            session_id: session,
            item_code: "A1".to_string(),
            team_id: TeamId::new(team),
            change,
            note: Some("aisle 4".to_string()),
            expected_version: expected,
            at: Utc::now(),
        }
    }

    fn new_count(prev: f64, result: f64) -> CountChange {
        CountChange {
            action: ActionType::New,
            previous: prev,
            resulting: result,
        }
    }

    #[test]
    fn timestamps_round_trip_at_microsecond_precision() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T10:11:12.345678Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parse_ts(&ts(at)).unwrap(), at);
        assert_eq!(ts(at), "2024-05-01T10:11:12.345678Z");
    }

    #[tokio::test]
    async fn bulk_load_assigns_increasing_change_seq() {
        let (_dir, _connector, mut conn, session) = test_storage().await;
        let items = conn.items_changed_since(session.id, None).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].code, "A1");
        assert_eq!(items[0].line, "L1");
        assert_eq!(items[1].line, tally_counting::DEFAULT_LINE);
        assert!(items[0].change_seq < items[1].change_seq);
        assert!(items.iter().all(|i| i.version == 0 && !i.is_counted()));
    }

    #[tokio::test]
    async fn commit_and_conflict_are_transactional() {
        let (_dir, _connector, mut conn, session) = test_storage().await;

        let (item, entry) = conn
            .commit_count(&commit(session.id, 1, 0, new_count(0.0, 10.0)))
            .await
            .unwrap();
        assert_eq!(item.physical_count, 10.0);
        assert_eq!(item.version, 1);
        assert_eq!(item.last_team_id, Some(TeamId::new(1)));
        assert_eq!(item.note.as_deref(), Some("aisle 4"));
        assert_eq!(entry.action, ActionType::New);

        let err = conn
            .commit_count(&commit(session.id, 2, 0, new_count(0.0, 3.0)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StorageError::VersionConflict {
                code: "A1".to_string(),
                expected: 0,
                actual: Some(1)
            }
        );

        let trail = conn.entries_for(session.id, "A1").await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0], entry);
    }

    #[tokio::test]
    async fn history_follows_commit_order_when_station_clocks_disagree() {
        let (_dir, connector, mut station_a, session) = test_storage().await;
        let mut station_b = connector.connect().await.unwrap();

        let mut first = commit(session.id, 1, 0, new_count(0.0, 10.0));
        first.at = Utc::now() + chrono::Duration::minutes(2);
        station_a.commit_count(&first).await.unwrap();

        let second = CountCommit {
            team_id: TeamId::new(2),
            change: CountChange {
                action: ActionType::Sum,
                previous: 10.0,
                resulting: 15.0,
            },
            expected_version: 1,
            at: Utc::now(),
            ..first.clone()
        };
        let (item, _) = station_b.commit_count(&second).await.unwrap();
        assert_eq!(item.physical_count, 15.0);

        let trail = station_a.entries_for(session.id, "A1").await.unwrap();
        let steps: Vec<_> = trail
            .iter()
            .map(|e| (e.action, e.resulting_quantity))
            .collect();
        assert_eq!(steps, vec![(ActionType::New, 10.0), (ActionType::Sum, 15.0)]);
        tally_counting::verify_trail(&item, &trail).unwrap();

        let recent = station_a.recent_entries(session.id, 1).await.unwrap();
        assert_eq!(recent[0].action, ActionType::Sum);
        assert_eq!(recent[0].resulting_quantity, 15.0);
    }

    #[tokio::test]
    async fn delta_fetch_sees_only_rows_after_watermark() {
        let (_dir, connector, mut conn, session) = test_storage().await;
        let mark = conn
            .items_changed_since(session.id, None)
            .await
            .unwrap()
            .iter()
            .map(|i| i.change_seq)
            .max();

        let mut other = connector.connect().await.unwrap();
        other
            .commit_count(&commit(session.id, 1, 0, new_count(0.0, 1.0)))
            .await
            .unwrap();

        let delta = conn.items_changed_since(session.id, mark).await.unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].physical_count, 1.0);
        assert!(delta[0].change_seq > mark.unwrap());
    }

    #[tokio::test]
    async fn teams_and_sessions_lifecycle() {
        let (_dir, _connector, mut conn, session) = test_storage().await;

        let team = conn
            .insert_team(&NewTeam::new("Team 1", ["ANA", "LUIS"]), Utc::now())
            .await
            .unwrap();
        assert_eq!(team.members, vec!["ANA".to_string(), "LUIS".to_string()]);
        assert!(matches!(
            conn.insert_team(&NewTeam::new("Team 1", ["X"]), Utc::now()).await,
            Err(StorageError::Duplicate(_))
        ));
        conn.deactivate_team(team.id).await.unwrap();
        assert!(conn.list_teams(false).await.unwrap().is_empty());
        assert_eq!(conn.list_teams(true).await.unwrap().len(), 1);

        let latest = conn.latest_active_session().await.unwrap().unwrap();
        assert_eq!(latest.id, session.id);
        let closed = conn.close_session(session.id, Utc::now()).await.unwrap();
        assert!(closed.is_closed());
        assert_eq!(
            conn.close_session(session.id, Utc::now()).await.unwrap_err(),
            StorageError::SessionClosed(session.id.get())
        );
        assert!(conn.latest_active_session().await.unwrap().is_none());

        let err = conn
            .commit_count(&commit(session.id, 1, 0, new_count(0.0, 1.0)))
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::SessionClosed(session.id.get()));
        assert!(conn.recent_entries(session.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn extra_items_and_stock_refresh() {
        let (_dir, _connector, mut conn, session) = test_storage().await;
        let extra = ItemSeed::new("zz9", "Found on floor", 0.0).normalized().unwrap();
        let item = conn.insert_extra_item(session.id, &extra).await.unwrap();
        assert_eq!(item.system_stock, 0.0);
        assert!(matches!(
            conn.insert_extra_item(session.id, &extra).await,
            Err(StorageError::Duplicate(_))
        ));

        let stock = HashMap::from([("A1".to_string(), 42.0)]);
        assert_eq!(conn.update_system_stock(session.id, &stock).await.unwrap(), 3);
        let a1 = conn.fetch_item(session.id, "A1").await.unwrap().unwrap();
        let b2 = conn.fetch_item(session.id, "B2").await.unwrap().unwrap();
        assert_eq!(a1.system_stock, 42.0);
        assert_eq!(a1.version, 1);
        assert_eq!(b2.system_stock, 0.0);
    }
}
