use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tally_core::{HistoryEntryId, ItemId, SessionId, TeamId};
use tally_counting::{HistoryEntry, Item, ItemSeed, NewSession, NewTeam, Session, Team};

use super::r#trait::{CountCommit, CountStorage, StorageConnector};
use crate::error::{ConnectionError, StorageError};

#[derive(Debug, Default)]
struct State {
    sessions: Vec<Session>,
    teams: Vec<Team>,
    items: HashMap<SessionId, HashMap<String, Item>>,
    change_seq: HashMap<SessionId, u64>,
    history: Vec<HistoryEntry>,
    last_session_id: i64,
    last_team_id: i64,
    last_item_id: i64,
    last_history_id: i64,
}

impl State {
    fn session(&self, id: SessionId) -> Result<&Session, StorageError> {
        self.sessions
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("session {id}")))
    }

    fn ensure_open(&self, id: SessionId) -> Result<(), StorageError> {
        if self.session(id)?.active {
            Ok(())
        } else {
            Err(StorageError::SessionClosed(id.get()))
        }
    }

    fn next_seq(&mut self, session: SessionId) -> u64 {
        let seq = self.change_seq.entry(session).or_insert(0);
        *seq += 1;
        *seq
    }

    fn new_item(&mut self, session: SessionId, seed: &ItemSeed) -> Item {
        self.last_item_id += 1;
        let change_seq = self.next_seq(session);
        Item {
            id: ItemId::new(self.last_item_id),
            session_id: session,
            code: seed.code.clone(),
            product: seed.product.clone(),
            line: seed.line_or_default().to_string(),
            system_stock: seed.system_stock,
            physical_count: 0.0,
            note: None,
            last_counted_at: None,
            last_team_id: None,
            version: 0,
            change_seq,
        }
    }
}

/// Knobs that let tests simulate a misbehaving backend.
#[derive(Debug, Default)]
struct Faults {
    generation: AtomicU64,
    refused_connects: AtomicUsize,
    forced_conflicts: AtomicUsize,
    failed_fetches: AtomicUsize,
    latency_ms: AtomicU64,
    validation_latency_ms: AtomicU64,
    connects: AtomicUsize,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory storage shared by every connection opened from it.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            storage: self.clone(),
        }
    }

    /// Invalidate every connection opened so far.
    pub fn kill_connections(&self) {
        self.faults.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Make the next `n` connection attempts fail.
    pub fn refuse_connects(&self, n: usize) {
        self.faults.refused_connects.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` commits fail their version check, as if another
    /// writer got there first.
    pub fn inject_version_conflicts(&self, n: usize) {
        self.faults.forced_conflicts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` delta fetches fail with a backend error.
    pub fn fail_fetches(&self, n: usize) {
        self.faults.failed_fetches.store(n, Ordering::SeqCst);
    }

    /// Delay every storage call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every liveness check on an idle connection by `latency`.
    pub fn set_validation_latency(&self, latency: Duration) {
        self.faults
            .validation_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of connections successfully opened.
    pub fn connects_opened(&self) -> usize {
        self.faults.connects.load(Ordering::SeqCst)
    }

    /// All history rows of a session in insertion order.
    pub fn history_snapshot(&self, session: SessionId) -> Vec<HistoryEntry> {
        match self.state.lock() {
            Ok(state) => state
                .history
                .iter()
                .filter(|e| e.session_id == session)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    storage: InMemoryStorage,
}

#[async_trait]
impl StorageConnector for InMemoryConnector {
    type Connection = InMemoryConnection;

    async fn connect(&self) -> Result<InMemoryConnection, ConnectionError> {
        let faults = &self.storage.faults;
        if take_one(&faults.refused_connects) {
            return Err(ConnectionError::Connect("connection refused".to_string()));
        }
        faults.connects.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryConnection {
            storage: self.storage.clone(),
            generation: faults.generation.load(Ordering::SeqCst),
        })
    }

    async fn is_valid(&self, conn: &mut InMemoryConnection) -> bool {
        let latency = self.storage.faults.validation_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        conn.is_alive()
    }
}

#[derive(Debug)]
pub struct InMemoryConnection {
    storage: InMemoryStorage,
    generation: u64,
}

impl InMemoryConnection {
    fn is_alive(&self) -> bool {
        self.generation == self.storage.faults.generation.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), StorageError> {
        let latency = self.storage.faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.is_alive() {
            return Err(StorageError::Backend("connection lost".to_string()));
        }
        Ok(())
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StorageError> {
        self.storage
            .state
            .lock()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))
    }
}

#[async_trait]
impl CountStorage for InMemoryConnection {
    async fn create_session(
        &mut self,
        new: &NewSession,
        started_at: DateTime<Utc>,
    ) -> Result<Session, StorageError> {
        self.enter().await?;
        let mut state = self.state()?;
        state.last_session_id += 1;
        let session = Session {
            id: SessionId::new(state.last_session_id),
            name: new.name.clone(),
            responsible: new.responsible.clone(),
            warehouse: new.warehouse.clone(),
            started_at,
            ended_at: None,
            active: true,
        };
        state.sessions.push(session.clone());
        Ok(session)
    }

    async fn fetch_session(&mut self, id: SessionId) -> Result<Session, StorageError> {
        self.enter().await?;
        let state = self.state()?;
        state.session(id).cloned()
    }

    async fn latest_active_session(&mut self) -> Result<Option<Session>, StorageError> {
        self.enter().await?;
        let state = self.state()?;
        Ok(state
            .sessions
            .iter()
            .filter(|s| s.active)
            .max_by_key(|s| (s.started_at, s.id))
            .cloned())
    }

    async fn list_sessions(&mut self) -> Result<Vec<Session>, StorageError> {
        self.enter().await?;
        let state = self.state()?;
        let mut sessions = state.sessions.clone();
        sessions.sort_by(|a, b| (b.started_at, b.id).cmp(&(a.started_at, a.id)));
        Ok(sessions)
    }

    async fn close_session(
        &mut self,
        id: SessionId,
        ended_at: DateTime<Utc>,
    ) -> Result<Session, StorageError> {
        self.enter().await?;
        let mut state = self.state()?;
        let session = state
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("session {id}")))?;
        let closed = session
            .closed_at(ended_at)
            .map_err(|_| StorageError::SessionClosed(id.get()))?;
        *session = closed.clone();
        Ok(closed)
    }

    async fn insert_team(
        &mut self,
        new: &NewTeam,
        created_at: DateTime<Utc>,
    ) -> Result<Team, StorageError> {
        self.enter().await?;
        let mut state = self.state()?;
        if state.teams.iter().any(|t| t.name == new.name) {
            return Err(StorageError::Duplicate(format!("team name {}", new.name)));
        }
        state.last_team_id += 1;
        let team = Team {
            id: TeamId::new(state.last_team_id),
            name: new.name.clone(),
            members: new.members.clone(),
            active: true,
            created_at,
        };
        state.teams.push(team.clone());
        Ok(team)
    }

    async fn deactivate_team(&mut self, id: TeamId) -> Result<Team, StorageError> {
        self.enter().await?;
        let mut state = self.state()?;
        let team = state
            .teams
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("team {id}")))?;
        team.active = false;
        Ok(team.clone())
    }

    async fn list_teams(&mut self, include_inactive: bool) -> Result<Vec<Team>, StorageError> {
        self.enter().await?;
        let state = self.state()?;
        let mut teams: Vec<Team> = state
            .teams
            .iter()
            .filter(|t| include_inactive || t.active)
            .cloned()
            .collect();
        teams.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(teams)
    }

    async fn bulk_load(
        &mut self,
        session: SessionId,
        seeds: &[ItemSeed],
    ) -> Result<Vec<Item>, StorageError> {
        self.enter().await?;
        let mut state = self.state()?;
        state.ensure_open(session)?;
        let existing = state.items.get(&session);
        for seed in seeds {
            if existing.is_some_and(|items| items.contains_key(&seed.code)) {
                return Err(StorageError::Duplicate(format!("item code {}", seed.code)));
            }
        }
        let mut loaded = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let item = state.new_item(session, seed);
            state
                .items
                .entry(session)
                .or_default()
                .insert(item.code.clone(), item.clone());
            loaded.push(item);
        }
        Ok(loaded)
    }

    async fn insert_extra_item(
        &mut self,
        session: SessionId,
        seed: &ItemSeed,
    ) -> Result<Item, StorageError> {
        self.enter().await?;
        let mut state = self.state()?;
        state.ensure_open(session)?;
        if state
            .items
            .get(&session)
            .is_some_and(|items| items.contains_key(&seed.code))
        {
            return Err(StorageError::Duplicate(format!("item code {}", seed.code)));
        }
        let item = state.new_item(session, seed);
        state
            .items
            .entry(session)
            .or_default()
            .insert(item.code.clone(), item.clone());
        Ok(item)
    }

    async fn update_system_stock(
        &mut self,
        session: SessionId,
        stock_by_code: &HashMap<String, f64>,
    ) -> Result<u64, StorageError> {
        self.enter().await?;
        let mut state = self.state()?;
        state.ensure_open(session)?;
        let mut codes: Vec<String> = state
            .items
            .get(&session)
            .map(|items| items.keys().cloned().collect())
            .unwrap_or_default();
        codes.sort();
        let mut touched = 0;
        for code in codes {
            let seq = state.next_seq(session);
            if let Some(item) = state.items.get_mut(&session).and_then(|m| m.get_mut(&code)) {
                item.system_stock = stock_by_code.get(&code).copied().unwrap_or(0.0);
                item.version += 1;
                item.change_seq = seq;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn fetch_item(
        &mut self,
        session: SessionId,
        code: &str,
    ) -> Result<Option<Item>, StorageError> {
        self.enter().await?;
        let state = self.state()?;
        Ok(state.items.get(&session).and_then(|m| m.get(code)).cloned())
    }

    async fn items_changed_since(
        &mut self,
        session: SessionId,
        watermark: Option<u64>,
    ) -> Result<Vec<Item>, StorageError> {
        self.enter().await?;
        if take_one(&self.storage.faults.failed_fetches) {
            return Err(StorageError::Backend("injected fetch failure".to_string()));
        }
        let state = self.state()?;
        let floor = watermark.unwrap_or(0);
        let mut rows: Vec<Item> = state
            .items
            .get(&session)
            .map(|m| {
                m.values()
                    .filter(|i| watermark.is_none() || i.change_seq > floor)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|i| i.change_seq);
        Ok(rows)
    }

    async fn commit_count(
        &mut self,
        commit: &CountCommit,
    ) -> Result<(Item, HistoryEntry), StorageError> {
        self.enter().await?;
        let mut state = self.state()?;
        state.ensure_open(commit.session_id)?;

        let current = state
            .items
            .get(&commit.session_id)
            .and_then(|m| m.get(&commit.item_code))
            .ok_or_else(|| StorageError::NotFound(format!("item {}", commit.item_code)))?;
        let current_version = current.version;

        let forced = take_one(&self.storage.faults.forced_conflicts);
        if forced || commit.expected_version != current_version {
            return Err(StorageError::VersionConflict {
                code: commit.item_code.clone(),
                expected: commit.expected_version,
                actual: Some(current_version),
            });
        }

        state.last_history_id += 1;
        let entry = HistoryEntry {
            id: HistoryEntryId::new(state.last_history_id),
            session_id: commit.session_id,
            item_code: commit.item_code.clone(),
            team_id: commit.team_id,
            action: commit.change.action,
            previous_quantity: commit.change.previous,
            resulting_quantity: commit.change.resulting,
            timestamp: commit.at,
        };
        let seq = state.next_seq(commit.session_id);
        let item = state
            .items
            .get_mut(&commit.session_id)
            .and_then(|m| m.get_mut(&commit.item_code))
            .ok_or_else(|| StorageError::NotFound(format!("item {}", commit.item_code)))?;
        let mut updated =
            item.with_count(&commit.change, commit.team_id, commit.note.clone(), commit.at);
        updated.change_seq = seq;
        *item = updated.clone();
        state.history.push(entry.clone());
        Ok((updated, entry))
    }

    async fn entries_for(
        &mut self,
        session: SessionId,
        code: &str,
    ) -> Result<Vec<HistoryEntry>, StorageError> {
        self.enter().await?;
        let state = self.state()?;
        Ok(state
            .history
            .iter()
            .filter(|e| e.session_id == session && e.item_code == code)
            .cloned()
            .collect())
    }

    async fn recent_entries(
        &mut self,
        session: SessionId,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StorageError> {
        self.enter().await?;
        let state = self.state()?;
        Ok(state
            .history
            .iter()
            .rev()
            .filter(|e| e.session_id == session)
            .take(limit)
            .cloned()
            .collect())
    }
}
