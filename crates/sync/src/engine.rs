//! Top-level handle that owns the pool, cache, bus, resolver and scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use tally_core::{SessionId, TeamId};
use tally_counting::validate::normalize_code;
use tally_counting::{
    HistoryEntry, Item, ItemSeed, KpiReport, LineFilter, NewSession, NewTeam, Session, Team,
    verify_trail,
};
use tally_infra::{ConnectionPool, CountStorage, HistoryLedger, StorageConnector};

use crate::bus::{SnapshotBus, SnapshotOrigin, SnapshotReady, Subscription};
use crate::cache::{ItemCache, Snapshot};
use crate::config::EngineConfig;
use crate::error::CountError;
use crate::resolver::{ConflictResolver, CountSubmission, SubmitOutcome};
use crate::scheduler::{CycleOutcome, SchedulerState, SkipReason, SyncScheduler};

pub struct CountEngine<C: StorageConnector> {
    config: EngineConfig,
    pool: ConnectionPool<C>,
    ledger: HistoryLedger<C>,
    cache: Arc<ItemCache>,
    bus: Arc<SnapshotBus>,
    resolver: ConflictResolver<C>,
    scheduler: SyncScheduler<C>,
}

impl<C: StorageConnector> CountEngine<C> {
    pub fn new(connector: C, config: EngineConfig) -> Result<Self, CountError> {
        config.validate()?;

        let pool = ConnectionPool::new(connector, config.pool_config());
        let ledger = HistoryLedger::new(pool.clone());
        let cache = Arc::new(ItemCache::new());
        let bus = Arc::new(SnapshotBus::new());
        let resolver = ConflictResolver::new(
            pool.clone(),
            Arc::clone(&cache),
            Arc::clone(&bus),
            config.max_commit_retries,
            config.retry_backoff(),
        );
        let scheduler = SyncScheduler::new(
            pool.clone(),
            ledger.clone(),
            Arc::clone(&cache),
            Arc::clone(&bus),
            &config,
        );

        Ok(Self {
            config,
            pool,
            ledger,
            cache,
            bus,
            resolver,
            scheduler,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the background sync loop.
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Stop the loop, wait for its in-flight cycle, then drain and close the pool.
    pub async fn shutdown(&self) -> Result<(), CountError> {
        self.scheduler.shutdown().await;
        self.pool.close(self.config.acquire_timeout()).await?;
        info!("count engine shut down");
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.cache.snapshot()
    }

    /// KPIs of the current snapshot under the bus line filter.
    pub fn kpis(&self) -> KpiReport {
        self.cache.snapshot().kpis(&self.bus.line_filter())
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn on_snapshot_ready<F>(&self, callback: F)
    where
        F: Fn(&SnapshotReady) + Send + Sync + 'static,
    {
        self.bus.on_snapshot_ready(callback);
    }

    pub fn set_line_filter(&self, filter: LineFilter) {
        self.bus.set_line_filter(filter);
    }

    pub fn active_session_id(&self) -> Option<SessionId> {
        self.cache.session_id()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Create a session, load its items and make it the active one.
    ///
    /// When the session has no warehouse, the first seed that names one
    /// provides it.
    #[instrument(skip(self, new, seeds), fields(seeds = seeds.len()), err)]
    pub async fn start_session(
        &self,
        new: NewSession,
        seeds: &[ItemSeed],
    ) -> Result<Session, CountError> {
        let mut new = new.validated()?;
        let seeds = ItemSeed::normalize_batch(seeds)?;
        if new.warehouse.is_none() {
            new.warehouse = seeds.iter().find_map(|s| s.warehouse.clone());
        }

        let mut conn = self.pool.acquire().await?;
        let session = conn.create_session(&new, Utc::now()).await?;
        let items = conn.bulk_load(session.id, &seeds).await?;
        drop(conn);

        self.cache.reset(session.id);
        self.cache.apply_delta(items);
        self.bus
            .publish_snapshot(self.cache.snapshot(), None, SnapshotOrigin::Session);

        info!(session_id = %session.id, items = seeds.len(), "session started");
        Ok(session)
    }

    /// Re-attach to an existing session with a full fetch.
    #[instrument(skip(self), err)]
    pub async fn open_session(&self, id: SessionId) -> Result<Session, CountError> {
        let mut conn = self.pool.acquire().await?;
        let session = conn.fetch_session(id).await?;
        let items = conn.items_changed_since(id, None).await?;
        drop(conn);

        if session.is_closed() {
            warn!(session_id = %id, "opening a closed session; counts will be rejected");
        }
        self.cache.reset(id);
        self.cache.apply_delta(items);
        self.bus
            .publish_snapshot(self.cache.snapshot(), None, SnapshotOrigin::Session);
        Ok(session)
    }

    /// Attach to the most recently started active session, if any.
    pub async fn open_latest_session(&self) -> Result<Option<Session>, CountError> {
        let latest = {
            let mut conn = self.pool.acquire().await?;
            conn.latest_active_session().await?
        };
        match latest {
            Some(session) => self.open_session(session.id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Mark a session inactive. Closing the active session detaches the cache.
    #[instrument(skip(self), err)]
    pub async fn close_session(&self, id: SessionId) -> Result<Session, CountError> {
        let session = {
            let mut conn = self.pool.acquire().await?;
            conn.close_session(id, Utc::now()).await?
        };
        if self.cache.session_id() == Some(id) {
            self.cache.clear();
            self.bus
                .publish_snapshot(self.cache.snapshot(), None, SnapshotOrigin::Session);
        }
        info!(session_id = %id, "session closed");
        Ok(session)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, CountError> {
        let mut conn = self.pool.acquire().await?;
        Ok(conn.list_sessions().await?)
    }

    #[instrument(skip(self, new), fields(name = %new.name), err)]
    pub async fn register_team(&self, new: NewTeam) -> Result<Team, CountError> {
        let new = new.validated()?;
        let mut conn = self.pool.acquire().await?;
        Ok(conn.insert_team(&new, Utc::now()).await?)
    }

    pub async fn deactivate_team(&self, id: TeamId) -> Result<Team, CountError> {
        let mut conn = self.pool.acquire().await?;
        Ok(conn.deactivate_team(id).await?)
    }

    pub async fn list_teams(&self, include_inactive: bool) -> Result<Vec<Team>, CountError> {
        let mut conn = self.pool.acquire().await?;
        Ok(conn.list_teams(include_inactive).await?)
    }

    /// Load more import rows into the active session.
    #[instrument(skip(self, seeds), fields(seeds = seeds.len()), err)]
    pub async fn bulk_load(&self, seeds: &[ItemSeed]) -> Result<usize, CountError> {
        let session = self.require_session()?;
        let seeds = ItemSeed::normalize_batch(seeds)?;
        let items = {
            let mut conn = self.pool.acquire().await?;
            conn.bulk_load(session, &seeds).await?
        };
        let loaded = items.len();
        self.cache.apply_delta(items);
        self.bus
            .publish_snapshot(self.cache.snapshot(), None, SnapshotOrigin::Session);
        Ok(loaded)
    }

    /// Add an item found on the floor but missing from the import.
    #[instrument(skip(self, product), err)]
    pub async fn add_extra_item(
        &self,
        code: &str,
        product: &str,
        line: Option<&str>,
    ) -> Result<Item, CountError> {
        let session = self.require_session()?;
        let mut seed = ItemSeed::new(code, product, 0.0);
        seed.line = line.map(str::to_string);
        let seed = seed.normalized()?;

        let item = {
            let mut conn = self.pool.acquire().await?;
            conn.insert_extra_item(session, &seed).await?
        };
        self.cache.publish_local(item.clone());
        self.bus
            .publish_snapshot(self.cache.snapshot(), None, SnapshotOrigin::Submission);
        info!(code = %item.code, "extra item added");
        Ok(item)
    }

    /// Overwrite system stock for the active session and pull the result.
    ///
    /// Codes are normalised; items absent from the map drop to 0.
    #[instrument(skip(self, stock_by_code), fields(codes = stock_by_code.len()), err)]
    pub async fn refresh_system_stock(
        &self,
        stock_by_code: &HashMap<String, f64>,
    ) -> Result<u64, CountError> {
        let session = self.require_session()?;
        let mut normalized = HashMap::with_capacity(stock_by_code.len());
        for (code, stock) in stock_by_code {
            if !stock.is_finite() {
                return Err(CountError::validation(format!(
                    "system stock for {code} must be a finite number"
                )));
            }
            normalized.insert(normalize_code(code)?, *stock);
        }

        let touched = {
            let mut conn = self.pool.acquire().await?;
            conn.update_system_stock(session, &normalized).await?
        };
        if let CycleOutcome::Skipped(SkipReason::Busy) = self.scheduler.run_cycle_now().await {
            self.scheduler.trigger();
        }
        Ok(touched)
    }

    pub async fn submit(&self, submission: CountSubmission) -> Result<SubmitOutcome, CountError> {
        self.resolver.submit(submission).await
    }

    /// Build the heavy report on the next cycle, which starts right away.
    pub fn request_refresh(&self) {
        self.scheduler.request_refresh();
    }

    /// Run one sync cycle now on the caller's task.
    pub async fn sync_now(&self) -> CycleOutcome {
        self.scheduler.run_cycle_now().await
    }

    pub async fn history_for(&self, code: &str) -> Result<Vec<HistoryEntry>, CountError> {
        let session = self.require_session()?;
        let code = normalize_code(code)?;
        Ok(self.ledger.entries_for(session, &code).await?)
    }

    pub async fn recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>, CountError> {
        let session = self.require_session()?;
        Ok(self.ledger.recent_entries(session, limit).await?)
    }

    /// Check the stored item against its audit trail.
    pub async fn verify_item(&self, code: &str) -> Result<(), CountError> {
        let session = self.require_session()?;
        let code = normalize_code(code)?;
        let mut conn = self.pool.acquire().await?;
        let item = conn
            .fetch_item(session, &code)
            .await?
            .ok_or_else(|| CountError::validation(format!("unknown item code {code}")))?;
        let entries = conn.entries_for(session, &code).await?;
        Ok(verify_trail(&item, &entries)?)
    }

    fn require_session(&self) -> Result<SessionId, CountError> {
        self.cache
            .session_id()
            .ok_or_else(|| CountError::validation("no active session"))
    }
}
