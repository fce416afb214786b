//! Periodic pull-merge-publish loop.
//!
//! ## State machine
//!
//! `Idle -> Running -> Idle`, held in an atomic and entered by
//! compare-and-swap. A tick (timer or manual) that finds the scheduler
//! `Running` is skipped and logged, never queued.
//!
//! ## Cycle
//!
//! 1. acquire a pooled connection
//! 2. fetch rows above the cache watermark (everything on the first run)
//! 3. merge them into the cache
//! 4. on every N-th cycle, or when a refresh was requested, build the heavy
//!    session report
//! 5. publish a snapshot-ready message
//!
//! Failures abort only the current cycle; the loop carries on at the next tick.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use tally_core::SessionId;
use tally_counting::{KpiReport, SessionReport};
use tally_infra::{ConnectionPool, CountStorage, HistoryLedger, StorageConnector};

use crate::bus::{SnapshotBus, SnapshotOrigin};
use crate::cache::{ItemCache, MergeStats};
use crate::config::EngineConfig;
use crate::error::CountError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum SchedulerState {
    Idle = 0,
    Running = 1,
}

impl SchedulerState {
    fn from_u8(raw: u8) -> Self {
        if raw == SchedulerState::Running as u8 {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// Another cycle was still running.
    Busy,
    /// No session is attached to the cache.
    NoSession,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub session_id: SessionId,
    pub merge: MergeStats,
    pub heavy: bool,
    pub kpis: KpiReport,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    Skipped(SkipReason),
    Failed(CountError),
}

#[derive(Debug, Clone, Copy)]
struct SchedulerSettings {
    poll_interval: Duration,
    heavy_every: u64,
    recent_history_limit: usize,
    report_row_limit: usize,
}

impl From<&EngineConfig> for SchedulerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            heavy_every: config.heavy_refresh_every_n_cycles.max(1),
            recent_history_limit: config.recent_history_limit,
            report_row_limit: config.report_row_limit,
        }
    }
}

struct SchedulerInner<C: StorageConnector> {
    pool: ConnectionPool<C>,
    ledger: HistoryLedger<C>,
    cache: Arc<ItemCache>,
    bus: Arc<SnapshotBus>,
    settings: SchedulerSettings,
    state: AtomicU8,
    cycles: AtomicU64,
    refresh_requested: AtomicBool,
    trigger: Notify,
    shutdown: Notify,
}

/// Marks the scheduler `Running` for as long as it lives.
struct RunningGuard<C: StorageConnector> {
    inner: Arc<SchedulerInner<C>>,
}

impl<C: StorageConnector> RunningGuard<C> {
    fn try_enter(inner: &Arc<SchedulerInner<C>>) -> Option<Self> {
        inner
            .state
            .compare_exchange(
                SchedulerState::Idle as u8,
                SchedulerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| RunningGuard {
                inner: Arc::clone(inner),
            })
    }
}

impl<C: StorageConnector> Drop for RunningGuard<C> {
    fn drop(&mut self) {
        self.inner
            .state
            .store(SchedulerState::Idle as u8, Ordering::Release);
    }
}

pub struct SyncScheduler<C: StorageConnector> {
    inner: Arc<SchedulerInner<C>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C: StorageConnector> SyncScheduler<C> {
    pub fn new(
        pool: ConnectionPool<C>,
        ledger: HistoryLedger<C>,
        cache: Arc<ItemCache>,
        bus: Arc<SnapshotBus>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                pool,
                ledger,
                cache,
                bus,
                settings: SchedulerSettings::from(config),
                state: AtomicU8::new(SchedulerState::Idle as u8),
                cycles: AtomicU64::new(0),
                refresh_requested: AtomicBool::new(false),
                trigger: Notify::new(),
                shutdown: Notify::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Cycles started so far (skipped-for-busy ticks are not counted).
    pub fn cycles_started(&self) -> u64 {
        self.inner.cycles.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.worker
            .lock()
            .map(|w| w.is_some())
            .unwrap_or(false)
    }

    /// Spawn the background loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *worker = Some(tokio::spawn(run_loop(inner)));
    }

    /// Run one cycle on the caller's task, unless one is already running.
    pub async fn run_cycle_now(&self) -> CycleOutcome {
        match RunningGuard::try_enter(&self.inner) {
            Some(_guard) => self.inner.cycle().await,
            None => {
                info!("sync already running; skipping manual trigger");
                CycleOutcome::Skipped(SkipReason::Busy)
            }
        }
    }

    /// Make the next cycle build the heavy report and wake the loop now.
    pub fn request_refresh(&self) {
        self.inner.refresh_requested.store(true, Ordering::SeqCst);
        self.inner.trigger.notify_one();
    }

    /// Wake the loop for an early cycle.
    pub fn trigger(&self) {
        self.inner.trigger.notify_one();
    }

    /// Stop the loop and wait for the in-flight cycle to finish.
    pub async fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            self.inner.shutdown.notify_one();
            if let Err(e) = handle.await {
                warn!(error = %e, "sync loop ended abnormally");
            }
        }
    }
}

async fn run_loop<C: StorageConnector>(inner: Arc<SchedulerInner<C>>) {
    info!(
        interval_secs = inner.settings.poll_interval.as_secs(),
        heavy_every = inner.settings.heavy_every,
        "sync scheduler started"
    );

    let mut interval = tokio::time::interval(inner.settings.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: Option<JoinHandle<CycleOutcome>> = None;

    loop {
        tokio::select! {
            _ = inner.shutdown.notified() => {
                info!("sync scheduler received shutdown signal");
                break;
            }
            _ = interval.tick() => {}
            _ = inner.trigger.notified() => {
                debug!("sync triggered early");
            }
        }

        match RunningGuard::try_enter(&inner) {
            Some(guard) => {
                let cycle_inner = Arc::clone(&inner);
                in_flight = Some(tokio::spawn(async move {
                    let _guard = guard;
                    cycle_inner.cycle().await
                }));
            }
            None => info!("previous sync cycle still running; skipping tick"),
        }
    }

    if let Some(handle) = in_flight {
        if let Err(e) = handle.await {
            warn!(error = %e, "in-flight sync cycle panicked");
        }
    }
    info!("sync scheduler stopped");
}

impl<C: StorageConnector> SchedulerInner<C> {
    async fn cycle(&self) -> CycleOutcome {
        let snapshot = self.cache.snapshot();
        let Some(session) = snapshot.session_id() else {
            debug!("no active session; skipping sync cycle");
            return CycleOutcome::Skipped(SkipReason::NoSession);
        };
        let watermark = snapshot.watermark();
        drop(snapshot);

        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let requested = self.refresh_requested.swap(false, Ordering::SeqCst);
        let heavy = requested || cycle % self.settings.heavy_every == 0;

        match self.sync_once(cycle, session, watermark, heavy).await {
            Ok(report) => {
                debug!(
                    cycle,
                    applied = report.merge.applied,
                    stale = report.merge.stale,
                    heavy,
                    "sync cycle completed"
                );
                CycleOutcome::Completed(report)
            }
            Err(e) => {
                if requested {
                    self.refresh_requested.store(true, Ordering::SeqCst);
                }
                error!(cycle, session_id = %session, error = %e, "sync cycle failed");
                CycleOutcome::Failed(e)
            }
        }
    }

    async fn sync_once(
        &self,
        cycle: u64,
        session: SessionId,
        watermark: Option<u64>,
        heavy: bool,
    ) -> Result<CycleReport, CountError> {
        let rows = {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| CountError::fatal_sync(format!("cannot acquire connection: {e}")))?;
            conn.items_changed_since(session, watermark)
                .await
                .map_err(|e| CountError::fatal_sync(format!("delta fetch failed: {e}")))?
        };
        let merge = self.cache.apply_delta(rows);

        let report = if heavy {
            let recent = self
                .ledger
                .recent_entries(session, self.settings.recent_history_limit)
                .await
                .map_err(|e| CountError::fatal_sync(format!("history fetch failed: {e}")))?;
            let snapshot = self.cache.snapshot();
            Some(Arc::new(SessionReport::build(
                snapshot.items(),
                recent,
                &self.bus.line_filter(),
                self.settings.report_row_limit,
            )))
        } else {
            None
        };

        let published =
            self.bus
                .publish_snapshot(self.cache.snapshot(), report, SnapshotOrigin::Sync { cycle });

        Ok(CycleReport {
            cycle,
            session_id: session,
            merge,
            heavy,
            kpis: published.kpis,
        })
    }
}
