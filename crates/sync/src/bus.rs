//! One-directional delivery of fresh snapshots to the presentation layer.
//!
//! Two ways to listen: `subscribe()` returns a channel-backed [`Subscription`]
//! (broadcast; every subscriber gets every message) and `on_snapshot_ready()`
//! registers a callback run on the publishing task. Callbacks must be quick
//! and must not block.

use std::sync::{Arc, Mutex, PoisonError, RwLock, mpsc};
use std::time::Duration;

use tally_counting::{KpiReport, LineFilter, SessionReport};

use crate::cache::Snapshot;

/// What produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOrigin {
    /// A sync cycle merged remote state.
    Sync { cycle: u64 },
    /// A direct submission was committed.
    Submission,
    /// A session was started, opened or reloaded.
    Session,
}

#[derive(Debug, Clone)]
pub struct SnapshotReady {
    pub snapshot: Arc<Snapshot>,
    pub kpis: KpiReport,
    /// Present only on heavy refresh cycles.
    pub report: Option<Arc<SessionReport>>,
    pub origin: SnapshotOrigin,
}

/// Receiving end of a bus subscription.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<SnapshotReady>,
}

impl Subscription {
    /// Block until the next message is available.
    pub fn recv(&self) -> Result<SnapshotReady, mpsc::RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<SnapshotReady, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<SnapshotReady, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything queued and keep only the newest message.
    pub fn latest(&self) -> Option<SnapshotReady> {
        self.receiver.try_iter().last()
    }
}

type Callback = Arc<dyn Fn(&SnapshotReady) + Send + Sync>;

#[derive(Default)]
pub struct SnapshotBus {
    subscribers: Mutex<Vec<mpsc::Sender<SnapshotReady>>>,
    callbacks: Mutex<Vec<Callback>>,
    line_filter: RwLock<LineFilter>,
}

impl std::fmt::Debug for SnapshotBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotBus")
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl SnapshotBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Subscription { receiver: rx }
    }

    pub fn on_snapshot_ready<F>(&self, callback: F)
    where
        F: Fn(&SnapshotReady) + Send + Sync + 'static,
    {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Line restriction applied to the KPIs and reports this bus carries.
    pub fn line_filter(&self) -> LineFilter {
        self.line_filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_line_filter(&self, filter: LineFilter) {
        *self.line_filter.write().unwrap_or_else(PoisonError::into_inner) = filter;
    }

    /// Compute KPIs for `snapshot` and fan the message out.
    pub fn publish_snapshot(
        &self,
        snapshot: Arc<Snapshot>,
        report: Option<Arc<SessionReport>>,
        origin: SnapshotOrigin,
    ) -> SnapshotReady {
        let kpis = snapshot.kpis(&self.line_filter());
        let message = SnapshotReady {
            snapshot,
            kpis,
            report,
            origin,
        };
        self.publish(message.clone());
        message
    }

    pub fn publish(&self, message: SnapshotReady) {
        {
            let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop any dead subscribers while publishing.
            subs.retain(|tx| tx.send(message.clone()).is_ok());
        }

        let callbacks: Vec<Callback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(&message);
        }
    }
}
