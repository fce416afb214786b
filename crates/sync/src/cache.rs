//! Authoritative in-memory view of the active session's items.
//!
//! Readers take an `Arc<Snapshot>` and keep it as long as they like; writers
//! build a new map and swap the pointer. A snapshot never changes once
//! published. Items are shared between consecutive snapshots, so a swap
//! copies one pointer per item and clones only the rows that changed.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use tally_core::SessionId;
use tally_counting::{Item, KpiReport, LineFilter};

/// Immutable code → item map for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    session_id: Option<SessionId>,
    items: HashMap<String, Arc<Item>>,
    watermark: Option<u64>,
}

impl Snapshot {
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Highest `change_seq` merged from storage; `None` until the first fetch.
    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    pub fn get(&self, code: &str) -> Option<&Item> {
        self.items.get(code).map(Arc::as_ref)
    }

    /// The shared handle behind [`Snapshot::get`].
    pub fn get_shared(&self, code: &str) -> Option<&Arc<Item>> {
        self.items.get(code)
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values().map(Arc::as_ref)
    }

    /// Items ordered by code, for export.
    pub fn sorted_items(&self) -> Vec<&Item> {
        let mut items: Vec<&Item> = self.items().collect();
        items.sort_by(|a, b| a.code.cmp(&b.code));
        items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn kpis(&self, filter: &LineFilter) -> KpiReport {
        KpiReport::compute(self.items(), filter)
    }
}

/// Outcome of merging a batch of fetched rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    /// Rows that replaced (or added) a cached item.
    pub applied: usize,
    /// Rows whose version was not newer than the cached one.
    pub stale: usize,
    /// Rows belonging to another session.
    pub foreign: usize,
}

#[derive(Debug, Default)]
pub struct ItemCache {
    current: RwLock<Arc<Snapshot>>,
}

/// Install `item` if it is newer than what `items` holds.
fn merge_one(items: &mut HashMap<String, Arc<Item>>, item: Item) -> bool {
    match items.get(&item.code) {
        Some(existing) if existing.version >= item.version => false,
        _ => {
            items.insert(item.code.clone(), Arc::new(item));
            true
        }
    }
}

impl ItemCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&current)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.snapshot().session_id()
    }

    /// Switch to `session` with an empty map; the next sync is a full fetch.
    pub fn reset(&self, session: SessionId) {
        self.swap(|_| Snapshot {
            session_id: Some(session),
            items: HashMap::new(),
            watermark: None,
        });
    }

    /// Detach from any session.
    pub fn clear(&self) {
        self.swap(|_| Snapshot::default());
    }

    /// Merge rows fetched from storage (last writer wins by version).
    ///
    /// Rows of other sessions are dropped. The watermark advances to the
    /// highest `change_seq` seen for this session, stale rows included.
    pub fn apply_delta(&self, rows: Vec<Item>) -> MergeStats {
        let mut stats = MergeStats::default();
        self.swap(|old| {
            let mut next = old.clone();
            for row in rows {
                if Some(row.session_id) != old.session_id {
                    stats.foreign += 1;
                    continue;
                }
                let seq = row.change_seq;
                if merge_one(&mut next.items, row) {
                    stats.applied += 1;
                } else {
                    stats.stale += 1;
                }
                next.watermark = Some(next.watermark.map_or(seq, |w| w.max(seq)));
            }
            next
        });
        stats
    }

    /// Install a just-committed item without touching the watermark.
    ///
    /// Returns `false` if the cache already holds the same or a newer version
    /// or the item belongs to another session.
    pub fn publish_local(&self, item: Item) -> bool {
        let mut installed = false;
        self.swap(|old| {
            if Some(item.session_id) != old.session_id {
                return old.clone();
            }
            let mut next = old.clone();
            installed = merge_one(&mut next.items, item);
            next
        });
        installed
    }

    fn swap(&self, build: impl FnOnce(&Snapshot) -> Snapshot) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = build(&current);
        *current = Arc::new(next);
    }
}
