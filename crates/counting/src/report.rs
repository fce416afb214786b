//! The heavy per-session report rebuilt on selected sync cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::TeamId;

use crate::history::HistoryEntry;
use crate::item::Item;
use crate::kpi::LineFilter;

/// Compact row used by the pending and discrepancy lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSummary {
    pub code: String,
    pub product: String,
    pub line: String,
    pub system_stock: f64,
    pub physical_count: f64,
    pub difference: f64,
    pub last_team_id: Option<TeamId>,
    pub last_counted_at: Option<DateTime<Utc>>,
}

impl From<&Item> for ItemSummary {
    fn from(item: &Item) -> Self {
        Self {
            code: item.code.clone(),
            product: item.product.clone(),
            line: item.line.clone(),
            system_stock: item.system_stock,
            physical_count: item.physical_count,
            difference: item.difference(),
            last_team_id: item.last_team_id,
            last_counted_at: item.last_counted_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    /// Uncounted items that the system says are in stock, by code.
    pub pending: Vec<ItemSummary>,
    /// Counted items whose count differs from stock, largest gap first.
    pub discrepancies: Vec<ItemSummary>,
    /// Latest ledger entries, newest first.
    pub recent_history: Vec<HistoryEntry>,
}

impl SessionReport {
    pub fn build<'a, I>(
        items: I,
        recent_history: Vec<HistoryEntry>,
        filter: &LineFilter,
        row_limit: usize,
    ) -> SessionReport
    where
        I: IntoIterator<Item = &'a Item>,
    {
        let mut pending = Vec::new();
        let mut discrepancies = Vec::new();
        for item in items.into_iter().filter(|i| filter.accepts(i)) {
            if !item.is_counted() {
                if item.has_stock() {
                    pending.push(ItemSummary::from(item));
                }
            } else if item.difference() != 0.0 {
                discrepancies.push(ItemSummary::from(item));
            }
        }

        pending.sort_by(|a, b| a.code.cmp(&b.code));
        pending.truncate(row_limit);

        discrepancies.sort_by(|a, b| {
            b.difference
                .abs()
                .total_cmp(&a.difference.abs())
                .then_with(|| a.code.cmp(&b.code))
        });
        discrepancies.truncate(row_limit);

        SessionReport {
            pending,
            discrepancies,
            recent_history,
        }
    }
}
