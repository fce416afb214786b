use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{DomainError, DomainResult, HistoryEntryId, SessionId, TeamId};

use crate::item::Item;

/// Tolerance used when comparing accumulated float quantities.
const QTY_EPSILON: f64 = 1e-6;

/// How a submission was applied to an item's count.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionType {
    New,
    Sum,
    Replace,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::New => "NEW",
            ActionType::Sum => "SUM",
            ActionType::Replace => "REPLACE",
        }
    }
}

impl core::fmt::Display for ActionType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ActionType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(ActionType::New),
            "SUM" => Ok(ActionType::Sum),
            "REPLACE" => Ok(ActionType::Replace),
            other => Err(DomainError::validation(format!("unknown action type: {other}"))),
        }
    }
}

/// Immutable audit record of one accepted count mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: HistoryEntryId,
    pub session_id: SessionId,
    pub item_code: String,
    pub team_id: TeamId,
    pub action: ActionType,
    pub previous_quantity: f64,
    pub resulting_quantity: f64,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn delta(&self) -> f64 {
        self.resulting_quantity - self.previous_quantity
    }
}

/// Sum of signed deltas across entries.
pub fn net_change(entries: &[HistoryEntry]) -> f64 {
    entries.iter().map(HistoryEntry::delta).sum()
}

/// Check an item against its audit trail, given in commit order.
///
/// The newest entry must match the current count and team, each entry must
/// start where the previous one ended, and the deltas must add up to the count.
pub fn verify_trail(item: &Item, entries: &[HistoryEntry]) -> DomainResult<()> {
    let Some(last) = entries.last() else {
        if item.is_counted() || item.physical_count.abs() > QTY_EPSILON {
            return Err(DomainError::invariant(format!(
                "item {} has a count but no history",
                item.code
            )));
        }
        return Ok(());
    };

    if entries.iter().any(|e| e.item_code != item.code) {
        return Err(DomainError::invariant("history belongs to another item"));
    }

    let mut expected_prev = 0.0;
    for entry in entries {
        if (entry.previous_quantity - expected_prev).abs() > QTY_EPSILON {
            return Err(DomainError::invariant(format!(
                "history for {} is not contiguous at entry {}",
                item.code, entry.id
            )));
        }
        expected_prev = entry.resulting_quantity;
    }

    if (last.resulting_quantity - item.physical_count).abs() > QTY_EPSILON {
        return Err(DomainError::invariant(format!(
            "latest history result for {} does not match its count",
            item.code
        )));
    }
    if item.last_team_id != Some(last.team_id) {
        return Err(DomainError::invariant(format!(
            "last team of {} does not match its latest history entry",
            item.code
        )));
    }
    if (net_change(entries) - item.physical_count).abs() > QTY_EPSILON {
        return Err(DomainError::invariant(format!(
            "history deltas for {} do not add up to its count",
            item.code
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::ItemId;

    fn entry(id: i64, team: i64, action: ActionType, prev: f64, result: f64) -> HistoryEntry {
        HistoryEntry {
            id: HistoryEntryId::new(id),
            session_id: SessionId::new(1),
            item_code: "X".to_string(),
            team_id: TeamId::new(team),
            action,
            previous_quantity: prev,
            resulting_quantity: result,
            timestamp: Utc::now(),
        }
    }

    fn counted_item(count: f64, team: i64) -> Item {
        Item {
            id: ItemId::new(1),
            session_id: SessionId::new(1),
            code: "X".to_string(),
            product: "x".to_string(),
            line: "L".to_string(),
            system_stock: 0.0,
            physical_count: count,
            note: None,
            last_counted_at: Some(Utc::now()),
            last_team_id: Some(TeamId::new(team)),
            version: 2,
            change_seq: 2,
        }
    }

    #[test]
    fn action_type_round_trips_through_text() {
        for a in [ActionType::New, ActionType::Sum, ActionType::Replace] {
            assert_eq!(a.as_str().parse::<ActionType>().unwrap(), a);
        }
        assert!("SUMA".parse::<ActionType>().is_err());
        assert_eq!(serde_json::to_string(&ActionType::Replace).unwrap(), "\"REPLACE\"");
    }

    #[test]
    fn consistent_trail_verifies() {
        let entries = vec![
            entry(1, 1, ActionType::New, 0.0, 10.0),
            entry(2, 2, ActionType::Sum, 10.0, 15.0),
        ];
        assert_eq!(net_change(&entries), 15.0);
        verify_trail(&counted_item(15.0, 2), &entries).unwrap();
    }

    #[test]
    fn broken_trail_is_reported() {
        let gap = vec![
            entry(1, 1, ActionType::New, 0.0, 10.0),
            entry(2, 2, ActionType::Replace, 7.0, 5.0),
        ];
        assert!(verify_trail(&counted_item(5.0, 2), &gap).is_err());

        let wrong_team = vec![entry(1, 1, ActionType::New, 0.0, 10.0)];
        assert!(verify_trail(&counted_item(10.0, 2), &wrong_team).is_err());

        assert!(verify_trail(&counted_item(3.0, 1), &[]).is_err());
    }
}
