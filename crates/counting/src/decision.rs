//! Pure decision rules for applying a submitted count to an item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{DomainResult, TeamId};

use crate::history::ActionType;
use crate::item::Item;
use crate::validate::validate_quantity;

/// Caller's choice when a different team already counted the item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConflictPolicy {
    /// Add the submitted quantity to the existing count.
    Sum,
    /// Overwrite the existing count with the submitted quantity.
    Replace,
}

impl ConflictPolicy {
    pub fn action(self) -> ActionType {
        match self {
            ConflictPolicy::Sum => ActionType::Sum,
            ConflictPolicy::Replace => ActionType::Replace,
        }
    }
}

/// Description of an existing count by another team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamConflict {
    pub item_code: String,
    pub current_count: f64,
    pub counted_by: Option<TeamId>,
    pub counted_at: Option<DateTime<Utc>>,
    pub submitted_team: TeamId,
    pub submitted_quantity: f64,
}

/// The count transition to commit.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountChange {
    pub action: ActionType,
    pub previous: f64,
    pub resulting: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Apply(CountChange),
    PolicyRequired(TeamConflict),
}

/// Decide how `quantity` from `team` lands on `item`.
///
/// An uncounted item or a recount by the last team overwrites (`NEW`). A
/// count by another team needs a policy; without one the conflict is returned.
pub fn decide(
    item: &Item,
    team: TeamId,
    quantity: f64,
    policy: Option<ConflictPolicy>,
) -> DomainResult<Decision> {
    let quantity = validate_quantity(quantity)?;
    let previous = item.physical_count;

    let other_team = item.is_counted() && item.last_team_id != Some(team);
    if !other_team {
        return Ok(Decision::Apply(CountChange {
            action: ActionType::New,
            previous,
            resulting: quantity,
        }));
    }

    let Some(policy) = policy else {
        return Ok(Decision::PolicyRequired(TeamConflict {
            item_code: item.code.clone(),
            current_count: previous,
            counted_by: item.last_team_id,
            counted_at: item.last_counted_at,
            submitted_team: team,
            submitted_quantity: quantity,
        }));
    };

    let resulting = match policy {
        ConflictPolicy::Sum => previous + quantity,
        ConflictPolicy::Replace => quantity,
    };
    Ok(Decision::Apply(CountChange {
        action: policy.action(),
        previous,
        resulting,
    }))
}
