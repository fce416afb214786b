use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{DomainResult, TeamId};

use crate::validate::validate_name;

/// A counting team. Teams are deactivated, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub members: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for registering a team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTeam {
    pub name: String,
    pub members: Vec<String>,
}

impl NewTeam {
    pub fn new<I, S>(name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    /// Trimmed name; members trimmed, upper-cased, blanks dropped, order kept.
    pub fn validated(&self) -> DomainResult<NewTeam> {
        let members = self
            .members
            .iter()
            .map(|m| m.trim().to_uppercase())
            .filter(|m| !m.is_empty())
            .collect();
        Ok(NewTeam {
            name: validate_name(&self.name, "team name")?,
            members,
        })
    }
}
