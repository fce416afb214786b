use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{DomainError, DomainResult, SessionId};

use crate::validate::validate_name;

/// A counting session ("cut"). Immutable once closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub responsible: Option<String>,
    pub warehouse: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl Session {
    pub fn is_closed(&self) -> bool {
        !self.active
    }

    /// Reject any mutation against a closed session.
    pub fn ensure_open(&self) -> DomainResult<()> {
        if self.is_closed() {
            return Err(DomainError::SessionClosed);
        }
        Ok(())
    }

    /// The closed form of this session; closing twice is rejected.
    pub fn closed_at(&self, at: DateTime<Utc>) -> DomainResult<Session> {
        self.ensure_open()?;
        Ok(Session {
            active: false,
            ended_at: Some(at),
            ..self.clone()
        })
    }
}

/// Input for starting a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSession {
    pub name: String,
    pub responsible: Option<String>,
    pub warehouse: Option<String>,
}

impl NewSession {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responsible: None,
            warehouse: None,
        }
    }

    pub fn validated(&self) -> DomainResult<NewSession> {
        let optional = |v: &Option<String>, what: &str| -> DomainResult<Option<String>> {
            match v.as_deref().map(str::trim) {
                None | Some("") => Ok(None),
                Some(s) => validate_name(s, what).map(Some),
            }
        };
        Ok(NewSession {
            name: validate_name(&self.name, "session name")?,
            responsible: optional(&self.responsible, "responsible")?,
            warehouse: optional(&self.warehouse, "warehouse")?,
        })
    }
}
