use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{DomainError, DomainResult, ItemId, SessionId, TeamId};

use crate::decision::CountChange;
use crate::validate::normalize_code;

/// Product line assigned to items whose import row (or manual entry) has none.
pub const DEFAULT_LINE: &str = "UNASSIGNED";

/// One countable item of a session.
///
/// `difference` is derived from `physical_count` and `system_stock` on every
/// read and has no backing field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub session_id: SessionId,
    pub code: String,
    pub product: String,
    pub line: String,
    pub system_stock: f64,
    pub physical_count: f64,
    pub note: Option<String>,
    pub last_counted_at: Option<DateTime<Utc>>,
    pub last_team_id: Option<TeamId>,
    /// Incremented on every accepted mutation; drives compare-and-swap commits.
    pub version: u64,
    /// Storage write sequence within the session; the sync watermark.
    pub change_seq: u64,
}

impl Item {
    pub fn difference(&self) -> f64 {
        self.physical_count - self.system_stock
    }

    pub fn is_counted(&self) -> bool {
        self.last_counted_at.is_some()
    }

    pub fn has_stock(&self) -> bool {
        self.system_stock > 0.0
    }

    /// The item as it looks after `change` is committed by `team`.
    ///
    /// `change_seq` is left untouched; storage assigns it on write.
    pub fn with_count(
        &self,
        change: &CountChange,
        team: TeamId,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Item {
        Item {
            physical_count: change.resulting,
            note,
            last_counted_at: Some(at),
            last_team_id: Some(team),
            version: self.version + 1,
            ..self.clone()
        }
    }
}

/// One import row consumed at session creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSeed {
    pub code: String,
    pub product: String,
    pub line: Option<String>,
    pub system_stock: f64,
    pub warehouse: Option<String>,
}

impl ItemSeed {
    pub fn new(code: impl Into<String>, product: impl Into<String>, system_stock: f64) -> Self {
        Self {
            code: code.into(),
            product: product.into(),
            line: None,
            system_stock,
            warehouse: None,
        }
    }

    pub fn with_line(mut self, line: impl Into<String>) -> Self {
        self.line = Some(line.into());
        self
    }

    /// Normalised copy: upper-cased code, trimmed product, line defaulted.
    pub fn normalized(&self) -> DomainResult<ItemSeed> {
        let code = normalize_code(&self.code)?;
        if !self.system_stock.is_finite() {
            return Err(DomainError::validation(format!(
                "system stock for {code} must be a finite number"
            )));
        }
        let line = self
            .line
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(DEFAULT_LINE)
            .to_string();
        Ok(ItemSeed {
            code,
            product: self.product.trim().to_string(),
            line: Some(line),
            system_stock: self.system_stock,
            warehouse: self
                .warehouse
                .as_deref()
                .map(str::trim)
                .filter(|w| !w.is_empty())
                .map(str::to_string),
        })
    }

    /// Normalise a whole import batch. Duplicate codes collapse onto the last
    /// occurrence, keeping the position of the first.
    pub fn normalize_batch(seeds: &[ItemSeed]) -> DomainResult<Vec<ItemSeed>> {
        let mut out: Vec<ItemSeed> = Vec::with_capacity(seeds.len());
        let mut index = std::collections::HashMap::with_capacity(seeds.len());
        for seed in seeds {
            let seed = seed.normalized()?;
            match index.get(&seed.code) {
                Some(&pos) => out[pos] = seed,
                None => {
                    index.insert(seed.code.clone(), out.len());
                    out.push(seed);
                }
            }
        }
        Ok(out)
    }

    pub fn line_or_default(&self) -> &str {
        self.line.as_deref().unwrap_or(DEFAULT_LINE)
    }
}
