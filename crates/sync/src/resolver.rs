//! Applies count submissions under optimistic concurrency.
//!
//! ## Retry loop
//!
//! 1. decide NEW / SUM / REPLACE against the current row
//! 2. commit with `expected_version = row.version`
//! 3. on a version conflict, back off, re-read the row and go back to 1
//!
//! The re-read may turn a plain recount into a cross-team conflict; without
//! a policy the caller then gets `PolicyRequired` instead of another retry.
//! After `max_commit_retries` conflicts the submission fails with
//! `FatalSync`, which carries the quantity that was not recorded.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use tally_core::TeamId;
use tally_counting::validate::{normalize_code, validate_quantity};
use tally_counting::{ConflictPolicy, Decision, HistoryEntry, Item, TeamConflict, decide};
use tally_infra::{ConnectionPool, CountCommit, CountStorage, StorageConnector, StorageError};

use crate::bus::{SnapshotBus, SnapshotOrigin};
use crate::cache::ItemCache;
use crate::error::CountError;

/// One team's count for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountSubmission {
    pub item_code: String,
    pub team_id: TeamId,
    pub quantity: f64,
    pub note: Option<String>,
    pub policy: Option<ConflictPolicy>,
}

impl CountSubmission {
    pub fn new(item_code: impl Into<String>, team_id: TeamId, quantity: f64) -> Self {
        Self {
            item_code: item_code.into(),
            team_id,
            quantity,
            note: None,
            policy: None,
        }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub item: Item,
    pub entry: HistoryEntry,
    /// Commit attempts used, 1 when there was no contention.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Committed(Committed),
    /// Another team already counted the item; resubmit with a policy.
    PolicyRequired(TeamConflict),
}

pub struct ConflictResolver<C: StorageConnector> {
    pool: ConnectionPool<C>,
    cache: Arc<ItemCache>,
    bus: Arc<SnapshotBus>,
    max_commit_retries: u32,
    retry_backoff: Duration,
}

impl<C: StorageConnector> ConflictResolver<C> {
    pub fn new(
        pool: ConnectionPool<C>,
        cache: Arc<ItemCache>,
        bus: Arc<SnapshotBus>,
        max_commit_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            pool,
            cache,
            bus,
            max_commit_retries,
            retry_backoff,
        }
    }

    #[instrument(
        skip(self, submission),
        fields(code = %submission.item_code, team_id = %submission.team_id),
        err
    )]
    pub async fn submit(&self, submission: CountSubmission) -> Result<SubmitOutcome, CountError> {
        let code = normalize_code(&submission.item_code)?;
        let quantity = validate_quantity(submission.quantity)?;
        let note = submission
            .note
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        let snapshot = self.cache.snapshot();
        let session = snapshot
            .session_id()
            .ok_or_else(|| CountError::validation("no active counting session"))?;
        let mut current = snapshot
            .get(&code)
            .cloned()
            .ok_or_else(|| CountError::validation(format!("unknown item code {code}")))?;
        drop(snapshot);

        let mut conn = self.pool.acquire().await?;
        let max_attempts = self.max_commit_retries.saturating_add(1);

        for attempt in 1..=max_attempts {
            let change = match decide(&current, submission.team_id, quantity, submission.policy)? {
                Decision::Apply(change) => change,
                Decision::PolicyRequired(conflict) => {
                    debug!(
                        counted_by = ?conflict.counted_by,
                        current_count = conflict.current_count,
                        "item already counted by another team; policy required"
                    );
                    return Ok(SubmitOutcome::PolicyRequired(conflict));
                }
            };

            let commit = CountCommit {
                session_id: session,
                item_code: code.clone(),
                team_id: submission.team_id,
                change,
                note: note.clone(),
                expected_version: current.version,
                at: Utc::now(),
            };

            match conn.commit_count(&commit).await {
                Ok((item, entry)) => {
                    drop(conn);
                    info!(
                        action = %entry.action,
                        previous = entry.previous_quantity,
                        resulting = entry.resulting_quantity,
                        version = item.version,
                        attempt,
                        "count committed"
                    );
                    self.cache.publish_local(item.clone());
                    self.bus
                        .publish_snapshot(self.cache.snapshot(), None, SnapshotOrigin::Submission);
                    return Ok(SubmitOutcome::Committed(Committed {
                        item,
                        entry,
                        attempts: attempt,
                    }));
                }
                Err(e @ StorageError::VersionConflict { .. }) => {
                    let err = CountError::from(e);
                    warn!(attempt, max_attempts, error = %err, "commit lost the version race; retrying");
                    if attempt == max_attempts {
                        break;
                    }
                    // Never hold a pooled connection across the backoff.
                    drop(conn);
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                    conn = self.pool.acquire().await?;
                    current = conn
                        .fetch_item(session, &code)
                        .await?
                        .ok_or_else(|| CountError::validation(format!("unknown item code {code}")))?;
                    self.cache.publish_local(current.clone());
                }
                Err(e @ StorageError::Backend(_)) => {
                    conn.discard();
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CountError::FatalSync {
            reason: format!(
                "gave up on item {code} after {max_attempts} conflicting commits; count not recorded"
            ),
            item_code: Some(code),
            quantity: Some(quantity),
        })
    }
}
