//! Concurrent synchronization and conflict-resolution engine for multi-team
//! inventory counts.
//!
//! Wiring, leaves first: a [`ConnectionPool`](tally_infra::ConnectionPool)
//! feeds the [`ConflictResolver`] (direct submissions) and the
//! [`SyncScheduler`] (periodic delta pulls). Both write into the shared
//! [`ItemCache`] and announce new snapshots on the [`SnapshotBus`].
//! [`CountEngine`] owns all of it.

pub mod bus;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod resolver;
pub mod scheduler;

mod integration_tests;

pub use bus::{SnapshotBus, SnapshotOrigin, SnapshotReady, Subscription};
pub use cache::{ItemCache, MergeStats, Snapshot};
pub use config::EngineConfig;
pub use engine::CountEngine;
pub use error::{ConfigError, CountError};
pub use resolver::{Committed, ConflictResolver, CountSubmission, SubmitOutcome};
pub use scheduler::{CycleOutcome, CycleReport, SchedulerState, SkipReason, SyncScheduler};
