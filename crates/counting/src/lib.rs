//! Counting domain module.
//!
//! Business rules for multi-team physical inventory counts, implemented as
//! deterministic domain logic (no IO, no async, no storage).

pub mod decision;
pub mod history;
pub mod item;
pub mod kpi;
pub mod report;
pub mod session;
pub mod team;
pub mod validate;

pub use decision::{ConflictPolicy, CountChange, Decision, TeamConflict, decide};
pub use history::{ActionType, HistoryEntry, net_change, verify_trail};
pub use item::{DEFAULT_LINE, Item, ItemSeed};
pub use kpi::{KpiReport, LineFilter};
pub use report::{ItemSummary, SessionReport};
pub use session::{NewSession, Session};
pub use team::{NewTeam, Team};
