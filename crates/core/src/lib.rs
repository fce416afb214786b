//! Shared building blocks for the counting workspace.
//!
//! This crate contains **pure** primitives (no storage, no async).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{HistoryEntryId, ItemId, SessionId, TeamId};
