//! Authoritative map of active games.

pub mod exclusion;
pub mod expiry;
pub mod game;
pub mod service;
pub mod table;

pub use game::{GameRecord, NewGame};
pub use service::{GameDirectory, GameDirectoryHandle, ReleaseSummary, ReplicationStatus};
pub use table::{RemoveOutcome, SweepReport, UpdateOutcome};
