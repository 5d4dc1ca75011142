//! Crash-recovery journal
//!
//! Durable write-ahead record of every in-flight operation. On restart the
//! orchestrator replays pending checkpoints instead of losing partially
//! transferred files.

mod clock;
mod models;
mod schema;
mod store;

pub use clock::SteadyClock;
pub use models::{CheckpointStatus, JournalStats, OperationKind, RecoveryCheckpoint};
pub use schema::RECOVERY_JOURNAL_VERSIONED_SCHEMAS;
pub use store::{RecoveryJournal, SqliteRecoveryJournal, DEFAULT_STALENESS_WINDOW};
