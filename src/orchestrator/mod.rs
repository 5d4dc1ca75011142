//! Download orchestration module
//!
//! Provides the queue-based download orchestrator: a single coordinator loop
//! scanning the job queue, bounded pipeline workers doing the search/rank/
//! transfer legs, a crash-recovery journal hook and an event feed for
//! observers.

mod coordinator;
mod events;
mod handle;
mod models;
mod pipeline;
mod retry;

pub use coordinator::{create_orchestrator, Orchestrator, OrchestratorSettings};
pub use events::DownloadEvent;
pub use handle::{CommandError, OrchestratorCommand, OrchestratorHandle, QueueOutcome};
pub use models::*;
pub use pipeline::{TagState, TransferState};
pub use retry::RetryPolicy;
