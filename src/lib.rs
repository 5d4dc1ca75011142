//! Soulfetch Library
//!
//! This library exposes the internal modules for testing and potential reuse.

pub mod collaborators;
pub mod config;
pub mod journal;
pub mod orchestrator;
pub mod scoring;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use collaborators::{Collaborators, HttpNetworkClient, NetworkCollaborator};
pub use journal::{RecoveryJournal, SqliteRecoveryJournal};
pub use orchestrator::{create_orchestrator, DownloadEvent, OrchestratorHandle, TrackRequest};
pub use scoring::WeightProfile;
