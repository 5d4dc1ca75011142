//! Typed change events emitted by the orchestrator.
//!
//! Broadcast to whoever subscribes: the projection adapter persists them,
//! presentation layers may render them. Slow subscribers lag and drop,
//! they never block the coordinator.

use super::models::{DownloadErrorKind, JobState};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// A new job entered the active set.
    Queued {
        job_id: String,
        dedupe_hash: String,
        artist: String,
        title: String,
        album: Option<String>,
    },
    /// A non-terminal state transition (searching, downloading, paused, ...).
    StateChanged {
        job_id: String,
        dedupe_hash: String,
        state: JobState,
    },
    /// Terminal success, with the final audio path.
    Completed {
        job_id: String,
        dedupe_hash: String,
        output_path: PathBuf,
    },
    /// The job failed for good. Transient retries are internal and do not
    /// produce this event.
    Failed {
        job_id: String,
        dedupe_hash: String,
        kind: DownloadErrorKind,
        message: String,
        dead_lettered: bool,
    },
}

impl DownloadEvent {
    /// The dedupe hash of the track the event concerns.
    pub fn dedupe_hash(&self) -> &str {
        match self {
            DownloadEvent::Queued { dedupe_hash, .. } => dedupe_hash,
            DownloadEvent::StateChanged { dedupe_hash, .. } => dedupe_hash,
            DownloadEvent::Completed { dedupe_hash, .. } => dedupe_hash,
            DownloadEvent::Failed { dedupe_hash, .. } => dedupe_hash,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            DownloadEvent::Queued { job_id, .. } => job_id,
            DownloadEvent::StateChanged { job_id, .. } => job_id,
            DownloadEvent::Completed { job_id, .. } => job_id,
            DownloadEvent::Failed { job_id, .. } => job_id,
        }
    }
}
