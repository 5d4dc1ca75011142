//! Cloneable handle for driving the orchestrator.
//!
//! All mutation goes through the command channel and is answered over a
//! oneshot; the orchestrator loop stays the single owner of job state.

use super::events::DownloadEvent;
use super::models::{EngineStats, JobSnapshot, TrackRequest};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Failure modes of an orchestrator command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no job with id {0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("unknown weight profile '{0}'")]
    UnknownProfile(String),
    #[error("orchestrator not available")]
    Unavailable,
}

/// Outcome of queueing one track request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    /// A new job was created.
    Queued { job_id: String },
    /// An active job with the same dedupe key already exists.
    DuplicateActive { job_id: String },
    /// The library already holds a completed download for this key.
    AlreadyCompleted,
}

/// Command sent to the orchestrator loop.
pub enum OrchestratorCommand {
    QueueTracks {
        requests: Vec<TrackRequest>,
        response: oneshot::Sender<Vec<QueueOutcome>>,
    },
    Pause {
        job_id: String,
        response: oneshot::Sender<Result<(), CommandError>>,
    },
    Resume {
        job_id: String,
        response: oneshot::Sender<Result<(), CommandError>>,
    },
    Cancel {
        job_id: String,
        response: oneshot::Sender<Result<(), CommandError>>,
    },
    Retry {
        job_id: String,
        response: oneshot::Sender<Result<(), CommandError>>,
    },
    SwapProfile {
        profile: String,
        response: oneshot::Sender<Result<(), CommandError>>,
    },
    GetSnapshots {
        response: oneshot::Sender<Vec<JobSnapshot>>,
    },
    GetStats {
        response: oneshot::Sender<EngineStats>,
    },
}

/// Handle to interact with the orchestrator from anywhere in the process.
#[derive(Clone)]
pub struct OrchestratorHandle {
    command_tx: mpsc::Sender<OrchestratorCommand>,
    events_tx: broadcast::Sender<DownloadEvent>,
}

impl OrchestratorHandle {
    pub(crate) fn new(
        command_tx: mpsc::Sender<OrchestratorCommand>,
        events_tx: broadcast::Sender<DownloadEvent>,
    ) -> Self {
        Self {
            command_tx,
            events_tx,
        }
    }

    /// Queue a batch of track requests, one outcome per request in order.
    pub async fn queue_tracks(
        &self,
        requests: Vec<TrackRequest>,
    ) -> Result<Vec<QueueOutcome>, CommandError> {
        self.request(|response| OrchestratorCommand::QueueTracks { requests, response })
            .await
    }

    /// Pause a job. An in-flight transfer is interrupted; its bytes stay on
    /// disk for resume.
    pub async fn pause(&self, job_id: &str) -> Result<(), CommandError> {
        let job_id = job_id.to_string();
        self.request(|response| OrchestratorCommand::Pause { job_id, response })
            .await?
    }

    /// Resume a paused job from its checkpoint.
    pub async fn resume(&self, job_id: &str) -> Result<(), CommandError> {
        let job_id = job_id.to_string();
        self.request(|response| OrchestratorCommand::Resume { job_id, response })
            .await?
    }

    /// Cancel a job and delete its partial output.
    pub async fn cancel(&self, job_id: &str) -> Result<(), CommandError> {
        let job_id = job_id.to_string();
        self.request(|response| OrchestratorCommand::Cancel { job_id, response })
            .await?
    }

    /// Requeue a failed or cancelled job from scratch.
    pub async fn retry(&self, job_id: &str) -> Result<(), CommandError> {
        let job_id = job_id.to_string();
        self.request(|response| OrchestratorCommand::Retry { job_id, response })
            .await?
    }

    /// Switch the ranking profile for jobs dispatched from now on.
    pub async fn swap_profile(&self, profile: &str) -> Result<(), CommandError> {
        let profile = profile.to_string();
        self.request(|response| OrchestratorCommand::SwapProfile { profile, response })
            .await?
    }

    /// Snapshot every job the orchestrator currently tracks.
    pub async fn snapshots(&self) -> Result<Vec<JobSnapshot>, CommandError> {
        self.request(|response| OrchestratorCommand::GetSnapshots { response })
            .await
    }

    /// Aggregate counts by state.
    pub async fn stats(&self) -> Result<EngineStats, CommandError> {
        self.request(|response| OrchestratorCommand::GetStats { response })
            .await
    }

    /// Subscribe to the event feed. Slow subscribers lag and skip, they
    /// never block the orchestrator.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events_tx.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> OrchestratorCommand,
    ) -> Result<T, CommandError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(make(response_tx))
            .await
            .map_err(|_| CommandError::Unavailable)?;
        response_rx.await.map_err(|_| CommandError::Unavailable)
    }
}
