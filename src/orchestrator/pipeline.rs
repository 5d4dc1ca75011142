//! Per-job download pipeline.
//!
//! One pipeline run per dispatched job, on its own spawned worker: search the
//! network, rank candidates, pull the file with resume and stall detection,
//! then finalize. Every failure is caught here and reported to the
//! coordinator as an outcome; nothing in a pipeline can take down the
//! scheduling loop.

use super::models::{CandidateFile, DownloadErrorKind, TrackRequest};
use crate::collaborators::{
    NetworkCollaborator, TagWriter, TransferPhase, TransferProgress, TransferRequest,
};
use crate::journal::{OperationKind, RecoveryCheckpoint, RecoveryJournal};
use crate::scoring::{self, WeightProfile};
use anyhow::anyhow;
use byte_unit::{Byte, UnitType};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Resumable transfer state, serialized into the checkpoint blob.
///
/// Carries the whole originating request so a job can be rebuilt from the
/// journal alone after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferState {
    pub request: TrackRequest,
    pub peer: String,
    pub remote_path: String,
    pub output_path: PathBuf,
    pub partial_path: PathBuf,
    pub expected_size: u64,
    /// Bytes durably acknowledged; resume never starts past this point.
    pub confirmed_bytes: u64,
}

/// Pending tag write, checkpointed when tagging fails after a completed
/// transfer so it can be retried on the next boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagState {
    pub request: TrackRequest,
    pub output_path: PathBuf,
}

/// Collaborators and tunables shared by every worker.
pub struct PipelineContext {
    pub network: Arc<dyn NetworkCollaborator>,
    pub journal: Arc<dyn RecoveryJournal>,
    pub tags: Arc<dyn TagWriter>,
    pub downloads_dir: PathBuf,
    pub search_timeout: Duration,
    pub stall_timeout: Duration,
}

/// Everything a worker needs for one dispatched job.
pub struct PipelineJob {
    pub job_id: String,
    pub request: TrackRequest,
    pub profile: WeightProfile,
    /// Prior transfer state from the journal, when one exists.
    pub resume: Option<TransferState>,
    /// Resume the checkpointed peer directly instead of searching again.
    pub resume_direct: bool,
    /// Byte counter shared with the coordinator for live snapshots.
    pub progress_bytes: Arc<AtomicU64>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("search produced no usable candidates")]
    NoCandidates,
    #[error("transfer stalled, no bytes received for {0:?}")]
    Stalled(Duration),
    #[error("network: {0:#}")]
    Network(#[source] anyhow::Error),
    #[error("local storage: {0:#}")]
    Persistence(#[source] anyhow::Error),
    #[error("cancelled")]
    Cancelled,
    #[error("{0:#}")]
    Internal(#[source] anyhow::Error),
}

impl PipelineError {
    pub fn error_kind(&self) -> DownloadErrorKind {
        match self {
            PipelineError::NoCandidates => DownloadErrorKind::NoCandidates,
            PipelineError::Stalled(_) => DownloadErrorKind::Stall,
            PipelineError::Network(_) => DownloadErrorKind::Network,
            PipelineError::Persistence(_) => DownloadErrorKind::Persistence,
            PipelineError::Cancelled => DownloadErrorKind::Unknown,
            PipelineError::Internal(_) => DownloadErrorKind::Unknown,
        }
    }
}

/// Terminal result of one pipeline run.
#[derive(Debug)]
pub enum PipelineOutcome {
    Completed { output_path: PathBuf },
    Failed { kind: DownloadErrorKind, message: String },
    Cancelled,
}

/// Message from a worker back to the coordinator.
#[derive(Debug)]
pub enum WorkerUpdate {
    /// Ranking picked a candidate; the transfer is starting.
    CandidateSelected {
        job_id: String,
        candidate: CandidateFile,
        total_bytes: u64,
        output_path: PathBuf,
        partial_path: PathBuf,
    },
    /// The pipeline finished, one way or another.
    Finished {
        job_id: String,
        outcome: PipelineOutcome,
    },
}

/// Run one job's pipeline to completion and report the outcome.
pub async fn run_pipeline(
    job: PipelineJob,
    ctx: Arc<PipelineContext>,
    cancel: CancellationToken,
    updates: mpsc::Sender<WorkerUpdate>,
) {
    let job_id = job.job_id.clone();
    let outcome = match execute(job, &ctx, &cancel, &updates).await {
        Ok(output_path) => {
            info!("Job {} completed: {:?}", job_id, output_path);
            PipelineOutcome::Completed { output_path }
        }
        Err(PipelineError::Cancelled) => {
            info!("Job {} cancelled", job_id);
            PipelineOutcome::Cancelled
        }
        Err(e) => {
            error!("Job {} failed: {}", job_id, e);
            PipelineOutcome::Failed {
                kind: e.error_kind(),
                message: e.to_string(),
            }
        }
    };

    if updates
        .send(WorkerUpdate::Finished { job_id, outcome })
        .await
        .is_err()
    {
        debug!("Coordinator gone, dropping final worker update");
    }
}

async fn execute(
    job: PipelineJob,
    ctx: &PipelineContext,
    cancel: &CancellationToken,
    updates: &mpsc::Sender<WorkerUpdate>,
) -> Result<PathBuf, PipelineError> {
    let mut state = match (&job.resume, job.resume_direct) {
        (Some(prev), true) => {
            info!(
                "Job {} resuming from {} at {} of {} bytes",
                job.job_id, prev.peer, prev.confirmed_bytes, prev.expected_size
            );
            prev.clone()
        }
        _ => {
            let candidates = collect_candidates(&job, ctx, cancel).await?;
            let ranked = scoring::rank(
                &candidates,
                &job.request,
                &job.profile,
                tiebreak_seed(&job.job_id),
            );
            debug!(
                "Job {}: {} of {} candidates survived ranking",
                job.job_id,
                ranked.len(),
                candidates.len()
            );
            let candidate = scoring::select_candidate(&ranked, &job.profile)
                .ok_or(PipelineError::NoCandidates)?;
            info!(
                "Job {} selected {} ({}, {} kbps claimed)",
                job.job_id,
                candidate.filename(),
                Byte::from_u64(candidate.size_bytes).get_appropriate_unit(UnitType::Binary),
                candidate
                    .bitrate_kbps
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "?".to_string()),
            );
            plan_transfer(&job, ctx, candidate).await?
        }
    };

    // Never resume past what is actually on disk.
    let disk_len = file_len(&state.partial_path).await;
    if disk_len < state.confirmed_bytes {
        warn!(
            "Job {}: partial file has {} bytes but journal confirmed {}, restarting at file length",
            job.job_id, disk_len, state.confirmed_bytes
        );
        state.confirmed_bytes = disk_len;
    }
    job.progress_bytes
        .store(state.confirmed_bytes, Ordering::Relaxed);

    log_transfer_checkpoint(ctx, &job, &state);

    let candidate = CandidateFile::new(&state.peer, &state.remote_path, state.expected_size);
    updates
        .send(WorkerUpdate::CandidateSelected {
            job_id: job.job_id.clone(),
            candidate,
            total_bytes: state.expected_size,
            output_path: state.output_path.clone(),
            partial_path: state.partial_path.clone(),
        })
        .await
        .map_err(|_| PipelineError::Cancelled)?;

    transfer_with_watchdog(&job, ctx, cancel, &mut state).await?;

    let received = file_len(&state.partial_path).await;
    if received < state.expected_size {
        return Err(PipelineError::Network(anyhow!(
            "short transfer: {} of {} bytes",
            received,
            state.expected_size
        )));
    }

    finalize(&job, ctx, &state).await
}

/// Run the search and gather candidate batches until the stream closes or
/// the search window elapses.
async fn collect_candidates(
    job: &PipelineJob,
    ctx: &PipelineContext,
    cancel: &CancellationToken,
) -> Result<Vec<CandidateFile>, PipelineError> {
    let formats: Vec<String> = job
        .profile
        .accepted_formats
        .iter()
        .map(|s| s.to_string())
        .collect();
    let min_bitrate = (job.profile.hard_min_bitrate_kbps > 0)
        .then_some(job.profile.hard_min_bitrate_kbps);

    let mut rx = ctx
        .network
        .search(&job.request.search_text(), &formats, min_bitrate, cancel.clone())
        .await
        .map_err(PipelineError::Network)?;

    let mut candidates = Vec::new();
    let deadline = tokio::time::sleep(ctx.search_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            maybe_batch = rx.recv() => match maybe_batch {
                Some(mut batch) => {
                    debug!("Job {}: search batch with {} files", job.job_id, batch.len());
                    candidates.append(&mut batch);
                }
                None => break,
            },
            _ = &mut deadline => {
                debug!(
                    "Job {}: search window elapsed with {} candidates",
                    job.job_id,
                    candidates.len()
                );
                break;
            }
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        }
    }

    Ok(candidates)
}

/// Work out output paths for a freshly selected candidate and reconcile any
/// prior partial data with it.
async fn plan_transfer(
    job: &PipelineJob,
    ctx: &PipelineContext,
    candidate: CandidateFile,
) -> Result<TransferState, PipelineError> {
    let extension = match candidate.extension() {
        ext if ext.is_empty() => "mp3".to_string(),
        ext => ext,
    };
    let output_path = ctx
        .downloads_dir
        .join(format!("{}.{}", job.request.file_stem(), extension));
    let partial_path = PathBuf::from(format!("{}.partial", output_path.display()));

    let confirmed_bytes = match &job.resume {
        // Ranking happened to pick the same file again: keep the bytes.
        Some(prev) if prev.peer == candidate.peer && prev.remote_path == candidate.remote_path => {
            prev.confirmed_bytes.min(file_len(&prev.partial_path).await)
        }
        // Different source now; a partial from another peer is useless.
        Some(prev) => {
            debug!(
                "Job {}: discarding partial from {}, new source is {}",
                job.job_id, prev.peer, candidate.peer
            );
            let _ = tokio::fs::remove_file(&prev.partial_path).await;
            0
        }
        None => 0,
    };

    if let Some(parent) = partial_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::Persistence(e.into()))?;
    }

    Ok(TransferState {
        request: job.request.clone(),
        peer: candidate.peer,
        remote_path: candidate.remote_path,
        output_path,
        partial_path,
        expected_size: candidate.size_bytes,
        confirmed_bytes,
    })
}

/// Checkpoint the transfer before any bytes move. Best-effort: a journal
/// outage costs crash-safety, not the download.
fn log_transfer_checkpoint(ctx: &PipelineContext, job: &PipelineJob, state: &TransferState) {
    let blob = match serde_json::to_string(state) {
        Ok(blob) => blob,
        Err(e) => {
            warn!("Job {}: could not serialize transfer state: {}", job.job_id, e);
            return;
        }
    };
    let checkpoint = RecoveryCheckpoint::new(
        &job.job_id,
        OperationKind::Transfer,
        &state.partial_path.to_string_lossy(),
        blob,
        job.request.priority.as_i32(),
    );
    if let Err(e) = ctx.journal.log_checkpoint(&checkpoint) {
        warn!(
            "Job {}: proceeding without a recovery checkpoint: {:#}",
            job.job_id, e
        );
    }
}

/// Drive the transfer while watching for stalls and feeding heartbeats.
async fn transfer_with_watchdog(
    job: &PipelineJob,
    ctx: &PipelineContext,
    cancel: &CancellationToken,
    state: &mut TransferState,
) -> Result<(), PipelineError> {
    let (progress_tx, mut progress_rx) = mpsc::channel::<TransferProgress>(32);
    let request = TransferRequest {
        peer: state.peer.clone(),
        remote_path: state.remote_path.clone(),
        local_path: state.partial_path.clone(),
        expected_size: state.expected_size,
        start_offset: state.confirmed_bytes,
    };

    let transfer_fut = ctx.network.transfer(request, progress_tx, cancel.clone());
    tokio::pin!(transfer_fut);

    let mut phase = TransferPhase::Queued;
    let mut progress_open = true;
    // A transfer queued at the peer waits indefinitely; the stall clock only
    // runs while bytes are supposed to be flowing.
    let mut last_activity = Instant::now();

    loop {
        let stall_at = tokio::time::sleep_until(last_activity + ctx.stall_timeout);
        tokio::pin!(stall_at);

        tokio::select! {
            result = &mut transfer_fut => {
                result.map_err(PipelineError::Network)?;
                break;
            }
            maybe = progress_rx.recv(), if progress_open => {
                match maybe {
                    Some(progress) => {
                        if progress.phase != phase {
                            debug!("Job {}: transfer phase {:?}", job.job_id, progress.phase);
                            phase = progress.phase;
                            last_activity = Instant::now();
                        }
                        if progress.bytes > state.confirmed_bytes {
                            job.progress_bytes.store(progress.bytes, Ordering::Relaxed);
                            heartbeat(ctx, &job.job_id, state, progress.bytes);
                            last_activity = Instant::now();
                        }
                    }
                    None => progress_open = false,
                }
            }
            _ = &mut stall_at, if phase == TransferPhase::Transferring => {
                return Err(PipelineError::Stalled(ctx.stall_timeout));
            }
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        }
    }

    Ok(())
}

fn heartbeat(ctx: &PipelineContext, job_id: &str, state: &mut TransferState, bytes: u64) {
    let prev = state.confirmed_bytes;
    state.confirmed_bytes = bytes;
    let blob = match serde_json::to_string(state) {
        Ok(blob) => blob,
        Err(e) => {
            warn!("Job {}: could not serialize transfer state: {}", job_id, e);
            return;
        }
    };
    if let Err(e) = ctx.journal.update_heartbeat(job_id, &blob, prev, bytes) {
        warn!("Job {}: heartbeat dropped: {:#}", job_id, e);
    }
}

/// Sanity-check the payload, move it into place, drop the checkpoint, then
/// tag best-effort.
async fn finalize(
    job: &PipelineJob,
    ctx: &PipelineContext,
    state: &TransferState,
) -> Result<PathBuf, PipelineError> {
    sanity_check_payload(&state.partial_path).await?;

    tokio::fs::rename(&state.partial_path, &state.output_path)
        .await
        .map_err(|e| PipelineError::Persistence(e.into()))?;

    if let Err(e) = ctx.journal.complete(&job.job_id) {
        warn!("Job {}: checkpoint not removed: {:#}", job.job_id, e);
    }

    if let Err(e) = ctx.tags.write_tags(&state.output_path, &job.request).await {
        warn!(
            "Job {}: tag write failed for {:?}: {:#}",
            job.job_id, state.output_path, e
        );
        log_tag_checkpoint(ctx, job, state);
    }

    Ok(state.output_path.clone())
}

/// Record the unfinished tag write so the next boot can retry it.
fn log_tag_checkpoint(ctx: &PipelineContext, job: &PipelineJob, state: &TransferState) {
    let tag_state = TagState {
        request: job.request.clone(),
        output_path: state.output_path.clone(),
    };
    let blob = match serde_json::to_string(&tag_state) {
        Ok(blob) => blob,
        Err(e) => {
            warn!("Job {}: could not serialize tag state: {}", job.job_id, e);
            return;
        }
    };
    let checkpoint = RecoveryCheckpoint::new(
        &tag_checkpoint_id(&job.job_id),
        OperationKind::TagWrite,
        &state.output_path.to_string_lossy(),
        blob,
        job.request.priority.as_i32(),
    );
    if let Err(e) = ctx.journal.log_checkpoint(&checkpoint) {
        warn!("Job {}: tag retry not recorded: {:#}", job.job_id, e);
    }
}

pub fn tag_checkpoint_id(job_id: &str) -> String {
    format!("{}:tags", job_id)
}

/// Reject payloads that are recognizably not audio. Peers occasionally serve
/// error pages or junk under an audio filename; unknown signatures pass, raw
/// formats are not all recognizable.
async fn sanity_check_payload(path: &Path) -> Result<(), PipelineError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| PipelineError::Persistence(e.into()))?;
    let mut head = [0u8; 512];
    let read = file
        .read(&mut head)
        .await
        .map_err(|e| PipelineError::Persistence(e.into()))?;

    if let Some(kind) = infer::get(&head[..read]) {
        use infer::MatcherType;
        match kind.matcher_type() {
            MatcherType::Audio | MatcherType::Custom => {}
            other => {
                return Err(PipelineError::Network(anyhow!(
                    "peer sent {:?} payload ({}) instead of audio",
                    other,
                    kind.mime_type()
                )));
            }
        }
    }
    Ok(())
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

/// Stable per-job seed for the scoring tiebreaker: retries of the same job
/// rank deterministically, different jobs break ties differently.
fn tiebreak_seed(job_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    job_id.hash(&mut hasher);
    hasher.finish()
}
