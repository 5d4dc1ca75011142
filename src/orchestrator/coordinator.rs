//! The orchestrator loop: single owner of all job state.
//!
//! One task runs [`Orchestrator::run`]. It scans for dispatchable jobs,
//! spawns bounded pipeline workers, applies commands from the handle and
//! folds worker outcomes back into job state. Nothing else mutates a job,
//! so there are no locks around the queue.

use super::events::DownloadEvent;
use super::handle::{CommandError, OrchestratorCommand, OrchestratorHandle, QueueOutcome};
use super::models::{DownloadErrorKind, DownloadJob, EngineStats, JobState, TrackRequest};
use super::pipeline::{
    self, tag_checkpoint_id, PipelineContext, PipelineJob, PipelineOutcome, TagState,
    TransferState, WorkerUpdate,
};
use super::retry::RetryPolicy;
use crate::collaborators::{Collaborators, ProjectionStore};
use crate::journal::{CheckpointStatus, OperationKind, RecoveryCheckpoint, RecoveryJournal};
use crate::scoring::WeightProfile;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Directory completed tracks land in.
    pub downloads_dir: PathBuf,
    /// Transfer slots; at most this many workers run at once.
    pub max_concurrent_downloads: usize,
    /// How long a search keeps collecting candidate batches.
    pub search_timeout: Duration,
    /// How long an active transfer may sit without new bytes.
    pub stall_timeout: Duration,
    /// Pause between consecutive dispatches, rate-limits burst starts.
    pub dispatch_delay: Duration,
    /// How long shutdown waits for in-flight workers before aborting them.
    pub shutdown_grace: Duration,
    /// Interval of the journal maintenance sweep.
    pub maintenance_interval: Duration,
    /// When set, the sweep moves this many dead-letter checkpoints back to
    /// active per pass. Zero disables the reset entirely.
    pub dead_letter_batch: usize,
    pub auto_reset_dead_letters: bool,
    pub weight_profile: WeightProfile,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            downloads_dir: PathBuf::from("downloads"),
            max_concurrent_downloads: 3,
            search_timeout: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(60),
            dispatch_delay: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(600),
            dead_letter_batch: 25,
            auto_reset_dead_letters: false,
            weight_profile: WeightProfile::balanced(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Manages the download queue and its workers.
pub struct Orchestrator {
    /// All jobs this session, in insertion order. The scanner picks the
    /// first dispatchable one; jobs are never removed, only state-changed.
    jobs: Vec<DownloadJob>,

    /// Dedupe key -> job id for jobs that are not terminal.
    dedupe_index: HashMap<String, String>,

    /// Dedupe keys finished this session, a fast path in front of the
    /// projection lookup.
    completed_hashes: HashSet<String>,

    /// Bounds concurrent workers. Permits travel into the worker task and
    /// release on its exit.
    semaphore: Arc<Semaphore>,

    command_rx: mpsc::Receiver<OrchestratorCommand>,

    /// Worker -> coordinator feedback. The sender side is cloned into every
    /// worker; capacity covers all workers so a finishing worker never
    /// blocks during shutdown.
    updates_tx: mpsc::Sender<WorkerUpdate>,
    updates_rx: mpsc::Receiver<WorkerUpdate>,

    events_tx: broadcast::Sender<DownloadEvent>,

    worker_handles: HashMap<String, JoinHandle<()>>,

    /// Ranking profile for dispatches from now on.
    profile: WeightProfile,

    retry_policy: RetryPolicy,

    journal: Arc<dyn RecoveryJournal>,
    projections: Arc<dyn ProjectionStore>,

    /// Shared collaborator context handed to every worker.
    ctx: Arc<PipelineContext>,

    settings: OrchestratorSettings,

    shutdown_token: CancellationToken,
}

impl Orchestrator {
    /// Main orchestrator loop. Replays the journal before accepting any
    /// command, then runs until the shutdown token fires.
    pub async fn run(&mut self) {
        info!(
            "Starting download orchestrator with {} transfer slots, profile '{}'",
            self.settings.max_concurrent_downloads, self.profile.name
        );

        if let Err(e) = self.replay_journal().await {
            error!("Journal replay failed: {:#}", e);
        }

        let maintenance = self.spawn_maintenance();

        loop {
            self.dispatch_ready_jobs().await;

            let wake_after = self.next_wake();
            tokio::select! {
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                }
                Some(update) = self.updates_rx.recv() => {
                    self.handle_worker_update(update).await;
                }
                _ = tokio::time::sleep(wake_after) => {}
                _ = self.shutdown_token.cancelled() => {
                    info!("Orchestrator received shutdown signal");
                    break;
                }
            }
        }

        self.shutdown(maintenance).await;
        info!("Download orchestrator stopped");
    }

    /// Rebuild jobs from checkpoints that were active when the previous
    /// process died. Runs before the command loop, so replayed work is
    /// first in line.
    async fn replay_journal(&mut self) -> Result<()> {
        let pending = self.journal.get_pending()?;
        if pending.is_empty() {
            return Ok(());
        }
        info!("Replaying {} checkpoints from the recovery journal", pending.len());

        for checkpoint in pending {
            match checkpoint.operation_kind {
                OperationKind::Transfer => self.replay_transfer(checkpoint),
                OperationKind::TagWrite => self.replay_tag_write(checkpoint).await,
                OperationKind::Hydration => {
                    warn!(
                        "Checkpoint {} has operation {} which this build does not replay, leaving it",
                        checkpoint.id,
                        checkpoint.operation_kind.as_str()
                    );
                }
            }
        }
        Ok(())
    }

    fn replay_transfer(&mut self, checkpoint: RecoveryCheckpoint) {
        let state: TransferState = match serde_json::from_str(&checkpoint.state_blob) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    "Checkpoint {} has an unreadable transfer blob, leaving it: {}",
                    checkpoint.id, e
                );
                return;
            }
        };

        let dedupe = state.request.dedupe_key();
        if self.dedupe_index.contains_key(&dedupe) {
            warn!(
                "Checkpoint {} duplicates an already restored track, dropping it",
                checkpoint.id
            );
            if let Err(e) = self.journal.complete(&checkpoint.id) {
                warn!("Stale checkpoint {} not removed: {:#}", checkpoint.id, e);
            }
            return;
        }

        let mut job = DownloadJob::new(
            checkpoint.id.clone(),
            state.request.clone(),
            &self.shutdown_token,
        );
        job.retry_count = checkpoint.failure_count;
        job.total_bytes = Some(state.expected_size);
        job.progress_bytes
            .store(state.confirmed_bytes, Ordering::Relaxed);
        job.resume_direct = true;
        job.output_path = Some(state.output_path.clone());
        job.partial_path = Some(state.partial_path.clone());

        info!(
            "Restored job {} ({} - {}) at {} of {} bytes",
            job.id, job.request.artist, job.request.title, state.confirmed_bytes, state.expected_size
        );
        self.dedupe_index.insert(dedupe.clone(), job.id.clone());
        self.emit(DownloadEvent::StateChanged {
            job_id: job.id.clone(),
            dedupe_hash: dedupe,
            state: JobState::Pending,
        });
        self.jobs.push(job);
    }

    /// A tag-write checkpoint means the transfer itself finished; retry the
    /// tags once and drop the checkpoint on success.
    async fn replay_tag_write(&mut self, checkpoint: RecoveryCheckpoint) {
        let state: TagState = match serde_json::from_str(&checkpoint.state_blob) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    "Checkpoint {} has an unreadable tag blob, leaving it: {}",
                    checkpoint.id, e
                );
                return;
            }
        };

        self.completed_hashes.insert(state.request.dedupe_key());

        match self.ctx.tags.write_tags(&state.output_path, &state.request).await {
            Ok(()) => {
                info!("Recovered pending tag write for {:?}", state.output_path);
                if let Err(e) = self.journal.complete(&checkpoint.id) {
                    warn!("Tag checkpoint {} not removed: {:#}", checkpoint.id, e);
                }
            }
            Err(e) => {
                warn!(
                    "Tag write retry failed for {:?}, keeping checkpoint: {:#}",
                    state.output_path, e
                );
            }
        }
    }

    /// Dispatch dispatchable jobs until the queue or the permits run out.
    async fn dispatch_ready_jobs(&mut self) {
        if self.shutdown_token.is_cancelled() {
            return;
        }
        loop {
            let now = Instant::now();
            let Some(index) = self.jobs.iter().position(|job| job.is_dispatchable(now)) else {
                break;
            };
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };
            self.dispatch(index, permit);
            // Spaces out bursts of starts; commands are simply queued behind it.
            tokio::time::sleep(self.settings.dispatch_delay).await;
        }
    }

    fn dispatch(&mut self, index: usize, permit: OwnedSemaphorePermit) {
        let resume = self.load_resume_state(&self.jobs[index].id);
        let profile = self.profile.clone();
        let worker_token = self.shutdown_token.child_token();

        let (pipeline_job, job_id, cancel, dedupe) = {
            let job = &mut self.jobs[index];
            job.cancel = worker_token;
            job.state = JobState::Searching;
            let resume_direct = job.resume_direct && resume.is_some();
            let pipeline_job = PipelineJob {
                job_id: job.id.clone(),
                request: job.request.clone(),
                profile,
                resume,
                resume_direct,
                progress_bytes: Arc::clone(&job.progress_bytes),
            };
            (
                pipeline_job,
                job.id.clone(),
                job.cancel.clone(),
                job.request.dedupe_key(),
            )
        };

        info!(
            "Dispatching job {}: {} - {}",
            job_id, pipeline_job.request.artist, pipeline_job.request.title
        );
        self.emit(DownloadEvent::StateChanged {
            job_id: job_id.clone(),
            dedupe_hash: dedupe,
            state: JobState::Searching,
        });

        let ctx = Arc::clone(&self.ctx);
        let updates = self.updates_tx.clone();
        let handle = tokio::spawn(async move {
            pipeline::run_pipeline(pipeline_job, ctx, cancel, updates).await;
            drop(permit);
        });
        self.worker_handles.insert(job_id, handle);
    }

    /// Read the job's transfer checkpoint back, if one is active.
    fn load_resume_state(&self, job_id: &str) -> Option<TransferState> {
        let checkpoint = match self.journal.get_checkpoint(job_id) {
            Ok(Some(c))
                if c.operation_kind == OperationKind::Transfer
                    && c.status == CheckpointStatus::Active =>
            {
                c
            }
            Ok(_) => return None,
            Err(e) => {
                warn!("Job {}: checkpoint read failed: {:#}", job_id, e);
                return None;
            }
        };
        match serde_json::from_str(&checkpoint.state_blob) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(
                    "Job {}: unreadable transfer state, starting fresh: {}",
                    job_id, e
                );
                None
            }
        }
    }

    /// Time until a backoff gate opens, capped at the default park interval.
    fn next_wake(&self) -> Duration {
        let now = Instant::now();
        let mut wake = Duration::from_secs(60);
        for job in &self.jobs {
            if job.state != JobState::Pending || job.dead_lettered {
                continue;
            }
            if let Some(at) = job.next_attempt_at {
                if at > now {
                    wake = wake.min(at - now);
                }
            }
        }
        wake
    }

    async fn handle_command(&mut self, command: OrchestratorCommand) {
        match command {
            OrchestratorCommand::QueueTracks { requests, response } => {
                let outcomes = self.queue_tracks(requests);
                let _ = response.send(outcomes);
            }
            OrchestratorCommand::Pause { job_id, response } => {
                let _ = response.send(self.pause_job(&job_id));
            }
            OrchestratorCommand::Resume { job_id, response } => {
                let _ = response.send(self.resume_job(&job_id));
            }
            OrchestratorCommand::Cancel { job_id, response } => {
                let _ = response.send(self.cancel_job(&job_id).await);
            }
            OrchestratorCommand::Retry { job_id, response } => {
                let _ = response.send(self.retry_job(&job_id).await);
            }
            OrchestratorCommand::SwapProfile { profile, response } => {
                let _ = response.send(self.swap_profile(&profile));
            }
            OrchestratorCommand::GetSnapshots { response } => {
                let snapshots = self.jobs.iter().map(|job| job.snapshot()).collect();
                let _ = response.send(snapshots);
            }
            OrchestratorCommand::GetStats { response } => {
                let _ = response.send(self.stats());
            }
        }
    }

    fn queue_tracks(&mut self, requests: Vec<TrackRequest>) -> Vec<QueueOutcome> {
        requests
            .into_iter()
            .map(|request| self.queue_one(request))
            .collect()
    }

    fn queue_one(&mut self, request: TrackRequest) -> QueueOutcome {
        let dedupe = request.dedupe_key();

        if let Some(job_id) = self.dedupe_index.get(&dedupe) {
            debug!(
                "Request {} - {} duplicates active job {}",
                request.artist, request.title, job_id
            );
            return QueueOutcome::DuplicateActive {
                job_id: job_id.clone(),
            };
        }
        if self.completed_hashes.contains(&dedupe) {
            return QueueOutcome::AlreadyCompleted;
        }
        match self.projections.find(&dedupe) {
            Ok(Some(projection)) if projection.status == JobState::Completed => {
                self.completed_hashes.insert(dedupe);
                return QueueOutcome::AlreadyCompleted;
            }
            Ok(_) => {}
            // Fail open; a broken read model must not block downloads.
            Err(e) => warn!("Projection lookup failed for {}: {:#}", dedupe, e),
        }

        let job_id = Uuid::new_v4().to_string();
        let job = DownloadJob::new(job_id.clone(), request, &self.shutdown_token);
        info!(
            "Queued job {}: {} - {} ({:?})",
            job_id, job.request.artist, job.request.title, job.request.priority
        );
        self.dedupe_index.insert(dedupe.clone(), job_id.clone());
        self.emit(DownloadEvent::Queued {
            job_id: job_id.clone(),
            dedupe_hash: dedupe,
            artist: job.request.artist.clone(),
            title: job.request.title.clone(),
            album: job.request.album.clone(),
        });
        self.jobs.push(job);
        QueueOutcome::Queued { job_id }
    }

    fn pause_job(&mut self, job_id: &str) -> Result<(), CommandError> {
        let Some(job) = self.jobs.iter_mut().find(|j| j.id == job_id) else {
            return Err(CommandError::NotFound(job_id.to_string()));
        };
        match job.state {
            JobState::Pending => {
                job.state = JobState::Paused;
                job.next_attempt_at = None;
            }
            state if state.is_in_flight() => {
                job.state = JobState::Paused;
                job.cancel.cancel();
            }
            other => {
                return Err(CommandError::InvalidState(format!(
                    "cannot pause a job in state {}",
                    other.as_str()
                )));
            }
        }
        let dedupe = job.request.dedupe_key();
        info!("Paused job {}", job_id);
        self.emit(DownloadEvent::StateChanged {
            job_id: job_id.to_string(),
            dedupe_hash: dedupe,
            state: JobState::Paused,
        });
        Ok(())
    }

    fn resume_job(&mut self, job_id: &str) -> Result<(), CommandError> {
        let Some(job) = self.jobs.iter_mut().find(|j| j.id == job_id) else {
            return Err(CommandError::NotFound(job_id.to_string()));
        };
        if job.state != JobState::Paused {
            return Err(CommandError::InvalidState(format!(
                "cannot resume a job in state {}",
                job.state.as_str()
            )));
        }
        job.state = JobState::Pending;
        job.next_attempt_at = None;
        job.resume_direct = true;
        let dedupe = job.request.dedupe_key();
        info!("Resumed job {}", job_id);
        self.emit(DownloadEvent::StateChanged {
            job_id: job_id.to_string(),
            dedupe_hash: dedupe,
            state: JobState::Pending,
        });
        Ok(())
    }

    async fn cancel_job(&mut self, job_id: &str) -> Result<(), CommandError> {
        let (was_in_flight, dedupe) = {
            let Some(job) = self.jobs.iter_mut().find(|j| j.id == job_id) else {
                return Err(CommandError::NotFound(job_id.to_string()));
            };
            match job.state {
                JobState::Completed | JobState::Cancelled => {
                    return Err(CommandError::InvalidState(format!(
                        "cannot cancel a job in state {}",
                        job.state.as_str()
                    )));
                }
                state => {
                    let in_flight = state.is_in_flight();
                    job.state = JobState::Cancelled;
                    job.next_attempt_at = None;
                    job.resume_direct = false;
                    if in_flight {
                        job.cancel.cancel();
                    }
                    (in_flight, job.request.dedupe_key())
                }
            }
        };

        self.dedupe_index.remove(&dedupe);
        if !was_in_flight {
            // In-flight jobs clean up when the worker reports back.
            self.purge_job_artifacts(job_id).await;
        }
        info!("Cancelled job {}", job_id);
        self.emit(DownloadEvent::StateChanged {
            job_id: job_id.to_string(),
            dedupe_hash: dedupe,
            state: JobState::Cancelled,
        });
        Ok(())
    }

    async fn retry_job(&mut self, job_id: &str) -> Result<(), CommandError> {
        let dedupe = {
            let Some(job) = self.jobs.iter().find(|j| j.id == job_id) else {
                return Err(CommandError::NotFound(job_id.to_string()));
            };
            if !job.state.is_retryable_by_user() {
                return Err(CommandError::InvalidState(format!(
                    "cannot retry a job in state {}",
                    job.state.as_str()
                )));
            }
            job.request.dedupe_key()
        };
        if let Some(existing) = self.dedupe_index.get(&dedupe) {
            if existing != job_id {
                return Err(CommandError::InvalidState(format!(
                    "another active job ({}) exists for this track",
                    existing
                )));
            }
        }

        // A retry starts over: no stale partial, no stale checkpoint.
        self.purge_job_artifacts(job_id).await;

        let Some(job) = self.jobs.iter_mut().find(|j| j.id == job_id) else {
            return Err(CommandError::NotFound(job_id.to_string()));
        };
        job.state = JobState::Pending;
        job.retry_count = 0;
        job.error = None;
        job.dead_lettered = false;
        job.resume_direct = false;
        job.next_attempt_at = None;
        job.candidate = None;
        job.total_bytes = None;
        job.completed_at = None;
        job.progress_bytes.store(0, Ordering::Relaxed);
        job.output_path = None;
        job.partial_path = None;

        self.dedupe_index.insert(dedupe.clone(), job_id.to_string());
        info!("Retrying job {} from scratch", job_id);
        self.emit(DownloadEvent::StateChanged {
            job_id: job_id.to_string(),
            dedupe_hash: dedupe,
            state: JobState::Pending,
        });
        Ok(())
    }

    fn swap_profile(&mut self, name: &str) -> Result<(), CommandError> {
        match WeightProfile::by_name(name) {
            Some(profile) => {
                info!(
                    "Ranking profile switched from '{}' to '{}'",
                    self.profile.name, profile.name
                );
                self.profile = profile;
                Ok(())
            }
            None => Err(CommandError::UnknownProfile(name.to_string())),
        }
    }

    fn stats(&self) -> EngineStats {
        let mut stats = EngineStats::default();
        for job in &self.jobs {
            match job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Searching => stats.searching += 1,
                JobState::Downloading => stats.downloading += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Cancelled => stats.cancelled += 1,
                JobState::Paused => stats.paused += 1,
            }
        }
        stats
    }

    async fn handle_worker_update(&mut self, update: WorkerUpdate) {
        match update {
            WorkerUpdate::CandidateSelected {
                job_id,
                candidate,
                total_bytes,
                output_path,
                partial_path,
            } => {
                let Some(job) = self.jobs.iter_mut().find(|j| j.id == job_id) else {
                    return;
                };
                job.candidate = Some(candidate);
                job.total_bytes = Some(total_bytes);
                job.output_path = Some(output_path);
                job.partial_path = Some(partial_path);
                // A pause or cancel may have raced the worker; only a job
                // still searching moves forward.
                if job.state == JobState::Searching {
                    job.state = JobState::Downloading;
                    let dedupe = job.request.dedupe_key();
                    self.emit(DownloadEvent::StateChanged {
                        job_id,
                        dedupe_hash: dedupe,
                        state: JobState::Downloading,
                    });
                }
            }
            WorkerUpdate::Finished { job_id, outcome } => {
                if let Some(handle) = self.worker_handles.remove(&job_id) {
                    let _ = handle.await;
                }
                match outcome {
                    PipelineOutcome::Completed { output_path } => {
                        self.on_job_completed(&job_id, output_path);
                    }
                    PipelineOutcome::Failed { kind, message } => {
                        self.on_job_failed(&job_id, kind, message);
                    }
                    PipelineOutcome::Cancelled => {
                        self.on_job_interrupted(&job_id).await;
                    }
                }
            }
        }
    }

    fn on_job_completed(&mut self, job_id: &str, output_path: PathBuf) {
        let dedupe = {
            let Some(job) = self.jobs.iter_mut().find(|j| j.id == job_id) else {
                return;
            };
            job.state = JobState::Completed;
            job.completed_at = Some(chrono::Utc::now().timestamp());
            job.output_path = Some(output_path.clone());
            job.error = None;
            job.resume_direct = false;
            job.request.dedupe_key()
        };
        self.completed_hashes.insert(dedupe.clone());
        self.dedupe_index.remove(&dedupe);
        self.emit(DownloadEvent::Completed {
            job_id: job_id.to_string(),
            dedupe_hash: dedupe,
            output_path,
        });
    }

    fn on_job_failed(&mut self, job_id: &str, kind: DownloadErrorKind, message: String) {
        enum Disposition {
            Retry { attempt: u32, delay: Duration },
            DeadLetter { dedupe: String },
            Superseded,
        }

        let disposition = {
            let Some(job) = self.jobs.iter_mut().find(|j| j.id == job_id) else {
                return;
            };
            // A pause or cancel that raced the failure wins; the cancel path
            // already handled cleanup.
            if job.state == JobState::Paused || job.state == JobState::Cancelled {
                Disposition::Superseded
            } else if self.retry_policy.should_retry(kind, job.retry_count) {
                job.retry_count += 1;
                job.state = JobState::Pending;
                job.resume_direct = false;
                job.error = Some((kind, message.clone()));
                let delay = self.retry_policy.backoff(job.retry_count - 1);
                job.next_attempt_at = Some(Instant::now() + delay);
                Disposition::Retry {
                    attempt: job.retry_count,
                    delay,
                }
            } else {
                job.state = JobState::Failed;
                job.error = Some((kind, message.clone()));
                job.next_attempt_at = None;
                job.dead_lettered = true;
                Disposition::DeadLetter {
                    dedupe: job.request.dedupe_key(),
                }
            }
        };

        match disposition {
            Disposition::Retry { attempt, delay } => {
                debug!(
                    "Job {} attempt {} failed ({}), retrying in {:?}: {}",
                    job_id,
                    attempt,
                    kind.as_str(),
                    delay,
                    message
                );
                if let Err(e) = self.journal.increment_failure(job_id) {
                    warn!("Job {}: failure count not recorded: {:#}", job_id, e);
                }
            }
            Disposition::DeadLetter { dedupe } => {
                error!(
                    "Job {} failed for good ({}): {}",
                    job_id,
                    kind.as_str(),
                    message
                );
                if let Err(e) = self.journal.mark_dead_letter(job_id) {
                    warn!("Job {}: dead-letter not recorded: {:#}", job_id, e);
                }
                self.dedupe_index.remove(&dedupe);
                self.emit(DownloadEvent::Failed {
                    job_id: job_id.to_string(),
                    dedupe_hash: dedupe,
                    kind,
                    message,
                    dead_lettered: true,
                });
            }
            Disposition::Superseded => {}
        }
    }

    /// A worker came back cancelled. What happens next depends on why.
    async fn on_job_interrupted(&mut self, job_id: &str) {
        let state = self
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .map(|j| j.state);
        match state {
            // Paused: bytes and checkpoint stay for resume.
            Some(JobState::Paused) => {}
            // Cancelled mid-flight: the deferred cleanup happens now.
            Some(JobState::Cancelled) => self.purge_job_artifacts(job_id).await,
            // Shutdown: the checkpoint survives for the next boot.
            Some(_) if self.shutdown_token.is_cancelled() => {}
            Some(state) => {
                debug!(
                    "Job {} worker interrupted in state {}, leaving as is",
                    job_id,
                    state.as_str()
                );
            }
            None => {}
        }
    }

    /// Delete a job's partial and final files and drop its checkpoints.
    /// All best-effort; files may never have existed.
    async fn purge_job_artifacts(&mut self, job_id: &str) {
        let (partial, output) = match self.jobs.iter().find(|j| j.id == job_id) {
            Some(job) => (job.partial_path.clone(), job.output_path.clone()),
            None => (None, None),
        };
        if let Some(path) = partial {
            remove_file_quietly(&path).await;
        }
        if let Some(path) = output {
            remove_file_quietly(&path).await;
        }
        if let Err(e) = self.journal.complete(job_id) {
            warn!("Job {}: checkpoint not removed: {:#}", job_id, e);
        }
        if let Err(e) = self.journal.complete(&tag_checkpoint_id(job_id)) {
            warn!("Job {}: tag checkpoint not removed: {:#}", job_id, e);
        }
    }

    /// Periodic journal hygiene: log counts and optionally move dead-letter
    /// checkpoints back to active so the next boot replays them.
    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let journal = Arc::clone(&self.journal);
        let interval = self.settings.maintenance_interval;
        let auto_reset = self.settings.auto_reset_dead_letters;
        let batch = self.settings.dead_letter_batch;
        let token = self.shutdown_token.child_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = token.cancelled() => break,
                }

                match journal.counts_by_status() {
                    Ok(stats) => {
                        if stats.total() > 0 {
                            info!(
                                "Journal sweep: {} active, {} dead-letter checkpoints",
                                stats.active, stats.dead_letter
                            );
                        }
                        if auto_reset && batch > 0 && stats.dead_letter > 0 {
                            match journal.reset_dead_letters(batch) {
                                Ok(reset) if reset > 0 => {
                                    info!("Reactivated {} dead-letter checkpoints", reset);
                                }
                                Ok(_) => {}
                                Err(e) => warn!("Dead-letter reset failed: {:#}", e),
                            }
                        }
                    }
                    Err(e) => warn!("Journal sweep failed: {:#}", e),
                }
            }
            debug!("Maintenance sweep stopped");
        })
    }

    /// Bounded-grace shutdown: workers are already cancelled through the
    /// token tree; wait for them, then abort stragglers.
    async fn shutdown(&mut self, maintenance: JoinHandle<()>) {
        info!(
            "Shutting down orchestrator, waiting up to {:?} for {} workers",
            self.settings.shutdown_grace,
            self.worker_handles.len()
        );
        self.journal.begin_shutdown();

        let deadline = Instant::now() + self.settings.shutdown_grace;
        for (job_id, mut handle) in self.worker_handles.drain() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!("Job {} did not stop within the grace period, aborting", job_id);
                handle.abort();
            }
        }
        let _ = maintenance.await;

        info!("Orchestrator shutdown complete");
    }

    /// Broadcast, ignoring the no-subscriber case.
    fn emit(&self, event: DownloadEvent) {
        let _ = self.events_tx.send(event);
    }
}

async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {:?}: {}", path, e),
    }
}

/// Create an orchestrator and its handle.
pub fn create_orchestrator(
    collaborators: Collaborators,
    settings: OrchestratorSettings,
    shutdown_token: CancellationToken,
) -> (Orchestrator, OrchestratorHandle) {
    let (command_tx, command_rx) = mpsc::channel(100);
    // Two messages per worker at most; sized so finishing workers never block.
    let (updates_tx, updates_rx) =
        mpsc::channel(settings.max_concurrent_downloads * 2 + 16);
    let (events_tx, _) = broadcast::channel(256);

    let ctx = Arc::new(PipelineContext {
        network: Arc::clone(&collaborators.network),
        journal: Arc::clone(&collaborators.journal),
        tags: Arc::clone(&collaborators.tags),
        downloads_dir: settings.downloads_dir.clone(),
        search_timeout: settings.search_timeout,
        stall_timeout: settings.stall_timeout,
    });

    let orchestrator = Orchestrator {
        jobs: Vec::new(),
        dedupe_index: HashMap::new(),
        completed_hashes: HashSet::new(),
        semaphore: Arc::new(Semaphore::new(settings.max_concurrent_downloads)),
        command_rx,
        updates_tx,
        updates_rx,
        events_tx: events_tx.clone(),
        worker_handles: HashMap::new(),
        profile: settings.weight_profile.clone(),
        retry_policy: settings.retry.clone(),
        journal: Arc::clone(&collaborators.journal),
        projections: Arc::clone(&collaborators.projections),
        ctx,
        settings,
        shutdown_token,
    };

    let handle = OrchestratorHandle::new(command_tx, events_tx);
    (orchestrator, handle)
}
