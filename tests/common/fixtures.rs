//! Orchestrator harness and request builders
//!
//! Spins up a full orchestrator over a mock network and real SQLite stores
//! in a temp directory, mirroring the production wiring in `main`.

use super::constants::*;
use super::network::MockNetwork;
use soulfetch::collaborators::{
    spawn_projection_adapter, Collaborators, LoggingTagWriter, NetworkCollaborator,
    ProjectionStore, SqliteProjectionStore, TagWriter, TrackProjection,
};
use soulfetch::journal::{RecoveryJournal, SqliteRecoveryJournal, DEFAULT_STALENESS_WINDOW};
use soulfetch::orchestrator::{
    create_orchestrator, CandidateFile, DownloadEvent, JobSnapshot, JobState, OrchestratorHandle,
    OrchestratorSettings, QueueOutcome, RetryPolicy, TrackRequest,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Claimed bitrate every test candidate advertises (kbps).
const TEST_BITRATE_KBPS: u32 = 192;

/// Settings tuned for test speed: immediate retries, a short stall window
/// and no dispatch pacing.
pub fn test_settings(downloads_dir: PathBuf) -> OrchestratorSettings {
    OrchestratorSettings {
        downloads_dir,
        max_concurrent_downloads: 3,
        search_timeout: Duration::from_secs(5),
        stall_timeout: Duration::from_millis(TEST_STALL_TIMEOUT_MS),
        dispatch_delay: Duration::from_millis(1),
        shutdown_grace: Duration::from_secs(5),
        maintenance_interval: Duration::from_secs(3600),
        dead_letter_batch: 25,
        auto_reset_dead_letters: false,
        weight_profile: soulfetch::WeightProfile::balanced(),
        retry: RetryPolicy {
            max_retries: 2,
            initial_backoff_secs: 0,
            max_backoff_secs: 0,
            backoff_multiplier: 1.0,
        },
    }
}

/// A running orchestrator with every collaborator reachable for assertions.
///
/// Call [`TestHarness::shutdown`] at the end of a test that needs a graceful
/// drain; otherwise dropping the harness aborts the loop with the temp dir.
pub struct TestHarness {
    pub handle: OrchestratorHandle,
    pub network: Arc<MockNetwork>,
    pub journal: Arc<SqliteRecoveryJournal>,
    pub projections: Arc<SqliteProjectionStore>,
    pub events: broadcast::Receiver<DownloadEvent>,
    pub downloads_dir: PathBuf,
    pub shutdown_token: CancellationToken,
    run_task: JoinHandle<()>,
    projection_task: JoinHandle<()>,
    _temp_dir: Option<TempDir>,
}

impl TestHarness {
    /// Orchestrator over a fresh temp directory with default test settings.
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Same, with a hook to adjust the settings before the loop starts.
    pub async fn spawn_with(configure: impl FnOnce(&mut OrchestratorSettings)) -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let mut harness =
            Self::spawn_in(temp.path(), DEFAULT_STALENESS_WINDOW, configure).await;
        harness._temp_dir = Some(temp);
        harness
    }

    /// Spawn over an existing directory, so reboot tests can bring a second
    /// instance up on the same journal and projection databases.
    pub async fn spawn_in(
        root: &Path,
        staleness_window: Duration,
        configure: impl FnOnce(&mut OrchestratorSettings),
    ) -> Self {
        let downloads_dir = root.join("downloads");
        std::fs::create_dir_all(&downloads_dir).expect("Failed to create downloads dir");

        let journal = Arc::new(
            SqliteRecoveryJournal::new(root.join("recovery_journal.db"), staleness_window)
                .expect("Failed to open recovery journal"),
        );
        let projections = Arc::new(
            SqliteProjectionStore::new(root.join("track_projection.db"))
                .expect("Failed to open projection store"),
        );
        let network = Arc::new(MockNetwork::new());

        let mut settings = test_settings(downloads_dir.clone());
        configure(&mut settings);

        let shutdown_token = CancellationToken::new();
        let (mut orchestrator, handle) = create_orchestrator(
            Collaborators {
                network: network.clone() as Arc<dyn NetworkCollaborator>,
                journal: journal.clone() as Arc<dyn RecoveryJournal>,
                projections: projections.clone() as Arc<dyn ProjectionStore>,
                tags: Arc::new(LoggingTagWriter) as Arc<dyn TagWriter>,
            },
            settings,
            shutdown_token.clone(),
        );

        // Subscriptions predate the loop so no event is missed.
        let events = handle.subscribe();
        let projection_task = spawn_projection_adapter(
            projections.clone() as Arc<dyn ProjectionStore>,
            handle.subscribe(),
        );
        let run_task = tokio::spawn(async move { orchestrator.run().await });

        Self {
            handle,
            network,
            journal,
            projections,
            events,
            downloads_dir,
            shutdown_token,
            run_task,
            projection_task,
            _temp_dir: None,
        }
    }

    /// Graceful shutdown: cancel, then wait for the loop to drain workers.
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        let _ = self.run_task.await;
        self.projection_task.abort();
    }

    /// Queue one request and return its job id, panicking on any other
    /// outcome.
    pub async fn queue_one(&self, request: TrackRequest) -> String {
        let outcomes = self
            .handle
            .queue_tracks(vec![request])
            .await
            .expect("queue_tracks failed");
        match outcomes.into_iter().next() {
            Some(QueueOutcome::Queued { job_id }) => job_id,
            other => panic!("expected a queued outcome, got {:?}", other),
        }
    }

    pub async fn snapshot(&self, job_id: &str) -> JobSnapshot {
        self.handle
            .snapshots()
            .await
            .expect("snapshots failed")
            .into_iter()
            .find(|s| s.id == job_id)
            .unwrap_or_else(|| panic!("no snapshot for job {}", job_id))
    }

    /// Wait for the next event matching `predicate`, failing the test after
    /// a deadline so a wedged orchestrator cannot hang the suite.
    pub async fn wait_for_event(
        &mut self,
        what: &str,
        predicate: impl Fn(&DownloadEvent) -> bool,
    ) -> DownloadEvent {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        panic!("event stream lagged by {} waiting for {}", n, what)
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("event stream closed waiting for {}", what)
                    }
                }
            }
        };
        match tokio::time::timeout(Duration::from_millis(WAIT_TIMEOUT_MS), wait).await {
            Ok(event) => event,
            Err(_) => panic!("timed out waiting for {}", what),
        }
    }

    /// Collect events in order until one matches `predicate`; the matching
    /// event is included as the last element.
    pub async fn collect_events_until(
        &mut self,
        what: &str,
        predicate: impl Fn(&DownloadEvent) -> bool,
    ) -> Vec<DownloadEvent> {
        let mut seen = Vec::new();
        let wait = async {
            loop {
                match self.events.recv().await {
                    Ok(event) => {
                        let done = predicate(&event);
                        seen.push(event);
                        if done {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        panic!("event stream lagged by {} waiting for {}", n, what)
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("event stream closed waiting for {}", what)
                    }
                }
            }
        };
        if tokio::time::timeout(Duration::from_millis(WAIT_TIMEOUT_MS), wait)
            .await
            .is_err()
        {
            panic!("timed out waiting for {} (saw {:?})", what, seen);
        }
        seen
    }

    pub async fn wait_for_completed(&mut self, job_id: &str) -> PathBuf {
        let id = job_id.to_string();
        let event = self
            .wait_for_event(&format!("completion of job {}", job_id), move |e| {
                matches!(e, DownloadEvent::Completed { .. }) && e.job_id() == id
            })
            .await;
        match event {
            DownloadEvent::Completed { output_path, .. } => output_path,
            _ => unreachable!(),
        }
    }

    pub async fn wait_for_failed(&mut self, job_id: &str) -> DownloadEvent {
        let id = job_id.to_string();
        self.wait_for_event(&format!("failure of job {}", job_id), move |e| {
            matches!(e, DownloadEvent::Failed { .. }) && e.job_id() == id
        })
        .await
    }

    /// Poll snapshots until the job reaches `state`.
    pub async fn wait_for_state(&self, job_id: &str, state: JobState) {
        self.wait_until(&format!("job {} in state {}", job_id, state.as_str()), || async {
            self.snapshot(job_id).await.state == state
        })
        .await;
    }

    /// Poll snapshots until the job has transferred some bytes.
    pub async fn wait_for_progress(&self, job_id: &str) -> u64 {
        self.wait_until(&format!("progress on job {}", job_id), || async {
            self.snapshot(job_id).await.progress_bytes > 0
        })
        .await;
        self.snapshot(job_id).await.progress_bytes
    }

    /// Poll the projection store until the track's row reaches `status`.
    pub async fn wait_for_projection(&self, dedupe: &str, status: JobState) -> TrackProjection {
        self.wait_until(
            &format!("projection of {} to reach {}", dedupe, status.as_str()),
            || async {
                matches!(
                    self.projections.find(dedupe),
                    Ok(Some(row)) if row.status == status
                )
            },
        )
        .await;
        self.projections
            .find(dedupe)
            .expect("projection lookup failed")
            .expect("projection row vanished")
    }

    /// Generic deadline poll.
    pub async fn wait_until<F, Fut>(&self, what: &str, condition: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(WAIT_TIMEOUT_MS);
        loop {
            if condition().await {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }
}

// ============================================================================
// Request and candidate builders
// ============================================================================

/// A short track request. The small duration keeps mock payloads small
/// while staying consistent with the claimed bitrate.
pub fn track(artist: &str, title: &str) -> TrackRequest {
    TrackRequest::new(artist, title, Some("Harness Sessions"), 8)
}

/// Remote path `peer` would share a rip of `request` under.
pub fn remote_path_for(peer: &str, request: &TrackRequest) -> String {
    format!(
        "Music\\{}\\{}\\{} - {}.mp3",
        peer, request.artist, request.artist, request.title
    )
}

/// Byte size that keeps the claimed bitrate, length and size mutually
/// plausible, so the efficiency guard accepts the candidate.
pub fn candidate_size(request: &TrackRequest) -> u64 {
    TEST_BITRATE_KBPS as u64 * 125 * request.duration_secs as u64 + 64 * 1024
}

/// A metadata-consistent candidate that ranks confidently for `request`.
pub fn candidate_for(peer: &str, request: &TrackRequest) -> CandidateFile {
    CandidateFile::new(peer, &remote_path_for(peer, request), candidate_size(request))
        .with_attributes(TEST_BITRATE_KBPS, request.duration_secs)
        .with_availability(true, 0)
}
