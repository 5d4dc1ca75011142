//! Data models for the download orchestrator.
//!
//! Defines track requests, candidate files, jobs, states, priorities and the
//! error taxonomy shared across the engine.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// State of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Searching,
    Downloading,
    Completed, // terminal
    Failed,
    Cancelled,
    Paused,
}

impl JobState {
    /// Returns true for states that hold a concurrency slot.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobState::Searching | JobState::Downloading)
    }

    /// Returns true once the job can never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed)
    }

    /// Returns true if a user retry may move the job back to Pending.
    pub fn is_retryable_by_user(&self) -> bool {
        matches!(self, JobState::Failed | JobState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Searching => "SEARCHING",
            JobState::Downloading => "DOWNLOADING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::Paused => "PAUSED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobState::Pending),
            "SEARCHING" => Some(JobState::Searching),
            "DOWNLOADING" => Some(JobState::Downloading),
            "COMPLETED" => Some(JobState::Completed),
            "FAILED" => Some(JobState::Failed),
            "CANCELLED" => Some(JobState::Cancelled),
            "PAUSED" => Some(JobState::Paused),
            _ => None,
        }
    }
}

/// Priority of a track request.
/// Higher values win when the journal replays pending work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestPriority {
    Backfill = 1, // bulk imports, library fills
    Normal = 2,   // regular requests
    Urgent = 3,   // user is waiting on this one
}

impl RequestPriority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(RequestPriority::Backfill),
            2 => Some(RequestPriority::Normal),
            3 => Some(RequestPriority::Urgent),
            _ => None,
        }
    }
}

impl Default for RequestPriority {
    fn default() -> Self {
        RequestPriority::Normal
    }
}

/// Classified failure cause for a job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadErrorKind {
    /// Connection refused, reset, daemon unreachable. Retried with backoff.
    Network,
    /// Active transfer produced zero bytes past the stall window. Retried,
    /// since the next attempt picks a different peer.
    Stall,
    /// Search returned nothing usable. Retried, peers come and go.
    NoCandidates,
    /// Local disk I/O failed while preparing or finalizing the output.
    /// Not retried.
    Persistence,
    /// Anything unclassified.
    Unknown,
}

impl DownloadErrorKind {
    /// Returns true if the job-level retry policy applies.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DownloadErrorKind::Persistence)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadErrorKind::Network => "NETWORK",
            DownloadErrorKind::Stall => "STALL",
            DownloadErrorKind::NoCandidates => "NO_CANDIDATES",
            DownloadErrorKind::Persistence => "PERSISTENCE",
            DownloadErrorKind::Unknown => "UNKNOWN",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "NETWORK" => Some(DownloadErrorKind::Network),
            "STALL" => Some(DownloadErrorKind::Stall),
            "NO_CANDIDATES" => Some(DownloadErrorKind::NoCandidates),
            "PERSISTENCE" => Some(DownloadErrorKind::Persistence),
            "UNKNOWN" => Some(DownloadErrorKind::Unknown),
            _ => None,
        }
    }
}

/// A track the user wants downloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackRequest {
    pub artist: String,
    pub title: String,
    #[serde(default)]
    pub album: Option<String>,
    /// Expected duration from the source metadata, in seconds.
    pub duration_secs: u32,
    /// Expected tempo in BPM, when the importer knows it.
    #[serde(default)]
    pub tempo_bpm: Option<f64>,
    /// Expected musical key (e.g. "8A", "Am"), informational only.
    #[serde(default)]
    pub musical_key: Option<String>,
    /// Stable identity for duplicate suppression. Computed from the
    /// normalized metadata when the importer does not supply one.
    #[serde(default)]
    pub dedupe_hash: Option<String>,
    #[serde(default)]
    pub priority: RequestPriority,
}

impl TrackRequest {
    pub fn new(artist: &str, title: &str, album: Option<&str>, duration_secs: u32) -> Self {
        Self {
            artist: artist.to_string(),
            title: title.to_string(),
            album: album.map(|s| s.to_string()),
            duration_secs,
            tempo_bpm: None,
            musical_key: None,
            dedupe_hash: None,
            priority: RequestPriority::Normal,
        }
    }

    pub fn with_tempo(mut self, bpm: f64) -> Self {
        self.tempo_bpm = Some(bpm);
        self
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    /// The dedupe key: the supplied hash, or a SHA-256 over the normalized
    /// artist/title/album/duration when none was given.
    pub fn dedupe_key(&self) -> String {
        if let Some(hash) = &self.dedupe_hash {
            if !hash.is_empty() {
                return hash.clone();
            }
        }
        let mut hasher = Sha256::new();
        hasher.update(normalize_for_hash(&self.artist));
        hasher.update("|");
        hasher.update(normalize_for_hash(&self.title));
        hasher.update("|");
        hasher.update(normalize_for_hash(self.album.as_deref().unwrap_or("")));
        hasher.update("|");
        hasher.update(self.duration_secs.to_string());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Filesystem-safe stem for output files, `Artist - Title`.
    pub fn file_stem(&self) -> String {
        let raw = format!("{} - {}", self.artist, self.title);
        raw.chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c => c,
            })
            .collect()
    }

    /// Freeform search text sent to the network.
    pub fn search_text(&self) -> String {
        format!("{} {}", self.artist, self.title)
    }
}

fn normalize_for_hash(s: &str) -> String {
    s.trim().to_lowercase()
}

/// A remote file returned by a network search, evaluated against a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateFile {
    /// Username of the peer sharing the file.
    pub peer: String,
    /// Full path on the peer's share. Peers on Windows share backslash paths.
    pub remote_path: String,
    pub size_bytes: u64,
    /// Bitrate the peer claims, in kbps. Absent when the peer sent no attributes.
    #[serde(default)]
    pub bitrate_kbps: Option<u32>,
    /// Audio length the peer claims, in seconds.
    #[serde(default)]
    pub length_secs: Option<u32>,
    /// How many transfers are queued ahead of us at this peer.
    #[serde(default)]
    pub queue_depth: u32,
    /// Whether the peer advertises an open upload slot right now.
    #[serde(default)]
    pub has_free_slot: bool,
}

impl CandidateFile {
    pub fn new(peer: &str, remote_path: &str, size_bytes: u64) -> Self {
        Self {
            peer: peer.to_string(),
            remote_path: remote_path.to_string(),
            size_bytes,
            bitrate_kbps: None,
            length_secs: None,
            queue_depth: 0,
            has_free_slot: false,
        }
    }

    pub fn with_attributes(mut self, bitrate_kbps: u32, length_secs: u32) -> Self {
        self.bitrate_kbps = Some(bitrate_kbps);
        self.length_secs = Some(length_secs);
        self
    }

    pub fn with_availability(mut self, has_free_slot: bool, queue_depth: u32) -> Self {
        self.has_free_slot = has_free_slot;
        self.queue_depth = queue_depth;
        self
    }

    /// Last path component, handling both separator conventions.
    pub fn filename(&self) -> &str {
        self.remote_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.remote_path)
    }

    /// Containing directory on the peer's share, used for sibling heuristics.
    pub fn directory(&self) -> &str {
        let filename = self.filename();
        let dir_len = self.remote_path.len() - filename.len();
        self.remote_path[..dir_len].trim_end_matches(['/', '\\'])
    }

    /// Lowercased file extension without the dot, empty when there is none.
    pub fn extension(&self) -> String {
        match self.filename().rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
            _ => String::new(),
        }
    }
}

/// A queued track with its runtime state. Owned and mutated exclusively by
/// the coordinator loop; workers only touch the shared byte counter.
#[derive(Debug)]
pub struct DownloadJob {
    pub id: String,
    pub request: TrackRequest,
    pub state: JobState,
    /// The candidate chosen by ranking, once one is selected.
    pub candidate: Option<CandidateFile>,
    /// Bytes transferred so far, shared with the worker.
    pub progress_bytes: Arc<AtomicU64>,
    pub total_bytes: Option<u64>,
    pub retry_count: u32,
    /// Transient-retry backoff gate; the scanner skips the job until due.
    pub next_attempt_at: Option<Instant>,
    /// Child of the global shutdown token. Replaced on every (re)dispatch
    /// because a cancelled token cannot be reused.
    pub cancel: CancellationToken,
    pub error: Option<(DownloadErrorKind, String)>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    /// Set when retries were exhausted and the checkpoint went to the
    /// dead-letter state; the scanner never picks the job up again.
    pub dead_lettered: bool,
    /// When set, the next dispatch skips the search and resumes the
    /// checkpointed transfer from its confirmed offset. Set on resume after
    /// pause and on journal replay; cleared for transient retries, which
    /// must pick a fresh peer.
    pub resume_direct: bool,
    pub output_path: Option<PathBuf>,
    pub partial_path: Option<PathBuf>,
}

impl DownloadJob {
    pub fn new(id: String, request: TrackRequest, shutdown: &CancellationToken) -> Self {
        Self {
            id,
            request,
            state: JobState::Pending,
            candidate: None,
            progress_bytes: Arc::new(AtomicU64::new(0)),
            total_bytes: None,
            retry_count: 0,
            next_attempt_at: None,
            cancel: shutdown.child_token(),
            error: None,
            created_at: chrono::Utc::now().timestamp(),
            completed_at: None,
            dead_lettered: false,
            resume_direct: false,
            output_path: None,
            partial_path: None,
        }
    }

    /// True when the scanner may dispatch this job right now.
    pub fn is_dispatchable(&self, now: Instant) -> bool {
        self.state == JobState::Pending
            && !self.dead_lettered
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            artist: self.request.artist.clone(),
            title: self.request.title.clone(),
            state: self.state,
            progress_bytes: self.progress_bytes.load(Ordering::Relaxed),
            total_bytes: self.total_bytes,
            retry_count: self.retry_count,
            peer: self.candidate.as_ref().map(|c| c.peer.clone()),
            error_kind: self.error.as_ref().map(|(kind, _)| *kind),
            error_message: self.error.as_ref().map(|(_, msg)| msg.clone()),
            dead_lettered: self.dead_lettered,
        }
    }
}

/// Immutable view of a job handed to external readers.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub artist: String,
    pub title: String,
    pub state: JobState,
    pub progress_bytes: u64,
    pub total_bytes: Option<u64>,
    pub retry_count: u32,
    pub peer: Option<String>,
    pub error_kind: Option<DownloadErrorKind>,
    pub error_message: Option<String>,
    pub dead_lettered: bool,
}

/// Per-state job counts for the stats surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub pending: usize,
    pub searching: usize,
    pub downloading: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub paused: usize,
}

impl EngineStats {
    pub fn in_flight(&self) -> usize {
        self.searching + self.downloading
    }
}
