//! Checkpoint records for the crash-recovery journal.

/// What kind of operation a checkpoint makes resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// A file transfer from a peer; the blob carries the confirmed offset.
    Transfer,
    /// A pending metadata write into a finalized file.
    TagWrite,
    /// Re-derivation of local state from finished downloads.
    Hydration,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Transfer => "TRANSFER",
            OperationKind::TagWrite => "TAG_WRITE",
            OperationKind::Hydration => "HYDRATION",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "TRANSFER" => Some(OperationKind::Transfer),
            "TAG_WRITE" => Some(OperationKind::TagWrite),
            "HYDRATION" => Some(OperationKind::Hydration),
            _ => None,
        }
    }
}

/// Lifecycle of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    /// In-flight, eligible for replay after a crash.
    Active,
    /// Finished; normally removed rather than kept in this state.
    Completed,
    /// Out of retries. Kept for audit and manual reset, never replayed.
    DeadLetter,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Active => "ACTIVE",
            CheckpointStatus::Completed => "COMPLETED",
            CheckpointStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(CheckpointStatus::Active),
            "COMPLETED" => Some(CheckpointStatus::Completed),
            "DEAD_LETTER" => Some(CheckpointStatus::DeadLetter),
            _ => None,
        }
    }
}

/// One durable record of a resumable in-flight operation.
/// Exactly one checkpoint exists per operation; its id doubles as the
/// operation id.
#[derive(Debug, Clone)]
pub struct RecoveryCheckpoint {
    pub id: String,
    pub operation_kind: OperationKind,
    /// The local path the operation is producing.
    pub target_path: String,
    /// Opaque JSON state owned by the operation, replayed verbatim.
    pub state_blob: String,
    pub priority: i32,
    pub failure_count: u32,
    pub status: CheckpointStatus,
    /// Monotonic milliseconds stamped by the journal on every write.
    pub heartbeat_ms: i64,
    /// Unix seconds at first insert; preserved across upserts.
    pub created_at: i64,
}

impl RecoveryCheckpoint {
    pub fn new(
        id: &str,
        operation_kind: OperationKind,
        target_path: &str,
        state_blob: String,
        priority: i32,
    ) -> Self {
        Self {
            id: id.to_string(),
            operation_kind,
            target_path: target_path.to_string(),
            state_blob,
            priority,
            failure_count: 0,
            status: CheckpointStatus::Active,
            heartbeat_ms: 0,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Row counts per checkpoint status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalStats {
    pub active: usize,
    pub completed: usize,
    pub dead_letter: usize,
}

impl JournalStats {
    pub fn total(&self) -> usize {
        self.active + self.completed + self.dead_letter
    }
}
