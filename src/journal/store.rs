//! Crash-recovery journal storage.
//!
//! Provides SQLite-backed storage for in-flight operation checkpoints so that
//! interrupted transfers can be replayed after a restart.

use super::clock::SteadyClock;
use super::models::{CheckpointStatus, JournalStats, OperationKind, RecoveryCheckpoint};
use super::schema::RECOVERY_JOURNAL_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Local retry budget for journal writes. SQLite can fail transiently
/// (SQLITE_BUSY, short I/O) without the operation itself being doomed.
const WRITE_RETRY_ATTEMPTS: u32 = 3;
const WRITE_RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Checkpoints whose heartbeat is older than this are presumed orphaned by a
/// dead process and are not offered for replay.
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Trait for crash-recovery journal operations.
///
/// One checkpoint per in-flight operation; the checkpoint id doubles as the
/// operation id. All writes are durable before the caller proceeds.
pub trait RecoveryJournal: Send + Sync {
    /// Record (or refresh) the full state of an in-flight operation.
    /// Idempotent: re-logging the same id updates the row in place.
    /// Returns the checkpoint id.
    fn log_checkpoint(&self, checkpoint: &RecoveryCheckpoint) -> Result<String>;

    /// Refresh a checkpoint's heartbeat and state blob mid-operation.
    /// No-op when `prev_bytes == cur_bytes`: a transfer that moved no bytes
    /// has nothing new worth a durable write.
    fn update_heartbeat(
        &self,
        id: &str,
        new_state: &str,
        prev_bytes: u64,
        cur_bytes: u64,
    ) -> Result<()>;

    /// Remove a checkpoint after the operation finished successfully.
    fn complete(&self, id: &str) -> Result<()>;

    /// Transition a checkpoint to DEAD_LETTER after retry exhaustion.
    /// The record is kept for audit and manual reset, never replayed.
    fn mark_dead_letter(&self, id: &str) -> Result<()>;

    /// Bump the failure count and return the new value.
    fn increment_failure(&self, id: &str) -> Result<i64>;

    /// Get a single checkpoint by id.
    fn get_checkpoint(&self, id: &str) -> Result<Option<RecoveryCheckpoint>>;

    /// Active checkpoints with a fresh heartbeat, ordered by priority
    /// descending then creation time ascending. Replay order after a crash.
    fn get_pending(&self) -> Result<Vec<RecoveryCheckpoint>>;

    /// Move up to `batch_size` dead-letter checkpoints back to ACTIVE with a
    /// cleared failure count. Returns the number reset.
    fn reset_dead_letters(&self, batch_size: usize) -> Result<usize>;

    /// Row counts per status.
    fn counts_by_status(&self) -> Result<JournalStats>;

    /// Switch heartbeat/complete into best-effort mode. After this, their
    /// storage failures are logged and swallowed instead of propagated, so a
    /// flaky disk cannot turn a clean shutdown into a crash loop.
    fn begin_shutdown(&self);
}

/// SQLite-backed recovery journal.
pub struct SqliteRecoveryJournal {
    conn: Arc<Mutex<Connection>>,
    clock: SteadyClock,
    staleness_window: Duration,
    shutting_down: AtomicBool,
}

impl SqliteRecoveryJournal {
    /// Open an existing journal database or create a new one.
    pub fn new<P: AsRef<Path>>(db_path: P, staleness_window: Duration) -> Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open_with_flags(
                &db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            let conn = Connection::open(&db_path)?;
            RECOVERY_JOURNAL_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new recovery journal at {:?}", db_path.as_ref());
            conn
        };

        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;

        if db_version < 0 {
            bail!(
                "Recovery journal version {} is too old, does not contain base db version {}",
                db_version,
                BASE_DB_VERSION
            );
        }
        let version = db_version as usize;

        let schema_count = RECOVERY_JOURNAL_VERSIONED_SCHEMAS.len();
        if version >= schema_count {
            bail!(
                "Recovery journal version {} is too new (max supported: {})",
                version,
                schema_count - 1
            );
        }

        RECOVERY_JOURNAL_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Self::migrate_if_needed(&conn, version)?;

        Ok(SqliteRecoveryJournal {
            conn: Arc::new(Mutex::new(conn)),
            clock: SteadyClock::new(),
            staleness_window,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Create an in-memory journal for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with_staleness(DEFAULT_STALENESS_WINDOW)
    }

    /// In-memory journal with a custom staleness window, for tests that need
    /// heartbeats to expire quickly.
    #[cfg(test)]
    pub fn in_memory_with_staleness(staleness_window: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        RECOVERY_JOURNAL_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;

        Ok(SqliteRecoveryJournal {
            conn: Arc::new(Mutex::new(conn)),
            clock: SteadyClock::new(),
            staleness_window,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Run any pending migrations.
    fn migrate_if_needed(conn: &Connection, current_version: usize) -> Result<()> {
        let target_version = RECOVERY_JOURNAL_VERSIONED_SCHEMAS.len() - 1;

        if current_version >= target_version {
            return Ok(());
        }

        info!(
            "Migrating recovery journal from version {} to {}",
            current_version, target_version
        );

        for schema in RECOVERY_JOURNAL_VERSIONED_SCHEMAS
            .iter()
            .skip(current_version + 1)
        {
            if let Some(migration_fn) = schema.migration {
                info!("Running journal migration to version {}", schema.version);
                migration_fn(conn)?;
            }
        }

        conn.execute(
            &format!(
                "PRAGMA user_version = {}",
                BASE_DB_VERSION + target_version
            ),
            [],
        )?;

        Ok(())
    }

    fn row_to_checkpoint(row: &rusqlite::Row) -> rusqlite::Result<RecoveryCheckpoint> {
        Ok(RecoveryCheckpoint {
            id: row.get("id")?,
            operation_kind: OperationKind::from_str(&row.get::<_, String>("operation_kind")?)
                .unwrap_or(OperationKind::Transfer),
            target_path: row.get("target_path")?,
            state_blob: row.get("state_blob")?,
            priority: row.get("priority")?,
            failure_count: row.get::<_, i64>("failure_count")? as u32,
            status: CheckpointStatus::from_str(&row.get::<_, String>("status")?)
                .unwrap_or(CheckpointStatus::Active),
            heartbeat_ms: row.get("heartbeat_ms")?,
            created_at: row.get("created_at")?,
        })
    }

    /// Run a mutating statement with a bounded local retry.
    ///
    /// The connection lock is released between attempts so a concurrent
    /// reader is not starved while we back off.
    fn with_write_retry<T>(
        &self,
        op_name: &str,
        f: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut delay = WRITE_RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            let result = {
                let conn = self.conn.lock().unwrap();
                f(&conn)
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt >= WRITE_RETRY_ATTEMPTS {
                        return Err(e).with_context(|| {
                            format!(
                                "Journal write '{}' failed after {} attempts",
                                op_name, WRITE_RETRY_ATTEMPTS
                            )
                        });
                    }
                    warn!(
                        "Journal write '{}' failed (attempt {}/{}), retrying in {:?}: {}",
                        op_name, attempt, WRITE_RETRY_ATTEMPTS, delay, e
                    );
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }
}

impl RecoveryJournal for SqliteRecoveryJournal {
    fn log_checkpoint(&self, checkpoint: &RecoveryCheckpoint) -> Result<String> {
        let heartbeat_ms = self.clock.now_ms();
        self.with_write_retry("log_checkpoint", |conn| {
            conn.execute(
                r#"INSERT INTO recovery_checkpoint (
                    id, operation_kind, target_path, state_blob,
                    priority, failure_count, status, heartbeat_ms, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(id) DO UPDATE SET
                    operation_kind = excluded.operation_kind,
                    target_path = excluded.target_path,
                    state_blob = excluded.state_blob,
                    priority = excluded.priority,
                    status = excluded.status,
                    heartbeat_ms = excluded.heartbeat_ms"#,
                params![
                    checkpoint.id,
                    checkpoint.operation_kind.as_str(),
                    checkpoint.target_path,
                    checkpoint.state_blob,
                    checkpoint.priority,
                    checkpoint.failure_count,
                    checkpoint.status.as_str(),
                    heartbeat_ms,
                    checkpoint.created_at,
                ],
            )?;
            Ok(())
        })?;
        Ok(checkpoint.id.clone())
    }

    fn update_heartbeat(
        &self,
        id: &str,
        new_state: &str,
        prev_bytes: u64,
        cur_bytes: u64,
    ) -> Result<()> {
        if prev_bytes == cur_bytes {
            return Ok(());
        }

        let heartbeat_ms = self.clock.now_ms();
        let result = self.with_write_retry("update_heartbeat", |conn| {
            conn.execute(
                r#"UPDATE recovery_checkpoint
                   SET state_blob = ?2, heartbeat_ms = ?3
                   WHERE id = ?1 AND status = 'ACTIVE'"#,
                params![id, new_state, heartbeat_ms],
            )?;
            Ok(())
        });

        match result {
            Ok(()) => Ok(()),
            Err(e) if self.is_shutting_down() => {
                warn!("Dropping heartbeat for {} during shutdown: {:#}", id, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn complete(&self, id: &str) -> Result<()> {
        let result = self.with_write_retry("complete", |conn| {
            conn.execute("DELETE FROM recovery_checkpoint WHERE id = ?1", params![id])?;
            Ok(())
        });

        match result {
            Ok(()) => Ok(()),
            Err(e) if self.is_shutting_down() => {
                warn!("Dropping completion for {} during shutdown: {:#}", id, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn mark_dead_letter(&self, id: &str) -> Result<()> {
        self.with_write_retry("mark_dead_letter", |conn| {
            conn.execute(
                "UPDATE recovery_checkpoint SET status = 'DEAD_LETTER' WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
    }

    fn increment_failure(&self, id: &str) -> Result<i64> {
        self.with_write_retry("increment_failure", |conn| {
            conn.execute(
                "UPDATE recovery_checkpoint SET failure_count = failure_count + 1 WHERE id = ?1",
                params![id],
            )?;
            conn.query_row(
                "SELECT failure_count FROM recovery_checkpoint WHERE id = ?1",
                params![id],
                |row| row.get::<_, i64>(0),
            )
        })
    }

    fn get_checkpoint(&self, id: &str) -> Result<Option<RecoveryCheckpoint>> {
        let conn = self.conn.lock().unwrap();
        let checkpoint = conn
            .query_row(
                "SELECT * FROM recovery_checkpoint WHERE id = ?1",
                params![id],
                Self::row_to_checkpoint,
            )
            .optional()?;
        Ok(checkpoint)
    }

    fn get_pending(&self) -> Result<Vec<RecoveryCheckpoint>> {
        let heartbeat_floor = self.clock.now_ms() - self.staleness_window.as_millis() as i64;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM recovery_checkpoint
               WHERE status = 'ACTIVE' AND heartbeat_ms >= ?1
               ORDER BY priority DESC, created_at ASC"#,
        )?;
        let checkpoints = stmt
            .query_map(params![heartbeat_floor], Self::row_to_checkpoint)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(checkpoints)
    }

    fn reset_dead_letters(&self, batch_size: usize) -> Result<usize> {
        let heartbeat_ms = self.clock.now_ms();
        self.with_write_retry("reset_dead_letters", |conn| {
            // Fresh heartbeat so the reset entries are immediately replayable
            // and a cleared failure count so they get a full retry budget.
            let affected = conn.execute(
                r#"UPDATE recovery_checkpoint
                   SET status = 'ACTIVE', failure_count = 0, heartbeat_ms = ?1
                   WHERE id IN (
                       SELECT id FROM recovery_checkpoint
                       WHERE status = 'DEAD_LETTER'
                       ORDER BY created_at ASC
                       LIMIT ?2
                   )"#,
                params![heartbeat_ms, batch_size as i64],
            )?;
            Ok(affected)
        })
    }

    fn counts_by_status(&self) -> Result<JournalStats> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM recovery_checkpoint GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stats = JournalStats::default();
        for (status, count) in rows {
            match CheckpointStatus::from_str(&status) {
                Some(CheckpointStatus::Active) => stats.active = count as usize,
                Some(CheckpointStatus::Completed) => stats.completed = count as usize,
                Some(CheckpointStatus::DeadLetter) => stats.dead_letter = count as usize,
                None => warn!("Unknown checkpoint status in journal: {}", status),
            }
        }
        Ok(stats)
    }

    fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(id: &str, priority: i32) -> RecoveryCheckpoint {
        RecoveryCheckpoint::new(
            id,
            OperationKind::Transfer,
            &format!("/downloads/{}.mp3.partial", id),
            r#"{"confirmed_bytes":0}"#.to_string(),
            priority,
        )
    }

    #[test]
    fn test_log_and_get_checkpoint() {
        let journal = SqliteRecoveryJournal::in_memory().unwrap();
        journal.log_checkpoint(&checkpoint("op-1", 2)).unwrap();

        let loaded = journal.get_checkpoint("op-1").unwrap().unwrap();
        assert_eq!(loaded.id, "op-1");
        assert_eq!(loaded.operation_kind, OperationKind::Transfer);
        assert_eq!(loaded.status, CheckpointStatus::Active);
        assert_eq!(loaded.failure_count, 0);
        assert!(loaded.heartbeat_ms > 0);
    }

    #[test]
    fn test_log_checkpoint_is_idempotent_upsert() {
        let journal = SqliteRecoveryJournal::in_memory().unwrap();

        let mut cp = checkpoint("op-1", 2);
        cp.created_at = 1000;
        journal.log_checkpoint(&cp).unwrap();

        cp.state_blob = r#"{"confirmed_bytes":4096}"#.to_string();
        cp.created_at = 9999; // must not overwrite the original insert time
        journal.log_checkpoint(&cp).unwrap();

        let stats = journal.counts_by_status().unwrap();
        assert_eq!(stats.total(), 1, "re-logging must not duplicate the row");

        let loaded = journal.get_checkpoint("op-1").unwrap().unwrap();
        assert_eq!(loaded.state_blob, r#"{"confirmed_bytes":4096}"#);
        assert_eq!(loaded.created_at, 1000);
    }

    #[test]
    fn test_heartbeat_noop_when_bytes_unchanged() {
        let journal = SqliteRecoveryJournal::in_memory().unwrap();
        journal.log_checkpoint(&checkpoint("op-1", 2)).unwrap();
        let before = journal.get_checkpoint("op-1").unwrap().unwrap();

        std::thread::sleep(Duration::from_millis(5));
        journal
            .update_heartbeat("op-1", r#"{"confirmed_bytes":500}"#, 500, 500)
            .unwrap();

        let after = journal.get_checkpoint("op-1").unwrap().unwrap();
        assert_eq!(after.heartbeat_ms, before.heartbeat_ms);
        assert_eq!(after.state_blob, before.state_blob);
    }

    #[test]
    fn test_heartbeat_refreshes_on_progress() {
        let journal = SqliteRecoveryJournal::in_memory().unwrap();
        journal.log_checkpoint(&checkpoint("op-1", 2)).unwrap();
        let before = journal.get_checkpoint("op-1").unwrap().unwrap();

        std::thread::sleep(Duration::from_millis(5));
        journal
            .update_heartbeat("op-1", r#"{"confirmed_bytes":8192}"#, 0, 8192)
            .unwrap();

        let after = journal.get_checkpoint("op-1").unwrap().unwrap();
        assert!(after.heartbeat_ms > before.heartbeat_ms);
        assert_eq!(after.state_blob, r#"{"confirmed_bytes":8192}"#);
    }

    #[test]
    fn test_complete_removes_checkpoint() {
        let journal = SqliteRecoveryJournal::in_memory().unwrap();
        journal.log_checkpoint(&checkpoint("op-1", 2)).unwrap();
        journal.complete("op-1").unwrap();

        assert!(journal.get_checkpoint("op-1").unwrap().is_none());
        assert_eq!(journal.counts_by_status().unwrap().total(), 0);
    }

    #[test]
    fn test_dead_letter_is_kept_but_never_pending() {
        let journal = SqliteRecoveryJournal::in_memory().unwrap();
        journal.log_checkpoint(&checkpoint("op-1", 2)).unwrap();
        journal.mark_dead_letter("op-1").unwrap();

        assert!(journal.get_pending().unwrap().is_empty());

        let loaded = journal.get_checkpoint("op-1").unwrap().unwrap();
        assert_eq!(loaded.status, CheckpointStatus::DeadLetter);

        let stats = journal.counts_by_status().unwrap();
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn test_increment_failure_returns_running_count() {
        let journal = SqliteRecoveryJournal::in_memory().unwrap();
        journal.log_checkpoint(&checkpoint("op-1", 2)).unwrap();

        assert_eq!(journal.increment_failure("op-1").unwrap(), 1);
        assert_eq!(journal.increment_failure("op-1").unwrap(), 2);
        assert_eq!(journal.increment_failure("op-1").unwrap(), 3);
    }

    #[test]
    fn test_get_pending_orders_by_priority_then_age() {
        let journal = SqliteRecoveryJournal::in_memory().unwrap();

        let mut old_normal = checkpoint("old-normal", 2);
        old_normal.created_at = 100;
        let mut new_normal = checkpoint("new-normal", 2);
        new_normal.created_at = 200;
        let mut urgent = checkpoint("urgent", 3);
        urgent.created_at = 300;
        let mut backfill = checkpoint("backfill", 1);
        backfill.created_at = 50;

        for cp in [&new_normal, &backfill, &urgent, &old_normal] {
            journal.log_checkpoint(cp).unwrap();
        }

        let pending = journal.get_pending().unwrap();
        let ids: Vec<&str> = pending.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["urgent", "old-normal", "new-normal", "backfill"]);
    }

    #[test]
    fn test_get_pending_skips_stale_heartbeats() {
        let journal =
            SqliteRecoveryJournal::in_memory_with_staleness(Duration::from_millis(50)).unwrap();
        journal.log_checkpoint(&checkpoint("stale", 2)).unwrap();

        std::thread::sleep(Duration::from_millis(80));
        journal.log_checkpoint(&checkpoint("fresh", 2)).unwrap();

        let pending = journal.get_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "fresh");
    }

    #[test]
    fn test_reset_dead_letters_is_bounded() {
        let journal = SqliteRecoveryJournal::in_memory().unwrap();
        for i in 0..3 {
            let mut cp = checkpoint(&format!("op-{}", i), 2);
            cp.created_at = 100 + i;
            journal.log_checkpoint(&cp).unwrap();
            journal.increment_failure(&format!("op-{}", i)).unwrap();
            journal.mark_dead_letter(&format!("op-{}", i)).unwrap();
        }

        let reset = journal.reset_dead_letters(2).unwrap();
        assert_eq!(reset, 2);

        let stats = journal.counts_by_status().unwrap();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.dead_letter, 1);

        // Oldest dead letters go first and come back with a clean slate.
        let pending = journal.get_pending().unwrap();
        let ids: Vec<&str> = pending.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["op-0", "op-1"]);
        assert!(pending.iter().all(|c| c.failure_count == 0));
    }

    #[test]
    fn test_heartbeat_for_unknown_id_is_quiet() {
        let journal = SqliteRecoveryJournal::in_memory().unwrap();
        // A worker can outlive its checkpoint by a beat during cancellation.
        journal
            .update_heartbeat("ghost", "{}", 0, 100)
            .expect("heartbeat on a missing row should not error");
    }

    #[test]
    fn test_counts_by_status_across_lifecycle() {
        let journal = SqliteRecoveryJournal::in_memory().unwrap();
        journal.log_checkpoint(&checkpoint("a", 2)).unwrap();
        journal.log_checkpoint(&checkpoint("b", 2)).unwrap();
        journal.log_checkpoint(&checkpoint("c", 2)).unwrap();
        journal.mark_dead_letter("b").unwrap();
        journal.complete("c").unwrap();

        let stats = journal.counts_by_status().unwrap();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.total(), 2);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("journal.db");

        {
            let journal =
                SqliteRecoveryJournal::new(&db_path, DEFAULT_STALENESS_WINDOW).unwrap();
            journal.log_checkpoint(&checkpoint("op-1", 3)).unwrap();
        }

        let journal = SqliteRecoveryJournal::new(&db_path, DEFAULT_STALENESS_WINDOW).unwrap();
        let pending = journal.get_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "op-1");
        assert_eq!(pending[0].priority, 3);
    }
}
