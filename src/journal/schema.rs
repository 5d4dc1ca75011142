//! Database schema for recovery_journal.db.
//!
//! Defines versioned schema migrations for the crash-recovery journal.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP};

// =============================================================================
// Recovery Checkpoint Table - Version 1
// =============================================================================

/// One row per resumable in-flight operation.
const RECOVERY_CHECKPOINT_TABLE_V1: Table = Table {
    name: "recovery_checkpoint",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("operation_kind", &SqlType::Text, non_null = true),
        sqlite_column!("target_path", &SqlType::Text, non_null = true),
        sqlite_column!("state_blob", &SqlType::Text, non_null = true),
        sqlite_column!("priority", &SqlType::Integer, non_null = true),
        sqlite_column!("failure_count", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("heartbeat_ms", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[
        // get_pending scans status + ordering in one pass
        ("idx_checkpoint_status_priority", "status, priority, created_at"),
        ("idx_checkpoint_heartbeat", "heartbeat_ms"),
    ],
    unique_constraints: &[],
};

pub const RECOVERY_JOURNAL_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[RECOVERY_CHECKPOINT_TABLE_V1],
    migration: None,
}];
