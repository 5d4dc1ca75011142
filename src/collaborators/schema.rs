//! Database schema for projections.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Track Projection Table - Version 1
// =============================================================================

/// One row per requested track, keyed by dedupe hash. Written by the
/// persistence adapter from the event stream; read for the idempotence check.
const TRACK_PROJECTION_TABLE_V1: Table = Table {
    name: "track_projection",
    columns: &[
        sqlite_column!("dedupe_hash", &SqlType::Text, is_primary_key = true),
        sqlite_column!("artist", &SqlType::Text, non_null = true),
        sqlite_column!("title", &SqlType::Text, non_null = true),
        sqlite_column!("album", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("output_path", &SqlType::Text),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("completed_at", &SqlType::Integer),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_projection_status", "status")],
    unique_constraints: &[],
};

pub const PROJECTION_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[TRACK_PROJECTION_TABLE_V1],
    migration: None,
}];
