//! Job projection storage and the persistence adapter.
//!
//! The orchestrator never writes here directly: a small adapter task consumes
//! the broadcast event stream and folds it into one row per track, keyed by
//! dedupe hash. The row survives restarts and answers "did we already fetch
//! this track" for the idempotence check.

use super::schema::PROJECTION_VERSIONED_SCHEMAS;
use crate::orchestrator::{DownloadEvent, JobState};
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Durable summary of one requested track.
#[derive(Debug, Clone)]
pub struct TrackProjection {
    pub dedupe_hash: String,
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
    pub status: JobState,
    pub output_path: Option<String>,
    pub error_message: Option<String>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

/// Trait for projection storage operations.
pub trait ProjectionStore: Send + Sync {
    /// Insert or replace the projection for a track.
    fn upsert(&self, projection: &TrackProjection) -> Result<()>;

    /// Look up a track by its dedupe hash.
    fn find(&self, dedupe_hash: &str) -> Result<Option<TrackProjection>>;

    /// Most recently updated projections, newest first.
    fn list_recent(&self, limit: usize) -> Result<Vec<TrackProjection>>;

    /// Number of rows in a given status.
    fn count_by_status(&self, status: JobState) -> Result<usize>;
}

/// SQLite-backed projection store.
pub struct SqliteProjectionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProjectionStore {
    /// Open an existing projection database or create a new one.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open_with_flags(
                &db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            let conn = Connection::open(&db_path)?;
            PROJECTION_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new projection database at {:?}", db_path.as_ref());
            conn
        };

        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;

        if db_version < 0 {
            bail!(
                "Projection database version {} is too old, does not contain base db version {}",
                db_version,
                BASE_DB_VERSION
            );
        }
        let version = db_version as usize;

        let schema_count = PROJECTION_VERSIONED_SCHEMAS.len();
        if version >= schema_count {
            bail!(
                "Projection database version {} is too new (max supported: {})",
                version,
                schema_count - 1
            );
        }

        PROJECTION_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Self::migrate_if_needed(&conn, version)?;

        Ok(SqliteProjectionStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        PROJECTION_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;

        Ok(SqliteProjectionStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate_if_needed(conn: &Connection, current_version: usize) -> Result<()> {
        let target_version = PROJECTION_VERSIONED_SCHEMAS.len() - 1;

        if current_version >= target_version {
            return Ok(());
        }

        info!(
            "Migrating projection database from version {} to {}",
            current_version, target_version
        );

        for schema in PROJECTION_VERSIONED_SCHEMAS
            .iter()
            .skip(current_version + 1)
        {
            if let Some(migration_fn) = schema.migration {
                info!("Running projection migration to version {}", schema.version);
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

    fn row_to_projection(row: &rusqlite::Row) -> rusqlite::Result<TrackProjection> {
        Ok(TrackProjection {
            dedupe_hash: row.get("dedupe_hash")?,
            artist: row.get("artist")?,
            title: row.get("title")?,
            album: row.get("album")?,
            status: JobState::from_str(&row.get::<_, String>("status")?)
                .unwrap_or(JobState::Pending),
            output_path: row.get("output_path")?,
            error_message: row.get("error_message")?,
            completed_at: row.get("completed_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl ProjectionStore for SqliteProjectionStore {
    fn upsert(&self, projection: &TrackProjection) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO track_projection (
                dedupe_hash, artist, title, album, status,
                output_path, error_message, completed_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(dedupe_hash) DO UPDATE SET
                artist = excluded.artist,
                title = excluded.title,
                album = excluded.album,
                status = excluded.status,
                output_path = excluded.output_path,
                error_message = excluded.error_message,
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at"#,
            params![
                projection.dedupe_hash,
                projection.artist,
                projection.title,
                projection.album,
                projection.status.as_str(),
                projection.output_path,
                projection.error_message,
                projection.completed_at,
                projection.updated_at,
            ],
        )?;
        Ok(())
    }

    fn find(&self, dedupe_hash: &str) -> Result<Option<TrackProjection>> {
        let conn = self.conn.lock().unwrap();
        let projection = conn
            .query_row(
                "SELECT * FROM track_projection WHERE dedupe_hash = ?1",
                params![dedupe_hash],
                Self::row_to_projection,
            )
            .optional()?;
        Ok(projection)
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<TrackProjection>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM track_projection ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let projections = stmt
            .query_map(params![limit as i64], Self::row_to_projection)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projections)
    }

    fn count_by_status(&self, status: JobState) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM track_projection WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Spawn the persistence adapter: consumes orchestrator events and keeps the
/// projection store current. Exits when the event channel closes.
pub fn spawn_projection_adapter(
    store: Arc<dyn ProjectionStore>,
    mut events: broadcast::Receiver<DownloadEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = apply_event(store.as_ref(), &event) {
                        warn!(
                            "Failed to project event for {}: {:#}",
                            event.dedupe_hash(),
                            e
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // The store converges on the next event per track, so a
                    // lag only ever loses intermediate states.
                    warn!("Projection adapter lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event stream closed, projection adapter stopping");
                    break;
                }
            }
        }
    })
}

fn apply_event(store: &dyn ProjectionStore, event: &DownloadEvent) -> Result<()> {
    match event {
        DownloadEvent::Queued {
            dedupe_hash,
            artist,
            title,
            album,
            ..
        } => store.upsert(&TrackProjection {
            dedupe_hash: dedupe_hash.clone(),
            artist: artist.clone(),
            title: title.clone(),
            album: album.clone(),
            status: JobState::Pending,
            output_path: None,
            error_message: None,
            completed_at: None,
            updated_at: now(),
        }),
        DownloadEvent::StateChanged {
            dedupe_hash, state, ..
        } => {
            let Some(mut projection) = store.find(dedupe_hash)? else {
                debug!("No projection for {} yet, skipping update", dedupe_hash);
                return Ok(());
            };
            projection.status = *state;
            if !state.is_terminal() {
                projection.error_message = None;
            }
            projection.updated_at = now();
            store.upsert(&projection)
        }
        DownloadEvent::Completed {
            dedupe_hash,
            output_path,
            ..
        } => {
            let mut projection = store.find(dedupe_hash)?.unwrap_or_else(|| TrackProjection {
                dedupe_hash: dedupe_hash.clone(),
                artist: String::new(),
                title: String::new(),
                album: None,
                status: JobState::Completed,
                output_path: None,
                error_message: None,
                completed_at: None,
                updated_at: 0,
            });
            projection.status = JobState::Completed;
            projection.output_path = Some(output_path.to_string_lossy().into_owned());
            projection.error_message = None;
            projection.completed_at = Some(now());
            projection.updated_at = now();
            store.upsert(&projection)
        }
        DownloadEvent::Failed {
            dedupe_hash,
            kind,
            message,
            ..
        } => {
            let Some(mut projection) = store.find(dedupe_hash)? else {
                debug!("No projection for {} yet, skipping failure", dedupe_hash);
                return Ok(());
            };
            projection.status = JobState::Failed;
            projection.error_message = Some(format!("{}: {}", kind.as_str(), message));
            projection.updated_at = now();
            store.upsert(&projection)
        }
    }
}
