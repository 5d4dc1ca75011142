//! External collaborators of the download orchestrator.
//!
//! Everything the orchestrator needs from the outside world lives behind a
//! trait here: the peer network, the tag writer, the read-model projection.
//! Production wiring plugs in the HTTP daemon client and SQLite stores;
//! tests plug in their own.

mod http_network;
mod import;
mod network;
mod projection;
mod schema;
mod tags;

use crate::journal::RecoveryJournal;
use std::sync::Arc;

/// The full collaborator set the orchestrator is wired with.
pub struct Collaborators {
    pub network: Arc<dyn NetworkCollaborator>,
    pub journal: Arc<dyn RecoveryJournal>,
    pub projections: Arc<dyn ProjectionStore>,
    pub tags: Arc<dyn TagWriter>,
}

pub use http_network::HttpNetworkClient;
pub use import::load_requests;
pub use network::{NetworkCollaborator, TransferPhase, TransferProgress, TransferRequest};
pub use projection::{
    spawn_projection_adapter, ProjectionStore, SqliteProjectionStore, TrackProjection,
};
pub use schema::PROJECTION_VERSIONED_SCHEMAS;
pub use tags::{LoggingTagWriter, TagWriter};
