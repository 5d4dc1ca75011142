//! Metadata tagging collaborator.

use crate::orchestrator::TrackRequest;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

/// Writes embedded metadata into a finalized audio file.
///
/// Tag failures are logged and non-fatal: a download with bad tags is still
/// a download.
#[async_trait]
pub trait TagWriter: Send + Sync {
    async fn write_tags(&self, path: &Path, request: &TrackRequest) -> Result<()>;
}

/// Default implementation that only logs what it would write.
///
/// Real tagging depends on external tooling; until that is wired in, the
/// pipeline still exercises the full finalize sequence through this.
pub struct LoggingTagWriter;

#[async_trait]
impl TagWriter for LoggingTagWriter {
    async fn write_tags(&self, path: &Path, request: &TrackRequest) -> Result<()> {
        debug!(
            "Would tag {:?} with artist={:?} title={:?} album={:?}",
            path, request.artist, request.title, request.album
        );
        Ok(())
    }
}
