//! Network collaborator contract.
//!
//! The orchestrator talks to the peer network exclusively through this trait;
//! the production implementation relays through an HTTP daemon, tests script
//! their own.

use crate::orchestrator::CandidateFile;
use anyhow::Result;
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::AsyncSeekExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything needed to pull one remote file onto local disk.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub peer: String,
    pub remote_path: String,
    /// Partial file the payload is appended to.
    pub local_path: PathBuf,
    pub expected_size: u64,
    /// Bytes already present locally; the remote transfer starts here.
    pub start_offset: u64,
}

/// Whether the remote side granted us a slot yet.
///
/// Queued transfers are waiting on the peer and are never time-boxed;
/// only Transferring is subject to stall detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Queued,
    Transferring,
}

/// One progress message from a running transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub phase: TransferPhase,
    /// Total bytes present in the local partial file, offset included.
    pub bytes: u64,
}

/// Access to the peer-to-peer network.
#[async_trait]
pub trait NetworkCollaborator: Send + Sync {
    /// Start a search and stream back candidate batches as peers respond.
    ///
    /// The receiver closes when the search completes remotely or the cancel
    /// token fires; the caller applies its own time box on top.
    async fn search(
        &self,
        query: &str,
        format_filter: &[String],
        min_bitrate_kbps: Option<u32>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<CandidateFile>>>;

    /// Pull one file from a peer, appending to the local partial file from
    /// `start_offset`. Progress messages report the queued/transferring phase
    /// and the cumulative local byte count.
    async fn transfer(
        &self,
        request: TransferRequest,
        progress_tx: mpsc::Sender<TransferProgress>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Probe the network daemon. `Ok(true)` means reachable and logged in.
    async fn health_check(&self) -> Result<bool>;
}

/// Open a partial file for appending from `offset`, truncating any bytes
/// past it. Data beyond the confirmed offset was never acknowledged and
/// cannot be trusted after a crash.
pub(crate) async fn open_partial_at(path: &Path, offset: u64) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    file.set_len(offset).await?;
    file.seek(SeekFrom::End(0)).await?;
    Ok(file)
}
