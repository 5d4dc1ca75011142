//! Scriptable in-memory peer network
//!
//! Implements `NetworkCollaborator` entirely in memory: searches return
//! scripted candidate batches and transfers write a deterministic payload to
//! the real partial file, so resume offsets and final file contents can be
//! checked byte for byte.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use soulfetch::collaborators::{
    NetworkCollaborator, TransferPhase, TransferProgress, TransferRequest,
};
use soulfetch::orchestrator::CandidateFile;
use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How a scripted transfer behaves.
#[derive(Debug, Clone)]
pub enum TransferScript {
    /// Deliver the whole payload in `chunks` pieces, `chunk_delay` apart.
    Success { chunks: u64, chunk_delay: Duration },
    /// Deliver `bytes`, then go silent until cancelled.
    StallAfter { bytes: u64 },
    /// Report the queued phase forever, never start transferring.
    QueueForever,
    /// Deliver a full-size payload that is recognizably not audio.
    CorruptPayload,
    /// Fail outright before any bytes move.
    Fail { message: String },
}

impl TransferScript {
    /// Finishes in roughly 20ms; the default when nothing is scripted.
    pub fn quick() -> Self {
        TransferScript::Success {
            chunks: 4,
            chunk_delay: Duration::from_millis(5),
        }
    }

    /// Takes around a second, slow enough to pause or cancel mid-flight.
    pub fn slow() -> Self {
        TransferScript::Success {
            chunks: 24,
            chunk_delay: Duration::from_millis(40),
        }
    }
}

/// In-memory `NetworkCollaborator` scripted per test.
///
/// Each `search` call pops one scripted response (a list of batches) in FIFO
/// order, falling back to the default result set. Each `transfer` pops one
/// script for the requesting peer, falling back to that peer's default and
/// then to [`TransferScript::quick`]. Every call is logged for assertions.
pub struct MockNetwork {
    search_scripts: Mutex<VecDeque<Vec<Vec<CandidateFile>>>>,
    default_results: Mutex<Vec<CandidateFile>>,
    transfer_scripts: Mutex<HashMap<String, VecDeque<TransferScript>>>,
    default_transfer_scripts: Mutex<HashMap<String, TransferScript>>,
    search_log: Mutex<Vec<String>>,
    transfer_log: Mutex<Vec<TransferRequest>>,
    healthy: AtomicBool,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            search_scripts: Mutex::new(VecDeque::new()),
            default_results: Mutex::new(Vec::new()),
            transfer_scripts: Mutex::new(HashMap::new()),
            default_transfer_scripts: Mutex::new(HashMap::new()),
            search_log: Mutex::new(Vec::new()),
            transfer_log: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
        }
    }

    /// Results served by every search that has no script queued.
    pub fn set_default_results(&self, results: Vec<CandidateFile>) {
        *self.default_results.lock().unwrap() = results;
    }

    /// Script the next unscripted search: its batches arrive in order, then
    /// the stream closes.
    pub fn push_search(&self, batches: Vec<Vec<CandidateFile>>) {
        self.search_scripts.lock().unwrap().push_back(batches);
    }

    /// Script the next transfer from `peer`; scripts queue up FIFO.
    pub fn script_transfer(&self, peer: &str, script: TransferScript) {
        self.transfer_scripts
            .lock()
            .unwrap()
            .entry(peer.to_string())
            .or_default()
            .push_back(script);
    }

    /// Script every transfer from `peer` that has nothing queued.
    pub fn set_default_transfer(&self, peer: &str, script: TransferScript) {
        self.default_transfer_scripts
            .lock()
            .unwrap()
            .insert(peer.to_string(), script);
    }

    pub fn searches(&self) -> Vec<String> {
        self.search_log.lock().unwrap().clone()
    }

    pub fn transfers(&self) -> Vec<TransferRequest> {
        self.transfer_log.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    fn next_script(&self, peer: &str) -> TransferScript {
        if let Some(script) = self
            .transfer_scripts
            .lock()
            .unwrap()
            .get_mut(peer)
            .and_then(|queue| queue.pop_front())
        {
            return script;
        }
        self.default_transfer_scripts
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .unwrap_or_else(TransferScript::quick)
    }
}

#[async_trait]
impl NetworkCollaborator for MockNetwork {
    async fn search(
        &self,
        query: &str,
        _format_filter: &[String],
        _min_bitrate_kbps: Option<u32>,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<CandidateFile>>> {
        self.search_log.lock().unwrap().push(query.to_string());

        let batches = match self.search_scripts.lock().unwrap().pop_front() {
            Some(batches) => batches,
            None => vec![self.default_results.lock().unwrap().clone()],
        };

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for batch in batches {
                if tx.send(batch).await.is_err() {
                    return;
                }
            }
            // Dropping the sender closes the stream, ending the search early.
        });
        Ok(rx)
    }

    async fn transfer(
        &self,
        request: TransferRequest,
        progress_tx: mpsc::Sender<TransferProgress>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.transfer_log.lock().unwrap().push(request.clone());
        let script = self.next_script(&request.peer);

        match script {
            TransferScript::Fail { message } => Err(anyhow!(message)),
            TransferScript::QueueForever => loop {
                let progress = TransferProgress {
                    phase: TransferPhase::Queued,
                    bytes: request.start_offset,
                };
                if progress_tx.send(progress).await.is_err() {
                    return Ok(());
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                    _ = cancel.cancelled() => return Err(anyhow!("transfer cancelled")),
                }
            },
            TransferScript::StallAfter { bytes } => {
                let remaining = request.expected_size.saturating_sub(request.start_offset);
                write_payload(
                    &request,
                    bytes.min(remaining),
                    4,
                    Duration::from_millis(2),
                    &progress_tx,
                    &cancel,
                    payload_byte,
                )
                .await?;
                cancel.cancelled().await;
                Err(anyhow!("transfer cancelled"))
            }
            TransferScript::CorruptPayload => {
                let remaining = request.expected_size.saturating_sub(request.start_offset);
                write_payload(
                    &request,
                    remaining,
                    4,
                    Duration::from_millis(2),
                    &progress_tx,
                    &cancel,
                    corrupt_byte,
                )
                .await
            }
            TransferScript::Success { chunks, chunk_delay } => {
                let remaining = request.expected_size.saturating_sub(request.start_offset);
                write_payload(
                    &request,
                    remaining,
                    chunks,
                    chunk_delay,
                    &progress_tx,
                    &cancel,
                    payload_byte,
                )
                .await
            }
        }
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.healthy.load(Ordering::Relaxed))
    }
}

/// Byte `index` of the canonical payload: an MP3-looking header then a
/// rolling pattern, so a resumed file can be verified byte for byte.
pub fn payload_byte(index: u64) -> u8 {
    const HEADER: &[u8] = b"ID3\x04\x00\x00\x00\x00\x00\x00";
    if (index as usize) < HEADER.len() {
        HEADER[index as usize]
    } else {
        (index % 251) as u8
    }
}

/// The full canonical payload for a file of `size` bytes.
pub fn expected_payload(size: u64) -> Vec<u8> {
    (0..size).map(payload_byte).collect()
}

/// A payload that is the right size but visibly a PDF, not audio.
fn corrupt_byte(index: u64) -> u8 {
    const HEADER: &[u8] = b"%PDF-1.4\n";
    if (index as usize) < HEADER.len() {
        HEADER[index as usize]
    } else {
        b'x'
    }
}

/// Append `total` bytes of generated content to the partial file from the
/// request's start offset, mirroring what the real client does: truncate to
/// the offset, then write and report cumulative progress per chunk.
async fn write_payload(
    request: &TransferRequest,
    total: u64,
    chunks: u64,
    chunk_delay: Duration,
    progress_tx: &mpsc::Sender<TransferProgress>,
    cancel: &CancellationToken,
    content: fn(u64) -> u8,
) -> Result<()> {
    if let Some(parent) = request.local_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&request.local_path)
        .await?;
    file.set_len(request.start_offset).await?;
    file.seek(SeekFrom::End(0)).await?;

    let end = request.start_offset + total;
    let chunk_size = (total / chunks.max(1)).max(1);
    let mut written = request.start_offset;

    while written < end {
        if cancel.is_cancelled() {
            return Err(anyhow!("transfer cancelled"));
        }
        let next = (written + chunk_size).min(end);
        let chunk: Vec<u8> = (written..next).map(content).collect();
        file.write_all(&chunk).await?;
        file.flush().await?;
        written = next;

        let progress = TransferProgress {
            phase: TransferPhase::Transferring,
            bytes: written,
        };
        let _ = progress_tx.send(progress).await;

        if written < end {
            tokio::time::sleep(chunk_delay).await;
        }
    }

    Ok(())
}
