//! HTTP client for the external peer-network daemon.
//!
//! The daemon owns the actual peer protocol; this client drives it over a
//! small REST surface: create a search and poll its responses, enqueue a
//! download and poll until a slot opens, then pull the payload as a ranged
//! byte stream.

use super::network::{
    open_partial_at, NetworkCollaborator, TransferPhase, TransferProgress, TransferRequest,
};
use crate::orchestrator::CandidateFile;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// HTTP client for communicating with the peer-network daemon.
#[derive(Clone)]
pub struct HttpNetworkClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    /// Timeout for control calls; the payload stream is not time-boxed.
    control_timeout: Duration,
    poll_interval: Duration,
}

impl HttpNetworkClient {
    /// Create a new daemon client.
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the daemon (e.g., "http://localhost:5030")
    /// * `token` - Optional bearer token for authenticated daemons
    pub fn new(base_url: String, token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("Failed to create HTTP client");

        // Ensure base_url doesn't have trailing slash
        let base_url = base_url.trim_end_matches('/').to_string();

        Self {
            client,
            base_url,
            token,
            control_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.authorized(self.client.get(url).timeout(self.control_timeout))
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.authorized(self.client.post(url).timeout(self.control_timeout))
    }

    fn delete(&self, url: &str) -> reqwest::RequestBuilder {
        self.authorized(self.client.delete(url).timeout(self.control_timeout))
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn create_search(&self, query: &str) -> Result<String> {
        let url = format!("{}/api/v0/searches", self.base_url);
        let response = self
            .post_json(&url, &CreateSearchBody { query })
            .await
            .context("Failed to start search on daemon")?;
        let created: SearchCreated = response
            .json()
            .await
            .context("Failed to parse search creation response")?;
        Ok(created.id)
    }

    async fn post_json<B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let response = self.post(url).json(body).send().await?;
        if !response.status().is_success() {
            bail!("Daemon returned status {}", response.status());
        }
        Ok(response)
    }

    async fn fetch_search_responses(&self, search_id: &str) -> Result<Vec<SearchResponseDto>> {
        let url = format!("{}/api/v0/searches/{}/responses", self.base_url, search_id);
        let response = self
            .get(&url)
            .send()
            .await
            .context("Failed to fetch search responses")?;
        if !response.status().is_success() {
            bail!("Search responses returned status {}", response.status());
        }
        response
            .json()
            .await
            .context("Failed to parse search responses")
    }

    async fn search_is_complete(&self, search_id: &str) -> Result<bool> {
        let url = format!("{}/api/v0/searches/{}", self.base_url, search_id);
        let response = self
            .get(&url)
            .send()
            .await
            .context("Failed to fetch search state")?;
        if !response.status().is_success() {
            bail!("Search state returned status {}", response.status());
        }
        let state: SearchStateDto = response
            .json()
            .await
            .context("Failed to parse search state")?;
        Ok(state.state.eq_ignore_ascii_case("completed"))
    }

    /// Poll a search and forward newly seen candidates until the search
    /// completes, the receiver goes away, or the token fires.
    async fn poll_search(
        self,
        search_id: String,
        format_filter: Vec<String>,
        min_bitrate_kbps: Option<u32>,
        tx: mpsc::Sender<Vec<CandidateFile>>,
        cancel: CancellationToken,
    ) {
        let mut seen: HashSet<(String, String)> = HashSet::new();

        loop {
            match self.fetch_search_responses(&search_id).await {
                Ok(responses) => {
                    let mut fresh = Vec::new();
                    for response in responses {
                        for candidate in
                            to_candidates(&response, &format_filter, min_bitrate_kbps)
                        {
                            let key = (candidate.peer.clone(), candidate.remote_path.clone());
                            if seen.insert(key) {
                                fresh.push(candidate);
                            }
                        }
                    }
                    if !fresh.is_empty() && tx.send(fresh).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Search {} poll failed: {:#}", search_id, e);
                    break;
                }
            }

            match self.search_is_complete(&search_id).await {
                Ok(true) => {
                    debug!("Search {} completed with {} candidates", search_id, seen.len());
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Search {} state poll failed: {:#}", search_id, e);
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => break,
                _ = tx.closed() => break,
            }
        }

        let url = format!("{}/api/v0/searches/{}", self.base_url, search_id);
        if let Err(e) = self.delete(&url).send().await {
            debug!("Search {} cleanup failed: {}", search_id, e);
        }
    }

    async fn enqueue_download(&self, request: &TransferRequest) -> Result<String> {
        let url = format!("{}/api/v0/transfers/downloads", self.base_url);
        let body = CreateDownloadBody {
            peer: &request.peer,
            remote_path: &request.remote_path,
            start_offset: request.start_offset,
        };
        let response = self
            .post_json(&url, &body)
            .await
            .with_context(|| format!("Failed to enqueue download from {}", request.peer))?;
        let created: DownloadCreated = response
            .json()
            .await
            .context("Failed to parse download creation response")?;
        Ok(created.id)
    }

    async fn fetch_download_state(&self, download_id: &str) -> Result<DownloadStateDto> {
        let url = format!("{}/api/v0/transfers/downloads/{}", self.base_url, download_id);
        let response = self
            .get(&url)
            .send()
            .await
            .context("Failed to fetch download state")?;
        if !response.status().is_success() {
            bail!("Download state returned status {}", response.status());
        }
        response
            .json()
            .await
            .context("Failed to parse download state")
    }

    async fn abandon_download(&self, download_id: &str) {
        let url = format!("{}/api/v0/transfers/downloads/{}", self.base_url, download_id);
        if let Err(e) = self.delete(&url).send().await {
            debug!("Download {} cleanup failed: {}", download_id, e);
        }
    }

    /// Wait for the daemon to be granted a transfer slot by the peer.
    async fn await_slot(
        &self,
        download_id: &str,
        progress_tx: &mpsc::Sender<TransferProgress>,
        start_offset: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let state = self.fetch_download_state(download_id).await?;
            match state.state.to_ascii_uppercase().as_str() {
                "READY" => return Ok(()),
                "QUEUED" => {
                    if let Some(position) = state.queue_position {
                        debug!("Download {} queued at position {}", download_id, position);
                    }
                    if progress_tx
                        .send(TransferProgress {
                            phase: TransferPhase::Queued,
                            bytes: start_offset,
                        })
                        .await
                        .is_err()
                    {
                        bail!("transfer abandoned");
                    }
                }
                "ERRORED" => bail!(
                    "Peer rejected download: {}",
                    state.error.unwrap_or_else(|| "unknown error".to_string())
                ),
                other => bail!("Daemon reported unexpected download state '{}'", other),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {
                    self.abandon_download(download_id).await;
                    bail!("transfer cancelled");
                }
            }
        }
    }

    /// Stream the payload into the local partial file from `start_offset`.
    async fn stream_payload(
        &self,
        download_id: &str,
        request: &TransferRequest,
        progress_tx: &mpsc::Sender<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut file = open_partial_at(&request.local_path, request.start_offset)
            .await
            .with_context(|| {
                format!("Failed to open partial file {:?}", request.local_path)
            })?;

        let url = format!(
            "{}/api/v0/transfers/downloads/{}/stream",
            self.base_url, download_id
        );
        let response = self
            .authorized(self.client.get(&url))
            .header("Range", format!("bytes={}-", request.start_offset))
            .send()
            .await
            .context("Failed to open payload stream")?;
        if !response.status().is_success() {
            bail!("Payload stream returned status {}", response.status());
        }

        let mut stream = response.bytes_stream();
        let mut written = request.start_offset;
        let mut last_report = Instant::now();

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                self.abandon_download(download_id).await;
                bail!("transfer cancelled");
            }
            let chunk = chunk.context("Payload stream broke mid-transfer")?;
            file.write_all(&chunk)
                .await
                .context("Failed to write payload chunk")?;
            written += chunk.len() as u64;

            if last_report.elapsed() >= PROGRESS_INTERVAL {
                last_report = Instant::now();
                if progress_tx
                    .send(TransferProgress {
                        phase: TransferPhase::Transferring,
                        bytes: written,
                    })
                    .await
                    .is_err()
                {
                    bail!("transfer abandoned");
                }
            }
        }

        file.flush().await.context("Failed to flush partial file")?;

        let _ = progress_tx
            .send(TransferProgress {
                phase: TransferPhase::Transferring,
                bytes: written,
            })
            .await;
        Ok(())
    }

    /// Get the base URL of the daemon.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl NetworkCollaborator for HttpNetworkClient {
    async fn search(
        &self,
        query: &str,
        format_filter: &[String],
        min_bitrate_kbps: Option<u32>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<CandidateFile>>> {
        let search_id = self.create_search(query).await?;
        debug!("Search {} started for '{}'", search_id, query);

        let (tx, rx) = mpsc::channel(8);
        let poller = self.clone();
        let formats = format_filter.to_vec();
        tokio::spawn(async move {
            poller
                .poll_search(search_id, formats, min_bitrate_kbps, tx, cancel)
                .await;
        });

        Ok(rx)
    }

    async fn transfer(
        &self,
        request: TransferRequest,
        progress_tx: mpsc::Sender<TransferProgress>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let download_id = self.enqueue_download(&request).await?;
        debug!(
            "Download {} enqueued: {} from {} at offset {}",
            download_id, request.remote_path, request.peer, request.start_offset
        );

        self.await_slot(&download_id, &progress_tx, request.start_offset, &cancel)
            .await?;
        self.stream_payload(&download_id, &request, &progress_tx, &cancel)
            .await
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .get(&url)
            .send()
            .await
            .context("Failed to connect to peer-network daemon")?;
        Ok(response.status().is_success())
    }
}

/// Convert one peer response into candidates, applying the coarse format
/// and bitrate filters. Files with no claimed bitrate pass through; ranking
/// judges them later.
fn to_candidates(
    response: &SearchResponseDto,
    format_filter: &[String],
    min_bitrate_kbps: Option<u32>,
) -> Vec<CandidateFile> {
    response
        .files
        .iter()
        .filter(|file| {
            if format_filter.is_empty() {
                return true;
            }
            let extension = file
                .filename
                .rsplit('.')
                .next()
                .unwrap_or("")
                .to_lowercase();
            format_filter.iter().any(|f| f.eq_ignore_ascii_case(&extension))
        })
        .filter(|file| match (min_bitrate_kbps, file.bit_rate) {
            (Some(min), Some(rate)) => rate >= min,
            _ => true,
        })
        .map(|file| {
            let mut candidate =
                CandidateFile::new(&response.username, &file.filename, file.size);
            candidate.bitrate_kbps = file.bit_rate;
            candidate.length_secs = file.length;
            candidate.with_availability(response.has_free_upload_slot, response.queue_length)
        })
        .collect()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSearchBody<'a> {
    query: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchCreated {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchStateDto {
    state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponseDto {
    username: String,
    #[serde(default)]
    has_free_upload_slot: bool,
    #[serde(default)]
    queue_length: u32,
    #[serde(default)]
    files: Vec<RemoteFileDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteFileDto {
    filename: String,
    size: u64,
    #[serde(default)]
    bit_rate: Option<u32>,
    #[serde(default)]
    length: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateDownloadBody<'a> {
    peer: &'a str,
    remote_path: &'a str,
    start_offset: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadCreated {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadStateDto {
    state: String,
    #[serde(default)]
    queue_position: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}
