//! Track request list import.
//!
//! Requests arrive as a JSON array of [`TrackRequest`] objects, typically
//! exported from a library manager. Only `artist`, `title` and
//! `duration_secs` are required; everything else has a default.

use crate::orchestrator::TrackRequest;
use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::info;

/// Load and validate a request list from a JSON file.
pub fn load_requests(path: &Path) -> Result<Vec<TrackRequest>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request file: {:?}", path))?;
    let requests: Vec<TrackRequest> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse request file: {:?}", path))?;

    for (index, request) in requests.iter().enumerate() {
        if request.artist.trim().is_empty() || request.title.trim().is_empty() {
            bail!(
                "Request {} in {:?} is missing an artist or title",
                index,
                path
            );
        }
        if request.duration_secs == 0 {
            bail!(
                "Request {} in {:?} ('{} - {}') has no duration",
                index,
                path,
                request.artist,
                request.title
            );
        }
    }

    info!("Loaded {} track requests from {:?}", requests.len(), path);
    Ok(requests)
}
