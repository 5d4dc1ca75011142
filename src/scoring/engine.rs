//! Candidate scoring and ranking.
//!
//! Pure functions: no I/O, no shared state. Given the same candidate, target,
//! profile and tiebreaker seed the score is reproducible; only the seeded
//! tiebreaker term distinguishes otherwise identical candidates.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::similarity;
use super::tempo;
use super::weights::WeightProfile;
use crate::orchestrator::{CandidateFile, TrackRequest};

/// Bytes per second of audio per claimed kbps (1000 bits / 8).
const BYTES_PER_KBPS_SEC: f64 = 125.0;

/// Conditions component floor once every hard condition passes; soft
/// conditions fill the remaining headroom.
const HARD_PASS_BASE: f64 = 0.5;

/// A candidate together with its composite score.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub score: f64,
    pub candidate: CandidateFile,
}

/// Score a candidate against a target request. Higher is better;
/// `f64::NEG_INFINITY` means the candidate is disqualified outright.
///
/// Guard clauses run first and short-circuit: a candidate whose claimed
/// length contradicts the expected duration, or whose byte size is far too
/// small for its claimed bitrate, never reaches the weighted composite.
/// Guards are skipped when the peer did not claim the relevant attribute.
pub fn score(
    candidate: &CandidateFile,
    target: &TrackRequest,
    profile: &WeightProfile,
    seed: u64,
) -> f64 {
    if let Some(length) = candidate.length_secs {
        if length.abs_diff(target.duration_secs) > profile.duration_tolerance_secs {
            return f64::NEG_INFINITY;
        }
    }

    if let (Some(bitrate), Some(length)) = (candidate.bitrate_kbps, candidate.length_secs) {
        if bitrate > 0 && length > 0 {
            let expected_bytes = bitrate as f64 * BYTES_PER_KBPS_SEC * length as f64;
            let adjusted_bytes =
                candidate.size_bytes.saturating_sub(profile.artwork_allowance_bytes) as f64;
            let ratio = adjusted_bytes / expected_bytes;
            // Lossless rips of quiet material compress well below their
            // nominal bitrate, so a high claimed bitrate earns a looser floor.
            let lossless_exception = bitrate >= profile.lossless_bitrate_gate_kbps
                && ratio >= profile.lossless_efficiency_floor;
            if ratio < profile.efficiency_reject_below && !lossless_exception {
                return f64::NEG_INFINITY;
            }
        }
    }

    profile.w_availability * availability_score(candidate, profile)
        + profile.w_conditions * conditions_score(candidate, target, profile)
        + profile.w_tempo * tempo_score(candidate, target)
        + profile.w_duration * duration_score(candidate, target)
        + profile.w_bitrate * bitrate_score(candidate)
        + profile.w_similarity * similarity::request_similarity(candidate, target)
        + profile.w_tiebreak * tiebreaker(candidate, seed)
}

/// Score every candidate, drop the disqualified ones, sort best first.
pub fn rank(
    candidates: &[CandidateFile],
    target: &TrackRequest,
    profile: &WeightProfile,
    seed: u64,
) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = candidates
        .iter()
        .map(|candidate| ScoredCandidate {
            score: score(candidate, target, profile, seed),
            candidate: candidate.clone(),
        })
        .filter(|s| s.score > f64::NEG_INFINITY)
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

/// Pick the candidate to download from a ranked list.
///
/// The top-ranked candidate wins when it clears the profile's confidence
/// threshold. Below it, none of the metadata is trusted enough to
/// discriminate, so fall back to the highest claimed bitrate among the
/// survivors.
pub fn select_candidate(
    ranked: &[ScoredCandidate],
    profile: &WeightProfile,
) -> Option<CandidateFile> {
    let best = ranked.first()?;
    if best.score >= profile.min_confidence {
        return Some(best.candidate.clone());
    }
    ranked
        .iter()
        .max_by_key(|s| s.candidate.bitrate_kbps.unwrap_or(0))
        .map(|s| s.candidate.clone())
}

// === Components, each in [0, 1] ===

fn availability_score(candidate: &CandidateFile, profile: &WeightProfile) -> f64 {
    if candidate.has_free_slot {
        1.0
    } else {
        (profile.no_slot_base - candidate.queue_depth as f64 * profile.queue_position_penalty)
            .max(0.0)
    }
}

fn conditions_score(candidate: &CandidateFile, target: &TrackRequest, profile: &WeightProfile) -> f64 {
    let extension = candidate.extension();
    let format_ok = profile.accepted_formats.contains(&extension.as_str());
    let bitrate_ok = candidate
        .bitrate_kbps
        .map_or(true, |b| b >= profile.hard_min_bitrate_kbps);
    if !format_ok || !bitrate_ok {
        return 0.0;
    }

    let mut met = 0u32;
    let mut total = 0u32;

    total += 1;
    if profile.preferred_formats.contains(&extension.as_str()) {
        met += 1;
    }

    total += 1;
    if candidate.bitrate_kbps.map_or(false, |b| b >= profile.preferred_min_bitrate_kbps) {
        met += 1;
    }

    // Sibling heuristic: a directory naming the artist or album suggests a
    // full rip rather than a stray file.
    total += 1;
    if directory_mentions_release(candidate, target) {
        met += 1;
    }

    HARD_PASS_BASE + (1.0 - HARD_PASS_BASE) * met as f64 / total as f64
}

fn directory_mentions_release(candidate: &CandidateFile, target: &TrackRequest) -> bool {
    let directory = similarity::normalize(candidate.directory());
    if directory.is_empty() {
        return false;
    }
    let artist = similarity::normalize(&target.artist);
    if !artist.is_empty() && directory.contains(&artist) {
        return true;
    }
    match &target.album {
        Some(album) => {
            let album = similarity::normalize(album);
            !album.is_empty() && directory.contains(&album)
        }
        None => false,
    }
}

fn tempo_score(candidate: &CandidateFile, target: &TrackRequest) -> f64 {
    let expected = match target.tempo_bpm {
        Some(bpm) => bpm,
        None => return 0.0,
    };
    match tempo::extract_tempo(candidate.filename()) {
        Some(found) => tempo::proximity_score(expected, found.bpm) * found.confidence,
        None => 0.0,
    }
}

fn duration_score(candidate: &CandidateFile, target: &TrackRequest) -> f64 {
    let length = match candidate.length_secs {
        Some(length) => length,
        None => return 0.0,
    };
    match length.abs_diff(target.duration_secs) {
        0..=2 => 1.0,
        3..=5 => 0.8,
        6..=10 => 0.5,
        11..=15 => 0.25,
        _ => 0.0,
    }
}

fn bitrate_score(candidate: &CandidateFile) -> f64 {
    match candidate.bitrate_kbps {
        Some(b) if b >= 320 => 1.0,
        Some(b) if b >= 256 => 0.8,
        Some(b) if b >= 192 => 0.5,
        Some(_) => 0.2,
        None => 0.0,
    }
}

/// Deterministic per-candidate jitter in [0, 1): the same candidate and seed
/// always produce the same value, different candidates diverge.
fn tiebreaker(candidate: &CandidateFile, seed: u64) -> f64 {
    let mut hasher = DefaultHasher::new();
    candidate.peer.hash(&mut hasher);
    candidate.remote_path.hash(&mut hasher);
    let mut rng = StdRng::seed_from_u64(seed ^ hasher.finish());
    rng.random_range(0.0..1.0)
}
