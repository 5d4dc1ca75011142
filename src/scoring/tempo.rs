//! Tempo extraction from candidate filenames and proximity scoring against
//! the requested BPM.
//!
//! DJ-oriented shares often carry the tempo in the filename, either marked
//! ("Track (128 bpm).mp3") or as a bare trailing number ("Track - 128.mp3").
//! The marked form is trusted fully; the bare form is a guess and its score
//! is decayed by a confidence factor.

use lazy_static::lazy_static;
use regex::Regex;

/// Confidence applied when the filename carries an explicit bpm marker.
pub const EXACT_CONFIDENCE: f64 = 1.0;
/// Confidence applied when the tempo was guessed from a bare trailing number.
pub const HEURISTIC_CONFIDENCE: f64 = 0.6;

const MIN_PLAUSIBLE_BPM: u32 = 60;
const MAX_PLAUSIBLE_BPM: u32 = 200;

lazy_static! {
    // "128bpm", "128 BPM", "(128 bpm)"
    static ref MARKED_BPM: Regex = Regex::new(r"(?i)(\d{2,3})\s*bpm").unwrap();
    // Bare number at the end of the stem: "Track - 128", "Track_128", "Track (128)"
    static ref TRAILING_NUMBER: Regex = Regex::new(r"[\s_\-\(\[](\d{2,3})[\)\]]?$").unwrap();
}

/// A tempo pulled out of a filename, with how much we trust it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractedTempo {
    pub bpm: f64,
    pub confidence: f64,
}

/// Try to read a tempo out of a candidate filename.
/// Returns `None` when nothing plausible is found.
pub fn extract_tempo(filename: &str) -> Option<ExtractedTempo> {
    let stem = match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => filename,
    };

    if let Some(caps) = MARKED_BPM.captures(stem) {
        if let Some(bpm) = plausible(&caps[1]) {
            return Some(ExtractedTempo {
                bpm,
                confidence: EXACT_CONFIDENCE,
            });
        }
    }

    if let Some(caps) = TRAILING_NUMBER.captures(stem.trim_end()) {
        if let Some(bpm) = plausible(&caps[1]) {
            return Some(ExtractedTempo {
                bpm,
                confidence: HEURISTIC_CONFIDENCE,
            });
        }
    }

    None
}

fn plausible(digits: &str) -> Option<f64> {
    let value: u32 = digits.parse().ok()?;
    if (MIN_PLAUSIBLE_BPM..=MAX_PLAUSIBLE_BPM).contains(&value) {
        Some(value as f64)
    } else {
        None
    }
}

/// Score how close a found tempo is to the expected one, in discrete bands.
/// Half-time and double-time matches earn half credit, since they often mean
/// the same track counted differently rather than a wrong track.
pub fn proximity_score(expected_bpm: f64, found_bpm: f64) -> f64 {
    let direct = band((expected_bpm - found_bpm).abs());
    let half_time = 0.5 * band((expected_bpm - found_bpm * 2.0).abs());
    let double_time = 0.5 * band((expected_bpm - found_bpm / 2.0).abs());
    direct.max(half_time).max(double_time)
}

fn band(delta: f64) -> f64 {
    if delta <= 2.0 {
        1.0
    } else if delta <= 5.0 {
        0.75
    } else if delta <= 10.0 {
        0.5
    } else if delta <= 20.0 {
        0.25
    } else {
        0.0
    }
}
