//! Named weight profiles for candidate ranking.
//!
//! A profile bundles every coefficient the scorer uses, so ranking behavior
//! can be swapped at runtime by name without touching the scoring function
//! itself. The guard thresholds live here too; they are tunables, not
//! constants baked into the engine.

/// All coefficients and thresholds used by candidate scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightProfile {
    pub name: &'static str,

    // Guard thresholds.
    /// Reject candidates whose claimed length deviates from the expected
    /// duration by more than this many seconds.
    pub duration_tolerance_secs: u32,
    /// Bytes subtracted from the candidate size before the efficiency check,
    /// covering embedded artwork.
    pub artwork_allowance_bytes: u64,
    /// Reject when actual-to-expected byte ratio falls below this.
    pub efficiency_reject_below: f64,
    /// Looser ratio floor for the high-bitrate exception band.
    pub lossless_efficiency_floor: f64,
    /// Claimed bitrate at or above this opts into the exception band.
    pub lossless_bitrate_gate_kbps: u32,

    // Hard conditions. A candidate failing one scores zero on the whole
    // conditions component.
    pub accepted_formats: &'static [&'static str],
    pub hard_min_bitrate_kbps: u32,

    // Soft conditions, each worth a share of the conditions bonus.
    pub preferred_formats: &'static [&'static str],
    pub preferred_min_bitrate_kbps: u32,

    // Availability shape.
    /// Component value for a peer with no free slot and nobody queued.
    pub no_slot_base: f64,
    /// Linear penalty per queued position ahead of us.
    pub queue_position_penalty: f64,

    // Component weights.
    pub w_availability: f64,
    pub w_conditions: f64,
    pub w_tempo: f64,
    pub w_duration: f64,
    pub w_bitrate: f64,
    pub w_similarity: f64,
    pub w_tiebreak: f64,

    /// Composite score a ranked-first candidate must reach; below it the
    /// picker falls back to the highest claimed bitrate.
    pub min_confidence: f64,
}

const ACCEPTED_FORMATS: &[&str] = &["mp3", "flac", "ogg", "m4a", "wav", "aiff"];
const LOSSLESS_FORMATS: &[&str] = &["flac", "wav", "aiff"];
const COMMON_FORMATS: &[&str] = &["mp3", "flac"];

impl WeightProfile {
    /// Even weighting across all signals. The default.
    pub fn balanced() -> Self {
        Self {
            name: "balanced",
            duration_tolerance_secs: 30,
            artwork_allowance_bytes: 32 * 1024,
            efficiency_reject_below: 0.8,
            lossless_efficiency_floor: 0.6,
            lossless_bitrate_gate_kbps: 500,
            accepted_formats: ACCEPTED_FORMATS,
            hard_min_bitrate_kbps: 128,
            preferred_formats: COMMON_FORMATS,
            preferred_min_bitrate_kbps: 256,
            no_slot_base: 0.6,
            queue_position_penalty: 0.05,
            w_availability: 0.20,
            w_conditions: 0.15,
            w_tempo: 0.15,
            w_duration: 0.15,
            w_bitrate: 0.10,
            w_similarity: 0.23,
            w_tiebreak: 0.02,
            min_confidence: 0.45,
        }
    }

    /// Weights availability heavily: grab whatever downloads now.
    pub fn fastest() -> Self {
        Self {
            w_availability: 0.45,
            w_conditions: 0.08,
            w_tempo: 0.05,
            w_duration: 0.10,
            w_bitrate: 0.05,
            w_similarity: 0.25,
            w_tiebreak: 0.02,
            hard_min_bitrate_kbps: 0,
            preferred_min_bitrate_kbps: 192,
            no_slot_base: 0.3,
            queue_position_penalty: 0.1,
            min_confidence: 0.40,
            name: "fastest",
            ..Self::balanced()
        }
    }

    /// Weights fidelity: prefers lossless formats and high bitrates, queue
    /// depth barely matters.
    pub fn quality() -> Self {
        Self {
            w_availability: 0.05,
            w_conditions: 0.20,
            w_tempo: 0.15,
            w_duration: 0.15,
            w_bitrate: 0.25,
            w_similarity: 0.18,
            w_tiebreak: 0.02,
            hard_min_bitrate_kbps: 192,
            preferred_formats: LOSSLESS_FORMATS,
            preferred_min_bitrate_kbps: 320,
            no_slot_base: 0.8,
            queue_position_penalty: 0.02,
            min_confidence: 0.50,
            name: "quality",
            ..Self::balanced()
        }
    }

    /// Look up a built-in profile by its (case-insensitive) name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "balanced" => Some(Self::balanced()),
            "fastest" => Some(Self::fastest()),
            "quality" => Some(Self::quality()),
            _ => None,
        }
    }

    pub fn builtin_names() -> &'static [&'static str] {
        &["balanced", "fastest", "quality"]
    }
}

impl Default for WeightProfile {
    fn default() -> Self {
        Self::balanced()
    }
}
