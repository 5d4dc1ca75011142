mod engine;
mod similarity;
mod tempo;
mod weights;

pub use engine::{rank, score, select_candidate, ScoredCandidate};
pub use similarity::{levenshtein_distance, string_similarity};
pub use tempo::{extract_tempo, proximity_score, ExtractedTempo};
pub use weights::WeightProfile;
