//! Edit-distance string similarity between candidate filenames and the
//! requested track metadata.
//!
//! Peer shares name files every way imaginable ("01 - Track.mp3",
//! "Artist_-_Track_(Original_Mix).flac"), so matching is containment-first
//! with a Levenshtein fallback over normalized text.

use crate::orchestrator::{CandidateFile, TrackRequest};

const TITLE_WEIGHT: f64 = 0.5;
const ARTIST_WEIGHT: f64 = 0.3;
const ALBUM_WEIGHT: f64 = 0.2;

/// Calculate the Levenshtein (edit) distance between two strings.
/// Returns the minimum number of single-character edits (insertions,
/// deletions, or substitutions) required to change one string into the other.
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let a_len = a_chars.len();
    let b_len = b_chars.len();

    // Quick returns for empty strings
    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    // Use two rows instead of a full matrix for space efficiency
    let mut prev_row: Vec<usize> = (0..=b_len).collect();
    let mut curr_row: Vec<usize> = vec![0; b_len + 1];

    for (i, a_char) in a_chars.iter().enumerate() {
        curr_row[0] = i + 1;

        for (j, b_char) in b_chars.iter().enumerate() {
            let cost = if a_char == b_char { 0 } else { 1 };

            curr_row[j + 1] = (prev_row[j + 1] + 1) // deletion
                .min(curr_row[j] + 1) // insertion
                .min(prev_row[j] + cost); // substitution
        }

        std::mem::swap(&mut prev_row, &mut curr_row);
    }

    prev_row[b_len]
}

/// Normalized similarity in `[0, 1]`, where 1.0 means equal strings.
pub fn string_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let distance = levenshtein_distance(a, b);
    1.0 - distance as f64 / max_len as f64
}

/// Lowercase, strip everything but alphanumerics, collapse runs of
/// separators into single spaces.
pub fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = true;
    for c in s.chars() {
        if c.is_alphanumeric() {
            for lc in c.to_lowercase() {
                out.push(lc);
            }
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Score one metadata field against the candidate's filename.
/// Containment counts as a full match; otherwise fall back to edit distance
/// over the whole strings.
fn field_score(field: &str, haystack: &str) -> f64 {
    let field = normalize(field);
    if field.is_empty() {
        return 0.0;
    }
    if haystack.contains(&field) {
        return 1.0;
    }
    string_similarity(&field, haystack)
}

/// Weighted similarity of a candidate's filename against the requested
/// track, title weighted heaviest, then artist, then album. Artist and album
/// also match against the containing directory, where shares usually keep
/// them ("Artist/Album/01 Title.mp3"). Weights are renormalized when the
/// request carries no album.
pub fn request_similarity(candidate: &CandidateFile, target: &TrackRequest) -> f64 {
    let filename = candidate.filename();
    let stem = match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => filename,
    };
    let name_haystack = normalize(stem);
    let dir_haystack = normalize(candidate.directory());

    let artist = field_score(&target.artist, &name_haystack)
        .max(field_score(&target.artist, &dir_haystack));

    let mut total = TITLE_WEIGHT * field_score(&target.title, &name_haystack)
        + ARTIST_WEIGHT * artist;
    let mut weight_sum = TITLE_WEIGHT + ARTIST_WEIGHT;

    if let Some(album) = &target.album {
        let album_score = field_score(album, &name_haystack)
            .max(field_score(album, &dir_haystack));
        total += ALBUM_WEIGHT * album_score;
        weight_sum += ALBUM_WEIGHT;
    }

    total / weight_sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein_distance("hello", "hello"), 0);
        assert_eq!(levenshtein_distance("hello", "hallo"), 1);
        assert_eq!(levenshtein_distance("hello", "hell"), 1);
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("", "hello"), 5);
        assert_eq!(levenshtein_distance("hello", ""), 5);
        assert_eq!(levenshtein_distance("", ""), 0);
    }

    #[test]
    fn test_string_similarity_bounds() {
        assert_eq!(string_similarity("same", "same"), 1.0);
        assert_eq!(string_similarity("", ""), 1.0);
        assert_eq!(string_similarity("abcd", "wxyz"), 0.0);
        let s = string_similarity("beatles", "beatels");
        assert!(s > 0.6 && s < 1.0);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("Around_The-World!!"), "around the world");
        assert_eq!(normalize("  Daft   Punk  "), "daft punk");
        assert_eq!(normalize("01. Intro (Live)"), "01 intro live");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_field_score_containment() {
        assert_eq!(field_score("Around the World", "daft punk around the world"), 1.0);
        assert_eq!(field_score("", "anything"), 0.0);
        let partial = field_score("around the wrld", "daft punk around the world");
        assert!(partial > 0.0 && partial < 1.0);
    }

    #[test]
    fn test_request_similarity_exact_naming() {
        let target = TrackRequest::new("Daft Punk", "Around the World", Some("Homework"), 429);
        let good = CandidateFile::new(
            "peer",
            "music\\Daft Punk\\Homework\\02 - Daft Punk - Around the World.mp3",
            9_000_000,
        );
        let bad = CandidateFile::new("peer", "music\\random\\completely other song.mp3", 9_000_000);

        let good_score = request_similarity(&good, &target);
        let bad_score = request_similarity(&bad, &target);
        assert!(good_score > 0.95, "got {good_score}");
        assert!(bad_score < 0.4, "got {bad_score}");
        assert!(good_score > bad_score);
    }

    #[test]
    fn test_request_similarity_without_album() {
        let target = TrackRequest::new("Burial", "Archangel", None, 238);
        let candidate = CandidateFile::new("peer", "dubstep\\Burial - Archangel.mp3", 8_000_000);
        let score = request_similarity(&candidate, &target);
        assert!(score > 0.95, "got {score}");
    }

    #[test]
    fn test_request_similarity_album_in_directory() {
        let target = TrackRequest::new("Burial", "Archangel", Some("Untrue"), 238);
        let candidate =
            CandidateFile::new("peer", "shared\\Burial\\Untrue\\02 Archangel.flac", 30_000_000);
        let score = request_similarity(&candidate, &target);
        assert!(score > 0.9, "got {score}");
    }
}
