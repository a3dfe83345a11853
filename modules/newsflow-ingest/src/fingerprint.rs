//! Content fingerprinting for deduplication.
//!
//! Pure functions: a strong content hash for exact-duplicate detection and
//! a word-shingle signature for near-duplicate scoring. No I/O.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

/// Number of consecutive words per shingle.
const SHINGLE_SIZE: usize = 3;

/// SHA-256 of the empty string — the sentinel hash produced for degenerate
/// (empty after normalization) input.
pub const EMPTY_CONTENT_HASH: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Set of word-trigram shingles over a normalized body. Bodies shorter than
/// the shingle size collapse to a single shingle; empty bodies produce an
/// empty signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimilaritySignature {
    pub shingles: HashSet<String>,
}

impl SimilaritySignature {
    pub fn is_empty(&self) -> bool {
        self.shingles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shingles.len()
    }
}

/// Content hash plus similarity signature for one article.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub content_hash: String,
    pub signature: SimilaritySignature,
}

/// Compute the fingerprint of an article: SHA-256 over the normalized
/// title+body concatenation, and a shingle signature over the normalized
/// body.
pub fn fingerprint(title: &str, body: &str) -> Fingerprint {
    let normalized_title = normalize(title);
    let normalized_body = normalize(body);

    let mut joined = normalized_title.clone();
    if !joined.is_empty() && !normalized_body.is_empty() {
        joined.push(' ');
    }
    joined.push_str(&normalized_body);

    Fingerprint {
        content_hash: content_hash(&joined),
        signature: signature(&normalized_body),
    }
}

/// Lowercase and collapse all whitespace runs to single spaces.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn content_hash(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)
}

fn signature(normalized_body: &str) -> SimilaritySignature {
    let tokens: Vec<&str> = normalized_body.split_whitespace().collect();
    if tokens.is_empty() {
        return SimilaritySignature::default();
    }

    let shingles = if tokens.len() < SHINGLE_SIZE {
        // Short body: the whole token run is the only shingle.
        HashSet::from([tokens.join(" ")])
    } else {
        tokens
            .windows(SHINGLE_SIZE)
            .map(|window| window.join(" "))
            .collect()
    };

    SimilaritySignature { shingles }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_lowercases() {
        assert_eq!(normalize("  Breaking\tNEWS\n\n today "), "breaking news today");
    }

    #[test]
    fn identical_normalized_content_hashes_match() {
        let a = fingerprint("Markets Rally", "Stocks rose sharply  today.");
        let b = fingerprint("  markets   RALLY", "stocks rose sharply today.");
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn different_content_hashes_differ() {
        let a = fingerprint("Markets Rally", "Stocks rose sharply today.");
        let b = fingerprint("Markets Rally", "Stocks fell sharply today.");
        assert_ne!(a.content_hash, b.content_hash);
    }

    #[test]
    fn empty_input_yields_sentinel_hash_and_empty_signature() {
        let fp = fingerprint("", "   \t\n");
        assert_eq!(fp.content_hash, EMPTY_CONTENT_HASH);
        assert!(fp.signature.is_empty());
    }

    #[test]
    fn long_body_produces_trigram_shingles() {
        let fp = fingerprint("t", "one two three four");
        let expected: HashSet<String> =
            ["one two three", "two three four"].into_iter().map(String::from).collect();
        assert_eq!(fp.signature.shingles, expected);
    }

    #[test]
    fn short_body_collapses_to_single_shingle() {
        let fp = fingerprint("t", "one two");
        assert_eq!(fp.signature.shingles, HashSet::from(["one two".to_string()]));
    }

    #[test]
    fn signature_is_deterministic() {
        let a = fingerprint("Title", "alpha beta gamma delta epsilon");
        let b = fingerprint("Title", "alpha beta gamma delta epsilon");
        assert_eq!(a.signature, b.signature);
        assert_eq!(a.content_hash, b.content_hash);
    }
}
