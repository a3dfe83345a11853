//! Deduplication decisions for incoming articles.
//!
//! Two layers, checked in priority order: exact content-hash lookup, then
//! Jaccard similarity over shingle signatures against a bounded recent
//! window of the corpus. The decision function is pure; the pipeline owns
//! all probing.

use uuid::Uuid;

use crate::fingerprint::SimilaritySignature;

/// The outcome of evaluating one candidate article against the corpus.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupVerdict {
    /// No match — store the article.
    Accept,
    /// Byte-identical (normalized) content already stored.
    RejectExact { article_id: Uuid },
    /// Near-duplicate of an existing article at or above the threshold.
    RejectSimilar { article_id: Uuid, score: f64 },
}

/// Jaccard similarity of two shingle sets: |intersection| / |union|.
/// Empty-against-anything scores 0.0.
pub fn jaccard(a: &SimilaritySignature, b: &SimilaritySignature) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.shingles.intersection(&b.shingles).count();
    let union = a.shingles.len() + b.shingles.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Decides accept/reject for candidate articles.
#[derive(Debug, Clone)]
pub struct DedupEngine {
    threshold: f64,
}

impl DedupEngine {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Evaluate a candidate. `exact_match` is the result of the content-hash
    /// index probe; `window` is the bounded recent corpus slice with
    /// re-derived signatures.
    ///
    /// Ties at the maximum similarity score resolve to the lowest article
    /// id, so repeated runs over the same corpus report the same match.
    pub fn evaluate(
        &self,
        candidate: &SimilaritySignature,
        exact_match: Option<Uuid>,
        window: &[(Uuid, SimilaritySignature)],
    ) -> DedupVerdict {
        if let Some(article_id) = exact_match {
            return DedupVerdict::RejectExact { article_id };
        }

        let mut best: Option<(Uuid, f64)> = None;
        for (article_id, signature) in window {
            let score = jaccard(candidate, signature);
            if score < self.threshold {
                continue;
            }
            best = match best {
                None => Some((*article_id, score)),
                Some((best_id, best_score)) => {
                    if score > best_score || (score == best_score && *article_id < best_id) {
                        Some((*article_id, score))
                    } else {
                        Some((best_id, best_score))
                    }
                }
            };
        }

        match best {
            Some((article_id, score)) => DedupVerdict::RejectSimilar { article_id, score },
            None => DedupVerdict::Accept,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sig(shingles: &[&str]) -> SimilaritySignature {
        SimilaritySignature {
            shingles: shingles.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    // --- jaccard tests ---

    #[test]
    fn jaccard_identical_sets() {
        let a = sig(&["a b c", "b c d"]);
        assert_eq!(jaccard(&a, &a), 1.0);
    }

    #[test]
    fn jaccard_disjoint_sets() {
        assert_eq!(jaccard(&sig(&["a b c"]), &sig(&["x y z"])), 0.0);
    }

    #[test]
    fn jaccard_empty_scores_zero() {
        let empty = SimilaritySignature::default();
        assert_eq!(jaccard(&empty, &sig(&["a b c"])), 0.0);
        assert_eq!(jaccard(&empty, &empty), 0.0);
    }

    #[test]
    fn jaccard_partial_overlap() {
        // intersection 2, union 4
        let a = sig(&["s1", "s2", "s3"]);
        let b = sig(&["s2", "s3", "s4"]);
        assert!((jaccard(&a, &b) - 0.5).abs() < f64::EPSILON);
    }

    // --- evaluate tests ---

    /// Builds a pair of signatures with an exact Jaccard score of
    /// `shared / (shared + 2 * extra)`.
    fn sig_pair(shared: usize, extra: usize) -> (SimilaritySignature, SimilaritySignature) {
        let common: HashSet<String> = (0..shared).map(|i| format!("common {i}")).collect();
        let mut a = common.clone();
        let mut b = common;
        for i in 0..extra {
            a.insert(format!("only-a {i}"));
            b.insert(format!("only-b {i}"));
        }
        (SimilaritySignature { shingles: a }, SimilaritySignature { shingles: b })
    }

    #[test]
    fn exact_match_wins_over_similarity() {
        let engine = DedupEngine::new(0.80);
        let (candidate, stored) = sig_pair(10, 0);
        let verdict = engine.evaluate(&candidate, Some(id(1)), &[(id(2), stored)]);
        assert_eq!(verdict, DedupVerdict::RejectExact { article_id: id(1) });
    }

    #[test]
    fn at_threshold_rejects_similar() {
        let engine = DedupEngine::new(0.80);
        // 8 shared, 1 extra each side: 8 / 10 = 0.80
        let (candidate, stored) = sig_pair(8, 1);
        let verdict = engine.evaluate(&candidate, None, &[(id(3), stored)]);
        assert_eq!(verdict, DedupVerdict::RejectSimilar { article_id: id(3), score: 0.80 });
    }

    #[test]
    fn just_below_threshold_accepts() {
        // 79 shared, 10+10 extra: 79 / 99 ≈ 0.798
        let engine = DedupEngine::new(0.80);
        let (candidate, stored) = sig_pair(79, 10);
        let verdict = engine.evaluate(&candidate, None, &[(id(3), stored)]);
        assert_eq!(verdict, DedupVerdict::Accept);
    }

    #[test]
    fn empty_window_accepts() {
        let engine = DedupEngine::new(0.80);
        let (candidate, _) = sig_pair(5, 0);
        assert_eq!(engine.evaluate(&candidate, None, &[]), DedupVerdict::Accept);
    }

    #[test]
    fn highest_score_wins() {
        let engine = DedupEngine::new(0.80);
        let (candidate, close) = sig_pair(9, 0); // 1.0 against itself
        let (_, further) = sig_pair(9, 1); // lower overlap with candidate
        let verdict = engine.evaluate(&candidate, None, &[(id(5), further), (id(6), close)]);
        match verdict {
            DedupVerdict::RejectSimilar { article_id, score } => {
                assert_eq!(article_id, id(6));
                assert_eq!(score, 1.0);
            }
            other => panic!("expected RejectSimilar, got {other:?}"),
        }
    }

    #[test]
    fn tie_breaks_to_lowest_article_id() {
        let engine = DedupEngine::new(0.80);
        let (candidate, stored) = sig_pair(10, 0);
        let window = vec![(id(9), stored.clone()), (id(2), stored.clone()), (id(5), stored)];
        let verdict = engine.evaluate(&candidate, None, &window);
        assert_eq!(verdict, DedupVerdict::RejectSimilar { article_id: id(2), score: 1.0 });
    }

    #[test]
    fn near_identical_rewrite_rejected() {
        // Same wire story republished with one word changed late in the text.
        let original = "the city council voted on tuesday evening to approve the new regional \
                        transit expansion plan after months of contentious public hearings and \
                        difficult budget negotiations with county officials the plan adds three \
                        new rapid bus corridors and extends the existing light rail line to the \
                        airport with construction expected to begin early next year officials said";
        let rewrite = "the city council voted on tuesday evening to approve the new regional \
                       transit expansion plan after months of contentious public hearings and \
                       difficult fiscal negotiations with county officials the plan adds three \
                       new rapid bus corridors and extends the existing light rail line to the \
                       airport with construction expected to begin early next year officials said";
        let a = crate::fingerprint::fingerprint("Council approves transit plan", original);
        let b = crate::fingerprint::fingerprint("Council approves transit plan", rewrite);

        let engine = DedupEngine::new(0.80);
        let verdict = engine.evaluate(&b.signature, None, &[(id(1), a.signature)]);
        assert!(
            matches!(verdict, DedupVerdict::RejectSimilar { article_id, .. } if article_id == id(1)),
            "two-word rewrite should score above threshold, got {verdict:?}"
        );
    }

    #[test]
    fn unrelated_story_accepted() {
        let a = crate::fingerprint::fingerprint(
            "Council approves transit plan",
            "the city council voted on tuesday to approve the new transit plan",
        );
        let b = crate::fingerprint::fingerprint(
            "Storm closes schools",
            "a winter storm forced every district in the county to close schools on monday",
        );
        let engine = DedupEngine::new(0.80);
        assert_eq!(engine.evaluate(&b.signature, None, &[(id(1), a.signature)]), DedupVerdict::Accept);
    }
}
