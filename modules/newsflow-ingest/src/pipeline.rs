//! The ingestion pipeline: validate, deduplicate, persist.
//!
//! All validation and duplicate outcomes are absorbed into [`IngestStats`];
//! the caller only ever sees infrastructure errors.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use newsflow_common::{Config, IngestStats, NormalizedArticle};

use crate::dedup::{DedupEngine, DedupVerdict};
use crate::error::Result;
use crate::fingerprint::{fingerprint, Fingerprint, SimilaritySignature};
use crate::store::{ArticleStore, InsertArticle, InsertOutcome};

const MAX_TOPICS: usize = 20;
const MAX_TAGS: usize = 50;

pub struct IngestPipeline {
    store: ArticleStore,
    engine: DedupEngine,
    window_max_records: i64,
    window_max_age: Duration,
}

/// A validated article with its fingerprint, ready for corpus-level checks.
#[derive(Debug, Clone)]
struct PreparedArticle {
    title: String,
    body: String,
    url: String,
    source_name: String,
    topics: Vec<String>,
    tags: Vec<String>,
    published_at: DateTime<Utc>,
    fingerprint: Fingerprint,
}

impl IngestPipeline {
    pub fn new(store: ArticleStore, config: &Config) -> Self {
        Self {
            store,
            engine: DedupEngine::new(config.similarity_threshold),
            window_max_records: config.dedup_window_max_records,
            window_max_age: Duration::hours(config.dedup_window_max_age_hours),
        }
    }

    /// Run one ingestion batch. Accepted articles are appended to the
    /// similarity window as they land, so a near-duplicate later in the
    /// same batch is still caught.
    pub async fn ingest(&self, batch: Vec<NormalizedArticle>) -> Result<IngestStats> {
        let now = Utc::now();
        let (prepared, mut stats) = prepare_batch(batch, now);
        if prepared.is_empty() {
            info!(%stats, "Ingestion run complete (nothing to persist)");
            return Ok(stats);
        }

        let urls: Vec<String> = prepared.iter().map(|p| p.url.clone()).collect();
        let hashes: Vec<String> =
            prepared.iter().map(|p| p.fingerprint.content_hash.clone()).collect();

        let existing_urls = self.store.existing_urls(&urls).await?;
        let existing_hashes: HashMap<String, Uuid> =
            self.store.existing_hashes(&hashes).await?.into_iter().collect();

        let recent = self
            .store
            .recent_window(self.window_max_age, self.window_max_records)
            .await?;
        let mut window: Vec<(Uuid, SimilaritySignature)> = recent
            .iter()
            .map(|r| (r.article_id, fingerprint(&r.title, &r.body).signature))
            .collect();

        for article in prepared {
            if existing_urls.contains(&article.url) {
                debug!(url = %article.url, "Dropping duplicate URL");
                stats.dropped_duplicates += 1;
                continue;
            }

            let exact = existing_hashes.get(&article.fingerprint.content_hash).copied();
            match self.engine.evaluate(&article.fingerprint.signature, exact, &window) {
                DedupVerdict::Accept => {
                    let signature = article.fingerprint.signature.clone();
                    match self.store.insert(article.into_insert()).await? {
                        InsertOutcome::Inserted(article_id) => {
                            stats.accepted_count += 1;
                            window.push((article_id, signature));
                        }
                        // Lost a race with a concurrent ingester; the
                        // uniqueness index is the arbiter.
                        InsertOutcome::DuplicateKey => {
                            stats.dropped_duplicates += 1;
                        }
                    }
                }
                DedupVerdict::RejectExact { article_id } => {
                    debug!(%article_id, "Dropping exact duplicate");
                    stats.dropped_duplicates += 1;
                }
                DedupVerdict::RejectSimilar { article_id, score } => {
                    debug!(%article_id, score, "Dropping near-duplicate");
                    stats.dropped_duplicates += 1;
                }
            }
        }

        info!(%stats, "Ingestion run complete");
        Ok(stats)
    }
}

impl PreparedArticle {
    fn into_insert(self) -> InsertArticle {
        InsertArticle {
            title: self.title,
            body: self.body,
            url: self.url,
            source_name: self.source_name,
            topics: self.topics,
            tags: self.tags,
            published_at: self.published_at,
            content_hash: self.fingerprint.content_hash,
        }
    }
}

/// Validate and fingerprint a raw batch, dropping malformed records and
/// within-batch URL/hash duplicates. Corpus-level checks happen later.
fn prepare_batch(
    batch: Vec<NormalizedArticle>,
    now: DateTime<Utc>,
) -> (Vec<PreparedArticle>, IngestStats) {
    let mut stats = IngestStats {
        input_count: batch.len() as u32,
        ..Default::default()
    };

    let mut seen_urls: HashSet<String> = HashSet::new();
    let mut seen_hashes: HashSet<String> = HashSet::new();
    let mut prepared = Vec::with_capacity(batch.len());

    for raw in batch {
        let title = raw.title.trim().to_string();
        let body = raw.body.trim().to_string();
        let url = raw.url.trim().to_string();
        let source_name = raw.source_name.trim().to_string();

        if title.is_empty() || body.is_empty() || source_name.is_empty() || !is_valid_url(&url) {
            stats.dropped_invalid += 1;
            continue;
        }

        let fp = fingerprint(&title, &body);
        if !seen_urls.insert(url.clone()) || !seen_hashes.insert(fp.content_hash.clone()) {
            stats.dropped_duplicates += 1;
            continue;
        }

        prepared.push(PreparedArticle {
            title,
            body,
            url,
            source_name,
            topics: normalize_labels(&raw.topics, MAX_TOPICS),
            tags: normalize_labels(&raw.tags, MAX_TAGS),
            published_at: raw.published_at.unwrap_or(now),
            fingerprint: fp,
        });
    }

    (prepared, stats)
}

fn is_valid_url(raw: &str) -> bool {
    match Url::parse(raw) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some(),
        Err(_) => false,
    }
}

/// Lowercase, trim, drop empties and repeats, preserve first-seen order,
/// cap the count.
fn normalize_labels(labels: &[String], cap: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    labels
        .iter()
        .map(|label| label.trim().to_lowercase())
        .filter(|label| !label.is_empty() && seen.insert(label.clone()))
        .take(cap)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(title: &str, body: &str, url: &str) -> NormalizedArticle {
        NormalizedArticle {
            title: title.to_string(),
            body: body.to_string(),
            url: url.to_string(),
            source_name: "Wire Service".to_string(),
            published_at: None,
            topics: vec![],
            tags: vec![],
        }
    }

    // --- normalize_labels tests ---

    #[test]
    fn labels_lowercased_and_deduped_in_order() {
        let labels = vec!["Tech".into(), "  AI ".into(), "tech".into(), "".into()];
        assert_eq!(normalize_labels(&labels, 20), vec!["tech", "ai"]);
    }

    #[test]
    fn labels_capped() {
        let labels: Vec<String> = (0..30).map(|i| format!("topic-{i}")).collect();
        assert_eq!(normalize_labels(&labels, 20).len(), 20);
    }

    // --- is_valid_url tests ---

    #[test]
    fn accepts_https_urls() {
        assert!(is_valid_url("https://example.com/story"));
        assert!(is_valid_url("http://news.example.org/a?b=1"));
    }

    #[test]
    fn rejects_malformed_and_non_http() {
        assert!(!is_valid_url("not a url"));
        assert!(!is_valid_url("ftp://example.com/file"));
        assert!(!is_valid_url(""));
    }

    // --- prepare_batch tests ---

    #[test]
    fn counts_invalid_records() {
        let batch = vec![
            article("", "body text here", "https://a.example/1"),
            article("Title", "", "https://a.example/2"),
            article("Title", "body text here", "nope"),
            article("Title", "body text here", "https://a.example/3"),
        ];
        let (prepared, stats) = prepare_batch(batch, Utc::now());
        assert_eq!(prepared.len(), 1);
        assert_eq!(stats.input_count, 4);
        assert_eq!(stats.dropped_invalid, 3);
        assert_eq!(stats.dropped_duplicates, 0);
    }

    #[test]
    fn within_batch_url_duplicates_dropped() {
        let batch = vec![
            article("First", "completely different body one", "https://a.example/same"),
            article("Second", "completely different body two", "https://a.example/same"),
        ];
        let (prepared, stats) = prepare_batch(batch, Utc::now());
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].title, "First");
        assert_eq!(stats.dropped_duplicates, 1);
    }

    #[test]
    fn within_batch_hash_duplicates_dropped() {
        // Same normalized content on different URLs.
        let batch = vec![
            article("Markets Rally", "Stocks rose sharply today.", "https://a.example/1"),
            article("Markets  RALLY", "stocks rose   sharply today.", "https://b.example/2"),
        ];
        let (prepared, stats) = prepare_batch(batch, Utc::now());
        assert_eq!(prepared.len(), 1);
        assert_eq!(stats.dropped_duplicates, 1);
    }

    #[test]
    fn missing_published_at_defaults_to_now() {
        let now = Utc::now();
        let (prepared, _) =
            prepare_batch(vec![article("T", "some body text", "https://a.example/1")], now);
        assert_eq!(prepared[0].published_at, now);
    }

    #[test]
    fn empty_batch_yields_zero_stats() {
        let (prepared, stats) = prepare_batch(vec![], Utc::now());
        assert!(prepared.is_empty());
        assert_eq!(stats, IngestStats::default());
    }
}
