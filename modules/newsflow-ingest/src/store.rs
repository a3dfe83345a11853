//! Postgres persistence for the accepted article corpus.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use newsflow_common::DeliveryCursor;

use crate::error::Result;

#[derive(Clone)]
pub struct ArticleStore {
    pool: PgPool,
}

/// A row from the articles table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredArticle {
    pub article_id: Uuid,
    pub title: String,
    pub body: String,
    pub url: String,
    pub source_name: String,
    pub topics: Vec<String>,
    pub tags: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub content_hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Parameters for inserting a new accepted article.
#[derive(Debug, Clone)]
pub struct InsertArticle {
    pub title: String,
    pub body: String,
    pub url: String,
    pub source_name: String,
    pub topics: Vec<String>,
    pub tags: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub content_hash: String,
}

/// Outcome of an insert attempt. A uniqueness conflict on URL or content
/// hash is a duplicate, not an error — concurrent ingesters race for the
/// same story and the index is the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Uuid),
    DuplicateKey,
}

/// The bounded slice of recent articles used for similarity probing.
/// Signatures are re-derived from the stored text.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RecentArticle {
    pub article_id: Uuid,
    pub title: String,
    pub body: String,
}

impl ArticleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert an accepted article. Relies on the native uniqueness
    /// constraints for url and content_hash.
    pub async fn insert(&self, article: InsertArticle) -> Result<InsertOutcome> {
        let row = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO articles
                (title, body, url, source_name, topics, tags, published_at, content_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            RETURNING article_id
            "#,
        )
        .bind(&article.title)
        .bind(&article.body)
        .bind(&article.url)
        .bind(&article.source_name)
        .bind(&article.topics)
        .bind(&article.tags)
        .bind(article.published_at)
        .bind(&article.content_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(article_id) => InsertOutcome::Inserted(article_id),
            None => InsertOutcome::DuplicateKey,
        })
    }

    /// URLs from the given set that already exist among non-deleted articles.
    pub async fn existing_urls(&self, urls: &[String]) -> Result<HashSet<String>> {
        if urls.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query_scalar::<_, String>(
            r#"
            SELECT url FROM articles
            WHERE url = ANY($1) AND deleted_at IS NULL
            "#,
        )
        .bind(urls)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// Content hashes from the given set that already exist, with the
    /// matching article ids.
    pub async fn existing_hashes(&self, hashes: &[String]) -> Result<Vec<(String, Uuid)>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, (String, Uuid)>(
            r#"
            SELECT content_hash, article_id FROM articles
            WHERE content_hash = ANY($1) AND deleted_at IS NULL
            "#,
        )
        .bind(hashes)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// The bounded recent window for similarity probing: newest first,
    /// capped by record count and age.
    pub async fn recent_window(&self, max_age: Duration, limit: i64) -> Result<Vec<RecentArticle>> {
        let cutoff = Utc::now() - max_age;
        let rows = sqlx::query_as::<_, RecentArticle>(
            r#"
            SELECT article_id, title, body FROM articles
            WHERE is_active AND deleted_at IS NULL AND created_at >= $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Fetch one article by id.
    pub async fn by_id(&self, article_id: Uuid) -> Result<Option<StoredArticle>> {
        let row = sqlx::query_as::<_, StoredArticle>(
            r#"
            SELECT article_id, title, body, url, source_name, topics, tags,
                   published_at, content_hash, is_active, created_at, deleted_at
            FROM articles
            WHERE article_id = $1
            "#,
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Active articles matching the topic filter, strictly after the
    /// delivery cursor, oldest first. The (published_at, article_id) row
    /// comparison keeps the ordering total even when timestamps collide.
    /// An empty filter matches everything.
    pub async fn matching_after(
        &self,
        topics: &[String],
        cursor: Option<DeliveryCursor>,
        limit: i64,
    ) -> Result<Vec<StoredArticle>> {
        let (after_ts, after_id) = match cursor {
            Some(c) => (c.published_at, c.article_id),
            None => (DateTime::<Utc>::MIN_UTC, Uuid::nil()),
        };
        let rows = sqlx::query_as::<_, StoredArticle>(
            r#"
            SELECT article_id, title, body, url, source_name, topics, tags,
                   published_at, content_hash, is_active, created_at, deleted_at
            FROM articles
            WHERE is_active AND deleted_at IS NULL
              AND (cardinality($1::text[]) = 0 OR topics && $1)
              AND (published_at, article_id) > ($2, $3)
            ORDER BY published_at ASC, article_id ASC
            LIMIT $4
            "#,
        )
        .bind(topics)
        .bind(after_ts)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// The most recent active articles matching the topic filter, newest
    /// first.
    pub async fn recent_matching(&self, topics: &[String], limit: i64) -> Result<Vec<StoredArticle>> {
        let rows = sqlx::query_as::<_, StoredArticle>(
            r#"
            SELECT article_id, title, body, url, source_name, topics, tags,
                   published_at, content_hash, is_active, created_at, deleted_at
            FROM articles
            WHERE is_active AND deleted_at IS NULL
              AND (cardinality($1::text[]) = 0 OR topics && $1)
            ORDER BY published_at DESC, article_id DESC
            LIMIT $2
            "#,
        )
        .bind(topics)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Soft-delete an article. The row stays while delivery items still
    /// reference it.
    pub async fn soft_delete(&self, article_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE articles
            SET deleted_at = now(), is_active = false
            WHERE article_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(article_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
