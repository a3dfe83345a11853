//! Feed and bundle resolution for webhook scopes.

use sqlx::PgPool;
use uuid::Uuid;

use newsflow_common::FeedTarget;

use crate::error::Result;

#[derive(Clone)]
pub struct SourceStore {
    pool: PgPool,
}

/// A webhook's resolved source: display name plus the effective topic
/// filter. For a bundle the filter is the union of its member feeds.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub source_id: Uuid,
    pub name: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Feed {
    pub feed_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub topics: Vec<String>,
    pub is_active: bool,
}

impl SourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn feed(&self, feed_id: Uuid, user_id: Uuid) -> Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>(
            r#"
            SELECT feed_id, user_id, name, topics, is_active
            FROM feeds
            WHERE feed_id = $1 AND user_id = $2 AND is_active
            "#,
        )
        .bind(feed_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(feed)
    }

    /// Resolve a webhook scope to its source, or `None` when the feed or
    /// bundle is gone or inactive.
    pub async fn resolve(&self, scope: FeedTarget, user_id: Uuid) -> Result<Option<SourceInfo>> {
        match scope {
            FeedTarget::Feed(feed_id) => {
                let feed = self.feed(feed_id, user_id).await?;
                Ok(feed.map(|f| SourceInfo {
                    source_id: f.feed_id,
                    name: f.name,
                    topics: f.topics,
                }))
            }
            FeedTarget::Bundle(bundle_id) => {
                let row = sqlx::query_as::<_, (Uuid, String)>(
                    r#"
                    SELECT bundle_id, name FROM bundles
                    WHERE bundle_id = $1 AND user_id = $2 AND is_active
                    "#,
                )
                .bind(bundle_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
                let Some((source_id, name)) = row else {
                    return Ok(None);
                };

                let topics = sqlx::query_scalar::<_, String>(
                    r#"
                    SELECT DISTINCT unnest(f.topics)
                    FROM bundle_feeds bf
                    JOIN feeds f ON f.feed_id = bf.feed_id
                    WHERE bf.bundle_id = $1 AND f.is_active
                    ORDER BY 1
                    "#,
                )
                .bind(bundle_id)
                .fetch_all(&self.pool)
                .await?;

                Ok(Some(SourceInfo {
                    source_id,
                    name,
                    topics,
                }))
            }
        }
    }
}
