use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Platforms ---

/// Webhook delivery platform kinds. One sender implementation per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Https,
    Telegram,
    Email,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Https => "https",
            Platform::Telegram => "telegram",
            Platform::Email => "email",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "https" => Some(Platform::Https),
            "telegram" => Some(Platform::Telegram),
            "email" => Some(Platform::Email),
            _ => None,
        }
    }
}

// --- Delivery job lifecycle ---

/// Lifecycle status of a delivery job. Persisted as text, constrained by
/// a CHECK on the jobs table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Delivered,
    RetryPending,
    Failed,
    DeadLetter,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Delivered => "delivered",
            JobStatus::RetryPending => "retry_pending",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "delivered" => Some(JobStatus::Delivered),
            "retry_pending" => Some(JobStatus::RetryPending),
            "failed" => Some(JobStatus::Failed),
            "dead_letter" => Some(JobStatus::DeadLetter),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states are never claimed or retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Delivered | JobStatus::Failed | JobStatus::DeadLetter | JobStatus::Cancelled
        )
    }
}

// --- Send outcomes ---

/// Redacted category of a failed send. This is the only error detail that
/// is ever persisted; response bodies and headers are stripped before the
/// outcome leaves the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendErrorCategory {
    Timeout,
    Dns,
    Network,
    Http4xx,
    Http5xx,
    PlatformRejected,
}

impl SendErrorCategory {
    /// Permanent failures skip the retry ladder entirely.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SendErrorCategory::Http4xx | SendErrorCategory::PlatformRejected)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SendErrorCategory::Timeout => "timeout",
            SendErrorCategory::Dns => "dns",
            SendErrorCategory::Network => "network",
            SendErrorCategory::Http4xx => "http_4xx",
            SendErrorCategory::Http5xx => "http_5xx",
            SendErrorCategory::PlatformRejected => "platform_rejected",
        }
    }
}

// --- Webhook scope ---

/// A webhook subscribes to exactly one feed or exactly one bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedTarget {
    Feed(Uuid),
    Bundle(Uuid),
}

// --- Cursor ---

/// Watermark for the last successfully delivered article of a webhook.
/// Strict lower bound for the next planning window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCursor {
    pub published_at: DateTime<Utc>,
    pub article_id: Uuid,
}

// --- Ingestion input ---

/// A normalized article record handed to the pipeline by the upstream
/// fetch/normalize collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedArticle {
    pub title: String,
    pub body: String,
    pub url: String,
    pub source_name: String,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

// --- Pipeline stats ---

/// Counters for one ingestion run. Validation and duplicate drops are
/// absorbed here, never surfaced as errors.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub input_count: u32,
    pub accepted_count: u32,
    pub dropped_invalid: u32,
    pub dropped_duplicates: u32,
}

impl std::fmt::Display for IngestStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "input={} accepted={} dropped_invalid={} dropped_duplicates={}",
            self.input_count, self.accepted_count, self.dropped_invalid, self.dropped_duplicates
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trips_through_db_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Delivered,
            JobStatus::RetryPending,
            JobStatus::Failed,
            JobStatus::DeadLetter,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Delivered.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::RetryPending.is_terminal());
    }

    #[test]
    fn permanent_send_categories() {
        assert!(SendErrorCategory::Http4xx.is_permanent());
        assert!(SendErrorCategory::PlatformRejected.is_permanent());
        assert!(!SendErrorCategory::Timeout.is_permanent());
        assert!(!SendErrorCategory::Http5xx.is_permanent());
        assert!(!SendErrorCategory::Network.is_permanent());
        assert!(!SendErrorCategory::Dns.is_permanent());
    }
}
