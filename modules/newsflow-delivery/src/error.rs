use thiserror::Error;

use newsflow_common::{CommonError, SendErrorCategory};

pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Infrastructure failures in the delivery subsystem. Send outcomes are
/// not errors at this level; they are [`SendError`] values handled by the
/// dispatcher's state machine.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<CommonError> for DeliveryError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::Crypto(msg) => DeliveryError::Crypto(msg),
            CommonError::Validation(msg) => DeliveryError::Validation(msg),
            CommonError::Config(msg) => DeliveryError::Validation(msg),
            CommonError::Anyhow(err) => DeliveryError::Other(err),
        }
    }
}

impl From<newsflow_ingest::IngestError> for DeliveryError {
    fn from(err: newsflow_ingest::IngestError) -> Self {
        match err {
            newsflow_ingest::IngestError::Database(e) => DeliveryError::Database(e),
            newsflow_ingest::IngestError::Other(e) => DeliveryError::Other(e),
        }
    }
}

/// A failed send attempt, already redacted. `label()` is the only string
/// that reaches storage or logs; endpoint bodies and headers never do.
#[derive(Debug, Clone)]
pub struct SendError {
    pub category: SendErrorCategory,
    pub status: Option<u16>,
    platform: &'static str,
}

impl SendError {
    pub fn new(platform: &'static str, category: SendErrorCategory, status: Option<u16>) -> Self {
        Self {
            category,
            status,
            platform,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.category.is_permanent()
    }

    /// Redacted error string, e.g. `https_http_503` or `telegram_timeout`.
    pub fn label(&self) -> String {
        match self.status {
            Some(status) => format!("{}_http_{}", self.platform, status),
            None => format!("{}_{}", self.platform, self.category.label()),
        }
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

impl std::error::Error for SendError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_includes_status_when_present() {
        let err = SendError::new("https", SendErrorCategory::Http5xx, Some(503));
        assert_eq!(err.label(), "https_http_503");
    }

    #[test]
    fn label_falls_back_to_category() {
        let err = SendError::new("telegram", SendErrorCategory::Timeout, None);
        assert_eq!(err.label(), "telegram_timeout");
    }

    #[test]
    fn permanence_follows_category() {
        assert!(SendError::new("https", SendErrorCategory::Http4xx, Some(404)).is_permanent());
        assert!(!SendError::new("https", SendErrorCategory::Http5xx, Some(500)).is_permanent());
        assert!(!SendError::new("https", SendErrorCategory::Network, None).is_permanent());
    }
}
