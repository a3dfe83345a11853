//! HTTP mail relay client behind the delivery crate's `Mailer` seam.
//!
//! Mail leaves the system through an external relay endpoint that accepts
//! a JSON body. When no relay is configured, email sends fail fast and
//! the dispatcher's failure handling takes over.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use newsflow_delivery::Mailer;

pub struct RelayMailer {
    client: Client,
    relay_url: String,
    token: Option<String>,
}

impl RelayMailer {
    pub fn new(relay_url: String, token: Option<String>, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            relay_url,
            token,
        })
    }
}

#[async_trait]
impl Mailer for RelayMailer {
    async fn send_email(&self, to: &str, subject: &str, html: &str, text: &str) -> anyhow::Result<()> {
        let mut request = self.client.post(&self.relay_url).json(&json!({
            "to": to,
            "subject": subject,
            "html": html,
            "text": text,
        }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("mail relay returned HTTP {status}");
        }
        debug!(status = status.as_u16(), "Mail accepted by relay");
        Ok(())
    }
}

/// Stand-in used when MAIL_RELAY_URL is not set.
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    async fn send_email(&self, _to: &str, _subject: &str, _html: &str, _text: &str) -> anyhow::Result<()> {
        anyhow::bail!("no mail relay configured")
    }
}
