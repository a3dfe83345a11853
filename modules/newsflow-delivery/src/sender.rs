//! Platform senders. One implementation per [`Platform`] variant, wired
//! into a fixed table so dispatch is a straight enum match.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::json;
use sha2::Sha256;
use tracing::debug;

use newsflow_common::{Platform, SecretString, SendErrorCategory};

use crate::error::SendError;
use crate::render::RenderedMessage;
use crate::validate::validate_bot_token;

type HmacSha256 = Hmac<Sha256>;

pub type SendResult = std::result::Result<(), SendError>;

#[async_trait]
pub trait PlatformSender: Send + Sync {
    fn platform(&self) -> Platform;

    /// Deliver a rendered message. `target` and `secret` arrive decrypted
    /// and must not outlive the call.
    async fn send(
        &self,
        target: &SecretString,
        secret: Option<&SecretString>,
        message: &RenderedMessage,
    ) -> SendResult;
}

/// The full sender set, one slot per platform.
pub struct SenderTable {
    https: HttpsSender,
    telegram: TelegramSender,
    email: EmailSender,
}

impl SenderTable {
    pub fn new(https: HttpsSender, telegram: TelegramSender, email: EmailSender) -> Self {
        Self {
            https,
            telegram,
            email,
        }
    }

    pub fn for_platform(&self, platform: Platform) -> &dyn PlatformSender {
        match platform {
            Platform::Https => &self.https,
            Platform::Telegram => &self.telegram,
            Platform::Email => &self.email,
        }
    }
}

// --- HTTPS ---

/// Posts the JSON envelope to the webhook URL. When a signing secret is
/// configured the body is authenticated with HMAC-SHA256 over the exact
/// bytes sent.
pub struct HttpsSender {
    client: Client,
}

impl HttpsSender {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PlatformSender for HttpsSender {
    fn platform(&self) -> Platform {
        Platform::Https
    }

    async fn send(
        &self,
        target: &SecretString,
        secret: Option<&SecretString>,
        message: &RenderedMessage,
    ) -> SendResult {
        let RenderedMessage::Https { body } = message else {
            return Err(SendError::new(
                "https",
                SendErrorCategory::PlatformRejected,
                None,
            ));
        };

        let mut request = self
            .client
            .post(target.expose())
            .header("Content-Type", "application/json")
            .body(body.clone());

        if let Some(secret) = secret {
            let signature = sign_payload(body, secret.expose());
            request = request
                .header("X-Webhook-Signature", signature)
                .header("X-Webhook-Timestamp", chrono::Utc::now().timestamp().to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error("https", &e))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(SendError::new(
                "https",
                SendErrorCategory::Http4xx,
                Some(status.as_u16()),
            ));
        }
        if status.is_server_error() {
            return Err(SendError::new(
                "https",
                SendErrorCategory::Http5xx,
                Some(status.as_u16()),
            ));
        }
        debug!(status = status.as_u16(), "Webhook payload delivered");
        Ok(())
    }
}

/// Hex HMAC-SHA256 over the payload bytes. Receivers verify against the
/// raw request body.
pub fn sign_payload(payload: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

// --- Telegram ---

/// Sends the text message through the Bot API. The decrypted secret slot
/// holds the bot token; the target is the chat id.
pub struct TelegramSender {
    client: Client,
    api_base: String,
}

impl TelegramSender {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            api_base: "https://api.telegram.org".to_string(),
        })
    }
}

#[async_trait]
impl PlatformSender for TelegramSender {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    async fn send(
        &self,
        target: &SecretString,
        secret: Option<&SecretString>,
        message: &RenderedMessage,
    ) -> SendResult {
        let RenderedMessage::Telegram { text } = message else {
            return Err(SendError::new(
                "telegram",
                SendErrorCategory::PlatformRejected,
                None,
            ));
        };
        let Some(token) = secret else {
            return Err(SendError::new(
                "telegram",
                SendErrorCategory::PlatformRejected,
                None,
            ));
        };
        if validate_bot_token(token.expose()).is_err() {
            return Err(SendError::new(
                "telegram",
                SendErrorCategory::PlatformRejected,
                None,
            ));
        }

        let url = format!("{}/bot{}/sendMessage", self.api_base, token.expose());
        let response = self
            .client
            .post(&url)
            .json(&json!({ "chat_id": target.expose(), "text": text }))
            .send()
            .await
            .map_err(|e| transport_error("telegram", &e))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(SendError::new(
                "telegram",
                SendErrorCategory::Http4xx,
                Some(status.as_u16()),
            ));
        }
        if status.is_server_error() {
            return Err(SendError::new(
                "telegram",
                SendErrorCategory::Http5xx,
                Some(status.as_u16()),
            ));
        }
        Ok(())
    }
}

// --- Email ---

/// External mail transport seam. Production wires an SMTP or provider
/// client here; tests substitute a recorder.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        text: &str,
    ) -> anyhow::Result<()>;
}

pub struct EmailSender {
    mailer: std::sync::Arc<dyn Mailer>,
}

impl EmailSender {
    pub fn new(mailer: std::sync::Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl PlatformSender for EmailSender {
    fn platform(&self) -> Platform {
        Platform::Email
    }

    async fn send(
        &self,
        target: &SecretString,
        _secret: Option<&SecretString>,
        message: &RenderedMessage,
    ) -> SendResult {
        let RenderedMessage::Email {
            subject,
            html,
            text,
        } = message
        else {
            return Err(SendError::new(
                "email",
                SendErrorCategory::PlatformRejected,
                None,
            ));
        };

        self.mailer
            .send_email(target.expose(), subject, html, text)
            .await
            .map_err(|_| SendError::new("email", SendErrorCategory::Network, None))
    }
}

/// Map a reqwest transport failure to a redacted category. The error
/// itself is never persisted; it may embed the endpoint URL.
fn transport_error(platform: &'static str, err: &reqwest::Error) -> SendError {
    let category = if err.is_timeout() {
        SendErrorCategory::Timeout
    } else if is_dns_failure(err) {
        SendErrorCategory::Dns
    } else {
        SendErrorCategory::Network
    };
    SendError::new(platform, category, None)
}

fn is_dns_failure(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if inner.to_string().contains("dns error") {
            return true;
        }
        source = inner.source();
    }
    false
}
