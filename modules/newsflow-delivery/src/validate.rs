//! Target and credential validation for webhook endpoints.
//!
//! HTTPS targets go through SSRF screening before they are accepted:
//! the scheme must be https, the host must not be a known-internal name,
//! and literal IP hosts must not fall in a private or reserved range.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;

use newsflow_common::Platform;

use crate::error::{DeliveryError, Result};

static TELEGRAM_BOT_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+:[A-Za-z0-9_-]{35}$").unwrap());
static TELEGRAM_CHAT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(-?\d{1,20}|@[A-Za-z0-9_]{5,64})$").unwrap());

const MAX_EMAIL_LEN: usize = 320;

/// Screens HTTPS webhook targets against internal and private networks.
#[derive(Debug, Clone)]
pub struct TargetValidator {
    blocked_hosts: HashSet<String>,
    blocked_cidrs: Vec<ipnet::IpNet>,
}

impl Default for TargetValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetValidator {
    pub fn new() -> Self {
        Self {
            blocked_hosts: [
                "localhost",
                "127.0.0.1",
                "::1",
                "[::1]",
                "0.0.0.0",
                "metadata.google.internal",
                "metadata.gke.internal",
                "instance-data",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            blocked_cidrs: vec![
                "10.0.0.0/8".parse().unwrap(),
                "172.16.0.0/12".parse().unwrap(),
                "192.168.0.0/16".parse().unwrap(),
                "169.254.0.0/16".parse().unwrap(), // Link-local / cloud metadata
                "127.0.0.0/8".parse().unwrap(),    // Loopback
                "0.0.0.0/8".parse().unwrap(),      // Unspecified
                "224.0.0.0/4".parse().unwrap(),    // Multicast
                "::1/128".parse().unwrap(),        // IPv6 loopback
                "fc00::/7".parse().unwrap(),       // IPv6 private
                "fe80::/10".parse().unwrap(),      // IPv6 link-local
            ],
        }
    }

    /// Validate a delivery target for the given platform.
    pub fn validate_target(&self, platform: Platform, target: &str) -> Result<()> {
        match platform {
            Platform::Email => validate_email(target),
            Platform::Telegram => validate_chat_id(target),
            Platform::Https => self.validate_https_url(target),
        }
    }

    fn validate_https_url(&self, target: &str) -> Result<()> {
        let parsed = url::Url::parse(target)
            .map_err(|e| DeliveryError::Validation(format!("invalid webhook URL: {e}")))?;

        if parsed.scheme() != "https" {
            return Err(DeliveryError::Validation(
                "webhook target must use HTTPS".into(),
            ));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| DeliveryError::Validation("webhook target hostname is required".into()))?;

        if self.blocked_hosts.contains(host) {
            return Err(DeliveryError::Validation(format!(
                "webhook target host is blocked: {host}"
            )));
        }

        if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            for cidr in &self.blocked_cidrs {
                if cidr.contains(&ip) {
                    return Err(DeliveryError::Validation(format!(
                        "webhook target resolves to a blocked network: {ip}"
                    )));
                }
            }
        }

        Ok(())
    }
}

fn validate_email(target: &str) -> Result<()> {
    let trimmed = target.trim();
    let (local, domain) = trimmed
        .split_once('@')
        .ok_or_else(|| DeliveryError::Validation("invalid email target".into()))?;
    if local.is_empty() || domain.is_empty() || !domain.contains('.') || trimmed.len() > MAX_EMAIL_LEN
    {
        return Err(DeliveryError::Validation("invalid email target".into()));
    }
    Ok(())
}

fn validate_chat_id(target: &str) -> Result<()> {
    let candidate = target.trim();
    if candidate.is_empty() || !TELEGRAM_CHAT_ID.is_match(candidate) {
        return Err(DeliveryError::Validation(
            "Telegram target must be a numeric chat id or @channel username".into(),
        ));
    }
    Ok(())
}

/// Telegram webhooks carry the bot token in the secret slot.
pub fn validate_bot_token(token: &str) -> Result<()> {
    let token = token.trim();
    if token.is_empty() {
        return Err(DeliveryError::Validation(
            "Telegram webhook requires a bot token secret".into(),
        ));
    }
    if !TELEGRAM_BOT_TOKEN.is_match(token) {
        return Err(DeliveryError::Validation(
            "Telegram bot token format is invalid".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TargetValidator {
        TargetValidator::new()
    }

    #[test]
    fn accepts_public_https_target() {
        assert!(validator()
            .validate_target(Platform::Https, "https://hooks.example.com/ingest")
            .is_ok());
    }

    #[test]
    fn rejects_plain_http() {
        assert!(validator()
            .validate_target(Platform::Https, "http://hooks.example.com/ingest")
            .is_err());
    }

    #[test]
    fn rejects_internal_hosts() {
        let v = validator();
        for target in [
            "https://localhost/hook",
            "https://127.0.0.1/hook",
            "https://10.1.2.3/hook",
            "https://192.168.1.10/hook",
            "https://169.254.169.254/latest/meta-data",
            "https://metadata.google.internal/computeMetadata",
        ] {
            assert!(v.validate_target(Platform::Https, target).is_err(), "{target}");
        }
    }

    #[test]
    fn email_shape_checked() {
        let v = validator();
        assert!(v.validate_target(Platform::Email, "reader@example.com").is_ok());
        assert!(v.validate_target(Platform::Email, "no-at-sign").is_err());
        assert!(v.validate_target(Platform::Email, "user@").is_err());
        assert!(v.validate_target(Platform::Email, "@example.com").is_err());
    }

    #[test]
    fn telegram_chat_ids() {
        let v = validator();
        assert!(v.validate_target(Platform::Telegram, "123456789").is_ok());
        assert!(v.validate_target(Platform::Telegram, "-1001234567890").is_ok());
        assert!(v.validate_target(Platform::Telegram, "@newsroom_feed").is_ok());
        assert!(v.validate_target(Platform::Telegram, "@abc").is_err());
        assert!(v.validate_target(Platform::Telegram, "not a chat").is_err());
    }

    #[test]
    fn telegram_bot_tokens() {
        assert!(validate_bot_token("123456:ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghi").is_ok());
        assert!(validate_bot_token("123456:short").is_err());
        assert!(validate_bot_token("").is_err());
        assert!(validate_bot_token("nodigits:ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghi").is_err());
    }
}
