//! Per-platform payload rendering.
//!
//! Renders are deterministic: the event id is derived from the job id and
//! `generated_at` from the window end, so re-rendering the same job after
//! a retry produces byte-identical output.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

use newsflow_common::Platform;

use crate::error::Result;

const TELEGRAM_TITLE_CAP: usize = 10;
const EMAIL_LINE_CAP: usize = 20;

/// One article as it appears in a rendered payload.
#[derive(Debug, Clone, Serialize)]
pub struct RenderItem {
    pub article_id: Uuid,
    pub title: String,
    pub url: String,
    pub source_name: String,
    pub published_at: DateTime<Utc>,
    pub topics: Vec<String>,
}

/// Everything a renderer needs. All of it comes from the job row and its
/// items, never from the clock.
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub job_id: Uuid,
    pub source_id: Uuid,
    pub source_name: String,
    pub window_end: DateTime<Utc>,
    pub items: Vec<RenderItem>,
}

/// A rendered message, ready for its platform sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedMessage {
    Https { body: Vec<u8> },
    Telegram { text: String },
    Email { subject: String, html: String, text: String },
}

#[derive(Serialize)]
struct HttpsEnvelope<'a> {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    generated_at: String,
    source: SourceRef<'a>,
    data: EnvelopeData<'a>,
}

#[derive(Serialize)]
struct SourceRef<'a> {
    id: Uuid,
    name: &'a str,
}

#[derive(Serialize)]
struct EnvelopeData<'a> {
    items_new: &'a [RenderItem],
    count: usize,
}

pub fn render(platform: Platform, ctx: &RenderContext) -> Result<RenderedMessage> {
    Ok(match platform {
        Platform::Https => RenderedMessage::Https {
            body: render_https(ctx)?,
        },
        Platform::Telegram => RenderedMessage::Telegram {
            text: render_telegram(ctx),
        },
        Platform::Email => render_email(ctx),
    })
}

fn render_https(ctx: &RenderContext) -> Result<Vec<u8>> {
    let envelope = HttpsEnvelope {
        id: event_id(ctx.job_id),
        kind: "feed_update",
        generated_at: ctx.window_end.to_rfc3339_opts(SecondsFormat::Secs, true),
        source: SourceRef {
            id: ctx.source_id,
            name: &ctx.source_name,
        },
        data: EnvelopeData {
            items_new: &ctx.items,
            count: ctx.items.len(),
        },
    };
    Ok(serde_json::to_vec(&envelope).map_err(anyhow::Error::from)?)
}

fn render_telegram(ctx: &RenderContext) -> String {
    let mut text = format!("{}: {} new articles", ctx.source_name, ctx.items.len());
    for item in ctx.items.iter().take(TELEGRAM_TITLE_CAP) {
        text.push_str("\n- ");
        text.push_str(&item.title);
    }
    text
}

fn render_email(ctx: &RenderContext) -> RenderedMessage {
    let subject = format!("{}: {} new articles", ctx.source_name, ctx.items.len());
    let lines: Vec<String> = ctx
        .items
        .iter()
        .take(EMAIL_LINE_CAP)
        .map(|item| format!("- {} ({})", item.title, item.url))
        .collect();
    let text = if lines.is_empty() {
        "No new items.".to_string()
    } else {
        lines.join("\n")
    };
    let html = if lines.is_empty() {
        "No new items.".to_string()
    } else {
        lines
            .iter()
            .map(|line| escape_html(line))
            .collect::<Vec<_>>()
            .join("<br/>")
    };
    RenderedMessage::Email {
        subject,
        html,
        text,
    }
}

/// Stable per-job event id, in the `evt_` + 16 hex digit shape consumers
/// already parse.
fn event_id(job_id: Uuid) -> String {
    format!("evt_{}", &job_id.simple().to_string()[..16])
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RenderContext {
        let published = "2026-07-01T12:00:00Z".parse().unwrap();
        RenderContext {
            job_id: Uuid::parse_str("0192f0c1-2345-7890-abcd-ef0123456789").unwrap(),
            source_id: Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap(),
            source_name: "Tech Digest".into(),
            window_end: "2026-07-01T12:34:56Z".parse().unwrap(),
            items: vec![RenderItem {
                article_id: Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap(),
                title: "Chips & <markets>".into(),
                url: "https://news.example.com/chips".into(),
                source_name: "Wire".into(),
                published_at: published,
                topics: vec!["tech".into()],
            }],
        }
    }

    #[test]
    fn https_render_is_deterministic() {
        let a = render(Platform::Https, &ctx()).unwrap();
        let b = render(Platform::Https, &ctx()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn event_id_derived_from_job_id() {
        let RenderedMessage::Https { body } = render(Platform::Https, &ctx()).unwrap() else {
            panic!("expected https render");
        };
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["id"], "evt_0192f0c123457890");
        assert_eq!(parsed["type"], "feed_update");
        assert_eq!(parsed["generated_at"], "2026-07-01T12:34:56Z");
        assert_eq!(parsed["data"]["count"], 1);
    }

    #[test]
    fn telegram_caps_title_lines() {
        let mut context = ctx();
        let item = context.items[0].clone();
        context.items = (0..15)
            .map(|i| {
                let mut it = item.clone();
                it.title = format!("Story {i}");
                it
            })
            .collect();
        let RenderedMessage::Telegram { text } = render(Platform::Telegram, &context).unwrap()
        else {
            panic!("expected telegram render");
        };
        assert!(text.starts_with("Tech Digest: 15 new articles"));
        assert_eq!(text.lines().count(), 1 + TELEGRAM_TITLE_CAP);
    }

    #[test]
    fn email_escapes_html() {
        let RenderedMessage::Email { subject, html, text } =
            render(Platform::Email, &ctx()).unwrap()
        else {
            panic!("expected email render");
        };
        assert_eq!(subject, "Tech Digest: 1 new articles");
        assert!(html.contains("&amp;"));
        assert!(html.contains("&lt;markets&gt;"));
        assert!(text.contains("Chips & <markets>"));
    }
}
