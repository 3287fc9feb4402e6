//! Webhook delivery
//!
//! A message is written once with `*emphasis*` markers, then converted per
//! webhook into that endpoint's text format and payload shape.

use crate::config::{NotificationsConfig, WebhookConfig};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{error, info, warn};

/// Payload keys that receive the formatted message.
const MESSAGE_KEYS: [&str; 6] = ["text", "content", "message", "body", "formatted_body", "data"];

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Delivers `message` to every configured endpoint. Fails when at least
    /// one endpoint could not be reached after retries.
    async fn send(&self, message: &str) -> anyhow::Result<()>;

    /// Names of the enabled channels, for the startup summary.
    fn channels(&self) -> Vec<String>;
}

/// Status dots used in messages and the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DotStyle {
    pub orange: &'static str,
    pub green: &'static str,
    pub red: &'static str,
    pub yellow: &'static str,
}

impl DotStyle {
    pub fn round() -> Self {
        Self {
            orange: "\u{1F7E0}",
            green: "\u{1F7E2}",
            red: "\u{1F534}",
            yellow: "\u{1F7E1}",
        }
    }

    pub fn square() -> Self {
        Self {
            orange: "\u{1F7E7}",
            green: "\u{1F7E9}",
            red: "\u{1F7E5}",
            yellow: "\u{1F7E8}",
        }
    }

    pub fn is_round(&self) -> bool {
        *self == Self::round()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatMode {
    /// `*x*` to `<b>x</b>`, newlines to `<br>`
    Html,
    /// `*x*` to `_x_`
    Emphasis,
    /// `*` to `**`
    Markdown,
    /// Asterisks stripped
    Text,
    #[default]
    Simplified,
    #[serde(other)]
    Unknown,
}

impl FormatMode {
    pub fn apply(self, message: &str) -> String {
        match self {
            FormatMode::Html => wrap_emphasis(message, "<b>", "</b>").replace('\n', "<br>"),
            FormatMode::Emphasis => wrap_emphasis(message, "_", "_"),
            FormatMode::Markdown => message.replace('*', "**"),
            FormatMode::Text => message.replace('*', ""),
            FormatMode::Simplified => message.to_string(),
            FormatMode::Unknown => {
                error!("Unknown message format, sending message untouched");
                message.to_string()
            }
        }
    }

    fn line_break(self) -> &'static str {
        match self {
            FormatMode::Html => "<br>",
            _ => "\n",
        }
    }
}

/// Replaces each `*x*` pair. A trailing unpaired asterisk is kept literally.
fn wrap_emphasis(message: &str, open: &str, close: &str) -> String {
    let parts: Vec<&str> = message.split('*').collect();
    let paired = if parts.len() % 2 == 1 {
        parts.len()
    } else {
        parts.len() - 1
    };

    let mut out = String::with_capacity(message.len() + parts.len() * open.len());
    for (i, part) in parts[..paired].iter().enumerate() {
        if i % 2 == 1 {
            out.push_str(open);
            out.push_str(part);
            out.push_str(close);
        } else {
            out.push_str(part);
        }
    }
    if paired < parts.len() {
        out.push('*');
        out.push_str(parts[paired]);
    }
    out
}

/// Request body for one webhook.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    /// Raw UTF-8 body, for endpoints such as ntfy that take plain text
    Raw(String),
}

/// Fills a webhook's payload template with an already formatted message.
pub fn shape_payload(template: &Map<String, Value>, formatted: &str, mode: FormatMode) -> Body {
    let mut message = formatted.to_string();
    let mut payload = template.clone();

    // The title is split off before any other key reshapes the message.
    if template.contains_key("title") {
        let (title, rest) = message
            .split_once(mode.line_break())
            .map(|(t, r)| (t.to_string(), r.to_string()))
            .unwrap_or_else(|| (message.clone(), String::new()));
        payload.insert("title".to_string(), Value::String(title.replace('*', "")));
        message = rest;
    }
    if template.contains_key("extras") {
        message = message.replace('\n', "\n\n");
        payload.insert("message".to_string(), Value::String(message.clone()));
    }

    if template.contains_key("data") {
        return Body::Raw(message);
    }

    for key in MESSAGE_KEYS {
        if payload.contains_key(key) {
            payload.insert(key.to_string(), Value::String(message.clone()));
        }
    }
    Body::Json(Value::Object(payload))
}

/// `scheme://host....` so tokens embedded in webhook URLs never reach the log.
pub fn redact_url(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => format!(
            "{}://{}....",
            parsed.scheme(),
            parsed.host_str().unwrap_or_default()
        ),
        Err(_) => "<invalid url>".to_string(),
    }
}

/// Delivery attempts per webhook never exceed this, whatever the config says.
pub const MAX_ATTEMPTS: u32 = 5;

/// Posts messages to every enabled webhook with exponential backoff.
pub struct WebhookNotifier {
    http: reqwest::Client,
    webhooks: Vec<WebhookConfig>,
    attempts: u32,
    backoff_base: Duration,
}

impl WebhookNotifier {
    pub fn new(config: &NotificationsConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            webhooks: config.webhooks.iter().filter(|w| w.enabled).cloned().collect(),
            attempts: config.attempts.clamp(1, MAX_ATTEMPTS),
            backoff_base: config.backoff_base,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        self.backoff_base
            .mul_f64(2f64.powi(attempt as i32) + jitter)
    }

    async fn post_once(&self, webhook: &WebhookConfig, body: &Body) -> anyhow::Result<()> {
        let mut request = self.http.post(&webhook.url);
        for (name, value) in &webhook.headers {
            request = request.header(name, value);
        }
        request = match body {
            Body::Json(value) => request.json(value),
            Body::Raw(text) => request.body(text.clone().into_bytes()),
        };
        request.send().await?.error_for_status()?;
        Ok(())
    }

    async fn deliver(&self, webhook: &WebhookConfig, message: &str) -> anyhow::Result<()> {
        let formatted = webhook.format.apply(message);
        let body = shape_payload(&webhook.payload, &formatted, webhook.format);
        let target = redact_url(&webhook.url);

        for attempt in 0..self.attempts {
            match self.post_once(webhook, &body).await {
                Ok(()) => {
                    info!(webhook = %webhook.name, url = %target, "Notification delivered");
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        webhook = %webhook.name,
                        url = %target,
                        attempt = attempt + 1,
                        max_attempts = self.attempts,
                        error = %e,
                        "Notification attempt failed"
                    );
                    if attempt + 1 < self.attempts {
                        let delay = self.backoff(attempt);
                        warn!(delay_ms = delay.as_millis() as u64, "Retrying notification");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        anyhow::bail!(
            "failed to deliver to {} after {} attempts",
            target,
            self.attempts
        )
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn send(&self, message: &str) -> anyhow::Result<()> {
        let mut failed = Vec::new();
        for webhook in &self.webhooks {
            if let Err(e) = self.deliver(webhook, message).await {
                failed.push(format!("{}: {e}", webhook.name));
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("{}", failed.join("; "))
        }
    }

    fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.webhooks.iter().map(|w| w.name.clone()).collect();
        names.sort();
        names
    }
}
