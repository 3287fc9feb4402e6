//! Agent configuration
//!
//! Loaded once at startup from a JSON file and passed into each component.
//! Nothing reads configuration from process-wide state after this point.

use crate::notifier::{DotStyle, FormatMode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Errors raised while loading or validating the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid webhook '{name}': {reason}")]
    InvalidWebhook { name: String, reason: String },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Send a summary of the running configuration once at startup
    pub startup_message: bool,
    /// Round dots when true, square dots otherwise
    pub default_dot_style: bool,
    pub schedule: ScheduleConfig,
    pub registry: RegistryConfig,
    pub remediation: RemediationConfig,
    pub notifications: NotificationsConfig,
    pub status: StatusConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            startup_message: true,
            default_dot_style: true,
            schedule: ScheduleConfig::default(),
            registry: RegistryConfig::default(),
            remediation: RemediationConfig::default(),
            notifications: NotificationsConfig::default(),
            status: StatusConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads and validates the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for webhook in self.notifications.webhooks.iter().filter(|w| w.enabled) {
            if !(webhook.url.starts_with("http://") || webhook.url.starts_with("https://")) {
                return Err(ConfigError::InvalidWebhook {
                    name: webhook.name.clone(),
                    reason: format!("url must be http(s), got '{}'", webhook.url),
                });
            }
        }
        Ok(())
    }

    pub fn dots(&self) -> DotStyle {
        if self.default_dot_style {
            DotStyle::round()
        } else {
            DotStyle::square()
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Daily `HH:MM` anchors at which remediation runs
    pub anchors: Vec<String>,
    /// Minimum distance between any two check times, in minutes
    pub spacing_minutes: u32,
    /// When false the anchors only trigger checks
    pub remediation: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            anchors: vec!["03:00".to_string()],
            spacing_minutes: 40,
            remediation: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub attempts: u32,
    #[serde(rename = "retry_delay_secs", with = "secs")]
    pub retry_delay: Duration,
    #[serde(rename = "connect_timeout_secs", with = "secs")]
    pub connect_timeout: Duration,
    #[serde(rename = "request_timeout_secs", with = "secs")]
    pub request_timeout: Duration,
    /// URL scheme used to reach registries; only overridden for local registries
    pub scheme: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(20),
            scheme: "https".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RemediationConfig {
    #[serde(rename = "running_timeout_secs", with = "secs")]
    pub running_timeout: Duration,
    #[serde(rename = "poll_interval_secs", with = "secs")]
    pub poll_interval: Duration,
    #[serde(rename = "settle_secs", with = "secs")]
    pub settle: Duration,
    #[serde(rename = "image_removal_timeout_secs", with = "secs")]
    pub image_removal_timeout: Duration,
    /// Grace period handed to the runtime when stopping a container
    pub stop_timeout_secs: i64,
    /// Candidate compose file names looked up in a project's working directory
    pub compose_files: Vec<String>,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            running_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            settle: Duration::from_secs(5),
            image_removal_timeout: Duration::from_secs(30),
            stop_timeout_secs: 30,
            compose_files: vec![
                "docker-compose.yml".to_string(),
                "docker-compose.yaml".to_string(),
                "compose.yml".to_string(),
                "compose.yaml".to_string(),
            ],
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub webhooks: Vec<WebhookConfig>,
    pub attempts: u32,
    #[serde(rename = "backoff_base_secs", with = "secs")]
    pub backoff_base: Duration,
    #[serde(rename = "connect_timeout_secs", with = "secs")]
    pub connect_timeout: Duration,
    #[serde(rename = "request_timeout_secs", with = "secs")]
    pub request_timeout: Duration,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            webhooks: Vec::new(),
            attempts: 5,
            backoff_base: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(20),
        }
    }
}

/// One webhook endpoint with its own payload shape and formatting mode.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_name")]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_payload")]
    pub payload: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub format: FormatMode,
}

fn default_webhook_name() -> String {
    "webhook".to_string()
}

fn default_true() -> bool {
    true
}

fn default_payload() -> serde_json::Map<String, serde_json::Value> {
    let mut payload = serde_json::Map::new();
    payload.insert("text".to_string(), serde_json::Value::String(String::new()));
    payload
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:5151".to_string(),
        }
    }
}

/// Durations written as (fractional) seconds in the config file.
mod secs {
    use super::*;
    use serde::de::Error;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(D::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {secs}"
            )));
        }
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = AppConfig::from_json("{}").unwrap();
        assert!(config.startup_message);
        assert_eq!(config.schedule.anchors, vec!["03:00".to_string()]);
        assert_eq!(config.schedule.spacing_minutes, 40);
        assert_eq!(config.registry.attempts, 3);
        assert_eq!(config.registry.retry_delay, Duration::from_secs(2));
        assert_eq!(config.notifications.attempts, 5);
        assert_eq!(config.remediation.compose_files.len(), 4);
        assert_eq!(config.status.bind, "0.0.0.0:5151");
    }

    #[test]
    fn test_full_config_parses() {
        let raw = r#"{
            "startup_message": false,
            "default_dot_style": false,
            "schedule": { "anchors": ["02:00", "14:00"], "spacing_minutes": 30, "remediation": true },
            "registry": { "retry_delay_secs": 0.5 },
            "remediation": { "settle_secs": 1, "compose_files": ["stack.yml"] },
            "notifications": {
                "webhooks": [
                    {
                        "name": "telegram",
                        "url": "https://api.telegram.org/botX/sendMessage",
                        "payload": { "chat_id": "42", "text": "", "parse_mode": "HTML" },
                        "format": "html"
                    },
                    { "name": "ntfy", "enabled": false, "url": "not-a-url" }
                ]
            }
        }"#;

        let config = AppConfig::from_json(raw).unwrap();
        assert!(!config.startup_message);
        assert!(config.schedule.remediation);
        assert_eq!(config.registry.retry_delay, Duration::from_millis(500));
        assert_eq!(config.remediation.settle, Duration::from_secs(1));
        assert_eq!(config.remediation.compose_files, vec!["stack.yml".to_string()]);

        let enabled: Vec<&WebhookConfig> = config
            .notifications
            .webhooks
            .iter()
            .filter(|w| w.enabled)
            .collect();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "telegram");
        assert_eq!(enabled[0].format, FormatMode::Html);
        assert_eq!(config.dots(), DotStyle::square());
    }

    #[test]
    fn test_enabled_webhook_requires_http_url() {
        let raw = r#"{ "notifications": { "webhooks": [ { "name": "bad", "url": "ftp://x" } ] } }"#;
        match AppConfig::from_json(raw) {
            Err(ConfigError::InvalidWebhook { name, .. }) => assert_eq!(name, "bad"),
            other => panic!("expected InvalidWebhook, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_duration_rejected() {
        let raw = r#"{ "registry": { "retry_delay_secs": 1e300 } }"#;
        assert!(matches!(
            AppConfig::from_json(raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_negative_duration_rejected() {
        let raw = r#"{ "registry": { "retry_delay_secs": -1 } }"#;
        assert!(matches!(
            AppConfig::from_json(raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("config.json");
        assert!(matches!(
            AppConfig::load(&missing),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_webhook_default_payload_carries_text() {
        let raw = r#"{ "notifications": { "webhooks": [ { "url": "https://hooks.example/x" } ] } }"#;
        let config = AppConfig::from_json(raw).unwrap();
        let webhook = &config.notifications.webhooks[0];
        assert_eq!(webhook.name, "webhook");
        assert!(webhook.payload.contains_key("text"));
        assert_eq!(webhook.format, FormatMode::Simplified);
    }
}
