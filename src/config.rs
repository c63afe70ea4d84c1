//! Configuration management for Omnibox
//!
//! Configuration is loaded from a JSON file with environment variable
//! overrides. Provider credentials use the provider-native `WHATSAPP_*`
//! variable names; service-level settings use `OMNIBOX_*`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::error::Result;

/// Main configuration struct for Omnibox.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// SQLite database location
    pub database: DatabaseConfig,
    /// Cloud API credentials and endpoints
    pub cloud: CloudApiConfig,
    /// Session bridge connection settings
    pub session: SessionBridgeConfig,
    /// Inbound webhook HTTP surface
    pub webhook: WebhookConfig,
    /// Channel rows seeded by `omnibox init`
    pub channels: Vec<ChannelSeed>,
}

/// SQLite database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/omnibox.db".to_string(),
        }
    }
}

/// WhatsApp Cloud API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudApiConfig {
    /// Graph API access token
    pub api_token: String,
    /// Business phone number ID
    pub phone_number_id: String,
    /// Business account ID
    pub business_account_id: String,
    /// Graph API version
    pub api_version: String,
    /// Shared secret for webhook verification handshakes
    pub verify_token: String,
    /// Publicly reachable webhook URL; subscription itself is an external
    /// administrative step, this is only echoed in setup diagnostics
    pub webhook_url: Option<String>,
}

impl Default for CloudApiConfig {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            phone_number_id: String::new(),
            business_account_id: String::new(),
            api_version: default_api_version(),
            verify_token: String::new(),
            webhook_url: None,
        }
    }
}

fn default_api_version() -> String {
    "v21.0".to_string()
}

/// Session bridge configuration (paired-session integration).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionBridgeConfig {
    /// Base URL of the bridge command API
    pub bridge_url: String,
    /// Directory where the bridge persists pairing state, so restarts do not
    /// require scanning a new code
    pub session_path: String,
}

impl Default for SessionBridgeConfig {
    fn default() -> Self {
        Self {
            bridge_url: default_bridge_url(),
            session_path: "./data/sessions".to_string(),
        }
    }
}

fn default_bridge_url() -> String {
    "http://localhost:3001".to_string()
}

/// Inbound webhook HTTP surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Whether the webhook listener starts with `serve`
    pub enabled: bool,
    /// Address to bind the listener to
    pub bind_address: String,
    /// Port to listen on
    pub port: u16,
    /// URL path accepting webhook requests
    pub path: String,
    /// Channel the webhook routes deliveries to
    pub channel_id: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            path: "/webhooks/whatsapp".to_string(),
            channel_id: 1,
        }
    }
}

/// A channel row seeded into the database by `omnibox init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSeed {
    /// Unique channel name ("whatsapp", "whatsapp-cloud")
    pub name: String,
    /// Type tag
    #[serde(default = "default_channel_kind")]
    pub kind: String,
    /// Whether the channel starts active
    #[serde(default = "default_true")]
    pub active: bool,
    /// Free-form provider configuration (e.g. {"use_cloud_api": true})
    #[serde(default)]
    pub config: Value,
}

fn default_channel_kind() -> String {
    "messaging".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a JSON file with environment overrides.
    ///
    /// A missing file yields the default configuration so a bare environment
    /// (credentials via env vars only) still works.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        // Service-level settings
        if let Ok(val) = std::env::var("OMNIBOX_DATABASE_PATH") {
            self.database.path = val;
        }
        if let Ok(val) = std::env::var("OMNIBOX_WEBHOOK_BIND_ADDRESS") {
            self.webhook.bind_address = val;
        }
        if let Ok(val) = std::env::var("OMNIBOX_WEBHOOK_PORT") {
            if let Ok(v) = val.parse() {
                self.webhook.port = v;
            }
        }
        if let Ok(val) = std::env::var("OMNIBOX_WEBHOOK_PATH") {
            self.webhook.path = val;
        }

        // Cloud API credentials (provider-native names)
        if let Ok(val) = std::env::var("WHATSAPP_API_TOKEN") {
            self.cloud.api_token = val;
        }
        if let Ok(val) = std::env::var("WHATSAPP_PHONE_NUMBER_ID") {
            self.cloud.phone_number_id = val;
        }
        if let Ok(val) = std::env::var("WHATSAPP_BUSINESS_ACCOUNT_ID") {
            self.cloud.business_account_id = val;
        }
        if let Ok(val) = std::env::var("WHATSAPP_API_VERSION") {
            self.cloud.api_version = val;
        }
        if let Ok(val) = std::env::var("WHATSAPP_VERIFY_TOKEN") {
            self.cloud.verify_token = val;
        }
        if let Ok(val) = std::env::var("WHATSAPP_WEBHOOK_URL") {
            self.cloud.webhook_url = Some(val);
        }

        // Session bridge
        if let Ok(val) = std::env::var("WHATSAPP_SESSION_PATH") {
            self.session.session_path = val;
        }
        if let Ok(val) = std::env::var("WHATSAPP_BRIDGE_URL") {
            self.session.bridge_url = val;
        }
    }

    /// Whether channels named "whatsapp" should use the hosted Cloud API
    /// instead of the session bridge, unless the channel's own config says
    /// otherwise.
    pub fn use_cloud_api_default(&self) -> bool {
        std::env::var("WHATSAPP_USE_CLOUD_API")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.database.path, "./data/omnibox.db");
        assert_eq!(config.cloud.api_version, "v21.0");
        assert_eq!(config.session.bridge_url, "http://localhost:3001");
        assert_eq!(config.webhook.port, 8080);
        assert_eq!(config.webhook.channel_id, 1);
        assert!(config.webhook.enabled);
        assert!(config.channels.is_empty());
    }

    #[test]
    fn test_deserialize_partial() {
        let json = r#"{
            "cloud": { "api_token": "tok", "phone_number_id": "123" },
            "webhook": { "port": 9000 }
        }"#;
        let config: Config = serde_json::from_str(json).expect("should parse");
        assert_eq!(config.cloud.api_token, "tok");
        assert_eq!(config.cloud.phone_number_id, "123");
        // Untouched sections keep their defaults
        assert_eq!(config.cloud.api_version, "v21.0");
        assert_eq!(config.webhook.port, 9000);
        assert_eq!(config.webhook.path, "/webhooks/whatsapp");
    }

    #[test]
    fn test_channel_seed_defaults() {
        let json = r#"{ "name": "whatsapp" }"#;
        let seed: ChannelSeed = serde_json::from_str(json).expect("should parse");
        assert_eq!(seed.name, "whatsapp");
        assert_eq!(seed.kind, "messaging");
        assert!(seed.active);
        assert!(seed.config.is_null());
    }

    #[test]
    fn test_channel_seed_full() {
        let json = r#"{
            "name": "whatsapp",
            "kind": "messaging",
            "active": false,
            "config": { "use_cloud_api": true }
        }"#;
        let seed: ChannelSeed = serde_json::from_str(json).expect("should parse");
        assert!(!seed.active);
        assert_eq!(seed.config["use_cloud_api"], true);
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let config = Config::load_from_path(Path::new("/nonexistent/omnibox.json"))
            .expect("missing file should not error");
        assert_eq!(config.webhook.port, 8080);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"database": {"path": "/tmp/x.db"}}"#).unwrap();
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.database.path, "/tmp/x.db");
    }
}
