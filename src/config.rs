use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::typing::TypingConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/echos.json";
pub const DEFAULT_SERVICE_TYPE: &str = "echos-chat";
pub const DEFAULT_DISPLAY_NAME: &str = "echos-device";
pub const DEFAULT_LISTEN_ADDR: &str = "/ip4/0.0.0.0/tcp/0";

/// Longest display name peers will accept, in UTF-8 bytes.
pub const MAX_DISPLAY_NAME_BYTES: usize = 63;
const MAX_SERVICE_TYPE_LEN: usize = 15;

static SERVICE_TYPE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("service type pattern is valid")
});

/// Identifier scoping discovery to this application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceType(String);

impl ServiceType {
    pub fn new(value: impl Into<String>) -> Result<Self, ConfigError> {
        let value = value.into();
        if value.is_empty()
            || value.len() > MAX_SERVICE_TYPE_LEN
            || !SERVICE_TYPE_PATTERN.is_match(&value)
        {
            return Err(ConfigError::InvalidServiceType(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ServiceType {
    fn default() -> Self {
        Self(DEFAULT_SERVICE_TYPE.to_string())
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub service_type: String,
    /// Falls back to the host name when unset.
    pub display_name: Option<String>,
    pub typing_debounce_ms: u64,
    pub typing_timeout_ms: u64,
    /// How long a remote "is typing" indicator survives without a stop.
    pub remote_typing_timeout_ms: u64,
    pub event_buffer: usize,
    pub auto_invite: bool,
    pub auto_accept: bool,
    pub listen_addr: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            display_name: None,
            typing_debounce_ms: 300,
            typing_timeout_ms: 3_000,
            remote_typing_timeout_ms: 3_000,
            event_buffer: crate::hub::DEFAULT_EVENT_BUFFER,
            auto_invite: true,
            auto_accept: true,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
        }
    }
}

impl ChatConfig {
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn service(&self) -> Result<ServiceType, ConfigError> {
        ServiceType::new(self.service_type.clone())
    }

    pub fn resolved_display_name(&self) -> Result<String, ConfigError> {
        let raw = match &self.display_name {
            Some(name) => name.clone(),
            None => std::env::var("HOSTNAME").unwrap_or_else(|_| DEFAULT_DISPLAY_NAME.to_string()),
        };
        normalize_display_name(&raw)
    }

    pub fn typing(&self) -> TypingConfig {
        TypingConfig {
            debounce: Duration::from_millis(self.typing_debounce_ms),
            inactivity: Duration::from_millis(self.typing_timeout_ms),
            remote_expiry: Duration::from_millis(self.remote_typing_timeout_ms),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(service) = std::env::var("ECHOS_SERVICE_TYPE") {
            self.service_type = service;
        }
        if let Ok(name) = std::env::var("ECHOS_DISPLAY_NAME") {
            self.display_name = Some(name);
        }
    }
}

/// Trim, reject empty, and cut to [`MAX_DISPLAY_NAME_BYTES`] on a character
/// boundary.
pub fn normalize_display_name(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyDisplayName);
    }
    let mut end = trimmed.len().min(MAX_DISPLAY_NAME_BYTES);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    Ok(trimmed[..end].to_string())
}

/// Load the JSON config at `path`, then apply environment overrides. A
/// missing or broken file means defaults.
pub fn load_config(path: &str) -> ChatConfig {
    let path = Path::new(path);
    let mut config = match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<ChatConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Failed to parse config file {}: {err}", path.display());
                ChatConfig::default()
            }
        },
        Err(err) => {
            log::info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            ChatConfig::default()
        }
    };
    config.apply_env_overrides();
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_rules() {
        for ok in ["echos-chat", "a", "chat2", "a-b-c", "abcdefghijklmno"] {
            assert!(ServiceType::new(ok).is_ok(), "{ok} should be valid");
        }
        for bad in [
            "",
            "-chat",
            "chat-",
            "echos--chat",
            "Echos",
            "echos_chat",
            "abcdefghijklmnop",
        ] {
            assert_eq!(
                ServiceType::new(bad),
                Err(ConfigError::InvalidServiceType(bad.to_string()))
            );
        }
    }

    #[test]
    fn display_name_is_trimmed_and_bounded() {
        assert_eq!(normalize_display_name("  iPad  ").unwrap(), "iPad");
        assert_eq!(
            normalize_display_name("   "),
            Err(ConfigError::EmptyDisplayName)
        );

        let long = "ж".repeat(40);
        let name = normalize_display_name(&long).unwrap();
        assert!(name.len() <= MAX_DISPLAY_NAME_BYTES);
        assert_eq!(name.chars().count(), 31);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ChatConfig =
            serde_json::from_str(r#"{"display_name":"desk","auto_accept":false}"#).unwrap();
        assert_eq!(config.display_name.as_deref(), Some("desk"));
        assert!(!config.auto_accept);
        assert!(config.auto_invite);
        assert_eq!(config.service_type, DEFAULT_SERVICE_TYPE);
        assert_eq!(config.typing().debounce, Duration::from_millis(300));
        assert_eq!(config.typing().inactivity, Duration::from_secs(3));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config("/nonexistent/echos.json");
        assert_eq!(config.typing_timeout_ms, 3_000);
    }
}
