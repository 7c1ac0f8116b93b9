//! Engine configuration

mod serde_utils;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use braid_protocol::{
    DEFAULT_MAX_CHANNELS, DEFAULT_MAX_MESSAGES, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_WINDOW_SIZE,
    PROTOCOL_VERSION,
};

use crate::error::ConfigError;
use serde_utils::duration_secs;

/// Configuration for one side of a braid connection.
///
/// Everything here is a local preference; the values actually used are
/// negotiated down to the minimum of both sides during the handshake and
/// channel opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name advertised in the greeting and capability exchange
    pub endpoint_name: Option<String>,

    /// Highest protocol version to advertise
    pub protocol_version: u8,

    /// Default per-message window size offered on channel opens, in bytes
    pub window_size: u32,

    /// Default in-flight message cap per channel direction
    pub max_messages: u16,

    /// Maximum channels this side accepts inbound
    pub max_inbound_channels: u16,

    /// Maximum channels this side opens outbound
    pub max_outbound_channels: u16,

    /// Per-message total size cap, in bytes
    pub max_message_size: u64,

    /// Send a keepalive probe after this much write-side silence
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// How long a blocked sender waits for window credit before the
    /// message is cancelled
    #[serde(with = "duration_secs")]
    pub ack_timeout: Duration,

    /// Server-side cap on failed authentication attempts per connection
    pub auth_max_retries: u32,

    /// Refuse to proceed without a TLS upgrade
    pub require_tls: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint_name: None,
            protocol_version: PROTOCOL_VERSION,
            window_size: DEFAULT_WINDOW_SIZE,
            max_messages: DEFAULT_MAX_MESSAGES,
            max_inbound_channels: DEFAULT_MAX_CHANNELS,
            max_outbound_channels: DEFAULT_MAX_CHANNELS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            heartbeat_interval: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(30),
            auth_max_retries: 8,
            require_tls: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
        }
        std::fs::write(path, content)
            .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.window_size, 16 * 1024);
        assert_eq!(config.max_messages, 80);
        assert_eq!(config.max_inbound_channels, 24);
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("braid.toml");

        let mut config = EngineConfig::default();
        config.endpoint_name = Some("node1".to_string());
        config.window_size = 4096;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.endpoint_name.as_deref(), Some("node1"));
        assert_eq!(loaded.window_size, 4096);
        assert_eq!(loaded.max_messages, 80);
    }

    #[test]
    fn test_missing_file() {
        let result = EngineConfig::load(Path::new("/nonexistent/braid.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str("window_size = 1024").unwrap();
        assert_eq!(config.window_size, 1024);
        assert_eq!(config.max_messages, 80);
        assert!(!config.require_tls);
    }
}
