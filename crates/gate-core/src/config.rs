//! Agent configuration: bind address, client version, channel range,
//! class declarations, and uberdogs.
//!
//! Loaded once from a JSON file at startup; every field has a default so a
//! minimal deployment can start from `{}`.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::channel::Channel;
use crate::dclass::ClassConfig;
use crate::uberdog::UberdogConfig;

/// Default client-facing bind address.
pub const DEFAULT_BIND: &str = "0.0.0.0:7198";

/// Default server version string matched against CLIENT_HELLO.
pub const DEFAULT_VERSION: &str = "dev";

/// Identity-channel range handed to the allocator.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelRange {
    pub min: Channel,
    pub max: Channel,
}

impl Default for ChannelRange {
    fn default() -> Self {
        Self { min: 0, max: 0 }
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// `host:port` the acceptor binds.
    pub bind: String,

    /// Version string clients must present.
    pub version: String,

    /// Identity channel range.
    pub channels: ChannelRange,

    /// Distributed class declarations, in hash order.
    pub classes: Vec<ClassConfig>,

    /// Well-known objects.
    pub uberdogs: Vec<UberdogConfig>,

    /// Optional UDP address of the event logger.
    pub eventlogger: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            version: DEFAULT_VERSION.to_string(),
            channels: ChannelRange::default(),
            classes: Vec::new(),
            uberdogs: Vec::new(),
            eventlogger: None,
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl AgentConfig {
    /// Loads configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let cfg: AgentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.bind, DEFAULT_BIND);
        assert_eq!(cfg.version, DEFAULT_VERSION);
        assert_eq!(cfg.channels.min, 0);
        assert_eq!(cfg.channels.max, 0);
        assert!(cfg.classes.is_empty());
        assert!(cfg.uberdogs.is_empty());
        assert!(cfg.eventlogger.is_none());
    }

    #[test]
    fn test_full_config_parses() {
        let cfg: AgentConfig = serde_json::from_str(
            r#"{
                "bind": "127.0.0.1:7199",
                "version": "v1",
                "channels": {"min": 1000, "max": 1999},
                "classes": [
                    {"name": "LoginManager", "fields": [
                        {"name": "login", "type": "string", "keywords": ["clsend"]}
                    ]}
                ],
                "uberdogs": [
                    {"id": 100, "class": "LoginManager", "anonymous": true}
                ],
                "eventlogger": "127.0.0.1:7197"
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.bind, "127.0.0.1:7199");
        assert_eq!(cfg.version, "v1");
        assert_eq!(cfg.channels.min, 1000);
        assert_eq!(cfg.channels.max, 1999);
        assert_eq!(cfg.classes.len(), 1);
        assert_eq!(cfg.uberdogs.len(), 1);
        assert!(cfg.uberdogs[0].anonymous);
        assert_eq!(cfg.eventlogger.as_deref(), Some("127.0.0.1:7197"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = serde_json::from_str::<AgentConfig>(r#"{"bindd": "x"}"#);
        assert!(err.is_err());
    }
}
