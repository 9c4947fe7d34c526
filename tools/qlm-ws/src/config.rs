// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway server configuration.

use qlm_core::{SessionConfig, StoreConfig};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Gateway server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port to listen on (default: 8000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum concurrent WebSocket connections
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Pending outbound messages per connection
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Pending updates per subscription
    #[serde(default = "default_subscription_queue_capacity")]
    pub subscription_queue_capacity: usize,

    /// How long a publish may wait on a full subscription queue (milliseconds)
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Maximum inbound frame size (bytes)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// How long a closing connection may take to flush queued frames (milliseconds)
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    8000
}

fn default_max_clients() -> usize {
    100
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_subscription_queue_capacity() -> usize {
    4096
}

fn default_publish_timeout_ms() -> u64 {
    1000
}

fn default_max_frame_size() -> usize {
    1024 * 1024 // 1 MB
}

fn default_flush_timeout_ms() -> u64 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_clients: default_max_clients(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            subscription_queue_capacity: default_subscription_queue_capacity(),
            publish_timeout_ms: default_publish_timeout_ms(),
            max_frame_size: default_max_frame_size(),
            flush_timeout_ms: default_flush_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Get publish timeout as Duration.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            subscription_queue_capacity: self.subscription_queue_capacity,
            publish_timeout: self.publish_timeout(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            outbound_queue_capacity: self.outbound_queue_capacity,
            max_frame_size: self.max_frame_size,
            flush_timeout: Duration::from_millis(self.flush_timeout_ms),
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port cannot be 0".into()));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients cannot be 0".into()));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue_capacity cannot be 0".into(),
            ));
        }
        if self.subscription_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "subscription_queue_capacity cannot be 0".into(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid("max_frame_size cannot be 0".into()));
        }
        if self.flush_timeout_ms == 0 {
            return Err(ConfigError::Invalid("flush_timeout_ms cannot be 0".into()));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid value: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:8000");
        assert_eq!(config.max_clients, 100);
        assert_eq!(config.store_config().subscription_queue_capacity, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: ServerConfig = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.outbound_queue_capacity, 256);
        assert_eq!(parsed.publish_timeout(), Duration::from_secs(1));
        assert_eq!(parsed.session_config().flush_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");

        let config = ServerConfig {
            port: 8123,
            max_clients: 5,
            ..Default::default()
        };
        config.to_file(&path).unwrap();

        let loaded = ServerConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = ServerConfig::from_file(&dir.path().join("nope.json"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ port: ").unwrap();
        assert!(matches!(
            ServerConfig::from_file(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let cases = [
            ServerConfig {
                port: 0,
                ..Default::default()
            },
            ServerConfig {
                max_clients: 0,
                ..Default::default()
            },
            ServerConfig {
                outbound_queue_capacity: 0,
                ..Default::default()
            },
            ServerConfig {
                subscription_queue_capacity: 0,
                ..Default::default()
            },
            ServerConfig {
                max_frame_size: 0,
                ..Default::default()
            },
            ServerConfig {
                flush_timeout_ms: 0,
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(config.validate().is_err(), "{:?}", config);
        }
    }
}
