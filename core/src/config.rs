use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::mcp::backoff::ReconnectPolicy;
use crate::mcp::config::EndpointConfig;
use crate::mcp::connection::ConnectionOptions;
use crate::mcp::manager::ManagerOptions;
use crate::mcp::types::ClientInfo;

/// Runtime settings shared by the client manager and the relay
#[derive(Clone, Debug)]
pub struct TetherConfig {
    /// Name announced in `clientInfo` during the handshake
    pub client_name: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_attempts: u32,
    pub index_debounce_ms: u64,
    /// Endpoints declared in the TOML file (`[[endpoints]]`)
    pub endpoints: Vec<EndpointConfig>,
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            client_name: std::env::var("TETHER_CLIENT_NAME")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "tether".to_string()),
            request_timeout_ms: env_u64("TETHER_REQUEST_TIMEOUT_MS", 30_000),
            connect_timeout_ms: env_u64("TETHER_CONNECT_TIMEOUT_MS", 30_000),
            reconnect_base_ms: env_u64("TETHER_RECONNECT_BASE_MS", 1_000),
            reconnect_max_attempts: std::env::var("TETHER_RECONNECT_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(5),
            index_debounce_ms: env_u64("TETHER_INDEX_DEBOUNCE_MS", 100),
            endpoints: Vec::new(),
        }
    }
}

impl TetherConfig {
    /// Load configuration from a TOML file (path via TETHER_CONFIG or ./tether.toml),
    /// overlaying values onto the env-driven defaults.
    pub fn load() -> Self {
        let path = std::env::var("TETHER_CONFIG").unwrap_or_else(|_| "tether.toml".into());
        Self::load_from(&path)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let default = Self::default();
        let p = path.as_ref();
        if !p.exists() {
            tracing::info!(target: "config_store", path = %p.display(), "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match Self::overlay_toml(&s, default.clone()) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(target: "config_store", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "config_store", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    /// Apply a TOML document on top of `base`; unset keys keep their base value
    pub fn overlay_toml(text: &str, base: Self) -> Result<Self, toml::de::Error> {
        let parsed: TetherToml = toml::from_str(text)?;
        Ok(parsed.overlay(base))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_base_ms),
            self.reconnect_max_attempts,
        )
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            client_info: ClientInfo {
                name: self.client_name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            request_timeout: self.request_timeout(),
            connect_timeout: self.connect_timeout(),
            reconnect: self.reconnect_policy(),
            ..Default::default()
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            connection: self.connection_options(),
            index_debounce: Duration::from_millis(self.index_debounce_ms),
        }
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct TetherToml {
    client: Option<ClientToml>,
    #[serde(default)]
    endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ClientToml {
    name: Option<String>,
    request_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    reconnect_base_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    index_debounce_ms: Option<u64>,
}

impl TetherToml {
    fn overlay(self, mut base: TetherConfig) -> TetherConfig {
        if let Some(c) = self.client {
            if let Some(v) = c.name {
                base.client_name = v;
            }
            if let Some(v) = c.request_timeout_ms {
                base.request_timeout_ms = v;
            }
            if let Some(v) = c.connect_timeout_ms {
                base.connect_timeout_ms = v;
            }
            if let Some(v) = c.reconnect_base_ms {
                base.reconnect_base_ms = v;
            }
            if let Some(v) = c.reconnect_max_attempts {
                base.reconnect_max_attempts = v;
            }
            if let Some(v) = c.index_debounce_ms {
                base.index_debounce_ms = v;
            }
        }
        if !self.endpoints.is_empty() {
            base.endpoints = self.endpoints;
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::config::TransportKind;

    fn base() -> TetherConfig {
        TetherConfig {
            client_name: "tether".into(),
            request_timeout_ms: 30_000,
            connect_timeout_ms: 30_000,
            reconnect_base_ms: 1_000,
            reconnect_max_attempts: 5,
            index_debounce_ms: 100,
            endpoints: Vec::new(),
        }
    }

    #[test]
    fn test_overlay_keeps_unset_values() {
        let text = r#"
            [client]
            name = "relay"
            request_timeout_ms = 5000

            [[endpoints]]
            id = "files"
            transport = "stdio"
            command = "fs-server"
            args = ["--root", "/tmp"]

            [[endpoints]]
            id = "search"
            transport = "ws"
            url = "https://search.example.com"
        "#;
        let config = TetherConfig::overlay_toml(text, base()).unwrap();
        assert_eq!(config.client_name, "relay");
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.connect_timeout_ms, 30_000);
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[1].transport, TransportKind::WebSocket);
    }

    #[test]
    fn test_manager_options_carry_settings() {
        let mut config = base();
        config.reconnect_base_ms = 250;
        config.reconnect_max_attempts = 2;
        config.index_debounce_ms = 10;

        let options = config.manager_options();
        assert_eq!(options.index_debounce, Duration::from_millis(10));
        assert_eq!(options.connection.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(options.connection.reconnect.max_attempts, 2);
        assert_eq!(options.connection.client_info.name, "tether");
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        assert!(TetherConfig::overlay_toml("[client\nname = 1", base()).is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = TetherConfig::load_from("/nonexistent/tether.toml");
        assert!(config.endpoints.is_empty());
    }
}
