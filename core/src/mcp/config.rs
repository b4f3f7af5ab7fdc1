//! Endpoint definitions and the configuration-store collaborator.
//!
//! The store owns persistence; connections hold a read-only copy of their
//! [`EndpointConfig`] and the manager writes state changes back through
//! [`ConfigStore`]. Batch mode coalesces every write made between
//! `begin_batch` and `end_batch` into a single persisted snapshot.

use super::error::{McpError, Result};
use super::types::{Prompt, Resource, Tool, DEFAULT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Which binding an endpoint is reached through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Child process speaking newline-delimited JSON on stdin/stdout
    Stdio,
    /// Server-Sent Events stream plus HTTP POST for outbound messages
    Sse,
    /// Full-duplex WebSocket
    #[serde(alias = "ws")]
    WebSocket,
}

/// Authentication scheme for network bindings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthScheme {
    #[default]
    None,
    Bearer,
    ApiKey,
    Basic,
}

/// Pre-supplied credentials; nothing here negotiates or refreshes tokens
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub scheme: AuthScheme,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Header used for `api-key` (defaults to `X-API-Key`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl AuthConfig {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            scheme: AuthScheme::Bearer,
            token: Some(token.into()),
            ..Default::default()
        }
    }

    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            scheme: AuthScheme::ApiKey,
            api_key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            scheme: AuthScheme::Basic,
            username: Some(username.into()),
            password: Some(password.into()),
            ..Default::default()
        }
    }
}

/// Per-endpoint timeout overrides (milliseconds)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointTimeouts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ms: Option<u64>,
}

/// Last discovered capabilities, kept so status can be reported offline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCache {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompts: Vec<Prompt>,
}

/// One remote endpoint speaking the protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Stable identifier
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub transport: TransportKind,

    /// Command to execute (stdio)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Base URL (sse / websocket)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub timeouts: EndpointTimeouts,
    /// MCP protocol version to request (defaults to latest supported)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cached: CapabilityCache,
}

fn default_enabled() -> bool {
    true
}

impl EndpointConfig {
    fn bare(id: impl Into<String>, transport: TransportKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            transport,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            url: None,
            headers: BTreeMap::new(),
            auth: AuthConfig::default(),
            timeouts: EndpointTimeouts::default(),
            protocol_version: None,
            last_error: None,
            last_connected: None,
            cached: CapabilityCache::default(),
        }
    }

    /// A child-process endpoint
    pub fn stdio(id: impl Into<String>, command: impl Into<String>) -> Self {
        let mut config = Self::bare(id, TransportKind::Stdio);
        config.command = Some(command.into());
        config
    }

    /// An event-stream endpoint rooted at `url`
    pub fn sse(id: impl Into<String>, url: impl Into<String>) -> Self {
        let mut config = Self::bare(id, TransportKind::Sse);
        config.url = Some(url.into());
        config
    }

    /// A WebSocket endpoint
    pub fn websocket(id: impl Into<String>, url: impl Into<String>) -> Self {
        let mut config = Self::bare(id, TransportKind::WebSocket);
        config.url = Some(url.into());
        config
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request_ms = Some(timeout.as_millis() as u64);
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Get the protocol version to use (configured or default)
    pub fn protocol_version(&self) -> &str {
        self.protocol_version
            .as_deref()
            .unwrap_or(DEFAULT_PROTOCOL_VERSION)
    }

    pub fn request_timeout(&self, default: Duration) -> Duration {
        self.timeouts
            .request_ms
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    pub fn connect_timeout(&self, default: Duration) -> Duration {
        self.timeouts
            .connect_ms
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// Check the binding parameters are usable
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(McpError::Config("endpoint id must not be empty".into()));
        }
        let version = self.protocol_version();
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
            return Err(McpError::Config(format!(
                "Unsupported protocol version: {}. Supported versions: {:?}",
                version, SUPPORTED_PROTOCOL_VERSIONS
            )));
        }
        match self.transport {
            TransportKind::Stdio => match self.command.as_deref().map(str::trim) {
                Some(cmd) if !cmd.is_empty() => Ok(()),
                _ => Err(McpError::Config(format!(
                    "endpoint '{}' uses stdio but has no command",
                    self.id
                ))),
            },
            TransportKind::Sse | TransportKind::WebSocket => {
                let url = self.url.as_deref().map(str::trim).unwrap_or_default();
                let valid = ["http://", "https://", "ws://", "wss://"]
                    .iter()
                    .any(|prefix| url.starts_with(prefix));
                if valid {
                    Ok(())
                } else {
                    Err(McpError::Config(format!(
                        "endpoint '{}' needs an http(s) or ws(s) url, got '{}'",
                        self.id, url
                    )))
                }
            }
        }
    }
}

// ==============================================================================
// Configuration store collaborator
// ==============================================================================

/// Persistence contract consumed by the client manager.
///
/// Mutations are persisted immediately unless a batch is open, in which case
/// they are deferred until the outermost `end_batch`.
pub trait ConfigStore: Send + Sync {
    /// Reload from the backing medium
    fn load(&self) -> Result<()>;

    /// Persist the current snapshot (deferred while batching)
    fn save(&self) -> Result<()>;

    fn begin_batch(&self);

    /// Close a batch; the outermost close flushes at most one write
    fn end_batch(&self) -> Result<()>;

    fn endpoints(&self) -> Vec<EndpointConfig>;

    fn get_endpoint(&self, id: &str) -> Option<EndpointConfig>;

    /// Apply `update` to the endpoint; returns false when it does not exist
    fn update_endpoint(&self, id: &str, update: &mut dyn FnMut(&mut EndpointConfig)) -> Result<bool>;

    fn add_endpoint(&self, config: EndpointConfig) -> Result<()>;

    fn remove_endpoint(&self, id: &str) -> Result<bool>;
}

/// In-memory store with batch semantics.
///
/// "Persisting" records the full snapshot and bumps a counter, which is what
/// tests observe. Last full snapshot wins; there is no per-field merge.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    state: RwLock<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    endpoints: Vec<EndpointConfig>,
    batch_depth: u32,
    dirty: bool,
    saves: u64,
    persisted: Vec<EndpointConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct EndpointsFile {
    #[serde(default)]
    endpoints: Vec<EndpointConfig>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoints(endpoints: Vec<EndpointConfig>) -> Self {
        let store = Self::default();
        if let Ok(mut state) = store.state.write() {
            state.persisted = endpoints.clone();
            state.endpoints = endpoints;
        }
        store
    }

    /// Parse `[[endpoints]]` tables
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: EndpointsFile =
            toml::from_str(text).map_err(|e| McpError::Config(format!("invalid endpoints file: {e}")))?;
        for endpoint in &file.endpoints {
            endpoint.validate()?;
        }
        Ok(Self::with_endpoints(file.endpoints))
    }

    /// Number of snapshots written so far
    pub fn save_count(&self) -> u64 {
        self.read().map(|s| s.saves).unwrap_or(0)
    }

    /// The last snapshot written
    pub fn persisted(&self) -> Vec<EndpointConfig> {
        self.read().map(|s| s.persisted.clone()).unwrap_or_default()
    }

    pub fn in_batch(&self) -> bool {
        self.read().map(|s| s.batch_depth > 0).unwrap_or(false)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>> {
        self.state
            .read()
            .map_err(|e| McpError::Config(format!("config store lock poisoned: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>> {
        self.state
            .write()
            .map_err(|e| McpError::Config(format!("config store lock poisoned: {e}")))
    }
}

impl StoreState {
    fn persist(&mut self) {
        if self.batch_depth > 0 {
            self.dirty = true;
            return;
        }
        self.persisted = self.endpoints.clone();
        self.saves += 1;
        self.dirty = false;
        tracing::debug!(target: "config_store", saves = self.saves, "Persisted endpoint snapshot");
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<()> {
        let mut state = self.write()?;
        state.endpoints = state.persisted.clone();
        state.dirty = false;
        Ok(())
    }

    fn save(&self) -> Result<()> {
        self.write()?.persist();
        Ok(())
    }

    fn begin_batch(&self) {
        if let Ok(mut state) = self.write() {
            state.batch_depth += 1;
        }
    }

    fn end_batch(&self) -> Result<()> {
        let mut state = self.write()?;
        state.batch_depth = state.batch_depth.saturating_sub(1);
        if state.batch_depth == 0 && state.dirty {
            state.persist();
        }
        Ok(())
    }

    fn endpoints(&self) -> Vec<EndpointConfig> {
        self.read().map(|s| s.endpoints.clone()).unwrap_or_default()
    }

    fn get_endpoint(&self, id: &str) -> Option<EndpointConfig> {
        self.read()
            .ok()
            .and_then(|s| s.endpoints.iter().find(|e| e.id == id).cloned())
    }

    fn update_endpoint(&self, id: &str, update: &mut dyn FnMut(&mut EndpointConfig)) -> Result<bool> {
        let mut state = self.write()?;
        let Some(endpoint) = state.endpoints.iter_mut().find(|e| e.id == id) else {
            return Ok(false);
        };
        update(endpoint);
        state.persist();
        Ok(true)
    }

    fn add_endpoint(&self, config: EndpointConfig) -> Result<()> {
        config.validate()?;
        let mut state = self.write()?;
        if state.endpoints.iter().any(|e| e.id == config.id) {
            return Err(McpError::Config(format!(
                "endpoint '{}' already exists",
                config.id
            )));
        }
        state.endpoints.push(config);
        state.persist();
        Ok(())
    }

    fn remove_endpoint(&self, id: &str) -> Result<bool> {
        let mut state = self.write()?;
        let before = state.endpoints.len();
        state.endpoints.retain(|e| e.id != id);
        let removed = state.endpoints.len() != before;
        if removed {
            state.persist();
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_endpoints_from_toml() {
        let toml_content = r#"
            [[endpoints]]
            id = "filesystem"
            transport = "stdio"
            command = "npx"
            args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]

            [[endpoints]]
            id = "remote"
            name = "Remote search"
            transport = "sse"
            url = "https://example.com/mcp"
            auth = { scheme = "bearer", token = "t0k" }

            [endpoints.timeouts]
            request_ms = 5000
        "#;

        let store = MemoryConfigStore::from_toml_str(toml_content).unwrap();
        let endpoints = store.endpoints();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].transport, TransportKind::Stdio);
        assert_eq!(endpoints[0].args.len(), 3);
        assert!(endpoints[0].enabled);
        assert_eq!(endpoints[1].auth.scheme, AuthScheme::Bearer);
        assert_eq!(
            endpoints[1].request_timeout(Duration::from_secs(30)),
            Duration::from_millis(5000)
        );
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_validate_rejects_missing_binding_parameters() {
        let mut stdio = EndpointConfig::stdio("a", "  ");
        assert!(stdio.validate().is_err());
        stdio.command = Some("node".into());
        assert!(stdio.validate().is_ok());

        assert!(EndpointConfig::sse("b", "ftp://nope").validate().is_err());
        assert!(EndpointConfig::websocket("c", "https://host").validate().is_ok());

        let mut bad_version = EndpointConfig::stdio("d", "node");
        bad_version.protocol_version = Some("1999-01-01".into());
        assert!(bad_version.validate().is_err());
    }

    #[test]
    fn test_batch_coalesces_writes() {
        let store = MemoryConfigStore::with_endpoints(vec![
            EndpointConfig::stdio("a", "node"),
            EndpointConfig::stdio("b", "node"),
        ]);

        store.begin_batch();
        store
            .update_endpoint("a", &mut |e| e.last_error = Some("boom".into()))
            .unwrap();
        store
            .update_endpoint("b", &mut |e| e.last_error = Some("bang".into()))
            .unwrap();
        assert_eq!(store.save_count(), 0);
        store.end_batch().unwrap();

        assert_eq!(store.save_count(), 1);
        let persisted = store.persisted();
        assert_eq!(persisted[0].last_error.as_deref(), Some("boom"));
        assert_eq!(persisted[1].last_error.as_deref(), Some("bang"));
    }

    #[test]
    fn test_nested_batches_flush_once_at_outermost_end() {
        let store = MemoryConfigStore::with_endpoints(vec![EndpointConfig::stdio("a", "node")]);
        store.begin_batch();
        store.begin_batch();
        store.update_endpoint("a", &mut |e| e.enabled = false).unwrap();
        store.end_batch().unwrap();
        assert_eq!(store.save_count(), 0);
        store.end_batch().unwrap();
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_empty_batch_writes_nothing() {
        let store = MemoryConfigStore::new();
        store.begin_batch();
        store.end_batch().unwrap();
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_update_unknown_endpoint_returns_false() {
        let store = MemoryConfigStore::new();
        assert!(!store.update_endpoint("ghost", &mut |_| {}).unwrap());
        assert_eq!(store.save_count(), 0);
    }
}
