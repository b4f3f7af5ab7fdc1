/// Connection state machine for one remote endpoint
///
/// A `Connection` owns exactly one transport at a time. It drives the
/// `initialize` handshake, discovers declared capabilities, reacts to
/// list-changed notifications and reconnects with backoff after an
/// unexpected close.
///
/// ```text
/// disconnected --connect--> connecting --ok--> connected
///                           connecting --fail--> error
/// connected --unexpected close--> reconnecting --retry--> connected | reconnecting | error
/// connected | reconnecting --disconnect--> disconnected
/// ```
use super::backoff::ReconnectPolicy;
use super::config::EndpointConfig;
use super::error::{McpError, Result};
use super::transport::{DefaultTransportFactory, EventReceiver, Transport, TransportEvent, TransportFactory};
use super::types::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bound on pages followed for one list request
const MAX_LIST_PAGES: usize = 256;

/// How long the best-effort shutdown notification may take
const SHUTDOWN_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// What the remote told us about itself, replaced wholesale on every refresh
#[derive(Debug, Clone, Default)]
pub struct CapabilitySnapshot {
    pub server_info: Option<ServerInfo>,
    pub protocol_version: Option<String>,
    pub capabilities: ServerCapabilities,
    pub instructions: Option<String>,
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
}

impl CapabilitySnapshot {
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged {
        endpoint: String,
        state: ConnectionState,
        error: Option<String>,
    },
    ToolsChanged {
        endpoint: String,
        count: usize,
    },
    ResourcesChanged {
        endpoint: String,
        count: usize,
    },
    PromptsChanged {
        endpoint: String,
        count: usize,
    },
    /// Any notification not consumed by the connection itself
    Notification {
        endpoint: String,
        method: String,
        params: Option<Value>,
    },
}

impl ConnectionEvent {
    pub fn endpoint(&self) -> &str {
        match self {
            ConnectionEvent::StateChanged { endpoint, .. }
            | ConnectionEvent::ToolsChanged { endpoint, .. }
            | ConnectionEvent::ResourcesChanged { endpoint, .. }
            | ConnectionEvent::PromptsChanged { endpoint, .. }
            | ConnectionEvent::Notification { endpoint, .. } => endpoint,
        }
    }
}

/// Synchronous observer; a panicking listener does not stop delivery to others
pub type ConnectionListener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

#[derive(Clone)]
pub struct ConnectionOptions {
    pub client_info: ClientInfo,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub factory: Arc<dyn TransportFactory>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            client_info: ClientInfo {
                name: "tether".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            factory: Arc::new(DefaultTransportFactory),
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("client_info", &self.client_info)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

struct Inner {
    id: String,
    options: ConnectionOptions,
    config: RwLock<EndpointConfig>,
    state: watch::Sender<ConnectionState>,
    last_error: RwLock<Option<String>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Bumped whenever a transport is retired; stale event pumps stop on mismatch
    generation: AtomicU64,
    snapshot: RwLock<Arc<CapabilitySnapshot>>,
    reconnect_attempts: AtomicU32,
    last_delay: Mutex<Option<Duration>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    manual_disconnect: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    /// One refresh at a time per capability, so an older list never lands last
    refresh_gates: [tokio::sync::Mutex<()>; 3],
    events: broadcast::Sender<ConnectionEvent>,
    listeners: RwLock<Vec<ConnectionListener>>,
}

/// Cheap to clone; clones share the same endpoint session
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn new(config: EndpointConfig, options: ConnectionOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(256);
        let snapshot = CapabilitySnapshot {
            tools: config.cached.tools.clone(),
            resources: config.cached.resources.clone(),
            prompts: config.cached.prompts.clone(),
            ..Default::default()
        };
        Self {
            inner: Arc::new(Inner {
                id: config.id.clone(),
                options,
                config: RwLock::new(config),
                state,
                last_error: RwLock::new(None),
                transport: RwLock::new(None),
                generation: AtomicU64::new(0),
                snapshot: RwLock::new(Arc::new(snapshot)),
                reconnect_attempts: AtomicU32::new(0),
                last_delay: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                manual_disconnect: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
                refresh_gates: Default::default(),
                events,
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> EndpointConfig {
        read(&self.inner.config).clone()
    }

    /// Replace the held configuration; takes effect on the next connect
    pub fn update_config(&self, config: EndpointConfig) {
        *write(&self.inner.config) = config;
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn last_error(&self) -> Option<String> {
        read(&self.inner.last_error).clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Full capability snapshot as of the last discovery or refresh
    pub fn snapshot(&self) -> Arc<CapabilitySnapshot> {
        Arc::clone(&read(&self.inner.snapshot))
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.snapshot().tools.clone()
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.snapshot().resources.clone()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.snapshot().prompts.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn add_listener(&self, listener: ConnectionListener) {
        write(&self.inner.listeners).push(listener);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Connect and handshake. A no-op while connecting or connected.
    ///
    /// On failure the connection settles in `error` and the error is returned;
    /// no automatic retry is scheduled for a caller-initiated connect.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;

        match self.state() {
            ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
            _ => {}
        }

        self.inner.manual_disconnect.store(false, Ordering::SeqCst);
        self.cancel_reconnect();
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        *lock(&self.inner.last_delay) = None;

        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let settled = if self.inner.manual_disconnect.load(Ordering::SeqCst) {
                    ConnectionState::Disconnected
                } else {
                    ConnectionState::Error
                };
                self.set_state(settled, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Caller-initiated teardown. Always ends in `disconnected`.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.manual_disconnect.store(true, Ordering::SeqCst);
        self.cancel_reconnect();

        // unblock a handshake that is still holding the lifecycle lock
        if self.state() == ConnectionState::Connecting {
            if let Some(transport) = self.current_transport() {
                let _ = transport.disconnect().await;
            }
        }

        let _guard = self.inner.lifecycle.lock().await;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let transport = write(&self.inner.transport).take();
        if let Some(transport) = transport {
            if transport.is_connected() {
                let notice = JsonRpcMessage::notification(methods::SHUTDOWN, None);
                match tokio::time::timeout(SHUTDOWN_NOTICE_TIMEOUT, transport.send(&notice)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(target: "mcp_connection", endpoint = %self.inner.id, error = %e, "Shutdown notice failed")
                    }
                    Err(_) => {
                        debug!(target: "mcp_connection", endpoint = %self.inner.id, "Shutdown notice timed out")
                    }
                }
            }
            if let Err(e) = transport.disconnect().await {
                warn!(target: "mcp_connection", endpoint = %self.inner.id, error = %e, "Transport close failed");
            }
        }

        info!(target: "mcp_connection", endpoint = %self.inner.id, "Disconnected");
        self.set_state(ConnectionState::Disconnected, None);
        Ok(())
    }

    /// Open a fresh transport, handshake and discover. Caller holds the lifecycle lock.
    async fn establish(&self) -> Result<()> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ConnectionState::Connecting, None);

        let config = self.config();
        let request_timeout = config.request_timeout(self.inner.options.request_timeout);
        let connect_timeout = config.connect_timeout(self.inner.options.connect_timeout);

        info!(
            target: "mcp_connection",
            endpoint = %self.inner.id,
            transport = ?config.transport,
            "Connecting to endpoint"
        );

        let parts = self.inner.options.factory.create(&config, request_timeout)?;
        let transport = parts.transport;
        *write(&self.inner.transport) = Some(Arc::clone(&transport));
        spawn_event_pump(Arc::downgrade(&self.inner), generation, parts.events);

        let handshake = tokio::time::timeout(connect_timeout, self.handshake(&transport, &config)).await;
        let init = match handshake {
            Ok(Ok(init)) => init,
            Ok(Err(e)) => return Err(self.abandon(e).await),
            Err(_) => {
                let e = McpError::Timeout {
                    method: "connect".to_string(),
                    timeout_ms: connect_timeout.as_millis() as u64,
                };
                return Err(self.abandon(e).await);
            }
        };

        let mut snapshot = CapabilitySnapshot {
            server_info: init.server_info.clone(),
            protocol_version: Some(init.protocol_version.clone()),
            capabilities: init.capabilities.clone(),
            instructions: init.instructions.clone(),
            ..Default::default()
        };
        self.discover(&transport, &mut snapshot).await;

        let counts = (snapshot.tools.len(), snapshot.resources.len(), snapshot.prompts.len());
        *write(&self.inner.snapshot) = Arc::new(snapshot);
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        *lock(&self.inner.last_delay) = None;

        info!(
            target: "mcp_connection",
            endpoint = %self.inner.id,
            server = ?init.server_info.as_ref().map(|s| s.name.as_str()),
            protocol = %init.protocol_version,
            tools = counts.0,
            resources = counts.1,
            prompts = counts.2,
            "Endpoint connected"
        );
        self.set_state(ConnectionState::Connected, None);
        Ok(())
    }

    async fn handshake(&self, transport: &Arc<dyn Transport>, config: &EndpointConfig) -> Result<InitializeResult> {
        transport.connect().await?;

        let params = InitializeParams {
            protocol_version: config.protocol_version().to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: self.inner.options.client_info.clone(),
        };
        let value = transport
            .send_request(methods::INITIALIZE, Some(serde_json::to_value(params)?))
            .await?;
        let init: InitializeResult = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("Invalid initialize result: {}", e)))?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&init.protocol_version.as_str()) {
            warn!(
                target: "mcp_connection",
                endpoint = %self.inner.id,
                version = %init.protocol_version,
                "Endpoint declared an unsupported protocol version"
            );
        }

        transport
            .send(&JsonRpcMessage::notification(methods::INITIALIZED, None))
            .await?;
        Ok(init)
    }

    /// List every declared capability; a failed list leaves that one empty
    async fn discover(&self, transport: &Arc<dyn Transport>, snapshot: &mut CapabilitySnapshot) {
        if snapshot.capabilities.tools.is_some() {
            match list_tools(transport.as_ref()).await {
                Ok(tools) => snapshot.tools = tools,
                Err(e) => self.log_discovery_failure("tools", &e),
            }
        }
        if snapshot.capabilities.resources.is_some() {
            match list_resources(transport.as_ref()).await {
                Ok(resources) => snapshot.resources = resources,
                Err(e) => self.log_discovery_failure("resources", &e),
            }
        }
        if snapshot.capabilities.prompts.is_some() {
            match list_prompts(transport.as_ref()).await {
                Ok(prompts) => snapshot.prompts = prompts,
                Err(e) => self.log_discovery_failure("prompts", &e),
            }
        }
    }

    fn log_discovery_failure(&self, capability: &str, error: &McpError) {
        warn!(
            target: "mcp_connection",
            endpoint = %self.inner.id,
            capability = capability,
            error = %error,
            "Capability discovery failed, leaving it empty"
        );
    }

    /// Retire the half-open transport after a failed attempt
    async fn abandon(&self, error: McpError) -> McpError {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let transport = write(&self.inner.transport).take();
        if let Some(transport) = transport {
            let _ = transport.disconnect().await;
        }
        warn!(target: "mcp_connection", endpoint = %self.inner.id, error = %error, "Connect attempt failed");
        error
    }

    // ------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------

    async fn handle_unexpected_close(&self, generation: u64, reason: String) {
        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.generation.load(Ordering::SeqCst) != generation
            || self.inner.manual_disconnect.load(Ordering::SeqCst)
        {
            return;
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        warn!(target: "mcp_connection", endpoint = %self.inner.id, reason = %reason, "Connection lost");
        let transport = write(&self.inner.transport).take();
        if let Some(transport) = transport {
            let _ = transport.disconnect().await;
        }
        *write(&self.inner.last_error) = Some(reason);
        self.schedule_reconnect();
    }

    /// Arm the next retry, or settle in `error` once attempts are exhausted
    fn schedule_reconnect(&self) {
        let policy = self.inner.options.reconnect;
        let attempt = self.inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let last_error = self.last_error();

        if policy.exhausted(attempt) {
            let message = format!(
                "giving up after {} reconnect attempts{}",
                policy.max_attempts,
                last_error.map(|e| format!(": {e}")).unwrap_or_default()
            );
            warn!(target: "mcp_connection", endpoint = %self.inner.id, "{}", message);
            self.set_state(ConnectionState::Error, Some(message));
            return;
        }

        let delay = {
            let mut last = lock(&self.inner.last_delay);
            let delay = policy.sample(attempt, *last);
            *last = Some(delay);
            delay
        };

        info!(
            target: "mcp_connection",
            endpoint = %self.inner.id,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.set_state(ConnectionState::Reconnecting, last_error);

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // detach ourselves so a re-arm does not abort the running attempt
            drop(lock(&inner.reconnect_task).take());
            Connection { inner }.reconnect_attempt().await;
        });
        if let Some(previous) = lock(&self.inner.reconnect_task).replace(task) {
            previous.abort();
        }
    }

    async fn reconnect_attempt(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.manual_disconnect.load(Ordering::SeqCst)
            || self.state() != ConnectionState::Reconnecting
        {
            return;
        }
        if let Err(e) = self.establish().await {
            *write(&self.inner.last_error) = Some(e.to_string());
            if !self.inner.manual_disconnect.load(Ordering::SeqCst) {
                self.schedule_reconnect();
            }
        }
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = lock(&self.inner.reconnect_task).take() {
            task.abort();
        }
    }

    // ------------------------------------------------------------------
    // Inbound traffic
    // ------------------------------------------------------------------

    async fn handle_message(&self, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Notification(note) => self.handle_notification(note),
            JsonRpcMessage::Request(request) => self.answer_remote_request(request).await,
            JsonRpcMessage::Response(response) => {
                debug!(
                    target: "mcp_connection",
                    endpoint = %self.inner.id,
                    id = %response.id,
                    "Ignoring uncorrelated response"
                );
            }
        }
    }

    fn handle_notification(&self, note: JsonRpcNotification) {
        debug!(target: "mcp_connection", endpoint = %self.inner.id, method = %note.method, "Notification");
        match note.method.as_str() {
            methods::TOOLS_LIST_CHANGED => self.spawn_refresh(Capability::Tools),
            methods::RESOURCES_LIST_CHANGED => self.spawn_refresh(Capability::Resources),
            methods::PROMPTS_LIST_CHANGED => self.spawn_refresh(Capability::Prompts),
            _ => self.emit(ConnectionEvent::Notification {
                endpoint: self.inner.id.clone(),
                method: note.method,
                params: note.params,
            }),
        }
    }

    fn spawn_refresh(&self, capability: Capability) {
        let conn = self.clone();
        tokio::spawn(async move {
            let result = match capability {
                Capability::Tools => conn.refresh_tools().await.map(|_| ()),
                Capability::Resources => conn.refresh_resources().await.map(|_| ()),
                Capability::Prompts => conn.refresh_prompts().await.map(|_| ()),
            };
            if let Err(e) = result {
                warn!(
                    target: "mcp_connection",
                    endpoint = %conn.inner.id,
                    capability = ?capability,
                    error = %e,
                    "Refresh after list change failed"
                );
            }
        });
    }

    /// `ping` gets an empty result; anything else is not supported by a client
    async fn answer_remote_request(&self, request: JsonRpcRequest) {
        let reply = if request.method == methods::PING {
            JsonRpcMessage::result(request.id, json!({}))
        } else {
            debug!(
                target: "mcp_connection",
                endpoint = %self.inner.id,
                method = %request.method,
                "Rejecting remote request"
            );
            JsonRpcMessage::error(request.id, JsonRpcError::method_not_found(&request.method))
        };
        if let Some(transport) = self.current_transport() {
            if let Err(e) = transport.send(&reply).await {
                debug!(target: "mcp_connection", endpoint = %self.inner.id, error = %e, "Failed to answer remote request");
            }
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        read(&self.inner.transport).clone()
    }

    fn connected_transport(&self) -> Result<Arc<dyn Transport>> {
        if !self.is_connected() {
            return Err(McpError::NotConnected(self.inner.id.clone()));
        }
        self.current_transport()
            .ok_or_else(|| McpError::NotConnected(self.inner.id.clone()))
    }

    /// Raw request on the live transport
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let transport = self
            .current_transport()
            .ok_or_else(|| McpError::NotConnected(self.inner.id.clone()))?;
        transport.send_request(method, params).await
    }

    /// Invoke a tool the endpoint currently advertises
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        let transport = self.connected_transport()?;
        if !self.snapshot().has_tool(name) {
            return Err(McpError::ToolNotFound(name.to_string()));
        }

        debug!(target: "mcp_connection", endpoint = %self.inner.id, tool = %name, "Calling tool");
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let value = transport
            .send_request(methods::TOOLS_CALL, Some(serde_json::to_value(params)?))
            .await
            .map_err(|e| McpError::ToolCall {
                tool: name.to_string(),
                message: e.to_string(),
            })?;

        serde_json::from_value(value).map_err(|e| McpError::ToolCall {
            tool: name.to_string(),
            message: format!("Invalid tools/call result: {}", e),
        })
    }

    fn refresh_gate(&self, capability: Capability) -> &tokio::sync::Mutex<()> {
        &self.inner.refresh_gates[capability as usize]
    }

    pub async fn refresh_tools(&self) -> Result<Vec<Tool>> {
        let _gate = self.refresh_gate(Capability::Tools).lock().await;
        let transport = self.connected_transport()?;
        let tools = list_tools(transport.as_ref()).await?;
        self.replace_snapshot(|s| s.tools = tools.clone());
        self.emit(ConnectionEvent::ToolsChanged {
            endpoint: self.inner.id.clone(),
            count: tools.len(),
        });
        Ok(tools)
    }

    pub async fn refresh_resources(&self) -> Result<Vec<Resource>> {
        let _gate = self.refresh_gate(Capability::Resources).lock().await;
        let transport = self.connected_transport()?;
        let resources = list_resources(transport.as_ref()).await?;
        self.replace_snapshot(|s| s.resources = resources.clone());
        self.emit(ConnectionEvent::ResourcesChanged {
            endpoint: self.inner.id.clone(),
            count: resources.len(),
        });
        Ok(resources)
    }

    pub async fn refresh_prompts(&self) -> Result<Vec<Prompt>> {
        let _gate = self.refresh_gate(Capability::Prompts).lock().await;
        let transport = self.connected_transport()?;
        let prompts = list_prompts(transport.as_ref()).await?;
        self.replace_snapshot(|s| s.prompts = prompts.clone());
        self.emit(ConnectionEvent::PromptsChanged {
            endpoint: self.inner.id.clone(),
            count: prompts.len(),
        });
        Ok(prompts)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let transport = self.connected_transport()?;
        let value = transport
            .send_request(methods::RESOURCES_READ, Some(json!({ "uri": uri })))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("Invalid resources/read result: {}", e)))
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<()> {
        let transport = self.connected_transport()?;
        transport
            .send_request(methods::RESOURCES_SUBSCRIBE, Some(json!({ "uri": uri })))
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<()> {
        let transport = self.connected_transport()?;
        transport
            .send_request(methods::RESOURCES_UNSUBSCRIBE, Some(json!({ "uri": uri })))
            .await?;
        Ok(())
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<GetPromptResult> {
        let transport = self.connected_transport()?;
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        let value = transport.send_request(methods::PROMPTS_GET, Some(params)).await?;
        serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("Invalid prompts/get result: {}", e)))
    }

    pub async fn set_logging_level(&self, level: &str) -> Result<()> {
        let transport = self.connected_transport()?;
        transport
            .send_request(methods::LOGGING_SET_LEVEL, Some(json!({ "level": level })))
            .await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        let transport = self.connected_transport()?;
        transport.send_request(methods::PING, None).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // State and events
    // ------------------------------------------------------------------

    fn replace_snapshot(&self, update: impl FnOnce(&mut CapabilitySnapshot)) {
        let mut guard = write(&self.inner.snapshot);
        let mut next = CapabilitySnapshot::clone(&guard);
        update(&mut next);
        *guard = Arc::new(next);
    }

    fn set_state(&self, state: ConnectionState, error: Option<String>) {
        {
            let mut last_error = write(&self.inner.last_error);
            match (&error, state) {
                (Some(e), _) => *last_error = Some(e.clone()),
                (None, ConnectionState::Connected | ConnectionState::Disconnected) => *last_error = None,
                (None, _) => {}
            }
        }
        let previous = self.inner.state.send_replace(state);
        if previous == state && error.is_none() {
            return;
        }
        debug!(
            target: "mcp_connection",
            endpoint = %self.inner.id,
            from = %previous,
            to = %state,
            "State change"
        );
        self.emit(ConnectionEvent::StateChanged {
            endpoint: self.inner.id.clone(),
            state,
            error,
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        let listeners = read(&self.inner.listeners).clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(target: "mcp_connection", endpoint = %self.inner.id, "Connection listener panicked");
            }
        }
        let _ = self.inner.events.send(event);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut task) = self.reconnect_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Capability {
    // discriminants index `Inner::refresh_gates`
    Tools,
    Resources,
    Prompts,
}

fn spawn_event_pump(inner: Weak<Inner>, generation: u64, mut events: EventReceiver) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(strong) = inner.upgrade() else {
                break;
            };
            if strong.generation.load(Ordering::SeqCst) != generation {
                break;
            }
            let conn = Connection { inner: strong };
            match event {
                TransportEvent::Message(message) => conn.handle_message(message).await,
                TransportEvent::Error(e) => {
                    warn!(target: "mcp_connection", endpoint = %conn.inner.id, error = %e, "Transport error");
                }
                TransportEvent::Closed { reason } => {
                    conn.handle_unexpected_close(generation, reason).await;
                    break;
                }
            }
        }
    });
}

async fn paginate<R, T>(
    transport: &dyn Transport,
    method: &str,
    split: impl Fn(R) -> (Vec<T>, Option<String>),
) -> Result<Vec<T>>
where
    R: DeserializeOwned,
{
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let params = serde_json::to_value(ListParams { cursor: cursor.take() })?;
        let value = transport.send_request(method, Some(params)).await?;
        let page: R = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("Invalid {} result: {}", method, e)))?;
        let (batch, next) = split(page);
        items.extend(batch);
        match next {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(items),
        }
    }

    warn!(target: "mcp_connection", method = %method, pages = MAX_LIST_PAGES, "Stopped following list cursor");
    Ok(items)
}

async fn list_tools(transport: &dyn Transport) -> Result<Vec<Tool>> {
    paginate(transport, methods::TOOLS_LIST, |page: ListToolsResult| {
        (page.tools, page.next_cursor)
    })
    .await
}

async fn list_resources(transport: &dyn Transport) -> Result<Vec<Resource>> {
    paginate(transport, methods::RESOURCES_LIST, |page: ListResourcesResult| {
        (page.resources, page.next_cursor)
    })
    .await
}

async fn list_prompts(transport: &dyn Transport) -> Result<Vec<Prompt>> {
    paginate(transport, methods::PROMPTS_LIST, |page: ListPromptsResult| {
        (page.prompts, page.next_cursor)
    })
    .await
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_matches_wire_names() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_value(ConnectionState::Error).unwrap(),
            serde_json::json!("error")
        );
    }

    #[test]
    fn test_new_connection_starts_disconnected_with_cached_tools() {
        let mut config = EndpointConfig::stdio("cached", "node");
        config.cached.tools.push(Tool {
            name: "old".into(),
            description: None,
            input_schema: json!({"type": "object"}),
        });
        let conn = Connection::new(config, ConnectionOptions::default());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.tools().len(), 1);
    }

    #[tokio::test]
    async fn test_call_tool_requires_connection() {
        let conn = Connection::new(EndpointConfig::stdio("idle", "node"), ConnectionOptions::default());
        let err = conn.call_tool("anything", None).await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected(ref id) if id == "idle"));
        assert!(conn.send_request("tools/list", None).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_settles_in_error() {
        let conn = Connection::new(
            EndpointConfig::stdio("broken", "/no/such/binary"),
            ConnectionOptions::default(),
        );
        let mut events = conn.subscribe();
        assert!(conn.connect().await.is_err());
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(conn.last_error().is_some());

        let mut seen = Vec::new();
        while let Ok(ConnectionEvent::StateChanged { state, .. }) = events.try_recv() {
            seen.push(state);
        }
        assert_eq!(seen, vec![ConnectionState::Connecting, ConnectionState::Error]);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_block_others() {
        let conn = Connection::new(EndpointConfig::stdio("x", "/no/such/binary"), ConnectionOptions::default());
        let hits = Arc::new(AtomicU32::new(0));
        conn.add_listener(Arc::new(|_| panic!("listener bug")));
        let counter = Arc::clone(&hits);
        conn.add_listener(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let _ = conn.connect().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_lands_in_disconnected() {
        let conn = Connection::new(EndpointConfig::stdio("idle", "node"), ConnectionOptions::default());
        conn.disconnect().await.unwrap();
        conn.disconnect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
