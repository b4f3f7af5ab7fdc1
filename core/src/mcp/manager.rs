/// Client manager
///
/// Owns one [`Connection`] per configured endpoint, keeps the global tool
/// index and writes connection state back to the configuration store.
///
/// Responsible for:
/// - Parallel startup inside a single store batch
/// - Skipping integrations that are missing credentials
/// - Debounced tool index rebuilds in steady state
/// - Routing tool calls to the owning endpoint
/// - Broadcasting status snapshots to observers
use super::config::{ConfigStore, EndpointConfig, TransportKind};
use super::connection::{Connection, ConnectionEvent, ConnectionOptions, ConnectionState};
use super::credentials::missing_credentials;
use super::error::{McpError, Result};
use super::index::{IndexedTool, ToolIndex};
use super::types::CallToolResult;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub connection: ConnectionOptions,
    /// Quiet period before a steady-state index rebuild
    pub index_debounce: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            index_debounce: Duration::from_millis(100),
        }
    }
}

/// Status of one configured endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointStatus {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub transport: TransportKind,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub last_connected: Option<DateTime<Utc>>,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
    /// False when the figures come from the cached configuration
    pub live: bool,
}

/// Outcome of [`ClientManager::start`]
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub connected: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<(String, String)>,
    pub disabled: Vec<String>,
}

struct Slot {
    seq: u64,
    connection: Connection,
}

struct ManagerInner {
    store: Arc<dyn ConfigStore>,
    options: ManagerOptions,
    connections: DashMap<String, Slot>,
    next_seq: AtomicU64,
    index: RwLock<Arc<ToolIndex>>,
    rebuilds: AtomicU64,
    /// Set for the whole startup sequence; suppresses debounced rebuilds
    startup_batch: AtomicBool,
    shutting_down: AtomicBool,
    debounce: Mutex<Option<JoinHandle<()>>>,
    status_tx: broadcast::Sender<Vec<EndpointStatus>>,
}

#[derive(Clone)]
pub struct ClientManager {
    inner: Arc<ManagerInner>,
}

impl ClientManager {
    pub fn new(store: Arc<dyn ConfigStore>, options: ManagerOptions) -> Self {
        let (status_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ManagerInner {
                store,
                options,
                connections: DashMap::new(),
                next_seq: AtomicU64::new(0),
                rebuilds: AtomicU64::new(0),
                index: RwLock::new(Arc::new(ToolIndex::default())),
                startup_batch: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                debounce: Mutex::new(None),
                status_tx,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.inner.store
    }

    /// Connect every enabled endpoint in parallel inside one store batch
    pub async fn start(&self) -> StartupReport {
        let inner = &self.inner;
        inner.shutting_down.store(false, Ordering::SeqCst);
        inner.store.begin_batch();
        inner.startup_batch.store(true, Ordering::SeqCst);
        inner.cancel_debounce();

        let mut report = StartupReport::default();
        let mut pending = Vec::new();

        for config in inner.store.endpoints() {
            if !config.enabled {
                report.disabled.push(config.id.clone());
                continue;
            }
            if let Some(missing) = missing_credentials(&config) {
                warn!(
                    target: "mcp_manager",
                    endpoint = %config.id,
                    integration = missing.integration,
                    "Skipping endpoint without required credentials"
                );
                let reason = missing.to_string();
                inner.persist(&config.id, |c| {
                    c.enabled = false;
                    c.last_error = Some(reason.clone());
                });
                report.skipped.push((config.id.clone(), reason));
                continue;
            }
            pending.push(self.ensure_connection(config));
        }

        info!(target: "mcp_manager", count = pending.len(), "Starting endpoints");

        let results = join_all(pending.iter().map(|conn| async move {
            (conn.id().to_string(), conn.connect().await)
        }))
        .await;

        for (id, result) in results {
            match result {
                Ok(()) => report.connected.push(id),
                Err(e) => {
                    warn!(target: "mcp_manager", endpoint = %id, error = %e, "Endpoint failed to start");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        inner.rebuild_index();
        inner.startup_batch.store(false, Ordering::SeqCst);
        if let Err(e) = inner.store.end_batch() {
            warn!(target: "mcp_manager", error = %e, "Failed to flush configuration batch");
        }
        inner.broadcast_status();

        info!(
            target: "mcp_manager",
            connected = report.connected.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            tools = self.tool_index().len(),
            "Startup complete"
        );
        report
    }

    /// Disconnect everything concurrently and drop all indices
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutting_down.store(true, Ordering::SeqCst);
        inner.cancel_debounce();

        let connections = inner.ordered_connections();
        info!(target: "mcp_manager", count = connections.len(), "Shutting down endpoints");
        join_all(connections.iter().map(|conn| async move {
            if let Err(e) = conn.disconnect().await {
                warn!(target: "mcp_manager", endpoint = %conn.id(), error = %e, "Disconnect failed");
            }
        }))
        .await;

        inner.connections.clear();
        *write(&inner.index) = Arc::new(ToolIndex::default());
        inner.cancel_debounce();
        inner.broadcast_status();
    }

    // ------------------------------------------------------------------
    // Endpoint management
    // ------------------------------------------------------------------

    /// Persist a new endpoint and connect it if enabled
    pub async fn add_endpoint(&self, config: EndpointConfig) -> Result<()> {
        info!(target: "mcp_manager", endpoint = %config.id, "Adding endpoint");
        self.inner.store.add_endpoint(config.clone())?;
        let enabled = config.enabled;
        let conn = self.ensure_connection(config);
        if enabled {
            conn.connect().await?;
        }
        self.inner.broadcast_status();
        Ok(())
    }

    pub async fn remove_endpoint(&self, id: &str) -> Result<()> {
        info!(target: "mcp_manager", endpoint = %id, "Removing endpoint");
        let removed = self.inner.connections.remove(id);
        if let Some((_, slot)) = removed {
            slot.connection.disconnect().await?;
        }
        if !self.inner.store.remove_endpoint(id)? {
            return Err(McpError::EndpointNotFound(id.to_string()));
        }
        self.inner.rebuild_index();
        self.inner.broadcast_status();
        Ok(())
    }

    /// Replace an endpoint's definition, reconnecting if it was live
    pub async fn update_endpoint(&self, config: EndpointConfig) -> Result<()> {
        config.validate()?;
        let id = config.id.clone();
        let mut merged = None;
        let found = self.inner.store.update_endpoint(&id, &mut |current| {
            let mut next = config.clone();
            next.last_error = current.last_error.take();
            next.last_connected = current.last_connected;
            next.cached = std::mem::take(&mut current.cached);
            *current = next.clone();
            merged = Some(next);
        })?;
        let Some(merged) = merged.filter(|_| found) else {
            return Err(McpError::EndpointNotFound(id));
        };

        if let Some(conn) = self.connection(&id) {
            let was_live = matches!(
                conn.state(),
                ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Reconnecting
            );
            conn.update_config(merged.clone());
            if was_live {
                conn.disconnect().await?;
                if merged.enabled {
                    conn.connect().await?;
                }
                self.inner.rebuild_index();
            }
        }
        self.inner.broadcast_status();
        Ok(())
    }

    pub async fn connect_endpoint(&self, id: &str) -> Result<()> {
        let config = self
            .inner
            .store
            .get_endpoint(id)
            .ok_or_else(|| McpError::EndpointNotFound(id.to_string()))?;
        let conn = self.ensure_connection(config);
        conn.connect().await
    }

    pub async fn disconnect_endpoint(&self, id: &str) -> Result<()> {
        let conn = self
            .connection(id)
            .ok_or_else(|| McpError::EndpointNotFound(id.to_string()))?;
        conn.disconnect().await?;
        self.inner.rebuild_index();
        Ok(())
    }

    /// Re-list every declared capability on a live endpoint
    pub async fn refresh_endpoint(&self, id: &str) -> Result<()> {
        let conn = self
            .connection(id)
            .ok_or_else(|| McpError::EndpointNotFound(id.to_string()))?;
        let declared = conn.snapshot().capabilities.clone();
        if declared.tools.is_some() {
            conn.refresh_tools().await?;
        }
        if declared.resources.is_some() {
            conn.refresh_resources().await?;
        }
        if declared.prompts.is_some() {
            conn.refresh_prompts().await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn connection(&self, id: &str) -> Option<Connection> {
        self.inner
            .connections
            .get(id)
            .map(|slot| slot.connection.clone())
    }

    pub fn tool_index(&self) -> Arc<ToolIndex> {
        Arc::clone(&read(&self.inner.index))
    }

    /// Every routable tool, first registrant per name
    pub fn get_all_tools(&self) -> Vec<IndexedTool> {
        self.tool_index().tools().to_vec()
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        self.inner.status_snapshot()
    }

    pub fn endpoint_status(&self, id: &str) -> Option<EndpointStatus> {
        self.status().into_iter().find(|s| s.id == id)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<Vec<EndpointStatus>> {
        self.inner.status_tx.subscribe()
    }

    /// Route a call to whichever endpoint owns `name` in the index
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        let owner = self
            .tool_index()
            .owner(name)
            .map(str::to_string)
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))?;
        let conn = self
            .connection(&owner)
            .ok_or_else(|| McpError::EndpointNotFound(owner.clone()))?;
        debug!(target: "mcp_manager", tool = %name, endpoint = %owner, "Routing tool call");
        conn.call_tool(name, arguments).await
    }

    /// Force an immediate rebuild, bypassing the debounce
    pub fn rebuild_index(&self) {
        self.inner.rebuild_index();
    }

    /// How many times the tool index has been rebuilt since construction
    pub fn index_rebuilds(&self) -> u64 {
        self.inner.rebuilds.load(Ordering::SeqCst)
    }

    fn ensure_connection(&self, config: EndpointConfig) -> Connection {
        let inner = &self.inner;
        if let Some(slot) = inner.connections.get(&config.id) {
            slot.connection.update_config(config);
            return slot.connection.clone();
        }

        let id = config.id.clone();
        let connection = Connection::new(config, inner.options.connection.clone());
        let weak: Weak<ManagerInner> = Arc::downgrade(inner);
        connection.add_listener(Arc::new(move |event: &ConnectionEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connection_event(event);
            }
        }));

        inner
            .connections
            .entry(id)
            .or_insert_with(|| Slot {
                seq: inner.next_seq.fetch_add(1, Ordering::SeqCst),
                connection,
            })
            .connection
            .clone()
    }
}

impl ManagerInner {
    fn on_connection_event(self: &Arc<Self>, event: &ConnectionEvent) {
        let id = event.endpoint();
        match event {
            ConnectionEvent::StateChanged { state, error, .. } => {
                let snapshot = self.connections.get(id).map(|s| s.connection.snapshot());
                let state = *state;
                let error = error.clone();
                self.persist(id, |c| match state {
                    ConnectionState::Connected => {
                        c.last_error = None;
                        c.last_connected = Some(Utc::now());
                        if let Some(snapshot) = &snapshot {
                            c.cached.tools = snapshot.tools.clone();
                            c.cached.resources = snapshot.resources.clone();
                            c.cached.prompts = snapshot.prompts.clone();
                        }
                    }
                    ConnectionState::Error | ConnectionState::Reconnecting => {
                        if error.is_some() {
                            c.last_error = error.clone();
                        }
                    }
                    ConnectionState::Disconnected | ConnectionState::Connecting => {}
                });
                self.schedule_index_rebuild();
            }
            ConnectionEvent::ToolsChanged { .. } => {
                if let Some(snapshot) = self.connections.get(id).map(|s| s.connection.snapshot()) {
                    self.persist(id, |c| c.cached.tools = snapshot.tools.clone());
                }
                self.schedule_index_rebuild();
            }
            ConnectionEvent::ResourcesChanged { .. } | ConnectionEvent::PromptsChanged { .. } => {
                if let Some(snapshot) = self.connections.get(id).map(|s| s.connection.snapshot()) {
                    self.persist(id, |c| {
                        c.cached.resources = snapshot.resources.clone();
                        c.cached.prompts = snapshot.prompts.clone();
                    });
                }
            }
            ConnectionEvent::Notification { method, .. } => {
                debug!(target: "mcp_manager", endpoint = %id, method = %method, "Endpoint notification");
                return;
            }
        }
        self.broadcast_status();
    }

    fn persist(&self, id: &str, mut update: impl FnMut(&mut EndpointConfig)) {
        if let Err(e) = self.store.update_endpoint(id, &mut update) {
            warn!(target: "mcp_manager", endpoint = %id, error = %e, "Failed to persist endpoint state");
        }
    }

    /// Trailing debounce; suppressed entirely during startup
    fn schedule_index_rebuild(self: &Arc<Self>) {
        if self.startup_batch.load(Ordering::SeqCst) || self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.rebuild_index();
            return;
        };

        let weak = Arc::downgrade(self);
        let delay = self.options.index_debounce;
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.rebuild_index();
                inner.broadcast_status();
            }
        });
        if let Some(previous) = lock(&self.debounce).replace(task) {
            previous.abort();
        }
    }

    fn cancel_debounce(&self) {
        if let Some(task) = lock(&self.debounce).take() {
            task.abort();
        }
    }

    fn ordered_connections(&self) -> Vec<Connection> {
        let mut slots: Vec<(u64, Connection)> = self
            .connections
            .iter()
            .map(|entry| (entry.seq, entry.connection.clone()))
            .collect();
        slots.sort_by_key(|(seq, _)| *seq);
        slots.into_iter().map(|(_, conn)| conn).collect()
    }

    fn rebuild_index(&self) {
        let snapshots: Vec<(String, Arc<super::connection::CapabilitySnapshot>)> = self
            .ordered_connections()
            .into_iter()
            .filter(|conn| conn.is_connected())
            .map(|conn| (conn.id().to_string(), conn.snapshot()))
            .collect();

        let index = ToolIndex::build(
            snapshots
                .iter()
                .map(|(id, snapshot)| (id.as_str(), snapshot.tools.as_slice())),
        );
        debug!(
            target: "mcp_manager",
            endpoints = snapshots.len(),
            tools = index.len(),
            collisions = index.collisions().len(),
            "Tool index rebuilt"
        );
        *write(&self.index) = Arc::new(index);
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
    }

    fn status_snapshot(&self) -> Vec<EndpointStatus> {
        self.store
            .endpoints()
            .into_iter()
            .map(|config| match self.connections.get(&config.id).map(|s| s.connection.clone()) {
                Some(conn) => {
                    let snapshot = conn.snapshot();
                    EndpointStatus {
                        id: config.id.clone(),
                        name: config.display_name().to_string(),
                        enabled: config.enabled,
                        transport: config.transport,
                        state: conn.state(),
                        last_error: conn.last_error().or(config.last_error.clone()),
                        last_connected: config.last_connected,
                        tool_count: snapshot.tools.len(),
                        resource_count: snapshot.resources.len(),
                        prompt_count: snapshot.prompts.len(),
                        live: true,
                    }
                }
                None => EndpointStatus {
                    id: config.id.clone(),
                    name: config.display_name().to_string(),
                    enabled: config.enabled,
                    transport: config.transport,
                    state: ConnectionState::Disconnected,
                    last_error: config.last_error.clone(),
                    last_connected: config.last_connected,
                    tool_count: config.cached.tools.len(),
                    resource_count: config.cached.resources.len(),
                    prompt_count: config.cached.prompts.len(),
                    live: false,
                },
            })
            .collect()
    }

    fn broadcast_status(&self) {
        if self.status_tx.receiver_count() == 0 {
            return;
        }
        let _ = self.status_tx.send(self.status_snapshot());
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.cancel_debounce();
    }
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
