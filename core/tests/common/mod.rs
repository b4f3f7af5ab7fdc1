//! Shared helpers: an in-memory scripted remote and tether-echo endpoints
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tether_core::mcp::backoff::ReconnectPolicy;
use tether_core::mcp::connection::{ConnectionOptions, ConnectionState};
use tether_core::mcp::error::{McpError, Result};
use tether_core::mcp::transport::{
    RpcChannel, Transport, TransportEvent, TransportFactory, TransportParts,
};
use tether_core::mcp::types::{methods, JsonRpcError, JsonRpcMessage, Tool};
use tether_core::mcp::{Connection, EndpointConfig};

pub fn tool(name: &str) -> Tool {
    Tool {
        name: name.to_string(),
        description: None,
        input_schema: json!({"type": "object"}),
    }
}

/// Stdio endpoint running this crate's tether-echo binary
pub fn echo_endpoint(id: &str) -> EndpointConfig {
    EndpointConfig::stdio(id, env!("CARGO_BIN_EXE_tether-echo")).with_env("TETHER_ECHO_NAME", id)
}

/// Options with short timeouts and fast retries
pub fn fast_options() -> ConnectionOptions {
    ConnectionOptions {
        request_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        reconnect: ReconnectPolicy::new(Duration::from_millis(50), 3),
        ..Default::default()
    }
}

/// Wait until `conn` reaches `state`, failing the test after `limit`
pub async fn wait_for_state(conn: &Connection, state: ConnectionState, limit: Duration) {
    let mut rx = conn.watch_state();
    let reached = tokio::time::timeout(limit, async {
        loop {
            if *rx.borrow_and_update() == state {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(
        reached.is_ok() && conn.state() == state,
        "endpoint {} stuck in {} waiting for {}",
        conn.id(),
        conn.state(),
        state
    );
}

/// Remote-side behaviour that survives reconnects
pub struct ScriptedRemote {
    pub name: String,
    pub tools: Mutex<Vec<Tool>>,
    pub connect_delay: Duration,
    pub refuse: AtomicBool,
    /// Declare resources and prompts but fail to list them
    pub broken_catalogs: bool,
    pub connects: AtomicUsize,
    pub tool_lists: AtomicUsize,
    /// Per-response hold for upcoming `tools/list` replies
    list_delays: Mutex<VecDeque<Duration>>,
    live: Mutex<Option<Weak<ScriptedTransport>>>,
}

impl ScriptedRemote {
    pub fn new(name: &str, tools: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tools: Mutex::new(tools.iter().map(|t| tool(t)).collect()),
            connect_delay: Duration::ZERO,
            refuse: AtomicBool::new(false),
            broken_catalogs: false,
            connects: AtomicUsize::new(0),
            tool_lists: AtomicUsize::new(0),
            list_delays: Mutex::new(VecDeque::new()),
            live: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn refusing(self) -> Self {
        self.set_refuse(true);
        self
    }

    pub fn with_broken_catalogs(mut self) -> Self {
        self.broken_catalogs = true;
        self
    }

    /// Refuse (or accept) every later connect attempt
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn set_tools(&self, tools: &[&str]) {
        *self.tools.lock().unwrap() = tools.iter().map(|t| tool(t)).collect();
    }

    /// Hold the next `tools/list` replies back; the list itself is taken on arrival
    pub fn delay_tool_lists(&self, delays: &[Duration]) {
        self.list_delays.lock().unwrap().extend(delays.iter().copied());
    }

    fn live(&self) -> Option<Arc<ScriptedTransport>> {
        self.live.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    /// Push a notification through the current transport
    pub fn notify(&self, method: &str, params: Option<Value>) {
        if let Some(transport) = self.live() {
            transport
                .rpc
                .emit(TransportEvent::Message(JsonRpcMessage::notification(method, params)));
        }
    }

    /// Drop the current link as if the peer vanished
    pub fn drop_link(&self) {
        if let Some(transport) = self.live() {
            transport.rpc.close("scripted drop");
        }
    }
}

pub struct ScriptedTransport {
    rpc: RpcChannel,
    remote: Arc<ScriptedRemote>,
}

impl ScriptedTransport {
    fn reply(&self, id: Value, method: &str, params: Option<Value>) -> JsonRpcMessage {
        let remote = &self.remote;
        match method {
            methods::INITIALIZE => {
                let mut capabilities = json!({"tools": {"listChanged": true}});
                if remote.broken_catalogs {
                    capabilities["resources"] = json!({});
                    capabilities["prompts"] = json!({});
                }
                JsonRpcMessage::result(
                    id,
                    json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": capabilities,
                        "serverInfo": {"name": remote.name, "version": "1.0.0"}
                    }),
                )
            }
            methods::RESOURCES_LIST | methods::PROMPTS_LIST if remote.broken_catalogs => {
                JsonRpcMessage::error(id, JsonRpcError::internal(format!("{method} is broken")))
            }
            methods::TOOLS_LIST => {
                remote.tool_lists.fetch_add(1, Ordering::SeqCst);
                let tools = remote.tools.lock().unwrap().clone();
                JsonRpcMessage::result(id, json!({ "tools": tools }))
            }
            methods::TOOLS_CALL => {
                let tool = params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                JsonRpcMessage::result(
                    id,
                    json!({"content": [{"type": "text", "text": format!("{}:{}", remote.name, tool)}]}),
                )
            }
            methods::PING => JsonRpcMessage::result(id, json!({})),
            other => JsonRpcMessage::error(id, JsonRpcError::method_not_found(other)),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn rpc(&self) -> &RpcChannel {
        &self.rpc
    }

    async fn connect(&self) -> Result<()> {
        self.rpc.begin_connect()?;
        tokio::time::sleep(self.remote.connect_delay).await;
        if self.remote.refuse.load(Ordering::SeqCst) {
            self.rpc.abort_connect();
            return Err(McpError::Transport(format!("{} refused", self.remote.name)));
        }
        self.remote.connects.fetch_add(1, Ordering::SeqCst);
        self.rpc.mark_connected();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.rpc.shutdown();
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        if !self.rpc.is_connected() {
            return Err(McpError::TransportDisconnected);
        }
        if let JsonRpcMessage::Request(request) = message {
            let reply = self.reply(request.id.clone(), &request.method, request.params.clone());
            let hold = if request.method == methods::TOOLS_LIST {
                self.remote.list_delays.lock().unwrap().pop_front()
            } else {
                None
            };
            if let Some(hold) = hold {
                tokio::time::sleep(hold).await;
            }
            self.rpc.dispatch(reply);
        }
        Ok(())
    }
}

/// Factory handing out scripted transports by endpoint id
#[derive(Default)]
pub struct ScriptedFactory {
    remotes: Mutex<HashMap<String, Arc<ScriptedRemote>>>,
}

impl ScriptedFactory {
    pub fn add(&self, id: &str, remote: ScriptedRemote) -> Arc<ScriptedRemote> {
        let remote = Arc::new(remote);
        self.remotes
            .lock()
            .unwrap()
            .insert(id.to_string(), Arc::clone(&remote));
        remote
    }
}

impl TransportFactory for ScriptedFactory {
    fn create(&self, config: &EndpointConfig, request_timeout: Duration) -> Result<TransportParts> {
        let remote = self
            .remotes
            .lock()
            .unwrap()
            .get(&config.id)
            .cloned()
            .ok_or_else(|| McpError::Config(format!("no scripted remote for {}", config.id)))?;
        let (rpc, events) = RpcChannel::new(config.id.clone(), request_timeout);
        let transport = Arc::new(ScriptedTransport {
            rpc,
            remote: Arc::clone(&remote),
        });
        *remote.live.lock().unwrap() = Some(Arc::downgrade(&transport));
        Ok(TransportParts { transport, events })
    }
}

/// Connection options routed through `factory`
pub fn scripted_options(factory: Arc<ScriptedFactory>) -> ConnectionOptions {
    ConnectionOptions {
        factory,
        ..fast_options()
    }
}
