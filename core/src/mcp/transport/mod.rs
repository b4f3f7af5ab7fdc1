//! Transport abstraction and its three bindings
//!
//! A transport turns one medium into framed [`JsonRpcMessage`]s. Everything
//! the transport cannot settle itself (notifications, remote requests, close
//! and error signals) is delivered as a [`TransportEvent`] on the receiver
//! returned alongside it.

pub mod auth;
mod rpc;
pub mod sse;
pub mod stdio;
pub mod websocket;

pub use rpc::{EventReceiver, RpcChannel};
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

use super::config::{EndpointConfig, TransportKind};
use super::error::{McpError, Result};
use super::types::JsonRpcMessage;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Signals a transport raises towards its owner
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Notification, remote-initiated request or unmatched response
    Message(JsonRpcMessage),
    /// The medium closed without the owner asking for it
    Closed { reason: String },
    /// Non-fatal problem (bad frame, stream hiccup)
    Error(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Correlation state shared with the binding's reader tasks
    fn rpc(&self) -> &RpcChannel;

    /// Open the medium. Fails with `AlreadyConnected` while connecting or connected.
    async fn connect(&self) -> Result<()>;

    /// Tear down; idempotent. Every pending request is rejected.
    async fn disconnect(&self) -> Result<()>;

    /// Fire-and-forget write of one message
    async fn send(&self, message: &JsonRpcMessage) -> Result<()>;

    /// Send a request and wait for the matching response
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let rpc = self.rpc();
        if !rpc.is_connected() {
            return Err(McpError::TransportDisconnected);
        }
        let (id, rx) = rpc.register(method);
        let request = JsonRpcMessage::request(id, method, params);
        if let Err(e) = self.send(&request).await {
            rpc.forget(id);
            return Err(e);
        }
        rpc.wait(id, method, rx).await
    }

    fn is_connected(&self) -> bool {
        self.rpc().is_connected()
    }
}

/// A freshly created transport and its event stream
pub struct TransportParts {
    pub transport: Arc<dyn Transport>,
    pub events: EventReceiver,
}

/// Builds transports for endpoints; swapped out in tests
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &EndpointConfig, request_timeout: Duration) -> Result<TransportParts>;
}

/// Picks the binding from [`EndpointConfig::transport`]
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, config: &EndpointConfig, request_timeout: Duration) -> Result<TransportParts> {
        config.validate()?;
        let (transport, events): (Arc<dyn Transport>, EventReceiver) = match config.transport {
            TransportKind::Stdio => {
                let (t, rx) = StdioTransport::new(config.clone(), request_timeout);
                (Arc::new(t), rx)
            }
            TransportKind::Sse => {
                let (t, rx) = SseTransport::new(config.clone(), request_timeout)?;
                (Arc::new(t), rx)
            }
            TransportKind::WebSocket => {
                let (t, rx) = WebSocketTransport::new(config.clone(), request_timeout)?;
                (Arc::new(t), rx)
            }
        };
        Ok(TransportParts { transport, events })
    }
}
