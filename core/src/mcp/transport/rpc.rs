//! Request/response correlation shared by every binding
//!
//! Each transport owns one [`RpcChannel`]. It hands out monotonically
//! increasing request ids, parks a oneshot per in-flight request, routes
//! responses back by id and rejects everything still waiting when the link
//! goes away.

use super::TransportEvent;
use crate::mcp::error::{McpError, Result};
use crate::mcp::types::{JsonRpcMessage, ResponsePayload};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

const LINK_IDLE: u8 = 0;
const LINK_CONNECTING: u8 = 1;
const LINK_CONNECTED: u8 = 2;
const LINK_CLOSED: u8 = 3;

/// Receiving half handed to whoever drives the transport
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

struct PendingRequest {
    method: String,
    reply: oneshot::Sender<Result<Value>>,
}

/// Removes a parked request when its waiter goes away, however that happens
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, PendingRequest>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

pub struct RpcChannel {
    label: String,
    next_id: AtomicU64,
    pending: DashMap<u64, PendingRequest>,
    request_timeout: Duration,
    link: AtomicU8,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl RpcChannel {
    pub fn new(label: impl Into<String>, request_timeout: Duration) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let channel = Self {
            label: label.into(),
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            request_timeout,
            link: AtomicU8::new(LINK_IDLE),
            events,
        };
        (channel, rx)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Claim the link for a connect attempt; fails while connecting or connected
    pub fn begin_connect(&self) -> Result<()> {
        for from in [LINK_IDLE, LINK_CLOSED] {
            if self
                .link
                .compare_exchange(from, LINK_CONNECTING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(());
            }
        }
        Err(McpError::AlreadyConnected)
    }

    pub fn mark_connected(&self) {
        self.link.store(LINK_CONNECTED, Ordering::SeqCst);
    }

    /// Give up a connect attempt that never reached the connected state
    pub fn abort_connect(&self) {
        self.link.store(LINK_CLOSED, Ordering::SeqCst);
        self.reject_all();
    }

    pub fn is_connected(&self) -> bool {
        self.link.load(Ordering::SeqCst) == LINK_CONNECTED
    }

    /// Allocate an id and park a continuation for it
    pub fn register(&self, method: &str) -> (u64, oneshot::Receiver<Result<Value>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                reply: tx,
            },
        );
        (id, rx)
    }

    /// Drop a registration whose request never made it onto the wire
    pub fn forget(&self, id: u64) {
        self.pending.remove(&id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Wait for the response to `id`, bounded by the request timeout
    ///
    /// The registration is released even if the caller abandons this future.
    pub async fn wait(&self, id: u64, method: &str, rx: oneshot::Receiver<Result<Value>>) -> Result<Value> {
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        match timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::TransportDisconnected),
            Err(_) => {
                warn!(
                    target: "mcp_transport",
                    endpoint = %self.label,
                    method = %method,
                    id = id,
                    "Request timeout"
                );
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Route an inbound message: responses to waiting callers, everything else upward
    pub fn dispatch(&self, message: JsonRpcMessage) {
        let JsonRpcMessage::Response(response) = message else {
            self.emit(TransportEvent::Message(message));
            return;
        };

        let Some(id) = response.id.as_u64() else {
            debug!(
                target: "mcp_transport",
                endpoint = %self.label,
                id = %response.id,
                "Response with foreign id, forwarding"
            );
            self.emit(TransportEvent::Message(JsonRpcMessage::Response(response)));
            return;
        };

        match self.pending.remove(&id) {
            Some((_, pending)) => {
                let outcome = match response.payload {
                    ResponsePayload::Result(value) => Ok(value),
                    ResponsePayload::Error(error) => {
                        debug!(
                            target: "mcp_transport",
                            endpoint = %self.label,
                            method = %pending.method,
                            code = error.code,
                            "Remote returned error"
                        );
                        Err(McpError::from(error))
                    }
                };
                let _ = pending.reply.send(outcome);
            }
            None => {
                debug!(
                    target: "mcp_transport",
                    endpoint = %self.label,
                    id = id,
                    "Received response for unknown request"
                );
            }
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// The medium went away on its own
    pub fn close(&self, reason: &str) {
        let previous = self.link.swap(LINK_CLOSED, Ordering::SeqCst);
        if previous == LINK_CLOSED {
            return;
        }
        self.reject_all();
        if previous == LINK_CONNECTED {
            debug!(target: "mcp_transport", endpoint = %self.label, reason = %reason, "Link closed");
            self.emit(TransportEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }

    /// Caller-initiated teardown; no close event is raised
    pub fn shutdown(&self) {
        self.link.store(LINK_CLOSED, Ordering::SeqCst);
        self.reject_all();
    }

    fn reject_all(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.reply.send(Err(McpError::TransportDisconnected));
            }
        }
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("label", &self.label)
            .field("pending", &self.pending.len())
            .field("connected", &self.is_connected())
            .finish()
    }
}
