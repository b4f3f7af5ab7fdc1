//! WebSocket binding
//!
//! Full duplex over one socket. A heartbeat task pings every
//! [`PING_INTERVAL`] and force-closes the link if no pong arrives within
//! [`PONG_TIMEOUT`], which catches half-open connections.

use super::auth::request_headers;
use super::rpc::{EventReceiver, RpcChannel};
use super::{Transport, TransportEvent};
use crate::mcp::config::EndpointConfig;
use crate::mcp::error::{McpError, Result};
use crate::mcp::types::JsonRpcMessage;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Sink = Arc<Mutex<Option<SplitSink<Socket, Message>>>>;

/// Rewrite `http(s)://` to `ws(s)://` and append `/ws` unless already present
pub fn socket_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| McpError::Config(format!("invalid endpoint url '{}': {}", raw, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(McpError::Config(format!(
                "unsupported websocket scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| McpError::Config(format!("cannot rewrite scheme of '{}'", raw)))?;

    let path = url.path().trim_end_matches('/').to_string();
    if !path.ends_with("/ws") {
        url.set_path(&format!("{path}/ws"));
    }
    Ok(url)
}

#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    interval: Duration,
    timeout: Duration,
}

pub struct WebSocketTransport {
    config: EndpointConfig,
    rpc: Arc<RpcChannel>,
    url: Url,
    heartbeat: Heartbeat,
    sink: Sink,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new(config: EndpointConfig, request_timeout: Duration) -> Result<(Self, EventReceiver)> {
        Self::with_heartbeat(config, request_timeout, PING_INTERVAL, PONG_TIMEOUT)
    }

    pub(crate) fn with_heartbeat(
        config: EndpointConfig,
        request_timeout: Duration,
        ping_interval: Duration,
        pong_timeout: Duration,
    ) -> Result<(Self, EventReceiver)> {
        let raw = config
            .url
            .as_deref()
            .ok_or_else(|| McpError::Config("websocket endpoint has no url".to_string()))?;
        let url = socket_url(raw)?;
        let (rpc, events) = RpcChannel::new(config.id.clone(), request_timeout);
        let transport = Self {
            config,
            rpc: Arc::new(rpc),
            url,
            heartbeat: Heartbeat {
                interval: ping_interval,
                timeout: pong_timeout,
            },
            sink: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
        };
        Ok((transport, events))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn open(&self) -> Result<Socket> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| McpError::Transport(format!("Invalid websocket request: {}", e)))?;

        for (name, value) in request_headers(&self.config) {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| McpError::Config(format!("invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| McpError::Config(format!("invalid header value: {}", e)))?;
            request.headers_mut().insert(name, value);
        }

        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| McpError::Transport(format!("WebSocket connect failed: {}", e)))?;
        Ok(socket)
    }

    fn spawn_reader(&self, mut stream: SplitStream<Socket>, pongs: Arc<AtomicU64>) -> JoinHandle<()> {
        let rpc = Arc::clone(&self.rpc);

        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => dispatch_text(&rpc, &text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => dispatch_text(&rpc, &text),
                        Err(_) => rpc.emit(TransportEvent::Error("non-utf8 binary frame".into())),
                    },
                    Some(Ok(Message::Pong(_))) => {
                        pongs.fetch_add(1, Ordering::SeqCst);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break format!("socket closed by peer: {:?}", frame.map(|f| f.reason));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        rpc.emit(TransportEvent::Error(e.to_string()));
                        break format!("socket error: {e}");
                    }
                    None => break "socket stream ended".to_string(),
                }
            };
            rpc.close(&reason);
        })
    }

    fn spawn_heartbeat(&self, pongs: Arc<AtomicU64>) -> JoinHandle<()> {
        let rpc = Arc::clone(&self.rpc);
        let sink = Arc::clone(&self.sink);
        let heartbeat = self.heartbeat;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(heartbeat.interval).await;
                if !rpc.is_connected() {
                    return;
                }

                let seen = pongs.load(Ordering::SeqCst);
                let sent = match sink.lock().await.as_mut() {
                    Some(sink) => sink.send(Message::Ping(Vec::new())).await.is_ok(),
                    None => false,
                };
                if !sent {
                    rpc.close("ping could not be sent");
                    return;
                }

                tokio::time::sleep(heartbeat.timeout).await;
                if pongs.load(Ordering::SeqCst) == seen {
                    warn!(
                        target: "mcp_transport",
                        endpoint = %rpc.label(),
                        timeout_ms = heartbeat.timeout.as_millis() as u64,
                        "Ping not acknowledged, closing socket"
                    );
                    if let Some(mut sink) = sink.lock().await.take() {
                        let _ = sink.close().await;
                    }
                    rpc.close("ping not acknowledged");
                    return;
                }
            }
        })
    }
}

fn dispatch_text(rpc: &RpcChannel, text: &str) {
    match JsonRpcMessage::parse(text) {
        Ok(message) => rpc.dispatch(message),
        Err(e) => {
            warn!(target: "mcp_transport", endpoint = %rpc.label(), error = %e, "Dropping malformed frame");
            rpc.emit(TransportEvent::Error(e.to_string()));
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn rpc(&self) -> &RpcChannel {
        &self.rpc
    }

    async fn connect(&self) -> Result<()> {
        self.rpc.begin_connect()?;
        info!(target: "mcp_transport", endpoint = %self.config.id, url = %self.url, "Opening websocket");

        let socket = match self.open().await {
            Ok(socket) => socket,
            Err(e) => {
                self.rpc.abort_connect();
                return Err(e);
            }
        };

        let (sink, stream) = socket.split();
        *self.sink.lock().await = Some(sink);

        self.rpc.mark_connected();
        let pongs = Arc::new(AtomicU64::new(0));
        let reader = self.spawn_reader(stream, Arc::clone(&pongs));
        let heartbeat = self.spawn_heartbeat(pongs);

        let mut tasks = self.tasks.lock().await;
        for old in tasks.drain(..) {
            old.abort();
        }
        tasks.push(reader);
        tasks.push(heartbeat);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.rpc.shutdown();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        debug!(target: "mcp_transport", endpoint = %self.config.id, "Websocket closed");
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        let text = message.to_line()?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(McpError::TransportDisconnected)?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| McpError::Transport(format!("WebSocket send failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_socket_url_rewrite() {
        assert_eq!(socket_url("http://host:8080").unwrap().as_str(), "ws://host:8080/ws");
        assert_eq!(socket_url("https://host/api/").unwrap().as_str(), "wss://host/api/ws");
        assert_eq!(socket_url("wss://host/ws").unwrap().as_str(), "wss://host/ws");
        assert!(socket_url("ftp://host").is_err());
    }

    /// Accepts one socket and answers each request with its own method name
    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = socket.next().await {
                if let Message::Text(text) = message {
                    if let Ok(JsonRpcMessage::Request(req)) = JsonRpcMessage::parse(&text) {
                        let reply = JsonRpcMessage::result(req.id, json!(req.method));
                        socket
                            .send(Message::Text(reply.to_line().unwrap()))
                            .await
                            .unwrap();
                    }
                }
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let url = echo_server().await;
        let config = EndpointConfig::websocket("ws", url);
        let (transport, _events) = WebSocketTransport::new(config, Duration::from_secs(2)).unwrap();
        transport.connect().await.unwrap();

        let value = transport.send_request("tools/list", None).await.unwrap();
        assert_eq!(value, json!("tools/list"));

        transport.disconnect().await.unwrap();
        assert!(transport.send_request("tools/list", None).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_pong_closes_link() {
        // server completes the handshake and then never reads, so pings go unanswered
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let socket = accept_async(stream).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let config = EndpointConfig::websocket("half-open", format!("http://{}", addr));
        let (transport, mut events) = WebSocketTransport::with_heartbeat(
            config,
            Duration::from_secs(5),
            Duration::from_millis(50),
            Duration::from_millis(100),
        )
        .unwrap();
        transport.connect().await.unwrap();

        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(TransportEvent::Closed { reason })) => {
                assert!(reason.contains("ping"), "unexpected reason: {reason}")
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert!(!transport.is_connected());
        transport.disconnect().await.unwrap();
        server.abort();
    }
}
