//! Server-Sent Events binding
//!
//! Server to client traffic arrives on a long-lived `GET {base}/sse` stream;
//! client to server messages are individual `POST {base}/message` requests.
//! The stream carries credentials as query parameters, POSTs carry them as
//! headers. A POST response body that holds JSON-RPC messages is dispatched
//! directly instead of waiting for the stream.

use super::auth::{apply_query_auth, request_headers};
use super::rpc::{EventReceiver, RpcChannel};
use super::{Transport, TransportEvent};
use crate::mcp::config::EndpointConfig;
use crate::mcp::error::{McpError, Result};
use crate::mcp::types::JsonRpcMessage;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

const STREAM_SUFFIX: &str = "sse";
const MESSAGE_SUFFIX: &str = "message";

/// One decoded event: the `event:` name (if any) and its joined `data:` lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental decoder; bytes may arrive split anywhere
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every event they completed.
    ///
    /// Lines are only decoded once their terminating newline has arrived, so
    /// a multi-byte character split across chunks is reassembled intact.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches('\n').trim_end_matches('\r');

            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    out.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        out
    }

    /// Flush a trailing event that was not blank-line terminated
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let mut rest = std::mem::take(&mut self.buffer);
            rest.push(b'\n');
            let mut events = self.feed(&rest);
            if let Some(event) = events.pop() {
                return Some(event);
            }
        }
        self.take_event()
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// Decode a complete body at once
pub fn decode_sse_events(body: &str) -> Vec<SseEvent> {
    let mut decoder = SseDecoder::new();
    let mut events = decoder.feed(body.as_bytes());
    events.extend(decoder.finish());
    events
}

/// Derive the stream and message URLs from the configured base
///
/// `https://host/mcp` and `https://host/mcp/sse` both yield
/// `https://host/mcp/sse` and `https://host/mcp/message`.
pub fn endpoint_urls(raw: &str) -> Result<(Url, Url)> {
    let mut base = Url::parse(raw.trim())
        .map_err(|e| McpError::Config(format!("invalid endpoint url '{}': {}", raw, e)))?;
    let trimmed = base.path().trim_end_matches('/').to_string();
    let root = trimmed
        .strip_suffix(&format!("/{STREAM_SUFFIX}"))
        .unwrap_or(&trimmed)
        .to_string();
    base.set_path(&root);
    base.set_query(None);

    let mut stream = base.clone();
    stream.set_path(&format!("{root}/{STREAM_SUFFIX}"));
    let mut message = base;
    message.set_path(&format!("{root}/{MESSAGE_SUFFIX}"));
    Ok((stream, message))
}

pub struct SseTransport {
    config: EndpointConfig,
    rpc: Arc<RpcChannel>,
    client: reqwest::Client,
    stream_url: Url,
    post_url: Arc<RwLock<Url>>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    pub fn new(config: EndpointConfig, request_timeout: Duration) -> Result<(Self, EventReceiver)> {
        let raw = config
            .url
            .as_deref()
            .ok_or_else(|| McpError::Config("sse endpoint has no url".to_string()))?;
        let (mut stream_url, message_url) = endpoint_urls(raw)?;
        apply_query_auth(&mut stream_url, &config.auth);

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| McpError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        let (rpc, events) = RpcChannel::new(config.id.clone(), request_timeout);
        let transport = Self {
            config,
            rpc: Arc::new(rpc),
            client,
            stream_url,
            post_url: Arc::new(RwLock::new(message_url)),
            stream_task: Mutex::new(None),
        };
        Ok((transport, events))
    }

    /// Where the next POST goes
    pub fn message_url(&self) -> Option<Url> {
        self.post_url.read().ok().map(|url| url.clone())
    }

    fn open_stream_request(&self) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .get(self.stream_url.clone())
            .header(ACCEPT, "text/event-stream");
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    fn spawn_stream_reader(&self, response: reqwest::Response) -> JoinHandle<()> {
        let rpc = Arc::clone(&self.rpc);
        let post_url = Arc::clone(&self.post_url);
        let stream_url = self.stream_url.clone();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::new();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        rpc.close(&format!("event stream failed: {e}"));
                        return;
                    }
                };
                for event in decoder.feed(&chunk) {
                    handle_stream_event(&rpc, &post_url, &stream_url, event);
                }
            }

            if let Some(event) = decoder.finish() {
                handle_stream_event(&rpc, &post_url, &stream_url, event);
            }
            rpc.close("event stream ended");
        })
    }
}

fn handle_stream_event(rpc: &RpcChannel, post_url: &RwLock<Url>, stream_url: &Url, event: SseEvent) {
    match event.event.as_deref() {
        Some("endpoint") => match stream_url.join(event.data.trim()) {
            Ok(url) => {
                debug!(target: "mcp_transport", endpoint = %rpc.label(), url = %url, "Stream announced message endpoint");
                if let Ok(mut guard) = post_url.write() {
                    *guard = url;
                }
            }
            Err(e) => warn!(
                target: "mcp_transport",
                endpoint = %rpc.label(),
                error = %e,
                "Ignoring unusable endpoint event"
            ),
        },
        None | Some("message") => dispatch_payload(rpc, &event.data),
        Some(other) => {
            debug!(target: "mcp_transport", endpoint = %rpc.label(), event = %other, "Ignoring stream event");
        }
    }
}

/// A payload may be one message or a JSON-RPC batch array
fn dispatch_payload(rpc: &RpcChannel, payload: &str) {
    let payload = payload.trim();
    if payload.is_empty() {
        return;
    }
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!(target: "mcp_transport", endpoint = %rpc.label(), error = %e, "Dropping malformed frame");
            rpc.emit(TransportEvent::Error(format!("parse error: {e}")));
            return;
        }
    };
    let items = match value {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };
    for item in items {
        match JsonRpcMessage::try_from(item) {
            Ok(message) => rpc.dispatch(message),
            Err(e) => rpc.emit(TransportEvent::Error(e.to_string())),
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn rpc(&self) -> &RpcChannel {
        &self.rpc
    }

    async fn connect(&self) -> Result<()> {
        self.rpc.begin_connect()?;

        info!(
            target: "mcp_transport",
            endpoint = %self.config.id,
            url = %self.stream_url.path(),
            "Opening event stream"
        );

        let response = match self.open_stream_request().send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                self.rpc.abort_connect();
                return Err(McpError::Transport(format!(
                    "Event stream rejected with status {}",
                    response.status()
                )));
            }
            Err(e) => {
                self.rpc.abort_connect();
                return Err(McpError::Transport(format!("Failed to open event stream: {}", e)));
            }
        };

        self.rpc.mark_connected();
        let task = self.spawn_stream_reader(response);
        if let Some(old) = self.stream_task.lock().await.replace(task) {
            old.abort();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.rpc.shutdown();
        if let Some(task) = self.stream_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        if !self.rpc.is_connected() {
            return Err(McpError::TransportDisconnected);
        }
        let url = self.message_url().ok_or(McpError::TransportDisconnected)?;
        let body = message.to_line()?;

        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body);
        for (name, value) in request_headers(&self.config) {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("POST failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::Transport(format!("POST rejected with status {}", status)));
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

        let text = response
            .text()
            .await
            .map_err(|e| McpError::Transport(format!("Failed to read POST response: {}", e)))?;

        if is_stream {
            for event in decode_sse_events(&text) {
                handle_stream_event(&self.rpc, &self.post_url, &self.stream_url, event);
            }
        } else if text.trim_start().starts_with(['{', '[']) {
            dispatch_payload(&self.rpc, &text);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_single_event() {
        let events = decode_sse_events("event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("message".into()),
                data: "{\"jsonrpc\":\"2.0\"}".into()
            }]
        );
    }

    #[test]
    fn test_joins_multiline_data_and_skips_comments() {
        let events = decode_sse_events(": keepalive\r\ndata: a\r\ndata: b\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: endp").is_empty());
        assert!(decoder.feed(b"oint\ndata: /message?s").is_empty());
        let events = decoder.feed(b"ession=1\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/message?session=1");
    }

    #[test]
    fn test_multibyte_character_split_across_chunks_survives() {
        let frame = "data: {\"text\":\"café\"}\n\n".as_bytes();
        let split = frame.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(&frame[..split]).is_empty());
        let events = decoder.feed(&frame[split..]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"text\":\"café\"}");
    }

    #[test]
    fn test_endpoint_urls_from_base_or_stream_url() {
        let (stream, message) = endpoint_urls("https://host/mcp").unwrap();
        assert_eq!(stream.as_str(), "https://host/mcp/sse");
        assert_eq!(message.as_str(), "https://host/mcp/message");

        let (stream, message) = endpoint_urls("https://host/mcp/sse/").unwrap();
        assert_eq!(stream.as_str(), "https://host/mcp/sse");
        assert_eq!(message.as_str(), "https://host/mcp/message");

        let (stream, _) = endpoint_urls("http://127.0.0.1:9000").unwrap();
        assert_eq!(stream.as_str(), "http://127.0.0.1:9000/sse");
    }

    #[test]
    fn test_stream_url_carries_credentials() {
        let config = EndpointConfig::sse("s", "https://host/mcp")
            .with_auth(crate::mcp::config::AuthConfig::bearer("secret"));
        let (transport, _rx) = SseTransport::new(config, Duration::from_secs(1)).unwrap();
        assert_eq!(transport.stream_url.as_str(), "https://host/mcp/sse?token=secret");
        assert_eq!(
            transport.message_url().unwrap().as_str(),
            "https://host/mcp/message"
        );
    }

    #[test]
    fn test_endpoint_event_redirects_posts() {
        let (rpc, _rx) = RpcChannel::new("s", Duration::from_secs(1));
        let (stream, message) = endpoint_urls("https://host/mcp").unwrap();
        let post_url = RwLock::new(message);
        handle_stream_event(
            &rpc,
            &post_url,
            &stream,
            SseEvent {
                event: Some("endpoint".into()),
                data: "/mcp/message?sessionId=abc".into(),
            },
        );
        assert_eq!(
            post_url.read().unwrap().as_str(),
            "https://host/mcp/message?sessionId=abc"
        );
    }

    #[test]
    fn test_batch_payload_dispatches_each_message() {
        let (rpc, mut rx) = RpcChannel::new("s", Duration::from_secs(1));
        dispatch_payload(
            &rpc,
            r#"[{"jsonrpc":"2.0","method":"a"},{"jsonrpc":"2.0","method":"b"}]"#,
        );
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Message(_))));
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Message(_))));
    }
}
