/// Stdio host responder
///
/// Reads newline-framed JSON-RPC, dispatches `initialize`, `tools/list`,
/// `tools/call`, `ping` and `shutdown` against a [`CapabilityProvider`] and
/// writes framed responses back. Tool calls run concurrently; everything
/// that changes session state is handled in arrival order.
use super::provider::CapabilityProvider;
use crate::mcp::error::Result;
use crate::mcp::types::*;
use crate::tools::ToolResult;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// Result of dispatching one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub reply: Option<JsonRpcMessage>,
    pub stop: bool,
}

impl Outcome {
    fn reply(message: JsonRpcMessage) -> Self {
        Self {
            reply: Some(message),
            stop: false,
        }
    }

    fn silent() -> Self {
        Self {
            reply: None,
            stop: false,
        }
    }
}

pub struct HostServer {
    provider: Arc<dyn CapabilityProvider>,
    server_info: ServerInfo,
    instructions: Option<String>,
    initialize_seen: AtomicBool,
    initialized: AtomicBool,
}

impl HostServer {
    pub fn new(provider: Arc<dyn CapabilityProvider>, server_info: ServerInfo) -> Self {
        Self {
            provider,
            server_info,
            instructions: None,
            initialize_seen: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// True once the `initialized` notification has arrived
    pub fn is_ready(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Serve on this process's stdin/stdout until EOF or `shutdown`
    pub async fn serve_stdio(&self) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();
        self.serve(stdin, stdout).await
    }

    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!(target: "mcp_host", server = %self.server_info.name, "Host responder started");
        let mut frames = reader.split(b'\n');
        let mut inflight = FuturesUnordered::new();
        let mut input_open = true;

        loop {
            tokio::select! {
                frame = frames.next_segment(), if input_open => {
                    let Some(frame) = frame? else {
                        debug!(target: "mcp_host", "Input closed");
                        input_open = false;
                        continue;
                    };
                    let line = match String::from_utf8(frame) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(target: "mcp_host", error = %e, "Rejecting non-UTF-8 frame");
                            let reply = JsonRpcMessage::error(Value::Null, JsonRpcError::parse_error(e));
                            write_frame(&mut writer, &reply).await?;
                            continue;
                        }
                    };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    let message = match JsonRpcMessage::parse(line) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(target: "mcp_host", error = %e, "Rejecting malformed frame");
                            let reply = JsonRpcMessage::error(Value::Null, e.to_rpc_error());
                            write_frame(&mut writer, &reply).await?;
                            continue;
                        }
                    };

                    if self.runs_concurrently(&message) {
                        inflight.push(self.dispatch(message));
                        continue;
                    }

                    let outcome = self.dispatch(message).await;
                    if let Some(reply) = &outcome.reply {
                        write_frame(&mut writer, reply).await?;
                    }
                    if outcome.stop {
                        // let the reply reach the peer before tearing down
                        tokio::task::yield_now().await;
                        input_open = false;
                    }
                }
                Some(outcome) = inflight.next(), if !inflight.is_empty() => {
                    if let Some(reply) = &outcome.reply {
                        write_frame(&mut writer, reply).await?;
                    }
                }
                else => break,
            }
        }

        info!(target: "mcp_host", "Host responder stopped");
        Ok(())
    }

    /// Tool calls that passed the session check can overlap with later input
    fn runs_concurrently(&self, message: &JsonRpcMessage) -> bool {
        matches!(message, JsonRpcMessage::Request(req) if req.method == methods::TOOLS_CALL && self.is_ready())
    }

    /// Handle one parsed frame
    pub async fn dispatch(&self, message: JsonRpcMessage) -> Outcome {
        match message {
            JsonRpcMessage::Request(request) => self.handle_request(request).await,
            JsonRpcMessage::Notification(note) => {
                self.handle_notification(&note);
                Outcome::silent()
            }
            JsonRpcMessage::Response(response) => {
                debug!(target: "mcp_host", id = %response.id, "Ignoring response frame");
                Outcome::silent()
            }
        }
    }

    /// Parse and handle one raw line
    pub async fn handle_line(&self, line: &str) -> Outcome {
        match JsonRpcMessage::parse(line) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => Outcome::reply(JsonRpcMessage::error(Value::Null, e.to_rpc_error())),
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> Outcome {
        let JsonRpcRequest { id, method, params } = request;
        debug!(target: "mcp_host", method = %method, id = %id, "Request");

        let reply = match method.as_str() {
            methods::INITIALIZE => self.initialize(id, params),
            methods::PING => JsonRpcMessage::result(id, json!({})),
            methods::SHUTDOWN => {
                info!(target: "mcp_host", "Shutdown requested");
                return Outcome {
                    reply: Some(JsonRpcMessage::result(id, Value::Null)),
                    stop: true,
                };
            }
            methods::TOOLS_LIST | methods::TOOLS_CALL if !self.is_ready() => {
                JsonRpcMessage::error(id, JsonRpcError::not_initialized())
            }
            methods::TOOLS_LIST => {
                let result = ListToolsResult {
                    tools: self.provider.list_tools().await,
                    next_cursor: None,
                };
                match serde_json::to_value(result) {
                    Ok(value) => JsonRpcMessage::result(id, value),
                    Err(e) => JsonRpcMessage::error(id, JsonRpcError::internal(e)),
                }
            }
            methods::TOOLS_CALL => self.call_tool(id, params).await,
            other => JsonRpcMessage::error(id, JsonRpcError::method_not_found(other)),
        };
        Outcome::reply(reply)
    }

    fn initialize(&self, id: Value, params: Option<Value>) -> JsonRpcMessage {
        if self.initialize_seen.swap(true, Ordering::SeqCst) {
            return JsonRpcMessage::error(id, JsonRpcError::invalid_request("already initialized"));
        }

        let requested = params
            .as_ref()
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let protocol_version = match requested {
            Some(v) if SUPPORTED_PROTOCOL_VERSIONS.contains(&v) => v.to_string(),
            _ => DEFAULT_PROTOCOL_VERSION.to_string(),
        };
        let client = params
            .as_ref()
            .and_then(|p| p.get("clientInfo"))
            .and_then(|c| c.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(target: "mcp_host", client = %client, protocol = %protocol_version, "Initialize");

        let result = InitializeResult {
            protocol_version,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
                ..Default::default()
            },
            server_info: Some(self.server_info.clone()),
            instructions: self.instructions.clone(),
        };
        match serde_json::to_value(result) {
            Ok(value) => JsonRpcMessage::result(id, value),
            Err(e) => JsonRpcMessage::error(id, JsonRpcError::internal(e)),
        }
    }

    async fn call_tool(&self, id: Value, params: Option<Value>) -> JsonRpcMessage {
        let params: CallToolParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) => {
                return JsonRpcMessage::error(id, JsonRpcError::invalid_params("missing tool name"))
            }
            Err(e) => return JsonRpcMessage::error(id, JsonRpcError::invalid_params(e)),
        };

        debug!(target: "mcp_host", tool = %params.name, "Executing tool");
        let arguments = params.arguments.unwrap_or_else(|| json!({}));
        let output = self.provider.execute_tool(&params.name, arguments).await;
        if let Err(e) = &output {
            warn!(target: "mcp_host", tool = %params.name, error = %e, "Tool failed");
        }
        JsonRpcMessage::result(id, normalize_output(output))
    }

    fn handle_notification(&self, note: &JsonRpcNotification) {
        match note.method.as_str() {
            methods::INITIALIZED => {
                if !self.initialize_seen.load(Ordering::SeqCst) {
                    warn!(target: "mcp_host", "initialized notification before initialize, ignoring");
                    return;
                }
                self.initialized.store(true, Ordering::SeqCst);
                debug!(target: "mcp_host", "Session ready");
            }
            other => debug!(target: "mcp_host", method = %other, "Ignoring notification"),
        }
    }
}

/// Shape a provider result as a `tools/call` result.
///
/// A string becomes one text block, an object that already has a `content`
/// array passes through unchanged, anything else is serialised to text and
/// an error becomes a text block flagged with `isError`.
pub fn normalize_output(output: ToolResult<Value>) -> Value {
    let shaped = match output {
        Ok(Value::String(text)) => CallToolResult::text(text),
        Ok(value @ Value::Object(_)) if value.get("content").map_or(false, Value::is_array) => {
            return value;
        }
        Ok(other) => CallToolResult::text(other.to_string()),
        Err(e) => CallToolResult::error_text(e.to_string()),
    };
    serde_json::to_value(shaped).unwrap_or_else(|_| json!({ "content": [], "isError": true }))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &JsonRpcMessage) -> Result<()> {
    let mut line = message.to_line()?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
