/// MCP protocol types
///
/// Based on Model Context Protocol specification (JSON-RPC 2.0)
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// JSON-RPC version literal carried by every message
pub const JSONRPC_VERSION: &str = "2.0";

/// Default MCP protocol version (as of November 2024)
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Supported MCP protocol versions
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2024-10-07"];

/// Method names used on the wire
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const SHUTDOWN: &str = "shutdown";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
}

/// Well-known JSON-RPC / MCP error codes
pub mod error_codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Generic server-side failure
    pub const SERVER_ERROR: i32 = -32000;
    /// Request arrived before the initialize handshake completed
    pub const SERVER_NOT_INITIALIZED: i32 = -32002;
}

// ==============================================================================
// JSON-RPC envelope
// ==============================================================================

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    /// Client-issued ids are integers; remote ids are echoed back verbatim
    pub id: Value,
    pub method: String,
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 Notification (no id, no response)
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification {
    pub method: String,
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: Value,
    pub payload: ResponsePayload,
}

/// Exactly one of `result` or `error`
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(JsonRpcError),
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(detail: impl fmt::Display) -> Self {
        Self::new(error_codes::PARSE_ERROR, format!("Parse error: {detail}"))
    }

    pub fn invalid_request(detail: impl fmt::Display) -> Self {
        Self::new(
            error_codes::INVALID_REQUEST,
            format!("Invalid request: {detail}"),
        )
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    pub fn invalid_params(detail: impl fmt::Display) -> Self {
        Self::new(
            error_codes::INVALID_PARAMS,
            format!("Invalid params: {detail}"),
        )
    }

    pub fn internal(detail: impl fmt::Display) -> Self {
        Self::new(
            error_codes::INTERNAL_ERROR,
            format!("Internal error: {detail}"),
        )
    }

    pub fn not_initialized() -> Self {
        Self::new(error_codes::SERVER_NOT_INITIALIZED, "Server not initialized")
    }
}

/// Any message that can travel over a transport.
///
/// Classified by the presence of `id` and `method`: both means request,
/// `method` alone means notification, `id` alone means response.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

/// Why an inbound frame could not become a [`JsonRpcMessage`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MessageError {
    /// Not valid JSON at all
    #[error("parse error: {0}")]
    Parse(String),
    /// Valid JSON, but not a JSON-RPC message
    #[error("invalid message: {0}")]
    Invalid(String),
}

impl MessageError {
    /// The JSON-RPC error object a responder should answer with
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            MessageError::Parse(detail) => JsonRpcError::parse_error(detail),
            MessageError::Invalid(detail) => JsonRpcError::invalid_request(detail),
        }
    }
}

impl JsonRpcMessage {
    pub fn request(id: impl Into<Value>, method: &str, params: Option<Value>) -> Self {
        JsonRpcMessage::Request(JsonRpcRequest {
            id: id.into(),
            method: method.to_string(),
            params,
        })
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification {
            method: method.to_string(),
            params,
        })
    }

    pub fn result(id: Value, result: Value) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse {
            id,
            payload: ResponsePayload::Result(result),
        })
    }

    pub fn error(id: Value, error: JsonRpcError) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse {
            id,
            payload: ResponsePayload::Error(error),
        })
    }

    /// Parse one frame (a single JSON document)
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| MessageError::Parse(e.to_string()))?;
        Self::try_from(value)
    }

    /// Serialize to a single-line JSON document (no trailing newline)
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            JsonRpcMessage::Response(_) => None,
        }
    }
}

impl TryFrom<Value> for JsonRpcMessage {
    type Error = MessageError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut obj) = value else {
            return Err(MessageError::Invalid("message must be a JSON object".into()));
        };

        match obj.remove("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(other) => {
                return Err(MessageError::Invalid(format!(
                    "unsupported jsonrpc version: {other}"
                )))
            }
            None => return Err(MessageError::Invalid("missing jsonrpc version".into())),
        }

        let id = obj.remove("id");
        let method = obj.remove("method");
        let params = obj.remove("params");

        match (id, method) {
            (Some(id), Some(Value::String(method))) => {
                Ok(JsonRpcMessage::Request(JsonRpcRequest { id, method, params }))
            }
            (None, Some(Value::String(method))) => {
                Ok(JsonRpcMessage::Notification(JsonRpcNotification {
                    method,
                    params,
                }))
            }
            (_, Some(_)) => Err(MessageError::Invalid("method must be a string".into())),
            (Some(id), None) => response_from_parts(id, obj),
            (None, None) => Err(MessageError::Invalid(
                "message has neither id nor method".into(),
            )),
        }
    }
}

fn response_from_parts(id: Value, mut obj: Map<String, Value>) -> Result<JsonRpcMessage, MessageError> {
    let result = obj.remove("result");
    let error = obj.remove("error");
    let payload = match (result, error) {
        (Some(_), Some(_)) => {
            return Err(MessageError::Invalid(
                "response carries both result and error".into(),
            ))
        }
        (Some(result), None) => ResponsePayload::Result(result),
        (None, Some(error)) => {
            let error: JsonRpcError = serde_json::from_value(error)
                .map_err(|e| MessageError::Invalid(format!("malformed error object: {e}")))?;
            ResponsePayload::Error(error)
        }
        (None, None) => {
            return Err(MessageError::Invalid(
                "response carries neither result nor error".into(),
            ))
        }
    };
    Ok(JsonRpcMessage::Response(JsonRpcResponse { id, payload }))
}

impl Serialize for JsonRpcMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        match self {
            JsonRpcMessage::Request(req) => {
                map.serialize_entry("id", &req.id)?;
                map.serialize_entry("method", &req.method)?;
                if let Some(params) = &req.params {
                    map.serialize_entry("params", params)?;
                }
            }
            JsonRpcMessage::Notification(n) => {
                map.serialize_entry("method", &n.method)?;
                if let Some(params) = &n.params {
                    map.serialize_entry("params", params)?;
                }
            }
            JsonRpcMessage::Response(resp) => {
                map.serialize_entry("id", &resp.id)?;
                match &resp.payload {
                    ResponsePayload::Result(result) => map.serialize_entry("result", result)?,
                    ResponsePayload::Error(error) => map.serialize_entry("error", error)?,
                }
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        JsonRpcMessage::try_from(value).map_err(serde::de::Error::custom)
    }
}

// ==============================================================================
// Handshake
// ==============================================================================

/// MCP initialization request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

/// Client capabilities
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootsCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Client information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// MCP initialization result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo", default)]
    pub server_info: Option<ServerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Server capabilities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcesCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    #[serde(rename = "listChanged")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptsCapability {
    #[serde(rename = "listChanged")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Server information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

// ==============================================================================
// Capability records
// ==============================================================================

/// MCP Tool definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value, // JSON Schema
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// MCP Resource definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// MCP Prompt definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// Cursor parameters shared by every `*/list` request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// tools/list result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// resources/list result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResourcesResult {
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// prompts/list result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPromptsResult {
    #[serde(default)]
    pub prompts: Vec<Prompt>,
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// tools/call request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// Tool call result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// Concatenation of every text-bearing block
    pub fn joined_text(&self) -> String {
        let mut parts = Vec::new();
        for item in &self.content {
            match item {
                ToolContent::Text { text } => parts.push(text.clone()),
                ToolContent::Image { .. } => parts.push("[image content]".to_string()),
                ToolContent::Resource { resource } => match &resource.text {
                    Some(text) => parts.push(text.clone()),
                    None => parts.push(format!("[resource: {}]", resource.uri)),
                },
            }
        }
        parts.join("\n")
    }
}

/// Tool content (text, image or embedded resource)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(rename = "resource")]
    Resource { resource: ResourceContents },
}

/// Resource contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContents {
    pub uri: String,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>, // base64
}

/// resources/read result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceResult {
    #[serde(default)]
    pub contents: Vec<ResourceContents>,
}

/// prompts/get result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPromptResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub messages: Vec<PromptMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: ToolContent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reparse(message: &JsonRpcMessage) -> JsonRpcMessage {
        let line = message.to_line().unwrap();
        JsonRpcMessage::parse(&line).unwrap()
    }

    #[test]
    fn test_classifies_by_id_and_method() {
        let req = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#).unwrap();
        assert!(matches!(req, JsonRpcMessage::Request(ref r) if r.id == json!(7)));

        let note =
            JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(matches!(note, JsonRpcMessage::Notification(_)));

        let resp = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":"abc","result":{}}"#).unwrap();
        assert!(matches!(resp, JsonRpcMessage::Response(ref r) if r.id == json!("abc")));
    }

    #[test]
    fn test_round_trip_preserves_messages() {
        let messages = vec![
            JsonRpcMessage::request(1u64, "tools/call", Some(json!({"name": "x", "arguments": {"a": [1, 2]}}))),
            JsonRpcMessage::request("opaque-id", "ping", None),
            JsonRpcMessage::notification("notifications/tools/list_changed", None),
            JsonRpcMessage::notification("custom", Some(Value::Null)),
            JsonRpcMessage::result(json!(3), Value::Null),
            JsonRpcMessage::result(json!(4), json!({"tools": []})),
            JsonRpcMessage::error(
                json!(5),
                JsonRpcError {
                    code: -32601,
                    message: "Method not found".into(),
                    data: Some(json!({"method": "nope"})),
                },
            ),
        ];

        for message in messages {
            assert_eq!(reparse(&message), message);
        }
    }

    #[test]
    fn test_null_result_survives_round_trip() {
        let line = JsonRpcMessage::result(json!(9), Value::Null).to_line().unwrap();
        assert!(line.contains("\"result\":null"));
    }

    #[test]
    fn test_parse_error_vs_invalid_request() {
        let err = JsonRpcMessage::parse("{not json").unwrap_err();
        assert!(matches!(err, MessageError::Parse(_)));
        assert_eq!(err.to_rpc_error().code, error_codes::PARSE_ERROR);

        let err = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0"}"#).unwrap_err();
        assert!(matches!(err, MessageError::Invalid(_)));
        assert_eq!(err.to_rpc_error().code, error_codes::INVALID_REQUEST);

        let err = JsonRpcMessage::parse(r#"[1,2,3]"#).unwrap_err();
        assert!(matches!(err, MessageError::Invalid(_)));

        let err = JsonRpcMessage::parse(r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#).unwrap_err();
        assert!(matches!(err, MessageError::Invalid(_)));
    }

    #[test]
    fn test_response_with_both_result_and_error_is_rejected() {
        let err = JsonRpcMessage::parse(
            r#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":"x"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, MessageError::Invalid(_)));
    }

    #[test]
    fn test_tool_definition_defaults_schema() {
        let tool: Tool = serde_json::from_str(r#"{"name": "search"}"#).unwrap();
        assert_eq!(tool.name, "search");
        assert!(tool.description.is_none());
        assert_eq!(tool.input_schema["type"], "object");
    }

    #[test]
    fn test_call_tool_result_is_error_flag() {
        let ok = serde_json::to_value(CallToolResult::text("hi")).unwrap();
        assert!(ok.get("isError").is_none());

        let failed = serde_json::to_value(CallToolResult::error_text("boom")).unwrap();
        assert_eq!(failed["isError"], true);
        assert_eq!(failed["content"][0]["type"], "text");
        assert_eq!(failed["content"][0]["text"], "boom");
    }

    #[test]
    fn test_joined_text_flattens_content() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "one"},
                {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                {"type": "resource", "resource": {"uri": "file:///a"}}
            ]
        }))
        .unwrap();
        assert_eq!(result.joined_text(), "one\n[image content]\n[resource: file:///a]");
    }
}
