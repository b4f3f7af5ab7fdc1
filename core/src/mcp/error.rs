use super::types::JsonRpcError;
use serde_json::Value;

/// MCP error types
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport already connecting or connected")]
    AlreadyConnected,

    #[error("Transport disconnected")]
    TransportDisconnected,

    #[error("Endpoint '{0}' is not connected")]
    NotConnected(String),

    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Server error {code}: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool '{tool}' failed: {message}")]
    ToolCall { tool: String, message: String },

    #[error("Unknown endpoint: {0}")]
    EndpointNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Convert to error code string
    pub fn code(&self) -> &'static str {
        match self {
            McpError::Transport(_) => "TRANSPORT_ERROR",
            McpError::Protocol(_) => "PROTOCOL_ERROR",
            McpError::AlreadyConnected => "ALREADY_CONNECTED",
            McpError::TransportDisconnected => "TRANSPORT_DISCONNECTED",
            McpError::NotConnected(_) => "NOT_CONNECTED",
            McpError::Timeout { .. } => "TIMEOUT",
            McpError::Rpc { .. } => "SERVER_ERROR",
            McpError::ToolNotFound(_) => "TOOL_NOT_FOUND",
            McpError::ToolCall { .. } => "TOOL_ERROR",
            McpError::EndpointNotFound(_) => "ENDPOINT_NOT_FOUND",
            McpError::Config(_) => "CONFIG_ERROR",
            McpError::InvalidParams(_) => "INVALID_PARAMS",
            McpError::Io(_) => "IO_ERROR",
            McpError::Json(_) => "JSON_ERROR",
        }
    }

    /// True for failures of the link itself rather than of one request
    pub fn is_transport_level(&self) -> bool {
        matches!(
            self,
            McpError::Transport(_) | McpError::TransportDisconnected | McpError::Io(_)
        )
    }
}

impl From<JsonRpcError> for McpError {
    fn from(err: JsonRpcError) -> Self {
        McpError::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

pub type Result<T> = std::result::Result<T, McpError>;
