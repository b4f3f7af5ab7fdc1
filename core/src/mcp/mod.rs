/// Model Context Protocol (MCP) engine
///
/// Connects to remote endpoints over stdio, SSE or WebSocket, keeps each
/// session alive through reconnects and merges every endpoint's tools into
/// one routing index.
///
/// MCP Protocol Spec: https://spec.modelcontextprotocol.io/specification/
///
/// Architecture:
/// - `transport`: Framing and request correlation per binding
/// - `connection`: Per-endpoint lifecycle state machine
/// - `manager`: Owns all connections and the tool index
/// - `config`: Endpoint definitions and the persistence collaborator
/// - `types`: Protocol types (JSON-RPC 2.0 based)
pub mod backoff;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod index;
pub mod manager;
pub mod transport;
pub mod types;

pub use backoff::ReconnectPolicy;
pub use config::{
    AuthConfig, AuthScheme, ConfigStore, EndpointConfig, MemoryConfigStore, TransportKind,
};
pub use connection::{
    CapabilitySnapshot, Connection, ConnectionEvent, ConnectionListener, ConnectionOptions,
    ConnectionState,
};
pub use error::{McpError, Result};
pub use index::{IndexedTool, ToolIndex};
pub use manager::{ClientManager, EndpointStatus, ManagerOptions, StartupReport};
pub use transport::{Transport, TransportEvent, TransportFactory};
pub use types::{DEFAULT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
