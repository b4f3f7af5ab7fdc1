// Tether Core Library
// MCP protocol engine: transports, connections, client manager and stdio host

pub mod config;
pub mod host;
pub mod mcp;
pub mod telemetry;
pub mod tools;

// Export core types
pub use config::TetherConfig;
pub use host::{CapabilityProvider, HostServer, RegistryProvider};
pub use mcp::{
    ClientManager, Connection, ConnectionEvent, ConnectionState, EndpointConfig, McpError,
    TransportKind,
};
pub use tools::{Tool, ToolError, ToolRegistry};
