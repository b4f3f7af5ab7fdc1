//! Local tools the host can execute and re-export
pub mod error;
pub mod registry;
pub mod remote;
pub mod traits;

pub use error::{ToolError, ToolResult};
pub use registry::{ToolRegistry, DEFAULT_TOOL_TIMEOUT};
pub use remote::RemoteTool;
pub use traits::Tool;
