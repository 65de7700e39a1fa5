//! Model Context Protocol client layer.
//!
//! JSON-RPC 2.0 framing over pluggable transports (child-process stdio or
//! WebSocket), a correlation-tracking [`McpClient`], and the
//! [`ToolRegistry`] that mirrors each server's advertised catalog.

pub mod client;
pub mod registry;
pub mod test_utils;
pub mod transport;
pub mod types;

pub use client::{ConnectionStatus, McpClient, McpClientConfig};
pub use registry::{RegisteredTool, ToolRegistry};
pub use transport::{
    McpTransport, StdioConfig, TransportFactory, TransportInfo, TransportStreams,
    WebSocketConfig,
};
pub use types::{
    CallToolResult, CorrelationId, JsonRpcError, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ToolAnnotations, ToolContent, ToolDescriptor,
};
