//! Tool call routing and execution.
//!
//! The [`ToolDispatcher`] takes model-issued tool calls, validates them
//! against the registry's schemas, routes each to its owning server, and
//! applies the retry policy. Results come back in request order.

pub mod dispatcher;
pub mod schema;

pub use dispatcher::{DispatcherConfig, RetryConfig, ToolDispatcher};
pub use schema::SchemaNode;

use crate::error::AgentError;
use crate::mcp::types::CallToolResult;
use serde_json::Value;

/// One tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Provider-assigned call id, echoed back in the tool result message.
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// Outcome of one dispatch, paired with the request that produced it.
#[derive(Debug)]
pub struct ToolCallResult {
    pub request: ToolCallRequest,
    pub outcome: Result<CallToolResult, AgentError>,
}

impl ToolCallResult {
    /// Render the outcome as the text fed back to the model. Failures are
    /// reported in-band so the model can react instead of the loop dying.
    pub fn render(&self) -> String {
        match &self.outcome {
            Ok(result) => result.text(),
            Err(error) => format!("Tool call failed: {}", error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}
