//! Error types for the agent runtime.
//!
//! A single [`AgentError`] covers every failure mode the runtime can surface:
//! transport problems, protocol violations, argument validation, retry
//! exhaustion, and model failures. Helper constructors keep call sites terse
//! and the classification methods (`is_transient`, `is_timeout`) drive the
//! dispatcher's retry decisions.

use std::time::Duration;
use thiserror::Error;

/// Primary error type for all agent operations.
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// Transport connection could not be established, or was lost.
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        /// True when the connection was lost after a request had already
        /// been written, so the call may have executed on the server.
        mid_call: bool,
    },

    /// The server sent a malformed or unexpected response.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// No response arrived within the per-call bound.
    #[error("Timeout error: no response after {duration:?}")]
    Timeout { duration: Duration },

    /// Tool arguments failed schema validation, or the tool is unknown.
    #[error("Validation error for tool '{tool_name}': {message}")]
    Validation { tool_name: String, message: String },

    /// Retries were exhausted without a successful call.
    #[error("Tool unavailable: {message}")]
    Unavailable { message: String },

    /// The tool ran but reported an application-level failure.
    #[error("Tool '{tool_name}' failed: {message}")]
    ToolFailed { tool_name: String, message: String },

    /// The language model was unreachable or returned a malformed response.
    #[error("Model error: {message}")]
    Model { message: String },

    /// The agent loop hit its iteration bound without a final answer.
    #[error("Agent exhausted after {iterations} iterations without a final answer")]
    Exhausted { iterations: u32 },

    /// The run was cancelled before completing.
    #[error("Run cancelled")]
    Cancelled,

    /// Invalid configuration supplied by the caller.
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl AgentError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            mid_call: false,
        }
    }

    /// Connection lost while a written request was still awaiting its
    /// response.
    pub fn connection_lost_mid_call(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            mid_call: true,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    pub fn validation(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn tool_failed(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolFailed {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    pub fn model(message: impl Into<String>) -> Self {
        Self::Model {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether this failure is transient and a retry might succeed.
    ///
    /// Timeouts and connection-level failures are transient; validation
    /// errors, protocol violations, and tool-reported application errors are
    /// permanent and must never be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Whether this error represents a per-call timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the call's outcome at the server is unknown.
    ///
    /// A timeout or a connection lost after the request was written are
    /// both ambiguous: the server may have executed the tool. The
    /// dispatcher only retries an ambiguous failure when the tool is
    /// declared idempotent. A connection refused before anything was sent
    /// is transient but unambiguous, so every tool may retry it.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Connection { mid_call: true, .. }
        )
    }
}
