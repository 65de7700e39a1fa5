//! Model provider abstraction.
//!
//! The agent loop talks to a [`ModelProvider`] and never to a concrete API.
//! A provider turns the transcript plus the available tool catalog into
//! either a final answer or a batch of tool calls.

pub mod openai;

pub use openai::{OpenAiConfig, OpenAiProvider};

use crate::agent::session::Message;
use crate::error::AgentError;
use crate::mcp::types::ToolDescriptor;
use crate::tools::ToolCallRequest;
use async_trait::async_trait;

/// What the model decided to do with its turn.
#[derive(Debug)]
pub enum ModelResponse {
    /// Terminal answer for the user. Ends the loop.
    FinalAnswer(String),
    /// Tool calls to execute before the model speaks again.
    ToolCalls(Vec<ToolCallRequest>),
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Run one model turn over the transcript.
    ///
    /// `tools` is the catalog the model may call. An empty catalog forces
    /// a text answer.
    async fn generate(
        &self,
        system_prompt: Option<&str>,
        history: &[Message],
        tools: &[ToolDescriptor],
    ) -> Result<ModelResponse, AgentError>;

    /// Identifier of the underlying model, for logs.
    fn model_id(&self) -> &str;
}
