//! Conversation state shared across agent loop iterations.

use crate::tools::ToolCallRequest;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

/// One entry in the conversation transcript.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    /// For [`Role::ToolResult`], the provider call id this result answers.
    pub tool_call_id: Option<String>,
    /// For [`Role::Assistant`], the tool calls the model issued alongside
    /// (or instead of) text content.
    pub tool_calls: Vec<ToolCallRequest>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content,
            tool_call_id: None,
            tool_calls: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into())
    }

    /// Assistant turn that requested tool calls.
    pub fn assistant_tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        let mut message = Self::new(Role::Assistant, String::new());
        message.tool_calls = calls;
        message
    }

    /// Result of one tool call, fed back for the model's next turn.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::new(Role::ToolResult, content.into());
        message.tool_call_id = Some(tool_call_id.into());
        message
    }
}

/// Ordered transcript with optional length-based pruning.
///
/// When `max_messages` is set, appending past the limit drops the oldest
/// entries. The system prompt lives outside the transcript and is never
/// pruned.
#[derive(Debug, Default)]
pub struct Session {
    system_prompt: Option<String>,
    messages: Vec<Message>,
    max_messages: Option<usize>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_messages(mut self, limit: usize) -> Self {
        self.max_messages = Some(limit.max(1));
        self
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
        if let Some(limit) = self.max_messages {
            if self.messages.len() > limit {
                let excess = self.messages.len() - limit;
                self.messages.drain(..excess);
            }
        }
    }

    pub fn history(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Clear the transcript, keeping the system prompt.
    pub fn reset(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_preserves_order() {
        let mut session = Session::new();
        session.append(Message::user("question"));
        session.append(Message::assistant("answer"));

        let roles: Vec<_> = session.history().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[test]
    fn pruning_drops_oldest_first() {
        let mut session = Session::new()
            .with_system_prompt("be helpful")
            .with_max_messages(2);
        session.append(Message::user("one"));
        session.append(Message::assistant("two"));
        session.append(Message::user("three"));

        assert_eq!(session.len(), 2);
        assert_eq!(session.history()[0].content, "two");
        // The system prompt survives pruning.
        assert_eq!(session.system_prompt(), Some("be helpful"));
    }

    #[test]
    fn reset_keeps_system_prompt() {
        let mut session = Session::new().with_system_prompt("be terse");
        session.append(Message::user("hello"));
        session.reset();

        assert!(session.is_empty());
        assert_eq!(session.system_prompt(), Some("be terse"));
    }

    #[test]
    fn tool_result_carries_call_id() {
        let call = ToolCallRequest::new("call_1", "echo", json!({"value": "x"}));
        let assistant = Message::assistant_tool_calls(vec![call]);
        assert_eq!(assistant.tool_calls.len(), 1);

        let result = Message::tool_result("call_1", "echo: x");
        assert_eq!(result.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(result.role, Role::ToolResult);
    }
}
