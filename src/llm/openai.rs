//! OpenAI-compatible chat completions provider.
//!
//! Works against any endpoint speaking the `/v1/chat/completions` dialect,
//! including local servers. Tool descriptors are exposed through the
//! `tools` array as function declarations and tool results travel back as
//! `tool` role messages keyed by `tool_call_id`.

use crate::agent::session::{Message, Role};
use crate::error::AgentError;
use crate::llm::{ModelProvider, ModelResponse};
use crate::mcp::types::ToolDescriptor;
use crate::tools::ToolCallRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            request_timeout: Duration::from_secs(120),
        }
    }
}

pub struct OpenAiProvider {
    config: OpenAiConfig,
    http: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AgentError::configuration(format!("http client: {}", e)))?;
        Ok(Self { config, http })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn build_messages(
        &self,
        system_prompt: Option<&str>,
        history: &[Message],
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(prompt) = system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: Some(prompt.to_string()),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        for message in history {
            messages.push(match message.role {
                Role::User => ChatMessage {
                    role: "user".to_string(),
                    content: Some(message.content.clone()),
                    tool_calls: None,
                    tool_call_id: None,
                },
                Role::Assistant => ChatMessage {
                    role: "assistant".to_string(),
                    content: if message.content.is_empty() {
                        None
                    } else {
                        Some(message.content.clone())
                    },
                    tool_calls: if message.tool_calls.is_empty() {
                        None
                    } else {
                        Some(
                            message
                                .tool_calls
                                .iter()
                                .map(|call| ChatToolCall {
                                    id: call.id.clone(),
                                    kind: "function".to_string(),
                                    function: ChatFunctionCall {
                                        name: call.tool_name.clone(),
                                        arguments: call.arguments.to_string(),
                                    },
                                })
                                .collect(),
                        )
                    },
                    tool_call_id: None,
                },
                Role::ToolResult => ChatMessage {
                    role: "tool".to_string(),
                    content: Some(message.content.clone()),
                    tool_calls: None,
                    tool_call_id: message.tool_call_id.clone(),
                },
            });
        }
        messages
    }

    fn build_tools(tools: &[ToolDescriptor]) -> Option<Vec<Value>> {
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .iter()
                .map(|tool| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.input_schema,
                        }
                    })
                })
                .collect(),
        )
    }

    fn parse_choice(&self, message: ResponseMessage) -> Result<ModelResponse, AgentError> {
        if let Some(calls) = message.tool_calls {
            if !calls.is_empty() {
                let mut requests = Vec::with_capacity(calls.len());
                for call in calls {
                    let arguments: Value = if call.function.arguments.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&call.function.arguments).map_err(|e| {
                            AgentError::model(format!(
                                "tool call '{}' has malformed arguments: {}",
                                call.function.name, e
                            ))
                        })?
                    };
                    requests.push(ToolCallRequest::new(call.id, call.function.name, arguments));
                }
                return Ok(ModelResponse::ToolCalls(requests));
            }
        }
        match message.content {
            Some(text) => Ok(ModelResponse::FinalAnswer(text)),
            None => Err(AgentError::model("response had neither content nor tool calls")),
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    async fn generate(
        &self,
        system_prompt: Option<&str>,
        history: &[Message],
        tools: &[ToolDescriptor],
    ) -> Result<ModelResponse, AgentError> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: self.build_messages(system_prompt, history),
            tools: Self::build_tools(tools),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        debug!(
            model = %self.config.model,
            message_count = request.messages.len(),
            tool_count = tools.len(),
            "sending chat completion request"
        );

        let mut builder = self.http.post(self.endpoint()).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AgentError::model(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::model(format!(
                "provider returned {}: {}",
                status, body
            )));
        }

        let completion: ChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::model(format!("malformed response body: {}", e)))?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::model("response contained no choices"))?;

        self.parse_choice(choice.message)
    }

    fn model_id(&self) -> &str {
        &self.config.model
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: ChatFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ChatToolCall>>,
}
