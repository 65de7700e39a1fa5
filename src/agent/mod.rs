//! The agent loop: model turn, tool dispatch, repeat.

pub mod session;

pub use session::{Message, Role, Session};

use crate::error::AgentError;
use crate::llm::{ModelProvider, ModelResponse};
use crate::mcp::registry::ToolRegistry;
use crate::tools::ToolDispatcher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model turns allowed per user input before giving up.
    pub max_iterations: u32,
    pub cancellation: CancellationToken,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            cancellation: CancellationToken::new(),
        }
    }
}

/// Drives the conversation: each user input runs a bounded loop of model
/// turns where the model either answers or issues tool calls. Tool calls
/// run concurrently through the dispatcher and their results are appended
/// in request order before the next model turn.
pub struct Agent {
    provider: Arc<dyn ModelProvider>,
    dispatcher: Arc<ToolDispatcher>,
    registry: Arc<ToolRegistry>,
    session: Session,
    config: AgentConfig,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").finish_non_exhaustive()
    }
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Forget the conversation so far.
    pub fn reset(&mut self) {
        self.session.reset();
    }

    /// Process one user input to completion.
    ///
    /// Returns the model's final answer. Fails with
    /// [`AgentError::Exhausted`] when the model is still calling tools
    /// after `max_iterations` turns, and with [`AgentError::Cancelled`]
    /// when the token fires mid-run. Tool failures do not end the run;
    /// they are reported to the model as tool results.
    pub async fn run(&mut self, user_input: impl Into<String>) -> Result<String, AgentError> {
        self.session.append(Message::user(user_input));

        for iteration in 1..=self.config.max_iterations {
            if self.config.cancellation.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let tools: Vec<_> = self
                .registry
                .tools()
                .await
                .into_iter()
                .map(|registered| registered.descriptor)
                .collect();

            debug!(iteration, tool_count = tools.len(), "model turn");
            let response = tokio::select! {
                _ = self.config.cancellation.cancelled() => return Err(AgentError::Cancelled),
                response = self.provider.generate(
                    self.session.system_prompt(),
                    self.session.history(),
                    &tools,
                ) => response?,
            };

            match response {
                ModelResponse::FinalAnswer(answer) => {
                    info!(iteration, "model produced final answer");
                    self.session.append(Message::assistant(answer.clone()));
                    return Ok(answer);
                }
                ModelResponse::ToolCalls(calls) => {
                    info!(iteration, call_count = calls.len(), "model requested tool calls");
                    self.session.append(Message::assistant_tool_calls(calls.clone()));

                    let results = tokio::select! {
                        _ = self.config.cancellation.cancelled() => {
                            return Err(AgentError::Cancelled)
                        }
                        results = self.dispatcher.dispatch_batch(calls) => results,
                    };
                    for result in results {
                        self.session
                            .append(Message::tool_result(result.request.id.clone(), result.render()));
                    }
                }
            }
        }

        Err(AgentError::Exhausted {
            iterations: self.config.max_iterations,
        })
    }
}

#[derive(Default)]
pub struct AgentBuilder {
    provider: Option<Arc<dyn ModelProvider>>,
    dispatcher: Option<Arc<ToolDispatcher>>,
    registry: Option<Arc<ToolRegistry>>,
    system_prompt: Option<String>,
    max_messages: Option<usize>,
    config: Option<AgentConfig>,
}

impl AgentBuilder {
    pub fn provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<ToolDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Cap the transcript length; oldest messages are pruned first.
    pub fn max_messages(mut self, limit: usize) -> Self {
        self.max_messages = Some(limit);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let provider = self
            .provider
            .ok_or_else(|| AgentError::configuration("agent requires a model provider"))?;
        let dispatcher = self
            .dispatcher
            .ok_or_else(|| AgentError::configuration("agent requires a tool dispatcher"))?;
        let registry = self
            .registry
            .ok_or_else(|| AgentError::configuration("agent requires a tool registry"))?;

        let mut session = Session::new();
        if let Some(prompt) = self.system_prompt {
            session = session.with_system_prompt(prompt);
        }
        if let Some(limit) = self.max_messages {
            session = session.with_max_messages(limit);
        }

        Ok(Agent {
            provider,
            dispatcher,
            registry,
            session,
            config: self.config.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::ToolDescriptor;
    use crate::tools::{DispatcherConfig, ToolCallRequest};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    struct ScriptedProvider {
        responses: Mutex<VecDeque<Result<ModelResponse, AgentError>>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<ModelResponse, AgentError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        async fn generate(
            &self,
            _system_prompt: Option<&str>,
            _history: &[Message],
            _tools: &[ToolDescriptor],
        ) -> Result<ModelResponse, AgentError> {
            self.responses
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(AgentError::model("script ran out of responses")))
        }

        fn model_id(&self) -> &str {
            "scripted"
        }
    }

    fn empty_agent(provider: Arc<dyn ModelProvider>, max_iterations: u32) -> Agent {
        let registry = Arc::new(ToolRegistry::new());
        let dispatcher = Arc::new(ToolDispatcher::new(
            registry.clone(),
            DispatcherConfig::default(),
        ));
        Agent::builder()
            .provider(provider)
            .dispatcher(dispatcher)
            .registry(registry)
            .config(AgentConfig {
                max_iterations,
                cancellation: CancellationToken::new(),
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn immediate_answer_ends_loop_in_one_turn() {
        let provider = ScriptedProvider::new(vec![Ok(ModelResponse::FinalAnswer(
            "42".to_string(),
        ))]);
        let mut agent = empty_agent(provider, 5);

        let answer = agent.run("what is six times seven").await.unwrap();
        assert_eq!(answer, "42");
        // user, assistant
        assert_eq!(agent.session().len(), 2);
    }

    #[tokio::test]
    async fn tool_failures_feed_back_and_loop_continues() {
        // The model calls an unregistered tool, gets the failure as a tool
        // result, then answers.
        let provider = ScriptedProvider::new(vec![
            Ok(ModelResponse::ToolCalls(vec![ToolCallRequest::new(
                "c1",
                "missing_tool",
                json!({}),
            )])),
            Ok(ModelResponse::FinalAnswer("recovered".to_string())),
        ]);
        let mut agent = empty_agent(provider, 5);

        let answer = agent.run("try the tool").await.unwrap();
        assert_eq!(answer, "recovered");

        let history = agent.session().history();
        // user, assistant(tool_calls), tool_result, assistant
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].role, Role::ToolResult);
        assert!(history[2].content.contains("Tool call failed"));
    }

    #[tokio::test]
    async fn endless_tool_calls_exhaust_the_budget() {
        let calls = || {
            Ok(ModelResponse::ToolCalls(vec![ToolCallRequest::new(
                "c",
                "missing_tool",
                json!({}),
            )]))
        };
        let provider = ScriptedProvider::new(vec![calls(), calls(), calls()]);
        let mut agent = empty_agent(provider, 3);

        let err = agent.run("loop forever").await.unwrap_err();
        assert!(matches!(err, AgentError::Exhausted { iterations: 3 }));
    }

    #[tokio::test]
    async fn model_error_terminates_the_run() {
        let provider =
            ScriptedProvider::new(vec![Err(AgentError::model("provider exploded"))]);
        let mut agent = empty_agent(provider, 5);

        let err = agent.run("hello").await.unwrap_err();
        assert!(matches!(err, AgentError::Model { .. }));
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_run() {
        let provider = ScriptedProvider::new(vec![Ok(ModelResponse::FinalAnswer(
            "unreachable".to_string(),
        ))]);
        let token = CancellationToken::new();
        token.cancel();

        let registry = Arc::new(ToolRegistry::new());
        let dispatcher = Arc::new(ToolDispatcher::new(
            registry.clone(),
            DispatcherConfig::default(),
        ));
        let mut agent = Agent::builder()
            .provider(provider)
            .dispatcher(dispatcher)
            .registry(registry)
            .config(AgentConfig {
                max_iterations: 5,
                cancellation: token,
            })
            .build()
            .unwrap();

        let err = agent.run("hello").await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[test]
    fn builder_requires_a_provider() {
        let registry = Arc::new(ToolRegistry::new());
        let dispatcher = Arc::new(ToolDispatcher::new(
            registry.clone(),
            DispatcherConfig::default(),
        ));
        let err = Agent::builder()
            .dispatcher(dispatcher)
            .registry(registry)
            .build()
            .unwrap_err();
        assert!(matches!(err, AgentError::Configuration { .. }));
    }
}
