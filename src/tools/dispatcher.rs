//! Validates, routes, and executes model-issued tool calls.

use crate::error::AgentError;
use crate::mcp::client::McpClient;
use crate::mcp::registry::ToolRegistry;
use crate::tools::schema::SchemaNode;
use crate::tools::{ToolCallRequest, ToolCallResult};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

/// Exponential backoff policy for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based, counting completed
    /// attempts). Doubles each time, capped, with optional jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let mut delay_ms = self
            .initial_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        if self.jitter && delay_ms > 1 {
            delay_ms = delay_ms / 2 + fastrand::u64(0..=delay_ms / 2);
        }
        Duration::from_millis(delay_ms)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on tool calls in flight at once.
    pub max_concurrency: usize,
    /// Wall-clock budget for one attempt of one call.
    pub call_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            call_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Routes tool calls to the server that owns each tool.
///
/// Every call goes through the same gauntlet: registry lookup, argument
/// validation against the advertised schema, then the network attempt under
/// the retry policy. Validation failures never touch the network.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    clients: RwLock<HashMap<String, Arc<McpClient>>>,
    semaphore: Arc<Semaphore>,
    config: DispatcherConfig,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, config: DispatcherConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            registry,
            clients: RwLock::new(HashMap::new()),
            semaphore,
            config,
        }
    }

    /// Make `client` the routing target for tools owned by `server_id`.
    pub async fn add_server(&self, server_id: impl Into<String>, client: Arc<McpClient>) {
        self.clients.write().await.insert(server_id.into(), client);
    }

    /// Forget a server. Calls routed to it afterwards fail as unavailable.
    pub async fn remove_server(&self, server_id: &str) {
        self.clients.write().await.remove(server_id);
    }

    /// Execute one tool call end to end.
    pub async fn dispatch(&self, request: ToolCallRequest) -> ToolCallResult {
        let outcome = self.dispatch_inner(&request).await;
        if let Err(error) = &outcome {
            warn!(tool = %request.tool_name, %error, "tool call failed");
        }
        ToolCallResult { request, outcome }
    }

    /// Execute a batch concurrently, bounded by `max_concurrency`.
    ///
    /// Results come back in the same order as the requests regardless of
    /// which call finishes first.
    pub async fn dispatch_batch(&self, requests: Vec<ToolCallRequest>) -> Vec<ToolCallResult> {
        join_all(requests.into_iter().map(|request| self.dispatch(request))).await
    }

    async fn dispatch_inner(
        &self,
        request: &ToolCallRequest,
    ) -> Result<crate::mcp::types::CallToolResult, AgentError> {
        let registered = self
            .registry
            .lookup(&request.tool_name)
            .await
            .ok_or_else(|| {
                AgentError::validation(&request.tool_name, "tool is not registered")
            })?;

        let schema = SchemaNode::parse(&registered.descriptor.input_schema);
        schema
            .validate(&request.arguments)
            .map_err(|violation| AgentError::validation(&request.tool_name, violation))?;

        let client = self
            .clients
            .read()
            .await
            .get(&registered.server_id)
            .cloned()
            .ok_or_else(|| {
                AgentError::unavailable(format!(
                    "server '{}' owning tool '{}' is not connected",
                    registered.server_id, request.tool_name
                ))
            })?;

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| AgentError::unavailable("dispatcher is shutting down"))?;

        let idempotent = registered.descriptor.is_idempotent();
        let mut attempt = 1u32;
        loop {
            debug!(tool = %request.tool_name, attempt, "calling tool");
            let error = match client
                .call_tool(
                    &request.tool_name,
                    request.arguments.clone(),
                    self.config.call_timeout,
                )
                .await
            {
                Ok(result) => return Ok(result),
                Err(error) => error,
            };

            if !error.is_transient() {
                return Err(error);
            }
            // Timeouts and mid-call connection losses are ambiguous: the
            // call may have executed on the server. Only tools that declared
            // themselves idempotent are safe to re-send.
            if error.is_ambiguous() && !idempotent {
                return Err(error);
            }
            if attempt >= self.config.retry.max_attempts {
                return Err(AgentError::unavailable(format!(
                    "tool '{}' failed after {} attempts: {}",
                    request.tool_name, attempt, error
                )));
            }

            let delay = self.config.retry.delay_for_attempt(attempt);
            debug!(
                tool = %request.tool_name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::test_utils::ScriptedServer;
    use serde_json::json;

    fn fast_retry() -> DispatcherConfig {
        DispatcherConfig {
            max_concurrency: 4,
            call_timeout: Duration::from_millis(100),
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                jitter: false,
            },
        }
    }

    async fn dispatcher_with_one_server() -> (ScriptedServer, ToolDispatcher) {
        let (server, client) = ScriptedServer::spawn().await;
        client.connect().await.unwrap();
        let client = Arc::new(client);

        let registry = Arc::new(ToolRegistry::new());
        registry.refresh("srv", &client).await.unwrap();

        let dispatcher = ToolDispatcher::new(registry, fast_retry());
        dispatcher.add_server("srv", client).await;
        (server, dispatcher)
    }

    #[tokio::test]
    async fn routes_call_to_owning_server() {
        let (_server, dispatcher) = dispatcher_with_one_server().await;
        let result = dispatcher
            .dispatch(ToolCallRequest::new("c1", "echo", json!({"value": "hi"})))
            .await;
        assert_eq!(result.outcome.unwrap().text(), "echo: hi");
    }

    #[tokio::test]
    async fn unknown_tool_fails_without_network() {
        let (server, dispatcher) = dispatcher_with_one_server().await;
        let result = dispatcher
            .dispatch(ToolCallRequest::new("c1", "nonexistent", json!({})))
            .await;
        assert!(matches!(
            result.outcome,
            Err(AgentError::Validation { .. })
        ));
        assert_eq!(server.calls_seen(), 0);
    }

    #[tokio::test]
    async fn invalid_arguments_fail_without_network() {
        let (server, dispatcher) = dispatcher_with_one_server().await;
        // "echo" requires a string "value".
        let result = dispatcher
            .dispatch(ToolCallRequest::new("c1", "echo", json!({"value": 7})))
            .await;
        match result.outcome {
            Err(AgentError::Validation { tool_name, message }) => {
                assert_eq!(tool_name, "echo");
                assert!(message.contains("expected string"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
        assert_eq!(server.calls_seen(), 0);
    }

    #[tokio::test]
    async fn batch_results_keep_request_order() {
        let (_server, dispatcher) = dispatcher_with_one_server().await;
        let requests = vec![
            ToolCallRequest::new("c1", "echo", json!({"value": "first"})),
            ToolCallRequest::new("c2", "search", json!({"query": "second"})),
            ToolCallRequest::new("c3", "echo", json!({"value": "third"})),
        ];
        let results = dispatcher.dispatch_batch(requests).await;

        let ids: Vec<_> = results.iter().map(|r| r.request.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        assert!(results[0].outcome.as_ref().unwrap().text().contains("first"));
        assert!(results[2].outcome.as_ref().unwrap().text().contains("third"));
    }

    #[tokio::test]
    async fn timeout_on_idempotent_tool_is_retried() {
        let (server, dispatcher) = dispatcher_with_one_server().await;
        server.hold_next_response();

        // "echo" advertises idempotentHint, so the timed-out attempt is
        // retried and the second attempt succeeds.
        let result = dispatcher
            .dispatch(ToolCallRequest::new("c1", "echo", json!({"value": "again"})))
            .await;
        assert!(result.is_success());
        assert_eq!(server.calls_seen(), 2);
    }

    #[tokio::test]
    async fn timeout_on_non_idempotent_tool_is_not_retried() {
        let (server, dispatcher) = dispatcher_with_one_server().await;
        server.hold_next_response();

        // "search" carries no idempotency hint; re-sending could repeat a
        // side effect, so the timeout surfaces directly.
        let result = dispatcher
            .dispatch(ToolCallRequest::new("c1", "search", json!({"query": "x"})))
            .await;
        assert!(matches!(result.outcome, Err(ref e) if e.is_timeout()));
        assert_eq!(server.calls_seen(), 1);
    }

    async fn dispatcher_with_reconnecting_server(
        config: DispatcherConfig,
    ) -> (ScriptedServer, ToolDispatcher) {
        let (server, client) = ScriptedServer::spawn().await;
        client.connect().await.unwrap();
        let client = Arc::new(client);

        let registry = Arc::new(ToolRegistry::new());
        registry.refresh("srv", &client).await.unwrap();
        let dispatcher = ToolDispatcher::new(registry, config);
        dispatcher.add_server("srv", client.clone()).await;

        // Restore the connection as soon as it degrades, so a retry would
        // reach the server again.
        tokio::spawn(async move {
            loop {
                if client.status().await == crate::mcp::client::ConnectionStatus::Degraded {
                    let _ = client.reconnect().await;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
        (server, dispatcher)
    }

    fn mid_call_loss_config() -> DispatcherConfig {
        DispatcherConfig {
            max_concurrency: 4,
            call_timeout: Duration::from_millis(500),
            retry: RetryConfig {
                max_attempts: 4,
                initial_delay_ms: 40,
                max_delay_ms: 80,
                jitter: false,
            },
        }
    }

    #[tokio::test]
    async fn mid_call_connection_loss_is_not_retried_for_non_idempotent_tool() {
        let (server, dispatcher) =
            dispatcher_with_reconnecting_server(mid_call_loss_config()).await;

        // The first attempt reaches the server, its response is parked, and
        // the connection dies with the call still outstanding. The server
        // may already have executed it, so "search" must not be re-sent
        // even though the connection comes back before the retry delay ends.
        server.hold_next_response();
        let delayed = server.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            delayed.drop_connection();
        });

        let result = dispatcher
            .dispatch(ToolCallRequest::new("c1", "search", json!({"query": "x"})))
            .await;
        assert!(matches!(
            result.outcome,
            Err(AgentError::Connection { mid_call: true, .. })
        ));
        assert_eq!(server.calls_seen(), 1);
    }

    #[tokio::test]
    async fn mid_call_connection_loss_is_retried_for_idempotent_tool() {
        let (server, dispatcher) =
            dispatcher_with_reconnecting_server(mid_call_loss_config()).await;

        // Same loss, but "echo" declares idempotentHint, so re-sending is
        // safe and the retry succeeds over the restored connection.
        server.hold_next_response();
        let delayed = server.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            delayed.drop_connection();
        });

        let result = dispatcher
            .dispatch(ToolCallRequest::new("c1", "echo", json!({"value": "x"})))
            .await;
        assert!(result.is_success());
        assert_eq!(server.calls_seen(), 2);
    }

    #[tokio::test]
    async fn tool_reported_failure_is_not_retried() {
        let (server, dispatcher) = dispatcher_with_one_server().await;
        server.fail_next_call();

        let result = dispatcher
            .dispatch(ToolCallRequest::new("c1", "echo", json!({"value": "x"})))
            .await;
        assert!(matches!(
            result.outcome,
            Err(AgentError::ToolFailed { .. })
        ));
        assert_eq!(server.calls_seen(), 1);
        assert!(result.render().contains("Tool call failed"));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_unavailable() {
        let (server, dispatcher) = dispatcher_with_one_server().await;
        server.drop_connection();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Every attempt fails fast on the degraded connection until the
        // retry budget runs out.
        let result = dispatcher
            .dispatch(ToolCallRequest::new("c1", "echo", json!({"value": "x"})))
            .await;
        assert!(matches!(
            result.outcome,
            Err(AgentError::Unavailable { .. })
        ));
        assert_eq!(server.calls_seen(), 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 350,
            jitter: false,
        };
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let retry = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: true,
        };
        for _ in 0..50 {
            let delay = retry.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
    }
}
