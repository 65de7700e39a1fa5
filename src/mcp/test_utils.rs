//! In-process scripted MCP server for tests.
//!
//! [`ScriptedServer`] speaks enough of the protocol to exercise the client
//! and dispatcher without spawning a real server: it answers the handshake,
//! advertises a small catalog, echoes tool calls, and can be told to delay,
//! reorder, fail, or drop responses to simulate the failure modes the
//! runtime must survive.

use crate::error::AgentError;
use crate::mcp::client::{McpClient, McpClientConfig};
use crate::mcp::transport::{McpTransport, TransportInfo, TransportStreams};
use crate::mcp::types::{
    methods, JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Shared behavior switches for the scripted server.
#[derive(Default)]
struct ServerState {
    /// Buffer the next two responses and deliver them newest-first.
    out_of_order: AtomicBool,
    /// Park the next `tools/call` response until released.
    hold_next: AtomicBool,
    /// Answer the next `tools/call` with an application-level tool error.
    fail_next_call: AtomicBool,
    /// Count of `tools/call` requests the server has seen.
    calls_seen: AtomicU64,
    held: Mutex<Vec<JsonRpcMessage>>,
    reorder_buffer: Mutex<Vec<JsonRpcMessage>>,
    read_tx: Mutex<Option<mpsc::UnboundedSender<Result<JsonRpcMessage, AgentError>>>>,
}

impl ServerState {
    async fn emit(&self, message: JsonRpcMessage) {
        if self.hold_next.swap(false, Ordering::SeqCst) {
            self.held.lock().await.push(message);
            return;
        }

        if self.out_of_order.load(Ordering::SeqCst) {
            let mut buffer = self.reorder_buffer.lock().await;
            buffer.push(message);
            if buffer.len() == 2 {
                self.out_of_order.store(false, Ordering::SeqCst);
                let second = buffer.pop().unwrap();
                let first = buffer.pop().unwrap();
                drop(buffer);
                self.send(second).await;
                self.send(first).await;
            }
            return;
        }

        self.send(message).await;
    }

    async fn send(&self, message: JsonRpcMessage) {
        if let Some(tx) = self.read_tx.lock().await.as_ref() {
            let _ = tx.send(Ok(message));
        }
    }
}

/// Handle controlling a scripted server paired with one [`McpClient`].
/// Clones control the same server.
#[derive(Clone)]
pub struct ScriptedServer {
    state: Arc<ServerState>,
}

impl ScriptedServer {
    /// Spawn a scripted server and a client wired to it. The client is not
    /// yet connected; call [`McpClient::connect`].
    pub async fn spawn() -> (Self, McpClient) {
        Self::spawn_with_tools(default_catalog()).await
    }

    /// Spawn with a custom `tools/list` catalog.
    pub async fn spawn_with_tools(catalog: serde_json::Value) -> (Self, McpClient) {
        let state = Arc::new(ServerState::default());
        let transport = ScriptedTransport {
            state: state.clone(),
            catalog,
            connected: false,
        };
        let client = McpClient::new(McpClientConfig::default(), Box::new(transport));
        (Self { state }, client)
    }

    /// Deliver the next two responses newest-first.
    pub fn respond_out_of_order(&self, enabled: bool) {
        self.state.out_of_order.store(enabled, Ordering::SeqCst);
    }

    /// Park the next response until [`release_held_responses`](Self::release_held_responses).
    pub fn hold_next_response(&self) {
        self.state.hold_next.store(true, Ordering::SeqCst);
    }

    /// Flush every parked response to the client.
    pub fn release_held_responses(&self) {
        let state = self.state.clone();
        tokio::spawn(async move {
            let held: Vec<_> = state.held.lock().await.drain(..).collect();
            for message in held {
                state.send(message).await;
            }
        });
    }

    /// Answer the next `tools/call` with a tool-reported error.
    pub fn fail_next_call(&self) {
        self.state.fail_next_call.store(true, Ordering::SeqCst);
    }

    /// Sever the transport, as a crashed server would.
    pub fn drop_connection(&self) {
        let state = self.state.clone();
        tokio::spawn(async move {
            if let Some(tx) = state.read_tx.lock().await.take() {
                let _ = tx.send(Err(AgentError::connection("scripted connection dropped")));
            }
        });
    }

    /// Number of `tools/call` requests observed.
    pub fn calls_seen(&self) -> u64 {
        self.state.calls_seen.load(Ordering::SeqCst)
    }
}

/// The catalog most tests use: an idempotent `echo` and a plain `search`.
pub fn default_catalog() -> serde_json::Value {
    json!([
        {
            "name": "echo",
            "description": "Echo the supplied value",
            "inputSchema": {
                "type": "object",
                "properties": {"value": {"type": "string"}},
                "required": ["value"]
            },
            "annotations": {"idempotentHint": true}
        },
        {
            "name": "search",
            "description": "Search the web",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "max_results": {"type": "integer"}
                },
                "required": ["query"]
            }
        }
    ])
}

struct ScriptedTransport {
    state: Arc<ServerState>,
    catalog: serde_json::Value,
    connected: bool,
}

#[async_trait]
impl McpTransport for ScriptedTransport {
    async fn connect(&mut self) -> Result<TransportStreams, AgentError> {
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<JsonRpcMessage>();

        *self.state.read_tx.lock().await = Some(read_tx);

        let state = self.state.clone();
        let catalog = self.catalog.clone();
        tokio::spawn(async move {
            while let Some(message) = write_rx.recv().await {
                if let JsonRpcMessage::Request(request) = message {
                    let response = script_response(&state, &catalog, &request).await;
                    state.emit(JsonRpcMessage::Response(response)).await;
                }
                // Notifications need no answer.
            }
        });

        self.connected = true;

        Ok(TransportStreams {
            read_stream: Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(
                read_rx,
            )),
            write_stream: Box::pin(futures::sink::unfold(write_tx, |tx, msg| async move {
                tx.send(msg)
                    .map_err(|_| AgentError::connection("write channel closed"))
                    .map(|_| tx)
            })),
        })
    }

    async fn disconnect(&mut self) -> Result<(), AgentError> {
        self.state.read_tx.lock().await.take();
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: "scripted".to_string(),
            endpoint: "test://scripted".to_string(),
            supports_reconnection: true,
        }
    }
}

async fn script_response(
    state: &ServerState,
    catalog: &serde_json::Value,
    request: &JsonRpcRequest,
) -> JsonRpcResponse {
    match request.method.as_str() {
        methods::INITIALIZE => JsonRpcResponse::success(
            request.id,
            json!({
                "protocolVersion": crate::mcp::types::PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "scripted", "version": "0.0.0"}
            }),
        ),
        methods::LIST_TOOLS => {
            JsonRpcResponse::success(request.id, json!({ "tools": catalog }))
        }
        methods::CALL_TOOL => {
            state.calls_seen.fetch_add(1, Ordering::SeqCst);
            if state.fail_next_call.swap(false, Ordering::SeqCst) {
                return JsonRpcResponse::success(
                    request.id,
                    json!({
                        "content": [{"type": "text", "text": "tool exploded"}],
                        "isError": true
                    }),
                );
            }

            let params = request.params.clone().unwrap_or_default();
            let name = params["name"].as_str().unwrap_or("").to_string();
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            let echoed = arguments
                .get("value")
                .or_else(|| arguments.get("query"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            JsonRpcResponse::success(
                request.id,
                json!({
                    "content": [{"type": "text", "text": format!("{}: {}", name, echoed)}]
                }),
            )
        }
        other => JsonRpcResponse::error(
            request.id,
            JsonRpcError {
                code: JsonRpcError::METHOD_NOT_FOUND,
                message: format!("method not found: {}", other),
                data: None,
            },
        ),
    }
}
