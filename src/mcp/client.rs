//! Client for one MCP server connection.
//!
//! [`McpClient`] owns a single transport, performs the MCP handshake, and
//! multiplexes concurrent calls over the connection: writes are serialized
//! through a channel while each caller waits on its own oneshot, keyed by
//! correlation id, so responses may arrive in any order.
//!
//! # Connection state machine
//!
//! ```text
//! Connecting --handshake ok--> Ready --I/O failure--> Degraded
//!     |                          ^                        |
//!     |                          +-------reconnect--------+
//!     +--handshake failure--> Closed (terminal, also via close())
//! ```
//!
//! While `Degraded`, calls fail fast without touching the transport until a
//! `reconnect()` succeeds. Correlation ids come from a monotonic counter and
//! are never reused; a response to a timed-out call finds no pending entry
//! and is discarded, so it can never bind to a later call.

use crate::error::AgentError;
use crate::mcp::transport::{McpTransport, TransportStreams};
use crate::mcp::types::{
    methods, CallToolResult, CorrelationId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ResponsePayload, ToolDescriptor, PROTOCOL_VERSION,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Lifecycle state of one server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Transport not yet established or handshake in progress.
    Connecting,
    /// Handshake complete; calls are accepted.
    Ready,
    /// Transport failed; calls fail fast until a reconnect succeeds.
    Degraded,
    /// Explicitly closed or handshake failed. Terminal.
    Closed,
}

/// Client behavior knobs.
#[derive(Debug, Clone)]
pub struct McpClientConfig {
    /// Client name advertised during the handshake.
    pub client_name: String,
    /// Client version advertised during the handshake.
    pub client_version: String,
    /// Default per-call timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for McpClientConfig {
    fn default() -> Self {
        Self {
            client_name: "mcp-agent".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

type PendingMap = HashMap<CorrelationId, oneshot::Sender<Result<JsonRpcResponse, AgentError>>>;

/// Removes a pending-call entry if the waiting future is dropped before it
/// resolves, as happens when a cancelled run drops its in-flight dispatches.
/// Without this the entry would sit in the map until the connection dies.
struct PendingGuard {
    pending: Arc<Mutex<PendingMap>>,
    id: CorrelationId,
    armed: bool,
}

impl PendingGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pending = self.pending.clone();
            let id = self.id;
            handle.spawn(async move {
                pending.lock().await.remove(&id);
            });
        }
    }
}

/// A connection to one MCP server.
pub struct McpClient {
    config: McpClientConfig,
    transport: Mutex<Box<dyn McpTransport>>,
    status: Arc<RwLock<ConnectionStatus>>,
    next_correlation_id: AtomicI64,
    pending_calls: Arc<Mutex<PendingMap>>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<JsonRpcMessage>>>,
    shutdown_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
    background_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Requests actually written to the transport, for tests and diagnostics.
    requests_sent: AtomicU64,
    server_name: RwLock<Option<String>>,
}

impl McpClient {
    /// Create a client over the given transport. Call [`connect`](Self::connect)
    /// before issuing any calls.
    pub fn new(config: McpClientConfig, transport: Box<dyn McpTransport>) -> Self {
        Self {
            config,
            transport: Mutex::new(transport),
            status: Arc::new(RwLock::new(ConnectionStatus::Connecting)),
            next_correlation_id: AtomicI64::new(1),
            pending_calls: Arc::new(Mutex::new(HashMap::new())),
            write_tx: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            background_handle: Mutex::new(None),
            requests_sent: AtomicU64::new(0),
            server_name: RwLock::new(None),
        }
    }

    /// Current connection status.
    pub async fn status(&self) -> ConnectionStatus {
        *self.status.read().await
    }

    /// Server name reported during the handshake, if any.
    pub async fn server_name(&self) -> Option<String> {
        self.server_name.read().await.clone()
    }

    /// Number of requests written to the transport so far.
    pub fn request_count(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Establish the transport and perform the MCP handshake.
    ///
    /// On success the connection is `Ready`. A transport failure leaves the
    /// client in `Connecting` so the caller may retry; a handshake failure is
    /// unrecoverable and closes the connection.
    pub async fn connect(&self) -> Result<(), AgentError> {
        match self.status().await {
            ConnectionStatus::Connecting => {}
            ConnectionStatus::Closed => {
                return Err(AgentError::connection("connection is closed"));
            }
            _ => return Err(AgentError::connection("already connected")),
        }

        let streams = self.transport.lock().await.connect().await?;
        self.start_message_handler(streams).await;

        if let Err(e) = self.initialize_session().await {
            warn!("handshake failed, closing connection: {}", e);
            self.close().await?;
            return Err(e);
        }

        *self.status.write().await = ConnectionStatus::Ready;
        info!(
            server = self.server_name.read().await.as_deref().unwrap_or("unknown"),
            "MCP connection ready"
        );
        Ok(())
    }

    /// Re-establish a degraded connection.
    pub async fn reconnect(&self) -> Result<(), AgentError> {
        if self.status().await != ConnectionStatus::Degraded {
            return Err(AgentError::connection(
                "reconnect is only valid from the degraded state",
            ));
        }

        self.stop_message_handler().await;
        let streams = {
            let mut transport = self.transport.lock().await;
            let _ = transport.disconnect().await;
            transport.connect().await?
        };
        self.start_message_handler(streams).await;

        // Lift the fail-fast gate for the handshake; drop back to degraded
        // if it does not complete.
        *self.status.write().await = ConnectionStatus::Connecting;
        if let Err(e) = self.initialize_session().await {
            *self.status.write().await = ConnectionStatus::Degraded;
            return Err(e);
        }
        *self.status.write().await = ConnectionStatus::Ready;
        info!("MCP connection restored");
        Ok(())
    }

    /// Close the connection and release every resource. Terminal.
    pub async fn close(&self) -> Result<(), AgentError> {
        *self.status.write().await = ConnectionStatus::Closed;
        self.stop_message_handler().await;
        self.transport.lock().await.disconnect().await?;
        Ok(())
    }

    /// Fetch the server's tool catalog.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, AgentError> {
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let response = self
            .send_request(methods::LIST_TOOLS, None, timeout)
            .await?;

        match response.payload {
            ResponsePayload::Success { result } => {
                let tools = result
                    .get("tools")
                    .cloned()
                    .ok_or_else(|| AgentError::protocol("tools/list result missing 'tools'"))?;
                serde_json::from_value(tools)
                    .map_err(|e| AgentError::protocol(format!("unparseable tool list: {}", e)))
            }
            ResponsePayload::Error { error } => Err(AgentError::protocol(format!(
                "tools/list failed: {}",
                error.message
            ))),
        }
    }

    /// Invoke a tool and wait up to `timeout` for its result.
    ///
    /// A server-reported tool failure surfaces as [`AgentError::ToolFailed`]
    /// (permanent); transport loss and timeouts surface as their transient
    /// kinds.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<CallToolResult, AgentError> {
        let params = json!({
            "name": tool_name,
            "arguments": arguments,
        });

        let response = self
            .send_request(methods::CALL_TOOL, Some(params), timeout)
            .await?;

        match response.payload {
            ResponsePayload::Success { result } => {
                let call_result: CallToolResult = serde_json::from_value(result)
                    .map_err(|e| AgentError::protocol(format!("unparseable tool result: {}", e)))?;
                if call_result.is_error.unwrap_or(false) {
                    return Err(AgentError::tool_failed(tool_name, call_result.text()));
                }
                Ok(call_result)
            }
            ResponsePayload::Error { error } => {
                Err(AgentError::tool_failed(tool_name, error.message))
            }
        }
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, AgentError> {
        match self.status().await {
            ConnectionStatus::Ready | ConnectionStatus::Connecting => {}
            ConnectionStatus::Degraded => {
                return Err(AgentError::connection(
                    "connection degraded, reconnect before calling",
                ));
            }
            ConnectionStatus::Closed => {
                return Err(AgentError::connection("connection is closed"));
            }
        }

        let id = self.next_correlation_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);

        let (response_tx, response_rx) = oneshot::channel();
        self.pending_calls.lock().await.insert(id, response_tx);
        let guard = PendingGuard {
            pending: self.pending_calls.clone(),
            id,
            armed: true,
        };

        {
            let write_tx = self.write_tx.lock().await;
            let tx = write_tx
                .as_ref()
                .ok_or_else(|| AgentError::connection("connection not established"))?;
            tx.send(JsonRpcMessage::Request(request)).map_err(|_| {
                AgentError::connection("write channel closed")
            })?;
        }
        self.requests_sent.fetch_add(1, Ordering::Relaxed);

        let outcome = match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AgentError::connection_lost_mid_call(
                "connection lost mid-call",
            )),
            Err(_) => {
                // Drop the pending entry; the id was never handed to another
                // call, so a late answer is logged and discarded by the
                // handler rather than misdelivered.
                self.pending_calls.lock().await.remove(&id);
                Err(AgentError::timeout(timeout))
            }
        };
        guard.disarm();
        outcome
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), AgentError> {
        let write_tx = self.write_tx.lock().await;
        let tx = write_tx
            .as_ref()
            .ok_or_else(|| AgentError::connection("connection not established"))?;
        tx.send(JsonRpcMessage::Notification(JsonRpcNotification::new(
            method, params,
        )))
        .map_err(|_| AgentError::connection("write channel closed"))
    }

    async fn initialize_session(&self) -> Result<(), AgentError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.config.client_name,
                "version": self.config.client_version,
            }
        });

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let response = self
            .send_request(methods::INITIALIZE, Some(params), timeout)
            .await?;

        match response.payload {
            ResponsePayload::Success { result } => {
                if let Some(name) = result
                    .get("serverInfo")
                    .and_then(|info| info.get("name"))
                    .and_then(|v| v.as_str())
                {
                    *self.server_name.write().await = Some(name.to_string());
                }
            }
            ResponsePayload::Error { error } => {
                return Err(AgentError::protocol(format!(
                    "initialize failed: {}",
                    error.message
                )));
            }
        }

        self.send_notification(methods::INITIALIZED, None).await
    }

    async fn start_message_handler(&self, streams: TransportStreams) {
        let TransportStreams {
            mut read_stream,
            write_stream,
        } = streams;

        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
        self.shutdown_tx.lock().await.replace(shutdown_tx);

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
        self.write_tx.lock().await.replace(write_tx);

        let write_handle = tokio::spawn(async move {
            let mut sink = write_stream;
            while let Some(message) = write_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    warn!("transport write failed: {}", e);
                    break;
                }
            }
        });

        let pending_calls = self.pending_calls.clone();
        let status = self.status.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = read_stream.next() => {
                        match msg {
                            Some(Ok(message)) => {
                                Self::handle_message(message, &pending_calls).await;
                            }
                            Some(Err(e)) => {
                                warn!("transport read failed: {}", e);
                                break;
                            }
                            None => {
                                debug!("transport stream ended");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }

            // Transport gone: degrade (unless explicitly closed) and fail
            // every waiter so nothing hangs on a dead connection.
            {
                let mut status = status.write().await;
                if *status != ConnectionStatus::Closed {
                    *status = ConnectionStatus::Degraded;
                }
            }
            write_handle.abort();
            let mut pending = pending_calls.lock().await;
            for (_, tx) in pending.drain() {
                // These requests were already on the wire.
                let _ = tx.send(Err(AgentError::connection_lost_mid_call(
                    "connection lost",
                )));
            }
        });

        self.background_handle.lock().await.replace(handle);
    }

    async fn stop_message_handler(&self) {
        if let Some(shutdown_tx) = self.shutdown_tx.lock().await.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.background_handle.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        self.write_tx.lock().await.take();
    }

    async fn handle_message(message: JsonRpcMessage, pending_calls: &Arc<Mutex<PendingMap>>) {
        match message {
            JsonRpcMessage::Response(response) => {
                let mut pending = pending_calls.lock().await;
                if let Some(tx) = pending.remove(&response.id) {
                    let _ = tx.send(Ok(response));
                } else {
                    // Either a timed-out call or a server bug; never
                    // deliverable to anyone else.
                    warn!(id = response.id, "discarding response with no pending call");
                }
            }
            JsonRpcMessage::Notification(notification) => {
                match notification.method.as_str() {
                    methods::TOOLS_LIST_CHANGED => {
                        info!("server reported a tool list change; catalog refreshes on reconnect");
                    }
                    method => debug!(method, "ignoring notification"),
                }
            }
            JsonRpcMessage::Request(request) => {
                warn!(method = %request.method, "ignoring unexpected request from server");
            }
        }
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("requests_sent", &self.request_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::test_utils::ScriptedServer;

    #[tokio::test]
    async fn connect_performs_handshake_and_becomes_ready() {
        let (server, client) = ScriptedServer::spawn().await;
        client.connect().await.unwrap();

        assert_eq!(client.status().await, ConnectionStatus::Ready);
        assert_eq!(client.server_name().await.as_deref(), Some("scripted"));
        // initialize is the only request so far
        assert_eq!(client.request_count(), 1);
        drop(server);
    }

    #[tokio::test]
    async fn responses_match_out_of_order() {
        let (server, client) = ScriptedServer::spawn().await;
        client.connect().await.unwrap();

        // Two concurrent calls; the server answers the second one first.
        server.respond_out_of_order(true);
        let slow = client.call_tool(
            "echo",
            json!({"value": "slow"}),
            Duration::from_secs(5),
        );
        let fast = client.call_tool(
            "echo",
            json!({"value": "fast"}),
            Duration::from_secs(5),
        );
        let (slow, fast) = tokio::join!(slow, fast);

        assert!(slow.unwrap().text().contains("slow"));
        assert!(fast.unwrap().text().contains("fast"));
    }

    #[tokio::test]
    async fn timeout_resolves_and_late_response_is_discarded() {
        let (server, client) = ScriptedServer::spawn().await;
        client.connect().await.unwrap();

        server.hold_next_response();
        let err = client
            .call_tool("echo", json!({"value": "x"}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        // The held response arrives now; a fresh call must get its own
        // answer, not the stale one.
        server.release_held_responses();
        let result = client
            .call_tool("echo", json!({"value": "y"}), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.text().contains('y'));
    }

    #[tokio::test]
    async fn transport_loss_degrades_and_fails_fast() {
        let (server, client) = ScriptedServer::spawn().await;
        client.connect().await.unwrap();

        server.drop_connection();
        // Wait for the handler to observe the loss.
        tokio::time::timeout(Duration::from_secs(1), async {
            while client.status().await != ConnectionStatus::Degraded {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection should degrade");

        let sent_before = client.request_count();
        let err = client
            .call_tool("echo", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Connection { .. }));
        // Fail fast: nothing was written to the transport.
        assert_eq!(client.request_count(), sent_before);
    }

    #[tokio::test]
    async fn dropped_caller_releases_its_pending_entry() {
        let (server, client) = ScriptedServer::spawn().await;
        client.connect().await.unwrap();

        server.hold_next_response();
        let call = client.call_tool("echo", json!({"value": "x"}), Duration::from_secs(30));
        // A cancelled run drops its in-flight dispatches mid-wait.
        assert!(tokio::time::timeout(Duration::from_millis(50), call)
            .await
            .is_err());

        // Cleanup runs on a spawned task, so poll for it.
        tokio::time::timeout(Duration::from_secs(1), async {
            while !client.pending_calls.lock().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pending entry should be removed once the caller is gone");

        // The connection stays usable for later calls.
        server.release_held_responses();
        let result = client
            .call_tool("echo", json!({"value": "next"}), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.text().contains("next"));
    }

    #[tokio::test]
    async fn reconnect_restores_a_degraded_connection() {
        let (server, client) = ScriptedServer::spawn().await;
        client.connect().await.unwrap();

        server.drop_connection();
        tokio::time::timeout(Duration::from_secs(1), async {
            while client.status().await != ConnectionStatus::Degraded {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection should degrade");

        client.reconnect().await.unwrap();
        assert_eq!(client.status().await, ConnectionStatus::Ready);

        let result = client
            .call_tool("echo", json!({"value": "back"}), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.text().contains("back"));
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let (_server, client) = ScriptedServer::spawn().await;
        client.connect().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.status().await, ConnectionStatus::Closed);

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, AgentError::Connection { .. }));
    }

    #[tokio::test]
    async fn list_tools_parses_catalog() {
        let (_server, client) = ScriptedServer::spawn().await;
        client.connect().await.unwrap();

        let tools = client.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"echo"));
        assert!(names.contains(&"search"));
    }
}
