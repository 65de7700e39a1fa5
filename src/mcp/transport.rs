//! Transport layer for MCP server connections.
//!
//! A transport owns the raw communication channel (a spawned child process
//! speaking newline-delimited JSON-RPC over stdio, or a WebSocket) and hands
//! the client a pair of message streams. Framing and serialization live here;
//! correlation and protocol state live in [`crate::mcp::client`].
//!
//! Background tasks pump the underlying I/O; dropping the streams or calling
//! `disconnect()` tears them down. The transport makes no FIFO promise about
//! responses; the client matches them by correlation id.

use crate::error::AgentError;
use crate::mcp::types::JsonRpcMessage;
use async_trait::async_trait;
use futures::sink::{Sink, SinkExt};
use futures::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

pub type MessageStream = Pin<Box<dyn Stream<Item = Result<JsonRpcMessage, AgentError>> + Send>>;
pub type MessageSink = Pin<Box<dyn Sink<JsonRpcMessage, Error = AgentError> + Send>>;

/// Bidirectional message streams returned by a successful connect.
pub struct TransportStreams {
    /// Messages arriving from the server.
    pub read_stream: MessageStream,
    /// Messages bound for the server.
    pub write_stream: MessageSink,
}

impl std::fmt::Debug for TransportStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStreams").finish_non_exhaustive()
    }
}

/// Interface every MCP transport implements.
///
/// `connect()` establishes the channel and returns the streams; `disconnect()`
/// releases every resource the transport holds (sockets, child processes,
/// background tasks) deterministically.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn connect(&mut self) -> Result<TransportStreams, AgentError>;

    async fn disconnect(&mut self) -> Result<(), AgentError>;

    fn is_connected(&self) -> bool;

    fn transport_info(&self) -> TransportInfo;
}

/// Transport metadata for logging and diagnostics.
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub transport_type: String,
    pub endpoint: String,
    pub supports_reconnection: bool,
}

/// Configuration for process-based servers speaking JSON-RPC over stdio.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    /// Command to execute.
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
    /// Working directory for the child process.
    pub working_dir: Option<String>,
    /// Environment variables set for the child.
    pub env_vars: HashMap<String, String>,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            working_dir: None,
            env_vars: HashMap::new(),
        }
    }
}

/// Configuration for WebSocket-based servers.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// WebSocket URL to connect to.
    pub url: String,
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_ms: 30_000,
        }
    }
}

/// Convenience constructors for boxed transports.
pub struct TransportFactory;

impl TransportFactory {
    pub fn stdio(config: StdioConfig) -> Box<dyn McpTransport> {
        Box::new(StdioTransport::new(config))
    }

    pub fn websocket(config: WebSocketConfig) -> Box<dyn McpTransport> {
        Box::new(WebSocketTransport::new(config))
    }
}

/// Transport that spawns a server process and frames JSON-RPC messages as
/// newline-delimited JSON over its stdin/stdout.
pub struct StdioTransport {
    config: StdioConfig,
    connected: bool,
    process_handle: Option<tokio::process::Child>,
    close_sender: Option<mpsc::UnboundedSender<()>>,
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        Self {
            config,
            connected: false,
            process_handle: None,
            close_sender: None,
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&mut self) -> Result<TransportStreams, AgentError> {
        use std::process::Stdio;
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::process::Command;

        if self.config.command.is_empty() {
            return Err(AgentError::configuration("stdio command cannot be empty"));
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::connection(format!(
                "failed to spawn '{}': {}",
                self.config.command, e
            ))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::connection("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::connection("child stdout unavailable"))?;
        let stderr = child.stderr.take();

        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();

        self.process_handle = Some(child);
        self.close_sender = Some(close_tx);

        // Drain stderr so a chatty server cannot fill the pipe and stall.
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("server stderr: {}", line);
                }
            });
        }

        // Reader: one JSON-RPC message per line until EOF or close signal.
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                tokio::select! {
                    result = reader.read_line(&mut line) => {
                        match result {
                            Ok(0) => {
                                let _ = read_tx.send(Err(AgentError::connection(
                                    "server stdout closed",
                                )));
                                break;
                            }
                            Ok(_) => {
                                let trimmed = line.trim();
                                if !trimmed.is_empty() {
                                    let parsed = serde_json::from_str::<JsonRpcMessage>(trimmed)
                                        .map_err(|e| {
                                            AgentError::protocol(format!(
                                                "unparseable frame from server: {}",
                                                e
                                            ))
                                        });
                                    if read_tx.send(parsed).is_err() {
                                        break;
                                    }
                                }
                                line.clear();
                            }
                            Err(e) => {
                                let _ = read_tx.send(Err(AgentError::connection(format!(
                                    "stdout read failed: {}",
                                    e
                                ))));
                                break;
                            }
                        }
                    }
                    _ = close_rx.recv() => break,
                }
            }
        });

        // Writer: serialize and flush one line per message.
        tokio::spawn(async move {
            while let Some(message) = write_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("failed to serialize outbound message: {}", e);
                        continue;
                    }
                };
                let line = format!("{}\n", json);
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        self.connected = true;

        Ok(TransportStreams {
            read_stream: Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(
                read_rx,
            )),
            write_stream: channel_sink(write_tx),
        })
    }

    async fn disconnect(&mut self) -> Result<(), AgentError> {
        if let Some(close_sender) = self.close_sender.take() {
            let _ = close_sender.send(());
        }

        if let Some(mut child) = self.process_handle.take() {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    // SIGTERM first, hard kill if the server ignores it.
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                        Ok(Ok(_)) => {}
                        _ => {
                            let _ = child.kill().await;
                            let _ = child.wait().await;
                        }
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }

        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: "stdio".to_string(),
            endpoint: format!("{} {}", self.config.command, self.config.args.join(" ")),
            supports_reconnection: true,
        }
    }
}

/// Transport for network-reachable MCP servers over WebSocket.
pub struct WebSocketTransport {
    config: WebSocketConfig,
    connected: bool,
    close_sender: Option<mpsc::UnboundedSender<()>>,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            config,
            connected: false,
            close_sender: None,
        }
    }
}

#[async_trait]
impl McpTransport for WebSocketTransport {
    async fn connect(&mut self) -> Result<TransportStreams, AgentError> {
        let url = Url::parse(&self.config.url)
            .map_err(|e| AgentError::configuration(format!("invalid WebSocket URL: {}", e)))?;

        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let (ws_stream, _response) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| AgentError::timeout(connect_timeout))?
            .map_err(|e| AgentError::connection(format!("WebSocket connect failed: {}", e)))?;

        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();
        self.close_sender = Some(close_tx);

        let (mut ws_sink, mut ws_read) = ws_stream.split();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = ws_read.next() => {
                        match msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                let parsed = serde_json::from_str::<JsonRpcMessage>(&text)
                                    .map_err(|e| {
                                        AgentError::protocol(format!(
                                            "unparseable frame from server: {}",
                                            e
                                        ))
                                    });
                                if read_tx.send(parsed).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) => {
                                let _ = read_tx.send(Err(AgentError::connection(
                                    "WebSocket closed by remote",
                                )));
                                break;
                            }
                            Some(Err(e)) => {
                                let _ = read_tx.send(Err(AgentError::connection(format!(
                                    "WebSocket error: {}",
                                    e
                                ))));
                                break;
                            }
                            None => {
                                let _ = read_tx.send(Err(AgentError::connection(
                                    "WebSocket stream ended",
                                )));
                                break;
                            }
                            // Binary frames and pings are not part of the protocol.
                            _ => continue,
                        }
                    }
                    _ = close_rx.recv() => break,
                }
            }
        });

        tokio::spawn(async move {
            while let Some(message) = write_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(_) => continue,
                };
                if ws_sink.send(WsMessage::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        self.connected = true;

        Ok(TransportStreams {
            read_stream: Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(
                read_rx,
            )),
            write_stream: channel_sink(write_tx),
        })
    }

    async fn disconnect(&mut self) -> Result<(), AgentError> {
        if let Some(close_sender) = self.close_sender.take() {
            let _ = close_sender.send(());
        }
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: "websocket".to_string(),
            endpoint: self.config.url.clone(),
            supports_reconnection: true,
        }
    }
}

fn channel_sink(tx: mpsc::UnboundedSender<JsonRpcMessage>) -> MessageSink {
    Box::pin(futures::sink::unfold(tx, |tx, msg| async move {
        tx.send(msg)
            .map_err(|_| AgentError::connection("write channel closed"))
            .map(|_| tx)
    }))
}

/// Connected in-memory streams for exercising the client without a real
/// server. Returns the sender feeding the read stream, the receiver capturing
/// everything written, and the streams themselves.
pub fn create_test_streams() -> (
    mpsc::UnboundedSender<Result<JsonRpcMessage, AgentError>>,
    mpsc::UnboundedReceiver<JsonRpcMessage>,
    TransportStreams,
) {
    let (read_tx, read_rx) = mpsc::unbounded_channel();
    let (write_tx, write_rx) = mpsc::unbounded_channel();

    let streams = TransportStreams {
        read_stream: Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(
            read_rx,
        )),
        write_stream: channel_sink(write_tx),
    };

    (read_tx, write_rx, streams)
}
