//! Agent runtime over the Model Context Protocol.
//!
//! Connects an OpenAI-compatible chat model to any number of MCP servers
//! and runs the standard agent loop: the model answers or calls tools, tool
//! calls are validated and routed to the server that owns them, and results
//! feed the next model turn until the model answers or the iteration budget
//! runs out.
//!
//! # Quick Start
//!
//! ```no_run
//! use mcp_agent::agent::Agent;
//! use mcp_agent::config::AgentManifest;
//! use mcp_agent::llm::OpenAiProvider;
//! use mcp_agent::mcp::{McpClient, McpClientConfig, ToolRegistry};
//! use mcp_agent::tools::{DispatcherConfig, ToolDispatcher};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manifest = AgentManifest::load("agent.toml").await?;
//!
//!     let registry = Arc::new(ToolRegistry::new());
//!     let dispatcher = Arc::new(ToolDispatcher::new(
//!         registry.clone(),
//!         DispatcherConfig::default(),
//!     ));
//!     for server in &manifest.servers {
//!         let client = Arc::new(McpClient::new(
//!             McpClientConfig::default(),
//!             server.transport(),
//!         ));
//!         client.connect().await?;
//!         registry.refresh(&server.id, &client).await?;
//!         dispatcher.add_server(&server.id, client).await;
//!     }
//!
//!     let provider = Arc::new(OpenAiProvider::new(manifest.model_config()?)?);
//!     let mut agent = Agent::builder()
//!         .provider(provider)
//!         .dispatcher(dispatcher)
//!         .registry(registry)
//!         .build()?;
//!
//!     println!("{}", agent.run("What files are in /tmp?").await?);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod tools;

pub use agent::{Agent, AgentConfig};
pub use error::AgentError;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, AgentError>;
