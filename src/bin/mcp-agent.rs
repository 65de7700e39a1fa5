//! Command-line front end: one-shot queries or an interactive chat loop.

use anyhow::{bail, Context, Result};
use clap::Parser;
use mcp_agent::agent::{Agent, AgentConfig};
use mcp_agent::config::AgentManifest;
use mcp_agent::llm::OpenAiProvider;
use mcp_agent::mcp::{McpClient, McpClientConfig, ToolRegistry};
use mcp_agent::tools::{DispatcherConfig, ToolDispatcher};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mcp-agent", about = "Chat agent backed by MCP tool servers")]
struct Cli {
    /// Path to the agent manifest.
    #[arg(short, long, default_value = "agent.toml")]
    config: String,

    /// Run a single query and exit. Omit for interactive mode.
    query: Option<String>,

    /// Verbose logging (same as RUST_LOG=debug).
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let manifest = AgentManifest::load(&cli.config)
        .await
        .with_context(|| format!("loading manifest from {}", cli.config))?;

    let registry = Arc::new(ToolRegistry::new());
    let dispatcher = Arc::new(ToolDispatcher::new(
        registry.clone(),
        DispatcherConfig::default(),
    ));

    let mut clients: Vec<(String, Arc<McpClient>)> = Vec::new();
    for server in &manifest.servers {
        let client = Arc::new(McpClient::new(
            McpClientConfig::default(),
            server.transport(),
        ));
        match client.connect().await {
            Ok(()) => {
                let count = registry.refresh(&server.id, &client).await?;
                dispatcher.add_server(&server.id, client.clone()).await;
                info!(server = %server.id, tools = count, "connected to server");
                clients.push((server.id.clone(), client));
            }
            Err(e) => {
                // A dead server should not take the whole agent down.
                warn!(server = %server.id, error = %e, "skipping unreachable server");
            }
        }
    }
    if clients.is_empty() && !manifest.servers.is_empty() {
        bail!("no MCP server could be reached");
    }

    let provider = Arc::new(OpenAiProvider::new(manifest.model_config()?)?);

    let cancellation = CancellationToken::new();
    let mut builder = Agent::builder()
        .provider(provider)
        .dispatcher(dispatcher)
        .registry(registry.clone())
        .config(AgentConfig {
            max_iterations: manifest.agent.max_iterations,
            cancellation: cancellation.clone(),
        });
    if let Some(prompt) = &manifest.agent.system_prompt {
        builder = builder.system_prompt(prompt);
    }
    if let Some(limit) = manifest.agent.max_messages {
        builder = builder.max_messages(limit);
    }
    let mut agent = builder.build()?;

    let outcome = match &cli.query {
        Some(query) => run_once(&mut agent, query).await,
        None => chat_loop(&mut agent, &registry, cancellation).await,
    };

    for (id, client) in &clients {
        if let Err(e) = client.close().await {
            warn!(server = %id, error = %e, "error closing connection");
        }
    }

    outcome
}

async fn run_once(agent: &mut Agent, query: &str) -> Result<()> {
    let answer = agent.run(query).await?;
    println!("{}", answer);
    Ok(())
}

async fn chat_loop(
    agent: &mut Agent,
    registry: &ToolRegistry,
    cancellation: CancellationToken,
) -> Result<()> {
    println!("mcp-agent interactive mode. Commands: tools, reset, quit.");
    let mut editor = DefaultEditor::new()?;

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);

                match line {
                    "quit" | "exit" => break,
                    "reset" => {
                        agent.reset();
                        println!("conversation cleared");
                    }
                    "tools" => {
                        let mut tools = registry.tools().await;
                        tools.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
                        for tool in tools {
                            println!(
                                "  {} ({}): {}",
                                tool.descriptor.name, tool.server_id, tool.descriptor.description
                            );
                        }
                    }
                    query => match agent.run(query).await {
                        Ok(answer) => println!("{}", answer),
                        Err(e) => error!(error = %e, "query failed"),
                    },
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                error!(error = %e, "readline failed");
                break;
            }
        }
    }

    cancellation.cancel();
    Ok(())
}
