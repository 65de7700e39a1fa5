//! TOML manifest describing the model endpoint and the MCP servers to run.
//!
//! ```toml
//! [model]
//! base_url = "http://localhost:1234/v1"
//! model = "qwen2.5-7b-instruct"
//!
//! [agent]
//! system_prompt = "You are a helpful assistant."
//! max_iterations = 5
//!
//! [[servers]]
//! id = "filesystem"
//! transport = "stdio"
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
//!
//! [[servers]]
//! id = "remote"
//! transport = "websocket"
//! url = "ws://localhost:9100/mcp"
//! ```

use crate::error::AgentError;
use crate::llm::OpenAiConfig;
use crate::mcp::transport::{McpTransport, StdioConfig, TransportFactory, WebSocketConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentManifest {
    pub model: ModelSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub servers: Vec<ServerSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key. Keys never live in the
    /// manifest itself.
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_model_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AgentSection {
    pub system_prompt: Option<String>,
    pub max_iterations: u32,
    pub max_messages: Option<usize>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_iterations: 5,
            max_messages: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub id: String,
    pub transport: TransportKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Websocket,
}

impl AgentManifest {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            AgentError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, AgentError> {
        let manifest: AgentManifest = toml::from_str(raw)
            .map_err(|e| AgentError::configuration(format!("invalid manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), AgentError> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if !seen.insert(&server.id) {
                return Err(AgentError::configuration(format!(
                    "duplicate server id '{}'",
                    server.id
                )));
            }
            match server.transport {
                TransportKind::Stdio if server.command.is_none() => {
                    return Err(AgentError::configuration(format!(
                        "server '{}' uses stdio but has no command",
                        server.id
                    )));
                }
                TransportKind::Websocket if server.url.is_none() => {
                    return Err(AgentError::configuration(format!(
                        "server '{}' uses websocket but has no url",
                        server.id
                    )));
                }
                _ => {}
            }
        }
        if self.agent.max_iterations == 0 {
            return Err(AgentError::configuration("max_iterations must be at least 1"));
        }
        Ok(())
    }

    /// Resolve the model section into provider configuration, reading the
    /// API key from the named environment variable if one is set.
    pub fn model_config(&self) -> Result<OpenAiConfig, AgentError> {
        let api_key = match &self.model.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                AgentError::configuration(format!(
                    "environment variable '{}' is not set",
                    var
                ))
            })?),
            None => None,
        };
        Ok(OpenAiConfig {
            base_url: self.model.base_url.clone(),
            api_key,
            model: self.model.model.clone(),
            temperature: self.model.temperature,
            max_tokens: self.model.max_tokens,
            request_timeout: Duration::from_secs(self.model.request_timeout_secs),
        })
    }
}

impl ServerSection {
    /// Build the transport this section describes.
    pub fn transport(&self) -> Box<dyn McpTransport> {
        match self.transport {
            TransportKind::Stdio => TransportFactory::stdio(StdioConfig {
                command: self.command.clone().unwrap_or_default(),
                args: self.args.clone(),
                working_dir: self.working_dir.clone(),
                env_vars: self.env.clone(),
            }),
            TransportKind::Websocket => TransportFactory::websocket(WebSocketConfig {
                url: self.url.clone().unwrap_or_default(),
                connect_timeout_ms: self.connect_timeout_ms,
            }),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_model_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
        [model]
        base_url = "http://localhost:1234/v1"
        model = "qwen2.5-7b-instruct"

        [agent]
        system_prompt = "Answer briefly."
        max_iterations = 8

        [[servers]]
        id = "files"
        transport = "stdio"
        command = "mcp-files"
        args = ["--root", "/tmp"]

        [[servers]]
        id = "remote"
        transport = "websocket"
        url = "ws://localhost:9100/mcp"
    "#;

    #[tokio::test]
    async fn loads_manifest_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        tokio::fs::write(&path, MANIFEST).await.unwrap();

        let manifest = AgentManifest::load(&path).await.unwrap();
        assert_eq!(manifest.servers[0].id, "files");

        let err = AgentManifest::load(dir.path().join("missing.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Configuration { .. }));
    }

    #[test]
    fn parses_full_manifest() {
        let manifest = AgentManifest::parse(MANIFEST).unwrap();
        assert_eq!(manifest.model.model, "qwen2.5-7b-instruct");
        assert_eq!(manifest.agent.max_iterations, 8);
        assert_eq!(manifest.servers.len(), 2);
        assert_eq!(manifest.servers[0].transport, TransportKind::Stdio);
        assert_eq!(manifest.servers[1].transport, TransportKind::Websocket);
    }

    #[test]
    fn defaults_apply_when_sections_are_omitted() {
        let manifest = AgentManifest::parse(
            r#"
            [model]
            model = "gpt-4o-mini"
            "#,
        )
        .unwrap();
        assert_eq!(manifest.agent.max_iterations, 5);
        assert!(manifest.servers.is_empty());
        assert_eq!(manifest.model.temperature, 0.7);
    }

    #[test]
    fn stdio_server_without_command_is_rejected() {
        let err = AgentManifest::parse(
            r#"
            [model]
            model = "m"

            [[servers]]
            id = "broken"
            transport = "stdio"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::Configuration { .. }));
    }

    #[test]
    fn duplicate_server_ids_are_rejected() {
        let err = AgentManifest::parse(
            r#"
            [model]
            model = "m"

            [[servers]]
            id = "dup"
            transport = "websocket"
            url = "ws://a"

            [[servers]]
            id = "dup"
            transport = "websocket"
            url = "ws://b"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::Configuration { .. }));
    }

    #[test]
    fn zero_iterations_are_rejected() {
        let err = AgentManifest::parse(
            r#"
            [model]
            model = "m"

            [agent]
            max_iterations = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::Configuration { .. }));
    }
}
