//! Local mirror of the tool catalogs advertised by connected servers.
//!
//! The registry is the only component allowed to answer "which server owns
//! this tool". Lookups read an immutable snapshot behind an `Arc`, so a
//! concurrent refresh replaces the whole catalog in one swap and readers
//! never observe a half-updated view.

use crate::error::AgentError;
use crate::mcp::client::McpClient;
use crate::mcp::types::ToolDescriptor;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// A tool descriptor together with the server it was advertised by.
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    pub server_id: String,
    pub descriptor: ToolDescriptor,
}

type Snapshot = Arc<HashMap<String, RegisteredTool>>;

/// Catalog mirror across every registered server.
///
/// When two servers advertise the same tool name, the server registered
/// first keeps the name and later advertisements are ignored with a
/// warning. Registration order is the order of the first successful
/// [`refresh`](ToolRegistry::refresh) for each server.
pub struct ToolRegistry {
    /// Per-server catalogs in registration order. Guards rebuilds.
    catalogs: Mutex<Vec<(String, Vec<ToolDescriptor>)>>,
    /// Merged name -> tool snapshot served to readers.
    merged: RwLock<Snapshot>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            catalogs: Mutex::new(Vec::new()),
            merged: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Fetch `tools/list` from `client` and replace `server_id`'s catalog.
    ///
    /// Returns the number of tools the server advertised. The merged
    /// snapshot is rebuilt and swapped atomically.
    pub async fn refresh(
        &self,
        server_id: &str,
        client: &McpClient,
    ) -> Result<usize, AgentError> {
        let tools = client.list_tools().await?;
        let count = tools.len();
        debug!(server_id, tool_count = count, "refreshing tool catalog");

        let mut catalogs = self.catalogs.lock().await;
        match catalogs.iter_mut().find(|(id, _)| id == server_id) {
            Some((_, existing)) => *existing = tools,
            None => catalogs.push((server_id.to_string(), tools)),
        }
        let snapshot = Self::merge(&catalogs);
        *self.merged.write().await = snapshot;
        Ok(count)
    }

    /// Drop `server_id`'s catalog, e.g. after its connection closed.
    pub async fn remove_server(&self, server_id: &str) {
        let mut catalogs = self.catalogs.lock().await;
        catalogs.retain(|(id, _)| id != server_id);
        let snapshot = Self::merge(&catalogs);
        *self.merged.write().await = snapshot;
    }

    /// Look up a tool by name. Returns the owning server and descriptor.
    pub async fn lookup(&self, name: &str) -> Option<RegisteredTool> {
        self.merged.read().await.get(name).cloned()
    }

    /// Every registered tool, in no particular order.
    pub async fn tools(&self) -> Vec<RegisteredTool> {
        self.merged.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.merged.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.merged.read().await.is_empty()
    }

    fn merge(catalogs: &[(String, Vec<ToolDescriptor>)]) -> Snapshot {
        let mut merged: HashMap<String, RegisteredTool> = HashMap::new();
        for (server_id, tools) in catalogs {
            for descriptor in tools {
                if let Some(existing) = merged.get(&descriptor.name) {
                    warn!(
                        tool = %descriptor.name,
                        kept = %existing.server_id,
                        ignored = %server_id,
                        "duplicate tool name, keeping earlier server"
                    );
                    continue;
                }
                merged.insert(
                    descriptor.name.clone(),
                    RegisteredTool {
                        server_id: server_id.clone(),
                        descriptor: descriptor.clone(),
                    },
                );
            }
        }
        Arc::new(merged)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
