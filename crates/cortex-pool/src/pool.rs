//! The tool pool: a fixed set of supervised servers, with calls routed by
//! tool name over each server's cached tool list.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{info, warn};

use cortex_core::config::ToolServerConfig;
use cortex_core::error::{CortexError, Result};
use cortex_core::traits::ToolRouter;
use cortex_core::types::ToolCallMeta;

use crate::child::ToolChild;

/// One routable tool server. The process-backed implementation is
/// [`ToolChild`]; tests use scripted stand-ins.
pub trait ToolServer: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn alive(&self) -> bool;

    /// Tool names this server exposes, cached after the first fetch.
    fn tools(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Drop the cached list and fetch it again.
    fn refresh_tools(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    fn call(&self, tool: &str, args: Value, meta: ToolCallMeta) -> BoxFuture<'_, Result<Value>>;

    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

/// Supervises the configured tool servers and routes calls to them.
pub struct ToolPool {
    servers: tokio::sync::RwLock<Vec<Arc<dyn ToolServer>>>,
}

impl ToolPool {
    pub fn new() -> Self {
        Self {
            servers: tokio::sync::RwLock::new(Vec::new()),
        }
    }

    /// Construct a pool over pre-built servers (used by tests).
    pub fn with_servers(servers: Vec<Arc<dyn ToolServer>>) -> Self {
        Self {
            servers: tokio::sync::RwLock::new(servers),
        }
    }

    /// Spawn every enabled server concurrently. A server that fails to start
    /// is logged and skipped; the pool stays usable.
    pub async fn start(&self, configs: &[ToolServerConfig]) {
        let enabled: Vec<&ToolServerConfig> = configs.iter().filter(|c| c.enabled).collect();

        let spawns = enabled.iter().map(|config| async move {
            match ToolChild::start(config).await {
                Ok(child) => Some(Arc::new(child) as Arc<dyn ToolServer>),
                Err(e) => {
                    warn!(server = %config.name, error = %e, "Tool server failed to start");
                    None
                }
            }
        });

        let started: Vec<Arc<dyn ToolServer>> = futures::future::join_all(spawns)
            .await
            .into_iter()
            .flatten()
            .collect();

        info!(
            started = started.len(),
            configured = enabled.len(),
            "Tool pool started"
        );
        *self.servers.write().await = started;
    }

    /// Terminate every server. Idempotent.
    pub async fn stop(&self) {
        let servers: Vec<Arc<dyn ToolServer>> = self.servers.write().await.drain(..).collect();
        for server in servers {
            server.shutdown().await;
        }
    }

    /// Names of the currently supervised servers.
    pub async fn server_names(&self) -> Vec<String> {
        self.servers
            .read()
            .await
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Whether a named server is running.
    pub async fn connected(&self, name: &str) -> bool {
        self.servers
            .read()
            .await
            .iter()
            .any(|s| s.name() == name && s.alive())
    }

    /// Route a call to the first server whose tool list contains `name`.
    pub async fn route(&self, name: &str, args: Value, meta: ToolCallMeta) -> Result<Value> {
        let servers: Vec<Arc<dyn ToolServer>> = self.servers.read().await.clone();

        for server in servers {
            let tools = match server.tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    warn!(server = %server.name(), error = %e, "Tool list unavailable, skipping server");
                    continue;
                }
            };
            if tools.iter().any(|t| t == name) {
                return server.call(name, args, meta).await;
            }
        }

        Err(CortexError::ToolRouting(name.to_string()))
    }
}

impl Default for ToolPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRouter for ToolPool {
    fn call_tool(
        &self,
        name: &str,
        args: Value,
        meta: ToolCallMeta,
    ) -> BoxFuture<'_, Result<Value>> {
        let name = name.to_string();
        Box::pin(async move { self.route(&name, args, meta).await })
    }

    fn tool_names(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            let servers: Vec<Arc<dyn ToolServer>> = self.servers.read().await.clone();
            let mut names = Vec::new();
            for server in servers {
                if let Ok(tools) = server.tools().await {
                    names.extend(tools);
                }
            }
            names
        })
    }
}
