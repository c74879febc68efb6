//! Tool discovery (`spec.md` §4.6): queries configured MCP servers on
//! startup and every discovery interval, flattening their tool lists into a
//! single `ToolRegistry` snapshot swapped atomically via `ArcSwap`. Readers
//! (the tool loop building a turn's tool list) never block on the writer.

use arc_swap::ArcSwap;
use gateway_core::mcp::{McpError, McpServer};
use gateway_core::ToolRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::McpServerSetting;

pub struct ToolDiscovery {
    snapshot: ArcSwap<ToolRegistry>,
    servers: Vec<McpServerSetting>,
}

impl ToolDiscovery {
    pub fn new(servers: Vec<McpServerSetting>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(ToolRegistry::default()),
            servers,
        }
    }

    pub fn current(&self) -> ToolRegistry {
        (**self.snapshot.load()).clone()
    }

    pub async fn refresh_once(&self) {
        if self.servers.is_empty() {
            return;
        }
        let mut handlers = Vec::new();
        for setting in &self.servers {
            match connect_and_list(setting).await {
                Ok(mut tools) => handlers.append(&mut tools),
                Err(e) => {
                    warn!(server = %setting.name, error = %e, "MCP discovery failed for server");
                }
            }
        }
        info!(tool_count = handlers.len(), "tool discovery refreshed registry");
        self.snapshot.store(Arc::new(ToolRegistry::from_handlers(handlers)));
    }

    /// Runs `refresh_once` immediately, then on `interval` forever. Intended
    /// to be spawned once at startup; cancellation is via task abort since
    /// discovery has no per-request lifetime.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        self.refresh_once().await;
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.refresh_once().await;
        }
    }
}

async fn connect_and_list(
    setting: &McpServerSetting,
) -> Result<Vec<Arc<dyn gateway_core::ToolHandler>>, McpError> {
    let cfg = gateway_core::mcp::McpServerConfig {
        name: setting.name.clone(),
        transport: setting.transport.clone(),
    };
    let server: McpServer = McpServer::connect(&cfg).await?;
    server.list_tools().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_server_list_yields_empty_registry() {
        let discovery = ToolDiscovery::new(vec![]);
        discovery.refresh_once().await;
        assert!(discovery.current().is_empty());
    }
}
