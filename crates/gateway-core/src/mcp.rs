//! MCP (Model Context Protocol) integration: connects to the downstream
//! tool-hosting server(s), adapts their tool list into our `ToolHandler`
//! trait, and executes calls.
//!
//! Transport handling mirrors this codebase's existing MCP client setup
//! (stdio/SSE/streamable-HTTP, started via `rmcp::ServiceExt::serve`); the
//! adapter's `RmcpTool -> Tool` conversion mirrors `mcp::adapter` as well.

use crate::chat::{FunctionTool, Tool};
use crate::tool::{ToolError, ToolHandler};
use async_trait::async_trait;
use rmcp::model::CallToolRequestParam;
use rmcp::model::Tool as RmcpTool;
use rmcp::service::{DynService, RunningService, ServiceExt};
use rmcp::RoleClient;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("failed to convert MCP tool schema for `{tool_name}`: {source}")]
    SchemaConversion {
        tool_name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to start MCP server `{0}`: {1}")]
    Connect(String, String),
}

/// One configured downstream MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: McpTransport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum McpTransport {
    Http {
        url: String,
        #[serde(default)]
        token: Option<String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        token: Option<String>,
    },
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        envs: HashMap<String, String>,
    },
}

type McpConnection = RunningService<RoleClient, Box<dyn DynService<RoleClient>>>;

fn client_info() -> rmcp::model::ClientInfo {
    rmcp::model::ClientInfo {
        protocol_version: rmcp::model::ProtocolVersion::default(),
        capabilities: rmcp::model::ClientCapabilities::default(),
        client_info: rmcp::model::Implementation {
            name: "gateway-service".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    }
}

impl McpTransport {
    async fn connect(&self) -> anyhow::Result<McpConnection> {
        let info = client_info();
        match self {
            McpTransport::Sse { url, .. } => {
                let transport = rmcp::transport::SseClientTransport::start(url.as_str()).await?;
                Ok(info.into_dyn().serve(transport).await?)
            }
            McpTransport::Http { url, .. } => {
                let transport =
                    rmcp::transport::StreamableHttpClientTransport::from_uri(url.clone());
                Ok(info.into_dyn().serve(transport).await?)
            }
            McpTransport::Stdio {
                command,
                args,
                envs,
            } => {
                if which::which(command).is_err() && !Path::new(command).exists() {
                    anyhow::bail!("MCP stdio command `{command}` not found on PATH");
                }
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args)
                    .envs(envs)
                    .stderr(Stdio::inherit())
                    .stdout(Stdio::piped())
                    .stdin(Stdio::piped());
                let transport = rmcp::transport::child_process::TokioChildProcess::new(cmd)?;
                Ok(info.into_dyn().serve(transport).await?)
            }
        }
    }
}

/// One connected MCP server plus its namespace prefix.
pub struct McpServer {
    pub name: String,
    conn: Arc<McpConnection>,
}

impl McpServer {
    pub async fn connect(cfg: &McpServerConfig) -> Result<Self, McpError> {
        let conn = cfg
            .transport
            .connect()
            .await
            .map_err(|e| McpError::Connect(cfg.name.clone(), e.to_string()))?;
        Ok(Self {
            name: cfg.name.clone(),
            conn: Arc::new(conn),
        })
    }

    /// Fetch the current tool list from this server, namespaced
    /// `{server_name}_{tool_name}` per `spec.md` §4.1 / §4.6.
    pub async fn list_tools(&self) -> Result<Vec<Arc<dyn ToolHandler>>, McpError> {
        let tools = self
            .conn
            .list_all_tools()
            .await
            .map_err(|e| McpError::Connect(self.name.clone(), e.to_string()))?;

        let mut handlers = Vec::with_capacity(tools.len());
        for tool in tools {
            let namespaced = format!("{}_{}", self.name, tool.name);
            let descriptor = rmcp_tool_to_tool(&tool, &namespaced)
                .map_err(|e| McpError::SchemaConversion {
                    tool_name: namespaced.clone(),
                    source: e,
                })?;
            handlers.push(Arc::new(McpToolHandler {
                namespaced_name: namespaced,
                upstream_name: tool.name.to_string(),
                descriptor,
                conn: self.conn.clone(),
                timeout: Duration::from_secs(60),
            }) as Arc<dyn ToolHandler>);
        }
        Ok(handlers)
    }
}

fn rmcp_tool_to_tool(r: &RmcpTool, namespaced_name: &str) -> Result<Tool, serde_json::Error> {
    let mut schema_map: Map<String, Value> = Map::new();
    for (k, v) in r.input_schema.as_ref().iter() {
        schema_map.insert(k.clone(), v.clone());
    }
    Ok(Tool {
        tool_type: "function".to_string(),
        function: FunctionTool {
            name: namespaced_name.to_string(),
            description: r.description.clone().into_owned(),
            parameters: Value::Object(schema_map),
        },
    })
}

struct McpToolHandler {
    namespaced_name: String,
    upstream_name: String,
    descriptor: Tool,
    conn: Arc<McpConnection>,
    timeout: Duration,
}

#[async_trait]
impl ToolHandler for McpToolHandler {
    fn name(&self) -> &str {
        &self.namespaced_name
    }

    fn descriptor(&self) -> Tool {
        self.descriptor.clone()
    }

    async fn call(&self, args: Value) -> Result<String, ToolError> {
        let arguments = match args {
            Value::Object(map) => Some(map),
            _ => None,
        };

        let call = self.conn.call_tool(CallToolRequestParam {
            name: self.upstream_name.clone().into(),
            arguments,
        });

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(result)) => {
                serde_json::to_string(&result).map_err(|e| ToolError::Failed(e.to_string()))
            }
            Ok(Err(e)) => Err(ToolError::Unavailable(e.to_string())),
            Err(_) => Err(ToolError::Timeout(self.timeout)),
        }
    }
}

/// Loads MCP server configuration from a TOML file, same shape as the
/// existing `mcp::config::Config` in this codebase.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct McpConfigFile {
    #[serde(default)]
    pub mcp: Vec<McpServerConfig>,
}

impl McpConfigFile {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(toml::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rmcp_tool_to_tool_namespaces_name() {
        let raw = RmcpTool {
            name: "search_knowledge".into(),
            description: "searches".into(),
            input_schema: Arc::new(Map::new()),
            output_schema: None,
            annotations: None,
            title: None,
            icons: None,
        };
        let tool = rmcp_tool_to_tool(&raw, "crawler_search_knowledge").unwrap();
        assert_eq!(tool.function.name, "crawler_search_knowledge");
        assert_eq!(tool.function.description, "searches");
    }
}
