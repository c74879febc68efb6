//! Tool Client (C8, `spec.md` §4.7). Wraps the MCP-backed `ToolRegistry`
//! already assembled by discovery (`crate::discovery`) rather than opening a
//! second connection to the MCP server.

use gateway_core::tool::ToolError;
use gateway_core::ToolRegistry;
use serde_json::Value;
use std::time::Duration;

#[derive(Clone)]
pub struct ToolClient {
    registry: ToolRegistry,
    deadline: Duration,
}

pub struct ToolCallOutcome {
    pub payload: String,
    pub duration: Duration,
}

impl ToolClient {
    pub fn new(registry: ToolRegistry, deadline: Duration) -> Self {
        Self { registry, deadline }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Invokes `name` with `args` under the per-call deadline. Connection
    /// loss is surfaced as `ToolError::Unavailable`; the handler turns both
    /// that and `ToolError::Timeout` into synthetic tool-result messages.
    pub async fn call(&self, name: &str, args: Value) -> Result<ToolCallOutcome, ToolError> {
        let Some(handler) = self.registry.find(name) else {
            return Err(ToolError::Unknown(name.to_string()));
        };

        let started = std::time::Instant::now();
        match tokio::time::timeout(self.deadline, handler.call(args)).await {
            Ok(Ok(payload)) => Ok(ToolCallOutcome {
                payload,
                duration: started.elapsed(),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ToolError::Timeout(self.deadline)),
        }
    }

    pub fn cost_of(&self, name: &str) -> u32 {
        self.registry.find(name).map(|h| h.cost()).unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_core::chat::Tool;
    use gateway_core::tool::ToolHandler;
    use std::sync::Arc;

    struct SlowTool;

    #[async_trait]
    impl ToolHandler for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn descriptor(&self) -> Tool {
            Tool::function("slow", "sleeps", serde_json::json!({"type": "object"}))
        }
        async fn call(&self, _args: Value) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok("done".to_string())
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let client = ToolClient::new(ToolRegistry::default(), Duration::from_secs(1));
        let result = client.call("missing", Value::Null).await;
        assert!(matches!(result, Err(ToolError::Unknown(_))));
    }

    #[tokio::test]
    async fn call_times_out_under_tight_deadline() {
        let registry = ToolRegistry::from_handlers(vec![Arc::new(SlowTool)]);
        let client = ToolClient::new(registry, Duration::from_millis(5));
        let result = client.call("slow", Value::Null).await;
        assert!(matches!(result, Err(ToolError::Timeout(_))));
    }
}
