//! The tool descriptor registry.
//!
//! Per the "descriptor registry" design note: tools are not discovered by
//! introspecting running code. A `ToolDescriptor` is static metadata (name,
//! description, schema, point cost) paired with a handler; the registry is
//! the single source of truth that both the tool loop (to build the LM's
//! tool list) and the invocation path (to dispatch a call) read from.

use crate::chat::Tool;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),
    #[error("tool call timed out after {0:?}")]
    Timeout(Duration),
    #[error("tool backend unavailable: {0}")]
    Unavailable(String),
    #[error("tool invocation failed: {0}")]
    Failed(String),
}

/// A single invocable tool: static metadata plus the handler that executes it.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// `{namespace}_{operation}`, e.g. `kb_search`.
    fn name(&self) -> &str;
    fn descriptor(&self) -> Tool;
    /// Point cost deducted from the tool-loop budget on a successful call.
    /// Defaults to 1 per `spec.md` §4.6.
    fn cost(&self) -> u32 {
        1
    }
    async fn call(&self, args: Value) -> Result<String, ToolError>;
}

/// Immutable snapshot of currently-available tools.
///
/// Readers (the tool loop, building a turn's tool list) never block on the
/// discovery task that refreshes this; the registry hands out clones of an
/// `Arc<HashMap<..>>` that is atomically swapped by the writer.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<HashMap<String, Arc<dyn ToolHandler>>>,
}

impl ToolRegistry {
    pub fn from_handlers(handlers: Vec<Arc<dyn ToolHandler>>) -> Self {
        let tools = handlers
            .into_iter()
            .map(|h| (h.name().to_string(), h))
            .collect();
        Self {
            tools: Arc::new(tools),
        }
    }

    pub fn definitions(&self) -> Vec<Tool> {
        self.tools.values().map(|t| t.descriptor()).collect()
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn name(&self) -> &str {
            "test_echo"
        }
        fn descriptor(&self) -> Tool {
            Tool::function("test_echo", "echoes input", serde_json::json!({"type": "object"}))
        }
        async fn call(&self, args: Value) -> Result<String, ToolError> {
            Ok(args.to_string())
        }
    }

    #[test]
    fn registry_looks_up_by_name() {
        let reg = ToolRegistry::from_handlers(vec![Arc::new(EchoTool)]);
        assert!(reg.contains("test_echo"));
        assert!(reg.find("missing").is_none());
        assert_eq!(reg.definitions().len(), 1);
    }
}
