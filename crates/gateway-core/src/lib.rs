//! Provider-agnostic types shared between the gateway's HTTP surface and
//! its research/tool-loop orchestration: chat wire types, the LM backend
//! client, the tool descriptor registry, and (with the `mcp` feature) an
//! MCP client adapter.

pub mod backend;
pub mod chat;
pub mod error;
#[cfg(feature = "mcp")]
pub mod mcp;
pub mod tool;

pub use backend::{BackendClient, BackendConfig};
pub use chat::{ChatMessage, ChatRole, FinishReason, FunctionTool, StreamChunk, Tool, ToolCall};
pub use error::LLMError;
pub use tool::{ToolError, ToolHandler, ToolRegistry};
