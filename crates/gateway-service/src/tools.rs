//! Tool Loop (C7, `spec.md` §4.6): drives iterative tool-call turns against
//! the model under a point budget, using tools discovered from the MCP
//! server(s) via `crate::discovery`.

use futures::future::join_all;
use gateway_core::chat::{SamplingParams, ToolCall};
use gateway_core::tool::ToolError;
use gateway_core::{BackendClient, ChatMessage, ChatRole, FinishReason, LLMError, ToolRegistry};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::clients::ToolClient;
use crate::sse::SSEEvent;

pub struct ToolLoop {
    pub backend: BackendClient,
    pub model: String,
}

impl ToolLoop {
    /// Runs turns until the model answers, the budget is exhausted, or
    /// `max_turns` elapses. `budget` is points, decremented per successful
    /// tool call by that tool's static cost.
    pub async fn run(
        &self,
        stripped_messages: &[ChatMessage],
        registry: &ToolRegistry,
        tool_client: &ToolClient,
        mut budget: u32,
        max_turns: u32,
        cancel: &CancellationToken,
        mut on_event: impl FnMut(SSEEvent),
    ) -> Result<(), LLMError> {
        let mut messages = stripped_messages.to_vec();
        let tool_definitions = registry.definitions();
        let tools: Option<&[gateway_core::Tool]> =
            if tool_definitions.is_empty() { None } else { Some(&tool_definitions) };

        let mut turn = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let turn_tools = if budget == 0 { None } else { tools };

            let response = self
                .backend
                .chat(&self.model, &messages, turn_tools, &SamplingParams::default())
                .await?;

            let wants_more_tools =
                response.finish_reason == FinishReason::ToolCalls && !response.tool_calls.is_empty();

            if !wants_more_tools {
                let content = response.content.unwrap_or_default();
                on_event(SSEEvent::ContentDelta(content));
                return Ok(());
            }

            if turn >= max_turns {
                messages.push(ChatMessage::system(
                    "Tool call budget for this turn is exhausted. Answer using only what you \
                     have already gathered; no further tool calls are available.",
                ));
                let response = self
                    .backend
                    .chat(&self.model, &messages, None, &SamplingParams::default())
                    .await?;
                on_event(SSEEvent::ContentDelta(response.content.unwrap_or_default()));
                return Ok(());
            }

            if cancel.is_cancelled() {
                return Ok(());
            }

            messages.push(ChatMessage {
                role: ChatRole::Assistant,
                content: None,
                tool_calls: Some(response.tool_calls.clone()),
                tool_call_id: None,
                name: None,
            });

            let outcomes = join_all(response.tool_calls.iter().map(|call| {
                self.execute_one(call, registry, tool_client, &mut on_event)
            }))
            .await;

            for (call, (payload, cost)) in response.tool_calls.iter().zip(outcomes) {
                messages.push(ChatMessage::tool_result(call.id.clone(), payload));
                budget = budget.saturating_sub(cost);
            }

            turn += 1;
        }
    }

    async fn execute_one(
        &self,
        call: &ToolCall,
        registry: &ToolRegistry,
        tool_client: &ToolClient,
        on_event: &mut impl FnMut(SSEEvent),
    ) -> (String, u32) {
        let args: Value = serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
        on_event(SSEEvent::ToolCallEvent {
            name: call.function.name.clone(),
            args: args.clone(),
        });

        if !registry.contains(&call.function.name) {
            let payload = "unknown tool".to_string();
            on_event(SSEEvent::ToolResultEvent {
                name: call.function.name.clone(),
                payload: payload.clone(),
            });
            return (payload, 0);
        }

        let cost = tool_client.cost_of(&call.function.name);
        let payload = match tool_client.call(&call.function.name, args).await {
            Ok(outcome) => outcome.payload,
            Err(ToolError::Timeout(_)) => "tool call timed out".to_string(),
            Err(ToolError::Unavailable(e)) => {
                warn!(tool = %call.function.name, error = %e, "tool unavailable");
                "tool unavailable".to_string()
            }
            Err(e) => {
                warn!(tool = %call.function.name, error = %e, "tool call failed");
                format!("tool error: {e}")
            }
        };

        on_event(SSEEvent::ToolResultEvent {
            name: call.function.name.clone(),
            payload: payload.clone(),
        });
        (payload, cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_core::chat::Tool;
    use gateway_core::tool::ToolHandler;
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn name(&self) -> &str {
            "kb_search"
        }
        fn descriptor(&self) -> Tool {
            Tool::function("kb_search", "searches the kb", serde_json::json!({"type": "object"}))
        }
        async fn call(&self, _args: Value) -> Result<String, ToolError> {
            Ok("found it".to_string())
        }
    }

    #[tokio::test]
    async fn unknown_tool_yields_synthetic_result_without_cost() {
        let registry = ToolRegistry::from_handlers(vec![Arc::new(EchoTool)]);
        let tool_client = ToolClient::new(registry.clone(), Duration::from_secs(1));
        let tool_loop = ToolLoop {
            backend: BackendClient::new(gateway_core::BackendConfig {
                base_url: "http://unused.invalid".to_string(),
                api_key: None,
                timeout: Duration::from_secs(1),
            })
            .unwrap(),
            model: "test".to_string(),
        };

        let call = ToolCall {
            id: "call_1".to_string(),
            call_type: "function".to_string(),
            function: gateway_core::chat::FunctionCall {
                name: "nonexistent_tool".to_string(),
                arguments: "{}".to_string(),
            },
        };

        let mut events = Vec::new();
        let (payload, cost) = tool_loop
            .execute_one(&call, &registry, &tool_client, &mut |e| events.push(e))
            .await;
        assert_eq!(payload, "unknown tool");
        assert_eq!(cost, 0);
    }

    #[tokio::test]
    async fn final_turn_injects_notice_before_last_toolless_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "kb_search", "arguments": "{}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            })))
            .mount(&server)
            .await;

        let registry = ToolRegistry::from_handlers(vec![Arc::new(EchoTool)]);
        let tool_client = ToolClient::new(registry.clone(), Duration::from_secs(1));
        let tool_loop = ToolLoop {
            backend: BackendClient::new(gateway_core::BackendConfig {
                base_url: server.uri(),
                api_key: None,
                timeout: Duration::from_secs(1),
            })
            .unwrap(),
            model: "test".to_string(),
        };

        let messages = vec![ChatMessage::user("find the docs")];
        let cancel = CancellationToken::new();
        let mut events = Vec::new();
        tool_loop
            .run(&messages, &registry, &tool_client, 10, 0, &cancel, |e| events.push(e))
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        let final_body: Value = requests[1].body_json().unwrap();
        assert!(final_body.get("tools").is_none() || final_body["tools"].is_null());
        let final_messages = final_body["messages"].as_array().unwrap();
        let has_notice = final_messages.iter().any(|m| {
            m["role"] == "system"
                && m["content"].as_str().unwrap_or_default().contains("budget")
        });
        assert!(has_notice, "expected a system notice before the final toolless call");
    }
}
