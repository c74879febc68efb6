//! SSE Emitter (C12, `spec.md` §4.8).
//!
//! Maps the internal `SSEEvent` union onto `axum::response::sse::Event`,
//! in the same style as the teacher's `render_stream_chunk`: the full JSON
//! value is built in memory before any bytes reach the socket.

use axum::response::sse::Event;
use gateway_core::{ChatMessage, FinishReason, StreamChunk, ToolCall};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum SSEEvent {
    ContentDelta(String),
    StatusUpdate {
        description: String,
        done: bool,
        hidden: bool,
    },
    ToolCallEvent {
        name: String,
        args: Value,
    },
    ToolResultEvent {
        name: String,
        payload: String,
    },
    Terminator,
}

impl SSEEvent {
    pub fn status(description: impl Into<String>) -> Self {
        SSEEvent::StatusUpdate {
            description: description.into(),
            done: false,
            hidden: false,
        }
    }

    pub fn hidden_status(description: impl Into<String>) -> Self {
        SSEEvent::StatusUpdate {
            description: description.into(),
            done: true,
            hidden: true,
        }
    }
}

/// Per-stream context needed to shape chat-completion-chunk envelopes
/// (`spec.md` §6.3): a stable completion id, model name, and creation time.
#[derive(Clone)]
pub struct ChunkEnvelope {
    pub id: String,
    pub model: String,
    pub created: i64,
}

impl ChunkEnvelope {
    pub fn new(model: impl Into<String>, created: i64) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            model: model.into(),
            created,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }]
        })
    }

    pub fn content_chunk(&self, text: &str) -> Value {
        self.chunk(json!({"content": text}), None)
    }

    pub fn finish_chunk(&self, reason: FinishReason) -> Value {
        self.chunk(json!({}), Some(finish_reason_str(reason)))
    }

    pub fn tool_call_chunk(&self, index: usize, tool_call: &ToolCall) -> Value {
        self.chunk(
            json!({
                "tool_calls": [{
                    "index": index,
                    "id": tool_call.id,
                    "type": "function",
                    "function": {
                        "name": tool_call.function.name,
                        "arguments": tool_call.function.arguments,
                    }
                }]
            }),
            None,
        )
    }
}

fn finish_reason_str(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
        FinishReason::ToolCalls => "tool_calls",
        FinishReason::ContentFilter => "content_filter",
    }
}

/// Converts one `SSEEvent` into the wire `Event`. `None` for the Terminator,
/// whose literal `data: [DONE]\n\n` is written directly by the stream driver.
pub fn render(event: &SSEEvent, envelope: &ChunkEnvelope) -> Option<Event> {
    match event {
        SSEEvent::ContentDelta(text) => {
            Some(Event::default().data(envelope.content_chunk(text).to_string()))
        }
        SSEEvent::StatusUpdate {
            description,
            done,
            hidden,
        } => {
            let payload = json!({
                "type": "status",
                "data": {
                    "description": description,
                    "done": done,
                    "hidden": hidden,
                }
            });
            Some(Event::default().data(payload.to_string()))
        }
        SSEEvent::ToolCallEvent { name, args } => {
            let payload = json!({
                "type": "tool_call",
                "data": { "name": name, "args": args }
            });
            Some(Event::default().data(payload.to_string()))
        }
        SSEEvent::ToolResultEvent { name, payload: p } => {
            let payload = json!({
                "type": "tool_result",
                "data": { "name": name, "payload": p }
            });
            Some(Event::default().data(payload.to_string()))
        }
        SSEEvent::Terminator => None,
    }
}

/// Converts a `StreamChunk` from the LM backend directly into an
/// `SSEEvent::ContentDelta`/terminal signal, used by the Passthrough
/// Forwarder which has no status events of its own to interleave.
pub fn from_backend_chunk(chunk: StreamChunk) -> Option<SSEEvent> {
    match chunk {
        StreamChunk::Text(text) => Some(SSEEvent::ContentDelta(text)),
        StreamChunk::Done { .. } => Some(SSEEvent::Terminator),
        StreamChunk::ToolCallStart { name, .. } => Some(SSEEvent::ToolCallEvent {
            name,
            args: Value::Null,
        }),
        StreamChunk::ToolCallArgsDelta { .. } => None,
        StreamChunk::ToolCallComplete { tool_call, .. } => Some(SSEEvent::ToolCallEvent {
            name: tool_call.function.name,
            args: serde_json::from_str(&tool_call.function.arguments)
                .unwrap_or(Value::Null),
        }),
    }
}

const APOLOGY_TEXT: &str =
    "\n\n_Sorry, something went wrong while generating this response._";

/// Final apology message used when an error occurs after the first SSE
/// event has already been written (`spec.md` §7 propagation policy).
pub fn apology_message(_original: &[ChatMessage]) -> SSEEvent {
    SSEEvent::ContentDelta(APOLOGY_TEXT.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_delta_renders_as_chat_chunk() {
        let envelope = ChunkEnvelope::new("gpt-test", 0);
        let event = SSEEvent::ContentDelta("hi".to_string());
        let rendered = render(&event, &envelope).unwrap();
        let text = format!("{rendered:?}");
        assert!(text.contains("chat.completion.chunk"));
    }

    #[test]
    fn status_update_has_distinct_envelope() {
        let envelope = ChunkEnvelope::new("gpt-test", 0);
        let event = SSEEvent::status("turn 1 — web search");
        let rendered = render(&event, &envelope).unwrap();
        let text = format!("{rendered:?}");
        assert!(text.contains("\"type\":\"status\""));
    }

    #[test]
    fn terminator_has_no_wire_representation() {
        let envelope = ChunkEnvelope::new("gpt-test", 0);
        assert!(render(&SSEEvent::Terminator, &envelope).is_none());
    }
}
