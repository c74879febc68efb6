//! Client for the downstream language-model backend.
//!
//! The gateway treats the LM backend as a single OpenAI-compatible HTTP
//! endpoint. This module owns request/response translation and SSE framing
//! for both the streaming and non-streaming paths; everything above it
//! (passthrough forwarding, the research orchestrator, the tool loop) talks
//! only in terms of `ChatMessage`/`StreamChunk`.

use crate::chat::{
    ChatMessage, FinishReason, FunctionCall, SamplingParams, StreamChunk, Tool, ToolCall,
};
use crate::error::LLMError;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// A non-streaming chat response from the backend.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
}

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    cfg: BackendConfig,
}

impl BackendClient {
    pub fn new(cfg: BackendConfig) -> Result<Self, LLMError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(LLMError::from)?;
        Ok(Self { http, cfg })
    }

    fn request_body(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
        sampling: &SamplingParams,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        let obj = body.as_object_mut().unwrap();
        if let Some(temp) = sampling.temperature {
            obj.insert("temperature".into(), json!(temp));
        }
        if let Some(top_p) = sampling.top_p {
            obj.insert("top_p".into(), json!(top_p));
        }
        if let Some(max_tokens) = sampling.max_tokens {
            obj.insert("max_tokens".into(), json!(max_tokens));
        }
        for (k, v) in &sampling.extra {
            obj.insert(k.clone(), v.clone());
        }
        if let Some(tools) = tools {
            obj.insert("tools".into(), json!(tools));
        }
        body
    }

    fn request_builder(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path);
        let mut req = self.http.post(url);
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    /// Non-streaming chat completion, used by the research orchestrator and
    /// tool loop for the small scaffolding prompts (query generation, URL
    /// generation, final tool-loop fallback answer).
    pub async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
        sampling: &SamplingParams,
    ) -> Result<ChatResponse, LLMError> {
        let body = self.request_body(model, messages, tools, sampling, false);
        let resp = self
            .request_builder("/chat/completions")
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_error_body(status.as_u16(), text));
        }

        let raw: Value = resp.json().await.map_err(LLMError::from)?;
        parse_chat_response(raw)
    }

    /// Streaming chat completion. Bytes are translated into `StreamChunk`s as
    /// they arrive; the caller forwards them verbatim (passthrough) or folds
    /// them into accumulated context (research synthesis).
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
        sampling: &SamplingParams,
    ) -> Result<BoxStream<'static, Result<StreamChunk, LLMError>>, LLMError> {
        let body = self.request_body(model, messages, tools, sampling, true);
        let resp = self
            .request_builder("/chat/completions")
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_error_body(status.as_u16(), text));
        }

        let byte_stream = resp.bytes_stream();
        let stream = SseChunkDecoder::new(byte_stream);
        Ok(Box::pin(stream))
    }
}

fn classify_error_body(status: u16, body: String) -> LLMError {
    let lower = body.to_lowercase();
    if lower.contains("context_length_exceeded")
        || lower.contains("maximum context length")
        || lower.contains("context window")
    {
        return LLMError::ContextLengthExceeded(body);
    }
    match status {
        500..=599 => LLMError::Unavailable(body),
        _ => LLMError::BadRequest(body),
    }
}

fn parse_chat_response(raw: Value) -> Result<ChatResponse, LLMError> {
    let choice = raw
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| LLMError::ResponseFormat {
            message: "missing choices[0]".into(),
            raw: raw.to_string(),
        })?;
    let message = choice.get("message").ok_or_else(|| LLMError::ResponseFormat {
        message: "missing choices[0].message".into(),
        raw: raw.to_string(),
    })?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .map(|s| s.to_string());

    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| serde_json::from_value::<ToolCall>(tc.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let finish_reason = match choice.get("finish_reason").and_then(|v| v.as_str()) {
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    };

    Ok(ChatResponse {
        content,
        tool_calls,
        finish_reason,
    })
}

#[derive(Deserialize, Debug)]
struct RawStreamChunk {
    choices: Vec<RawStreamChoice>,
}

#[derive(Deserialize, Debug)]
struct RawStreamChoice {
    delta: RawStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct RawStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<RawStreamToolCall>>,
}

#[derive(Deserialize, Debug)]
struct RawStreamToolCall {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    function: RawStreamFunction,
}

#[derive(Deserialize, Debug, Default)]
struct RawStreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: String,
}

/// Decodes an SSE byte stream from the backend into `StreamChunk`s.
///
/// Framing mirrors the `data: <json>\n\n` / `data: [DONE]` convention this
/// codebase already parses for provider SSE streams (see
/// `parse_openai_sse_chunk` in the openai provider crate); the logic here is
/// adapted into a `Stream` combinator instead of a flat byte-chunk parser so
/// it composes with `futures::Stream` directly.
struct SseChunkDecoder<S> {
    inner: S,
    buffer: String,
    tool_states: HashMap<usize, ToolCallState>,
    done: bool,
}

#[derive(Default)]
struct ToolCallState {
    id: String,
    name: String,
    arguments: String,
    started: bool,
}

impl<S> SseChunkDecoder<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: String::new(),
            tool_states: HashMap::new(),
            done: false,
        }
    }
}

impl<S> futures::Stream for SseChunkDecoder<S>
where
    S: futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
{
    type Item = Result<StreamChunk, LLMError>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        loop {
            if let Some(pos) = self.buffer.find('\n') {
                let line = self.buffer[..pos].trim_end_matches('\r').to_string();
                self.buffer.drain(..=pos);
                if let Some(chunk) = self.process_line(&line) {
                    return Poll::Ready(Some(chunk));
                }
                continue;
            }

            if self.done {
                return Poll::Ready(None);
            }

            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(LLMError::from(e))));
                }
                Poll::Ready(None) => {
                    self.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> SseChunkDecoder<S> {
    fn process_line(&mut self, line: &str) -> Option<Result<StreamChunk, LLMError>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
        let data = data.trim();

        if data == "[DONE]" {
            return Some(Ok(StreamChunk::Done {
                finish_reason: FinishReason::Stop,
            }));
        }

        let parsed: RawStreamChunk = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                return Some(Err(LLMError::ResponseFormat {
                    message: e.to_string(),
                    raw: data.to_string(),
                }))
            }
        };

        let Some(choice) = parsed.choices.into_iter().next() else {
            return None;
        };

        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                return Some(Ok(StreamChunk::Text(content)));
            }
        }

        if let Some(tool_calls) = choice.delta.tool_calls {
            for tc in tool_calls {
                let index = tc.index.unwrap_or(0);
                let state = self.tool_states.entry(index).or_default();
                if let Some(id) = tc.id {
                    state.id = id;
                }
                if let Some(name) = tc.function.name {
                    state.name = name;
                    if !state.started {
                        state.started = true;
                        return Some(Ok(StreamChunk::ToolCallStart {
                            index,
                            id: state.id.clone(),
                            name: state.name.clone(),
                        }));
                    }
                }
                if !tc.function.arguments.is_empty() {
                    state.arguments.push_str(&tc.function.arguments);
                    return Some(Ok(StreamChunk::ToolCallArgsDelta {
                        index,
                        partial_json: tc.function.arguments,
                    }));
                }
            }
        }

        if let Some(reason) = choice.finish_reason {
            let finish_reason = match reason.as_str() {
                "tool_calls" => FinishReason::ToolCalls,
                "length" => FinishReason::Length,
                "content_filter" => FinishReason::ContentFilter,
                _ => FinishReason::Stop,
            };
            if matches!(finish_reason, FinishReason::ToolCalls) {
                for (index, state) in self.tool_states.drain() {
                    if state.started {
                        return Some(Ok(StreamChunk::ToolCallComplete {
                            index,
                            tool_call: ToolCall {
                                id: state.id,
                                call_type: "function".to_string(),
                                function: FunctionCall {
                                    name: state.name,
                                    arguments: state.arguments,
                                },
                            },
                        }));
                    }
                }
            }
            return Some(Ok(StreamChunk::Done { finish_reason }));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_error_body_detects_context_overflow() {
        let err = classify_error_body(
            400,
            r#"{"error":{"message":"This model's maximum context length is 8192 tokens"}}"#
                .to_string(),
        );
        assert!(matches!(err, LLMError::ContextLengthExceeded(_)));
    }

    #[test]
    fn classify_error_body_maps_5xx_to_unavailable() {
        let err = classify_error_body(502, "bad gateway".to_string());
        assert!(matches!(err, LLMError::Unavailable(_)));
    }

    #[test]
    fn parse_chat_response_reads_text_content() {
        let raw = json!({
            "choices": [{
                "message": {"role": "assistant", "content": "hi"},
                "finish_reason": "stop"
            }]
        });
        let resp = parse_chat_response(raw).unwrap();
        assert_eq!(resp.content.as_deref(), Some("hi"));
        assert_eq!(resp.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn parse_chat_response_reads_tool_calls() {
        let raw = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "search", "arguments": "{\"q\":\"x\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let resp = parse_chat_response(raw).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].function.name, "search");
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
    }
}
