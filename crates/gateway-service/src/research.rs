//! Research Orchestrator (C6, `spec.md` §4.5). The largest single component:
//! runs a bounded multi-iteration research loop, accumulating context from
//! the knowledge base, the crawler, and web search, then synthesizes a
//! final answer streamed back through the SSE Emitter.

use futures::StreamExt;
use gateway_core::chat::SamplingParams;
use gateway_core::tool::ToolError;
use gateway_core::{BackendClient, ChatMessage, LLMError};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cancellation::{drain_or_abandon, drain_or_give_up};
use crate::clients::{CrawlClient, RetrievalClient, SearchClient, ToolClient};
use crate::sse::SSEEvent;

/// Mutable per-research-request state (`spec.md` §3's `IterationContext`).
/// Owned by the single task running the request; no locking needed.
pub struct IterationContext {
    pub original_query: String,
    pub iteration: usize,
    pub accumulated_context: String,
    pub prior_queries: Vec<String>,
    pub crawled_urls: std::collections::HashSet<String>,
    /// Points remaining for research-embedded tool use (`spec.md` §4.6),
    /// distinct from the Tool Loop's own budget.
    pub remaining_tool_budget: u32,
}

impl IterationContext {
    pub fn new(original_query: String, tool_budget: u32) -> Self {
        Self {
            original_query,
            iteration: 0,
            accumulated_context: String::new(),
            prior_queries: Vec::new(),
            crawled_urls: std::collections::HashSet::new(),
            remaining_tool_budget: tool_budget,
        }
    }

    fn append(&mut self, tag: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        self.accumulated_context.push_str(&format!("\n\n[{tag}] {text}"));
    }
}

pub struct ResearchOrchestrator {
    pub backend: BackendClient,
    pub search: SearchClient,
    pub retrieval: RetrievalClient,
    pub crawl: CrawlClient,
    pub tool_client: ToolClient,
    pub model: String,
    pub duplicate_query_threshold: f32,
    pub retry_degrade_step: usize,
    pub crawl_per_url_deadline: Duration,
}

const FOCUS_BY_ITERATION: &[&str] = &[
    "main concepts",
    "practical implementation",
    "advanced features",
    "ecosystem and alternatives",
];

impl ResearchOrchestrator {
    /// Runs the full research protocol for `iterations` (2 or 4), emitting
    /// SSE events via `on_event`. Retries once at a reduced depth on
    /// context overflow; on a second overflow, synthesizes from whatever
    /// context has accumulated (Resolved Open Question #2).
    pub async fn run(
        &self,
        stripped_messages: &[ChatMessage],
        iterations: usize,
        tool_budget: u32,
        cancel: &CancellationToken,
        mut on_event: impl FnMut(SSEEvent),
    ) -> Result<(), LLMError> {
        let original_query = stripped_messages
            .iter()
            .rev()
            .find(|m| m.role == gateway_core::ChatRole::User)
            .map(|m| m.text())
            .unwrap_or_default();

        let mut ctx = IterationContext::new(original_query.clone(), tool_budget);

        let seed_results = drain_or_abandon(cancel, self.search.search(&original_query, 10))
            .await
            .unwrap_or_default();
        for r in &seed_results {
            ctx.append("web", &format!("{}: {} ({})", r.title, r.snippet, r.url));
        }

        match self.run_loop(&mut ctx, iterations, cancel, &mut on_event).await {
            Ok(()) => {}
            Err(LLMError::ContextLengthExceeded(_)) => {
                let degraded = iterations.saturating_sub(self.retry_degrade_step).max(2);
                on_event(SSEEvent::status("context overflow; restarting with fewer iterations"));
                let mut retry_ctx = IterationContext::new(original_query.clone(), ctx.remaining_tool_budget);
                retry_ctx.accumulated_context = ctx.accumulated_context.clone();
                match self.run_loop(&mut retry_ctx, degraded, cancel, &mut on_event).await {
                    Ok(()) => ctx = retry_ctx,
                    Err(LLMError::ContextLengthExceeded(_)) => {
                        warn!("second context overflow; synthesizing on truncated context");
                        ctx = retry_ctx;
                        truncate_from_start(&mut ctx.accumulated_context);
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }

        if cancel.is_cancelled() {
            return Ok(());
        }

        on_event(SSEEvent::hidden_status("done"));
        self.synthesize(&ctx, stripped_messages, cancel, &mut on_event).await?;
        Ok(())
    }

    async fn run_loop(
        &self,
        ctx: &mut IterationContext,
        iterations: usize,
        cancel: &CancellationToken,
        on_event: &mut impl FnMut(SSEEvent),
    ) -> Result<(), LLMError> {
        for i in 0..iterations {
            if cancel.is_cancelled() {
                return Ok(());
            }
            ctx.iteration = i;
            let focus = FOCUS_BY_ITERATION.get(i).copied().unwrap_or("general");

            on_event(SSEEvent::status(format!("Turn {} — generating search query", i + 1)));
            let Some(query) = drain_or_give_up(cancel, self.generate_query(ctx, focus)).await? else {
                return Ok(());
            };
            if cancel.is_cancelled() {
                return Ok(());
            }

            on_event(SSEEvent::status(format!("Turn {} — knowledge-base search", i + 1)));
            let kb_results = drain_or_abandon(cancel, self.retrieval.search(&query, 4))
                .await
                .unwrap_or_default();
            for r in &kb_results {
                ctx.append("kb", &format!("{} ({})", r.text, r.source));
            }
            if cancel.is_cancelled() {
                return Ok(());
            }

            on_event(SSEEvent::status(format!("Turn {} — generating URLs", i + 1)));
            let Some(urls) = drain_or_give_up(cancel, self.generate_urls(ctx)).await? else {
                return Ok(());
            };
            let fresh_urls: Vec<String> = urls
                .into_iter()
                .filter(|u| !ctx.crawled_urls.contains(u))
                .take(3)
                .collect();
            if cancel.is_cancelled() {
                return Ok(());
            }

            on_event(SSEEvent::status(format!("Turn {} — crawling", i + 1)));
            let crawled =
                drain_or_abandon(cancel, self.crawl.fetch_many(&fresh_urls, self.crawl_per_url_deadline))
                    .await
                    .unwrap_or_default();
            for r in &crawled {
                ctx.crawled_urls.insert(r.url.clone());
                ctx.append("crawl url", &format!("{}: {}", r.url, r.text));
            }
            if cancel.is_cancelled() {
                return Ok(());
            }

            on_event(SSEEvent::status(format!("Turn {} — web search", i + 1)));
            let web_results = drain_or_abandon(cancel, self.search.search(&query, 5))
                .await
                .unwrap_or_default();
            for r in &web_results {
                ctx.append("web", &format!("{}: {} ({})", r.title, r.snippet, r.url));
            }

            if ctx.remaining_tool_budget > 0 {
                on_event(SSEEvent::status(format!("Turn {} — tool-assisted gathering", i + 1)));
                if let Some((name, payload, cost)) =
                    drain_or_give_up(cancel, self.try_tool_call(ctx, focus, &mut *on_event)).await?
                {
                    ctx.append("tool", &format!("{name}: {payload}"));
                    ctx.remaining_tool_budget = ctx.remaining_tool_budget.saturating_sub(cost);
                }
                if cancel.is_cancelled() {
                    return Ok(());
                }
            }

            ctx.prior_queries.push(query);
        }
        Ok(())
    }

    /// Offers the model one tool call, bounded by `ctx.remaining_tool_budget`
    /// (`spec.md` §4.6's "research-embedded tool use" budget, distinct from
    /// the Tool Loop). Returns `None` if the model declines or the call
    /// fails; failures are swallowed the same way the Tool Loop reports
    /// them back to the model, since a missed tool result shouldn't abort
    /// the whole research iteration.
    async fn try_tool_call(
        &self,
        ctx: &IterationContext,
        focus: &str,
        on_event: &mut impl FnMut(SSEEvent),
    ) -> Result<Option<(String, String, u32)>, LLMError> {
        let tool_definitions = self.tool_client.registry().definitions();
        if tool_definitions.is_empty() {
            return Ok(None);
        }
        let prompt = format!(
            "Researching \"{}\" with an emphasis on {focus}. Call one tool if it would help, \
             otherwise reply with nothing.",
            ctx.original_query
        );
        let response = self
            .backend
            .chat(
                &self.model,
                &[ChatMessage::user(prompt)],
                Some(&tool_definitions),
                &SamplingParams::default(),
            )
            .await?;

        let Some(call) = response.tool_calls.into_iter().next() else {
            return Ok(None);
        };
        let args: Value = serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
        on_event(SSEEvent::ToolCallEvent {
            name: call.function.name.clone(),
            args: args.clone(),
        });

        let cost = self.tool_client.cost_of(&call.function.name);
        let payload = match self.tool_client.call(&call.function.name, args).await {
            Ok(outcome) => outcome.payload,
            Err(ToolError::Timeout(_)) => "tool call timed out".to_string(),
            Err(e) => {
                warn!(tool = %call.function.name, error = %e, "research tool call failed");
                return Ok(None);
            }
        };
        on_event(SSEEvent::ToolResultEvent {
            name: call.function.name.clone(),
            payload: payload.clone(),
        });
        Ok(Some((call.function.name, payload, cost)))
    }

    /// Generates a focused search query for this iteration, rejecting a
    /// near-duplicate of any prior query once before accepting regardless
    /// (`spec.md` §4.5, one retry only).
    async fn generate_query(&self, ctx: &IterationContext, focus: &str) -> Result<String, LLMError> {
        let mut attempt = 0;
        loop {
            let avoid = if ctx.prior_queries.is_empty() {
                String::new()
            } else {
                format!(
                    "\n\nAvoid repeating or closely paraphrasing any of these previously issued \
                     queries:\n{}",
                    ctx.prior_queries
                        .iter()
                        .map(|q| format!("- {q}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                )
            };
            let prompt = format!(
                "Generate one focused web-search query about \"{}\" with an emphasis on {focus}.{avoid} \
                 Respond with only the query text.",
                ctx.original_query
            );
            let response = self
                .backend
                .chat(&self.model, &[ChatMessage::user(prompt)], None, &SamplingParams::default())
                .await?;
            let candidate = response.content.unwrap_or_default().trim().to_string();

            let is_duplicate = ctx
                .prior_queries
                .iter()
                .any(|prior| jaccard_similarity(prior, &candidate) >= self.duplicate_query_threshold);

            if !is_duplicate || attempt >= 1 {
                return Ok(candidate);
            }
            attempt += 1;
        }
    }

    async fn generate_urls(&self, ctx: &IterationContext) -> Result<Vec<String>, LLMError> {
        let prompt = format!(
            "Based on this research context, list 3 candidate URLs (one per line, no commentary) \
             worth crawling for more detail:\n\n{}",
            ctx.accumulated_context
        );
        let response = self
            .backend
            .chat(&self.model, &[ChatMessage::user(prompt)], None, &SamplingParams::default())
            .await?;
        let text = response.content.unwrap_or_default();
        Ok(text
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| l.starts_with("http"))
            .take(3)
            .collect())
    }

    async fn synthesize(
        &self,
        ctx: &IterationContext,
        original_messages: &[ChatMessage],
        cancel: &CancellationToken,
        on_event: &mut impl FnMut(SSEEvent),
    ) -> Result<(), LLMError> {
        let mut messages = original_messages.to_vec();
        messages.push(ChatMessage::user(format!(
            "Using the research below, answer the original question: \"{}\".\n\n{}",
            ctx.original_query, ctx.accumulated_context
        )));

        let Some(mut stream) =
            drain_or_give_up(cancel, self.backend.chat_stream(&self.model, &messages, None, &SamplingParams::default()))
                .await?
        else {
            return Ok(());
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                chunk = stream.next() => chunk,
            };
            match next {
                Some(Ok(gateway_core::StreamChunk::Text(text))) => {
                    on_event(SSEEvent::ContentDelta(text));
                }
                Some(Ok(gateway_core::StreamChunk::Done { .. })) => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        info!(iteration_count = ctx.iteration + 1, "research synthesis complete");
        Ok(())
    }
}

/// Truncates the accumulated context from the start by whole-result
/// boundaries (each result begins with `\n\n[tag] `), keeping the most
/// recent half, used only on a second context-overflow failure.
fn truncate_from_start(context: &mut String) {
    let boundaries: Vec<usize> = context.match_indices("\n\n[").map(|(i, _)| i).collect();
    if boundaries.len() <= 1 {
        return;
    }
    let cut = boundaries[boundaries.len() / 2];
    *context = context[cut..].to_string();
}

/// Coarse Jaccard similarity over whitespace-tokenized, lowercased words.
fn jaccard_similarity(a: &str, b: &str) -> f32 {
    use std::collections::HashSet;
    let set_a: HashSet<&str> = a.to_lowercase().split_whitespace().collect::<Vec<_>>().into_iter().collect();
    let set_b: HashSet<&str> = b.to_lowercase().split_whitespace().collect::<Vec<_>>().into_iter().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f32;
    let union = set_a.union(&set_b).count() as f32;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_core::chat::Tool;
    use gateway_core::tool::{ToolError, ToolHandler};
    use gateway_core::{BackendConfig, ToolRegistry};
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn unused_clients() -> (SearchClient, RetrievalClient, CrawlClient) {
        let dead = "http://127.0.0.1:1".to_string();
        (
            SearchClient::new(dead.clone(), None, Duration::from_millis(10)),
            RetrievalClient::new(dead.clone(), None, Duration::from_millis(10)),
            CrawlClient::new(dead, Duration::from_millis(10)),
        )
    }

    fn orchestrator(server: &MockServer, tool_client: ToolClient) -> ResearchOrchestrator {
        let (search, retrieval, crawl) = unused_clients();
        ResearchOrchestrator {
            backend: BackendClient::new(BackendConfig {
                base_url: server.uri(),
                api_key: None,
                timeout: Duration::from_secs(5),
            })
            .unwrap(),
            search,
            retrieval,
            crawl,
            tool_client,
            model: "test-model".to_string(),
            duplicate_query_threshold: 0.7,
            retry_degrade_step: 2,
            crawl_per_url_deadline: Duration::from_secs(5),
        }
    }

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
    async fn generate_query_prompt_mentions_prior_queries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "a new angle"}, "finish_reason": "stop"}]
            })))
            .mount(&server)
            .await;

        let orchestrator = orchestrator(&server, ToolClient::new(ToolRegistry::default(), Duration::from_secs(1)));
        let mut ctx = IterationContext::new("rust async runtimes".to_string(), 0);
        ctx.prior_queries.push("tokio scheduler internals".to_string());

        let query = orchestrator.generate_query(&ctx, "advanced features").await.unwrap();
        assert_eq!(query, "a new angle");

        let requests = server.received_requests().await.unwrap();
        let body: Value = requests[0].body_json().unwrap();
        let prompt = body["messages"][0]["content"].as_str().unwrap();
        assert!(prompt.contains("tokio scheduler internals"));
    }

    #[tokio::test]
    async fn tool_assisted_gathering_decrements_budget_on_success() {
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
        let tool_client = ToolClient::new(registry, Duration::from_secs(1));
        let orchestrator = orchestrator(&server, tool_client);
        let ctx = IterationContext::new("rust async runtimes".to_string(), 6);

        let mut events = Vec::new();
        let outcome = orchestrator
            .try_tool_call(&ctx, "main concepts", &mut |e| events.push(e))
            .await
            .unwrap();
        let (name, payload, cost) = outcome.expect("tool call should have been made");
        assert_eq!(name, "kb_search");
        assert_eq!(payload, "found it");
        assert_eq!(cost, 1);
    }

    #[tokio::test]
    async fn tool_assisted_gathering_is_noop_with_empty_registry() {
        let server = MockServer::start().await;
        let orchestrator =
            orchestrator(&server, ToolClient::new(ToolRegistry::default(), Duration::from_secs(1)));
        let ctx = IterationContext::new("rust async runtimes".to_string(), 6);

        let outcome = orchestrator
            .try_tool_call(&ctx, "main concepts", &mut |_| {})
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[test]
    fn jaccard_similarity_detects_near_duplicates() {
        let sim = jaccard_similarity("rust async runtime internals", "async runtime internals rust");
        assert!(sim >= 0.7);
    }

    #[test]
    fn jaccard_similarity_distinguishes_unrelated_queries() {
        let sim = jaccard_similarity("raft consensus algorithm", "python list comprehensions");
        assert!(sim < 0.2);
    }

    #[test]
    fn truncate_from_start_keeps_later_half() {
        let mut ctx = String::new();
        for i in 0..6 {
            ctx.push_str(&format!("\n\n[web] result {i}"));
        }
        truncate_from_start(&mut ctx);
        assert!(!ctx.contains("result 0"));
        assert!(ctx.contains("result 5"));
    }

    #[test]
    fn iteration_context_append_tags_source() {
        let mut ctx = IterationContext::new("q".to_string(), 0);
        ctx.append("kb", "some fact");
        assert!(ctx.accumulated_context.contains("[kb] some fact"));
    }

    #[test]
    fn iteration_context_seeds_tool_budget() {
        let ctx = IterationContext::new("q".to_string(), 6);
        assert_eq!(ctx.remaining_tool_budget, 6);
    }
}
