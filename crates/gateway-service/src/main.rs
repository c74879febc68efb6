mod admission;
mod cancellation;
mod classifier;
mod clients;
mod config;
mod discovery;
mod errors;
mod health;
mod models;
mod passthrough;
mod research;
mod router;
mod sse;
mod state;
mod tags;
mod tools;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use clap::Parser;
use futures::stream::{self, Stream, StreamExt};
use gateway_core::chat::SamplingParams;
use gateway_core::{BackendClient, BackendConfig, ChatMessage, LLMError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::admission::{AdmissionController, AdmissionMode, AdmissionStatus};
use crate::cancellation::CancellationGuard;
use crate::classifier::{self, LmDispatchClassifier};
use crate::clients::{CrawlClient, RetrievalClient, SearchClient};
use crate::config::{AppConfig, Args};
use crate::discovery::ToolDiscovery;
use crate::errors::GatewayError;
use crate::health::HealthRegistry;
use crate::models::{handle_models, ModelsCache};
use crate::router::{Mode, ModeRouter, ResearchDepth};
use crate::sse::{ChunkEnvelope, SSEEvent};
use crate::state::AppState;
use crate::tools::ToolLoop;

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    model: Option<String>,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

impl ChatCompletionRequest {
    fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            extra: Default::default(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gateway_service=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let args = Args::parse();
    let config = Arc::new(AppConfig::load(args.config.as_deref()).await?);

    info!(
        addr = %args.addr,
        backend = %config.backend_base_url,
        auth = %args.auth_key.as_ref().map(|_| "enabled").unwrap_or("disabled"),
        "starting request orchestration gateway"
    );

    let backend = BackendClient::new(BackendConfig {
        base_url: config.backend_base_url.clone(),
        api_key: None,
        timeout: config.backend_timeout(),
    })?;

    let http = reqwest::Client::new();
    let discovery = Arc::new(ToolDiscovery::new(
        config.tool_server.clone().into_iter().collect(),
    ));
    tokio::spawn(discovery.clone().run(config.discovery_interval()));

    let models = Arc::new(ModelsCache::new(config.backend_base_url.clone(), http));
    tokio::spawn(models.clone().run(
        std::time::Duration::from_secs(config.models_bootstrap_interval_secs),
        std::time::Duration::from_secs(config.models_steady_interval_secs),
    ));

    let health = HealthRegistry::new(vec!["llm_backend".to_string()]);

    let state = Arc::new(AppState {
        config: config.clone(),
        backend,
        router: ModeRouter::new(Box::new(router::KeywordClassifier), config.classifier_confidence_threshold),
        admission: AdmissionController::new(config.max_standard_research, config.max_deep_research),
        discovery,
        search: SearchClient::new(config.search_base_url.clone(), config.search_api_key.clone(), config.search_timeout()),
        retrieval: RetrievalClient::new(config.retrieval_base_url.clone(), config.retrieval_token.clone(), config.retrieval_timeout()),
        crawl: CrawlClient::new(config.crawl_base_url.clone(), config.crawl_timeout()),
        health,
        models,
        auth_key: args.auth_key,
    });

    let app = Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/models", get(handle_models))
        .route("/health", get(health::handle_health))
        .route("/openapi.json", get(proxy_openapi))
        .fallback(any(proxy_passthrough))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(key) = &state.auth_key else {
        return Ok(());
    };
    let unauthorized = || {
        (StatusCode::UNAUTHORIZED, Json(json!({"error": {"message": "invalid API key"}}))).into_response()
    };
    let Some(value) = headers.get("Authorization").and_then(|v| v.to_str().ok()) else {
        return Err(unauthorized());
    };
    match value.strip_prefix("Bearer ") {
        Some(token) if token == key => Ok(()),
        _ => Err(unauthorized()),
    }
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, Response> {
    check_auth(&state, &headers)?;

    let mut messages = req.messages.clone();
    let tags = tags::parse_and_strip(&mut messages).map_err(GatewayError::from).map_err(IntoResponse::into_response)?;
    let decision = state.router.route(&messages, &tags).await;
    info!(mode = ?decision.mode, reason = %decision.reason, "routed request");

    let model = req.model.clone().unwrap_or_else(|| "default".to_string());
    let sampling = req.sampling();

    let guard = CancellationGuard::new();
    let cancel = guard.token.clone();

    if req.stream {
        let (tx, mut rx) =
            tokio::sync::mpsc::unbounded_channel::<Result<axum::response::sse::Event, Infallible>>();
        let (err_tx, mut err_rx) = oneshot::channel::<GatewayError>();
        let created = now_unix();
        let envelope = ChunkEnvelope::new(model.clone(), created);
        let apology_envelope = envelope.clone();
        let emitted = Arc::new(AtomicBool::new(false));

        let watcher_cancel = cancel.clone();
        let emitted_writer = emitted.clone();
        let tx_for_mode = tx.clone();
        tokio::spawn(async move {
            let result = run_mode(state, decision.mode, messages, model, sampling, cancel, move |event| {
                let Some(rendered) = sse::render(&event, &envelope) else {
                    return;
                };
                emitted_writer.store(true, Ordering::Relaxed);
                if tx_for_mode.send(Ok(rendered)).is_err() {
                    // Receiver dropped: the client disconnected and axum
                    // stopped polling the stream. Cancel so downstream loops
                    // stop issuing new auxiliary requests.
                    watcher_cancel.cancel();
                }
            })
            .await;

            match result {
                Ok(()) => {
                    let _ = tx.send(Ok(axum::response::sse::Event::default().data("[DONE]")));
                }
                Err(err) => {
                    if emitted.load(Ordering::Relaxed) {
                        if let Some(rendered) =
                            sse::render(&sse::apology_message(&[]), &apology_envelope)
                        {
                            let _ = tx.send(Ok(rendered));
                        }
                        let _ = tx.send(Ok(axum::response::sse::Event::default().data("[DONE]")));
                    } else {
                        // Nothing has reached the client yet; surface this as
                        // a proper HTTP error instead of a 200 stream.
                        let _ = err_tx.send(err);
                    }
                }
            }
        });

        let first_or_err = tokio::select! {
            biased;
            Ok(err) = &mut err_rx => return Err(err.into_response()),
            item = rx.recv() => item,
        };

        let (close_tx, close_rx) = oneshot::channel::<()>();
        guard.watch(async move {
            let _ = close_rx.await;
        });

        let body = stream::iter(first_or_err).chain(tokio_stream_from_receiver(rx));
        let body = NotifyOnDrop {
            inner: body,
            _signal: Some(close_tx),
        };
        Ok(Sse::new(body).keep_alive(KeepAlive::default()).into_response())
    } else {
        let mut buffer = String::new();
        let result = run_mode(state, decision.mode, messages, model.clone(), sampling, cancel, |event| {
            if let SSEEvent::ContentDelta(text) = event {
                buffer.push_str(&text);
            }
        })
        .await;

        if let Err(err) = result {
            return Ok(err.into_response());
        }

        Ok(Json(json!({
            "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            "object": "chat.completion",
            "created": now_unix(),
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": buffer},
                "finish_reason": "stop",
            }]
        }))
        .into_response())
    }
}

/// Fires its drop signal (which in turn triggers the request's
/// `CancellationGuard`) when axum drops this SSE body — on client
/// disconnect or early handler termination — not only when a send against
/// an already-closed channel fails.
struct NotifyOnDrop<S> {
    inner: S,
    _signal: Option<oneshot::Sender<()>>,
}

impl<S: Stream + Unpin> Stream for NotifyOnDrop<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

/// Dispatches to the selected execution mode and maps its outcome to a
/// `GatewayError`. Callers decide what an error means in terms of wire
/// framing (HTTP-level error vs. apology content); this function only
/// propagates it and records backend health.
async fn run_mode(
    state: Arc<AppState>,
    mode: Mode,
    messages: Vec<ChatMessage>,
    model: String,
    sampling: SamplingParams,
    cancel: CancellationToken,
    mut on_event: impl FnMut(SSEEvent) + Send + 'static,
) -> Result<(), GatewayError> {
    let result: Result<(), LLMError> = match mode {
        Mode::PureLlm => {
            passthrough::forward(&state.backend, &model, &messages, None, &sampling, &cancel, &mut on_event).await
        }
        Mode::Research(depth) => run_research(&state, depth, &messages, &model, &cancel, &mut on_event).await,
        Mode::Autonomous => run_tool_loop(&state, &messages, &model, state.config.tool_budget, &cancel, &mut on_event).await,
        Mode::AutonomousPlus => {
            let query = messages
                .iter()
                .rev()
                .find(|m| m.role == gateway_core::ChatRole::User)
                .map(|m| m.text())
                .unwrap_or_default();
            // `LmDispatchClassifier` only needs `state.backend`, which is
            // always configured, so it's always the classifier in use.
            let classifier = LmDispatchClassifier::new(state.backend.clone(), model.clone());
            match classifier::dispatch(&classifier, &query).await {
                classifier::Classification::Research => {
                    run_research(&state, ResearchDepth::Standard, &messages, &model, &cancel, &mut on_event).await
                }
                classifier::Classification::Autonomous => {
                    run_tool_loop(&state, &messages, &model, state.config.autonomous_tool_budget, &cancel, &mut on_event).await
                }
            }
        }
    };

    match &result {
        Ok(()) => state.health.record("llm_backend", true, None).await,
        Err(LLMError::Unavailable(detail)) => {
            state.health.record("llm_backend", false, Some(detail.clone())).await
        }
        Err(_) => state.health.record("llm_backend", true, None).await,
    }

    if let Err(e) = &result {
        warn!(error = %e, "mode execution failed");
    }
    result.map_err(GatewayError::from)
}

async fn run_research(
    state: &AppState,
    depth: ResearchDepth,
    messages: &[ChatMessage],
    model: &str,
    cancel: &CancellationToken,
    on_event: &mut impl FnMut(SSEEvent),
) -> Result<(), gateway_core::LLMError> {
    let admission_mode = match depth {
        ResearchDepth::Standard => AdmissionMode::StandardResearch,
        ResearchDepth::Deep => AdmissionMode::DeepResearch,
    };
    let ticket = state
        .admission
        .acquire(admission_mode, cancel, |status| {
            on_event(admission_status_event(status));
        })
        .await;
    let Ok(_ticket) = ticket else {
        return Ok(());
    };

    let iterations = match depth {
        ResearchDepth::Standard => state.config.standard_iterations,
        ResearchDepth::Deep => state.config.deep_iterations,
    };

    let orchestrator = research::ResearchOrchestrator {
        backend: state.backend.clone(),
        search: state.search.clone(),
        retrieval: state.retrieval.clone(),
        crawl: state.crawl.clone(),
        tool_client: state.tool_client(),
        model: model.to_string(),
        duplicate_query_threshold: state.config.duplicate_query_threshold,
        retry_degrade_step: state.config.retry_degrade_step,
        crawl_per_url_deadline: state.config.crawl_timeout(),
    };
    orchestrator
        .run(messages, iterations, state.config.research_tool_budget, cancel, on_event)
        .await
}

async fn run_tool_loop(
    state: &AppState,
    messages: &[ChatMessage],
    model: &str,
    budget: u32,
    cancel: &CancellationToken,
    on_event: &mut impl FnMut(SSEEvent),
) -> Result<(), gateway_core::LLMError> {
    let registry = state.discovery.current();
    let tool_client = state.tool_client();
    let tool_loop = ToolLoop {
        backend: state.backend.clone(),
        model: model.to_string(),
    };
    tool_loop
        .run(messages, &registry, &tool_client, budget, state.config.max_tool_turns, cancel, on_event)
        .await
}

fn admission_status_event(status: AdmissionStatus) -> SSEEvent {
    match status {
        AdmissionStatus::QueueFull { in_use, capacity } => {
            SSEEvent::status(format!("queue full; waiting for slot ({in_use}/{capacity} used)"))
        }
        AdmissionStatus::SlotAvailable => SSEEvent::status("slot available; starting"),
    }
}

fn tokio_stream_from_receiver(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Result<axum::response::sse::Event, Infallible>>,
) -> impl Stream<Item = Result<axum::response::sse::Event, Infallible>> {
    stream::poll_fn(move |cx| rx.poll_recv(cx))
}

async fn proxy_openapi(State(state): State<Arc<AppState>>) -> Response {
    proxy_to_bridge(&state, "/openapi.json").await
}

async fn proxy_passthrough(State(state): State<Arc<AppState>>, req: axum::http::Request<axum::body::Body>) -> Response {
    proxy_to_bridge(&state, req.uri().path()).await
}

async fn proxy_to_bridge(state: &AppState, path: &str) -> Response {
    let url = format!("{}{}", state.config.retrieval_base_url.trim_end_matches('/'), path);
    match reqwest::Client::new().get(&url).send().await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            match resp.json::<Value>().await {
                Ok(body) => (status, Json(body)).into_response(),
                Err(_) => status.into_response(),
            }
        }
        Err(_) => StatusCode::BAD_GATEWAY.into_response(),
    }
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}
