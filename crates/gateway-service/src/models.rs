//! `GET /v1/models` (`spec.md` §6.1): cached model list refreshed by a
//! background poller (2s bootstrap interval until first success, then 10s).

use arc_swap::ArcSwap;
use axum::extract::State;
use axum::Json;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::state::AppState;

pub struct ModelsCache {
    snapshot: ArcSwap<Value>,
    backend_base_url: String,
    http: reqwest::Client,
}

impl ModelsCache {
    pub fn new(backend_base_url: String, http: reqwest::Client) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Value::Array(Vec::new())),
            backend_base_url,
            http,
        }
    }

    pub fn current(&self) -> Value {
        (**self.snapshot.load()).clone()
    }

    async fn poll_once(&self) -> bool {
        let url = format!("{}/models", self.backend_base_url.trim_end_matches('/'));
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(body) => {
                    let list = body.get("data").cloned().unwrap_or(body);
                    self.snapshot.store(Arc::new(list));
                    true
                }
                Err(e) => {
                    warn!(error = %e, "model list poll returned unparseable body");
                    false
                }
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "model list poll returned an error status");
                false
            }
            Err(e) => {
                warn!(error = %e, "model list poll request failed");
                false
            }
        }
    }

    pub async fn run(self: Arc<Self>, bootstrap_interval: Duration, steady_interval: Duration) {
        loop {
            if self.poll_once().await {
                break;
            }
            tokio::time::sleep(bootstrap_interval).await;
        }
        let mut ticker = tokio::time::interval(steady_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }
}

pub async fn handle_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::json!({
        "object": "list",
        "data": state.models.current(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn poll_once_populates_cache_from_data_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "model-a"}]
            })))
            .mount(&server)
            .await;

        let cache = ModelsCache::new(server.uri(), reqwest::Client::new());
        assert!(cache.poll_once().await);
        assert_eq!(cache.current(), serde_json::json!([{"id": "model-a"}]));
    }

    #[tokio::test]
    async fn poll_once_returns_false_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let cache = ModelsCache::new(server.uri(), reqwest::Client::new());
        assert!(!cache.poll_once().await);
    }
}
