//! Retrieval Client (C10, `spec.md` §4.7) — the vector/graph knowledge-base
//! REST bridge. Best-effort: failures yield an empty result set.

use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub text: String,
    pub source: String,
}

#[derive(Deserialize)]
struct RetrievalApiResponse {
    #[serde(default)]
    matches: Vec<RetrievalApiMatch>,
}

#[derive(Deserialize)]
struct RetrievalApiMatch {
    #[serde(default)]
    text: String,
    #[serde(default)]
    source: String,
}

#[derive(Clone)]
pub struct RetrievalClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RetrievalClient {
    pub fn new(base_url: String, token: Option<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with a valid timeout");
        Self {
            http,
            base_url,
            token,
        }
    }

    pub async fn search(&self, query: &str, top_k: usize) -> Vec<RetrievalResult> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let mut req = self
            .http
            .get(&url)
            .query(&[("q", query), ("top_k", &top_k.to_string())]);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<RetrievalApiResponse>().await {
                Ok(parsed) => parsed
                    .matches
                    .into_iter()
                    .map(|m| RetrievalResult {
                        text: m.text,
                        source: m.source,
                    })
                    .collect(),
                Err(e) => {
                    warn!(error = %e, "retrieval bridge returned unparseable body");
                    Vec::new()
                }
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "retrieval bridge returned an error status");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "retrieval bridge request failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn parses_successful_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "matches": [{"text": "raft is a consensus algorithm", "source": "kb://raft"}]
            })))
            .mount(&server)
            .await;

        let client = RetrievalClient::new(server.uri(), None, Duration::from_secs(5));
        let results = client.search("raft", 3).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, "kb://raft");
    }

    #[tokio::test]
    async fn returns_empty_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = RetrievalClient::new(server.uri(), None, Duration::from_secs(5));
        assert!(client.search("x", 3).await.is_empty());
    }
}
