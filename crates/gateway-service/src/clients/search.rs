//! Search Client (C9, `spec.md` §4.7).
//!
//! Auxiliary data sources are best-effort: on persistent failure this
//! returns an empty result set rather than raising to the orchestrator.

use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Deserialize)]
struct SearchApiResponse {
    #[serde(default)]
    results: Vec<SearchApiResult>,
}

#[derive(Deserialize)]
struct SearchApiResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    snippet: String,
}

#[derive(Clone)]
pub struct SearchClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

const MAX_ATTEMPTS: u32 = 3;

impl SearchClient {
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with a valid timeout");
        Self {
            http,
            base_url,
            api_key,
        }
    }

    /// Calls the web-search API with bounded exponential backoff on 429,
    /// up to `MAX_ATTEMPTS`. Any persistent failure yields an empty vec.
    pub async fn search(&self, query: &str, top_k: usize) -> Vec<SearchResult> {
        let mut delay = Duration::from_millis(200);
        for attempt in 1..=MAX_ATTEMPTS {
            let mut req = self
                .http
                .get(&self.base_url)
                .query(&[("q", query), ("limit", &top_k.to_string())]);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    warn!(attempt, "search API rate limited, backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    continue;
                }
                Ok(resp) if resp.status().is_success() => {
                    return match resp.json::<SearchApiResponse>().await {
                        Ok(parsed) => parsed
                            .results
                            .into_iter()
                            .map(|r| SearchResult {
                                title: r.title,
                                url: r.url,
                                snippet: r.snippet,
                            })
                            .collect(),
                        Err(e) => {
                            warn!(error = %e, "search API returned unparseable body");
                            Vec::new()
                        }
                    };
                }
                Ok(resp) => {
                    warn!(status = %resp.status(), "search API returned an error status");
                    return Vec::new();
                }
                Err(e) => {
                    warn!(error = %e, "search API request failed");
                    return Vec::new();
                }
            }
        }
        warn!(query, "search API exhausted retries after repeated 429");
        Vec::new()
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
                "results": [{"title": "Raft", "url": "https://x", "snippet": "consensus"}]
            })))
            .mount(&server)
            .await;

        let client = SearchClient::new(format!("{}/search", server.uri()), None, Duration::from_secs(5));
        let results = client.search("raft consensus", 5).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Raft");
    }

    #[tokio::test]
    async fn returns_empty_on_persistent_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = SearchClient::new(format!("{}/search", server.uri()), None, Duration::from_secs(5));
        let results = client.search("x", 5).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn retries_on_429_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"results": []})))
            .mount(&server)
            .await;

        let client = SearchClient::new(format!("{}/search", server.uri()), None, Duration::from_secs(5));
        let results = client.search("x", 5).await;
        assert!(results.is_empty());
    }
}
