//! Crawl Client (C11, `spec.md` §4.7). Fetches and normalizes URLs; a
//! failed fetch yields nothing for that URL rather than aborting the batch.

use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct CrawlResult {
    pub url: String,
    pub text: String,
}

#[derive(Deserialize)]
struct CrawlApiResponse {
    #[serde(default)]
    text: String,
}

#[derive(Clone)]
pub struct CrawlClient {
    http: reqwest::Client,
    base_url: String,
}

impl CrawlClient {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with a valid timeout");
        Self { http, base_url }
    }

    pub async fn fetch(&self, url: &str) -> Option<CrawlResult> {
        let endpoint = format!("{}/crawl", self.base_url.trim_end_matches('/'));
        let resp = match self.http.get(&endpoint).query(&[("url", url)]).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(url, error = %e, "crawl request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(url, status = %resp.status(), "crawl service returned an error status");
            return None;
        }
        match resp.json::<CrawlApiResponse>().await {
            Ok(parsed) => Some(CrawlResult {
                url: url.to_string(),
                text: parsed.text,
            }),
            Err(e) => {
                warn!(url, error = %e, "crawl service returned unparseable body");
                None
            }
        }
    }

    /// Fetches up to `urls.len()` pages in parallel with a per-URL deadline;
    /// failed fetches are dropped silently (already logged in `fetch`).
    pub async fn fetch_many(&self, urls: &[String], per_url_deadline: Duration) -> Vec<CrawlResult> {
        let futures = urls.iter().map(|url| {
            let client = self.clone();
            let url = url.clone();
            async move {
                match tokio::time::timeout(per_url_deadline, client.fetch(&url)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(url = %url, "crawl request timed out");
                        None
                    }
                }
            }
        });
        futures::future::join_all(futures)
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetch_returns_text_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/crawl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"text": "page body"})))
            .mount(&server)
            .await;

        let client = CrawlClient::new(server.uri(), Duration::from_secs(5));
        let result = client.fetch("https://example.com").await.unwrap();
        assert_eq!(result.text, "page body");
    }

    #[tokio::test]
    async fn fetch_many_skips_failed_urls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/crawl"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = CrawlClient::new(server.uri(), Duration::from_secs(5));
        let results = client
            .fetch_many(&["https://a".to_string(), "https://b".to_string()], Duration::from_secs(5))
            .await;
        assert!(results.is_empty());
    }
}
