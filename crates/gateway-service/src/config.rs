//! Two-layer configuration: an optional TOML file, overridden by environment
//! variables through `clap`'s `env` feature. Mirrors the `default_providers_path`
//! + CLI-override pattern this codebase already uses for the LM-provider config.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Request orchestration gateway")]
pub struct Args {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "GATEWAY_ADDR", default_value = "0.0.0.0:8080")]
    pub addr: String,

    /// Path to a TOML config file. Defaults to `./gateway.toml` if present.
    #[arg(long, env = "GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Optional bearer token required on every request.
    #[arg(long, env = "GATEWAY_AUTH_KEY")]
    pub auth_key: Option<String>,
}

/// Everything in `spec.md` §6.4, assembled once at startup into an
/// `Arc<AppConfig>` shared by the services context.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_backend_url")]
    pub backend_base_url: String,
    #[serde(default = "default_backend_timeout_secs")]
    pub backend_timeout_secs: u64,

    #[serde(default)]
    pub tool_server: Option<McpServerSetting>,

    #[serde(default = "default_retrieval_url")]
    pub retrieval_base_url: String,
    #[serde(default)]
    pub retrieval_token: Option<String>,
    #[serde(default = "default_aux_timeout_secs")]
    pub retrieval_timeout_secs: u64,

    #[serde(default)]
    pub search_api_key: Option<String>,
    #[serde(default = "default_search_url")]
    pub search_base_url: String,
    #[serde(default = "default_aux_timeout_secs")]
    pub search_timeout_secs: u64,

    #[serde(default = "default_crawl_url")]
    pub crawl_base_url: String,
    #[serde(default = "default_crawl_timeout_secs")]
    pub crawl_timeout_secs: u64,

    #[serde(default = "default_max_standard_research")]
    pub max_standard_research: usize,
    #[serde(default = "default_max_deep_research")]
    pub max_deep_research: usize,

    #[serde(default = "default_tool_budget")]
    pub tool_budget: u32,
    #[serde(default = "default_research_tool_budget")]
    pub research_tool_budget: u32,
    #[serde(default = "default_autonomous_tool_budget")]
    pub autonomous_tool_budget: u32,
    #[serde(default = "default_max_tool_turns")]
    pub max_tool_turns: u32,

    #[serde(default = "default_standard_iterations")]
    pub standard_iterations: usize,
    #[serde(default = "default_deep_iterations")]
    pub deep_iterations: usize,
    #[serde(default = "default_retry_degrade_step")]
    pub retry_degrade_step: usize,

    #[serde(default = "default_duplicate_query_threshold")]
    pub duplicate_query_threshold: f32,

    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_models_bootstrap_interval_secs")]
    pub models_bootstrap_interval_secs: u64,
    #[serde(default = "default_models_steady_interval_secs")]
    pub models_steady_interval_secs: u64,

    #[serde(default = "default_classifier_confidence_threshold")]
    pub classifier_confidence_threshold: f32,

    #[serde(default = "default_tool_call_timeout_secs")]
    pub tool_call_timeout_secs: u64,
}

fn default_backend_url() -> String {
    "http://localhost:11434/v1".to_string()
}
fn default_backend_timeout_secs() -> u64 {
    300
}
fn default_retrieval_url() -> String {
    "http://localhost:8100".to_string()
}
fn default_search_url() -> String {
    "https://api.search.example/v1/search".to_string()
}
fn default_crawl_url() -> String {
    "http://localhost:8200".to_string()
}
fn default_aux_timeout_secs() -> u64 {
    30
}
fn default_crawl_timeout_secs() -> u64 {
    60
}
fn default_max_standard_research() -> usize {
    3
}
fn default_max_deep_research() -> usize {
    1
}
fn default_tool_budget() -> u32 {
    3
}
fn default_research_tool_budget() -> u32 {
    6
}
fn default_autonomous_tool_budget() -> u32 {
    4
}
fn default_max_tool_turns() -> u32 {
    8
}
fn default_standard_iterations() -> usize {
    2
}
fn default_deep_iterations() -> usize {
    4
}
fn default_retry_degrade_step() -> usize {
    2
}
fn default_duplicate_query_threshold() -> f32 {
    0.7
}
fn default_discovery_interval_secs() -> u64 {
    30
}
fn default_models_bootstrap_interval_secs() -> u64 {
    2
}
fn default_models_steady_interval_secs() -> u64 {
    10
}
fn default_classifier_confidence_threshold() -> f32 {
    0.91
}
fn default_tool_call_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpServerSetting {
    pub name: String,
    #[serde(flatten)]
    pub transport: gateway_core::mcp::McpTransport,
}

impl Default for AppConfig {
    fn default() -> Self {
        toml::from_str("").expect("all AppConfig fields have defaults")
    }
}

impl AppConfig {
    /// Loads `path` if given, else `./gateway.toml` if it exists, else defaults.
    pub async fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let default_path = std::path::PathBuf::from("./gateway.toml");
                default_path.exists().then_some(default_path)
            }
        };
        match candidate {
            Some(p) => {
                let text = tokio::fs::read_to_string(&p).await?;
                Ok(toml::from_str(&text)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }
    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_secs(self.retrieval_timeout_secs)
    }
    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }
    pub fn crawl_timeout(&self) -> Duration {
        Duration::from_secs(self.crawl_timeout_secs)
    }
    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_call_timeout_secs)
    }
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.max_standard_research, 3);
        assert_eq!(cfg.max_deep_research, 1);
        assert_eq!(cfg.tool_budget, 3);
        assert_eq!(cfg.research_tool_budget, 6);
        assert_eq!(cfg.autonomous_tool_budget, 4);
        assert_eq!(cfg.standard_iterations, 2);
        assert_eq!(cfg.deep_iterations, 4);
        assert_eq!(cfg.duplicate_query_threshold, 0.7);
        assert_eq!(cfg.classifier_confidence_threshold, 0.91);
    }

    #[test]
    fn partial_toml_fills_remaining_defaults() {
        let cfg: AppConfig = toml::from_str(r#"backend_base_url = "http://backend:9000/v1""#)
            .unwrap();
        assert_eq!(cfg.backend_base_url, "http://backend:9000/v1");
        assert_eq!(cfg.max_deep_research, 1);
    }
}
