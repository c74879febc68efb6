//! `GET /health` (`spec.md` §6.1).

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Tracks the last-observed availability of each named downstream service.
/// Updated opportunistically by request handlers (e.g. a backend call
/// failure marks `llm_backend` unavailable until the next success).
#[derive(Default)]
pub struct HealthRegistry {
    services: RwLock<HashMap<String, ServiceHealth>>,
    critical: Vec<String>,
}

impl HealthRegistry {
    pub fn new(critical: Vec<String>) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            critical,
        }
    }

    pub async fn record(&self, name: &str, available: bool, detail: Option<String>) {
        self.services
            .write()
            .await
            .insert(name.to_string(), ServiceHealth { available, detail });
    }

    async fn snapshot(&self) -> HashMap<String, ServiceHealth> {
        self.services.read().await.clone()
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Status {
    Healthy,
    Degraded,
    Unhealthy,
}

pub async fn handle_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let services = state.health.snapshot().await;

    let mut status = Status::Healthy;
    for (name, health) in &services {
        if !health.available {
            if state.health.critical.iter().any(|c| c == name) {
                status = Status::Unhealthy;
                break;
            } else if status == Status::Healthy {
                status = Status::Degraded;
            }
        }
    }

    Json(serde_json::json!({
        "status": status,
        "services": services,
    }))
}

impl Clone for ServiceHealth {
    fn clone(&self) -> Self {
        Self {
            available: self.available,
            detail: self.detail.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthy_when_all_services_available() {
        let registry = HealthRegistry::new(vec!["llm_backend".to_string()]);
        registry.record("llm_backend", true, None).await;
        let snapshot = registry.snapshot().await;
        assert!(snapshot.get("llm_backend").unwrap().available);
    }

    #[tokio::test]
    async fn critical_failure_is_tracked_separately_from_non_critical() {
        let registry = HealthRegistry::new(vec!["llm_backend".to_string()]);
        registry.record("llm_backend", true, None).await;
        registry.record("search", false, Some("timeout".into())).await;
        let snapshot = registry.snapshot().await;
        assert!(!snapshot.get("search").unwrap().available);
        assert!(snapshot.get("llm_backend").unwrap().available);
    }
}
