//! The services context: everything a handler needs, constructed once at
//! startup and passed in via `axum::extract::State`, per the explicit
//! dependency-injection design note (`spec.md` §9) replacing singleton
//! globals.

use std::sync::Arc;

use gateway_core::BackendClient;

use crate::admission::AdmissionController;
use crate::clients::{CrawlClient, RetrievalClient, SearchClient, ToolClient};
use crate::config::AppConfig;
use crate::discovery::ToolDiscovery;
use crate::health::HealthRegistry;
use crate::models::ModelsCache;
use crate::router::ModeRouter;

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub backend: BackendClient,
    pub router: ModeRouter,
    pub admission: AdmissionController,
    pub discovery: Arc<ToolDiscovery>,
    pub search: SearchClient,
    pub retrieval: RetrievalClient,
    pub crawl: CrawlClient,
    pub health: HealthRegistry,
    pub models: Arc<ModelsCache>,
    pub auth_key: Option<String>,
}

impl AppState {
    pub fn tool_client(&self) -> ToolClient {
        ToolClient::new(self.discovery.current(), self.config.tool_call_timeout())
    }
}
