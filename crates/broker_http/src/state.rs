use crate::routing::RoutingHandle;
use seks_policy::PolicyMode;
use seks_scrub::ScrubHandle;
use seks_store::{CapabilityStore, SecretStore, TokenIssuer};
use seks_templates::TemplateRegistry;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

/// Shared broker state, cloned cheaply into every axum handler via
/// `State<AppState>`. Each field is its own handle/Arc rather than one
/// big lock, per the design notes' guidance to avoid a singleton god
/// object and keep tests deterministic.
#[derive(Clone)]
pub struct AppState {
    pub capabilities: Arc<CapabilityStore>,
    pub secrets: Arc<SecretStore>,
    pub tokens: Arc<TokenIssuer>,
    pub scrub: ScrubHandle,
    pub routing: RoutingHandle,
    pub templates: Arc<TemplateRegistry>,
    pub policy_mode: PolicyMode,
    pub audit: Arc<Mutex<seks_audit_log::AuditAppender>>,
    pub http_client: reqwest::Client,
    /// Bounded concurrency per upstream provider; saturation returns
    /// `503 upstream_saturated` instead of queueing unboundedly.
    pub upstream_permits: Arc<StdMutex<std::collections::HashMap<String, Arc<tokio::sync::Semaphore>>>>,
    pub max_concurrent_per_provider: usize,
}

impl AppState {
    pub fn permit_for(&self, provider: &str) -> Arc<tokio::sync::Semaphore> {
        let mut map = self.upstream_permits.lock().unwrap();
        map.entry(provider.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Semaphore::new(self.max_concurrent_per_provider)))
            .clone()
    }
}
