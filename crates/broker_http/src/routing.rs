//! Provider routing table: provider -> upstream base URL, which capability
//! each inbound (method, path-prefix) pair implies, and where each
//! required secret field gets injected. A DAG loaded at startup and
//! replaced atomically on reload (never mutated in place).

use axum::http::Method;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
pub enum SecretInjection {
    Header(String),
    QueryParam(String),
    BodyField(String),
}

#[derive(Debug, Clone)]
pub struct EndpointMapping {
    pub method: Method,
    pub path_prefix: String,
    /// Capability suffix after `provider/`, e.g. `messages.create`.
    pub capability: String,
}

#[derive(Debug, Clone)]
pub struct ProviderRoute {
    pub provider: String,
    pub base_url: String,
    /// Hosts this provider is allowed to resolve to. Checked even though
    /// `base_url` is fixed at load time — defence in depth against a
    /// corrupted or mis-templated routing table.
    pub host_allowlist: Vec<String>,
    /// (field_name, where it goes), e.g. `("api_key", Header("x-api-key"))`.
    pub injections: Vec<(String, SecretInjection)>,
    pub endpoints: Vec<EndpointMapping>,
}

impl ProviderRoute {
    pub fn secret_fields(&self) -> Vec<String> {
        self.injections.iter().map(|(f, _)| f.clone()).collect()
    }

    /// Capability string implied by an inbound method + upstream path, or
    /// `None` if no endpoint mapping matches (callers should deny).
    pub fn capability_for(&self, method: &Method, rest_path: &str) -> Option<String> {
        self.endpoints
            .iter()
            .find(|e| &e.method == method && rest_path.starts_with(&e.path_prefix))
            .map(|e| format!("{}/{}", self.provider, e.capability))
    }
}

#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<String, ProviderRoute>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    pub fn insert(&mut self, route: ProviderRoute) {
        self.routes.insert(route.provider.clone(), route);
    }

    pub fn get(&self, provider: &str) -> Option<&ProviderRoute> {
        self.routes.get(provider)
    }

    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.insert(ProviderRoute {
            provider: "anthropic".into(),
            base_url: "https://api.anthropic.com".into(),
            host_allowlist: vec!["api.anthropic.com".into()],
            injections: vec![("api_key".into(), SecretInjection::Header("x-api-key".into()))],
            endpoints: vec![EndpointMapping {
                method: Method::POST,
                path_prefix: "/v1/messages".into(),
                capability: "messages.create".into(),
            }],
        });
        table.insert(ProviderRoute {
            provider: "openai".into(),
            base_url: "https://api.openai.com".into(),
            host_allowlist: vec!["api.openai.com".into()],
            injections: vec![
                ("api_key".into(), SecretInjection::Header("authorization".into())),
                ("org_id".into(), SecretInjection::Header("openai-organization".into())),
            ],
            endpoints: vec![EndpointMapping {
                method: Method::POST,
                path_prefix: "/v1/chat/completions".into(),
                capability: "chat.completions".into(),
            }],
        });
        table.insert(ProviderRoute {
            provider: "discord".into(),
            base_url: "https://discord.com/api".into(),
            host_allowlist: vec!["discord.com".into()],
            injections: vec![("bot_token".into(), SecretInjection::Header("authorization".into()))],
            endpoints: vec![EndpointMapping {
                method: Method::POST,
                path_prefix: "/channels".into(),
                capability: "messages.send".into(),
            }],
        });
        table
    }
}

/// Handle threaded through request context, swapped atomically on reload.
#[derive(Clone)]
pub struct RoutingHandle(Arc<RwLock<Arc<RoutingTable>>>);

impl RoutingHandle {
    pub fn new(table: RoutingTable) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(table))))
    }

    pub fn current(&self) -> Arc<RoutingTable> {
        self.0.read().unwrap().clone()
    }

    pub fn reload(&self, table: RoutingTable) {
        *self.0.write().unwrap() = Arc::new(table);
    }
}

/// Single-level wildcard host match: `*.foo.com` matches `bar.foo.com` but
/// not `baz.bar.foo.com`; the apex must be listed explicitly to match too.
pub fn host_allowed(host: &str, allow: &[String]) -> bool {
    allow.iter().any(|pattern| {
        if let Some(suffix) = pattern.strip_prefix("*.") {
            host.strip_suffix(suffix)
                .map(|prefix| prefix.ends_with('.') && prefix.len() > 1 && !prefix[..prefix.len() - 1].contains('.'))
                .unwrap_or(false)
        } else {
            host.eq_ignore_ascii_case(pattern)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_anthropic_route_resolves() {
        let table = RoutingTable::with_builtins();
        let route = table.get("anthropic").unwrap();
        assert_eq!(route.base_url, "https://api.anthropic.com");
        assert_eq!(route.secret_fields(), vec!["api_key".to_string()]);
        assert_eq!(
            route.capability_for(&Method::POST, "/v1/messages"),
            Some("anthropic/messages.create".to_string())
        );
    }

    #[test]
    fn unmapped_endpoint_has_no_capability() {
        let table = RoutingTable::with_builtins();
        let route = table.get("anthropic").unwrap();
        assert_eq!(route.capability_for(&Method::GET, "/v1/models"), None);
    }

    #[test]
    fn unknown_provider_has_no_route() {
        let table = RoutingTable::with_builtins();
        assert!(table.get("nope").is_none());
    }

    #[test]
    fn reload_replaces_the_table_atomically() {
        let handle = RoutingHandle::new(RoutingTable::with_builtins());
        assert!(handle.current().get("anthropic").is_some());
        handle.reload(RoutingTable::new());
        assert!(handle.current().get("anthropic").is_none());
    }

    #[test]
    fn host_allowlist_single_level_wildcard() {
        assert!(host_allowed("api.foo.com", &["*.foo.com".to_string()]));
        assert!(!host_allowed("nested.api.foo.com", &["*.foo.com".to_string()]));
        assert!(!host_allowed("foo.com", &["*.foo.com".to_string()]));
    }
}
