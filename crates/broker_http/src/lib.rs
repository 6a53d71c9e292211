//! seks_broker_http
//!
//! The Broker HTTP Surface: an axum router exposing auth/verify, capability
//! listing, channel-token fetch, custom-secret fetch, scoped-token mint,
//! and the generic `/v1/proxy/{provider}/*` passthrough (the Proxy Engine).
//!
//! Every route requires `Authorization: Bearer <token>` except the proxy
//! and admin endpoints, which carry their own deny paths.

pub mod error;
pub mod handlers;
pub mod routing;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

pub use state::AppState;

const REQUEST_BODY_LIMIT_BYTES: usize = 10 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/auth/verify", post(handlers::auth_verify))
        .route("/v1/agent/capabilities", get(handlers::list_capabilities))
        .route("/v1/tokens/channels", get(handlers::tokens_channels))
        .route("/v1/secrets/custom/:key", get(handlers::secrets_custom))
        .route("/v1/tokens/scoped", post(handlers::mint_scoped_token))
        .route("/v1/proxy/:provider/*rest", axum::routing::any(handlers::proxy))
        .layer(RequestBodyLimitLayer::new(REQUEST_BODY_LIMIT_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Convenience constructor wiring a fresh in-memory/sled-backed state for
/// a given data directory and policy mode. Callers that need finer control
/// (custom routing table, existing audit appender) should build
/// `AppState` directly.
pub fn new_state(
    db: &sled::Db,
    audit_log_path: &std::path::Path,
    policy_mode: seks_policy::PolicyMode,
) -> Result<AppState, StartupError> {
    let capabilities = Arc::new(seks_store::CapabilityStore::open(db)?);
    let secrets = Arc::new(seks_store::SecretStore::open(db)?);
    let tokens = Arc::new(seks_store::TokenIssuer::open(db)?);
    let appender = seks_audit_log::AuditAppender::open(audit_log_path)?;

    Ok(AppState {
        capabilities,
        secrets,
        tokens,
        scrub: seks_scrub::new_handle(),
        routing: routing::RoutingHandle::new(routing::RoutingTable::with_builtins()),
        templates: Arc::new(seks_templates::TemplateRegistry::with_builtins()),
        policy_mode,
        audit: Arc::new(tokio::sync::Mutex::new(appender)),
        http_client: reqwest::Client::new(),
        upstream_permits: Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
        max_concurrent_per_provider: 8,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("store error: {0}")]
    Store(#[from] seks_store::StoreError),
    #[error("audit log error: {0}")]
    Audit(#[from] seks_audit_log::AuditLogError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        let state = new_state(&db, &dir.path().join("audit.jsonl"), seks_policy::PolicyMode::Moderate).unwrap();
        (dir, state)
    }

    #[tokio::test]
    async fn auth_verify_rejects_missing_bearer() {
        let (_dir, state) = test_state();
        let app = build_router(state);
        let resp = app
            .oneshot(Request::builder().method("POST").uri("/v1/auth/verify").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_verify_accepts_minted_agent_token() {
        let (_dir, state) = test_state();
        let token = state.tokens.mint_agent_token("agent-1").unwrap();
        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/auth/verify")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn proxy_without_bearer_is_unauthorized() {
        let (_dir, state) = test_state();
        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/proxy/anthropic/v1/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn garbage_bearer_token_is_forbidden_not_unauthorized() {
        let (_dir, state) = test_state();
        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/proxy/anthropic/v1/messages")
                    .header("authorization", "Bearer not-a-real-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn expired_scoped_token_is_forbidden() {
        let (_dir, state) = test_state();
        let agent_token = state.tokens.mint_agent_token("agent-1").unwrap();
        state
            .capabilities
            .grant(seks_store::CapabilityGrant::parse("agent-1", "anthropic/messages.create").unwrap())
            .unwrap();
        let (scoped_token, _expires_at) = state
            .tokens
            .mint_scoped(&agent_token, "run-1", vec!["anthropic/messages.create".to_string()], 0, &state.capabilities)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_secs(1));
        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/proxy/anthropic/v1/messages")
                    .header("authorization", format!("Bearer {scoped_token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn proxy_denies_ungranted_capability() {
        let (_dir, state) = test_state();
        let token = state.tokens.mint_agent_token("agent-1").unwrap();
        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/proxy/anthropic/v1/messages")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn s5_blocked_header_rejected_before_upstream_contact() {
        let (_dir, state) = test_state();
        let token = state.tokens.mint_agent_token("agent-1").unwrap();
        state
            .capabilities
            .grant(seks_store::CapabilityGrant::parse("agent-1", "anthropic/messages.create").unwrap())
            .unwrap();
        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/proxy/anthropic/v1/messages")
                    .header("authorization", format!("Bearer {token}"))
                    .header("x-api-key", "stolen")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn s4_scoped_token_mint_rejects_capabilities_beyond_grants() {
        let (_dir, state) = test_state();
        let token = state.tokens.mint_agent_token("agent-1").unwrap();
        state
            .capabilities
            .grant(seks_store::CapabilityGrant::parse("agent-1", "anthropic/messages.create").unwrap())
            .unwrap();
        state
            .capabilities
            .grant(seks_store::CapabilityGrant::parse("agent-1", "discord/messages.send").unwrap())
            .unwrap();
        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/tokens/scoped")
                    .header("authorization", format!("Bearer {token}"))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::to_vec(&serde_json::json!({
                            "skill_name": "demo",
                            "capabilities": ["openai/chat.completions"],
                            "ttl_seconds": 60
                        }))
                        .unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
