use crate::error::ApiError;
use crate::routing::{host_allowed, SecretInjection};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use seks_audit_spec::{AgentId, AuditEvent, CorrelationId, Deny, Outcome, ProxyCall, SecretAccess, TokenMint, TokenVerify};
use seks_store::{CapabilityGrant, VerifyOutcome};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_f64() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn new_correlation_id() -> CorrelationId {
    CorrelationId::new(uuid::Uuid::new_v4())
}

async fn audit(state: &AppState, event: AuditEvent) {
    let mut appender = state.audit.lock().await;
    if let Err(e) = appender.append(event) {
        tracing::error!(error = %e, "failed to append audit record");
    }
}

/// Credential-bearing headers an agent may never forward through the
/// proxy — these would let an agent smuggle its own auth past the
/// broker's injection step.
const BLOCKED_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "proxy-authorization",
    "x-api-key",
    "api-key",
    "x-auth-token",
    "x-access-token",
];

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
}

enum Auth {
    Agent { agent_id: String, raw_token: String },
    Scoped { agent_id: String, skill_run_id: String, capabilities: Vec<String>, raw_token: String },
}

impl Auth {
    fn agent_id(&self) -> &str {
        match self {
            Auth::Agent { agent_id, .. } => agent_id,
            Auth::Scoped { agent_id, .. } => agent_id,
        }
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Auth, ApiError> {
    // 401 only for a wholly absent bearer header; a token that is present but
    // rejected by the store is always a 403, whether unknown or expired.
    let token = extract_bearer(headers).ok_or(ApiError::Unauthorized)?;
    match state.tokens.verify(token) {
        Ok(VerifyOutcome::Agent { agent_id }) => Ok(Auth::Agent { agent_id, raw_token: token.to_string() }),
        Ok(VerifyOutcome::Scoped { agent_id, skill_run_id, capabilities, .. }) => {
            Ok(Auth::Scoped { agent_id, skill_run_id, capabilities, raw_token: token.to_string() })
        }
        Err(seks_store::StoreError::TokenExpired) => Err(ApiError::ExpiredScope),
        Err(_) => Err(ApiError::InvalidToken),
    }
}

// ----------------------------
// POST /v1/auth/verify
// ----------------------------

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_id: Option<String>,
}

pub async fn auth_verify(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let correlation_id = new_correlation_id();
    match authenticate(&state, &headers) {
        Ok(auth) => {
            let agent_id = auth.agent_id().to_string();
            let scoped = matches!(auth, Auth::Scoped { .. });
            audit(
                &state,
                AuditEvent::TokenVerify(TokenVerify {
                    schema_version: 1,
                    ts: now_f64(),
                    agent_id: Some(AgentId(agent_id.clone())),
                    scoped,
                    correlation_id,
                    outcome: Outcome::Allowed,
                }),
            )
            .await;
            Json(VerifyResponse { valid: true, agent_id: Some(agent_id) }).into_response()
        }
        Err(_) => {
            audit(
                &state,
                AuditEvent::TokenVerify(TokenVerify {
                    schema_version: 1,
                    ts: now_f64(),
                    agent_id: None,
                    scoped: false,
                    correlation_id,
                    outcome: Outcome::Denied,
                }),
            )
            .await;
            Json(VerifyResponse { valid: false, agent_id: None }).into_response()
        }
    }
}

// ----------------------------
// GET /v1/agent/capabilities
// ----------------------------

pub async fn list_capabilities(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<String>>, ApiError> {
    let auth = authenticate(&state, &headers)?;
    match auth {
        Auth::Agent { agent_id, .. } => {
            let grants = state
                .capabilities
                .list_for_agent(&agent_id)
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            Ok(Json(grants.iter().map(|g| g.as_capability_string()).collect()))
        }
        Auth::Scoped { capabilities, .. } => Ok(Json(capabilities)),
    }
}

// ----------------------------
// GET /v1/tokens/channels
//
// Open question resolution: unlike the generic proxy, channel adapters
// (discord, etc.) run as the agent's own process and need the raw bot
// token to open their own connection. Gated on a dedicated
// `<provider>/channel_token` capability, never on the general endpoint
// capability used by the proxy.
// ----------------------------

pub async fn tokens_channels(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<std::collections::HashMap<String, String>>, ApiError> {
    let auth = authenticate(&state, &headers)?;
    let agent_id = auth.agent_id().to_string();
    let grants = state
        .capabilities
        .list_for_agent(&agent_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let routing = state.routing.current();
    let mut out = std::collections::HashMap::new();
    for grant in &grants {
        let cap_str = grant.as_capability_string();
        let Some(provider) = cap_str.strip_suffix("/channel_token") else { continue };
        let Some(route) = routing.get(provider) else { continue };
        let fields = route.secret_fields();
        if let Some(field) = fields.first() {
            if let Ok(resolved) = state.secrets.resolve_fields(&agent_id, provider, &[field.clone()]) {
                if let Some(value) = resolved.get(field) {
                    out.insert(provider.to_string(), value.clone());
                }
            }
        }
    }
    Ok(Json(out))
}

// ----------------------------
// GET /v1/secrets/custom/{key}
// ----------------------------

#[derive(Debug, Serialize)]
pub struct CustomSecretResponse {
    value: String,
}

pub async fn secrets_custom(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<Json<CustomSecretResponse>, ApiError> {
    let auth = authenticate(&state, &headers)?;
    let agent_id = auth.agent_id().to_string();
    let capability_string = format!("custom/{key}");

    let granted = match &auth {
        Auth::Agent { .. } => state
            .capabilities
            .has_capability(&agent_id, &capability_string)
            .map_err(|e| ApiError::Internal(e.to_string()))?,
        Auth::Scoped { capabilities, .. } => capabilities.contains(&capability_string),
    };
    if !granted {
        audit_deny(&state, Some(&agent_id), &capability_string, "capability_missing", None).await;
        return Err(ApiError::CapabilityMissing);
    }

    let resolved = state
        .secrets
        .resolve_fields(&agent_id, "custom", &[key.clone()])
        .map_err(|_| ApiError::CapabilityMissing)?;
    let value = resolved.get(&key).cloned().ok_or(ApiError::CapabilityMissing)?;

    audit(
        &state,
        AuditEvent::SecretAccess(SecretAccess {
            schema_version: 1,
            ts: now_f64(),
            agent_id: AgentId(agent_id),
            provider: "custom".into(),
            field: key,
            value_hash: seks_common::sha256_bytes(value.as_bytes()),
            correlation_id: new_correlation_id(),
            outcome: Outcome::Allowed,
        }),
    )
    .await;

    Ok(Json(CustomSecretResponse { value }))
}

async fn audit_deny(state: &AppState, agent_id: Option<&str>, subject: &str, reason: &str, suggestion: Option<String>) {
    audit(
        state,
        AuditEvent::Deny(Deny {
            schema_version: 1,
            ts: now_f64(),
            agent_id: agent_id.map(|a| AgentId(a.to_string())),
            subject: subject.to_string(),
            reason: reason.to_string(),
            suggestion,
            correlation_id: new_correlation_id(),
        }),
    )
    .await;
}

// ----------------------------
// POST /v1/tokens/scoped
// ----------------------------

#[derive(Debug, Deserialize)]
pub struct ScopedTokenRequest {
    skill_name: String,
    capabilities: Vec<String>,
    ttl_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct ScopedTokenResponse {
    token: String,
    expires_at: u64,
}

pub async fn mint_scoped_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ScopedTokenRequest>,
) -> Result<Json<ScopedTokenResponse>, ApiError> {
    let auth = authenticate(&state, &headers)?;
    let Auth::Agent { agent_id, raw_token } = auth else {
        return Err(ApiError::Unauthorized);
    };

    let skill_run_id = uuid::Uuid::new_v4().to_string();
    match state.tokens.mint_scoped(
        &raw_token,
        &skill_run_id,
        body.capabilities.clone(),
        body.ttl_seconds,
        &state.capabilities,
    ) {
        Ok((token, expires_at)) => {
            audit(
                &state,
                AuditEvent::TokenMint(TokenMint {
                    schema_version: 1,
                    ts: now_f64(),
                    agent_id: AgentId(agent_id),
                    kind: "scoped".into(),
                    skill_run_id: Some(skill_run_id),
                    capability_count: body.capabilities.len(),
                    ttl_seconds: Some(body.ttl_seconds),
                    correlation_id: new_correlation_id(),
                    outcome: Outcome::Allowed,
                }),
            )
            .await;
            let _ = body.skill_name;
            Ok(Json(ScopedTokenResponse { token, expires_at }))
        }
        Err(seks_store::StoreError::CapabilitiesExceedGrants(_)) => {
            audit_deny(&state, Some(&agent_id), "tokens/scoped", "scope_exceeds_grants", None).await;
            Err(ApiError::ScopeExceedsGrants)
        }
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

// ----------------------------
// POST|GET|PUT|DELETE /v1/proxy/{provider}/*rest
// ----------------------------

const MAX_PROXY_BODY_BYTES: usize = 5 * 1024 * 1024;
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

fn header_value_is_clean(v: &str) -> bool {
    !v.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0)
}

pub async fn proxy(
    State(state): State<AppState>,
    Path((provider, rest)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if body.len() > MAX_PROXY_BODY_BYTES {
        return Err(ApiError::BadPath("request body too large".into()));
    }

    let auth = authenticate(&state, &headers)?;
    let agent_id = auth.agent_id().to_string();
    let correlation_id = new_correlation_id();

    let routing = state.routing.current();
    let route = routing.get(&provider).ok_or_else(|| ApiError::UnknownProvider(provider.clone()))?;

    let rest_path = format!("/{}", rest.trim_start_matches('/'));
    let capability = route
        .capability_for(&method, &rest_path)
        .ok_or(ApiError::CapabilityMissing)?;

    match &auth {
        Auth::Scoped { capabilities, .. } => {
            if !capabilities.contains(&capability) {
                audit_deny(&state, Some(&agent_id), &capability, "scope_violation", None).await;
                return Err(ApiError::ScopeViolation);
            }
        }
        Auth::Agent { .. } => {
            let granted = state
                .capabilities
                .has_capability(&agent_id, &capability)
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            if !granted {
                audit_deny(&state, Some(&agent_id), &capability, "capability_missing", None).await;
                return Err(ApiError::CapabilityMissing);
            }
        }
    }

    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if BLOCKED_HEADERS.contains(&lower.as_str()) {
            return Err(ApiError::BadHeader(format!("header {lower} is not forwardable")));
        }
        if let Ok(s) = value.to_str() {
            if !header_value_is_clean(s) {
                return Err(ApiError::BadHeader(format!("header {lower} contains control characters")));
            }
        }
    }

    let base_url = url::Url::parse(&route.base_url).map_err(|_| ApiError::Internal("malformed base_url".into()))?;
    let host = base_url.host_str().unwrap_or("");
    if !host_allowed(host, &route.host_allowlist) {
        return Err(ApiError::Internal(format!("routing table host {host} not in its own allowlist")));
    }
    let upstream_url = format!("{}{}", route.base_url.trim_end_matches('/'), rest_path);

    let fields = route.secret_fields();
    let resolved = state
        .secrets
        .resolve_fields(&agent_id, &provider, &fields)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let mut secret_hashes = Vec::new();
    for (field, value) in &resolved {
        state.scrub.register(&format!("{provider}_{field}"), value);
        secret_hashes.push(seks_common::sha256_bytes(value.as_bytes()));
    }

    let permit = state.permit_for(&provider);
    let _permit_guard = match permit.try_acquire_owned() {
        Ok(g) => g,
        Err(_) => return Err(ApiError::UpstreamSaturated),
    };

    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| ApiError::BadPath("unsupported method".into()))?;
    let mut builder = state.http_client.request(reqwest_method, &upstream_url).timeout(UPSTREAM_TIMEOUT);

    let mut json_body: Option<serde_json::Value> = if !body.is_empty() {
        serde_json::from_slice(&body).ok()
    } else {
        None
    };

    for (field, injection) in &route.injections {
        let Some(value) = resolved.get(field) else { continue };
        match injection {
            SecretInjection::Header(name) => {
                builder = builder.header(name, value);
            }
            SecretInjection::QueryParam(name) => {
                builder = builder.query(&[(name.as_str(), value.as_str())]);
            }
            SecretInjection::BodyField(name) => {
                let obj = json_body.get_or_insert_with(|| serde_json::json!({}));
                if let Some(map) = obj.as_object_mut() {
                    map.insert(name.clone(), serde_json::Value::String(value.clone()));
                }
            }
        }
    }

    if let Some(json) = &json_body {
        builder = builder.json(json);
    } else if !body.is_empty() {
        builder = builder.body(body.to_vec());
    }

    let request_bytes = body.len() as u64;

    let response = builder.send().await;
    let response = match response {
        Ok(r) => r,
        Err(e) if e.is_timeout() => {
            audit(
                &state,
                AuditEvent::ProxyCall(ProxyCall {
                    schema_version: 1,
                    ts: now_f64(),
                    agent_id: AgentId(agent_id),
                    provider: provider.clone(),
                    path: rest_path,
                    method: method.to_string(),
                    status: None,
                    request_bytes,
                    response_bytes: 0,
                    secret_hashes,
                    correlation_id,
                    outcome: Outcome::Error,
                    error: Some("upstream timed out".into()),
                }),
            )
            .await;
            return Err(ApiError::UpstreamTimeout);
        }
        Err(e) => {
            audit(
                &state,
                AuditEvent::ProxyCall(ProxyCall {
                    schema_version: 1,
                    ts: now_f64(),
                    agent_id: AgentId(agent_id),
                    provider: provider.clone(),
                    path: rest_path,
                    method: method.to_string(),
                    status: None,
                    request_bytes,
                    response_bytes: 0,
                    secret_hashes,
                    correlation_id,
                    outcome: Outcome::Error,
                    error: Some(state.scrub.scrub(&e.to_string())),
                }),
            )
            .await;
            return Err(ApiError::UpstreamError("upstream request failed".into()));
        }
    };

    let status = response.status();
    let resp_bytes = response.bytes().await.map_err(|e| ApiError::UpstreamError(e.to_string()))?;
    let response_bytes = resp_bytes.len() as u64;
    let scrubbed_body = state.scrub.scrub(&String::from_utf8_lossy(&resp_bytes));

    audit(
        &state,
        AuditEvent::ProxyCall(ProxyCall {
            schema_version: 1,
            ts: now_f64(),
            agent_id: AgentId(agent_id),
            provider,
            path: rest_path,
            method: method.to_string(),
            status: Some(status.as_u16()),
            request_bytes,
            response_bytes,
            secret_hashes,
            correlation_id,
            outcome: if status.is_success() { Outcome::Allowed } else { Outcome::Error },
            error: None,
        }),
    )
    .await;

    let status_code = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status_code, scrubbed_body))
}

pub fn grant_from_string(agent_id: &str, s: &str) -> Result<CapabilityGrant, ApiError> {
    CapabilityGrant::parse(agent_id, s).map_err(|e| ApiError::BadPath(e.to_string()))
}
