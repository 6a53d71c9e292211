//! seks_audit_spec
//!
//! Strongly-typed audit events for the credential broker, exec surface, and
//! skill runner. Every capability check, secret access, exec, template
//! invocation, scoped-token mint/verify, and policy denial produces one of
//! these. Records are written by `seks_audit_log` and are append-only.
//!
//! NOTE: schema_version increments are per-event, not global.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AgentId(pub String);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allowed,
    Denied,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretAccess {
    pub schema_version: u8,
    pub ts: f64,
    pub agent_id: AgentId,
    pub provider: String,
    pub field: String,
    /// sha256:... of the secret value, never the value itself.
    pub value_hash: String,
    pub correlation_id: CorrelationId,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyCall {
    pub schema_version: u8,
    pub ts: f64,
    pub agent_id: AgentId,
    pub provider: String,
    pub path: String,
    pub method: String,
    pub status: Option<u16>,
    pub request_bytes: u64,
    pub response_bytes: u64,
    /// sha256:... of every secret field injected for this call.
    pub secret_hashes: Vec<String>,
    pub correlation_id: CorrelationId,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecEvent {
    pub schema_version: u8,
    pub ts: f64,
    pub agent_id: AgentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// sha256:... of the resolved argv, never the argv itself (argv may
    /// contain operator-sensitive paths).
    pub argv_hash: String,
    pub classification: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub correlation_id: CorrelationId,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRun {
    pub schema_version: u8,
    pub ts: f64,
    pub agent_id: AgentId,
    pub skill_name: String,
    pub mode: String,
    pub degraded: bool,
    pub duration_ms: u64,
    pub correlation_id: CorrelationId,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMint {
    pub schema_version: u8,
    pub ts: f64,
    pub agent_id: AgentId,
    pub kind: String, // "agent" | "scoped"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill_run_id: Option<String>,
    pub capability_count: usize,
    pub ttl_seconds: Option<u64>,
    pub correlation_id: CorrelationId,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenVerify {
    pub schema_version: u8,
    pub ts: f64,
    pub agent_id: Option<AgentId>,
    pub scoped: bool,
    pub correlation_id: CorrelationId,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deny {
    pub schema_version: u8,
    pub ts: f64,
    pub agent_id: Option<AgentId>,
    pub subject: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubErrorEvent {
    pub schema_version: u8,
    pub ts: f64,
    pub correlation_id: CorrelationId,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditEvent {
    SecretAccess(SecretAccess),
    ProxyCall(ProxyCall),
    Exec(ExecEvent),
    SkillRun(SkillRun),
    TokenMint(TokenMint),
    TokenVerify(TokenVerify),
    Deny(Deny),
    ScrubError(ScrubErrorEvent),
}
