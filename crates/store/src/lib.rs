//! seks_store
//!
//! Persistent capability and secret stores, plus the token issuer. Backed by
//! `sled` so state survives broker restarts without pulling in a full
//! database server for what is, per agent, a handful of small records.
//!
//! Agent tokens are stored hashed; only the sha256 digest ever touches
//! disk. Scoped tokens are short-lived by construction and are kept
//! in-memory only.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const DEFAULT_MAX_SCOPED_TTL_SECS: u64 = 15 * 60;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("secret not found: {0}/{1}")]
    SecretNotFound(String, String),
    #[error("capability string is malformed: {0}")]
    MalformedCapability(String),
    #[error("token invalid or unknown")]
    InvalidToken,
    #[error("token has expired")]
    TokenExpired,
    #[error("requested capabilities exceed agent grants: {0:?}")]
    CapabilitiesExceedGrants(Vec<String>),
    #[error("ttl {requested} exceeds configured maximum {max}")]
    TtlExceedsMaximum { requested: u64, max: u64 },
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

pub fn sha256_hex(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

fn random_token(byte_len: usize) -> String {
    let mut bytes = vec![0u8; byte_len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ----------------------------
// Capability model
// ----------------------------

/// Tagged replacement for the duck-typed capability strings in the source
/// system: `Api` for provider endpoints, `Custom` for free-form secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Api { endpoint: String },
    Custom { key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityGrant {
    pub agent_id: String,
    pub provider: String,
    pub capability: Capability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_data: Option<serde_json::Value>,
}

impl CapabilityGrant {
    /// Canonical string form: `provider/endpoint` or `custom/key`.
    pub fn as_capability_string(&self) -> String {
        match &self.capability {
            Capability::Api { endpoint } => format!("{}/{endpoint}", self.provider),
            Capability::Custom { key } => format!("custom/{key}"),
        }
    }

    /// Parse a capability string of the form `provider/endpoint` or
    /// `custom/key` into a grant for `agent_id`.
    pub fn parse(agent_id: impl Into<String>, s: &str) -> Result<Self, StoreError> {
        let (provider, rest) = s
            .split_once('/')
            .ok_or_else(|| StoreError::MalformedCapability(s.to_string()))?;
        if rest.is_empty() {
            return Err(StoreError::MalformedCapability(s.to_string()));
        }
        let capability = if provider == "custom" {
            Capability::Custom { key: rest.to_string() }
        } else {
            Capability::Api { endpoint: rest.to_string() }
        };
        Ok(Self { agent_id: agent_id.into(), provider: provider.to_string(), capability, scope_data: None })
    }
}

// ----------------------------
// Capability Store
// ----------------------------

pub struct CapabilityStore {
    tree: sled::Tree,
}

impl CapabilityStore {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self { tree: db.open_tree("capability_grants")? })
    }

    pub fn grant(&self, grant: CapabilityGrant) -> Result<(), StoreError> {
        let mut grants = self.list_for_agent(&grant.agent_id)?;
        if !grants.iter().any(|g| g.as_capability_string() == grant.as_capability_string()) {
            grants.push(grant.clone());
        }
        let bytes = serde_json::to_vec(&grants)?;
        self.tree.insert(grant.agent_id.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn revoke(&self, agent_id: &str, capability_string: &str) -> Result<(), StoreError> {
        let mut grants = self.list_for_agent(agent_id)?;
        grants.retain(|g| g.as_capability_string() != capability_string);
        let bytes = serde_json::to_vec(&grants)?;
        self.tree.insert(agent_id.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn revoke_agent(&self, agent_id: &str) -> Result<(), StoreError> {
        self.tree.remove(agent_id.as_bytes())?;
        Ok(())
    }

    pub fn list_for_agent(&self, agent_id: &str) -> Result<Vec<CapabilityGrant>, StoreError> {
        match self.tree.get(agent_id.as_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn has_capability(&self, agent_id: &str, capability_string: &str) -> Result<bool, StoreError> {
        Ok(self
            .list_for_agent(agent_id)?
            .iter()
            .any(|g| g.as_capability_string() == capability_string))
    }
}

// ----------------------------
// Secret Store
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretScope {
    AccountGlobal,
    AgentScoped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub provider: String,
    pub field: String,
    pub value: String,
    pub scope: SecretScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

fn secret_key(provider: &str, field: &str, scope: SecretScope, agent_id: Option<&str>) -> String {
    match scope {
        SecretScope::AccountGlobal => format!("{provider}:{field}:global"),
        SecretScope::AgentScoped => format!("{provider}:{field}:agent:{}", agent_id.unwrap_or("")),
    }
}

pub struct SecretStore {
    tree: sled::Tree,
}

impl SecretStore {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self { tree: db.open_tree("secrets")? })
    }

    pub fn put(&self, secret: Secret) -> Result<(), StoreError> {
        let key = secret_key(&secret.provider, &secret.field, secret.scope, secret.agent_id.as_deref());
        let bytes = serde_json::to_vec(&secret)?;
        self.tree.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn delete(&self, provider: &str, field: &str, scope: SecretScope, agent_id: Option<&str>) -> Result<(), StoreError> {
        let key = secret_key(provider, field, scope, agent_id);
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    /// Resolve the given field names for `provider`, preferring an
    /// agent-scoped secret over an account-global one on collision. Never
    /// called from a code path that returns values to agents directly;
    /// callers in the proxy engine inject them into upstream requests only.
    pub fn resolve_fields(
        &self,
        agent_id: &str,
        provider: &str,
        fields: &[String],
    ) -> Result<HashMap<String, String>, StoreError> {
        let mut out = HashMap::with_capacity(fields.len());
        for field in fields {
            let agent_key = secret_key(provider, field, SecretScope::AgentScoped, Some(agent_id));
            let global_key = secret_key(provider, field, SecretScope::AccountGlobal, None);

            let found = self
                .tree
                .get(agent_key.as_bytes())?
                .or(self.tree.get(global_key.as_bytes())?);

            match found {
                Some(bytes) => {
                    let secret: Secret = serde_json::from_slice(&bytes)?;
                    out.insert(field.clone(), secret.value);
                }
                None => return Err(StoreError::SecretNotFound(provider.to_string(), field.clone())),
            }
        }
        Ok(out)
    }
}

// ----------------------------
// Token Issuer
// ----------------------------

#[derive(Debug, Clone)]
struct ScopedTokenRecord {
    agent_id: String,
    skill_run_id: String,
    capabilities: Vec<String>,
    issued_at: u64,
    expires_at: u64,
}

#[derive(Debug, Clone)]
pub enum VerifyOutcome {
    Agent { agent_id: String },
    Scoped { agent_id: String, skill_run_id: String, capabilities: Vec<String>, ttl_remaining: u64 },
}

pub struct TokenIssuer {
    agent_tokens: sled::Tree, // sha256(token) -> agent_id
    scoped_tokens: RwLock<HashMap<String, ScopedTokenRecord>>, // sha256(token) -> record
    max_scoped_ttl_secs: u64,
}

impl TokenIssuer {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            agent_tokens: db.open_tree("agent_tokens")?,
            scoped_tokens: RwLock::new(HashMap::new()),
            max_scoped_ttl_secs: DEFAULT_MAX_SCOPED_TTL_SECS,
        })
    }

    pub fn with_max_scoped_ttl(mut self, ttl_secs: u64) -> Self {
        self.max_scoped_ttl_secs = ttl_secs;
        self
    }

    /// Mints a new opaque high-entropy agent token. The raw value is
    /// returned exactly once; only its hash is persisted.
    pub fn mint_agent_token(&self, agent_id: &str) -> Result<String, StoreError> {
        let token = random_token(32);
        let hash = sha256_hex(&token);
        self.agent_tokens.insert(hash.as_bytes(), agent_id.as_bytes())?;
        Ok(token)
    }

    pub fn revoke_agent_token(&self, token: &str) -> Result<(), StoreError> {
        let hash = sha256_hex(token);
        self.agent_tokens.remove(hash.as_bytes())?;
        Ok(())
    }

    /// Looks up a bearer token. Scoped tokens are checked first since they
    /// are the hot path for skill-run traffic; expiry is re-checked on
    /// every call, not only at mint, per the ordering guarantee that a
    /// scoped token's TTL is enforced on every use.
    pub fn verify(&self, token: &str) -> Result<VerifyOutcome, StoreError> {
        let hash = sha256_hex(token);

        {
            let scoped = self.scoped_tokens.read().unwrap();
            if let Some(rec) = scoped.get(&hash) {
                let now = now_secs();
                if now >= rec.expires_at {
                    return Err(StoreError::TokenExpired);
                }
                return Ok(VerifyOutcome::Scoped {
                    agent_id: rec.agent_id.clone(),
                    skill_run_id: rec.skill_run_id.clone(),
                    capabilities: rec.capabilities.clone(),
                    ttl_remaining: rec.expires_at - now,
                });
            }
        }

        match self.agent_tokens.get(hash.as_bytes())? {
            Some(bytes) => Ok(VerifyOutcome::Agent { agent_id: String::from_utf8_lossy(&bytes).to_string() }),
            None => Err(StoreError::InvalidToken),
        }
    }

    /// Mints a scoped token bound to a skill run. `capabilities` must be a
    /// subset of the agent's current grants; `ttl_seconds` is clamped to
    /// the configured maximum, never extended past it.
    pub fn mint_scoped(
        &self,
        agent_token: &str,
        skill_run_id: &str,
        capabilities: Vec<String>,
        ttl_seconds: u64,
        capability_store: &CapabilityStore,
    ) -> Result<(String, u64), StoreError> {
        let agent_id = match self.verify(agent_token)? {
            VerifyOutcome::Agent { agent_id } => agent_id,
            VerifyOutcome::Scoped { .. } => return Err(StoreError::InvalidToken),
        };

        if ttl_seconds > self.max_scoped_ttl_secs {
            return Err(StoreError::TtlExceedsMaximum { requested: ttl_seconds, max: self.max_scoped_ttl_secs });
        }

        let grants = capability_store.list_for_agent(&agent_id)?;
        let granted: Vec<String> = grants.iter().map(|g| g.as_capability_string()).collect();
        let exceeded: Vec<String> =
            capabilities.iter().filter(|c| !granted.contains(c)).cloned().collect();
        if !exceeded.is_empty() {
            return Err(StoreError::CapabilitiesExceedGrants(exceeded));
        }

        let token = random_token(24);
        let hash = sha256_hex(&token);
        let issued_at = now_secs();
        let expires_at = issued_at + ttl_seconds;
        self.scoped_tokens.write().unwrap().insert(
            hash,
            ScopedTokenRecord {
                agent_id,
                skill_run_id: skill_run_id.to_string(),
                capabilities,
                issued_at,
                expires_at,
            },
        );
        Ok((token, expires_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_db() -> (TempDir, sled::Db) {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (dir, db)
    }

    #[test]
    fn capability_grant_round_trips_through_strings() {
        let g = CapabilityGrant::parse("agent-1", "anthropic/messages.create").unwrap();
        assert_eq!(g.as_capability_string(), "anthropic/messages.create");
        let custom = CapabilityGrant::parse("agent-1", "custom/my-secret").unwrap();
        assert_eq!(custom.as_capability_string(), "custom/my-secret");
    }

    #[test]
    fn capability_store_grants_and_lists() {
        let (_dir, db) = open_db();
        let store = CapabilityStore::open(&db).unwrap();
        store.grant(CapabilityGrant::parse("agent-1", "anthropic/messages.create").unwrap()).unwrap();
        store.grant(CapabilityGrant::parse("agent-1", "discord/messages.send").unwrap()).unwrap();
        let grants = store.list_for_agent("agent-1").unwrap();
        assert_eq!(grants.len(), 2);
    }

    #[test]
    fn secret_store_prefers_agent_scoped_over_global() {
        let (_dir, db) = open_db();
        let store = SecretStore::open(&db).unwrap();
        store
            .put(Secret {
                provider: "anthropic".into(),
                field: "api_key".into(),
                value: "global-value".into(),
                scope: SecretScope::AccountGlobal,
                agent_id: None,
            })
            .unwrap();
        store
            .put(Secret {
                provider: "anthropic".into(),
                field: "api_key".into(),
                value: "agent-value".into(),
                scope: SecretScope::AgentScoped,
                agent_id: Some("agent-1".into()),
            })
            .unwrap();

        let resolved = store.resolve_fields("agent-1", "anthropic", &["api_key".to_string()]).unwrap();
        assert_eq!(resolved.get("api_key").unwrap(), "agent-value");

        let resolved_other = store.resolve_fields("agent-2", "anthropic", &["api_key".to_string()]).unwrap();
        assert_eq!(resolved_other.get("api_key").unwrap(), "global-value");
    }

    #[test]
    fn missing_secret_field_errors() {
        let (_dir, db) = open_db();
        let store = SecretStore::open(&db).unwrap();
        let err = store.resolve_fields("agent-1", "anthropic", &["api_key".to_string()]).unwrap_err();
        assert!(matches!(err, StoreError::SecretNotFound(_, _)));
    }

    #[test]
    fn agent_token_mints_and_verifies() {
        let (_dir, db) = open_db();
        let issuer = TokenIssuer::open(&db).unwrap();
        let token = issuer.mint_agent_token("agent-1").unwrap();
        match issuer.verify(&token).unwrap() {
            VerifyOutcome::Agent { agent_id } => assert_eq!(agent_id, "agent-1"),
            _ => panic!("expected agent token"),
        }
        assert!(issuer.verify("garbage").is_err());
    }

    #[test]
    fn s4_scoped_token_cannot_exceed_grants() {
        let (_dir, db) = open_db();
        let issuer = TokenIssuer::open(&db).unwrap();
        let caps = CapabilityStore::open(&db).unwrap();
        caps.grant(CapabilityGrant::parse("agent-1", "anthropic/messages.create").unwrap()).unwrap();
        caps.grant(CapabilityGrant::parse("agent-1", "discord/messages.send").unwrap()).unwrap();

        let agent_token = issuer.mint_agent_token("agent-1").unwrap();
        let err = issuer
            .mint_scoped(&agent_token, "run-1", vec!["openai/chat.completions".to_string()], 60, &caps)
            .unwrap_err();
        assert!(matches!(err, StoreError::CapabilitiesExceedGrants(_)));
    }

    #[test]
    fn scoped_token_ttl_is_bounded_and_checked_on_every_use() {
        let (_dir, db) = open_db();
        let issuer = TokenIssuer::open(&db).unwrap().with_max_scoped_ttl(1);
        let caps = CapabilityStore::open(&db).unwrap();
        caps.grant(CapabilityGrant::parse("agent-1", "anthropic/messages.create").unwrap()).unwrap();
        let agent_token = issuer.mint_agent_token("agent-1").unwrap();

        let err = issuer
            .mint_scoped(&agent_token, "run-1", vec!["anthropic/messages.create".to_string()], 10, &caps)
            .unwrap_err();
        assert!(matches!(err, StoreError::TtlExceedsMaximum { .. }));

        let (scoped, _expires) = issuer
            .mint_scoped(&agent_token, "run-1", vec!["anthropic/messages.create".to_string()], 1, &caps)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(issuer.verify(&scoped).is_err());
    }
}
