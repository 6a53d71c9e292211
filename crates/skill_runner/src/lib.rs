//! seks_skill_runner
//!
//! Runs a skill either locally (no network, no secrets, a deterministic
//! descriptor) or inside a container wired to the broker through a
//! scoped token. The broker mints that token; this crate never talks to
//! the secret store directly.

pub mod container;
pub mod manifest;

use container::{ContainerBackend, ContainerError};
use manifest::SkillManifest;
use seks_audit_spec::{AgentId, AuditEvent, CorrelationId, Outcome, SkillRun};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Local,
    Container,
}

impl RunMode {
    fn as_str(&self) -> &'static str {
        match self {
            RunMode::Local => "local",
            RunMode::Container => "container",
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("broker request failed: {0}")]
    Broker(#[from] reqwest::Error),
    #[error("container error: {0}")]
    Container(#[from] ContainerError),
    #[error("broker denied scoped token mint: {0}")]
    ScopedTokenDenied(String),
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub degraded: bool,
    pub capabilities_used: Vec<String>,
}

#[derive(serde::Serialize)]
struct ScopedTokenRequest<'a> {
    skill_name: &'a str,
    capabilities: &'a [String],
    ttl_seconds: u64,
}

#[derive(serde::Deserialize)]
struct ScopedTokenResponse {
    token: String,
}

fn now_unix_f64() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

pub struct SkillRunner {
    http_client: reqwest::Client,
    broker_url: String,
    backend: Arc<dyn ContainerBackend>,
    audit: Arc<tokio::sync::Mutex<seks_audit_log::AuditAppender>>,
}

impl SkillRunner {
    pub fn new(
        broker_url: String,
        backend: Arc<dyn ContainerBackend>,
        audit: Arc<tokio::sync::Mutex<seks_audit_log::AuditAppender>>,
    ) -> Self {
        Self { http_client: reqwest::Client::new(), broker_url, backend, audit }
    }

    async fn audit_event(&self, event: AuditEvent) {
        let mut appender = self.audit.lock().await;
        if let Err(err) = appender.append(event) {
            tracing::error!(%err, "failed to append skill run audit record");
        }
    }

    /// Runs `manifest` in `mode` against `task`. `agent_token` must be the
    /// agent's own bearer token; container mode exchanges it for a scoped
    /// token bounded to `manifest.capabilities` before the container ever
    /// starts.
    pub async fn run(
        &self,
        manifest: &SkillManifest,
        task: &str,
        agent_id: &str,
        agent_token: &str,
        mode: RunMode,
    ) -> RunOutcome {
        let started = Instant::now();
        let correlation_id = CorrelationId::new(Uuid::new_v4());

        let outcome = match mode {
            RunMode::Local => self.run_local(manifest, task),
            RunMode::Container => self.run_container(manifest, task, agent_token).await,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let (ok, error, degraded, caps_used) = match &outcome {
            Ok(o) => (o.ok, o.error.clone(), o.degraded, o.capabilities_used.clone()),
            Err(e) => (false, Some(e.to_string()), false, Vec::new()),
        };

        self.audit_event(AuditEvent::SkillRun(SkillRun {
            schema_version: 1,
            ts: now_unix_f64(),
            agent_id: AgentId(agent_id.to_string()),
            skill_name: manifest.name.clone(),
            mode: mode.as_str().to_string(),
            degraded,
            duration_ms,
            correlation_id,
            outcome: if ok { Outcome::Allowed } else { Outcome::Error },
            error: error.clone(),
        }))
        .await;

        match outcome {
            Ok(mut o) => {
                o.duration_ms = duration_ms;
                o
            }
            Err(e) => RunOutcome {
                ok: false,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(e.to_string()),
                duration_ms,
                degraded: false,
                capabilities_used: caps_used,
            },
        }
    }

    /// Local mode never touches the network, never spawns a container, and
    /// never sees a secret. It is used for dry runs and for skills whose
    /// manifest carries no `container` section at all.
    fn run_local(&self, manifest: &SkillManifest, task: &str) -> Result<RunOutcome, RunnerError> {
        Ok(RunOutcome {
            ok: true,
            stdout: format!("skill {} would run task: {}", manifest.name, task),
            stderr: String::new(),
            error: None,
            duration_ms: 0,
            degraded: false,
            capabilities_used: Vec::new(),
        })
    }

    async fn mint_scoped_token(
        &self,
        manifest: &SkillManifest,
        agent_token: &str,
    ) -> Result<String, RunnerError> {
        let req = ScopedTokenRequest {
            skill_name: &manifest.name,
            capabilities: &manifest.capabilities,
            ttl_seconds: manifest.effective_timeout().as_secs().max(60),
        };
        let resp = self
            .http_client
            .post(format!("{}/v1/tokens/scoped", self.broker_url))
            .bearer_auth(agent_token)
            .json(&req)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RunnerError::ScopedTokenDenied(format!("{status}: {body}")));
        }
        let parsed: ScopedTokenResponse = resp.json().await?;
        Ok(parsed.token)
    }

    async fn run_container(
        &self,
        manifest: &SkillManifest,
        task: &str,
        agent_token: &str,
    ) -> Result<RunOutcome, RunnerError> {
        let spec = manifest.container.clone().unwrap_or_default();
        let timeout = manifest.effective_timeout();

        let (scoped_token, degraded) = match self.mint_scoped_token(manifest, agent_token).await {
            Ok(token) => (Some(token), false),
            Err(err) => {
                tracing::warn!(%err, skill = %manifest.name, "scoped token mint failed, running degraded");
                (None, true)
            }
        };

        let network_name = format!("seks-skill-{}", manifest.name);
        if !self.backend.network_exists(&network_name).await? {
            self.backend.network_create(&network_name, spec.network == manifest::NetworkPolicy::BrokerOnly).await?;
        }

        let mut env: HashMap<String, String> = spec.env.clone();
        env.insert("SEKS_BROKER_URL".to_string(), self.broker_url.clone());
        env.insert("SEKS_SKILL_NAME".to_string(), manifest.name.clone());
        env.insert("SEKS_SKILL_TASK".to_string(), task.to_string());
        if let Some(token) = &scoped_token {
            env.insert("SEKS_AGENT_TOKEN".to_string(), token.clone());
        }

        let container_name = format!("seks-run-{}", Uuid::new_v4());
        let run = self
            .backend
            .run_container(
                &spec.image,
                &container_name,
                &network_name,
                &spec.memory_limit,
                &spec.cpu_limit,
                &env,
                timeout,
            )
            .await?;

        if run.timed_out {
            self.backend.kill(&container_name).await.ok();
        }

        Ok(RunOutcome {
            ok: run.exit_code == Some(0) && !run.timed_out,
            stdout: run.stdout,
            stderr: run.stderr,
            error: if run.timed_out { Some("skill run exceeded its timeout".to_string()) } else { None },
            duration_ms: 0,
            degraded,
            capabilities_used: if degraded { Vec::new() } else { manifest.capabilities.clone() },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use container::{ContainerRunOutcome, FakeContainerBackend};
    use manifest::{ContainerSpec, NetworkPolicy};

    fn test_manifest() -> SkillManifest {
        SkillManifest {
            version: 1,
            name: "fetch-weather".to_string(),
            description: "fetches weather".to_string(),
            emoji: None,
            author: None,
            capabilities: vec!["anthropic/messages.create".to_string()],
            container: Some(ContainerSpec {
                image: "seks/skill:latest".to_string(),
                memory_limit: "256m".to_string(),
                cpu_limit: "1".to_string(),
                timeout_seconds: 30,
                network: NetworkPolicy::BrokerOnly,
                env: HashMap::new(),
            }),
            os: None,
            always: false,
            skill_md_path: None,
        }
    }

    fn test_runner(backend: Arc<dyn ContainerBackend>) -> (tempfile::TempDir, SkillRunner) {
        let dir = tempfile::TempDir::new().unwrap();
        let appender = seks_audit_log::AuditAppender::open(&dir.path().join("audit.jsonl")).unwrap();
        let runner =
            SkillRunner::new("http://127.0.0.1:0".to_string(), backend, Arc::new(tokio::sync::Mutex::new(appender)));
        (dir, runner)
    }

    #[tokio::test]
    async fn local_mode_never_touches_network_or_container() {
        let backend = Arc::new(FakeContainerBackend::new(ContainerRunOutcome {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
        }));
        let (_dir, runner) = test_runner(backend.clone());
        let manifest = test_manifest();
        let outcome = runner.run(&manifest, "get weather for Paris", "agent-1", "tok-irrelevant", RunMode::Local).await;
        assert!(outcome.ok);
        assert!(outcome.capabilities_used.is_empty());
        assert!(backend.networks.lock().is_empty());
    }

    #[tokio::test]
    async fn s6_container_mode_falls_back_to_degraded_when_scoped_token_mint_fails() {
        let backend = Arc::new(FakeContainerBackend::new(ContainerRunOutcome {
            exit_code: Some(0),
            stdout: "ran without a token".to_string(),
            stderr: String::new(),
            timed_out: false,
        }));
        let (_dir, runner) = test_runner(backend);
        let manifest = test_manifest();
        // broker_url points at a closed port so the mint call fails.
        let outcome = runner.run(&manifest, "get weather for Paris", "agent-1", "tok-1", RunMode::Container).await;
        assert!(outcome.degraded);
        assert!(outcome.capabilities_used.is_empty());
    }

    #[tokio::test]
    async fn container_timeout_kills_and_reports_failure() {
        let backend = Arc::new(FakeContainerBackend::new(ContainerRunOutcome {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
        }));
        let (_dir, runner) = test_runner(backend);
        let manifest = test_manifest();
        let outcome = runner.run(&manifest, "slow task", "agent-1", "tok-1", RunMode::Container).await;
        assert!(!outcome.ok);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn effective_timeout_defaults_when_no_container_section() {
        let mut manifest = test_manifest();
        manifest.container = None;
        assert_eq!(manifest.effective_timeout(), Duration::from_secs(300));
    }
}
