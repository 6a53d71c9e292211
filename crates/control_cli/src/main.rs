use clap::{Parser, Subcommand};
use dotenvy::from_path as dotenv_from_path;
use seks_audit_log::{verify_log, AuditAppender};
use seks_policy::PolicyMode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("audit error: {0}")]
    Audit(#[from] seks_audit_log::AuditLogError),
    #[error("policy error: {0}")]
    Policy(#[from] seks_policy::PolicyError),
    #[error("hash error: {0}")]
    Canon(#[from] seks_common::CanonError),
    #[error("store error: {0}")]
    Store(#[from] seks_store::StoreError),
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("startup error: {0}")]
    Startup(#[from] seks_broker_http::StartupError),
    #[error("exec error: {0}")]
    Exec(#[from] seks_exec::ExecError),
    #[error("runner error: {0}")]
    Runner(#[from] seks_skill_runner::RunnerError),
    #[error("manifest error: {0}")]
    Manifest(#[from] seks_skill_runner::manifest::ManifestError),
    #[error("invalid value {0:?}")]
    InvalidValue(String),
    #[error("bind address is invalid: {0}")]
    BadBindAddr(std::net::AddrParseError),
}

fn parse_policy_mode(s: &str) -> Result<PolicyMode, CliError> {
    match s {
        "strict" => Ok(PolicyMode::Strict),
        "moderate" => Ok(PolicyMode::Moderate),
        "permissive" => Ok(PolicyMode::Permissive),
        other => Err(CliError::InvalidValue(other.to_string())),
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())).ok_or_else(|| format!("expected key=value, got {s:?}"))
}

fn now_unix_f64() -> f64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn load_env(repo_root: &Path) {
    let repo_env = repo_root.join(".env");
    if repo_env.exists() {
        let _ = dotenv_from_path(&repo_env);
        eprintln!("loaded env from {}", repo_env.display());
    } else if Path::new(".env").exists() {
        let _ = dotenv_from_path(".env");
        eprintln!("loaded env from ./.env");
    } else {
        eprintln!("no .env file found (expected at {} or CWD)", repo_env.display());
    }
}

#[derive(Parser)]
#[command(name = "seks-control", version, about = "secure exec/key-store control plane utilities")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify the hash chain of an audit log and print the last record's hash.
    VerifyAudit {
        #[arg(long)]
        audit_log: PathBuf,
    },

    /// Mint a fresh agent token and register the agent with the capability store.
    SeedAgent {
        #[arg(long)]
        db: PathBuf,

        #[arg(long)]
        agent_id: String,
    },

    /// Grant a capability string ("provider/action") to an agent.
    GrantCapability {
        #[arg(long)]
        db: PathBuf,

        #[arg(long)]
        agent_id: String,

        #[arg(long)]
        capability: String,
    },

    /// List the capabilities granted to an agent.
    ListCapabilities {
        #[arg(long)]
        db: PathBuf,

        #[arg(long)]
        agent_id: String,
    },

    /// Store a secret field for a provider, either account-global or scoped to one agent.
    PutSecret {
        #[arg(long)]
        db: PathBuf,

        #[arg(long)]
        provider: String,

        #[arg(long)]
        field: String,

        #[arg(long)]
        value: String,

        #[arg(long, default_value = "global")]
        scope: String,

        #[arg(long)]
        agent_id: Option<String>,
    },

    /// Mint a scoped token bounded to a subset of an agent's granted capabilities.
    MintScopedToken {
        #[arg(long)]
        db: PathBuf,

        #[arg(long)]
        agent_token: String,

        #[arg(long)]
        skill_run_id: String,

        /// Comma-separated capability strings.
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,

        #[arg(long, default_value_t = 300)]
        ttl_seconds: u64,
    },

    /// Classify a raw command string as safe, suspicious, or dangerous, and show
    /// what the policy engine would decide for it in the given mode.
    Classify {
        #[arg(long)]
        command: String,

        #[arg(long, default_value = "moderate")]
        policy_mode: String,
    },

    /// Run a command through the policy engine and, if admitted, the sandboxed
    /// executor (no shell interpretation). Either `--template` with `--param`
    /// key=value pairs, or a trailing argv for an arbitrary command.
    Exec {
        #[arg(long)]
        template: Option<String>,

        /// key=value, repeatable. Only meaningful with --template.
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// argv[0] followed by its arguments, when not using --template.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,

        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,

        #[arg(long, default_value = "moderate")]
        policy_mode: String,

        /// Confirm a decision that requires approval.
        #[arg(long)]
        approve: bool,

        #[arg(long)]
        agent_id: String,

        #[arg(long)]
        audit_log: PathBuf,
    },

    /// Run a skill manifest either locally (no network/secrets) or in a container
    /// wired to a running broker via a scoped token.
    RunSkill {
        #[arg(long)]
        skill_dir: PathBuf,

        #[arg(long)]
        task: String,

        #[arg(long)]
        agent_id: String,

        #[arg(long)]
        agent_token: String,

        #[arg(long, default_value = "http://127.0.0.1:8080")]
        broker_url: String,

        #[arg(long, default_value = "local")]
        mode: String,

        #[arg(long)]
        audit_log: PathBuf,
    },

    /// Run the Broker HTTP Surface.
    Serve {
        #[arg(long)]
        repo_root: PathBuf,

        #[arg(long)]
        db: PathBuf,

        #[arg(long)]
        audit_log: PathBuf,

        #[arg(long, default_value = "moderate")]
        policy_mode: String,

        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    if let Err(e) = run().await {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let args = Args::parse();
    match args.cmd {
        Command::VerifyAudit { audit_log } => {
            let last = verify_log(audit_log)?;
            println!("{last}");
            Ok(())
        }

        Command::SeedAgent { db, agent_id } => {
            let sled_db = sled::open(&db)?;
            let tokens = seks_store::TokenIssuer::open(&sled_db)?;
            let token = tokens.mint_agent_token(&agent_id)?;
            println!("{token}");
            Ok(())
        }

        Command::GrantCapability { db, agent_id, capability } => {
            let sled_db = sled::open(&db)?;
            let caps = seks_store::CapabilityStore::open(&sled_db)?;
            let grant = seks_store::CapabilityGrant::parse(agent_id, &capability)?;
            caps.grant(grant)?;
            Ok(())
        }

        Command::ListCapabilities { db, agent_id } => {
            let sled_db = sled::open(&db)?;
            let caps = seks_store::CapabilityStore::open(&sled_db)?;
            for grant in caps.list_for_agent(&agent_id)? {
                println!("{}", grant.as_capability_string());
            }
            Ok(())
        }

        Command::PutSecret { db, provider, field, value, scope, agent_id } => {
            let sled_db = sled::open(&db)?;
            let secrets = seks_store::SecretStore::open(&sled_db)?;
            let scope = match scope.as_str() {
                "global" => seks_store::SecretScope::AccountGlobal,
                "agent" => seks_store::SecretScope::AgentScoped,
                other => return Err(CliError::InvalidValue(other.to_string())),
            };
            secrets.put(seks_store::Secret { provider, field, value, scope, agent_id })?;
            Ok(())
        }

        Command::MintScopedToken { db, agent_token, skill_run_id, capabilities, ttl_seconds } => {
            let sled_db = sled::open(&db)?;
            let caps = seks_store::CapabilityStore::open(&sled_db)?;
            let tokens = seks_store::TokenIssuer::open(&sled_db)?;
            let (token, expires_at) = tokens.mint_scoped(&agent_token, &skill_run_id, capabilities, ttl_seconds, &caps)?;
            println!("{}", serde_json::json!({ "token": token, "expires_at": expires_at }));
            Ok(())
        }

        Command::Classify { command, policy_mode } => {
            let mode = parse_policy_mode(&policy_mode)?;
            let classification = seks_templates::classify(&command);
            let templates = seks_templates::TemplateRegistry::with_builtins();
            let decision = seks_policy::evaluate(
                &seks_policy::ExecRequest::Arbitrary { command: command.clone() },
                mode,
                false,
                &templates,
            )?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "classification": classification.as_str(),
                "allowed": decision.allowed,
                "requires_approval": decision.requires_approval,
                "reason": decision.reason,
                "suggestion": decision.suggestion,
            }))?);
            Ok(())
        }

        Command::Exec { template, params, argv, timeout_secs, policy_mode, approve, agent_id, audit_log } => {
            let mode = parse_policy_mode(&policy_mode)?;
            let templates = seks_templates::TemplateRegistry::with_builtins();
            let request = match &template {
                Some(template_id) => {
                    seks_policy::ExecRequest::Template { template_id: template_id.clone(), params: params.into_iter().collect() }
                }
                None => {
                    if argv.is_empty() {
                        return Err(CliError::InvalidValue("exec requires either --template or a trailing argv".to_string()));
                    }
                    seks_policy::ExecRequest::Arbitrary { command: argv.join(" ") }
                }
            };

            let decision = seks_policy::evaluate(&request, mode, approve, &templates)?;
            let correlation_id = seks_audit_spec::CorrelationId::new(uuid::Uuid::new_v4());
            let mut appender = AuditAppender::open(&audit_log)?;
            let subject = template.clone().unwrap_or_else(|| argv.join(" "));

            if !decision.allowed {
                appender.append(seks_audit_spec::AuditEvent::Deny(seks_audit_spec::Deny {
                    schema_version: 1,
                    ts: now_unix_f64(),
                    agent_id: Some(seks_audit_spec::AgentId(agent_id)),
                    subject,
                    reason: decision.reason.clone().unwrap_or_default(),
                    suggestion: decision.suggestion.clone(),
                    correlation_id,
                }))?;
                if decision.requires_approval {
                    eprintln!("approval required: {}", decision.reason.unwrap_or_default());
                } else {
                    eprintln!("denied: {}", decision.reason.unwrap_or_default());
                }
                if let Some(suggestion) = decision.suggestion {
                    eprintln!("suggestion: try template {suggestion}");
                }
                std::process::exit(1);
            }

            let resolved_argv = decision.argv.clone().unwrap_or_else(|| argv.clone());
            let classification = match &request {
                seks_policy::ExecRequest::Template { .. } => "template".to_string(),
                seks_policy::ExecRequest::Arbitrary { command } => seks_templates::classify(command).as_str().to_string(),
            };

            let started = std::time::Instant::now();
            let req = seks_exec::ExecRequest {
                argv: resolved_argv.clone(),
                cwd: None,
                env_overlay: Default::default(),
                timeout: Duration::from_secs(timeout_secs),
            };
            let scrub = seks_scrub::Registry::new();
            let result = seks_exec::run(req, &scrub).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let (exit_code, timed_out, outcome) = match &result {
                Ok(r) => (r.exit_code, r.timed_out, if r.exit_code == Some(0) { seks_audit_spec::Outcome::Allowed } else { seks_audit_spec::Outcome::Error }),
                Err(_) => (None, false, seks_audit_spec::Outcome::Error),
            };
            appender.append(seks_audit_spec::AuditEvent::Exec(seks_audit_spec::ExecEvent {
                schema_version: 1,
                ts: now_unix_f64(),
                agent_id: seks_audit_spec::AgentId(agent_id),
                template_id: template,
                argv_hash: seks_common::sha256_canonical_json(&resolved_argv)?,
                classification,
                exit_code,
                timed_out,
                duration_ms,
                correlation_id,
                outcome,
            }))?;

            let result = result?;
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            if result.timed_out {
                eprintln!("(timed out)");
            }
            std::process::exit(result.exit_code.unwrap_or(1));
        }

        Command::RunSkill { skill_dir, task, agent_id, agent_token, broker_url, mode, audit_log } => {
            let manifest = seks_skill_runner::manifest::SkillManifest::load_from_dir(&skill_dir)?;
            let run_mode = match mode.as_str() {
                "local" => seks_skill_runner::RunMode::Local,
                "container" => seks_skill_runner::RunMode::Container,
                other => return Err(CliError::InvalidValue(other.to_string())),
            };
            let appender = AuditAppender::open(&audit_log)?;
            let backend: std::sync::Arc<dyn seks_skill_runner::container::ContainerBackend> =
                std::sync::Arc::new(NoopContainerBackend);
            let runner = seks_skill_runner::SkillRunner::new(
                broker_url,
                backend,
                std::sync::Arc::new(tokio::sync::Mutex::new(appender)),
            );
            let outcome = runner.run(&manifest, &task, &agent_id, &agent_token, run_mode).await;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "ok": outcome.ok,
                "stdout": outcome.stdout,
                "stderr": outcome.stderr,
                "error": outcome.error,
                "duration_ms": outcome.duration_ms,
                "degraded": outcome.degraded,
                "capabilities_used": outcome.capabilities_used,
            }))?);
            Ok(())
        }

        Command::Serve { repo_root, db, audit_log, policy_mode, bind } => {
            load_env(&repo_root);
            let mode = parse_policy_mode(&policy_mode)?;
            let sled_db = sled::open(&db)?;
            let state = seks_broker_http::new_state(&sled_db, &audit_log, mode)?;
            let app = seks_broker_http::build_router(state);
            let addr: std::net::SocketAddr = bind.parse().map_err(CliError::BadBindAddr)?;
            let listener = tokio::net::TcpListener::bind(addr).await?;
            eprintln!("seks-control: broker listening on {addr}");
            axum::serve(listener, app).await?;
            Ok(())
        }
    }
}

/// A container backend that refuses every container-mode call; used when
/// `seks-control run-skill` is invoked without a real engine wired up. Local
/// mode never reaches it.
struct NoopContainerBackend;

#[async_trait::async_trait]
impl seks_skill_runner::container::ContainerBackend for NoopContainerBackend {
    async fn network_exists(&self, _name: &str) -> Result<bool, seks_skill_runner::container::ContainerError> {
        Ok(false)
    }

    async fn network_create(
        &self,
        _name: &str,
        _internal: bool,
    ) -> Result<(), seks_skill_runner::container::ContainerError> {
        Err(seks_skill_runner::container::ContainerError::Network(
            "no container backend configured; run with --mode local or wire a real engine".to_string(),
        ))
    }

    async fn run_container(
        &self,
        _image: &str,
        _name: &str,
        _network: &str,
        _memory_limit: &str,
        _cpu_limit: &str,
        _env: &std::collections::HashMap<String, String>,
        _timeout: Duration,
    ) -> Result<seks_skill_runner::container::ContainerRunOutcome, seks_skill_runner::container::ContainerError> {
        Err(seks_skill_runner::container::ContainerError::Run(
            "no container backend configured; run with --mode local or wire a real engine".to_string(),
        ))
    }

    async fn kill(&self, _name: &str) -> Result<(), seks_skill_runner::container::ContainerError> {
        Ok(())
    }
}
