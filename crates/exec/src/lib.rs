//! seks_exec
//!
//! Spawns a child process directly, never through a shell. Argv elements
//! are passed to the OS exactly as given — there is no interpretation step
//! where `;`, backticks, or `$(...)` could matter.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("argv must contain at least one element")]
    EmptyArgv,
    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("io error while reading child output: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env_overlay: HashMap<String, String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

const DYNAMIC_LINKER_VARS: &[&str] =
    &["LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT", "DYLD_INSERT_LIBRARIES", "DYLD_LIBRARY_PATH", "DYLD_FRAMEWORK_PATH"];

const INTERPRETER_OVERRIDE_VARS: &[&str] = &[
    "NODE_OPTIONS",
    "NODE_PATH",
    "PYTHONPATH",
    "PYTHONHOME",
    "PERL5LIB",
    "RUBYLIB",
    "BASH_ENV",
    "ENV",
    "GCONV_PATH",
    "IFS",
    "SSLKEYLOGFILE",
];

fn is_sensitive_var(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    if DYNAMIC_LINKER_VARS.contains(&upper.as_str()) || upper.starts_with("DYLD_") {
        return true;
    }
    if INTERPRETER_OVERRIDE_VARS.contains(&upper.as_str()) {
        return true;
    }
    upper.ends_with("_KEY")
        || upper.ends_with("_SECRET")
        || upper.ends_with("_TOKEN")
        || upper.ends_with("_PASSWORD")
        || upper.starts_with("SECRET_")
        || upper.starts_with("API_")
        || upper.starts_with("AUTH_")
}

/// Build the sanitised environment for a child process: start from the
/// broker's own environment, strip every sensitive name, then apply the
/// caller's overlay (itself re-checked — an overlay cannot reintroduce a
/// sensitive name).
pub fn sanitize_env(overlay: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().filter(|(k, _)| !is_sensitive_var(k)).collect();
    for (k, v) in overlay {
        if !is_sensitive_var(k) {
            env.insert(k.clone(), v.clone());
        }
    }
    env
}

/// Graceful-then-force termination. Sends SIGTERM (unix only) and gives the
/// child a short grace period before force-killing; non-unix targets go
/// straight to force-kill since there is no portable soft-terminate here.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc_kill(pid as i32, SIGTERM);
            }
            if timeout(Duration::from_millis(500), child.wait()).await.is_ok() {
                return;
            }
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(unix)]
const SIGTERM: i32 = 15;

#[cfg(unix)]
extern "C" {
    #[link_name = "kill"]
    fn libc_kill_raw(pid: i32, sig: i32) -> i32;
}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32, sig: i32) {
    libc_kill_raw(pid, sig);
}

/// Runs `req` to completion or until its timeout elapses. Never inherits
/// parent stdin. Never throws on non-zero exit — callers inspect
/// `exit_code`. stdout/stderr pass through `scrub` before being returned.
pub async fn run(req: ExecRequest, scrub: &seks_scrub::Registry) -> Result<ExecResult, ExecError> {
    if req.argv.is_empty() {
        return Err(ExecError::EmptyArgv);
    }

    let env = sanitize_env(&req.env_overlay);

    let mut cmd = Command::new(&req.argv[0]);
    cmd.args(&req.argv[1..]);
    cmd.env_clear();
    cmd.envs(env);
    if let Some(cwd) = &req.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(ExecError::Spawn)?;
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let wait_fut = async {
        let status = child.wait().await?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut p) = stdout_pipe.take() {
            p.read_to_end(&mut stdout).await?;
        }
        if let Some(mut p) = stderr_pipe.take() {
            p.read_to_end(&mut stderr).await?;
        }
        Ok::<_, std::io::Error>((status, stdout, stderr))
    };

    match timeout(req.timeout, wait_fut).await {
        Ok(Ok((status, stdout, stderr))) => Ok(ExecResult {
            exit_code: status.code(),
            stdout: scrub.scrub(&String::from_utf8_lossy(&stdout)),
            stderr: scrub.scrub(&String::from_utf8_lossy(&stderr)),
            timed_out: false,
        }),
        Ok(Err(e)) => Err(ExecError::Io(e)),
        Err(_elapsed) => {
            terminate(&mut child).await;
            Ok(ExecResult { exit_code: None, stdout: String::new(), stderr: String::new(), timed_out: true })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_argv_without_a_shell() {
        // S1-style check: a single argv element containing shell
        // metacharacters must appear literally in output, never executed.
        let result = run(ExecRequest {
            argv: vec!["echo".into(), "fix; rm -rf /".into()],
            cwd: None,
            env_overlay: HashMap::new(),
            timeout: Duration::from_secs(5),
        }, &seks_scrub::Registry::new())
        .await
        .unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim_end(), "fix; rm -rf /");
    }

    #[tokio::test]
    async fn non_zero_exit_does_not_error() {
        let result = run(ExecRequest {
            argv: vec!["false".into()],
            cwd: None,
            env_overlay: HashMap::new(),
            timeout: Duration::from_secs(5),
        }, &seks_scrub::Registry::new())
        .await
        .unwrap();
        assert_ne!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn timeout_is_reported_and_process_is_killed() {
        let result = run(ExecRequest {
            argv: vec!["sleep".into(), "5".into()],
            cwd: None,
            env_overlay: HashMap::new(),
            timeout: Duration::from_millis(100),
        }, &seks_scrub::Registry::new())
        .await
        .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
    }

    #[test]
    fn sanitize_env_strips_sensitive_names() {
        let mut overlay = HashMap::new();
        overlay.insert("ANTHROPIC_API_KEY".to_string(), "leaked".to_string());
        overlay.insert("LD_PRELOAD".to_string(), "evil.so".to_string());
        overlay.insert("SAFE_VAR".to_string(), "ok".to_string());
        let env = sanitize_env(&overlay);
        assert!(!env.contains_key("ANTHROPIC_API_KEY"));
        assert!(!env.contains_key("LD_PRELOAD"));
        assert_eq!(env.get("SAFE_VAR").unwrap(), "ok");
    }

    #[test]
    fn sanitize_env_strips_from_inherited_environment_too() {
        std::env::set_var("TEST_API_SECRET", "shh");
        let env = sanitize_env(&HashMap::new());
        assert!(!env.contains_key("TEST_API_SECRET"));
        std::env::remove_var("TEST_API_SECRET");
    }
}
