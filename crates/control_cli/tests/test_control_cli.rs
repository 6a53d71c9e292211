use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn classify_reports_dangerous_for_rm_rf() {
    let mut cmd = Command::cargo_bin("seks-control").unwrap();
    cmd.args(["classify", "--command", "rm -rf /"]);
    cmd.assert().success().stdout(predicate::str::contains("dangerous"));
}

#[test]
fn classify_reports_safe_for_git_status() {
    let mut cmd = Command::cargo_bin("seks-control").unwrap();
    cmd.args(["classify", "--command", "git status"]);
    cmd.assert().success().stdout(predicate::str::contains("safe"));
}

#[test]
fn seed_agent_then_grant_then_list_round_trips() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("db");

    let mut seed = Command::cargo_bin("seks-control").unwrap();
    seed.args(["seed-agent", "--db", db.to_str().unwrap(), "--agent-id", "agent-1"]);
    seed.assert().success();

    let mut grant = Command::cargo_bin("seks-control").unwrap();
    grant.args([
        "grant-capability",
        "--db",
        db.to_str().unwrap(),
        "--agent-id",
        "agent-1",
        "--capability",
        "anthropic/messages.create",
    ]);
    grant.assert().success();

    let mut list = Command::cargo_bin("seks-control").unwrap();
    list.args(["list-capabilities", "--db", db.to_str().unwrap(), "--agent-id", "agent-1"]);
    list.assert().success().stdout(predicate::str::contains("anthropic/messages.create"));
}

#[test]
fn exec_runs_argv_without_shell_interpretation() {
    let mut cmd = Command::cargo_bin("seks-control").unwrap();
    cmd.args(["exec", "--", "echo", "hi; rm -rf /"]);
    cmd.assert().success().stdout(predicate::str::contains("hi; rm -rf /"));
}

#[test]
fn verify_audit_reports_genesis_hash_for_an_empty_log() {
    let dir = tempfile::TempDir::new().unwrap();
    let audit_log = dir.path().join("audit.jsonl");
    std::fs::write(&audit_log, "").unwrap();

    let mut verify = Command::cargo_bin("seks-control").unwrap();
    verify.args(["verify-audit", "--audit-log", audit_log.to_str().unwrap()]);
    verify.assert().success().stdout(predicate::str::contains("sha256:"));
}
