//! Runs the built `lisa` binary against a throwaway state directory.

use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn lisa(state: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_lisa"))
        .args(args)
        .env("LISA_STATE_DIR", state)
        .env("LISA_TMUX_SOCKET_DIR", state)
        .env_remove("LISA_LOG_DIR")
        .env_remove("LISA_DEBUG")
        .output()
        .expect("run lisa")
}

fn json(out: &Output) -> Value {
    serde_json::from_slice(&out.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {}\nstderr: {}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        )
    })
}

#[test]
fn test_smoke_passes() {
    let tmp = TempDir::new().unwrap();
    let out = lisa(tmp.path(), &["session", "smoke", "--json"]);
    assert!(out.status.success());
    let payload = json(&out);
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["failed"], 0);
}

#[test]
fn test_schema_lookup_and_unknown_command() {
    let tmp = TempDir::new().unwrap();
    let out = lisa(tmp.path(), &["session", "schema", "--command", "status", "--json"]);
    assert!(out.status.success());
    assert_eq!(json(&out)["command"], "session status");

    let out = lisa(tmp.path(), &["session", "schema", "--command", "bogus", "--json"]);
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(json(&out)["errorCode"], "unknown_schema_command");
}

#[test]
fn test_failure_without_json_goes_to_stderr() {
    let tmp = TempDir::new().unwrap();
    let out = lisa(tmp.path(), &["session", "schema", "--command", "bogus"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(out.stdout.is_empty());
    assert!(String::from_utf8_lossy(&out.stderr).starts_with("error: unknown --command"));
}

#[test]
fn test_unknown_flag_is_a_json_failure() {
    let tmp = TempDir::new().unwrap();
    let out = lisa(tmp.path(), &["session", "list", "--no-such-flag", "--json"]);
    assert_eq!(out.status.code(), Some(1));
    let payload = json(&out);
    assert_eq!(payload["ok"], false);
    assert_eq!(payload["errorCode"], "unknown_flag");
}

#[test]
fn test_objective_then_sandbox_snapshot_restore() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("repo");
    std::fs::create_dir_all(&root).unwrap();
    let root = root.to_str().unwrap();
    let state = tmp.path().join("state");
    std::fs::create_dir_all(&state).unwrap();

    let out = lisa(
        &state,
        &["session", "objective", "--project-root", root, "--id", "o1", "--goal", "ship it", "--json"],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(json(&out)["currentId"], "o1");

    let bundle = tmp.path().join("sandbox.json");
    let bundle = bundle.to_str().unwrap();
    let out = lisa(
        &state,
        &["session", "state-sandbox", "snapshot", "--project-root", root, "--file", bundle, "--json"],
    );
    assert!(out.status.success());

    let out = lisa(&state, &["session", "state-sandbox", "--action", "clear", "--project-root", root, "--json"]);
    assert!(out.status.success());
    let out = lisa(&state, &["session", "state-sandbox", "list", "--project-root", root, "--json"]);
    assert_eq!(json(&out)["objectiveCount"], 0);

    let out = lisa(
        &state,
        &["session", "state-sandbox", "restore", "--project-root", root, "--file", bundle, "--json"],
    );
    assert!(out.status.success());
    let out = lisa(&state, &["session", "state-sandbox", "list", "--project-root", root, "--json-min"]);
    let payload = json(&out);
    assert_eq!(payload["objectiveCount"], 1);
    assert_eq!(payload["currentId"], "o1");
}

#[test]
fn test_budget_enforce_reports_violation() {
    let tmp = TempDir::new().unwrap();
    let out = lisa(
        tmp.path(),
        &["session", "budget-enforce", "--tokens", "900", "--max-tokens", "500", "--json"],
    );
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(json(&out)["errorCode"], "budget_limit_exceeded");
}

#[test]
fn test_contract_check_against_shipped_doc() {
    let tmp = TempDir::new().unwrap();
    let repo = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let doc = repo.join("skills/lisa/data/commands.md");
    let out = lisa(
        tmp.path(),
        &["session", "contract-check", "--skill-doc", doc.to_str().unwrap(), "--json-min"],
    );
    let payload = json(&out);
    assert_eq!(payload["failed"], 0, "{payload}");
    assert!(out.status.success());
}

#[test]
fn test_help_lists_contract_flags() {
    let tmp = TempDir::new().unwrap();
    let out = lisa(tmp.path(), &["session", "turn", "--help"]);
    assert!(out.status.success());
    let help = String::from_utf8_lossy(&out.stdout);
    for flag in ["--stop-on-waiting", "--until-marker", "--summary-style", "--json-min", "--json"] {
        assert!(help.contains(flag), "turn --help lacks {flag}");
    }
}

#[test]
fn test_capture_and_packet_accept_missing_fields_flag() {
    let tmp = TempDir::new().unwrap();
    for command in ["capture", "packet"] {
        let out = lisa(tmp.path(), &["session", command, "--session", "lisa-nobody-1", "--json"]);
        let payload = json(&out);
        assert_ne!(payload["errorCode"], "invalid_fields", "{command}: {payload}");
    }
}

#[test]
fn test_spawn_dry_run_and_missing_session_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("repo");
    std::fs::create_dir_all(&root).unwrap();
    let root = root.to_string_lossy().into_owned();

    let out = lisa(
        tmp.path(),
        &[
            "session", "spawn", "--project-root", &root, "--agent", "codex", "--mode", "exec", "--prompt",
            "run the tests", "--dry-run", "--json",
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let payload = json(&out);
    assert_eq!(payload["dryRun"], true);
    assert!(payload["session"].as_str().unwrap().starts_with("lisa-repo-"));
    assert_eq!(payload["env"]["LISA_MODE"], "exec");

    let out = lisa(tmp.path(), &["session", "exists", "--session", "lisa-ghost", "--project-root", &root, "--json"]);
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(json(&out)["exists"], false);

    let out = lisa(tmp.path(), &["session", "kill", "--session", "lisa-ghost", "--project-root", &root, "--json"]);
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(json(&out)["errorCode"], "session_not_found");
}
