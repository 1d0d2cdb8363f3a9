//! `session smoke`: deterministic self-check of the tables the rest of the
//! engine depends on. Nothing here touches tmux or the filesystem.

use crate::capture::extract_semantic_lines;
use crate::classifier::{classify, next_action_for_state, Observation};
use crate::command::obj;
use crate::payload::{apply_redaction_rules, parse_redaction_rules, truncate_to_token_budget};
use crate::router::compute_session_priority;
use lisa_protocol::{CommandOutput, SessionState};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmokeCheck {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl SmokeCheck {
    fn expect<T: PartialEq + std::fmt::Debug>(name: &str, expected: T, actual: T) -> Self {
        let ok = expected == actual;
        Self {
            name: name.to_string(),
            ok,
            detail: if ok { String::new() } else { format!("expected {expected:?}, got {actual:?}") },
        }
    }
}

fn observation() -> Observation {
    Observation {
        session_exists: true,
        interactive: true,
        pane_status: "alive".into(),
        pane_is_shell: true,
        poll_count: 10,
        ..Observation::default()
    }
}

fn classifier_matrix() -> Vec<(&'static str, Observation, SessionState, &'static str)> {
    use SessionState::*;
    vec![
        ("missing", Observation::default(), NotFound, "session_not_found"),
        (
            "done_file_zero",
            Observation { done_file_exit: Some(0), agent_pid: 7, ..observation() },
            Completed,
            "done_file",
        ),
        (
            "exec_marker_nonzero",
            Observation { exec_marker_exit: Some(2), ..observation() },
            Crashed,
            "exec_done_marker",
        ),
        (
            "pane_exited_nonzero",
            Observation { pane_status: "exited:1".into(), ..observation() },
            Crashed,
            "pane_exited_nonzero",
        ),
        (
            "prompt_waiting",
            Observation { prompt_waiting: true, ..observation() },
            WaitingInput,
            "prompt_waiting",
        ),
        (
            "busy_agent_not_waiting",
            Observation { prompt_waiting: true, agent_busy: true, agent_pid: 9, ..observation() },
            InProgress,
            "agent_pid_alive",
        ),
        (
            "capture_error",
            Observation { capture_error: true, ..observation() },
            Degraded,
            "tmux_capture_error",
        ),
        (
            "grace_period",
            Observation { poll_count: 2, ..observation() },
            InProgress,
            "grace_period_just_started",
        ),
        ("no_signals", observation(), Stuck, "stuck_no_signals"),
    ]
}

fn classifier_checks() -> Vec<SmokeCheck> {
    let mut checks: Vec<SmokeCheck> = classifier_matrix()
        .into_iter()
        .map(|(name, obs, state, reason)| {
            let got = classify(&obs);
            SmokeCheck::expect(&format!("classifier:{name}"), (state, reason), (got.state, got.reason))
        })
        .collect();
    let obs = Observation { prompt_waiting: true, output_fresh: true, ..observation() };
    checks.push(SmokeCheck::expect("classifier:deterministic", classify(&obs), classify(&obs.clone())));
    checks
}

fn next_action_checks() -> Vec<SmokeCheck> {
    [
        ("waiting_input", "session send"),
        ("in_progress", "session monitor"),
        ("degraded", "session monitor"),
        ("completed", "session capture"),
        ("crashed", "session explain"),
        ("stuck", "session explain"),
        ("not_found", "session spawn"),
        ("", "session status"),
    ]
    .into_iter()
    .map(|(state, action)| {
        let label = if state.is_empty() { "unknown" } else { state };
        SmokeCheck::expect(&format!("next_action:{label}"), action, next_action_for_state(state))
    })
    .collect()
}

fn priority_checks() -> Vec<SmokeCheck> {
    let (crashed, crashed_label) = compute_session_priority("crashed");
    let (stuck, _) = compute_session_priority("stuck");
    let (waiting, _) = compute_session_priority("waiting_input");
    vec![
        SmokeCheck::expect("priority:crashed", (100, "critical"), (crashed, crashed_label)),
        SmokeCheck::expect("priority:crashed_over_stuck", true, crashed > stuck),
        SmokeCheck::expect("priority:stuck_over_waiting", true, stuck > waiting),
    ]
}

fn truncation_checks() -> Vec<SmokeCheck> {
    let input = "x".repeat(2800);
    let (fits, fits_truncated) = truncate_to_token_budget(&input, 700);
    let (cut, cut_truncated) = truncate_to_token_budget(&input, 699);
    let (empty, _) = truncate_to_token_budget(&input, 0);
    vec![
        SmokeCheck::expect("truncate:exact_fit", (2800, false), (fits.len(), fits_truncated)),
        SmokeCheck::expect("truncate:one_under", (2796, true), (cut.len(), cut_truncated)),
        SmokeCheck::expect("truncate:ellipsis", true, cut.ends_with("...")),
        SmokeCheck::expect("truncate:zero_budget", 0, empty.len()),
    ]
}

fn redaction_checks() -> Vec<SmokeCheck> {
    let text = "mail ops@example.com token=abc123 Bearer abcdefghijkl id 12345678 at /home/me/x";
    let all = apply_redaction_rules(text, &["all"]);
    let none_wins = apply_redaction_rules(text, &["emails", "none"]);
    vec![
        SmokeCheck::expect("redact:email", true, all.contains("[REDACTED_EMAIL]")),
        SmokeCheck::expect("redact:secret", true, all.contains("token=[REDACTED_SECRET]")),
        SmokeCheck::expect("redact:bearer", true, all.contains("Bearer [REDACTED_TOKEN]")),
        SmokeCheck::expect("redact:number", true, all.contains("[REDACTED_NUMBER]")),
        SmokeCheck::expect("redact:path", true, all.contains(" [REDACTED_PATH]")),
        SmokeCheck::expect("redact:none_wins", text.to_string(), none_wins),
        SmokeCheck::expect(
            "redact:unknown_rule",
            Some("invalid_redact_rules".to_string()),
            parse_redaction_rules("emails,bogus").err().map(|e| e.code().to_string()),
        ),
    ]
}

fn semantic_checks() -> Vec<SmokeCheck> {
    let raw = "__LISA_SESSION_START__:x\nmodel:\n  Fixed the bug  \nFixed the bug\ncodex> hi\ntokens used\nNext step";
    let once = extract_semantic_lines(raw);
    vec![
        SmokeCheck::expect(
            "semantic:filters_noise",
            vec!["Fixed the bug".to_string(), "Next step".to_string()],
            once.clone(),
        ),
        SmokeCheck::expect("semantic:idempotent", once.clone(), extract_semantic_lines(&once.join("\n"))),
    ]
}

/// Every built-in check, in a fixed order.
pub fn run_smoke_checks() -> Vec<SmokeCheck> {
    let mut checks = classifier_checks();
    checks.extend(next_action_checks());
    checks.extend(priority_checks());
    checks.extend(truncation_checks());
    checks.extend(redaction_checks());
    checks.extend(semantic_checks());
    checks
}

pub fn smoke_report(checks: &[SmokeCheck]) -> CommandOutput {
    let failed: Vec<&SmokeCheck> = checks.iter().filter(|c| !c.ok).collect();
    let mut payload = obj(json!({
        "ok": failed.is_empty(),
        "checked": checks.len(),
        "failed": failed.len(),
        "checks": checks,
    }));
    if failed.is_empty() {
        return CommandOutput::ok(payload);
    }
    let names: Vec<&str> = failed.iter().map(|c| c.name.as_str()).collect();
    warn!(failed = ?names, "smoke checks failed");
    payload.insert("errorCode".into(), json!("smoke_prompt_matrix_assertion_failed"));
    payload.insert("error".into(), json!(format!("smoke assertions failed: {}", names.join(", "))));
    CommandOutput::with_exit(payload, 1)
}

pub fn smoke_command() -> CommandOutput {
    smoke_report(&run_smoke_checks())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_smoke_checks_pass() {
        let checks = run_smoke_checks();
        let failed: Vec<_> = checks.iter().filter(|c| !c.ok).collect();
        assert!(failed.is_empty(), "{failed:?}");
        let out = smoke_command();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.payload["checked"].as_u64().unwrap() as usize, checks.len());
    }

    #[test]
    fn test_check_names_are_unique() {
        let checks = run_smoke_checks();
        let mut names: Vec<&str> = checks.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), checks.len());
    }

    #[test]
    fn test_failed_check_sets_error_code() {
        let checks = vec![
            SmokeCheck::expect("a", 1, 1),
            SmokeCheck::expect("b", "x", "y"),
        ];
        assert_eq!(checks[1].detail, "expected \"x\", got \"y\"");
        let out = smoke_report(&checks);
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("smoke_prompt_matrix_assertion_failed"));
        assert_eq!(out.payload["failed"], 1);
        assert_eq!(out.payload["error"], "smoke assertions failed: b");
    }
}
