//! `session anomaly`: pattern detectors over a session's event tail.

use crate::capture::shell_quote;
use crate::classifier::next_action_for_state;
use crate::command::{fail_for, obj, Target};
use crate::engine::Engine;
use crate::events::read_session_event_tail;
use crate::router::DEFAULT_ROUTE_MODEL;
use crate::session::resolve_and_compute;
use crate::types::SessionEvent;
use lisa_protocol::{CommandOutput, SessionState};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

pub const DEFAULT_ANOMALY_EVENTS: usize = 80;
/// Consecutive identical reasons that count as a loop.
const REASON_LOOP_RUN: usize = 6;
/// Degraded events within the last [`DEGRADED_WINDOW`] that count as retries.
const DEGRADED_RETRY_COUNT: usize = 3;
const DEGRADED_WINDOW: usize = 10;
const EXPECTATION_CHURN_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnomalyFinding {
    pub code: &'static str,
    pub severity: Severity,
    pub count: usize,
    pub message: String,
    pub recommendation: &'static str,
}

impl AnomalyFinding {
    fn new(
        code: &'static str,
        severity: Severity,
        count: usize,
        message: impl Into<String>,
        recommendation: &'static str,
    ) -> Self {
        Self {
            code,
            severity,
            count,
            message: message.into(),
            recommendation,
        }
    }
}

fn is_active(state: &str) -> bool {
    state == SessionState::InProgress.as_str() || state == SessionState::Degraded.as_str()
}

/// Findings ordered by severity (high first), then code.
pub fn detect_session_anomalies(state: &str, events: &[SessionEvent]) -> Vec<AnomalyFinding> {
    let state = state.trim();
    if state == SessionState::NotFound.as_str() {
        return vec![AnomalyFinding::new(
            "session_not_found",
            Severity::High,
            1,
            "session is not present in tmux",
            "spawn or restore the session before monitoring",
        )];
    }
    if events.is_empty() {
        if is_active(state) {
            return vec![AnomalyFinding::new(
                "no_events_observed",
                Severity::Medium,
                1,
                "active state with empty event tail",
                "run session explain to verify event logging",
            )];
        }
        return Vec::new();
    }

    let mut longest = (0usize, "");
    let mut current = (0usize, "");
    let mut expectation_mismatches = 0;
    let mut degraded_tail = 0;
    let window_start = events.len().saturating_sub(DEGRADED_WINDOW);
    for (idx, event) in events.iter().enumerate() {
        let reason = event.reason.trim();
        if !reason.is_empty() && reason == current.1 {
            current.0 += 1;
        } else {
            current = (1, reason);
        }
        if current.0 > longest.0 {
            longest = current;
        }
        if reason.contains("expected_") || reason.contains("expectation") {
            expectation_mismatches += 1;
        }
        if idx >= window_start && event.state.trim() == SessionState::Degraded.as_str() {
            degraded_tail += 1;
        }
    }

    let mut findings = Vec::new();
    if longest.0 >= REASON_LOOP_RUN && is_active(state) {
        findings.push(AnomalyFinding::new(
            "reason_loop",
            Severity::High,
            longest.0,
            format!("repeated reason {:?} across {} consecutive events", longest.1, longest.0),
            "run session explain --events 40 and evaluate whether monitor expectations are too strict",
        ));
    }
    if degraded_tail >= DEGRADED_RETRY_COUNT {
        findings.push(AnomalyFinding::new(
            "degraded_retries",
            Severity::Medium,
            degraded_tail,
            "recent event tail shows repeated degraded state",
            "check tmux/socket health and rerun preflight",
        ));
    }
    if expectation_mismatches >= EXPECTATION_CHURN_COUNT {
        findings.push(AnomalyFinding::new(
            "expectation_churn",
            Severity::Medium,
            expectation_mismatches,
            "multiple monitor expectation mismatch events detected",
            "align --expect with stop condition or use until-state gates",
        ));
    }
    if state == SessionState::Stuck.as_str() {
        findings.push(AnomalyFinding::new(
            "terminal_stuck",
            Severity::High,
            1,
            "session resolved to stuck",
            "inspect with session explain then restart with session spawn",
        ));
    }
    if state == SessionState::Crashed.as_str() {
        findings.push(AnomalyFinding::new(
            "terminal_crashed",
            Severity::High,
            1,
            "session resolved to crashed",
            "capture raw output and rerun using safer command path",
        ));
    }
    findings.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.code.cmp(b.code)));
    findings
}

// ═══════════════════════════════════════════════════════════════════════════════
// Remediation
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemediationStep {
    pub command: String,
    pub reason: &'static str,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemediationPlan {
    pub enabled: bool,
    pub steps: Vec<RemediationStep>,
    /// Mean step confidence.
    pub confidence: f64,
}

pub fn build_remediation_plan(
    session: &str,
    root: &str,
    state: &str,
    findings: &[AnomalyFinding],
) -> RemediationPlan {
    let flags = format!("--session {} --project-root {}", shell_quote(session), shell_quote(root));
    let spawn = |prompt: &str| {
        format!(
            "./lisa session spawn --agent codex --mode interactive --project-root {} --prompt {} --model {DEFAULT_ROUTE_MODEL} --json",
            shell_quote(root),
            shell_quote(prompt)
        )
    };
    let mut steps: Vec<RemediationStep> = Vec::new();
    let mut add = |command: String, reason: &'static str, confidence: f64| {
        if !steps.iter().any(|s| s.command == command) {
            steps.push(RemediationStep {
                command,
                reason,
                confidence,
            });
        }
    };

    add(
        format!("./lisa session status {flags} --json-min"),
        "refresh status baseline before remediation",
        0.99,
    );
    if state == SessionState::NotFound.as_str() {
        add(
            spawn("Resume orchestration from latest known state."),
            "session missing in tmux; spawn replacement",
            0.96,
        );
        return RemediationPlan {
            enabled: true,
            steps,
            confidence: 0.96,
        };
    }
    for finding in findings {
        match finding.code {
            "reason_loop" | "degraded_retries" | "expectation_churn" => {
                add(
                    format!(
                        "./lisa session send {flags} --text {} --enter --json-min",
                        shell_quote("Summarize current blocker and propose one concrete unblocking step.")
                    ),
                    "nudge agent out of repeated degraded loop",
                    0.84,
                );
                add(
                    format!("./lisa session monitor {flags} --expect any --max-polls 8 --poll-interval 2 --json-min"),
                    "observe whether loop stabilizes after guidance",
                    0.8,
                );
            }
            "terminal_stuck" | "terminal_crashed" => {
                add(
                    format!("./lisa session explain {flags} --events 40 --json-min"),
                    "inspect terminal failure reason before restart",
                    0.9,
                );
                add(
                    format!("./lisa session kill {flags} --json"),
                    "remove broken session before respawn",
                    0.78,
                );
                add(
                    spawn("Resume from failure diagnostics and continue safely."),
                    "restart clean worker after crash/stuck",
                    0.74,
                );
            }
            _ => {}
        }
    }
    let confidence = steps.iter().map(|s| s.confidence).sum::<f64>() / steps.len().max(1) as f64;
    RemediationPlan {
        enabled: true,
        steps,
        confidence,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct AnomalyRequest {
    pub target: Target,
    pub events: usize,
    pub auto_remediate: bool,
}

impl Default for AnomalyRequest {
    fn default() -> Self {
        Self {
            target: Target::default(),
            events: DEFAULT_ANOMALY_EVENTS,
            auto_remediate: false,
        }
    }
}

/// Exit 1 when anything was found or the session is gone.
pub fn anomaly_command(engine: &Engine, req: &AnomalyRequest) -> CommandOutput {
    let session = req.target.session.clone();
    let (root, status) = match resolve_and_compute(engine, &req.target, "auto", "auto", false) {
        Ok(found) => found,
        Err(err) => return fail_for(&err, &session, &req.target.project_root),
    };
    let tail = read_session_event_tail(engine, &root, &session, req.events).unwrap_or_else(|err| {
        warn!(session = %session, error = %err, "anomaly scan without event tail");
        Default::default()
    });
    let state = status.session_state.as_str();
    let findings = detect_session_anomalies(state, &tail.events);
    let not_found = state == SessionState::NotFound.as_str();

    let mut payload = obj(json!({
        "session": session,
        "projectRoot": root,
        "status": status.status,
        "sessionState": state,
        "events": tail.events.len(),
        "dropped": tail.dropped_lines,
        "anomalies": findings,
        "ok": findings.is_empty(),
        "nextAction": next_action_for_state(state),
    }));
    if req.auto_remediate {
        payload.insert(
            "autoRemediate".into(),
            json!(build_remediation_plan(&session, &root, state, &findings)),
        );
    }
    if not_found {
        payload.insert("errorCode".into(), json!("session_not_found"));
    }
    let exit = if not_found || !findings.is_empty() { 1 } else { 0 };
    CommandOutput::with_exit(payload, exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn event(state: &str, reason: &str) -> SessionEvent {
        SessionEvent {
            state: state.into(),
            reason: reason.into(),
            ..SessionEvent::default()
        }
    }

    fn codes(findings: &[AnomalyFinding]) -> Vec<&'static str> {
        findings.iter().map(|f| f.code).collect()
    }

    #[test]
    fn test_reason_loop_needs_active_state() {
        let events: Vec<_> = (0..6).map(|_| event("in_progress", "output_changed")).collect();
        let findings = detect_session_anomalies("in_progress", &events);
        assert_eq!(codes(&findings), vec!["reason_loop"]);
        assert_eq!(findings[0].count, 6);
        assert!(detect_session_anomalies("waiting_input", &events).is_empty());

        let short: Vec<_> = (0..5).map(|_| event("in_progress", "same")).collect();
        assert!(detect_session_anomalies("in_progress", &short).is_empty());
    }

    #[test]
    fn test_degraded_tail_and_churn_sorted_by_severity() {
        let mut events: Vec<_> = (0..12).map(|_| event("in_progress", "ok")).collect();
        events.extend((0..3).map(|i| event("degraded", if i < 2 { "expected_terminal" } else { "x" })));
        let findings = detect_session_anomalies("stuck", &events);
        assert_eq!(codes(&findings), vec!["terminal_stuck", "degraded_retries", "expectation_churn"]);
        assert_eq!(findings[1].count, 3);
    }

    #[test]
    fn test_empty_tail_and_missing_session() {
        assert_eq!(codes(&detect_session_anomalies("degraded", &[])), vec!["no_events_observed"]);
        assert!(detect_session_anomalies("completed", &[]).is_empty());
        assert_eq!(
            codes(&detect_session_anomalies("not_found", &[event("crashed", "")])),
            vec!["session_not_found"]
        );
    }

    #[test]
    fn test_remediation_dedupes_commands() {
        let findings = detect_session_anomalies(
            "degraded",
            &(0..6).map(|_| event("degraded", "expected_marker")).collect::<Vec<_>>(),
        );
        let plan = build_remediation_plan("s1", "/repo", "degraded", &findings);
        assert_eq!(plan.steps.len(), 3);
        assert!(plan.steps[1].command.contains("session send --session 's1'"));
        let mean = (0.99 + 0.84 + 0.8) / 3.0;
        assert!((plan.confidence - mean).abs() < 1e-9);

        let missing = build_remediation_plan("s1", "/repo", "not_found", &[]);
        assert_eq!(missing.steps.len(), 2);
        assert_eq!(missing.confidence, 0.96);
    }

    #[test]
    fn test_command_flags_missing_session() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let out = anomaly_command(
            &engine,
            &AnomalyRequest {
                target: Target::new("ghost", "/repo"),
                auto_remediate: true,
                ..AnomalyRequest::default()
            },
        );
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("session_not_found"));
        assert_eq!(out.payload["nextAction"], "session spawn");
        assert_eq!(out.payload["autoRemediate"]["steps"].as_array().unwrap().len(), 2);
    }
}
