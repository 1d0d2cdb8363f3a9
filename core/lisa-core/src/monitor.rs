//! `session monitor`: poll a session until it reaches a stop condition.
//!
//! Each poll runs a full status computation. The loop stops on the first of:
//! the `--until-marker` text appearing in the pane, a terminal state, the
//! `--until-state` target, a waiting prompt (when `stop_on_waiting`), the poll
//! cap, or the absolute timeout.
//!
//! ## Exit codes
//!
//! `0` for `completed`, `marker_found`, `until_state`, and `waiting_input*`
//! reasons; `2` for every other stop, including an unmet `--expect`.

use crate::capture::{filter_capture_noise, trim_lines};
use crate::command::{fail, fail_for, obj, Target};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::events::append_lifecycle_event;
use crate::meta::{parse_agent_hint, parse_mode_hint};
use crate::status::{compute_session_status, StatusRequest};
use crate::types::{MonitorResult, SessionStatus, DEFAULT_MAX_POLLS, DEFAULT_POLL_INTERVAL_SECONDS};
use crate::classifier::normalize_status;
use lisa_protocol::{CommandOutput, Payload, SessionState};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lines captured when looking for `--until-marker` and computing offsets.
pub const MONITOR_CAPTURE_LINES: usize = 320;

/// Which stop reasons count as the outcome the caller expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expect {
    #[default]
    Any,
    Terminal,
    Marker,
}

impl Expect {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "any" => Ok(Expect::Any),
            "terminal" => Ok(Expect::Terminal),
            "marker" => Ok(Expect::Marker),
            _ => Err(LisaError::invalid(
                "invalid_expect",
                format!("invalid --expect: {raw} (expected any|terminal|marker)"),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Expect::Any => "any",
            Expect::Terminal => "terminal",
            Expect::Marker => "marker",
        }
    }

    pub fn satisfied_by(&self, reason: &str) -> bool {
        match self {
            Expect::Any => true,
            Expect::Terminal => matches!(reason, "completed" | "crashed" | "stuck" | "not_found"),
            Expect::Marker => reason == "marker_found",
        }
    }
}

impl fmt::Display for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct MonitorRequest {
    pub target: Target,
    pub agent_hint: String,
    pub mode_hint: String,
    pub expect: Expect,
    pub poll_interval_seconds: u64,
    pub max_polls: u64,
    /// Absolute wall-clock cap; 0 disables it.
    pub timeout_seconds: u64,
    pub stop_on_waiting: bool,
    pub waiting_requires_turn_complete: bool,
    pub until_state: Option<SessionState>,
    /// `Some("")` is rejected as an invalid flag value.
    pub until_marker: Option<String>,
    pub json_min: bool,
}

impl Default for MonitorRequest {
    fn default() -> Self {
        Self {
            target: Target::default(),
            agent_hint: "auto".to_string(),
            mode_hint: "auto".to_string(),
            expect: Expect::Any,
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
            max_polls: DEFAULT_MAX_POLLS,
            timeout_seconds: 0,
            stop_on_waiting: true,
            waiting_requires_turn_complete: false,
            until_state: None,
            until_marker: None,
            json_min: false,
        }
    }
}

/// A finished monitor run.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorOutcome {
    pub result: MonitorResult,
    pub project_root: String,
    pub error_code: Option<String>,
    pub exit_code: i32,
}

fn is_success_reason(reason: &str) -> bool {
    matches!(reason, "completed" | "marker_found" | "until_state") || reason.starts_with("waiting_input")
}

fn validate(req: &MonitorRequest) -> Result<()> {
    req.target.require_session()?;
    let marker = req.until_marker.as_deref().map(str::trim);
    if marker == Some("") {
        return Err(LisaError::invalid(
            "invalid_until_marker",
            "invalid --until-marker: cannot be empty",
        ));
    }
    if req.expect == Expect::Marker && marker.is_none() {
        return Err(LisaError::invalid(
            "expect_marker_requires_until_marker",
            "--expect marker requires --until-marker",
        ));
    }
    if req.poll_interval_seconds == 0 {
        return Err(LisaError::invalid("invalid_poll_interval", "invalid --poll-interval"));
    }
    if req.max_polls == 0 {
        return Err(LisaError::invalid("invalid_max_polls", "invalid --max-polls"));
    }
    Ok(())
}

/// Length of the noise-filtered pane tail; the offset a delta capture resumes from.
pub fn capture_next_offset(engine: &Engine, session: &str) -> usize {
    if session.trim().is_empty() || !engine.tmux.has_session(session) {
        return 0;
    }
    match engine.tmux.capture_pane(session, MONITOR_CAPTURE_LINES) {
        Ok(capture) => filter_capture_noise(&trim_lines(&capture).join("\n")).len(),
        Err(_) => 0,
    }
}

fn stop_reason(engine: &Engine, req: &MonitorRequest, status: &SessionStatus) -> Option<String> {
    if let Some(marker) = req.until_marker.as_deref().map(str::trim) {
        if let Ok(capture) = engine.tmux.capture_pane(&status.session, MONITOR_CAPTURE_LINES) {
            if capture.contains(marker) {
                return Some("marker_found".into());
            }
        }
    }
    let state = SessionState::parse(&status.session_state)?;
    match state {
        SessionState::Completed
        | SessionState::Crashed
        | SessionState::NotFound
        | SessionState::Stuck => return Some(state.as_str().to_string()),
        _ => {}
    }
    if req.until_state == Some(state) {
        return Some("until_state".into());
    }
    if state == SessionState::WaitingInput && req.stop_on_waiting {
        return Some(if req.waiting_requires_turn_complete {
            "waiting_input_turn_complete".into()
        } else {
            "waiting_input".into()
        });
    }
    None
}

/// Runs the poll loop. `sleep` is called between polls.
pub fn run_monitor(
    engine: &Engine,
    req: &MonitorRequest,
    sleep: &mut dyn FnMut(Duration),
) -> Result<MonitorOutcome> {
    validate(req)?;
    let agent_hint = parse_agent_hint(&req.agent_hint)?;
    let mode_hint = parse_mode_hint(&req.mode_hint)?;
    let session = req.target.session.clone();
    let root = req.target.resolve_root(engine)?;
    let _scope = engine.runtime_scope(&root);

    let started = engine.now();
    let mut last = SessionStatus::default();
    let mut degraded_polls = 0u64;
    let mut polls = 0u64;
    let mut timed_out = false;

    for poll in 1..=req.max_polls {
        polls = poll;
        let status_req = StatusRequest {
            session: session.clone(),
            project_root: root.clone(),
            agent_hint: agent_hint.clone(),
            mode_hint: mode_hint.clone(),
            poll,
            full: true,
            require_turn_complete: req.waiting_requires_turn_complete,
        };
        let status = compute_session_status(engine, &status_req)
            .map_err(|e| LisaError::coded("status_compute_failed", e.to_string()))?;
        if status.session_state == SessionState::Degraded.as_str() {
            degraded_polls += 1;
        }
        debug!(
            session = %session,
            poll,
            state = %status.session_state,
            reason = %status.classification_reason,
            "monitor poll"
        );

        if let Some(reason) = stop_reason(engine, req, &status) {
            let met = req.expect.satisfied_by(&reason);
            let exit_reason = if met {
                reason.clone()
            } else {
                format!("expected_{}_got_{}", req.expect, reason)
            };
            let state = SessionState::parse(&status.session_state).unwrap_or(SessionState::Degraded);
            let result = MonitorResult {
                final_state: status.session_state.clone(),
                session: status.session.clone(),
                todos_done: status.todos_done,
                todos_total: status.todos_total,
                output_file: status.output_file.clone(),
                next_offset: capture_next_offset(engine, &session),
                exit_reason,
                polls: poll,
                final_status: normalize_status(state, &status.status),
            };
            let (error_code, exit_code) = if !met {
                (Some("monitor_expectation_mismatch".to_string()), 2)
            } else if is_success_reason(&reason) {
                (None, 0)
            } else {
                (Some(format!("monitor_{reason}")), 2)
            };
            return Ok(finish(engine, &root, result, error_code, exit_code));
        }
        last = status;

        if poll < req.max_polls {
            if deadline_passed(engine, req, started) {
                timed_out = true;
                break;
            }
            sleep(Duration::from_secs(req.poll_interval_seconds));
            if deadline_passed(engine, req, started) {
                timed_out = true;
                break;
            }
        }
    }

    let exit_reason = if timed_out {
        "timeout"
    } else if degraded_polls == polls && polls > 0 {
        "degraded_max_polls_exceeded"
    } else {
        "max_polls_exceeded"
    };
    let result = MonitorResult {
        final_state: "timeout".to_string(),
        session: session.clone(),
        todos_done: last.todos_done,
        todos_total: last.todos_total,
        output_file: last.output_file.clone(),
        next_offset: capture_next_offset(engine, &session),
        exit_reason: exit_reason.to_string(),
        polls,
        final_status: "timeout".to_string(),
    };
    Ok(finish(engine, &root, result, Some("monitor_timeout".to_string()), 2))
}

fn deadline_passed(engine: &Engine, req: &MonitorRequest, started: chrono::DateTime<chrono::Utc>) -> bool {
    req.timeout_seconds > 0 && (engine.now() - started).num_seconds() >= req.timeout_seconds as i64
}

fn finish(
    engine: &Engine,
    root: &str,
    result: MonitorResult,
    error_code: Option<String>,
    exit_code: i32,
) -> MonitorOutcome {
    if let Err(err) = append_lifecycle_event(
        engine,
        root,
        &result.session,
        "lifecycle",
        &result.final_state,
        &result.final_status,
        &format!("monitor_{}", result.exit_reason),
    ) {
        warn!(session = %result.session, error = %err, "failed to record monitor outcome");
    }
    info!(
        session = %result.session,
        final_state = %result.final_state,
        exit_reason = %result.exit_reason,
        polls = result.polls,
        "monitor finished"
    );
    MonitorOutcome {
        result,
        project_root: root.to_string(),
        error_code,
        exit_code,
    }
}

pub fn monitor_payload(outcome: &MonitorOutcome, json_min: bool) -> Payload {
    let result = &outcome.result;
    let mut payload = if json_min {
        let mut min = obj(json!({
            "session": result.session,
            "finalState": result.final_state,
            "exitReason": result.exit_reason,
            "polls": result.polls,
        }));
        if result.next_offset > 0 {
            min.insert("nextOffset".into(), Value::from(result.next_offset));
        }
        min
    } else {
        let mut full = obj(serde_json::to_value(result).unwrap_or(Value::Null));
        full.insert("projectRoot".into(), Value::String(outcome.project_root.clone()));
        full
    };
    payload.insert("ok".into(), Value::Bool(outcome.exit_code == 0));
    if let Some(code) = &outcome.error_code {
        payload.insert("errorCode".into(), Value::String(code.clone()));
    }
    payload
}

/// Monitor with real sleeps between polls.
pub fn monitor_command(engine: &Engine, req: &MonitorRequest) -> CommandOutput {
    monitor_command_with(engine, req, &mut std::thread::sleep)
}

pub fn monitor_command_with(
    engine: &Engine,
    req: &MonitorRequest,
    sleep: &mut dyn FnMut(Duration),
) -> CommandOutput {
    match run_monitor(engine, req, sleep) {
        Ok(outcome) => CommandOutput::with_exit(monitor_payload(&outcome, req.json_min), outcome.exit_code),
        Err(err @ LisaError::AmbiguousProjectRoot { .. }) => {
            fail_for(&err, &req.target.session, &req.target.project_root)
        }
        Err(err) => fail(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::read_session_event_tail;
    use crate::process::AgentProcess;
    use crate::testing::{FakeTmuxAdapter, FixedClock};
    use chrono::Utc;
    use lisa_protocol::str_field;
    use std::sync::Arc;
    use tempfile::TempDir;

    const ROOT: &str = "/missing/lisa-monitor-root";

    fn setup() -> (TempDir, Engine, Arc<FakeTmuxAdapter>, Arc<FixedClock>) {
        let tmp = TempDir::new().unwrap();
        let (engine, tmux, clock) = Engine::with_fakes(tmp.path(), Utc::now());
        (tmp, engine, tmux, clock)
    }

    fn request(session: &str) -> MonitorRequest {
        MonitorRequest {
            target: Target::new(session, ROOT),
            poll_interval_seconds: 1,
            max_polls: 5,
            ..MonitorRequest::default()
        }
    }

    fn no_sleep() -> impl FnMut(Duration) {
        |_| {}
    }

    #[test]
    fn test_completed_session_exits_zero() {
        let (_tmp, engine, tmux, _) = setup();
        tmux.add_session("job-exec", "work\n__LISA_EXEC_DONE__:0\n$ ");
        let out = monitor_command_with(&engine, &request("job-exec"), &mut no_sleep());
        assert_eq!(out.exit_code, 0);
        assert_eq!(str_field(&out.payload, "exitReason"), "completed");
        assert_eq!(str_field(&out.payload, "finalStatus"), "completed");
        assert!(out.error_code().is_none());

        let tail = read_session_event_tail(&engine, ROOT, "job-exec", 10).unwrap();
        let last = tail.events.last().unwrap();
        assert_eq!(last.kind, "lifecycle");
        assert_eq!(last.reason, "monitor_completed");
    }

    #[test]
    fn test_missing_session_stops_with_code() {
        let (_tmp, engine, _, _) = setup();
        let out = monitor_command_with(&engine, &request("ghost"), &mut no_sleep());
        assert_eq!(out.exit_code, 2);
        assert_eq!(out.error_code(), Some("monitor_not_found"));
        assert_eq!(str_field(&out.payload, "finalState"), "not_found");
    }

    #[test]
    fn test_marker_found_and_expectation() {
        let (_tmp, engine, tmux, _) = setup();
        tmux.add_session("s1", "step one\nREADY_FOR_REVIEW\n");
        tmux.set_agent("s1", Some(AgentProcess { pid: 5, cpu: 4.0 }));
        let mut req = request("s1");
        req.expect = Expect::Marker;
        req.until_marker = Some("READY_FOR_REVIEW".into());
        let out = monitor_command_with(&engine, &req, &mut no_sleep());
        assert_eq!(out.exit_code, 0);
        assert_eq!(str_field(&out.payload, "exitReason"), "marker_found");

        let mut req = request("job-exec");
        tmux.add_session("job-exec", "__LISA_EXEC_DONE__:0\n");
        req.expect = Expect::Marker;
        req.until_marker = Some("NEVER".into());
        let out = monitor_command_with(&engine, &req, &mut no_sleep());
        assert_eq!(out.exit_code, 2);
        assert_eq!(str_field(&out.payload, "exitReason"), "expected_marker_got_completed");
        assert_eq!(out.error_code(), Some("monitor_expectation_mismatch"));
    }

    #[test]
    fn test_max_polls_and_timeout() {
        let (_tmp, engine, tmux, clock) = setup();
        tmux.add_session("s1", "busy");
        tmux.set_agent("s1", Some(AgentProcess { pid: 5, cpu: 4.0 }));
        let mut sleeps = 0;
        let out = monitor_command_with(&engine, &request("s1"), &mut |_: Duration| sleeps += 1);
        assert_eq!(out.exit_code, 2);
        assert_eq!(str_field(&out.payload, "exitReason"), "max_polls_exceeded");
        assert_eq!(out.payload["polls"], 5);
        assert_eq!(sleeps, 4);

        let mut req = request("s1");
        req.max_polls = 100;
        req.poll_interval_seconds = 10;
        req.timeout_seconds = 25;
        let out = monitor_command_with(&engine, &req, &mut |d: Duration| clock.advance_seconds(d.as_secs() as i64));
        assert_eq!(str_field(&out.payload, "exitReason"), "timeout");
        assert_eq!(out.error_code(), Some("monitor_timeout"));
        assert_eq!(out.payload["polls"], 3);
    }

    #[test]
    fn test_waiting_input_stops_unless_disabled() {
        let (_tmp, engine, tmux, _) = setup();
        tmux.add_session("lisa-claude-w", "done thinking\n❯ ");
        tmux.set_agent("lisa-claude-w", Some(AgentProcess { pid: 8, cpu: 0.0 }));
        let out = monitor_command_with(&engine, &request("lisa-claude-w"), &mut no_sleep());
        assert_eq!(out.exit_code, 0);
        assert_eq!(str_field(&out.payload, "exitReason"), "waiting_input");

        let mut req = request("lisa-claude-w");
        req.stop_on_waiting = false;
        req.max_polls = 2;
        let out = monitor_command_with(&engine, &req, &mut no_sleep());
        assert_eq!(str_field(&out.payload, "exitReason"), "max_polls_exceeded");
    }

    #[test]
    fn test_until_state_stops_on_match() {
        let (_tmp, engine, tmux, _) = setup();
        tmux.add_session("s1", "busy");
        tmux.set_agent("s1", Some(AgentProcess { pid: 5, cpu: 4.0 }));
        let mut req = request("s1");
        req.until_state = Some(SessionState::InProgress);
        req.json_min = true;
        let out = monitor_command_with(&engine, &req, &mut no_sleep());
        assert_eq!(out.exit_code, 0);
        assert_eq!(str_field(&out.payload, "exitReason"), "until_state");
        assert!(out.payload.get("todosDone").is_none());
    }

    #[test]
    fn test_flag_validation() {
        let (_tmp, engine, _, _) = setup();
        let mut req = request("s1");
        req.until_marker = Some("  ".into());
        assert_eq!(
            monitor_command_with(&engine, &req, &mut no_sleep()).error_code(),
            Some("invalid_until_marker")
        );
        let mut req = request("s1");
        req.expect = Expect::Marker;
        assert_eq!(
            monitor_command_with(&engine, &req, &mut no_sleep()).error_code(),
            Some("expect_marker_requires_until_marker")
        );
        assert_eq!(Expect::parse("bogus").unwrap_err().code(), "invalid_expect");
    }
}
