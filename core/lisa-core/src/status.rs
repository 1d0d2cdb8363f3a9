//! Session status computation.
//!
//! Gathers signals from tmux and the session's files, runs the
//! [`crate::classifier`], persists classifier bookkeeping under the state
//! lock, and appends a `transition` or `snapshot` event.
//!
//! Read failures never abort the computation; they surface as a `degraded`
//! status with the error recorded in [`StatusSignals`].

use crate::capture::{
    estimate_wait, extract_active_task, is_shell_command, looks_like_prompt_waiting,
    normalize_capture, parse_done_file, parse_exec_completion, parse_session_completion_for_run,
    parse_todos, tail_lines, trim_lines, RunCompletion,
};
use crate::classifier::{classify, normalize_status, Classification, Observation};
use crate::clock::format_utc_nanos;
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::events::append_session_event;
use crate::lock::{acquire, lock_path_for, LockMode};
use crate::meta::{load_classifier_state, load_session_meta, resolve_agent, resolve_mode, save_classifier_state};
use crate::paths::md5_hex8;
use crate::storage::{read_optional, write_file_atomic};
use crate::types::{ClassifierState, SessionEvent, SessionMeta, SessionStatus, DEFAULT_CAPTURE_LINES};
use chrono::{DateTime, Utc};
use lisa_protocol::{Payload, SessionState};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

/// Agent CPU share at or above which the agent counts as busy.
const BUSY_CPU_THRESHOLD: f64 = 0.2;
/// Lines kept in the output file written for terminal states.
const OUTPUT_FILE_LINES: usize = 260;

#[derive(Debug, Clone, Default)]
pub struct StatusRequest {
    pub session: String,
    pub project_root: String,
    pub agent_hint: String,
    pub mode_hint: String,
    /// Explicit poll number; 0 increments the stored counter.
    pub poll: u64,
    /// Write the output file for terminal states.
    pub full: bool,
    pub require_turn_complete: bool,
}

impl StatusRequest {
    pub fn new(session: &str, project_root: &str) -> Self {
        Self {
            session: session.to_string(),
            project_root: project_root.to_string(),
            ..Self::default()
        }
    }
}

fn initial_status(engine: &Engine, session: &str) -> SessionStatus {
    SessionStatus {
        session: session.to_string(),
        status: "idle".to_string(),
        session_state: SessionState::Degraded.as_str().to_string(),
        wait_estimate: 30,
        heartbeat_age: -1,
        heartbeat_fresh_secs: engine.config.heartbeat_stale_seconds,
        output_fresh_seconds: engine.config.output_stale_seconds,
        classification_reason: "initializing".to_string(),
        ..SessionStatus::default()
    }
}

fn apply(status: &mut SessionStatus, result: Classification) {
    status.session_state = result.state.as_str().to_string();
    status.status = result.status.to_string();
    status.classification_reason = result.reason.to_string();
}

fn degrade(status: &mut SessionStatus, reason: &str, error: &str) {
    status.status = "idle".to_string();
    status.session_state = SessionState::Degraded.as_str().to_string();
    status.wait_estimate = 0;
    status.classification_reason = reason.to_string();
    status.signals.tmux_read_error = error.to_string();
}

pub fn status_event(engine: &Engine, kind: &str, poll: u64, status: &SessionStatus) -> SessionEvent {
    SessionEvent {
        at: format_utc_nanos(engine.now()),
        kind: kind.to_string(),
        session: status.session.clone(),
        state: status.session_state.clone(),
        status: status.status.clone(),
        reason: status.classification_reason.clone(),
        poll,
        signals: status.signals.clone(),
    }
}

fn record_event(engine: &Engine, root: &str, kind: &str, poll: u64, status: &mut SessionStatus) {
    let event = status_event(engine, kind, poll, status);
    if let Err(err) = append_session_event(engine, root, &status.session, &event) {
        warn!(session = %status.session, error = %err, "failed to append status event");
        status.signals.events_write_error = err.to_string();
    }
}

fn heartbeat_age(path: &Path, now: DateTime<Utc>) -> Option<i64> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    let modified: DateTime<Utc> = modified.into();
    Some((now - modified).num_seconds().max(0))
}

fn read_done_file(
    engine: &Engine,
    root: &str,
    session: &str,
    run_id: &str,
) -> std::result::Result<RunCompletion, String> {
    let path = engine.paths.done_file(root, session);
    let content = read_optional(&path).map_err(|e| e.to_string())?;
    let Some(content) = content else {
        return Ok(RunCompletion::default());
    };
    parse_done_file(&content, run_id).map_err(|_| {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        format!("invalid done file marker in {name}")
    })
}

fn agent_display_name(agent: &str) -> &'static str {
    if agent == "codex" {
        "Codex"
    } else {
        "Claude"
    }
}

/// Classifies one session. See the module docs for failure behavior.
pub fn compute_session_status(engine: &Engine, req: &StatusRequest) -> Result<SessionStatus> {
    let session = req.session.trim();
    if session.is_empty() {
        return Err(LisaError::MissingRequiredFlag {
            flag: "--session".to_string(),
        });
    }
    let root = req.project_root.as_str();
    let mut status = initial_status(engine, session);
    let _scope = engine.runtime_scope(root);

    if !engine.tmux.has_session(session) {
        apply(&mut status, classify(&Observation::default()));
        status.wait_estimate = 0;
        return Ok(status);
    }

    let (meta, meta_readable) = match load_session_meta(engine, root, session) {
        Ok(meta) => (meta.unwrap_or_default(), true),
        Err(err) => {
            status.signals.meta_read_error = err.to_string();
            (SessionMeta::default(), false)
        }
    };
    let state_path = engine.paths.state_file(root, session);
    let (hint, _) = load_classifier_state(&state_path);
    let agent = resolve_agent(engine, &req.agent_hint, &meta, session, &hint.last_resolved_agent);
    let mode = resolve_mode(engine, &req.mode_hint, &meta, session, &hint.last_resolved_mode);
    status.agent = agent.clone();
    status.mode = mode.clone();
    status.signals.run_id = meta.run_id.clone();
    let interactive = mode == "interactive";
    let poll_hint = if req.poll > 0 {
        req.poll
    } else {
        hint.poll_count + 1
    };

    let mut done_file = RunCompletion::default();
    if meta_readable {
        match read_done_file(engine, root, session, &meta.run_id) {
            Ok(done) => done_file = done,
            Err(err) => status.signals.done_file_read_error = err,
        }
    }
    status.signals.done_file_seen =
        done_file.done || done_file.run_mismatch || !done_file.run_id.is_empty();
    status.signals.done_file_run_id = done_file.run_id.clone();
    status.signals.done_file_run_mismatch = done_file.run_mismatch;
    status.signals.done_file_exit_code = done_file.exit_code;
    let done_file_exit = done_file.done.then_some(done_file.exit_code);

    let snapshot = match engine.tmux.pane_snapshot(session) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            degrade(&mut status, "tmux_snapshot_error", &err.to_string());
            if req.poll > 0 {
                record_event(engine, root, "transition", poll_hint, &mut status);
            }
            return Ok(status);
        }
    };
    status.pane_status = snapshot.status_label();
    status.pane_command = snapshot.current_command.clone();

    let raw_capture = match engine.tmux.capture_pane(session, DEFAULT_CAPTURE_LINES) {
        Ok(capture) => capture,
        Err(err) => {
            let obs = Observation {
                session_exists: true,
                pane_status: status.pane_status.clone(),
                done_file_exit,
                capture_error: true,
                ..Observation::default()
            };
            apply(&mut status, classify(&obs));
            status.wait_estimate = 0;
            status.signals.tmux_read_error = err.to_string();
            if req.poll > 0 {
                record_event(engine, root, "transition", poll_hint, &mut status);
            }
            return Ok(status);
        }
    };
    let capture = normalize_capture(&raw_capture);

    let (todos_done, todos_total) = parse_todos(&capture);
    status.todos_done = todos_done;
    status.todos_total = todos_total;
    status.active_task = extract_active_task(&capture);
    status.wait_estimate = estimate_wait(&status.active_task, todos_done, todos_total);

    let (exec_seen, exec_exit) = parse_exec_completion(&capture);
    let marker = parse_session_completion_for_run(&capture, &meta.run_id);
    status.signals.exec_marker_seen = exec_seen;
    status.signals.exec_exit_code = exec_exit;
    status.signals.session_marker_seen =
        marker.done || marker.run_mismatch || !marker.run_id.is_empty();
    status.signals.session_marker_run_id = marker.run_id.clone();
    status.signals.session_marker_run_mismatch = marker.run_mismatch;
    status.signals.session_exit_code = if done_file.done {
        done_file.exit_code
    } else {
        marker.exit_code
    };
    let session_marker_exit = (marker.done && meta_readable).then_some(marker.exit_code);

    let pane_pid = match snapshot.pid() {
        Ok(pid) => pid.unwrap_or(0),
        Err(err) => {
            degrade(&mut status, "tmux_pane_pid_parse_error", &err);
            if req.poll > 0 {
                record_event(engine, root, "transition", poll_hint, &mut status);
            }
            return Ok(status);
        }
    };

    let now = engine.now();
    let now_secs = now.timestamp();
    let use_cached_scan = hint.last_agent_probe_at > 0
        && now_secs - hint.last_agent_probe_at < engine.config.process_scan_interval_seconds;
    let mut agent_pid = hint.last_agent_pid;
    let mut agent_cpu = hint.last_agent_cpu;
    let mut scan_error = None;
    if use_cached_scan {
        status.signals.agent_scan_cached = true;
    } else {
        match engine.tmux.agent_process(pane_pid, &agent) {
            Ok(found) => {
                agent_pid = found.map(|p| p.pid).unwrap_or(0);
                agent_cpu = found.map(|p| p.cpu).unwrap_or(0.0);
            }
            Err(err) => {
                status.signals.agent_scan_error = err.to_string();
                scan_error = Some("agent_scan_error");
                agent_pid = 0;
                agent_cpu = 0.0;
            }
        }
    }
    status.agent_pid = agent_pid;
    status.agent_cpu = agent_cpu;
    status.signals.agent_process_detected = agent_pid > 0;

    let hb_age = heartbeat_age(&engine.paths.heartbeat_file(root, session), now);
    if let Some(age) = hb_age {
        status.heartbeat_age = age;
    }
    let heartbeat_fresh = hb_age.map_or(false, |age| age <= status.heartbeat_fresh_secs);
    status.signals.heartbeat_seen = hb_age.is_some();
    status.signals.heartbeat_fresh = heartbeat_fresh;

    let pane_is_shell = is_shell_command(&status.pane_command);
    status.signals.pane_is_shell = pane_is_shell;
    let prompt_waiting = interactive && looks_like_prompt_waiting(&agent, &capture);

    let lock = match acquire(
        &lock_path_for(&state_path),
        LockMode::Exclusive,
        engine.config.state_lock_timeout_ms,
        "state lock",
    ) {
        Ok(lock) => lock,
        Err(err) if err.is_lock_timeout() => {
            status.status = "idle".to_string();
            status.session_state = SessionState::Degraded.as_str().to_string();
            status.wait_estimate = 0;
            status.classification_reason = "state_lock_timeout".to_string();
            status.signals.state_lock_timed_out = true;
            if let LisaError::LockTimeout { waited_ms, .. } = err {
                status.signals.state_lock_wait_ms = waited_ms;
            }
            record_event(engine, root, "transition", poll_hint, &mut status);
            return Ok(status);
        }
        Err(err) => return Err(err),
    };
    status.signals.state_lock_wait_ms = lock.waited_ms();

    let (mut state, state_err) = load_classifier_state(&state_path);
    if let Some(err) = state_err {
        status.signals.state_read_error = err;
        state = ClassifierState::default();
    }
    let previous_agent_pid = state.last_agent_pid;
    state.last_agent_pid = agent_pid;
    state.last_agent_cpu = agent_cpu;
    state.last_resolved_agent = agent.clone();
    state.last_resolved_mode = mode.clone();
    if !use_cached_scan {
        state.last_agent_probe_at = now_secs;
    }

    let observed_at = now.timestamp_nanos_opt().unwrap_or(i64::MAX);
    let mut output_at = state.last_output_at_nanos;
    if output_at == 0 && state.last_output_at > 0 {
        output_at = state.last_output_at.saturating_mul(1_000_000_000);
    }
    let hash = md5_hex8(&capture);
    let output_advancing = !state.last_output_hash.is_empty() && hash != state.last_output_hash;
    if hash != state.last_output_hash && observed_at > output_at {
        state.last_output_hash = hash;
        output_at = observed_at;
        state.last_output_at_nanos = observed_at;
        state.last_output_at = observed_at / 1_000_000_000;
    }
    if output_at == 0 {
        output_at = observed_at;
        state.last_output_at_nanos = observed_at;
        state.last_output_at = observed_at / 1_000_000_000;
    }
    let output_age = ((observed_at - output_at) / 1_000_000_000).max(0);
    let output_fresh = output_age <= engine.config.output_stale_seconds;
    status.output_age_seconds = output_age;
    status.signals.output_fresh = output_fresh;
    status.signals.output_advancing = output_advancing;

    let interactive_waiting =
        interactive && agent_pid > 0 && agent_cpu < BUSY_CPU_THRESHOLD && !output_fresh;
    let agent_busy = agent_pid > 0 && agent_cpu >= BUSY_CPU_THRESHOLD;
    let turn_complete = marker.done
        || exec_seen
        || (state.last_input_at_nanos > 0
            && state.last_output_at_nanos > state.last_input_at_nanos
            && prompt_waiting);
    status.signals.interactive_waiting = interactive_waiting;
    status.signals.prompt_waiting = prompt_waiting;
    status.signals.active_process_busy = agent_busy;
    status.signals.turn_complete = turn_complete;

    let poll_count = if req.poll > 0 {
        req.poll
    } else {
        state.poll_count + 1
    };
    let soft_error = if !status.signals.done_file_read_error.is_empty() {
        Some("done_file_read_error")
    } else {
        scan_error
    };
    let obs = Observation {
        session_exists: true,
        interactive,
        pane_status: status.pane_status.clone(),
        pane_is_shell,
        done_file_exit,
        session_marker_exit,
        exec_marker_exit: exec_seen.then_some(exec_exit),
        marker_run_mismatch: marker.run_mismatch || done_file.run_mismatch,
        agent_pid,
        previous_agent_pid,
        agent_busy,
        heartbeat_seen: hb_age.is_some(),
        heartbeat_fresh,
        output_fresh,
        output_advancing,
        prompt_waiting,
        interactive_waiting,
        transcript_turn_complete: false,
        require_turn_complete: req.require_turn_complete,
        turn_complete,
        capture_error: false,
        soft_error,
        previous_state: SessionState::parse(&state.last_session_state),
        poll_count,
    };
    let result = classify(&obs);
    apply(&mut status, result);
    if result.state == SessionState::InProgress {
        state.has_ever_been_active = true;
    }

    let changed = state.last_session_state != status.session_state
        || state.last_status != status.status
        || state.last_classification_reason != status.classification_reason;
    let kind = if changed { "transition" } else { "snapshot" };
    state.poll_count = poll_count;
    state.last_session_state = status.session_state.clone();
    state.last_status = status.status.clone();
    state.last_classification_reason = status.classification_reason.clone();
    if let Err(err) = save_classifier_state(&state_path, &state) {
        warn!(session = %session, error = %err, "failed to save classifier state");
        status.signals.state_read_error = err.to_string();
    }
    drop(lock);

    record_event(engine, root, kind, poll_count, &mut status);
    debug!(
        session = %session,
        state = %status.session_state,
        reason = %status.classification_reason,
        poll = poll_count,
        "classified session"
    );

    if req.full
        && matches!(
            result.state,
            SessionState::Completed
                | SessionState::Crashed
                | SessionState::Stuck
                | SessionState::Degraded
        )
    {
        match write_output_file(engine, root, session, &raw_capture) {
            Ok(path) => status.output_file = path,
            Err(err) => warn!(session = %session, error = %err, "failed to write output file"),
        }
    }

    if status.status == "active" && status.active_task.is_empty() {
        status.active_task = format!("{} running", agent_display_name(&agent));
    }
    if status.status == "idle" {
        status.wait_estimate = 0;
    }
    Ok(status)
}

/// Writes the last lines of the pane to the session's output file.
pub fn write_output_file(engine: &Engine, root: &str, session: &str, capture: &str) -> Result<String> {
    let lines = tail_lines(&trim_lines(capture), OUTPUT_FILE_LINES);
    let path = engine.paths.output_file(root, session);
    write_file_atomic(&path, lines.join("\n").as_bytes())?;
    Ok(path.to_string_lossy().to_string())
}

/// Records the time of the latest input so turn completion can be detected.
pub fn record_session_input(engine: &Engine, root: &str, session: &str) -> Result<()> {
    let path = engine.paths.state_file(root, session);
    let _lock = acquire(
        &lock_path_for(&path),
        LockMode::Exclusive,
        engine.config.state_lock_timeout_ms,
        "state lock",
    )?;
    let (mut state, _) = load_classifier_state(&path);
    let now = engine.now();
    state.last_input_at = now.timestamp();
    state.last_input_at_nanos = now.timestamp_nanos_opt().unwrap_or(i64::MAX);
    save_classifier_state(&path, &state)
}

/// Folds a capture taken outside of status into the output bookkeeping.
///
/// Hashes the same normalized tail a status poll hashes, so capturing an
/// unchanged pane does not register as new output. Returns the recorded
/// last-output time in nanoseconds.
pub fn record_capture_output(engine: &Engine, root: &str, session: &str, raw_capture: &str) -> Result<i64> {
    let tail = tail_lines(&trim_lines(raw_capture), DEFAULT_CAPTURE_LINES).join("\n");
    let hash = md5_hex8(&normalize_capture(&tail));
    let path = engine.paths.state_file(root, session);
    let _lock = acquire(
        &lock_path_for(&path),
        LockMode::Exclusive,
        engine.config.state_lock_timeout_ms,
        "state lock",
    )?;
    let (mut state, _) = load_classifier_state(&path);
    if state.last_output_hash == hash {
        return Ok(state.last_output_at_nanos);
    }
    let now = engine.now();
    state.last_output_hash = hash;
    state.last_output_at = now.timestamp();
    state.last_output_at_nanos = now.timestamp_nanos_opt().unwrap_or(i64::MAX);
    save_classifier_state(&path, &state)?;
    debug!(session = %session, "capture recorded new output");
    Ok(state.last_output_at_nanos)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Payloads
// ═══════════════════════════════════════════════════════════════════════════════

/// Full status payload with the reported status normalized for terminal states.
pub fn status_payload(status: &SessionStatus, project_root: &str) -> Payload {
    let mut payload = match serde_json::to_value(status) {
        Ok(Value::Object(map)) => map,
        _ => Payload::new(),
    };
    let state = SessionState::parse(&status.session_state).unwrap_or(SessionState::Degraded);
    payload.insert(
        "status".into(),
        Value::String(normalize_status(state, &status.status)),
    );
    payload.insert("projectRoot".into(), Value::String(project_root.to_string()));
    payload
}

/// `{session, status, sessionState, todosDone, todosTotal, waitEstimate}`.
pub fn status_min_payload(status: &SessionStatus) -> Payload {
    let state = SessionState::parse(&status.session_state).unwrap_or(SessionState::Degraded);
    let mut payload = Payload::new();
    payload.insert("session".into(), Value::String(status.session.clone()));
    payload.insert(
        "status".into(),
        Value::String(normalize_status(state, &status.status)),
    );
    payload.insert("sessionState".into(), Value::String(status.session_state.clone()));
    payload.insert("todosDone".into(), Value::from(status.todos_done));
    payload.insert("todosTotal".into(), Value::from(status.todos_total));
    payload.insert("waitEstimate".into(), Value::from(status.wait_estimate));
    payload
}
