//! Single-session commands: `status`, `explain`, `snapshot`, `next`,
//! `capture`, and `send`.
//!
//! Every builder resolves the session's project root first and runs tmux
//! calls inside that root's runtime scope. A missing tmux session is not an
//! error for the read-only commands; they report `sessionState=not_found`
//! and an `errorCode`, exiting non-zero only where the command promises to.

use crate::capture::{
    apply_capture_delta, build_capture_marker_summary, extract_semantic_lines, filter_capture_noise,
    parse_capture_markers, parse_delta_from, shell_quote, trim_lines, compute_semantic_delta,
    CaptureDelta, CaptureMarkerSummary, DeltaFrom,
};
use crate::classifier::normalize_status;
use crate::command::{obj, run, Target};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::events::{
    append_lifecycle_event, read_session_event_tail, read_session_events_since, EventCursor, HandoffItem,
};
use crate::meta::{load_session_meta, parse_agent_hint, parse_mode_hint};
use crate::payload::{
    apply_redaction_rules, load_cursor_offset, load_semantic_cursor, parse_projection_fields,
    parse_redaction_rules, project_payload_fields, resolve_file_flag, save_semantic_cursor,
    semantic_cursor_path, truncate_to_token_budget, write_cursor_offset,
};
use crate::registry::objective::{objective_payload_from_meta, objective_reminder_prefix, objective_reminder_present};
use crate::status::{compute_session_status, record_capture_output, record_session_input, status_min_payload, status_payload, StatusRequest};
use crate::types::{SessionMeta, SessionStatus};
use lisa_protocol::{CommandOutput, Payload, SessionState};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Default `--lines` for `capture` and `snapshot`.
pub const DEFAULT_CAPTURE_REQUEST_LINES: usize = 200;
pub const DEFAULT_EXPLAIN_EVENTS: usize = 10;
pub const DEFAULT_NEXT_BUDGET: i64 = 480;
/// Default `--token-budget` for `capture --summary`.
pub const DEFAULT_SUMMARY_TOKEN_BUDGET: i64 = 320;

// ═══════════════════════════════════════════════════════════════════════════════
// Shared
// ═══════════════════════════════════════════════════════════════════════════════

/// Status with `status` normalized to the state name for terminal states.
pub fn normalized_status(mut status: SessionStatus) -> SessionStatus {
    if let Some(state) = SessionState::parse(&status.session_state) {
        status.status = normalize_status(state, &status.status);
    }
    status
}

/// Validates hints, resolves the root, and computes one status poll.
pub fn resolve_and_compute(
    engine: &Engine,
    target: &Target,
    agent_hint: &str,
    mode_hint: &str,
    full: bool,
) -> Result<(String, SessionStatus)> {
    let session = target.require_session()?.to_string();
    let agent_hint = parse_agent_hint(agent_hint)?;
    let mode_hint = parse_mode_hint(mode_hint)?;
    let root = target.resolve_root(engine)?;
    let req = StatusRequest {
        session,
        project_root: root.clone(),
        agent_hint,
        mode_hint,
        full,
        ..StatusRequest::default()
    };
    let status = compute_session_status(engine, &req)
        .map_err(|e| LisaError::coded("status_compute_failed", e.to_string()))?;
    Ok((root, normalized_status(status)))
}

fn is_not_found(status: &SessionStatus) -> bool {
    status.session_state == SessionState::NotFound.as_str()
}

fn session_not_found(session: &str, root: &str) -> CommandOutput {
    let mut out = CommandOutput::failure("session_not_found", "session not found");
    out.payload.insert("session".into(), json!(session));
    out.payload.insert("projectRoot".into(), json!(root));
    out
}

/// Capture text after line trimming and optional noise filtering.
fn capture_text(engine: &Engine, session: &str, lines: usize, strip_noise: bool) -> Result<String> {
    let raw = engine
        .tmux
        .capture_pane(session, lines)
        .map_err(|e| LisaError::coded("capture_failed", format!("failed to capture pane: {e}")))?;
    let joined = trim_lines(&raw).join("\n");
    Ok(if strip_noise {
        filter_capture_noise(&joined)
    } else {
        joined
    })
}

/// Records the capture in classifier state, then cuts it at `from`.
fn record_and_delta(
    engine: &Engine,
    root: &str,
    session: &str,
    capture: &str,
    from: Option<DeltaFrom>,
) -> CaptureDelta {
    let last_output_at = match record_capture_output(engine, root, session, capture) {
        Ok(at) => at,
        Err(err) => {
            warn!(session = %session, error = %err, "failed to update capture state");
            0
        }
    };
    apply_capture_delta(capture, from, last_output_at)
}

fn insert_markers(payload: &mut Payload, summary: &CaptureMarkerSummary, json_min: bool) {
    payload.remove("capture");
    payload.insert("markers".into(), json!(summary.markers));
    payload.insert("markerMatches".into(), json!(summary.matches));
    payload.insert("foundMarkers".into(), json!(summary.found));
    payload.insert("missingMarkers".into(), json!(summary.missing));
    if !json_min {
        payload.insert("markerCounts".into(), json!(summary.counts));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct SessionStatusRequest {
    pub target: Target,
    pub agent_hint: String,
    pub mode_hint: String,
    /// Write the output file for terminal states.
    pub full: bool,
    /// Exit 1 with `session_not_found` when the session is gone.
    pub fail_not_found: bool,
    pub json_min: bool,
}

pub fn status_command(engine: &Engine, req: &SessionStatusRequest) -> CommandOutput {
    run(|| {
        let (root, status) = resolve_and_compute(engine, &req.target, &req.agent_hint, &req.mode_hint, req.full)?;
        let mut payload = if req.json_min {
            status_min_payload(&status)
        } else {
            status_payload(&status, &root)
        };
        if req.fail_not_found && is_not_found(&status) {
            payload.insert("errorCode".into(), json!("session_not_found"));
            return Ok(CommandOutput::with_exit(payload, 1));
        }
        Ok(CommandOutput::ok(payload))
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Explain
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ExplainRequest {
    pub target: Target,
    pub agent_hint: String,
    pub mode_hint: String,
    pub events: usize,
    /// Event index, `@<unix>`, or RFC 3339; empty reads the tail.
    pub since: String,
    pub json_min: bool,
}

impl Default for ExplainRequest {
    fn default() -> Self {
        Self {
            target: Target::default(),
            agent_hint: "auto".to_string(),
            mode_hint: "auto".to_string(),
            events: DEFAULT_EXPLAIN_EVENTS,
            since: String::new(),
            json_min: false,
        }
    }
}

pub fn explain_command(engine: &Engine, req: &ExplainRequest) -> CommandOutput {
    run(|| {
        if req.events == 0 {
            return Err(LisaError::invalid("invalid_events", "invalid --events"));
        }
        let since = req.since.trim();
        let cursor = if since.is_empty() {
            None
        } else {
            Some(EventCursor::parse(since)?)
        };
        let (root, status) = resolve_and_compute(engine, &req.target, &req.agent_hint, &req.mode_hint, true)?;
        let session = status.session.clone();
        let tail = match cursor {
            None => read_session_event_tail(engine, &root, &session, req.events),
            Some(cursor) => read_session_events_since(engine, &root, &session, cursor, req.events),
        }
        .map_err(|e| LisaError::coded("event_tail_read_failed", format!("failed reading session events: {e}")))?;

        let mut payload = if req.json_min {
            let recent: Vec<HandoffItem> = tail.events.iter().map(HandoffItem::from).collect();
            obj(json!({
                "session": session,
                "status": status.status,
                "sessionState": status.session_state,
                "reason": status.classification_reason,
                "recent": recent,
                "nextCursor": tail.next_cursor,
            }))
        } else {
            obj(json!({
                "session": session,
                "projectRoot": root,
                "status": status,
                "eventFile": engine.paths.events_file(&root, &session).to_string_lossy(),
                "events": tail.events,
                "droppedEventLines": tail.dropped_lines,
                "nextCursor": tail.next_cursor,
            }))
        };
        if !since.is_empty() {
            payload.insert("since".into(), json!(since));
        }
        if is_not_found(&status) {
            payload.insert("errorCode".into(), json!("session_not_found"));
        }
        Ok(CommandOutput::ok(payload))
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub target: Target,
    pub agent_hint: String,
    pub mode_hint: String,
    pub lines: usize,
    pub delta_from: String,
    pub markers: String,
    pub strip_noise: bool,
    pub fail_not_found: bool,
    pub json_min: bool,
}

impl Default for SnapshotRequest {
    fn default() -> Self {
        Self {
            target: Target::default(),
            agent_hint: "auto".to_string(),
            mode_hint: "auto".to_string(),
            lines: DEFAULT_CAPTURE_REQUEST_LINES,
            delta_from: String::new(),
            markers: String::new(),
            strip_noise: true,
            fail_not_found: false,
            json_min: false,
        }
    }
}

pub fn snapshot_command(engine: &Engine, req: &SnapshotRequest) -> CommandOutput {
    run(|| {
        if req.lines == 0 {
            return Err(LisaError::invalid("invalid_lines", "invalid --lines"));
        }
        let markers = parse_capture_markers(&req.markers)?;
        let delta_from = parse_delta_from(&req.delta_from)?;
        let (root, status) = resolve_and_compute(engine, &req.target, &req.agent_hint, &req.mode_hint, false)?;
        let session = status.session.clone();

        let mut capture = String::new();
        let mut delta_mode = "";
        let mut next_offset = 0;
        let available = {
            let _scope = engine.runtime_scope(&root);
            let available = !is_not_found(&status) && engine.tmux.has_session(&session);
            if available {
                let text = capture_text(engine, &session, req.lines, req.strip_noise)?;
                let delta = record_and_delta(engine, &root, &session, &text, delta_from);
                capture = delta.text;
                delta_mode = delta.mode;
                next_offset = delta.next_offset;
            }
            available
        };

        let mut payload = obj(json!({
            "session": session,
            "status": status.status,
            "sessionState": status.session_state,
            "capture": capture,
            "nextOffset": next_offset,
        }));
        if !req.json_min {
            payload.insert("projectRoot".into(), json!(root));
            payload.insert("todosDone".into(), json!(status.todos_done));
            payload.insert("todosTotal".into(), json!(status.todos_total));
            payload.insert("waitEstimate".into(), json!(status.wait_estimate));
            if delta_from.is_some() {
                payload.insert("deltaFrom".into(), json!(req.delta_from.trim()));
                payload.insert("deltaMode".into(), json!(delta_mode));
            }
        }
        if !markers.is_empty() {
            let summary = build_capture_marker_summary(&capture, &markers);
            insert_markers(&mut payload, &summary, req.json_min);
        }
        debug!(session = %session, available, "snapshot built");
        if is_not_found(&status) {
            payload.insert("errorCode".into(), json!("session_not_found"));
            if req.fail_not_found {
                return Ok(CommandOutput::with_exit(payload, 1));
            }
        }
        Ok(CommandOutput::ok(payload))
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Next
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct NextRequest {
    pub target: Target,
    pub budget: i64,
}

impl Default for NextRequest {
    fn default() -> Self {
        Self {
            target: Target::default(),
            budget: DEFAULT_NEXT_BUDGET,
        }
    }
}

/// Recommended step for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextStep {
    pub action: &'static str,
    pub command: String,
    pub reason: &'static str,
}

/// Picks the next command by state; the token budget selects between
/// snapshot (<=250), packet (<=600) and context-pack for live or finished
/// sessions.
pub fn recommend_next(state: &str, session: &str, root: &str, budget: i64) -> NextStep {
    let budget = if budget <= 0 { 320 } else { budget };
    let s = shell_quote(session);
    let r = shell_quote(root);
    let step = |action: &'static str, command: String, reason: &'static str| NextStep {
        action,
        command,
        reason,
    };
    match state.trim() {
        "waiting_input" => step(
            "session send",
            format!(
                "./lisa session send --session {s} --project-root {r} --text {} --enter --json-min",
                shell_quote("Continue from current context and produce concise next step output.")
            ),
            "interactive session is ready for next instruction",
        ),
        "in_progress" | "degraded" if budget <= 250 => step(
            "session snapshot",
            format!("./lisa session snapshot --session {s} --project-root {r} --json-min"),
            "low token budget favors one-shot lightweight status+capture",
        ),
        "in_progress" | "degraded" if budget <= 600 => step(
            "session packet",
            format!("./lisa session packet --session {s} --project-root {r} --token-budget {budget} --json-min"),
            "medium budget favors summarized packet",
        ),
        "in_progress" | "degraded" => step(
            "session context-pack",
            format!(
                "./lisa session context-pack --for {s} --project-root {r} --strategy balanced --token-budget {budget} --json-min"
            ),
            "higher budget can carry richer handoff context",
        ),
        "completed" if budget <= 250 => step(
            "session capture",
            format!(
                "./lisa session capture --session {s} --project-root {r} --raw --summary --token-budget {budget} --json"
            ),
            "completed session with low budget should return compact summary",
        ),
        "completed" if budget <= 600 => step(
            "session packet",
            format!("./lisa session packet --session {s} --project-root {r} --token-budget {budget} --json-min"),
            "completed session can be transferred as compact packet",
        ),
        "completed" => step(
            "session context-pack",
            format!(
                "./lisa session context-pack --for {s} --project-root {r} --strategy full --token-budget {budget} --json-min"
            ),
            "higher budget can preserve more completion context",
        ),
        "crashed" | "stuck" => step(
            "session explain",
            format!("./lisa session explain --session {s} --project-root {r} --events 40 --json-min"),
            "terminal error state needs diagnostics before continuation",
        ),
        "not_found" => step(
            "session spawn",
            format!(
                "./lisa session spawn --agent codex --mode interactive --project-root {r} --prompt {} --json",
                shell_quote("Resume task from latest plan and continue.")
            ),
            "session metadata exists but tmux session is missing",
        ),
        _ => step(
            "session status",
            format!("./lisa session status --session {s} --project-root {r} --json-min"),
            "fallback to explicit status probe",
        ),
    }
}

pub fn next_command(engine: &Engine, req: &NextRequest) -> CommandOutput {
    run(|| {
        if req.budget <= 0 {
            return Err(LisaError::invalid("invalid_budget", "invalid --budget: must be > 0"));
        }
        let (root, status) = resolve_and_compute(engine, &req.target, "auto", "auto", false)?;
        let next = recommend_next(&status.session_state, &status.session, &root, req.budget);
        let mut payload = obj(json!({
            "session": status.session,
            "projectRoot": root,
            "status": status.status,
            "sessionState": status.session_state,
            "nextAction": next.action,
            "recommendedCommand": next.command,
            "reason": next.reason,
            "budget": req.budget,
        }));
        if is_not_found(&status) {
            payload.insert("errorCode".into(), json!("session_not_found"));
            return Ok(CommandOutput::with_exit(payload, 1));
        }
        Ok(CommandOutput::ok(payload))
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Capture
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub target: Target,
    pub lines: usize,
    pub delta_from: String,
    /// Offset cursor: read as `--delta-from` when that is empty, rewritten
    /// with the next offset afterwards.
    pub cursor_file: String,
    pub markers: String,
    pub strip_noise: bool,
    /// Replace the capture with its semantic lines, cut to `token_budget`.
    pub summary: bool,
    pub token_budget: i64,
    /// Report semantic lines not seen at the last cursor read.
    pub semantic_delta: bool,
    pub redact: String,
    pub fields: String,
    pub json_min: bool,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            target: Target::default(),
            lines: DEFAULT_CAPTURE_REQUEST_LINES,
            delta_from: String::new(),
            cursor_file: String::new(),
            markers: String::new(),
            strip_noise: true,
            summary: false,
            token_budget: DEFAULT_SUMMARY_TOKEN_BUDGET,
            semantic_delta: false,
            redact: String::new(),
            fields: String::new(),
            json_min: false,
        }
    }
}

pub fn capture_command(engine: &Engine, req: &CaptureRequest) -> CommandOutput {
    run(|| {
        let session = req.target.require_session()?.to_string();
        if req.lines == 0 {
            return Err(LisaError::invalid("invalid_lines", "invalid --lines"));
        }
        if req.summary && req.token_budget <= 0 {
            return Err(LisaError::invalid("invalid_token_budget", "invalid --token-budget"));
        }
        let markers = parse_capture_markers(&req.markers)?;
        let rules = parse_redaction_rules(&req.redact)?;
        let fields = parse_projection_fields(&req.fields)?;
        let cursor_path = resolve_file_flag("--cursor-file", &req.cursor_file)?;
        if req.semantic_delta && cursor_path.is_none() {
            return Err(LisaError::invalid(
                "missing_required_flag",
                "--semantic-delta requires --cursor-file",
            ));
        }
        let mut delta_raw = req.delta_from.trim().to_string();
        if delta_raw.is_empty() {
            if let Some(path) = &cursor_path {
                delta_raw = load_cursor_offset(path)?.to_string();
            }
        }
        let delta_from = parse_delta_from(&delta_raw)?;

        let root = req.target.resolve_root(engine)?;
        let _scope = engine.runtime_scope(&root);
        if !engine.tmux.has_session(&session) {
            return Ok(session_not_found(&session, &root));
        }
        let text = capture_text(engine, &session, req.lines, req.strip_noise)?;
        let delta = record_and_delta(engine, &root, &session, &text, delta_from);
        if let Some(path) = &cursor_path {
            write_cursor_offset(path, delta.next_offset)?;
        }

        let mut capture = apply_redaction_rules(&delta.text, &rules);
        let mut payload = obj(json!({ "session": session }));
        if !req.json_min {
            payload.insert("projectRoot".into(), json!(root));
        }
        if req.summary {
            let semantic = extract_semantic_lines(&capture).join("\n");
            let (summary, truncated) = truncate_to_token_budget(&semantic, req.token_budget);
            capture = summary;
            payload.insert("summary".into(), Value::Bool(true));
            payload.insert("truncated".into(), Value::Bool(truncated));
            payload.insert("tokenBudget".into(), json!(req.token_budget));
        }
        if req.semantic_delta {
            if let Some(path) = &cursor_path {
                let sidecar = semantic_cursor_path(path);
                let current = extract_semantic_lines(&delta.text);
                let baseline = load_semantic_cursor(&sidecar)?;
                let added = compute_semantic_delta(&current, &baseline);
                save_semantic_cursor(&sidecar, &current, engine.now())?;
                let added: Vec<String> = added.iter().map(|l| apply_redaction_rules(l, &rules)).collect();
                payload.insert("semanticDeltaCount".into(), json!(added.len()));
                payload.insert("semanticDelta".into(), json!(added));
            }
        }
        payload.insert("capture".into(), json!(capture));
        if !markers.is_empty() {
            let summary = build_capture_marker_summary(&delta.text, &markers);
            insert_markers(&mut payload, &summary, req.json_min);
        }
        if delta_from.is_some() {
            if !req.json_min {
                payload.insert("deltaFrom".into(), json!(delta_raw));
                payload.insert("deltaMode".into(), json!(delta.mode));
            }
            payload.insert("nextOffset".into(), json!(delta.next_offset));
        } else if cursor_path.is_some() {
            payload.insert("nextOffset".into(), json!(delta.next_offset));
        }
        if !fields.is_empty() {
            payload = project_payload_fields(&payload, &fields);
        }
        Ok(CommandOutput::ok(payload))
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Send
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub target: Target,
    pub text: String,
    /// Whitespace-separated tmux key names.
    pub keys: String,
    pub enter: bool,
    pub json_min: bool,
}

/// Whether the send submits input, so turn completion is measured from now.
pub fn submits_input(text: &str, keys: &[String], enter: bool) -> bool {
    if !text.is_empty() {
        return enter;
    }
    enter
        || keys
            .iter()
            .any(|k| matches!(k.trim().to_lowercase().as_str(), "enter" | "kpenter" | "c-m"))
}

/// Prepends the session's objective reminder unless the text already has it.
pub fn with_objective_reminder(text: &str, meta: &SessionMeta) -> String {
    let prefix = objective_reminder_prefix(meta);
    if prefix.is_empty() || objective_reminder_present(text, &prefix, meta) {
        return text.to_string();
    }
    format!("{prefix}\n{text}")
}

pub fn send_command(engine: &Engine, req: &SendRequest) -> CommandOutput {
    run(|| {
        let session = req.target.require_session()?.to_string();
        if req.text.is_empty() && req.keys.is_empty() {
            return Err(LisaError::invalid("missing_send_payload", "provide --text or --keys"));
        }
        if !req.text.is_empty() && !req.keys.is_empty() {
            return Err(LisaError::invalid(
                "send_payload_conflict",
                "use either --text or --keys, not both",
            ));
        }
        let keys: Vec<String> = req.keys.split_whitespace().map(str::to_string).collect();
        if req.text.is_empty() && keys.is_empty() {
            return Err(LisaError::invalid("empty_keys", "empty --keys"));
        }

        let root = req.target.resolve_root(engine)?;
        let _scope = engine.runtime_scope(&root);
        let meta = match load_session_meta(engine, &root, &session) {
            Ok(Some(meta)) => meta,
            Ok(None) => SessionMeta::default(),
            Err(err) => {
                warn!(session = %session, error = %err, "unreadable session meta; sending without objective");
                SessionMeta::default()
            }
        };
        let text = if req.text.is_empty() {
            String::new()
        } else {
            with_objective_reminder(&req.text, &meta)
        };
        if !engine.tmux.has_session(&session) {
            return Ok(session_not_found(&session, &root));
        }

        let reason = if text.is_empty() {
            engine
                .tmux
                .send_keys(&session, &keys, req.enter)
                .map_err(|e| LisaError::coded("send_keys_failed", format!("failed sending keys: {e}")))?;
            "send_keys"
        } else {
            engine
                .tmux
                .send_text(&session, &text, req.enter)
                .map_err(|e| LisaError::coded("send_text_failed", format!("failed sending text: {e}")))?;
            "send_text"
        };
        if let Err(err) = append_lifecycle_event(engine, &root, &session, "lifecycle", "in_progress", "active", reason) {
            warn!(session = %session, error = %err, "failed to append send event");
        }
        if submits_input(&text, &keys, req.enter) {
            if let Err(err) = record_session_input(engine, &root, &session) {
                warn!(session = %session, error = %err, "failed to record input timestamp");
            }
        }
        info!(session = %session, kind = reason, enter = req.enter, "input sent");

        let objective = objective_payload_from_meta(&meta);
        let mut payload = obj(json!({ "session": session, "ok": true }));
        if !req.json_min {
            payload.insert("projectRoot".into(), json!(root));
            payload.insert("enter".into(), json!(req.enter));
            if !meta.lane.trim().is_empty() {
                payload.insert("lane".into(), json!(meta.lane));
            }
        }
        if let Some(objective) = objective {
            payload.insert("objective".into(), Value::Object(objective));
        }
        Ok(CommandOutput::ok(payload))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::read_session_event_tail;
    use crate::meta::save_session_meta;
    use crate::testing::{FakeTmuxAdapter, FixedClock};
    use chrono::Utc;
    use lisa_protocol::str_field;
    use std::sync::Arc;
    use tempfile::TempDir;

    const ROOT: &str = "/missing/lisa-session-root";

    fn setup() -> (TempDir, Engine, Arc<FakeTmuxAdapter>, Arc<FixedClock>) {
        let tmp = TempDir::new().unwrap();
        let (engine, tmux, clock) = Engine::with_fakes(tmp.path(), Utc::now());
        (tmp, engine, tmux, clock)
    }

    fn target(session: &str) -> Target {
        Target::new(session, ROOT)
    }

    #[test]
    fn test_status_not_found_only_fails_when_asked() {
        let (_tmp, engine, _, _) = setup();
        let req = SessionStatusRequest {
            target: target("ghost"),
            ..SessionStatusRequest::default()
        };
        let out = status_command(&engine, &req);
        assert_eq!(out.exit_code, 0);
        assert_eq!(str_field(&out.payload, "sessionState"), "not_found");
        assert_eq!(str_field(&out.payload, "status"), "not_found");
        assert_eq!(str_field(&out.payload, "projectRoot"), ROOT);

        let out = status_command(&engine, &SessionStatusRequest { fail_not_found: true, json_min: true, ..req });
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("session_not_found"));
        assert!(out.payload.get("projectRoot").is_none());
    }

    #[test]
    fn test_status_rejects_bad_hint() {
        let (_tmp, engine, _, _) = setup();
        let out = status_command(
            &engine,
            &SessionStatusRequest {
                target: target("s1"),
                agent_hint: "gpt".into(),
                ..SessionStatusRequest::default()
            },
        );
        assert_eq!(out.error_code(), Some("invalid_agent_hint"));
    }

    #[test]
    fn test_explain_reports_events_and_cursor() {
        let (_tmp, engine, tmux, _) = setup();
        tmux.add_session("job-exec", "work\n__LISA_EXEC_DONE__:0\n$ ");
        let req = ExplainRequest {
            target: target("job-exec"),
            ..ExplainRequest::default()
        };
        let out = explain_command(&engine, &req);
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.payload["status"]["sessionState"], "completed");
        assert!(out.payload["events"].as_array().is_some_and(|e| !e.is_empty()));
        assert!(out.error_code().is_none());

        let out = explain_command(&engine, &ExplainRequest { json_min: true, since: "0".into(), ..req });
        assert_eq!(str_field(&out.payload, "reason"), "exec_done_marker");
        assert_eq!(str_field(&out.payload, "since"), "0");
        assert!(out.payload["nextCursor"].as_u64().is_some_and(|n| n >= 1));
    }

    #[test]
    fn test_explain_rejects_bad_since() {
        let (_tmp, engine, _, _) = setup();
        let out = explain_command(
            &engine,
            &ExplainRequest {
                target: target("s1"),
                since: "yesterday".into(),
                ..ExplainRequest::default()
            },
        );
        assert_eq!(out.error_code(), Some("invalid_since_cursor"));
    }

    #[test]
    fn test_snapshot_capture_and_markers() {
        let (_tmp, engine, tmux, _) = setup();
        tmux.add_session("job-exec", "READY one\nREADY two\n__LISA_EXEC_DONE__:0");
        let req = SnapshotRequest {
            target: target("job-exec"),
            ..SnapshotRequest::default()
        };
        let out = snapshot_command(&engine, &req);
        assert_eq!(out.exit_code, 0);
        assert!(str_field(&out.payload, "capture").contains("READY two"));
        assert!(out.payload["nextOffset"].as_u64().is_some_and(|n| n > 0));
        assert!(out.payload.get("todosDone").is_some());

        let out = snapshot_command(
            &engine,
            &SnapshotRequest {
                markers: "READY,MISSING".into(),
                json_min: true,
                ..req
            },
        );
        assert!(out.payload.get("capture").is_none());
        assert_eq!(out.payload["foundMarkers"], json!(["READY"]));
        assert_eq!(out.payload["missingMarkers"], json!(["MISSING"]));
        assert!(out.payload.get("markerCounts").is_none());
        assert!(out.payload.get("todosDone").is_none());
    }

    #[test]
    fn test_snapshot_not_found() {
        let (_tmp, engine, _, _) = setup();
        let req = SnapshotRequest {
            target: target("ghost"),
            ..SnapshotRequest::default()
        };
        let out = snapshot_command(&engine, &req);
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.error_code(), Some("session_not_found"));
        assert_eq!(out.payload["nextOffset"], 0);
        let out = snapshot_command(&engine, &SnapshotRequest { fail_not_found: true, ..req });
        assert_eq!(out.exit_code, 1);
    }

    #[test]
    fn test_next_action_table() {
        let cases = [
            ("waiting_input", 480, "session send"),
            ("in_progress", 200, "session snapshot"),
            ("degraded", 480, "session packet"),
            ("in_progress", 900, "session context-pack"),
            ("completed", 100, "session capture"),
            ("completed", 480, "session packet"),
            ("completed", 1200, "session context-pack"),
            ("crashed", 480, "session explain"),
            ("stuck", 480, "session explain"),
            ("not_found", 480, "session spawn"),
            ("mystery", 480, "session status"),
        ];
        for (state, budget, action) in cases {
            assert_eq!(recommend_next(state, "s1", "/r", budget).action, action, "{state}/{budget}");
        }
        let next = recommend_next("in_progress", "s1", "/r", 480);
        assert!(next.command.contains("--token-budget 480"));
    }

    #[test]
    fn test_next_command_exit_codes() {
        let (_tmp, engine, tmux, _) = setup();
        let out = next_command(&engine, &NextRequest { target: target("ghost"), budget: 480 });
        assert_eq!(out.exit_code, 1);
        assert_eq!(str_field(&out.payload, "nextAction"), "session spawn");

        tmux.add_session("job-exec", "__LISA_EXEC_DONE__:0");
        let out = next_command(&engine, &NextRequest { target: target("job-exec"), budget: 100 });
        assert_eq!(out.exit_code, 0);
        assert_eq!(str_field(&out.payload, "nextAction"), "session capture");

        let out = next_command(&engine, &NextRequest { target: target("job-exec"), budget: 0 });
        assert_eq!(out.error_code(), Some("invalid_budget"));
    }

    #[test]
    fn test_capture_delta_offsets() {
        let (_tmp, engine, tmux, _) = setup();
        tmux.add_session("s1", "alpha\nbeta");
        let req = CaptureRequest {
            target: target("s1"),
            delta_from: "0".into(),
            ..CaptureRequest::default()
        };
        let out = capture_command(&engine, &req);
        assert_eq!(str_field(&out.payload, "capture"), "alpha\nbeta");
        assert_eq!(str_field(&out.payload, "deltaMode"), "offset");
        let offset = out.payload["nextOffset"].as_u64().unwrap();

        tmux.set_capture("s1", "alpha\nbeta\ngamma");
        let out = capture_command(&engine, &CaptureRequest { delta_from: offset.to_string(), ..req.clone() });
        assert_eq!(str_field(&out.payload, "capture"), "\ngamma");

        let out = capture_command(&engine, &CaptureRequest { delta_from: "9999".into(), ..req });
        assert_eq!(str_field(&out.payload, "deltaMode"), "reset");
    }

    #[test]
    fn test_capture_cursor_file_and_semantic_delta() {
        let (tmp, engine, tmux, _) = setup();
        tmux.add_session("s1", "first finding");
        let cursor = tmp.path().join("capture.cursor");
        let req = CaptureRequest {
            target: target("s1"),
            cursor_file: cursor.to_string_lossy().to_string(),
            semantic_delta: true,
            ..CaptureRequest::default()
        };
        let out = capture_command(&engine, &req);
        assert_eq!(out.payload["semanticDelta"], json!(["first finding"]));
        assert_eq!(std::fs::read_to_string(&cursor).unwrap().trim(), "13");

        tmux.set_capture("s1", "first finding\nsecond finding");
        let out = capture_command(&engine, &req);
        assert_eq!(str_field(&out.payload, "capture"), "\nsecond finding");
        assert_eq!(out.payload["semanticDelta"], json!(["second finding"]));
    }

    #[test]
    fn test_capture_summary_redaction_and_fields() {
        let (_tmp, engine, tmux, _) = setup();
        tmux.add_session("s1", "mail dev@example.com\n__LISA_EXEC_DONE__:0\nresult ok");
        let out = capture_command(
            &engine,
            &CaptureRequest {
                target: target("s1"),
                summary: true,
                redact: "emails".into(),
                fields: "session,capture".into(),
                ..CaptureRequest::default()
            },
        );
        let capture = str_field(&out.payload, "capture");
        assert!(capture.contains("[REDACTED_EMAIL]"));
        assert!(!capture.contains("__LISA_EXEC_DONE__"));
        assert!(out.payload.get("projectRoot").is_none());
        assert_eq!(out.payload.len(), 2);
    }

    #[test]
    fn test_capture_errors() {
        let (_tmp, engine, tmux, _) = setup();
        let out = capture_command(&engine, &CaptureRequest { target: target("ghost"), ..CaptureRequest::default() });
        assert_eq!(out.error_code(), Some("session_not_found"));
        assert_eq!(str_field(&out.payload, "projectRoot"), ROOT);

        tmux.add_session("s1", "x");
        tmux.set_capture_error("s1", Some("pane gone"));
        let out = capture_command(&engine, &CaptureRequest { target: target("s1"), ..CaptureRequest::default() });
        assert_eq!(out.error_code(), Some("capture_failed"));

        let out = capture_command(
            &engine,
            &CaptureRequest {
                target: target("s1"),
                markers: "a,,b".into(),
                ..CaptureRequest::default()
            },
        );
        assert_eq!(out.error_code(), Some("invalid_markers"));
    }

    #[test]
    fn test_send_text_with_objective_reminder() {
        let (_tmp, engine, tmux, _) = setup();
        tmux.add_session("s1", "");
        let meta = SessionMeta {
            session: "s1".into(),
            objective_id: "obj-1".into(),
            objective_goal: "ship it".into(),
            lane: "review".into(),
            ..SessionMeta::default()
        };
        save_session_meta(&engine, ROOT, "s1", &meta).unwrap();

        let req = SendRequest {
            target: target("s1"),
            text: "next step".into(),
            enter: true,
            ..SendRequest::default()
        };
        let out = send_command(&engine, &req);
        assert_eq!(out.exit_code, 0);
        assert_eq!(str_field(&out.payload, "lane"), "review");
        assert_eq!(out.payload["objective"]["id"], "obj-1");
        let sent = tmux.sent("s1");
        assert_eq!(
            sent[0],
            "Objective reminder: id=obj-1 | goal=ship it | lane=review\nnext step\n"
        );

        let already = format!("{}\nagain", objective_reminder_prefix(&meta));
        send_command(&engine, &SendRequest { text: already.clone(), ..req });
        assert_eq!(tmux.sent("s1")[1], format!("{already}\n"));

        let tail = read_session_event_tail(&engine, ROOT, "s1", 10).unwrap();
        assert_eq!(tail.events.last().unwrap().reason, "send_text");
    }

    #[test]
    fn test_send_keys_and_validation() {
        let (_tmp, engine, tmux, _) = setup();
        tmux.add_session("s1", "");
        let out = send_command(
            &engine,
            &SendRequest {
                target: target("s1"),
                keys: "C-c  Enter".into(),
                json_min: true,
                ..SendRequest::default()
            },
        );
        assert_eq!(out.exit_code, 0);
        assert!(out.payload.get("enter").is_none());
        assert_eq!(tmux.sent("s1"), vec!["C-c Enter".to_string()]);

        let base = SendRequest {
            target: target("s1"),
            ..SendRequest::default()
        };
        assert_eq!(send_command(&engine, &base).error_code(), Some("missing_send_payload"));
        let both = SendRequest { text: "a".into(), keys: "b".into(), ..base.clone() };
        assert_eq!(send_command(&engine, &both).error_code(), Some("send_payload_conflict"));
        let blank = SendRequest { keys: "   ".into(), ..base };
        assert_eq!(send_command(&engine, &blank).error_code(), Some("empty_keys"));
        let ghost = SendRequest { target: target("ghost"), text: "hi".into(), ..SendRequest::default() };
        assert_eq!(send_command(&engine, &ghost).error_code(), Some("session_not_found"));
    }

    #[test]
    fn test_submits_input_rules() {
        assert!(!submits_input("hi", &[], false));
        assert!(submits_input("hi", &[], true));
        assert!(submits_input("", &["KPEnter".to_string()], false));
        assert!(!submits_input("", &["C-c".to_string()], false));
    }
}
