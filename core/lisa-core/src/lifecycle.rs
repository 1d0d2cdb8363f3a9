//! Session lifecycle: `spawn`, `exists`, `kill`, `kill-all` and `name`.
//!
//! Spawn launches the agent in a detached tmux session on the project's
//! socket, wrapped so the pane emits start and done markers and touches the
//! heartbeat file while the command runs. The session meta written here is
//! what every other session command reads back.

use crate::capture::shell_quote;
use crate::command::{obj, run, Target};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::events::{append_lifecycle_event, prune_stale_event_artifacts};
use crate::meta::{list_project_session_metas, load_session_meta, parse_agent, parse_mode, save_session_meta};
use crate::paths::{
    canonical_project_root, project_hash, project_slug, sanitize_id, session_artifact_id, PROJECT_ROOT_ENV,
    TMUX_SOCKET_ENV,
};
use crate::registry::lane::load_lane_record;
use crate::registry::objective::{current_objective, inject_objective_into_prompt, ObjectiveRecord};
use crate::router::nested::{
    apply_model_to_agent_args, apply_nested_policy, build_agent_command, parse_model, NestedPolicy, NestingIntent,
};
use crate::storage::{remove_if_exists, write_file_atomic};
use crate::tmux::NewSession;
use crate::types::{SessionMeta, EXEC_DONE_PREFIX, SESSION_DONE_PREFIX, SESSION_START_PREFIX};
use lisa_protocol::{CommandOutput, Payload};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{info, warn};

pub const DEFAULT_WIDTH: i64 = 220;
pub const DEFAULT_HEIGHT: i64 = 60;
/// Set inside every spawned pane; a spawn from inside one records it as parent.
pub const SESSION_NAME_ENV: &str = "LISA_SESSION_NAME";

// ═══════════════════════════════════════════════════════════════════════════════
// Naming & Startup Script
// ═══════════════════════════════════════════════════════════════════════════════

/// `lisa-<slug>-<yymmdd-hhmmss>-<nanos>-<agent>-<mode>[-<tag>]`
pub fn generate_session_name(engine: &Engine, project_root: &str, agent: &str, mode: &str, tag: &str) -> String {
    let now = engine.now();
    let mut name = format!(
        "lisa-{}-{}-{:09}-{}-{}",
        project_slug(project_root),
        now.format("%y%m%d-%H%M%S"),
        now.timestamp_subsec_nanos(),
        agent,
        mode
    );
    if !tag.trim().is_empty() {
        name.push('-');
        name.push_str(&sanitize_id(tag, 16));
    }
    name
}

fn wrap_exec_command(command: &str) -> String {
    format!("{{ {command}; __lisa_ec=$?; printf '\\n{EXEC_DONE_PREFIX}%d\\n' \"$__lisa_ec\"; }}")
}

/// Wraps the agent command with heartbeat ticks, a start marker, and a
/// done marker (plus done file) carrying `run_id` and the exit code.
pub fn wrap_session_command(command: &str, run_id: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("{{ __lisa_run_id={}; __lisa_hb_pid=''; __lisa_ec=0; __lisa_marker_done=0; ", shell_quote(run_id)));
    out.push_str(
        "__lisa_hb_tick(){ if [ -n \"${LISA_HEARTBEAT_FILE:-}\" ]; then : > \"$LISA_HEARTBEAT_FILE\" 2>/dev/null || true; fi; }; ",
    );
    out.push_str(
        "__lisa_hb_start(){ if [ -n \"${LISA_HEARTBEAT_FILE:-}\" ]; then __lisa_hb_tick; (while :; do __lisa_hb_tick; sleep 2; done) & __lisa_hb_pid=$!; fi; }; ",
    );
    out.push_str(
        "__lisa_hb_stop(){ if [ -n \"$__lisa_hb_pid\" ]; then kill \"$__lisa_hb_pid\" >/dev/null 2>&1 || true; wait \"$__lisa_hb_pid\" 2>/dev/null || true; __lisa_hb_pid=''; fi; __lisa_hb_tick; }; ",
    );
    out.push_str(&format!(
        "__lisa_emit_done(){{ if [ \"$__lisa_marker_done\" -eq 0 ]; then printf '\\n{SESSION_DONE_PREFIX}%s:%d\\n' \"$__lisa_run_id\" \"$__lisa_ec\"; \
if [ -n \"${{LISA_DONE_FILE:-}}\" ]; then printf '%s:%d\\n' \"$__lisa_run_id\" \"$__lisa_ec\" > \"$LISA_DONE_FILE\" 2>/dev/null || true; fi; __lisa_marker_done=1; fi; }}; "
    ));
    out.push_str("__lisa_cleanup(){ __lisa_hb_stop; __lisa_emit_done; }; ");
    out.push_str("trap '__lisa_ec=130; exit \"$__lisa_ec\"' INT TERM HUP; trap '__lisa_cleanup' EXIT; __lisa_hb_start; ");
    out.push_str(&format!("printf '\\n{SESSION_START_PREFIX}%s:%s\\n' \"$__lisa_run_id\" \"$(date +%s)\"; "));
    out.push_str("__lisa_had_errexit=0; case $- in *e*) __lisa_had_errexit=1;; esac; set +e; ");
    out.push_str(command);
    out.push_str("; __lisa_ec=$?; if [ \"$__lisa_had_errexit\" -eq 1 ]; then set -e; fi; exit \"$__lisa_ec\"; }");
    out
}

/// Startup script body; the pane drops into a login shell afterwards so
/// capture and status keep working once the agent exits.
pub fn startup_script_body(startup_command: &str) -> String {
    let mut body = String::from("#!/usr/bin/env bash\n");
    if startup_command.contains(EXEC_DONE_PREFIX) {
        body.push_str("set +e\n");
    }
    body.push_str("(\n");
    body.push_str(startup_command);
    if !startup_command.ends_with('\n') {
        body.push('\n');
    }
    body.push_str(")\n__lisa_spawn_ec=$?\nexec \"${SHELL:-/bin/sh}\" -l\n");
    body
}

fn script_prefix(session: &str) -> String {
    format!("lisa-cmd-{}-", session_artifact_id(session))
}

fn script_path(engine: &Engine, session: &str, nanos: i64) -> PathBuf {
    engine.paths.base().join(format!("{}{nanos}.sh", script_prefix(session)))
}

/// Removes state, meta, output and done files plus startup scripts. Events
/// survive so a later `explain` can still show how the session ended.
pub fn cleanup_session_artifacts(engine: &Engine, project_root: &str, session: &str) -> Result<()> {
    let mut errors = Vec::new();
    for path in [
        engine.paths.state_file(project_root, session),
        engine.paths.meta_file(project_root, session),
        engine.paths.output_file(project_root, session),
        engine.paths.done_file(project_root, session),
    ] {
        if let Err(err) = remove_if_exists(&path) {
            errors.push(err.to_string());
        }
    }
    let prefix = script_prefix(session);
    if let Ok(entries) = std::fs::read_dir(engine.paths.base()) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(".sh") {
                if let Err(err) = remove_if_exists(&entry.path()) {
                    errors.push(err.to_string());
                }
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(LisaError::coded("cleanup_failed", errors.join("; ")))
    }
}

fn objective_json(objective: &ObjectiveRecord) -> Value {
    json!({
        "id": objective.id,
        "goal": objective.goal,
        "acceptance": objective.acceptance,
        "budget": objective.budget,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Spawn
// ═══════════════════════════════════════════════════════════════════════════════

/// Empty strings mean "unset": lane presets fill them before defaults apply.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub project_root: String,
    pub session: String,
    pub agent: String,
    pub mode: String,
    pub lane: String,
    pub nested_policy: String,
    pub nesting_intent: String,
    pub prompt: String,
    /// Replaces the built agent command.
    pub command: String,
    pub agent_args: String,
    pub model: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub dry_run: bool,
    pub detect_nested: bool,
    pub no_skip_permissions: bool,
}

fn fill(value: &str, preset: &str) -> String {
    if value.trim().is_empty() {
        preset.trim().to_string()
    } else {
        value.to_string()
    }
}

fn dimension(value: Option<i64>, default: i64, code: &str, flag: &str) -> Result<i64> {
    match value {
        None => Ok(default),
        Some(v) if v > 0 => Ok(v),
        Some(v) => Err(LisaError::invalid(code, format!("invalid {flag}: {v} (must be positive)"))),
    }
}

pub fn spawn_command(engine: &Engine, req: &SpawnRequest) -> CommandOutput {
    run(|| {
        let width = dimension(req.width, DEFAULT_WIDTH, "invalid_width", "--width")?;
        let height = dimension(req.height, DEFAULT_HEIGHT, "invalid_height", "--height")?;
        let root = canonical_project_root(&req.project_root);

        let mut agent = req.agent.clone();
        let mut mode = req.mode.clone();
        let mut nested_policy = req.nested_policy.clone();
        let mut nesting_intent = req.nesting_intent.clone();
        let mut prompt = req.prompt.clone();
        let mut model = req.model.clone();
        let lane = req.lane.trim().to_string();
        if !lane.is_empty() {
            let record = load_lane_record(engine, &root, &lane)
                .map_err(|e| LisaError::coded("lane_store_read_failed", format!("failed reading lane store: {e}")))?
                .ok_or_else(|| LisaError::LaneNotFound(lane.to_lowercase()))?;
            agent = fill(&agent, &record.agent);
            mode = fill(&mode, &record.mode);
            nested_policy = fill(&nested_policy, &record.nested_policy);
            nesting_intent = fill(&nesting_intent, &record.nesting_intent);
            prompt = fill(&prompt, &record.prompt);
            model = fill(&model, &record.model);
        }
        let objective = current_objective(engine, &root);
        if let Some(record) = &objective {
            prompt = inject_objective_into_prompt(&prompt, record, &lane);
        }

        let agent = parse_agent(if agent.trim().is_empty() { "claude" } else { agent.as_str() })?;
        let mode = parse_mode(if mode.trim().is_empty() { "interactive" } else { mode.as_str() })?;
        let model = parse_model(&model)?;
        let agent_args = apply_model_to_agent_args(&agent, &req.agent_args, &model)?;
        let policy = NestedPolicy::parse(&nested_policy)?;
        let intent = NestingIntent::parse(&nesting_intent)?;

        let session = req.session.trim().to_string();
        if !session.is_empty() && !session.starts_with("lisa-") {
            return Err(LisaError::invalid(
                "invalid_session_name",
                "invalid --session: must start with \"lisa-\"",
            ));
        }
        let session = if session.is_empty() {
            generate_session_name(engine, &root, &agent, &mode, "")
        } else {
            session
        };

        let _scope = engine.runtime_scope(&root);
        if engine.tmux.has_session(&session) {
            return Err(LisaError::coded(
                "session_already_exists",
                format!("session already exists: {session}"),
            ));
        }
        let now = engine.now();
        let nanos = now.timestamp_nanos_opt().unwrap_or_default();
        let run_id = nanos.to_string();
        let spawn_failed = |reason: &str| {
            if req.dry_run {
                return;
            }
            if let Err(err) = append_lifecycle_event(engine, &root, &session, "lifecycle", "degraded", "idle", reason) {
                warn!(session = %session, error = %err, "failed to append spawn failure event");
            }
        };

        let (mut detection, agent_args) =
            apply_nested_policy(&agent, &mode, &prompt, &agent_args, policy, intent)?;
        let command = if req.command.trim().is_empty() {
            build_agent_command(&agent, &mode, &prompt, &agent_args, !req.no_skip_permissions).map_err(|e| {
                spawn_failed("spawn_command_build_error");
                LisaError::coded("agent_command_build_failed", e.to_string())
            })?
        } else {
            detection.reason = "custom_command_override";
            req.command.trim().to_string()
        };
        let mut startup = command.clone();
        if mode == "exec" {
            startup = wrap_exec_command(&startup);
        }
        let startup = wrap_session_command(&startup, &run_id);

        let socket = engine.paths.tmux_socket_path(&root).to_string_lossy().to_string();
        let heartbeat = engine.paths.heartbeat_file(&root, &session);
        let env: Vec<(String, String)> = vec![
            ("LISA_SESSION".into(), "true".into()),
            (SESSION_NAME_ENV.into(), session.clone()),
            ("LISA_AGENT".into(), agent.clone()),
            ("LISA_MODE".into(), mode.clone()),
            (PROJECT_ROOT_ENV.into(), root.clone()),
            (TMUX_SOCKET_ENV.into(), socket.clone()),
            ("LISA_PROJECT_HASH".into(), project_hash(&root)),
            ("LISA_HEARTBEAT_FILE".into(), heartbeat.to_string_lossy().to_string()),
            (
                "LISA_DONE_FILE".into(),
                engine.paths.done_file(&root, &session).to_string_lossy().to_string(),
            ),
        ];

        let mut payload = obj(json!({
            "session": session,
            "agent": agent,
            "mode": mode,
            "lane": lane,
            "nestedPolicy": policy.as_str(),
            "nestingIntent": intent.as_str(),
            "runId": run_id,
            "projectRoot": root,
            "socketPath": socket,
            "command": command,
        }));
        if let Some(record) = &objective {
            payload.insert("objective".into(), objective_json(record));
        }
        if req.detect_nested {
            payload.insert("nestedDetection".into(), json!(detection));
        }
        if req.dry_run {
            let env_map: Payload = env.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            payload.insert("dryRun".into(), json!(true));
            payload.insert("model".into(), json!(model));
            payload.insert("startupCommand".into(), json!(startup));
            payload.insert("width".into(), json!(width));
            payload.insert("height".into(), json!(height));
            payload.insert("env".into(), Value::Object(env_map));
            return Ok(CommandOutput::ok(payload));
        }

        if let Err(err) = prune_stale_event_artifacts(engine) {
            warn!(error = %err, "failed to prune stale event artifacts");
        }
        cleanup_session_artifacts(engine, &root, &session).map_err(|e| {
            spawn_failed("spawn_cleanup_error");
            LisaError::coded("spawn_cleanup_failed", format!("failed to reset previous session artifacts: {e}"))
        })?;
        write_file_atomic(&heartbeat, b"").map_err(|e| {
            spawn_failed("spawn_heartbeat_prepare_error");
            LisaError::coded("spawn_heartbeat_prepare_failed", format!("failed to prepare heartbeat file: {e}"))
        })?;
        let script = script_path(engine, &session, nanos);
        write_file_atomic(&script, startup_script_body(&startup).as_bytes()).map_err(|e| {
            spawn_failed("spawn_script_write_error");
            LisaError::coded("spawn_tmux_new_failed", format!("failed to write startup command script: {e}"))
        })?;

        let spec = NewSession {
            session: session.clone(),
            cwd: root.clone(),
            width: width as u32,
            height: height as u32,
            env,
            command: format!("bash {}", shell_quote(&script.to_string_lossy())),
        };
        if let Err(err) = engine.tmux.new_session(&spec) {
            if let Err(cleanup) = cleanup_session_artifacts(engine, &root, &session) {
                warn!(session = %session, error = %cleanup, "cleanup after failed spawn");
            }
            spawn_failed("spawn_tmux_new_error");
            return Err(LisaError::coded(
                "spawn_tmux_new_failed",
                format!("failed to create tmux session: {err}"),
            ));
        }

        let mut meta = SessionMeta {
            session: session.clone(),
            parent_session: parent_session_from_env(&session),
            agent: agent.clone(),
            mode: mode.clone(),
            lane: lane.clone(),
            run_id: run_id.clone(),
            project_root: root.clone(),
            start_cmd: command.clone(),
            prompt: prompt.clone(),
            created_at: crate::clock::format_utc_seconds(now),
            ..SessionMeta::default()
        };
        if let Some(record) = &objective {
            meta.objective_id = record.id.clone();
            meta.objective_goal = record.goal.clone();
            meta.objective_acceptance = record.acceptance.clone();
            meta.objective_budget = record.budget;
        }
        if let Err(err) = save_session_meta(engine, &root, &session, &meta) {
            let mut message = format!("failed to persist metadata: {err}");
            if let Err(kill) = engine.tmux.kill_session(&session) {
                message.push_str(&format!("; failed to kill session after metadata error: {kill}"));
            }
            if let Err(cleanup) = cleanup_session_artifacts(engine, &root, &session) {
                warn!(session = %session, error = %cleanup, "cleanup after metadata error");
            }
            spawn_failed("spawn_meta_persist_error");
            return Err(LisaError::coded("spawn_meta_persist_failed", message));
        }
        if let Err(err) = remove_if_exists(&engine.paths.state_file(&root, &session)) {
            warn!(session = %session, error = %err, "failed to reset classifier state");
        }
        if let Err(err) = append_lifecycle_event(engine, &root, &session, "lifecycle", "spawned", "active", "spawn_success")
        {
            warn!(session = %session, error = %err, "failed to append spawn event");
        }
        info!(session = %session, agent = %agent, mode = %mode, "session spawned");
        Ok(CommandOutput::ok(payload))
    })
}

fn parent_session_from_env(session: &str) -> String {
    std::env::var(SESSION_NAME_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != session)
        .unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Exists & Name
// ═══════════════════════════════════════════════════════════════════════════════

pub fn exists_command(engine: &Engine, target: &Target) -> CommandOutput {
    run(|| {
        let session = target.require_session()?.to_string();
        let root = target.resolve_root(engine)?;
        let _scope = engine.runtime_scope(&root);
        let exists = engine.tmux.has_session(&session);
        let payload = obj(json!({ "session": session, "exists": exists, "projectRoot": root }));
        if exists {
            return Ok(CommandOutput::ok(payload));
        }
        let mut out = CommandOutput::with_exit(payload, 1);
        out.payload.insert("errorCode".into(), json!("session_not_found"));
        Ok(out)
    })
}

#[derive(Debug, Clone, Default)]
pub struct NameRequest {
    pub project_root: String,
    pub agent: String,
    pub mode: String,
    pub tag: String,
}

pub fn name_command(engine: &Engine, req: &NameRequest) -> CommandOutput {
    run(|| {
        let agent = parse_agent(if req.agent.trim().is_empty() { "claude" } else { req.agent.as_str() })?;
        let mode = parse_mode(if req.mode.trim().is_empty() { "interactive" } else { req.mode.as_str() })?;
        let root = canonical_project_root(&req.project_root);
        let session = generate_session_name(engine, &root, &agent, &mode, &req.tag);
        Ok(CommandOutput::ok(obj(json!({
            "session": session,
            "agent": agent,
            "mode": mode,
            "projectRoot": root,
        }))))
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Kill
// ═══════════════════════════════════════════════════════════════════════════════

/// Kill outcome for one target; `found` is false when tmux had no session.
fn kill_one(engine: &Engine, root: &str, session: &str, reason_prefix: &str) -> (bool, Option<String>) {
    if !engine.tmux.has_session(session) {
        if let Err(err) = cleanup_session_artifacts(engine, root, session) {
            warn!(session = %session, error = %err, "cleanup of missing session");
        }
        let reason = format!("{reason_prefix}_not_found");
        if let Err(err) = append_lifecycle_event(engine, root, session, "lifecycle", "not_found", "idle", &reason) {
            warn!(session = %session, error = %err, "failed to append kill event");
        }
        return (false, None);
    }
    let result = engine.tmux.kill_session(session);
    let (state, status, reason, error) = match result {
        Ok(()) => ("terminated", "idle", format!("{reason_prefix}_success"), None),
        Err(err) => ("degraded", "idle", format!("{reason_prefix}_error"), Some(format!("{session}: {err}"))),
    };
    if error.is_none() {
        if let Err(err) = cleanup_session_artifacts(engine, root, session) {
            warn!(session = %session, error = %err, "cleanup after kill");
        }
    }
    if let Err(err) = append_lifecycle_event(engine, root, session, "lifecycle", state, status, &reason) {
        warn!(session = %session, error = %err, "failed to append kill event");
    }
    (true, error)
}

/// Descendants of `session` recorded under `root`, deepest first.
pub fn session_descendants(engine: &Engine, root: &str, session: &str) -> Vec<String> {
    let metas = list_project_session_metas(engine, root);
    let mut ordered = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::from([session.to_string()]);
    let mut frontier = vec![session.to_string()];
    while let Some(parent) = frontier.pop() {
        for meta in metas.iter().filter(|m| m.parent_session == parent) {
            if seen.insert(meta.session.clone()) {
                ordered.push(meta.session.clone());
                frontier.push(meta.session.clone());
            }
        }
    }
    ordered.reverse();
    ordered
}

pub fn kill_command(engine: &Engine, target: &Target) -> CommandOutput {
    run(|| {
        let session = target.require_session()?.to_string();
        let root = target.resolve_root(engine)?;
        let _scope = engine.runtime_scope(&root);
        if let Ok(None) = load_session_meta(engine, &root, &session) {
            if !engine.tmux.has_session(&session) {
                let _ = kill_one(engine, &root, &session, "kill");
                let mut out = CommandOutput::failure("session_not_found", "session not found");
                out.payload.insert("session".into(), json!(session));
                out.payload.insert("found".into(), json!(false));
                out.payload.insert("projectRoot".into(), json!(root));
                return Ok(out);
            }
        }

        let mut errors = Vec::new();
        let descendants = session_descendants(engine, &root, &session);
        for child in &descendants {
            if let (_, Some(error)) = kill_one(engine, &root, child, "kill_descendant") {
                errors.push(error);
            }
        }
        let (found, error) = kill_one(engine, &root, &session, "kill");
        errors.extend(error);

        let mut payload = obj(json!({
            "session": session,
            "ok": found && errors.is_empty(),
            "found": found,
            "projectRoot": root,
        }));
        if !descendants.is_empty() {
            payload.insert("descendants".into(), json!(descendants));
        }
        if !found {
            payload.insert("errorCode".into(), json!("session_not_found"));
            payload.insert("errors".into(), json!(errors));
            return Ok(CommandOutput::with_exit(payload, 1));
        }
        if !errors.is_empty() {
            payload.insert("errorCode".into(), json!("session_kill_failed"));
            payload.insert("errors".into(), json!(errors));
            return Ok(CommandOutput::with_exit(payload, 1));
        }
        info!(session = %session, descendants = descendants.len(), "session killed");
        Ok(CommandOutput::ok(payload))
    })
}

#[derive(Debug, Clone, Default)]
pub struct KillAllRequest {
    pub project_root: String,
    pub project_only: bool,
}

pub fn kill_all_command(engine: &Engine, req: &KillAllRequest) -> CommandOutput {
    run(|| {
        let root = canonical_project_root(&req.project_root);
        let _scope = engine.runtime_scope(&root);
        let sessions = engine
            .tmux
            .list_sessions(req.project_only, &root)
            .map_err(|e| LisaError::coded("session_list_failed", format!("failed to list sessions: {e}")))?;
        let mut killed = 0;
        let mut errors = Vec::new();
        for session in &sessions {
            match kill_one(engine, &root, session, "kill_all") {
                (true, None) => killed += 1,
                (_, Some(error)) => errors.push(error),
                (false, None) => {}
            }
        }
        let mut payload = obj(json!({
            "ok": errors.is_empty(),
            "killed": killed,
            "total": sessions.len(),
            "projectOnly": req.project_only,
            "projectRoot": root,
        }));
        if !errors.is_empty() {
            payload.insert("errorCode".into(), json!("session_kill_all_failed"));
            payload.insert("errors".into(), json!(errors));
            return Ok(CommandOutput::with_exit(payload, 1));
        }
        info!(killed, "sessions killed");
        Ok(CommandOutput::ok(payload))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::read_session_event_tail;
    use crate::registry::lane::{lane_command, LaneRecord, LaneRequest};
    use crate::testing::{FakeTmuxAdapter, FixedClock};
    use crate::tmux::TmuxAdapter;
    use chrono::{TimeZone, Utc};
    use lisa_protocol::str_field;
    use std::sync::Arc;
    use tempfile::TempDir;

    const ROOT: &str = "/tmp/lisa-lifecycle-repo";

    fn setup() -> (TempDir, Engine, Arc<FakeTmuxAdapter>, Arc<FixedClock>) {
        let tmp = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let (engine, tmux, clock) = Engine::with_fakes(tmp.path(), now);
        (tmp, engine, tmux, clock)
    }

    fn spawn(engine: &Engine, session: &str) -> CommandOutput {
        spawn_command(
            engine,
            &SpawnRequest {
                project_root: ROOT.into(),
                session: session.into(),
                agent: "codex".into(),
                mode: "exec".into(),
                prompt: "fix the tests".into(),
                ..SpawnRequest::default()
            },
        )
    }

    fn last_reason(engine: &Engine, session: &str) -> String {
        let tail = read_session_event_tail(engine, ROOT, session, 1).unwrap();
        tail.events.last().map(|e| e.reason.clone()).unwrap_or_default()
    }

    #[test]
    fn test_generated_name_shape() {
        let (_tmp, engine, _, _) = setup();
        let name = generate_session_name(&engine, "/work/My Repo!", "codex", "exec", "Build Fix");
        assert_eq!(name, "lisa-myrepo-260304-050607-000000000-codex-exec-buildfix");
    }

    #[test]
    fn test_spawn_writes_meta_and_starts_session() {
        let (_tmp, engine, tmux, _) = setup();
        let out = spawn(&engine, "lisa-w1");
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        assert_eq!(str_field(&out.payload, "session"), "lisa-w1");
        assert!(str_field(&out.payload, "command").starts_with("codex exec 'fix the tests'"));

        let pane = tmux.pane_state("lisa-w1").unwrap();
        assert!(pane.command.starts_with("bash '"));
        assert_eq!(pane.env.get("LISA_SESSION_NAME").map(String::as_str), Some("lisa-w1"));
        assert_eq!(pane.env.get("LISA_MODE").map(String::as_str), Some("exec"));

        let meta = load_session_meta(&engine, ROOT, "lisa-w1").unwrap().unwrap();
        assert_eq!(meta.agent, "codex");
        assert_eq!(meta.run_id, str_field(&out.payload, "runId"));
        assert_eq!(meta.created_at, "2026-03-04T05:06:07Z");
        assert!(engine.paths.heartbeat_file(ROOT, "lisa-w1").exists());
        assert_eq!(last_reason(&engine, "lisa-w1"), "spawn_success");
    }

    #[test]
    fn test_spawn_rejects_bad_names_and_duplicates() {
        let (_tmp, engine, tmux, _) = setup();
        assert_eq!(spawn(&engine, "worker").error_code(), Some("invalid_session_name"));
        tmux.add_session("lisa-taken", "");
        assert_eq!(spawn(&engine, "lisa-taken").error_code(), Some("session_already_exists"));
        let out = spawn_command(
            &engine,
            &SpawnRequest {
                project_root: ROOT.into(),
                width: Some(0),
                ..SpawnRequest::default()
            },
        );
        assert_eq!(out.error_code(), Some("invalid_width"));
    }

    #[test]
    fn test_spawn_dry_run_touches_nothing() {
        let (_tmp, engine, tmux, _) = setup();
        let out = spawn_command(
            &engine,
            &SpawnRequest {
                project_root: ROOT.into(),
                session: "lisa-dry".into(),
                agent: "codex".into(),
                mode: "exec".into(),
                prompt: "use ./lisa to spawn workers".into(),
                dry_run: true,
                detect_nested: true,
                ..SpawnRequest::default()
            },
        );
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        assert_eq!(out.payload["dryRun"], true);
        assert_eq!(out.payload["width"], DEFAULT_WIDTH);
        assert_eq!(out.payload["env"]["LISA_AGENT"], "codex");
        assert_eq!(out.payload["nestedDetection"]["autoBypass"], true);
        let startup = str_field(&out.payload, "startupCommand");
        assert!(startup.contains(EXEC_DONE_PREFIX));
        assert!(startup.contains(SESSION_DONE_PREFIX));
        assert!(!tmux.has_session("lisa-dry"));
        assert!(!engine.paths.meta_file(ROOT, "lisa-dry").exists());
    }

    #[test]
    fn test_spawn_fills_from_lane() {
        let (_tmp, engine, tmux, _) = setup();
        let lane = lane_command(
            &engine,
            &LaneRequest {
                target: Target::new("", ROOT),
                name: "fast".into(),
                fields: LaneRecord {
                    agent: "codex".into(),
                    mode: "interactive".into(),
                    ..LaneRecord::default()
                },
                ..LaneRequest::default()
            },
        );
        assert_eq!(lane.exit_code, 0, "{:?}", lane.payload);
        let out = spawn_command(
            &engine,
            &SpawnRequest {
                project_root: ROOT.into(),
                session: "lisa-lane".into(),
                lane: "fast".into(),
                ..SpawnRequest::default()
            },
        );
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        assert_eq!(out.payload["agent"], "codex");
        assert_eq!(out.payload["lane"], "fast");
        assert!(tmux.has_session("lisa-lane"));

        let missing = spawn_command(
            &engine,
            &SpawnRequest {
                project_root: ROOT.into(),
                lane: "nope".into(),
                ..SpawnRequest::default()
            },
        );
        assert_eq!(missing.error_code(), Some("lane_not_found"));
    }

    #[test]
    fn test_spawn_tmux_failure_records_degraded_event() {
        let (_tmp, engine, tmux, _) = setup();
        tmux.fail_new_session(Some("no server"));
        let out = spawn(&engine, "lisa-fail");
        assert_eq!(out.error_code(), Some("spawn_tmux_new_failed"));
        assert!(!engine.paths.meta_file(ROOT, "lisa-fail").exists());
        assert_eq!(last_reason(&engine, "lisa-fail"), "spawn_tmux_new_error");
    }

    #[test]
    fn test_exists_reports_missing_with_exit_one() {
        let (_tmp, engine, tmux, _) = setup();
        tmux.add_session("lisa-up", "");
        let out = exists_command(&engine, &Target::new("lisa-up", ROOT));
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.payload["exists"], true);
        let out = exists_command(&engine, &Target::new("lisa-gone", ROOT));
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.payload["exists"], false);
        assert_eq!(out.error_code(), Some("session_not_found"));
        assert_eq!(
            exists_command(&engine, &Target::new("", ROOT)).error_code(),
            Some("missing_required_flag")
        );
    }

    #[test]
    fn test_kill_takes_descendants_and_keeps_events() {
        let (_tmp, engine, tmux, _) = setup();
        assert_eq!(spawn(&engine, "lisa-parent").exit_code, 0);
        std::env::set_var(SESSION_NAME_ENV, "lisa-parent");
        let child = spawn(&engine, "lisa-child");
        std::env::remove_var(SESSION_NAME_ENV);
        assert_eq!(child.exit_code, 0);
        assert_eq!(
            load_session_meta(&engine, ROOT, "lisa-child").unwrap().unwrap().parent_session,
            "lisa-parent"
        );

        let out = kill_command(&engine, &Target::new("lisa-parent", ROOT));
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        assert_eq!(out.payload["descendants"], json!(["lisa-child"]));
        assert!(!tmux.has_session("lisa-parent"));
        assert!(!tmux.has_session("lisa-child"));
        assert!(!engine.paths.meta_file(ROOT, "lisa-child").exists());
        assert!(engine.paths.events_file(ROOT, "lisa-parent").exists());
        assert_eq!(last_reason(&engine, "lisa-child"), "kill_descendant_success");
        assert_eq!(last_reason(&engine, "lisa-parent"), "kill_success");
    }

    #[test]
    fn test_kill_missing_session_fails() {
        let (_tmp, engine, _, _) = setup();
        let out = kill_command(&engine, &Target::new("lisa-none", ROOT));
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("session_not_found"));
        assert_eq!(out.payload["found"], false);
    }

    #[test]
    fn test_kill_all_counts_sessions() {
        let (_tmp, engine, tmux, _) = setup();
        tmux.add_session("lisa-a", "");
        tmux.add_session("lisa-b", "");
        let out = kill_all_command(
            &engine,
            &KillAllRequest {
                project_root: ROOT.into(),
                project_only: true,
            },
        );
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        assert_eq!(out.payload["killed"], 2);
        assert_eq!(out.payload["total"], 2);
        assert!(!tmux.has_session("lisa-a"));
    }

    #[test]
    fn test_name_is_deterministic_under_fixed_clock() {
        let (_tmp, engine, _, _) = setup();
        let out = name_command(
            &engine,
            &NameRequest {
                project_root: "/work/api".into(),
                agent: "codex".into(),
                ..NameRequest::default()
            },
        );
        assert_eq!(out.payload["session"], "lisa-api-260304-050607-000000000-codex-interactive");
        assert_eq!(
            name_command(&engine, &NameRequest { agent: "gpt".into(), ..NameRequest::default() }).error_code(),
            Some("invalid_agent")
        );
    }
}
