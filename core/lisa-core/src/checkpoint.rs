//! `session checkpoint` and `session replay`.
//!
//! A checkpoint bundle freezes one status poll, the recent events, the pane
//! tail and a budgeted pack. Replay turns a bundle into a two-step command
//! plan without touching tmux, so the same bundle always yields the same
//! plan and `deterministicId`.

use crate::capture::shell_quote;
use crate::command::{obj, run, Target};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::lock::with_exclusive_lock;
use crate::events::{read_session_event_tail, HandoffItem};
use crate::monitor::capture_next_offset;
use crate::pack::{build_context_pack_raw, event_lines, live_capture_tail, PackLimits, PackStrategy, NO_LIVE_CAPTURE};
use crate::classifier::next_action_for_state;
use crate::payload::{resolve_file_flag, truncate_to_token_budget};
use crate::router::DEFAULT_ROUTE_MODEL;
use crate::session::resolve_and_compute;
use crate::storage::{read_optional, save_json_pretty};
use lisa_protocol::CommandOutput;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CHECKPOINT_VERSION: &str = "1";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckpointBundle {
    pub version: String,
    pub saved_at: String,
    pub project_root: String,
    pub session: String,
    pub status: String,
    pub session_state: String,
    pub reason: String,
    pub next_action: String,
    pub next_offset: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent: Vec<HandoffItem>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub context_pack: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub capture_tail: String,
}

impl CheckpointBundle {
    /// `<session>|<state>|<nextAction>|<nextOffset>`
    pub fn deterministic_id(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.session, self.session_state, self.next_action, self.next_offset
        )
    }
}

/// Reads a bundle. The version is not checked; a bundle without a session
/// is rejected.
pub fn load_checkpoint_bundle(path: &Path) -> Result<CheckpointBundle> {
    let raw = read_optional(path)?
        .ok_or_else(|| LisaError::invalid("checkpoint_read_failed", format!("{} does not exist", path.display())))?;
    let bundle: CheckpointBundle =
        serde_json::from_str(&raw).map_err(|e| LisaError::json(path.display().to_string(), e))?;
    if bundle.session.trim().is_empty() {
        return Err(LisaError::invalid("checkpoint_read_failed", "checkpoint missing session"));
    }
    Ok(bundle)
}

fn required_file(flag: &str, code: &str, raw: &str) -> Result<PathBuf> {
    resolve_file_flag(flag, raw)
        .map_err(|e| LisaError::invalid(code, e.to_string()))?
        .ok_or_else(|| LisaError::MissingRequiredFlag { flag: flag.into() })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Checkpoint
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointAction {
    #[default]
    Save,
    Resume,
}

impl CheckpointAction {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "save" => Ok(Self::Save),
            "resume" => Ok(Self::Resume),
            other => Err(LisaError::invalid(
                "invalid_action",
                format!("invalid action: {other} (expected save|resume)"),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    pub action: String,
    pub target: Target,
    pub file: String,
    pub strategy: String,
    pub limits: PackLimits,
    pub json_min: bool,
}

impl Default for CheckpointRequest {
    fn default() -> Self {
        Self {
            action: "save".into(),
            target: Target::default(),
            file: String::new(),
            strategy: "balanced".into(),
            limits: PackLimits::default(),
            json_min: false,
        }
    }
}

pub fn checkpoint_command(engine: &Engine, req: &CheckpointRequest) -> CommandOutput {
    run(|| {
        let action = CheckpointAction::parse(&req.action)?;
        let path = required_file("--file", "invalid_file_path", &req.file)?;
        let file = path.to_string_lossy().into_owned();
        match action {
            CheckpointAction::Resume => {
                let bundle = load_checkpoint_bundle(&path).map_err(|e| {
                    LisaError::coded("checkpoint_read_failed", format!("failed reading checkpoint: {e}"))
                })?;
                let session = req.target.session.as_str();
                if !session.is_empty() && session != bundle.session {
                    return Err(LisaError::invalid(
                        "checkpoint_session_mismatch",
                        format!("session mismatch: --session={session} checkpoint={}", bundle.session),
                    ));
                }
                let mut payload = obj(json!({
                    "ok": true,
                    "action": "resume",
                    "file": file,
                    "session": bundle.session,
                    "projectRoot": bundle.project_root,
                    "sessionState": bundle.session_state,
                    "nextAction": bundle.next_action,
                }));
                if !req.json_min {
                    payload.insert("checkpoint".into(), json!(bundle));
                }
                Ok(CommandOutput::ok(payload))
            }
            CheckpointAction::Save => {
                let strategy = PackStrategy::parse(&req.strategy)?;
                let limits = req.limits.resolve(strategy)?;
                let (root, status) = resolve_and_compute(engine, &req.target, "auto", "auto", false)?;
                let session = req.target.session.clone();
                if status.session_state == "not_found" {
                    return Err(LisaError::SessionNotFound(session));
                }
                let recent = match read_session_event_tail(engine, &root, &session, limits.events) {
                    Ok(tail) => tail.events,
                    Err(err) => {
                        warn!(session = %session, error = %err, "checkpoint event tail unavailable");
                        Vec::new()
                    }
                };
                let (capture_tail, next_offset) = {
                    let _scope = engine.runtime_scope(&root);
                    (
                        live_capture_tail(engine, &session, limits.lines).unwrap_or_else(|| NO_LIVE_CAPTURE.to_string()),
                        capture_next_offset(engine, &session),
                    )
                };
                let raw = build_context_pack_raw(strategy, &session, &status, &event_lines(&recent), &capture_tail);
                let (pack, _) = truncate_to_token_budget(&raw, limits.token_budget);

                let bundle = CheckpointBundle {
                    version: CHECKPOINT_VERSION.into(),
                    saved_at: engine.now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                    project_root: root.clone(),
                    session: session.clone(),
                    status: status.status.clone(),
                    session_state: status.session_state.clone(),
                    reason: status.classification_reason.clone(),
                    next_action: next_action_for_state(&status.session_state).to_string(),
                    next_offset: next_offset as i64,
                    recent: recent.iter().map(HandoffItem::from).collect(),
                    context_pack: pack,
                    capture_tail,
                };
                with_exclusive_lock(&path, engine.config.event_lock_timeout_ms, || {
                    save_json_pretty(&path, &bundle).map_err(|e| {
                        LisaError::coded("checkpoint_write_failed", format!("failed writing checkpoint: {e}"))
                    })
                })?;
                info!(session = %session, file = %file, "checkpoint saved");
                Ok(CommandOutput::ok(obj(json!({
                    "ok": true,
                    "action": "save",
                    "file": file,
                    "session": session,
                    "projectRoot": root,
                    "sessionState": bundle.session_state,
                    "nextAction": bundle.next_action,
                }))))
            }
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Replay
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayStep {
    pub id: &'static str,
    pub command: String,
    pub reason: &'static str,
}

/// Status probe first, then the command implied by the bundle's next action.
pub fn replay_steps_from_checkpoint(bundle: &CheckpointBundle, project_root: &str) -> Vec<ReplayStep> {
    let s = shell_quote(bundle.session.trim());
    let r = shell_quote(project_root);
    let next = match bundle.next_action.trim() {
        "session send" => format!(
            "./lisa session send --session {s} --project-root {r} --text {} --enter --json-min",
            shell_quote("Continue from checkpoint context.")
        ),
        "session monitor" => {
            format!("./lisa session monitor --session {s} --project-root {r} --expect terminal --json-min")
        }
        "session explain" => {
            format!("./lisa session explain --session {s} --project-root {r} --events 30 --json-min")
        }
        "session spawn" => format!(
            "./lisa session spawn --agent codex --mode interactive --project-root {r} --prompt {} --model {DEFAULT_ROUTE_MODEL} --json",
            shell_quote("Resume from checkpoint replay and continue.")
        ),
        _ => format!(
            "./lisa session capture --session {s} --project-root {r} --raw --delta-from {} --json-min",
            bundle.next_offset.max(0)
        ),
    };
    vec![
        ReplayStep {
            id: "status",
            command: format!("./lisa session status --session {s} --project-root {r} --json-min"),
            reason: "replay baseline status",
        },
        ReplayStep {
            id: "next",
            command: next,
            reason: "checkpoint nextAction replay",
        },
    ]
}

#[derive(Debug, Clone, Default)]
pub struct ReplayRequest {
    pub from_checkpoint: String,
    /// Overrides the bundle's root.
    pub project_root: String,
}

pub fn replay_command(engine: &Engine, req: &ReplayRequest) -> CommandOutput {
    run(|| {
        let path = required_file("--from-checkpoint", "invalid_checkpoint_path", &req.from_checkpoint)?;
        let bundle = load_checkpoint_bundle(&path).map_err(|e| {
            LisaError::coded("checkpoint_read_failed", format!("failed reading checkpoint: {e}"))
        })?;
        let root = [req.project_root.trim(), bundle.project_root.trim()]
            .into_iter()
            .find(|r| !r.is_empty())
            .map(|r| engine.canonical_root(r))
            .unwrap_or_else(|| engine.canonical_root(""));
        let steps = replay_steps_from_checkpoint(&bundle, &root);
        Ok(CommandOutput::ok(obj(json!({
            "ok": true,
            "session": bundle.session,
            "projectRoot": root,
            "checkpoint": path.to_string_lossy(),
            "nextAction": bundle.next_action,
            "sessionState": bundle.session_state,
            "deterministicId": bundle.deterministic_id(),
            "steps": steps,
        }))))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{acquire, lock_path_for, LockMode};
    use chrono::Utc;
    use lisa_protocol::str_field;
    use tempfile::TempDir;

    fn bundle(action: &str, offset: i64) -> CheckpointBundle {
        CheckpointBundle {
            version: "1".into(),
            session: "s1".into(),
            project_root: "/repo".into(),
            session_state: "in_progress".into(),
            next_action: action.into(),
            next_offset: offset,
            ..CheckpointBundle::default()
        }
    }

    #[test]
    fn test_deterministic_id_uses_observed_fields() {
        assert_eq!(bundle("session monitor", 42).deterministic_id(), "s1|in_progress|session monitor|42");
    }

    #[test]
    fn test_replay_steps_by_next_action() {
        let steps = replay_steps_from_checkpoint(&bundle("session monitor", 0), "/repo");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].id, "status");
        assert!(steps[1].command.contains("--expect terminal"));

        let capture = replay_steps_from_checkpoint(&bundle("session capture", -5), "/repo");
        assert!(capture[1].command.contains("--delta-from 0"));

        let spawn = replay_steps_from_checkpoint(&bundle("session spawn", 0), "/repo");
        assert!(spawn[1].command.contains(DEFAULT_ROUTE_MODEL));
    }

    #[test]
    fn test_save_then_resume_and_replay() {
        let tmp = TempDir::new().unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        tmux.add_session("s1", "compiling\nwarning: unused import");
        let file = tmp.path().join("cp.json").to_string_lossy().into_owned();

        let save = checkpoint_command(
            &engine,
            &CheckpointRequest {
                target: Target::new("s1", "/repo"),
                file: file.clone(),
                ..CheckpointRequest::default()
            },
        );
        assert_eq!(save.exit_code, 0, "{:?}", save.payload);
        let stored = load_checkpoint_bundle(Path::new(&file)).unwrap();
        assert_eq!(stored.version, CHECKPOINT_VERSION);
        assert!(stored.context_pack.starts_with("session=s1"));
        assert!(stored.capture_tail.contains("unused import"));

        let resume = checkpoint_command(
            &engine,
            &CheckpointRequest {
                action: "resume".into(),
                file: file.clone(),
                ..CheckpointRequest::default()
            },
        );
        assert_eq!(str_field(&resume.payload, "session"), "s1");
        assert_eq!(resume.payload["checkpoint"]["version"], "1");

        let replay = replay_command(
            &engine,
            &ReplayRequest {
                from_checkpoint: file,
                project_root: String::new(),
            },
        );
        assert_eq!(replay.exit_code, 0);
        assert_eq!(str_field(&replay.payload, "deterministicId"), stored.deterministic_id());
        assert_eq!(replay.payload["steps"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_resume_failures() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let file = tmp.path().join("cp.json");
        std::fs::write(&file, r#"{"version":"1"}"#).unwrap();
        let req = CheckpointRequest {
            action: "resume".into(),
            file: file.to_string_lossy().into_owned(),
            ..CheckpointRequest::default()
        };
        assert_eq!(checkpoint_command(&engine, &req).error_code(), Some("checkpoint_read_failed"));

        save_json_pretty(&file, &bundle("session monitor", 1)).unwrap();
        let mismatch = CheckpointRequest {
            target: Target::new("other", ""),
            ..req.clone()
        };
        assert_eq!(checkpoint_command(&engine, &mismatch).error_code(), Some("checkpoint_session_mismatch"));
        let missing = CheckpointRequest::default();
        assert_eq!(checkpoint_command(&engine, &missing).error_code(), Some("missing_required_flag"));
    }

    #[test]
    fn test_save_waits_for_bundle_lock() {
        let tmp = TempDir::new().unwrap();
        let (mut engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        engine.config.event_lock_timeout_ms = 20;
        tmux.add_session("s1", "compiling");
        let path = tmp.path().join("cp.json");
        let req = CheckpointRequest {
            target: Target::new("s1", "/repo"),
            file: path.to_string_lossy().into_owned(),
            ..CheckpointRequest::default()
        };

        let held = acquire(&lock_path_for(&path), LockMode::Exclusive, 100, "event lock").unwrap();
        let out = checkpoint_command(&engine, &req);
        assert_eq!(out.error_code(), Some("event_lock_timeout"));
        assert!(!path.exists());

        drop(held);
        assert_eq!(checkpoint_command(&engine, &req).exit_code, 0);
        assert!(path.exists());
    }

    #[test]
    fn test_save_rejects_missing_session() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let req = CheckpointRequest {
            target: Target::new("gone", "/repo"),
            file: tmp.path().join("cp.json").to_string_lossy().into_owned(),
            ..CheckpointRequest::default()
        };
        assert_eq!(checkpoint_command(&engine, &req).error_code(), Some("session_not_found"));
    }
}
