//! `session context-pack`: a session's pack with strategy overrides, or a
//! pack rebuilt offline from a saved handoff payload (`--from-handoff`).

use super::{
    build_context_pack_raw, event_lines, item_lines, live_capture_tail, PackLimits, PackStrategy, NO_LIVE_CAPTURE,
    PACK_MEMORY_LINES,
};
use crate::classifier::next_action_for_state;
use crate::command::{obj, run, Target};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::events::{read_session_event_tail, HandoffItem};
use crate::meta::{load_session_meta, parse_agent_hint, parse_mode_hint};
use crate::monitor::capture_next_offset;
use crate::payload::{apply_redaction_rules, parse_redaction_rules, read_text_source, truncate_to_token_budget};
use crate::registry::memory::load_session_memory_compact;
use crate::registry::objective::{objective_payload_from_meta, objective_summary_line};
use crate::session::{normalized_status, resolve_and_compute};
use crate::types::{SessionMeta, SessionStatus};
use lisa_protocol::CommandOutput;
use serde_json::{json, Value};
use tracing::{debug, warn};

const FROM_HANDOFF_NO_CAPTURE: &str = "(from handoff: capture unavailable)";

/// The parts of a `session handoff` payload a pack can be rebuilt from.
/// Flat (v1) and nested (`state{}` in v2/v3) layouts are both accepted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandoffInput {
    pub session: String,
    pub status: String,
    pub session_state: String,
    pub reason: String,
    pub next_offset: usize,
    pub recent: Vec<HandoffItem>,
    pub capture_tail: String,
}

impl HandoffInput {
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw.trim()).map_err(|e| {
            LisaError::invalid("invalid_from_handoff", format!("invalid --from-handoff payload: {e}"))
        })?;
        let Value::Object(map) = value else {
            return Err(LisaError::invalid(
                "invalid_from_handoff",
                "invalid --from-handoff payload: expected a JSON object",
            ));
        };
        let nested = map.get("state").and_then(Value::as_object);
        let field = |key: &str| -> String {
            map.get(key)
                .and_then(Value::as_str)
                .or_else(|| nested.and_then(|s| s.get(key)).and_then(Value::as_str))
                .unwrap_or_default()
                .trim()
                .to_string()
        };
        let recent = map
            .get("recent")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value::<HandoffItem>(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            session: field("session"),
            status: field("status"),
            session_state: field("sessionState"),
            reason: field("reason"),
            next_offset: map
                .get("nextOffset")
                .and_then(Value::as_u64)
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(0),
            recent,
            capture_tail: field("captureTail"),
        })
    }

    /// Status as the pack header reports it.
    fn to_status(&self) -> SessionStatus {
        let state = if self.session_state.is_empty() {
            "in_progress".to_string()
        } else {
            self.session_state.clone()
        };
        let status = if self.status.is_empty() {
            state.clone()
        } else {
            self.status.clone()
        };
        let reason = if self.reason.is_empty() {
            "from_handoff".to_string()
        } else {
            self.reason.clone()
        };
        normalized_status(SessionStatus {
            session: self.session.clone(),
            status,
            session_state: state,
            classification_reason: reason,
            ..SessionStatus::default()
        })
    }
}

#[derive(Debug, Clone)]
pub struct ContextPackRequest {
    pub target: Target,
    pub agent_hint: String,
    pub mode_hint: String,
    pub strategy: String,
    pub limits: PackLimits,
    /// Handoff JSON file, or `-` for stdin.
    pub from_handoff: String,
    pub redact: String,
    pub json_min: bool,
}

impl Default for ContextPackRequest {
    fn default() -> Self {
        Self {
            target: Target::default(),
            agent_hint: "auto".to_string(),
            mode_hint: "auto".to_string(),
            strategy: "balanced".to_string(),
            limits: PackLimits::default(),
            from_handoff: String::new(),
            redact: String::new(),
            json_min: false,
        }
    }
}

/// Gathered inputs for the pack body.
struct PackSource {
    root: String,
    status: SessionStatus,
    recent: Vec<String>,
    dropped: usize,
    capture_tail: String,
    next_offset: usize,
}

fn source_from_handoff(engine: &Engine, req: &ContextPackRequest) -> Result<(String, PackSource)> {
    let raw = read_text_source("--from-handoff", "invalid_from_handoff", &req.from_handoff)?;
    let input = HandoffInput::parse(&raw)?;
    let requested = req.target.session.trim();
    if !requested.is_empty() && !input.session.is_empty() && requested != input.session {
        return Err(LisaError::invalid(
            "from_handoff_session_mismatch",
            format!(
                "--from-handoff session {:?} does not match --for {:?}",
                input.session, requested
            ),
        ));
    }
    let session = if requested.is_empty() {
        input.session.clone()
    } else {
        requested.to_string()
    };
    let target = Target {
        session: session.clone(),
        ..req.target.clone()
    };
    target.require_session()?;
    let root = target.resolve_root(engine)?;
    let capture_tail = if input.capture_tail.is_empty() {
        FROM_HANDOFF_NO_CAPTURE.to_string()
    } else {
        input.capture_tail.clone()
    };
    let mut status = input.to_status();
    status.session = session.clone();
    Ok((
        session,
        PackSource {
            root,
            status,
            recent: item_lines(&input.recent),
            dropped: 0,
            capture_tail,
            next_offset: input.next_offset,
        },
    ))
}

fn source_from_live(
    engine: &Engine,
    req: &ContextPackRequest,
    events: usize,
    lines: usize,
) -> Result<(String, PackSource)> {
    let (root, status) = resolve_and_compute(engine, &req.target, &req.agent_hint, &req.mode_hint, false)?;
    let session = req.target.session.clone();
    let (recent, dropped) = match read_session_event_tail(engine, &root, &session, events) {
        Ok(tail) => (event_lines(&tail.events), tail.dropped_lines),
        Err(err) => {
            warn!(session = %session, error = %err, "context-pack event tail unavailable");
            (Vec::new(), 0)
        }
    };
    let (capture_tail, next_offset) = {
        let _scope = engine.runtime_scope(&root);
        let tail = live_capture_tail(engine, &session, lines).filter(|t| !t.is_empty());
        (tail.unwrap_or_else(|| NO_LIVE_CAPTURE.to_string()), capture_next_offset(engine, &session))
    };
    Ok((
        session,
        PackSource {
            root,
            status,
            recent,
            dropped,
            capture_tail,
            next_offset,
        },
    ))
}

pub fn context_pack_command(engine: &Engine, req: &ContextPackRequest) -> CommandOutput {
    run(|| {
        let strategy = PackStrategy::parse(&req.strategy)?;
        let limits = req.limits.resolve(strategy)?;
        let rules = parse_redaction_rules(&req.redact)?;
        parse_agent_hint(&req.agent_hint)?;
        parse_mode_hint(&req.mode_hint)?;
        let from_handoff = req.from_handoff.trim();

        let (session, source) = if from_handoff.is_empty() {
            req.target.require_session()?;
            source_from_live(engine, req, limits.events, limits.lines)?
        } else {
            source_from_handoff(engine, req)?
        };
        let root = source.root.clone();
        let status = &source.status;

        let meta: Option<SessionMeta> = load_session_meta(engine, &root, &session).unwrap_or_else(|err| {
            warn!(session = %session, error = %err, "session meta unreadable");
            None
        });
        let objective = meta.as_ref().and_then(objective_payload_from_meta);
        let memory = load_session_memory_compact(engine, &root, &session, PACK_MEMORY_LINES);

        let mut raw = build_context_pack_raw(strategy, &session, status, &source.recent, &source.capture_tail);
        if let (Some(meta), Some(_)) = (&meta, &objective) {
            raw = format!("{}\nobjective:\n{}", raw.trim(), objective_summary_line(meta));
        }
        let memory_lines: Vec<String> = memory
            .as_ref()
            .and_then(|m| m.get("lines"))
            .and_then(Value::as_array)
            .map(|lines| lines.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        if !memory_lines.is_empty() {
            raw = format!("{}\nmemory:\n{}", raw.trim(), memory_lines.join("\n"));
        }
        let (pack, truncated) = truncate_to_token_budget(&raw, limits.token_budget);
        let pack = apply_redaction_rules(&pack, &rules);
        debug!(session = %session, strategy = strategy.as_str(), truncated, "context pack built");

        let mut payload = obj(json!({
            "session": session,
            "sessionState": status.session_state,
            "status": status.status,
            "reason": status.classification_reason,
            "nextAction": next_action_for_state(&status.session_state),
            "nextOffset": source.next_offset,
            "strategy": strategy.as_str(),
            "tokenBudget": limits.token_budget,
            "truncated": truncated,
            "pack": pack,
        }));
        if let Some(objective) = objective {
            payload.insert("objective".into(), Value::Object(objective));
        }
        if let Some(lane) = meta.as_ref().map(|m| m.lane.trim()).filter(|l| !l.is_empty()) {
            payload.insert("lane".into(), json!(lane));
        }
        if let Some(memory) = memory {
            payload.insert("memory".into(), Value::Object(memory));
        }
        if !req.json_min {
            payload.insert("projectRoot".into(), json!(root));
            payload.insert("events".into(), json!(source.recent.len()));
            payload.insert("droppedRecent".into(), json!(source.dropped));
            if !from_handoff.is_empty() {
                payload.insert("fromHandoff".into(), json!(from_handoff));
            }
        }
        if !rules.is_empty() {
            payload.insert("redactRules".into(), json!(rules));
        }
        if status.session_state == "not_found" {
            payload.insert("errorCode".into(), json!("session_not_found"));
            return Ok(CommandOutput::with_exit(payload, 1));
        }
        Ok(CommandOutput::ok(payload))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::save_session_meta;
    use chrono::Utc;
    use lisa_protocol::str_field;
    use tempfile::TempDir;

    fn request(session: &str) -> ContextPackRequest {
        ContextPackRequest {
            target: Target::new(session, "/repo"),
            ..ContextPackRequest::default()
        }
    }

    #[test]
    fn test_live_pack_includes_capture_and_objective() {
        let tmp = TempDir::new().unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        tmux.add_session("s1", "compiling lisa\nerror: missing semicolon");
        let meta = SessionMeta {
            session: "s1".into(),
            objective_id: "obj-1".into(),
            objective_goal: "ship the parser".into(),
            lane: "review".into(),
            ..SessionMeta::default()
        };
        save_session_meta(&engine, "/repo", "s1", &meta).unwrap();

        let out = context_pack_command(&engine, &request("s1"));
        assert_eq!(out.exit_code, 0);
        let pack = str_field(&out.payload, "pack");
        assert!(pack.contains("capture_tail:\n"));
        assert!(pack.contains("missing semicolon"));
        assert!(pack.contains("objective:\nid=obj-1 | goal=ship the parser"));
        assert_eq!(str_field(&out.payload, "lane"), "review");
        assert_eq!(str_field(&out.payload, "strategy"), "balanced");
        assert_eq!(out.payload["tokenBudget"], 700);
        assert_eq!(str_field(&out.payload, "projectRoot"), "/repo");
    }

    #[test]
    fn test_missing_session_exits_nonzero() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let out = context_pack_command(&engine, &request("gone"));
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("session_not_found"));
        assert!(str_field(&out.payload, "pack").contains(NO_LIVE_CAPTURE));
    }

    #[test]
    fn test_redaction_applies_after_truncation() {
        let tmp = TempDir::new().unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        tmux.add_session("s1", "contact dev@example.com");
        let out = context_pack_command(
            &engine,
            &ContextPackRequest {
                redact: "emails".into(),
                json_min: true,
                ..request("s1")
            },
        );
        let pack = str_field(&out.payload, "pack");
        assert!(pack.contains("[REDACTED_EMAIL]"));
        assert!(out.payload.get("projectRoot").is_none());
        assert_eq!(out.payload["redactRules"], json!(["emails"]));
    }

    #[test]
    fn test_pack_from_handoff_file() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let path = tmp.path().join("handoff.json");
        std::fs::write(
            &path,
            r#"{"session":"s1","state":{"status":"idle","sessionState":"waiting_input","reason":"prompt_waiting"},
               "nextOffset":42,"recent":[{"at":"t1","type":"snapshot","state":"in_progress","status":"active","reason":"r"}]}"#,
        )
        .unwrap();
        let out = context_pack_command(
            &engine,
            &ContextPackRequest {
                target: Target::new("", "/repo"),
                from_handoff: path.to_string_lossy().into_owned(),
                ..ContextPackRequest::default()
            },
        );
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        assert_eq!(str_field(&out.payload, "session"), "s1");
        assert_eq!(str_field(&out.payload, "nextAction"), "session send");
        assert_eq!(out.payload["nextOffset"], 42);
        let pack = str_field(&out.payload, "pack");
        assert!(pack.contains("t1 in_progress/active r"));
        assert!(pack.contains(FROM_HANDOFF_NO_CAPTURE));
    }

    #[test]
    fn test_handoff_session_mismatch() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let path = tmp.path().join("handoff.json");
        std::fs::write(&path, r#"{"session":"other"}"#).unwrap();
        let out = context_pack_command(
            &engine,
            &ContextPackRequest {
                from_handoff: path.to_string_lossy().into_owned(),
                ..request("s1")
            },
        );
        assert_eq!(out.error_code(), Some("from_handoff_session_mismatch"));
    }

    #[test]
    fn test_invalid_handoff_and_strategy() {
        assert_eq!(HandoffInput::parse("[1]").unwrap_err().code(), "invalid_from_handoff");
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let out = context_pack_command(
            &engine,
            &ContextPackRequest {
                strategy: "verbose".into(),
                ..request("s1")
            },
        );
        assert_eq!(out.error_code(), Some("invalid_strategy"));
    }
}
