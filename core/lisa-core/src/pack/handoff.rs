//! `session handoff`: status plus recent events in one of three schemas.
//!
//! - `v1` is flat.
//! - `v2` adds `state{}`, `nextAction{name, command}`, `risks[]` and
//!   `openQuestions[]`.
//! - `v3` stamps each of those with a `hid-` id derived only from the
//!   session, state, kind and ordinal, so repeated handoffs of the same
//!   situation carry the same ids.

use super::PACK_MEMORY_LINES;
use crate::capture::shell_quote;
use crate::classifier::next_action_for_state;
use crate::command::{obj, run, Target};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::events::{read_session_event_tail, read_session_handoff_delta, HandoffItem};
use crate::meta::{load_session_meta, parse_agent_hint, parse_mode_hint};
use crate::monitor::capture_next_offset;
use crate::payload::{load_cursor_offset, resolve_file_flag, write_cursor_offset};
use crate::registry::lane::load_lane_record;
use crate::registry::memory::load_session_memory_compact;
use crate::registry::objective::objective_payload_from_meta;
use crate::session::resolve_and_compute;
use lisa_protocol::{CommandOutput, Payload};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub const DEFAULT_HANDOFF_EVENTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum HandoffSchema {
    #[default]
    V1,
    V2,
    V3,
}

impl HandoffSchema {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "1" | "v1" => Ok(Self::V1),
            "2" | "v2" => Ok(Self::V2),
            "3" | "v3" => Ok(Self::V3),
            _ => Err(LisaError::invalid(
                "invalid_schema",
                format!("invalid --schema: {raw} (expected v1|v2|v3)"),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
            Self::V3 => "v3",
        }
    }
}

/// `hid-` plus the first 12 hex chars of SHA-256 over `session|state|kind|ordinal`.
pub fn handoff_id(session: &str, state: &str, kind: &str, ordinal: usize) -> String {
    let base = format!("{}|{}|{}|{ordinal}", session.trim(), state.trim(), kind.trim());
    let digest = hex::encode(Sha256::digest(base.as_bytes()));
    format!("hid-{}", &digest[..12])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandoffRisk {
    pub level: &'static str,
    pub code: &'static str,
    pub message: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandoffQuestion {
    pub code: &'static str,
    pub question: &'static str,
}

pub fn handoff_risks(state: &str, items: &[HandoffItem]) -> Vec<HandoffRisk> {
    let mut risks = Vec::new();
    match state {
        "crashed" | "stuck" => risks.push(HandoffRisk {
            level: "high",
            code: "terminal_failure",
            message: "session reached terminal failure state",
        }),
        "degraded" => risks.push(HandoffRisk {
            level: "medium",
            code: "degraded_loop",
            message: "session is degraded; monitor and recovery may be required",
        }),
        _ => {}
    }
    if items.is_empty() {
        risks.push(HandoffRisk {
            level: "low",
            code: "no_recent_events",
            message: "handoff has no recent event history",
        });
    }
    risks
}

pub fn handoff_questions(state: &str, items: &[HandoffItem]) -> Vec<HandoffQuestion> {
    let mut questions = Vec::new();
    if state == "waiting_input" {
        questions.push(HandoffQuestion {
            code: "next_instruction",
            question: "What exact instruction should be sent next?",
        });
    }
    if items.is_empty() {
        questions.push(HandoffQuestion {
            code: "context_gap",
            question: "Should events be increased to include more execution history?",
        });
    }
    questions
}

/// Shell command that carries out `action` for the session.
pub fn recommended_command_for_action(action: &str, session: &str, root: &str) -> String {
    let s = shell_quote(session);
    let r = shell_quote(root);
    match action {
        "session send" => format!(
            "./lisa session send --session {s} --project-root {r} --text {} --enter --json-min",
            shell_quote("Continue from objective and latest state.")
        ),
        "session monitor" => format!("./lisa session monitor --session {s} --project-root {r} --json-min"),
        "session capture" => format!("./lisa session capture --session {s} --project-root {r} --raw --summary --json"),
        "session explain" => format!("./lisa session explain --session {s} --project-root {r} --events 40 --json-min"),
        "session spawn" => format!("./lisa session spawn --agent codex --mode interactive --project-root {r} --json"),
        _ => format!("./lisa session status --session {s} --project-root {r} --json-min"),
    }
}

#[derive(Debug, Clone)]
pub struct HandoffRequest {
    pub target: Target,
    pub agent_hint: String,
    pub mode_hint: String,
    pub events: usize,
    /// Event offset; empty means "tail" unless a cursor file supplies one.
    pub delta_from: String,
    pub cursor_file: String,
    pub schema: String,
    pub json_min: bool,
}

impl Default for HandoffRequest {
    fn default() -> Self {
        Self {
            target: Target::default(),
            agent_hint: "auto".to_string(),
            mode_hint: "auto".to_string(),
            events: DEFAULT_HANDOFF_EVENTS,
            delta_from: String::new(),
            cursor_file: String::new(),
            schema: "v1".to_string(),
            json_min: false,
        }
    }
}

fn parse_event_offset(raw: &str) -> Result<Option<usize>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<usize>().map(Some).map_err(|_| {
        LisaError::invalid(
            "invalid_delta_from",
            format!("invalid --delta-from: {raw} (expected a non-negative integer)"),
        )
    })
}

fn with_id(value: impl Serialize, id: String) -> Value {
    let mut value = serde_json::to_value(value).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.insert("id".into(), json!(id));
    }
    value
}

pub fn handoff_command(engine: &Engine, req: &HandoffRequest) -> CommandOutput {
    run(|| {
        let session = req.target.require_session()?.to_string();
        if req.events == 0 {
            return Err(LisaError::invalid("invalid_events", "invalid --events: must be > 0"));
        }
        let schema = HandoffSchema::parse(&req.schema)?;
        let mut delta_from = parse_event_offset(&req.delta_from)?;
        let cursor_path = resolve_file_flag("--cursor-file", &req.cursor_file)
            .map_err(|e| LisaError::invalid("invalid_cursor_file", e.to_string()))?;
        if let (Some(path), None) = (&cursor_path, delta_from) {
            let offset = load_cursor_offset(path)
                .map_err(|e| LisaError::invalid("invalid_cursor_file", format!("invalid --cursor-file: {e}")))?;
            delta_from = Some(offset);
        }
        parse_agent_hint(&req.agent_hint)?;
        parse_mode_hint(&req.mode_hint)?;
        let root = req.target.resolve_root(engine)?;

        let meta = load_session_meta(engine, &root, &session).unwrap_or_else(|err| {
            warn!(session = %session, error = %err, "session meta unreadable");
            None
        });
        let lane_name = meta.as_ref().map(|m| m.lane.trim().to_string()).unwrap_or_default();
        let lane = if lane_name.is_empty() {
            None
        } else {
            load_lane_record(engine, &root, &lane_name).unwrap_or_else(|err| {
                warn!(lane = %lane_name, error = %err, "lane record unreadable");
                None
            })
        };
        if let Some(lane) = &lane {
            if schema == HandoffSchema::V1 && lane.requires_handoff_v2() {
                return Err(LisaError::invalid(
                    "handoff_schema_v2_required",
                    format!(
                        "handoff_schema_v2_required: lane {:?} contract {:?} requires --schema v2",
                        lane_name,
                        lane.contract.trim()
                    ),
                ));
            }
        }

        let (root, status) = resolve_and_compute(
            engine,
            &Target {
                project_root: root,
                explicit_root: true,
                ..req.target.clone()
            },
            &req.agent_hint,
            &req.mode_hint,
            false,
        )?;
        let state = status.session_state.as_str();

        let mut next_delta_offset = None;
        let (items, dropped) = match delta_from {
            Some(offset) => {
                let delta = read_session_handoff_delta(engine, &root, &session, offset, req.events).map_err(|e| {
                    LisaError::coded("handoff_delta_read_failed", format!("failed to read handoff delta: {e}"))
                })?;
                next_delta_offset = Some(delta.total);
                (delta.items, delta.dropped)
            }
            None => match read_session_event_tail(engine, &root, &session, req.events) {
                Ok(tail) => (tail.events.iter().map(HandoffItem::from).collect(), tail.dropped_lines),
                Err(err) => {
                    warn!(session = %session, error = %err, "handoff event tail unavailable");
                    (Vec::new(), 0)
                }
            },
        };
        let next_offset = {
            let _scope = engine.runtime_scope(&root);
            capture_next_offset(engine, &session)
        };
        let next_action = next_action_for_state(state);
        let summary = format!(
            "state={} reason={} next={}",
            state, status.classification_reason, next_action
        );
        if let (Some(path), Some(next)) = (&cursor_path, next_delta_offset) {
            write_cursor_offset(path, next)?;
        }

        let mut payload = obj(json!({
            "session": session,
            "status": status.status,
            "sessionState": state,
            "schema": schema.as_str(),
            "reason": status.classification_reason,
            "nextAction": next_action,
            "nextOffset": next_offset,
            "summary": summary,
        }));
        if let Some(objective) = meta.as_ref().and_then(objective_payload_from_meta) {
            payload.insert("objective".into(), Value::Object(objective));
        }
        if !lane_name.is_empty() {
            let mut lane_payload: Payload = obj(json!({ "name": lane_name }));
            if let Some(lane) = &lane {
                if !lane.contract.trim().is_empty() {
                    lane_payload.insert("contract".into(), json!(lane.contract));
                }
                if lane.budget > 0 {
                    lane_payload.insert("budget".into(), json!(lane.budget));
                }
                if !lane.goal.trim().is_empty() {
                    lane_payload.insert("goal".into(), json!(lane.goal));
                }
            }
            payload.insert("lane".into(), Value::Object(lane_payload));
        }
        if let Some(memory) = load_session_memory_compact(engine, &root, &session, PACK_MEMORY_LINES) {
            payload.insert("memory".into(), Value::Object(memory));
        }
        if !req.json_min {
            payload.insert("projectRoot".into(), json!(root));
            payload.insert("recent".into(), json!(items));
            payload.insert("droppedRecent".into(), json!(dropped));
        }
        if let (Some(from), Some(next)) = (delta_from, next_delta_offset) {
            payload.insert("deltaFrom".into(), json!(from));
            payload.insert("nextDeltaOffset".into(), json!(next));
            payload.insert("deltaCount".into(), json!(items.len()));
            if req.json_min {
                payload.insert("recent".into(), json!(items));
            }
        }
        if let Some(path) = cursor_path.as_ref().filter(|_| !req.json_min) {
            payload.insert("cursorFile".into(), json!(path.to_string_lossy()));
        }

        if schema >= HandoffSchema::V2 {
            let risks = handoff_risks(state, &items);
            let questions = handoff_questions(state, &items);
            let command = recommended_command_for_action(next_action, &session, &root);
            let mut state_obj = obj(json!({
                "status": status.status,
                "sessionState": state,
                "reason": status.classification_reason,
                "summary": summary,
            }));
            let mut next_obj = obj(json!({ "name": next_action, "command": command }));
            if schema == HandoffSchema::V3 {
                state_obj.insert("id".into(), json!(handoff_id(&session, state, "state", 0)));
                next_obj.insert(
                    "id".into(),
                    json!(handoff_id(&session, state, &format!("nextAction:{next_action}"), next_offset)),
                );
                let risks: Vec<Value> = risks
                    .iter()
                    .enumerate()
                    .map(|(i, r)| with_id(r, handoff_id(&session, state, &format!("risk:{}", r.code), i)))
                    .collect();
                let questions: Vec<Value> = questions
                    .iter()
                    .enumerate()
                    .map(|(i, q)| with_id(q, handoff_id(&session, state, &format!("question:{}", q.code), i)))
                    .collect();
                payload.insert("risks".into(), json!(risks));
                payload.insert("openQuestions".into(), json!(questions));
            } else {
                payload.insert("risks".into(), json!(risks));
                payload.insert("openQuestions".into(), json!(questions));
            }
            payload.insert("state".into(), Value::Object(state_obj));
            payload.insert("nextAction".into(), Value::Object(next_obj));
        }
        debug!(session = %session, schema = schema.as_str(), items = items.len(), "handoff built");

        if state == "not_found" {
            payload.insert("errorCode".into(), json!("session_not_found"));
            return Ok(CommandOutput::with_exit(payload, 1));
        }
        Ok(CommandOutput::ok(payload))
    })
}
