//! `session packet`: status, recent events, and a capture summary in one
//! payload. It is the last step of a turn.
//!
//! With `--delta-json` the packet is flattened to dotted keys and compared
//! against the previous flattening stored in the cursor file. Only the
//! field changes are reported.

use super::NO_LIVE_CAPTURE;
use crate::capture::{extract_semantic_lines, filter_capture_noise, tail_lines, trim_lines};
use crate::classifier::next_action_for_state;
use crate::clock::format_utc_seconds;
use crate::command::{obj, run, Target};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::events::{read_session_event_tail, read_session_handoff_delta, HandoffItem};
use crate::monitor::capture_next_offset;
use crate::payload::{
    load_cursor_offset, parse_projection_fields, project_payload_fields, resolve_file_flag, truncate_to_token_budget,
    write_cursor_offset,
};
use crate::session::resolve_and_compute;
use crate::storage::{read_optional, write_file_atomic};
use lisa_protocol::{CommandOutput, Payload};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

pub const DEFAULT_PACKET_LINES: usize = 120;
pub const DEFAULT_PACKET_EVENTS: usize = 8;
pub const DEFAULT_PACKET_TOKEN_BUDGET: i64 = 320;
/// Semantic lines kept by the `terse` summary.
const TERSE_SUMMARY_LINES: usize = 6;

// ═══════════════════════════════════════════════════════════════════════════════
// Summary
// ═══════════════════════════════════════════════════════════════════════════════

/// How the capture is condensed before budgeting.
///
/// - `terse`: the last few semantic lines.
/// - `ops`: every semantic line.
/// - `full`: the filtered capture as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SummaryStyle {
    Terse,
    #[default]
    Ops,
    Full,
}

impl SummaryStyle {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "ops" => Ok(Self::Ops),
            "terse" => Ok(Self::Terse),
            "full" => Ok(Self::Full),
            _ => Err(LisaError::invalid(
                "invalid_summary_style",
                format!("invalid --summary-style: {raw} (expected terse|ops|full)"),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terse => "terse",
            Self::Ops => "ops",
            Self::Full => "full",
        }
    }
}

/// Condenses `capture` by `style` and cuts it to `token_budget`.
pub fn summarize_capture(capture: &str, style: SummaryStyle, token_budget: i64) -> (String, bool) {
    let text = match style {
        SummaryStyle::Full => capture.to_string(),
        SummaryStyle::Ops | SummaryStyle::Terse => {
            let mut lines = extract_semantic_lines(capture);
            if style == SummaryStyle::Terse {
                lines = tail_lines(&lines, TERSE_SUMMARY_LINES);
            }
            if lines.is_empty() {
                capture.trim().to_string()
            } else {
                lines.join("\n")
            }
        }
    };
    truncate_to_token_budget(&text, token_budget)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Field Delta
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FieldDelta {
    pub added: Vec<FieldChange>,
    pub removed: Vec<FieldChange>,
    pub changed: Vec<FieldChange>,
    pub count: usize,
}

/// Nested objects become dotted keys; arrays and scalars are leaves.
pub fn flatten_payload_fields(payload: &Payload) -> BTreeMap<String, Value> {
    fn walk(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let next = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    walk(&next, child, out);
                }
            }
            leaf if !prefix.is_empty() => {
                out.insert(prefix.to_string(), leaf.clone());
            }
            _ => {}
        }
    }
    let mut out = BTreeMap::new();
    for (key, value) in payload {
        walk(key, value, &mut out);
    }
    out
}

/// Field-level changes from `previous` to `current`, each list sorted by field.
pub fn compute_field_delta(current: &BTreeMap<String, Value>, previous: &BTreeMap<String, Value>) -> FieldDelta {
    let mut delta = FieldDelta::default();
    for (field, after) in current {
        match previous.get(field) {
            None => delta.added.push(FieldChange {
                field: field.clone(),
                before: None,
                after: Some(after.clone()),
            }),
            Some(before) if before != after => delta.changed.push(FieldChange {
                field: field.clone(),
                before: Some(before.clone()),
                after: Some(after.clone()),
            }),
            Some(_) => {}
        }
    }
    for (field, before) in previous {
        if !current.contains_key(field) {
            delta.removed.push(FieldChange {
                field: field.clone(),
                before: Some(before.clone()),
                after: None,
            });
        }
    }
    delta.count = delta.added.len() + delta.removed.len() + delta.changed.len();
    delta
}

/// Cursor for `--delta-json`. A bare integer from an offset cursor loads as
/// `offset` with no fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PacketDeltaCursor {
    updated_at: String,
    fields: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "is_zero")]
    offset: usize,
}

fn is_zero(v: &usize) -> bool {
    *v == 0
}

fn load_packet_cursor(path: &Path) -> Result<PacketDeltaCursor> {
    let raw = read_optional(path)?.unwrap_or_default();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(PacketDeltaCursor::default());
    }
    match serde_json::from_str::<PacketDeltaCursor>(trimmed) {
        Ok(cursor) => Ok(cursor),
        Err(err) => match trimmed.parse::<i64>() {
            Ok(offset) => Ok(PacketDeltaCursor {
                offset: usize::try_from(offset).unwrap_or(0),
                ..PacketDeltaCursor::default()
            }),
            Err(_) => Err(LisaError::json(format!("packet cursor {}", path.display()), err)),
        },
    }
}

fn save_packet_cursor(path: &Path, cursor: &PacketDeltaCursor) -> Result<()> {
    let mut data = serde_json::to_vec(cursor).map_err(|e| LisaError::json("serialize packet cursor", e))?;
    data.push(b'\n');
    write_file_atomic(path, &data)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct PacketRequest {
    pub target: Target,
    pub agent_hint: String,
    pub mode_hint: String,
    pub lines: usize,
    pub events: usize,
    pub token_budget: i64,
    pub summary_style: String,
    pub cursor_file: String,
    pub delta_json: bool,
    pub fields: String,
    pub json_min: bool,
}

impl Default for PacketRequest {
    fn default() -> Self {
        Self {
            target: Target::default(),
            agent_hint: "auto".to_string(),
            mode_hint: "auto".to_string(),
            lines: DEFAULT_PACKET_LINES,
            events: DEFAULT_PACKET_EVENTS,
            token_budget: DEFAULT_PACKET_TOKEN_BUDGET,
            summary_style: "ops".to_string(),
            cursor_file: String::new(),
            delta_json: false,
            fields: String::new(),
            json_min: false,
        }
    }
}

fn validate(req: &PacketRequest) -> Result<()> {
    if req.lines == 0 {
        return Err(LisaError::invalid("invalid_lines", "invalid --lines: must be > 0"));
    }
    if req.events == 0 {
        return Err(LisaError::invalid("invalid_events", "invalid --events: must be > 0"));
    }
    if req.token_budget <= 0 {
        return Err(LisaError::invalid("invalid_token_budget", "invalid --token-budget: must be > 0"));
    }
    if req.delta_json && req.cursor_file.trim().is_empty() {
        return Err(LisaError::invalid(
            "cursor_file_required_for_delta_json",
            "--delta-json requires --cursor-file",
        ));
    }
    Ok(())
}

/// Filtered pane capture, then the output file, then the placeholder.
fn packet_capture(engine: &Engine, root: &str, session: &str, lines: usize, output_file: &str) -> Result<String> {
    let text = {
        let _scope = engine.runtime_scope(root);
        if engine.tmux.has_session(session) {
            let raw = engine
                .tmux
                .capture_pane(session, lines)
                .map_err(|e| LisaError::coded("capture_failed", format!("failed to capture pane: {e}")))?;
            trim_lines(&filter_capture_noise(&raw)).join("\n")
        } else if !output_file.trim().is_empty() {
            match std::fs::read_to_string(output_file) {
                Ok(raw) => trim_lines(&filter_capture_noise(&raw)).join("\n"),
                Err(err) => {
                    debug!(session = %session, error = %err, "output file unreadable");
                    String::new()
                }
            }
        } else {
            String::new()
        }
    };
    Ok(if text.trim().is_empty() {
        NO_LIVE_CAPTURE.to_string()
    } else {
        text
    })
}

pub fn packet_command(engine: &Engine, req: &PacketRequest) -> CommandOutput {
    run(|| {
        let session = req.target.require_session()?.to_string();
        validate(req)?;
        let fields = parse_projection_fields(&req.fields)?;
        let style = SummaryStyle::parse(&req.summary_style)?;
        let cursor_path = resolve_file_flag("--cursor-file", &req.cursor_file)
            .map_err(|e| LisaError::invalid("invalid_cursor_file", e.to_string()))?;

        let (root, status) = resolve_and_compute(engine, &req.target, &req.agent_hint, &req.mode_hint, false)?;
        let capture = packet_capture(engine, &root, &session, req.lines, &status.output_file)?;
        let (summary, truncated) = summarize_capture(&capture, style, req.token_budget);
        let next_action = next_action_for_state(&status.session_state);
        let next_offset = {
            let _scope = engine.runtime_scope(&root);
            capture_next_offset(engine, &session)
        };
        let not_found = status.session_state == "not_found";

        let mut payload = obj(json!({
            "session": session,
            "status": status.status,
            "sessionState": status.session_state,
            "reason": status.classification_reason,
            "nextAction": next_action,
            "nextOffset": next_offset,
            "summary": summary,
            "summaryStyle": style.as_str(),
            "tokenBudget": req.token_budget,
            "truncated": truncated,
        }));

        if req.delta_json {
            let Some(path) = cursor_path else {
                return Err(LisaError::invalid(
                    "cursor_file_required_for_delta_json",
                    "--delta-json requires --cursor-file",
                ));
            };
            if not_found {
                payload.insert("errorCode".into(), json!("session_not_found"));
            }
            if !fields.is_empty() {
                payload = project_payload_fields(&payload, &fields);
            }
            let current = flatten_payload_fields(&payload);
            let mut cursor = load_packet_cursor(&path)
                .map_err(|e| LisaError::invalid("invalid_cursor_file", format!("invalid --cursor-file: {e}")))?;
            let delta = compute_field_delta(&current, &cursor.fields);
            cursor.fields = current;
            cursor.updated_at = format_utc_seconds(engine.now());
            save_packet_cursor(&path, &cursor).map_err(|e| {
                LisaError::coded("cursor_file_write_failed", format!("failed writing --cursor-file: {e}"))
            })?;

            let mut out = obj(json!({
                "session": session,
                "delta": delta,
                "deltaCount": delta.count,
            }));
            if !req.json_min {
                out.insert("projectRoot".into(), json!(root));
                out.insert("cursorFile".into(), json!(path.to_string_lossy()));
            }
            if not_found {
                out.insert("errorCode".into(), json!("session_not_found"));
                return Ok(CommandOutput::with_exit(out, 1));
            }
            return Ok(CommandOutput::ok(out));
        }

        let mut delta_from = None;
        let (items, dropped): (Vec<HandoffItem>, usize) = match &cursor_path {
            Some(path) => {
                let from = load_cursor_offset(path)
                    .map_err(|e| LisaError::invalid("invalid_cursor_file", format!("invalid --cursor-file: {e}")))?;
                let delta = read_session_handoff_delta(engine, &root, &session, from, req.events).map_err(|e| {
                    LisaError::coded("handoff_delta_read_failed", format!("failed to read handoff delta: {e}"))
                })?;
                write_cursor_offset(path, delta.total)?;
                delta_from = Some((from, delta.total));
                (delta.items, delta.dropped)
            }
            None => match read_session_event_tail(engine, &root, &session, req.events) {
                Ok(tail) => (tail.events.iter().map(HandoffItem::from).collect(), tail.dropped_lines),
                Err(err) => {
                    warn!(session = %session, error = %err, "packet event tail unavailable");
                    (Vec::new(), 0)
                }
            },
        };

        if req.json_min {
            payload.insert("recent".into(), json!(items));
        } else {
            payload.insert("projectRoot".into(), json!(root));
            payload.insert("capture".into(), json!({ "lines": req.lines }));
            payload.insert(
                "handoff".into(),
                json!({ "events": items, "droppedRecent": dropped }),
            );
        }
        if let Some((from, next)) = delta_from {
            payload.insert("deltaFrom".into(), json!(from));
            payload.insert("nextDeltaOffset".into(), json!(next));
            payload.insert("deltaCount".into(), json!(items.len()));
            if let Some(path) = cursor_path.as_ref().filter(|_| !req.json_min) {
                payload.insert("cursorFile".into(), json!(path.to_string_lossy()));
            }
        }
        if not_found {
            payload.insert("errorCode".into(), json!("session_not_found"));
        }
        if !fields.is_empty() {
            payload = project_payload_fields(&payload, &fields);
        }
        debug!(session = %session, style = style.as_str(), truncated, "packet built");
        Ok(CommandOutput::with_exit(payload, if not_found { 1 } else { 0 }))
    })
}
