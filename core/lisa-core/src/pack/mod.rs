//! Size-bounded session summaries: `context-pack`, `packet`, `diff-pack`,
//! and `handoff`.
//!
//! A pack is a newline-joined `key=value` header followed by recent events
//! and the capture tail. The body is cut to a token budget first and
//! redacted second, so redaction tags never push a pack over budget by
//! more than the tag width.

mod context_pack;
mod diff_pack;
mod handoff;
mod packet;

pub use context_pack::{context_pack_command, ContextPackRequest, HandoffInput};
pub use diff_pack::{diff_pack_command, diff_pack_lines, DiffPackRequest, PackDiff};
pub use handoff::{
    handoff_command, handoff_id, handoff_questions, handoff_risks, recommended_command_for_action, HandoffRequest,
    HandoffSchema,
};
pub use packet::{
    compute_field_delta, flatten_payload_fields, packet_command, summarize_capture, FieldChange, FieldDelta,
    PacketRequest, SummaryStyle,
};

use crate::capture::{filter_capture_noise, trim_lines};
use crate::classifier::next_action_for_state;
use crate::command::Target;
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::events::{read_session_event_tail, HandoffItem};
use crate::monitor::capture_next_offset;
use crate::payload::{apply_redaction_rules, truncate_to_token_budget};
use crate::session::resolve_and_compute;
use crate::types::{SessionEvent, SessionStatus};
use tracing::warn;

/// Capture placeholder when the pane is gone or unreadable.
pub const NO_LIVE_CAPTURE: &str = "(no live capture)";
/// Lines kept from session memory in pack bodies and handoffs.
pub const PACK_MEMORY_LINES: usize = 8;

// ═══════════════════════════════════════════════════════════════════════════════
// Strategy
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackStrategy {
    Terse,
    #[default]
    Balanced,
    Full,
}

/// Per-strategy defaults for events, capture lines and token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyDefaults {
    pub events: usize,
    pub lines: usize,
    pub token_budget: i64,
}

impl PackStrategy {
    /// Empty input is `balanced`.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "balanced" => Ok(Self::Balanced),
            "terse" => Ok(Self::Terse),
            "full" => Ok(Self::Full),
            _ => Err(LisaError::invalid(
                "invalid_strategy",
                format!("invalid --strategy: {raw} (expected terse|balanced|full)"),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terse => "terse",
            Self::Balanced => "balanced",
            Self::Full => "full",
        }
    }

    pub fn defaults(&self) -> StrategyDefaults {
        let (events, lines, token_budget) = match self {
            Self::Terse => (4, 60, 400),
            Self::Balanced => (8, 120, 700),
            Self::Full => (20, 260, 1400),
        };
        StrategyDefaults {
            events,
            lines,
            token_budget,
        }
    }
}

/// Caller overrides on top of the strategy defaults. `None` keeps the default.
#[derive(Debug, Clone, Default)]
pub struct PackLimits {
    pub events: Option<usize>,
    pub lines: Option<usize>,
    pub token_budget: Option<i64>,
}

impl PackLimits {
    /// Effective limits; explicit zero or negative values are rejected.
    pub fn resolve(&self, strategy: PackStrategy) -> Result<StrategyDefaults> {
        let mut out = strategy.defaults();
        if let Some(events) = self.events {
            if events == 0 {
                return Err(LisaError::invalid("invalid_events", "invalid --events: must be > 0"));
            }
            out.events = events;
        }
        if let Some(lines) = self.lines {
            if lines == 0 {
                return Err(LisaError::invalid("invalid_lines", "invalid --lines: must be > 0"));
            }
            out.lines = lines;
        }
        if let Some(budget) = self.token_budget {
            if budget <= 0 {
                return Err(LisaError::invalid(
                    "invalid_token_budget",
                    "invalid --token-budget: must be > 0",
                ));
            }
            out.token_budget = budget;
        }
        Ok(out)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pack Body
// ═══════════════════════════════════════════════════════════════════════════════

/// `<at> <state>/<status> <reason>`
pub fn event_line(at: &str, state: &str, status: &str, reason: &str) -> String {
    format!("{at} {state}/{status} {reason}")
}

pub fn event_lines(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| event_line(&e.at, &e.state, &e.status, &e.reason))
        .collect()
}

pub fn item_lines(items: &[HandoffItem]) -> Vec<String> {
    items
        .iter()
        .map(|i| event_line(&i.at, &i.state, &i.status, &i.reason))
        .collect()
}

/// Unbudgeted pack text. `recent` is in append order; terse lists it newest first.
pub fn build_context_pack_raw(
    strategy: PackStrategy,
    session: &str,
    status: &SessionStatus,
    recent: &[String],
    capture_tail: &str,
) -> String {
    let mut lines = vec![
        format!("session={session}"),
        format!("state={}", status.session_state),
        format!("status={}", status.status),
        format!("reason={}", status.classification_reason),
        format!("next_action={}", next_action_for_state(&status.session_state)),
    ];
    if strategy == PackStrategy::Full {
        lines.push(format!("todos={}/{}", status.todos_done, status.todos_total));
        lines.push(format!("wait_estimate={}", status.wait_estimate));
        lines.push(format!("output_age_seconds={}", status.output_age_seconds));
        lines.push(format!("heartbeat_age_seconds={}", status.heartbeat_age));
        if !status.active_task.trim().is_empty() {
            lines.push(format!("active_task={}", status.active_task));
        }
    }
    if !recent.is_empty() {
        lines.push("recent_events:".to_string());
        if strategy == PackStrategy::Terse {
            lines.extend(recent.iter().rev().cloned());
        } else {
            lines.extend(recent.iter().cloned());
        }
    }
    lines.push("capture_tail:".to_string());
    lines.push(capture_tail.to_string());
    lines.join("\n")
}

/// Noise-filtered pane tail, or `None` when the session is gone or the
/// capture fails. Must run inside the project's runtime scope.
pub fn live_capture_tail(engine: &Engine, session: &str, lines: usize) -> Option<String> {
    if !engine.tmux.has_session(session) {
        return None;
    }
    match engine.tmux.capture_pane(session, lines) {
        Ok(raw) => Some(trim_lines(&filter_capture_noise(&raw)).join("\n")),
        Err(err) => {
            warn!(session = %session, error = %err, "pack capture failed");
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot
// ═══════════════════════════════════════════════════════════════════════════════

/// One budgeted pack plus the status it was built from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackSnapshot {
    pub session: String,
    pub project_root: String,
    pub status: String,
    pub session_state: String,
    pub reason: String,
    pub next_action: &'static str,
    pub next_offset: usize,
    pub pack: String,
    pub truncated: bool,
    pub events: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct PackOptions {
    pub strategy: PackStrategy,
    pub limits: StrategyDefaults,
    pub redact: Vec<String>,
}

impl PackOptions {
    pub fn new(strategy: PackStrategy) -> Self {
        Self {
            strategy,
            limits: strategy.defaults(),
            redact: Vec::new(),
        }
    }
}

/// Computes status, reads the event tail and pane, and builds the pack.
/// Event tail read failures degrade to an empty history.
pub fn build_pack_snapshot(engine: &Engine, target: &Target, opts: &PackOptions) -> Result<PackSnapshot> {
    let (root, status) = resolve_and_compute(engine, target, "auto", "auto", false)?;
    let session = if status.session.trim().is_empty() {
        target.session.clone()
    } else {
        status.session.clone()
    };
    let (recent, dropped) = match read_session_event_tail(engine, &root, &session, opts.limits.events) {
        Ok(tail) => (event_lines(&tail.events), tail.dropped_lines),
        Err(err) => {
            warn!(session = %session, error = %err, "pack event tail unavailable");
            (Vec::new(), 0)
        }
    };

    let (capture_tail, next_offset) = {
        let _scope = engine.runtime_scope(&root);
        let tail = live_capture_tail(engine, &session, opts.limits.lines);
        (tail.unwrap_or_else(|| NO_LIVE_CAPTURE.to_string()), capture_next_offset(engine, &session))
    };

    let raw = build_context_pack_raw(opts.strategy, &session, &status, &recent, &capture_tail);
    let (pack, truncated) = truncate_to_token_budget(&raw, opts.limits.token_budget);
    let pack = apply_redaction_rules(&pack, &opts.redact);
    Ok(PackSnapshot {
        next_action: next_action_for_state(&status.session_state),
        session,
        project_root: root,
        status: status.status,
        session_state: status.session_state,
        reason: status.classification_reason,
        next_offset,
        pack,
        truncated,
        events: recent.len(),
        dropped,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Line Dedupe
// ═══════════════════════════════════════════════════════════════════════════════

/// Drops repeated lines case-insensitively. Blank lines, `---` separators and
/// `session=` headers always survive. Returns the text and how many lines went.
pub fn dedupe_semantic_pack_lines(raw: &str) -> (String, usize) {
    let mut seen = std::collections::HashSet::new();
    let mut removed = 0;
    let mut out = Vec::new();
    for line in raw.split('\n') {
        let trimmed = line.trim();
        let key = trimmed.to_lowercase();
        if trimmed.is_empty() || trimmed == "---" || key.starts_with("session=") {
            out.push(line);
            continue;
        }
        if !seen.insert(key) {
            removed += 1;
            continue;
        }
        out.push(line);
    }
    (out.join("\n"), removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn status(state: &str) -> SessionStatus {
        SessionStatus {
            session: "s1".into(),
            status: "active".into(),
            session_state: state.into(),
            classification_reason: "output_advancing".into(),
            todos_done: 1,
            todos_total: 3,
            active_task: "Write tests".into(),
            ..SessionStatus::default()
        }
    }

    #[test]
    fn test_strategy_parse_and_defaults() {
        assert_eq!(PackStrategy::parse("").unwrap(), PackStrategy::Balanced);
        assert_eq!(PackStrategy::parse("TERSE").unwrap().defaults().token_budget, 400);
        assert_eq!(PackStrategy::parse("full").unwrap().defaults().events, 20);
        assert_eq!(PackStrategy::parse("wide").unwrap_err().code(), "invalid_strategy");
    }

    #[test]
    fn test_limits_override_defaults() {
        let limits = PackLimits {
            token_budget: Some(90),
            ..PackLimits::default()
        };
        let out = limits.resolve(PackStrategy::Terse).unwrap();
        assert_eq!((out.events, out.lines, out.token_budget), (4, 60, 90));
        let bad = PackLimits {
            events: Some(0),
            ..PackLimits::default()
        };
        assert_eq!(bad.resolve(PackStrategy::Full).unwrap_err().code(), "invalid_events");
    }

    #[test]
    fn test_balanced_pack_layout() {
        let recent = vec!["t1 in_progress/active a".to_string(), "t2 in_progress/active b".to_string()];
        let raw = build_context_pack_raw(PackStrategy::Balanced, "s1", &status("in_progress"), &recent, "tail");
        assert_eq!(
            raw,
            "session=s1\nstate=in_progress\nstatus=active\nreason=output_advancing\nnext_action=session monitor\nrecent_events:\nt1 in_progress/active a\nt2 in_progress/active b\ncapture_tail:\ntail"
        );
    }

    #[test]
    fn test_terse_pack_lists_recent_newest_first() {
        let recent = vec!["first".to_string(), "second".to_string()];
        let raw = build_context_pack_raw(PackStrategy::Terse, "s1", &status("in_progress"), &recent, NO_LIVE_CAPTURE);
        let lines: Vec<&str> = raw.lines().collect();
        let at = lines.iter().position(|l| *l == "recent_events:").unwrap();
        assert_eq!(lines[at + 1], "second");
        assert_eq!(lines[at + 2], "first");
        assert_eq!(lines.last(), Some(&NO_LIVE_CAPTURE));
    }

    #[test]
    fn test_full_pack_carries_progress_fields() {
        let raw = build_context_pack_raw(PackStrategy::Full, "s1", &status("in_progress"), &[], "x");
        assert!(raw.contains("todos=1/3"));
        assert!(raw.contains("active_task=Write tests"));
        assert!(!raw.contains("recent_events:"));
    }

    #[test]
    fn test_dedupe_keeps_session_headers_and_separators() {
        let raw = "session=a\nBuild ok\n---\nsession=a\nbuild OK\n\nnew line";
        let (out, removed) = dedupe_semantic_pack_lines(raw);
        assert_eq!(removed, 1);
        assert_eq!(out, "session=a\nBuild ok\n---\nsession=a\n\nnew line");
    }

    #[test]
    fn test_snapshot_for_live_session() {
        let tmp = TempDir::new().unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        tmux.add_session("s1", "building crate\nall tests passed");
        let snap = build_pack_snapshot(&engine, &Target::new("s1", "/repo"), &PackOptions::new(PackStrategy::Balanced))
            .unwrap();
        assert_eq!(snap.session, "s1");
        assert!(snap.pack.starts_with("session=s1\n"));
        assert!(snap.pack.contains("all tests passed"));
        assert!(snap.next_offset > 0);
        assert!(!snap.truncated);
    }

    #[test]
    fn test_snapshot_for_missing_session() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let mut opts = PackOptions::new(PackStrategy::Terse);
        opts.limits.token_budget = 10;
        let snap = build_pack_snapshot(&engine, &Target::new("gone", "/repo"), &opts).unwrap();
        assert_eq!(snap.session_state, "not_found");
        assert_eq!(snap.next_action, "session spawn");
        assert!(snap.truncated);
        assert!(snap.pack.len() <= 40);
    }
}
