//! Per-session semantic memory.
//!
//! A refresh extracts semantic lines from the live pane (or the saved output
//! file when the pane is gone), keeps the last `maxLines`, and records which
//! lines are new relative to the previous record.

use super::{is_expired, read_locked, write_locked};
use crate::capture::{compute_semantic_delta, dedupe_non_empty, extract_semantic_lines, tail_lines};
use crate::clock::format_utc_seconds;
use crate::command::{obj, run, Target};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::monitor::MONITOR_CAPTURE_LINES;
use crate::storage::{read_optional, save_json_pretty};
use chrono::Duration;
use lisa_protocol::{CommandOutput, Payload};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::debug;

pub const DEFAULT_MEMORY_MAX_LINES: usize = 80;
pub const DEFAULT_MEMORY_TTL_HOURS: i64 = 24;
/// Lines at or above this length are reported with `high` diff confidence.
const HIGH_CONFIDENCE_LEN: usize = 24;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryRecord {
    pub session: String,
    pub updated_at: String,
    pub expires_at: String,
    pub max_lines: usize,
    pub lines: Vec<String>,
}

/// `Ok(None)` when the record is missing or expired.
pub fn load_session_memory(engine: &Engine, project_root: &str, session: &str) -> Result<Option<MemoryRecord>> {
    let path = engine.paths.memory_file(project_root, session);
    let raw = read_locked(engine, &path, || read_optional(&path))?;
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Ok(None);
    };
    let mut record: MemoryRecord =
        serde_json::from_str(&raw).map_err(|e| LisaError::json(path.display().to_string(), e))?;
    record.lines = dedupe_non_empty(&record.lines);
    if record.max_lines == 0 {
        record.max_lines = DEFAULT_MEMORY_MAX_LINES;
    }
    if is_expired(&record.expires_at, engine.now()) {
        debug!(session = %session, "session memory expired");
        return Ok(None);
    }
    Ok(Some(record))
}

pub fn save_session_memory(engine: &Engine, project_root: &str, session: &str, record: &MemoryRecord) -> Result<()> {
    let mut record = record.clone();
    record.session = session.to_string();
    record.lines = dedupe_non_empty(&record.lines);
    if record.max_lines == 0 {
        record.max_lines = DEFAULT_MEMORY_MAX_LINES;
    }
    let path = engine.paths.memory_file(project_root, session);
    write_locked(engine, &path, || save_json_pretty(&path, &record))
}

/// Semantic lines from the live pane, falling back to the output file.
pub fn capture_semantic_lines(engine: &Engine, project_root: &str, session: &str, lines: usize) -> Vec<String> {
    let mut capture = String::new();
    {
        let _scope = engine.runtime_scope(project_root);
        if engine.tmux.has_session(session) {
            capture = engine.tmux.capture_pane(session, lines).unwrap_or_default();
        }
    }
    if capture.trim().is_empty() {
        let path = engine.paths.output_file(project_root, session);
        capture = read_optional(&path).ok().flatten().unwrap_or_default();
    }
    extract_semantic_lines(&capture)
}

/// Rebuilds and saves the memory record; returns it with the added lines.
pub fn build_session_memory(
    engine: &Engine,
    project_root: &str,
    session: &str,
    max_lines: usize,
    ttl_hours: i64,
) -> Result<(MemoryRecord, Vec<String>)> {
    let max_lines = if max_lines == 0 { DEFAULT_MEMORY_MAX_LINES } else { max_lines };
    let ttl_hours = if ttl_hours <= 0 { DEFAULT_MEMORY_TTL_HOURS } else { ttl_hours };
    let previous = load_session_memory(engine, project_root, session)?.unwrap_or_default();
    let current = tail_lines(
        &capture_semantic_lines(engine, project_root, session, MONITOR_CAPTURE_LINES),
        max_lines,
    );
    let delta = compute_semantic_delta(&current, &previous.lines);
    let now = engine.now();
    let record = MemoryRecord {
        session: session.to_string(),
        updated_at: format_utc_seconds(now),
        expires_at: format_utc_seconds(now + Duration::hours(ttl_hours)),
        max_lines,
        lines: current,
    };
    save_session_memory(engine, project_root, session, &record)?;
    Ok((record, delta))
}

/// `{updatedAt, expiresAt, lineCount, lines}` with at most `max_lines` lines.
pub fn load_session_memory_compact(
    engine: &Engine,
    project_root: &str,
    session: &str,
    max_lines: usize,
) -> Option<Payload> {
    let record = load_session_memory(engine, project_root, session).ok()??;
    let lines = if max_lines > 0 {
        tail_lines(&record.lines, max_lines)
    } else {
        record.lines.clone()
    };
    Some(obj(json!({
        "updatedAt": record.updated_at,
        "expiresAt": record.expires_at,
        "lineCount": record.lines.len(),
        "lines": lines,
    })))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Semantic Diff
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredLine {
    pub line: String,
    pub confidence: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SemanticDiff {
    pub added: Vec<ScoredLine>,
    pub removed: Vec<ScoredLine>,
    pub unchanged: usize,
}

fn scored(lines: impl Iterator<Item = String>) -> Vec<ScoredLine> {
    lines
        .map(|line| ScoredLine {
            confidence: if line.len() >= HIGH_CONFIDENCE_LEN { "high" } else { "medium" },
            line,
        })
        .collect()
}

/// Set difference of two line lists, each side sorted.
pub fn semantic_diff_with_confidence(current: &[String], baseline: &[String]) -> SemanticDiff {
    let current: BTreeSet<String> = dedupe_non_empty(current).into_iter().collect();
    let baseline: BTreeSet<String> = dedupe_non_empty(baseline).into_iter().collect();
    SemanticDiff {
        added: scored(current.difference(&baseline).cloned()),
        removed: scored(baseline.difference(&current).cloned()),
        unchanged: current.intersection(&baseline).count(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct MemoryRequest {
    pub target: Target,
    pub refresh: bool,
    pub semantic_diff: bool,
    pub ttl_hours: i64,
    pub max_lines: usize,
}

impl Default for MemoryRequest {
    fn default() -> Self {
        Self {
            target: Target::default(),
            refresh: false,
            semantic_diff: false,
            ttl_hours: DEFAULT_MEMORY_TTL_HOURS,
            max_lines: DEFAULT_MEMORY_MAX_LINES,
        }
    }
}

fn read_failed(err: LisaError) -> LisaError {
    LisaError::coded("memory_read_failed", format!("failed reading session memory: {err}"))
}

pub fn memory_command(engine: &Engine, req: &MemoryRequest) -> CommandOutput {
    run(|| {
        let session = req.target.require_session()?;
        let root = req.target.resolve_root(engine)?;
        let _scope = engine.runtime_scope(&root);

        let mut before = Vec::new();
        let mut baseline_count = 0;
        let mut delta = Vec::new();
        let record = if req.refresh {
            if let Some(previous) = load_session_memory(engine, &root, session).map_err(read_failed)? {
                baseline_count = previous.lines.len();
                before = previous.lines;
            }
            let (record, added) = build_session_memory(engine, &root, session, req.max_lines, req.ttl_hours)
                .map_err(|e| {
                    LisaError::coded("memory_refresh_failed", format!("failed refreshing session memory: {e}"))
                })?;
            delta = added;
            record
        } else {
            let record = load_session_memory(engine, &root, session)
                .map_err(read_failed)?
                .ok_or_else(|| {
                    LisaError::coded("memory_not_found", "no session memory found (run --refresh first)")
                })?;
            before = record.lines.clone();
            record
        };

        let mut payload = obj(json!({
            "session": session,
            "projectRoot": root,
            "updatedAt": record.updated_at,
            "expiresAt": record.expires_at,
            "maxLines": record.max_lines,
            "lineCount": record.lines.len(),
            "lines": record.lines,
            "refresh": req.refresh,
            "path": engine.paths.memory_file(&root, session).display().to_string(),
        }));
        if req.refresh {
            payload.insert("deltaCount".into(), json!(delta.len()));
            payload.insert(
                "deltaPath".into(),
                json!(engine.paths.output_file(&root, session).display().to_string()),
            );
            payload.insert(
                "deltaMetadata".into(),
                json!({
                    "baselineLineCount": baseline_count,
                    "currentLineCount": record.lines.len(),
                    "deltaCount": delta.len(),
                    "maxLines": record.max_lines,
                }),
            );
            payload.insert("deltaLines".into(), json!(delta));
        }
        if req.semantic_diff {
            let (current, source) = if req.refresh {
                (record.lines.clone(), "refresh_vs_previous")
            } else {
                (
                    capture_semantic_lines(engine, &root, session, MONITOR_CAPTURE_LINES),
                    "live_vs_cached",
                )
            };
            let diff = semantic_diff_with_confidence(&current, &before);
            payload.insert("semanticDiff".into(), json!(diff));
            payload.insert("semanticDiffSource".into(), Value::String(source.to_string()));
        }
        Ok(CommandOutput::ok(payload))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use lisa_protocol::str_field;
    use tempfile::TempDir;

    fn request(session: &str) -> MemoryRequest {
        MemoryRequest {
            target: Target::new(session, "/repo"),
            ..MemoryRequest::default()
        }
    }

    #[test]
    fn test_refresh_records_delta_and_reads_back() {
        let tmp = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), now);
        tmux.add_session("s1", "Implemented parser module\nAdded tests for lexer\n");

        let out = memory_command(&engine, &MemoryRequest { refresh: true, ..request("s1") });
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        assert_eq!(out.payload["lineCount"], 2);
        assert_eq!(out.payload["deltaCount"], 2);
        assert_eq!(out.payload["deltaMetadata"]["baselineLineCount"], 0);

        tmux.set_capture("s1", "Implemented parser module\nAdded tests for lexer\nFixed flaky test\n");
        let out = memory_command(&engine, &MemoryRequest { refresh: true, ..request("s1") });
        assert_eq!(out.payload["deltaLines"], json!(["Fixed flaky test"]));

        let out = memory_command(&engine, &request("s1"));
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.payload["lineCount"], 3);
        assert_eq!(out.payload["refresh"], false);
    }

    #[test]
    fn test_missing_and_expired_memory() {
        let tmp = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let (engine, tmux, clock) = Engine::with_fakes(tmp.path(), now);
        let out = memory_command(&engine, &request("s1"));
        assert_eq!(out.error_code(), Some("memory_not_found"));

        tmux.add_session("s1", "some useful line\n");
        build_session_memory(&engine, "/repo", "s1", 10, 1).unwrap();
        assert!(load_session_memory(&engine, "/repo", "s1").unwrap().is_some());
        clock.advance_seconds(3601);
        assert!(load_session_memory(&engine, "/repo", "s1").unwrap().is_none());
    }

    #[test]
    fn test_output_file_fallback_when_pane_gone() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let out_path = engine.paths.output_file("/repo", "gone");
        std::fs::create_dir_all(out_path.parent().unwrap()).unwrap();
        std::fs::write(&out_path, "final summary written\n").unwrap();
        let lines = capture_semantic_lines(&engine, "/repo", "gone", 100);
        assert_eq!(lines, vec!["final summary written".to_string()]);
    }

    #[test]
    fn test_semantic_diff_confidence_and_order() {
        let diff = semantic_diff_with_confidence(
            &["b short".into(), "a line that is definitely long".into(), "same".into()],
            &["same".into(), "old".into()],
        );
        assert_eq!(diff.added[0].line, "a line that is definitely long");
        assert_eq!(diff.added[0].confidence, "high");
        assert_eq!(diff.added[1].confidence, "medium");
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.unchanged, 1);
    }

    #[test]
    fn test_compact_view_tails_lines() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let record = MemoryRecord {
            lines: vec!["one".into(), "two".into(), "three".into()],
            expires_at: "2999-01-01T00:00:00Z".into(),
            ..MemoryRecord::default()
        };
        save_session_memory(&engine, "/repo", "s1", &record).unwrap();
        let compact = load_session_memory_compact(&engine, "/repo", "s1", 2).unwrap();
        assert_eq!(compact["lineCount"], 3);
        assert_eq!(compact["lines"], json!(["two", "three"]));
        assert_eq!(str_field(&compact, "expiresAt"), "2999-01-01T00:00:00Z");
    }
}
