//! Pane capture pipeline: noise filters, completion markers, progress hints,
//! semantic line extraction, and offset deltas.
//!
//! Everything here is a pure function over captured text so it can be
//! exercised without tmux.

use crate::error::{LisaError, Result};
use crate::types::{EXEC_DONE_PREFIX, SESSION_DONE_PREFIX};
use chrono::DateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

static ANSI_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid regex"));
static TODO_CHECKBOX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[( |x)\]").expect("valid regex"));
static ACTIVE_TASK_KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(working|running|checking|planning|writing|editing|creating|fixing|executing|reviewing)\b")
        .expect("valid regex")
});
static ACTIVE_TASK_CURRENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^current task[:\s]+(.+)$").expect("valid regex"));
static ACTIVE_TASK_ACTIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^active task[:\s]+(.+)$").expect("valid regex"));
static PROMPT_BUSY_KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(working|running|checking|planning|writing|editing|creating|fixing|executing|reviewing|loading|reading|searching|parsing|building|compiling|installing)\b")
        .expect("valid regex")
});
static CODEX_PROMPT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"❯\s*([0-9]+[smh]\s*)?[0-9]{1,2}:[0-9]{2}:[0-9]{2}\s*$").expect("valid regex")
});
static SHELL_PROMPT_TRAILER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[❯›]\s*(?:[0-9]+[smh]\s*)?[0-9]{1,2}:[0-9]{2}:[0-9]{2}\s*$").expect("valid regex")
});
static WAIT_READ_LIKE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"loading|reading|searching|parsing").expect("valid regex"));
static WAIT_BUILD_LIKE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"running tests|testing|building|compiling|installing").expect("valid regex")
});
static WAIT_WRITE_LIKE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"writing|editing|updating|creating|fixing").expect("valid regex"));
static SESSION_COMPLETION_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^{}(?:([A-Za-z0-9._-]+):)?(-?\d+)\s*$",
        regex::escape(SESSION_DONE_PREFIX)
    ))
    .expect("valid regex")
});
static EXEC_COMPLETION_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^{}(-?\d+)\s*$", regex::escape(EXEC_DONE_PREFIX))).expect("valid regex")
});
static DONE_FILE_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9._-]+):(-?\d+)\s*$").expect("valid regex"));

static BOX_START_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[╭┌]").expect("valid regex"));
static BOX_END_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[╰└]").expect("valid regex"));
static BOX_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[│|]").expect("valid regex"));
static SEPARATOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*─+\s*$").expect("valid regex"));
static MODE_INDICATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*--\s*(INSERT|NORMAL)\s*--").expect("valid regex"));
static STATUS_BAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\|\s*ctx\(\d+%\)\s*\|").expect("valid regex"));

static SEMANTIC_NOISE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(tokens used|provider:|approval:|sandbox:|reasoning effort:|reasoning summaries:|session id:|workdir:|model:|--------)$")
        .expect("valid regex")
});

const MARKER_TAIL_LINES: usize = 24;
const ACTIVE_TASK_IGNORE_PREFIXES: [&str; 7] =
    ["$", ">", "To get started", "Usage:", "Error:", "warning:", "note:"];

// ═══════════════════════════════════════════════════════════════════════════════
// Line Utilities
// ═══════════════════════════════════════════════════════════════════════════════

/// Splits on LF and strips a trailing CR from every line.
pub fn trim_lines(input: &str) -> Vec<&str> {
    input.split('\n').map(|l| l.trim_end_matches('\r')).collect()
}

pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE_RE.replace_all(line, "").into_owned()
}

pub fn tail_lines<T: Clone>(lines: &[T], max: usize) -> Vec<T> {
    if max == 0 {
        return Vec::new();
    }
    lines[lines.len().saturating_sub(max)..].to_vec()
}

/// Last `max` non-empty lines, ANSI-stripped and trimmed, oldest first.
pub fn non_empty_tail_lines(capture: &str, max: usize) -> Vec<String> {
    let mut tail: Vec<String> = trim_lines(capture)
        .into_iter()
        .rev()
        .map(|line| strip_ansi(line).trim().to_string())
        .filter(|line| !line.is_empty())
        .take(max)
        .collect();
    tail.reverse();
    tail
}

/// POSIX single-quote escaping.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

/// Trimmed, non-empty, first occurrence wins.
pub fn dedupe_non_empty<S: AsRef<str>>(values: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .iter()
        .map(|v| v.as_ref().trim())
        .filter(|v| !v.is_empty())
        .filter(|v| seen.insert(v.to_string()))
        .map(str::to_string)
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Noise Filters
// ═══════════════════════════════════════════════════════════════════════════════

/// Drops TUI input boxes, separators, vim mode indicators, and status bars.
pub fn filter_input_box(input: &str) -> String {
    let mut out = Vec::new();
    let mut in_box = false;
    for line in input.split('\n') {
        if BOX_START_RE.is_match(line) {
            in_box = true;
            continue;
        }
        if BOX_END_RE.is_match(line) {
            in_box = false;
            continue;
        }
        if in_box && BOX_LINE_RE.is_match(line) {
            continue;
        }
        if SEPARATOR_RE.is_match(line)
            || MODE_INDICATOR_RE.is_match(line)
            || STATUS_BAR_RE.is_match(line)
        {
            continue;
        }
        out.push(line);
    }
    out.join("\n")
}

fn is_capture_noise_line(trimmed: &str) -> bool {
    trimmed.starts_with("mcp: ")
        || trimmed.starts_with("mcp startup: ")
        || trimmed.starts_with("⚠ MCP client for ")
        || trimmed.starts_with("⚠ MCP startup incomplete")
        || trimmed.starts_with("⚠ Under-development features enabled:")
        || trimmed.contains("codex_state::runtime: failed to open state db")
        || trimmed.contains("codex_core::rollout::list: state db missing rollout path")
        || trimmed.contains("codex_core::state_db: state db record_discrepancy")
}

/// Strips agent startup chatter (MCP banners, state-db warnings).
///
/// Indented continuation lines of an MCP client warning are dropped with it;
/// blank lines are kept.
pub fn filter_capture_noise(input: &str) -> String {
    let mut out = Vec::new();
    let mut skip_continuation = false;
    for line in trim_lines(input) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            skip_continuation = false;
            out.push(line);
            continue;
        }
        if skip_continuation {
            if line.starts_with(' ') || line.starts_with('\t') {
                continue;
            }
            skip_continuation = false;
        }
        if is_capture_noise_line(trimmed) {
            if trimmed.starts_with("⚠ MCP client for ") {
                skip_continuation = true;
            }
            continue;
        }
        out.push(line);
    }
    out.join("\n")
}

/// Capture as the classifier sees it: input box removed, CRs stripped.
pub fn normalize_capture(raw: &str) -> String {
    trim_lines(&filter_input_box(raw)).join("\n")
}

// ═══════════════════════════════════════════════════════════════════════════════
// Completion Markers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionMarker {
    pub seen: bool,
    pub run_id: String,
    pub exit_code: i32,
}

pub fn is_shell_prompt_line(line: &str) -> bool {
    let line = strip_ansi(line);
    let line = line.trim();
    if line.is_empty() || SHELL_PROMPT_TRAILER_RE.is_match(line) {
        return true;
    }
    if line.ends_with('$') || line.ends_with('#') || line.ends_with('%') || line.ends_with('❯') {
        return true;
    }
    if line.ends_with('>') {
        if line.contains('<') {
            return false;
        }
        return line.contains('/') || line.contains('~') || line.contains('\\');
    }
    false
}

/// Finds the newest line matching `re` in the marker window; only shell
/// prompt lines may follow it.
fn find_marker_line(capture: &str, re: &Regex) -> Option<(Vec<String>, usize)> {
    let tail = non_empty_tail_lines(capture, MARKER_TAIL_LINES);
    let idx = tail.iter().rposition(|line| re.is_match(line))?;
    if tail[idx + 1..].iter().all(|line| is_shell_prompt_line(line)) {
        Some((tail, idx))
    } else {
        None
    }
}

/// `__LISA_EXEC_DONE__:<code>` → `(seen, code)`.
pub fn parse_exec_completion(capture: &str) -> (bool, i32) {
    let Some((tail, idx)) = find_marker_line(capture, &EXEC_COMPLETION_LINE_RE) else {
        return (false, 0);
    };
    let code = EXEC_COMPLETION_LINE_RE
        .captures(&tail[idx])
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<i32>().ok())
        .unwrap_or(1);
    (true, code)
}

/// `__LISA_SESSION_DONE__:[<runId>:]<code>`.
pub fn parse_session_completion_marker(capture: &str) -> CompletionMarker {
    let Some((tail, idx)) = find_marker_line(capture, &SESSION_COMPLETION_LINE_RE) else {
        return CompletionMarker::default();
    };
    let Some(caps) = SESSION_COMPLETION_LINE_RE.captures(&tail[idx]) else {
        return CompletionMarker::default();
    };
    CompletionMarker {
        seen: true,
        run_id: caps
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default(),
        exit_code: caps
            .get(2)
            .and_then(|m| m.as_str().parse::<i32>().ok())
            .unwrap_or(1),
    }
}

/// Session marker checked against the expected run id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCompletion {
    pub done: bool,
    pub exit_code: i32,
    pub run_id: String,
    pub run_mismatch: bool,
}

pub fn parse_session_completion_for_run(capture: &str, run_id: &str) -> RunCompletion {
    let marker = parse_session_completion_marker(capture);
    if !marker.seen {
        return RunCompletion::default();
    }
    let mismatch = !run_id.is_empty() && !marker.run_id.is_empty() && marker.run_id != run_id;
    RunCompletion {
        done: !mismatch,
        exit_code: marker.exit_code,
        run_id: marker.run_id,
        run_mismatch: mismatch,
    }
}

/// Parses a done file body (`<runId>:<code>`). Empty content is "not done".
pub fn parse_done_file(content: &str, run_id: &str) -> std::result::Result<RunCompletion, String> {
    let line = content.trim();
    if line.is_empty() {
        return Ok(RunCompletion::default());
    }
    let caps = DONE_FILE_LINE_RE
        .captures(line)
        .ok_or_else(|| "invalid done file marker".to_string())?;
    let file_run_id = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
    let exit_code = caps
        .get(2)
        .and_then(|m| m.as_str().parse::<i32>().ok())
        .unwrap_or(1);
    let mismatch = !run_id.is_empty() && !file_run_id.is_empty() && file_run_id != run_id;
    Ok(RunCompletion {
        done: !mismatch,
        exit_code,
        run_id: file_run_id.to_string(),
        run_mismatch: mismatch,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Progress Hints
// ═══════════════════════════════════════════════════════════════════════════════

pub fn is_shell_command(command: &str) -> bool {
    let command = command.trim().to_ascii_lowercase();
    if command.is_empty() {
        return false;
    }
    let base = command.rsplit('/').next().unwrap_or(&command);
    matches!(
        base,
        "zsh" | "bash" | "sh" | "dash" | "ash" | "ksh" | "mksh" | "pdksh" | "yash" | "fish"
            | "tcsh" | "csh" | "nu" | "pwsh" | "powershell" | "xonsh" | "elvish" | "ion"
            | "tmux"
    ) || base.ends_with("sh")
}

/// `(done, total)` across checkbox (`[ ]`/`[x]`) and ballot-box todo lines.
pub fn parse_todos(capture: &str) -> (u32, u32) {
    let mut done = 0;
    let mut total = 0;
    for line in capture.lines() {
        let trimmed = line.trim_start();
        if let Some(caps) = TODO_CHECKBOX_RE.captures(trimmed) {
            let starts_item = trimmed.starts_with('[')
                || trimmed.starts_with("- [")
                || trimmed.starts_with("* [")
                || trimmed.starts_with("⎿");
            if !starts_item {
                continue;
            }
            total += 1;
            if caps.get(1).map(|m| m.as_str().eq_ignore_ascii_case("x")) == Some(true) {
                done += 1;
            }
            continue;
        }
        let body = trimmed.trim_start_matches('⎿').trim_start();
        if body.starts_with('☒') || body.starts_with('✔') {
            total += 1;
            done += 1;
        } else if body.starts_with('☐') {
            total += 1;
        }
    }
    (done, total)
}

/// The newest line that names what the agent is doing.
pub fn extract_active_task(capture: &str) -> String {
    for raw in capture.lines().rev().take(80) {
        let line = strip_ansi(raw);
        let line = line.trim();
        if line.is_empty()
            || ACTIVE_TASK_IGNORE_PREFIXES
                .iter()
                .any(|prefix| line.starts_with(prefix))
        {
            continue;
        }
        for re in [&*ACTIVE_TASK_CURRENT_RE, &*ACTIVE_TASK_ACTIVE_RE] {
            if let Some(task) = re.captures(line).and_then(|c| c.get(1)) {
                return clip(task.as_str().trim(), 120);
            }
        }
        if ACTIVE_TASK_KEYWORD_RE.is_match(line) {
            return clip(line, 120);
        }
    }
    String::new()
}

fn clip(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Seconds until the agent is likely to need attention.
pub fn estimate_wait(active_task: &str, todos_done: u32, todos_total: u32) -> u64 {
    let task = active_task.to_ascii_lowercase();
    if WAIT_READ_LIKE_RE.is_match(&task) {
        return 30;
    }
    if WAIT_BUILD_LIKE_RE.is_match(&task) {
        return 120;
    }
    if WAIT_WRITE_LIKE_RE.is_match(&task) {
        return 60;
    }
    if todos_total > 0 {
        let progress = f64::from(todos_done) / f64::from(todos_total);
        return if progress < 0.34 {
            90
        } else if progress < 0.67 {
            60
        } else {
            30
        };
    }
    30
}

/// Whether the pane tail shows the agent's idle input prompt.
pub fn looks_like_prompt_waiting(agent: &str, capture: &str) -> bool {
    let tail = non_empty_tail_lines(capture, 6);
    let Some(last) = tail.last() else {
        return false;
    };
    let joined = tail.join("\n").to_ascii_lowercase();
    if joined.contains("esc to interrupt") || joined.contains("ctrl+c to interrupt") {
        return false;
    }
    if agent.eq_ignore_ascii_case("codex") {
        if CODEX_PROMPT_RE.is_match(last) {
            return true;
        }
        return last.starts_with('›') || last.starts_with('▌') || last.contains("send a message");
    }
    let busy_line = tail
        .iter()
        .rev()
        .skip(1)
        .take(2)
        .any(|line| line.starts_with('✻') && PROMPT_BUSY_KEYWORD_RE.is_match(line));
    if busy_line {
        return false;
    }
    last == "❯" || last.starts_with("❯ ") || last == ">" || last.starts_with("> ")
}

// ═══════════════════════════════════════════════════════════════════════════════
// Deltas
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaFrom {
    /// Byte offset into the capture.
    Offset(usize),
    /// Unix nanoseconds; compared against the last output time.
    Timestamp(i64),
}

/// Parses `--delta-from`: a byte offset, `@<unix>` (s/ms/ns), or RFC 3339.
pub fn parse_delta_from(raw: &str) -> Result<Option<DeltaFrom>> {
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }
    if let Some(rest) = value.strip_prefix('@') {
        let n: i64 = rest.trim().parse().map_err(|_| {
            LisaError::invalid("invalid_delta_from", format!("invalid --delta-from timestamp: {raw}"))
        })?;
        let nanos = if n > 1_000_000_000_000_000_000 {
            n
        } else if n > 1_000_000_000_000 {
            n.saturating_mul(1_000_000)
        } else {
            n.saturating_mul(1_000_000_000)
        };
        return Ok(Some(DeltaFrom::Timestamp(nanos)));
    }
    if !value.contains(['T', '-', ':']) {
        if let Ok(n) = value.parse::<usize>() {
            return Ok(Some(DeltaFrom::Offset(n)));
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(Some(DeltaFrom::Timestamp(
            ts.timestamp_nanos_opt().unwrap_or(i64::MAX),
        )));
    }
    Err(LisaError::invalid(
        "invalid_delta_from",
        "invalid --delta-from: expected offset integer, @unix timestamp, or RFC3339 timestamp",
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDelta {
    pub text: String,
    /// `""`, `offset`, `reset`, or `timestamp`.
    pub mode: &'static str,
    pub next_offset: usize,
}

/// Suffix of `capture` after `from`.
///
/// An offset past the end means the pane was cleared or scrolled: the whole
/// capture is returned with mode `reset`.
pub fn apply_capture_delta(
    capture: &str,
    from: Option<DeltaFrom>,
    last_output_at_nanos: i64,
) -> CaptureDelta {
    let full_len = capture.len();
    match from {
        None => CaptureDelta {
            text: capture.to_string(),
            mode: "",
            next_offset: full_len,
        },
        Some(DeltaFrom::Offset(offset)) if offset > full_len => CaptureDelta {
            text: capture.to_string(),
            mode: "reset",
            next_offset: full_len,
        },
        Some(DeltaFrom::Offset(offset)) => {
            let mut start = offset;
            while !capture.is_char_boundary(start) {
                start += 1;
            }
            CaptureDelta {
                text: capture[start..].to_string(),
                mode: "offset",
                next_offset: full_len,
            }
        }
        Some(DeltaFrom::Timestamp(cutoff)) => {
            let changed = last_output_at_nanos <= 0 || last_output_at_nanos > cutoff;
            CaptureDelta {
                text: if changed {
                    capture.to_string()
                } else {
                    String::new()
                },
                mode: "timestamp",
                next_offset: full_len,
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Markers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptureMarkerSummary {
    pub markers: Vec<String>,
    pub matches: BTreeMap<String, bool>,
    pub counts: BTreeMap<String, usize>,
    pub found: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureMarkerHit {
    pub marker: String,
    pub start: usize,
    pub end: usize,
    pub line: usize,
}

/// Comma-separated, trimmed, order-preserving dedupe; blanks are invalid.
pub fn parse_capture_markers(raw: &str) -> Result<Vec<String>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut seen = HashSet::new();
    let mut markers = Vec::new();
    for part in raw.split(',') {
        let marker = part.trim();
        if marker.is_empty() {
            return Err(LisaError::invalid(
                "invalid_markers",
                "invalid --markers: markers must be non-empty comma-separated values",
            ));
        }
        if seen.insert(marker.to_string()) {
            markers.push(marker.to_string());
        }
    }
    Ok(markers)
}

pub fn build_capture_marker_summary(capture: &str, markers: &[String]) -> CaptureMarkerSummary {
    let mut summary = CaptureMarkerSummary {
        markers: markers.to_vec(),
        ..CaptureMarkerSummary::default()
    };
    for marker in markers {
        let count = capture.matches(marker.as_str()).count();
        summary.counts.insert(marker.clone(), count);
        summary.matches.insert(marker.clone(), count > 0);
        if count > 0 {
            summary.found.push(marker.clone());
        } else {
            summary.missing.push(marker.clone());
        }
    }
    summary.found.sort();
    summary.missing.sort();
    summary
}

/// Every occurrence of every marker, ordered by position then marker.
pub fn build_capture_marker_hits(capture: &str, markers: &[String]) -> Vec<CaptureMarkerHit> {
    let mut hits: Vec<CaptureMarkerHit> = markers
        .iter()
        .filter(|m| !m.is_empty())
        .flat_map(|marker| {
            capture.match_indices(marker.as_str()).map(move |(start, _)| CaptureMarkerHit {
                marker: marker.clone(),
                start,
                end: start + marker.len(),
                line: 1 + capture[..start].matches('\n').count(),
            })
        })
        .collect();
    hits.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.marker.cmp(&b.marker)));
    hits
}

// ═══════════════════════════════════════════════════════════════════════════════
// Semantic Lines
// ═══════════════════════════════════════════════════════════════════════════════

/// Meaningful lines only: no lisa sentinels, agent banners, or prompt echoes.
pub fn extract_semantic_lines(text: &str) -> Vec<String> {
    let lines: Vec<&str> = trim_lines(text)
        .into_iter()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| {
            !(line.starts_with("__LISA_SESSION_START__")
                || line.starts_with("__LISA_EXEC_DONE__")
                || line.starts_with("__LISA_SESSION_DONE__"))
        })
        .filter(|line| !SEMANTIC_NOISE_RE.is_match(line))
        .filter(|line| {
            let lower = line.to_lowercase();
            !(lower.starts_with("codex>") || lower.starts_with("lisa "))
        })
        .collect();
    dedupe_non_empty(&lines)
}

/// Lines of `current` absent from `baseline`, in `current` order.
pub fn compute_semantic_delta(current: &[String], baseline: &[String]) -> Vec<String> {
    let baseline: HashSet<&str> = baseline.iter().map(String::as_str).collect();
    current
        .iter()
        .filter(|line| !baseline.contains(line.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_input_box_drops_frame_and_status_lines() {
        let raw = "result line\n╭────╮\n│ > typing │\n╰────╯\n────\n-- INSERT --\n| ctx(42%) |\nafter";
        assert_eq!(filter_input_box(raw), "result line\nafter");
    }

    #[test]
    fn test_filter_capture_noise_drops_mcp_block() {
        let raw = "mcp: starting\n⚠ MCP client for x failed\n  detail one\n  detail two\nreal output\n\nmore";
        assert_eq!(filter_capture_noise(raw), "real output\n\nmore");
    }

    #[test]
    fn test_exec_marker_followed_only_by_prompt() {
        let capture = "work\n__LISA_EXEC_DONE__:0\nuser@host:~/repo$ \n";
        assert_eq!(parse_exec_completion(capture), (true, 0));
        let failed = "__LISA_EXEC_DONE__:3\n";
        assert_eq!(parse_exec_completion(failed), (true, 3));
        let more_output = "__LISA_EXEC_DONE__:0\nstill printing\n";
        assert_eq!(parse_exec_completion(more_output), (false, 0));
    }

    #[test]
    fn test_session_marker_run_mismatch() {
        let capture = "__LISA_SESSION_DONE__:run-a:0\n";
        let ok = parse_session_completion_for_run(capture, "run-a");
        assert!(ok.done && !ok.run_mismatch);
        let mismatch = parse_session_completion_for_run(capture, "run-b");
        assert!(!mismatch.done && mismatch.run_mismatch);
        assert_eq!(mismatch.run_id, "run-a");
        let no_run = parse_session_completion_marker("__LISA_SESSION_DONE__:7");
        assert_eq!(no_run.exit_code, 7);
        assert!(no_run.run_id.is_empty());
    }

    #[test]
    fn test_done_file_parsing() {
        assert_eq!(parse_done_file("", "r1").unwrap(), RunCompletion::default());
        let done = parse_done_file("r1:0\n", "r1").unwrap();
        assert!(done.done);
        let mismatch = parse_done_file("r2:1", "r1").unwrap();
        assert!(mismatch.run_mismatch && !mismatch.done);
        assert!(parse_done_file("garbage", "").is_err());
    }

    #[test]
    fn test_shell_prompt_lines() {
        assert!(is_shell_prompt_line("user@host:~$"));
        assert!(is_shell_prompt_line("~/repo ❯ 12:01:02"));
        assert!(is_shell_prompt_line("C:\\\\repo>"));
        assert!(!is_shell_prompt_line("<div>"));
        assert!(!is_shell_prompt_line("building crate"));
    }

    #[test]
    fn test_shell_command_detection() {
        assert!(is_shell_command("/bin/zsh"));
        assert!(is_shell_command("fish"));
        assert!(!is_shell_command("node"));
        assert!(!is_shell_command(""));
    }

    #[test]
    fn test_todos_and_active_task() {
        let capture = "- [x] read files\n- [ ] write patch\n  ⎿ ☒ plan\n  ☐ verify\nCurrent task: wiring status";
        assert_eq!(parse_todos(capture), (2, 4));
        assert_eq!(extract_active_task(capture), "wiring status");
        assert_eq!(extract_active_task("$ running ls\nnothing here"), "");
    }

    #[test]
    fn test_estimate_wait_table() {
        assert_eq!(estimate_wait("reading docs", 0, 0), 30);
        assert_eq!(estimate_wait("running tests", 0, 0), 120);
        assert_eq!(estimate_wait("writing patch", 0, 0), 60);
        assert_eq!(estimate_wait("", 1, 10), 90);
        assert_eq!(estimate_wait("", 8, 10), 30);
    }

    #[test]
    fn test_prompt_waiting_detection() {
        assert!(looks_like_prompt_waiting("claude", "done editing\n\n❯ "));
        assert!(!looks_like_prompt_waiting("claude", "✻ Working… (esc to interrupt)\n❯"));
        assert!(looks_like_prompt_waiting("codex", "answer\n› Ask Codex to do anything"));
        assert!(!looks_like_prompt_waiting("codex", "thinking hard"));
        assert!(!looks_like_prompt_waiting("claude", ""));
    }

    #[test]
    fn test_capture_delta_modes() {
        let capture = "abcdef";
        let full = apply_capture_delta(capture, None, 0);
        assert_eq!((full.text.as_str(), full.mode, full.next_offset), ("abcdef", "", 6));
        let suffix = apply_capture_delta(capture, Some(DeltaFrom::Offset(4)), 0);
        assert_eq!((suffix.text.as_str(), suffix.mode), ("ef", "offset"));
        let reset = apply_capture_delta(capture, Some(DeltaFrom::Offset(99)), 0);
        assert_eq!((reset.text.as_str(), reset.mode, reset.next_offset), ("abcdef", "reset", 6));
        let unchanged = apply_capture_delta(capture, Some(DeltaFrom::Timestamp(100)), 50);
        assert_eq!(unchanged.text, "");
        let changed = apply_capture_delta(capture, Some(DeltaFrom::Timestamp(100)), 150);
        assert_eq!(changed.text, "abcdef");
    }

    #[test]
    fn test_parse_delta_from_forms() {
        assert_eq!(parse_delta_from("").unwrap(), None);
        assert_eq!(parse_delta_from("12").unwrap(), Some(DeltaFrom::Offset(12)));
        assert_eq!(
            parse_delta_from("@1700000000").unwrap(),
            Some(DeltaFrom::Timestamp(1_700_000_000_000_000_000))
        );
        assert!(matches!(
            parse_delta_from("2026-01-01T00:00:00Z").unwrap(),
            Some(DeltaFrom::Timestamp(_))
        ));
        assert_eq!(parse_delta_from("x").unwrap_err().code(), "invalid_delta_from");
    }

    #[test]
    fn test_marker_summary_scenario() {
        let markers = vec!["A".to_string(), "C".to_string()];
        let summary = build_capture_marker_summary("A B A", &markers);
        assert_eq!(summary.counts["A"], 2);
        assert_eq!(summary.counts["C"], 0);
        assert!(summary.matches["A"]);
        assert!(!summary.matches["C"]);
        assert_eq!(summary.found, vec!["A"]);
        assert_eq!(summary.missing, vec!["C"]);

        let hits = build_capture_marker_hits("A\nB A", &markers);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].line, 2);
    }

    #[test]
    fn test_parse_markers_rejects_blank_entries() {
        assert_eq!(parse_capture_markers("a, b,a").unwrap(), vec!["a", "b"]);
        assert_eq!(parse_capture_markers("a,,b").unwrap_err().code(), "invalid_markers");
    }

    #[test]
    fn test_semantic_extraction_is_idempotent() {
        let raw = "__LISA_SESSION_START__:x\nmodel:\n  Fixed the bug  \nFixed the bug\ncodex> hi\nlisa session status\ntokens used\nNext step";
        let once = extract_semantic_lines(raw);
        assert_eq!(once, vec!["Fixed the bug", "Next step"]);
        assert_eq!(extract_semantic_lines(&once.join("\n")), once);
    }

    #[test]
    fn test_semantic_delta_and_quote() {
        let current = vec!["a".to_string(), "b".to_string()];
        let baseline = vec!["a".to_string()];
        assert_eq!(compute_semantic_delta(&current, &baseline), vec!["b"]);
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
        assert_eq!(shell_quote(""), "''");
    }
}
