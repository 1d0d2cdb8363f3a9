//! Per-session append-only event log.
//!
//! Each session owns `<...>-events.jsonl`: one [`SessionEvent`] per line,
//! LF-terminated, in append order. Appends and trims run under the exclusive
//! event lock; tail reads take the shared lock.
//!
//! ## Size caps
//!
//! The file is bounded by `events_max_lines` and `events_max_bytes`. A
//! `.lines` sidecar caches the line count so appends don't rescan the file.
//! When either cap is exceeded the file is rewritten atomically keeping the
//! newest lines (head-drop).

use crate::clock::format_utc_nanos;
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::lock::{with_exclusive_lock, with_shared_lock};
use crate::storage::{read_optional, write_file_atomic};
use crate::types::{SessionEvent, StatusSignals};
use chrono::Duration;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Trim reads at most this window from the end of the file.
const MIN_TRIM_WINDOW: u64 = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEventTail {
    pub events: Vec<SessionEvent>,
    pub dropped_lines: usize,
    /// Number of lines read; a resume offset for handoff deltas.
    #[serde(skip_serializing_if = "is_zero")]
    pub next_cursor: usize,
}

/// Compact projection of an event used by handoff and packet payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffItem {
    pub at: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub state: String,
    pub status: String,
    pub reason: String,
}

impl From<&SessionEvent> for HandoffItem {
    fn from(event: &SessionEvent) -> Self {
        Self {
            at: event.at.clone(),
            kind: event.kind.clone(),
            state: event.state.clone(),
            status: event.status.clone(),
            reason: event.reason.clone(),
        }
    }
}

/// Result of an offset-based read over the whole event file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandoffDelta {
    pub items: Vec<HandoffItem>,
    pub dropped: usize,
    pub total: usize,
}

fn is_zero(v: &usize) -> bool {
    *v == 0
}

pub fn line_count_file(events_path: &Path) -> PathBuf {
    let mut os = events_path.as_os_str().to_owned();
    os.push(".lines");
    PathBuf::from(os)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Append & Trim
// ═══════════════════════════════════════════════════════════════════════════════

/// Appends one event and trims the file when a cap is exceeded.
pub fn append_session_event(
    engine: &Engine,
    project_root: &str,
    session: &str,
    event: &SessionEvent,
) -> Result<()> {
    let path = engine.paths.events_file(project_root, session);
    let count_path = line_count_file(&path);
    let max_bytes = engine.config.events_max_bytes;
    let max_lines = engine.config.events_max_lines;

    let mut line = serde_json::to_vec(event)
        .map_err(|e| LisaError::json("serialize session event", e))?;
    line.push(b'\n');

    with_exclusive_lock(&path, engine.config.event_lock_timeout_ms, || {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LisaError::io("open events file", e.into()))?;
        file.write_all(&line)
            .map_err(|e| LisaError::io(format!("append {}", path.display()), e))?;
        drop(file);

        let size = fs::metadata(&path)
            .map_err(|e| LisaError::io("stat events file", e.into()))?
            .len();

        let line_count = match read_line_count(&count_path) {
            Some(known) => Some(known + 1),
            None => count_event_lines(&path).ok(),
        };

        let needs_trim =
            size > max_bytes || line_count.map(|n| n > max_lines).unwrap_or(false);
        if needs_trim {
            let kept = trim_event_file(&path, max_lines, max_bytes)?;
            debug!(session = %session, kept, "trimmed session events");
            return write_line_count(&count_path, kept);
        }
        match line_count {
            Some(count) => write_line_count(&count_path, count),
            None => Ok(()),
        }
    })
}

/// Rewrites the file keeping the newest lines that satisfy both caps.
///
/// Returns the number of lines kept. Caller holds the exclusive lock.
pub fn trim_event_file(path: &Path, max_lines: usize, max_bytes: u64) -> Result<usize> {
    let raw = match read_trim_window(path, max_bytes) {
        Ok(raw) => raw,
        Err(LisaError::FileNotFound(_)) => return Ok(0),
        Err(err) => return Err(err),
    };
    let text = String::from_utf8_lossy(&raw);
    let mut lines: Vec<&str> = text
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .collect();
    if lines.len() > max_lines {
        lines.drain(..lines.len() - max_lines);
    }

    let mut start = 0;
    while start < lines.len() {
        let body_len: usize = lines[start..].iter().map(|l| l.len() + 1).sum();
        if body_len as u64 <= max_bytes {
            let mut data = lines[start..].join("\n");
            data.push('\n');
            write_file_atomic(path, data.as_bytes())?;
            return Ok(lines.len() - start);
        }
        start += 1;
    }
    write_file_atomic(path, b"")?;
    Ok(0)
}

/// Tail window of the file starting at a line boundary.
fn read_trim_window(path: &Path, max_bytes: u64) -> Result<Vec<u8>> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LisaError::FileNotFound(path.to_path_buf()))
        }
        Err(e) => return Err(LisaError::io(format!("open {}", path.display()), e)),
    };
    let size = file
        .metadata()
        .map_err(|e| LisaError::io("stat events file", e))?
        .len();
    if size == 0 {
        return Ok(Vec::new());
    }
    let window = max_bytes.saturating_mul(2).max(MIN_TRIM_WINDOW).min(size);
    let start = size - window;
    file.seek(SeekFrom::Start(start))
        .map_err(|e| LisaError::io("seek events file", e))?;
    let mut raw = Vec::with_capacity(window as usize);
    file.take(window)
        .read_to_end(&mut raw)
        .map_err(|e| LisaError::io("read events file", e))?;
    if start > 0 {
        match raw.iter().position(|b| *b == b'\n') {
            Some(idx) => {
                raw.drain(..=idx);
            }
            None => raw.clear(),
        }
    }
    Ok(raw)
}

fn read_line_count(path: &Path) -> Option<usize> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
}

fn write_line_count(path: &Path, count: usize) -> Result<()> {
    write_file_atomic(path, count.to_string().as_bytes())
}

fn count_event_lines(path: &Path) -> Result<usize> {
    let content = read_optional(path)?.unwrap_or_default();
    Ok(content.lines().filter(|l| !l.trim().is_empty()).count())
}

/// Appends a lifecycle marker event (`spawn`, `send`, `cleanup`, ...).
///
/// No-op when either the project root or the session is blank.
pub fn append_lifecycle_event(
    engine: &Engine,
    project_root: &str,
    session: &str,
    kind: &str,
    state: &str,
    status: &str,
    reason: &str,
) -> Result<()> {
    if project_root.trim().is_empty() || session.trim().is_empty() {
        return Ok(());
    }
    let event = SessionEvent {
        at: format_utc_nanos(engine.now()),
        kind: kind.to_string(),
        session: session.to_string(),
        state: state.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        poll: 0,
        signals: StatusSignals::default(),
    };
    append_session_event(engine, project_root, session, &event)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reads
// ═══════════════════════════════════════════════════════════════════════════════

/// Last `max` well-formed events. Malformed lines are counted, not fatal.
pub fn read_session_event_tail(
    engine: &Engine,
    project_root: &str,
    session: &str,
    max: usize,
) -> Result<SessionEventTail> {
    let max = max.max(1);
    let path = engine.paths.events_file(project_root, session);
    with_shared_lock(&path, engine.config.event_lock_timeout_ms, || {
        let Some(content) = read_optional(&path)? else {
            return Ok(SessionEventTail::default());
        };
        let lines: Vec<&str> = split_event_lines(&content);
        let read_lines = lines.len();
        let start = read_lines.saturating_sub(max);

        let mut tail = SessionEventTail {
            next_cursor: read_lines,
            ..SessionEventTail::default()
        };
        for line in &lines[start..] {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionEvent>(line) {
                Ok(event) => tail.events.push(event),
                Err(_) => tail.dropped_lines += 1,
            }
        }
        if tail.dropped_lines > 0 {
            warn!(session = %session, dropped = tail.dropped_lines, "skipped malformed event lines");
        }
        Ok(tail)
    })
}

/// Lines as a line reader sees them: a trailing LF does not start a new line.
fn split_event_lines(content: &str) -> Vec<&str> {
    let body = content.strip_suffix('\n').unwrap_or(content);
    if body.is_empty() && content.is_empty() {
        return Vec::new();
    }
    body.split('\n').map(|l| l.trim_end_matches('\r')).collect()
}

/// Events after `offset` (clamped to `[0, total]`), keeping at most `limit`
/// of the newest when `limit > 0`.
pub fn read_session_handoff_delta(
    engine: &Engine,
    project_root: &str,
    session: &str,
    offset: usize,
    limit: usize,
) -> Result<HandoffDelta> {
    let path = engine.paths.events_file(project_root, session);
    let all = with_shared_lock(&path, engine.config.event_lock_timeout_ms, || {
        let content = read_optional(&path)?.unwrap_or_default();
        Ok(content
            .split('\n')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter_map(|l| serde_json::from_str::<SessionEvent>(l).ok())
            .map(|event| HandoffItem::from(&event))
            .collect::<Vec<_>>())
    })?;

    let total = all.len();
    let offset = offset.min(total);
    let mut items: Vec<HandoffItem> = all[offset..].to_vec();
    let mut dropped = 0;
    if limit > 0 && items.len() > limit {
        dropped = items.len() - limit;
        items.drain(..dropped);
    }
    Ok(HandoffDelta {
        items,
        dropped,
        total,
    })
}

/// Position an `explain --since` read resumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCursor {
    /// Index of the first well-formed event to return.
    Offset(usize),
    /// Events strictly after this instant (unix nanoseconds).
    After(i64),
}

impl EventCursor {
    /// Accepts an event index, `@<unix seconds>`, or RFC 3339.
    pub fn parse(raw: &str) -> Result<Self> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(LisaError::invalid(
                "invalid_since_cursor",
                "invalid --since: value cannot be empty",
            ));
        }
        if let Ok(n) = value.parse::<i64>() {
            return usize::try_from(n).map(EventCursor::Offset).map_err(|_| {
                LisaError::invalid("invalid_since_cursor", "invalid --since: offset must be non-negative")
            });
        }
        if let Some(rest) = value.strip_prefix('@') {
            let seconds: i64 = rest.parse().map_err(|_| {
                LisaError::invalid("invalid_since_cursor", format!("invalid --since unix timestamp: {raw}"))
            })?;
            return Ok(EventCursor::After(seconds.saturating_mul(1_000_000_000)));
        }
        crate::clock::parse_rfc3339(value)
            .map(|at| EventCursor::After(at.timestamp_nanos_opt().unwrap_or(i64::MAX)))
            .ok_or_else(|| {
                LisaError::invalid("invalid_since_cursor", "invalid --since: expected offset|@unix|RFC3339")
            })
    }
}

/// Events after `cursor`, keeping the newest `max`. `next_cursor` is the
/// total number of well-formed events; `dropped_lines` counts events cut by `max`.
pub fn read_session_events_since(
    engine: &Engine,
    project_root: &str,
    session: &str,
    cursor: EventCursor,
    max: usize,
) -> Result<SessionEventTail> {
    let path = engine.paths.events_file(project_root, session);
    let events = with_shared_lock(&path, engine.config.event_lock_timeout_ms, || {
        let content = read_optional(&path)?.unwrap_or_default();
        Ok(content
            .split('\n')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter_map(|l| serde_json::from_str::<SessionEvent>(l).ok())
            .collect::<Vec<_>>())
    })?;

    let total = events.len();
    let mut selected: Vec<SessionEvent> = match cursor {
        EventCursor::Offset(offset) => events.into_iter().skip(offset.min(total)).collect(),
        EventCursor::After(cutoff) => events
            .into_iter()
            .filter(|event| {
                crate::clock::parse_rfc3339(&event.at)
                    .and_then(|at| at.timestamp_nanos_opt())
                    .map_or(false, |at| at > cutoff)
            })
            .collect(),
    };
    let mut dropped = 0;
    if max > 0 && selected.len() > max {
        dropped = selected.len() - max;
        selected.drain(..dropped);
    }
    Ok(SessionEventTail {
        events: selected,
        dropped_lines: dropped,
        next_cursor: total,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retention
// ═══════════════════════════════════════════════════════════════════════════════

/// Removes event files (plus `.lines` and `.lock` siblings) untouched for
/// longer than the retention window. Returns how many event files were pruned.
pub fn prune_stale_event_artifacts(engine: &Engine) -> Result<usize> {
    let retention_days = engine.config.event_retention_days;
    if retention_days == 0 {
        return Ok(0);
    }
    let cutoff = engine.now() - Duration::days(retention_days as i64);
    let entries = match std::fs::read_dir(engine.paths.base()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(LisaError::io("list state dir", e)),
    };

    let mut pruned = 0;
    let mut errors = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !(name.starts_with(".lisa-") && name.contains("-session-") && name.ends_with("-events.jsonl"))
        {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => chrono::DateTime::<chrono::Utc>::from(modified),
            Err(_) => continue,
        };
        if modified >= cutoff {
            continue;
        }
        let path = entry.path();
        for target in [
            path.clone(),
            line_count_file(&path),
            crate::lock::lock_path_for(&path),
        ] {
            if let Err(e) = std::fs::remove_file(&target) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    errors.push(format!("{}: {e}", target.display()));
                }
            }
        }
        pruned += 1;
    }
    if !errors.is_empty() {
        return Err(LisaError::coded("event_prune_failed", errors.join("; ")));
    }
    Ok(pruned)
}
