//! Keyed line caches shared across sessions (`session context-cache`).
//!
//! A record accumulates semantic lines from `--from` sources (files, `-` for
//! stdin, or JSON payloads of other lisa commands) and from session memory
//! refreshes. The key defaults to `session:<name>`.

use super::memory::build_session_memory;
use super::{is_expired, read_locked, write_locked};
use crate::capture::{dedupe_non_empty, extract_semantic_lines, tail_lines};
use crate::clock::format_utc_seconds;
use crate::command::{obj, run, Target};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::payload::read_text_source;
use crate::storage::{load_json_strict, save_json_pretty};
use chrono::{DateTime, Duration, Utc};
use lisa_protocol::CommandOutput;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::info;

pub const DEFAULT_CACHE_TTL_HOURS: i64 = 48;
pub const DEFAULT_CACHE_MAX_LINES: usize = 240;
/// Upper bound on lines pulled from a memory refresh.
const REFRESH_MAX_LINES: usize = 120;
/// JSON payload fields whose text is mined for semantic lines.
const SOURCE_TEXT_FIELDS: [&str; 4] = ["pack", "combinedPack", "capture", "summary"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextCacheRecord {
    pub key: String,
    pub updated_at: String,
    pub expires_at: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<String>,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextCacheStore {
    pub items: BTreeMap<String, ContextCacheRecord>,
    pub updated_at: String,
}

impl ContextCacheStore {
    fn prune_expired(&mut self, now: DateTime<Utc>) {
        self.items.retain(|_, record| !is_expired(&record.expires_at, now));
    }
}

/// Semantic lines from a `--from` source.
///
/// JSON objects contribute their `lines` array plus the semantic lines of
/// any pack/capture/summary text; JSON string arrays are taken as-is;
/// anything else is treated as plain text.
pub fn load_lines_from_source(source: &str) -> Result<Vec<String>> {
    let raw = read_text_source("--from", "invalid_from", source)?;
    Ok(lines_from_text(&raw))
}

pub fn lines_from_text(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => {
            let mut lines = Vec::new();
            if let Some(Value::Array(values)) = map.get("lines") {
                for value in values {
                    match value {
                        Value::String(s) => lines.push(s.trim().to_string()),
                        other => lines.push(other.to_string()),
                    }
                }
            }
            for key in SOURCE_TEXT_FIELDS {
                if let Some(text) = map.get(key).and_then(Value::as_str) {
                    lines.extend(extract_semantic_lines(text));
                }
            }
            dedupe_non_empty(&lines)
        }
        Ok(Value::Array(values)) if values.iter().all(Value::is_string) => {
            let lines: Vec<&str> = values.iter().filter_map(Value::as_str).collect();
            dedupe_non_empty(&lines)
        }
        _ => extract_semantic_lines(raw),
    }
}

pub fn load_context_cache_store(engine: &Engine, project_root: &str) -> Result<ContextCacheStore> {
    let path = engine.paths.context_cache_file(project_root);
    let mut store: ContextCacheStore = read_locked(engine, &path, || load_json_strict(&path))?;
    store.prune_expired(engine.now());
    Ok(store)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ContextCacheRequest {
    pub target: Target,
    pub key: String,
    pub refresh: bool,
    pub list: bool,
    pub clear: bool,
    pub from: String,
    pub ttl_hours: i64,
    pub max_lines: usize,
}

impl Default for ContextCacheRequest {
    fn default() -> Self {
        Self {
            target: Target::default(),
            key: String::new(),
            refresh: false,
            list: false,
            clear: false,
            from: String::new(),
            ttl_hours: DEFAULT_CACHE_TTL_HOURS,
            max_lines: DEFAULT_CACHE_MAX_LINES,
        }
    }
}

struct CacheOutcome {
    action: &'static str,
    record: Option<ContextCacheRecord>,
}

fn validate(req: &ContextCacheRequest, key: &str) -> Result<()> {
    let missing = |message: &str| -> Result<()> { Err(LisaError::invalid("missing_required_flag", message)) };
    if req.list && req.clear {
        return Err(LisaError::invalid(
            "invalid_flag_combination",
            "--list cannot be combined with --clear",
        ));
    }
    if !req.list && key.is_empty() {
        return missing("--key is required (or provide --session)");
    }
    if req.refresh && req.target.session.is_empty() {
        return missing("--refresh requires --session");
    }
    Ok(())
}

fn update_record(
    engine: &Engine,
    root: &str,
    req: &ContextCacheRequest,
    key: &str,
    store: &mut ContextCacheStore,
) -> Result<CacheOutcome> {
    if req.clear {
        store.items.remove(key);
        return Ok(CacheOutcome {
            action: "cleared",
            record: None,
        });
    }
    let mut lines = Vec::new();
    if !req.from.trim().is_empty() {
        let loaded = load_lines_from_source(&req.from).map_err(|e| match e {
            LisaError::InvalidArgument { .. } => e,
            other => LisaError::invalid("invalid_from", format!("failed loading --from: {other}")),
        })?;
        lines.extend(loaded);
    }
    if req.refresh {
        let (memory, _) = build_session_memory(
            engine,
            root,
            &req.target.session,
            req.max_lines.min(REFRESH_MAX_LINES),
            24,
        )
        .map_err(|e| {
            LisaError::coded(
                "context_cache_refresh_failed",
                format!("failed refreshing session memory: {e}"),
            )
        })?;
        lines.extend(memory.lines);
    }
    if lines.is_empty() {
        return Ok(CacheOutcome {
            action: "read",
            record: store.items.get(key).cloned(),
        });
    }

    let now = engine.now();
    let record = store.items.entry(key.to_string()).or_default();
    let mut merged = record.lines.clone();
    merged.extend(lines);
    record.key = key.to_string();
    record.lines = tail_lines(&dedupe_non_empty(&merged), req.max_lines.max(1));
    record.updated_at = format_utc_seconds(now);
    record.expires_at = format_utc_seconds(now + Duration::hours(req.ttl_hours.max(1)));
    if !req.target.session.is_empty() {
        let mut sessions = record.sessions.clone();
        sessions.push(req.target.session.clone());
        record.sessions = dedupe_non_empty(&sessions);
    }
    Ok(CacheOutcome {
        action: "updated",
        record: Some(record.clone()),
    })
}

fn lock_failed(err: LisaError) -> LisaError {
    if err.is_lock_timeout() {
        LisaError::coded(
            "context_cache_lock_failed",
            format!("failed locking context cache: {err}"),
        )
    } else {
        err
    }
}

fn read_failed(err: LisaError) -> LisaError {
    LisaError::coded("context_cache_read_failed", format!("failed reading context cache: {err}"))
}

/// Lock timeouts keep their own code; anything else is a read failure.
fn load_failed(err: LisaError) -> LisaError {
    if err.is_lock_timeout() {
        lock_failed(err)
    } else {
        read_failed(err)
    }
}

pub fn context_cache_command(engine: &Engine, req: &ContextCacheRequest) -> CommandOutput {
    run(|| {
        let session = req.target.session.trim();
        let root = if session.is_empty() {
            engine.canonical_root(&req.target.project_root)
        } else {
            req.target.resolve_root(engine)?
        };
        let key = match req.key.trim() {
            "" if !session.is_empty() => format!("session:{session}"),
            other => other.to_string(),
        };
        validate(req, &key)?;

        let path = engine.paths.context_cache_file(&root);

        if req.list {
            let store = load_context_cache_store(engine, &root).map_err(load_failed)?;
            let keys: Vec<&String> = store.items.keys().collect();
            let items: Vec<&ContextCacheRecord> = store.items.values().collect();
            return Ok(CommandOutput::ok(obj(json!({
                "projectRoot": root,
                "count": keys.len(),
                "keys": keys,
                "items": items,
            }))));
        }

        let mutating = req.clear || req.refresh || !req.from.trim().is_empty();
        let outcome = if mutating {
            write_locked(engine, &path, || {
                let mut store: ContextCacheStore = load_json_strict(&path).map_err(read_failed)?;
                store.prune_expired(engine.now());
                let outcome = update_record(engine, &root, req, &key, &mut store)?;
                if outcome.action != "read" {
                    store.updated_at = format_utc_seconds(engine.now());
                    save_json_pretty(&path, &store).map_err(|e| {
                        LisaError::coded(
                            "context_cache_write_failed",
                            format!("failed writing context cache: {e}"),
                        )
                    })?;
                }
                Ok(outcome)
            })
            .map_err(lock_failed)?
        } else {
            let store = load_context_cache_store(engine, &root).map_err(load_failed)?;
            CacheOutcome {
                action: "read",
                record: store.items.get(&key).cloned(),
            }
        };
        if outcome.action != "read" {
            info!(action = outcome.action, key = %key, root = %root, "context cache updated");
        }

        let mut payload = obj(json!({
            "action": outcome.action,
            "projectRoot": root,
            "key": key,
            "exists": outcome.record.is_some(),
        }));
        if let Some(record) = &outcome.record {
            payload.insert("lineCount".into(), json!(record.lines.len()));
            payload.insert("record".into(), json!(record));
        }
        if outcome.record.is_none() && outcome.action == "read" {
            payload.insert("errorCode".into(), json!("context_cache_not_found"));
            return Ok(CommandOutput::with_exit(payload, 1));
        }
        Ok(CommandOutput::ok(payload))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lisa_protocol::str_field;
    use tempfile::TempDir;

    fn request(key: &str) -> ContextCacheRequest {
        ContextCacheRequest {
            target: Target::new("", "/repo"),
            key: key.to_string(),
            ..ContextCacheRequest::default()
        }
    }

    #[test]
    fn test_from_file_merges_and_caps_lines() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let source = tmp.path().join("pack.json");
        std::fs::write(&source, r#"{"lines":["alpha","beta"],"pack":"gamma\nalpha"}"#).unwrap();

        let out = context_cache_command(
            &engine,
            &ContextCacheRequest {
                from: source.display().to_string(),
                max_lines: 2,
                ..request("k1")
            },
        );
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        assert_eq!(str_field(&out.payload, "action"), "updated");
        assert_eq!(out.payload["record"]["lines"], json!(["beta", "gamma"]));

        let out = context_cache_command(&engine, &request("k1"));
        assert_eq!(str_field(&out.payload, "action"), "read");
        assert_eq!(out.payload["lineCount"], 2);
    }

    #[test]
    fn test_missing_key_reports_not_found() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let out = context_cache_command(&engine, &request("absent"));
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("context_cache_not_found"));
    }

    #[test]
    fn test_refresh_uses_session_key_and_expires() {
        let tmp = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let (engine, tmux, clock) = Engine::with_fakes(tmp.path(), now);
        tmux.add_session("s1", "compiled the crate\n");
        let out = context_cache_command(
            &engine,
            &ContextCacheRequest {
                target: Target::new("s1", "/repo"),
                refresh: true,
                ttl_hours: 1,
                ..ContextCacheRequest::default()
            },
        );
        assert_eq!(str_field(&out.payload, "key"), "session:s1");
        assert_eq!(out.payload["record"]["sessions"], json!(["s1"]));

        clock.advance_seconds(7200);
        let out = context_cache_command(&engine, &ContextCacheRequest { list: true, ..request("") });
        assert_eq!(out.payload["count"], 0);
    }

    #[test]
    fn test_flag_validation() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let out = context_cache_command(&engine, &ContextCacheRequest { list: true, clear: true, ..request("k") });
        assert_eq!(out.error_code(), Some("invalid_flag_combination"));
        let out = context_cache_command(&engine, &request(""));
        assert_eq!(out.error_code(), Some("missing_required_flag"));
        let out = context_cache_command(&engine, &ContextCacheRequest { refresh: true, ..request("k") });
        assert_eq!(out.error_code(), Some("missing_required_flag"));
    }

    #[test]
    fn test_lines_from_text_shapes() {
        assert_eq!(lines_from_text(r#"["a"," a ","b"]"#), vec!["a", "b"]);
        assert_eq!(lines_from_text("plain\n\nplain\nother"), vec!["plain", "other"]);
        assert!(lines_from_text("  ").is_empty());
    }
}
