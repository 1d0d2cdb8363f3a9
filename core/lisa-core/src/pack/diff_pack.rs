//! `session diff-pack`: the current pack against the one stored in the
//! cursor file.
//!
//! Each run overwrites the cursor with the new pack. Running twice with no
//! change yields `changed=false` and empty line sets.

use super::{build_pack_snapshot, PackLimits, PackOptions, PackStrategy};
use crate::capture::{extract_semantic_lines, trim_lines};
use crate::command::{obj, run, Target};
use crate::engine::Engine;
use crate::error::LisaError;
use crate::payload::{
    load_semantic_cursor, parse_redaction_rules, resolve_file_flag, save_semantic_cursor, semantic_cursor_path,
};
use crate::storage::{read_optional, write_file_atomic};
use lisa_protocol::CommandOutput;
use serde_json::json;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Trimmed, non-empty line sets: `(added, removed)`, each sorted.
pub fn diff_pack_lines(before: &str, after: &str) -> (Vec<String>, Vec<String>) {
    let set = |text: &str| -> BTreeSet<String> {
        trim_lines(text)
            .into_iter()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    };
    let before = set(before);
    let after = set(after);
    (
        after.difference(&before).cloned().collect(),
        before.difference(&after).cloned().collect(),
    )
}

/// Result of comparing a pack with its cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackDiff {
    pub changed: bool,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl PackDiff {
    pub fn between(previous: &str, current: &str) -> Self {
        let (added, removed) = diff_pack_lines(previous, current);
        Self {
            changed: previous.trim() != current.trim(),
            added,
            removed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiffPackRequest {
    pub target: Target,
    pub strategy: String,
    pub limits: PackLimits,
    /// Defaults to the per-session diff-pack cursor.
    pub cursor_file: String,
    pub redact: String,
    /// Compare semantic lines against the sidecar instead of whole packs.
    pub semantic_only: bool,
    pub json_min: bool,
}

impl Default for DiffPackRequest {
    fn default() -> Self {
        Self {
            target: Target::default(),
            strategy: "balanced".to_string(),
            limits: PackLimits::default(),
            cursor_file: String::new(),
            redact: String::new(),
            semantic_only: false,
            json_min: false,
        }
    }
}

pub fn diff_pack_command(engine: &Engine, req: &DiffPackRequest) -> CommandOutput {
    run(|| {
        let session = req.target.require_session()?.to_string();
        let strategy = PackStrategy::parse(&req.strategy)?;
        let limits = req.limits.resolve(strategy)?;
        let redact = parse_redaction_rules(&req.redact)?;
        let root = req.target.resolve_root(engine)?;
        let cursor_path = match resolve_file_flag("--cursor-file", &req.cursor_file)
            .map_err(|e| LisaError::invalid("invalid_cursor_file", e.to_string()))?
        {
            Some(path) => path,
            None => engine.paths.diff_pack_cursor_file(&root, &session),
        };

        let target = Target {
            project_root: root.clone(),
            explicit_root: true,
            ..req.target.clone()
        };
        let opts = PackOptions {
            strategy,
            limits,
            redact,
        };
        let snapshot = build_pack_snapshot(engine, &target, &opts).map_err(|e| {
            LisaError::coded("diff_pack_build_failed", format!("failed to build context pack: {e}"))
        })?;

        let previous = match read_optional(&cursor_path) {
            Ok(text) => text.unwrap_or_default(),
            Err(err) => {
                warn!(cursor = %cursor_path.display(), error = %err, "diff-pack cursor unreadable");
                String::new()
            }
        };
        let mut diff = PackDiff::between(&previous, &snapshot.pack);

        let sidecar = semantic_cursor_path(&cursor_path);
        let mut semantic_lines = Vec::new();
        if req.semantic_only {
            let current = extract_semantic_lines(&snapshot.pack);
            let baseline = load_semantic_cursor(&sidecar).map_err(|e| {
                LisaError::coded("semantic_cursor_read_failed", format!("failed reading semantic cursor: {e}"))
            })?;
            diff = PackDiff::between(&baseline.join("\n"), &current.join("\n"));
            diff.changed = baseline != current;
            semantic_lines = current;
        }

        write_file_atomic(&cursor_path, snapshot.pack.as_bytes()).map_err(|e| {
            LisaError::coded("cursor_file_write_failed", format!("failed writing --cursor-file: {e}"))
        })?;
        if req.semantic_only {
            save_semantic_cursor(&sidecar, &semantic_lines, engine.now()).map_err(|e| {
                LisaError::coded("semantic_cursor_write_failed", format!("failed writing semantic cursor: {e}"))
            })?;
        }
        debug!(
            session = %session,
            changed = diff.changed,
            added = diff.added.len(),
            removed = diff.removed.len(),
            "diff-pack compared"
        );

        let mut payload = obj(json!({
            "session": session,
            "status": snapshot.status,
            "sessionState": snapshot.session_state,
            "nextAction": snapshot.next_action,
            "nextOffset": snapshot.next_offset,
            "changed": diff.changed,
            "addedLines": diff.added,
            "removedLines": diff.removed,
            "cursorFile": cursor_path.to_string_lossy(),
            "semanticOnly": req.semantic_only,
            "strategy": strategy.as_str(),
            "tokenBudget": limits.token_budget,
            "truncated": snapshot.truncated,
        }));
        if req.semantic_only {
            payload.insert("semanticCursorFile".into(), json!(sidecar.to_string_lossy()));
            payload.insert("semanticLineCount".into(), json!(semantic_lines.len()));
        }
        if !req.json_min {
            payload.insert("pack".into(), json!(snapshot.pack));
            payload.insert("reason".into(), json!(snapshot.reason));
            payload.insert("events".into(), json!(snapshot.events));
            payload.insert("droppedRecent".into(), json!(snapshot.dropped));
            payload.insert("projectRoot".into(), json!(root));
            if req.semantic_only {
                payload.insert("semanticLines".into(), json!(semantic_lines));
            }
        }
        if snapshot.session_state == "not_found" {
            payload.insert("errorCode".into(), json!("session_not_found"));
            return Ok(CommandOutput::with_exit(payload, 1));
        }
        Ok(CommandOutput::ok(payload))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lisa_protocol::str_field;
    use tempfile::TempDir;

    fn stored_pack(engine: &Engine, root: &str, session: &str) -> Option<String> {
        read_optional(&engine.paths.diff_pack_cursor_file(root, session)).unwrap()
    }

    fn request(session: &str) -> DiffPackRequest {
        DiffPackRequest {
            target: Target::new(session, "/repo"),
            ..DiffPackRequest::default()
        }
    }

    #[test]
    fn test_diff_lines_sorted_sets() {
        let (added, removed) = diff_pack_lines("b\na\n  c  \n", "c\nd\n\nb");
        assert_eq!(added, vec!["d"]);
        assert_eq!(removed, vec!["a"]);
    }

    #[test]
    fn test_pack_diff_change_flag_ignores_outer_whitespace() {
        assert!(!PackDiff::between("x\ny\n", "x\ny").changed);
        assert!(PackDiff::between("x", "y").changed);
    }

    #[test]
    fn test_repeat_run_reports_no_change() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let cursor = tmp.path().join("diff.txt");
        for semantic_only in [false, true] {
            let req = DiffPackRequest {
                cursor_file: cursor.to_string_lossy().into_owned(),
                semantic_only,
                ..request("gone")
            };
            let first = diff_pack_command(&engine, &req);
            let stored = std::fs::read_to_string(&cursor).unwrap();
            assert_eq!(stored, str_field(&first.payload, "pack"));

            let second = diff_pack_command(&engine, &req);
            assert_eq!(second.payload["changed"], false, "{:?}", second.payload);
            assert_eq!(second.payload["addedLines"], json!([]));
            assert_eq!(second.payload["removedLines"], json!([]));
            assert_eq!(std::fs::read_to_string(&cursor).unwrap(), stored);
        }
    }

    #[test]
    fn test_first_run_adds_every_line() {
        let tmp = TempDir::new().unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        tmux.add_session("s1", "compiling\nfinished build");
        let out = diff_pack_command(
            &engine,
            &DiffPackRequest {
                semantic_only: true,
                ..request("s1")
            },
        );
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        assert_eq!(out.payload["changed"], true);
        let added: Vec<&str> = out.payload["addedLines"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(added.contains(&"finished build"));
        assert!(out.payload["semanticLineCount"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_default_cursor_is_per_session() {
        let tmp = TempDir::new().unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        tmux.add_session("s1", "hello");
        let out = diff_pack_command(
            &engine,
            &DiffPackRequest {
                json_min: true,
                ..request("s1")
            },
        );
        assert_eq!(out.exit_code, 0);
        assert!(out.payload.get("pack").is_none());
        let stored = stored_pack(&engine, "/repo", "s1").unwrap();
        assert!(stored.contains("session=s1"));
    }

    #[test]
    fn test_missing_session_still_writes_cursor() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let out = diff_pack_command(&engine, &request("gone"));
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("session_not_found"));
        assert!(stored_pack(&engine, "/repo", "gone").is_some());
    }
}
