//! Multi-session views: `session list` and `session aggregate`.
//!
//! Both can persist a delta cursor, a JSON map of `session -> item` from the
//! previous run, and report `{added, removed, changed}` against it. Delta
//! lists are sorted by session name.

use crate::classifier::next_action_for_state;
use crate::command::{obj, run, Target};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::meta::resolve_session_project_root;
use crate::pack::{build_pack_snapshot, dedupe_semantic_pack_lines, PackLimits, PackOptions, PackStrategy};
use crate::payload::{parse_comma_values, resolve_file_flag, truncate_to_token_budget};
use crate::router::compute_session_priority;
use crate::session::normalized_status;
use crate::status::{compute_session_status, StatusRequest};
use crate::storage::{load_json_strict, save_json_pretty};
use lisa_protocol::{CommandOutput, Payload};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Lower bound of the per-session token budget in `aggregate`.
pub const MIN_AGGREGATE_SESSION_BUDGET: i64 = 120;
pub const DEFAULT_AGGREGATE_TOKEN_BUDGET: i64 = 900;

// ═══════════════════════════════════════════════════════════════════════════════
// Delta Cursor
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeltaCursor<T> {
    #[serde(default)]
    updated_at: String,
    #[serde(default = "BTreeMap::new")]
    items: BTreeMap<String, T>,
}

impl<T> Default for DeltaCursor<T> {
    fn default() -> Self {
        Self {
            updated_at: String::new(),
            items: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetDelta<T> {
    pub added: Vec<T>,
    pub removed: Vec<T>,
    pub changed: Vec<T>,
    pub count: usize,
}

/// Compares two keyed snapshots.
pub fn compute_set_delta<T: Clone + PartialEq>(
    previous: &BTreeMap<String, T>,
    current: &BTreeMap<String, T>,
) -> SetDelta<T> {
    let mut added = Vec::new();
    let mut changed = Vec::new();
    for (key, item) in current {
        match previous.get(key) {
            None => added.push(item.clone()),
            Some(prev) if prev != item => changed.push(item.clone()),
            Some(_) => {}
        }
    }
    let removed: Vec<T> = previous
        .iter()
        .filter(|(key, _)| !current.contains_key(*key))
        .map(|(_, item)| item.clone())
        .collect();
    let count = added.len() + removed.len() + changed.len();
    SetDelta {
        added,
        removed,
        changed,
        count,
    }
}

/// Loads the previous snapshot, diffs, and stores the current one.
fn advance_delta_cursor<T>(engine: &Engine, path: &Path, current: BTreeMap<String, T>) -> Result<SetDelta<T>>
where
    T: Clone + PartialEq + Serialize + serde::de::DeserializeOwned,
{
    let previous: DeltaCursor<T> = load_json_strict(path)
        .map_err(|e| LisaError::invalid("invalid_cursor_file", format!("invalid --cursor-file: {e}")))?;
    let delta = compute_set_delta(&previous.items, &current);
    let cursor = DeltaCursor {
        updated_at: engine.now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        items: current,
    };
    save_json_pretty(path, &cursor).map_err(|e| {
        LisaError::coded("cursor_file_write_failed", format!("failed writing --cursor-file: {e}"))
    })?;
    Ok(delta)
}

fn delta_cursor_path(raw: &str, delta_json: bool, fallback: PathBuf) -> Result<Option<PathBuf>> {
    if !raw.trim().is_empty() && !delta_json {
        return Err(LisaError::invalid(
            "cursor_file_requires_delta_json",
            "--cursor-file requires --delta-json",
        ));
    }
    if !delta_json {
        return Ok(None);
    }
    let path = resolve_file_flag("--cursor-file", raw)
        .map_err(|e| LisaError::invalid("invalid_cursor_file", e.to_string()))?;
    Ok(Some(path.unwrap_or(fallback)))
}

fn delta_value<T: Serialize>(delta: &SetDelta<T>) -> Value {
    json!(delta)
}

// ═══════════════════════════════════════════════════════════════════════════════
// List
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListItem {
    pub session: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub session_state: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub next_action: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub priority_score: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub priority_label: String,
    pub project_root: String,
    pub socket_path: String,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub project_root: String,
    pub project_only: bool,
    /// Drop sessions whose status is `not_found`.
    pub active_only: bool,
    pub with_next_action: bool,
    /// Sort by priority score; implies `with_next_action`.
    pub priority: bool,
    pub delta_json: bool,
    pub cursor_file: String,
    pub json_min: bool,
}

/// Highest score first, then name.
pub fn sort_list_by_priority(items: &mut [ListItem]) {
    items.sort_by(|a, b| {
        b.priority_score
            .cmp(&a.priority_score)
            .then_with(|| a.session.cmp(&b.session))
    });
}

fn list_item(engine: &Engine, session: &str, root: &str) -> ListItem {
    ListItem {
        session: session.to_string(),
        project_root: root.to_string(),
        socket_path: engine.paths.tmux_socket_path(root).to_string_lossy().into_owned(),
        ..ListItem::default()
    }
}

pub fn list_command(engine: &Engine, req: &ListRequest) -> CommandOutput {
    run(|| {
        let root = engine.canonical_root(&req.project_root);
        let with_next_action = req.with_next_action || req.priority;
        let cursor_path = delta_cursor_path(&req.cursor_file, req.delta_json, engine.paths.list_delta_file(&root))?;

        let mut sessions = {
            let _scope = engine.runtime_scope(&root);
            engine
                .tmux
                .list_sessions(req.project_only, &root)
                .map_err(|e| LisaError::coded("session_list_failed", format!("failed to list sessions: {e}")))?
        };
        sessions.sort();

        let mut items: Vec<ListItem> = Vec::with_capacity(sessions.len());
        for session in &sessions {
            let resolved = resolve_session_project_root(engine, session, &root, false).unwrap_or_else(|err| {
                warn!(session = %session, error = %err, "list falling back to caller root");
                root.clone()
            });
            let mut item = list_item(engine, session, &resolved);
            if with_next_action || req.active_only {
                let status_req = StatusRequest {
                    agent_hint: "auto".into(),
                    mode_hint: "auto".into(),
                    ..StatusRequest::new(session, &resolved)
                };
                match compute_session_status(engine, &status_req) {
                    Ok(status) => {
                        let status = normalized_status(status);
                        if req.active_only && status.session_state == "not_found" {
                            continue;
                        }
                        let (score, label) = compute_session_priority(&status.session_state);
                        item.next_action = next_action_for_state(&status.session_state).to_string();
                        item.priority_score = score;
                        item.priority_label = label.to_string();
                        item.status = status.status;
                        item.session_state = status.session_state;
                    }
                    Err(err) => {
                        debug!(session = %session, error = %err, "list status unavailable");
                        if req.active_only {
                            continue;
                        }
                        item.next_action = "session status".into();
                    }
                }
            }
            items.push(item);
        }
        if req.priority {
            sort_list_by_priority(&mut items);
        }
        let names: Vec<String> = items.iter().map(|i| i.session.clone()).collect();

        let mut payload = obj(json!({"sessions": names, "count": names.len()}));
        if with_next_action {
            payload.insert("items".into(), json!(items));
        }
        if let Some(path) = &cursor_path {
            let current: BTreeMap<String, ListItem> =
                items.iter().map(|i| (i.session.clone(), i.clone())).collect();
            let delta = advance_delta_cursor(engine, path, current)?;
            debug!(cursor = %path.display(), changes = delta.count, "list delta computed");
            payload.insert("delta".into(), delta_value(&delta));
            payload.insert("cursorFile".into(), json!(path.to_string_lossy()));
        }
        if !req.json_min {
            payload.insert("projectOnly".into(), json!(req.project_only));
            payload.insert("activeOnly".into(), json!(req.active_only));
            payload.insert("withNextAction".into(), json!(with_next_action));
            payload.insert("priority".into(), json!(req.priority));
            payload.insert("projectRoot".into(), json!(root));
        }
        Ok(CommandOutput::ok(payload))
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Aggregate
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregateDeltaItem {
    pub session: String,
    pub status: String,
    pub session_state: String,
    pub next_action: String,
    pub next_offset: usize,
    pub pack: String,
}

#[derive(Debug, Clone)]
pub struct AggregateRequest {
    /// Comma-separated names; empty aggregates every listed session.
    pub sessions: String,
    pub project_root: String,
    pub strategy: String,
    pub events: Option<usize>,
    pub lines: Option<usize>,
    /// Total budget, split evenly across sessions.
    pub token_budget: i64,
    pub dedupe: bool,
    pub delta_json: bool,
    pub cursor_file: String,
    pub json_min: bool,
}

impl Default for AggregateRequest {
    fn default() -> Self {
        Self {
            sessions: String::new(),
            project_root: String::new(),
            strategy: "balanced".into(),
            events: None,
            lines: None,
            token_budget: DEFAULT_AGGREGATE_TOKEN_BUDGET,
            dedupe: false,
            delta_json: false,
            cursor_file: String::new(),
            json_min: false,
        }
    }
}

/// `floor(total / sessions)`, never below [`MIN_AGGREGATE_SESSION_BUDGET`].
pub fn per_session_budget(total: i64, sessions: usize) -> i64 {
    if sessions == 0 {
        return total.max(MIN_AGGREGATE_SESSION_BUDGET);
    }
    (total / sessions as i64).max(MIN_AGGREGATE_SESSION_BUDGET)
}

/// Packs every session under one combined budget.
///
/// Not-found sessions are reported with `aggregate_partial_not_found` and
/// exit 1, but every other session is still packed. An ambiguous root adds a
/// `warnings[]` entry and falls back to the caller's root.
pub fn aggregate_command(engine: &Engine, req: &AggregateRequest) -> CommandOutput {
    run(|| {
        let strategy = PackStrategy::parse(&req.strategy)?;
        if req.token_budget <= 0 {
            return Err(LisaError::invalid(
                "invalid_token_budget",
                "invalid --token-budget: must be > 0",
            ));
        }
        let root = engine.canonical_root(&req.project_root);
        let cursor_path =
            delta_cursor_path(&req.cursor_file, req.delta_json, engine.paths.aggregate_delta_file(&root))?;

        let mut sessions = parse_comma_values(&req.sessions);
        if sessions.is_empty() {
            let _scope = engine.runtime_scope(&root);
            sessions = engine.tmux.list_sessions(false, &root).map_err(|e| {
                LisaError::coded(
                    "session_list_failed",
                    format!("failed to list sessions for aggregate: {e}"),
                )
            })?;
        }
        if sessions.is_empty() {
            return Err(LisaError::coded("no_sessions", "no sessions available for aggregation"));
        }
        sessions.sort();

        let per_budget = per_session_budget(req.token_budget, sessions.len());
        let mut limits = PackLimits {
            events: req.events,
            lines: req.lines,
            token_budget: Some(per_budget),
        }
        .resolve(strategy)?;
        limits.token_budget = per_budget;
        let opts = PackOptions {
            strategy,
            limits,
            redact: Vec::new(),
        };

        let mut items: Vec<Value> = Vec::with_capacity(sessions.len());
        let mut warnings: Vec<Value> = Vec::new();
        let mut current: BTreeMap<String, AggregateDeltaItem> = BTreeMap::new();
        let mut combined: Vec<String> = Vec::with_capacity(sessions.len() * 3);
        let mut not_found = 0usize;

        for session in &sessions {
            let (resolved, warning) = match resolve_session_project_root(engine, session, &root, false) {
                Ok(resolved) => (resolved, None),
                Err(err @ LisaError::AmbiguousProjectRoot { .. }) => {
                    warn!(session = %session, error = %err, "aggregate root ambiguous");
                    let warning = json!({
                        "session": session,
                        "errorCode": err.code(),
                        "message": err.to_string(),
                        "fallback": root,
                    });
                    warnings.push(warning.clone());
                    (root.clone(), Some(warning))
                }
                Err(_) => (root.clone(), None),
            };
            let target = Target {
                session: session.clone(),
                project_root: resolved.clone(),
                explicit_root: true,
            };
            let mut item: Payload = match build_pack_snapshot(engine, &target, &opts) {
                Ok(snapshot) => {
                    if snapshot.session_state == "not_found" {
                        not_found += 1;
                    }
                    let mut item = obj(json!({
                        "session": snapshot.session,
                        "status": snapshot.status,
                        "sessionState": snapshot.session_state,
                        "nextAction": snapshot.next_action,
                        "nextOffset": snapshot.next_offset,
                        "truncated": snapshot.truncated,
                        "pack": snapshot.pack,
                    }));
                    if !req.json_min {
                        item.insert("reason".into(), json!(snapshot.reason));
                        item.insert("events".into(), json!(snapshot.events));
                        item.insert("droppedRecent".into(), json!(snapshot.dropped));
                        item.insert("projectRoot".into(), json!(resolved));
                    }
                    combined.push(format!("session={}", snapshot.session));
                    combined.push(snapshot.pack.clone());
                    combined.push("---".to_string());
                    current.insert(
                        session.clone(),
                        AggregateDeltaItem {
                            session: snapshot.session,
                            status: snapshot.status,
                            session_state: snapshot.session_state,
                            next_action: snapshot.next_action.to_string(),
                            next_offset: snapshot.next_offset,
                            pack: snapshot.pack,
                        },
                    );
                    item
                }
                Err(err) => {
                    warn!(session = %session, error = %err, "aggregate snapshot failed");
                    obj(json!({
                        "session": session,
                        "error": err.to_string(),
                        "errorCode": "aggregate_snapshot_failed",
                    }))
                }
            };
            if let Some(warning) = warning {
                item.insert("warning".into(), warning);
            }
            items.push(Value::Object(item));
        }

        let mut combined_raw = combined.join("\n");
        let mut dedupe_removed = 0;
        if req.dedupe {
            (combined_raw, dedupe_removed) = dedupe_semantic_pack_lines(&combined_raw);
        }
        let (combined_pack, truncated) = truncate_to_token_budget(&combined_raw, req.token_budget);

        let mut payload = obj(json!({
            "sessionCount": sessions.len(),
            "items": items,
            "combinedPack": combined_pack,
            "truncated": truncated,
            "tokenBudget": req.token_budget,
            "perSessionBudget": per_budget,
            "strategy": strategy.as_str(),
            "dedupe": req.dedupe,
            "dedupeRemoved": dedupe_removed,
        }));
        if let Some(path) = &cursor_path {
            let delta = advance_delta_cursor(engine, path, current)?;
            payload.insert("delta".into(), delta_value(&delta));
            payload.insert("cursorFile".into(), json!(path.to_string_lossy()));
        }
        if !req.json_min {
            payload.insert("projectRoot".into(), json!(root));
            payload.insert("sessions".into(), json!(sessions));
        }
        if !warnings.is_empty() {
            payload.insert("warnings".into(), json!(warnings));
        }
        if not_found > 0 {
            info!(not_found, total = sessions.len(), "aggregate missing sessions");
            payload.insert("ok".into(), json!(false));
            payload.insert("errorCode".into(), json!("aggregate_partial_not_found"));
            payload.insert("error".into(), json!(format!("{not_found} session(s) not found")));
            payload.insert("notFoundCount".into(), json!(not_found));
            return Ok(CommandOutput::with_exit(payload, 1));
        }
        Ok(CommandOutput::ok(payload))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::save_session_meta;
    use crate::types::SessionMeta;
    use chrono::Utc;
    use lisa_protocol::str_field;
    use tempfile::TempDir;

    fn item(session: &str, state: &str) -> ListItem {
        ListItem {
            session: session.into(),
            session_state: state.into(),
            ..ListItem::default()
        }
    }

    #[test]
    fn test_set_delta_is_sorted_and_counted() {
        let previous: BTreeMap<String, ListItem> =
            [("b", "in_progress"), ("c", "stuck")].iter().map(|(s, st)| (s.to_string(), item(s, st))).collect();
        let current: BTreeMap<String, ListItem> = [("a", "in_progress"), ("b", "completed")]
            .iter()
            .map(|(s, st)| (s.to_string(), item(s, st)))
            .collect();
        let delta = compute_set_delta(&previous, &current);
        assert_eq!(delta.added, vec![item("a", "in_progress")]);
        assert_eq!(delta.changed, vec![item("b", "completed")]);
        assert_eq!(delta.removed, vec![item("c", "stuck")]);
        assert_eq!(delta.count, 3);
        assert_eq!(compute_set_delta(&current, &current).count, 0);
    }

    #[test]
    fn test_per_session_budget_floor() {
        assert_eq!(per_session_budget(900, 3), 300);
        assert_eq!(per_session_budget(900, 10), 120);
        assert_eq!(per_session_budget(1000, 3), 333);
    }

    #[test]
    fn test_priority_sort_breaks_ties_by_name() {
        let mut items = vec![
            ListItem { priority_score: 70, ..item("b", "") },
            ListItem { priority_score: 100, ..item("z", "") },
            ListItem { priority_score: 70, ..item("a", "") },
        ];
        sort_list_by_priority(&mut items);
        let names: Vec<&str> = items.iter().map(|i| i.session.as_str()).collect();
        assert_eq!(names, vec!["z", "a", "b"]);
    }

    #[test]
    fn test_list_delta_cursor_round() {
        let tmp = TempDir::new().unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        tmux.add_session("beta", "working");
        tmux.add_session("alpha", "working");
        let req = ListRequest {
            project_root: "/repo".into(),
            delta_json: true,
            json_min: true,
            ..ListRequest::default()
        };
        let first = list_command(&engine, &req);
        assert_eq!(first.exit_code, 0, "{:?}", first.payload);
        assert_eq!(first.payload["sessions"], json!(["alpha", "beta"]));
        assert_eq!(first.payload["delta"]["added"].as_array().unwrap().len(), 2);

        tmux.remove_session("beta");
        let second = list_command(&engine, &req);
        assert_eq!(second.payload["delta"]["count"], 1);
        assert_eq!(second.payload["delta"]["removed"][0]["session"], "beta");
        assert!(second.payload.get("projectRoot").is_none());
    }

    #[test]
    fn test_list_rejects_cursor_without_delta() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let req = ListRequest {
            cursor_file: "/tmp/x.json".into(),
            ..ListRequest::default()
        };
        assert_eq!(list_command(&engine, &req).error_code(), Some("cursor_file_requires_delta_json"));
    }

    #[test]
    fn test_list_priority_items() {
        let tmp = TempDir::new().unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        tmux.add_session("s1", "working");
        let req = ListRequest {
            project_root: "/repo".into(),
            priority: true,
            ..ListRequest::default()
        };
        let out = list_command(&engine, &req);
        assert_eq!(out.payload["withNextAction"], true);
        let first = &out.payload["items"][0];
        assert_eq!(first["session"], "s1");
        assert!(first["priorityScore"].as_u64().unwrap() > 0);
        assert!(first["socketPath"].as_str().unwrap().ends_with(".sock"));
    }

    #[test]
    fn test_aggregate_partial_not_found() {
        let tmp = TempDir::new().unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        tmux.add_session("live", "build ok\nbuild ok");
        let req = AggregateRequest {
            sessions: "live,gone".into(),
            project_root: "/repo".into(),
            ..AggregateRequest::default()
        };
        let out = aggregate_command(&engine, &req);
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("aggregate_partial_not_found"));
        assert_eq!(out.payload["notFoundCount"], 1);
        assert_eq!(out.payload["perSessionBudget"], 450);
        assert_eq!(out.payload["sessions"], json!(["gone", "live"]));
        let combined = str_field(&out.payload, "combinedPack");
        assert!(combined.starts_with("session=gone\n"));
        assert!(combined.contains("session=live"));
    }

    #[test]
    fn test_aggregate_dedupe_and_delta() {
        let tmp = TempDir::new().unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        tmux.add_session("a", "same line");
        tmux.add_session("b", "same line");
        let req = AggregateRequest {
            project_root: "/repo".into(),
            dedupe: true,
            delta_json: true,
            ..AggregateRequest::default()
        };
        let out = aggregate_command(&engine, &req);
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        assert!(out.payload["dedupeRemoved"].as_u64().unwrap() >= 1);
        assert_eq!(out.payload["delta"]["added"].as_array().unwrap().len(), 2);
        let again = aggregate_command(&engine, &req);
        assert_eq!(again.payload["delta"]["added"], json!([]));
        assert_eq!(again.payload["delta"]["removed"], json!([]));
        assert!(engine.paths.aggregate_delta_file(&engine.canonical_root("/repo")).exists());
    }

    #[test]
    fn test_aggregate_warns_on_ambiguous_root() {
        let tmp = TempDir::new().unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        tmux.add_session("dup", "x");
        for root in ["/proj-one", "/proj-two"] {
            let meta = SessionMeta {
                session: "dup".into(),
                project_root: root.into(),
                ..SessionMeta::default()
            };
            save_session_meta(&engine, root, "dup", &meta).unwrap();
        }
        let req = AggregateRequest {
            sessions: "dup".into(),
            project_root: "/elsewhere".into(),
            ..AggregateRequest::default()
        };
        let out = aggregate_command(&engine, &req);
        assert_eq!(out.payload["warnings"][0]["errorCode"], "ambiguous_project_root");
        assert_eq!(out.payload["items"][0]["warning"]["fallback"], "/elsewhere");
    }

    #[test]
    fn test_aggregate_requires_sessions() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let out = aggregate_command(&engine, &AggregateRequest::default());
        assert_eq!(out.error_code(), Some("no_sessions"));
    }
}
