//! Objective registry and the `session objective` command.
//!
//! One store per project holds every objective plus the id of the current
//! one. Upserting an objective makes it current; expiry (`--ttl-hours`)
//! removes it on the next load and clears `currentId` if it pointed there.

use super::{is_expired, lowercase_key, read_locked, write_locked};
use crate::clock::format_utc_seconds;
use crate::command::{obj, run, Target};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::storage::{load_json_strict, save_json_pretty};
use crate::types::SessionMeta;
use chrono::{DateTime, Duration, Utc};
use lisa_protocol::{CommandOutput, Payload};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::info;

pub const OBJECTIVE_STATUSES: [&str; 3] = ["open", "done", "paused"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectiveRecord {
    pub id: String,
    pub goal: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub acceptance: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub budget: i64,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub expires_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectiveStore {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub current_id: String,
    pub objectives: BTreeMap<String, ObjectiveRecord>,
    pub updated_at: String,
}

impl ObjectiveStore {
    fn prune_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .objectives
            .iter()
            .filter(|(_, record)| is_expired(&record.expires_at, now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.objectives.remove(&id);
            if self.current_id == id {
                self.current_id.clear();
            }
        }
    }
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Access
// ═══════════════════════════════════════════════════════════════════════════════

/// Loads the store with expired objectives removed.
pub fn load_objective_store(engine: &Engine, project_root: &str) -> Result<ObjectiveStore> {
    let path = engine.paths.objectives_file(project_root);
    let mut store: ObjectiveStore = read_locked(engine, &path, || load_json_strict(&path))?;
    store.prune_expired(engine.now());
    Ok(store)
}

/// Load, mutate, and save under one exclusive lock.
pub fn update_objective_store<T>(
    engine: &Engine,
    project_root: &str,
    f: impl FnOnce(&mut ObjectiveStore) -> Result<T>,
) -> Result<T> {
    let path = engine.paths.objectives_file(project_root);
    write_locked(engine, &path, || {
        let mut store: ObjectiveStore = load_json_strict(&path)?;
        store.prune_expired(engine.now());
        let out = f(&mut store)?;
        store.updated_at = format_utc_seconds(engine.now());
        save_json_pretty(&path, &store)?;
        Ok(out)
    })
}

/// Writes `store` as-is, keeping its `updatedAt`.
pub fn save_objective_store_exact(engine: &Engine, project_root: &str, store: &ObjectiveStore) -> Result<()> {
    let path = engine.paths.objectives_file(project_root);
    write_locked(engine, &path, || save_json_pretty(&path, store))
}

pub fn current_objective(engine: &Engine, project_root: &str) -> Option<ObjectiveRecord> {
    let store = load_objective_store(engine, project_root).ok()?;
    if store.current_id.trim().is_empty() {
        return None;
    }
    let mut record = store.objectives.get(&store.current_id)?.clone();
    if record.status.trim().is_empty() {
        record.status = "open".to_string();
    }
    Some(record)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Prompt & Meta Helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// `{id, goal, acceptance, budget, lane}` from session meta; `None` when the
/// session carries no objective.
pub fn objective_payload_from_meta(meta: &SessionMeta) -> Option<Payload> {
    let id = meta.objective_id.trim();
    let goal = meta.objective_goal.trim();
    if id.is_empty() && goal.is_empty() {
        return None;
    }
    let mut payload = Payload::new();
    if !id.is_empty() {
        payload.insert("id".into(), json!(id));
    }
    if !goal.is_empty() {
        payload.insert("goal".into(), json!(goal));
    }
    if !meta.objective_acceptance.trim().is_empty() {
        payload.insert("acceptance".into(), json!(meta.objective_acceptance));
    }
    if meta.objective_budget > 0 {
        payload.insert("budget".into(), json!(meta.objective_budget));
    }
    if !meta.lane.trim().is_empty() {
        payload.insert("lane".into(), json!(meta.lane));
    }
    Some(payload)
}

fn objective_parts(id: &str, goal: &str, acceptance: &str, budget: i64) -> Vec<String> {
    let mut parts = Vec::new();
    for (key, value) in [("id", id), ("goal", goal), ("acceptance", acceptance)] {
        if !value.trim().is_empty() {
            parts.push(format!("{key}={}", value.trim()));
        }
    }
    if budget > 0 {
        parts.push(format!("budget={budget}"));
    }
    parts
}

fn reminder_parts(meta: &SessionMeta) -> Vec<String> {
    let mut parts = objective_parts(
        &meta.objective_id,
        &meta.objective_goal,
        &meta.objective_acceptance,
        meta.objective_budget,
    );
    if parts.is_empty() {
        return parts;
    }
    if !meta.lane.trim().is_empty() {
        parts.push(format!("lane={}", meta.lane.trim()));
    }
    parts
}

/// `Objective reminder: id=.. | goal=..` prefix for `session send`.
pub fn objective_reminder_prefix(meta: &SessionMeta) -> String {
    let parts = reminder_parts(meta);
    if parts.is_empty() {
        return String::new();
    }
    format!("Objective reminder: {}", parts.join(" | "))
}

/// Whether `text` already carries the reminder (verbatim or part by part).
pub fn objective_reminder_present(text: &str, prefix: &str, meta: &SessionMeta) -> bool {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return false;
    }
    let lower_prefix = prefix.trim().to_lowercase();
    if !lower_prefix.is_empty() && lower.contains(&lower_prefix) {
        return true;
    }
    if !lower.contains("objective reminder:") {
        return false;
    }
    reminder_parts(meta)
        .iter()
        .all(|part| lower.contains(&part.to_lowercase()))
}

/// `id=.. | goal=.. | acceptance=.. | budget=..` for pack bodies.
pub fn objective_summary_line(meta: &SessionMeta) -> String {
    objective_parts(
        &meta.objective_id,
        &meta.objective_goal,
        &meta.objective_acceptance,
        meta.objective_budget,
    )
    .join(" | ")
}

pub fn objective_prompt_prefix(record: &ObjectiveRecord, lane: &str) -> String {
    let mut parts = objective_parts(&record.id, &record.goal, &record.acceptance, record.budget);
    if !lane.trim().is_empty() {
        parts.push(format!("lane={}", lane.trim()));
    }
    if parts.is_empty() {
        return String::new();
    }
    format!("Objective context: {}", parts.join(" | "))
}

/// Prepends the objective context unless the prompt already names the goal or id.
pub fn inject_objective_into_prompt(prompt: &str, record: &ObjectiveRecord, lane: &str) -> String {
    let prefix = objective_prompt_prefix(record, lane);
    if prefix.is_empty() {
        return prompt.to_string();
    }
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return prefix;
    }
    let lower = trimmed.to_lowercase();
    let mentions = |needle: &str| !needle.trim().is_empty() && lower.contains(&needle.to_lowercase());
    if mentions(&record.goal) || mentions(&record.id) {
        return prompt.to_string();
    }
    format!("{prefix}\n\n{prompt}")
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct ObjectiveRequest {
    pub target: Target,
    pub id: String,
    pub goal: String,
    pub acceptance: String,
    pub budget: i64,
    pub status: String,
    pub ttl_hours: i64,
    pub activate: bool,
    pub clear: bool,
    pub list: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectiveAction {
    Read,
    Cleared,
    Upserted,
    Activated,
}

impl ObjectiveAction {
    fn as_str(self) -> &'static str {
        match self {
            ObjectiveAction::Read => "read",
            ObjectiveAction::Cleared => "cleared",
            ObjectiveAction::Upserted => "upserted",
            ObjectiveAction::Activated => "activated",
        }
    }
}

impl ObjectiveRequest {
    fn wants_upsert(&self) -> bool {
        !self.goal.trim().is_empty()
            || !self.acceptance.trim().is_empty()
            || self.budget > 0
            || !self.status.is_empty()
    }

    fn action(&self) -> ObjectiveAction {
        if self.clear {
            ObjectiveAction::Cleared
        } else if self.wants_upsert() {
            ObjectiveAction::Upserted
        } else if self.activate {
            ObjectiveAction::Activated
        } else {
            ObjectiveAction::Read
        }
    }

    fn validate(&self, id: &str) -> Result<()> {
        if !self.status.is_empty() && !OBJECTIVE_STATUSES.contains(&self.status.as_str()) {
            return Err(LisaError::invalid(
                "invalid_status",
                format!("invalid --status: {} (expected open|done|paused)", self.status),
            ));
        }
        let missing = match self.action() {
            ObjectiveAction::Cleared if id.is_empty() => Some("--clear requires --id"),
            ObjectiveAction::Upserted if id.is_empty() => Some("upsert requires --id"),
            ObjectiveAction::Activated if id.is_empty() => Some("--activate requires --id"),
            _ => None,
        };
        match missing {
            Some(message) => Err(LisaError::invalid("missing_required_flag", message)),
            None => Ok(()),
        }
    }
}

fn apply_objective(
    store: &mut ObjectiveStore,
    req: &ObjectiveRequest,
    id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let stamp = format_utc_seconds(now);
    match req.action() {
        ObjectiveAction::Cleared => {
            store.objectives.remove(id);
            if store.current_id == id {
                store.current_id.clear();
            }
        }
        ObjectiveAction::Upserted => {
            let record = store.objectives.entry(id.to_string()).or_default();
            if record.id.trim().is_empty() {
                record.id = id.to_string();
                record.created_at = stamp.clone();
                record.status = "open".to_string();
            }
            if !req.goal.is_empty() {
                record.goal = req.goal.clone();
            }
            if !req.acceptance.is_empty() {
                record.acceptance = req.acceptance.clone();
            }
            if req.budget > 0 {
                record.budget = req.budget;
            }
            if !req.status.is_empty() {
                record.status = req.status.clone();
            }
            record.updated_at = stamp;
            if req.ttl_hours > 0 {
                record.expires_at = format_utc_seconds(now + Duration::hours(req.ttl_hours));
            }
            store.current_id = id.to_string();
        }
        ObjectiveAction::Activated => {
            if !store.objectives.contains_key(id) {
                return Err(LisaError::ObjectiveNotFound(id.to_string()));
            }
            store.current_id = id.to_string();
        }
        ObjectiveAction::Read => {}
    }
    Ok(())
}

pub fn objective_command(engine: &Engine, req: &ObjectiveRequest) -> CommandOutput {
    run(|| {
        let id = lowercase_key(&req.id);
        req.validate(&id)?;
        let root = engine.canonical_root(&req.target.project_root);
        let action = req.action();

        let store = if action == ObjectiveAction::Read {
            load_objective_store(engine, &root)
                .map_err(|e| LisaError::coded("objective_store_read_failed", format!("failed reading objective store: {e}")))?
        } else {
            let store = update_objective_store(engine, &root, |store| {
                apply_objective(store, req, &id, engine.now())?;
                Ok(store.clone())
            })
            .map_err(|e| match e {
                LisaError::ObjectiveNotFound(_) => e,
                LisaError::Json { .. } => LisaError::coded(
                    "objective_store_read_failed",
                    format!("failed reading objective store: {e}"),
                ),
                other => LisaError::coded(
                    "objective_store_write_failed",
                    format!("failed writing objective store: {other}"),
                ),
            })?;
            info!(action = action.as_str(), id = %id, root = %root, "objective store updated");
            store
        };

        let selected_id = if id.is_empty() { store.current_id.as_str() } else { id.as_str() };
        let selected = store.objectives.get(selected_id);
        let objectives: Vec<&ObjectiveRecord> = store.objectives.values().collect();

        let mut payload = obj(json!({
            "action": action.as_str(),
            "projectRoot": root,
            "currentId": store.current_id,
            "count": objectives.len(),
            "objectives": objectives,
        }));
        if let Some(record) = selected {
            payload.insert("objective".into(), json!(record));
        }
        if !id.is_empty() {
            payload.insert("id".into(), Value::String(id.clone()));
        }
        if !req.list && !id.is_empty() && selected.is_none() && !req.clear {
            payload.insert("errorCode".into(), json!("objective_not_found"));
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

    fn setup() -> (TempDir, Engine, std::sync::Arc<crate::testing::FixedClock>) {
        let tmp = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let (engine, _, clock) = Engine::with_fakes(tmp.path(), now);
        (tmp, engine, clock)
    }

    fn request(id: &str) -> ObjectiveRequest {
        ObjectiveRequest {
            target: Target::new("", "/repo"),
            id: id.to_string(),
            ..ObjectiveRequest::default()
        }
    }

    #[test]
    fn test_upsert_sets_current_and_defaults_open() {
        let (_tmp, engine, _) = setup();
        let out = objective_command(
            &engine,
            &ObjectiveRequest {
                goal: "Ship parser".into(),
                budget: 900,
                ..request("OBJ-1")
            },
        );
        assert_eq!(out.exit_code, 0);
        assert_eq!(str_field(&out.payload, "action"), "upserted");
        assert_eq!(str_field(&out.payload, "currentId"), "obj-1");
        assert_eq!(out.payload["objective"]["status"], "open");
        assert_eq!(out.payload["objective"]["budget"], 900);

        let current = current_objective(&engine, "/repo").unwrap();
        assert_eq!(current.goal, "Ship parser");
    }

    #[test]
    fn test_activate_missing_objective_fails() {
        let (_tmp, engine, _) = setup();
        let out = objective_command(
            &engine,
            &ObjectiveRequest {
                activate: true,
                ..request("ghost")
            },
        );
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("objective_not_found"));
    }

    #[test]
    fn test_read_unknown_id_reports_not_found_payload() {
        let (_tmp, engine, _) = setup();
        let out = objective_command(&engine, &request("nope"));
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("objective_not_found"));
        assert_eq!(out.payload["count"], 0);
    }

    #[test]
    fn test_ttl_expiry_prunes_and_clears_current() {
        let (_tmp, engine, clock) = setup();
        objective_command(
            &engine,
            &ObjectiveRequest {
                goal: "short lived".into(),
                ttl_hours: 1,
                ..request("tmp")
            },
        );
        clock.advance_seconds(2 * 3600);
        let store = load_objective_store(&engine, "/repo").unwrap();
        assert!(store.objectives.is_empty());
        assert!(store.current_id.is_empty());
        assert!(current_objective(&engine, "/repo").is_none());
    }

    #[test]
    fn test_invalid_status_and_missing_id() {
        let (_tmp, engine, _) = setup();
        let out = objective_command(
            &engine,
            &ObjectiveRequest {
                status: "later".into(),
                ..request("x")
            },
        );
        assert_eq!(out.error_code(), Some("invalid_status"));

        let out = objective_command(
            &engine,
            &ObjectiveRequest {
                goal: "g".into(),
                ..request("")
            },
        );
        assert_eq!(out.error_code(), Some("missing_required_flag"));
    }

    #[test]
    fn test_clear_removes_record() {
        let (_tmp, engine, _) = setup();
        objective_command(&engine, &ObjectiveRequest { goal: "g".into(), ..request("a") });
        let out = objective_command(&engine, &ObjectiveRequest { clear: true, ..request("a") });
        assert_eq!(out.exit_code, 0);
        assert_eq!(str_field(&out.payload, "action"), "cleared");
        assert_eq!(out.payload["count"], 0);
        assert_eq!(str_field(&out.payload, "currentId"), "");
    }

    #[test]
    fn test_reminder_prefix_and_presence() {
        let meta = SessionMeta {
            objective_id: "obj-1".into(),
            objective_goal: "Ship".into(),
            objective_budget: 300,
            lane: "fast".into(),
            ..SessionMeta::default()
        };
        let prefix = objective_reminder_prefix(&meta);
        assert_eq!(prefix, "Objective reminder: id=obj-1 | goal=Ship | budget=300 | lane=fast");
        assert!(objective_reminder_present(&format!("{prefix}\n\ndo it"), &prefix, &meta));
        assert!(!objective_reminder_present("do it", &prefix, &meta));

        let lane_only = SessionMeta {
            lane: "fast".into(),
            ..SessionMeta::default()
        };
        assert_eq!(objective_reminder_prefix(&lane_only), "");
        assert!(objective_payload_from_meta(&lane_only).is_none());
        assert_eq!(objective_payload_from_meta(&meta).unwrap()["lane"], "fast");
    }

    #[test]
    fn test_inject_skips_prompts_naming_the_goal() {
        let record = ObjectiveRecord {
            id: "obj-1".into(),
            goal: "Fix the parser".into(),
            ..ObjectiveRecord::default()
        };
        let injected = inject_objective_into_prompt("start work", &record, "");
        assert!(injected.starts_with("Objective context: id=obj-1 | goal=Fix the parser\n\n"));
        assert_eq!(inject_objective_into_prompt("please fix the parser", &record, ""), "please fix the parser");
        assert_eq!(inject_objective_into_prompt("", &record, "l1"), "Objective context: id=obj-1 | goal=Fix the parser | lane=l1");
    }
}
