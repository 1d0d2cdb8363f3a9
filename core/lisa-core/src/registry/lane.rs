//! Lane registry: named presets that `route` and `handoff` read.

use super::{lowercase_key, read_locked, write_locked};
use crate::clock::format_utc_seconds;
use crate::command::{obj, run, Target};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::storage::{load_json_strict, save_json_pretty};
use lisa_protocol::CommandOutput;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaneRecord {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub goal: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub agent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub nested_policy: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub nesting_intent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub budget: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub topology: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub contract: String,
    pub updated_at: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl LaneRecord {
    /// True when any preset field is set (name and timestamp excluded).
    pub fn has_fields(&self) -> bool {
        [
            &self.goal,
            &self.agent,
            &self.mode,
            &self.nested_policy,
            &self.nesting_intent,
            &self.prompt,
            &self.model,
            &self.topology,
            &self.contract,
        ]
        .iter()
        .any(|v| !v.trim().is_empty())
            || self.budget > 0
    }

    /// Overlays the non-empty fields of `patch`.
    fn merge(&mut self, patch: &LaneRecord) {
        let pairs = [
            (&mut self.goal, &patch.goal),
            (&mut self.agent, &patch.agent),
            (&mut self.mode, &patch.mode),
            (&mut self.nested_policy, &patch.nested_policy),
            (&mut self.nesting_intent, &patch.nesting_intent),
            (&mut self.prompt, &patch.prompt),
            (&mut self.model, &patch.model),
            (&mut self.topology, &patch.topology),
            (&mut self.contract, &patch.contract),
        ];
        for (field, value) in pairs {
            let value = value.trim();
            if !value.is_empty() {
                *field = value.to_string();
            }
        }
        if patch.budget > 0 {
            self.budget = patch.budget;
        }
    }

    /// Whether the lane contract demands schema v2 or later for handoffs.
    pub fn requires_handoff_v2(&self) -> bool {
        let contract = self.contract.trim().to_lowercase();
        contract.contains("handoff_v2_required") || contract.contains("handoff_schema_v2_required")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaneStore {
    pub lanes: BTreeMap<String, LaneRecord>,
    pub updated_at: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Access
// ═══════════════════════════════════════════════════════════════════════════════

pub fn load_lane_store(engine: &Engine, project_root: &str) -> Result<LaneStore> {
    let path = engine.paths.lanes_file(project_root);
    read_locked(engine, &path, || load_json_strict(&path))
}

pub fn update_lane_store<T>(
    engine: &Engine,
    project_root: &str,
    f: impl FnOnce(&mut LaneStore) -> Result<T>,
) -> Result<T> {
    let path = engine.paths.lanes_file(project_root);
    write_locked(engine, &path, || {
        let mut store: LaneStore = load_json_strict(&path)?;
        let out = f(&mut store)?;
        store.updated_at = format_utc_seconds(engine.now());
        save_json_pretty(&path, &store)?;
        Ok(out)
    })
}

/// Writes `store` as-is, keeping its `updatedAt`.
pub fn save_lane_store_exact(engine: &Engine, project_root: &str, store: &LaneStore) -> Result<()> {
    let path = engine.paths.lanes_file(project_root);
    write_locked(engine, &path, || save_json_pretty(&path, store))
}

/// `Ok(None)` when the lane is not registered.
pub fn load_lane_record(engine: &Engine, project_root: &str, name: &str) -> Result<Option<LaneRecord>> {
    let store = load_lane_store(engine, project_root)?;
    Ok(store.lanes.get(&lowercase_key(name)).cloned())
}

/// Lane lookup for commands that take `--lane`; a missing lane is an error.
pub fn require_lane(engine: &Engine, project_root: &str, name: &str) -> Result<LaneRecord> {
    load_lane_record(engine, project_root, name)
        .map_err(|e| LisaError::coded("lane_store_read_failed", format!("failed reading lane store: {e}")))?
        .ok_or_else(|| LisaError::LaneNotFound(lowercase_key(name)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct LaneRequest {
    pub target: Target,
    pub name: String,
    /// Fields to upsert; `name`/`updated_at` are ignored.
    pub fields: LaneRecord,
    pub clear: bool,
    pub list: bool,
}

pub fn lane_command(engine: &Engine, req: &LaneRequest) -> CommandOutput {
    run(|| {
        let name = lowercase_key(&req.name);
        let root = engine.canonical_root(&req.target.project_root);
        let upsert = !req.clear && req.fields.has_fields();
        if req.clear && name.is_empty() {
            return Err(LisaError::invalid("missing_required_flag", "--clear requires --name"));
        }
        if upsert && name.is_empty() {
            return Err(LisaError::invalid("missing_required_flag", "lane upsert requires --name"));
        }

        let action = if req.clear {
            "cleared"
        } else if upsert {
            "upserted"
        } else {
            "read"
        };
        let store = if action == "read" {
            load_lane_store(engine, &root)
                .map_err(|e| LisaError::coded("lane_store_read_failed", format!("failed reading lane store: {e}")))?
        } else {
            let now = format_utc_seconds(engine.now());
            let store = update_lane_store(engine, &root, |store| {
                if req.clear {
                    store.lanes.remove(&name);
                } else {
                    let record = store.lanes.entry(name.clone()).or_default();
                    record.name = name.clone();
                    record.merge(&req.fields);
                    record.updated_at = now;
                }
                Ok(store.clone())
            })
            .map_err(|e| match e {
                LisaError::Json { .. } => {
                    LisaError::coded("lane_store_read_failed", format!("failed reading lane store: {e}"))
                }
                other => LisaError::coded("lane_store_write_failed", format!("failed writing lane store: {other}")),
            })?;
            info!(action, lane = %name, root = %root, "lane store updated");
            store
        };

        let lanes: Vec<&LaneRecord> = store.lanes.values().collect();
        let selected = store.lanes.get(&name);
        let mut payload = obj(json!({
            "action": action,
            "projectRoot": root,
            "count": lanes.len(),
            "lanes": lanes,
        }));
        if !name.is_empty() {
            payload.insert("name".into(), json!(name));
        }
        if let Some(record) = selected {
            payload.insert("lane".into(), json!(record));
        }
        if !name.is_empty() && selected.is_none() && !req.list && action == "read" {
            payload.insert("errorCode".into(), json!("lane_not_found"));
            return Ok(CommandOutput::with_exit(payload, 1));
        }
        Ok(CommandOutput::ok(payload))
    })
}
