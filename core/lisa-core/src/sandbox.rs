//! `session state-sandbox`: snapshot, restore, clear and list the objective
//! and lane registries of one project.

use crate::command::{obj, run};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::payload::resolve_file_flag;
use crate::registry::lane::save_lane_store_exact;
use crate::registry::objective::save_objective_store_exact;
use crate::registry::{load_lane_store, load_objective_store, write_locked, LaneStore, ObjectiveStore};
use crate::storage::{read_optional, remove_if_exists, save_json_pretty};
use lisa_protocol::CommandOutput;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::info;

pub const SANDBOX_VERSION: &str = "1";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxSnapshot {
    pub version: String,
    pub project_root: String,
    pub objective_store: ObjectiveStore,
    pub lane_store: LaneStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxAction {
    #[default]
    List,
    Snapshot,
    Restore,
    Clear,
}

impl SandboxAction {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "list" => Ok(Self::List),
            "snapshot" => Ok(Self::Snapshot),
            "restore" => Ok(Self::Restore),
            "clear" => Ok(Self::Clear),
            other => Err(LisaError::invalid(
                "invalid_action",
                format!("invalid action: {other} (expected list|snapshot|restore|clear)"),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Snapshot => "snapshot",
            Self::Restore => "restore",
            Self::Clear => "clear",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SandboxRequest {
    pub action: String,
    /// Empty means "not given": restore then falls back to the bundle's root.
    pub project_root: String,
    pub file: String,
    pub json_min: bool,
}

fn load_stores(engine: &Engine, root: &str) -> Result<(ObjectiveStore, LaneStore)> {
    let objectives = load_objective_store(engine, root)
        .map_err(|e| LisaError::coded("objective_store_read_failed", format!("failed reading objective store: {e}")))?;
    let lanes = load_lane_store(engine, root)
        .map_err(|e| LisaError::coded("lane_store_read_failed", format!("failed reading lane store: {e}")))?;
    Ok((objectives, lanes))
}

fn sandbox_file(raw: &str) -> Result<Option<PathBuf>> {
    resolve_file_flag("--file", raw)
}

pub fn state_sandbox_command(engine: &Engine, req: &SandboxRequest) -> CommandOutput {
    run(|| {
        let action = SandboxAction::parse(&req.action)?;
        match action {
            SandboxAction::List => list(engine, &engine.canonical_root(&req.project_root), req.json_min),
            SandboxAction::Clear => clear(engine, &engine.canonical_root(&req.project_root), req.json_min),
            SandboxAction::Snapshot => {
                let file = sandbox_file(&req.file)?;
                snapshot(engine, &engine.canonical_root(&req.project_root), file.as_deref(), req.json_min)
            }
            SandboxAction::Restore => {
                let file = sandbox_file(&req.file)?.ok_or_else(|| LisaError::MissingRequiredFlag {
                    flag: "--file".into(),
                })?;
                restore(engine, req.project_root.trim(), &file, req.json_min)
            }
        }
    })
}

fn list(engine: &Engine, root: &str, json_min: bool) -> Result<CommandOutput> {
    let (objectives, lanes) = load_stores(engine, root)?;
    let mut payload = obj(json!({
        "ok": true,
        "action": "list",
        "projectRoot": root,
        "objectiveCount": objectives.objectives.len(),
        "laneCount": lanes.lanes.len(),
        "currentId": objectives.current_id,
    }));
    if !json_min {
        payload.insert(
            "objectiveStorePath".into(),
            json!(engine.paths.objectives_file(root).to_string_lossy()),
        );
        payload.insert("laneStorePath".into(), json!(engine.paths.lanes_file(root).to_string_lossy()));
        payload.insert("objectives".into(), json!(objectives.objectives.values().collect::<Vec<_>>()));
        payload.insert("lanes".into(), json!(lanes.lanes.values().collect::<Vec<_>>()));
    }
    Ok(CommandOutput::ok(payload))
}

fn clear(engine: &Engine, root: &str, json_min: bool) -> Result<CommandOutput> {
    let objective_path = engine.paths.objectives_file(root);
    let lane_path = engine.paths.lanes_file(root);
    let cleared_objectives = write_locked(engine, &objective_path, || {
        remove_if_exists(&objective_path)
            .map_err(|e| LisaError::coded("objective_store_clear_failed", format!("failed clearing objective store: {e}")))
    })?;
    let cleared_lanes = write_locked(engine, &lane_path, || {
        remove_if_exists(&lane_path)
            .map_err(|e| LisaError::coded("lane_store_clear_failed", format!("failed clearing lane store: {e}")))
    })?;
    info!(root, cleared_objectives, cleared_lanes, "sandbox cleared");

    let mut payload = obj(json!({
        "ok": true,
        "action": "clear",
        "projectRoot": root,
        "clearedObjectives": cleared_objectives,
        "clearedLanes": cleared_lanes,
    }));
    if !json_min {
        payload.insert("objectiveStorePath".into(), json!(objective_path.to_string_lossy()));
        payload.insert("laneStorePath".into(), json!(lane_path.to_string_lossy()));
    }
    Ok(CommandOutput::ok(payload))
}

fn snapshot(engine: &Engine, root: &str, file: Option<&Path>, json_min: bool) -> Result<CommandOutput> {
    let (objective_store, lane_store) = load_stores(engine, root)?;
    let bundle = SandboxSnapshot {
        version: SANDBOX_VERSION.to_string(),
        project_root: root.to_string(),
        objective_store,
        lane_store,
    };
    if let Some(path) = file {
        save_json_pretty(path, &bundle)
            .map_err(|e| LisaError::coded("snapshot_write_failed", format!("failed writing snapshot: {e}")))?;
        info!(root, file = %path.display(), "sandbox snapshot written");
    }

    let mut payload = obj(json!({
        "ok": true,
        "action": "snapshot",
        "projectRoot": root,
        "objectiveCount": bundle.objective_store.objectives.len(),
        "laneCount": bundle.lane_store.lanes.len(),
    }));
    if let Some(path) = file {
        payload.insert("file".into(), json!(path.to_string_lossy()));
    }
    if !json_min || file.is_none() {
        payload.insert("snapshot".into(), json!(bundle));
    }
    Ok(CommandOutput::ok(payload))
}

/// Target root: explicit root, then the bundle's root, then the cwd.
fn restore(engine: &Engine, explicit_root: &str, file: &Path, json_min: bool) -> Result<CommandOutput> {
    let raw = read_optional(file)
        .map_err(|e| LisaError::coded("snapshot_read_failed", format!("failed reading snapshot: {e}")))?
        .ok_or_else(|| {
            LisaError::coded("snapshot_read_failed", format!("failed reading snapshot: {} does not exist", file.display()))
        })?;
    let bundle: SandboxSnapshot = serde_json::from_str(&raw)
        .map_err(|e| LisaError::coded("snapshot_parse_failed", format!("failed parsing snapshot: {e}")))?;
    if bundle.version.trim().is_empty() {
        return Err(LisaError::coded("snapshot_version_missing", "snapshot missing version"));
    }
    let root = [explicit_root, bundle.project_root.trim()]
        .into_iter()
        .find(|r| !r.is_empty())
        .map(|r| engine.canonical_root(r))
        .unwrap_or_else(|| engine.canonical_root(""));

    save_objective_store_exact(engine, &root, &bundle.objective_store)
        .map_err(|e| LisaError::coded("objective_store_write_failed", format!("failed restoring objective store: {e}")))?;
    save_lane_store_exact(engine, &root, &bundle.lane_store)
        .map_err(|e| LisaError::coded("lane_store_write_failed", format!("failed restoring lane store: {e}")))?;
    info!(root = %root, file = %file.display(), "sandbox restored");

    let mut payload = obj(json!({
        "ok": true,
        "action": "restore",
        "projectRoot": root,
        "file": file.to_string_lossy(),
        "objectiveCount": bundle.objective_store.objectives.len(),
        "laneCount": bundle.lane_store.lanes.len(),
    }));
    if !json_min {
        payload.insert("sourceProjectRoot".into(), json!(bundle.project_root));
    }
    Ok(CommandOutput::ok(payload))
}
