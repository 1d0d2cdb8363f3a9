//! Task-hash claims (`session dedupe`).
//!
//! A claim maps a task hash to the session working on it. Claims are only
//! honored while that session is still alive in its project's tmux server;
//! every invocation prunes dead claims before evaluating the request, all
//! under one exclusive lock.

use super::write_locked;
use crate::clock::format_utc_seconds;
use crate::command::{obj, run, Target};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::paths::canonical_project_root;
use crate::storage::{load_json_strict, save_json_pretty};
use lisa_protocol::{CommandOutput, Payload};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DedupeRecord {
    pub session: String,
    pub project_root: String,
    pub claimed_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DedupeRegistry {
    pub items: BTreeMap<String, DedupeRecord>,
    pub updated_at: String,
}

fn session_alive(engine: &Engine, record: &DedupeRecord) -> bool {
    let _scope = engine.runtime_scope(&canonical_project_root(&record.project_root));
    engine.tmux.has_session(&record.session)
}

impl DedupeRegistry {
    /// Drops claims whose session is gone; returns how many were removed.
    fn prune_dead(&mut self, engine: &Engine) -> usize {
        let before = self.items.len();
        self.items.retain(|hash, record| {
            let alive = session_alive(engine, record);
            if !alive {
                debug!(task_hash = %hash, session = %record.session, "pruning dead dedupe claim");
            }
            alive
        });
        before - self.items.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DedupeRequest {
    pub target: Target,
    pub task_hash: String,
    pub release: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupeOutcome {
    Released,
    Claimed { session: String, root: String },
    /// Another live session holds the claim.
    Duplicate(DedupeRecord),
    Unclaimed,
}

/// Release, claim, or check `task_hash` as one read-modify-write.
pub fn evaluate_claim(engine: &Engine, root: &str, req: &DedupeRequest) -> Result<DedupeOutcome> {
    let path = engine.paths.dedupe_file(root);
    let task_hash = req.task_hash.trim();
    let session = req.target.session.trim();
    write_locked(engine, &path, || {
        let mut registry: DedupeRegistry = load_json_strict(&path).map_err(|e| {
            LisaError::coded("dedupe_registry_read_failed", format!("failed reading dedupe registry: {e}"))
        })?;
        let mut changed = registry.prune_dead(engine) > 0;

        let outcome = if req.release {
            changed |= registry.items.remove(task_hash).is_some();
            DedupeOutcome::Released
        } else if !session.is_empty() {
            match registry.items.get(task_hash) {
                Some(existing) if existing.session != session => DedupeOutcome::Duplicate(existing.clone()),
                _ => {
                    registry.items.insert(
                        task_hash.to_string(),
                        DedupeRecord {
                            session: session.to_string(),
                            project_root: root.to_string(),
                            claimed_at: format_utc_seconds(engine.now()),
                        },
                    );
                    changed = true;
                    DedupeOutcome::Claimed {
                        session: session.to_string(),
                        root: root.to_string(),
                    }
                }
            }
        } else {
            match registry.items.get(task_hash) {
                Some(existing) => DedupeOutcome::Duplicate(existing.clone()),
                None => DedupeOutcome::Unclaimed,
            }
        };

        if changed {
            registry.updated_at = format_utc_seconds(engine.now());
            save_json_pretty(&path, &registry).map_err(|e| {
                LisaError::coded("dedupe_registry_write_failed", format!("failed writing dedupe registry: {e}"))
            })?;
        }
        Ok(outcome)
    })
}

pub fn dedupe_command(engine: &Engine, req: &DedupeRequest) -> CommandOutput {
    run(|| {
        let task_hash = req.task_hash.trim();
        if task_hash.is_empty() {
            return Err(LisaError::invalid("missing_required_flag", "--task-hash is required"));
        }
        let root = engine.canonical_root(&req.target.project_root);
        let outcome = evaluate_claim(engine, &root, req)?;

        let mut payload: Payload = obj(json!({ "taskHash": task_hash, "duplicate": false }));
        let exit_code = match &outcome {
            DedupeOutcome::Released => {
                payload.insert("released".into(), json!(true));
                0
            }
            DedupeOutcome::Claimed { session, root } => {
                info!(task_hash = %task_hash, session = %session, "task claimed");
                payload.insert("claimed".into(), json!(true));
                payload.insert("existingSession".into(), json!(session));
                payload.insert("existingRoot".into(), json!(root));
                0
            }
            DedupeOutcome::Duplicate(existing) => {
                payload.insert("duplicate".into(), json!(true));
                payload.insert("existingSession".into(), json!(existing.session));
                payload.insert("existingRoot".into(), json!(existing.project_root));
                payload.insert("errorCode".into(), json!("task_duplicate_detected"));
                1
            }
            DedupeOutcome::Unclaimed => 0,
        };
        payload.insert("projectRoot".into(), json!(root));
        Ok(CommandOutput::with_exit(payload, exit_code))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lisa_protocol::str_field;
    use tempfile::TempDir;

    fn request(session: &str, hash: &str) -> DedupeRequest {
        DedupeRequest {
            target: Target::new(session, "/repo"),
            task_hash: hash.to_string(),
            release: false,
        }
    }

    #[test]
    fn test_claim_then_duplicate_then_release() {
        let tmp = TempDir::new().unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        tmux.add_session("s1", "");
        tmux.add_session("s2", "");

        let out = dedupe_command(&engine, &request("s1", "abc"));
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.payload["claimed"], true);

        let out = dedupe_command(&engine, &request("s2", "abc"));
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("task_duplicate_detected"));
        assert_eq!(str_field(&out.payload, "existingSession"), "s1");

        let out = dedupe_command(&engine, &request("", "abc"));
        assert_eq!(out.payload["duplicate"], true);

        let out = dedupe_command(&engine, &DedupeRequest { release: true, ..request("", "abc") });
        assert_eq!(out.payload["released"], true);
        let out = dedupe_command(&engine, &request("", "abc"));
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.payload["duplicate"], false);
    }

    #[test]
    fn test_dead_claims_are_pruned_before_evaluation() {
        let tmp = TempDir::new().unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        tmux.add_session("s1", "");
        tmux.add_session("s2", "");
        dedupe_command(&engine, &request("s1", "abc"));
        tmux.remove_session("s1");

        let out = dedupe_command(&engine, &request("s2", "abc"));
        assert_eq!(out.exit_code, 0);
        assert_eq!(str_field(&out.payload, "existingSession"), "s2");
    }

    #[test]
    fn test_task_hash_required() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let out = dedupe_command(&engine, &request("s1", "  "));
        assert_eq!(out.error_code(), Some("missing_required_flag"));
    }
}
