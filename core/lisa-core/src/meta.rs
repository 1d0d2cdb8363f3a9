//! Session metadata, classifier state files, and project-root resolution.
//!
//! A session's meta file is written at spawn time under its project hash.
//! Commands that receive only a session name find it again by scanning the
//! state directory for `*-session-<id>-meta.json`; when two projects own a
//! session with the same name the lookup fails as ambiguous instead of
//! guessing.

use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::paths::{canonical_project_root, project_hash, Paths};
use crate::storage::{read_optional, save_json_pretty};
use crate::types::{ClassifierState, SessionMeta};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

pub const AGENTS: [&str; 2] = ["claude", "codex"];
pub const MODES: [&str; 2] = ["interactive", "exec"];

// ═══════════════════════════════════════════════════════════════════════════════
// Meta Files
// ═══════════════════════════════════════════════════════════════════════════════

/// `Ok(None)` when the session has no meta file under `project_root`.
pub fn load_session_meta(
    engine: &Engine,
    project_root: &str,
    session: &str,
) -> Result<Option<SessionMeta>> {
    let path = engine.paths.meta_file(project_root, session);
    parse_meta_file(&path)
}

fn parse_meta_file(path: &Path) -> Result<Option<SessionMeta>> {
    let Some(raw) = read_optional(path)? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| LisaError::json(path.display().to_string(), e))
}

pub fn save_session_meta(
    engine: &Engine,
    project_root: &str,
    session: &str,
    meta: &SessionMeta,
) -> Result<()> {
    save_json_pretty(&engine.paths.meta_file(project_root, session), meta)
}

/// Finds a session's meta in any project under the state directory.
pub fn load_session_meta_by_glob(engine: &Engine, session: &str) -> Result<SessionMeta> {
    let suffix = Paths::meta_suffix(session);
    let entries = match std::fs::read_dir(engine.paths.base()) {
        Ok(entries) => entries,
        Err(_) => return Err(LisaError::SessionNotFound(session.to_string())),
    };

    let mut found: Vec<SessionMeta> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(".lisa-") || !name.ends_with(&suffix) {
            continue;
        }
        match parse_meta_file(&entry.path()) {
            Ok(Some(meta)) if meta.session.is_empty() || meta.session == session => found.push(meta),
            Ok(_) => {}
            Err(err) => warn!(file = %name, error = %err, "skipping unreadable session meta"),
        }
    }

    let roots: BTreeSet<String> = found
        .iter()
        .map(|meta| meta.project_root.trim().to_string())
        .filter(|root| !root.is_empty())
        .collect();
    if roots.len() > 1 {
        return Err(LisaError::AmbiguousProjectRoot {
            session: session.to_string(),
            candidates: roots.into_iter().collect(),
        });
    }
    found
        .into_iter()
        .next()
        .ok_or_else(|| LisaError::SessionNotFound(session.to_string()))
}

/// Every readable session meta recorded under `project_root`.
pub fn list_project_session_metas(engine: &Engine, project_root: &str) -> Vec<SessionMeta> {
    let prefix = format!(".lisa-{}-session-", project_hash(project_root));
    let Ok(entries) = std::fs::read_dir(engine.paths.base()) else {
        return Vec::new();
    };
    let mut metas = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(&prefix) || !name.ends_with("-meta.json") {
            continue;
        }
        match parse_meta_file(&entry.path()) {
            Ok(Some(meta)) if !meta.session.trim().is_empty() => metas.push(meta),
            Ok(_) => {}
            Err(err) => warn!(file = %name, error = %err, "skipping unreadable session meta"),
        }
    }
    metas.sort_by(|a, b| a.session.cmp(&b.session));
    metas
}

/// Project root a session command should operate on.
///
/// An explicit `--project-root` always wins. Otherwise a meta file under the
/// given root keeps it; failing that the global lookup supplies the session's
/// own root. Ambiguity is an error; a missing session falls back to `root`.
pub fn resolve_session_project_root(
    engine: &Engine,
    session: &str,
    project_root: &str,
    explicit: bool,
) -> Result<String> {
    let root = canonical_project_root(project_root);
    if explicit || session.trim().is_empty() {
        return Ok(root);
    }
    if engine.paths.meta_file(&root, session).exists() {
        return Ok(root);
    }
    match load_session_meta_by_glob(engine, session) {
        Ok(meta) if !meta.project_root.trim().is_empty() => {
            let resolved = canonical_project_root(&meta.project_root);
            debug!(session = %session, root = %resolved, "resolved project root from meta");
            Ok(resolved)
        }
        Ok(_) | Err(LisaError::SessionNotFound(_)) => Ok(root),
        Err(err) => Err(err),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Classifier State
// ═══════════════════════════════════════════════════════════════════════════════

/// Loads the classifier state. A corrupt file yields defaults plus the error
/// text so the caller can surface it as a signal.
pub fn load_classifier_state(path: &Path) -> (ClassifierState, Option<String>) {
    match read_optional(path) {
        Ok(None) => (ClassifierState::default(), None),
        Ok(Some(raw)) if raw.trim().is_empty() => (ClassifierState::default(), None),
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(state) => (state, None),
            Err(err) => (ClassifierState::default(), Some(err.to_string())),
        },
        Err(err) => (ClassifierState::default(), Some(err.to_string())),
    }
}

pub fn save_classifier_state(path: &Path, state: &ClassifierState) -> Result<()> {
    save_json_pretty(path, state)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Agent & Mode Resolution
// ═══════════════════════════════════════════════════════════════════════════════

/// Validates an optional `--agent` hint.
pub fn parse_agent_hint(raw: &str) -> Result<String> {
    let value = raw.trim().to_ascii_lowercase();
    if value.is_empty() || value == "auto" || AGENTS.contains(&value.as_str()) {
        return Ok(value);
    }
    Err(LisaError::invalid(
        "invalid_agent_hint",
        format!("invalid --agent: {raw} (expected auto|claude|codex)"),
    ))
}

pub fn parse_mode_hint(raw: &str) -> Result<String> {
    let value = raw.trim().to_ascii_lowercase();
    if value.is_empty() || value == "auto" || MODES.contains(&value.as_str()) {
        return Ok(value);
    }
    Err(LisaError::invalid(
        "invalid_mode_hint",
        format!("invalid --mode: {raw} (expected auto|interactive|exec)"),
    ))
}

/// Strict `--agent` for commands that build agent command lines.
pub fn parse_agent(raw: &str) -> Result<String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "claude" => Ok("claude".into()),
        "codex" => Ok("codex".into()),
        _ => Err(LisaError::invalid(
            "invalid_agent",
            format!("invalid --agent: {raw} (expected claude|codex)"),
        )),
    }
}

pub fn parse_mode(raw: &str) -> Result<String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "interactive" => Ok("interactive".into()),
        "exec" | "execution" | "non-interactive" => Ok("exec".into()),
        _ => Err(LisaError::invalid(
            "invalid_mode",
            format!("invalid --mode: {raw} (expected interactive|exec)"),
        )),
    }
}

fn pick<'a>(allowed: &[&'a str], raw: &str) -> Option<&'a str> {
    let value = raw.trim().to_ascii_lowercase();
    allowed.iter().copied().find(|v| *v == value)
}

fn name_has_token(name: &str, token: &str) -> bool {
    name.contains(&format!("-{token}-")) || name.ends_with(&format!("-{token}"))
}

/// Hint, then meta, then the cached value, then the session name, then the
/// pane environment. Defaults to `claude`.
pub fn resolve_agent(
    engine: &Engine,
    hint: &str,
    meta: &SessionMeta,
    session: &str,
    cached: &str,
) -> String {
    if let Some(agent) = [hint, meta.agent.as_str(), cached]
        .iter()
        .find_map(|raw| pick(&AGENTS, raw))
    {
        return agent.to_string();
    }
    let name = session.trim().to_ascii_lowercase();
    for agent in AGENTS.iter().rev() {
        if name_has_token(&name, agent) {
            return agent.to_string();
        }
    }
    for key in ["LISA_AGENT", "AI_AGENT"] {
        if let Ok(Some(value)) = engine.tmux.show_environment(session, key) {
            if let Some(agent) = pick(&AGENTS, &value) {
                return agent.to_string();
            }
        }
    }
    "claude".to_string()
}

/// Same precedence as [`resolve_agent`]; defaults to `interactive`.
pub fn resolve_mode(
    engine: &Engine,
    hint: &str,
    meta: &SessionMeta,
    session: &str,
    cached: &str,
) -> String {
    if let Some(mode) = [hint, meta.mode.as_str(), cached]
        .iter()
        .find_map(|raw| pick(&MODES, raw))
    {
        return mode.to_string();
    }
    let name = session.trim().to_ascii_lowercase();
    if name_has_token(&name, "exec") {
        return "exec".to_string();
    }
    if name_has_token(&name, "interactive") {
        return "interactive".to_string();
    }
    if let Ok(Some(value)) = engine.tmux.show_environment(session, "LISA_MODE") {
        if let Some(mode) = pick(&MODES, &value) {
            return mode.to_string();
        }
    }
    "interactive".to_string()
}
