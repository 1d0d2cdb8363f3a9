//! Skill directory mirroring: `skills sync`, `skills install`,
//! `skills doctor`.
//!
//! The repository carries the canonical skill under `skills/lisa`. Agents
//! read installed copies from `~/.codex/skills/lisa` and
//! `~/.claude/skills/lisa`. Sync pulls an installed copy back into the
//! repo; install pushes the repo copy out; doctor compares versions,
//! command coverage and (with `--deep`) content hashes.

use crate::capture::shell_quote;
use crate::command::{obj, run};
use crate::contract::{read_skill_doc, run_contract_checks, COMMAND_CONTRACTS};
use crate::error::{LisaError, Result};
use crate::paths::{canonical_project_root, expand_user_path};
use fs_err as fs;
use lisa_protocol::CommandOutput;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

pub const SKILL_NAME: &str = "lisa";
const SKILL_FILE: &str = "SKILL.md";
const COMMANDS_DOC: &str = "data/commands.md";

pub fn repo_skill_dir(repo_root: &Path) -> PathBuf {
    repo_root.join("skills").join(SKILL_NAME)
}

pub fn repo_skill_doc(repo_root: &Path) -> PathBuf {
    repo_skill_dir(repo_root).join(COMMANDS_DOC)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Install Targets
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillTarget {
    Codex,
    Claude,
}

impl SkillTarget {
    pub const ALL: [SkillTarget; 2] = [SkillTarget::Codex, SkillTarget::Claude];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "codex" => Some(Self::Codex),
            "claude" => Some(Self::Claude),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Claude => "claude",
        }
    }

    fn agent_dir(self) -> &'static str {
        match self {
            Self::Codex => ".codex",
            Self::Claude => ".claude",
        }
    }

    pub fn install_path(self, home: &Path) -> PathBuf {
        home.join(self.agent_dir()).join("skills").join(SKILL_NAME)
    }
}

fn resolve_home(home: &Option<PathBuf>) -> Result<PathBuf> {
    home.clone()
        .or_else(dirs::home_dir)
        .ok_or_else(|| LisaError::coded("home_dir_unavailable", "could not determine home directory"))
}

fn resolve_path_flag(flag: &str, raw: &str) -> Result<PathBuf> {
    expand_user_path(raw).ok_or_else(|| LisaError::invalid("invalid_file_path", format!("invalid {flag}: {raw}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Directory Helpers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CopySummary {
    pub source: String,
    pub destination: String,
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub noop: bool,
}

/// Replaces `destination` with a copy of `source`.
///
/// The copy is staged next to the destination and swapped in with two
/// renames; the previous tree is restored if the second rename fails.
pub fn copy_dir_replace(source: &Path, destination: &Path) -> Result<CopySummary> {
    let mut summary = CopySummary {
        source: source.to_string_lossy().into_owned(),
        destination: destination.to_string_lossy().into_owned(),
        ..CopySummary::default()
    };
    if source == destination {
        summary.noop = true;
        return Ok(summary);
    }
    if !source.is_dir() {
        return Err(LisaError::coded(
            "skills_source_missing",
            format!("source is not a directory: {}", source.display()),
        ));
    }
    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| LisaError::io(format!("create {}", parent.display()), e))?;

    let stage_root = tempfile::Builder::new()
        .prefix(".lisa-skill-stage-")
        .tempdir_in(parent)
        .map_err(|e| LisaError::io(format!("stage in {}", parent.display()), e))?;
    let stage = stage_root.path().join("next");
    copy_tree(source, &stage, &mut summary)?;

    if fs::symlink_metadata(destination).is_err() {
        fs::rename(&stage, destination).map_err(|e| LisaError::io("install staged skill", e))?;
        return Ok(summary);
    }
    let backup = stage_root.path().join("previous");
    fs::rename(destination, &backup).map_err(|e| LisaError::io("move previous skill aside", e))?;
    if let Err(err) = fs::rename(&stage, destination) {
        if let Err(rollback) = fs::rename(&backup, destination) {
            warn!(error = %rollback, "skill rollback failed");
        }
        return Err(LisaError::io("replace skill directory", err));
    }
    Ok(summary)
}

fn copy_tree(source: &Path, dest: &Path, summary: &mut CopySummary) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| LisaError::io(format!("create {}", dest.display()), e))?;
    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| LisaError::coded("skills_walk_failed", e.to_string()))?;
        let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|e| LisaError::io("read symlink", e))?;
            make_symlink(&link, &target)?;
            summary.symlinks += 1;
        } else if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| LisaError::io(format!("create {}", target.display()), e))?;
            summary.directories += 1;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| LisaError::io(format!("copy {}", rel.display()), e))?;
            summary.files += 1;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target).map_err(|e| LisaError::io(format!("symlink {}", target.display()), e))
}

#[cfg(not(unix))]
fn make_symlink(link: &Path, target: &Path) -> Result<()> {
    let resolved = target.parent().map(|p| p.join(link)).unwrap_or_else(|| link.to_path_buf());
    fs::copy(&resolved, target)
        .map(|_| ())
        .map_err(|e| LisaError::io(format!("copy {}", target.display()), e))
}

/// SHA-256 over relative paths and file bytes, walked in name order; first
/// 16 hex characters.
pub fn hash_directory_contents(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| LisaError::coded("skills_walk_failed", e.to_string()))?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let rel = rel.to_string_lossy().replace('\\', "/");
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|e| LisaError::io("read symlink", e))?;
            hasher.update(format!("L|{rel}|{}\n", link.to_string_lossy()));
        } else if file_type.is_dir() {
            hasher.update(format!("D|{rel}\n"));
        } else {
            hasher.update(format!("F|{rel}\n"));
            let bytes = fs::read(entry.path()).map_err(|e| LisaError::io(format!("read {rel}"), e))?;
            hasher.update(&bytes);
            hasher.update(b"\n");
        }
    }
    let digest = hex::encode(hasher.finalize());
    Ok(digest[..16].to_string())
}

/// Value of the first `version:` line in `SKILL.md`.
pub fn read_skill_version(skill_dir: &Path) -> Result<String> {
    let path = skill_dir.join(SKILL_FILE);
    let raw = fs::read_to_string(&path).map_err(|e| LisaError::io(format!("read {}", path.display()), e))?;
    raw.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("version:"))
        .map(|v| v.trim().trim_matches('"').to_string())
        .ok_or_else(|| LisaError::coded("skill_version_missing", format!("version field not found in {}", path.display())))
}

/// Advertised commands the skill doc never mentions.
pub fn missing_skill_commands(doc: &str) -> Vec<String> {
    COMMAND_CONTRACTS
        .iter()
        .filter(|c| !doc.contains(c.name))
        .map(|c| c.name.to_string())
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sync & Install
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct SkillsSyncRequest {
    /// `codex`, `claude`, or a directory path.
    pub from: String,
    pub repo_root: String,
    pub home: Option<PathBuf>,
}

/// Copies an installed skill back into `<repo>/skills/lisa`.
pub fn skills_sync_command(req: &SkillsSyncRequest) -> CommandOutput {
    run(|| {
        let from = if req.from.trim().is_empty() { "codex" } else { req.from.trim() };
        let source = match SkillTarget::parse(from) {
            Some(target) => target.install_path(&resolve_home(&req.home)?),
            None => resolve_path_flag("--from", from)?,
        };
        let repo_root = canonical_project_root(&req.repo_root);
        let destination = repo_skill_dir(Path::new(&repo_root));
        let summary = copy_dir_replace(&source, &destination)
            .map_err(|e| LisaError::coded("skills_sync_failed", format!("skills sync failed: {e}")))?;
        info!(source = %summary.source, files = summary.files, "skills synced");
        let mut payload = obj(json!(summary));
        payload.insert("ok".into(), json!(true));
        Ok(CommandOutput::ok(payload))
    })
}

#[derive(Debug, Clone, Default)]
pub struct SkillsInstallRequest {
    /// `codex`, `claude`, `all`, or a directory path. Empty means every
    /// agent whose home directory exists.
    pub to: String,
    pub repo_root: String,
    pub home: Option<PathBuf>,
}

fn install_destinations(req: &SkillsInstallRequest) -> Result<Vec<PathBuf>> {
    let to = req.to.trim();
    if let Some(target) = SkillTarget::parse(to) {
        return Ok(vec![target.install_path(&resolve_home(&req.home)?)]);
    }
    if !to.is_empty() && !to.eq_ignore_ascii_case("all") {
        return Ok(vec![resolve_path_flag("--to", to)?]);
    }
    let home = resolve_home(&req.home)?;
    let found: Vec<PathBuf> = SkillTarget::ALL
        .iter()
        .filter(|t| to.eq_ignore_ascii_case("all") || home.join(t.agent_dir()).is_dir())
        .map(|t| t.install_path(&home))
        .collect();
    if found.is_empty() {
        return Err(LisaError::coded(
            "skills_destination_resolve_failed",
            "no default install targets found (expected ~/.codex and/or ~/.claude); pass --to",
        ));
    }
    Ok(found)
}

/// Copies `<repo>/skills/lisa` into each install destination.
pub fn skills_install_command(req: &SkillsInstallRequest) -> CommandOutput {
    run(|| {
        let repo_root = canonical_project_root(&req.repo_root);
        let source = repo_skill_dir(Path::new(&repo_root));
        let destinations = install_destinations(req)?;
        let mut installs = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let summary = copy_dir_replace(&source, &destination)
                .map_err(|e| LisaError::coded("skills_install_failed", format!("skills install failed: {e}")))?;
            info!(destination = %summary.destination, files = summary.files, "skill installed");
            installs.push(summary);
        }
        Ok(CommandOutput::ok(obj(json!({
            "ok": true,
            "source": source.to_string_lossy(),
            "installs": installs,
        }))))
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Doctor
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Missing,
    Outdated,
    UpToDate,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorTarget {
    pub target: String,
    pub path: String,
    pub exists: bool,
    pub status: TargetStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_hash: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_commands: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remediation: Vec<String>,
}

struct RepoSkill {
    version: String,
    hash: String,
}

fn inspect_target(name: &str, path: &Path, repo: &RepoSkill, deep: bool) -> DoctorTarget {
    let mut out = DoctorTarget {
        target: name.to_string(),
        path: path.to_string_lossy().into_owned(),
        exists: path.is_dir(),
        status: TargetStatus::Missing,
        version: String::new(),
        content_hash: String::new(),
        missing_commands: Vec::new(),
        detail: String::new(),
        remediation: Vec::new(),
    };
    if !out.exists {
        out.detail = "skill directory not found".into();
        return out;
    }
    match read_skill_version(path) {
        Ok(version) => out.version = version,
        Err(err) => {
            out.status = TargetStatus::Error;
            out.detail = err.to_string();
            return out;
        }
    }
    out.missing_commands = read_skill_doc(&path.join(COMMANDS_DOC))
        .map(|doc| missing_skill_commands(&doc))
        .unwrap_or_else(|_| vec![COMMANDS_DOC.to_string()]);

    let mut drift: Vec<String> = Vec::new();
    if out.version != repo.version {
        drift.push(format!("version drift: repo={} installed={}", repo.version, out.version));
    }
    if !out.missing_commands.is_empty() {
        drift.push("command contract drift".into());
    }
    if deep {
        match hash_directory_contents(path) {
            Ok(hash) => out.content_hash = hash,
            Err(err) => {
                out.status = TargetStatus::Error;
                out.detail = format!("content hash failed: {err}");
                return out;
            }
        }
        if drift.is_empty() && out.content_hash != repo.hash {
            drift.push("content drift".into());
        }
    }
    out.status = if drift.is_empty() { TargetStatus::UpToDate } else { TargetStatus::Outdated };
    out.detail = drift.join("; ");
    out
}

fn remediation(target: &DoctorTarget, repo_root: &str) -> Vec<String> {
    let root = shell_quote(repo_root);
    let install = format!("lisa skills install --to {} --repo-root {root} --json", target.target);
    match target.status {
        TargetStatus::UpToDate => Vec::new(),
        TargetStatus::Missing => vec![
            install,
            format!("rerun doctor after install: lisa skills doctor --repo-root {root} --json"),
        ],
        TargetStatus::Outdated => {
            let mut hints = vec![install];
            if !target.missing_commands.is_empty() {
                hints.push("command drift detected; verify commands.md contract after install".into());
            }
            hints.push(format!(
                "if local customizations are required, sync first: lisa skills sync --from {} --repo-root {root} --json",
                target.target
            ));
            hints
        }
        TargetStatus::Error => vec![format!("inspect target path and permissions: {}", target.path), install],
    }
}

#[derive(Debug, Clone, Default)]
pub struct SkillsDoctorRequest {
    pub repo_root: String,
    /// Extra installed copy to inspect besides the agent defaults.
    pub path: String,
    pub deep: bool,
    pub explain_drift: bool,
    pub contract_check: bool,
    pub home: Option<PathBuf>,
}

/// Exit 1 with `skills_doctor_drift_detected` when any target is outdated
/// or unreadable, or the contract check fails. Missing targets are
/// reported but do not fail.
pub fn skills_doctor_command(req: &SkillsDoctorRequest) -> CommandOutput {
    run(|| {
        let repo_root = canonical_project_root(&req.repo_root);
        let repo_dir = repo_skill_dir(Path::new(&repo_root));
        let version = read_skill_version(&repo_dir).map_err(|e| {
            LisaError::coded("skills_doctor_repo_read_failed", format!("failed reading repo skill: {e}"))
        })?;
        let hash = hash_directory_contents(&repo_dir).map_err(|e| {
            LisaError::coded("skills_doctor_repo_hash_failed", format!("failed hashing repo skill: {e}"))
        })?;
        let repo = RepoSkill { version, hash };

        let mut inspected: Vec<(String, PathBuf)> = Vec::new();
        match resolve_home(&req.home) {
            Ok(home) => inspected.extend(
                SkillTarget::ALL
                    .iter()
                    .map(|t| (t.as_str().to_string(), t.install_path(&home))),
            ),
            Err(err) => warn!(error = %err, "skipping default skill targets"),
        }
        if !req.path.trim().is_empty() {
            inspected.push(("path".into(), resolve_path_flag("--path", &req.path)?));
        }

        let mut targets: Vec<DoctorTarget> = inspected
            .iter()
            .map(|(name, path)| inspect_target(name, path, &repo, req.deep))
            .collect();
        if req.explain_drift {
            for target in &mut targets {
                target.remediation = remediation(target, &repo_root);
            }
        }
        let mut ok = targets
            .iter()
            .all(|t| matches!(t.status, TargetStatus::UpToDate | TargetStatus::Missing));

        let mut payload = obj(json!({
            "repoRoot": repo_root,
            "repoSkillPath": repo_dir.to_string_lossy(),
            "repoVersion": repo.version,
            "targets": targets,
        }));
        if req.deep {
            payload.insert("repoContentHash".into(), json!(repo.hash));
        }
        if req.contract_check {
            let doc_path = repo_dir.join(COMMANDS_DOC);
            let (doc, missing_detail) = match read_skill_doc(&doc_path) {
                Ok(text) => (Some(text), String::new()),
                Err(err) => (None, format!("skill doc unreadable: {err}")),
            };
            let checks = run_contract_checks(doc.as_deref(), &missing_detail);
            let failed: Vec<_> = checks.iter().filter(|c| !c.ok).collect();
            ok &= failed.is_empty();
            payload.insert(
                "contractCheck".into(),
                json!({"checked": checks.len(), "failed": failed.len(), "failures": failed}),
            );
        }
        payload.insert("ok".into(), json!(ok));
        if !ok {
            payload.insert("errorCode".into(), json!("skills_doctor_drift_detected"));
            return Ok(CommandOutput::with_exit(payload, 1));
        }
        Ok(CommandOutput::ok(payload))
    })
}
