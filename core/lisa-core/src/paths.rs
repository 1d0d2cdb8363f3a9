//! Path management for per-project lisa artifacts.
//!
//! All per-project state lives in flat files named
//! `<base>/.lisa-<projectHash>-*`, where `<base>` defaults to `/tmp`.
//! Every builder here is a pure function of `(root, session)`: no I/O.
//!
//! ## Runtime scope
//!
//! Multiplexer calls read `LISA_PROJECT_ROOT` / `LISA_TMUX_SOCKET` from the
//! process environment. [`RuntimeEnvScope`] is the only code that mutates
//! them; dropping the scope restores the previous values in LIFO order, so
//! early returns and `?` unwind it too.

use std::env;
use std::path::{Component, Path, PathBuf};

pub const PROJECT_ROOT_ENV: &str = "LISA_PROJECT_ROOT";
pub const TMUX_SOCKET_ENV: &str = "LISA_TMUX_SOCKET";
pub const TMUX_SOCKET_DIR_ENV: &str = "LISA_TMUX_SOCKET_DIR";
pub const STATE_DIR_ENV: &str = "LISA_STATE_DIR";

/// Root for every `.lisa-*` artifact.
///
/// Production code uses `Paths::from_env()` (`/tmp` unless `LISA_STATE_DIR`
/// is set). Tests use `Paths::with_base(temp_dir)` for isolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    base: PathBuf,
    socket_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            base: PathBuf::from("/tmp"),
            socket_dir: PathBuf::from("/tmp"),
        }
    }
}

impl Paths {
    pub fn from_env() -> Self {
        let mut paths = Self::default();
        if let Some(dir) = non_empty_env(STATE_DIR_ENV) {
            paths.base = clean_path(Path::new(&dir));
        }
        if let Some(dir) = non_empty_env(TMUX_SOCKET_DIR_ENV) {
            paths.socket_dir = clean_path(Path::new(&dir));
        }
        paths
    }

    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            socket_dir: base.clone(),
            base,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn project_file(&self, root: &str, suffix: &str) -> PathBuf {
        self.base
            .join(format!(".lisa-{}-{}", project_hash(root), suffix))
    }

    fn session_file(&self, root: &str, session: &str, suffix: &str) -> PathBuf {
        self.base.join(format!(
            ".lisa-{}-session-{}-{}",
            project_hash(root),
            session_artifact_id(session),
            suffix
        ))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Project Registries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn objectives_file(&self, root: &str) -> PathBuf {
        self.project_file(root, "objectives.json")
    }

    pub fn lanes_file(&self, root: &str) -> PathBuf {
        self.project_file(root, "lanes.json")
    }

    pub fn dedupe_file(&self, root: &str) -> PathBuf {
        self.project_file(root, "dedupe.json")
    }

    pub fn context_cache_file(&self, root: &str) -> PathBuf {
        self.project_file(root, "context-cache.json")
    }

    pub fn aggregate_delta_file(&self, root: &str) -> PathBuf {
        self.project_file(root, "session-aggregate-delta.json")
    }

    pub fn list_delta_file(&self, root: &str) -> PathBuf {
        self.project_file(root, "list-delta.json")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Session Artifacts
    // ─────────────────────────────────────────────────────────────────────────

    pub fn meta_file(&self, root: &str, session: &str) -> PathBuf {
        self.session_file(root, session, "meta.json")
    }

    pub fn state_file(&self, root: &str, session: &str) -> PathBuf {
        self.session_file(root, session, "state.json")
    }

    pub fn events_file(&self, root: &str, session: &str) -> PathBuf {
        self.session_file(root, session, "events.jsonl")
    }

    pub fn heartbeat_file(&self, root: &str, session: &str) -> PathBuf {
        self.session_file(root, session, "heartbeat.txt")
    }

    pub fn done_file(&self, root: &str, session: &str) -> PathBuf {
        self.session_file(root, session, "done.txt")
    }

    pub fn output_file(&self, root: &str, session: &str) -> PathBuf {
        self.session_file(root, session, "output.txt")
    }

    pub fn memory_file(&self, root: &str, session: &str) -> PathBuf {
        self.session_file(root, session, "memory.json")
    }

    /// `cursor-<purpose>.cursor`, scoped by session and purpose.
    pub fn cursor_file(&self, root: &str, session: &str, purpose: &str) -> PathBuf {
        self.session_file(root, session, &format!("cursor-{purpose}.cursor"))
    }

    pub fn diff_pack_cursor_file(&self, root: &str, session: &str) -> PathBuf {
        self.session_file(root, session, "diff-pack.txt")
    }

    pub fn loop_pack_cursor_file(&self, root: &str, session: &str) -> PathBuf {
        self.session_file(root, session, "loop-pack.cursor")
    }

    pub fn loop_handoff_cursor_file(&self, root: &str, session: &str) -> PathBuf {
        self.session_file(root, session, "loop-handoff.cursor")
    }

    /// Glob-free suffix used to discover a session's metadata across projects.
    pub fn meta_suffix(session: &str) -> String {
        format!("-session-{}-meta.json", session_artifact_id(session))
    }

    pub fn tmux_socket_path(&self, root: &str) -> PathBuf {
        let root = canonical_project_root(root);
        self.socket_dir.join(format!(
            "lisa-tmux-{}-{}.sock",
            project_slug(&root),
            project_hash(&root)
        ))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Hashing & Naming
// ═══════════════════════════════════════════════════════════════════════════════

/// First 8 hex chars of the MD5 of the input.
pub fn md5_hex8(input: &str) -> String {
    let digest = md5::compute(input.as_bytes());
    format!("{digest:x}")[..8].to_string()
}

/// Stable hash of a canonical project root.
pub fn project_hash(root: &str) -> String {
    md5_hex8(root)
}

/// Filesystem-safe session identifier: sanitized name plus a name hash.
///
/// The hash keeps two names that sanitize identically from colliding.
pub fn session_artifact_id(session: &str) -> String {
    let mut slug: String = session
        .trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    slug.truncate(48);
    if slug.is_empty() {
        slug.push_str("session");
    }
    format!("{}-{}", slug, md5_hex8(session.trim()))
}

pub fn sanitize_id(input: &str, max: usize) -> String {
    let mut out: String = input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect();
    if out.is_empty() {
        out.push_str("project");
    }
    out.truncate(max);
    out
}

pub fn project_slug(root: &str) -> String {
    let base = Path::new(root)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    sanitize_id(&base, 10)
}

/// Absolute, symlink-resolved project root; falls back to a lexically
/// cleaned absolute path when the directory does not exist.
pub fn canonical_project_root(root: &str) -> String {
    let trimmed = root.trim();
    let raw = if trimmed.is_empty() {
        current_dir_string()
    } else {
        trimmed.to_string()
    };
    let path = Path::new(&raw);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new(&current_dir_string()).join(path)
    };
    match std::fs::canonicalize(&absolute) {
        Ok(resolved) => resolved.to_string_lossy().to_string(),
        Err(_) => clean_path(&absolute).to_string_lossy().to_string(),
    }
}

pub fn current_dir_string() -> String {
    env::current_dir()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| ".".to_string())
}

/// Lexical cleanup: drops `.` segments and resolves `..` without touching disk.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Expands a leading `~/` and cleans the result.
pub fn expand_user_path(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(rest) = trimmed.strip_prefix("~/") {
        let home = dirs::home_dir()?;
        return Some(clean_path(&home.join(rest)));
    }
    let path = Path::new(trimmed);
    if path.is_absolute() {
        Some(clean_path(path))
    } else {
        Some(clean_path(&Path::new(&current_dir_string()).join(path)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Runtime Environment Scope
// ═══════════════════════════════════════════════════════════════════════════════

/// Scoped `(LISA_PROJECT_ROOT, LISA_TMUX_SOCKET)` override.
///
/// Restores previous values in reverse order on [`RuntimeEnvScope::restore`]
/// or on drop, whichever happens first.
#[derive(Debug)]
pub struct RuntimeEnvScope {
    saved: Vec<(&'static str, Option<String>)>,
}

impl RuntimeEnvScope {
    pub fn enter(paths: &Paths, root: &str) -> Self {
        let root = canonical_project_root(root);
        let socket = paths.tmux_socket_path(&root);
        let mut scope = Self { saved: Vec::new() };
        scope.set(PROJECT_ROOT_ENV, &root);
        scope.set(TMUX_SOCKET_ENV, &socket.to_string_lossy());
        scope
    }

    fn set(&mut self, key: &'static str, value: &str) {
        self.saved.push((key, env::var(key).ok()));
        env::set_var(key, value);
    }

    pub fn restore(mut self) {
        self.unwind();
    }

    fn unwind(&mut self) {
        while let Some((key, previous)) = self.saved.pop() {
            match previous {
                Some(value) => env::set_var(key, value),
                None => env::remove_var(key),
            }
        }
    }
}

impl Drop for RuntimeEnvScope {
    fn drop(&mut self) {
        self.unwind();
    }
}
