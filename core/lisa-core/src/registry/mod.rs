//! Project-scoped registries persisted under `/tmp/.lisa-<hash>-*`.
//!
//! Each store is a pretty-printed JSON file guarded by a sibling `.lock`:
//! reads take a shared lock, mutations an exclusive one. Writes go through
//! [`crate::storage::write_file_atomic`], so readers never observe a partial
//! file. Expired records are pruned whenever a store is loaded.
//!
//! # Module Structure
//!
//! - [`objective`]: current objective plus the objective catalog
//! - [`lane`]: named spawn/route presets
//! - [`memory`]: per-session semantic memory with TTL
//! - [`context_cache`]: keyed line caches shared across sessions
//! - [`dedupe`]: task-hash claims tied to live sessions

pub mod context_cache;
pub mod dedupe;
pub mod lane;
pub mod memory;
pub mod objective;

pub use context_cache::{context_cache_command, ContextCacheRecord, ContextCacheRequest};
pub use dedupe::{dedupe_command, DedupeRecord, DedupeRegistry, DedupeRequest};
pub use lane::{lane_command, load_lane_record, load_lane_store, LaneRecord, LaneRequest, LaneStore};
pub use memory::{
    build_session_memory, load_session_memory, load_session_memory_compact, memory_command,
    MemoryRecord, MemoryRequest,
};
pub use objective::{
    current_objective, load_objective_store, objective_command, objective_payload_from_meta,
    ObjectiveRecord, ObjectiveRequest, ObjectiveStore,
};

use crate::clock::parse_rfc3339;
use crate::engine::Engine;
use crate::error::Result;
use crate::lock::{acquire, lock_path_for, LockMode};
use chrono::{DateTime, Utc};
use std::path::Path;

const REGISTRY_LOCK_LABEL: &str = "registry lock";

/// Runs `f` under a shared lock on `<path>.lock`.
pub(crate) fn read_locked<T>(engine: &Engine, path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _guard = acquire(
        &lock_path_for(path),
        LockMode::Shared,
        engine.config.event_lock_timeout_ms,
        REGISTRY_LOCK_LABEL,
    )?;
    f()
}

/// Runs `f` under an exclusive lock on `<path>.lock`.
pub(crate) fn write_locked<T>(engine: &Engine, path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _guard = acquire(
        &lock_path_for(path),
        LockMode::Exclusive,
        engine.config.event_lock_timeout_ms,
        REGISTRY_LOCK_LABEL,
    )?;
    f()
}

/// True when `expires_at` parses and lies strictly before `now`.
///
/// Blank or unparsable expiry never expires.
pub(crate) fn is_expired(expires_at: &str, now: DateTime<Utc>) -> bool {
    parse_rfc3339(expires_at).is_some_and(|at| now > at)
}

pub(crate) fn lowercase_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}
