//! Atomic file writes and defensive JSON loads.
//!
//! Writers go through a temp file in the target's directory followed by a
//! rename, so a concurrent reader sees either the old or the new content.
//! Loaders treat a missing, empty, or corrupt file as the default value and
//! log a warning instead of failing.

use crate::error::{LisaError, Result};
use fs_err as fs;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::warn;

/// Write-to-temp + rename. Creates the parent directory when missing.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent_dir)
        .map_err(|e| LisaError::io(format!("create {}", parent_dir.display()), e))?;

    let mut temp_file = NamedTempFile::new_in(parent_dir)
        .map_err(|e| LisaError::io(format!("temp file in {}", parent_dir.display()), e))?;
    temp_file
        .write_all(data)
        .map_err(|e| LisaError::io(format!("write temp for {}", path.display()), e))?;
    temp_file
        .flush()
        .map_err(|e| LisaError::io(format!("flush temp for {}", path.display()), e))?;
    temp_file
        .persist(path)
        .map_err(|e| LisaError::io(format!("persist {}", path.display()), e.error))?;
    Ok(())
}

/// Pretty-printed (2-space) JSON, written atomically.
pub fn save_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| LisaError::json(format!("serialize {}", path.display()), e))?;
    write_file_atomic(path, content.as_bytes())
}

/// Reads a file; `Ok(None)` when it does not exist.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LisaError::io(format!("read {}", path.display()), e)),
    }
}

/// Strict load: missing or empty is the default, unparsable is an error.
pub fn load_json_strict<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let Some(content) = read_optional(path)? else {
        return Ok(T::default());
    };
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&content).map_err(|e| LisaError::json(path.display().to_string(), e))
}

/// Defensive load: any failure yields the default value plus a warning.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match load_json_strict(path) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable json file, using empty value");
            T::default()
        }
    }
}

pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(LisaError::io(format!("remove {}", path.display()), e)),
    }
}
