//! Shared plumbing for command payload builders.
//!
//! Each `session <cmd>` is a function `fn(&Engine, &Request) -> CommandOutput`.
//! The request carries a [`Target`] naming the session and the project root
//! the caller asked for; [`Target::resolve_root`] turns that into the root the
//! session actually lives under.

use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::meta::resolve_session_project_root;
use crate::paths::current_dir_string;
use lisa_protocol::{CommandOutput, Payload};
use serde_json::Value;

/// Session and project root a command operates on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    pub session: String,
    pub project_root: String,
    /// `--project-root` was given; disables the global meta lookup.
    pub explicit_root: bool,
}

impl Target {
    pub fn new(session: &str, project_root: &str) -> Self {
        Self {
            session: session.trim().to_string(),
            project_root: project_root.to_string(),
            explicit_root: !project_root.trim().is_empty(),
        }
    }

    /// Target rooted at the working directory.
    pub fn session(session: &str) -> Self {
        Self {
            session: session.trim().to_string(),
            project_root: current_dir_string(),
            explicit_root: false,
        }
    }

    pub fn require_session(&self) -> Result<&str> {
        if self.session.is_empty() {
            return Err(LisaError::MissingRequiredFlag {
                flag: "--session".into(),
            });
        }
        Ok(&self.session)
    }

    pub fn resolve_root(&self, engine: &Engine) -> Result<String> {
        let root = if self.project_root.trim().is_empty() {
            current_dir_string()
        } else {
            self.project_root.clone()
        };
        resolve_session_project_root(engine, &self.session, &root, self.explicit_root)
    }
}

/// Converts a `json!` object into a payload; anything else becomes empty.
pub fn obj(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

pub fn fail(err: &LisaError) -> CommandOutput {
    CommandOutput::from_error(err.to_error_info())
}

/// Failure payload with a caller-chosen code wrapping the error message.
pub fn fail_as(code: &str, err: &LisaError) -> CommandOutput {
    CommandOutput::failure(code, err.to_string())
}

/// Failure payload that also names the session and project root.
pub fn fail_for(err: &LisaError, session: &str, project_root: &str) -> CommandOutput {
    let mut out = fail(err);
    with_target(&mut out.payload, session, project_root);
    out
}

pub fn with_target(payload: &mut Payload, session: &str, project_root: &str) {
    if !session.is_empty() {
        payload.insert("session".into(), Value::String(session.to_string()));
    }
    if !project_root.is_empty() {
        payload.insert("projectRoot".into(), Value::String(project_root.to_string()));
    }
}

/// Runs a builder body that reports errors through `?`.
pub fn run(body: impl FnOnce() -> Result<CommandOutput>) -> CommandOutput {
    body().unwrap_or_else(|err| fail(&err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lisa_protocol::str_field;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_root_is_kept() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let target = Target::new("s1", "/nonexistent/lisa-root");
        assert!(target.explicit_root);
        assert_eq!(target.resolve_root(&engine).unwrap(), "/nonexistent/lisa-root");
    }

    #[test]
    fn test_missing_session_is_reported() {
        let err = Target::new(" ", "/r").require_session().unwrap_err();
        assert_eq!(err.code(), "missing_required_flag");
    }

    #[test]
    fn test_fail_for_names_target() {
        let out = fail_for(&LisaError::SessionNotFound("s1".into()), "s1", "/r");
        assert_eq!(out.exit_code, 1);
        assert_eq!(str_field(&out.payload, "projectRoot"), "/r");
        assert_eq!(out.error_code(), Some("session_not_found"));
    }

    #[test]
    fn test_obj_ignores_non_objects() {
        assert!(obj(json!([1, 2])).is_empty());
        assert_eq!(obj(json!({"a": 1})).len(), 1);
    }
}
