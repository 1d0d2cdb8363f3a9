//! Wire-level types shared by lisa-core and the `lisa` CLI.
//!
//! Every command produces a JSON object on stdout plus a process exit code.
//! Keeping the shape here prevents drift between the engine (which builds
//! payloads) and the CLI (which prints them and re-parses child output during
//! turn/loop orchestration).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// JSON object payload.
pub type Payload = Map<String, Value>;

// ═══════════════════════════════════════════════════════════════════════════════
// Session State
// ═══════════════════════════════════════════════════════════════════════════════

/// Canonical classifier output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    InProgress,
    WaitingInput,
    Completed,
    Degraded,
    Stuck,
    Crashed,
    NotFound,
}

impl SessionState {
    pub const ALL: [SessionState; 7] = [
        SessionState::InProgress,
        SessionState::WaitingInput,
        SessionState::Completed,
        SessionState::Degraded,
        SessionState::Stuck,
        SessionState::Crashed,
        SessionState::NotFound,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::InProgress => "in_progress",
            SessionState::WaitingInput => "waiting_input",
            SessionState::Completed => "completed",
            SessionState::Degraded => "degraded",
            SessionState::Stuck => "stuck",
            SessionState::Crashed => "crashed",
            SessionState::NotFound => "not_found",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let value = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|state| state.as_str() == value)
    }

    /// States after which the agent will not make further progress on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Crashed
                | SessionState::Stuck
                | SessionState::NotFound
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command Output
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// A finished command: the JSON object to print and the exit code to return.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub payload: Payload,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn ok(payload: Payload) -> Self {
        Self {
            payload,
            exit_code: 0,
        }
    }

    pub fn with_exit(payload: Payload, exit_code: i32) -> Self {
        Self { payload, exit_code }
    }

    /// `{ok:false, errorCode, error}` with exit 1.
    pub fn failure(code: &str, message: impl Into<String>) -> Self {
        Self::from_error(ErrorInfo::new(code, message))
    }

    pub fn from_error(error: ErrorInfo) -> Self {
        Self {
            payload: failure_payload(&error),
            exit_code: 1,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.payload.get("errorCode").and_then(Value::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn to_json_line(&self) -> String {
        serde_json::to_string(&self.payload).unwrap_or_else(|_| "{}".to_string())
    }
}

pub fn failure_payload(error: &ErrorInfo) -> Payload {
    let mut payload = Payload::new();
    payload.insert("ok".into(), Value::Bool(false));
    payload.insert("errorCode".into(), Value::String(error.code.clone()));
    payload.insert("error".into(), Value::String(error.message.clone()));
    payload
}

/// Reads a string field, treating non-strings as absent.
pub fn str_field<'a>(payload: &'a Payload, key: &str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_round_trips_through_strings() {
        for state in SessionState::ALL {
            assert_eq!(SessionState::parse(state.as_str()), Some(state));
        }
        assert_eq!(SessionState::parse(" Waiting_Input "), Some(SessionState::WaitingInput));
        assert_eq!(SessionState::parse("just_started"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::NotFound.is_terminal());
        assert!(!SessionState::Degraded.is_terminal());
        assert!(!SessionState::WaitingInput.is_terminal());
    }

    #[test]
    fn test_failure_output_shape() {
        let out = CommandOutput::failure("session_not_found", "missing");
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("session_not_found"));
        assert_eq!(out.payload.get("ok"), Some(&Value::Bool(false)));
        assert_eq!(str_field(&out.payload, "error"), "missing");
    }

    #[test]
    fn test_serialized_state_is_snake_case() {
        let raw = serde_json::to_string(&SessionState::InProgress).unwrap();
        assert_eq!(raw, "\"in_progress\"");
    }
}
