//! Error types for lisa-core operations.
//!
//! Every variant maps to a stable snake_case code via [`LisaError::code`];
//! the CLI surfaces that code as `errorCode` in JSON failure payloads.

use lisa_protocol::ErrorInfo;
use std::path::PathBuf;

/// All errors that can occur in lisa-core operations.
#[derive(Debug, thiserror::Error)]
pub enum LisaError {
    // ─────────────────────────────────────────────────────────────────────
    // Argument Errors (detected before any I/O)
    // ─────────────────────────────────────────────────────────────────────
    #[error("{message}")]
    InvalidArgument { code: String, message: String },

    #[error("{flag} is required")]
    MissingRequiredFlag { flag: String },

    // ─────────────────────────────────────────────────────────────────────
    // Resolution Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("ambiguous project root for session {session}: {}", candidates.join(", "))]
    AmbiguousProjectRoot {
        session: String,
        candidates: Vec<String>,
    },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("lane not found: {0}")]
    LaneNotFound(String),

    #[error("objective not found: {0}")]
    ObjectiveNotFound(String),

    // ─────────────────────────────────────────────────────────────────────
    // Lock Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("{label} timeout after {waited_ms}ms")]
    LockTimeout { label: &'static str, waited_ms: u64 },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Multiplexer / Orchestration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Command execution failed: {command}: {details}")]
    CommandFailed { command: String, details: String },

    #[error("{message}")]
    Coded { code: String, message: String },
}

impl LisaError {
    pub fn invalid(code: &str, message: impl Into<String>) -> Self {
        LisaError::InvalidArgument {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn coded(code: &str, message: impl Into<String>) -> Self {
        LisaError::Coded {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        LisaError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        LisaError::Json {
            context: context.into(),
            source,
        }
    }

    /// Stable snake_case code for JSON payloads.
    pub fn code(&self) -> &str {
        match self {
            LisaError::InvalidArgument { code, .. } => code,
            LisaError::MissingRequiredFlag { .. } => "missing_required_flag",
            LisaError::AmbiguousProjectRoot { .. } => "ambiguous_project_root",
            LisaError::SessionNotFound(_) => "session_not_found",
            LisaError::LaneNotFound(_) => "lane_not_found",
            LisaError::ObjectiveNotFound(_) => "objective_not_found",
            LisaError::LockTimeout { label, .. } => match *label {
                "state lock" => "state_lock_timeout",
                _ => "event_lock_timeout",
            },
            LisaError::FileNotFound(_) => "file_not_found",
            LisaError::Io { .. } => "io_error",
            LisaError::Json { .. } => "json_parse_failed",
            LisaError::CommandFailed { .. } => "command_failed",
            LisaError::Coded { code, .. } => code,
        }
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, LisaError::LockTimeout { .. })
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.code(), self.to_string())
    }
}

/// Convenience type alias for Results using LisaError.
pub type Result<T> = std::result::Result<T, LisaError>;
