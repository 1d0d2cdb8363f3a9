//! Multi-step orchestration: `session turn` and `session loop`.
//!
//! Both compose peer commands through a [`StepRunner`] instead of calling
//! the builders directly, so the CLI can execute steps in-process while
//! tests substitute a scripted runner.
//!
//! # Module Structure
//!
//! - [`turn`]: send, monitor, packet
//! - [`cycle`]: repeated monitor, diff-pack, handoff, next under budget caps

pub mod cycle;
pub mod turn;

pub use cycle::{loop_command, LoopRequest};
pub use turn::{turn_command, TurnRequest};

use crate::error::Result;
use lisa_protocol::{str_field, Payload};
use serde_json::Value;

/// A finished child command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResult {
    /// Parsed stdout object; empty when the child printed nothing.
    pub payload: Payload,
    pub exit_code: i32,
}

impl StepResult {
    pub fn new(payload: Payload, exit_code: i32) -> Self {
        Self { payload, exit_code }
    }

    /// Child's own error message, falling back to its error code.
    pub fn error_message(&self) -> Option<String> {
        [str_field(&self.payload, "error"), str_field(&self.payload, "errorCode")]
            .into_iter()
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Executes a `lisa` argument vector such as `["session", "send", ...]`.
///
/// `Err` means the child's output could not be read or parsed; a child
/// that ran and failed is an `Ok` with a non-zero exit code.
pub trait StepRunner {
    fn run(&self, args: &[String]) -> Result<StepResult>;
}

/// Argument vector builder for a `session <command>` step.
#[derive(Debug, Clone)]
pub struct StepArgs(Vec<String>);

impl StepArgs {
    pub fn session(command: &str) -> Self {
        Self(vec!["session".to_string(), command.to_string()])
    }

    pub fn flag(mut self, name: &str) -> Self {
        self.0.push(name.to_string());
        self
    }

    pub fn arg(mut self, name: &str, value: impl ToString) -> Self {
        self.0.push(name.to_string());
        self.0.push(value.to_string());
        self
    }

    /// Adds `name value` only when the value is non-empty.
    pub fn arg_if(self, name: &str, value: &str) -> Self {
        if value.trim().is_empty() {
            self
        } else {
            self.arg(name, value.trim())
        }
    }

    /// Adds `name value` only when the value is positive.
    pub fn positive(self, name: &str, value: i64) -> Self {
        if value > 0 {
            self.arg(name, value)
        } else {
            self
        }
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

/// Trimmed string form of a payload field; numbers and bools are rendered.
pub fn step_text(payload: &Payload, key: &str) -> String {
    match payload.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string(),
    }
}
