//! Persisted records and status shapes shared across lisa-core.
//!
//! Field names are camelCase on disk and on the wire; these structs are the
//! single source of truth for every `.lisa-*` JSON artifact and for the
//! session status payload.

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// Markers & Defaults
// ═══════════════════════════════════════════════════════════════════════════════

pub const EXEC_DONE_PREFIX: &str = "__LISA_EXEC_DONE__:";
pub const SESSION_START_PREFIX: &str = "__LISA_SESSION_START__:";
pub const SESSION_DONE_PREFIX: &str = "__LISA_SESSION_DONE__:";

pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_MAX_POLLS: u64 = 120;
pub const DEFAULT_CAPTURE_LINES: usize = 220;

// ═══════════════════════════════════════════════════════════════════════════════
// Session Metadata
// ═══════════════════════════════════════════════════════════════════════════════

/// Written when a session is spawned; read by every session command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionMeta {
    pub session: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent_session: String,
    pub agent: String,
    pub mode: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub lane: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    pub project_root: String,
    #[serde(rename = "startCommand")]
    pub start_cmd: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub objective_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub objective_goal: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub objective_acceptance: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub objective_budget: i64,
    pub created_at: String,
}

/// Classifier bookkeeping persisted between status polls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassifierState {
    pub poll_count: u64,
    pub has_ever_been_active: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_resolved_agent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_resolved_mode: String,
    pub last_output_hash: String,
    pub last_output_at: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub last_output_at_nanos: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub last_input_at: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub last_input_at_nanos: i64,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub last_agent_pid: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub last_agent_probe_at: i64,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub last_agent_cpu: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_session_state: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_classification_reason: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Raw observations that fed a classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusSignals {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    pub done_file_seen: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub done_file_run_id: String,
    pub done_file_run_mismatch: bool,
    pub done_file_exit_code: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub done_file_read_error: String,
    pub session_marker_seen: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub session_marker_run_id: String,
    pub session_marker_run_mismatch: bool,
    pub session_exit_code: i32,
    pub exec_marker_seen: bool,
    pub exec_exit_code: i32,
    pub prompt_waiting: bool,
    pub interactive_waiting: bool,
    pub active_process_busy: bool,
    pub agent_process_detected: bool,
    pub output_fresh: bool,
    pub heartbeat_seen: bool,
    pub heartbeat_fresh: bool,
    pub pane_is_shell: bool,
    pub agent_scan_cached: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub agent_scan_error: String,
    pub transcript_turn_complete: bool,
    /// Output changed after the last `send` and the agent is back at its prompt.
    pub turn_complete: bool,
    pub output_advancing: bool,
    pub state_lock_wait_ms: u64,
    pub state_lock_timed_out: bool,
    #[serde(rename = "tmuxReadError", skip_serializing_if = "String::is_empty")]
    pub tmux_read_error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub meta_read_error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state_read_error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub events_write_error: String,
}

/// Full result of one status computation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionStatus {
    pub session: String,
    pub agent: String,
    pub mode: String,
    pub status: String,
    pub todos_done: u32,
    pub todos_total: u32,
    pub active_task: String,
    pub wait_estimate: u64,
    pub session_state: String,
    pub pane_status: String,
    pub pane_command: String,
    pub agent_pid: u32,
    pub agent_cpu: f64,
    pub output_age_seconds: i64,
    pub output_fresh_seconds: i64,
    #[serde(rename = "heartbeatAgeSeconds")]
    pub heartbeat_age: i64,
    #[serde(rename = "heartbeatFreshSeconds")]
    pub heartbeat_fresh_secs: i64,
    pub classification_reason: String,
    pub signals: StatusSignals,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output_file: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

/// One line of a session's `events.jsonl`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionEvent {
    pub at: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub session: String,
    pub state: String,
    pub status: String,
    pub reason: String,
    pub poll: u64,
    pub signals: StatusSignals,
}

/// Outcome of a monitor run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorResult {
    pub final_state: String,
    pub session: String,
    pub todos_done: u32,
    pub todos_total: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output_file: String,
    #[serde(skip_serializing_if = "is_zero_usize")]
    pub next_offset: usize,
    pub exit_reason: String,
    pub polls: u64,
    pub final_status: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}
