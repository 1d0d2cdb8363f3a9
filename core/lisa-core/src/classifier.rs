//! Session state classifier.
//!
//! [`classify`] is a pure function over an [`Observation`]: every input is a
//! value already read from tmux or disk, so two callers that observed the
//! same artifacts always agree on the result.
//!
//! ## Priority (first match wins)
//!
//! 1. Session missing from tmux: `not_found`
//! 2. Successful completion (done file, session/exec marker, pane exited 0)
//! 3. Failure (nonzero marker, crashed pane, agent pid gone with stale heartbeat)
//! 4. Capture unreadable: `degraded`
//! 5. Heartbeat fresh and output advancing: `in_progress`
//! 6. Interactive agent waiting at its prompt: `waiting_input`
//! 7. Any remaining activity signal: `in_progress`
//! 8. Soft read errors: `degraded`
//! 9. Heartbeat went stale after activity: `degraded` (one poll)
//! 10. Early polls: `in_progress` (grace period)
//! 11. Nothing left: `stuck`

use lisa_protocol::SessionState;

/// Polls that count as "just started".
pub const GRACE_POLLS: u64 = 3;

/// Everything the classifier looks at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub session_exists: bool,
    pub interactive: bool,
    /// `alive`, `exited:<code>`, or `crashed:<code>`.
    pub pane_status: String,
    pub pane_is_shell: bool,

    /// Exit codes of completion signals that matched this run.
    pub done_file_exit: Option<i32>,
    pub session_marker_exit: Option<i32>,
    pub exec_marker_exit: Option<i32>,
    pub marker_run_mismatch: bool,

    pub agent_pid: u32,
    pub previous_agent_pid: u32,
    pub agent_busy: bool,

    pub heartbeat_seen: bool,
    pub heartbeat_fresh: bool,
    pub output_fresh: bool,
    /// Capture changed since the previous poll.
    pub output_advancing: bool,

    pub prompt_waiting: bool,
    pub interactive_waiting: bool,
    pub transcript_turn_complete: bool,
    pub require_turn_complete: bool,
    pub turn_complete: bool,

    pub capture_error: bool,
    /// `done_file_read_error` or `agent_scan_error`.
    pub soft_error: Option<&'static str>,

    pub previous_state: Option<SessionState>,
    pub poll_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub state: SessionState,
    /// `active`, `idle`, or `not_found`.
    pub status: &'static str,
    pub reason: &'static str,
}

impl Classification {
    fn new(state: SessionState, reason: &'static str) -> Self {
        let status = match state {
            SessionState::NotFound => "not_found",
            SessionState::InProgress => "active",
            _ => "idle",
        };
        Self {
            state,
            status,
            reason,
        }
    }
}

pub fn classify(obs: &Observation) -> Classification {
    use SessionState::*;

    if !obs.session_exists {
        return Classification::new(NotFound, "session_not_found");
    }

    let pane_exit = obs.pane_status.strip_prefix("exited:");
    let completions = [
        (obs.done_file_exit, "done_file"),
        (obs.session_marker_exit, "session_done_marker"),
        (obs.exec_marker_exit, "exec_done_marker"),
    ];
    for (exit, reason) in completions {
        if exit == Some(0) {
            return Classification::new(Completed, reason);
        }
    }
    if pane_exit == Some("0") {
        return Classification::new(Completed, "pane_exited_zero");
    }

    for (exit, reason) in completions {
        if exit.is_some() {
            return Classification::new(Crashed, reason);
        }
    }
    if obs.pane_status.starts_with("crashed:") {
        return Classification::new(Crashed, "pane_crashed");
    }
    if pane_exit.is_some() {
        return Classification::new(Crashed, "pane_exited_nonzero");
    }
    if obs.previous_agent_pid > 0
        && obs.agent_pid == 0
        && obs.heartbeat_seen
        && !obs.heartbeat_fresh
        && obs.pane_is_shell
    {
        return Classification::new(Crashed, "agent_pid_exited");
    }

    if obs.capture_error {
        return Classification::new(Degraded, "tmux_capture_error");
    }

    if obs.heartbeat_fresh && obs.output_advancing {
        return Classification::new(InProgress, "heartbeat_fresh");
    }

    if obs.interactive && (!obs.require_turn_complete || obs.turn_complete) {
        if obs.interactive_waiting {
            return Classification::new(WaitingInput, "interactive_waiting_idle");
        }
        if obs.transcript_turn_complete {
            return Classification::new(WaitingInput, "transcript_turn_complete");
        }
        if obs.prompt_waiting && !obs.agent_busy {
            return Classification::new(WaitingInput, "prompt_waiting");
        }
    }

    if obs.agent_pid > 0 {
        return Classification::new(InProgress, "agent_pid_alive");
    }
    if obs.output_fresh {
        return Classification::new(InProgress, "output_fresh");
    }
    if obs.heartbeat_fresh {
        return Classification::new(InProgress, "heartbeat_fresh");
    }
    if !obs.pane_is_shell {
        return Classification::new(InProgress, "non_shell_command");
    }

    if let Some(reason) = obs.soft_error {
        return Classification::new(Degraded, reason);
    }

    if obs.heartbeat_seen
        && obs.poll_count > GRACE_POLLS
        && matches!(obs.previous_state, Some(InProgress) | Some(WaitingInput))
    {
        return Classification::new(Degraded, "heartbeat_stale");
    }

    if obs.poll_count > 0 && obs.poll_count <= GRACE_POLLS {
        return Classification::new(InProgress, "grace_period_just_started");
    }

    // Output is not fresh past this point. No signal left means stuck,
    // whatever the previous state was.
    if obs.marker_run_mismatch {
        Classification::new(Stuck, "stuck_marker_run_mismatch")
    } else {
        Classification::new(Stuck, "stuck_no_signals")
    }
}

/// Status label as reported to callers: terminal states carry their own name.
pub fn normalize_status(state: SessionState, status: &str) -> String {
    match state {
        SessionState::Completed
        | SessionState::Crashed
        | SessionState::Stuck
        | SessionState::NotFound => state.as_str().to_string(),
        _ => status.to_string(),
    }
}

/// Recommended follow-up command for a state.
pub fn next_action_for_state(state: &str) -> &'static str {
    match state.trim() {
        "waiting_input" => "session send",
        "in_progress" | "degraded" => "session monitor",
        "completed" => "session capture",
        "crashed" | "stuck" => "session explain",
        "not_found" => "session spawn",
        _ => "session status",
    }
}
