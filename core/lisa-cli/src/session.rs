//! `lisa session <cmd>`: flag parsing for every session command.
//!
//! Each variant's args struct maps onto the matching `lisa_core` request.
//! Flags left unset take the request's own default, so the defaults live
//! in one place.

use crate::runner::InProcessRunner;
use clap::builder::BoolishValueParser;
use clap::{Args, Subcommand};
use lisa_core::anomaly::{anomaly_command, AnomalyRequest};
use lisa_core::budget::{
    budget_enforce_command, budget_observe_command, budget_plan_command, BudgetEnforceRequest, BudgetLimits,
    BudgetPlanRequest, ObservedSources,
};
use lisa_core::checkpoint::{checkpoint_command, replay_command, CheckpointRequest, ReplayRequest};
use lisa_core::command::run;
use lisa_core::contract::{contract_check_command, schema_command, ContractCheckRequest};
use lisa_core::fleet::{aggregate_command, list_command, AggregateRequest, ListRequest};
use lisa_core::guard::{guard_command, GuardRequest};
use lisa_core::lifecycle::{
    exists_command, kill_all_command, kill_command, name_command, spawn_command, KillAllRequest, NameRequest,
    SpawnRequest,
};
use lisa_core::monitor::{monitor_command, Expect, MonitorRequest};
use lisa_core::orchestrate::{loop_command, turn_command, LoopRequest, TurnRequest};
use lisa_core::pack::{
    context_pack_command, diff_pack_command, handoff_command, packet_command, ContextPackRequest, DiffPackRequest,
    HandoffRequest, PackLimits, PacketRequest,
};
use lisa_core::registry::{
    context_cache_command, dedupe_command, lane_command, memory_command, objective_command, ContextCacheRequest,
    DedupeRequest, LaneRecord, LaneRequest, MemoryRequest, ObjectiveRequest,
};
use lisa_core::router::{prompt_lint_command, route_command, PromptLintRequest, RouteRequest};
use lisa_core::sandbox::{state_sandbox_command, SandboxRequest};
use lisa_core::session::{
    capture_command, explain_command, next_command, send_command, snapshot_command, status_command,
    CaptureRequest, ExplainRequest, NextRequest, SendRequest, SessionStatusRequest, SnapshotRequest,
};
use lisa_core::smoke::smoke_command;
use lisa_core::{Engine, LisaError, Target};
use lisa_protocol::{CommandOutput, SessionState};

#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// tmux session name
    #[arg(long)]
    pub session: Option<String>,

    /// Project root (defaults to the session's recorded root, then the cwd)
    #[arg(long)]
    pub project_root: Option<String>,
}

impl TargetArgs {
    pub fn target(&self) -> Target {
        Target::new(
            self.session.as_deref().unwrap_or(""),
            self.project_root.as_deref().unwrap_or(""),
        )
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct RootArgs {
    /// Project root (defaults to the cwd)
    #[arg(long)]
    pub project_root: Option<String>,
}

impl RootArgs {
    fn root(&self) -> String {
        self.project_root.clone().unwrap_or_default()
    }

    fn target(&self) -> Target {
        Target::new("", &self.root())
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct HintArgs {
    /// Agent hint: auto|claude|codex
    #[arg(long)]
    pub agent: Option<String>,

    /// Mode hint: auto|interactive|exec
    #[arg(long)]
    pub mode: Option<String>,
}

impl HintArgs {
    fn agent_or(&self, fallback: String) -> String {
        self.agent.clone().unwrap_or(fallback)
    }

    fn mode_or(&self, fallback: String) -> String {
        self.mode.clone().unwrap_or(fallback)
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct PackArgs {
    /// Pack strategy: terse|balanced|full
    #[arg(long)]
    pub strategy: Option<String>,

    /// Event tail length
    #[arg(long)]
    pub events: Option<usize>,

    /// Capture lines
    #[arg(long)]
    pub lines: Option<usize>,

    /// Token budget for the rendered pack
    #[arg(long, allow_negative_numbers = true)]
    pub token_budget: Option<i64>,
}

impl PackArgs {
    fn limits(&self) -> PackLimits {
        PackLimits {
            events: self.events,
            lines: self.lines,
            token_budget: self.token_budget,
        }
    }

    fn strategy_or(&self, fallback: String) -> String {
        self.strategy.clone().unwrap_or(fallback)
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct MinArgs {
    /// Print the minimal payload
    #[arg(long)]
    pub json_min: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct PollArgs {
    /// Seconds between polls
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Maximum number of polls
    #[arg(long)]
    pub max_polls: Option<u64>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct WaitArgs {
    /// Exit condition: any|terminal|marker
    #[arg(long)]
    pub expect: Option<String>,

    /// Wall-clock cap in seconds (0 disables it)
    #[arg(long)]
    pub timeout_seconds: Option<u64>,

    /// Stop when the agent waits for input
    #[arg(
        long,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub stop_on_waiting: Option<bool>,

    /// Only treat waiting as final once the turn has completed
    #[arg(
        long,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub waiting_requires_turn_complete: Option<bool>,

    /// Stop once the session reaches this state
    #[arg(long)]
    pub until_state: Option<String>,

    /// Stop once this text appears in the capture
    #[arg(long)]
    pub until_marker: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct InputArgs {
    /// Literal text to type
    #[arg(long)]
    pub text: Option<String>,

    /// Whitespace-separated tmux key names
    #[arg(long)]
    pub keys: Option<String>,

    /// Press Enter after the input
    #[arg(long)]
    pub enter: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ObservedArgs {
    /// Comma-separated JSON files to read metrics from (`-` is stdin)
    #[arg(long)]
    pub from: Option<String>,

    /// Log whose last JSON line holds the metrics
    #[arg(long)]
    pub from_jsonl: Option<String>,

    #[arg(long, allow_negative_numbers = true)]
    pub tokens: Option<i64>,

    #[arg(long, allow_negative_numbers = true)]
    pub seconds: Option<i64>,

    #[arg(long, allow_negative_numbers = true)]
    pub steps: Option<i64>,
}

impl ObservedArgs {
    fn sources(&self) -> ObservedSources {
        ObservedSources {
            from: self.from.clone().unwrap_or_default(),
            from_jsonl: self.from_jsonl.clone().unwrap_or_default(),
            tokens: self.tokens,
            seconds: self.seconds,
            steps: self.steps,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct CapArgs {
    /// Token cap (0 disables it)
    #[arg(long, allow_negative_numbers = true)]
    pub max_tokens: Option<i64>,

    /// Seconds cap (0 disables it)
    #[arg(long, allow_negative_numbers = true)]
    pub max_seconds: Option<i64>,

    /// Steps cap (0 disables it)
    #[arg(long, allow_negative_numbers = true)]
    pub max_steps: Option<i64>,
}

impl CapArgs {
    fn limits(&self) -> BudgetLimits {
        BudgetLimits {
            max_tokens: self.max_tokens.unwrap_or(0),
            max_seconds: self.max_seconds.unwrap_or(0),
            max_steps: self.max_steps.unwrap_or(0),
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum SessionCommand {
    /// Start an agent in a detached tmux session
    Spawn {
        #[command(flatten)]
        root: RootArgs,
        /// Session name (must start with lisa-; generated when omitted)
        #[arg(long)]
        session: Option<String>,
        /// claude|codex (default claude)
        #[arg(long)]
        agent: Option<String>,
        /// interactive|exec (default interactive)
        #[arg(long)]
        mode: Option<String>,
        /// Lane preset filling unset flags
        #[arg(long)]
        lane: Option<String>,
        #[arg(long)]
        nested_policy: Option<String>,
        #[arg(long)]
        nesting_intent: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        /// Run this shell command instead of the agent
        #[arg(long)]
        command: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        agent_args: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        width: Option<i64>,
        #[arg(long, allow_negative_numbers = true)]
        height: Option<i64>,
        /// Print the plan without starting tmux
        #[arg(long)]
        dry_run: bool,
        /// Include the nested-bypass detection in the payload
        #[arg(long)]
        detect_nested: bool,
        /// Do not pass --dangerously-skip-permissions to claude
        #[arg(long)]
        no_dangerously_skip_permissions: bool,
    },

    /// Check whether a tmux session is alive
    Exists {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Kill a session and the sessions it spawned
    Kill {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Kill every listed session
    KillAll {
        #[command(flatten)]
        root: RootArgs,
        /// Only sessions owned by this project
        #[arg(long)]
        project_only: bool,
    },

    /// Print a fresh session name
    Name {
        #[command(flatten)]
        root: RootArgs,
        #[command(flatten)]
        hints: HintArgs,
        /// Suffix appended after sanitizing
        #[arg(long)]
        tag: Option<String>,
    },

    /// Classify a session and print its status
    Status {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        hints: HintArgs,
        /// Write the output file for terminal states
        #[arg(long)]
        full: bool,
        /// Exit 1 when the session does not exist
        #[arg(long)]
        fail_not_found: bool,
        #[command(flatten)]
        min: MinArgs,
    },

    /// Status plus the recent event tail
    Explain {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        hints: HintArgs,
        #[arg(long)]
        events: Option<usize>,
        /// Event index, @<unix> or RFC 3339 timestamp
        #[arg(long)]
        since: Option<String>,
        #[command(flatten)]
        min: MinArgs,
    },

    /// Status, capture tail and next offset in one payload
    Snapshot {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        hints: HintArgs,
        #[arg(long)]
        lines: Option<usize>,
        #[arg(long)]
        delta_from: Option<String>,
        /// Comma-separated markers to look for
        #[arg(long)]
        markers: Option<String>,
        /// Keep agent UI noise in the capture
        #[arg(long)]
        keep_noise: bool,
        #[arg(long)]
        fail_not_found: bool,
        #[command(flatten)]
        min: MinArgs,
    },

    /// Capture pane output
    Capture {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        lines: Option<usize>,
        /// Unfiltered pane text
        #[arg(long)]
        raw: bool,
        #[arg(long)]
        keep_noise: bool,
        #[arg(long)]
        delta_from: Option<String>,
        #[arg(long)]
        cursor_file: Option<String>,
        #[arg(long)]
        markers: Option<String>,
        /// Semantic lines cut to --token-budget
        #[arg(long)]
        summary: bool,
        #[arg(long, allow_negative_numbers = true)]
        token_budget: Option<i64>,
        /// Semantic lines not seen at the last cursor read
        #[arg(long)]
        semantic_delta: bool,
        /// Redaction rules: emails,secrets,tokens,numbers,paths,all,none
        #[arg(long)]
        redact: Option<String>,
        /// Comma-separated payload fields to keep
        #[arg(long)]
        fields: Option<String>,
        #[command(flatten)]
        min: MinArgs,
    },

    /// Poll a session until it finishes, waits, or a cap is hit
    Monitor {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        hints: HintArgs,
        #[command(flatten)]
        poll: PollArgs,
        #[command(flatten)]
        wait: WaitArgs,
        #[command(flatten)]
        min: MinArgs,
    },

    /// Type text or keys into a session
    Send {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        min: MinArgs,
    },

    /// Status, events and a capture summary for one session
    Packet {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        hints: HintArgs,
        #[arg(long)]
        lines: Option<usize>,
        #[arg(long)]
        events: Option<usize>,
        #[arg(long, allow_negative_numbers = true)]
        token_budget: Option<i64>,
        /// terse|ops|full
        #[arg(long)]
        summary_style: Option<String>,
        #[arg(long)]
        cursor_file: Option<String>,
        /// Report field changes since the cursor
        #[arg(long)]
        delta_json: bool,
        #[arg(long)]
        fields: Option<String>,
        #[command(flatten)]
        min: MinArgs,
    },

    /// Structured handoff for another agent
    Handoff {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        hints: HintArgs,
        #[arg(long)]
        events: Option<usize>,
        #[arg(long)]
        delta_from: Option<String>,
        #[arg(long)]
        cursor_file: Option<String>,
        /// v1|v2|v3
        #[arg(long)]
        schema: Option<String>,
        #[command(flatten)]
        min: MinArgs,
    },

    /// Token-bounded context pack for a session
    ContextPack {
        /// Session to pack
        #[arg(long = "for", visible_alias = "session")]
        for_session: Option<String>,
        #[command(flatten)]
        root: RootArgs,
        #[command(flatten)]
        hints: HintArgs,
        #[command(flatten)]
        pack: PackArgs,
        /// Handoff JSON file, or `-` for stdin
        #[arg(long)]
        from_handoff: Option<String>,
        #[arg(long)]
        redact: Option<String>,
        #[command(flatten)]
        min: MinArgs,
    },

    /// What changed in a session's pack since the cursor
    DiffPack {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        pack: PackArgs,
        #[arg(long)]
        cursor_file: Option<String>,
        #[arg(long)]
        redact: Option<String>,
        /// Compare semantic lines only
        #[arg(long)]
        semantic_only: bool,
        #[command(flatten)]
        min: MinArgs,
    },

    /// One pack across several sessions
    Aggregate {
        /// Comma-separated session names (default: every listed session)
        #[arg(long)]
        sessions: Option<String>,
        #[command(flatten)]
        root: RootArgs,
        #[command(flatten)]
        pack: PackArgs,
        /// Drop repeated lines across sessions
        #[arg(long)]
        dedupe: bool,
        #[arg(long)]
        delta_json: bool,
        #[arg(long)]
        cursor_file: Option<String>,
        #[command(flatten)]
        min: MinArgs,
    },

    /// Recommend the next command for a session
    Next {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long, allow_negative_numbers = true)]
        budget: Option<i64>,
    },

    /// Plan a spawn: agent, model, command line and optional runbook
    Route {
        #[command(flatten)]
        root: RootArgs,
        #[arg(long)]
        goal: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        lane: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        profile: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        budget: Option<i64>,
        #[arg(long)]
        emit_runbook: bool,
        /// Build a prioritized queue of existing sessions
        #[arg(long)]
        queue: bool,
        #[arg(long)]
        sessions: Option<String>,
        #[arg(long)]
        queue_limit: Option<usize>,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Roles such as planner,workers,reviewer
        #[arg(long)]
        topology: Option<String>,
        #[arg(long)]
        cost_estimate: bool,
        /// Status or handoff JSON file, or `-` for stdin
        #[arg(long)]
        from_state: Option<String>,
    },

    /// Check a command against the shared tmux server
    Guard {
        #[command(flatten)]
        root: RootArgs,
        /// Required: confirm the default tmux server is shared
        #[arg(long)]
        shared_tmux: bool,
        #[arg(long)]
        enforce: bool,
        #[arg(long)]
        advice_only: bool,
        /// strict|warn|off
        #[arg(long)]
        machine_policy: Option<String>,
        #[arg(long)]
        command: Option<String>,
        #[arg(long)]
        policy_file: Option<String>,
    },

    /// Enumerate sessions
    List {
        #[command(flatten)]
        root: RootArgs,
        #[arg(long)]
        project_only: bool,
        #[arg(long)]
        active_only: bool,
        #[arg(long)]
        with_next_action: bool,
        /// Sort by priority score
        #[arg(long)]
        priority: bool,
        #[arg(long)]
        delta_json: bool,
        #[arg(long)]
        cursor_file: Option<String>,
        #[command(flatten)]
        min: MinArgs,
    },

    /// Deterministic self-check
    Smoke,

    /// Save a checkpoint bundle or resume from one
    Checkpoint {
        /// save|resume
        #[arg(value_name = "ACTION")]
        action_arg: Option<String>,
        #[arg(long)]
        action: Option<String>,
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        file: Option<String>,
        #[command(flatten)]
        pack: PackArgs,
        #[command(flatten)]
        min: MinArgs,
    },

    /// Claim or release a task hash
    Dedupe {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        task_hash: Option<String>,
        #[arg(long)]
        release: bool,
    },

    /// Manage project objectives
    Objective {
        #[command(flatten)]
        root: RootArgs,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        goal: Option<String>,
        #[arg(long)]
        acceptance: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        budget: Option<i64>,
        /// open|done|paused
        #[arg(long)]
        status: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        ttl_hours: Option<i64>,
        #[arg(long)]
        activate: bool,
        #[arg(long)]
        clear: bool,
        #[arg(long)]
        list: bool,
    },

    /// Per-session semantic memory
    Memory {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        refresh: bool,
        #[arg(long)]
        semantic_diff: bool,
        #[arg(long, allow_negative_numbers = true)]
        ttl_hours: Option<i64>,
        #[arg(long)]
        max_lines: Option<usize>,
    },

    /// Manage named lanes
    Lane {
        #[command(flatten)]
        root: RootArgs,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        goal: Option<String>,
        #[command(flatten)]
        hints: HintArgs,
        #[arg(long)]
        nested_policy: Option<String>,
        #[arg(long)]
        nesting_intent: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        budget: Option<i64>,
        #[arg(long)]
        topology: Option<String>,
        #[arg(long)]
        contract: Option<String>,
        #[arg(long)]
        clear: bool,
        #[arg(long)]
        list: bool,
    },

    /// Shared keyed context lines
    ContextCache {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        refresh: bool,
        #[arg(long)]
        list: bool,
        #[arg(long)]
        clear: bool,
        /// File to load lines from, or `-` for stdin
        #[arg(long)]
        from: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        ttl_hours: Option<i64>,
        #[arg(long)]
        max_lines: Option<usize>,
    },

    /// Sum observed tokens, seconds and steps
    BudgetObserve {
        #[command(flatten)]
        observed: ObservedArgs,
    },

    /// Compare observed usage against caps
    BudgetEnforce {
        #[command(flatten)]
        observed: ObservedArgs,
        #[command(flatten)]
        caps: CapArgs,
    },

    /// Estimate the cost of a planned topology
    BudgetPlan {
        #[command(flatten)]
        root: RootArgs,
        #[arg(long)]
        goal: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        profile: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        budget: Option<i64>,
        #[arg(long)]
        topology: Option<String>,
        #[arg(long)]
        from_state: Option<String>,
    },

    /// Rebuild the command steps recorded in a checkpoint
    Replay {
        #[arg(long)]
        from_checkpoint: Option<String>,
        #[command(flatten)]
        root: RootArgs,
    },

    /// Detect anomalies in a session's event history
    Anomaly {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        events: Option<usize>,
        #[arg(long)]
        auto_remediate: bool,
    },

    /// Repeated monitor, diff-pack, handoff and next rounds under caps
    Loop {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        poll: PollArgs,
        #[command(flatten)]
        pack: PackArgs,
        #[arg(long)]
        cursor_file: Option<String>,
        #[arg(long)]
        handoff_cursor_file: Option<String>,
        #[arg(long)]
        schema: Option<String>,
        /// Rounds to run
        #[arg(long)]
        steps: Option<usize>,
        #[command(flatten)]
        caps: CapArgs,
        #[command(flatten)]
        min: MinArgs,
    },

    /// Send, monitor, then packet in one call
    Turn {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        hints: HintArgs,
        #[command(flatten)]
        poll: PollArgs,
        #[command(flatten)]
        wait: WaitArgs,
        #[arg(long)]
        lines: Option<usize>,
        #[arg(long)]
        events: Option<usize>,
        #[arg(long, allow_negative_numbers = true)]
        token_budget: Option<i64>,
        #[arg(long)]
        summary_style: Option<String>,
        #[arg(long)]
        cursor_file: Option<String>,
        #[arg(long)]
        fields: Option<String>,
        #[command(flatten)]
        min: MinArgs,
    },

    /// Print output schemas
    Schema {
        /// One command, e.g. `session status` or `status`
        #[arg(long)]
        command: Option<String>,
    },

    /// Verify the skill doc covers every command and flag
    ContractCheck {
        #[command(flatten)]
        root: RootArgs,
        #[arg(long)]
        skill_doc: Option<String>,
        #[command(flatten)]
        min: MinArgs,
    },

    /// List, snapshot, restore or clear objective and lane registries
    StateSandbox {
        /// list|snapshot|restore|clear
        #[arg(value_name = "ACTION")]
        action_arg: Option<String>,
        #[arg(long)]
        action: Option<String>,
        #[command(flatten)]
        root: RootArgs,
        #[arg(long)]
        file: Option<String>,
        #[command(flatten)]
        min: MinArgs,
    },

    /// Lint a prompt before spawning an agent with it
    PromptLint {
        #[command(flatten)]
        root: RootArgs,
        #[command(flatten)]
        hints: HintArgs,
        #[arg(long)]
        nested_policy: Option<String>,
        #[arg(long)]
        nesting_intent: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        markers: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        budget: Option<i64>,
        /// Exit 1 on high-severity warnings
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        rewrite: bool,
    },
}

fn text(value: Option<String>) -> String {
    value.unwrap_or_default()
}

fn pick_action(positional: Option<String>, flag: Option<String>, fallback: String) -> String {
    flag.or(positional).unwrap_or(fallback)
}

fn parse_until_state(raw: Option<String>) -> lisa_core::Result<Option<SessionState>> {
    match raw {
        None => Ok(None),
        Some(value) => SessionState::parse(&value).map(Some).ok_or_else(|| {
            LisaError::invalid("invalid_until_state", format!("invalid --until-state: {value}"))
        }),
    }
}

fn monitor_request(
    target: TargetArgs,
    hints: HintArgs,
    poll: PollArgs,
    wait: WaitArgs,
    json_min: bool,
) -> lisa_core::Result<MonitorRequest> {
    let d = MonitorRequest::default();
    Ok(MonitorRequest {
        target: target.target(),
        agent_hint: hints.agent_or(d.agent_hint),
        mode_hint: hints.mode_or(d.mode_hint),
        expect: Expect::parse(wait.expect.as_deref().unwrap_or(""))?,
        poll_interval_seconds: poll.poll_interval.unwrap_or(d.poll_interval_seconds),
        max_polls: poll.max_polls.unwrap_or(d.max_polls),
        timeout_seconds: wait.timeout_seconds.unwrap_or(d.timeout_seconds),
        stop_on_waiting: wait.stop_on_waiting.unwrap_or(d.stop_on_waiting),
        waiting_requires_turn_complete: wait
            .waiting_requires_turn_complete
            .unwrap_or(d.waiting_requires_turn_complete),
        until_state: parse_until_state(wait.until_state)?,
        until_marker: wait.until_marker,
        json_min,
    })
}

impl SessionCommand {
    pub fn execute(self, engine: &Engine) -> CommandOutput {
        match self {
            SessionCommand::Spawn {
                root,
                session,
                agent,
                mode,
                lane,
                nested_policy,
                nesting_intent,
                prompt,
                command,
                agent_args,
                model,
                width,
                height,
                dry_run,
                detect_nested,
                no_dangerously_skip_permissions,
            } => {
                let req = SpawnRequest {
                    project_root: root.root(),
                    session: text(session),
                    agent: text(agent),
                    mode: text(mode),
                    lane: text(lane),
                    nested_policy: text(nested_policy),
                    nesting_intent: text(nesting_intent),
                    prompt: text(prompt),
                    command: text(command),
                    agent_args: text(agent_args),
                    model: text(model),
                    width,
                    height,
                    dry_run,
                    detect_nested,
                    no_skip_permissions: no_dangerously_skip_permissions,
                };
                spawn_command(engine, &req)
            }
            SessionCommand::Exists { target } => exists_command(engine, &target.target()),
            SessionCommand::Kill { target } => kill_command(engine, &target.target()),
            SessionCommand::KillAll { root, project_only } => {
                let req = KillAllRequest {
                    project_root: root.root(),
                    project_only,
                };
                kill_all_command(engine, &req)
            }
            SessionCommand::Name { root, hints, tag } => {
                let req = NameRequest {
                    project_root: root.root(),
                    agent: text(hints.agent),
                    mode: text(hints.mode),
                    tag: text(tag),
                };
                name_command(engine, &req)
            }
            SessionCommand::Status { target, hints, full, fail_not_found, min } => {
                let req = SessionStatusRequest {
                    target: target.target(),
                    agent_hint: text(hints.agent),
                    mode_hint: text(hints.mode),
                    full,
                    fail_not_found,
                    json_min: min.json_min,
                };
                status_command(engine, &req)
            }
            SessionCommand::Explain { target, hints, events, since, min } => {
                let d = ExplainRequest::default();
                let req = ExplainRequest {
                    target: target.target(),
                    agent_hint: hints.agent_or(d.agent_hint),
                    mode_hint: hints.mode_or(d.mode_hint),
                    events: events.unwrap_or(d.events),
                    since: text(since),
                    json_min: min.json_min,
                };
                explain_command(engine, &req)
            }
            SessionCommand::Snapshot { target, hints, lines, delta_from, markers, keep_noise, fail_not_found, min } => {
                let d = SnapshotRequest::default();
                let req = SnapshotRequest {
                    target: target.target(),
                    agent_hint: hints.agent_or(d.agent_hint),
                    mode_hint: hints.mode_or(d.mode_hint),
                    lines: lines.unwrap_or(d.lines),
                    delta_from: text(delta_from),
                    markers: text(markers),
                    strip_noise: !keep_noise,
                    fail_not_found,
                    json_min: min.json_min,
                };
                snapshot_command(engine, &req)
            }
            SessionCommand::Capture {
                target,
                lines,
                raw,
                keep_noise,
                delta_from,
                cursor_file,
                markers,
                summary,
                token_budget,
                semantic_delta,
                redact,
                fields,
                min,
            } => {
                let d = CaptureRequest::default();
                let req = CaptureRequest {
                    target: target.target(),
                    lines: lines.unwrap_or(d.lines),
                    delta_from: text(delta_from),
                    cursor_file: text(cursor_file),
                    markers: text(markers),
                    strip_noise: !(raw || keep_noise),
                    summary,
                    token_budget: token_budget.unwrap_or(d.token_budget),
                    semantic_delta,
                    redact: text(redact),
                    fields: text(fields),
                    json_min: min.json_min,
                };
                capture_command(engine, &req)
            }
            SessionCommand::Monitor { target, hints, poll, wait, min } => {
                run(|| Ok(monitor_command(engine, &monitor_request(target, hints, poll, wait, min.json_min)?)))
            }
            SessionCommand::Send { target, input, min } => {
                let req = SendRequest {
                    target: target.target(),
                    text: text(input.text),
                    keys: text(input.keys),
                    enter: input.enter,
                    json_min: min.json_min,
                };
                send_command(engine, &req)
            }
            SessionCommand::Packet {
                target,
                hints,
                lines,
                events,
                token_budget,
                summary_style,
                cursor_file,
                delta_json,
                fields,
                min,
            } => {
                let d = PacketRequest::default();
                let req = PacketRequest {
                    target: target.target(),
                    agent_hint: hints.agent_or(d.agent_hint),
                    mode_hint: hints.mode_or(d.mode_hint),
                    lines: lines.unwrap_or(d.lines),
                    events: events.unwrap_or(d.events),
                    token_budget: token_budget.unwrap_or(d.token_budget),
                    summary_style: summary_style.unwrap_or(d.summary_style),
                    cursor_file: text(cursor_file),
                    delta_json,
                    fields: text(fields),
                    json_min: min.json_min,
                };
                packet_command(engine, &req)
            }
            SessionCommand::Handoff { target, hints, events, delta_from, cursor_file, schema, min } => {
                let d = HandoffRequest::default();
                let req = HandoffRequest {
                    target: target.target(),
                    agent_hint: hints.agent_or(d.agent_hint),
                    mode_hint: hints.mode_or(d.mode_hint),
                    events: events.unwrap_or(d.events),
                    delta_from: text(delta_from),
                    cursor_file: text(cursor_file),
                    schema: schema.unwrap_or(d.schema),
                    json_min: min.json_min,
                };
                handoff_command(engine, &req)
            }
            SessionCommand::ContextPack { for_session, root, hints, pack, from_handoff, redact, min } => {
                let d = ContextPackRequest::default();
                let req = ContextPackRequest {
                    target: Target::new(for_session.as_deref().unwrap_or(""), &root.root()),
                    agent_hint: hints.agent_or(d.agent_hint),
                    mode_hint: hints.mode_or(d.mode_hint),
                    strategy: pack.strategy_or(d.strategy),
                    limits: pack.limits(),
                    from_handoff: text(from_handoff),
                    redact: text(redact),
                    json_min: min.json_min,
                };
                context_pack_command(engine, &req)
            }
            SessionCommand::DiffPack { target, pack, cursor_file, redact, semantic_only, min } => {
                let d = DiffPackRequest::default();
                let req = DiffPackRequest {
                    target: target.target(),
                    strategy: pack.strategy_or(d.strategy),
                    limits: pack.limits(),
                    cursor_file: text(cursor_file),
                    redact: text(redact),
                    semantic_only,
                    json_min: min.json_min,
                };
                diff_pack_command(engine, &req)
            }
            SessionCommand::Aggregate { sessions, root, pack, dedupe, delta_json, cursor_file, min } => {
                let d = AggregateRequest::default();
                let req = AggregateRequest {
                    sessions: text(sessions),
                    project_root: root.root(),
                    strategy: pack.strategy_or(d.strategy),
                    events: pack.events,
                    lines: pack.lines,
                    token_budget: pack.token_budget.unwrap_or(d.token_budget),
                    dedupe,
                    delta_json,
                    cursor_file: text(cursor_file),
                    json_min: min.json_min,
                };
                aggregate_command(engine, &req)
            }
            SessionCommand::Next { target, budget } => {
                let d = NextRequest::default();
                let req = NextRequest {
                    target: target.target(),
                    budget: budget.unwrap_or(d.budget),
                };
                next_command(engine, &req)
            }
            SessionCommand::Route {
                root,
                goal,
                agent,
                lane,
                prompt,
                model,
                profile,
                budget,
                emit_runbook,
                queue,
                sessions,
                queue_limit,
                concurrency,
                topology,
                cost_estimate,
                from_state,
            } => {
                let d = RouteRequest::default();
                let req = RouteRequest {
                    project_root: root.root(),
                    goal: goal.unwrap_or(d.goal),
                    agent: agent.unwrap_or(d.agent),
                    lane: text(lane),
                    prompt: text(prompt),
                    model: text(model),
                    profile: text(profile),
                    budget: budget.unwrap_or(d.budget),
                    emit_runbook,
                    queue,
                    sessions: text(sessions),
                    queue_limit: queue_limit.unwrap_or(d.queue_limit),
                    concurrency: concurrency.unwrap_or(d.concurrency),
                    topology: text(topology),
                    cost_estimate,
                    from_state: text(from_state),
                };
                route_command(engine, &req)
            }
            SessionCommand::Guard { root, shared_tmux, enforce, advice_only, machine_policy, command, policy_file } => {
                let req = GuardRequest {
                    project_root: root.root(),
                    shared_tmux,
                    enforce,
                    advice_only,
                    machine_policy: text(machine_policy),
                    command: text(command),
                    policy_file: text(policy_file),
                };
                guard_command(engine, &req)
            }
            SessionCommand::List {
                root,
                project_only,
                active_only,
                with_next_action,
                priority,
                delta_json,
                cursor_file,
                min,
            } => {
                let req = ListRequest {
                    project_root: root.root(),
                    project_only,
                    active_only,
                    with_next_action,
                    priority,
                    delta_json,
                    cursor_file: text(cursor_file),
                    json_min: min.json_min,
                };
                list_command(engine, &req)
            }
            SessionCommand::Smoke => smoke_command(),
            SessionCommand::Checkpoint { action_arg, action, target, file, pack, min } => {
                let d = CheckpointRequest::default();
                let req = CheckpointRequest {
                    action: pick_action(action_arg, action, d.action),
                    target: target.target(),
                    file: text(file),
                    strategy: pack.strategy_or(d.strategy),
                    limits: pack.limits(),
                    json_min: min.json_min,
                };
                checkpoint_command(engine, &req)
            }
            SessionCommand::Dedupe { target, task_hash, release } => {
                let req = DedupeRequest {
                    target: target.target(),
                    task_hash: text(task_hash),
                    release,
                };
                dedupe_command(engine, &req)
            }
            SessionCommand::Objective {
                root,
                id,
                goal,
                acceptance,
                budget,
                status,
                ttl_hours,
                activate,
                clear,
                list,
            } => {
                let req = ObjectiveRequest {
                    target: root.target(),
                    id: text(id),
                    goal: text(goal),
                    acceptance: text(acceptance),
                    budget: budget.unwrap_or(0),
                    status: text(status),
                    ttl_hours: ttl_hours.unwrap_or(0),
                    activate,
                    clear,
                    list,
                };
                objective_command(engine, &req)
            }
            SessionCommand::Memory { target, refresh, semantic_diff, ttl_hours, max_lines } => {
                let d = MemoryRequest::default();
                let req = MemoryRequest {
                    target: target.target(),
                    refresh,
                    semantic_diff,
                    ttl_hours: ttl_hours.unwrap_or(d.ttl_hours),
                    max_lines: max_lines.unwrap_or(d.max_lines),
                };
                memory_command(engine, &req)
            }
            SessionCommand::Lane {
                root,
                name,
                goal,
                hints,
                nested_policy,
                nesting_intent,
                prompt,
                model,
                budget,
                topology,
                contract,
                clear,
                list,
            } => {
                let name = text(name);
                let req = LaneRequest {
                    target: root.target(),
                    fields: LaneRecord {
                        name: name.clone(),
                        goal: text(goal),
                        agent: text(hints.agent),
                        mode: text(hints.mode),
                        nested_policy: text(nested_policy),
                        nesting_intent: text(nesting_intent),
                        prompt: text(prompt),
                        model: text(model),
                        budget: budget.unwrap_or(0),
                        topology: text(topology),
                        contract: text(contract),
                        updated_at: String::new(),
                    },
                    name,
                    clear,
                    list,
                };
                lane_command(engine, &req)
            }
            SessionCommand::ContextCache { target, key, refresh, list, clear, from, ttl_hours, max_lines } => {
                let d = ContextCacheRequest::default();
                let req = ContextCacheRequest {
                    target: target.target(),
                    key: text(key),
                    refresh,
                    list,
                    clear,
                    from: text(from),
                    ttl_hours: ttl_hours.unwrap_or(d.ttl_hours),
                    max_lines: max_lines.unwrap_or(d.max_lines),
                };
                context_cache_command(engine, &req)
            }
            SessionCommand::BudgetObserve { observed } => budget_observe_command(&observed.sources()),
            SessionCommand::BudgetEnforce { observed, caps } => {
                let req = BudgetEnforceRequest {
                    sources: observed.sources(),
                    limits: caps.limits(),
                };
                budget_enforce_command(&req)
            }
            SessionCommand::BudgetPlan { root, goal, agent, profile, budget, topology, from_state } => {
                let d = BudgetPlanRequest::default();
                let req = BudgetPlanRequest {
                    project_root: root.root(),
                    goal: goal.unwrap_or(d.goal),
                    agent: agent.unwrap_or(d.agent),
                    profile: text(profile),
                    budget: budget.unwrap_or(d.budget),
                    topology: topology.unwrap_or(d.topology),
                    from_state: text(from_state),
                };
                budget_plan_command(engine, &req)
            }
            SessionCommand::Replay { from_checkpoint, root } => {
                let req = ReplayRequest {
                    from_checkpoint: text(from_checkpoint),
                    project_root: root.root(),
                };
                replay_command(engine, &req)
            }
            SessionCommand::Anomaly { target, events, auto_remediate } => {
                let d = AnomalyRequest::default();
                let req = AnomalyRequest {
                    target: target.target(),
                    events: events.unwrap_or(d.events),
                    auto_remediate,
                };
                anomaly_command(engine, &req)
            }
            SessionCommand::Loop {
                target,
                poll,
                pack,
                cursor_file,
                handoff_cursor_file,
                schema,
                steps,
                caps,
                min,
            } => {
                let d = LoopRequest::default();
                let req = LoopRequest {
                    target: target.target(),
                    poll_interval: poll.poll_interval.unwrap_or(d.poll_interval),
                    max_polls: poll.max_polls.unwrap_or(d.max_polls),
                    strategy: pack.strategy_or(d.strategy),
                    events: pack.events.unwrap_or(d.events),
                    lines: pack.lines.unwrap_or(d.lines),
                    token_budget: pack.token_budget.unwrap_or(d.token_budget),
                    cursor_file: text(cursor_file),
                    handoff_cursor_file: text(handoff_cursor_file),
                    schema: schema.unwrap_or(d.schema),
                    steps: steps.unwrap_or(d.steps),
                    limits: caps.limits(),
                    json_min: min.json_min,
                };
                loop_command(engine, &InProcessRunner::new(engine), &req)
            }
            SessionCommand::Turn {
                target,
                input,
                hints,
                poll,
                wait,
                lines,
                events,
                token_budget,
                summary_style,
                cursor_file,
                fields,
                min,
            } => {
                let req = TurnRequest {
                    target: target.target(),
                    text: text(input.text),
                    keys: text(input.keys),
                    enter: input.enter,
                    agent_hint: text(hints.agent),
                    mode_hint: text(hints.mode),
                    expect: text(wait.expect),
                    poll_interval: poll.poll_interval.unwrap_or(0),
                    max_polls: poll.max_polls.unwrap_or(0),
                    timeout_seconds: wait.timeout_seconds.unwrap_or(0),
                    stop_on_waiting: wait.stop_on_waiting,
                    waiting_requires_turn_complete: wait.waiting_requires_turn_complete,
                    until_marker: text(wait.until_marker),
                    until_state: text(wait.until_state),
                    lines: lines.unwrap_or(0),
                    events: events.unwrap_or(0),
                    token_budget: token_budget.unwrap_or(0),
                    summary_style: text(summary_style),
                    cursor_file: text(cursor_file),
                    fields: text(fields),
                    json_min: min.json_min,
                };
                turn_command(engine, &InProcessRunner::new(engine), &req)
            }
            SessionCommand::Schema { command } => schema_command(command.as_deref().unwrap_or("")),
            SessionCommand::ContractCheck { root, skill_doc, min } => {
                let req = ContractCheckRequest {
                    project_root: root.root(),
                    skill_doc: text(skill_doc),
                    json_min: min.json_min,
                };
                contract_check_command(engine, &req)
            }
            SessionCommand::StateSandbox { action_arg, action, root, file, min } => {
                let req = SandboxRequest {
                    action: pick_action(action_arg, action, String::new()),
                    project_root: root.root(),
                    file: text(file),
                    json_min: min.json_min,
                };
                state_sandbox_command(engine, &req)
            }
            SessionCommand::PromptLint {
                root,
                hints,
                nested_policy,
                nesting_intent,
                prompt,
                model,
                markers,
                budget,
                strict,
                rewrite,
            } => {
                let d = PromptLintRequest::default();
                let req = PromptLintRequest {
                    project_root: root.root(),
                    agent: hints.agent_or(d.agent),
                    mode: hints.mode_or(d.mode),
                    nested_policy: nested_policy.unwrap_or(d.nested_policy),
                    nesting_intent: nesting_intent.unwrap_or(d.nesting_intent),
                    prompt: text(prompt),
                    model: text(model),
                    markers: text(markers),
                    budget: budget.unwrap_or(d.budget),
                    strict,
                    rewrite,
                };
                prompt_lint_command(engine, &req)
            }
        }
    }
}
