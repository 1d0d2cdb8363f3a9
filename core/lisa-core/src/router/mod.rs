//! `session route`: maps a high-level goal to a concrete agent command.
//!
//! Routing never touches a live session except when `--queue` asks for
//! the current priority order. Everything else (defaults, nested bypass,
//! cost model, topology, runbook) is computed from flags and registries.
//!
//! # Module Structure
//!
//! - [`nested`]: nested-bypass detection, model flags, agent command lines
//! - [`cost`]: topology roles, graph, per-step cost estimate
//! - [`runbook`]: the spawn-to-cleanup command sequence
//! - [`queue`]: session priority queue and dispatch waves
//! - [`prompt_lint`]: the `session prompt-lint` command

pub mod cost;
pub mod nested;
pub mod prompt_lint;
pub mod queue;
pub mod runbook;

pub use cost::{build_topology_graph, estimate_route_cost, parse_topology_roles, CostEstimate, TopologyRole};
pub use nested::{
    apply_model_to_agent_args, apply_nested_policy, build_agent_command, detect_nested_bypass, parse_model,
    NestedDetection, NestedPolicy, NestingIntent,
};
pub use prompt_lint::{prompt_lint_command, PromptLintRequest};
pub use queue::{build_dispatch_plan, build_route_queue, compute_session_priority, QueueItem, QueueSpec};
pub use runbook::{build_route_runbook, Runbook, RunbookSpec};

use crate::command::{obj, run};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::meta::{parse_agent, parse_mode};
use crate::payload::read_text_source;
use crate::registry::lane::load_lane_record;
use lisa_protocol::{str_field, CommandOutput, Payload};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

pub const DEFAULT_ROUTE_MODEL: &str = "gpt-5.3-codex-spark";

// ═══════════════════════════════════════════════════════════════════════════════
// Goals
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteGoal {
    #[default]
    Analysis,
    Exec,
    Nested,
}

/// Mode, policy, intent, prompt and model a goal implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDefaults {
    pub mode: &'static str,
    pub nested_policy: NestedPolicy,
    pub nesting_intent: NestingIntent,
    pub prompt: &'static str,
    pub model: &'static str,
}

impl RouteGoal {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "analysis" => Ok(Self::Analysis),
            "exec" | "execution" => Ok(Self::Exec),
            "nested" => Ok(Self::Nested),
            _ => Err(LisaError::invalid(
                "invalid_goal",
                format!("invalid --goal: {raw} (expected nested|analysis|exec)"),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Exec => "exec",
            Self::Nested => "nested",
        }
    }

    pub fn defaults(&self) -> RouteDefaults {
        match self {
            Self::Nested => RouteDefaults {
                mode: "exec",
                nested_policy: NestedPolicy::Force,
                nesting_intent: NestingIntent::Nested,
                prompt: "Create nested lisa workers and report markers.",
                model: DEFAULT_ROUTE_MODEL,
            },
            Self::Exec => RouteDefaults {
                mode: "exec",
                nested_policy: NestedPolicy::Off,
                nesting_intent: NestingIntent::Neutral,
                prompt: "Run the task and return concise final output.",
                model: DEFAULT_ROUTE_MODEL,
            },
            Self::Analysis => RouteDefaults {
                mode: "interactive",
                nested_policy: NestedPolicy::Off,
                nesting_intent: NestingIntent::Neutral,
                prompt: "Analyze current task and propose next concrete actions.",
                model: DEFAULT_ROUTE_MODEL,
            },
        }
    }
}

/// `(agent, model)` for a named profile.
pub fn parse_route_profile(raw: &str) -> Result<(&'static str, &'static str)> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "codex-spark" => Ok(("codex", DEFAULT_ROUTE_MODEL)),
        "claude" => Ok(("claude", "")),
        _ => Err(LisaError::invalid(
            "invalid_profile",
            format!("invalid --profile: {raw} (expected codex-spark|claude)"),
        )),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Continuation State
// ═══════════════════════════════════════════════════════════════════════════════

/// Session state read from a prior status or handoff payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStateInput {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub session: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub session_state: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub next_action: String,
}

fn field_text(map: &Payload, key: &str) -> String {
    match map.get(key) {
        Some(Value::Object(inner)) => str_field(inner, "name").trim().to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

impl RouteStateInput {
    /// Accepts flat status/handoff payloads and the nested `state{}` layout
    /// of handoff v2+.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| LisaError::invalid("invalid_from_state", format!("failed to load --from-state: {e}")))?;
        let Value::Object(map) = value else {
            return Err(LisaError::invalid(
                "invalid_from_state",
                "failed to load --from-state: expected a JSON object",
            ));
        };
        let nested = match map.get("state") {
            Some(Value::Object(inner)) => inner.clone(),
            _ => Payload::new(),
        };
        let pick = |key: &str| {
            let flat = field_text(&map, key);
            if flat.is_empty() {
                field_text(&nested, key)
            } else {
                flat
            }
        };
        let mut input = Self {
            session: pick("session"),
            status: pick("status"),
            session_state: pick("sessionState"),
            reason: pick("reason"),
            next_action: field_text(&map, "nextAction"),
        };
        if input.reason.is_empty() {
            input.reason = pick("classificationReason");
        }
        if input.status.is_empty() {
            input.status = input.session_state.clone();
        }
        if input.session.is_empty()
            && input.session_state.is_empty()
            && input.reason.is_empty()
            && input.next_action.is_empty()
        {
            return Err(LisaError::invalid(
                "invalid_from_state",
                "failed to load --from-state: payload missing session/state fields",
            ));
        }
        Ok(input)
    }

    /// Continuation prompt; `fallback` when the input carries nothing.
    pub fn prompt(&self, fallback: &str) -> String {
        let labelled = [
            ("Session: ", &self.session),
            ("State: ", &self.session_state),
            ("Reason: ", &self.reason),
            ("Recommended next action: ", &self.next_action),
        ];
        if labelled.iter().all(|(_, v)| v.is_empty()) {
            return fallback.to_string();
        }
        let mut lines = vec!["Continue orchestration from existing state context.".to_string()];
        lines.extend(
            labelled
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(label, v)| format!("{label}{v}")),
        );
        lines.push("Return concrete next steps.".to_string());
        lines.join("\n")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Route Command
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub project_root: String,
    pub goal: String,
    pub agent: String,
    pub lane: String,
    pub prompt: String,
    pub model: String,
    pub profile: String,
    pub budget: i64,
    pub emit_runbook: bool,
    pub queue: bool,
    /// Comma-separated queue sessions; empty enumerates the project.
    pub sessions: String,
    pub queue_limit: usize,
    pub concurrency: usize,
    pub topology: String,
    pub cost_estimate: bool,
    /// Path or `-` for a status/handoff JSON payload.
    pub from_state: String,
}

impl Default for RouteRequest {
    fn default() -> Self {
        Self {
            project_root: String::new(),
            goal: "analysis".into(),
            agent: "codex".into(),
            lane: String::new(),
            prompt: String::new(),
            model: String::new(),
            profile: String::new(),
            budget: 0,
            emit_runbook: false,
            queue: false,
            sessions: String::new(),
            queue_limit: 0,
            concurrency: 1,
            topology: String::new(),
            cost_estimate: false,
            from_state: String::new(),
        }
    }
}

/// Flags after lane and profile presets are folded in.
#[derive(Debug, Clone, Default)]
struct RoutePlan {
    goal: String,
    agent: String,
    prompt: String,
    model: String,
    budget: i64,
    topology: String,
    lane_mode: String,
    lane_nested_policy: String,
    lane_nesting_intent: String,
}

fn apply_lane(engine: &Engine, root: &str, lane: &str, plan: &mut RoutePlan) -> Result<()> {
    let record = load_lane_record(engine, root, lane)
        .map_err(|e| LisaError::coded("lane_load_failed", format!("failed loading lane {lane:?}: {e}")))?
        .ok_or_else(|| LisaError::LaneNotFound(lane.to_string()))?;
    let set = |slot: &mut String, value: &str, only_if_empty: bool| {
        if !value.trim().is_empty() && (!only_if_empty || slot.trim().is_empty()) {
            *slot = value.to_string();
        }
    };
    set(&mut plan.goal, &record.goal, false);
    set(&mut plan.agent, &record.agent, false);
    set(&mut plan.prompt, &record.prompt, true);
    set(&mut plan.model, &record.model, true);
    set(&mut plan.topology, &record.topology, true);
    set(&mut plan.lane_mode, &record.mode, false);
    set(&mut plan.lane_nested_policy, &record.nested_policy, false);
    set(&mut plan.lane_nesting_intent, &record.nesting_intent, false);
    if record.budget > 0 && plan.budget <= 0 {
        plan.budget = record.budget;
    }
    debug!(lane = %lane, "applied lane presets to route");
    Ok(())
}

fn relabel(err: LisaError, code: &str, prefix: &str) -> LisaError {
    LisaError::invalid(code, format!("{prefix}: {err}"))
}

pub fn route_command(engine: &Engine, req: &RouteRequest) -> CommandOutput {
    run(|| {
        if req.concurrency == 0 {
            return Err(LisaError::invalid("invalid_concurrency", "invalid --concurrency: must be > 0"));
        }
        if req.budget < 0 {
            return Err(LisaError::invalid("invalid_budget", "invalid --budget: must be > 0"));
        }
        RouteGoal::parse(&req.goal)?;
        parse_agent(&req.agent)?;
        let root = engine.canonical_root(&req.project_root);
        let lane = req.lane.trim().to_lowercase();

        let mut plan = RoutePlan {
            goal: req.goal.clone(),
            agent: req.agent.clone(),
            prompt: req.prompt.clone(),
            model: req.model.clone(),
            budget: req.budget,
            topology: req.topology.trim().to_string(),
            ..RoutePlan::default()
        };
        if !lane.is_empty() {
            apply_lane(engine, &root, &lane, &mut plan)?;
        }
        let profile = req.profile.trim();
        if !profile.is_empty() {
            let (agent, model) = parse_route_profile(profile)?;
            plan.agent = agent.to_string();
            if plan.model.trim().is_empty() {
                plan.model = model.to_string();
            }
        }
        let goal = RouteGoal::parse(&plan.goal)?;
        let agent = parse_agent(&plan.agent)?;

        let defaults = goal.defaults();
        let mode = if plan.lane_mode.is_empty() {
            defaults.mode.to_string()
        } else {
            parse_mode(&plan.lane_mode).map_err(|e| relabel(e, "invalid_lane_mode", "invalid lane mode"))?
        };
        let nested_policy = if plan.lane_nested_policy.is_empty() {
            defaults.nested_policy
        } else {
            NestedPolicy::parse(&plan.lane_nested_policy)
                .map_err(|e| relabel(e, "invalid_lane_nested_policy", "invalid lane nested policy"))?
        };
        let nesting_intent = if plan.lane_nesting_intent.is_empty() {
            defaults.nesting_intent
        } else {
            NestingIntent::parse(&plan.lane_nesting_intent)
                .map_err(|e| relabel(e, "invalid_lane_nesting_intent", "invalid lane nesting intent"))?
        };
        let roles = parse_topology_roles(&plan.topology)?;

        let from_state = if req.from_state.trim().is_empty() {
            None
        } else {
            let raw = read_text_source("--from-state", "invalid_from_state", req.from_state.trim())?;
            Some(RouteStateInput::parse(&raw)?)
        };
        let prompt = if plan.prompt.trim().is_empty() {
            match &from_state {
                Some(state) => state.prompt(defaults.prompt),
                None => defaults.prompt.to_string(),
            }
        } else {
            plan.prompt.clone()
        };
        // The default model is a codex model; claude routes keep their own.
        let model = parse_model(match plan.model.trim() {
            "" if agent == "codex" => defaults.model,
            explicit => explicit,
        })?;

        let agent_args = apply_model_to_agent_args(&agent, "", &model)?;
        let (detection, effective_args) =
            apply_nested_policy(&agent, &mode, &prompt, &agent_args, nested_policy, nesting_intent)?;
        let command = build_agent_command(&agent, &mode, &prompt, &effective_args, true)
            .map_err(|e| LisaError::coded("build_command_failed", e.to_string()))?;

        let mut rationale = vec![
            format!("goal={}", goal.as_str()),
            format!("mode={mode}"),
            format!("nested_policy={}", nested_policy.as_str()),
            format!("nesting_intent={}", nesting_intent.as_str()),
        ];
        if !model.is_empty() {
            rationale.push(format!("model={model}"));
        }
        rationale.push(format!("nested_reason={}", detection.reason));
        if plan.budget > 0 {
            rationale.push(format!("budget={}", plan.budget));
        }
        if !roles.is_empty() {
            let names: Vec<&str> = roles.iter().map(TopologyRole::as_str).collect();
            rationale.push(format!("topology={}", names.join(",")));
        }
        let monitor_hint = if mode == "interactive" {
            "session monitor --stop-on-waiting true --json"
        } else {
            "session monitor --expect terminal --json"
        };

        let mut payload = obj(json!({
            "goal": goal.as_str(),
            "projectRoot": root,
            "agent": agent,
            "mode": mode,
            "nestedPolicy": nested_policy.as_str(),
            "nestingIntent": nesting_intent.as_str(),
            "prompt": prompt,
            "model": model,
            "profile": profile,
            "command": command,
            "monitorHint": monitor_hint,
            "nestedDetection": detection,
            "rationale": rationale,
            "concurrency": req.concurrency,
        }));
        if !lane.is_empty() {
            payload.insert("lane".into(), json!(lane));
        }
        if plan.budget > 0 {
            payload.insert("budget".into(), json!(plan.budget));
        }
        if let Some(state) = &from_state {
            payload.insert("fromState".into(), json!(state));
        }
        if req.emit_runbook {
            let spec = RunbookSpec {
                project_root: &root,
                agent: &agent,
                mode: &mode,
                nested_policy: nested_policy.as_str(),
                nesting_intent: nesting_intent.as_str(),
                prompt: &prompt,
                model: &model,
                budget: plan.budget,
            };
            payload.insert("runbook".into(), json!(build_route_runbook(&spec)));
        }
        if req.queue {
            let spec = QueueSpec {
                project_root: &root,
                sessions: &req.sessions,
                limit: req.queue_limit,
                budget: plan.budget,
                concurrency: req.concurrency,
            };
            let items = build_route_queue(engine, &spec)?;
            let warnings: Vec<String> = items
                .iter()
                .filter(|item| item.session_state == "ambiguous_project_root")
                .map(|item| format!("session={} {}", item.session, item.reason))
                .collect();
            if !warnings.is_empty() {
                payload.insert("warnings".into(), json!(warnings));
            }
            payload.insert("dispatchPlan".into(), json!(build_dispatch_plan(&items, req.concurrency)));
            payload.insert("queueCount".into(), json!(items.len()));
            payload.insert("queue".into(), json!(items));
        }
        if !roles.is_empty() {
            payload.insert("topology".into(), json!(build_topology_graph(&roles)));
        }
        if req.cost_estimate {
            payload.insert(
                "costEstimate".into(),
                json!(estimate_route_cost(goal.as_str(), &mode, plan.budget, &roles)),
            );
        }
        Ok(CommandOutput::ok(payload))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Target;
    use crate::registry::lane::{lane_command, LaneRecord, LaneRequest};
    use chrono::Utc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Engine) {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        (tmp, engine)
    }

    fn route(engine: &Engine, req: RouteRequest) -> CommandOutput {
        route_command(
            engine,
            &RouteRequest {
                project_root: "/repo".into(),
                ..req
            },
        )
    }

    #[test]
    fn test_goal_defaults() {
        let (_tmp, engine) = setup();
        let out = route(&engine, RouteRequest::default());
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        assert_eq!(out.payload["mode"], "interactive");
        assert_eq!(out.payload["model"], DEFAULT_ROUTE_MODEL);
        assert_eq!(out.payload["monitorHint"], "session monitor --stop-on-waiting true --json");

        let out = route(
            &engine,
            RouteRequest {
                goal: "nested".into(),
                ..RouteRequest::default()
            },
        );
        assert_eq!(out.payload["nestedPolicy"], "force");
        assert_eq!(out.payload["nestedDetection"]["autoBypass"], true);
        let command = str_field(&out.payload, "command");
        assert!(command.contains(nested::BYPASS_FLAG), "{command}");
        assert!(!command.contains("--full-auto"));
    }

    #[test]
    fn test_profile_and_invalid_flags() {
        let (_tmp, engine) = setup();
        let out = route(
            &engine,
            RouteRequest {
                profile: "claude".into(),
                model: String::new(),
                ..RouteRequest::default()
            },
        );
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        assert_eq!(out.payload["agent"], "claude");
        assert_eq!(out.payload["model"], "");
        assert!(str_field(&out.payload, "command").starts_with("claude --dangerously-skip-permissions"));

        let out = route(
            &engine,
            RouteRequest {
                profile: "claude".into(),
                model: "opus".into(),
                ..RouteRequest::default()
            },
        );
        assert_eq!(out.error_code(), Some("invalid_model_configuration"));

        let out = route(
            &engine,
            RouteRequest {
                goal: "dance".into(),
                ..RouteRequest::default()
            },
        );
        assert_eq!(out.error_code(), Some("invalid_goal"));
        let out = route(
            &engine,
            RouteRequest {
                profile: "gpt".into(),
                ..RouteRequest::default()
            },
        );
        assert_eq!(out.error_code(), Some("invalid_profile"));
    }

    #[test]
    fn test_lane_presets_and_missing_lane() {
        let (_tmp, engine) = setup();
        let out = route(
            &engine,
            RouteRequest {
                lane: "ghost".into(),
                ..RouteRequest::default()
            },
        );
        assert_eq!(out.error_code(), Some("lane_not_found"));

        let saved = lane_command(
            &engine,
            &LaneRequest {
                target: Target::new("", "/repo"),
                name: "review".into(),
                fields: LaneRecord {
                    goal: "exec".into(),
                    prompt: "Review the diff.".into(),
                    budget: 400,
                    topology: "planner,reviewer".into(),
                    ..LaneRecord::default()
                },
                clear: false,
                list: false,
            },
        );
        assert_eq!(saved.exit_code, 0, "{:?}", saved.payload);
        let out = route(
            &engine,
            RouteRequest {
                lane: "Review".into(),
                cost_estimate: true,
                emit_runbook: true,
                ..RouteRequest::default()
            },
        );
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        assert_eq!(out.payload["lane"], "review");
        assert_eq!(out.payload["goal"], "exec");
        assert_eq!(out.payload["prompt"], "Review the diff.");
        assert_eq!(out.payload["budget"], 400);
        assert_eq!(out.payload["topology"]["edges"].as_array().unwrap().len(), 1);
        assert_eq!(out.payload["costEstimate"]["topologyMultiplier"], "1.45");
        assert_eq!(out.payload["runbook"]["steps"].as_array().unwrap().len(), 7);
    }

    #[test]
    fn test_from_state_prompt() {
        let (tmp, engine) = setup();
        let path = tmp.path().join("handoff.json");
        std::fs::write(
            &path,
            r#"{"session":"s1","state":{"sessionState":"stuck","reason":"output_stale"},"nextAction":{"name":"session explain"}}"#,
        )
        .unwrap();
        let out = route(
            &engine,
            RouteRequest {
                from_state: path.to_string_lossy().into_owned(),
                ..RouteRequest::default()
            },
        );
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        let prompt = str_field(&out.payload, "prompt");
        assert!(prompt.starts_with("Continue orchestration"));
        assert!(prompt.contains("State: stuck"));
        assert!(prompt.contains("Recommended next action: session explain"));
        assert_eq!(out.payload["fromState"]["status"], "stuck");
    }

    #[test]
    fn test_from_state_rejects_empty_payload() {
        assert_eq!(
            RouteStateInput::parse("{}").unwrap_err().code(),
            "invalid_from_state"
        );
        assert_eq!(RouteStateInput::default().prompt("fallback"), "fallback");
    }

    #[test]
    fn test_queue_payload() {
        let (_tmp, engine) = setup();
        let out = route(
            &engine,
            RouteRequest {
                queue: true,
                sessions: "a,b,c".into(),
                concurrency: 2,
                ..RouteRequest::default()
            },
        );
        assert_eq!(out.payload["queueCount"], 3);
        assert_eq!(out.payload["dispatchPlan"].as_array().unwrap().len(), 2);
        assert_eq!(out.payload["queue"][0]["nextAction"], "session spawn");
    }
}
