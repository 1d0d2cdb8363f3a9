//! Run budgets: `session budget-observe`, `budget-enforce` and `budget-plan`.
//!
//! Observed usage is `{tokens, seconds, steps}`. Values come from flags and
//! from JSON payloads produced by other commands (loop output, cost
//! estimates, runtime metrics logs); the largest value seen per metric wins.

use crate::command::{obj, run};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::meta::parse_agent;
use crate::payload::{load_json_object, parse_comma_values, parse_latest_json_object, read_text_source};
use crate::registry::objective::current_objective;
use crate::router::{
    build_route_runbook, estimate_route_cost, parse_route_profile, parse_topology_roles, RouteGoal,
    RouteStateInput, RunbookSpec,
};
use lisa_protocol::{CommandOutput, Payload};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BudgetObserved {
    pub tokens: i64,
    pub seconds: i64,
    pub steps: i64,
}

impl BudgetObserved {
    /// Starts from explicit flag values; unset metrics start at zero.
    pub fn from_flags(tokens: Option<i64>, seconds: Option<i64>, steps: Option<i64>) -> Self {
        Self {
            tokens: tokens.unwrap_or(0).max(0),
            seconds: seconds.unwrap_or(0).max(0),
            steps: steps.unwrap_or(0).max(0),
        }
    }

    /// Folds in the usage a payload reports.
    ///
    /// Reads `tokens`/`totalTokens`, `seconds`/`totalSeconds`,
    /// `totalSteps`, the length of a `steps` array, and the same fields of
    /// a nested `costEstimate`.
    pub fn absorb(&mut self, payload: &Payload) {
        for key in ["totalTokens", "tokens"] {
            if let Some(n) = payload.get(key).and_then(number_from_value) {
                self.tokens = self.tokens.max(n);
            }
        }
        for key in ["totalSeconds", "seconds"] {
            if let Some(n) = payload.get(key).and_then(number_from_value) {
                self.seconds = self.seconds.max(n);
            }
        }
        if let Some(n) = payload.get("totalSteps").and_then(number_from_value) {
            self.steps = self.steps.max(n);
        }
        if let Some(Value::Array(steps)) = payload.get("steps") {
            self.steps = self.steps.max(steps.len() as i64);
        }
        if let Some(Value::Object(cost)) = payload.get("costEstimate") {
            if let Some(n) = cost.get("totalTokens").and_then(number_from_value) {
                self.tokens = self.tokens.max(n);
            }
            if let Some(n) = cost.get("totalSeconds").and_then(number_from_value) {
                self.seconds = self.seconds.max(n);
            }
            if let Some(Value::Array(steps)) = cost.get("steps") {
                self.steps = self.steps.max(steps.len() as i64);
            }
        }
    }
}

/// Integer view of a JSON number or numeric string.
pub fn number_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Caps; zero disables a metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetLimits {
    pub max_tokens: i64,
    pub max_seconds: i64,
    pub max_steps: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetViolation {
    pub metric: &'static str,
    pub observed: i64,
    pub limit: i64,
}

impl BudgetLimits {
    pub fn is_empty(&self) -> bool {
        self.max_tokens <= 0 && self.max_seconds <= 0 && self.max_steps <= 0
    }

    fn check(&self, observed: &BudgetObserved, breached: impl Fn(i64, i64) -> bool) -> Vec<BudgetViolation> {
        [
            ("tokens", observed.tokens, self.max_tokens),
            ("seconds", observed.seconds, self.max_seconds),
            ("steps", observed.steps, self.max_steps),
        ]
        .into_iter()
        .filter(|&(_, value, limit)| limit > 0 && breached(value, limit))
        .map(|(metric, observed, limit)| BudgetViolation { metric, observed, limit })
        .collect()
    }

    /// Metrics strictly over their cap.
    pub fn exceeded_by(&self, observed: &BudgetObserved) -> Vec<BudgetViolation> {
        self.check(observed, |value, limit| value > limit)
    }

    /// Metrics at or over their cap. Loops stop as soon as a cap is reached.
    pub fn reached_by(&self, observed: &BudgetObserved) -> Vec<BudgetViolation> {
        self.check(observed, |value, limit| value >= limit)
    }
}

/// Where observed usage is read from, besides explicit flags.
#[derive(Debug, Clone, Default)]
pub struct ObservedSources {
    /// Comma-separated JSON files (`-` is stdin).
    pub from: String,
    /// A log whose last JSON-bearing line holds the metrics.
    pub from_jsonl: String,
    pub tokens: Option<i64>,
    pub seconds: Option<i64>,
    pub steps: Option<i64>,
}

impl ObservedSources {
    fn validate(&self) -> Result<()> {
        for (flag, value) in [("tokens", self.tokens), ("seconds", self.seconds), ("steps", self.steps)] {
            if matches!(value, Some(n) if n <= 0) {
                return Err(LisaError::invalid(
                    &format!("invalid_{flag}"),
                    format!("invalid --{flag}: must be > 0"),
                ));
            }
        }
        Ok(())
    }

    fn collect(&self) -> Result<(BudgetObserved, Vec<String>)> {
        self.validate()?;
        let mut observed = BudgetObserved::from_flags(self.tokens, self.seconds, self.steps);
        let mut sources = Vec::new();
        for source in parse_comma_values(&self.from) {
            let payload = load_json_object("--from", "invalid_from", &source)?;
            observed.absorb(&payload);
            sources.push(source);
        }
        let jsonl = self.from_jsonl.trim();
        if !jsonl.is_empty() {
            let raw = read_text_source("--from-jsonl", "invalid_from_jsonl", jsonl)?;
            let payload = parse_latest_json_object(&raw).ok_or_else(|| {
                LisaError::invalid(
                    "invalid_from_jsonl",
                    format!("failed loading --from-jsonl: no JSON object found in {jsonl}"),
                )
            })?;
            observed.absorb(&payload);
            sources.push(jsonl.to_string());
        }
        debug!(?observed, sources = sources.len(), "collected observed budget");
        Ok((observed, sources))
    }
}

pub fn budget_observe_command(sources: &ObservedSources) -> CommandOutput {
    run(|| {
        let (observed, from) = sources.collect()?;
        Ok(CommandOutput::ok(obj(json!({
            "ok": true,
            "sources": from,
            "observed": observed,
        }))))
    })
}

#[derive(Debug, Clone, Default)]
pub struct BudgetEnforceRequest {
    pub sources: ObservedSources,
    pub limits: BudgetLimits,
}

pub fn budget_enforce_command(req: &BudgetEnforceRequest) -> CommandOutput {
    run(|| {
        if req.limits.is_empty() {
            return Err(LisaError::invalid(
                "missing_budget_limits",
                "at least one max limit is required",
            ));
        }
        let (observed, _) = req.sources.collect()?;
        let violations = req.limits.exceeded_by(&observed);
        let ok = violations.is_empty();
        let mut payload = obj(json!({
            "ok": ok,
            "observed": observed,
            "limits": req.limits,
            "violations": violations,
        }));
        if !ok {
            payload.insert("errorCode".into(), json!("budget_limit_exceeded"));
            payload.insert("error".into(), json!("budget limit exceeded"));
            return Ok(CommandOutput::with_exit(payload, 1));
        }
        Ok(CommandOutput::ok(payload))
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Budget Plan
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct BudgetPlanRequest {
    pub project_root: String,
    pub goal: String,
    pub agent: String,
    pub profile: String,
    /// 0 falls back to the current objective's budget.
    pub budget: i64,
    pub topology: String,
    pub from_state: String,
}

impl Default for BudgetPlanRequest {
    fn default() -> Self {
        Self {
            project_root: String::new(),
            goal: "analysis".into(),
            agent: "codex".into(),
            profile: String::new(),
            budget: 0,
            topology: String::new(),
            from_state: String::new(),
        }
    }
}

/// Cost estimate plus hard-stop caps: tokens +15% (never above the
/// budget), seconds +35%, steps +2.
pub fn budget_plan_command(engine: &Engine, req: &BudgetPlanRequest) -> CommandOutput {
    run(|| {
        if req.budget < 0 {
            return Err(LisaError::invalid("invalid_budget", "invalid --budget: must be > 0"));
        }
        let goal = RouteGoal::parse(&req.goal)?;
        let mut agent = parse_agent(&req.agent)?;
        let profile = req.profile.trim();
        if !profile.is_empty() {
            agent = parse_route_profile(profile)?.0.to_string();
        }
        let roles = parse_topology_roles(&req.topology)?;
        let root = engine.canonical_root(&req.project_root);

        let defaults = goal.defaults();
        let from_state = match req.from_state.trim() {
            "" => None,
            source => {
                let raw = read_text_source("--from-state", "invalid_from_state", source)?;
                Some(RouteStateInput::parse(&raw)?)
            }
        };
        let prompt = match &from_state {
            Some(state) => state.prompt(defaults.prompt),
            None => defaults.prompt.to_string(),
        };
        let mut budget = req.budget;
        if budget == 0 {
            if let Some(objective) = current_objective(engine, &root) {
                budget = objective.budget.max(0);
            }
        }

        let cost = estimate_route_cost(goal.as_str(), defaults.mode, budget, &roles);
        let mut max_tokens = (cost.total_tokens.max(1) as f64 * 1.15) as i64;
        if budget > 0 {
            max_tokens = max_tokens.min(budget);
        }
        let max_seconds = (cost.total_seconds.max(1) as f64 * 1.35) as i64;
        let max_steps = cost.steps.len() as i64 + 2;
        let enforce_command = format!(
            "./lisa session budget-enforce --max-tokens {max_tokens} --max-seconds {max_seconds} --max-steps {max_steps} --from \"$RUNTIME_METRICS_JSON\" --json"
        );
        let model = if agent == "codex" { defaults.model } else { "" };
        let runbook = build_route_runbook(&RunbookSpec {
            project_root: &root,
            agent: &agent,
            mode: defaults.mode,
            nested_policy: defaults.nested_policy.as_str(),
            nesting_intent: defaults.nesting_intent.as_str(),
            prompt: &prompt,
            model,
            budget,
        });

        let mut payload = obj(json!({
            "goal": goal.as_str(),
            "agent": agent,
            "mode": defaults.mode,
            "projectRoot": root,
            "profile": profile,
            "budget": budget,
            "topologyRoles": roles,
            "costEstimate": cost,
            "hardStop": {
                "maxTokens": max_tokens,
                "maxSeconds": max_seconds,
                "maxSteps": max_steps,
                "enforceCommand": enforce_command,
            },
            "runbook": runbook,
        }));
        if let Some(state) = from_state {
            payload.insert("fromState".into(), json!(state));
        }
        Ok(CommandOutput::ok(payload))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Target;
    use crate::registry::objective::{objective_command, ObjectiveRequest};
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_enforce_reports_token_violation() {
        let req = BudgetEnforceRequest {
            sources: ObservedSources {
                tokens: Some(120),
                seconds: Some(33),
                steps: Some(2),
                ..ObservedSources::default()
            },
            limits: BudgetLimits {
                max_tokens: 100,
                ..BudgetLimits::default()
            },
        };
        let out = budget_enforce_command(&req);
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("budget_limit_exceeded"));
        assert_eq!(out.payload["ok"], false);
        assert_eq!(
            out.payload["violations"],
            json!([{"metric": "tokens", "observed": 120, "limit": 100}])
        );
    }

    #[test]
    fn test_enforce_requires_a_limit() {
        let out = budget_enforce_command(&BudgetEnforceRequest::default());
        assert_eq!(out.error_code(), Some("missing_budget_limits"));
    }

    #[test]
    fn test_enforce_at_limit_passes() {
        let req = BudgetEnforceRequest {
            sources: ObservedSources {
                steps: Some(3),
                ..ObservedSources::default()
            },
            limits: BudgetLimits {
                max_steps: 3,
                ..BudgetLimits::default()
            },
        };
        assert_eq!(budget_enforce_command(&req).exit_code, 0);
    }

    #[test]
    fn test_reached_by_is_inclusive() {
        let limits = BudgetLimits {
            max_steps: 2,
            ..BudgetLimits::default()
        };
        let observed = BudgetObserved {
            steps: 2,
            ..BudgetObserved::default()
        };
        assert_eq!(limits.reached_by(&observed).len(), 1);
        assert!(limits.exceeded_by(&observed).is_empty());
    }

    #[test]
    fn test_observe_reads_payload_and_jsonl() {
        let tmp = TempDir::new().unwrap();
        let from = tmp.path().join("cost.json");
        std::fs::write(
            &from,
            r#"{"costEstimate":{"totalTokens":700,"totalSeconds":"44","steps":[1,2,3]}}"#,
        )
        .unwrap();
        let log = tmp.path().join("run.log");
        std::fs::write(&log, "noise\nTRACE {\"tokens\":900,\"seconds\":7}\ntrailing\n").unwrap();

        let out = budget_observe_command(&ObservedSources {
            from: from.to_string_lossy().into_owned(),
            from_jsonl: log.to_string_lossy().into_owned(),
            steps: Some(1),
            ..ObservedSources::default()
        });
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.payload["observed"], json!({"tokens": 900, "seconds": 44, "steps": 3}));
        assert_eq!(out.payload["sources"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_observe_rejects_zero_flag() {
        let out = budget_observe_command(&ObservedSources {
            seconds: Some(0),
            ..ObservedSources::default()
        });
        assert_eq!(out.error_code(), Some("invalid_seconds"));
    }

    #[test]
    fn test_plan_caps_tokens_at_budget() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let out = budget_plan_command(
            &engine,
            &BudgetPlanRequest {
                project_root: "/repo".into(),
                goal: "exec".into(),
                budget: 300,
                ..BudgetPlanRequest::default()
            },
        );
        assert_eq!(out.exit_code, 0);
        let hard = &out.payload["hardStop"];
        assert_eq!(hard["maxTokens"], 300);
        assert_eq!(hard["maxSteps"], 8);
        assert!(hard["enforceCommand"].as_str().unwrap().contains("--max-tokens 300"));
        assert_eq!(out.payload["mode"], "exec");
    }

    #[test]
    fn test_plan_uses_objective_budget() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let set = objective_command(
            &engine,
            &ObjectiveRequest {
                target: Target::new("", "/repo"),
                id: "ship".into(),
                goal: "ship it".into(),
                budget: 200,
                ..ObjectiveRequest::default()
            },
        );
        assert_eq!(set.exit_code, 0, "{:?}", set.payload);
        let out = budget_plan_command(
            &engine,
            &BudgetPlanRequest {
                project_root: "/repo".into(),
                ..BudgetPlanRequest::default()
            },
        );
        assert_eq!(out.payload["budget"], 200);
        assert_eq!(out.payload["hardStop"]["maxTokens"], 200);
    }
}
