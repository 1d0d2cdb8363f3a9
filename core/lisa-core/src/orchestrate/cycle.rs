//! `session loop`: repeated monitor, diff-pack, handoff, next rounds.

use super::{step_text, StepArgs, StepRunner};
use crate::budget::{BudgetLimits, BudgetObserved, number_from_value};
use crate::command::{obj, run, Target};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::pack::HandoffSchema;
use crate::payload::resolve_file_flag;
use lisa_protocol::{CommandOutput, Payload};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LoopRequest {
    pub target: Target,
    pub poll_interval: u64,
    pub max_polls: u64,
    pub strategy: String,
    pub events: usize,
    pub lines: usize,
    pub token_budget: i64,
    pub cursor_file: String,
    pub handoff_cursor_file: String,
    pub schema: String,
    /// Rounds to run.
    pub steps: usize,
    pub limits: BudgetLimits,
    pub json_min: bool,
}

impl Default for LoopRequest {
    fn default() -> Self {
        Self {
            target: Target::default(),
            poll_interval: 2,
            max_polls: 40,
            strategy: "balanced".into(),
            events: 8,
            lines: 120,
            token_budget: 700,
            cursor_file: String::new(),
            handoff_cursor_file: String::new(),
            schema: "v2".into(),
            steps: 1,
            limits: BudgetLimits::default(),
            json_min: false,
        }
    }
}

struct LoopFailure {
    step: &'static str,
    code: String,
    message: String,
}

fn cursor_path(flag: &str, raw: &str, fallback: PathBuf) -> Result<String> {
    let path = resolve_file_flag(flag, raw)
        .map_err(|e| LisaError::invalid("invalid_cursor_file", e.to_string()))?
        .unwrap_or(fallback);
    Ok(path.to_string_lossy().into_owned())
}

/// Runs up to `steps` rounds, checking the caps after each one.
///
/// A reached cap ends the loop with `budget_limit_exceeded` and
/// `failedStep=budget`; a failed child ends it with `loop_<step>_failed`.
pub fn loop_command(engine: &Engine, runner: &dyn StepRunner, req: &LoopRequest) -> CommandOutput {
    run(|| {
        let session = req.target.require_session()?.to_string();
        for (flag, value) in [
            ("steps", req.steps as i64),
            ("events", req.events as i64),
            ("lines", req.lines as i64),
            ("token_budget", req.token_budget),
            ("poll_interval", req.poll_interval as i64),
            ("max_polls", req.max_polls as i64),
        ] {
            if value <= 0 {
                return Err(LisaError::invalid(
                    &format!("invalid_{flag}"),
                    format!("invalid --{}: must be > 0", flag.replace('_', "-")),
                ));
            }
        }
        let root = req.target.resolve_root(engine)?;
        let schema = HandoffSchema::parse(if req.schema.trim().is_empty() { "v2" } else { &req.schema })?;
        let cursor_file = cursor_path(
            "--cursor-file",
            &req.cursor_file,
            engine.paths.loop_pack_cursor_file(&root, &session),
        )?;
        let handoff_cursor_file = cursor_path(
            "--handoff-cursor-file",
            &req.handoff_cursor_file,
            engine.paths.loop_handoff_cursor_file(&root, &session),
        )?;

        let mut observed = BudgetObserved::default();
        let mut rounds: Vec<Value> = Vec::with_capacity(req.steps);
        let mut failure: Option<LoopFailure> = None;

        'rounds: for idx in 0..req.steps {
            let started = engine.now();
            let plan: [(&'static str, Vec<String>); 4] = [
                (
                    "monitor",
                    StepArgs::session("monitor")
                        .arg("--session", &session)
                        .arg("--project-root", &root)
                        .arg("--poll-interval", req.poll_interval)
                        .arg("--max-polls", req.max_polls)
                        .arg("--stop-on-waiting", true)
                        .flag("--json-min")
                        .into_vec(),
                ),
                (
                    "diff-pack",
                    StepArgs::session("diff-pack")
                        .arg("--session", &session)
                        .arg("--project-root", &root)
                        .arg("--strategy", &req.strategy)
                        .arg("--events", req.events)
                        .arg("--lines", req.lines)
                        .arg("--token-budget", req.token_budget)
                        .arg("--cursor-file", &cursor_file)
                        .flag("--semantic-only")
                        .flag("--json-min")
                        .into_vec(),
                ),
                (
                    "handoff",
                    StepArgs::session("handoff")
                        .arg("--session", &session)
                        .arg("--project-root", &root)
                        .arg("--cursor-file", &handoff_cursor_file)
                        .arg("--schema", schema.as_str())
                        .flag("--json-min")
                        .into_vec(),
                ),
                (
                    "next",
                    StepArgs::session("next")
                        .arg("--session", &session)
                        .arg("--project-root", &root)
                        .arg("--budget", req.token_budget)
                        .flag("--json")
                        .into_vec(),
                ),
            ];

            let mut outputs: Vec<Payload> = Vec::with_capacity(plan.len());
            for (step, args) in plan {
                let code_step = step.replace('-', "_");
                let result = match runner.run(&args) {
                    Ok(result) if result.exit_code == 0 => result,
                    Ok(result) => {
                        failure = Some(LoopFailure {
                            step,
                            code: format!("loop_{code_step}_failed"),
                            message: result
                                .error_message()
                                .unwrap_or_else(|| format!("{step} exited with code {}", result.exit_code)),
                        });
                        break 'rounds;
                    }
                    Err(err) => {
                        failure = Some(LoopFailure {
                            step,
                            code: format!("loop_{code_step}_failed"),
                            message: format!("{step} output parse failed: {err}"),
                        });
                        break 'rounds;
                    }
                };
                outputs.push(result.payload);
            }
            let [monitor, diff, handoff, next] = [&outputs[0], &outputs[1], &outputs[2], &outputs[3]];

            let elapsed = (engine.now() - started).num_seconds().max(1);
            let step_tokens = diff
                .get("tokenBudget")
                .and_then(number_from_value)
                .unwrap_or(req.token_budget);
            observed.tokens += step_tokens.max(0);
            observed.seconds += elapsed;
            observed.steps += 1;
            debug!(session = %session, round = idx + 1, ?observed, "loop round finished");

            let mut round = obj(json!({"index": idx + 1, "elapsedSeconds": elapsed}));
            if req.json_min {
                round.insert("monitorState".into(), json!(step_text(monitor, "finalState")));
                round.insert("nextAction".into(), json!(step_text(next, "nextAction")));
                round.insert("changed".into(), diff.get("changed").cloned().unwrap_or(Value::Null));
                round.insert("deltaCount".into(), handoff.get("deltaCount").cloned().unwrap_or(Value::Null));
            } else {
                round.insert("monitor".into(), Value::Object(monitor.clone()));
                round.insert("diffPack".into(), Value::Object(diff.clone()));
                round.insert("handoff".into(), Value::Object(handoff.clone()));
                round.insert("next".into(), Value::Object(next.clone()));
            }
            rounds.push(Value::Object(round));

            if !req.limits.reached_by(&observed).is_empty() {
                failure = Some(LoopFailure {
                    step: "budget",
                    code: "budget_limit_exceeded".into(),
                    message: "loop budget limit reached".into(),
                });
                break;
            }
        }

        let violations = req.limits.reached_by(&observed);
        let mut payload = obj(json!({
            "ok": failure.is_none(),
            "session": session,
            "projectRoot": root,
            "requestedSteps": req.steps,
            "completedSteps": rounds.len(),
            "cursorFile": cursor_file,
            "handoffCursorFile": handoff_cursor_file,
            "observed": observed,
            "limits": req.limits,
            "steps": rounds,
        }));
        if !violations.is_empty() {
            payload.insert("violations".into(), json!(violations));
        }
        match failure {
            Some(failure) => {
                warn!(session = %session, step = failure.step, code = %failure.code, "loop stopped");
                payload.insert("errorCode".into(), json!(failure.code));
                payload.insert("error".into(), json!(failure.message));
                payload.insert("failedStep".into(), json!(failure.step));
                Ok(CommandOutput::with_exit(payload, 1))
            }
            None => {
                info!(session = %session, rounds = req.steps, "loop completed");
                Ok(CommandOutput::ok(payload))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrate::turn::step_result;
    use crate::testing::ScriptedStepRunner;
    use chrono::Utc;
    use lisa_protocol::str_field;
    use tempfile::TempDir;

    fn run_loop(runner: &ScriptedStepRunner, req: &LoopRequest) -> CommandOutput {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        loop_command(&engine, runner, req)
    }

    fn request(steps: usize) -> LoopRequest {
        LoopRequest {
            target: Target::new("s1", "/repo"),
            steps,
            ..LoopRequest::default()
        }
    }

    #[test]
    fn test_rounds_accumulate_observed_usage() {
        let runner = ScriptedStepRunner::new();
        runner.script("diff-pack", step_result(json!({"changed": true, "tokenBudget": 300}), 0));
        runner.script("next", step_result(json!({"nextAction": "session monitor"}), 0));
        let mut req = request(2);
        req.json_min = true;
        let out = run_loop(&runner, &req);
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        assert_eq!(out.payload["observed"], json!({"tokens": 600, "seconds": 2, "steps": 2}));
        assert_eq!(out.payload["completedSteps"], 2);
        assert_eq!(out.payload["steps"][1]["nextAction"], "session monitor");
        assert_eq!(out.payload["steps"][0]["changed"], true);
        assert_eq!(
            runner.commands(),
            vec!["monitor", "diff-pack", "handoff", "next", "monitor", "diff-pack", "handoff", "next"]
        );
        let diff_call = runner.calls()[1].join(" ");
        assert!(diff_call.contains("--semantic-only"));
        assert!(diff_call.contains("loop-pack.cursor"));
    }

    #[test]
    fn test_step_cap_stops_loop() {
        let runner = ScriptedStepRunner::new();
        let mut req = request(5);
        req.limits.max_steps = 2;
        let out = run_loop(&runner, &req);
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("budget_limit_exceeded"));
        assert_eq!(str_field(&out.payload, "failedStep"), "budget");
        assert_eq!(out.payload["completedSteps"], 2);
        assert_eq!(out.payload["violations"][0]["metric"], "steps");
        assert_eq!(runner.commands().len(), 8);
    }

    #[test]
    fn test_token_cap_uses_default_budget() {
        let runner = ScriptedStepRunner::new();
        let mut req = request(3);
        req.limits.max_tokens = 1000;
        let out = run_loop(&runner, &req);
        assert_eq!(out.error_code(), Some("budget_limit_exceeded"));
        assert_eq!(out.payload["observed"]["tokens"], 1400);
        assert_eq!(out.payload["completedSteps"], 2);
    }

    #[test]
    fn test_child_failure_names_step() {
        let runner = ScriptedStepRunner::new();
        runner.script("handoff", step_result(json!({"errorCode": "handoff_schema_v2_required"}), 1));
        let out = run_loop(&runner, &request(3));
        assert_eq!(out.error_code(), Some("loop_handoff_failed"));
        assert_eq!(str_field(&out.payload, "failedStep"), "handoff");
        assert_eq!(str_field(&out.payload, "error"), "handoff_schema_v2_required");
        assert_eq!(out.payload["completedSteps"], 0);
        assert_eq!(runner.commands(), vec!["monitor", "diff-pack", "handoff"]);
    }

    #[test]
    fn test_diff_pack_failure_code_uses_underscore() {
        let runner = ScriptedStepRunner::new();
        runner.script("diff-pack", step_result(json!({}), 3));
        let out = run_loop(&runner, &request(1));
        assert_eq!(out.error_code(), Some("loop_diff_pack_failed"));
        assert_eq!(str_field(&out.payload, "failedStep"), "diff-pack");
    }

    #[test]
    fn test_rejects_bad_schema_and_steps() {
        let runner = ScriptedStepRunner::new();
        let mut req = request(1);
        req.schema = "v9".into();
        assert_eq!(run_loop(&runner, &req).error_code(), Some("invalid_schema"));
        assert_eq!(run_loop(&runner, &request(0)).error_code(), Some("invalid_steps"));
    }
}
