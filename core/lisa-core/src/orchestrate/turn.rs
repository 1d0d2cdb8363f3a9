//! `session turn`: one send, monitor, packet round for a session.

use super::{step_text, StepArgs, StepResult, StepRunner};
use crate::command::{obj, run, Target};
use crate::engine::Engine;
use crate::error::LisaError;
use lisa_protocol::{CommandOutput, Payload};
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub target: Target,
    pub text: String,
    pub keys: String,
    pub enter: bool,
    pub agent_hint: String,
    pub mode_hint: String,
    pub expect: String,
    pub poll_interval: u64,
    pub max_polls: u64,
    pub timeout_seconds: u64,
    pub stop_on_waiting: Option<bool>,
    pub waiting_requires_turn_complete: Option<bool>,
    pub until_marker: String,
    pub until_state: String,
    pub lines: usize,
    pub events: usize,
    pub token_budget: i64,
    pub summary_style: String,
    pub cursor_file: String,
    pub fields: String,
    pub json_min: bool,
}

impl TurnRequest {
    fn send_args(&self, session: &str, root: &str) -> Vec<String> {
        let args = StepArgs::session("send")
            .arg("--session", session)
            .arg("--project-root", root);
        let args = if self.text.trim().is_empty() {
            args.arg("--keys", &self.keys)
        } else {
            args.arg("--text", &self.text)
        };
        let args = if self.enter { args.flag("--enter") } else { args };
        args.flag("--json").into_vec()
    }

    fn monitor_args(&self, session: &str, root: &str) -> Vec<String> {
        let mut args = StepArgs::session("monitor")
            .arg("--session", session)
            .arg("--project-root", root)
            .flag("--json")
            .arg_if("--agent", &self.agent_hint)
            .arg_if("--mode", &self.mode_hint)
            .arg_if("--expect", &self.expect)
            .positive("--poll-interval", self.poll_interval as i64)
            .positive("--max-polls", self.max_polls as i64)
            .positive("--timeout-seconds", self.timeout_seconds as i64);
        if let Some(stop) = self.stop_on_waiting {
            args = args.arg("--stop-on-waiting", stop);
        }
        if let Some(turn_complete) = self.waiting_requires_turn_complete {
            args = args.arg("--waiting-requires-turn-complete", turn_complete);
        }
        args.arg_if("--until-marker", &self.until_marker)
            .arg_if("--until-state", &self.until_state)
            .into_vec()
    }

    fn packet_args(&self, session: &str, root: &str) -> Vec<String> {
        StepArgs::session("packet")
            .arg("--session", session)
            .arg("--project-root", root)
            .flag("--json")
            .arg_if("--agent", &self.agent_hint)
            .arg_if("--mode", &self.mode_hint)
            .positive("--lines", self.lines as i64)
            .positive("--events", self.events as i64)
            .positive("--token-budget", self.token_budget)
            .arg_if("--summary-style", &self.summary_style)
            .arg_if("--cursor-file", &self.cursor_file)
            .arg_if("--fields", &self.fields)
            .into_vec()
    }
}

const STEPS: [&str; 3] = ["send", "monitor", "packet"];

/// Runs the three steps in order and stops at the first non-zero exit.
///
/// A failed step yields `turn_<step>_failed` and exits with the step's own
/// code; later steps are not invoked.
pub fn turn_command(engine: &Engine, runner: &dyn StepRunner, req: &TurnRequest) -> CommandOutput {
    run(|| {
        let session = req.target.require_session()?.to_string();
        let has_text = !req.text.trim().is_empty();
        let has_keys = !req.keys.trim().is_empty();
        if !has_text && !has_keys {
            return Err(LisaError::invalid("missing_send_payload", "provide --text or --keys"));
        }
        if has_text && has_keys {
            return Err(LisaError::invalid(
                "send_payload_conflict",
                "use either --text or --keys, not both",
            ));
        }
        let root = req.target.resolve_root(engine)?;

        let mut results: Vec<StepResult> = Vec::with_capacity(STEPS.len());
        for step in STEPS {
            let args = match step {
                "send" => req.send_args(&session, &root),
                "monitor" => req.monitor_args(&session, &root),
                _ => req.packet_args(&session, &root),
            };
            let result = runner.run(&args).map_err(|e| {
                LisaError::coded(
                    &format!("turn_{step}_parse_failed"),
                    format!("failed reading {step} output: {e}"),
                )
            })?;
            if result.exit_code != 0 {
                warn!(session = %session, step, exit_code = result.exit_code, "turn step failed");
                results.push(result);
                return Ok(step_failure(step, &session, &root, &results, req.json_min));
            }
            results.push(result);
        }
        info!(session = %session, "turn completed");

        let [send, monitor, packet] = [&results[0], &results[1], &results[2]];
        if req.json_min {
            let mut payload = obj(json!({"ok": true, "session": session, "projectRoot": root}));
            for (source, key) in [
                (&monitor.payload, "finalState"),
                (&monitor.payload, "exitReason"),
                (&packet.payload, "sessionState"),
                (&packet.payload, "status"),
                (&packet.payload, "nextAction"),
            ] {
                let value = step_text(source, key);
                if !value.is_empty() {
                    payload.insert(key.into(), Value::String(value));
                }
            }
            return Ok(CommandOutput::ok(payload));
        }
        Ok(CommandOutput::ok(obj(json!({
            "ok": true,
            "session": session,
            "projectRoot": root,
            "send": send.payload,
            "sendExitCode": send.exit_code,
            "monitor": monitor.payload,
            "monitorExitCode": monitor.exit_code,
            "packet": packet.payload,
            "packetExitCode": packet.exit_code,
        }))))
    })
}

fn step_failure(step: &str, session: &str, root: &str, results: &[StepResult], json_min: bool) -> CommandOutput {
    let failed = results.last().cloned().unwrap_or_default();
    let message = failed
        .error_message()
        .unwrap_or_else(|| format!("{step} step failed"));
    let mut payload = obj(json!({
        "ok": false,
        "session": session,
        "projectRoot": root,
        "failedStep": step,
        "errorCode": format!("turn_{step}_failed"),
        "error": message,
    }));
    if !json_min {
        for (idx, name) in STEPS.iter().enumerate() {
            let result = results.get(idx);
            if let Some(result) = result.filter(|r| !r.payload.is_empty()) {
                payload.insert((*name).into(), Value::Object(result.payload.clone()));
            }
            payload.insert(
                format!("{name}ExitCode"),
                json!(result.map(|r| r.exit_code).unwrap_or(0)),
            );
        }
    }
    let exit = if failed.exit_code > 0 { failed.exit_code } else { 1 };
    CommandOutput::with_exit(payload, exit)
}

/// Helper for tests and smoke checks: a step result from a JSON object.
pub fn step_result(value: Value, exit_code: i32) -> StepResult {
    let payload: Payload = obj(value);
    StepResult::new(payload, exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedStepRunner;
    use chrono::Utc;
    use lisa_protocol::str_field;
    use tempfile::TempDir;

    fn request() -> TurnRequest {
        TurnRequest {
            target: Target::new("s1", "/repo"),
            text: "continue".into(),
            enter: true,
            ..TurnRequest::default()
        }
    }

    fn turn(runner: &ScriptedStepRunner, req: &TurnRequest) -> CommandOutput {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        turn_command(&engine, runner, req)
    }

    #[test]
    fn test_send_failure_stops_turn_with_step_exit() {
        let runner = ScriptedStepRunner::new();
        runner.script(
            "send",
            step_result(json!({"ok": false, "errorCode": "send_failed", "error": "pane gone"}), 7),
        );
        let out = turn(&runner, &request());
        assert_eq!(out.exit_code, 7);
        assert_eq!(out.error_code(), Some("turn_send_failed"));
        assert_eq!(str_field(&out.payload, "failedStep"), "send");
        assert_eq!(out.payload["ok"], false);
        assert_eq!(out.payload["sendExitCode"], 7);
        assert_eq!(runner.commands(), vec!["send"]);
    }

    #[test]
    fn test_monitor_failure_skips_packet() {
        let runner = ScriptedStepRunner::new();
        runner.script("monitor", step_result(json!({"finalState": "crashed"}), 2));
        let mut req = request();
        req.json_min = true;
        let out = turn(&runner, &req);
        assert_eq!(out.exit_code, 2);
        assert_eq!(out.error_code(), Some("turn_monitor_failed"));
        assert_eq!(str_field(&out.payload, "error"), "monitor step failed");
        assert!(out.payload.get("sendExitCode").is_none());
        assert_eq!(runner.commands(), vec!["send", "monitor"]);
    }

    #[test]
    fn test_json_min_success_picks_fields() {
        let runner = ScriptedStepRunner::new();
        runner.script(
            "monitor",
            step_result(json!({"finalState": "waiting_input", "exitReason": "waiting_input"}), 0),
        );
        runner.script(
            "packet",
            step_result(
                json!({"sessionState": "waiting_input", "status": "idle", "nextAction": "session send"}),
                0,
            ),
        );
        let mut req = request();
        req.json_min = true;
        req.max_polls = 5;
        req.stop_on_waiting = Some(false);
        let out = turn(&runner, &req);
        assert_eq!(out.exit_code, 0);
        assert_eq!(str_field(&out.payload, "finalState"), "waiting_input");
        assert_eq!(str_field(&out.payload, "nextAction"), "session send");
        assert!(out.payload.get("send").is_none());

        let calls = runner.calls();
        assert!(calls[0].contains(&"--enter".to_string()));
        let monitor = calls[1].join(" ");
        assert!(monitor.contains("--max-polls 5"));
        assert!(monitor.contains("--stop-on-waiting false"));
        assert!(!monitor.contains("--poll-interval"));
    }

    #[test]
    fn test_payload_validation() {
        let runner = ScriptedStepRunner::new();
        let mut req = request();
        req.keys = "C-c".into();
        assert_eq!(turn(&runner, &req).error_code(), Some("send_payload_conflict"));
        req.text.clear();
        req.keys.clear();
        assert_eq!(turn(&runner, &req).error_code(), Some("missing_send_payload"));
        req.target = Target::new("", "/repo");
        assert_eq!(turn(&runner, &req).error_code(), Some("missing_required_flag"));
        assert!(runner.calls().is_empty());
    }
}
