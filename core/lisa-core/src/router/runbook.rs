//! Copy-pasteable command sequence for a routed run.

use crate::capture::shell_quote;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunbookStep {
    pub id: &'static str,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Runbook {
    pub steps: Vec<RunbookStep>,
}

impl Runbook {
    pub fn step_ids(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.id).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunbookSpec<'a> {
    pub project_root: &'a str,
    pub agent: &'a str,
    pub mode: &'a str,
    pub nested_policy: &'a str,
    pub nesting_intent: &'a str,
    pub prompt: &'a str,
    pub model: &'a str,
    pub budget: i64,
}

/// preflight, spawn, monitor, capture, handoff, optional context-pack
/// (when a budget is set), cleanup. Later steps read `$SESSION`.
pub fn build_route_runbook(spec: &RunbookSpec<'_>) -> Runbook {
    let root = shell_quote(spec.project_root);
    let session_flags = format!("--session \"$SESSION\" --project-root {root}");
    let step = |id, command: String| RunbookStep {
        id,
        command,
        note: None,
    };

    let mut spawn = format!(
        "./lisa session spawn --agent {} --mode {} --nested-policy {} --nesting-intent {} --project-root {root} --prompt {}",
        spec.agent,
        spec.mode,
        spec.nested_policy,
        spec.nesting_intent,
        shell_quote(spec.prompt)
    );
    if !spec.model.is_empty() && spec.agent == "codex" {
        spawn.push_str(&format!(" --model {}", shell_quote(spec.model)));
    }
    spawn.push_str(" --json");

    let monitor = if spec.mode == "interactive" {
        format!("./lisa session monitor {session_flags} --stop-on-waiting true --json")
    } else {
        format!("./lisa session monitor {session_flags} --expect terminal --json")
    };
    let capture = if spec.budget > 0 {
        format!(
            "./lisa session capture {session_flags} --raw --summary --summary-style ops --token-budget {} --json",
            spec.budget
        )
    } else {
        format!("./lisa session capture {session_flags} --raw --json-min")
    };

    let mut steps = vec![
        step(
            "preflight",
            format!("./lisa session preflight --agent {} --project-root {root} --json", spec.agent),
        ),
        RunbookStep {
            id: "spawn",
            command: spawn,
            note: Some("extract SESSION from spawn JSON payload"),
        },
        step("monitor", monitor),
        step("capture", capture),
        step("handoff", format!("./lisa session handoff {session_flags} --json-min")),
    ];
    if spec.budget > 0 {
        steps.push(step(
            "context-pack",
            format!(
                "./lisa session context-pack --for \"$SESSION\" --project-root {root} --strategy balanced --token-budget {} --json-min",
                spec.budget
            ),
        ));
    }
    steps.push(step("cleanup", format!("./lisa session kill {session_flags} --json")));
    Runbook { steps }
}
