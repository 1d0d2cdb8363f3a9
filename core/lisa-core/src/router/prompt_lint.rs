//! `session prompt-lint`: scores a prompt before it is sent to an agent.

use super::nested::{
    apply_model_to_agent_args, apply_nested_policy, build_agent_command, nested_rewrite_suggestions, parse_model,
    NestedPolicy, NestingIntent,
};
use crate::command::{obj, run};
use crate::engine::Engine;
use crate::error::LisaError;
use crate::meta::{parse_agent, parse_mode};
use crate::payload::parse_comma_values;
use lisa_protocol::CommandOutput;
use serde::Serialize;
use serde_json::json;

pub const DEFAULT_PROMPT_LINT_BUDGET: i64 = 320;

/// Rough token count: four bytes per token, plus one.
pub fn estimate_prompt_tokens(prompt: &str) -> i64 {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        0
    } else {
        (trimmed.len() / 4) as i64 + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LintWarning {
    pub code: &'static str,
    pub severity: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub markers: Vec<String>,
    /// Points taken off the score of 100.
    #[serde(skip)]
    pub penalty: i64,
}

impl LintWarning {
    fn new(code: &'static str, severity: &'static str, penalty: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            message: message.into(),
            markers: Vec::new(),
            penalty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptLintRequest {
    pub project_root: String,
    pub agent: String,
    pub mode: String,
    pub nested_policy: String,
    pub nesting_intent: String,
    pub prompt: String,
    pub model: String,
    pub markers: String,
    pub budget: i64,
    /// Exit 1 when any high-severity warning is present.
    pub strict: bool,
    pub rewrite: bool,
}

impl Default for PromptLintRequest {
    fn default() -> Self {
        Self {
            project_root: String::new(),
            agent: "codex".into(),
            mode: "exec".into(),
            nested_policy: "auto".into(),
            nesting_intent: "auto".into(),
            prompt: String::new(),
            model: String::new(),
            markers: String::new(),
            budget: DEFAULT_PROMPT_LINT_BUDGET,
            strict: false,
            rewrite: false,
        }
    }
}

pub fn prompt_lint_command(engine: &Engine, req: &PromptLintRequest) -> CommandOutput {
    run(|| {
        if req.prompt.trim().is_empty() {
            return Err(LisaError::MissingRequiredFlag {
                flag: "--prompt".into(),
            });
        }
        if req.budget <= 0 {
            return Err(LisaError::invalid("invalid_budget", "invalid --budget: must be > 0"));
        }
        let agent = parse_agent(&req.agent)?;
        let mode = parse_mode(&req.mode)?;
        let policy = NestedPolicy::parse(&req.nested_policy)?;
        let intent = NestingIntent::parse(&req.nesting_intent)?;
        let model = parse_model(&req.model)?;
        let root = engine.canonical_root(&req.project_root);

        let agent_args = apply_model_to_agent_args(&agent, "", &model)?;
        let (detection, effective_args) =
            apply_nested_policy(&agent, &mode, &req.prompt, &agent_args, policy, intent)?;

        let token_estimate = estimate_prompt_tokens(&req.prompt);
        let mut warnings = Vec::new();
        if token_estimate > req.budget {
            warnings.push(LintWarning::new(
                "prompt_over_budget",
                "medium",
                18,
                format!("estimated prompt tokens {token_estimate} exceed budget {}", req.budget),
            ));
        }
        let collisions: Vec<String> = parse_comma_values(&req.markers)
            .into_iter()
            .filter(|marker| req.prompt.contains(marker.as_str()))
            .collect();
        if !collisions.is_empty() {
            warnings.push(LintWarning {
                markers: collisions,
                ..LintWarning::new(
                    "prompt_contains_marker",
                    "high",
                    30,
                    "prompt includes marker strings that may trigger early monitor success",
                )
            });
        }
        if agent == "codex"
            && mode == "exec"
            && req.prompt.to_lowercase().contains("nested")
            && !detection.auto_bypass
        {
            warnings.push(LintWarning::new(
                "nested_hint_missing",
                "medium",
                15,
                "nested intent detected but bypass hint did not trigger; include './lisa' or 'lisa session spawn'",
            ));
        }
        if detection.auto_bypass && detection.has_full_auto_arg {
            warnings.push(LintWarning::new(
                "bypass_full_auto_conflict",
                "high",
                25,
                "nested bypass should not be combined with --full-auto",
            ));
        }

        let score = (100 - warnings.iter().map(|w| w.penalty).sum::<i64>()).max(0);
        let high = warnings.iter().filter(|w| w.severity == "high").count();
        let strict_failed = req.strict && high > 0;

        let mut payload = obj(json!({
            "agent": agent,
            "mode": mode,
            "projectRoot": root,
            "budget": req.budget,
            "prompt": req.prompt,
            "tokenEstimate": token_estimate,
            "nestedDetection": detection,
            "effectiveAgentArgs": effective_args,
            "warnings": warnings,
            "score": score,
            "strict": req.strict,
            "highSeverityCount": high,
        }));
        if req.rewrite {
            let rewrites = nested_rewrite_suggestions(&req.prompt, &detection);
            payload.insert(
                "recommendedPrompt".into(),
                json!(rewrites.first().cloned().unwrap_or_default()),
            );
            payload.insert("rewrites".into(), json!(rewrites));
        }
        if !model.is_empty() {
            payload.insert("model".into(), json!(model));
        }
        if let Ok(command) = build_agent_command(&agent, &mode, &req.prompt, &effective_args, true) {
            payload.insert("command".into(), json!(command));
        }
        if strict_failed {
            payload.insert("errorCode".into(), json!("prompt_lint_strict_failed"));
            return Ok(CommandOutput::with_exit(payload, 1));
        }
        Ok(CommandOutput::ok(payload))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn lint(req: PromptLintRequest) -> CommandOutput {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        prompt_lint_command(&engine, &req)
    }

    fn codes(out: &CommandOutput) -> Vec<String> {
        out.payload["warnings"]
            .as_array()
            .unwrap()
            .iter()
            .map(|w| w["code"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_token_estimate() {
        assert_eq!(estimate_prompt_tokens("   "), 0);
        assert_eq!(estimate_prompt_tokens("abcd"), 2);
        assert_eq!(estimate_prompt_tokens(&"x".repeat(400)), 101);
    }

    #[test]
    fn test_clean_prompt_scores_full() {
        let out = lint(PromptLintRequest {
            prompt: "Summarize the failing tests.".into(),
            ..PromptLintRequest::default()
        });
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.payload["score"], 100);
        assert!(codes(&out).is_empty());
        assert!(out.payload["command"].as_str().unwrap().starts_with("codex exec"));
    }

    #[test]
    fn test_marker_collision_fails_strict() {
        let out = lint(PromptLintRequest {
            prompt: "Print DONE_MARK when finished with nested work".into(),
            markers: "DONE_MARK".into(),
            strict: true,
            rewrite: true,
            ..PromptLintRequest::default()
        });
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("prompt_lint_strict_failed"));
        assert_eq!(codes(&out), vec!["prompt_contains_marker", "nested_hint_missing"]);
        assert_eq!(out.payload["score"], 55);
        assert_eq!(out.payload["highSeverityCount"], 1);
        assert!(out.payload["recommendedPrompt"]
            .as_str()
            .unwrap()
            .starts_with("Use ./lisa"));
    }

    #[test]
    fn test_over_budget_and_missing_prompt() {
        let out = lint(PromptLintRequest {
            prompt: "y".repeat(200),
            budget: 10,
            ..PromptLintRequest::default()
        });
        assert_eq!(codes(&out), vec!["prompt_over_budget"]);
        assert_eq!(out.payload["score"], 82);

        let out = lint(PromptLintRequest::default());
        assert_eq!(out.error_code(), Some("missing_required_flag"));
    }
}
