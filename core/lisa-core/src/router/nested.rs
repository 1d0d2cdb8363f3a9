//! Nested-invocation detection and agent command synthesis.
//!
//! A codex exec child that itself runs `./lisa` needs the approvals bypass
//! flag, or its own sandbox blocks the nested multiplexer. Detection reads
//! the prompt for orchestrator hints and skips mentions that only appear in
//! a documentation context ("the README mentions `./lisa`").

use crate::capture::shell_quote;
use crate::error::{LisaError, Result};
use serde::Serialize;

pub const BYPASS_FLAG: &str = "--dangerously-bypass-approvals-and-sandbox";
pub const FULL_AUTO_FLAG: &str = "--full-auto";
const SKIP_PERMISSIONS_FLAG: &str = "--dangerously-skip-permissions";

/// Prompt fragments that name the orchestrator, in match priority order.
pub const NESTED_HINTS: [(&str, &str); 3] = [
    ("lisa session spawn", "prompt_contains_lisa_session_spawn"),
    ("nested lisa", "prompt_contains_nested_lisa"),
    ("./lisa", "prompt_contains_dot_slash_lisa"),
];

const DOC_KEYWORDS: [&str; 15] = [
    "docs",
    "documentation",
    "readme",
    "string",
    "literal",
    "quote",
    "quoted",
    "mention",
    "mentions",
    "example",
    "examples",
    "appears",
    "appear",
    "shown",
    "text",
];
const ACTION_KEYWORDS: [&str; 7] = ["run", "use", "invoke", "spawn", "execute", "launch", "call"];
/// Bytes inspected on each side of a hint.
const CONTEXT_WINDOW: usize = 48;

// ═══════════════════════════════════════════════════════════════════════════════
// Policy & Intent
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NestedPolicy {
    #[default]
    Auto,
    Force,
    Off,
}

impl NestedPolicy {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "force" => Ok(Self::Force),
            "off" => Ok(Self::Off),
            _ => Err(LisaError::invalid(
                "invalid_nested_policy",
                format!("invalid --nested-policy: {raw} (expected auto|force|off)"),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Force => "force",
            Self::Off => "off",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NestingIntent {
    #[default]
    Auto,
    Nested,
    Neutral,
}

impl NestingIntent {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "nested" | "bypass" => Ok(Self::Nested),
            "neutral" | "none" | "off" => Ok(Self::Neutral),
            _ => Err(LisaError::invalid(
                "invalid_nesting_intent",
                format!("invalid --nesting-intent: {raw} (expected auto|nested|neutral)"),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Nested => "nested",
            Self::Neutral => "neutral",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Detection
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NestedDetection {
    pub eligible: bool,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub nested_policy: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub nesting_intent: &'static str,
    pub auto_bypass: bool,
    pub reason: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub matched_hint: &'static str,
    pub has_bypass_arg: bool,
    pub has_full_auto_arg: bool,
}

/// Whether `flag` appears as a whole token in `args` (also `flag=value`).
pub fn has_flag_token(args: &str, flag: &str) -> bool {
    args.split_whitespace()
        .any(|token| token == flag || token.starts_with(&format!("{flag}=")))
}

fn byte_positions(haystack: &str, needle: &str) -> Vec<usize> {
    haystack.match_indices(needle).map(|(idx, _)| idx).collect()
}

fn context_window(text: &str, start: usize, len: usize) -> &str {
    let mut from = start.saturating_sub(CONTEXT_WINDOW);
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (start + len + CONTEXT_WINDOW).min(text.len());
    while !text.is_char_boundary(to) {
        to += 1;
    }
    &text[from..to]
}

fn contains_any(window: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| window.contains(k))
}

/// True when every occurrence of `hint` sits in a documentation context
/// without an action verb nearby.
pub fn is_non_executable_mention(lower_prompt: &str, hint: &str) -> bool {
    let positions = byte_positions(lower_prompt, hint);
    if positions.is_empty() {
        return false;
    }
    positions.into_iter().all(|idx| {
        let window = context_window(lower_prompt, idx, hint.len());
        contains_any(window, &DOC_KEYWORDS) && !contains_any(window, &ACTION_KEYWORDS)
    })
}

pub fn detect_nested_bypass(
    agent: &str,
    mode: &str,
    prompt: &str,
    agent_args: &str,
    intent: NestingIntent,
) -> NestedDetection {
    let mut detection = NestedDetection {
        eligible: agent == "codex" && mode == "exec",
        nesting_intent: intent.as_str(),
        has_bypass_arg: has_flag_token(agent_args, BYPASS_FLAG),
        has_full_auto_arg: has_flag_token(agent_args, FULL_AUTO_FLAG),
        reason: "no_nested_hint",
        ..NestedDetection::default()
    };
    if !detection.eligible {
        detection.reason = "not_codex_exec";
        return detection;
    }
    if detection.has_bypass_arg {
        detection.reason = "agent_args_has_bypass";
        return detection;
    }
    if detection.has_full_auto_arg {
        detection.reason = "agent_args_has_full_auto";
        return detection;
    }
    match intent {
        NestingIntent::Nested => {
            detection.auto_bypass = true;
            detection.matched_hint = "nesting-intent:nested";
            detection.reason = "nesting_intent_nested";
            return detection;
        }
        NestingIntent::Neutral => {
            detection.reason = "nesting_intent_neutral";
            return detection;
        }
        NestingIntent::Auto => {}
    }
    let lower = prompt.to_lowercase();
    if let Some((hint, reason)) = NESTED_HINTS
        .iter()
        .find(|(hint, _)| lower.contains(hint) && !is_non_executable_mention(&lower, hint))
    {
        detection.auto_bypass = true;
        detection.matched_hint = *hint;
        detection.reason = *reason;
    }
    detection
}

fn append_arg(args: &str, flag: &str) -> String {
    format!("{args} {flag}").trim().to_string()
}

/// Applies the nested policy; returns the detection and the effective
/// agent args.
pub fn apply_nested_policy(
    agent: &str,
    mode: &str,
    prompt: &str,
    agent_args: &str,
    policy: NestedPolicy,
    intent: NestingIntent,
) -> Result<(NestedDetection, String)> {
    let mut detection = detect_nested_bypass(agent, mode, prompt, agent_args, intent);
    detection.nested_policy = policy.as_str();
    let mut args = agent_args.trim().to_string();
    match policy {
        NestedPolicy::Auto => {
            if detection.auto_bypass {
                args = append_arg(&args, BYPASS_FLAG);
            }
        }
        NestedPolicy::Off => {
            if detection.eligible && !detection.has_bypass_arg {
                detection.auto_bypass = false;
                detection.matched_hint = "";
                detection.reason = "nested_policy_off";
            }
        }
        NestedPolicy::Force => {
            if !detection.eligible {
                detection.auto_bypass = false;
                detection.reason = "nested_policy_force_not_applicable";
                return Ok((detection, args));
            }
            if detection.has_full_auto_arg && !detection.has_bypass_arg {
                return Err(LisaError::invalid(
                    "invalid_nested_policy_combination",
                    "invalid --nested-policy force with --agent-args --full-auto: codex exec bypass cannot be combined with full-auto",
                ));
            }
            detection.auto_bypass = true;
            detection.matched_hint = "nested-policy:force";
            detection.reason = "nested_policy_force";
            if !detection.has_bypass_arg {
                args = append_arg(&args, BYPASS_FLAG);
            }
        }
    }
    Ok((detection, args))
}

/// One hint occurrence with the context used to judge it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HintSpan {
    pub hint: &'static str,
    pub start: usize,
    pub end: usize,
    pub context: String,
    pub doc_context: bool,
    pub action_context: bool,
    pub non_executable: bool,
    pub matched_hint: bool,
}

/// Every hint occurrence in the prompt, ordered by position.
pub fn explain_hint_spans(prompt: &str, detection: &NestedDetection) -> Vec<HintSpan> {
    let lower = prompt.to_lowercase();
    let mut spans = Vec::new();
    for (hint, _) in NESTED_HINTS {
        for idx in byte_positions(&lower, hint) {
            let window = context_window(&lower, idx, hint.len());
            let doc_context = contains_any(window, &DOC_KEYWORDS);
            let action_context = contains_any(window, &ACTION_KEYWORDS);
            spans.push(HintSpan {
                hint,
                start: idx,
                end: idx + hint.len(),
                context: window.trim().to_string(),
                doc_context,
                action_context,
                non_executable: doc_context && !action_context,
                matched_hint: detection.matched_hint == hint,
            });
        }
    }
    spans.sort_by(|a, b| a.start.cmp(&b.start).then(a.hint.cmp(b.hint)));
    spans
}

/// Prompt rewrites that make the nested intent explicit.
pub fn nested_rewrite_suggestions(prompt: &str, detection: &NestedDetection) -> Vec<String> {
    let base = match prompt.trim() {
        "" => "Run nested child orchestration and report markers.",
        trimmed => trimmed,
    };
    let mut out: Vec<String> = Vec::new();
    let mut add = |value: String| {
        let value = value.trim().to_string();
        if !value.is_empty() && !out.contains(&value) {
            out.push(value);
        }
    };
    if detection.auto_bypass {
        add(base.to_string());
        add("Use ./lisa for child orchestration. Continue with the existing task.".to_string());
        return out;
    }
    for prefix in [
        "Use ./lisa for child orchestration.",
        "Run lisa session spawn for child workers.",
        "Create nested lisa inside lisa inside lisa and report markers.",
    ] {
        if base.eq_ignore_ascii_case(prefix) {
            add(prefix.to_string());
        } else {
            add(format!("{prefix} {base}"));
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// Models & Commands
// ═══════════════════════════════════════════════════════════════════════════════

/// Validates `--model`; `codex-spark` expands to the full model name.
pub fn parse_model(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    if trimmed.contains(['\r', '\n', '\t']) {
        return Err(LisaError::invalid(
            "invalid_model",
            "invalid --model: control characters are not allowed",
        ));
    }
    if trimmed.eq_ignore_ascii_case("codex-spark") {
        return Ok("gpt-5.3-codex-spark".to_string());
    }
    Ok(trimmed.to_string())
}

pub fn apply_model_to_agent_args(agent: &str, agent_args: &str, model: &str) -> Result<String> {
    let args = agent_args.trim();
    let model = model.trim();
    if model.is_empty() {
        return Ok(args.to_string());
    }
    if agent != "codex" {
        return Err(LisaError::invalid(
            "invalid_model_configuration",
            "invalid --model: only supported when --agent is codex",
        ));
    }
    if has_flag_token(args, "--model") {
        return Err(LisaError::invalid(
            "invalid_model_configuration",
            "invalid model configuration: --model cannot be combined with --agent-args that already include --model",
        ));
    }
    Ok(append_arg(args, &format!("--model {}", shell_quote(model))))
}

/// Shell command line that starts the agent.
///
/// Codex exec runs with `--full-auto` unless the args already carry the
/// bypass flag; claude gets `--dangerously-skip-permissions` when
/// `skip_permissions` is set.
pub fn build_agent_command(
    agent: &str,
    mode: &str,
    prompt: &str,
    agent_args: &str,
    skip_permissions: bool,
) -> Result<String> {
    let mut args = agent_args.trim().to_string();
    if agent == "claude" && skip_permissions && !has_flag_token(&args, SKIP_PERMISSIONS_FLAG) {
        args = format!("{SKIP_PERMISSIONS_FLAG} {args}").trim().to_string();
    }
    let prompt = prompt.trim();
    match mode {
        "interactive" => {
            let mut parts = vec![agent.to_string()];
            if !args.is_empty() {
                parts.push(args);
            }
            if !prompt.is_empty() {
                parts.push(shell_quote(prompt));
            }
            Ok(parts.join(" "))
        }
        "exec" => {
            if prompt.is_empty() {
                return Err(LisaError::invalid(
                    "build_command_failed",
                    "exec mode requires --prompt",
                ));
            }
            let base = if agent == "codex" {
                if has_flag_token(&args, BYPASS_FLAG) {
                    format!("codex exec {}", shell_quote(prompt))
                } else {
                    format!("codex exec {} {FULL_AUTO_FLAG}", shell_quote(prompt))
                }
            } else {
                format!("claude -p {}", shell_quote(prompt))
            };
            Ok(append_arg(&base, &args))
        }
        other => Err(LisaError::invalid("invalid_mode", format!("invalid mode: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(prompt: &str) -> NestedDetection {
        detect_nested_bypass("codex", "exec", prompt, "", NestingIntent::Auto)
    }

    #[test]
    fn test_detects_orchestrator_hints() {
        let d = detect("Use ./lisa to spawn two workers");
        assert!(d.auto_bypass);
        assert_eq!(d.reason, "prompt_contains_dot_slash_lisa");
        let d = detect("Please run lisa session spawn for the child");
        assert_eq!(d.matched_hint, "lisa session spawn");
        assert!(!detect("refactor the parser").auto_bypass);
    }

    #[test]
    fn test_documentation_mentions_are_guarded() {
        let d = detect("The README text shows ./lisa in a quoted literal.");
        assert!(!d.auto_bypass, "{d:?}");
        assert_eq!(d.reason, "no_nested_hint");
        // An action verb near the same mention re-enables detection.
        assert!(detect("The README shows how to run ./lisa").auto_bypass);
    }

    #[test]
    fn test_ineligible_and_existing_args() {
        let d = detect_nested_bypass("claude", "exec", "./lisa", "", NestingIntent::Auto);
        assert_eq!(d.reason, "not_codex_exec");
        let d = detect_nested_bypass("codex", "exec", "./lisa", BYPASS_FLAG, NestingIntent::Auto);
        assert_eq!(d.reason, "agent_args_has_bypass");
        let d = detect_nested_bypass("codex", "exec", "x", "", NestingIntent::Nested);
        assert!(d.auto_bypass);
        assert_eq!(d.matched_hint, "nesting-intent:nested");
    }

    #[test]
    fn test_policy_application() {
        let (d, args) =
            apply_nested_policy("codex", "exec", "use ./lisa", "", NestedPolicy::Auto, NestingIntent::Auto).unwrap();
        assert!(d.auto_bypass);
        assert_eq!(args, BYPASS_FLAG);

        let (d, args) =
            apply_nested_policy("codex", "exec", "use ./lisa", "", NestedPolicy::Off, NestingIntent::Auto).unwrap();
        assert_eq!(d.reason, "nested_policy_off");
        assert!(args.is_empty());

        let (d, _) =
            apply_nested_policy("claude", "exec", "x", "", NestedPolicy::Force, NestingIntent::Auto).unwrap();
        assert_eq!(d.reason, "nested_policy_force_not_applicable");

        let err = apply_nested_policy("codex", "exec", "x", "--full-auto", NestedPolicy::Force, NestingIntent::Auto)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_nested_policy_combination");
    }

    #[test]
    fn test_hint_spans_are_ordered() {
        let prompt = "nested lisa first, then ./lisa";
        let d = detect(prompt);
        let spans = explain_hint_spans(prompt, &d);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].hint, "nested lisa");
        assert!(spans[0].matched_hint);
        assert!(spans[0].start < spans[1].start);
    }

    #[test]
    fn test_model_and_command_building() {
        assert_eq!(parse_model("codex-spark").unwrap(), "gpt-5.3-codex-spark");
        assert!(parse_model("a\nb").is_err());
        let args = apply_model_to_agent_args("codex", "", "gpt-x").unwrap();
        assert_eq!(args, "--model 'gpt-x'");
        assert!(apply_model_to_agent_args("claude", "", "gpt-x").is_err());

        let cmd = build_agent_command("codex", "exec", "do it", &args, true).unwrap();
        assert_eq!(cmd, "codex exec 'do it' --full-auto --model 'gpt-x'");
        let cmd = build_agent_command("codex", "exec", "do it", BYPASS_FLAG, true).unwrap();
        assert!(!cmd.contains(FULL_AUTO_FLAG));
        let cmd = build_agent_command("claude", "interactive", "hi", "", true).unwrap();
        assert_eq!(cmd, "claude --dangerously-skip-permissions 'hi'");
        assert!(build_agent_command("codex", "exec", " ", "", true).is_err());
    }

    #[test]
    fn test_rewrites_dedupe() {
        let d = detect("refactor");
        let rewrites = nested_rewrite_suggestions("refactor", &d);
        assert_eq!(rewrites.len(), 3);
        assert!(rewrites[0].starts_with("Use ./lisa"));
        let d = detect("use ./lisa now");
        assert_eq!(nested_rewrite_suggestions("use ./lisa now", &d).len(), 2);
    }
}
