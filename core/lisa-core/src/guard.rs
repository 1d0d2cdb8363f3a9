//! `session guard`: risk check for commands run against a shared tmux
//! server.
//!
//! The guard looks at the default tmux server (outside the project socket)
//! and at the text of a command about to run. Built-in rules flag cleanup
//! and kill commands that could reach unrelated sessions; an optional JSON
//! policy file adds allow/deny lists and stricter requirements.

use crate::command::{obj, run};
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::payload::resolve_file_flag;
use crate::storage::read_optional;
use lisa_protocol::CommandOutput;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Risk {
    #[default]
    Low,
    Medium,
    High,
}

impl Risk {
    pub fn as_str(self) -> &'static str {
        match self {
            Risk::Low => "low",
            Risk::Medium => "medium",
            Risk::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MachinePolicy {
    #[default]
    Strict,
    Warn,
    Off,
}

impl MachinePolicy {
    fn parse(raw: &str, code: &str, label: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "strict" => Ok(Self::Strict),
            "warn" => Ok(Self::Warn),
            "off" => Ok(Self::Off),
            other => Err(LisaError::invalid(
                code,
                format!("invalid {label}: {other} (expected strict|warn|off)"),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Warn => "warn",
            Self::Off => "off",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuardPolicy {
    pub machine_policy: String,
    pub allowed_commands: Vec<String>,
    pub denied_commands: Vec<String>,
    pub require_project_root: bool,
    pub require_project_only_for_kill_all: bool,
    pub allow_cleanup_include_tmux_default: bool,
}

pub fn load_guard_policy(path: &Path) -> Result<GuardPolicy> {
    let raw = read_optional(path)?
        .ok_or_else(|| LisaError::FileNotFound(path.to_path_buf()))?;
    serde_json::from_str(&raw).map_err(|e| LisaError::json(path.display().to_string(), e))
}

/// Warnings, reason codes and the overall risk for one command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuardFindings {
    pub warnings: Vec<String>,
    pub reasons: Vec<String>,
    pub risk: Risk,
}

impl GuardFindings {
    fn flag(&mut self, risk: Risk, reason: &str, warning: impl Into<String>) {
        self.warnings.push(warning.into());
        self.reasons.push(reason.to_string());
        self.risk = self.risk.max(risk);
    }
}

/// Built-in rules over a lowercased command line.
pub fn evaluate_builtin_rules(command: &str) -> GuardFindings {
    let mut out = GuardFindings::default();
    if command.is_empty() {
        return out;
    }
    if command.contains("cleanup") && command.contains("--include-tmux-default") {
        out.flag(Risk::High, "cleanup_include_tmux_default", "command targets tmux default server");
    }
    if command.contains("session kill-all") && !command.contains("--project-only") {
        out.flag(
            Risk::High,
            "kill_all_without_project_only",
            "kill-all without --project-only can impact unrelated sessions",
        );
    }
    if command.contains("cleanup") && !command.contains("--dry-run") {
        out.flag(
            Risk::Medium,
            "cleanup_without_dry_run",
            "cleanup without --dry-run mutates runtime artifacts",
        );
    }
    if command.contains("session kill") && !command.contains("--project-root") {
        out.flag(
            Risk::Medium,
            "kill_without_project_root",
            "session kill without --project-root may target wrong project hash",
        );
    }
    out
}

/// Policy-file rules over a lowercased command line.
pub fn evaluate_guard_policy(policy: &GuardPolicy, command: &str) -> GuardFindings {
    let mut out = GuardFindings::default();
    if command.is_empty() {
        return out;
    }
    let entries = |list: &[String]| -> Vec<String> {
        list.iter()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    };

    let allowed = entries(&policy.allowed_commands);
    if !policy.allowed_commands.is_empty() && !allowed.iter().any(|e| command.contains(e.as_str())) {
        out.flag(Risk::High, "policy_not_allowed", "policy denies command outside allowedCommands");
    }
    if let Some(denied) = entries(&policy.denied_commands)
        .into_iter()
        .find(|e| command.contains(e.as_str()))
    {
        out.flag(
            Risk::High,
            "policy_denied_command",
            format!("policy denies command token: {denied}"),
        );
    }
    if policy.require_project_root && command.contains("session ") && !command.contains("--project-root") {
        out.flag(
            Risk::Medium,
            "policy_requires_project_root",
            "policy requires --project-root on session commands",
        );
    }
    if policy.require_project_only_for_kill_all
        && command.contains("session kill-all")
        && !command.contains("--project-only")
    {
        out.flag(
            Risk::High,
            "policy_requires_project_only_for_kill_all",
            "policy requires --project-only for kill-all",
        );
    }
    if !policy.allow_cleanup_include_tmux_default
        && command.contains("cleanup")
        && command.contains("--include-tmux-default")
    {
        out.flag(
            Risk::High,
            "policy_disallow_cleanup_include_tmux_default",
            "policy disallows cleanup --include-tmux-default",
        );
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct GuardRequest {
    pub project_root: String,
    pub shared_tmux: bool,
    pub enforce: bool,
    pub advice_only: bool,
    pub machine_policy: String,
    pub command: String,
    pub policy_file: String,
}

/// Exit code: 0 when safe, advice-only, or the machine policy is
/// `warn`/`off`; otherwise 1.
pub fn guard_command(engine: &Engine, req: &GuardRequest) -> CommandOutput {
    run(|| {
        if !req.shared_tmux {
            return Err(LisaError::MissingRequiredFlag { flag: "--shared-tmux".into() });
        }
        let root = engine.canonical_root(&req.project_root);
        let mut machine = MachinePolicy::parse(&req.machine_policy, "invalid_machine_policy", "--machine-policy")?;
        let policy_path = resolve_file_flag("--policy-file", &req.policy_file)
            .map_err(|e| LisaError::invalid("invalid_policy_file", e.to_string()))?;
        let policy = match &policy_path {
            Some(path) => {
                let loaded = load_guard_policy(path).map_err(|e| {
                    LisaError::coded("policy_file_read_failed", format!("failed reading --policy-file: {e}"))
                })?;
                if !loaded.machine_policy.trim().is_empty() {
                    machine = MachinePolicy::parse(
                        &loaded.machine_policy,
                        "invalid_policy_machine_policy",
                        "policy machinePolicy",
                    )?;
                }
                Some(loaded)
            }
            None => None,
        };

        let default_sessions = engine.tmux.default_server_sessions().unwrap_or_else(|e| {
            debug!(error = %e, "default tmux server unavailable");
            Vec::new()
        });
        let mut warnings: Vec<String> = Vec::new();
        if !default_sessions.is_empty() {
            warnings.push("default tmux server has active sessions".into());
            warnings.push("avoid cleanup --include-tmux-default without --dry-run".into());
            warnings.push("avoid session kill-all without --project-only --project-root".into());
        }

        let command = req.command.trim().to_lowercase();
        let mut findings = evaluate_builtin_rules(&command);
        if let Some(policy) = &policy {
            let from_policy = evaluate_guard_policy(policy, &command);
            findings.warnings.extend(from_policy.warnings);
            findings.reasons.extend(from_policy.reasons);
            findings.risk = findings.risk.max(from_policy.risk);
        }
        warnings.extend(findings.warnings);
        let risk = findings.risk;

        let safe = if machine == MachinePolicy::Strict || req.enforce {
            default_sessions.is_empty() && risk == Risk::Low
        } else {
            default_sessions.is_empty() && risk != Risk::High
        };
        let mut remediation: Vec<&str> = Vec::new();
        if !safe {
            remediation.push("use --project-only and --project-root for destructive session commands");
            if command.contains("cleanup") {
                remediation.push("run cleanup with --dry-run before executing mutations");
            }
            if !default_sessions.is_empty() {
                remediation.push("avoid touching default tmux server while shared sessions are active");
            }
        }

        let mut payload = obj(json!({
            "ok": safe,
            "sharedTmux": true,
            "projectRoot": root,
            "defaultSessionCount": default_sessions.len(),
            "defaultSessions": default_sessions,
            "command": req.command,
            "commandRisk": risk.as_str(),
            "risk": risk.as_str(),
            "enforce": req.enforce,
            "adviceOnly": req.advice_only,
            "machinePolicy": machine.as_str(),
            "safe": safe,
            "warnings": warnings,
        }));
        if let Some(path) = &policy_path {
            payload.insert("policyFile".into(), json!(path.to_string_lossy()));
        }
        if !findings.reasons.is_empty() {
            payload.insert("reasons".into(), json!(findings.reasons));
        }
        if !remediation.is_empty() {
            payload.insert("remediation".into(), json!(remediation));
        }
        if !safe && !req.advice_only && machine == MachinePolicy::Strict {
            let code = if req.enforce { "shared_tmux_guard_enforced" } else { "shared_tmux_risk_detected" };
            payload.insert("errorCode".into(), json!(code));
            warn!(risk = risk.as_str(), code, "shared tmux guard blocked command");
        }

        let exit = if safe || req.advice_only || machine != MachinePolicy::Strict { 0 } else { 1 };
        Ok(CommandOutput::with_exit(payload, exit))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lisa_protocol::str_field;
    use tempfile::TempDir;

    fn request(command: &str) -> GuardRequest {
        GuardRequest { shared_tmux: true, command: command.into(), ..GuardRequest::default() }
    }

    #[test]
    fn test_builtin_rules() {
        let high = evaluate_builtin_rules("lisa cleanup --include-tmux-default");
        assert_eq!(high.risk, Risk::High);
        assert_eq!(high.reasons, vec!["cleanup_include_tmux_default", "cleanup_without_dry_run"]);

        let medium = evaluate_builtin_rules("lisa session kill --session s1");
        assert_eq!(medium.risk, Risk::Medium);
        assert_eq!(medium.reasons, vec!["kill_without_project_root"]);

        assert_eq!(evaluate_builtin_rules("lisa session status").risk, Risk::Low);
    }

    #[test]
    fn test_policy_rules() {
        let policy = GuardPolicy {
            allowed_commands: vec!["session status".into(), " ".into()],
            denied_commands: vec!["rm -rf".into()],
            require_project_root: true,
            ..GuardPolicy::default()
        };
        let out = evaluate_guard_policy(&policy, "session status --json");
        assert_eq!(out.risk, Risk::Medium);
        assert_eq!(out.reasons, vec!["policy_requires_project_root"]);

        let denied = evaluate_guard_policy(&policy, "rm -rf /tmp/x");
        assert_eq!(denied.risk, Risk::High);
        assert_eq!(denied.reasons, vec!["policy_not_allowed", "policy_denied_command"]);
        assert_eq!(denied.warnings[1], "policy denies command token: rm -rf");
    }

    #[test]
    fn test_guard_requires_shared_tmux() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let out = guard_command(&engine, &GuardRequest::default());
        assert_eq!(out.error_code(), Some("missing_required_flag"));
    }

    #[test]
    fn test_guard_strict_blocks_medium_risk() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let out = guard_command(&engine, &request("lisa session kill --session s1"));
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("shared_tmux_risk_detected"));
        assert_eq!(str_field(&out.payload, "commandRisk"), "medium");

        let mut warn_policy = request("lisa session kill --session s1");
        warn_policy.machine_policy = "warn".into();
        let out = guard_command(&engine, &warn_policy);
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.payload["safe"], true);
        assert!(out.payload.get("errorCode").is_none());
    }

    #[test]
    fn test_guard_default_sessions_make_unsafe() {
        let tmp = TempDir::new().unwrap();
        let (engine, fake, _) = Engine::with_fakes(tmp.path(), Utc::now());
        fake.set_default_sessions(&["personal"]);
        let mut req = request("");
        req.enforce = true;
        let out = guard_command(&engine, &req);
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("shared_tmux_guard_enforced"));
        assert_eq!(out.payload["defaultSessionCount"], 1);
        assert_eq!(out.payload["remediation"].as_array().unwrap().len(), 2);

        req.advice_only = true;
        let advice = guard_command(&engine, &req);
        assert_eq!(advice.exit_code, 0);
        assert_eq!(advice.payload["safe"], false);
    }

    #[test]
    fn test_guard_policy_file_overrides_machine_policy() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let policy = tmp.path().join("guard.json");
        std::fs::write(&policy, r#"{"machinePolicy": "off", "deniedCommands": ["kill-all"]}"#).unwrap();
        let mut req = request("lisa session kill-all --project-only");
        req.policy_file = policy.to_string_lossy().into_owned();
        let out = guard_command(&engine, &req);
        assert_eq!(out.exit_code, 0);
        assert_eq!(str_field(&out.payload, "machinePolicy"), "off");
        assert_eq!(str_field(&out.payload, "commandRisk"), "high");

        std::fs::write(&policy, r#"{"machinePolicy": "loose"}"#).unwrap();
        let bad = guard_command(&engine, &req);
        assert_eq!(bad.error_code(), Some("invalid_policy_machine_policy"));

        req.policy_file = tmp.path().join("absent.json").to_string_lossy().into_owned();
        let missing = guard_command(&engine, &req);
        assert_eq!(missing.error_code(), Some("policy_file_read_failed"));
    }
}
