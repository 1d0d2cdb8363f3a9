//! Output schema catalog and the CLI/skill-doc contract check.
//!
//! The catalog maps a normalized command name (`session status`) to a
//! JSON-Schema-shaped object describing the payload fields callers may
//! rely on. [`COMMAND_CONTRACTS`] lists every advertised command with the
//! long flags the CLI accepts; `session contract-check` and
//! `skills doctor --contract-check` verify that the skill doc mentions all
//! of them.

use crate::command::{obj, run};
use crate::engine::Engine;
use crate::error::LisaError;
use crate::skills::repo_skill_doc;
use lisa_protocol::CommandOutput;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A command name plus the long flags it accepts.
#[derive(Debug, Clone, Copy)]
pub struct CommandContract {
    pub name: &'static str,
    pub flags: &'static [&'static str],
}

macro_rules! contract {
    ($name:expr, [$($flag:expr),* $(,)?]) => {
        CommandContract { name: $name, flags: &[$($flag),*] }
    };
}

pub const COMMAND_CONTRACTS: &[CommandContract] = &[
    contract!("session spawn", ["--project-root", "--session", "--agent", "--mode", "--lane", "--nested-policy", "--nesting-intent", "--prompt", "--command", "--agent-args", "--model", "--width", "--height", "--dry-run", "--detect-nested", "--no-dangerously-skip-permissions", "--json"]),
    contract!("session exists", ["--session", "--project-root", "--json"]),
    contract!("session kill", ["--session", "--project-root", "--json"]),
    contract!("session kill-all", ["--project-root", "--project-only", "--json"]),
    contract!("session name", ["--project-root", "--agent", "--mode", "--tag", "--json"]),
    contract!("session status", ["--session", "--project-root", "--agent", "--mode", "--full", "--fail-not-found", "--json", "--json-min"]),
    contract!("session explain", ["--session", "--project-root", "--agent", "--mode", "--events", "--since", "--json", "--json-min"]),
    contract!("session snapshot", ["--session", "--project-root", "--agent", "--mode", "--lines", "--delta-from", "--markers", "--keep-noise", "--fail-not-found", "--json", "--json-min"]),
    contract!("session capture", ["--session", "--project-root", "--lines", "--raw", "--keep-noise", "--delta-from", "--cursor-file", "--markers", "--summary", "--token-budget", "--semantic-delta", "--redact", "--fields", "--json", "--json-min"]),
    contract!("session monitor", ["--session", "--project-root", "--agent", "--mode", "--expect", "--poll-interval", "--max-polls", "--timeout-seconds", "--stop-on-waiting", "--waiting-requires-turn-complete", "--until-state", "--until-marker", "--json", "--json-min"]),
    contract!("session send", ["--session", "--project-root", "--text", "--keys", "--enter", "--json", "--json-min"]),
    contract!("session packet", ["--session", "--project-root", "--agent", "--mode", "--lines", "--events", "--token-budget", "--summary-style", "--cursor-file", "--delta-json", "--fields", "--json", "--json-min"]),
    contract!("session handoff", ["--session", "--project-root", "--agent", "--mode", "--events", "--delta-from", "--cursor-file", "--schema", "--json", "--json-min"]),
    contract!("session context-pack", ["--for", "--project-root", "--agent", "--mode", "--strategy", "--events", "--lines", "--token-budget", "--from-handoff", "--redact", "--json", "--json-min"]),
    contract!("session diff-pack", ["--session", "--project-root", "--strategy", "--events", "--lines", "--token-budget", "--cursor-file", "--redact", "--semantic-only", "--json", "--json-min"]),
    contract!("session aggregate", ["--sessions", "--project-root", "--strategy", "--events", "--lines", "--token-budget", "--dedupe", "--delta-json", "--cursor-file", "--json", "--json-min"]),
    contract!("session next", ["--session", "--project-root", "--budget", "--json"]),
    contract!("session route", ["--project-root", "--goal", "--agent", "--lane", "--prompt", "--model", "--profile", "--budget", "--emit-runbook", "--queue", "--sessions", "--queue-limit", "--concurrency", "--topology", "--cost-estimate", "--from-state", "--json"]),
    contract!("session guard", ["--project-root", "--shared-tmux", "--enforce", "--advice-only", "--machine-policy", "--command", "--policy-file", "--json"]),
    contract!("session list", ["--project-root", "--project-only", "--active-only", "--with-next-action", "--priority", "--delta-json", "--cursor-file", "--json", "--json-min"]),
    contract!("session smoke", ["--json"]),
    contract!("session checkpoint", ["--action", "--session", "--project-root", "--file", "--strategy", "--events", "--lines", "--token-budget", "--json", "--json-min"]),
    contract!("session dedupe", ["--session", "--project-root", "--task-hash", "--release", "--json"]),
    contract!("session objective", ["--project-root", "--id", "--goal", "--acceptance", "--budget", "--status", "--ttl-hours", "--activate", "--clear", "--list", "--json"]),
    contract!("session memory", ["--session", "--project-root", "--refresh", "--semantic-diff", "--ttl-hours", "--max-lines", "--json"]),
    contract!("session lane", ["--project-root", "--name", "--goal", "--agent", "--mode", "--nested-policy", "--nesting-intent", "--prompt", "--model", "--budget", "--topology", "--contract", "--clear", "--list", "--json"]),
    contract!("session context-cache", ["--session", "--project-root", "--key", "--refresh", "--list", "--clear", "--from", "--ttl-hours", "--max-lines", "--json"]),
    contract!("session budget-observe", ["--from", "--from-jsonl", "--tokens", "--seconds", "--steps", "--json"]),
    contract!("session budget-enforce", ["--from", "--from-jsonl", "--tokens", "--seconds", "--steps", "--max-tokens", "--max-seconds", "--max-steps", "--json"]),
    contract!("session budget-plan", ["--project-root", "--goal", "--agent", "--profile", "--budget", "--topology", "--from-state", "--json"]),
    contract!("session replay", ["--from-checkpoint", "--project-root", "--json"]),
    contract!("session anomaly", ["--session", "--project-root", "--events", "--auto-remediate", "--json"]),
    contract!("session loop", ["--session", "--project-root", "--poll-interval", "--max-polls", "--strategy", "--events", "--lines", "--token-budget", "--cursor-file", "--handoff-cursor-file", "--schema", "--steps", "--max-tokens", "--max-seconds", "--max-steps", "--json", "--json-min"]),
    contract!("session turn", ["--session", "--project-root", "--text", "--keys", "--enter", "--agent", "--mode", "--expect", "--poll-interval", "--max-polls", "--timeout-seconds", "--stop-on-waiting", "--waiting-requires-turn-complete", "--until-marker", "--until-state", "--lines", "--events", "--token-budget", "--summary-style", "--cursor-file", "--fields", "--json", "--json-min"]),
    contract!("session schema", ["--command", "--json"]),
    contract!("session contract-check", ["--project-root", "--skill-doc", "--json", "--json-min"]),
    contract!("session state-sandbox", ["--action", "--project-root", "--file", "--json", "--json-min"]),
    contract!("session prompt-lint", ["--project-root", "--agent", "--mode", "--nested-policy", "--nesting-intent", "--prompt", "--model", "--markers", "--budget", "--strict", "--rewrite", "--json"]),
    contract!("skills sync", ["--from", "--repo-root", "--json"]),
    contract!("skills install", ["--to", "--repo-root", "--json"]),
    contract!("skills doctor", ["--repo-root", "--path", "--deep", "--explain-drift", "--contract-check", "--json"]),
];

/// Commands whose payloads turn, loop and replay parse.
pub const REQUIRED_SCHEMA_COMMANDS: &[&str] = &[
    "session status",
    "session monitor",
    "session send",
    "session packet",
    "session handoff",
    "session diff-pack",
    "session next",
    "session turn",
    "session loop",
];

fn schema(required: &[&str], properties: &[(&str, &str)]) -> Value {
    let props: Map<String, Value> = properties
        .iter()
        .map(|(name, kind)| ((*name).to_string(), json!({ "type": kind })))
        .collect();
    let mut out = obj(json!({ "type": "object", "properties": props }));
    if !required.is_empty() {
        out.insert("required".into(), json!(required));
    }
    Value::Object(out)
}

static SCHEMA_CATALOG: Lazy<BTreeMap<&'static str, Value>> = Lazy::new(|| {
    let status_fields = [
        ("session", "string"),
        ("status", "string"),
        ("sessionState", "string"),
        ("reason", "string"),
        ("errorCode", "string"),
    ];
    let mut catalog = BTreeMap::new();
    catalog.insert("session status", schema(&["session", "status", "sessionState"], &status_fields));
    catalog.insert(
        "session monitor",
        schema(
            &["session", "finalState", "exitReason", "polls"],
            &[
                ("session", "string"),
                ("finalState", "string"),
                ("finalStatus", "string"),
                ("exitReason", "string"),
                ("polls", "integer"),
                ("errorCode", "string"),
            ],
        ),
    );
    catalog.insert(
        "session capture",
        schema(
            &["session"],
            &[
                ("session", "string"),
                ("capture", "string"),
                ("summary", "string"),
                ("markers", "array"),
                ("foundMarkers", "array"),
                ("missingMarkers", "array"),
                ("markerCounts", "object"),
                ("deltaFrom", "string"),
                ("deltaMode", "string"),
                ("semanticDelta", "string"),
                ("semanticLines", "array"),
                ("nextOffset", "integer"),
            ],
        ),
    );
    catalog.insert(
        "session spawn",
        schema(
            &["session", "agent", "mode", "runId", "projectRoot"],
            &[
                ("session", "string"),
                ("agent", "string"),
                ("mode", "string"),
                ("lane", "string"),
                ("runId", "string"),
                ("projectRoot", "string"),
                ("socketPath", "string"),
                ("command", "string"),
                ("dryRun", "boolean"),
                ("errorCode", "string"),
            ],
        ),
    );
    catalog.insert(
        "session kill",
        schema(
            &["session", "ok", "found"],
            &[("session", "string"), ("ok", "boolean"), ("found", "boolean"), ("errorCode", "string")],
        ),
    );
    catalog.insert(
        "session send",
        schema(&["ok", "session"], &[("ok", "boolean"), ("session", "string"), ("errorCode", "string")]),
    );
    catalog.insert(
        "session packet",
        schema(
            &["session", "status", "sessionState", "nextAction"],
            &[
                ("session", "string"),
                ("status", "string"),
                ("sessionState", "string"),
                ("nextAction", "string"),
                ("nextOffset", "integer"),
                ("summary", "string"),
                ("summaryStyle", "string"),
                ("recent", "array"),
                ("deltaCount", "integer"),
            ],
        ),
    );
    catalog.insert(
        "session handoff",
        schema(
            &["session", "sessionState", "nextAction"],
            &[
                ("session", "string"),
                ("status", "string"),
                ("sessionState", "string"),
                ("schema", "string"),
                ("nextAction", "string"),
                ("nextOffset", "integer"),
                ("summary", "string"),
                ("recent", "array"),
                ("state", "object"),
                ("risks", "array"),
                ("openQuestions", "array"),
            ],
        ),
    );
    catalog.insert(
        "session context-pack",
        schema(
            &["session", "pack"],
            &[
                ("session", "string"),
                ("sessionState", "string"),
                ("strategy", "string"),
                ("tokenBudget", "integer"),
                ("truncated", "boolean"),
                ("pack", "string"),
            ],
        ),
    );
    catalog.insert(
        "session diff-pack",
        schema(
            &["session", "changed"],
            &[
                ("session", "string"),
                ("sessionState", "string"),
                ("nextAction", "string"),
                ("changed", "boolean"),
                ("addedLines", "array"),
                ("removedLines", "array"),
                ("tokenBudget", "integer"),
                ("pack", "string"),
            ],
        ),
    );
    catalog.insert(
        "session next",
        schema(
            &["session", "nextAction", "recommendedCommand"],
            &[
                ("session", "string"),
                ("sessionState", "string"),
                ("nextAction", "string"),
                ("recommendedCommand", "string"),
                ("reason", "string"),
                ("budget", "integer"),
            ],
        ),
    );
    catalog.insert(
        "session route",
        schema(
            &["goal", "agent"],
            &[
                ("goal", "string"),
                ("agent", "string"),
                ("mode", "string"),
                ("model", "string"),
                ("command", "string"),
                ("queue", "array"),
                ("runbook", "object"),
                ("costEstimate", "object"),
            ],
        ),
    );
    catalog.insert(
        "session list",
        schema(
            &["sessions", "count"],
            &[("sessions", "array"), ("count", "integer"), ("items", "array"), ("delta", "object")],
        ),
    );
    catalog.insert(
        "session aggregate",
        schema(
            &["sessions", "items", "pack"],
            &[
                ("sessions", "array"),
                ("items", "array"),
                ("pack", "string"),
                ("perSessionBudget", "integer"),
                ("notFoundCount", "integer"),
                ("delta", "object"),
            ],
        ),
    );
    catalog.insert(
        "session checkpoint",
        schema(
            &["ok", "action", "file"],
            &[("ok", "boolean"), ("action", "string"), ("file", "string"), ("checkpoint", "object")],
        ),
    );
    catalog.insert(
        "session replay",
        schema(
            &["ok", "deterministicId", "steps"],
            &[("ok", "boolean"), ("deterministicId", "string"), ("steps", "array")],
        ),
    );
    catalog.insert(
        "session anomaly",
        schema(
            &["session", "findings"],
            &[("session", "string"), ("findings", "array"), ("count", "integer"), ("remediation", "array")],
        ),
    );
    catalog.insert(
        "session budget-enforce",
        schema(
            &["ok", "observed"],
            &[("ok", "boolean"), ("observed", "object"), ("limits", "object"), ("violations", "array")],
        ),
    );
    catalog.insert(
        "session turn",
        schema(
            &["ok", "session"],
            &[
                ("ok", "boolean"),
                ("session", "string"),
                ("failedStep", "string"),
                ("send", "object"),
                ("monitor", "object"),
                ("packet", "object"),
                ("finalState", "string"),
                ("nextAction", "string"),
            ],
        ),
    );
    catalog.insert(
        "session loop",
        schema(
            &["ok", "session", "observed"],
            &[
                ("ok", "boolean"),
                ("session", "string"),
                ("rounds", "array"),
                ("observed", "object"),
                ("limits", "object"),
                ("violations", "array"),
                ("failedStep", "string"),
            ],
        ),
    );
    catalog.insert(
        "session guard",
        schema(
            &["ok", "risk"],
            &[("ok", "boolean"), ("risk", "string"), ("sharedTmux", "boolean"), ("reasons", "array")],
        ),
    );
    catalog.insert(
        "session smoke",
        schema(&["ok", "checks"], &[("ok", "boolean"), ("checks", "array"), ("failed", "integer")]),
    );
    catalog.insert(
        "session state-sandbox",
        schema(&["ok", "action"], &[("ok", "boolean"), ("action", "string"), ("file", "string")]),
    );
    catalog
});

/// `status`, `session status` and `SESSION  status` all map to `session status`.
pub fn normalize_schema_command_name(name: &str) -> String {
    let words: Vec<String> = name.split_whitespace().map(str::to_lowercase).collect();
    match words.first().map(String::as_str) {
        None => String::new(),
        Some("session") | Some("skills") => words.join(" "),
        Some(_) => format!("session {}", words.join(" ")),
    }
}

pub fn schema_for(command: &str) -> Option<&'static Value> {
    SCHEMA_CATALOG.get(normalize_schema_command_name(command).as_str())
}

/// `session schema`: the whole catalog, or one entry with `--command`.
pub fn schema_command(command: &str) -> CommandOutput {
    run(|| {
        if command.trim().is_empty() {
            return Ok(CommandOutput::ok(obj(json!({ "commands": &*SCHEMA_CATALOG }))));
        }
        let normalized = normalize_schema_command_name(command);
        let schema = SCHEMA_CATALOG.get(normalized.as_str()).ok_or_else(|| {
            LisaError::invalid("unknown_schema_command", format!("unknown --command: {}", command.trim()))
        })?;
        Ok(CommandOutput::ok(obj(json!({ "command": normalized, "schema": schema }))))
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractCheckItem {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl ContractCheckItem {
    fn pass(name: String) -> Self {
        Self { name, ok: true, detail: String::new() }
    }

    fn fail(name: String, detail: String) -> Self {
        Self { name, ok: false, detail }
    }
}

/// True when `needle` occurs in `doc` as a whole token: the following
/// character must not extend it (`--json` does not match `--json-min`).
fn mentions(doc: &str, needle: &str) -> bool {
    doc.match_indices(needle).any(|(idx, _)| {
        let before_ok = doc[..idx]
            .chars()
            .next_back()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '-' || c == '_'));
        let after_ok = doc[idx + needle.len()..]
            .chars()
            .next()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '-' || c == '_'));
        before_ok && after_ok
    })
}

/// Runs every contract check against the skill doc text.
///
/// `doc` is `None` when the doc could not be read; doc checks then fail
/// with `missing_detail` while schema checks still run.
pub fn run_contract_checks(doc: Option<&str>, missing_detail: &str) -> Vec<ContractCheckItem> {
    let mut items = Vec::new();
    for command in REQUIRED_SCHEMA_COMMANDS {
        let name = format!("schema:{command}");
        items.push(if SCHEMA_CATALOG.contains_key(command) {
            ContractCheckItem::pass(name)
        } else {
            ContractCheckItem::fail(name, format!("no schema entry for {command}"))
        });
    }
    for contract in COMMAND_CONTRACTS {
        let command_check = format!("doc:command:{}", contract.name);
        let flags_check = format!("doc:flags:{}", contract.name);
        let Some(doc) = doc else {
            items.push(ContractCheckItem::fail(command_check, missing_detail.to_string()));
            items.push(ContractCheckItem::fail(flags_check, missing_detail.to_string()));
            continue;
        };
        items.push(if mentions(doc, contract.name) {
            ContractCheckItem::pass(command_check)
        } else {
            ContractCheckItem::fail(command_check, format!("skill doc does not mention `{}`", contract.name))
        });
        let missing: Vec<&str> = contract.flags.iter().copied().filter(|f| !mentions(doc, f)).collect();
        items.push(if missing.is_empty() {
            ContractCheckItem::pass(flags_check)
        } else {
            ContractCheckItem::fail(flags_check, format!("missing flags: {}", missing.join(", ")))
        });
    }
    items
}

/// Reads the skill doc, returning the text or the failure detail.
pub fn read_skill_doc(path: &Path) -> std::result::Result<String, String> {
    fs_err::read_to_string(path).map_err(|e| e.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct ContractCheckRequest {
    pub project_root: String,
    /// Overrides `<root>/skills/lisa/data/commands.md`.
    pub skill_doc: String,
    pub json_min: bool,
}

pub fn contract_check_command(engine: &Engine, req: &ContractCheckRequest) -> CommandOutput {
    run(|| {
        let root = engine.canonical_root(&req.project_root);
        let doc_path = if req.skill_doc.trim().is_empty() {
            repo_skill_doc(Path::new(&root))
        } else {
            PathBuf::from(req.skill_doc.trim())
        };
        let (doc, missing_detail) = match read_skill_doc(&doc_path) {
            Ok(text) => (Some(text), String::new()),
            Err(err) => (None, format!("skill doc unreadable: {err}")),
        };
        let items = run_contract_checks(doc.as_deref(), &missing_detail);
        let failed = items.iter().filter(|i| !i.ok).count();
        debug!(checked = items.len(), failed, doc = %doc_path.display(), "contract check");

        let shown: Vec<&ContractCheckItem> = if req.json_min {
            items.iter().filter(|i| !i.ok).collect()
        } else {
            items.iter().collect()
        };
        let mut payload = obj(json!({
            "ok": failed == 0,
            "checked": items.len(),
            "failed": failed,
            "checks": shown,
        }));
        if !req.json_min {
            payload.insert("projectRoot".into(), json!(root));
            payload.insert("skillDoc".into(), json!(doc_path.to_string_lossy()));
        }
        if failed > 0 {
            warn!(failed, "contract check found drift");
            payload.insert("errorCode".into(), json!("session_contract_check_failed"));
            payload.insert("error".into(), json!(format!("{failed} contract checks failed")));
            return Ok(CommandOutput::with_exit(payload, 1));
        }
        Ok(CommandOutput::ok(payload))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lisa_protocol::str_field;
    use tempfile::TempDir;

    /// Renders a skill doc section listing every command with its flags.
    fn render_command_reference() -> String {
        let mut out = String::from("# lisa command reference\n");
        for contract in COMMAND_CONTRACTS {
            out.push_str(&format!("\n## {}\n\n", contract.name));
            for flag in contract.flags {
                out.push_str(&format!("- `{flag}`\n"));
            }
        }
        out
    }

    #[test]
    fn test_normalize_schema_command_name() {
        assert_eq!(normalize_schema_command_name("status"), "session status");
        assert_eq!(normalize_schema_command_name("  Session   Monitor "), "session monitor");
        assert_eq!(normalize_schema_command_name("skills doctor"), "skills doctor");
        assert_eq!(normalize_schema_command_name(" "), "");
    }

    #[test]
    fn test_schema_command_lookup() {
        let out = schema_command("monitor");
        assert_eq!(out.exit_code, 0);
        assert_eq!(str_field(&out.payload, "command"), "session monitor");
        assert_eq!(out.payload["schema"]["required"][1], "finalState");

        let all = schema_command("");
        assert!(all.payload["commands"]["session loop"].is_object());

        let unknown = schema_command("session teleport");
        assert_eq!(unknown.error_code(), Some("unknown_schema_command"));
    }

    #[test]
    fn test_every_required_command_has_schema() {
        for command in REQUIRED_SCHEMA_COMMANDS {
            assert!(schema_for(command).is_some(), "{command}");
        }
    }

    #[test]
    fn test_mentions_respects_token_boundaries() {
        assert!(mentions("use `--json` here", "--json"));
        assert!(!mentions("only --json-min", "--json"));
        assert!(!mentions("x--json", "--json"));
        assert!(mentions("lisa session status --json", "session status"));
        assert!(!mentions("session status-board", "session status"));
    }

    #[test]
    fn test_generated_reference_passes_all_checks() {
        let doc = render_command_reference();
        let items = run_contract_checks(Some(&doc), "");
        assert!(items.iter().all(|i| i.ok), "{:?}", items.iter().find(|i| !i.ok));
    }

    #[test]
    fn test_contract_check_reports_drift() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let doc = tmp.path().join("commands.md");
        let text = render_command_reference().replace("- `--semantic-only`\n", "");
        std::fs::write(&doc, text).unwrap();

        let req = ContractCheckRequest {
            project_root: tmp.path().to_string_lossy().into_owned(),
            skill_doc: doc.to_string_lossy().into_owned(),
            json_min: true,
        };
        let out = contract_check_command(&engine, &req);
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.error_code(), Some("session_contract_check_failed"));
        assert_eq!(out.payload["failed"], 1);
        let checks = out.payload["checks"].as_array().unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0]["name"], "doc:flags:session diff-pack");
        assert_eq!(checks[0]["detail"], "missing flags: --semantic-only");
    }

    #[test]
    fn test_contract_check_missing_doc_fails_doc_items_only() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let req = ContractCheckRequest {
            project_root: tmp.path().to_string_lossy().into_owned(),
            ..ContractCheckRequest::default()
        };
        let out = contract_check_command(&engine, &req);
        assert_eq!(out.exit_code, 1);
        let checked = out.payload["checked"].as_u64().unwrap() as usize;
        assert_eq!(checked, REQUIRED_SCHEMA_COMMANDS.len() + COMMAND_CONTRACTS.len() * 2);
        assert_eq!(out.payload["failed"].as_u64().unwrap() as usize, COMMAND_CONTRACTS.len() * 2);
        assert!(str_field(&out.payload, "skillDoc").ends_with("commands.md"));
    }
}
