//! Payload shaping: token-budget truncation, redaction, field projection,
//! and cursor files.
//!
//! ## Redaction
//!
//! Rules are `none|all|paths|emails|secrets|numbers|tokens`. `all` expands to
//! every concrete rule; `none` anywhere in the set disables redaction.
//! Replacements run in a fixed order (emails, secrets, tokens, numbers,
//! paths) so the result does not depend on how the rules were listed.

use crate::capture::dedupe_non_empty;
use crate::clock::format_utc_seconds;
use crate::error::{LisaError, Result};
use crate::storage::{read_optional, write_file_atomic};
use chrono::{DateTime, Utc};
use lisa_protocol::Payload;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};

static EMAIL_REDACT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[A-Z0-9._%+\-]+@[A-Z0-9.\-]+\.[A-Z]{2,}\b").expect("valid regex")
});
static PATH_REDACT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:^|[\s"'=])(/[^ \n\r\t"'=]+)"#).expect("valid regex"));
static SECRET_ASSIGN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(api[_-]?key|token|secret|password|passwd)\b\s*[:=]\s*["']?([^\s"']+)"#)
        .expect("valid regex")
});
static LONG_NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{6,}\b").expect("valid regex"));
static BEARER_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bBearer\s+[A-Za-z0-9._\-]{8,}").expect("valid regex"));

const REDACTION_RULES: [&str; 7] = ["none", "all", "paths", "emails", "secrets", "numbers", "tokens"];

// ═══════════════════════════════════════════════════════════════════════════════
// Token Budget
// ═══════════════════════════════════════════════════════════════════════════════

/// Caps `input` at `4 * budget` bytes, marking the cut with `...`.
///
/// Returns `(text, truncated)`. A non-positive budget yields an empty string.
pub fn truncate_to_token_budget(input: &str, token_budget: i64) -> (String, bool) {
    if token_budget <= 0 {
        return (String::new(), false);
    }
    let max_chars = usize::try_from(token_budget.saturating_mul(4)).unwrap_or(usize::MAX);
    if input.len() <= max_chars {
        return (input.to_string(), false);
    }
    if max_chars <= 3 {
        return (input[..floor_char_boundary(input, max_chars)].to_string(), true);
    }
    let cut = floor_char_boundary(input, max_chars - 3);
    (format!("{}...", &input[..cut]), true)
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

// ═══════════════════════════════════════════════════════════════════════════════
// Comma Lists
// ═══════════════════════════════════════════════════════════════════════════════

/// Trimmed, non-empty, order-preserving dedupe.
pub fn parse_comma_values(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .filter(|v| seen.insert(v.to_string()))
        .map(str::to_string)
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redaction
// ═══════════════════════════════════════════════════════════════════════════════

pub fn parse_redaction_rules(raw: &str) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut rules = Vec::new();
    for part in raw.split(',') {
        let rule = part.trim().to_ascii_lowercase();
        if rule.is_empty() {
            continue;
        }
        if !REDACTION_RULES.contains(&rule.as_str()) {
            return Err(LisaError::invalid(
                "invalid_redact_rules",
                format!(
                    "invalid --redact rule: {rule} (expected none|all|paths|emails|secrets|numbers|tokens)"
                ),
            ));
        }
        if seen.insert(rule.clone()) {
            rules.push(rule);
        }
    }
    Ok(rules)
}

pub fn apply_redaction_rules<S: AsRef<str>>(text: &str, rules: &[S]) -> String {
    let mut enabled: BTreeSet<&str> = rules.iter().map(AsRef::as_ref).collect();
    if enabled.is_empty() || enabled.contains("none") {
        return text.to_string();
    }
    if enabled.contains("all") {
        enabled.extend(["paths", "emails", "secrets", "numbers", "tokens"]);
    }

    let mut out = text.to_string();
    if enabled.contains("emails") {
        out = EMAIL_REDACT_RE.replace_all(&out, "[REDACTED_EMAIL]").into_owned();
    }
    if enabled.contains("secrets") {
        out = SECRET_ASSIGN_RE
            .replace_all(&out, "${1}=[REDACTED_SECRET]")
            .into_owned();
    }
    if enabled.contains("tokens") {
        out = BEARER_TOKEN_RE
            .replace_all(&out, "Bearer [REDACTED_TOKEN]")
            .into_owned();
    }
    if enabled.contains("numbers") {
        out = LONG_NUMBER_RE.replace_all(&out, "[REDACTED_NUMBER]").into_owned();
    }
    if enabled.contains("paths") {
        out = PATH_REDACT_RE
            .replace_all(&out, |caps: &Captures| {
                let whole = caps.get(0).map(|m| m.as_str()).unwrap_or("");
                let prefix = whole
                    .chars()
                    .next()
                    .filter(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '='))
                    .map(String::from)
                    .unwrap_or_default();
                format!("{prefix}[REDACTED_PATH]")
            })
            .into_owned();
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// Field Projection
// ═══════════════════════════════════════════════════════════════════════════════

/// Parses `--fields a,b.c` into deduplicated dotted paths. A blank value
/// means no projection.
pub fn parse_projection_fields(raw: &str) -> Result<Vec<String>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut seen = HashSet::new();
    let mut fields = Vec::new();
    for part in raw.split(',') {
        let field = part.trim();
        if field.is_empty() {
            continue;
        }
        if field.split('.').any(|segment| segment.trim().is_empty()) {
            return Err(LisaError::invalid(
                "invalid_fields",
                format!("invalid --fields: empty path segment in {field:?}"),
            ));
        }
        if seen.insert(field.to_string()) {
            fields.push(field.to_string());
        }
    }
    if fields.is_empty() {
        return Err(LisaError::invalid(
            "invalid_fields",
            "invalid --fields: expected comma-separated field paths",
        ));
    }
    Ok(fields)
}

/// Deep-selects dotted paths. Missing paths are omitted, never `null`.
pub fn project_payload_fields<S: AsRef<str>>(payload: &Payload, fields: &[S]) -> Payload {
    let mut out = Payload::new();
    for field in fields {
        let path: Vec<&str> = field.as_ref().split('.').collect();
        if let Some(value) = lookup_path(payload, &path) {
            assign_path(&mut out, &path, value.clone());
        }
    }
    out
}

fn lookup_path<'a>(payload: &'a Payload, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = payload.get(*first)?;
    for segment in rest {
        current = current.as_object()?.get(*segment)?;
    }
    Some(current)
}

fn assign_path(payload: &mut Payload, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = payload;
    for segment in parents {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Payload::new()));
        if !slot.is_object() {
            *slot = Value::Object(Payload::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => return,
        };
    }
    current.insert(last.to_string(), value);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cursor Files
// ═══════════════════════════════════════════════════════════════════════════════

/// Decimal offset; missing or empty file is 0, negative clamps to 0.
pub fn load_cursor_offset(path: &Path) -> Result<usize> {
    let raw = read_optional(path)?.unwrap_or_default();
    let value = raw.trim();
    if value.is_empty() {
        return Ok(0);
    }
    let n: i64 = value.parse().map_err(|_| {
        LisaError::invalid(
            "invalid_delta_from",
            format!("invalid cursor file offset: {value:?}"),
        )
    })?;
    Ok(usize::try_from(n).unwrap_or(0))
}

pub fn write_cursor_offset(path: &Path, offset: usize) -> Result<()> {
    write_file_atomic(path, format!("{offset}\n").as_bytes()).map_err(|e| {
        LisaError::coded(
            "cursor_file_write_failed",
            format!("failed to write cursor file {}: {e}", path.display()),
        )
    })
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SemanticCursor {
    updated_at: String,
    lines: Vec<String>,
}

pub fn semantic_cursor_path(cursor_file: &Path) -> PathBuf {
    let mut os = cursor_file.as_os_str().to_owned();
    os.push(".semantic.json");
    PathBuf::from(os)
}

pub fn load_semantic_cursor(path: &Path) -> Result<Vec<String>> {
    let Some(raw) = read_optional(path)? else {
        return Ok(Vec::new());
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let cursor: SemanticCursor = serde_json::from_str(&raw)
        .map_err(|e| LisaError::json(format!("semantic cursor {}", path.display()), e))?;
    Ok(dedupe_non_empty(&cursor.lines))
}

pub fn save_semantic_cursor(path: &Path, lines: &[String], now: DateTime<Utc>) -> Result<()> {
    let cursor = SemanticCursor {
        updated_at: format_utc_seconds(now),
        lines: dedupe_non_empty(lines),
    };
    let data = serde_json::to_string_pretty(&cursor)
        .map_err(|e| LisaError::json("serialize semantic cursor", e))?;
    write_file_atomic(path, data.as_bytes())
}

/// Contents of a `<flag> <path>` argument; `-` reads stdin.
pub fn read_text_source(flag: &str, code: &str, source: &str) -> Result<String> {
    let source = source.trim();
    if source.is_empty() {
        return Err(LisaError::invalid(code, format!("failed loading {flag}: empty source")));
    }
    if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| LisaError::io("read stdin", e))?;
        return Ok(buf);
    }
    let path = crate::paths::expand_user_path(source)
        .ok_or_else(|| LisaError::invalid(code, format!("invalid {flag}: {source}")))?;
    std::fs::read_to_string(&path).map_err(|e| LisaError::io(format!("read {}", path.display()), e))
}

/// A JSON object read from a `<flag> <path|->` argument.
pub fn load_json_object(flag: &str, code: &str, source: &str) -> Result<Payload> {
    let raw = read_text_source(flag, code, source)?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(LisaError::invalid(code, format!("failed loading {flag}: expected a JSON object"))),
        Err(e) => Err(LisaError::invalid(code, format!("failed loading {flag}: {e}"))),
    }
}

/// Last line of a log that holds a JSON object, ignoring any text before
/// the first `{` on that line.
pub fn parse_latest_json_object(text: &str) -> Option<Payload> {
    text.lines().rev().find_map(|line| {
        let start = line.find('{')?;
        match serde_json::from_str::<Value>(line[start..].trim()) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    })
}

/// Resolves a user-supplied file flag to an absolute, cleaned path.
pub fn resolve_file_flag(flag: &str, raw: &str) -> Result<Option<PathBuf>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    crate::paths::expand_user_path(raw)
        .map(Some)
        .ok_or_else(|| LisaError::invalid("invalid_file_path", format!("invalid {flag}: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_truncation_boundary() {
        let input = "x".repeat(2800);
        let (out, truncated) = truncate_to_token_budget(&input, 700);
        assert_eq!((out.len(), truncated), (2800, false));

        let (out, truncated) = truncate_to_token_budget(&input, 699);
        assert_eq!(out.len(), 2796);
        assert!(out.ends_with("..."));
        assert!(truncated);
    }

    #[test]
    fn test_truncation_tiny_budget_and_multibyte() {
        let (out, truncated) = truncate_to_token_budget("abcdefgh", 0);
        assert_eq!((out.as_str(), truncated), ("", false));
        let input = "é".repeat(10);
        let (out, truncated) = truncate_to_token_budget(&input, 2);
        assert!(truncated);
        assert!(out.len() <= 8);
        assert!(input.starts_with(out.trim_end_matches("...")));
    }

    #[test]
    fn test_redaction_precedence() {
        let input = "dev@ex.com token=abc12345 Bearer abcdefghijkl 1234567 /tmp/x";
        let all = apply_redaction_rules(input, &["all"]);
        for tag in [
            "[REDACTED_EMAIL]",
            "[REDACTED_SECRET]",
            "[REDACTED_TOKEN]",
            "[REDACTED_NUMBER]",
            "[REDACTED_PATH]",
        ] {
            assert!(all.contains(tag), "missing {tag} in {all}");
        }
        assert_eq!(apply_redaction_rules(input, &["none", "all"]), input);
    }

    #[test]
    fn test_all_equals_every_rule() {
        let input = "path=/etc/passwd mail a@b.io id 99999999 password: hunter22";
        let expanded = apply_redaction_rules(input, &["tokens", "paths", "numbers", "emails", "secrets"]);
        assert_eq!(apply_redaction_rules(input, &["all"]), expanded);
    }

    #[test]
    fn test_parse_redaction_rules_dedupes_and_validates() {
        assert_eq!(
            parse_redaction_rules("Paths, emails,paths").unwrap(),
            vec!["paths", "emails"]
        );
        assert!(parse_redaction_rules("").unwrap().is_empty());
        let err = parse_redaction_rules("paths,bogus").unwrap_err();
        assert_eq!(err.code(), "invalid_redact_rules");
        assert_eq!(parse_redaction_rules("none,all").unwrap(), vec!["none", "all"]);
    }

    #[test]
    fn test_comma_values_preserve_order() {
        assert_eq!(parse_comma_values(" b,a,,b , c"), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_projection_selects_existing_paths_only() {
        let payload = json!({"session": "s", "signals": {"heartbeatFresh": true, "x": 1}, "n": 2});
        let payload = payload.as_object().unwrap().clone();
        let fields = parse_projection_fields("session,signals.heartbeatFresh,missing.path").unwrap();
        let projected = project_payload_fields(&payload, &fields);
        assert_eq!(
            Value::Object(projected),
            json!({"session": "s", "signals": {"heartbeatFresh": true}})
        );
    }

    #[test]
    fn test_projection_field_errors() {
        assert_eq!(parse_projection_fields("a..b").unwrap_err().code(), "invalid_fields");
        assert_eq!(parse_projection_fields(" , ").unwrap_err().code(), "invalid_fields");
        assert_eq!(parse_projection_fields(",").unwrap_err().code(), "invalid_fields");
    }

    #[test]
    fn test_blank_fields_mean_no_projection() {
        assert!(parse_projection_fields("").unwrap().is_empty());
        assert!(parse_projection_fields("   ").unwrap().is_empty());
    }

    #[test]
    fn test_cursor_offsets() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("c.cursor");
        assert_eq!(load_cursor_offset(&path).unwrap(), 0);
        write_cursor_offset(&path, 42).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "42\n");
        assert_eq!(load_cursor_offset(&path).unwrap(), 42);
        std::fs::write(&path, "-3").unwrap();
        assert_eq!(load_cursor_offset(&path).unwrap(), 0);
        std::fs::write(&path, "abc").unwrap();
        assert_eq!(load_cursor_offset(&path).unwrap_err().code(), "invalid_delta_from");
    }

    #[test]
    fn test_semantic_cursor_sidecar() {
        let tmp = TempDir::new().unwrap();
        let cursor = tmp.path().join("pack.txt");
        let sidecar = semantic_cursor_path(&cursor);
        assert!(sidecar.to_string_lossy().ends_with("pack.txt.semantic.json"));
        assert!(load_semantic_cursor(&sidecar).unwrap().is_empty());
        let lines = vec!["a".to_string(), " a ".to_string(), "b".to_string()];
        save_semantic_cursor(&sidecar, &lines, Utc::now()).unwrap();
        assert_eq!(load_semantic_cursor(&sidecar).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_latest_json_object_skips_noise() {
        let log = "startup noise\n{\"tokens\":11}\nINFO runtime {\"tokens\":29,\"steps\":2}\ntrailing noise";
        let latest = parse_latest_json_object(log).unwrap();
        assert_eq!(latest["tokens"], 29);
        assert!(parse_latest_json_object("no json here\n[1,2]").is_none());
    }

    #[test]
    fn test_load_json_object_requires_object() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.json");
        std::fs::write(&path, "[1]").unwrap();
        let err = load_json_object("--from", "invalid_from", path.to_str().unwrap()).unwrap_err();
        assert_eq!(err.code(), "invalid_from");
        std::fs::write(&path, r#"{"tokens": 3}"#).unwrap();
        let map = load_json_object("--from", "invalid_from", path.to_str().unwrap()).unwrap();
        assert_eq!(map["tokens"], 3);
    }
}
