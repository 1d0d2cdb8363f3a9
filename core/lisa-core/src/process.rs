//! Process inspection helpers: agent process discovery under a pane.
//!
//! The pane's shell is the root of a process tree; the agent is the
//! descendant whose executable (or wrapped executable, e.g. `node claude`)
//! best matches the agent name. Matching is a pure function over a process
//! list so it can be tested without a live system.

use std::path::Path;
use sysinfo::{ProcessRefreshKind, System, UpdateKind};

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub cpu: f64,
    pub command: String,
}

/// Best-matching agent process under a pane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentProcess {
    pub pid: u32,
    pub cpu: f64,
}

/// Snapshot of all processes with their CPU usage.
pub fn list_processes() -> Vec<ProcessInfo> {
    let refresh = ProcessRefreshKind::new()
        .with_cpu()
        .with_cmd(UpdateKind::OnlyIfNotSet);
    let mut sys = System::new();
    sys.refresh_processes_specifics(refresh);
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_processes_specifics(refresh);

    sys.processes()
        .iter()
        .map(|(pid, process)| {
            let command = if process.cmd().is_empty() {
                process.name().to_string()
            } else {
                process.cmd().join(" ")
            };
            ProcessInfo {
                pid: pid.as_u32(),
                ppid: process.parent().map(|p| p.as_u32()).unwrap_or(0),
                cpu: process.cpu_usage() as f64,
                command,
            }
        })
        .collect()
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

fn primary_executable(agent: &str) -> &'static str {
    if agent.trim().eq_ignore_ascii_case("codex") {
        "codex"
    } else {
        "claude"
    }
}

fn executable_name(command: &str) -> String {
    command
        .split_whitespace()
        .next()
        .map(|first| {
            Path::new(first)
                .file_name()
                .map(|n| n.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default()
        })
        .unwrap_or_default()
}

fn executable_matches(executable: &str, primary: &str) -> bool {
    !executable.is_empty()
        && (executable == primary
            || executable.starts_with(&format!("{primary}-"))
            || executable.ends_with(&format!("-{primary}")))
}

fn is_wrapper_runner(executable: &str) -> bool {
    matches!(
        executable,
        "node" | "bun" | "deno" | "python" | "python3" | "npx" | "bunx" | "sh" | "bash" | "zsh"
    )
}

/// `env FOO=1 node /path/claude --flag` style invocations.
fn references_primary_binary(command: &str, primary: &str) -> bool {
    let fields: Vec<&str> = command.split_whitespace().collect();
    if fields.len() < 2 {
        return false;
    }
    let mut idx = 1;
    let mut runner = executable_name(fields[0]);
    if runner == "env" {
        while idx < fields.len() && fields[idx].contains('=') {
            idx += 1;
        }
        if idx >= fields.len() {
            return false;
        }
        runner = executable_name(fields[idx]);
        idx += 1;
    }
    if !is_wrapper_runner(&runner) {
        return false;
    }
    fields[idx..]
        .iter()
        .find(|token| !token.starts_with('-'))
        .map(|token| executable_matches(&executable_name(token), primary))
        .unwrap_or(false)
}

/// Breadth-first search under `pane_pid` for the best agent candidate.
///
/// Scores: exact executable 3, wrapped binary 2. Ties go to higher CPU.
pub fn detect_agent_process(
    processes: &[ProcessInfo],
    pane_pid: u32,
    agent: &str,
) -> Option<AgentProcess> {
    if pane_pid == 0 {
        return None;
    }
    let primary = primary_executable(agent);
    let mut best: Option<(u8, AgentProcess)> = None;
    let mut consider = |p: &ProcessInfo| {
        let lower = p.command.to_ascii_lowercase();
        if lower.contains("grep") {
            return;
        }
        let score = if executable_matches(&executable_name(&lower), primary) {
            3
        } else if references_primary_binary(&lower, primary) {
            2
        } else {
            return;
        };
        let candidate = AgentProcess {
            pid: p.pid,
            cpu: p.cpu,
        };
        let replace = match &best {
            None => true,
            Some((best_score, current)) => {
                score > *best_score || (score == *best_score && p.cpu > current.cpu)
            }
        };
        if replace {
            best = Some((score, candidate));
        }
    };

    if let Some(pane) = processes.iter().find(|p| p.pid == pane_pid) {
        consider(pane);
    }
    let mut queue = vec![pane_pid];
    let mut seen = std::collections::HashSet::new();
    while let Some(current) = queue.pop() {
        if !seen.insert(current) {
            continue;
        }
        for child in processes.iter().filter(|p| p.ppid == current && p.pid != current) {
            queue.push(child.pid);
            consider(child);
        }
    }
    best.map(|(_, agent)| agent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc(pid: u32, ppid: u32, cpu: f64, command: &str) -> ProcessInfo {
        ProcessInfo {
            pid,
            ppid,
            cpu,
            command: command.to_string(),
        }
    }

    #[test]
    fn test_detects_direct_child_agent() {
        let procs = vec![
            proc(10, 1, 0.0, "-zsh"),
            proc(11, 10, 12.5, "/usr/local/bin/claude --dangerously"),
        ];
        let found = detect_agent_process(&procs, 10, "claude").unwrap();
        assert_eq!(found.pid, 11);
        assert_eq!(found.cpu, 12.5);
    }

    #[test]
    fn test_prefers_exact_binary_over_wrapper() {
        let procs = vec![
            proc(10, 1, 0.0, "bash"),
            proc(11, 10, 50.0, "node /opt/codex/bin/codex exec"),
            proc(12, 11, 1.0, "codex exec --json"),
        ];
        let found = detect_agent_process(&procs, 10, "codex").unwrap();
        assert_eq!(found.pid, 12);
    }

    #[test]
    fn test_env_wrapped_invocation_matches() {
        assert!(references_primary_binary(
            "env a=1 node /x/claude -p",
            "claude"
        ));
        assert!(!references_primary_binary("vim claude.txt", "claude"));
    }

    #[test]
    fn test_ignores_unrelated_tree_and_grep() {
        let procs = vec![
            proc(10, 1, 0.0, "bash"),
            proc(11, 10, 0.0, "grep claude"),
            proc(20, 1, 0.0, "claude"),
        ];
        assert!(detect_agent_process(&procs, 10, "claude").is_none());
        assert!(detect_agent_process(&procs, 0, "claude").is_none());
    }

    #[test]
    fn test_pid_zero_is_not_alive() {
        assert!(!pid_alive(0));
        assert!(pid_alive(std::process::id()));
    }
}
