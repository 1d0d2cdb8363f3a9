//! Terminal multiplexer adapter.
//!
//! Everything lisa needs from tmux goes through [`TmuxAdapter`] so the
//! classifier and orchestration code can run against an in-memory fake.
//! [`CommandTmuxAdapter`] shells out to `tmux -S <socket>`, where the socket
//! comes from `LISA_TMUX_SOCKET` (set by [`crate::paths::RuntimeEnvScope`]).

use crate::error::{LisaError, Result};
use crate::paths::{canonical_project_root, project_hash, Paths, PROJECT_ROOT_ENV, TMUX_SOCKET_ENV};
use crate::process::{self, AgentProcess};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// `#{pane_dead}\t#{pane_dead_status}\t#{pane_current_command}\t#{pane_pid}`
pub const PANE_SNAPSHOT_FORMAT: &str =
    "#{pane_dead}\t#{pane_dead_status}\t#{pane_current_command}\t#{pane_pid}";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaneSnapshot {
    pub dead: bool,
    pub dead_status: String,
    pub current_command: String,
    pub pane_pid: String,
}

impl PaneSnapshot {
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.trim_end_matches(['\r', '\n']).splitn(4, '\t');
        let dead = parts.next().unwrap_or("").trim() == "1";
        let dead_status = parts.next().unwrap_or("").trim().to_string();
        let current_command = parts.next().unwrap_or("").trim().to_string();
        let pane_pid = parts.next().unwrap_or("").trim().to_string();
        Self {
            dead,
            dead_status,
            current_command,
            pane_pid,
        }
    }

    /// `exited:<code>`, `crashed:<code>`, or `alive`.
    pub fn status_label(&self) -> String {
        if self.dead {
            if self.dead_status.is_empty() {
                return "exited:0".to_string();
            }
            return format!("exited:{}", self.dead_status);
        }
        if !self.dead_status.is_empty() && self.dead_status != "0" {
            return format!("crashed:{}", self.dead_status);
        }
        "alive".to_string()
    }

    /// Parsed pane pid; `Ok(None)` when tmux reported nothing.
    pub fn pid(&self) -> std::result::Result<Option<u32>, String> {
        if self.pane_pid.is_empty() {
            return Ok(None);
        }
        self.pane_pid
            .parse::<u32>()
            .map(Some)
            .map_err(|_| format!("invalid pane pid: {}", self.pane_pid))
    }
}

/// Detached session launched by `session spawn`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSession {
    pub session: String,
    pub cwd: String,
    pub width: u32,
    pub height: u32,
    pub env: Vec<(String, String)>,
    /// Shell command run as the pane's process.
    pub command: String,
}

pub trait TmuxAdapter: Send + Sync {
    fn has_session(&self, session: &str) -> bool;
    fn new_session(&self, spec: &NewSession) -> Result<()>;
    fn kill_session(&self, session: &str) -> Result<()>;
    fn list_sessions(&self, project_only: bool, project_root: &str) -> Result<Vec<String>>;
    fn capture_pane(&self, session: &str, lines: usize) -> Result<String>;
    fn send_text(&self, session: &str, text: &str, enter: bool) -> Result<()>;
    fn send_keys(&self, session: &str, keys: &[String], enter: bool) -> Result<()>;
    fn pane_snapshot(&self, session: &str) -> Result<PaneSnapshot>;
    fn show_environment(&self, session: &str, key: &str) -> Result<Option<String>>;
    fn agent_process(&self, pane_pid: u32, agent: &str) -> Result<Option<AgentProcess>>;
    /// Sessions on the user's default tmux server (no `-S`).
    fn default_server_sessions(&self) -> Result<Vec<String>>;

    /// Whether calls read `LISA_TMUX_SOCKET` from the process environment.
    fn uses_runtime_env(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct CommandTmuxAdapter {
    paths: Paths,
    timeout: Duration,
}

impl CommandTmuxAdapter {
    pub fn new(paths: Paths, timeout: Duration) -> Self {
        Self { paths, timeout }
    }

    fn socket_path(&self) -> PathBuf {
        if let Ok(explicit) = std::env::var(TMUX_SOCKET_ENV) {
            if !explicit.trim().is_empty() {
                return PathBuf::from(explicit.trim());
            }
        }
        let root = std::env::var(PROJECT_ROOT_ENV).unwrap_or_default();
        self.paths.tmux_socket_path(&canonical_project_root(&root))
    }

    fn run(&self, input: Option<&str>, args: &[&str]) -> Result<String> {
        let socket = self.socket_path();
        if let Some(dir) = socket.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let mut full: Vec<String> = vec!["-S".into(), socket.to_string_lossy().to_string()];
        full.extend(args.iter().map(|a| a.to_string()));
        run_with_timeout("tmux", &full, input, self.timeout)
    }
}

fn is_no_sessions_output(output: &str) -> bool {
    let msg = output.trim().to_ascii_lowercase();
    !msg.is_empty()
        && (msg.contains("no server running")
            || msg.contains("failed to connect to server")
            || (msg.contains("error connecting to") && msg.contains("no such file or directory"))
            || msg == "no sessions"
            || msg.starts_with("no sessions "))
}

impl TmuxAdapter for CommandTmuxAdapter {
    fn has_session(&self, session: &str) -> bool {
        self.run(None, &["has-session", "-t", session]).is_ok()
    }

    fn new_session(&self, spec: &NewSession) -> Result<()> {
        let width = spec.width.to_string();
        let height = spec.height.to_string();
        let mut args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            spec.session.clone(),
            "-x".into(),
            width,
            "-y".into(),
            height,
            "-c".into(),
            spec.cwd.clone(),
        ];
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.command.clone());
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!(session = %spec.session, cwd = %spec.cwd, "tmux new-session");
        self.run(None, &refs).map(|_| ())
    }

    fn kill_session(&self, session: &str) -> Result<()> {
        self.run(None, &["kill-session", "-t", session]).map(|_| ())
    }

    fn list_sessions(&self, project_only: bool, project_root: &str) -> Result<Vec<String>> {
        let out = match self.run(None, &["list-sessions", "-F", "#{session_name}"]) {
            Ok(out) => out,
            Err(LisaError::CommandFailed { details, .. }) if is_no_sessions_output(&details) => {
                return Ok(Vec::new())
            }
            Err(err) => return Err(err),
        };
        let expected = project_hash(project_root);
        let mut sessions: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter(|s| {
                if !project_only {
                    return true;
                }
                match self.show_environment(s, "LISA_PROJECT_HASH") {
                    Ok(Some(hash)) if !hash.is_empty() => hash == expected,
                    _ => self.paths.meta_file(project_root, s).exists(),
                }
            })
            .map(str::to_string)
            .collect();
        sessions.sort();
        Ok(sessions)
    }

    fn capture_pane(&self, session: &str, lines: usize) -> Result<String> {
        let start = format!("-{lines}");
        self.run(None, &["capture-pane", "-t", session, "-p", "-S", &start])
    }

    fn send_text(&self, session: &str, text: &str, enter: bool) -> Result<()> {
        let buffer = format!("lisa-send-{}", std::process::id());
        self.run(Some(text), &["load-buffer", "-b", &buffer, "-"])?;
        let pasted = self.run(None, &["paste-buffer", "-b", &buffer, "-t", session]);
        let _ = self.run(None, &["delete-buffer", "-b", &buffer]);
        pasted?;
        if enter {
            // Interactive TUIs need a beat before the submit key.
            thread::sleep(Duration::from_millis(120));
            self.run(None, &["send-keys", "-t", session, "Enter"])?;
        }
        Ok(())
    }

    fn send_keys(&self, session: &str, keys: &[String], enter: bool) -> Result<()> {
        let mut args: Vec<&str> = vec!["send-keys", "-t", session];
        args.extend(keys.iter().map(String::as_str));
        if enter {
            args.push("Enter");
        }
        self.run(None, &args).map(|_| ())
    }

    fn pane_snapshot(&self, session: &str) -> Result<PaneSnapshot> {
        let out = self.run(None, &["display-message", "-t", session, "-p", PANE_SNAPSHOT_FORMAT])?;
        Ok(PaneSnapshot::parse(&out))
    }

    fn show_environment(&self, session: &str, key: &str) -> Result<Option<String>> {
        let out = self.run(None, &["show-environment", "-t", session, key])?;
        Ok(out
            .trim()
            .split_once('=')
            .map(|(_, value)| value.trim().to_string()))
    }

    fn agent_process(&self, pane_pid: u32, agent: &str) -> Result<Option<AgentProcess>> {
        let processes = process::list_processes();
        Ok(process::detect_agent_process(&processes, pane_pid, agent))
    }

    fn default_server_sessions(&self) -> Result<Vec<String>> {
        match run_with_timeout(
            "tmux",
            &["list-sessions".to_string(), "-F".to_string(), "#S".to_string()],
            None,
            self.timeout,
        ) {
            Ok(out) => Ok(out
                .lines()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()),
            Err(LisaError::CommandFailed { details, .. }) if is_no_sessions_output(&details) => {
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }
}

/// Runs a command with stdin, merged output, and a wall-clock timeout.
///
/// `TMUX` is stripped from the child environment so nested invocations do
/// not attach to the caller's server.
pub fn run_with_timeout(
    program: &str,
    args: &[String],
    input: Option<&str>,
    timeout: Duration,
) -> Result<String> {
    let command_text = format!("{} {}", program, args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .env_remove("TMUX")
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| LisaError::CommandFailed {
            command: command_text.clone(),
            details: e.to_string(),
        })?;

    if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
        let _ = stdin.write_all(data.as_bytes());
    }
    let stdout_reader = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = out.read_to_string(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = err.read_to_string(&mut buf);
            buf
        })
    });

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if start.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(LisaError::CommandFailed {
                    command: command_text,
                    details: format!("timed out after {}s", timeout.as_secs()),
                });
            }
            Ok(None) => thread::sleep(Duration::from_millis(5)),
            Err(e) => {
                return Err(LisaError::CommandFailed {
                    command: command_text,
                    details: e.to_string(),
                })
            }
        }
    };

    let stdout = stdout_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr = stderr_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    if status.success() {
        debug!(command = %command_text, "command ok");
        return Ok(stdout);
    }
    let details = format!("{}{}", stdout.trim(), stderr.trim());
    Err(LisaError::CommandFailed {
        command: command_text,
        details: if details.is_empty() {
            format!("exit status {}", status.code().unwrap_or(-1))
        } else {
            details
        },
    })
}
