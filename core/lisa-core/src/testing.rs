//! In-memory fakes for the injection points: clock, tmux adapter and step
//! runner.
//!
//! Used by unit tests, integration tests, and the `session smoke` self-check.

use crate::clock::Clock;
use crate::error::{LisaError, Result};
use crate::orchestrate::{StepResult, StepRunner};
use crate::process::AgentProcess;
use crate::tmux::{NewSession, PaneSnapshot, TmuxAdapter};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance_seconds(&self, seconds: i64) {
        if let Ok(mut now) = self.now.lock() {
            *now += Duration::seconds(seconds);
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakePane {
    pub capture: String,
    pub snapshot: PaneSnapshot,
    pub env: HashMap<String, String>,
    pub agent: Option<AgentProcess>,
    pub sent: Vec<String>,
    pub capture_error: Option<String>,
    /// Startup command when the pane came from `new_session`.
    pub command: String,
}

/// Sessions keyed by name; everything else is scripted by the test.
#[derive(Debug, Default)]
pub struct FakeTmuxAdapter {
    panes: Mutex<BTreeMap<String, FakePane>>,
    default_sessions: Mutex<Vec<String>>,
    new_session_error: Mutex<Option<String>>,
}

impl FakeTmuxAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a live session with a shell pane and the given capture.
    pub fn add_session(&self, session: &str, capture: &str) {
        let pane = FakePane {
            capture: capture.to_string(),
            snapshot: PaneSnapshot {
                dead: false,
                dead_status: String::new(),
                current_command: "bash".to_string(),
                pane_pid: "4242".to_string(),
            },
            ..FakePane::default()
        };
        self.with_panes(|panes| {
            panes.insert(session.to_string(), pane);
        });
    }

    pub fn remove_session(&self, session: &str) {
        self.with_panes(|panes| {
            panes.remove(session);
        });
    }

    pub fn set_capture(&self, session: &str, capture: &str) {
        self.update(session, |pane| pane.capture = capture.to_string());
    }

    pub fn set_capture_error(&self, session: &str, error: Option<&str>) {
        self.update(session, |pane| pane.capture_error = error.map(str::to_string));
    }

    pub fn set_snapshot(&self, session: &str, snapshot: PaneSnapshot) {
        self.update(session, |pane| pane.snapshot = snapshot);
    }

    pub fn set_agent(&self, session: &str, agent: Option<AgentProcess>) {
        self.update(session, |pane| pane.agent = agent);
    }

    pub fn set_env(&self, session: &str, key: &str, value: &str) {
        self.update(session, |pane| {
            pane.env.insert(key.to_string(), value.to_string());
        });
    }

    pub fn set_default_sessions(&self, sessions: &[&str]) {
        if let Ok(mut guard) = self.default_sessions.lock() {
            *guard = sessions.iter().map(|s| s.to_string()).collect();
        }
    }

    /// Makes the next `new_session` calls fail with `error`.
    pub fn fail_new_session(&self, error: Option<&str>) {
        if let Ok(mut guard) = self.new_session_error.lock() {
            *guard = error.map(str::to_string);
        }
    }

    pub fn pane_state(&self, session: &str) -> Option<FakePane> {
        self.with_panes(|panes| panes.get(session).cloned())
    }

    pub fn sent(&self, session: &str) -> Vec<String> {
        self.with_panes(|panes| {
            panes
                .get(session)
                .map(|pane| pane.sent.clone())
                .unwrap_or_default()
        })
    }

    fn update(&self, session: &str, f: impl FnOnce(&mut FakePane)) {
        self.with_panes(|panes| {
            if let Some(pane) = panes.get_mut(session) {
                f(pane);
            }
        });
    }

    fn with_panes<T>(&self, f: impl FnOnce(&mut BTreeMap<String, FakePane>) -> T) -> T {
        match self.panes.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn pane(&self, session: &str) -> Result<FakePane> {
        self.with_panes(|panes| panes.get(session).cloned())
            .ok_or_else(|| LisaError::CommandFailed {
                command: format!("tmux -t {session}"),
                details: format!("can't find session: {session}"),
            })
    }
}

impl TmuxAdapter for FakeTmuxAdapter {
    fn has_session(&self, session: &str) -> bool {
        self.with_panes(|panes| panes.contains_key(session))
    }

    fn new_session(&self, spec: &NewSession) -> Result<()> {
        let scripted = self.new_session_error.lock().ok().and_then(|guard| guard.clone());
        if let Some(details) = scripted {
            return Err(LisaError::CommandFailed {
                command: "tmux new-session".into(),
                details,
            });
        }
        if self.has_session(&spec.session) {
            return Err(LisaError::CommandFailed {
                command: "tmux new-session".into(),
                details: format!("duplicate session: {}", spec.session),
            });
        }
        self.add_session(&spec.session, "");
        self.update(&spec.session, |pane| {
            pane.env = spec.env.iter().cloned().collect();
            pane.command = spec.command.clone();
        });
        Ok(())
    }

    fn kill_session(&self, session: &str) -> Result<()> {
        self.pane(session)?;
        self.remove_session(session);
        Ok(())
    }

    fn list_sessions(&self, _project_only: bool, _project_root: &str) -> Result<Vec<String>> {
        Ok(self.with_panes(|panes| panes.keys().cloned().collect()))
    }

    fn capture_pane(&self, session: &str, lines: usize) -> Result<String> {
        let pane = self.pane(session)?;
        if let Some(error) = pane.capture_error {
            return Err(LisaError::CommandFailed {
                command: "tmux capture-pane".into(),
                details: error,
            });
        }
        let all: Vec<&str> = pane.capture.split('\n').collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].join("\n"))
    }

    fn send_text(&self, session: &str, text: &str, enter: bool) -> Result<()> {
        self.pane(session)?;
        let entry = if enter {
            format!("{text}\n")
        } else {
            text.to_string()
        };
        self.update(session, |pane| pane.sent.push(entry));
        Ok(())
    }

    fn send_keys(&self, session: &str, keys: &[String], enter: bool) -> Result<()> {
        self.pane(session)?;
        let mut entry = keys.join(" ");
        if enter {
            entry.push_str(" Enter");
        }
        self.update(session, |pane| pane.sent.push(entry));
        Ok(())
    }

    fn pane_snapshot(&self, session: &str) -> Result<PaneSnapshot> {
        Ok(self.pane(session)?.snapshot)
    }

    fn show_environment(&self, session: &str, key: &str) -> Result<Option<String>> {
        Ok(self.pane(session)?.env.get(key).cloned())
    }

    fn agent_process(&self, pane_pid: u32, _agent: &str) -> Result<Option<AgentProcess>> {
        Ok(self.with_panes(|panes| {
            panes
                .values()
                .find(|pane| pane.snapshot.pane_pid == pane_pid.to_string())
                .and_then(|pane| pane.agent)
        }))
    }

    fn uses_runtime_env(&self) -> bool {
        false
    }

    fn default_server_sessions(&self) -> Result<Vec<String>> {
        Ok(self
            .default_sessions
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default())
    }
}

/// Step runner that answers from per-command scripts and records calls.
///
/// Commands are keyed by the second argument (`send`, `monitor`, ...). An
/// unscripted command answers `{"ok":true}` with exit 0.
#[derive(Debug, Default)]
pub struct ScriptedStepRunner {
    scripts: Mutex<HashMap<String, VecDeque<StepResult>>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedStepRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response for the next call of `command`. The last queued
    /// response repeats once the queue runs dry.
    pub fn script(&self, command: &str, result: StepResult) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(command.to_string()).or_default().push_back(result);
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Subcommand names in call order.
    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|args| args.get(1).cloned().unwrap_or_default())
            .collect()
    }
}

impl StepRunner for ScriptedStepRunner {
    fn run(&self, args: &[String]) -> Result<StepResult> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(args.to_vec());
        }
        let command = args.get(1).cloned().unwrap_or_default();
        let mut scripts = self
            .scripts
            .lock()
            .map_err(|_| LisaError::coded("step_runner_poisoned", "scripted runner lock poisoned"))?;
        let Some(queue) = scripts.get_mut(&command) else {
            let mut ok = lisa_protocol::Payload::new();
            ok.insert("ok".into(), serde_json::Value::Bool(true));
            return Ok(StepResult::new(ok, 0));
        };
        let result = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(result.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_tmux_capture_tail_and_send() {
        let tmux = FakeTmuxAdapter::new();
        tmux.add_session("s1", "a\nb\nc");
        assert!(tmux.has_session("s1"));
        assert_eq!(tmux.capture_pane("s1", 2).unwrap(), "b\nc");
        tmux.send_text("s1", "hello", true).unwrap();
        assert_eq!(tmux.sent("s1"), vec!["hello\n".to_string()]);
        assert!(tmux.capture_pane("missing", 10).is_err());
    }

    #[test]
    fn test_fixed_clock_advances() {
        let start = Utc::now();
        let clock = FixedClock::new(start);
        clock.advance_seconds(5);
        assert_eq!((clock.now() - start).num_seconds(), 5);
    }
}
