//! Step execution for `session turn` and `session loop`.
//!
//! Steps are full `lisa` argument vectors. They are parsed and dispatched
//! in this process against the same [`Engine`], so a child sees exactly
//! the flags a shell caller would.

use lisa_core::{Engine, Result, StepResult, StepRunner};
use tracing::debug;

pub struct InProcessRunner<'a> {
    engine: &'a Engine,
}

impl<'a> InProcessRunner<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }
}

impl StepRunner for InProcessRunner<'_> {
    fn run(&self, args: &[String]) -> Result<StepResult> {
        debug!(step = %args.join(" "), "running step");
        let out = crate::dispatch(self.engine, args);
        Ok(StepResult::new(out.payload, out.exit_code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_step_runs_smoke_in_process() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let result = InProcessRunner::new(&engine)
            .run(&args(&["session", "smoke", "--json"]))
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.payload["ok"], true);
    }

    #[test]
    fn test_step_reaches_fake_tmux() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("repo");
        std::fs::create_dir_all(&root).unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        tmux.add_session("lisa-step-1", "$ ");
        let result = InProcessRunner::new(&engine)
            .run(&args(&[
                "session",
                "send",
                "--session",
                "lisa-step-1",
                "--project-root",
                root.to_str().unwrap(),
                "--text",
                "hello",
                "--enter",
                "--json",
            ]))
            .unwrap();
        assert_eq!(result.exit_code, 0, "{:?}", result.payload);
        assert!(!tmux.sent("lisa-step-1").is_empty());
    }

    #[test]
    fn test_turn_and_capture_without_fields_succeed() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("repo");
        std::fs::create_dir_all(&root).unwrap();
        let root = root.to_str().unwrap();
        let (engine, tmux, _) = Engine::with_fakes(tmp.path(), Utc::now());
        tmux.add_session("lisa-turn-1", "work\n__LISA_EXEC_DONE__:0\n$ ");

        let out = crate::dispatch(
            &engine,
            &args(&[
                "session",
                "turn",
                "--session",
                "lisa-turn-1",
                "--project-root",
                root,
                "--text",
                "hi",
                "--enter",
                "--poll-interval",
                "1",
                "--max-polls",
                "2",
                "--json",
            ]),
        );
        assert_eq!(out.exit_code, 0, "{:?}", out.payload);
        assert!(out.error_code().is_none());
        assert!(!tmux.sent("lisa-turn-1").is_empty());

        for command in ["capture", "packet"] {
            let out = crate::dispatch(
                &engine,
                &args(&["session", command, "--session", "lisa-turn-1", "--project-root", root, "--json"]),
            );
            assert_eq!(out.exit_code, 0, "{command}: {:?}", out.payload);
        }
    }

    #[test]
    fn test_bad_step_arguments_are_a_failed_step() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let result = InProcessRunner::new(&engine)
            .run(&args(&["session", "send", "--nope", "--json"]))
            .unwrap();
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.error_message().as_deref().map(|m| !m.is_empty()), Some(true));
        assert_eq!(result.payload["errorCode"], "unknown_flag");
    }
}
