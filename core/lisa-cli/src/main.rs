//! lisa: control plane for AI coding agents running in tmux sessions.
//!
//! ## Subcommands
//!
//! - `session <cmd>`: observe, drive and orchestrate agent sessions
//! - `skills <cmd>`: keep the bundled agent skill installed and in sync
//!
//! Every command prints one JSON object on stdout and exits with the
//! payload's exit code. Without `--json`/`--json-min`, a failure prints
//! `error: <message>` on stderr instead.

mod logging;
mod runner;
mod session;
mod skills;

use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::{Parser, Subcommand};
use lisa_core::Engine;
use lisa_protocol::{str_field, CommandOutput};
use session::SessionCommand;
use skills::SkillsCommand;

#[derive(Parser, Debug)]
#[command(name = "lisa")]
#[command(about = "Supervise AI coding agents running in tmux sessions")]
#[command(version)]
pub struct Cli {
    /// Print the JSON payload for failures too
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Observe, drive and orchestrate agent sessions
    #[command(subcommand)]
    Session(SessionCommand),

    /// Sync, install and check the lisa agent skill
    #[command(subcommand)]
    Skills(SkillsCommand),
}

impl Commands {
    pub fn execute(self, engine: &Engine) -> CommandOutput {
        match self {
            Commands::Session(command) => command.execute(engine),
            Commands::Skills(command) => command.execute(),
        }
    }
}

pub fn parse_args(args: &[String]) -> Result<Cli, clap::Error> {
    Cli::try_parse_from(std::iter::once("lisa".to_string()).chain(args.iter().cloned()))
}

/// Parses an argument vector (without the program name) and runs it.
pub fn dispatch(engine: &Engine, args: &[String]) -> CommandOutput {
    match parse_args(args) {
        Ok(cli) => cli.command.execute(engine),
        Err(err) => usage_failure(&err),
    }
}

fn wants_json(args: &[String]) -> bool {
    args.iter().any(|a| a == "--json" || a == "--json-min")
}

/// `--token-budget <TOKEN_BUDGET>` -> `token_budget`
fn flag_stem(err: &clap::Error) -> Option<String> {
    match err.get(ContextKind::InvalidArg) {
        Some(ContextValue::String(arg)) => {
            let flag = arg.split_whitespace().next()?.trim_start_matches('-');
            Some(flag.replace('-', "_")).filter(|f| !f.is_empty())
        }
        _ => None,
    }
}

fn usage_code(err: &clap::Error) -> String {
    match err.kind() {
        ErrorKind::UnknownArgument => "unknown_flag".into(),
        ErrorKind::MissingRequiredArgument => "missing_required_flag".into(),
        ErrorKind::InvalidSubcommand | ErrorKind::MissingSubcommand => "unknown_command".into(),
        ErrorKind::InvalidValue
            if matches!(err.get(ContextKind::InvalidValue), Some(ContextValue::String(v)) if v.is_empty()) =>
        {
            "missing_flag_value".into()
        }
        ErrorKind::InvalidValue | ErrorKind::ValueValidation => flag_stem(err)
            .map(|stem| format!("invalid_{stem}"))
            .unwrap_or_else(|| "invalid_flag_value".into()),
        _ => "invalid_arguments".into(),
    }
}

/// Failure payload for arguments clap rejected.
pub fn usage_failure(err: &clap::Error) -> CommandOutput {
    let rendered = err.to_string();
    let message = rendered
        .lines()
        .next()
        .unwrap_or_default()
        .trim_start_matches("error:")
        .trim()
        .to_string();
    CommandOutput::failure(&usage_code(err), message)
}

fn emit(out: &CommandOutput, json: bool) {
    if out.is_success() || json {
        println!("{}", out.to_json_line());
        return;
    }
    let message = [str_field(&out.payload, "error"), str_field(&out.payload, "errorCode")]
        .into_iter()
        .find(|s| !s.trim().is_empty())
        .unwrap_or("command failed");
    eprintln!("error: {message}");
}

fn main() {
    let logging_guard = logging::init();
    let args: Vec<String> = std::env::args().skip(1).collect();

    let exit_code = match parse_args(&args) {
        Ok(cli) => {
            let json = cli.json || wants_json(&args);
            let engine = Engine::from_env();
            let out = cli.command.execute(&engine);
            if !out.is_success() {
                tracing::debug!(code = ?out.error_code(), exit = out.exit_code, "command failed");
            }
            emit(&out, json);
            out.exit_code
        }
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp
                    | ErrorKind::DisplayVersion
                    | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
            ) =>
        {
            err.exit()
        }
        Err(err) if wants_json(&args) => {
            emit(&usage_failure(&err), true);
            1
        }
        Err(err) => {
            let _ = err.print();
            1
        }
    };

    drop(logging_guard);
    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use lisa_core::contract::COMMAND_CONTRACTS;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_every_contract_flag_is_accepted() {
        let mut root = Cli::command();
        root.build();
        for contract in COMMAND_CONTRACTS {
            let mut cmd = &root;
            for part in contract.name.split_whitespace() {
                cmd = cmd
                    .find_subcommand(part)
                    .unwrap_or_else(|| panic!("missing subcommand {}", contract.name));
            }
            let longs: Vec<&str> = cmd.get_arguments().filter_map(|a| a.get_long()).collect();
            let aliases: Vec<&str> = cmd
                .get_arguments()
                .flat_map(|a| a.get_visible_aliases().unwrap_or_default())
                .collect();
            for flag in contract.flags {
                let name = flag.trim_start_matches("--");
                assert!(
                    longs.contains(&name) || aliases.contains(&name),
                    "{} does not accept {flag}",
                    contract.name
                );
            }
        }
    }

    #[test]
    fn test_bool_flags_take_explicit_values() {
        let cli = parse_args(&args(&[
            "session",
            "monitor",
            "--session",
            "s1",
            "--stop-on-waiting",
            "false",
            "--waiting-requires-turn-complete",
            "--json",
        ]))
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Session(SessionCommand::Monitor { wait, .. }) => {
                assert_eq!(wait.stop_on_waiting, Some(false));
                assert_eq!(wait.waiting_requires_turn_complete, Some(true));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_context_pack_accepts_session_alias() {
        let cli = parse_args(&args(&["session", "context-pack", "--session", "s1"])).unwrap();
        match cli.command {
            Commands::Session(SessionCommand::ContextPack { for_session, .. }) => {
                assert_eq!(for_session.as_deref(), Some("s1"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_checkpoint_action_positional_or_flag() {
        for raw in [
            &["session", "checkpoint", "resume", "--file", "x.json"][..],
            &["session", "checkpoint", "--action", "resume", "--file", "x.json"][..],
        ] {
            match parse_args(&args(raw)).unwrap().command {
                Commands::Session(SessionCommand::Checkpoint { action_arg, action, .. }) => {
                    assert_eq!(action.or(action_arg).as_deref(), Some("resume"));
                }
                other => panic!("unexpected command {other:?}"),
            }
        }
    }

    #[test]
    fn test_negative_budget_reaches_the_builder() {
        let cli = parse_args(&args(&["session", "next", "--session", "s1", "--budget", "-5"])).unwrap();
        match cli.command {
            Commands::Session(SessionCommand::Next { budget, .. }) => assert_eq!(budget, Some(-5)),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_spawn_takes_dashed_agent_args_and_negative_width() {
        let cli = parse_args(&args(&[
            "session",
            "spawn",
            "--agent",
            "codex",
            "--agent-args",
            "--search",
            "--width",
            "-1",
            "--dry-run",
        ]))
        .unwrap();
        match cli.command {
            Commands::Session(SessionCommand::Spawn { agent_args, width, dry_run, .. }) => {
                assert_eq!(agent_args.as_deref(), Some("--search"));
                assert_eq!(width, Some(-1));
                assert!(dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_usage_errors_map_to_codes() {
        let cases = [
            (&["session", "status", "--bogus"][..], "unknown_flag"),
            (&["session", "capture", "--session", "s1", "--lines"][..], "missing_flag_value"),
            (&["session", "capture", "--session", "s1", "--lines", "many"][..], "invalid_lines"),
            (&["session", "explode"][..], "unknown_command"),
        ];
        for (raw, code) in cases {
            let err = parse_args(&args(raw)).unwrap_err();
            let out = usage_failure(&err);
            assert_eq!(out.exit_code, 1);
            assert_eq!(out.error_code(), Some(code), "{raw:?}");
            assert!(!str_field(&out.payload, "error").starts_with("error:"));
        }
    }

    #[test]
    fn test_wants_json_sees_both_forms() {
        assert!(wants_json(&args(&["session", "list", "--json-min"])));
        assert!(wants_json(&args(&["session", "list", "--json"])));
        assert!(!wants_json(&args(&["session", "list"])));
    }
}
