//! # lisa-core
//!
//! Session state machine and orchestration kernel for lisa, a controller
//! for AI coding agents (Claude, Codex) running inside tmux sessions.
//!
//! Every `lisa session ...` and `lisa skills ...` command is a builder in
//! this crate that takes an [`Engine`] plus a typed request and returns a
//! [`lisa_protocol::CommandOutput`]. The CLI only parses flags, prints the
//! payload and exits with its code.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Monitor polls block the calling thread.
//! - **Filesystem-mediated coordination**: Processes share state only
//!   through `/tmp/.lisa-<hash>-*` artifacts guarded by advisory locks.
//! - **Injected effects**: Clock, tmux and child-step execution come in
//!   through the [`Engine`] and [`orchestrate::StepRunner`], so tests run
//!   against fakes.
//! - **Typed errors, stable codes**: Failures are [`LisaError`] values whose
//!   `code()` lands in the payload's `errorCode`.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lisa_core::{Engine, session::{status_command, SessionStatusRequest}};
//! use lisa_core::command::Target;
//!
//! let engine = Engine::from_env();
//! let req = SessionStatusRequest {
//!     target: Target::new("lisa-abc-exec-1", "/repo"),
//!     ..Default::default()
//! };
//! let out = status_command(&engine, &req);
//! println!("{}", serde_json::Value::Object(out.payload));
//! ```

// Public modules
pub mod anomaly;
pub mod budget;
pub mod capture;
pub mod checkpoint;
pub mod classifier;
pub mod clock;
pub mod command;
pub mod config;
pub mod contract;
pub mod engine;
pub mod error;
pub mod events;
pub mod fleet;
pub mod guard;
pub mod lifecycle;
pub mod lock;
pub mod meta;
pub mod monitor;
pub mod orchestrate;
pub mod pack;
pub mod paths;
pub mod payload;
pub mod process;
pub mod registry;
pub mod router;
pub mod sandbox;
pub mod session;
pub mod skills;
pub mod smoke;
pub mod status;
pub mod storage;
pub mod testing;
pub mod tmux;
pub mod types;

// Re-export commonly used items at crate root
pub use clock::{Clock, SystemClock};
pub use command::Target;
pub use config::RuntimeConfig;
pub use engine::Engine;
pub use error::{LisaError, Result};
pub use orchestrate::{StepResult, StepRunner};
pub use paths::Paths;
pub use tmux::{CommandTmuxAdapter, TmuxAdapter};
pub use types::*;
