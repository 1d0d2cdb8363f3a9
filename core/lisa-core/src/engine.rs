//! Engine - the dependency bundle every lisa operation runs against.
//!
//! The engine holds the injection points for path layout, runtime tunables,
//! the wall clock, and the tmux adapter. It is:
//! - **Synchronous**: no async runtime required
//! - **Stateless**: every call reloads what it needs from disk
//! - **Cheap to clone**: adapters are shared behind `Arc`
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use lisa_core::engine::Engine;
//!
//! let engine = Engine::from_env();
//! let status = lisa_core::status::compute_session_status(&engine, &request)?;
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::RuntimeConfig;
use crate::paths::{canonical_project_root, Paths, RuntimeEnvScope};
use crate::testing::{FakeTmuxAdapter, FixedClock};
use crate::tmux::{CommandTmuxAdapter, TmuxAdapter};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct Engine {
    pub paths: Paths,
    pub config: RuntimeConfig,
    pub clock: Arc<dyn Clock>,
    pub tmux: Arc<dyn TmuxAdapter>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("paths", &self.paths)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        paths: Paths,
        config: RuntimeConfig,
        clock: Arc<dyn Clock>,
        tmux: Arc<dyn TmuxAdapter>,
    ) -> Self {
        Self {
            paths,
            config,
            clock,
            tmux,
        }
    }

    /// Production wiring: env-driven paths and config, system clock, real tmux.
    pub fn from_env() -> Self {
        let paths = Paths::from_env();
        let config = RuntimeConfig::from_env();
        let tmux = CommandTmuxAdapter::new(paths.clone(), config.cmd_timeout());
        Self::new(paths, config, Arc::new(SystemClock), Arc::new(tmux))
    }

    /// Test wiring rooted at `base`, returning handles to the fakes.
    pub fn with_fakes(
        base: impl Into<std::path::PathBuf>,
        now: DateTime<Utc>,
    ) -> (Self, Arc<FakeTmuxAdapter>, Arc<FixedClock>) {
        let tmux = Arc::new(FakeTmuxAdapter::new());
        let clock = Arc::new(FixedClock::new(now));
        let engine = Self::new(
            Paths::with_base(base),
            RuntimeConfig::default(),
            clock.clone(),
            tmux.clone(),
        );
        (engine, tmux, clock)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Enters the per-project tmux runtime scope; restored on drop.
    ///
    /// Adapters that do not read the process environment get no scope.
    pub fn runtime_scope(&self, project_root: &str) -> Option<RuntimeEnvScope> {
        self.tmux
            .uses_runtime_env()
            .then(|| RuntimeEnvScope::enter(&self.paths, project_root))
    }

    pub fn canonical_root(&self, project_root: &str) -> String {
        canonical_project_root(project_root)
    }
}
