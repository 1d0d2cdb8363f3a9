//! Tracing setup for the `lisa` binary.
//!
//! stdout carries the JSON payload, so logs go to stderr or, with
//! `LISA_LOG_DIR` set, to a daily-rotated file.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_PREFIX: &str = "lisa.log";

fn debug_forced() -> bool {
    std::env::var("LISA_DEBUG")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn log_dir() -> Option<PathBuf> {
    std::env::var("LISA_LOG_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_filter(fallback: &str) -> EnvFilter {
    if debug_forced() {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Installs the global subscriber. Keep the guard alive until exit so the
/// file writer flushes.
pub fn init() -> Option<WorkerGuard> {
    if let Some(dir) = log_dir() {
        if std::fs::create_dir_all(&dir).is_ok() {
            let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let installed = tracing_subscriber::registry()
                .with(env_filter("info"))
                .with(fmt::layer().with_writer(writer).with_ansi(false).with_target(false))
                .try_init();
            return installed.ok().map(|_| guard);
        }
    }

    let _ = tracing_subscriber::registry()
        .with(env_filter("warn"))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
    None
}
