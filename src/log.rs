//! Structured logging for orchestration runs.
//!
//! Log levels:
//! - ERROR: Fatal orchestration errors (invariant violations, unschedulable tasks)
//! - WARN: Recoverable trouble (rejected edits, dispatch timeouts, retries)
//! - INFO: Lifecycle notifications (run start/finish, task completion, edits)
//! - DEBUG: Dispatch decisions and edit cycle internals
//! - TRACE: Event bus traffic
//!
//! Level priority: `--log-level` flag, then `CONSTELLATION_LOG`, then
//! `CONSTELLATION_DEBUG=1` (debug), then `info`. Output goes to stderr so
//! stdout stays free for results.

use tracing_subscriber::{fmt, EnvFilter};

/// Log levels for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

/// Pick the effective level from the flag and the environment.
pub fn resolve_level(
    cli_level: Option<LogLevel>,
    log_env: Option<&str>,
    debug_env: Option<&str>,
) -> LogLevel {
    if let Some(level) = cli_level {
        return level;
    }
    if let Some(level) = log_env.and_then(LogLevel::parse) {
        return level;
    }
    let debug = debug_env.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(cli_level: Option<LogLevel>) {
    let level = resolve_level(
        cli_level,
        std::env::var("CONSTELLATION_LOG").ok().as_deref(),
        std::env::var("CONSTELLATION_DEBUG").ok().as_deref(),
    );
    let filter = EnvFilter::new(format!("constellation={}", level.as_str()));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init();
}
