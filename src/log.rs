//! File logging shared by every agentrelay process.
//!
//! The orchestrator and the short-lived CLI invocations workers make
//! (`delegate`, `report`, `heartbeat`, `usage`) all append to
//! `~/.agentrelay/agentrelay.log`, so each line carries the writer's pid.
//!
//! Levels, most to least severe:
//! - ERROR: an operation was abandoned (result record not written, scan failed)
//! - WARN: unknown task ids, dispatch/announce errors, stale agents, malformed files
//! - INFO: task insertion, dispatch, terminal transitions, startup and shutdown
//! - DEBUG: per-tick detail (queue scans, skipped dispatches, acks)
//! - TRACE: individual store operations
//!
//! The level defaults to INFO. `--debug` or `AGENTRELAY_DEBUG=1` raise it to
//! DEBUG; `AGENTRELAY_LOG=<level>` sets it outright. Until [`init_with_debug`]
//! runs nothing is written, so library users and tests stay quiet.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

/// A log at or above this size is moved to `agentrelay.log.1` on startup.
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(crate::Error::Validation(format!("unknown log level: {}", other))),
        }
    }
}

/// Pick the level from the `--debug` flag and the two environment variables.
/// An unparseable `AGENTRELAY_LOG` is ignored.
fn resolve_level(debug_flag: bool, env_debug: Option<&str>, env_level: Option<&str>) -> LogLevel {
    if let Some(level) = env_level.and_then(|v| v.parse().ok()) {
        return level;
    }
    let env_debug = env_debug.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if debug_flag || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Move `path` aside to `<path>.1` once it reaches `max_bytes`.
fn rotate_if_large(path: &Path, max_bytes: u64) -> std::io::Result<bool> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() >= max_bytes => {
            let mut rotated = path.as_os_str().to_owned();
            rotated.push(".1");
            fs::rename(path, PathBuf::from(rotated))?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn format_line(level: LogLevel, msg: &str) -> String {
    format!(
        "[{}] [{}] [{}] {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        level.as_str(),
        std::process::id(),
        msg
    )
}

/// Start writing to `~/.agentrelay/agentrelay.log`.
pub fn init_with_debug(debug: bool) {
    let level = resolve_level(
        debug,
        std::env::var("AGENTRELAY_DEBUG").ok().as_deref(),
        std::env::var("AGENTRELAY_LOG").ok().as_deref(),
    );
    set_level(level);

    let Some(dir) = dirs::home_dir().map(|h| h.join(".agentrelay")) else {
        return;
    };
    if fs::create_dir_all(&dir).is_err() {
        return;
    }
    let path = dir.join("agentrelay.log");
    let _ = rotate_if_large(&path, MAX_LOG_BYTES);
    LOG_PATH.set(path).ok();
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > self::level() {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{}", format_line(level, msg));
    }
}

#[macro_export]
macro_rules! rlog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_debug {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Debug, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_trace {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Trace, &format!($($arg)*))
    };
}
