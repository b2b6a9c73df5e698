//! Diagnostics bridge: classifies guest faults and mirrors guest output.

use serde_json::{Map, Value};

use crate::error::ErrorCode;
use crate::protocol::{LogEntry, LogLevel};

/// Longest log message forwarded to the host, in characters.
pub const MAX_LOG_MESSAGE_CHARS: usize = 4096;

/// Why the guest program stopped abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestFault {
    Uncaught(String),
    UnhandledRejection(String),
    /// V8 execution was terminated from outside (watchdog).
    Terminated,
    HeapLimit,
}

impl GuestFault {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnhandledRejection(_) => ErrorCode::UnhandledRejection,
            _ => ErrorCode::RuntimeError,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Uncaught(msg) | Self::UnhandledRejection(msg) => truncate(msg),
            Self::Terminated => "guest execution was terminated".into(),
            Self::HeapLimit => "guest exceeded its memory limit".into(),
        }
    }

    pub fn detail(&self) -> Map<String, Value> {
        let mut detail = Map::new();
        match self {
            Self::HeapLimit => {
                detail.insert("reason".into(), "heap-limit".into());
            }
            Self::Terminated => {
                detail.insert("reason".into(), "terminated".into());
            }
            _ => {}
        }
        detail
    }
}

/// Map an engine error string onto a fault.
pub fn classify_fault(message: &str) -> GuestFault {
    if message.contains("execution terminated") {
        GuestFault::Terminated
    } else if message.contains("(in promise)") {
        GuestFault::UnhandledRejection(message.to_string())
    } else {
        GuestFault::Uncaught(message.to_string())
    }
}

/// Errors caused by a broken asset reference rather than broken code.
pub fn is_resource_load_failure(message: &str) -> bool {
    const MARKERS: [&str; 5] = [
        "Failed to fetch",
        "Failed to load",
        "NetworkError",
        "network unavailable",
        "malformed data URL",
    ];
    MARKERS.iter().any(|m| message.contains(m))
}

pub fn truncate(message: &str) -> String {
    match message.char_indices().nth(MAX_LOG_MESSAGE_CHARS) {
        Some((cut, _)) => format!("{}…", &message[..cut]),
        None => message.to_string(),
    }
}

/// Mirror a guest log line onto the host's tracing output.
pub fn mirror(file_name: &str, entry: &LogEntry) {
    let elapsed_ms = entry.elapsed_ms;
    match entry.level {
        LogLevel::Debug => {
            tracing::debug!(target: "scenebox::guest", file = file_name, elapsed_ms, "{}", entry.message)
        }
        LogLevel::Info => {
            tracing::info!(target: "scenebox::guest", file = file_name, elapsed_ms, "{}", entry.message)
        }
        LogLevel::Warn => {
            tracing::warn!(target: "scenebox::guest", file = file_name, elapsed_ms, "{}", entry.message)
        }
        LogLevel::Error => {
            tracing::error!(target: "scenebox::guest", file = file_name, elapsed_ms, "{}", entry.message)
        }
    }
}
