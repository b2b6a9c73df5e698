//! Error types for the scenebox sandbox.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::protocol::LogEntry;

/// Machine-readable failure code carried by every [`SandboxError`].
///
/// Serialized in kebab-case (`network-blocked`, `host-timeout`, ...) so the
/// same value travels unchanged over the message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ErrorCode {
    /// The guest exceeded its network request quota.
    NetworkLimit,
    /// The guest tried to reach an endpoint outside the allow-list.
    NetworkBlocked,
    /// No rendering engine was available when the guest booted.
    EngineMissing,
    /// An export was requested but no scene could be located.
    SceneMissing,
    /// A render surface lost its drawing context.
    SurfaceContextLost,
    /// Guest code threw an uncaught exception.
    RuntimeError,
    /// A guest promise rejected without a handler.
    UnhandledRejection,
    /// The scene could not be serialized.
    ExportFailed,
    /// The guest reported success without a usable snapshot.
    EmptyResult,
    /// The host gave up waiting for the guest.
    HostTimeout,
    /// The submitted document was empty or too large.
    InvalidDocument,
    /// The execution context could not be created or exited without settling.
    ContextFailed,
    /// Too many conversions are already running.
    ConcurrencyLimit,
}

/// Coarse failure taxonomy used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The guest exceeded its own declared constraints.
    Policy,
    /// The hosting environment could not satisfy a precondition.
    Environment,
    /// Uncaught guest failures.
    Runtime,
    /// Serialization produced nothing usable.
    Export,
    /// The host side gave up or could not run the conversion.
    Supervisory,
}

impl ErrorCode {
    /// Returns the wire representation of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkLimit => "network-limit",
            Self::NetworkBlocked => "network-blocked",
            Self::EngineMissing => "engine-missing",
            Self::SceneMissing => "scene-missing",
            Self::SurfaceContextLost => "surface-context-lost",
            Self::RuntimeError => "runtime-error",
            Self::UnhandledRejection => "unhandled-rejection",
            Self::ExportFailed => "export-failed",
            Self::EmptyResult => "empty-result",
            Self::HostTimeout => "host-timeout",
            Self::InvalidDocument => "invalid-document",
            Self::ContextFailed => "context-failed",
            Self::ConcurrencyLimit => "concurrency-limit",
        }
    }

    /// Returns the taxonomy bucket this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NetworkLimit | Self::NetworkBlocked => ErrorCategory::Policy,
            Self::EngineMissing | Self::SceneMissing | Self::SurfaceContextLost => {
                ErrorCategory::Environment
            }
            Self::RuntimeError | Self::UnhandledRejection => ErrorCategory::Runtime,
            Self::ExportFailed | Self::EmptyResult => ErrorCategory::Export,
            Self::HostTimeout
            | Self::InvalidDocument
            | Self::ContextFailed
            | Self::ConcurrencyLimit => ErrorCategory::Supervisory,
        }
    }

    /// Whether this code is reported as a `policyViolation` message rather than `error`.
    pub fn is_policy_violation(&self) -> bool {
        self.category() == ErrorCategory::Policy
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a conversion.
///
/// Carries the tail of the guest log so callers can tell which policy or
/// runtime condition ended the run.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{code}: {message}")]
pub struct SandboxError {
    /// What went wrong.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Structured context (offending URL, network channel, limits, ...).
    pub detail: Map<String, Value>,
    /// The last buffered log lines, oldest first.
    pub logs: Vec<LogEntry>,
}

impl SandboxError {
    /// Create an error with no detail and no logs.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: Map::new(),
            logs: Vec::new(),
        }
    }

    /// Attach a detail entry.
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }

    /// Replace the detail map.
    pub fn with_detail_map(mut self, detail: Map<String, Value>) -> Self {
        self.detail = detail;
        self
    }

    /// Attach captured log lines.
    pub fn with_logs(mut self, logs: Vec<LogEntry>) -> Self {
        self.logs = logs;
        self
    }

    /// Structured JSON form for callers that surface errors over an API.
    pub fn to_structured_error(&self) -> Value {
        serde_json::json!({
            "error": true,
            "code": self.code,
            "category": self.code.category(),
            "message": self.message,
            "detail": self.detail,
            "logs": self.logs,
        })
    }
}

/// Infrastructure failures while creating or talking to an execution context.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContextError {
    /// The worker process could not be spawned.
    #[error("failed to spawn worker at {path}: {source}")]
    Spawn {
        /// Worker binary path.
        path: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The worker binary could not be located.
    #[error("{0}")]
    WorkerNotFound(String),

    /// The worker binary has unsafe permissions.
    #[error("insecure permissions on worker binary {path}: mode {mode:o} is world-writable")]
    InsecureWorker {
        /// Worker binary path.
        path: String,
        /// File mode bits.
        mode: u32,
    },

    /// Frame-level IPC failure.
    #[error("IPC error: {0}")]
    Ipc(#[from] std::io::Error),

    /// The context was started twice or used after destruction.
    #[error("invalid context state: {0}")]
    State(&'static str),

    /// Anything else that prevented the context from running.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ContextError> for SandboxError {
    fn from(err: ContextError) -> Self {
        SandboxError::new(ErrorCode::ContextFailed, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_kebab_case() {
        let json = serde_json::to_string(&ErrorCode::SurfaceContextLost).unwrap();
        assert_eq!(json, "\"surface-context-lost\"");
        let back: ErrorCode = serde_json::from_str("\"host-timeout\"").unwrap();
        assert_eq!(back, ErrorCode::HostTimeout);
    }

    #[test]
    fn display_matches_wire_form() {
        for code in [
            ErrorCode::NetworkLimit,
            ErrorCode::EngineMissing,
            ErrorCode::UnhandledRejection,
            ErrorCode::EmptyResult,
        ] {
            let wire = serde_json::to_value(code).unwrap();
            assert_eq!(wire.as_str().unwrap(), code.to_string());
        }
    }

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(ErrorCode::NetworkBlocked.category(), ErrorCategory::Policy);
        assert_eq!(ErrorCode::SceneMissing.category(), ErrorCategory::Environment);
        assert_eq!(ErrorCode::RuntimeError.category(), ErrorCategory::Runtime);
        assert_eq!(ErrorCode::ExportFailed.category(), ErrorCategory::Export);
        assert_eq!(ErrorCode::HostTimeout.category(), ErrorCategory::Supervisory);
        assert!(ErrorCode::NetworkLimit.is_policy_violation());
        assert!(!ErrorCode::RuntimeError.is_policy_violation());
    }

    #[test]
    fn structured_error_carries_detail() {
        let err = SandboxError::new(ErrorCode::NetworkBlocked, "blocked")
            .with_detail("url", "https://evil.test/x");
        let json = err.to_structured_error();
        assert_eq!(json["code"], "network-blocked");
        assert_eq!(json["category"], "policy");
        assert_eq!(json["detail"]["url"], "https://evil.test/x");
        assert_eq!(err.to_string(), "network-blocked: blocked");
    }

    #[test]
    fn context_error_maps_to_context_failed() {
        let err: SandboxError = ContextError::State("started twice").into();
        assert_eq!(err.code, ErrorCode::ContextFailed);
        assert!(err.message.contains("started twice"));
    }
}
