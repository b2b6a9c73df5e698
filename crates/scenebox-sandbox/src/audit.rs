//! Audit logging for conversions.
//!
//! Every conversion emits a [`ConversionAudit`] containing:
//! - Conversion ID (UUID)
//! - SHA-256 hash of the submitted document (never the raw markup)
//! - Execution mode, effective policy limits and duration
//! - Outcome, network attempts and log volume
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{ErrorCode, SandboxError};
use crate::protocol::ExportReason;
use crate::supervisor::{ConversionResult, ExecutionMode};

/// Audit record for a single conversion.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionAudit {
    pub conversion_id: String,
    /// When the conversion was submitted.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 of the raw document bytes.
    pub document_hash: String,
    pub document_bytes: usize,
    pub file_name: String,
    pub execution_mode: ExecutionMode,
    /// Effective `maxExecutionMs` after normalization, if it got that far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_ms: Option<u64>,
    pub duration_ms: u64,
    pub outcome: AuditOutcome,
    /// Network attempts the guest made. Only known for successful runs.
    pub network_requests: u32,
    /// Guest log lines received (successful runs) or attached (failures).
    pub log_count: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub binary_bundle: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub thumbnail: bool,
}

/// How a conversion ended.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
#[non_exhaustive]
pub enum AuditOutcome {
    Success {
        reason: ExportReason,
        object_count: usize,
    },
    /// Guest policy violation.
    Violation { code: ErrorCode, message: String },
    Error { code: ErrorCode, message: String },
    /// The host stopped waiting.
    Timeout,
}

impl AuditOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Violation { .. } => "violation",
            Self::Error { .. } => "error",
            Self::Timeout => "timeout",
        }
    }
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &ConversionAudit);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the sink.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &ConversionAudit) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &ConversionAudit) {}
}

/// Emits audit entries as `INFO` events with `audit = true`.
///
/// Use `RUST_LOG=scenebox=info` to capture them.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &ConversionAudit) {
        tracing::info!(
            audit = true,
            conversion_id = %entry.conversion_id,
            file = %entry.file_name,
            document_hash = %entry.document_hash,
            document_bytes = entry.document_bytes,
            mode = ?entry.execution_mode,
            duration_ms = entry.duration_ms,
            network_requests = entry.network_requests,
            log_count = entry.log_count,
            outcome = entry.outcome.label(),
            "audit"
        );
    }
}

/// SHA-256 of a byte slice as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Accumulates audit facts while a conversion runs.
pub struct ConversionAuditBuilder {
    conversion_id: String,
    timestamp: DateTime<Utc>,
    document_hash: String,
    document_bytes: usize,
    file_name: String,
    execution_mode: ExecutionMode,
    max_execution_ms: Option<u64>,
    start: Instant,
}

impl ConversionAuditBuilder {
    pub fn new(document: &[u8], file_name: &str, execution_mode: ExecutionMode) -> Self {
        Self {
            conversion_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            document_hash: sha256_hex(document),
            document_bytes: document.len(),
            file_name: file_name.to_string(),
            execution_mode,
            max_execution_ms: None,
            start: Instant::now(),
        }
    }

    pub fn conversion_id(&self) -> &str {
        &self.conversion_id
    }

    /// Record the normalized execution limit.
    pub fn max_execution_ms(&mut self, ms: u64) {
        self.max_execution_ms = Some(ms);
    }

    /// Finalize the entry with the conversion result.
    pub fn finish(self, result: &Result<ConversionResult, SandboxError>) -> ConversionAudit {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        let (outcome, network_requests, log_count, binary_bundle, thumbnail) = match result {
            Ok(r) => (
                AuditOutcome::Success {
                    reason: r.summary.reason,
                    object_count: r.summary.object_count,
                },
                r.summary.network_requests,
                r.logs.len(),
                r.artifacts.binary_bundle.is_some(),
                r.artifacts.thumbnail.is_some(),
            ),
            Err(e) => {
                let outcome = match e.code {
                    ErrorCode::HostTimeout => AuditOutcome::Timeout,
                    code if code.is_policy_violation() => AuditOutcome::Violation {
                        code,
                        message: e.message.clone(),
                    },
                    code => AuditOutcome::Error {
                        code,
                        message: e.message.clone(),
                    },
                };
                (outcome, 0, e.logs.len(), false, false)
            }
        };

        ConversionAudit {
            conversion_id: self.conversion_id,
            timestamp: self.timestamp,
            document_hash: self.document_hash,
            document_bytes: self.document_bytes,
            file_name: self.file_name,
            execution_mode: self.execution_mode,
            max_execution_ms: self.max_execution_ms,
            duration_ms,
            outcome,
            network_requests,
            log_count,
            binary_bundle,
            thumbnail,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::policy::normalize;
    use crate::protocol::{ExportSummary, LogEntry, LogLevel};
    use crate::supervisor::{ConversionArtifacts, GeneratedFile};

    fn success() -> ConversionResult {
        ConversionResult {
            files: vec![GeneratedFile {
                name: "a.scene.json".into(),
                contents: "{}".into(),
            }],
            scene_snapshot: json!({ "object": {} }),
            artifacts: ConversionArtifacts {
                binary_bundle: Some(vec![1, 2, 3]),
                thumbnail: None,
            },
            summary: ExportSummary {
                object_count: 4,
                duration_ms: 3,
                reason: ExportReason::Idle,
                network_requests: 2,
            },
            logs: vec![LogEntry {
                level: LogLevel::Info,
                message: "hi".into(),
                elapsed_ms: 1,
            }],
            policy: normalize(&Value::Null),
        }
    }

    #[test]
    fn sha256_hex_produces_correct_hash() {
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn success_entry_carries_summary() {
        let mut builder = ConversionAuditBuilder::new(b"<html>", "a.html", ExecutionMode::Isolate);
        builder.max_execution_ms(8000);
        let entry = builder.finish(&Ok(success()));
        assert_eq!(entry.document_bytes, 6);
        assert_eq!(entry.network_requests, 2);
        assert_eq!(entry.log_count, 1);
        assert!(entry.binary_bundle);
        assert!(!entry.thumbnail);
        assert!(matches!(
            entry.outcome,
            AuditOutcome::Success { reason: ExportReason::Idle, object_count: 4 }
        ));
    }

    #[test]
    fn failures_are_bucketed() {
        let cases = [
            (ErrorCode::HostTimeout, "timeout"),
            (ErrorCode::NetworkBlocked, "violation"),
            (ErrorCode::RuntimeError, "error"),
        ];
        for (code, label) in cases {
            let builder = ConversionAuditBuilder::new(b"x", "a.html", ExecutionMode::Process);
            let entry = builder.finish(&Err(SandboxError::new(code, "nope")));
            assert_eq!(entry.outcome.label(), label);
        }
    }

    #[tokio::test]
    async fn json_lines_logger_writes_one_line_per_entry() {
        let logger = JsonLinesAuditLogger::new(Vec::<u8>::new());
        for _ in 0..2 {
            let builder = ConversionAuditBuilder::new(b"<p>", "a.html", ExecutionMode::Isolate);
            logger.log(&builder.finish(&Ok(success()))).await;
        }
        let output = String::from_utf8(logger.into_inner()).unwrap();
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["outcome"]["status"], "success");
        assert_eq!(parsed["execution_mode"], "isolate");
        assert!(parsed.get("document").is_none());
        assert!(!lines[0].contains("<p>"));
    }

    #[tokio::test]
    async fn noop_and_tracing_loggers_accept_entries() {
        let entry = ConversionAuditBuilder::new(b"x", "a.html", ExecutionMode::Isolate)
            .finish(&Err(SandboxError::new(ErrorCode::EmptyResult, "empty")));
        NoopAuditLogger.log(&entry).await;
        TracingAuditLogger.log(&entry).await;
    }
}
