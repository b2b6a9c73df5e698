//! Host supervisor: runs one untrusted document to a [`ConversionResult`].
//!
//! Each call to [`SceneSandbox::convert`] normalizes the caller's policy,
//! builds the bootstrap document, creates an execution context with its
//! listener already attached, and waits for the first terminal message under
//! a host-side deadline that does not depend on the guest's own watchdog.
//! The context is destroyed on every exit path.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::audit::{AuditLogger, ConversionAuditBuilder, NoopAuditLogger};
use crate::context::{ContextHandle, ExecutionContext, IsolateContext, ProcessContext};
use crate::document::{self, DocumentMetadata, DEFAULT_MAX_DOCUMENT_SIZE};
use crate::error::{ErrorCode, SandboxError};
use crate::guest::diagnostics;
use crate::logs::{LogBuffer, DEFAULT_ERROR_LOG_TAIL, DEFAULT_LOG_CAPACITY};
use crate::policy::{normalize, SandboxPolicy};
use crate::protocol::{ExportSummary, GuestMessage, LogEntry, WorkerConfig};
use crate::transport::{NetworkTransport, OfflineTransport};

#[cfg(feature = "metrics")]
use crate::metrics::SceneboxMetrics;

/// Where guest documents execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// V8 isolate on a dedicated thread of this process.
    #[default]
    Isolate,
    /// A `scenebox-worker` child process per conversion.
    Process,
}

/// Host-side limits. Guest-facing limits live in [`SandboxPolicy`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub execution_mode: ExecutionMode,
    /// Maximum document size in bytes.
    pub max_document_size: usize,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum conversions running at once.
    pub max_concurrent: usize,
    /// Guest log lines retained per conversion.
    pub max_log_entries: usize,
    /// Log lines attached to a [`SandboxError`].
    pub error_log_tail: usize,
    /// Install the `SCENE` engine for guests. Disabling it makes every
    /// conversion fail with `engine-missing`.
    pub provide_engine: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_heap_size: 128 * 1024 * 1024, // 128 MB
            max_concurrent: 4,
            max_log_entries: DEFAULT_LOG_CAPACITY,
            error_log_tail: DEFAULT_ERROR_LOG_TAIL,
            provide_engine: true,
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    pub file_name: String,
    /// Candidate policy; normalized before use. `Null` means defaults.
    pub policy: Value,
    /// Origin that `self` resolves to.
    pub origin: Option<String>,
}

impl ConvertOptions {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, policy: Value) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

/// A file produced by a conversion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedFile {
    pub name: String,
    pub contents: String,
}

/// RGBA8 preview raster.
#[derive(Debug, Clone, PartialEq)]
pub struct Thumbnail {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Optional outputs. Missing artifacts never fail a conversion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversionArtifacts {
    /// GLB bundle.
    pub binary_bundle: Option<Vec<u8>>,
    pub thumbnail: Option<Thumbnail>,
}

#[derive(Debug, Clone)]
pub struct ConversionResult {
    /// `<stem>.scene.json`, the pretty-printed snapshot.
    pub files: Vec<GeneratedFile>,
    pub scene_snapshot: Value,
    pub artifacts: ConversionArtifacts,
    pub summary: ExportSummary,
    /// Buffered guest log, oldest first.
    pub logs: Vec<LogEntry>,
    /// The policy the guest actually ran under.
    pub policy: SandboxPolicy,
}

/// Runs untrusted scene documents. `Send + Sync`; share it behind an `Arc`.
pub struct SceneSandbox {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    context: Arc<dyn ExecutionContext>,
    audit_logger: Arc<dyn AuditLogger>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<SceneboxMetrics>>,
}

impl SceneSandbox {
    /// A sandbox whose guests can only load `data:` URLs.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_transport(config, Arc::new(OfflineTransport))
    }

    /// A sandbox whose admitted requests are performed by `transport`.
    pub fn with_transport(config: SandboxConfig, transport: Arc<dyn NetworkTransport>) -> Self {
        let worker_config = WorkerConfig::from(&config);
        let context: Arc<dyn ExecutionContext> = match config.execution_mode {
            ExecutionMode::Isolate => Arc::new(IsolateContext::new(worker_config, transport)),
            ExecutionMode::Process => Arc::new(ProcessContext::new(worker_config, transport)),
        };
        Self::with_context(config, context)
    }

    /// A sandbox backed by a caller-supplied execution context.
    pub fn with_context(config: SandboxConfig, context: Arc<dyn ExecutionContext>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            context,
            audit_logger: Arc::new(NoopAuditLogger),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit_logger = logger;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<SceneboxMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Convert one document.
    ///
    /// Resolves with a result only if the guest exported a scene snapshot.
    /// Policy violations, guest failures and the host deadline all reject with
    /// a [`SandboxError`] carrying the tail of the guest log.
    pub async fn convert(
        &self,
        content: impl AsRef<[u8]>,
        options: ConvertOptions,
    ) -> Result<ConversionResult, SandboxError> {
        let content = content.as_ref();
        let started = Instant::now();
        tracing::info!(
            file = %options.file_name,
            document_bytes = content.len(),
            mode = ?self.config.execution_mode,
            "convert: starting"
        );

        let mut audit = ConversionAuditBuilder::new(
            content,
            &options.file_name,
            self.config.execution_mode,
        );

        let result = match self.semaphore.clone().try_acquire_owned() {
            Ok(_permit) => {
                #[cfg(feature = "metrics")]
                let _in_flight = self.metrics.as_ref().map(|m| InFlight::enter(m.clone()));
                self.run(content, options.clone(), &mut audit).await
            }
            Err(_) => Err(SandboxError::new(
                ErrorCode::ConcurrencyLimit,
                format!(
                    "too many concurrent conversions (max {})",
                    self.config.max_concurrent
                ),
            )
            .with_detail("max", self.config.max_concurrent)),
        };

        let entry = audit.finish(&result);
        self.audit_logger.log(&entry).await;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_conversion(entry.outcome.label(), started.elapsed().as_secs_f64());
            match &result {
                Ok(r) => metrics.record_export(r.summary.reason.as_str()),
                Err(e) => metrics.record_error(e.code.as_str()),
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(r) => tracing::info!(
                file = %options.file_name,
                reason = r.summary.reason.as_str(),
                objects = r.summary.object_count,
                duration_ms,
                "convert: complete"
            ),
            Err(e) => tracing::warn!(
                file = %options.file_name,
                code = %e.code,
                error = %e.message,
                duration_ms,
                "convert: failed"
            ),
        }
        result
    }

    async fn run(
        &self,
        content: &[u8],
        options: ConvertOptions,
        audit: &mut ConversionAuditBuilder,
    ) -> Result<ConversionResult, SandboxError> {
        let content = std::str::from_utf8(content).map_err(|e| {
            SandboxError::new(
                ErrorCode::InvalidDocument,
                format!("document is not valid UTF-8: {e}"),
            )
        })?;
        document::validate_content(content, self.config.max_document_size)?;

        let policy = normalize(&options.policy);
        audit.max_execution_ms(policy.max_execution_ms);
        let metadata = DocumentMetadata {
            file_name: options.file_name,
            origin: options.origin,
        };
        let bootstrap = document::build(content, &policy, &metadata);
        let host_timeout = policy.host_timeout();

        let mut handle = self.context.create(bootstrap)?;
        let mut session = Session::new(&metadata.file_name, self.config.max_log_entries);
        if let Err(e) = handle.start() {
            handle.destroy();
            return Err(e.into());
        }

        let settled = tokio::time::timeout(host_timeout, session.settle(&mut handle)).await;
        handle.destroy();

        let outcome = match settled {
            Ok(Ok(settlement)) => Ok(settlement),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => {
                let timeout_ms = host_timeout.as_millis() as u64;
                Err(SandboxError::new(
                    ErrorCode::HostTimeout,
                    format!("no result from the guest within {timeout_ms}ms"),
                )
                .with_detail("timeoutMs", timeout_ms))
            }
        };

        match outcome {
            Ok(Settlement {
                scene_snapshot,
                summary,
            }) => {
                let contents = serde_json::to_string_pretty(&scene_snapshot).map_err(|e| {
                    SandboxError::new(
                        ErrorCode::ExportFailed,
                        format!("snapshot could not be serialized: {e}"),
                    )
                })?;
                let Session {
                    logs, artifacts, ..
                } = session;
                Ok(ConversionResult {
                    files: vec![GeneratedFile {
                        name: snapshot_file_name(&metadata.file_name),
                        contents,
                    }],
                    scene_snapshot,
                    artifacts,
                    summary,
                    logs: logs.into_vec(),
                    policy,
                })
            }
            Err(e) => Err(e.with_logs(session.logs.tail(self.config.error_log_tail))),
        }
    }
}

#[cfg(feature = "metrics")]
struct InFlight(Arc<SceneboxMetrics>);

#[cfg(feature = "metrics")]
impl InFlight {
    fn enter(metrics: Arc<SceneboxMetrics>) -> Self {
        metrics.conversions_in_flight.inc();
        Self(metrics)
    }
}

#[cfg(feature = "metrics")]
impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.conversions_in_flight.dec();
    }
}

struct Settlement {
    scene_snapshot: Value,
    summary: ExportSummary,
}

/// Host-side state accumulated from one context's messages.
struct Session {
    file_name: String,
    logs: LogBuffer,
    artifacts: ConversionArtifacts,
}

impl Session {
    fn new(file_name: &str, log_capacity: usize) -> Self {
        Self {
            file_name: file_name.to_string(),
            logs: LogBuffer::new(log_capacity),
            artifacts: ConversionArtifacts::default(),
        }
    }

    /// Consume messages until one is terminal.
    async fn settle(&mut self, handle: &mut ContextHandle) -> Result<Settlement, SandboxError> {
        while let Some(message) = handle.recv().await {
            match message {
                GuestMessage::Result {
                    scene_snapshot,
                    summary,
                } => {
                    if !has_scene(&scene_snapshot) {
                        return Err(SandboxError::new(
                            ErrorCode::EmptyResult,
                            "guest reported a result without a scene snapshot",
                        ));
                    }
                    // Artifacts may trail the result.
                    while let Some(late) = handle.try_recv() {
                        self.absorb(late);
                    }
                    return Ok(Settlement {
                        scene_snapshot,
                        summary,
                    });
                }
                GuestMessage::PolicyViolation {
                    code,
                    message,
                    url,
                    channel,
                } => {
                    let mut err = SandboxError::new(code, message);
                    if let Some(url) = url {
                        err = err.with_detail("url", url);
                    }
                    if let Some(channel) = channel {
                        err = err.with_detail("channel", channel.as_str());
                    }
                    return Err(err);
                }
                GuestMessage::Error {
                    code,
                    message,
                    detail,
                } => return Err(SandboxError::new(code, message).with_detail_map(detail)),
                other => self.absorb(other),
            }
        }
        Err(SandboxError::new(
            ErrorCode::ContextFailed,
            "execution context exited without producing a result",
        ))
    }

    /// Non-terminal messages.
    fn absorb(&mut self, message: GuestMessage) {
        match message {
            GuestMessage::Boot { file_name } => {
                tracing::debug!(file = %file_name, "guest runtime booted");
            }
            GuestMessage::Log(entry) => {
                diagnostics::mirror(&self.file_name, &entry);
                self.logs.push(entry);
            }
            GuestMessage::BinaryAsset { buffer, .. } => {
                self.artifacts.binary_bundle = Some(buffer);
            }
            GuestMessage::Thumbnail {
                data,
                width,
                height,
            } => {
                if self.artifacts.thumbnail.is_none() {
                    self.artifacts.thumbnail = Some(Thumbnail {
                        data,
                        width,
                        height,
                    });
                }
            }
            terminal => {
                tracing::debug!(kind = terminal.kind(), "ignoring message after settlement");
            }
        }
    }
}

fn has_scene(snapshot: &Value) -> bool {
    snapshot.get("object").is_some_and(Value::is_object)
}

/// `models/cube.html` → `cube.scene.json`.
pub fn snapshot_file_name(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("scene");
    format!("{stem}.scene.json")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::context::ContextControl;
    use crate::document::BootstrapDocument;
    use crate::error::ContextError;
    use crate::protocol::{ExportReason, LogLevel, NetworkChannel};

    /// Replays canned messages on start; optionally never closes the channel.
    struct ScriptedContext {
        messages: Vec<GuestMessage>,
        hold_open: bool,
        destroys: Arc<AtomicUsize>,
        seen: Arc<Mutex<Option<BootstrapDocument>>>,
    }

    impl ScriptedContext {
        fn new(messages: Vec<GuestMessage>) -> Self {
            Self {
                messages,
                hold_open: false,
                destroys: Arc::default(),
                seen: Arc::default(),
            }
        }
    }

    struct ScriptedControl {
        messages: Vec<GuestMessage>,
        sink: Option<mpsc::UnboundedSender<GuestMessage>>,
        hold_open: bool,
        destroys: Arc<AtomicUsize>,
    }

    impl ExecutionContext for ScriptedContext {
        fn create(&self, document: BootstrapDocument) -> Result<ContextHandle, ContextError> {
            *self.seen.lock().unwrap() = Some(document);
            let (sink, rx) = mpsc::unbounded_channel();
            Ok(ContextHandle::new(
                rx,
                Box::new(ScriptedControl {
                    messages: self.messages.clone(),
                    sink: Some(sink),
                    hold_open: self.hold_open,
                    destroys: self.destroys.clone(),
                }),
            ))
        }
    }

    impl ContextControl for ScriptedControl {
        fn start(&mut self) -> Result<(), ContextError> {
            let sink = self.sink.take().ok_or(ContextError::State("started"))?;
            for m in self.messages.drain(..) {
                let _ = sink.send(m);
            }
            if self.hold_open {
                self.sink = Some(sink);
            }
            Ok(())
        }

        fn destroy(&mut self) {
            self.sink = None;
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn log(message: &str) -> GuestMessage {
        GuestMessage::Log(LogEntry {
            level: LogLevel::Info,
            message: message.into(),
            elapsed_ms: 0,
        })
    }

    fn result(reason: ExportReason) -> GuestMessage {
        GuestMessage::Result {
            scene_snapshot: json!({ "metadata": {}, "object": { "type": "Scene" } }),
            summary: ExportSummary {
                object_count: 1,
                duration_ms: 1,
                reason,
                network_requests: 0,
            },
        }
    }

    fn sandbox(context: ScriptedContext) -> SceneSandbox {
        SceneSandbox::with_context(SandboxConfig::default(), Arc::new(context))
    }

    #[tokio::test]
    async fn result_collects_artifacts_and_logs() {
        let context = ScriptedContext::new(vec![
            GuestMessage::Boot {
                file_name: "cube.html".into(),
            },
            log("hello"),
            GuestMessage::Thumbnail {
                data: vec![0; 16],
                width: 2,
                height: 2,
            },
            result(ExportReason::FirstRender),
            GuestMessage::BinaryAsset {
                byte_length: 3,
                buffer: vec![1, 2, 3],
            },
        ]);
        let destroys = context.destroys.clone();
        let out = sandbox(context)
            .convert("<p>x</p>", ConvertOptions::new("models/cube.html"))
            .await
            .unwrap();
        assert_eq!(out.files[0].name, "cube.scene.json");
        assert!(out.files[0].contents.contains("\"Scene\""));
        assert_eq!(out.artifacts.binary_bundle, Some(vec![1, 2, 3]));
        assert_eq!(out.artifacts.thumbnail.as_ref().map(|t| t.width), Some(2));
        assert_eq!(out.logs.len(), 1);
        assert_eq!(out.summary.reason, ExportReason::FirstRender);
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn policy_is_normalized_before_the_document_is_built() {
        let context = ScriptedContext::new(vec![result(ExportReason::Idle)]);
        let seen = context.seen.clone();
        let out = sandbox(context)
            .convert(
                "<p>x</p>",
                ConvertOptions::new("a.html").with_policy(json!({ "maxExecutionMs": 1 })),
            )
            .await
            .unwrap();
        assert_eq!(out.policy.max_execution_ms, 2000);
        let doc = seen.lock().unwrap().take().unwrap();
        assert_eq!(doc.config.policy, out.policy);
    }

    #[tokio::test]
    async fn violation_rejects_with_log_tail() {
        let mut messages: Vec<_> = (0..60).map(|i| log(&format!("line {i}"))).collect();
        messages.push(GuestMessage::PolicyViolation {
            code: ErrorCode::NetworkBlocked,
            message: "blocked".into(),
            url: Some("https://evil.test/x".into()),
            channel: Some(NetworkChannel::Beacon),
        });
        messages.push(result(ExportReason::Idle));
        let err = sandbox(ScriptedContext::new(messages))
            .convert("<p>x</p>", ConvertOptions::new("a.html"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkBlocked);
        assert_eq!(err.detail["url"], "https://evil.test/x");
        assert_eq!(err.detail["channel"], "beacon");
        assert_eq!(err.logs.len(), DEFAULT_ERROR_LOG_TAIL);
        assert_eq!(err.logs.last().unwrap().message, "line 59");
    }

    #[tokio::test]
    async fn guest_error_keeps_its_detail() {
        let mut detail = serde_json::Map::new();
        detail.insert("reason".into(), "heap-limit".into());
        let err = sandbox(ScriptedContext::new(vec![GuestMessage::Error {
            code: ErrorCode::RuntimeError,
            message: "guest exceeded its memory limit".into(),
            detail,
        }]))
        .convert("<p>x</p>", ConvertOptions::new("a.html"))
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::RuntimeError);
        assert_eq!(err.detail["reason"], "heap-limit");
    }

    #[tokio::test]
    async fn result_without_scene_is_empty() {
        let err = sandbox(ScriptedContext::new(vec![GuestMessage::Result {
            scene_snapshot: Value::Null,
            summary: ExportSummary {
                object_count: 0,
                duration_ms: 0,
                reason: ExportReason::Manual,
                network_requests: 0,
            },
        }]))
        .convert("<p>x</p>", ConvertOptions::new("a.html"))
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::EmptyResult);
    }

    #[tokio::test]
    async fn context_exit_without_result_fails() {
        let err = sandbox(ScriptedContext::new(vec![log("bye")]))
            .convert("<p>x</p>", ConvertOptions::new("a.html"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ContextFailed);
        assert_eq!(err.logs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn host_timeout_fires_when_the_guest_goes_silent() {
        let mut context = ScriptedContext::new(vec![log("spinning")]);
        context.hold_open = true;
        let destroys = context.destroys.clone();
        let started = tokio::time::Instant::now();
        let err = sandbox(context)
            .convert(
                "<p>x</p>",
                ConvertOptions::new("a.html").with_policy(json!({ "maxExecutionMs": 3000 })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::HostTimeout);
        assert_eq!(err.detail["timeoutMs"], 5000);
        assert!(started.elapsed() >= Duration::from_millis(5000));
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn host_timeout_is_capped() {
        let mut context = ScriptedContext::new(vec![]);
        context.hold_open = true;
        let err = sandbox(context)
            .convert(
                "<p>x</p>",
                ConvertOptions::new("a.html").with_policy(json!({ "maxExecutionMs": 30000 })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.detail["timeoutMs"], 10000);
    }

    #[tokio::test]
    async fn invalid_documents_never_reach_a_context() {
        let context = ScriptedContext::new(vec![result(ExportReason::Idle)]);
        let seen = context.seen.clone();
        let sandbox = SceneSandbox::with_context(
            SandboxConfig {
                max_document_size: 8,
                ..Default::default()
            },
            Arc::new(context),
        );
        for content in [&b"   "[..], &b"<p>too long</p>"[..], &[0xff, 0xfe][..]] {
            let err = sandbox
                .convert(content, ConvertOptions::new("a.html"))
                .await
                .unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidDocument);
        }
        assert!(seen.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrency_limit_is_enforced() {
        let mut context = ScriptedContext::new(vec![]);
        context.hold_open = true;
        let sandbox = Arc::new(SceneSandbox::with_context(
            SandboxConfig {
                max_concurrent: 1,
                ..Default::default()
            },
            Arc::new(context),
        ));
        let busy = {
            let sandbox = sandbox.clone();
            tokio::spawn(async move {
                sandbox
                    .convert("<p>x</p>", ConvertOptions::new("slow.html"))
                    .await
            })
        };
        // Let the first conversion take the only permit.
        while sandbox.semaphore.available_permits() > 0 {
            tokio::task::yield_now().await;
        }
        let err = sandbox
            .convert("<p>y</p>", ConvertOptions::new("b.html"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ConcurrencyLimit);
        busy.abort();
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn conversions_are_counted_by_outcome() {
        use crate::metrics::{ConversionLabels, ErrorLabels, ExportLabels};

        let mut registry = prometheus_client::registry::Registry::default();
        let metrics = Arc::new(SceneboxMetrics::new(&mut registry));

        let ok = sandbox(ScriptedContext::new(vec![result(ExportReason::Idle)]))
            .with_metrics(metrics.clone());
        ok.convert("<p>x</p>", ConvertOptions::new("a.html"))
            .await
            .unwrap();

        let blocked = sandbox(ScriptedContext::new(vec![GuestMessage::PolicyViolation {
            code: ErrorCode::NetworkBlocked,
            message: "blocked".into(),
            url: Some("https://evil.test/x".into()),
            channel: Some(NetworkChannel::Fetch),
        }]))
        .with_metrics(metrics.clone());
        blocked
            .convert("<p>x</p>", ConvertOptions::new("b.html"))
            .await
            .unwrap_err();

        let outcome = |label: &str| {
            metrics
                .conversions_total
                .get_or_create(&ConversionLabels {
                    outcome: label.into(),
                })
                .get()
        };
        assert_eq!(outcome("success"), 1);
        assert_eq!(outcome("violation"), 1);
        let exports = ExportLabels {
            reason: "idle".into(),
        };
        assert_eq!(metrics.exports_total.get_or_create(&exports).get(), 1);
        let errors = ErrorLabels {
            code: "network-blocked".into(),
        };
        assert_eq!(metrics.errors_total.get_or_create(&errors).get(), 1);
        assert_eq!(metrics.conversions_in_flight.get(), 0);
    }

    #[test]
    fn snapshot_names_follow_the_stem() {
        assert_eq!(snapshot_file_name("cube.html"), "cube.scene.json");
        assert_eq!(snapshot_file_name("dir/a.b.htm"), "a.b.scene.json");
        assert_eq!(snapshot_file_name(""), "scene.scene.json");
    }
}
