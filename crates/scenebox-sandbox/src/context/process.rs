//! Child-process context.
//!
//! Spawns `scenebox-worker` with a clean environment and talks to it over
//! length-delimited JSON frames on stdin/stdout. Requests the worker's guard
//! admits are performed here, by the host's [`NetworkTransport`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ContextControl, ContextHandle, ExecutionContext};
use crate::document::BootstrapDocument;
use crate::error::ContextError;
use crate::guest::MessageSink;
use crate::protocol::{read_frame_with_limit, write_frame, HostFrame, WorkerConfig, WorkerFrame};
use crate::transport::NetworkTransport;

/// Name of the worker binary.
pub const WORKER_BIN_NAME: &str = "scenebox-worker";

/// Absolute path override for the worker binary.
pub const WORKER_BIN_ENV: &str = "SCENEBOX_WORKER_BIN";

/// When set, worker stderr is inherited instead of discarded.
pub const WORKER_DEBUG_ENV: &str = "SCENEBOX_WORKER_DEBUG";

pub struct ProcessContext {
    config: WorkerConfig,
    transport: Arc<dyn NetworkTransport>,
}

impl ProcessContext {
    pub fn new(config: WorkerConfig, transport: Arc<dyn NetworkTransport>) -> Self {
        Self { config, transport }
    }
}

impl ExecutionContext for ProcessContext {
    fn create(&self, document: BootstrapDocument) -> Result<ContextHandle, ContextError> {
        let worker_bin = find_worker_binary()?;
        let (sink, messages) = mpsc::unbounded_channel();
        Ok(ContextHandle::new(
            messages,
            Box::new(ProcessControl {
                worker_bin,
                start: Some(HostFrame::Start {
                    document,
                    config: self.config.clone(),
                }),
                max_frame_size: self.config.max_frame_size,
                transport: self.transport.clone(),
                sink: Some(sink),
                child: None,
                tasks: Vec::new(),
            }),
        ))
    }
}

struct ProcessControl {
    worker_bin: PathBuf,
    start: Option<HostFrame>,
    max_frame_size: usize,
    transport: Arc<dyn NetworkTransport>,
    sink: Option<MessageSink>,
    child: Option<Child>,
    tasks: Vec<JoinHandle<()>>,
}

impl ContextControl for ProcessControl {
    fn start(&mut self) -> Result<(), ContextError> {
        let (start, sink) = match (self.start.take(), self.sink.take()) {
            (Some(start), Some(sink)) => (start, sink),
            _ => return Err(ContextError::State("worker already started")),
        };

        let mut child = Command::new(&self.worker_bin)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(if std::env::var(WORKER_DEBUG_ENV).is_ok() {
                std::process::Stdio::inherit()
            } else {
                std::process::Stdio::null()
            })
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ContextError::Spawn {
                path: self.worker_bin.display().to_string(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(ContextError::State("no stdin on worker"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ContextError::State("no stdout on worker"))?;

        let (frames_tx, frames_rx) = mpsc::unbounded_channel::<HostFrame>();
        // Queued before the writer starts, so it is always the first frame.
        frames_tx
            .send(start)
            .map_err(|_| ContextError::State("frame channel closed"))?;

        self.tasks.push(tokio::spawn(write_loop(stdin, frames_rx)));
        self.tasks.push(tokio::spawn(read_loop(
            BufReader::new(stdout),
            self.max_frame_size,
            sink,
            frames_tx,
            self.transport.clone(),
        )));
        self.child = Some(child);
        Ok(())
    }

    fn destroy(&mut self) {
        self.start = None;
        self.sink = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "worker already exited");
            }
        }
    }
}

async fn write_loop(mut stdin: ChildStdin, mut frames: mpsc::UnboundedReceiver<HostFrame>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_frame(&mut stdin, &frame).await {
            tracing::debug!(error = %e, "worker stdin closed");
            break;
        }
    }
}

/// Forward guest messages to the listener and serve proxied requests.
/// Returning drops `sink`, which the listener sees as the context exiting.
async fn read_loop(
    mut stdout: BufReader<ChildStdout>,
    max_frame_size: usize,
    sink: MessageSink,
    frames: mpsc::UnboundedSender<HostFrame>,
    transport: Arc<dyn NetworkTransport>,
) {
    loop {
        match read_frame_with_limit::<WorkerFrame, _>(&mut stdout, max_frame_size).await {
            Ok(Some(WorkerFrame::Guest { message })) => {
                if sink.send(message).is_err() {
                    return;
                }
            }
            Ok(Some(WorkerFrame::FetchRequest {
                request_id,
                request,
            })) => {
                let transport = transport.clone();
                let frames = frames.clone();
                tokio::spawn(async move {
                    let result = transport
                        .fetch(request)
                        .await
                        .map_err(|e| e.to_string());
                    let _ = frames.send(HostFrame::FetchResult { request_id, result });
                });
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "worker IPC read error");
                return;
            }
        }
    }
}

/// Find the `scenebox-worker` binary.
///
/// Search order:
/// 1. `SCENEBOX_WORKER_BIN` (must be an absolute path)
/// 2. Same directory as the current executable, or its parent for test
///    binaries under `deps/`
///
/// On Unix, rejects world-writable binaries.
pub fn find_worker_binary() -> Result<PathBuf, ContextError> {
    if let Ok(path) = std::env::var(WORKER_BIN_ENV) {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(ContextError::WorkerNotFound(format!(
                "{WORKER_BIN_ENV} must be an absolute path, got: {path}"
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidates = [Some(dir), dir.parent()];
            for dir in candidates.into_iter().flatten() {
                let worker = dir.join(WORKER_BIN_NAME);
                if worker.exists() {
                    validate_binary_permissions(&worker)?;
                    return Ok(worker);
                }
            }
        }
    }

    Err(ContextError::WorkerNotFound(format!(
        "{WORKER_BIN_NAME} binary not found. Set {WORKER_BIN_ENV} or install it alongside scenebox"
    )))
}

fn validate_binary_permissions(_path: &Path) -> Result<(), ContextError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(_path)?.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(ContextError::InsecureWorker {
                path: _path.display().to_string(),
                mode,
            });
        }
    }
    Ok(())
}
