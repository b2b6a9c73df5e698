//! scenebox worker: isolated child process for one guest document.
//!
//! Spawned by the sandbox's process context. Reads a `Start` frame from
//! stdin, runs the document in a V8 isolate and streams guest messages back
//! over stdout. Requests the guest's network guard admits are proxied to the
//! parent, which owns the real transport.
//!
//! Runs with a cleared environment. Stdout carries frames only; logs go to
//! stderr.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use scenebox_sandbox::isolate::{spawn_isolate, IsolateRun};
use scenebox_sandbox::protocol::{
    read_frame, read_frame_with_limit, write_frame, GuestMessage, HostFrame, WorkerFrame,
};
use scenebox_sandbox::transport::{
    NetworkRequest, NetworkResponse, NetworkTransport, TransportError,
};
use tokio::io::{self, BufReader};
use tokio::sync::{mpsc, oneshot};

type FetchWaiter = oneshot::Sender<Result<NetworkResponse, String>>;

/// Transport that asks the parent to perform each request.
struct IpcFetchBridge {
    tx: mpsc::UnboundedSender<WorkerFrame>,
    waiter_tx: mpsc::UnboundedSender<(u64, FetchWaiter)>,
    next_id: AtomicU64,
}

#[async_trait::async_trait]
impl NetworkTransport for IpcFetchBridge {
    async fn fetch(&self, request: NetworkRequest) -> Result<NetworkResponse, TransportError> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);

        // Register before sending so the reply cannot race the waiter.
        let (resp_tx, resp_rx) = oneshot::channel();
        self.waiter_tx
            .send((request_id, resp_tx))
            .map_err(|_| TransportError::Failed("IPC waiter channel closed".into()))?;
        self.tx
            .send(WorkerFrame::FetchRequest {
                request_id,
                request,
            })
            .map_err(|_| TransportError::Failed("IPC send channel closed".into()))?;

        resp_rx
            .await
            .map_err(|_| TransportError::Failed("IPC response channel closed".into()))?
            .map_err(TransportError::Failed)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // The parent already clears the environment; this covers manual launches.
    let env_keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    let frame: HostFrame = read_frame(&mut stdin)
        .await
        .context("failed to read initial frame from parent")?
        .context("parent closed stdin before sending Start")?;
    let (document, config) = match frame {
        HostFrame::Start { document, config } => (document, config),
        other => anyhow::bail!("expected Start frame, got: {:?}", other),
    };
    let max_frame_size = config.max_frame_size;

    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerFrame>();
    let (waiter_tx, mut waiter_rx) = mpsc::unbounded_channel::<(u64, FetchWaiter)>();
    let (sink, mut guest_rx) = mpsc::unbounded_channel::<GuestMessage>();
    // Held until the parent goes away; dropping it cancels the guest.
    let (cancel_tx, cancel) = oneshot::channel::<()>();

    let transport: Arc<dyn NetworkTransport> = Arc::new(IpcFetchBridge {
        tx,
        waiter_tx,
        next_id: AtomicU64::new(1),
    });

    // V8 isolates are !Send; the guest gets its own thread and runtime.
    let exec_handle = spawn_isolate(IsolateRun {
        document,
        config,
        transport,
        sink,
        cancel,
        isolate_slot: None,
    })
    .context("failed to start guest thread")?;

    // Frames from the parent are read on their own task; a partially read
    // frame must never be abandoned by `select!`.
    let (host_tx, mut host_rx) = mpsc::unbounded_channel::<HostFrame>();
    tokio::spawn(async move {
        loop {
            match read_frame_with_limit::<HostFrame, _>(&mut stdin, max_frame_size).await {
                Ok(Some(frame)) => {
                    if host_tx.send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to read from parent");
                    break;
                }
            }
        }
    });

    let mut pending: HashMap<u64, FetchWaiter> = HashMap::new();
    let mut cancel_tx = Some(cancel_tx);

    // Multiplex:
    // 1. guest messages and fetch requests going to the parent
    // 2. fetch results coming back
    // 3. waiter registration
    loop {
        tokio::select! {
            message = guest_rx.recv() => match message {
                Some(message) => {
                    write_frame(&mut stdout, &WorkerFrame::Guest { message })
                        .await
                        .context("failed to write guest message to parent")?;
                }
                // Guest thread finished and dropped the sink.
                None => break,
            },

            Some(frame) = rx.recv() => {
                write_frame(&mut stdout, &frame)
                    .await
                    .context("failed to write fetch request to parent")?;
            }

            frame = host_rx.recv(), if cancel_tx.is_some() => match frame {
                Some(HostFrame::FetchResult { request_id, result }) => {
                    while let Ok((id, sender)) = waiter_rx.try_recv() {
                        pending.insert(id, sender);
                    }
                    if let Some(waiter) = pending.remove(&request_id) {
                        let _ = waiter.send(result);
                    }
                }
                Some(_) => tracing::warn!("unexpected frame from parent"),
                None => {
                    // Parent went away: stop the guest.
                    cancel_tx = None;
                    pending.clear();
                }
            },

            Some((id, sender)) = waiter_rx.recv() => {
                pending.insert(id, sender);
            }
        }
    }

    drop(cancel_tx);
    let _ = exec_handle.join();

    Ok(())
}
