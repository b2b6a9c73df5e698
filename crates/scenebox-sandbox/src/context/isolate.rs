//! In-process context: one V8 isolate on a dedicated thread per document.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};

use super::{ContextControl, ContextHandle, ExecutionContext};
use crate::document::BootstrapDocument;
use crate::error::ContextError;
use crate::isolate::{spawn_isolate, IsolateRun, IsolateSlot};
use crate::protocol::WorkerConfig;
use crate::transport::NetworkTransport;

pub struct IsolateContext {
    config: WorkerConfig,
    transport: Arc<dyn NetworkTransport>,
}

impl IsolateContext {
    pub fn new(config: WorkerConfig, transport: Arc<dyn NetworkTransport>) -> Self {
        Self { config, transport }
    }
}

impl ExecutionContext for IsolateContext {
    fn create(&self, document: BootstrapDocument) -> Result<ContextHandle, ContextError> {
        let (sink, messages) = mpsc::unbounded_channel();
        let (cancel_tx, cancel) = oneshot::channel();
        let slot: IsolateSlot = Arc::new(Mutex::new(None));
        let run = IsolateRun {
            document,
            config: self.config.clone(),
            transport: self.transport.clone(),
            sink,
            cancel,
            isolate_slot: Some(slot.clone()),
        };
        Ok(ContextHandle::new(
            messages,
            Box::new(IsolateControl {
                pending: Some(run),
                cancel: Some(cancel_tx),
                slot,
                thread: None,
            }),
        ))
    }
}

struct IsolateControl {
    pending: Option<IsolateRun>,
    cancel: Option<oneshot::Sender<()>>,
    slot: IsolateSlot,
    thread: Option<JoinHandle<()>>,
}

impl ContextControl for IsolateControl {
    fn start(&mut self) -> Result<(), ContextError> {
        let run = self
            .pending
            .take()
            .ok_or(ContextError::State("isolate already started"))?;
        self.thread = Some(spawn_isolate(run)?);
        Ok(())
    }

    fn destroy(&mut self) {
        self.pending = None;
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        // A guest stuck in synchronous code never observes the cancel signal.
        let handle = match self.slot.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.terminate_execution();
        }
        // Detached: the thread exits on its own once V8 unwinds.
        if let Some(thread) = self.thread.take() {
            if thread.is_finished() {
                let _ = thread.join();
            }
        }
    }
}
