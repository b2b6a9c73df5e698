//! Isolated execution contexts.
//!
//! The supervisor only ever sees `create → start → recv* → destroy`. Whether
//! the guest runs in an in-process V8 isolate or a child process is decided by
//! the [`ExecutionContext`] implementation.

pub mod isolate;
pub mod process;

use tokio::sync::mpsc;

use crate::document::BootstrapDocument;
use crate::error::ContextError;
use crate::protocol::GuestMessage;

pub use isolate::IsolateContext;
pub use process::ProcessContext;

/// Factory for isolated guest executions.
pub trait ExecutionContext: Send + Sync {
    /// Prepare a context for `document` without starting it.
    ///
    /// The returned handle already owns the message listener, so nothing the
    /// guest sends after [`ContextHandle::start`] can be missed.
    fn create(&self, document: BootstrapDocument) -> Result<ContextHandle, ContextError>;
}

/// Implementation-specific lifecycle of one context.
pub trait ContextControl: Send {
    /// Begin executing the guest.
    fn start(&mut self) -> Result<(), ContextError>;

    /// Tear the context down. Must tolerate being called before `start`.
    fn destroy(&mut self);
}

/// One guest execution: its message listener and its lifecycle.
pub struct ContextHandle {
    messages: mpsc::UnboundedReceiver<GuestMessage>,
    control: Box<dyn ContextControl>,
    started: bool,
    destroyed: bool,
}

impl ContextHandle {
    pub fn new(
        messages: mpsc::UnboundedReceiver<GuestMessage>,
        control: Box<dyn ContextControl>,
    ) -> Self {
        Self {
            messages,
            control,
            started: false,
            destroyed: false,
        }
    }

    pub fn start(&mut self) -> Result<(), ContextError> {
        if self.destroyed {
            return Err(ContextError::State("context already destroyed"));
        }
        if self.started {
            return Err(ContextError::State("context already started"));
        }
        self.started = true;
        self.control.start()
    }

    /// Next guest message. `None` once the guest side has gone away.
    pub async fn recv(&mut self) -> Option<GuestMessage> {
        self.messages.recv().await
    }

    /// A message that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<GuestMessage> {
        self.messages.try_recv().ok()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Detach the listener and destroy the context. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.messages.close();
        self.control.destroy();
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}
