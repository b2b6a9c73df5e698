//! V8-backed guest execution.
//!
//! Each document gets a brand new isolate with the guest-runtime bootstrap
//! installed before any document script runs. No state leaks between runs.
//!
//! V8 isolates are `!Send`, so [`spawn_isolate`] runs the document on a
//! dedicated thread with its own single-threaded tokio runtime.

pub mod loader;
pub mod ops;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use tokio::sync::oneshot;

use crate::document::BootstrapDocument;
use crate::error::ContextError;
use crate::guest::{
    classify_fault, drive, guarded_fetch, is_resource_load_failure, DriveOutcome, FetchError,
    GuestFault, GuestRuntime, MessageSink, SharedGuest,
};
use crate::protocol::{NetworkChannel, WorkerConfig};
use crate::transport::{NetworkRequest, NetworkTransport};
use loader::{ModuleHandling, Script, ScriptSource};
use ops::{scenebox_ext, FetchBodies};

const GUEST_RUNTIME_JS: &str = include_str!("guest_runtime.js");

/// Where a running isolate publishes its handle so another thread can
/// terminate it.
pub type IsolateSlot = Arc<Mutex<Option<v8::IsolateHandle>>>;

/// Everything one isolate run needs.
pub struct IsolateRun {
    pub document: BootstrapDocument,
    pub config: WorkerConfig,
    pub transport: Arc<dyn NetworkTransport>,
    /// Guest messages, in order.
    pub sink: MessageSink,
    /// Resolving (or dropping the sender) abandons the run.
    pub cancel: oneshot::Receiver<()>,
    pub isolate_slot: Option<IsolateSlot>,
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    /// Shared `&` access from the callback; never needs `&mut`.
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the `HeapLimitState` boxed in `run_document`,
    // which outlives every entry into the isolate it is registered on.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Fresh runtime with the scenebox extension, heap limits and op state.
pub(crate) fn create_runtime(
    guest: &SharedGuest,
    transport: Arc<dyn NetworkTransport>,
    max_heap_size: usize,
) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, max_heap_size);

    let runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![scenebox_ext::init()],
        create_params: Some(create_params),
        ..Default::default()
    });

    {
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(guest.clone());
        state.put::<Arc<dyn NetworkTransport>>(transport);
        state.put(FetchBodies::default());
    }
    runtime
}

/// Run one document to completion on the current thread.
///
/// Must be called from a dedicated thread, not the main tokio runtime.
/// Public for reuse in the worker binary.
pub async fn run_document(run: IsolateRun) -> Result<DriveOutcome, ContextError> {
    let IsolateRun {
        document,
        config,
        transport,
        sink,
        cancel,
        isolate_slot,
    } = run;

    let (guest, triggers) = GuestRuntime::new(document.config.clone(), sink);
    let guest = guest.into_shared();
    let mut runtime = create_runtime(&guest, transport.clone(), config.max_heap_size);

    // --- Heap limit callback ---
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );
    publish_handle(isolate_slot.as_ref(), Some(runtime.v8_isolate().thread_safe_handle()));

    // --- Bootstrap ---
    let config_json = serde_json::to_string(&document.config)
        .map_err(|e| ContextError::Other(anyhow::anyhow!("guest config serialization failed: {e}")))?;
    let bootstrap = format!(
        "{GUEST_RUNTIME_JS}(Deno.core.ops, Deno.core, {config_json}, {});",
        config.provide_engine
    );
    if let Err(e) = runtime.execute_script("[scenebox:guest-runtime]", bootstrap) {
        publish_handle(isolate_slot.as_ref(), None);
        return Err(ContextError::Other(anyhow::anyhow!(
            "guest runtime bootstrap failed: {e}"
        )));
    }

    // --- CPU watchdog ---
    // The driver's own watchdog cannot preempt a guest stuck in a synchronous
    // loop; this thread can.
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timeout = guest.borrow().policy().max_execution();
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_handle.terminate_execution();
        }
    });

    // --- Guest program ---
    let scripts = loader::extract_scripts(&document.html);
    tracing::debug!(
        file = %document.file_name(),
        scripts = scripts.len(),
        "isolate: running document"
    );
    let program = run_program(
        &mut runtime,
        &guest,
        transport.as_ref(),
        scripts,
        &heap_state.triggered,
    );
    let outcome = drive(&guest, triggers, program, cancel).await;

    // --- Cleanup: stop the watchdog before the isolate goes away ---
    let _ = cancel_tx.send(());
    let _ = watchdog.join();
    publish_handle(isolate_slot.as_ref(), None);

    if heap_state.triggered.load(Ordering::SeqCst) {
        tracing::warn!(file = %document.file_name(), "isolate: heap limit reached");
    }
    Ok(outcome)
}

fn publish_handle(slot: Option<&IsolateSlot>, handle: Option<v8::IsolateHandle>) {
    if let Some(slot) = slot {
        match slot.lock() {
            Ok(mut guard) => *guard = handle,
            Err(poisoned) => *poisoned.into_inner() = handle,
        }
    }
}

/// Document scripts in order, then the event loop until it drains.
async fn run_program(
    runtime: &mut JsRuntime,
    guest: &SharedGuest,
    transport: &dyn NetworkTransport,
    scripts: Vec<Script>,
    heap_triggered: &AtomicBool,
) -> Result<(), GuestFault> {
    let fault = |message: &str| {
        if heap_triggered.load(Ordering::SeqCst) {
            GuestFault::HeapLimit
        } else {
            classify_fault(message)
        }
    };
    // Broken asset references are logged, everything else is terminal.
    let recoverable =
        |message: &str| !heap_triggered.load(Ordering::SeqCst) && is_resource_load_failure(message);

    for script in scripts {
        if guest.borrow().is_settled() {
            return Ok(());
        }
        let code = match script.source {
            // Installed before the first document script.
            ScriptSource::GuestRuntime => continue,
            ScriptSource::Inline(code) => code,
            ScriptSource::External(src) => match load_external(guest, transport, &src).await {
                Some(code) => code,
                None => continue,
            },
        };
        let code = if script.module {
            match loader::prepare_module(&code) {
                ModuleHandling::Wrap(wrapped) => wrapped,
                ModuleHandling::Unsupported => {
                    guest
                        .borrow()
                        .warn("module script with static imports skipped; use the SCENE global");
                    continue;
                }
            }
        } else {
            code
        };
        if let Err(e) = runtime.execute_script("[scenebox:document]", code) {
            let message = e.to_string();
            if recoverable(&message) {
                guest.borrow().warn(&message);
                continue;
            }
            return Err(fault(&message));
        }
    }

    if let Err(e) = runtime.execute_script(
        "[scenebox:ready]",
        "globalThis.__scenebox_ready__?.();".to_string(),
    ) {
        return Err(fault(&e.to_string()));
    }

    loop {
        match runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) => {
                let message = e.to_string();
                if recoverable(&message) {
                    guest.borrow().warn(&message);
                    continue;
                }
                return Err(fault(&message));
            }
        }
    }
}

/// Fetch an external script through the network guard. `None` skips it.
async fn load_external(
    guest: &SharedGuest,
    transport: &dyn NetworkTransport,
    src: &str,
) -> Option<String> {
    let request = NetworkRequest::get(src, NetworkChannel::Script);
    match guarded_fetch(guest, transport, request).await {
        Ok(response) if (200..300).contains(&response.status) => {
            Some(String::from_utf8_lossy(&response.body).into_owned())
        }
        Ok(response) => {
            guest.borrow().warn(&format!(
                "Failed to load script {src} (status {})",
                response.status
            ));
            None
        }
        Err(e @ FetchError::Transport { .. }) => {
            guest.borrow().warn(&e.to_string());
            None
        }
        // Denied or already settled: the guest has reported its own failure.
        Err(_) => None,
    }
}

/// Stack for the isolate thread. Export passes recurse once per scene level,
/// up to [`MAX_SCENE_DEPTH`](crate::scene::graph::MAX_SCENE_DEPTH).
pub const ISOLATE_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Run a document on a dedicated thread.
pub fn spawn_isolate(run: IsolateRun) -> Result<JoinHandle<()>, ContextError> {
    std::thread::Builder::new()
        .name("scenebox-isolate".into())
        .stack_size(ISOLATE_STACK_SIZE)
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!(error = %e, "isolate: failed to build runtime");
                    return;
                }
            };
            match rt.block_on(run_document(run)) {
                Ok(outcome) => tracing::debug!(?outcome, "isolate: finished"),
                Err(e) => tracing::warn!(error = %e, "isolate: failed"),
            }
        })
        .map_err(|e| ContextError::Other(anyhow::anyhow!("failed to spawn isolate thread: {e}")))
}
