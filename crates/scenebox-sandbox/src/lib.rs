//! # scenebox-sandbox
//!
//! Runs untrusted 3D scene documents and extracts what they build.
//!
//! A document is ordinary markup whose scripts construct a scene with the
//! `SCENE` engine. The sandbox executes it in a fresh V8 isolate (or a
//! worker process) and returns a scene snapshot, a GLB bundle and a
//! thumbnail.
//!
//! ## Security model
//!
//! - **Normalized policy**: every limit is clamped before the guest sees it
//! - **No ambient network**: every request passes the allow-list and quota,
//!   then goes through a host-supplied [`NetworkTransport`]
//! - **Fresh context per document**: nothing survives between conversions
//! - **Two deadlines**: the guest watchdog exports at `maxExecutionMs`; the
//!   host gives up independently at `min(10000, maxExecutionMs + 2000)`
//! - **Single settlement**: one completion latch, one terminal message
//!
//! ```no_run
//! use scenebox_sandbox::{ConvertOptions, SandboxConfig, SceneSandbox};
//!
//! # async fn demo() -> Result<(), scenebox_sandbox::SandboxError> {
//! let sandbox = SceneSandbox::new(SandboxConfig::default());
//! let html = "<script>SCENE.exportScene(new SCENE.Scene())</script>";
//! let result = sandbox.convert(html, ConvertOptions::new("scene.html")).await?;
//! println!("{}", result.files[0].contents);
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod context;
pub mod document;
pub mod error;
pub mod guest;
pub mod isolate;
pub mod logs;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod policy;
pub mod protocol;
pub mod scene;
pub mod supervisor;
pub mod transport;

pub use error::{ErrorCategory, ErrorCode, SandboxError};
pub use policy::{normalize, SandboxPolicy};
pub use protocol::{ExportReason, ExportSummary, GuestMessage, LogEntry, LogLevel};
pub use supervisor::{
    ConversionArtifacts, ConversionResult, ConvertOptions, ExecutionMode, GeneratedFile,
    SandboxConfig, SceneSandbox, Thumbnail,
};
pub use transport::{NetworkRequest, NetworkResponse, NetworkTransport, OfflineTransport};
