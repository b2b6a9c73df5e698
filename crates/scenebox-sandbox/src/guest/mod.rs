//! Everything that runs on the guest side of the message channel.

pub mod diagnostics;
pub mod driver;
pub mod net;
pub mod runtime;
pub mod state;

pub use diagnostics::{classify_fault, is_resource_load_failure, GuestFault};
pub use driver::{drive, DriveOutcome};
pub use net::{NetworkGuard, Violation};
pub use runtime::{guarded_fetch, FetchError, GuestRuntime, MessageSink, SharedGuest};
pub use state::{CompletionLatch, Phase, Trigger};
