//! Guest-owned transient state and the completion latch.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::scene::NodeId;

/// Phase of a guest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Running = 0,
    Settled = 1,
}

/// One-way latch from [`Phase::Running`] to [`Phase::Settled`].
///
/// Every completion trigger and the failure path race through
/// [`try_settle`](Self::try_settle); exactly one caller observes `true`.
#[derive(Debug)]
pub struct CompletionLatch(AtomicU8);

impl Default for CompletionLatch {
    fn default() -> Self {
        Self(AtomicU8::new(Phase::Running as u8))
    }
}

impl CompletionLatch {
    /// Attempt the `Running → Settled` transition.
    pub fn try_settle(&self) -> bool {
        self.0
            .compare_exchange(
                Phase::Running as u8,
                Phase::Settled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn phase(&self) -> Phase {
        if self.0.load(Ordering::Acquire) == Phase::Settled as u8 {
            Phase::Settled
        } else {
            Phase::Running
        }
    }

    pub fn is_settled(&self) -> bool {
        self.phase() == Phase::Settled
    }
}

/// Deferred completion attempts queued for the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// First render of a tracked scene. The isolate usually settles it from a
    /// microtask before the driver sees this.
    FirstRender,
}

#[derive(Debug, Default)]
pub struct GuestState {
    pub latch: CompletionLatch,
    pub last_mutation_at: Option<Instant>,
    /// Set by the first render; idle export never fires before it.
    pub idle_armed: bool,
    pub tracked_scenes: Vec<NodeId>,
    pub request_count: u32,
    pub first_render_reported: bool,
    /// Scene whose first render has not been exported yet.
    pub pending_first_render: Option<NodeId>,
    pub thumbnail_sent: bool,
}

impl GuestState {
    pub fn touch(&mut self, now: Instant) {
        self.last_mutation_at = Some(now);
    }

    pub fn track_scene(&mut self, scene: NodeId) {
        if !self.tracked_scenes.contains(&scene) {
            self.tracked_scenes.push(scene);
        }
    }

    /// Whether nothing has changed for at least `threshold`.
    pub fn is_idle(&self, now: Instant, threshold: Duration) -> bool {
        self.idle_armed
            && self
                .last_mutation_at
                .is_some_and(|at| now.saturating_duration_since(at) >= threshold)
    }
}
