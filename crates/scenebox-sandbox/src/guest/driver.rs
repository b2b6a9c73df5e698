//! The guest's cooperative loop.
//!
//! [`drive`] polls the guest program alongside the four completion sources
//! until the completion latch is settled or the host cancels the run.

use std::future::Future;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};

use super::diagnostics::GuestFault;
use super::runtime::SharedGuest;
use super::state::Trigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// The guest produced a result or failed.
    Settled,
    /// The host went away first.
    Cancelled,
}

/// Run `program` until the guest settles.
///
/// Branch order is fixed: cancellation, watchdog, queued triggers, program
/// progress, idle ticks. When several are ready in the same turn the earliest
/// one to reach the latch wins.
pub async fn drive<F>(
    guest: &SharedGuest,
    mut triggers: mpsc::UnboundedReceiver<Trigger>,
    program: F,
    mut cancel: oneshot::Receiver<()>,
) -> DriveOutcome
where
    F: Future<Output = Result<(), GuestFault>>,
{
    let (deadline, idle_period) = {
        let g = guest.borrow();
        (g.deadline(), g.policy().idle_export())
    };
    let watchdog = time::sleep_until(deadline);
    let mut idle = time::interval_at(Instant::now() + idle_period, idle_period);
    idle.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(watchdog, program);
    let mut program_done = false;

    loop {
        if guest.borrow().is_settled() {
            return DriveOutcome::Settled;
        }
        tokio::select! {
            biased;
            _ = &mut cancel => {
                tracing::debug!("guest run cancelled by host");
                return DriveOutcome::Cancelled;
            }
            _ = &mut watchdog => {
                guest.borrow_mut().on_watchdog();
            }
            Some(trigger) = triggers.recv() => match trigger {
                Trigger::FirstRender => {
                    guest.borrow_mut().flush_first_render();
                }
            },
            result = &mut program, if !program_done => {
                program_done = true;
                match result {
                    Ok(()) => tracing::debug!("guest program finished; waiting for completion"),
                    Err(fault) => guest.borrow_mut().on_fault(fault),
                }
            }
            now = idle.tick() => {
                guest.borrow_mut().on_idle_tick(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::*;
    use crate::document::{DocumentMetadata, GuestConfig};
    use crate::error::ErrorCode;
    use crate::guest::runtime::{guarded_fetch, GuestRuntime};
    use crate::policy::normalize;
    use crate::protocol::{ExportReason, GuestMessage, NetworkChannel};
    use crate::scene::graph::NodeKind;
    use crate::transport::{NetworkRequest, OfflineTransport};

    struct Harness {
        guest: SharedGuest,
        triggers: mpsc::UnboundedReceiver<Trigger>,
        messages: mpsc::UnboundedReceiver<GuestMessage>,
        cancel_tx: oneshot::Sender<()>,
        cancel_rx: oneshot::Receiver<()>,
    }

    fn harness(policy: serde_json::Value) -> Harness {
        let (tx, messages) = mpsc::unbounded_channel();
        let config = GuestConfig {
            policy: normalize(&policy),
            metadata: DocumentMetadata {
                file_name: "t.html".into(),
                origin: None,
            },
        };
        let (guest, triggers) = GuestRuntime::new(config, tx);
        let guest = guest.into_shared();
        guest.borrow_mut().boot(true);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        Harness {
            guest,
            triggers,
            messages,
            cancel_tx,
            cancel_rx,
        }
    }

    fn collect(rx: &mut mpsc::UnboundedReceiver<GuestMessage>) -> Vec<GuestMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            if !matches!(m, GuestMessage::Log(_)) {
                out.push(m);
            }
        }
        out
    }

    fn result_reason(messages: &[GuestMessage]) -> Option<ExportReason> {
        let mut results = messages.iter().filter_map(|m| match m {
            GuestMessage::Result { summary, .. } => Some(summary.reason),
            _ => None,
        });
        let first = results.next();
        assert!(results.next().is_none(), "more than one result");
        first
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_settles_a_guest_that_never_renders() {
        let mut h = harness(json!({ "maxExecutionMs": 3000 }));
        let started = Instant::now();
        let outcome = drive(
            &h.guest,
            h.triggers,
            std::future::pending::<Result<(), GuestFault>>(),
            h.cancel_rx,
        )
        .await;
        assert_eq!(outcome, DriveOutcome::Settled);
        assert!(started.elapsed() >= Duration::from_millis(3000));
        assert!(started.elapsed() < Duration::from_millis(3100));
        assert_eq!(result_reason(&collect(&mut h.messages)), Some(ExportReason::Timeout));
        drop(h.cancel_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn first_render_of_a_tracked_scene_exports() {
        let mut h = harness(json!({ "idleExportMs": 1000 }));
        let guest = h.guest.clone();
        let program = async move {
            let scene = guest.borrow_mut().create_node(NodeKind::Scene).unwrap();
            let surface = guest.borrow_mut().create_surface(64, 64);
            time::sleep(Duration::from_millis(100)).await;
            guest.borrow_mut().render(surface, scene, None);
            std::future::pending::<()>().await;
            Ok(())
        };
        let started = Instant::now();
        drive(&h.guest, h.triggers, program, h.cancel_rx).await;
        assert!(started.elapsed() < Duration::from_millis(1000));
        let messages = collect(&mut h.messages);
        assert_eq!(result_reason(&messages), Some(ExportReason::FirstRender));
        assert!(messages.iter().any(|m| m.kind() == "thumbnail"));
        drop(h.cancel_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_export_follows_the_last_render() {
        let mut h = harness(json!({ "idleExportMs": 500, "maxExecutionMs": 10000 }));
        let guest = h.guest.clone();
        let program = async move {
            let scene = guest.borrow_mut().create_node(NodeKind::Scene).unwrap();
            // Rendering an untracked group arms idle export without the
            // first-render trigger.
            let group = guest.borrow_mut().create_node(NodeKind::Group).unwrap();
            guest.borrow_mut().mutate(|s| s.add_child(scene, group)).unwrap();
            let surface = guest.borrow_mut().create_surface(64, 64);
            for _ in 0..3 {
                guest.borrow_mut().render(surface, group, None);
                time::sleep(Duration::from_millis(200)).await;
            }
            Ok(())
        };
        let started = Instant::now();
        drive(&h.guest, h.triggers, program, h.cancel_rx).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1500), "{elapsed:?}");
        assert_eq!(result_reason(&collect(&mut h.messages)), Some(ExportReason::Idle));
        drop(h.cancel_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_request_never_produces_a_result() {
        let mut h = harness(json!({ "allowedEndpoints": ["self"], "maxNetworkRequests": 1 }));
        let guest = h.guest.clone();
        let program = async move {
            guest.borrow_mut().create_node(NodeKind::Scene).unwrap();
            let request = NetworkRequest::get("https://tracker.test/p", NetworkChannel::Beacon);
            let _ = guarded_fetch(&guest, &OfflineTransport, request).await;
            Ok(())
        };
        drive(&h.guest, h.triggers, program, h.cancel_rx).await;
        let messages = collect(&mut h.messages);
        assert!(result_reason(&messages).is_none());
        assert!(matches!(
            messages.last(),
            Some(GuestMessage::PolicyViolation { code: ErrorCode::NetworkBlocked, .. })
        ));
        drop(h.cancel_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn request_past_the_quota_hits_the_limit() {
        let mut h = harness(json!({
            "allowedEndpoints": ["data:", "https://cdn.test"],
            "maxNetworkRequests": 1
        }));
        let guest = h.guest.clone();
        let program = async move {
            for _ in 0..2 {
                let request = NetworkRequest::get("https://cdn.test/a.bin", NetworkChannel::Fetch);
                let _ = guarded_fetch(&guest, &OfflineTransport, request).await;
            }
            Ok(())
        };
        drive(&h.guest, h.triggers, program, h.cancel_rx).await;
        assert!(matches!(
            collect(&mut h.messages).last(),
            Some(GuestMessage::PolicyViolation { code: ErrorCode::NetworkLimit, .. })
        ));
        drop(h.cancel_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn uncaught_fault_fails_the_run() {
        let mut h = harness(json!({}));
        let program = async { Err(GuestFault::Uncaught("Uncaught Error: boom".into())) };
        drive(&h.guest, h.triggers, program, h.cancel_rx).await;
        assert!(matches!(
            collect(&mut h.messages).last(),
            Some(GuestMessage::Error { code: ErrorCode::RuntimeError, .. })
        ));
        drop(h.cancel_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn termination_is_treated_as_the_watchdog() {
        let mut h = harness(json!({}));
        let program = async { Err(GuestFault::Terminated) };
        drive(&h.guest, h.triggers, program, h.cancel_rx).await;
        assert_eq!(result_reason(&collect(&mut h.messages)), Some(ExportReason::Timeout));
        drop(h.cancel_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn competing_triggers_yield_one_result() {
        let mut h = harness(json!({ "idleExportMs": 250 }));
        let guest = h.guest.clone();
        let program = async move {
            let scene = guest.borrow_mut().create_node(NodeKind::Scene).unwrap();
            let surface = guest.borrow_mut().create_surface(32, 32);
            guest.borrow_mut().render(surface, scene, None);
            guest
                .borrow_mut()
                .export_scene(None, Value::Null, ExportReason::Manual);
            guest.borrow_mut().on_watchdog();
            Ok(())
        };
        drive(&h.guest, h.triggers, program, h.cancel_rx).await;
        assert_eq!(result_reason(&collect(&mut h.messages)), Some(ExportReason::Manual));
        drop(h.cancel_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn host_cancellation_stops_the_loop() {
        let h = harness(json!({}));
        h.cancel_tx.send(()).unwrap();
        let outcome = drive(
            &h.guest,
            h.triggers,
            std::future::pending::<Result<(), GuestFault>>(),
            h.cancel_rx,
        )
        .await;
        assert_eq!(outcome, DriveOutcome::Cancelled);
        assert!(!h.guest.borrow().is_settled());
    }
}
