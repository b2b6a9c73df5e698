//! The guest runtime: scene and render hooks, completion decision, export
//! pipeline and the single failure path.
//!
//! One [`GuestRuntime`] lives inside each execution context, shared between
//! the engine ops and the [driver](super::driver) as a [`SharedGuest`]. All
//! methods are synchronous; callers never hold a borrow across an `.await`.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::diagnostics::{self, GuestFault};
use super::net::{NetworkGuard, Violation};
use super::state::{GuestState, Trigger};
use crate::document::GuestConfig;
use crate::error::ErrorCode;
use crate::policy::SandboxPolicy;
use crate::protocol::{ExportReason, ExportSummary, GuestMessage, LogEntry, LogLevel, NetworkChannel};
use crate::scene::graph::NodeKind;
use crate::scene::raster::{rasterize, RenderSurface, SoftwareSurface, SurfaceError, THUMBNAIL_MAX_EDGE};
use crate::scene::{deduplicate, encode_glb, snapshot, GraphError, NodeId, RasterImage, SceneStore, SceneTree};
use crate::transport::{NetworkRequest, NetworkResponse, NetworkTransport, TransportError};

pub type SharedGuest = Rc<RefCell<GuestRuntime>>;

/// Where guest messages go. FIFO.
pub type MessageSink = mpsc::UnboundedSender<GuestMessage>;

/// Why a guarded request did not produce a response.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("blocked by sandbox policy: {0}")]
    Denied(String),
    #[error("the scene has already been exported")]
    Settled,
    #[error("Failed to fetch {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },
}

pub struct GuestRuntime {
    config: GuestConfig,
    guard: NetworkGuard,
    state: GuestState,
    store: SceneStore,
    surfaces: Vec<Box<dyn RenderSurface>>,
    sink: MessageSink,
    triggers: mpsc::UnboundedSender<Trigger>,
    booted_at: Instant,
    booted: bool,
}

impl GuestRuntime {
    pub fn new(config: GuestConfig, sink: MessageSink) -> (Self, mpsc::UnboundedReceiver<Trigger>) {
        let (triggers, rx) = mpsc::unbounded_channel();
        let guard = NetworkGuard::new(&config.policy, config.metadata.origin.as_deref());
        let runtime = Self {
            config,
            guard,
            state: GuestState::default(),
            store: SceneStore::new(),
            surfaces: Vec::new(),
            sink,
            triggers,
            booted_at: Instant::now(),
            booted: false,
        };
        (runtime, rx)
    }

    pub fn into_shared(self) -> SharedGuest {
        Rc::new(RefCell::new(self))
    }

    pub fn config(&self) -> &GuestConfig {
        &self.config
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.config.policy
    }

    pub fn store(&self) -> &SceneStore {
        &self.store
    }

    pub fn request_count(&self) -> u32 {
        self.state.request_count
    }

    pub fn is_booted(&self) -> bool {
        self.booted
    }

    pub fn is_settled(&self) -> bool {
        self.state.latch.is_settled()
    }

    /// Announce the runtime. Without an engine the run fails immediately.
    pub fn boot(&mut self, engine_available: bool) {
        if self.booted {
            return;
        }
        self.booted = true;
        self.booted_at = Instant::now();
        self.send(GuestMessage::Boot {
            file_name: self.config.metadata.file_name.clone(),
        });
        if !engine_available {
            self.fail(
                ErrorCode::EngineMissing,
                "no rendering engine is available to the document",
                Map::new(),
            );
        }
    }

    /// Watchdog deadline, measured from boot.
    pub fn deadline(&self) -> Instant {
        self.booted_at + self.config.policy.max_execution()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.booted_at.elapsed().as_millis() as u64
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        let entry = LogEntry {
            level,
            message: diagnostics::truncate(message),
            elapsed_ms: self.elapsed_ms(),
        };
        self.send(GuestMessage::Log(entry));
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    fn send(&self, message: GuestMessage) {
        if self.sink.send(message).is_err() {
            tracing::debug!("guest message dropped: host listener gone");
        }
    }

    // --- network ---

    /// Run one outbound attempt through the guard. A violation fails the run.
    pub fn admit_request(&mut self, url: &str, channel: NetworkChannel) -> Result<String, FetchError> {
        if self.is_settled() {
            return Err(FetchError::Settled);
        }
        match self.guard.admit(&mut self.state.request_count, url, channel) {
            Ok(resolved) => Ok(resolved),
            Err(violation) => {
                let message = violation.message.clone();
                self.fail_violation(violation);
                Err(FetchError::Denied(message))
            }
        }
    }

    fn fail_violation(&mut self, violation: Violation) {
        let mut detail = Map::new();
        detail.insert("url".into(), violation.url.into());
        detail.insert("channel".into(), violation.channel.as_str().into());
        if violation.code == ErrorCode::NetworkLimit {
            detail.insert("limit".into(), self.guard.max_requests().into());
        }
        self.fail(violation.code, violation.message, detail);
    }

    // --- scene hooks ---

    pub fn create_node(&mut self, kind: NodeKind) -> Result<NodeId, GraphError> {
        let is_scene = matches!(kind, NodeKind::Scene);
        let id = self.store.create_node(kind)?;
        if is_scene {
            self.state.track_scene(id);
        }
        self.touch();
        Ok(id)
    }

    /// Apply a change to the live graph, refreshing the mutation clock on success.
    pub fn mutate<R>(
        &mut self,
        change: impl FnOnce(&mut SceneStore) -> Result<R, GraphError>,
    ) -> Result<R, GraphError> {
        let out = change(&mut self.store)?;
        self.touch();
        Ok(out)
    }

    fn touch(&mut self) {
        self.state.touch(Instant::now());
    }

    // --- render hooks ---

    /// Create a render surface. Returns a 1-based handle.
    pub fn create_surface(&mut self, width: u32, height: u32) -> u32 {
        self.surfaces.push(Box::new(SoftwareSurface::new(width, height)));
        self.surfaces.len() as u32
    }

    fn surface_mut(&mut self, id: u32) -> Option<&mut Box<dyn RenderSurface>> {
        (id as usize)
            .checked_sub(1)
            .and_then(|i| self.surfaces.get_mut(i))
    }

    pub fn resize_surface(&mut self, id: u32, width: u32, height: u32) -> bool {
        let result = match self.surface_mut(id) {
            Some(surface) => surface.set_size(width, height),
            None => return false,
        };
        self.surface_result(result)
    }

    /// Intercepted render call.
    pub fn render(&mut self, surface: u32, scene: NodeId, camera: Option<NodeId>) -> bool {
        if self.is_settled() {
            return false;
        }
        let result = match self.surface_mut(surface) {
            Some(s) => s.render(scene, camera),
            None => return false,
        };
        if !self.surface_result(result) {
            return false;
        }
        self.on_render(scene);
        true
    }

    fn surface_result(&mut self, result: Result<(), SurfaceError>) -> bool {
        match result {
            Ok(()) => true,
            Err(SurfaceError::ContextLost) => {
                self.fail(
                    ErrorCode::SurfaceContextLost,
                    "render surface lost its context",
                    Map::new(),
                );
                false
            }
            Err(SurfaceError::Disposed) => {
                self.warn("render call on a disposed surface ignored");
                false
            }
        }
    }

    /// Refresh the mutation clock, arm idle export and queue the first-render
    /// trigger for tracked scenes.
    pub fn on_render(&mut self, scene: NodeId) {
        self.touch();
        self.state.idle_armed = true;
        if !self.state.first_render_reported && self.state.tracked_scenes.contains(&scene) {
            self.state.first_render_reported = true;
            self.state.pending_first_render = Some(scene);
            if self.triggers.send(Trigger::FirstRender).is_err() {
                tracing::debug!("first-render trigger dropped: driver gone");
            }
        }
    }

    pub fn first_render_pending(&self) -> bool {
        self.state.pending_first_render.is_some()
    }

    /// Export the first rendered scene if that is still outstanding. Whichever
    /// of the guest microtask and the driver trigger gets here first does the
    /// work; the other finds nothing pending.
    pub fn flush_first_render(&mut self) -> bool {
        match self.state.pending_first_render.take() {
            Some(scene) => self.export_scene(Some(scene), Value::Null, ExportReason::FirstRender),
            None => false,
        }
    }

    pub fn lose_context(&mut self, id: u32) {
        if let Some(surface) = self.surface_mut(id) {
            surface.lose_context();
            self.fail(
                ErrorCode::SurfaceContextLost,
                "render surface lost its context",
                Map::new(),
            );
        }
    }

    pub fn dispose_surface(&mut self, id: u32) {
        if let Some(surface) = self.surface_mut(id) {
            surface.dispose();
        }
    }

    fn dispose_surfaces(&mut self) {
        for surface in &mut self.surfaces {
            surface.dispose();
        }
    }

    // --- completion triggers ---

    pub fn on_idle_tick(&mut self, now: Instant) -> bool {
        if self.is_settled() || !self.state.is_idle(now, self.config.policy.idle_export()) {
            return false;
        }
        self.export_scene(None, Value::Null, ExportReason::Idle)
    }

    pub fn on_watchdog(&mut self) -> bool {
        if self.is_settled() {
            return false;
        }
        self.log(
            LogLevel::Warn,
            &format!(
                "watchdog fired after {}ms; exporting current scene",
                self.config.policy.max_execution_ms
            ),
        );
        self.export_scene(None, Value::Null, ExportReason::Timeout)
    }

    pub fn on_fault(&mut self, fault: GuestFault) {
        if self.is_settled() {
            return;
        }
        match fault {
            // Only the watchdog terminates a running isolate.
            GuestFault::Terminated => {
                self.on_watchdog();
            }
            fault => {
                let message = fault.message();
                self.fail(fault.code(), message, fault.detail());
            }
        }
    }

    // --- export pipeline ---

    /// The single export entry point. Returns whether this call settled the run
    /// with a result.
    pub fn export_scene(&mut self, target: Option<NodeId>, meta: Value, reason: ExportReason) -> bool {
        if self.is_settled() {
            return false;
        }
        let started = Instant::now();
        let tree = match self
            .pick_scene(target)
            .and_then(|root| SceneTree::extract(&self.store, root))
        {
            Some(tree) => tree,
            None if reason == ExportReason::Timeout => SceneTree::empty(),
            None => {
                let mut detail = Map::new();
                detail.insert("reason".into(), reason.as_str().into());
                self.fail(ErrorCode::SceneMissing, "no scene available to export", detail);
                return false;
            }
        };
        if !self.state.latch.try_settle() {
            return false;
        }
        self.run_pipeline(tree, meta, reason, started);
        true
    }

    /// Explicit target, else the only tracked scene, else the largest one.
    fn pick_scene(&self, target: Option<NodeId>) -> Option<NodeId> {
        if let Some(target) = target.filter(|t| self.store.node(*t).is_ok()) {
            return Some(target);
        }
        match self.state.tracked_scenes.as_slice() {
            [] => None,
            [only] => Some(*only),
            scenes => scenes
                .iter()
                .map(|id| (*id, self.store.count_nodes(*id)))
                .fold(None, |best: Option<(NodeId, usize)>, (id, n)| match best {
                    Some((_, m)) if m >= n => best,
                    _ => Some((id, n)),
                })
                .map(|(id, _)| id),
        }
    }

    fn run_pipeline(&mut self, mut tree: SceneTree, meta: Value, reason: ExportReason, started: Instant) {
        let stripped = tree.strip_degenerate();
        let dedup = deduplicate(&mut tree);

        let mut user_data = json!({
            "fileName": self.config.metadata.file_name,
            "reason": reason,
        });
        if !meta.is_null() {
            user_data["meta"] = meta;
        }
        let scene_snapshot = match snapshot::to_json(&tree, &user_data) {
            Ok(value) => value,
            Err(e) => {
                self.dispose_surfaces();
                let mut detail = Map::new();
                detail.insert("stage".into(), "snapshot".into());
                self.emit_failure(ErrorCode::ExportFailed, format!("scene serialization failed: {e}"), detail);
                return;
            }
        };

        self.send_surface_thumbnail();
        match encode_glb(&tree) {
            Ok(buffer) => {
                if !self.state.thumbnail_sent {
                    let image = rasterize(&tree, THUMBNAIL_MAX_EDGE, THUMBNAIL_MAX_EDGE / 2);
                    self.send_thumbnail(image);
                }
                self.send(GuestMessage::BinaryAsset {
                    byte_length: buffer.len(),
                    buffer,
                });
            }
            Err(e) => self.warn(&format!("binary bundle export skipped: {e}")),
        }

        let summary = ExportSummary {
            object_count: tree.node_count(),
            duration_ms: started.elapsed().as_millis() as u64,
            reason,
            network_requests: self.state.request_count,
        };
        self.log(
            LogLevel::Info,
            &format!(
                "exported {} objects ({}; stripped {}, deduplicated {})",
                summary.object_count,
                reason.as_str(),
                stripped,
                dedup.removed()
            ),
        );
        self.send(GuestMessage::Result {
            scene_snapshot,
            summary,
        });
    }

    fn send_surface_thumbnail(&mut self) {
        if self.state.thumbnail_sent {
            return;
        }
        let image = self
            .surfaces
            .iter()
            .find_map(|surface| surface.capture(&self.store));
        if let Some(image) = image {
            self.send_thumbnail(image);
        }
    }

    fn send_thumbnail(&mut self, image: RasterImage) {
        if self.state.thumbnail_sent {
            return;
        }
        self.state.thumbnail_sent = true;
        let image = image.downscale(THUMBNAIL_MAX_EDGE);
        self.send(GuestMessage::Thumbnail {
            data: image.pixels,
            width: image.width,
            height: image.height,
        });
    }

    // --- failure path ---

    /// Terminal failure. Idempotent against the completion latch; disposes
    /// guest render surfaces before reporting.
    pub fn fail(&mut self, code: ErrorCode, message: impl Into<String>, detail: Map<String, Value>) -> bool {
        if !self.state.latch.try_settle() {
            return false;
        }
        self.dispose_surfaces();
        self.emit_failure(code, message.into(), detail);
        true
    }

    fn emit_failure(&mut self, code: ErrorCode, message: String, detail: Map<String, Value>) {
        self.log(LogLevel::Error, &format!("{code}: {message}"));
        let message = if code.is_policy_violation() {
            GuestMessage::PolicyViolation {
                code,
                message,
                url: detail.get("url").and_then(Value::as_str).map(str::to_string),
                channel: detail
                    .get("channel")
                    .and_then(Value::as_str)
                    .and_then(NetworkChannel::parse),
            }
        } else {
            GuestMessage::Error {
                code,
                message,
                detail,
            }
        };
        self.send(message);
    }
}

/// Guarded request: admission under the guest borrow, transport outside it.
pub async fn guarded_fetch(
    guest: &SharedGuest,
    transport: &dyn NetworkTransport,
    request: NetworkRequest,
) -> Result<NetworkResponse, FetchError> {
    let url = guest
        .borrow_mut()
        .admit_request(&request.url, request.channel)?;
    let request = NetworkRequest { url, ..request };
    let url = request.url.clone();
    transport
        .fetch(request)
        .await
        .map_err(|source| FetchError::Transport { url, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentMetadata;
    use crate::policy::normalize;
    use crate::scene::graph::{Geometry, Material, MaterialKind};
    use crate::transport::OfflineTransport;

    fn guest_with(policy: Value) -> (GuestRuntime, mpsc::UnboundedReceiver<GuestMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = GuestConfig {
            policy: normalize(&policy),
            metadata: DocumentMetadata {
                file_name: "scene.html".into(),
                origin: Some("https://app.test".into()),
            },
        };
        let (guest, _triggers) = GuestRuntime::new(config, tx);
        (guest, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<GuestMessage>) -> Vec<GuestMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    fn add_box(guest: &mut GuestRuntime, scene: NodeId) -> NodeId {
        let (geometry, material) = guest
            .mutate(|s| {
                Ok((
                    s.add_geometry(Geometry::cuboid(1.0, 1.0, 1.0)),
                    s.add_material(Material::new(MaterialKind::Standard)),
                ))
            })
            .unwrap();
        let mesh = guest.create_node(NodeKind::Mesh { geometry, material }).unwrap();
        guest.mutate(|s| s.add_child(scene, mesh)).unwrap();
        mesh
    }

    #[tokio::test]
    async fn missing_engine_fails_after_boot() {
        let (mut guest, mut rx) = guest_with(json!({}));
        guest.boot(false);
        let messages = drain(&mut rx);
        assert_eq!(messages[0].kind(), "boot");
        assert!(matches!(
            messages.last(),
            Some(GuestMessage::Error { code: ErrorCode::EngineMissing, .. })
        ));
        assert!(guest.is_settled());
    }

    #[tokio::test]
    async fn manual_export_is_at_most_once() {
        let (mut guest, mut rx) = guest_with(json!({}));
        guest.boot(true);
        let scene = guest.create_node(NodeKind::Scene).unwrap();
        add_box(&mut guest, scene);
        add_box(&mut guest, scene);
        assert!(guest.export_scene(None, json!({ "note": 1 }), ExportReason::Manual));
        assert!(!guest.export_scene(None, Value::Null, ExportReason::Manual));
        assert!(!guest.on_watchdog());

        let messages = drain(&mut rx);
        let results: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                GuestMessage::Result { scene_snapshot, summary } => Some((scene_snapshot, summary)),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 1);
        let (snapshot, summary) = results[0];
        assert_eq!(summary.reason, ExportReason::Manual);
        assert_eq!(summary.object_count, 3);
        assert_eq!(snapshot["geometries"].as_array().unwrap().len(), 1);
        assert_eq!(snapshot["materials"].as_array().unwrap().len(), 1);
        assert_eq!(snapshot["object"]["userData"]["meta"]["note"], 1);
    }

    #[tokio::test]
    async fn artifacts_precede_the_result() {
        let (mut guest, mut rx) = guest_with(json!({}));
        guest.boot(true);
        let scene = guest.create_node(NodeKind::Scene).unwrap();
        add_box(&mut guest, scene);
        let surface = guest.create_surface(1024, 512);
        assert!(guest.render(surface, scene, None));
        guest.export_scene(Some(scene), Value::Null, ExportReason::Manual);

        let kinds: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|m| !matches!(m, GuestMessage::Log(_)))
            .map(|m| match m {
                GuestMessage::Thumbnail { width, height, .. } => {
                    assert_eq!((width, height), (512, 256));
                    "thumbnail"
                }
                other => other.kind(),
            })
            .collect();
        assert_eq!(kinds, vec!["boot", "thumbnail", "binary-asset", "result"]);
    }

    #[tokio::test]
    async fn idle_export_without_scene_is_scene_missing() {
        let (mut guest, mut rx) = guest_with(json!({}));
        guest.boot(true);
        assert!(!guest.export_scene(None, Value::Null, ExportReason::Idle));
        assert!(matches!(
            drain(&mut rx).last(),
            Some(GuestMessage::Error { code: ErrorCode::SceneMissing, .. })
        ));
    }

    #[tokio::test]
    async fn timeout_without_scene_exports_empty_scene() {
        let (mut guest, mut rx) = guest_with(json!({}));
        guest.boot(true);
        assert!(guest.on_watchdog());
        let result = drain(&mut rx)
            .into_iter()
            .find_map(|m| match m {
                GuestMessage::Result { summary, .. } => Some(summary),
                _ => None,
            })
            .unwrap();
        assert_eq!(result.reason, ExportReason::Timeout);
        assert_eq!(result.object_count, 1);
    }

    #[tokio::test]
    async fn largest_scene_wins_when_several_are_tracked() {
        let (mut guest, mut rx) = guest_with(json!({}));
        guest.boot(true);
        let small = guest.create_node(NodeKind::Scene).unwrap();
        let large = guest.create_node(NodeKind::Scene).unwrap();
        add_box(&mut guest, small);
        for _ in 0..3 {
            add_box(&mut guest, large);
        }
        guest.export_scene(None, Value::Null, ExportReason::Manual);
        let count = drain(&mut rx)
            .into_iter()
            .find_map(|m| match m {
                GuestMessage::Result { summary, .. } => Some(summary.object_count),
                _ => None,
            })
            .unwrap();
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn blocked_request_is_a_policy_violation() {
        let (guest, mut rx) = guest_with(json!({ "allowedEndpoints": ["self"] }));
        let guest = guest.into_shared();
        guest.borrow_mut().boot(true);
        let err = guarded_fetch(
            &guest,
            &OfflineTransport,
            NetworkRequest::get("https://evil.test/steal", NetworkChannel::Fetch),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::Denied(_)));
        let violation = drain(&mut rx)
            .into_iter()
            .find(|m| m.kind() == "policyViolation")
            .unwrap();
        assert!(matches!(
            violation,
            GuestMessage::PolicyViolation {
                code: ErrorCode::NetworkBlocked,
                channel: Some(NetworkChannel::Fetch),
                ..
            }
        ));
        assert!(!guest.borrow_mut().export_scene(None, Value::Null, ExportReason::Manual));
    }

    #[tokio::test]
    async fn admitted_request_reaches_the_transport() {
        let (guest, _rx) = guest_with(json!({}));
        let guest = guest.into_shared();
        let response = guarded_fetch(
            &guest,
            &OfflineTransport,
            NetworkRequest::get("data:text/plain,hello", NetworkChannel::Fetch),
        )
        .await
        .unwrap();
        assert_eq!(response.body, b"hello");
        assert_eq!(guest.borrow().request_count(), 1);

        let err = guarded_fetch(
            &guest,
            &OfflineTransport,
            NetworkRequest::get("https://app.test/model.bin", NetworkChannel::Fetch),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().starts_with("Failed to fetch"));
        assert!(!guest.borrow().is_settled());
    }

    #[tokio::test]
    async fn first_render_is_flushed_once() {
        let (mut guest, mut rx) = guest_with(json!({}));
        guest.boot(true);
        let scene = guest.create_node(NodeKind::Scene).unwrap();
        let surface = guest.create_surface(64, 64);
        assert!(!guest.first_render_pending());
        assert!(guest.render(surface, scene, None));
        assert!(guest.first_render_pending());

        assert!(guest.flush_first_render());
        assert!(!guest.first_render_pending());
        assert!(!guest.flush_first_render());
        // settled: later renders are ignored
        assert!(!guest.render(surface, scene, None));
        assert!(!guest.first_render_pending());
        assert!(drain(&mut rx).iter().any(|m| matches!(
            m,
            GuestMessage::Result { summary, .. } if summary.reason == ExportReason::FirstRender
        )));
    }

    #[tokio::test]
    async fn context_loss_disposes_surfaces_and_fails() {
        let (mut guest, mut rx) = guest_with(json!({}));
        guest.boot(true);
        let scene = guest.create_node(NodeKind::Scene).unwrap();
        let surface = guest.create_surface(64, 64);
        guest.lose_context(surface);
        assert!(!guest.render(surface, scene, None));
        assert!(matches!(
            drain(&mut rx).last(),
            Some(GuestMessage::Error { code: ErrorCode::SurfaceContextLost, .. })
        ));
    }
}
