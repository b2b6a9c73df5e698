//! deno_core op definitions backing the guest-runtime bootstrap.
//!
//! Ops expect the op state to hold a [`SharedGuest`], an
//! `Arc<dyn NetworkTransport>` and a [`FetchBodies`] table.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use serde_json::{json, Value};

use crate::guest::{classify_fault, guarded_fetch, is_resource_load_failure, FetchError, SharedGuest};
use crate::protocol::{ExportReason, LogLevel, NetworkChannel};
use crate::scene::graph::{
    parse_color, BufferAttribute, Camera, Geometry, GeometryId, GraphError, Light, LightKind,
    Material, MaterialId, MaterialKind, Node, NodeId, NodeKind, SceneStore,
};
use crate::transport::{NetworkRequest, NetworkTransport};

/// Response bodies waiting to be collected by `op_guest_fetch_body`.
#[derive(Default)]
pub struct FetchBodies {
    next_id: u32,
    bodies: HashMap<u32, Vec<u8>>,
}

impl FetchBodies {
    fn stash(&mut self, body: Vec<u8>) -> u32 {
        self.next_id += 1;
        self.bodies.insert(self.next_id, body);
        self.next_id
    }
}

fn guest(state: &OpState) -> SharedGuest {
    state.borrow::<SharedGuest>().clone()
}

fn type_error(e: GraphError) -> JsErrorBox {
    JsErrorBox::type_error(e.to_string())
}

fn parse_params(raw: &str) -> Result<Value, JsErrorBox> {
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(raw).map_err(|e| JsErrorBox::type_error(format!("invalid parameters: {e}")))
}

fn channel(name: &str) -> Result<NetworkChannel, JsErrorBox> {
    NetworkChannel::parse(name)
        .ok_or_else(|| JsErrorBox::type_error(format!("unknown network channel: {name}")))
}

// --- guest lifecycle and diagnostics ---

#[op2(fast)]
pub fn op_guest_boot(state: &mut OpState, engine_available: bool) {
    guest(state).borrow_mut().boot(engine_available);
}

/// Console output. Level is the console method name.
#[op2(fast)]
pub fn op_guest_log(state: &mut OpState, #[string] method: &str, #[string] message: &str) {
    guest(state)
        .borrow()
        .log(LogLevel::from_console(method), message);
}

/// An exception caught by the bootstrap (timer callbacks, event handlers,
/// `reportError`). Broken asset references only warn.
#[op2(fast)]
pub fn op_guest_error(state: &mut OpState, #[string] message: &str) {
    let guest = guest(state);
    if is_resource_load_failure(message) {
        guest.borrow().warn(message);
        return;
    }
    let fault = classify_fault(&format!("Uncaught {message}"));
    guest.borrow_mut().on_fault(fault);
}

#[op2(fast)]
pub fn op_guest_elapsed_ms(state: &mut OpState) -> f64 {
    guest(state).borrow().elapsed_ms() as f64
}

#[op2(fast)]
pub fn op_guest_settled(state: &mut OpState) -> bool {
    guest(state).borrow().is_settled()
}

#[op2(async)]
pub async fn op_guest_sleep(delay_ms: f64) {
    let delay_ms = if delay_ms.is_finite() { delay_ms.max(0.0) } else { 0.0 };
    tokio::time::sleep(std::time::Duration::from_millis(delay_ms as u64)).await;
}

// --- network ---

/// Guarded request. Resolves to `{status, contentType, bodyId}`.
#[op2(async)]
#[string]
pub async fn op_guest_fetch(
    op_state: Rc<RefCell<OpState>>,
    #[string] url: String,
    #[string] channel_name: String,
    #[string] method: String,
    #[string] body: String,
) -> Result<String, JsErrorBox> {
    let channel = channel(&channel_name)?;
    let (guest, transport) = {
        let st = op_state.borrow();
        let t = st.borrow::<Arc<dyn NetworkTransport>>().clone();
        (guest(&st), t)
    };

    let method = if method.is_empty() {
        "GET".to_string()
    } else {
        method.to_ascii_uppercase()
    };
    let request = NetworkRequest {
        url,
        channel,
        method,
        body: (!body.is_empty()).then_some(body),
    };

    let response = guarded_fetch(&guest, transport.as_ref(), request)
        .await
        .map_err(|e| match e {
            FetchError::Transport { .. } => JsErrorBox::type_error(e.to_string()),
            other => JsErrorBox::generic(format!("NetworkError: {other}")),
        })?;

    let body_id = op_state
        .borrow_mut()
        .borrow_mut::<FetchBodies>()
        .stash(response.body);
    Ok(json!({
        "status": response.status,
        "contentType": response.content_type,
        "bodyId": body_id,
    })
    .to_string())
}

#[op2]
#[buffer]
pub fn op_guest_fetch_body(state: &mut OpState, #[smi] body_id: u32) -> Vec<u8> {
    state
        .borrow_mut::<FetchBodies>()
        .bodies
        .remove(&body_id)
        .unwrap_or_default()
}

/// Socket-style primitives only need admission: there is no realtime
/// transport, so an admitted connection fails like an unreachable host.
#[op2(fast)]
pub fn op_guest_connect(state: &mut OpState, #[string] url: &str, #[string] channel_name: &str) -> bool {
    let Ok(channel) = channel(channel_name) else {
        return false;
    };
    guest(state).borrow_mut().admit_request(url, channel).is_ok()
}

// --- export ---

/// Manual export. `scene` is zero when the guest passed no target.
#[op2(fast)]
pub fn op_guest_export(state: &mut OpState, #[smi] scene: u32, #[string] meta: &str) -> bool {
    let target = (scene != 0).then_some(NodeId(scene));
    let meta = serde_json::from_str(meta).unwrap_or(Value::Null);
    guest(state)
        .borrow_mut()
        .export_scene(target, meta, ExportReason::Manual)
}

#[op2(fast)]
pub fn op_guest_first_render_pending(state: &mut OpState) -> bool {
    guest(state).borrow().first_render_pending()
}

/// Settles a pending first render. Queued as a microtask by the renderer.
#[op2(fast)]
pub fn op_guest_first_render(state: &mut OpState) -> bool {
    guest(state).borrow_mut().flush_first_render()
}

// --- scene graph ---

#[op2(fast)]
pub fn op_scene_node_create(
    state: &mut OpState,
    #[string] kind: &str,
    #[string] params: &str,
) -> Result<u32, JsErrorBox> {
    let params = parse_params(params)?;
    let kind = node_kind(kind, &params)?;
    let id = guest(state).borrow_mut().create_node(kind).map_err(type_error)?;
    Ok(id.0)
}

#[op2(fast)]
pub fn op_scene_node_update(
    state: &mut OpState,
    #[smi] id: u32,
    #[string] patch: &str,
) -> Result<(), JsErrorBox> {
    let patch = parse_params(patch)?;
    guest(state)
        .borrow_mut()
        .mutate(|store| apply_node_patch(store, NodeId(id), &patch))
        .map_err(type_error)
}

#[op2(fast)]
pub fn op_scene_node_add(
    state: &mut OpState,
    #[smi] parent: u32,
    #[smi] child: u32,
) -> Result<(), JsErrorBox> {
    guest(state)
        .borrow_mut()
        .mutate(|store| store.add_child(NodeId(parent), NodeId(child)))
        .map_err(type_error)
}

#[op2(fast)]
pub fn op_scene_node_remove(
    state: &mut OpState,
    #[smi] parent: u32,
    #[smi] child: u32,
) -> Result<bool, JsErrorBox> {
    guest(state)
        .borrow_mut()
        .mutate(|store| store.remove_child(NodeId(parent), NodeId(child)))
        .map_err(type_error)
}

#[op2(fast)]
pub fn op_scene_geometry_create(
    state: &mut OpState,
    #[string] kind: &str,
    #[string] params: &str,
) -> Result<u32, JsErrorBox> {
    let params = parse_params(params)?;
    let dim = |key: &str| {
        params
            .get(key)
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite())
            .unwrap_or(1.0) as f32
    };
    let geometry = match kind {
        "box" => Geometry::cuboid(dim("width"), dim("height"), dim("depth")),
        "plane" => Geometry::plane(dim("width"), dim("height")),
        "buffer" => Geometry::default(),
        other => return Err(JsErrorBox::type_error(format!("unknown geometry kind: {other}"))),
    };
    let id = guest(state)
        .borrow_mut()
        .mutate(|store| Ok(store.add_geometry(geometry)))
        .map_err(type_error)?;
    Ok(id.0)
}

#[op2]
pub fn op_scene_geometry_attribute(
    state: &mut OpState,
    #[smi] id: u32,
    #[string] name: String,
    #[smi] item_size: u32,
    normalized: bool,
    #[serde] array: Vec<f32>,
) -> Result<(), JsErrorBox> {
    guest(state)
        .borrow_mut()
        .mutate(|store| {
            let attribute = BufferAttribute::new(item_size, normalized, array)?;
            store
                .geometry_mut(GeometryId(id))?
                .attributes
                .insert(name, attribute);
            Ok(())
        })
        .map_err(type_error)
}

#[op2]
pub fn op_scene_geometry_index(
    state: &mut OpState,
    #[smi] id: u32,
    #[serde] index: Option<Vec<u32>>,
) -> Result<(), JsErrorBox> {
    guest(state)
        .borrow_mut()
        .mutate(|store| {
            store.geometry_mut(GeometryId(id))?.index = index;
            Ok(())
        })
        .map_err(type_error)
}

#[op2(fast)]
pub fn op_scene_material_create(
    state: &mut OpState,
    #[string] kind: &str,
    #[string] params: &str,
) -> Result<u32, JsErrorBox> {
    let kind = MaterialKind::parse(kind)
        .ok_or_else(|| JsErrorBox::type_error(format!("unknown material kind: {kind}")))?;
    let mut material = Material::new(kind);
    material.apply_params(&parse_params(params)?);
    let id = guest(state)
        .borrow_mut()
        .mutate(|store| Ok(store.add_material(material)))
        .map_err(type_error)?;
    Ok(id.0)
}

#[op2(fast)]
pub fn op_scene_material_update(
    state: &mut OpState,
    #[smi] id: u32,
    #[string] params: &str,
) -> Result<(), JsErrorBox> {
    let params = parse_params(params)?;
    guest(state)
        .borrow_mut()
        .mutate(|store| {
            store.material_mut(MaterialId(id))?.apply_params(&params);
            Ok(())
        })
        .map_err(type_error)
}

// --- render surfaces ---

#[op2(fast)]
pub fn op_surface_create(state: &mut OpState, #[smi] width: u32, #[smi] height: u32) -> u32 {
    guest(state).borrow_mut().create_surface(width, height)
}

#[op2(fast)]
pub fn op_surface_resize(
    state: &mut OpState,
    #[smi] id: u32,
    #[smi] width: u32,
    #[smi] height: u32,
) -> bool {
    guest(state).borrow_mut().resize_surface(id, width, height)
}

/// Intercepted render call. `camera` is zero when none was given.
#[op2(fast)]
pub fn op_surface_render(state: &mut OpState, #[smi] id: u32, #[smi] scene: u32, #[smi] camera: u32) -> bool {
    let camera = (camera != 0).then_some(NodeId(camera));
    guest(state).borrow_mut().render(id, NodeId(scene), camera)
}

#[op2(fast)]
pub fn op_surface_lose_context(state: &mut OpState, #[smi] id: u32) {
    guest(state).borrow_mut().lose_context(id);
}

#[op2(fast)]
pub fn op_surface_dispose(state: &mut OpState, #[smi] id: u32) {
    guest(state).borrow_mut().dispose_surface(id);
}

deno_core::extension!(
    scenebox_ext,
    ops = [
        op_guest_boot,
        op_guest_log,
        op_guest_error,
        op_guest_elapsed_ms,
        op_guest_settled,
        op_guest_sleep,
        op_guest_fetch,
        op_guest_fetch_body,
        op_guest_connect,
        op_guest_export,
        op_guest_first_render_pending,
        op_guest_first_render,
        op_scene_node_create,
        op_scene_node_update,
        op_scene_node_add,
        op_scene_node_remove,
        op_scene_geometry_create,
        op_scene_geometry_attribute,
        op_scene_geometry_index,
        op_scene_material_create,
        op_scene_material_update,
        op_surface_create,
        op_surface_resize,
        op_surface_render,
        op_surface_lose_context,
        op_surface_dispose
    ],
);

/// Node kind from the bootstrap's constructor name and parameters.
fn node_kind(kind: &str, params: &Value) -> Result<NodeKind, JsErrorBox> {
    let number = |key: &str| params.get(key).and_then(Value::as_f64).filter(|v| v.is_finite());
    let id = |key: &str| {
        params
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| JsErrorBox::type_error(format!("mesh requires a {key}")))
    };
    let light = |kind: LightKind| {
        Light {
            kind,
            color: params
                .get("color")
                .and_then(parse_color)
                .unwrap_or(0xffffff),
            intensity: number("intensity").unwrap_or(1.0) as f32,
        }
    };
    Ok(match kind {
        "scene" => NodeKind::Scene,
        "group" => NodeKind::Group,
        "object" => NodeKind::Object,
        "mesh" => NodeKind::Mesh {
            geometry: GeometryId(id("geometry")?),
            material: MaterialId(id("material")?),
        },
        "camera" => {
            let defaults = Camera::default();
            NodeKind::Camera(Camera {
                fov: number("fov").map_or(defaults.fov, |v| v as f32),
                aspect: number("aspect").map_or(defaults.aspect, |v| v as f32),
                near: number("near").map_or(defaults.near, |v| v as f32),
                far: number("far").map_or(defaults.far, |v| v as f32),
            })
        }
        "ambient-light" => NodeKind::Light(light(LightKind::Ambient)),
        "directional-light" => NodeKind::Light(light(LightKind::Directional)),
        other => return Err(JsErrorBox::type_error(format!("unknown node kind: {other}"))),
    })
}

/// Apply a partial update sent by the bootstrap's property setters.
///
/// Recognized keys: `name`, `visible`, `position`, `rotation`, `scale`,
/// camera projection fields, light `color`/`intensity` and mesh
/// `geometry`/`material` handles. Unknown keys are ignored.
fn apply_node_patch(store: &mut SceneStore, id: NodeId, patch: &Value) -> Result<(), GraphError> {
    let Some(patch) = patch.as_object() else {
        return Ok(());
    };
    let vec3 = |key: &str| -> Result<Option<[f32; 3]>, GraphError> {
        let Some(value) = patch.get(key) else {
            return Ok(None);
        };
        let parts: Vec<f64> = value
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();
        match parts.as_slice() {
            [x, y, z] if parts.iter().all(|v| v.is_finite()) => {
                Ok(Some([*x as f32, *y as f32, *z as f32]))
            }
            _ => Err(GraphError::InvalidAttribute(format!(
                "{key} must be three finite numbers"
            ))),
        }
    };
    let number = |key: &str| patch.get(key).and_then(Value::as_f64).filter(|v| v.is_finite());

    let geometry = patch.get("geometry").and_then(Value::as_u64).map(|v| GeometryId(v as u32));
    let material = patch.get("material").and_then(Value::as_u64).map(|v| MaterialId(v as u32));
    if let Some(g) = geometry {
        store.geometry(g)?;
    }
    if let Some(m) = material {
        store.material(m)?;
    }

    let (position, rotation, scale) = (vec3("position")?, vec3("rotation")?, vec3("scale")?);
    let node: &mut Node = store.node_mut(id)?;
    if let Some(name) = patch.get("name").and_then(Value::as_str) {
        node.name = name.to_string();
    }
    if let Some(visible) = patch.get("visible").and_then(Value::as_bool) {
        node.visible = visible;
    }
    if let Some(p) = position {
        node.transform.position = p;
    }
    if let Some(r) = rotation {
        node.transform.rotation = r;
    }
    if let Some(s) = scale {
        node.transform.scale = s;
    }
    match &mut node.kind {
        NodeKind::Camera(camera) => {
            if let Some(v) = number("fov") {
                camera.fov = v as f32;
            }
            if let Some(v) = number("aspect") {
                camera.aspect = v as f32;
            }
            if let Some(v) = number("near") {
                camera.near = v as f32;
            }
            if let Some(v) = number("far") {
                camera.far = v as f32;
            }
        }
        NodeKind::Light(light) => {
            if let Some(c) = patch.get("color").and_then(parse_color) {
                light.color = c;
            }
            if let Some(v) = number("intensity") {
                light.intensity = v as f32;
            }
        }
        NodeKind::Mesh {
            geometry: g,
            material: m,
        } => {
            if let Some(new) = geometry {
                *g = new;
            }
            if let Some(new) = material {
                *m = new;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_kinds_from_constructor_names() {
        assert_eq!(node_kind("scene", &Value::Null).unwrap(), NodeKind::Scene);
        let NodeKind::Camera(camera) = node_kind("camera", &json!({ "fov": 75, "aspect": 2 })).unwrap()
        else {
            panic!("expected a camera");
        };
        assert_eq!(camera.fov, 75.0);
        assert_eq!(camera.near, Camera::default().near);
        assert!(node_kind("mesh", &json!({ "geometry": 1 })).is_err());
        assert!(node_kind("teapot", &Value::Null).is_err());
    }

    #[test]
    fn patches_update_transform_and_kind_fields() {
        let mut store = SceneStore::new();
        let light = store
            .create_node(NodeKind::Light(Light {
                kind: LightKind::Directional,
                color: 0xffffff,
                intensity: 1.0,
            }))
            .unwrap();
        apply_node_patch(
            &mut store,
            light,
            &json!({
                "name": "sun",
                "position": [1, 2, 3],
                "color": "#ff8800",
                "intensity": 2.5,
                "unknown": true
            }),
        )
        .unwrap();
        let node = store.node(light).unwrap();
        assert_eq!(node.name, "sun");
        assert_eq!(node.transform.position, [1.0, 2.0, 3.0]);
        assert_eq!(
            node.kind,
            NodeKind::Light(Light {
                kind: LightKind::Directional,
                color: 0xff8800,
                intensity: 2.5,
            })
        );
    }

    #[test]
    fn bad_patches_leave_the_node_alone() {
        let mut store = SceneStore::new();
        let group = store.create_node(NodeKind::Group).unwrap();
        assert!(apply_node_patch(&mut store, group, &json!({ "name": "x", "scale": [1, "a", 2] })).is_err());
        assert_eq!(store.node(group).unwrap().name, "");
        assert!(apply_node_patch(&mut store, group, &json!({ "material": 9 })).is_err());
        assert!(apply_node_patch(&mut store, NodeId(42), &json!({})).is_err());
    }
}
