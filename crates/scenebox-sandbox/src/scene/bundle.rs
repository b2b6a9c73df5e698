//! Binary glTF 2.0 (GLB) encoder.
//!
//! Layout: 12-byte header, a JSON chunk padded with spaces, then a BIN chunk
//! padded with zeros. Every chunk length is a multiple of four.

use std::collections::HashMap;

use serde_json::{json, Value};
use thiserror::Error;

use super::graph::{Geometry, Material};
use super::tree::{SceneTree, TreeKind, TreeNode};

const GLB_MAGIC: u32 = 0x4654_6C67;
const GLB_VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

const COMPONENT_FLOAT: u32 = 5126;
const COMPONENT_UNSIGNED_INT: u32 = 5125;
const TARGET_ARRAY_BUFFER: u32 = 34962;
const TARGET_ELEMENT_ARRAY_BUFFER: u32 = 34963;

#[derive(Debug, Error, PartialEq)]
pub enum BundleError {
    #[error("geometry {0} has no position attribute")]
    MissingPosition(usize),
    #[error("geometry {geometry} attribute `{name}`: {reason}")]
    InvalidAttribute {
        geometry: usize,
        name: String,
        reason: String,
    },
    #[error("geometry {geometry} index {value} out of range for {count} vertices")]
    InvalidIndex {
        geometry: usize,
        value: u32,
        count: usize,
    },
}

/// Known attributes and their glTF semantic and accessor type.
fn semantic(name: &str, item_size: u32) -> Option<(&'static str, &'static str)> {
    match (name, item_size) {
        ("position", 3) => Some(("POSITION", "VEC3")),
        ("normal", 3) => Some(("NORMAL", "VEC3")),
        ("uv", 2) => Some(("TEXCOORD_0", "VEC2")),
        _ => None,
    }
}

#[derive(Default)]
struct Builder {
    bin: Vec<u8>,
    buffer_views: Vec<Value>,
    accessors: Vec<Value>,
}

impl Builder {
    fn push_view(&mut self, bytes: &[u8], target: u32) -> usize {
        while self.bin.len() % 4 != 0 {
            self.bin.push(0);
        }
        self.buffer_views.push(json!({
            "buffer": 0,
            "byteOffset": self.bin.len(),
            "byteLength": bytes.len(),
            "target": target,
        }));
        self.bin.extend_from_slice(bytes);
        self.buffer_views.len() - 1
    }

    fn push_accessor(&mut self, accessor: Value) -> usize {
        self.accessors.push(accessor);
        self.accessors.len() - 1
    }

    fn float_accessor(&mut self, values: &[f32], kind: &str, count: usize, bounds: bool) -> usize {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let view = self.push_view(&bytes, TARGET_ARRAY_BUFFER);
        let mut accessor = json!({
            "bufferView": view,
            "componentType": COMPONENT_FLOAT,
            "count": count,
            "type": kind,
        });
        if bounds && count > 0 {
            let mut min = [f32::MAX; 3];
            let mut max = [f32::MIN; 3];
            for p in values.chunks_exact(3) {
                for axis in 0..3 {
                    min[axis] = min[axis].min(p[axis]);
                    max[axis] = max[axis].max(p[axis]);
                }
            }
            accessor["min"] = json!(min);
            accessor["max"] = json!(max);
        }
        self.push_accessor(accessor)
    }

    fn index_accessor(&mut self, index: &[u32]) -> usize {
        let bytes: Vec<u8> = index.iter().flat_map(|v| v.to_le_bytes()).collect();
        let view = self.push_view(&bytes, TARGET_ELEMENT_ARRAY_BUFFER);
        self.push_accessor(json!({
            "bufferView": view,
            "componentType": COMPONENT_UNSIGNED_INT,
            "count": index.len(),
            "type": "SCALAR",
        }))
    }
}

fn primitive(builder: &mut Builder, slot: usize, geometry: &Geometry) -> Result<Value, BundleError> {
    let position = geometry.position().ok_or(BundleError::MissingPosition(slot))?;
    let vertex_count = position.count();

    let mut attributes = serde_json::Map::new();
    for (name, attr) in &geometry.attributes {
        let Some((semantic, kind)) = semantic(name, attr.item_size) else {
            continue;
        };
        if attr.count() != vertex_count {
            return Err(BundleError::InvalidAttribute {
                geometry: slot,
                name: name.clone(),
                reason: format!("{} items, expected {}", attr.count(), vertex_count),
            });
        }
        if attr.array.iter().any(|v| !v.is_finite()) {
            return Err(BundleError::InvalidAttribute {
                geometry: slot,
                name: name.clone(),
                reason: "non-finite value".into(),
            });
        }
        let accessor = builder.float_accessor(&attr.array, kind, vertex_count, semantic == "POSITION");
        attributes.insert(semantic.to_string(), json!(accessor));
    }

    let mut primitive = json!({ "attributes": attributes, "mode": 4 });
    if let Some(index) = &geometry.index {
        if let Some(bad) = index.iter().find(|i| **i as usize >= vertex_count) {
            return Err(BundleError::InvalidIndex {
                geometry: slot,
                value: *bad,
                count: vertex_count,
            });
        }
        primitive["indices"] = json!(builder.index_accessor(index));
    }
    Ok(primitive)
}

fn rgb(color: u32) -> [f32; 3] {
    [
        ((color >> 16) & 0xff) as f32 / 255.0,
        ((color >> 8) & 0xff) as f32 / 255.0,
        (color & 0xff) as f32 / 255.0,
    ]
}

fn material_json(material: &Material) -> Value {
    let [r, g, b] = rgb(material.color);
    let mut out = json!({
        "pbrMetallicRoughness": {
            "baseColorFactor": [r, g, b, material.opacity],
            "metallicFactor": material.metalness,
            "roughnessFactor": material.roughness,
        },
        "emissiveFactor": rgb(material.emissive),
        "doubleSided": false,
    });
    if material.transparent || material.opacity < 1.0 {
        out["alphaMode"] = json!("BLEND");
    }
    out
}

struct Encoder<'a> {
    tree: &'a SceneTree,
    builder: Builder,
    meshes: Vec<Value>,
    mesh_slots: HashMap<(usize, usize), usize>,
    primitives: HashMap<usize, Value>,
    nodes: Vec<Value>,
    cameras: Vec<Value>,
}

impl<'a> Encoder<'a> {
    fn mesh(&mut self, geometry: usize, material: usize) -> Result<usize, BundleError> {
        if let Some(slot) = self.mesh_slots.get(&(geometry, material)) {
            return Ok(*slot);
        }
        let tree = self.tree;
        let source = tree
            .geometries
            .get(geometry)
            .ok_or(BundleError::MissingPosition(geometry))?;
        let mut prim = match self.primitives.get(&geometry) {
            Some(p) => p.clone(),
            None => {
                let p = primitive(&mut self.builder, geometry, source)?;
                self.primitives.insert(geometry, p.clone());
                p
            }
        };
        if material < tree.materials.len() {
            prim["material"] = json!(material);
        }
        self.meshes.push(json!({ "primitives": [prim] }));
        let slot = self.meshes.len() - 1;
        self.mesh_slots.insert((geometry, material), slot);
        Ok(slot)
    }

    fn node(&mut self, node: &TreeNode) -> Result<usize, BundleError> {
        let children = node
            .children
            .iter()
            .map(|child| self.node(child))
            .collect::<Result<Vec<_>, _>>()?;

        let t = &node.transform;
        let mut out = json!({
            "translation": t.position,
            "rotation": t.quaternion(),
            "scale": t.scale,
        });
        if !node.name.is_empty() {
            out["name"] = json!(node.name);
        }
        if !children.is_empty() {
            out["children"] = json!(children);
        }
        match &node.kind {
            TreeKind::Mesh { geometry, material } => {
                out["mesh"] = json!(self.mesh(*geometry, *material)?);
            }
            TreeKind::Camera(camera) => {
                self.cameras.push(json!({
                    "type": "perspective",
                    "perspective": {
                        "yfov": camera.fov.to_radians(),
                        "aspectRatio": camera.aspect,
                        "znear": camera.near,
                        "zfar": camera.far,
                    }
                }));
                out["camera"] = json!(self.cameras.len() - 1);
            }
            _ => {}
        }
        self.nodes.push(out);
        Ok(self.nodes.len() - 1)
    }
}

/// Encode `tree` as a GLB container.
pub fn encode_glb(tree: &SceneTree) -> Result<Vec<u8>, BundleError> {
    let mut encoder = Encoder {
        tree,
        builder: Builder::default(),
        meshes: Vec::new(),
        mesh_slots: HashMap::new(),
        primitives: HashMap::new(),
        nodes: Vec::new(),
        cameras: Vec::new(),
    };
    let roots = tree
        .root
        .children
        .iter()
        .map(|child| encoder.node(child))
        .collect::<Result<Vec<_>, _>>()?;

    let mut doc = json!({
        "asset": { "version": "2.0", "generator": super::snapshot::GENERATOR },
        "scene": 0,
        "scenes": [{ "name": tree.root.name, "nodes": roots }],
        "nodes": encoder.nodes,
    });
    if !encoder.meshes.is_empty() {
        doc["meshes"] = json!(encoder.meshes);
        doc["materials"] = tree.materials.iter().map(material_json).collect();
    }
    if !encoder.cameras.is_empty() {
        doc["cameras"] = json!(encoder.cameras);
    }
    let mut bin = encoder.builder.bin;
    if !bin.is_empty() {
        doc["buffers"] = json!([{ "byteLength": bin.len() }]);
        doc["bufferViews"] = json!(encoder.builder.buffer_views);
        doc["accessors"] = json!(encoder.builder.accessors);
    }

    let mut json_bytes = doc.to_string().into_bytes();
    while json_bytes.len() % 4 != 0 {
        json_bytes.push(b' ');
    }
    while bin.len() % 4 != 0 {
        bin.push(0);
    }

    let bin_chunk = if bin.is_empty() { 0 } else { 8 + bin.len() };
    let total = 12 + 8 + json_bytes.len() + bin_chunk;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    out.extend_from_slice(&GLB_VERSION.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(json_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(&json_bytes);
    if !bin.is_empty() {
        out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
        out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
        out.extend_from_slice(&bin);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::graph::{BufferAttribute, MaterialKind, NodeKind, SceneStore};

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    fn json_chunk(glb: &[u8]) -> Value {
        let len = u32_at(glb, 12) as usize;
        serde_json::from_slice(&glb[20..20 + len]).unwrap()
    }

    fn two_boxes() -> SceneTree {
        let mut store = SceneStore::new();
        let scene = store.create_node(NodeKind::Scene).unwrap();
        let geometry = store.add_geometry(Geometry::cuboid(1.0, 1.0, 1.0));
        let material = store.add_material(Material::new(MaterialKind::Standard));
        for _ in 0..2 {
            let mesh = store
                .create_node(NodeKind::Mesh { geometry, material })
                .unwrap();
            store.add_child(scene, mesh).unwrap();
        }
        SceneTree::extract(&store, scene).unwrap()
    }

    #[test]
    fn header_and_chunks_are_well_formed() {
        let glb = encode_glb(&two_boxes()).unwrap();
        assert_eq!(&glb[0..4], b"glTF");
        assert_eq!(u32_at(&glb, 4), 2);
        assert_eq!(u32_at(&glb, 8) as usize, glb.len());
        assert_eq!(u32_at(&glb, 16), CHUNK_JSON);
        let json_len = u32_at(&glb, 12) as usize;
        assert_eq!(json_len % 4, 0);
        let bin_header = 20 + json_len;
        assert_eq!(u32_at(&glb, bin_header + 4), CHUNK_BIN);
        assert_eq!(u32_at(&glb, bin_header) % 4, 0);
    }

    #[test]
    fn shared_geometry_is_written_once() {
        let doc = json_chunk(&encode_glb(&two_boxes()).unwrap());
        assert_eq!(doc["nodes"].as_array().unwrap().len(), 2);
        assert_eq!(doc["meshes"].as_array().unwrap().len(), 1);
        // position, normal, uv, index
        assert_eq!(doc["accessors"].as_array().unwrap().len(), 4);
        let position = &doc["accessors"][doc["meshes"][0]["primitives"][0]["attributes"]["POSITION"]
            .as_u64()
            .unwrap() as usize];
        assert_eq!(position["max"], json!([0.5, 0.5, 0.5]));
    }

    #[test]
    fn empty_scene_has_no_buffers() {
        let glb = encode_glb(&SceneTree::empty()).unwrap();
        let doc = json_chunk(&glb);
        assert!(doc.get("buffers").is_none());
        assert_eq!(u32_at(&glb, 8) as usize, glb.len());
        assert_eq!(glb.len(), 20 + u32_at(&glb, 12) as usize);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut tree = two_boxes();
        tree.geometries[0].index = Some(vec![0, 1, 99]);
        assert!(matches!(
            encode_glb(&tree),
            Err(BundleError::InvalidIndex { value: 99, .. })
        ));
    }

    #[test]
    fn mismatched_attribute_count_is_rejected() {
        let mut tree = two_boxes();
        tree.geometries[0]
            .attributes
            .insert("normal".into(), BufferAttribute::new(3, false, vec![0.0; 3]).unwrap());
        assert!(matches!(
            encode_glb(&tree),
            Err(BundleError::InvalidAttribute { .. })
        ));
    }
}
