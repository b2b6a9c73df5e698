//! JSON scene snapshot in the Object JSON layout (format 4.6).
//!
//! Geometries, materials and textures are emitted once in top-level tables
//! and referenced from the object tree by UUID.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::graph::{
    BufferAttribute, Camera, Geometry, Light, LightKind, Mat4, Material, MaterialKind, Transform,
    MAX_SCENE_DEPTH,
};
use super::tree::{SceneTree, TreeKind, TreeNode};

pub const FORMAT_VERSION: f64 = 4.6;
pub const GENERATOR: &str = "scenebox";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is missing `{0}`")]
    Missing(&'static str),
    #[error("unsupported object type `{0}`")]
    UnsupportedType(String),
    #[error("dangling reference to {kind} {uuid}")]
    DanglingReference { kind: &'static str, uuid: String },
    #[error("invalid {0}")]
    Invalid(String),
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
    #[error("object tree is deeper than {MAX_SCENE_DEPTH} levels")]
    TooDeep,
}

fn uuid() -> String {
    Uuid::new_v4().to_string().to_uppercase()
}

fn finite(values: &[f32], what: &'static str) -> Result<(), SnapshotError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(SnapshotError::NonFinite(what))
    }
}

/// Serialize `tree` with `user_data` attached to the root object.
pub fn to_json(tree: &SceneTree, user_data: &Value) -> Result<Value, SnapshotError> {
    let geometry_ids: Vec<String> = tree.geometries.iter().map(|_| uuid()).collect();
    let material_ids: Vec<String> = tree.materials.iter().map(|_| uuid()).collect();

    let mut geometries = Vec::with_capacity(tree.geometries.len());
    for (geometry, id) in tree.geometries.iter().zip(&geometry_ids) {
        geometries.push(geometry_json(geometry, id)?);
    }

    let mut textures = Vec::new();
    let mut images = Vec::new();
    let mut texture_ids: HashMap<&str, String> = HashMap::new();
    let mut materials = Vec::with_capacity(tree.materials.len());
    for (material, id) in tree.materials.iter().zip(&material_ids) {
        let mut entry = material_json(material, id);
        if let Some(url) = material.map.as_deref() {
            let texture = texture_ids.entry(url).or_insert_with(|| {
                let image = uuid();
                let texture = uuid();
                images.push(json!({ "uuid": image, "url": url }));
                textures.push(json!({ "uuid": texture, "image": image }));
                texture
            });
            entry["map"] = Value::String(texture.clone());
        }
        materials.push(entry);
    }

    let mut object = object_json(&tree.root, 1, &geometry_ids, &material_ids)?;
    if !user_data.is_null() {
        object["userData"] = user_data.clone();
    }

    Ok(json!({
        "metadata": {
            "version": FORMAT_VERSION,
            "type": "Object",
            "generator": GENERATOR,
        },
        "geometries": geometries,
        "materials": materials,
        "textures": textures,
        "images": images,
        "object": object,
    }))
}

fn geometry_json(geometry: &Geometry, id: &str) -> Result<Value, SnapshotError> {
    let mut attributes = Map::new();
    for (name, attr) in &geometry.attributes {
        finite(&attr.array, "geometry attribute")?;
        attributes.insert(
            name.clone(),
            json!({
                "itemSize": attr.item_size,
                "type": "Float32Array",
                "array": attr.array,
                "normalized": attr.normalized,
            }),
        );
    }
    let mut data = json!({ "attributes": attributes });
    if let Some(index) = &geometry.index {
        data["index"] = json!({ "type": "Uint32Array", "array": index });
    }
    Ok(json!({ "uuid": id, "type": "BufferGeometry", "data": data }))
}

fn material_json(material: &Material, id: &str) -> Value {
    json!({
        "uuid": id,
        "type": material.kind.type_name(),
        "color": material.color,
        "opacity": material.opacity,
        "transparent": material.transparent,
        "roughness": material.roughness,
        "metalness": material.metalness,
        "emissive": material.emissive,
        "wireframe": material.wireframe,
    })
}

fn object_json(
    node: &TreeNode,
    level: usize,
    geometry_ids: &[String],
    material_ids: &[String],
) -> Result<Value, SnapshotError> {
    if level > MAX_SCENE_DEPTH {
        return Err(SnapshotError::TooDeep);
    }
    let matrix = node.transform.matrix();
    finite(&matrix, "object matrix")?;

    let mut object = json!({
        "uuid": uuid(),
        "type": node.kind.type_name(),
        "name": node.name,
        "matrix": matrix,
        "visible": node.visible,
    });

    match &node.kind {
        TreeKind::Mesh { geometry, material } => {
            let g = geometry_ids.get(*geometry).ok_or(SnapshotError::DanglingReference {
                kind: "geometry",
                uuid: geometry.to_string(),
            })?;
            let m = material_ids.get(*material).ok_or(SnapshotError::DanglingReference {
                kind: "material",
                uuid: material.to_string(),
            })?;
            object["geometry"] = json!(g);
            object["material"] = json!(m);
        }
        TreeKind::Camera(camera) => {
            object["fov"] = json!(camera.fov);
            object["aspect"] = json!(camera.aspect);
            object["near"] = json!(camera.near);
            object["far"] = json!(camera.far);
        }
        TreeKind::Light(light) => {
            object["color"] = json!(light.color);
            object["intensity"] = json!(light.intensity);
        }
        TreeKind::Scene | TreeKind::Group | TreeKind::Object => {}
    }

    if !node.children.is_empty() {
        let children = node
            .children
            .iter()
            .map(|child| object_json(child, level + 1, geometry_ids, material_ids))
            .collect::<Result<Vec<_>, _>>()?;
        object["children"] = Value::Array(children);
    }
    Ok(object)
}

/// Parse a snapshot back into a tree. User data on the root is discarded.
pub fn from_json(value: &Value) -> Result<SceneTree, SnapshotError> {
    let object = value.get("object").ok_or(SnapshotError::Missing("object"))?;

    let mut tree = SceneTree::empty();
    let mut geometry_slots = HashMap::new();
    for entry in array(value, "geometries") {
        let id = str_field(entry, "uuid")?;
        tree.geometries.push(parse_geometry(entry)?);
        geometry_slots.insert(id.to_string(), tree.geometries.len() - 1);
    }

    let images: HashMap<&str, &str> = array(value, "images")
        .filter_map(|i| Some((i.get("uuid")?.as_str()?, i.get("url")?.as_str()?)))
        .collect();
    let texture_urls: HashMap<&str, &str> = array(value, "textures")
        .filter_map(|t| {
            let image = t.get("image")?.as_str()?;
            Some((t.get("uuid")?.as_str()?, *images.get(image)?))
        })
        .collect();

    let mut material_slots = HashMap::new();
    for entry in array(value, "materials") {
        let id = str_field(entry, "uuid")?;
        let mut material = parse_material(entry)?;
        material.map = entry
            .get("map")
            .and_then(Value::as_str)
            .and_then(|t| texture_urls.get(t))
            .map(|url| url.to_string());
        tree.materials.push(material);
        material_slots.insert(id.to_string(), tree.materials.len() - 1);
    }

    tree.root = parse_object(object, 1, &geometry_slots, &material_slots)?;
    Ok(tree)
}

fn array<'a>(value: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn str_field<'a>(value: &'a Value, key: &'static str) -> Result<&'a str, SnapshotError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or(SnapshotError::Missing(key))
}

fn f32_field(value: &Value, key: &str, default: f32) -> f32 {
    value
        .get(key)
        .and_then(Value::as_f64)
        .map(|v| v as f32)
        .unwrap_or(default)
}

fn u32_field(value: &Value, key: &str, default: u32) -> u32 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| (v & 0xff_ffff) as u32)
        .unwrap_or(default)
}

fn f32_array(value: &Value) -> Result<Vec<f32>, SnapshotError> {
    value
        .as_array()
        .ok_or_else(|| SnapshotError::Invalid("numeric array".into()))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|v| v as f32)
                .ok_or_else(|| SnapshotError::Invalid(format!("number {v}")))
        })
        .collect()
}

fn parse_geometry(entry: &Value) -> Result<Geometry, SnapshotError> {
    let data = entry.get("data").ok_or(SnapshotError::Missing("data"))?;
    let mut geometry = Geometry::default();
    if let Some(attributes) = data.get("attributes").and_then(Value::as_object) {
        for (name, attr) in attributes {
            let item_size = attr
                .get("itemSize")
                .and_then(Value::as_u64)
                .ok_or(SnapshotError::Missing("itemSize"))? as u32;
            let array = f32_array(attr.get("array").ok_or(SnapshotError::Missing("array"))?)?;
            let normalized = attr.get("normalized").and_then(Value::as_bool).unwrap_or(false);
            let attr = BufferAttribute::new(item_size, normalized, array)
                .map_err(|e| SnapshotError::Invalid(e.to_string()))?;
            geometry.attributes.insert(name.clone(), attr);
        }
    }
    if let Some(index) = data.get("index").and_then(|i| i.get("array")) {
        let index = index
            .as_array()
            .ok_or_else(|| SnapshotError::Invalid("index array".into()))?
            .iter()
            .map(|v| {
                v.as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| SnapshotError::Invalid(format!("index {v}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        geometry.index = Some(index);
    }
    Ok(geometry)
}

fn parse_material(entry: &Value) -> Result<Material, SnapshotError> {
    let kind = str_field(entry, "type")?;
    let kind = MaterialKind::parse(kind)
        .ok_or_else(|| SnapshotError::UnsupportedType(kind.to_string()))?;
    let defaults = Material::new(kind);
    Ok(Material {
        kind,
        color: u32_field(entry, "color", defaults.color),
        opacity: f32_field(entry, "opacity", defaults.opacity),
        transparent: entry
            .get("transparent")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.transparent),
        roughness: f32_field(entry, "roughness", defaults.roughness),
        metalness: f32_field(entry, "metalness", defaults.metalness),
        emissive: u32_field(entry, "emissive", defaults.emissive),
        wireframe: entry
            .get("wireframe")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.wireframe),
        map: None,
    })
}

fn parse_object(
    object: &Value,
    level: usize,
    geometry_slots: &HashMap<String, usize>,
    material_slots: &HashMap<String, usize>,
) -> Result<TreeNode, SnapshotError> {
    if level > MAX_SCENE_DEPTH {
        return Err(SnapshotError::TooDeep);
    }
    let kind_name = str_field(object, "type")?;
    let kind = match kind_name {
        "Scene" => TreeKind::Scene,
        "Group" => TreeKind::Group,
        "Object3D" => TreeKind::Object,
        "Mesh" => {
            let lookup = |key: &'static str, slots: &HashMap<String, usize>| {
                let id = str_field(object, key)?;
                slots
                    .get(id)
                    .copied()
                    .ok_or_else(|| SnapshotError::DanglingReference {
                        kind: key,
                        uuid: id.to_string(),
                    })
            };
            TreeKind::Mesh {
                geometry: lookup("geometry", geometry_slots)?,
                material: lookup("material", material_slots)?,
            }
        }
        "PerspectiveCamera" => {
            let d = Camera::default();
            TreeKind::Camera(Camera {
                fov: f32_field(object, "fov", d.fov),
                aspect: f32_field(object, "aspect", d.aspect),
                near: f32_field(object, "near", d.near),
                far: f32_field(object, "far", d.far),
            })
        }
        "AmbientLight" | "DirectionalLight" => TreeKind::Light(Light {
            kind: if kind_name == "AmbientLight" {
                LightKind::Ambient
            } else {
                LightKind::Directional
            },
            color: u32_field(object, "color", 0xffffff),
            intensity: f32_field(object, "intensity", 1.0),
        }),
        other => return Err(SnapshotError::UnsupportedType(other.to_string())),
    };

    let transform = match object.get("matrix") {
        Some(m) => {
            let values = f32_array(m)?;
            let matrix: Mat4 = values
                .try_into()
                .map_err(|_| SnapshotError::Invalid("matrix length".into()))?;
            Transform::from_matrix(&matrix)
        }
        None => Transform::default(),
    };

    let children = array(object, "children")
        .map(|child| parse_object(child, level + 1, geometry_slots, material_slots))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TreeNode {
        name: object
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        kind,
        transform,
        visible: object.get("visible").and_then(Value::as_bool).unwrap_or(true),
        children,
    })
}
