//! Structural resource deduplication.
//!
//! Each geometry and material maps to a signature struct. Meshes whose
//! resources share a signature are pointed at the first-seen instance and the
//! duplicates are dropped from the tree's tables.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use super::graph::{Geometry, Material, MaterialKind};
use super::tree::{SceneTree, TreeKind};

/// Shape of one named attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeShape {
    pub name: String,
    pub item_size: u32,
    pub count: usize,
    pub normalized: bool,
}

/// Geometry signature: attribute layout, index length and a digest of the
/// vertex data so equal layouts with different contents never merge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GeometrySignature {
    pub attributes: Vec<AttributeShape>,
    pub index_count: Option<usize>,
    pub content: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MaterialSignature {
    pub kind: MaterialKind,
    pub color: u32,
    pub opacity: u32,
    pub transparent: bool,
    pub roughness: u32,
    pub metalness: u32,
    pub emissive: u32,
    pub wireframe: bool,
    pub map: Option<String>,
}

/// Counts before and after deduplication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub geometries_before: usize,
    pub geometries_after: usize,
    pub materials_before: usize,
    pub materials_after: usize,
}

impl DedupReport {
    pub fn removed(&self) -> usize {
        (self.geometries_before - self.geometries_after)
            + (self.materials_before - self.materials_after)
    }
}

// Treat -0.0 and 0.0 as equal.
fn float_key(v: f32) -> u32 {
    if v == 0.0 {
        0
    } else {
        v.to_bits()
    }
}

pub fn geometry_signature(geometry: &Geometry) -> GeometrySignature {
    let mut hasher = Sha256::new();
    let attributes = geometry
        .attributes
        .iter()
        .map(|(name, attr)| {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            for v in &attr.array {
                hasher.update(float_key(*v).to_le_bytes());
            }
            AttributeShape {
                name: name.clone(),
                item_size: attr.item_size,
                count: attr.count(),
                normalized: attr.normalized,
            }
        })
        .collect();
    if let Some(index) = &geometry.index {
        hasher.update(b"index");
        for i in index {
            hasher.update(i.to_le_bytes());
        }
    }
    GeometrySignature {
        attributes,
        index_count: geometry.index.as_ref().map(Vec::len),
        content: hasher.finalize().into(),
    }
}

pub fn material_signature(material: &Material) -> MaterialSignature {
    MaterialSignature {
        kind: material.kind,
        color: material.color,
        opacity: float_key(material.opacity),
        transparent: material.transparent,
        roughness: float_key(material.roughness),
        metalness: float_key(material.metalness),
        emissive: material.emissive,
        wireframe: material.wireframe,
        map: material.map.clone(),
    }
}

/// Collapse structurally identical resources in place.
///
/// Tables are rebuilt in first-reference order and unreferenced entries are
/// dropped.
pub fn deduplicate(tree: &mut SceneTree) -> DedupReport {
    let mut report = DedupReport {
        geometries_before: tree.geometries.len(),
        materials_before: tree.materials.len(),
        ..Default::default()
    };

    let old_geometries = std::mem::take(&mut tree.geometries);
    let old_materials = std::mem::take(&mut tree.materials);
    let geometry_signatures: Vec<_> = old_geometries.iter().map(geometry_signature).collect();
    let material_signatures: Vec<_> = old_materials.iter().map(material_signature).collect();

    let mut geometry_slots: HashMap<&GeometrySignature, usize> = HashMap::new();
    let mut material_slots: HashMap<&MaterialSignature, usize> = HashMap::new();
    let mut geometries = Vec::new();
    let mut materials = Vec::new();

    tree.root.walk_mut(&mut |node| {
        if let TreeKind::Mesh { geometry, material } = &mut node.kind {
            let (old_geometry, old_material) = (*geometry, *material);
            if let Some(signature) = geometry_signatures.get(old_geometry) {
                *geometry = *geometry_slots.entry(signature).or_insert_with(|| {
                    geometries.push(old_geometries[old_geometry].clone());
                    geometries.len() - 1
                });
            }
            if let Some(signature) = material_signatures.get(old_material) {
                *material = *material_slots.entry(signature).or_insert_with(|| {
                    materials.push(old_materials[old_material].clone());
                    materials.len() - 1
                });
            }
        }
    });

    tree.geometries = geometries;
    tree.materials = materials;
    report.geometries_after = tree.geometries.len();
    report.materials_after = tree.materials.len();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::graph::{NodeKind, SceneStore};

    fn scene_with(
        geometries: Vec<Geometry>,
        materials: Vec<Material>,
    ) -> SceneTree {
        let mut store = SceneStore::new();
        let scene = store.create_node(NodeKind::Scene).unwrap();
        let g: Vec<_> = geometries.into_iter().map(|g| store.add_geometry(g)).collect();
        let m: Vec<_> = materials.into_iter().map(|m| store.add_material(m)).collect();
        for (geometry, material) in g.iter().zip(m.iter()) {
            let mesh = store
                .create_node(NodeKind::Mesh {
                    geometry: *geometry,
                    material: *material,
                })
                .unwrap();
            store.add_child(scene, mesh).unwrap();
        }
        SceneTree::extract(&store, scene).unwrap()
    }

    fn red() -> Material {
        let mut m = Material::new(MaterialKind::Standard);
        m.color = 0xff0000;
        m
    }

    #[test]
    fn identical_meshes_share_one_instance() {
        let mut tree = scene_with(
            vec![Geometry::cuboid(1.0, 1.0, 1.0), Geometry::cuboid(1.0, 1.0, 1.0)],
            vec![red(), red()],
        );
        let report = deduplicate(&mut tree);
        assert_eq!(report.geometries_before, 2);
        assert_eq!(report.geometries_after, 1);
        assert_eq!(report.materials_after, 1);
        assert_eq!(report.removed(), 2);
        for child in &tree.root.children {
            assert_eq!(child.kind, TreeKind::Mesh { geometry: 0, material: 0 });
        }
    }

    #[test]
    fn different_structure_is_never_merged() {
        let mut blue = red();
        blue.color = 0x0000ff;
        let mut tree = scene_with(
            vec![Geometry::cuboid(1.0, 1.0, 1.0), Geometry::plane(1.0, 1.0)],
            vec![red(), blue],
        );
        let report = deduplicate(&mut tree);
        assert_eq!(report.geometries_after, 2);
        assert_eq!(report.materials_after, 2);
    }

    #[test]
    fn same_layout_different_data_is_kept_apart() {
        let small = Geometry::cuboid(1.0, 1.0, 1.0);
        let large = Geometry::cuboid(2.0, 2.0, 2.0);
        let a = geometry_signature(&small);
        let b = geometry_signature(&large);
        assert_eq!(a.attributes, b.attributes);
        assert_eq!(a.index_count, b.index_count);
        assert_ne!(a, b);
    }

    #[test]
    fn negative_zero_matches_zero() {
        let mut a = red();
        let mut b = red();
        a.metalness = 0.0;
        b.metalness = -0.0;
        assert_eq!(material_signature(&a), material_signature(&b));
    }

    #[test]
    fn unreferenced_resources_are_dropped() {
        let mut tree = scene_with(vec![Geometry::plane(1.0, 1.0)], vec![red()]);
        tree.geometries.push(Geometry::cuboid(3.0, 3.0, 3.0));
        deduplicate(&mut tree);
        assert_eq!(tree.geometries.len(), 1);
    }
}
