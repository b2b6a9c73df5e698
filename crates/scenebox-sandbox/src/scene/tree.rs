//! Owned copy of a scene subtree, detached from the live store for export.

use std::collections::HashMap;

use super::graph::{
    mat4_mul, Camera, Geometry, GeometryId, Light, Mat4, Material, MaterialId, NodeId, NodeKind,
    SceneStore, Transform, IDENTITY, MAX_SCENE_DEPTH,
};

/// Combined scale below which a node contributes nothing to the output.
pub const NEAR_ZERO_SCALE: f32 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub enum TreeKind {
    Scene,
    Group,
    Object,
    /// Indexes into the tree's own geometry and material tables.
    Mesh { geometry: usize, material: usize },
    Camera(Camera),
    Light(Light),
}

impl TreeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Scene => NodeKind::Scene.type_name(),
            Self::Group => NodeKind::Group.type_name(),
            Self::Object => NodeKind::Object.type_name(),
            Self::Mesh { .. } => "Mesh",
            Self::Camera(c) => NodeKind::Camera(*c).type_name(),
            Self::Light(l) => NodeKind::Light(*l).type_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub name: String,
    pub kind: TreeKind,
    pub transform: Transform,
    pub visible: bool,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn new(kind: TreeKind) -> Self {
        Self {
            name: String::new(),
            kind,
            transform: Transform::default(),
            visible: true,
            children: Vec::new(),
        }
    }

    /// Nodes in this subtree, including `self`.
    pub fn count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(&node.children);
        }
        count
    }

    /// Pre-order walk passing each node's world matrix.
    pub fn walk<'a>(&'a self, parent: &Mat4, visit: &mut impl FnMut(&'a TreeNode, &Mat4)) {
        let mut stack = vec![(self, *parent)];
        while let Some((node, parent)) = stack.pop() {
            let world = mat4_mul(&parent, &node.transform.matrix());
            visit(node, &world);
            stack.extend(node.children.iter().rev().map(|child| (child, world)));
        }
    }

    pub fn walk_mut(&mut self, visit: &mut impl FnMut(&mut TreeNode)) {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            visit(&mut *node);
            stack.extend(node.children.iter_mut().rev());
        }
    }
}

/// A self-contained scene: node tree plus the resources it references.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneTree {
    pub root: TreeNode,
    pub geometries: Vec<Geometry>,
    pub materials: Vec<Material>,
}

impl SceneTree {
    /// An empty scene.
    pub fn empty() -> Self {
        Self {
            root: TreeNode::new(TreeKind::Scene),
            geometries: Vec::new(),
            materials: Vec::new(),
        }
    }

    /// Clone the subtree under `root` out of the live store. Resources shared
    /// by several meshes in the store stay shared in the copy.
    pub fn extract(store: &SceneStore, root: NodeId) -> Option<Self> {
        let mut tree = Self::empty();
        let mut geometry_slots = HashMap::new();
        let mut material_slots = HashMap::new();
        tree.root = copy_node(
            store,
            root,
            1,
            &mut tree,
            &mut geometry_slots,
            &mut material_slots,
        )?;
        Some(tree)
    }

    pub fn node_count(&self) -> usize {
        self.root.count()
    }

    /// Remove invisible subtrees and subtrees whose combined scale collapses
    /// to zero on any axis. Returns the number of nodes removed.
    pub fn strip_degenerate(&mut self) -> usize {
        let before = self.node_count();
        let root_scale = self.root.transform.scale;
        if is_degenerate(root_scale) {
            self.root.children.clear();
        } else {
            retain_renderable(&mut self.root, root_scale);
        }
        before - self.node_count()
    }

    /// World matrix of the first camera in pre-order, if any.
    pub fn first_camera(&self) -> Option<(Camera, Mat4)> {
        let mut found = None;
        self.root.walk(&IDENTITY, &mut |node, world| {
            if let (None, TreeKind::Camera(camera)) = (&found, &node.kind) {
                found = Some((*camera, *world));
            }
        });
        found
    }
}

// Recursion is bounded by MAX_SCENE_DEPTH, which the store enforces on every attach.
fn copy_node(
    store: &SceneStore,
    id: NodeId,
    level: usize,
    tree: &mut SceneTree,
    geometry_slots: &mut HashMap<GeometryId, usize>,
    material_slots: &mut HashMap<MaterialId, usize>,
) -> Option<TreeNode> {
    if level > MAX_SCENE_DEPTH {
        return None;
    }
    let node = store.node(id).ok()?;
    let kind = match &node.kind {
        NodeKind::Scene => TreeKind::Scene,
        NodeKind::Group => TreeKind::Group,
        NodeKind::Object => TreeKind::Object,
        NodeKind::Camera(c) => TreeKind::Camera(*c),
        NodeKind::Light(l) => TreeKind::Light(*l),
        NodeKind::Mesh { geometry, material } => {
            let geometry = match geometry_slots.get(geometry) {
                Some(slot) => *slot,
                None => {
                    tree.geometries.push(store.geometry(*geometry).ok()?.clone());
                    let slot = tree.geometries.len() - 1;
                    geometry_slots.insert(*geometry, slot);
                    slot
                }
            };
            let material = match material_slots.get(material) {
                Some(slot) => *slot,
                None => {
                    tree.materials.push(store.material(*material).ok()?.clone());
                    let slot = tree.materials.len() - 1;
                    material_slots.insert(*material, slot);
                    slot
                }
            };
            TreeKind::Mesh { geometry, material }
        }
    };

    let mut children = Vec::with_capacity(node.children.len());
    for child in &node.children {
        if let Some(copy) = copy_node(store, *child, level + 1, tree, geometry_slots, material_slots) {
            children.push(copy);
        }
    }

    Some(TreeNode {
        name: node.name.clone(),
        kind,
        transform: node.transform,
        visible: node.visible,
        children,
    })
}

fn is_degenerate(scale: [f32; 3]) -> bool {
    scale.iter().any(|s| !s.is_finite() || s.abs() < NEAR_ZERO_SCALE)
}

fn retain_renderable(root: &mut TreeNode, root_scale: [f32; 3]) {
    let mut stack = vec![(root, root_scale)];
    while let Some((node, combined)) = stack.pop() {
        let scaled = |child: &TreeNode| {
            let s = child.transform.scale;
            [combined[0] * s[0], combined[1] * s[1], combined[2] * s[2]]
        };
        node.children
            .retain(|child| child.visible && !is_degenerate(scaled(child)));
        for child in node.children.iter_mut() {
            let scale = scaled(child);
            stack.push((child, scale));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::graph::MaterialKind;

    fn store_with_meshes() -> (SceneStore, NodeId, [NodeId; 3]) {
        let mut store = SceneStore::new();
        let geometry = store.add_geometry(Geometry::cuboid(1.0, 1.0, 1.0));
        let material = store.add_material(Material::new(MaterialKind::Standard));
        let scene = store.create_node(NodeKind::Scene).unwrap();
        let meshes = [0, 1, 2].map(|_| {
            store
                .create_node(NodeKind::Mesh { geometry, material })
                .unwrap()
        });
        for mesh in meshes {
            store.add_child(scene, mesh).unwrap();
        }
        (store, scene, meshes)
    }

    #[test]
    fn extract_keeps_shared_resources_shared() {
        let (store, scene, _) = store_with_meshes();
        let tree = SceneTree::extract(&store, scene).unwrap();
        assert_eq!(tree.node_count(), 4);
        assert_eq!(tree.geometries.len(), 1);
        assert_eq!(tree.materials.len(), 1);
    }

    #[test]
    fn extract_does_not_alias_the_live_store() {
        let (mut store, scene, meshes) = store_with_meshes();
        let tree = SceneTree::extract(&store, scene).unwrap();
        store.node_mut(meshes[0]).unwrap().visible = false;
        assert!(tree.root.children[0].visible);
    }

    #[test]
    fn strip_removes_hidden_and_collapsed_nodes() {
        let (mut store, scene, meshes) = store_with_meshes();
        store.node_mut(meshes[0]).unwrap().visible = false;
        store.node_mut(meshes[1]).unwrap().transform.scale = [1.0, 1e-7, 1.0];
        let mut tree = SceneTree::extract(&store, scene).unwrap();
        assert_eq!(tree.strip_degenerate(), 2);
        assert_eq!(tree.node_count(), 2);
    }

    #[test]
    fn combined_scale_accumulates_through_ancestors() {
        let mut store = SceneStore::new();
        let scene = store.create_node(NodeKind::Scene).unwrap();
        let outer = store.create_node(NodeKind::Group).unwrap();
        let inner = store.create_node(NodeKind::Object).unwrap();
        store.add_child(scene, outer).unwrap();
        store.add_child(outer, inner).unwrap();
        store.node_mut(outer).unwrap().transform.scale = [1e-3; 3];
        store.node_mut(inner).unwrap().transform.scale = [1e-4; 3];
        let mut tree = SceneTree::extract(&store, scene).unwrap();
        assert_eq!(tree.strip_degenerate(), 1);
        assert_eq!(tree.node_count(), 2);
    }

    #[test]
    fn unknown_root_yields_none() {
        let store = SceneStore::new();
        assert!(SceneTree::extract(&store, NodeId(9)).is_none());
    }
}
