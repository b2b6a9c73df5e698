//! Live scene-graph store mutated by guest code through the `SCENE` API.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Column-major 4x4 matrix.
pub type Mat4 = [f32; 16];

pub const IDENTITY: Mat4 = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl $name {
            fn index(self) -> Option<usize> {
                (self.0 as usize).checked_sub(1)
            }
        }
    };
}

handle!(
    /// Node handle. Zero is never issued so the guest can use it as "none".
    NodeId
);
handle!(
    /// Geometry handle.
    GeometryId
);
handle!(
    /// Material handle.
    MaterialId
);

/// Local transform: translation, XYZ Euler rotation (radians), scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: [f32; 3],
    pub rotation: [f32; 3],
    pub scale: [f32; 3],
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            rotation: [0.0; 3],
            scale: [1.0; 3],
        }
    }
}

impl Transform {
    /// Compose translation, rotation and scale into a matrix.
    pub fn matrix(&self) -> Mat4 {
        let [x, y, z] = self.rotation;
        let (a, b) = (x.cos(), x.sin());
        let (c, d) = (y.cos(), y.sin());
        let (e, f) = (z.cos(), z.sin());
        let (ae, af, be, bf) = (a * e, a * f, b * e, b * f);
        let [sx, sy, sz] = self.scale;
        let [px, py, pz] = self.position;

        [
            c * e * sx,
            (af + be * d) * sx,
            (bf - ae * d) * sx,
            0.0,
            -c * f * sy,
            (ae - bf * d) * sy,
            (be + af * d) * sy,
            0.0,
            d * sz,
            -b * c * sz,
            a * c * sz,
            0.0,
            px,
            py,
            pz,
            1.0,
        ]
    }

    /// Recover a transform from a TRS matrix. Shear is discarded.
    pub fn from_matrix(m: &Mat4) -> Self {
        let len = |i: usize| (m[i] * m[i] + m[i + 1] * m[i + 1] + m[i + 2] * m[i + 2]).sqrt();
        let scale = [len(0), len(4), len(8)];
        let safe = |s: f32| if s.abs() < f32::EPSILON { 1.0 } else { s };
        let (sx, sy, sz) = (safe(scale[0]), safe(scale[1]), safe(scale[2]));

        let m11 = m[0] / sx;
        let m12 = m[4] / sy;
        let m13 = m[8] / sz;
        let m22 = m[5] / sy;
        let m23 = m[9] / sz;
        let m32 = m[6] / sy;
        let m33 = m[10] / sz;

        let ry = m13.clamp(-1.0, 1.0).asin();
        let (rx, rz) = if m13.abs() < 0.999_999_9 {
            ((-m23).atan2(m33), (-m12).atan2(m11))
        } else {
            (m32.atan2(m22), 0.0)
        };

        Self {
            position: [m[12], m[13], m[14]],
            rotation: [rx, ry, rz],
            scale,
        }
    }

    /// Rotation as a unit quaternion `[x, y, z, w]`.
    pub fn quaternion(&self) -> [f32; 4] {
        let [x, y, z] = self.rotation;
        let (c1, s1) = ((x / 2.0).cos(), (x / 2.0).sin());
        let (c2, s2) = ((y / 2.0).cos(), (y / 2.0).sin());
        let (c3, s3) = ((z / 2.0).cos(), (z / 2.0).sin());
        [
            s1 * c2 * c3 + c1 * s2 * s3,
            c1 * s2 * c3 - s1 * c2 * s3,
            c1 * c2 * s3 + s1 * s2 * c3,
            c1 * c2 * c3 - s1 * s2 * s3,
        ]
    }
}

pub fn mat4_mul(a: &Mat4, b: &Mat4) -> Mat4 {
    let mut out = [0.0; 16];
    for col in 0..4 {
        for row in 0..4 {
            out[col * 4 + row] = (0..4).map(|k| a[k * 4 + row] * b[col * 4 + k]).sum();
        }
    }
    out
}

pub fn transform_point(m: &Mat4, p: [f32; 3]) -> [f32; 3] {
    [
        m[0] * p[0] + m[4] * p[1] + m[8] * p[2] + m[12],
        m[1] * p[0] + m[5] * p[1] + m[9] * p[2] + m[13],
        m[2] * p[0] + m[6] * p[1] + m[10] * p[2] + m[14],
    ]
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            fov: 50.0,
            aspect: 1.0,
            near: 0.1,
            far: 2000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    Ambient,
    Directional,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    pub kind: LightKind,
    pub color: u32,
    pub intensity: f32,
}

/// What a node is.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Scene,
    Group,
    Object,
    Mesh {
        geometry: GeometryId,
        material: MaterialId,
    },
    Camera(Camera),
    Light(Light),
}

impl NodeKind {
    /// Object type name used in snapshots.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Scene => "Scene",
            Self::Group => "Group",
            Self::Object => "Object3D",
            Self::Mesh { .. } => "Mesh",
            Self::Camera(_) => "PerspectiveCamera",
            Self::Light(Light {
                kind: LightKind::Ambient,
                ..
            }) => "AmbientLight",
            Self::Light(Light {
                kind: LightKind::Directional,
                ..
            }) => "DirectionalLight",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub transform: Transform,
    pub visible: bool,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// A named vertex attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferAttribute {
    pub item_size: u32,
    pub normalized: bool,
    pub array: Vec<f32>,
}

impl BufferAttribute {
    pub fn new(item_size: u32, normalized: bool, array: Vec<f32>) -> Result<Self, GraphError> {
        if item_size == 0 || item_size > 4 || array.len() % item_size as usize != 0 {
            return Err(GraphError::InvalidAttribute(format!(
                "{} values do not divide into items of size {}",
                array.len(),
                item_size
            )));
        }
        Ok(Self {
            item_size,
            normalized,
            array,
        })
    }

    /// Number of items.
    pub fn count(&self) -> usize {
        self.array.len() / self.item_size.max(1) as usize
    }
}

/// Indexed or non-indexed buffer geometry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Geometry {
    pub attributes: BTreeMap<String, BufferAttribute>,
    pub index: Option<Vec<u32>>,
}

impl Geometry {
    pub fn position(&self) -> Option<&BufferAttribute> {
        self.attributes.get("position")
    }

    /// Axis-aligned box centred on the origin.
    pub fn cuboid(width: f32, height: f32, depth: f32) -> Self {
        let half = [width / 2.0, height / 2.0, depth / 2.0];
        // (normal, u, v) with u x v == normal so faces wind counter-clockwise.
        const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]),
        ];
        let extent = |v: [f32; 3]| {
            v[0].abs() * half[0] + v[1].abs() * half[1] + v[2].abs() * half[2]
        };

        let mut positions = Vec::with_capacity(72);
        let mut normals = Vec::with_capacity(72);
        let mut uvs = Vec::with_capacity(48);
        let mut index = Vec::with_capacity(36);
        for (face, (n, u, v)) in FACES.iter().enumerate() {
            let (dn, du, dv) = (extent(*n), extent(*u), extent(*v));
            for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                for axis in 0..3 {
                    positions.push(n[axis] * dn + u[axis] * du * su + v[axis] * dv * sv);
                }
                normals.extend_from_slice(n);
                uvs.extend_from_slice(&[(su + 1.0) / 2.0, (sv + 1.0) / 2.0]);
            }
            let base = (face * 4) as u32;
            index.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::from_parts(positions, normals, uvs, index)
    }

    /// Rectangle in the XY plane facing +Z.
    pub fn plane(width: f32, height: f32) -> Self {
        let (hw, hh) = (width / 2.0, height / 2.0);
        let positions = vec![
            -hw, -hh, 0.0, //
            hw, -hh, 0.0, //
            hw, hh, 0.0, //
            -hw, hh, 0.0,
        ];
        let normals = [0.0, 0.0, 1.0].repeat(4);
        let uvs = vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];
        Self::from_parts(positions, normals, uvs, vec![0, 1, 2, 0, 2, 3])
    }

    fn from_parts(positions: Vec<f32>, normals: Vec<f32>, uvs: Vec<f32>, index: Vec<u32>) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "position".to_string(),
            BufferAttribute {
                item_size: 3,
                normalized: false,
                array: positions,
            },
        );
        attributes.insert(
            "normal".to_string(),
            BufferAttribute {
                item_size: 3,
                normalized: false,
                array: normals,
            },
        );
        attributes.insert(
            "uv".to_string(),
            BufferAttribute {
                item_size: 2,
                normalized: false,
                array: uvs,
            },
        );
        Self {
            attributes,
            index: Some(index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialKind {
    Basic,
    Standard,
    Phong,
    Lambert,
}

impl MaterialKind {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "basic" | "MeshBasicMaterial" => Self::Basic,
            "standard" | "MeshStandardMaterial" => Self::Standard,
            "phong" | "MeshPhongMaterial" => Self::Phong,
            "lambert" | "MeshLambertMaterial" => Self::Lambert,
            _ => return None,
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Basic => "MeshBasicMaterial",
            Self::Standard => "MeshStandardMaterial",
            Self::Phong => "MeshPhongMaterial",
            Self::Lambert => "MeshLambertMaterial",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub kind: MaterialKind,
    pub color: u32,
    pub opacity: f32,
    pub transparent: bool,
    pub roughness: f32,
    pub metalness: f32,
    pub emissive: u32,
    pub wireframe: bool,
    /// Texture URL.
    pub map: Option<String>,
}

impl Material {
    pub fn new(kind: MaterialKind) -> Self {
        Self {
            kind,
            color: 0xffffff,
            opacity: 1.0,
            transparent: false,
            roughness: 1.0,
            metalness: 0.0,
            emissive: 0,
            wireframe: false,
            map: None,
        }
    }

    /// Overwrite properties present in a guest-supplied parameter object.
    pub fn apply_params(&mut self, params: &Value) {
        let Some(obj) = params.as_object() else {
            return;
        };
        if let Some(color) = obj.get("color").and_then(parse_color) {
            self.color = color;
        }
        if let Some(emissive) = obj.get("emissive").and_then(parse_color) {
            self.emissive = emissive;
        }
        let number = |key: &str| obj.get(key).and_then(Value::as_f64).filter(|v| v.is_finite());
        if let Some(v) = number("opacity") {
            self.opacity = v.clamp(0.0, 1.0) as f32;
        }
        if let Some(v) = number("roughness") {
            self.roughness = v.clamp(0.0, 1.0) as f32;
        }
        if let Some(v) = number("metalness") {
            self.metalness = v.clamp(0.0, 1.0) as f32;
        }
        if let Some(v) = obj.get("transparent").and_then(Value::as_bool) {
            self.transparent = v;
        }
        if let Some(v) = obj.get("wireframe").and_then(Value::as_bool) {
            self.wireframe = v;
        }
        match obj.get("map") {
            Some(Value::String(url)) => self.map = Some(url.clone()),
            Some(Value::Null) => self.map = None,
            _ => {}
        }
    }
}

/// Accepts `0xrrggbb` numbers and `#rrggbb` strings.
pub fn parse_color(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| (v as u64 & 0xff_ffff) as u32),
        Value::String(s) => u32::from_str_radix(s.trim().trim_start_matches('#'), 16)
            .ok()
            .map(|v| v & 0xff_ffff),
        _ => None,
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GraphError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("unknown geometry {0}")]
    UnknownGeometry(GeometryId),
    #[error("unknown material {0}")]
    UnknownMaterial(MaterialId),
    #[error("adding node {child} under {parent} would create a cycle")]
    Cycle { parent: NodeId, child: NodeId },
    #[error("adding node {child} under {parent} would nest the scene deeper than {MAX_SCENE_DEPTH} levels")]
    TooDeep { parent: NodeId, child: NodeId },
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
}

/// Deepest nesting a scene may reach, counting the root as level 1.
pub const MAX_SCENE_DEPTH: usize = 256;

/// Arena of nodes, geometries and materials owned by the guest runtime.
#[derive(Debug, Clone, Default)]
pub struct SceneStore {
    nodes: Vec<Node>,
    geometries: Vec<Geometry>,
    materials: Vec<Material>,
}

impl SceneStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_node(&mut self, kind: NodeKind) -> Result<NodeId, GraphError> {
        if let NodeKind::Mesh { geometry, material } = &kind {
            self.geometry(*geometry)?;
            self.material(*material)?;
        }
        self.nodes.push(Node {
            name: String::new(),
            kind,
            transform: Transform::default(),
            visible: true,
            parent: None,
            children: Vec::new(),
        });
        Ok(NodeId(self.nodes.len() as u32))
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        id.index()
            .and_then(|i| self.nodes.get(i))
            .ok_or(GraphError::UnknownNode(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        id.index()
            .and_then(|i| self.nodes.get_mut(i))
            .ok_or(GraphError::UnknownNode(id))
    }

    pub fn add_geometry(&mut self, geometry: Geometry) -> GeometryId {
        self.geometries.push(geometry);
        GeometryId(self.geometries.len() as u32)
    }

    pub fn geometry(&self, id: GeometryId) -> Result<&Geometry, GraphError> {
        id.index()
            .and_then(|i| self.geometries.get(i))
            .ok_or(GraphError::UnknownGeometry(id))
    }

    pub fn geometry_mut(&mut self, id: GeometryId) -> Result<&mut Geometry, GraphError> {
        id.index()
            .and_then(|i| self.geometries.get_mut(i))
            .ok_or(GraphError::UnknownGeometry(id))
    }

    pub fn add_material(&mut self, material: Material) -> MaterialId {
        self.materials.push(material);
        MaterialId(self.materials.len() as u32)
    }

    pub fn material(&self, id: MaterialId) -> Result<&Material, GraphError> {
        id.index()
            .and_then(|i| self.materials.get(i))
            .ok_or(GraphError::UnknownMaterial(id))
    }

    pub fn material_mut(&mut self, id: MaterialId) -> Result<&mut Material, GraphError> {
        id.index()
            .and_then(|i| self.materials.get_mut(i))
            .ok_or(GraphError::UnknownMaterial(id))
    }

    /// Attach `child` under `parent`, detaching it from any previous parent.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), GraphError> {
        self.node(child)?;
        self.node(parent)?;
        // Walking up from the parent must never reach the child.
        let mut depth = 0;
        let mut cursor = Some(parent);
        while let Some(id) = cursor {
            if id == child {
                return Err(GraphError::Cycle { parent, child });
            }
            depth += 1;
            if depth >= MAX_SCENE_DEPTH {
                return Err(GraphError::TooDeep { parent, child });
            }
            cursor = self.node(id)?.parent;
        }
        if depth + self.height(child) > MAX_SCENE_DEPTH {
            return Err(GraphError::TooDeep { parent, child });
        }

        if let Some(old) = self.node(child)?.parent {
            self.node_mut(old)?.children.retain(|c| *c != child);
        }
        self.node_mut(parent)?.children.push(child);
        self.node_mut(child)?.parent = Some(parent);
        Ok(())
    }

    /// Detach `child` from `parent`. Returns whether it was attached there.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<bool, GraphError> {
        if self.node(child)?.parent != Some(parent) {
            return Ok(false);
        }
        self.node_mut(parent)?.children.retain(|c| *c != child);
        self.node_mut(child)?.parent = None;
        Ok(true)
    }

    /// Visit `root` and all descendants in pre-order.
    pub fn traverse(&self, root: NodeId, mut visit: impl FnMut(NodeId, &Node)) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Ok(node) = self.node(id) {
                visit(id, node);
                stack.extend(node.children.iter().rev().copied());
            }
        }
    }

    /// Levels in the subtree under `root`, counting `root` itself.
    pub fn height(&self, root: NodeId) -> usize {
        let mut height = 0;
        let mut stack = vec![(root, 1)];
        while let Some((id, level)) = stack.pop() {
            if let Ok(node) = self.node(id) {
                height = height.max(level);
                stack.extend(node.children.iter().map(|c| (*c, level + 1)));
            }
        }
        height
    }

    /// Number of nodes reachable from `root`, including it.
    pub fn count_nodes(&self, root: NodeId) -> usize {
        let mut count = 0;
        self.traverse(root, |_, _| count += 1);
        count
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
