//! Software render surfaces and the thumbnail rasterizer.
//!
//! Guest renderers draw onto a [`RenderSurface`]. Rendering only records
//! which scene was last drawn; pixels are produced on demand by
//! [`rasterize`] when a thumbnail is captured.

use thiserror::Error;

use super::graph::{mat4_mul, transform_point, SceneStore, NodeId, Mat4, IDENTITY};
use super::tree::{SceneTree, TreeKind};

/// Longest edge of an emitted thumbnail.
pub const THUMBNAIL_MAX_EDGE: u32 = 512;

pub const DEFAULT_SURFACE_WIDTH: u32 = 300;
pub const DEFAULT_SURFACE_HEIGHT: u32 = 150;
pub const MAX_SURFACE_EDGE: u32 = 4096;

const BACKGROUND: [u8; 4] = [24, 24, 28, 255];
const VIEW_YAW_DEG: f32 = 30.0;
const VIEW_PITCH_DEG: f32 = 20.0;
const LIGHT_DIR: [f32; 3] = [0.3, 0.8, 0.5];

/// RGBA8 image, row-major, top row first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RasterImage {
    pub fn filled(width: u32, height: u32, color: [u8; 4]) -> Self {
        Self {
            width,
            height,
            pixels: color.repeat((width * height) as usize),
        }
    }

    fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * self.width + x) * 4) as usize;
        [
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]
    }

    /// Box-filter down so the longest edge is at most `max_edge`.
    pub fn downscale(&self, max_edge: u32) -> RasterImage {
        let longest = self.width.max(self.height);
        if longest <= max_edge || max_edge == 0 {
            return self.clone();
        }
        let scale = max_edge as f32 / longest as f32;
        let width = ((self.width as f32 * scale).round() as u32).max(1);
        let height = ((self.height as f32 * scale).round() as u32).max(1);

        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            let y0 = y * self.height / height;
            let y1 = ((y + 1) * self.height / height).max(y0 + 1);
            for x in 0..width {
                let x0 = x * self.width / width;
                let x1 = ((x + 1) * self.width / width).max(x0 + 1);
                let mut sum = [0u32; 4];
                for sy in y0..y1 {
                    for sx in x0..x1 {
                        let p = self.pixel(sx, sy);
                        for c in 0..4 {
                            sum[c] += p[c] as u32;
                        }
                    }
                }
                let n = (y1 - y0) * (x1 - x0);
                pixels.extend(sum.iter().map(|s| (s / n) as u8));
            }
        }
        RasterImage {
            width,
            height,
            pixels,
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("rendering context lost")]
    ContextLost,
    #[error("surface disposed")]
    Disposed,
}

/// Drawing target owned by a guest renderer.
pub trait RenderSurface {
    fn size(&self) -> (u32, u32);
    fn set_size(&mut self, width: u32, height: u32) -> Result<(), SurfaceError>;
    /// Record a draw of `scene` from `camera`.
    fn render(&mut self, scene: NodeId, camera: Option<NodeId>) -> Result<(), SurfaceError>;
    /// Produce pixels for the last rendered scene.
    fn capture(&self, store: &SceneStore) -> Option<RasterImage>;
    fn lose_context(&mut self);
    fn is_context_lost(&self) -> bool;
    fn dispose(&mut self);
    fn is_disposed(&self) -> bool;
    fn last_scene(&self) -> Option<NodeId>;
}

/// CPU-backed surface.
#[derive(Debug)]
pub struct SoftwareSurface {
    width: u32,
    height: u32,
    last_scene: Option<NodeId>,
    context_lost: bool,
    disposed: bool,
}

impl Default for SoftwareSurface {
    fn default() -> Self {
        Self::new(DEFAULT_SURFACE_WIDTH, DEFAULT_SURFACE_HEIGHT)
    }
}

impl SoftwareSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.clamp(1, MAX_SURFACE_EDGE),
            height: height.clamp(1, MAX_SURFACE_EDGE),
            last_scene: None,
            context_lost: false,
            disposed: false,
        }
    }

    fn usable(&self) -> Result<(), SurfaceError> {
        if self.disposed {
            Err(SurfaceError::Disposed)
        } else if self.context_lost {
            Err(SurfaceError::ContextLost)
        } else {
            Ok(())
        }
    }
}

impl RenderSurface for SoftwareSurface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn set_size(&mut self, width: u32, height: u32) -> Result<(), SurfaceError> {
        self.usable()?;
        self.width = width.clamp(1, MAX_SURFACE_EDGE);
        self.height = height.clamp(1, MAX_SURFACE_EDGE);
        Ok(())
    }

    fn render(&mut self, scene: NodeId, _camera: Option<NodeId>) -> Result<(), SurfaceError> {
        self.usable()?;
        self.last_scene = Some(scene);
        Ok(())
    }

    fn capture(&self, store: &SceneStore) -> Option<RasterImage> {
        if self.usable().is_err() {
            return None;
        }
        let tree = SceneTree::extract(store, self.last_scene?)?;
        Some(rasterize(&tree, self.width, self.height))
    }

    fn lose_context(&mut self) {
        self.context_lost = true;
    }

    fn is_context_lost(&self) -> bool {
        self.context_lost
    }

    fn dispose(&mut self) {
        self.disposed = true;
        self.last_scene = None;
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn last_scene(&self) -> Option<NodeId> {
        self.last_scene
    }
}

struct Triangle {
    points: [[f32; 3]; 3],
    color: [u8; 4],
    depth: f32,
}

fn view_matrix() -> Mat4 {
    let (yaw, pitch) = (VIEW_YAW_DEG.to_radians(), VIEW_PITCH_DEG.to_radians());
    let (cy, sy) = (yaw.cos(), yaw.sin());
    let (cp, sp) = (pitch.cos(), pitch.sin());
    let rotate_y: Mat4 = [
        cy, 0.0, -sy, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        sy, 0.0, cy, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ];
    let rotate_x: Mat4 = [
        1.0, 0.0, 0.0, 0.0, //
        0.0, cp, sp, 0.0, //
        0.0, -sp, cp, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ];
    mat4_mul(&rotate_x, &rotate_y)
}

fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn shade(color: u32, opacity: f32, normal: [f32; 3]) -> [u8; 4] {
    let len = (normal[0] * normal[0] + normal[1] * normal[1] + normal[2] * normal[2]).sqrt();
    let l_len = (LIGHT_DIR[0] * LIGHT_DIR[0] + LIGHT_DIR[1] * LIGHT_DIR[1] + LIGHT_DIR[2] * LIGHT_DIR[2]).sqrt();
    let lambert = if len > 0.0 {
        ((normal[0] * LIGHT_DIR[0] + normal[1] * LIGHT_DIR[1] + normal[2] * LIGHT_DIR[2]) / (len * l_len))
            .abs()
    } else {
        0.0
    };
    let k = 0.35 + 0.65 * lambert;
    let channel = |shift: u32| ((((color >> shift) & 0xff) as f32) * k).min(255.0) as u8;
    [
        channel(16),
        channel(8),
        channel(0),
        (opacity.clamp(0.0, 1.0) * 255.0) as u8,
    ]
}

/// Draw `tree` from a fixed three-quarter view, fitted to its bounds.
pub fn rasterize(tree: &SceneTree, width: u32, height: u32) -> RasterImage {
    let width = width.clamp(1, MAX_SURFACE_EDGE);
    let height = height.clamp(1, MAX_SURFACE_EDGE);
    let mut image = RasterImage::filled(width, height, BACKGROUND);

    let view = view_matrix();
    let mut triangles = Vec::new();
    tree.root.walk(&IDENTITY, &mut |node, world| {
        if !node.visible {
            return;
        }
        let TreeKind::Mesh { geometry, material } = node.kind else {
            return;
        };
        let (Some(geometry), Some(material)) =
            (tree.geometries.get(geometry), tree.materials.get(material))
        else {
            return;
        };
        let Some(position) = geometry.position().filter(|p| p.item_size == 3) else {
            return;
        };
        let to_view = mat4_mul(&view, world);
        let vertices: Vec<[f32; 3]> = position
            .array
            .chunks_exact(3)
            .map(|p| transform_point(&to_view, [p[0], p[1], p[2]]))
            .collect();
        let indices: Vec<u32> = match &geometry.index {
            Some(index) => index.clone(),
            None => (0..vertices.len() as u32).collect(),
        };
        for tri in indices.chunks_exact(3) {
            let fetch = |i: u32| vertices.get(i as usize).copied();
            let (Some(a), Some(b), Some(c)) = (fetch(tri[0]), fetch(tri[1]), fetch(tri[2])) else {
                continue;
            };
            if [a, b, c].iter().flatten().any(|v| !v.is_finite()) {
                continue;
            }
            let normal = cross(sub(b, a), sub(c, a));
            triangles.push(Triangle {
                points: [a, b, c],
                color: shade(material.color, material.opacity, normal),
                depth: (a[2] + b[2] + c[2]) / 3.0,
            });
        }
    });
    if triangles.is_empty() {
        return image;
    }

    let (mut min, mut max) = ([f32::MAX; 2], [f32::MIN; 2]);
    for p in triangles.iter().flat_map(|t| t.points.iter()) {
        min = [min[0].min(p[0]), min[1].min(p[1])];
        max = [max[0].max(p[0]), max[1].max(p[1])];
    }
    let extent = (max[0] - min[0]).max(max[1] - min[1]).max(1e-6);
    let fit = 0.9 * (width.min(height) as f32) / extent;
    let center = [(min[0] + max[0]) / 2.0, (min[1] + max[1]) / 2.0];
    let project = |p: [f32; 3]| {
        [
            width as f32 / 2.0 + (p[0] - center[0]) * fit,
            height as f32 / 2.0 - (p[1] - center[1]) * fit,
        ]
    };

    // Painter's order: farthest first. View space looks down -Z.
    triangles.sort_by(|a, b| a.depth.total_cmp(&b.depth));
    for tri in &triangles {
        let [a, b, c] = tri.points.map(project);
        fill_triangle(&mut image, a, b, c, tri.color);
    }
    image
}

fn fill_triangle(image: &mut RasterImage, a: [f32; 2], b: [f32; 2], c: [f32; 2], color: [u8; 4]) {
    let edge = |p: [f32; 2], q: [f32; 2], r: [f32; 2]| (q[0] - p[0]) * (r[1] - p[1]) - (q[1] - p[1]) * (r[0] - p[0]);
    let area = edge(a, b, c);
    if area.abs() < f32::EPSILON {
        return;
    }
    let min_x = a[0].min(b[0]).min(c[0]).floor().max(0.0) as u32;
    let min_y = a[1].min(b[1]).min(c[1]).floor().max(0.0) as u32;
    let max_x = (a[0].max(b[0]).max(c[0]).ceil() as u32).min(image.width - 1);
    let max_y = (a[1].max(b[1]).max(c[1]).ceil() as u32).min(image.height - 1);
    let alpha = color[3] as u32;

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let p = [x as f32 + 0.5, y as f32 + 0.5];
            let w0 = edge(b, c, p) / area;
            let w1 = edge(c, a, p) / area;
            let w2 = edge(a, b, p) / area;
            if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                continue;
            }
            let i = ((y * image.width + x) * 4) as usize;
            for ch in 0..3 {
                let dst = image.pixels[i + ch] as u32;
                image.pixels[i + ch] = ((color[ch] as u32 * alpha + dst * (255 - alpha)) / 255) as u8;
            }
            image.pixels[i + 3] = 255;
        }
    }
}
