//! Scene engine: the live graph guests mutate, detached trees for export,
//! and the encoders that turn a tree into artifacts.

pub mod bundle;
pub mod dedup;
pub mod graph;
pub mod raster;
pub mod snapshot;
pub mod tree;

pub use bundle::{encode_glb, BundleError};
pub use dedup::{deduplicate, DedupReport};
pub use graph::{GeometryId, GraphError, MaterialId, NodeId, SceneStore};
pub use raster::{RasterImage, RenderSurface, SoftwareSurface, SurfaceError, THUMBNAIL_MAX_EDGE};
pub use snapshot::SnapshotError;
pub use tree::SceneTree;
