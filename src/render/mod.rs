//! Offscreen rendering module
//!
//! Three persistent scenes are rendered per solved frame: the intraoral tooth
//! preview, the AR composite (camera marker plus ray indicator over a
//! precomputed face background) and the calibration overlay. Scenes are
//! described on the CPU and drawn by a [`Rasterizer`]; the wgpu backend lives
//! in [`offscreen`].

mod ar;
pub mod composite;
mod mesh;
pub mod offscreen;
pub mod raycast;
mod scene;

pub use ar::ArSceneRenderer;
pub use mesh::{MeshVertex, SceneAssets, TriMesh};
pub use offscreen::GpuRasterizer;
pub use scene::{
    DirectionalLight, Material, MeshHandle, Node, NodeId, PerspectiveCamera, Scene, Shading,
};

use std::path::PathBuf;

use image::RgbImage;
use thiserror::Error;

use crate::pose::RenderPose;

/// Mesh asset failures.
#[derive(Error, Debug)]
pub enum AssetError {
    #[error("mesh asset not found: {0}")]
    Missing(PathBuf),
    #[error("failed to load mesh {path}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("mesh asset has no triangles: {0}")]
    Empty(PathBuf),
}

/// Graphics context failures. All of them are fatal for the pipeline.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("no suitable GPU adapter")]
    NoAdapter,
    #[error("GPU device error: {0}")]
    Device(String),
    #[error("frame readback failed: {0}")]
    Readback(String),
    #[error("render context already released")]
    Released,
    #[error("unknown mesh handle {0:?}")]
    UnknownMesh(MeshHandle),
    #[error("scene has {count} nodes, at most {max} are supported")]
    TooManyNodes { count: usize, max: usize },
    #[error("image size mismatch: expected {expected:?}, got {actual:?}")]
    SizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error(transparent)]
    Asset(#[from] AssetError),
}

/// Draws scenes into RGB images.
pub trait Rasterizer: Send {
    /// Upload a mesh once; the handle stays valid until release.
    fn upload_mesh(&mut self, mesh: &TriMesh) -> Result<MeshHandle, RenderError>;

    /// Render the scene at the rasterizer's fixed output size.
    fn draw(&mut self, scene: &Scene) -> Result<RgbImage, RenderError>;

    /// Output size (width, height).
    fn size(&self) -> (u32, u32);

    /// Release GPU resources. Idempotent.
    fn release(&mut self);
}

/// The three per-frame render operations plus teardown.
///
/// Every pose passed in must already be in the render convention.
pub trait SceneRenderer: Send {
    /// Intraoral close-up seen from the tracked camera.
    fn render_tooth(&mut self, pose: &RenderPose) -> Result<RgbImage, RenderError>;

    /// Camera marker and ray indicator composited over the static background.
    fn render_camera_composite(&mut self, pose: &RenderPose) -> Result<RgbImage, RenderError>;

    /// Translucent board overlay seen from the tracked camera.
    fn render_chessboard(&mut self, pose: &RenderPose) -> Result<RgbImage, RenderError>;

    /// Release the graphics context. Idempotent.
    fn cleanup(&mut self);
}
