//! Persistent scene description handed to a [`Rasterizer`](super::Rasterizer).
//!
//! A scene is built once; per frame only node, camera and light poses change.

use glam::{Mat4, Vec3, Vec4};

/// Opaque id of a mesh uploaded to a rasterizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshHandle(pub(crate) u32);

impl MeshHandle {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Index of a node within its scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

/// Surface colour, optionally alpha blended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub color: Vec4,
    pub blend: bool,
}

impl Material {
    pub fn opaque(r: f32, g: f32, b: f32) -> Self {
        Self {
            color: Vec4::new(r, g, b, 1.0),
            blend: false,
        }
    }

    pub fn translucent(r: f32, g: f32, b: f32, alpha: f32) -> Self {
        Self {
            color: Vec4::new(r, g, b, alpha),
            blend: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shading {
    /// Unlit base colour.
    Flat,
    /// Base colour modulated by one directional light.
    Lit,
}

/// A mesh instance placed in the scene.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub mesh: MeshHandle,
    pub material: Material,
    pub transform: Mat4,
}

/// Symmetric perspective camera looking down its local -Z.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerspectiveCamera {
    pub yfov: f32,
    pub aspect: f32,
    pub znear: f32,
    pub zfar: f32,
}

impl PerspectiveCamera {
    pub fn new(yfov: f32, aspect: f32) -> Self {
        Self {
            yfov,
            aspect,
            znear: 0.005,
            zfar: 100.0,
        }
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(self.yfov, self.aspect, self.znear, self.zfar)
    }
}

/// Directional light shining down the local -Z of its pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    pub intensity: f32,
}

#[derive(Debug, Clone)]
pub struct Scene {
    pub background: [u8; 3],
    pub shading: Shading,
    pub camera: PerspectiveCamera,
    camera_pose: Mat4,
    pub light: DirectionalLight,
    light_pose: Mat4,
    nodes: Vec<Node>,
}

impl Scene {
    pub fn new(background: [u8; 3], camera: PerspectiveCamera, shading: Shading) -> Self {
        Self {
            background,
            shading,
            camera,
            camera_pose: Mat4::IDENTITY,
            light: DirectionalLight { intensity: 1.0 },
            light_pose: Mat4::IDENTITY,
            nodes: Vec::new(),
        }
    }

    pub fn add_node(&mut self, mesh: MeshHandle, material: Material, transform: Mat4) -> NodeId {
        self.nodes.push(Node {
            mesh,
            material,
            transform,
        });
        NodeId(self.nodes.len() - 1)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn set_node_pose(&mut self, id: NodeId, transform: Mat4) {
        self.nodes[id.0].transform = transform;
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn camera_pose(&self) -> Mat4 {
        self.camera_pose
    }

    /// Place the camera (camera-to-world).
    pub fn set_camera_pose(&mut self, pose: Mat4) {
        self.camera_pose = pose;
    }

    pub fn set_light_pose(&mut self, pose: Mat4) {
        self.light_pose = pose;
    }

    /// World-space direction the light travels.
    pub fn light_direction(&self) -> Vec3 {
        let dir = self.light_pose.transform_vector3(Vec3::NEG_Z);
        if dir.length_squared() > 0.0 {
            dir.normalize()
        } else {
            Vec3::NEG_Z
        }
    }

    pub fn view_projection(&self) -> Mat4 {
        self.camera.projection() * self.camera_pose.inverse()
    }

    /// Nodes in draw order: opaque first, then blended.
    pub fn draw_order(&self) -> impl Iterator<Item = &Node> {
        let opaque = self.nodes.iter().filter(|n| !n.material.blend);
        let blended = self.nodes.iter().filter(|n| n.material.blend);
        opaque.chain(blended)
    }

    pub fn background_vec(&self) -> Vec4 {
        let [r, g, b] = self.background;
        Vec4::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0, 1.0)
    }
}
