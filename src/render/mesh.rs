//! Triangle meshes: generated primitives and OBJ assets.

use std::f32::consts::{PI, TAU};
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use super::AssetError;

/// Vertex layout uploaded to the GPU.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

impl MeshVertex {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn buffer_layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: Self::SIZE,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                // position
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x3,
                },
                // normal
                wgpu::VertexAttribute {
                    offset: 12,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x3,
                },
            ],
        }
    }
}

/// Indexed triangle mesh kept on the CPU for ray casting and upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriMesh {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub indices: Vec<u32>,
}

impl TriMesh {
    /// Build from positions and triangles, computing smooth normals.
    pub fn new(positions: Vec<Vec3>, indices: Vec<u32>) -> Self {
        let mut mesh = Self {
            normals: vec![Vec3::ZERO; positions.len()],
            positions,
            indices,
        };
        mesh.compute_normals();
        mesh
    }

    /// Axis-aligned box centred on the origin.
    pub fn cuboid(extents: Vec3) -> Self {
        let h = extents * 0.5;
        let faces: [(Vec3, Vec3, Vec3); 6] = [
            (Vec3::X, Vec3::Y, Vec3::Z),
            (Vec3::NEG_X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::Z, Vec3::X),
            (Vec3::NEG_Y, Vec3::X, Vec3::Z),
            (Vec3::Z, Vec3::X, Vec3::Y),
            (Vec3::NEG_Z, Vec3::Y, Vec3::X),
        ];

        let mut positions = Vec::with_capacity(24);
        let mut normals = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, u, v) in faces {
            let base = positions.len() as u32;
            let center = normal * h;
            let du = u * h;
            let dv = v * h;
            for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                positions.push(center + du * su + dv * sv);
                normals.push(normal);
            }
            // u x v == normal, so this winding faces outward
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self {
            positions,
            normals,
            indices,
        }
    }

    /// Closed cylinder along Z, centred on the origin.
    pub fn cylinder(radius: f32, height: f32, segments: u32) -> Self {
        let segments = segments.max(3);
        let half = height * 0.5;
        let mut positions = Vec::new();
        let mut normals = Vec::new();
        let mut indices = Vec::new();

        // side
        for i in 0..=segments {
            let angle = i as f32 / segments as f32 * TAU;
            let (s, c) = angle.sin_cos();
            let n = Vec3::new(c, s, 0.0);
            positions.push(Vec3::new(c * radius, s * radius, -half));
            normals.push(n);
            positions.push(Vec3::new(c * radius, s * radius, half));
            normals.push(n);
        }
        for i in 0..segments {
            let b = i * 2;
            indices.extend_from_slice(&[b, b + 2, b + 3, b, b + 3, b + 1]);
        }

        // caps
        for (z, normal) in [(-half, Vec3::NEG_Z), (half, Vec3::Z)] {
            let center = positions.len() as u32;
            positions.push(Vec3::new(0.0, 0.0, z));
            normals.push(normal);
            for i in 0..=segments {
                let angle = i as f32 / segments as f32 * TAU;
                let (s, c) = angle.sin_cos();
                positions.push(Vec3::new(c * radius, s * radius, z));
                normals.push(normal);
            }
            for i in 0..segments {
                let a = center + 1 + i;
                if normal.z > 0.0 {
                    indices.extend_from_slice(&[center, a, a + 1]);
                } else {
                    indices.extend_from_slice(&[center, a + 1, a]);
                }
            }
        }

        Self {
            positions,
            normals,
            indices,
        }
    }

    /// UV sphere centred on the origin with its poles on +Z and -Z.
    pub fn uv_sphere(radius: f32, stacks: u32, slices: u32) -> Self {
        let stacks = stacks.max(2);
        let slices = slices.max(3);
        let mut positions = Vec::new();
        let mut normals = Vec::new();
        let mut indices = Vec::new();

        for i in 0..=stacks {
            let theta = i as f32 / stacks as f32 * PI;
            let (st, ct) = theta.sin_cos();
            for j in 0..=slices {
                let phi = j as f32 / slices as f32 * TAU;
                let (sp, cp) = phi.sin_cos();
                let n = Vec3::new(st * cp, st * sp, ct);
                positions.push(n * radius);
                normals.push(n);
            }
        }

        let row = slices + 1;
        for i in 0..stacks {
            for j in 0..slices {
                let a = i * row + j;
                let b = a + row;
                if i != 0 {
                    indices.extend_from_slice(&[a, b, a + 1]);
                }
                if i != stacks - 1 {
                    indices.extend_from_slice(&[a + 1, b, b + 1]);
                }
            }
        }

        Self {
            positions,
            normals,
            indices,
        }
    }

    /// Load every object in a Wavefront OBJ file into one mesh.
    pub fn load_obj(path: &Path) -> Result<Self, AssetError> {
        if !path.exists() {
            return Err(AssetError::Missing(path.to_path_buf()));
        }
        let options = tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        };
        let (models, _materials) = tobj::load_obj(path, &options).map_err(|e| AssetError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut positions = Vec::new();
        let mut normals = Vec::new();
        let mut indices = Vec::new();
        let mut has_normals = true;

        for model in &models {
            let mesh = &model.mesh;
            let base = positions.len() as u32;
            positions.extend(
                mesh.positions
                    .chunks_exact(3)
                    .map(|p| Vec3::new(p[0], p[1], p[2])),
            );
            if mesh.normals.len() == mesh.positions.len() {
                normals.extend(
                    mesh.normals
                        .chunks_exact(3)
                        .map(|n| Vec3::new(n[0], n[1], n[2])),
                );
            } else {
                has_normals = false;
            }
            indices.extend(mesh.indices.iter().map(|i| i + base));
        }

        if indices.is_empty() {
            return Err(AssetError::Empty(path.to_path_buf()));
        }

        let mut mesh = Self {
            normals: if has_normals {
                normals
            } else {
                vec![Vec3::ZERO; positions.len()]
            },
            positions,
            indices,
        };
        if !has_normals {
            mesh.compute_normals();
        }
        log::debug!(
            "Loaded {} ({} vertices, {} triangles)",
            path.display(),
            mesh.positions.len(),
            mesh.triangle_count()
        );
        Ok(mesh)
    }

    /// Area-weighted vertex normals.
    pub fn compute_normals(&mut self) {
        let mut normals = vec![Vec3::ZERO; self.positions.len()];
        for tri in self.indices.chunks_exact(3) {
            let (a, b, c) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
            let n = (self.positions[b] - self.positions[a]).cross(self.positions[c] - self.positions[a]);
            normals[a] += n;
            normals[b] += n;
            normals[c] += n;
        }
        self.normals = normals.into_iter().map(|n| n.normalize_or_zero()).collect();
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Corner positions of triangle `i`.
    pub fn triangle(&self, i: usize) -> [Vec3; 3] {
        let t = &self.indices[i * 3..i * 3 + 3];
        [
            self.positions[t[0] as usize],
            self.positions[t[1] as usize],
            self.positions[t[2] as usize],
        ]
    }

    /// Axis-aligned bounds, or `None` for an empty mesh.
    pub fn bounds(&self) -> Option<(Vec3, Vec3)> {
        let first = *self.positions.first()?;
        Some(
            self.positions
                .iter()
                .fold((first, first), |(lo, hi), &p| (lo.min(p), hi.max(p))),
        )
    }

    /// Interleaved vertices for upload.
    pub fn vertices(&self) -> Vec<MeshVertex> {
        self.positions
            .iter()
            .zip(self.normals.iter())
            .map(|(p, n)| MeshVertex {
                position: p.to_array(),
                normal: n.to_array(),
            })
            .collect()
    }
}

pub const HEAD_MESH_FILE: &str = "head_mesh.obj";
pub const TEETH_MESH_FILE: &str = "teeth_double_layer.obj";
pub const TEETH_ERODED_MESH_FILE: &str = "teeth_double_layer_eroded.obj";

/// Preprocessed meshes the scenes are built from.
#[derive(Debug, Clone)]
pub struct SceneAssets {
    pub head: TriMesh,
    /// Full double-layer dental surface.
    pub teeth: TriMesh,
    /// Eroded variant used as a contact cue.
    pub teeth_eroded: TriMesh,
}

impl SceneAssets {
    /// Load the three asset files from `dir`.
    pub fn load(dir: &Path) -> Result<Self, AssetError> {
        let path = |name: &str| -> PathBuf { dir.join(name) };
        let assets = Self {
            head: TriMesh::load_obj(&path(HEAD_MESH_FILE))?,
            teeth: TriMesh::load_obj(&path(TEETH_MESH_FILE))?,
            teeth_eroded: TriMesh::load_obj(&path(TEETH_ERODED_MESH_FILE))?,
        };
        log::info!("Scene assets loaded from {}", dir.display());
        Ok(assets)
    }
}
