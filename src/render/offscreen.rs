//! Headless wgpu rasterizer.
//!
//! Renders a [`Scene`] into an RGBA texture with a depth buffer, copies the
//! texture into a mappable buffer and hands back an RGB image. Opaque nodes
//! are drawn first with depth writes; alpha-blended nodes follow without
//! depth writes.

use bytemuck::{Pod, Zeroable};
use image::RgbImage;
use wgpu::util::DeviceExt;

use super::mesh::{MeshVertex, TriMesh};
use super::scene::{MeshHandle, Scene, Shading};
use super::{Rasterizer, RenderError};

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Uniform slots available per draw call.
pub const MAX_DRAWS: usize = 32;

/// Per-draw uniform block, bound with a dynamic offset.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct DrawUniforms {
    pub view_proj: [[f32; 4]; 4],
    pub model: [[f32; 4]; 4],
    pub color: [f32; 4],
    /// xyz = light travel direction, w = intensity
    pub light: [f32; 4],
    /// x = 1.0 for flat shading
    pub params: [f32; 4],
}

/// Round `size` up to a multiple of `alignment`.
pub fn align_to(size: u64, alignment: u64) -> u64 {
    size.div_ceil(alignment) * alignment
}

/// Bytes per row of a readback buffer for an RGBA8 image of `width`.
pub fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

/// Strip row padding and alpha from mapped RGBA rows.
pub fn unpad_rgba(data: &[u8], width: u32, height: u32, padded_row: u32) -> Option<RgbImage> {
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        let start = (y * padded_row) as usize;
        let row = data.get(start..start + (width * 4) as usize)?;
        for px in row.chunks_exact(4) {
            rgb.extend_from_slice(&px[..3]);
        }
    }
    RgbImage::from_raw(width, height, rgb)
}

/// Uniform blocks for every node, in draw order, one `stride` apart.
///
/// Returns the packed bytes and how many blocks precede the blended nodes.
pub fn pack_uniforms(scene: &Scene, stride: u64) -> Result<(Vec<u8>, usize), RenderError> {
    let nodes: Vec<_> = scene.draw_order().collect();
    if nodes.len() > MAX_DRAWS {
        return Err(RenderError::TooManyNodes {
            count: nodes.len(),
            max: MAX_DRAWS,
        });
    }

    let view_proj = scene.view_projection().to_cols_array_2d();
    let light_dir = scene.light_direction();
    let flat = if scene.shading == Shading::Flat { 1.0 } else { 0.0 };

    let mut bytes = vec![0u8; stride as usize * nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        let block = DrawUniforms {
            view_proj,
            model: node.transform.to_cols_array_2d(),
            color: node.material.color.to_array(),
            light: [light_dir.x, light_dir.y, light_dir.z, scene.light.intensity],
            params: [flat, 0.0, 0.0, 0.0],
        };
        let offset = i * stride as usize;
        let raw = bytemuck::bytes_of(&block);
        bytes[offset..offset + raw.len()].copy_from_slice(raw);
    }
    let opaque = nodes.iter().filter(|n| !n.material.blend).count();
    Ok((bytes, opaque))
}

struct GpuMesh {
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    index_count: u32,
}

struct GpuState {
    device: wgpu::Device,
    queue: wgpu::Queue,
    opaque_pipeline: wgpu::RenderPipeline,
    blend_pipeline: wgpu::RenderPipeline,
    uniform_buffer: wgpu::Buffer,
    uniform_stride: u64,
    bind_group: wgpu::BindGroup,
    color_texture: wgpu::Texture,
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
    readback: wgpu::Buffer,
    meshes: Vec<GpuMesh>,
}

/// wgpu implementation of [`Rasterizer`] with a fixed output size.
pub struct GpuRasterizer {
    state: Option<GpuState>,
    width: u32,
    height: u32,
}

impl GpuRasterizer {
    /// Create a headless device and the render targets.
    pub fn new(width: u32, height: u32) -> Result<Self, RenderError> {
        pollster::block_on(Self::new_async(width.max(1), height.max(1)))
    }

    async fn new_async(width: u32, height: u32) -> Result<Self, RenderError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(RenderError::NoAdapter)?;

        log::info!("Using GPU: {}", adapter.get_info().name);
        log::info!("Backend: {:?}", adapter.get_info().backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Dental AR Offscreen Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| RenderError::Device(e.to_string()))?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Scene Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/scene.wgsl").into()),
        });

        let uniform_size = std::mem::size_of::<DrawUniforms>() as u64;
        let uniform_stride = align_to(
            uniform_size,
            device.limits().min_uniform_buffer_offset_alignment as u64,
        );

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Scene Bind Group Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: wgpu::BufferSize::new(uniform_size),
                },
                count: None,
            }],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Scene Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let make_pipeline = |label: &str, blend: wgpu::BlendState, depth_write: bool| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    buffers: &[MeshVertex::buffer_layout()],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: COLOR_FORMAT,
                        blend: Some(blend),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None, // scan meshes are open surfaces
                    unclipped_depth: false,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    conservative: false,
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: depth_write,
                    depth_compare: wgpu::CompareFunction::Less,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        };
        let opaque_pipeline = make_pipeline("Scene Opaque Pipeline", wgpu::BlendState::REPLACE, true);
        let blend_pipeline = make_pipeline(
            "Scene Blend Pipeline",
            wgpu::BlendState::ALPHA_BLENDING,
            false,
        );

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Scene Uniform Buffer"),
            size: uniform_stride * MAX_DRAWS as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Scene Bind Group"),
            layout: &bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &uniform_buffer,
                    offset: 0,
                    size: wgpu::BufferSize::new(uniform_size),
                }),
            }],
        });

        let extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let color_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Scene Color Texture"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: COLOR_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let depth_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Scene Depth Texture"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });

        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Scene Readback Buffer"),
            size: padded_bytes_per_row(width) as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let state = GpuState {
            color_view: color_texture.create_view(&Default::default()),
            depth_view: depth_texture.create_view(&Default::default()),
            color_texture,
            device,
            queue,
            opaque_pipeline,
            blend_pipeline,
            uniform_buffer,
            uniform_stride,
            bind_group,
            readback,
            meshes: Vec::new(),
        };

        Ok(Self {
            state: Some(state),
            width,
            height,
        })
    }

    fn state(&self) -> Result<&GpuState, RenderError> {
        self.state.as_ref().ok_or(RenderError::Released)
    }

    fn read_back(&self, state: &GpuState) -> Result<RgbImage, RenderError> {
        let slice = state.readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = state.device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|e| RenderError::Readback(e.to_string()))?
            .map_err(|e| RenderError::Readback(e.to_string()))?;

        let image = {
            let data = slice.get_mapped_range();
            unpad_rgba(&data, self.width, self.height, padded_bytes_per_row(self.width))
        };
        state.readback.unmap();
        image.ok_or_else(|| RenderError::Readback("mapped buffer too small".to_string()))
    }
}

impl Rasterizer for GpuRasterizer {
    fn upload_mesh(&mut self, mesh: &TriMesh) -> Result<MeshHandle, RenderError> {
        let state = self.state.as_mut().ok_or(RenderError::Released)?;
        let vertices = mesh.vertices();
        let vertex_buffer = state
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Scene Vertex Buffer"),
                contents: bytemuck::cast_slice(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let index_buffer = state
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Scene Index Buffer"),
                contents: bytemuck::cast_slice(&mesh.indices),
                usage: wgpu::BufferUsages::INDEX,
            });
        state.meshes.push(GpuMesh {
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices.len() as u32,
        });
        Ok(MeshHandle((state.meshes.len() - 1) as u32))
    }

    fn draw(&mut self, scene: &Scene) -> Result<RgbImage, RenderError> {
        let state = self.state()?;
        let (uniforms, _) = pack_uniforms(scene, state.uniform_stride)?;
        if !uniforms.is_empty() {
            state.queue.write_buffer(&state.uniform_buffer, 0, &uniforms);
        }

        let nodes: Vec<_> = scene.draw_order().collect();
        let mut encoder = state
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Scene Encoder"),
            });

        {
            let bg = scene.background_vec();
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Scene Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &state.color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: bg.x as f64,
                            g: bg.y as f64,
                            b: bg.z as f64,
                            a: 1.0,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &state.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Discard,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            let mut blending = false;
            pass.set_pipeline(&state.opaque_pipeline);
            for (slot, node) in nodes.iter().enumerate() {
                let mesh = state
                    .meshes
                    .get(node.mesh.index())
                    .ok_or(RenderError::UnknownMesh(node.mesh))?;
                if node.material.blend && !blending {
                    pass.set_pipeline(&state.blend_pipeline);
                    blending = true;
                }
                let offset = (slot as u64 * state.uniform_stride) as u32;
                pass.set_bind_group(0, &state.bind_group, &[offset]);
                pass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
                pass.set_index_buffer(mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
                pass.draw_indexed(0..mesh.index_count, 0, 0..1);
            }
        }

        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &state.color_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &state.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row(self.width)),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        state.queue.submit(Some(encoder.finish()));

        self.read_back(state)
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn release(&mut self) {
        if let Some(state) = self.state.take() {
            for mesh in &state.meshes {
                mesh.vertex_buffer.destroy();
                mesh.index_buffer.destroy();
            }
            state.readback.destroy();
            state.uniform_buffer.destroy();
            state.color_texture.destroy();
            log::info!("Offscreen render context released");
        }
    }
}

impl Drop for GpuRasterizer {
    fn drop(&mut self) {
        self.release();
    }
}
