// src/depth_prepass.rs
//! Depth‑only box rasterizer.
//!
//! Draws every [`ObjectBound`] as a solid box into a `Depth32Float` attachment. It
//! stands in for the main geometry pass wherever there is no real renderer (the
//! demo binary and the GPU tests) so the pyramid has depth to reduce.

use glam::Mat4;

use crate::culling::ObjectBound;
use crate::error::{Error, Result};
use crate::gpu::{GpuBuffer, GpuDevice};

pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Depth attachment the pyramid can read: `RENDER_ATTACHMENT | TEXTURE_BINDING`.
pub struct DepthTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

impl DepthTarget {
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let (width, height) = (width.max(1), height.max(1));
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("depth_target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            width,
            height,
        }
    }

    #[inline]
    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    #[inline]
    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for DepthTarget {
    fn drop(&mut self) {
        self.texture.destroy();
    }
}

pub struct DepthPrepass {
    pipeline: wgpu::RenderPipeline,
    camera: GpuBuffer,
    bind_group: wgpu::BindGroup,
    boxes: GpuBuffer,
    capacity: u32,
    count: u32,
}

impl DepthPrepass {
    pub fn new(gpu: &GpuDevice, capacity: u32) -> Result<Self> {
        gpu.scoped("depth prepass", |device| {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("depth_prepass"),
                source: wgpu::ShaderSource::Wgsl(DEPTH_PREPASS_WGSL.into()),
            });

            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("depth_prepass_bgl"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });
            let camera = GpuBuffer::uniform::<[[f32; 4]; 4]>(device, "depth_prepass_camera");
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("depth_prepass_bg"),
                layout: &layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: camera.binding(),
                }],
            });
            let boxes = GpuBuffer::new(
                device,
                "depth_prepass_boxes",
                std::mem::size_of::<ObjectBound>() as u64 * capacity.max(1) as u64,
                wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            );

            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("depth_prepass_layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("depth_prepass_pipeline"),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: std::mem::size_of::<ObjectBound>() as u64,
                        step_mode: wgpu::VertexStepMode::Instance,
                        attributes: &wgpu::vertex_attr_array![0 => Float32x4, 1 => Float32x4],
                    }],
                },
                fragment: None,
                primitive: wgpu::PrimitiveState {
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::Less,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });

            Self {
                pipeline,
                camera,
                bind_group,
                boxes,
                capacity: capacity.max(1),
                count: 0,
            }
        })
    }

    /// Replace the boxes drawn by [`DepthPrepass::record`].
    pub fn set_boxes(&mut self, queue: &wgpu::Queue, boxes: &[ObjectBound]) -> Result<()> {
        let count = boxes.len() as u32;
        if count > self.capacity {
            return Err(Error::CapacityExceeded {
                requested: count,
                capacity: self.capacity,
            });
        }
        self.boxes.write(queue, boxes);
        self.count = count;
        Ok(())
    }

    /// Clear `target` to 1.0 and draw the boxes with `view_proj`. The matrix is a
    /// queue write, so one recording per submit.
    pub fn record(
        &self,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        target: &DepthTarget,
        view_proj: &Mat4,
    ) {
        self.camera.write(queue, &[view_proj.to_cols_array_2d()]);

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("depth_prepass"),
            color_attachments: &[],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: target.view(),
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        if self.count == 0 {
            return;
        }
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.bind_group, &[]);
        pass.set_vertex_buffer(0, self.boxes.raw().slice(..));
        pass.draw(0..36, 0..self.count);
    }
}

const DEPTH_PREPASS_WGSL: &str = r#"
@group(0) @binding(0) var<uniform> view_proj: mat4x4<f32>;

// Corner bits: 1 = max x, 2 = max y, 4 = max z.
var<private> CUBE: array<u32, 36> = array<u32, 36>(
    0u, 2u, 6u,  0u, 6u, 4u,
    1u, 5u, 7u,  1u, 7u, 3u,
    0u, 4u, 5u,  0u, 5u, 1u,
    2u, 3u, 7u,  2u, 7u, 6u,
    0u, 1u, 3u,  0u, 3u, 2u,
    4u, 6u, 7u,  4u, 7u, 5u,
);

@vertex
fn vs_main(
    @builtin(vertex_index) vi: u32,
    @location(0) box_min: vec4<f32>,
    @location(1) box_max: vec4<f32>,
) -> @builtin(position) vec4<f32> {
    let c = CUBE[vi];
    let p = vec3<f32>(
        select(box_min.x, box_max.x, (c & 1u) != 0u),
        select(box_min.y, box_max.y, (c & 2u) != 0u),
        select(box_min.z, box_max.z, (c & 4u) != 0u),
    );
    return view_proj * vec4<f32>(p, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepass_shader_validates_for_every_backend() {
        crate::gpu::assert_wgsl_valid("depth_prepass", DEPTH_PREPASS_WGSL, naga::ShaderStage::Vertex, &["vs_main"]);
    }
}
