// src/pyramid.rs
//! # Hi‑Z depth pyramid
//!
//! Builds the max‑reduced mip chain the culling pass tests against.
//!
//! * **Level 0** is seeded from the depth attachment, bound as an unfilterable
//!   `texture_2d<f32>` so the GL backend can load from it. The base
//!   is the attachment size rounded down to powers of two, so one base texel covers
//!   between one and three depth texels per axis; the seed takes the max over all of
//!   them so no occluder depth is under‑estimated.
//! * **Level i** is the max of the 2×2 block of level i−1, clamped at the edge when
//!   the source is a single texel wide or tall.
//!
//! Every level is its own compute pass writing its own single‑mip texture: wgpu
//! orders level i's storage writes before level i+1's reads at pass boundaries, and
//! the finished levels are copied into the sampled mip chain at the end. Workgroups are 16×16 and each invocation
//! writes a 2×2 texel block, so the grid is `ceil(w / 32) × ceil(h / 32)`.
//!
//! [`CpuDepthPyramid`] performs the identical reduction on the host.

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};
use crate::gpu::resources::{level_extent, mip_level_count, pyramid_base_extent, PYRAMID_FORMAT};
use crate::gpu::{BindingTable, GpuBuffer, GpuDevice, PyramidImage};

/// Texels per workgroup along each axis (16 invocations × 2 texels).
pub const TEXELS_PER_GROUP: u32 = 32;

/// Workgroup grid for a level of `width × height`.
#[inline]
pub fn dispatch_grid(width: u32, height: u32) -> (u32, u32) {
    (width.div_ceil(TEXELS_PER_GROUP), height.div_ceil(TEXELS_PER_GROUP))
}

/// Per‑level shader parameters (`LevelParams` in the WGSL below).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct LevelParams {
    pub width: u32,
    pub height: u32,
    pub src_width: u32,
    pub src_height: u32,
}

/// Source texel span `[first, last]` covered by destination texel `x` when a
/// `src`‑wide image is reduced onto a `dst`‑wide one (`dst <= src`).
#[inline]
fn footprint(x: u32, dst: u32, src: u32) -> (u32, u32) {
    let first = x * src / dst;
    let last = ((x + 1) * src).div_ceil(dst).saturating_sub(1).min(src - 1);
    (first, last.max(first))
}

// ---------------------------------------------------------------------------
// CPU reference
// ---------------------------------------------------------------------------

/// Host copy of a depth pyramid, built with exactly the shader's reduction.
#[derive(Clone, Debug)]
pub struct CpuDepthPyramid {
    width: u32,
    height: u32,
    levels: Vec<Vec<f32>>,
}

impl CpuDepthPyramid {
    /// Reduce a row‑major `depth_width × depth_height` depth image.
    pub fn from_depth(depth: &[f32], depth_width: u32, depth_height: u32) -> Result<Self> {
        if depth_width == 0 || depth_height == 0 {
            return Err(Error::custom("depth image has a zero dimension"));
        }
        let expected = depth_width as usize * depth_height as usize;
        if depth.len() != expected {
            return Err(Error::custom(format!(
                "depth image holds {} texels, expected {expected}",
                depth.len()
            )));
        }

        let (width, height) = pyramid_base_extent(depth_width, depth_height);
        let count = mip_level_count(width, height);
        let mut levels = Vec::with_capacity(count as usize);

        let mut base = vec![0.0f32; width as usize * height as usize];
        for y in 0..height {
            let (y0, y1) = footprint(y, height, depth_height);
            for x in 0..width {
                let (x0, x1) = footprint(x, width, depth_width);
                let mut max_depth = 0.0f32;
                for sy in y0..=y1 {
                    let row = sy as usize * depth_width as usize;
                    for sx in x0..=x1 {
                        max_depth = max_depth.max(depth[row + sx as usize]);
                    }
                }
                base[(y * width + x) as usize] = max_depth;
            }
        }
        levels.push(base);

        for level in 1..count {
            let (w, h) = level_extent(width, height, level);
            let (sw, sh) = level_extent(width, height, level - 1);
            let src = &levels[level as usize - 1];
            let mut dst = vec![0.0f32; w as usize * h as usize];
            for y in 0..h {
                for x in 0..w {
                    let mut max_depth = 0.0f32;
                    for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                        let sx = (x * 2 + dx).min(sw - 1);
                        let sy = (y * 2 + dy).min(sh - 1);
                        max_depth = max_depth.max(src[(sy * sw + sx) as usize]);
                    }
                    dst[(y * w + x) as usize] = max_depth;
                }
            }
            levels.push(dst);
        }

        Ok(Self { width, height, levels })
    }

    #[inline]
    pub fn levels(&self) -> u32 {
        self.levels.len() as u32
    }

    /// Level‑0 extent.
    #[inline]
    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[inline]
    pub fn level_extent(&self, level: u32) -> (u32, u32) {
        level_extent(self.width, self.height, level)
    }

    /// Row‑major texels of `level`.
    pub fn level(&self, level: u32) -> Option<&[f32]> {
        self.levels.get(level as usize).map(Vec::as_slice)
    }

    /// Texel load with coordinates clamped to the level, like `textureLoad` on a
    /// clamped coordinate.
    pub fn load(&self, level: u32, x: u32, y: u32) -> f32 {
        let level = level.min(self.levels() - 1);
        let (w, h) = self.level_extent(level);
        let (x, y) = (x.min(w - 1), y.min(h - 1));
        self.levels[level as usize][(y * w + x) as usize]
    }
}

// ---------------------------------------------------------------------------
// GPU builder
// ---------------------------------------------------------------------------

struct LevelPass {
    // Kept alive for the bind group.
    _params: GpuBuffer,
    bind_group: wgpu::BindGroup,
    extent: (u32, u32),
}

/// Records the per‑level reduction passes into a caller's encoder.
///
/// Pipelines are created once; the per‑level uniforms and bind groups are
/// recreated by [`PyramidBuilder::rebind`] whenever the pyramid or the depth
/// attachment changes.
pub struct PyramidBuilder {
    seed_pipeline: wgpu::ComputePipeline,
    reduce_pipeline: wgpu::ComputePipeline,
    seed_table: BindingTable,
    seed_layout: wgpu::BindGroupLayout,
    reduce_table: BindingTable,
    reduce_layout: wgpu::BindGroupLayout,
    passes: Vec<LevelPass>,
}

impl PyramidBuilder {
    pub fn new(gpu: &GpuDevice) -> Result<Self> {
        gpu.scoped("depth pyramid pipelines", |device| {
            let (seed_table, seed_layout) = BindingTable::builder("pyramid_seed_bgl")
                .uniform("params")
                .float_texture("src_depth")
                .storage_texture("dst_level", PYRAMID_FORMAT)
                .build(device);
            let (reduce_table, reduce_layout) = BindingTable::builder("pyramid_reduce_bgl")
                .uniform("params")
                .float_texture("src_level")
                .storage_texture("dst_level", PYRAMID_FORMAT)
                .build(device);

            let seed_pipeline = compute_pipeline(device, "pyramid_seed", PYRAMID_SEED_WGSL, &seed_layout);
            let reduce_pipeline =
                compute_pipeline(device, "pyramid_reduce", PYRAMID_REDUCE_WGSL, &reduce_layout);

            Self {
                seed_pipeline,
                reduce_pipeline,
                seed_table,
                seed_layout,
                reduce_table,
                reduce_layout,
                passes: Vec::new(),
            }
        })
    }

    /// Rebuild per‑level parameters and bind groups for `pyramid`, seeded from
    /// `depth_view` (`depth_width × depth_height`, must carry `TEXTURE_BINDING`).
    pub fn rebind(
        &mut self,
        gpu: &GpuDevice,
        pyramid: &PyramidImage,
        depth_view: &wgpu::TextureView,
        depth_width: u32,
        depth_height: u32,
    ) -> Result<()> {
        let passes = gpu.scoped("depth pyramid bind groups", |device| -> Result<Vec<LevelPass>> {
            let mut passes = Vec::with_capacity(pyramid.levels() as usize);
            for level in 0..pyramid.levels() {
                let (width, height) = pyramid.level_extent(level);
                let (src_width, src_height) = if level == 0 {
                    (depth_width, depth_height)
                } else {
                    pyramid.level_extent(level - 1)
                };

                let params = GpuBuffer::uniform::<LevelParams>(device, format!("pyramid_params_{level}"));
                params.write(
                    &gpu.queue,
                    &[LevelParams {
                        width,
                        height,
                        src_width,
                        src_height,
                    }],
                );

                let dst = pyramid
                    .level_view(level)
                    .ok_or_else(|| Error::custom(format!("pyramid level {level} has no view")))?;
                let label = format!("pyramid_level_{level}_bg");
                let bind_group = if level == 0 {
                    self.seed_table.bind_group(
                        device,
                        &self.seed_layout,
                        &label,
                        &[
                            ("params", params.binding()),
                            ("src_depth", wgpu::BindingResource::TextureView(depth_view)),
                            ("dst_level", wgpu::BindingResource::TextureView(dst)),
                        ],
                    )?
                } else {
                    let src = pyramid
                        .level_view(level - 1)
                        .ok_or_else(|| Error::custom(format!("pyramid level {} has no view", level - 1)))?;
                    self.reduce_table.bind_group(
                        device,
                        &self.reduce_layout,
                        &label,
                        &[
                            ("params", params.binding()),
                            ("src_level", wgpu::BindingResource::TextureView(src)),
                            ("dst_level", wgpu::BindingResource::TextureView(dst)),
                        ],
                    )?
                };

                passes.push(LevelPass {
                    _params: params,
                    bind_group,
                    extent: (width, height),
                });
            }
            Ok(passes)
        })??;

        log::debug!("Pyramid builder bound {} levels", passes.len());
        self.passes = passes;
        Ok(())
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        !self.passes.is_empty()
    }

    /// Record one compute pass per level, level 0 first, then copy the levels into
    /// `pyramid`'s mip chain. `pyramid` must be the image passed to the last rebind.
    pub fn record(&self, encoder: &mut wgpu::CommandEncoder, pyramid: &PyramidImage) -> Result<()> {
        if !self.is_bound() {
            return Err(Error::msg("depth pyramid recorded before resize bound a depth attachment"));
        }
        if pyramid.levels() as usize != self.passes.len() || pyramid.extent() != self.passes[0].extent {
            return Err(Error::custom(format!(
                "pyramid {:?} with {} levels was not the one bound ({} levels)",
                pyramid.extent(),
                pyramid.levels(),
                self.passes.len()
            )));
        }
        for (level, pass) in self.passes.iter().enumerate() {
            let pipeline = if level == 0 {
                &self.seed_pipeline
            } else {
                &self.reduce_pipeline
            };
            let (gx, gy) = dispatch_grid(pass.extent.0, pass.extent.1);

            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("depth_pyramid_level"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(pipeline);
            cpass.set_bind_group(0, &pass.bind_group, &[]);
            cpass.dispatch_workgroups(gx, gy, 1);
        }
        pyramid.resolve(encoder);
        Ok(())
    }
}

pub(crate) fn compute_pipeline(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    layout: &wgpu::BindGroupLayout,
) -> wgpu::ComputePipeline {
    let [pipeline] = compute_pipelines(device, label, source, layout, [label]);
    pipeline
}

/// One pipeline per entry point of a single WGSL module, all sharing `layout`.
pub(crate) fn compute_pipelines<const N: usize>(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    layout: &wgpu::BindGroupLayout,
    entry_points: [&str; N],
) -> [wgpu::ComputePipeline; N] {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });
    entry_points.map(|entry| {
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some(entry),
            compilation_options: Default::default(),
            cache: None,
        })
    })
}

// ---------------------------------------------------------------------------
// Embedded WGSL
// ---------------------------------------------------------------------------

const PYRAMID_SEED_WGSL: &str = r#"
struct LevelParams {
    width: u32,
    height: u32,
    src_width: u32,
    src_height: u32,
};

@group(0) @binding(0) var<uniform> params: LevelParams;
@group(0) @binding(1) var src_depth: texture_2d<f32>;
@group(0) @binding(2) var dst_level: texture_storage_2d<r32float, write>;

fn footprint(x: u32, dst: u32, src: u32) -> vec2<u32> {
    let first = x * src / dst;
    let last = min(((x + 1u) * src + dst - 1u) / dst - 1u, src - 1u);
    return vec2<u32>(first, max(first, last));
}

@compute @workgroup_size(16, 16)
fn pyramid_seed(@builtin(global_invocation_id) gid: vec3<u32>) {
    for (var i = 0u; i < 4u; i = i + 1u) {
        let dst = gid.xy * 2u + vec2<u32>(i & 1u, i >> 1u);
        if (dst.x >= params.width || dst.y >= params.height) { continue; }

        let fx = footprint(dst.x, params.width, params.src_width);
        let fy = footprint(dst.y, params.height, params.src_height);
        var max_depth = 0.0;
        for (var sy = fy.x; sy <= fy.y; sy = sy + 1u) {
            for (var sx = fx.x; sx <= fx.y; sx = sx + 1u) {
                max_depth = max(max_depth, textureLoad(src_depth, vec2<u32>(sx, sy), 0).x);
            }
        }
        textureStore(dst_level, dst, vec4<f32>(max_depth, 0.0, 0.0, 0.0));
    }
}
"#;

const PYRAMID_REDUCE_WGSL: &str = r#"
struct LevelParams {
    width: u32,
    height: u32,
    src_width: u32,
    src_height: u32,
};

@group(0) @binding(0) var<uniform> params: LevelParams;
@group(0) @binding(1) var src_level: texture_2d<f32>;
@group(0) @binding(2) var dst_level: texture_storage_2d<r32float, write>;

@compute @workgroup_size(16, 16)
fn pyramid_reduce(@builtin(global_invocation_id) gid: vec3<u32>) {
    let src_max = vec2<u32>(params.src_width - 1u, params.src_height - 1u);
    for (var i = 0u; i < 4u; i = i + 1u) {
        let dst = gid.xy * 2u + vec2<u32>(i & 1u, i >> 1u);
        if (dst.x >= params.width || dst.y >= params.height) { continue; }

        let base = dst * 2u;
        let d00 = textureLoad(src_level, min(base, src_max), 0).x;
        let d10 = textureLoad(src_level, min(base + vec2<u32>(1u, 0u), src_max), 0).x;
        let d01 = textureLoad(src_level, min(base + vec2<u32>(0u, 1u), src_max), 0).x;
        let d11 = textureLoad(src_level, min(base + vec2<u32>(1u, 1u), src_max), 0).x;
        textureStore(dst_level, dst, vec4<f32>(max(max(d00, d10), max(d01, d11)), 0.0, 0.0, 0.0));
    }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(w: u32, h: u32) -> Vec<f32> {
        (0..w * h).map(|i| ((i * 37) % 101) as f32 / 100.0).collect()
    }

    #[test]
    fn dispatch_grid_covers_two_texels_per_invocation() {
        assert_eq!(dispatch_grid(1024, 512), (32, 16));
        assert_eq!(dispatch_grid(33, 1), (2, 1));
        assert_eq!(dispatch_grid(1, 1), (1, 1));
    }

    #[test]
    fn footprint_spans_at_most_three_texels() {
        // 1080 -> 1024: ratio just above one.
        for x in 0..1024 {
            let (a, b) = footprint(x, 1024, 1080);
            assert!(b >= a && b - a <= 2, "x={x} -> {a}..={b}");
            assert!(b < 1080);
        }
        // Identity when sizes match.
        assert_eq!(footprint(5, 8, 8), (5, 5));
    }

    #[test]
    fn level_zero_matches_source_at_power_of_two_size() {
        let depth = ramp(8, 4);
        let pyr = CpuDepthPyramid::from_depth(&depth, 8, 4).unwrap();
        assert_eq!(pyr.extent(), (8, 4));
        assert_eq!(pyr.levels(), 4);
        assert_eq!(pyr.level(0).unwrap(), depth.as_slice());
    }

    #[test]
    fn level_zero_takes_max_over_footprint() {
        // 3x3 -> 2x2; centre texel is shared by all four base texels.
        let mut depth = vec![0.1f32; 9];
        depth[4] = 0.9;
        let pyr = CpuDepthPyramid::from_depth(&depth, 3, 3).unwrap();
        assert_eq!(pyr.extent(), (2, 2));
        assert!(pyr.level(0).unwrap().iter().all(|&d| d == 0.9));
    }

    #[test]
    fn every_level_is_the_edge_clamped_2x2_max_of_the_previous() {
        let depth = ramp(37, 19);
        let pyr = CpuDepthPyramid::from_depth(&depth, 37, 19).unwrap();
        assert_eq!(pyr.extent(), (32, 16));
        assert_eq!(pyr.levels(), mip_level_count(32, 16));

        for level in 1..pyr.levels() {
            let (w, h) = pyr.level_extent(level);
            assert_eq!((w, h), level_extent(32, 16, level));
            for y in 0..h {
                for x in 0..w {
                    let expected = [(0, 0), (1, 0), (0, 1), (1, 1)]
                        .iter()
                        .map(|(dx, dy)| pyr.load(level - 1, x * 2 + dx, y * 2 + dy))
                        .fold(0.0f32, f32::max);
                    assert_eq!(pyr.load(level, x, y), expected, "level {level} ({x},{y})");
                }
            }
        }
        let (w, h) = pyr.level_extent(pyr.levels() - 1);
        assert_eq!((w, h), (1, 1));
        let global_max = depth.iter().copied().fold(0.0f32, f32::max);
        assert_eq!(pyr.load(pyr.levels() - 1, 0, 0), global_max);
    }

    #[test]
    fn rejects_mismatched_input() {
        assert!(CpuDepthPyramid::from_depth(&[0.0; 5], 2, 2).is_err());
        assert!(CpuDepthPyramid::from_depth(&[], 0, 4).is_err());
    }

    #[test]
    fn pyramid_shaders_validate_for_every_backend() {
        use naga::ShaderStage::Compute;
        crate::gpu::assert_wgsl_valid("pyramid_seed", PYRAMID_SEED_WGSL, Compute, &["pyramid_seed"]);
        crate::gpu::assert_wgsl_valid("pyramid_reduce", PYRAMID_REDUCE_WGSL, Compute, &["pyramid_reduce"]);
    }

    #[test]
    fn depth_source_is_read_as_float_texture() {
        // GL cannot texelFetch a depth sampler.
        assert!(!PYRAMID_SEED_WGSL.contains("texture_depth_2d"));
        assert!(PYRAMID_SEED_WGSL.contains("var src_depth: texture_2d<f32>"));
    }
}
