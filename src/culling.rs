//! # Hi‑Z visibility test
//!
//! One compute module, two entry points sharing one bind group layout:
//!
//! * `cull_early` – tests every object against the pyramid built from the
//!   previous frame's depth.
//! * `cull_late` – keeps every flag the early pass set to 1 and re‑tests only the
//!   hidden objects against the pyramid rebuilt from this frame's depth.
//!
//! Per object the shader (and [`test_object`], its host mirror):
//!
//! 1. transforms the 8 AABB corners into view space,
//! 2. *frustum*: rejects the box when every corner lies outside one side plane, or
//!    the whole box is in front of `znear` / behind `zfar`,
//! 3. *occlusion*: boxes crossing the near plane are visible. Otherwise the corners
//!    are projected with `p00`/`p11`, the nearest depth of the box is computed, the
//!    mip whose texels cover the screen rectangle is chosen and the (≤ 2×2) covering
//!    texels are max‑reduced. The box is hidden when its nearest depth is farther
//!    than that occluder depth.
//!
//! The two tests are toggled independently through [`MiscFlags`].
//!
//! ---------------------------------------------------------------------------

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::camera::near_far_from_projection;
use crate::error::{Error, Result};
use crate::gpu::{BindingTable, GpuDevice};
use crate::pyramid::{compute_pipelines, CpuDepthPyramid};

/// Threads per culling workgroup.
pub const CULL_WORKGROUP_SIZE: u32 = 256;

/// 1D grid for `object_count` objects: `ceil(n / 256)`.
#[inline]
pub fn dispatch_groups(object_count: u32) -> u32 {
    object_count.div_ceil(CULL_WORKGROUP_SIZE)
}

// ---------------------------------------------------------------------------
// GPU data layouts
// ---------------------------------------------------------------------------

/// World‑space AABB of one chunk plus its packed instance count.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ObjectBound {
    /// `(x, y, z, 1)`
    pub min: [f32; 4],
    /// `(x, y, z, 1)`
    pub max: [f32; 4],
    pub instance_count: u32,
    pub _pad: [u32; 3],
}

impl ObjectBound {
    pub fn new(min: Vec3, max: Vec3, instance_count: u32) -> Self {
        Self {
            min: min.extend(1.0).to_array(),
            max: max.extend(1.0).to_array(),
            instance_count,
            _pad: [0; 3],
        }
    }

    #[inline]
    pub fn min(&self) -> Vec3 {
        Vec4::from_array(self.min).truncate()
    }

    #[inline]
    pub fn max(&self) -> Vec3 {
        Vec4::from_array(self.max).truncate()
    }

    /// Corner `i` (bit 0 → x, bit 1 → y, bit 2 → z pick the max side).
    #[inline]
    pub fn corner(&self, i: u32) -> Vec3 {
        let (lo, hi) = (self.min(), self.max());
        Vec3::new(
            if i & 1 != 0 { hi.x } else { lo.x },
            if i & 2 != 0 { hi.y } else { lo.y },
            if i & 4 != 0 { hi.z } else { lo.z },
        )
    }
}

/// Per‑frame culling uniform.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CullingFrameData {
    /// View‑space planes: left, right, bottom, top, near, far.
    pub planes: [[f32; 4]; 6],
    pub znear: f32,
    pub zfar: f32,
    pub p00: f32,
    pub p11: f32,
    pub pyramid_width: u32,
    pub pyramid_height: u32,
    pub object_count: u32,
    pub pyramid_levels: u32,
}

impl CullingFrameData {
    pub fn from_projection(
        proj: &Mat4,
        pyramid_width: u32,
        pyramid_height: u32,
        object_count: u32,
        pyramid_levels: u32,
    ) -> Self {
        let (znear, zfar) = near_far_from_projection(proj);
        Self {
            planes: frustum_planes(proj).map(|p| p.to_array()),
            znear,
            zfar,
            p00: proj.x_axis.x,
            p11: proj.y_axis.y,
            pyramid_width,
            pyramid_height,
            object_count,
            pyramid_levels,
        }
    }

    #[inline]
    pub fn plane(&self, i: usize) -> Vec4 {
        Vec4::from_array(self.planes[i])
    }
}

/// Test toggles, one `u32` each so the struct is a valid uniform.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct MiscFlags {
    pub occlusion_enabled: u32,
    pub frustum_enabled: u32,
    pub _pad: [u32; 2],
}

impl MiscFlags {
    pub fn new(occlusion_enabled: bool, frustum_enabled: bool) -> Self {
        Self {
            occlusion_enabled: occlusion_enabled as u32,
            frustum_enabled: frustum_enabled as u32,
            _pad: [0; 2],
        }
    }

    #[inline]
    pub fn occlusion(&self) -> bool {
        self.occlusion_enabled != 0
    }

    #[inline]
    pub fn frustum(&self) -> bool {
        self.frustum_enabled != 0
    }
}

impl Default for MiscFlags {
    fn default() -> Self {
        Self::new(true, true)
    }
}

/// View‑space frustum planes from the rows of `proj` (0..1 clip depth), each
/// normalized by the length of its normal.
pub fn frustum_planes(proj: &Mat4) -> [Vec4; 6] {
    let (r0, r1, r2, r3) = (proj.row(0), proj.row(1), proj.row(2), proj.row(3));
    [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|p| p / p.truncate().length().max(1e-6))
}

// ---------------------------------------------------------------------------
// Host results
// ---------------------------------------------------------------------------

/// Which dispatch produced a list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CullPass {
    Early,
    Late,
}

/// Compacted indices of visible objects for one pass of one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisibleIndexList {
    pub indices: Vec<u32>,
    pub pass: CullPass,
    pub frame: u64,
}

impl VisibleIndexList {
    pub fn empty(pass: CullPass, frame: u64) -> Self {
        Self {
            indices: Vec::new(),
            pass,
            frame,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.indices.iter().copied()
    }
}

/// Indices whose flag is 1.
pub fn compact(flags: &[u32]) -> Vec<u32> {
    flags
        .iter()
        .enumerate()
        .filter(|(_, &flag)| flag == 1)
        .map(|(i, _)| i as u32)
        .collect()
}

/// Indices visible after the late pass that the early pass had hidden.
pub fn compact_late(flags: &[u32], early: &[u32]) -> Vec<u32> {
    flags
        .iter()
        .enumerate()
        .filter(|&(i, &flag)| flag == 1 && early.get(i).copied() != Some(1))
        .map(|(i, _)| i as u32)
        .collect()
}

/// Reject a dispatch the buffers cannot hold.
pub fn check_capacity(object_count: u32, capacity: u32) -> Result<()> {
    if object_count > capacity {
        log::error!("culling {object_count} objects with buffers sized for {capacity}");
        return Err(Error::CapacityExceeded {
            requested: object_count,
            capacity,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Host mirror of the shader
// ---------------------------------------------------------------------------

/// The exact per‑object test `cull.wgsl` runs. With occlusion enabled and no
/// pyramid the occlusion step is skipped.
pub fn test_object(
    bound: &ObjectBound,
    view: &Mat4,
    frame: &CullingFrameData,
    misc: &MiscFlags,
    pyramid: Option<&CpuDepthPyramid>,
) -> bool {
    let corners: [Vec3; 8] = std::array::from_fn(|i| view.transform_point3(bound.corner(i as u32)));
    let d_min = corners.iter().map(|c| -c.z).fold(f32::MAX, f32::min);
    let d_max = corners.iter().map(|c| -c.z).fold(f32::MIN, f32::max);

    if misc.frustum() {
        for p in 0..4 {
            let plane = frame.plane(p);
            if corners.iter().all(|c| plane.truncate().dot(*c) + plane.w < 0.0) {
                return false;
            }
        }
        if d_max < frame.znear || d_min > frame.zfar {
            return false;
        }
    }

    let Some(pyramid) = pyramid.filter(|_| misc.occlusion()) else {
        return true;
    };
    if d_min < frame.znear {
        return true;
    }

    let mut lo = Vec2::splat(f32::MAX);
    let mut hi = Vec2::splat(f32::MIN);
    for c in &corners {
        let d = -c.z;
        let ndc = Vec2::new(frame.p00 * c.x / d, frame.p11 * c.y / d);
        lo = lo.min(ndc);
        hi = hi.max(ndc);
    }
    let uv_min = Vec2::new(lo.x * 0.5 + 0.5, 0.5 - hi.y * 0.5).clamp(Vec2::ZERO, Vec2::ONE);
    let uv_max = Vec2::new(hi.x * 0.5 + 0.5, 0.5 - lo.y * 0.5).clamp(Vec2::ZERO, Vec2::ONE);
    let nearest = frame.zfar * (d_min - frame.znear) / (d_min * (frame.zfar - frame.znear));

    let base = Vec2::new(frame.pyramid_width as f32, frame.pyramid_height as f32);
    let size = (uv_max - uv_min) * base;
    let max_level = frame.pyramid_levels.saturating_sub(1) as f32;
    let level = size.x.max(size.y).max(1.0).log2().ceil().clamp(0.0, max_level) as u32;

    let dims = Vec2::new(
        (frame.pyramid_width >> level).max(1) as f32,
        (frame.pyramid_height >> level).max(1) as f32,
    );
    let top = dims - Vec2::ONE;
    let t0 = (uv_min * dims).floor().min(top);
    let t1 = (uv_max * dims).floor().min(top);

    let occluder = [(t0.x, t0.y), (t1.x, t0.y), (t0.x, t1.y), (t1.x, t1.y)]
        .into_iter()
        .map(|(x, y)| pyramid.load(level, x as u32, y as u32))
        .fold(0.0f32, f32::max);

    nearest <= occluder
}

/// Host mirror of one dispatch. `previous` holds the early flags when mirroring
/// `cull_late`.
pub fn cull_objects(
    bounds: &[ObjectBound],
    view: &Mat4,
    frame: &CullingFrameData,
    misc: &MiscFlags,
    pyramid: Option<&CpuDepthPyramid>,
    previous: Option<&[u32]>,
) -> Vec<u32> {
    bounds
        .iter()
        .enumerate()
        .map(|(i, bound)| {
            if previous.and_then(|p| p.get(i)) == Some(&1) {
                1
            } else {
                test_object(bound, view, frame, misc, pyramid) as u32
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// GPU pipelines
// ---------------------------------------------------------------------------

/// `cull_early` / `cull_late` and the layout they share.
pub struct CullingPipelines {
    early: wgpu::ComputePipeline,
    late: wgpu::ComputePipeline,
    table: BindingTable,
    layout: wgpu::BindGroupLayout,
}

impl CullingPipelines {
    pub fn new(gpu: &GpuDevice) -> Result<Self> {
        gpu.scoped("culling pipelines", |device| {
            let (table, layout) = BindingTable::builder("cull_bgl")
                .uniform("camera")
                .storage("objects", true)
                .float_texture("depth_pyramid")
                .storage("visibility", false)
                .uniform("frame_data")
                .uniform("misc")
                .build(device);
            let [early, late] = compute_pipelines(device, "cull", CULL_WGSL, &layout, ["cull_early", "cull_late"]);
            Self {
                early,
                late,
                table,
                layout,
            }
        })
    }

    #[inline]
    pub fn table(&self) -> &BindingTable {
        &self.table
    }

    #[inline]
    pub fn layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }

    /// Record the dispatch. Nothing is recorded for zero objects.
    pub fn record(&self, encoder: &mut wgpu::CommandEncoder, bind_group: &wgpu::BindGroup, object_count: u32, pass: CullPass) {
        let groups = dispatch_groups(object_count);
        if groups == 0 {
            return;
        }
        let (pipeline, label) = match pass {
            CullPass::Early => (&self.early, "cull_early_pass"),
            CullPass::Late => (&self.late, "cull_late_pass"),
        };
        let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        cpass.set_pipeline(pipeline);
        cpass.set_bind_group(0, bind_group, &[]);
        cpass.dispatch_workgroups(groups, 1, 1);
    }
}

// ---------------------------------------------------------------------------
// Embedded WGSL
// ---------------------------------------------------------------------------

const CULL_WGSL: &str = r#"
struct CameraData {
    view: mat4x4<f32>,
    proj: mat4x4<f32>,
    inv_view: mat4x4<f32>,
};

struct ObjectBound {
    min: vec4<f32>,
    max: vec4<f32>,
    instance_count: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
};

struct CullingFrameData {
    planes: array<vec4<f32>, 6>,
    znear: f32,
    zfar: f32,
    p00: f32,
    p11: f32,
    pyramid_width: u32,
    pyramid_height: u32,
    object_count: u32,
    pyramid_levels: u32,
};

struct MiscFlags {
    occlusion_enabled: u32,
    frustum_enabled: u32,
    pad0: u32,
    pad1: u32,
};

@group(0) @binding(0) var<uniform> camera: CameraData;
@group(0) @binding(1) var<storage, read> objects: array<ObjectBound>;
@group(0) @binding(2) var depth_pyramid: texture_2d<f32>;
@group(0) @binding(3) var<storage, read_write> visibility: array<u32>;
@group(0) @binding(4) var<uniform> frame_data: CullingFrameData;
@group(0) @binding(5) var<uniform> misc: MiscFlags;

const BIG: f32 = 3.4e38;

fn corner(b: ObjectBound, i: u32) -> vec3<f32> {
    return vec3<f32>(
        select(b.min.x, b.max.x, (i & 1u) != 0u),
        select(b.min.y, b.max.y, (i & 2u) != 0u),
        select(b.min.z, b.max.z, (i & 4u) != 0u),
    );
}

fn is_visible(b: ObjectBound) -> bool {
    var corners: array<vec3<f32>, 8>;
    var d_min = BIG;
    var d_max = -BIG;
    for (var i = 0u; i < 8u; i = i + 1u) {
        let v = (camera.view * vec4<f32>(corner(b, i), 1.0)).xyz;
        corners[i] = v;
        d_min = min(d_min, -v.z);
        d_max = max(d_max, -v.z);
    }

    if (misc.frustum_enabled != 0u) {
        for (var p = 0u; p < 4u; p = p + 1u) {
            let plane = frame_data.planes[p];
            var outside = 0u;
            for (var i = 0u; i < 8u; i = i + 1u) {
                if (dot(plane.xyz, corners[i]) + plane.w < 0.0) {
                    outside = outside + 1u;
                }
            }
            if (outside == 8u) { return false; }
        }
        if (d_max < frame_data.znear || d_min > frame_data.zfar) { return false; }
    }

    if (misc.occlusion_enabled == 0u || d_min < frame_data.znear) { return true; }

    var lo = vec2<f32>(BIG);
    var hi = vec2<f32>(-BIG);
    for (var i = 0u; i < 8u; i = i + 1u) {
        let c = corners[i];
        let d = -c.z;
        let ndc = vec2<f32>(frame_data.p00 * c.x / d, frame_data.p11 * c.y / d);
        lo = min(lo, ndc);
        hi = max(hi, ndc);
    }
    let uv_min = clamp(vec2<f32>(lo.x * 0.5 + 0.5, 0.5 - hi.y * 0.5), vec2<f32>(0.0), vec2<f32>(1.0));
    let uv_max = clamp(vec2<f32>(hi.x * 0.5 + 0.5, 0.5 - lo.y * 0.5), vec2<f32>(0.0), vec2<f32>(1.0));
    let nearest = frame_data.zfar * (d_min - frame_data.znear) / (d_min * (frame_data.zfar - frame_data.znear));

    let base = vec2<u32>(frame_data.pyramid_width, frame_data.pyramid_height);
    let size = (uv_max - uv_min) * vec2<f32>(base);
    let max_level = f32(max(frame_data.pyramid_levels, 1u) - 1u);
    let level = u32(clamp(ceil(log2(max(max(size.x, size.y), 1.0))), 0.0, max_level));

    let dims = max(base >> vec2<u32>(level), vec2<u32>(1u));
    let top = vec2<f32>(dims - vec2<u32>(1u));
    let t0 = vec2<u32>(min(floor(uv_min * vec2<f32>(dims)), top));
    let t1 = vec2<u32>(min(floor(uv_max * vec2<f32>(dims)), top));

    let mip = i32(level);
    let occluder = max(
        max(textureLoad(depth_pyramid, t0, mip).x, textureLoad(depth_pyramid, vec2<u32>(t1.x, t0.y), mip).x),
        max(textureLoad(depth_pyramid, vec2<u32>(t0.x, t1.y), mip).x, textureLoad(depth_pyramid, t1, mip).x),
    );
    return nearest <= occluder;
}

@compute @workgroup_size(256)
fn cull_early(@builtin(global_invocation_id) gid: vec3<u32>) {
    let idx = gid.x;
    if (idx >= frame_data.object_count) { return; }
    visibility[idx] = select(0u, 1u, is_visible(objects[idx]));
}

@compute @workgroup_size(256)
fn cull_late(@builtin(global_invocation_id) gid: vec3<u32>) {
    let idx = gid.x;
    if (idx >= frame_data.object_count) { return; }
    if (visibility[idx] == 1u) { return; }
    visibility[idx] = select(0u, 1u, is_visible(objects[idx]));
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;

    const ZNEAR: f32 = 0.1;
    const ZFAR: f32 = 100.0;

    fn facing_camera() -> Camera {
        Camera::new(Vec3::new(0.0, 0.0, -10.0), 0.0, 0.0, 90f32.to_radians(), 1.0, ZNEAR, ZFAR)
    }

    fn unit_box() -> ObjectBound {
        ObjectBound::new(Vec3::splat(-1.0), Vec3::splat(1.0), 1)
    }

    /// Depth buffer value of a surface at view distance `d`.
    fn depth_at(d: f32) -> f32 {
        ZFAR * (d - ZNEAR) / (d * (ZFAR - ZNEAR))
    }

    fn flat_pyramid(depth: f32) -> CpuDepthPyramid {
        CpuDepthPyramid::from_depth(&vec![depth; 64 * 64], 64, 64).unwrap()
    }

    fn frame_for(camera: &Camera, pyramid: &CpuDepthPyramid, count: u32) -> CullingFrameData {
        let (w, h) = pyramid.extent();
        CullingFrameData::from_projection(&camera.proj_matrix(), w, h, count, pyramid.levels())
    }

    #[test]
    fn gpu_layouts_have_expected_sizes() {
        assert_eq!(std::mem::size_of::<ObjectBound>(), 48);
        assert_eq!(std::mem::size_of::<CullingFrameData>(), 128);
        assert_eq!(std::mem::size_of::<MiscFlags>(), 16);
    }

    #[test]
    fn dispatch_groups_round_up() {
        assert_eq!(dispatch_groups(0), 0);
        assert_eq!(dispatch_groups(1), 1);
        assert_eq!(dispatch_groups(256), 1);
        assert_eq!(dispatch_groups(257), 2);
    }

    #[test]
    fn frame_data_reads_projection_terms() {
        let cam = facing_camera();
        let fd = CullingFrameData::from_projection(&cam.proj_matrix(), 512, 256, 3, 10);
        assert!((fd.znear - ZNEAR).abs() < 1e-5);
        assert!((fd.zfar - ZFAR).abs() < 1e-2);
        // 90° fov, square aspect: cot(45°) = 1.
        assert!((fd.p00 - 1.0).abs() < 1e-5);
        assert!((fd.p11 - 1.0).abs() < 1e-5);
        for i in 0..6 {
            assert!((fd.plane(i).truncate().length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn point_ahead_of_camera_is_inside_every_plane() {
        let planes = frustum_planes(&facing_camera().proj_matrix());
        let p = Vec3::new(0.0, 0.0, -10.0);
        for plane in planes {
            assert!(plane.truncate().dot(p) + plane.w > 0.0, "{plane:?}");
        }
    }

    #[test]
    fn disabled_culling_is_pass_through() {
        let cam = facing_camera();
        let pyramid = flat_pyramid(0.0);
        let bounds = [
            unit_box(),
            // Behind the camera.
            ObjectBound::new(Vec3::new(-1.0, -1.0, -30.0), Vec3::new(1.0, 1.0, -28.0), 1),
            // Far off to the side.
            ObjectBound::new(Vec3::new(500.0, 0.0, 0.0), Vec3::new(501.0, 1.0, 1.0), 1),
        ];
        let fd = frame_for(&cam, &pyramid, bounds.len() as u32);
        let flags = cull_objects(
            &bounds,
            &cam.view_matrix(),
            &fd,
            &MiscFlags::new(false, false),
            Some(&pyramid),
            None,
        );
        assert_eq!(flags, vec![1, 1, 1]);
    }

    #[test]
    fn box_outside_a_side_plane_is_rejected_regardless_of_occlusion() {
        let cam = facing_camera();
        let pyramid = flat_pyramid(1.0);
        let outside = ObjectBound::new(Vec3::new(40.0, -1.0, -1.0), Vec3::new(42.0, 1.0, 1.0), 1);
        let fd = frame_for(&cam, &pyramid, 1);
        for occlusion in [false, true] {
            let misc = MiscFlags::new(occlusion, true);
            assert!(!test_object(&outside, &cam.view_matrix(), &fd, &misc, Some(&pyramid)));
        }
    }

    #[test]
    fn boxes_beyond_far_or_behind_camera_are_rejected() {
        let cam = facing_camera();
        let fd = CullingFrameData::from_projection(&cam.proj_matrix(), 64, 64, 1, 7);
        let beyond = ObjectBound::new(Vec3::new(-1.0, -1.0, 200.0), Vec3::new(1.0, 1.0, 202.0), 1);
        let behind = ObjectBound::new(Vec3::new(-1.0, -1.0, -30.0), Vec3::new(1.0, 1.0, -28.0), 1);
        let misc = MiscFlags::new(false, true);
        assert!(!test_object(&beyond, &cam.view_matrix(), &fd, &misc, None));
        assert!(!test_object(&behind, &cam.view_matrix(), &fd, &misc, None));
    }

    #[test]
    fn single_box_in_front_of_camera_is_visible() {
        let cam = facing_camera();
        // Cleared depth: nothing drawn yet.
        let pyramid = flat_pyramid(1.0);
        let fd = frame_for(&cam, &pyramid, 1);
        assert!(test_object(
            &unit_box(),
            &cam.view_matrix(),
            &fd,
            &MiscFlags::default(),
            Some(&pyramid)
        ));
    }

    #[test]
    fn box_behind_a_closer_occluder_is_hidden_only_with_occlusion_on() {
        let cam = facing_camera();
        // A wall at distance 5 covering the whole screen.
        let pyramid = flat_pyramid(depth_at(5.0));
        let fd = frame_for(&cam, &pyramid, 1);
        let view = cam.view_matrix();

        assert!(!test_object(&unit_box(), &view, &fd, &MiscFlags::new(true, true), Some(&pyramid)));
        assert!(test_object(&unit_box(), &view, &fd, &MiscFlags::new(false, true), Some(&pyramid)));
    }

    #[test]
    fn occluder_behind_the_box_does_not_hide_it() {
        let cam = facing_camera();
        let pyramid = flat_pyramid(depth_at(20.0));
        let fd = frame_for(&cam, &pyramid, 1);
        assert!(test_object(
            &unit_box(),
            &cam.view_matrix(),
            &fd,
            &MiscFlags::default(),
            Some(&pyramid)
        ));
    }

    #[test]
    fn box_crossing_near_plane_is_always_visible() {
        let cam = facing_camera();
        let pyramid = flat_pyramid(0.0);
        let fd = frame_for(&cam, &pyramid, 1);
        let around_eye = ObjectBound::new(Vec3::new(-1.0, -1.0, -11.0), Vec3::new(1.0, 1.0, -9.0), 1);
        assert!(test_object(
            &around_eye,
            &cam.view_matrix(),
            &fd,
            &MiscFlags::default(),
            Some(&pyramid)
        ));
    }

    #[test]
    fn late_pass_keeps_early_flags_and_reports_only_newly_visible() {
        let cam = facing_camera();
        let view = cam.view_matrix();
        let bounds = [
            unit_box(),
            ObjectBound::new(Vec3::new(-1.0, -1.0, 10.0), Vec3::new(1.0, 1.0, 12.0), 1),
        ];

        // Early pass saw object 0 only; this frame's depth no longer hides object 1.
        let early = vec![1, 0];
        let late_pyramid = flat_pyramid(1.0);
        let fd = frame_for(&cam, &late_pyramid, 2);
        let late = cull_objects(&bounds, &view, &fd, &MiscFlags::default(), Some(&late_pyramid), Some(&early));
        assert_eq!(late, vec![1, 1]);
        assert_eq!(compact(&late), vec![0, 1]);
        assert_eq!(compact_late(&late, &early), vec![1]);
    }

    #[test]
    fn compaction_keeps_order() {
        assert_eq!(compact(&[0, 1, 1, 0, 1]), vec![1, 2, 4]);
        assert!(compact(&[]).is_empty());
        assert_eq!(compact_late(&[1, 1, 0, 1], &[1, 0, 0, 0]), vec![1, 3]);
    }

    #[test]
    fn capacity_is_checked_before_dispatch() {
        assert!(check_capacity(16, 16).is_ok());
        let err = check_capacity(17, 16).unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded {
                requested: 17,
                capacity: 16
            }
        ));
    }

    #[test]
    fn empty_scene_culls_to_an_empty_list() {
        let cam = facing_camera();
        let pyramid = flat_pyramid(1.0);
        let fd = frame_for(&cam, &pyramid, 0);
        let flags = cull_objects(&[], &cam.view_matrix(), &fd, &MiscFlags::default(), Some(&pyramid), None);
        assert!(flags.is_empty());
        assert!(compact(&flags).is_empty());
        assert!(compact_late(&flags, &[]).is_empty());
    }

    #[test]
    fn culling_the_same_inputs_twice_is_idempotent() {
        let cam = facing_camera();
        let view = cam.view_matrix();
        // Wall at z -6..-5.5 seen from z -10.
        let pyramid = flat_pyramid(depth_at(4.0));
        let bounds = [
            unit_box(),
            ObjectBound::new(Vec3::new(30.0, -1.0, -1.0), Vec3::new(32.0, 1.0, 1.0), 1),
            ObjectBound::new(Vec3::new(-1.0, -1.0, -9.0), Vec3::new(1.0, 1.0, -8.0), 1),
        ];
        let fd = frame_for(&cam, &pyramid, bounds.len() as u32);
        let misc = MiscFlags::default();
        let first = cull_objects(&bounds, &view, &fd, &misc, Some(&pyramid), None);
        let second = cull_objects(&bounds, &view, &fd, &misc, Some(&pyramid), None);
        assert_eq!(first, second);
        // Only the box in front of the wall survives.
        assert_eq!(compact(&first), vec![2]);
    }

    #[test]
    fn cull_shader_validates_for_every_backend() {
        crate::gpu::assert_wgsl_valid("cull", CULL_WGSL, naga::ShaderStage::Compute, &["cull_early", "cull_late"]);
    }
}
