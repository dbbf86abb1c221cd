// src/occlusion.rs
//! # Occlusion context
//!
//! Owns every GPU resource of the occlusion core and sequences one frame:
//!
//! ```text
//! begin_frame
//!   set_view_proj / set_global_data / set_misc      (per-slot uniforms)
//!   compute_depth_pyramid(&mut encoder)              (previous frame's depth)
//!   compute_culling(encoder, n, false) -> early list  (submit + readback)
//!   ... main pass writes this frame's depth ...
//!   compute_depth_pyramid(&mut encoder)              (this frame's depth)
//!   compute_culling(encoder, n, true)  -> late list   (newly revealed objects only)
//! ```
//!
//! Camera, culling and misc uniforms plus the visibility/readback buffers exist once
//! per frame in flight and are picked with `frame % frames_in_flight`. The bounds
//! buffer, pipelines and layouts are created once; the pyramid, its views and every
//! bind group that references it are rebuilt by [`OcclusionContext::resize`].

use glam::Mat4;

use crate::camera::CameraData;
use crate::config::OcclusionConfig;
use crate::context::OptionContext;
use crate::culling::{
    check_capacity, compact, compact_late, CullPass, CullingFrameData, CullingPipelines, MiscFlags, ObjectBound,
    VisibleIndexList,
};
use crate::error::{Error, Result};
use crate::feed::ObjectDataFeed;
use crate::frame::{FrameOp, FrameStage, FrameTimeline};
use crate::gpu::resources::{mip_level_count, pyramid_base_extent, read_buffer_blocking};
use crate::gpu::{FrameRing, GpuBuffer, GpuDevice, PyramidImage};
use crate::pyramid::PyramidBuilder;

/// Resources duplicated per frame in flight.
struct FrameSlot {
    camera: GpuBuffer,
    frame_data: GpuBuffer,
    misc: GpuBuffer,
    visibility: GpuBuffer,
    readback: GpuBuffer,
    bind_group: Option<wgpu::BindGroup>,
    // Host copy, finished and uploaded at dispatch time.
    pending_frame_data: CullingFrameData,
    camera_written: u64,
    frame_data_written: u64,
}

impl FrameSlot {
    fn new(device: &wgpu::Device, index: usize, capacity: u32) -> Self {
        let visibility_bytes = capacity as u64 * std::mem::size_of::<u32>() as u64;
        Self {
            camera: GpuBuffer::uniform::<CameraData>(device, format!("cull_camera_{index}")),
            frame_data: GpuBuffer::uniform::<CullingFrameData>(device, format!("cull_frame_data_{index}")),
            misc: GpuBuffer::uniform::<MiscFlags>(device, format!("cull_misc_{index}")),
            visibility: GpuBuffer::storage::<u32>(
                device,
                format!("visibility_{index}"),
                capacity,
                wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            ),
            readback: GpuBuffer::readback(device, format!("visibility_readback_{index}"), visibility_bytes),
            bind_group: None,
            pending_frame_data: CullingFrameData::default(),
            camera_written: 0,
            frame_data_written: 0,
        }
    }
}

/// The occlusion core. One per renderer; every frame operation goes through it.
pub struct OcclusionContext {
    gpu: GpuDevice,
    config: OcclusionConfig,
    timeline: FrameTimeline,
    feed: ObjectDataFeed,

    bounds: GpuBuffer,
    object_count: u32,
    slots: FrameRing<FrameSlot>,

    pyramid: Option<PyramidImage>,
    pyramid_builder: PyramidBuilder,
    culling: CullingPipelines,
    misc: MiscFlags,

    // First frame whose early pass may read depth drawn into the current attachment.
    depth_history_from: u64,
    early_flags: Vec<u32>,
    early_frame: u64,
}

impl OcclusionContext {
    pub fn new(gpu: GpuDevice, config: OcclusionConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config.max_objects;

        let pyramid_builder = PyramidBuilder::new(&gpu)?;
        let culling = CullingPipelines::new(&gpu)?;
        let (bounds, slots) = gpu.scoped("occlusion buffers", |device| {
            let bounds = GpuBuffer::storage::<ObjectBound>(
                device,
                "object_bounds",
                capacity,
                wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            );
            let slots = FrameRing::new(config.frames_in_flight, |i| FrameSlot::new(device, i, capacity));
            (bounds, slots)
        })?;

        log::info!(
            "Occlusion context ready: {} objects, {} frames in flight",
            capacity,
            config.frames_in_flight
        );

        Ok(Self {
            timeline: FrameTimeline::new(config.frames_in_flight),
            feed: ObjectDataFeed::new(1),
            misc: MiscFlags::new(config.occlusion_culling, config.frustum_culling),
            gpu,
            config,
            bounds,
            object_count: 0,
            slots,
            pyramid: None,
            pyramid_builder,
            culling,
            depth_history_from: u64::MAX,
            early_flags: Vec::new(),
            early_frame: 0,
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[inline]
    pub fn gpu(&self) -> &GpuDevice {
        &self.gpu
    }

    #[inline]
    pub fn config(&self) -> &OcclusionConfig {
        &self.config
    }

    /// Object data feed; hand `feed().sender()` to the streaming thread.
    #[inline]
    pub fn feed(&self) -> &ObjectDataFeed {
        &self.feed
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.config.max_objects
    }

    /// Objects currently in the bounds buffer.
    #[inline]
    pub fn object_count(&self) -> u32 {
        self.object_count
    }

    #[inline]
    pub fn frame(&self) -> u64 {
        self.timeline.frame()
    }

    #[inline]
    pub fn stage(&self) -> FrameStage {
        self.timeline.stage()
    }

    /// Level‑0 extent of the pyramid, `None` before the first resize.
    pub fn pyramid_extent(&self) -> Option<(u32, u32)> {
        self.pyramid.as_ref().map(PyramidImage::extent)
    }

    pub fn pyramid_levels(&self) -> u32 {
        self.pyramid.as_ref().map_or(0, PyramidImage::levels)
    }

    // ------------------------------------------------------------------
    // Frame setup
    // ------------------------------------------------------------------

    /// Start the next frame; returns its counter.
    pub fn begin_frame(&mut self) -> u64 {
        let frame = self.timeline.begin_frame();
        log::trace!("occlusion frame {frame} (slot {})", self.timeline.slot());
        frame
    }

    /// Camera matrices for this frame's culling dispatches.
    pub fn set_view_proj(&mut self, proj: Mat4, view: Mat4, inv_view: Mat4) {
        let frame = self.timeline.frame();
        let slot = self.slots.get_mut(self.timeline.slot());
        slot.camera.write(&self.gpu.queue, &[CameraData::new(proj, view, inv_view)]);
        slot.camera_written = frame;
    }

    /// Frustum planes, near/far and projection terms from `proj`; `width × height` is
    /// the depth attachment size. The pyramid fields are filled from the live pyramid.
    pub fn set_global_data(&mut self, proj: Mat4, width: u32, height: u32, chunk_count: u32) {
        let (mut pw, mut ph) = pyramid_base_extent(width, height);
        let mut levels = mip_level_count(pw, ph);
        if let Some(pyramid) = &self.pyramid {
            if pyramid.extent() != (pw, ph) {
                log::warn!(
                    "global data for {width}x{height} but the pyramid is {:?}; using the pyramid",
                    pyramid.extent()
                );
            }
            (pw, ph) = pyramid.extent();
            levels = pyramid.levels();
        }

        let frame = self.timeline.frame();
        let slot = self.slots.get_mut(self.timeline.slot());
        slot.pending_frame_data = CullingFrameData::from_projection(&proj, pw, ph, chunk_count, levels);
        slot.frame_data_written = frame;
    }

    /// Toggle the two tests. Applies from the next dispatch on.
    pub fn set_misc(&mut self, occlusion_enabled: bool, frustum_enabled: bool) {
        self.misc = MiscFlags::new(occlusion_enabled, frustum_enabled);
    }

    // ------------------------------------------------------------------
    // Geometry
    // ------------------------------------------------------------------

    /// Apply the newest streamed snapshot and upload the object list if it changed.
    /// Returns the number of objects in the bounds buffer.
    pub fn load_geometry_to_device(&mut self) -> Result<u32> {
        self.feed.poll();
        let capacity = self.config.max_objects;
        let (bounds, queue) = (&self.bounds, &self.gpu.queue);
        let uploaded = self.feed.take_dirty(|list| {
            let count = list.len() as u32;
            check_capacity(count, capacity)?;
            bounds.write(queue, list);
            Ok(count)
        });

        if let Some(result) = uploaded {
            self.object_count = result.map_err(|e| e.context("uploading object bounds"))?;
            log::debug!("uploaded {} object bounds", self.object_count);
        }
        Ok(self.object_count)
    }

    /// Read the bounds buffer back (blocking).
    pub fn read_object_bounds(&self) -> Result<Vec<ObjectBound>> {
        let count = self.object_count as usize;
        if count == 0 {
            return Ok(Vec::new());
        }
        let bytes = (count * std::mem::size_of::<ObjectBound>()) as u64;
        let readback = GpuBuffer::readback(&self.gpu.device, "object_bounds_readback", bytes);

        let mut encoder = self.gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("object_bounds_readback"),
        });
        encoder.copy_buffer_to_buffer(self.bounds.raw(), 0, readback.raw(), 0, bytes);
        self.gpu.queue.submit(Some(encoder.finish()));
        read_buffer_blocking(&self.gpu.device, &readback, count)
    }

    // ------------------------------------------------------------------
    // Resize
    // ------------------------------------------------------------------

    /// Bind a (new) depth attachment: rebuilds the pyramid, its level textures, the
    /// per‑level bind groups and every culling bind group. `depth_view` must be a
    /// single‑sampled `Depth32Float` view with `TEXTURE_BINDING` usage.
    ///
    /// The current frame drops back to [`FrameStage::Setup`], so the pyramid has to
    /// be rebuilt before the next culling call.
    pub fn resize(&mut self, depth_view: &wgpu::TextureView, width: u32, height: u32) -> Result<()> {
        crate::ensure!(
            width > 0 && height > 0,
            Error::Config(format!("depth attachment {width}x{height} has no texels"))
        );

        let pyramid = self
            .gpu
            .scoped("depth pyramid", |device| PyramidImage::new(device, width, height))?;
        self.pyramid_builder
            .rebind(&self.gpu, &pyramid, depth_view, width, height)?;

        let (gpu, culling, bounds) = (&self.gpu, &self.culling, &self.bounds);
        let bind_groups = gpu.scoped("culling bind groups", |device| -> Result<Vec<wgpu::BindGroup>> {
            self.slots
                .iter()
                .enumerate()
                .map(|(i, slot)| {
                    culling.table().bind_group(
                        device,
                        culling.layout(),
                        &format!("cull_bg_{i}"),
                        &[
                            ("camera", slot.camera.binding()),
                            ("objects", bounds.binding()),
                            ("depth_pyramid", wgpu::BindingResource::TextureView(pyramid.full_view())),
                            ("visibility", slot.visibility.binding()),
                            ("frame_data", slot.frame_data.binding()),
                            ("misc", slot.misc.binding()),
                        ],
                    )
                })
                .collect()
        })??;

        for (slot, bind_group) in self.slots.iter_mut().zip(bind_groups) {
            slot.bind_group = Some(bind_group);
        }
        self.pyramid = Some(pyramid);
        // The next frame draws the first depth into the new attachment.
        self.depth_history_from = self.timeline.frame() + 2;
        self.early_flags.clear();
        // Work recorded against the old pyramid is void; rebuild before culling.
        self.timeline.rewind();

        log::info!(
            "Resized occlusion core to {width}x{height}: pyramid {:?}, {} levels",
            self.pyramid_extent().unwrap_or_default(),
            self.pyramid_levels()
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-frame GPU work
    // ------------------------------------------------------------------

    /// Record the pyramid build from the bound depth attachment.
    pub fn compute_depth_pyramid(&mut self, encoder: &mut wgpu::CommandEncoder) -> Result<()> {
        self.timeline.check(FrameOp::BuildPyramid)?;
        let pyramid = self
            .pyramid
            .as_ref()
            .context("compute_depth_pyramid before resize bound a depth attachment")?;
        self.pyramid_builder.record(encoder, pyramid)?;
        self.timeline.advance(FrameOp::BuildPyramid)?;
        Ok(())
    }

    /// Record the culling dispatch into `encoder`, submit it, read the visibility
    /// flags back and compact them.
    ///
    /// The early list holds every visible object. The late list holds only the
    /// objects the early pass hid that this frame's depth reveals; draw it as a
    /// second pass on top of the early one.
    pub fn compute_culling(
        &mut self,
        mut encoder: wgpu::CommandEncoder,
        object_count: u32,
        late: bool,
    ) -> Result<VisibleIndexList> {
        let (op, pass) = if late {
            (FrameOp::CullLate, CullPass::Late)
        } else {
            (FrameOp::CullEarly, CullPass::Early)
        };
        self.timeline.check(op)?;
        check_capacity(object_count, self.config.max_objects)?;
        crate::ensure!(
            object_count <= self.object_count,
            Error::ObjectCountMismatch {
                requested: object_count,
                uploaded: self.object_count,
            }
        );
        let frame = self.timeline.frame();

        if object_count == 0 {
            self.gpu.queue.submit(Some(encoder.finish()));
            self.timeline.advance(op)?;
            if !late {
                self.early_flags.clear();
                self.early_frame = frame;
            }
            return Ok(VisibleIndexList::empty(pass, frame));
        }

        let pyramid = self
            .pyramid
            .as_ref()
            .context("compute_culling before resize bound a depth attachment")?;
        let slot = self.slots.get(self.timeline.slot());
        if slot.camera_written != frame {
            return Err(Error::StaleFrameData { what: "camera data", frame });
        }
        if slot.frame_data_written != frame {
            return Err(Error::StaleFrameData {
                what: "culling frame data",
                frame,
            });
        }
        if late && self.early_frame != frame {
            return Err(Error::StaleFrameData {
                what: "early visibility",
                frame,
            });
        }
        let bind_group = slot
            .bind_group
            .as_ref()
            .context("culling bind group missing")?;

        // The early pass reads last frame's depth; right after a resize there is none.
        let depth_valid = late || frame >= self.depth_history_from;
        let mut misc = self.misc;
        if misc.occlusion() && !depth_valid {
            log::debug!("frame {frame}: no depth history since resize, occlusion test skipped");
            misc.occlusion_enabled = 0;
        }

        let mut frame_data = slot.pending_frame_data;
        frame_data.object_count = object_count;
        (frame_data.pyramid_width, frame_data.pyramid_height) = pyramid.extent();
        frame_data.pyramid_levels = pyramid.levels();
        slot.frame_data.write(&self.gpu.queue, &[frame_data]);
        slot.misc.write(&self.gpu.queue, &[misc]);

        if late && self.early_flags.len() != object_count as usize {
            // No early flags for these slots: start them all hidden.
            encoder.clear_buffer(slot.visibility.raw(), 0, None);
        }
        self.culling.record(&mut encoder, bind_group, object_count, pass);

        let bytes = object_count as u64 * std::mem::size_of::<u32>() as u64;
        encoder.copy_buffer_to_buffer(slot.visibility.raw(), 0, slot.readback.raw(), 0, bytes);
        self.gpu.queue.submit(Some(encoder.finish()));

        let flags: Vec<u32> = read_buffer_blocking(&self.gpu.device, &slot.readback, object_count as usize)
            .map_err(|e| e.context("visibility readback"))?;

        self.timeline.advance(op)?;
        let indices = if late {
            compact_late(&flags, &self.early_flags)
        } else {
            let indices = compact(&flags);
            self.early_flags = flags;
            self.early_frame = frame;
            indices
        };
        log::trace!("frame {frame} {pass:?}: {}/{object_count} visible", indices.len());

        Ok(VisibleIndexList { indices, pass, frame })
    }

    /// Read one pyramid level back (blocking), row‑major.
    pub fn read_pyramid_level(&self, level: u32) -> Result<Vec<f32>> {
        let pyramid = self
            .pyramid
            .as_ref()
            .context("no depth pyramid before resize")?;
        crate::ensure!(
            level < pyramid.levels(),
            "pyramid level {} out of range ({} levels)",
            level,
            pyramid.levels()
        );
        let (w, h) = pyramid.level_extent(level);
        let row_bytes = w * std::mem::size_of::<f32>() as u32;
        let padded_row = row_bytes.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let readback = GpuBuffer::readback(
            &self.gpu.device,
            format!("pyramid_level_{level}_readback"),
            padded_row as u64 * h as u64,
        );

        let mut encoder = self.gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("pyramid_readback"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: pyramid.texture(),
                mip_level: level,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: readback.raw(),
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(h),
                },
            },
            wgpu::Extent3d {
                width: w,
                height: h,
                depth_or_array_layers: 1,
            },
        );
        self.gpu.queue.submit(Some(encoder.finish()));

        let padded: Vec<f32> = read_buffer_blocking(&self.gpu.device, &readback, (padded_row / 4 * h) as usize)?;
        let stride = (padded_row / 4) as usize;
        Ok(padded
            .chunks_exact(stride)
            .flat_map(|row| row[..w as usize].iter().copied())
            .collect())
    }
}
