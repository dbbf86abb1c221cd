//! Owned GPU resources.
//!
//! * [`GpuBuffer`] – one buffer, label + size tracked, destroyed on drop.
//! * [`PyramidImage`] – the Hi‑Z mip chain plus one single‑mip texture per level.
//! * [`FrameRing`] – per‑frame‑in‑flight duplication indexed by `frame % N`.
//! * [`read_buffer_blocking`] – the host readback path (copy → map → poll).
//!
//! All types are move‑only; dropping one issues the device destroy call, so the
//! resize path is just "build the new one, drop the old one".

use crossbeam::channel::bounded;

use crate::error::{Error, Result};

/// Texel format of the depth pyramid.
pub const PYRAMID_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;

// -----------------------------------------------------------------------------
// Buffers
// -----------------------------------------------------------------------------

/// Owned buffer with its label and byte size.
#[derive(Debug)]
pub struct GpuBuffer {
    buffer: wgpu::Buffer,
    label: String,
    size: u64,
}

impl GpuBuffer {
    pub fn new(device: &wgpu::Device, label: impl Into<String>, size: u64, usage: wgpu::BufferUsages) -> Self {
        let label = label.into();
        // Zero-sized bindings are invalid; keep at least one 16-byte row.
        let size = size.max(16);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&label),
            size,
            usage,
            mapped_at_creation: false,
        });
        Self { buffer, label, size }
    }

    /// Uniform buffer sized for one `T`.
    pub fn uniform<T: bytemuck::Pod>(device: &wgpu::Device, label: impl Into<String>) -> Self {
        Self::new(
            device,
            label,
            std::mem::size_of::<T>() as u64,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        )
    }

    /// Storage buffer holding `capacity` elements of `T`.
    pub fn storage<T: bytemuck::Pod>(
        device: &wgpu::Device,
        label: impl Into<String>,
        capacity: u32,
        extra: wgpu::BufferUsages,
    ) -> Self {
        Self::new(
            device,
            label,
            std::mem::size_of::<T>() as u64 * capacity as u64,
            wgpu::BufferUsages::STORAGE | extra,
        )
    }

    /// Host-mappable copy target for reading GPU results back.
    pub fn readback(device: &wgpu::Device, label: impl Into<String>, size: u64) -> Self {
        Self::new(
            device,
            label,
            size,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        )
    }

    #[inline]
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn binding(&self) -> wgpu::BindingResource<'_> {
        self.buffer.as_entire_binding()
    }

    /// Queue a write of `data` at offset 0.
    pub fn write<T: bytemuck::Pod>(&self, queue: &wgpu::Queue, data: &[T]) {
        if data.is_empty() {
            return;
        }
        queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(data));
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        log::trace!("destroying buffer {} ({} bytes)", self.label, self.size);
        self.buffer.destroy();
    }
}

/// Map the first `count` elements of `buffer` for reading, block until the GPU is
/// done with it, copy them out and unmap. The only place the host waits on the device.
pub fn read_buffer_blocking<T: bytemuck::Pod>(device: &wgpu::Device, buffer: &GpuBuffer, count: usize) -> Result<Vec<T>> {
    let size = (count * std::mem::size_of::<T>()) as u64;
    if size == 0 {
        return Ok(Vec::new());
    }
    if size > buffer.size() {
        return Err(Error::custom(format!(
            "reading {size} bytes from `{}` ({} bytes)",
            buffer.label(),
            buffer.size()
        )));
    }
    let slice = buffer.raw().slice(..size);
    let (tx, rx) = bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |res| {
        let _ = tx.send(res);
    });
    device.poll(wgpu::Maintain::Wait);

    rx.recv().map_err(|_| Error::DeviceLost("buffer map"))??;

    let values = {
        let mapped = slice.get_mapped_range();
        mapped
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    };
    buffer.raw().unmap();
    Ok(values)
}

// -----------------------------------------------------------------------------
// Per-frame ring
// -----------------------------------------------------------------------------

/// One `T` per frame in flight.
#[derive(Debug)]
pub struct FrameRing<T> {
    items: Vec<T>,
}

impl<T> FrameRing<T> {
    pub fn new(frames_in_flight: u32, mut make: impl FnMut(usize) -> T) -> Self {
        Self {
            items: (0..frames_in_flight.max(1) as usize).map(&mut make).collect(),
        }
    }

    #[inline]
    pub fn get(&self, slot: usize) -> &T {
        &self.items[slot % self.items.len()]
    }

    #[inline]
    pub fn get_mut(&mut self, slot: usize) -> &mut T {
        let len = self.items.len();
        &mut self.items[slot % len]
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }
}

// -----------------------------------------------------------------------------
// Depth pyramid image
// -----------------------------------------------------------------------------

/// Largest power of two `<= v` (`v >= 1`).
#[inline]
pub fn previous_pow2(v: u32) -> u32 {
    let v = v.max(1);
    1 << (31 - v.leading_zeros())
}

/// `floor(log2(max(w, h))) + 1`.
#[inline]
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    let max_dim = width.max(height).max(1);
    32 - max_dim.leading_zeros()
}

/// `max(1, dim >> level)`.
#[inline]
pub fn level_extent(width: u32, height: u32, level: u32) -> (u32, u32) {
    ((width >> level).max(1), (height >> level).max(1))
}

/// Level‑0 size for a depth attachment of `depth_width × depth_height`.
#[inline]
pub fn pyramid_base_extent(depth_width: u32, depth_height: u32) -> (u32, u32) {
    (previous_pow2(depth_width), previous_pow2(depth_height))
}

fn pyramid_texture(
    device: &wgpu::Device,
    label: &str,
    width: u32,
    height: u32,
    mip_level_count: u32,
    usage: wgpu::TextureUsages,
) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: PYRAMID_FORMAT,
        usage,
        view_formats: &[],
    })
}

/// Single‑mip texture one reduction level is written to.
#[derive(Debug)]
struct LevelImage {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

/// The Hi‑Z image: `R32Float` with the full mip chain, read by culling through one
/// view over every level.
///
/// The reduction never writes the chain. Each level is computed into its own
/// single‑mip texture and [`PyramidImage::resolve`] copies them into the chain's
/// mips. GL emulates mip views by clamping the base/max level of the shared
/// texture, so storing into one mip while sampling another drops the writes there.
#[derive(Debug)]
pub struct PyramidImage {
    texture: wgpu::Texture,
    full_view: wgpu::TextureView,
    levels: Vec<LevelImage>,
    width: u32,
    height: u32,
}

impl PyramidImage {
    /// Create the pyramid for a depth attachment of the given size.
    pub fn new(device: &wgpu::Device, depth_width: u32, depth_height: u32) -> Self {
        let (width, height) = pyramid_base_extent(depth_width, depth_height);
        let level_count = mip_level_count(width, height);

        let texture = pyramid_texture(
            device,
            "depth_pyramid",
            width,
            height,
            level_count,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::COPY_SRC,
        );
        let full_view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("depth_pyramid_all_levels"),
            ..Default::default()
        });

        let levels = (0..level_count)
            .map(|level| {
                let (w, h) = level_extent(width, height, level);
                let texture = pyramid_texture(
                    device,
                    &format!("depth_pyramid_level_{level}"),
                    w,
                    h,
                    1,
                    wgpu::TextureUsages::STORAGE_BINDING
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_SRC,
                );
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                LevelImage {
                    texture,
                    view,
                    width: w,
                    height: h,
                }
            })
            .collect();

        log::debug!(
            "Created depth pyramid {}x{} with {} levels (depth {}x{})",
            width,
            height,
            level_count,
            depth_width,
            depth_height
        );

        Self {
            texture,
            full_view,
            levels,
            width,
            height,
        }
    }

    /// The mip chain culling samples.
    #[inline]
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    #[inline]
    pub fn full_view(&self) -> &wgpu::TextureView {
        &self.full_view
    }

    /// Reduction target for `level` (its own single‑mip texture).
    #[inline]
    pub fn level_view(&self, level: u32) -> Option<&wgpu::TextureView> {
        self.levels.get(level as usize).map(|l| &l.view)
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

    /// Copy every reduced level into its mip of the chain. Record after the
    /// reduction passes.
    pub fn resolve(&self, encoder: &mut wgpu::CommandEncoder) {
        for (mip, level) in self.levels.iter().enumerate() {
            encoder.copy_texture_to_texture(
                wgpu::ImageCopyTexture {
                    texture: &level.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::ImageCopyTexture {
                    texture: &self.texture,
                    mip_level: mip as u32,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::Extent3d {
                    width: level.width,
                    height: level.height,
                    depth_or_array_layers: 1,
                },
            );
        }
    }
}

impl Drop for PyramidImage {
    fn drop(&mut self) {
        log::trace!("destroying depth pyramid {}x{}", self.width, self.height);
        for level in &self.levels {
            level.texture.destroy();
        }
        self.texture.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_pow2_rounds_down() {
        assert_eq!(previous_pow2(1), 1);
        assert_eq!(previous_pow2(2), 2);
        assert_eq!(previous_pow2(3), 2);
        assert_eq!(previous_pow2(1080), 1024);
        assert_eq!(previous_pow2(1920), 1024);
        assert_eq!(previous_pow2(2048), 2048);
    }

    #[test]
    fn mip_count_matches_log2_rule() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 2), 2);
        assert_eq!(mip_level_count(1024, 512), 11);
        assert_eq!(mip_level_count(1, 256), 9);
    }

    #[test]
    fn level_extent_clamps_to_one() {
        assert_eq!(level_extent(1024, 256, 0), (1024, 256));
        assert_eq!(level_extent(1024, 256, 9), (2, 1));
        assert_eq!(level_extent(1024, 256, 10), (1, 1));
        assert_eq!(level_extent(1024, 256, 31), (1, 1));
    }

    #[test]
    fn resized_attachments_get_fresh_extents_and_levels() {
        assert_eq!(pyramid_base_extent(100, 60), (64, 32));
        assert_eq!(mip_level_count(64, 32), 7);
        assert_eq!(pyramid_base_extent(300, 200), (256, 128));
        assert_eq!(mip_level_count(256, 128), 9);
    }

    #[test]
    fn frame_ring_wraps() {
        let ring = FrameRing::new(2, |i| i * 10);
        assert_eq!(ring.iter().count(), 2);
        assert_eq!(*ring.get(0), 0);
        assert_eq!(*ring.get(3), 10);
    }
}
