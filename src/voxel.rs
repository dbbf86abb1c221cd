// src/voxel.rs
//! Flat per‑chunk voxel storage.
//!
//! One contiguous `CHUNK_SIZE³` byte buffer per chunk, addressed `(x*S + y)*S + z`.
//! A value of `0` is air; anything else is a solid block id. The occlusion core only
//! needs what falls out of it: the tight bounds of the solid voxels and their count,
//! packaged as [`ChunkBounds`] for the object feed.

use glam::{UVec3, Vec3};

use crate::feed::{ChunkBounds, ChunkId};

/// Voxels per chunk edge.
pub const CHUNK_SIZE: usize = 16;
/// Voxels per chunk.
pub const CHUNK_VOLUME: usize = CHUNK_SIZE * CHUNK_SIZE * CHUNK_SIZE;

pub type BlockId = u8;
pub const AIR: BlockId = 0;

/// Flat arena index of local voxel `(x, y, z)`.
#[inline]
pub const fn voxel_index(x: usize, y: usize, z: usize) -> usize {
    (x * CHUNK_SIZE + y) * CHUNK_SIZE + z
}

#[derive(Clone)]
pub struct ChunkVoxels {
    id: ChunkId,
    blocks: Box<[BlockId]>,
    solid: u32,
}

impl std::fmt::Debug for ChunkVoxels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkVoxels")
            .field("id", &self.id)
            .field("solid", &self.solid)
            .finish()
    }
}

impl ChunkVoxels {
    /// All‑air chunk.
    pub fn new(id: ChunkId) -> Self {
        Self {
            id,
            blocks: vec![AIR; CHUNK_VOLUME].into_boxed_slice(),
            solid: 0,
        }
    }

    /// Fill every voxel from `f(x, y, z)`.
    pub fn from_fn(id: ChunkId, mut f: impl FnMut(usize, usize, usize) -> BlockId) -> Self {
        let mut chunk = Self::new(id);
        for x in 0..CHUNK_SIZE {
            for y in 0..CHUNK_SIZE {
                for z in 0..CHUNK_SIZE {
                    chunk.blocks[voxel_index(x, y, z)] = f(x, y, z);
                }
            }
        }
        chunk.solid = chunk.blocks.iter().filter(|&&b| b != AIR).count() as u32;
        chunk
    }

    #[inline]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Block at a local coordinate, `None` outside the chunk.
    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<BlockId> {
        if x < CHUNK_SIZE && y < CHUNK_SIZE && z < CHUNK_SIZE {
            Some(self.blocks[voxel_index(x, y, z)])
        } else {
            None
        }
    }

    /// Set a block; returns the previous one. Out‑of‑range writes are ignored.
    pub fn set(&mut self, x: usize, y: usize, z: usize, block: BlockId) -> Option<BlockId> {
        let prev = self.get(x, y, z)?;
        self.blocks[voxel_index(x, y, z)] = block;
        match (prev != AIR, block != AIR) {
            (false, true) => self.solid += 1,
            (true, false) => self.solid -= 1,
            _ => {}
        }
        Some(prev)
    }

    /// Number of solid voxels (the chunk's instance count).
    #[inline]
    pub fn solid_count(&self) -> u32 {
        self.solid
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.solid == 0
    }

    /// Raw arena for bulk upload.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.blocks
    }

    /// World‑space origin (voxel size 1).
    pub fn origin(&self) -> Vec3 {
        Vec3::new(self.id.x as f32, self.id.y as f32, self.id.z as f32) * CHUNK_SIZE as f32
    }

    /// Local `[min, max)` voxel range of the solid blocks.
    pub fn solid_extent(&self) -> Option<(UVec3, UVec3)> {
        if self.is_empty() {
            return None;
        }
        let mut lo = UVec3::splat(CHUNK_SIZE as u32);
        let mut hi = UVec3::ZERO;
        for (i, &block) in self.blocks.iter().enumerate() {
            if block == AIR {
                continue;
            }
            let p = UVec3::new(
                (i / (CHUNK_SIZE * CHUNK_SIZE)) as u32,
                (i / CHUNK_SIZE % CHUNK_SIZE) as u32,
                (i % CHUNK_SIZE) as u32,
            );
            lo = lo.min(p);
            hi = hi.max(p + UVec3::ONE);
        }
        Some((lo, hi))
    }

    /// Tight world bounds of the solid voxels; `None` for an all‑air chunk.
    pub fn bounds(&self) -> Option<ChunkBounds> {
        let (lo, hi) = self.solid_extent()?;
        let origin = self.origin();
        Some(ChunkBounds {
            id: self.id,
            min: origin + lo.as_vec3(),
            max: origin + hi.as_vec3(),
            instance_count: self.solid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_is_x_major() {
        assert_eq!(voxel_index(0, 0, 0), 0);
        assert_eq!(voxel_index(0, 0, 1), 1);
        assert_eq!(voxel_index(0, 1, 0), CHUNK_SIZE);
        assert_eq!(voxel_index(1, 0, 0), CHUNK_SIZE * CHUNK_SIZE);
        assert_eq!(voxel_index(CHUNK_SIZE - 1, CHUNK_SIZE - 1, CHUNK_SIZE - 1), CHUNK_VOLUME - 1);
    }

    #[test]
    fn set_tracks_solid_count() {
        let mut chunk = ChunkVoxels::new(ChunkId::default());
        assert!(chunk.bounds().is_none());
        assert_eq!(chunk.set(1, 2, 3, 7), Some(AIR));
        assert_eq!(chunk.set(1, 2, 3, 9), Some(7));
        assert_eq!(chunk.solid_count(), 1);
        assert_eq!(chunk.set(1, 2, 3, AIR), Some(9));
        assert!(chunk.is_empty());
        assert_eq!(chunk.set(CHUNK_SIZE, 0, 0, 1), None);
    }

    #[test]
    fn bounds_are_tight_and_in_world_space() {
        let mut chunk = ChunkVoxels::new(ChunkId::new(1, 0, -1));
        chunk.set(2, 0, 5, 1);
        chunk.set(4, 3, 5, 1);
        let b = chunk.bounds().unwrap();
        assert_eq!(b.min, Vec3::new(18.0, 0.0, -11.0));
        assert_eq!(b.max, Vec3::new(21.0, 4.0, -10.0));
        assert_eq!(b.instance_count, 2);
    }

    #[test]
    fn from_fn_fills_the_lower_half() {
        let chunk = ChunkVoxels::from_fn(ChunkId::default(), |_, y, _| (y < CHUNK_SIZE / 2) as u8);
        assert_eq!(chunk.solid_count() as usize, CHUNK_VOLUME / 2);
        let b = chunk.bounds().unwrap();
        assert_eq!(b.max.y, (CHUNK_SIZE / 2) as f32);
        assert_eq!(chunk.as_bytes().len(), CHUNK_VOLUME);
    }
}
