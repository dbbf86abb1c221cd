// src/lib.rs
//! GPU Hi‑Z occlusion culling for the Slop voxel renderer.
//!
//! Each frame the renderer reduces its depth attachment into a max‑depth pyramid,
//! tests every chunk's AABB against the camera frustum and that pyramid in a compute
//! shader, and reads back the compacted list of visible chunk indices. An early pass
//! uses last frame's depth; an optional late pass re‑tests what it hid against this
//! frame's depth.
//!
//! [`OcclusionContext`] is the entry point. Chunk bounds arrive from the streaming
//! thread through [`ObjectDataFeed`].

pub mod camera;
pub mod config;
pub mod context;
pub mod culling;
pub mod depth_prepass;
pub mod error;
pub mod feed;
pub mod frame;
pub mod gpu;
pub mod occlusion;
pub mod pyramid;
pub mod voxel;

pub use camera::{Camera, CameraData};
pub use config::OcclusionConfig;
pub use context::{Context, OptionContext};
pub use culling::{CullPass, ObjectBound, VisibleIndexList};
pub use error::{Error, Result};
pub use feed::{ChunkBounds, ChunkId, ChunkSnapshot, ObjectDataFeed, SnapshotSender};
pub use frame::{FrameStage, SurfaceAction};
pub use gpu::GpuDevice;
pub use occlusion::OcclusionContext;
