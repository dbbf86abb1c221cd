// src/frame.rs
//! Per-frame stage ordering and frame-in-flight bookkeeping.
//!
//! wgpu inserts the actual memory barriers between passes (depth write → pyramid reads,
//! level i writes → level i+1 reads, pyramid → culling, visibility → copy → host map).
//! What it cannot know is the order the occlusion core requires across calls, so
//! [`FrameTimeline`] tracks it and rejects anything recorded out of order:
//!
//! ```text
//! begin_frame ─► Setup ─► PyramidBuilt ─► EarlyCulled ─► LatePyramidBuilt ─► LateCulled
//!                              ▲               │  ▲                              │  ▲
//!                              └ (rebuild)     └──┘ (re-cull)                    └──┘
//! ```

use crate::error::{Error, Result};

/// Where the current frame is in the occlusion sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameStage {
    /// Uniform writes are allowed; nothing recorded yet.
    Setup,
    /// Pyramid built from the previous frame's depth.
    PyramidBuilt,
    /// Early visibility read back and compacted.
    EarlyCulled,
    /// Pyramid rebuilt from this frame's depth, ready for the late pass.
    LatePyramidBuilt,
    /// Late visibility read back and compacted.
    LateCulled,
}

/// Operations the timeline orders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOp {
    BuildPyramid,
    CullEarly,
    CullLate,
}

impl FrameOp {
    fn name(self) -> &'static str {
        match self {
            FrameOp::BuildPyramid => "compute_depth_pyramid",
            FrameOp::CullEarly => "compute_culling(early)",
            FrameOp::CullLate => "compute_culling(late)",
        }
    }

    fn allowed_from(self) -> &'static [FrameStage] {
        match self {
            FrameOp::BuildPyramid => &[FrameStage::Setup, FrameStage::EarlyCulled],
            FrameOp::CullEarly => &[FrameStage::PyramidBuilt, FrameStage::EarlyCulled],
            FrameOp::CullLate => &[FrameStage::LatePyramidBuilt, FrameStage::LateCulled],
        }
    }

    fn next(self, from: FrameStage) -> FrameStage {
        match (self, from) {
            (FrameOp::BuildPyramid, FrameStage::EarlyCulled) => FrameStage::LatePyramidBuilt,
            (FrameOp::BuildPyramid, _) => FrameStage::PyramidBuilt,
            (FrameOp::CullEarly, _) => FrameStage::EarlyCulled,
            (FrameOp::CullLate, _) => FrameStage::LateCulled,
        }
    }
}

/// Frame counter, in-flight slot and stage of the frame being recorded.
#[derive(Debug)]
pub struct FrameTimeline {
    frames_in_flight: u32,
    frame: u64,
    stage: FrameStage,
}

impl FrameTimeline {
    pub fn new(frames_in_flight: u32) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            frame: 0,
            stage: FrameStage::Setup,
        }
    }

    /// Start the next frame. Returns the new frame counter.
    pub fn begin_frame(&mut self) -> u64 {
        self.frame += 1;
        self.stage = FrameStage::Setup;
        self.frame
    }

    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    #[inline]
    pub fn stage(&self) -> FrameStage {
        self.stage
    }

    #[inline]
    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    /// Ring index for per-frame resources: `frame % frames_in_flight`.
    #[inline]
    pub fn slot(&self) -> usize {
        (self.frame % self.frames_in_flight as u64) as usize
    }

    /// Back to `Setup` within the same frame. Anything recorded so far has to be
    /// recorded again, starting with the pyramid.
    pub fn rewind(&mut self) {
        if self.stage != FrameStage::Setup {
            log::debug!("frame {} rewound from {:?}", self.frame, self.stage);
        }
        self.stage = FrameStage::Setup;
    }

    /// Validate `op` against the current stage without advancing.
    pub fn check(&self, op: FrameOp) -> Result<()> {
        let expected = op.allowed_from();
        if expected.contains(&self.stage) {
            Ok(())
        } else {
            Err(Error::StageOrder {
                operation: op.name(),
                expected,
                found: self.stage,
            })
        }
    }

    /// Validate and advance.
    pub fn advance(&mut self, op: FrameOp) -> Result<FrameStage> {
        self.check(op)?;
        let next = op.next(self.stage);
        log::trace!("frame {} stage {:?} -> {:?}", self.frame, self.stage, next);
        self.stage = next;
        Ok(next)
    }
}

/// What the renderer should do with a surface acquire failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceAction {
    /// Reconfigure the surface, then call `OcclusionContext::resize` before the next dispatch.
    Recreate,
    /// Drop this frame and try again.
    SkipFrame,
    /// Unrecoverable.
    Fatal,
}

impl SurfaceAction {
    #[allow(unreachable_patterns)]
    pub fn classify(err: &wgpu::SurfaceError) -> Self {
        match err {
            wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost => SurfaceAction::Recreate,
            wgpu::SurfaceError::Timeout => SurfaceAction::SkipFrame,
            wgpu::SurfaceError::OutOfMemory => SurfaceAction::Fatal,
            _ => SurfaceAction::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_frame_sequence() {
        let mut tl = FrameTimeline::new(2);
        tl.begin_frame();
        assert_eq!(tl.advance(FrameOp::BuildPyramid).unwrap(), FrameStage::PyramidBuilt);
        assert_eq!(tl.advance(FrameOp::CullEarly).unwrap(), FrameStage::EarlyCulled);
        // Re-running the early pass in the same frame is allowed.
        assert_eq!(tl.advance(FrameOp::CullEarly).unwrap(), FrameStage::EarlyCulled);
        assert_eq!(tl.advance(FrameOp::BuildPyramid).unwrap(), FrameStage::LatePyramidBuilt);
        assert_eq!(tl.advance(FrameOp::CullLate).unwrap(), FrameStage::LateCulled);
    }

    #[test]
    fn culling_before_pyramid_is_rejected() {
        let mut tl = FrameTimeline::new(2);
        tl.begin_frame();
        let err = tl.advance(FrameOp::CullEarly).unwrap_err();
        assert!(matches!(err, Error::StageOrder { found: FrameStage::Setup, .. }));
        // Stage unchanged after the rejection.
        assert_eq!(tl.stage(), FrameStage::Setup);
    }

    #[test]
    fn late_pass_needs_fresh_pyramid() {
        let mut tl = FrameTimeline::new(2);
        tl.begin_frame();
        tl.advance(FrameOp::BuildPyramid).unwrap();
        tl.advance(FrameOp::CullEarly).unwrap();
        assert!(tl.advance(FrameOp::CullLate).is_err());
    }

    #[test]
    fn rewind_requires_a_fresh_pyramid() {
        let mut tl = FrameTimeline::new(2);
        let frame = tl.begin_frame();
        tl.advance(FrameOp::BuildPyramid).unwrap();
        tl.advance(FrameOp::CullEarly).unwrap();
        tl.advance(FrameOp::BuildPyramid).unwrap();

        tl.rewind();
        assert_eq!(tl.stage(), FrameStage::Setup);
        assert_eq!(tl.frame(), frame);
        assert!(matches!(
            tl.check(FrameOp::CullLate).unwrap_err(),
            Error::StageOrder { found: FrameStage::Setup, .. }
        ));
        assert_eq!(tl.advance(FrameOp::BuildPyramid).unwrap(), FrameStage::PyramidBuilt);
    }

    #[test]
    fn slots_cycle_through_frames_in_flight() {
        let mut tl = FrameTimeline::new(3);
        let slots: Vec<usize> = (0..6)
            .map(|_| {
                tl.begin_frame();
                tl.slot()
            })
            .collect();
        assert_eq!(slots, vec![1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn surface_errors_map_to_actions() {
        assert_eq!(SurfaceAction::classify(&wgpu::SurfaceError::Outdated), SurfaceAction::Recreate);
        assert_eq!(SurfaceAction::classify(&wgpu::SurfaceError::Lost), SurfaceAction::Recreate);
        assert_eq!(SurfaceAction::classify(&wgpu::SurfaceError::Timeout), SurfaceAction::SkipFrame);
        assert_eq!(SurfaceAction::classify(&wgpu::SurfaceError::OutOfMemory), SurfaceAction::Fatal);
    }
}
