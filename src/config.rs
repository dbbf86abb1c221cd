// src/config.rs
//! Occlusion core configuration, loaded once at startup.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Upper bound on frames in flight; the per-frame rings are sized from this.
pub const MAX_FRAMES_IN_FLIGHT: u32 = 4;

/// Configuration knobs for [`crate::OcclusionContext`].
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OcclusionConfig {
    /// Capacity of the object-bounds and visibility buffers.
    pub max_objects: u32,
    /// Number of frames whose GPU work may overlap (commonly 2).
    pub frames_in_flight: u32,
    /// Initial value of the occlusion toggle in the misc-flags uniform.
    pub occlusion_culling: bool,
    /// Initial value of the frustum toggle in the misc-flags uniform.
    pub frustum_culling: bool,
    /// Whether the demo loop runs the late pass after the main draw.
    pub late_culling: bool,
}

impl Default for OcclusionConfig {
    fn default() -> Self {
        Self {
            max_objects: 65_536,
            frames_in_flight: 2,
            occlusion_culling: true,
            frustum_culling: true,
            late_culling: true,
        }
    }
}

impl OcclusionConfig {
    /// Parse from JSON; missing fields fall back to [`Default`].
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::from(e).context(format!("reading {}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_objects == 0 {
            return Err(Error::Config("max_objects must be at least 1".into()));
        }
        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(Error::Config(format!(
                "frames_in_flight must be in 1..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let cfg = OcclusionConfig::from_json_str(r#"{ "max_objects": 1024 }"#).unwrap();
        assert_eq!(cfg.max_objects, 1024);
        assert_eq!(cfg.frames_in_flight, 2);
        assert!(cfg.occlusion_culling && cfg.frustum_culling);
    }

    #[test]
    fn rejects_bad_frames_in_flight() {
        let err = OcclusionConfig::from_json_str(r#"{ "frames_in_flight": 9 }"#).unwrap_err();
        assert!(err.is_logic());
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = OcclusionConfig::from_json_str(r#"{ "hiz_format": "r32" }"#).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }
}
