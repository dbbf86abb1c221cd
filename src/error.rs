// src/error.rs
//! Error handling for the occlusion core.
//!
//! - **Fatal**: device/resource creation, lost devices and failed readbacks. Nothing is retried.
//! - **Logic**: capacity overruns, dispatches past the uploaded bounds, unknown binding
//!   names and out-of-order frame stages are rejected on the host before anything
//!   reaches the GPU.
//! - **Transient** surface conditions are not errors at all; see [`crate::frame::SurfaceAction`].

use std::fmt;
use thiserror::Error;

use crate::frame::FrameStage;

/// Main error type for the crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No adapter matched the request (headless CI machines hit this).
    #[error("no compatible GPU adapter found")]
    NoAdapter,

    /// The adapter refused the device request.
    #[error("device request failed: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),

    /// A validation or out-of-memory error captured while creating `label`.
    #[error("GPU error while creating `{label}`: {message}")]
    Gpu { label: String, message: String },

    /// Mapping a readback buffer failed.
    #[error("buffer map failed: {0}")]
    BufferMap(#[from] wgpu::BufferAsyncError),

    /// The map callback never fired; the device is gone.
    #[error("device lost while waiting on `{0}`")]
    DeviceLost(&'static str),

    /// More objects than the bounds/visibility buffers were sized for.
    #[error("object count {requested} exceeds buffer capacity {capacity}")]
    CapacityExceeded { requested: u32, capacity: u32 },

    /// A dispatch asked for more objects than the bounds buffer currently holds.
    #[error("culling {requested} objects but only {uploaded} bounds are uploaded")]
    ObjectCountMismatch { requested: u32, uploaded: u32 },

    /// A named binding was looked up in a table that does not declare it.
    #[error("binding `{name}` not declared in `{table}`")]
    BindingNotFound { table: String, name: String },

    /// A frame operation was issued in the wrong stage.
    #[error("`{operation}` issued during {found:?}, expected one of {expected:?}")]
    StageOrder {
        operation: &'static str,
        expected: &'static [FrameStage],
        found: FrameStage,
    },

    /// Per-frame uniforms were not refreshed before the culling dispatch.
    #[error("{what} not written for frame {frame}")]
    StaleFrameData { what: &'static str, frame: u64 },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Simple custom message.
    #[error("{0}")]
    Custom(String),

    /// Context chaining.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    #[inline]
    pub fn format(args: fmt::Arguments) -> Self {
        Self::Custom(fmt::format(args))
    }

    #[inline]
    pub fn msg(msg: &'static str) -> Self {
        Self::Custom(msg.into())
    }

    /// Wrap `self` with a message, like `.context()` in anyhow.
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping context layers.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Setup-time misuse (capacity, binding names, stage order, config).
    #[inline]
    pub fn is_logic(&self) -> bool {
        matches!(
            self.root(),
            Error::CapacityExceeded { .. }
                | Error::ObjectCountMismatch { .. }
                | Error::BindingNotFound { .. }
                | Error::StageOrder { .. }
                | Error::StaleFrameData { .. }
                | Error::Config(_)
        )
    }

    /// Device-level failure; the renderer cannot continue.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            Error::NoAdapter
                | Error::RequestDevice(_)
                | Error::Gpu { .. }
                | Error::BufferMap(_)
                | Error::DeviceLost(_)
        )
    }

    /// Whether retrying the same call can succeed. Never true: transient surface
    /// conditions are reported through [`crate::frame::SurfaceAction`] instead.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        false
    }
}

/// Convenient `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_root_kind() {
        let err = Error::CapacityExceeded {
            requested: 10,
            capacity: 4,
        }
        .context("uploading chunk bounds");

        assert!(err.is_logic());
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "uploading chunk bounds: object count 10 exceeds buffer capacity 4"
        );
    }

    #[test]
    fn device_errors_are_fatal() {
        assert!(Error::DeviceLost("visibility readback").is_fatal());
        assert!(!Error::DeviceLost("visibility readback").is_recoverable());
        assert!(Error::Gpu {
            label: "depth_pyramid".into(),
            message: "out of memory".into()
        }
        .is_fatal());
    }
}
