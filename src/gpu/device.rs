// src/gpu/device.rs
//! Device/queue bring-up and error-scope capture for construction-time resources.

use std::sync::Arc;

use crate::error::{Error, Result};

/// Shared device + queue. Cloning is cheap; every clone talks to the same GPU.
#[derive(Clone, Debug)]
pub struct GpuDevice {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

impl GpuDevice {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self { device, queue }
    }

    /// Request an adapter + device with no surface attached.
    pub async fn request_headless() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::util::backend_bits_from_env().unwrap_or_default(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(Error::NoAdapter)?;

        let info = adapter.get_info();
        log::info!("Using adapter {} ({:?})", info.name, info.backend);

        let downlevel = adapter.get_downlevel_capabilities();
        if !downlevel.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
            return Err(Error::format(format_args!(
                "adapter {} ({:?}) has no compute shaders",
                info.name, info.backend
            )));
        }

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("slop_occlusion_device"),
                    required_features: wgpu::Features::empty(),
                    // GL and software adapters fall short of the WebGPU defaults.
                    required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await?;

        Ok(Self::new(Arc::new(device), Arc::new(queue)))
    }

    /// Blocking variant of [`GpuDevice::request_headless`].
    pub fn request_headless_blocking() -> Result<Self> {
        pollster::block_on(Self::request_headless())
    }

    /// Run `f` inside validation + out-of-memory error scopes and surface the first
    /// captured error as [`Error::Gpu`]. Resource creation goes through here so a bad
    /// descriptor fails at construction instead of poisoning a later frame.
    pub fn scoped<T>(&self, label: &str, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());

        match validation.or(oom) {
            None => Ok(value),
            Some(err) => {
                log::error!("GPU error while creating {label}: {err}");
                Err(Error::Gpu {
                    label: label.to_owned(),
                    message: err.to_string(),
                })
            }
        }
    }

    /// Block until all submitted work has completed.
    pub fn wait_idle(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }
}
