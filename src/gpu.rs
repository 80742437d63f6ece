//! Core GPU context and device management.
//!
//! [`GpuContext`] bundles the wgpu device and queue the exposure passes record
//! into. It has no surface: the passes only ever render to off-screen pooled
//! targets, and the scene colour comes from whatever renderer owns the window.
//!
//! # Example
//!
//! ```no_run
//! use eyelight::GpuContext;
//!
//! let gpu = GpuContext::new_headless().expect("no GPU adapter");
//!
//! // Or share the renderer's device and queue
//! let shared = GpuContext::from_parts(gpu.device.clone(), gpu.queue.clone());
//! ```

use crate::error::{ExposureError, Result};

/// wgpu device and queue used by the pool, shader library and recorder.
///
/// Fields are public for direct wgpu access.
pub struct GpuContext {
    /// The logical GPU device for creating resources and pipelines.
    pub device: wgpu::Device,
    /// The command queue for submitting work to the GPU.
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Create a context without a window.
    ///
    /// This performs all wgpu initialization:
    /// 1. Creates a wgpu instance with primary backends (Vulkan, Metal, DX12)
    /// 2. Requests a suitable GPU adapter
    /// 3. Creates the logical device and command queue
    pub fn new_headless() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| ExposureError::device(format!("no suitable GPU adapter: {e}")))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Eyelight Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: Default::default(),
            trace: Default::default(),
            experimental_features: Default::default(),
        }))
        .map_err(|e| ExposureError::device(format!("failed to create device: {e}")))?;

        tracing::debug!(adapter = ?adapter.get_info().name, "created headless GPU context");

        Ok(Self { device, queue })
    }

    /// Wrap an existing device and queue, e.g. the host renderer's.
    pub fn from_parts(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self { device, queue }
    }
}
