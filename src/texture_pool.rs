//! wgpu-backed [`RenderTargetPool`].
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 TexturePool                  │
//! │                                              │
//! │  active: TargetId → GpuTarget   (borrowed)   │
//! │  free:   RenderTargetDesc → [GpuTarget]      │
//! │                                              │
//! │  acquire(desc)  pop free bucket or create    │
//! │  release(t)     move back to its bucket      │
//! │  trim()         drop everything in `free`    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Textures are never destroyed while in use; call [`TexturePool::trim`] after
//! a resolution change to drop buckets nobody asks for anymore.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{ExposureError, Result};
use crate::gpu::GpuContext;
use crate::render_target::{PooledTarget, RenderTargetDesc, RenderTargetPool, TargetId};

/// A pooled texture with its default view.
struct GpuTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl GpuTarget {
    fn new(device: &wgpu::Device, desc: &RenderTargetDesc) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Eyelight Pooled Target"),
            size: desc.extent(),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: desc.format,
            usage: desc.usage.texture_usages(),
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }
}

#[derive(Default)]
struct PoolInner {
    active: HashMap<TargetId, GpuTarget>,
    free: HashMap<RenderTargetDesc, Vec<GpuTarget>>,
    next_id: u64,
    created: usize,
}

/// Render target pool creating wgpu textures on demand.
///
/// `Send + Sync`: views rendered on different threads may share one pool.
pub struct TexturePool {
    device: wgpu::Device,
    capacity: Option<usize>,
    inner: Mutex<PoolInner>,
}

impl TexturePool {
    /// Unbounded pool on the given device.
    pub fn new(gpu: &GpuContext) -> Self {
        Self {
            device: gpu.device.clone(),
            capacity: None,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Pool that fails [`acquire`](RenderTargetPool::acquire) once
    /// `capacity` targets are borrowed at the same time.
    pub fn with_capacity(gpu: &GpuContext, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new(gpu)
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// View of a borrowed target, for binding.
    pub fn view(&self, id: TargetId) -> Result<wgpu::TextureView> {
        self.lock()
            .active
            .get(&id)
            .map(|target| target.view.clone())
            .ok_or(ExposureError::UnknownTarget(id.0))
    }

    /// Texture of a borrowed target, for copies.
    pub fn texture(&self, id: TargetId) -> Result<wgpu::Texture> {
        self.lock()
            .active
            .get(&id)
            .map(|target| target.texture.clone())
            .ok_or(ExposureError::UnknownTarget(id.0))
    }

    /// Number of returned textures waiting for reuse.
    pub fn free_count(&self) -> usize {
        self.lock().free.values().map(Vec::len).sum()
    }

    /// Total number of textures this pool has created.
    pub fn created_count(&self) -> usize {
        self.lock().created
    }

    /// Drop every texture that is not currently borrowed.
    pub fn trim(&self) {
        let mut inner = self.lock();
        let dropped: usize = inner.free.values().map(Vec::len).sum();
        inner.free.clear();
        inner.created -= dropped;
        tracing::debug!(dropped, "trimmed render target pool");
    }
}

impl RenderTargetPool for TexturePool {
    fn acquire(&self, desc: &RenderTargetDesc) -> Result<PooledTarget> {
        let mut inner = self.lock();

        if let Some(capacity) = self.capacity
            && inner.active.len() >= capacity
        {
            return Err(ExposureError::PoolExhausted { capacity });
        }

        let reused = inner.free.get_mut(desc).and_then(Vec::pop);
        let target = match reused {
            Some(target) => {
                tracing::trace!(?desc, "render target pool hit");
                target
            }
            None => {
                tracing::trace!(?desc, "render target pool miss");
                inner.created += 1;
                GpuTarget::new(&self.device, desc)
            }
        };

        let id = TargetId(inner.next_id);
        inner.next_id += 1;
        inner.active.insert(id, target);

        Ok(PooledTarget::new(id, *desc))
    }

    fn release(&self, target: PooledTarget) {
        let mut inner = self.lock();
        match inner.active.remove(&target.id()) {
            Some(texture) => inner.free.entry(*target.desc()).or_default().push(texture),
            None => tracing::warn!(id = target.id().0, "released a target this pool does not own"),
        }
    }

    fn outstanding(&self) -> usize {
        self.lock().active.len()
    }
}
