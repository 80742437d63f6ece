//! Pooled render target handles and the pool contract the passes consume.
//!
//! Every intermediate texture the exposure passes write lives for part of a
//! frame only. Rather than creating textures each frame the passes borrow them
//! from a [`RenderTargetPool`] and hand them back once the last consumer ran.
//!
//! ```text
//!   acquire(desc) ──▶ PooledTarget ──▶ bound / rendered ──▶ release(target)
//!                                                            │
//!            reused by the next acquire with the same desc ◀─┘
//! ```
//!
//! A [`PooledTarget`] is move-only: releasing consumes it, so a target can't be
//! returned twice and a slot that gave its target back reads as `None`.
//! Contents of a reused target are whatever the previous holder left; every
//! pass overwrites the full target before anything reads it.

use crate::error::{ExposureError, Result};

/// How a pooled target is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetUsage {
    /// Colour attachment for fullscreen draws, sampleable afterwards.
    RenderTarget,
    /// Storage texture written by compute dispatches, sampleable afterwards.
    LoadStore,
}

impl TargetUsage {
    /// wgpu usage flags for textures created with this usage.
    pub fn texture_usages(self) -> wgpu::TextureUsages {
        match self {
            TargetUsage::RenderTarget => {
                wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
            }
            TargetUsage::LoadStore => {
                wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING
            }
        }
    }
}

/// Shape of a pooled 2D render target. Equal descriptors are interchangeable
/// and share a pool bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetDesc {
    pub format: wgpu::TextureFormat,
    pub width: u32,
    pub height: u32,
    pub usage: TargetUsage,
}

impl RenderTargetDesc {
    /// Describe a 2D target. Zero-sized targets are rejected.
    pub fn new_2d(
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
        usage: TargetUsage,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(ExposureError::InvalidDescriptor {
                width,
                height,
                format,
            });
        }
        Ok(Self {
            format,
            width,
            height,
            usage,
        })
    }

    pub fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        }
    }
}

/// Identity of a live pooled target, unique per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u64);

/// A texture borrowed from a [`RenderTargetPool`].
#[derive(Debug, PartialEq, Eq)]
pub struct PooledTarget {
    id: TargetId,
    desc: RenderTargetDesc,
}

impl PooledTarget {
    /// Wrap a pool-issued id. Only pool implementations should call this.
    pub fn new(id: TargetId, desc: RenderTargetDesc) -> Self {
        Self { id, desc }
    }

    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn desc(&self) -> &RenderTargetDesc {
        &self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.desc.format
    }
}

/// Reusable render target storage.
///
/// Methods take `&self` so one pool can back several views; implementations
/// synchronize internally.
pub trait RenderTargetPool {
    /// Borrow a target matching `desc`, reusing a returned one when possible.
    fn acquire(&self, desc: &RenderTargetDesc) -> Result<PooledTarget>;

    /// Return a target. Its contents are undefined to the previous holder.
    fn release(&self, target: PooledTarget);

    /// Number of targets currently borrowed.
    fn outstanding(&self) -> usize;
}

/// Release the target held in `slot`, if any.
pub fn release_slot(pool: &dyn RenderTargetPool, slot: &mut Option<PooledTarget>) {
    if let Some(target) = slot.take() {
        pool.release(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_descriptors_are_rejected() {
        let err = RenderTargetDesc::new_2d(
            wgpu::TextureFormat::R32Float,
            0,
            4,
            TargetUsage::RenderTarget,
        )
        .unwrap_err();
        assert!(matches!(err, ExposureError::InvalidDescriptor { width: 0, .. }));
    }

    #[test]
    fn identical_descriptors_compare_equal() {
        let a = RenderTargetDesc::new_2d(
            wgpu::TextureFormat::Rgba16Float,
            64,
            2,
            TargetUsage::LoadStore,
        )
        .unwrap();
        let b = RenderTargetDesc::new_2d(
            wgpu::TextureFormat::Rgba16Float,
            64,
            2,
            TargetUsage::LoadStore,
        )
        .unwrap();
        assert_eq!(a, b);
        assert_ne!(
            a,
            RenderTargetDesc {
                usage: TargetUsage::RenderTarget,
                ..b
            }
        );
    }

    #[test]
    fn storage_targets_are_sampleable() {
        let usages = TargetUsage::LoadStore.texture_usages();
        assert!(usages.contains(wgpu::TextureUsages::STORAGE_BINDING));
        assert!(usages.contains(wgpu::TextureUsages::TEXTURE_BINDING));
        assert!(!usages.contains(wgpu::TextureUsages::RENDER_ATTACHMENT));
    }
}
