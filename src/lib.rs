//! # Eyelight
//!
//! **Histogram-based automatic exposure for wgpu renderers.**
//!
//! Feed it your HDR scene colour once per frame and it hands back a 1x1
//! exposure texture for your tonemapper, adapting smoothly as the scene gets
//! brighter or darker, the way an eye does.
//!
//! ## Quick Start
//!
//! ```no_run
//! use eyelight::*;
//!
//! # fn frame(scene_view: &wgpu::TextureView) -> eyelight::Result<()> {
//! let gpu = GpuContext::new_headless()?;
//! let settings = PostProcessSettings::default()
//!     .with_histogram_range(-8.0, 4.0)
//!     .with_speeds(3.0, 1.5);
//! let mut exposure = ExposureRenderer::new(&gpu, settings)?;
//!
//! let scene = SceneColor::new(1920, 1080, wgpu::TextureFormat::Rgba16Float);
//! exposure.render(&gpu, scene_view, &scene, 1.0 / 60.0)?;
//!
//! // Bind this where the tonemapper reads its exposure multiplier.
//! let exposure_view = exposure.exposure_view();
//! # Ok(())
//! # }
//! ```
//!
//! ## How it works
//!
//! Four passes run per frame (see [`post_processing`]):
//!
//! 1. **Downsample** the scene to half resolution.
//! 2. **Histogram build**: a compute pass bins log2 luminance per 64x64 tile.
//! 3. **Histogram reduce**: sum the tiles and carry last frame's exposure.
//! 4. **Eye adaptation**: percentile-clipped average, clamped and smoothed.
//!
//! ## Backends
//!
//! The passes only see the [`RenderTargetPool`] and [`CommandSink`] traits.
//! [`TexturePool`] + [`WgpuCommands`] drive a GPU; [`SoftwarePool`] +
//! [`SoftwareCommands`] run the same programs on the CPU, no adapter needed.
//! Bring your own pool by implementing the trait over your renderer's
//! resource cache.

mod commands;
mod error;
mod gpu;
pub mod post_processing;
mod render_target;
mod settings;
pub mod shader_library;
mod software;
mod texture_pool;
mod wgpu_backend;

pub use commands::{CommandSink, Program, SceneColor, TextureSource};
pub use error::{ExposureError, Result};
pub use gpu::GpuContext;
pub use post_processing::{PipelineState, PostProcessing, StageContext};
pub use render_target::{
    PooledTarget, RenderTargetDesc, RenderTargetPool, TargetId, TargetUsage, release_slot,
};
pub use settings::{HistogramMapping, LUMINANCE_EPSILON, PostProcessSettings};
pub use shader_library::ShaderLibrary;
pub use software::{SoftwareCommands, SoftwareImage, SoftwarePool, SoftwareRenderer};
pub use texture_pool::TexturePool;
pub use wgpu_backend::{ExposureRenderer, WgpuCommands, read_exposure};

// Re-export wgpu so callers build descriptors against the same version
pub use wgpu;
