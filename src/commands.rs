//! The command submission contract the exposure passes record through.
//!
//! Passes never talk to wgpu directly. They select a [`Program`], bind inputs
//! by slot, pick an output and issue a draw or dispatch on a [`CommandSink`].
//! [`WgpuCommands`](crate::WgpuCommands) turns that into render and compute
//! passes; [`SoftwareCommands`](crate::SoftwareCommands) executes it on the CPU.
//!
//! A sink holds bindings until the next [`CommandSink::bind_program`], the way
//! a material keeps its parameters between draws.

use crate::render_target::PooledTarget;

/// The four shader programs of the exposure pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Program {
    /// Fullscreen 2x box downsample of the scene colour.
    Downsample,
    /// Compute pass writing one histogram row per thread group.
    HistogramBuild,
    /// Fullscreen pass summing histogram rows and carrying the last exposure.
    HistogramReduce,
    /// Fullscreen pass producing the new exposure texel.
    EyeAdaptation,
}

impl Program {
    pub fn label(self) -> &'static str {
        match self {
            Program::Downsample => "Downsample",
            Program::HistogramBuild => "Histogram Build",
            Program::HistogramReduce => "Histogram Reduce",
            Program::EyeAdaptation => "Eye Adaptation",
        }
    }

    /// Number of sampled texture slots the program reads.
    pub fn texture_slots(self) -> u32 {
        match self {
            Program::HistogramReduce => 2,
            _ => 1,
        }
    }

    pub fn is_compute(self) -> bool {
        matches!(self, Program::HistogramBuild)
    }
}

/// The externally owned scene colour target being exposed.
///
/// Only its shape is needed to plan the passes; each backend is handed the
/// actual resource when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneColor {
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
}

impl SceneColor {
    pub fn new(width: u32, height: u32, format: wgpu::TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// `1 / size`, the texel step used by the downsample filter.
    pub fn inv_size(&self) -> glam::Vec2 {
        glam::Vec2::new(1.0 / self.width as f32, 1.0 / self.height as f32)
    }
}

/// Something a program can sample.
#[derive(Debug, Clone, Copy)]
pub enum TextureSource<'a> {
    /// The scene colour the backend was created with.
    SceneColor,
    /// A target borrowed from the pool.
    Pooled(&'a PooledTarget),
    /// A 1x1 texture holding 1.0 in every channel.
    White,
}

/// Recording interface for the exposure passes.
pub trait CommandSink {
    /// Select the program for the next draw or dispatch and drop prior bindings.
    fn bind_program(&mut self, program: Program);

    /// Bind a sampled texture to `slot`.
    fn bind_texture(&mut self, slot: u32, source: TextureSource<'_>);

    /// Bind a compute-writable target to `slot`.
    fn bind_storage_texture(&mut self, slot: u32, target: &PooledTarget);

    /// Upload a parameter block (a `#[repr(C)]` uniform struct) to `slot`.
    fn bind_parameters(&mut self, slot: u32, data: &[u8]);

    /// Select the colour target for fullscreen draws.
    fn set_render_target(&mut self, target: &PooledTarget);

    /// Clear the render target and draw a fullscreen triangle over it.
    fn draw_fullscreen_quad(&mut self) -> crate::Result<()>;

    /// Dispatch the bound compute program.
    fn dispatch_compute(&mut self, groups_x: u32, groups_y: u32, groups_z: u32)
    -> crate::Result<()>;
}
