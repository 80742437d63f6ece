//! Half-resolution copy of the scene colour.

use crate::commands::{Program, TextureSource};
use crate::error::{ExposureError, Result};
use crate::post_processing::{FrameInputs, PipelineState, Stage, StageContext, StageKind};
use crate::render_target::{RenderTargetDesc, TargetUsage};

/// Parameters of the downsample program.
///
/// ```wgsl
/// struct Params {
///     inv_tex_size: vec2f,
/// }
/// @group(0) @binding(0) var<uniform> p: Params;
/// ```
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DownsampleParams {
    /// `1 / size` of the source texture.
    pub inv_tex_size: [f32; 2],
    pub _padding: [f32; 2],
}

/// Size of the downsampled target for a `width` x `height` source.
pub fn downsampled_size(width: u32, height: u32) -> (u32, u32) {
    (width.div_ceil(2).max(1), height.div_ceil(2).max(1))
}

/// Renders the scene colour into a half-size target with a 2x2 box filter.
#[derive(Debug, Default)]
pub struct Downsample {
    output_desc: Option<RenderTargetDesc>,
}

impl Downsample {
    /// Descriptor of the most recent output.
    pub fn output_desc(&self) -> Option<&RenderTargetDesc> {
        self.output_desc.as_ref()
    }
}

impl Stage for Downsample {
    fn kind(&self) -> StageKind {
        StageKind::Downsample
    }

    fn execute(
        &mut self,
        ctx: &mut StageContext<'_>,
        frame: &FrameInputs<'_>,
        state: &mut PipelineState,
    ) -> Result<()> {
        let scene = frame.scene;
        if scene.width == 0 || scene.height == 0 {
            return Err(ExposureError::InvalidDescriptor {
                width: scene.width,
                height: scene.height,
                format: scene.format,
            });
        }

        let params = DownsampleParams {
            inv_tex_size: scene.inv_size().to_array(),
            _padding: [0.0; 2],
        };

        ctx.commands.bind_program(Program::Downsample);
        ctx.commands.bind_texture(0, TextureSource::SceneColor);
        ctx.commands.bind_parameters(0, bytemuck::bytes_of(&params));

        let (width, height) = downsampled_size(scene.width, scene.height);
        let desc = RenderTargetDesc::new_2d(scene.format, width, height, TargetUsage::RenderTarget)?;
        let target = ctx.acquire_into(&mut state.downsampled_scene, &desc, self.kind())?;
        self.output_desc = Some(desc);

        ctx.commands.set_render_target(target);
        ctx.commands.draw_fullscreen_quad()?;

        tracing::debug!(stage = "downsample", width, height, "recorded");
        Ok(())
    }
}
