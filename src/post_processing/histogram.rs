//! Two-phase luminance histogram: per-thread-group histograms built by a
//! compute dispatch, then summed into a single row by a fullscreen pass.
//!
//! ```text
//!  downsampled scene            histogram (LoadStore)         reduced (RenderTarget)
//!  ┌───┬───┬───┐                ┌──────────────────┐ row 0    ┌──────────────────┐
//!  │g00│g10│g20│  dispatch ──▶  │ bins of g00      │   ...    │ Σ rows           │ row 0
//!  ├───┼───┼───┤                │ bins of g10      │  draw ─▶ ├──────────────────┤
//!  │g01│g11│g21│                │ ...              │          │ last exposure    │ row 1
//!  └───┴───┴───┘                └──────────────────┘          └──────────────────┘
//! ```

use glam::UVec2;

use crate::commands::{Program, TextureSource};
use crate::error::{ExposureError, Result};
use crate::post_processing::{FrameInputs, PipelineState, Stage, StageContext, StageKind};
use crate::render_target::{RenderTargetDesc, TargetUsage};
use crate::settings::HistogramMapping;

/// Invocations per thread group.
pub const THREAD_GROUP_SIZE: UVec2 = UVec2::new(8, 8);
/// Texels each invocation visits per axis.
pub const LOOP_COUNT: UVec2 = UVec2::new(8, 8);
/// Histogram bins; one per invocation of a group.
pub const HISTOGRAM_BINS: u32 = THREAD_GROUP_SIZE.x * THREAD_GROUP_SIZE.y;
/// Format of the histogram textures.
pub const HISTOGRAM_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;

/// Texels covered by one thread group per axis.
pub fn texels_per_group() -> UVec2 {
    THREAD_GROUP_SIZE * LOOP_COUNT
}

/// Thread groups needed to cover a `width` x `height` image, at least one per
/// axis.
pub fn thread_group_count(width: u32, height: u32) -> UVec2 {
    let texels = texels_per_group();
    UVec2::new(
        width.div_ceil(texels.x).max(1),
        height.div_ceil(texels.y).max(1),
    )
}

/// Parameters of the histogram build program.
///
/// ```wgsl
/// struct Params {
///     pixel_offset_and_size: vec4i,
///     histogram_params: vec2f,
///     thread_group_count: vec2u,
/// }
/// ```
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct HistogramParams {
    /// Pixel rectangle `[x, y, width, height]` to histogram.
    pub pixel_offset_and_size: [i32; 4],
    /// Histogram `[scale, offset]`, see [`HistogramMapping`].
    pub histogram_params: [f32; 2],
    pub thread_group_count: [u32; 2],
}

/// Parameters of the histogram reduce program.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct HistogramReduceParams {
    /// Rows of the histogram texture to sum.
    pub num_histograms: u32,
    pub _padding: [u32; 3],
}

/// Builds one histogram row per thread group of the downsampled scene.
#[derive(Debug, Default)]
pub struct HistogramBuild {
    output_desc: Option<RenderTargetDesc>,
}

impl HistogramBuild {
    pub fn output_desc(&self) -> Option<&RenderTargetDesc> {
        self.output_desc.as_ref()
    }
}

impl Stage for HistogramBuild {
    fn kind(&self) -> StageKind {
        StageKind::HistogramBuild
    }

    fn execute(
        &mut self,
        ctx: &mut StageContext<'_>,
        _frame: &FrameInputs<'_>,
        state: &mut PipelineState,
    ) -> Result<()> {
        let source = state
            .downsampled_scene
            .as_ref()
            .ok_or(ExposureError::MissingInput {
                stage: "histogram_build",
                input: "downsampled scene",
            })?;

        let (width, height) = (source.width(), source.height());
        let groups = thread_group_count(width, height);
        let mapping = HistogramMapping::from_settings(&state.settings);

        let params = HistogramParams {
            pixel_offset_and_size: [0, 0, width as i32, height as i32],
            histogram_params: mapping.as_vec2().to_array(),
            thread_group_count: groups.to_array(),
        };

        ctx.commands.bind_program(Program::HistogramBuild);
        ctx.commands.bind_texture(0, TextureSource::Pooled(source));
        ctx.commands.bind_parameters(0, bytemuck::bytes_of(&params));

        let desc = RenderTargetDesc::new_2d(
            HISTOGRAM_FORMAT,
            HISTOGRAM_BINS,
            groups.x * groups.y,
            TargetUsage::LoadStore,
        )?;
        let target = ctx.acquire_into(&mut state.histogram, &desc, self.kind())?;
        self.output_desc = Some(desc);

        ctx.commands.bind_storage_texture(0, target);
        ctx.commands.dispatch_compute(groups.x, groups.y, 1)?;

        tracing::debug!(
            stage = "histogram_build",
            groups_x = groups.x,
            groups_y = groups.y,
            "recorded"
        );
        Ok(())
    }
}

/// Sums the per-group histograms and carries the previous exposure along.
#[derive(Debug, Default)]
pub struct HistogramReduce {
    output_desc: Option<RenderTargetDesc>,
}

impl HistogramReduce {
    pub fn output_desc(&self) -> Option<&RenderTargetDesc> {
        self.output_desc.as_ref()
    }
}

impl Stage for HistogramReduce {
    fn kind(&self) -> StageKind {
        StageKind::HistogramReduce
    }

    fn execute(
        &mut self,
        ctx: &mut StageContext<'_>,
        _frame: &FrameInputs<'_>,
        state: &mut PipelineState,
    ) -> Result<()> {
        let histogram = state
            .histogram
            .as_ref()
            .ok_or(ExposureError::MissingInput {
                stage: "histogram_reduce",
                input: "histogram",
            })?;

        // First frame: nothing written yet, so feed the neutral exposure.
        let previous = match state.eye_adaptation.latest() {
            Some(target) => TextureSource::Pooled(target),
            None => TextureSource::White,
        };

        let params = HistogramReduceParams {
            num_histograms: histogram.height(),
            _padding: [0; 3],
        };

        ctx.commands.bind_program(Program::HistogramReduce);
        ctx.commands.bind_texture(0, TextureSource::Pooled(histogram));
        ctx.commands.bind_texture(1, previous);
        ctx.commands.bind_parameters(0, bytemuck::bytes_of(&params));

        let desc = RenderTargetDesc::new_2d(
            HISTOGRAM_FORMAT,
            HISTOGRAM_BINS,
            2,
            TargetUsage::RenderTarget,
        )?;
        let target = ctx.acquire_into(&mut state.histogram_reduce, &desc, self.kind())?;
        self.output_desc = Some(desc);

        ctx.commands.set_render_target(target);
        ctx.commands.draw_fullscreen_quad()?;

        tracing::debug!(
            stage = "histogram_reduce",
            rows = params.num_histograms,
            "recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_bin_per_invocation() {
        assert_eq!(HISTOGRAM_BINS, 64);
        assert_eq!(texels_per_group(), UVec2::new(64, 64));
    }

    #[test]
    fn group_count_rounds_up() {
        assert_eq!(thread_group_count(960, 540), UVec2::new(15, 9));
        assert_eq!(thread_group_count(64, 64), UVec2::new(1, 1));
        assert_eq!(thread_group_count(65, 128), UVec2::new(2, 2));
    }

    #[test]
    fn group_count_is_never_zero() {
        assert_eq!(thread_group_count(1, 1), UVec2::new(1, 1));
        assert_eq!(thread_group_count(0, 0), UVec2::new(1, 1));
        assert_eq!(thread_group_count(63, 2), UVec2::new(1, 1));
    }

    #[test]
    fn group_count_matches_ceil_division() {
        for dim in [1u32, 7, 63, 64, 65, 127, 128, 129, 1000, 4096] {
            let expected = ((dim as f64) / 64.0).ceil().max(1.0) as u32;
            assert_eq!(thread_group_count(dim, dim), UVec2::splat(expected), "{dim}");
        }
    }

    #[test]
    fn params_match_wgsl_layout() {
        assert_eq!(std::mem::size_of::<HistogramParams>(), 32);
        assert_eq!(std::mem::size_of::<HistogramReduceParams>(), 16);
    }
}
