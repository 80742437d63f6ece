//! Percentile-clipped average luminance and asymmetric temporal smoothing.
//!
//! The pass reads the reduced histogram (row 0: bin counts, row 1: the
//! exposure written last frame) and writes the new exposure into the
//! adaptation target the previous frame did not write.
//!
//! The stored value is the exposure multiplier `2^exposure_scale / adapted`,
//! which a tonemapper multiplies scene colour by. The adapted luminance itself
//! is recovered with [`luminance_from_exposure`].
//!
//! The functions in this module mirror the WGSL of
//! [`Program::EyeAdaptation`](crate::Program::EyeAdaptation) and are what the
//! software backend runs.

use crate::commands::{Program, TextureSource};
use crate::error::{ExposureError, Result};
use crate::post_processing::histogram::HISTOGRAM_BINS;
use crate::post_processing::{FrameInputs, PipelineState, Stage, StageContext, StageKind};
use crate::settings::{HistogramMapping, PostProcessSettings};

/// Parameters of the eye adaptation program, three `vec4f`s:
///
/// | vec | x | y | z | w |
/// |---|---|---|---|---|
/// | 0 | histogram scale | histogram offset | low percentile | high percentile |
/// | 1 | min adaptation | max adaptation | speed up | speed down |
/// | 2 | `2^exposure_scale` | frame delta | | |
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct EyeAdaptationParams {
    pub eye_adaptation_params: [[f32; 4]; 3],
}

impl EyeAdaptationParams {
    pub fn new(settings: &PostProcessSettings, frame_delta: f32) -> Self {
        let mapping = HistogramMapping::from_settings(settings);
        let (pct_low, pct_high) = settings.effective_percentiles();
        let (min_adaptation, max_adaptation) = settings.effective_adaptation_range();

        Self {
            eye_adaptation_params: [
                [mapping.scale, mapping.offset, pct_low, pct_high],
                [
                    min_adaptation,
                    max_adaptation,
                    settings.eye_adaptation_speed_up,
                    settings.eye_adaptation_speed_down,
                ],
                [settings.exposure_scale_linear(), frame_delta, 0.0, 0.0],
            ],
        }
    }

    pub fn mapping(&self) -> HistogramMapping {
        HistogramMapping {
            scale: self.eye_adaptation_params[0][0],
            offset: self.eye_adaptation_params[0][1],
        }
    }

    pub fn percentiles(&self) -> (f32, f32) {
        (self.eye_adaptation_params[0][2], self.eye_adaptation_params[0][3])
    }

    pub fn adaptation_range(&self) -> (f32, f32) {
        (self.eye_adaptation_params[1][0], self.eye_adaptation_params[1][1])
    }

    pub fn speeds(&self) -> (f32, f32) {
        (self.eye_adaptation_params[1][2], self.eye_adaptation_params[1][3])
    }

    pub fn exposure_scale(&self) -> f32 {
        self.eye_adaptation_params[2][0]
    }

    pub fn frame_delta(&self) -> f32 {
        self.eye_adaptation_params[2][1]
    }
}

/// Mean luminance of the samples between the low and high percentiles.
///
/// Bins are walked from dark to bright; the first `low * total` samples and
/// everything past `high * total` are dropped. Returns 0 for an empty
/// histogram.
pub fn histogram_average_luminance(bins: &[f32], params: &EyeAdaptationParams) -> f32 {
    let mapping = params.mapping();
    let (pct_low, pct_high) = params.percentiles();
    let total: f32 = bins.iter().sum();

    let mut low = total * pct_low;
    let mut high = total * pct_high;
    let mut weighted_sum = 0.0;
    let mut weight = 0.0;
    let last = bins.len().saturating_sub(1).max(1) as f32;

    for (i, &count) in bins.iter().enumerate() {
        let mut count = count;

        let below = count.min(low);
        count -= below;
        low -= below;
        high -= below;

        count = count.min(high);
        high -= count;

        let luminance = mapping.luminance(i as f32 / last);
        weighted_sum += luminance * count;
        weight += count;
    }

    weighted_sum / weight.max(0.0001)
}

/// Move `old` toward `target` by `1 - 2^(-frame_delta * speed)` of the gap,
/// using `speed_up` when brightening and `speed_down` when darkening.
pub fn smooth_adaptation(old: f32, target: f32, params: &EyeAdaptationParams) -> f32 {
    let (speed_up, speed_down) = params.speeds();
    let diff = target - old;
    let speed = if diff > 0.0 { speed_up } else { speed_down };
    let factor = 1.0 - (-params.frame_delta() * speed).exp2();
    old + diff * factor
}

/// Adapted luminance encoded by an exposure value.
pub fn luminance_from_exposure(exposure: f32, exposure_scale: f32) -> f32 {
    exposure_scale / exposure.max(1.0e-6)
}

/// One eye adaptation step: new exposure from the reduced histogram and the
/// previous exposure.
pub fn adapt_exposure(bins: &[f32], previous_exposure: f32, params: &EyeAdaptationParams) -> f32 {
    let (min_adaptation, max_adaptation) = params.adaptation_range();
    let exposure_scale = params.exposure_scale();

    let target = histogram_average_luminance(bins, params).clamp(min_adaptation, max_adaptation);
    let old = luminance_from_exposure(previous_exposure, exposure_scale);
    let adapted = smooth_adaptation(old, target, params).clamp(min_adaptation, max_adaptation);

    exposure_scale / adapted
}

/// Writes the new exposure into the adaptation history.
#[derive(Debug, Default)]
pub struct EyeAdaptation {
    last_params: Option<EyeAdaptationParams>,
}

impl EyeAdaptation {
    /// Parameters uploaded by the most recent execution.
    pub fn last_params(&self) -> Option<&EyeAdaptationParams> {
        self.last_params.as_ref()
    }
}

impl Stage for EyeAdaptation {
    fn kind(&self) -> StageKind {
        StageKind::EyeAdaptation
    }

    fn execute(
        &mut self,
        ctx: &mut StageContext<'_>,
        frame: &FrameInputs<'_>,
        state: &mut PipelineState,
    ) -> Result<()> {
        let reduced = state
            .histogram_reduce
            .as_ref()
            .ok_or(ExposureError::MissingInput {
                stage: "eye_adaptation",
                input: "reduced histogram",
            })?;
        debug_assert_eq!(reduced.width(), HISTOGRAM_BINS);

        state.eye_adaptation.ensure_allocated(ctx.pool)?;
        let index = state.eye_adaptation.next_index();
        let Some(target) = state.eye_adaptation.target(index) else {
            return Err(ExposureError::MissingInput {
                stage: "eye_adaptation",
                input: "adaptation history",
            });
        };

        let params = EyeAdaptationParams::new(&state.settings, frame.frame_delta);

        ctx.commands.bind_program(Program::EyeAdaptation);
        ctx.commands.bind_texture(0, TextureSource::Pooled(reduced));
        ctx.commands.bind_parameters(0, bytemuck::bytes_of(&params));
        ctx.commands.set_render_target(target);
        ctx.commands.draw_fullscreen_quad()?;

        state.eye_adaptation.commit(index);
        self.last_params = Some(params);

        tracing::debug!(
            stage = "eye_adaptation",
            index,
            frame_delta = frame.frame_delta,
            "recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PostProcessSettings {
        PostProcessSettings::default()
            .with_histogram_range(-8.0, 4.0)
            .with_percentiles(0.2, 0.8)
            .with_adaptation_range(0.1, 10.0)
            .with_speeds(3.0, 1.0)
    }

    fn single_bin(bin: usize, count: f32) -> Vec<f32> {
        let mut bins = vec![0.0; HISTOGRAM_BINS as usize];
        bins[bin] = count;
        bins
    }

    #[test]
    fn params_follow_the_documented_layout() {
        let params = EyeAdaptationParams::new(&settings().with_exposure_scale(1.0), 0.016);
        let [a, b, c] = params.eye_adaptation_params;

        assert!((a[0] - 1.0 / 12.0).abs() < 1e-6);
        assert!((a[1] - 8.0 / 12.0).abs() < 1e-6);
        assert_eq!((a[2], a[3]), (0.2, 0.8));
        assert_eq!(b, [0.1, 10.0, 3.0, 1.0]);
        assert_eq!(c, [2.0, 0.016, 0.0, 0.0]);
        assert_eq!(std::mem::size_of::<EyeAdaptationParams>(), 48);
    }

    #[test]
    fn params_clamp_inverted_bounds() {
        let settings = settings()
            .with_percentiles(0.9, 0.3)
            .with_adaptation_range(4.0, 2.0);
        let params = EyeAdaptationParams::new(&settings, 0.0);

        let (low, high) = params.percentiles();
        assert!(low <= high);
        let (min, max) = params.adaptation_range();
        assert!(min <= max);
    }

    #[test]
    fn single_bin_average_is_that_bins_luminance() {
        let params = EyeAdaptationParams::new(&settings(), 0.0);
        let bin = 40;
        let expected = params.mapping().luminance(bin as f32 / 63.0);

        let average = histogram_average_luminance(&single_bin(bin, 100.0), &params);
        assert!((average - expected).abs() / expected < 1e-4);
    }

    #[test]
    fn percentiles_drop_outliers() {
        let params = EyeAdaptationParams::new(&settings(), 0.0);
        let mut bins = vec![0.0; 64];
        bins[0] = 10.0; // darkest 10%
        bins[32] = 80.0;
        bins[63] = 10.0; // brightest 10%

        let average = histogram_average_luminance(&bins, &params);
        let expected = params.mapping().luminance(32.0 / 63.0);
        assert!((average - expected).abs() / expected < 1e-4);
    }

    #[test]
    fn empty_histogram_averages_to_zero() {
        let params = EyeAdaptationParams::new(&settings(), 0.0);
        assert_eq!(histogram_average_luminance(&[0.0; 64], &params), 0.0);
    }

    #[test]
    fn smoothing_is_asymmetric_and_never_overshoots() {
        let params = EyeAdaptationParams::new(&settings(), 0.1);

        let up = smooth_adaptation(1.0, 2.0, &params);
        let down = smooth_adaptation(2.0, 1.0, &params);
        assert!(up > 1.0 && up < 2.0);
        assert!(down < 2.0 && down > 1.0);
        // speed up (3) is faster than speed down (1)
        assert!(up - 1.0 > 2.0 - down);
    }

    #[test]
    fn zero_frame_delta_holds_the_value() {
        let params = EyeAdaptationParams::new(&settings(), 0.0);
        assert_eq!(smooth_adaptation(0.5, 4.0, &params), 0.5);
    }

    #[test]
    fn adapted_luminance_stays_clamped() {
        let params = EyeAdaptationParams::new(&settings(), 100.0);
        let bright = single_bin(63, 1000.0);
        let dark = single_bin(0, 1000.0);

        let exposure = adapt_exposure(&bright, 1.0, &params);
        assert!((luminance_from_exposure(exposure, 1.0) - 10.0).abs() < 1e-4);

        let exposure = adapt_exposure(&dark, 1.0, &params);
        assert!((luminance_from_exposure(exposure, 1.0) - 0.1).abs() < 1e-4);
    }

    #[test]
    fn collapsed_percentile_window_pins_to_the_lower_bound() {
        let params = EyeAdaptationParams::new(&settings().with_percentiles(0.7, 0.7), 100.0);
        let bright = single_bin(60, 1000.0);

        assert_eq!(histogram_average_luminance(&bright, &params), 0.0);
        let exposure = adapt_exposure(&bright, 1.0, &params);
        assert!((luminance_from_exposure(exposure, 1.0) - 0.1).abs() < 1e-4);
    }
}
