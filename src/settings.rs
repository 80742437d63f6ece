//! User-facing exposure settings and the histogram mapping derived from them.
//!
//! [`PostProcessSettings`] is plain data: the caller owns it (usually inside a
//! [`PipelineState`](crate::PipelineState)) and may change it between frames.
//! Every pass re-derives what it needs from the current values, so there is no
//! cached state to invalidate.
//!
//! # Loading from JSON
//!
//! ```
//! use eyelight::PostProcessSettings;
//!
//! let settings = PostProcessSettings::from_json(r#"{ "exposure_scale": 1.0 }"#).unwrap();
//! assert_eq!(settings.exposure_scale, 1.0);
//! assert_eq!(settings.histogram_log2_min, -8.0);
//! ```

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::error::{ExposureError, Result};

/// Tunables for histogram construction and temporal adaptation.
///
/// Missing fields fall back to [`Default`] when deserializing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessSettings {
    /// Lower end of the log2-luminance range covered by the histogram.
    pub histogram_log2_min: f32,
    /// Upper end of the log2-luminance range covered by the histogram.
    pub histogram_log2_max: f32,
    /// Fraction of darkest samples ignored when averaging. Clamped to
    /// `histogram_pct_high`.
    pub histogram_pct_low: f32,
    /// Fraction of samples (from the dark end) kept when averaging.
    pub histogram_pct_high: f32,
    /// Lower clamp on the adapted luminance. Clamped to `max_eye_adaptation`.
    pub min_eye_adaptation: f32,
    /// Upper clamp on the adapted luminance.
    pub max_eye_adaptation: f32,
    /// Adaptation rate when the scene gets brighter.
    pub eye_adaptation_speed_up: f32,
    /// Adaptation rate when the scene gets darker.
    pub eye_adaptation_speed_down: f32,
    /// Exposure bias in stops, applied as `2^exposure_scale`.
    pub exposure_scale: f32,
}

impl Default for PostProcessSettings {
    fn default() -> Self {
        Self {
            histogram_log2_min: -8.0,
            histogram_log2_max: 4.0,
            histogram_pct_low: 0.8,
            histogram_pct_high: 0.985,
            min_eye_adaptation: 0.3,
            max_eye_adaptation: 2.0,
            eye_adaptation_speed_up: 3.0,
            eye_adaptation_speed_down: 3.0,
            exposure_scale: 0.0,
        }
    }
}

impl PostProcessSettings {
    /// Parse settings from a (possibly partial) JSON object and validate them.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Set the log2-luminance range covered by the histogram.
    pub fn with_histogram_range(mut self, log2_min: f32, log2_max: f32) -> Self {
        self.histogram_log2_min = log2_min;
        self.histogram_log2_max = log2_max;
        self
    }

    /// Set the percentile window used when averaging the histogram.
    pub fn with_percentiles(mut self, low: f32, high: f32) -> Self {
        self.histogram_pct_low = low;
        self.histogram_pct_high = high;
        self
    }

    /// Set the clamp applied to the adapted luminance.
    pub fn with_adaptation_range(mut self, min: f32, max: f32) -> Self {
        self.min_eye_adaptation = min;
        self.max_eye_adaptation = max;
        self
    }

    /// Set the brighten/darken adaptation rates.
    pub fn with_speeds(mut self, up: f32, down: f32) -> Self {
        self.eye_adaptation_speed_up = up;
        self.eye_adaptation_speed_down = down;
        self
    }

    /// Set the exposure bias in stops.
    pub fn with_exposure_scale(mut self, stops: f32) -> Self {
        self.exposure_scale = stops;
        self
    }

    /// Reject settings that would feed infinities or NaNs into the shaders.
    ///
    /// Inverted percentile and adaptation bounds are *not* errors; they are
    /// clamped when the pass parameters are built.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("histogram_log2_min", self.histogram_log2_min),
            ("histogram_log2_max", self.histogram_log2_max),
            ("histogram_pct_low", self.histogram_pct_low),
            ("histogram_pct_high", self.histogram_pct_high),
            ("min_eye_adaptation", self.min_eye_adaptation),
            ("max_eye_adaptation", self.max_eye_adaptation),
            ("eye_adaptation_speed_up", self.eye_adaptation_speed_up),
            ("eye_adaptation_speed_down", self.eye_adaptation_speed_down),
            ("exposure_scale", self.exposure_scale),
        ];
        if let Some((name, value)) = fields.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ExposureError::invalid_settings(format!(
                "{name} must be finite, got {value}"
            )));
        }

        if self.histogram_log2_max <= self.histogram_log2_min {
            return Err(ExposureError::invalid_settings(format!(
                "histogram range is empty: log2 max {} <= log2 min {}",
                self.histogram_log2_max, self.histogram_log2_min
            )));
        }

        if self.min_eye_adaptation <= 0.0 || self.max_eye_adaptation <= 0.0 {
            return Err(ExposureError::invalid_settings(format!(
                "eye adaptation bounds must be positive, got [{}, {}]",
                self.min_eye_adaptation, self.max_eye_adaptation
            )));
        }

        if self.eye_adaptation_speed_up < 0.0 || self.eye_adaptation_speed_down < 0.0 {
            return Err(ExposureError::invalid_settings(format!(
                "adaptation speeds must not be negative, got up {} down {}",
                self.eye_adaptation_speed_up, self.eye_adaptation_speed_down
            )));
        }

        let scale = self.exposure_scale_linear();
        if !scale.is_finite() || scale <= 0.0 {
            return Err(ExposureError::invalid_settings(format!(
                "exposure_scale of {} stops is out of range, 2^scale = {scale}",
                self.exposure_scale
            )));
        }

        // Largest exposure the adaptation pass can write.
        let (min_adaptation, _) = self.effective_adaptation_range();
        let max_exposure = scale / min_adaptation;
        if !max_exposure.is_finite() {
            return Err(ExposureError::invalid_settings(format!(
                "exposure_scale {} over min_eye_adaptation {min_adaptation} overflows",
                self.exposure_scale
            )));
        }

        Ok(())
    }

    /// Percentile window `(low, high)` with both ends in `[0, 1]` and
    /// `low <= high`.
    pub fn effective_percentiles(&self) -> (f32, f32) {
        let high = self.histogram_pct_high.clamp(0.0, 1.0);
        let low = self.histogram_pct_low.clamp(0.0, 1.0).min(high);
        (low, high)
    }

    /// Adapted luminance bounds `(min, max)` with `min <= max`.
    pub fn effective_adaptation_range(&self) -> (f32, f32) {
        (
            self.min_eye_adaptation.min(self.max_eye_adaptation),
            self.max_eye_adaptation,
        )
    }

    /// Linear exposure multiplier, `2^exposure_scale`.
    pub fn exposure_scale_linear(&self) -> f32 {
        self.exposure_scale.exp2()
    }
}

/// Linear map from log2 luminance to a normalized histogram position.
///
/// Histogram construction and the adaptation pass must agree on where a
/// luminance lands, so both go through this type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramMapping {
    pub scale: f32,
    pub offset: f32,
}

impl HistogramMapping {
    pub fn from_settings(settings: &PostProcessSettings) -> Self {
        let diff = settings.histogram_log2_max - settings.histogram_log2_min;
        let scale = 1.0 / diff;
        let offset = -settings.histogram_log2_min * scale;
        Self { scale, offset }
    }

    /// Normalized `[0, 1]` histogram position of a linear luminance.
    pub fn position(&self, luminance: f32) -> f32 {
        (luminance.max(LUMINANCE_EPSILON).log2() * self.scale + self.offset).clamp(0.0, 1.0)
    }

    /// Linear luminance at a normalized histogram position.
    pub fn luminance(&self, position: f32) -> f32 {
        ((position - self.offset) / self.scale).exp2()
    }

    pub fn as_vec2(&self) -> Vec2 {
        Vec2::new(self.scale, self.offset)
    }
}

/// Smallest luminance fed to `log2`; keeps black texels out of `-inf`.
pub const LUMINANCE_EPSILON: f32 = 1.0e-6;

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1.0e-4
    }

    #[test]
    fn mapping_spans_the_configured_range() {
        let settings = PostProcessSettings::default().with_histogram_range(-10.0, 4.0);
        let mapping = HistogramMapping::from_settings(&settings);

        assert!(approx(mapping.scale, 0.0714));
        assert!(approx(mapping.offset, 0.7143));
        assert!(approx(mapping.scale * (4.0 - -10.0), 1.0));
        assert!(approx(mapping.offset, 10.0 * mapping.scale));
    }

    #[test]
    fn mapping_positions_saturate() {
        let mapping = HistogramMapping::from_settings(&PostProcessSettings::default());
        assert_eq!(mapping.position(0.0), 0.0);
        assert_eq!(mapping.position(1.0e9), 1.0);
        assert!(approx(mapping.position(2f32.powf(-8.0)), 0.0));
        assert!(approx(mapping.position(16.0), 1.0));
    }

    #[test]
    fn mapping_inverse_roundtrips_inside_range() {
        let mapping = HistogramMapping::from_settings(&PostProcessSettings::default());
        let lum = 0.37;
        assert!(approx(mapping.luminance(mapping.position(lum)), lum));
    }

    #[test]
    fn inverted_percentiles_are_clamped() {
        let settings = PostProcessSettings::default().with_percentiles(0.9, 0.4);
        assert_eq!(settings.effective_percentiles(), (0.4, 0.4));

        let settings = PostProcessSettings::default().with_percentiles(-1.0, 3.0);
        assert_eq!(settings.effective_percentiles(), (0.0, 1.0));
    }

    #[test]
    fn inverted_adaptation_range_is_clamped() {
        let settings = PostProcessSettings::default().with_adaptation_range(5.0, 2.0);
        assert_eq!(settings.effective_adaptation_range(), (2.0, 2.0));
    }

    #[test]
    fn empty_histogram_range_is_rejected() {
        let settings = PostProcessSettings::default().with_histogram_range(2.0, 2.0);
        assert!(matches!(
            settings.validate(),
            Err(ExposureError::InvalidSettings(_))
        ));

        let settings = PostProcessSettings::default().with_histogram_range(4.0, -4.0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let settings = PostProcessSettings::default().with_exposure_scale(f32::NAN);
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("exposure_scale"));
    }

    #[test]
    fn exposure_scale_must_stay_representable() {
        let overflow = PostProcessSettings::default().with_exposure_scale(128.0);
        let err = overflow.validate().unwrap_err();
        assert!(matches!(err, ExposureError::InvalidSettings(_)));
        assert!(err.to_string().contains("exposure_scale"));

        let underflow = PostProcessSettings::default().with_exposure_scale(-160.0);
        assert!(matches!(
            underflow.validate(),
            Err(ExposureError::InvalidSettings(_))
        ));

        assert!(PostProcessSettings::default().with_exposure_scale(10.0).validate().is_ok());
    }

    #[test]
    fn exposure_over_min_adaptation_must_not_overflow() {
        // 2^127 is finite; dividing by a tiny bound is not.
        let settings = PostProcessSettings::default()
            .with_exposure_scale(127.0)
            .with_adaptation_range(1.0e-3, 2.0);
        assert!(settings.exposure_scale_linear().is_finite());
        assert!(matches!(
            settings.validate(),
            Err(ExposureError::InvalidSettings(_))
        ));
    }

    #[test]
    fn non_positive_adaptation_bounds_are_rejected() {
        let settings = PostProcessSettings::default().with_adaptation_range(0.0, 1.0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let settings =
            PostProcessSettings::from_json(r#"{ "histogram_log2_min": -10, "exposure_scale": 1.5 }"#)
                .unwrap();
        assert_eq!(settings.histogram_log2_min, -10.0);
        assert_eq!(settings.exposure_scale, 1.5);
        assert_eq!(settings.histogram_log2_max, 4.0);
    }

    #[test]
    fn invalid_json_settings_fail_validation() {
        let err = PostProcessSettings::from_json(r#"{ "histogram_log2_max": -9 }"#).unwrap_err();
        assert!(matches!(err, ExposureError::InvalidSettings(_)));
    }
}
