//! The per-frame orchestrator.

use crate::commands::SceneColor;
use crate::error::{ExposureError, Result};
use crate::post_processing::{
    Downsample, EyeAdaptation, FrameInputs, HistogramBuild, HistogramReduce, PipelineState, Stage,
    StageContext, StageKind,
};

/// One entry of the frame schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Execute(StageKind),
    Release(StageKind),
}

/// Execute/release order of one frame.
///
/// Each release comes right after the last stage reading that output, so an
/// intermediate lives exactly from its producer to its last consumer:
///
/// ```text
/// Downsample       ████████
/// HistogramBuild       ████████
/// HistogramReduce          ████████
/// EyeAdaptation                ████  → history (kept)
/// ```
pub const SCHEDULE: [Step; 7] = [
    Step::Execute(StageKind::Downsample),
    Step::Execute(StageKind::HistogramBuild),
    Step::Release(StageKind::Downsample),
    Step::Execute(StageKind::HistogramReduce),
    Step::Release(StageKind::HistogramBuild),
    Step::Execute(StageKind::EyeAdaptation),
    Step::Release(StageKind::HistogramReduce),
];

/// Runs the four exposure stages once per frame.
///
/// # Example
///
/// ```ignore
/// let mut post = PostProcessing::new();
/// let mut state = PipelineState::new(PostProcessSettings::default());
///
/// // Every frame:
/// let mut ctx = StageContext::new(&pool, &mut commands);
/// post.post_process(&mut ctx, &scene, &mut state, frame_delta)?;
/// ```
#[derive(Debug, Default)]
pub struct PostProcessing {
    downsample: Downsample,
    histogram: HistogramBuild,
    histogram_reduce: HistogramReduce,
    eye_adaptation: EyeAdaptation,
}

impl PostProcessing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downsample(&self) -> &Downsample {
        &self.downsample
    }

    pub fn histogram(&self) -> &HistogramBuild {
        &self.histogram
    }

    pub fn histogram_reduce(&self) -> &HistogramReduce {
        &self.histogram_reduce
    }

    pub fn eye_adaptation(&self) -> &EyeAdaptation {
        &self.eye_adaptation
    }

    fn stage_mut(&mut self, kind: StageKind) -> &mut dyn Stage {
        match kind {
            StageKind::Downsample => &mut self.downsample,
            StageKind::HistogramBuild => &mut self.histogram,
            StageKind::HistogramReduce => &mut self.histogram_reduce,
            StageKind::EyeAdaptation => &mut self.eye_adaptation,
        }
    }

    /// Record the exposure passes for one frame.
    ///
    /// On success the adaptation history holds this frame's exposure and every
    /// intermediate target is back in the pool. On error the frame is
    /// abandoned: intermediates are still released and the history keeps the
    /// previous frame's value.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Pool and command sink to record through
    /// * `scene` - Shape of the scene colour the sink samples
    /// * `state` - This view's state; must persist across frames
    /// * `frame_delta` - Seconds since the previous frame; negative values count as 0
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(width = scene.width, height = scene.height, frame_delta = frame_delta)
    )]
    pub fn post_process(
        &mut self,
        ctx: &mut StageContext<'_>,
        scene: &SceneColor,
        state: &mut PipelineState,
        frame_delta: f32,
    ) -> Result<()> {
        state.settings.validate()?;
        if !frame_delta.is_finite() {
            return Err(ExposureError::invalid_settings(format!(
                "frame delta must be finite, got {frame_delta}"
            )));
        }

        let frame = FrameInputs {
            scene,
            frame_delta: frame_delta.max(0.0),
        };

        for step in SCHEDULE {
            match step {
                Step::Execute(kind) => {
                    if let Err(err) = self.stage_mut(kind).execute(ctx, &frame, state) {
                        tracing::warn!(stage = kind.name(), error = %err, "abandoning frame");
                        state.release_intermediates(ctx.pool);
                        return Err(err);
                    }
                }
                Step::Release(kind) => self.stage_mut(kind).release(ctx, state),
            }
        }

        debug_assert_eq!(state.intermediates_held(), 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_stage_executes_once_in_order() {
        let executed: Vec<StageKind> = SCHEDULE
            .iter()
            .filter_map(|step| match step {
                Step::Execute(kind) => Some(*kind),
                Step::Release(_) => None,
            })
            .collect();
        assert_eq!(executed, StageKind::ALL);
    }

    #[test]
    fn outputs_are_released_after_their_last_consumer() {
        let position = |step: Step| SCHEDULE.iter().position(|s| *s == step).unwrap();

        // A stage's output is read by the stage right after it.
        for pair in StageKind::ALL.windows(2) {
            let (producer, consumer) = (pair[0], pair[1]);
            assert!(position(Step::Release(producer)) > position(Step::Execute(consumer)));
        }
        assert!(
            position(Step::Release(StageKind::Downsample))
                < position(Step::Execute(StageKind::HistogramReduce))
        );
        assert!(!SCHEDULE.contains(&Step::Release(StageKind::EyeAdaptation)));
    }
}
