//! The stage trait shared by the four exposure passes.

use crate::commands::{CommandSink, SceneColor};
use crate::error::Result;
use crate::post_processing::PipelineState;
use crate::render_target::{PooledTarget, RenderTargetDesc, RenderTargetPool};

/// Collaborators a stage records through.
///
/// Created fresh for each frame and passed through every stage, so stages never
/// look up a device or pool on their own.
pub struct StageContext<'a> {
    /// Pool the stages borrow their outputs from.
    pub pool: &'a dyn RenderTargetPool,
    /// Recorder receiving binds, draws and dispatches.
    pub commands: &'a mut dyn CommandSink,
}

impl<'a> StageContext<'a> {
    pub fn new(pool: &'a dyn RenderTargetPool, commands: &'a mut dyn CommandSink) -> Self {
        Self { pool, commands }
    }

    /// Acquire a target into `slot`, releasing whatever the slot still held.
    pub(crate) fn acquire_into<'s>(
        &mut self,
        slot: &'s mut Option<PooledTarget>,
        desc: &RenderTargetDesc,
        stage: StageKind,
    ) -> Result<&'s PooledTarget> {
        if let Some(stale) = slot.take() {
            tracing::warn!(stage = stage.name(), "output slot still held a target; releasing it");
            self.pool.release(stale);
        }
        Ok(slot.insert(self.pool.acquire(desc)?))
    }
}

/// Per-frame inputs that do not live in [`PipelineState`].
#[derive(Debug, Clone, Copy)]
pub struct FrameInputs<'a> {
    pub scene: &'a SceneColor,
    /// Seconds since the previous frame.
    pub frame_delta: f32,
}

/// The closed set of exposure stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Downsample,
    HistogramBuild,
    HistogramReduce,
    EyeAdaptation,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Downsample,
        StageKind::HistogramBuild,
        StageKind::HistogramReduce,
        StageKind::EyeAdaptation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Downsample => "downsample",
            StageKind::HistogramBuild => "histogram_build",
            StageKind::HistogramReduce => "histogram_reduce",
            StageKind::EyeAdaptation => "eye_adaptation",
        }
    }

    /// The per-frame slot this stage fills, if its output is released within
    /// the frame. Eye adaptation writes the persistent history instead.
    pub fn intermediate_slot(self, state: &mut PipelineState) -> Option<&mut Option<PooledTarget>> {
        match self {
            StageKind::Downsample => Some(&mut state.downsampled_scene),
            StageKind::HistogramBuild => Some(&mut state.histogram),
            StageKind::HistogramReduce => Some(&mut state.histogram_reduce),
            StageKind::EyeAdaptation => None,
        }
    }
}

/// A unit of GPU work producing one pooled output.
///
/// # Execution Flow
///
/// 1. `execute()` binds inputs, derives parameters, acquires the output from
///    the pool and records one draw or dispatch
/// 2. later stages read the output through [`PipelineState`]
/// 3. `release()` returns the output once its last consumer has executed
pub trait Stage {
    fn kind(&self) -> StageKind;

    /// Record this stage's work.
    ///
    /// On error the output may already sit in its state slot; the caller
    /// releases it.
    fn execute(
        &mut self,
        ctx: &mut StageContext<'_>,
        frame: &FrameInputs<'_>,
        state: &mut PipelineState,
    ) -> Result<()>;

    /// Give this stage's output back to the pool.
    fn release(&mut self, ctx: &mut StageContext<'_>, state: &mut PipelineState) {
        if let Some(slot) = self.kind().intermediate_slot(state)
            && let Some(target) = slot.take()
        {
            ctx.pool.release(target);
        }
    }
}
