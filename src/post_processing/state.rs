//! Per-view pipeline state threaded through every stage.

use crate::error::Result;
use crate::render_target::{
    PooledTarget, RenderTargetDesc, RenderTargetPool, TargetUsage, release_slot,
};
use crate::settings::PostProcessSettings;

/// Format of the 1x1 adaptation targets.
pub const EYE_ADAPTATION_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;

/// Ping-pong pair holding the exposure written by the last frames.
///
/// Both targets are allocated together on first use and kept until
/// [`PipelineState::dispose`]. Each frame writes the target the previous frame
/// did not, so the value being read is never the one being written.
#[derive(Debug, Default)]
pub struct AdaptationHistory {
    targets: Option<[PooledTarget; 2]>,
    last_written: usize,
    frames_written: u64,
}

impl AdaptationHistory {
    pub fn is_allocated(&self) -> bool {
        self.targets.is_some()
    }

    /// Index of the target holding the newest exposure.
    pub fn last_written_index(&self) -> usize {
        self.last_written
    }

    /// Number of frames that wrote an exposure value.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn targets(&self) -> Option<&[PooledTarget; 2]> {
        self.targets.as_ref()
    }

    /// Target holding the newest exposure, or `None` before the first write.
    pub fn latest(&self) -> Option<&PooledTarget> {
        if self.frames_written == 0 {
            return None;
        }
        self.targets.as_ref().map(|t| &t[self.last_written])
    }

    /// Allocate both targets if missing. All or nothing.
    pub(crate) fn ensure_allocated(&mut self, pool: &dyn RenderTargetPool) -> Result<()> {
        if self.targets.is_some() {
            return Ok(());
        }

        let desc = RenderTargetDesc::new_2d(EYE_ADAPTATION_FORMAT, 1, 1, TargetUsage::RenderTarget)?;
        let first = pool.acquire(&desc)?;
        let second = match pool.acquire(&desc) {
            Ok(target) => target,
            Err(err) => {
                pool.release(first);
                return Err(err);
            }
        };

        tracing::debug!("allocated eye adaptation history");
        self.targets = Some([first, second]);
        Ok(())
    }

    /// Index the next write goes to.
    pub(crate) fn next_index(&self) -> usize {
        (self.last_written + 1) % 2
    }

    pub(crate) fn target(&self, index: usize) -> Option<&PooledTarget> {
        self.targets.as_ref().map(|t| &t[index])
    }

    /// Mark `index` as the newest exposure after a successful write.
    pub(crate) fn commit(&mut self, index: usize) {
        self.last_written = index;
        self.frames_written += 1;
    }

    fn release(&mut self, pool: &dyn RenderTargetPool) {
        if let Some([a, b]) = self.targets.take() {
            pool.release(a);
            pool.release(b);
        }
        self.last_written = 0;
        self.frames_written = 0;
    }
}

/// Everything the exposure stages share for one view.
///
/// Create one per camera and keep it across frames: the adaptation history is
/// what makes exposure change smoothly. Intermediate targets are acquired and
/// released within a single [`post_process`](crate::PostProcessing::post_process)
/// call and are `None` between frames.
///
/// The two history targets stay borrowed from the pool until
/// [`dispose`](Self::dispose) is called. Dropping the state without it leaves
/// them outstanding for the pool's lifetime. [`ExposureRenderer`](crate::ExposureRenderer)
/// and [`SoftwareRenderer`](crate::SoftwareRenderer) dispose on drop.
#[derive(Debug, Default)]
pub struct PipelineState {
    /// Settings read by every stage; may be changed between frames.
    pub settings: PostProcessSettings,
    pub(crate) downsampled_scene: Option<PooledTarget>,
    pub(crate) histogram: Option<PooledTarget>,
    pub(crate) histogram_reduce: Option<PooledTarget>,
    pub(crate) eye_adaptation: AdaptationHistory,
}

impl PipelineState {
    pub fn new(settings: PostProcessSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    pub fn downsampled_scene(&self) -> Option<&PooledTarget> {
        self.downsampled_scene.as_ref()
    }

    pub fn histogram(&self) -> Option<&PooledTarget> {
        self.histogram.as_ref()
    }

    pub fn histogram_reduce(&self) -> Option<&PooledTarget> {
        self.histogram_reduce.as_ref()
    }

    pub fn eye_adaptation(&self) -> &AdaptationHistory {
        &self.eye_adaptation
    }

    /// Number of per-frame intermediate targets currently held.
    pub fn intermediates_held(&self) -> usize {
        [
            &self.downsampled_scene,
            &self.histogram,
            &self.histogram_reduce,
        ]
        .iter()
        .filter(|slot| slot.is_some())
        .count()
    }

    /// Return every per-frame intermediate to the pool. The history is kept.
    pub fn release_intermediates(&mut self, pool: &dyn RenderTargetPool) {
        release_slot(pool, &mut self.downsampled_scene);
        release_slot(pool, &mut self.histogram);
        release_slot(pool, &mut self.histogram_reduce);
    }

    /// Return everything, history included. The next frame starts from the
    /// neutral exposure again.
    pub fn dispose(&mut self, pool: &dyn RenderTargetPool) {
        self.release_intermediates(pool);
        self.eye_adaptation.release(pool);
    }
}
