//! The eye adaptation pipeline: four stages and the orchestrator running them.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────────┐   ┌─────────────────┐   ┌───────────────┐
//! │ Downsample │──▶│ HistogramBuild │──▶│ HistogramReduce │──▶│ EyeAdaptation │
//! │  (draw)    │   │  (dispatch)    │   │  (draw)         │   │  (draw)       │
//! └────────────┘   └────────────────┘   └─────────────────┘   └───────────────┘
//!                                               ▲                      │
//!                                               └── last exposure ─────┘
//!                                                   (next frame)
//! ```
//!
//! Every stage implements [`Stage`]: `execute` acquires its output from the
//! pool and records one draw or dispatch, `release` hands the output back.
//! [`PostProcessing`] interleaves the two according to [`SCHEDULE`], so each
//! intermediate is held only between its producer and its last consumer.
//!
//! The exposure written by [`EyeAdaptation`] lives in a ping-pong pair inside
//! [`PipelineState`] and is read by the *next* frame's reduce pass, which
//! gives the adaptation a deliberate one-frame lag.

mod downsample;
mod eye_adaptation;
mod histogram;
mod pipeline;
mod stage;
mod state;

pub use downsample::{Downsample, DownsampleParams, downsampled_size};
pub use eye_adaptation::{
    EyeAdaptation, EyeAdaptationParams, adapt_exposure, histogram_average_luminance,
    luminance_from_exposure, smooth_adaptation,
};
pub use histogram::{
    HISTOGRAM_BINS, HISTOGRAM_FORMAT, HistogramBuild, HistogramParams, HistogramReduce,
    HistogramReduceParams, LOOP_COUNT, THREAD_GROUP_SIZE, texels_per_group, thread_group_count,
};
pub use pipeline::{PostProcessing, SCHEDULE, Step};
pub use stage::{FrameInputs, Stage, StageContext, StageKind};
pub use state::{AdaptationHistory, EYE_ADAPTATION_FORMAT, PipelineState};
