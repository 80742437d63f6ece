//! Orchestration tests: command order, pool balance and failure handling,
//! recorded through a sink that only logs what it is asked to do.

use eyelight::post_processing::{HISTOGRAM_BINS, StageKind};
use eyelight::wgpu::TextureFormat;
use eyelight::{
    CommandSink, ExposureError, PipelineState, PooledTarget, PostProcessSettings, PostProcessing,
    Program, RenderTargetDesc, RenderTargetPool, SceneColor, SoftwarePool, StageContext, TargetId,
    TargetUsage, TextureSource,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Source {
    Scene,
    Pooled(TargetId),
    White,
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Program(Program),
    Texture(u32, Source),
    Storage(u32, TargetId),
    Params(u32, usize),
    Target(TargetId, u32, u32),
    Draw,
    Dispatch(u32, u32, u32),
}

#[derive(Default)]
struct RecordingSink {
    commands: Vec<Command>,
    /// Fail the draw with this zero-based index.
    fail_draw: Option<usize>,
    draws: usize,
}

impl RecordingSink {
    fn failing_draw(index: usize) -> Self {
        Self {
            fail_draw: Some(index),
            ..Self::default()
        }
    }

    fn programs(&self) -> Vec<Program> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::Program(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    /// Commands recorded after the given program was bound, up to the next one.
    fn commands_for(&self, program: Program) -> Vec<Command> {
        self.commands
            .iter()
            .skip_while(|c| **c != Command::Program(program))
            .skip(1)
            .take_while(|c| !matches!(c, Command::Program(_)))
            .cloned()
            .collect()
    }
}

impl CommandSink for RecordingSink {
    fn bind_program(&mut self, program: Program) {
        self.commands.push(Command::Program(program));
    }

    fn bind_texture(&mut self, slot: u32, source: TextureSource<'_>) {
        let source = match source {
            TextureSource::SceneColor => Source::Scene,
            TextureSource::Pooled(target) => Source::Pooled(target.id()),
            TextureSource::White => Source::White,
        };
        self.commands.push(Command::Texture(slot, source));
    }

    fn bind_storage_texture(&mut self, slot: u32, target: &PooledTarget) {
        self.commands.push(Command::Storage(slot, target.id()));
    }

    fn bind_parameters(&mut self, slot: u32, data: &[u8]) {
        self.commands.push(Command::Params(slot, data.len()));
    }

    fn set_render_target(&mut self, target: &PooledTarget) {
        self.commands
            .push(Command::Target(target.id(), target.width(), target.height()));
    }

    fn draw_fullscreen_quad(&mut self) -> eyelight::Result<()> {
        let index = self.draws;
        self.draws += 1;
        if self.fail_draw == Some(index) {
            return Err(ExposureError::device("injected draw failure"));
        }
        self.commands.push(Command::Draw);
        Ok(())
    }

    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) -> eyelight::Result<()> {
        self.commands.push(Command::Dispatch(x, y, z));
        Ok(())
    }
}

fn reference_settings() -> PostProcessSettings {
    PostProcessSettings::default()
        .with_histogram_range(-8.0, 4.0)
        .with_percentiles(0.2, 0.8)
        .with_adaptation_range(0.1, 10.0)
        .with_speeds(3.0, 1.0)
        .with_exposure_scale(0.0)
}

fn hd_scene() -> SceneColor {
    SceneColor::new(1920, 1080, TextureFormat::Rgba16Float)
}

fn run_frame(
    post: &mut PostProcessing,
    pool: &SoftwarePool,
    sink: &mut RecordingSink,
    state: &mut PipelineState,
    frame_delta: f32,
) -> eyelight::Result<()> {
    let mut ctx = StageContext::new(pool, sink);
    post.post_process(&mut ctx, &hd_scene(), state, frame_delta)
}

#[test]
fn stages_record_in_dependency_order() {
    let pool = SoftwarePool::new();
    let mut sink = RecordingSink::default();
    let mut state = PipelineState::new(reference_settings());

    run_frame(&mut PostProcessing::new(), &pool, &mut sink, &mut state, 0.016).unwrap();

    assert_eq!(
        sink.programs(),
        [
            Program::Downsample,
            Program::HistogramBuild,
            Program::HistogramReduce,
            Program::EyeAdaptation,
        ]
    );

    let downsample = sink.commands_for(Program::Downsample);
    assert_eq!(downsample[0], Command::Texture(0, Source::Scene));
    assert!(downsample.iter().any(|c| matches!(c, Command::Target(_, 960, 540))));
    assert_eq!(downsample.last(), Some(&Command::Draw));

    let build = sink.commands_for(Program::HistogramBuild);
    assert!(build.contains(&Command::Params(0, 32)));
    assert_eq!(build.last(), Some(&Command::Dispatch(15, 9, 1)));

    let reduce = sink.commands_for(Program::HistogramReduce);
    assert!(reduce.contains(&Command::Params(0, 16)));
    assert!(reduce.iter().any(|c| matches!(c, Command::Target(_, w, 2) if *w == HISTOGRAM_BINS)));

    let adapt = sink.commands_for(Program::EyeAdaptation);
    assert!(adapt.contains(&Command::Params(0, 48)));
    assert!(adapt.iter().any(|c| matches!(c, Command::Target(_, 1, 1))));
}

#[test]
fn each_stage_reads_the_previous_output() {
    let pool = SoftwarePool::new();
    let mut sink = RecordingSink::default();
    let mut state = PipelineState::new(reference_settings());

    run_frame(&mut PostProcessing::new(), &pool, &mut sink, &mut state, 0.016).unwrap();

    let output_of = |program| {
        sink.commands_for(program)
            .into_iter()
            .find_map(|c| match c {
                Command::Target(id, ..) | Command::Storage(_, id) => Some(id),
                _ => None,
            })
            .unwrap()
    };
    let input_of = |program| {
        sink.commands_for(program)
            .into_iter()
            .find_map(|c| match c {
                Command::Texture(0, Source::Pooled(id)) => Some(id),
                _ => None,
            })
            .unwrap()
    };

    assert_eq!(input_of(Program::HistogramBuild), output_of(Program::Downsample));
    assert_eq!(input_of(Program::HistogramReduce), output_of(Program::HistogramBuild));
    assert_eq!(input_of(Program::EyeAdaptation), output_of(Program::HistogramReduce));
}

#[test]
fn stages_remember_their_output_descriptors() {
    let pool = SoftwarePool::new();
    let mut post = PostProcessing::new();
    let mut state = PipelineState::new(reference_settings());
    assert!(post.downsample().output_desc().is_none());

    run_frame(&mut post, &pool, &mut RecordingSink::default(), &mut state, 0.016).unwrap();

    let desc = |format, width, height, usage| {
        RenderTargetDesc::new_2d(format, width, height, usage).unwrap()
    };
    assert_eq!(
        post.downsample().output_desc(),
        Some(&desc(TextureFormat::Rgba16Float, 960, 540, TargetUsage::RenderTarget))
    );
    assert_eq!(
        post.histogram().output_desc(),
        Some(&desc(TextureFormat::R32Float, HISTOGRAM_BINS, 15 * 9, TargetUsage::LoadStore))
    );
    assert_eq!(
        post.histogram_reduce().output_desc(),
        Some(&desc(TextureFormat::R32Float, HISTOGRAM_BINS, 2, TargetUsage::RenderTarget))
    );
}

#[test]
fn hd_frame_returns_every_intermediate() {
    let pool = SoftwarePool::new();
    let mut post = PostProcessing::new();
    let mut state = PipelineState::new(reference_settings());

    assert_eq!(pool.outstanding(), 0);
    run_frame(&mut post, &pool, &mut RecordingSink::default(), &mut state, 0.016).unwrap();

    // Only the two history targets stay borrowed.
    assert_eq!(pool.outstanding(), 2);
    assert_eq!(state.intermediates_held(), 0);
    assert!(state.downsampled_scene().is_none());
    assert!(state.histogram().is_none());
    assert!(state.histogram_reduce().is_none());

    let history = state.eye_adaptation();
    assert_eq!(history.frames_written(), 1);
    assert_eq!(history.last_written_index(), 1);

    for _ in 0..3 {
        run_frame(&mut post, &pool, &mut RecordingSink::default(), &mut state, 0.016).unwrap();
        assert_eq!(pool.outstanding(), 2);
    }

    state.dispose(&pool);
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn history_stays_borrowed_until_disposed() {
    let pool = SoftwarePool::new();
    let mut post = PostProcessing::new();

    {
        let mut state = PipelineState::new(reference_settings());
        run_frame(&mut post, &pool, &mut RecordingSink::default(), &mut state, 0.016).unwrap();
    }
    // Dropped without dispose: the history is never returned.
    assert_eq!(pool.outstanding(), 2);

    let mut state = PipelineState::new(reference_settings());
    run_frame(&mut post, &pool, &mut RecordingSink::default(), &mut state, 0.016).unwrap();
    assert_eq!(pool.outstanding(), 4);

    state.dispose(&pool);
    assert_eq!(pool.outstanding(), 2);
    assert!(!state.eye_adaptation().is_allocated());
    assert!(state.eye_adaptation().latest().is_none());
}

#[test]
fn history_index_alternates_with_frame_parity() {
    let pool = SoftwarePool::new();
    let mut post = PostProcessing::new();
    let mut state = PipelineState::new(reference_settings());
    let mut written = Vec::new();

    for frame in 1..=6u64 {
        let mut sink = RecordingSink::default();
        run_frame(&mut post, &pool, &mut sink, &mut state, 0.016).unwrap();

        let history = state.eye_adaptation();
        assert_eq!(history.frames_written(), frame);
        assert_eq!(history.last_written_index() as u64, frame % 2);

        let target = sink
            .commands_for(Program::EyeAdaptation)
            .into_iter()
            .find_map(|c| match c {
                Command::Target(id, ..) => Some(id),
                _ => None,
            })
            .unwrap();
        assert_eq!(Some(target), history.latest().map(PooledTarget::id));
        written.push(target);
    }

    // Two distinct targets, strictly alternating.
    assert_ne!(written[0], written[1]);
    for pair in written.windows(3) {
        assert_eq!(pair[0], pair[2]);
    }
}

#[test]
fn reduce_reads_white_first_and_the_last_write_afterwards() {
    let pool = SoftwarePool::new();
    let mut post = PostProcessing::new();
    let mut state = PipelineState::new(reference_settings());

    let mut sink = RecordingSink::default();
    run_frame(&mut post, &pool, &mut sink, &mut state, 0.016).unwrap();
    assert!(
        sink.commands_for(Program::HistogramReduce)
            .contains(&Command::Texture(1, Source::White))
    );

    let previous = state.eye_adaptation().latest().map(PooledTarget::id).unwrap();
    let mut sink = RecordingSink::default();
    run_frame(&mut post, &pool, &mut sink, &mut state, 0.016).unwrap();

    let reduce = sink.commands_for(Program::HistogramReduce);
    assert!(reduce.contains(&Command::Texture(1, Source::Pooled(previous))));
    assert!(!reduce.contains(&Command::Texture(1, Source::White)));
}

#[test]
fn pool_exhaustion_abandons_the_frame_without_leaking() {
    // Room for the intermediates but only one history target.
    let pool = SoftwarePool::with_capacity(2);
    let mut state = PipelineState::new(reference_settings());
    let mut sink = RecordingSink::default();

    let err = run_frame(&mut PostProcessing::new(), &pool, &mut sink, &mut state, 0.016)
        .unwrap_err();

    assert!(matches!(err, ExposureError::PoolExhausted { capacity: 2 }));
    assert!(err.is_frame_fatal());
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(state.intermediates_held(), 0);
    assert!(!state.eye_adaptation().is_allocated());
    assert_eq!(state.eye_adaptation().frames_written(), 0);
    assert!(!sink.programs().contains(&Program::EyeAdaptation));
}

#[test]
fn exhaustion_mid_pipeline_releases_what_was_acquired() {
    let pool = SoftwarePool::with_capacity(1);
    let mut state = PipelineState::new(reference_settings());

    let err = run_frame(
        &mut PostProcessing::new(),
        &pool,
        &mut RecordingSink::default(),
        &mut state,
        0.016,
    )
    .unwrap_err();

    assert!(matches!(err, ExposureError::PoolExhausted { .. }));
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn failed_draw_keeps_the_previous_exposure() {
    let pool = SoftwarePool::new();
    let mut post = PostProcessing::new();
    let mut state = PipelineState::new(reference_settings());

    run_frame(&mut post, &pool, &mut RecordingSink::default(), &mut state, 0.016).unwrap();
    let before = state.eye_adaptation().latest().map(PooledTarget::id);

    // Draws per frame: downsample, reduce, adaptation. Fail the last one.
    let err = run_frame(&mut post, &pool, &mut RecordingSink::failing_draw(2), &mut state, 0.016)
        .unwrap_err();
    assert!(matches!(err, ExposureError::Device(_)));

    let history = state.eye_adaptation();
    assert_eq!(history.frames_written(), 1);
    assert_eq!(history.latest().map(PooledTarget::id), before);
    assert_eq!(state.intermediates_held(), 0);
    assert_eq!(pool.outstanding(), 2);
}

#[test]
fn invalid_settings_record_nothing() {
    let pool = SoftwarePool::new();
    let mut sink = RecordingSink::default();
    let mut state = PipelineState::new(reference_settings().with_histogram_range(2.0, 2.0));

    let err = run_frame(&mut PostProcessing::new(), &pool, &mut sink, &mut state, 0.016)
        .unwrap_err();

    assert!(matches!(err, ExposureError::InvalidSettings(_)));
    assert!(!err.is_frame_fatal());
    assert!(sink.commands.is_empty());
    assert_eq!(pool.acquire_count(), 0);
}

#[test]
fn non_finite_frame_delta_is_rejected() {
    let pool = SoftwarePool::new();
    let mut sink = RecordingSink::default();
    let mut state = PipelineState::new(reference_settings());

    let err = run_frame(&mut PostProcessing::new(), &pool, &mut sink, &mut state, f32::NAN)
        .unwrap_err();
    assert!(matches!(err, ExposureError::InvalidSettings(_)));
    assert!(sink.commands.is_empty());
}

#[test]
fn negative_frame_delta_counts_as_zero() {
    let pool = SoftwarePool::new();
    let mut post = PostProcessing::new();
    let mut state = PipelineState::new(reference_settings());

    run_frame(&mut post, &pool, &mut RecordingSink::default(), &mut state, -0.5).unwrap();

    let params = post.eye_adaptation().last_params().unwrap();
    assert_eq!(params.frame_delta(), 0.0);
}

#[test]
fn stage_kinds_name_their_slots() {
    let mut state = PipelineState::default();
    for kind in StageKind::ALL {
        let has_slot = kind.intermediate_slot(&mut state).is_some();
        assert_eq!(has_slot, kind != StageKind::EyeAdaptation, "{}", kind.name());
    }
}
