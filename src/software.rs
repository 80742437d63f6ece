//! CPU backend: a render target pool and a command sink over `f32` images.
//!
//! Runs the same four programs as the WGSL in [`crate::shader_library`], one
//! texel at a time. Useful without a GPU, in tests, and as a reference when a
//! driver disagrees with the expected exposure.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::commands::{CommandSink, Program, SceneColor, TextureSource};
use crate::error::{ExposureError, Result};
use crate::post_processing::{
    DownsampleParams, EyeAdaptationParams, HISTOGRAM_BINS, HistogramParams, HistogramReduceParams,
    LOOP_COUNT, PipelineState, PostProcessing, StageContext, THREAD_GROUP_SIZE, adapt_exposure,
    luminance_from_exposure,
};
use crate::render_target::{PooledTarget, RenderTargetDesc, RenderTargetPool, TargetId};
use crate::settings::{HistogramMapping, PostProcessSettings};

/// Rec. 709 luminance weights.
const LUMINANCE_WEIGHTS: [f32; 3] = [0.2126, 0.7152, 0.0722];

fn luminance(color: [f32; 4]) -> f32 {
    color[..3]
        .iter()
        .zip(LUMINANCE_WEIGHTS)
        .map(|(c, w)| c * w)
        .sum()
}

/// Row-major RGBA `f32` image.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftwareImage {
    width: u32,
    height: u32,
    texels: Vec<[f32; 4]>,
}

impl SoftwareImage {
    /// Image with every texel set to `color`.
    pub fn filled(width: u32, height: u32, color: [f32; 4]) -> Self {
        Self {
            width,
            height,
            texels: vec![color; width as usize * height as usize],
        }
    }

    /// Image whose texel `(x, y)` is `f(x, y)`.
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> [f32; 4]) -> Self {
        let texels = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| f(x, y))
            .collect();
        Self {
            width,
            height,
            texels,
        }
    }

    /// Convert a decoded image. 8-bit sources map to `[0, 1]`; HDR sources
    /// keep their range.
    pub fn from_dynamic(image: &image::DynamicImage) -> Self {
        let rgba = image.to_rgba32f();
        let (width, height) = rgba.dimensions();
        let texels = rgba.pixels().map(|p| p.0).collect();
        Self {
            width,
            height,
            texels,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Shape of this image as a scene colour input.
    pub fn scene_color(&self) -> SceneColor {
        SceneColor::new(self.width, self.height, wgpu::TextureFormat::Rgba32Float)
    }

    pub fn texel(&self, x: u32, y: u32) -> Option<[f32; 4]> {
        (x < self.width && y < self.height)
            .then(|| self.texels[(y * self.width + x) as usize])
    }

    /// Texel with coordinates clamped to the edge, like a clamp-to-edge sampler.
    pub fn texel_clamped(&self, x: u32, y: u32) -> [f32; 4] {
        let x = x.min(self.width.saturating_sub(1));
        let y = y.min(self.height.saturating_sub(1));
        self.texel(x, y).unwrap_or_default()
    }

    /// Texel as `textureLoad` sees it: zero outside the image.
    fn load(&self, x: u32, y: u32) -> [f32; 4] {
        self.texel(x, y).unwrap_or_default()
    }

    fn set(&mut self, x: u32, y: u32, color: [f32; 4]) {
        if x < self.width && y < self.height {
            self.texels[(y * self.width + x) as usize] = color;
        }
    }

    fn fill_with(&mut self, mut f: impl FnMut(u32, u32) -> [f32; 4]) {
        for y in 0..self.height {
            for x in 0..self.width {
                self.set(x, y, f(x, y));
            }
        }
    }

    /// Mean luminance over all texels.
    pub fn average_luminance(&self) -> f32 {
        if self.texels.is_empty() {
            return 0.0;
        }
        self.texels.iter().copied().map(luminance).sum::<f32>() / self.texels.len() as f32
    }
}

#[derive(Default)]
struct PoolInner {
    active: HashMap<TargetId, SoftwareImage>,
    free: HashMap<RenderTargetDesc, Vec<SoftwareImage>>,
    next_id: u64,
    acquires: usize,
}

/// [`RenderTargetPool`] handing out [`SoftwareImage`]s.
///
/// Returned images keep their contents, so a pass that forgets to overwrite
/// its output sees the previous holder's data, as it would on a GPU.
#[derive(Default)]
pub struct SoftwarePool {
    capacity: Option<usize>,
    inner: Mutex<PoolInner>,
}

impl SoftwarePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total successful acquires since creation.
    pub fn acquire_count(&self) -> usize {
        self.lock().acquires
    }

    pub fn free_count(&self) -> usize {
        self.lock().free.values().map(Vec::len).sum()
    }

    pub fn read_texel(&self, id: TargetId, x: u32, y: u32) -> Result<[f32; 4]> {
        let inner = self.lock();
        let image = inner.active.get(&id).ok_or(ExposureError::UnknownTarget(id.0))?;
        image.texel(x, y).ok_or_else(|| {
            ExposureError::readback(format!(
                "texel ({x}, {y}) outside {}x{} target",
                image.width, image.height
            ))
        })
    }

    /// Copy of a borrowed target's contents.
    pub fn image(&self, id: TargetId) -> Result<SoftwareImage> {
        self.lock()
            .active
            .get(&id)
            .cloned()
            .ok_or(ExposureError::UnknownTarget(id.0))
    }

    /// Overwrite every texel of a borrowed target.
    pub fn fill(&self, id: TargetId, color: [f32; 4]) -> Result<()> {
        self.with_image_mut(id, |image| image.fill_with(|_, _| color))
    }

    fn with_image_mut<R>(&self, id: TargetId, f: impl FnOnce(&mut SoftwareImage) -> R) -> Result<R> {
        let mut inner = self.lock();
        let image = inner
            .active
            .get_mut(&id)
            .ok_or(ExposureError::UnknownTarget(id.0))?;
        Ok(f(image))
    }
}

impl RenderTargetPool for SoftwarePool {
    fn acquire(&self, desc: &RenderTargetDesc) -> Result<PooledTarget> {
        let mut inner = self.lock();

        if let Some(capacity) = self.capacity
            && inner.active.len() >= capacity
        {
            return Err(ExposureError::PoolExhausted { capacity });
        }

        let image = inner
            .free
            .get_mut(desc)
            .and_then(Vec::pop)
            .unwrap_or_else(|| SoftwareImage::filled(desc.width, desc.height, [0.0; 4]));

        let id = TargetId(inner.next_id);
        inner.next_id += 1;
        inner.acquires += 1;
        inner.active.insert(id, image);

        Ok(PooledTarget::new(id, *desc))
    }

    fn release(&self, target: PooledTarget) {
        let mut inner = self.lock();
        match inner.active.remove(&target.id()) {
            Some(image) => inner.free.entry(*target.desc()).or_default().push(image),
            None => tracing::warn!(id = target.id().0, "released a target this pool does not own"),
        }
    }

    fn outstanding(&self) -> usize {
        self.lock().active.len()
    }
}

#[derive(Debug, Clone, Copy)]
enum Bound {
    Scene,
    Pooled(TargetId),
    White,
}

/// [`CommandSink`] executing each draw and dispatch immediately on the CPU.
pub struct SoftwareCommands<'a> {
    pool: &'a SoftwarePool,
    scene: &'a SoftwareImage,
    program: Option<Program>,
    textures: BTreeMap<u32, Bound>,
    storage: Option<TargetId>,
    params: Option<Vec<u8>>,
    target: Option<TargetId>,
    draws: usize,
    dispatches: usize,
}

impl<'a> SoftwareCommands<'a> {
    pub fn new(pool: &'a SoftwarePool, scene: &'a SoftwareImage) -> Self {
        Self {
            pool,
            scene,
            program: None,
            textures: BTreeMap::new(),
            storage: None,
            params: None,
            target: None,
            draws: 0,
            dispatches: 0,
        }
    }

    pub fn draw_count(&self) -> usize {
        self.draws
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches
    }

    fn bound_program(&self, compute: bool) -> Result<Program> {
        match self.program {
            Some(program) if program.is_compute() == compute => Ok(program),
            Some(program) => Err(ExposureError::device(format!(
                "{} cannot be {}",
                program.label(),
                if compute { "dispatched" } else { "drawn" }
            ))),
            None => Err(ExposureError::device("no program bound")),
        }
    }

    fn params<T: bytemuck::Pod>(&self, program: Program) -> Result<T> {
        let missing = ExposureError::MissingInput {
            stage: program.label(),
            input: "parameters",
        };
        match self.params.as_deref() {
            Some(bytes) if bytes.len() >= std::mem::size_of::<T>() => {
                Ok(bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<T>()]))
            }
            _ => Err(missing),
        }
    }

    /// Resolve a sampled slot. Scene colour is borrowed; pooled targets are
    /// copied out so the pool lock is not held while a pass runs.
    fn input(&self, program: Program, slot: u32) -> Result<Cow<'a, SoftwareImage>> {
        let bound = self.textures.get(&slot).ok_or(ExposureError::MissingInput {
            stage: program.label(),
            input: "sampled texture",
        })?;
        Ok(match *bound {
            Bound::Scene => Cow::Borrowed(self.scene),
            Bound::White => Cow::Owned(SoftwareImage::filled(1, 1, [1.0; 4])),
            Bound::Pooled(id) => Cow::Owned(self.pool.image(id)?),
        })
    }

    fn render_target(&self, program: Program) -> Result<TargetId> {
        self.target.ok_or(ExposureError::MissingInput {
            stage: program.label(),
            input: "render target",
        })
    }

    fn downsample(&self) -> Result<()> {
        let program = Program::Downsample;
        let source = self.input(program, 0)?;
        let _: DownsampleParams = self.params(program)?;

        self.pool.with_image_mut(self.render_target(program)?, |out| {
            out.fill_with(|x, y| {
                let (bx, by) = (x * 2, y * 2);
                let taps = [
                    source.texel_clamped(bx, by),
                    source.texel_clamped(bx + 1, by),
                    source.texel_clamped(bx, by + 1),
                    source.texel_clamped(bx + 1, by + 1),
                ];
                let mut sum = [0.0; 4];
                for tap in taps {
                    for (s, c) in sum.iter_mut().zip(tap) {
                        *s += c;
                    }
                }
                sum.map(|s| s * 0.25)
            })
        })
    }

    fn histogram(&self, groups_x: u32, groups_y: u32) -> Result<()> {
        let program = Program::HistogramBuild;
        let source = self.input(program, 0)?;
        let params: HistogramParams = self.params(program)?;
        let output = self.storage.ok_or(ExposureError::MissingInput {
            stage: program.label(),
            input: "storage texture",
        })?;

        let mapping = HistogramMapping {
            scale: params.histogram_params[0],
            offset: params.histogram_params[1],
        };
        let [off_x, off_y, size_x, size_y] = params.pixel_offset_and_size.map(|v| v.max(0) as u32);
        let last_bin = (HISTOGRAM_BINS - 1) as f32;
        let group_texels = THREAD_GROUP_SIZE * LOOP_COUNT;

        let mut rows = Vec::with_capacity((groups_x * groups_y) as usize);
        for gy in 0..groups_y {
            for gx in 0..groups_x {
                let mut bins = [0u32; HISTOGRAM_BINS as usize];
                let origin = (gx * group_texels.x, gy * group_texels.y);

                for ly in 0..THREAD_GROUP_SIZE.y {
                    for lx in 0..THREAD_GROUP_SIZE.x {
                        for y in 0..LOOP_COUNT.y {
                            for x in 0..LOOP_COUNT.x {
                                let tx = origin.0 + x * THREAD_GROUP_SIZE.x + lx;
                                let ty = origin.1 + y * THREAD_GROUP_SIZE.y + ly;
                                if tx >= size_x || ty >= size_y {
                                    continue;
                                }
                                let lum = luminance(source.load(off_x + tx, off_y + ty));
                                let bin = (mapping.position(lum) * last_bin + 0.5) as usize;
                                bins[bin] += 1;
                            }
                        }
                    }
                }

                let row = gx + gy * params.thread_group_count[0];
                rows.push((row, bins));
            }
        }

        self.pool.with_image_mut(output, |out| {
            for (row, bins) in rows {
                for (bin, count) in bins.into_iter().enumerate() {
                    out.set(bin as u32, row, [count as f32, 0.0, 0.0, 0.0]);
                }
            }
        })
    }

    fn histogram_reduce(&self) -> Result<()> {
        let program = Program::HistogramReduce;
        let histogram = self.input(program, 0)?;
        let eye_adaptation = self.input(program, 1)?;
        let params: HistogramReduceParams = self.params(program)?;

        let exposure = eye_adaptation.load(0, 0)[0];
        self.pool.with_image_mut(self.render_target(program)?, |out| {
            out.fill_with(|x, y| {
                let value = if y == 0 {
                    (0..params.num_histograms)
                        .map(|row| histogram.load(x, row)[0])
                        .sum::<f32>()
                } else {
                    exposure
                };
                [value, 0.0, 0.0, 0.0]
            })
        })
    }

    fn eye_adaptation(&self) -> Result<()> {
        let program = Program::EyeAdaptation;
        let reduced = self.input(program, 0)?;
        let params: EyeAdaptationParams = self.params(program)?;

        let bins: Vec<f32> = (0..HISTOGRAM_BINS).map(|x| reduced.load(x, 0)[0]).collect();
        let previous = reduced.load(0, 1)[0];
        let exposure = adapt_exposure(&bins, previous, &params);

        self.pool.with_image_mut(self.render_target(program)?, |out| {
            out.fill_with(|_, _| [exposure, 0.0, 0.0, 0.0])
        })
    }
}

impl CommandSink for SoftwareCommands<'_> {
    fn bind_program(&mut self, program: Program) {
        self.program = Some(program);
        self.textures.clear();
        self.storage = None;
        self.params = None;
    }

    fn bind_texture(&mut self, slot: u32, source: TextureSource<'_>) {
        let bound = match source {
            TextureSource::SceneColor => Bound::Scene,
            TextureSource::Pooled(target) => Bound::Pooled(target.id()),
            TextureSource::White => Bound::White,
        };
        self.textures.insert(slot, bound);
    }

    fn bind_storage_texture(&mut self, _slot: u32, target: &PooledTarget) {
        self.storage = Some(target.id());
    }

    fn bind_parameters(&mut self, _slot: u32, data: &[u8]) {
        self.params = Some(data.to_vec());
    }

    fn set_render_target(&mut self, target: &PooledTarget) {
        self.target = Some(target.id());
    }

    fn draw_fullscreen_quad(&mut self) -> Result<()> {
        match self.bound_program(false)? {
            Program::Downsample => self.downsample()?,
            Program::HistogramReduce => self.histogram_reduce()?,
            Program::EyeAdaptation => self.eye_adaptation()?,
            Program::HistogramBuild => return Err(ExposureError::device("compute program drawn")),
        }
        self.draws += 1;
        Ok(())
    }

    fn dispatch_compute(&mut self, groups_x: u32, groups_y: u32, _groups_z: u32) -> Result<()> {
        self.bound_program(true)?;
        self.histogram(groups_x, groups_y)?;
        self.dispatches += 1;
        Ok(())
    }
}

/// Eye adaptation for one view, computed on the CPU.
///
/// ```
/// use eyelight::{PostProcessSettings, SoftwareImage, SoftwareRenderer};
///
/// let mut renderer = SoftwareRenderer::new(PostProcessSettings::default()).unwrap();
/// let scene = SoftwareImage::filled(128, 128, [0.5, 0.5, 0.5, 1.0]);
///
/// assert_eq!(renderer.exposure(), None);
/// renderer.render(&scene, 1.0 / 60.0).unwrap();
/// assert!(renderer.exposure().is_some());
/// ```
pub struct SoftwareRenderer {
    pool: SoftwarePool,
    post: PostProcessing,
    state: PipelineState,
}

impl SoftwareRenderer {
    pub fn new(settings: PostProcessSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            pool: SoftwarePool::new(),
            post: PostProcessing::new(),
            state: PipelineState::new(settings),
        })
    }

    /// Run one frame over `scene`.
    pub fn render(&mut self, scene: &SoftwareImage, frame_delta: f32) -> Result<()> {
        let mut commands = SoftwareCommands::new(&self.pool, scene);
        let mut ctx = StageContext::new(&self.pool, &mut commands);
        self.post
            .post_process(&mut ctx, &scene.scene_color(), &mut self.state, frame_delta)
    }

    /// Exposure written by the most recent frame.
    pub fn exposure(&self) -> Option<f32> {
        let target = self.state.eye_adaptation().latest()?;
        self.pool.read_texel(target.id(), 0, 0).ok().map(|texel| texel[0])
    }

    /// Adapted scene luminance behind [`exposure`](Self::exposure).
    pub fn adapted_luminance(&self) -> Option<f32> {
        let scale = self.state.settings.exposure_scale_linear();
        self.exposure()
            .map(|exposure| luminance_from_exposure(exposure, scale))
    }

    pub fn settings(&self) -> &PostProcessSettings {
        &self.state.settings
    }

    pub fn set_settings(&mut self, settings: PostProcessSettings) -> Result<()> {
        settings.validate()?;
        self.state.settings = settings;
        Ok(())
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn pool(&self) -> &SoftwarePool {
        &self.pool
    }
}

impl Drop for SoftwareRenderer {
    fn drop(&mut self) {
        self.state.dispose(&self.pool);
    }
}
