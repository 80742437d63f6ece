//! Records the exposure passes into a wgpu command encoder.
//!
//! [`WgpuCommands`] is the [`CommandSink`] for real GPUs: each fullscreen draw
//! becomes a render pass, the histogram build becomes a compute pass. Nothing
//! reaches the queue until [`WgpuCommands::submit`].
//!
//! [`ExposureRenderer`] bundles pool, shaders, passes and state for callers that
//! just want an exposure texture per frame.

use std::collections::BTreeMap;

use wgpu::util::DeviceExt;

use crate::commands::{CommandSink, Program, SceneColor, TextureSource};
use crate::error::{ExposureError, Result};
use crate::gpu::GpuContext;
use crate::post_processing::{PipelineState, PostProcessing, StageContext};
use crate::render_target::{PooledTarget, RenderTargetPool};
use crate::settings::PostProcessSettings;
use crate::shader_library::{ShaderLibrary, extra_binding, texture_binding};
use crate::texture_pool::TexturePool;

/// wgpu implementation of [`CommandSink`].
///
/// Bind calls that fail to resolve a view (for example a target the pool no
/// longer owns) are remembered and reported by the next draw or dispatch.
pub struct WgpuCommands<'a> {
    gpu: &'a GpuContext,
    pool: &'a TexturePool,
    shaders: &'a mut ShaderLibrary,
    scene: &'a wgpu::TextureView,
    encoder: wgpu::CommandEncoder,

    program: Option<Program>,
    textures: BTreeMap<u32, wgpu::TextureView>,
    storage: Option<wgpu::TextureView>,
    params: Option<Vec<u8>>,
    target: Option<(wgpu::TextureView, wgpu::TextureFormat)>,
    deferred_error: Option<ExposureError>,
    passes: usize,
}

impl<'a> WgpuCommands<'a> {
    /// Start recording. `scene` is the view [`TextureSource::SceneColor`]
    /// resolves to.
    pub fn new(
        gpu: &'a GpuContext,
        pool: &'a TexturePool,
        shaders: &'a mut ShaderLibrary,
        scene: &'a wgpu::TextureView,
    ) -> Self {
        let encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Eyelight Encoder"),
            });

        Self {
            gpu,
            pool,
            shaders,
            scene,
            encoder,
            program: None,
            textures: BTreeMap::new(),
            storage: None,
            params: None,
            target: None,
            deferred_error: None,
            passes: 0,
        }
    }

    /// Finish the encoder and hand it to the queue.
    pub fn submit(self) {
        tracing::trace!(passes = self.passes, "submitting exposure passes");
        self.gpu.queue.submit(std::iter::once(self.encoder.finish()));
    }

    fn defer(&mut self, err: ExposureError) {
        if self.deferred_error.is_none() {
            self.deferred_error = Some(err);
        }
    }

    fn check_deferred(&mut self) -> Result<()> {
        match self.deferred_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
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

    fn uniform_buffer(&self, program: Program) -> Result<wgpu::Buffer> {
        let params = self.params.as_deref().ok_or(ExposureError::MissingInput {
            stage: program.label(),
            input: "parameters",
        })?;
        Ok(self
            .gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(program.label()),
                contents: params,
                usage: wgpu::BufferUsages::UNIFORM,
            }))
    }

    fn bind_group(&self, program: Program, uniforms: &wgpu::Buffer) -> Result<wgpu::BindGroup> {
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: uniforms.as_entire_binding(),
        }];

        for slot in 0..program.texture_slots() {
            let view = self.textures.get(&slot).ok_or(ExposureError::MissingInput {
                stage: program.label(),
                input: "sampled texture",
            })?;
            entries.push(wgpu::BindGroupEntry {
                binding: texture_binding(slot),
                resource: wgpu::BindingResource::TextureView(view),
            });
        }

        match program {
            Program::Downsample => entries.push(wgpu::BindGroupEntry {
                binding: extra_binding(program),
                resource: wgpu::BindingResource::Sampler(self.shaders.point_sampler()),
            }),
            Program::HistogramBuild => {
                let view = self.storage.as_ref().ok_or(ExposureError::MissingInput {
                    stage: program.label(),
                    input: "storage texture",
                })?;
                entries.push(wgpu::BindGroupEntry {
                    binding: extra_binding(program),
                    resource: wgpu::BindingResource::TextureView(view),
                });
            }
            Program::HistogramReduce | Program::EyeAdaptation => {}
        }

        Ok(self
            .gpu
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(program.label()),
                layout: self.shaders.bind_group_layout(program),
                entries: &entries,
            }))
    }
}

impl CommandSink for WgpuCommands<'_> {
    fn bind_program(&mut self, program: Program) {
        self.program = Some(program);
        self.textures.clear();
        self.storage = None;
        self.params = None;
    }

    fn bind_texture(&mut self, slot: u32, source: TextureSource<'_>) {
        let view = match source {
            TextureSource::SceneColor => self.scene.clone(),
            TextureSource::White => self.shaders.white().clone(),
            TextureSource::Pooled(target) => match self.pool.view(target.id()) {
                Ok(view) => view,
                Err(err) => return self.defer(err),
            },
        };
        self.textures.insert(slot, view);
    }

    fn bind_storage_texture(&mut self, _slot: u32, target: &PooledTarget) {
        match self.pool.view(target.id()) {
            Ok(view) => self.storage = Some(view),
            Err(err) => self.defer(err),
        }
    }

    fn bind_parameters(&mut self, _slot: u32, data: &[u8]) {
        self.params = Some(data.to_vec());
    }

    fn set_render_target(&mut self, target: &PooledTarget) {
        match self.pool.view(target.id()) {
            Ok(view) => self.target = Some((view, target.format())),
            Err(err) => self.defer(err),
        }
    }

    fn draw_fullscreen_quad(&mut self) -> Result<()> {
        self.check_deferred()?;
        let program = self.bound_program(false)?;
        let (view, format) = self.target.clone().ok_or(ExposureError::MissingInput {
            stage: program.label(),
            input: "render target",
        })?;

        let uniforms = self.uniform_buffer(program)?;
        let bind_group = self.bind_group(program, &uniforms)?;
        let pipeline = self
            .shaders
            .render_pipeline(&self.gpu.device, program, format)
            .clone();

        {
            let mut render_pass = self.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(program.label()),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            render_pass.set_pipeline(&pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.draw(0..3, 0..1);
        }

        self.passes += 1;
        Ok(())
    }

    fn dispatch_compute(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) -> Result<()> {
        self.check_deferred()?;
        let program = self.bound_program(true)?;

        let uniforms = self.uniform_buffer(program)?;
        let bind_group = self.bind_group(program, &uniforms)?;

        {
            let mut compute_pass = self.encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(program.label()),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(self.shaders.compute_pipeline());
            compute_pass.set_bind_group(0, &bind_group, &[]);
            compute_pass.dispatch_workgroups(groups_x, groups_y, groups_z);
        }

        self.passes += 1;
        Ok(())
    }
}

/// Copy the most recent exposure back to the CPU.
///
/// Blocks until the GPU has finished. Returns `None` before the first frame.
pub fn read_exposure(
    gpu: &GpuContext,
    pool: &TexturePool,
    state: &PipelineState,
) -> Result<Option<f32>> {
    let Some(target) = state.eye_adaptation().latest() else {
        return Ok(None);
    };
    let texture = pool.texture(target.id())?;

    // Rows of a texture copy must be 256-byte aligned.
    let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Eyelight Exposure Readback"),
        size: wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as u64,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Eyelight Readback Encoder"),
        });
    encoder.copy_texture_to_buffer(
        texture.as_image_copy(),
        wgpu::TexelCopyBufferInfo {
            buffer: &buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT),
                rows_per_image: Some(1),
            },
        },
        wgpu::Extent3d {
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
        },
    );
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let slice = buffer.slice(..);
    let (tx, rx) = futures::channel::oneshot::channel();
    slice.map_async(wgpu::MapMode::Read, move |res| {
        let _ = tx.send(res);
    });
    gpu.device
        .poll(wgpu::PollType::wait_indefinitely())
        .map_err(|e| ExposureError::readback(format!("poll failed: {e:?}")))?;
    pollster::block_on(rx)
        .map_err(|_| ExposureError::readback("map callback dropped"))?
        .map_err(|e| ExposureError::readback(format!("map failed: {e}")))?;

    let exposure = {
        let mapped = slice.get_mapped_range();
        bytemuck::pod_read_unaligned::<f32>(&mapped[..4])
    };
    buffer.unmap();

    Ok(Some(exposure))
}

/// Everything needed to run eye adaptation on one view with wgpu.
///
/// # Example
///
/// ```no_run
/// use eyelight::{ExposureRenderer, GpuContext, PostProcessSettings, SceneColor};
///
/// # fn frame(scene_view: &wgpu::TextureView) -> eyelight::Result<()> {
/// let gpu = GpuContext::new_headless()?;
/// let mut exposure = ExposureRenderer::new(&gpu, PostProcessSettings::default())?;
///
/// let scene = SceneColor::new(1920, 1080, wgpu::TextureFormat::Rgba16Float);
/// exposure.render(&gpu, scene_view, &scene, 1.0 / 60.0)?;
/// let tonemap_input = exposure.exposure_view();
/// # Ok(())
/// # }
/// ```
pub struct ExposureRenderer {
    pool: TexturePool,
    shaders: ShaderLibrary,
    post: PostProcessing,
    state: PipelineState,
}

impl ExposureRenderer {
    pub fn new(gpu: &GpuContext, settings: PostProcessSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            pool: TexturePool::new(gpu),
            shaders: ShaderLibrary::new(gpu),
            post: PostProcessing::new(),
            state: PipelineState::new(settings),
        })
    }

    /// Record and submit one frame of exposure passes over `scene_view`.
    ///
    /// A failed frame submits nothing.
    pub fn render(
        &mut self,
        gpu: &GpuContext,
        scene_view: &wgpu::TextureView,
        scene: &SceneColor,
        frame_delta: f32,
    ) -> Result<()> {
        let mut commands = WgpuCommands::new(gpu, &self.pool, &mut self.shaders, scene_view);
        let mut ctx = StageContext::new(&self.pool, &mut commands);
        self.post
            .post_process(&mut ctx, scene, &mut self.state, frame_delta)?;
        commands.submit();
        Ok(())
    }

    /// View of the latest exposure texel, for the tonemapper to sample.
    pub fn exposure_view(&self) -> Option<wgpu::TextureView> {
        let target = self.state.eye_adaptation().latest()?;
        self.pool.view(target.id()).ok()
    }

    /// Blocking readback of the latest exposure.
    pub fn read_exposure(&self, gpu: &GpuContext) -> Result<Option<f32>> {
        read_exposure(gpu, &self.pool, &self.state)
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

    pub fn pool(&self) -> &TexturePool {
        &self.pool
    }

    pub fn passes(&self) -> &PostProcessing {
        &self.post
    }
}

impl Drop for ExposureRenderer {
    fn drop(&mut self) {
        self.state.dispose(&self.pool);
        tracing::debug!(outstanding = self.pool.outstanding(), "exposure renderer dropped");
    }
}
