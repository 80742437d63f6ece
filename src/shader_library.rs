//! WGSL programs and wgpu pipelines for the exposure passes.
//!
//! Each [`Program`] gets one shader module and one bind group layout. Binding 0
//! is always the parameter block; sampled texture slot `n` sits at binding
//! `n + 1`; the downsample sampler and the histogram storage output take the
//! binding after the last texture.
//!
//! Render pipelines depend on the target format, so they are built lazily and
//! cached per `(program, format)`.

use std::collections::HashMap;

use crate::commands::Program;
use crate::gpu::GpuContext;
use crate::post_processing::{HISTOGRAM_BINS, HISTOGRAM_FORMAT, LOOP_COUNT, THREAD_GROUP_SIZE};

/// Binding index of sampled texture `slot`.
pub fn texture_binding(slot: u32) -> u32 {
    slot + 1
}

/// Binding index of the sampler or storage output of `program`.
pub fn extra_binding(program: Program) -> u32 {
    program.texture_slots() + 1
}

/// Full WGSL source of `program`, constants included.
pub fn shader_source(program: Program) -> String {
    let defines = format!(
        "const THREADGROUP_SIZE_X: u32 = {}u;\n\
         const THREADGROUP_SIZE_Y: u32 = {}u;\n\
         const LOOP_COUNT_X: u32 = {}u;\n\
         const LOOP_COUNT_Y: u32 = {}u;\n\
         const NUM_BINS: u32 = {}u;\n",
        THREAD_GROUP_SIZE.x, THREAD_GROUP_SIZE.y, LOOP_COUNT.x, LOOP_COUNT.y, HISTOGRAM_BINS
    );
    let body = match program {
        Program::Downsample => DOWNSAMPLE_SHADER,
        Program::HistogramBuild => HISTOGRAM_SHADER,
        Program::HistogramReduce => HISTOGRAM_REDUCE_SHADER,
        Program::EyeAdaptation => EYE_ADAPTATION_SHADER,
    };
    if program.is_compute() {
        format!("{defines}{body}")
    } else {
        format!("{defines}{FULLSCREEN_VERTEX}{body}")
    }
}

struct ProgramResources {
    module: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
}

/// Shader modules, layouts and pipelines of the four programs.
pub struct ShaderLibrary {
    programs: HashMap<Program, ProgramResources>,
    render_pipelines: HashMap<(Program, wgpu::TextureFormat), wgpu::RenderPipeline>,
    histogram_pipeline: wgpu::ComputePipeline,
    point_sampler: wgpu::Sampler,
    white: wgpu::TextureView,
}

impl ShaderLibrary {
    pub fn new(gpu: &GpuContext) -> Self {
        let device = &gpu.device;

        let programs: HashMap<Program, ProgramResources> = [
            Program::Downsample,
            Program::HistogramBuild,
            Program::HistogramReduce,
            Program::EyeAdaptation,
        ]
        .into_iter()
        .map(|program| (program, Self::create_program(device, program)))
        .collect();

        let histogram = &programs[&Program::HistogramBuild];
        let histogram_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Histogram Build Pipeline"),
            layout: Some(&histogram.pipeline_layout),
            module: &histogram.module,
            entry_point: Some("cs"),
            compilation_options: Default::default(),
            cache: None,
        });

        let point_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Eyelight Point Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let white = Self::create_white(gpu);

        Self {
            programs,
            render_pipelines: HashMap::new(),
            histogram_pipeline,
            point_sampler,
            white,
        }
    }

    fn create_white(gpu: &GpuContext) -> wgpu::TextureView {
        use wgpu::util::DeviceExt;

        let texture = gpu.device.create_texture_with_data(
            &gpu.queue,
            &wgpu::TextureDescriptor {
                label: Some("Eyelight White"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::R32Float,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            bytemuck::bytes_of(&1.0f32),
        );
        texture.create_view(&wgpu::TextureViewDescriptor::default())
    }

    fn create_program(device: &wgpu::Device, program: Program) -> ProgramResources {
        let visibility = if program.is_compute() {
            wgpu::ShaderStages::COMPUTE
        } else {
            wgpu::ShaderStages::FRAGMENT
        };

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program.label()),
            source: wgpu::ShaderSource::Wgsl(shader_source(program).into()),
        });

        // Parameter block
        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];

        // Sampled inputs. Histogram and exposure textures are R32Float, which
        // is not filterable.
        for slot in 0..program.texture_slots() {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: texture_binding(slot),
                visibility,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
        }

        match program {
            Program::Downsample => entries.push(wgpu::BindGroupLayoutEntry {
                binding: extra_binding(program),
                visibility,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                count: None,
            }),
            Program::HistogramBuild => entries.push(wgpu::BindGroupLayoutEntry {
                binding: extra_binding(program),
                visibility,
                ty: wgpu::BindingType::StorageTexture {
                    access: wgpu::StorageTextureAccess::WriteOnly,
                    format: HISTOGRAM_FORMAT,
                    view_dimension: wgpu::TextureViewDimension::D2,
                },
                count: None,
            }),
            Program::HistogramReduce | Program::EyeAdaptation => {}
        }

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(program.label()),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(program.label()),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        ProgramResources {
            module,
            bind_group_layout,
            pipeline_layout,
        }
    }

    pub fn bind_group_layout(&self, program: Program) -> &wgpu::BindGroupLayout {
        &self.programs[&program].bind_group_layout
    }

    pub fn point_sampler(&self) -> &wgpu::Sampler {
        &self.point_sampler
    }

    /// 1x1 R32Float texture holding 1.0.
    pub fn white(&self) -> &wgpu::TextureView {
        &self.white
    }

    pub fn compute_pipeline(&self) -> &wgpu::ComputePipeline {
        &self.histogram_pipeline
    }

    /// Fullscreen pipeline of `program` writing `format`, built on first use.
    pub fn render_pipeline(
        &mut self,
        device: &wgpu::Device,
        program: Program,
        format: wgpu::TextureFormat,
    ) -> &wgpu::RenderPipeline {
        let programs = &self.programs;
        self.render_pipelines
            .entry((program, format))
            .or_insert_with(|| {
                tracing::debug!(program = program.label(), ?format, "building render pipeline");
                let resources = &programs[&program];
                device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(program.label()),
                    layout: Some(&resources.pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &resources.module,
                        entry_point: Some("vs"),
                        buffers: &[],
                        compilation_options: Default::default(),
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &resources.module,
                        entry_point: Some("fs"),
                        targets: &[Some(wgpu::ColorTargetState {
                            format,
                            blend: None,
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                        compilation_options: Default::default(),
                    }),
                    primitive: wgpu::PrimitiveState {
                        topology: wgpu::PrimitiveTopology::TriangleList,
                        ..Default::default()
                    },
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                    cache: None,
                })
            })
    }
}

/// Fullscreen triangle covering the whole target.
const FULLSCREEN_VERTEX: &str = r#"
@vertex
fn vs(@builtin(vertex_index) vi: u32) -> @builtin(position) vec4f {
    let uv = vec2f(f32((vi << 1u) & 2u), f32(vi & 2u));
    return vec4f(uv * 2.0 - 1.0, 0.0, 1.0);
}
"#;

/// 2x2 box downsample. Four point samples at the texel centres of the source
/// block; clamp-to-edge covers the last row/column of odd sizes.
const DOWNSAMPLE_SHADER: &str = r#"
struct Params {
    inv_tex_size: vec2f,
    _padding: vec2f,
}

@group(0) @binding(0) var<uniform> p: Params;
@group(0) @binding(1) var input_tex: texture_2d<f32>;
@group(0) @binding(2) var input_sampler: sampler;

@fragment
fn fs(@builtin(position) pos: vec4f) -> @location(0) vec4f {
    let base = floor(pos.xy) * 2.0;
    let t = p.inv_tex_size;
    let c0 = textureSampleLevel(input_tex, input_sampler, (base + vec2f(0.5, 0.5)) * t, 0.0);
    let c1 = textureSampleLevel(input_tex, input_sampler, (base + vec2f(1.5, 0.5)) * t, 0.0);
    let c2 = textureSampleLevel(input_tex, input_sampler, (base + vec2f(0.5, 1.5)) * t, 0.0);
    let c3 = textureSampleLevel(input_tex, input_sampler, (base + vec2f(1.5, 1.5)) * t, 0.0);
    return (c0 + c1 + c2 + c3) * 0.25;
}
"#;

/// One histogram row per thread group. Each invocation owns one bin of the
/// group's shared histogram and visits LOOP_COUNT_X * LOOP_COUNT_Y texels.
const HISTOGRAM_SHADER: &str = r#"
struct Params {
    pixel_offset_and_size: vec4i,
    histogram_params: vec2f,
    thread_group_count: vec2u,
}

@group(0) @binding(0) var<uniform> p: Params;
@group(0) @binding(1) var scene_tex: texture_2d<f32>;
@group(0) @binding(2) var output_tex: texture_storage_2d<r32float, write>;

var<workgroup> shared_bins: array<atomic<u32>, NUM_BINS>;

fn luminance(color: vec3f) -> f32 {
    return dot(color, vec3f(0.2126, 0.7152, 0.0722));
}

fn histogram_position(lum: f32) -> f32 {
    return saturate(log2(max(lum, 1.0e-6)) * p.histogram_params.x + p.histogram_params.y);
}

@compute @workgroup_size(THREADGROUP_SIZE_X, THREADGROUP_SIZE_Y, 1)
fn cs(
    @builtin(workgroup_id) group_id: vec3u,
    @builtin(local_invocation_id) local_id: vec3u,
    @builtin(local_invocation_index) local_index: u32,
) {
    atomicStore(&shared_bins[local_index], 0u);
    workgroupBarrier();

    let offset = vec2u(p.pixel_offset_and_size.xy);
    let size = vec2u(p.pixel_offset_and_size.zw);
    let group_origin = group_id.xy * vec2u(THREADGROUP_SIZE_X * LOOP_COUNT_X, THREADGROUP_SIZE_Y * LOOP_COUNT_Y);

    for (var y = 0u; y < LOOP_COUNT_Y; y++) {
        for (var x = 0u; x < LOOP_COUNT_X; x++) {
            let texel = group_origin + vec2u(x * THREADGROUP_SIZE_X, y * THREADGROUP_SIZE_Y) + local_id.xy;
            if (texel.x < size.x && texel.y < size.y) {
                let color = textureLoad(scene_tex, vec2i(offset + texel), 0).rgb;
                let bin = u32(histogram_position(luminance(color)) * f32(NUM_BINS - 1u) + 0.5);
                atomicAdd(&shared_bins[bin], 1u);
            }
        }
    }

    workgroupBarrier();

    let row = group_id.x + group_id.y * p.thread_group_count.x;
    let count = f32(atomicLoad(&shared_bins[local_index]));
    textureStore(output_tex, vec2u(local_index, row), vec4f(count, 0.0, 0.0, 0.0));
}
"#;

/// Row 0: per-bin sum over all group histograms. Row 1: last exposure.
const HISTOGRAM_REDUCE_SHADER: &str = r#"
struct Params {
    num_histograms: u32,
    _padding0: u32,
    _padding1: u32,
    _padding2: u32,
}

@group(0) @binding(0) var<uniform> p: Params;
@group(0) @binding(1) var histogram_tex: texture_2d<f32>;
@group(0) @binding(2) var eye_adaptation_tex: texture_2d<f32>;

@fragment
fn fs(@builtin(position) pos: vec4f) -> @location(0) vec4f {
    let texel = vec2i(pos.xy);
    if (texel.y == 0) {
        var sum = 0.0;
        for (var row = 0u; row < p.num_histograms; row++) {
            sum += textureLoad(histogram_tex, vec2i(texel.x, i32(row)), 0).x;
        }
        return vec4f(sum, 0.0, 0.0, 0.0);
    }
    let exposure = textureLoad(eye_adaptation_tex, vec2i(0, 0), 0).x;
    return vec4f(exposure, 0.0, 0.0, 0.0);
}
"#;

/// Percentile-clipped average, clamp, asymmetric exponential smoothing.
const EYE_ADAPTATION_SHADER: &str = r#"
struct Params {
    eye_adaptation_params: array<vec4f, 3>,
}

@group(0) @binding(0) var<uniform> p: Params;
@group(0) @binding(1) var histogram_tex: texture_2d<f32>;

fn bin_count(i: u32) -> f32 {
    return textureLoad(histogram_tex, vec2i(i32(i), 0), 0).x;
}

fn luminance_at(position: f32) -> f32 {
    let scale = p.eye_adaptation_params[0].x;
    let offset = p.eye_adaptation_params[0].y;
    return exp2((position - offset) / scale);
}

fn histogram_average_luminance() -> f32 {
    var total = 0.0;
    for (var i = 0u; i < NUM_BINS; i++) {
        total += bin_count(i);
    }

    var low = total * p.eye_adaptation_params[0].z;
    var high = total * p.eye_adaptation_params[0].w;
    var weighted = vec2f(0.0, 0.0);

    for (var i = 0u; i < NUM_BINS; i++) {
        var count = bin_count(i);

        let below = min(count, low);
        count -= below;
        low -= below;
        high -= below;

        count = min(count, high);
        high -= count;

        let lum = luminance_at(f32(i) / f32(NUM_BINS - 1u));
        weighted += vec2f(lum * count, count);
    }

    return weighted.x / max(weighted.y, 0.0001);
}

@fragment
fn fs(@builtin(position) pos: vec4f) -> @location(0) vec4f {
    let min_adaptation = p.eye_adaptation_params[1].x;
    let max_adaptation = p.eye_adaptation_params[1].y;
    let speed_up = p.eye_adaptation_params[1].z;
    let speed_down = p.eye_adaptation_params[1].w;
    let exposure_scale = p.eye_adaptation_params[2].x;
    let frame_delta = p.eye_adaptation_params[2].y;

    let target_lum = clamp(histogram_average_luminance(), min_adaptation, max_adaptation);

    let old_exposure = textureLoad(histogram_tex, vec2i(0, 1), 0).x;
    let old_lum = exposure_scale / max(old_exposure, 1.0e-6);

    let diff = target_lum - old_lum;
    let speed = select(speed_down, speed_up, diff > 0.0);
    let factor = 1.0 - exp2(-frame_delta * speed);
    let adapted = clamp(old_lum + diff * factor, min_adaptation, max_adaptation);

    return vec4f(exposure_scale / adapted, 0.0, 0.0, 0.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_injected() {
        let source = shader_source(Program::HistogramBuild);
        assert!(source.contains("const NUM_BINS: u32 = 64u;"));
        assert!(source.contains("const THREADGROUP_SIZE_X: u32 = 8u;"));
        assert!(!source.contains("fn vs("));
    }

    #[test]
    fn fullscreen_programs_share_the_vertex_stage() {
        for program in [
            Program::Downsample,
            Program::HistogramReduce,
            Program::EyeAdaptation,
        ] {
            let source = shader_source(program);
            assert!(source.contains("fn vs("), "{program:?}");
            assert!(source.contains("fn fs("), "{program:?}");
        }
    }

    #[test]
    fn bindings_follow_the_slot_rule() {
        assert_eq!(texture_binding(0), 1);
        assert_eq!(extra_binding(Program::Downsample), 2);
        assert_eq!(extra_binding(Program::HistogramBuild), 2);
        assert!(shader_source(Program::HistogramReduce).contains("@binding(2) var eye_adaptation_tex"));
    }
}
