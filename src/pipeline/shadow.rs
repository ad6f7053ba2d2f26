//! Cascaded shadow map rendering
//!
//! Every cascade re-runs GPU culling against its own light frustum into a private
//! indirect buffer, then draws depth into one layer of a shared depth array. The
//! instance, batch and matrix rings are borrowed from the main [`CullingPass`].

use crate::backend::*;
use crate::pipeline::cascade::{build_cascades, CascadeData, CASCADE_COUNT};
use crate::pipeline::culling::{
    frame_ring, write_frustum, CullingDispatch, CullingPass, CullingPushConstants, CullingTarget,
    FRUSTUM_STRIDE,
};
use crate::pipeline::{region_binding, SCENE_DATA_WGSL};
use crate::resources::RingBuffer;
use crate::scene::{Camera, DirectionalLight, MegaBufferBlock};
use crate::RendererConfig;
use glam::Mat4;

pub const SHADOW_FORMAT: TextureFormat = TextureFormat::Depth32Float;

const DEPTH_BIAS: i32 = 2;
const DEPTH_BIAS_SLOPE_SCALE: f32 = 2.0;

const SHADOW_SHADER_BODY: &str = r#"
@group(0) @binding(0) var<storage, read> instances: array<ObjectInstanceData>;
@group(0) @binding(1) var<storage, read> matrices: array<ObjectMatrices>;

struct ShadowParams {
    light_view_proj: mat4x4<f32>,
}

var<push_constant> params: ShadowParams;

@vertex
fn vs_main(
    @location(0) position: vec3<f32>,
    @builtin(instance_index) instance_index: u32,
) -> @builtin(position) vec4<f32> {
    let instance = instances[instance_index];
    let world = matrices[instance.wvp_offset / WVP_STRIDE].world;
    return params.light_view_proj * world * vec4<f32>(position, 1.0);
}
"#;

/// Depth-only caster shader
pub fn shadow_shader() -> String {
    format!("{}{}", SCENE_DATA_WGSL, SHADOW_SHADER_BODY)
}

/// GPU objects that render one cascade layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CascadeLayer {
    view: ImageViewHandle,
    render_pass: RenderPassHandle,
    framebuffer: FramebufferHandle,
}

/// Owns the shadow map array and the per-cascade culling outputs
pub struct ShadowPass {
    texture: ImageHandle,
    array_view: ImageViewHandle,
    sampler: SamplerHandle,
    layers: Vec<CascadeLayer>,
    pipeline: RenderPipelineHandle,
    bind_groups: Vec<BindGroupHandle>,
    culling_pipeline: ComputePipelineHandle,
    frustums: RingBuffer,
    targets: Vec<CullingTarget>,
    size: u32,
    split_lambda: f32,
    max_batches: u32,
    max_batches_per_block: u32,
}

impl ShadowPass {
    pub fn new(
        device: &mut dyn Device,
        culling: &CullingPass,
        config: &RendererConfig,
    ) -> BackendResult<Self> {
        let shared = culling.shared_resources();
        let size = config.shadow_map_size;
        let frames = config.frames_in_flight;

        let texture = device
            .create_texture(&TextureDescriptor {
                label: Some("shadow_cascades".into()),
                width: size,
                height: size,
                array_layers: CASCADE_COUNT as u32,
                mip_levels: 1,
                format: SHADOW_FORMAT,
                usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
            })
            .map_err(|err| {
                log::error!("Failed to create shadow map: {}", err);
                err
            })?;
        let array_view = device.create_texture_view(texture, &TextureViewDescriptor::array())?;
        let sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("shadow_compare".into()),
            compare: Some(CompareFunction::LessEqual),
            mipmap_filter: FilterMode::Nearest,
            ..Default::default()
        })?;

        let mut layers = Vec::with_capacity(CASCADE_COUNT);
        for cascade in 0..CASCADE_COUNT as u32 {
            let view =
                device.create_texture_view(texture, &TextureViewDescriptor::single_layer(cascade))?;
            let render_pass = device.create_render_pass(&RenderPassLayout {
                label: Some(format!("shadow_cascade_{}", cascade)),
                color_attachments: Vec::new(),
                depth_attachment: Some(AttachmentLayout {
                    format: SHADOW_FORMAT,
                    load_op: LoadOp::Clear([1.0, 0.0, 0.0, 0.0]),
                    store_op: StoreOp::Store,
                }),
            })?;
            let framebuffer = device.create_framebuffer(&FramebufferDescriptor {
                label: Some(format!("shadow_cascade_{}", cascade)),
                render_pass,
                attachments: vec![view],
                width: size,
                height: size,
            })?;
            layers.push(CascadeLayer {
                view,
                render_pass,
                framebuffer,
            });
        }

        let bind_group_layout = device.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::VERTEX,
                ty: BindingType::StorageBuffer { read_only: true },
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::VERTEX,
                ty: BindingType::StorageBuffer { read_only: true },
            },
        ])?;
        let mut bind_groups = Vec::with_capacity(frames as usize);
        for frame in 0..frames {
            bind_groups.push(device.create_bind_group(
                bind_group_layout,
                &[
                    (0, region_binding(shared.instances, frame)),
                    (1, region_binding(shared.matrices, frame)),
                ],
            )?);
        }

        let pipeline = device
            .create_render_pipeline(&RenderPipelineDescriptor {
                label: Some("shadow_depth".into()),
                shader: shadow_shader(),
                has_fragment: false,
                vertex_layouts: vec![Vertex::position_only_layout()],
                bind_group_layouts: vec![bind_group_layout],
                push_constant_ranges: vec![PushConstantRange {
                    stages: ShaderStageFlags::VERTEX,
                    range: 0..std::mem::size_of::<Mat4>() as u32,
                }],
                primitive_topology: PrimitiveTopology::TriangleList,
                front_face: FrontFace::Ccw,
                // The clip correction flips Y, which reverses winding
                cull_mode: CullMode::None,
                depth_stencil: Some(DepthStencilState {
                    format: SHADOW_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: CompareFunction::LessEqual,
                    depth_bias: DEPTH_BIAS,
                    depth_bias_slope_scale: DEPTH_BIAS_SLOPE_SCALE,
                }),
                color_targets: Vec::new(),
            })
            .map_err(|err| {
                log::error!("Failed to create shadow pipeline: {}", err);
                err
            })?;

        let frustums = frame_ring(
            device,
            "shadow_frustums",
            FRUSTUM_STRIDE * CASCADE_COUNT as u64,
            shared.alignment,
            frames,
            BufferUsage::STORAGE,
        )?;
        let mut targets = Vec::with_capacity(CASCADE_COUNT);
        for cascade in 0..CASCADE_COUNT {
            targets.push(CullingTarget::new(
                device,
                &format!("shadow_cull_{}", cascade),
                &shared,
                &frustums,
            )?);
        }

        log::info!(
            "Shadow pass ready: {} cascades at {}x{}",
            CASCADE_COUNT,
            size,
            size
        );

        Ok(Self {
            texture,
            array_view,
            sampler,
            layers,
            pipeline,
            bind_groups,
            culling_pipeline: shared.pipeline,
            frustums,
            targets,
            size,
            split_lambda: config.cascade_split_lambda,
            max_batches: shared.max_batches,
            max_batches_per_block: shared.max_batches_per_block,
        })
    }

    /// Compute this frame's cascades and upload their frusta
    pub fn prepare(
        &mut self,
        device: &mut dyn Device,
        frame_index: u32,
        camera: &Camera,
        sun: &DirectionalLight,
        total_batches: u32,
    ) -> ShadowFrame {
        self.frustums.reset(frame_index);
        let frame_index = self.frustums.frame_index();

        let cascades = build_cascades(
            camera.view_projection_matrix(),
            camera.near,
            camera.far,
            self.split_lambda,
            sun.sun_direction(),
            self.size,
        );

        let total_batches = total_batches.min(self.max_batches);
        let dispatches = std::array::from_fn(|i| {
            let frustum_offset = write_frustum(&mut self.frustums, cascades[i].view_proj);
            self.targets[i].dispatch(
                self.culling_pipeline,
                frame_index,
                CullingPushConstants::new(total_batches, frustum_offset, self.max_batches_per_block),
            )
        });
        self.frustums.flush(device);

        ShadowFrame {
            cascades,
            dispatches,
            layers: std::array::from_fn(|i| (self.layers[i].render_pass, self.layers[i].framebuffer)),
            pipeline: self.pipeline,
            bind_group: self.bind_groups[frame_index as usize],
            size: self.size,
        }
    }

    pub fn texture(&self) -> ImageHandle {
        self.texture
    }

    /// All cascades as a 2D array, for sampling
    pub fn array_view(&self) -> ImageViewHandle {
        self.array_view
    }

    /// Comparison sampler for PCF lookups
    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn texture_desc(&self) -> crate::render_graph::TextureDesc {
        crate::render_graph::TextureDesc::new(
            SHADOW_FORMAT,
            self.size,
            self.size,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        )
        .with_layers(CASCADE_COUNT as u32)
    }

    pub fn destroy(&mut self, device: &mut dyn Device) {
        for target in &mut self.targets {
            target.destroy(device);
        }
        self.targets.clear();
        self.frustums.destroy(device);
        for bind_group in self.bind_groups.drain(..) {
            device.destroy_bind_group(bind_group);
        }
        for layer in self.layers.drain(..) {
            device.destroy_framebuffer(layer.framebuffer);
            device.destroy_render_pass(layer.render_pass);
            device.destroy_texture_view(layer.view);
        }
        device.destroy_texture_view(self.array_view);
        device.destroy_texture(self.texture);
    }
}

/// One frame of shadow work, ready to be moved into a render graph node
#[derive(Debug, Clone, Copy)]
pub struct ShadowFrame {
    pub cascades: [CascadeData; CASCADE_COUNT],
    dispatches: [CullingDispatch; CASCADE_COUNT],
    layers: [(RenderPassHandle, FramebufferHandle); CASCADE_COUNT],
    pipeline: RenderPipelineHandle,
    bind_group: BindGroupHandle,
    size: u32,
}

impl ShadowFrame {
    pub fn dispatch(&self, cascade: usize) -> &CullingDispatch {
        &self.dispatches[cascade]
    }

    /// Cull and draw every cascade, then make the depth visible to later passes
    pub fn record(&self, cmd: &mut dyn GraphicsContext, blocks: &[MegaBufferBlock]) {
        for ((cascade, dispatch), (render_pass, framebuffer)) in
            self.cascades.iter().zip(&self.dispatches).zip(self.layers)
        {
            dispatch.record(cmd);

            cmd.begin_render_pass(render_pass, framebuffer);
            cmd.set_viewport(0.0, 0.0, self.size as f32, self.size as f32, 0.0, 1.0);
            cmd.set_scissor(0, 0, self.size, self.size);
            cmd.bind_graphics_pipeline(self.pipeline);
            cmd.bind_descriptor_set(0, self.bind_group);
            cmd.push_constants(
                ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&cascade.view_proj),
            );
            dispatch.targets.draw_blocks(cmd, blocks);
            cmd.end_render_pass();
        }
        cmd.global_barrier();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{CollectedDrawData, MaterialLayers, MegaBufferBuilder, MeshData};
    use glam::Vec3;
    use std::collections::HashSet;

    fn config() -> RendererConfig {
        RendererConfig {
            max_instances: 32,
            max_batches: 32,
            max_batches_per_block: 16,
            max_mega_buffer_blocks: 2,
            shadow_map_size: 1024,
            ..Default::default()
        }
    }

    fn scene(device: &mut HeadlessBackend) -> (CollectedDrawData, Vec<MegaBufferBlock>) {
        let mut builder = MegaBufferBuilder::new(1024, 2);
        let cube = builder.add_mesh(&MeshData::cube()).unwrap();
        let geometry = builder.build(device).unwrap();

        let camera = Camera::default();
        let mut data = CollectedDrawData::new(&camera);
        for i in 0..4 {
            data.push(
                &cube,
                Mat4::from_translation(Vec3::new(i as f32, 0.0, 0.0)),
                MaterialLayers::default(),
            );
        }
        let blocks = data.finalize(&geometry);
        (data, blocks)
    }

    #[test]
    fn test_shadow_map_resources() {
        let mut device = HeadlessBackend::new();
        let config = config();
        let culling = CullingPass::new(&mut device, &config).unwrap();
        let render_passes = device.render_pass_count();
        let shadow = ShadowPass::new(&mut device, &culling, &config).unwrap();

        let desc = device.texture_descriptor(shadow.texture()).unwrap();
        assert_eq!(desc.array_layers, 4);
        assert_eq!(desc.format, TextureFormat::Depth32Float);
        assert_eq!((desc.width, desc.height), (1024, 1024));
        assert_eq!(device.render_pass_count(), render_passes + 4);
        assert_eq!(device.view_texture(shadow.array_view()), Some(shadow.texture()));
    }

    #[test]
    fn test_cascade_recording_order() {
        let mut device = HeadlessBackend::new();
        let config = config();
        let mut culling = CullingPass::new(&mut device, &config).unwrap();
        let mut shadow = ShadowPass::new(&mut device, &culling, &config).unwrap();
        let (data, blocks) = scene(&mut device);

        culling.upload_scene_data(&mut device, 0, &data);
        let frame = shadow.prepare(
            &mut device,
            0,
            &Camera::default(),
            &DirectionalLight::default(),
            data.total_batches,
        );
        assert_eq!(frame.cascades[3].split_depth, Camera::default().far);
        device.take_commands();
        frame.record(&mut device, &blocks);

        let commands = device.take_commands();
        let position = |pred: &dyn Fn(&RecordedCommand) -> bool| -> Vec<usize> {
            commands
                .iter()
                .enumerate()
                .filter(|(_, c)| pred(c))
                .map(|(i, _)| i)
                .collect()
        };
        let dispatches = position(&|c| matches!(c, RecordedCommand::Dispatch { .. }));
        let begins = position(&|c| matches!(c, RecordedCommand::BeginRenderPass { .. }));
        let ends = position(&|c| matches!(c, RecordedCommand::EndRenderPass));
        let draws = position(&|c| matches!(c, RecordedCommand::DrawIndexedIndirectCount(_)));

        assert_eq!(dispatches.len(), 4);
        assert_eq!(begins.len(), 4);
        assert_eq!(draws.len(), 4);
        for i in 0..4 {
            assert!(dispatches[i] < begins[i]);
            assert!(begins[i] < draws[i] && draws[i] < ends[i]);
        }
        assert_eq!(commands.last(), Some(&RecordedCommand::GlobalBarrier));
    }

    #[test]
    fn test_cascades_use_private_indirect_buffers() {
        let mut device = HeadlessBackend::new();
        let config = config();
        let culling = CullingPass::new(&mut device, &config).unwrap();
        let mut shadow = ShadowPass::new(&mut device, &culling, &config).unwrap();

        let frame = shadow.prepare(
            &mut device,
            1,
            &Camera::default(),
            &DirectionalLight::default(),
            4,
        );
        let main_targets = culling.targets(1);
        let mut buffers: HashSet<_> = (0..CASCADE_COUNT)
            .map(|i| frame.dispatch(i).targets.indirect_buffer)
            .collect();
        buffers.insert(main_targets.indirect_buffer);
        assert_eq!(buffers.len(), CASCADE_COUNT + 1);

        // Each cascade reads a different frustum record
        let offsets: Vec<_> = (0..CASCADE_COUNT)
            .map(|i| frame.dispatch(i).push_constants.frustum_offset)
            .collect();
        assert_eq!(offsets, vec![0, 256, 512, 768]);
    }

    #[test]
    fn test_fallback_reads_count_after_fence() {
        let mut device = HeadlessBackend::without_draw_indirect_count();
        let config = config();
        let mut culling = CullingPass::new(&mut device, &config).unwrap();
        let mut shadow = ShadowPass::new(&mut device, &culling, &config).unwrap();
        let (data, blocks) = scene(&mut device);

        culling.upload_scene_data(&mut device, 0, &data);
        let frame = shadow.prepare(
            &mut device,
            0,
            &Camera::default(),
            &DirectionalLight::default(),
            data.total_batches,
        );
        device.take_commands();
        frame.record(&mut device, &blocks);

        let commands = device.take_commands();
        let waits = commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::WaitIdle))
            .count();
        assert_eq!(waits, 4);
        assert!(!commands
            .iter()
            .any(|c| matches!(c, RecordedCommand::DrawIndexedIndirectCount(_))));
        // The headless counters stay at the cleared value, so nothing is drawn
        assert!(!commands
            .iter()
            .any(|c| matches!(c, RecordedCommand::DrawIndexedIndirect { .. })));
    }
}
