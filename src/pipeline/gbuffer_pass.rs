//! G-Buffer generation pass for deferred rendering
//!
//! Renders the culled geometry to multiple render targets (MRT):
//! - Albedo (base color)
//! - World-space normals (encoded)
//! - Material properties (metallic, roughness)
//! - Depth buffer
//!
//! Geometry comes straight from the culling pass's indirect buffer, one indirect-count
//! draw per mega-buffer block. The vertex shader finds per-instance data through
//! `instance_index`, which the culling shader sets to the batch's instance.

use crate::backend::*;
use crate::pipeline::culling::{CullingPass, IndirectTargets};
use crate::pipeline::{region_binding, FRAME_UNIFORMS_WGSL, SCENE_DATA_WGSL};
use crate::render_graph::{RenderGraph, TextureDesc, TextureHandle};
use crate::resources::{MaterialTextureArray, RingBuffer};
use crate::scene::MegaBufferBlock;

pub const ALBEDO_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
pub const NORMAL_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
pub const MATERIAL_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

const GBUFFER_SHADER_BODY: &str = r#"
@group(0) @binding(0) var<uniform> frame: FrameUniforms;
@group(0) @binding(1) var<storage, read> instances: array<ObjectInstanceData>;
@group(0) @binding(2) var<storage, read> matrices: array<ObjectMatrices>;
@group(0) @binding(3) var material_textures: texture_2d_array<f32>;
@group(0) @binding(4) var material_sampler: sampler;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) tangent: vec4<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_normal: vec3<f32>,
    @location(1) world_tangent: vec4<f32>,
    @location(2) uv: vec2<f32>,
    // albedo, normal, metallic-roughness layers
    @location(3) @interpolate(flat) layers: vec3<u32>,
}

struct GBufferOutput {
    @location(0) albedo: vec4<f32>,
    @location(1) normal: vec4<f32>,
    @location(2) material: vec4<f32>,
}

@vertex
fn vs_main(input: VertexInput, @builtin(instance_index) instance_index: u32) -> VertexOutput {
    let instance = instances[instance_index];
    let object = matrices[instance.wvp_offset / WVP_STRIDE];
    let world_pos = object.world * vec4<f32>(input.position, 1.0);

    var output: VertexOutput;
    output.clip_position = frame.camera.view_proj * world_pos;
    output.world_normal = normalize((object.normal * vec4<f32>(input.normal, 0.0)).xyz);
    let tangent = (object.world * vec4<f32>(input.tangent.xyz, 0.0)).xyz;
    output.world_tangent = vec4<f32>(normalize(tangent), input.tangent.w);
    output.uv = input.uv;
    output.layers = vec3<u32>(
        instance.albedo_index,
        instance.normal_index,
        instance.metallic_roughness_index,
    );
    return output;
}

@fragment
fn fs_main(input: VertexOutput) -> GBufferOutput {
    let albedo = textureSample(material_textures, material_sampler, input.uv, input.layers.x);
    let normal_sample = textureSample(material_textures, material_sampler, input.uv, input.layers.y);
    let metallic_roughness = textureSample(material_textures, material_sampler, input.uv, input.layers.z);

    // Tangent-space normal map to world space
    let n = normalize(input.world_normal);
    let t = normalize(input.world_tangent.xyz - n * dot(n, input.world_tangent.xyz));
    let b = cross(n, t) * input.world_tangent.w;
    let normal = normalize(mat3x3<f32>(t, b, n) * (normal_sample.xyz * 2.0 - 1.0));

    var output: GBufferOutput;
    output.albedo = vec4<f32>(albedo.rgb, 1.0);
    output.normal = vec4<f32>(normal * 0.5 + 0.5, 1.0);
    // Material: R = metallic, G = roughness
    output.material = vec4<f32>(metallic_roughness.b, metallic_roughness.g, 0.0, 1.0);
    return output;
}
"#;

/// G-Buffer generation shader
pub fn gbuffer_shader() -> String {
    format!("{}{}{}", SCENE_DATA_WGSL, FRAME_UNIFORMS_WGSL, GBUFFER_SHADER_BODY)
}

/// Handles of the G-buffer targets for this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GBufferOutputs {
    pub albedo: TextureHandle,
    pub normal: TextureHandle,
    pub material: TextureHandle,
    pub depth: TextureHandle,
}

impl Default for GBufferOutputs {
    fn default() -> Self {
        Self {
            albedo: TextureHandle::INVALID,
            normal: TextureHandle::INVALID,
            material: TextureHandle::INVALID,
            depth: TextureHandle::INVALID,
        }
    }
}

/// G-Buffer generation pass for deferred rendering
pub struct GBufferPass {
    pipeline: RenderPipelineHandle,
    /// One per frame in flight, bound to that frame's ring regions
    bind_groups: Vec<BindGroupHandle>,
}

impl GBufferPass {
    pub fn new(
        device: &mut dyn Device,
        culling: &CullingPass,
        uniforms: &RingBuffer,
        materials: &MaterialTextureArray,
    ) -> BackendResult<Self> {
        let layout = device.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::VERTEX_FRAGMENT,
                ty: BindingType::UniformBuffer,
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::VERTEX,
                ty: BindingType::StorageBuffer { read_only: true },
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStageFlags::VERTEX,
                ty: BindingType::StorageBuffer { read_only: true },
            },
            BindGroupLayoutEntry {
                binding: 3,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Float { filterable: true },
                    dimension: TextureViewDimension::D2Array,
                },
            },
            BindGroupLayoutEntry {
                binding: 4,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Sampler { comparison: false },
            },
        ])?;

        let mut bind_groups = Vec::with_capacity(uniforms.frames_in_flight() as usize);
        for frame in 0..uniforms.frames_in_flight() {
            bind_groups.push(device.create_bind_group(
                layout,
                &[
                    (0, region_binding(uniforms, frame)),
                    (1, region_binding(culling.instance_buffer(), frame)),
                    (2, region_binding(culling.matrix_buffer(), frame)),
                    (3, BindGroupEntry::Texture(materials.view())),
                    (4, BindGroupEntry::Sampler(materials.sampler())),
                ],
            )?);
        }

        let color_target = |format| ColorTargetState {
            format,
            write_mask: ColorWrites::ALL,
        };
        let pipeline = device
            .create_render_pipeline(&RenderPipelineDescriptor {
                label: Some("gbuffer".into()),
                shader: gbuffer_shader(),
                has_fragment: true,
                vertex_layouts: vec![Vertex::layout()],
                bind_group_layouts: vec![layout],
                push_constant_ranges: Vec::new(),
                primitive_topology: PrimitiveTopology::TriangleList,
                front_face: FrontFace::Ccw,
                cull_mode: CullMode::Back,
                depth_stencil: Some(DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: CompareFunction::Less,
                    depth_bias: 0,
                    depth_bias_slope_scale: 0.0,
                }),
                color_targets: vec![
                    color_target(ALBEDO_FORMAT),
                    color_target(NORMAL_FORMAT),
                    color_target(MATERIAL_FORMAT),
                ],
            })
            .map_err(|err| {
                log::error!("Failed to create G-buffer pipeline: {}", err);
                err
            })?;

        Ok(Self {
            pipeline,
            bind_groups,
        })
    }

    /// Declare the G-buffer targets and record the indirect geometry draws
    pub fn add_to_graph(
        &self,
        graph: &mut RenderGraph,
        device: &mut dyn Device,
        width: u32,
        height: u32,
        targets: IndirectTargets,
        blocks: &[MegaBufferBlock],
    ) -> GBufferOutputs {
        let mut outputs = GBufferOutputs::default();
        let pipeline = self.pipeline;
        let bind_group = self.bind_groups[graph.frame_index() as usize % self.bind_groups.len()];
        let blocks = blocks.to_vec();

        graph.add_node(
            device,
            "GBuffer",
            |builder| {
                outputs.albedo = builder.create_color(
                    "gbuffer_albedo",
                    TextureDesc::render_target(ALBEDO_FORMAT, width, height),
                );
                outputs.normal = builder.create_color(
                    "gbuffer_normal",
                    TextureDesc::render_target(NORMAL_FORMAT, width, height),
                );
                outputs.material = builder.create_color(
                    "gbuffer_material",
                    TextureDesc::render_target(MATERIAL_FORMAT, width, height),
                );
                outputs.depth = builder.create_depth(
                    "gbuffer_depth",
                    TextureDesc::render_target(DEPTH_FORMAT, width, height),
                );
            },
            move |ctx| {
                ctx.set_full_viewport();
                let cmd = ctx.cmd();
                cmd.bind_graphics_pipeline(pipeline);
                cmd.bind_descriptor_set(0, bind_group);
                targets.draw_blocks(cmd, &blocks);
            },
        );

        outputs
    }

    pub fn destroy(&mut self, device: &mut dyn Device) {
        for bind_group in self.bind_groups.drain(..) {
            device.destroy_bind_group(bind_group);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::culling::frame_ring;
    use crate::pipeline::FrameUniforms;
    use crate::RendererConfig;

    #[test]
    fn test_gbuffer_declares_four_targets() {
        let mut device = HeadlessBackend::new();
        let config = RendererConfig::default();
        let culling = CullingPass::new(&mut device, &config).unwrap();
        let uniforms = frame_ring(
            &mut device,
            "frame_uniforms",
            FrameUniforms::SIZE,
            256,
            3,
            BufferUsage::UNIFORM,
        )
        .unwrap();
        let materials = MaterialTextureArray::new(&mut device, 4, 4).unwrap();
        let pass = GBufferPass::new(&mut device, &culling, &uniforms, &materials).unwrap();

        let mut graph = RenderGraph::new();
        graph.reset(0);
        let outputs = pass.add_to_graph(&mut graph, &mut device, 640, 480, culling.targets(0), &[]);

        let node = &graph.nodes()[0];
        assert_eq!(node.name(), "GBuffer");
        assert_eq!(node.color_outputs().len(), 3);
        assert_eq!(node.depth_output().map(|a| a.handle), Some(outputs.depth));
        assert_eq!(node.dimensions(), (640, 480));
        assert_eq!(graph.pool().desc(outputs.normal).unwrap().format, NORMAL_FORMAT);

        graph.compile(&mut device).unwrap();
        graph.execute(&mut device);
        assert!(device
            .commands()
            .iter()
            .any(|c| matches!(c, RecordedCommand::BindGraphicsPipeline(p) if *p == pass.pipeline)));
    }
}
