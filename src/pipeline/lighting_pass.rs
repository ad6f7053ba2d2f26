//! Deferred lighting pass
//!
//! Fullscreen pass that reads the G-buffer, reconstructs world positions from depth and
//! shades every pixel with the sun, attenuated by a 3x3 PCF lookup into the cascaded
//! shadow map. The result lands in an HDR target for the later passes.

use crate::backend::*;
use crate::pipeline::gbuffer_pass::GBufferOutputs;
use crate::pipeline::shadow::ShadowPass;
use crate::pipeline::{region_binding, BindGroupCache, FRAME_UNIFORMS_WGSL, FULLSCREEN_VERTEX_WGSL};
use crate::render_graph::{RenderGraph, TextureDesc, TextureHandle};
use crate::resources::RingBuffer;

pub const HDR_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

const LIGHTING_SHADER_BODY: &str = r#"
@group(0) @binding(0) var<uniform> frame: FrameUniforms;
@group(0) @binding(1) var gbuffer_albedo: texture_2d<f32>;
@group(0) @binding(2) var gbuffer_normal: texture_2d<f32>;
@group(0) @binding(3) var gbuffer_material: texture_2d<f32>;
@group(0) @binding(4) var gbuffer_depth: texture_depth_2d;
@group(0) @binding(5) var shadow_map: texture_depth_2d_array;
@group(0) @binding(6) var shadow_sampler: sampler_comparison;

// Reconstruct world position from depth
fn reconstruct_world_position(uv: vec2<f32>, depth: f32) -> vec3<f32> {
    let ndc = vec4<f32>(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0, depth, 1.0);
    let world_pos = frame.camera.inv_view_proj * ndc;
    return world_pos.xyz / world_pos.w;
}

fn select_cascade(view_depth: f32) -> u32 {
    for (var i = 0u; i < 3u; i++) {
        if view_depth < frame.cascades[i].split_depth {
            return i;
        }
    }
    return 3u;
}

// Fraction of the 3x3 neighbourhood that is lit
fn sample_shadow(world_pos: vec3<f32>, cascade: u32) -> f32 {
    let clip = frame.cascades[cascade].view_proj * vec4<f32>(world_pos, 1.0);
    let coords = clip.xyz / clip.w;
    let uv = coords.xy * vec2<f32>(0.5, -0.5) + 0.5;

    // Outside the cascade: treat as lit
    if any(uv < vec2<f32>(0.0)) || any(uv > vec2<f32>(1.0)) || coords.z > 1.0 {
        return 1.0;
    }

    let texel = frame.shadow_params.y;
    let reference = coords.z - frame.shadow_params.z;
    var lit = 0.0;
    for (var y = -1; y <= 1; y++) {
        for (var x = -1; x <= 1; x++) {
            let offset = vec2<f32>(f32(x), f32(y)) * texel;
            lit += textureSampleCompareLevel(shadow_map, shadow_sampler, uv + offset, cascade, reference);
        }
    }
    return lit / 9.0;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let pixel_coord = vec2<i32>(input.position.xy);
    let depth = textureLoad(gbuffer_depth, pixel_coord, 0);

    // Background is left for the skybox
    if depth >= 1.0 {
        return vec4<f32>(0.0, 0.0, 0.0, 1.0);
    }

    let albedo = textureLoad(gbuffer_albedo, pixel_coord, 0).rgb;
    let normal = normalize(textureLoad(gbuffer_normal, pixel_coord, 0).xyz * 2.0 - 1.0);
    let material = textureLoad(gbuffer_material, pixel_coord, 0);
    let metallic = material.r;
    let roughness = material.g;

    let world_pos = reconstruct_world_position(input.uv, depth);
    let view_dir = normalize(frame.camera.position.xyz - world_pos);
    let view_depth = -(frame.camera.view * vec4<f32>(world_pos, 1.0)).z;
    let shadow = sample_shadow(world_pos, select_cascade(view_depth));

    let light_dir = normalize(frame.sun.direction_intensity.xyz);
    let light_color = frame.sun.color.rgb * frame.sun.direction_intensity.w;

    // Blinn-Phong
    let ndotl = max(dot(normal, light_dir), 0.0);
    let diffuse = albedo * (1.0 - metallic);
    let half_vec = normalize(light_dir + view_dir);
    let ndoth = max(dot(normal, half_vec), 0.0);
    let shininess = mix(16.0, 128.0, 1.0 - roughness);
    let spec_strength = pow(ndoth, shininess) * (1.0 - roughness);
    let specular = mix(vec3<f32>(0.04), albedo, metallic) * spec_strength;

    let ambient = albedo * frame.shadow_params.w;
    let color = ambient + (diffuse * ndotl + specular) * light_color * shadow;
    return vec4<f32>(color, 1.0);
}
"#;

/// Deferred lighting shader
pub fn lighting_shader() -> String {
    format!(
        "{}{}{}",
        FRAME_UNIFORMS_WGSL, FULLSCREEN_VERTEX_WGSL, LIGHTING_SHADER_BODY
    )
}

/// Frame slot plus the four G-buffer views
type LightingKey = (u32, [ImageViewHandle; 4]);

/// Deferred lighting pass
pub struct LightingPass {
    pipeline: RenderPipelineHandle,
    layout: BindGroupLayoutHandle,
    /// Uniform region of each frame in flight
    uniform_regions: Vec<BindGroupEntry>,
    shadow_view: ImageViewHandle,
    shadow_sampler: SamplerHandle,
    bind_groups: BindGroupCache<LightingKey>,
}

impl LightingPass {
    pub fn new(
        device: &mut dyn Device,
        uniforms: &RingBuffer,
        shadow: &ShadowPass,
    ) -> BackendResult<Self> {
        let gbuffer_texture = |binding| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStageFlags::FRAGMENT,
            ty: BindingType::Texture {
                sample_type: TextureSampleType::Float { filterable: false },
                dimension: TextureViewDimension::D2,
            },
        };
        let layout = device.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::UniformBuffer,
            },
            gbuffer_texture(1),
            gbuffer_texture(2),
            gbuffer_texture(3),
            BindGroupLayoutEntry {
                binding: 4,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Depth,
                    dimension: TextureViewDimension::D2,
                },
            },
            BindGroupLayoutEntry {
                binding: 5,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Depth,
                    dimension: TextureViewDimension::D2Array,
                },
            },
            BindGroupLayoutEntry {
                binding: 6,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Sampler { comparison: true },
            },
        ])?;

        let pipeline = device
            .create_render_pipeline(&RenderPipelineDescriptor {
                label: Some("deferred_lighting".into()),
                shader: lighting_shader(),
                has_fragment: true,
                vertex_layouts: Vec::new(),
                bind_group_layouts: vec![layout],
                push_constant_ranges: Vec::new(),
                primitive_topology: PrimitiveTopology::TriangleList,
                front_face: FrontFace::Ccw,
                cull_mode: CullMode::None,
                depth_stencil: None,
                color_targets: vec![ColorTargetState {
                    format: HDR_FORMAT,
                    write_mask: ColorWrites::ALL,
                }],
            })
            .map_err(|err| {
                log::error!("Failed to create lighting pipeline: {}", err);
                err
            })?;

        let frames = uniforms.frames_in_flight();
        Ok(Self {
            pipeline,
            layout,
            uniform_regions: (0..frames).map(|f| region_binding(uniforms, f)).collect(),
            shadow_view: shadow.array_view(),
            shadow_sampler: shadow.sampler(),
            bind_groups: BindGroupCache::new(frames as usize * 2),
        })
    }

    /// Add the lighting node. Returns the HDR target, or an invalid handle when the
    /// G-buffer is unavailable this frame.
    pub fn add_to_graph(
        &mut self,
        graph: &mut RenderGraph,
        device: &mut dyn Device,
        gbuffer: &GBufferOutputs,
        shadow_map: TextureHandle,
    ) -> BackendResult<TextureHandle> {
        let pool = graph.pool();
        let views = [gbuffer.albedo, gbuffer.normal, gbuffer.material, gbuffer.depth]
            .map(|handle| pool.view(handle));
        let (Some(desc), [Some(albedo), Some(normal), Some(material), Some(depth)]) =
            (pool.desc(gbuffer.albedo).copied(), views)
        else {
            log::warn!("G-buffer unavailable, skipping lighting");
            return Ok(TextureHandle::INVALID);
        };

        let slot = graph.frame_index() % self.uniform_regions.len() as u32;
        let key = (slot, [albedo, normal, material, depth]);
        let layout = self.layout;
        let entries = [
            (0, self.uniform_regions[slot as usize].clone()),
            (1, BindGroupEntry::Texture(albedo)),
            (2, BindGroupEntry::Texture(normal)),
            (3, BindGroupEntry::Texture(material)),
            (4, BindGroupEntry::Texture(depth)),
            (5, BindGroupEntry::Texture(self.shadow_view)),
            (6, BindGroupEntry::Sampler(self.shadow_sampler)),
        ];
        let bind_group = self
            .bind_groups
            .get_or_create(device, key, |device| device.create_bind_group(layout, &entries))?;

        let mut hdr = TextureHandle::INVALID;
        let pipeline = self.pipeline;
        graph.add_node(
            device,
            "Lighting",
            |builder| {
                builder.read(gbuffer.albedo);
                builder.read(gbuffer.normal);
                builder.read(gbuffer.material);
                builder.read(gbuffer.depth);
                builder.read(shadow_map);
                hdr = builder.create_color(
                    "hdr",
                    TextureDesc::render_target(HDR_FORMAT, desc.width, desc.height),
                );
            },
            move |ctx| {
                ctx.set_full_viewport();
                let cmd = ctx.cmd();
                cmd.bind_graphics_pipeline(pipeline);
                cmd.bind_descriptor_set(0, bind_group);
                cmd.draw(0..3, 0..1);
            },
        );

        Ok(hdr)
    }

    /// Drop bind groups that reference transient views, e.g. after a resize
    pub fn invalidate(&mut self, device: &mut dyn Device) {
        self.bind_groups.clear(device);
    }

    pub fn cached_bind_groups(&self) -> usize {
        self.bind_groups.len()
    }

    pub fn destroy(&mut self, device: &mut dyn Device) {
        self.bind_groups.clear(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::culling::{frame_ring, CullingPass};
    use crate::pipeline::gbuffer_pass::GBufferPass;
    use crate::pipeline::FrameUniforms;
    use crate::resources::MaterialTextureArray;
    use crate::RendererConfig;

    struct Fixture {
        device: HeadlessBackend,
        culling: CullingPass,
        gbuffer: GBufferPass,
        shadow: ShadowPass,
        lighting: LightingPass,
    }

    fn fixture() -> Fixture {
        let mut device = HeadlessBackend::new();
        let config = RendererConfig {
            shadow_map_size: 64,
            ..Default::default()
        };
        let culling = CullingPass::new(&mut device, &config).unwrap();
        let uniforms = frame_ring(
            &mut device,
            "frame_uniforms",
            FrameUniforms::SIZE,
            256,
            config.frames_in_flight,
            BufferUsage::UNIFORM,
        )
        .unwrap();
        let materials = MaterialTextureArray::new(&mut device, 4, 4).unwrap();
        let gbuffer = GBufferPass::new(&mut device, &culling, &uniforms, &materials).unwrap();
        let shadow = ShadowPass::new(&mut device, &culling, &config).unwrap();
        let lighting = LightingPass::new(&mut device, &uniforms, &shadow).unwrap();
        Fixture {
            device,
            culling,
            gbuffer,
            shadow,
            lighting,
        }
    }

    fn build_frame(f: &mut Fixture, frame_index: u32, graph: &mut RenderGraph) -> TextureHandle {
        graph.reset(frame_index);
        let shadow_map = graph.import_texture(
            f.shadow.texture(),
            f.shadow.array_view(),
            f.shadow.texture_desc(),
        );
        let outputs = f.gbuffer.add_to_graph(
            graph,
            &mut f.device,
            320,
            240,
            f.culling.targets(frame_index),
            &[],
        );
        f.lighting
            .add_to_graph(graph, &mut f.device, &outputs, shadow_map)
            .unwrap()
    }

    #[test]
    fn test_lighting_reads_gbuffer_and_shadow() {
        let mut f = fixture();
        let mut graph = RenderGraph::new();
        let hdr = build_frame(&mut f, 0, &mut graph);

        assert!(hdr.is_valid());
        let node = &graph.nodes()[1];
        assert_eq!(node.name(), "Lighting");
        assert_eq!(node.reads().len(), 5);
        assert_eq!(node.dimensions(), (320, 240));
        assert_eq!(graph.pool().desc(hdr).unwrap().format, HDR_FORMAT);

        graph.compile(&mut f.device).unwrap();
        graph.execute(&mut f.device);
        assert!(f
            .device
            .commands()
            .iter()
            .any(|c| matches!(c, RecordedCommand::Draw { vertices, .. } if *vertices == (0..3))));
    }

    #[test]
    fn test_bind_groups_cached_per_frame_slot() {
        let mut f = fixture();
        let mut graph = RenderGraph::new();

        for frame in 0..6 {
            build_frame(&mut f, frame % 3, &mut graph);
            graph.compile(&mut f.device).unwrap();
            graph.execute(&mut f.device);
        }
        // Pooled views are stable, so one bind group per slot
        assert_eq!(f.lighting.cached_bind_groups(), 3);

        f.lighting.invalidate(&mut f.device);
        assert_eq!(f.lighting.cached_bind_groups(), 0);
    }

    #[test]
    fn test_missing_gbuffer_skips_lighting() {
        let mut f = fixture();
        let mut graph = RenderGraph::new();
        graph.reset(0);
        let hdr = f
            .lighting
            .add_to_graph(&mut graph, &mut f.device, &GBufferOutputs::default(), TextureHandle::INVALID)
            .unwrap();
        assert!(!hdr.is_valid());
        assert!(graph.nodes().is_empty());
    }
}
