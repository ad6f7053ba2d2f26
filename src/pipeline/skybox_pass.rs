//! Skybox pass
//!
//! Fills the pixels the geometry never touched (depth still at the far plane) by sampling
//! an environment cubemap along the view ray. Without an environment the node declares
//! no outputs and the graph skips it.

use crate::backend::*;
use crate::pipeline::lighting_pass::HDR_FORMAT;
use crate::pipeline::{region_binding, BindGroupCache, FRAME_UNIFORMS_WGSL, FULLSCREEN_VERTEX_WGSL};
use crate::render_graph::{RenderGraph, TextureHandle};
use crate::resources::{RingBuffer, TextureData};

const SKYBOX_SHADER_BODY: &str = r#"
@group(0) @binding(0) var<uniform> frame: FrameUniforms;
@group(0) @binding(1) var environment: texture_cube<f32>;
@group(0) @binding(2) var environment_sampler: sampler;
@group(0) @binding(3) var scene_depth: texture_depth_2d;

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let depth = textureLoad(scene_depth, vec2<i32>(input.position.xy), 0);

    // View ray through the far plane
    let ndc = vec4<f32>(input.uv.x * 2.0 - 1.0, 1.0 - input.uv.y * 2.0, 1.0, 1.0);
    let far_point = frame.camera.inv_view_proj * ndc;
    let direction = normalize(far_point.xyz / far_point.w - frame.camera.position.xyz);
    let color = textureSampleLevel(environment, environment_sampler, direction, 0.0);

    if depth < 1.0 {
        discard;
    }
    return vec4<f32>(color.rgb, 1.0);
}
"#;

/// Environment cubemap shader
pub fn skybox_shader() -> String {
    format!(
        "{}{}{}",
        FRAME_UNIFORMS_WGSL, FULLSCREEN_VERTEX_WGSL, SKYBOX_SHADER_BODY
    )
}

/// Six-face cubemap uploaded from decoded images
pub struct EnvironmentMap {
    texture: ImageHandle,
    view: ImageViewHandle,
    size: u32,
}

impl EnvironmentMap {
    /// Faces in +X, -X, +Y, -Y, +Z, -Z order; all must be the same square size
    pub fn new(device: &mut dyn Device, faces: &[TextureData; 6]) -> BackendResult<Self> {
        let size = faces[0].width;
        if let Some(face) = faces.iter().find(|f| f.width != size || f.height != size) {
            return Err(BackendError::InvalidParameter(format!(
                "cubemap face '{}' is {}x{}, expected {}x{}",
                face.name, face.width, face.height, size, size
            )));
        }

        let texture = device.create_texture(&TextureDescriptor {
            label: Some("environment".into()),
            width: size,
            height: size,
            array_layers: 6,
            mip_levels: 1,
            format: TextureFormat::Rgba8UnormSrgb,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        })?;
        for (layer, face) in faces.iter().enumerate() {
            device.write_texture(texture, layer as u32, &face.data, size, size);
        }
        let view = device.create_texture_view(texture, &TextureViewDescriptor::cube())?;

        Ok(Self { texture, view, size })
    }

    pub fn view(&self) -> ImageViewHandle {
        self.view
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn destroy(&mut self, device: &mut dyn Device) {
        device.destroy_texture_view(self.view);
        device.destroy_texture(self.texture);
    }
}

type SkyboxKey = (u32, ImageViewHandle, ImageViewHandle);

/// Skybox pass
pub struct SkyboxPass {
    pipeline: RenderPipelineHandle,
    layout: BindGroupLayoutHandle,
    uniform_regions: Vec<BindGroupEntry>,
    sampler: SamplerHandle,
    environment: Option<ImageViewHandle>,
    bind_groups: BindGroupCache<SkyboxKey>,
}

impl SkyboxPass {
    pub fn new(device: &mut dyn Device, uniforms: &RingBuffer) -> BackendResult<Self> {
        let layout = device.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::UniformBuffer,
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Float { filterable: true },
                    dimension: TextureViewDimension::Cube,
                },
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Sampler { comparison: false },
            },
            BindGroupLayoutEntry {
                binding: 3,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Depth,
                    dimension: TextureViewDimension::D2,
                },
            },
        ])?;

        let sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("environment_sampler".into()),
            ..Default::default()
        })?;

        let pipeline = device
            .create_render_pipeline(&RenderPipelineDescriptor {
                label: Some("skybox".into()),
                shader: skybox_shader(),
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
                log::error!("Failed to create skybox pipeline: {}", err);
                err
            })?;

        let frames = uniforms.frames_in_flight();
        Ok(Self {
            pipeline,
            layout,
            uniform_regions: (0..frames).map(|f| region_binding(uniforms, f)).collect(),
            sampler,
            environment: None,
            bind_groups: BindGroupCache::new(frames as usize * 2),
        })
    }

    /// Set or clear the environment cubemap view
    pub fn set_environment(&mut self, view: Option<ImageViewHandle>) {
        self.environment = view;
    }

    pub fn environment(&self) -> Option<ImageViewHandle> {
        self.environment
    }

    /// Add the skybox node, drawing into `hdr` where `depth` is at the far plane
    pub fn add_to_graph(
        &mut self,
        graph: &mut RenderGraph,
        device: &mut dyn Device,
        hdr: TextureHandle,
        depth: TextureHandle,
    ) -> BackendResult<()> {
        let bind_group = match (self.environment, graph.pool().view(depth)) {
            (Some(environment), Some(depth_view)) if hdr.is_valid() => {
                let slot = graph.frame_index() % self.uniform_regions.len() as u32;
                let layout = self.layout;
                let entries = [
                    (0, self.uniform_regions[slot as usize].clone()),
                    (1, BindGroupEntry::Texture(environment)),
                    (2, BindGroupEntry::Sampler(self.sampler)),
                    (3, BindGroupEntry::Texture(depth_view)),
                ];
                Some(self.bind_groups.get_or_create(
                    device,
                    (slot, environment, depth_view),
                    |device| device.create_bind_group(layout, &entries),
                )?)
            }
            _ => None,
        };

        let pipeline = self.pipeline;
        graph.add_node(
            device,
            "Skybox",
            |builder| {
                if bind_group.is_some() {
                    builder.write_color(hdr, LoadOp::Load);
                    builder.read(depth);
                }
            },
            move |ctx| {
                let Some(bind_group) = bind_group else {
                    return;
                };
                ctx.set_full_viewport();
                let cmd = ctx.cmd();
                cmd.bind_graphics_pipeline(pipeline);
                cmd.bind_descriptor_set(0, bind_group);
                cmd.draw(0..3, 0..1);
            },
        );
        Ok(())
    }

    pub fn invalidate(&mut self, device: &mut dyn Device) {
        self.bind_groups.clear(device);
    }

    pub fn destroy(&mut self, device: &mut dyn Device) {
        self.bind_groups.clear(device);
    }
}
