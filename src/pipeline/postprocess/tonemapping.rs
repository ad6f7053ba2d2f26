//! Tonemapping post-processing

use crate::backend::*;
use crate::pipeline::{BindGroupCache, FULLSCREEN_VERTEX_WGSL};
use crate::render_graph::{RenderGraph, TextureHandle};
use bytemuck::{Pod, Zeroable};

/// Tonemapping operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TonemapOperator {
    Reinhard,
    #[default]
    Aces,
    /// Clamp only
    None,
}

impl TonemapOperator {
    fn shader_index(self) -> u32 {
        match self {
            TonemapOperator::Reinhard => 0,
            TonemapOperator::Aces => 1,
            TonemapOperator::None => 2,
        }
    }
}

/// Fragment push constants, 16 bytes
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TonemapPushConstants {
    pub exposure: f32,
    pub operator: u32,
    /// Non-zero when the target is not sRGB and the shader must encode gamma itself
    pub apply_gamma: u32,
    pub _padding: u32,
}

impl TonemapPushConstants {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

const TONEMAP_SHADER_BODY: &str = r#"
struct TonemapParams {
    exposure: f32,
    tonemap_operator: u32,
    apply_gamma: u32,
    _padding: u32,
}

var<push_constant> params: TonemapParams;

@group(0) @binding(0) var hdr_texture: texture_2d<f32>;

fn aces_tonemap(color: vec3<f32>) -> vec3<f32> {
    let a = 2.51;
    let b = 0.03;
    let c = 2.43;
    let d = 0.59;
    let e = 0.14;
    return saturate((color * (a * color + b)) / (color * (c * color + d) + e));
}

fn reinhard_tonemap(color: vec3<f32>) -> vec3<f32> {
    return color / (color + vec3<f32>(1.0));
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let color = textureLoad(hdr_texture, vec2<i32>(input.position.xy), 0).rgb * params.exposure;

    var mapped: vec3<f32>;
    switch params.tonemap_operator {
        case 0u: { mapped = reinhard_tonemap(color); }
        case 1u: { mapped = aces_tonemap(color); }
        default: { mapped = saturate(color); }
    }

    if params.apply_gamma != 0u {
        mapped = pow(mapped, vec3<f32>(1.0 / 2.2));
    }
    return vec4<f32>(mapped, 1.0);
}
"#;

/// HDR to display shader
pub fn tonemap_shader() -> String {
    format!("{}{}", FULLSCREEN_VERTEX_WGSL, TONEMAP_SHADER_BODY)
}

/// Tonemapping post-processing pass, writes straight into the swapchain image
pub struct TonemappingPass {
    pub operator: TonemapOperator,
    pub exposure: f32,
    pipeline: RenderPipelineHandle,
    layout: BindGroupLayoutHandle,
    output_format: TextureFormat,
    bind_groups: BindGroupCache<ImageViewHandle>,
}

impl TonemappingPass {
    pub fn new(
        device: &mut dyn Device,
        output_format: TextureFormat,
        operator: TonemapOperator,
        exposure: f32,
        frames_in_flight: u32,
    ) -> BackendResult<Self> {
        let layout = device.create_bind_group_layout(&[BindGroupLayoutEntry {
            binding: 0,
            visibility: ShaderStageFlags::FRAGMENT,
            ty: BindingType::Texture {
                sample_type: TextureSampleType::Float { filterable: false },
                dimension: TextureViewDimension::D2,
            },
        }])?;

        let pipeline = device
            .create_render_pipeline(&RenderPipelineDescriptor {
                label: Some("tonemapping".into()),
                shader: tonemap_shader(),
                has_fragment: true,
                vertex_layouts: Vec::new(),
                bind_group_layouts: vec![layout],
                push_constant_ranges: vec![PushConstantRange {
                    stages: ShaderStageFlags::FRAGMENT,
                    range: 0..TonemapPushConstants::SIZE,
                }],
                primitive_topology: PrimitiveTopology::TriangleList,
                front_face: FrontFace::Ccw,
                cull_mode: CullMode::None,
                depth_stencil: None,
                color_targets: vec![ColorTargetState {
                    format: output_format,
                    write_mask: ColorWrites::ALL,
                }],
            })
            .map_err(|err| {
                log::error!("Failed to create tonemapping pipeline: {}", err);
                err
            })?;

        Ok(Self {
            operator,
            exposure,
            pipeline,
            layout,
            output_format,
            bind_groups: BindGroupCache::new(frames_in_flight.max(1) as usize * 2),
        })
    }

    pub fn push_constants(&self) -> TonemapPushConstants {
        TonemapPushConstants {
            exposure: self.exposure,
            operator: self.operator.shader_index(),
            apply_gamma: u32::from(!self.output_format.is_srgb()),
            _padding: 0,
        }
    }

    pub fn output_format(&self) -> TextureFormat {
        self.output_format
    }

    /// Add the tonemap node. The swapchain is always cleared; nothing is drawn when the
    /// HDR input is missing.
    pub fn add_to_graph(
        &mut self,
        graph: &mut RenderGraph,
        device: &mut dyn Device,
        hdr: TextureHandle,
        swapchain: TextureHandle,
    ) -> BackendResult<()> {
        let bind_group = match graph.pool().view(hdr) {
            Some(hdr_view) => {
                let layout = self.layout;
                Some(self.bind_groups.get_or_create(device, hdr_view, |device| {
                    device.create_bind_group(layout, &[(0, BindGroupEntry::Texture(hdr_view))])
                })?)
            }
            None => {
                log::warn!("HDR target unavailable, tonemapping clears the swapchain only");
                None
            }
        };

        let pipeline = self.pipeline;
        let push_constants = self.push_constants();
        graph.add_node(
            device,
            "Tonemap",
            |builder| {
                builder.read(hdr);
                builder.write_color(swapchain, LoadOp::Clear([0.0, 0.0, 0.0, 1.0]));
            },
            move |ctx| {
                let Some(bind_group) = bind_group else {
                    return;
                };
                ctx.set_full_viewport();
                let cmd = ctx.cmd();
                cmd.bind_graphics_pipeline(pipeline);
                cmd.bind_descriptor_set(0, bind_group);
                cmd.push_constants(
                    ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::bytes_of(&push_constants),
                );
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_graph::TextureDesc;
    use rstest::rstest;

    #[rstest]
    #[case::srgb_swapchain(TextureFormat::Bgra8UnormSrgb, 0)]
    #[case::linear_swapchain(TextureFormat::Bgra8Unorm, 1)]
    fn test_gamma_follows_output_format(#[case] format: TextureFormat, #[case] apply_gamma: u32) {
        let mut device = HeadlessBackend::new();
        let pass = TonemappingPass::new(&mut device, format, TonemapOperator::Reinhard, 1.5, 3).unwrap();
        let pc = pass.push_constants();
        assert_eq!(pc.apply_gamma, apply_gamma);
        assert_eq!(pc.operator, 0);
        assert_eq!(pc.exposure, 1.5);
        assert_eq!(TonemapPushConstants::SIZE, 16);
    }

    #[test]
    fn test_tonemap_writes_swapchain() {
        let mut device = HeadlessBackend::new();
        let mut pass =
            TonemappingPass::new(&mut device, TextureFormat::Bgra8UnormSrgb, TonemapOperator::Aces, 1.0, 3)
                .unwrap();

        let swapchain_texture = device
            .create_texture(&TextureDescriptor {
                label: Some("swapchain".into()),
                width: 128,
                height: 72,
                array_layers: 1,
                mip_levels: 1,
                format: TextureFormat::Bgra8UnormSrgb,
                usage: TextureUsage::RENDER_ATTACHMENT,
            })
            .unwrap();
        let swapchain_view = device
            .create_texture_view(swapchain_texture, &TextureViewDescriptor::default())
            .unwrap();

        let mut graph = RenderGraph::new();
        graph.reset(0);
        let swapchain = graph.import_texture(
            swapchain_texture,
            swapchain_view,
            TextureDesc::new(TextureFormat::Bgra8UnormSrgb, 128, 72, TextureUsage::RENDER_ATTACHMENT),
        );
        let mut hdr = TextureHandle::INVALID;
        graph.add_node(
            &mut device,
            "Lighting",
            |builder| {
                hdr = builder.create_color(
                    "hdr",
                    TextureDesc::render_target(TextureFormat::Rgba16Float, 128, 72),
                );
            },
            |_| {},
        );
        pass.add_to_graph(&mut graph, &mut device, hdr, swapchain).unwrap();

        graph.compile(&mut device).unwrap();
        graph.execute(&mut device);

        let commands = device.commands();
        let push = commands
            .iter()
            .find_map(|c| match c {
                RecordedCommand::PushConstants { stages, data, .. } => Some((*stages, data.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(push.0, ShaderStageFlags::FRAGMENT);
        let pc: TonemapPushConstants = bytemuck::pod_read_unaligned(&push.1);
        assert_eq!(pc.operator, 1);
        assert!(matches!(commands.last(), Some(RecordedCommand::EndRenderPass)));
    }
}
