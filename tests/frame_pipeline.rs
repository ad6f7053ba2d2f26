//! Whole-frame tests against the headless backend

use deferred_renderer::backend::*;
use deferred_renderer::scene::{
    Camera, CollectedDrawData, DirectionalLight, MaterialLayers, MegaBufferBlock, MegaBufferBuilder,
    MegaBuffers, MeshData, MeshRange,
};
use deferred_renderer::{DeferredRenderer, EngineContext, FrameInput, RendererConfig, SwapchainTarget};
use glam::{Mat4, Vec3};
use rstest::rstest;
use std::io::Cursor;

const SWAPCHAIN_FORMAT: TextureFormat = TextureFormat::Bgra8UnormSrgb;

fn test_config() -> RendererConfig {
    RendererConfig {
        max_instances: 64,
        max_batches: 64,
        max_batches_per_block: 32,
        max_mega_buffer_blocks: 2,
        max_vertices_per_block: 4096,
        shadow_map_size: 128,
        material_layer_size: 16,
        max_material_layers: 8,
        max_concurrent_uploads: 2,
        ..Default::default()
    }
}

struct Fixture {
    device: HeadlessBackend,
    ctx: EngineContext,
    renderer: DeferredRenderer,
    geometry: MegaBuffers,
    cube: MeshRange,
    camera: Camera,
    sun: DirectionalLight,
}

impl Fixture {
    fn new(device: HeadlessBackend) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut device = device;
        let config = test_config();
        let ctx = EngineContext::init(config.clone()).unwrap();
        let renderer = DeferredRenderer::new(&mut device, &ctx, SWAPCHAIN_FORMAT, 320, 240).unwrap();

        let mut builder =
            MegaBufferBuilder::new(config.max_vertices_per_block, config.max_mega_buffer_blocks);
        let cube = builder.add_mesh(&MeshData::cube()).unwrap();
        let geometry = builder.build(&mut device).unwrap();

        Self {
            device,
            ctx,
            renderer,
            geometry,
            cube,
            camera: Camera::new(Vec3::new(0.0, 4.0, 10.0), Vec3::ZERO),
            sun: DirectionalLight::default(),
        }
    }

    fn swapchain(&mut self, width: u32, height: u32) -> SwapchainTarget {
        let texture = self
            .device
            .create_texture(&TextureDescriptor {
                label: Some("swapchain".into()),
                width,
                height,
                array_layers: 1,
                mip_levels: 1,
                format: SWAPCHAIN_FORMAT,
                usage: TextureUsage::RENDER_ATTACHMENT,
            })
            .unwrap();
        let view = self
            .device
            .create_texture_view(texture, &TextureViewDescriptor::default())
            .unwrap();
        SwapchainTarget {
            texture,
            view,
            format: SWAPCHAIN_FORMAT,
            width,
            height,
        }
    }

    fn scene(&self, cubes: u32) -> (CollectedDrawData, Vec<MegaBufferBlock>) {
        let mut draw_data = CollectedDrawData::new(&self.camera);
        for i in 0..cubes {
            let world = Mat4::from_translation(Vec3::new(i as f32 * 2.0, 0.0, 0.0));
            draw_data.push(&self.cube, world, MaterialLayers::default());
        }
        let blocks = draw_data.finalize(&self.geometry);
        (draw_data, blocks)
    }

    fn render(&mut self, cubes: u32, target: &SwapchainTarget) -> Vec<RecordedCommand> {
        let (draw_data, blocks) = self.scene(cubes);
        let input = FrameInput {
            draw_data: &draw_data,
            blocks: &blocks,
            camera: &self.camera,
            sun: &self.sun,
        };
        self.device.take_commands();
        self.renderer
            .render_frame(&mut self.device, &self.ctx, &input, target)
            .unwrap();
        self.device.take_commands()
    }
}

fn count(commands: &[RecordedCommand], pred: impl Fn(&RecordedCommand) -> bool) -> usize {
    commands.iter().filter(|c| pred(c)).count()
}

#[test]
fn test_frame_builds_passes_in_order() {
    let mut fixture = Fixture::new(HeadlessBackend::new());
    let target = fixture.swapchain(320, 240);
    fixture.render(4, &target);

    let names: Vec<&str> = fixture
        .renderer
        .graph()
        .nodes()
        .iter()
        .map(|n| n.name())
        .collect();
    assert_eq!(
        names,
        ["Culling", "Shadow", "GBuffer", "Lighting", "Skybox", "Tonemap"]
    );

    let shadow = &fixture.renderer.graph().nodes()[1];
    assert_eq!(shadow.dimensions(), (128, 128));
}

#[rstest]
#[case::hardware_count(HeadlessBackend::new(), true)]
#[case::cpu_readback(HeadlessBackend::without_draw_indirect_count(), false)]
fn test_indirect_draw_path(#[case] device: HeadlessBackend, #[case] hardware_count: bool) {
    let mut fixture = Fixture::new(device);
    let target = fixture.swapchain(320, 240);
    let commands = fixture.render(4, &target);

    let count_draws = count(&commands, |c| {
        matches!(c, RecordedCommand::DrawIndexedIndirectCount(_))
    });
    let waits = count(&commands, |c| matches!(c, RecordedCommand::WaitIdle));

    if hardware_count {
        assert!(count_draws > 0);
        assert_eq!(waits, 0);
    } else {
        assert_eq!(count_draws, 0);
        assert!(waits > 0);
    }
}

#[test]
fn test_culling_dispatch_precedes_geometry() {
    let mut fixture = Fixture::new(HeadlessBackend::new());
    let target = fixture.swapchain(320, 240);
    let commands = fixture.render(4, &target);

    let first_dispatch = commands
        .iter()
        .position(|c| matches!(c, RecordedCommand::Dispatch { .. }))
        .unwrap();
    let first_draw = commands
        .iter()
        .position(|c| matches!(c, RecordedCommand::DrawIndexedIndirectCount(_)))
        .unwrap();
    assert!(first_dispatch < first_draw);
    assert!(matches!(commands.last(), Some(RecordedCommand::EndRenderPass)));
}

#[test]
fn test_empty_scene_still_presents() {
    let mut fixture = Fixture::new(HeadlessBackend::new());
    let target = fixture.swapchain(320, 240);
    let commands = fixture.render(0, &target);

    // Tonemap still clears and draws the fullscreen triangle
    assert!(commands
        .iter()
        .any(|c| matches!(c, RecordedCommand::Draw { vertices, .. } if *vertices == (0..3))));
    assert!(matches!(commands.last(), Some(RecordedCommand::EndRenderPass)));
}

#[test]
fn test_transient_targets_reused_across_frames() {
    let mut fixture = Fixture::new(HeadlessBackend::new());
    let target = fixture.swapchain(320, 240);

    fixture.render(2, &target);
    let pooled = fixture.renderer.graph().pool().len();
    for _ in 0..5 {
        fixture.render(2, &target);
    }
    assert_eq!(fixture.renderer.graph().pool().len(), pooled);
}

#[test]
fn test_swapchain_resize_follows_target() {
    let mut fixture = Fixture::new(HeadlessBackend::new());
    let small = fixture.swapchain(320, 240);
    fixture.render(1, &small);

    let large = fixture.swapchain(640, 480);
    fixture.render(1, &large);
    assert_eq!(fixture.renderer.dimensions(), (640, 480));

    let gbuffer = fixture
        .renderer
        .graph()
        .nodes()
        .iter()
        .find(|n| n.name() == "GBuffer")
        .unwrap();
    assert_eq!(gbuffer.dimensions(), (640, 480));
}

#[test]
fn test_zero_extent_target_skips_frame() {
    let mut fixture = Fixture::new(HeadlessBackend::new());
    let target = fixture.swapchain(320, 240);
    let minimized = SwapchainTarget {
        width: 0,
        height: 0,
        ..target
    };
    let commands = fixture.render(3, &minimized);
    assert!(commands.is_empty());
    assert_eq!(fixture.renderer.dimensions(), (320, 240));
}

#[test]
fn test_material_uploads_complete() {
    let mut fixture = Fixture::new(HeadlessBackend::new());

    // Already layer-sized, so the decoded pixels are written unchanged
    let image = image::RgbaImage::from_pixel(16, 16, image::Rgba([10, 200, 30, 255]));
    let mut png = Cursor::new(Vec::new());
    image
        .write_to(&mut png, image::ImageOutputFormat::Png)
        .unwrap();

    fixture
        .renderer
        .request_material_texture(&fixture.ctx, 3, png.into_inner())
        .unwrap();
    fixture
        .renderer
        .request_material_texture(&fixture.ctx, 4, b"not an image".to_vec())
        .unwrap();
    assert_eq!(fixture.renderer.pending_uploads(), 2);

    fixture.renderer.finish_uploads(&mut fixture.device);
    assert_eq!(fixture.renderer.pending_uploads(), 0);

    let texture = fixture.renderer.materials().texture();
    let layer = fixture.device.texture_layer(texture, 3).unwrap();
    assert_eq!(layer.len(), 16 * 16 * 4);
    assert!(layer.chunks_exact(4).all(|px| *px == [10u8, 200, 30, 255]));

    // The undecodable upload never reaches its layer
    assert!(fixture.device.texture_layer(texture, 4).is_none());
    // Default layers were written at creation
    assert!(fixture.device.texture_layer(texture, 0).is_some());
}

#[test]
fn test_shutdown_after_frames() {
    let mut fixture = Fixture::new(HeadlessBackend::new());
    let target = fixture.swapchain(320, 240);
    fixture.render(2, &target);

    let Fixture {
        mut device,
        mut ctx,
        mut renderer,
        mut geometry,
        ..
    } = fixture;
    renderer.destroy(&mut device);
    geometry.destroy(&mut device);
    ctx.shutdown();
    assert_eq!(ctx.uploads.worker_count(), 0);
}
