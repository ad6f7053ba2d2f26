//! Deferred renderer demo: a grid of cubes on a ground plane under a rotating sun.
//!
//! ```bash
//! cargo run --example deferred_demo -- --grid 24 --no-vsync
//! ```

use clap::Parser;
use deferred_renderer::backend::{BackendError, Device};
use deferred_renderer::scene::{
    Camera, CollectedDrawData, DirectionalLight, MaterialLayers, MegaBufferBuilder, MegaBuffers,
    MeshData, MeshRange,
};
use deferred_renderer::{DeferredRenderer, EngineContext, FrameInput, RendererConfig, WgpuBackend};
use glam::{Mat4, Vec3};
use std::io::Cursor;
use std::sync::Arc;
use winit::dpi::PhysicalSize;
use winit::event::{Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::window::WindowBuilder;

/// First material layer available to the application
const CHECKER_LAYER: u32 = 3;

#[derive(Parser, Debug)]
#[command(about = "Render a grid of cubes with the deferred renderer")]
struct Args {
    #[arg(long, default_value_t = 1280)]
    width: u32,
    #[arg(long, default_value_t = 720)]
    height: u32,
    /// Cubes per side of the grid
    #[arg(long, default_value_t = 16)]
    grid: u32,
    #[arg(long)]
    no_vsync: bool,
    #[arg(long, default_value_t = 3)]
    frames_in_flight: u32,
}

struct Scene {
    geometry: MegaBuffers,
    cube: MeshRange,
    plane: MeshRange,
    grid: u32,
    camera: Camera,
    sun: DirectionalLight,
}

impl Scene {
    fn new(device: &mut dyn Device, config: &RendererConfig, grid: u32) -> Result<Self, BackendError> {
        let mut builder =
            MegaBufferBuilder::new(config.max_vertices_per_block, config.max_mega_buffer_blocks);
        let cube = builder.add_mesh(&MeshData::cube())?;
        let plane = builder.add_mesh(&MeshData::plane(grid as f32 * 3.0 + 10.0, 1))?;
        let geometry = builder.build(device)?;

        let extent = grid as f32 * 1.5;
        let camera = Camera::new(Vec3::new(extent, extent * 0.8, extent), Vec3::ZERO)
            .with_clip(0.1, extent * 6.0);

        Ok(Self {
            geometry,
            cube,
            plane,
            grid,
            camera,
            sun: DirectionalLight::default(),
        })
    }

    fn update(&mut self, time: f32, aspect: (u32, u32)) {
        let angle = time * 0.2;
        self.sun.direction = Vec3::new(angle.cos(), -1.2, angle.sin()).normalize();
        self.camera.set_aspect(aspect.0 as f32, aspect.1 as f32);
    }

    fn collect(&self) -> (CollectedDrawData, Vec<deferred_renderer::scene::MegaBufferBlock>) {
        let mut draw_data = CollectedDrawData::new(&self.camera);
        draw_data.push(&self.plane, Mat4::IDENTITY, MaterialLayers::default());

        let half = self.grid as f32 * 0.5;
        let checker = MaterialLayers {
            albedo: CHECKER_LAYER,
            ..Default::default()
        };
        for z in 0..self.grid {
            for x in 0..self.grid {
                let position = Vec3::new((x as f32 - half) * 3.0, 0.5, (z as f32 - half) * 3.0);
                let material = if (x + z) % 2 == 0 { checker } else { MaterialLayers::default() };
                draw_data.push(&self.cube, Mat4::from_translation(position), material);
            }
        }

        let blocks = draw_data.finalize(&self.geometry);
        (draw_data, blocks)
    }
}

fn checker_png(size: u32) -> Vec<u8> {
    let image = image::RgbaImage::from_fn(size, size, |x, y| {
        if ((x / 32) + (y / 32)) % 2 == 0 {
            image::Rgba([220, 80, 60, 255])
        } else {
            image::Rgba([240, 240, 240, 255])
        }
    });
    let mut bytes = Cursor::new(Vec::new());
    if let Err(e) = image.write_to(&mut bytes, image::ImageOutputFormat::Png) {
        log::warn!("Failed to encode checker texture: {}", e);
    }
    bytes.into_inner()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = RendererConfig {
        width: args.width,
        height: args.height,
        vsync: !args.no_vsync,
        frames_in_flight: args.frames_in_flight,
        ..Default::default()
    };
    let mut ctx = EngineContext::init(config.clone())?;

    let event_loop = EventLoop::new()?;
    let window = Arc::new(
        WindowBuilder::new()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .build(&event_loop)?,
    );

    let mut backend = WgpuBackend::new(window.clone(), config.vsync)?;
    let (width, height) = backend.surface_size();
    let format = backend.surface_format();
    let mut renderer = DeferredRenderer::new(&mut backend, &ctx, format, width, height)?;
    let mut scene = Scene::new(&mut backend, &config, args.grid)?;
    renderer.request_material_texture(&ctx, CHECKER_LAYER, checker_png(config.material_layer_size))?;

    event_loop.run(move |event, elwt| {
        elwt.set_control_flow(ControlFlow::Poll);

        match event {
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => elwt.exit(),
                WindowEvent::Resized(size) => backend.resize(size.width, size.height),
                WindowEvent::RedrawRequested => {
                    ctx.clock.tick();
                    scene.update(ctx.clock.elapsed_time(), backend.surface_size());
                    let (draw_data, blocks) = scene.collect();

                    let target = match backend.acquire_frame() {
                        Ok(target) => target,
                        Err(BackendError::SurfaceLost) => {
                            let (w, h) = backend.surface_size();
                            backend.resize(w, h);
                            return;
                        }
                        Err(e) => {
                            log::error!("Failed to acquire frame: {}", e);
                            elwt.exit();
                            return;
                        }
                    };

                    let input = FrameInput {
                        draw_data: &draw_data,
                        blocks: &blocks,
                        camera: &scene.camera,
                        sun: &scene.sun,
                    };
                    if let Err(e) = renderer.render_frame(&mut backend, &ctx, &input, &target) {
                        log::error!("Frame failed: {}", e);
                        elwt.exit();
                    }
                    backend.present();

                    if ctx.clock.frame_number() % 300 == 0 {
                        log::info!(
                            "Frame {} ({:.2} ms)",
                            ctx.clock.frame_number(),
                            ctx.clock.delta_time() * 1000.0
                        );
                    }
                }
                _ => {}
            },
            Event::AboutToWait => window.request_redraw(),
            Event::LoopExiting => {
                renderer.destroy(&mut backend);
                scene.geometry.destroy(&mut backend);
                ctx.shutdown();
            }
            _ => {}
        }
    })?;

    Ok(())
}
