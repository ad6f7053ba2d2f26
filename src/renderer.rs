//! Deferred renderer: owns every pass and builds the render graph each frame.
//!
//! Frame order:
//! 1. Apply finished texture uploads
//! 2. Upload scene data (skipped when there are no batches)
//! 3. Prepare culling and shadow work, write frame uniforms
//! 4. Build the graph: Culling, Shadow, GBuffer, Lighting, Skybox, Tonemap
//! 5. Compile and execute

use crate::backend::*;
use crate::context::EngineContext;
use crate::pipeline::culling::frame_ring;
use crate::pipeline::{
    CullingPass, FrameUniforms, GBufferPass, LightingPass, ShadowPass, SkyboxPass, TonemappingPass,
};
use crate::render_graph::{RenderGraph, TextureDesc};
use crate::resources::{default_layers, MaterialTextureArray, RingBuffer, UploadTicket};
use crate::scene::{Camera, CollectedDrawData, DirectionalLight, MegaBufferBlock};
use glam::Vec4;

/// Depth offset applied before the shadow comparison, in [0, 1] depth units
const SHADOW_COMPARE_BIAS: f32 = 0.0005;

const AMBIENT_INTENSITY: f32 = 0.03;

/// Uniform buffers bind at 256-byte offsets on every backend we target
const UNIFORM_ALIGNMENT: u64 = 256;

/// Pooled textures unused for this many frames are destroyed
const TRANSIENT_IDLE_FRAMES: u64 = 8;

/// Everything the scene side hands over for one frame
#[derive(Debug, Clone, Copy)]
pub struct FrameInput<'a> {
    pub draw_data: &'a CollectedDrawData,
    pub blocks: &'a [MegaBufferBlock],
    pub camera: &'a Camera,
    pub sun: &'a DirectionalLight,
}

/// The image this frame presents into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainTarget {
    pub texture: ImageHandle,
    pub view: ImageViewHandle,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
}

impl SwapchainTarget {
    fn desc(&self) -> TextureDesc {
        TextureDesc::new(
            self.format,
            self.width,
            self.height,
            TextureUsage::RENDER_ATTACHMENT,
        )
    }
}

struct PendingUpload {
    layer: u32,
    ticket: UploadTicket,
}

/// Deferred renderer
pub struct DeferredRenderer {
    graph: RenderGraph,
    culling: CullingPass,
    shadow: ShadowPass,
    gbuffer: GBufferPass,
    lighting: LightingPass,
    skybox: SkyboxPass,
    tonemap: TonemappingPass,
    uniforms: RingBuffer,
    materials: MaterialTextureArray,
    pending_uploads: Vec<PendingUpload>,
    frames_in_flight: u32,
    frame_counter: u64,
    width: u32,
    height: u32,
}

impl DeferredRenderer {
    /// Create every pass. Any backend failure aborts startup.
    pub fn new(
        device: &mut dyn Device,
        ctx: &EngineContext,
        swapchain_format: TextureFormat,
        width: u32,
        height: u32,
    ) -> BackendResult<Self> {
        let config = ctx.config();
        config.validate()?;

        let culling = CullingPass::new(device, config)?;
        let uniforms = frame_ring(
            device,
            "frame_uniforms",
            FrameUniforms::SIZE,
            config.ring_alignment.max(UNIFORM_ALIGNMENT),
            config.frames_in_flight,
            BufferUsage::UNIFORM,
        )?;
        let materials =
            MaterialTextureArray::new(device, config.material_layer_size, config.max_material_layers)?;
        let shadow = ShadowPass::new(device, &culling, config)?;
        let gbuffer = GBufferPass::new(device, &culling, &uniforms, &materials)?;
        let lighting = LightingPass::new(device, &uniforms, &shadow)?;
        let skybox = SkyboxPass::new(device, &uniforms)?;
        let tonemap = TonemappingPass::new(
            device,
            swapchain_format,
            config.tonemap_operator,
            config.exposure,
            config.frames_in_flight,
        )?;

        log::info!(
            "Deferred renderer initialized at {}x{} ({:?} output)",
            width,
            height,
            swapchain_format
        );

        Ok(Self {
            graph: RenderGraph::new(),
            culling,
            shadow,
            gbuffer,
            lighting,
            skybox,
            tonemap,
            uniforms,
            materials,
            pending_uploads: Vec::new(),
            frames_in_flight: config.frames_in_flight,
            frame_counter: 0,
            width,
            height,
        })
    }

    /// Change the internal resolution. A zero extent (minimized window) is ignored.
    pub fn resize(&mut self, device: &mut dyn Device, width: u32, height: u32) {
        if width == 0 || height == 0 {
            log::debug!("Ignoring resize to {}x{}", width, height);
            return;
        }
        if (width, height) == (self.width, self.height) {
            return;
        }

        log::debug!(
            "Resizing renderer from {}x{} to {}x{}",
            self.width,
            self.height,
            width,
            height
        );
        // Bind groups reference pooled views, so they go first
        self.lighting.invalidate(device);
        self.skybox.invalidate(device);
        self.tonemap.invalidate(device);
        self.graph.invalidate(device);
        self.graph.pool_mut().clear(device);
        self.width = width;
        self.height = height;
    }

    /// Set or clear the environment cubemap drawn behind the scene
    pub fn set_environment(&mut self, view: Option<ImageViewHandle>) {
        self.skybox.set_environment(view);
    }

    /// Decode `bytes` on the upload pool and copy the result into a material layer once
    /// it is ready. The default layers cannot be replaced.
    pub fn request_material_texture(
        &mut self,
        ctx: &EngineContext,
        layer: u32,
        bytes: Vec<u8>,
    ) -> BackendResult<()> {
        if layer < default_layers::COUNT || layer >= self.materials.layer_count() {
            return Err(BackendError::InvalidParameter(format!(
                "material layer {} is outside the user range {}..{}",
                layer,
                default_layers::COUNT,
                self.materials.layer_count()
            )));
        }

        let ticket = ctx.uploads.submit(
            &format!("material_{}", layer),
            bytes,
            self.materials.layer_size(),
        );
        self.pending_uploads.push(PendingUpload { layer, ticket });
        Ok(())
    }

    /// Number of texture uploads not yet applied
    pub fn pending_uploads(&self) -> usize {
        self.pending_uploads.len()
    }

    /// Block until every requested texture is decoded, then apply them
    pub fn finish_uploads(&mut self, device: &mut dyn Device) {
        for upload in std::mem::take(&mut self.pending_uploads) {
            let result = upload.ticket.wait();
            Self::apply_upload(&mut self.materials, device, upload.layer, result);
        }
    }

    fn poll_uploads(&mut self, device: &mut dyn Device) {
        let materials = &mut self.materials;
        self.pending_uploads
            .retain_mut(|upload| match upload.ticket.try_take() {
                Some(result) => {
                    Self::apply_upload(materials, device, upload.layer, result);
                    false
                }
                None => true,
            });
    }

    fn apply_upload(
        materials: &mut MaterialTextureArray,
        device: &mut dyn Device,
        layer: u32,
        result: Result<crate::resources::TextureData, crate::resources::UploadError>,
    ) {
        match result {
            Ok(data) => match materials.upload(device, layer, &data) {
                Ok(()) => log::debug!("Material layer {} now holds '{}'", layer, data.name),
                Err(e) => log::warn!("Failed to write material layer {}: {}", layer, e),
            },
            Err(e) => log::warn!("Material texture for layer {} failed: {}", layer, e),
        }
    }

    /// Record one frame into `target`.
    ///
    /// The caller must not have more than `frames_in_flight` frames of unfinished GPU
    /// work outstanding when this is called.
    pub fn render_frame<B: Device + GraphicsContext>(
        &mut self,
        backend: &mut B,
        ctx: &EngineContext,
        input: &FrameInput,
        target: &SwapchainTarget,
    ) -> BackendResult<()> {
        if target.width == 0 || target.height == 0 {
            log::debug!("Swapchain has zero extent, skipping frame");
            return Ok(());
        }
        if (target.width, target.height) != (self.width, self.height) {
            self.resize(backend, target.width, target.height);
        }

        let frame_index = (self.frame_counter % u64::from(self.frames_in_flight)) as u32;
        self.frame_counter += 1;
        log::trace!(
            "Frame {} (clock frame {}) using slot {}",
            self.frame_counter,
            ctx.clock.frame_number(),
            frame_index
        );

        self.poll_uploads(backend);

        let draw_data = input.draw_data;
        let total_batches = self.culling.upload_scene_data(backend, frame_index, draw_data);
        let culling = self
            .culling
            .prepare(backend, frame_index, draw_data.view_proj, total_batches);
        let shadows = self
            .shadow
            .prepare(backend, frame_index, input.camera, input.sun, total_batches);

        let size = self.shadow.size() as f32;
        let uniforms = FrameUniforms {
            camera: input.camera.uniform_data(),
            sun: input.sun.to_gpu_data(),
            cascades: shadows.cascades,
            shadow_params: Vec4::new(size, 1.0 / size, SHADOW_COMPARE_BIAS, AMBIENT_INTENSITY),
        };
        self.uniforms.reset(frame_index);
        self.uniforms.write(&[uniforms]);
        self.uniforms.flush(backend);

        self.graph.reset(frame_index);
        let swapchain = self
            .graph
            .import_texture(target.texture, target.view, target.desc());
        let shadow_map = self.graph.import_texture(
            self.shadow.texture(),
            self.shadow.array_view(),
            self.shadow.texture_desc(),
        );

        self.graph.add_node(
            backend,
            "Culling",
            |builder| builder.compute_only(),
            move |ctx| culling.record(ctx.cmd()),
        );

        let shadow_blocks = input.blocks.to_vec();
        let shadow_size = self.shadow.size();
        self.graph.add_node(
            backend,
            "Shadow",
            |builder| {
                builder.compute_only();
                builder.set_dimensions(shadow_size, shadow_size);
                builder.read(shadow_map);
            },
            move |ctx| shadows.record(ctx.cmd(), &shadow_blocks),
        );

        let gbuffer = self.gbuffer.add_to_graph(
            &mut self.graph,
            backend,
            self.width,
            self.height,
            self.culling.targets(frame_index),
            input.blocks,
        );
        let hdr = self
            .lighting
            .add_to_graph(&mut self.graph, backend, &gbuffer, shadow_map)?;
        self.skybox
            .add_to_graph(&mut self.graph, backend, hdr, gbuffer.depth)?;
        self.tonemap
            .add_to_graph(&mut self.graph, backend, hdr, swapchain)?;

        self.graph.compile(backend)?;
        self.graph.execute(backend);

        if self.frame_counter % TRANSIENT_IDLE_FRAMES == 0 {
            self.graph.pool_mut().trim(backend, TRANSIENT_IDLE_FRAMES);
        }
        Ok(())
    }

    pub fn graph(&self) -> &RenderGraph {
        &self.graph
    }

    pub fn culling(&self) -> &CullingPass {
        &self.culling
    }

    pub fn shadow(&self) -> &ShadowPass {
        &self.shadow
    }

    pub fn materials(&self) -> &MaterialTextureArray {
        &self.materials
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    /// Release every backend object. Call after the GPU is idle.
    pub fn destroy(&mut self, device: &mut dyn Device) {
        self.lighting.destroy(device);
        self.skybox.destroy(device);
        self.tonemap.destroy(device);
        self.graph.destroy(device);
        self.gbuffer.destroy(device);
        self.shadow.destroy(device);
        self.culling.destroy(device);
        self.uniforms.destroy(device);
        self.materials.destroy(device);
        log::info!("Deferred renderer destroyed after {} frames", self.frame_counter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RendererConfig;

    fn small_config() -> RendererConfig {
        RendererConfig {
            max_instances: 64,
            max_batches: 64,
            max_batches_per_block: 64,
            shadow_map_size: 64,
            material_layer_size: 4,
            max_material_layers: 8,
            max_concurrent_uploads: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_resize_ignored() {
        let mut device = HeadlessBackend::new();
        let ctx = EngineContext::init(small_config()).unwrap();
        let mut renderer =
            DeferredRenderer::new(&mut device, &ctx, TextureFormat::Bgra8UnormSrgb, 320, 240).unwrap();

        renderer.resize(&mut device, 0, 480);
        assert_eq!(renderer.dimensions(), (320, 240));
        renderer.resize(&mut device, 640, 480);
        assert_eq!(renderer.dimensions(), (640, 480));
    }

    #[test]
    fn test_default_material_layers_protected() {
        let mut device = HeadlessBackend::new();
        let ctx = EngineContext::init(small_config()).unwrap();
        let mut renderer =
            DeferredRenderer::new(&mut device, &ctx, TextureFormat::Bgra8UnormSrgb, 320, 240).unwrap();

        assert!(renderer
            .request_material_texture(&ctx, default_layers::WHITE, Vec::new())
            .is_err());
        assert!(renderer.request_material_texture(&ctx, 8, Vec::new()).is_err());
        assert_eq!(renderer.pending_uploads(), 0);
    }

    #[test]
    fn test_pipeline_failure_aborts_startup() {
        let mut device = HeadlessBackend::new();
        device.set_failures(FailureInjection {
            pipelines: true,
            ..Default::default()
        });
        let ctx = EngineContext::init(small_config()).unwrap();
        let result = DeferredRenderer::new(&mut device, &ctx, TextureFormat::Bgra8UnormSrgb, 320, 240);
        assert!(matches!(result, Err(BackendError::PipelineCreationFailed(_))));
    }
}
