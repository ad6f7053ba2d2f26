//! wgpu backend implementation
//!
//! Render pass commands are buffered between `begin_render_pass` and `end_render_pass`
//! and encoded in one go, since a `wgpu::RenderPass` borrows the encoder and every
//! resource it touches. Compute work is buffered the same way and flushed as soon as
//! anything that is not compute work is recorded.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::renderer::SwapchainTarget;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::ops::Range;
use std::sync::Arc;
use wgpu::util::DeviceExt;

/// Reserved handle ids for the image acquired from the surface
const SWAPCHAIN_TEXTURE_ID: u64 = u64::MAX;
const SWAPCHAIN_VIEW_ID: u64 = u64::MAX;

/// Byte size of one `DrawIndexedIndirect` command as wgpu packs them
const INDEXED_INDIRECT_STRIDE: u32 = 20;

/// Buffered render pass command
#[derive(Clone)]
enum RenderCommand {
    SetPipeline(RenderPipelineHandle),
    SetBindGroup { index: u32, bind_group: BindGroupHandle },
    SetVertexBuffer { slot: u32, buffer: BufferHandle, offset: u64 },
    SetIndexBuffer { buffer: BufferHandle, offset: u64, format: IndexFormat },
    PushConstants { stages: ShaderStageFlags, offset: u32, data: Vec<u8> },
    SetViewport { x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32 },
    SetScissorRect { x: u32, y: u32, width: u32, height: u32 },
    Draw { vertices: Range<u32>, instances: Range<u32> },
    DrawIndexed { indices: Range<u32>, base_vertex: i32, instances: Range<u32> },
    DrawIndexedIndirect { buffer: BufferHandle, offset: u64, draw_count: u32, stride: u32 },
    DrawIndexedIndirectCount(IndirectCountDraw),
}

/// Buffered compute pass command
#[derive(Clone)]
enum ComputeCommand {
    SetPipeline(ComputePipelineHandle),
    SetBindGroup { index: u32, bind_group: BindGroupHandle },
    PushConstants { offset: u32, data: Vec<u8> },
    Dispatch { x: u32, y: u32, z: u32 },
}

/// Pending render pass with buffered commands
struct PendingRenderPass {
    layout: RenderPassLayout,
    framebuffer: FramebufferDescriptor,
    commands: Vec<RenderCommand>,
}

struct TextureEntry {
    texture: wgpu::Texture,
    format: TextureFormat,
}

/// wgpu backend implementation
pub struct WgpuBackend {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    surface: wgpu::Surface<'static>,
    #[allow(dead_code)]
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface_config: wgpu::SurfaceConfiguration,
    current_texture: Option<wgpu::SurfaceTexture>,
    capabilities: DeviceCapabilities,

    // Resource storage
    buffers: HashMap<u64, wgpu::Buffer>,
    textures: HashMap<u64, TextureEntry>,
    texture_views: HashMap<u64, wgpu::TextureView>,
    samplers: HashMap<u64, wgpu::Sampler>,
    bind_group_layouts: HashMap<u64, wgpu::BindGroupLayout>,
    bind_groups: HashMap<u64, wgpu::BindGroup>,
    render_pipelines: HashMap<u64, wgpu::RenderPipeline>,
    compute_pipelines: HashMap<u64, wgpu::ComputePipeline>,
    render_passes: HashMap<u64, RenderPassLayout>,
    framebuffers: HashMap<u64, FramebufferDescriptor>,

    // Shared by every handle type; ids never collide with the reserved swapchain ids
    next_id: u64,

    // Command encoding
    encoder: Option<wgpu::CommandEncoder>,

    // Pending passes - commands are buffered here and encoded when the pass closes
    pending_render_pass: Option<PendingRenderPass>,
    pending_compute_pass: Option<Vec<ComputeCommand>>,
}

impl WgpuBackend {
    /// Create the backend for a window. Fails when the adapter lacks push constants.
    pub fn new(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(window, vsync))
    }

    pub async fn new_async(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        let (instance, surface, adapter) = Self::init_adapter(window.clone()).await?;

        let available = adapter.features();
        if !available.contains(wgpu::Features::PUSH_CONSTANTS) {
            return Err(BackendError::UnsupportedFeature(
                "push constants are required by the culling and tonemapping passes".into(),
            ));
        }
        if !available.contains(wgpu::Features::INDIRECT_FIRST_INSTANCE) {
            log::warn!("INDIRECT_FIRST_INSTANCE unavailable, culled instances may read the wrong data");
        }
        let wanted = wgpu::Features::PUSH_CONSTANTS
            | wgpu::Features::INDIRECT_FIRST_INSTANCE
            | wgpu::Features::MULTI_DRAW_INDIRECT
            | wgpu::Features::MULTI_DRAW_INDIRECT_COUNT;
        let required_features = available & wanted;

        let adapter_limits = adapter.limits();
        let required_limits = wgpu::Limits {
            max_push_constant_size: adapter_limits.max_push_constant_size.min(128),
            ..wgpu::Limits::default().using_resolution(adapter_limits.clone())
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Graphics Device"),
                    required_features,
                    required_limits: required_limits.clone(),
                },
                None,
            )
            .await
            .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

        let capabilities = DeviceCapabilities {
            draw_indirect_count: required_features.contains(wgpu::Features::MULTI_DRAW_INDIRECT_COUNT),
            multi_draw_indirect: required_features.contains(wgpu::Features::MULTI_DRAW_INDIRECT),
            min_storage_buffer_offset_alignment: required_limits.min_storage_buffer_offset_alignment,
            max_push_constant_size: required_limits.max_push_constant_size,
        };
        if capabilities.draw_indirect_count {
            log::info!("Draw-indirect-count supported, culled draws stay on the GPU");
        } else {
            log::warn!(
                "Draw-indirect-count unsupported, falling back to a CPU readback of draw counts every frame"
            );
        }

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb() && Self::convert_texture_format_back(*f).is_some())
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| BackendError::SurfaceCreationFailed("surface reports no formats".into()))?;
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let present_mode = if vsync {
            wgpu::PresentMode::AutoVsync
        } else {
            wgpu::PresentMode::AutoNoVsync
        };

        let (width, height) =
            Self::clamp_extent(size.width, size.height, device.limits().max_texture_dimension_2d);
        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width,
            height,
            present_mode,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        Ok(Self {
            instance,
            surface,
            adapter,
            device,
            queue,
            surface_config,
            current_texture: None,
            capabilities,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            samplers: HashMap::new(),
            bind_group_layouts: HashMap::new(),
            bind_groups: HashMap::new(),
            render_pipelines: HashMap::new(),
            compute_pipelines: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            next_id: 1,
            encoder: None,
            pending_render_pass: None,
            pending_compute_pass: None,
        })
    }

    async fn init_adapter(
        window: Arc<winit::window::Window>,
    ) -> BackendResult<(wgpu::Instance, wgpu::Surface<'static>, wgpu::Adapter)> {
        // On Windows, try Vulkan first to avoid D3D12 debug layer validation errors
        let backends = if std::env::var("WGPU_BACKEND").is_ok() {
            wgpu::Backends::all()
        } else {
            #[cfg(target_os = "windows")]
            {
                wgpu::Backends::VULKAN
            }
            #[cfg(not(target_os = "windows"))]
            {
                wgpu::Backends::all()
            }
        };

        for backends in [backends, wgpu::Backends::all()] {
            let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
                backends,
                ..Default::default()
            });
            let surface = instance
                .create_surface(window.clone())
                .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: Some(&surface),
                    force_fallback_adapter: false,
                })
                .await;

            if let Some(adapter) = adapter {
                let info = adapter.get_info();
                log::info!("Selected GPU: {} ({:?} backend)", info.name, info.backend);
                return Ok((instance, surface, adapter));
            }
            log::warn!("No adapter for {:?}, retrying with all backends", backends);
        }

        Err(BackendError::InitializationFailed("No suitable adapter found".into()))
    }

    /// Clamp to device limits while maintaining aspect ratio
    fn clamp_extent(width: u32, height: u32, max_size: u32) -> (u32, u32) {
        if width > max_size || height > max_size {
            let scale = (max_size as f32 / width as f32).min(max_size as f32 / height as f32);
            (
                ((width as f32 * scale) as u32).max(1),
                ((height as f32 * scale) as u32).max(1),
            )
        } else {
            (width.max(1), height.max(1))
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let (width, height) =
            Self::clamp_extent(width, height, self.device.limits().max_texture_dimension_2d);
        self.surface_config.width = width;
        self.surface_config.height = height;
        self.surface.configure(&self.device, &self.surface_config);
    }

    pub fn surface_size(&self) -> (u32, u32) {
        (self.surface_config.width, self.surface_config.height)
    }

    pub fn surface_format(&self) -> TextureFormat {
        Self::convert_texture_format_back(self.surface_config.format)
            .unwrap_or(TextureFormat::Bgra8UnormSrgb)
    }

    /// Acquire the next surface image as a target the renderer can import
    pub fn acquire_frame(&mut self) -> BackendResult<SwapchainTarget> {
        let output = self.surface.get_current_texture().map_err(|e| match e {
            wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated => BackendError::SurfaceLost,
            wgpu::SurfaceError::OutOfMemory => BackendError::OutOfMemory,
            _ => BackendError::AcquireImageFailed(e.to_string()),
        })?;

        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        self.texture_views.insert(SWAPCHAIN_VIEW_ID, view);
        self.current_texture = Some(output);

        Ok(SwapchainTarget {
            texture: ImageHandle(SWAPCHAIN_TEXTURE_ID),
            view: ImageViewHandle(SWAPCHAIN_VIEW_ID),
            format: self.surface_format(),
            width: self.surface_config.width,
            height: self.surface_config.height,
        })
    }

    /// Submit the recorded frame and present the acquired image
    pub fn present(&mut self) {
        self.submit();
        self.texture_views.remove(&SWAPCHAIN_VIEW_ID);
        if let Some(output) = self.current_texture.take() {
            output.present();
        }
    }

    /// Submit everything recorded so far without waiting
    pub fn submit(&mut self) {
        self.flush_compute_pass();
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Validate WGSL with naga before handing it to wgpu, so errors surface as results
    fn create_shader_module(&self, label: Option<&str>, source: &str) -> BackendResult<wgpu::ShaderModule> {
        crate::pipeline::validate_wgsl(source)?;
        Ok(self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label,
            source: wgpu::ShaderSource::Wgsl(source.into()),
        }))
    }

    fn create_pipeline_layout(
        &self,
        label: Option<&str>,
        bind_group_layouts: &[BindGroupLayoutHandle],
        push_constant_ranges: &[PushConstantRange],
    ) -> BackendResult<wgpu::PipelineLayout> {
        let layouts = bind_group_layouts
            .iter()
            .map(|handle| {
                self.bind_group_layouts
                    .get(&handle.0)
                    .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", handle)))
            })
            .collect::<BackendResult<Vec<_>>>()?;
        let ranges: Vec<wgpu::PushConstantRange> = push_constant_ranges
            .iter()
            .map(|r| wgpu::PushConstantRange {
                stages: Self::convert_shader_stages(r.stages),
                range: r.range.clone(),
            })
            .collect();

        Ok(self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label,
                bind_group_layouts: &layouts,
                push_constant_ranges: &ranges,
            }))
    }

    /// Pop a validation scope pushed before creating an object
    fn pop_validation_scope(&self, what: &str) -> Option<String> {
        pollster::block_on(self.device.pop_error_scope()).map(|err| format!("{}: {}", what, err))
    }

    /// Copy `out.len()` bytes back from a buffer after waiting for the GPU
    fn read_back(&mut self, buffer: BufferHandle, offset: u64, out: &mut [u8]) -> BackendResult<()> {
        if self.pending_render_pass.is_some() {
            log::debug!("Readback inside a render pass, pass commands stay buffered");
        }
        self.flush_compute_pass();

        let size = (out.len() as u64 + wgpu::COPY_BUFFER_ALIGNMENT - 1) & !(wgpu::COPY_BUFFER_ALIGNMENT - 1);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let source = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", buffer)))?;
        let mut encoder = self.encoder.take().unwrap_or_else(|| {
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            })
        });
        encoder.copy_buffer_to_buffer(source, offset, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|e| BackendError::ReadbackFailed(e.to_string()))?
            .map_err(|e| BackendError::ReadbackFailed(e.to_string()))?;

        {
            let mapped = slice.get_mapped_range();
            out.copy_from_slice(&mapped[..out.len()]);
        }
        staging.unmap();
        Ok(())
    }

    fn flush_compute_pass(&mut self) {
        let Some(commands) = self.pending_compute_pass.take() else {
            return;
        };
        if commands.is_empty() {
            return;
        }

        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            })
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("compute"),
            timestamp_writes: None,
        });
        for cmd in &commands {
            match cmd {
                ComputeCommand::SetPipeline(handle) => {
                    if let Some(pipeline) = self.compute_pipelines.get(&handle.0) {
                        pass.set_pipeline(pipeline);
                    }
                }
                ComputeCommand::SetBindGroup { index, bind_group } => {
                    if let Some(bg) = self.bind_groups.get(&bind_group.0) {
                        pass.set_bind_group(*index, bg, &[]);
                    }
                }
                ComputeCommand::PushConstants { offset, data } => {
                    pass.set_push_constants(*offset, data);
                }
                ComputeCommand::Dispatch { x, y, z } => {
                    pass.dispatch_workgroups(*x, *y, *z);
                }
            }
        }
    }

    fn record_compute(&mut self, command: ComputeCommand) {
        self.pending_compute_pass.get_or_insert_with(Vec::new).push(command);
    }

    fn record_render(&mut self, command: RenderCommand) -> bool {
        match self.pending_render_pass.as_mut() {
            Some(pass) => {
                pass.commands.push(command);
                true
            }
            None => false,
        }
    }

    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
            TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
            TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
        }
    }

    fn convert_texture_format_back(format: wgpu::TextureFormat) -> Option<TextureFormat> {
        Some(match format {
            wgpu::TextureFormat::Rgba8Unorm => TextureFormat::Rgba8Unorm,
            wgpu::TextureFormat::Rgba8UnormSrgb => TextureFormat::Rgba8UnormSrgb,
            wgpu::TextureFormat::Bgra8Unorm => TextureFormat::Bgra8Unorm,
            wgpu::TextureFormat::Bgra8UnormSrgb => TextureFormat::Bgra8UnormSrgb,
            wgpu::TextureFormat::Rgba16Float => TextureFormat::Rgba16Float,
            _ => return None,
        })
    }

    fn convert_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
        let mut result = wgpu::BufferUsages::empty();
        if usage.contains(BufferUsage::MAP_READ) {
            result |= wgpu::BufferUsages::MAP_READ;
        }
        if usage.contains(BufferUsage::MAP_WRITE) {
            result |= wgpu::BufferUsages::MAP_WRITE;
        }
        if usage.contains(BufferUsage::COPY_SRC) {
            result |= wgpu::BufferUsages::COPY_SRC;
        }
        if usage.contains(BufferUsage::COPY_DST) {
            result |= wgpu::BufferUsages::COPY_DST;
        }
        if usage.contains(BufferUsage::INDEX) {
            result |= wgpu::BufferUsages::INDEX;
        }
        if usage.contains(BufferUsage::VERTEX) {
            result |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            result |= wgpu::BufferUsages::UNIFORM;
        }
        if usage.contains(BufferUsage::STORAGE) {
            result |= wgpu::BufferUsages::STORAGE;
        }
        if usage.contains(BufferUsage::INDIRECT) {
            result |= wgpu::BufferUsages::INDIRECT;
        }
        result
    }

    fn convert_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
        let mut result = wgpu::TextureUsages::empty();
        if usage.contains(TextureUsage::COPY_SRC) {
            result |= wgpu::TextureUsages::COPY_SRC;
        }
        if usage.contains(TextureUsage::COPY_DST) {
            result |= wgpu::TextureUsages::COPY_DST;
        }
        if usage.contains(TextureUsage::TEXTURE_BINDING) {
            result |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(TextureUsage::STORAGE_BINDING) {
            result |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            result |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        result
    }

    fn convert_shader_stages(stages: ShaderStageFlags) -> wgpu::ShaderStages {
        let mut result = wgpu::ShaderStages::NONE;
        if stages.contains(ShaderStageFlags::VERTEX) {
            result |= wgpu::ShaderStages::VERTEX;
        }
        if stages.contains(ShaderStageFlags::FRAGMENT) {
            result |= wgpu::ShaderStages::FRAGMENT;
        }
        if stages.contains(ShaderStageFlags::COMPUTE) {
            result |= wgpu::ShaderStages::COMPUTE;
        }
        result
    }

    fn convert_view_dimension(dimension: TextureViewDimension) -> wgpu::TextureViewDimension {
        match dimension {
            TextureViewDimension::D2 => wgpu::TextureViewDimension::D2,
            TextureViewDimension::D2Array => wgpu::TextureViewDimension::D2Array,
            TextureViewDimension::Cube => wgpu::TextureViewDimension::Cube,
        }
    }

    fn convert_binding_type(ty: &BindingType) -> wgpu::BindingType {
        match ty {
            BindingType::UniformBuffer => wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            BindingType::StorageBuffer { read_only } => wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: *read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            BindingType::Texture { sample_type, dimension } => wgpu::BindingType::Texture {
                sample_type: match sample_type {
                    TextureSampleType::Float { filterable } => {
                        wgpu::TextureSampleType::Float { filterable: *filterable }
                    }
                    TextureSampleType::Depth => wgpu::TextureSampleType::Depth,
                    TextureSampleType::Uint => wgpu::TextureSampleType::Uint,
                },
                view_dimension: Self::convert_view_dimension(*dimension),
                multisampled: false,
            },
            BindingType::Sampler { comparison } => wgpu::BindingType::Sampler(if *comparison {
                wgpu::SamplerBindingType::Comparison
            } else {
                wgpu::SamplerBindingType::Filtering
            }),
        }
    }

    fn convert_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
        match format {
            VertexFormat::Float32 => wgpu::VertexFormat::Float32,
            VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
            VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
            VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
            VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
            VertexFormat::Sint32 => wgpu::VertexFormat::Sint32,
        }
    }

    fn convert_topology(topology: PrimitiveTopology) -> wgpu::PrimitiveTopology {
        match topology {
            PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
            PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
            PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        }
    }

    fn convert_compare_function(func: CompareFunction) -> wgpu::CompareFunction {
        match func {
            CompareFunction::Never => wgpu::CompareFunction::Never,
            CompareFunction::Less => wgpu::CompareFunction::Less,
            CompareFunction::Equal => wgpu::CompareFunction::Equal,
            CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
            CompareFunction::Greater => wgpu::CompareFunction::Greater,
            CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
            CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
            CompareFunction::Always => wgpu::CompareFunction::Always,
        }
    }

    fn convert_filter_mode(mode: FilterMode) -> wgpu::FilterMode {
        match mode {
            FilterMode::Nearest => wgpu::FilterMode::Nearest,
            FilterMode::Linear => wgpu::FilterMode::Linear,
        }
    }

    fn convert_address_mode(mode: AddressMode) -> wgpu::AddressMode {
        match mode {
            AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
            AddressMode::Repeat => wgpu::AddressMode::Repeat,
            AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
        }
    }

    fn convert_store_op(op: StoreOp) -> wgpu::StoreOp {
        match op {
            StoreOp::Store => wgpu::StoreOp::Store,
            StoreOp::Discard => wgpu::StoreOp::Discard,
        }
    }
}

impl Device for WgpuBackend {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: desc.label.as_deref(),
            size: desc.size,
            usage: Self::convert_buffer_usage(desc.usage),
            mapped_at_creation: desc.mapped_at_creation,
        });
        let id = self.alloc_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8]) -> BackendResult<BufferHandle> {
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: desc.label.as_deref(),
            contents: data,
            usage: Self::convert_buffer_usage(desc.usage),
        });
        let id = self.alloc_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        match self.buffers.get(&buffer.0) {
            Some(buf) => self.queue.write_buffer(buf, offset, data),
            None => log::warn!("write_buffer on unknown {:?}", buffer),
        }
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, out: &mut [u8]) -> BackendResult<()> {
        self.read_back(buffer, offset, out)
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<ImageHandle> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.array_layers.max(1),
            },
            mip_level_count: desc.mip_levels.max(1),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::convert_texture_format(desc.format),
            usage: Self::convert_texture_usage(desc.usage),
            view_formats: &[],
        });
        let id = self.alloc_id();
        self.textures.insert(
            id,
            TextureEntry {
                texture,
                format: desc.format,
            },
        );
        Ok(ImageHandle(id))
    }

    fn create_texture_view(
        &mut self,
        texture: ImageHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<ImageViewHandle> {
        let entry = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", texture)))?;
        let view = entry.texture.create_view(&wgpu::TextureViewDescriptor {
            label: None,
            dimension: Some(Self::convert_view_dimension(desc.dimension)),
            base_array_layer: desc.base_array_layer,
            array_layer_count: desc.array_layer_count,
            ..Default::default()
        });
        let id = self.alloc_id();
        self.texture_views.insert(id, view);
        Ok(ImageViewHandle(id))
    }

    fn write_texture(&mut self, texture: ImageHandle, layer: u32, data: &[u8], width: u32, height: u32) {
        let Some(entry) = self.textures.get(&texture.0) else {
            log::warn!("write_texture on unknown {:?}", texture);
            return;
        };
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(entry.format.bytes_per_pixel() * width),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: desc.label.as_deref(),
            address_mode_u: Self::convert_address_mode(desc.address_mode_u),
            address_mode_v: Self::convert_address_mode(desc.address_mode_v),
            address_mode_w: Self::convert_address_mode(desc.address_mode_w),
            mag_filter: Self::convert_filter_mode(desc.mag_filter),
            min_filter: Self::convert_filter_mode(desc.min_filter),
            mipmap_filter: Self::convert_filter_mode(desc.mipmap_filter),
            compare: desc.compare.map(Self::convert_compare_function),
            ..Default::default()
        });
        let id = self.alloc_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let wgpu_entries: Vec<wgpu::BindGroupLayoutEntry> = entries
            .iter()
            .map(|entry| wgpu::BindGroupLayoutEntry {
                binding: entry.binding,
                visibility: Self::convert_shader_stages(entry.visibility),
                ty: Self::convert_binding_type(&entry.ty),
                count: None,
            })
            .collect();

        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: None,
                entries: &wgpu_entries,
            });
        let id = self.alloc_id();
        self.bind_group_layouts.insert(id, layout);
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let wgpu_layout = self
            .bind_group_layouts
            .get(&layout.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", layout)))?;

        let wgpu_entries = entries
            .iter()
            .map(|(binding, entry)| {
                let resource = match entry {
                    BindGroupEntry::Buffer { buffer, offset, size } => {
                        let buf = self
                            .buffers
                            .get(&buffer.0)
                            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", buffer)))?;
                        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: buf,
                            offset: *offset,
                            size: size.and_then(NonZeroU64::new),
                        })
                    }
                    BindGroupEntry::Texture(view) => wgpu::BindingResource::TextureView(
                        self.texture_views
                            .get(&view.0)
                            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", view)))?,
                    ),
                    BindGroupEntry::Sampler(sampler) => wgpu::BindingResource::Sampler(
                        self.samplers
                            .get(&sampler.0)
                            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", sampler)))?,
                    ),
                };
                Ok(wgpu::BindGroupEntry {
                    binding: *binding,
                    resource,
                })
            })
            .collect::<BackendResult<Vec<_>>>()?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: wgpu_layout,
            entries: &wgpu_entries,
        });
        if let Some(err) = self.pop_validation_scope("bind group") {
            return Err(BackendError::DescriptorSetCreationFailed(err));
        }

        let id = self.alloc_id();
        self.bind_groups.insert(id, bind_group);
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        let label = desc.label.as_deref();
        let shader = self
            .create_shader_module(label, &desc.shader)
            .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;
        let layout =
            self.create_pipeline_layout(label, &desc.bind_group_layouts, &desc.push_constant_ranges)?;

        let attributes: Vec<Vec<wgpu::VertexAttribute>> = desc
            .vertex_layouts
            .iter()
            .map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(|attr| wgpu::VertexAttribute {
                        format: Self::convert_vertex_format(attr.format),
                        offset: attr.offset,
                        shader_location: attr.location,
                    })
                    .collect()
            })
            .collect();
        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = desc
            .vertex_layouts
            .iter()
            .zip(&attributes)
            .map(|(layout, attributes)| wgpu::VertexBufferLayout {
                array_stride: layout.array_stride,
                step_mode: match layout.step_mode {
                    VertexStepMode::Vertex => wgpu::VertexStepMode::Vertex,
                    VertexStepMode::Instance => wgpu::VertexStepMode::Instance,
                },
                attributes,
            })
            .collect();

        let color_targets: Vec<Option<wgpu::ColorTargetState>> = desc
            .color_targets
            .iter()
            .map(|target| {
                Some(wgpu::ColorTargetState {
                    format: Self::convert_texture_format(target.format),
                    blend: None,
                    write_mask: wgpu::ColorWrites::from_bits_truncate(target.write_mask.bits()),
                })
            })
            .collect();

        let depth_stencil = desc.depth_stencil.as_ref().map(|ds| wgpu::DepthStencilState {
            format: Self::convert_texture_format(ds.format),
            depth_write_enabled: ds.depth_write_enabled,
            depth_compare: Self::convert_compare_function(ds.depth_compare),
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState {
                constant: ds.depth_bias,
                slope_scale: ds.depth_bias_slope_scale,
                clamp: 0.0,
            },
        });

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label,
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: "vs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &vertex_buffers,
                },
                fragment: desc.has_fragment.then(|| wgpu::FragmentState {
                    module: &shader,
                    entry_point: "fs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &color_targets,
                }),
                primitive: wgpu::PrimitiveState {
                    topology: Self::convert_topology(desc.primitive_topology),
                    strip_index_format: None,
                    front_face: match desc.front_face {
                        FrontFace::Ccw => wgpu::FrontFace::Ccw,
                        FrontFace::Cw => wgpu::FrontFace::Cw,
                    },
                    cull_mode: match desc.cull_mode {
                        CullMode::None => None,
                        CullMode::Front => Some(wgpu::Face::Front),
                        CullMode::Back => Some(wgpu::Face::Back),
                    },
                    unclipped_depth: false,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    conservative: false,
                },
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            });
        if let Some(err) = self.pop_validation_scope("render pipeline") {
            return Err(BackendError::PipelineCreationFailed(err));
        }

        let id = self.alloc_id();
        self.render_pipelines.insert(id, pipeline);
        Ok(RenderPipelineHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        let label = desc.label.as_deref();
        let shader = self
            .create_shader_module(label, &desc.shader)
            .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;
        let layout =
            self.create_pipeline_layout(label, &desc.bind_group_layouts, &desc.push_constant_ranges)?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label,
                layout: Some(&layout),
                module: &shader,
                entry_point: &desc.entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            });
        if let Some(err) = self.pop_validation_scope("compute pipeline") {
            return Err(BackendError::PipelineCreationFailed(err));
        }

        let id = self.alloc_id();
        self.compute_pipelines.insert(id, pipeline);
        Ok(ComputePipelineHandle(id))
    }

    fn create_render_pass(&mut self, layout: &RenderPassLayout) -> BackendResult<RenderPassHandle> {
        if layout.attachment_count() == 0 {
            return Err(BackendError::RenderPassCreationFailed(format!(
                "{:?} has no attachments",
                layout.label
            )));
        }
        let id = self.alloc_id();
        self.render_passes.insert(id, layout.clone());
        Ok(RenderPassHandle(id))
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor) -> BackendResult<FramebufferHandle> {
        let layout = self
            .render_passes
            .get(&desc.render_pass.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", desc.render_pass)))?;
        if layout.attachment_count() != desc.attachments.len() {
            return Err(BackendError::FramebufferCreationFailed(format!(
                "{:?} expects {} attachments, got {}",
                desc.label,
                layout.attachment_count(),
                desc.attachments.len()
            )));
        }
        let id = self.alloc_id();
        self.framebuffers.insert(id, desc.clone());
        Ok(FramebufferHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buf) = self.buffers.remove(&buffer.0) {
            buf.destroy();
        }
    }

    fn destroy_texture(&mut self, texture: ImageHandle) {
        if let Some(entry) = self.textures.remove(&texture.0) {
            entry.texture.destroy();
        }
    }

    fn destroy_texture_view(&mut self, view: ImageViewHandle) {
        self.texture_views.remove(&view.0);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.bind_groups.remove(&bind_group.0);
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        self.render_passes.remove(&render_pass.0);
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer.0);
    }
}

impl GraphicsContext for WgpuBackend {
    fn supports_draw_indirect_count(&self) -> bool {
        self.capabilities.draw_indirect_count
    }

    fn bind_graphics_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        if !self.record_render(RenderCommand::SetPipeline(pipeline)) {
            log::warn!("Graphics pipeline bound outside a render pass");
        }
    }

    fn bind_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.record_compute(ComputeCommand::SetPipeline(pipeline));
    }

    fn bind_descriptor_set(&mut self, index: u32, set: BindGroupHandle) {
        if !self.record_render(RenderCommand::SetBindGroup {
            index,
            bind_group: set,
        }) {
            self.record_compute(ComputeCommand::SetBindGroup {
                index,
                bind_group: set,
            });
        }
    }

    fn bind_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        self.record_render(RenderCommand::SetVertexBuffer { slot, buffer, offset });
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        self.record_render(RenderCommand::SetIndexBuffer { buffer, offset, format });
    }

    fn push_constants(&mut self, stages: ShaderStageFlags, offset: u32, data: &[u8]) {
        if !self.record_render(RenderCommand::PushConstants {
            stages,
            offset,
            data: data.to_vec(),
        }) {
            self.record_compute(ComputeCommand::PushConstants {
                offset,
                data: data.to_vec(),
            });
        }
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32) {
        self.record_render(RenderCommand::SetViewport {
            x,
            y,
            width,
            height,
            min_depth,
            max_depth,
        });
    }

    fn set_scissor(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.record_render(RenderCommand::SetScissorRect { x, y, width, height });
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.record_render(RenderCommand::Draw { vertices, instances });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        self.record_render(RenderCommand::DrawIndexed {
            indices,
            base_vertex,
            instances,
        });
    }

    fn draw_indexed_indirect(&mut self, buffer: BufferHandle, offset: u64, draw_count: u32, stride: u32) {
        self.record_render(RenderCommand::DrawIndexedIndirect {
            buffer,
            offset,
            draw_count,
            stride,
        });
    }

    fn draw_indexed_indirect_count(&mut self, draw: &IndirectCountDraw) {
        if draw.stride != INDEXED_INDIRECT_STRIDE {
            log::warn!("Indirect count draw with stride {} skipped", draw.stride);
            return;
        }
        self.record_render(RenderCommand::DrawIndexedIndirectCount(*draw));
    }

    fn begin_render_pass(&mut self, render_pass: RenderPassHandle, framebuffer: FramebufferHandle) {
        self.flush_compute_pass();

        let (Some(layout), Some(framebuffer)) = (
            self.render_passes.get(&render_pass.0),
            self.framebuffers.get(&framebuffer.0),
        ) else {
            log::warn!("begin_render_pass with unknown {:?} / {:?}", render_pass, framebuffer);
            return;
        };
        self.pending_render_pass = Some(PendingRenderPass {
            layout: layout.clone(),
            framebuffer: framebuffer.clone(),
            commands: Vec::new(),
        });
    }

    fn end_render_pass(&mut self) {
        let Some(pending) = self.pending_render_pass.take() else {
            return;
        };

        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            })
        });

        let color_count = pending.layout.color_attachments.len();
        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = pending
            .layout
            .color_attachments
            .iter()
            .zip(&pending.framebuffer.attachments[..color_count])
            .map(|(att, view)| {
                let view = self.texture_views.get(&view.0)?;
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: match att.load_op {
                            LoadOp::Clear(color) => wgpu::LoadOp::Clear(wgpu::Color {
                                r: color[0] as f64,
                                g: color[1] as f64,
                                b: color[2] as f64,
                                a: color[3] as f64,
                            }),
                            LoadOp::Load => wgpu::LoadOp::Load,
                        },
                        store: Self::convert_store_op(att.store_op),
                    },
                })
            })
            .collect();

        let depth_attachment = pending.layout.depth_attachment.as_ref().and_then(|att| {
            let view = pending.framebuffer.attachments.get(color_count)?;
            let view = self.texture_views.get(&view.0)?;
            Some(wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops: Some(wgpu::Operations {
                    load: match att.load_op {
                        LoadOp::Clear(value) => wgpu::LoadOp::Clear(value[0]),
                        LoadOp::Load => wgpu::LoadOp::Load,
                    },
                    store: Self::convert_store_op(att.store_op),
                }),
                stencil_ops: None,
            })
        });

        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: pending.layout.label.as_deref(),
            color_attachments: &color_attachments,
            depth_stencil_attachment: depth_attachment,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        let multi_draw = self.capabilities.multi_draw_indirect;
        for cmd in &pending.commands {
            match cmd {
                RenderCommand::SetPipeline(handle) => {
                    if let Some(pipeline) = self.render_pipelines.get(&handle.0) {
                        render_pass.set_pipeline(pipeline);
                    }
                }
                RenderCommand::SetBindGroup { index, bind_group } => {
                    if let Some(bg) = self.bind_groups.get(&bind_group.0) {
                        render_pass.set_bind_group(*index, bg, &[]);
                    }
                }
                RenderCommand::SetVertexBuffer { slot, buffer, offset } => {
                    if let Some(buf) = self.buffers.get(&buffer.0) {
                        render_pass.set_vertex_buffer(*slot, buf.slice(*offset..));
                    }
                }
                RenderCommand::SetIndexBuffer { buffer, offset, format } => {
                    if let Some(buf) = self.buffers.get(&buffer.0) {
                        let wgpu_format = match format {
                            IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
                            IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
                        };
                        render_pass.set_index_buffer(buf.slice(*offset..), wgpu_format);
                    }
                }
                RenderCommand::PushConstants { stages, offset, data } => {
                    render_pass.set_push_constants(Self::convert_shader_stages(*stages), *offset, data);
                }
                RenderCommand::SetViewport { x, y, width, height, min_depth, max_depth } => {
                    render_pass.set_viewport(*x, *y, *width, *height, *min_depth, *max_depth);
                }
                RenderCommand::SetScissorRect { x, y, width, height } => {
                    render_pass.set_scissor_rect(*x, *y, *width, *height);
                }
                RenderCommand::Draw { vertices, instances } => {
                    render_pass.draw(vertices.clone(), instances.clone());
                }
                RenderCommand::DrawIndexed { indices, base_vertex, instances } => {
                    render_pass.draw_indexed(indices.clone(), *base_vertex, instances.clone());
                }
                RenderCommand::DrawIndexedIndirect { buffer, offset, draw_count, stride } => {
                    let Some(buf) = self.buffers.get(&buffer.0) else {
                        continue;
                    };
                    if multi_draw && *stride == INDEXED_INDIRECT_STRIDE {
                        render_pass.multi_draw_indexed_indirect(buf, *offset, *draw_count);
                    } else {
                        for i in 0..*draw_count as u64 {
                            render_pass.draw_indexed_indirect(buf, *offset + i * *stride as u64);
                        }
                    }
                }
                RenderCommand::DrawIndexedIndirectCount(draw) => {
                    if let (Some(buf), Some(count)) = (
                        self.buffers.get(&draw.buffer.0),
                        self.buffers.get(&draw.count_buffer.0),
                    ) {
                        render_pass.multi_draw_indexed_indirect_count(
                            buf,
                            draw.offset,
                            count,
                            draw.count_offset,
                            draw.max_draw_count,
                        );
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        if self.pending_render_pass.is_some() {
            log::warn!("dispatch inside a render pass ignored");
            return;
        }
        self.record_compute(ComputeCommand::Dispatch { x, y, z });
    }

    fn fill_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64, value: u32) {
        self.flush_compute_pass();
        if size == 0 {
            return;
        }
        if value != 0 {
            // wgpu can only clear to zero inside the command stream
            log::warn!("fill_buffer with non-zero value {} written as zero", value);
        }
        let Some(buf) = self.buffers.get(&buffer.0) else {
            log::warn!("fill_buffer on unknown {:?}", buffer);
            return;
        };
        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            })
        });
        encoder.clear_buffer(buf, offset, Some(size));
    }

    // wgpu tracks resource state itself; barriers only split compute passes
    fn buffer_barrier(&mut self, _barrier: &BufferBarrier) {
        self.flush_compute_pass();
    }

    fn image_barrier(&mut self, _barrier: &ImageBarrier) {}

    fn global_barrier(&mut self) {
        self.flush_compute_pass();
    }

    fn wait_and_read_u32(&mut self, buffer: BufferHandle, offset: u64) -> BackendResult<u32> {
        let mut bytes = [0u8; 4];
        self.read_back(buffer, offset, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }
}
