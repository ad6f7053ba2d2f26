//! Core backend abstraction traits
//!
//! The renderer talks to the GPU only through two object-safe traits:
//! [`Device`] creates and destroys objects, [`GraphicsContext`] records commands.
//! Render graph code and passes never name a concrete backend type.

use crate::backend::types::*;
use std::ops::Range;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create shader: {0}")]
    ShaderCreationFailed(String),
    #[error("Failed to create render pass: {0}")]
    RenderPassCreationFailed(String),
    #[error("Failed to create framebuffer: {0}")]
    FramebufferCreationFailed(String),
    #[error("Failed to create descriptor set: {0}")]
    DescriptorSetCreationFailed(String),
    #[error("Buffer readback failed: {0}")]
    ReadbackFailed(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture (image)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub(crate) u64);

/// Handle to a texture view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageViewHandle(pub(crate) u64);

/// Handle to a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

/// Handle to a render pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPipelineHandle(pub(crate) u64);

/// Handle to a compute pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputePipelineHandle(pub(crate) u64);

/// Handle to a bind group (descriptor set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindGroupHandle(pub(crate) u64);

/// Handle to a bind group layout (descriptor set layout)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindGroupLayoutHandle(pub(crate) u64);

/// Handle to a render pass object (attachment formats and load/store ops)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassHandle(pub(crate) u64);

/// Handle to a framebuffer (concrete attachment views for a render pass)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferHandle(pub(crate) u64);

/// Bind group entry for creating bind groups
#[derive(Debug, Clone)]
pub enum BindGroupEntry {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        size: Option<u64>,
    },
    Texture(ImageViewHandle),
    Sampler(SamplerHandle),
}

/// Bind group layout entry
#[derive(Debug, Clone)]
pub struct BindGroupLayoutEntry {
    pub binding: u32,
    pub visibility: ShaderStageFlags,
    pub ty: BindingType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderStageFlags(u32);

impl ShaderStageFlags {
    pub const VERTEX: Self = Self(1 << 0);
    pub const FRAGMENT: Self = Self(1 << 1);
    pub const COMPUTE: Self = Self(1 << 2);
    pub const VERTEX_FRAGMENT: Self = Self((1 << 0) | (1 << 1));
    pub const ALL: Self = Self((1 << 0) | (1 << 1) | (1 << 2));

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for ShaderStageFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Binding type
#[derive(Debug, Clone)]
pub enum BindingType {
    UniformBuffer,
    StorageBuffer {
        read_only: bool,
    },
    Texture {
        sample_type: TextureSampleType,
        dimension: TextureViewDimension,
    },
    Sampler {
        comparison: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureSampleType {
    Float { filterable: bool },
    Depth,
    Uint,
}

/// Push constant range visible to a set of stages
#[derive(Debug, Clone)]
pub struct PushConstantRange {
    pub stages: ShaderStageFlags,
    pub range: Range<u32>,
}

/// Render pipeline descriptor
#[derive(Debug, Clone)]
pub struct RenderPipelineDescriptor {
    pub label: Option<String>,
    pub shader: String,
    /// Whether the shader has an `fs_main` entry point
    pub has_fragment: bool,
    pub vertex_layouts: Vec<VertexBufferLayout>,
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
    pub push_constant_ranges: Vec<PushConstantRange>,
    pub primitive_topology: PrimitiveTopology,
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub depth_stencil: Option<DepthStencilState>,
    pub color_targets: Vec<ColorTargetState>,
}

#[derive(Debug, Clone)]
pub struct DepthStencilState {
    pub format: TextureFormat,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareFunction,
    /// Constant and slope-scaled depth bias, used by shadow casters
    pub depth_bias: i32,
    pub depth_bias_slope_scale: f32,
}

#[derive(Debug, Clone)]
pub struct ColorTargetState {
    pub format: TextureFormat,
    pub write_mask: ColorWrites,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorWrites(pub u32);

impl ColorWrites {
    pub const RED: Self = Self(1 << 0);
    pub const GREEN: Self = Self(1 << 1);
    pub const BLUE: Self = Self(1 << 2);
    pub const ALPHA: Self = Self(1 << 3);
    pub const ALL: Self = Self(0xF);

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Compute pipeline descriptor
#[derive(Debug, Clone)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    pub shader: String,
    pub entry_point: String,
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
    pub push_constant_ranges: Vec<PushConstantRange>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    /// Clear to the given value; depth attachments use the first component
    Clear([f32; 4]),
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    Discard,
}

/// One attachment slot of a render pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachmentLayout {
    pub format: TextureFormat,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

/// Render pass layout: color attachments in order, depth last
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassLayout {
    pub label: Option<String>,
    pub color_attachments: Vec<AttachmentLayout>,
    pub depth_attachment: Option<AttachmentLayout>,
}

impl RenderPassLayout {
    /// Number of attachments a compatible framebuffer must provide
    pub fn attachment_count(&self) -> usize {
        self.color_attachments.len() + usize::from(self.depth_attachment.is_some())
    }
}

/// Framebuffer descriptor; views follow the render pass attachment order
#[derive(Debug, Clone)]
pub struct FramebufferDescriptor {
    pub label: Option<String>,
    pub render_pass: RenderPassHandle,
    pub attachments: Vec<ImageViewHandle>,
    pub width: u32,
    pub height: u32,
}

/// Index format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

/// Optional device features the renderer adapts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Hardware draw-count indirection (`vkCmdDrawIndexedIndirectCount`)
    pub draw_indirect_count: bool,
    /// More than one draw per indirect call
    pub multi_draw_indirect: bool,
    pub min_storage_buffer_offset_alignment: u32,
    pub max_push_constant_size: u32,
}

/// Buffer memory barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    pub offset: u64,
    /// `None` covers the rest of the buffer
    pub size: Option<u64>,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
}

/// Image layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub texture: ImageHandle,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
}

/// Arguments of an indexed indirect draw whose count lives in a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectCountDraw {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub count_buffer: BufferHandle,
    pub count_offset: u64,
    pub max_draw_count: u32,
    pub stride: u32,
}

/// Object factory side of a backend
pub trait Device {
    fn capabilities(&self) -> DeviceCapabilities;

    // Buffers

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8])
        -> BackendResult<BufferHandle>;

    /// Write data to a buffer; visible to commands submitted afterwards
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]);

    /// Blocking readback; waits until all submitted work touching the buffer is done
    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, out: &mut [u8])
        -> BackendResult<()>;

    // Textures

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<ImageHandle>;

    fn create_texture_view(
        &mut self,
        texture: ImageHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<ImageViewHandle>;

    /// Write tightly packed RGBA8 data into one array layer
    fn write_texture(&mut self, texture: ImageHandle, layer: u32, data: &[u8], width: u32, height: u32);

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;

    // Descriptor sets and pipelines

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle>;

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle>;

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle>;

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle>;

    // Render passes

    fn create_render_pass(&mut self, layout: &RenderPassLayout) -> BackendResult<RenderPassHandle>;

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor)
        -> BackendResult<FramebufferHandle>;

    // Resource cleanup

    fn destroy_buffer(&mut self, buffer: BufferHandle);
    fn destroy_texture(&mut self, texture: ImageHandle);
    fn destroy_texture_view(&mut self, view: ImageViewHandle);
    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle);
    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle);
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);
}

/// Command recording side of a backend
///
/// Recording is immediate into the single command stream of the current frame.
pub trait GraphicsContext {
    fn supports_draw_indirect_count(&self) -> bool;

    fn bind_graphics_pipeline(&mut self, pipeline: RenderPipelineHandle);
    fn bind_compute_pipeline(&mut self, pipeline: ComputePipelineHandle);
    fn bind_descriptor_set(&mut self, index: u32, set: BindGroupHandle);
    fn bind_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64);
    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat);

    fn push_constants(&mut self, stages: ShaderStageFlags, offset: u32, data: &[u8]);

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32);
    fn set_scissor(&mut self, x: u32, y: u32, width: u32, height: u32);

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>);
    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>);
    fn draw_indexed_indirect(&mut self, buffer: BufferHandle, offset: u64, draw_count: u32, stride: u32);

    /// Hardware draw-count indirection; only valid when
    /// [`supports_draw_indirect_count`](Self::supports_draw_indirect_count) is true
    fn draw_indexed_indirect_count(&mut self, draw: &IndirectCountDraw);

    fn begin_render_pass(&mut self, render_pass: RenderPassHandle, framebuffer: FramebufferHandle);
    fn end_render_pass(&mut self);

    fn dispatch(&mut self, x: u32, y: u32, z: u32);

    /// Fill `size` bytes at `offset` with a repeated 32-bit value
    fn fill_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64, value: u32);

    fn buffer_barrier(&mut self, barrier: &BufferBarrier);
    fn image_barrier(&mut self, barrier: &ImageBarrier);

    /// Full pipeline barrier: all prior work completes and is visible before later work
    fn global_barrier(&mut self);

    /// Submit everything recorded so far, wait on a fence for it, and read a `u32`
    fn wait_and_read_u32(&mut self, buffer: BufferHandle, offset: u64) -> BackendResult<u32>;

    /// Indexed indirect draw with a GPU-written draw count.
    ///
    /// Without hardware support the count is read back on the CPU after an explicit
    /// fence wait, clamped to `max_draw_count`, and drawn with a fixed count. That stalls
    /// the frame until the GPU catches up.
    fn draw_indexed_indirect_count_or_fallback(&mut self, draw: &IndirectCountDraw) {
        if self.supports_draw_indirect_count() {
            self.draw_indexed_indirect_count(draw);
            return;
        }

        match self.wait_and_read_u32(draw.count_buffer, draw.count_offset) {
            Ok(count) => {
                let count = count.min(draw.max_draw_count);
                if count > 0 {
                    self.draw_indexed_indirect(draw.buffer, draw.offset, count, draw.stride);
                }
            }
            Err(err) => {
                log::warn!("Draw count readback failed, skipping indirect draw: {}", err);
            }
        }
    }
}
