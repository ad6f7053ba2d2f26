//! Headless recording backend.
//!
//! Performs no GPU work. Buffers are backed by host memory so fills, writes and
//! readbacks behave like the real thing, and every recorded command is appended to
//! a log that tests can inspect. Capability flags and creation failures can be
//! injected to exercise fallback and fatal-init paths without GPU hardware.

use crate::backend::traits::*;
use crate::backend::types::*;
use std::collections::HashMap;
use std::ops::Range;

/// A command captured by [`HeadlessBackend`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BindGraphicsPipeline(RenderPipelineHandle),
    BindComputePipeline(ComputePipelineHandle),
    BindDescriptorSet { index: u32, set: BindGroupHandle },
    BindVertexBuffer { slot: u32, buffer: BufferHandle, offset: u64 },
    BindIndexBuffer { buffer: BufferHandle, offset: u64, format: IndexFormat },
    PushConstants { stages: ShaderStageFlags, offset: u32, data: Vec<u8> },
    SetViewport { width: f32, height: f32 },
    SetScissor { width: u32, height: u32 },
    Draw { vertices: Range<u32>, instances: Range<u32> },
    DrawIndexed { indices: Range<u32>, base_vertex: i32, instances: Range<u32> },
    DrawIndexedIndirect { buffer: BufferHandle, offset: u64, draw_count: u32, stride: u32 },
    DrawIndexedIndirectCount(IndirectCountDraw),
    BeginRenderPass { render_pass: RenderPassHandle, framebuffer: FramebufferHandle },
    EndRenderPass,
    Dispatch { x: u32, y: u32, z: u32 },
    FillBuffer { buffer: BufferHandle, offset: u64, size: u64, value: u32 },
    BufferBarrier(BufferBarrier),
    ImageBarrier(ImageBarrier),
    GlobalBarrier,
    /// Fence wait issued by a blocking readback
    WaitIdle,
}

/// Which object creations should fail, for testing fatal initialization
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureInjection {
    pub buffers: bool,
    pub textures: bool,
    pub pipelines: bool,
    pub render_passes: bool,
}

/// Headless backend implementing both [`Device`] and [`GraphicsContext`]
#[derive(Debug)]
pub struct HeadlessBackend {
    capabilities: DeviceCapabilities,
    failures: FailureInjection,

    buffers: HashMap<u64, Vec<u8>>,
    textures: HashMap<u64, TextureDescriptor>,
    layers: HashMap<(u64, u32), Vec<u8>>,
    views: HashMap<u64, ImageHandle>,
    render_passes: HashMap<u64, RenderPassLayout>,
    framebuffers: HashMap<u64, FramebufferDescriptor>,
    bind_groups: HashMap<u64, BindGroupLayoutHandle>,
    next_id: u64,

    commands: Vec<RecordedCommand>,
    in_render_pass: bool,
}

impl HeadlessBackend {
    /// Create a backend that reports hardware draw-count support
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities {
            draw_indirect_count: true,
            multi_draw_indirect: true,
            min_storage_buffer_offset_alignment: 256,
            max_push_constant_size: 128,
        })
    }

    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            failures: FailureInjection::default(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            layers: HashMap::new(),
            views: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            bind_groups: HashMap::new(),
            next_id: 1,
            commands: Vec::new(),
            in_render_pass: false,
        }
    }

    /// Backend without draw-count indirection, forcing the CPU readback path
    pub fn without_draw_indirect_count() -> Self {
        let mut backend = Self::new();
        backend.capabilities.draw_indirect_count = false;
        backend
    }

    pub fn set_failures(&mut self, failures: FailureInjection) {
        self.failures = failures;
    }

    /// Commands recorded since the last [`take_commands`](Self::take_commands)
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Host copy of a buffer's contents
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(Vec::as_slice)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn texture_descriptor(&self, texture: ImageHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0)
    }

    /// Pixels last written to one layer of a texture
    pub fn texture_layer(&self, texture: ImageHandle, layer: u32) -> Option<&[u8]> {
        self.layers.get(&(texture.0, layer)).map(Vec::as_slice)
    }

    /// Texture a view was created from
    pub fn view_texture(&self, view: ImageViewHandle) -> Option<ImageHandle> {
        self.views.get(&view.0).copied()
    }

    pub fn render_pass_layout(&self, render_pass: RenderPassHandle) -> Option<&RenderPassLayout> {
        self.render_passes.get(&render_pass.0)
    }

    pub fn framebuffer(&self, framebuffer: FramebufferHandle) -> Option<&FramebufferDescriptor> {
        self.framebuffers.get(&framebuffer.0)
    }

    pub fn render_pass_count(&self) -> usize {
        self.render_passes.len()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn record(&mut self, command: RecordedCommand) {
        self.commands.push(command);
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HeadlessBackend {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        if self.failures.buffers {
            return Err(BackendError::BufferCreationFailed(format!(
                "injected failure for {:?}",
                desc.label
            )));
        }
        log::trace!(
            "HeadlessBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let id = self.allocate_id();
        self.buffers.insert(id, vec![0u8; desc.size as usize]);
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let handle = self.create_buffer(desc)?;
        self.write_buffer(handle, 0, data);
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        let Some(storage) = self.buffers.get_mut(&buffer.0) else {
            log::warn!("HeadlessBackend: write to unknown buffer {:?}", buffer);
            return;
        };
        let start = offset as usize;
        let end = (start + data.len()).min(storage.len());
        if start < end {
            storage[start..end].copy_from_slice(&data[..end - start]);
        }
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, out: &mut [u8]) -> BackendResult<()> {
        self.record(RecordedCommand::WaitIdle);
        let storage = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", buffer)))?;
        let start = offset as usize;
        let end = start + out.len();
        if end > storage.len() {
            return Err(BackendError::ReadbackFailed(format!(
                "range {}..{} out of bounds for {} byte buffer",
                start,
                end,
                storage.len()
            )));
        }
        out.copy_from_slice(&storage[start..end]);
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<ImageHandle> {
        if self.failures.textures {
            return Err(BackendError::TextureCreationFailed(format!(
                "injected failure for {:?}",
                desc.label
            )));
        }
        log::trace!(
            "HeadlessBackend: creating texture {:?} ({}x{}x{})",
            desc.label,
            desc.width,
            desc.height,
            desc.array_layers
        );
        let id = self.allocate_id();
        self.textures.insert(id, desc.clone());
        Ok(ImageHandle(id))
    }

    fn create_texture_view(
        &mut self,
        texture: ImageHandle,
        _desc: &TextureViewDescriptor,
    ) -> BackendResult<ImageViewHandle> {
        if !self.textures.contains_key(&texture.0) {
            return Err(BackendError::TextureCreationFailed("Texture not found".into()));
        }
        let id = self.allocate_id();
        self.views.insert(id, texture);
        Ok(ImageViewHandle(id))
    }

    fn write_texture(&mut self, texture: ImageHandle, layer: u32, data: &[u8], width: u32, height: u32) {
        log::trace!(
            "HeadlessBackend: write_texture {:?} layer {} ({}x{}) len={}",
            texture,
            layer,
            width,
            height,
            data.len()
        );
        if self.textures.contains_key(&texture.0) {
            self.layers.insert((texture.0, layer), data.to_vec());
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        log::trace!("HeadlessBackend: creating sampler {:?}", desc.label);
        Ok(SamplerHandle(self.allocate_id()))
    }

    fn create_bind_group_layout(
        &mut self,
        _entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        Ok(BindGroupLayoutHandle(self.allocate_id()))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        for (binding, entry) in entries {
            let known = match entry {
                BindGroupEntry::Buffer { buffer, .. } => self.buffers.contains_key(&buffer.0),
                BindGroupEntry::Texture(view) => self.views.contains_key(&view.0),
                BindGroupEntry::Sampler(_) => true,
            };
            if !known {
                return Err(BackendError::DescriptorSetCreationFailed(format!(
                    "binding {} references a destroyed resource",
                    binding
                )));
            }
        }
        let id = self.allocate_id();
        self.bind_groups.insert(id, layout);
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        if self.failures.pipelines {
            return Err(BackendError::PipelineCreationFailed(format!(
                "injected failure for {:?}",
                desc.label
            )));
        }
        Ok(RenderPipelineHandle(self.allocate_id()))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        if self.failures.pipelines {
            return Err(BackendError::PipelineCreationFailed(format!(
                "injected failure for {:?}",
                desc.label
            )));
        }
        Ok(ComputePipelineHandle(self.allocate_id()))
    }

    fn create_render_pass(&mut self, layout: &RenderPassLayout) -> BackendResult<RenderPassHandle> {
        if self.failures.render_passes {
            return Err(BackendError::RenderPassCreationFailed(format!(
                "injected failure for {:?}",
                layout.label
            )));
        }
        let id = self.allocate_id();
        self.render_passes.insert(id, layout.clone());
        Ok(RenderPassHandle(id))
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor) -> BackendResult<FramebufferHandle> {
        let layout = self
            .render_passes
            .get(&desc.render_pass.0)
            .ok_or_else(|| BackendError::FramebufferCreationFailed("Render pass not found".into()))?;
        if layout.attachment_count() != desc.attachments.len() {
            return Err(BackendError::FramebufferCreationFailed(format!(
                "render pass expects {} attachments, got {}",
                layout.attachment_count(),
                desc.attachments.len()
            )));
        }
        let id = self.allocate_id();
        self.framebuffers.insert(id, desc.clone());
        Ok(FramebufferHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn destroy_texture(&mut self, texture: ImageHandle) {
        self.textures.remove(&texture.0);
        self.layers.retain(|(owner, _), _| *owner != texture.0);
        self.views.retain(|_, owner| *owner != texture);
    }

    fn destroy_texture_view(&mut self, view: ImageViewHandle) {
        self.views.remove(&view.0);
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

impl GraphicsContext for HeadlessBackend {
    fn supports_draw_indirect_count(&self) -> bool {
        self.capabilities.draw_indirect_count
    }

    fn bind_graphics_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.record(RecordedCommand::BindGraphicsPipeline(pipeline));
    }

    fn bind_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.record(RecordedCommand::BindComputePipeline(pipeline));
    }

    fn bind_descriptor_set(&mut self, index: u32, set: BindGroupHandle) {
        self.record(RecordedCommand::BindDescriptorSet { index, set });
    }

    fn bind_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        self.record(RecordedCommand::BindVertexBuffer { slot, buffer, offset });
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        self.record(RecordedCommand::BindIndexBuffer { buffer, offset, format });
    }

    fn push_constants(&mut self, stages: ShaderStageFlags, offset: u32, data: &[u8]) {
        self.record(RecordedCommand::PushConstants {
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    fn set_viewport(&mut self, _x: f32, _y: f32, width: f32, height: f32, _min_depth: f32, _max_depth: f32) {
        self.record(RecordedCommand::SetViewport { width, height });
    }

    fn set_scissor(&mut self, _x: u32, _y: u32, width: u32, height: u32) {
        self.record(RecordedCommand::SetScissor { width, height });
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.record(RecordedCommand::Draw { vertices, instances });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        self.record(RecordedCommand::DrawIndexed {
            indices,
            base_vertex,
            instances,
        });
    }

    fn draw_indexed_indirect(&mut self, buffer: BufferHandle, offset: u64, draw_count: u32, stride: u32) {
        self.record(RecordedCommand::DrawIndexedIndirect {
            buffer,
            offset,
            draw_count,
            stride,
        });
    }

    fn draw_indexed_indirect_count(&mut self, draw: &IndirectCountDraw) {
        self.record(RecordedCommand::DrawIndexedIndirectCount(*draw));
    }

    fn begin_render_pass(&mut self, render_pass: RenderPassHandle, framebuffer: FramebufferHandle) {
        if self.in_render_pass {
            log::warn!("HeadlessBackend: begin_render_pass inside an open render pass");
        }
        self.in_render_pass = true;
        self.record(RecordedCommand::BeginRenderPass {
            render_pass,
            framebuffer,
        });
    }

    fn end_render_pass(&mut self) {
        self.in_render_pass = false;
        self.record(RecordedCommand::EndRenderPass);
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.record(RecordedCommand::Dispatch { x, y, z });
    }

    fn fill_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64, value: u32) {
        if let Some(storage) = self.buffers.get_mut(&buffer.0) {
            let start = (offset as usize).min(storage.len());
            let end = (start + size as usize).min(storage.len());
            for (i, byte) in storage[start..end].iter_mut().enumerate() {
                *byte = value.to_le_bytes()[i % 4];
            }
        }
        self.record(RecordedCommand::FillBuffer {
            buffer,
            offset,
            size,
            value,
        });
    }

    fn buffer_barrier(&mut self, barrier: &BufferBarrier) {
        self.record(RecordedCommand::BufferBarrier(*barrier));
    }

    fn image_barrier(&mut self, barrier: &ImageBarrier) {
        self.record(RecordedCommand::ImageBarrier(*barrier));
    }

    fn global_barrier(&mut self) {
        self.record(RecordedCommand::GlobalBarrier);
    }

    fn wait_and_read_u32(&mut self, buffer: BufferHandle, offset: u64) -> BackendResult<u32> {
        let mut bytes = [0u8; 4];
        self.read_buffer(buffer, offset, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_buffer(backend: &mut HeadlessBackend, value: u32) -> BufferHandle {
        backend
            .create_buffer_init(
                &BufferDescriptor {
                    label: Some("count".into()),
                    size: 4,
                    usage: BufferUsage::STORAGE | BufferUsage::INDIRECT,
                    mapped_at_creation: false,
                },
                &value.to_le_bytes(),
            )
            .unwrap()
    }

    fn indirect_buffer(backend: &mut HeadlessBackend) -> BufferHandle {
        backend
            .create_buffer(&BufferDescriptor {
                label: Some("indirect".into()),
                size: 20 * 64,
                usage: BufferUsage::STORAGE | BufferUsage::INDIRECT,
                mapped_at_creation: false,
            })
            .unwrap()
    }

    #[test]
    fn test_fill_buffer_writes_repeated_value() {
        let mut backend = HeadlessBackend::new();
        let buffer = count_buffer(&mut backend, 7);
        backend.fill_buffer(buffer, 0, 4, 0);
        assert_eq!(backend.buffer_contents(buffer).unwrap(), &[0, 0, 0, 0]);
        assert_eq!(backend.wait_and_read_u32(buffer, 0).unwrap(), 0);
    }

    #[test]
    fn test_indirect_count_uses_hardware_path_when_supported() {
        let mut backend = HeadlessBackend::new();
        let count = count_buffer(&mut backend, 5);
        let indirect = indirect_buffer(&mut backend);
        let draw = IndirectCountDraw {
            buffer: indirect,
            offset: 0,
            count_buffer: count,
            count_offset: 0,
            max_draw_count: 64,
            stride: 20,
        };

        backend.draw_indexed_indirect_count_or_fallback(&draw);

        assert_eq!(
            backend.commands(),
            &[RecordedCommand::DrawIndexedIndirectCount(draw)]
        );
    }

    #[test]
    fn test_indirect_count_fallback_waits_and_clamps() {
        let mut backend = HeadlessBackend::without_draw_indirect_count();
        let count = count_buffer(&mut backend, 1000);
        let indirect = indirect_buffer(&mut backend);

        backend.draw_indexed_indirect_count_or_fallback(&IndirectCountDraw {
            buffer: indirect,
            offset: 40,
            count_buffer: count,
            count_offset: 0,
            max_draw_count: 64,
            stride: 20,
        });

        assert_eq!(
            backend.commands(),
            &[
                RecordedCommand::WaitIdle,
                RecordedCommand::DrawIndexedIndirect {
                    buffer: indirect,
                    offset: 40,
                    draw_count: 64,
                    stride: 20,
                },
            ]
        );
    }

    #[test]
    fn test_indirect_count_fallback_skips_empty_draw() {
        let mut backend = HeadlessBackend::without_draw_indirect_count();
        let count = count_buffer(&mut backend, 0);
        let indirect = indirect_buffer(&mut backend);

        backend.draw_indexed_indirect_count_or_fallback(&IndirectCountDraw {
            buffer: indirect,
            offset: 0,
            count_buffer: count,
            count_offset: 0,
            max_draw_count: 64,
            stride: 20,
        });

        assert_eq!(backend.commands(), &[RecordedCommand::WaitIdle]);
    }

    #[test]
    fn test_framebuffer_attachment_count_is_checked() {
        let mut backend = HeadlessBackend::new();
        let render_pass = backend
            .create_render_pass(&RenderPassLayout {
                label: None,
                color_attachments: vec![AttachmentLayout {
                    format: TextureFormat::Rgba8Unorm,
                    load_op: LoadOp::Clear([0.0; 4]),
                    store_op: StoreOp::Store,
                }],
                depth_attachment: None,
            })
            .unwrap();

        let result = backend.create_framebuffer(&FramebufferDescriptor {
            label: None,
            render_pass,
            attachments: vec![],
            width: 4,
            height: 4,
        });
        assert!(matches!(result, Err(BackendError::FramebufferCreationFailed(_))));
    }

    #[test]
    fn test_injected_buffer_failure() {
        let mut backend = HeadlessBackend::new();
        backend.set_failures(FailureInjection {
            buffers: true,
            ..Default::default()
        });
        let result = backend.create_buffer(&BufferDescriptor {
            label: None,
            size: 16,
            usage: BufferUsage::STORAGE,
            mapped_at_creation: false,
        });
        assert!(matches!(result, Err(BackendError::BufferCreationFailed(_))));
    }
}
