//! Graph nodes and the contexts handed to their closures

use crate::backend::*;
use crate::render_graph::resource::*;

/// Closure that records a node's commands
pub type ExecuteFn = Box<dyn FnOnce(&mut PassContext)>;

/// An attachment a node renders into
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attachment {
    pub handle: TextureHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

/// One pass instance for the current frame
pub struct GraphNode {
    pub(crate) name: String,
    pub(crate) color_outputs: Vec<Attachment>,
    pub(crate) depth_output: Option<Attachment>,
    pub(crate) reads: Vec<TextureHandle>,
    pub(crate) compute_only: bool,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) execute: Option<ExecuteFn>,
    pub(crate) render_pass: Option<RenderPassHandle>,
    pub(crate) framebuffer: Option<FramebufferHandle>,
}

impl GraphNode {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            color_outputs: Vec::new(),
            depth_output: None,
            reads: Vec::new(),
            compute_only: false,
            width: 0,
            height: 0,
            execute: None,
            render_pass: None,
            framebuffer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn color_outputs(&self) -> &[Attachment] {
        &self.color_outputs
    }

    pub fn depth_output(&self) -> Option<&Attachment> {
        self.depth_output.as_ref()
    }

    pub fn reads(&self) -> &[TextureHandle] {
        &self.reads
    }

    pub fn is_compute_only(&self) -> bool {
        self.compute_only
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Color outputs in declaration order, then depth
    pub(crate) fn attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.color_outputs.iter().chain(self.depth_output.iter())
    }

    pub(crate) fn has_outputs(&self) -> bool {
        !self.color_outputs.is_empty() || self.depth_output.is_some()
    }

    pub(crate) fn has_invalid_output(&self) -> bool {
        self.attachments().any(|a| !a.handle.is_valid())
    }

    fn adopt_dimensions(&mut self, desc: &TextureDesc) {
        if self.width == 0 && self.height == 0 {
            self.width = desc.width;
            self.height = desc.height;
        }
    }
}

/// Builder handed to a node's setup closure
pub struct RenderGraphBuilder<'a> {
    pub(crate) node: &'a mut GraphNode,
    pub(crate) pool: &'a mut TransientResourcePool,
    pub(crate) device: &'a mut dyn Device,
}

impl<'a> RenderGraphBuilder<'a> {
    /// Acquire a color target cleared to transparent black and declare it as the next color output
    pub fn create_color(&mut self, label: &str, desc: TextureDesc) -> TextureHandle {
        let handle = self.acquire(label, &desc);
        self.write_color(handle, LoadOp::Clear([0.0; 4]));
        handle
    }

    /// Acquire a depth target cleared to 1.0 and declare it as the depth output
    pub fn create_depth(&mut self, label: &str, desc: TextureDesc) -> TextureHandle {
        let handle = self.acquire(label, &desc);
        self.write_depth(handle, LoadOp::Clear([1.0, 0.0, 0.0, 0.0]));
        handle
    }

    pub fn write_color(&mut self, handle: TextureHandle, load_op: LoadOp) {
        if let Some(desc) = self.pool.desc(handle) {
            let desc = *desc;
            self.node.adopt_dimensions(&desc);
        }
        self.node.color_outputs.push(Attachment {
            handle,
            load_op,
            store_op: StoreOp::Store,
        });
    }

    pub fn write_depth(&mut self, handle: TextureHandle, load_op: LoadOp) {
        if let Some(desc) = self.pool.desc(handle) {
            let desc = *desc;
            self.node.adopt_dimensions(&desc);
        }
        if self.node.depth_output.is_some() {
            log::warn!("Pass '{}' declared a second depth output", self.node.name);
        }
        self.node.depth_output = Some(Attachment {
            handle,
            load_op,
            store_op: StoreOp::Store,
        });
    }

    /// Record a read dependency; nothing is acquired
    pub fn read(&mut self, handle: TextureHandle) {
        self.node.reads.push(handle);
    }

    pub fn compute_only(&mut self) {
        self.node.compute_only = true;
    }

    pub fn set_dimensions(&mut self, width: u32, height: u32) {
        self.node.width = width;
        self.node.height = height;
    }

    pub fn view(&self, handle: TextureHandle) -> Option<ImageViewHandle> {
        self.pool.view(handle)
    }

    pub fn desc(&self, handle: TextureHandle) -> Option<TextureDesc> {
        self.pool.desc(handle).copied()
    }

    /// Device access for setup work such as building bind groups
    pub fn device(&mut self) -> &mut dyn Device {
        &mut *self.device
    }

    fn acquire(&mut self, label: &str, desc: &TextureDesc) -> TextureHandle {
        match self.pool.acquire_texture(&mut *self.device, desc) {
            Ok(handle) => {
                log::trace!(
                    "Pass '{}' acquired '{}' as transient {}",
                    self.node.name,
                    label,
                    handle.index()
                );
                handle
            }
            Err(e) => {
                log::error!(
                    "Pass '{}' failed to acquire '{}': {}",
                    self.node.name,
                    label,
                    e
                );
                TextureHandle::INVALID
            }
        }
    }
}

/// Context handed to a node's execute closure
pub struct PassContext<'a> {
    pub(crate) cmd: &'a mut dyn GraphicsContext,
    pub(crate) pool: &'a TransientResourcePool,
    pub(crate) name: &'a str,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) frame_index: u32,
}

impl<'a> PassContext<'a> {
    pub fn cmd(&mut self) -> &mut dyn GraphicsContext {
        &mut *self.cmd
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<ImageHandle> {
        self.pool.texture(handle)
    }

    pub fn view(&self, handle: TextureHandle) -> Option<ImageViewHandle> {
        self.pool.view(handle)
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Set viewport and scissor to cover the node's full extent
    pub fn set_full_viewport(&mut self) {
        let (width, height) = (self.width, self.height);
        self.cmd
            .set_viewport(0.0, 0.0, width as f32, height as f32, 0.0, 1.0);
        self.cmd.set_scissor(0, 0, width, height);
    }
}
