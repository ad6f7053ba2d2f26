//! Render graph: per-frame node list with cached render passes and framebuffers

use crate::backend::*;
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;
use std::collections::HashMap;

struct CachedRenderPass {
    handle: RenderPassHandle,
    layout: RenderPassLayout,
}

struct CachedFramebuffer {
    handle: FramebufferHandle,
    render_pass: RenderPassHandle,
    attachments: Vec<ImageViewHandle>,
    width: u32,
    height: u32,
}

/// Frame-scoped pass graph.
///
/// Nodes run in the order they were added. Every graphics node is preceded by a global
/// barrier, so a node always observes the writes of every node added before it.
pub struct RenderGraph {
    nodes: Vec<GraphNode>,
    pool: TransientResourcePool,
    frame_index: u32,
    compiled: bool,
    render_passes: HashMap<String, CachedRenderPass>,
    framebuffers: HashMap<(String, u32), CachedFramebuffer>,
}

impl RenderGraph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            pool: TransientResourcePool::new(),
            frame_index: 0,
            compiled: false,
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
        }
    }

    /// Start building a new frame
    pub fn reset(&mut self, frame_index: u32) {
        self.nodes.clear();
        self.pool.begin_frame();
        self.frame_index = frame_index;
        self.compiled = false;
    }

    /// Add a node. `setup` declares outputs and reads, `execute` records commands.
    pub fn add_node<S, E>(&mut self, device: &mut dyn Device, name: &str, setup: S, execute: E)
    where
        S: FnOnce(&mut RenderGraphBuilder),
        E: FnOnce(&mut PassContext) + 'static,
    {
        if self.nodes.iter().any(|n| n.name == name) {
            log::warn!("Render graph already has a node named '{}' this frame", name);
        }

        let mut node = GraphNode::new(name);
        {
            let mut builder = RenderGraphBuilder {
                node: &mut node,
                pool: &mut self.pool,
                device,
            };
            setup(&mut builder);
        }
        node.execute = Some(Box::new(execute));

        if !node.compute_only {
            node.render_pass = self.render_passes.get(name).map(|rp| rp.handle);
        }

        self.nodes.push(node);
    }

    /// Register an externally owned texture for this frame
    pub fn import_texture(
        &mut self,
        texture: ImageHandle,
        view: ImageViewHandle,
        desc: TextureDesc,
    ) -> TextureHandle {
        self.pool.import_texture(texture, view, desc)
    }

    /// Resolve render passes and framebuffers for every graphics node
    pub fn compile(&mut self, device: &mut dyn Device) -> BackendResult<()> {
        for node in &mut self.nodes {
            if node.compute_only || !node.has_outputs() || node.has_invalid_output() {
                continue;
            }

            let Some(layout) = Self::render_pass_layout(&self.pool, node) else {
                continue;
            };

            let cached = self
                .render_passes
                .get(&node.name)
                .filter(|rp| rp.layout == layout)
                .map(|rp| rp.handle);
            let render_pass = match cached {
                Some(handle) => handle,
                None => {
                    if let Some(stale) = self.render_passes.remove(&node.name) {
                        log::debug!("Render pass '{}' layout changed, rebuilding", node.name);
                        device.destroy_render_pass(stale.handle);
                    }
                    let handle = device.create_render_pass(&layout).map_err(|e| {
                        log::error!("Failed to create render pass '{}': {}", node.name, e);
                        e
                    })?;
                    log::debug!("Created render pass '{}'", node.name);
                    self.render_passes.insert(
                        node.name.clone(),
                        CachedRenderPass {
                            handle,
                            layout: layout.clone(),
                        },
                    );
                    handle
                }
            };
            node.render_pass = Some(render_pass);

            let views: Vec<ImageViewHandle> = node
                .attachments()
                .filter_map(|a| self.pool.view(a.handle))
                .collect();
            let key = (node.name.clone(), self.frame_index);
            let reusable = self.framebuffers.get(&key).is_some_and(|fb| {
                fb.render_pass == render_pass
                    && fb.attachments == views
                    && fb.width == node.width
                    && fb.height == node.height
            });

            if !reusable {
                if let Some(stale) = self.framebuffers.remove(&key) {
                    device.destroy_framebuffer(stale.handle);
                }
                let handle = device
                    .create_framebuffer(&FramebufferDescriptor {
                        label: Some(format!("{}_{}", node.name, self.frame_index)),
                        render_pass,
                        attachments: views.clone(),
                        width: node.width,
                        height: node.height,
                    })
                    .map_err(|e| {
                        log::error!("Failed to create framebuffer '{}': {}", node.name, e);
                        e
                    })?;
                log::debug!(
                    "Created framebuffer '{}' for frame {} ({}x{})",
                    node.name,
                    self.frame_index,
                    node.width,
                    node.height
                );
                self.framebuffers.insert(
                    key.clone(),
                    CachedFramebuffer {
                        handle,
                        render_pass,
                        attachments: views,
                        width: node.width,
                        height: node.height,
                    },
                );
            }
            node.framebuffer = self.framebuffers.get(&key).map(|fb| fb.handle);
        }

        self.compiled = true;
        Ok(())
    }

    /// Run every node in insertion order, then advance the pool's frame counter
    pub fn execute(&mut self, context: &mut dyn GraphicsContext) {
        if !self.compiled {
            log::warn!("Executing a render graph that was not compiled this frame");
        }

        for node in &mut self.nodes {
            let Some(execute) = node.execute.take() else {
                continue;
            };

            if node.compute_only {
                let mut ctx = PassContext {
                    cmd: &mut *context,
                    pool: &self.pool,
                    name: &node.name,
                    width: node.width,
                    height: node.height,
                    frame_index: self.frame_index,
                };
                execute(&mut ctx);
                continue;
            }

            if !node.has_outputs() {
                log::trace!("Pass '{}' declared no outputs, skipping", node.name);
                continue;
            }
            if node.has_invalid_output() {
                log::warn!("Pass '{}' has an invalid output, skipping", node.name);
                continue;
            }
            let (Some(render_pass), Some(framebuffer)) = (node.render_pass, node.framebuffer) else {
                log::warn!("Pass '{}' has no compiled render pass, skipping", node.name);
                continue;
            };

            context.global_barrier();
            context.begin_render_pass(render_pass, framebuffer);
            {
                let mut ctx = PassContext {
                    cmd: &mut *context,
                    pool: &self.pool,
                    name: &node.name,
                    width: node.width,
                    height: node.height,
                    frame_index: self.frame_index,
                };
                execute(&mut ctx);
            }
            context.end_render_pass();
        }

        self.pool.end_frame();
    }

    /// Drop cached render passes and framebuffers, e.g. after a resize
    pub fn invalidate(&mut self, device: &mut dyn Device) {
        for (_, fb) in self.framebuffers.drain() {
            device.destroy_framebuffer(fb.handle);
        }
        for (_, rp) in self.render_passes.drain() {
            device.destroy_render_pass(rp.handle);
        }
        for node in &mut self.nodes {
            node.render_pass = None;
            node.framebuffer = None;
        }
        self.compiled = false;
    }

    /// Release every backend object the graph owns
    pub fn destroy(&mut self, device: &mut dyn Device) {
        self.invalidate(device);
        self.nodes.clear();
        self.pool.clear(device);
    }

    pub fn pool(&self) -> &TransientResourcePool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut TransientResourcePool {
        &mut self.pool
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    pub fn cached_render_pass_count(&self) -> usize {
        self.render_passes.len()
    }

    pub fn cached_framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    fn render_pass_layout(pool: &TransientResourcePool, node: &GraphNode) -> Option<RenderPassLayout> {
        let attachment = |a: &Attachment| {
            pool.desc(a.handle).map(|desc| AttachmentLayout {
                format: desc.format,
                load_op: a.load_op,
                store_op: a.store_op,
            })
        };

        let color_attachments = node
            .color_outputs
            .iter()
            .map(attachment)
            .collect::<Option<Vec<_>>>()?;
        let depth_attachment = match &node.depth_output {
            Some(depth) => Some(attachment(depth)?),
            None => None,
        };

        Some(RenderPassLayout {
            label: Some(node.name.clone()),
            color_attachments,
            depth_attachment,
        })
    }
}

impl Default for RenderGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn color_desc() -> TextureDesc {
        TextureDesc::render_target(TextureFormat::Rgba16Float, 64, 32)
    }

    fn add_color_node(
        graph: &mut RenderGraph,
        device: &mut HeadlessBackend,
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> TextureHandle {
        let mut output = TextureHandle::INVALID;
        let log = Arc::clone(log);
        graph.add_node(
            device,
            name,
            |builder| output = builder.create_color(name, color_desc()),
            move |_| log.lock().push(name),
        );
        output
    }

    #[test]
    fn test_nodes_execute_in_insertion_order() {
        let mut device = HeadlessBackend::new();
        let mut graph = RenderGraph::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        graph.reset(0);

        // Culling is compute-only and reads what Lighting writes; order must not change
        {
            let order = Arc::clone(&order);
            graph.add_node(
                &mut device,
                "Culling",
                |builder| builder.compute_only(),
                move |_| order.lock().push("Culling"),
            );
        }
        let gbuffer = add_color_node(&mut graph, &mut device, "GBuffer", &order);
        let lighting = add_color_node(&mut graph, &mut device, "Lighting", &order);
        {
            let order = Arc::clone(&order);
            graph.add_node(
                &mut device,
                "Tonemap",
                |builder| {
                    builder.read(lighting);
                    builder.read(gbuffer);
                    builder.create_color("ldr", color_desc());
                },
                move |_| order.lock().push("Tonemap"),
            );
        }

        graph.compile(&mut device).unwrap();
        graph.execute(&mut device);

        assert_eq!(
            *order.lock(),
            vec!["Culling", "GBuffer", "Lighting", "Tonemap"]
        );
    }

    #[test]
    fn test_graphics_nodes_wrapped_in_barrier_and_render_pass() {
        let mut device = HeadlessBackend::new();
        let mut graph = RenderGraph::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        graph.reset(0);
        add_color_node(&mut graph, &mut device, "GBuffer", &log);
        graph.compile(&mut device).unwrap();
        device.take_commands();
        graph.execute(&mut device);

        let commands = device.take_commands();
        assert!(matches!(commands[0], RecordedCommand::GlobalBarrier));
        assert!(matches!(commands[1], RecordedCommand::BeginRenderPass { .. }));
        assert!(matches!(commands[2], RecordedCommand::EndRenderPass));
        assert_eq!(graph.pool().current_frame(), 1);
    }

    #[test]
    fn test_render_pass_cached_across_frames() {
        let mut device = HeadlessBackend::new();
        let mut graph = RenderGraph::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for frame in 0..6u32 {
            graph.reset(frame % 3);
            add_color_node(&mut graph, &mut device, "GBuffer", &log);
            graph.compile(&mut device).unwrap();
            graph.execute(&mut device);
        }

        assert_eq!(graph.cached_render_pass_count(), 1);
        assert_eq!(device.render_pass_count(), 1);
        assert_eq!(graph.cached_framebuffer_count(), 3);
        assert_eq!(device.framebuffer_count(), 3);
        assert_eq!(log.lock().len(), 6);
    }

    #[test]
    fn test_layout_change_rebuilds_render_pass() {
        let mut device = HeadlessBackend::new();
        let mut graph = RenderGraph::new();

        graph.reset(0);
        graph.add_node(
            &mut device,
            "Pass",
            |builder| {
                builder.create_color("a", color_desc());
            },
            |_| {},
        );
        graph.compile(&mut device).unwrap();
        graph.execute(&mut device);

        graph.reset(0);
        graph.add_node(
            &mut device,
            "Pass",
            |builder| {
                builder.create_color(
                    "a",
                    TextureDesc::render_target(TextureFormat::Rgba8Unorm, 64, 32),
                );
            },
            |_| {},
        );
        graph.compile(&mut device).unwrap();

        assert_eq!(device.render_pass_count(), 1);
        let rp = graph.nodes()[0].render_pass.unwrap();
        let layout = device.render_pass_layout(rp).unwrap();
        assert_eq!(layout.color_attachments[0].format, TextureFormat::Rgba8Unorm);
    }

    #[test]
    fn test_framebuffer_rebuilt_when_imported_view_changes() {
        let mut device = HeadlessBackend::new();
        let mut graph = RenderGraph::new();
        let desc = color_desc();
        let mut views = Vec::new();
        for _ in 0..2 {
            let texture = device.create_texture(&TextureDescriptor::default()).unwrap();
            views.push((
                texture,
                device
                    .create_texture_view(texture, &TextureViewDescriptor::default())
                    .unwrap(),
            ));
        }

        for (texture, view) in &views {
            graph.reset(0);
            let target = graph.import_texture(*texture, *view, desc);
            graph.add_node(
                &mut device,
                "Present",
                |builder| builder.write_color(target, LoadOp::Load),
                |_| {},
            );
            graph.compile(&mut device).unwrap();
            let fb = graph.nodes()[0].framebuffer.unwrap();
            assert_eq!(device.framebuffer(fb).unwrap().attachments, vec![*view]);
            graph.execute(&mut device);
        }

        assert_eq!(device.framebuffer_count(), 1);
    }

    #[test]
    fn test_node_with_invalid_output_is_skipped() {
        let mut device = HeadlessBackend::new();
        let mut graph = RenderGraph::new();
        let ran = Arc::new(Mutex::new(false));
        graph.reset(0);
        {
            let ran = Arc::clone(&ran);
            graph.add_node(
                &mut device,
                "Broken",
                |builder| builder.write_color(TextureHandle::INVALID, LoadOp::Load),
                move |_| *ran.lock() = true,
            );
        }
        graph.compile(&mut device).unwrap();
        graph.execute(&mut device);

        assert!(!*ran.lock());
        assert_eq!(device.render_pass_count(), 0);
    }

    #[test]
    fn test_texture_creation_failure_yields_invalid_handle() {
        let mut device = HeadlessBackend::new();
        device.set_failures(FailureInjection {
            textures: true,
            ..Default::default()
        });
        let mut graph = RenderGraph::new();
        graph.reset(0);
        let mut output = TextureHandle::default();
        graph.add_node(
            &mut device,
            "GBuffer",
            |builder| output = builder.create_color("albedo", color_desc()),
            |_| {},
        );
        assert!(!output.is_valid());
        assert!(graph.compile(&mut device).is_ok());
    }

    #[test]
    fn test_invalidate_releases_cached_objects() {
        let mut device = HeadlessBackend::new();
        let mut graph = RenderGraph::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        graph.reset(0);
        add_color_node(&mut graph, &mut device, "GBuffer", &log);
        graph.compile(&mut device).unwrap();
        graph.execute(&mut device);

        graph.invalidate(&mut device);
        assert_eq!(device.render_pass_count(), 0);
        assert_eq!(device.framebuffer_count(), 0);

        graph.destroy(&mut device);
        assert_eq!(device.texture_count(), 0);
    }

    #[test]
    fn test_render_pass_creation_failure_propagates() {
        let mut device = HeadlessBackend::new();
        let mut graph = RenderGraph::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        graph.reset(0);
        add_color_node(&mut graph, &mut device, "GBuffer", &log);
        device.set_failures(FailureInjection {
            render_passes: true,
            ..Default::default()
        });
        assert!(matches!(
            graph.compile(&mut device),
            Err(BackendError::RenderPassCreationFailed(_))
        ));
    }
}
