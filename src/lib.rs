//! Deferred Renderer - A render graph-based deferred renderer with GPU-driven culling
//!
//! The renderer is written against two object-safe backend traits and ships with:
//! - **wgpu**: real rendering into a winit surface (feature `wgpu-backend`, on by default)
//! - **headless**: a recording backend used by the tests
//!
//! # Features
//! - Render graph with transient texture pooling and cached render passes
//! - Compute-shader frustum culling that feeds indirect draws
//! - Cascaded shadow maps with texel snapping
//! - G-buffer, lighting, skybox and tonemapping passes
//! - Per-frame ring buffers for N frames in flight
//! - Threaded texture decoding and upload

pub mod backend;
pub mod context;
pub mod pipeline;
pub mod render_graph;
pub mod renderer;
pub mod resources;
pub mod scene;

pub use backend::{BackendError, BackendResult, Device, GraphicsContext, HeadlessBackend};
pub use context::{EngineContext, FrameClock};
pub use pipeline::postprocess::TonemapOperator;
pub use renderer::{DeferredRenderer, FrameInput, SwapchainTarget};

#[cfg(feature = "wgpu-backend")]
pub use backend::wgpu_backend::WgpuBackend;

/// Configuration for initializing the renderer
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Window title
    pub title: String,
    /// Initial surface width
    pub width: u32,
    /// Initial surface height
    pub height: u32,
    /// Enable vsync
    pub vsync: bool,
    /// Frames the CPU may record ahead of the GPU; one ring buffer region each
    pub frames_in_flight: u32,
    /// Sub-allocation alignment of every ring buffer (power of two)
    pub ring_alignment: u64,
    pub max_instances: u32,
    pub max_batches: u32,
    /// Indirect command slots reserved for each mega-buffer block
    pub max_batches_per_block: u32,
    pub max_mega_buffer_blocks: u32,
    pub max_vertices_per_block: u32,
    /// Edge length of every shadow cascade
    pub shadow_map_size: u32,
    /// Blend between uniform (0) and logarithmic (1) cascade splits
    pub cascade_split_lambda: f32,
    /// Upper bound on texture decode workers
    pub max_concurrent_uploads: usize,
    /// Edge length of every layer in the material texture array
    pub material_layer_size: u32,
    pub max_material_layers: u32,
    pub exposure: f32,
    pub tonemap_operator: TonemapOperator,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            title: "Deferred Renderer".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            frames_in_flight: 3,
            ring_alignment: 256,
            max_instances: 4096,
            max_batches: 4096,
            max_batches_per_block: 4096,
            max_mega_buffer_blocks: 4,
            max_vertices_per_block: 1 << 20,
            shadow_map_size: 2048,
            cascade_split_lambda: 0.7,
            max_concurrent_uploads: 4,
            material_layer_size: 512,
            max_material_layers: 64,
            exposure: 1.0,
            tonemap_operator: TonemapOperator::Aces,
        }
    }
}

impl RendererConfig {
    /// Reject values the renderer cannot be built with
    pub fn validate(&self) -> BackendResult<()> {
        if self.frames_in_flight == 0 {
            return Err(BackendError::InvalidParameter(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }
        if !self.ring_alignment.is_power_of_two() {
            return Err(BackendError::InvalidParameter(format!(
                "ring_alignment must be a power of 2, got {}",
                self.ring_alignment
            )));
        }
        if self.max_batches_per_block == 0 {
            return Err(BackendError::InvalidParameter(
                "max_batches_per_block must be at least 1".to_string(),
            ));
        }
        if self.max_mega_buffer_blocks == 0 {
            return Err(BackendError::InvalidParameter(
                "max_mega_buffer_blocks must be at least 1".to_string(),
            ));
        }
        if self.max_instances == 0 || self.max_batches == 0 {
            return Err(BackendError::InvalidParameter(
                "max_instances and max_batches must be at least 1".to_string(),
            ));
        }
        if self.shadow_map_size == 0 || self.material_layer_size == 0 {
            return Err(BackendError::InvalidParameter(
                "shadow_map_size and material_layer_size must be non-zero".to_string(),
            ));
        }
        if self.max_material_layers < resources::default_layers::COUNT {
            return Err(BackendError::InvalidParameter(format!(
                "max_material_layers must leave room for the {} default layers",
                resources::default_layers::COUNT
            )));
        }
        if !(0.0..=1.0).contains(&self.cascade_split_lambda) {
            return Err(BackendError::InvalidParameter(format!(
                "cascade_split_lambda must be in [0, 1], got {}",
                self.cascade_split_lambda
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.shadow_map_size, 2048);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RendererConfig {
            frames_in_flight: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BackendError::InvalidParameter(_))));

        let config = RendererConfig {
            ring_alignment: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RendererConfig {
            max_batches_per_block: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RendererConfig {
            max_mega_buffer_blocks: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
