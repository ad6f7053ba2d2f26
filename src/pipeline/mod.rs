//! Deferred rendering pipeline
//!
//! Passes in frame order:
//! 1. Culling - compute frustum culling into indirect draw buffers
//! 2. Shadow - per-cascade culling and depth rendering
//! 3. G-Buffer - renders culled geometry to multiple render targets
//! 4. Lighting - fullscreen sun lighting with cascaded shadow lookups
//! 5. Skybox - fills far-plane pixels from an environment cubemap
//! 6. Tonemapping - HDR to the swapchain

pub mod cascade;
pub mod culling;
pub mod gbuffer_pass;
pub mod lighting_pass;
pub mod postprocess;
pub mod shadow;
pub mod skybox_pass;

pub use cascade::*;
pub use culling::{
    extract_frustum_planes, CullingDispatch, CullingPass, CullingPushConstants, CullingResources,
    IndirectTargets, CULLING_SHADER, CULLING_WORKGROUP_SIZE, FRUSTUM_STRIDE,
};
pub use gbuffer_pass::{GBufferOutputs, GBufferPass};
pub use lighting_pass::LightingPass;
pub use postprocess::{TonemapOperator, TonemappingPass};
pub use shadow::{ShadowFrame, ShadowPass, SHADOW_FORMAT};
pub use skybox_pass::{EnvironmentMap, SkyboxPass};

use crate::backend::{BackendError, BackendResult, BindGroupEntry, BindGroupHandle, Device};
use crate::resources::RingBuffer;
use crate::scene::{CameraUniformData, GpuSunData};
use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use std::collections::HashMap;
use std::hash::Hash;

/// Per-instance records shared by every shader that reads scene data
pub const SCENE_DATA_WGSL: &str = r#"
struct ObjectInstanceData {
    albedo_index: u32,
    normal_index: u32,
    metallic_roughness_index: u32,
    wvp_offset: u32,
    bounding_sphere: vec4<f32>,
}

struct ObjectMatrices {
    world: mat4x4<f32>,
    normal: mat4x4<f32>,
}

const WVP_STRIDE: u32 = 128u;
"#;

/// Layout of [`FrameUniforms`]
pub const FRAME_UNIFORMS_WGSL: &str = r#"
struct CameraUniforms {
    view: mat4x4<f32>,
    proj: mat4x4<f32>,
    view_proj: mat4x4<f32>,
    inv_view_proj: mat4x4<f32>,
    position: vec4<f32>,
    near_far: vec4<f32>,
}

struct SunData {
    // xyz = direction towards the sun, w = intensity
    direction_intensity: vec4<f32>,
    color: vec4<f32>,
}

struct CascadeData {
    view_proj: mat4x4<f32>,
    split_depth: f32,
}

struct FrameUniforms {
    camera: CameraUniforms,
    sun: SunData,
    cascades: array<CascadeData, 4>,
    // x = shadow map size, y = 1 / size, z = depth bias, w = ambient
    shadow_params: vec4<f32>,
}
"#;

/// Fullscreen triangle; `uv` has its origin at the top left
pub const FULLSCREEN_VERTEX_WGSL: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32) -> VertexOutput {
    var output: VertexOutput;

    // Generate fullscreen triangle (3 vertices)
    let x = f32((vertex_index << 1u) & 2u);
    let y = f32(vertex_index & 2u);
    output.position = vec4<f32>(x * 2.0 - 1.0, y * 2.0 - 1.0, 0.0, 1.0);
    output.uv = vec2<f32>(x, 1.0 - y);

    return output;
}
"#;

/// Everything the scene passes read from the per-frame uniform ring
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FrameUniforms {
    pub camera: CameraUniformData,
    pub sun: GpuSunData,
    pub cascades: [CascadeData; CASCADE_COUNT],
    pub shadow_params: Vec4,
}

impl FrameUniforms {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

/// Bind a frame's region of a ring buffer
pub(crate) fn region_binding(ring: &RingBuffer, frame_index: u32) -> BindGroupEntry {
    BindGroupEntry::Buffer {
        buffer: ring.buffer(),
        offset: ring.region_base(frame_index),
        size: Some(ring.region_capacity(frame_index)),
    }
}

/// Bind group cache for descriptor sets that reference transient textures.
///
/// The pool hands back the same views while descriptors stay stable, so lookups hit
/// every frame. When the views churn (resize) the cache fills up and is flushed.
pub struct BindGroupCache<K> {
    entries: HashMap<K, BindGroupHandle>,
    capacity: usize,
}

impl<K: Hash + Eq> BindGroupCache<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get_or_create<F>(
        &mut self,
        device: &mut dyn Device,
        key: K,
        create: F,
    ) -> BackendResult<BindGroupHandle>
    where
        F: FnOnce(&mut dyn Device) -> BackendResult<BindGroupHandle>,
    {
        if let Some(&bind_group) = self.entries.get(&key) {
            return Ok(bind_group);
        }
        if self.entries.len() >= self.capacity {
            log::debug!("Bind group cache full ({} entries), flushing", self.entries.len());
            self.clear(device);
        }
        let bind_group = create(device)?;
        self.entries.insert(key, bind_group);
        Ok(bind_group)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self, device: &mut dyn Device) {
        for (_, bind_group) in self.entries.drain() {
            device.destroy_bind_group(bind_group);
        }
    }
}

/// Parse and validate a WGSL module the way the GPU backend will see it
pub fn validate_wgsl(source: &str) -> BackendResult<naga::Module> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|err| BackendError::ShaderCreationFailed(err.emit_to_string(source)))?;

    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::PUSH_CONSTANT,
    )
    .validate(&module)
    .map_err(|err| BackendError::ShaderCreationFailed(err.into_inner().to_string()))?;

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    #[test]
    fn test_all_shaders_validate() {
        let shaders = [
            ("culling", CULLING_SHADER.to_string()),
            ("shadow", shadow::shadow_shader()),
            ("gbuffer", gbuffer_pass::gbuffer_shader()),
            ("lighting", lighting_pass::lighting_shader()),
            ("skybox", skybox_pass::skybox_shader()),
            ("tonemap", postprocess::tonemap_shader()),
        ];
        for (name, source) in shaders {
            if let Err(err) = validate_wgsl(&source) {
                panic!("{} shader failed validation: {}", name, err);
            }
        }
    }

    #[test]
    fn test_invalid_shader_rejected() {
        let result = validate_wgsl("@compute @workgroup_size(1) fn main() { let x: u32 = 1.0; }");
        assert!(matches!(result, Err(BackendError::ShaderCreationFailed(_))));
    }

    #[test]
    fn test_frame_uniform_layout() {
        // Camera 288, sun 32, four 80-byte cascades, params 16
        assert_eq!(FrameUniforms::SIZE, 288 + 32 + 320 + 16);
        assert_eq!(std::mem::size_of::<CascadeData>(), 80);
    }

    #[test]
    fn test_bind_group_cache_reuses_and_flushes() {
        let mut device = HeadlessBackend::new();
        let layout = device.create_bind_group_layout(&[]).unwrap();
        let mut cache = BindGroupCache::new(2);
        let mut created = 0;
        let mut make = |device: &mut dyn Device| {
            created += 1;
            device.create_bind_group(layout, &[])
        };

        let a = cache.get_or_create(&mut device, 1u32, &mut make).unwrap();
        let again = cache.get_or_create(&mut device, 1u32, &mut make).unwrap();
        assert_eq!(a, again);
        cache.get_or_create(&mut device, 2u32, &mut make).unwrap();
        assert_eq!(cache.len(), 2);

        // A third key flushes the full cache first
        cache.get_or_create(&mut device, 3u32, &mut make).unwrap();
        assert_eq!(cache.len(), 1);
        drop(make);
        assert_eq!(created, 3);
    }
}
