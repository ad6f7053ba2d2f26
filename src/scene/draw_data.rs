//! Per-frame draw data consumed by the culling and geometry passes

use crate::scene::camera::Camera;
use crate::scene::mesh::{MegaBuffers, MeshRange};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Per-instance data read by the culling shader and the geometry vertex shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct ObjectInstanceData {
    /// Layers in the material texture array
    pub albedo_index: u32,
    pub normal_index: u32,
    pub metallic_roughness_index: u32,
    /// Byte offset of this instance's [`ObjectMatrices`] in the WVP buffer
    pub wvp_offset: u32,
    /// Object-space bounding sphere: xyz center, w radius
    pub bounding_sphere: Vec4,
}

/// One indexed draw of one instance
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawBatch {
    pub index_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub instance_index: u32,
    /// Mega-buffer block holding this batch's geometry
    pub block_index: u32,
}

/// Standard indexed indirect draw arguments
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndexedIndirectCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

impl DrawIndexedIndirectCommand {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

/// Per-instance transforms
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ObjectMatrices {
    pub world: Mat4,
    /// Inverse-transpose of `world`
    pub normal: Mat4,
}

impl ObjectMatrices {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;

    pub fn new(world: Mat4) -> Self {
        Self {
            world,
            normal: world.inverse().transpose(),
        }
    }
}

/// View-projection plus its six planes.
///
/// Planes face inward, the opposite of the usual outward convention: a sphere is
/// culled when `dot(plane.xyz, center) + plane.w < -radius` for any plane.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FrustumData {
    pub view_proj: Mat4,
    /// Left, right, bottom, top, near, far
    pub planes: [Vec4; 6],
}

/// Material layers for one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialLayers {
    pub albedo: u32,
    pub normal: u32,
    pub metallic_roughness: u32,
}

impl Default for MaterialLayers {
    fn default() -> Self {
        use crate::resources::default_layers;
        Self {
            albedo: default_layers::WHITE,
            normal: default_layers::FLAT_NORMAL,
            metallic_roughness: default_layers::DIELECTRIC,
        }
    }
}

/// Mega-buffer block and the contiguous range of batches that draw from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MegaBufferBlock {
    pub vertex_buffer: crate::backend::BufferHandle,
    pub index_buffer: crate::backend::BufferHandle,
    pub first_batch: u32,
    pub batch_count: u32,
}

/// Everything the culling and shadow stages need for one frame
#[derive(Debug, Clone, Default)]
pub struct CollectedDrawData {
    pub instances: Vec<ObjectInstanceData>,
    pub batches: Vec<DrawBatch>,
    pub wvps: Vec<ObjectMatrices>,
    pub total_batches: u32,
    pub view_proj: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
    pub camera_position: Vec3,
}

impl CollectedDrawData {
    /// Empty collection for the given camera
    pub fn new(camera: &Camera) -> Self {
        let view = camera.view_matrix();
        let proj = camera.projection_matrix();
        Self {
            view_proj: proj * view,
            view,
            proj,
            camera_position: camera.position,
            ..Default::default()
        }
    }

    /// Add one instance of a mesh
    pub fn push(&mut self, mesh: &MeshRange, world: Mat4, material: MaterialLayers) {
        let instance_index = self.instances.len() as u32;
        let wvp_offset = self.wvps.len() as u32 * ObjectMatrices::SIZE;

        self.wvps.push(ObjectMatrices::new(world));
        self.instances.push(ObjectInstanceData {
            albedo_index: material.albedo,
            normal_index: material.normal,
            metallic_roughness_index: material.metallic_roughness,
            wvp_offset,
            bounding_sphere: mesh.bounding_sphere,
        });
        self.batches.push(DrawBatch {
            index_count: mesh.index_count,
            first_index: mesh.first_index,
            vertex_offset: mesh.vertex_offset,
            instance_index,
            block_index: mesh.block,
        });
        self.total_batches = self.batches.len() as u32;
    }

    /// Group batches by block and describe each block's batch range
    pub fn finalize(&mut self, geometry: &MegaBuffers) -> Vec<MegaBufferBlock> {
        self.batches.sort_by_key(|b| b.block_index);
        self.total_batches = self.batches.len() as u32;

        geometry
            .blocks()
            .iter()
            .enumerate()
            .map(|(index, block)| {
                let index = index as u32;
                let first_batch = self.batches.partition_point(|b| b.block_index < index) as u32;
                let end = self.batches.partition_point(|b| b.block_index <= index) as u32;
                MegaBufferBlock {
                    vertex_buffer: block.vertex_buffer,
                    index_buffer: block.index_buffer,
                    first_batch,
                    batch_count: end - first_batch,
                }
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_layouts() {
        assert_eq!(std::mem::size_of::<ObjectInstanceData>(), 32);
        assert_eq!(std::mem::size_of::<DrawBatch>(), 20);
        assert_eq!(DrawIndexedIndirectCommand::SIZE, 20);
        assert_eq!(std::mem::size_of::<FrustumData>(), 160);
        assert_eq!(ObjectMatrices::SIZE, 128);
    }

    #[test]
    fn test_push_links_batch_to_instance() {
        let mut data = CollectedDrawData::new(&Camera::default());
        let range = MeshRange {
            block: 0,
            first_index: 36,
            index_count: 6,
            vertex_offset: 24,
            bounding_sphere: Vec4::new(0.0, 0.0, 0.0, 1.0),
        };
        data.push(&range, Mat4::IDENTITY, MaterialLayers::default());
        data.push(&range, Mat4::from_translation(Vec3::X), MaterialLayers::default());

        assert_eq!(data.total_batches, 2);
        assert_eq!(data.batches[1].instance_index, 1);
        assert_eq!(data.instances[1].wvp_offset, ObjectMatrices::SIZE);
        assert_eq!(data.batches[1].first_index, 36);
    }
}
