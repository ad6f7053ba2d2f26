//! Mesh data and mega-buffer packing

use crate::backend::*;
use glam::{Vec2, Vec3, Vec4};

/// A mesh with vertex and index data
#[derive(Debug, Clone)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl MeshData {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            name: name.to_string(),
        }
    }

    /// Object-space bounding sphere: xyz center, w radius
    pub fn bounding_sphere(&self) -> Vec4 {
        if self.vertices.is_empty() {
            return Vec4::ZERO;
        }
        let (min, max) = self.vertices.iter().fold(
            (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
            |(min, max), v| (min.min(v.position), max.max(v.position)),
        );
        let center = (min + max) * 0.5;
        let radius = self
            .vertices
            .iter()
            .map(|v| v.position.distance(center))
            .fold(0.0f32, f32::max);
        center.extend(radius)
    }

    /// Create a unit cube centered at origin
    pub fn cube() -> Self {
        let mut mesh = MeshData::new("cube");

        let faces = [
            (Vec3::Z, Vec3::X),
            (-Vec3::Z, -Vec3::X),
            (Vec3::X, -Vec3::Z),
            (-Vec3::X, Vec3::Z),
            (Vec3::Y, Vec3::X),
            (-Vec3::Y, Vec3::X),
        ];

        for (face, (normal, right)) in faces.into_iter().enumerate() {
            let up = normal.cross(right);
            let corners = [
                (-right - up, Vec2::new(0.0, 1.0)),
                (right - up, Vec2::new(1.0, 1.0)),
                (right + up, Vec2::new(1.0, 0.0)),
                (-right + up, Vec2::new(0.0, 0.0)),
            ];
            for (offset, uv) in corners {
                mesh.vertices.push(Vertex {
                    position: (normal + offset) * 0.5,
                    normal,
                    uv,
                    tangent: right.extend(1.0),
                });
            }

            let base = face as u32 * 4;
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        mesh
    }

    /// Create a plane on the XZ axis
    pub fn plane(size: f32, subdivisions: u32) -> Self {
        let mut mesh = MeshData::new("plane");
        let subdivisions = subdivisions.max(1);
        let half = size / 2.0;
        let step = size / subdivisions as f32;

        for z in 0..=subdivisions {
            for x in 0..=subdivisions {
                mesh.vertices.push(Vertex {
                    position: Vec3::new(-half + x as f32 * step, 0.0, -half + z as f32 * step),
                    normal: Vec3::Y,
                    uv: Vec2::new(x as f32, z as f32),
                    tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
                });
            }
        }

        for z in 0..subdivisions {
            for x in 0..subdivisions {
                let current = z * (subdivisions + 1) + x;
                let next = current + subdivisions + 1;
                mesh.indices.extend_from_slice(&[
                    current,
                    next,
                    current + 1,
                    current + 1,
                    next,
                    next + 1,
                ]);
            }
        }

        mesh
    }
}

/// Where a mesh landed inside the mega-buffers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshRange {
    pub block: u32,
    pub first_index: u32,
    pub index_count: u32,
    pub vertex_offset: i32,
    pub bounding_sphere: Vec4,
}

#[derive(Default)]
struct PendingBlock {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
}

/// Packs meshes into shared vertex/index buffers, opening a new block whenever the
/// current one would exceed its vertex budget
pub struct MegaBufferBuilder {
    max_vertices_per_block: u32,
    max_blocks: u32,
    blocks: Vec<PendingBlock>,
}

impl MegaBufferBuilder {
    pub fn new(max_vertices_per_block: u32, max_blocks: u32) -> Self {
        Self {
            max_vertices_per_block,
            max_blocks,
            blocks: Vec::new(),
        }
    }

    pub fn add_mesh(&mut self, mesh: &MeshData) -> BackendResult<MeshRange> {
        let vertex_count = mesh.vertices.len() as u32;
        if vertex_count > self.max_vertices_per_block {
            return Err(BackendError::InvalidParameter(format!(
                "mesh '{}' has {} vertices, block budget is {}",
                mesh.name, vertex_count, self.max_vertices_per_block
            )));
        }

        let fits = self.blocks.last().is_some_and(|b| {
            b.vertices.len() as u32 + vertex_count <= self.max_vertices_per_block
        });
        if !fits {
            if self.blocks.len() as u32 >= self.max_blocks {
                return Err(BackendError::InvalidParameter(format!(
                    "mega-buffer block limit of {} reached while adding '{}'",
                    self.max_blocks, mesh.name
                )));
            }
            self.blocks.push(PendingBlock::default());
        }

        let block = (self.blocks.len() - 1) as u32;
        let pending = &mut self.blocks[block as usize];
        let range = MeshRange {
            block,
            first_index: pending.indices.len() as u32,
            index_count: mesh.indices.len() as u32,
            vertex_offset: pending.vertices.len() as i32,
            bounding_sphere: mesh.bounding_sphere(),
        };
        pending.vertices.extend_from_slice(&mesh.vertices);
        pending.indices.extend_from_slice(&mesh.indices);
        Ok(range)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Upload every block
    pub fn build(self, device: &mut dyn Device) -> BackendResult<MegaBuffers> {
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for (index, pending) in self.blocks.into_iter().enumerate() {
            let vertex_buffer = device.create_buffer_init(
                &BufferDescriptor {
                    label: Some(format!("mega_vertices_{}", index)),
                    size: (pending.vertices.len() * std::mem::size_of::<Vertex>()) as u64,
                    usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
                    mapped_at_creation: false,
                },
                bytemuck::cast_slice(&pending.vertices),
            )?;
            let index_buffer = device.create_buffer_init(
                &BufferDescriptor {
                    label: Some(format!("mega_indices_{}", index)),
                    size: (pending.indices.len() * std::mem::size_of::<u32>()) as u64,
                    usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
                    mapped_at_creation: false,
                },
                bytemuck::cast_slice(&pending.indices),
            )?;
            log::debug!(
                "Mega-buffer block {}: {} vertices, {} indices",
                index,
                pending.vertices.len(),
                pending.indices.len()
            );
            blocks.push(GeometryBlock {
                vertex_buffer,
                index_buffer,
                index_count: pending.indices.len() as u32,
            });
        }
        Ok(MegaBuffers { blocks })
    }
}

/// Uploaded vertex and index buffers of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryBlock {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
}

/// GPU-resident mega-buffers
#[derive(Debug, Default)]
pub struct MegaBuffers {
    blocks: Vec<GeometryBlock>,
}

impl MegaBuffers {
    pub fn blocks(&self) -> &[GeometryBlock] {
        &self.blocks
    }

    pub fn destroy(&mut self, device: &mut dyn Device) {
        for block in self.blocks.drain(..) {
            device.destroy_buffer(block.vertex_buffer);
            device.destroy_buffer(block.index_buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Camera, CollectedDrawData, MaterialLayers};
    use glam::Mat4;

    #[test]
    fn test_cube_geometry() {
        let cube = MeshData::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        for v in &cube.vertices {
            assert_eq!(v.position.abs().max_element(), 0.5);
            // Counter-clockwise faces: the outward normal is the face normal
            assert!(v.position.dot(v.normal) > 0.0);
        }
        let sphere = cube.bounding_sphere();
        assert!(sphere.truncate().length() < 1e-6);
        assert!((sphere.w - 0.75f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_cube_winding_faces_outward() {
        let cube = MeshData::cube();
        for tri in cube.indices.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| cube.vertices[i as usize]);
            let face_normal = (b.position - a.position).cross(c.position - a.position);
            assert!(face_normal.dot(a.normal) > 0.0);
        }
    }

    #[test]
    fn test_blocks_split_on_vertex_budget() {
        let mut builder = MegaBufferBuilder::new(48, 4);
        let cube = MeshData::cube();
        let a = builder.add_mesh(&cube).unwrap();
        let b = builder.add_mesh(&cube).unwrap();
        let c = builder.add_mesh(&cube).unwrap();

        assert_eq!((a.block, a.vertex_offset, a.first_index), (0, 0, 0));
        assert_eq!((b.block, b.vertex_offset, b.first_index), (0, 24, 36));
        assert_eq!((c.block, c.vertex_offset), (1, 0));
        assert_eq!(builder.block_count(), 2);

        let mut device = HeadlessBackend::new();
        let geometry = builder.build(&mut device).unwrap();
        assert_eq!(geometry.blocks().len(), 2);
        assert_eq!(device.buffer_count(), 4);
    }

    #[test]
    fn test_block_limit_is_enforced() {
        let mut builder = MegaBufferBuilder::new(24, 1);
        let cube = MeshData::cube();
        builder.add_mesh(&cube).unwrap();
        assert!(builder.add_mesh(&cube).is_err());
    }

    #[test]
    fn test_finalize_groups_batches_by_block() {
        let mut builder = MegaBufferBuilder::new(24, 2);
        let cube = builder.add_mesh(&MeshData::cube()).unwrap();
        let plane = builder.add_mesh(&MeshData::plane(10.0, 1)).unwrap();
        assert_eq!(plane.block, 1);

        let mut device = HeadlessBackend::new();
        let geometry = builder.build(&mut device).unwrap();

        let mut data = CollectedDrawData::new(&Camera::default());
        data.push(&plane, Mat4::IDENTITY, MaterialLayers::default());
        data.push(&cube, Mat4::IDENTITY, MaterialLayers::default());
        data.push(&cube, Mat4::IDENTITY, MaterialLayers::default());
        let blocks = data.finalize(&geometry);

        assert_eq!(blocks.len(), 2);
        assert_eq!((blocks[0].first_batch, blocks[0].batch_count), (0, 2));
        assert_eq!((blocks[1].first_batch, blocks[1].batch_count), (2, 1));
        assert_eq!(data.batches[2].block_index, 1);
        // Batches still point at their own instances after sorting
        assert_eq!(data.batches[2].instance_index, 0);
    }
}
