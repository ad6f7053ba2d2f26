//! GPU frustum culling
//!
//! A compute shader tests every draw batch's bounding sphere against six frustum
//! planes and appends the survivors to an indirect command buffer. Commands are
//! compacted per mega-buffer block: visible batch `b` of block `k` lands in slot
//! `k * max_batches_per_block + atomicAdd(count[k])`, so each block can be drawn
//! with one indirect-count call.
//!
//! The count buffer is not ring-buffered. It is cleared by a fill at the start of
//! every dispatch and the GPU orders fill, dispatch and draws through barriers.

use crate::backend::*;
use crate::pipeline::region_binding;
use crate::resources::{align_up, RingBuffer};
use crate::scene::{
    CollectedDrawData, DrawBatch, DrawIndexedIndirectCommand, FrustumData, MegaBufferBlock,
    ObjectInstanceData, ObjectMatrices,
};
use crate::RendererConfig;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use std::borrow::Cow;

pub const CULLING_WORKGROUP_SIZE: u32 = 256;

/// Distance between frustum records in the frustum ring
pub const FRUSTUM_STRIDE: u64 = 256;

/// Frustum records the main pass reserves per frame
const MAIN_FRUSTUM_SLOTS: u64 = 2;

pub const CULLING_SHADER: &str = r#"
struct ObjectInstanceData {
    albedo_index: u32,
    normal_index: u32,
    metallic_roughness_index: u32,
    wvp_offset: u32,
    bounding_sphere: vec4<f32>,
}

struct DrawBatch {
    index_count: u32,
    first_index: u32,
    vertex_offset: i32,
    instance_index: u32,
    block_index: u32,
}

struct ObjectMatrices {
    world: mat4x4<f32>,
    normal: mat4x4<f32>,
}

struct FrustumData {
    view_proj: mat4x4<f32>,
    @size(192) planes: array<vec4<f32>, 6>,
}

struct DrawIndexedIndirectCommand {
    index_count: u32,
    instance_count: u32,
    first_index: u32,
    base_vertex: i32,
    first_instance: u32,
}

struct CullingParams {
    total_batches: u32,
    wvp_stride: u32,
    frustum_offset: u32,
    frustum_stride: u32,
    max_batches_per_block: u32,
}

@group(0) @binding(0) var<storage, read> instances: array<ObjectInstanceData>;
@group(0) @binding(1) var<storage, read> batches: array<DrawBatch>;
@group(0) @binding(2) var<storage, read> matrices: array<ObjectMatrices>;
@group(0) @binding(3) var<storage, read> frustums: array<FrustumData>;
@group(0) @binding(4) var<storage, read_write> commands: array<DrawIndexedIndirectCommand>;
@group(0) @binding(5) var<storage, read_write> counts: array<atomic<u32>>;

var<push_constant> params: CullingParams;

@compute @workgroup_size(256)
fn cs_main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let batch_index = gid.x;
    if (batch_index >= params.total_batches) {
        return;
    }

    let batch = batches[batch_index];
    let instance = instances[batch.instance_index];
    let world = matrices[instance.wvp_offset / params.wvp_stride].world;
    let frustum_index = params.frustum_offset / params.frustum_stride;

    let center = (world * vec4<f32>(instance.bounding_sphere.xyz, 1.0)).xyz;
    let scale = max(length(world[0].xyz), max(length(world[1].xyz), length(world[2].xyz)));
    let radius = instance.bounding_sphere.w * scale;

    for (var i = 0u; i < 6u; i = i + 1u) {
        let plane = frustums[frustum_index].planes[i];
        if (dot(plane.xyz, center) + plane.w < -radius) {
            return;
        }
    }

    let slot = atomicAdd(&counts[batch.block_index], 1u);
    if (slot >= params.max_batches_per_block) {
        return;
    }

    var command: DrawIndexedIndirectCommand;
    command.index_count = batch.index_count;
    command.instance_count = 1u;
    command.first_index = batch.first_index;
    command.base_vertex = batch.vertex_offset;
    command.first_instance = batch.instance_index;
    commands[batch.block_index * params.max_batches_per_block + slot] = command;
}
"#;

/// Push constants of the culling shader
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CullingPushConstants {
    pub total_batches: u32,
    /// Byte stride of one [`ObjectMatrices`] record
    pub wvp_stride: u32,
    /// Byte offset of the frustum record, relative to the frame's region base
    pub frustum_offset: u32,
    pub frustum_stride: u32,
    pub max_batches_per_block: u32,
}

impl CullingPushConstants {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;

    pub fn new(total_batches: u32, frustum_offset: u32, max_batches_per_block: u32) -> Self {
        Self {
            total_batches,
            wvp_stride: ObjectMatrices::SIZE,
            frustum_offset,
            frustum_stride: FRUSTUM_STRIDE as u32,
            max_batches_per_block,
        }
    }
}

/// Extract the six normalized frustum planes of a view-projection with [0, 1] clip depth.
///
/// Order is left, right, bottom, top, near, far. A point `p` is inside a plane when
/// `dot(plane.xyz, p) + plane.w >= 0`.
pub fn extract_frustum_planes(view_proj: Mat4) -> [Vec4; 6] {
    let r0 = view_proj.row(0);
    let r1 = view_proj.row(1);
    let r2 = view_proj.row(2);
    let r3 = view_proj.row(3);

    [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|plane| {
        let length = plane.truncate().length();
        if length > f32::EPSILON {
            plane / length
        } else {
            plane
        }
    })
}

/// Ring with one aligned region of `bytes_per_frame` per frame in flight
pub(crate) fn frame_ring(
    device: &mut dyn Device,
    label: &str,
    bytes_per_frame: u64,
    alignment: u64,
    frames_in_flight: u32,
    usage: BufferUsage,
) -> BackendResult<RingBuffer> {
    let per_frame = align_up(bytes_per_frame.max(1), alignment);
    RingBuffer::new(
        device,
        label,
        per_frame * u64::from(frames_in_flight),
        alignment,
        frames_in_flight,
        usage,
    )
}

/// Where the culled commands of one dispatch live, for the draws that consume them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectTargets {
    pub indirect_buffer: BufferHandle,
    /// Start of this frame's command region
    pub indirect_base: u64,
    pub count_buffer: BufferHandle,
    pub max_batches_per_block: u32,
    /// Blocks with a counter and a command range; later blocks are never drawn
    pub max_blocks: u32,
}

impl IndirectTargets {
    /// Indirect-count draw covering block `block_index`
    pub fn draw_for_block(&self, block_index: u32, block: &MegaBufferBlock) -> IndirectCountDraw {
        IndirectCountDraw {
            buffer: self.indirect_buffer,
            offset: self.indirect_base
                + u64::from(block_index)
                    * u64::from(self.max_batches_per_block)
                    * DrawIndexedIndirectCommand::SIZE,
            count_buffer: self.count_buffer,
            count_offset: u64::from(block_index) * 4,
            max_draw_count: block.batch_count.min(self.max_batches_per_block),
            stride: DrawIndexedIndirectCommand::SIZE as u32,
        }
    }

    /// Bind one block's geometry and draw whatever survived culling
    pub fn draw_blocks(&self, cmd: &mut dyn GraphicsContext, blocks: &[MegaBufferBlock]) {
        if blocks.len() > self.max_blocks as usize {
            log::warn!(
                "{} mega-buffer blocks exceed the budget of {}, skipping the rest",
                blocks.len(),
                self.max_blocks
            );
        }
        for (index, block) in blocks.iter().take(self.max_blocks as usize).enumerate() {
            if block.batch_count == 0 {
                continue;
            }
            cmd.bind_vertex_buffer(0, block.vertex_buffer, 0);
            cmd.bind_index_buffer(block.index_buffer, 0, IndexFormat::Uint32);
            cmd.draw_indexed_indirect_count_or_fallback(&self.draw_for_block(index as u32, block));
        }
    }
}

/// Everything needed to record one culling dispatch. Plain data, so it can be moved
/// into a render graph closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CullingDispatch {
    pub pipeline: ComputePipelineHandle,
    pub bind_group: BindGroupHandle,
    pub push_constants: CullingPushConstants,
    pub group_count: u32,
    pub targets: IndirectTargets,
    pub indirect_size: u64,
    pub count_size: u64,
}

impl CullingDispatch {
    /// Clear the counters, cull, and make the results visible to indirect draws
    pub fn record(&self, cmd: &mut dyn GraphicsContext) {
        let targets = &self.targets;

        cmd.fill_buffer(targets.count_buffer, 0, self.count_size, 0);
        cmd.buffer_barrier(&BufferBarrier {
            buffer: targets.count_buffer,
            offset: 0,
            size: Some(self.count_size),
            src_access: AccessFlags::TRANSFER_WRITE,
            dst_access: AccessFlags::SHADER_READ_WRITE,
        });

        cmd.bind_compute_pipeline(self.pipeline);
        cmd.bind_descriptor_set(0, self.bind_group);
        cmd.push_constants(
            ShaderStageFlags::COMPUTE,
            0,
            bytemuck::bytes_of(&self.push_constants),
        );
        cmd.dispatch(self.group_count, 1, 1);

        cmd.buffer_barrier(&BufferBarrier {
            buffer: targets.indirect_buffer,
            offset: targets.indirect_base,
            size: Some(self.indirect_size),
            src_access: AccessFlags::SHADER_WRITE,
            dst_access: AccessFlags::INDIRECT_COMMAND_READ,
        });
        cmd.buffer_barrier(&BufferBarrier {
            buffer: targets.count_buffer,
            offset: 0,
            size: Some(self.count_size),
            src_access: AccessFlags::SHADER_WRITE,
            dst_access: AccessFlags::INDIRECT_COMMAND_READ,
        });
    }
}

/// Non-owning view of the culling inputs shared with other culling users
#[derive(Clone, Copy)]
pub struct CullingResources<'a> {
    pub pipeline: ComputePipelineHandle,
    pub bind_group_layout: BindGroupLayoutHandle,
    pub instances: &'a RingBuffer,
    pub batches: &'a RingBuffer,
    pub matrices: &'a RingBuffer,
    pub alignment: u64,
    pub max_batches: u32,
    pub max_batches_per_block: u32,
    pub max_blocks: u32,
}

impl<'a> CullingResources<'a> {
    fn frames_in_flight(&self) -> u32 {
        self.instances.frames_in_flight()
    }
}

/// Output side of a culling user: indirect commands, counters and one descriptor
/// set per frame in flight
pub(crate) struct CullingTarget {
    indirect: RingBuffer,
    count_buffer: BufferHandle,
    count_size: u64,
    max_batches_per_block: u32,
    max_blocks: u32,
    bind_groups: Vec<BindGroupHandle>,
}

impl CullingTarget {
    pub(crate) fn new(
        device: &mut dyn Device,
        label: &str,
        shared: &CullingResources,
        frustums: &RingBuffer,
    ) -> BackendResult<Self> {
        let frames_in_flight = shared.frames_in_flight();
        let commands_per_frame = u64::from(shared.max_blocks)
            * u64::from(shared.max_batches_per_block)
            * DrawIndexedIndirectCommand::SIZE;
        let indirect = frame_ring(
            device,
            &format!("{label}_indirect"),
            commands_per_frame,
            shared.alignment,
            frames_in_flight,
            BufferUsage::STORAGE | BufferUsage::INDIRECT,
        )?;

        let count_size = u64::from(shared.max_blocks.max(1)) * 4;
        let count_buffer = device
            .create_buffer(&BufferDescriptor {
                label: Some(format!("{label}_draw_count")),
                size: count_size,
                usage: BufferUsage::STORAGE
                    | BufferUsage::INDIRECT
                    | BufferUsage::COPY_DST
                    | BufferUsage::COPY_SRC,
                mapped_at_creation: false,
            })
            .map_err(|err| {
                log::error!("Failed to create draw count buffer for '{}': {}", label, err);
                err
            })?;

        let mut bind_groups = Vec::with_capacity(frames_in_flight as usize);
        for frame in 0..frames_in_flight {
            let bind_group = device.create_bind_group(
                shared.bind_group_layout,
                &[
                    (0, region_binding(shared.instances, frame)),
                    (1, region_binding(shared.batches, frame)),
                    (2, region_binding(shared.matrices, frame)),
                    (3, region_binding(frustums, frame)),
                    (4, region_binding(&indirect, frame)),
                    (
                        5,
                        BindGroupEntry::Buffer {
                            buffer: count_buffer,
                            offset: 0,
                            size: Some(count_size),
                        },
                    ),
                ],
            )?;
            bind_groups.push(bind_group);
        }

        Ok(Self {
            indirect,
            count_buffer,
            count_size,
            max_batches_per_block: shared.max_batches_per_block,
            max_blocks: shared.max_blocks,
            bind_groups,
        })
    }

    pub(crate) fn targets(&self, frame_index: u32) -> IndirectTargets {
        IndirectTargets {
            indirect_buffer: self.indirect.buffer(),
            indirect_base: self.indirect.region_base(frame_index),
            count_buffer: self.count_buffer,
            max_batches_per_block: self.max_batches_per_block,
            max_blocks: self.max_blocks,
        }
    }

    pub(crate) fn dispatch(
        &self,
        pipeline: ComputePipelineHandle,
        frame_index: u32,
        push_constants: CullingPushConstants,
    ) -> CullingDispatch {
        let frame_index = frame_index % self.bind_groups.len().max(1) as u32;
        CullingDispatch {
            pipeline,
            bind_group: self.bind_groups[frame_index as usize],
            push_constants,
            group_count: push_constants.total_batches.div_ceil(CULLING_WORKGROUP_SIZE),
            targets: self.targets(frame_index),
            indirect_size: self.indirect.region_capacity(frame_index),
            count_size: self.count_size,
        }
    }

    pub(crate) fn destroy(&mut self, device: &mut dyn Device) {
        for bind_group in self.bind_groups.drain(..) {
            device.destroy_bind_group(bind_group);
        }
        self.indirect.destroy(device);
        device.destroy_buffer(self.count_buffer);
    }
}

/// Write one frustum record and return its offset relative to the frame's region base
pub(crate) fn write_frustum(frustums: &mut RingBuffer, view_proj: Mat4) -> u32 {
    let mut record = [0u8; FRUSTUM_STRIDE as usize];
    let data = FrustumData {
        view_proj,
        planes: extract_frustum_planes(view_proj),
    };
    let bytes = bytemuck::bytes_of(&data);
    record[..bytes.len()].copy_from_slice(bytes);

    match frustums.write(&record[..]) {
        Some(allocation) => (allocation.offset - frustums.region_base(frustums.frame_index())) as u32,
        None => {
            log::error!("Frustum record does not fit its ring region, culling against slot 0");
            0
        }
    }
}

/// Main-view culling pass. Owns the per-frame scene data rings that the shadow pass
/// also reads.
pub struct CullingPass {
    pipeline: ComputePipelineHandle,
    bind_group_layout: BindGroupLayoutHandle,
    instances: RingBuffer,
    batches: RingBuffer,
    matrices: RingBuffer,
    frustums: RingBuffer,
    target: CullingTarget,
    alignment: u64,
    max_instances: u32,
    max_batches: u32,
    max_batches_per_block: u32,
    max_blocks: u32,
}

impl CullingPass {
    pub fn new(device: &mut dyn Device, config: &RendererConfig) -> BackendResult<Self> {
        let frames = config.frames_in_flight;
        let alignment = config
            .ring_alignment
            .max(u64::from(device.capabilities().min_storage_buffer_offset_alignment))
            .max(FRUSTUM_STRIDE);
        let storage = BufferUsage::STORAGE;

        let instances = frame_ring(
            device,
            "cull_instances",
            u64::from(config.max_instances) * std::mem::size_of::<ObjectInstanceData>() as u64,
            alignment,
            frames,
            storage,
        )?;
        let batches = frame_ring(
            device,
            "cull_batches",
            u64::from(config.max_batches) * std::mem::size_of::<DrawBatch>() as u64,
            alignment,
            frames,
            storage,
        )?;
        let matrices = frame_ring(
            device,
            "cull_matrices",
            u64::from(config.max_instances) * u64::from(ObjectMatrices::SIZE),
            alignment,
            frames,
            storage,
        )?;
        let frustums = frame_ring(
            device,
            "cull_frustums",
            FRUSTUM_STRIDE * MAIN_FRUSTUM_SLOTS,
            alignment,
            frames,
            storage,
        )?;

        let bind_group_layout = device.create_bind_group_layout(&Self::layout_entries())?;
        let pipeline = device
            .create_compute_pipeline(&ComputePipelineDescriptor {
                label: Some("frustum_culling".to_string()),
                shader: CULLING_SHADER.to_string(),
                entry_point: "cs_main".to_string(),
                bind_group_layouts: vec![bind_group_layout],
                push_constant_ranges: vec![PushConstantRange {
                    stages: ShaderStageFlags::COMPUTE,
                    range: 0..CullingPushConstants::SIZE,
                }],
            })
            .map_err(|err| {
                log::error!("Failed to create culling pipeline: {}", err);
                err
            })?;

        let target = CullingTarget::new(
            device,
            "cull_main",
            &CullingResources {
                pipeline,
                bind_group_layout,
                instances: &instances,
                batches: &batches,
                matrices: &matrices,
                alignment,
                max_batches: config.max_batches,
                max_batches_per_block: config.max_batches_per_block,
                max_blocks: config.max_mega_buffer_blocks,
            },
            &frustums,
        )?;

        log::info!(
            "Culling pass ready: {} instances, {} batches, {} blocks x {} commands, {} frames in flight",
            config.max_instances,
            config.max_batches,
            config.max_mega_buffer_blocks,
            config.max_batches_per_block,
            frames
        );
        Ok(Self {
            pipeline,
            bind_group_layout,
            instances,
            batches,
            matrices,
            frustums,
            target,
            alignment,
            max_instances: config.max_instances,
            max_batches: config.max_batches,
            max_batches_per_block: config.max_batches_per_block,
            max_blocks: config.max_mega_buffer_blocks,
        })
    }

    fn layout_entries() -> Vec<BindGroupLayoutEntry> {
        let storage = |binding, read_only| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStageFlags::COMPUTE,
            ty: BindingType::StorageBuffer { read_only },
        };
        vec![
            storage(0, true),
            storage(1, true),
            storage(2, true),
            storage(3, true),
            storage(4, false),
            storage(5, false),
        ]
    }

    /// Write this frame's instances, batches and matrices.
    ///
    /// Returns how many batches the dispatch should cover. Zero means nothing was
    /// written to any ring. Batches of blocks past the block budget are dropped, since
    /// they have neither a draw counter nor a command range.
    pub fn upload_scene_data(
        &mut self,
        device: &mut dyn Device,
        frame_index: u32,
        data: &CollectedDrawData,
    ) -> u32 {
        if data.batches.is_empty() {
            log::trace!("No draw batches this frame, skipping scene upload");
            return 0;
        }

        let batches: Cow<[DrawBatch]> =
            if data.batches.iter().all(|b| b.block_index < self.max_blocks) {
                Cow::Borrowed(&data.batches)
            } else {
                log::warn!(
                    "Draw batches reference blocks past the budget of {}, dropping them",
                    self.max_blocks
                );
                Cow::Owned(
                    data.batches
                        .iter()
                        .filter(|b| b.block_index < self.max_blocks)
                        .copied()
                        .collect(),
                )
            };
        if batches.is_empty() {
            return 0;
        }

        let instance_count = clamp_count(data.instances.len(), self.max_instances, "instances");
        let batch_count = clamp_count(batches.len(), self.max_batches, "batches");
        let matrix_count = clamp_count(data.wvps.len(), self.max_instances, "matrices");

        self.instances.reset(frame_index);
        self.batches.reset(frame_index);
        self.matrices.reset(frame_index);

        self.instances.write(&data.instances[..instance_count]);
        self.batches.write(&batches[..batch_count]);
        self.matrices.write(&data.wvps[..matrix_count]);

        self.instances.flush(device);
        self.batches.flush(device);
        self.matrices.flush(device);
        batch_count as u32
    }

    /// Upload the frustum and describe the dispatch for `frame_index`
    pub fn prepare(
        &mut self,
        device: &mut dyn Device,
        frame_index: u32,
        view_proj: Mat4,
        total_batches: u32,
    ) -> CullingDispatch {
        self.frustums.reset(frame_index);
        let frustum_offset = write_frustum(&mut self.frustums, view_proj);
        self.frustums.flush(device);

        let push_constants = self.push_constants(total_batches, frustum_offset);
        self.target
            .dispatch(self.pipeline, self.frustums.frame_index(), push_constants)
    }

    /// Prepare and record in one go
    pub fn execute<B: Device + GraphicsContext>(
        &mut self,
        backend: &mut B,
        frame_index: u32,
        view_proj: Mat4,
        total_batches: u32,
    ) {
        let dispatch = self.prepare(backend, frame_index, view_proj, total_batches);
        dispatch.record(backend);
    }

    pub(crate) fn push_constants(&self, total_batches: u32, frustum_offset: u32) -> CullingPushConstants {
        if total_batches > self.max_batches {
            log::warn!(
                "Culling {} batches, only the first {} fit",
                total_batches,
                self.max_batches
            );
        }
        CullingPushConstants::new(
            total_batches.min(self.max_batches),
            frustum_offset,
            self.max_batches_per_block,
        )
    }

    pub fn shared_resources(&self) -> CullingResources<'_> {
        CullingResources {
            pipeline: self.pipeline,
            bind_group_layout: self.bind_group_layout,
            instances: &self.instances,
            batches: &self.batches,
            matrices: &self.matrices,
            alignment: self.alignment,
            max_batches: self.max_batches,
            max_batches_per_block: self.max_batches_per_block,
            max_blocks: self.max_blocks,
        }
    }

    /// Indirect buffers written by this frame's dispatch
    pub fn targets(&self, frame_index: u32) -> IndirectTargets {
        self.target
            .targets(frame_index % self.frustums.frames_in_flight())
    }

    pub fn instance_buffer(&self) -> &RingBuffer {
        &self.instances
    }

    pub fn matrix_buffer(&self) -> &RingBuffer {
        &self.matrices
    }

    pub fn pipeline(&self) -> ComputePipelineHandle {
        self.pipeline
    }

    pub fn max_batches(&self) -> u32 {
        self.max_batches
    }

    pub fn destroy(&mut self, device: &mut dyn Device) {
        self.target.destroy(device);
        self.instances.destroy(device);
        self.batches.destroy(device);
        self.matrices.destroy(device);
        self.frustums.destroy(device);
    }
}

fn clamp_count(len: usize, max: u32, what: &str) -> usize {
    if len > max as usize {
        log::warn!("{} {} exceed the budget of {}, dropping the rest", len, what, max);
    }
    len.min(max as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Camera, MaterialLayers, MeshRange};
    use glam::Vec3;
    use rstest::rstest;

    fn small_config() -> RendererConfig {
        RendererConfig {
            max_instances: 64,
            max_batches: 64,
            max_batches_per_block: 32,
            max_mega_buffer_blocks: 2,
            ..Default::default()
        }
    }

    fn scene_with(count: u32) -> CollectedDrawData {
        let mut data = CollectedDrawData::new(&Camera::default());
        let range = MeshRange {
            block: 0,
            first_index: 0,
            index_count: 36,
            vertex_offset: 0,
            bounding_sphere: Vec4::new(0.0, 0.0, 0.0, 0.87),
        };
        for i in 0..count {
            data.push(
                &range,
                Mat4::from_translation(Vec3::new(i as f32 * 2.0, 0.0, 0.0)),
                MaterialLayers::default(),
            );
        }
        data
    }

    #[rstest]
    #[case::perspective(
        Mat4::perspective_rh(1.0, 16.0 / 9.0, 0.1, 300.0)
            * Mat4::look_at_rh(Vec3::new(3.0, 4.0, 10.0), Vec3::ZERO, Vec3::Y)
    )]
    #[case::wide(Mat4::perspective_rh(2.5, 1.0, 0.01, 10_000.0))]
    #[case::orthographic(Mat4::orthographic_rh(-20.0, 20.0, -10.0, 10.0, -500.0, 500.0))]
    #[case::rotated(
        Mat4::perspective_rh(0.8, 1.3, 1.0, 50.0)
            * Mat4::from_rotation_y(1.2)
            * Mat4::from_translation(Vec3::new(-5.0, 2.0, 7.0))
    )]
    fn test_frustum_planes_are_unit_length(#[case] view_proj: Mat4) {
        for plane in extract_frustum_planes(view_proj) {
            assert!((plane.truncate().length() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_frustum_planes_contain_visible_points() {
        let view = Mat4::look_at_rh(Vec3::ZERO, -Vec3::Z, Vec3::Y);
        let proj = Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0);
        let planes = extract_frustum_planes(proj * view);

        let distance = |plane: &Vec4, p: Vec3| plane.truncate().dot(p) + plane.w;
        let inside = Vec3::new(0.0, 0.0, -5.0);
        assert!(planes.iter().all(|plane| distance(plane, inside) > 0.0));

        let behind = Vec3::new(0.0, 0.0, 5.0);
        assert!(distance(&planes[4], behind) < 0.0);

        let beyond_far = Vec3::new(0.0, 0.0, -200.0);
        assert!(distance(&planes[5], beyond_far) < 0.0);

        // Near plane sits at z = -0.1
        assert!((distance(&planes[4], Vec3::new(0.0, 0.0, -0.1))).abs() < 1e-4);
    }

    #[test]
    fn test_zero_batches_skip_upload_but_still_dispatch() {
        let mut device = HeadlessBackend::new();
        let mut culling = CullingPass::new(&mut device, &small_config()).unwrap();
        let before = device.buffer_contents(culling.instances.buffer()).unwrap().to_vec();

        let data = CollectedDrawData::new(&Camera::default());
        assert_eq!(culling.upload_scene_data(&mut device, 1, &data), 0);
        assert_eq!(culling.instances.frame_index(), 0);
        assert_eq!(culling.instances.cursor(), 0);
        assert_eq!(culling.batches.cursor(), 0);
        assert_eq!(culling.matrices.cursor(), 0);
        assert_eq!(device.buffer_contents(culling.instances.buffer()).unwrap(), &before[..]);

        let dispatch = culling.prepare(&mut device, 1, Mat4::IDENTITY, 0);
        assert_eq!(dispatch.group_count, 0);
        culling.execute(&mut device, 1, Mat4::IDENTITY, 0);
        assert!(device
            .commands()
            .contains(&RecordedCommand::Dispatch { x: 0, y: 1, z: 1 }));
    }

    #[test]
    fn test_upload_lands_in_frame_region() {
        let mut device = HeadlessBackend::new();
        let mut culling = CullingPass::new(&mut device, &small_config()).unwrap();
        let data = scene_with(3);

        assert_eq!(culling.upload_scene_data(&mut device, 2, &data), 3);

        let base = culling.batches.region_base(2) as usize;
        let expected: &[u8] = bytemuck::cast_slice(&data.batches);
        let contents = device.buffer_contents(culling.batches.buffer()).unwrap();
        assert_eq!(&contents[base..base + expected.len()], expected);
        // Frame 0's region is untouched
        assert!(contents[..expected.len()].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_dispatch_command_order() {
        let mut device = HeadlessBackend::new();
        let mut culling = CullingPass::new(&mut device, &small_config()).unwrap();
        let data = scene_with(300);
        culling.upload_scene_data(&mut device, 0, &data);
        device.take_commands();

        let dispatch = culling.prepare(&mut device, 0, data.view_proj, data.total_batches);
        assert_eq!(dispatch.group_count, 1);
        assert_eq!(dispatch.push_constants.total_batches, 64);
        dispatch.record(&mut device);

        let commands = device.take_commands();
        assert!(matches!(commands[0], RecordedCommand::FillBuffer { value: 0, .. }));
        assert!(matches!(
            commands[1],
            RecordedCommand::BufferBarrier(BufferBarrier {
                src_access: AccessFlags::TRANSFER_WRITE,
                ..
            })
        ));
        assert!(matches!(commands[2], RecordedCommand::BindComputePipeline(_)));
        assert!(matches!(commands[3], RecordedCommand::BindDescriptorSet { index: 0, .. }));
        assert!(matches!(commands[4], RecordedCommand::PushConstants { .. }));
        assert!(matches!(commands[5], RecordedCommand::Dispatch { x: 1, y: 1, z: 1 }));
        for command in &commands[6..8] {
            match command {
                RecordedCommand::BufferBarrier(barrier) => {
                    assert_eq!(barrier.src_access, AccessFlags::SHADER_WRITE);
                    assert_eq!(barrier.dst_access, AccessFlags::INDIRECT_COMMAND_READ);
                }
                other => panic!("expected a buffer barrier, got {:?}", other),
            }
        }
        assert_eq!(commands.len(), 8);
    }

    #[test]
    fn test_push_constants_layout() {
        let mut device = HeadlessBackend::new();
        let mut culling = CullingPass::new(&mut device, &small_config()).unwrap();
        let dispatch = culling.prepare(&mut device, 1, Mat4::IDENTITY, 10);
        assert_eq!(CullingPushConstants::SIZE, 20);
        assert_eq!(dispatch.push_constants.wvp_stride, 128);
        assert_eq!(dispatch.push_constants.frustum_stride, 256);
        assert_eq!(dispatch.push_constants.frustum_offset % 256, 0);
        assert_eq!(dispatch.targets.indirect_base, culling.target.indirect.region_base(1));
    }

    #[test]
    fn test_draw_for_block_offsets() {
        let targets = IndirectTargets {
            indirect_buffer: BufferHandle(1),
            indirect_base: 512,
            count_buffer: BufferHandle(2),
            max_batches_per_block: 32,
            max_blocks: 2,
        };
        let block = MegaBufferBlock {
            vertex_buffer: BufferHandle(3),
            index_buffer: BufferHandle(4),
            first_batch: 10,
            batch_count: 50,
        };
        let draw = targets.draw_for_block(1, &block);
        assert_eq!(draw.offset, 512 + 32 * 20);
        assert_eq!(draw.count_offset, 4);
        assert_eq!(draw.max_draw_count, 32);
        assert_eq!(draw.stride, 20);
    }

    #[test]
    fn test_draw_blocks_stops_at_block_budget() {
        let mut device = HeadlessBackend::new();
        let culling = CullingPass::new(
            &mut device,
            &RendererConfig {
                max_mega_buffer_blocks: 1,
                ..small_config()
            },
        )
        .unwrap();
        let block = |id: u64, first_batch: u32| MegaBufferBlock {
            vertex_buffer: BufferHandle(100 + id),
            index_buffer: BufferHandle(200 + id),
            first_batch,
            batch_count: 2,
        };

        let targets = culling.targets(0);
        assert_eq!(targets.max_blocks, 1);
        targets.draw_blocks(&mut device, &[block(0, 0), block(1, 2)]);

        let commands = device.take_commands();
        let draws: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::DrawIndexedIndirectCount(draw) => Some(draw),
                _ => None,
            })
            .collect();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].count_offset, 0);
        assert!(!commands.contains(&RecordedCommand::BindVertexBuffer {
            slot: 0,
            buffer: BufferHandle(101),
            offset: 0,
        }));
    }

    #[test]
    fn test_upload_drops_batches_past_block_budget() {
        let mut device = HeadlessBackend::new();
        let mut culling = CullingPass::new(
            &mut device,
            &RendererConfig {
                max_mega_buffer_blocks: 1,
                ..small_config()
            },
        )
        .unwrap();

        let mut data = scene_with(3);
        data.batches[2].block_index = 1;
        assert_eq!(culling.upload_scene_data(&mut device, 0, &data), 2);

        let base = culling.batches.region_base(0) as usize;
        let expected: &[u8] = bytemuck::cast_slice(&data.batches[..2]);
        let contents = device.buffer_contents(culling.batches.buffer()).unwrap();
        assert_eq!(&contents[base..base + expected.len()], expected);

        data.batches.iter_mut().for_each(|b| b.block_index = 3);
        assert_eq!(culling.upload_scene_data(&mut device, 1, &data), 0);
    }

    #[test]
    fn test_pipeline_failure_is_fatal() {
        let mut device = HeadlessBackend::new();
        device.set_failures(FailureInjection {
            pipelines: true,
            ..Default::default()
        });
        assert!(CullingPass::new(&mut device, &small_config()).is_err());
    }
}
