//! Per-frame ring buffer for streaming data to the GPU.
//!
//! One GPU buffer is split into `frames_in_flight` equal regions. Each frame
//! calls [`RingBuffer::reset`] with its frame index, which moves the write cursor to
//! the aligned base of that frame's region, and then sub-allocates linearly with
//! [`RingBuffer::allocate`]. Because the GPU can only be reading regions of the
//! other frames in flight, the CPU may overwrite its own region without waiting.
//!
//! # Overflow
//!
//! An allocation that would cross the end of the frame's region wraps back to the
//! region base and logs a warning. Later allocations in the same frame may then
//! overwrite earlier ones, so callers must size their rings for the peak per-frame
//! demand.
//!
//! # Mapping
//!
//! The CPU writes into a host-side copy of the whole buffer ([`RingBuffer::mapped_mut`]).
//! [`RingBuffer::flush`] pushes the bytes written this frame to the GPU buffer.
//! On backends with coherent persistent mappings this is a single copy; wgpu has
//! no persistent mappings, so it goes through `Queue::write_buffer`.
//!
//! # Example
//!
//! ```ignore
//! let mut ring = RingBuffer::new(
//!     device,
//!     "frustum",
//!     64 * 1024,
//!     256,
//!     3,
//!     BufferUsage::STORAGE | BufferUsage::COPY_DST,
//! )?;
//!
//! ring.reset(frame_index);
//! let alloc = ring.write(&[frustum_data]).unwrap();
//! ring.flush(device);
//! // alloc.offset is where the shader finds the data
//! ```

use crate::backend::{BackendError, BackendResult, BufferDescriptor, BufferHandle, BufferUsage, Device};
use bytemuck::Pod;

/// A sub-allocation from a ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingAllocation {
    /// Byte offset into the ring buffer.
    pub offset: u64,
    /// Size of the allocation in bytes, rounded up to the ring's alignment.
    pub size: u64,
}

impl RingAllocation {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Get the end offset (offset + size).
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// A GPU buffer partitioned into one linear allocator per frame in flight.
pub struct RingBuffer {
    buffer: BufferHandle,
    label: String,
    size: u64,
    alignment: u64,
    frames_in_flight: u32,
    per_frame_size: u64,

    frame_index: u32,
    cursor: u64,
    wrap_count: u64,

    mapped: Vec<u8>,
    dirty: Option<(u64, u64)>,
}

impl RingBuffer {
    /// Create a ring buffer of `size` bytes split into `frames_in_flight` regions.
    ///
    /// `alignment` must be a power of two. Buffer creation failure is returned to
    /// the caller, which treats it as fatal.
    pub fn new(
        device: &mut dyn Device,
        label: &str,
        size: u64,
        alignment: u64,
        frames_in_flight: u32,
        usage: BufferUsage,
    ) -> BackendResult<Self> {
        if !alignment.is_power_of_two() {
            return Err(BackendError::InvalidParameter(format!(
                "ring buffer alignment must be a power of 2, got {alignment}"
            )));
        }
        if frames_in_flight == 0 {
            return Err(BackendError::InvalidParameter(
                "ring buffer needs at least one frame in flight".to_string(),
            ));
        }
        let per_frame_size = size / u64::from(frames_in_flight);
        if per_frame_size < alignment {
            return Err(BackendError::InvalidParameter(format!(
                "ring buffer '{label}' of {size} bytes is too small for {frames_in_flight} frames at alignment {alignment}"
            )));
        }

        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: Some(format!("{label}_ring")),
                size,
                usage: usage | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            })
            .map_err(|err| {
                log::error!("Failed to create ring buffer '{}': {}", label, err);
                err
            })?;

        Ok(Self {
            buffer,
            label: label.to_string(),
            size,
            alignment,
            frames_in_flight,
            per_frame_size,
            frame_index: 0,
            cursor: 0,
            wrap_count: 0,
            mapped: vec![0u8; size as usize],
            dirty: None,
        })
    }

    /// Get the underlying GPU buffer.
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    /// Unaligned size of one frame region (`size / frames_in_flight`).
    pub fn per_frame_size(&self) -> u64 {
        self.per_frame_size
    }

    /// Aligned start of a frame's region.
    pub fn region_base(&self, frame_index: u32) -> u64 {
        align_up(u64::from(frame_index) * self.per_frame_size, self.alignment)
    }

    /// Exclusive end of a frame's region.
    pub fn region_end(&self, frame_index: u32) -> u64 {
        (u64::from(frame_index) + 1) * self.per_frame_size
    }

    /// Usable bytes in a frame's region once its base is aligned.
    pub fn region_capacity(&self, frame_index: u32) -> u64 {
        self.region_end(frame_index) - self.region_base(frame_index)
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Current write cursor (absolute byte offset).
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Number of in-frame overflows since creation.
    pub fn wrap_count(&self) -> u64 {
        self.wrap_count
    }

    /// Bytes allocated in the current frame's region.
    pub fn used(&self) -> u64 {
        self.cursor - self.region_base(self.frame_index)
    }

    /// Move the write cursor to the aligned base of `frame_index`'s region.
    ///
    /// Must be called once per frame before any allocation for that frame.
    pub fn reset(&mut self, frame_index: u32) {
        let frame_index = if frame_index >= self.frames_in_flight {
            log::warn!(
                "Ring buffer '{}' reset with frame index {} >= {} frames in flight",
                self.label,
                frame_index,
                self.frames_in_flight
            );
            frame_index % self.frames_in_flight
        } else {
            frame_index
        };
        self.frame_index = frame_index;
        self.cursor = self.region_base(frame_index);
        self.dirty = None;
    }

    /// Allocate `size` bytes (rounded up to the alignment) from the current region.
    ///
    /// If the allocation would cross the region end it wraps to the region base.
    /// Returns `None` only when `size` exceeds the whole region.
    pub fn allocate(&mut self, size: u64) -> Option<RingAllocation> {
        let aligned_size = align_up(size.max(1), self.alignment);
        let base = self.region_base(self.frame_index);
        let end = self.region_end(self.frame_index);

        if aligned_size > end - base {
            log::error!(
                "Ring buffer '{}' allocation of {} bytes exceeds the {} byte frame region",
                self.label,
                size,
                end - base
            );
            return None;
        }

        if self.cursor + aligned_size > end {
            log::warn!(
                "Ring buffer '{}' overflowed frame {} region ({} + {} > {}), wrapping to region base",
                self.label,
                self.frame_index,
                self.cursor,
                aligned_size,
                end
            );
            self.cursor = base;
            self.wrap_count += 1;
        }

        let offset = self.cursor;
        self.cursor += aligned_size;
        self.mark_dirty(offset, offset + aligned_size);
        Some(RingAllocation::new(offset, aligned_size))
    }

    /// Allocate and copy `data` into the mapping.
    pub fn write<T: Pod>(&mut self, data: &[T]) -> Option<RingAllocation> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let allocation = self.allocate(bytes.len() as u64)?;
        let start = allocation.offset as usize;
        self.mapped[start..start + bytes.len()].copy_from_slice(bytes);
        Some(allocation)
    }

    /// CPU view of an allocation's bytes.
    pub fn mapped_mut(&mut self, allocation: &RingAllocation) -> &mut [u8] {
        let start = (allocation.offset as usize).min(self.mapped.len());
        let end = (allocation.end() as usize).min(self.mapped.len());
        &mut self.mapped[start..end]
    }

    /// Upload the bytes allocated since the last reset or flush.
    pub fn flush(&mut self, device: &mut dyn Device) {
        if let Some((start, end)) = self.dirty.take() {
            device.write_buffer(self.buffer, start, &self.mapped[start as usize..end as usize]);
        }
    }

    pub fn destroy(&mut self, device: &mut dyn Device) {
        device.destroy_buffer(self.buffer);
    }

    fn mark_dirty(&mut self, start: u64, end: u64) {
        self.dirty = Some(match self.dirty {
            Some((dirty_start, dirty_end)) => (dirty_start.min(start), dirty_end.max(end)),
            None => (start, end),
        });
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("label", &self.label)
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .field("frames_in_flight", &self.frames_in_flight)
            .field("frame_index", &self.frame_index)
            .field("cursor", &self.cursor)
            .field("wrap_count", &self.wrap_count)
            .finish()
    }
}

/// Align a value up to the given alignment.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    const TWO_MB: u64 = 2 * 1024 * 1024;

    fn create_ring(device: &mut HeadlessBackend, size: u64, alignment: u64, frames: u32) -> RingBuffer {
        RingBuffer::new(device, "test", size, alignment, frames, BufferUsage::STORAGE).unwrap()
    }

    #[test]
    fn test_ring_buffer_creation() {
        let mut device = HeadlessBackend::new();
        let ring = create_ring(&mut device, 3072, 256, 3);

        assert_eq!(ring.size(), 3072);
        assert_eq!(ring.per_frame_size(), 1024);
        assert_eq!(ring.cursor(), 0);
        assert_eq!(ring.wrap_count(), 0);
        assert_eq!(device.buffer_count(), 1);
    }

    #[test]
    fn test_ring_buffer_rejects_bad_alignment() {
        let mut device = HeadlessBackend::new();
        let result = RingBuffer::new(&mut device, "test", 4096, 100, 2, BufferUsage::STORAGE);
        assert!(matches!(result, Err(BackendError::InvalidParameter(_))));
    }

    #[test]
    fn test_ring_buffer_reset_lands_on_aligned_region_base() {
        let mut device = HeadlessBackend::new();
        let mut ring = create_ring(&mut device, TWO_MB, 256, 3);

        ring.reset(1);
        let alloc = ring.allocate(100).unwrap();

        let expected = 256 * (TWO_MB / 3).div_ceil(256);
        assert_eq!(alloc.offset, expected);
        assert_eq!(alloc.offset, 699_136);
        assert_eq!(alloc.size, 256);
    }

    #[test]
    fn test_ring_buffer_allocation_rounds_to_alignment() {
        let mut device = HeadlessBackend::new();
        let mut ring = create_ring(&mut device, 4096, 64, 2);

        ring.reset(0);
        let alloc1 = ring.allocate(100).unwrap();
        let alloc2 = ring.allocate(1).unwrap();
        assert_eq!(alloc1.offset, 0);
        assert_eq!(alloc1.size, 128);
        assert_eq!(alloc2.offset, 128);
        assert_eq!(alloc2.size, 64);
        assert_eq!(ring.used(), 192);
    }

    #[test]
    fn test_ring_buffer_wraps_to_region_base_on_overflow() {
        let mut device = HeadlessBackend::new();
        let mut ring = create_ring(&mut device, 3 * 1024, 256, 3);

        ring.reset(2);
        let base = ring.region_base(2);
        let first = ring.allocate(512).unwrap();
        let second = ring.allocate(256).unwrap();
        assert_eq!(first.offset, base);
        assert_eq!(second.offset, base + 512);

        // 768 + 512 > 1024: wraps instead of failing or spilling
        let third = ring.allocate(512).unwrap();
        assert_eq!(third.offset, base);
        assert_eq!(ring.wrap_count(), 1);
        assert!(third.end() <= ring.region_end(2));
    }

    #[test]
    fn test_ring_buffer_oversized_allocation_fails() {
        let mut device = HeadlessBackend::new();
        let mut ring = create_ring(&mut device, 2048, 256, 2);

        ring.reset(0);
        assert!(ring.allocate(1025).is_none());
        assert_eq!(ring.cursor(), 0);
    }

    #[test]
    fn test_ring_buffer_regions_stay_isolated() {
        let mut device = HeadlessBackend::new();
        let frames = 3;
        let mut ring = create_ring(&mut device, 10_000, 256, frames);

        for frame in 0..frames {
            ring.reset(frame);
            for size in [100u64, 700, 1500, 300, 2000, 64] {
                let Some(alloc) = ring.allocate(size) else {
                    continue;
                };
                let region_start = u64::from(frame) * ring.per_frame_size();
                let region_end = region_start + ring.per_frame_size();
                assert!(alloc.offset >= region_start, "frame {frame}: {alloc:?}");
                assert!(alloc.end() <= region_end, "frame {frame}: {alloc:?}");
            }
        }
    }

    #[test]
    fn test_ring_buffer_reset_clamps_out_of_range_frame() {
        let mut device = HeadlessBackend::new();
        let mut ring = create_ring(&mut device, 3072, 256, 3);

        ring.reset(4);
        assert_eq!(ring.frame_index(), 1);
        assert_eq!(ring.cursor(), ring.region_base(1));
    }

    #[test]
    fn test_ring_buffer_write_and_flush() {
        let mut device = HeadlessBackend::new();
        let mut ring = create_ring(&mut device, 2048, 256, 2);

        ring.reset(1);
        let alloc = ring.write(&[1u32, 2, 3, 4]).unwrap();
        ring.flush(&mut device);

        let contents = device.buffer_contents(ring.buffer()).unwrap();
        let start = alloc.offset as usize;
        let words: Vec<u32> = contents[start..start + 16]
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        assert_eq!(words, vec![1, 2, 3, 4]);

        // A second flush without new writes is a no-op
        ring.mapped_mut(&alloc)[0] = 99;
        ring.flush(&mut device);
        assert_eq!(device.buffer_contents(ring.buffer()).unwrap()[start], 1);
    }
}
