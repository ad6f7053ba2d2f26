//! Transient resources for the render graph
//!
//! The pool hands out textures per frame and recycles owned textures across frames when
//! their descriptor matches. Imported textures (the swapchain image, the shadow map) are
//! registered fresh every frame and dropped again at the next [`TransientResourcePool::begin_frame`].

use crate::backend::*;

/// Generation-checked reference to a pool entry, valid for the current frame only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle {
    index: u32,
    version: u32,
}

impl TextureHandle {
    pub const INVALID: Self = Self {
        index: u32::MAX,
        version: 0,
    };

    pub fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

impl Default for TextureHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Descriptor used to match pooled textures. Every field takes part in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub usage: TextureUsage,
    pub layers: u32,
    pub cube: bool,
}

impl TextureDesc {
    /// A single-layer 2D texture
    pub fn new(format: TextureFormat, width: u32, height: u32, usage: TextureUsage) -> Self {
        Self {
            format,
            width,
            height,
            usage,
            layers: 1,
            cube: false,
        }
    }

    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self
    }

    pub fn render_target(format: TextureFormat, width: u32, height: u32) -> Self {
        Self::new(
            format,
            width,
            height,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        )
    }

    fn texture_descriptor(&self, label: String) -> TextureDescriptor {
        TextureDescriptor {
            label: Some(label),
            width: self.width,
            height: self.height,
            array_layers: if self.cube { 6 } else { self.layers.max(1) },
            mip_levels: 1,
            format: self.format,
            usage: self.usage,
        }
    }

    fn view_descriptor(&self) -> TextureViewDescriptor {
        if self.cube {
            TextureViewDescriptor::cube()
        } else if self.layers > 1 {
            TextureViewDescriptor::array()
        } else {
            TextureViewDescriptor::default()
        }
    }
}

#[derive(Debug)]
struct PoolEntry {
    texture: ImageHandle,
    view: ImageViewHandle,
    desc: TextureDesc,
    imported: bool,
    last_frame: u64,
}

#[derive(Debug, Default)]
struct Slot {
    version: u32,
    entry: Option<PoolEntry>,
}

/// Frame-scoped texture pool
#[derive(Debug, Default)]
pub struct TransientResourcePool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    current_frame: u64,
}

impl TransientResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return an owned texture matching `desc` that has not been handed out this frame,
    /// creating one if none is free
    pub fn acquire_texture(
        &mut self,
        device: &mut dyn Device,
        desc: &TextureDesc,
    ) -> BackendResult<TextureHandle> {
        let current = self.current_frame;
        let reusable = self.slots.iter().position(|slot| {
            slot.entry
                .as_ref()
                .is_some_and(|e| !e.imported && e.desc == *desc && e.last_frame != current)
        });

        if let Some(index) = reusable {
            let slot = &mut self.slots[index];
            slot.version = slot.version.wrapping_add(1);
            if let Some(entry) = slot.entry.as_mut() {
                entry.last_frame = current;
            }
            return Ok(TextureHandle {
                index: index as u32,
                version: slot.version,
            });
        }

        let index = self.next_free_slot();
        let texture =
            match device.create_texture(&desc.texture_descriptor(format!("transient_{}", index))) {
                Ok(texture) => texture,
                Err(e) => {
                    self.free.push(index);
                    return Err(e);
                }
            };
        let view = match device.create_texture_view(texture, &desc.view_descriptor()) {
            Ok(view) => view,
            Err(e) => {
                device.destroy_texture(texture);
                self.free.push(index);
                return Err(e);
            }
        };

        log::debug!(
            "Created transient texture {} ({:?} {}x{}x{})",
            index,
            desc.format,
            desc.width,
            desc.height,
            desc.layers
        );

        Ok(self.occupy(
            index,
            PoolEntry {
                texture,
                view,
                desc: *desc,
                imported: false,
                last_frame: current,
            },
        ))
    }

    /// Register an externally owned texture for this frame. Imported entries are never
    /// matched by [`acquire_texture`](Self::acquire_texture) and never destroyed by the pool.
    pub fn import_texture(
        &mut self,
        texture: ImageHandle,
        view: ImageViewHandle,
        desc: TextureDesc,
    ) -> TextureHandle {
        let index = self.next_free_slot();
        self.occupy(
            index,
            PoolEntry {
                texture,
                view,
                desc,
                imported: true,
                last_frame: self.current_frame,
            },
        )
    }

    /// Drop every imported entry
    pub fn begin_frame(&mut self) {
        for index in 0..self.slots.len() {
            let imported = self.slots[index].entry.as_ref().is_some_and(|e| e.imported);
            if imported {
                self.release(index);
            }
        }
    }

    pub fn end_frame(&mut self) {
        self.current_frame += 1;
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<ImageHandle> {
        self.entry(handle).map(|e| e.texture)
    }

    pub fn view(&self, handle: TextureHandle) -> Option<ImageViewHandle> {
        self.entry(handle).map(|e| e.view)
    }

    pub fn desc(&self, handle: TextureHandle) -> Option<&TextureDesc> {
        self.entry(handle).map(|e| &e.desc)
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Number of live entries, owned and imported
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy owned entries that have not been used for more than `max_idle_frames` frames
    pub fn trim(&mut self, device: &mut dyn Device, max_idle_frames: u64) {
        let current = self.current_frame;
        for index in 0..self.slots.len() {
            let stale = self.slots[index]
                .entry
                .as_ref()
                .is_some_and(|e| !e.imported && current.saturating_sub(e.last_frame) > max_idle_frames);
            if stale {
                if let Some(entry) = self.release(index) {
                    log::debug!("Evicting idle transient texture {}", index);
                    device.destroy_texture_view(entry.view);
                    device.destroy_texture(entry.texture);
                }
            }
        }
    }

    /// Destroy every owned entry and forget every imported one
    pub fn clear(&mut self, device: &mut dyn Device) {
        for index in 0..self.slots.len() {
            if let Some(entry) = self.release(index) {
                if !entry.imported {
                    device.destroy_texture_view(entry.view);
                    device.destroy_texture(entry.texture);
                }
            }
        }
    }

    fn entry(&self, handle: TextureHandle) -> Option<&PoolEntry> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.version != handle.version {
            return None;
        }
        slot.entry.as_ref()
    }

    fn next_free_slot(&mut self) -> u32 {
        match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn occupy(&mut self, index: u32, entry: PoolEntry) -> TextureHandle {
        let slot = &mut self.slots[index as usize];
        slot.version = slot.version.wrapping_add(1);
        slot.entry = Some(entry);
        TextureHandle {
            index,
            version: slot.version,
        }
    }

    fn release(&mut self, index: usize) -> Option<PoolEntry> {
        let slot = &mut self.slots[index];
        let entry = slot.entry.take()?;
        slot.version = slot.version.wrapping_add(1);
        self.free.push(index as u32);
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr_desc() -> TextureDesc {
        TextureDesc::new(
            TextureFormat::Rgba16Float,
            1920,
            1080,
            TextureUsage::RENDER_ATTACHMENT,
        )
    }

    #[test]
    fn test_invalid_handle_resolves_to_none() {
        let pool = TransientResourcePool::new();
        assert!(!TextureHandle::INVALID.is_valid());
        assert!(pool.texture(TextureHandle::INVALID).is_none());
        assert!(pool.view(TextureHandle::INVALID).is_none());
        assert!(pool.desc(TextureHandle::INVALID).is_none());
    }

    #[test]
    fn test_second_acquire_in_same_frame_creates_new_entry() {
        let mut device = HeadlessBackend::new();
        let mut pool = TransientResourcePool::new();
        pool.begin_frame();

        let a = pool.acquire_texture(&mut device, &hdr_desc()).unwrap();
        let b = pool.acquire_texture(&mut device, &hdr_desc()).unwrap();

        assert_ne!(a.index(), b.index());
        assert_ne!(pool.texture(a), pool.texture(b));
        assert_eq!(pool.len(), 2);
        assert_eq!(device.texture_count(), 2);
    }

    #[test]
    fn test_owned_texture_reused_next_frame() {
        let mut device = HeadlessBackend::new();
        let mut pool = TransientResourcePool::new();

        pool.begin_frame();
        let first = pool.acquire_texture(&mut device, &hdr_desc()).unwrap();
        let physical = pool.texture(first);
        pool.end_frame();

        pool.begin_frame();
        let second = pool.acquire_texture(&mut device, &hdr_desc()).unwrap();
        assert_eq!(second.index(), first.index());
        assert_eq!(pool.texture(second), physical);
        assert_eq!(device.texture_count(), 1);

        // The reuse bumped the version, so last frame's handle is stale
        assert_ne!(second.version(), first.version());
        assert!(pool.texture(first).is_none());
    }

    #[test]
    fn test_failed_creation_returns_slot() {
        let mut device = HeadlessBackend::new();
        let mut pool = TransientResourcePool::new();
        device.set_failures(FailureInjection {
            textures: true,
            ..Default::default()
        });

        for _ in 0..100 {
            pool.begin_frame();
            assert!(pool.acquire_texture(&mut device, &hdr_desc()).is_err());
            pool.end_frame();
        }
        assert!(pool.is_empty());
        assert_eq!(pool.slots.len(), 1);

        device.set_failures(FailureInjection::default());
        pool.begin_frame();
        let handle = pool.acquire_texture(&mut device, &hdr_desc()).unwrap();
        assert_eq!(handle.index(), 0);
        assert!(pool.texture(handle).is_some());
    }

    #[test]
    fn test_descriptor_mismatch_is_not_reused() {
        let mut device = HeadlessBackend::new();
        let mut pool = TransientResourcePool::new();

        pool.begin_frame();
        pool.acquire_texture(&mut device, &hdr_desc()).unwrap();
        pool.end_frame();

        pool.begin_frame();
        let other = hdr_desc().with_layers(2);
        pool.acquire_texture(&mut device, &other).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_imported_texture_evicted_at_begin_frame() {
        let mut device = HeadlessBackend::new();
        let mut pool = TransientResourcePool::new();
        let texture = device.create_texture(&TextureDescriptor::default()).unwrap();
        let view = device
            .create_texture_view(texture, &TextureViewDescriptor::default())
            .unwrap();

        pool.begin_frame();
        let imported = pool.import_texture(texture, view, hdr_desc());
        let owned = pool.acquire_texture(&mut device, &hdr_desc()).unwrap();
        assert_eq!(pool.view(imported), Some(view));
        pool.end_frame();

        pool.begin_frame();
        assert!(pool.texture(imported).is_none());
        assert_eq!(pool.len(), 1);
        // The owned entry survives and is eligible for reuse
        let reused = pool.acquire_texture(&mut device, &hdr_desc()).unwrap();
        assert_eq!(reused.index(), owned.index());
    }

    #[test]
    fn test_imported_texture_never_matched() {
        let mut device = HeadlessBackend::new();
        let mut pool = TransientResourcePool::new();
        let texture = device.create_texture(&TextureDescriptor::default()).unwrap();
        let view = device
            .create_texture_view(texture, &TextureViewDescriptor::default())
            .unwrap();

        pool.begin_frame();
        pool.import_texture(texture, view, hdr_desc());
        pool.end_frame();

        let acquired = pool.acquire_texture(&mut device, &hdr_desc()).unwrap();
        assert_ne!(pool.texture(acquired), Some(texture));
    }

    #[test]
    fn test_trim_destroys_idle_entries() {
        let mut device = HeadlessBackend::new();
        let mut pool = TransientResourcePool::new();

        pool.begin_frame();
        pool.acquire_texture(&mut device, &hdr_desc()).unwrap();
        pool.end_frame();
        for _ in 0..3 {
            pool.begin_frame();
            pool.end_frame();
        }

        pool.trim(&mut device, 5);
        assert_eq!(pool.len(), 1);
        pool.trim(&mut device, 2);
        assert!(pool.is_empty());
        assert_eq!(device.texture_count(), 0);
    }

    #[test]
    fn test_clear_keeps_imported_textures_alive() {
        let mut device = HeadlessBackend::new();
        let mut pool = TransientResourcePool::new();
        let texture = device.create_texture(&TextureDescriptor::default()).unwrap();
        let view = device
            .create_texture_view(texture, &TextureViewDescriptor::default())
            .unwrap();

        pool.import_texture(texture, view, hdr_desc());
        pool.acquire_texture(&mut device, &hdr_desc()).unwrap();
        pool.clear(&mut device);

        assert!(pool.is_empty());
        assert_eq!(device.texture_count(), 1);
    }
}
