//! Buffers and images behind [`ResourceHandle`]s.
//!
//! A multi-buffered resource owns one physical copy per frame in flight;
//! everything else owns exactly one. Operations pick the copy for the
//! current virtual frame through [`Resource::copy_index`].

use crate::backend::{
    BufferId, BufferUsageBits, GraphicsBackend, ImageCreateInfo, ImageId, ImageViewId,
};
use crate::error::{fatal, Result};
use crate::handle::{HandlePool, ResourceHandle};
use crate::memory::{Allocation, GpuMemoryAllocator, MemoryClass};
use tinker_core::limits::MAX_FRAMES_IN_FLIGHT;
use tinker_core::{BufferUsage, ImageFormat, ImageUsageFlags, ResourceType};
use tracing::{debug, trace};

/// Immutable description of a resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceDesc {
    pub resource_type: ResourceType,
    /// Width, height, depth for images. Byte size in `dims[0]` for buffers.
    pub dims: [u32; 3],
    pub buffer_usage: BufferUsage,
    pub image_format: ImageFormat,
    pub image_usage: ImageUsageFlags,
    pub array_layers: u32,
    pub debug_label: &'static str,
}

impl ResourceDesc {
    pub fn buffer(usage: BufferUsage, size_in_bytes: u32) -> Self {
        Self {
            resource_type: ResourceType::Buffer1D,
            dims: [size_in_bytes, 1, 1],
            buffer_usage: usage,
            array_layers: 1,
            ..Default::default()
        }
    }

    pub fn image_2d(width: u32, height: u32, format: ImageFormat, usage: ImageUsageFlags) -> Self {
        Self {
            resource_type: ResourceType::Image2D,
            dims: [width, height, 1],
            image_format: format,
            image_usage: usage,
            array_layers: 1,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_array_layers(mut self, layers: u32) -> Self {
        self.array_layers = layers;
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: &'static str) -> Self {
        self.debug_label = label;
        self
    }

    #[inline]
    pub const fn is_image(&self) -> bool {
        matches!(self.resource_type, ResourceType::Image2D)
    }

    /// Images are never multi-buffered.
    #[inline]
    pub const fn is_multi_buffered(&self) -> bool {
        !self.is_image() && self.buffer_usage.is_multi_buffered()
    }

    #[inline]
    pub const fn num_copies(&self) -> usize {
        if self.is_multi_buffered() {
            MAX_FRAMES_IN_FLIGHT
        } else {
            1
        }
    }

    #[inline]
    pub const fn byte_size(&self) -> u64 {
        self.dims[0] as u64
    }
}

/// Device usage and memory class of a buffer usage tag.
pub const fn buffer_usage_bits(usage: BufferUsage) -> (BufferUsageBits, MemoryClass) {
    match usage {
        BufferUsage::Vertex => (
            BufferUsageBits::STORAGE
                .union(BufferUsageBits::TRANSFER_SRC)
                .union(BufferUsageBits::TRANSFER_DST),
            MemoryClass::DeviceLocalBuffers,
        ),
        BufferUsage::Index => (
            BufferUsageBits::INDEX.union(BufferUsageBits::TRANSFER_DST),
            MemoryClass::DeviceLocalBuffers,
        ),
        BufferUsage::TransientVertex => (BufferUsageBits::STORAGE, MemoryClass::HostVisibleBuffers),
        BufferUsage::TransientIndex => (BufferUsageBits::INDEX, MemoryClass::HostVisibleBuffers),
        BufferUsage::Staging => (
            BufferUsageBits::TRANSFER_SRC.union(BufferUsageBits::TRANSFER_DST),
            MemoryClass::HostVisibleBuffers,
        ),
        BufferUsage::Uniform => (BufferUsageBits::UNIFORM, MemoryClass::HostVisibleBuffers),
    }
}

/// One physical copy of a resource.
#[derive(Clone, Copy, Debug)]
pub enum PhysicalResource {
    Buffer {
        buffer: BufferId,
        allocation: Allocation,
    },
    Image {
        image: ImageId,
        view: ImageViewId,
        /// `None` for images owned by a swap chain.
        allocation: Option<Allocation>,
    },
}

#[derive(Debug)]
pub struct Resource {
    pub desc: ResourceDesc,
    copies: Vec<PhysicalResource>,
}

impl Resource {
    /// Which physical copy virtual frame `frame` touches.
    #[inline]
    pub const fn copy_index(&self, frame: usize) -> usize {
        if self.desc.is_multi_buffered() {
            frame % MAX_FRAMES_IN_FLIGHT
        } else {
            0
        }
    }

    pub fn physical(&self, frame: usize) -> &PhysicalResource {
        &self.copies[self.copy_index(frame)]
    }

    #[track_caller]
    pub fn buffer(&self, frame: usize) -> BufferId {
        match self.physical(frame) {
            PhysicalResource::Buffer { buffer, .. } => *buffer,
            PhysicalResource::Image { .. } => {
                fatal(format!("resource '{}' is not a buffer", self.desc.debug_label))
            }
        }
    }

    #[track_caller]
    pub fn image(&self, frame: usize) -> (ImageId, ImageViewId) {
        match self.physical(frame) {
            PhysicalResource::Image { image, view, .. } => (*image, *view),
            PhysicalResource::Buffer { .. } => {
                fatal(format!("resource '{}' is not an image", self.desc.debug_label))
            }
        }
    }

    /// Whether the registry created (and so must destroy) the backing objects.
    pub fn is_owned(&self) -> bool {
        !matches!(
            self.copies.first(),
            Some(PhysicalResource::Image {
                allocation: None,
                ..
            })
        )
    }
}

/// Owns every buffer and image created through the layer.
pub struct ResourceRegistry {
    pool: HandlePool<ResourceHandle, Resource>,
}

impl ResourceRegistry {
    pub fn new(capacity: u32) -> Self {
        Self {
            pool: HandlePool::with_capacity(capacity),
        }
    }

    /// Tag resource handles issued from now on with `epoch`.
    pub fn start_epoch(&mut self, epoch: u32) {
        self.pool.start_epoch(epoch);
    }

    /// Create the physical object(s) for `desc` and sub-allocate their memory.
    pub fn create(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        memory: &mut GpuMemoryAllocator,
        desc: &ResourceDesc,
    ) -> Result<ResourceHandle> {
        let copies = match desc.resource_type {
            ResourceType::Buffer1D => create_buffers(backend, memory, desc)?,
            ResourceType::Image2D => vec![create_image(backend, memory, desc)?],
        };
        let handle = self.pool.alloc(Resource {
            desc: *desc,
            copies,
        });
        debug!(
            "Created {:?} '{}' {handle:?} ({} copies)",
            desc.resource_type,
            desc.debug_label,
            desc.num_copies()
        );
        Ok(handle)
    }

    /// Register an image whose lifetime is managed elsewhere.
    pub fn register_external_image(
        &mut self,
        desc: &ResourceDesc,
        image: ImageId,
        view: ImageViewId,
    ) -> ResourceHandle {
        self.pool.alloc(Resource {
            desc: *desc,
            copies: vec![PhysicalResource::Image {
                image,
                view,
                allocation: None,
            }],
        })
    }

    /// Release the handle of an external image without touching the image.
    pub fn release_external(&mut self, handle: ResourceHandle) {
        let resource = self.pool.dealloc(handle);
        if resource.is_owned() {
            fatal(format!("{handle:?} is owned by the registry"));
        }
    }

    /// Wait for the device to go idle, then release every copy. Destroying
    /// twice is fatal.
    pub fn destroy(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        handle: ResourceHandle,
    ) -> Result<()> {
        if !self.pool.contains(handle) {
            fatal(format!("destroy of stale resource handle {handle:?}"));
        }
        backend.wait_idle()?;
        let resource = self.pool.dealloc(handle);
        if !resource.is_owned() {
            fatal(format!("{handle:?} belongs to a swap chain"));
        }
        release(backend, &resource);
        trace!("Destroyed resource '{}' {handle:?}", resource.desc.debug_label);
        Ok(())
    }

    /// Destroy every owned resource.
    pub fn destroy_all(&mut self, backend: &mut dyn GraphicsBackend) -> Result<()> {
        backend.wait_idle()?;
        for handle in self.pool.handles() {
            let resource = self.pool.dealloc(handle);
            if resource.is_owned() {
                release(backend, &resource);
            }
        }
        Ok(())
    }

    #[track_caller]
    pub fn get(&self, handle: ResourceHandle) -> &Resource {
        self.pool.lookup(handle)
    }

    pub fn contains(&self, handle: ResourceHandle) -> bool {
        self.pool.contains(handle)
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// View the persistently mapped bytes of frame `frame`'s copy.
    #[track_caller]
    pub fn map(&mut self, handle: ResourceHandle, frame: usize) -> &mut [u8] {
        let resource = self.pool.lookup(handle);
        let PhysicalResource::Buffer { allocation, .. } = resource.physical(frame) else {
            fatal(format!("map of image resource {handle:?}"));
        };
        let Some(ptr) = allocation.mapped else {
            fatal(format!(
                "map of device-local resource '{}' {handle:?}",
                resource.desc.debug_label
            ));
        };
        let len = resource.desc.byte_size() as usize;
        // SAFETY: the mapping covers `allocation.size >= len` bytes, lives
        // until the allocator is destroyed and the returned slice borrows
        // the registry mutably.
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) }
    }

    /// Flush frame `frame`'s mapped range. The mapping itself stays.
    pub fn unmap(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        handle: ResourceHandle,
        frame: usize,
    ) -> Result<()> {
        let resource = self.pool.lookup(handle);
        let PhysicalResource::Buffer { allocation, .. } = resource.physical(frame) else {
            fatal(format!("unmap of image resource {handle:?}"));
        };
        if allocation.mapped.is_none() {
            fatal(format!("unmap of device-local resource {handle:?}"));
        }
        backend.flush_mapped_range(allocation.memory, allocation.offset, allocation.size)
    }
}

fn create_buffers(
    backend: &mut dyn GraphicsBackend,
    memory: &mut GpuMemoryAllocator,
    desc: &ResourceDesc,
) -> Result<Vec<PhysicalResource>> {
    if desc.byte_size() == 0 {
        fatal(format!("zero-sized buffer '{}'", desc.debug_label));
    }
    let (usage, class) = buffer_usage_bits(desc.buffer_usage);
    let mut copies = Vec::with_capacity(desc.num_copies());
    for _ in 0..desc.num_copies() {
        match create_buffer(backend, memory, desc.byte_size(), usage, class) {
            Ok(copy) => copies.push(copy),
            Err(e) => {
                for copy in &copies {
                    if let PhysicalResource::Buffer { buffer, .. } = *copy {
                        backend.destroy_buffer(buffer);
                    }
                }
                return Err(e);
            }
        }
    }
    Ok(copies)
}

/// One bound buffer. Nothing is left alive on failure; sub-allocated memory
/// is only reclaimed with its block.
fn create_buffer(
    backend: &mut dyn GraphicsBackend,
    memory: &mut GpuMemoryAllocator,
    size: u64,
    usage: BufferUsageBits,
    class: MemoryClass,
) -> Result<PhysicalResource> {
    let buffer = backend.create_buffer(size, usage)?;
    let requirements = backend.buffer_memory_requirements(buffer);
    let allocation = memory.alloc(class, &requirements);
    if let Err(e) = backend.bind_buffer_memory(buffer, allocation.memory, allocation.offset) {
        backend.destroy_buffer(buffer);
        return Err(e);
    }
    Ok(PhysicalResource::Buffer { buffer, allocation })
}

fn create_image(
    backend: &mut dyn GraphicsBackend,
    memory: &mut GpuMemoryAllocator,
    desc: &ResourceDesc,
) -> Result<PhysicalResource> {
    if matches!(
        desc.image_format,
        ImageFormat::Invalid | ImageFormat::SwapChainFormat
    ) {
        fatal(format!(
            "cannot create image '{}' with format {:?}",
            desc.debug_label, desc.image_format
        ));
    }
    let image = backend.create_image(&ImageCreateInfo {
        width: desc.dims[0],
        height: desc.dims[1],
        array_layers: desc.array_layers.max(1),
        format: desc.image_format,
        usage: desc.image_usage,
    })?;
    let requirements = backend.image_memory_requirements(image);
    let allocation = memory.alloc(MemoryClass::DeviceLocalImages, &requirements);
    let view = backend
        .bind_image_memory(image, allocation.memory, allocation.offset)
        .and_then(|()| {
            backend.create_image_view(image, desc.image_format, desc.array_layers.max(1))
        });
    let view = match view {
        Ok(view) => view,
        Err(e) => {
            backend.destroy_image(image);
            return Err(e);
        }
    };
    Ok(PhysicalResource::Image {
        image,
        view,
        allocation: Some(allocation),
    })
}

fn release(backend: &mut dyn GraphicsBackend, resource: &Resource) {
    for copy in &resource.copies {
        match *copy {
            PhysicalResource::Buffer { buffer, .. } => backend.destroy_buffer(buffer),
            PhysicalResource::Image { image, view, .. } => {
                backend.destroy_image_view(view);
                backend.destroy_image(image);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullBackend;
    use crate::config::GraphicsConfig;

    fn setup() -> (NullBackend, GpuMemoryAllocator, ResourceRegistry) {
        let mut backend = NullBackend::new();
        let memory =
            GpuMemoryAllocator::new(&mut backend, &GraphicsConfig::headless().memory).unwrap();
        (backend, memory, ResourceRegistry::new(16))
    }

    #[test]
    fn failed_second_copy_releases_the_first() {
        let (mut backend, mut memory, mut registry) = setup();
        let control = backend.control();
        let before = control.live_buffers();
        control.fail_call_after("create_buffer", 1);

        let uniform = ResourceDesc::buffer(BufferUsage::Uniform, 64);
        assert_eq!(uniform.num_copies(), 2);
        assert!(registry.create(&mut backend, &mut memory, &uniform).is_err());
        assert_eq!(control.live_buffers(), before);
        assert!(registry.is_empty());
    }

    #[test]
    fn failed_bind_releases_the_buffer() {
        let (mut backend, mut memory, mut registry) = setup();
        let control = backend.control();
        let before = control.live_buffers();
        control.fail_call_after("bind_buffer_memory", 1);

        let transient = ResourceDesc::buffer(BufferUsage::TransientVertex, 64);
        assert!(registry.create(&mut backend, &mut memory, &transient).is_err());
        assert_eq!(control.live_buffers(), before);
    }

    #[test]
    fn failed_view_releases_the_image() {
        let (mut backend, mut memory, mut registry) = setup();
        let control = backend.control();
        control.fail_call_after("create_image_view", 0);

        let desc = ResourceDesc::image_2d(4, 4, ImageFormat::Rgba8Srgb, ImageUsageFlags::SAMPLED);
        assert!(registry.create(&mut backend, &mut memory, &desc).is_err());
        assert_eq!(control.live_images(), 0);
    }

    #[test]
    fn mapped_writes_survive_unmap() {
        let (mut backend, mut memory, mut registry) = setup();
        let handle = registry
            .create(
                &mut backend,
                &mut memory,
                &ResourceDesc::buffer(BufferUsage::Staging, 64),
            )
            .unwrap();

        let bytes: Vec<u8> = (1..=64).collect();
        registry.map(handle, 0).copy_from_slice(&bytes);
        registry.unmap(&mut backend, handle, 0).unwrap();
        assert_eq!(registry.map(handle, 0), &bytes[..]);
    }

    #[test]
    fn multi_buffered_frames_use_distinct_stores() {
        let (mut backend, mut memory, mut registry) = setup();
        let uniform = registry
            .create(
                &mut backend,
                &mut memory,
                &ResourceDesc::buffer(BufferUsage::Uniform, 256),
            )
            .unwrap();
        let staging = registry
            .create(
                &mut backend,
                &mut memory,
                &ResourceDesc::buffer(BufferUsage::Staging, 256),
            )
            .unwrap();

        let resource = registry.get(uniform);
        assert_ne!(resource.buffer(0), resource.buffer(1));
        assert_eq!(resource.buffer(0), resource.buffer(2));
        registry.map(uniform, 0)[0] = 0xAA;
        assert_eq!(registry.map(uniform, 1)[0], 0);

        let resource = registry.get(staging);
        assert_eq!(resource.buffer(0), resource.buffer(1));
        registry.map(staging, 0)[0] = 0xBB;
        assert_eq!(registry.map(staging, 1)[0], 0xBB);
    }

    #[test]
    fn usage_selects_memory_class() {
        let (mut backend, mut memory, mut registry) = setup();
        let before = memory.used(MemoryClass::DeviceLocalBuffers);
        registry
            .create(
                &mut backend,
                &mut memory,
                &ResourceDesc::buffer(BufferUsage::Vertex, 100),
            )
            .unwrap();
        assert_eq!(memory.used(MemoryClass::DeviceLocalBuffers), before + 128);

        let image = registry
            .create(
                &mut backend,
                &mut memory,
                &ResourceDesc::image_2d(
                    4,
                    4,
                    ImageFormat::Rgba8Srgb,
                    ImageUsageFlags::SAMPLED | ImageUsageFlags::TRANSFER_DST,
                ),
            )
            .unwrap();
        assert!(memory.used(MemoryClass::DeviceLocalImages) >= 64);
        assert_eq!(registry.get(image).desc.num_copies(), 1);
    }

    #[test]
    #[should_panic(expected = "map of device-local resource")]
    fn device_local_buffers_cannot_be_mapped() {
        let (mut backend, mut memory, mut registry) = setup();
        let handle = registry
            .create(
                &mut backend,
                &mut memory,
                &ResourceDesc::buffer(BufferUsage::Index, 64),
            )
            .unwrap();
        registry.map(handle, 0);
    }

    #[test]
    fn destroy_waits_idle_and_frees_copies() {
        let (mut backend, mut memory, mut registry) = setup();
        let control = backend.control();
        let handle = registry
            .create(
                &mut backend,
                &mut memory,
                &ResourceDesc::buffer(BufferUsage::TransientVertex, 32),
            )
            .unwrap();
        assert_eq!(control.live_buffers(), 2);
        control.clear_calls();

        registry.destroy(&mut backend, handle).unwrap();
        assert_eq!(control.calls()[0], "wait_idle");
        assert_eq!(control.call_count("destroy_buffer"), 2);
        assert_eq!(control.live_buffers(), 0);
        assert!(!registry.contains(handle));
    }

    #[test]
    #[should_panic(expected = "destroy of stale resource handle")]
    fn double_destroy_is_fatal() {
        let (mut backend, mut memory, mut registry) = setup();
        let handle = registry
            .create(
                &mut backend,
                &mut memory,
                &ResourceDesc::buffer(BufferUsage::Staging, 16),
            )
            .unwrap();
        registry.destroy(&mut backend, handle).unwrap();
        let _ = registry.destroy(&mut backend, handle);
    }

    #[test]
    fn external_images_are_not_destroyed() {
        let (mut backend, _memory, mut registry) = setup();
        let control = backend.control();
        let desc = ResourceDesc::image_2d(
            8,
            8,
            ImageFormat::SwapChainFormat,
            ImageUsageFlags::RENDER_TARGET,
        );
        let handle = registry.register_external_image(&desc, ImageId(900), ImageViewId(901));
        assert!(!registry.get(handle).is_owned());
        control.clear_calls();
        registry.destroy_all(&mut backend).unwrap();
        assert_eq!(control.call_count("destroy_image"), 0);
        assert!(registry.is_empty());
    }
}
