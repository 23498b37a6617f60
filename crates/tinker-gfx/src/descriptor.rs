//! Descriptor layouts and multi-buffered descriptor sets.

use crate::backend::{
    DescriptorBinding, DescriptorPoolId, DescriptorPoolSizes, DescriptorResource,
    DescriptorSetId, DescriptorSetLayoutId, DescriptorWrite, GraphicsBackend, SamplerId,
};
use crate::error::{fatal, GfxError, Result};
use crate::handle::{DescriptorHandle, HandlePool, ResourceHandle};
use crate::resource::ResourceRegistry;
use hashbrown::HashMap;
use tinker_core::limits::{DESCRIPTOR_BINDLESS_ARRAY_LIMIT, MAX_BINDINGS_PER_SET, MAX_FRAMES_IN_FLIGHT};
use tinker_core::{DescUpdateConfigFlags, DescriptorLayoutId, DescriptorType};
use tracing::{debug, info};

/// Descriptor sets the shared pool can hold before it must be recreated.
const DESCRIPTOR_POOL_CAPACITY: u32 = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutBinding {
    pub ty: DescriptorType,
    /// Array length; 1 for everything except bindless arrays.
    pub count: u32,
}

impl LayoutBinding {
    pub const fn new(ty: DescriptorType) -> Self {
        Self { ty, count: 1 }
    }

    /// A bindless array of sampled images.
    pub const fn texture_array(count: u32) -> Self {
        Self {
            ty: DescriptorType::ArrayOfTextures,
            count,
        }
    }
}

/// Up to [`MAX_BINDINGS_PER_SET`] bindings. Bindings end at the first `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorLayout {
    pub bindings: [Option<LayoutBinding>; MAX_BINDINGS_PER_SET],
}

impl DescriptorLayout {
    #[track_caller]
    pub fn new(bindings: &[LayoutBinding]) -> Self {
        if bindings.len() > MAX_BINDINGS_PER_SET {
            fatal(format!(
                "{} bindings exceed the per-set limit of {MAX_BINDINGS_PER_SET}",
                bindings.len()
            ));
        }
        let mut layout = Self::default();
        for (slot, binding) in layout.bindings.iter_mut().zip(bindings) {
            *slot = Some(*binding);
        }
        layout
    }

    /// Bindings up to the first empty slot.
    pub fn active(&self) -> impl Iterator<Item = LayoutBinding> + '_ {
        self.bindings.iter().map_while(|binding| *binding)
    }
}

struct LayoutEntry {
    layout: DescriptorLayout,
    set_layout: DescriptorSetLayoutId,
}

struct DescriptorEntry {
    layout_id: DescriptorLayoutId,
    sets: [DescriptorSetId; MAX_FRAMES_IN_FLIGHT],
}

/// Layouts by id, the shared pool, and every descriptor set handle.
pub struct DescriptorSystem {
    layouts: HashMap<DescriptorLayoutId, LayoutEntry>,
    pool: Option<DescriptorPoolId>,
    pool_sizes: DescriptorPoolSizes,
    descriptors: HandlePool<DescriptorHandle, DescriptorEntry>,
    sampler: SamplerId,
}

impl DescriptorSystem {
    /// Creates the linear sampler used by sampled-image writes. The pool is
    /// created with the first descriptor.
    pub fn new(backend: &mut dyn GraphicsBackend) -> Result<Self> {
        Ok(Self {
            layouts: HashMap::new(),
            pool: None,
            pool_sizes: DescriptorPoolSizes::default(),
            descriptors: HandlePool::with_capacity(DESCRIPTOR_POOL_CAPACITY),
            sampler: backend.create_linear_sampler()?,
        })
    }

    /// Tag descriptor handles issued from now on with `epoch`.
    pub fn start_epoch(&mut self, epoch: u32) {
        self.descriptors.start_epoch(epoch);
    }

    pub fn sampler(&self) -> SamplerId {
        self.sampler
    }

    /// Register layout `id`. Empty layouts and duplicate ids are fatal.
    pub fn create_layout(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        id: DescriptorLayoutId,
        layout: &DescriptorLayout,
    ) -> Result<()> {
        let bindings: Vec<DescriptorBinding> = layout
            .active()
            .enumerate()
            .map(|(i, binding)| DescriptorBinding {
                binding: i as u32,
                ty: binding.ty,
                count: if binding.ty == DescriptorType::ArrayOfTextures {
                    binding.count.clamp(1, DESCRIPTOR_BINDLESS_ARRAY_LIMIT)
                } else {
                    1
                },
            })
            .collect();
        if bindings.is_empty() {
            fatal(format!("descriptor layout {id} has zero bindings"));
        }
        if self.layouts.contains_key(&id) {
            fatal(format!("descriptor layout {id} already exists"));
        }
        let set_layout = backend.create_descriptor_set_layout(&bindings)?;
        self.layouts.insert(
            id,
            LayoutEntry {
                layout: *layout,
                set_layout,
            },
        );
        debug!("Created descriptor layout {id} ({} bindings)", bindings.len());
        Ok(())
    }

    /// Backend set layout for `id`; unknown ids are fatal.
    #[track_caller]
    pub fn set_layout(&self, id: DescriptorLayoutId) -> DescriptorSetLayoutId {
        self.layout_entry(id).set_layout
    }

    pub fn has_layout(&self, id: DescriptorLayoutId) -> bool {
        self.layouts.contains_key(&id)
    }

    /// Allocate one set per frame in flight. Running out of pool space is
    /// fatal.
    pub fn create_descriptor(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        layout_id: DescriptorLayoutId,
    ) -> Result<DescriptorHandle> {
        let set_layout = self.layout_entry(layout_id).set_layout;
        let pool = match self.pool {
            Some(pool) => pool,
            None => {
                let pool = backend.create_descriptor_pool(&self.pool_sizes)?;
                info!(
                    "Created descriptor pool ({} sets max)",
                    self.pool_sizes.max_sets()
                );
                *self.pool.insert(pool)
            }
        };
        let sets = match backend.allocate_descriptor_sets(
            pool,
            set_layout,
            MAX_FRAMES_IN_FLIGHT as u32,
        ) {
            Ok(sets) => sets,
            Err(GfxError::DescriptorPoolExhausted) => {
                fatal(format!("descriptor pool exhausted allocating layout {layout_id}"))
            }
            Err(err) => return Err(err),
        };
        let Ok(sets) = <[DescriptorSetId; MAX_FRAMES_IN_FLIGHT]>::try_from(sets) else {
            fatal("backend returned the wrong number of descriptor sets");
        };
        Ok(self.descriptors.alloc(DescriptorEntry { layout_id, sets }))
    }

    /// Physical set of `handle` for virtual frame `frame`.
    #[track_caller]
    pub fn set(&self, handle: DescriptorHandle, frame: usize) -> DescriptorSetId {
        self.descriptors.lookup(handle).sets[frame % MAX_FRAMES_IN_FLIGHT]
    }

    pub fn layout_of(&self, handle: DescriptorHandle) -> DescriptorLayoutId {
        self.descriptors.lookup(handle).layout_id
    }

    /// Bind `resources[i]` to binding `i` in every frame's set, using the
    /// frame-appropriate copy of each resource.
    pub fn write_simple(
        &self,
        backend: &mut dyn GraphicsBackend,
        resources: &ResourceRegistry,
        handle: DescriptorHandle,
        bound: &[ResourceHandle],
    ) {
        let entry = self.descriptors.lookup(handle);
        let layout = self.layout_entry(entry.layout_id).layout;
        let num_bindings = layout.active().count();
        if bound.len() < num_bindings {
            fatal(format!(
                "layout {} has {num_bindings} bindings but {} resources were given",
                entry.layout_id,
                bound.len()
            ));
        }

        let mut writes = Vec::with_capacity(num_bindings * MAX_FRAMES_IN_FLIGHT);
        for (frame, set) in entry.sets.iter().enumerate() {
            for (binding, (slot, resource)) in layout.active().zip(bound).enumerate() {
                let resource = resources.get(*resource);
                let range = resource.desc.byte_size();
                let target = match slot.ty {
                    DescriptorType::Buffer => DescriptorResource::UniformBuffer {
                        buffer: resource.buffer(frame),
                        range,
                    },
                    DescriptorType::DynamicBuffer => DescriptorResource::DynamicUniformBuffer {
                        buffer: resource.buffer(frame),
                        range,
                    },
                    DescriptorType::Ssbo => DescriptorResource::StorageBuffer {
                        buffer: resource.buffer(frame),
                        range,
                    },
                    DescriptorType::SampledImage => DescriptorResource::SampledImage {
                        view: resource.image(frame).1,
                        sampler: self.sampler,
                    },
                    DescriptorType::StorageImage => DescriptorResource::StorageImage {
                        view: resource.image(frame).1,
                    },
                    DescriptorType::ArrayOfTextures => fatal(format!(
                        "binding {binding} of layout {} is a texture array; use write_array",
                        entry.layout_id
                    )),
                };
                writes.push(DescriptorWrite {
                    set: *set,
                    binding: binding as u32,
                    array_element: 0,
                    resource: target,
                });
            }
        }
        backend.update_descriptor_sets(&writes);
    }

    /// Write `textures[i]` into element `i` of the texture array at binding
    /// 0. With [`DescUpdateConfigFlags::TRANSIENT`] only frame
    /// `current_frame`'s set is touched.
    pub fn write_array(
        &self,
        backend: &mut dyn GraphicsBackend,
        resources: &ResourceRegistry,
        handle: DescriptorHandle,
        textures: &[ResourceHandle],
        flags: DescUpdateConfigFlags,
        current_frame: usize,
    ) {
        let entry = self.descriptors.lookup(handle);
        let layout = self.layout_entry(entry.layout_id).layout;
        let Some(LayoutBinding {
            ty: DescriptorType::ArrayOfTextures,
            count,
        }) = layout.bindings[0]
        else {
            fatal(format!(
                "layout {} binding 0 is not a texture array",
                entry.layout_id
            ));
        };
        if textures.len() as u32 > count {
            fatal(format!(
                "{} textures exceed the array length {count}",
                textures.len()
            ));
        }

        let frames: Vec<usize> = if flags.contains(DescUpdateConfigFlags::TRANSIENT) {
            vec![current_frame % MAX_FRAMES_IN_FLIGHT]
        } else {
            (0..MAX_FRAMES_IN_FLIGHT).collect()
        };
        let writes: Vec<DescriptorWrite> = frames
            .into_iter()
            .flat_map(|frame| {
                textures.iter().enumerate().map(move |(element, texture)| {
                    (frame, element as u32, *texture)
                })
            })
            .map(|(frame, element, texture)| DescriptorWrite {
                set: entry.sets[frame],
                binding: 0,
                array_element: element,
                resource: DescriptorResource::SampledImage {
                    view: resources.get(texture).image(frame).1,
                    sampler: self.sampler,
                },
            })
            .collect();
        backend.update_descriptor_sets(&writes);
    }

    /// Wait idle, then return `handle`'s sets to the pool.
    pub fn destroy_descriptor(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        handle: DescriptorHandle,
    ) -> Result<()> {
        if !self.descriptors.contains(handle) {
            fatal(format!("destroy of stale descriptor handle {handle:?}"));
        }
        backend.wait_idle()?;
        let entry = self.descriptors.dealloc(handle);
        self.free_sets(backend, &entry.sets)
    }

    /// Free every descriptor set. Layouts and the pool stay.
    pub fn destroy_all_descriptors(&mut self, backend: &mut dyn GraphicsBackend) -> Result<()> {
        backend.wait_idle()?;
        for handle in self.descriptors.handles() {
            let entry = self.descriptors.dealloc(handle);
            self.free_sets(backend, &entry.sets)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Release sets, layouts, the pool and the sampler.
    pub fn destroy(mut self, backend: &mut dyn GraphicsBackend) -> Result<()> {
        self.destroy_all_descriptors(backend)?;
        for (_, entry) in self.layouts.drain() {
            backend.destroy_descriptor_set_layout(entry.set_layout);
        }
        if let Some(pool) = self.pool.take() {
            backend.destroy_descriptor_pool(pool);
        }
        backend.destroy_sampler(self.sampler);
        Ok(())
    }

    fn free_sets(&self, backend: &mut dyn GraphicsBackend, sets: &[DescriptorSetId]) -> Result<()> {
        match self.pool {
            Some(pool) => backend.free_descriptor_sets(pool, sets),
            None => Ok(()),
        }
    }

    #[track_caller]
    fn layout_entry(&self, id: DescriptorLayoutId) -> &LayoutEntry {
        match self.layouts.get(&id) {
            Some(entry) => entry,
            None => fatal(format!("unknown descriptor layout {id}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullBackend;
    use crate::config::GraphicsConfig;
    use crate::memory::GpuMemoryAllocator;
    use crate::resource::ResourceDesc;
    use tinker_core::{BufferUsage, ImageFormat, ImageUsageFlags};

    struct Fixture {
        backend: NullBackend,
        memory: GpuMemoryAllocator,
        resources: ResourceRegistry,
        descriptors: DescriptorSystem,
    }

    fn fixture() -> Fixture {
        let mut backend = NullBackend::new();
        let memory =
            GpuMemoryAllocator::new(&mut backend, &GraphicsConfig::headless().memory).unwrap();
        let descriptors = DescriptorSystem::new(&mut backend).unwrap();
        Fixture {
            backend,
            memory,
            resources: ResourceRegistry::new(32),
            descriptors,
        }
    }

    impl Fixture {
        fn resource(&mut self, desc: ResourceDesc) -> ResourceHandle {
            self.resources
                .create(&mut self.backend, &mut self.memory, &desc)
                .unwrap()
        }

        fn texture(&mut self) -> ResourceHandle {
            self.resource(ResourceDesc::image_2d(
                2,
                2,
                ImageFormat::Rgba8Srgb,
                ImageUsageFlags::SAMPLED,
            ))
        }
    }

    #[test]
    fn layout_stops_at_first_empty_binding() {
        let mut layout = DescriptorLayout::default();
        layout.bindings[0] = Some(LayoutBinding::new(DescriptorType::Buffer));
        layout.bindings[2] = Some(LayoutBinding::new(DescriptorType::Ssbo));
        assert_eq!(layout.active().count(), 1);
    }

    #[test]
    #[should_panic(expected = "zero bindings")]
    fn empty_layout_is_fatal() {
        let mut f = fixture();
        f.descriptors
            .create_layout(&mut f.backend, 0, &DescriptorLayout::default())
            .unwrap();
    }

    #[test]
    #[should_panic(expected = "already exists")]
    fn duplicate_layout_is_fatal() {
        let mut f = fixture();
        let layout = DescriptorLayout::new(&[LayoutBinding::new(DescriptorType::Buffer)]);
        f.descriptors.create_layout(&mut f.backend, 3, &layout).unwrap();
        f.descriptors.create_layout(&mut f.backend, 3, &layout).unwrap();
    }

    #[test]
    fn simple_write_covers_every_frame() {
        let mut f = fixture();
        let control = f.backend.control();
        let layout = DescriptorLayout::new(&[
            LayoutBinding::new(DescriptorType::Buffer),
            LayoutBinding::new(DescriptorType::SampledImage),
        ]);
        f.descriptors.create_layout(&mut f.backend, 1, &layout).unwrap();
        let handle = f.descriptors.create_descriptor(&mut f.backend, 1).unwrap();
        let uniform = f.resource(ResourceDesc::buffer(BufferUsage::Uniform, 64));
        let texture = f.texture();

        f.descriptors
            .write_simple(&mut f.backend, &f.resources, handle, &[uniform, texture]);

        let writes = control.descriptor_writes();
        assert_eq!(writes.len(), 4);
        let uniform = f.resources.get(uniform);
        for frame in 0..MAX_FRAMES_IN_FLIGHT {
            let set = f.descriptors.set(handle, frame);
            let frame_writes: Vec<_> = writes.iter().filter(|w| w.set == set).collect();
            assert_eq!(frame_writes.len(), 2);
            assert_eq!(
                frame_writes[0].resource,
                DescriptorResource::UniformBuffer {
                    buffer: uniform.buffer(frame),
                    range: 64
                }
            );
            assert!(matches!(
                frame_writes[1].resource,
                DescriptorResource::SampledImage { sampler, .. } if sampler == f.descriptors.sampler()
            ));
        }
    }

    #[test]
    #[should_panic(expected = "use write_array")]
    fn simple_write_rejects_texture_arrays() {
        let mut f = fixture();
        let layout = DescriptorLayout::new(&[LayoutBinding::texture_array(4)]);
        f.descriptors.create_layout(&mut f.backend, 1, &layout).unwrap();
        let handle = f.descriptors.create_descriptor(&mut f.backend, 1).unwrap();
        let texture = f.texture();
        f.descriptors
            .write_simple(&mut f.backend, &f.resources, handle, &[texture]);
    }

    #[test]
    fn transient_array_write_touches_current_frame_only() {
        let mut f = fixture();
        let control = f.backend.control();
        let layout = DescriptorLayout::new(&[LayoutBinding::texture_array(8)]);
        f.descriptors.create_layout(&mut f.backend, 2, &layout).unwrap();
        let handle = f.descriptors.create_descriptor(&mut f.backend, 2).unwrap();
        let textures = [f.texture(), f.texture(), f.texture()];

        f.descriptors.write_array(
            &mut f.backend,
            &f.resources,
            handle,
            &textures,
            DescUpdateConfigFlags::TRANSIENT,
            1,
        );
        let writes = control.descriptor_writes();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|w| w.set == f.descriptors.set(handle, 1)));
        let elements: Vec<_> = writes.iter().map(|w| w.array_element).collect();
        assert_eq!(elements, vec![0, 1, 2]);

        f.descriptors.write_array(
            &mut f.backend,
            &f.resources,
            handle,
            &textures,
            DescUpdateConfigFlags::empty(),
            1,
        );
        assert_eq!(control.descriptor_writes().len(), 3 + 6);
    }

    #[test]
    fn destroy_returns_sets_to_pool() {
        let mut f = fixture();
        let control = f.backend.control();
        let layout = DescriptorLayout::new(&[LayoutBinding::new(DescriptorType::Ssbo)]);
        f.descriptors.create_layout(&mut f.backend, 0, &layout).unwrap();
        let a = f.descriptors.create_descriptor(&mut f.backend, 0).unwrap();
        let _b = f.descriptors.create_descriptor(&mut f.backend, 0).unwrap();
        assert_eq!(control.live_descriptor_sets(), 4);

        f.descriptors.destroy_descriptor(&mut f.backend, a).unwrap();
        assert_eq!(control.live_descriptor_sets(), 2);
        f.descriptors.destroy_all_descriptors(&mut f.backend).unwrap();
        assert_eq!(control.live_descriptor_sets(), 0);
        assert!(f.descriptors.is_empty());
        assert_eq!(control.call_count("create_descriptor_pool"), 1);
    }
}
