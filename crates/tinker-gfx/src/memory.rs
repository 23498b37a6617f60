//! GPU memory sub-allocation.
//!
//! Three large blocks are reserved at startup, one per [`MemoryClass`]. The
//! memory type of each block is chosen by probing the requirements of a
//! representative buffer or image. Sub-ranges are handed out by bumping an
//! offset and are never freed individually; blocks are released wholesale
//! at shutdown.

use crate::backend::{
    BufferUsageBits, DeviceMemory, GraphicsBackend, ImageCreateInfo, MemoryId, MemoryRequest,
    MemoryRequirements,
};
use crate::config::MemoryBlockSizes;
use crate::error::{fatal, Result};
use crate::resource::buffer_usage_bits;
use std::ptr::NonNull;
use tinker_core::{BufferUsage, ImageFormat, ImageUsageFlags};
use tracing::{debug, info};

/// Usage class of a memory block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    DeviceLocalBuffers,
    DeviceLocalImages,
    HostVisibleBuffers,
}

impl MemoryClass {
    pub const ALL: [Self; 3] = [
        Self::DeviceLocalBuffers,
        Self::DeviceLocalImages,
        Self::HostVisibleBuffers,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub const fn is_host_visible(self) -> bool {
        matches!(self, Self::HostVisibleBuffers)
    }

    fn reserved_size(self, sizes: &MemoryBlockSizes) -> u64 {
        match self {
            Self::DeviceLocalBuffers => sizes.device_local_buffers,
            Self::DeviceLocalImages => sizes.device_local_images,
            Self::HostVisibleBuffers => sizes.host_visible_buffers,
        }
    }
}

/// One sub-allocated range.
#[derive(Clone, Copy, Debug)]
pub struct Allocation {
    pub class: MemoryClass,
    pub memory: MemoryId,
    pub offset: u64,
    pub size: u64,
    /// Start of the range inside the persistent mapping.
    pub mapped: Option<NonNull<u8>>,
}

#[inline]
const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Bump state of a single block.
#[derive(Debug)]
pub struct BumpBlock {
    memory: MemoryId,
    mapped: Option<NonNull<u8>>,
    memory_type_bits: u32,
    size: u64,
    offset: u64,
    atom_size: u64,
}

impl BumpBlock {
    pub fn new(memory: DeviceMemory, size: u64, memory_type_bits: u32, atom_size: u64) -> Self {
        if !atom_size.is_power_of_two() {
            fatal(format!("non-coherent atom size {atom_size} is not a power of two"));
        }
        Self {
            memory: memory.memory,
            mapped: memory.mapped,
            memory_type_bits,
            size,
            offset: 0,
            atom_size,
        }
    }

    /// Reserve a range satisfying `requirements`. Size and offset are both
    /// rounded up to the atom size. Returns `None` when the block is full.
    pub fn suballocate(&mut self, requirements: &MemoryRequirements) -> Option<(u64, u64)> {
        if !requirements.alignment.is_power_of_two() {
            fatal(format!(
                "memory alignment {} is not a power of two",
                requirements.alignment
            ));
        }
        let alignment = requirements.alignment.max(self.atom_size);
        let size = align_up(requirements.size, self.atom_size);
        let offset = align_up(self.offset, alignment);
        let end = offset.checked_add(size)?;
        if end > self.size {
            return None;
        }
        self.offset = end;
        Some((offset, size))
    }

    #[inline]
    pub const fn used(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub const fn size(&self) -> u64 {
        self.size
    }
}

/// The three reserved blocks.
pub struct GpuMemoryAllocator {
    blocks: [BumpBlock; 3],
}

impl GpuMemoryAllocator {
    /// Probe each memory class and reserve its block.
    pub fn new(backend: &mut dyn GraphicsBackend, sizes: &MemoryBlockSizes) -> Result<Self> {
        let atom_size = backend.properties().non_coherent_atom_size.max(1);
        let mut reserve = |class: MemoryClass| -> Result<BumpBlock> {
            let memory_type_bits = query_memory_type_bits(backend, class)?;
            let size = align_up(class.reserved_size(sizes), atom_size);
            let memory = backend.allocate_memory(&MemoryRequest {
                size,
                memory_type_bits,
                host_visible: class.is_host_visible(),
            })?;
            if class.is_host_visible() && memory.mapped.is_none() {
                fatal(format!("{class:?} block was not mapped"));
            }
            debug!("Reserved {} MiB for {class:?}", size / (1024 * 1024));
            Ok(BumpBlock::new(memory, size, memory_type_bits, atom_size))
        };

        let blocks = [
            reserve(MemoryClass::DeviceLocalBuffers)?,
            reserve(MemoryClass::DeviceLocalImages)?,
            reserve(MemoryClass::HostVisibleBuffers)?,
        ];
        info!(
            "GPU memory blocks reserved (atom size {atom_size}, {} MiB total)",
            blocks.iter().map(BumpBlock::size).sum::<u64>() / (1024 * 1024)
        );
        Ok(Self { blocks })
    }

    /// Sub-allocate from `class`. Running out of block space is fatal.
    pub fn alloc(&mut self, class: MemoryClass, requirements: &MemoryRequirements) -> Allocation {
        let block = &mut self.blocks[class.index()];
        if requirements.memory_type_bits & block.memory_type_bits == 0 {
            fatal(format!(
                "{class:?} block memory type {:#x} not allowed by requirements {:#x}",
                block.memory_type_bits, requirements.memory_type_bits
            ));
        }
        let Some((offset, size)) = block.suballocate(requirements) else {
            fatal(format!(
                "{class:?} block exhausted: {} of {} bytes used, {} requested",
                block.used(),
                block.size(),
                requirements.size
            ));
        };
        let mapped = block.mapped.map(|base| {
            // SAFETY: offset + size lies inside the mapped block.
            unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) }
        });
        Allocation {
            class,
            memory: block.memory,
            offset,
            size,
            mapped,
        }
    }

    pub fn atom_size(&self) -> u64 {
        self.blocks[0].atom_size
    }

    pub fn used(&self, class: MemoryClass) -> u64 {
        self.blocks[class.index()].used()
    }

    pub fn capacity(&self, class: MemoryClass) -> u64 {
        self.blocks[class.index()].size()
    }

    /// Free every block. Allocations handed out earlier become dangling.
    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        for block in self.blocks {
            backend.free_memory(block.memory);
        }
    }
}

/// Union of the usage bits of every buffer usage placed in `class`.
pub fn class_buffer_usage(class: MemoryClass) -> BufferUsageBits {
    BufferUsage::ALL
        .iter()
        .map(|usage| buffer_usage_bits(*usage))
        .filter(|(_, c)| *c == class)
        .fold(BufferUsageBits::empty(), |bits, (usage, _)| bits | usage)
}

fn query_memory_type_bits(backend: &mut dyn GraphicsBackend, class: MemoryClass) -> Result<u32> {
    let requirements = match class {
        MemoryClass::DeviceLocalBuffers | MemoryClass::HostVisibleBuffers => {
            let buffer = backend.create_buffer(256, class_buffer_usage(class))?;
            let requirements = backend.buffer_memory_requirements(buffer);
            backend.destroy_buffer(buffer);
            requirements
        }
        MemoryClass::DeviceLocalImages => {
            let image = backend.create_image(&ImageCreateInfo {
                width: 16,
                height: 16,
                array_layers: 1,
                format: ImageFormat::Rgba8Srgb,
                usage: ImageUsageFlags::SAMPLED | ImageUsageFlags::TRANSFER_DST,
            })?;
            let requirements = backend.image_memory_requirements(image);
            backend.destroy_image(image);
            requirements
        }
    };
    Ok(requirements.memory_type_bits)
}
