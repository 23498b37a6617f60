//! Engine-wide limits.

/// Frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;
/// Swap-chain image count requested from the presentation engine.
pub const DESIRED_NUM_SWAP_CHAIN_IMAGES: u32 = 2;
/// Color attachments per render pass.
pub const MAX_MULTIPLE_RENDERTARGETS: usize = 8;

/// Descriptor sets a single shader may bind.
pub const MAX_DESCRIPTOR_SETS_PER_SHADER: usize = 4;
/// Bindings per descriptor layout.
pub const MAX_BINDINGS_PER_SET: usize = 3;
/// Entries in a bindless array-of-textures binding.
pub const DESCRIPTOR_BINDLESS_ARRAY_LIMIT: u32 = 1024;

/// Timestamp queries per frame in flight.
pub const GPU_TIMESTAMP_NUM_MAX: u32 = 1024;

/// Minimum push-constant space a device must offer.
pub const MIN_PUSH_CONSTANTS_SIZE: u32 = 128;
/// Push-constant payload carried by one command.
pub const PUSH_CONSTANT_LIMIT_BYTES: usize = 32;

/// Default capacity of the resource pool.
pub const RESOURCE_POOL_MAX: u32 = 512;
/// Initial capacity of the growable swap-chain pool.
pub const NUM_SWAP_CHAINS_STARTING_ALLOC_SIZE: u32 = 16;

/// Descriptor pool sizing.
pub mod descriptor_pool {
    pub const MAX_UNIFORM_BUFFERS: u32 = 64;
    pub const MAX_DYNAMIC_UNIFORM_BUFFERS: u32 = 64;
    pub const MAX_SAMPLED_IMAGES: u32 = 64;
    pub const MAX_STORAGE_BUFFERS: u32 = 64;
    pub const MAX_STORAGE_IMAGES: u32 = 64;
    /// Room for one full bindless array per frame in flight.
    pub const MAX_BINDLESS_SAMPLED_IMAGES: u32 =
        super::DESCRIPTOR_BINDLESS_ARRAY_LIMIT * super::MAX_FRAMES_IN_FLIGHT as u32;
}
