//! Graphics device abstraction layer for the Tinker engine.
//!
//! This crate provides:
//! - Generation-counted handle pools
//! - A bump sub-allocator over three reserved device-memory blocks
//! - A resource registry with per-frame copies for transient data
//! - Descriptor layouts and sets, including bindless texture arrays
//! - A deferred command stream and its playback
//! - A lazily compiled pipeline permutation cache
//! - Frames in flight and swap-chain lifecycle
//!
//! Device access goes through [`backend::GraphicsBackend`], implemented by
//! [`backend::vulkan::VulkanBackend`] and the headless
//! [`backend::null::NullBackend`].

pub mod backend;
pub mod command;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod handle;
pub mod memory;
pub mod playback;
pub mod pso;
pub mod resource;
pub mod timestamps;

pub use backend::{GraphicsBackend, WindowSource};
pub use command::{
    descriptor_slots, CommandRecord, CommandStream, DrawCall, GraphicsCommand, RenderPassTargets,
};
pub use config::{BackendKind, GraphicsConfig, MemoryBlockSizes};
pub use context::{DefaultTexture, GraphicsContext};
pub use descriptor::{DescriptorLayout, LayoutBinding};
pub use error::{GfxError, Result};
pub use handle::{
    DescriptorHandle, FramebufferHandle, HandlePool, PoolHandle, ResourceHandle, SwapChainHandle,
};
pub use pso::GraphicsPipelineInfo;
pub use resource::ResourceDesc;
pub use timestamps::TimestampInterval;
