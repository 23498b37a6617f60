//! The device backend seam.
//!
//! The layer above (`GraphicsContext` and its registries) owns every
//! cross-backend policy: handle pools, sub-allocation, multi-buffering,
//! state coalescing, PSO permutations, frame pacing. A backend only
//! creates and destroys raw device objects, records [`DeviceCommand`]s and
//! talks to the queue and presentation engine.
//!
//! Raw objects cross the seam as opaque `u64` ids so the trait stays object
//! safe and the backend is chosen at startup from configuration.

pub mod null;
pub mod vulkan;

use crate::config::BackendKind;
use crate::error::Result;
use bitflags::bitflags;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ptr::NonNull;
use tinker_core::{BindPoint, BlendState, DepthState, DescriptorType, ImageFormat, ImageLayout};
use tinker_core::ImageUsageFlags;

macro_rules! backend_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

backend_id!(
    /// Device memory block.
    MemoryId,
    BufferId,
    ImageId,
    ImageViewId,
    SamplerId,
    DescriptorSetLayoutId,
    DescriptorPoolId,
    DescriptorSetId,
    PipelineLayoutId,
    PipelineId,
    FenceId,
    SemaphoreId,
    CommandBufferId,
    QueryPoolId,
    /// Backend-side swap chain (surface plus images).
    SwapchainId,
);

bitflags! {
    /// Buffer usage as seen by the device.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferUsageBits: u32 {
        const STORAGE = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const TRANSFER_SRC = 1 << 3;
        const TRANSFER_DST = 1 << 4;
    }
}

bitflags! {
    /// Memory access types for barriers.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const SHADER_READ = 1 << 0;
        const SHADER_WRITE = 1 << 1;
        const TRANSFER_WRITE = 1 << 2;
        const COLOR_ATTACHMENT_WRITE = 1 << 3;
        const DEPTH_STENCIL_READ = 1 << 4;
        const DEPTH_STENCIL_WRITE = 1 << 5;
    }
}

bitflags! {
    /// Pipeline stages for barriers and semaphore waits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const FRAGMENT_SHADER = 1 << 1;
        const COMPUTE_SHADER = 1 << 2;
        const TRANSFER = 1 << 3;
        const EARLY_FRAGMENT_TESTS = 1 << 4;
        const LATE_FRAGMENT_TESTS = 1 << 5;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 6;
        const BOTTOM_OF_PIPE = 1 << 7;
    }
}

bitflags! {
    /// Shader stages a layout or push-constant range is visible to.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

/// Which aspect of an image a barrier or clear touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageAspect {
    Color,
    Depth,
}

impl ImageAspect {
    pub const fn for_format(format: ImageFormat) -> Self {
        if format.is_depth() {
            Self::Depth
        } else {
            Self::Color
        }
    }
}

/// Static device properties the layer needs.
#[derive(Clone, Debug)]
pub struct DeviceProperties {
    pub device_name: String,
    /// Granularity of mapped-range flushes.
    pub non_coherent_atom_size: u64,
    /// Nanoseconds per timestamp tick.
    pub timestamp_period: f32,
    pub max_push_constants_size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequest {
    pub size: u64,
    pub memory_type_bits: u32,
    pub host_visible: bool,
}

/// A device memory block, persistently mapped when host visible.
#[derive(Clone, Copy, Debug)]
pub struct DeviceMemory {
    pub memory: MemoryId,
    pub mapped: Option<NonNull<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageCreateInfo {
    pub width: u32,
    pub height: u32,
    pub array_layers: u32,
    pub format: ImageFormat,
    pub usage: ImageUsageFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: u32,
}

/// Per-type capacity of the shared descriptor pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorPoolSizes {
    pub uniform_buffers: u32,
    pub dynamic_uniform_buffers: u32,
    pub sampled_images: u32,
    pub storage_buffers: u32,
    pub storage_images: u32,
}

impl DescriptorPoolSizes {
    pub const fn max_sets(&self) -> u32 {
        self.uniform_buffers
            + self.dynamic_uniform_buffers
            + self.sampled_images
            + self.storage_buffers
            + self.storage_images
    }
}

impl Default for DescriptorPoolSizes {
    fn default() -> Self {
        use tinker_core::limits::descriptor_pool as max;
        Self {
            uniform_buffers: max::MAX_UNIFORM_BUFFERS,
            dynamic_uniform_buffers: max::MAX_DYNAMIC_UNIFORM_BUFFERS,
            sampled_images: max::MAX_SAMPLED_IMAGES + max::MAX_BINDLESS_SAMPLED_IMAGES,
            storage_buffers: max::MAX_STORAGE_BUFFERS,
            storage_images: max::MAX_STORAGE_IMAGES,
        }
    }
}

/// What a descriptor write points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorResource {
    UniformBuffer { buffer: BufferId, range: u64 },
    DynamicUniformBuffer { buffer: BufferId, range: u64 },
    StorageBuffer { buffer: BufferId, range: u64 },
    /// Combined image/sampler read in the shader-read layout.
    SampledImage { view: ImageViewId, sampler: SamplerId },
    /// Storage image accessed in the general layout.
    StorageImage { view: ImageViewId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: DescriptorSetId,
    pub binding: u32,
    pub array_element: u32,
    pub resource: DescriptorResource,
}

/// Everything needed to compile one graphics pipeline permutation.
#[derive(Clone, Copy, Debug)]
pub struct GraphicsPipelineDesc<'a> {
    pub layout: PipelineLayoutId,
    pub vertex_code: &'a [u32],
    pub fragment_code: &'a [u32],
    pub blend: BlendState,
    pub depth: DepthState,
    pub color_formats: &'a [ImageFormat],
    pub depth_format: ImageFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubmitInfo {
    pub command_buffer: CommandBufferId,
    pub wait: Option<(SemaphoreId, PipelineStages)>,
    pub signal: Option<SemaphoreId>,
    pub fence: Option<FenceId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapChainRequest {
    pub width: u32,
    pub height: u32,
    pub image_count: u32,
    pub vsync: bool,
}

/// Images owned by a backend swap chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapChainImages {
    pub swapchain: SwapchainId,
    /// Concrete format behind [`ImageFormat::SwapChainFormat`].
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub images: Vec<(ImageId, ImageViewId)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireStatus {
    Acquired(u32),
    Suboptimal(u32),
    OutOfDate,
    /// No image became available before the acquire timeout.
    NotReady,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Attachments of a dynamic rendering scope. Colors are cleared and stored;
/// the depth attachment (if present) is cleared to `clear_depth`.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderingInfo {
    pub color_views: Vec<ImageViewId>,
    pub depth_view: Option<ImageViewId>,
    pub width: u32,
    pub height: u32,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageId,
    pub aspect: ImageAspect,
    pub layer_count: u32,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub src_stage: PipelineStages,
    pub dst_stage: PipelineStages,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scissor {
    pub offset_x: i32,
    pub offset_y: i32,
    pub width: u32,
    pub height: u32,
}

/// A single command recorded into a backend command buffer.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceCommand {
    BeginRendering(RenderingInfo),
    EndRendering,
    BindPipeline {
        bind_point: BindPoint,
        pipeline: PipelineId,
    },
    BindDescriptorSet {
        bind_point: BindPoint,
        layout: PipelineLayoutId,
        set_index: u32,
        set: DescriptorSetId,
    },
    /// 32-bit indices, offset 0.
    BindIndexBuffer {
        buffer: BufferId,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    PushConstants {
        layout: PipelineLayoutId,
        stages: ShaderStages,
        data: Vec<u8>,
    },
    SetViewport(Viewport),
    SetScissor(Scissor),
    CopyBuffer {
        src: BufferId,
        dst: BufferId,
        size: u64,
    },
    /// Tightly packed copy into an image in the transfer-dst layout.
    CopyBufferToImage {
        src: BufferId,
        dst: ImageId,
        width: u32,
        height: u32,
        layer_count: u32,
    },
    ImageBarrier(ImageBarrier),
    /// Clear in the transfer-dst layout.
    ClearColorImage {
        image: ImageId,
        color: [f32; 4],
        layer_count: u32,
    },
    /// Clear in the transfer-dst layout.
    ClearDepthImage {
        image: ImageId,
        depth: f32,
        layer_count: u32,
    },
    ResetQueryPool {
        pool: QueryPoolId,
        first: u32,
        count: u32,
    },
    /// Written at bottom of pipe.
    WriteTimestamp {
        pool: QueryPoolId,
        query: u32,
    },
    BeginDebugLabel {
        name: &'static str,
    },
    EndDebugLabel,
}

/// A window a swap chain can be created for.
pub trait WindowSource: HasDisplayHandle + HasWindowHandle {}

impl<T: HasDisplayHandle + HasWindowHandle> WindowSource for T {}

/// Raw device operations. One implementation per graphics API, plus the
/// headless [`null::NullBackend`].
pub trait GraphicsBackend {
    fn kind(&self) -> BackendKind;
    fn properties(&self) -> &DeviceProperties;

    /// Block until every queue is idle.
    fn wait_idle(&mut self) -> Result<()>;

    // Memory
    fn allocate_memory(&mut self, request: &MemoryRequest) -> Result<DeviceMemory>;
    fn free_memory(&mut self, memory: MemoryId);
    fn flush_mapped_range(&mut self, memory: MemoryId, offset: u64, size: u64) -> Result<()>;

    // Buffers and images
    fn create_buffer(&mut self, size: u64, usage: BufferUsageBits) -> Result<BufferId>;
    fn buffer_memory_requirements(&self, buffer: BufferId) -> MemoryRequirements;
    fn bind_buffer_memory(&mut self, buffer: BufferId, memory: MemoryId, offset: u64)
        -> Result<()>;
    fn destroy_buffer(&mut self, buffer: BufferId);

    fn create_image(&mut self, info: &ImageCreateInfo) -> Result<ImageId>;
    fn image_memory_requirements(&self, image: ImageId) -> MemoryRequirements;
    fn bind_image_memory(&mut self, image: ImageId, memory: MemoryId, offset: u64) -> Result<()>;
    fn create_image_view(
        &mut self,
        image: ImageId,
        format: ImageFormat,
        array_layers: u32,
    ) -> Result<ImageViewId>;
    fn destroy_image_view(&mut self, view: ImageViewId);
    fn destroy_image(&mut self, image: ImageId);

    /// Linear filtering, repeat addressing.
    fn create_linear_sampler(&mut self) -> Result<SamplerId>;
    fn destroy_sampler(&mut self, sampler: SamplerId);

    // Descriptors
    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorBinding],
    ) -> Result<DescriptorSetLayoutId>;
    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutId);
    fn create_descriptor_pool(&mut self, sizes: &DescriptorPoolSizes) -> Result<DescriptorPoolId>;
    fn destroy_descriptor_pool(&mut self, pool: DescriptorPoolId);
    /// Fails with [`GfxError::DescriptorPoolExhausted`](crate::GfxError) when
    /// the pool has no room.
    fn allocate_descriptor_sets(
        &mut self,
        pool: DescriptorPoolId,
        layout: DescriptorSetLayoutId,
        count: u32,
    ) -> Result<Vec<DescriptorSetId>>;
    fn free_descriptor_sets(&mut self, pool: DescriptorPoolId, sets: &[DescriptorSetId])
        -> Result<()>;
    fn update_descriptor_sets(&mut self, writes: &[DescriptorWrite]);

    // Pipelines
    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[DescriptorSetLayoutId],
        push_constant_size: u32,
        push_constant_stages: ShaderStages,
    ) -> Result<PipelineLayoutId>;
    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutId);
    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>) -> Result<PipelineId>;
    fn create_compute_pipeline(&mut self, layout: PipelineLayoutId, code: &[u32])
        -> Result<PipelineId>;
    fn destroy_pipeline(&mut self, pipeline: PipelineId);

    // Synchronization
    fn create_fence(&mut self, signaled: bool) -> Result<FenceId>;
    fn destroy_fence(&mut self, fence: FenceId);
    /// Unbounded wait.
    fn wait_for_fence(&mut self, fence: FenceId) -> Result<()>;
    fn reset_fence(&mut self, fence: FenceId) -> Result<()>;
    fn create_semaphore(&mut self) -> Result<SemaphoreId>;
    fn destroy_semaphore(&mut self, semaphore: SemaphoreId);

    // Command buffers and submission
    fn allocate_command_buffer(&mut self) -> Result<CommandBufferId>;
    fn free_command_buffer(&mut self, command_buffer: CommandBufferId);
    /// Implicitly resets the buffer.
    fn begin_command_buffer(&mut self, command_buffer: CommandBufferId) -> Result<()>;
    fn end_command_buffer(&mut self, command_buffer: CommandBufferId) -> Result<()>;
    fn record(&mut self, command_buffer: CommandBufferId, command: &DeviceCommand);
    fn submit(&mut self, info: &SubmitInfo) -> Result<()>;
    fn queue_wait_idle(&mut self) -> Result<()>;

    // Timestamp queries
    fn create_timestamp_query_pool(&mut self, count: u32) -> Result<QueryPoolId>;
    fn destroy_query_pool(&mut self, pool: QueryPoolId);
    /// Read `out.len()` results starting at `first`, waiting for them.
    fn timestamp_results(&mut self, pool: QueryPoolId, first: u32, out: &mut [u64])
        -> Result<()>;

    // Presentation
    fn create_swap_chain(
        &mut self,
        request: &SwapChainRequest,
        window: Option<&dyn WindowSource>,
    ) -> Result<SwapChainImages>;
    /// Rebuild the images of an existing swap chain at a new size, keeping
    /// its surface.
    fn resize_swap_chain(
        &mut self,
        swapchain: SwapchainId,
        request: &SwapChainRequest,
    ) -> Result<SwapChainImages>;
    fn destroy_swap_chain(&mut self, swapchain: SwapchainId);
    fn acquire_next_image(
        &mut self,
        swapchain: SwapchainId,
        signal: SemaphoreId,
    ) -> Result<AcquireStatus>;
    fn present(
        &mut self,
        swapchain: SwapchainId,
        image_index: u32,
        wait: SemaphoreId,
    ) -> Result<PresentStatus>;
}
