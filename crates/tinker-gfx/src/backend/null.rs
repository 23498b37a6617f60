//! Headless backend that simulates a device on the CPU.
//!
//! Memory blocks are real host allocations, so data written through a
//! mapping and moved by copy commands can be read back. Recorded commands
//! are kept per command buffer and executed at submit. Fences block on a
//! condition variable; [`NullControl`] can signal them from another thread
//! and inject presentation failures.

use super::{
    AcquireStatus, BufferId, BufferUsageBits, CommandBufferId, DescriptorBinding,
    DescriptorPoolId, DescriptorPoolSizes, DescriptorSetId, DescriptorSetLayoutId,
    DescriptorWrite, DeviceCommand, DeviceMemory, DeviceProperties, FenceId, GraphicsBackend,
    GraphicsPipelineDesc, ImageCreateInfo, ImageId, ImageViewId, MemoryId, MemoryRequest,
    MemoryRequirements, PipelineId, PipelineLayoutId, PresentStatus, QueryPoolId, SamplerId,
    SemaphoreId, ShaderStages, SubmitInfo, SwapChainImages, SwapChainRequest, SwapchainId,
    WindowSource,
};
use crate::config::BackendKind;
use crate::error::{fatal, GfxError, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::ptr::NonNull;
use std::sync::Arc;
use tinker_core::{BlendState, ImageFormat};
use tracing::{debug, trace};

const BUFFER_ALIGNMENT: u64 = 16;
const IMAGE_ALIGNMENT: u64 = 256;
const TICKS_PER_COMMAND: u64 = 1000;

/// A host allocation standing in for device memory.
struct SimMemory {
    ptr: NonNull<u8>,
    len: usize,
    host_visible: bool,
}

// SAFETY: the allocation is only touched through raw pointers while the
// state mutex is held, or by the owner of the mapping it handed out.
unsafe impl Send for SimMemory {}

impl SimMemory {
    fn new(len: usize, host_visible: bool) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len.max(1)].into_boxed_slice();
        let raw = Box::into_raw(boxed).cast::<u8>();
        Self {
            // SAFETY: Box::into_raw never returns null.
            ptr: unsafe { NonNull::new_unchecked(raw) },
            len: len.max(1),
            host_visible,
        }
    }
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // SAFETY: produced by Box::into_raw in `new` with the same length.
        drop(unsafe { Box::from_raw(slice) });
    }
}

struct SimBuffer {
    size: u64,
    usage: BufferUsageBits,
    binding: Option<(MemoryId, u64)>,
}

struct SimImage {
    info: ImageCreateInfo,
    binding: Option<(MemoryId, u64)>,
    /// Owned by a swap chain.
    presentable: bool,
}

impl SimImage {
    fn byte_size(&self) -> u64 {
        u64::from(self.info.width)
            * u64::from(self.info.height)
            * u64::from(self.info.array_layers.max(1))
            * u64::from(self.info.format.bytes_per_pixel().unwrap_or(4))
    }
}

struct SimPool {
    remaining_sets: u32,
    live_sets: HashSet<u64>,
}

struct SimCommandBuffer {
    commands: Vec<DeviceCommand>,
    recording: bool,
}

struct SimSwapchain {
    images: Vec<(ImageId, ImageViewId)>,
    next_image: u32,
    width: u32,
    height: u32,
}

#[derive(Default)]
struct State {
    next_id: u64,
    memories: HashMap<u64, SimMemory>,
    buffers: HashMap<u64, SimBuffer>,
    images: HashMap<u64, SimImage>,
    views: HashMap<u64, ImageId>,
    samplers: HashSet<u64>,
    set_layouts: HashMap<u64, Vec<DescriptorBinding>>,
    pools: HashMap<u64, SimPool>,
    sets: HashMap<u64, DescriptorPoolId>,
    pipeline_layouts: HashMap<u64, (Vec<DescriptorSetLayoutId>, u32, ShaderStages)>,
    pipelines: HashMap<u64, PipelineLayoutId>,
    fences: HashMap<u64, bool>,
    semaphores: HashSet<u64>,
    command_buffers: HashMap<u64, SimCommandBuffer>,
    query_pools: HashMap<u64, Vec<u64>>,
    swapchains: HashMap<u64, SimSwapchain>,
    clock: u64,

    hold_fences: bool,
    pending_out_of_date: u32,
    pending_not_ready: u32,
    /// Calls that fail once after the given number of further successes.
    injected_failures: Vec<(&'static str, u32)>,
    calls: Vec<&'static str>,
    submissions: Vec<Vec<DeviceCommand>>,
    descriptor_writes: Vec<DescriptorWrite>,
    presents: Vec<(SwapchainId, u32)>,
}

impl State {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn log(&mut self, call: &'static str) {
        trace!(call, "null backend");
        self.calls.push(call);
    }

    fn injected_failure(&mut self, call: &'static str) -> Result<()> {
        let Some(pos) = self.injected_failures.iter().position(|(c, _)| *c == call) else {
            return Ok(());
        };
        let remaining = &mut self.injected_failures[pos].1;
        if *remaining > 0 {
            *remaining -= 1;
            return Ok(());
        }
        self.injected_failures.remove(pos);
        Err(GfxError::Other(format!("injected {call} failure")))
    }

    fn host_range(&self, binding: Option<(MemoryId, u64)>, len: u64) -> Result<*mut u8> {
        let (memory, offset) =
            binding.ok_or_else(|| GfxError::InvalidState("object has no memory bound".into()))?;
        let block = self
            .memories
            .get(&memory.0)
            .ok_or_else(|| GfxError::InvalidState(format!("unknown memory {memory:?}")))?;
        if offset + len > block.len as u64 {
            return Err(GfxError::InvalidState(format!(
                "range {offset}+{len} outside memory {memory:?} of {} bytes",
                block.len
            )));
        }
        // SAFETY: bounds checked above.
        Ok(unsafe { block.ptr.as_ptr().add(offset as usize) })
    }

    fn buffer_range(&self, buffer: BufferId, len: u64) -> Result<*mut u8> {
        let sim = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| GfxError::InvalidState(format!("unknown buffer {buffer:?}")))?;
        if len > sim.size {
            return Err(GfxError::InvalidState(format!(
                "{len} bytes exceed {buffer:?} of {} bytes",
                sim.size
            )));
        }
        self.host_range(sim.binding, len)
    }

    fn image(&self, image: ImageId) -> Result<&SimImage> {
        self.images
            .get(&image.0)
            .ok_or_else(|| GfxError::InvalidState(format!("unknown image {image:?}")))
    }

    /// Run the side effects the simulation models.
    fn execute(&mut self, commands: &[DeviceCommand]) -> Result<()> {
        for command in commands {
            match command {
                DeviceCommand::CopyBuffer { src, dst, size } => {
                    let from = self.buffer_range(*src, *size)?;
                    let to = self.buffer_range(*dst, *size)?;
                    // SAFETY: both ranges are bounds checked; ptr::copy
                    // tolerates overlap inside a shared block.
                    unsafe { std::ptr::copy(from, to, *size as usize) };
                }
                DeviceCommand::CopyBufferToImage {
                    src,
                    dst,
                    width,
                    height,
                    layer_count,
                } => {
                    let len = u64::from(*width) * u64::from(*height) * u64::from(*layer_count) * 4;
                    let image = self.image(*dst)?;
                    if len > image.byte_size() {
                        return Err(GfxError::InvalidState(format!(
                            "copy of {len} bytes exceeds image {dst:?}"
                        )));
                    }
                    let to = self.host_range(image.binding, len)?;
                    let from = self.buffer_range(*src, len)?;
                    // SAFETY: both ranges are bounds checked.
                    unsafe { std::ptr::copy(from, to, len as usize) };
                }
                DeviceCommand::ClearColorImage { image, color, .. } => {
                    let sim = self.image(*image)?;
                    if sim.presentable || sim.binding.is_none() {
                        continue;
                    }
                    let texel = match sim.info.format {
                        ImageFormat::Bgra8Srgb => {
                            let [r, g, b, a] = (*color).map(unorm8);
                            vec![b, g, r, a]
                        }
                        ImageFormat::Rgba8Srgb => (*color).map(unorm8).to_vec(),
                        _ => continue,
                    };
                    self.fill(*image, &texel)?;
                }
                DeviceCommand::ClearDepthImage { image, depth, .. } => {
                    self.fill(*image, &depth.to_le_bytes())?;
                }
                DeviceCommand::ResetQueryPool { pool, first, count } => {
                    if let Some(results) = self.query_pools.get_mut(&pool.0) {
                        let end = (*first + *count) as usize;
                        let len = results.len();
                        results[*first as usize..end.min(len)].fill(0);
                    }
                }
                DeviceCommand::WriteTimestamp { pool, query } => {
                    self.clock += TICKS_PER_COMMAND;
                    let now = self.clock;
                    if let Some(slot) = self
                        .query_pools
                        .get_mut(&pool.0)
                        .and_then(|results| results.get_mut(*query as usize))
                    {
                        *slot = now;
                    }
                }
                _ => self.clock += TICKS_PER_COMMAND,
            }
        }
        Ok(())
    }

    fn fill(&self, image: ImageId, texel: &[u8]) -> Result<()> {
        let sim = self.image(image)?;
        let len = sim.byte_size();
        let base = self.host_range(sim.binding, len)?;
        for (i, byte) in texel.iter().cycle().take(len as usize).enumerate() {
            // SAFETY: i < len, which host_range bounds checked.
            unsafe { *base.add(i) = *byte };
        }
        Ok(())
    }
}

fn unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

struct Shared {
    state: Mutex<State>,
    fence_signaled: Condvar,
}

/// CPU-simulated device.
pub struct NullBackend {
    properties: DeviceProperties,
    shared: Arc<Shared>,
}

/// Test hooks into a [`NullBackend`], usable from any thread.
#[derive(Clone)]
pub struct NullControl {
    shared: Arc<Shared>,
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NullBackend {
    pub fn new() -> Self {
        debug!("Creating null backend");
        Self {
            properties: DeviceProperties {
                device_name: "Null Device".to_string(),
                non_coherent_atom_size: 64,
                timestamp_period: 1.0,
                max_push_constants_size: 256,
            },
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                fence_signaled: Condvar::new(),
            }),
        }
    }

    pub fn control(&self) -> NullControl {
        NullControl {
            shared: Arc::clone(&self.shared),
        }
    }

    fn lock(&self, call: &'static str) -> MutexGuard<'_, State> {
        let mut state = self.shared.state.lock();
        state.log(call);
        state
    }
}

impl NullControl {
    /// Signal every fence and wake blocked waiters.
    pub fn signal_all_fences(&self) {
        let mut state = self.shared.state.lock();
        state.fences.values_mut().for_each(|signaled| *signaled = true);
        drop(state);
        self.shared.fence_signaled.notify_all();
    }

    /// While set, submitted fences stay unsignaled until
    /// [`signal_all_fences`](Self::signal_all_fences).
    pub fn hold_fences(&self, hold: bool) {
        self.shared.state.lock().hold_fences = hold;
    }

    /// Make the next acquire report an out-of-date swap chain.
    pub fn inject_out_of_date(&self) {
        self.shared.state.lock().pending_out_of_date += 1;
    }

    /// Make the next acquire time out without an image.
    pub fn inject_acquire_timeout(&self) {
        self.shared.state.lock().pending_not_ready += 1;
    }

    /// Let `call` succeed `successes` more times, then fail once.
    pub fn fail_call_after(&self, call: &'static str, successes: u32) {
        self.shared
            .state
            .lock()
            .injected_failures
            .push((call, successes));
    }

    /// Every backend call made so far, by name.
    pub fn calls(&self) -> Vec<&'static str> {
        self.shared.state.lock().calls.clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.shared
            .state
            .lock()
            .calls
            .iter()
            .filter(|c| **c == call)
            .count()
    }

    pub fn clear_calls(&self) {
        self.shared.state.lock().calls.clear();
    }

    /// Command lists of every submitted command buffer, in submit order.
    pub fn submissions(&self) -> Vec<Vec<DeviceCommand>> {
        self.shared.state.lock().submissions.clone()
    }

    /// Commands currently recorded in `command_buffer`.
    pub fn recorded(&self, command_buffer: CommandBufferId) -> Vec<DeviceCommand> {
        self.shared
            .state
            .lock()
            .command_buffers
            .get(&command_buffer.0)
            .map(|cb| cb.commands.clone())
            .unwrap_or_default()
    }

    pub fn descriptor_writes(&self) -> Vec<DescriptorWrite> {
        self.shared.state.lock().descriptor_writes.clone()
    }

    /// Presented (swap chain, image index) pairs.
    pub fn presents(&self) -> Vec<(SwapchainId, u32)> {
        self.shared.state.lock().presents.clone()
    }

    pub fn live_buffers(&self) -> usize {
        self.shared.state.lock().buffers.len()
    }

    /// Images not owned by a swap chain.
    pub fn live_images(&self) -> usize {
        self.shared
            .state
            .lock()
            .images
            .values()
            .filter(|image| !image.presentable)
            .count()
    }

    pub fn live_pipelines(&self) -> usize {
        self.shared.state.lock().pipelines.len()
    }

    pub fn live_descriptor_sets(&self) -> usize {
        self.shared.state.lock().sets.len()
    }

    pub fn live_fences(&self) -> usize {
        self.shared.state.lock().fences.len()
    }

    pub fn live_memory_blocks(&self) -> usize {
        self.shared.state.lock().memories.len()
    }

    /// Copy `len` bytes out of a buffer's backing memory.
    pub fn read_buffer(&self, buffer: BufferId, len: u64) -> Result<Vec<u8>> {
        let state = self.shared.state.lock();
        let ptr = state.buffer_range(buffer, len)?;
        // SAFETY: buffer_range bounds checked `len`.
        Ok(unsafe { std::slice::from_raw_parts(ptr, len as usize) }.to_vec())
    }

    /// Copy every texel byte out of an image's backing memory.
    pub fn read_image(&self, image: ImageId) -> Result<Vec<u8>> {
        let state = self.shared.state.lock();
        let sim = state.image(image)?;
        let len = sim.byte_size();
        let ptr = state.host_range(sim.binding, len)?;
        // SAFETY: host_range bounds checked `len`.
        Ok(unsafe { std::slice::from_raw_parts(ptr, len as usize) }.to_vec())
    }
}

impl GraphicsBackend for NullBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Null
    }

    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.lock("wait_idle");
        Ok(())
    }

    fn allocate_memory(&mut self, request: &MemoryRequest) -> Result<DeviceMemory> {
        let mut state = self.lock("allocate_memory");
        let id = state.id();
        let memory = SimMemory::new(request.size as usize, request.host_visible);
        let mapped = request.host_visible.then_some(memory.ptr);
        state.memories.insert(id, memory);
        Ok(DeviceMemory {
            memory: MemoryId(id),
            mapped,
        })
    }

    fn free_memory(&mut self, memory: MemoryId) {
        self.lock("free_memory").memories.remove(&memory.0);
    }

    fn flush_mapped_range(&mut self, memory: MemoryId, offset: u64, size: u64) -> Result<()> {
        let state = self.lock("flush_mapped_range");
        let block = state
            .memories
            .get(&memory.0)
            .ok_or_else(|| GfxError::InvalidState(format!("unknown memory {memory:?}")))?;
        if !block.host_visible || offset + size > block.len as u64 {
            return Err(GfxError::InvalidState(format!(
                "invalid flush of {offset}+{size} on {memory:?}"
            )));
        }
        Ok(())
    }

    fn create_buffer(&mut self, size: u64, usage: BufferUsageBits) -> Result<BufferId> {
        let mut state = self.lock("create_buffer");
        state.injected_failure("create_buffer")?;
        let id = state.id();
        state.buffers.insert(
            id,
            SimBuffer {
                size,
                usage,
                binding: None,
            },
        );
        Ok(BufferId(id))
    }

    fn buffer_memory_requirements(&self, buffer: BufferId) -> MemoryRequirements {
        let state = self.shared.state.lock();
        let size = state.buffers.get(&buffer.0).map_or(0, |b| b.size);
        MemoryRequirements {
            size,
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: 1,
        }
    }

    fn bind_buffer_memory(&mut self, buffer: BufferId, memory: MemoryId, offset: u64) -> Result<()> {
        let mut state = self.lock("bind_buffer_memory");
        state.injected_failure("bind_buffer_memory")?;
        let size = state
            .buffers
            .get(&buffer.0)
            .map(|b| b.size)
            .ok_or_else(|| GfxError::InvalidState(format!("unknown buffer {buffer:?}")))?;
        state.host_range(Some((memory, offset)), size)?;
        if let Some(sim) = state.buffers.get_mut(&buffer.0) {
            sim.binding = Some((memory, offset));
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        let mut state = self.lock("destroy_buffer");
        if let Some(sim) = state.buffers.remove(&buffer.0) {
            trace!(?buffer, usage = ?sim.usage, "destroyed");
        }
    }

    fn create_image(&mut self, info: &ImageCreateInfo) -> Result<ImageId> {
        if info.format == ImageFormat::Invalid || info.width == 0 || info.height == 0 {
            return Err(GfxError::InvalidState(format!("invalid image {info:?}")));
        }
        let mut state = self.lock("create_image");
        state.injected_failure("create_image")?;
        let id = state.id();
        state.images.insert(
            id,
            SimImage {
                info: *info,
                binding: None,
                presentable: false,
            },
        );
        Ok(ImageId(id))
    }

    fn image_memory_requirements(&self, image: ImageId) -> MemoryRequirements {
        let state = self.shared.state.lock();
        let size = state.images.get(&image.0).map_or(0, SimImage::byte_size);
        MemoryRequirements {
            size,
            alignment: IMAGE_ALIGNMENT,
            memory_type_bits: 1,
        }
    }

    fn bind_image_memory(&mut self, image: ImageId, memory: MemoryId, offset: u64) -> Result<()> {
        let mut state = self.lock("bind_image_memory");
        state.injected_failure("bind_image_memory")?;
        let size = state.image(image)?.byte_size();
        state.host_range(Some((memory, offset)), size)?;
        if let Some(sim) = state.images.get_mut(&image.0) {
            sim.binding = Some((memory, offset));
        }
        Ok(())
    }

    fn create_image_view(
        &mut self,
        image: ImageId,
        _format: ImageFormat,
        _array_layers: u32,
    ) -> Result<ImageViewId> {
        let mut state = self.lock("create_image_view");
        state.injected_failure("create_image_view")?;
        state.image(image)?;
        let id = state.id();
        state.views.insert(id, image);
        Ok(ImageViewId(id))
    }

    fn destroy_image_view(&mut self, view: ImageViewId) {
        self.lock("destroy_image_view").views.remove(&view.0);
    }

    fn destroy_image(&mut self, image: ImageId) {
        self.lock("destroy_image").images.remove(&image.0);
    }

    fn create_linear_sampler(&mut self) -> Result<SamplerId> {
        let mut state = self.lock("create_linear_sampler");
        let id = state.id();
        state.samplers.insert(id);
        Ok(SamplerId(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        self.lock("destroy_sampler").samplers.remove(&sampler.0);
    }

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorBinding],
    ) -> Result<DescriptorSetLayoutId> {
        let mut state = self.lock("create_descriptor_set_layout");
        let id = state.id();
        state.set_layouts.insert(id, bindings.to_vec());
        Ok(DescriptorSetLayoutId(id))
    }

    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutId) {
        self.lock("destroy_descriptor_set_layout")
            .set_layouts
            .remove(&layout.0);
    }

    fn create_descriptor_pool(&mut self, sizes: &DescriptorPoolSizes) -> Result<DescriptorPoolId> {
        let mut state = self.lock("create_descriptor_pool");
        let id = state.id();
        state.pools.insert(
            id,
            SimPool {
                remaining_sets: sizes.max_sets(),
                live_sets: HashSet::new(),
            },
        );
        Ok(DescriptorPoolId(id))
    }

    fn destroy_descriptor_pool(&mut self, pool: DescriptorPoolId) {
        let mut state = self.lock("destroy_descriptor_pool");
        if let Some(sim) = state.pools.remove(&pool.0) {
            for set in sim.live_sets {
                state.sets.remove(&set);
            }
        }
    }

    fn allocate_descriptor_sets(
        &mut self,
        pool: DescriptorPoolId,
        layout: DescriptorSetLayoutId,
        count: u32,
    ) -> Result<Vec<DescriptorSetId>> {
        let mut state = self.lock("allocate_descriptor_sets");
        if !state.set_layouts.contains_key(&layout.0) {
            return Err(GfxError::InvalidState(format!("unknown layout {layout:?}")));
        }
        let remaining = state
            .pools
            .get(&pool.0)
            .map(|p| p.remaining_sets)
            .ok_or_else(|| GfxError::InvalidState(format!("unknown pool {pool:?}")))?;
        if remaining < count {
            return Err(GfxError::DescriptorPoolExhausted);
        }
        let ids: Vec<u64> = (0..count).map(|_| state.id()).collect();
        for id in &ids {
            state.sets.insert(*id, pool);
        }
        if let Some(sim) = state.pools.get_mut(&pool.0) {
            sim.remaining_sets -= count;
            sim.live_sets.extend(ids.iter().copied());
        }
        Ok(ids.into_iter().map(DescriptorSetId).collect())
    }

    fn free_descriptor_sets(
        &mut self,
        pool: DescriptorPoolId,
        sets: &[DescriptorSetId],
    ) -> Result<()> {
        let mut state = self.lock("free_descriptor_sets");
        for set in sets {
            if state.sets.remove(&set.0).is_none() {
                return Err(GfxError::InvalidState(format!("unknown set {set:?}")));
            }
        }
        let sim = state
            .pools
            .get_mut(&pool.0)
            .ok_or_else(|| GfxError::InvalidState(format!("unknown pool {pool:?}")))?;
        for set in sets {
            sim.live_sets.remove(&set.0);
        }
        sim.remaining_sets += sets.len() as u32;
        Ok(())
    }

    fn update_descriptor_sets(&mut self, writes: &[DescriptorWrite]) {
        self.lock("update_descriptor_sets")
            .descriptor_writes
            .extend_from_slice(writes);
    }

    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[DescriptorSetLayoutId],
        push_constant_size: u32,
        push_constant_stages: ShaderStages,
    ) -> Result<PipelineLayoutId> {
        let mut state = self.lock("create_pipeline_layout");
        let id = state.id();
        state.pipeline_layouts.insert(
            id,
            (set_layouts.to_vec(), push_constant_size, push_constant_stages),
        );
        Ok(PipelineLayoutId(id))
    }

    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutId) {
        self.lock("destroy_pipeline_layout")
            .pipeline_layouts
            .remove(&layout.0);
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>) -> Result<PipelineId> {
        if desc.vertex_code.is_empty() || desc.fragment_code.is_empty() {
            return Err(GfxError::ShaderCompilation("empty shader module".into()));
        }
        if (desc.blend == BlendState::NoColorAttachment) != desc.color_formats.is_empty() {
            return Err(GfxError::PipelineCreation(format!(
                "{:?} with {} color attachments",
                desc.blend,
                desc.color_formats.len()
            )));
        }
        let mut state = self.lock("create_graphics_pipeline");
        if !state.pipeline_layouts.contains_key(&desc.layout.0) {
            return Err(GfxError::PipelineCreation(format!(
                "unknown layout {:?}",
                desc.layout
            )));
        }
        let id = state.id();
        state.pipelines.insert(id, desc.layout);
        Ok(PipelineId(id))
    }

    fn create_compute_pipeline(
        &mut self,
        layout: PipelineLayoutId,
        code: &[u32],
    ) -> Result<PipelineId> {
        if code.is_empty() {
            return Err(GfxError::ShaderCompilation("empty shader module".into()));
        }
        let mut state = self.lock("create_compute_pipeline");
        let id = state.id();
        state.pipelines.insert(id, layout);
        Ok(PipelineId(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        self.lock("destroy_pipeline").pipelines.remove(&pipeline.0);
    }

    fn create_fence(&mut self, signaled: bool) -> Result<FenceId> {
        let mut state = self.lock("create_fence");
        let id = state.id();
        state.fences.insert(id, signaled);
        Ok(FenceId(id))
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        self.lock("destroy_fence").fences.remove(&fence.0);
    }

    fn wait_for_fence(&mut self, fence: FenceId) -> Result<()> {
        let mut state = self.lock("wait_for_fence");
        loop {
            let signaled = state.fences.get(&fence.0).copied();
            match signaled {
                Some(true) => return Ok(()),
                Some(false) => self.shared.fence_signaled.wait(&mut state),
                None => return Err(GfxError::InvalidState(format!("unknown fence {fence:?}"))),
            }
        }
    }

    fn reset_fence(&mut self, fence: FenceId) -> Result<()> {
        let mut state = self.lock("reset_fence");
        let signaled = state
            .fences
            .get_mut(&fence.0)
            .ok_or_else(|| GfxError::InvalidState(format!("unknown fence {fence:?}")))?;
        *signaled = false;
        Ok(())
    }

    fn create_semaphore(&mut self) -> Result<SemaphoreId> {
        let mut state = self.lock("create_semaphore");
        let id = state.id();
        state.semaphores.insert(id);
        Ok(SemaphoreId(id))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreId) {
        self.lock("destroy_semaphore").semaphores.remove(&semaphore.0);
    }

    fn allocate_command_buffer(&mut self) -> Result<CommandBufferId> {
        let mut state = self.lock("allocate_command_buffer");
        let id = state.id();
        state.command_buffers.insert(
            id,
            SimCommandBuffer {
                commands: Vec::new(),
                recording: false,
            },
        );
        Ok(CommandBufferId(id))
    }

    fn free_command_buffer(&mut self, command_buffer: CommandBufferId) {
        self.lock("free_command_buffer")
            .command_buffers
            .remove(&command_buffer.0);
    }

    fn begin_command_buffer(&mut self, command_buffer: CommandBufferId) -> Result<()> {
        let mut state = self.lock("begin_command_buffer");
        let cb = state
            .command_buffers
            .get_mut(&command_buffer.0)
            .ok_or_else(|| GfxError::InvalidState(format!("unknown {command_buffer:?}")))?;
        cb.commands.clear();
        cb.recording = true;
        Ok(())
    }

    fn end_command_buffer(&mut self, command_buffer: CommandBufferId) -> Result<()> {
        let mut state = self.lock("end_command_buffer");
        let cb = state
            .command_buffers
            .get_mut(&command_buffer.0)
            .ok_or_else(|| GfxError::InvalidState(format!("unknown {command_buffer:?}")))?;
        if !cb.recording {
            return Err(GfxError::InvalidState(format!(
                "{command_buffer:?} is not recording"
            )));
        }
        cb.recording = false;
        Ok(())
    }

    fn record(&mut self, command_buffer: CommandBufferId, command: &DeviceCommand) {
        let mut state = self.shared.state.lock();
        match state.command_buffers.get_mut(&command_buffer.0) {
            Some(cb) if cb.recording => cb.commands.push(command.clone()),
            _ => fatal(format!("record into {command_buffer:?} outside begin/end")),
        }
    }

    fn submit(&mut self, info: &SubmitInfo) -> Result<()> {
        let mut state = self.lock("submit");
        let commands = match state.command_buffers.get(&info.command_buffer.0) {
            Some(cb) if !cb.recording => cb.commands.clone(),
            Some(_) => {
                return Err(GfxError::InvalidState(format!(
                    "submit of {:?} while recording",
                    info.command_buffer
                )))
            }
            None => {
                return Err(GfxError::InvalidState(format!(
                    "unknown {:?}",
                    info.command_buffer
                )))
            }
        };
        state.execute(&commands)?;
        state.submissions.push(commands);
        if let Some(fence) = info.fence {
            let hold = state.hold_fences;
            let signaled = state
                .fences
                .get_mut(&fence.0)
                .ok_or_else(|| GfxError::InvalidState(format!("unknown fence {fence:?}")))?;
            if !hold {
                *signaled = true;
                drop(state);
                self.shared.fence_signaled.notify_all();
            }
        }
        Ok(())
    }

    fn queue_wait_idle(&mut self) -> Result<()> {
        self.lock("queue_wait_idle");
        Ok(())
    }

    fn create_timestamp_query_pool(&mut self, count: u32) -> Result<QueryPoolId> {
        let mut state = self.lock("create_timestamp_query_pool");
        let id = state.id();
        state.query_pools.insert(id, vec![0; count as usize]);
        Ok(QueryPoolId(id))
    }

    fn destroy_query_pool(&mut self, pool: QueryPoolId) {
        self.lock("destroy_query_pool").query_pools.remove(&pool.0);
    }

    fn timestamp_results(&mut self, pool: QueryPoolId, first: u32, out: &mut [u64]) -> Result<()> {
        let state = self.lock("timestamp_results");
        let results = state
            .query_pools
            .get(&pool.0)
            .ok_or_else(|| GfxError::InvalidState(format!("unknown query pool {pool:?}")))?;
        let first = first as usize;
        let src = results
            .get(first..first + out.len())
            .ok_or_else(|| GfxError::InvalidState("query range out of bounds".into()))?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn create_swap_chain(
        &mut self,
        request: &SwapChainRequest,
        _window: Option<&dyn WindowSource>,
    ) -> Result<SwapChainImages> {
        let mut state = self.lock("create_swap_chain");
        let id = state.id();
        let swapchain = SwapchainId(id);
        let chain = build_chain(&mut state, request);
        let images = chain.images.clone();
        state.swapchains.insert(id, chain);
        Ok(SwapChainImages {
            swapchain,
            format: ImageFormat::Bgra8Srgb,
            width: request.width,
            height: request.height,
            images,
        })
    }

    fn resize_swap_chain(
        &mut self,
        swapchain: SwapchainId,
        request: &SwapChainRequest,
    ) -> Result<SwapChainImages> {
        let mut state = self.lock("resize_swap_chain");
        let old = state
            .swapchains
            .remove(&swapchain.0)
            .ok_or_else(|| GfxError::SwapChainCreation(format!("unknown {swapchain:?}")))?;
        release_chain(&mut state, &old);
        let chain = build_chain(&mut state, request);
        let images = chain.images.clone();
        state.swapchains.insert(swapchain.0, chain);
        Ok(SwapChainImages {
            swapchain,
            format: ImageFormat::Bgra8Srgb,
            width: request.width,
            height: request.height,
            images,
        })
    }

    fn destroy_swap_chain(&mut self, swapchain: SwapchainId) {
        let mut state = self.lock("destroy_swap_chain");
        if let Some(chain) = state.swapchains.remove(&swapchain.0) {
            release_chain(&mut state, &chain);
        }
    }

    fn acquire_next_image(
        &mut self,
        swapchain: SwapchainId,
        _signal: SemaphoreId,
    ) -> Result<AcquireStatus> {
        let mut state = self.lock("acquire_next_image");
        if state.pending_out_of_date > 0 {
            state.pending_out_of_date -= 1;
            return Ok(AcquireStatus::OutOfDate);
        }
        if state.pending_not_ready > 0 {
            state.pending_not_ready -= 1;
            return Ok(AcquireStatus::NotReady);
        }
        let chain = state
            .swapchains
            .get_mut(&swapchain.0)
            .ok_or_else(|| GfxError::InvalidState(format!("unknown {swapchain:?}")))?;
        let index = chain.next_image;
        chain.next_image = (index + 1) % chain.images.len() as u32;
        trace!(index, width = chain.width, height = chain.height, "acquired");
        Ok(AcquireStatus::Acquired(index))
    }

    fn present(
        &mut self,
        swapchain: SwapchainId,
        image_index: u32,
        _wait: SemaphoreId,
    ) -> Result<PresentStatus> {
        let mut state = self.lock("present");
        if !state.swapchains.contains_key(&swapchain.0) {
            return Err(GfxError::InvalidState(format!("unknown {swapchain:?}")));
        }
        state.presents.push((swapchain, image_index));
        Ok(PresentStatus::Presented)
    }
}

fn build_chain(state: &mut State, request: &SwapChainRequest) -> SimSwapchain {
    let images = (0..request.image_count.max(1))
        .map(|_| {
            let image = state.id();
            state.images.insert(
                image,
                SimImage {
                    info: ImageCreateInfo {
                        width: request.width,
                        height: request.height,
                        array_layers: 1,
                        format: ImageFormat::Bgra8Srgb,
                        usage: tinker_core::ImageUsageFlags::RENDER_TARGET
                            | tinker_core::ImageUsageFlags::TRANSFER_DST,
                    },
                    binding: None,
                    presentable: true,
                },
            );
            let view = state.id();
            state.views.insert(view, ImageId(image));
            (ImageId(image), ImageViewId(view))
        })
        .collect();
    SimSwapchain {
        images,
        next_image: 0,
        width: request.width,
        height: request.height,
    }
}

fn release_chain(state: &mut State, chain: &SimSwapchain) {
    for (image, view) in &chain.images {
        state.views.remove(&view.0);
        state.images.remove(&image.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn host_buffer(backend: &mut NullBackend, size: u64) -> (BufferId, NonNull<u8>) {
        let memory = backend
            .allocate_memory(&MemoryRequest {
                size,
                memory_type_bits: 1,
                host_visible: true,
            })
            .unwrap();
        let buffer = backend
            .create_buffer(size, BufferUsageBits::TRANSFER_SRC)
            .unwrap();
        backend.bind_buffer_memory(buffer, memory.memory, 0).unwrap();
        (buffer, memory.mapped.unwrap())
    }

    #[test]
    fn copy_executes_at_submit() {
        let mut backend = NullBackend::new();
        let control = backend.control();
        let (src, mapped) = host_buffer(&mut backend, 8);
        let (dst, _) = host_buffer(&mut backend, 8);
        unsafe { std::ptr::copy_nonoverlapping([9u8; 8].as_ptr(), mapped.as_ptr(), 8) };

        let cmd = backend.allocate_command_buffer().unwrap();
        backend.begin_command_buffer(cmd).unwrap();
        backend.record(cmd, &DeviceCommand::CopyBuffer { src, dst, size: 8 });
        backend.end_command_buffer(cmd).unwrap();
        assert_eq!(control.read_buffer(dst, 8).unwrap(), vec![0; 8]);

        backend
            .submit(&SubmitInfo {
                command_buffer: cmd,
                wait: None,
                signal: None,
                fence: None,
            })
            .unwrap();
        assert_eq!(control.read_buffer(dst, 8).unwrap(), vec![9; 8]);
    }

    #[test]
    fn binding_outside_memory_fails() {
        let mut backend = NullBackend::new();
        let memory = backend
            .allocate_memory(&MemoryRequest {
                size: 64,
                memory_type_bits: 1,
                host_visible: false,
            })
            .unwrap();
        let buffer = backend
            .create_buffer(64, BufferUsageBits::STORAGE)
            .unwrap();
        assert!(backend.bind_buffer_memory(buffer, memory.memory, 16).is_err());
        assert!(memory.mapped.is_none());
    }

    #[test]
    fn descriptor_pool_runs_out() {
        let mut backend = NullBackend::new();
        let layout = backend.create_descriptor_set_layout(&[]).unwrap();
        let pool = backend
            .create_descriptor_pool(&DescriptorPoolSizes {
                uniform_buffers: 2,
                dynamic_uniform_buffers: 0,
                sampled_images: 0,
                storage_buffers: 0,
                storage_images: 0,
            })
            .unwrap();
        let sets = backend.allocate_descriptor_sets(pool, layout, 2).unwrap();
        assert!(matches!(
            backend.allocate_descriptor_sets(pool, layout, 1),
            Err(GfxError::DescriptorPoolExhausted)
        ));
        backend.free_descriptor_sets(pool, &sets).unwrap();
        assert!(backend.allocate_descriptor_sets(pool, layout, 2).is_ok());
    }

    #[test]
    fn fence_wait_blocks_until_signaled() {
        let mut backend = NullBackend::new();
        let control = backend.control();
        let fence = backend.create_fence(false).unwrap();
        let released = Arc::new(AtomicBool::new(false));

        let signaller = {
            let released = Arc::clone(&released);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                released.store(true, Ordering::SeqCst);
                control.signal_all_fences();
            })
        };
        backend.wait_for_fence(fence).unwrap();
        assert!(released.load(Ordering::SeqCst));
        signaller.join().unwrap();
    }

    #[test]
    fn injected_out_of_date_applies_once() {
        let mut backend = NullBackend::new();
        let control = backend.control();
        let semaphore = backend.create_semaphore().unwrap();
        let chain = backend
            .create_swap_chain(
                &SwapChainRequest {
                    width: 4,
                    height: 4,
                    image_count: 2,
                    vsync: true,
                },
                None,
            )
            .unwrap();
        control.inject_out_of_date();
        assert_eq!(
            backend.acquire_next_image(chain.swapchain, semaphore).unwrap(),
            AcquireStatus::OutOfDate
        );
        assert_eq!(
            backend.acquire_next_image(chain.swapchain, semaphore).unwrap(),
            AcquireStatus::Acquired(0)
        );
        assert_eq!(
            backend.acquire_next_image(chain.swapchain, semaphore).unwrap(),
            AcquireStatus::Acquired(1)
        );
    }

    #[test]
    fn injected_failure_hits_the_requested_call() {
        let mut backend = NullBackend::new();
        let control = backend.control();
        control.fail_call_after("create_buffer", 1);
        assert!(backend.create_buffer(16, BufferUsageBits::STORAGE).is_ok());
        assert!(backend.create_buffer(16, BufferUsageBits::STORAGE).is_err());
        assert!(backend.create_buffer(16, BufferUsageBits::STORAGE).is_ok());
        assert_eq!(control.live_buffers(), 2);
    }

    #[test]
    fn injected_timeout_reports_not_ready() {
        let mut backend = NullBackend::new();
        let control = backend.control();
        let semaphore = backend.create_semaphore().unwrap();
        let chain = backend
            .create_swap_chain(
                &SwapChainRequest {
                    width: 4,
                    height: 4,
                    image_count: 2,
                    vsync: true,
                },
                None,
            )
            .unwrap();
        control.inject_acquire_timeout();
        assert_eq!(
            backend.acquire_next_image(chain.swapchain, semaphore).unwrap(),
            AcquireStatus::NotReady
        );
        assert_eq!(
            backend.acquire_next_image(chain.swapchain, semaphore).unwrap(),
            AcquireStatus::Acquired(0)
        );
    }

    #[test]
    fn timestamps_increase() {
        let mut backend = NullBackend::new();
        let pool = backend.create_timestamp_query_pool(4).unwrap();
        let cmd = backend.allocate_command_buffer().unwrap();
        backend.begin_command_buffer(cmd).unwrap();
        backend.record(cmd, &DeviceCommand::WriteTimestamp { pool, query: 0 });
        backend.record(cmd, &DeviceCommand::Dispatch { x: 1, y: 1, z: 1 });
        backend.record(cmd, &DeviceCommand::WriteTimestamp { pool, query: 1 });
        backend.end_command_buffer(cmd).unwrap();
        backend
            .submit(&SubmitInfo {
                command_buffer: cmd,
                wait: None,
                signal: None,
                fence: None,
            })
            .unwrap();
        let mut out = [0u64; 2];
        backend.timestamp_results(pool, 0, &mut out).unwrap();
        assert_eq!(out[1] - out[0], 2 * TICKS_PER_COMMAND);
    }
}
