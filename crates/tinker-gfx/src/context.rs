//! The graphics context: the single entry point for callers.
//!
//! Owns the backend and every layer built on it. All methods are called from
//! one submission thread.

use crate::backend::null::NullBackend;
use crate::backend::vulkan::VulkanBackend;
use crate::backend::{CommandBufferId, GraphicsBackend, SubmitInfo, WindowSource};
use crate::command::{CommandStream, RenderPassTargets};
use crate::config::{BackendKind, GraphicsConfig};
use crate::descriptor::{DescriptorLayout, DescriptorSystem};
use crate::error::{fatal, Result};
use crate::frame::{self, FrameClock, FrameSyncManager, SwapChainData};
use crate::handle::{
    DescriptorHandle, FramebufferHandle, HandlePool, ResourceHandle, SwapChainHandle,
};
use crate::memory::GpuMemoryAllocator;
use crate::playback::Playback;
use crate::pso::{GraphicsPipelineInfo, PsoCache};
use crate::resource::{Resource, ResourceDesc, ResourceRegistry};
use crate::timestamps::{GpuTimestamps, TimestampInterval};
use tinker_core::limits::{MAX_FRAMES_IN_FLIGHT, NUM_SWAP_CHAINS_STARTING_ALLOC_SIZE};
use tinker_core::{
    BlendState, DepthState, DescUpdateConfigFlags, DescriptorLayoutId, ImageFormat, ImageLayout,
    ImageUsageFlags, ShaderId,
};
use tracing::{debug, error, info};

const FRAMEBUFFER_POOL_CAPACITY: u32 = 64;

/// Textures every context can provide without asset loading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DefaultTexture {
    /// 2x2 RGBA8, opaque black.
    Black2x2,
}

impl DefaultTexture {
    pub const COUNT: usize = 1;
    pub const ALL: [Self; Self::COUNT] = [Self::Black2x2];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Everything built on top of the backend. Torn down by `destroy` and
/// rebuilt by `recreate_context`.
struct DeviceState {
    memory: GpuMemoryAllocator,
    resources: ResourceRegistry,
    descriptors: DescriptorSystem,
    pso: PsoCache,
    timestamps: GpuTimestamps,
    frame_commands: [CommandBufferId; MAX_FRAMES_IN_FLIGHT],
    immediate_commands: CommandBufferId,
    swap_chains: HandlePool<SwapChainHandle, SwapChainData>,
    /// Exists while at least one swap chain does.
    frame_sync: Option<FrameSyncManager>,
    framebuffers: HandlePool<FramebufferHandle, RenderPassTargets>,
    default_textures: [ResourceHandle; DefaultTexture::COUNT],
    clock: FrameClock,
}

impl DeviceState {
    /// Every handle pool issues handles tagged with `epoch`.
    fn new(backend: &mut dyn GraphicsBackend, config: &GraphicsConfig, epoch: u32) -> Result<Self> {
        let memory = GpuMemoryAllocator::new(backend, &config.memory)?;
        let mut descriptors = DescriptorSystem::new(backend)?;
        descriptors.start_epoch(epoch);
        let mut resources = ResourceRegistry::new(config.max_resources);
        resources.start_epoch(epoch);
        let mut swap_chains = HandlePool::growable(NUM_SWAP_CHAINS_STARTING_ALLOC_SIZE);
        swap_chains.start_epoch(epoch);
        let mut framebuffers = HandlePool::with_capacity(FRAMEBUFFER_POOL_CAPACITY);
        framebuffers.start_epoch(epoch);
        let timestamps = GpuTimestamps::new(backend)?;
        let mut frame_commands = [CommandBufferId(0); MAX_FRAMES_IN_FLIGHT];
        for cmd in &mut frame_commands {
            *cmd = backend.allocate_command_buffer()?;
        }
        let immediate_commands = backend.allocate_command_buffer()?;
        Ok(Self {
            memory,
            resources,
            descriptors,
            pso: PsoCache::new(),
            timestamps,
            frame_commands,
            immediate_commands,
            swap_chains,
            frame_sync: None,
            framebuffers,
            default_textures: [ResourceHandle::INVALID; DefaultTexture::COUNT],
            clock: FrameClock::default(),
        })
    }

    fn frame_sync(&self) -> &FrameSyncManager {
        match &self.frame_sync {
            Some(sync) => sync,
            None => fatal("frame operation without a swap chain"),
        }
    }

    fn destroy(mut self, backend: &mut dyn GraphicsBackend) -> Result<()> {
        backend.wait_idle()?;
        for handle in self.swap_chains.handles() {
            self.swap_chains
                .dealloc(handle)
                .destroy(backend, &mut self.resources);
        }
        if let Some(sync) = self.frame_sync.take() {
            sync.destroy(backend);
        }
        self.descriptors.destroy(backend)?;
        self.pso.destroy(backend)?;
        self.resources.destroy_all(backend)?;
        self.timestamps.destroy(backend);
        for cmd in self.frame_commands {
            backend.free_command_buffer(cmd);
        }
        backend.free_command_buffer(self.immediate_commands);
        self.memory.destroy(backend);
        Ok(())
    }
}

/// Graphics device abstraction over one backend.
pub struct GraphicsContext {
    config: GraphicsConfig,
    state: Option<DeviceState>,
    /// Bumped by every rebuild; tags all handles issued by the current state.
    epoch: u32,
    backend: Box<dyn GraphicsBackend>,
}

impl GraphicsContext {
    /// Build the layer on an existing backend.
    pub fn new(mut backend: Box<dyn GraphicsBackend>, config: GraphicsConfig) -> Result<Self> {
        let state = DeviceState::new(backend.as_mut(), &config, 0)?;
        info!(
            "Graphics context ready on {:?} backend ({})",
            backend.kind(),
            backend.properties().device_name
        );
        Ok(Self {
            config,
            state: Some(state),
            epoch: 0,
            backend,
        })
    }

    /// Open the backend named by `config` and build the layer on it.
    /// Windowed Vulkan needs `window` for its surface extensions.
    pub fn from_config(config: GraphicsConfig, window: Option<&dyn WindowSource>) -> Result<Self> {
        let backend: Box<dyn GraphicsBackend> = match config.backend {
            BackendKind::Null => Box::new(NullBackend::new()),
            BackendKind::Vulkan => Box::new(VulkanBackend::new(&config, window)?),
        };
        Self::new(backend, config)
    }

    pub fn config(&self) -> &GraphicsConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    fn parts(&mut self) -> (&mut dyn GraphicsBackend, &mut DeviceState) {
        let Some(state) = self.state.as_mut() else {
            fatal("graphics context used after destroy");
        };
        (self.backend.as_mut(), state)
    }

    fn state(&self) -> &DeviceState {
        match &self.state {
            Some(state) => state,
            None => fatal("graphics context used after destroy"),
        }
    }

    // Resources

    pub fn create_resource(&mut self, desc: &ResourceDesc) -> Result<ResourceHandle> {
        let (backend, s) = self.parts();
        s.resources.create(backend, &mut s.memory, desc)
    }

    /// Waits for the device to go idle first.
    pub fn destroy_resource(&mut self, handle: ResourceHandle) -> Result<()> {
        let (backend, s) = self.parts();
        s.resources.destroy(backend, handle)
    }

    pub fn resource(&self, handle: ResourceHandle) -> &Resource {
        self.state().resources.get(handle)
    }

    /// Mapped bytes of the copy the current frame uses.
    pub fn map_resource(&mut self, handle: ResourceHandle) -> &mut [u8] {
        let (_, s) = self.parts();
        let frame = s.clock.current_frame();
        s.resources.map(handle, frame)
    }

    pub fn unmap_resource(&mut self, handle: ResourceHandle) -> Result<()> {
        let (backend, s) = self.parts();
        s.resources
            .unmap(backend, handle, s.clock.current_frame())
    }

    // Descriptors

    pub fn create_descriptor_layout(
        &mut self,
        id: DescriptorLayoutId,
        layout: &DescriptorLayout,
    ) -> Result<()> {
        let (backend, s) = self.parts();
        s.descriptors.create_layout(backend, id, layout)
    }

    pub fn create_descriptor(&mut self, layout: DescriptorLayoutId) -> Result<DescriptorHandle> {
        let (backend, s) = self.parts();
        s.descriptors.create_descriptor(backend, layout)
    }

    pub fn write_descriptor_simple(&mut self, handle: DescriptorHandle, bound: &[ResourceHandle]) {
        let (backend, s) = self.parts();
        s.descriptors
            .write_simple(backend, &s.resources, handle, bound);
    }

    pub fn write_descriptor_array(
        &mut self,
        handle: DescriptorHandle,
        textures: &[ResourceHandle],
        flags: DescUpdateConfigFlags,
    ) {
        let (backend, s) = self.parts();
        s.descriptors.write_array(
            backend,
            &s.resources,
            handle,
            textures,
            flags,
            s.clock.current_frame(),
        );
    }

    pub fn destroy_descriptor(&mut self, handle: DescriptorHandle) -> Result<()> {
        let (backend, s) = self.parts();
        s.descriptors.destroy_descriptor(backend, handle)
    }

    pub fn destroy_all_descriptors(&mut self) -> Result<()> {
        let (backend, s) = self.parts();
        s.descriptors.destroy_all_descriptors(backend)
    }

    // Pipelines

    pub fn create_graphics_pipeline(
        &mut self,
        shader: ShaderId,
        info: &GraphicsPipelineInfo<'_>,
    ) -> Result<()> {
        let (backend, s) = self.parts();
        s.pso
            .create_graphics_pipeline(backend, &s.descriptors, shader, info)
    }

    pub fn destroy_graphics_pipeline(&mut self, shader: ShaderId) -> Result<()> {
        let (backend, s) = self.parts();
        s.pso.destroy_graphics_pipeline(backend, shader)
    }

    pub fn create_compute_pipeline(
        &mut self,
        shader: ShaderId,
        code: &[u32],
        layouts: &[DescriptorLayoutId],
    ) -> Result<()> {
        let (backend, s) = self.parts();
        s.pso
            .create_compute_pipeline(backend, &s.descriptors, shader, code, layouts)
    }

    pub fn destroy_compute_pipeline(&mut self, shader: ShaderId) -> Result<()> {
        let (backend, s) = self.parts();
        s.pso.destroy_compute_pipeline(backend, shader)
    }

    /// Tear down every compiled permutation. Recipes stay, so later use
    /// recompiles on demand.
    pub fn destroy_all_pso_perms(&mut self) -> Result<()> {
        let (backend, s) = self.parts();
        s.pso.destroy_all_pso_perms(backend)
    }

    pub fn is_pso_compiled(&self, shader: ShaderId, blend: BlendState, depth: DepthState) -> bool {
        self.state().pso.is_compiled(shader, blend, depth)
    }

    // Command streams

    /// An empty stream with the configured command budget.
    pub fn create_command_stream(&self) -> CommandStream {
        CommandStream::new(self.config.max_commands)
    }

    /// Play `stream` into the immediate command buffer, submit it and wait
    /// for the queue to drain.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit_cmds_immediate(&mut self, stream: &CommandStream) -> Result<()> {
        let (backend, s) = self.parts();
        let cmd = s.immediate_commands;
        backend.begin_command_buffer(cmd)?;
        Playback::new(
            backend,
            &s.resources,
            &s.descriptors,
            &mut s.pso,
            &mut s.timestamps,
            cmd,
            s.clock.current_frame(),
            s.clock.frame_counter(),
        )
        .immediate()
        .process(stream)?;
        backend.end_command_buffer(cmd)?;
        backend.submit(&SubmitInfo {
            command_buffer: cmd,
            wait: None,
            signal: None,
            fence: None,
        })?;
        backend.queue_wait_idle()?;
        debug!("Immediate submission of {} commands", stream.len());
        Ok(())
    }

    // Frames

    /// Wait for the current virtual frame to retire and acquire the next
    /// image of `chain`. `Ok(false)` means skip this frame and recreate the
    /// chain.
    pub fn acquire_frame(&mut self, chain: SwapChainHandle) -> Result<bool> {
        let (backend, s) = self.parts();
        let sync = *s.frame_sync().get(s.clock.current_frame());
        frame::acquire_frame(backend, &sync, s.swap_chains.lookup_mut(chain))
    }

    pub fn begin_frame_recording(&mut self) -> Result<()> {
        let (backend, s) = self.parts();
        backend.begin_command_buffer(s.frame_commands[s.clock.current_frame()])
    }

    /// Play `stream` into the current frame's command buffer.
    pub fn process_frame_commands(&mut self, stream: &CommandStream) -> Result<()> {
        let (backend, s) = self.parts();
        let frame = s.clock.current_frame();
        Playback::new(
            backend,
            &s.resources,
            &s.descriptors,
            &mut s.pso,
            &mut s.timestamps,
            s.frame_commands[frame],
            frame,
            s.clock.frame_counter(),
        )
        .process(stream)
    }

    pub fn end_frame_recording(&mut self) -> Result<()> {
        let (backend, s) = self.parts();
        backend.end_command_buffer(s.frame_commands[s.clock.current_frame()])
    }

    pub fn submit_frame_to_gpu(&mut self) -> Result<()> {
        let (backend, s) = self.parts();
        let frame = s.clock.current_frame();
        let sync = *s.frame_sync().get(frame);
        frame::submit_frame(backend, &sync, s.frame_commands[frame])
    }

    /// `Ok(false)` when the chain turned out stale and must be recreated.
    pub fn present(&mut self, chain: SwapChainHandle) -> Result<bool> {
        let (backend, s) = self.parts();
        let sync = *s.frame_sync().get(s.clock.current_frame());
        frame::present_frame(backend, &sync, s.swap_chains.lookup_mut(chain))
    }

    /// Advance the virtual frame ring.
    pub fn end_frame(&mut self) {
        let (_, s) = self.parts();
        s.clock.advance();
    }

    pub fn current_frame_in_flight(&self) -> usize {
        self.state().clock.current_frame()
    }

    pub fn frame_counter(&self) -> u64 {
        self.state().clock.frame_counter()
    }

    /// Nanoseconds per timestamp tick.
    pub fn timestamp_period(&self) -> f32 {
        self.state().timestamps.period_ns()
    }

    pub fn timestamp_data(&self) -> &[TimestampInterval] {
        self.state().timestamps.timestamp_data()
    }

    pub fn total_frame_time_micros(&self) -> f64 {
        self.state().timestamps.total_frame_time_micros()
    }

    // Swap chains

    pub fn create_swap_chain(
        &mut self,
        width: u32,
        height: u32,
        window: Option<&dyn WindowSource>,
    ) -> Result<SwapChainHandle> {
        let vsync = self.config.vsync;
        let (backend, s) = self.parts();
        let data = SwapChainData::create(backend, &mut s.resources, width, height, vsync, window)?;
        s.pso.set_swap_chain_format(data.format);
        if s.frame_sync.is_none() {
            s.frame_sync = Some(FrameSyncManager::new(backend)?);
        }
        Ok(s.swap_chains.alloc(data))
    }

    pub fn destroy_swap_chain(&mut self, chain: SwapChainHandle) -> Result<()> {
        let (backend, s) = self.parts();
        backend.wait_idle()?;
        s.swap_chains
            .dealloc(chain)
            .destroy(backend, &mut s.resources);
        if s.swap_chains.is_empty() {
            if let Some(sync) = s.frame_sync.take() {
                sync.destroy(backend);
            }
        }
        Ok(())
    }

    /// Registry handle of the image acquired last.
    pub fn current_swap_chain_image(&self, chain: SwapChainHandle) -> ResourceHandle {
        self.state().swap_chains.lookup(chain).current_image_handle()
    }

    pub fn swap_chain_extent(&self, chain: SwapChainHandle) -> (u32, u32) {
        let data = self.state().swap_chains.lookup(chain);
        (data.width, data.height)
    }

    pub fn swap_chain_format(&self, chain: SwapChainHandle) -> ImageFormat {
        self.state().swap_chains.lookup(chain).format
    }

    pub fn is_swap_chain_valid(&self, chain: SwapChainHandle) -> bool {
        self.state().swap_chains.lookup(chain).valid
    }

    /// Render-pass targets with the acquired swap-chain image as the only
    /// color attachment.
    pub fn swap_chain_targets(&self, chain: SwapChainHandle) -> RenderPassTargets {
        let data = self.state().swap_chains.lookup(chain);
        RenderPassTargets::new(data.width, data.height).with_color(data.current_image_handle())
    }

    /// Rebuild `chain` and everything that depends on it at the new size.
    /// A zero extent only marks the chain invalid.
    pub fn window_resize(&mut self, chain: SwapChainHandle, width: u32, height: u32) -> Result<()> {
        let (backend, s) = self.parts();
        backend.wait_idle()?;
        let data = s.swap_chains.lookup_mut(chain);
        if width == 0 || height == 0 {
            return data.resize(backend, &mut s.resources, width, height);
        }
        s.pso.destroy_all_pso_perms(backend)?;
        data.resize(backend, &mut s.resources, width, height)?;
        s.pso.set_swap_chain_format(data.format);
        if let Some(sync) = s.frame_sync.take() {
            sync.destroy(backend);
        }
        s.frame_sync = Some(FrameSyncManager::new(backend)?);
        Ok(())
    }

    pub fn window_minimized(&mut self, chain: SwapChainHandle) {
        let (_, s) = self.parts();
        s.swap_chains.lookup_mut(chain).valid = false;
        debug!("Window minimized, swap chain {chain:?} suspended");
    }

    /// Destroy and rebuild the whole layer with the same config on the same
    /// backend. Handles issued before are rejected afterwards.
    pub fn recreate_context(&mut self) -> Result<()> {
        info!("Recreating graphics context");
        if let Some(state) = self.state.take() {
            state.destroy(self.backend.as_mut())?;
        }
        self.epoch = self.epoch.wrapping_add(1);
        self.state = Some(DeviceState::new(
            self.backend.as_mut(),
            &self.config,
            self.epoch,
        )?);
        Ok(())
    }

    // Framebuffers

    /// Register a reusable attachment set. The targets stay owned by the
    /// resource registry.
    pub fn create_framebuffer(
        &mut self,
        colors: &[ResourceHandle],
        depth: ResourceHandle,
        width: u32,
        height: u32,
    ) -> FramebufferHandle {
        let targets = colors
            .iter()
            .fold(RenderPassTargets::new(width, height), |targets, color| {
                targets.with_color(*color)
            })
            .with_depth(depth);
        let (_, s) = self.parts();
        s.framebuffers.alloc(targets)
    }

    pub fn framebuffer_targets(&self, framebuffer: FramebufferHandle) -> RenderPassTargets {
        *self.state().framebuffers.lookup(framebuffer)
    }

    pub fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        let (_, s) = self.parts();
        s.framebuffers.dealloc(framebuffer);
    }

    // Default textures

    /// Create and clear every [`DefaultTexture`] through `stream`, then
    /// submit it immediately.
    pub fn create_all_default_textures(&mut self, stream: &mut CommandStream) -> Result<()> {
        let black = self.create_resource(
            &ResourceDesc::image_2d(
                2,
                2,
                ImageFormat::Rgba8Srgb,
                ImageUsageFlags::SAMPLED | ImageUsageFlags::TRANSFER_DST,
            )
            .with_label("Default black"),
        )?;
        stream.cmd_transition_layout(
            "Default black",
            black,
            ImageLayout::Undefined,
            ImageLayout::TransferDst,
        );
        stream.cmd_clear("Default black", black, [0.0, 0.0, 0.0, 1.0]);
        stream.cmd_transition_layout(
            "Default black",
            black,
            ImageLayout::TransferDst,
            ImageLayout::ShaderRead,
        );
        self.submit_cmds_immediate(stream)?;
        stream.clear();

        let (_, s) = self.parts();
        s.default_textures[DefaultTexture::Black2x2.index()] = black;
        Ok(())
    }

    #[track_caller]
    pub fn default_texture(&self, texture: DefaultTexture) -> ResourceHandle {
        let handle = self.state().default_textures[texture.index()];
        if !handle.is_valid() {
            fatal(format!("default texture {texture:?} was never created"));
        }
        handle
    }

    pub fn destroy_default_textures(&mut self) -> Result<()> {
        for texture in DefaultTexture::ALL {
            let (backend, s) = self.parts();
            let handle = std::mem::replace(
                &mut s.default_textures[texture.index()],
                ResourceHandle::INVALID,
            );
            if handle.is_valid() {
                s.resources.destroy(backend, handle)?;
            }
        }
        Ok(())
    }

    // Teardown

    /// Release every object of the layer. Calling any other method
    /// afterwards is fatal.
    pub fn destroy(&mut self) -> Result<()> {
        let Some(state) = self.state.take() else {
            return Ok(());
        };
        state.destroy(self.backend.as_mut())?;
        info!("Graphics context destroyed");
        Ok(())
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            error!("Graphics context teardown failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullControl;
    use crate::backend::DeviceCommand;
    use crate::handle::PoolHandle;
    use tinker_core::BufferUsage;

    fn headless() -> (GraphicsContext, NullControl) {
        let backend = NullBackend::new();
        let control = backend.control();
        let ctx = GraphicsContext::new(Box::new(backend), GraphicsConfig::headless()).unwrap();
        (ctx, control)
    }

    #[test]
    fn staging_upload_reaches_device_local_buffer() {
        let (mut ctx, _control) = headless();
        let staging = ctx
            .create_resource(&ResourceDesc::buffer(BufferUsage::Staging, 64))
            .unwrap();
        let device = ctx
            .create_resource(&ResourceDesc::buffer(BufferUsage::Vertex, 64))
            .unwrap();
        let readback = ctx
            .create_resource(&ResourceDesc::buffer(BufferUsage::Staging, 64))
            .unwrap();

        let bytes: Vec<u8> = (1..=64).collect();
        ctx.map_resource(staging).copy_from_slice(&bytes);
        ctx.unmap_resource(staging).unwrap();

        let mut stream = ctx.create_command_stream();
        stream.cmd_copy("Upload", staging, device, 64);
        ctx.submit_cmds_immediate(&stream).unwrap();

        stream.clear();
        stream.cmd_copy("Readback", device, readback, 64);
        ctx.submit_cmds_immediate(&stream).unwrap();

        assert_eq!(ctx.map_resource(readback), &bytes[..]);
    }

    #[test]
    fn frame_loop_presents_each_frame() {
        let (mut ctx, control) = headless();
        let chain = ctx.create_swap_chain(64, 64, None).unwrap();
        let mut stream = ctx.create_command_stream();

        for _ in 0..3 {
            assert!(ctx.acquire_frame(chain).unwrap());
            stream.clear();
            let image = ctx.current_swap_chain_image(chain);
            stream.cmd_transition_layout(
                "Swap chain",
                image,
                ImageLayout::Undefined,
                ImageLayout::RenderOptimal,
            );
            stream.cmd_render_pass_begin("Clear", ctx.swap_chain_targets(chain));
            stream.cmd_render_pass_end("Clear");
            stream.cmd_transition_layout(
                "Swap chain",
                image,
                ImageLayout::RenderOptimal,
                ImageLayout::Present,
            );
            ctx.begin_frame_recording().unwrap();
            ctx.process_frame_commands(&stream).unwrap();
            ctx.end_frame_recording().unwrap();
            ctx.submit_frame_to_gpu().unwrap();
            assert!(ctx.present(chain).unwrap());
            ctx.end_frame();
        }

        assert_eq!(control.presents().len(), 3);
        assert_eq!(ctx.frame_counter(), 3);
        assert_eq!(ctx.current_frame_in_flight(), 1);
    }

    #[test]
    fn resize_recreates_swap_chain_state() {
        let (mut ctx, control) = headless();
        let chain = ctx.create_swap_chain(64, 64, None).unwrap();
        let old_image = ctx.current_swap_chain_image(chain);

        control.inject_out_of_date();
        assert!(!ctx.acquire_frame(chain).unwrap());
        assert!(!ctx.is_swap_chain_valid(chain));
        // Still invalid until recreated.
        assert!(!ctx.acquire_frame(chain).unwrap());

        ctx.window_resize(chain, 128, 96).unwrap();
        assert!(ctx.is_swap_chain_valid(chain));
        assert_eq!(ctx.swap_chain_extent(chain), (128, 96));
        assert_eq!(ctx.swap_chain_format(chain), ImageFormat::Bgra8Srgb);
        let image = ctx.current_swap_chain_image(chain);
        assert_ne!(image, old_image);
        assert_eq!(ctx.resource(image).desc.dims[0], 128);
        assert!(ctx.acquire_frame(chain).unwrap());
    }

    #[test]
    fn minimize_suspends_until_resize() {
        let (mut ctx, _control) = headless();
        let chain = ctx.create_swap_chain(64, 64, None).unwrap();
        ctx.window_minimized(chain);
        assert!(!ctx.acquire_frame(chain).unwrap());
        ctx.window_resize(chain, 0, 0).unwrap();
        assert!(!ctx.acquire_frame(chain).unwrap());
        ctx.window_resize(chain, 64, 64).unwrap();
        assert!(ctx.acquire_frame(chain).unwrap());
    }

    #[test]
    fn default_black_texture_is_cleared() {
        let (mut ctx, control) = headless();
        let mut stream = ctx.create_command_stream();
        ctx.create_all_default_textures(&mut stream).unwrap();
        assert!(stream.is_empty());

        let black = ctx.default_texture(DefaultTexture::Black2x2);
        assert_eq!(ctx.resource(black).desc.image_format, ImageFormat::Rgba8Srgb);
        let submitted = control.submissions().concat();
        assert!(submitted.iter().any(|c| matches!(
            c,
            DeviceCommand::ClearColorImage { color, .. } if *color == [0.0, 0.0, 0.0, 1.0]
        )));

        ctx.destroy_default_textures().unwrap();
        assert!(!ctx.state().resources.contains(black));
    }

    #[test]
    fn framebuffers_hand_back_their_targets() {
        let (mut ctx, _control) = headless();
        let color = ctx
            .create_resource(&ResourceDesc::image_2d(
                32,
                32,
                ImageFormat::Rgba16Float,
                ImageUsageFlags::RENDER_TARGET,
            ))
            .unwrap();
        let depth = ctx
            .create_resource(&ResourceDesc::image_2d(
                32,
                32,
                ImageFormat::Depth32F,
                ImageUsageFlags::DEPTH_STENCIL,
            ))
            .unwrap();
        let framebuffer = ctx.create_framebuffer(&[color], depth, 32, 32);
        let targets = ctx.framebuffer_targets(framebuffer);
        assert_eq!(targets.colors(), &[color]);
        assert_eq!(targets.depth, depth);
        ctx.destroy_framebuffer(framebuffer);
        assert!(ctx.resource(color).is_owned());
    }

    #[test]
    fn destroy_releases_every_object() {
        let (mut ctx, control) = headless();
        let chain = ctx.create_swap_chain(64, 64, None).unwrap();
        ctx.create_resource(&ResourceDesc::buffer(BufferUsage::Uniform, 256))
            .unwrap();
        let mut stream = ctx.create_command_stream();
        ctx.create_all_default_textures(&mut stream).unwrap();
        assert!(ctx.acquire_frame(chain).unwrap());

        ctx.destroy().unwrap();
        assert_eq!(control.live_buffers(), 0);
        assert_eq!(control.live_images(), 0);
        assert_eq!(control.live_fences(), 0);
        assert_eq!(control.live_descriptor_sets(), 0);
        assert_eq!(control.live_memory_blocks(), 0);
        // Dropping after an explicit destroy is a no-op.
        drop(ctx);
    }

    #[test]
    fn recreate_context_invalidates_old_handles() {
        let (mut ctx, _control) = headless();
        let buffer = ctx
            .create_resource(&ResourceDesc::buffer(BufferUsage::Staging, 16))
            .unwrap();
        ctx.recreate_context().unwrap();
        let again = ctx
            .create_resource(&ResourceDesc::buffer(BufferUsage::Staging, 16))
            .unwrap();
        assert_eq!(buffer.pool_index().index(), again.pool_index().index());
        assert_ne!(buffer, again);
        assert!(!ctx.state().resources.contains(buffer));
        ctx.map_resource(again).fill(7);
        ctx.unmap_resource(again).unwrap();
    }

    #[test]
    #[should_panic(expected = "stale or invalid resource handle")]
    fn handle_from_before_recreate_is_fatal() {
        let (mut ctx, _control) = headless();
        let buffer = ctx
            .create_resource(&ResourceDesc::buffer(BufferUsage::Staging, 16))
            .unwrap();
        ctx.recreate_context().unwrap();
        ctx.create_resource(&ResourceDesc::buffer(BufferUsage::Staging, 16))
            .unwrap();
        ctx.map_resource(buffer);
    }

    #[test]
    fn swap_chain_handles_do_not_survive_recreate() {
        let (mut ctx, _control) = headless();
        let chain = ctx.create_swap_chain(8, 8, None).unwrap();
        ctx.recreate_context().unwrap();
        let rebuilt = ctx.create_swap_chain(8, 8, None).unwrap();
        assert_ne!(chain, rebuilt);
        assert!(ctx.state().swap_chains.get(chain).is_none());
        assert!(ctx.is_swap_chain_valid(rebuilt));
    }

    #[test]
    #[should_panic(expected = "used after destroy")]
    fn use_after_destroy_is_fatal() {
        let (mut ctx, _control) = headless();
        ctx.destroy().unwrap();
        ctx.end_frame();
    }
}
