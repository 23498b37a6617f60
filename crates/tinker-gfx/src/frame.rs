//! Frames in flight and swap-chain state.

use crate::backend::{
    AcquireStatus, CommandBufferId, FenceId, GraphicsBackend, PipelineStages, PresentStatus,
    SemaphoreId, SubmitInfo, SwapChainRequest, SwapchainId, WindowSource,
};
use crate::error::Result;
use crate::handle::ResourceHandle;
use crate::resource::{ResourceDesc, ResourceRegistry};
use tinker_core::limits::{DESIRED_NUM_SWAP_CHAIN_IMAGES, MAX_FRAMES_IN_FLIGHT};
use tinker_core::{ImageFormat, ImageUsageFlags};
use tracing::{debug, info, warn};

/// Synchronization objects of one virtual frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameSync {
    /// Signaled when the swap-chain image is available
    pub image_available: SemaphoreId,
    /// Signaled when the frame's GPU work is complete
    pub render_finished: SemaphoreId,
    /// Signaled when the frame's submission retires
    pub in_flight: FenceId,
}

impl FrameSync {
    /// The fence starts signaled so the first wait returns at once.
    pub fn new(backend: &mut dyn GraphicsBackend) -> Result<Self> {
        Ok(Self {
            image_available: backend.create_semaphore()?,
            render_finished: backend.create_semaphore()?,
            in_flight: backend.create_fence(true)?,
        })
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_semaphore(self.image_available);
        backend.destroy_semaphore(self.render_finished);
        backend.destroy_fence(self.in_flight);
    }
}

/// Per-frame sync objects of every frame in flight.
pub struct FrameSyncManager {
    frame_syncs: [FrameSync; MAX_FRAMES_IN_FLIGHT],
}

impl FrameSyncManager {
    pub fn new(backend: &mut dyn GraphicsBackend) -> Result<Self> {
        let first = FrameSync::new(backend)?;
        let mut frame_syncs = [first; MAX_FRAMES_IN_FLIGHT];
        for sync in frame_syncs.iter_mut().skip(1) {
            *sync = FrameSync::new(backend)?;
        }
        Ok(Self { frame_syncs })
    }

    pub fn get(&self, frame: usize) -> &FrameSync {
        &self.frame_syncs[frame % MAX_FRAMES_IN_FLIGHT]
    }

    /// Destroy all resources. None may be in use.
    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        for sync in &self.frame_syncs {
            sync.destroy(backend);
        }
    }
}

/// Virtual frame ring index and monotonic frame counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameClock {
    current_frame: usize,
    frame_counter: u64,
}

impl FrameClock {
    /// Index of the current virtual frame, in `0..MAX_FRAMES_IN_FLIGHT`.
    #[inline]
    pub const fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Frames ended so far.
    #[inline]
    pub const fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn advance(&mut self) {
        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;
        self.frame_counter += 1;
    }
}

/// One swap chain and the registry handles of its images.
#[derive(Debug)]
pub struct SwapChainData {
    pub swapchain: SwapchainId,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub current_image: u32,
    /// Cleared on minimize and on out-of-date or suboptimal results.
    pub valid: bool,
    pub vsync: bool,
    images: Vec<ResourceHandle>,
}

impl SwapChainData {
    pub fn create(
        backend: &mut dyn GraphicsBackend,
        resources: &mut ResourceRegistry,
        width: u32,
        height: u32,
        vsync: bool,
        window: Option<&dyn WindowSource>,
    ) -> Result<Self> {
        let created = backend.create_swap_chain(&request(width, height, vsync), window)?;
        let mut data = Self {
            swapchain: created.swapchain,
            format: created.format,
            width: created.width,
            height: created.height,
            current_image: 0,
            valid: true,
            vsync,
            images: Vec::new(),
        };
        data.register_images(resources, &created.images);
        info!(
            "Created swap chain {}x{} ({} images, {:?})",
            data.width,
            data.height,
            data.images.len(),
            data.format
        );
        Ok(data)
    }

    /// Rebuild the chain at a new size. A zero extent (minimized window)
    /// leaves the chain invalid until the next resize.
    pub fn resize(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        resources: &mut ResourceRegistry,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if width == 0 || height == 0 {
            self.valid = false;
            debug!("Swap chain minimized");
            return Ok(());
        }
        self.release_images(resources);
        let created = backend.resize_swap_chain(self.swapchain, &request(width, height, self.vsync))?;
        self.format = created.format;
        self.width = created.width;
        self.height = created.height;
        self.current_image = 0;
        self.valid = true;
        self.register_images(resources, &created.images);
        info!("Swap chain recreated at {}x{}", self.width, self.height);
        Ok(())
    }

    pub fn destroy(mut self, backend: &mut dyn GraphicsBackend, resources: &mut ResourceRegistry) {
        self.release_images(resources);
        backend.destroy_swap_chain(self.swapchain);
        info!("Destroyed swap chain {:?}", self.swapchain);
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Registry handle of the image acquired last.
    pub fn current_image_handle(&self) -> ResourceHandle {
        self.images[self.current_image as usize]
    }

    pub fn image_handles(&self) -> &[ResourceHandle] {
        &self.images
    }

    fn register_images(
        &mut self,
        resources: &mut ResourceRegistry,
        images: &[(crate::backend::ImageId, crate::backend::ImageViewId)],
    ) {
        let desc = ResourceDesc::image_2d(
            self.width,
            self.height,
            ImageFormat::SwapChainFormat,
            ImageUsageFlags::RENDER_TARGET | ImageUsageFlags::TRANSFER_DST,
        )
        .with_label("Swap chain image");
        self.images = images
            .iter()
            .map(|(image, view)| resources.register_external_image(&desc, *image, *view))
            .collect();
    }

    fn release_images(&mut self, resources: &mut ResourceRegistry) {
        for handle in self.images.drain(..) {
            resources.release_external(handle);
        }
    }
}

fn request(width: u32, height: u32, vsync: bool) -> SwapChainRequest {
    SwapChainRequest {
        width,
        height,
        image_count: DESIRED_NUM_SWAP_CHAIN_IMAGES,
        vsync,
    }
}

/// Wait for `sync`'s previous submission to retire, then acquire the next
/// image of `chain`. Returns `Ok(false)` when the frame must be skipped and
/// the chain recreated.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn acquire_frame(
    backend: &mut dyn GraphicsBackend,
    sync: &FrameSync,
    chain: &mut SwapChainData,
) -> Result<bool> {
    if !chain.valid {
        return Ok(false);
    }
    backend.wait_for_fence(sync.in_flight)?;
    match backend.acquire_next_image(chain.swapchain, sync.image_available)? {
        AcquireStatus::Acquired(index) => {
            backend.reset_fence(sync.in_flight)?;
            chain.current_image = index;
            Ok(true)
        }
        status @ (AcquireStatus::Suboptimal(_) | AcquireStatus::OutOfDate) => {
            info!("Swap chain needs recreation ({status:?}), skipping frame");
            chain.valid = false;
            Ok(false)
        }
        // The chain stays valid and the fence signaled, so the next
        // acquire retries.
        AcquireStatus::NotReady => {
            warn!("Swap chain image acquire timed out, skipping frame");
            Ok(false)
        }
    }
}

/// Submit the frame's command buffer: waits on image-available, signals
/// render-finished and the frame fence.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn submit_frame(
    backend: &mut dyn GraphicsBackend,
    sync: &FrameSync,
    command_buffer: CommandBufferId,
) -> Result<()> {
    backend.submit(&SubmitInfo {
        command_buffer,
        wait: Some((
            sync.image_available,
            PipelineStages::TRANSFER | PipelineStages::COLOR_ATTACHMENT_OUTPUT,
        )),
        signal: Some(sync.render_finished),
        fence: Some(sync.in_flight),
    })
}

/// Present the acquired image once rendering has finished. A stale chain is
/// marked invalid and reported as `Ok(false)`.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn present_frame(
    backend: &mut dyn GraphicsBackend,
    sync: &FrameSync,
    chain: &mut SwapChainData,
) -> Result<bool> {
    match backend.present(chain.swapchain, chain.current_image, sync.render_finished)? {
        PresentStatus::Presented => Ok(true),
        status => {
            warn!("Present returned {status:?}");
            chain.valid = false;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullBackend;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn chain(backend: &mut NullBackend, resources: &mut ResourceRegistry) -> SwapChainData {
        SwapChainData::create(backend, resources, 320, 240, true, None).unwrap()
    }

    #[test]
    fn clock_wraps_and_counts() {
        let mut clock = FrameClock::default();
        clock.advance();
        assert_eq!(clock.current_frame(), 1);
        clock.advance();
        assert_eq!(clock.current_frame(), 0);
        assert_eq!(clock.frame_counter(), 2);
    }

    #[test]
    fn acquire_beyond_frames_in_flight_blocks() {
        let mut backend = NullBackend::new();
        let control = backend.control();
        let mut resources = ResourceRegistry::new(16);
        let mut chain = chain(&mut backend, &mut resources);
        let frames = FrameSyncManager::new(&mut backend).unwrap();
        let mut clock = FrameClock::default();

        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            let sync = *frames.get(clock.current_frame());
            assert!(acquire_frame(&mut backend, &sync, &mut chain).unwrap());
            clock.advance();
        }

        let released = Arc::new(AtomicBool::new(false));
        let signaler = {
            let released = Arc::clone(&released);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                released.store(true, Ordering::SeqCst);
                control.signal_all_fences();
            })
        };
        let sync = *frames.get(clock.current_frame());
        assert!(acquire_frame(&mut backend, &sync, &mut chain).unwrap());
        assert!(released.load(Ordering::SeqCst));
        signaler.join().unwrap();
    }

    #[test]
    fn out_of_date_skips_the_frame() {
        let mut backend = NullBackend::new();
        let control = backend.control();
        let mut resources = ResourceRegistry::new(16);
        let mut chain = chain(&mut backend, &mut resources);
        let frames = FrameSyncManager::new(&mut backend).unwrap();

        control.inject_out_of_date();
        assert!(!acquire_frame(&mut backend, frames.get(0), &mut chain).unwrap());
        assert!(!chain.valid);
        // The fence was not consumed by the skipped frame.
        chain.resize(&mut backend, &mut resources, 320, 240).unwrap();
        assert!(acquire_frame(&mut backend, frames.get(0), &mut chain).unwrap());
    }

    #[test]
    fn acquire_timeout_skips_without_invalidating() {
        let mut backend = NullBackend::new();
        let control = backend.control();
        let mut resources = ResourceRegistry::new(16);
        let mut chain = chain(&mut backend, &mut resources);
        let frames = FrameSyncManager::new(&mut backend).unwrap();

        control.inject_acquire_timeout();
        assert!(!acquire_frame(&mut backend, frames.get(0), &mut chain).unwrap());
        assert!(chain.valid);
        assert!(acquire_frame(&mut backend, frames.get(0), &mut chain).unwrap());
    }

    #[test]
    fn submit_then_present_round_trip() {
        let mut backend = NullBackend::new();
        let control = backend.control();
        let mut resources = ResourceRegistry::new(16);
        let mut chain = chain(&mut backend, &mut resources);
        let frames = FrameSyncManager::new(&mut backend).unwrap();
        let cmd = backend.allocate_command_buffer().unwrap();

        let sync = *frames.get(0);
        assert!(acquire_frame(&mut backend, &sync, &mut chain).unwrap());
        backend.begin_command_buffer(cmd).unwrap();
        backend.end_command_buffer(cmd).unwrap();
        submit_frame(&mut backend, &sync, cmd).unwrap();
        assert!(present_frame(&mut backend, &sync, &mut chain).unwrap());
        assert_eq!(control.presents(), vec![(chain.swapchain, 0)]);
    }

    #[test]
    fn resize_replaces_image_handles() {
        let mut backend = NullBackend::new();
        let mut resources = ResourceRegistry::new(16);
        let mut chain = chain(&mut backend, &mut resources);
        let old = chain.image_handles().to_vec();
        assert_eq!(chain.image_count(), DESIRED_NUM_SWAP_CHAIN_IMAGES);

        chain.resize(&mut backend, &mut resources, 800, 600).unwrap();
        assert!(old.iter().all(|h| !resources.contains(*h)));
        assert_eq!(resources.get(chain.current_image_handle()).desc.dims[0], 800);
        assert_eq!(resources.len(), DESIRED_NUM_SWAP_CHAIN_IMAGES as usize);

        chain.resize(&mut backend, &mut resources, 0, 600).unwrap();
        assert!(!chain.valid);
        chain.destroy(&mut backend, &mut resources);
        assert!(resources.is_empty());
    }
}
