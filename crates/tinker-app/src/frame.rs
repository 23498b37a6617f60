//! Per-frame context handed to the application.

use tinker_gfx::{CommandStream, RenderPassTargets, ResourceHandle, SwapChainHandle};

/// Context for recording one frame.
pub struct FrameContext<'a> {
    /// Commands played back into this frame's command buffer.
    pub stream: &'a mut CommandStream,
    pub swap_chain: SwapChainHandle,
    /// Registry handle of the acquired swap-chain image.
    pub image: ResourceHandle,
    /// The acquired image as the only color attachment.
    pub targets: RenderPassTargets,
    pub frame_in_flight: usize,
    pub frame_number: u64,
    /// Seconds since the previous frame.
    pub dt: f32,
}
