//! `TinkerApp` trait definition.

use crate::frame::FrameContext;
use tinker_gfx::{GraphicsContext, SwapChainHandle};

/// Trait for Tinker applications.
///
/// The runner owns the graphics context and the swap chain. It acquires,
/// submits and presents every frame; the application only fills the frame's
/// command stream.
pub trait TinkerApp: Sized {
    /// Called once after the context and swap chain exist.
    fn init(gfx: &mut GraphicsContext, swap_chain: SwapChainHandle) -> anyhow::Result<Self>;

    /// Record this frame's commands into `frame.stream`. The stream is empty
    /// on entry.
    fn render(&mut self, gfx: &GraphicsContext, frame: &mut FrameContext<'_>)
        -> anyhow::Result<()>;

    /// Called after the swap chain was rebuilt at a new size.
    #[allow(unused_variables)]
    fn on_resize(&mut self, gfx: &mut GraphicsContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called before the swap chain and context are destroyed.
    #[allow(unused_variables)]
    fn cleanup(&mut self, gfx: &mut GraphicsContext) {}
}
