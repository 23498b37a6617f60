use tinker_app::{FrameContext, TinkerApp};
use tinker_core::{BufferUsage, ImageLayout};
use tinker_gfx::{GraphicsContext, ResourceDesc, ResourceHandle, SwapChainHandle};
use tracing::info;

/// Bytes of the test pattern copied every frame.
pub const PATTERN_BYTES: u32 = 256;

/// Clears the swap-chain image and streams a staging pattern to a
/// device-local buffer every frame.
pub struct Viewer {
    staging: ResourceHandle,
    device_buffer: ResourceHandle,
}

fn pattern() -> Vec<u8> {
    (0..PATTERN_BYTES).map(|i| (i * 7 % 251) as u8).collect()
}

impl TinkerApp for Viewer {
    fn init(gfx: &mut GraphicsContext, _swap_chain: SwapChainHandle) -> anyhow::Result<Self> {
        let mut stream = gfx.create_command_stream();
        gfx.create_all_default_textures(&mut stream)?;

        let staging = gfx.create_resource(
            &ResourceDesc::buffer(BufferUsage::Staging, PATTERN_BYTES).with_label("Viewer staging"),
        )?;
        let device_buffer = gfx.create_resource(
            &ResourceDesc::buffer(BufferUsage::Vertex, PATTERN_BYTES).with_label("Viewer pattern"),
        )?;
        gfx.map_resource(staging).copy_from_slice(&pattern());
        gfx.unmap_resource(staging)?;

        info!(bytes = PATTERN_BYTES, "Staging pattern uploaded");
        Ok(Self {
            staging,
            device_buffer,
        })
    }

    fn render(&mut self, _gfx: &GraphicsContext, frame: &mut FrameContext<'_>) -> anyhow::Result<()> {
        let stream = &mut *frame.stream;
        stream.cmd_timestamp("Frame start", true);
        stream.cmd_copy("Pattern upload", self.staging, self.device_buffer, PATTERN_BYTES);

        stream.cmd_debug_marker_start("Clear swap chain");
        stream.cmd_transition_layout(
            "Swap chain to render",
            frame.image,
            ImageLayout::Undefined,
            ImageLayout::RenderOptimal,
        );
        stream.cmd_render_pass_begin("Clear", frame.targets);
        stream.cmd_render_pass_end("Clear");
        stream.cmd_transition_layout(
            "Swap chain to present",
            frame.image,
            ImageLayout::RenderOptimal,
            ImageLayout::Present,
        );
        stream.cmd_debug_marker_end();
        stream.cmd_timestamp("Clear", false);
        Ok(())
    }

    fn on_resize(&mut self, _gfx: &mut GraphicsContext, width: u32, height: u32) -> anyhow::Result<()> {
        info!(width, height, "Swap chain rebuilt");
        Ok(())
    }

    fn cleanup(&mut self, gfx: &mut GraphicsContext) {
        info!(
            gpu_frame_micros = gfx.total_frame_time_micros(),
            "Last measured GPU frame"
        );
        for handle in [self.staging, self.device_buffer] {
            if let Err(e) = gfx.destroy_resource(handle) {
                tracing::warn!("Failed to destroy viewer buffer: {e}");
            }
        }
        if let Err(e) = gfx.destroy_default_textures() {
            tracing::warn!("Failed to destroy default textures: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinker_app::{AppConfig, FrameDriver, FrameOutcome};
    use tinker_gfx::GraphicsConfig;

    #[test]
    fn headless_viewer_runs() {
        let config = AppConfig::new("Viewer test")
            .with_graphics(GraphicsConfig::headless())
            .with_size(64, 64)
            .with_frames(4);
        tinker_app::run_headless::<Viewer>(&config).unwrap();
    }

    #[test]
    fn pattern_reaches_device_buffer() {
        let gfx = GraphicsContext::from_config(GraphicsConfig::headless(), None).unwrap();
        let mut driver = FrameDriver::new(gfx, 32, 32, None).unwrap();
        let swap_chain = driver.swap_chain();
        let mut viewer = Viewer::init(driver.gfx_mut(), swap_chain).unwrap();
        let readback = driver
            .gfx_mut()
            .create_resource(&ResourceDesc::buffer(BufferUsage::Staging, PATTERN_BYTES))
            .unwrap();

        assert_eq!(driver.render_frame(&mut viewer).unwrap(), FrameOutcome::Presented);

        let gfx = driver.gfx_mut();
        let mut stream = gfx.create_command_stream();
        stream.cmd_copy("Readback", viewer.device_buffer, readback, PATTERN_BYTES);
        gfx.submit_cmds_immediate(&stream).unwrap();
        assert_eq!(gfx.map_resource(readback), &pattern()[..]);
    }
}
