//! Frame loop driver and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tinker_gfx::{
    BackendKind, CommandStream, GraphicsContext, SwapChainHandle, WindowSource,
};
use tracing::{debug, error, info};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::TinkerApp;
use crate::config::AppConfig;
use crate::frame::FrameContext;

/// What happened to one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// No image was acquired; the swap chain was rebuilt if it could be.
    Skipped,
}

/// Drives [`GraphicsContext`] through acquire, record, submit and present
/// for a single swap chain.
pub struct FrameDriver {
    gfx: GraphicsContext,
    swap_chain: SwapChainHandle,
    stream: CommandStream,
    extent: (u32, u32),
    last_frame: Instant,
    presented: u64,
    skipped: u64,
}

impl FrameDriver {
    pub fn new(
        mut gfx: GraphicsContext,
        width: u32,
        height: u32,
        window: Option<&dyn WindowSource>,
    ) -> anyhow::Result<Self> {
        let swap_chain = gfx.create_swap_chain(width, height, window)?;
        let stream = gfx.create_command_stream();
        Ok(Self {
            gfx,
            swap_chain,
            stream,
            extent: (width, height),
            last_frame: Instant::now(),
            presented: 0,
            skipped: 0,
        })
    }

    pub fn gfx(&self) -> &GraphicsContext {
        &self.gfx
    }

    pub fn gfx_mut(&mut self) -> &mut GraphicsContext {
        &mut self.gfx
    }

    pub fn swap_chain(&self) -> SwapChainHandle {
        self.swap_chain
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented
    }

    pub fn skipped_frames(&self) -> u64 {
        self.skipped
    }

    /// Record the new window size. A zero extent suspends the swap chain
    /// until the next non-zero resize.
    pub fn resize<A: TinkerApp>(&mut self, app: &mut A, width: u32, height: u32) -> anyhow::Result<()> {
        self.extent = (width, height);
        if width == 0 || height == 0 {
            self.gfx.window_minimized(self.swap_chain);
            return Ok(());
        }
        self.rebuild(app)
    }

    fn rebuild<A: TinkerApp>(&mut self, app: &mut A) -> anyhow::Result<()> {
        let (width, height) = self.extent;
        self.gfx.window_resize(self.swap_chain, width, height)?;
        let (width, height) = self.gfx.swap_chain_extent(self.swap_chain);
        app.on_resize(&mut self.gfx, width, height)
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn render_frame<A: TinkerApp>(&mut self, app: &mut A) -> anyhow::Result<FrameOutcome> {
        if !self.gfx.acquire_frame(self.swap_chain)? {
            self.skipped += 1;
            let (width, height) = self.extent;
            if width > 0 && height > 0 && !self.gfx.is_swap_chain_valid(self.swap_chain) {
                debug!(width, height, "Recreating swap chain after skipped frame");
                self.rebuild(app)?;
            }
            return Ok(FrameOutcome::Skipped);
        }

        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;

        self.stream.clear();
        let mut frame = FrameContext {
            stream: &mut self.stream,
            swap_chain: self.swap_chain,
            image: self.gfx.current_swap_chain_image(self.swap_chain),
            targets: self.gfx.swap_chain_targets(self.swap_chain),
            frame_in_flight: self.gfx.current_frame_in_flight(),
            frame_number: self.gfx.frame_counter(),
            dt,
        };
        app.render(&self.gfx, &mut frame)?;

        self.gfx.begin_frame_recording()?;
        self.gfx.process_frame_commands(&self.stream)?;
        self.gfx.end_frame_recording()?;
        self.gfx.submit_frame_to_gpu()?;
        if !self.gfx.present(self.swap_chain)? {
            debug!("Present reported a stale swap chain");
        }
        self.gfx.end_frame();
        self.presented += 1;
        Ok(FrameOutcome::Presented)
    }

    /// Tear down the swap chain and the context.
    pub fn shutdown<A: TinkerApp>(mut self, app: &mut A) -> anyhow::Result<()> {
        app.cleanup(&mut self.gfx);
        self.gfx.destroy_swap_chain(self.swap_chain)?;
        self.gfx.destroy()?;
        info!(
            presented = self.presented,
            skipped = self.skipped,
            "Frame loop finished"
        );
        Ok(())
    }
}

fn frame_budget(config: &AppConfig) -> Option<Duration> {
    config
        .target_fps
        .filter(|&fps| fps > 0)
        .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
}

fn pace(budget: Option<Duration>, frame_start: Instant) {
    if let Some(budget) = budget {
        let elapsed = frame_start.elapsed();
        if elapsed < budget {
            thread::sleep(budget - elapsed);
        }
    }
}

/// Run `A` with the backend selected by the config: windowed for Vulkan,
/// headless for the null backend.
pub fn run_app<A: TinkerApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    info!("{} starting...", config.title);
    match config.graphics.backend {
        BackendKind::Null => run_headless::<A>(&config),
        BackendKind::Vulkan => run_windowed::<A>(config),
    }
}

/// Render `config.headless_frames()` frames without a window.
pub fn run_headless<A: TinkerApp>(config: &AppConfig) -> anyhow::Result<()> {
    let gfx = GraphicsContext::from_config(config.graphics.clone(), None)?;
    let mut driver = FrameDriver::new(gfx, config.width, config.height, None)?;
    let swap_chain = driver.swap_chain();
    let mut app = A::init(driver.gfx_mut(), swap_chain)?;
    let budget = frame_budget(config);

    let frames = config.headless_frames();
    while driver.presented_frames() < frames {
        let frame_start = Instant::now();
        if driver.render_frame(&mut app)? == FrameOutcome::Skipped
            && driver.skipped_frames() > frames
        {
            anyhow::bail!("swap chain kept going stale");
        }
        pace(budget, frame_start);
    }
    driver.shutdown(&mut app)
}

/// Create a window and run `A` until it closes or the frame limit is hit.
pub fn run_windowed<A: TinkerApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        failure: None,
    };
    event_loop.run_app(&mut runner)?;
    runner.failure.map_or(Ok(()), Err)
}

struct AppRunner<A: TinkerApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    failure: Option<anyhow::Error>,
}

struct AppState<A: TinkerApp> {
    // Declared before the window so the surface goes first.
    driver: Option<FrameDriver>,
    app: A,
    window: Arc<Window>,
    budget: Option<Duration>,
}

impl<A: TinkerApp> AppState<A> {
    fn shutdown(&mut self) -> anyhow::Result<()> {
        match self.driver.take() {
            Some(driver) => driver.shutdown(&mut self.app),
            None => Ok(()),
        }
    }
}

impl<A: TinkerApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);
        let surface: &Window = &window;

        let gfx = GraphicsContext::from_config(self.config.graphics.clone(), Some(surface))?;
        let size = window.inner_size();
        let mut driver = FrameDriver::new(gfx, size.width, size.height, Some(surface))?;
        let swap_chain = driver.swap_chain();
        let app = A::init(driver.gfx_mut(), swap_chain)?;

        Ok(AppState {
            driver: Some(driver),
            app,
            window,
            budget: frame_budget(&self.config),
        })
    }

    fn exit(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            if let Err(e) = state.shutdown() {
                error!("Shutdown error: {e:#}");
                self.failure.get_or_insert(e);
            }
        }
        event_loop.exit();
    }
}

impl<A: TinkerApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }
        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.failure = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.exit(event_loop);
            }
            WindowEvent::Resized(size) => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Some(driver) = &mut state.driver {
                    if let Err(e) = driver.resize(&mut state.app, size.width, size.height) {
                        error!("Resize error: {e:#}");
                    }
                }
            }
            WindowEvent::RedrawRequested => {
                let limit = self.config.frames;
                let Some(state) = &mut self.state else {
                    return;
                };
                let Some(driver) = &mut state.driver else {
                    return;
                };
                let frame_start = Instant::now();
                let done = match driver.render_frame(&mut state.app) {
                    Ok(_) => limit.is_some_and(|limit| driver.presented_frames() >= limit),
                    Err(e) => {
                        error!("Render error: {e:#}");
                        self.failure = Some(e);
                        true
                    }
                };
                pace(state.budget, frame_start);
                if done {
                    self.exit(event_loop);
                } else {
                    state.window.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinker_core::ImageLayout;
    use tinker_gfx::backend::null::{NullBackend, NullControl};
    use tinker_gfx::GraphicsConfig;

    struct ClearApp {
        resizes: Vec<(u32, u32)>,
        cleaned_up: bool,
    }

    impl TinkerApp for ClearApp {
        fn init(_gfx: &mut GraphicsContext, _swap_chain: SwapChainHandle) -> anyhow::Result<Self> {
            Ok(Self {
                resizes: Vec::new(),
                cleaned_up: false,
            })
        }

        fn render(
            &mut self,
            _gfx: &GraphicsContext,
            frame: &mut FrameContext<'_>,
        ) -> anyhow::Result<()> {
            assert!(frame.stream.is_empty());
            frame.stream.cmd_transition_layout(
                "Swap chain",
                frame.image,
                ImageLayout::Undefined,
                ImageLayout::RenderOptimal,
            );
            frame.stream.cmd_render_pass_begin("Clear", frame.targets);
            frame.stream.cmd_render_pass_end("Clear");
            frame.stream.cmd_transition_layout(
                "Swap chain",
                frame.image,
                ImageLayout::RenderOptimal,
                ImageLayout::Present,
            );
            Ok(())
        }

        fn on_resize(&mut self, _gfx: &mut GraphicsContext, width: u32, height: u32) -> anyhow::Result<()> {
            self.resizes.push((width, height));
            Ok(())
        }

        fn cleanup(&mut self, _gfx: &mut GraphicsContext) {
            self.cleaned_up = true;
        }
    }

    fn driver() -> (FrameDriver, ClearApp, NullControl) {
        let backend = NullBackend::new();
        let control = backend.control();
        let gfx = GraphicsContext::new(Box::new(backend), GraphicsConfig::headless()).unwrap();
        let mut driver = FrameDriver::new(gfx, 64, 48, None).unwrap();
        let swap_chain = driver.swap_chain();
        let app = ClearApp::init(driver.gfx_mut(), swap_chain).unwrap();
        (driver, app, control)
    }

    #[test]
    fn frames_are_presented_in_order() {
        let (mut driver, mut app, control) = driver();
        for _ in 0..4 {
            assert_eq!(driver.render_frame(&mut app).unwrap(), FrameOutcome::Presented);
        }
        assert_eq!(driver.presented_frames(), 4);
        assert_eq!(driver.gfx().frame_counter(), 4);
        assert_eq!(control.presents().len(), 4);
    }

    #[test]
    fn stale_swap_chain_is_rebuilt_then_rendered() {
        let (mut driver, mut app, control) = driver();
        control.inject_out_of_date();

        assert_eq!(driver.render_frame(&mut app).unwrap(), FrameOutcome::Skipped);
        assert_eq!(app.resizes, vec![(64, 48)]);
        assert!(driver.gfx().is_swap_chain_valid(driver.swap_chain()));

        assert_eq!(driver.render_frame(&mut app).unwrap(), FrameOutcome::Presented);
        assert_eq!(driver.skipped_frames(), 1);
        assert_eq!(control.presents().len(), 1);
    }

    #[test]
    fn acquire_timeout_skips_without_rebuilding() {
        let (mut driver, mut app, control) = driver();
        control.inject_acquire_timeout();

        assert_eq!(driver.render_frame(&mut app).unwrap(), FrameOutcome::Skipped);
        assert!(app.resizes.is_empty());
        assert_eq!(driver.render_frame(&mut app).unwrap(), FrameOutcome::Presented);
        assert_eq!(control.presents().len(), 1);
    }

    #[test]
    fn minimized_window_skips_until_restored() {
        let (mut driver, mut app, control) = driver();
        driver.resize(&mut app, 0, 0).unwrap();
        assert_eq!(driver.render_frame(&mut app).unwrap(), FrameOutcome::Skipped);
        assert!(app.resizes.is_empty());

        driver.resize(&mut app, 80, 60).unwrap();
        assert_eq!(app.resizes, vec![(80, 60)]);
        assert_eq!(driver.render_frame(&mut app).unwrap(), FrameOutcome::Presented);
        assert_eq!(control.presents().len(), 1);
    }

    #[test]
    fn shutdown_releases_device_objects() {
        let (mut driver, mut app, control) = driver();
        driver.render_frame(&mut app).unwrap();
        driver.shutdown(&mut app).unwrap();
        assert!(app.cleaned_up);
        assert_eq!(control.live_fences(), 0);
        assert_eq!(control.live_memory_blocks(), 0);
    }

    #[test]
    fn headless_run_stops_at_frame_limit() {
        let config = AppConfig::new("Headless")
            .with_graphics(GraphicsConfig::headless())
            .with_size(32, 32)
            .with_frames(2);
        run_headless::<ClearApp>(&config).unwrap();
    }

    #[test]
    fn pacing_budget_follows_target_fps() {
        let config = AppConfig::default().with_target_fps(50);
        assert_eq!(frame_budget(&config), Some(Duration::from_millis(20)));
        assert_eq!(frame_budget(&AppConfig::default()), None);
    }
}
