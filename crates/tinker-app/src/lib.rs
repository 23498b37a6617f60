//! Application framework for the Tinker engine.
//!
//! This crate handles the boilerplate around a [`GraphicsContext`]:
//! - Configuration loading from TOML
//! - Logging initialization
//! - Window creation and the event loop
//! - The per-frame acquire, record, submit, present sequence
//! - Swap-chain recreation when a frame has to be skipped
//!
//! # Example
//!
//! ```no_run
//! use tinker_app::{run_app, AppConfig, FrameContext, TinkerApp};
//! use tinker_gfx::{GraphicsContext, SwapChainHandle};
//!
//! struct MyApp;
//!
//! impl TinkerApp for MyApp {
//!     fn init(_gfx: &mut GraphicsContext, _chain: SwapChainHandle) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn render(&mut self, _gfx: &GraphicsContext, frame: &mut FrameContext<'_>) -> anyhow::Result<()> {
//!         frame.stream.cmd_render_pass_begin("Clear", frame.targets);
//!         frame.stream.cmd_render_pass_end("Clear");
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     tinker_app::init_logging();
//!     run_app::<MyApp>(AppConfig::load_or_default("tinker.toml"))
//! }
//! ```

mod app;
mod config;
mod frame;
mod logging;
mod runner;

pub use app::TinkerApp;
pub use config::{AppConfig, DEFAULT_HEADLESS_FRAMES};
pub use frame::FrameContext;
pub use logging::init_logging;
pub use runner::{run_app, run_headless, run_windowed, FrameDriver, FrameOutcome};

pub use tinker_gfx::{GraphicsConfig, GraphicsContext};
