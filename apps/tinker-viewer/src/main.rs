//! Tinker demo viewer
//!
//! Clears the swap-chain image and copies a staging buffer every frame.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p tinker-viewer -- [OPTIONS]
//! ```
//!
//! - `-c, --config <PATH>`: TOML config file (default: `tinker.toml` if present)
//! - `-b, --backend <null|vulkan>`: Override the configured backend
//! - `-f, --frames <N>`: Stop after N presented frames
//!
//! The null backend runs without a window.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod viewer;

use std::path::PathBuf;

use clap::Parser;
use tinker_app::{init_logging, run_app, AppConfig};
use tinker_gfx::BackendKind;
use tracing::info;

use crate::viewer::Viewer;

const DEFAULT_CONFIG: &str = "tinker.toml";

#[derive(Parser, Debug)]
#[command(name = "tinker-viewer")]
#[command(about = "Tinker graphics layer demo")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend to run on (null or vulkan)
    #[arg(short, long)]
    backend: Option<BackendKind>,

    /// Number of frames to present before exiting
    #[arg(short, long)]
    frames: Option<u64>,
}

impl Cli {
    fn app_config(&self) -> anyhow::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::load_or_default(DEFAULT_CONFIG),
        };
        if let Some(backend) = self.backend {
            config.graphics.backend = backend;
        }
        if let Some(frames) = self.frames {
            config.frames = Some(frames);
        }
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = cli.app_config()?;
    info!(backend = ?config.graphics.backend, frames = ?config.frames, "Viewer config");
    run_app::<Viewer>(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_overrides_config() {
        let cli = Cli::parse_from(["tinker-viewer", "--backend", "null", "--frames", "7"]);
        let config = cli.app_config().unwrap();
        assert_eq!(config.graphics.backend, BackendKind::Null);
        assert_eq!(config.frames, Some(7));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(Cli::try_parse_from(["tinker-viewer", "--backend", "metal"]).is_err());
    }
}
