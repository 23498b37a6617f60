//! Application configuration.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tinker_gfx::{BackendKind, GraphicsConfig};

/// Frames rendered by a headless run when no limit is configured.
pub const DEFAULT_HEADLESS_FRAMES: u64 = 3;

/// Window, pacing and graphics settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Stop after this many frames (None runs until the window closes).
    pub frames: Option<u64>,
    pub graphics: GraphicsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Tinker".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            frames: None,
            graphics: GraphicsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            graphics: GraphicsConfig::default().with_app_name(title.clone()),
            title,
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("{e:#}; using defaults");
            Self::default()
        })
    }

    /// Set the window dimensions.
    #[must_use]
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    #[must_use]
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    #[must_use]
    pub fn with_frames(mut self, frames: u64) -> Self {
        self.frames = Some(frames);
        self
    }

    #[must_use]
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.graphics.backend = backend;
        self
    }

    #[must_use]
    pub fn with_graphics(mut self, graphics: GraphicsConfig) -> Self {
        self.graphics = graphics;
        self
    }

    /// Frame limit for a run without a window.
    pub fn headless_frames(&self) -> u64 {
        self.frames.unwrap_or(DEFAULT_HEADLESS_FRAMES)
    }
}
