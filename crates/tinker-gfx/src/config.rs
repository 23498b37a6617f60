//! Graphics layer configuration.

use serde::{Deserialize, Serialize};
use tinker_core::limits::RESOURCE_POOL_MAX;

const MIB: u64 = 1024 * 1024;

/// Which backend implements the device seam.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Headless simulated device.
    Null,
    #[default]
    Vulkan,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "null" => Ok(Self::Null),
            "vulkan" => Ok(Self::Vulkan),
            other => Err(format!("unknown backend '{other}' (expected null or vulkan)")),
        }
    }
}

/// Reserved size of each memory block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryBlockSizes {
    pub device_local_buffers: u64,
    pub device_local_images: u64,
    pub host_visible_buffers: u64,
}

impl Default for MemoryBlockSizes {
    fn default() -> Self {
        Self {
            device_local_buffers: 512 * MIB,
            device_local_images: 512 * MIB,
            host_visible_buffers: 256 * MIB,
        }
    }
}

/// Graphics context configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub backend: BackendKind,
    /// Application name reported to the driver.
    pub app_name: String,
    /// Enable validation layers and debug labels.
    pub validation: bool,
    pub vsync: bool,
    pub memory: MemoryBlockSizes,
    /// Capacity of the resource pool.
    pub max_resources: u32,
    /// Default capacity for command streams created by the context.
    pub max_commands: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            app_name: "Tinker".to_string(),
            validation: cfg!(debug_assertions),
            vsync: true,
            memory: MemoryBlockSizes::default(),
            max_resources: RESOURCE_POOL_MAX,
            max_commands: 1024,
        }
    }
}

impl GraphicsConfig {
    /// Config for the headless null backend with small memory blocks.
    pub fn headless() -> Self {
        Self {
            backend: BackendKind::Null,
            validation: false,
            memory: MemoryBlockSizes {
                device_local_buffers: 16 * MIB,
                device_local_images: 16 * MIB,
                host_visible_buffers: 16 * MIB,
            },
            ..Default::default()
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_memory(mut self, memory: MemoryBlockSizes) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_max_resources(mut self, max_resources: u32) -> Self {
        self.max_resources = max_resources;
        self
    }

    pub fn with_max_commands(mut self, max_commands: usize) -> Self {
        self.max_commands = max_commands;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_block_plan() {
        let config = GraphicsConfig::default();
        assert_eq!(config.memory.device_local_buffers, 512 * MIB);
        assert_eq!(config.memory.device_local_images, 512 * MIB);
        assert_eq!(config.memory.host_visible_buffers, 256 * MIB);
        assert_eq!(config.max_resources, 512);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: GraphicsConfig = toml::from_str(
            r#"
            backend = "null"
            vsync = false

            [memory]
            host_visible_buffers = 1024
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Null);
        assert!(!config.vsync);
        assert_eq!(config.memory.host_visible_buffers, 1024);
        assert_eq!(config.memory.device_local_buffers, 512 * MIB);
        assert_eq!(config.app_name, "Tinker");
    }

    #[test]
    fn backend_parses_case_insensitively() {
        assert_eq!("Null".parse::<BackendKind>(), Ok(BackendKind::Null));
        assert_eq!("VULKAN".parse::<BackendKind>(), Ok(BackendKind::Vulkan));
        assert!("metal".parse::<BackendKind>().is_err());
    }
}
