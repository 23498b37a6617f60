//! Graphics layer error types.

use ash::vk;
use std::fmt::Display;
use thiserror::Error;

/// Errors surfaced by backends and the context.
///
/// Broken invariants (pool exhaustion, stale handles, invalid enum
/// combinations) never appear here; those abort through [`fatal`].
#[derive(Error, Debug)]
pub enum GfxError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be opened.
    #[error("Failed to load Vulkan: {0}")]
    Loader(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swap chain creation failed.
    #[error("Swap chain creation failed: {0}")]
    SwapChainCreation(String),

    /// Shader module creation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// The shared descriptor pool has no room left.
    #[error("Descriptor pool exhausted")]
    DescriptorPoolExhausted,

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GfxError>;

/// Logs a critical message and aborts.
///
/// Used for capacity exhaustion and caller errors, which indicate a broken
/// invariant rather than an environmental condition.
#[cold]
#[track_caller]
pub fn fatal(msg: impl Display) -> ! {
    tracing::error!("{msg}");
    panic!("{msg}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_errors_convert() {
        let err: GfxError = vk::Result::ERROR_DEVICE_LOST.into();
        assert!(matches!(err, GfxError::Vulkan(vk::Result::ERROR_DEVICE_LOST)));
    }

    #[test]
    #[should_panic(expected = "pool exhausted")]
    fn fatal_panics_with_message() {
        fatal("pool exhausted");
    }
}
