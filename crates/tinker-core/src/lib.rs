//! Core types shared between the Tinker graphics layer and its callers.
//!
//! This crate provides:
//! - Image formats, layouts and usage flags
//! - Buffer usage tags and the multi-buffering rule derived from them
//! - Pipeline blend/depth state enumerations
//! - Descriptor binding types
//! - Engine-wide frame and pool limits

pub mod limits;
pub mod types;

pub use types::{
    BindPoint, BlendState, BufferUsage, DepthState, DescUpdateConfigFlags, DescriptorType,
    ImageFormat, ImageLayout, ImageUsageFlags, ResourceType,
};

/// Identifies a shader program. Dense, caller-assigned.
pub type ShaderId = u32;

/// Identifies a descriptor layout. Dense, caller-assigned.
pub type DescriptorLayoutId = u32;
