//! Kind enumerations shared by value between callers and the graphics layer.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Shape of a resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    #[default]
    Buffer1D,
    Image2D,
}

/// What a buffer is used for. Decides both its memory class and whether it
/// is multi-buffered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferUsage {
    #[default]
    Vertex,
    Index,
    TransientVertex,
    TransientIndex,
    Staging,
    Uniform,
}

impl BufferUsage {
    pub const ALL: [Self; 6] = [
        Self::Vertex,
        Self::Index,
        Self::TransientVertex,
        Self::TransientIndex,
        Self::Staging,
        Self::Uniform,
    ];

    /// Whether each frame in flight gets its own physical copy.
    #[inline]
    pub const fn is_multi_buffered(self) -> bool {
        matches!(
            self,
            Self::TransientVertex | Self::TransientIndex | Self::Uniform
        )
    }

    /// Whether the backing memory is CPU-visible.
    #[inline]
    pub const fn is_host_visible(self) -> bool {
        !matches!(self, Self::Vertex | Self::Index)
    }
}

/// Image formats understood by the layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    #[default]
    Invalid,
    Bgra8Srgb,
    Rgba8Srgb,
    Rgba16Float,
    Depth32F,
    /// Whatever format the presentation engine picked for the swap chain.
    SwapChainFormat,
}

impl ImageFormat {
    /// Bytes per texel for formats that can be uploaded from a buffer.
    pub const fn upload_bytes_per_pixel(self) -> Option<u32> {
        match self {
            Self::Bgra8Srgb | Self::Rgba8Srgb => Some(4),
            _ => None,
        }
    }

    /// Bytes per texel of the stored image, if the format is concrete.
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            Self::Bgra8Srgb | Self::Rgba8Srgb | Self::Depth32F => Some(4),
            Self::Rgba16Float => Some(8),
            Self::Invalid | Self::SwapChainFormat => None,
        }
    }

    #[inline]
    pub const fn is_depth(self) -> bool {
        matches!(self, Self::Depth32F)
    }
}

/// Image layouts a transition can move between.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageLayout {
    #[default]
    Undefined,
    ShaderRead,
    TransferDst,
    RenderOptimal,
    DepthOptimal,
    General,
    Present,
}

bitflags! {
    /// How an image will be used.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ImageUsageFlags: u32 {
        const RENDER_TARGET = 0x01;
        const UAV = 0x02;
        const TRANSFER_DST = 0x04;
        const SAMPLED = 0x08;
        const DEPTH_STENCIL = 0x10;
    }
}

/// Color blend configurations baked into pipeline permutations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlendState {
    AlphaBlend,
    Replace,
    NoColorAttachment,
}

impl BlendState {
    pub const COUNT: usize = 3;
    pub const ALL: [Self; Self::COUNT] = [Self::AlphaBlend, Self::Replace, Self::NoColorAttachment];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Depth test/write plus culling configurations baked into pipeline
/// permutations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepthState {
    OffCcw,
    OffNoCull,
    TestOnWriteOnCcw,
    TestOnWriteOffCcw,
}

impl DepthState {
    pub const COUNT: usize = 4;
    pub const ALL: [Self; Self::COUNT] = [
        Self::OffCcw,
        Self::OffNoCull,
        Self::TestOnWriteOnCcw,
        Self::TestOnWriteOffCcw,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn depth_test(self) -> bool {
        matches!(self, Self::TestOnWriteOnCcw | Self::TestOnWriteOffCcw)
    }

    pub const fn depth_write(self) -> bool {
        matches!(self, Self::TestOnWriteOnCcw)
    }

    pub const fn culls_back_faces(self) -> bool {
        !matches!(self, Self::OffNoCull)
    }
}

/// Pipeline bind point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindPoint {
    #[default]
    Graphics,
    Compute,
}

/// Type of a single descriptor binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DescriptorType {
    /// Uniform buffer.
    Buffer,
    /// Uniform buffer with a dynamic offset.
    DynamicBuffer,
    SampledImage,
    Ssbo,
    StorageImage,
    /// Bindless array of sampled images.
    ArrayOfTextures,
}

bitflags! {
    /// Options for descriptor array writes.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DescUpdateConfigFlags: u32 {
        /// Only update the current frame's copy.
        const TRANSIENT = 0x1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_buffering_follows_usage() {
        let multi: Vec<_> = BufferUsage::ALL
            .into_iter()
            .filter(|u| u.is_multi_buffered())
            .collect();
        assert_eq!(
            multi,
            vec![
                BufferUsage::TransientVertex,
                BufferUsage::TransientIndex,
                BufferUsage::Uniform
            ]
        );
    }

    #[test]
    fn device_local_usages_are_not_host_visible() {
        assert!(!BufferUsage::Vertex.is_host_visible());
        assert!(!BufferUsage::Index.is_host_visible());
        assert!(BufferUsage::Staging.is_host_visible());
        assert!(BufferUsage::Uniform.is_host_visible());
    }

    #[test]
    fn only_8bit_color_formats_are_uploadable() {
        assert_eq!(ImageFormat::Rgba8Srgb.upload_bytes_per_pixel(), Some(4));
        assert_eq!(ImageFormat::Bgra8Srgb.upload_bytes_per_pixel(), Some(4));
        assert_eq!(ImageFormat::Rgba16Float.upload_bytes_per_pixel(), None);
        assert_eq!(ImageFormat::Depth32F.upload_bytes_per_pixel(), None);
    }

    #[test]
    fn depth_state_flags() {
        assert!(!DepthState::OffCcw.depth_test());
        assert!(DepthState::TestOnWriteOffCcw.depth_test());
        assert!(!DepthState::TestOnWriteOffCcw.depth_write());
        assert!(!DepthState::OffNoCull.culls_back_faces());
    }

    #[test]
    fn permutation_indices_are_dense() {
        for (i, blend) in BlendState::ALL.into_iter().enumerate() {
            assert_eq!(blend.index(), i);
        }
        for (i, depth) in DepthState::ALL.into_iter().enumerate() {
            assert_eq!(depth.index(), i);
        }
    }
}
