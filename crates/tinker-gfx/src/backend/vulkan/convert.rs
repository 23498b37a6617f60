//! Translation of layer enums and ids into Vulkan types.

use crate::backend::{
    AccessFlags, BufferUsageBits, ImageAspect, PipelineStages, ShaderStages,
};
use ash::vk::{self, Handle};
use tinker_core::{DescriptorType, ImageFormat, ImageLayout, ImageUsageFlags};

/// Raw id of a Vulkan handle.
#[inline]
pub fn raw<T: Handle>(handle: T) -> u64 {
    handle.as_raw()
}

/// Vulkan handle from a raw id.
#[inline]
pub fn typed<T: Handle>(id: u64) -> T {
    T::from_raw(id)
}

/// `None` for formats a real image can never have.
pub fn format(format: ImageFormat) -> Option<vk::Format> {
    match format {
        ImageFormat::Bgra8Srgb => Some(vk::Format::B8G8R8A8_SRGB),
        ImageFormat::Rgba8Srgb => Some(vk::Format::R8G8B8A8_SRGB),
        ImageFormat::Rgba16Float => Some(vk::Format::R16G16B16A16_SFLOAT),
        ImageFormat::Depth32F => Some(vk::Format::D32_SFLOAT),
        ImageFormat::Invalid | ImageFormat::SwapChainFormat => None,
    }
}

pub fn image_format(format: vk::Format) -> Option<ImageFormat> {
    match format {
        vk::Format::B8G8R8A8_SRGB => Some(ImageFormat::Bgra8Srgb),
        vk::Format::R8G8B8A8_SRGB => Some(ImageFormat::Rgba8Srgb),
        vk::Format::R16G16B16A16_SFLOAT => Some(ImageFormat::Rgba16Float),
        vk::Format::D32_SFLOAT => Some(ImageFormat::Depth32F),
        _ => None,
    }
}

pub const fn layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::RenderOptimal => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthOptimal => vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::Present => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

pub const fn aspect(aspect: ImageAspect) -> vk::ImageAspectFlags {
    match aspect {
        ImageAspect::Color => vk::ImageAspectFlags::COLOR,
        ImageAspect::Depth => vk::ImageAspectFlags::DEPTH,
    }
}

pub fn buffer_usage(usage: BufferUsageBits) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    for (bit, vk_bit) in [
        (BufferUsageBits::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsageBits::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsageBits::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsageBits::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsageBits::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
    ] {
        if usage.contains(bit) {
            flags |= vk_bit;
        }
    }
    flags
}

pub fn image_usage(usage: ImageUsageFlags) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    for (bit, vk_bit) in [
        (ImageUsageFlags::RENDER_TARGET, vk::ImageUsageFlags::COLOR_ATTACHMENT),
        (ImageUsageFlags::UAV, vk::ImageUsageFlags::STORAGE),
        (ImageUsageFlags::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST),
        (ImageUsageFlags::SAMPLED, vk::ImageUsageFlags::SAMPLED),
        (ImageUsageFlags::DEPTH_STENCIL, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
    ] {
        if usage.contains(bit) {
            flags |= vk_bit;
        }
    }
    flags
}

pub fn access(access: AccessFlags) -> vk::AccessFlags2 {
    let mut flags = vk::AccessFlags2::empty();
    for (bit, vk_bit) in [
        (AccessFlags::SHADER_READ, vk::AccessFlags2::SHADER_READ),
        (AccessFlags::SHADER_WRITE, vk::AccessFlags2::SHADER_WRITE),
        (AccessFlags::TRANSFER_WRITE, vk::AccessFlags2::TRANSFER_WRITE),
        (AccessFlags::COLOR_ATTACHMENT_WRITE, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE),
        (AccessFlags::DEPTH_STENCIL_READ, vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ),
        (AccessFlags::DEPTH_STENCIL_WRITE, vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE),
    ] {
        if access.contains(bit) {
            flags |= vk_bit;
        }
    }
    flags
}

pub fn stages(stages: PipelineStages) -> vk::PipelineStageFlags2 {
    let mut flags = vk::PipelineStageFlags2::empty();
    for (bit, vk_bit) in [
        (PipelineStages::TOP_OF_PIPE, vk::PipelineStageFlags2::TOP_OF_PIPE),
        (PipelineStages::FRAGMENT_SHADER, vk::PipelineStageFlags2::FRAGMENT_SHADER),
        (PipelineStages::COMPUTE_SHADER, vk::PipelineStageFlags2::COMPUTE_SHADER),
        (PipelineStages::TRANSFER, vk::PipelineStageFlags2::TRANSFER),
        (PipelineStages::EARLY_FRAGMENT_TESTS, vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS),
        (PipelineStages::LATE_FRAGMENT_TESTS, vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS),
        (PipelineStages::COLOR_ATTACHMENT_OUTPUT, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT),
        (PipelineStages::BOTTOM_OF_PIPE, vk::PipelineStageFlags2::BOTTOM_OF_PIPE),
    ] {
        if stages.contains(bit) {
            flags |= vk_bit;
        }
    }
    flags
}

/// Submission wait stages use the original synchronization flags.
pub fn wait_stages(stages: PipelineStages) -> vk::PipelineStageFlags {
    vk::PipelineStageFlags::from_raw(self::stages(stages).as_raw() as u32)
}

pub fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

pub const fn descriptor_type(ty: DescriptorType) -> vk::DescriptorType {
    match ty {
        DescriptorType::Buffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::DynamicBuffer => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        DescriptorType::SampledImage | DescriptorType::ArrayOfTextures => {
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        }
        DescriptorType::Ssbo => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_map_both_ways() {
        for fmt in [
            ImageFormat::Bgra8Srgb,
            ImageFormat::Rgba8Srgb,
            ImageFormat::Rgba16Float,
            ImageFormat::Depth32F,
        ] {
            assert_eq!(format(fmt).and_then(image_format), Some(fmt));
        }
        assert_eq!(format(ImageFormat::SwapChainFormat), None);
    }

    #[test]
    fn legacy_wait_stages_keep_their_bits() {
        let flags = wait_stages(PipelineStages::TRANSFER | PipelineStages::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(
            flags,
            vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
    }
}
