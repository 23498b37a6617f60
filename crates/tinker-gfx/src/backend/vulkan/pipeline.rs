//! Pipeline creation using dynamic rendering.

use super::convert;
use crate::backend::GraphicsPipelineDesc;
use crate::error::{GfxError, Result};
use ash::vk;
use tinker_core::{BlendState, DepthState, ImageFormat};

/// Attachment blend state for one permutation. `None` when the pipeline has
/// no color attachments.
pub fn blend_attachment(blend: BlendState) -> Option<vk::PipelineColorBlendAttachmentState> {
    let base = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD);
    match blend {
        BlendState::AlphaBlend => Some(base.blend_enable(true)),
        BlendState::Replace => Some(base.blend_enable(false)),
        BlendState::NoColorAttachment => None,
    }
}

pub fn depth_stencil(depth: DepthState) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
    vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(depth.depth_test())
        .depth_write_enable(depth.depth_write())
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
        .depth_bounds_test_enable(false)
        .min_depth_bounds(0.0)
        .max_depth_bounds(1.0)
        .stencil_test_enable(false)
}

pub fn cull_mode(depth: DepthState) -> vk::CullModeFlags {
    if depth.culls_back_faces() {
        vk::CullModeFlags::BACK
    } else {
        vk::CullModeFlags::NONE
    }
}

unsafe fn shader_module(device: &ash::Device, code: &[u32], stage: &str) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    unsafe {
        device
            .create_shader_module(&info, None)
            .map_err(|e| GfxError::ShaderCompilation(format!("{stage}: {e}")))
    }
}

/// # Safety
/// The device must be valid and shader code must be valid SPIR-V.
pub unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    desc: &GraphicsPipelineDesc<'_>,
) -> Result<vk::Pipeline> {
    let vert_module = unsafe { shader_module(device, desc.vertex_code, "Vertex")? };
    let frag_module = match unsafe { shader_module(device, desc.fragment_code, "Fragment") } {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.destroy_shader_module(vert_module, None) };
            return Err(e);
        }
    };

    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_module)
            .name(c"main"),
    ];

    // Geometry is pulled from storage buffers.
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(cull_mode(desc.depth))
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false)
        .line_width(1.0);
    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .sample_shading_enable(false);
    let depth_stencil = depth_stencil(desc.depth);

    let (attachments, color_formats): (Vec<_>, Vec<_>) = match blend_attachment(desc.blend) {
        Some(attachment) => desc
            .color_formats
            .iter()
            .filter_map(|&fmt| convert::format(fmt).map(|vk_fmt| (attachment, vk_fmt)))
            .unzip(),
        None => (Vec::new(), Vec::new()),
    };
    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let depth_format = match desc.depth_format {
        ImageFormat::Invalid => vk::Format::UNDEFINED,
        fmt => convert::format(fmt).unwrap_or(vk::Format::UNDEFINED),
    };
    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(depth_format);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(convert::typed(desc.layout.0))
        .push_next(&mut rendering_info);

    let result = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };
    unsafe {
        device.destroy_shader_module(vert_module, None);
        device.destroy_shader_module(frag_module, None);
    }

    let pipelines = result.map_err(|(_, e)| GfxError::PipelineCreation(e.to_string()))?;
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| GfxError::PipelineCreation("no pipeline returned".into()))
}

/// # Safety
/// The device and layout must be valid and the code must be valid SPIR-V.
pub unsafe fn create_compute_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    code: &[u32],
) -> Result<vk::Pipeline> {
    let module = unsafe { shader_module(device, code, "Compute")? };

    let stage_info = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(c"main");
    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage_info)
        .layout(layout);

    let result = unsafe {
        device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };
    unsafe { device.destroy_shader_module(module, None) };

    let pipelines = result.map_err(|(_, e)| GfxError::PipelineCreation(e.to_string()))?;
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| GfxError::PipelineCreation("no pipeline returned".into()))
}
