//! Translation of [`DeviceCommand`]s into command buffer calls.

use super::convert::{self, typed};
use crate::backend::{DeviceCommand, ImageAspect, RenderingInfo};
use ash::vk;
use hashbrown::HashMap;
use std::ffi::CString;
use tinker_core::BindPoint;

const fn bind_point(bind_point: BindPoint) -> vk::PipelineBindPoint {
    match bind_point {
        BindPoint::Graphics => vk::PipelineBindPoint::GRAPHICS,
        BindPoint::Compute => vk::PipelineBindPoint::COMPUTE,
    }
}

fn subresource_range(aspect: ImageAspect, layer_count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(convert::aspect(aspect))
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(layer_count)
}

/// State the recorder needs beyond the command itself.
pub struct Recorder<'a> {
    pub device: &'a ash::Device,
    pub debug_utils: Option<&'a ash::ext::debug_utils::Device>,
    /// Dynamic uniform bindings per descriptor set; their offsets are zero.
    pub dynamic_counts: &'a HashMap<u64, u32>,
}

impl Recorder<'_> {
    /// # Safety
    /// `cmd` must be in the recording state and every id in `command` must
    /// name a live object of this device.
    pub unsafe fn record(&self, cmd: vk::CommandBuffer, command: &DeviceCommand) {
        let device = self.device;
        unsafe {
            match command {
                DeviceCommand::BeginRendering(info) => self.begin_rendering(cmd, info),
                DeviceCommand::EndRendering => device.cmd_end_rendering(cmd),
                DeviceCommand::BindPipeline {
                    bind_point: point,
                    pipeline,
                } => device.cmd_bind_pipeline(cmd, bind_point(*point), typed(pipeline.0)),
                DeviceCommand::BindDescriptorSet {
                    bind_point: point,
                    layout,
                    set_index,
                    set,
                } => {
                    let dynamic = self.dynamic_counts.get(&set.0).copied().unwrap_or(0);
                    let offsets = vec![0_u32; dynamic as usize];
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        bind_point(*point),
                        typed(layout.0),
                        *set_index,
                        &[typed(set.0)],
                        &offsets,
                    );
                }
                DeviceCommand::BindIndexBuffer { buffer } => {
                    device.cmd_bind_index_buffer(cmd, typed(buffer.0), 0, vk::IndexType::UINT32);
                }
                DeviceCommand::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => device.cmd_draw_indexed(
                    cmd,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    *first_instance,
                ),
                DeviceCommand::Dispatch { x, y, z } => device.cmd_dispatch(cmd, *x, *y, *z),
                DeviceCommand::PushConstants {
                    layout,
                    stages,
                    data,
                } => device.cmd_push_constants(
                    cmd,
                    typed(layout.0),
                    convert::shader_stages(*stages),
                    0,
                    data,
                ),
                DeviceCommand::SetViewport(viewport) => {
                    let viewport = vk::Viewport {
                        x: viewport.x,
                        y: viewport.y,
                        width: viewport.width,
                        height: viewport.height,
                        min_depth: viewport.min_depth,
                        max_depth: viewport.max_depth,
                    };
                    device.cmd_set_viewport(cmd, 0, &[viewport]);
                }
                DeviceCommand::SetScissor(scissor) => {
                    let rect = vk::Rect2D {
                        offset: vk::Offset2D {
                            x: scissor.offset_x,
                            y: scissor.offset_y,
                        },
                        extent: vk::Extent2D {
                            width: scissor.width,
                            height: scissor.height,
                        },
                    };
                    device.cmd_set_scissor(cmd, 0, &[rect]);
                }
                DeviceCommand::CopyBuffer { src, dst, size } => {
                    let region = vk::BufferCopy::default().size(*size);
                    device.cmd_copy_buffer(cmd, typed(src.0), typed(dst.0), &[region]);
                }
                DeviceCommand::CopyBufferToImage {
                    src,
                    dst,
                    width,
                    height,
                    layer_count,
                } => {
                    let region = vk::BufferImageCopy::default()
                        .image_subresource(
                            vk::ImageSubresourceLayers::default()
                                .aspect_mask(vk::ImageAspectFlags::COLOR)
                                .mip_level(0)
                                .base_array_layer(0)
                                .layer_count(*layer_count),
                        )
                        .image_extent(vk::Extent3D {
                            width: *width,
                            height: *height,
                            depth: 1,
                        });
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        typed(src.0),
                        typed(dst.0),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
                DeviceCommand::ImageBarrier(barrier) => {
                    let image_barrier = vk::ImageMemoryBarrier2::default()
                        .src_stage_mask(convert::stages(barrier.src_stage))
                        .src_access_mask(convert::access(barrier.src_access))
                        .dst_stage_mask(convert::stages(barrier.dst_stage))
                        .dst_access_mask(convert::access(barrier.dst_access))
                        .old_layout(convert::layout(barrier.old_layout))
                        .new_layout(convert::layout(barrier.new_layout))
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(typed(barrier.image.0))
                        .subresource_range(subresource_range(barrier.aspect, barrier.layer_count));
                    let barriers = [image_barrier];
                    let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
                    device.cmd_pipeline_barrier2(cmd, &dependency);
                }
                DeviceCommand::ClearColorImage {
                    image,
                    color,
                    layer_count,
                } => {
                    let value = vk::ClearColorValue { float32: *color };
                    device.cmd_clear_color_image(
                        cmd,
                        typed(image.0),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &value,
                        &[subresource_range(ImageAspect::Color, *layer_count)],
                    );
                }
                DeviceCommand::ClearDepthImage {
                    image,
                    depth,
                    layer_count,
                } => {
                    let value = vk::ClearDepthStencilValue {
                        depth: *depth,
                        stencil: 0,
                    };
                    device.cmd_clear_depth_stencil_image(
                        cmd,
                        typed(image.0),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &value,
                        &[subresource_range(ImageAspect::Depth, *layer_count)],
                    );
                }
                DeviceCommand::ResetQueryPool { pool, first, count } => {
                    device.cmd_reset_query_pool(cmd, typed(pool.0), *first, *count);
                }
                DeviceCommand::WriteTimestamp { pool, query } => device.cmd_write_timestamp(
                    cmd,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    typed(pool.0),
                    *query,
                ),
                DeviceCommand::BeginDebugLabel { name } => {
                    if let Some(debug_utils) = self.debug_utils {
                        let name = CString::new(*name).unwrap_or_default();
                        let label = vk::DebugUtilsLabelEXT::default()
                            .label_name(&name)
                            .color([1.0, 1.0, 1.0, 1.0]);
                        debug_utils.cmd_begin_debug_utils_label(cmd, &label);
                    }
                }
                DeviceCommand::EndDebugLabel => {
                    if let Some(debug_utils) = self.debug_utils {
                        debug_utils.cmd_end_debug_utils_label(cmd);
                    }
                }
            }
        }
    }

    unsafe fn begin_rendering(&self, cmd: vk::CommandBuffer, info: &RenderingInfo) {
        let color_attachments: Vec<_> = info
            .color_views
            .iter()
            .map(|view| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(typed(view.0))
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: info.clear_color,
                        },
                    })
            })
            .collect();
        let depth_attachment = info.depth_view.map(|view| {
            vk::RenderingAttachmentInfo::default()
                .image_view(typed(view.0))
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: info.clear_depth,
                        stencil: 0,
                    },
                })
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: info.width,
                    height: info.height,
                },
            })
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }
        unsafe { self.device.cmd_begin_rendering(cmd, &rendering_info) };
    }
}
