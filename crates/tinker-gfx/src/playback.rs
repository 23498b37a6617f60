//! Command stream playback.
//!
//! Translates [`GraphicsCommand`]s into [`DeviceCommand`]s recorded into one
//! backend command buffer. Pipeline and descriptor binds are coalesced across
//! the stream: a bind is only recorded when the bound state changes.

use crate::backend::{
    AccessFlags, CommandBufferId, DeviceCommand, GraphicsBackend, ImageAspect, ImageBarrier,
    PipelineLayoutId, PipelineStages, RenderingInfo, Scissor, ShaderStages, Viewport,
};
use crate::command::{CommandStream, DescriptorSlots, DrawCall, GraphicsCommand, RenderPassTargets};
use crate::descriptor::DescriptorSystem;
use crate::error::{fatal, Result};
use crate::handle::{DescriptorHandle, ResourceHandle};
use crate::pso::PsoCache;
use crate::resource::ResourceRegistry;
use crate::timestamps::GpuTimestamps;
use tinker_core::limits::{MAX_DESCRIPTOR_SETS_PER_SHADER, MAX_FRAMES_IN_FLIGHT};
use tinker_core::{BindPoint, BlendState, DepthState, ImageFormat, ImageLayout, ShaderId};

const NO_SETS: DescriptorSlots = [DescriptorHandle::INVALID; MAX_DESCRIPTOR_SETS_PER_SHADER];

/// Access mask and stage that must complete before leaving `layout`.
const fn src_sync(layout: ImageLayout) -> (AccessFlags, PipelineStages) {
    match layout {
        ImageLayout::Undefined => (AccessFlags::empty(), PipelineStages::TOP_OF_PIPE),
        ImageLayout::ShaderRead => (AccessFlags::SHADER_READ, PipelineStages::FRAGMENT_SHADER),
        ImageLayout::TransferDst => (AccessFlags::TRANSFER_WRITE, PipelineStages::TRANSFER),
        ImageLayout::DepthOptimal => (
            AccessFlags::DEPTH_STENCIL_READ.union(AccessFlags::DEPTH_STENCIL_WRITE),
            PipelineStages::LATE_FRAGMENT_TESTS,
        ),
        ImageLayout::RenderOptimal => (
            AccessFlags::COLOR_ATTACHMENT_WRITE,
            PipelineStages::COLOR_ATTACHMENT_OUTPUT,
        ),
        ImageLayout::General => (
            AccessFlags::SHADER_READ.union(AccessFlags::SHADER_WRITE),
            PipelineStages::COMPUTE_SHADER,
        ),
        ImageLayout::Present => (AccessFlags::empty(), PipelineStages::BOTTOM_OF_PIPE),
    }
}

/// Access mask and stage that wait on entering `layout`.
#[track_caller]
fn dst_sync(layout: ImageLayout) -> (AccessFlags, PipelineStages) {
    match layout {
        ImageLayout::Undefined => fatal("layout transition to Undefined"),
        ImageLayout::ShaderRead => (
            AccessFlags::SHADER_READ,
            PipelineStages::FRAGMENT_SHADER | PipelineStages::COMPUTE_SHADER,
        ),
        ImageLayout::TransferDst => (AccessFlags::TRANSFER_WRITE, PipelineStages::TRANSFER),
        ImageLayout::DepthOptimal => (
            AccessFlags::DEPTH_STENCIL_READ | AccessFlags::DEPTH_STENCIL_WRITE,
            PipelineStages::EARLY_FRAGMENT_TESTS,
        ),
        ImageLayout::RenderOptimal => (
            AccessFlags::COLOR_ATTACHMENT_WRITE,
            PipelineStages::COLOR_ATTACHMENT_OUTPUT,
        ),
        ImageLayout::General => (
            AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
            PipelineStages::COMPUTE_SHADER,
        ),
        ImageLayout::Present => (AccessFlags::empty(), PipelineStages::BOTTOM_OF_PIPE),
    }
}

/// Barrier moving `image` from `start` to `end`.
#[track_caller]
pub fn layout_barrier(
    image: crate::backend::ImageId,
    format: ImageFormat,
    layer_count: u32,
    start: ImageLayout,
    end: ImageLayout,
) -> ImageBarrier {
    if start == end {
        fatal(format!("layout transition from {start:?} to itself"));
    }
    let (src_access, src_stage) = src_sync(start);
    let (dst_access, dst_stage) = dst_sync(end);
    ImageBarrier {
        image,
        aspect: ImageAspect::for_format(format),
        layer_count,
        old_layout: start,
        new_layout: end,
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct BoundState {
    graphics: Option<(ShaderId, BlendState, DepthState)>,
    graphics_sets: DescriptorSlots,
    compute_shader: Option<ShaderId>,
    compute_sets: DescriptorSlots,
}

/// One playback of command streams into a command buffer.
pub struct Playback<'a> {
    pub backend: &'a mut dyn GraphicsBackend,
    pub resources: &'a ResourceRegistry,
    pub descriptors: &'a DescriptorSystem,
    pub pso: &'a mut PsoCache,
    pub timestamps: &'a mut GpuTimestamps,
    pub cmd: CommandBufferId,
    /// Virtual frame whose resource copies are used.
    pub frame: usize,
    pub frame_counter: u64,
    bound: BoundState,
    instance_counter: u32,
    /// Outside the frame loop; no timestamp range belongs to it.
    immediate: bool,
}

impl<'a> Playback<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: &'a mut dyn GraphicsBackend,
        resources: &'a ResourceRegistry,
        descriptors: &'a DescriptorSystem,
        pso: &'a mut PsoCache,
        timestamps: &'a mut GpuTimestamps,
        cmd: CommandBufferId,
        frame: usize,
        frame_counter: u64,
    ) -> Self {
        Self {
            backend,
            resources,
            descriptors,
            pso,
            timestamps,
            cmd,
            frame,
            frame_counter,
            bound: BoundState {
                graphics_sets: NO_SETS,
                compute_sets: NO_SETS,
                ..Default::default()
            },
            instance_counter: 0,
            immediate: false,
        }
    }

    /// Mark this playback as an immediate submission. GPU timestamps are
    /// then fatal, since they would land in an in-flight frame's range.
    #[must_use]
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    /// Play every command of `stream`, in order.
    pub fn process(&mut self, stream: &CommandStream) -> Result<()> {
        for record in stream.commands() {
            match record.command {
                GraphicsCommand::DrawCall(draw) => self.draw(&draw)?,
                GraphicsCommand::Dispatch {
                    groups,
                    shader,
                    descriptors,
                } => self.dispatch(groups, shader, &descriptors, record.label)?,
                GraphicsCommand::MemTransfer { src, dst, size } => self.transfer(src, dst, size),
                GraphicsCommand::PushConstant {
                    shader,
                    bind_point,
                    data,
                    len,
                } => {
                    let (layout, stages) = match bind_point {
                        BindPoint::Graphics => (
                            self.pso.graphics_layout(self.backend, shader)?,
                            ShaderStages::VERTEX | ShaderStages::FRAGMENT,
                        ),
                        BindPoint::Compute => (
                            self.pso.compute_pipeline(self.backend, shader)?.1,
                            ShaderStages::COMPUTE,
                        ),
                    };
                    self.record(DeviceCommand::PushConstants {
                        layout,
                        stages,
                        data: data[..usize::from(len)].to_vec(),
                    });
                }
                GraphicsCommand::SetScissor { offset, extent } => {
                    self.record(DeviceCommand::SetScissor(Scissor {
                        offset_x: offset[0],
                        offset_y: offset[1],
                        width: extent[0],
                        height: extent[1],
                    }));
                }
                GraphicsCommand::SetViewport {
                    x,
                    y,
                    width,
                    height,
                    min_depth,
                    max_depth,
                } => {
                    // Flipped so +Y points up in clip space.
                    self.record(DeviceCommand::SetViewport(Viewport {
                        x,
                        y: y + height,
                        width,
                        height: -height,
                        min_depth,
                        max_depth,
                    }));
                }
                GraphicsCommand::RenderPassBegin(targets) => self.render_pass_begin(&targets),
                GraphicsCommand::RenderPassEnd => self.record(DeviceCommand::EndRendering),
                GraphicsCommand::LayoutTransition { image, start, end } => {
                    let resource = self.resources.get(image);
                    let (image_id, _) = resource.image(self.frame);
                    let barrier = layout_barrier(
                        image_id,
                        resource.desc.image_format,
                        resource.desc.array_layers.max(1),
                        start,
                        end,
                    );
                    self.record(DeviceCommand::ImageBarrier(barrier));
                }
                GraphicsCommand::ClearImage { image, value } => self.clear(image, value),
                GraphicsCommand::GpuTimestamp { name, start_frame } => {
                    if self.immediate {
                        fatal(format!("GPU timestamp '{name}' in an immediate submission"));
                    }
                    if start_frame {
                        if self.frame_counter > (MAX_FRAMES_IN_FLIGHT - 1) as u64 {
                            self.timestamps.resolve(self.backend, self.frame)?;
                        }
                        self.timestamps.reset(self.backend, self.cmd, self.frame);
                    }
                    self.timestamps
                        .write(self.backend, self.cmd, self.frame, name);
                }
                GraphicsCommand::DebugMarkerStart => {
                    self.record(DeviceCommand::BeginDebugLabel { name: record.label });
                }
                GraphicsCommand::DebugMarkerEnd => self.record(DeviceCommand::EndDebugLabel),
            }
        }
        Ok(())
    }

    fn record(&mut self, command: DeviceCommand) {
        self.backend.record(self.cmd, &command);
    }

    fn draw(&mut self, draw: &DrawCall) -> Result<()> {
        let key = (draw.shader, draw.blend, draw.depth);
        if self.bound.graphics != Some(key) {
            let pipeline =
                self.pso
                    .graphics_pipeline(self.backend, draw.shader, draw.blend, draw.depth)?;
            self.record(DeviceCommand::BindPipeline {
                bind_point: BindPoint::Graphics,
                pipeline,
            });
            if self.bound.graphics.map(|(shader, ..)| shader) != Some(draw.shader) {
                self.bound.graphics_sets = NO_SETS;
            }
            self.bound.graphics = Some(key);
        }
        let layout = self.pso.graphics_layout(self.backend, draw.shader)?;
        self.bind_sets(BindPoint::Graphics, layout, &draw.descriptors);

        let index_buffer = self.resources.get(draw.index_buffer).buffer(self.frame);
        self.record(DeviceCommand::BindIndexBuffer {
            buffer: index_buffer,
        });
        self.record(DeviceCommand::DrawIndexed {
            index_count: draw.num_indices,
            instance_count: draw.num_instances,
            first_index: draw.index_offset,
            vertex_offset: draw.vertex_offset,
            first_instance: self.instance_counter,
        });
        let Some(next) = self.instance_counter.checked_add(draw.num_instances) else {
            fatal(format!(
                "instance counter overflow after {} + {} instances in one pass",
                self.instance_counter, draw.num_instances
            ));
        };
        self.instance_counter = next;
        Ok(())
    }

    fn dispatch(
        &mut self,
        groups: [u32; 3],
        shader: ShaderId,
        descriptors: &DescriptorSlots,
        label: &str,
    ) -> Result<()> {
        if groups.contains(&0) {
            fatal(format!("dispatch '{label}' with empty group count {groups:?}"));
        }
        let (pipeline, layout) = self.pso.compute_pipeline(self.backend, shader)?;
        self.record(DeviceCommand::BindPipeline {
            bind_point: BindPoint::Compute,
            pipeline,
        });
        if self.bound.compute_shader != Some(shader) {
            self.bound.compute_sets = NO_SETS;
            self.bound.compute_shader = Some(shader);
        }
        self.bind_sets(BindPoint::Compute, layout, descriptors);
        self.record(DeviceCommand::Dispatch {
            x: groups[0],
            y: groups[1],
            z: groups[2],
        });
        Ok(())
    }

    fn bind_sets(&mut self, bind_point: BindPoint, layout: PipelineLayoutId, sets: &DescriptorSlots) {
        for (index, handle) in sets.iter().enumerate() {
            let bound = match bind_point {
                BindPoint::Graphics => &mut self.bound.graphics_sets[index],
                BindPoint::Compute => &mut self.bound.compute_sets[index],
            };
            if !handle.is_valid() || *bound == *handle {
                continue;
            }
            *bound = *handle;
            let set = self.descriptors.set(*handle, self.frame);
            self.backend.record(
                self.cmd,
                &DeviceCommand::BindDescriptorSet {
                    bind_point,
                    layout,
                    set_index: index as u32,
                    set,
                },
            );
        }
    }

    fn transfer(&mut self, src: ResourceHandle, dst: ResourceHandle, size: u32) {
        let source = self.resources.get(src);
        if source.desc.is_image() {
            fatal(format!("transfer source {src:?} is an image"));
        }
        if u64::from(size) > source.desc.byte_size() {
            fatal(format!(
                "transfer of {size} bytes exceeds source '{}'",
                source.desc.debug_label
            ));
        }
        let src_buffer = source.buffer(self.frame);
        let target = self.resources.get(dst);
        let command = if target.desc.is_image() {
            let Some(bytes_per_pixel) = target.desc.image_format.upload_bytes_per_pixel() else {
                fatal(format!(
                    "buffer to image copy into unsupported format {:?}",
                    target.desc.image_format
                ));
            };
            let [width, height, _] = target.desc.dims;
            let layer_count = target.desc.array_layers.max(1);
            let image_bytes = u64::from(width)
                * u64::from(height)
                * u64::from(layer_count)
                * u64::from(bytes_per_pixel);
            if source.desc.byte_size() < image_bytes {
                fatal(format!(
                    "source '{}' of {} bytes is smaller than image '{}' of {image_bytes} bytes",
                    source.desc.debug_label,
                    source.desc.byte_size(),
                    target.desc.debug_label
                ));
            }
            DeviceCommand::CopyBufferToImage {
                src: src_buffer,
                dst: target.image(self.frame).0,
                width,
                height,
                layer_count,
            }
        } else {
            if u64::from(size) > target.desc.byte_size() {
                fatal(format!(
                    "transfer of {size} bytes exceeds destination '{}'",
                    target.desc.debug_label
                ));
            }
            DeviceCommand::CopyBuffer {
                src: src_buffer,
                dst: target.buffer(self.frame),
                size: u64::from(size),
            }
        };
        self.record(command);
    }

    fn render_pass_begin(&mut self, targets: &RenderPassTargets) {
        self.instance_counter = 0;
        let color_views = targets
            .colors()
            .iter()
            .map(|handle| self.resources.get(*handle).image(self.frame).1)
            .collect();
        let depth_view = targets
            .depth
            .is_valid()
            .then(|| self.resources.get(targets.depth).image(self.frame).1);
        self.record(DeviceCommand::BeginRendering(RenderingInfo {
            color_views,
            depth_view,
            width: targets.width,
            height: targets.height,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            clear_depth: 1.0,
        }));
    }

    fn clear(&mut self, image: ResourceHandle, value: [f32; 4]) {
        let resource = self.resources.get(image);
        let (image_id, _) = resource.image(self.frame);
        let layer_count = resource.desc.array_layers.max(1);
        let format = match resource.desc.image_format {
            ImageFormat::SwapChainFormat => self.pso.swap_chain_format(),
            other => other,
        };
        let command = match format {
            ImageFormat::Invalid => fatal(format!("clear of image {image:?} with invalid format")),
            ImageFormat::Depth32F => DeviceCommand::ClearDepthImage {
                image: image_id,
                depth: value[0],
                layer_count,
            },
            _ => DeviceCommand::ClearColorImage {
                image: image_id,
                color: value,
                layer_count,
            },
        };
        self.record(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::{NullBackend, NullControl};
    use crate::config::GraphicsConfig;
    use crate::descriptor::{DescriptorLayout, LayoutBinding};
    use crate::memory::GpuMemoryAllocator;
    use crate::pso::GraphicsPipelineInfo;
    use crate::backend::SubmitInfo;
    use crate::resource::ResourceDesc;
    use tinker_core::{BufferUsage, DescriptorType, ImageUsageFlags};

    const CODE: &[u32] = &[0x0723_0203, 0, 0, 0];

    struct Fixture {
        backend: NullBackend,
        control: NullControl,
        memory: GpuMemoryAllocator,
        resources: ResourceRegistry,
        descriptors: DescriptorSystem,
        pso: PsoCache,
        timestamps: GpuTimestamps,
    }

    impl Fixture {
        fn new() -> Self {
            let mut backend = NullBackend::new();
            let control = backend.control();
            let memory =
                GpuMemoryAllocator::new(&mut backend, &GraphicsConfig::headless().memory).unwrap();
            let mut descriptors = DescriptorSystem::new(&mut backend).unwrap();
            descriptors
                .create_layout(
                    &mut backend,
                    0,
                    &DescriptorLayout::new(&[LayoutBinding::new(DescriptorType::Ssbo)]),
                )
                .unwrap();
            let mut pso = PsoCache::new();
            pso.create_graphics_pipeline(
                &mut backend,
                &descriptors,
                0,
                &GraphicsPipelineInfo {
                    vertex_code: CODE,
                    fragment_code: CODE,
                    color_formats: &[ImageFormat::Rgba8Srgb],
                    depth_format: ImageFormat::Depth32F,
                    descriptor_layouts: &[0],
                    skip: &[],
                },
            )
            .unwrap();
            pso.create_compute_pipeline(&mut backend, &descriptors, 5, CODE, &[0])
                .unwrap();
            let timestamps = GpuTimestamps::new(&mut backend).unwrap();
            Self {
                backend,
                control,
                memory,
                resources: ResourceRegistry::new(32),
                descriptors,
                pso,
                timestamps,
            }
        }

        fn resource(&mut self, desc: ResourceDesc) -> ResourceHandle {
            self.resources
                .create(&mut self.backend, &mut self.memory, &desc)
                .unwrap()
        }

        fn descriptor(&mut self, bound: ResourceHandle) -> DescriptorHandle {
            let handle = self
                .descriptors
                .create_descriptor(&mut self.backend, 0)
                .unwrap();
            self.descriptors
                .write_simple(&mut self.backend, &self.resources, handle, &[bound]);
            handle
        }

        /// Play `stream` into a fresh command buffer and return what was
        /// recorded.
        fn play(&mut self, stream: &CommandStream, frame: usize) -> Vec<DeviceCommand> {
            let cmd = self.backend.allocate_command_buffer().unwrap();
            self.backend.begin_command_buffer(cmd).unwrap();
            Playback::new(
                &mut self.backend,
                &self.resources,
                &self.descriptors,
                &mut self.pso,
                &mut self.timestamps,
                cmd,
                frame,
                0,
            )
            .process(stream)
            .unwrap();
            self.backend.end_command_buffer(cmd).unwrap();
            self.control.recorded(cmd)
        }
    }

    fn count(commands: &[DeviceCommand], pred: impl Fn(&DeviceCommand) -> bool) -> usize {
        commands.iter().filter(|c| pred(c)).count()
    }

    #[test]
    fn redundant_binds_are_coalesced() {
        let mut f = Fixture::new();
        let indices = f.resource(ResourceDesc::buffer(BufferUsage::Index, 64));
        let ssbo = f.resource(ResourceDesc::buffer(BufferUsage::Vertex, 64));
        let set = f.descriptor(ssbo);

        let draw = DrawCall::new(0, indices, 6).descriptors(&[set]);
        let mut stream = CommandStream::new(8);
        stream.cmd_draw("A", draw);
        stream.cmd_draw("B", draw);
        stream.cmd_draw("C", draw.state(BlendState::AlphaBlend, DepthState::OffCcw));

        let recorded = f.play(&stream, 0);
        assert_eq!(
            count(&recorded, |c| matches!(c, DeviceCommand::BindPipeline { .. })),
            2
        );
        assert_eq!(
            count(&recorded, |c| matches!(c, DeviceCommand::BindDescriptorSet { .. })),
            1
        );
        assert_eq!(
            count(&recorded, |c| matches!(c, DeviceCommand::DrawIndexed { .. })),
            3
        );
    }

    #[test]
    fn instance_counter_spans_a_pass() {
        let mut f = Fixture::new();
        let indices = f.resource(ResourceDesc::buffer(BufferUsage::Index, 64));
        let mut stream = CommandStream::new(8);
        let targets = RenderPassTargets::new(4, 4);
        stream.cmd_render_pass_begin("Pass", targets);
        stream.cmd_draw("A", DrawCall::new(0, indices, 3).instances(4));
        stream.cmd_draw("B", DrawCall::new(0, indices, 3).instances(2));
        stream.cmd_render_pass_end("Pass");
        stream.cmd_render_pass_begin("Pass", targets);
        stream.cmd_draw("C", DrawCall::new(0, indices, 3));
        stream.cmd_render_pass_end("Pass");

        let first_instances: Vec<u32> = f
            .play(&stream, 0)
            .iter()
            .filter_map(|c| match c {
                DeviceCommand::DrawIndexed { first_instance, .. } => Some(*first_instance),
                _ => None,
            })
            .collect();
        assert_eq!(first_instances, vec![0, 4, 0]);
    }

    #[test]
    #[should_panic(expected = "instance counter overflow")]
    fn instance_counter_overflow_is_fatal() {
        let mut f = Fixture::new();
        let indices = f.resource(ResourceDesc::buffer(BufferUsage::Index, 64));
        let mut stream = CommandStream::new(4);
        stream.cmd_render_pass_begin("Pass", RenderPassTargets::new(4, 4));
        stream.cmd_draw("Crowd", DrawCall::new(0, indices, 3).instances(u32::MAX));
        stream.cmd_draw("One more", DrawCall::new(0, indices, 3));
        f.play(&stream, 0);
    }

    #[test]
    #[should_panic(expected = "in an immediate submission")]
    fn immediate_playback_rejects_timestamps() {
        let mut f = Fixture::new();
        let mut stream = CommandStream::new(1);
        stream.cmd_timestamp("Upload", true);
        let cmd = f.backend.allocate_command_buffer().unwrap();
        f.backend.begin_command_buffer(cmd).unwrap();
        let _ = Playback::new(
            &mut f.backend,
            &f.resources,
            &f.descriptors,
            &mut f.pso,
            &mut f.timestamps,
            cmd,
            0,
            0,
        )
        .immediate()
        .process(&stream);
    }

    #[test]
    fn replay_is_deterministic() {
        let mut f = Fixture::new();
        let indices = f.resource(ResourceDesc::buffer(BufferUsage::TransientIndex, 64));
        let staging = f.resource(ResourceDesc::buffer(BufferUsage::Staging, 64));
        let target = f.resource(ResourceDesc::buffer(BufferUsage::Vertex, 64));
        let set = f.descriptor(target);

        let mut stream = CommandStream::new(8);
        stream.cmd_copy("Upload", staging, target, 64);
        stream.cmd_draw("Draw", DrawCall::new(0, indices, 3).descriptors(&[set]));
        stream.cmd_dispatch("Cull", [2, 1, 1], 5, &[set]);

        let first = f.play(&stream, 1);
        let second = f.play(&stream, 1);
        assert_eq!(first, second);
        assert_eq!(first.len(), 8);
    }

    #[test]
    fn frames_select_their_own_copies() {
        let mut f = Fixture::new();
        let transient = f.resource(ResourceDesc::buffer(BufferUsage::TransientIndex, 64));
        let mut stream = CommandStream::new(2);
        stream.cmd_draw("Draw", DrawCall::new(0, transient, 3));

        let index_buffer = |commands: Vec<DeviceCommand>| {
            commands.into_iter().find_map(|c| match c {
                DeviceCommand::BindIndexBuffer { buffer } => Some(buffer),
                _ => None,
            })
        };
        let frame0 = index_buffer(f.play(&stream, 0));
        let frame1 = index_buffer(f.play(&stream, 1));
        assert!(frame0.is_some());
        assert_ne!(frame0, frame1);
    }

    #[test]
    fn transitions_follow_the_sync_table() {
        let mut f = Fixture::new();
        let depth = f.resource(ResourceDesc::image_2d(
            4,
            4,
            ImageFormat::Depth32F,
            ImageUsageFlags::DEPTH_STENCIL,
        ));
        let mut stream = CommandStream::new(2);
        stream.cmd_transition_layout("Depth", depth, ImageLayout::Undefined, ImageLayout::DepthOptimal);
        let recorded = f.play(&stream, 0);
        let DeviceCommand::ImageBarrier(barrier) = &recorded[0] else {
            panic!("expected a barrier");
        };
        assert_eq!(barrier.aspect, ImageAspect::Depth);
        assert_eq!(barrier.src_stage, PipelineStages::TOP_OF_PIPE);
        assert!(barrier.src_access.is_empty());
        assert_eq!(barrier.dst_stage, PipelineStages::EARLY_FRAGMENT_TESTS);
        assert_eq!(
            barrier.dst_access,
            AccessFlags::DEPTH_STENCIL_READ | AccessFlags::DEPTH_STENCIL_WRITE
        );
    }

    #[test]
    #[should_panic(expected = "to itself")]
    fn identity_transition_is_fatal() {
        layout_barrier(
            crate::backend::ImageId(1),
            ImageFormat::Rgba8Srgb,
            1,
            ImageLayout::General,
            ImageLayout::General,
        );
    }

    #[test]
    #[should_panic(expected = "transition to Undefined")]
    fn transition_to_undefined_is_fatal() {
        layout_barrier(
            crate::backend::ImageId(1),
            ImageFormat::Rgba8Srgb,
            1,
            ImageLayout::ShaderRead,
            ImageLayout::Undefined,
        );
    }

    fn upload_into_image(f: &mut Fixture, staging_bytes: u32) -> ResourceHandle {
        let staging = f.resource(ResourceDesc::buffer(BufferUsage::Staging, staging_bytes));
        let texels: Vec<u8> = (0..staging_bytes).map(|i| (i * 13 + 1) as u8).collect();
        f.resources.map(staging, 0).copy_from_slice(&texels);
        let image = f.resource(ResourceDesc::image_2d(
            2,
            2,
            ImageFormat::Rgba8Srgb,
            ImageUsageFlags::SAMPLED | ImageUsageFlags::TRANSFER_DST,
        ));

        let mut stream = CommandStream::new(1);
        stream.cmd_copy("Texture upload", staging, image, staging_bytes);
        let cmd = f.backend.allocate_command_buffer().unwrap();
        f.backend.begin_command_buffer(cmd).unwrap();
        Playback::new(
            &mut f.backend,
            &f.resources,
            &f.descriptors,
            &mut f.pso,
            &mut f.timestamps,
            cmd,
            0,
            0,
        )
        .process(&stream)
        .unwrap();
        f.backend.end_command_buffer(cmd).unwrap();
        f.backend
            .submit(&SubmitInfo {
                command_buffer: cmd,
                wait: None,
                signal: None,
                fence: None,
            })
            .unwrap();
        image
    }

    #[test]
    fn buffer_to_image_copy_fills_every_texel() {
        let mut f = Fixture::new();
        let image = upload_into_image(&mut f, 16);
        let expected: Vec<u8> = (0..16u32).map(|i| (i * 13 + 1) as u8).collect();
        let (image_id, _) = f.resources.get(image).image(0);
        assert_eq!(f.control.read_image(image_id).unwrap(), expected);
    }

    #[test]
    #[should_panic(expected = "smaller than image")]
    fn undersized_image_source_is_fatal() {
        let mut f = Fixture::new();
        upload_into_image(&mut f, 8);
    }

    #[test]
    fn viewport_is_flipped() {
        let mut f = Fixture::new();
        let mut stream = CommandStream::new(1);
        stream.cmd_set_viewport("Full", 640.0, 480.0);
        let recorded = f.play(&stream, 0);
        let DeviceCommand::SetViewport(viewport) = recorded[0] else {
            panic!("expected a viewport");
        };
        assert_eq!(viewport.y, 480.0);
        assert_eq!(viewport.height, -480.0);
    }

    #[test]
    fn depth_clear_uses_first_component() {
        let mut f = Fixture::new();
        let depth = f.resource(ResourceDesc::image_2d(
            4,
            4,
            ImageFormat::Depth32F,
            ImageUsageFlags::DEPTH_STENCIL | ImageUsageFlags::TRANSFER_DST,
        ));
        let mut stream = CommandStream::new(1);
        stream.cmd_clear("Depth", depth, [0.25, 1.0, 1.0, 1.0]);
        let recorded = f.play(&stream, 0);
        assert!(matches!(
            recorded[0],
            DeviceCommand::ClearDepthImage { depth, .. } if depth == 0.25
        ));
    }

    #[test]
    #[should_panic(expected = "empty group count")]
    fn empty_dispatch_is_fatal() {
        let mut f = Fixture::new();
        let mut stream = CommandStream::new(1);
        stream.cmd_dispatch("Nothing", [4, 0, 1], 5, &[]);
        f.play(&stream, 0);
    }

    #[test]
    #[should_panic(expected = "unsupported format")]
    fn upload_into_float_image_is_fatal() {
        let mut f = Fixture::new();
        let staging = f.resource(ResourceDesc::buffer(BufferUsage::Staging, 256));
        let hdr = f.resource(ResourceDesc::image_2d(
            4,
            4,
            ImageFormat::Rgba16Float,
            ImageUsageFlags::TRANSFER_DST,
        ));
        let mut stream = CommandStream::new(1);
        stream.cmd_copy("Upload", staging, hdr, 128);
        f.play(&stream, 0);
    }

    #[test]
    fn compute_pipeline_is_bound_for_every_dispatch() {
        let mut f = Fixture::new();
        let mut stream = CommandStream::new(4);
        stream.cmd_dispatch("A", [1, 1, 1], 5, &[]);
        stream.cmd_dispatch("B", [1, 1, 1], 5, &[]);
        stream.cmd_push_constant("Params", 5, BindPoint::Compute, &[1, 2, 3, 4]);
        let recorded = f.play(&stream, 0);
        assert_eq!(
            count(&recorded, |c| matches!(
                c,
                DeviceCommand::BindPipeline {
                    bind_point: BindPoint::Compute,
                    ..
                }
            )),
            2
        );
        assert!(matches!(
            &recorded[4],
            DeviceCommand::PushConstants { stages, data, .. }
                if *stages == ShaderStages::COMPUTE && data == &[1, 2, 3, 4]
        ));
    }
}
