//! Recorded graphics commands.
//!
//! Appending to a [`CommandStream`] never touches the device. The stream is
//! played back later by [`Playback`](crate::playback::Playback), into either
//! the current frame's command buffer or an immediate one.

use crate::error::fatal;
use crate::handle::{DescriptorHandle, ResourceHandle};
use bytemuck::Pod;
use tinker_core::limits::{
    MAX_DESCRIPTOR_SETS_PER_SHADER, MAX_MULTIPLE_RENDERTARGETS, PUSH_CONSTANT_LIMIT_BYTES,
};
use tinker_core::{BindPoint, BlendState, DepthState, ImageLayout, ShaderId};

/// Descriptor sets bound for one draw or dispatch; unused slots are invalid.
pub type DescriptorSlots = [DescriptorHandle; MAX_DESCRIPTOR_SETS_PER_SHADER];

#[track_caller]
pub fn descriptor_slots(descriptors: &[DescriptorHandle]) -> DescriptorSlots {
    if descriptors.len() > MAX_DESCRIPTOR_SETS_PER_SHADER {
        fatal(format!(
            "{} descriptor sets exceed the per-shader limit of {MAX_DESCRIPTOR_SETS_PER_SHADER}",
            descriptors.len()
        ));
    }
    let mut slots = [DescriptorHandle::INVALID; MAX_DESCRIPTOR_SETS_PER_SHADER];
    slots[..descriptors.len()].copy_from_slice(descriptors);
    slots
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawCall {
    pub num_indices: u32,
    pub num_instances: u32,
    pub vertex_offset: i32,
    pub index_offset: u32,
    pub shader: ShaderId,
    pub blend: BlendState,
    pub depth: DepthState,
    pub index_buffer: ResourceHandle,
    pub descriptors: DescriptorSlots,
}

impl DrawCall {
    /// A single-instance draw of `num_indices` indices with no descriptors.
    pub fn new(shader: ShaderId, index_buffer: ResourceHandle, num_indices: u32) -> Self {
        Self {
            num_indices,
            num_instances: 1,
            vertex_offset: 0,
            index_offset: 0,
            shader,
            blend: BlendState::Replace,
            depth: DepthState::OffCcw,
            index_buffer,
            descriptors: [DescriptorHandle::INVALID; MAX_DESCRIPTOR_SETS_PER_SHADER],
        }
    }

    #[must_use]
    pub fn instances(mut self, num_instances: u32) -> Self {
        self.num_instances = num_instances;
        self
    }

    #[must_use]
    pub fn offsets(mut self, index_offset: u32, vertex_offset: i32) -> Self {
        self.index_offset = index_offset;
        self.vertex_offset = vertex_offset;
        self
    }

    #[must_use]
    pub fn state(mut self, blend: BlendState, depth: DepthState) -> Self {
        self.blend = blend;
        self.depth = depth;
        self
    }

    #[must_use]
    pub fn descriptors(mut self, descriptors: &[DescriptorHandle]) -> Self {
        self.descriptors = descriptor_slots(descriptors);
        self
    }
}

/// Attachments of a render pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderPassTargets {
    pub width: u32,
    pub height: u32,
    num_color: usize,
    color: [ResourceHandle; MAX_MULTIPLE_RENDERTARGETS],
    pub depth: ResourceHandle,
}

impl RenderPassTargets {
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            num_color: 0,
            color: [ResourceHandle::INVALID; MAX_MULTIPLE_RENDERTARGETS],
            depth: ResourceHandle::INVALID,
        }
    }

    #[must_use]
    #[track_caller]
    pub fn with_color(mut self, target: ResourceHandle) -> Self {
        if self.num_color == MAX_MULTIPLE_RENDERTARGETS {
            fatal(format!(
                "more than {MAX_MULTIPLE_RENDERTARGETS} color attachments"
            ));
        }
        self.color[self.num_color] = target;
        self.num_color += 1;
        self
    }

    #[must_use]
    pub const fn with_depth(mut self, target: ResourceHandle) -> Self {
        self.depth = target;
        self
    }

    pub fn colors(&self) -> &[ResourceHandle] {
        &self.color[..self.num_color]
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GraphicsCommand {
    DrawCall(DrawCall),
    Dispatch {
        groups: [u32; 3],
        shader: ShaderId,
        descriptors: DescriptorSlots,
    },
    /// Byte copy from a buffer into a buffer or an image.
    MemTransfer {
        src: ResourceHandle,
        dst: ResourceHandle,
        size: u32,
    },
    PushConstant {
        shader: ShaderId,
        bind_point: BindPoint,
        data: [u8; PUSH_CONSTANT_LIMIT_BYTES],
        len: u8,
    },
    SetScissor {
        offset: [i32; 2],
        extent: [u32; 2],
    },
    SetViewport {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        min_depth: f32,
        max_depth: f32,
    },
    RenderPassBegin(RenderPassTargets),
    RenderPassEnd,
    LayoutTransition {
        image: ResourceHandle,
        start: ImageLayout,
        end: ImageLayout,
    },
    ClearImage {
        image: ResourceHandle,
        value: [f32; 4],
    },
    GpuTimestamp {
        name: &'static str,
        start_frame: bool,
    },
    DebugMarkerStart,
    DebugMarkerEnd,
}

/// A command and its debug label.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CommandRecord {
    pub label: &'static str,
    pub command: GraphicsCommand,
}

/// Bounded, append-only list of commands.
#[derive(Clone, Debug)]
pub struct CommandStream {
    commands: Vec<CommandRecord>,
    max_commands: usize,
}

impl CommandStream {
    pub fn new(max_commands: usize) -> Self {
        Self {
            commands: Vec::with_capacity(max_commands),
            max_commands,
        }
    }

    /// Append a command. Appending past capacity is fatal.
    #[track_caller]
    pub fn push(&mut self, label: &'static str, command: GraphicsCommand) {
        if self.commands.len() >= self.max_commands {
            fatal(format!(
                "command stream full ({} commands) appending '{label}'",
                self.max_commands
            ));
        }
        self.commands.push(CommandRecord { label, command });
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    #[inline]
    pub fn max_commands(&self) -> usize {
        self.max_commands
    }

    pub fn commands(&self) -> &[CommandRecord] {
        &self.commands
    }

    pub fn cmd_draw(&mut self, label: &'static str, draw: DrawCall) {
        self.push(label, GraphicsCommand::DrawCall(draw));
    }

    pub fn cmd_dispatch(
        &mut self,
        label: &'static str,
        groups: [u32; 3],
        shader: ShaderId,
        descriptors: &[DescriptorHandle],
    ) {
        self.push(
            label,
            GraphicsCommand::Dispatch {
                groups,
                shader,
                descriptors: descriptor_slots(descriptors),
            },
        );
    }

    pub fn cmd_copy(
        &mut self,
        label: &'static str,
        src: ResourceHandle,
        dst: ResourceHandle,
        size: u32,
    ) {
        self.push(label, GraphicsCommand::MemTransfer { src, dst, size });
    }

    #[track_caller]
    pub fn cmd_push_constant(
        &mut self,
        label: &'static str,
        shader: ShaderId,
        bind_point: BindPoint,
        bytes: &[u8],
    ) {
        if bytes.len() > PUSH_CONSTANT_LIMIT_BYTES {
            fatal(format!(
                "push constant of {} bytes exceeds {PUSH_CONSTANT_LIMIT_BYTES}",
                bytes.len()
            ));
        }
        let mut data = [0u8; PUSH_CONSTANT_LIMIT_BYTES];
        data[..bytes.len()].copy_from_slice(bytes);
        self.push(
            label,
            GraphicsCommand::PushConstant {
                shader,
                bind_point,
                data,
                len: bytes.len() as u8,
            },
        );
    }

    /// Push a plain-old-data value as push constants.
    #[track_caller]
    pub fn cmd_push_constant_pod<T: Pod>(
        &mut self,
        label: &'static str,
        shader: ShaderId,
        bind_point: BindPoint,
        value: &T,
    ) {
        self.cmd_push_constant(label, shader, bind_point, bytemuck::bytes_of(value));
    }

    pub fn cmd_set_scissor(
        &mut self,
        label: &'static str,
        offset: [i32; 2],
        extent: [u32; 2],
    ) {
        self.push(label, GraphicsCommand::SetScissor { offset, extent });
    }

    /// Full-target viewport with depth range 0..1.
    pub fn cmd_set_viewport(&mut self, label: &'static str, width: f32, height: f32) {
        self.push(
            label,
            GraphicsCommand::SetViewport {
                x: 0.0,
                y: 0.0,
                width,
                height,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        );
    }

    pub fn cmd_render_pass_begin(&mut self, label: &'static str, targets: RenderPassTargets) {
        self.push(label, GraphicsCommand::RenderPassBegin(targets));
    }

    pub fn cmd_render_pass_end(&mut self, label: &'static str) {
        self.push(label, GraphicsCommand::RenderPassEnd);
    }

    pub fn cmd_transition_layout(
        &mut self,
        label: &'static str,
        image: ResourceHandle,
        start: ImageLayout,
        end: ImageLayout,
    ) {
        self.push(label, GraphicsCommand::LayoutTransition { image, start, end });
    }

    pub fn cmd_clear(&mut self, label: &'static str, image: ResourceHandle, value: [f32; 4]) {
        self.push(label, GraphicsCommand::ClearImage { image, value });
    }

    pub fn cmd_timestamp(&mut self, name: &'static str, start_frame: bool) {
        self.push(name, GraphicsCommand::GpuTimestamp { name, start_frame });
    }

    pub fn cmd_debug_marker_start(&mut self, name: &'static str) {
        self.push(name, GraphicsCommand::DebugMarkerStart);
    }

    pub fn cmd_debug_marker_end(&mut self) {
        self.push("", GraphicsCommand::DebugMarkerEnd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_keep_append_order() {
        let mut stream = CommandStream::new(8);
        stream.cmd_debug_marker_start("Frame");
        stream.cmd_timestamp("Begin", true);
        stream.cmd_debug_marker_end();
        let labels: Vec<_> = stream.commands().iter().map(|r| r.label).collect();
        assert_eq!(labels, vec!["Frame", "Begin", ""]);
        assert!(matches!(
            stream.commands()[1].command,
            GraphicsCommand::GpuTimestamp {
                name: "Begin",
                start_frame: true
            }
        ));
    }

    #[test]
    #[should_panic(expected = "command stream full")]
    fn appending_past_capacity_is_fatal() {
        let mut stream = CommandStream::new(2);
        stream.cmd_render_pass_end("a");
        stream.cmd_render_pass_end("b");
        stream.cmd_render_pass_end("c");
    }

    #[test]
    fn clear_resets_cursor_not_capacity() {
        let mut stream = CommandStream::new(1);
        stream.cmd_render_pass_end("a");
        stream.clear();
        assert!(stream.is_empty());
        stream.cmd_render_pass_end("b");
        assert_eq!(stream.len(), 1);
        assert_eq!(stream.max_commands(), 1);
    }

    #[test]
    fn push_constant_pod_is_padded() {
        let mut stream = CommandStream::new(4);
        stream.cmd_push_constant_pod("Params", 0, BindPoint::Compute, &[1.0f32, 2.0]);
        let GraphicsCommand::PushConstant { data, len, .. } = stream.commands()[0].command else {
            panic!("expected a push constant");
        };
        assert_eq!(len, 8);
        assert_eq!(&data[..8], bytemuck::bytes_of(&[1.0f32, 2.0]));
        assert!(data[8..].iter().all(|b| *b == 0));
    }

    #[test]
    #[should_panic(expected = "exceeds 32")]
    fn oversized_push_constant_is_fatal() {
        let mut stream = CommandStream::new(4);
        stream.cmd_push_constant("Big", 0, BindPoint::Graphics, &[0u8; 40]);
    }

    #[test]
    fn render_pass_targets_track_color_count() {
        let targets = RenderPassTargets::new(64, 32)
            .with_color(ResourceHandle::INVALID)
            .with_depth(ResourceHandle::INVALID);
        assert_eq!(targets.colors().len(), 1);
        assert_eq!((targets.width, targets.height), (64, 32));
    }

    #[test]
    #[should_panic(expected = "per-shader limit")]
    fn too_many_descriptor_sets_is_fatal() {
        descriptor_slots(&[DescriptorHandle::INVALID; 5]);
    }
}
