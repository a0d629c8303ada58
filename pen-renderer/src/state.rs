//! Bound-but-not-yet-recorded render state, and the pure rules that turn
//! it into a render pass description.

use pen_gpu::ash::vk;
use pen_gpu::render_pass::{AttachmentDesc, MAX_COLOR_ATTACHMENTS, RenderPassDesc};

use crate::desc::{ClearFlags, ClearState, IndexFormat, Rect, Viewport};
use crate::error::RendererError;
use crate::pool::ResourceHandle;

/// Slots per binding table (constant buffers, structured buffers,
/// textures).
pub const MAX_BINDING_SLOTS: u32 = 8;

/// Vertex buffer bindings accepted by `set_vertex_buffers`.
pub const MAX_VERTEX_BUFFERS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameState {
    /// No command buffer is recording; the next recording call starts a
    /// frame.
    #[default]
    Idle,
    Recording,
    /// Recording finished but the frame has not been submitted yet.
    Ended,
}

impl FrameState {
    /// The state a recording operation leaves the frame in. Nothing may be
    /// recorded into an ended frame.
    pub(crate) fn record(self, operation: &'static str) -> Result<FrameState, RendererError> {
        match self {
            FrameState::Idle | FrameState::Recording => Ok(FrameState::Recording),
            FrameState::Ended => Err(RendererError::InvalidFrameState {
                operation,
                state: self,
            }),
        }
    }

    /// An ended frame is only waiting for its submission.
    pub(crate) fn awaiting_submit(self) -> bool {
        self == FrameState::Ended
    }

    /// The state after a submit attempt. A frame the device context still
    /// holds was not submitted and stays ended.
    pub(crate) fn after_submit(frame_still_active: bool) -> FrameState {
        if frame_still_active {
            FrameState::Ended
        } else {
            FrameState::Idle
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VertexBufferBinding {
    pub buffer: ResourceHandle,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexBufferBinding {
    pub buffer: ResourceHandle,
    pub format: IndexFormat,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TextureBinding {
    /// A texture or a render target.
    pub texture: ResourceHandle,
    pub sampler: ResourceHandle,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PendingState {
    pub vertex_shader: Option<ResourceHandle>,
    pub fragment_shader: Option<ResourceHandle>,
    pub compute_shader: Option<ResourceHandle>,

    pub colour_targets: Vec<ResourceHandle>,
    pub depth_target: Option<ResourceHandle>,
    pub colour_slice: u32,
    pub depth_slice: u32,

    pub clear_state: Option<ResourceHandle>,
    /// Set by `clear`, consumed by the next pass.
    pub clear_requested: bool,
    pub clear_colour_face: Option<u32>,
    pub clear_depth_face: Option<u32>,

    pub input_layout: Option<ResourceHandle>,
    pub vertex_buffers: Vec<Option<VertexBufferBinding>>,
    pub index_buffer: Option<IndexBufferBinding>,
    pub constant_buffers: [Option<ResourceHandle>; MAX_BINDING_SLOTS as usize],
    pub structured_buffers: [Option<ResourceHandle>; MAX_BINDING_SLOTS as usize],
    pub textures: [Option<TextureBinding>; MAX_BINDING_SLOTS as usize],

    pub rasterizer_state: Option<ResourceHandle>,
    pub blend_state: Option<ResourceHandle>,
    pub depth_stencil_state: Option<ResourceHandle>,

    pub viewport: Option<Viewport>,
    pub scissor: Option<Rect>,
    pub stencil_ref: u32,

    pub resolve_colour: Option<ResourceHandle>,

    /// Targets or clear changed since the open pass began.
    pub pass_dirty: bool,
    /// Bound buffers or textures changed since descriptor sets were last
    /// written.
    pub descriptors_dirty: bool,
}

fn check_slot(slot: u32, max: u32) -> Result<usize, RendererError> {
    if slot >= max {
        return Err(RendererError::BindingSlot { slot, max });
    }
    Ok(slot as usize)
}

impl PendingState {
    pub fn new() -> Self {
        Self {
            pass_dirty: true,
            descriptors_dirty: true,
            ..Self::default()
        }
    }

    /// Replace every target binding at once. An empty colour list is a
    /// depth-only pass.
    pub fn set_targets(
        &mut self,
        colour: &[ResourceHandle],
        depth: Option<ResourceHandle>,
        colour_slice: u32,
        depth_slice: u32,
    ) -> Result<(), RendererError> {
        if colour.len() > MAX_COLOR_ATTACHMENTS {
            return Err(RendererError::TooManyTargets(colour.len()));
        }
        self.colour_targets.clear();
        self.colour_targets.extend_from_slice(colour);
        self.depth_target = depth;
        self.colour_slice = colour_slice;
        self.depth_slice = depth_slice;
        self.pass_dirty = true;
        Ok(())
    }

    pub fn set_clear(
        &mut self,
        clear_state: ResourceHandle,
        colour_face: Option<u32>,
        depth_face: Option<u32>,
    ) {
        self.clear_state = Some(clear_state);
        self.clear_requested = true;
        self.clear_colour_face = colour_face;
        self.clear_depth_face = depth_face;
        self.pass_dirty = true;
    }

    /// Array layer the colour targets render to in the next pass.
    pub fn effective_colour_slice(&self) -> u32 {
        self.clear_colour_face.unwrap_or(self.colour_slice)
    }

    pub fn effective_depth_slice(&self) -> u32 {
        self.clear_depth_face.unwrap_or(self.depth_slice)
    }

    /// Called once a pass has been begun with the current state.
    pub fn consume_clear(&mut self) {
        self.clear_requested = false;
        self.clear_colour_face = None;
        self.clear_depth_face = None;
        self.pass_dirty = false;
    }

    pub fn set_vertex_buffers(
        &mut self,
        first: u32,
        buffers: &[ResourceHandle],
        offsets: &[u64],
    ) -> Result<(), RendererError> {
        let end = first as usize + buffers.len();
        if end > MAX_VERTEX_BUFFERS as usize {
            return Err(RendererError::BindingSlot {
                slot: end as u32 - 1,
                max: MAX_VERTEX_BUFFERS,
            });
        }
        if offsets.len() > buffers.len() {
            return Err(RendererError::InvalidDescriptor(format!(
                "{} vertex buffer offsets for {} buffers",
                offsets.len(),
                buffers.len()
            )));
        }
        if self.vertex_buffers.len() < end {
            self.vertex_buffers.resize(end, None);
        }
        for (i, &buffer) in buffers.iter().enumerate() {
            self.vertex_buffers[first as usize + i] = Some(VertexBufferBinding {
                buffer,
                offset: offsets.get(i).copied().unwrap_or(0),
            });
        }
        Ok(())
    }

    pub fn set_constant_buffer(
        &mut self,
        slot: u32,
        buffer: Option<ResourceHandle>,
    ) -> Result<(), RendererError> {
        let index = check_slot(slot, MAX_BINDING_SLOTS)?;
        self.constant_buffers[index] = buffer;
        self.descriptors_dirty = true;
        Ok(())
    }

    pub fn set_structured_buffer(
        &mut self,
        slot: u32,
        buffer: Option<ResourceHandle>,
    ) -> Result<(), RendererError> {
        let index = check_slot(slot, MAX_BINDING_SLOTS)?;
        self.structured_buffers[index] = buffer;
        self.descriptors_dirty = true;
        Ok(())
    }

    pub fn set_texture(
        &mut self,
        slot: u32,
        binding: Option<TextureBinding>,
    ) -> Result<(), RendererError> {
        let index = check_slot(slot, MAX_BINDING_SLOTS)?;
        self.textures[index] = binding;
        self.descriptors_dirty = true;
        Ok(())
    }

    /// True if `handle` is one of the bound attachments.
    pub fn is_target(&self, handle: ResourceHandle) -> bool {
        self.colour_targets.contains(&handle) || self.depth_target == Some(handle)
    }

    /// Drop every reference to `handle` so a released resource can never be
    /// recorded.
    pub fn forget(&mut self, handle: ResourceHandle) {
        let forget = |slot: &mut Option<ResourceHandle>| {
            if *slot == Some(handle) {
                *slot = None;
            }
        };
        forget(&mut self.vertex_shader);
        forget(&mut self.fragment_shader);
        forget(&mut self.compute_shader);
        forget(&mut self.input_layout);
        forget(&mut self.rasterizer_state);
        forget(&mut self.blend_state);
        forget(&mut self.depth_stencil_state);
        forget(&mut self.resolve_colour);
        if self.clear_state == Some(handle) {
            self.clear_state = None;
            self.clear_requested = false;
        }
        for slot in self
            .constant_buffers
            .iter_mut()
            .chain(self.structured_buffers.iter_mut())
        {
            if *slot == Some(handle) {
                *slot = None;
                self.descriptors_dirty = true;
            }
        }
        for slot in &mut self.textures {
            if slot.is_some_and(|b| b.texture == handle || b.sampler == handle) {
                *slot = None;
                self.descriptors_dirty = true;
            }
        }
        for slot in &mut self.vertex_buffers {
            if slot.is_some_and(|b| b.buffer == handle) {
                *slot = None;
            }
        }
        if self.index_buffer.is_some_and(|b| b.buffer == handle) {
            self.index_buffer = None;
        }
        if self.is_target(handle) {
            self.colour_targets.retain(|&h| h != handle);
            if self.depth_target == Some(handle) {
                self.depth_target = None;
            }
            self.pass_dirty = true;
        }
    }
}

// ---------------------------------------------------------------------------
// Pass resolution
// ---------------------------------------------------------------------------

/// What the recorder knows about one bound attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TargetInfo {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub extent: vk::Extent2D,
    pub has_stencil: bool,
    pub is_backbuffer: bool,
}

/// Every bound target must share one extent and sample count.
pub(crate) fn check_target_compat(
    colour: &[TargetInfo],
    depth: Option<&TargetInfo>,
) -> Result<(), RendererError> {
    if colour.len() > MAX_COLOR_ATTACHMENTS {
        return Err(RendererError::TooManyTargets(colour.len()));
    }
    let mut all = colour.iter().chain(depth);
    let Some(first) = all.next() else {
        return Err(RendererError::TargetMismatch("no targets bound".to_owned()));
    };
    for other in all {
        if (other.extent.width, other.extent.height) != (first.extent.width, first.extent.height)
        {
            return Err(RendererError::TargetMismatch(format!(
                "extent {}x{} differs from {}x{}",
                other.extent.width, other.extent.height, first.extent.width, first.extent.height
            )));
        }
        if other.samples != first.samples {
            return Err(RendererError::TargetMismatch(format!(
                "sample count {:?} differs from {:?}",
                other.samples, first.samples
            )));
        }
    }
    Ok(())
}

/// Whether the backbuffer colour clear happens through a transfer clear
/// before the pass, leaving the pass itself to load.
pub(crate) fn clears_backbuffer_by_transfer(
    clear: Option<&ClearState>,
    colour: &[TargetInfo],
    swapchain_transfer_dst: bool,
) -> bool {
    swapchain_transfer_dst
        && clear.is_some_and(|c| c.flags.contains(ClearFlags::COLOUR))
        && colour.iter().any(|t| t.is_backbuffer)
}

/// Build the render pass for the bound targets. `clear` is the active clear
/// state when a clear was requested for this pass.
pub(crate) fn describe_pass(
    colour: &[TargetInfo],
    depth: Option<&TargetInfo>,
    clear: Option<&ClearState>,
    backbuffer_cleared_by_transfer: bool,
) -> RenderPassDesc {
    let flags = clear.map_or(ClearFlags::empty(), |c| c.flags);
    let load = |clearing: bool| {
        if clearing {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::LOAD
        }
    };

    let color = colour
        .iter()
        .map(|target| {
            let clearing = flags.contains(ClearFlags::COLOUR)
                && !(target.is_backbuffer && backbuffer_cleared_by_transfer);
            AttachmentDesc {
                format: target.format,
                samples: target.samples,
                load_op: load(clearing),
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            }
        })
        .collect();

    let depth = depth.map(|target| AttachmentDesc {
        format: target.format,
        samples: target.samples,
        load_op: load(flags.contains(ClearFlags::DEPTH)),
        stencil_load_op: if target.has_stencil {
            load(flags.contains(ClearFlags::STENCIL))
        } else {
            vk::AttachmentLoadOp::DONT_CARE
        },
    });

    RenderPassDesc { color, depth }
}

/// Clear values in attachment order. Loaded attachments ignore theirs.
pub(crate) fn clear_values(
    colour_count: usize,
    has_depth: bool,
    clear: Option<&ClearState>,
) -> Vec<vk::ClearValue> {
    let default = ClearState::default();
    let clear = clear.unwrap_or(&default);
    let mut values: Vec<vk::ClearValue> = (0..colour_count)
        .map(|i| vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear.colour_for_target(i),
            },
        })
        .collect();
    if has_depth {
        values.push(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: clear.depth,
                stencil: u32::from(clear.stencil),
            },
        });
    }
    values
}

/// Workgroups needed to cover `grid` with groups of `threads`.
pub(crate) fn workgroup_count(grid: [u32; 3], threads: [u32; 3]) -> [u32; 3] {
    std::array::from_fn(|i| grid[i].div_ceil(threads[i].max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(format: vk::Format) -> TargetInfo {
        TargetInfo {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            has_stencil: false,
            is_backbuffer: false,
        }
    }

    fn backbuffer() -> TargetInfo {
        TargetInfo {
            is_backbuffer: true,
            ..target(vk::Format::B8G8R8A8_UNORM)
        }
    }

    #[test]
    fn set_targets_keeps_order_and_replaces_wholesale() {
        let mut state = PendingState::new();
        let first = [ResourceHandle(4), ResourceHandle(2), ResourceHandle(9)];
        state
            .set_targets(&first, Some(ResourceHandle(1)), 0, 0)
            .unwrap();
        assert_eq!(state.colour_targets, first);
        assert_eq!(state.depth_target, Some(ResourceHandle(1)));

        state.set_targets(&[ResourceHandle(7)], None, 2, 0).unwrap();
        assert_eq!(state.colour_targets, [ResourceHandle(7)]);
        assert_eq!(state.depth_target, None);
        assert_eq!(state.colour_slice, 2);
        assert!(state.pass_dirty);
    }

    #[test]
    fn depth_only_pass_is_legal() {
        let mut state = PendingState::new();
        state.set_targets(&[], Some(ResourceHandle(3)), 0, 0).unwrap();
        assert!(state.colour_targets.is_empty());
    }

    #[test]
    fn too_many_targets_leave_state_untouched() {
        let mut state = PendingState::new();
        state.set_targets(&[ResourceHandle(0)], None, 0, 0).unwrap();
        let nine: Vec<_> = (0..9).map(ResourceHandle).collect();
        assert!(matches!(
            state.set_targets(&nine, None, 0, 0),
            Err(RendererError::TooManyTargets(9))
        ));
        assert_eq!(state.colour_targets, [ResourceHandle(0)]);
    }

    #[test]
    fn pass_has_one_attachment_per_target_in_bound_order() {
        let formats = [
            vk::Format::R8G8B8A8_UNORM,
            vk::Format::R16G16B16A16_SFLOAT,
            vk::Format::R32_SFLOAT,
        ];
        let colour: Vec<_> = formats.iter().map(|&f| target(f)).collect();
        let desc = describe_pass(&colour, None, None, false);
        let described: Vec<_> = desc.color.iter().map(|a| a.format).collect();
        assert_eq!(described, formats);
        assert!(desc.depth.is_none());
    }

    #[test]
    fn colour_flag_selects_clear_on_every_attachment() {
        let colour = [target(vk::Format::R8G8B8A8_UNORM); 3];
        let clear = ClearState::colour([0.0, 0.0, 1.0, 1.0]);
        let desc = describe_pass(&colour, None, Some(&clear), false);
        assert!(desc
            .color
            .iter()
            .all(|a| a.load_op == vk::AttachmentLoadOp::CLEAR));

        let depth_only = ClearState {
            flags: ClearFlags::DEPTH,
            ..ClearState::default()
        };
        let desc = describe_pass(&colour, None, Some(&depth_only), false);
        assert!(desc
            .color
            .iter()
            .all(|a| a.load_op == vk::AttachmentLoadOp::LOAD));

        let desc = describe_pass(&colour, None, None, false);
        assert!(desc
            .color
            .iter()
            .all(|a| a.load_op == vk::AttachmentLoadOp::LOAD));
    }

    #[test]
    fn depth_and_stencil_flags_are_independent() {
        let depth = TargetInfo {
            has_stencil: true,
            ..target(vk::Format::D24_UNORM_S8_UINT)
        };
        let clear = ClearState {
            flags: ClearFlags::DEPTH,
            ..ClearState::default()
        };
        let desc = describe_pass(&[], Some(&depth), Some(&clear), false);
        let attachment = desc.depth.unwrap();
        assert_eq!(attachment.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachment.stencil_load_op, vk::AttachmentLoadOp::LOAD);

        let no_stencil = target(vk::Format::D32_SFLOAT);
        let desc = describe_pass(&[], Some(&no_stencil), Some(&clear), false);
        assert_eq!(
            desc.depth.unwrap().stencil_load_op,
            vk::AttachmentLoadOp::DONT_CARE
        );
    }

    #[test]
    fn transfer_cleared_backbuffer_loads_in_the_pass() {
        let colour = [backbuffer(), target(vk::Format::R8G8B8A8_UNORM)];
        let clear = ClearState::colour([0.0, 0.0, 1.0, 1.0]);
        assert!(clears_backbuffer_by_transfer(Some(&clear), &colour, true));
        assert!(!clears_backbuffer_by_transfer(Some(&clear), &colour, false));
        assert!(!clears_backbuffer_by_transfer(None, &colour, true));

        let desc = describe_pass(&colour, None, Some(&clear), true);
        assert_eq!(desc.color[0].load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(desc.color[1].load_op, vk::AttachmentLoadOp::CLEAR);
    }

    #[test]
    fn mismatched_targets_are_rejected() {
        let a = target(vk::Format::R8G8B8A8_UNORM);
        let small = TargetInfo {
            extent: vk::Extent2D {
                width: 256,
                height: 256,
            },
            ..a
        };
        let msaa = TargetInfo {
            samples: vk::SampleCountFlags::TYPE_4,
            ..a
        };
        assert!(check_target_compat(&[a, a], None).is_ok());
        assert!(check_target_compat(&[a, small], None).is_err());
        assert!(check_target_compat(&[a], Some(&msaa)).is_err());
        assert!(check_target_compat(&[], None).is_err());
    }

    #[test]
    fn clear_faces_override_slices_once() {
        let mut state = PendingState::new();
        state
            .set_targets(&[ResourceHandle(1)], Some(ResourceHandle(2)), 1, 0)
            .unwrap();
        state.set_clear(ResourceHandle(0), Some(4), Some(3));
        assert_eq!(state.effective_colour_slice(), 4);
        assert_eq!(state.effective_depth_slice(), 3);
        state.consume_clear();
        assert_eq!(state.effective_colour_slice(), 1);
        assert_eq!(state.effective_depth_slice(), 0);
        assert!(!state.clear_requested);
        assert!(!state.pass_dirty);
    }

    #[test]
    fn binding_slots_are_bounded() {
        let mut state = PendingState::new();
        assert!(state.set_constant_buffer(7, Some(ResourceHandle(1))).is_ok());
        assert!(matches!(
            state.set_constant_buffer(8, Some(ResourceHandle(1))),
            Err(RendererError::BindingSlot { slot: 8, max: 8 })
        ));
        state
            .set_vertex_buffers(2, &[ResourceHandle(5), ResourceHandle(6)], &[64])
            .unwrap();
        assert_eq!(state.vertex_buffers.len(), 4);
        assert_eq!(state.vertex_buffers[2].unwrap().offset, 64);
        assert_eq!(state.vertex_buffers[3].unwrap().offset, 0);
        assert!(state.set_vertex_buffers(15, &[ResourceHandle(1); 2], &[]).is_err());
    }

    #[test]
    fn forget_unbinds_everywhere() {
        let mut state = PendingState::new();
        let h = ResourceHandle(5);
        state.vertex_shader = Some(h);
        state.set_constant_buffer(2, Some(h)).unwrap();
        state
            .set_texture(
                0,
                Some(TextureBinding {
                    texture: ResourceHandle(1),
                    sampler: h,
                }),
            )
            .unwrap();
        state.set_targets(&[ResourceHandle(1), h], None, 0, 0).unwrap();
        state.pass_dirty = false;
        state.forget(h);
        assert_eq!(state.vertex_shader, None);
        assert_eq!(state.constant_buffers[2], None);
        assert_eq!(state.textures[0], None);
        assert_eq!(state.colour_targets, [ResourceHandle(1)]);
        assert!(state.pass_dirty);
    }

    #[test]
    fn mrt_clear_values_follow_targets() {
        let mut clear = ClearState::colour_depth([0.0, 0.0, 1.0, 1.0], 0.5);
        clear.mrt = vec![[1.0, 0.0, 0.0, 1.0]];
        let values = clear_values(2, true, Some(&clear));
        assert_eq!(values.len(), 3);
        // SAFETY: colour entries were written through the `color` member.
        let (first, second) = unsafe { (values[0].color.float32, values[1].color.float32) };
        assert_eq!(first, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(second, [0.0, 0.0, 1.0, 1.0]);
        // SAFETY: the last entry was written through `depth_stencil`.
        let depth = unsafe { values[2].depth_stencil.depth };
        assert_eq!(depth, 0.5);
    }

    #[test]
    fn workgroups_round_up() {
        assert_eq!(workgroup_count([100, 1, 1], [64, 1, 1]), [2, 1, 1]);
        assert_eq!(workgroup_count([128, 30, 0], [64, 8, 1]), [2, 4, 0]);
        assert_eq!(workgroup_count([5, 5, 5], [0, 0, 0]), [5, 5, 5]);
    }

    #[test]
    fn first_recording_call_starts_the_frame() {
        assert_eq!(FrameState::Idle.record("draw").unwrap(), FrameState::Recording);
        assert_eq!(
            FrameState::Recording.record("draw").unwrap(),
            FrameState::Recording
        );
    }

    #[test]
    fn ended_frame_rejects_recording() {
        assert!(matches!(
            FrameState::Ended.record("draw"),
            Err(RendererError::InvalidFrameState {
                operation: "draw",
                state: FrameState::Ended,
            })
        ));
    }

    #[test]
    fn failed_submit_stays_ended_for_retry() {
        let state = FrameState::after_submit(true);
        assert_eq!(state, FrameState::Ended);
        assert!(state.awaiting_submit());
        assert!(state.record("draw").is_err());
    }

    #[test]
    fn submitted_frame_returns_to_idle() {
        let state = FrameState::after_submit(false);
        assert_eq!(state, FrameState::Idle);
        assert!(!state.awaiting_submit());
        assert_eq!(state.record("present").unwrap(), FrameState::Recording);
    }
}
