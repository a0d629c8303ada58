use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error("Vulkan error creating command pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateCommandBufferError {
    #[error("Vulkan error allocating command buffers: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum RecordCommandBufferError {
    #[error("Command buffer is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: CommandBufferState,
        actual: CommandBufferState,
    },
    #[error("Vulkan error in command buffer: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// CommandPoolShared
// ---------------------------------------------------------------------------

/// The raw pool, co-owned by [`CommandPool`] and every [`CommandBuffer`]
/// allocated from it so the pool outlives its buffers.
struct CommandPoolShared {
    parent: Arc<Device>,
    pool: vk::CommandPool,
}

impl Drop for CommandPoolShared {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.pool);
        // SAFETY: the pool and every buffer holding this Arc are gone; the
        // owner waits for the GPU before dropping them.
        // vkDestroyCommandPool frees the allocated buffers implicitly.
        unsafe { self.parent.destroy_raw_command_pool(self.pool) };
    }
}

// ---------------------------------------------------------------------------
// CommandPool
// ---------------------------------------------------------------------------

/// A command pool whose buffers can be reset individually.
///
/// `CommandPool` is `!Sync` through its buffers' `&mut self` recording
/// API; the renderer uses it from a single thread.
pub struct CommandPool {
    shared: Arc<CommandPoolShared>,
    queue_family: u32,
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("pool", &self.shared.pool)
            .field("queue_family", &self.queue_family)
            .finish_non_exhaustive()
    }
}

impl CommandPool {
    pub fn new(
        device: &Arc<Device>,
        queue_family: u32,
        name: Option<&str>,
    ) -> Result<Self, CreateCommandPoolError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        // SAFETY: create_info uses a queue family of this device.
        let pool = unsafe { device.create_raw_command_pool(&create_info) }
            .map_err(CreateCommandPoolError::Vulkan)?;

        // SAFETY: pool is a valid command pool created from device.
        if let Err(e) = unsafe { device.set_object_name_str(pool, name) } {
            tracing::warn!("Failed to name command pool {:?}: {e}", pool);
        }

        Ok(Self {
            shared: Arc::new(CommandPoolShared {
                parent: Arc::clone(device),
                pool,
            }),
            queue_family,
        })
    }

    /// Allocate `count` primary command buffers in the initial state.
    pub fn allocate_primary(
        &mut self,
        count: u32,
    ) -> Result<Vec<CommandBuffer>, AllocateCommandBufferError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.shared.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        // SAFETY: allocate_info references this pool; &mut self gives the
        // external synchronisation vkAllocateCommandBuffers requires.
        let handles = unsafe {
            self.shared.parent.allocate_raw_command_buffers(&allocate_info)
        }
        .map_err(AllocateCommandBufferError::Vulkan)?;

        Ok(handles
            .into_iter()
            .map(|handle| CommandBuffer {
                _pool: Arc::clone(&self.shared),
                parent: Arc::clone(&self.shared.parent),
                handle,
                state: CommandBufferState::Initial,
            })
            .collect())
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.shared.parent
    }
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// CPU-side view of a command buffer's lifecycle.
///
/// Pending execution is not tracked here; the owner guards reuse with a
/// fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

impl CommandBufferState {
    fn expect(self, expected: Self) -> Result<(), RecordCommandBufferError> {
        if self == expected {
            Ok(())
        } else {
            Err(RecordCommandBufferError::InvalidState {
                expected,
                actual: self,
            })
        }
    }
}

/// A primary command buffer from a [`CommandPool`].
///
/// `reset`, `begin` and `end` check the CPU-visible state; the recording
/// wrappers are `unsafe` and leave command validity to the caller.
pub struct CommandBuffer {
    _pool: Arc<CommandPoolShared>,
    parent: Arc<Device>,
    handle: vk::CommandBuffer,
    state: CommandBufferState,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// Return the buffer to the initial state.
    ///
    /// # Safety
    /// The buffer must not be pending execution on the GPU.
    pub unsafe fn reset(&mut self) -> Result<(), RecordCommandBufferError> {
        // SAFETY: caller guarantees the buffer is not pending.
        unsafe {
            self.parent.reset_raw_command_buffer(
                self.handle,
                vk::CommandBufferResetFlags::empty(),
            )
        }
        .map_err(RecordCommandBufferError::Vulkan)?;
        self.state = CommandBufferState::Initial;
        Ok(())
    }

    /// Begin recording.
    ///
    /// # Safety
    /// The buffer must not be pending execution on the GPU.
    pub unsafe fn begin(
        &mut self,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<(), RecordCommandBufferError> {
        self.state.expect(CommandBufferState::Initial)?;
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        // SAFETY: the buffer is in the initial state and caller guarantees
        // it is not pending.
        unsafe { self.parent.begin_raw_command_buffer(self.handle, &begin_info) }
            .map_err(RecordCommandBufferError::Vulkan)?;
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    /// End recording.
    ///
    /// # Safety
    /// No render pass or debug label region may be open.
    pub unsafe fn end(&mut self) -> Result<(), RecordCommandBufferError> {
        self.state.expect(CommandBufferState::Recording)?;
        // SAFETY: the buffer is recording; caller guarantees no open pass.
        unsafe { self.parent.end_raw_command_buffer(self.handle) }
            .map_err(RecordCommandBufferError::Vulkan)?;
        self.state = CommandBufferState::Executable;
        Ok(())
    }

    /// # Safety
    /// Recording outside a render pass; barrier handles must be valid.
    pub unsafe fn pipeline_barrier2(
        &mut self,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        // SAFETY: caller guarantees recording state and barrier validity.
        unsafe { self.parent.cmd_pipeline_barrier2(self.handle, dependency_info) }
    }

    /// # Safety
    /// Recording outside a render pass; attachments must be in the render
    /// pass's initial layouts.
    pub unsafe fn begin_render_pass(
        &mut self,
        begin_info: &vk::RenderPassBeginInfo<'_>,
    ) {
        // SAFETY: caller guarantees render pass preconditions.
        unsafe { self.parent.cmd_begin_render_pass(self.handle, begin_info) }
    }

    /// # Safety
    /// A render pass must be open.
    pub unsafe fn end_render_pass(&mut self) {
        // SAFETY: caller guarantees an open render pass.
        unsafe { self.parent.cmd_end_render_pass(self.handle) }
    }

    /// # Safety
    /// Recording; `pipeline` must match `bind_point` and this device.
    pub unsafe fn bind_pipeline(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: caller guarantees recording state and pipeline validity.
        unsafe { self.parent.cmd_bind_pipeline(self.handle, bind_point, pipeline) }
    }

    /// # Safety
    /// Recording; `buffers` and `offsets` of equal length, vertex usage.
    pub unsafe fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        // SAFETY: caller guarantees recording state and buffer validity.
        unsafe {
            self.parent.cmd_bind_vertex_buffers(
                self.handle,
                first_binding,
                buffers,
                offsets,
            )
        }
    }

    /// # Safety
    /// Recording; `buffer` must carry index usage.
    pub unsafe fn bind_index_buffer(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        // SAFETY: caller guarantees recording state and buffer validity.
        unsafe {
            self.parent
                .cmd_bind_index_buffer(self.handle, buffer, offset, index_type)
        }
    }

    /// # Safety
    /// Recording; `layout` compatible with the sets and bound pipeline.
    pub unsafe fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        // SAFETY: caller guarantees layout compatibility.
        unsafe {
            self.parent.cmd_bind_descriptor_sets(
                self.handle,
                bind_point,
                layout,
                first_set,
                sets,
            )
        }
    }

    /// # Safety
    /// Recording with a dynamic-viewport pipeline.
    pub unsafe fn set_viewport(&mut self, viewports: &[vk::Viewport]) {
        // SAFETY: caller guarantees recording state.
        unsafe { self.parent.cmd_set_viewport(self.handle, viewports) }
    }

    /// # Safety
    /// Recording with a dynamic-scissor pipeline.
    pub unsafe fn set_scissor(&mut self, scissors: &[vk::Rect2D]) {
        // SAFETY: caller guarantees recording state.
        unsafe { self.parent.cmd_set_scissor(self.handle, scissors) }
    }

    /// # Safety
    /// Recording with a dynamic stencil-reference pipeline.
    pub unsafe fn set_stencil_reference(&mut self, reference: u32) {
        // SAFETY: caller guarantees recording state.
        unsafe { self.parent.cmd_set_stencil_reference(self.handle, reference) }
    }

    /// # Safety
    /// Inside a render pass with a compatible pipeline and dynamic state set.
    pub unsafe fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        // SAFETY: caller guarantees draw state.
        unsafe {
            self.parent.cmd_draw(
                self.handle,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        }
    }

    /// # Safety
    /// As [`draw`](Self::draw), plus a bound index buffer.
    pub unsafe fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        // SAFETY: caller guarantees draw state.
        unsafe {
            self.parent.cmd_draw_indexed(
                self.handle,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    /// # Safety
    /// Outside a render pass with a compute pipeline bound.
    pub unsafe fn dispatch(&mut self, groups: [u32; 3]) {
        // SAFETY: caller guarantees dispatch state.
        unsafe { self.parent.cmd_dispatch(self.handle, groups) }
    }

    /// # Safety
    /// Outside a render pass; regions in bounds.
    pub unsafe fn copy_buffer(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: caller guarantees copy validity.
        unsafe { self.parent.cmd_copy_buffer(self.handle, src, dst, regions) }
    }

    /// # Safety
    /// Outside a render pass; `dst` in `TRANSFER_DST_OPTIMAL`.
    pub unsafe fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: caller guarantees copy validity and layout.
        unsafe {
            self.parent
                .cmd_copy_buffer_to_image(self.handle, src, dst, regions)
        }
    }

    /// # Safety
    /// Outside a render pass; `src` in `TRANSFER_SRC_OPTIMAL`.
    pub unsafe fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: caller guarantees copy validity and layout.
        unsafe {
            self.parent
                .cmd_copy_image_to_buffer(self.handle, src, dst, regions)
        }
    }

    /// # Safety
    /// Outside a render pass; `image` in `layout` with transfer-dst usage.
    pub unsafe fn clear_color_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [f32; 4],
        range: vk::ImageSubresourceRange,
    ) {
        let value = vk::ClearColorValue { float32: color };
        // SAFETY: caller guarantees layout and usage.
        unsafe {
            self.parent.cmd_clear_color_image(
                self.handle,
                image,
                layout,
                &value,
                std::slice::from_ref(&range),
            )
        }
    }

    /// # Safety
    /// Outside a render pass; see [`Device::cmd_resolve_image`].
    pub unsafe fn resolve_image(
        &mut self,
        src: vk::Image,
        dst: vk::Image,
        regions: &[vk::ImageResolve],
    ) {
        // SAFETY: caller guarantees sample counts and layouts.
        unsafe { self.parent.cmd_resolve_image(self.handle, src, dst, regions) }
    }

    /// # Safety
    /// The buffer must be recording.
    pub unsafe fn begin_label(&mut self, name: &CStr) {
        // SAFETY: caller guarantees recording state.
        unsafe { self.parent.cmd_begin_debug_label(self.handle, name) }
    }

    /// # Safety
    /// The buffer must be recording with an open label region.
    pub unsafe fn end_label(&mut self) {
        // SAFETY: caller guarantees an open label region.
        unsafe { self.parent.cmd_end_debug_label(self.handle) }
    }

    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

#[allow(dead_code)]
trait AssertSend: Send {}
impl AssertSend for CommandPool {}
impl AssertSend for CommandBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_expectation_reports_both_states() {
        assert!(
            CommandBufferState::Initial
                .expect(CommandBufferState::Initial)
                .is_ok()
        );
        let err = CommandBufferState::Executable
            .expect(CommandBufferState::Recording)
            .unwrap_err();
        assert!(matches!(
            err,
            RecordCommandBufferError::InvalidState {
                expected: CommandBufferState::Recording,
                actual: CommandBufferState::Executable,
            }
        ));
    }
}
