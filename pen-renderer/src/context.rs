//! Device, swapchain and frame lifecycle.
//!
//! A [`DeviceContext`] is created once by `Renderer::initialise` and torn
//! down once on drop. Frames rotate through `N` slots (one per swapchain
//! image at creation); each slot owns the fence guarding its submission,
//! the semaphore its acquire signals and the descriptor pools its draws
//! allocate from. Command buffers and render-finished semaphores belong to
//! swapchain images, so the command buffer submitted is always the one
//! recorded for the image that was acquired.

use std::sync::Arc;

use pen_gpu::ash::vk;
use pen_gpu::command::{CommandBuffer, CommandPool};
use pen_gpu::descriptor::{
    DescriptorBindingDesc, DescriptorPool, DescriptorSet, DescriptorSetLayout, pool_sizes_for,
};
use pen_gpu::device::{Device, DeviceConfig};
use pen_gpu::instance::{Instance, InstanceExtensions};
use pen_gpu::pipeline::{ComputePipeline, GraphicsPipeline, PipelineLayout};
use pen_gpu::render_pass::Framebuffer;
use pen_gpu::surface::Surface;
use pen_gpu::swapchain::Swapchain;
use pen_gpu::sync::{Fence, Semaphore};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::config::RendererConfig;
use crate::error::RendererError;
use crate::resource::Resource;
use crate::state::MAX_BINDING_SLOTS;

pub(crate) const SET_CONSTANT_BUFFERS: u32 = 0;
pub(crate) const SET_TEXTURES: u32 = 1;
pub(crate) const SET_STRUCTURED_BUFFERS: u32 = 2;

// ---------------------------------------------------------------------------
// One-shot submission
// ---------------------------------------------------------------------------

/// Records and submits a command buffer, then blocks until it completes.
/// Used for uploads and layout initialisation outside the frame loop.
#[derive(Debug)]
pub(crate) struct ImmediateSubmitter {
    command_buffer: CommandBuffer,
    fence: Fence,
}

impl ImmediateSubmitter {
    fn new(device: &Arc<Device>, pool: &mut CommandPool) -> Result<Self, RendererError> {
        let command_buffer = pool
            .allocate_primary(1)?
            .pop()
            .ok_or(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        Ok(Self {
            command_buffer,
            fence: Fence::new(device, false, Some("immediate submit"))?,
        })
    }

    pub(crate) fn submit(
        &mut self,
        record: impl FnOnce(&mut CommandBuffer) -> Result<(), RendererError>,
    ) -> Result<(), RendererError> {
        let cmd = &mut self.command_buffer;
        // SAFETY: every previous submission was waited on before returning,
        // so the buffer is not pending.
        unsafe {
            cmd.reset()?;
            cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        }
        record(cmd)?;
        // SAFETY: recorders never leave a pass or label open.
        unsafe { cmd.end() }?;

        let cmd_info = [vk::CommandBufferSubmitInfo::default()
            .command_buffer(cmd.raw_command_buffer())];
        let submit = vk::SubmitInfo2::default().command_buffer_infos(&cmd_info);
        let device = Arc::clone(cmd.parent());
        // SAFETY: the buffer is executable, the fence is idle and unsignaled.
        unsafe {
            device.graphics_queue_submit2(std::slice::from_ref(&submit), self.fence.raw_fence())?;
            self.fence.mark_submitted()?;
        }
        self.fence.wait_and_reset(u64::MAX)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared binding model
// ---------------------------------------------------------------------------

/// The one pipeline layout every pipeline uses: set 0 holds constant
/// buffers, set 1 combined image samplers, set 2 structured buffers, each
/// with [`MAX_BINDING_SLOTS`] bindings visible to all stages.
#[derive(Debug)]
pub(crate) struct BindingModel {
    pub(crate) set_layouts: [DescriptorSetLayout; 3],
    pub(crate) pipeline_layout: Arc<PipelineLayout>,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
}

fn binding_table(ty: vk::DescriptorType) -> Vec<DescriptorBindingDesc> {
    (0..MAX_BINDING_SLOTS)
        .map(|binding| DescriptorBindingDesc {
            binding,
            descriptor_type: ty,
            count: 1,
            stage_flags: vk::ShaderStageFlags::ALL,
        })
        .collect()
}

impl BindingModel {
    fn new(device: &Arc<Device>, sets_per_pool: u32) -> Result<Self, RendererError> {
        let tables = [
            binding_table(vk::DescriptorType::UNIFORM_BUFFER),
            binding_table(vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            binding_table(vk::DescriptorType::STORAGE_BUFFER),
        ];
        let all: Vec<_> = tables.iter().flatten().copied().collect();
        let pool_sizes = pool_sizes_for(&all, sets_per_pool);

        let [constants, textures, structured] = tables;
        let set_layouts = [
            DescriptorSetLayout::new(device, &constants, Some("constant buffers"))?,
            DescriptorSetLayout::new(device, &textures, Some("textures"))?,
            DescriptorSetLayout::new(device, &structured, Some("structured buffers"))?,
        ];
        let raw_layouts = set_layouts
            .each_ref()
            .map(DescriptorSetLayout::raw_descriptor_set_layout);
        // SAFETY: the set layouts come from device and live in this struct
        // alongside the pipeline layout.
        let pipeline_layout = unsafe {
            PipelineLayout::new(device, &raw_layouts, &[], Some("shared pipeline layout"))
        }?;
        Ok(Self {
            set_layouts,
            pipeline_layout: Arc::new(pipeline_layout),
            pool_sizes,
        })
    }
}

// ---------------------------------------------------------------------------
// Deferred destruction
// ---------------------------------------------------------------------------

/// GPU objects whose last use may still be executing.
#[derive(Debug)]
pub(crate) enum Retired {
    Resource(Resource),
    Framebuffer(Framebuffer),
    GraphicsPipeline(GraphicsPipeline),
    ComputePipeline(ComputePipeline),
}

/// Items tagged with the last frame that may use them, dropped once that
/// frame has completed.
#[derive(Debug)]
pub(crate) struct DeferredQueue<T> {
    entries: Vec<(u64, T)>,
}

impl<T> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> DeferredQueue<T> {
    pub(crate) fn push(&mut self, last_use: u64, item: T) {
        self.entries.push((last_use, item));
    }

    /// Remove every item whose frame is at or before `completed`.
    pub(crate) fn collect(&mut self, completed: Option<u64>) -> Vec<T> {
        let Some(completed) = completed else {
            return Vec::new();
        };
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|(frame, _)| *frame <= completed);
        self.entries = pending;
        done.into_iter().map(|(_, item)| item).collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(_, item)| item)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FrameSlot {
    fence: Fence,
    image_available: Semaphore,
    descriptor_pools: Vec<DescriptorPool>,
    active_pool: usize,
    submitted_frame: Option<u64>,
}

#[derive(Debug)]
struct ImageFrame {
    command_buffer: CommandBuffer,
    render_finished: Semaphore,
    last_slot: Option<usize>,
}

/// The frame currently being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ActiveFrame {
    pub slot: usize,
    pub image: u32,
    pub index: u64,
}

/// The slot that follows a wait on a slot fence: frame `submitted` is
/// complete, and so is everything before it on the single queue.
fn advance_completed(completed: Option<u64>, submitted: Option<u64>) -> Option<u64> {
    match (completed, submitted) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Last frame that may still reference an object retired now.
pub(crate) fn retire_tag(frame_index: u64, recording: bool) -> Option<u64> {
    if recording {
        Some(frame_index)
    } else {
        frame_index.checked_sub(1)
    }
}

pub(crate) struct DeviceContext<W: HasDisplayHandle + HasWindowHandle> {
    // Field order is drop order.
    images: Vec<ImageFrame>,
    frames: Vec<FrameSlot>,
    pub(crate) uploader: ImmediateSubmitter,
    command_pool: CommandPool,
    pub(crate) bindings: BindingModel,
    swapchain: Swapchain<W>,
    surface: Arc<Surface<W>>,
    device: Arc<Device>,
    _instance: Arc<Instance>,

    config: RendererConfig,
    window_extent: vk::Extent2D,
    frame_index: u64,
    completed: Option<u64>,
    active: Option<ActiveFrame>,
    needs_recreate: bool,
}

impl<W: HasDisplayHandle + HasWindowHandle> std::fmt::Debug for DeviceContext<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.device)
            .field("swapchain", &self.swapchain)
            .field("frame_index", &self.frame_index)
            .field("completed", &self.completed)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl<W: HasDisplayHandle + HasWindowHandle> DeviceContext<W> {
    pub(crate) fn new(
        window: Arc<W>,
        window_extent: vk::Extent2D,
        config: &RendererConfig,
    ) -> Result<Self, RendererError> {
        let _span = tracing::debug_span!("initialise").entered();

        // SAFETY: loading Vulkan runs the system loader; nothing else is
        // required of us.
        let instance = Arc::new(unsafe {
            Instance::new(
                &config.app_name,
                config.validation,
                Some(window.as_ref()),
                InstanceExtensions { surface: true },
            )
        }?);

        // SAFETY: the surface keeps the window alive and is dropped with the
        // context, after every object derived from it.
        let surface = Arc::new(unsafe { Surface::new(&instance, window) }?);

        let device = Arc::new(Device::new(
            &instance,
            &surface,
            &DeviceConfig {
                selection: config.physical_device,
            },
        )?);
        tracing::info!(
            "Using {} ({:?})",
            device.device_name(),
            device.properties().device_type
        );

        let swapchain = Swapchain::new(&device, &surface, window_extent, &config.swapchain)?;
        let slot_count = swapchain.images().len().max(1);

        let families = device.queue_families();
        let mut command_pool =
            CommandPool::new(&device, families.graphics, Some("renderer commands"))?;
        let uploader = ImmediateSubmitter::new(&device, &mut command_pool)?;
        let bindings = BindingModel::new(&device, config.descriptor_sets_per_pool)?;

        let frames = (0..slot_count)
            .map(|i| {
                Ok(FrameSlot {
                    fence: Fence::new(&device, true, Some(&format!("frame {i} fence")))?,
                    image_available: Semaphore::new(
                        &device,
                        Some(&format!("frame {i} image available")),
                    )?,
                    descriptor_pools: Vec::new(),
                    active_pool: 0,
                    submitted_frame: None,
                })
            })
            .collect::<Result<Vec<_>, RendererError>>()?;

        let mut context = Self {
            images: Vec::new(),
            frames,
            uploader,
            command_pool,
            bindings,
            swapchain,
            surface,
            device,
            _instance: instance,
            config: config.clone(),
            window_extent,
            frame_index: 0,
            completed: None,
            active: None,
            needs_recreate: false,
        };
        context.sync_image_frames()?;
        tracing::info!(
            "Renderer initialised with {} swapchain images, {} frames in flight",
            context.images.len(),
            context.frames.len()
        );
        Ok(context)
    }

    /// Match per-image command buffers and semaphores to the swapchain.
    fn sync_image_frames(&mut self) -> Result<(), RendererError> {
        let wanted = self.swapchain.images().len();
        self.images.truncate(wanted);
        let missing = wanted.saturating_sub(self.images.len()) as u32;
        let buffers = self.command_pool.allocate_primary(missing)?;
        for command_buffer in buffers {
            let index = self.images.len();
            self.images.push(ImageFrame {
                command_buffer,
                render_finished: Semaphore::new(
                    &self.device,
                    Some(&format!("image {index} render finished")),
                )?,
                last_slot: None,
            });
        }
        Ok(())
    }

    pub(crate) fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub(crate) fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// `name` when debug naming is enabled.
    pub(crate) fn debug_name<'a>(&self, name: &'a str) -> Option<&'a str> {
        self.config.debug_names.then_some(name)
    }

    pub(crate) fn swapchain(&self) -> &Swapchain<W> {
        &self.swapchain
    }

    pub(crate) fn window_extent(&self) -> vk::Extent2D {
        self.window_extent
    }

    /// Zero-sized windows cannot present; frames are skipped meanwhile.
    pub(crate) fn is_minimised(&self) -> bool {
        self.window_extent.width == 0 || self.window_extent.height == 0
    }

    pub(crate) fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub(crate) fn completed_frame(&self) -> Option<u64> {
        self.completed
    }

    pub(crate) fn active_frame(&self) -> Option<ActiveFrame> {
        self.active
    }

    /// The slot of the recording frame, whose fence has been waited so its
    /// dynamic-buffer copies are safe to write.
    pub(crate) fn write_slot(&self) -> Option<usize> {
        self.active.map(|frame| frame.slot)
    }

    pub(crate) fn retire_tag(&self) -> Option<u64> {
        retire_tag(self.frame_index, self.active.is_some())
    }

    pub(crate) fn command_buffer(&mut self, frame: ActiveFrame) -> &mut CommandBuffer {
        &mut self.images[frame.image as usize].command_buffer
    }

    pub(crate) fn backbuffer_image(&self, frame: ActiveFrame) -> vk::Image {
        self.swapchain.images()[frame.image as usize]
    }

    pub(crate) fn backbuffer_view(&self, frame: ActiveFrame) -> vk::ImageView {
        self.swapchain.image_views()[frame.image as usize]
    }

    /// Wait for the GPU to finish everything submitted so far.
    pub(crate) fn wait_idle(&mut self) -> Result<(), RendererError> {
        self.device.wait_idle()?;
        self.completed = self.frame_index.checked_sub(1);
        Ok(())
    }

    /// Record the new window size and rebuild the swapchain for it.
    pub(crate) fn resize(&mut self, extent: vk::Extent2D) -> Result<(), RendererError> {
        self.window_extent = extent;
        if self.is_minimised() {
            tracing::debug!("Window minimised, deferring swapchain recreation");
            self.needs_recreate = true;
            return Ok(());
        }
        self.recreate_swapchain()
    }

    fn recreate_swapchain(&mut self) -> Result<(), RendererError> {
        if self.active.is_some() {
            self.needs_recreate = true;
            return Ok(());
        }
        self.wait_idle()?;
        tracing::debug!(
            "Recreating swapchain for {}x{}",
            self.window_extent.width,
            self.window_extent.height
        );
        let swapchain = Swapchain::new_with_old(
            &self.device,
            &self.surface,
            self.window_extent,
            Some(&self.swapchain),
            &self.config.swapchain,
        )?;
        self.swapchain = swapchain;
        for image in &mut self.images {
            image.last_slot = None;
        }
        self.sync_image_frames()?;
        self.needs_recreate = false;
        Ok(())
    }

    /// Start recording a frame: wait for the slot, acquire an image, and
    /// begin its command buffer. `None` while minimised.
    pub(crate) fn begin_frame(&mut self) -> Result<Option<ActiveFrame>, RendererError> {
        if let Some(frame) = self.active {
            return Ok(Some(frame));
        }
        if self.is_minimised() {
            return Ok(None);
        }
        if self.needs_recreate {
            self.recreate_swapchain()?;
        }

        let slot = (self.frame_index % self.frames.len() as u64) as usize;
        let timeout = self.config.acquire_timeout_ns;
        {
            let frame = &mut self.frames[slot];
            frame.fence.wait_and_reset(timeout)?;
            self.completed = advance_completed(self.completed, frame.submitted_frame);
            for pool in &mut frame.descriptor_pools {
                // SAFETY: the slot fence was waited, so no submitted work
                // uses sets from this slot's pools.
                unsafe { pool.reset() }?;
            }
            frame.active_pool = 0;
        }

        let image = match self.acquire(slot, timeout) {
            Err(RendererError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)) => {
                tracing::debug!("Swapchain out of date on acquire, recreating");
                self.recreate_swapchain()?;
                self.acquire(slot, timeout)?
            }
            other => other?,
        };

        if let Some(previous) = self.images[image as usize].last_slot
            && previous != slot
        {
            let other = &self.frames[previous];
            other.fence.wait(timeout)?;
            self.completed = advance_completed(self.completed, other.submitted_frame);
        }

        let image_frame = &mut self.images[image as usize];
        image_frame.last_slot = Some(slot);
        let cmd = &mut image_frame.command_buffer;
        // SAFETY: the fences of every slot that submitted this buffer have
        // been waited above.
        unsafe {
            cmd.reset()?;
            cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        }

        let frame = ActiveFrame {
            slot,
            image,
            index: self.frame_index,
        };
        tracing::trace!("Begin frame {} on slot {slot}, image {image}", frame.index);
        self.active = Some(frame);
        Ok(Some(frame))
    }

    fn acquire(&mut self, slot: usize, timeout: u64) -> Result<u32, RendererError> {
        let semaphore = self.frames[slot].image_available.raw_semaphore();
        // SAFETY: the slot's semaphore is unsignaled: its previous signal
        // was consumed by the submission the slot fence guarded.
        let (image, suboptimal) =
            unsafe { self.swapchain.acquire_next_image(timeout, semaphore, vk::Fence::null()) }?;
        if suboptimal {
            self.needs_recreate = true;
        }
        Ok(image)
    }

    /// Allocate one set per layout from the recording slot's pools,
    /// chaining a new pool when the current one is full.
    pub(crate) fn allocate_descriptor_sets(
        &mut self,
        frame: ActiveFrame,
        sets: &[u32],
    ) -> Result<Vec<DescriptorSet>, RendererError> {
        let layouts: Vec<&DescriptorSetLayout> = sets
            .iter()
            .map(|&set| &self.bindings.set_layouts[set as usize])
            .collect();
        let slot = &mut self.frames[frame.slot];
        loop {
            if slot.active_pool == slot.descriptor_pools.len() {
                tracing::debug!(
                    "Chaining descriptor pool {} for frame slot {}",
                    slot.active_pool,
                    frame.slot
                );
                slot.descriptor_pools.push(DescriptorPool::new(
                    &self.device,
                    self.config.descriptor_sets_per_pool,
                    &self.bindings.pool_sizes,
                    Some("frame descriptors"),
                )?);
            }
            match slot.descriptor_pools[slot.active_pool].allocate_sets(&layouts) {
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                    slot.active_pool += 1;
                }
                result => return Ok(result?),
            }
        }
    }

    /// Submit the ended command buffer of `frame` and present its image.
    ///
    /// The frame counts as submitted once the queue accepts it; a present
    /// failure other than an out-of-date swapchain is returned afterwards.
    pub(crate) fn submit_and_present(&mut self, frame: ActiveFrame) -> Result<(), RendererError> {
        let image_frame = &self.images[frame.image as usize];
        let slot = &mut self.frames[frame.slot];

        let wait = [vk::SemaphoreSubmitInfo::default()
            .semaphore(slot.image_available.raw_semaphore())
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let signal = [vk::SemaphoreSubmitInfo::default()
            .semaphore(image_frame.render_finished.raw_semaphore())
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let cmd_info = [vk::CommandBufferSubmitInfo::default()
            .command_buffer(image_frame.command_buffer.raw_command_buffer())];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait)
            .command_buffer_infos(&cmd_info)
            .signal_semaphore_infos(&signal);

        // SAFETY: the command buffer is executable, the slot fence was reset
        // when the frame began and the semaphores belong to this device.
        unsafe {
            self.device
                .graphics_queue_submit2(std::slice::from_ref(&submit), slot.fence.raw_fence())?;
            slot.fence.mark_submitted()?;
        }
        slot.submitted_frame = Some(frame.index);
        self.active = None;
        self.frame_index += 1;

        let render_finished = image_frame.render_finished.raw_semaphore();
        // SAFETY: the image was acquired for this frame and the submitted
        // commands leave it in PRESENT_SRC_KHR.
        match unsafe { self.swapchain.present(frame.image, &[render_finished]) } {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                tracing::debug!("Swapchain suboptimal or out of date on present, recreating");
                self.recreate_swapchain()
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the recording state without submitting, leaving the command
    /// buffer to be reset by the next frame on that image.
    pub(crate) fn abandon_frame(&mut self) {
        if let Some(frame) = self.active.take() {
            tracing::warn!("Abandoning frame {}", frame.index);
        }
    }
}

impl<W: HasDisplayHandle + HasWindowHandle> Drop for DeviceContext<W> {
    fn drop(&mut self) {
        tracing::debug!("Dropping device context {:?}", self.device.raw_device());
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Failed to wait for device idle during teardown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_items_wait_for_their_frame() {
        let mut queue = DeferredQueue::default();
        queue.push(3, "a");
        queue.push(5, "b");
        queue.push(4, "c");
        assert!(queue.collect(None).is_empty());
        assert_eq!(queue.collect(Some(2)), Vec::<&str>::new());
        assert_eq!(queue.collect(Some(4)), vec!["a", "c"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain(), vec!["b"]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn completion_only_moves_forward() {
        assert_eq!(advance_completed(None, None), None);
        assert_eq!(advance_completed(None, Some(2)), Some(2));
        assert_eq!(advance_completed(Some(5), Some(2)), Some(5));
        assert_eq!(advance_completed(Some(5), None), Some(5));
        assert_eq!(advance_completed(Some(5), Some(8)), Some(8));
    }

    #[test]
    fn retire_tags() {
        assert_eq!(retire_tag(0, false), None);
        assert_eq!(retire_tag(0, true), Some(0));
        assert_eq!(retire_tag(7, false), Some(6));
        assert_eq!(retire_tag(7, true), Some(7));
    }

    #[test]
    fn binding_tables_cover_every_slot() {
        let table = binding_table(vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(table.len(), MAX_BINDING_SLOTS as usize);
        assert!(table.iter().enumerate().all(|(i, b)| b.binding == i as u32
            && b.count == 1
            && b.stage_flags == vk::ShaderStageFlags::ALL));
    }
}
