//! Device-local 2D images, views and layout transitions.
//!
//! Layout tracking is left to the owner; [`layout_transition`] builds the
//! synchronization2 barrier for a known `old → new` pair.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::{AllocationError, vulkan::Allocation};
use thiserror::Error;

use crate::buffer::BufferHandle;
use crate::command::CommandBuffer;
use crate::device::{Device, MemoryUsage};

#[derive(Debug, Error)]
pub enum CreateImageError {
    #[error("Image extent must be non-zero, got {0}x{1}")]
    ZeroExtent(u32, u32),

    #[error("Image must have at least one array layer")]
    ZeroLayers,

    #[error("Cube images need a multiple of 6 layers, got {0}")]
    CubeLayerCount(u32),

    #[error("Vulkan error creating image: {0}")]
    CreateImage(vk::Result),

    #[error("GPU allocator error allocating memory: {0}")]
    AllocateMemory(AllocationError),

    #[error("Vulkan error binding image memory: {0}")]
    BindMemory(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateImageViewError {
    #[error("View layers {base}..{end} exceed image layer count {layers}")]
    LayerRange { base: u32, end: u32, layers: u32 },

    #[error("Vulkan error creating image view: {0}")]
    Vulkan(vk::Result),
}

/// The aspect a view or barrier of `format` covers.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

pub fn is_depth_stencil_format(format: vk::Format) -> bool {
    !aspect_for_format(format).contains(vk::ImageAspectFlags::COLOR)
}

/// Stage and access masks that cover every use of an image in `layout`.
fn layout_scope(
    layout: vk::ImageLayout,
) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match layout {
        vk::ImageLayout::UNDEFINED => {
            (vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ
                | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags2::FRAGMENT_SHADER
                | vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            vk::AccessFlags2::NONE,
        ),
        _ => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        ),
    }
}

/// A barrier moving `range` of `image` from `old` to `new`.
///
/// Moving *from* `PRESENT_SRC_KHR` waits on colour output so it chains with
/// the acquire semaphore wait stage.
pub fn layout_transition(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> vk::ImageMemoryBarrier2<'static> {
    let (src_stage, src_access) = if old == vk::ImageLayout::PRESENT_SRC_KHR {
        (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::NONE,
        )
    } else {
        layout_scope(old)
    };
    let (dst_stage, dst_access) = layout_scope(new);
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
}

/// One copy region per layer, layers packed back to back in the buffer.
fn layer_copy_regions(
    extent: vk::Extent2D,
    aspect: vk::ImageAspectFlags,
    layers: u32,
    bytes_per_layer: vk::DeviceSize,
) -> Vec<vk::BufferImageCopy> {
    (0..layers)
        .map(|layer| {
            vk::BufferImageCopy::default()
                .buffer_offset(bytes_per_layer * vk::DeviceSize::from(layer))
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(aspect)
                        .mip_level(0)
                        .base_array_layer(layer)
                        .layer_count(1),
                )
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
        })
        .collect()
}

/// Shape and usage of a [`DeviceLocalImage`]. Images always have one mip
/// level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub cube_compatible: bool,
}

impl ImageDesc {
    pub fn new_2d(
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            extent,
            format,
            usage,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            cube_compatible: false,
        }
    }

    fn validate(&self) -> Result<(), CreateImageError> {
        if self.extent.width == 0 || self.extent.height == 0 {
            return Err(CreateImageError::ZeroExtent(
                self.extent.width,
                self.extent.height,
            ));
        }
        if self.array_layers == 0 {
            return Err(CreateImageError::ZeroLayers);
        }
        if self.cube_compatible && !self.array_layers.is_multiple_of(6) {
            return Err(CreateImageError::CubeLayerCount(self.array_layers));
        }
        Ok(())
    }
}

pub struct DeviceLocalImage {
    parent: Arc<Device>,
    handle: vk::Image,
    allocation: Option<Allocation>,
    desc: ImageDesc,
}

impl std::fmt::Debug for DeviceLocalImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLocalImage")
            .field("handle", &self.handle)
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

impl DeviceLocalImage {
    pub fn new(
        device: &Arc<Device>,
        desc: &ImageDesc,
        name: Option<&str>,
    ) -> Result<Self, CreateImageError> {
        desc.validate()?;
        let flags = if desc.cube_compatible {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let create_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: create_info has no borrowed data.
        let handle = unsafe { device.create_raw_image(&create_info) }
            .map_err(CreateImageError::CreateImage)?;

        // SAFETY: handle is a valid image created from device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name image {:?}: {e}", handle);
        }

        // SAFETY: handle is a valid image created from this device.
        let reqs = unsafe { device.get_raw_image_memory_requirements(handle) };
        let allocation = device
            .allocate_memory(name.unwrap_or("image"), reqs, MemoryUsage::GpuOnly, false)
            .map_err(|e| {
                // SAFETY: handle is unbound and unused.
                unsafe { device.destroy_raw_image(handle) };
                CreateImageError::AllocateMemory(e)
            })?;

        // SAFETY: handle and allocation belong to this device.
        let bind_result = unsafe {
            device.bind_raw_image_memory(handle, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bind_result {
            if let Err(free_err) = device.free_memory(allocation) {
                tracing::error!("Failed to free GPU allocation: {free_err}");
            }
            // SAFETY: handle is owned by this scope and unused.
            unsafe { device.destroy_raw_image(handle) };
            return Err(CreateImageError::BindMemory(e));
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            allocation: Some(allocation),
            desc: *desc,
        })
    }

    pub fn raw_image(&self) -> vk::Image {
        self.handle
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.desc.samples
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for_format(self.desc.format)
    }

    /// Every layer of the single mip level.
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(self.aspect())
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(self.desc.array_layers)
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    /// Record the transition of every layer from `old` to `new`.
    ///
    /// # Safety
    /// `command_buffer` must be recording outside a render pass and the
    /// image must actually be in `old` when the barrier executes.
    pub unsafe fn record_transition(
        &self,
        command_buffer: &mut CommandBuffer,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) {
        let barrier = layout_transition(self.handle, self.full_range(), old, new);
        let dependency =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        // SAFETY: caller guarantees recording state and the old layout.
        unsafe { command_buffer.pipeline_barrier2(&dependency) };
    }

    /// Record an upload of `src` into every layer, leaving the image in
    /// `SHADER_READ_ONLY_OPTIMAL`. Previous contents are discarded.
    ///
    /// # Safety
    /// - `command_buffer` must be recording outside a render pass.
    /// - `src` must hold `bytes_per_layer * array_layers` bytes of tightly
    ///   packed texels and stay alive until the copy has executed.
    /// - The image needs `TRANSFER_DST` and `SAMPLED` usage.
    pub unsafe fn record_upload(
        &self,
        command_buffer: &mut CommandBuffer,
        src: &impl BufferHandle,
        bytes_per_layer: vk::DeviceSize,
    ) {
        let regions = layer_copy_regions(
            self.desc.extent,
            self.aspect(),
            self.desc.array_layers,
            bytes_per_layer,
        );
        // SAFETY: caller guarantees recording state, buffer size and usage.
        unsafe {
            self.record_transition(
                command_buffer,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            command_buffer.copy_buffer_to_image(src.raw_buffer(), self.handle, &regions);
            self.record_transition(
                command_buffer,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        }
    }

    /// Record a copy of every layer into `dst`, packed the same way
    /// [`record_upload`](Self::record_upload) expects, and return the image
    /// to `layout`.
    ///
    /// # Safety
    /// - `command_buffer` must be recording outside a render pass and the
    ///   image must be in `layout`, which is not `UNDEFINED`, when the copy
    ///   executes.
    /// - `dst` must hold `bytes_per_layer * array_layers` bytes and carry
    ///   `TRANSFER_DST` usage.
    /// - The image needs `TRANSFER_SRC` usage and a single sample.
    pub unsafe fn record_readback(
        &self,
        command_buffer: &mut CommandBuffer,
        dst: &impl BufferHandle,
        bytes_per_layer: vk::DeviceSize,
        layout: vk::ImageLayout,
    ) {
        let regions = layer_copy_regions(
            self.desc.extent,
            self.aspect(),
            self.desc.array_layers,
            bytes_per_layer,
        );
        // SAFETY: caller guarantees recording state, layout, buffer size and
        // usage.
        unsafe {
            self.record_transition(command_buffer, layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            command_buffer.copy_image_to_buffer(self.handle, dst.raw_buffer(), &regions);
            self.record_transition(command_buffer, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, layout);
        }
    }
}

impl Drop for DeviceLocalImage {
    fn drop(&mut self) {
        tracing::debug!("Dropping image {:?}", self.handle);
        // SAFETY: handle was created from parent; views hold an Arc to self
        // so none outlive it.
        unsafe { self.parent.destroy_raw_image(self.handle) };

        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.parent.free_memory(allocation)
        {
            tracing::error!("Failed to free GPU allocation: {e}");
        }
    }
}

/// A view of a contiguous layer range of a [`DeviceLocalImage`].
pub struct ImageView {
    parent: Arc<DeviceLocalImage>,
    handle: vk::ImageView,
    view_type: vk::ImageViewType,
    base_layer: u32,
    layer_count: u32,
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("handle", &self.handle)
            .field("view_type", &self.view_type)
            .field("layers", &(self.base_layer..self.base_layer + self.layer_count))
            .finish_non_exhaustive()
    }
}

impl ImageView {
    /// A view of all layers: `TYPE_2D` for one layer, `CUBE` for six layers
    /// of a cube-compatible image, `TYPE_2D_ARRAY` otherwise.
    pub fn new_full(
        image: &Arc<DeviceLocalImage>,
        name: Option<&str>,
    ) -> Result<Self, CreateImageViewError> {
        let desc = image.desc();
        let view_type = match (desc.array_layers, desc.cube_compatible) {
            (1, _) => vk::ImageViewType::TYPE_2D,
            (6, true) => vk::ImageViewType::CUBE,
            _ => vk::ImageViewType::TYPE_2D_ARRAY,
        };
        Self::new(image, view_type, 0, desc.array_layers, name)
    }

    pub fn new(
        image: &Arc<DeviceLocalImage>,
        view_type: vk::ImageViewType,
        base_layer: u32,
        layer_count: u32,
        name: Option<&str>,
    ) -> Result<Self, CreateImageViewError> {
        let layers = image.desc().array_layers;
        let end = base_layer.saturating_add(layer_count);
        if layer_count == 0 || end > layers {
            return Err(CreateImageViewError::LayerRange {
                base: base_layer,
                end,
                layers,
            });
        }
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(image.aspect())
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(base_layer)
            .layer_count(layer_count);
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image.raw_image())
            .view_type(view_type)
            .format(image.format())
            .subresource_range(range);

        let device = image.parent();
        // SAFETY: create_info references an image of this device and the
        // range was checked against its layer count.
        let handle = unsafe { device.create_raw_image_view(&create_info) }
            .map_err(CreateImageViewError::Vulkan)?;

        // SAFETY: handle is a valid image view created from device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name image view {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(image),
            handle,
            view_type,
            base_layer,
            layer_count,
        })
    }

    pub fn raw_image_view(&self) -> vk::ImageView {
        self.handle
    }

    pub fn image(&self) -> &Arc<DeviceLocalImage> {
        &self.parent
    }

    pub fn view_type(&self) -> vk::ImageViewType {
        self.view_type
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        tracing::debug!("Dropping image view {:?}", self.handle);
        // SAFETY: handle was created from the parent image's device and no
        // framebuffer or GPU work still uses it.
        unsafe { self.parent.parent().destroy_raw_image_view(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_follows_format() {
        assert_eq!(
            aspect_for_format(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert!(is_depth_stencil_format(vk::Format::S8_UINT));
        assert!(!is_depth_stencil_format(vk::Format::B8G8R8A8_SRGB));
    }

    #[test]
    fn transition_from_present_waits_on_colour_output() {
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1);
        let barrier = layout_transition(
            vk::Image::null(),
            range,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(
            barrier.src_stage_mask,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(barrier.old_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    #[test]
    fn transition_to_present_has_no_destination_access() {
        let barrier = layout_transition(
            vk::Image::null(),
            vk::ImageSubresourceRange::default(),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        assert!(
            barrier
                .src_access_mask
                .contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
        );
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::NONE);
    }

    #[test]
    fn copy_regions_pack_layers() {
        let regions = layer_copy_regions(
            vk::Extent2D { width: 4, height: 4 },
            vk::ImageAspectFlags::COLOR,
            6,
            64,
        );
        assert_eq!(regions.len(), 6);
        assert_eq!(regions[5].buffer_offset, 320);
        assert_eq!(regions[5].image_subresource.base_array_layer, 5);
        assert_eq!(regions[0].image_extent.depth, 1);
    }

    #[test]
    fn desc_validation() {
        let mut desc = ImageDesc::new_2d(
            vk::Extent2D { width: 8, height: 8 },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
        );
        assert!(desc.validate().is_ok());
        desc.cube_compatible = true;
        assert!(matches!(
            desc.validate(),
            Err(CreateImageError::CubeLayerCount(1))
        ));
        desc.array_layers = 6;
        assert!(desc.validate().is_ok());
        desc.extent.width = 0;
        assert!(matches!(
            desc.validate(),
            Err(CreateImageError::ZeroExtent(0, 8))
        ));
    }
}
