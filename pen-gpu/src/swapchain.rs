use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use crate::device::{Device, QueueFamilies};
use crate::surface::{Surface, SurfaceQueryError};

static SWAPCHAIN_DEBUG_INDEX: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum CreateSwapchainError {
    #[error(
        "Mismatched parameters to Swapchain::new/new_with_old. \
         Device, surface, and optional old swapchain must be \
         derived from the same instance"
    )]
    MismatchedParams,

    #[error("No supported surface formats were reported")]
    NoSurfaceFormats,

    #[error("No supported present modes were reported")]
    NoPresentModes,

    #[error("Invalid requested swapchain extent ({width}x{height})")]
    InvalidExtent { width: u32, height: u32 },

    #[error("Failed while querying surface support details: {0}")]
    SurfaceQuery(#[from] SurfaceQueryError),

    #[error("Vulkan error creating swapchain: {0}")]
    VulkanCreate(vk::Result),

    #[error("Vulkan error fetching swapchain images: {0}")]
    VulkanGetImages(vk::Result),

    #[error("Vulkan error creating swapchain image view: {0}")]
    VulkanCreateImageView(vk::Result),
}

/// Requested swapchain parameters. Unsupported values fall back to what the
/// surface offers, with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub min_image_count: u32,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            min_image_count: 3,
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            present_mode: vk::PresentModeKHR::FIFO,
        }
    }
}

fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    format: vk::Format,
    color_space: vk::ColorSpaceKHR,
) -> vk::SurfaceFormatKHR {
    // A single UNDEFINED entry means the surface has no preference.
    if let [only] = formats
        && only.format == vk::Format::UNDEFINED
    {
        return vk::SurfaceFormatKHR { format, color_space };
    }

    formats
        .iter()
        .copied()
        .find(|f| f.format == format && f.color_space == color_space)
        .or_else(|| formats.iter().copied().find(|f| f.format == format))
        .or_else(|| {
            formats.iter().copied().find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .unwrap_or(formats[0])
}

fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if present_modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

fn choose_image_count(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: u32,
) -> u32 {
    let mut image_count = requested.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        image_count = image_count.min(capabilities.max_image_count);
    }
    image_count
}

fn choose_composite_alpha(
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|mode| capabilities.supported_composite_alpha.contains(*mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::INHERIT)
}

/// Colour attachment always; transfer source/destination when the surface
/// allows them (clears and read-back go through transfers).
fn choose_image_usage(
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::ImageUsageFlags {
    let transfer =
        vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC;
    vk::ImageUsageFlags::COLOR_ATTACHMENT
        | (capabilities.supported_usage_flags & transfer)
}

fn sharing_mode(families: QueueFamilies) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, families.unique())
    }
}

fn create_swapchain_image_views<FCreate, FDestroy, FName>(
    images: &[vk::Image],
    format: vk::Format,
    mut create_image_view: FCreate,
    mut destroy_image_view: FDestroy,
    mut name_image_view: FName,
) -> Result<Vec<vk::ImageView>, CreateSwapchainError>
where
    FCreate: FnMut(
        &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result>,
    FDestroy: FnMut(vk::ImageView),
    FName: FnMut(usize, vk::ImageView),
{
    let mut image_views: Vec<vk::ImageView> = Vec::with_capacity(images.len());
    for (index, image) in images.iter().copied().enumerate() {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );

        match create_image_view(&create_info) {
            Ok(view) => {
                name_image_view(index, view);
                image_views.push(view);
            }
            Err(e) => {
                for created_view in image_views.drain(..) {
                    destroy_image_view(created_view);
                }
                return Err(CreateSwapchainError::VulkanCreateImageView(e));
            }
        }
    }

    Ok(image_views)
}

/// A swapchain plus one colour view per image.
pub struct Swapchain<T: HasDisplayHandle + HasWindowHandle> {
    parent_device: Arc<Device>,
    parent_surface: Arc<Surface<T>>,
    handle: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    usage: vk::ImageUsageFlags,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    /// `vkAcquireNextImageKHR` must be externally synchronised per
    /// swapchain.
    acquire_lock: Mutex<()>,
}

impl<T: HasDisplayHandle + HasWindowHandle> std::fmt::Debug for Swapchain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("format", &self.surface_format.format)
            .field("present_mode", &self.present_mode)
            .field("extent", &self.extent)
            .field("image_count", &self.images.len())
            .finish_non_exhaustive()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Swapchain<T> {
    pub fn new(
        parent_device: &Arc<Device>,
        parent_surface: &Arc<Surface<T>>,
        desired_extent: vk::Extent2D,
        config: &SwapchainConfig,
    ) -> Result<Self, CreateSwapchainError> {
        Self::new_with_old(
            parent_device,
            parent_surface,
            desired_extent,
            None,
            config,
        )
    }

    /// Create a swapchain, handing `old_swapchain` to the driver for
    /// resource reuse on recreation.
    ///
    /// The caller must make sure no GPU work still uses the old swapchain's
    /// images before dropping it.
    pub fn new_with_old(
        parent_device: &Arc<Device>,
        parent_surface: &Arc<Surface<T>>,
        desired_extent: vk::Extent2D,
        old_swapchain: Option<&Self>,
        config: &SwapchainConfig,
    ) -> Result<Self, CreateSwapchainError> {
        if desired_extent.width == 0 || desired_extent.height == 0 {
            return Err(CreateSwapchainError::InvalidExtent {
                width: desired_extent.width,
                height: desired_extent.height,
            });
        }

        if !Arc::ptr_eq(parent_surface.parent(), parent_device.parent()) {
            return Err(CreateSwapchainError::MismatchedParams);
        }

        if let Some(old_swapchain) = old_swapchain
            && (!Arc::ptr_eq(&old_swapchain.parent_device, parent_device)
                || !Arc::ptr_eq(&old_swapchain.parent_surface, parent_surface))
        {
            return Err(CreateSwapchainError::MismatchedParams);
        }

        let physical_device = parent_device.physical_device();

        // SAFETY: physical_device belongs to parent_device's instance, and
        // parent_surface is derived from the same instance (checked above).
        let capabilities =
            unsafe { parent_surface.query_capabilities(physical_device) }?;
        // SAFETY: as above.
        let formats = unsafe { parent_surface.query_formats(physical_device) }?;
        // SAFETY: as above.
        let present_modes =
            unsafe { parent_surface.query_present_modes(physical_device) }?;

        if formats.is_empty() {
            return Err(CreateSwapchainError::NoSurfaceFormats);
        }
        if present_modes.is_empty() {
            return Err(CreateSwapchainError::NoPresentModes);
        }

        let surface_format =
            choose_surface_format(&formats, config.format, config.color_space);
        if surface_format.format != config.format
            || surface_format.color_space != config.color_space
        {
            tracing::warn!(
                "Surface format {:?}/{:?} unsupported, using {:?}/{:?}",
                config.format,
                config.color_space,
                surface_format.format,
                surface_format.color_space,
            );
        }
        let present_mode = choose_present_mode(&present_modes, config.present_mode);
        if present_mode != config.present_mode {
            tracing::warn!(
                "Present mode {:?} unsupported, using {:?}",
                config.present_mode,
                present_mode,
            );
        }
        let extent = choose_extent(&capabilities, desired_extent);
        let image_count = choose_image_count(&capabilities, config.min_image_count);
        let composite_alpha = choose_composite_alpha(&capabilities);
        let usage = choose_image_usage(&capabilities);
        let (sharing, queue_family_indices) =
            sharing_mode(parent_device.queue_families());

        let swapchain_create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(parent_surface.raw_handle())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(sharing)
            .queue_family_indices(&queue_family_indices)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(composite_alpha)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(
                old_swapchain
                    .map(|swapchain| swapchain.handle)
                    .unwrap_or(vk::SwapchainKHR::null()),
            );

        // SAFETY: create info references valid handles and values selected
        // from queried surface support details.
        let handle = unsafe {
            parent_device.create_raw_swapchain(&swapchain_create_info)
        }?;
        let debug_index = SWAPCHAIN_DEBUG_INDEX.fetch_add(1, Ordering::Relaxed);
        name_best_effort(parent_device, handle, || {
            format!("Swapchain {debug_index}")
        });

        // SAFETY: handle was just created by this device.
        let images = unsafe { parent_device.get_raw_swapchain_images(handle) }
            .inspect_err(|_| {
                // SAFETY: handle was created above and nothing uses it yet.
                unsafe { parent_device.destroy_raw_swapchain(handle) };
            })?;
        for (index, image) in images.iter().copied().enumerate() {
            name_best_effort(parent_device, image, || {
                format!("Swapchain {debug_index} Image {}", index + 1)
            });
        }

        let image_views = create_swapchain_image_views(
            &images,
            surface_format.format,
            |create_info| {
                // SAFETY: create_info references a swapchain image of this
                // device with a plain 2D colour range.
                unsafe { parent_device.create_raw_image_view(create_info) }
            },
            |image_view| {
                // SAFETY: image_view was created above and is unused.
                unsafe { parent_device.destroy_raw_image_view(image_view) };
            },
            |index, image_view| {
                name_best_effort(parent_device, image_view, || {
                    format!("Swapchain {debug_index} ImageView {}", index + 1)
                });
            },
        )
        .inspect_err(|_| {
            // SAFETY: handle was created above and nothing uses it yet.
            unsafe { parent_device.destroy_raw_swapchain(handle) };
        })?;

        tracing::info!(
            "Created swapchain {:?}: {}x{} {:?}, {:?}, {} images",
            handle,
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            images.len(),
        );

        Ok(Self {
            parent_device: Arc::clone(parent_device),
            parent_surface: Arc::clone(parent_surface),
            handle,
            surface_format,
            present_mode,
            usage,
            extent,
            images,
            image_views,
            acquire_lock: Mutex::new(()),
        })
    }

    pub fn parent_device(&self) -> &Arc<Device> {
        &self.parent_device
    }

    pub fn parent_surface(&self) -> &Arc<Surface<T>> {
        &self.parent_surface
    }

    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.surface_format.color_space
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    pub fn raw_handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// Acquire the next presentable image, returning `(index, suboptimal)`.
    ///
    /// `Err(ERROR_OUT_OF_DATE_KHR)` means the swapchain must be recreated.
    ///
    /// # Safety
    /// `semaphore` and `fence`, when not null, must be unsignaled handles of
    /// this swapchain's device.
    pub unsafe fn acquire_next_image(
        &self,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(u32, bool), vk::Result> {
        let _guard = self
            .acquire_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // SAFETY: caller guarantees semaphore and fence validity; self.handle
        // is live for the lifetime of this Swapchain.
        unsafe {
            self.parent_device.acquire_next_swapchain_image(
                self.handle,
                timeout_ns,
                semaphore,
                fence,
            )
        }
    }

    /// Queue `image_index` for presentation. `Ok(true)` means suboptimal.
    ///
    /// # Safety
    /// `image_index` must have been acquired and be in `PRESENT_SRC_KHR`
    /// once `wait_semaphores` signal; the semaphores must belong to this
    /// swapchain's device.
    pub unsafe fn present(
        &self,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool, vk::Result> {
        let swapchains = [self.handle];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        // SAFETY: caller guarantees image and semaphore state.
        unsafe { self.parent_device.queue_present(&present_info) }
    }
}

fn name_best_effort<H: vk::Handle + Copy + std::fmt::Debug>(
    device: &Device,
    object: H,
    name: impl FnOnce() -> String,
) {
    if !device.has_debug_utils() {
        return;
    }
    // SAFETY: object is a live handle owned by device.
    if let Err(e) = unsafe { device.set_object_name_str(object, Some(&name())) } {
        tracing::warn!("Failed to name {:?}: {e}", object);
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Drop for Swapchain<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping swapchain {:?}", self.handle);
        // Callers wait for the GPU before dropping, so no in-flight work
        // references these views or the swapchain.
        for image_view in self.image_views.drain(..) {
            // SAFETY: image_view was created by parent_device.
            unsafe { self.parent_device.destroy_raw_image_view(image_view) };
        }
        // SAFETY: the swapchain was created by parent_device and this is the
        // only destruction path.
        unsafe { self.parent_device.destroy_raw_swapchain(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;

    fn format(
        format: vk::Format,
        color_space: vk::ColorSpaceKHR,
    ) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn surface_format_uses_requested_pair() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(
            &formats,
            vk::Format::B8G8R8A8_SRGB,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        );
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn surface_format_falls_back_to_bgra_then_first() {
        let bgra =
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        let rgba =
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR);

        let chosen = choose_surface_format(
            &[rgba, bgra],
            vk::Format::R16G16B16A16_SFLOAT,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        );
        assert_eq!(chosen.format, bgra.format);

        let chosen = choose_surface_format(
            &[rgba],
            vk::Format::R16G16B16A16_SFLOAT,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        );
        assert_eq!(chosen.format, rgba.format);
    }

    #[test]
    fn surface_format_undefined_means_anything_goes() {
        let chosen = choose_surface_format(
            &[format(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR)],
            vk::Format::B8G8R8A8_UNORM,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        );
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn present_mode_uses_preferred_when_available() {
        let chosen = choose_present_mode(
            &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            vk::PresentModeKHR::MAILBOX,
        );
        assert_eq!(chosen, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let chosen = choose_present_mode(
            &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO],
            vk::PresentModeKHR::MAILBOX,
        );
        assert_eq!(chosen, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_uses_current_when_fixed() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };

        let chosen = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
        );

        assert_eq!(chosen.width, 800);
        assert_eq!(chosen.height, 600);
    }

    #[test]
    fn extent_clamps_when_variable() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };

        let chosen = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 4000,
                height: 200,
            },
        );

        assert_eq!(chosen.width, 1920);
        assert_eq!(chosen.height, 480);
    }

    #[test]
    fn image_count_clamped_to_surface_limits() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities, 3), 2);

        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 4,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities, 3), 4);

        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities, 3), 3);
    }

    #[test]
    fn composite_alpha_prefers_opaque_then_pre_multiplied() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            supported_composite_alpha:
                vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
                    | vk::CompositeAlphaFlagsKHR::OPAQUE,
            ..Default::default()
        };
        assert_eq!(
            choose_composite_alpha(&capabilities),
            vk::CompositeAlphaFlagsKHR::OPAQUE
        );

        let capabilities = vk::SurfaceCapabilitiesKHR {
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::INHERIT,
            ..Default::default()
        };
        assert_eq!(
            choose_composite_alpha(&capabilities),
            vk::CompositeAlphaFlagsKHR::INHERIT
        );
    }

    #[test]
    fn image_usage_adds_supported_transfers_only() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        };
        assert_eq!(
            choose_image_usage(&capabilities),
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST
        );
    }

    #[test]
    fn sharing_is_exclusive_for_one_family() {
        let (mode, indices) = sharing_mode(QueueFamilies {
            graphics: 0,
            present: 0,
        });
        assert_eq!(mode, vk::SharingMode::EXCLUSIVE);
        assert!(indices.is_empty());

        let (mode, indices) = sharing_mode(QueueFamilies {
            graphics: 0,
            present: 2,
        });
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn image_view_helper_cleans_up_on_partial_failure() {
        let images = [
            vk::Image::from_raw(1),
            vk::Image::from_raw(2),
            vk::Image::from_raw(3),
        ];
        let first_view = vk::ImageView::from_raw(10);
        let create_calls = RefCell::new(0usize);
        let destroyed = RefCell::new(Vec::<vk::ImageView>::new());

        let result = create_swapchain_image_views(
            &images,
            vk::Format::B8G8R8A8_UNORM,
            |_| {
                let mut call = create_calls.borrow_mut();
                let ret = match *call {
                    0 => Ok(first_view),
                    _ => Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
                };
                *call += 1;
                ret
            },
            |view| destroyed.borrow_mut().push(view),
            |_index, _view| {},
        );

        assert!(matches!(
            result,
            Err(CreateSwapchainError::VulkanCreateImageView(
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            ))
        ));
        assert_eq!(destroyed.borrow().as_slice(), &[first_view]);
    }

    #[test]
    fn image_view_helper_names_every_view() {
        let images = [vk::Image::from_raw(1), vk::Image::from_raw(2)];
        let views =
            [vk::ImageView::from_raw(100), vk::ImageView::from_raw(101)];
        let create_calls = RefCell::new(0usize);
        let named = RefCell::new(Vec::new());

        let result = create_swapchain_image_views(
            &images,
            vk::Format::B8G8R8A8_UNORM,
            |info| {
                assert_eq!(info.image, images[*create_calls.borrow()]);
                let mut call = create_calls.borrow_mut();
                let view = views[*call];
                *call += 1;
                Ok(view)
            },
            |_view| panic!("nothing should be destroyed on success"),
            |index, view| named.borrow_mut().push((index, view)),
        )
        .expect("helper should succeed");

        assert_eq!(result, views);
        assert_eq!(
            named.borrow().as_slice(),
            &[(0, views[0]), (1, views[1])]
        );
    }
}
