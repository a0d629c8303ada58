//! Presentation surface bound to a native window.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::instance::Instance;

#[derive(Debug, Error)]
pub enum CreateSurfaceError {
    #[error("Couldn't get display handle: {0}")]
    InvalidDisplayHandle(raw_window_handle::HandleError),
    #[error("Couldn't get window handle: {0}")]
    InvalidWindowHandle(raw_window_handle::HandleError),
    #[error("Vulkan surface creation failed: {0}")]
    Vulkan(vk::Result),
    #[error("The instance was created without the platform surface extensions")]
    MissingExtension,
}

#[derive(Debug, Error)]
pub enum SurfaceSupportError {
    #[error("Surface extension is not loaded")]
    ExtensionNotLoaded,
    #[error("Vulkan error checking surface support: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum SurfaceQueryError {
    #[error("Surface extension is not loaded")]
    ExtensionNotLoaded,
    #[error("Vulkan error querying surface: {0}")]
    Vulkan(vk::Result),
}

/// A `VkSurfaceKHR` that keeps both its instance and its window alive.
///
/// The window type is generic so any `raw-window-handle` source can be
/// injected; the renderer never creates windows itself.
pub struct Surface<T: HasWindowHandle + HasDisplayHandle> {
    parent: Arc<Instance>,
    handle: vk::SurfaceKHR,
    _window: Arc<T>,
}

impl<T: HasWindowHandle + HasDisplayHandle> std::fmt::Debug for Surface<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("handle", &self.handle)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

impl<T: HasWindowHandle + HasDisplayHandle> Surface<T> {
    /// Create a surface for `window`.
    ///
    /// # Safety
    /// The surface must be dropped whenever the platform invalidates it
    /// (for example on a winit suspend), and no GPU work may still use
    /// anything derived from it when it is dropped.
    pub unsafe fn new(
        instance: &Arc<Instance>,
        window: Arc<T>,
    ) -> Result<Self, CreateSurfaceError> {
        // SAFETY: the Arc clones below keep both the instance and the window
        // alive for as long as the surface.
        let handle = unsafe { instance.create_raw_surface(window.as_ref()) }?;
        tracing::debug!("Created surface {:?}", handle);
        Ok(Self {
            parent: Arc::clone(instance),
            handle,
            _window: window,
        })
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn raw_handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Whether `queue_family_index` on `physical_device` can present here.
    ///
    /// # Safety
    /// `physical_device` must come from the same instance as this surface.
    pub unsafe fn supports_queue_family(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
    ) -> Result<bool, SurfaceSupportError> {
        // SAFETY: caller guarantees provenance; self.handle is live.
        unsafe {
            self.parent.get_raw_physical_device_surface_support(
                physical_device,
                queue_family_index,
                self.handle,
            )
        }
    }

    /// # Safety
    /// `physical_device` must come from the same instance as this surface.
    pub unsafe fn query_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceQueryError> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.parent
                .get_surface_capabilities(physical_device, self.handle)
        }
    }

    /// # Safety
    /// `physical_device` must come from the same instance as this surface.
    pub unsafe fn query_formats(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceQueryError> {
        // SAFETY: caller guarantees provenance.
        unsafe { self.parent.get_surface_formats(physical_device, self.handle) }
    }

    /// # Safety
    /// `physical_device` must come from the same instance as this surface.
    pub unsafe fn query_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceQueryError> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.parent
                .get_surface_present_modes(physical_device, self.handle)
        }
    }
}

impl<T: HasWindowHandle + HasDisplayHandle> Drop for Surface<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping surface {:?}", self.handle);
        // SAFETY: swapchains hold an Arc to their surface, so nothing derived
        // from this surface is still alive.
        if let Err(e) = unsafe { self.parent.destroy_raw_surface(self.handle) }
        {
            tracing::error!("Error while dropping surface {:?}: {e}", self.handle);
        }
    }
}
