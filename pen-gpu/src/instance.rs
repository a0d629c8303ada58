//! Vulkan instance creation and physical device queries.
//!
//! [`Instance`] wraps an `ash::Instance` together with the loader entry
//! points, the optional validation messenger and the optional surface
//! extension loader. Creation enumerates the layers and extensions the
//! loader exposes and logs them; they are diagnostic only and never make
//! creation fail beyond the extensions the window system requires.

use std::{
    ffi::{CStr, CString},
    fmt::Debug,
};

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::surface::{
    CreateSurfaceError, SurfaceQueryError, SurfaceSupportError,
};

pub(crate) const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Lowest severity of validation message forwarded to `tracing`.
///
/// Ordered least to most severe, so `Warning` also forwards `Error`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum ValidationLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl ValidationLevel {
    fn severity_mask(self) -> vk::DebugUtilsMessageSeverityFlagsEXT {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        match self {
            ValidationLevel::Verbose => {
                S::VERBOSE | S::INFO | S::WARNING | S::ERROR
            }
            ValidationLevel::Info => S::INFO | S::WARNING | S::ERROR,
            ValidationLevel::Warning => S::WARNING | S::ERROR,
            ValidationLevel::Error => S::ERROR,
        }
    }
}

/// A packed Vulkan API version word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersion(u32);

impl ApiVersion {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn new(variant: u32, major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(variant, major, minor, patch))
    }

    pub fn variant(&self) -> u32 {
        vk::api_version_variant(self.0)
    }
    pub fn major(&self) -> u32 {
        vk::api_version_major(self.0)
    }
    pub fn minor(&self) -> u32 {
        vk::api_version_minor(self.0)
    }
    pub fn patch(&self) -> u32 {
        vk::api_version_patch(self.0)
    }

    /// True when this version is at least `major.minor`.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major(), self.minor()) >= (major, minor)
    }
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

/// The root Vulkan object.
///
/// Every object derived from an instance holds an `Arc<Instance>`, so the
/// instance (and with it the validation messenger) is destroyed last.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    debug_messenger:
        Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
    surface_instance: Option<ash::khr::surface::Instance>,
    version: ApiVersion,
}

impl Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .field("version", &self.version)
            .field("validation", &self.debug_messenger.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum CreateInstanceError {
    #[error("Could not load the Vulkan library: {0}")]
    Loading(ash::LoadingError),
    #[error("Couldn't get a display handle from the window source: {0}")]
    InvalidDisplayHandle(crate::RwhHandleError),
    #[error("Missing instance extensions required by the window system: {0:?}")]
    MissingExtensions(Vec<String>),
    #[error("Application name contains an interior NUL byte")]
    InvalidAppName,
    #[error("Vulkan error creating instance: {0}")]
    Vulkan(#[from] vk::Result),
}

#[derive(Debug, Error)]
pub enum FetchPhysicalDeviceError {
    #[error("Memory exhausted while enumerating physical devices")]
    MemoryExhaustion,
    #[error("Vulkan error enumerating physical devices: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum DestroyRawSurfaceError {
    #[error("Surface extension is not loaded")]
    ExtensionNotLoaded,
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        if let Some((messenger, debug_utils)) = self.debug_messenger.take() {
            // SAFETY: the messenger was created from this instance and this is
            // its last use.
            unsafe { debug_utils.destroy_debug_utils_messenger(messenger, None) };
        }
        // SAFETY: drop is the last use of the instance; every derived object
        // holds an Arc to it and is therefore already gone.
        unsafe { self.handle.destroy_instance(None) };
    }
}

unsafe extern "system" fn validation_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: the loader passes a valid callback data pointer whose message is
    // a NUL-terminated string for the duration of the callback.
    let message = unsafe { CStr::from_ptr((*p_callback_data).p_message) }
        .to_string_lossy();

    let kind = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "general",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "performance",
        _ => "unknown",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::trace!(target: "pen_gpu::validation", "[vulkan {kind}] {message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(target: "pen_gpu::validation", "[vulkan {kind}] {message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "pen_gpu::validation", "[vulkan {kind}] {message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "pen_gpu::validation", "[vulkan {kind}] {message}")
        }
        _ => {
            tracing::debug!(target: "pen_gpu::validation", "[vulkan {kind}] {message}")
        }
    }

    // Never ask the driver to abort the call that triggered the message.
    vk::FALSE
}

/// Names of `required` that are absent from `available`.
fn missing_extensions(required: &[&CStr], available: &[&CStr]) -> Vec<String> {
    required
        .iter()
        .filter(|req| !available.contains(req))
        .map(|ext| ext.to_string_lossy().into_owned())
        .collect()
}

/// Optional instance-level extensions for [`Instance::new`].
#[derive(Debug, Default, Clone, Copy)]
pub struct InstanceExtensions {
    /// Enable the platform surface extensions. Requires a display handle
    /// source to be passed to [`Instance::new`].
    pub surface: bool,
}

impl Instance {
    /// Load Vulkan and create an instance at the highest API version the
    /// loader supports.
    ///
    /// When `validation` is `Some` and both the Khronos validation layer
    /// and `VK_EXT_debug_utils` are present, a messenger forwarding
    /// messages at or above that level to `tracing` is installed. Missing
    /// validation support is logged and otherwise ignored.
    ///
    /// # Safety
    /// Loading the Vulkan library runs arbitrary code from the system
    /// loader.
    pub unsafe fn new(
        app_name: impl AsRef<str>,
        validation: Option<ValidationLevel>,
        display_handle_source: Option<&impl HasDisplayHandle>,
        extensions: InstanceExtensions,
    ) -> Result<Self, CreateInstanceError> {
        use CreateInstanceError as Error;

        let app_name = CString::new(app_name.as_ref())
            .map_err(|_| Error::InvalidAppName)?;

        // SAFETY: the caller accepts the cost of loading the library. Entry is
        // kept alive inside the Instance until after vkDestroyInstance.
        let entry = unsafe { ash::Entry::load() }.map_err(Error::Loading)?;

        // SAFETY: entry is live; vkEnumerateInstanceVersion has no further
        // preconditions.
        let api_version = unsafe { entry.try_enumerate_instance_version() }
            .ok()
            .flatten()
            .unwrap_or(vk::API_VERSION_1_0);

        // SAFETY: entry is live; None queries the global extension list.
        let available_exts =
            unsafe { entry.enumerate_instance_extension_properties(None) }?;
        // SAFETY: entry is live.
        let available_layers = unsafe { entry.enumerate_instance_layer_properties() }
            .unwrap_or_default();

        let ext_names: Vec<&CStr> = available_exts
            .iter()
            .filter_map(|e| e.extension_name_as_c_str().ok())
            .collect();
        let layer_names: Vec<&CStr> = available_layers
            .iter()
            .filter_map(|l| l.layer_name_as_c_str().ok())
            .collect();
        tracing::debug!("Available instance layers: {layer_names:?}");
        tracing::debug!("Available instance extensions: {ext_names:?}");

        let mut required_exts: Vec<&CStr> = Vec::new();
        let mut surface_enabled = false;
        if let Some(display_handle_source) = display_handle_source
            && extensions.surface
        {
            surface_enabled = true;
            let window_exts = ash_window::enumerate_required_extensions(
                display_handle_source
                    .display_handle()
                    .map_err(Error::InvalidDisplayHandle)?
                    .as_raw(),
            )?;
            required_exts.extend(
                window_exts
                    .iter()
                    // SAFETY: ash_window documents these as pointers to
                    // static NUL-terminated extension names.
                    .map(|ptr| unsafe { CStr::from_ptr(*ptr) }),
            );
        }

        let missing = missing_extensions(&required_exts, &ext_names);
        if !missing.is_empty() {
            return Err(Error::MissingExtensions(missing));
        }

        let debug_utils_name = ash::ext::debug_utils::NAME;
        let validation_available = ext_names.contains(&debug_utils_name)
            && layer_names.contains(&VALIDATION_LAYER_NAME);
        if validation.is_some() && !validation_available {
            tracing::warn!(
                "Validation was requested but {:?} or {:?} is unavailable; \
                 continuing without it",
                VALIDATION_LAYER_NAME,
                debug_utils_name
            );
        }

        let mut enabled_ext_ptrs: Vec<*const std::ffi::c_char> =
            required_exts.iter().map(|e| e.as_ptr()).collect();
        let mut enabled_layers: Vec<*const std::ffi::c_char> = Vec::new();

        let mut messenger_info = match validation {
            Some(level) if validation_available => {
                enabled_ext_ptrs.push(debug_utils_name.as_ptr());
                enabled_layers.push(VALIDATION_LAYER_NAME.as_ptr());
                Some(
                    vk::DebugUtilsMessengerCreateInfoEXT::default()
                        .message_severity(level.severity_mask())
                        .message_type(
                            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                        )
                        .pfn_user_callback(Some(validation_callback)),
                )
            }
            _ => None,
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"pen")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&enabled_ext_ptrs)
            .enabled_layer_names(&enabled_layers);
        // Chaining the messenger info also reports messages emitted during
        // vkCreateInstance itself.
        if let Some(ref mut info) = messenger_info {
            create_info = create_info.push_next(info);
        }

        // SAFETY: create_info and everything it points to lives until the
        // call returns.
        let handle = unsafe { entry.create_instance(&create_info, None) }?;

        let debug_messenger = match messenger_info {
            Some(mut info) => {
                info.p_next = std::ptr::null();
                let debug_utils =
                    ash::ext::debug_utils::Instance::new(&entry, &handle);
                // SAFETY: info is a valid messenger create info with no chain.
                match unsafe {
                    debug_utils.create_debug_utils_messenger(&info, None)
                } {
                    Ok(messenger) => Some((messenger, debug_utils)),
                    Err(e) => {
                        tracing::error!(
                            "Failed to create the validation messenger, \
                             continuing without it: {e}"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let surface_instance = surface_enabled
            .then(|| ash::khr::surface::Instance::new(&entry, &handle));

        let version = ApiVersion::from_raw(api_version);
        tracing::info!(
            "Created Vulkan {version} instance (validation: {})",
            debug_messenger.is_some()
        );

        Ok(Self {
            entry,
            handle,
            debug_messenger,
            surface_instance,
            version,
        })
    }

    /// The instance API version reported by the loader.
    pub fn version(&self) -> ApiVersion {
        self.version
    }

    /// Whether the validation layer and messenger are active.
    pub fn validation_enabled(&self) -> bool {
        self.debug_messenger.is_some()
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }

    /// Physical device handles, only meaningful with this instance.
    pub fn fetch_raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, FetchPhysicalDeviceError> {
        // SAFETY: the instance is live for the duration of the call.
        match unsafe { self.handle.enumerate_physical_devices() } {
            Ok(devices) => Ok(devices),
            Err(
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                | vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            ) => Err(FetchPhysicalDeviceError::MemoryExhaustion),
            Err(e) => Err(FetchPhysicalDeviceError::Vulkan(e)),
        }
    }

    /// # Safety
    /// `physical_device` must come from this instance.
    pub unsafe fn get_raw_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.get_physical_device_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must come from this instance.
    pub unsafe fn get_raw_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must come from this instance.
    pub unsafe fn get_raw_physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .get_physical_device_memory_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must come from this instance.
    pub unsafe fn get_raw_physical_device_format_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        format: vk::Format,
    ) -> vk::FormatProperties {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .get_physical_device_format_properties(physical_device, format)
        }
    }

    /// # Safety
    /// `physical_device` must come from this instance.
    pub unsafe fn enumerate_raw_device_extension_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::ExtensionProperties>, vk::Result> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .enumerate_device_extension_properties(physical_device)
        }
    }

    /// Create a logical device.
    ///
    /// # Safety
    /// `physical_device` must come from this instance and `create_info`
    /// must be a valid create info whose pointers outlive the call.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        // SAFETY: caller guarantees provenance and create_info validity.
        unsafe { self.handle.create_device(physical_device, create_info, None) }
    }
}

// Surface functionality
impl Instance {
    /// Create a raw `VkSurfaceKHR` for a window.
    ///
    /// # Safety
    /// The surface must be destroyed before `source`'s window goes away and
    /// must only be used with this instance.
    pub unsafe fn create_raw_surface<T: HasDisplayHandle + HasWindowHandle>(
        &self,
        source: &T,
    ) -> Result<vk::SurfaceKHR, CreateSurfaceError> {
        use CreateSurfaceError as Error;
        if self.surface_instance.is_none() {
            return Err(Error::MissingExtension);
        }
        let display = source
            .display_handle()
            .map_err(Error::InvalidDisplayHandle)?
            .as_raw();
        let window = source
            .window_handle()
            .map_err(Error::InvalidWindowHandle)?
            .as_raw();
        // SAFETY: the handles come from a live window source and the surface
        // extensions were enabled on this instance.
        unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.handle,
                display,
                window,
                None,
            )
        }
        .map_err(Error::Vulkan)
    }

    /// # Safety
    /// `surface` must come from this instance, every object derived from it
    /// must be destroyed and no GPU work may still reference it.
    pub unsafe fn destroy_raw_surface(
        &self,
        surface: vk::SurfaceKHR,
    ) -> Result<(), DestroyRawSurfaceError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(DestroyRawSurfaceError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { surface_instance.destroy_surface(surface, None) };
        Ok(())
    }

    /// # Safety
    /// `physical_device` and `surface` must come from this instance.
    pub unsafe fn get_raw_physical_device_surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, SurfaceSupportError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceSupportError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        unsafe {
            surface_instance.get_physical_device_surface_support(
                physical_device,
                queue_family_index,
                surface,
            )
        }
        .map_err(SurfaceSupportError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must come from this instance.
    pub unsafe fn get_surface_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        unsafe {
            surface_instance
                .get_physical_device_surface_capabilities(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must come from this instance.
    pub unsafe fn get_surface_formats(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        unsafe {
            surface_instance
                .get_physical_device_surface_formats(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must come from this instance.
    pub unsafe fn get_surface_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        unsafe {
            surface_instance
                .get_physical_device_surface_present_modes(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }
}

// Device-level extension loaders
impl Instance {
    pub fn create_swapchain_loader(
        &self,
        device: &ash::Device,
    ) -> ash::khr::swapchain::Device {
        ash::khr::swapchain::Device::new(&self.handle, device)
    }

    pub fn create_synchronization2_loader(
        &self,
        device: &ash::Device,
    ) -> ash::khr::synchronization2::Device {
        ash::khr::synchronization2::Device::new(&self.handle, device)
    }

    /// Debug-utils device functions, only when validation is active.
    pub fn create_debug_utils_device_loader(
        &self,
        device: &ash::Device,
    ) -> Option<ash::ext::debug_utils::Device> {
        self.debug_messenger
            .is_some()
            .then(|| ash::ext::debug_utils::Device::new(&self.handle, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_components() {
        let version = ApiVersion::from_raw(vk::make_api_version(0, 1, 3, 275));
        assert_eq!(version.variant(), 0);
        assert_eq!(version.major(), 1);
        assert_eq!(version.minor(), 3);
        assert_eq!(version.patch(), 275);
        assert_eq!(version.to_string(), "1.3.275");
        assert_eq!(ApiVersion::new(0, 1, 3, 275), version);
    }

    #[test]
    fn api_version_at_least() {
        let version = ApiVersion::new(0, 1, 2, 0);
        assert!(version.at_least(1, 0));
        assert!(version.at_least(1, 2));
        assert!(!version.at_least(1, 3));
    }

    #[test]
    fn severity_mask_includes_more_severe_levels() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        assert_eq!(ValidationLevel::Error.severity_mask(), S::ERROR);
        assert_eq!(
            ValidationLevel::Warning.severity_mask(),
            S::WARNING | S::ERROR
        );
        assert!(ValidationLevel::Verbose.severity_mask().contains(S::VERBOSE));
        assert!(!ValidationLevel::Info.severity_mask().contains(S::VERBOSE));
    }

    #[test]
    fn missing_extensions_reports_only_absent_names() {
        let required = [c"VK_KHR_surface", c"VK_KHR_xcb_surface"];
        let available = [c"VK_KHR_surface", c"VK_EXT_debug_utils"];
        assert_eq!(
            missing_extensions(&required, &available),
            vec!["VK_KHR_xcb_surface".to_owned()]
        );
        assert!(missing_extensions(&required[..1], &available).is_empty());
    }
}
