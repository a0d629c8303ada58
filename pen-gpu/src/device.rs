//! Logical device wrapper ([`Device`]).
//!
//! `Device` owns the `VkDevice` together with everything that is per
//! device: the `gpu-allocator` allocator, the swapchain, synchronization2
//! and debug-utils loaders, and the graphics and present queues.
//!
//! Physical device and queue family selection is deliberately simple and
//! deterministic. By default the first physical device that can drive the
//! surface is used, the graphics family is the first family advertising
//! graphics, and the present family is the first family that can present
//! to the surface. [`PhysicalDeviceSelection`] overrides the device policy.
//!
//! Raw Vulkan calls are exposed as `unsafe fn` methods (`create_raw_*`,
//! `destroy_raw_*`, `cmd_*`); the sibling wrapper modules go through these
//! rather than touching `ash::Device` directly.

use std::ffi::{CStr, CString};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use gpu_allocator::{
    AllocationError, MemoryLocation,
    vulkan::{
        Allocation, AllocationCreateDesc, AllocationScheme, Allocator,
        AllocatorCreateDesc,
    },
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::{
    instance::{
        ApiVersion, FetchPhysicalDeviceError, Instance, VALIDATION_LAYER_NAME,
    },
    surface::{Surface, SurfaceSupportError},
    swapchain::CreateSwapchainError,
};

enum Synchronization2Loader {
    /// Vulkan 1.3+: core entry points on `ash::Device`.
    Core,
    /// Older devices: `VK_KHR_synchronization2`.
    Extension(ash::khr::synchronization2::Device),
}

/// How an allocation is accessed, used to pick a memory type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryUsage {
    /// GPU-only storage, not mappable.
    GpuOnly,
    /// Written by the CPU, read by the GPU (staging, dynamic buffers).
    CpuToGpu,
    /// Written by the GPU, read back by the CPU.
    GpuToCpu,
}

/// Policy for choosing among the physical devices that can drive the
/// surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhysicalDeviceSelection {
    /// First suitable device in enumeration order.
    #[default]
    First,
    /// The device at this enumeration index; fails if it is unsuitable.
    Index(usize),
    /// Discrete over integrated over virtual, ties broken by enumeration
    /// order.
    PreferDiscrete,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceConfig {
    pub selection: PhysicalDeviceSelection,
}

/// The queue families the renderer submits and presents on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Distinct family indices, graphics first. One queue is created per
    /// entry.
    pub fn unique(&self) -> Vec<u32> {
        if self.graphics == self.present {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

/// First graphics-capable family and first present-capable family.
///
/// `can_present` is queried per family index; errors while querying are
/// expected to be folded into `false` by the caller.
pub fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
    mut can_present: impl FnMut(u32) -> bool,
) -> Option<QueueFamilies> {
    let graphics = families
        .iter()
        .position(|f| {
            f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .map(|i| i as u32)?;
    let present = (0..families.len() as u32)
        .filter(|&i| families[i as usize].queue_count > 0)
        .find(|&i| can_present(i))?;
    Some(QueueFamilies { graphics, present })
}

fn device_type_rank(ty: vk::PhysicalDeviceType) -> u32 {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    }
}

/// Choose among suitable candidates, given as `(enumeration index, type)`
/// pairs in enumeration order. Returns the position in `candidates`.
fn choose_candidate(
    candidates: &[(usize, vk::PhysicalDeviceType)],
    selection: PhysicalDeviceSelection,
) -> Option<usize> {
    match selection {
        PhysicalDeviceSelection::First => (!candidates.is_empty()).then_some(0),
        PhysicalDeviceSelection::Index(wanted) => {
            candidates.iter().position(|(index, _)| *index == wanted)
        }
        PhysicalDeviceSelection::PreferDiscrete => candidates
            .iter()
            .enumerate()
            .max_by(|(ia, (_, a)), (ib, (_, b))| {
                device_type_rank(*a)
                    .cmp(&device_type_rank(*b))
                    .then(ib.cmp(ia))
            })
            .map(|(i, _)| i),
    }
}

/// A logical Vulkan device and its per-device state.
///
/// When the graphics and present families coincide both roles share one
/// `Arc<Mutex<vk::Queue>>`, so locking either serialises on the same queue.
pub struct Device {
    parent: Arc<Instance>,
    allocator: Option<Mutex<Allocator>>,
    handle: ash::Device,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    swapchain_device: ash::khr::swapchain::Device,
    debug_utils_device: Option<ash::ext::debug_utils::Device>,
    synchronization2: Synchronization2Loader,
    queue_families: QueueFamilies,
    graphics_queue: Arc<Mutex<vk::Queue>>,
    present_queue: Arc<Mutex<vk::Queue>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .field("queue_families", &self.queue_families)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        // The allocator frees its device memory blocks, so it must go first.
        self.allocator = None;
        // SAFETY: every object created from this device holds an Arc to it and
        // has therefore already been destroyed.
        unsafe { self.handle.destroy_device(None) };
    }
}

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error("The surface was created from a different instance")]
    MismatchedParams,

    #[error("Failed to enumerate physical devices: {0}")]
    FetchPhysicalDevices(#[from] FetchPhysicalDeviceError),

    #[error("No physical device supports the swapchain, synchronization2 and the required queue families")]
    NoSuitableDevice,

    #[error("Physical device {0} does not exist or cannot drive the surface")]
    DeviceUnavailable(usize),

    #[error("Error checking surface support: {0}")]
    SurfaceSupport(#[from] SurfaceSupportError),

    #[error("Failed to create logical device: {0}")]
    DeviceCreation(vk::Result),

    #[error("Failed to create GPU allocator: {0}")]
    AllocatorCreation(AllocationError),
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Object name contains an interior NUL byte: {0}")]
    InvalidName(std::ffi::NulError),

    #[error("Vulkan error setting object name: {0}")]
    Vulkan(vk::Result),
}

struct Candidate {
    index: usize,
    handle: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    queue_families: QueueFamilies,
    use_sync2_ext: bool,
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> String {
    properties
        .device_name_as_c_str()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned())
}

impl Device {
    /// Select a physical device able to present to `surface` and create a
    /// logical device on it with one queue per distinct selected family.
    pub fn new<T: HasDisplayHandle + HasWindowHandle>(
        instance: &Arc<Instance>,
        surface: &Surface<T>,
        config: &DeviceConfig,
    ) -> Result<Self, CreateDeviceError> {
        if !Arc::ptr_eq(surface.parent(), instance) {
            return Err(CreateDeviceError::MismatchedParams);
        }

        let physical_devices = instance.fetch_raw_physical_devices()?;
        let mut candidates: Vec<Candidate> = Vec::new();

        for (index, &dev) in physical_devices.iter().enumerate() {
            // SAFETY: dev was enumerated from instance.
            let properties =
                unsafe { instance.get_raw_physical_device_properties(dev) };
            let name = device_name(&properties);

            // SAFETY: dev was enumerated from instance.
            let extensions = match unsafe {
                instance.enumerate_raw_device_extension_properties(dev)
            } {
                Ok(exts) => exts,
                Err(e) => {
                    tracing::debug!("Skipping {name}: cannot enumerate extensions: {e}");
                    continue;
                }
            };
            let has_ext = |wanted: &CStr| {
                extensions
                    .iter()
                    .any(|e| e.extension_name_as_c_str() == Ok(wanted))
            };

            if !has_ext(ash::khr::swapchain::NAME) {
                tracing::debug!("Skipping {name}: missing VK_KHR_swapchain");
                continue;
            }

            let use_sync2_ext = !(ApiVersion::from_raw(properties.api_version)
                .at_least(1, 3)
                && instance.version().at_least(1, 3));
            if use_sync2_ext && !has_ext(ash::khr::synchronization2::NAME) {
                tracing::debug!("Skipping {name}: missing VK_KHR_synchronization2");
                continue;
            }

            // SAFETY: dev was enumerated from instance.
            let families = unsafe {
                instance.get_raw_physical_device_queue_family_properties(dev)
            };
            let selected = select_queue_families(&families, |family| {
                // SAFETY: dev and surface share the instance checked above.
                match unsafe { surface.supports_queue_family(dev, family) } {
                    Ok(supported) => supported,
                    Err(e) => {
                        tracing::warn!(
                            "Present support query failed for {name} family {family}: {e}"
                        );
                        false
                    }
                }
            });
            let Some(queue_families) = selected else {
                tracing::debug!("Skipping {name}: no graphics or present queue family");
                continue;
            };

            candidates.push(Candidate {
                index,
                handle: dev,
                properties,
                queue_families,
                use_sync2_ext,
            });
        }

        let ranked: Vec<(usize, vk::PhysicalDeviceType)> = candidates
            .iter()
            .map(|c| (c.index, c.properties.device_type))
            .collect();
        let chosen = choose_candidate(&ranked, config.selection).ok_or(
            match config.selection {
                PhysicalDeviceSelection::Index(i) => {
                    CreateDeviceError::DeviceUnavailable(i)
                }
                _ => CreateDeviceError::NoSuitableDevice,
            },
        )?;
        let best = &candidates[chosen];
        let queue_families = best.queue_families;
        let physical_device = best.handle;

        tracing::info!(
            "Selected physical device {} ({:?}), graphics family {}, present family {}",
            device_name(&best.properties),
            best.properties.device_type,
            queue_families.graphics,
            queue_families.present,
        );

        let priorities = [1.0_f32];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let mut ext_ptrs = vec![ash::khr::swapchain::NAME.as_ptr()];
        if best.use_sync2_ext {
            ext_ptrs.push(ash::khr::synchronization2::NAME.as_ptr());
        }
        // Device layers are ignored by current loaders but older ones still
        // honour them.
        let layer_ptrs = if instance.validation_enabled() {
            vec![VALIDATION_LAYER_NAME.as_ptr()]
        } else {
            Vec::new()
        };

        let mut sync2_features =
            vk::PhysicalDeviceSynchronization2Features::default()
                .synchronization2(true);
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&ext_ptrs)
            .enabled_layer_names(&layer_ptrs)
            .push_next(&mut sync2_features);

        // SAFETY: physical_device was enumerated from instance and the create
        // info only points at locals that outlive the call.
        let handle = unsafe {
            instance.create_ash_device(physical_device, &device_create_info)
        }
        .map_err(CreateDeviceError::DeviceCreation)?;

        // SAFETY: both families were requested with one queue at index 0.
        let graphics_raw =
            unsafe { handle.get_device_queue(queue_families.graphics, 0) };
        let graphics_queue = Arc::new(Mutex::new(graphics_raw));
        let present_queue = if queue_families.is_shared() {
            Arc::clone(&graphics_queue)
        } else {
            // SAFETY: as above.
            let raw = unsafe { handle.get_device_queue(queue_families.present, 0) };
            Arc::new(Mutex::new(raw))
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.ash_instance().clone(),
            device: handle.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                // SAFETY: nothing has been created from the device yet.
                unsafe { handle.destroy_device(None) };
                return Err(CreateDeviceError::AllocatorCreation(e));
            }
        };

        // SAFETY: physical_device was enumerated from instance.
        let memory_properties = unsafe {
            instance.get_raw_physical_device_memory_properties(physical_device)
        };

        Ok(Self {
            parent: Arc::clone(instance),
            allocator: Some(Mutex::new(allocator)),
            swapchain_device: instance.create_swapchain_loader(&handle),
            debug_utils_device: instance.create_debug_utils_device_loader(&handle),
            synchronization2: if best.use_sync2_ext {
                Synchronization2Loader::Extension(
                    instance.create_synchronization2_loader(&handle),
                )
            } else {
                Synchronization2Loader::Core
            },
            handle,
            physical_device,
            properties: best.properties,
            memory_properties,
            queue_families,
            graphics_queue,
            present_queue,
        })
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn device_name(&self) -> String {
        device_name(&self.properties)
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size
    }

    pub fn queue_families(&self) -> QueueFamilies {
        self.queue_families
    }

    pub fn has_debug_utils(&self) -> bool {
        self.debug_utils_device.is_some()
    }

    pub fn raw_device(&self) -> vk::Device {
        self.handle.handle()
    }

    /// Format features for optimal tiling, used to validate render target
    /// and depth formats.
    pub fn optimal_format_features(
        &self,
        format: vk::Format,
    ) -> vk::FormatFeatureFlags {
        // SAFETY: the physical device belongs to the parent instance.
        unsafe {
            self.parent.get_raw_physical_device_format_properties(
                self.physical_device,
                format,
            )
        }
        .optimal_tiling_features
    }

    /// Block until every queue on the device is idle.
    ///
    /// Meant for coarse transitions (shutdown, resize, read-back), not the
    /// per-frame path.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // SAFETY: the device is live; vkDeviceWaitIdle requires the queues to
        // be externally synchronised, which the queue mutexes provide.
        let _graphics = lock(&self.graphics_queue);
        let _present = (!self.queue_families.is_shared())
            .then(|| lock(&self.present_queue));
        // SAFETY: see above.
        unsafe { self.handle.device_wait_idle() }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// Memory functionality
impl Device {
    /// Score a memory type for a usage; `None` when unusable.
    fn score_memory_type(
        flags: vk::MemoryPropertyFlags,
        usage: MemoryUsage,
    ) -> Option<u32> {
        use vk::MemoryPropertyFlags as F;
        let device_local = flags.contains(F::DEVICE_LOCAL);
        let host_visible = flags.contains(F::HOST_VISIBLE);
        let host_cached = flags.contains(F::HOST_CACHED);
        match usage {
            MemoryUsage::GpuOnly => {
                device_local.then_some(if host_visible { 1 } else { 2 })
            }
            MemoryUsage::CpuToGpu => {
                host_visible.then_some(if device_local { 2 } else { 1 })
            }
            MemoryUsage::GpuToCpu => {
                host_visible.then_some(if host_cached { 2 } else { 1 })
            }
        }
    }

    /// Highest-scoring allowed memory type, lowest index on ties.
    fn select_memory_type(
        &self,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
    ) -> Option<u32> {
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
            .filter(|(i, _)| requirements.memory_type_bits & (1 << i) != 0)
            .filter_map(|(i, ty)| {
                Self::score_memory_type(ty.property_flags, usage)
                    .map(|score| (i as u32, score))
            })
            .max_by(|(ia, sa), (ib, sb)| sa.cmp(sb).then(ib.cmp(ia)))
            .map(|(i, _)| i)
    }

    /// Allocate memory through `gpu-allocator`.
    ///
    /// Host-visible non-coherent memory has its size and alignment rounded
    /// to `nonCoherentAtomSize` so whole-allocation flushes stay legal.
    pub fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<Allocation, AllocationError> {
        let requirements = match self.select_memory_type(requirements, usage) {
            Some(index) => {
                use vk::MemoryPropertyFlags as F;
                let flags =
                    self.memory_properties.memory_types[index as usize].property_flags;
                let atom = self.non_coherent_atom_size();
                let (size, alignment) = if flags.contains(F::HOST_VISIBLE)
                    && !flags.contains(F::HOST_COHERENT)
                {
                    (
                        requirements.size.div_ceil(atom) * atom,
                        requirements.alignment.max(atom),
                    )
                } else {
                    (requirements.size, requirements.alignment)
                };
                vk::MemoryRequirements {
                    size,
                    alignment,
                    memory_type_bits: 1 << index,
                }
            }
            None => requirements,
        };
        let location = match usage {
            MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
            MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
            MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
        };
        let allocator = self.allocator.as_ref().ok_or_else(|| {
            AllocationError::Internal("allocator already dropped".to_owned())
        })?;
        lock(allocator).allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
    }

    pub fn free_memory(
        &self,
        allocation: Allocation,
    ) -> Result<(), AllocationError> {
        let allocator = self.allocator.as_ref().ok_or_else(|| {
            AllocationError::Internal("allocator already dropped".to_owned())
        })?;
        lock(allocator).free(allocation)
    }
}

// Swapchain functionality
impl Device {
    /// # Safety
    /// `create_info` must reference a surface from the parent instance and,
    /// if set, an old swapchain from this device.
    pub unsafe fn create_raw_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR, CreateSwapchainError> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.swapchain_device.create_swapchain(create_info, None) }
            .map_err(CreateSwapchainError::VulkanCreate)
    }

    /// # Safety
    /// `swapchain` must be a live swapchain of this device.
    pub unsafe fn get_raw_swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Vec<vk::Image>, CreateSwapchainError> {
        // SAFETY: caller guarantees swapchain validity.
        unsafe { self.swapchain_device.get_swapchain_images(swapchain) }
            .map_err(CreateSwapchainError::VulkanGetImages)
    }

    /// # Safety
    /// `swapchain` must come from this device, its image views must be
    /// destroyed and no GPU work may still reference it.
    pub unsafe fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.swapchain_device.destroy_swapchain(swapchain, None) };
    }

    /// Acquire the next presentable image, returning `(index, suboptimal)`.
    ///
    /// `ERROR_OUT_OF_DATE_KHR` means the swapchain must be recreated.
    ///
    /// # Safety
    /// `swapchain` must come from this device; `semaphore` and `fence`, when
    /// not null, must be unsignaled objects of this device.
    pub unsafe fn acquire_next_swapchain_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(u32, bool), vk::Result> {
        // SAFETY: caller guarantees handle validity.
        unsafe {
            self.swapchain_device
                .acquire_next_image(swapchain, timeout_ns, semaphore, fence)
        }
    }

    /// Present on the present queue. `Ok(true)` means suboptimal.
    ///
    /// # Safety
    /// Every handle in `present_info` must come from this device, the
    /// images must be in `PRESENT_SRC_KHR` and the wait semaphores must be
    /// pending a signal.
    pub unsafe fn queue_present(
        &self,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, vk::Result> {
        let queue = lock(&self.present_queue);
        // SAFETY: caller guarantees present_info validity; the queue is
        // externally synchronised by the mutex.
        unsafe { self.swapchain_device.queue_present(*queue, present_info) }
    }
}

// Image functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid for this device.
    pub unsafe fn create_raw_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_image(create_info, None) }
    }

    /// # Safety
    /// `image` must come from this device and no GPU work or view may still
    /// use it.
    pub unsafe fn destroy_raw_image(&self, image: vk::Image) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_image(image, None) };
    }

    /// # Safety
    /// `image` must come from this device.
    pub unsafe fn get_raw_image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.get_image_memory_requirements(image) }
    }

    /// # Safety
    /// `image` and `memory` must come from this device and `offset` must
    /// satisfy the image's memory requirements.
    pub unsafe fn bind_raw_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees handle validity and alignment.
        unsafe { self.handle.bind_image_memory(image, memory, offset) }
    }

    /// # Safety
    /// `create_info` must reference an image of this device.
    pub unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_image_view(create_info, None) }
    }

    /// # Safety
    /// `image_view` must come from this device and no framebuffer,
    /// descriptor or GPU work may still use it.
    pub unsafe fn destroy_raw_image_view(&self, image_view: vk::ImageView) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_image_view(image_view, None) };
    }

    /// # Safety
    /// `create_info` must be valid for this device.
    pub unsafe fn create_raw_sampler(
        &self,
        create_info: &vk::SamplerCreateInfo<'_>,
    ) -> Result<vk::Sampler, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_sampler(create_info, None) }
    }

    /// # Safety
    /// `sampler` must come from this device and no GPU work may use it.
    pub unsafe fn destroy_raw_sampler(&self, sampler: vk::Sampler) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_sampler(sampler, None) };
    }
}

// Buffer functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid for this device.
    pub unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// `buffer` must come from this device and no GPU work may use it.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// # Safety
    /// `buffer` must come from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `buffer` and `memory` must come from this device and `offset` must
    /// satisfy the buffer's memory requirements.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees handle validity and alignment.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }

    /// # Safety
    /// Each range must lie inside a mapped allocation of this device and be
    /// aligned to `nonCoherentAtomSize`.
    pub unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees range validity.
        unsafe { self.handle.flush_mapped_memory_ranges(ranges) }
    }

    /// # Safety
    /// Each range must lie inside a mapped allocation of this device and be
    /// aligned to `nonCoherentAtomSize`.
    pub unsafe fn invalidate_raw_mapped_memory_ranges(
        &self,
        ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees range validity.
        unsafe { self.handle.invalidate_mapped_memory_ranges(ranges) }
    }
}

// Debug naming and labels
impl Device {
    /// Attach a debug name to `object`. A no-op without debug utils or
    /// with `name == None`.
    ///
    /// # Safety
    /// `object` must be a live handle owned by this device.
    pub unsafe fn set_object_name<H: vk::Handle>(
        &self,
        object: H,
        name: Option<&CStr>,
    ) -> Result<(), NameObjectError> {
        let (Some(debug_utils), Some(name)) =
            (self.debug_utils_device.as_ref(), name)
        else {
            return Ok(());
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(name);
        // SAFETY: caller guarantees object validity.
        unsafe { debug_utils.set_debug_utils_object_name(&info) }
            .map_err(NameObjectError::Vulkan)
    }

    /// [`set_object_name`](Self::set_object_name) for UTF-8 names.
    ///
    /// # Safety
    /// Same contract as [`set_object_name`](Self::set_object_name).
    pub unsafe fn set_object_name_str<H: vk::Handle>(
        &self,
        object: H,
        name: Option<&str>,
    ) -> Result<(), NameObjectError> {
        if self.debug_utils_device.is_none() {
            return Ok(());
        }
        let name = name
            .map(CString::new)
            .transpose()
            .map_err(NameObjectError::InvalidName)?;
        // SAFETY: same contract as set_object_name.
        unsafe { self.set_object_name(object, name.as_deref()) }
    }

    /// Open a named debug region. A no-op without debug utils.
    ///
    /// # Safety
    /// `command_buffer` must be recording.
    pub unsafe fn cmd_begin_debug_label(
        &self,
        command_buffer: vk::CommandBuffer,
        name: &CStr,
    ) {
        if let Some(debug_utils) = self.debug_utils_device.as_ref() {
            let label = vk::DebugUtilsLabelEXT::default().label_name(name);
            // SAFETY: caller guarantees recording state.
            unsafe {
                debug_utils.cmd_begin_debug_utils_label(command_buffer, &label)
            };
        }
    }

    /// Close the innermost debug region. A no-op without debug utils.
    ///
    /// # Safety
    /// `command_buffer` must be recording with an open label region.
    pub unsafe fn cmd_end_debug_label(&self, command_buffer: vk::CommandBuffer) {
        if let Some(debug_utils) = self.debug_utils_device.as_ref() {
            // SAFETY: caller guarantees an open region.
            unsafe { debug_utils.cmd_end_debug_utils_label(command_buffer) };
        }
    }
}

// Shader, pipeline and render pass functionality
impl Device {
    /// # Safety
    /// `create_info` must contain valid SPIR-V.
    pub unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_shader_module(create_info, None) }
    }

    /// # Safety
    /// `module` must come from this device.
    pub unsafe fn destroy_raw_shader_module(&self, module: vk::ShaderModule) {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.destroy_shader_module(module, None) };
    }

    /// # Safety
    /// Every set layout referenced by `create_info` must come from this
    /// device.
    pub unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_pipeline_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must come from this device and no pipeline using it may be
    /// in use.
    pub unsafe fn destroy_raw_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_pipeline_layout(layout, None) };
    }

    /// Create one graphics pipeline. Partially created pipelines from a
    /// failed batch are destroyed before the error is returned.
    ///
    /// # Safety
    /// Every handle referenced by `create_info` (stages, layout, render
    /// pass) must come from this device and outlive the call.
    pub unsafe fn create_raw_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        let result = unsafe {
            self.handle.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        };
        self.single_pipeline(result)
    }

    /// Create one compute pipeline.
    ///
    /// # Safety
    /// The stage module and layout must come from this device.
    pub unsafe fn create_raw_compute_pipeline(
        &self,
        create_info: &vk::ComputePipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        let result = unsafe {
            self.handle.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        };
        self.single_pipeline(result)
    }

    fn single_pipeline(
        &self,
        result: Result<Vec<vk::Pipeline>, (Vec<vk::Pipeline>, vk::Result)>,
    ) -> Result<vk::Pipeline, vk::Result> {
        match result {
            Ok(mut pipelines) => pipelines
                .pop()
                .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED),
            Err((partial, err)) => {
                for pipeline in partial.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                    // SAFETY: pipeline was just created by this device and
                    // never handed out.
                    unsafe { self.handle.destroy_pipeline(pipeline, None) };
                }
                Err(err)
            }
        }
    }

    /// # Safety
    /// `pipeline` must come from this device and no GPU work may use it.
    pub unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }

    /// # Safety
    /// `create_info` and its attachment/subpass arrays must be valid.
    pub unsafe fn create_raw_render_pass(
        &self,
        create_info: &vk::RenderPassCreateInfo<'_>,
    ) -> Result<vk::RenderPass, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_render_pass(create_info, None) }
    }

    /// # Safety
    /// `render_pass` must come from this device; no framebuffer, pipeline
    /// creation or GPU work may still use it.
    pub unsafe fn destroy_raw_render_pass(&self, render_pass: vk::RenderPass) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_render_pass(render_pass, None) };
    }

    /// # Safety
    /// The render pass and image views in `create_info` must come from this
    /// device and be compatible.
    pub unsafe fn create_raw_framebuffer(
        &self,
        create_info: &vk::FramebufferCreateInfo<'_>,
    ) -> Result<vk::Framebuffer, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_framebuffer(create_info, None) }
    }

    /// # Safety
    /// `framebuffer` must come from this device and no GPU work may use it.
    pub unsafe fn destroy_raw_framebuffer(&self, framebuffer: vk::Framebuffer) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_framebuffer(framebuffer, None) };
    }
}

// Command pool and queue submission
impl Device {
    /// # Safety
    /// `create_info.queue_family_index` must be a family of this device.
    pub unsafe fn create_raw_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_command_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must come from this device and none of its buffers may be
    /// pending execution.
    pub unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: caller guarantees provenance and idleness.
        unsafe { self.handle.destroy_command_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info.command_pool` must come from this device and be
    /// externally synchronised.
    pub unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: caller guarantees allocate_info validity.
        unsafe { self.handle.allocate_command_buffers(allocate_info) }
    }

    /// # Safety
    /// `command_buffer` must be in the initial state, or resettable and not
    /// pending.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees command buffer state.
        unsafe { self.handle.begin_command_buffer(command_buffer, begin_info) }
    }

    /// # Safety
    /// `command_buffer` must be recording with no open render pass.
    pub unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees command buffer state.
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    /// # Safety
    /// `command_buffer` must not be pending and its pool must allow
    /// individual resets.
    pub unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees command buffer state.
        unsafe { self.handle.reset_command_buffer(command_buffer, flags) }
    }

    /// Submit to the graphics queue with the synchronization2 API.
    ///
    /// # Safety
    /// Every handle in `submits` must come from this device, command
    /// buffers must be executable and `fence`, when not null, unsignaled.
    pub unsafe fn graphics_queue_submit2(
        &self,
        submits: &[vk::SubmitInfo2<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let queue = lock(&self.graphics_queue);
        match &self.synchronization2 {
            // SAFETY: caller guarantees submit validity; the mutex provides
            // queue synchronisation.
            Synchronization2Loader::Core => unsafe {
                self.handle.queue_submit2(*queue, submits, fence)
            },
            // SAFETY: as above.
            Synchronization2Loader::Extension(loader) => unsafe {
                loader.queue_submit2(*queue, submits, fence)
            },
        }
    }
}

// Fences and semaphores
impl Device {
    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_fence(create_info, None) }
    }

    /// # Safety
    /// `fence` must come from this device and not be pending.
    pub unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: caller guarantees provenance and idleness.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// # Safety
    /// Every fence must come from this device.
    pub unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees fence validity.
        unsafe { self.handle.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    /// # Safety
    /// Every fence must come from this device and not be pending.
    pub unsafe fn reset_raw_fences(
        &self,
        fences: &[vk::Fence],
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees fence state.
        unsafe { self.handle.reset_fences(fences) }
    }

    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_semaphore(
        &self,
        create_info: &vk::SemaphoreCreateInfo<'_>,
    ) -> Result<vk::Semaphore, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_semaphore(create_info, None) }
    }

    /// # Safety
    /// `semaphore` must come from this device and no queue operation may
    /// be waiting on or about to signal it.
    pub unsafe fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: caller guarantees provenance and idleness.
        unsafe { self.handle.destroy_semaphore(semaphore, None) };
    }
}

// Descriptor functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_descriptor_set_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must come from this device.
    pub unsafe fn destroy_raw_descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
    ) {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.destroy_descriptor_set_layout(layout, None) };
    }

    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_descriptor_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must come from this device and none of its sets may be used by
    /// pending GPU work.
    pub unsafe fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: caller guarantees provenance and idleness.
        unsafe { self.handle.destroy_descriptor_pool(pool, None) };
    }

    /// # Safety
    /// `pool` must come from this device and none of its sets may be used by
    /// pending GPU work.
    pub unsafe fn reset_raw_descriptor_pool(
        &self,
        pool: vk::DescriptorPool,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees provenance and idleness.
        unsafe {
            self.handle
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
    }

    /// # Safety
    /// The pool and layouts in `allocate_info` must come from this device.
    pub unsafe fn allocate_raw_descriptor_sets(
        &self,
        allocate_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        // SAFETY: caller guarantees allocate_info validity.
        unsafe { self.handle.allocate_descriptor_sets(allocate_info) }
    }

    /// # Safety
    /// Every handle referenced by the writes must come from this device and
    /// the target sets must not be in use by pending GPU work.
    pub unsafe fn update_raw_descriptor_sets(
        &self,
        writes: &[vk::WriteDescriptorSet<'_>],
    ) {
        // SAFETY: caller guarantees write validity.
        unsafe { self.handle.update_descriptor_sets(writes, &[]) }
    }
}

// Command recording
impl Device {
    /// # Safety
    /// `command_buffer` must be recording and outside a render pass.
    pub unsafe fn cmd_pipeline_barrier2(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        match &self.synchronization2 {
            // SAFETY: caller guarantees recording state and barrier validity.
            Synchronization2Loader::Core => unsafe {
                self.handle
                    .cmd_pipeline_barrier2(command_buffer, dependency_info)
            },
            // SAFETY: as above.
            Synchronization2Loader::Extension(loader) => unsafe {
                loader.cmd_pipeline_barrier2(command_buffer, dependency_info)
            },
        }
    }

    /// # Safety
    /// `command_buffer` must be recording outside a render pass; the render
    /// pass and framebuffer in `begin_info` must be compatible and their
    /// attachments in the declared initial layouts.
    pub unsafe fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo<'_>,
    ) {
        // SAFETY: caller guarantees render pass state.
        unsafe {
            self.handle.cmd_begin_render_pass(
                command_buffer,
                begin_info,
                vk::SubpassContents::INLINE,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be inside a render pass.
    pub unsafe fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        // SAFETY: caller guarantees render pass state.
        unsafe { self.handle.cmd_end_render_pass(command_buffer) }
    }

    /// # Safety
    /// `command_buffer` must be recording; `pipeline` must match
    /// `bind_point`.
    pub unsafe fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: caller guarantees recording state and pipeline validity.
        unsafe {
            self.handle
                .cmd_bind_pipeline(command_buffer, bind_point, pipeline)
        }
    }

    /// # Safety
    /// `command_buffer` must be recording; `buffers` and `offsets` must have
    /// equal length and the buffers must carry `VERTEX_BUFFER` usage.
    pub unsafe fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        // SAFETY: caller guarantees recording state and buffer validity.
        unsafe {
            self.handle.cmd_bind_vertex_buffers(
                command_buffer,
                first_binding,
                buffers,
                offsets,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording; `buffer` must carry
    /// `INDEX_BUFFER` usage.
    pub unsafe fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        // SAFETY: caller guarantees recording state and buffer validity.
        unsafe {
            self.handle
                .cmd_bind_index_buffer(command_buffer, buffer, offset, index_type)
        }
    }

    /// # Safety
    /// `command_buffer` must be recording; `layout` must be compatible with
    /// the sets and the pipeline bound at `bind_point`.
    pub unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
    ) {
        // SAFETY: caller guarantees layout compatibility and set validity.
        unsafe {
            self.handle.cmd_bind_descriptor_sets(
                command_buffer,
                bind_point,
                layout,
                first_set,
                descriptor_sets,
                &[],
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording with a pipeline declaring dynamic
    /// viewport state.
    pub unsafe fn cmd_set_viewport(
        &self,
        command_buffer: vk::CommandBuffer,
        viewports: &[vk::Viewport],
    ) {
        // SAFETY: caller guarantees recording state.
        unsafe { self.handle.cmd_set_viewport(command_buffer, 0, viewports) }
    }

    /// # Safety
    /// `command_buffer` must be recording with a pipeline declaring dynamic
    /// scissor state.
    pub unsafe fn cmd_set_scissor(
        &self,
        command_buffer: vk::CommandBuffer,
        scissors: &[vk::Rect2D],
    ) {
        // SAFETY: caller guarantees recording state.
        unsafe { self.handle.cmd_set_scissor(command_buffer, 0, scissors) }
    }

    /// # Safety
    /// `command_buffer` must be recording with a pipeline declaring dynamic
    /// stencil reference state.
    pub unsafe fn cmd_set_stencil_reference(
        &self,
        command_buffer: vk::CommandBuffer,
        reference: u32,
    ) {
        // SAFETY: caller guarantees recording state.
        unsafe {
            self.handle.cmd_set_stencil_reference(
                command_buffer,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                reference,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be inside a render pass with a compatible
    /// graphics pipeline and all dynamic state set.
    pub unsafe fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        // SAFETY: caller guarantees draw state.
        unsafe {
            self.handle.cmd_draw(
                command_buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        }
    }

    /// # Safety
    /// As [`cmd_draw`](Self::cmd_draw), plus a bound index buffer.
    pub unsafe fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        // SAFETY: caller guarantees draw state.
        unsafe {
            self.handle.cmd_draw_indexed(
                command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording outside a render pass with a
    /// compute pipeline bound.
    pub unsafe fn cmd_dispatch(
        &self,
        command_buffer: vk::CommandBuffer,
        groups: [u32; 3],
    ) {
        // SAFETY: caller guarantees dispatch state.
        unsafe {
            self.handle
                .cmd_dispatch(command_buffer, groups[0], groups[1], groups[2])
        }
    }

    /// # Safety
    /// `command_buffer` must be recording outside a render pass and the
    /// regions must be in bounds.
    pub unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: caller guarantees recording state and region validity.
        unsafe { self.handle.cmd_copy_buffer(command_buffer, src, dst, regions) }
    }

    /// # Safety
    /// `command_buffer` must be recording outside a render pass; `dst` must
    /// be in `TRANSFER_DST_OPTIMAL` and the regions in bounds.
    pub unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: caller guarantees recording state and layouts.
        unsafe {
            self.handle.cmd_copy_buffer_to_image(
                command_buffer,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording outside a render pass; `src` must
    /// be in `TRANSFER_SRC_OPTIMAL` and the regions in bounds.
    pub unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: caller guarantees recording state and layouts.
        unsafe {
            self.handle.cmd_copy_image_to_buffer(
                command_buffer,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                regions,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording outside a render pass; `image`
    /// must be in `layout` (`GENERAL` or `TRANSFER_DST_OPTIMAL`) with
    /// `TRANSFER_DST` usage.
    pub unsafe fn cmd_clear_color_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        // SAFETY: caller guarantees recording state and layout.
        unsafe {
            self.handle
                .cmd_clear_color_image(command_buffer, image, layout, color, ranges)
        }
    }

    /// # Safety
    /// `command_buffer` must be recording outside a render pass; `src` must
    /// be multisampled in `TRANSFER_SRC_OPTIMAL`, `dst` single-sampled in
    /// `TRANSFER_DST_OPTIMAL`.
    pub unsafe fn cmd_resolve_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        regions: &[vk::ImageResolve],
    ) {
        // SAFETY: caller guarantees recording state and layouts.
        unsafe {
            self.handle.cmd_resolve_image(
                command_buffer,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn queue_families_pick_first_matches() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];
        let selected =
            select_queue_families(&families, |i| i >= 1).expect("families");
        assert_eq!(selected, QueueFamilies { graphics: 1, present: 1 });
        assert!(selected.is_shared());
        assert_eq!(selected.unique(), vec![1]);
    }

    #[test]
    fn queue_families_may_differ() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
        ];
        let selected =
            select_queue_families(&families, |i| i == 1).expect("families");
        assert_eq!(selected, QueueFamilies { graphics: 0, present: 1 });
        assert_eq!(selected.unique(), vec![0, 1]);
    }

    #[test]
    fn queue_families_missing_is_none() {
        let families = [family(vk::QueueFlags::TRANSFER)];
        assert!(select_queue_families(&families, |_| true).is_none());

        let families = [family(vk::QueueFlags::GRAPHICS)];
        assert!(select_queue_families(&families, |_| false).is_none());
    }

    #[test]
    fn queue_families_skip_empty_families() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS)];
        let selected =
            select_queue_families(&families, |_| true).expect("families");
        assert_eq!(selected.graphics, 1);
        assert_eq!(selected.present, 1);
    }

    #[test]
    fn candidate_selection_policies() {
        use vk::PhysicalDeviceType as T;
        let candidates = [
            (0, T::INTEGRATED_GPU),
            (2, T::DISCRETE_GPU),
            (3, T::DISCRETE_GPU),
        ];
        assert_eq!(
            choose_candidate(&candidates, PhysicalDeviceSelection::First),
            Some(0)
        );
        assert_eq!(
            choose_candidate(&candidates, PhysicalDeviceSelection::PreferDiscrete),
            Some(1)
        );
        assert_eq!(
            choose_candidate(&candidates, PhysicalDeviceSelection::Index(3)),
            Some(2)
        );
        assert_eq!(
            choose_candidate(&candidates, PhysicalDeviceSelection::Index(1)),
            None
        );
        assert_eq!(choose_candidate(&[], PhysicalDeviceSelection::First), None);
    }

    #[test]
    fn memory_scoring_prefers_expected_types() {
        use vk::MemoryPropertyFlags as F;
        assert_eq!(
            Device::score_memory_type(F::DEVICE_LOCAL, MemoryUsage::GpuOnly),
            Some(2)
        );
        assert_eq!(
            Device::score_memory_type(F::HOST_VISIBLE, MemoryUsage::GpuOnly),
            None
        );
        assert_eq!(
            Device::score_memory_type(
                F::HOST_VISIBLE | F::HOST_CACHED,
                MemoryUsage::GpuToCpu
            ),
            Some(2)
        );
        assert_eq!(
            Device::score_memory_type(
                F::HOST_VISIBLE | F::DEVICE_LOCAL,
                MemoryUsage::CpuToGpu
            ),
            Some(2)
        );
    }
}
