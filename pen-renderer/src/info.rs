use std::fmt;

use pen_gpu::ash::vk;
use pen_gpu::instance::ApiVersion;

use crate::desc::TextureFormat;

/// A snapshot of the device and swapchain the renderer runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererInfo {
    pub device_name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: ApiVersion,
    pub swapchain_format: vk::Format,
    pub swapchain_extent: (u32, u32),
    pub present_mode: vk::PresentModeKHR,
    pub image_count: usize,
    pub frames_in_flight: usize,
    /// Preferred depth format for depth targets, if any is renderable.
    pub depth_format: Option<TextureFormat>,
    pub pool_capacity: usize,
    pub live_resources: usize,
    pub cached_pipelines: usize,
    /// Render targets created with the `track` flag.
    pub tracked_targets: usize,
}

impl fmt::Display for RendererInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({:?}, vendor {:#06x}, device {:#06x})",
            self.device_name, self.device_type, self.vendor_id, self.device_id
        )?;
        writeln!(
            f,
            "Vulkan {}.{}.{}",
            self.api_version.major(),
            self.api_version.minor(),
            self.api_version.patch()
        )?;
        writeln!(
            f,
            "Swapchain {:?} {}x{}, {:?}, {} images",
            self.swapchain_format,
            self.swapchain_extent.0,
            self.swapchain_extent.1,
            self.present_mode,
            self.image_count
        )?;
        write!(
            f,
            "Resources {}/{}, {} cached pipelines",
            self.live_resources, self.pool_capacity, self.cached_pipelines
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_summarises_device_and_pool() {
        let info = RendererInfo {
            device_name: "Test GPU".to_owned(),
            vendor_id: 0x10de,
            device_id: 0x2684,
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: ApiVersion::new(0, 1, 3, 250),
            swapchain_format: vk::Format::B8G8R8A8_UNORM,
            swapchain_extent: (800, 600),
            present_mode: vk::PresentModeKHR::FIFO,
            image_count: 3,
            frames_in_flight: 3,
            depth_format: Some(TextureFormat::D32FloatS8),
            pool_capacity: 4096,
            live_resources: 2,
            cached_pipelines: 1,
            tracked_targets: 0,
        };
        let text = info.to_string();
        assert!(text.starts_with("Test GPU (DISCRETE_GPU, vendor 0x10de, device 0x2684)"));
        assert!(text.contains("Vulkan 1.3.250"));
        assert!(text.contains("800x600"));
        assert!(text.ends_with("Resources 2/4096, 1 cached pipelines"));
    }
}
