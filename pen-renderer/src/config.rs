use pen_gpu::device::PhysicalDeviceSelection;
use pen_gpu::instance::ValidationLevel;
use pen_gpu::swapchain::SwapchainConfig;

use crate::pool::DEFAULT_POOL_CAPACITY;

/// Options for [`Renderer::initialise`](crate::Renderer::initialise).
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub app_name: String,
    /// Validation layer severity to forward to `tracing`; `None` disables
    /// the layer. Defaults to `Warning` in debug builds.
    pub validation: Option<ValidationLevel>,
    pub physical_device: PhysicalDeviceSelection,
    /// Requested swapchain parameters. The image count also sets the number
    /// of frames in flight.
    pub swapchain: SwapchainConfig,
    pub pool_capacity: usize,
    pub acquire_timeout_ns: u64,
    /// Name GPU objects through debug utils when available.
    pub debug_names: bool,
    /// Descriptor sets per frame pool before another pool is chained.
    pub descriptor_sets_per_pool: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            app_name: "pen".to_owned(),
            validation: cfg!(debug_assertions).then_some(ValidationLevel::Warning),
            physical_device: PhysicalDeviceSelection::default(),
            swapchain: SwapchainConfig::default(),
            pool_capacity: DEFAULT_POOL_CAPACITY,
            acquire_timeout_ns: u64::MAX,
            debug_names: cfg!(debug_assertions),
            descriptor_sets_per_pool: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pen_gpu::ash::vk;

    #[test]
    fn defaults() {
        let config = RendererConfig::default();
        assert_eq!(config.pool_capacity, 4096);
        assert_eq!(config.acquire_timeout_ns, u64::MAX);
        assert_eq!(config.physical_device, PhysicalDeviceSelection::First);
        assert_eq!(config.swapchain.min_image_count, 3);
        assert_eq!(config.swapchain.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(config.swapchain.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(config.validation.is_some(), cfg!(debug_assertions));
    }
}
