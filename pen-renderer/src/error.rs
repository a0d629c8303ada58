use pen_gpu::ash::vk;
use pen_gpu::buffer::{CreateBufferError, MappedAccessError, UploadBufferError};
use pen_gpu::command::{
    AllocateCommandBufferError, CreateCommandPoolError, RecordCommandBufferError,
};
use pen_gpu::device::CreateDeviceError;
use pen_gpu::image::{CreateImageError, CreateImageViewError};
use pen_gpu::instance::CreateInstanceError;
use pen_gpu::pipeline::CreatePipelineError;
use pen_gpu::render_pass::{CreateFramebufferError, CreateRenderPassError};
use pen_gpu::shader::{CreateShaderModuleError, ShaderStage};
use pen_gpu::surface::CreateSurfaceError;
use pen_gpu::swapchain::CreateSwapchainError;
use pen_gpu::sync::{CreateFenceError, CreateSemaphoreError, MarkSubmittedError, WaitFenceError};
use thiserror::Error;

use crate::pool::{PoolError, ResourceHandle};
use crate::resource::ResourceKind;
use crate::state::FrameState;

#[derive(Debug, Error)]
pub enum RendererError {
    // -- contract violations -------------------------------------------------
    #[error("Resource pool: {0}")]
    Pool(#[from] PoolError),

    #[error("Resource {handle} is a {actual}, expected a {expected}")]
    KindMismatch {
        handle: ResourceHandle,
        expected: ResourceKind,
        actual: ResourceKind,
    },

    #[error("No physical device exposes graphics and present queue families with swapchain support")]
    MissingQueueFamily,

    #[error("Cannot {operation} while the frame is {state:?}")]
    InvalidFrameState {
        operation: &'static str,
        state: FrameState,
    },

    #[error("{0} colour targets bound, at most {max} are supported", max = pen_gpu::render_pass::MAX_COLOR_ATTACHMENTS)]
    TooManyTargets(usize),

    #[error("Bound targets are incompatible: {0}")]
    TargetMismatch(String),

    #[error("No {0:?} shader is bound")]
    MissingShader(ShaderStage),

    #[error("Shader {handle} is a {actual:?} shader, expected {expected:?}")]
    WrongShaderStage {
        handle: ResourceHandle,
        expected: ShaderStage,
        actual: ShaderStage,
    },

    #[error("Buffer {0} was not created with CPU write access")]
    NotCpuWritable(ResourceHandle),

    #[error("Write of {len} bytes at offset {offset} exceeds buffer {handle} of {size} bytes")]
    BufferOverflow {
        handle: ResourceHandle,
        offset: u64,
        len: u64,
        size: u64,
    },

    #[error("Data length mismatch: expected {expected} bytes, got {actual}")]
    DataLength { expected: u64, actual: u64 },

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Slot {slot} is out of range, at most {max} slots are supported")]
    BindingSlot { slot: u32, max: u32 },

    #[error("Not supported by the Vulkan backend: {0}")]
    Unsupported(&'static str),

    #[error("Name contains an interior NUL byte")]
    InvalidName(#[from] std::ffi::NulError),

    // -- GPU failures --------------------------------------------------------
    #[error("Failed to create instance: {0}")]
    CreateInstance(#[from] CreateInstanceError),

    #[error("Failed to create surface: {0}")]
    CreateSurface(#[from] CreateSurfaceError),

    #[error("Failed to create device: {0}")]
    CreateDevice(CreateDeviceError),

    #[error("Failed to create swapchain: {0}")]
    CreateSwapchain(#[from] CreateSwapchainError),

    #[error("Failed to create command pool: {0}")]
    CreateCommandPool(#[from] CreateCommandPoolError),

    #[error("Failed to allocate command buffers: {0}")]
    AllocateCommandBuffer(#[from] AllocateCommandBufferError),

    #[error("Command buffer recording failed: {0}")]
    RecordCommandBuffer(#[from] RecordCommandBufferError),

    #[error("Failed to create fence: {0}")]
    CreateFence(#[from] CreateFenceError),

    #[error("Fence wait failed: {0}")]
    WaitFence(#[from] WaitFenceError),

    #[error("Fence bookkeeping failed: {0}")]
    MarkSubmitted(#[from] MarkSubmittedError),

    #[error("Failed to create semaphore: {0}")]
    CreateSemaphore(#[from] CreateSemaphoreError),

    #[error("Failed to create buffer: {0}")]
    CreateBuffer(#[from] CreateBufferError),

    #[error("Mapped memory access failed: {0}")]
    MappedAccess(#[from] MappedAccessError),

    #[error("Buffer upload failed: {0}")]
    UploadBuffer(#[from] UploadBufferError),

    #[error("Failed to create image: {0}")]
    CreateImage(#[from] CreateImageError),

    #[error("Failed to create image view: {0}")]
    CreateImageView(#[from] CreateImageViewError),

    #[error("Failed to create shader module: {0}")]
    CreateShaderModule(#[from] CreateShaderModuleError),

    #[error("Failed to create pipeline: {0}")]
    CreatePipeline(#[from] CreatePipelineError),

    #[error("Failed to create render pass: {0}")]
    CreateRenderPass(#[from] CreateRenderPassError),

    #[error("Failed to create framebuffer: {0}")]
    CreateFramebuffer(#[from] CreateFramebufferError),

    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}

impl From<CreateDeviceError> for RendererError {
    fn from(value: CreateDeviceError) -> Self {
        match value {
            CreateDeviceError::NoSuitableDevice => RendererError::MissingQueueFamily,
            other => RendererError::CreateDevice(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_suitable_device_maps_to_missing_queue_family() {
        let err: RendererError = CreateDeviceError::NoSuitableDevice.into();
        assert!(matches!(err, RendererError::MissingQueueFamily));
        let err: RendererError = CreateDeviceError::DeviceUnavailable(3).into();
        assert!(matches!(
            err,
            RendererError::CreateDevice(CreateDeviceError::DeviceUnavailable(3))
        ));
    }

    #[test]
    fn pool_errors_convert() {
        let err: RendererError = PoolError::Vacant(ResourceHandle(9)).into();
        assert_eq!(err.to_string(), "Resource pool: Slot #9 is empty");
    }
}
