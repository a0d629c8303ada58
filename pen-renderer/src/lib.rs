//! A handle-based rendering core over Vulkan.
//!
//! Callers create resources into numbered slots of a fixed-capacity pool,
//! bind them into a pending pipeline state, and issue draws and dispatches.
//! The [`Renderer`] resolves the pending state into render passes,
//! pipelines and descriptor sets lazily, at the moment a command needs
//! them, and presents once per frame.
//!
//! ```text
//! Renderer<W>
//! ├── DeviceContext<W>   instance, device, swapchain, frames in flight
//! ├── ResourcePool       slot → resource
//! ├── PendingState       what the next draw will use
//! ├── PipelineCache      render passes and pipelines by content
//! └── DeferredQueue      objects waiting for the GPU to finish with them
//! ```
//!
//! Frames move through [`FrameState::Idle`], [`FrameState::Recording`] and
//! [`FrameState::Ended`]; the first command of a frame begins it and
//! [`Renderer::present`] ends it.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod config;
mod context;
mod desc;
mod error;
mod info;
mod pipeline_cache;
mod pool;
mod renderer;
mod resource;
mod state;

pub use config::RendererConfig;
pub use desc::{
    AddressMode, BindFlags, BlendDesc, BlendFactor, BlendOp, BufferDesc, ClearFlags, ClearState,
    ComparisonFunc, CpuAccess, CullMode, DepthStencilDesc, FillMode, Filter, IndexFormat,
    InputBinding, InputElement, InputLayoutDesc, PrimitiveTopology, RasterizerDesc, Rect,
    RenderTargetBlend, RenderTargetDesc, RenderTargetSize, SamplerDesc, ShaderLinkParams,
    ShaderLoadParams, StencilFaceDesc, StencilOp, TextureDesc, TextureFormat, TextureKind,
    VertexFormat, Viewport,
};
pub use error::RendererError;
pub use info::RendererInfo;
pub use pool::{DEFAULT_POOL_CAPACITY, PoolError, ResourceHandle};
pub use renderer::Renderer;
pub use resource::ResourceKind;
pub use state::{FrameState, MAX_BINDING_SLOTS, MAX_VERTEX_BUFFERS};

pub use pen_gpu::ash::vk;
pub use pen_gpu::device::PhysicalDeviceSelection;
pub use pen_gpu::instance::{ApiVersion, ValidationLevel};
pub use pen_gpu::shader::ShaderStage;
pub use pen_gpu::swapchain::SwapchainConfig;
