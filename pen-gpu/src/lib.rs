//! RAII wrappers around the Vulkan objects the pen renderer needs, built
//! on [`ash`].
//!
//! # Object hierarchy
//!
//! ```text
//! Instance
//! ├── Surface<T>
//! │   └── Swapchain<T>
//! └── Device
//!     ├── HostVisibleBuffer / DeviceLocalBuffer
//!     ├── DeviceLocalImage → ImageView
//!     ├── Sampler
//!     ├── DescriptorSetLayout → DescriptorPool → DescriptorSet
//!     ├── RenderPass → Framebuffer
//!     ├── PipelineLayout → GraphicsPipeline / ComputePipeline
//!     ├── ShaderModule → EntryPoint
//!     ├── CommandPool → CommandBuffer
//!     └── Fence / Semaphore
//! ```
//!
//! Every wrapper keeps its parent alive through an `Arc`, so destruction
//! order follows the hierarchy no matter the order in which the owners are
//! dropped.
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `ash_*` | returns the `ash` wrapper object          |
//! | `cmd_*` | records into a raw command buffer         |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod instance;
pub mod pipeline;
pub mod render_pass;
pub mod sampler;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use ash;
pub use raw_window_handle::HandleError as RwhHandleError;
