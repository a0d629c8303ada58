//! The tagged resource variant stored in the pool, and the GPU objects
//! behind each kind.

use std::fmt;
use std::sync::Arc;

use pen_gpu::ash::vk;
use pen_gpu::buffer::{DeviceLocalBuffer, HostVisibleBuffer, MappedAccessError};
use pen_gpu::device::Device;
use pen_gpu::image::{DeviceLocalImage, ImageDesc, ImageView};
use pen_gpu::pipeline::{DepthStencilState as GpuDepthStencil, RasterState};
use pen_gpu::sampler::Sampler as GpuSampler;
use pen_gpu::shader::{ShaderModule, ShaderStage};

use crate::context::ImmediateSubmitter;
use crate::desc::{
    BindFlags, BlendDesc, BufferDesc, ClearState, CpuAccess, InputLayoutDesc,
    RenderTargetDesc, ShaderLinkParams, TextureDesc, TextureFormat, TextureKind,
};
use crate::error::RendererError;
use crate::pool::{ResourceHandle, ResourcePool};

/// Unique for the renderer's lifetime, unlike slots. Pipeline cache keys
/// use it so a reused slot never hits a stale pipeline.
pub(crate) type ObjectId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ClearState,
    Shader,
    InputLayout,
    ShaderProgram,
    Buffer,
    Texture,
    Sampler,
    RasterizerState,
    BlendState,
    DepthStencilState,
    RenderTarget,
    Backbuffer,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::ClearState => "clear state",
            ResourceKind::Shader => "shader",
            ResourceKind::InputLayout => "input layout",
            ResourceKind::ShaderProgram => "shader program",
            ResourceKind::Buffer => "buffer",
            ResourceKind::Texture => "texture",
            ResourceKind::Sampler => "sampler",
            ResourceKind::RasterizerState => "rasterizer state",
            ResourceKind::BlendState => "blend state",
            ResourceKind::DepthStencilState => "depth-stencil state",
            ResourceKind::RenderTarget => "render target",
            ResourceKind::Backbuffer => "backbuffer",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub(crate) enum Resource {
    ClearState(ClearState),
    Shader(Shader),
    InputLayout(InputLayout),
    ShaderProgram(ShaderLinkParams),
    Buffer(Buffer),
    Texture(Texture),
    Sampler(GpuSampler),
    RasterizerState(RasterizerState),
    BlendState(BlendState),
    DepthStencilState(DepthStencilState),
    RenderTarget(RenderTarget),
    /// Resolves to the swapchain image acquired for the current frame.
    Backbuffer,
}

impl Resource {
    pub(crate) fn kind(&self) -> ResourceKind {
        match self {
            Resource::ClearState(_) => ResourceKind::ClearState,
            Resource::Shader(_) => ResourceKind::Shader,
            Resource::InputLayout(_) => ResourceKind::InputLayout,
            Resource::ShaderProgram(_) => ResourceKind::ShaderProgram,
            Resource::Buffer(_) => ResourceKind::Buffer,
            Resource::Texture(_) => ResourceKind::Texture,
            Resource::Sampler(_) => ResourceKind::Sampler,
            Resource::RasterizerState(_) => ResourceKind::RasterizerState,
            Resource::BlendState(_) => ResourceKind::BlendState,
            Resource::DepthStencilState(_) => ResourceKind::DepthStencilState,
            Resource::RenderTarget(_) => ResourceKind::RenderTarget,
            Resource::Backbuffer => ResourceKind::Backbuffer,
        }
    }
}

macro_rules! checked_accessors {
    ($($name:ident => $variant:ident($ty:ty);)*) => {
        impl ResourcePool<Resource> {
            $(
                pub(crate) fn $name(
                    &self,
                    handle: ResourceHandle,
                ) -> Result<&$ty, RendererError> {
                    match self.get(handle)? {
                        Resource::$variant(value) => Ok(value),
                        other => Err(RendererError::KindMismatch {
                            handle,
                            expected: ResourceKind::$variant,
                            actual: other.kind(),
                        }),
                    }
                }
            )*
        }
    };
}

checked_accessors! {
    clear_state => ClearState(ClearState);
    shader => Shader(Shader);
    input_layout => InputLayout(InputLayout);
    shader_program => ShaderProgram(ShaderLinkParams);
    buffer => Buffer(Buffer);
    texture => Texture(Texture);
    sampler => Sampler(GpuSampler);
    rasterizer_state => RasterizerState(RasterizerState);
    blend_state => BlendState(BlendState);
    depth_stencil_state => DepthStencilState(DepthStencilState);
    render_target => RenderTarget(RenderTarget);
}

impl ResourcePool<Resource> {
    pub(crate) fn buffer_mut(
        &mut self,
        handle: ResourceHandle,
    ) -> Result<&mut Buffer, RendererError> {
        match self.get_mut(handle)? {
            Resource::Buffer(buffer) => Ok(buffer),
            other => Err(RendererError::KindMismatch {
                handle,
                expected: ResourceKind::Buffer,
                actual: other.kind(),
            }),
        }
    }

    pub(crate) fn render_target_mut(
        &mut self,
        handle: ResourceHandle,
    ) -> Result<&mut RenderTarget, RendererError> {
        match self.get_mut(handle)? {
            Resource::RenderTarget(target) => Ok(target),
            other => Err(RendererError::KindMismatch {
                handle,
                expected: ResourceKind::RenderTarget,
                actual: other.kind(),
            }),
        }
    }

    /// Remove the resource at `handle` if it is of `kind`.
    pub(crate) fn take_kind(
        &mut self,
        handle: ResourceHandle,
        kind: ResourceKind,
    ) -> Result<Resource, RendererError> {
        let actual = self.get(handle)?.kind();
        if actual != kind {
            return Err(RendererError::KindMismatch {
                handle,
                expected: kind,
                actual,
            });
        }
        Ok(self.take(handle)?)
    }
}

// ---------------------------------------------------------------------------
// Shaders and fixed-function state
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct Shader {
    pub(crate) id: ObjectId,
    pub(crate) module: ShaderModule,
    pub(crate) stage: ShaderStage,
    pub(crate) entry_point: String,
}

#[derive(Debug)]
pub(crate) struct InputLayout {
    pub(crate) id: ObjectId,
    pub(crate) bindings: Vec<vk::VertexInputBindingDescription>,
    pub(crate) attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl InputLayout {
    pub(crate) fn new(id: ObjectId, desc: &InputLayoutDesc) -> Result<Self, RendererError> {
        desc.validate()?;
        let bindings = desc
            .bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: if b.per_instance {
                    vk::VertexInputRate::INSTANCE
                } else {
                    vk::VertexInputRate::VERTEX
                },
            })
            .collect();
        let attributes = desc
            .elements
            .iter()
            .map(|e| vk::VertexInputAttributeDescription {
                location: e.location,
                binding: e.binding,
                format: e.format.vk_format(),
                offset: e.offset,
            })
            .collect();
        Ok(Self {
            id,
            bindings,
            attributes,
        })
    }
}

#[derive(Debug)]
pub(crate) struct RasterizerState {
    pub(crate) id: ObjectId,
    pub(crate) state: RasterState,
}

#[derive(Debug)]
pub(crate) struct BlendState {
    pub(crate) id: ObjectId,
    pub(crate) alpha_to_coverage: bool,
    pub(crate) attachments: Vec<vk::PipelineColorBlendAttachmentState>,
}

impl BlendState {
    pub(crate) fn new(id: ObjectId, desc: &BlendDesc) -> Self {
        Self {
            id,
            alpha_to_coverage: desc.alpha_to_coverage,
            attachments: desc.to_gpu(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct DepthStencilState {
    pub(crate) id: ObjectId,
    pub(crate) state: GpuDepthStencil,
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopySync {
    UpToDate,
    /// The copy only misses the latest write.
    WriteRange,
    Full,
}

fn copy_sync(copy_version: u64, latest: u64, writing: bool) -> CopySync {
    match (writing, latest - copy_version) {
        (_, 0) => CopySync::UpToDate,
        (true, 1) => CopySync::WriteRange,
        _ => CopySync::Full,
    }
}

/// A CPU-writable buffer with one host-visible copy per frame in flight.
///
/// Writes land in a CPU shadow and, while a frame records, in the copy that
/// frame owns; other copies catch up from the shadow when their frame binds
/// them. Within one frame the last write wins.
#[derive(Debug)]
pub(crate) struct DynamicBuffer {
    copies: Vec<(HostVisibleBuffer, u64)>,
    shadow: Vec<u8>,
    version: u64,
}

impl DynamicBuffer {
    fn new(
        device: &Arc<Device>,
        desc: &BufferDesc<'_>,
        copies: usize,
        name: Option<&str>,
    ) -> Result<Self, RendererError> {
        let mut shadow = vec![0u8; desc.size as usize];
        if let Some(data) = desc.data {
            shadow[..data.len()].copy_from_slice(data);
        }
        let copies = (0..copies.max(1))
            .map(|_| {
                let mut buffer =
                    HostVisibleBuffer::new(device, desc.size, desc.bind.vk_usage(), name)?;
                buffer.write_bytes(0, &shadow)?;
                Ok((buffer, 0))
            })
            .collect::<Result<Vec<_>, RendererError>>()?;
        Ok(Self {
            copies,
            shadow,
            version: 0,
        })
    }

    /// Write `bytes` at `offset`. `frame_slot` is the recording frame's slot;
    /// with `None` only the shadow changes, since every copy may still be
    /// read by a frame in flight.
    pub(crate) fn write(
        &mut self,
        frame_slot: Option<usize>,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), MappedAccessError> {
        let start = offset as usize;
        self.shadow[start..start + bytes.len()].copy_from_slice(bytes);
        self.version += 1;
        let Some(frame_slot) = frame_slot else {
            return Ok(());
        };
        let index = frame_slot % self.copies.len();
        let (buffer, copy_version) = &mut self.copies[index];
        match copy_sync(*copy_version, self.version, true) {
            CopySync::UpToDate => {}
            CopySync::WriteRange => buffer.write_bytes(offset, bytes)?,
            CopySync::Full => buffer.write_bytes(0, &self.shadow)?,
        }
        *copy_version = self.version;
        Ok(())
    }

    /// The copy for `frame_slot`, brought up to date first.
    pub(crate) fn current(
        &mut self,
        frame_slot: usize,
    ) -> Result<&HostVisibleBuffer, MappedAccessError> {
        let index = frame_slot % self.copies.len();
        let (buffer, copy_version) = &mut self.copies[index];
        if copy_sync(*copy_version, self.version, false) != CopySync::UpToDate {
            buffer.write_bytes(0, &self.shadow)?;
            *copy_version = self.version;
        }
        Ok(buffer)
    }

    pub(crate) fn shadow(&self) -> &[u8] {
        &self.shadow
    }
}

#[derive(Debug)]
pub(crate) enum BufferStorage {
    Static(DeviceLocalBuffer),
    Dynamic(DynamicBuffer),
}

#[derive(Debug)]
pub(crate) struct Buffer {
    pub(crate) bind: BindFlags,
    pub(crate) size: u64,
    pub(crate) storage: BufferStorage,
}

impl Buffer {
    pub(crate) fn new(
        device: &Arc<Device>,
        uploader: &mut ImmediateSubmitter,
        desc: &BufferDesc<'_>,
        frames_in_flight: usize,
        name: Option<&str>,
    ) -> Result<Self, RendererError> {
        desc.validate()?;
        let storage = match desc.cpu_access {
            CpuAccess::Write => {
                BufferStorage::Dynamic(DynamicBuffer::new(device, desc, frames_in_flight, name)?)
            }
            CpuAccess::None => {
                let mut buffer =
                    DeviceLocalBuffer::new(device, desc.size, desc.bind.vk_usage(), name)?;
                if let Some(data) = desc.data
                    && !data.is_empty()
                {
                    let mut staging = HostVisibleBuffer::new(
                        device,
                        data.len() as u64,
                        vk::BufferUsageFlags::TRANSFER_SRC,
                        Some("staging"),
                    )?;
                    staging.write_bytes(0, data)?;
                    uploader.submit(|cmd| {
                        // SAFETY: cmd is recording outside a render pass and
                        // staging outlives the blocking submit.
                        unsafe {
                            buffer.record_copy_from(
                                cmd,
                                &staging,
                                staging.size(),
                                0,
                                0,
                                staging.size(),
                            )
                        }?;
                        Ok(())
                    })?;
                }
                BufferStorage::Static(buffer)
            }
        };
        Ok(Self {
            bind: desc.bind,
            size: desc.size,
            storage,
        })
    }

    /// The `VkBuffer` to bind while recording in `frame_slot`.
    pub(crate) fn bind_handle(&mut self, frame_slot: usize) -> Result<vk::Buffer, RendererError> {
        Ok(match &mut self.storage {
            BufferStorage::Static(buffer) => buffer.raw_buffer(),
            BufferStorage::Dynamic(dynamic) => dynamic.current(frame_slot)?.raw_buffer(),
        })
    }
}

// ---------------------------------------------------------------------------
// Textures and render targets
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct Texture {
    pub(crate) image: Arc<DeviceLocalImage>,
    pub(crate) view: ImageView,
    pub(crate) format: TextureFormat,
}

impl Texture {
    pub(crate) fn new(
        device: &Arc<Device>,
        uploader: &mut ImmediateSubmitter,
        desc: &TextureDesc<'_>,
        name: Option<&str>,
    ) -> Result<Self, RendererError> {
        desc.validate()?;
        let image_desc = ImageDesc {
            array_layers: desc.kind.layers(),
            cube_compatible: desc.kind == TextureKind::Cube,
            ..ImageDesc::new_2d(
                vk::Extent2D {
                    width: desc.width,
                    height: desc.height,
                },
                desc.format.vk_format(),
                vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
            )
        };
        let image = Arc::new(DeviceLocalImage::new(device, &image_desc, name)?);
        let view = ImageView::new_full(&image, name)?;

        match desc.data {
            Some(data) => {
                let mut staging = HostVisibleBuffer::new(
                    device,
                    data.len() as u64,
                    vk::BufferUsageFlags::TRANSFER_SRC,
                    Some("staging"),
                )?;
                staging.write_bytes(0, data)?;
                let layer_bytes = desc.layer_bytes();
                uploader.submit(|cmd| {
                    // SAFETY: cmd is recording outside a render pass, the
                    // staging buffer holds every layer and outlives the
                    // blocking submit.
                    unsafe { image.record_upload(cmd, &staging, layer_bytes) };
                    Ok(())
                })?;
            }
            None => uploader.submit(|cmd| {
                // SAFETY: the image is fresh, so UNDEFINED is its layout.
                unsafe {
                    image.record_transition(
                        cmd,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    )
                };
                Ok(())
            })?,
        }

        Ok(Self {
            image,
            view,
            format: desc.format,
        })
    }
}

/// The single-sample image an MSAA colour target resolves into.
#[derive(Debug)]
pub(crate) struct ResolveImage {
    pub(crate) image: Arc<DeviceLocalImage>,
    pub(crate) view: ImageView,
    pub(crate) layout: vk::ImageLayout,
}

#[derive(Debug)]
pub(crate) struct RenderTarget {
    pub(crate) desc: RenderTargetDesc,
    pub(crate) image: Arc<DeviceLocalImage>,
    /// One single-layer view per array layer, for attachment binding.
    pub(crate) layer_views: Vec<ImageView>,
    /// All layers; `None` for combined depth-stencil formats, which cannot
    /// be sampled through a single view.
    pub(crate) sampled_view: Option<ImageView>,
    pub(crate) layout: vk::ImageLayout,
    pub(crate) resolve: Option<ResolveImage>,
}

impl RenderTarget {
    pub(crate) fn attachment_layout(&self) -> vk::ImageLayout {
        if self.is_depth() {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        }
    }

    pub(crate) fn is_depth(&self) -> bool {
        self.desc.format.is_depth()
    }

    pub(crate) fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }

    pub(crate) fn layer_view(&self, slice: u32) -> Result<vk::ImageView, RendererError> {
        self.layer_views
            .get(slice as usize)
            .map(ImageView::raw_image_view)
            .ok_or_else(|| {
                RendererError::TargetMismatch(format!(
                    "slice {slice} of a target with {} layers",
                    self.layer_views.len()
                ))
            })
    }

    pub(crate) fn new(
        device: &Arc<Device>,
        uploader: &mut ImmediateSubmitter,
        desc: &RenderTargetDesc,
        window_extent: vk::Extent2D,
        name: Option<&str>,
    ) -> Result<Self, RendererError> {
        desc.validate()?;
        let samples = desc.vk_samples()?;
        let format = desc.format.vk_format();
        let attachment_usage = if desc.format.is_depth() {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        };
        let image_desc = ImageDesc {
            extent: desc.size.resolve(window_extent),
            format,
            usage: attachment_usage
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            array_layers: desc.kind.layers(),
            samples,
            cube_compatible: desc.kind == TextureKind::Cube,
        };
        let image = Arc::new(DeviceLocalImage::new(device, &image_desc, name)?);

        let layer_views = (0..image_desc.array_layers)
            .map(|layer| {
                ImageView::new(&image, vk::ImageViewType::TYPE_2D, layer, 1, name)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let sampled_view = if desc.format.has_stencil() {
            None
        } else {
            Some(ImageView::new_full(&image, name)?)
        };

        let resolve = if samples != vk::SampleCountFlags::TYPE_1 && !desc.format.is_depth() {
            let resolve_desc = ImageDesc {
                samples: vk::SampleCountFlags::TYPE_1,
                usage: vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
                ..image_desc
            };
            let resolve_image = Arc::new(DeviceLocalImage::new(device, &resolve_desc, name)?);
            let view = ImageView::new_full(&resolve_image, name)?;
            Some(ResolveImage {
                image: resolve_image,
                view,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
        } else {
            None
        };

        let mut target = Self {
            desc: *desc,
            image,
            layer_views,
            sampled_view,
            layout: vk::ImageLayout::UNDEFINED,
            resolve,
        };
        let attachment_layout = target.attachment_layout();
        uploader.submit(|cmd| {
            // SAFETY: both images are fresh, so UNDEFINED is their layout.
            unsafe {
                target.image.record_transition(
                    cmd,
                    vk::ImageLayout::UNDEFINED,
                    attachment_layout,
                );
                if let Some(resolve) = &target.resolve {
                    resolve.image.record_transition(
                        cmd,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    );
                }
            }
            Ok(())
        })?;
        target.layout = attachment_layout;
        Ok(target)
    }
}

/// First depth format in preference order the device can render to.
pub(crate) fn pick_depth_format(
    mut supports_attachment: impl FnMut(vk::Format) -> bool,
) -> Option<TextureFormat> {
    [
        TextureFormat::D32FloatS8,
        TextureFormat::D24S8,
        TextureFormat::D32Float,
        TextureFormat::D16,
    ]
    .into_iter()
    .find(|f| supports_attachment(f.vk_format()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;

    #[test]
    fn accessor_rejects_wrong_kind() {
        let mut pool = ResourcePool::with_capacity(8);
        pool.insert(ResourceHandle(0), Resource::ClearState(ClearState::default()))
            .unwrap();
        pool.insert(ResourceHandle(1), Resource::Backbuffer).unwrap();

        assert!(pool.clear_state(ResourceHandle(0)).is_ok());
        assert!(matches!(
            pool.clear_state(ResourceHandle(1)),
            Err(RendererError::KindMismatch {
                expected: ResourceKind::ClearState,
                actual: ResourceKind::Backbuffer,
                ..
            })
        ));
        assert!(matches!(
            pool.texture(ResourceHandle(0)),
            Err(RendererError::KindMismatch {
                actual: ResourceKind::ClearState,
                ..
            })
        ));
        assert!(matches!(
            pool.shader(ResourceHandle(2)),
            Err(RendererError::Pool(crate::pool::PoolError::Vacant(_)))
        ));
    }

    #[test]
    fn take_kind_leaves_mismatched_resource_in_place() {
        let mut pool = ResourcePool::with_capacity(8);
        pool.insert(ResourceHandle(3), Resource::ClearState(ClearState::default()))
            .unwrap();
        assert!(pool.take_kind(ResourceHandle(3), ResourceKind::Shader).is_err());
        assert!(pool.contains(ResourceHandle(3)));
        assert!(pool.take_kind(ResourceHandle(3), ResourceKind::ClearState).is_ok());
        assert!(matches!(
            pool.take_kind(ResourceHandle(3), ResourceKind::ClearState),
            Err(RendererError::Pool(crate::pool::PoolError::Vacant(_)))
        ));
    }

    #[test]
    fn copy_sync_plans() {
        assert_eq!(copy_sync(4, 4, false), CopySync::UpToDate);
        assert_eq!(copy_sync(3, 4, true), CopySync::WriteRange);
        assert_eq!(copy_sync(3, 4, false), CopySync::Full);
        assert_eq!(copy_sync(1, 4, true), CopySync::Full);
    }

    #[test]
    fn depth_format_preference() {
        let queried = RefCell::new(Vec::new());
        let picked = pick_depth_format(|f| {
            queried.borrow_mut().push(f);
            f == vk::Format::D24_UNORM_S8_UINT || f == vk::Format::D16_UNORM
        });
        assert_eq!(picked, Some(TextureFormat::D24S8));
        assert_eq!(
            *queried.borrow(),
            vec![vk::Format::D32_SFLOAT_S8_UINT, vk::Format::D24_UNORM_S8_UINT]
        );
        assert_eq!(pick_depth_format(|_| false), None);
    }

    #[test]
    fn input_layout_translates_rates() {
        use crate::desc::{InputBinding, InputElement, VertexFormat};
        let desc = InputLayoutDesc {
            bindings: vec![
                InputBinding {
                    binding: 0,
                    stride: 12,
                    per_instance: false,
                },
                InputBinding {
                    binding: 1,
                    stride: 16,
                    per_instance: true,
                },
            ],
            elements: vec![InputElement {
                location: 2,
                binding: 1,
                format: VertexFormat::Float4,
                offset: 0,
            }],
        };
        let layout = InputLayout::new(7, &desc).unwrap();
        assert_eq!(layout.id, 7);
        assert_eq!(layout.bindings[1].input_rate, vk::VertexInputRate::INSTANCE);
        assert_eq!(layout.attributes[0].format, vk::Format::R32G32B32A32_SFLOAT);
    }
}
