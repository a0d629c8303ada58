//! The public renderer: resource lifetime, pending-state setters and
//! queries. Command recording lives in [`recorder`].

mod recorder;

use std::sync::Arc;

use pen_gpu::ash::vk;
use pen_gpu::buffer::HostVisibleBuffer;
use pen_gpu::image::DeviceLocalImage;
use pen_gpu::instance::ApiVersion;
use pen_gpu::sampler::Sampler as GpuSampler;
use pen_gpu::shader::{ShaderModule, ShaderStage};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::config::RendererConfig;
use crate::context::{DeferredQueue, DeviceContext, Retired};
use crate::desc::{
    BindFlags, BlendDesc, BufferDesc, ClearState, DepthStencilDesc, IndexFormat,
    InputLayoutDesc, RasterizerDesc, Rect, RenderTargetDesc, RenderTargetSize, SamplerDesc,
    ShaderLinkParams, ShaderLoadParams, TextureDesc, TextureFormat, Viewport,
};
use crate::error::RendererError;
use crate::info::RendererInfo;
use crate::pipeline_cache::PipelineCache;
use crate::pool::{ResourceHandle, ResourcePool};
use crate::resource::{
    BlendState, Buffer, BufferStorage, DepthStencilState, InputLayout, ObjectId,
    RasterizerState, RenderTarget, Resource, ResourceKind, Shader, Texture, pick_depth_format,
};
use crate::state::{FrameState, IndexBufferBinding, PendingState, TextureBinding};

use recorder::RecordingState;

/// A Vulkan renderer drawing into one window.
///
/// Resources live in caller-chosen pool slots. Setters only change pending
/// state; draws resolve it into render passes and pipelines, and
/// [`present`](Self::present) submits the frame.
pub struct Renderer<W: HasDisplayHandle + HasWindowHandle> {
    // Field order is drop order. `Drop` waits for the device first.
    garbage: DeferredQueue<Retired>,
    pipelines: PipelineCache,
    resources: ResourcePool<Resource>,
    context: DeviceContext<W>,

    state: PendingState,
    recording: RecordingState,
    frame_state: FrameState,
    next_object_id: ObjectId,
    depth_format: Option<TextureFormat>,
}

impl<W: HasDisplayHandle + HasWindowHandle> std::fmt::Debug for Renderer<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("context", &self.context)
            .field("resources", &self.resources)
            .field("pipelines", &self.pipelines)
            .field("frame_state", &self.frame_state)
            .field("retired", &self.garbage.len())
            .finish_non_exhaustive()
    }
}

/// True if `len` bytes at `offset` fit in a buffer of `size` bytes.
fn write_fits(offset: u64, len: u64, size: u64) -> bool {
    offset.checked_add(len).is_some_and(|end| end <= size)
}

/// True if a target sized by `size` no longer matches the window.
fn is_stale_window_target(
    size: RenderTargetSize,
    current: vk::Extent2D,
    window: vk::Extent2D,
) -> bool {
    if !matches!(size, RenderTargetSize::WindowRatio(_)) {
        return false;
    }
    let wanted = size.resolve(window);
    (wanted.width, wanted.height) != (current.width, current.height)
}

fn require_stage(
    shader: &Shader,
    handle: ResourceHandle,
    expected: ShaderStage,
) -> Result<(), RendererError> {
    if shader.stage != expected {
        return Err(RendererError::WrongShaderStage {
            handle,
            expected,
            actual: shader.stage,
        });
    }
    Ok(())
}

impl<W: HasDisplayHandle + HasWindowHandle> Renderer<W> {
    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Bring up the device and swapchain for `window`.
    ///
    /// `window_size` is the window's inner size in pixels; it is used when
    /// the surface does not report a fixed extent. The backbuffer is
    /// registered at `backbuffer_colour_slot`, and a window-sized depth
    /// target is created at `backbuffer_depth_slot` when given.
    pub fn initialise(
        window: Arc<W>,
        window_size: (u32, u32),
        backbuffer_colour_slot: ResourceHandle,
        backbuffer_depth_slot: Option<ResourceHandle>,
        config: RendererConfig,
    ) -> Result<Self, RendererError> {
        let mut resources = ResourcePool::with_capacity(config.pool_capacity);
        resources.insert(backbuffer_colour_slot, Resource::Backbuffer)?;
        if let Some(slot) = backbuffer_depth_slot {
            resources.check_vacant(slot)?;
        }

        let extent = vk::Extent2D {
            width: window_size.0,
            height: window_size.1,
        };
        let context = DeviceContext::new(window, extent, &config)?;
        let device = Arc::clone(context.device());
        let depth_format = pick_depth_format(|format| {
            device
                .optimal_format_features(format)
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        });
        tracing::debug!("Depth format: {depth_format:?}");

        let mut renderer = Self {
            garbage: DeferredQueue::default(),
            pipelines: PipelineCache::default(),
            resources,
            context,
            state: PendingState::new(),
            recording: RecordingState::default(),
            frame_state: FrameState::Idle,
            next_object_id: 0,
            depth_format,
        };

        if let Some(slot) = backbuffer_depth_slot {
            let format = depth_format.ok_or(RendererError::Unsupported(
                "no depth-stencil attachment format on this device",
            ))?;
            renderer.create_render_target(
                slot,
                &RenderTargetDesc::new(RenderTargetSize::WindowRatio(1.0), format),
            )?;
        }
        Ok(renderer)
    }

    /// Wait for the GPU and tear everything down.
    pub fn shutdown(mut self) -> Result<(), RendererError> {
        if self.frame_state != FrameState::Idle {
            self.context.abandon_frame();
        }
        self.context.wait_idle()?;
        tracing::info!("Renderer shut down");
        Ok(())
    }

    /// Vulkan has no current context; kept for API parity.
    pub fn make_context_current(&self) {}

    /// Block until the GPU is idle and destroy everything retired so far.
    pub fn sync(&mut self) -> Result<(), RendererError> {
        self.context.wait_idle()?;
        self.collect_garbage();
        Ok(())
    }

    /// Follow a window resize. Swapchain recreation is deferred while the
    /// window is minimised; window-sized render targets are rebuilt.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), RendererError> {
        if self.frame_state != FrameState::Idle {
            return Err(RendererError::InvalidFrameState {
                operation: "resize",
                state: self.frame_state,
            });
        }
        let extent = vk::Extent2D { width, height };
        self.context.resize(extent)?;
        if self.context.is_minimised() {
            return Ok(());
        }

        let stale: Vec<(ResourceHandle, RenderTargetDesc)> = self
            .resources
            .iter()
            .filter_map(|(handle, resource)| match resource {
                Resource::RenderTarget(target)
                    if is_stale_window_target(target.desc.size, target.extent(), extent) =>
                {
                    Some((handle, target.desc))
                }
                _ => None,
            })
            .collect();
        let device = Arc::clone(self.context.device());
        for (handle, desc) in stale {
            tracing::debug!("Recreating window-sized render target {handle}");
            let name = self.object_name(ResourceKind::RenderTarget, handle);
            let target = RenderTarget::new(
                &device,
                &mut self.context.uploader,
                &desc,
                extent,
                name.as_deref(),
            )?;
            let old = self.resources.replace(handle, Resource::RenderTarget(target))?;
            self.retire(Retired::Resource(old));
        }
        self.state.pass_dirty = true;
        self.state.descriptors_dirty = true;
        Ok(())
    }

    pub fn frame_state(&self) -> FrameState {
        self.frame_state
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_info(&self) -> RendererInfo {
        let device = self.context.device();
        let properties = device.properties();
        let swapchain = self.context.swapchain();
        let extent = swapchain.extent();
        RendererInfo {
            device_name: device.device_name(),
            vendor_id: properties.vendor_id,
            device_id: properties.device_id,
            device_type: properties.device_type,
            api_version: ApiVersion::from_raw(properties.api_version),
            swapchain_format: swapchain.format(),
            swapchain_extent: (extent.width, extent.height),
            present_mode: swapchain.present_mode(),
            image_count: swapchain.images().len(),
            frames_in_flight: self.context.frames_in_flight(),
            depth_format: self.depth_format,
            pool_capacity: self.resources.capacity(),
            live_resources: self.resources.len(),
            cached_pipelines: self.pipelines.len(),
            tracked_targets: self
                .resources
                .iter()
                .filter(|(_, r)| matches!(r, Resource::RenderTarget(t) if t.desc.track))
                .count(),
        }
    }

    pub fn get_shader_platform_name(&self) -> &'static str {
        "spirv"
    }

    /// Clip space y points down in Vulkan.
    pub fn viewport_v_up(&self) -> bool {
        false
    }

    // -----------------------------------------------------------------------
    // Resource creation
    // -----------------------------------------------------------------------

    fn next_id(&mut self) -> ObjectId {
        self.next_object_id += 1;
        self.next_object_id
    }

    /// Debug name for the object at `slot`, when naming is enabled.
    fn object_name(&self, kind: ResourceKind, slot: ResourceHandle) -> Option<String> {
        self.context
            .config()
            .debug_names
            .then(|| format!("{kind} {slot}"))
    }

    fn insert(&mut self, slot: ResourceHandle, resource: Resource) -> Result<(), RendererError> {
        let kind = resource.kind();
        self.resources.insert(slot, resource)?;
        tracing::trace!("Created {kind} at {slot}");
        Ok(())
    }

    pub fn create_clear_state(
        &mut self,
        slot: ResourceHandle,
        desc: &ClearState,
    ) -> Result<(), RendererError> {
        self.insert(slot, Resource::ClearState(desc.clone()))
    }

    pub fn load_shader(
        &mut self,
        slot: ResourceHandle,
        params: &ShaderLoadParams<'_>,
    ) -> Result<(), RendererError> {
        self.resources.check_vacant(slot)?;
        std::ffi::CString::new(params.entry_point)?;
        let name = self.object_name(ResourceKind::Shader, slot);
        let module = ShaderModule::new(self.context.device(), params.byte_code, name.as_deref())?;
        let id = self.next_id();
        self.insert(
            slot,
            Resource::Shader(Shader {
                id,
                module,
                stage: params.stage,
                entry_point: params.entry_point.to_owned(),
            }),
        )
    }

    pub fn create_input_layout(
        &mut self,
        slot: ResourceHandle,
        desc: &InputLayoutDesc,
    ) -> Result<(), RendererError> {
        self.resources.check_vacant(slot)?;
        let id = self.next_id();
        let layout = InputLayout::new(id, desc)?;
        self.insert(slot, Resource::InputLayout(layout))
    }

    /// Validate a vertex/fragment pair and input layout and store them as
    /// one bindable program.
    pub fn link_shader_program(
        &mut self,
        slot: ResourceHandle,
        params: ShaderLinkParams,
    ) -> Result<(), RendererError> {
        self.resources.check_vacant(slot)?;
        require_stage(
            self.resources.shader(params.vertex)?,
            params.vertex,
            ShaderStage::Vertex,
        )?;
        if let Some(fragment) = params.fragment {
            require_stage(
                self.resources.shader(fragment)?,
                fragment,
                ShaderStage::Fragment,
            )?;
        }
        if let Some(layout) = params.input_layout {
            self.resources.input_layout(layout)?;
        }
        self.insert(slot, Resource::ShaderProgram(params))
    }

    pub fn create_buffer(
        &mut self,
        slot: ResourceHandle,
        desc: &BufferDesc<'_>,
    ) -> Result<(), RendererError> {
        self.resources.check_vacant(slot)?;
        let device = Arc::clone(self.context.device());
        let name = self.object_name(ResourceKind::Buffer, slot);
        let frames = self.context.frames_in_flight();
        let buffer = Buffer::new(
            &device,
            &mut self.context.uploader,
            desc,
            frames,
            name.as_deref(),
        )?;
        self.insert(slot, Resource::Buffer(buffer))
    }

    pub fn create_texture(
        &mut self,
        slot: ResourceHandle,
        desc: &TextureDesc<'_>,
    ) -> Result<(), RendererError> {
        self.resources.check_vacant(slot)?;
        let device = Arc::clone(self.context.device());
        let name = self.object_name(ResourceKind::Texture, slot);
        let texture = Texture::new(&device, &mut self.context.uploader, desc, name.as_deref())?;
        self.insert(slot, Resource::Texture(texture))
    }

    pub fn create_sampler(
        &mut self,
        slot: ResourceHandle,
        desc: &SamplerDesc,
    ) -> Result<(), RendererError> {
        self.resources.check_vacant(slot)?;
        let name = self.object_name(ResourceKind::Sampler, slot);
        let sampler = GpuSampler::new(self.context.device(), &desc.to_gpu(), name.as_deref())?;
        self.insert(slot, Resource::Sampler(sampler))
    }

    pub fn create_rasterizer_state(
        &mut self,
        slot: ResourceHandle,
        desc: &RasterizerDesc,
    ) -> Result<(), RendererError> {
        self.resources.check_vacant(slot)?;
        let id = self.next_id();
        self.insert(
            slot,
            Resource::RasterizerState(RasterizerState {
                id,
                state: desc.to_gpu(),
            }),
        )
    }

    pub fn create_blend_state(
        &mut self,
        slot: ResourceHandle,
        desc: &BlendDesc,
    ) -> Result<(), RendererError> {
        self.resources.check_vacant(slot)?;
        let id = self.next_id();
        self.insert(slot, Resource::BlendState(BlendState::new(id, desc)))
    }

    pub fn create_depth_stencil_state(
        &mut self,
        slot: ResourceHandle,
        desc: &DepthStencilDesc,
    ) -> Result<(), RendererError> {
        self.resources.check_vacant(slot)?;
        let id = self.next_id();
        self.insert(
            slot,
            Resource::DepthStencilState(DepthStencilState {
                id,
                state: desc.to_gpu(),
            }),
        )
    }

    pub fn create_render_target(
        &mut self,
        slot: ResourceHandle,
        desc: &RenderTargetDesc,
    ) -> Result<(), RendererError> {
        self.resources.check_vacant(slot)?;
        let device = Arc::clone(self.context.device());
        let required = if desc.format.is_depth() {
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::FormatFeatureFlags::COLOR_ATTACHMENT
        };
        if !device
            .optimal_format_features(desc.format.vk_format())
            .contains(required)
        {
            return Err(RendererError::InvalidDescriptor(format!(
                "{:?} is not renderable on this device",
                desc.format
            )));
        }
        let name = self.object_name(ResourceKind::RenderTarget, slot);
        let window_extent = self.context.window_extent();
        let target = RenderTarget::new(
            &device,
            &mut self.context.uploader,
            desc,
            window_extent,
            name.as_deref(),
        )?;
        self.insert(slot, Resource::RenderTarget(target))
    }

    // -----------------------------------------------------------------------
    // Release and replacement
    // -----------------------------------------------------------------------

    /// Keep `item` alive until every frame that may use it has completed.
    fn retire(&mut self, item: Retired) {
        match self.context.retire_tag() {
            Some(frame) => self.garbage.push(frame, item),
            None => drop(item),
        }
    }

    fn collect_garbage(&mut self) {
        let done = self.garbage.collect(self.context.completed_frame());
        if !done.is_empty() {
            tracing::trace!("Destroying {} retired objects", done.len());
        }
    }

    /// Retire every cached pipeline built from `resource`.
    fn evict_pipelines(&mut self, resource: &Resource) {
        let id = match resource {
            Resource::Shader(shader) => shader.id,
            Resource::InputLayout(layout) => layout.id,
            Resource::RasterizerState(state) => state.id,
            Resource::BlendState(state) => state.id,
            Resource::DepthStencilState(state) => state.id,
            _ => return,
        };
        let (graphics, compute) = self.pipelines.evict(id);
        for pipeline in graphics {
            self.retire(Retired::GraphicsPipeline(pipeline));
        }
        if let Some(pipeline) = compute {
            self.retire(Retired::ComputePipeline(pipeline));
        }
    }

    fn release(&mut self, handle: ResourceHandle, kind: ResourceKind) -> Result<(), RendererError> {
        let resource = self.resources.take_kind(handle, kind)?;
        self.state.forget(handle);
        self.evict_pipelines(&resource);
        self.retire(Retired::Resource(resource));
        tracing::trace!("Released {kind} at {handle}");
        Ok(())
    }

    pub fn release_clear_state(&mut self, handle: ResourceHandle) -> Result<(), RendererError> {
        self.release(handle, ResourceKind::ClearState)
    }

    pub fn release_shader(&mut self, handle: ResourceHandle) -> Result<(), RendererError> {
        self.release(handle, ResourceKind::Shader)
    }

    pub fn release_input_layout(&mut self, handle: ResourceHandle) -> Result<(), RendererError> {
        self.release(handle, ResourceKind::InputLayout)
    }

    pub fn release_shader_program(&mut self, handle: ResourceHandle) -> Result<(), RendererError> {
        self.release(handle, ResourceKind::ShaderProgram)
    }

    pub fn release_buffer(&mut self, handle: ResourceHandle) -> Result<(), RendererError> {
        self.release(handle, ResourceKind::Buffer)
    }

    pub fn release_texture(&mut self, handle: ResourceHandle) -> Result<(), RendererError> {
        self.release(handle, ResourceKind::Texture)
    }

    pub fn release_sampler(&mut self, handle: ResourceHandle) -> Result<(), RendererError> {
        self.release(handle, ResourceKind::Sampler)
    }

    pub fn release_rasterizer_state(
        &mut self,
        handle: ResourceHandle,
    ) -> Result<(), RendererError> {
        self.release(handle, ResourceKind::RasterizerState)
    }

    pub fn release_blend_state(&mut self, handle: ResourceHandle) -> Result<(), RendererError> {
        self.release(handle, ResourceKind::BlendState)
    }

    pub fn release_depth_stencil_state(
        &mut self,
        handle: ResourceHandle,
    ) -> Result<(), RendererError> {
        self.release(handle, ResourceKind::DepthStencilState)
    }

    pub fn release_render_target(&mut self, handle: ResourceHandle) -> Result<(), RendererError> {
        self.release(handle, ResourceKind::RenderTarget)
    }

    /// Move the `kind` resource at `src` into `dest`, releasing whatever
    /// `dest` held. Used to hot-reload shaders and textures in place.
    pub fn replace_resource(
        &mut self,
        dest: ResourceHandle,
        src: ResourceHandle,
        kind: ResourceKind,
    ) -> Result<(), RendererError> {
        if kind == ResourceKind::Backbuffer {
            return Err(RendererError::Unsupported("replacing the backbuffer"));
        }
        let actual = self.resources.get(src)?.kind();
        if actual != kind {
            return Err(RendererError::KindMismatch {
                handle: src,
                expected: kind,
                actual,
            });
        }
        if dest == src {
            return Ok(());
        }
        let occupied = self.resources.contains(dest);
        if occupied {
            let existing = self.resources.get(dest)?.kind();
            if existing != kind {
                return Err(RendererError::KindMismatch {
                    handle: dest,
                    expected: kind,
                    actual: existing,
                });
            }
        } else {
            self.resources.check_vacant(dest)?;
        }

        let resource = self.resources.take(src)?;
        self.state.forget(src);
        if occupied {
            let old = self.resources.replace(dest, resource)?;
            self.evict_pipelines(&old);
            self.retire(Retired::Resource(old));
        } else {
            self.resources.insert(dest, resource)?;
        }
        self.state.descriptors_dirty = true;
        if self.state.is_target(dest) {
            self.state.pass_dirty = true;
        }
        tracing::debug!("Replaced {kind} at {dest} with {src}");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pending state
    // -----------------------------------------------------------------------

    pub fn set_shader(
        &mut self,
        handle: ResourceHandle,
        stage: ShaderStage,
    ) -> Result<(), RendererError> {
        self.resources.shader(handle)?;
        let slot = match stage {
            ShaderStage::Vertex => &mut self.state.vertex_shader,
            ShaderStage::Fragment => &mut self.state.fragment_shader,
            ShaderStage::Compute => &mut self.state.compute_shader,
        };
        *slot = Some(handle);
        Ok(())
    }

    /// Bind a linked program's shaders and input layout together.
    pub fn set_shader_program(&mut self, handle: ResourceHandle) -> Result<(), RendererError> {
        let program = *self.resources.shader_program(handle)?;
        self.state.vertex_shader = Some(program.vertex);
        self.state.fragment_shader = program.fragment;
        self.state.input_layout = program.input_layout;
        Ok(())
    }

    pub fn set_input_layout(
        &mut self,
        layout: Option<ResourceHandle>,
    ) -> Result<(), RendererError> {
        if let Some(handle) = layout {
            self.resources.input_layout(handle)?;
        }
        self.state.input_layout = layout;
        Ok(())
    }

    fn require_bind_flag(
        &self,
        handle: ResourceHandle,
        flag: BindFlags,
        role: &str,
    ) -> Result<(), RendererError> {
        if !self.resources.buffer(handle)?.bind.contains(flag) {
            return Err(RendererError::InvalidDescriptor(format!(
                "buffer {handle} was not created for use as a {role} buffer"
            )));
        }
        Ok(())
    }

    /// Bind `buffers` to consecutive vertex input bindings from `first`.
    /// Missing offsets default to zero.
    pub fn set_vertex_buffers(
        &mut self,
        first: u32,
        buffers: &[ResourceHandle],
        offsets: &[u64],
    ) -> Result<(), RendererError> {
        for &handle in buffers {
            self.require_bind_flag(handle, BindFlags::VERTEX, "vertex")?;
        }
        self.state.set_vertex_buffers(first, buffers, offsets)
    }

    pub fn set_index_buffer(
        &mut self,
        handle: ResourceHandle,
        format: IndexFormat,
        offset: u64,
    ) -> Result<(), RendererError> {
        self.require_bind_flag(handle, BindFlags::INDEX, "index")?;
        self.state.index_buffer = Some(IndexBufferBinding {
            buffer: handle,
            format,
            offset,
        });
        Ok(())
    }

    pub fn set_constant_buffer(
        &mut self,
        slot: u32,
        buffer: Option<ResourceHandle>,
    ) -> Result<(), RendererError> {
        if let Some(handle) = buffer {
            self.require_bind_flag(handle, BindFlags::CONSTANT, "constant")?;
        }
        self.state.set_constant_buffer(slot, buffer)
    }

    pub fn set_structured_buffer(
        &mut self,
        slot: u32,
        buffer: Option<ResourceHandle>,
    ) -> Result<(), RendererError> {
        if let Some(handle) = buffer {
            self.require_bind_flag(handle, BindFlags::STRUCTURED, "structured")?;
        }
        self.state.set_structured_buffer(slot, buffer)
    }

    /// Bind a texture (or render target) and sampler pair to `slot`.
    pub fn set_texture(
        &mut self,
        slot: u32,
        binding: Option<(ResourceHandle, ResourceHandle)>,
    ) -> Result<(), RendererError> {
        let binding = match binding {
            Some((texture, sampler)) => {
                match self.resources.get(texture)? {
                    Resource::Texture(_) | Resource::RenderTarget(_) => {}
                    other => {
                        return Err(RendererError::KindMismatch {
                            handle: texture,
                            expected: ResourceKind::Texture,
                            actual: other.kind(),
                        });
                    }
                }
                self.resources.sampler(sampler)?;
                Some(TextureBinding { texture, sampler })
            }
            None => None,
        };
        self.state.set_texture(slot, binding)
    }

    pub fn set_rasterizer_state(
        &mut self,
        state: Option<ResourceHandle>,
    ) -> Result<(), RendererError> {
        if let Some(handle) = state {
            self.resources.rasterizer_state(handle)?;
        }
        self.state.rasterizer_state = state;
        Ok(())
    }

    pub fn set_blend_state(&mut self, state: Option<ResourceHandle>) -> Result<(), RendererError> {
        if let Some(handle) = state {
            self.resources.blend_state(handle)?;
        }
        self.state.blend_state = state;
        Ok(())
    }

    pub fn set_depth_stencil_state(
        &mut self,
        state: Option<ResourceHandle>,
    ) -> Result<(), RendererError> {
        if let Some(handle) = state {
            self.resources.depth_stencil_state(handle)?;
        }
        self.state.depth_stencil_state = state;
        Ok(())
    }

    /// `None` restores the full-target viewport.
    pub fn set_viewport(&mut self, viewport: Option<Viewport>) {
        self.state.viewport = viewport;
    }

    /// `None` restores the full-target scissor.
    pub fn set_scissor_rect(&mut self, rect: Option<Rect>) {
        self.state.scissor = rect;
    }

    pub fn set_stencil_ref(&mut self, reference: u32) {
        self.state.stencil_ref = reference;
    }

    /// Replace every bound target. Colour targets are render targets or the
    /// backbuffer; the depth target must have a depth format.
    pub fn set_targets(
        &mut self,
        colour: &[ResourceHandle],
        depth: Option<ResourceHandle>,
        colour_slice: u32,
        depth_slice: u32,
    ) -> Result<(), RendererError> {
        for &handle in colour {
            match self.resources.get(handle)? {
                Resource::Backbuffer => {}
                Resource::RenderTarget(target) if !target.is_depth() => {}
                Resource::RenderTarget(_) => {
                    return Err(RendererError::TargetMismatch(format!(
                        "depth target {handle} bound as a colour target"
                    )));
                }
                other => {
                    return Err(RendererError::KindMismatch {
                        handle,
                        expected: ResourceKind::RenderTarget,
                        actual: other.kind(),
                    });
                }
            }
        }
        if let Some(handle) = depth
            && !self.resources.render_target(handle)?.is_depth()
        {
            return Err(RendererError::TargetMismatch(format!(
                "colour target {handle} bound as the depth target"
            )));
        }
        self.state.set_targets(colour, depth, colour_slice, depth_slice)
    }

    /// Auto-resolve `colour` into its resolve image whenever a pass that
    /// renders to it ends. Depth resolves are not supported.
    pub fn set_resolve_targets(
        &mut self,
        colour: Option<ResourceHandle>,
        depth: Option<ResourceHandle>,
    ) -> Result<(), RendererError> {
        if depth.is_some() {
            return Err(RendererError::Unsupported("depth resolve targets"));
        }
        if let Some(handle) = colour
            && self.resources.render_target(handle)?.resolve.is_none()
        {
            return Err(RendererError::InvalidDescriptor(format!(
                "render target {handle} is not a multisampled colour target"
            )));
        }
        self.state.resolve_colour = colour;
        Ok(())
    }

    pub fn set_stream_out_target(
        &mut self,
        _target: Option<ResourceHandle>,
    ) -> Result<(), RendererError> {
        Err(RendererError::Unsupported("stream-out targets"))
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Write `bytes` at `offset` into a buffer created with CPU write
    /// access. Draws recorded later in the same frame see the new data;
    /// within one frame the last write wins.
    pub fn update_buffer(
        &mut self,
        handle: ResourceHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), RendererError> {
        let frame_slot = self.context.write_slot();
        let buffer = self.resources.buffer_mut(handle)?;
        let size = buffer.size;
        let BufferStorage::Dynamic(dynamic) = &mut buffer.storage else {
            return Err(RendererError::NotCpuWritable(handle));
        };
        if !write_fits(offset, bytes.len() as u64, size) {
            return Err(RendererError::BufferOverflow {
                handle,
                offset,
                len: bytes.len() as u64,
                size,
            });
        }
        dynamic.write(frame_slot, offset, bytes)?;
        Ok(())
    }

    /// [`Renderer::update_buffer`] for plain-old-data values such as
    /// constant blocks or vertices.
    pub fn update_buffer_with<T: bytemuck::Pod>(
        &mut self,
        handle: ResourceHandle,
        offset: u64,
        data: &[T],
    ) -> Result<(), RendererError> {
        self.update_buffer(handle, offset, bytemuck::cast_slice(data))
    }

    /// Copy the contents of a buffer, texture or render target to the CPU
    /// and hand them to `callback`. Waits for the device; only valid
    /// between frames.
    ///
    /// Images are returned layer after layer, rows tightly packed. A
    /// multisampled target returns its last resolve.
    pub fn read_back_resource(
        &mut self,
        handle: ResourceHandle,
        callback: impl FnOnce(&[u8]),
    ) -> Result<(), RendererError> {
        if self.frame_state != FrameState::Idle {
            return Err(RendererError::InvalidFrameState {
                operation: "read back a resource",
                state: self.frame_state,
            });
        }

        enum Source {
            Buffer(vk::Buffer, u64),
            Image {
                image: Arc<DeviceLocalImage>,
                layer_bytes: u64,
                layout: vk::ImageLayout,
            },
        }
        let image_source = |image: &Arc<DeviceLocalImage>, format: TextureFormat, layout| {
            let extent = image.extent();
            Source::Image {
                image: Arc::clone(image),
                layer_bytes: u64::from(extent.width)
                    * u64::from(extent.height)
                    * u64::from(format.bytes_per_pixel()),
                layout,
            }
        };

        let source = match self.resources.get(handle)? {
            Resource::Buffer(buffer) => match &buffer.storage {
                BufferStorage::Dynamic(dynamic) => {
                    callback(dynamic.shadow());
                    return Ok(());
                }
                BufferStorage::Static(gpu) => Source::Buffer(gpu.raw_buffer(), buffer.size),
            },
            Resource::Texture(texture) => image_source(
                &texture.image,
                texture.format,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
            Resource::RenderTarget(target) => {
                if target.desc.format.has_stencil() {
                    return Err(RendererError::Unsupported(
                        "reading back combined depth-stencil targets",
                    ));
                }
                match &target.resolve {
                    Some(resolve) => {
                        image_source(&resolve.image, target.desc.format, resolve.layout)
                    }
                    None => image_source(&target.image, target.desc.format, target.layout),
                }
            }
            other => {
                return Err(RendererError::InvalidDescriptor(format!(
                    "a {} cannot be read back",
                    other.kind()
                )));
            }
        };

        let size = match &source {
            Source::Buffer(_, size) => *size,
            Source::Image {
                image, layer_bytes, ..
            } => layer_bytes * u64::from(image.desc().array_layers),
        };
        self.context.wait_idle()?;
        let device = Arc::clone(self.context.device());
        let staging = HostVisibleBuffer::new_readback(&device, size, Some("read-back"))?;
        self.context.uploader.submit(|cmd| {
            match &source {
                Source::Buffer(buffer, size) => {
                    let region = vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size: *size,
                    };
                    // SAFETY: both buffers are live, `size` bytes fit in
                    // each and the device is idle.
                    unsafe { cmd.copy_buffer(*buffer, staging.raw_buffer(), &[region]) };
                }
                Source::Image {
                    image,
                    layer_bytes,
                    layout,
                } => {
                    // SAFETY: the image is in its tracked layout, which is
                    // never UNDEFINED after creation, and staging holds
                    // every layer.
                    unsafe { image.record_readback(cmd, &staging, *layer_bytes, *layout) };
                }
            }
            let to_host = [vk::MemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
                .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                .dst_stage_mask(vk::PipelineStageFlags2::HOST)
                .dst_access_mask(vk::AccessFlags2::HOST_READ)];
            // SAFETY: recording outside a render pass.
            unsafe {
                cmd.pipeline_barrier2(&vk::DependencyInfo::default().memory_barriers(&to_host))
            };
            Ok(())
        })?;
        let bytes = staging.read_bytes()?;
        tracing::trace!("Read back {} bytes from {handle}", bytes.len());
        callback(&bytes);
        Ok(())
    }
}

impl<W: HasDisplayHandle + HasWindowHandle> Drop for Renderer<W> {
    fn drop(&mut self) {
        tracing::debug!("Dropping renderer with {} live resources", self.resources.len());
        if let Err(e) = self.context.wait_idle() {
            tracing::error!("Failed to wait for device idle before releasing resources: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_must_fit_the_buffer() {
        assert!(write_fits(0, 64, 64));
        assert!(write_fits(60, 4, 64));
        assert!(!write_fits(61, 4, 64));
        assert!(!write_fits(u64::MAX, 2, 64));
        assert!(write_fits(64, 0, 64));
    }

    #[test]
    fn only_window_sized_targets_go_stale() {
        let window = vk::Extent2D {
            width: 1024,
            height: 768,
        };
        let old = vk::Extent2D {
            width: 800,
            height: 600,
        };
        assert!(is_stale_window_target(
            RenderTargetSize::WindowRatio(1.0),
            old,
            window
        ));
        assert!(!is_stale_window_target(
            RenderTargetSize::WindowRatio(1.0),
            window,
            window
        ));
        assert!(!is_stale_window_target(
            RenderTargetSize::WindowRatio(0.5),
            vk::Extent2D {
                width: 512,
                height: 384
            },
            window
        ));
        assert!(!is_stale_window_target(
            RenderTargetSize::Fixed {
                width: 800,
                height: 600
            },
            old,
            window
        ));
    }
}
